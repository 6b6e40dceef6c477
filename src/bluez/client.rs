//! zbus-backed [`Transport`] with daemon supervision.
//!
//! The client keeps one system-bus connection for bluetoothd and, when
//! available, one session-bus connection for obexd. It mirrors both
//! object trees, republishes their object and property signals on a
//! single broadcast channel, and re-initializes itself whenever
//! bluetoothd leaves and rejoins the bus.

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU32, Ordering},
   },
   time::Duration,
};

use futures::{
   FutureExt,
   future::BoxFuture,
   stream::StreamExt,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   sync::broadcast,
   task::{JoinHandle, JoinSet},
   time,
};
use zbus::{
   Connection, MatchRule, MessageStream, Proxy,
   message::{Message, Type as MessageType},
   proxy,
   zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   bluez::{
      BLUEZ_SERVICE, OBEX_SERVICE, PROPERTIES_INTERFACE, is_obex_interface,
      transport::{Args, BusSignal, MethodCall, Reply, Transport},
      value::{PropValue, PropertyMap, decode_properties},
   },
   error::{BluelinkError, Result},
};

/// Deadline for property reads and writes.
const PROPERTY_TIMEOUT: Duration = Duration::from_secs(10);
/// Capacity of the signal broadcast channel
const SIGNAL_BUFFER_SIZE: usize = 1024;
/// Messages queued per property-change stream before dropping
const STREAM_QUEUE_SIZE: usize = 256;

type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

#[proxy(interface = "org.freedesktop.DBus.ObjectManager", default_path = "/")]
trait RemoteObjectManager {
   fn get_managed_objects(&self) -> zbus::Result<ManagedObjects>;

   #[zbus(signal)]
   fn interfaces_added(
      &self,
      object_path: OwnedObjectPath,
      interfaces: HashMap<String, HashMap<String, OwnedValue>>,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   fn interfaces_removed(
      &self,
      object_path: OwnedObjectPath,
      interfaces: Vec<String>,
   ) -> zbus::Result<()>;
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
   pub base_delay: Duration,
   pub max_delay: Duration,
   pub max_attempts: u32,
   pub jitter: Duration,
}

impl Default for ReconnectPolicy {
   fn default() -> Self {
      Self {
         base_delay: Duration::from_secs(1),
         max_delay: Duration::from_secs(60),
         max_attempts: 10,
         jitter: Duration::from_millis(500),
      }
   }
}

impl ReconnectPolicy {
   /// Delay before the zero-based `attempt`: the base delay doubled per
   /// attempt, capped at `max_delay`, plus random jitter.
   pub fn delay(&self, attempt: u32) -> Duration {
      let exponential = self.base_delay.saturating_mul(1 << attempt.min(16));
      let delay = exponential.min(self.max_delay);
      let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
      if jitter_ms == 0 {
         return delay;
      }
      delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
   }
}

fn service_for(interface: &str) -> &'static str {
   if is_obex_interface(interface) {
      OBEX_SERVICE
   } else {
      BLUEZ_SERVICE
   }
}

/// Whether `path` is `root` or lies below it.
fn is_under(path: &str, root: &str) -> bool {
   path == root
      || path
         .strip_prefix(root)
         .is_some_and(|rest| rest.starts_with('/'))
}

fn decode_reply(message: &Message) -> Reply {
   let body = message.body();
   if let Ok(path) = body.deserialize::<OwnedObjectPath>() {
      return Reply::Path(SmolStr::new(path.as_str()));
   }
   if let Ok((path, _)) = body.deserialize::<(OwnedObjectPath, HashMap<String, OwnedValue>)>() {
      return Reply::Path(SmolStr::new(path.as_str()));
   }
   Reply::Empty
}

type Hook<C> = Arc<dyn Fn(C) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callbacks run against every freshly initialized connection.
struct ConnectionHooks<C> {
   hooks: Mutex<Vec<Hook<C>>>,
}

impl<C: Clone> ConnectionHooks<C> {
   fn new() -> Self {
      Self { hooks: Mutex::new(Vec::new()) }
   }

   fn add(&self, hook: Hook<C>) {
      self.hooks.lock().push(hook);
   }

   /// Failures are logged so one hook cannot block the rest.
   async fn run(&self, conn: &C) {
      let hooks = self.hooks.lock().clone();
      for hook in hooks {
         if let Err(e) = hook(conn.clone()).await {
            warn!("Connection hook failed: {e}");
         }
      }
   }
}

#[derive(Default)]
struct ClientState {
   system: Option<Connection>,
   session: Option<Connection>,
   /// object path -> interfaces, for both daemons
   objects: HashMap<SmolStr, HashSet<String>>,
   handles: HashMap<(SmolStr, &'static str), Proxy<'static>>,
   watchers: JoinSet<()>,
}

struct ClientInner {
   state: Mutex<ClientState>,
   signals: broadcast::Sender<BusSignal>,
   policy: ReconnectPolicy,
   attempts: AtomicU32,
   connected: AtomicBool,
   reconnect_timer: Mutex<Option<JoinHandle<()>>>,
   presence: Mutex<Option<JoinHandle<()>>>,
   on_system: ConnectionHooks<Connection>,
}

/// Connection to bluetoothd (and obexd) over D-Bus.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct BusClient {
   inner: Arc<ClientInner>,
}

impl BusClient {
   pub fn new(policy: ReconnectPolicy) -> Self {
      let (signals, _) = broadcast::channel(SIGNAL_BUFFER_SIZE);
      Self {
         inner: Arc::new(ClientInner {
            state: Mutex::new(ClientState::default()),
            signals,
            policy,
            attempts: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            reconnect_timer: Mutex::new(None),
            presence: Mutex::new(None),
            on_system: ConnectionHooks::new(),
         }),
      }
   }

   /// Connects to bluetoothd and builds the object view.
   ///
   /// On failure a reconnect is scheduled before the error is returned.
   pub async fn connect(&self) -> Result<()> {
      self.inner.cancel_reconnect();
      match self.inner.initialize().await {
         Ok(()) => Ok(()),
         Err(e) => {
            warn!("Failed to connect to bluetoothd: {e}");
            self.inner.schedule_reconnect();
            Err(e)
         },
      }
   }

   /// Runs `hook` on the system-bus connection each time the client
   /// initializes, before [`BusSignal::ServiceReady`] goes out. Objects we
   /// serve to bluetoothd are exported here.
   pub fn on_system_connection<F>(&self, hook: F)
   where
      F: Fn(Connection) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
   {
      self.inner.on_system.add(Arc::new(hook));
   }

   pub fn shutdown(&self) {
      self.inner.cancel_reconnect();
      if let Some(handle) = self.inner.presence.lock().take() {
         handle.abort();
      }
      let mut state = self.inner.state.lock();
      state.watchers.abort_all();
      state.handles.clear();
      self.inner.connected.store(false, Ordering::Release);
   }
}

impl ClientInner {
   fn publish(&self, signal: BusSignal) {
      // No receivers is fine; the controller subscribes before connecting.
      let _ = self.signals.send(signal);
   }

   fn reinitialize(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
      async move { self.initialize().await }.boxed()
   }

   async fn initialize(self: &Arc<Self>) -> Result<()> {
      let existing = self.state.lock().system.clone();
      let system = match existing {
         Some(conn) => conn,
         None => {
            let conn = Connection::system().await?;
            self.state.lock().system = Some(conn.clone());
            conn
         },
      };
      self.on_system.run(&system).await;
      self.ensure_presence_watch(&system).await?;

      self.reset_view();
      self.watch_objects(&system, BLUEZ_SERVICE).await?;
      self.watch_properties(&system, BLUEZ_SERVICE).await?;

      if let Err(e) = self.attach_obex().await {
         debug!("obexd not available, file transfer disabled: {e}");
      }

      self.connected.store(true, Ordering::Release);
      self.attempts.store(0, Ordering::Release);
      info!("Connected to bluetoothd");
      self.publish(BusSignal::ServiceReady);
      Ok(())
   }

   async fn attach_obex(self: &Arc<Self>) -> Result<()> {
      let existing = self.state.lock().session.clone();
      let session = match existing {
         Some(conn) => conn,
         None => {
            let conn = Connection::session().await?;
            self.state.lock().session = Some(conn.clone());
            conn
         },
      };
      self.watch_objects(&session, OBEX_SERVICE).await?;
      self.watch_properties(&session, OBEX_SERVICE).await
   }

   /// Drops everything derived from the previous daemon instance.
   fn reset_view(&self) {
      let mut state = self.state.lock();
      state.watchers.abort_all();
      state.objects.clear();
      state.handles.clear();
   }

   fn mark_lost(&self) {
      self.connected.store(false, Ordering::Release);
      self.reset_view();
      self.publish(BusSignal::ServiceLost);
   }

   async fn ensure_presence_watch(self: &Arc<Self>, conn: &Connection) -> Result<()> {
      if self.presence.lock().is_some() {
         return Ok(());
      }

      let dbus = zbus::fdo::DBusProxy::new(conn).await?;
      let mut changes = dbus
         .receive_name_owner_changed_with_args(&[(0, BLUEZ_SERVICE)])
         .await?;
      let weak = Arc::downgrade(self);

      let handle = tokio::spawn(async move {
         while let Some(change) = changes.next().await {
            let Some(this) = weak.upgrade() else {
               break;
            };
            let Ok(args) = change.args() else {
               continue;
            };
            if args.new_owner().is_some() {
               info!("bluetoothd appeared on the bus");
               this.cancel_reconnect();
               if let Err(e) = this.clone().reinitialize().await {
                  warn!("Failed to re-initialize after bluetoothd restart: {e}");
                  this.schedule_reconnect();
               }
            } else {
               warn!("bluetoothd left the bus");
               this.mark_lost();
               this.schedule_reconnect();
            }
         }
      });
      *self.presence.lock() = Some(handle);
      Ok(())
   }

   async fn watch_objects(self: &Arc<Self>, conn: &Connection, service: &'static str) -> Result<()> {
      let manager = RemoteObjectManagerProxy::builder(conn)
         .destination(service)?
         .build()
         .await?;
      let mut added = manager.receive_interfaces_added().await?;
      let mut removed = manager.receive_interfaces_removed().await?;
      let objects = manager.get_managed_objects().await?;

      let mut state = self.state.lock();
      for (path, interfaces) in &objects {
         state
            .objects
            .insert(SmolStr::new(path.as_str()), interfaces.keys().cloned().collect());
      }
      debug!("{service}: {} objects", objects.len());

      let weak = Arc::downgrade(self);
      state.watchers.spawn(async move {
         while let Some(signal) = added.next().await {
            let Some(this) = weak.upgrade() else {
               break;
            };
            if let Ok(args) = signal.args() {
               this.on_object_added(args.object_path().as_str(), args.interfaces());
            }
         }
      });

      let weak: Weak<Self> = Arc::downgrade(self);
      state.watchers.spawn(async move {
         while let Some(signal) = removed.next().await {
            let Some(this) = weak.upgrade() else {
               break;
            };
            if let Ok(args) = signal.args() {
               this.on_object_removed(args.object_path().as_str(), args.interfaces());
            }
         }
      });
      Ok(())
   }

   /// One subscription per daemon for every `PropertiesChanged` it emits.
   async fn watch_properties(self: &Arc<Self>, conn: &Connection, service: &'static str) -> Result<()> {
      let rule = MatchRule::builder()
         .msg_type(MessageType::Signal)
         .sender(service)?
         .interface(PROPERTIES_INTERFACE)?
         .member("PropertiesChanged")?
         .build();
      let mut stream = MessageStream::for_match_rule(rule, conn, Some(STREAM_QUEUE_SIZE)).await?;

      let weak = Arc::downgrade(self);
      self.state.lock().watchers.spawn(async move {
         while let Some(message) = stream.next().await {
            let Some(this) = weak.upgrade() else {
               break;
            };
            let Ok(message) = message else {
               continue;
            };
            let path = match message.header().path() {
               Some(path) => SmolStr::new(path.as_str()),
               None => continue,
            };
            let body = message.body();
            let Ok((interface, changed, invalidated)) =
               body.deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
            else {
               continue;
            };
            this.publish(BusSignal::PropertiesChanged {
               path,
               interface,
               changed: decode_properties(&changed),
               invalidated,
            });
         }
      });
      Ok(())
   }

   fn on_object_added(&self, path: &str, interfaces: &HashMap<String, HashMap<String, OwnedValue>>) {
      {
         let mut state = self.state.lock();
         state
            .objects
            .entry(SmolStr::new(path))
            .or_default()
            .extend(interfaces.keys().cloned());
      }
      self.publish(BusSignal::ObjectAdded {
         path: SmolStr::new(path),
         interfaces: interfaces
            .iter()
            .map(|(name, props)| (name.clone(), decode_properties(props)))
            .collect(),
      });
   }

   fn on_object_removed(&self, path: &str, interfaces: &[String]) {
      {
         let mut state = self.state.lock();
         if let Some(known) = state.objects.get_mut(path) {
            for interface in interfaces {
               known.remove(interface);
            }
            if known.is_empty() {
               state.objects.remove(path);
            }
         }
         let before = state.handles.len();
         state.handles.retain(|(handle_path, _), _| !is_under(handle_path, path));
         let dropped = before - state.handles.len();
         if dropped > 0 {
            debug!("Invalidated {dropped} cached handles under {path}");
         }
      }
      self.publish(BusSignal::ObjectRemoved {
         path: SmolStr::new(path),
         interfaces: interfaces.to_vec(),
      });
   }

   // === Reconnect supervision ===

   fn cancel_reconnect(&self) {
      if let Some(handle) = self.reconnect_timer.lock().take() {
         handle.abort();
      }
   }

   /// Arms the reconnect timer, replacing any armed one.
   fn schedule_reconnect(self: &Arc<Self>) {
      let mut timer = self.reconnect_timer.lock();
      if let Some(previous) = timer.take() {
         previous.abort();
      }
      let this = self.clone();
      *timer = Some(tokio::spawn(this.reconnect_loop()));
   }

   async fn reconnect_loop(self: Arc<Self>) {
      loop {
         let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
         if attempt > self.policy.max_attempts {
            error!(
               "Giving up on bluetoothd after {} reconnect attempts",
               self.policy.max_attempts
            );
            self.publish(BusSignal::ReconnectExhausted {
               attempts: self.policy.max_attempts,
            });
            self.reconnect_timer.lock().take();
            return;
         }

         let delay = self.policy.delay(attempt - 1);
         info!(
            "Reconnecting to bluetoothd in {delay:?} (attempt {attempt}/{})",
            self.policy.max_attempts
         );
         time::sleep(delay).await;

         match self.clone().reinitialize().await {
            Ok(()) => {
               self.reconnect_timer.lock().take();
               return;
            },
            Err(e) => warn!("Reconnect attempt {attempt} failed: {e}"),
         }
      }
   }

   // === Calls ===

   fn connection_for(&self, interface: &str) -> Result<Connection> {
      let state = self.state.lock();
      let conn = if is_obex_interface(interface) {
         state.session.clone()
      } else if self.connected.load(Ordering::Acquire) {
         state.system.clone()
      } else {
         None
      };
      conn.ok_or(BluelinkError::NotConnected)
   }

   async fn handle(&self, path: &str, interface: &'static str) -> Result<Proxy<'static>> {
      let key = (SmolStr::new(path), interface);
      let cached = self.state.lock().handles.get(&key).cloned();
      if let Some(proxy) = cached {
         return Ok(proxy);
      }
      let conn = self.connection_for(interface)?;
      let proxy = Proxy::new(&conn, service_for(interface), path.to_owned(), interface).await?;
      self.state.lock().handles.insert(key, proxy.clone());
      Ok(proxy)
   }

   async fn invoke(&self, call: MethodCall) -> Result<Reply> {
      let proxy = self.handle(&call.path, call.interface).await?;
      let request = async {
         let message = match &call.args {
            Args::None => proxy.call_method(call.method, &()).await?,
            Args::Str(s) => proxy.call_method(call.method, &(s.as_str(),)).await?,
            Args::Path(p) => {
               let path = ObjectPath::try_from(p.as_str())?;
               proxy.call_method(call.method, &(path,)).await?
            },
            Args::PathStr(p, s) => {
               let path = ObjectPath::try_from(p.as_str())?;
               proxy.call_method(call.method, &(path, s.as_str())).await?
            },
            Args::Session {
               destination,
               target,
            } => {
               let mut options: HashMap<&str, Value<'_>> = HashMap::new();
               options.insert("Target", Value::from(target.as_str()));
               proxy
                  .call_method(call.method, &(destination.as_str(), options))
                  .await?
            },
         };
         Ok::<_, zbus::Error>(message)
      };

      let message = time::timeout(call.timeout, request)
         .await
         .map_err(|_| BluelinkError::Timeout {
            operation: SmolStr::new(format!("{}.{}", call.interface, call.method)),
            after: call.timeout,
         })??;
      Ok(decode_reply(&message))
   }

   async fn properties_call<B>(&self, path: &str, interface: &str, method: &str, body: &B) -> Result<Message>
   where
      B: serde::Serialize + zbus::zvariant::DynamicType + Sync,
   {
      let conn = self.connection_for(interface)?;
      let call = conn.call_method(
         Some(service_for(interface)),
         path,
         Some(PROPERTIES_INTERFACE),
         method,
         body,
      );
      let message = time::timeout(PROPERTY_TIMEOUT, call)
         .await
         .map_err(|_| BluelinkError::Timeout {
            operation: SmolStr::new(format!("{method} {interface} on {path}")),
            after: PROPERTY_TIMEOUT,
         })??;
      Ok(message)
   }

   async fn get_property(&self, path: &str, interface: &str, name: &str) -> Result<PropValue> {
      let message = self
         .properties_call(path, interface, "Get", &(interface, name))
         .await?;
      let value = message.body().deserialize::<OwnedValue>()?;
      Ok(PropValue::from_variant(&value))
   }

   async fn set_property(&self, path: &str, interface: &str, name: &str, value: PropValue) -> Result<()> {
      self
         .properties_call(path, interface, "Set", &(interface, name, value.to_variant()))
         .await?;
      Ok(())
   }

   async fn get_all_properties(&self, path: &str, interface: &str) -> Result<PropertyMap> {
      let message = self
         .properties_call(path, interface, "GetAll", &(interface,))
         .await?;
      let props = message
         .body()
         .deserialize::<HashMap<String, OwnedValue>>()?;
      Ok(decode_properties(&props))
   }

   fn objects_with_interface(&self, interface: &str) -> Vec<SmolStr> {
      let state = self.state.lock();
      let mut paths: Vec<SmolStr> = state
         .objects
         .iter()
         .filter(|(_, interfaces)| interfaces.contains(interface))
         .map(|(path, _)| path.clone())
         .collect();
      paths.sort();
      paths
   }
}

impl Transport for BusClient {
   fn invoke(&self, call: MethodCall) -> BoxFuture<'_, Result<Reply>> {
      debug!("Calling {call}");
      self.inner.invoke(call).boxed()
   }

   fn get_property<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
      name: &'a str,
   ) -> BoxFuture<'a, Result<PropValue>> {
      self.inner.get_property(path, interface, name).boxed()
   }

   fn set_property<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
      name: &'a str,
      value: PropValue,
   ) -> BoxFuture<'a, Result<()>> {
      self.inner.set_property(path, interface, name, value).boxed()
   }

   fn get_all_properties<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
   ) -> BoxFuture<'a, Result<PropertyMap>> {
      self.inner.get_all_properties(path, interface).boxed()
   }

   fn objects_with_interface<'a>(&'a self, interface: &'a str) -> BoxFuture<'a, Result<Vec<SmolStr>>> {
      let paths = self.inner.objects_with_interface(interface);
      async move { Ok(paths) }.boxed()
   }

   fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
      self.inner.signals.subscribe()
   }

   fn is_connected(&self) -> bool {
      self.inner.connected.load(Ordering::Acquire)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_backoff_doubles_and_caps() {
      let policy = ReconnectPolicy {
         base_delay: Duration::from_secs(1),
         max_delay: Duration::from_secs(10),
         max_attempts: 5,
         jitter: Duration::ZERO,
      };
      let delays: Vec<_> = (0..6).map(|n| policy.delay(n).as_secs()).collect();
      assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
   }

   #[test]
   fn test_backoff_jitter_bounded() {
      let policy = ReconnectPolicy {
         jitter: Duration::from_millis(100),
         ..ReconnectPolicy::default()
      };
      for _ in 0..20 {
         let delay = policy.delay(0);
         assert!(delay >= policy.base_delay);
         assert!(delay < policy.base_delay + Duration::from_millis(100));
      }
   }

   #[tokio::test]
   async fn test_connection_hooks_run_on_every_initialization() {
      let hooks = ConnectionHooks::<u32>::new();
      let seen = Arc::new(Mutex::new(Vec::new()));
      hooks.add(Arc::new(|_: u32| async { Err::<(), _>(BluelinkError::NotConnected) }.boxed()));
      let log = seen.clone();
      hooks.add(Arc::new(move |generation: u32| {
         log.lock().push(generation);
         async { Ok::<(), BluelinkError>(()) }.boxed()
      }));

      hooks.run(&1).await;
      hooks.run(&2).await;
      assert_eq!(*seen.lock(), vec![1, 2]);
   }

   #[test]
   fn test_service_routing() {
      assert_eq!(service_for("org.bluez.obex.Transfer1"), OBEX_SERVICE);
      assert_eq!(service_for("org.bluez.Device1"), BLUEZ_SERVICE);
   }

   #[test]
   fn test_handle_invalidation_scope() {
      assert!(is_under("/org/bluez/hci0/dev_AA", "/org/bluez/hci0"));
      assert!(is_under("/org/bluez/hci0", "/org/bluez/hci0"));
      assert!(!is_under("/org/bluez/hci01", "/org/bluez/hci0"));
      assert!(!is_under("/org/bluez", "/org/bluez/hci0"));
   }

   #[tokio::test]
   async fn test_calls_fail_fast_when_disconnected() {
      let client = BusClient::new(ReconnectPolicy::default());
      assert!(!client.is_connected());
      let err = client
         .get_property("/org/bluez/hci0", "org.bluez.Adapter1", "Powered")
         .await
         .unwrap_err();
      assert!(matches!(err, BluelinkError::NotConnected));
      let paths = client.objects_with_interface("org.bluez.Adapter1").await.unwrap();
      assert!(paths.is_empty());
   }
}
