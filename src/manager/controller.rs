//! Composition root.
//!
//! The controller owns the transport and every manager. All model state
//! lives in one actor task; the [`Controller`] handle talks to it over a
//! command channel. Remote work is spawned off the actor and its result is
//! folded back in through a loopback channel, so a slow bluetoothd never
//! stalls queries or signal processing.

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{
      broadcast::{self, error::RecvError},
      mpsc, oneshot,
   },
   time::{self, Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
   bluez::transport::{BusSignal, SharedTransport},
   config::ConfigStore,
   error::{BluelinkError, ErrorCategory, Result, classify},
   event::{BluetoothEvent, EventSender},
   manager::{
      RemoteOp,
      adapter::{Adapter, AdapterManager},
      agent::{AgentManager, AgentState},
      audio::{AudioManager, AudioProfile, parse_uuid},
      device::{Device, DeviceManager},
      transfer::{FileTransfer, TransferManager},
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
const MIN_RSSI_INTERVAL: Duration = Duration::from_secs(1);

// === Authorization ===

/// Privileged operations the policy is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
   SetPowered,
   SetDiscoverable,
   SetPairable,
   SetAlias,
   Pair,
   Unpair,
   SetTrusted,
   SetBlocked,
   SendFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
   Allow,
   Deny,
   Cancel,
}

/// Decides whether a privileged operation may proceed.
pub trait AuthorizationPolicy: Send + Sync {
   fn authorize<'a>(&'a self, action: Action, target: &'a str) -> BoxFuture<'a, Authorization>;
}

pub struct AllowAll;

impl AuthorizationPolicy for AllowAll {
   fn authorize<'a>(&'a self, _action: Action, _target: &'a str) -> BoxFuture<'a, Authorization> {
      async { Authorization::Allow }.boxed()
   }
}

/// Denies the actions listed under `denied_actions` in the config.
pub struct ConfigPolicy {
   store: Arc<ConfigStore>,
}

impl ConfigPolicy {
   pub const fn new(store: Arc<ConfigStore>) -> Self {
      Self { store }
   }
}

impl AuthorizationPolicy for ConfigPolicy {
   fn authorize<'a>(&'a self, action: Action, _target: &'a str) -> BoxFuture<'a, Authorization> {
      let denied = self.store.is_denied(action.as_ref());
      async move {
         if denied {
            Authorization::Deny
         } else {
            Authorization::Allow
         }
      }
      .boxed()
   }
}

/// Classifies `err` and publishes it unless it is routine.
fn publish_failure(events: &EventSender, store: &ConfigStore, err: &BluelinkError, context: ErrorCategory) {
   let domain = classify(err, context);
   debug!("{} failure ({}): {}", domain.category, domain.code, domain.message);
   if domain.should_notify() && store.notifications_enabled() {
      events.emit(BluetoothEvent::Error(domain));
   }
}

// === Commands ===

type Reply<T> = oneshot::Sender<Result<T>>;
type Loopback = Box<dyn FnOnce(&mut ControllerActor) + Send>;

#[derive(Debug)]
enum AdapterOp {
   Powered(bool),
   Discoverable(bool, Option<u32>),
   Pairable(bool, Option<u32>),
   Alias(SmolStr),
   StartDiscovery,
   StopDiscovery,
}

#[derive(Debug, Clone, Copy)]
enum DeviceOp {
   Pair,
   Unpair,
   Connect,
   Disconnect,
   Trusted(bool),
   Blocked(bool),
}

#[derive(Debug, Clone, Copy)]
enum ProfileOp {
   Connect,
   Disconnect,
   Activate,
}

#[derive(Debug, Clone, Copy)]
enum TransferOp {
   Cancel,
   Pause,
   Resume,
}

enum Command {
   // Queries
   Adapters(oneshot::Sender<Vec<Adapter>>),
   DefaultAdapter(oneshot::Sender<Option<Adapter>>),
   Devices(Option<SmolStr>, oneshot::Sender<Vec<Device>>),
   GetDevice(SmolStr, Reply<Device>),
   Profiles(SmolStr, Reply<(Vec<AudioProfile>, Option<Uuid>)>),
   Transfers(oneshot::Sender<Vec<FileTransfer>>),

   // Operations
   Adapter {
      adapter: Option<SmolStr>,
      op: AdapterOp,
      reply: Reply<()>,
   },
   SetDefaultAdapter(SmolStr, Reply<()>),
   Device {
      path: SmolStr,
      op: DeviceOp,
      reply: Reply<()>,
   },
   Profile {
      device: SmolStr,
      uuid: Uuid,
      op: ProfileOp,
      reply: Reply<()>,
   },
   SendFile {
      device: SmolStr,
      file: PathBuf,
      reply: Reply<FileTransfer>,
   },
   SendFiles {
      device: SmolStr,
      files: Vec<PathBuf>,
      reply: Reply<Vec<FileTransfer>>,
   },
   Transfer {
      path: SmolStr,
      op: TransferOp,
      reply: Reply<()>,
   },
}

// === Handle ===

/// Front door of the service.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct Controller {
   inbox: mpsc::Sender<Command>,
   agent: AgentManager,
   policy: Arc<dyn AuthorizationPolicy>,
   events: EventSender,
   store: Arc<ConfigStore>,
}

impl Controller {
   /// Starts the actor. It subscribes to bus signals before returning, so
   /// the transport may be connected right after.
   pub fn new(
      transport: SharedTransport,
      events: EventSender,
      store: Arc<ConfigStore>,
      agent: AgentManager,
      policy: Arc<dyn AuthorizationPolicy>,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ControllerActor::new(
         transport,
         events.clone(),
         store.clone(),
         agent.clone(),
         command_rx,
      );
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         agent,
         policy,
         events,
         store,
      }
   }

   pub const fn agent(&self) -> &AgentManager {
      &self.agent
   }

   async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| BluelinkError::ManagerShutdown)?;
      rx.await.map_err(|_| BluelinkError::ManagerShutdown)
   }

   async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
      self.query(make).await?
   }

   async fn authorize(&self, action: Action, target: &str) -> Result<()> {
      let err = match self.policy.authorize(action, target).await {
         Authorization::Allow => return Ok(()),
         Authorization::Deny => {
            info!("Policy denied {action} on {target}");
            BluelinkError::PermissionDenied(SmolStr::new(action.as_ref()))
         },
         Authorization::Cancel => BluelinkError::AuthorizationCancelled(SmolStr::new(action.as_ref())),
      };
      publish_failure(&self.events, &self.store, &err, ErrorCategory::Permission);
      Err(err)
   }

   // --- Queries ---

   pub async fn adapters(&self) -> Result<Vec<Adapter>> {
      self.query(Command::Adapters).await
   }

   pub async fn default_adapter(&self) -> Result<Option<Adapter>> {
      self.query(Command::DefaultAdapter).await
   }

   pub async fn devices(&self, adapter: Option<&str>) -> Result<Vec<Device>> {
      let adapter = adapter.map(SmolStr::new);
      self.query(|tx| Command::Devices(adapter, tx)).await
   }

   pub async fn device(&self, path: &str) -> Result<Device> {
      self.call(|tx| Command::GetDevice(SmolStr::new(path), tx)).await
   }

   pub async fn profiles(&self, device: &str) -> Result<(Vec<AudioProfile>, Option<Uuid>)> {
      self.call(|tx| Command::Profiles(SmolStr::new(device), tx)).await
   }

   pub async fn transfers(&self) -> Result<Vec<FileTransfer>> {
      self.query(Command::Transfers).await
   }

   // --- Adapters ---

   async fn adapter_op(&self, adapter: Option<&str>, op: AdapterOp) -> Result<()> {
      let adapter = adapter.map(SmolStr::new);
      self.call(|reply| Command::Adapter { adapter, op, reply }).await
   }

   pub async fn set_powered(&self, adapter: Option<&str>, powered: bool) -> Result<()> {
      self.authorize(Action::SetPowered, adapter.unwrap_or("default")).await?;
      self.adapter_op(adapter, AdapterOp::Powered(powered)).await
   }

   pub async fn set_discoverable(&self, adapter: Option<&str>, on: bool, timeout: Option<u32>) -> Result<()> {
      self.authorize(Action::SetDiscoverable, adapter.unwrap_or("default")).await?;
      self.adapter_op(adapter, AdapterOp::Discoverable(on, timeout)).await
   }

   pub async fn set_pairable(&self, adapter: Option<&str>, on: bool, timeout: Option<u32>) -> Result<()> {
      self.authorize(Action::SetPairable, adapter.unwrap_or("default")).await?;
      self.adapter_op(adapter, AdapterOp::Pairable(on, timeout)).await
   }

   pub async fn set_alias(&self, adapter: Option<&str>, alias: &str) -> Result<()> {
      self.authorize(Action::SetAlias, adapter.unwrap_or("default")).await?;
      self.adapter_op(adapter, AdapterOp::Alias(SmolStr::new(alias))).await
   }

   pub async fn start_discovery(&self, adapter: Option<&str>) -> Result<()> {
      self.adapter_op(adapter, AdapterOp::StartDiscovery).await
   }

   pub async fn stop_discovery(&self, adapter: Option<&str>) -> Result<()> {
      self.adapter_op(adapter, AdapterOp::StopDiscovery).await
   }

   pub async fn set_default_adapter(&self, adapter: &str) -> Result<()> {
      self.call(|tx| Command::SetDefaultAdapter(SmolStr::new(adapter), tx)).await
   }

   // --- Devices ---

   async fn device_op(&self, path: &str, op: DeviceOp) -> Result<()> {
      let path = SmolStr::new(path);
      self.call(|reply| Command::Device { path, op, reply }).await
   }

   pub async fn pair(&self, device: &str) -> Result<()> {
      self.authorize(Action::Pair, device).await?;
      self.device_op(device, DeviceOp::Pair).await
   }

   pub async fn unpair(&self, device: &str) -> Result<()> {
      self.authorize(Action::Unpair, device).await?;
      self.device_op(device, DeviceOp::Unpair).await
   }

   pub async fn connect(&self, device: &str) -> Result<()> {
      self.device_op(device, DeviceOp::Connect).await
   }

   pub async fn disconnect(&self, device: &str) -> Result<()> {
      self.device_op(device, DeviceOp::Disconnect).await
   }

   pub async fn set_trusted(&self, device: &str, trusted: bool) -> Result<()> {
      self.authorize(Action::SetTrusted, device).await?;
      self.device_op(device, DeviceOp::Trusted(trusted)).await
   }

   pub async fn set_blocked(&self, device: &str, blocked: bool) -> Result<()> {
      self.authorize(Action::SetBlocked, device).await?;
      self.device_op(device, DeviceOp::Blocked(blocked)).await
   }

   // --- Audio ---

   async fn profile_op(&self, device: &str, uuid: &str, op: ProfileOp) -> Result<()> {
      let uuid = parse_uuid(uuid)?;
      let device = SmolStr::new(device);
      self
         .call(|reply| Command::Profile {
            device,
            uuid,
            op,
            reply,
         })
         .await
   }

   pub async fn connect_profile(&self, device: &str, uuid: &str) -> Result<()> {
      self.profile_op(device, uuid, ProfileOp::Connect).await
   }

   pub async fn disconnect_profile(&self, device: &str, uuid: &str) -> Result<()> {
      self.profile_op(device, uuid, ProfileOp::Disconnect).await
   }

   pub async fn set_active_profile(&self, device: &str, uuid: &str) -> Result<()> {
      self.profile_op(device, uuid, ProfileOp::Activate).await
   }

   // --- Transfers ---

   pub async fn send_file(&self, device: &str, file: PathBuf) -> Result<FileTransfer> {
      self.authorize(Action::SendFile, device).await?;
      let device = SmolStr::new(device);
      self.call(|reply| Command::SendFile { device, file, reply }).await
   }

   pub async fn send_files(&self, device: &str, files: Vec<PathBuf>) -> Result<Vec<FileTransfer>> {
      self.authorize(Action::SendFile, device).await?;
      let device = SmolStr::new(device);
      self.call(|reply| Command::SendFiles { device, files, reply }).await
   }

   async fn transfer_op(&self, path: &str, op: TransferOp) -> Result<()> {
      let path = SmolStr::new(path);
      self.call(|reply| Command::Transfer { path, op, reply }).await
   }

   pub async fn cancel_transfer(&self, path: &str) -> Result<()> {
      self.transfer_op(path, TransferOp::Cancel).await
   }

   pub async fn pause_transfer(&self, path: &str) -> Result<()> {
      self.transfer_op(path, TransferOp::Pause).await
   }

   pub async fn resume_transfer(&self, path: &str) -> Result<()> {
      self.transfer_op(path, TransferOp::Resume).await
   }
}

// === Actor ===

struct ControllerActor {
   events: EventSender,
   store: Arc<ConfigStore>,
   command_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::Receiver<Loopback>,
   loopback_tx: mpsc::Sender<Loopback>,
   signals: broadcast::Receiver<BusSignal>,

   adapters: AdapterManager,
   devices: DeviceManager,
   audio: AudioManager,
   transfers: TransferManager,
   agent: AgentManager,

   refreshing: bool,
}

impl ControllerActor {
   fn new(
      transport: SharedTransport,
      events: EventSender,
      store: Arc<ConfigStore>,
      agent: AgentManager,
      command_rx: mpsc::Receiver<Command>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         signals: transport.subscribe(),
         adapters: AdapterManager::new(transport.clone(), events.clone(), store.clone()),
         devices: DeviceManager::new(transport.clone(), events.clone(), store.clone()),
         audio: AudioManager::new(transport.clone(), events.clone()),
         transfers: TransferManager::new(transport, events.clone()),
         agent,
         events,
         store,
         command_rx,
         loopback_rx,
         loopback_tx,
         refreshing: false,
      }
   }

   async fn run(mut self) {
      info!("Controller starting up");

      let period = self.store.snapshot().rssi_refresh_interval().max(MIN_RSSI_INTERVAL);
      let mut rssi_interval = time::interval_at(Instant::now() + period, period);
      rssi_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Controller shutting down");
                     break;
                 };
                 self.handle_command(cmd);
                 self.settle();
             }
             Some(done) = self.loopback_rx.recv() => {
                 done(&mut self);
                 self.settle();
             }
             signal = self.signals.recv() => {
                 match signal {
                     Ok(signal) => self.handle_signal(signal).await,
                     Err(RecvError::Lagged(missed)) => {
                         warn!("Missed {missed} bus signals, resynchronizing");
                         self.resync().await;
                     },
                     Err(RecvError::Closed) => {
                         info!("Bus signal stream closed");
                         break;
                     },
                 }
                 self.settle();
             }
             _ = rssi_interval.tick() => {
                 self.refresh_signal();
             }
         }
      }

      self.cleanup().await;
   }

   fn report(&self, err: BluelinkError, context: ErrorCategory) -> BluelinkError {
      publish_failure(&self.events, &self.store, &err, context);
      err
   }

   // --- Remote work ---

   /// Runs `op` off the actor and folds its result back in with `finish`.
   fn spawn_op<T, R, F>(&self, op: RemoteOp<T>, context: ErrorCategory, reply: Reply<R>, finish: F)
   where
      T: Send + 'static,
      R: Send + 'static,
      F: FnOnce(&mut Self, Result<T>) -> Result<R> + Send + 'static,
   {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let result = op.await;
         let done: Loopback = Box::new(move |actor| {
            let outcome = finish(actor, result).map_err(|e| actor.report(e, context));
            let _ = reply.send(outcome);
         });
         if loopback.send(done).await.is_err() {
            debug!("Controller stopped before an operation finished");
         }
      });
   }

   fn dispatch<T, R, F>(
      &self,
      begun: Result<Option<RemoteOp<T>>>,
      idle: R,
      context: ErrorCategory,
      reply: Reply<R>,
      finish: F,
   ) where
      T: Send + 'static,
      R: Send + 'static,
      F: FnOnce(&mut Self, Result<T>) -> Result<R> + Send + 'static,
   {
      match begun {
         Ok(Some(op)) => self.spawn_op(op, context, reply, finish),
         Ok(None) => {
            let _ = reply.send(Ok(idle));
         },
         Err(e) => {
            let _ = reply.send(Err(self.report(e, context)));
         },
      }
   }

   // --- Commands ---

   fn handle_command(&mut self, cmd: Command) {
      match cmd {
         Command::Adapters(tx) => {
            let _ = tx.send(self.adapters.adapters());
         },
         Command::DefaultAdapter(tx) => {
            let _ = tx.send(self.adapters.default_adapter().cloned());
         },
         Command::Devices(adapter, tx) => {
            let devices = match adapter {
               Some(adapter) => self.devices.devices_on(&adapter),
               None => self.devices.devices(),
            };
            let _ = tx.send(devices);
         },
         Command::GetDevice(path, tx) => {
            let _ = tx.send(self.devices.require(&path).cloned());
         },
         Command::Profiles(path, tx) => {
            let result = self
               .devices
               .require(&path)
               .map(|_| (self.audio.profiles(&path).to_vec(), self.audio.active_profile(&path)));
            let _ = tx.send(result);
         },
         Command::Transfers(tx) => {
            let _ = tx.send(self.transfers.transfers());
         },
         Command::Adapter { adapter, op, reply } => self.adapter_command(adapter, op, reply),
         Command::SetDefaultAdapter(path, reply) => {
            let result = self
               .adapters
               .set_default(&path)
               .map_err(|e| self.report(e, ErrorCategory::Adapter));
            let _ = reply.send(result);
         },
         Command::Device { path, op, reply } => self.device_command(path, op, reply),
         Command::Profile {
            device,
            uuid,
            op,
            reply,
         } => self.profile_command(device, uuid, op, reply),
         Command::SendFile { device, file, reply } => {
            let begun = self
               .devices
               .require(&device)
               .and_then(|_| self.transfers.begin_send(&device, &file));
            match begun {
               Ok(op) => self.spawn_op(op, ErrorCategory::Transfer, reply, |actor, r| {
                  actor.transfers.finish_send(r)
               }),
               Err(e) => {
                  let _ = reply.send(Err(self.report(e, ErrorCategory::Transfer)));
               },
            }
         },
         Command::SendFiles { device, files, reply } => {
            let begun = self
               .devices
               .require(&device)
               .map(|_| Some(self.transfers.begin_send_files(&device, &files)));
            self.dispatch(begun, Vec::new(), ErrorCategory::Transfer, reply, |actor, r| {
               actor.transfers.finish_send_files(r)
            });
         },
         Command::Transfer { path, op, reply } => self.transfer_command(path, op, reply),
      }
   }

   fn adapter_command(&mut self, adapter: Option<SmolStr>, op: AdapterOp, reply: Reply<()>) {
      let path = match self.adapters.resolve(adapter.as_deref()) {
         Ok(path) => path,
         Err(e) => {
            let _ = reply.send(Err(self.report(e, ErrorCategory::Adapter)));
            return;
         },
      };
      let begun = match op {
         AdapterOp::Powered(powered) => self.adapters.begin_set_powered(&path, powered),
         AdapterOp::Discoverable(on, timeout) => self.adapters.begin_set_discoverable(&path, on, timeout),
         AdapterOp::Pairable(on, timeout) => self.adapters.begin_set_pairable(&path, on, timeout),
         AdapterOp::Alias(alias) => self.adapters.begin_set_alias(&path, &alias),
         AdapterOp::StartDiscovery => self.adapters.begin_start_discovery(&path),
         AdapterOp::StopDiscovery => self.adapters.begin_stop_discovery(&path),
      };
      self.dispatch(begun, (), ErrorCategory::Adapter, reply, move |actor, r| {
         actor.adapters.finish_write(&path, r)
      });
   }

   fn device_command(&mut self, path: SmolStr, op: DeviceOp, reply: Reply<()>) {
      match op {
         DeviceOp::Pair => {
            let begun = self.devices.begin_pair(&path);
            self.dispatch(begun, (), ErrorCategory::Pairing, reply, move |actor, r| {
               if let Some(e) = actor.devices.finish_pair(&path, r)? {
                  actor.report(e, ErrorCategory::Pairing);
               }
               Ok(())
            });
         },
         DeviceOp::Unpair => {
            let begun = self.devices.begin_unpair(&path);
            self.dispatch(begun, (), ErrorCategory::Pairing, reply, move |actor, r| {
               actor.devices.finish_unpair(&path, r)
            });
         },
         DeviceOp::Connect => {
            let begun = self.devices.begin_connect(&path);
            self.dispatch(begun, (), ErrorCategory::Connection, reply, move |actor, r| {
               actor.devices.finish_connect(&path, r)
            });
         },
         DeviceOp::Disconnect => {
            let begun = self.devices.begin_disconnect(&path);
            self.dispatch(begun, (), ErrorCategory::Connection, reply, move |actor, r| {
               actor.devices.finish_disconnect(&path, r)
            });
         },
         DeviceOp::Trusted(on) | DeviceOp::Blocked(on) => {
            let begun = if matches!(op, DeviceOp::Trusted(_)) {
               self.devices.begin_set_trusted(&path, on)
            } else {
               self.devices.begin_set_blocked(&path, on)
            };
            self.dispatch(begun, (), ErrorCategory::Device, reply, move |actor, r| {
               actor.devices.finish_write(&path, r)
            });
         },
      }
   }

   fn profile_command(&mut self, device: SmolStr, uuid: Uuid, op: ProfileOp, reply: Reply<()>) {
      let begun = self.devices.require(&device).and_then(|d| match op {
         ProfileOp::Connect => self.audio.begin_connect_profile(d, uuid),
         ProfileOp::Disconnect => self.audio.begin_disconnect_profile(d, uuid),
         ProfileOp::Activate => self.audio.begin_set_active_profile(d, uuid),
      });
      self.dispatch(begun, (), ErrorCategory::Connection, reply, move |actor, r| match op {
         ProfileOp::Connect => actor.audio.finish_connect_profile(&device, uuid, r),
         ProfileOp::Disconnect => actor.audio.finish_disconnect_profile(&device, uuid, r),
         ProfileOp::Activate => actor.audio.finish_set_active_profile(&device, uuid, r),
      });
   }

   fn transfer_command(&mut self, path: SmolStr, op: TransferOp, reply: Reply<()>) {
      let begun = match op {
         TransferOp::Cancel => self.transfers.begin_cancel(&path),
         TransferOp::Pause => self.transfers.begin_pause(&path),
         TransferOp::Resume => self.transfers.begin_resume(&path),
      };
      self.dispatch(begun.map(Some), (), ErrorCategory::Transfer, reply, move |actor, r| match op {
         TransferOp::Cancel => actor.transfers.finish_cancel(&path, r),
         TransferOp::Pause => actor.transfers.finish_pause(&path, r),
         TransferOp::Resume => actor.transfers.finish_resume(&path, r),
      });
   }

   // --- Signals ---

   async fn handle_signal(&mut self, signal: BusSignal) {
      match signal {
         BusSignal::ServiceReady => self.resync().await,
         BusSignal::ServiceLost => {
            warn!("bluetoothd left the bus");
            self.adapters.clear();
            self.devices.clear();
            self.audio.clear();
            self.transfers.clear();
            self.agent.release();
            self.events.emit(BluetoothEvent::TransportDisconnected);
         },
         BusSignal::ReconnectExhausted { attempts } => {
            self.report(BluelinkError::ReconnectExhausted(attempts), ErrorCategory::Transport);
         },
         signal => {
            self.adapters.handle_signal(&signal);
            self.devices.handle_signal(&signal);
            self.audio.handle_signal(&signal);
            self.transfers.handle_signal(&signal);
         },
      }
   }

   /// Rebuilds the whole model from bluetoothd.
   async fn resync(&mut self) {
      info!("Synchronizing with bluetoothd");
      if let Err(e) = self.adapters.enumerate().await {
         self.report(e, ErrorCategory::Adapter);
      }
      if self.store.snapshot().power_on_startup {
         self.adapters.power_on_all().await;
      }
      if let Err(e) = self.devices.enumerate().await {
         self.report(e, ErrorCategory::Device);
      }
      // Profiles must exist before transports can be matched to them.
      self.settle();
      if let Err(e) = self.audio.enumerate_transports().await {
         self.report(e, ErrorCategory::Connection);
      }
      self.events.emit(BluetoothEvent::TransportConnected);

      if self.agent.state() != AgentState::Unregistered {
         debug!("Pairing agent already registered");
         return;
      }
      let agent = self.agent.clone();
      tokio::spawn(async move {
         if let Err(e) = agent.register().await {
            warn!("Pairing agent registration failed: {e}");
         }
      });
   }

   /// Fans device transitions out to the audio manager and removes
   /// finished OBEX sessions.
   fn settle(&mut self) {
      for change in self.devices.take_changes() {
         if change.removed {
            self.audio.on_device_removed(&change.path);
            continue;
         }
         let Some(device) = self.devices.device(&change.path) else {
            continue;
         };
         if change.added || change.uuids_changed {
            self.audio.detect(device);
         }
         match change.connected {
            Some(true) => {
               self.audio.on_device_connected(device);
            },
            Some(false) => self.audio.on_device_disconnected(&change.path),
            None if change.added && device.connected => {
               self.audio.on_device_connected(device);
            },
            None => {},
         }
      }

      if let Some(op) = self.transfers.begin_teardown() {
         tokio::spawn(async move {
            let _ = op.await;
         });
      }
   }

   fn refresh_signal(&mut self) {
      if self.refreshing {
         return;
      }
      let Some(op) = self.devices.begin_refresh_signal() else {
         return;
      };
      self.refreshing = true;
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let result = op.await;
         let done: Loopback = Box::new(move |actor| {
            actor.refreshing = false;
            actor.devices.finish_refresh_signal(result);
         });
         let _ = loopback.send(done).await;
      });
   }

   async fn cleanup(&mut self) {
      if let Err(e) = self.agent.unregister().await {
         debug!("Failed to unregister agent on shutdown: {e}");
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluez::{
         DEVICE_INTERFACE, MEDIA_TRANSPORT_INTERFACE,
         value::{PropValue, PropertyMap},
      },
      config::Config,
      manager::{agent::RESPONSE_TIMEOUT, audio::A2DP_SINK_UUID, device::ConnectionState},
      testing::*,
   };

   struct Fixed(Authorization);

   impl AuthorizationPolicy for Fixed {
      fn authorize<'a>(&'a self, _action: Action, _target: &'a str) -> BoxFuture<'a, Authorization> {
         let answer = self.0;
         async move { answer }.boxed()
      }
   }

   async fn eventually(mut check: impl AsyncFnMut() -> bool) {
      for _ in 0..200 {
         if check().await {
            return;
         }
         time::sleep(Duration::from_millis(5)).await;
      }
      panic!("condition never became true");
   }

   async fn start(
      connected: bool,
      config: Config,
      policy: impl Fn(Arc<ConfigStore>) -> Arc<dyn AuthorizationPolicy>,
   ) -> (Arc<MockTransport>, Arc<RecordingBus>, Controller) {
      let mock = with_adapter(true);
      add_device(
         &mock,
         HEADPHONES,
         device_props(HEADPHONES_ADDR, "Buds"),
         props([
            ("UUIDs", PropValue::str_list([A2DP_SINK, AVRCP])),
            ("Connected", connected.into()),
            ("Paired", true.into()),
         ]),
      );
      let bus = RecordingBus::new();
      let store = Arc::new(ConfigStore::in_memory(config));
      let agent = AgentManager::new(mock.clone(), bus.clone(), "KeyboardDisplay", RESPONSE_TIMEOUT);
      let controller = Controller::new(mock.clone(), bus.clone(), store.clone(), agent, policy(store));
      mock.emit(BusSignal::ServiceReady);
      eventually(async || controller.devices(None).await.is_ok_and(|d| d.len() == 1)).await;
      (mock, bus, controller)
   }

   fn allow(_: Arc<ConfigStore>) -> Arc<dyn AuthorizationPolicy> {
      Arc::new(AllowAll)
   }

   fn error_categories(bus: &RecordingBus) -> Vec<ErrorCategory> {
      bus.events()
         .into_iter()
         .filter_map(|e| match e {
            BluetoothEvent::Error(domain) => Some(domain.category),
            _ => None,
         })
         .collect()
   }

   #[tokio::test]
   async fn test_startup_sync() -> Result<()> {
      let (mock, bus, controller) = start(true, Config::default(), allow).await;

      assert_eq!(controller.adapters().await?.len(), 1);
      assert_eq!(
         controller.default_adapter().await?.map(|a| a.path),
         Some(SmolStr::new(HCI0))
      );
      let (profiles, active) = controller.profiles(HEADPHONES).await?;
      assert_eq!(profiles.len(), 2);
      assert_eq!(active, Some(A2DP_SINK_UUID));
      assert_eq!(bus.count("transport_connected"), 1);

      eventually(async || mock.call_count("RegisterAgent") == 1).await;
      Ok(())
   }

   #[tokio::test]
   async fn test_resync_keeps_live_agent_registration() -> Result<()> {
      let (mock, bus, controller) = start(true, Config::default(), allow).await;
      eventually(async || mock.call_count("RequestDefaultAgent") == 1).await;
      mock.fail_call("RegisterAgent", MockFailure::Remote("org.bluez.Error.AlreadyExists", "Already Exists"));

      mock.emit(BusSignal::ServiceReady);
      eventually(async || bus.count("transport_connected") == 2).await;
      controller.adapters().await?;
      time::sleep(Duration::from_millis(20)).await;

      assert_eq!(mock.call_count("RegisterAgent"), 1);
      assert_eq!(mock.call_count("UnregisterAgent"), 0);
      Ok(())
   }

   #[tokio::test]
   async fn test_resync_picks_up_existing_media_transport() -> Result<()> {
      let (mock, _bus, controller) = start(true, Config::default(), allow).await;
      assert_eq!(controller.profiles(HEADPHONES).await?.0[0].codec, None);

      mock.add_object(
         &format!("{HEADPHONES}/fd0"),
         MEDIA_TRANSPORT_INTERFACE,
         props([
            ("Device", PropValue::Path(HEADPHONES.into())),
            ("UUID", PropValue::str(A2DP_SINK)),
            ("Codec", PropValue::Byte(0x02)),
         ]),
      );
      mock.emit(BusSignal::ServiceReady);
      eventually(async || {
         controller
            .profiles(HEADPHONES)
            .await
            .is_ok_and(|(p, _)| p[0].codec.as_deref() == Some("AAC"))
      })
      .await;
      Ok(())
   }

   #[tokio::test]
   async fn test_connect_selects_primary_profile() -> Result<()> {
      let (mock, _bus, controller) = start(false, Config::default(), allow).await;
      assert_eq!(controller.profiles(HEADPHONES).await?.1, None);

      controller.connect(HEADPHONES).await?;
      assert_eq!(mock.call_count("Connect"), 1);
      assert_eq!(controller.device(HEADPHONES).await?.state, ConnectionState::Connected);
      assert_eq!(controller.profiles(HEADPHONES).await?.1, Some(A2DP_SINK_UUID));

      controller.disconnect(HEADPHONES).await?;
      let (profiles, active) = controller.profiles(HEADPHONES).await?;
      assert!(profiles.iter().all(|p| !p.connected));
      assert_eq!(active, None);
      Ok(())
   }

   #[tokio::test]
   async fn test_external_drop_deactivates_profiles() -> Result<()> {
      let (mock, _bus, controller) = start(true, Config::default(), allow).await;
      mock.emit(changed(HEADPHONES, DEVICE_INTERFACE, props([("Connected", false.into())])));

      eventually(async || {
         controller
            .device(HEADPHONES)
            .await
            .is_ok_and(|d| d.state == ConnectionState::Disconnected)
      })
      .await;
      let (profiles, active) = controller.profiles(HEADPHONES).await?;
      assert!(profiles.iter().all(|p| !p.connected));
      assert_eq!(active, None);
      Ok(())
   }

   #[tokio::test]
   async fn test_policy_denial_skips_remote_call() -> Result<()> {
      let config = Config {
         denied_actions: vec!["set_powered".into()],
         ..Config::default()
      };
      let (mock, bus, controller) =
         start(true, config, |store| Arc::new(ConfigPolicy::new(store))).await;

      let err = controller.set_powered(None, false).await.unwrap_err();
      assert!(matches!(err, BluelinkError::PermissionDenied(_)));
      assert_eq!(mock.write_count("Powered"), 0);
      assert_eq!(error_categories(&bus), vec![ErrorCategory::Permission]);

      controller.set_alias(None, "desk").await?;
      assert_eq!(mock.write_count("Alias"), 1);
      Ok(())
   }

   #[tokio::test]
   async fn test_policy_cancel_is_distinct() {
      let (mock, _bus, controller) =
         start(true, Config::default(), |_| Arc::new(Fixed(Authorization::Cancel))).await;
      let err = controller.unpair(HEADPHONES).await.unwrap_err();
      assert!(matches!(err, BluelinkError::AuthorizationCancelled(_)));
      assert_eq!(mock.call_count("RemoveDevice"), 0);
   }

   #[tokio::test]
   async fn test_unknown_device_is_not_published() {
      let (_mock, bus, controller) = start(true, Config::default(), allow).await;
      let err = controller.connect("/org/bluez/hci0/dev_00_00_00_00_00_00").await.unwrap_err();
      assert!(matches!(err, BluelinkError::DeviceNotFound(_)));
      assert!(error_categories(&bus).is_empty());
   }

   #[tokio::test]
   async fn test_remote_failure_is_classified_and_published() {
      let (mock, bus, controller) = start(false, Config::default(), allow).await;
      mock.fail_call(
         "Connect",
         MockFailure::Remote("org.bluez.Error.Failed", "br-connection-page-timeout"),
      );
      assert!(controller.connect(HEADPHONES).await.is_err());
      assert_eq!(error_categories(&bus), vec![ErrorCategory::Timeout]);
      assert_eq!(
         controller.device(HEADPHONES).await.map(|d| d.state).ok(),
         Some(ConnectionState::Disconnected)
      );
   }

   #[tokio::test]
   async fn test_trust_failure_after_pair_is_reported_separately() -> Result<()> {
      let (mock, bus, controller) = start(false, Config::default(), allow).await;
      add_device(&mock, PHONE, device_props(PHONE_ADDR, "Phone"), PropertyMap::new());
      mock.emit(BusSignal::ObjectAdded {
         path: PHONE.into(),
         interfaces: [(DEVICE_INTERFACE.to_owned(), device_props(PHONE_ADDR, "Phone"))].into(),
      });
      eventually(async || controller.device(PHONE).await.is_ok()).await;
      mock.fail_write("Trusted", MockFailure::Remote("org.bluez.Error.NotPermitted", "Not permitted"));

      controller.pair(PHONE).await?;
      let phone = controller.device(PHONE).await?;
      assert!(phone.paired);
      assert!(!phone.trusted);
      assert_eq!(bus.count("device_paired"), 1);
      assert_eq!(error_categories(&bus), vec![ErrorCategory::Permission]);
      Ok(())
   }

   #[tokio::test]
   async fn test_service_lost_and_exhaustion() {
      let (mock, bus, controller) = start(true, Config::default(), allow).await;
      mock.emit(BusSignal::ServiceLost);
      eventually(async || controller.adapters().await.is_ok_and(|a| a.is_empty())).await;
      assert!(controller.devices(None).await.is_ok_and(|d| d.is_empty()));
      assert_eq!(bus.count("transport_disconnected"), 1);

      mock.emit(BusSignal::ReconnectExhausted { attempts: 10 });
      eventually(async || !error_categories(&bus).is_empty()).await;
      assert_eq!(error_categories(&bus), vec![ErrorCategory::Transport]);
   }
}
