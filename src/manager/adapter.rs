//! Local adapters: enumeration, default selection and power/visibility state.

use std::{
   collections::{BTreeMap, BTreeSet},
   sync::Arc,
};

use futures::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   bluez::{
      ADAPTER_INTERFACE,
      transport::{Args, BusSignal, MethodCall, SharedTransport},
      value::{PropValue, PropertyMap, PropertyMapExt},
   },
   config::ConfigStore,
   error::{BluelinkError, Result},
   event::{BluetoothEvent, EventSender},
   manager::{RemoteOp, complete},
};

/// Longest alias bluetoothd accepts, in bytes.
pub const MAX_ALIAS_LEN: usize = 248;
/// Upper bound for discoverable/pairable timeouts, in seconds. Zero disables
/// the timeout.
pub const MAX_VISIBILITY_TIMEOUT: u32 = 3600;

const STATE_PROPERTIES: &[&str] = &["Powered", "Discoverable", "Discovering"];

/// A local Bluetooth controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adapter {
   pub path: SmolStr,
   pub address: SmolStr,
   pub alias: SmolStr,
   pub name: SmolStr,
   pub powered: bool,
   pub discoverable: bool,
   pub pairable: bool,
   pub discovering: bool,
   pub discoverable_timeout: u32,
   pub pairable_timeout: u32,
   pub uuids: BTreeSet<SmolStr>,
   pub is_default: bool,
}

/// Which kind of properties an update touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdapterDelta {
   /// Powered, discoverable or discovering.
   pub state: bool,
   pub incidental: bool,
}

fn timeout_prop(props: &PropertyMap, key: &str) -> Option<u32> {
   props.u64_prop(key).and_then(|v| u32::try_from(v).ok())
}

impl Adapter {
   pub fn from_properties(path: &str, props: &PropertyMap) -> Self {
      let mut adapter = Self {
         path: SmolStr::new(path),
         address: SmolStr::default(),
         alias: SmolStr::default(),
         name: SmolStr::default(),
         powered: false,
         discoverable: false,
         pairable: false,
         discovering: false,
         discoverable_timeout: 0,
         pairable_timeout: 0,
         uuids: BTreeSet::new(),
         is_default: false,
      };
      adapter.apply(props);
      adapter
   }

   /// Folds changed properties into the model. Values equal to the current
   /// ones are not reported.
   pub fn apply(&mut self, changed: &PropertyMap) -> AdapterDelta {
      let mut delta = AdapterDelta::default();

      macro_rules! update {
         ($field:expr, $value:expr, $key:expr) => {
            if let Some(value) = $value
               && $field != value
            {
               $field = value;
               if STATE_PROPERTIES.contains(&$key) {
                  delta.state = true;
               } else {
                  delta.incidental = true;
               }
            }
         };
      }

      update!(self.address, changed.str_prop("Address").map(SmolStr::new), "Address");
      update!(self.alias, changed.str_prop("Alias").map(SmolStr::new), "Alias");
      update!(self.name, changed.str_prop("Name").map(SmolStr::new), "Name");
      update!(self.powered, changed.bool_prop("Powered"), "Powered");
      update!(self.discoverable, changed.bool_prop("Discoverable"), "Discoverable");
      update!(self.pairable, changed.bool_prop("Pairable"), "Pairable");
      update!(self.discovering, changed.bool_prop("Discovering"), "Discovering");
      update!(
         self.discoverable_timeout,
         timeout_prop(changed, "DiscoverableTimeout"),
         "DiscoverableTimeout"
      );
      update!(self.pairable_timeout, timeout_prop(changed, "PairableTimeout"), "PairableTimeout");
      update!(
         self.uuids,
         changed
            .list_prop("UUIDs")
            .map(|l| l.iter().cloned().collect::<BTreeSet<_>>()),
         "UUIDs"
      );

      // A powered-off adapter cannot be discovering, whatever order the
      // notifications arrive in.
      if !self.powered && self.discovering {
         self.discovering = false;
         delta.state = true;
      }
      delta
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

/// Builds `Adapter1.RemoveDevice` for `device` on its owning adapter.
pub fn remove_device_call(adapter: &str, device: &str) -> MethodCall {
   MethodCall::new(adapter, ADAPTER_INTERFACE, "RemoveDevice").args(Args::Path(device.into()))
}

fn validate_timeout(timeout: Option<u32>) -> Result<()> {
   match timeout {
      Some(t) if t > MAX_VISIBILITY_TIMEOUT => Err(BluelinkError::InvalidArgument(format!(
         "timeout {t}s is outside 0..={MAX_VISIBILITY_TIMEOUT}s"
      ))),
      _ => Ok(()),
   }
}

fn validate_alias(alias: &str) -> Result<()> {
   if alias.is_empty() || alias.len() > MAX_ALIAS_LEN {
      return Err(BluelinkError::InvalidArgument(format!(
         "alias must be 1..={MAX_ALIAS_LEN} bytes, got {}",
         alias.len()
      )));
   }
   Ok(())
}

/// Owns the adapter set and the default-adapter choice.
pub struct AdapterManager {
   transport: SharedTransport,
   events: EventSender,
   store: Arc<ConfigStore>,
   adapters: BTreeMap<SmolStr, Adapter>,
   default: Option<SmolStr>,
}

impl AdapterManager {
   pub fn new(transport: SharedTransport, events: EventSender, store: Arc<ConfigStore>) -> Self {
      Self {
         transport,
         events,
         store,
         adapters: BTreeMap::new(),
         default: None,
      }
   }

   pub fn adapters(&self) -> Vec<Adapter> {
      self.adapters.values().cloned().collect()
   }

   pub fn adapter(&self, path: &str) -> Option<&Adapter> {
      self.adapters.get(path)
   }

   pub fn default_adapter(&self) -> Option<&Adapter> {
      self.default.as_ref().and_then(|p| self.adapters.get(p))
   }

   pub fn require(&self, path: &str) -> Result<&Adapter> {
      self
         .adapters
         .get(path)
         .ok_or_else(|| BluelinkError::AdapterNotFound(SmolStr::new(path)))
   }

   /// Resolves an optional adapter argument, falling back to the default.
   pub fn resolve(&self, path: Option<&str>) -> Result<SmolStr> {
      match path {
         Some(path) => Ok(self.require(path)?.path.clone()),
         None => self.default.clone().ok_or(BluelinkError::NoAdapter),
      }
   }

   // === Enumeration ===

   /// Reads every adapter bluetoothd exports and reconciles the model.
   pub async fn enumerate(&mut self) -> Result<()> {
      let paths = self.transport.objects_with_interface(ADAPTER_INTERFACE).await?;

      let stale: Vec<SmolStr> = self
         .adapters
         .keys()
         .filter(|p| !paths.contains(p))
         .cloned()
         .collect();
      for path in stale {
         self.remove(&path);
      }

      for path in paths {
         match self.transport.get_all_properties(&path, ADAPTER_INTERFACE).await {
            Ok(props) => self.upsert(&path, &props),
            Err(e) => warn!("Failed to read adapter {path}: {e}"),
         }
      }

      self.ensure_default();
      info!("Enumerated {} adapter(s)", self.adapters.len());
      Ok(())
   }

   /// Powers on every adapter that is currently off. Failures are logged.
   pub async fn power_on_all(&mut self) {
      let unpowered: Vec<SmolStr> = self
         .adapters
         .values()
         .filter(|a| !a.powered)
         .map(|a| a.path.clone())
         .collect();
      for path in unpowered {
         match self.set_powered(&path, true).await {
            Ok(()) => info!("Powered on adapter {path}"),
            Err(e) => warn!("Failed to power on adapter {path}: {e}"),
         }
      }
   }

   fn upsert(&mut self, path: &str, props: &PropertyMap) {
      if let Some(adapter) = self.adapters.get_mut(path) {
         let delta = adapter.apply(props);
         let snapshot = adapter.clone();
         self.publish_delta(snapshot, delta);
         return;
      }

      let adapter = Adapter::from_properties(path, props);
      debug!("Adapter added: {path} ({})", adapter.address);
      self.adapters.insert(adapter.path.clone(), adapter.clone());
      self.events.emit(BluetoothEvent::AdapterAdded(adapter));
   }

   fn remove(&mut self, path: &str) {
      if self.adapters.remove(path).is_none() {
         return;
      }
      info!("Adapter removed: {path}");
      self.events.emit(BluetoothEvent::AdapterRemoved(SmolStr::new(path)));
      if self.default.as_deref() == Some(path) {
         self.default = None;
         self.ensure_default();
      }
   }

   /// Picks a default when there is none: the preferred adapter if present,
   /// otherwise the first one.
   fn ensure_default(&mut self) {
      if self.default.as_ref().is_some_and(|p| self.adapters.contains_key(p)) {
         return;
      }
      let preferred = self
         .store
         .preferred_adapter()
         .map(SmolStr::from)
         .filter(|p| self.adapters.contains_key(p));
      let next = preferred.or_else(|| self.adapters.keys().next().cloned());
      self.assign_default(next);
   }

   fn assign_default(&mut self, next: Option<SmolStr>) {
      if self.default == next {
         return;
      }
      for adapter in self.adapters.values_mut() {
         adapter.is_default = Some(&adapter.path) == next.as_ref();
      }
      self.default.clone_from(&next);
      info!("Default adapter: {}", next.as_deref().unwrap_or("none"));
      self.events.emit(BluetoothEvent::DefaultAdapterChanged(next));
   }

   /// Makes `path` the default adapter and remembers it as preferred.
   pub fn set_default(&mut self, path: &str) -> Result<()> {
      let path = self.require(path)?.path.clone();
      self.assign_default(Some(path.clone()));
      let result = self.store.set_preferred_adapter(Some(&path));
      self.store.persist_or_warn("preferred adapter", result);
      Ok(())
   }

   fn publish_delta(&self, adapter: Adapter, delta: AdapterDelta) {
      if delta.state {
         self.events.emit(BluetoothEvent::AdapterStateChanged(adapter));
      } else if delta.incidental {
         self.events.emit(BluetoothEvent::AdapterChanged(adapter));
      }
   }

   // === Signals ===

   pub fn handle_signal(&mut self, signal: &BusSignal) {
      match signal {
         BusSignal::ObjectAdded { path, interfaces } => {
            if let Some(props) = interfaces.get(ADAPTER_INTERFACE) {
               self.upsert(path, props);
               self.ensure_default();
            }
         },
         BusSignal::ObjectRemoved { path, interfaces } => {
            if interfaces.iter().any(|i| i == ADAPTER_INTERFACE) {
               self.remove(path);
            }
         },
         BusSignal::PropertiesChanged {
            path,
            interface,
            changed,
            ..
         } if interface == ADAPTER_INTERFACE => {
            if let Some(adapter) = self.adapters.get_mut(path.as_str()) {
               let delta = adapter.apply(changed);
               let snapshot = adapter.clone();
               self.publish_delta(snapshot, delta);
            }
         },
         BusSignal::ServiceLost => self.clear(),
         _ => {},
      }
   }

   /// Drops every adapter, e.g. when bluetoothd goes away.
   pub fn clear(&mut self) {
      let paths: Vec<SmolStr> = self.adapters.keys().cloned().collect();
      self.adapters.clear();
      for path in paths {
         self.events.emit(BluetoothEvent::AdapterRemoved(path));
      }
      self.assign_default(None);
   }

   // === Operations ===

   fn write_op(&self, path: &str, writes: Vec<(&'static str, PropValue)>) -> RemoteOp<PropertyMap> {
      let transport = self.transport.clone();
      let path = SmolStr::new(path);
      async move {
         let mut applied = PropertyMap::new();
         for (name, value) in writes {
            transport
               .set_property(&path, ADAPTER_INTERFACE, name, value.clone())
               .await?;
            applied.insert(name.to_owned(), value);
         }
         Ok(applied)
      }
      .boxed()
   }

   /// Folds the properties a successful remote op wrote into the model.
   pub fn finish_write(&mut self, path: &str, result: Result<PropertyMap>) -> Result<()> {
      let applied = result?;
      if let Some(adapter) = self.adapters.get_mut(path) {
         let delta = adapter.apply(&applied);
         let snapshot = adapter.clone();
         self.publish_delta(snapshot, delta);
      }
      Ok(())
   }

   pub fn begin_set_powered(&self, path: &str, powered: bool) -> Result<Option<RemoteOp<PropertyMap>>> {
      let adapter = self.require(path)?;
      if adapter.powered == powered {
         return Ok(None);
      }
      Ok(Some(self.write_op(path, vec![("Powered", powered.into())])))
   }

   pub fn begin_set_discoverable(
      &self,
      path: &str,
      discoverable: bool,
      timeout: Option<u32>,
   ) -> Result<Option<RemoteOp<PropertyMap>>> {
      validate_timeout(timeout)?;
      let adapter = self.require(path)?;

      let mut writes: Vec<(&'static str, PropValue)> = Vec::new();
      if let Some(t) = timeout
         && t != adapter.discoverable_timeout
      {
         writes.push(("DiscoverableTimeout", t.into()));
      }
      if adapter.discoverable != discoverable {
         writes.push(("Discoverable", discoverable.into()));
      }
      Ok((!writes.is_empty()).then(|| self.write_op(path, writes)))
   }

   pub fn begin_set_pairable(
      &self,
      path: &str,
      pairable: bool,
      timeout: Option<u32>,
   ) -> Result<Option<RemoteOp<PropertyMap>>> {
      validate_timeout(timeout)?;
      let adapter = self.require(path)?;

      let mut writes: Vec<(&'static str, PropValue)> = Vec::new();
      if let Some(t) = timeout
         && t != adapter.pairable_timeout
      {
         writes.push(("PairableTimeout", t.into()));
      }
      if adapter.pairable != pairable {
         writes.push(("Pairable", pairable.into()));
      }
      Ok((!writes.is_empty()).then(|| self.write_op(path, writes)))
   }

   pub fn begin_set_alias(&self, path: &str, alias: &str) -> Result<Option<RemoteOp<PropertyMap>>> {
      validate_alias(alias)?;
      let adapter = self.require(path)?;
      if adapter.alias == alias {
         return Ok(None);
      }
      Ok(Some(self.write_op(path, vec![("Alias", alias.into())])))
   }

   pub fn begin_start_discovery(&self, path: &str) -> Result<Option<RemoteOp<PropertyMap>>> {
      let adapter = self.require(path)?;
      if !adapter.powered {
         return Err(BluelinkError::Precondition(format!(
            "adapter {path} is not powered"
         )));
      }
      if adapter.discovering {
         return Ok(None);
      }
      let transport = self.transport.clone();
      let call = MethodCall::new(path, ADAPTER_INTERFACE, "StartDiscovery");
      Ok(Some(
         async move {
            match transport.invoke(call).await {
               Ok(_) => {},
               Err(e) if e.remote_name() == Some("org.bluez.Error.InProgress") => {
                  debug!("Discovery already in progress");
               },
               Err(e) => return Err(e),
            }
            let mut applied = PropertyMap::new();
            applied.insert("Discovering".into(), true.into());
            Ok(applied)
         }
         .boxed(),
      ))
   }

   pub fn begin_stop_discovery(&self, path: &str) -> Result<Option<RemoteOp<PropertyMap>>> {
      let adapter = self.require(path)?;
      if !adapter.discovering {
         return Ok(None);
      }
      let transport = self.transport.clone();
      let call = MethodCall::new(path, ADAPTER_INTERFACE, "StopDiscovery");
      Ok(Some(
         async move {
            match transport.invoke(call).await {
               Ok(_) => {},
               Err(e)
                  if matches!(
                     e.remote_name(),
                     Some("org.bluez.Error.NotReady" | "org.bluez.Error.Failed")
                  ) =>
               {
                  debug!("Discovery was not running: {e}");
               },
               Err(e) => return Err(e),
            }
            let mut applied = PropertyMap::new();
            applied.insert("Discovering".into(), false.into());
            Ok(applied)
         }
         .boxed(),
      ))
   }

   // === In-place variants ===

   pub async fn set_powered(&mut self, path: &str, powered: bool) -> Result<()> {
      let op = self.begin_set_powered(path, powered)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }

   pub async fn set_discoverable(&mut self, path: &str, on: bool, timeout: Option<u32>) -> Result<()> {
      let op = self.begin_set_discoverable(path, on, timeout)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }

   pub async fn set_pairable(&mut self, path: &str, on: bool, timeout: Option<u32>) -> Result<()> {
      let op = self.begin_set_pairable(path, on, timeout)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }

   pub async fn set_alias(&mut self, path: &str, alias: &str) -> Result<()> {
      let op = self.begin_set_alias(path, alias)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }

   pub async fn start_discovery(&mut self, path: &str) -> Result<()> {
      let op = self.begin_start_discovery(path)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }

   pub async fn stop_discovery(&mut self, path: &str) -> Result<()> {
      let op = self.begin_stop_discovery(path)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      config::Config,
      error::{ErrorCategory, classify},
      testing::*,
   };

   fn manager(mock: &Arc<MockTransport>, bus: &Arc<RecordingBus>) -> AdapterManager {
      AdapterManager::new(
         mock.clone(),
         bus.clone(),
         Arc::new(ConfigStore::in_memory(Config::default())),
      )
   }

   #[tokio::test]
   async fn test_first_enumeration_picks_first_adapter() -> Result<()> {
      let mock = with_adapter(true);
      mock.add_object(HCI1, ADAPTER_INTERFACE, adapter_props("AA:AA:AA:AA:AA:02", true));
      let bus = RecordingBus::new();
      let mut adapters = manager(&mock, &bus);

      adapters.enumerate().await?;
      assert_eq!(adapters.adapters().len(), 2);
      assert_eq!(adapters.default_adapter().map(|a| a.path.as_str()), Some(HCI0));
      assert_eq!(adapters.adapters().iter().filter(|a| a.is_default).count(), 1);
      assert_eq!(bus.count("default_adapter_changed"), 1);
      Ok(())
   }

   #[tokio::test]
   async fn test_preferred_adapter_wins() -> Result<()> {
      let mock = with_adapter(true);
      mock.add_object(HCI1, ADAPTER_INTERFACE, adapter_props("AA:AA:AA:AA:AA:02", true));
      let bus = RecordingBus::new();
      let config = Config {
         preferred_adapter: Some(HCI1.into()),
         ..Config::default()
      };
      let mut adapters =
         AdapterManager::new(mock.clone(), bus.clone(), Arc::new(ConfigStore::in_memory(config)));
      adapters.enumerate().await?;
      assert_eq!(adapters.default_adapter().map(|a| a.path.as_str()), Some(HCI1));
      Ok(())
   }

   #[tokio::test]
   async fn test_start_discovery_unpowered_makes_no_call() -> Result<()> {
      let mock = with_adapter(false);
      let bus = RecordingBus::new();
      let mut adapters = manager(&mock, &bus);
      adapters.enumerate().await?;

      let err = adapters.start_discovery(HCI0).await.unwrap_err();
      assert!(matches!(err, BluelinkError::Precondition(_)));
      assert_eq!(mock.remote_traffic(), 0);
      Ok(())
   }

   #[tokio::test]
   async fn test_discovery_in_progress_is_success() -> Result<()> {
      let mock = with_adapter(true);
      mock.fail_call(
         "StartDiscovery",
         MockFailure::Remote("org.bluez.Error.InProgress", "Operation already in progress"),
      );
      let bus = RecordingBus::new();
      let mut adapters = manager(&mock, &bus);
      adapters.enumerate().await?;

      adapters.start_discovery(HCI0).await?;
      assert!(adapters.require(HCI0)?.discovering);

      mock.fail_call("StopDiscovery", MockFailure::Remote("org.bluez.Error.NotReady", "Resource Not Ready"));
      adapters.stop_discovery(HCI0).await?;
      assert!(!adapters.require(HCI0)?.discovering);
      Ok(())
   }

   #[tokio::test]
   async fn test_power_toggle_is_exact_or_classified() -> Result<()> {
      let mock = with_adapter(false);
      let bus = RecordingBus::new();
      let mut adapters = manager(&mock, &bus);
      adapters.enumerate().await?;

      for requested in [true, false, true] {
         adapters.set_powered(HCI0, requested).await?;
         assert_eq!(adapters.require(HCI0)?.powered, requested);
      }

      mock.fail_write("Powered", MockFailure::Remote("org.bluez.Error.Failed", "Not Ready"));
      let err = adapters.set_powered(HCI0, false).await.unwrap_err();
      assert!(adapters.require(HCI0)?.powered);
      assert_eq!(classify(&err, ErrorCategory::Adapter).category, ErrorCategory::Adapter);

      mock.fail_write("Powered", MockFailure::Remote("org.freedesktop.DBus.Error.AccessDenied", ""));
      let err = adapters.set_powered(HCI0, false).await.unwrap_err();
      assert_eq!(classify(&err, ErrorCategory::Adapter).category, ErrorCategory::Permission);
      Ok(())
   }

   #[tokio::test]
   async fn test_invalid_input_makes_no_call() -> Result<()> {
      let mock = with_adapter(true);
      let bus = RecordingBus::new();
      let mut adapters = manager(&mock, &bus);
      adapters.enumerate().await?;

      assert!(adapters.set_alias(HCI0, "").await.is_err());
      assert!(adapters.set_alias(HCI0, &"x".repeat(MAX_ALIAS_LEN + 1)).await.is_err());
      assert!(adapters.set_discoverable(HCI0, true, Some(MAX_VISIBILITY_TIMEOUT + 1)).await.is_err());
      assert_eq!(mock.remote_traffic(), 0);

      adapters.set_alias(HCI0, &"x".repeat(MAX_ALIAS_LEN)).await?;
      adapters.set_discoverable(HCI0, true, Some(0)).await?;
      assert_eq!(mock.write_count("Alias"), 1);
      assert_eq!(mock.write_count("DiscoverableTimeout"), 1);
      assert!(adapters.require(HCI0)?.discoverable);
      Ok(())
   }

   #[tokio::test]
   async fn test_removing_default_promotes_another() -> Result<()> {
      let mock = with_adapter(true);
      mock.add_object(HCI1, ADAPTER_INTERFACE, adapter_props("AA:AA:AA:AA:AA:02", true));
      let bus = RecordingBus::new();
      let mut adapters = manager(&mock, &bus);
      adapters.enumerate().await?;

      adapters.handle_signal(&BusSignal::ObjectRemoved {
         path: HCI0.into(),
         interfaces: vec![ADAPTER_INTERFACE.into()],
      });
      let default = adapters.default_adapter().map(|a| a.path.clone());
      assert_eq!(default.as_deref(), Some(HCI1));
      assert!(adapters.require(HCI1)?.is_default);

      adapters.handle_signal(&BusSignal::ObjectRemoved {
         path: HCI1.into(),
         interfaces: vec![ADAPTER_INTERFACE.into()],
      });
      assert!(adapters.default_adapter().is_none());
      Ok(())
   }

   #[tokio::test]
   async fn test_state_and_incidental_changes_are_split() -> Result<()> {
      let mock = with_adapter(true);
      let bus = RecordingBus::new();
      let mut adapters = manager(&mock, &bus);
      adapters.enumerate().await?;
      bus.clear();

      adapters.handle_signal(&changed(HCI0, ADAPTER_INTERFACE, props([("Discovering", true.into())])));
      adapters.handle_signal(&changed(HCI0, ADAPTER_INTERFACE, props([("Alias", "desk".into())])));
      adapters.handle_signal(&changed(HCI0, ADAPTER_INTERFACE, props([("Alias", "desk".into())])));
      assert_eq!(bus.kinds(), vec!["adapter_state_changed", "adapter_changed"]);

      adapters.handle_signal(&changed(HCI0, ADAPTER_INTERFACE, props([("Powered", false.into())])));
      assert!(!adapters.require(HCI0)?.discovering);
      Ok(())
   }
}
