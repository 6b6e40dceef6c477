//! Remote devices: materialization, connection state and lifecycle calls.

use std::{
   collections::{BTreeMap, BTreeSet, HashSet},
   sync::Arc,
   time::{Duration, SystemTime},
};

use futures::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   bluez::{
      BATTERY_INTERFACE, DEVICE_INTERFACE,
      transport::{BusSignal, MethodCall, SharedTransport},
      value::{PropValue, PropertyMap, PropertyMapExt},
   },
   config::ConfigStore,
   error::{BluelinkError, Result},
   event::{BluetoothEvent, EventSender},
   manager::{
      RemoteOp,
      adapter::remove_device_call,
      category::{self, DeviceCategory},
      complete,
   },
};

/// Bonding involves user interaction on both ends.
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(60);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Derived link state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

impl ConnectionState {
   /// Legal single steps. Connected never follows Disconnected directly.
   pub const fn allows(self, next: Self) -> bool {
      use ConnectionState::*;
      matches!(
         (self, next),
         (Disconnected, Connecting)
            | (Connecting, Connected | Disconnected)
            | (Connected, Disconnecting | Disconnected)
            | (Disconnecting, Disconnected | Connected)
      )
   }
}

/// Bucketed RSSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SignalStrength {
   Excellent,
   Good,
   Fair,
   Weak,
   Unknown,
}

impl SignalStrength {
   pub const fn from_rssi(rssi: Option<i16>) -> Self {
      match rssi {
         None => Self::Unknown,
         Some(r) if r >= -50 => Self::Excellent,
         Some(r) if r >= -60 => Self::Good,
         Some(r) if r >= -70 => Self::Fair,
         Some(_) => Self::Weak,
      }
   }
}

/// A remote Bluetooth peer known to one adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
   pub path: SmolStr,
   pub adapter: SmolStr,
   pub address: SmolStr,
   pub alias: SmolStr,
   pub name: Option<SmolStr>,
   pub icon: Option<SmolStr>,
   pub class: Option<u32>,
   pub appearance: Option<u16>,
   pub uuids: BTreeSet<SmolStr>,
   pub paired: bool,
   pub connected: bool,
   pub trusted: bool,
   pub blocked: bool,
   pub services_resolved: bool,
   pub rssi: Option<i16>,
   pub tx_power: Option<i16>,
   pub signal: SignalStrength,
   pub battery: Option<u8>,
   pub category: DeviceCategory,
   pub state: ConnectionState,
   pub last_seen: SystemTime,
}

/// The adapter owning a device object: the first four path segments.
pub fn adapter_path_of(path: &str) -> SmolStr {
   let end = path
      .match_indices('/')
      .nth(3)
      .map_or(path.len(), |(idx, _)| idx);
   SmolStr::new(&path[..end])
}

#[derive(Debug, Default, Clone, Copy)]
struct DeviceDelta {
   changed: bool,
   connected: Option<bool>,
   uuids: bool,
}

fn i16_prop(props: &PropertyMap, key: &str) -> Option<i16> {
   props.i64_prop(key).and_then(|v| i16::try_from(v).ok())
}

impl Device {
   pub fn from_properties(path: &str, props: &PropertyMap) -> Self {
      let mut device = Self {
         path: SmolStr::new(path),
         adapter: adapter_path_of(path),
         address: SmolStr::default(),
         alias: SmolStr::default(),
         name: None,
         icon: None,
         class: None,
         appearance: None,
         uuids: BTreeSet::new(),
         paired: false,
         connected: false,
         trusted: false,
         blocked: false,
         services_resolved: false,
         rssi: None,
         tx_power: None,
         signal: SignalStrength::Unknown,
         battery: None,
         category: DeviceCategory::Unknown,
         state: ConnectionState::Disconnected,
         last_seen: SystemTime::now(),
      };
      device.apply(props);
      if device.connected {
         device.state = ConnectionState::Connected;
      }
      device
   }

   fn apply(&mut self, changed: &PropertyMap) -> DeviceDelta {
      let mut delta = DeviceDelta::default();

      macro_rules! update {
         ($field:expr, $value:expr) => {
            if let Some(value) = $value
               && $field != value
            {
               $field = value;
               delta.changed = true;
            }
         };
      }

      update!(
         self.address,
         changed.str_prop("Address").map(|a| SmolStr::new(a.to_ascii_uppercase()))
      );
      update!(self.alias, changed.str_prop("Alias").map(SmolStr::new));
      update!(self.name, changed.str_prop("Name").map(|n| Some(SmolStr::new(n))));
      update!(self.icon, changed.str_prop("Icon").map(|i| Some(SmolStr::new(i))));
      update!(
         self.class,
         changed.u64_prop("Class").and_then(|c| u32::try_from(c).ok()).map(Some)
      );
      update!(
         self.appearance,
         changed.u64_prop("Appearance").and_then(|a| u16::try_from(a).ok()).map(Some)
      );
      update!(self.paired, changed.bool_prop("Paired"));
      update!(self.trusted, changed.bool_prop("Trusted"));
      update!(self.blocked, changed.bool_prop("Blocked"));
      update!(self.services_resolved, changed.bool_prop("ServicesResolved"));
      update!(self.rssi, i16_prop(changed, "RSSI").map(Some));
      update!(self.tx_power, i16_prop(changed, "TxPower").map(Some));
      update!(
         self.battery,
         changed
            .u64_prop("BatteryPercentage")
            .or_else(|| changed.u64_prop("Percentage"))
            .and_then(|b| u8::try_from(b).ok())
            .map(Some)
      );

      if let Some(list) = changed.list_prop("UUIDs") {
         let uuids: BTreeSet<SmolStr> = list.iter().map(|u| SmolStr::new(u.to_ascii_lowercase())).collect();
         if uuids != self.uuids {
            self.uuids = uuids;
            delta.changed = true;
            delta.uuids = true;
         }
      }

      if let Some(connected) = changed.bool_prop("Connected")
         && connected != self.connected
      {
         self.connected = connected;
         delta.changed = true;
         delta.connected = Some(connected);
      }

      self.signal = SignalStrength::from_rssi(self.rssi);
      self.category = category::recognize(self.class, self.appearance, self.icon.as_deref());
      self.last_seen = SystemTime::now();
      delta
   }

   /// The name shown to users.
   pub fn display_name(&self) -> &str {
      if !self.alias.is_empty() {
         &self.alias
      } else if let Some(name) = &self.name {
         name
      } else {
         &self.address
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

/// What an update did to one device, for the controller to fan out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
   pub path: SmolStr,
   /// A genuine connect (`true`) or disconnect (`false`) transition.
   pub connected: Option<bool>,
   pub uuids_changed: bool,
   pub added: bool,
   pub removed: bool,
}

impl DeviceChange {
   fn new(path: &str) -> Self {
      Self {
         path: SmolStr::new(path),
         connected: None,
         uuids_changed: false,
         added: false,
         removed: false,
      }
   }
}

/// Owns the device map and the trusted/blocked index.
pub struct DeviceManager {
   transport: SharedTransport,
   events: EventSender,
   store: Arc<ConfigStore>,
   devices: BTreeMap<SmolStr, Device>,
   trusted: HashSet<SmolStr>,
   blocked: HashSet<SmolStr>,
   changes: Vec<DeviceChange>,
}

impl DeviceManager {
   pub fn new(transport: SharedTransport, events: EventSender, store: Arc<ConfigStore>) -> Self {
      let normalize = |list: Vec<String>| -> HashSet<SmolStr> {
         list.into_iter().map(|a| SmolStr::new(a.to_ascii_uppercase())).collect()
      };
      Self {
         trusted: normalize(store.trusted_devices()),
         blocked: normalize(store.blocked_devices()),
         transport,
         events,
         store,
         devices: BTreeMap::new(),
         changes: Vec::new(),
      }
   }

   pub fn devices(&self) -> Vec<Device> {
      self.devices.values().cloned().collect()
   }

   pub fn devices_on(&self, adapter: &str) -> Vec<Device> {
      self.devices.values().filter(|d| d.adapter == adapter).cloned().collect()
   }

   pub fn device(&self, path: &str) -> Option<&Device> {
      self.devices.get(path)
   }

   pub fn require(&self, path: &str) -> Result<&Device> {
      self
         .devices
         .get(path)
         .ok_or_else(|| BluelinkError::DeviceNotFound(SmolStr::new(path)))
   }

   pub fn is_trusted(&self, address: &str) -> bool {
      self.trusted.contains(address.to_ascii_uppercase().as_str())
   }

   pub fn is_blocked(&self, address: &str) -> bool {
      self.blocked.contains(address.to_ascii_uppercase().as_str())
   }

   /// Transitions produced since the last call.
   pub fn take_changes(&mut self) -> Vec<DeviceChange> {
      std::mem::take(&mut self.changes)
   }

   // === Enumeration ===

   pub async fn enumerate(&mut self) -> Result<()> {
      let paths = self.transport.objects_with_interface(DEVICE_INTERFACE).await?;

      let stale: Vec<SmolStr> = self
         .devices
         .keys()
         .filter(|p| !paths.contains(p))
         .cloned()
         .collect();
      for path in stale {
         self.remove(&path);
      }

      for path in &paths {
         match self.transport.get_all_properties(path, DEVICE_INTERFACE).await {
            Ok(props) => self.upsert(path, &props),
            Err(e) => warn!("Failed to read device {path}: {e}"),
         }
      }

      for path in self.transport.objects_with_interface(BATTERY_INTERFACE).await? {
         if let Ok(level) = self
            .transport
            .get_property(&path, BATTERY_INTERFACE, "Percentage")
            .await
         {
            let mut props = PropertyMap::new();
            props.insert("Percentage".into(), level);
            self.update(&path, &props);
         }
      }

      info!("Enumerated {} device(s)", self.devices.len());
      Ok(())
   }

   fn upsert(&mut self, path: &str, props: &PropertyMap) {
      if self.devices.contains_key(path) {
         self.update(path, props);
         return;
      }
      let device = Device::from_properties(path, props);
      debug!("Device added: {path} ({})", device.display_name());
      self.sync_index(&device.address, device.trusted, device.blocked);
      self.devices.insert(device.path.clone(), device.clone());
      self.changes.push(DeviceChange {
         added: true,
         uuids_changed: !device.uuids.is_empty(),
         ..DeviceChange::new(path)
      });
      self.events.emit(BluetoothEvent::DeviceAdded(device));
   }

   fn update(&mut self, path: &str, props: &PropertyMap) {
      let Some(device) = self.devices.get_mut(path) else {
         return;
      };
      let delta = device.apply(props);
      let (address, trusted, blocked) = (device.address.clone(), device.trusted, device.blocked);
      if !delta.changed {
         return;
      }

      let mut change = DeviceChange::new(path);
      change.uuids_changed = delta.uuids;
      if let Some(connected) = delta.connected {
         change.connected = self.follow_link(path, connected);
      }
      self.sync_index(&address, trusted, blocked);

      if let Some(device) = self.devices.get(path) {
         self.events.emit(BluetoothEvent::DeviceChanged(device.clone()));
      }
      if change.connected.is_some() || change.uuids_changed {
         self.changes.push(change);
      }
   }

   fn remove(&mut self, path: &str) {
      if self.devices.remove(path).is_none() {
         return;
      }
      debug!("Device removed: {path}");
      self.changes.push(DeviceChange {
         removed: true,
         ..DeviceChange::new(path)
      });
      self.events.emit(BluetoothEvent::DeviceRemoved(SmolStr::new(path)));
   }

   pub fn clear(&mut self) {
      let paths: Vec<SmolStr> = self.devices.keys().cloned().collect();
      for path in paths {
         self.remove(&path);
      }
   }

   // === Connection state ===

   /// Moves a device one legal step. Illegal steps are ignored.
   fn step(&mut self, path: &str, next: ConnectionState) -> bool {
      let Some(device) = self.devices.get_mut(path) else {
         return false;
      };
      if device.state == next {
         return false;
      }
      if !device.state.allows(next) {
         debug!("Ignoring {} -> {next} for {path}", device.state);
         return false;
      }
      device.state = next;
      self.events.emit(BluetoothEvent::DeviceConnectionChanged {
         device: SmolStr::new(path),
         state: next,
      });
      true
   }

   /// Reconciles the derived state with bluetoothd's `Connected` flag and
   /// reports genuine transitions.
   fn follow_link(&mut self, path: &str, connected: bool) -> Option<bool> {
      let state = self.devices.get(path)?.state;
      match (connected, state) {
         (true, ConnectionState::Disconnected) => {
            self.step(path, ConnectionState::Connecting);
            self.step(path, ConnectionState::Connected);
         },
         (true, ConnectionState::Connecting) => {
            self.step(path, ConnectionState::Connected);
         },
         (false, ConnectionState::Connected | ConnectionState::Disconnecting) => {
            self.step(path, ConnectionState::Disconnected);
         },
         _ => return None,
      }

      let event = if connected {
         BluetoothEvent::DeviceConnected(SmolStr::new(path))
      } else {
         BluetoothEvent::DeviceDisconnected(SmolStr::new(path))
      };
      self.events.emit(event);
      Some(connected)
   }

   fn record_link(&mut self, path: &str, connected: bool) {
      if let Some(connected) = self.follow_link(path, connected) {
         self.changes.push(DeviceChange {
            connected: Some(connected),
            ..DeviceChange::new(path)
         });
      }
   }

   // === Trusted/blocked index ===

   fn sync_index(&mut self, address: &str, trusted: bool, blocked: bool) {
      if address.is_empty() {
         return;
      }
      let key = SmolStr::new(address);
      if toggle(&mut self.trusted, &key, trusted) {
         let result = self.store.set_trusted(address, trusted);
         self.store.persist_or_warn("trusted devices", result);
      }
      if toggle(&mut self.blocked, &key, blocked) {
         let result = self.store.set_blocked(address, blocked);
         self.store.persist_or_warn("blocked devices", result);
      }
   }

   // === Signals ===

   pub fn handle_signal(&mut self, signal: &BusSignal) {
      match signal {
         BusSignal::ObjectAdded { path, interfaces } => {
            if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
               self.upsert(path, props);
            }
            if let Some(props) = interfaces.get(BATTERY_INTERFACE) {
               self.update(path, props);
            }
         },
         BusSignal::ObjectRemoved { path, interfaces } => {
            if interfaces.iter().any(|i| i == DEVICE_INTERFACE) {
               self.remove(path);
            }
         },
         BusSignal::PropertiesChanged {
            path,
            interface,
            changed,
            ..
         } if interface == DEVICE_INTERFACE || interface == BATTERY_INTERFACE => {
            self.update(path, changed);
         },
         BusSignal::ServiceLost => self.clear(),
         _ => {},
      }
   }

   // === Pairing ===

   /// Pairs, then marks the device trusted. A failed trust write does not
   /// fail the pairing; the op yields it for separate reporting.
   pub fn begin_pair(&self, path: &str) -> Result<Option<RemoteOp<Option<BluelinkError>>>> {
      let device = self.require(path)?;
      if device.paired {
         debug!("{path} is already paired");
         return Ok(None);
      }
      let transport = self.transport.clone();
      let path = device.path.clone();
      Ok(Some(
         async move {
            let call = MethodCall::new(path.clone(), DEVICE_INTERFACE, "Pair").timeout(PAIR_TIMEOUT);
            transport.invoke(call).await?;
            match transport
               .set_property(&path, DEVICE_INTERFACE, "Trusted", PropValue::Bool(true))
               .await
            {
               Ok(()) => Ok(None),
               Err(e) => {
                  warn!("Paired {path} but could not trust it: {e}");
                  Ok(Some(e))
               },
            }
         }
         .boxed(),
      ))
   }

   /// Returns the trust failure, if any, of an otherwise successful pair.
   pub fn finish_pair(
      &mut self,
      path: &str,
      result: Result<Option<BluelinkError>>,
   ) -> Result<Option<BluelinkError>> {
      let trust_failure = result?;
      let mut props = PropertyMap::new();
      props.insert("Paired".into(), true.into());
      if trust_failure.is_none() {
         props.insert("Trusted".into(), true.into());
      }
      self.update(path, &props);
      info!("Paired {path}");
      self.events.emit(BluetoothEvent::DevicePaired(SmolStr::new(path)));
      Ok(trust_failure)
   }

   pub fn begin_unpair(&self, path: &str) -> Result<Option<RemoteOp<()>>> {
      let device = self.require(path)?;
      if !device.paired {
         return Ok(None);
      }
      let transport = self.transport.clone();
      let call = remove_device_call(&device.adapter, path);
      Ok(Some(
         async move {
            transport.invoke(call).await?;
            Ok(())
         }
         .boxed(),
      ))
   }

   /// The device object itself goes away with the removal notification.
   pub fn finish_unpair(&mut self, path: &str, result: Result<()>) -> Result<()> {
      result?;
      let mut props = PropertyMap::new();
      props.insert("Paired".into(), false.into());
      props.insert("Trusted".into(), false.into());
      self.update(path, &props);
      info!("Unpaired {path}");
      Ok(())
   }

   // === Connection ===

   pub fn begin_connect(&mut self, path: &str) -> Result<Option<RemoteOp<()>>> {
      let device = self.require(path)?;
      if device.blocked {
         return Err(BluelinkError::Precondition(format!("{path} is blocked")));
      }
      match device.state {
         ConnectionState::Connected | ConnectionState::Connecting => return Ok(None),
         ConnectionState::Disconnecting => {
            return Err(BluelinkError::Precondition(format!("{path} is disconnecting")));
         },
         ConnectionState::Disconnected => {},
      }

      self.step(path, ConnectionState::Connecting);
      let transport = self.transport.clone();
      let call = MethodCall::new(path, DEVICE_INTERFACE, "Connect").timeout(CONNECT_TIMEOUT);
      Ok(Some(
         async move {
            transport.invoke(call).await?;
            Ok(())
         }
         .boxed(),
      ))
   }

   pub fn finish_connect(&mut self, path: &str, result: Result<()>) -> Result<()> {
      let state = self.devices.get(path).map(|d| (d.state, d.connected));
      match (result, state) {
         (Ok(()), Some((ConnectionState::Connecting, _))) => {
            self.record_link(path, true);
            Ok(())
         },
         (Ok(()), _) => Ok(()),
         (Err(e), Some((ConnectionState::Connecting, connected))) => {
            // bluetoothd may still report a link from another profile
            let rollback = if connected {
               ConnectionState::Connected
            } else {
               ConnectionState::Disconnected
            };
            self.step(path, rollback);
            Err(e)
         },
         (Err(e), _) => Err(e),
      }
   }

   pub fn begin_disconnect(&mut self, path: &str) -> Result<Option<RemoteOp<()>>> {
      let device = self.require(path)?;
      match device.state {
         ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(None),
         ConnectionState::Connecting => {
            return Err(BluelinkError::Precondition(format!("{path} is still connecting")));
         },
         ConnectionState::Connected => {},
      }

      self.step(path, ConnectionState::Disconnecting);
      let transport = self.transport.clone();
      let call = MethodCall::new(path, DEVICE_INTERFACE, "Disconnect").timeout(DISCONNECT_TIMEOUT);
      Ok(Some(
         async move {
            transport.invoke(call).await?;
            Ok(())
         }
         .boxed(),
      ))
   }

   pub fn finish_disconnect(&mut self, path: &str, result: Result<()>) -> Result<()> {
      let disconnecting = self
         .devices
         .get(path)
         .is_some_and(|d| d.state == ConnectionState::Disconnecting);
      match result {
         Ok(()) => {
            if disconnecting {
               self.record_link(path, false);
            }
            Ok(())
         },
         Err(e) => {
            if disconnecting {
               self.step(path, ConnectionState::Connected);
            }
            Err(e)
         },
      }
   }

   // === Trust and block ===

   fn begin_flag(&self, path: &str, name: &'static str, value: bool) -> Result<Option<RemoteOp<PropertyMap>>> {
      let device = self.require(path)?;
      let current = if name == "Trusted" { device.trusted } else { device.blocked };
      if current == value {
         return Ok(None);
      }
      let transport = self.transport.clone();
      let path = device.path.clone();
      Ok(Some(
         async move {
            transport
               .set_property(&path, DEVICE_INTERFACE, name, PropValue::Bool(value))
               .await?;
            let mut applied = PropertyMap::new();
            applied.insert(name.to_owned(), PropValue::Bool(value));
            Ok(applied)
         }
         .boxed(),
      ))
   }

   pub fn begin_set_trusted(&self, path: &str, trusted: bool) -> Result<Option<RemoteOp<PropertyMap>>> {
      self.begin_flag(path, "Trusted", trusted)
   }

   pub fn begin_set_blocked(&self, path: &str, blocked: bool) -> Result<Option<RemoteOp<PropertyMap>>> {
      self.begin_flag(path, "Blocked", blocked)
   }

   pub fn finish_write(&mut self, path: &str, result: Result<PropertyMap>) -> Result<()> {
      let applied = result?;
      self.update(path, &applied);
      Ok(())
   }

   // === Signal strength ===

   /// Reads RSSI of every connected device. Read failures are expected for
   /// devices that have not advertised recently and are dropped.
   pub fn begin_refresh_signal(&self) -> Option<RemoteOp<Vec<(SmolStr, PropValue)>>> {
      let paths: Vec<SmolStr> = self
         .devices
         .values()
         .filter(|d| d.state == ConnectionState::Connected)
         .map(|d| d.path.clone())
         .collect();
      if paths.is_empty() {
         return None;
      }
      let transport = self.transport.clone();
      Some(
         async move {
            let mut readings = Vec::with_capacity(paths.len());
            for path in paths {
               match transport.get_property(&path, DEVICE_INTERFACE, "RSSI").await {
                  Ok(rssi) => readings.push((path, rssi)),
                  Err(e) => debug!("RSSI refresh for {path} failed: {e}"),
               }
            }
            Ok(readings)
         }
         .boxed(),
      )
   }

   pub fn finish_refresh_signal(&mut self, result: Result<Vec<(SmolStr, PropValue)>>) {
      let Ok(readings) = result else {
         return;
      };
      for (path, rssi) in readings {
         let mut props = PropertyMap::new();
         props.insert("RSSI".into(), rssi);
         self.update(&path, &props);
      }
   }

   // === In-place variants ===

   pub async fn pair(&mut self, path: &str) -> Result<()> {
      let op = self.begin_pair(path)?;
      complete(self, op, None, |m, r| m.finish_pair(path, r)).await?;
      Ok(())
   }

   pub async fn unpair(&mut self, path: &str) -> Result<()> {
      let op = self.begin_unpair(path)?;
      complete(self, op, (), |m, r| m.finish_unpair(path, r)).await
   }

   pub async fn connect(&mut self, path: &str) -> Result<()> {
      let op = self.begin_connect(path)?;
      complete(self, op, (), |m, r| m.finish_connect(path, r)).await
   }

   pub async fn disconnect(&mut self, path: &str) -> Result<()> {
      let op = self.begin_disconnect(path)?;
      complete(self, op, (), |m, r| m.finish_disconnect(path, r)).await
   }

   pub async fn set_trusted(&mut self, path: &str, trusted: bool) -> Result<()> {
      let op = self.begin_set_trusted(path, trusted)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }

   pub async fn set_blocked(&mut self, path: &str, blocked: bool) -> Result<()> {
      let op = self.begin_set_blocked(path, blocked)?;
      complete(self, op, (), |m, r| m.finish_write(path, r)).await
   }

   pub async fn refresh_signal(&mut self) {
      if let Some(op) = self.begin_refresh_signal() {
         let result = op.await;
         self.finish_refresh_signal(result);
      }
   }
}

fn toggle(set: &mut HashSet<SmolStr>, key: &SmolStr, member: bool) -> bool {
   if member { set.insert(key.clone()) } else { set.remove(key) }
}
