//! Scripted doubles for the bus transport and the event sink.

use std::{
   collections::{BTreeMap, HashMap, VecDeque},
   sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::broadcast;

use crate::{
   bluez::{
      ADAPTER_INTERFACE, DEVICE_INTERFACE,
      transport::{BusSignal, MethodCall, Reply, Transport},
      value::{PropValue, PropertyMap},
   },
   error::{BluelinkError, Result},
   event::{BluetoothEvent, EventBus},
};

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum MockFailure {
   Remote(&'static str, &'static str),
   Timeout,
}

impl MockFailure {
   fn into_error(self, operation: &str) -> BluelinkError {
      match self {
         Self::Remote(name, message) => BluelinkError::remote(name, message),
         Self::Timeout => BluelinkError::Timeout {
            operation: SmolStr::new(operation),
            after: std::time::Duration::from_secs(25),
         },
      }
   }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyWrite {
   pub path: SmolStr,
   pub interface: String,
   pub name: String,
   pub value: PropValue,
}

#[derive(Default)]
struct Script {
   once: VecDeque<MockFailure>,
   always: Option<MockFailure>,
}

impl Script {
   fn next(&mut self) -> Option<MockFailure> {
      self.once.pop_front().or_else(|| self.always.clone())
   }
}

#[derive(Default)]
struct MockState {
   objects: BTreeMap<SmolStr, HashMap<String, PropertyMap>>,
   calls: Vec<MethodCall>,
   writes: Vec<PropertyWrite>,
   reads: Vec<(SmolStr, String)>,
   call_failures: HashMap<String, Script>,
   write_failures: HashMap<String, Script>,
   read_failures: HashMap<String, Script>,
   replies: HashMap<String, VecDeque<Reply>>,
}

/// In-memory object tree with a call log.
pub struct MockTransport {
   state: Mutex<MockState>,
   signals: broadcast::Sender<BusSignal>,
}

impl MockTransport {
   pub fn new() -> Arc<Self> {
      let (signals, _) = broadcast::channel(64);
      Arc::new(Self {
         state: Mutex::new(MockState::default()),
         signals,
      })
   }

   pub fn add_object(&self, path: &str, interface: &str, props: PropertyMap) {
      self
         .state
         .lock()
         .objects
         .entry(SmolStr::new(path))
         .or_default()
         .insert(interface.to_owned(), props);
   }

   pub fn remove_object(&self, path: &str) {
      self.state.lock().objects.remove(path);
   }

   pub fn fail_call(&self, method: &str, failure: MockFailure) {
      let mut state = self.state.lock();
      state.call_failures.entry(method.to_owned()).or_default().once.push_back(failure);
   }

   pub fn fail_call_always(&self, method: &str, failure: MockFailure) {
      let mut state = self.state.lock();
      state.call_failures.entry(method.to_owned()).or_default().always = Some(failure);
   }

   pub fn fail_write(&self, property: &str, failure: MockFailure) {
      let mut state = self.state.lock();
      state.write_failures.entry(property.to_owned()).or_default().once.push_back(failure);
   }

   pub fn fail_read_always(&self, property: &str, failure: MockFailure) {
      let mut state = self.state.lock();
      state.read_failures.entry(property.to_owned()).or_default().always = Some(failure);
   }

   pub fn reply(&self, method: &str, reply: Reply) {
      let mut state = self.state.lock();
      state.replies.entry(method.to_owned()).or_default().push_back(reply);
   }

   pub fn calls(&self) -> Vec<MethodCall> {
      self.state.lock().calls.clone()
   }

   pub fn methods(&self) -> Vec<&'static str> {
      self.state.lock().calls.iter().map(|c| c.method).collect()
   }

   pub fn call_count(&self, method: &str) -> usize {
      self.state.lock().calls.iter().filter(|c| c.method == method).count()
   }

   pub fn writes(&self) -> Vec<PropertyWrite> {
      self.state.lock().writes.clone()
   }

   pub fn write_count(&self, name: &str) -> usize {
      self.state.lock().writes.iter().filter(|w| w.name == name).count()
   }

   pub fn read_count(&self, name: &str) -> usize {
      self.state.lock().reads.iter().filter(|(_, n)| n == name).count()
   }

   pub fn remote_traffic(&self) -> usize {
      let state = self.state.lock();
      state.calls.len() + state.writes.len()
   }

   pub fn emit(&self, signal: BusSignal) {
      let _ = self.signals.send(signal);
   }
}

impl Transport for MockTransport {
   fn invoke(&self, call: MethodCall) -> BoxFuture<'_, Result<Reply>> {
      async move {
         let mut state = self.state.lock();
         let failure = state.call_failures.get_mut(call.method).and_then(Script::next);
         let method = call.method;
         let operation = call.to_string();
         state.calls.push(call);
         if let Some(failure) = failure {
            return Err(failure.into_error(&operation));
         }
         Ok(state
            .replies
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Empty))
      }
      .boxed()
   }

   fn get_property<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
      name: &'a str,
   ) -> BoxFuture<'a, Result<PropValue>> {
      async move {
         let mut state = self.state.lock();
         state.reads.push((SmolStr::new(path), name.to_owned()));
         if let Some(failure) = state.read_failures.get_mut(name).and_then(Script::next) {
            return Err(failure.into_error(name));
         }
         state
            .objects
            .get(path)
            .and_then(|o| o.get(interface))
            .and_then(|p| p.get(name))
            .cloned()
            .ok_or_else(|| {
               BluelinkError::remote("org.freedesktop.DBus.Error.InvalidArgs", "No such property")
            })
      }
      .boxed()
   }

   fn set_property<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
      name: &'a str,
      value: PropValue,
   ) -> BoxFuture<'a, Result<()>> {
      async move {
         let mut state = self.state.lock();
         if let Some(failure) = state.write_failures.get_mut(name).and_then(Script::next) {
            return Err(failure.into_error(name));
         }
         state.writes.push(PropertyWrite {
            path: SmolStr::new(path),
            interface: interface.to_owned(),
            name: name.to_owned(),
            value: value.clone(),
         });
         if let Some(props) = state.objects.get_mut(path).and_then(|o| o.get_mut(interface)) {
            props.insert(name.to_owned(), value);
         }
         Ok(())
      }
      .boxed()
   }

   fn get_all_properties<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
   ) -> BoxFuture<'a, Result<PropertyMap>> {
      async move {
         self
            .state
            .lock()
            .objects
            .get(path)
            .and_then(|o| o.get(interface))
            .cloned()
            .ok_or_else(|| {
               BluelinkError::remote("org.freedesktop.DBus.Error.UnknownObject", path.to_owned())
            })
      }
      .boxed()
   }

   fn objects_with_interface<'a>(&'a self, interface: &'a str) -> BoxFuture<'a, Result<Vec<SmolStr>>> {
      async move {
         Ok(self
            .state
            .lock()
            .objects
            .iter()
            .filter(|(_, ifaces)| ifaces.contains_key(interface))
            .map(|(path, _)| path.clone())
            .collect())
      }
      .boxed()
   }

   fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
      self.signals.subscribe()
   }

   fn is_connected(&self) -> bool {
      true
   }
}

/// Event sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<BluetoothEvent>>,
}

impl RecordingBus {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn events(&self) -> Vec<BluetoothEvent> {
      self.events.lock().clone()
   }

   pub fn kinds(&self) -> Vec<&'static str> {
      self.events.lock().iter().map(BluetoothEvent::kind).collect()
   }

   pub fn count(&self, kind: &str) -> usize {
      self.events.lock().iter().filter(|e| e.kind() == kind).count()
   }

   pub fn clear(&self) {
      self.events.lock().clear();
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, event: BluetoothEvent) {
      self.events.lock().push(event);
   }
}

// === Fixtures ===

pub const HCI0: &str = "/org/bluez/hci0";
pub const HCI1: &str = "/org/bluez/hci1";
pub const HEADPHONES: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";
pub const HEADPHONES_ADDR: &str = "00:11:22:33:44:55";
pub const PHONE: &str = "/org/bluez/hci0/dev_66_77_88_99_AA_BB";
pub const PHONE_ADDR: &str = "66:77:88:99:AA:BB";

pub const A2DP_SINK: &str = "0000110b-0000-1000-8000-00805f9b34fb";
pub const AVRCP: &str = "0000110e-0000-1000-8000-00805f9b34fb";
pub const HFP: &str = "0000111e-0000-1000-8000-00805f9b34fb";

pub fn props<const N: usize>(entries: [(&str, PropValue); N]) -> PropertyMap {
   entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

pub fn adapter_props(address: &str, powered: bool) -> PropertyMap {
   props([
      ("Address", PropValue::str(address)),
      ("Alias", PropValue::str("laptop")),
      ("Name", PropValue::str("laptop")),
      ("Powered", powered.into()),
      ("Discoverable", false.into()),
      ("Pairable", true.into()),
      ("Discovering", false.into()),
      ("DiscoverableTimeout", 180u32.into()),
      ("PairableTimeout", 0u32.into()),
   ])
}

pub fn device_props(address: &str, alias: &str) -> PropertyMap {
   props([
      ("Address", PropValue::str(address)),
      ("Alias", PropValue::str(alias)),
      ("Paired", false.into()),
      ("Connected", false.into()),
      ("Trusted", false.into()),
      ("Blocked", false.into()),
   ])
}

/// A mock with `hci0` (powered as requested) already present.
pub fn with_adapter(powered: bool) -> Arc<MockTransport> {
   let mock = MockTransport::new();
   mock.add_object(HCI0, ADAPTER_INTERFACE, adapter_props("AA:AA:AA:AA:AA:01", powered));
   mock
}

pub fn add_device(mock: &MockTransport, path: &str, mut props: PropertyMap, extra: PropertyMap) {
   props.extend(extra);
   mock.add_object(path, DEVICE_INTERFACE, props);
}

pub fn changed(path: &str, interface: &str, changed: PropertyMap) -> BusSignal {
   BusSignal::PropertiesChanged {
      path: SmolStr::new(path),
      interface: interface.to_owned(),
      changed,
      invalidated: vec![],
   }
}
