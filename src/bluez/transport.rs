//! The seam between the managers and the bus.
//!
//! Managers never touch zbus directly. They issue [`MethodCall`]s and
//! property reads/writes through a [`Transport`], and consume the
//! normalized [`BusSignal`] stream it publishes.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use smol_str::SmolStr;
use tokio::sync::broadcast;

use crate::{
   bluez::value::{PropValue, PropertyMap},
   error::Result,
};

/// Deadline applied when a call does not specify one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Argument shapes used by the BlueZ and obexd methods this service calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Args {
   None,
   Str(SmolStr),
   Path(SmolStr),
   /// `RegisterAgent(o, s)`
   PathStr(SmolStr, SmolStr),
   /// `CreateSession(s destination, a{sv} {"Target": target})`
   Session { destination: SmolStr, target: SmolStr },
}

/// Decoded method reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
   Empty,
   /// First object path of the reply (`CreateSession`, `SendFile`).
   Path(SmolStr),
}

impl Reply {
   pub fn into_path(self) -> Option<SmolStr> {
      match self {
         Self::Path(path) => Some(path),
         Self::Empty => None,
      }
   }
}

/// A remote method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
   pub path: SmolStr,
   pub interface: &'static str,
   pub method: &'static str,
   pub args: Args,
   pub timeout: Duration,
}

impl MethodCall {
   pub fn new(path: impl Into<SmolStr>, interface: &'static str, method: &'static str) -> Self {
      Self {
         path: path.into(),
         interface,
         method,
         args: Args::None,
         timeout: DEFAULT_CALL_TIMEOUT,
      }
   }

   #[must_use]
   pub fn args(mut self, args: Args) -> Self {
      self.args = args;
      self
   }

   #[must_use]
   pub const fn timeout(mut self, timeout: Duration) -> Self {
      self.timeout = timeout;
      self
   }
}

impl fmt::Display for MethodCall {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}.{} on {}", self.interface, self.method, self.path)
   }
}

/// Normalized notifications published by the transport.
#[derive(Debug, Clone)]
pub enum BusSignal {
   /// `InterfacesAdded`, with the initial properties of each interface.
   ObjectAdded {
      path: SmolStr,
      interfaces: HashMap<String, PropertyMap>,
   },
   /// `InterfacesRemoved`.
   ObjectRemoved {
      path: SmolStr,
      interfaces: Vec<String>,
   },
   /// `PropertiesChanged` on any object of the watched services.
   PropertiesChanged {
      path: SmolStr,
      interface: String,
      changed: PropertyMap,
      invalidated: Vec<String>,
   },
   /// The client (re)initialized its view; consumers should re-enumerate.
   ServiceReady,
   /// bluetoothd left the bus.
   ServiceLost,
   /// Reconnect attempts are used up.
   ReconnectExhausted { attempts: u32 },
}

impl BusSignal {
   /// Whether this signal concerns `interface`. Lifecycle signals concern
   /// every interface.
   pub fn touches(&self, interface: &str) -> bool {
      match self {
         Self::ObjectAdded { interfaces, .. } => interfaces.contains_key(interface),
         Self::ObjectRemoved { interfaces, .. } => interfaces.iter().any(|i| i == interface),
         Self::PropertiesChanged { interface: i, .. } => i == interface,
         Self::ServiceReady | Self::ServiceLost | Self::ReconnectExhausted { .. } => true,
      }
   }

   pub fn touches_any(&self, interfaces: &[&str]) -> bool {
      interfaces.iter().any(|i| self.touches(i))
   }

   pub fn path(&self) -> Option<&str> {
      match self {
         Self::ObjectAdded { path, .. }
         | Self::ObjectRemoved { path, .. }
         | Self::PropertiesChanged { path, .. } => Some(path.as_str()),
         _ => None,
      }
   }
}

/// Cached, asynchronous access to remote objects.
pub trait Transport: Send + Sync {
   /// Calls a remote method. Fails with `Timeout` once `call.timeout` elapses.
   fn invoke(&self, call: MethodCall) -> BoxFuture<'_, Result<Reply>>;

   fn get_property<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
      name: &'a str,
   ) -> BoxFuture<'a, Result<PropValue>>;

   fn set_property<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
      name: &'a str,
      value: PropValue,
   ) -> BoxFuture<'a, Result<()>>;

   fn get_all_properties<'a>(
      &'a self,
      path: &'a str,
      interface: &'a str,
   ) -> BoxFuture<'a, Result<PropertyMap>>;

   /// Object paths currently known to implement `interface`, sorted.
   fn objects_with_interface<'a>(&'a self, interface: &'a str) -> BoxFuture<'a, Result<Vec<SmolStr>>>;

   fn subscribe(&self) -> broadcast::Receiver<BusSignal>;

   fn is_connected(&self) -> bool;
}

/// Type alias for a shared transport.
pub type SharedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_signal_interface_filter() {
      let mut interfaces = HashMap::new();
      interfaces.insert("org.bluez.Device1".to_string(), PropertyMap::new());
      let added = BusSignal::ObjectAdded {
         path: "/org/bluez/hci0/dev_00_11_22_33_44_55".into(),
         interfaces,
      };
      assert!(added.touches("org.bluez.Device1"));
      assert!(!added.touches("org.bluez.Adapter1"));
      assert!(added.touches_any(&["org.bluez.Adapter1", "org.bluez.Device1"]));
      assert!(BusSignal::ServiceLost.touches("org.bluez.Adapter1"));
      assert_eq!(added.path(), Some("/org/bluez/hci0/dev_00_11_22_33_44_55"));
   }

   #[test]
   fn test_method_call_builder() {
      let call = MethodCall::new("/org/bluez/hci0", "org.bluez.Adapter1", "StartDiscovery")
         .timeout(Duration::from_secs(3));
      assert_eq!(call.args, Args::None);
      assert_eq!(call.timeout, Duration::from_secs(3));
      assert_eq!(call.to_string(), "org.bluez.Adapter1.StartDiscovery on /org/bluez/hci0");
   }
}
