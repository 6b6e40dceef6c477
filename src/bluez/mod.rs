//! BlueZ D-Bus plumbing.
//!
//! This module owns everything that speaks the wire protocol: decoded
//! property values, the [`Transport`](transport::Transport) seam the
//! managers program against, and the zbus-backed client with its
//! reconnect supervision.

pub mod client;
pub mod transport;
pub mod value;

/// Well-known name of bluetoothd on the system bus.
pub const BLUEZ_SERVICE: &str = "org.bluez";
/// Well-known name of obexd on the session bus.
pub const OBEX_SERVICE: &str = "org.bluez.obex";

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const BATTERY_INTERFACE: &str = "org.bluez.Battery1";
pub const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
pub const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";
pub const AGENT_INTERFACE: &str = "org.bluez.Agent1";

pub const OBEX_CLIENT_INTERFACE: &str = "org.bluez.obex.Client1";
pub const OBEX_SESSION_INTERFACE: &str = "org.bluez.obex.Session1";
pub const OBEX_OBJECT_PUSH_INTERFACE: &str = "org.bluez.obex.ObjectPush1";
pub const OBEX_TRANSFER_INTERFACE: &str = "org.bluez.obex.Transfer1";

/// Object implementing `AgentManager1`.
pub const BLUEZ_ROOT_PATH: &str = "/org/bluez";
/// Object implementing `obex.Client1`.
pub const OBEX_CLIENT_PATH: &str = "/org/bluez/obex";

/// Whether an interface lives on obexd rather than bluetoothd.
pub fn is_obex_interface(interface: &str) -> bool {
   interface.starts_with("org.bluez.obex.")
}
