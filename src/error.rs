//! Error types for the Bluetooth lifecycle service.
//!
//! `BluelinkError` is the typed failure returned by every operation.
//! `DomainError` is the user-facing classification of such a failure,
//! produced by [`classify`] and published to event consumers.

use std::{path::PathBuf, time::Duration, time::SystemTime};

use serde::Serialize;
use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the Bluetooth service.
#[derive(Error, Debug)]
pub enum BluelinkError {
   #[error("D-Bus error: {0}")]
   DBus(zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   /// Error reply from a remote method call, split into its D-Bus error name
   /// and the accompanying message.
   #[error("{name}: {message}")]
   Remote { name: SmolStr, message: String },

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("{operation} timed out after {}s", .after.as_secs())]
   Timeout { operation: SmolStr, after: Duration },

   #[error("Not connected to the Bluetooth daemon")]
   NotConnected,

   #[error("Bluetooth daemon unavailable after {0} reconnect attempts")]
   ReconnectExhausted(u32),

   #[error("Adapter not found: {0}")]
   AdapterNotFound(SmolStr),

   #[error("No Bluetooth adapter available")]
   NoAdapter,

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("Transfer not found: {0}")]
   TransferNotFound(SmolStr),

   #[error("File not found: {}", .0.display())]
   FileNotFound(PathBuf),

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Precondition failed: {0}")]
   Precondition(String),

   #[error("Profile {uuid} is not advertised by {device}")]
   ProfileNotSupported { device: SmolStr, uuid: SmolStr },

   #[error("Operation '{0}' denied by policy")]
   PermissionDenied(SmolStr),

   #[error("Authorization for '{0}' was cancelled")]
   AuthorizationCancelled(SmolStr),

   #[error("Pairing rejected")]
   PairingRejected,

   #[error("Pairing request timed out")]
   PairingTimeout,

   #[error("Another pairing exchange is already pending")]
   AgentBusy,

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl From<zbus::Error> for BluelinkError {
   fn from(err: zbus::Error) -> Self {
      match err {
         zbus::Error::MethodError(name, detail, _) => Self::Remote {
            name: SmolStr::new(name.as_str()),
            message: detail.unwrap_or_default(),
         },
         other => Self::DBus(other),
      }
   }
}

impl BluelinkError {
   /// Builds a remote error reply, mostly useful for scripted transports.
   pub fn remote(name: &str, message: impl Into<String>) -> Self {
      Self::Remote {
         name: SmolStr::new(name),
         message: message.into(),
      }
   }

   /// The D-Bus error name if this failure came from a remote reply.
   pub fn remote_name(&self) -> Option<&str> {
      match self {
         Self::Remote { name, .. } => Some(name.as_str()),
         _ => None,
      }
   }
}

/// Convenience type alias for Results with `BluelinkError`.
pub type Result<T> = std::result::Result<T, BluelinkError>;

// === Classification ===

/// Fixed failure taxonomy shown to users.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
   Adapter,
   Device,
   Pairing,
   Connection,
   Transfer,
   Transport,
   Permission,
   Timeout,
   Unknown,
}

impl ErrorCategory {
   const fn suggestion(self) -> &'static str {
      match self {
         Self::Adapter => "Check that the Bluetooth adapter is present and powered on.",
         Self::Device => "Make sure the device is nearby, switched on and discoverable.",
         Self::Pairing => "Put the device in pairing mode and try pairing again.",
         Self::Connection => "Move the device closer or switch it off and on, then reconnect.",
         Self::Transfer => "Check that the receiving device accepts files and retry the transfer.",
         Self::Transport => "Make sure the bluetooth service is running.",
         Self::Permission => "Ask an administrator to allow this action.",
         Self::Timeout => "The device did not answer in time; try again.",
         Self::Unknown => "Try again; if the problem persists restart the bluetooth service.",
      }
   }
}

/// A classified, user-presentable failure.
#[derive(Debug, Clone, Serialize)]
pub struct DomainError {
   pub category: ErrorCategory,
   pub code: SmolStr,
   pub message: String,
   pub detail: Option<String>,
   pub suggestion: Option<String>,
   pub timestamp: SystemTime,
}

impl DomainError {
   pub fn new(category: ErrorCategory, code: impl Into<SmolStr>, message: impl Into<String>) -> Self {
      Self {
         category,
         code: code.into(),
         message: message.into(),
         detail: None,
         suggestion: Some(category.suggestion().to_owned()),
         timestamp: SystemTime::now(),
      }
   }

   #[must_use]
   pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
      self.detail = Some(detail.into());
      self
   }

   /// Routine lookups of vanished devices are not worth a notification.
   pub fn should_notify(&self) -> bool {
      !(self.category == ErrorCategory::Device && self.code == "device_not_found")
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

/// Error names reported by bluetoothd and the bus daemon, mapped to a
/// category. Checked before any message heuristics.
const STRUCTURED_NAMES: &[(&str, ErrorCategory)] = &[
   ("org.bluez.Error.AuthenticationFailed", ErrorCategory::Pairing),
   ("org.bluez.Error.AuthenticationCanceled", ErrorCategory::Pairing),
   ("org.bluez.Error.AuthenticationRejected", ErrorCategory::Pairing),
   ("org.bluez.Error.AuthenticationTimeout", ErrorCategory::Timeout),
   ("org.bluez.Error.ConnectionAttemptFailed", ErrorCategory::Connection),
   ("org.bluez.Error.NotConnected", ErrorCategory::Connection),
   ("org.bluez.Error.AlreadyConnected", ErrorCategory::Connection),
   ("org.bluez.Error.NotReady", ErrorCategory::Adapter),
   ("org.bluez.Error.NotAuthorized", ErrorCategory::Permission),
   ("org.bluez.Error.NotPermitted", ErrorCategory::Permission),
   ("org.bluez.Error.DoesNotExist", ErrorCategory::Device),
   ("org.bluez.Error.AlreadyExists", ErrorCategory::Device),
   ("org.bluez.Error.InProgress", ErrorCategory::Device),
   ("org.bluez.Error.NotAvailable", ErrorCategory::Device),
   ("org.bluez.Error.NotSupported", ErrorCategory::Device),
   ("org.bluez.Error.InvalidArguments", ErrorCategory::Device),
   ("org.freedesktop.DBus.Error.AccessDenied", ErrorCategory::Permission),
   ("org.freedesktop.DBus.Error.NoReply", ErrorCategory::Timeout),
   ("org.freedesktop.DBus.Error.Timeout", ErrorCategory::Timeout),
   ("org.freedesktop.DBus.Error.TimedOut", ErrorCategory::Timeout),
   ("org.freedesktop.DBus.Error.ServiceUnknown", ErrorCategory::Transport),
   ("org.freedesktop.DBus.Error.NameHasNoOwner", ErrorCategory::Transport),
   ("org.freedesktop.DBus.Error.Disconnected", ErrorCategory::Transport),
   ("org.freedesktop.DBus.Error.UnknownObject", ErrorCategory::Device),
];

/// Substring heuristics for generic error names (`org.bluez.Error.Failed`
/// and friends) whose message is the only hint. Order matters.
const MESSAGE_PATTERNS: &[(&str, ErrorCategory)] = &[
   ("timeout", ErrorCategory::Timeout),
   ("timed out", ErrorCategory::Timeout),
   ("not authorized", ErrorCategory::Permission),
   ("access denied", ErrorCategory::Permission),
   ("permission", ErrorCategory::Permission),
   ("authentication", ErrorCategory::Pairing),
   ("pair", ErrorCategory::Pairing),
   ("host is down", ErrorCategory::Connection),
   ("connect", ErrorCategory::Connection),
   ("br-connection", ErrorCategory::Connection),
   ("le-connection", ErrorCategory::Connection),
   ("service unknown", ErrorCategory::Transport),
   ("no such name", ErrorCategory::Transport),
   ("not ready", ErrorCategory::Adapter),
   ("powered", ErrorCategory::Adapter),
   ("adapter", ErrorCategory::Adapter),
   ("transfer", ErrorCategory::Transfer),
   ("obex", ErrorCategory::Transfer),
   ("does not exist", ErrorCategory::Device),
];

/// Converts `AuthenticationFailed` into `authentication_failed`.
fn snake_code(name: &str) -> SmolStr {
   let last = name.rsplit('.').next().unwrap_or(name);
   let mut out = String::with_capacity(last.len() + 4);
   for (i, ch) in last.chars().enumerate() {
      if ch.is_ascii_uppercase() {
         if i > 0 {
            out.push('_');
         }
         out.push(ch.to_ascii_lowercase());
      } else {
         out.push(ch);
      }
   }
   out.into()
}

fn classify_remote(name: &str, message: &str) -> (ErrorCategory, SmolStr) {
   if let Some((_, category)) = STRUCTURED_NAMES.iter().find(|(n, _)| *n == name) {
      let code = if *category == ErrorCategory::Timeout && name.starts_with("org.bluez.Error.Auth") {
         SmolStr::new_static("pairing_timeout")
      } else {
         snake_code(name)
      };
      return (*category, code);
   }
   if name.starts_with("org.bluez.obex.Error") {
      return (ErrorCategory::Transfer, snake_code(name));
   }

   let haystack = format!("{name} {message}").to_ascii_lowercase();
   let category = MESSAGE_PATTERNS
      .iter()
      .find(|(pattern, _)| haystack.contains(pattern))
      .map_or(ErrorCategory::Unknown, |(_, category)| *category);
   (category, snake_code(name))
}

/// Classifies a failure for presentation.
///
/// `context` is the category of the operation that failed; it is used for
/// local validation failures that carry no category of their own. Remote
/// errors are keyed on the structured error name first, then on message
/// heuristics, and fall back to [`ErrorCategory::Unknown`].
pub fn classify(err: &BluelinkError, context: ErrorCategory) -> DomainError {
   let message = err.to_string();
   let (category, code): (ErrorCategory, SmolStr) = match err {
      BluelinkError::Remote { name, message } => classify_remote(name, message),
      BluelinkError::DBus(_) | BluelinkError::DBusConnection(_) => {
         (ErrorCategory::Transport, "bus_error".into())
      },
      BluelinkError::NotConnected => (ErrorCategory::Transport, "not_connected".into()),
      BluelinkError::ReconnectExhausted(_) => {
         (ErrorCategory::Transport, "reconnect_exhausted".into())
      },
      BluelinkError::Timeout { .. } => (ErrorCategory::Timeout, "timeout".into()),
      BluelinkError::PairingTimeout => (ErrorCategory::Timeout, "pairing_timeout".into()),
      BluelinkError::PermissionDenied(_) => (ErrorCategory::Permission, "permission_denied".into()),
      BluelinkError::AuthorizationCancelled(_) => {
         (ErrorCategory::Permission, "authorization_cancelled".into())
      },
      BluelinkError::PairingRejected => (ErrorCategory::Pairing, "pairing_rejected".into()),
      BluelinkError::AgentBusy => (ErrorCategory::Pairing, "agent_busy".into()),
      BluelinkError::AdapterNotFound(_) => (ErrorCategory::Adapter, "adapter_not_found".into()),
      BluelinkError::NoAdapter => (ErrorCategory::Adapter, "no_adapter".into()),
      BluelinkError::DeviceNotFound(_) => (ErrorCategory::Device, "device_not_found".into()),
      BluelinkError::TransferNotFound(_) => (ErrorCategory::Transfer, "transfer_not_found".into()),
      BluelinkError::FileNotFound(_) => (ErrorCategory::Transfer, "file_not_found".into()),
      BluelinkError::ProfileNotSupported { .. } => {
         (ErrorCategory::Connection, "profile_not_supported".into())
      },
      BluelinkError::InvalidArgument(_) => (context, "invalid_argument".into()),
      BluelinkError::Precondition(_) => (context, "precondition_failed".into()),
      BluelinkError::Io(_) => (context, "io_error".into()),
      BluelinkError::ManagerShutdown => (ErrorCategory::Unknown, "manager_shutdown".into()),
      BluelinkError::ConfigDirNotFound
      | BluelinkError::TomlParse(_)
      | BluelinkError::TomlSerialize(_) => (ErrorCategory::Unknown, "config_error".into()),
   };

   let domain = DomainError::new(category, code, message);
   match err {
      BluelinkError::Remote { name, .. } => domain.with_detail(name.as_str()),
      _ => domain,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_structured_name_wins_over_message() {
      let err = BluelinkError::remote("org.bluez.Error.AuthenticationFailed", "connection refused");
      let domain = classify(&err, ErrorCategory::Connection);
      assert_eq!(domain.category, ErrorCategory::Pairing);
      assert_eq!(domain.code, "authentication_failed");
      assert_eq!(domain.detail.as_deref(), Some("org.bluez.Error.AuthenticationFailed"));
      assert!(domain.suggestion.is_some());
   }

   #[test]
   fn test_generic_name_falls_back_to_message() {
      let err = BluelinkError::remote("org.bluez.Error.Failed", "br-connection-page-timeout");
      assert_eq!(classify(&err, ErrorCategory::Device).category, ErrorCategory::Timeout);

      let err = BluelinkError::remote("org.bluez.Error.Failed", "Host is down");
      assert_eq!(classify(&err, ErrorCategory::Device).category, ErrorCategory::Connection);
   }

   #[test]
   fn test_unmatched_remote_is_unknown() {
      let err = BluelinkError::remote("com.example.Weird", "something odd");
      let domain = classify(&err, ErrorCategory::Adapter);
      assert_eq!(domain.category, ErrorCategory::Unknown);
      assert_eq!(domain.code, "weird");
   }

   #[test]
   fn test_distinct_permission_and_pairing_timeout() {
      let denied = classify(&BluelinkError::PermissionDenied("power".into()), ErrorCategory::Adapter);
      assert_eq!(denied.category, ErrorCategory::Permission);

      let timeout = classify(&BluelinkError::PairingTimeout, ErrorCategory::Pairing);
      assert_eq!(timeout.category, ErrorCategory::Timeout);
      assert_eq!(timeout.code, "pairing_timeout");

      let remote = BluelinkError::remote("org.bluez.Error.AuthenticationTimeout", "");
      assert_eq!(classify(&remote, ErrorCategory::Pairing).code, "pairing_timeout");
   }

   #[test]
   fn test_local_validation_uses_context() {
      let err = BluelinkError::InvalidArgument("alias too long".into());
      let domain = classify(&err, ErrorCategory::Adapter);
      assert_eq!(domain.category, ErrorCategory::Adapter);
      assert_eq!(domain.code, "invalid_argument");
   }

   #[test]
   fn test_device_not_found_is_not_notified() {
      let domain = classify(&BluelinkError::DeviceNotFound("/x".into()), ErrorCategory::Connection);
      assert!(!domain.should_notify());
      let domain = classify(&BluelinkError::PairingRejected, ErrorCategory::Pairing);
      assert!(domain.should_notify());
   }

   #[test]
   fn test_snake_code() {
      assert_eq!(snake_code("org.bluez.Error.InProgress"), "in_progress");
      assert_eq!(snake_code("Failed"), "failed");
   }
}
