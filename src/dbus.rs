use std::path::PathBuf;

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{error::BluelinkError, manager::controller::Controller};

/// Object path of the control API on the session bus.
pub const MANAGER_PATH: &str = "/org/bluelink/manager";

pub struct BluelinkService {
   controller: Controller,
}

impl BluelinkService {
   pub const fn new(controller: Controller) -> Self {
      Self { controller }
   }
}

fn fdo(err: BluelinkError) -> zbus::fdo::Error {
   match err {
      BluelinkError::InvalidArgument(msg) => zbus::fdo::Error::InvalidArgs(msg),
      other => zbus::fdo::Error::Failed(other.to_string()),
   }
}

/// Empty string selects the default adapter.
fn adapter_arg(adapter: &str) -> Option<&str> {
   (!adapter.is_empty()).then_some(adapter)
}

/// Negative keeps the current timeout.
fn timeout_arg(timeout: i32) -> Option<u32> {
   u32::try_from(timeout).ok()
}

fn json_array<T>(items: &[T], to_json: impl Fn(&T) -> serde_json::Value) -> String {
   serde_json::Value::Array(items.iter().map(to_json).collect()).to_string()
}

#[interface(name = "org.bluelink.Manager1")]
impl BluelinkService {
   // --- Queries ---

   async fn get_adapters(&self) -> zbus::fdo::Result<String> {
      let adapters = self.controller.adapters().await.map_err(fdo)?;
      Ok(json_array(&adapters, |a| a.to_json()))
   }

   async fn get_devices(&self, adapter: String) -> zbus::fdo::Result<String> {
      let devices = self
         .controller
         .devices(adapter_arg(&adapter))
         .await
         .map_err(fdo)?;
      Ok(json_array(&devices, |d| d.to_json()))
   }

   async fn get_device(&self, device: String) -> zbus::fdo::Result<String> {
      let device = self.controller.device(&device).await.map_err(fdo)?;
      Ok(device.to_json().to_string())
   }

   async fn get_profiles(&self, device: String) -> zbus::fdo::Result<String> {
      let (profiles, active) = self.controller.profiles(&device).await.map_err(fdo)?;
      Ok(serde_json::json!({ "profiles": profiles, "active": active }).to_string())
   }

   async fn get_transfers(&self) -> zbus::fdo::Result<String> {
      let transfers = self.controller.transfers().await.map_err(fdo)?;
      Ok(json_array(&transfers, |t| t.to_json()))
   }

   async fn get_pending_request(&self) -> String {
      self
         .controller
         .agent()
         .pending_request()
         .map(|r| r.to_json().to_string())
         .unwrap_or_default()
   }

   // --- Adapters ---

   async fn set_powered(&self, adapter: String, powered: bool) -> zbus::fdo::Result<bool> {
      self
         .controller
         .set_powered(adapter_arg(&adapter), powered)
         .await
         .map_err(fdo)?;
      info!("Set powered={powered} on {}", adapter_arg(&adapter).unwrap_or("default adapter"));
      Ok(true)
   }

   async fn set_discoverable(&self, adapter: String, on: bool, timeout: i32) -> zbus::fdo::Result<bool> {
      self
         .controller
         .set_discoverable(adapter_arg(&adapter), on, timeout_arg(timeout))
         .await
         .map_err(fdo)?;
      Ok(true)
   }

   async fn set_pairable(&self, adapter: String, on: bool, timeout: i32) -> zbus::fdo::Result<bool> {
      self
         .controller
         .set_pairable(adapter_arg(&adapter), on, timeout_arg(timeout))
         .await
         .map_err(fdo)?;
      Ok(true)
   }

   async fn set_alias(&self, adapter: String, alias: String) -> zbus::fdo::Result<bool> {
      self
         .controller
         .set_alias(adapter_arg(&adapter), &alias)
         .await
         .map_err(fdo)?;
      Ok(true)
   }

   async fn start_discovery(&self, adapter: String) -> zbus::fdo::Result<bool> {
      self
         .controller
         .start_discovery(adapter_arg(&adapter))
         .await
         .map_err(fdo)?;
      Ok(true)
   }

   async fn stop_discovery(&self, adapter: String) -> zbus::fdo::Result<bool> {
      self
         .controller
         .stop_discovery(adapter_arg(&adapter))
         .await
         .map_err(fdo)?;
      Ok(true)
   }

   async fn set_default_adapter(&self, adapter: String) -> zbus::fdo::Result<bool> {
      self.controller.set_default_adapter(&adapter).await.map_err(fdo)?;
      Ok(true)
   }

   // --- Devices ---

   async fn pair(&self, device: String) -> zbus::fdo::Result<bool> {
      self.controller.pair(&device).await.map_err(fdo)?;
      Ok(true)
   }

   async fn unpair(&self, device: String) -> zbus::fdo::Result<bool> {
      self.controller.unpair(&device).await.map_err(fdo)?;
      Ok(true)
   }

   async fn connect_device(&self, device: String) -> zbus::fdo::Result<bool> {
      self.controller.connect(&device).await.map_err(fdo)?;
      Ok(true)
   }

   async fn disconnect_device(&self, device: String) -> zbus::fdo::Result<bool> {
      self.controller.disconnect(&device).await.map_err(fdo)?;
      Ok(true)
   }

   async fn set_trusted(&self, device: String, trusted: bool) -> zbus::fdo::Result<bool> {
      self.controller.set_trusted(&device, trusted).await.map_err(fdo)?;
      Ok(true)
   }

   async fn set_blocked(&self, device: String, blocked: bool) -> zbus::fdo::Result<bool> {
      self.controller.set_blocked(&device, blocked).await.map_err(fdo)?;
      Ok(true)
   }

   // --- Audio ---

   async fn connect_profile(&self, device: String, uuid: String) -> zbus::fdo::Result<bool> {
      self.controller.connect_profile(&device, &uuid).await.map_err(fdo)?;
      Ok(true)
   }

   async fn disconnect_profile(&self, device: String, uuid: String) -> zbus::fdo::Result<bool> {
      self
         .controller
         .disconnect_profile(&device, &uuid)
         .await
         .map_err(fdo)?;
      Ok(true)
   }

   async fn set_active_profile(&self, device: String, uuid: String) -> zbus::fdo::Result<bool> {
      self
         .controller
         .set_active_profile(&device, &uuid)
         .await
         .map_err(fdo)?;
      Ok(true)
   }

   // --- Transfers ---

   async fn send_file(&self, device: String, file: String) -> zbus::fdo::Result<String> {
      let transfer = self
         .controller
         .send_file(&device, PathBuf::from(file))
         .await
         .map_err(fdo)?;
      Ok(transfer.to_json().to_string())
   }

   async fn send_files(&self, device: String, files: Vec<String>) -> zbus::fdo::Result<String> {
      let files = files.into_iter().map(PathBuf::from).collect();
      let transfers = self.controller.send_files(&device, files).await.map_err(fdo)?;
      Ok(json_array(&transfers, |t| t.to_json()))
   }

   async fn cancel_transfer(&self, transfer: String) -> zbus::fdo::Result<bool> {
      self.controller.cancel_transfer(&transfer).await.map_err(fdo)?;
      Ok(true)
   }

   async fn pause_transfer(&self, transfer: String) -> zbus::fdo::Result<bool> {
      self.controller.pause_transfer(&transfer).await.map_err(fdo)?;
      Ok(true)
   }

   async fn resume_transfer(&self, transfer: String) -> zbus::fdo::Result<bool> {
      self.controller.resume_transfer(&transfer).await.map_err(fdo)?;
      Ok(true)
   }

   // --- Pairing responses ---

   async fn provide_pin(&self, pin: String) -> zbus::fdo::Result<bool> {
      self.controller.agent().provide_pin(&pin).map_err(fdo)
   }

   async fn provide_passkey(&self, passkey: u32) -> zbus::fdo::Result<bool> {
      self.controller.agent().provide_passkey(passkey).map_err(fdo)
   }

   async fn confirm(&self, accept: bool) -> bool {
      self.controller.agent().confirm(accept)
   }

   async fn authorize(&self, accept: bool) -> bool {
      self.controller.agent().authorize(accept)
   }

   async fn cancel_pairing(&self) -> bool {
      self.controller.agent().cancel()
   }

   // Signals
   #[zbus(signal)]
   pub async fn transport_connected(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transport_disconnected(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_added(emitter: &SignalEmitter<'_>, adapter: &str, info: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_removed(emitter: &SignalEmitter<'_>, adapter: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_state_changed(
      emitter: &SignalEmitter<'_>,
      adapter: &str,
      info: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_changed(emitter: &SignalEmitter<'_>, adapter: &str, info: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn default_adapter_changed(emitter: &SignalEmitter<'_>, adapter: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_added(emitter: &SignalEmitter<'_>, device: &str, info: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_removed(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_changed(emitter: &SignalEmitter<'_>, device: &str, info: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connection_changed(
      emitter: &SignalEmitter<'_>,
      device: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_paired(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn pairing_requested(emitter: &SignalEmitter<'_>, request: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn pairing_finished(
      emitter: &SignalEmitter<'_>,
      device: &str,
      outcome: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn profiles_changed(
      emitter: &SignalEmitter<'_>,
      device: &str,
      profiles: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn active_profile_changed(
      emitter: &SignalEmitter<'_>,
      device: &str,
      uuid: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transfer_started(emitter: &SignalEmitter<'_>, transfer: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transfer_progress(emitter: &SignalEmitter<'_>, transfer: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transfer_completed(emitter: &SignalEmitter<'_>, transfer: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transfer_failed(
      emitter: &SignalEmitter<'_>,
      transfer: &str,
      reason: &str,
      cancelled: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn error_occurred(emitter: &SignalEmitter<'_>, error: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn agent_state(&self) -> String {
      self.controller.agent().state().to_string()
   }

   #[zbus(property)]
   async fn default_adapter_path(&self) -> String {
      self
         .controller
         .default_adapter()
         .await
         .ok()
         .flatten()
         .map(|a| a.path.to_string())
         .unwrap_or_default()
   }
}
