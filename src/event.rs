//! Event handling system for Bluetooth state updates.
//!
//! Managers publish domain events through an [`EventBus`]; the controller
//! owns the bus and external consumers (the D-Bus service, notifications)
//! subscribe to it.

use std::sync::Arc;

use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   error::DomainError,
   manager::{
      adapter::Adapter,
      agent::PairingRequest,
      audio::AudioProfile,
      device::{ConnectionState, Device},
      transfer::FileTransfer,
   },
};

/// How a pairing exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PairingOutcome {
   Accepted,
   Rejected,
   Cancelled,
   TimedOut,
}

/// Events that can be emitted by the Bluetooth service.
#[derive(Debug, Clone)]
pub enum BluetoothEvent {
   TransportConnected,
   TransportDisconnected,

   AdapterAdded(Adapter),
   AdapterRemoved(SmolStr),
   /// Powered, discoverable or discovering changed.
   AdapterStateChanged(Adapter),
   /// Any other property changed.
   AdapterChanged(Adapter),
   DefaultAdapterChanged(Option<SmolStr>),

   DeviceAdded(Device),
   DeviceRemoved(SmolStr),
   DeviceChanged(Device),
   DeviceConnectionChanged {
      device: SmolStr,
      state: ConnectionState,
   },
   DeviceConnected(SmolStr),
   DeviceDisconnected(SmolStr),
   DevicePaired(SmolStr),

   PairingRequested(PairingRequest),
   PairingFinished {
      device: SmolStr,
      outcome: PairingOutcome,
   },

   ProfilesChanged {
      device: SmolStr,
      profiles: Vec<AudioProfile>,
   },
   ActiveProfileChanged {
      device: SmolStr,
      uuid: Option<Uuid>,
   },

   TransferStarted(FileTransfer),
   TransferProgress(FileTransfer),
   TransferCompleted(FileTransfer),
   TransferFailed {
      transfer: FileTransfer,
      reason: String,
      cancelled: bool,
   },

   Error(DomainError),
}

impl BluetoothEvent {
   /// Short stable name, used for logging and signal routing.
   pub const fn kind(&self) -> &'static str {
      match self {
         Self::TransportConnected => "transport_connected",
         Self::TransportDisconnected => "transport_disconnected",
         Self::AdapterAdded(_) => "adapter_added",
         Self::AdapterRemoved(_) => "adapter_removed",
         Self::AdapterStateChanged(_) => "adapter_state_changed",
         Self::AdapterChanged(_) => "adapter_changed",
         Self::DefaultAdapterChanged(_) => "default_adapter_changed",
         Self::DeviceAdded(_) => "device_added",
         Self::DeviceRemoved(_) => "device_removed",
         Self::DeviceChanged(_) => "device_changed",
         Self::DeviceConnectionChanged { .. } => "device_connection_changed",
         Self::DeviceConnected(_) => "device_connected",
         Self::DeviceDisconnected(_) => "device_disconnected",
         Self::DevicePaired(_) => "device_paired",
         Self::PairingRequested(_) => "pairing_requested",
         Self::PairingFinished { .. } => "pairing_finished",
         Self::ProfilesChanged { .. } => "profiles_changed",
         Self::ActiveProfileChanged { .. } => "active_profile_changed",
         Self::TransferStarted(_) => "transfer_started",
         Self::TransferProgress(_) => "transfer_progress",
         Self::TransferCompleted(_) => "transfer_completed",
         Self::TransferFailed { .. } => "transfer_failed",
         Self::Error(_) => "error",
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: BluetoothEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
