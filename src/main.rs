//! Bluetooth device-lifecycle daemon.
//!
//! This service keeps a live model of the BlueZ adapters, devices, audio
//! profiles and OBEX transfers, acts as the system pairing agent, and
//! exposes all of it on the session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluez::{client::BusClient, transport::SharedTransport};
use config::ConfigStore;
use dbus::{BluelinkService, MANAGER_PATH};
use event::{BluetoothEvent, EventBus};
use manager::{
   agent::{AGENT_PATH, AgentManager, PairingAgent},
   controller::{AuthorizationPolicy, ConfigPolicy, Controller},
};

mod bluez;
mod config;
mod dbus;
mod error;
mod event;
mod manager;
#[cfg(test)]
mod testing;

use crate::{
   dbus::BluelinkServiceSignals,
   error::{BluelinkError, Result},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting bluelinkd...");

   // Load configuration
   let store = Arc::new(ConfigStore::load()?);
   let config = store.snapshot();
   info!(
      "Loaded configuration with {} trusted and {} blocked device(s)",
      config.trusted_devices.len(),
      config.blocked_devices.len()
   );

   let event_bus = EventProcessor::new();

   let client = BusClient::new(config.reconnect.policy());
   let transport: SharedTransport = Arc::new(client.clone());
   let agent = AgentManager::new(
      transport.clone(),
      event_bus.clone(),
      &config.agent_capability,
      config.pairing_timeout(),
   );
   let policy: Arc<dyn AuthorizationPolicy> = Arc::new(ConfigPolicy::new(store.clone()));

   // Agent1 has to be on the bus before RegisterAgent goes out, on the
   // first connect and on every reconnect.
   let exported = agent.clone();
   client.on_system_connection(move |system| {
      let agent = exported.clone();
      async move {
         if system.object_server().at(AGENT_PATH, PairingAgent::new(agent)).await? {
            info!("Pairing agent exported at {AGENT_PATH}");
         }
         Ok::<(), BluelinkError>(())
      }
      .boxed()
   });

   // The controller subscribes to bus signals before the first connect.
   let controller = Controller::new(transport, event_bus.clone(), store, agent.clone(), policy);
   if let Err(e) = client.connect().await {
      warn!("bluetoothd not reachable yet, retrying in the background: {e}");
   }

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.bluelink")?
      .serve_at(MANAGER_PATH, BluelinkService::new(controller))?
      .build()
      .await?;

   info!("bluelinkd D-Bus service started at org.bluelink");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down bluelinkd...");

   if let Err(e) = agent.unregister().await {
      debug!("Failed to unregister pairing agent: {e}");
   }
   client.shutdown();
   Ok(())
}

struct EventProcessor {
   queue: SegQueue<BluetoothEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<BluetoothEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<BluelinkService>, event: BluetoothEvent) -> Result<()> {
      match event {
         BluetoothEvent::TransportConnected => iface.transport_connected().await?,
         BluetoothEvent::TransportDisconnected => iface.transport_disconnected().await?,
         BluetoothEvent::AdapterAdded(adapter) => {
            iface
               .adapter_added(&adapter.path, &adapter.to_json().to_string())
               .await?;
         },
         BluetoothEvent::AdapterRemoved(path) => iface.adapter_removed(&path).await?,
         BluetoothEvent::AdapterStateChanged(adapter) => {
            iface
               .adapter_state_changed(&adapter.path, &adapter.to_json().to_string())
               .await?;
         },
         BluetoothEvent::AdapterChanged(adapter) => {
            iface
               .adapter_changed(&adapter.path, &adapter.to_json().to_string())
               .await?;
         },
         BluetoothEvent::DefaultAdapterChanged(path) => {
            iface
               .default_adapter_changed(path.as_deref().unwrap_or_default())
               .await?;
         },
         BluetoothEvent::DeviceAdded(device) => {
            iface
               .device_added(&device.path, &device.to_json().to_string())
               .await?;
         },
         BluetoothEvent::DeviceRemoved(path) => iface.device_removed(&path).await?,
         BluetoothEvent::DeviceChanged(device) => {
            iface
               .device_changed(&device.path, &device.to_json().to_string())
               .await?;
         },
         BluetoothEvent::DeviceConnectionChanged { device, state } => {
            iface
               .device_connection_changed(&device, &state.to_string())
               .await?;
         },
         BluetoothEvent::DeviceConnected(path) => iface.device_connected(&path).await?,
         BluetoothEvent::DeviceDisconnected(path) => iface.device_disconnected(&path).await?,
         BluetoothEvent::DevicePaired(path) => iface.device_paired(&path).await?,
         BluetoothEvent::PairingRequested(request) => {
            iface.pairing_requested(&request.to_json().to_string()).await?;
         },
         BluetoothEvent::PairingFinished { device, outcome } => {
            iface.pairing_finished(&device, &outcome.to_string()).await?;
         },
         BluetoothEvent::ProfilesChanged { device, profiles } => {
            let profiles = serde_json::to_string(&profiles).unwrap_or_default();
            iface.profiles_changed(&device, &profiles).await?;
         },
         BluetoothEvent::ActiveProfileChanged { device, uuid } => {
            let uuid = uuid.map(|u| u.to_string()).unwrap_or_default();
            iface.active_profile_changed(&device, &uuid).await?;
         },
         BluetoothEvent::TransferStarted(transfer) => {
            iface.transfer_started(&transfer.to_json().to_string()).await?;
         },
         BluetoothEvent::TransferProgress(transfer) => {
            iface.transfer_progress(&transfer.to_json().to_string()).await?;
         },
         BluetoothEvent::TransferCompleted(transfer) => {
            iface.transfer_completed(&transfer.to_json().to_string()).await?;
         },
         BluetoothEvent::TransferFailed {
            transfer,
            reason,
            cancelled,
         } => {
            iface
               .transfer_failed(&transfer.to_json().to_string(), &reason, cancelled)
               .await?;
         },
         BluetoothEvent::Error(error) => {
            iface.error_occurred(&error.to_json().to_string()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BluelinkService>(MANAGER_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            let kind = event.kind();
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching {kind} event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: BluetoothEvent) {
      debug!("Event: {}", event.kind());
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
