//! Pairing agent.
//!
//! bluetoothd calls into [`PairingAgent`] whenever a pairing needs user
//! input. Each such call becomes a [`PairingRequest`] published on the event
//! bus; the D-Bus handler then waits, for a bounded time, for the user's
//! answer submitted through [`AgentManager`]. Only one exchange can be
//! pending at a time.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::{Duration, SystemTime},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::{sync::oneshot, time};
use zbus::{interface, zvariant::OwnedObjectPath};

use crate::{
   bluez::{
      AGENT_MANAGER_INTERFACE, BLUEZ_ROOT_PATH, DEVICE_INTERFACE,
      transport::{Args, MethodCall, SharedTransport},
   },
   error::{BluelinkError, Result},
   event::{BluetoothEvent, EventSender, PairingOutcome},
};

/// Object path the agent is exported at on the system bus.
pub const AGENT_PATH: &str = "/org/bluelink/agent";
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_PIN_LEN: usize = 16;
pub const MAX_PASSKEY: u32 = 999_999;

const UNKNOWN_DEVICE: &str = "Unknown device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PairingMethod {
   PinCode,
   PinCodeDisplay,
   PasskeyEntry,
   PasskeyDisplay,
   PasskeyConfirmation,
   Authorization,
   ServiceAuthorization,
}

/// One prompt shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingRequest {
   pub id: u64,
   pub device: SmolStr,
   pub name: SmolStr,
   pub method: PairingMethod,
   pub pin: Option<SmolStr>,
   pub passkey: Option<u32>,
   pub entered: Option<u16>,
   pub service: Option<SmolStr>,
   pub created: SystemTime,
}

impl PairingRequest {
   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
   Accept,
   Reject,
   Cancel,
   Pin(SmolStr),
   Passkey(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentState {
   Unregistered,
   Registered,
   AwaitingUserResponse,
}

struct PendingExchange {
   request: PairingRequest,
   reply: oneshot::Sender<AgentResponse>,
}

struct AgentShared {
   transport: SharedTransport,
   events: EventSender,
   capability: SmolStr,
   timeout: Duration,
   registered: AtomicBool,
   registering: AtomicBool,
   pending: Mutex<Option<PendingExchange>>,
   next_id: AtomicU64,
}

/// Registration with bluetoothd and the single pending-exchange slot.
///
/// Cheap to clone; the controller, the D-Bus agent object and the public
/// API all share one instance.
#[derive(Clone)]
pub struct AgentManager {
   inner: Arc<AgentShared>,
}

fn is_already_exists(err: &BluelinkError) -> bool {
   err.remote_name() == Some("org.bluez.Error.AlreadyExists")
      || err.to_string().to_ascii_lowercase().contains("already exists")
}

impl AgentManager {
   pub fn new(transport: SharedTransport, events: EventSender, capability: &str, timeout: Duration) -> Self {
      Self {
         inner: Arc::new(AgentShared {
            transport,
            events,
            capability: SmolStr::new(capability),
            timeout,
            registered: AtomicBool::new(false),
            registering: AtomicBool::new(false),
            pending: Mutex::new(None),
            next_id: AtomicU64::new(1),
         }),
      }
   }

   pub fn state(&self) -> AgentState {
      if !self.inner.registered.load(Ordering::Acquire) {
         AgentState::Unregistered
      } else if self.inner.pending.lock().is_some() {
         AgentState::AwaitingUserResponse
      } else {
         AgentState::Registered
      }
   }

   pub fn pending_request(&self) -> Option<PairingRequest> {
      self.inner.pending.lock().as_ref().map(|p| p.request.clone())
   }

   // === Registration ===

   fn register_call(&self) -> MethodCall {
      MethodCall::new(BLUEZ_ROOT_PATH, AGENT_MANAGER_INTERFACE, "RegisterAgent").args(Args::PathStr(
         SmolStr::new_static(AGENT_PATH),
         self.inner.capability.clone(),
      ))
   }

   fn manager_call(method: &'static str) -> MethodCall {
      MethodCall::new(BLUEZ_ROOT_PATH, AGENT_MANAGER_INTERFACE, method)
         .args(Args::Path(SmolStr::new_static(AGENT_PATH)))
   }

   /// Registers the agent and asks to become the default one.
   ///
   /// A no-op while registered or while another registration is in flight.
   /// A stale registration under our path is dropped and retried once.
   /// Failing to become the default agent is logged, not returned.
   pub async fn register(&self) -> Result<()> {
      if self.inner.registered.load(Ordering::Acquire)
         || self.inner.registering.swap(true, Ordering::AcqRel)
      {
         debug!("Pairing agent already registered");
         return Ok(());
      }
      let result = self.register_inner().await;
      self.inner.registering.store(false, Ordering::Release);
      result
   }

   async fn register_inner(&self) -> Result<()> {
      let transport = &self.inner.transport;
      match transport.invoke(self.register_call()).await {
         Ok(_) => {},
         Err(e) if is_already_exists(&e) => {
            info!("Agent already registered, re-registering");
            if let Err(e) = transport.invoke(Self::manager_call("UnregisterAgent")).await {
               debug!("Unregistering stale agent failed: {e}");
            }
            transport.invoke(self.register_call()).await?;
         },
         Err(e) => return Err(e),
      }
      self.inner.registered.store(true, Ordering::Release);
      info!("Pairing agent registered at {AGENT_PATH} ({})", self.inner.capability);

      if let Err(e) = transport.invoke(Self::manager_call("RequestDefaultAgent")).await {
         warn!("Could not become the default agent: {e}");
      }
      Ok(())
   }

   pub async fn unregister(&self) -> Result<()> {
      if !self.inner.registered.swap(false, Ordering::AcqRel) {
         return Ok(());
      }
      self.cancel();
      self.inner.transport.invoke(Self::manager_call("UnregisterAgent")).await?;
      info!("Pairing agent unregistered");
      Ok(())
   }

   /// bluetoothd dropped the agent (Agent1.Release or daemon exit).
   pub fn release(&self) {
      self.inner.registered.store(false, Ordering::Release);
      self.cancel();
   }

   // === Exchanges ===

   async fn build_request(
      &self,
      device: &str,
      method: PairingMethod,
      fill: impl FnOnce(&mut PairingRequest),
   ) -> PairingRequest {
      let name = match self
         .inner
         .transport
         .get_property(device, DEVICE_INTERFACE, "Alias")
         .await
      {
         Ok(alias) => alias
            .as_str()
            .filter(|a| !a.is_empty())
            .map_or_else(|| SmolStr::new_static(UNKNOWN_DEVICE), SmolStr::new),
         Err(e) => {
            debug!("Alias of {device} unavailable: {e}");
            SmolStr::new_static(UNKNOWN_DEVICE)
         },
      };
      let mut request = PairingRequest {
         id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
         device: SmolStr::new(device),
         name,
         method,
         pin: None,
         passkey: None,
         entered: None,
         service: None,
         created: SystemTime::now(),
      };
      fill(&mut request);
      request
   }

   /// Publishes a display-only prompt. Nothing is awaited.
   async fn notify(&self, device: &str, method: PairingMethod, fill: impl FnOnce(&mut PairingRequest)) {
      let request = self.build_request(device, method, fill).await;
      self.inner.events.emit(BluetoothEvent::PairingRequested(request));
   }

   /// Occupies the slot, publishes the prompt and waits for the answer.
   /// Resolves exactly once: by a response, a cancel, or the timeout.
   async fn exchange(
      &self,
      device: &str,
      method: PairingMethod,
      fill: impl FnOnce(&mut PairingRequest),
   ) -> Result<AgentResponse> {
      let request = self.build_request(device, method, fill).await;
      let id = request.id;
      let (tx, mut rx) = oneshot::channel();
      {
         let mut slot = self.inner.pending.lock();
         if let Some(current) = slot.as_ref() {
            warn!(
               "Rejecting {method} for {device}: {} is still pending for {}",
               current.request.method, current.request.device
            );
            return Err(BluelinkError::AgentBusy);
         }
         *slot = Some(PendingExchange {
            request: request.clone(),
            reply: tx,
         });
      }
      debug!("Awaiting {method} response for {device}");
      self.inner.events.emit(BluetoothEvent::PairingRequested(request));

      match time::timeout(self.inner.timeout, &mut rx).await {
         Ok(Ok(response)) => Ok(response),
         Ok(Err(_)) => Ok(AgentResponse::Cancel),
         Err(_) => {
            let expired = {
               let mut slot = self.inner.pending.lock();
               if slot.as_ref().is_some_and(|p| p.request.id == id) {
                  slot.take()
               } else {
                  None
               }
            };
            if expired.is_some() {
               info!("Pairing request for {device} timed out");
               self.inner.events.emit(BluetoothEvent::PairingFinished {
                  device: SmolStr::new(device),
                  outcome: PairingOutcome::TimedOut,
               });
               return Err(BluelinkError::PairingTimeout);
            }
            // An answer took the slot just as the timer fired.
            Ok(rx.await.unwrap_or(AgentResponse::Cancel))
         },
      }
   }

   /// Hands `response` to the pending exchange if its method accepts it.
   fn resolve(&self, accepts: impl Fn(PairingMethod) -> bool, response: AgentResponse) -> bool {
      let pending = {
         let mut slot = self.inner.pending.lock();
         let method = slot.as_ref().map(|p| p.request.method);
         match method {
            Some(method) if accepts(method) => slot.take(),
            Some(method) => {
               debug!("Ignoring {response:?} for pending {method}");
               None
            },
            None => None,
         }
      };
      let Some(pending) = pending else {
         return false;
      };

      let outcome = match response {
         AgentResponse::Reject => PairingOutcome::Rejected,
         AgentResponse::Cancel => PairingOutcome::Cancelled,
         _ => PairingOutcome::Accepted,
      };
      if pending.reply.send(response).is_err() {
         debug!("Pairing handler for {} already gone", pending.request.device);
      }
      self.inner.events.emit(BluetoothEvent::PairingFinished {
         device: pending.request.device,
         outcome,
      });
      true
   }

   pub fn provide_pin(&self, pin: &str) -> Result<bool> {
      if pin.is_empty() || pin.len() > MAX_PIN_LEN || !pin.is_ascii() {
         return Err(BluelinkError::InvalidArgument(format!(
            "PIN must be 1..={MAX_PIN_LEN} ASCII characters"
         )));
      }
      Ok(self.resolve(|m| m == PairingMethod::PinCode, AgentResponse::Pin(SmolStr::new(pin))))
   }

   pub fn provide_passkey(&self, passkey: u32) -> Result<bool> {
      if passkey > MAX_PASSKEY {
         return Err(BluelinkError::InvalidArgument(format!(
            "passkey {passkey} exceeds {MAX_PASSKEY}"
         )));
      }
      Ok(self.resolve(|m| m == PairingMethod::PasskeyEntry, AgentResponse::Passkey(passkey)))
   }

   pub fn confirm(&self, accept: bool) -> bool {
      let response = if accept { AgentResponse::Accept } else { AgentResponse::Reject };
      self.resolve(|m| m == PairingMethod::PasskeyConfirmation, response)
   }

   pub fn authorize(&self, accept: bool) -> bool {
      let response = if accept { AgentResponse::Accept } else { AgentResponse::Reject };
      self.resolve(
         |m| matches!(m, PairingMethod::Authorization | PairingMethod::ServiceAuthorization),
         response,
      )
   }

   /// Rejects and clears whatever exchange is pending.
   pub fn cancel(&self) -> bool {
      self.resolve(|_| true, AgentResponse::Cancel)
   }

   // === Callbacks ===

   fn accepted(response: AgentResponse) -> Result<()> {
      match response {
         AgentResponse::Accept => Ok(()),
         AgentResponse::Cancel => Err(BluelinkError::AuthorizationCancelled("pairing".into())),
         _ => Err(BluelinkError::PairingRejected),
      }
   }

   pub async fn request_pin_code(&self, device: &str) -> Result<SmolStr> {
      match self.exchange(device, PairingMethod::PinCode, |_| {}).await? {
         AgentResponse::Pin(pin) => Ok(pin),
         other => Self::accepted(other).and(Err(BluelinkError::PairingRejected)),
      }
   }

   pub async fn display_pin_code(&self, device: &str, pin: &str) {
      self
         .notify(device, PairingMethod::PinCodeDisplay, |r| r.pin = Some(SmolStr::new(pin)))
         .await;
   }

   pub async fn request_passkey(&self, device: &str) -> Result<u32> {
      match self.exchange(device, PairingMethod::PasskeyEntry, |_| {}).await? {
         AgentResponse::Passkey(passkey) => Ok(passkey),
         other => Self::accepted(other).and(Err(BluelinkError::PairingRejected)),
      }
   }

   pub async fn display_passkey(&self, device: &str, passkey: u32, entered: u16) {
      self
         .notify(device, PairingMethod::PasskeyDisplay, |r| {
            r.passkey = Some(passkey);
            r.entered = Some(entered);
         })
         .await;
   }

   pub async fn request_confirmation(&self, device: &str, passkey: u32) -> Result<()> {
      let response = self
         .exchange(device, PairingMethod::PasskeyConfirmation, |r| r.passkey = Some(passkey))
         .await?;
      Self::accepted(response)
   }

   pub async fn request_authorization(&self, device: &str) -> Result<()> {
      let response = self.exchange(device, PairingMethod::Authorization, |_| {}).await?;
      Self::accepted(response)
   }

   pub async fn authorize_service(&self, device: &str, uuid: &str) -> Result<()> {
      let response = self
         .exchange(device, PairingMethod::ServiceAuthorization, |r| {
            r.service = Some(SmolStr::new(uuid));
         })
         .await?;
      Self::accepted(response)
   }
}

// === D-Bus object ===

#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluez.Error")]
pub enum AgentError {
   #[zbus(error)]
   ZBus(zbus::Error),
   Rejected(String),
   Canceled(String),
}

impl From<BluelinkError> for AgentError {
   fn from(err: BluelinkError) -> Self {
      match err {
         BluelinkError::AuthorizationCancelled(_) => Self::Canceled(err.to_string()),
         other => Self::Rejected(other.to_string()),
      }
   }
}

/// `org.bluez.Agent1` implementation exported at [`AGENT_PATH`].
pub struct PairingAgent {
   agent: AgentManager,
}

impl PairingAgent {
   pub const fn new(agent: AgentManager) -> Self {
      Self { agent }
   }
}

#[interface(name = "org.bluez.Agent1")]
impl PairingAgent {
   async fn release(&self) {
      info!("Agent released by bluetoothd");
      self.agent.release();
   }

   async fn request_pin_code(&self, device: OwnedObjectPath) -> std::result::Result<String, AgentError> {
      Ok(self.agent.request_pin_code(device.as_str()).await?.to_string())
   }

   async fn display_pin_code(&self, device: OwnedObjectPath, pincode: String) {
      self.agent.display_pin_code(device.as_str(), &pincode).await;
   }

   async fn request_passkey(&self, device: OwnedObjectPath) -> std::result::Result<u32, AgentError> {
      Ok(self.agent.request_passkey(device.as_str()).await?)
   }

   async fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
      self.agent.display_passkey(device.as_str(), passkey, entered).await;
   }

   async fn request_confirmation(
      &self,
      device: OwnedObjectPath,
      passkey: u32,
   ) -> std::result::Result<(), AgentError> {
      Ok(self.agent.request_confirmation(device.as_str(), passkey).await?)
   }

   async fn request_authorization(&self, device: OwnedObjectPath) -> std::result::Result<(), AgentError> {
      Ok(self.agent.request_authorization(device.as_str()).await?)
   }

   async fn authorize_service(
      &self,
      device: OwnedObjectPath,
      uuid: String,
   ) -> std::result::Result<(), AgentError> {
      Ok(self.agent.authorize_service(device.as_str(), &uuid).await?)
   }

   async fn cancel(&self) {
      debug!("bluetoothd cancelled the pending request");
      self.agent.cancel();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{bluez::value::PropValue, testing::*};

   fn agent(mock: &Arc<MockTransport>, bus: &Arc<RecordingBus>, timeout: Duration) -> AgentManager {
      AgentManager::new(mock.clone(), bus.clone(), "KeyboardDisplay", timeout)
   }

   async fn wait_pending(agent: &AgentManager) -> PairingRequest {
      for _ in 0..200 {
         if let Some(request) = agent.pending_request() {
            return request;
         }
         time::sleep(Duration::from_millis(5)).await;
      }
      panic!("no pairing request became pending");
   }

   #[tokio::test]
   async fn test_already_exists_reregisters() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      mock.fail_call(
         "RegisterAgent",
         MockFailure::Remote("org.bluez.Error.AlreadyExists", "Already Exists"),
      );
      mock.fail_call_always(
         "RequestDefaultAgent",
         MockFailure::Remote("org.bluez.Error.DoesNotExist", "No such agent"),
      );
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);

      agent.register().await.unwrap();
      assert_eq!(
         mock.methods(),
         vec!["RegisterAgent", "UnregisterAgent", "RegisterAgent", "RequestDefaultAgent"]
      );
      assert_eq!(agent.state(), AgentState::Registered);
      assert_eq!(
         mock.calls()[0].args,
         Args::PathStr(AGENT_PATH.into(), "KeyboardDisplay".into())
      );
   }

   #[tokio::test]
   async fn test_already_exists_by_message_only() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      mock.fail_call("RegisterAgent", MockFailure::Remote("org.bluez.Error.Failed", "Agent already exists"));
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);
      agent.register().await.unwrap();
      assert_eq!(mock.call_count("RegisterAgent"), 2);
   }

   #[tokio::test]
   async fn test_register_while_registered_is_a_noop() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);
      agent.register().await.unwrap();
      mock.fail_call("RegisterAgent", MockFailure::Remote("org.bluez.Error.AlreadyExists", "Already Exists"));

      agent.register().await.unwrap();
      assert_eq!(mock.call_count("RegisterAgent"), 1);
      assert_eq!(mock.call_count("UnregisterAgent"), 0);
      assert_eq!(agent.state(), AgentState::Registered);

      agent.release();
      agent.register().await.unwrap();
      assert_eq!(mock.call_count("UnregisterAgent"), 1);
      assert_eq!(agent.state(), AgentState::Registered);
   }

   #[tokio::test]
   async fn test_registration_failure_is_returned() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      mock.fail_call_always("RegisterAgent", MockFailure::Remote("org.bluez.Error.InvalidArguments", ""));
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);
      assert!(agent.register().await.is_err());
      assert_eq!(agent.state(), AgentState::Unregistered);
   }

   #[tokio::test]
   async fn test_timeout_rejects_exactly_once() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      let agent = agent(&mock, &bus, Duration::from_millis(50));

      let err = agent.request_confirmation(HEADPHONES, 123_456).await.unwrap_err();
      assert!(matches!(err, BluelinkError::PairingTimeout));
      assert!(!agent.confirm(true));
      assert!(!agent.cancel());
      assert_eq!(bus.count("pairing_requested"), 1);
      assert_eq!(bus.count("pairing_finished"), 1);
      assert_eq!(RESPONSE_TIMEOUT, Duration::from_secs(30));
   }

   #[tokio::test]
   async fn test_passkey_response_resolves_handler() {
      let mock = MockTransport::new();
      mock.add_object(HEADPHONES, DEVICE_INTERFACE, props([("Alias", PropValue::str("Buds"))]));
      let bus = RecordingBus::new();
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);
      agent.inner.registered.store(true, Ordering::Release);

      let handler = tokio::spawn({
         let agent = agent.clone();
         async move { agent.request_passkey(HEADPHONES).await }
      });
      let request = wait_pending(&agent).await;
      assert_eq!(request.name, "Buds");
      assert_eq!(request.method, PairingMethod::PasskeyEntry);
      assert_eq!(agent.state(), AgentState::AwaitingUserResponse);

      // Wrong kind of answer is ignored, the right one resolves.
      assert!(!agent.confirm(true));
      assert!(agent.provide_passkey(1_000_000).is_err());
      assert!(agent.provide_passkey(4321).unwrap());
      assert!(!agent.provide_passkey(4321).unwrap());

      assert_eq!(handler.await.unwrap().unwrap(), 4321);
      assert_eq!(agent.state(), AgentState::Registered);
   }

   #[tokio::test]
   async fn test_second_exchange_is_rejected() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);

      let first = tokio::spawn({
         let agent = agent.clone();
         async move { agent.request_authorization(HEADPHONES).await }
      });
      let request = wait_pending(&agent).await;
      assert_eq!(request.name, UNKNOWN_DEVICE);

      let second = agent.request_pin_code(PHONE).await;
      assert!(matches!(second, Err(BluelinkError::AgentBusy)));
      assert_eq!(agent.pending_request().map(|r| r.id), Some(request.id));

      assert!(agent.cancel());
      assert!(matches!(
         first.await.unwrap(),
         Err(BluelinkError::AuthorizationCancelled(_))
      ));
   }

   #[tokio::test]
   async fn test_display_callbacks_return_immediately() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);
      agent.display_passkey(HEADPHONES, 12, 3).await;
      agent.display_pin_code(HEADPHONES, "0000").await;
      assert!(agent.pending_request().is_none());
      assert_eq!(bus.count("pairing_requested"), 2);
   }

   #[tokio::test]
   async fn test_pin_validation_and_release() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      let agent = agent(&mock, &bus, RESPONSE_TIMEOUT);
      agent.register().await.unwrap();

      assert!(agent.provide_pin("").is_err());
      assert!(agent.provide_pin(&"1".repeat(MAX_PIN_LEN + 1)).is_err());
      assert!(!agent.provide_pin("0000").unwrap());

      let handler = tokio::spawn({
         let agent = agent.clone();
         async move { agent.request_pin_code(HEADPHONES).await }
      });
      wait_pending(&agent).await;
      agent.release();
      assert_eq!(agent.state(), AgentState::Unregistered);
      assert!(handler.await.unwrap().is_err());
   }
}
