//! OBEX file transfers.
//!
//! Outbound transfers go through an Object Push session created on obexd
//! for the target device. Inbound transfers show up as `Transfer1` objects
//! under obexd's server tree. Both are tracked by object path until they
//! reach a terminal state.

use std::{
   collections::{BTreeMap, HashMap},
   path::{Path, PathBuf},
   str::FromStr,
   time::SystemTime,
};

use futures::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   bluez::{
      DEVICE_INTERFACE, OBEX_CLIENT_INTERFACE, OBEX_CLIENT_PATH, OBEX_OBJECT_PUSH_INTERFACE,
      OBEX_SESSION_INTERFACE, OBEX_TRANSFER_INTERFACE,
      transport::{Args, BusSignal, MethodCall, SharedTransport},
      value::{PropertyMap, PropertyMapExt},
   },
   error::{BluelinkError, Result},
   event::{BluetoothEvent, EventSender},
   manager::RemoteOp,
};

/// OBEX target for Object Push.
const OPP_TARGET: &str = "opp";

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferStatus {
   Queued,
   Active,
   Suspended,
   Complete,
   Error,
}

impl TransferStatus {
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Complete | Self::Error)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferDirection {
   Send,
   Receive,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileTransfer {
   pub path: SmolStr,
   pub session: SmolStr,
   /// Device object path for outbound transfers, peer address for inbound
   /// ones when obexd reported it.
   pub device: SmolStr,
   pub name: SmolStr,
   pub filename: Option<PathBuf>,
   pub size: Option<u64>,
   pub transferred: u64,
   pub status: TransferStatus,
   pub direction: TransferDirection,
   pub started: SystemTime,
   pub finished: Option<SystemTime>,
}

impl FileTransfer {
   /// Percentage done, when the size is known.
   pub fn progress(&self) -> Option<f64> {
      match self.size {
         Some(0) if self.status == TransferStatus::Complete => Some(100.0),
         Some(size) if size > 0 => Some((self.transferred as f64 / size as f64 * 100.0).min(100.0)),
         _ => None,
      }
   }

   /// Bytes per second since the transfer was created.
   pub fn throughput(&self, now: SystemTime) -> Option<f64> {
      let end = self.finished.unwrap_or(now);
      let elapsed = end.duration_since(self.started).ok()?.as_secs_f64();
      (elapsed > 0.0).then(|| self.transferred as f64 / elapsed)
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut value = serde_json::to_value(self).unwrap_or_default();
      if let Some(map) = value.as_object_mut() {
         map.insert("progress".into(), self.progress().into());
         map.insert("throughput".into(), self.throughput(SystemTime::now()).into());
      }
      value
   }

   fn apply(&mut self, changed: &PropertyMap) -> bool {
      let mut progressed = false;
      if let Some(size) = changed.u64_prop("Size") {
         self.size = Some(size);
      }
      if let Some(name) = changed.str_prop("Name") {
         self.name = SmolStr::new(name);
      }
      if let Some(filename) = changed.str_prop("Filename") {
         self.filename = Some(PathBuf::from(filename));
      }
      if let Some(transferred) = changed.u64_prop("Transferred")
         && transferred > self.transferred
      {
         self.transferred = transferred;
         progressed = true;
      }
      progressed
   }
}

/// Outcome of a successful `SendFile`.
#[derive(Debug, Clone)]
pub struct Outbound {
   pub transfer: SmolStr,
   pub session: SmolStr,
   pub device: SmolStr,
   pub file: PathBuf,
   pub size: Option<u64>,
}

fn parse_status(props: &PropertyMap) -> Option<TransferStatus> {
   props.str_prop("Status").and_then(|s| TransferStatus::from_str(s).ok())
}

fn is_client_object(path: &str) -> bool {
   path.starts_with(OBEX_CLIENT_PATH) && path[OBEX_CLIENT_PATH.len()..].starts_with("/client/")
}

async fn remove_session(transport: &SharedTransport, session: &str) {
   let call = MethodCall::new(OBEX_CLIENT_PATH, OBEX_CLIENT_INTERFACE, "RemoveSession")
      .args(Args::Path(SmolStr::new(session)));
   if let Err(e) = transport.invoke(call).await {
      debug!("Removing OBEX session {session} failed: {e}");
   }
}

pub struct TransferManager {
   transport: SharedTransport,
   events: EventSender,
   transfers: BTreeMap<SmolStr, FileTransfer>,
   /// session path -> peer address
   sessions: HashMap<SmolStr, SmolStr>,
   /// Properties of our own transfers seen before `SendFile` returned.
   unclaimed: HashMap<SmolStr, PropertyMap>,
   /// Cancels awaiting obexd: transfer path -> outbound session.
   cancelling: HashMap<SmolStr, Option<SmolStr>>,
   teardown: Vec<SmolStr>,
}

impl TransferManager {
   pub fn new(transport: SharedTransport, events: EventSender) -> Self {
      Self {
         transport,
         events,
         transfers: BTreeMap::new(),
         sessions: HashMap::new(),
         unclaimed: HashMap::new(),
         cancelling: HashMap::new(),
         teardown: Vec::new(),
      }
   }

   pub fn transfers(&self) -> Vec<FileTransfer> {
      self.transfers.values().cloned().collect()
   }

   pub fn transfer(&self, path: &str) -> Option<&FileTransfer> {
      self.transfers.get(path)
   }

   pub fn require(&self, path: &str) -> Result<&FileTransfer> {
      self
         .transfers
         .get(path)
         .ok_or_else(|| BluelinkError::TransferNotFound(SmolStr::new(path)))
   }

   // === Sending ===

   /// Validates `file` locally and returns the session setup plus
   /// `SendFile`. A failed `SendFile` removes the session it created.
   pub fn begin_send(&self, device: &str, file: &Path) -> Result<RemoteOp<Outbound>> {
      let metadata = match std::fs::metadata(file) {
         Ok(m) if m.is_file() => m,
         _ => return Err(BluelinkError::FileNotFound(file.to_path_buf())),
      };
      let source = file
         .to_str()
         .map(SmolStr::new)
         .ok_or_else(|| BluelinkError::InvalidArgument(format!("{} is not valid UTF-8", file.display())))?;

      let transport = self.transport.clone();
      let device = SmolStr::new(device);
      let file = file.to_path_buf();
      let size = Some(metadata.len());
      Ok(async move {
         let address = transport.get_property(&device, DEVICE_INTERFACE, "Address").await?;
         let address = address
            .as_str()
            .and_then(|a| bluer::Address::from_str(a).ok())
            .ok_or_else(|| BluelinkError::InvalidArgument(format!("{device} has no usable address")))?;

         let create = MethodCall::new(OBEX_CLIENT_PATH, OBEX_CLIENT_INTERFACE, "CreateSession").args(
            Args::Session {
               destination: SmolStr::new(address.to_string()),
               target: SmolStr::new_static(OPP_TARGET),
            },
         );
         let session = transport.invoke(create).await?.into_path().ok_or_else(|| {
            BluelinkError::remote("org.bluez.obex.Error.Failed", "CreateSession returned no session")
         })?;

         let send = MethodCall::new(session.clone(), OBEX_OBJECT_PUSH_INTERFACE, "SendFile")
            .args(Args::Str(source));
         let sent = transport.invoke(send).await.and_then(|reply| {
            reply.into_path().ok_or_else(|| {
               BluelinkError::remote("org.bluez.obex.Error.Failed", "SendFile returned no transfer")
            })
         });
         match sent {
            Ok(transfer) => Ok(Outbound {
               transfer,
               session,
               device,
               file,
               size,
            }),
            Err(e) => {
               remove_session(&transport, &session).await;
               Err(e)
            },
         }
      }
      .boxed())
   }

   pub fn finish_send(&mut self, result: Result<Outbound>) -> Result<FileTransfer> {
      let outbound = result?;
      let name = outbound
         .file
         .file_name()
         .map(|n| SmolStr::new(n.to_string_lossy()))
         .unwrap_or_default();
      let mut transfer = FileTransfer {
         path: outbound.transfer.clone(),
         session: outbound.session,
         device: outbound.device,
         name,
         filename: Some(outbound.file),
         size: outbound.size,
         transferred: 0,
         status: TransferStatus::Queued,
         direction: TransferDirection::Send,
         started: SystemTime::now(),
         finished: None,
      };
      let early = self.unclaimed.remove(&outbound.transfer);
      if let Some(props) = &early {
         transfer.apply(props);
      }
      info!("Sending {} to {} as {}", transfer.name, transfer.device, transfer.path);
      self.transfers.insert(transfer.path.clone(), transfer.clone());
      self.events.emit(BluetoothEvent::TransferStarted(transfer.clone()));

      if let Some(props) = early
         && parse_status(&props).is_some()
      {
         self.update(&transfer.path, &props);
      }
      Ok(self.transfers.get(&transfer.path).cloned().unwrap_or(transfer))
   }

   /// Sends each file in turn; failures are logged and skipped.
   pub fn begin_send_files(&self, device: &str, files: &[PathBuf]) -> RemoteOp<Vec<Result<Outbound>>> {
      let ops: Vec<_> = files.iter().map(|f| self.begin_send(device, f)).collect();
      async move {
         let mut results = Vec::with_capacity(ops.len());
         for op in ops {
            results.push(match op {
               Ok(op) => op.await,
               Err(e) => Err(e),
            });
         }
         Ok(results)
      }
      .boxed()
   }

   pub fn finish_send_files(&mut self, result: Result<Vec<Result<Outbound>>>) -> Result<Vec<FileTransfer>> {
      let mut started = Vec::new();
      for outcome in result? {
         match self.finish_send(outcome) {
            Ok(transfer) => started.push(transfer),
            Err(e) => warn!("Skipping file: {e}"),
         }
      }
      Ok(started)
   }

   // === Control ===

   /// A transfer that ends while the cancel is in flight is reported as
   /// cancelled, and its session is left to this operation.
   pub fn begin_cancel(&mut self, path: &str) -> Result<RemoteOp<()>> {
      let transfer = self.require(path)?;
      if transfer.status.is_terminal() {
         return Err(BluelinkError::Precondition(format!("{path} already finished")));
      }
      let transport = self.transport.clone();
      let call = MethodCall::new(path, OBEX_TRANSFER_INTERFACE, "Cancel");
      let session = (transfer.direction == TransferDirection::Send).then(|| transfer.session.clone());
      self.cancelling.insert(SmolStr::new(path), session.clone());
      Ok(async move {
         transport.invoke(call).await?;
         if let Some(session) = session {
            remove_session(&transport, &session).await;
         }
         Ok(())
      }
      .boxed())
   }

   pub fn finish_cancel(&mut self, path: &str, result: Result<()>) -> Result<()> {
      let session = self.cancelling.remove(path).flatten();
      let ended = !self.transfers.contains_key(path);
      match result {
         Ok(()) => {
            if !ended {
               info!("Cancelled transfer {path}");
               self.fail(path, "Cancelled by user", true);
            }
            Ok(())
         },
         Err(e) if ended => {
            debug!("Cancel of {path} failed after it ended: {e}");
            self.teardown.extend(session);
            Ok(())
         },
         Err(e) => Err(e),
      }
   }

   fn begin_control(
      &self,
      path: &str,
      method: &'static str,
      from: TransferStatus,
   ) -> Result<RemoteOp<()>> {
      let transfer = self.require(path)?;
      if transfer.status != from {
         return Err(BluelinkError::Precondition(format!(
            "{method} needs a {from} transfer, {path} is {}",
            transfer.status
         )));
      }
      let transport = self.transport.clone();
      let call = MethodCall::new(path, OBEX_TRANSFER_INTERFACE, method);
      Ok(async move {
         transport.invoke(call).await?;
         Ok(())
      }
      .boxed())
   }

   pub fn begin_pause(&self, path: &str) -> Result<RemoteOp<()>> {
      self.begin_control(path, "Suspend", TransferStatus::Active)
   }

   pub fn begin_resume(&self, path: &str) -> Result<RemoteOp<()>> {
      self.begin_control(path, "Resume", TransferStatus::Suspended)
   }

   pub fn finish_pause(&mut self, path: &str, result: Result<()>) -> Result<()> {
      result?;
      self.set_status(path, TransferStatus::Suspended);
      Ok(())
   }

   pub fn finish_resume(&mut self, path: &str, result: Result<()>) -> Result<()> {
      result?;
      self.set_status(path, TransferStatus::Active);
      Ok(())
   }

   // === Model ===

   fn set_status(&mut self, path: &str, status: TransferStatus) {
      if let Some(transfer) = self.transfers.get_mut(path)
         && !transfer.status.is_terminal()
         && transfer.status != status
      {
         transfer.status = status;
         self.events.emit(BluetoothEvent::TransferProgress(transfer.clone()));
      }
   }

   fn update(&mut self, path: &str, changed: &PropertyMap) {
      let status = parse_status(changed);
      if status == Some(TransferStatus::Error) {
         self.fail(path, "Transfer failed", false);
         return;
      }
      let Some(transfer) = self.transfers.get_mut(path) else {
         return;
      };
      if transfer.status.is_terminal() {
         return;
      }

      let mut progressed = transfer.apply(changed);
      match status {
         Some(TransferStatus::Complete) => {
            transfer.status = TransferStatus::Complete;
            if let Some(size) = transfer.size {
               transfer.transferred = transfer.transferred.max(size);
            }
            transfer.finished = Some(SystemTime::now());
            info!("Transfer {path} complete ({} bytes)", transfer.transferred);
            let done = transfer.clone();
            if done.direction == TransferDirection::Send {
               self.teardown.push(done.session.clone());
            }
            self.events.emit(BluetoothEvent::TransferCompleted(done));
            return;
         },
         Some(status) if status != transfer.status => {
            transfer.status = status;
            progressed = true;
         },
         _ => {},
      }
      if progressed {
         self.events.emit(BluetoothEvent::TransferProgress(transfer.clone()));
      }
   }

   /// Marks a transfer failed, publishes the failure and forgets it.
   fn fail(&mut self, path: &str, reason: &str, cancelled: bool) {
      let Some(mut transfer) = self.transfers.remove(path) else {
         return;
      };
      let cancelled = cancelled || self.cancelling.contains_key(path);
      let reason = if cancelled { "Cancelled by user" } else { reason };
      transfer.status = TransferStatus::Error;
      transfer.finished = Some(SystemTime::now());
      if !cancelled {
         warn!("Transfer {path} failed: {reason}");
         if transfer.direction == TransferDirection::Send {
            self.teardown.push(transfer.session.clone());
         }
      }
      self.events.emit(BluetoothEvent::TransferFailed {
         transfer,
         reason: reason.to_owned(),
         cancelled,
      });
   }

   fn track_inbound(&mut self, path: &str, props: &PropertyMap) {
      let session = SmolStr::new(props.str_prop("Session").unwrap_or_default());
      let device = self.sessions.get(&session).cloned().unwrap_or_default();
      let mut transfer = FileTransfer {
         path: SmolStr::new(path),
         session,
         device,
         name: SmolStr::default(),
         filename: None,
         size: None,
         transferred: 0,
         status: parse_status(props).unwrap_or(TransferStatus::Queued),
         direction: TransferDirection::Receive,
         started: SystemTime::now(),
         finished: None,
      };
      transfer.apply(props);
      info!("Incoming transfer {} ({path})", transfer.name);
      self.transfers.insert(transfer.path.clone(), transfer.clone());
      self.events.emit(BluetoothEvent::TransferStarted(transfer));
   }

   pub fn handle_signal(&mut self, signal: &BusSignal) {
      match signal {
         BusSignal::ObjectAdded { path, interfaces } => {
            if let Some(props) = interfaces.get(OBEX_SESSION_INTERFACE)
               && let Some(destination) = props.str_prop("Destination")
            {
               self.sessions.insert(path.clone(), SmolStr::new(destination));
            }
            if let Some(props) = interfaces.get(OBEX_TRANSFER_INTERFACE) {
               if self.transfers.contains_key(path) {
                  self.update(path, props);
               } else if is_client_object(path) {
                  self.unclaimed.entry(path.clone()).or_default().extend(props.clone());
               } else {
                  self.track_inbound(path, props);
               }
            }
         },
         BusSignal::ObjectRemoved { path, interfaces } => {
            if interfaces.iter().any(|i| i == OBEX_SESSION_INTERFACE) {
               self.sessions.remove(path);
            }
            if interfaces.iter().any(|i| i == OBEX_TRANSFER_INTERFACE) {
               self.unclaimed.remove(path);
               let vanished = self
                  .transfers
                  .get(path)
                  .map(|t| matches!(t.status, TransferStatus::Queued | TransferStatus::Active));
               match vanished {
                  Some(true) => self.fail(path, "Transfer object disappeared", false),
                  Some(false) if self.cancelling.contains_key(path) => {
                     self.fail(path, "Cancelled by user", true);
                  },
                  Some(false) => {
                     self.transfers.remove(path);
                  },
                  None => {},
               }
            }
         },
         BusSignal::PropertiesChanged {
            path,
            interface,
            changed,
            ..
         } if interface == OBEX_TRANSFER_INTERFACE => {
            if self.transfers.contains_key(path) {
               self.update(path, changed);
            } else if is_client_object(path) {
               self.unclaimed.entry(path.clone()).or_default().extend(changed.clone());
            }
         },
         _ => {},
      }
   }

   /// Sessions of finished outbound transfers, removed in one go.
   pub fn begin_teardown(&mut self) -> Option<RemoteOp<()>> {
      if self.teardown.is_empty() {
         return None;
      }
      let sessions = std::mem::take(&mut self.teardown);
      let transport = self.transport.clone();
      Some(
         async move {
            for session in sessions {
               remove_session(&transport, &session).await;
            }
            Ok(())
         }
         .boxed(),
      )
   }

   /// Fails everything still in flight.
   pub fn clear(&mut self) {
      let live: Vec<SmolStr> = self
         .transfers
         .iter()
         .filter(|(_, t)| !t.status.is_terminal())
         .map(|(p, _)| p.clone())
         .collect();
      for path in live {
         self.fail(&path, "Bluetooth service lost", false);
      }
      self.transfers.clear();
      self.sessions.clear();
      self.unclaimed.clear();
      self.cancelling.clear();
   }

   // === In-place variants ===

   pub async fn send_file(&mut self, device: &str, file: &Path) -> Result<FileTransfer> {
      let result = self.begin_send(device, file)?.await;
      self.finish_send(result)
   }

   pub async fn send_files(&mut self, device: &str, files: &[PathBuf]) -> Vec<FileTransfer> {
      let result = self.begin_send_files(device, files).await;
      self.finish_send_files(result).unwrap_or_default()
   }

   pub async fn cancel(&mut self, path: &str) -> Result<()> {
      let result = self.begin_cancel(path)?.await;
      self.finish_cancel(path, result)
   }

   pub async fn pause(&mut self, path: &str) -> Result<()> {
      let result = self.begin_pause(path)?.await;
      self.finish_pause(path, result)
   }

   pub async fn resume(&mut self, path: &str) -> Result<()> {
      let result = self.begin_resume(path)?.await;
      self.finish_resume(path, result)
   }
}

#[cfg(test)]
mod tests {
   use std::{collections::HashMap, io::Write, sync::Arc};

   use super::*;
   use crate::{
      bluez::{transport::Reply, value::PropValue},
      testing::*,
   };

   const SESSION: &str = "/org/bluez/obex/client/session1";
   const TRANSFER: &str = "/org/bluez/obex/client/session1/transfer1";

   fn setup() -> (Arc<MockTransport>, Arc<RecordingBus>, TransferManager) {
      let mock = MockTransport::new();
      add_device(&mock, HEADPHONES, device_props(HEADPHONES_ADDR, "Buds"), PropertyMap::new());
      let bus = RecordingBus::new();
      let manager = TransferManager::new(mock.clone(), bus.clone());
      (mock, bus, manager)
   }

   fn file_of(len: usize) -> tempfile::NamedTempFile {
      let mut file = tempfile::NamedTempFile::new().unwrap();
      file.write_all(&vec![0u8; len]).unwrap();
      file
   }

   fn script_session(mock: &MockTransport) {
      mock.reply("CreateSession", Reply::Path(SESSION.into()));
      mock.reply("SendFile", Reply::Path(TRANSFER.into()));
   }

   fn transfer_changed(props: PropertyMap) -> BusSignal {
      changed(TRANSFER, OBEX_TRANSFER_INTERFACE, props)
   }

   #[tokio::test]
   async fn test_progress_to_completion() -> Result<()> {
      let (mock, bus, mut manager) = setup();
      script_session(&mock);
      let file = file_of(1000);

      let transfer = manager.send_file(HEADPHONES, file.path()).await?;
      assert_eq!(transfer.status, TransferStatus::Queued);
      assert_eq!(transfer.size, Some(1000));
      assert_eq!(
         mock.calls()[0].args,
         Args::Session {
            destination: HEADPHONES_ADDR.into(),
            target: "opp".into()
         }
      );

      let mut seen = Vec::new();
      for (i, sent) in [0u64, 250, 500, 1000].into_iter().enumerate() {
         let mut props = props([("Transferred", PropValue::U64(sent))]);
         if i == 0 {
            props.insert("Status".into(), PropValue::str("active"));
         }
         manager.handle_signal(&transfer_changed(props));
         seen.push(manager.transfer(TRANSFER).and_then(FileTransfer::progress));
      }
      assert_eq!(seen, vec![Some(0.0), Some(25.0), Some(50.0), Some(100.0)]);

      manager.handle_signal(&transfer_changed(props([("Status", PropValue::str("complete"))])));
      assert_eq!(bus.count("transfer_started"), 1);
      assert_eq!(bus.count("transfer_completed"), 1);
      assert_eq!(manager.transfer(TRANSFER).map(|t| t.status), Some(TransferStatus::Complete));

      // Finished sessions are removed.
      let teardown = manager.begin_teardown().expect("session queued for removal");
      teardown.await?;
      assert_eq!(mock.call_count("RemoveSession"), 1);
      Ok(())
   }

   #[tokio::test]
   async fn test_progress_is_monotonic() -> Result<()> {
      let (mock, bus, mut manager) = setup();
      script_session(&mock);
      let file = file_of(100);
      manager.send_file(HEADPHONES, file.path()).await?;

      manager.handle_signal(&transfer_changed(props([("Transferred", PropValue::U64(60))])));
      manager.handle_signal(&transfer_changed(props([("Transferred", PropValue::U64(40))])));
      assert_eq!(manager.transfer(TRANSFER).map(|t| t.transferred), Some(60));
      assert_eq!(bus.count("transfer_progress"), 1);
      Ok(())
   }

   #[tokio::test]
   async fn test_missing_file_makes_no_call() {
      let (mock, _bus, mut manager) = setup();
      let err = manager
         .send_file(HEADPHONES, Path::new("/nonexistent/bluelink/file.bin"))
         .await
         .unwrap_err();
      assert!(matches!(err, BluelinkError::FileNotFound(_)));
      assert_eq!(mock.remote_traffic(), 0);
   }

   #[tokio::test]
   async fn test_bad_address_stops_before_session() {
      let (mock, _bus, mut manager) = setup();
      add_device(&mock, PHONE, device_props("not-an-address", "Phone"), PropertyMap::new());
      let file = file_of(10);
      let err = manager.send_file(PHONE, file.path()).await.unwrap_err();
      assert!(matches!(err, BluelinkError::InvalidArgument(_)));
      assert_eq!(mock.call_count("CreateSession"), 0);
   }

   #[tokio::test]
   async fn test_send_failure_tears_down_session() {
      let (mock, bus, mut manager) = setup();
      mock.reply("CreateSession", Reply::Path(SESSION.into()));
      mock.fail_call("SendFile", MockFailure::Remote("org.bluez.obex.Error.Forbidden", "nope"));
      let file = file_of(10);

      assert!(manager.send_file(HEADPHONES, file.path()).await.is_err());
      assert_eq!(mock.methods(), vec!["CreateSession", "SendFile", "RemoveSession"]);
      assert_eq!(mock.calls()[2].args, Args::Path(SESSION.into()));
      assert!(manager.transfers().is_empty());
      assert_eq!(bus.count("transfer_started"), 0);
   }

   #[tokio::test]
   async fn test_multi_file_send_continues_past_failures() {
      let (mock, _bus, mut manager) = setup();
      script_session(&mock);
      let good = file_of(10);
      let files = vec![PathBuf::from("/nonexistent/a.bin"), good.path().to_path_buf()];

      let started = manager.send_files(HEADPHONES, &files).await;
      assert_eq!(started.len(), 1);
      assert_eq!(started[0].path, TRANSFER);
   }

   #[tokio::test]
   async fn test_pause_resume_preconditions() -> Result<()> {
      let (mock, _bus, mut manager) = setup();
      script_session(&mock);
      let file = file_of(10);
      manager.send_file(HEADPHONES, file.path()).await?;

      assert!(matches!(manager.pause(TRANSFER).await, Err(BluelinkError::Precondition(_))));
      assert!(matches!(manager.resume(TRANSFER).await, Err(BluelinkError::Precondition(_))));
      assert_eq!(mock.call_count("Suspend"), 0);

      manager.handle_signal(&transfer_changed(props([("Status", PropValue::str("active"))])));
      manager.pause(TRANSFER).await?;
      assert_eq!(manager.transfer(TRANSFER).map(|t| t.status), Some(TransferStatus::Suspended));
      manager.resume(TRANSFER).await?;
      assert_eq!(manager.transfer(TRANSFER).map(|t| t.status), Some(TransferStatus::Active));
      assert_eq!(mock.call_count("Suspend"), 1);
      assert_eq!(mock.call_count("Resume"), 1);
      Ok(())
   }

   #[tokio::test]
   async fn test_cancel_removes_and_tears_down() -> Result<()> {
      let (mock, bus, mut manager) = setup();
      script_session(&mock);
      let file = file_of(10);
      manager.send_file(HEADPHONES, file.path()).await?;

      manager.cancel(TRANSFER).await?;
      assert!(manager.transfer(TRANSFER).is_none());
      assert_eq!(mock.call_count("Cancel"), 1);
      assert_eq!(mock.call_count("RemoveSession"), 1);
      let cancelled = bus.events().into_iter().any(|e| {
         matches!(e, BluetoothEvent::TransferFailed { cancelled: true, ref transfer, .. }
            if transfer.status == TransferStatus::Error)
      });
      assert!(cancelled);
      assert!(matches!(manager.cancel(TRANSFER).await, Err(BluelinkError::TransferNotFound(_))));
      Ok(())
   }

   fn failures(bus: &RecordingBus) -> Vec<(String, bool)> {
      bus.events()
         .into_iter()
         .filter_map(|e| match e {
            BluetoothEvent::TransferFailed { reason, cancelled, .. } => Some((reason, cancelled)),
            _ => None,
         })
         .collect()
   }

   #[tokio::test]
   async fn test_error_status_during_cancel_counts_as_cancelled() -> Result<()> {
      let (mock, bus, mut manager) = setup();
      script_session(&mock);
      let file = file_of(10);
      manager.send_file(HEADPHONES, file.path()).await?;
      manager.handle_signal(&transfer_changed(props([("Status", PropValue::str("active"))])));

      let op = manager.begin_cancel(TRANSFER)?;
      manager.handle_signal(&transfer_changed(props([("Status", PropValue::str("error"))])));
      assert!(manager.begin_teardown().is_none());

      let result = op.await;
      manager.finish_cancel(TRANSFER, result)?;
      assert_eq!(failures(&bus), vec![("Cancelled by user".to_owned(), true)]);
      assert_eq!(mock.call_count("RemoveSession"), 1);
      assert!(manager.begin_teardown().is_none());
      Ok(())
   }

   #[tokio::test]
   async fn test_cancel_rejected_after_transfer_ended_still_drops_session() -> Result<()> {
      let (mock, bus, mut manager) = setup();
      script_session(&mock);
      mock.fail_call("Cancel", MockFailure::Remote("org.freedesktop.DBus.Error.UnknownObject", "gone"));
      let file = file_of(10);
      manager.send_file(HEADPHONES, file.path()).await?;

      let op = manager.begin_cancel(TRANSFER)?;
      manager.handle_signal(&transfer_changed(props([("Status", PropValue::str("error"))])));
      let result = op.await;
      assert!(result.is_err());
      manager.finish_cancel(TRANSFER, result)?;
      assert_eq!(bus.count("transfer_failed"), 1);

      manager.begin_teardown().expect("session queued for removal").await?;
      assert_eq!(mock.call_count("RemoveSession"), 1);
      Ok(())
   }

   #[tokio::test]
   async fn test_cancel_failure_keeps_transfer() -> Result<()> {
      let (mock, bus, mut manager) = setup();
      script_session(&mock);
      mock.fail_call("Cancel", MockFailure::Remote("org.bluez.obex.Error.Failed", "busy"));
      let file = file_of(10);
      manager.send_file(HEADPHONES, file.path()).await?;

      assert!(manager.cancel(TRANSFER).await.is_err());
      assert!(manager.transfer(TRANSFER).is_some());
      manager.handle_signal(&transfer_changed(props([("Status", PropValue::str("error"))])));
      assert_eq!(failures(&bus), vec![("Transfer failed".to_owned(), false)]);
      Ok(())
   }

   #[tokio::test]
   async fn test_vanished_transfer_is_implicit_failure() -> Result<()> {
      let (mock, bus, mut manager) = setup();
      script_session(&mock);
      let file = file_of(10);
      manager.send_file(HEADPHONES, file.path()).await?;

      manager.handle_signal(&BusSignal::ObjectRemoved {
         path: TRANSFER.into(),
         interfaces: vec![OBEX_TRANSFER_INTERFACE.into()],
      });
      assert!(manager.transfers().is_empty());
      assert_eq!(bus.count("transfer_failed"), 1);
      Ok(())
   }

   #[test]
   fn test_inbound_transfer_from_object_added() {
      let mock = MockTransport::new();
      let bus = RecordingBus::new();
      let mut manager = TransferManager::new(mock, bus.clone());
      let session = "/org/bluez/obex/server/session3";
      let transfer = "/org/bluez/obex/server/session3/transfer0";

      let mut interfaces = HashMap::new();
      interfaces.insert(
         OBEX_SESSION_INTERFACE.to_owned(),
         props([("Destination", PropValue::str(PHONE_ADDR))]),
      );
      manager.handle_signal(&BusSignal::ObjectAdded {
         path: session.into(),
         interfaces,
      });

      let mut interfaces = HashMap::new();
      interfaces.insert(
         OBEX_TRANSFER_INTERFACE.to_owned(),
         props([
            ("Session", PropValue::Path(session.into())),
            ("Name", PropValue::str("photo.jpg")),
            ("Size", PropValue::U64(2048)),
            ("Status", PropValue::str("active")),
         ]),
      );
      manager.handle_signal(&BusSignal::ObjectAdded {
         path: transfer.into(),
         interfaces,
      });

      let tracked = manager.transfer(transfer).cloned().unwrap();
      assert_eq!(tracked.direction, TransferDirection::Receive);
      assert_eq!(tracked.device, PHONE_ADDR);
      assert_eq!(tracked.name, "photo.jpg");
      assert_eq!(tracked.status, TransferStatus::Active);
      assert_eq!(bus.count("transfer_started"), 1);
   }

   #[test]
   fn test_throughput() {
      let started = SystemTime::UNIX_EPOCH;
      let transfer = FileTransfer {
         path: TRANSFER.into(),
         session: SESSION.into(),
         device: HEADPHONES.into(),
         name: "a".into(),
         filename: None,
         size: None,
         transferred: 4096,
         status: TransferStatus::Active,
         direction: TransferDirection::Send,
         started,
         finished: None,
      };
      let now = started + std::time::Duration::from_secs(2);
      assert_eq!(transfer.throughput(now), Some(2048.0));
      assert_eq!(transfer.progress(), None);
   }
}
