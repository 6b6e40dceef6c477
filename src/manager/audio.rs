//! Audio profiles advertised by devices and their connection state.

use std::collections::HashMap;

use futures::FutureExt;
use log::{debug, info};
use serde::Serialize;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluez::{
      DEVICE_INTERFACE, MEDIA_TRANSPORT_INTERFACE,
      transport::{Args, BusSignal, MethodCall, SharedTransport},
      value::{PropertyMap, PropertyMapExt},
   },
   error::{BluelinkError, Result},
   event::{BluetoothEvent, EventSender},
   manager::{
      RemoteOp, complete,
      device::{CONNECT_TIMEOUT, DISCONNECT_TIMEOUT, Device},
   },
};

/// Role of an audio profile. Declaration order is primary-profile priority.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProfileKind {
   Sink,
   HandsFree,
   Headset,
   RemoteControl,
   Source,
}

struct KnownProfile {
   uuid: Uuid,
   name: &'static str,
   kind: ProfileKind,
}

const fn sig(short: u16) -> Uuid {
   Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_0080_5f9b_34fb)
}

static KNOWN_PROFILES: [KnownProfile; 9] = [
   KnownProfile { uuid: sig(0x110b), name: "A2DP Sink", kind: ProfileKind::Sink },
   KnownProfile { uuid: sig(0x110a), name: "A2DP Source", kind: ProfileKind::Source },
   KnownProfile { uuid: sig(0x111e), name: "Hands-Free", kind: ProfileKind::HandsFree },
   KnownProfile { uuid: sig(0x111f), name: "Hands-Free Gateway", kind: ProfileKind::HandsFree },
   KnownProfile { uuid: sig(0x1108), name: "Headset", kind: ProfileKind::Headset },
   KnownProfile { uuid: sig(0x1112), name: "Headset Gateway", kind: ProfileKind::Headset },
   KnownProfile { uuid: sig(0x110e), name: "AVRCP", kind: ProfileKind::RemoteControl },
   KnownProfile { uuid: sig(0x110c), name: "AVRCP Target", kind: ProfileKind::RemoteControl },
   KnownProfile { uuid: sig(0x110f), name: "AVRCP Controller", kind: ProfileKind::RemoteControl },
];

pub const A2DP_SINK_UUID: Uuid = sig(0x110b);

/// One audio profile of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioProfile {
   pub uuid: Uuid,
   pub name: &'static str,
   pub kind: ProfileKind,
   pub connected: bool,
   pub codec: Option<SmolStr>,
}

/// Profiles matching the advertised service UUIDs, in priority order.
pub fn detect_profiles<'a>(uuids: impl IntoIterator<Item = &'a SmolStr>) -> Vec<AudioProfile> {
   let mut profiles: Vec<AudioProfile> = uuids
      .into_iter()
      .filter_map(|u| Uuid::parse_str(u).ok())
      .filter_map(|uuid| KNOWN_PROFILES.iter().find(|p| p.uuid == uuid))
      .map(|known| AudioProfile {
         uuid: known.uuid,
         name: known.name,
         kind: known.kind,
         connected: false,
         codec: None,
      })
      .collect();
   profiles.sort_by_key(|p| (p.kind, p.uuid));
   profiles.dedup_by_key(|p| p.uuid);
   profiles
}

/// The highest priority profile: sink, hands-free, headset, remote-control,
/// source.
pub fn primary_profile(profiles: &[AudioProfile]) -> Option<Uuid> {
   profiles.iter().min_by_key(|p| p.kind).map(|p| p.uuid)
}

/// Human label for a media transport codec id.
pub fn codec_label(profile: Option<ProfileKind>, codec: u8) -> SmolStr {
   let label = match (profile, codec) {
      (Some(ProfileKind::HandsFree | ProfileKind::Headset), 0x01) => "CVSD",
      (Some(ProfileKind::HandsFree | ProfileKind::Headset), 0x02) => "mSBC",
      (Some(ProfileKind::HandsFree | ProfileKind::Headset), 0x03) => "LC3-SWB",
      (_, 0x00) => "SBC",
      (_, 0x01) => "MP3",
      (_, 0x02) => "AAC",
      (_, 0x04) => "ATRAC",
      (_, 0xff) => "Vendor",
      _ => return SmolStr::new(format!("codec {codec:#04x}")),
   };
   SmolStr::new_static(label)
}

pub fn parse_uuid(uuid: &str) -> Result<Uuid> {
   Uuid::parse_str(uuid).map_err(|e| BluelinkError::InvalidArgument(format!("{uuid}: {e}")))
}

struct MediaTransport {
   device: SmolStr,
   uuid: Uuid,
}

/// Tracks audio profiles per device.
pub struct AudioManager {
   transport: SharedTransport,
   events: EventSender,
   profiles: HashMap<SmolStr, Vec<AudioProfile>>,
   active: HashMap<SmolStr, Uuid>,
   media: HashMap<SmolStr, MediaTransport>,
}

impl AudioManager {
   pub fn new(transport: SharedTransport, events: EventSender) -> Self {
      Self {
         transport,
         events,
         profiles: HashMap::new(),
         active: HashMap::new(),
         media: HashMap::new(),
      }
   }

   pub fn profiles(&self, device: &str) -> &[AudioProfile] {
      self.profiles.get(device).map_or(&[], Vec::as_slice)
   }

   pub fn active_profile(&self, device: &str) -> Option<Uuid> {
      self.active.get(device).copied()
   }

   fn publish(&self, device: &str) {
      self.events.emit(BluetoothEvent::ProfilesChanged {
         device: SmolStr::new(device),
         profiles: self.profiles(device).to_vec(),
      });
   }

   fn set_active(&mut self, device: &str, uuid: Option<Uuid>) {
      let previous = match uuid {
         Some(uuid) => self.active.insert(SmolStr::new(device), uuid),
         None => self.active.remove(device),
      };
      if previous != uuid {
         self.events.emit(BluetoothEvent::ActiveProfileChanged {
            device: SmolStr::new(device),
            uuid,
         });
      }
   }

   /// Re-derives the profile set of a device, keeping the connection state of
   /// profiles that survive.
   pub fn detect(&mut self, device: &Device) -> &[AudioProfile] {
      let mut detected = detect_profiles(&device.uuids);
      let previous = self.profiles.get(device.path.as_str());
      if let Some(previous) = previous {
         for profile in &mut detected {
            if let Some(old) = previous.iter().find(|p| p.uuid == profile.uuid) {
               profile.connected = old.connected;
               profile.codec.clone_from(&old.codec);
            }
         }
      }

      if previous.map(Vec::as_slice) != Some(detected.as_slice()) {
         debug!("{}: {} audio profile(s)", device.path, detected.len());
         if detected.is_empty() {
            self.profiles.remove(device.path.as_str());
         } else {
            self.profiles.insert(device.path.clone(), detected);
         }
         self.publish(&device.path);
      }
      self.profiles(&device.path)
   }

   /// A device came up: re-detect and promote the primary profile.
   pub fn on_device_connected(&mut self, device: &Device) -> Option<Uuid> {
      self.detect(device);
      let primary = primary_profile(self.profiles(&device.path))?;
      self.mark(&device.path, primary, true);
      self.set_active(&device.path, Some(primary));
      info!("{}: primary audio profile {primary}", device.path);
      Some(primary)
   }

   /// A device went down: nothing of it is active any more.
   pub fn on_device_disconnected(&mut self, device: &str) {
      let Some(profiles) = self.profiles.get_mut(device) else {
         return;
      };
      let mut changed = false;
      for profile in profiles.iter_mut() {
         changed |= profile.connected || profile.codec.is_some();
         profile.connected = false;
         profile.codec = None;
      }
      if changed {
         self.publish(device);
      }
      self.set_active(device, None);
   }

   pub fn on_device_removed(&mut self, device: &str) {
      self.profiles.remove(device);
      self.active.remove(device);
      self.media.retain(|_, m| m.device != device);
   }

   pub fn clear(&mut self) {
      self.profiles.clear();
      self.active.clear();
      self.media.clear();
   }

   fn mark(&mut self, device: &str, uuid: Uuid, connected: bool) {
      let Some(profile) = self
         .profiles
         .get_mut(device)
         .and_then(|ps| ps.iter_mut().find(|p| p.uuid == uuid))
      else {
         return;
      };
      if profile.connected == connected {
         return;
      }
      profile.connected = connected;
      if !connected {
         profile.codec = None;
      }
      self.publish(device);
   }

   fn set_codec(&mut self, device: &str, uuid: Uuid, codec: Option<SmolStr>) {
      if let Some(profile) = self
         .profiles
         .get_mut(device)
         .and_then(|ps| ps.iter_mut().find(|p| p.uuid == uuid))
         && profile.codec != codec
      {
         profile.codec = codec;
         if profile.codec.is_some() {
            profile.connected = true;
         }
         self.publish(device);
      }
   }

   // === Media transports ===

   fn attach_transport(&mut self, path: &str, props: &PropertyMap) {
      let (Some(device), Some(uuid)) = (
         props.str_prop("Device"),
         props.str_prop("UUID").and_then(|u| Uuid::parse_str(u).ok()),
      ) else {
         return;
      };
      let kind = KNOWN_PROFILES.iter().find(|p| p.uuid == uuid).map(|p| p.kind);
      let codec = props
         .u64_prop("Codec")
         .and_then(|c| u8::try_from(c).ok())
         .map(|c| codec_label(kind, c));
      let device = SmolStr::new(device);
      debug!("Media transport {path} for {device} ({uuid})");
      self.set_codec(&device, uuid, codec);
      self.media.insert(SmolStr::new(path), MediaTransport { device, uuid });
   }

   /// Picks up media transports that already existed before the last sync.
   pub async fn enumerate_transports(&mut self) -> Result<()> {
      let paths = self.transport.objects_with_interface(MEDIA_TRANSPORT_INTERFACE).await?;
      for path in &paths {
         match self.transport.get_all_properties(path, MEDIA_TRANSPORT_INTERFACE).await {
            Ok(props) => self.attach_transport(path, &props),
            Err(e) => debug!("Reading media transport {path} failed: {e}"),
         }
      }
      Ok(())
   }

   pub fn handle_signal(&mut self, signal: &BusSignal) {
      match signal {
         BusSignal::ObjectAdded { path, interfaces } => {
            if let Some(props) = interfaces.get(MEDIA_TRANSPORT_INTERFACE) {
               self.attach_transport(path, props);
            }
         },
         BusSignal::ObjectRemoved { path, interfaces } => {
            if interfaces.iter().any(|i| i == MEDIA_TRANSPORT_INTERFACE)
               && let Some(media) = self.media.remove(path.as_str())
            {
               self.set_codec(&media.device, media.uuid, None);
            }
         },
         BusSignal::PropertiesChanged {
            path,
            interface,
            changed,
            ..
         } if interface == MEDIA_TRANSPORT_INTERFACE => {
            if let Some(media) = self.media.get(path.as_str())
               && let Some(codec) = changed.u64_prop("Codec").and_then(|c| u8::try_from(c).ok())
            {
               let (device, uuid) = (media.device.clone(), media.uuid);
               let kind = KNOWN_PROFILES.iter().find(|p| p.uuid == uuid).map(|p| p.kind);
               self.set_codec(&device, uuid, Some(codec_label(kind, codec)));
            }
         },
         BusSignal::ServiceLost => self.clear(),
         _ => {},
      }
   }

   // === Operations ===

   fn profile_call(
      &self,
      device: &Device,
      uuid: Uuid,
      method: &'static str,
   ) -> Result<RemoteOp<()>> {
      let advertised = uuid.to_string();
      if !device.uuids.contains(advertised.as_str()) {
         return Err(BluelinkError::ProfileNotSupported {
            device: device.path.clone(),
            uuid: SmolStr::new(advertised),
         });
      }
      let timeout = if method == "ConnectProfile" { CONNECT_TIMEOUT } else { DISCONNECT_TIMEOUT };
      let call = MethodCall::new(device.path.clone(), DEVICE_INTERFACE, method)
         .args(Args::Str(SmolStr::new(advertised)))
         .timeout(timeout);
      let transport = self.transport.clone();
      Ok(async move {
         transport.invoke(call).await?;
         Ok(())
      }
      .boxed())
   }

   pub fn begin_connect_profile(&self, device: &Device, uuid: Uuid) -> Result<Option<RemoteOp<()>>> {
      self.profile_call(device, uuid, "ConnectProfile").map(Some)
   }

   pub fn finish_connect_profile(&mut self, device: &str, uuid: Uuid, result: Result<()>) -> Result<()> {
      result?;
      self.mark(device, uuid, true);
      Ok(())
   }

   pub fn begin_disconnect_profile(&self, device: &Device, uuid: Uuid) -> Result<Option<RemoteOp<()>>> {
      self.profile_call(device, uuid, "DisconnectProfile").map(Some)
   }

   pub fn finish_disconnect_profile(&mut self, device: &str, uuid: Uuid, result: Result<()>) -> Result<()> {
      result?;
      self.mark(device, uuid, false);
      if self.active_profile(device) == Some(uuid) {
         let next = self
            .profiles(device)
            .iter()
            .filter(|p| p.connected)
            .min_by_key(|p| p.kind)
            .map(|p| p.uuid);
         self.set_active(device, next);
      }
      Ok(())
   }

   /// Connects `uuid` and makes it the active profile. Other profiles stay
   /// connected; routing between them is up to the audio server.
   pub fn begin_set_active_profile(&self, device: &Device, uuid: Uuid) -> Result<Option<RemoteOp<()>>> {
      if self.active_profile(&device.path) == Some(uuid) {
         return Ok(None);
      }
      let connected = self
         .profiles(&device.path)
         .iter()
         .any(|p| p.uuid == uuid && p.connected);
      if connected {
         return Ok(Some(async { Ok(()) }.boxed()));
      }
      self.begin_connect_profile(device, uuid)
   }

   pub fn finish_set_active_profile(&mut self, device: &str, uuid: Uuid, result: Result<()>) -> Result<()> {
      self.finish_connect_profile(device, uuid, result)?;
      self.set_active(device, Some(uuid));
      Ok(())
   }

   // === In-place variants ===

   pub async fn connect_profile(&mut self, device: &Device, uuid: Uuid) -> Result<()> {
      let op = self.begin_connect_profile(device, uuid)?;
      complete(self, op, (), |m, r| m.finish_connect_profile(&device.path, uuid, r)).await
   }

   pub async fn disconnect_profile(&mut self, device: &Device, uuid: Uuid) -> Result<()> {
      let op = self.begin_disconnect_profile(device, uuid)?;
      complete(self, op, (), |m, r| m.finish_disconnect_profile(&device.path, uuid, r)).await
   }

   pub async fn set_active_profile(&mut self, device: &Device, uuid: Uuid) -> Result<()> {
      let op = self.begin_set_active_profile(device, uuid)?;
      complete(self, op, (), |m, r| m.finish_set_active_profile(&device.path, uuid, r)).await
   }
}
