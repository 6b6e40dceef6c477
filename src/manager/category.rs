//! Device category recognition.
//!
//! A device is classified from, in order of reliability, its Class of
//! Device, its GAP appearance and finally the icon hint bluetoothd derives
//! for it.

use serde::Serialize;

/// Coarse kind of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceCategory {
   Computer,
   Phone,
   Headset,
   Headphones,
   Speaker,
   Audio,
   Keyboard,
   Mouse,
   Gamepad,
   Input,
   Wearable,
   Health,
   Imaging,
   Network,
   Unknown,
}

impl DeviceCategory {
   pub const fn is_audio(self) -> bool {
      matches!(self, Self::Headset | Self::Headphones | Self::Speaker | Self::Audio)
   }
}

/// Icon names (freedesktop naming) mapped to a category, matched by prefix.
const ICON_PATTERNS: &[(&str, DeviceCategory)] = &[
   ("audio-headset", DeviceCategory::Headset),
   ("audio-headphones", DeviceCategory::Headphones),
   ("audio-speakers", DeviceCategory::Speaker),
   ("audio-", DeviceCategory::Audio),
   ("input-keyboard", DeviceCategory::Keyboard),
   ("input-mouse", DeviceCategory::Mouse),
   ("input-gaming", DeviceCategory::Gamepad),
   ("input-", DeviceCategory::Input),
   ("phone", DeviceCategory::Phone),
   ("computer", DeviceCategory::Computer),
   ("camera-", DeviceCategory::Imaging),
   ("printer", DeviceCategory::Imaging),
   ("scanner", DeviceCategory::Imaging),
   ("network-", DeviceCategory::Network),
   ("modem", DeviceCategory::Network),
];

/// Major device classes (bits 8..=12 of the Class of Device).
const MAJOR_COMPUTER: u32 = 0x01;
const MAJOR_PHONE: u32 = 0x02;
const MAJOR_NETWORK: u32 = 0x03;
const MAJOR_AUDIO_VIDEO: u32 = 0x04;
const MAJOR_PERIPHERAL: u32 = 0x05;
const MAJOR_IMAGING: u32 = 0x06;
const MAJOR_WEARABLE: u32 = 0x07;
const MAJOR_HEALTH: u32 = 0x09;

fn from_class(class: u32) -> Option<DeviceCategory> {
   let major = (class >> 8) & 0x1f;
   let minor = (class >> 2) & 0x3f;
   let category = match major {
      MAJOR_COMPUTER => DeviceCategory::Computer,
      MAJOR_PHONE => DeviceCategory::Phone,
      MAJOR_NETWORK => DeviceCategory::Network,
      MAJOR_AUDIO_VIDEO => match minor {
         0x01 | 0x02 => DeviceCategory::Headset,
         0x05 => DeviceCategory::Speaker,
         0x06 => DeviceCategory::Headphones,
         _ => DeviceCategory::Audio,
      },
      MAJOR_PERIPHERAL => match (minor >> 4, minor & 0x0f) {
         (0x01 | 0x03, _) => DeviceCategory::Keyboard,
         (0x02, _) => DeviceCategory::Mouse,
         (_, 0x01 | 0x02) => DeviceCategory::Gamepad,
         _ => DeviceCategory::Input,
      },
      MAJOR_IMAGING => DeviceCategory::Imaging,
      MAJOR_WEARABLE => DeviceCategory::Wearable,
      MAJOR_HEALTH => DeviceCategory::Health,
      _ => return None,
   };
   Some(category)
}

fn from_appearance(appearance: u16) -> Option<DeviceCategory> {
   let category = match (appearance >> 6, appearance & 0x3f) {
      (0x01, _) => DeviceCategory::Phone,
      (0x02, _) => DeviceCategory::Computer,
      (0x03, _) => DeviceCategory::Wearable,
      (0x0d | 0x0e | 0x10, _) => DeviceCategory::Health,
      (0x0f, 0x01) => DeviceCategory::Keyboard,
      (0x0f, 0x02) => DeviceCategory::Mouse,
      (0x0f, 0x03 | 0x04) => DeviceCategory::Gamepad,
      (0x0f, _) => DeviceCategory::Input,
      (0x21, _) => DeviceCategory::Speaker,
      (0x25, 0x02) => DeviceCategory::Headset,
      (0x25, _) => DeviceCategory::Headphones,
      _ => return None,
   };
   Some(category)
}

fn from_icon(icon: &str) -> Option<DeviceCategory> {
   ICON_PATTERNS
      .iter()
      .find(|(prefix, _)| icon.starts_with(prefix))
      .map(|(_, category)| *category)
}

/// Classifies a device from whatever hints it exposes.
pub fn recognize(class: Option<u32>, appearance: Option<u16>, icon: Option<&str>) -> DeviceCategory {
   if let Some(category) = class.and_then(from_class) {
      log::trace!("Category {category} from class {:#08x}", class.unwrap_or_default());
      return category;
   }
   if let Some(category) = appearance.and_then(from_appearance) {
      log::trace!("Category {category} from appearance");
      return category;
   }
   icon.and_then(from_icon).unwrap_or(DeviceCategory::Unknown)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_class_of_device() {
      // Audio/Video, wearable headset
      assert_eq!(recognize(Some(0x24_0404), None, None), DeviceCategory::Headset);
      // Audio/Video, headphones
      assert_eq!(recognize(Some(0x24_0418), None, None), DeviceCategory::Headphones);
      // Peripheral, keyboard
      assert_eq!(recognize(Some(0x00_0540), None, None), DeviceCategory::Keyboard);
      // Peripheral, pointing device
      assert_eq!(recognize(Some(0x00_0580), None, None), DeviceCategory::Mouse);
      // Phone, smartphone
      assert_eq!(recognize(Some(0x5a_020c), None, None), DeviceCategory::Phone);
   }

   #[test]
   fn test_fallback_order() {
      // Misc class falls through to the appearance.
      assert_eq!(recognize(Some(0), Some(0x03c2), Some("phone")), DeviceCategory::Mouse);
      assert_eq!(recognize(None, None, Some("audio-headset")), DeviceCategory::Headset);
      assert_eq!(recognize(None, None, Some("audio-card")), DeviceCategory::Audio);
      assert_eq!(recognize(None, None, None), DeviceCategory::Unknown);
      assert!(DeviceCategory::Speaker.is_audio());
      assert!(!DeviceCategory::Phone.is_audio());
   }
}
