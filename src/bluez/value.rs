//! Property values exchanged with bluetoothd.
//!
//! Remote properties arrive as D-Bus variants. They are converted once, at
//! the transport boundary, into the small closed set of shapes the managers
//! actually read.

use std::collections::HashMap;

use smol_str::SmolStr;
use zbus::zvariant::{OwnedValue, Value};

/// A decoded property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
   Bool(bool),
   Byte(u8),
   I16(i16),
   U16(u16),
   I32(i32),
   U32(u32),
   I64(i64),
   U64(u64),
   Str(SmolStr),
   Path(SmolStr),
   StrList(Vec<SmolStr>),
   /// Containers the managers never look into (dicts, structs, byte arrays).
   Other,
}

/// Properties of one interface on one object.
pub type PropertyMap = HashMap<String, PropValue>;

impl PropValue {
   pub fn str(s: &str) -> Self {
      Self::Str(SmolStr::new(s))
   }

   pub fn str_list<I, S>(items: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      Self::StrList(items.into_iter().map(|s| SmolStr::new(s.as_ref())).collect())
   }

   pub const fn as_bool(&self) -> Option<bool> {
      match self {
         Self::Bool(b) => Some(*b),
         _ => None,
      }
   }

   pub fn as_str(&self) -> Option<&str> {
      match self {
         Self::Str(s) | Self::Path(s) => Some(s.as_str()),
         _ => None,
      }
   }

   /// Any signed or unsigned integer that fits into an `i64`.
   pub fn as_i64(&self) -> Option<i64> {
      match *self {
         Self::Byte(v) => Some(v.into()),
         Self::I16(v) => Some(v.into()),
         Self::U16(v) => Some(v.into()),
         Self::I32(v) => Some(v.into()),
         Self::U32(v) => Some(v.into()),
         Self::I64(v) => Some(v),
         Self::U64(v) => i64::try_from(v).ok(),
         _ => None,
      }
   }

   pub fn as_u64(&self) -> Option<u64> {
      match *self {
         Self::U64(v) => Some(v),
         _ => self.as_i64().and_then(|v| u64::try_from(v).ok()),
      }
   }

   pub fn as_str_list(&self) -> Option<&[SmolStr]> {
      match self {
         Self::StrList(items) => Some(items),
         _ => None,
      }
   }

   /// Decodes a D-Bus variant. Nested variants are unwrapped.
   pub fn from_variant(value: &Value<'_>) -> Self {
      match value {
         Value::Bool(b) => Self::Bool(*b),
         Value::U8(v) => Self::Byte(*v),
         Value::I16(v) => Self::I16(*v),
         Value::U16(v) => Self::U16(*v),
         Value::I32(v) => Self::I32(*v),
         Value::U32(v) => Self::U32(*v),
         Value::I64(v) => Self::I64(*v),
         Value::U64(v) => Self::U64(*v),
         Value::Str(s) => Self::Str(SmolStr::new(s.as_str())),
         Value::ObjectPath(p) => Self::Path(SmolStr::new(p.as_str())),
         Value::Value(inner) => Self::from_variant(inner),
         Value::Array(array) => {
            let mut items = Vec::new();
            for item in array.iter() {
               match item {
                  Value::Str(s) => items.push(SmolStr::new(s.as_str())),
                  Value::ObjectPath(p) => items.push(SmolStr::new(p.as_str())),
                  _ => return Self::Other,
               }
            }
            Self::StrList(items)
         },
         _ => Self::Other,
      }
   }

   /// Encodes the value for a property write.
   pub fn to_variant(&self) -> Value<'_> {
      match self {
         Self::Bool(b) => Value::from(*b),
         Self::Byte(v) => Value::from(*v),
         Self::I16(v) => Value::from(*v),
         Self::U16(v) => Value::from(*v),
         Self::I32(v) => Value::from(*v),
         Self::U32(v) => Value::from(*v),
         Self::I64(v) => Value::from(*v),
         Self::U64(v) => Value::from(*v),
         Self::Str(s) | Self::Path(s) => Value::from(s.as_str()),
         Self::StrList(items) => {
            Value::from(items.iter().map(|s| s.as_str()).collect::<Vec<&str>>())
         },
         Self::Other => Value::from(false),
      }
   }
}

impl From<bool> for PropValue {
   fn from(value: bool) -> Self {
      Self::Bool(value)
   }
}

impl From<u32> for PropValue {
   fn from(value: u32) -> Self {
      Self::U32(value)
   }
}

impl From<&str> for PropValue {
   fn from(value: &str) -> Self {
      Self::str(value)
   }
}

/// Decodes a whole `a{sv}` property dictionary.
pub fn decode_properties(props: &HashMap<String, OwnedValue>) -> PropertyMap {
   props
      .iter()
      .map(|(k, v)| (k.clone(), PropValue::from_variant(v)))
      .collect()
}

/// Typed lookups on a property dictionary.
pub trait PropertyMapExt {
   fn bool_prop(&self, key: &str) -> Option<bool>;
   fn str_prop(&self, key: &str) -> Option<&str>;
   fn i64_prop(&self, key: &str) -> Option<i64>;
   fn u64_prop(&self, key: &str) -> Option<u64>;
   fn list_prop(&self, key: &str) -> Option<&[SmolStr]>;
}

impl PropertyMapExt for PropertyMap {
   fn bool_prop(&self, key: &str) -> Option<bool> {
      self.get(key).and_then(PropValue::as_bool)
   }

   fn str_prop(&self, key: &str) -> Option<&str> {
      self.get(key).and_then(PropValue::as_str)
   }

   fn i64_prop(&self, key: &str) -> Option<i64> {
      self.get(key).and_then(PropValue::as_i64)
   }

   fn u64_prop(&self, key: &str) -> Option<u64> {
      self.get(key).and_then(PropValue::as_u64)
   }

   fn list_prop(&self, key: &str) -> Option<&[SmolStr]> {
      self.get(key).and_then(PropValue::as_str_list)
   }
}
