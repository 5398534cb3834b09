//! Topic identifiers and notification keys.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

/// Id used for topics created with an empty name.
///
/// Topic ids are case-folded, so no name can ever fold to this value.
pub const EMPTY_NAME_ID: &str = "#EMPTY";

/// The 32 byte key under which records of a topic are announced on the network.
///
/// Equality is byte for byte. The human readable serialization is lowercase hex, so that
/// persisted topic lists stay stable independent of the binary encoding in use.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotificationKey([u8; 32]);

impl NotificationKey {
    /// The length of a notification key, in bytes.
    pub const LENGTH: usize = 32;

    /// Creates a key from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives the key for a topic name.
    ///
    /// The case-folded UTF-8 name is copied into the front of a zero-filled buffer and
    /// truncated after [`Self::LENGTH`] bytes. Names which only differ after the first 32
    /// bytes therefore share a key.
    pub fn from_name(name: &str) -> Self {
        let folded = name.to_lowercase();
        let bytes = folded.as_bytes();
        let mut key = [0u8; 32];
        let len = bytes.len().min(Self::LENGTH);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }

    /// Returns the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encodes the key as lowercase hex.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// Parses a key from hex, accepting both upper and lower case.
    pub fn from_hex(s: &str) -> Result<Self, KeyParsingError> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
        ensure!(
            bytes.len() == Self::LENGTH,
            InvalidLengthSnafu { len: bytes.len() }
        );
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Formats the first five bytes as hex, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl From<[u8; 32]> for NotificationKey {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for NotificationKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NotificationKey({})", self.fmt_short())
    }
}

impl FromStr for NotificationKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NotificationKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for NotificationKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let data: [u8; 32] = Deserialize::deserialize(deserializer)?;
            Ok(Self(data))
        }
    }
}

/// Error when parsing a [`NotificationKey`] from its hex form.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum KeyParsingError {
    #[snafu(transparent)]
    Decode { source: data_encoding::DecodeError },
    #[snafu(display("invalid key length {len}, expected 32 bytes"))]
    InvalidLength { len: usize },
}

/// Identifies a topic within a [`Feeds`](crate::Feeds) instance.
///
/// Derived from the topic's display name by case folding, so `General` and `general` are
/// the same topic.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    /// Derives the id for a display name.
    ///
    /// An empty name maps to [`EMPTY_NAME_ID`].
    pub fn from_name(name: &str) -> Self {
        if name.is_empty() {
            Self(EMPTY_NAME_ID.to_string())
        } else {
            Self(name.to_lowercase())
        }
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({:?})", self.0)
    }
}

impl From<&str> for TopicId {
    fn from(value: &str) -> Self {
        Self::from_name(value)
    }
}
