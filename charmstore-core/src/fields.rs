//! Field-set algebra for field-selective fetches.
//!
//! The backing store populates only the requested fields of a document.
//! Field selections are value types with set-union as the combining
//! operation; the cache unions every selection it has ever seen and
//! fetches at least that set.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Operations shared by the entity and base-entity field selections.
///
/// Implemented by the two `bitflags` types below so that the cache can be
/// generic over the document kind it stores.
pub trait FieldSet: Copy + PartialEq + Send + Sync + 'static {
    /// The selection always included in every fetch.
    fn required() -> Self;

    /// The empty selection.
    fn none() -> Self;

    /// Set union.
    fn union(self, other: Self) -> Self;

    /// Returns true if `self` includes every field in `other`.
    fn includes(self, other: Self) -> bool;
}

bitflags! {
    /// Field selection for entity fetches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntityFields: u16 {
        /// The canonical entity URL.
        const URL = 0b0000_0001;
        /// The URL of the associated base entity.
        const BASE_URL = 0b0000_0010;
        /// The promulgated URL, if the entity is promulgated.
        const PROMULGATED_URL = 0b0000_0100;
        /// Name of the archive blob in blob storage.
        const BLOB_NAME = 0b0000_1000;
        /// Digest of the archive blob.
        const BLOB_HASH = 0b0001_0000;
        /// Size of the archive blob in bytes.
        const SIZE = 0b0010_0000;
        /// Upload timestamp.
        const UPLOADED = 0b0100_0000;
        /// Series the entity can be deployed on.
        const SUPPORTED_SERIES = 0b1000_0000;
    }
}

impl EntityFields {
    /// The fields present on every entity record.
    pub const fn required_fields() -> Self {
        Self::URL.union(Self::BASE_URL)
    }
}

impl Default for EntityFields {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Field selection for base-entity fetches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BaseEntityFields: u8 {
        /// The base-entity URL.
        const URL = 0b0000_0001;
        /// The charm name.
        const NAME = 0b0000_0010;
        /// Whether the charm is publicly readable.
        const PUBLIC = 0b0000_0100;
        /// Read/write access control lists.
        const ACLS = 0b0000_1000;
        /// Whether the charm is promulgated.
        const PROMULGATED = 0b0001_0000;
    }
}

impl BaseEntityFields {
    /// The fields present on every base-entity record.
    pub const fn required_fields() -> Self {
        Self::URL
    }
}

impl Default for BaseEntityFields {
    fn default() -> Self {
        Self::empty()
    }
}

impl FieldSet for EntityFields {
    fn required() -> Self {
        Self::required_fields()
    }

    fn none() -> Self {
        Self::empty()
    }

    fn union(self, other: Self) -> Self {
        self | other
    }

    fn includes(self, other: Self) -> bool {
        self.contains(other)
    }
}

impl FieldSet for BaseEntityFields {
    fn required() -> Self {
        Self::required_fields()
    }

    fn none() -> Self {
        Self::empty()
    }

    fn union(self, other: Self) -> Self {
        self | other
    }

    fn includes(self, other: Self) -> bool {
        self.contains(other)
    }
}

// Manual serde implementations (bitflags 2.x + serde)
impl Serialize for EntityFields {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityFields {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u16::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid EntityFields bits: {:#06x}", bits))
        })
    }
}

impl Serialize for BaseEntityFields {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BaseEntityFields {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid BaseEntityFields bits: {:#04x}", bits))
        })
    }
}
