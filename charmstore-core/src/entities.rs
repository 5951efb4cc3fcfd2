//! Entity and base-entity documents served from the backing store.
//!
//! Documents are flat records: the URL fields are always present, every
//! descriptive field is optional and populated only when its bit was part
//! of the fetch's field selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::fields::{BaseEntityFields, EntityFields};
use crate::url::{BaseUrl, CharmUrl};

/// Compute the hex-encoded SHA-384 digest used for archive blob hashes.
pub fn blob_digest(content: &[u8]) -> String {
    let mut hasher = Sha384::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Read/write access control lists of a base entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclSet {
    /// Principals allowed to read the charm.
    pub read: Vec<String>,
    /// Principals allowed to write the charm.
    pub write: Vec<String>,
}

/// One specific revision of a charm or bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical, fully qualified URL.
    pub url: CharmUrl,
    /// URL of the associated base entity.
    pub base_url: BaseUrl,
    /// Promulgated URL, present when the entity is promulgated.
    pub promulgated_url: Option<CharmUrl>,
    /// Name of the archive blob in blob storage.
    pub blob_name: Option<String>,
    /// Hex-encoded SHA-384 digest of the archive blob.
    pub blob_hash: Option<String>,
    /// Size of the archive blob in bytes.
    pub size: Option<i64>,
    /// When the archive was uploaded.
    pub uploaded: Option<DateTime<Utc>>,
    /// Series the entity can be deployed on.
    pub supported_series: Option<Vec<String>>,
}

impl Entity {
    /// Copy of this record restricted to `fields`.
    ///
    /// The URL fields are kept regardless of the selection; every
    /// unselected descriptive field becomes `None`.
    pub fn with_fields(&self, fields: EntityFields) -> Entity {
        Entity {
            url: self.url.clone(),
            base_url: self.base_url.clone(),
            promulgated_url: if fields.contains(EntityFields::PROMULGATED_URL) {
                self.promulgated_url.clone()
            } else {
                None
            },
            blob_name: if fields.contains(EntityFields::BLOB_NAME) {
                self.blob_name.clone()
            } else {
                None
            },
            blob_hash: if fields.contains(EntityFields::BLOB_HASH) {
                self.blob_hash.clone()
            } else {
                None
            },
            size: if fields.contains(EntityFields::SIZE) {
                self.size
            } else {
                None
            },
            uploaded: if fields.contains(EntityFields::UPLOADED) {
                self.uploaded
            } else {
                None
            },
            supported_series: if fields.contains(EntityFields::SUPPORTED_SERIES) {
                self.supported_series.clone()
            } else {
                None
            },
        }
    }
}

/// Revision-independent metadata shared by all revisions of one charm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEntity {
    /// The base-entity URL.
    pub url: BaseUrl,
    /// The charm name.
    pub name: Option<String>,
    /// Whether the charm is publicly readable.
    pub public: Option<bool>,
    /// Access control lists.
    pub acls: Option<AclSet>,
    /// Whether the charm is promulgated.
    pub promulgated: Option<bool>,
}

impl BaseEntity {
    /// Copy of this record restricted to `fields`; the URL is always kept.
    pub fn with_fields(&self, fields: BaseEntityFields) -> BaseEntity {
        BaseEntity {
            url: self.url.clone(),
            name: if fields.contains(BaseEntityFields::NAME) {
                self.name.clone()
            } else {
                None
            },
            public: if fields.contains(BaseEntityFields::PUBLIC) {
                self.public
            } else {
                None
            },
            acls: if fields.contains(BaseEntityFields::ACLS) {
                self.acls.clone()
            } else {
                None
            },
            promulgated: if fields.contains(BaseEntityFields::PROMULGATED) {
                self.promulgated
            } else {
                None
            },
        }
    }
}
