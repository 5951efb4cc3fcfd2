//! Charm and bundle URL types used as cache keys.
//!
//! Two key shapes exist: [`CharmUrl`] identifies one entity (a specific
//! revision, or a partial reference the store resolves to the best match)
//! and [`BaseUrl`] identifies the revision-independent base entity shared
//! by all revisions of one charm name.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::UrlError;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]*[a-z][a-z0-9]*)*$").unwrap());
static SERIES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]+[a-z0-9]*$").unwrap());
static USER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.-]*$").unwrap());

/// Returns true if `name` is a valid charm or bundle name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Returns true if `series` is a valid series name.
pub fn is_valid_series(series: &str) -> bool {
    SERIES_RE.is_match(series)
}

/// Returns true if `user` is a valid user name.
pub fn is_valid_user(user: &str) -> bool {
    USER_RE.is_match(user)
}

/// URL schema distinguishing store-hosted from locally built charms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    /// The charm store.
    #[default]
    Cs,
    /// A locally built charm.
    Local,
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Cs => write!(f, "cs"),
            Schema::Local => write!(f, "local"),
        }
    }
}

/// Publication channel of an entity.
///
/// The channel is not part of the textual URL form; it is attached to a
/// lookup key programmatically and participates in key equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Unpublished,
    Edge,
    Beta,
    Candidate,
    Stable,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Unpublished => "unpublished",
            Channel::Edge => "edge",
            Channel::Beta => "beta",
            Channel::Candidate => "candidate",
            Channel::Stable => "stable",
        };
        write!(f, "{}", s)
    }
}

/// Structured URL identifying one entity, used as the entity cache key.
///
/// The textual form is `[schema:][~user/][series/]name[-revision]`, e.g.
/// `cs:~bob/trusty/wordpress-1`. A URL with both user and revision is
/// *fully qualified* and identifies exactly one entity; anything less is a
/// partial reference that the backing store resolves to the best match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharmUrl {
    pub schema: Schema,
    pub user: Option<String>,
    pub name: String,
    pub series: Option<String>,
    pub revision: Option<u32>,
    pub channel: Option<Channel>,
}

impl CharmUrl {
    /// Create a promulgated reference carrying only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: Schema::Cs,
            user: None,
            name: name.into(),
            series: None,
            revision: None,
            channel: None,
        }
    }

    /// Set the user component.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the series component.
    pub fn with_series(mut self, series: impl Into<String>) -> Self {
        self.series = Some(series.into());
        self
    }

    /// Set the revision component.
    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Set the channel component.
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Returns true if this URL identifies exactly one entity.
    pub fn is_fully_qualified(&self) -> bool {
        self.user.is_some() && self.revision.is_some()
    }

    /// The base-entity URL for this reference, derivable only when the
    /// user component is present.
    pub fn base(&self) -> Option<BaseUrl> {
        self.user.as_ref().map(|user| BaseUrl {
            schema: self.schema,
            user: user.clone(),
            name: self.name.clone(),
        })
    }
}

impl fmt::Display for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.schema)?;
        if let Some(user) = &self.user {
            write!(f, "~{}/", user)?;
        }
        if let Some(series) = &self.series {
            write!(f, "{}/", series)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(revision) = self.revision {
            write!(f, "-{}", revision)?;
        }
        Ok(())
    }
}

impl FromStr for CharmUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| UrlError::Malformed {
            url: s.to_string(),
            reason: reason.to_string(),
        };

        let (schema, rest) = match s.split_once(':') {
            Some(("cs", rest)) => (Schema::Cs, rest),
            Some(("local", rest)) => (Schema::Local, rest),
            Some((schema, _)) => {
                return Err(UrlError::InvalidSchema {
                    url: s.to_string(),
                    schema: schema.to_string(),
                })
            }
            None => (Schema::Cs, s),
        };
        if rest.is_empty() {
            return Err(malformed("empty URL"));
        }

        let mut parts: Vec<&str> = rest.split('/').collect();

        let user = if parts[0].starts_with('~') {
            let user = &parts[0][1..];
            if !is_valid_user(user) {
                return Err(UrlError::InvalidUser {
                    url: s.to_string(),
                    user: user.to_string(),
                });
            }
            parts.remove(0);
            Some(user.to_string())
        } else {
            None
        };

        let (series, name_rev) = match parts.len() {
            1 => (None, parts[0]),
            2 => (Some(parts[0]), parts[1]),
            _ => return Err(malformed("expected [~user/][series/]name[-revision]")),
        };
        if let Some(series) = series {
            if !is_valid_series(series) {
                return Err(UrlError::InvalidSeries {
                    url: s.to_string(),
                    series: series.to_string(),
                });
            }
        }

        // A trailing -<digits> suffix is the revision.
        let (name, revision) = match name_rev.rfind('-') {
            Some(idx) if name_rev[idx + 1..].chars().all(|c| c.is_ascii_digit())
                && !name_rev[idx + 1..].is_empty() =>
            {
                let revision =
                    name_rev[idx + 1..]
                        .parse::<u32>()
                        .map_err(|_| UrlError::InvalidRevision {
                            url: s.to_string(),
                            revision: name_rev[idx + 1..].to_string(),
                        })?;
                (&name_rev[..idx], Some(revision))
            }
            _ => (name_rev, None),
        };
        if !is_valid_name(name) {
            return Err(UrlError::InvalidName {
                url: s.to_string(),
                name: name.to_string(),
            });
        }

        Ok(CharmUrl {
            schema,
            user,
            name: name.to_string(),
            series: series.map(|s| s.to_string()),
            revision,
            channel: None,
        })
    }
}

/// Structured URL identifying a base entity: user and name only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseUrl {
    pub schema: Schema,
    pub user: String,
    pub name: String,
}

impl BaseUrl {
    /// Create a base-entity URL in the store schema.
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Schema::Cs,
            user: user.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:~{}/{}", self.schema, self.user, self.name)
    }
}

impl FromStr for BaseUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url: CharmUrl = s.parse()?;
        let malformed = |reason: &str| UrlError::Malformed {
            url: s.to_string(),
            reason: reason.to_string(),
        };
        if url.series.is_some() {
            return Err(malformed("base-entity URL cannot have a series"));
        }
        if url.revision.is_some() {
            return Err(malformed("base-entity URL cannot have a revision"));
        }
        let Some(user) = url.user else {
            return Err(malformed("base-entity URL requires a user"));
        };
        Ok(BaseUrl {
            schema: url.schema,
            user,
            name: url.name,
        })
    }
}
