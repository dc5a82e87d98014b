//! Cache key derivation.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::upstream::Identifier;

/// Kind of entity a cache key refers to; selects the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Profile,
    Name,
    NameHistory,
}

/// A normalized cache key.
///
/// Names are lowercased and identifiers are reduced to their compact form, so
/// two spellings of the same lookup always share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// `profile:<id>`
    Profile(String),
    /// `name:<name>` or `name:<epoch-seconds>:<name>`
    Name { name: String, at: Option<i64> },
    /// `name_history:<id>`
    NameHistory(String),
}

impl CacheKey {
    pub fn profile(id: &Identifier) -> Self {
        CacheKey::Profile(id.to_compact())
    }

    /// Key for the current mapping of `name`.
    pub fn name(name: &str) -> Self {
        CacheKey::Name {
            name: name.to_lowercase(),
            at: None,
        }
    }

    /// Key for the mapping of `name` at a point in time, or the current
    /// mapping when `at` is `None`.
    pub fn name_at(name: &str, at: Option<DateTime<Utc>>) -> Self {
        CacheKey::Name {
            name: name.to_lowercase(),
            at: at.map(|t| t.timestamp()),
        }
    }

    pub fn name_history(id: &Identifier) -> Self {
        CacheKey::NameHistory(id.to_compact())
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            CacheKey::Profile(_) => EntityKind::Profile,
            CacheKey::Name { .. } => EntityKind::Name,
            CacheKey::NameHistory(_) => EntityKind::NameHistory,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Profile(id) => write!(f, "profile:{id}"),
            CacheKey::Name { name, at: None } => write!(f, "name:{name}"),
            CacheKey::Name {
                name,
                at: Some(secs),
            } => write!(f, "name:{secs}:{name}"),
            CacheKey::NameHistory(id) => write!(f, "name_history:{id}"),
        }
    }
}
