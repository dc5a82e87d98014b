//! Entities returned by the upstream API, and profile identifiers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::ProxyError;

/// Length of the compact (undashed) identifier form.
const COMPACT_LEN: usize = 32;
/// Length of the canonical dashed UUID form.
const CANONICAL_LEN: usize = 36;

/// A profile identifier.
///
/// Accepted either as 32 hex digits (the upstream's compact form) or as a
/// canonical dashed UUID. Both forms map onto the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier(Uuid);

impl Identifier {
    /// Parse either identifier form, returning `None` for anything else
    /// (including names).
    pub fn parse(input: &str) -> Option<Self> {
        let well_formed = match input.len() {
            COMPACT_LEN => input.bytes().all(|b| b.is_ascii_hexdigit()),
            CANONICAL_LEN => input.char_indices().all(|(i, c)| match i {
                8 | 13 | 18 | 23 => c == '-',
                _ => c.is_ascii_hexdigit(),
            }),
            _ => false,
        };

        if !well_formed {
            return None;
        }

        Uuid::try_parse(input).ok().map(Self)
    }

    /// Lowercase compact form, as used by the upstream and in cache keys.
    pub fn to_compact(&self) -> String {
        self.0.simple().to_string()
    }

    /// Lowercase canonical dashed form.
    pub fn to_canonical(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl FromStr for Identifier {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ProxyError::InvalidRequest(format!("not an identifier: {s}")))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A full profile as returned by the session server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<ProfileProperty>,
}

impl Profile {
    /// Decode the payload of every `textures` property in place.
    ///
    /// The raw `value` and `signature` are kept so the payload can still be
    /// verified. A payload that fails to decode is left undecoded.
    pub fn decode_textures(&mut self) {
        for property in &mut self.properties {
            if property.name != TEXTURES_PROPERTY {
                continue;
            }
            match ProfileTextures::from_base64(&property.value) {
                Ok(textures) => property.textures = Some(textures),
                Err(e) => warn!(profile = %self.id, error = %e, "Could not decode textures property"),
            }
        }
    }
}

/// Name of the property carrying skin and cape information.
pub const TEXTURES_PROPERTY: &str = "textures";

/// A signed profile property, such as `textures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileProperty {
    pub name: String,
    /// Base64 payload as signed by the upstream
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Decoded payload of a `textures` property
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub textures: Option<ProfileTextures>,
}

/// The decoded payload of a `textures` property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTextures {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub profile_id: String,
    pub profile_name: String,
    /// Textures by kind, e.g. `SKIN` or `CAPE`
    #[serde(default)]
    pub textures: BTreeMap<String, Texture>,
}

/// One texture and its metadata, such as the skin model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Texture {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ProfileTextures {
    /// Decode a base64 `textures` property value.
    pub fn from_base64(encoded: &str) -> Result<Self, ProxyError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProxyError::InvalidResponse(format!("textures are not base64: {e}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// A name-to-identifier mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    pub id: String,
    pub name: String,
}

/// One entry of a profile's name history. The first entry has no change time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameChange {
    pub name: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub changed_to_at: Option<DateTime<Utc>>,
}
