//! Upstream API access: entities, the per-address client and the pooled fetcher.

mod client;
mod fetcher;
mod model;

pub use client::{UpstreamClient, UpstreamSettings, MAX_BATCH_NAMES};
pub use fetcher::{Fetcher, PooledFetcher};
pub use model::{
    Identifier, NameChange, NameRecord, Profile, ProfileProperty, ProfileTextures, Texture, TEXTURES_PROPERTY,
};
