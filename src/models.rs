//! Data shapes shared between the catalog, the conversion gateway and the
//! HTTP layer.
//!
//! Everything here is serialized with camelCase keys because the browser
//! client consumes these structs directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One video of the configured channel, as exposed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub thumbnail_url: String,
    pub published_at: DateTime<Utc>,
    pub owner_label: String,
}

/// Serialized form of the catalog stored in the response cache. The whole
/// value is replaced on refresh, never patched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCatalog {
    pub items: Vec<CatalogItem>,
    pub cached_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lives for exactly one outbound conversion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub item_id: String,
    pub media_kind: MediaKind,
    pub quality_tier: String,
}

impl ConversionRequest {
    pub fn new(
        item_id: impl Into<String>,
        media_kind: MediaKind,
        quality_tier: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            media_kind,
            quality_tier: quality_tier.into(),
        }
    }
}

/// A direct download link handed out by the conversion service.
///
/// `expires_at` is what we advertise to the client; the real expiry is owned
/// by the upstream service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResult {
    pub download_url: String,
    pub title: String,
    pub quality: String,
    pub media_kind: MediaKind,
    pub expires_at: DateTime<Utc>,
}

/// Entry of the static download menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOption {
    pub quality: &'static str,
    pub format: &'static str,
    pub label: &'static str,
    pub size: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOptions {
    pub video: Vec<DownloadOption>,
    pub audio: Vec<DownloadOption>,
}
