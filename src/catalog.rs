//! Channel catalog: fetched from the YouTube Data API, kept in the response
//! cache for an hour, searched in memory.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    cache::ResponseCache,
    config::CatalogSettings,
    models::{CachedCatalog, CatalogItem},
    upstream::{HttpClient, OutboundRequest, UpstreamError},
};

/// The channel is process-wide configuration, so one key is enough.
pub const CATALOG_CACHE_KEY: &str = "catalog:channel-items";
pub const CATALOG_TTL: Duration = Duration::from_secs(60 * 60);

const VIDEO_KIND: &str = "youtube#video";

/// Where catalog items come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_items(&self) -> Result<Vec<CatalogItem>, UpstreamError>;
}

pub struct YoutubeCatalogSource {
    http: HttpClient,
    settings: CatalogSettings,
}

impl YoutubeCatalogSource {
    pub fn new(settings: CatalogSettings) -> Self {
        Self {
            http: HttpClient::new(settings.timeout),
            settings,
        }
    }
}

#[async_trait]
impl CatalogSource for YoutubeCatalogSource {
    async fn fetch_items(&self) -> Result<Vec<CatalogItem>, UpstreamError> {
        let (Some(api_key), Some(channel_id)) =
            (&self.settings.api_key, &self.settings.channel_id)
        else {
            return Err(UpstreamError::NotConfigured {
                service: "catalog source",
            });
        };

        let request = OutboundRequest::get(format!("{}/search", self.settings.api_url))
            .query("part", "snippet,id")
            .query("channelId", channel_id.as_str())
            .query("order", "date")
            .query("type", "video")
            .query("maxResults", self.settings.max_results.to_string())
            .query("key", api_key.as_str());
        let response: SearchResponse = self.http.get_json(request).await?;
        response.into_catalog_items()
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    id: SearchItemId,
    snippet: Option<Snippet>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    kind: String,
    video_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: String,
    #[serde(default)]
    description: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    channel_title: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Default, Deserialize)]
struct Thumbnails {
    high: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

impl Thumbnails {
    fn best(self) -> Option<String> {
        [self.high, self.medium, self.default]
            .into_iter()
            .flatten()
            .map(|thumbnail| thumbnail.url)
            .find(|url| !url.trim().is_empty())
    }
}

impl SearchResponse {
    /// Validates the payload. Non-video results are skipped; a video entry
    /// missing required data rejects the whole response.
    fn into_catalog_items(self) -> Result<Vec<CatalogItem>, UpstreamError> {
        let mut items = Vec::with_capacity(self.items.len());
        for item in self.items {
            if item.id.kind != VIDEO_KIND {
                continue;
            }
            let id = item
                .id
                .video_id
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| UpstreamError::Malformed("video result without videoId".into()))?;
            let snippet = item
                .snippet
                .ok_or_else(|| UpstreamError::Malformed(format!("video {id} has no snippet")))?;
            let thumbnail_url = snippet
                .thumbnails
                .best()
                .ok_or_else(|| UpstreamError::Malformed(format!("video {id} has no thumbnail")))?;
            items.push(CatalogItem {
                id,
                title: snippet.title,
                description: snippet.description,
                thumbnail_url,
                published_at: snippet.published_at,
                owner_label: snippet.channel_title,
            });
        }
        Ok(items)
    }
}

/// Catalog reads go through the response cache; upstream failures surface as
/// an empty list.
#[derive(Clone)]
pub struct CatalogService {
    cache: Arc<dyn ResponseCache>,
    source: Arc<dyn CatalogSource>,
}

impl CatalogService {
    pub fn new(cache: Arc<dyn ResponseCache>, source: Arc<dyn CatalogSource>) -> Self {
        Self { cache, source }
    }

    pub async fn list_channel_items(&self) -> Vec<CatalogItem> {
        if let Some(raw) = self.cache.get(CATALOG_CACHE_KEY).await {
            match serde_json::from_str::<CachedCatalog>(&raw) {
                Ok(cached) => {
                    debug!(items = cached.items.len(), "catalog cache hit");
                    return cached.items;
                }
                Err(err) => warn!(error = %err, "discarding unreadable cached catalog"),
            }
        }

        debug!("catalog cache miss");
        let items = match self.source.fetch_items().await {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "catalog source unavailable");
                return Vec::new();
            }
        };

        let cached = CachedCatalog {
            items,
            cached_at: Utc::now(),
            ttl_seconds: CATALOG_TTL.as_secs(),
        };
        match serde_json::to_string(&cached) {
            Ok(raw) => self.cache.set(CATALOG_CACHE_KEY, raw, CATALOG_TTL).await,
            Err(err) => warn!(error = %err, "failed to serialize catalog for caching"),
        }
        cached.items
    }

    pub async fn search(&self, query: &str) -> Vec<CatalogItem> {
        filter_items(self.list_channel_items().await, query)
    }

    pub async fn find_item(&self, id: &str) -> Option<CatalogItem> {
        self.list_channel_items()
            .await
            .into_iter()
            .find(|item| item.id == id)
    }
}

/// Case-insensitive substring match on title or description, catalog order.
pub fn filter_items(items: Vec<CatalogItem>, query: &str) -> Vec<CatalogItem> {
    let needle = query.trim().to_lowercase();
    items
        .into_iter()
        .filter(|item| {
            item.title.to_lowercase().contains(&needle)
                || item.description.to_lowercase().contains(&needle)
        })
        .collect()
}
