//! Gateway to the external conversion service.
//!
//! Every call is a fresh outbound request: nothing is cached or deduplicated,
//! and failures are returned as [`ConversionOutcome::Failed`] without retry.

use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    config::ConverterSettings,
    models::{ConversionRequest, ConversionResult, DownloadOption, DownloadOptions, MediaKind},
    upstream::{HttpClient, OutboundRequest, UpstreamError},
};

/// Advertised lifetime of a download link. The conversion service owns the
/// real expiry.
pub const DOWNLOAD_LINK_VALIDITY_HOURS: i64 = 24;
/// Tier used by the stream endpoint.
pub const STREAM_QUALITY: &str = "320kbps";
pub const DEFAULT_VIDEO_QUALITY: &str = "720p";

const SOURCE_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

const VIDEO_OPTIONS: [DownloadOption; 3] = [
    DownloadOption {
        quality: "1080p",
        format: "mp4",
        label: "Full HD (1080p)",
        size: "~250 MB",
    },
    DownloadOption {
        quality: "720p",
        format: "mp4",
        label: "HD (720p)",
        size: "~120 MB",
    },
    DownloadOption {
        quality: "480p",
        format: "mp4",
        label: "SD (480p)",
        size: "~60 MB",
    },
];

const AUDIO_OPTIONS: [DownloadOption; 4] = [
    DownloadOption {
        quality: "320kbps",
        format: "mp3",
        label: "MP3 320 kbps",
        size: "~10 MB",
    },
    DownloadOption {
        quality: "192kbps",
        format: "mp3",
        label: "MP3 192 kbps",
        size: "~6 MB",
    },
    DownloadOption {
        quality: "128kbps",
        format: "mp3",
        label: "MP3 128 kbps",
        size: "~4 MB",
    },
    DownloadOption {
        quality: "flac",
        format: "flac",
        label: "FLAC (lossless)",
        size: "~35 MB",
    },
];

/// The download menu shown to the user. It does not depend on the item.
pub fn download_options(_item_id: &str) -> DownloadOptions {
    DownloadOptions {
        video: VIDEO_OPTIONS.to_vec(),
        audio: AUDIO_OPTIONS.to_vec(),
    }
}

pub fn default_quality(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => STREAM_QUALITY,
        MediaKind::Video => DEFAULT_VIDEO_QUALITY,
    }
}

/// The conversion service wants a full watch URL, not a bare id.
pub fn source_url(item_id: &str) -> String {
    format!("{SOURCE_URL_PREFIX}{item_id}")
}

/// Upstream endpoint variant for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Mp3 { bitrate: Option<u32> },
    Audio { format: String },
    Video { quality: String },
}

impl Endpoint {
    pub fn select(kind: MediaKind, quality_tier: &str) -> Self {
        let tier = quality_tier.trim().to_ascii_lowercase();
        match kind {
            MediaKind::Video => Self::Video { quality: tier },
            MediaKind::Audio if tier == "mp3" => Self::Mp3 { bitrate: None },
            MediaKind::Audio => match tier
                .strip_suffix("kbps")
                .and_then(|value| value.parse::<u32>().ok())
            {
                Some(bitrate) => Self::Mp3 {
                    bitrate: Some(bitrate),
                },
                None => Self::Audio { format: tier },
            },
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Self::Mp3 { .. } => "mp3",
            Self::Audio { .. } => "audio",
            Self::Video { .. } => "video",
        }
    }

    fn build(&self, base_url: &str, source: String) -> OutboundRequest {
        let request =
            OutboundRequest::get(format!("{base_url}/{}", self.path())).query("url", source);
        match self {
            Self::Mp3 {
                bitrate: Some(bitrate),
            } => request.query("bitrate", bitrate.to_string()),
            Self::Mp3 { bitrate: None } => request,
            Self::Audio { format } => request.query("format", format.as_str()),
            Self::Video { quality } => request.query("quality", quality.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    Ready(ConversionResult),
    Failed { message: String },
}

#[derive(Deserialize)]
struct ConverterResponse {
    #[serde(default)]
    success: bool,
    result: Option<ConverterPayload>,
    message: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ConverterPayload {
    download_url: Option<String>,
    title: Option<String>,
    quality: Option<String>,
}

#[derive(Clone)]
pub struct ConversionGateway {
    http: HttpClient,
    settings: ConverterSettings,
}

impl ConversionGateway {
    pub fn new(settings: ConverterSettings) -> Self {
        Self {
            http: HttpClient::new(settings.timeout),
            settings,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.api_url.is_some()
    }

    pub async fn convert(&self, request: &ConversionRequest) -> ConversionOutcome {
        match self.try_convert(request).await {
            Ok(result) => ConversionOutcome::Ready(result),
            Err(err) => {
                warn!(
                    item = %request.item_id,
                    kind = %request.media_kind,
                    quality = %request.quality_tier,
                    error = %err,
                    "conversion failed"
                );
                ConversionOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Fresh playable URL for the player: audio at the highest bitrate.
    pub async fn stream(&self, item_id: &str) -> ConversionOutcome {
        self.convert(&ConversionRequest::new(
            item_id,
            MediaKind::Audio,
            STREAM_QUALITY,
        ))
        .await
    }

    async fn try_convert(
        &self,
        request: &ConversionRequest,
    ) -> Result<ConversionResult, UpstreamError> {
        let base_url = self
            .settings
            .api_url
            .as_deref()
            .ok_or(UpstreamError::NotConfigured {
                service: "conversion service",
            })?;

        let endpoint = Endpoint::select(request.media_kind, &request.quality_tier);
        debug!(item = %request.item_id, ?endpoint, "requesting conversion");
        let mut outbound = endpoint.build(base_url, source_url(&request.item_id));
        if let Some(key) = &self.settings.api_key {
            outbound = outbound.header("x-rapidapi-key", key.as_str());
        }
        if let Some(host) = &self.settings.api_host {
            outbound = outbound.header("x-rapidapi-host", host.as_str());
        }

        let response: ConverterResponse = self.http.get_json(outbound).await?;
        if !response.success {
            let reason = response
                .message
                .or(response.error)
                .unwrap_or_else(|| "conversion was not successful".to_string());
            return Err(UpstreamError::Rejected(reason));
        }

        let payload = response
            .result
            .ok_or_else(|| UpstreamError::Malformed("missing result".into()))?;
        let download_url = payload
            .download_url
            .map(|url| url.trim().to_string())
            .filter(|url| url.starts_with("https://") || url.starts_with("http://"))
            .ok_or_else(|| UpstreamError::Malformed("missing or invalid download_url".into()))?;

        Ok(ConversionResult {
            download_url,
            title: payload
                .title
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| request.item_id.clone()),
            quality: payload
                .quality
                .filter(|quality| !quality.trim().is_empty())
                .unwrap_or_else(|| request.quality_tier.clone()),
            media_kind: request.media_kind,
            expires_at: Utc::now() + TimeDelta::hours(DOWNLOAD_LINK_VALIDITY_HOURS),
        })
    }
}
