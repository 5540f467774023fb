//! Boundary decoding for server-push events, worker messages and worker
//! lifecycle signals
//!
//! Payloads arrive untyped; everything past this module works with the
//! closed enums below.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::LiveConfig;
use crate::error::DecodeError;
use crate::host::PageMetadata;
use crate::selection::Location;

/// Named events pushed by the server over the live session.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Full airport catalog
    Airports { airports: Vec<Location> },
    /// Catalog download progress in percent
    PushDownload { progress: f64 },
}

#[derive(Deserialize)]
struct AirportsPayload {
    airports: Vec<Location>,
}

#[derive(Deserialize)]
struct ProgressPayload {
    progress: f64,
}

impl ServerEvent {
    pub const AIRPORTS: &'static str = "airports";
    pub const PUSH_DOWNLOAD: &'static str = "push_download";

    pub fn decode(name: &str, payload: &serde_json::Value) -> Result<Self, DecodeError> {
        let malformed = |source| DecodeError::Payload {
            event: name.to_string(),
            source,
        };

        match name {
            Self::AIRPORTS => {
                let p = AirportsPayload::deserialize(payload).map_err(malformed)?;
                Ok(ServerEvent::Airports {
                    airports: p.airports,
                })
            }
            Self::PUSH_DOWNLOAD => {
                let p = ProgressPayload::deserialize(payload).map_err(malformed)?;
                Ok(ServerEvent::PushDownload {
                    progress: p.progress,
                })
            }
            other => Err(DecodeError::UnknownEvent(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Airports { .. } => Self::AIRPORTS,
            ServerEvent::PushDownload { .. } => Self::PUSH_DOWNLOAD,
        }
    }

    /// Download finished, the download control can unlock.
    pub fn is_download_complete(&self) -> bool {
        matches!(self, ServerEvent::PushDownload { progress } if *progress > 99.9)
    }
}

/// Messages posted from the page to the background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    CacheUrls {
        #[serde(rename = "urlsToCache")]
        urls_to_cache: Vec<String>,
    },
    SkipWaiting,
}

impl WorkerMessage {
    pub fn decode(value: &serde_json::Value) -> Result<Self, DecodeError> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing>")
            .to_string();

        match kind.as_str() {
            "CACHE_URLS" | "SKIP_WAITING" => {
                Self::deserialize(value).map_err(|source| DecodeError::Payload {
                    event: kind.clone(),
                    source,
                })
            }
            _ => Err(DecodeError::UnknownEvent(kind)),
        }
    }
}

/// Signals raised by the worker container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycleEvent {
    /// A newer worker version is installing
    UpdateFound,
    /// A different worker took control of the page
    ControllerChange,
}

impl FromStr for WorkerLifecycleEvent {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "updatefound" => Ok(WorkerLifecycleEvent::UpdateFound),
            "controllerchange" => Ok(WorkerLifecycleEvent::ControllerChange),
            other => Err(DecodeError::UnknownEvent(other.to_string())),
        }
    }
}

/// Connection parameters for the external live-session transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSessionParams {
    pub endpoint: String,
    pub csrf_token: String,
    pub long_poll_fallback_ms: u64,
}

impl LiveSessionParams {
    /// Read the anti-forgery token from page metadata.
    pub fn from_page(page: &dyn PageMetadata, config: &LiveConfig) -> Result<Self, DecodeError> {
        let csrf_token = page
            .meta_content(&config.csrf_meta_name)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DecodeError::MissingMetadata(config.csrf_meta_name.clone()))?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            csrf_token,
            long_poll_fallback_ms: config.long_poll_fallback_ms,
        })
    }

    /// Query parameters sent on connect.
    pub fn connect_params(&self) -> Vec<(&'static str, &str)> {
        vec![("_csrf_token", self.csrf_token.as_str())]
    }
}
