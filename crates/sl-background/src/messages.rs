//! Message channel wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sl_core::{MemorySample, QualityResult};

/// Message types the service understands
const KNOWN_TYPES: &[&str] = &[
    "PING",
    "OPEN_TIMELINE",
    "ANALYZE_UPDATE_QUALITY",
    "GET_MEMORY_STATS",
    "FORCE_CLEANUP",
    "INVALIDATE_QUALITY_CACHE",
    "GET_MONITORING_STATUS",
    "SET_MONITORING",
    "CONFIGURE_MEMORY_MONITOR",
];

/// A request arriving on the message channel, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum BackgroundMessage {
    Ping,
    OpenTimeline,
    AnalyzeUpdateQuality {
        update_id: Option<String>,
        update_text: Option<String>,
        update_type: Option<String>,
        state: Option<String>,
    },
    GetMemoryStats,
    ForceCleanup,
    InvalidateQualityCache {
        fingerprint: Option<String>,
    },
    GetMonitoringStatus,
    SetMonitoring {
        enabled: bool,
    },
    ConfigureMemoryMonitor {
        threshold_percent: Option<f64>,
        interval_seconds: Option<u64>,
    },
}

/// Result of decoding a raw message
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Message(BackgroundMessage),
    /// Missing or unrecognized `type`
    Unknown,
    /// Known `type` with malformed fields
    Invalid(String),
}

impl BackgroundMessage {
    pub fn decode(value: Value) -> DecodedMessage {
        let known = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| KNOWN_TYPES.contains(&kind));
        if !known {
            return DecodedMessage::Unknown;
        }

        match serde_json::from_value(value) {
            Ok(message) => DecodedMessage::Message(message),
            Err(e) => DecodedMessage::Invalid(e.to_string()),
        }
    }
}

/// Reply to one message. Absent fields are omitted from the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QualityResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MemorySample>,
    /// `Some(None)` serializes as `null` when no cleanup has run yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cleanup: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evicted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl BackgroundResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_result(mut self, result: QualityResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_stats(mut self, stats: MemorySample, last_cleanup: Option<DateTime<Utc>>) -> Self {
        self.stats = Some(stats);
        self.last_cleanup = Some(last_cleanup);
        self
    }

    pub fn with_evicted(mut self, evicted: usize) -> Self {
        self.evicted = Some(evicted);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }
}
