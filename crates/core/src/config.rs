use serde::Deserialize;

use crate::error::SegmentResult;

/// Default cap on donors returned by a rule preview.
pub const DEFAULT_PREVIEW_LIMIT: usize = 100;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DONOR_SEGMENTS__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub segments: SegmentsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentsConfig {
    /// Maximum number of donors returned by a rule preview.
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,
    /// Re-run membership sync before a segment read returns.
    #[serde(default = "default_resync_on_read")]
    pub resync_on_read: bool,
}

/// Day thresholds for classifying retention risk by time since last gift.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_low_max_days")]
    pub low_max_days: i64,
    #[serde(default = "default_medium_max_days")]
    pub medium_max_days: i64,
    #[serde(default = "default_high_max_days")]
    pub high_max_days: i64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_preview_limit() -> usize {
    DEFAULT_PREVIEW_LIMIT
}
fn default_resync_on_read() -> bool {
    false
}
fn default_low_max_days() -> i64 {
    180
}
fn default_medium_max_days() -> i64 {
    365
}
fn default_high_max_days() -> i64 {
    730
}

impl Default for SegmentsConfig {
    fn default() -> Self {
        Self {
            preview_limit: default_preview_limit(),
            resync_on_read: default_resync_on_read(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            low_max_days: default_low_max_days(),
            medium_max_days: default_medium_max_days(),
            high_max_days: default_high_max_days(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            segments: SegmentsConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> SegmentResult<Self> {
        Self::from_source(
            config::Environment::with_prefix("DONOR_SEGMENTS")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn from_source<S>(source: S) -> SegmentResult<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder().add_source(source).build()?;
        Ok(config.try_deserialize()?)
    }
}
