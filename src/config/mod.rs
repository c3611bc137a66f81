//! Configuration management.
//!
//! The engine reads one process-wide [`LaminarkConfig`] plus small
//! per-project JSON files stored beside the database:
//!
//! - `topic-detection.json`: shift sensitivity and manual threshold
//! - `graph-extraction.json`: per-type entity confidence gates
//! - `tool-verbosity.json`: response verbosity level
//! - `cross-access-<projectHash>.json`: cross-project read allow-list
//!
//! Missing files mean defaults; malformed files are logged and treated as
//! missing rather than failing the engine.

use crate::models::Verbosity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that raises the log level.
pub const DEBUG_ENV: &str = "LAMINARK_DEBUG";

/// Environment variable selecting the optional visualization port.
pub const WEB_PORT_ENV: &str = "LAMINARK_WEB_PORT";

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct LaminarkConfig {
    /// Data directory holding the database and per-project config files.
    pub data_dir: PathBuf,
    /// Path to the embedded database.
    pub db_path: PathBuf,
    /// Default tool-response verbosity.
    pub verbosity: Verbosity,
    /// Embedding pipeline poll interval.
    pub embedding_interval: Duration,
    /// Classifier/enricher cadence.
    pub enrichment_interval: Duration,
    /// Curation cycle cadence.
    pub curation_interval: Duration,
    /// Status-cache refresh cadence.
    pub status_interval: Duration,
    /// Observations fetched per embedding cycle.
    pub embedding_batch: usize,
    /// Observations classified per enrichment cycle.
    pub enrichment_batch: usize,
    /// Concurrent classification workers per cycle.
    pub enrichment_concurrency: usize,
    /// Cosine similarity above which a save is rejected as a near-duplicate.
    pub near_duplicate_threshold: f32,
    /// Optional visualization port (`LAMINARK_WEB_PORT`), for the external
    /// web layer.
    pub web_port: Option<u16>,
    /// Disables the visualization server (`--no_gui`).
    pub no_gui: bool,
}

impl LaminarkConfig {
    /// Builds configuration from the environment with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let data_dir = directories::BaseDirs::new()
            .map_or_else(|| PathBuf::from("."), |b| b.data_local_dir().to_path_buf())
            .join("laminark");
        Self::with_data_dir(data_dir)
    }

    /// Builds configuration rooted at an explicit data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let db_path = data_dir.join("laminark.db");
        let web_port = std::env::var(WEB_PORT_ENV)
            .ok()
            .and_then(|v| v.parse().ok());
        Self {
            data_dir,
            db_path,
            verbosity: Verbosity::Standard,
            embedding_interval: Duration::from_secs(5),
            enrichment_interval: Duration::from_secs(30),
            curation_interval: Duration::from_secs(300),
            status_interval: Duration::from_secs(60),
            embedding_batch: 10,
            enrichment_batch: 10,
            enrichment_concurrency: 3,
            near_duplicate_threshold: 0.92,
            web_port,
            no_gui: false,
        }
    }

    /// Returns true when `LAMINARK_DEBUG=1` is set.
    #[must_use]
    pub fn debug_enabled() -> bool {
        std::env::var(DEBUG_ENV).is_ok_and(|v| v == "1")
    }
}

/// Topic-shift detector sensitivity presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShiftSensitivity {
    /// k = 1.0: shifts confirm easily.
    Sensitive,
    /// k = 1.5.
    #[default]
    Balanced,
    /// k = 2.5: only large jumps confirm.
    Relaxed,
}

impl ShiftSensitivity {
    /// Sensitivity multiplier applied to the EWMA standard deviation.
    #[must_use]
    pub const fn multiplier(self) -> f32 {
        match self {
            Self::Sensitive => 1.0,
            Self::Balanced => 1.5,
            Self::Relaxed => 2.5,
        }
    }
}

/// Per-project topic-detection settings (`topic-detection.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicDetectionConfig {
    /// Sensitivity preset for the adaptive threshold.
    pub sensitivity: ShiftSensitivity,
    /// Manual threshold override; disables adaptation when set.
    pub manual_threshold: Option<f32>,
    /// EWMA decay factor.
    pub alpha: f32,
}

impl Default for TopicDetectionConfig {
    fn default() -> Self {
        Self {
            sensitivity: ShiftSensitivity::Balanced,
            manual_threshold: None,
            alpha: 0.3,
        }
    }
}

/// Per-project entity extraction gates (`graph-extraction.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphExtractionConfig {
    /// Minimum confidence for file entities.
    pub file_threshold: f32,
    /// Minimum confidence for decision entities.
    pub decision_threshold: f32,
    /// Minimum confidence for problem entities.
    pub problem_threshold: f32,
    /// Minimum confidence for solution entities.
    pub solution_threshold: f32,
    /// Minimum confidence for reference entities.
    pub reference_threshold: f32,
    /// Minimum confidence for project entities.
    pub project_threshold: f32,
    /// Confidence multiplier for file entities on non-change observations.
    pub non_change_file_factor: f32,
    /// Maximum file entities kept per observation.
    pub max_file_entities: usize,
}

impl Default for GraphExtractionConfig {
    fn default() -> Self {
        Self {
            file_threshold: 0.95,
            decision_threshold: 0.65,
            problem_threshold: 0.60,
            solution_threshold: 0.60,
            reference_threshold: 0.85,
            project_threshold: 0.80,
            non_change_file_factor: 0.74,
            max_file_entities: 5,
        }
    }
}

impl GraphExtractionConfig {
    /// Minimum confidence for a node type.
    #[must_use]
    pub const fn threshold_for(&self, node_type: crate::models::NodeType) -> f32 {
        use crate::models::NodeType;
        match node_type {
            NodeType::File => self.file_threshold,
            NodeType::Decision => self.decision_threshold,
            NodeType::Problem => self.problem_threshold,
            NodeType::Solution => self.solution_threshold,
            NodeType::Reference => self.reference_threshold,
            NodeType::Project => self.project_threshold,
        }
    }
}

/// Per-project tool verbosity (`tool-verbosity.json`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolVerbosityConfig {
    /// Verbosity level for tool responses.
    pub level: Verbosity,
}

/// Per-project cross-access allow-list (`cross-access-<hash>.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CrossAccessConfig {
    /// Project hashes this project may read from.
    pub allow: Vec<String>,
}

/// Loads a per-project JSON config file, falling back to defaults.
///
/// A malformed file is logged and treated as missing: configuration can
/// degrade the experience but must never take the engine down.
#[must_use]
pub fn load_project_config<T>(data_dir: &Path, file_name: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    let path = data_dir.join(file_name);
    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(file = %path.display(), error = %e, "malformed config file, using defaults");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// File name of the cross-access allow-list for a project.
#[must_use]
pub fn cross_access_file(project_hash: &str) -> String {
    format!("cross-access-{project_hash}.json")
}
