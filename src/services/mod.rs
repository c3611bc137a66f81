//! Pipeline services: admission, dedup, enrichment, detection, curation,
//! context assembly, and routing.

// Allow cast_precision_loss for score calculations where exact precision is
// not critical.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening as dropping slightly early provides no
// benefit on these short critical sections.
#![allow(clippy::significant_drop_tightening)]

pub mod admission;
pub mod branch_tracker;
pub mod context;
pub mod curation;
pub mod debug_tracker;
pub mod enricher;
pub mod ingest;
pub mod routing;
pub mod save_guard;
pub mod status;
pub mod topic_shift;

pub use admission::{Admission, AdmissionFilter};
pub use branch_tracker::{BranchTracker, CategoryCounts, ToolCategory, categorize_tool, infer_arc_stage};
pub use context::ContextInjector;
pub use curation::{CurationAgent, CurationStats};
pub use debug_tracker::DebugTracker;
pub use enricher::{Enricher, EnricherStats, apply_quality_gate};
pub use ingest::{IngestReport, ingest_directory, ingest_file};
pub use routing::{RoutingContext, RoutingEngine};
pub use save_guard::SaveGuard;
pub use status::{StatusCache, StatusSnapshot};
pub use topic_shift::TopicShiftDetector;
