// Measurement Attribution - Core Library
// Matches pending conversion triggers to ad sources and emits privacy-bounded reports

pub mod aggregation;
pub mod attribution;
pub mod dao;
pub mod datastore;
pub mod db;
pub mod entities;
pub mod error;
pub mod filter;
pub mod flags;
pub mod reporting;
pub mod web;
pub mod xna;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use attribution::{AttributionEngine, IgnoreReason, TriggerOutcome};
pub use dao::{DaoCall, InMemoryDatastore, MeasurementDao, SqliteMeasurementDao, TransactionCounts};
pub use datastore::{DatastoreManager, SqliteDatastore, SqliteTransaction};
pub use entities::{
    AggregateDeduplicationKey, AggregateHistogramContribution, AggregateReport,
    AggregateReportStatus, AggregateTriggerData, Attribution, AttributionConfig, AttributionMode,
    DebugReportStatus, EventReport, EventReportStatus, EventSurfaceType, EventTrigger,
    PriorityRange, Source, SourceStatus, SourceType, Trigger, TriggerStatus,
};
pub use error::{AttributionError, DatastoreError};
pub use filter::{FilterMap, FilterSet};
pub use flags::Flags;
pub use reporting::{NoiseHandler, ReportWindowCalculator, SourceNoiseHandler};
pub use aggregation::{FixedReportDelay, RandomReportDelay, ReportDelay};
pub use xna::{DerivedSourceGenerator, XnaSourceCreator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
