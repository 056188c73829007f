// Measurement DAO - Query/mutation surface used by the attribution engine
//
// One trait, two adapters:
// - sqlite: backed by a SQLite transaction
// - memory: plain collections, for tests and failure injection

pub mod memory;
pub mod query;
pub mod sqlite;

pub use memory::{DaoCall, InMemoryDatastore, InMemoryMeasurementDao, TransactionCounts};
pub use query::{Condition, Select, SitePattern};
pub use sqlite::SqliteMeasurementDao;

use crate::entities::{
    AggregateReport, Attribution, EventReport, EventSurfaceType, Source, SourceStatus, Trigger,
    TriggerStatus,
};
use crate::error::Result;

/// Every call runs inside the transaction that produced the DAO.
///
/// Updates fail with `UpdateCountMismatch` when the number of rows touched
/// differs from the number requested; getters fail with `NotFound`.
pub trait MeasurementDao {
    // ========================================================================
    // TRIGGERS
    // ========================================================================
    fn insert_trigger(&mut self, trigger: &Trigger) -> Result<()>;

    /// Ids of PENDING triggers, oldest trigger time first
    fn get_pending_trigger_ids(&self) -> Result<Vec<String>>;

    fn get_trigger(&self, trigger_id: &str) -> Result<Trigger>;

    fn update_trigger_status(&mut self, trigger_ids: &[String], status: TriggerStatus) -> Result<()>;

    // ========================================================================
    // SOURCES
    // ========================================================================
    fn insert_source(&mut self, source: &Source) -> Result<()>;

    fn get_source(&self, source_id: &str) -> Result<Source>;

    /// (app destinations, web destinations)
    fn get_source_destinations(&self, source_id: &str) -> Result<(Vec<String>, Vec<String>)>;

    /// ACTIVE sources for the trigger's destination and registration origin
    /// with `event_time <= trigger_time < expiry_time`
    fn get_matching_active_sources(&self, trigger: &Trigger) -> Result<Vec<Source>>;

    /// Earliest matching source registered just after the trigger
    fn get_nearest_delayed_matching_active_source(&self, trigger: &Trigger) -> Result<Option<Source>>;

    /// Sources of the trigger's own enrollment, plus eligible sources of the
    /// given cross-network enrollments
    fn fetch_trigger_matching_sources_for_xna(
        &self,
        trigger: &Trigger,
        xna_enrollment_ids: &[String],
    ) -> Result<Vec<Source>>;

    fn update_source_status(&mut self, source_ids: &[String], status: SourceStatus) -> Result<()>;

    fn update_source_event_report_dedup_keys(&mut self, source: &Source) -> Result<()>;

    fn update_source_aggregate_report_dedup_keys(&mut self, source: &Source) -> Result<()>;

    fn update_source_aggregate_contributions(&mut self, source: &Source) -> Result<()>;

    /// Record that `source_id` lost cross-network attribution for `enrollment_id`
    fn insert_ignored_source_for_enrollment(&mut self, source_id: &str, enrollment_id: &str) -> Result<()>;

    fn is_source_ignored_for_enrollment(&self, source_id: &str, enrollment_id: &str) -> Result<bool>;

    // ========================================================================
    // RATE LIMITS
    // ========================================================================

    /// Attributions for source site x destination site x trigger enrollment in
    /// the rate-limit window ending at the trigger time
    fn get_attributions_per_rate_limit_window(&self, source: &Source, trigger: &Trigger) -> Result<i64>;

    fn count_distinct_enrollments_per_publisher_x_destination_in_attribution(
        &self,
        source_site: &str,
        destination_site: &str,
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64>;

    /// Max over `destinations` of distinct enrollments among unexpired sources
    /// registered in the window
    fn count_distinct_enrollments_per_publisher_x_destination_in_source(
        &self,
        publisher: &str,
        publisher_type: EventSurfaceType,
        destinations: &[String],
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64>;

    fn get_num_event_reports_per_destination(
        &self,
        attribution_destination: &str,
        destination_type: EventSurfaceType,
    ) -> Result<i64>;

    fn get_num_aggregate_reports_per_destination(
        &self,
        attribution_destination: &str,
        destination_type: EventSurfaceType,
    ) -> Result<i64>;

    // ========================================================================
    // REPORTS & LEDGER
    // ========================================================================
    fn get_source_event_reports(&self, source: &Source) -> Result<Vec<EventReport>>;

    fn get_event_report(&self, report_id: &str) -> Result<EventReport>;

    fn insert_event_report(&mut self, report: &EventReport) -> Result<()>;

    fn delete_event_report(&mut self, report: &EventReport) -> Result<()>;

    fn get_aggregate_report(&self, report_id: &str) -> Result<AggregateReport>;

    fn get_aggregate_reports_for_source(&self, source_id: &str) -> Result<Vec<AggregateReport>>;

    fn insert_aggregate_report(&mut self, report: &AggregateReport) -> Result<()>;

    fn insert_attribution(&mut self, attribution: &Attribution) -> Result<()>;

    fn get_attributions_for_trigger(&self, trigger_id: &str) -> Result<Vec<Attribution>>;
}

/// Check an update touched exactly the rows it was asked to
pub(crate) fn expect_rows(entity: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(crate::error::DatastoreError::UpdateCountMismatch {
            entity,
            expected,
            actual,
        });
    }
    Ok(())
}
