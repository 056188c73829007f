// 🧪 In-Memory Store - MeasurementDao over plain collections
//
// Each transaction works on a copy of the state; the copy replaces the
// stored state only when the unit of work succeeds. Failures can be armed
// per call to exercise rollback paths.

use super::query::SitePattern;
use super::{expect_rows, MeasurementDao};
use crate::datastore::DatastoreManager;
use crate::entities::{
    AggregateReport, Attribution, EventReport, EventSurfaceType, Source, SourceStatus, Trigger,
    TriggerStatus,
};
use crate::error::{AttributionError, DatastoreError, Result};
use crate::flags::{MAX_DELAYED_SOURCE_REGISTRATION_WINDOW, RATE_LIMIT_WINDOW_MILLISECONDS};
use crate::web;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;

// ============================================================================
// FAILURE INJECTION
// ============================================================================

/// DAO operations that can be armed to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaoCall {
    InsertTrigger,
    GetPendingTriggerIds,
    GetTrigger,
    UpdateTriggerStatus,
    InsertSource,
    GetSource,
    GetMatchingActiveSources,
    GetNearestDelayedMatchingActiveSource,
    FetchTriggerMatchingSourcesForXna,
    UpdateSourceStatus,
    UpdateSourceEventReportDedupKeys,
    UpdateSourceAggregateReportDedupKeys,
    UpdateSourceAggregateContributions,
    InsertIgnoredSourceForEnrollment,
    GetAttributionsPerRateLimitWindow,
    CountDistinctEnrollmentsInAttribution,
    CountDistinctEnrollmentsInSource,
    GetNumEventReportsPerDestination,
    GetNumAggregateReportsPerDestination,
    GetSourceEventReports,
    InsertEventReport,
    DeleteEventReport,
    InsertAggregateReport,
    InsertAttribution,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounts {
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    sources: Vec<Source>,
    triggers: Vec<Trigger>,
    event_reports: Vec<EventReport>,
    aggregate_reports: Vec<AggregateReport>,
    attributions: Vec<Attribution>,
    xna_ignored: BTreeSet<(String, String)>,
}

// ============================================================================
// DATASTORE
// ============================================================================

#[derive(Default)]
pub struct InMemoryDatastore {
    state: RefCell<MemoryState>,
    failures: RefCell<Vec<DaoCall>>,
    counts: Cell<TransactionCounts>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot failure for the next `call`
    pub fn fail_on(&self, call: DaoCall) {
        self.failures.borrow_mut().push(call);
    }

    pub fn counts(&self) -> TransactionCounts {
        self.counts.get()
    }

    /// Seed a source without going through a transaction
    pub fn add_source(&self, source: Source) {
        self.state.borrow_mut().sources.push(source);
    }

    /// Seed a trigger without going through a transaction
    pub fn add_trigger(&self, trigger: Trigger) {
        self.state.borrow_mut().triggers.push(trigger);
    }

    pub fn add_attribution(&self, attribution: Attribution) {
        self.state.borrow_mut().attributions.push(attribution);
    }

    fn bump(&self, update: impl FnOnce(&mut TransactionCounts)) {
        let mut counts = self.counts.get();
        update(&mut counts);
        self.counts.set(counts);
    }
}

impl DatastoreManager for InMemoryDatastore {
    fn run_in_transaction<T, F>(&self, op: F) -> std::result::Result<T, AttributionError>
    where
        F: FnOnce(&mut dyn MeasurementDao) -> std::result::Result<T, AttributionError>,
    {
        self.bump(|c| c.begins += 1);

        let working = self.state.borrow().clone();
        let mut dao = InMemoryMeasurementDao {
            state: working,
            failures: &self.failures,
        };

        match op(&mut dao) {
            Ok(value) => {
                *self.state.borrow_mut() = dao.state;
                self.bump(|c| c.commits += 1);
                Ok(value)
            }
            Err(e) => {
                self.bump(|c| c.rollbacks += 1);
                Err(e)
            }
        }
    }
}

// ============================================================================
// DAO
// ============================================================================

pub struct InMemoryMeasurementDao<'a> {
    state: MemoryState,
    failures: &'a RefCell<Vec<DaoCall>>,
}

impl InMemoryMeasurementDao<'_> {
    fn check(&self, call: DaoCall) -> Result<()> {
        let mut failures = self.failures.borrow_mut();
        if let Some(index) = failures.iter().position(|armed| *armed == call) {
            failures.remove(index);
            return Err(DatastoreError::Injected(format!("{:?}", call)));
        }
        Ok(())
    }

    fn source_mut(&mut self, source_id: &str) -> Option<&mut Source> {
        self.state.sources.iter_mut().find(|s| s.id == source_id)
    }

    fn update_source(&mut self, entity: &'static str, source: &Source, apply: fn(&mut Source, &Source)) -> Result<()> {
        let updated = match self.source_mut(&source.id) {
            Some(stored) => {
                apply(stored, source);
                1
            }
            None => 0,
        };
        expect_rows(entity, 1, updated)
    }

    fn sources_for_destination<'s>(&'s self, trigger: &Trigger) -> Vec<&'s Source> {
        let Some(destination) = trigger.destination_value() else {
            return Vec::new();
        };
        self.state
            .sources
            .iter()
            .filter(|s| s.destinations(trigger.destination_type).contains(&destination))
            .collect()
    }
}

fn count_matching<'r>(destinations: impl Iterator<Item = &'r str>, pattern: Option<SitePattern>) -> i64 {
    match pattern {
        Some(pattern) => destinations.filter(|d| pattern.matches(d)).count() as i64,
        None => 0,
    }
}

impl MeasurementDao for InMemoryMeasurementDao<'_> {
    // ========================================================================
    // TRIGGERS
    // ========================================================================

    fn insert_trigger(&mut self, trigger: &Trigger) -> Result<()> {
        self.check(DaoCall::InsertTrigger)?;
        if self.state.triggers.iter().any(|t| t.id == trigger.id) {
            return expect_rows("Trigger insertion", 1, 0);
        }
        self.state.triggers.push(trigger.clone());
        Ok(())
    }

    fn get_pending_trigger_ids(&self) -> Result<Vec<String>> {
        self.check(DaoCall::GetPendingTriggerIds)?;
        let mut pending: Vec<&Trigger> = self
            .state
            .triggers
            .iter()
            .filter(|t| t.status == TriggerStatus::Pending)
            .collect();
        pending.sort_by_key(|t| t.trigger_time);
        Ok(pending.into_iter().map(|t| t.id.clone()).collect())
    }

    fn get_trigger(&self, trigger_id: &str) -> Result<Trigger> {
        self.check(DaoCall::GetTrigger)?;
        self.state
            .triggers
            .iter()
            .find(|t| t.id == trigger_id)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(format!("trigger {}", trigger_id)))
    }

    fn update_trigger_status(&mut self, trigger_ids: &[String], status: TriggerStatus) -> Result<()> {
        self.check(DaoCall::UpdateTriggerStatus)?;
        let mut updated = 0;
        for trigger in self.state.triggers.iter_mut().filter(|t| trigger_ids.contains(&t.id)) {
            trigger.status = status;
            updated += 1;
        }
        expect_rows("Trigger status", trigger_ids.len(), updated)
    }

    // ========================================================================
    // SOURCES
    // ========================================================================

    fn insert_source(&mut self, source: &Source) -> Result<()> {
        self.check(DaoCall::InsertSource)?;
        if self.state.sources.iter().any(|s| s.id == source.id) {
            return expect_rows("Source insertion", 1, 0);
        }
        self.state.sources.push(source.clone());
        Ok(())
    }

    fn get_source(&self, source_id: &str) -> Result<Source> {
        self.check(DaoCall::GetSource)?;
        self.state
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(format!("source {}", source_id)))
    }

    fn get_source_destinations(&self, source_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let source = self.get_source(source_id)?;
        Ok((source.app_destinations, source.web_destinations))
    }

    fn get_matching_active_sources(&self, trigger: &Trigger) -> Result<Vec<Source>> {
        self.check(DaoCall::GetMatchingActiveSources)?;
        Ok(self
            .sources_for_destination(trigger)
            .into_iter()
            .filter(|s| {
                s.registration_origin == trigger.registration_origin
                    && s.event_time <= trigger.trigger_time
                    && s.expiry_time > trigger.trigger_time
                    && s.status == SourceStatus::Active
            })
            .cloned()
            .collect())
    }

    fn get_nearest_delayed_matching_active_source(&self, trigger: &Trigger) -> Result<Option<Source>> {
        self.check(DaoCall::GetNearestDelayedMatchingActiveSource)?;
        let latest = trigger.trigger_time + MAX_DELAYED_SOURCE_REGISTRATION_WINDOW;
        Ok(self
            .sources_for_destination(trigger)
            .into_iter()
            .filter(|s| {
                s.registration_origin == trigger.registration_origin
                    && s.event_time > trigger.trigger_time
                    && s.event_time <= latest
                    && s.expiry_time > trigger.trigger_time
                    && s.status == SourceStatus::Active
            })
            .min_by_key(|s| s.event_time)
            .cloned())
    }

    fn fetch_trigger_matching_sources_for_xna(
        &self,
        trigger: &Trigger,
        xna_enrollment_ids: &[String],
    ) -> Result<Vec<Source>> {
        self.check(DaoCall::FetchTriggerMatchingSourcesForXna)?;

        let own_registrations: BTreeSet<&str> = self
            .state
            .sources
            .iter()
            .filter(|s| s.enrollment_id == trigger.enrollment_id)
            .filter_map(|s| s.registration_id.as_deref())
            .collect();
        let is_ignored = |source: &Source| {
            self.state
                .xna_ignored
                .iter()
                .any(|(id, enrollment)| *id == source.id && *enrollment == trigger.enrollment_id)
        };

        Ok(self
            .sources_for_destination(trigger)
            .into_iter()
            .filter(|s| {
                s.expiry_time > trigger.trigger_time
                    && s.event_time <= trigger.trigger_time
                    && s.status == SourceStatus::Active
            })
            .filter(|s| {
                s.enrollment_id == trigger.enrollment_id
                    || (xna_enrollment_ids.contains(&s.enrollment_id)
                        && !is_ignored(s)
                        && s
                            .registration_id
                            .as_deref()
                            .map_or(true, |id| !own_registrations.contains(id))
                        && s.shared_aggregation_keys.is_some())
            })
            .cloned()
            .collect())
    }

    fn update_source_status(&mut self, source_ids: &[String], status: SourceStatus) -> Result<()> {
        self.check(DaoCall::UpdateSourceStatus)?;
        let mut updated = 0;
        for source in self.state.sources.iter_mut().filter(|s| source_ids.contains(&s.id)) {
            source.status = status;
            updated += 1;
        }
        expect_rows("Source status", source_ids.len(), updated)
    }

    fn update_source_event_report_dedup_keys(&mut self, source: &Source) -> Result<()> {
        self.check(DaoCall::UpdateSourceEventReportDedupKeys)?;
        self.update_source("Source event report dedup key", source, |stored, s| {
            stored.event_report_dedup_keys = s.event_report_dedup_keys.clone();
        })
    }

    fn update_source_aggregate_report_dedup_keys(&mut self, source: &Source) -> Result<()> {
        self.check(DaoCall::UpdateSourceAggregateReportDedupKeys)?;
        self.update_source("Source aggregate report dedup key", source, |stored, s| {
            stored.aggregate_report_dedup_keys = s.aggregate_report_dedup_keys.clone();
        })
    }

    fn update_source_aggregate_contributions(&mut self, source: &Source) -> Result<()> {
        self.check(DaoCall::UpdateSourceAggregateContributions)?;
        self.update_source("Source aggregate contributions", source, |stored, s| {
            stored.aggregate_contributions = s.aggregate_contributions;
        })
    }

    fn insert_ignored_source_for_enrollment(&mut self, source_id: &str, enrollment_id: &str) -> Result<()> {
        self.check(DaoCall::InsertIgnoredSourceForEnrollment)?;
        self.state
            .xna_ignored
            .insert((source_id.to_string(), enrollment_id.to_string()));
        Ok(())
    }

    fn is_source_ignored_for_enrollment(&self, source_id: &str, enrollment_id: &str) -> Result<bool> {
        Ok(self
            .state
            .xna_ignored
            .contains(&(source_id.to_string(), enrollment_id.to_string())))
    }

    // ========================================================================
    // RATE LIMITS
    // ========================================================================

    fn get_attributions_per_rate_limit_window(&self, source: &Source, trigger: &Trigger) -> Result<i64> {
        self.check(DaoCall::GetAttributionsPerRateLimitWindow)?;
        let source_site = web::site_for(&source.publisher, source.publisher_type);
        let destination_site = web::site_for(&trigger.attribution_destination, trigger.destination_type);
        let (Some(source_site), Some(destination_site)) = (source_site, destination_site) else {
            return Err(DatastoreError::Serialization(format!(
                "cannot derive sites from publisher {} and destination {}",
                source.publisher, trigger.attribution_destination
            )));
        };

        let window_start = trigger.trigger_time - RATE_LIMIT_WINDOW_MILLISECONDS;
        Ok(self
            .state
            .attributions
            .iter()
            .filter(|a| {
                a.source_site == source_site
                    && a.destination_site == destination_site
                    && a.enrollment_id == trigger.enrollment_id
                    && a.trigger_time > window_start
                    && a.trigger_time <= trigger.trigger_time
            })
            .count() as i64)
    }

    fn count_distinct_enrollments_per_publisher_x_destination_in_attribution(
        &self,
        source_site: &str,
        destination_site: &str,
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        self.check(DaoCall::CountDistinctEnrollmentsInAttribution)?;
        let enrollments: BTreeSet<&str> = self
            .state
            .attributions
            .iter()
            .filter(|a| {
                a.source_site == source_site
                    && a.destination_site == destination_site
                    && a.enrollment_id != excluded_enrollment_id
                    && a.trigger_time > window_start
                    && a.trigger_time <= window_end
            })
            .map(|a| a.enrollment_id.as_str())
            .collect();
        Ok(enrollments.len() as i64)
    }

    fn count_distinct_enrollments_per_publisher_x_destination_in_source(
        &self,
        publisher: &str,
        publisher_type: EventSurfaceType,
        destinations: &[String],
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        self.check(DaoCall::CountDistinctEnrollmentsInSource)?;
        let Some(pattern) = SitePattern::for_publisher(publisher, publisher_type) else {
            return Ok(0);
        };

        let eligible: Vec<&Source> = self
            .state
            .sources
            .iter()
            .filter(|s| {
                pattern.matches(&s.publisher)
                    && s.enrollment_id != excluded_enrollment_id
                    && s.event_time > window_start
                    && s.event_time <= window_end
                    && s.expiry_time > window_end
            })
            .collect();

        let max = destinations
            .iter()
            .map(|destination| {
                eligible
                    .iter()
                    .filter(|s| {
                        s.app_destinations.contains(destination) || s.web_destinations.contains(destination)
                    })
                    .map(|s| s.enrollment_id.as_str())
                    .collect::<BTreeSet<_>>()
                    .len() as i64
            })
            .max()
            .unwrap_or(0);
        Ok(max)
    }

    fn get_num_event_reports_per_destination(
        &self,
        attribution_destination: &str,
        destination_type: EventSurfaceType,
    ) -> Result<i64> {
        self.check(DaoCall::GetNumEventReportsPerDestination)?;
        Ok(count_matching(
            self.state
                .event_reports
                .iter()
                .map(|r| r.attribution_destination.as_str()),
            SitePattern::for_destination(attribution_destination, destination_type),
        ))
    }

    fn get_num_aggregate_reports_per_destination(
        &self,
        attribution_destination: &str,
        destination_type: EventSurfaceType,
    ) -> Result<i64> {
        self.check(DaoCall::GetNumAggregateReportsPerDestination)?;
        Ok(count_matching(
            self.state
                .aggregate_reports
                .iter()
                .map(|r| r.attribution_destination.as_str()),
            SitePattern::for_destination(attribution_destination, destination_type),
        ))
    }

    // ========================================================================
    // REPORTS & LEDGER
    // ========================================================================

    fn get_source_event_reports(&self, source: &Source) -> Result<Vec<EventReport>> {
        self.check(DaoCall::GetSourceEventReports)?;
        let mut reports: Vec<EventReport> = self
            .state
            .event_reports
            .iter()
            .filter(|r| r.source_id == source.id)
            .cloned()
            .collect();
        reports.sort_by_key(|r| (r.report_time, r.trigger_time));
        Ok(reports)
    }

    fn get_event_report(&self, report_id: &str) -> Result<EventReport> {
        self.state
            .event_reports
            .iter()
            .find(|r| r.id == report_id)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(format!("event report {}", report_id)))
    }

    fn insert_event_report(&mut self, report: &EventReport) -> Result<()> {
        self.check(DaoCall::InsertEventReport)?;
        self.state.event_reports.push(report.clone());
        Ok(())
    }

    fn delete_event_report(&mut self, report: &EventReport) -> Result<()> {
        self.check(DaoCall::DeleteEventReport)?;
        let before = self.state.event_reports.len();
        self.state.event_reports.retain(|r| r.id != report.id);
        expect_rows("Event report deletion", 1, before - self.state.event_reports.len())
    }

    fn get_aggregate_report(&self, report_id: &str) -> Result<AggregateReport> {
        self.state
            .aggregate_reports
            .iter()
            .find(|r| r.id == report_id)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(format!("aggregate report {}", report_id)))
    }

    fn get_aggregate_reports_for_source(&self, source_id: &str) -> Result<Vec<AggregateReport>> {
        let mut reports: Vec<AggregateReport> = self
            .state
            .aggregate_reports
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.scheduled_report_time);
        Ok(reports)
    }

    fn insert_aggregate_report(&mut self, report: &AggregateReport) -> Result<()> {
        self.check(DaoCall::InsertAggregateReport)?;
        self.state.aggregate_reports.push(report.clone());
        Ok(())
    }

    fn insert_attribution(&mut self, attribution: &Attribution) -> Result<()> {
        self.check(DaoCall::InsertAttribution)?;
        self.state.attributions.push(attribution.clone());
        Ok(())
    }

    fn get_attributions_for_trigger(&self, trigger_id: &str) -> Result<Vec<Attribution>> {
        Ok(self
            .state
            .attributions
            .iter()
            .filter(|a| a.trigger_id == trigger_id)
            .cloned()
            .collect())
    }
}
