// 🎯 Attribution Engine - Match pending triggers to sources and emit reports
//
// One pass:
//   pending trigger ids -> per trigger, one transaction:
//     candidates -> winner -> filters -> rate limits -> aggregate + event paths
//     -> ATTRIBUTED (with ledger row) or IGNORED
//
// A datastore failure rolls back only the trigger being processed; the pass
// moves on and reports `false`. Anything else ends the pass.

use crate::aggregation::{self, RandomReportDelay, ReportDelay};
use crate::dao::MeasurementDao;
use crate::datastore::DatastoreManager;
use crate::entities::{
    AggregateReport, AggregateReportStatus, Attribution, AttributionMode, DebugReportStatus,
    EventReport, EventReportStatus, EventTrigger, Source, SourceStatus, Trigger, TriggerStatus,
};
use crate::error::AttributionError;
use crate::filter;
use crate::flags::{
    Flags, MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE, ONE_DAY_MS, RATE_LIMIT_WINDOW_MILLISECONDS,
};
use crate::reporting::{NoiseHandler, ReportWindowCalculator, SourceNoiseHandler};
use crate::web;
use crate::xna::{DerivedSourceGenerator, XnaSourceCreator};
use std::cmp::Reverse;
use tracing::{debug, error, info, warn};

type StepResult<T> = std::result::Result<T, AttributionError>;

pub const AGGREGATE_REPORT_API_VERSION: &str = "0.1";

// ============================================================================
// OUTCOME
// ============================================================================

/// What happened to one trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Attributed {
        source_id: String,
        event_report: bool,
        aggregate_report: bool,
    },
    Ignored(IgnoreReason),
    /// Already left PENDING; nothing written
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NoMatchingSource,
    FilterMismatch,
    RateLimited,
    NoReport,
    /// Publisher or destination has no derivable site
    NoSite,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::NoMatchingSource => "no matching source",
            IgnoreReason::FilterMismatch => "top-level filters did not match",
            IgnoreReason::RateLimited => "rate limited",
            IgnoreReason::NoReport => "no report generated",
            IgnoreReason::NoSite => "no site for publisher or destination",
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct AttributionEngine<D: DatastoreManager> {
    datastore: D,
    flags: Flags,
    calculator: ReportWindowCalculator,
    noise: Box<dyn NoiseHandler>,
    delay: Box<dyn ReportDelay>,
    generator: Box<dyn DerivedSourceGenerator>,
}

impl<D: DatastoreManager> AttributionEngine<D> {
    pub fn new(datastore: D, flags: Flags) -> Self {
        AttributionEngine {
            datastore,
            calculator: ReportWindowCalculator::new(&flags),
            flags,
            noise: Box::new(SourceNoiseHandler),
            delay: Box::new(RandomReportDelay),
            generator: Box::new(XnaSourceCreator::new()),
        }
    }

    pub fn with_noise_handler(mut self, noise: Box<dyn NoiseHandler>) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_report_delay(mut self, delay: Box<dyn ReportDelay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_derived_source_generator(mut self, generator: Box<dyn DerivedSourceGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn datastore(&self) -> &D {
        &self.datastore
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Process pending triggers, at most `max_attributions_per_invocation`.
    ///
    /// Returns `Ok(true)` when every trigger was handled and none are left
    /// waiting. `Ok(false)` means a trigger hit a datastore error (and was
    /// rolled back) or the backlog exceeded the cap.
    pub fn perform_pending_attributions(&self) -> anyhow::Result<bool> {
        let pending = match self
            .datastore
            .run_in_transaction(|dao| Ok(dao.get_pending_trigger_ids()?))
        {
            Ok(ids) => ids,
            Err(AttributionError::Datastore(e)) => {
                warn!(error = %e, "Failed to load pending triggers");
                return Ok(false);
            }
            Err(AttributionError::Unexpected(e)) => return Err(e),
        };

        let cap = self.flags.max_attributions_per_invocation;
        let mut success = true;
        let mut attributed = 0usize;
        let mut ignored = 0usize;

        for trigger_id in pending.iter().take(cap) {
            let result = self
                .datastore
                .run_in_transaction(|dao| self.perform_attribution(dao, trigger_id));

            match result {
                Ok(TriggerOutcome::Attributed { .. }) => attributed += 1,
                Ok(TriggerOutcome::Ignored(_)) => ignored += 1,
                Ok(TriggerOutcome::Skipped) => {}
                Err(AttributionError::Datastore(e)) => {
                    warn!(trigger_id = %trigger_id, error = %e, "Attribution rolled back");
                    success = false;
                }
                Err(AttributionError::Unexpected(e)) => {
                    error!(trigger_id = %trigger_id, error = %e, "Attribution failed");
                    return Err(e.context(format!("Attribution failed for trigger {}", trigger_id)));
                }
            }
        }

        if pending.len() > cap {
            debug!(pending = pending.len(), cap, "Pending triggers left for next pass");
            success = false;
        }

        info!(
            processed = pending.len().min(cap),
            attributed, ignored, success, "Attribution pass complete"
        );
        Ok(success)
    }

    /// Attribute a single trigger inside the caller's transaction
    pub fn perform_attribution(&self, dao: &mut dyn MeasurementDao, trigger_id: &str) -> StepResult<TriggerOutcome> {
        let trigger = dao.get_trigger(trigger_id)?;
        if trigger.status != TriggerStatus::Pending {
            debug!(trigger_id, status = ?trigger.status, "Trigger no longer pending");
            return Ok(TriggerOutcome::Skipped);
        }

        let candidates = self.candidate_sources(dao, &trigger)?;

        if let Some(delayed) = dao.get_nearest_delayed_matching_active_source(&trigger)? {
            debug!(
                trigger_id,
                source_id = %delayed.id,
                source_event_time = delayed.event_time,
                "Delayed source registered after trigger"
            );
        }

        let Some((mut winner, losers)) = select_winner(candidates, trigger.trigger_time) else {
            return self.ignore_trigger(dao, &trigger, IgnoreReason::NoMatchingSource);
        };

        let filter_data = winner.filter_data_with_source_type();
        if !filter::matches_both(&filter_data, trigger.filters.as_ref(), trigger.not_filters.as_ref()) {
            return self.ignore_trigger(dao, &trigger, IgnoreReason::FilterMismatch);
        }

        // A uri with no site never becomes attributable
        if web::site_for(&winner.publisher, winner.publisher_type).is_none()
            || web::site_for(&trigger.attribution_destination, trigger.destination_type).is_none()
        {
            return self.ignore_trigger(dao, &trigger, IgnoreReason::NoSite);
        }

        if !self.has_attribution_quota(dao, &winner, &trigger)? {
            return self.ignore_trigger(dao, &trigger, IgnoreReason::RateLimited);
        }

        let aggregate_report = self.maybe_generate_aggregate_report(dao, &mut winner, &trigger)?;
        let event_report = self.maybe_generate_event_report(dao, &mut winner, &trigger)?;

        if !aggregate_report && !event_report {
            return self.ignore_trigger(dao, &trigger, IgnoreReason::NoReport);
        }

        ignore_competing_sources(dao, &winner, &losers, &trigger)?;
        dao.update_trigger_status(&[trigger.id.clone()], TriggerStatus::Attributed)?;

        let attribution = Attribution::from_source_and_trigger(&winner, &trigger).ok_or_else(|| {
            anyhow::anyhow!("no site for source {} or trigger {}", winner.id, trigger.id)
        })?;
        dao.insert_attribution(&attribution)?;

        debug!(
            trigger_id,
            source_id = %winner.id,
            derived = winner.is_derived(),
            event_report,
            aggregate_report,
            "Trigger attributed"
        );
        Ok(TriggerOutcome::Attributed {
            source_id: winner.id,
            event_report,
            aggregate_report,
        })
    }

    fn ignore_trigger(
        &self,
        dao: &mut dyn MeasurementDao,
        trigger: &Trigger,
        reason: IgnoreReason,
    ) -> StepResult<TriggerOutcome> {
        debug!(trigger_id = %trigger.id, reason = reason.as_str(), "Trigger ignored");
        dao.update_trigger_status(&[trigger.id.clone()], TriggerStatus::Ignored)?;
        Ok(TriggerOutcome::Ignored(reason))
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    fn candidate_sources(&self, dao: &dyn MeasurementDao, trigger: &Trigger) -> StepResult<Vec<Source>> {
        if !self.flags.enable_xna || trigger.attribution_config.is_none() {
            return Ok(dao.get_matching_active_sources(trigger)?);
        }

        let network_ids = trigger.xna_enrollment_ids();
        let fetched = dao.fetch_trigger_matching_sources_for_xna(trigger, &network_ids)?;
        let (mut candidates, others): (Vec<Source>, Vec<Source>) = fetched
            .into_iter()
            .partition(|source| source.enrollment_id == trigger.enrollment_id);

        let derived = self.generator.generate_derived_sources(trigger, &others);
        candidates.extend(derived);
        Ok(candidates)
    }

    // ========================================================================
    // RATE LIMITS
    // ========================================================================

    fn has_attribution_quota(&self, dao: &dyn MeasurementDao, source: &Source, trigger: &Trigger) -> StepResult<bool> {
        let attributions = dao.get_attributions_per_rate_limit_window(source, trigger)?;
        if attributions >= self.flags.max_attribution_per_rate_limit_window {
            debug!(
                trigger_id = %trigger.id,
                attributions,
                "Attribution rate limit reached"
            );
            return Ok(false);
        }

        let (Some(source_site), Some(destination_site)) = (
            web::site_for(&source.publisher, source.publisher_type),
            web::site_for(&trigger.attribution_destination, trigger.destination_type),
        ) else {
            return Ok(true);
        };

        let window_start = trigger.trigger_time - RATE_LIMIT_WINDOW_MILLISECONDS;
        let window_end = trigger.trigger_time;

        let in_attribution = dao.count_distinct_enrollments_per_publisher_x_destination_in_attribution(
            &source_site,
            &destination_site,
            &trigger.enrollment_id,
            window_start,
            window_end,
        )?;
        if in_attribution >= self.flags.max_distinct_enrollments_in_attribution {
            debug!(trigger_id = %trigger.id, in_attribution, "Too many reporting enrollments");
            return Ok(false);
        }

        let destinations: Vec<String> = trigger.destination_value().into_iter().collect();
        let in_source = dao.count_distinct_enrollments_per_publisher_x_destination_in_source(
            &source.publisher,
            source.publisher_type,
            &destinations,
            &trigger.enrollment_id,
            window_start,
            window_end,
        )?;
        if in_source >= self.flags.max_distinct_enrollments_in_source {
            debug!(trigger_id = %trigger.id, in_source, "Too many registering enrollments");
            return Ok(false);
        }

        Ok(true)
    }

    // ========================================================================
    // AGGREGATE PATH
    // ========================================================================

    fn maybe_generate_aggregate_report(
        &self,
        dao: &mut dyn MeasurementDao,
        source: &mut Source,
        trigger: &Trigger,
    ) -> StepResult<bool> {
        if trigger.aggregate_values.is_none() || source.aggregate_source.is_none() {
            return Ok(false);
        }

        if trigger.trigger_time > source.aggregatable_report_window {
            debug!(trigger_id = %trigger.id, "Aggregatable report window closed");
            return Ok(false);
        }

        let reports = dao.get_num_aggregate_reports_per_destination(
            &trigger.attribution_destination,
            trigger.destination_type,
        )?;
        if reports >= self.flags.max_aggregate_reports_per_destination {
            debug!(trigger_id = %trigger.id, reports, "Aggregate reports per destination exhausted");
            return Ok(false);
        }

        let dedup_key = aggregation::matching_dedup_key(source, trigger);
        if let Some(key) = dedup_key {
            if source.aggregate_report_dedup_keys.contains(&key) {
                debug!(trigger_id = %trigger.id, key, "Duplicate aggregate dedup key");
                return Ok(false);
            }
        }

        let Some(contributions) = aggregation::generate_contributions(source, trigger) else {
            return Ok(false);
        };

        let new_total = aggregation::total_value(&contributions)
            .and_then(|total| source.aggregate_contributions.checked_add(total));
        let Some(new_total) = new_total.filter(|t| *t <= MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE) else {
            debug!(
                trigger_id = %trigger.id,
                source_id = %source.id,
                existing = source.aggregate_contributions,
                "Aggregate contribution budget exceeded"
            );
            return Ok(false);
        };
        if new_total == MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE {
            debug!(source_id = %source.id, "Aggregate contribution budget reached");
        }

        let Some(attribution_destination) = trigger.destination_base_uri() else {
            debug!(trigger_id = %trigger.id, "Trigger destination has no base uri");
            return Ok(false);
        };

        let report = AggregateReport {
            id: uuid::Uuid::new_v4().to_string(),
            publisher: source.registrant.clone(),
            attribution_destination,
            source_registration_time: source.event_time.div_euclid(ONE_DAY_MS) * ONE_DAY_MS,
            scheduled_report_time: trigger.trigger_time + self.delay.aggregate_report_delay(),
            enrollment_id: trigger.enrollment_id.clone(),
            debug_cleartext_payload: AggregateReport::payload_from(&contributions),
            status: AggregateReportStatus::Pending,
            api_version: AGGREGATE_REPORT_API_VERSION.to_string(),
            source_id: source.id.clone(),
            trigger_id: trigger.id.clone(),
            registration_origin: trigger.registration_origin.clone(),
            dedup_key,
        };

        source.aggregate_contributions = new_total;
        if let Some(key) = dedup_key {
            source.aggregate_report_dedup_keys.push(key);
        }

        // Derived sources exist only in memory
        if !source.is_derived() {
            dao.update_source_aggregate_contributions(source)?;
            if dedup_key.is_some() {
                dao.update_source_aggregate_report_dedup_keys(source)?;
            }
        }

        dao.insert_aggregate_report(&report)?;
        Ok(true)
    }

    // ========================================================================
    // EVENT PATH
    // ========================================================================

    fn maybe_generate_event_report(
        &self,
        dao: &mut dyn MeasurementDao,
        source: &mut Source,
        trigger: &Trigger,
    ) -> StepResult<bool> {
        if source.is_derived() {
            return Ok(false);
        }

        if source.attribution_mode != AttributionMode::Truthfully {
            debug!(source_id = %source.id, mode = ?source.attribution_mode, "Source not truthful");
            return Ok(false);
        }

        if trigger.trigger_time > source.event_report_window {
            debug!(trigger_id = %trigger.id, "Event report window closed");
            return Ok(false);
        }

        let filter_data = source.filter_data_with_source_type();
        let Some(event_trigger) = trigger.event_triggers.iter().find(|et| {
            filter::matches_both(&filter_data, et.filter_set.as_ref(), et.not_filter_set.as_ref())
        }) else {
            return Ok(false);
        };

        if let Some(key) = event_trigger.dedup_key {
            if source.event_report_dedup_keys.contains(&key) {
                debug!(trigger_id = %trigger.id, key, "Duplicate event dedup key");
                return Ok(false);
            }
        }

        let reports = dao.get_num_event_reports_per_destination(
            &trigger.attribution_destination,
            trigger.destination_type,
        )?;
        if reports >= self.flags.max_event_reports_per_destination {
            debug!(trigger_id = %trigger.id, reports, "Event reports per destination exhausted");
            return Ok(false);
        }

        let report = self.build_event_report(source, trigger, event_trigger);
        if !self.provision_event_report_quota(dao, source, trigger, &report)? {
            return Ok(false);
        }

        if let Some(key) = event_trigger.dedup_key {
            source.event_report_dedup_keys.push(key);
        }
        dao.update_source_event_report_dedup_keys(source)?;
        dao.insert_event_report(&report)?;
        Ok(true)
    }

    fn build_event_report(&self, source: &Source, trigger: &Trigger, event_trigger: &EventTrigger) -> EventReport {
        let attribution_destinations = if self.flags.enable_coarse_event_report_destinations
            && source.coarse_event_report_destinations
        {
            source
                .app_destinations
                .iter()
                .chain(source.web_destinations.iter())
                .cloned()
                .collect()
        } else {
            source.destinations(trigger.destination_type).to_vec()
        };

        EventReport {
            id: uuid::Uuid::new_v4().to_string(),
            source_event_id: source.event_id,
            enrollment_id: trigger.enrollment_id.clone(),
            attribution_destination: trigger.attribution_destination.clone(),
            attribution_destinations,
            trigger_time: trigger.trigger_time,
            trigger_data: event_trigger.trigger_data % source.source_type.trigger_data_cardinality(),
            trigger_priority: event_trigger.trigger_priority,
            trigger_dedup_key: event_trigger.dedup_key,
            report_time: self
                .calculator
                .report_time(source, trigger.trigger_time, trigger.destination_type),
            status: EventReportStatus::Pending,
            debug_report_status: DebugReportStatus::None,
            source_type: source.source_type,
            randomized_trigger_rate: self.noise.randomized_trigger_rate(source),
            source_id: source.id.clone(),
            trigger_id: trigger.id.clone(),
            registration_origin: trigger.registration_origin.clone(),
        }
    }

    /// Make room for `report`, evicting a lower-priority report from the same
    /// window when the source is full
    fn provision_event_report_quota(
        &self,
        dao: &mut dyn MeasurementDao,
        source: &mut Source,
        trigger: &Trigger,
        report: &EventReport,
    ) -> StepResult<bool> {
        let existing = dao.get_source_event_reports(source)?;
        let install_case = source.has_app_install_attribution(trigger.destination_type);
        if existing.len() < self.calculator.max_report_count(source, install_case) {
            return Ok(true);
        }

        let lowest = existing
            .into_iter()
            .filter(|r| r.status == EventReportStatus::Pending && r.report_time == report.report_time)
            .min_by_key(|r| (r.trigger_priority, Reverse(r.trigger_time)));

        let Some(lowest) = lowest else {
            debug!(source_id = %source.id, "Source event reports full, nothing to replace");
            return Ok(false);
        };
        if lowest.trigger_priority >= report.trigger_priority {
            debug!(source_id = %source.id, "Existing event reports outrank trigger");
            return Ok(false);
        }

        if let Some(key) = lowest.trigger_dedup_key {
            if let Some(pos) = source.event_report_dedup_keys.iter().position(|k| *k == key) {
                source.event_report_dedup_keys.remove(pos);
            }
        }
        debug!(source_id = %source.id, evicted = %lowest.id, "Replacing lower priority event report");
        dao.delete_event_report(&lowest)?;
        Ok(true)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Install-cooldown sources first, then priority, then most recent
fn select_winner(mut candidates: Vec<Source>, trigger_time: i64) -> Option<(Source, Vec<Source>)> {
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|source| {
        Reverse((
            source.is_install_attributed && source.is_within_install_cooldown(trigger_time),
            source.priority,
            source.event_time,
        ))
    });
    let winner = candidates.remove(0);
    Some((winner, candidates))
}

fn ignore_competing_sources(
    dao: &mut dyn MeasurementDao,
    winner: &Source,
    losers: &[Source],
    trigger: &Trigger,
) -> StepResult<()> {
    let mut ignored_ids = Vec::new();

    for loser in losers {
        match &loser.parent_id {
            Some(parent_id) => dao.insert_ignored_source_for_enrollment(parent_id, &trigger.enrollment_id)?,
            None if loser.enrollment_id == winner.enrollment_id => ignored_ids.push(loser.id.clone()),
            None => {}
        }
    }

    if let Some(parent_id) = &winner.parent_id {
        dao.insert_ignored_source_for_enrollment(parent_id, &trigger.enrollment_id)?;
    }

    if !ignored_ids.is_empty() {
        dao.update_source_status(&ignored_ids, SourceStatus::Ignored)?;
    }
    Ok(())
}
