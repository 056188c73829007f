// 📊 Aggregation - Histogram contributions and aggregate report scheduling

use crate::entities::{AggregateHistogramContribution, Source, Trigger};
use crate::filter;
use crate::flags::{AGGREGATE_MAX_REPORT_DELAY, AGGREGATE_MIN_REPORT_DELAY};
use rand::Rng;

// ============================================================================
// CONTRIBUTIONS
// ============================================================================

/// Combine the trigger's key pieces into the source's aggregation keys and
/// pair each resulting bucket with its trigger value.
///
/// Returns `None` when either side is not aggregatable or nothing lines up.
pub fn generate_contributions(source: &Source, trigger: &Trigger) -> Option<Vec<AggregateHistogramContribution>> {
    let source_pieces = source.aggregate_source.as_ref()?;
    let values = trigger.aggregate_values.as_ref()?;

    let filter_data = source.filter_data_with_source_type();
    let mut buckets = source_pieces.clone();

    for trigger_data in &trigger.aggregate_trigger_data {
        if !filter::matches_both(
            &filter_data,
            trigger_data.filter_set.as_ref(),
            trigger_data.not_filter_set.as_ref(),
        ) {
            continue;
        }
        for source_key in &trigger_data.source_keys {
            if let Some(piece) = buckets.get_mut(source_key) {
                *piece |= trigger_data.key_piece;
            }
        }
    }

    let contributions: Vec<AggregateHistogramContribution> = buckets
        .iter()
        .filter_map(|(key, bucket)| {
            values
                .get(key)
                .map(|value| AggregateHistogramContribution { key: *bucket, value: *value })
        })
        .collect();

    if contributions.is_empty() {
        None
    } else {
        Some(contributions)
    }
}

/// Deduplication key of the first entry whose filters match the source
pub fn matching_dedup_key(source: &Source, trigger: &Trigger) -> Option<u64> {
    let filter_data = source.filter_data_with_source_type();
    trigger
        .aggregate_deduplication_keys
        .iter()
        .find(|key| filter::matches_both(&filter_data, key.filter_set.as_ref(), key.not_filter_set.as_ref()))
        .and_then(|key| key.deduplication_key)
}

/// Sum of contribution values, `None` on overflow
pub fn total_value(contributions: &[AggregateHistogramContribution]) -> Option<i64> {
    contributions
        .iter()
        .try_fold(0i64, |sum, c| sum.checked_add(c.value))
}

// ============================================================================
// REPORT DELAY
// ============================================================================

/// Delay between a trigger and its aggregate report
pub trait ReportDelay {
    fn aggregate_report_delay(&self) -> i64;
}

/// Uniform in [10 minutes, 1 hour)
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomReportDelay;

impl ReportDelay for RandomReportDelay {
    fn aggregate_report_delay(&self) -> i64 {
        rand::thread_rng().gen_range(AGGREGATE_MIN_REPORT_DELAY..AGGREGATE_MAX_REPORT_DELAY)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedReportDelay(pub i64);

impl ReportDelay for FixedReportDelay {
    fn aggregate_report_delay(&self) -> i64 {
        self.0
    }
}
