// ⏰ Reporting - Event report windows, per-source caps and noise metadata

use crate::entities::{EventSurfaceType, Source, SourceType};
use crate::flags::{
    Flags, EVENT_REPORT_DELAY, INSTALL_ATTR_EVENT_EARLY_REPORTING_WINDOWS,
    NAVIGATION_EARLY_REPORTING_WINDOWS,
};

// ============================================================================
// CAPS
// ============================================================================

const EVENT_SOURCE_MAX_REPORTS: usize = 1;
const INSTALL_ATTR_EVENT_SOURCE_MAX_REPORTS: usize = 2;
const NAVIGATION_SOURCE_MAX_REPORTS: usize = 3;

// ============================================================================
// REPORT WINDOW CALCULATOR
// ============================================================================

pub struct ReportWindowCalculator {
    enable_vtc_configurable_max_event_reports: bool,
    vtc_configurable_max_event_reports_count: usize,
}

impl ReportWindowCalculator {
    pub fn new(flags: &Flags) -> Self {
        ReportWindowCalculator {
            enable_vtc_configurable_max_event_reports: flags.enable_vtc_configurable_max_event_reports,
            vtc_configurable_max_event_reports_count: flags.vtc_configurable_max_event_reports_count,
        }
    }

    /// When an event report for a trigger at `trigger_time` gets delivered.
    ///
    /// The first early window still open at trigger time wins; triggers past
    /// every early window report at the end of the source's event report
    /// window. Either way delivery waits one more hour.
    pub fn report_time(&self, source: &Source, trigger_time: i64, destination_type: EventSurfaceType) -> i64 {
        let install_case = source.has_app_install_attribution(destination_type);

        let window_end = early_window_ends(source, install_case)
            .into_iter()
            .find(|end| trigger_time < *end)
            .unwrap_or(source.event_report_window);

        window_end + EVENT_REPORT_DELAY
    }

    /// Most event reports a source may hold
    pub fn max_report_count(&self, source: &Source, install_case: bool) -> usize {
        match source.source_type {
            SourceType::Navigation => NAVIGATION_SOURCE_MAX_REPORTS,
            SourceType::Event => {
                let base = if self.enable_vtc_configurable_max_event_reports {
                    self.vtc_configurable_max_event_reports_count
                } else {
                    EVENT_SOURCE_MAX_REPORTS
                };
                if install_case {
                    base.max(INSTALL_ATTR_EVENT_SOURCE_MAX_REPORTS)
                } else {
                    base
                }
            }
        }
    }
}

/// Absolute ends of the early windows that close before the event report window
fn early_window_ends(source: &Source, install_case: bool) -> Vec<i64> {
    let deltas: &[i64] = match source.source_type {
        SourceType::Navigation => &NAVIGATION_EARLY_REPORTING_WINDOWS,
        SourceType::Event if install_case => &INSTALL_ATTR_EVENT_EARLY_REPORTING_WINDOWS,
        SourceType::Event => &[],
    };

    deltas
        .iter()
        .map(|delta| source.event_time + delta)
        .filter(|end| *end < source.event_report_window)
        .collect()
}

// ============================================================================
// NOISE
// ============================================================================

/// Randomization metadata attached to event reports
pub trait NoiseHandler {
    fn randomized_trigger_rate(&self, source: &Source) -> f64;
}

const NAVIGATION_NOISE_PROBABILITY: f64 = 0.0024263;
const EVENT_NOISE_PROBABILITY: f64 = 0.0000025;
const INSTALL_ATTR_EVENT_NOISE_PROBABILITY: f64 = 0.0000042;

/// Fixed per-source-type rates
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceNoiseHandler;

impl NoiseHandler for SourceNoiseHandler {
    fn randomized_trigger_rate(&self, source: &Source) -> f64 {
        match source.source_type {
            SourceType::Navigation => NAVIGATION_NOISE_PROBABILITY,
            SourceType::Event if is_install_detection_enabled(source) => {
                INSTALL_ATTR_EVENT_NOISE_PROBABILITY
            }
            SourceType::Event => EVENT_NOISE_PROBABILITY,
        }
    }
}

/// Install attribution can only happen for sources with an app destination
fn is_install_detection_enabled(source: &Source) -> bool {
    source.install_attribution_window > 0 && !source.app_destinations.is_empty()
}
