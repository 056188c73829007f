// 🚩 Flags - Tunable limits for the attribution pass
// Loaded from JSON; missing keys fall back to defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// PRIVACY PARAMS (fixed)
// ============================================================================

pub const ONE_HOUR_MS: i64 = 60 * 60 * 1000;
pub const ONE_DAY_MS: i64 = 24 * ONE_HOUR_MS;

/// Upper bound on the sum of aggregate values a single source may contribute
pub const MAX_SUM_OF_AGGREGATE_VALUES_PER_SOURCE: i64 = 65536;

pub const RATE_LIMIT_WINDOW_MILLISECONDS: i64 = 30 * ONE_DAY_MS;

pub const MAX_DELAYED_SOURCE_REGISTRATION_WINDOW: i64 = 2 * 60 * 1000;

pub const AGGREGATE_MIN_REPORT_DELAY: i64 = 10 * 60 * 1000;
pub const AGGREGATE_MAX_REPORT_DELAY: i64 = ONE_HOUR_MS;

pub const EVENT_REPORT_DELAY: i64 = ONE_HOUR_MS;

pub const NAVIGATION_EARLY_REPORTING_WINDOWS: [i64; 2] = [2 * ONE_DAY_MS, 7 * ONE_DAY_MS];
pub const INSTALL_ATTR_EVENT_EARLY_REPORTING_WINDOWS: [i64; 1] = [2 * ONE_DAY_MS];

// ============================================================================
// FLAGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Attributions allowed per source-site x destination-site x enrollment in the window
    pub max_attribution_per_rate_limit_window: i64,

    /// Distinct reporting enrollments per publisher x destination in the Attribution ledger
    pub max_distinct_enrollments_in_attribution: i64,

    /// Distinct enrollments per publisher x destination among registered sources
    pub max_distinct_enrollments_in_source: i64,

    pub max_event_reports_per_destination: i64,
    pub max_aggregate_reports_per_destination: i64,

    /// Triggers processed per pass; the rest wait for the next pass
    pub max_attributions_per_invocation: usize,

    pub enable_xna: bool,
    pub enable_coarse_event_report_destinations: bool,

    /// View-through conversions: configurable max event reports for EVENT sources
    pub enable_vtc_configurable_max_event_reports: bool,
    pub vtc_configurable_max_event_reports_count: usize,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            max_attribution_per_rate_limit_window: 100,
            max_distinct_enrollments_in_attribution: 10,
            max_distinct_enrollments_in_source: 100,
            max_event_reports_per_destination: 1024,
            max_aggregate_reports_per_destination: 1024,
            max_attributions_per_invocation: 100,
            enable_xna: false,
            enable_coarse_event_report_destinations: false,
            enable_vtc_configurable_max_event_reports: false,
            vtc_configurable_max_event_reports_count: 1,
        }
    }
}

impl Flags {
    /// Load flags from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read flags file: {:?}", path.as_ref()))?;

        let flags: Flags = serde_json::from_str(&content).context("Failed to parse flags JSON")?;

        Ok(flags)
    }

    pub fn with_xna(mut self, enabled: bool) -> Self {
        self.enable_xna = enabled;
        self
    }

    pub fn with_coarse_event_report_destinations(mut self, enabled: bool) -> Self {
        self.enable_coarse_event_report_destinations = enabled;
        self
    }

    pub fn with_vtc_max_event_reports(mut self, count: usize) -> Self {
        self.enable_vtc_configurable_max_event_reports = true;
        self.vtc_configurable_max_event_reports_count = count;
        self
    }

    pub fn with_max_attribution_per_rate_limit_window(mut self, max: i64) -> Self {
        self.max_attribution_per_rate_limit_window = max;
        self
    }

    pub fn with_max_attributions_per_invocation(mut self, max: usize) -> Self {
        self.max_attributions_per_invocation = max;
        self
    }

    pub fn with_max_event_reports_per_destination(mut self, max: i64) -> Self {
        self.max_event_reports_per_destination = max;
        self
    }

    pub fn with_max_aggregate_reports_per_destination(mut self, max: i64) -> Self {
        self.max_aggregate_reports_per_destination = max;
        self
    }
}
