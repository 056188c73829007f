// 📣 Source Entity - An ad impression or click eligible for attribution

use super::{enum_column, hex_key, json_column, u64_from_sql, EventSurfaceType};
use crate::filter::{FilterMap, SOURCE_TYPE_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// SOURCE STATUS / TYPE / ATTRIBUTION MODE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    Active,
    Ignored,
    MarkedToDelete,
}

impl SourceStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            SourceStatus::Active => 0,
            SourceStatus::Ignored => 1,
            SourceStatus::MarkedToDelete => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(SourceStatus::Active),
            1 => Some(SourceStatus::Ignored),
            2 => Some(SourceStatus::MarkedToDelete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// View-through (impression)
    Event,

    /// Click-through
    Navigation,
}

impl SourceType {
    /// Name exposed to filters under the `source_type` key
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Event => "event",
            SourceType::Navigation => "navigation",
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            SourceType::Event => 0,
            SourceType::Navigation => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(SourceType::Event),
            1 => Some(SourceType::Navigation),
            _ => None,
        }
    }

    /// Trigger data values allowed in event reports for this source type
    pub fn trigger_data_cardinality(&self) -> u64 {
        match self {
            SourceType::Event => 2,
            SourceType::Navigation => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributionMode {
    Unassigned,
    Truthfully,
    Never,
    Falsely,
}

impl AttributionMode {
    pub fn as_i64(&self) -> i64 {
        match self {
            AttributionMode::Unassigned => 0,
            AttributionMode::Truthfully => 1,
            AttributionMode::Never => 2,
            AttributionMode::Falsely => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(AttributionMode::Unassigned),
            1 => Some(AttributionMode::Truthfully),
            2 => Some(AttributionMode::Never),
            3 => Some(AttributionMode::Falsely),
            _ => None,
        }
    }
}

// ============================================================================
// SOURCE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub event_id: u64,
    pub publisher: String,
    pub publisher_type: EventSurfaceType,
    pub app_destinations: Vec<String>,
    pub web_destinations: Vec<String>,
    pub enrollment_id: String,
    pub registrant: String,

    // ========================================================================
    // TIME (ms since epoch)
    // ========================================================================
    pub event_time: i64,
    pub expiry_time: i64,
    pub event_report_window: i64,
    pub aggregatable_report_window: i64,

    pub priority: i64,
    pub status: SourceStatus,
    pub source_type: SourceType,
    pub attribution_mode: AttributionMode,

    // ========================================================================
    // INSTALL ATTRIBUTION
    // ========================================================================
    pub install_attribution_window: i64,
    pub install_cooldown_window: i64,
    pub is_install_attributed: bool,

    pub filter_data: FilterMap,

    /// Aggregation key name -> 128-bit key piece
    #[serde(with = "hex_key::map", default)]
    pub aggregate_source: Option<BTreeMap<String, u128>>,

    // ========================================================================
    // LEDGER STATE (mutated by attribution)
    // ========================================================================
    pub event_report_dedup_keys: Vec<u64>,
    pub aggregate_report_dedup_keys: Vec<u64>,
    pub aggregate_contributions: i64,

    pub registration_origin: String,
    pub registration_id: Option<String>,

    /// Aggregation keys a cross-network derived source may use
    pub shared_aggregation_keys: Option<Vec<String>>,

    /// Set only on cross-network derived sources; never persisted
    pub parent_id: Option<String>,

    pub coarse_event_report_destinations: bool,
}

/// Columns selected whenever a source row is mapped
pub const SOURCE_COLUMNS: &str = "id, event_id, publisher, publisher_type, enrollment_id, \
     registrant, event_time, expiry_time, event_report_window, aggregatable_report_window, \
     priority, status, source_type, attribution_mode, install_attribution_window, \
     install_cooldown_window, is_install_attributed, filter_data, aggregate_source, \
     event_report_dedup_keys, aggregate_report_dedup_keys, aggregate_contributions, \
     registration_origin, registration_id, shared_aggregation_keys, \
     coarse_event_report_destinations";

impl Source {
    /// Map a `source` row. Destinations live in their own table and are
    /// attached by the caller.
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Source> {
        let aggregate_source: Option<BTreeMap<String, String>> = json_column(row, "aggregate_source")?;
        let aggregate_source = aggregate_source
            .map(|pieces| {
                pieces
                    .into_iter()
                    .map(|(k, v)| hex_key::parse(&v).map(|p| (k, p)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
            })
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
            })?;

        Ok(Source {
            id: row.get("id")?,
            event_id: u64_from_sql(row.get("event_id")?),
            publisher: row.get("publisher")?,
            publisher_type: enum_column(row, "publisher_type", EventSurfaceType::from_i64)?,
            app_destinations: Vec::new(),
            web_destinations: Vec::new(),
            enrollment_id: row.get("enrollment_id")?,
            registrant: row.get("registrant")?,
            event_time: row.get("event_time")?,
            expiry_time: row.get("expiry_time")?,
            event_report_window: row.get("event_report_window")?,
            aggregatable_report_window: row.get("aggregatable_report_window")?,
            priority: row.get("priority")?,
            status: enum_column(row, "status", SourceStatus::from_i64)?,
            source_type: enum_column(row, "source_type", SourceType::from_i64)?,
            attribution_mode: enum_column(row, "attribution_mode", AttributionMode::from_i64)?,
            install_attribution_window: row.get("install_attribution_window")?,
            install_cooldown_window: row.get("install_cooldown_window")?,
            is_install_attributed: row.get("is_install_attributed")?,
            filter_data: json_column(row, "filter_data")?.unwrap_or_default(),
            aggregate_source,
            event_report_dedup_keys: json_column(row, "event_report_dedup_keys")?.unwrap_or_default(),
            aggregate_report_dedup_keys: json_column(row, "aggregate_report_dedup_keys")?
                .unwrap_or_default(),
            aggregate_contributions: row.get("aggregate_contributions")?,
            registration_origin: row.get("registration_origin")?,
            registration_id: row.get("registration_id")?,
            shared_aggregation_keys: json_column(row, "shared_aggregation_keys")?,
            parent_id: None,
            coarse_event_report_destinations: row.get("coarse_event_report_destinations")?,
        })
    }

    /// Filter data as seen by trigger filters: stored data plus `source_type`
    pub fn filter_data_with_source_type(&self) -> FilterMap {
        let mut map = self.filter_data.clone();
        map.insert(
            SOURCE_TYPE_KEY.to_string(),
            vec![self.source_type.as_str().to_string()],
        );
        map
    }

    pub fn is_derived(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn destinations(&self, surface: EventSurfaceType) -> &[String] {
        match surface {
            EventSurfaceType::App => &self.app_destinations,
            EventSurfaceType::Web => &self.web_destinations,
        }
    }

    /// Install attribution only counts toward an app destination
    pub fn has_app_install_attribution(&self, destination_type: EventSurfaceType) -> bool {
        destination_type == EventSurfaceType::App && self.is_install_attributed
    }

    pub fn is_within_install_cooldown(&self, trigger_time: i64) -> bool {
        trigger_time < self.event_time.saturating_add(self.install_cooldown_window)
    }

    /// Serialized form of `aggregate_source` for storage
    pub fn aggregate_source_json(&self) -> crate::error::Result<Option<String>> {
        let encoded = self.aggregate_source.as_ref().map(|pieces| {
            pieces
                .iter()
                .map(|(k, v)| (k.clone(), hex_key::format(*v)))
                .collect::<BTreeMap<String, String>>()
        });
        super::to_json_column(&encoded)
    }
}
