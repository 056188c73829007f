// 🎯 Trigger Entity - A conversion seeking attribution

use super::{enum_column, hex_key, json_column, u64_string, AttributionConfig, EventSurfaceType};
use crate::filter::FilterSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// TRIGGER STATUS
// ============================================================================

/// PENDING -> {ATTRIBUTED, IGNORED}, one-way
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStatus {
    Pending,
    Ignored,
    Attributed,
    MarkedToDelete,
}

impl TriggerStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            TriggerStatus::Pending => 0,
            TriggerStatus::Ignored => 1,
            TriggerStatus::Attributed => 2,
            TriggerStatus::MarkedToDelete => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(TriggerStatus::Pending),
            1 => Some(TriggerStatus::Ignored),
            2 => Some(TriggerStatus::Attributed),
            3 => Some(TriggerStatus::MarkedToDelete),
            _ => None,
        }
    }
}

// ============================================================================
// EVENT TRIGGER
// ============================================================================

/// One candidate for event-level attribution; the first whose filters match wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    #[serde(with = "u64_string")]
    pub trigger_data: u64,

    #[serde(rename = "priority", default)]
    pub trigger_priority: i64,

    #[serde(
        rename = "deduplication_key",
        with = "u64_string::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dedup_key: Option<u64>,

    #[serde(rename = "filters", default, skip_serializing_if = "Option::is_none")]
    pub filter_set: Option<FilterSet>,

    #[serde(rename = "not_filters", default, skip_serializing_if = "Option::is_none")]
    pub not_filter_set: Option<FilterSet>,
}

impl EventTrigger {
    pub fn new(trigger_data: u64) -> Self {
        EventTrigger {
            trigger_data,
            trigger_priority: 0,
            dedup_key: None,
            filter_set: None,
            not_filter_set: None,
        }
    }
}

// ============================================================================
// AGGREGATE TRIGGER DATA / DEDUP KEYS
// ============================================================================

/// Key piece OR-ed into each listed source key when the filters match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTriggerData {
    #[serde(with = "hex_key")]
    pub key_piece: u128,

    pub source_keys: Vec<String>,

    #[serde(rename = "filters", default, skip_serializing_if = "Option::is_none")]
    pub filter_set: Option<FilterSet>,

    #[serde(rename = "not_filters", default, skip_serializing_if = "Option::is_none")]
    pub not_filter_set: Option<FilterSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDeduplicationKey {
    #[serde(with = "u64_string::option", default, skip_serializing_if = "Option::is_none")]
    pub deduplication_key: Option<u64>,

    #[serde(rename = "filters", default, skip_serializing_if = "Option::is_none")]
    pub filter_set: Option<FilterSet>,

    #[serde(rename = "not_filters", default, skip_serializing_if = "Option::is_none")]
    pub not_filter_set: Option<FilterSet>,
}

// ============================================================================
// TRIGGER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub attribution_destination: String,
    pub destination_type: EventSurfaceType,
    pub trigger_time: i64,
    pub status: TriggerStatus,
    pub enrollment_id: String,
    pub registrant: String,
    pub registration_origin: String,

    pub event_triggers: Vec<EventTrigger>,

    /// Top-level filters, matched against the winning source
    pub filters: Option<FilterSet>,
    pub not_filters: Option<FilterSet>,

    pub aggregate_trigger_data: Vec<AggregateTriggerData>,
    pub aggregate_values: Option<BTreeMap<String, i64>>,
    pub aggregate_deduplication_keys: Vec<AggregateDeduplicationKey>,

    /// Cross-network configuration; present only for XNA-enabled triggers
    pub attribution_config: Option<Vec<AttributionConfig>>,
}

pub const TRIGGER_COLUMNS: &str = "id, attribution_destination, destination_type, trigger_time, \
     status, enrollment_id, registrant, registration_origin, event_triggers, filters, \
     not_filters, aggregate_trigger_data, aggregate_values, aggregate_deduplication_keys, \
     attribution_config";

impl Trigger {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Trigger> {
        Ok(Trigger {
            id: row.get("id")?,
            attribution_destination: row.get("attribution_destination")?,
            destination_type: enum_column(row, "destination_type", EventSurfaceType::from_i64)?,
            trigger_time: row.get("trigger_time")?,
            status: enum_column(row, "status", TriggerStatus::from_i64)?,
            enrollment_id: row.get("enrollment_id")?,
            registrant: row.get("registrant")?,
            registration_origin: row.get("registration_origin")?,
            event_triggers: json_column(row, "event_triggers")?.unwrap_or_default(),
            filters: json_column(row, "filters")?,
            not_filters: json_column(row, "not_filters")?,
            aggregate_trigger_data: json_column(row, "aggregate_trigger_data")?.unwrap_or_default(),
            aggregate_values: json_column(row, "aggregate_values")?,
            aggregate_deduplication_keys: json_column(row, "aggregate_deduplication_keys")?
                .unwrap_or_default(),
            attribution_config: json_column(row, "attribution_config")?,
        })
    }

    /// Destination in the form stored on sources: app uri as-is, web as site
    pub fn destination_value(&self) -> Option<String> {
        match self.destination_type {
            EventSurfaceType::App => Some(self.attribution_destination.clone()),
            EventSurfaceType::Web => {
                crate::web::top_private_domain_and_scheme(&self.attribution_destination)
            }
        }
    }

    /// Destination written into reports
    pub fn destination_base_uri(&self) -> Option<String> {
        crate::web::site_for(&self.attribution_destination, self.destination_type)
    }

    /// Enrollments named as `source_network` in the cross-network config
    pub fn xna_enrollment_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .attribution_config
            .iter()
            .flatten()
            .map(|config| config.source_network.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
