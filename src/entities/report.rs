// 📄 Reports - Event-level and aggregate outputs of attribution

use super::{enum_column, json_column, u64_from_sql, SourceType};
use serde::{Deserialize, Serialize};

// ============================================================================
// STATUSES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReportStatus {
    Pending,
    Delivered,
    MarkedToDelete,
}

impl EventReportStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            EventReportStatus::Pending => 0,
            EventReportStatus::Delivered => 1,
            EventReportStatus::MarkedToDelete => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(EventReportStatus::Pending),
            1 => Some(EventReportStatus::Delivered),
            2 => Some(EventReportStatus::MarkedToDelete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugReportStatus {
    None,
    Pending,
    Delivered,
}

impl DebugReportStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            DebugReportStatus::None => 0,
            DebugReportStatus::Pending => 1,
            DebugReportStatus::Delivered => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(DebugReportStatus::None),
            1 => Some(DebugReportStatus::Pending),
            2 => Some(DebugReportStatus::Delivered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateReportStatus {
    Pending,
    Delivered,
    MarkedToDelete,
}

impl AggregateReportStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            AggregateReportStatus::Pending => 0,
            AggregateReportStatus::Delivered => 1,
            AggregateReportStatus::MarkedToDelete => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(AggregateReportStatus::Pending),
            1 => Some(AggregateReportStatus::Delivered),
            2 => Some(AggregateReportStatus::MarkedToDelete),
            _ => None,
        }
    }
}

// ============================================================================
// EVENT REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub id: String,
    pub source_event_id: u64,
    pub enrollment_id: String,
    /// Destination the trigger fired on; counted against per-destination caps
    pub attribution_destination: String,
    /// Destinations the report will name
    pub attribution_destinations: Vec<String>,
    pub trigger_time: i64,
    pub trigger_data: u64,
    pub trigger_priority: i64,
    pub trigger_dedup_key: Option<u64>,
    pub report_time: i64,
    pub status: EventReportStatus,
    pub debug_report_status: DebugReportStatus,
    pub source_type: SourceType,
    pub randomized_trigger_rate: f64,
    pub source_id: String,
    pub trigger_id: String,
    pub registration_origin: String,
}

pub const EVENT_REPORT_COLUMNS: &str = "id, source_event_id, enrollment_id, \
     attribution_destination, attribution_destinations, trigger_time, trigger_data, \
     trigger_priority, trigger_dedup_key, report_time, status, debug_report_status, source_type, \
     randomized_trigger_rate, source_id, trigger_id, registration_origin";

impl EventReport {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<EventReport> {
        let dedup_key: Option<i64> = row.get("trigger_dedup_key")?;
        Ok(EventReport {
            id: row.get("id")?,
            source_event_id: u64_from_sql(row.get("source_event_id")?),
            enrollment_id: row.get("enrollment_id")?,
            attribution_destination: row.get("attribution_destination")?,
            attribution_destinations: json_column(row, "attribution_destinations")?
                .unwrap_or_default(),
            trigger_time: row.get("trigger_time")?,
            trigger_data: u64_from_sql(row.get("trigger_data")?),
            trigger_priority: row.get("trigger_priority")?,
            trigger_dedup_key: dedup_key.map(u64_from_sql),
            report_time: row.get("report_time")?,
            status: enum_column(row, "status", EventReportStatus::from_i64)?,
            debug_report_status: enum_column(row, "debug_report_status", DebugReportStatus::from_i64)?,
            source_type: enum_column(row, "source_type", SourceType::from_i64)?,
            randomized_trigger_rate: row.get("randomized_trigger_rate")?,
            source_id: row.get("source_id")?,
            trigger_id: row.get("trigger_id")?,
            registration_origin: row.get("registration_origin")?,
        })
    }
}

// ============================================================================
// AGGREGATE REPORT
// ============================================================================

/// One histogram bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateHistogramContribution {
    pub key: u128,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub id: String,
    pub publisher: String,
    pub attribution_destination: String,
    /// Source event time rounded down to the day
    pub source_registration_time: i64,
    pub scheduled_report_time: i64,
    pub enrollment_id: String,
    /// Cleartext histogram; encryption happens at delivery
    pub debug_cleartext_payload: String,
    pub status: AggregateReportStatus,
    pub api_version: String,
    pub source_id: String,
    pub trigger_id: String,
    pub registration_origin: String,
    pub dedup_key: Option<u64>,
}

pub const AGGREGATE_REPORT_COLUMNS: &str = "id, publisher, attribution_destination, \
     source_registration_time, scheduled_report_time, enrollment_id, debug_cleartext_payload, \
     status, api_version, source_id, trigger_id, registration_origin, dedup_key";

impl AggregateReport {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<AggregateReport> {
        let dedup_key: Option<i64> = row.get("dedup_key")?;
        Ok(AggregateReport {
            id: row.get("id")?,
            publisher: row.get("publisher")?,
            attribution_destination: row.get("attribution_destination")?,
            source_registration_time: row.get("source_registration_time")?,
            scheduled_report_time: row.get("scheduled_report_time")?,
            enrollment_id: row.get("enrollment_id")?,
            debug_cleartext_payload: row.get("debug_cleartext_payload")?,
            status: enum_column(row, "status", AggregateReportStatus::from_i64)?,
            api_version: row.get("api_version")?,
            source_id: row.get("source_id")?,
            trigger_id: row.get("trigger_id")?,
            registration_origin: row.get("registration_origin")?,
            dedup_key: dedup_key.map(u64_from_sql),
        })
    }

    /// Build the cleartext histogram payload
    pub fn payload_from(contributions: &[AggregateHistogramContribution]) -> String {
        let data: Vec<serde_json::Value> = contributions
            .iter()
            .map(|c| {
                serde_json::json!({
                    "bucket": c.key.to_string(),
                    "value": c.value,
                })
            })
            .collect();

        serde_json::json!({
            "operation": "histogram",
            "data": data,
        })
        .to_string()
    }

    /// Parse the cleartext payload back into contributions
    pub fn contributions(&self) -> crate::error::Result<Vec<AggregateHistogramContribution>> {
        #[derive(Deserialize)]
        struct Bucket {
            bucket: String,
            value: i64,
        }
        #[derive(Deserialize)]
        struct Payload {
            data: Vec<Bucket>,
        }

        let payload: Payload = serde_json::from_str(&self.debug_cleartext_payload)?;
        payload
            .data
            .into_iter()
            .map(|b| {
                b.bucket
                    .parse::<u128>()
                    .map(|key| AggregateHistogramContribution { key, value: b.value })
                    .map_err(|e| crate::error::DatastoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}
