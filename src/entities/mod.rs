// Entity Models - Records flowing through the attribution pass
//
// Sources and triggers are registered elsewhere and read here; reports and
// attribution ledger rows are produced by the engine.
//
// Each record is an immutable value built from a row by a fallible
// `from_row`; optional JSON columns map to explicit `None` or empty values.

pub mod attribution;
pub mod attribution_config;
pub mod report;
pub mod source;
pub mod trigger;

pub use attribution::Attribution;
pub use attribution_config::{AttributionConfig, PriorityRange};
pub use report::{
    AggregateHistogramContribution, AggregateReport, AggregateReportStatus, DebugReportStatus,
    EventReport, EventReportStatus,
};
pub use source::{AttributionMode, Source, SourceStatus, SourceType};
pub use trigger::{
    AggregateDeduplicationKey, AggregateTriggerData, EventTrigger, Trigger, TriggerStatus,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// EVENT SURFACE TYPE
// ============================================================================

/// Where a publisher or destination lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSurfaceType {
    App,
    Web,
}

impl EventSurfaceType {
    pub fn as_i64(&self) -> i64 {
        match self {
            EventSurfaceType::App => 1,
            EventSurfaceType::Web => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(EventSurfaceType::App),
            2 => Some(EventSurfaceType::Web),
            _ => None,
        }
    }
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

/// Map an enum column, failing the row on unknown values
pub(crate) fn enum_column<T>(
    row: &rusqlite::Row,
    column: &str,
    parse: fn(i64) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: i64 = row.get(column)?;
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("unknown value {} in column {}", raw, column).into(),
        )
    })
}

/// Parse an optional JSON text column
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    column: &str,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(column)?;
    match raw {
        Some(text) if !text.is_empty() => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        }),
        _ => Ok(None),
    }
}

/// Serialize an optional value into a JSON text column
pub(crate) fn to_json_column<T: Serialize>(value: &Option<T>) -> crate::error::Result<Option<String>> {
    match value {
        Some(v) => Ok(Some(serde_json::to_string(v)?)),
        None => Ok(None),
    }
}

/// u64 values are stored bit-for-bit in SQLite's signed INTEGER
pub(crate) fn u64_to_sql(value: u64) -> i64 {
    value as i64
}

pub(crate) fn u64_from_sql(value: i64) -> u64 {
    value as u64
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

/// 128-bit aggregation key pieces as "0x..." hex strings
pub(crate) mod hex_key {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(text: &str) -> Result<u128, String> {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .ok_or_else(|| format!("key piece {:?} is missing 0x prefix", text))?;
        u128::from_str_radix(digits, 16).map_err(|e| format!("key piece {:?}: {}", text, e))
    }

    pub fn format(value: u128) -> String {
        format!("0x{:x}", value)
    }

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(de::Error::custom)
    }

    /// Same encoding for a key -> key piece map
    pub mod map {
        use serde::ser::SerializeMap;
        use serde::{de, Deserialize, Deserializer, Serializer};
        use std::collections::BTreeMap;

        pub fn serialize<S: Serializer>(
            value: &Option<BTreeMap<String, u128>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(pieces) => {
                    let mut map = serializer.serialize_map(Some(pieces.len()))?;
                    for (key, piece) in pieces {
                        map.serialize_entry(key, &super::format(*piece))?;
                    }
                    map.end()
                }
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<BTreeMap<String, u128>>, D::Error> {
            let raw: Option<BTreeMap<String, String>> = Option::deserialize(deserializer)?;
            raw.map(|pieces| {
                pieces
                    .into_iter()
                    .map(|(k, v)| super::parse(&v).map(|p| (k, p)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map_err(de::Error::custom)
            })
            .transpose()
        }
    }
}

/// Unsigned 64-bit values arrive as decimal strings or plain numbers
pub(crate) mod u64_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    fn resolve<E: de::Error>(raw: Raw) -> Result<u64, E> {
        match raw {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.parse::<u64>().map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        resolve(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::Raw;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_str(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(super::resolve)
                .transpose()
        }
    }
}
