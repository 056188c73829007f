// 🔗 Attribution Config - Cross-network rules carried on a trigger
//
// Example:
// [{ "source_network": "AdTech1-Ads",
//    "source_priority_range": { "start": 100, "end": 1000 },
//    "source_filters": [{ "campaign_type": ["install"] }],
//    "priority": "99", "expiry": "604800",
//    "filter_data": { "campaign_type": ["install"] } }]

use crate::filter::{FilterMap, FilterSet};
use serde::{de, Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRange {
    pub start: i64,
    pub end: i64,
}

impl PriorityRange {
    pub fn contains(&self, priority: i64) -> bool {
        self.start <= priority && priority <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Enrollment of the ad-tech whose sources may be borrowed
    pub source_network: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_priority_range: Option<PriorityRange>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filters: Option<FilterSet>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_not_filters: Option<FilterSet>,

    /// Seconds after source event time past which the parent is not eligible
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub source_expiry_override: Option<i64>,

    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    /// Derived source lifetime in seconds from the parent's event time
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_data: Option<FilterMap>,

    /// Install cooldown for the derived source, in milliseconds
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub post_install_exclusivity_window: Option<i64>,
}

impl AttributionConfig {
    pub fn new(source_network: &str) -> Self {
        AttributionConfig {
            source_network: source_network.to_string(),
            source_priority_range: None,
            source_filters: None,
            source_not_filters: None,
            source_expiry_override: None,
            priority: None,
            expiry: None,
            filter_data: None,
            post_install_exclusivity_window: None,
        }
    }
}

/// Numbers may be sent quoted ("99") or bare (99)
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s.trim().parse::<i64>().map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}
