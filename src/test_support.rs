// Shared fixtures for unit tests

use crate::entities::{
    AttributionMode, EventSurfaceType, EventTrigger, Source, SourceStatus, SourceType, Trigger,
    TriggerStatus,
};
use crate::filter::FilterMap;
use crate::flags::ONE_DAY_MS;

/// 2023-01-01T00:00:00Z
pub const BASE_TIME: i64 = 1_672_531_200_000;

/// Navigation source on https://publisher.com pointing at https://advertiser.com
pub fn source_fixture(id: &str) -> Source {
    Source {
        id: id.to_string(),
        event_id: 1,
        publisher: "https://publisher.com".to_string(),
        publisher_type: EventSurfaceType::Web,
        app_destinations: Vec::new(),
        web_destinations: vec!["https://advertiser.com".to_string()],
        enrollment_id: "enrollment".to_string(),
        registrant: "android-app://com.registrant".to_string(),
        event_time: BASE_TIME,
        expiry_time: BASE_TIME + 30 * ONE_DAY_MS,
        event_report_window: BASE_TIME + 30 * ONE_DAY_MS,
        aggregatable_report_window: BASE_TIME + 30 * ONE_DAY_MS,
        priority: 0,
        status: SourceStatus::Active,
        source_type: SourceType::Navigation,
        attribution_mode: AttributionMode::Truthfully,
        install_attribution_window: 0,
        install_cooldown_window: 0,
        is_install_attributed: false,
        filter_data: FilterMap::new(),
        aggregate_source: None,
        event_report_dedup_keys: Vec::new(),
        aggregate_report_dedup_keys: Vec::new(),
        aggregate_contributions: 0,
        registration_origin: "https://adtech.test".to_string(),
        registration_id: None,
        shared_aggregation_keys: None,
        parent_id: None,
        coarse_event_report_destinations: false,
    }
}

/// Pending web trigger one day after the fixture source
pub fn trigger_fixture(id: &str) -> Trigger {
    Trigger {
        id: id.to_string(),
        attribution_destination: "https://advertiser.com".to_string(),
        destination_type: EventSurfaceType::Web,
        trigger_time: BASE_TIME + ONE_DAY_MS,
        status: TriggerStatus::Pending,
        enrollment_id: "enrollment".to_string(),
        registrant: "android-app://com.registrant".to_string(),
        registration_origin: "https://adtech.test".to_string(),
        event_triggers: vec![EventTrigger::new(1)],
        filters: None,
        not_filters: None,
        aggregate_trigger_data: Vec::new(),
        aggregate_values: None,
        aggregate_deduplication_keys: Vec::new(),
        attribution_config: None,
    }
}
