// Attribution pass end to end, against both the SQLite store and the in-memory fake

use measurement_attribution::{
    AggregateTriggerData, Attribution, AttributionConfig, AttributionEngine, AttributionMode,
    DaoCall, DatastoreManager, EventReport, EventSurfaceType, EventTrigger, FilterMap,
    FixedReportDelay, Flags, InMemoryDatastore, Source, SourceStatus, SourceType,
    SqliteDatastore, Trigger, TriggerOutcome, TriggerStatus,
};
use std::collections::BTreeMap;

const BASE_TIME: i64 = 1_700_000_000_000;
const ONE_MINUTE_MS: i64 = 60 * 1000;
const ONE_DAY_MS: i64 = 24 * 60 * ONE_MINUTE_MS;

// ============================================================================
// FIXTURES
// ============================================================================

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn sqlite() -> SqliteDatastore {
    SqliteDatastore::open_in_memory().unwrap()
}

fn source(id: &str) -> Source {
    Source {
        id: id.to_string(),
        event_id: 100,
        publisher: "https://news.publisher.com".to_string(),
        publisher_type: EventSurfaceType::Web,
        app_destinations: vec!["android-app://com.advertiser".to_string()],
        web_destinations: vec!["https://advertiser.com".to_string()],
        enrollment_id: "enrollment-a".to_string(),
        registrant: "android-app://com.publisher".to_string(),
        event_time: BASE_TIME,
        expiry_time: BASE_TIME + 30 * ONE_DAY_MS,
        event_report_window: BASE_TIME + 30 * ONE_DAY_MS,
        aggregatable_report_window: BASE_TIME + 30 * ONE_DAY_MS,
        priority: 100,
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
        registration_origin: "https://adtech-a.test".to_string(),
        registration_id: None,
        shared_aggregation_keys: None,
        parent_id: None,
        coarse_event_report_destinations: false,
    }
}

/// Web trigger on a subdomain of the source destination, `minutes` after day one
fn trigger(id: &str, minutes: i64) -> Trigger {
    Trigger {
        id: id.to_string(),
        attribution_destination: "https://shop.advertiser.com".to_string(),
        destination_type: EventSurfaceType::Web,
        trigger_time: BASE_TIME + ONE_DAY_MS + minutes * ONE_MINUTE_MS,
        status: TriggerStatus::Pending,
        enrollment_id: "enrollment-a".to_string(),
        registrant: "android-app://com.advertiser".to_string(),
        registration_origin: "https://adtech-a.test".to_string(),
        event_triggers: vec![EventTrigger::new(1)],
        filters: None,
        not_filters: None,
        aggregate_trigger_data: Vec::new(),
        aggregate_values: None,
        aggregate_deduplication_keys: Vec::new(),
        attribution_config: None,
    }
}

fn event_trigger(data: u64, priority: i64, dedup_key: Option<u64>) -> EventTrigger {
    let mut et = EventTrigger::new(data);
    et.trigger_priority = priority;
    et.dedup_key = dedup_key;
    et
}

fn aggregatable(trigger: &mut Trigger, value: i64) {
    trigger.aggregate_trigger_data = vec![AggregateTriggerData {
        key_piece: 0x400,
        source_keys: vec!["campaignCounts".to_string()],
        filter_set: None,
        not_filter_set: None,
    }];
    trigger.aggregate_values = Some(BTreeMap::from([("campaignCounts".to_string(), value)]));
}

// ============================================================================
// HELPERS
// ============================================================================

fn seed<D: DatastoreManager>(store: &D, sources: &[Source], triggers: &[Trigger]) {
    store
        .run_in_transaction(|dao| {
            for s in sources {
                dao.insert_source(s)?;
            }
            for t in triggers {
                dao.insert_trigger(t)?;
            }
            Ok(())
        })
        .unwrap();
}

fn engine<D: DatastoreManager>(store: D, flags: Flags) -> AttributionEngine<D> {
    AttributionEngine::new(store, flags).with_report_delay(Box::new(FixedReportDelay(30 * ONE_MINUTE_MS)))
}

fn trigger_status<D: DatastoreManager>(engine: &AttributionEngine<D>, id: &str) -> TriggerStatus {
    engine
        .datastore()
        .run_in_transaction(|dao| Ok(dao.get_trigger(id)?))
        .unwrap()
        .status
}

fn stored_source<D: DatastoreManager>(engine: &AttributionEngine<D>, id: &str) -> Source {
    engine
        .datastore()
        .run_in_transaction(|dao| Ok(dao.get_source(id)?))
        .unwrap()
}

fn event_reports<D: DatastoreManager>(engine: &AttributionEngine<D>, source_id: &str) -> Vec<EventReport> {
    engine
        .datastore()
        .run_in_transaction(|dao| {
            let source = dao.get_source(source_id)?;
            Ok(dao.get_source_event_reports(&source)?)
        })
        .unwrap()
}

fn attributions<D: DatastoreManager>(engine: &AttributionEngine<D>, trigger_id: &str) -> Vec<Attribution> {
    engine
        .datastore()
        .run_in_transaction(|dao| Ok(dao.get_attributions_for_trigger(trigger_id)?))
        .unwrap()
}

// ============================================================================
// SCENARIOS
// ============================================================================

fn check_low_priority_source_ignored<D: DatastoreManager>(store: D) {
    let mut low = source("low");
    low.priority = 100;
    let mut high = source("high");
    high.priority = 200;
    let mut t = trigger("t1", 0);
    t.event_triggers = vec![event_trigger(2, 0, Some(2))];
    seed(&store, &[low, high], &[t]);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());

    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Attributed);
    let winner = stored_source(&engine, "high");
    assert_eq!(winner.status, SourceStatus::Active);
    assert_eq!(winner.event_report_dedup_keys, vec![2]);
    assert_eq!(stored_source(&engine, "low").status, SourceStatus::Ignored);

    let reports = event_reports(&engine, "high");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].trigger_id, "t1");
    assert_eq!(reports[0].trigger_data, 2);
    assert_eq!(reports[0].attribution_destinations, vec!["https://advertiser.com".to_string()]);
    assert!(event_reports(&engine, "low").is_empty());

    let ledger = attributions(&engine, "t1");
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].source_id, "high");
    assert_eq!(ledger[0].source_site, "https://publisher.com");
    assert_eq!(ledger[0].destination_site, "https://advertiser.com");
}

#[test]
fn test_low_priority_source_ignored() {
    init_logging();
    check_low_priority_source_ignored(sqlite());
    check_low_priority_source_ignored(InMemoryDatastore::new());
}

fn check_non_pending_triggers_untouched<D: DatastoreManager>(store: D) {
    let mut done = trigger("done", 0);
    done.status = TriggerStatus::Ignored;
    seed(&store, &[source("s1")], &[trigger("t1", 1), done]);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Attributed);
    assert_eq!(trigger_status(&engine, "done"), TriggerStatus::Ignored);

    let before = stored_source(&engine, "s1");
    assert!(engine.perform_pending_attributions().unwrap());

    // Driving the finished trigger directly changes nothing either
    let outcome = engine
        .datastore()
        .run_in_transaction(|dao| engine.perform_attribution(dao, "t1"))
        .unwrap();
    assert_eq!(outcome, TriggerOutcome::Skipped);

    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Attributed);
    assert_eq!(stored_source(&engine, "s1"), before);
    assert_eq!(event_reports(&engine, "s1").len(), 1);
    assert_eq!(attributions(&engine, "t1").len(), 1);
    assert!(attributions(&engine, "done").is_empty());
}

#[test]
fn test_non_pending_triggers_untouched() {
    init_logging();
    check_non_pending_triggers_untouched(sqlite());
    check_non_pending_triggers_untouched(InMemoryDatastore::new());
}

fn check_report_cap_per_source<D: DatastoreManager>(store: D) {
    let triggers: Vec<Trigger> = (0..5)
        .map(|i| {
            let mut t = trigger(&format!("t{}", i), i);
            t.event_triggers = vec![event_trigger(1, 0, Some(i as u64))];
            t
        })
        .collect();
    seed(&store, &[source("s1")], &triggers);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());

    // Navigation sources hold at most three reports
    let reports = event_reports(&engine, "s1");
    assert_eq!(reports.len(), 3);
    assert_eq!(trigger_status(&engine, "t2"), TriggerStatus::Attributed);
    assert_eq!(trigger_status(&engine, "t3"), TriggerStatus::Ignored);
    assert_eq!(trigger_status(&engine, "t4"), TriggerStatus::Ignored);
    assert_eq!(stored_source(&engine, "s1").event_report_dedup_keys, vec![0, 1, 2]);
}

#[test]
fn test_report_cap_per_source() {
    init_logging();
    check_report_cap_per_source(sqlite());
    check_report_cap_per_source(InMemoryDatastore::new());
}

fn check_event_source_replaces_lower_priority<D: DatastoreManager>(store: D) {
    let mut s = source("s1");
    s.source_type = SourceType::Event;
    let mut first = trigger("t1", 0);
    first.event_triggers = vec![event_trigger(1, 1, Some(11))];
    let mut second = trigger("t2", 1);
    second.event_triggers = vec![event_trigger(0, 9, Some(22))];
    let mut third = trigger("t3", 2);
    third.event_triggers = vec![event_trigger(1, 9, Some(33))];
    seed(&store, &[s], &[first, second, third]);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());

    let reports = event_reports(&engine, "s1");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].trigger_id, "t2");
    // Equal priority does not evict
    assert_eq!(trigger_status(&engine, "t3"), TriggerStatus::Ignored);
    assert_eq!(stored_source(&engine, "s1").event_report_dedup_keys, vec![22]);
}

#[test]
fn test_event_source_replaces_lower_priority() {
    init_logging();
    check_event_source_replaces_lower_priority(sqlite());
    check_event_source_replaces_lower_priority(InMemoryDatastore::new());
}

fn check_dedup_keys_unique<D: DatastoreManager>(store: D) {
    let triggers: Vec<Trigger> = (0..3)
        .map(|i| {
            let mut t = trigger(&format!("t{}", i), i);
            t.event_triggers = vec![event_trigger(1, 0, Some(7))];
            t
        })
        .collect();
    seed(&store, &[source("s1")], &triggers);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());

    assert_eq!(trigger_status(&engine, "t0"), TriggerStatus::Attributed);
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Ignored);
    assert_eq!(trigger_status(&engine, "t2"), TriggerStatus::Ignored);
    assert_eq!(stored_source(&engine, "s1").event_report_dedup_keys, vec![7]);
    assert_eq!(event_reports(&engine, "s1").len(), 1);
}

#[test]
fn test_dedup_keys_unique() {
    init_logging();
    check_dedup_keys_unique(sqlite());
    check_dedup_keys_unique(InMemoryDatastore::new());
}

fn check_aggregate_budget<D: DatastoreManager>(store: D) {
    let mut s = source("s1");
    s.attribution_mode = AttributionMode::Never;
    s.aggregate_source = Some(BTreeMap::from([("campaignCounts".to_string(), 0x159u128)]));

    let mut triggers = Vec::new();
    for (i, value) in [30_000, 30_000, 30_000, 5_536, 1].into_iter().enumerate() {
        let mut t = trigger(&format!("t{}", i), i as i64);
        aggregatable(&mut t, value);
        triggers.push(t);
    }
    seed(&store, &[s], &triggers);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());

    let statuses: Vec<TriggerStatus> = (0..5).map(|i| trigger_status(&engine, &format!("t{}", i))).collect();
    assert_eq!(
        statuses,
        vec![
            TriggerStatus::Attributed,
            TriggerStatus::Attributed,
            TriggerStatus::Ignored,
            TriggerStatus::Attributed,
            TriggerStatus::Ignored,
        ]
    );
    assert_eq!(stored_source(&engine, "s1").aggregate_contributions, 65_536);

    let reports = engine
        .datastore()
        .run_in_transaction(|dao| Ok(dao.get_aggregate_reports_for_source("s1")?))
        .unwrap();
    assert_eq!(reports.len(), 3);
    let total: i64 = reports
        .iter()
        .flat_map(|r| r.contributions().unwrap())
        .map(|c| c.value)
        .sum();
    assert_eq!(total, 65_536);
}

#[test]
fn test_aggregate_budget() {
    init_logging();
    check_aggregate_budget(sqlite());
    check_aggregate_budget(InMemoryDatastore::new());
}

fn check_filter_intersection<D: DatastoreManager>(store: D) {
    let mut s = source("s1");
    s.filter_data
        .insert("key_1".to_string(), vec!["value_1_x".to_string(), "value_2_x".to_string()]);
    let mut t = trigger("t1", 0);
    let mut filters = FilterMap::new();
    filters.insert("key_1".to_string(), vec!["value_1".to_string()]);
    t.filters = Some(vec![filters]);
    seed(&store, &[s], &[t]);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Ignored);
    assert!(event_reports(&engine, "s1").is_empty());
    assert!(attributions(&engine, "t1").is_empty());
}

#[test]
fn test_filter_intersection() {
    init_logging();
    check_filter_intersection(sqlite());
    check_filter_intersection(InMemoryDatastore::new());
}

fn check_rate_limit<D: DatastoreManager>(store: D) {
    let t = trigger("t1", 0);
    seed(&store, &[source("s1")], &[t.clone()]);
    store
        .run_in_transaction(|dao| {
            for i in 0..105 {
                dao.insert_attribution(&Attribution {
                    id: format!("a{}", i),
                    source_site: "https://publisher.com".to_string(),
                    source_origin: "https://news.publisher.com".to_string(),
                    destination_site: "https://advertiser.com".to_string(),
                    destination_origin: "https://shop.advertiser.com".to_string(),
                    enrollment_id: "enrollment-a".to_string(),
                    trigger_time: t.trigger_time - ONE_DAY_MS,
                    registrant: "android-app://com.advertiser".to_string(),
                    source_id: format!("old-source-{}", i),
                    trigger_id: format!("old-trigger-{}", i),
                })?;
            }
            Ok(())
        })
        .unwrap();

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Ignored);
    assert!(event_reports(&engine, "s1").is_empty());
    assert_eq!(stored_source(&engine, "s1").status, SourceStatus::Active);
}

#[test]
fn test_rate_limit() {
    init_logging();
    check_rate_limit(sqlite());
    check_rate_limit(InMemoryDatastore::new());
}

fn check_distinct_reporting_enrollments<D: DatastoreManager>(store: D) {
    let t = trigger("t1", 0);
    seed(&store, &[source("s1")], &[t.clone()]);
    store
        .run_in_transaction(|dao| {
            for i in 0..10 {
                dao.insert_attribution(&Attribution {
                    id: format!("a{}", i),
                    source_site: "https://publisher.com".to_string(),
                    source_origin: "https://publisher.com".to_string(),
                    destination_site: "https://advertiser.com".to_string(),
                    destination_origin: "https://advertiser.com".to_string(),
                    enrollment_id: format!("other-enrollment-{}", i),
                    trigger_time: t.trigger_time - ONE_MINUTE_MS,
                    registrant: "android-app://com.advertiser".to_string(),
                    source_id: format!("old-source-{}", i),
                    trigger_id: format!("old-trigger-{}", i),
                })?;
            }
            Ok(())
        })
        .unwrap();

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Ignored);
}

#[test]
fn test_distinct_reporting_enrollments() {
    init_logging();
    check_distinct_reporting_enrollments(sqlite());
    check_distinct_reporting_enrollments(InMemoryDatastore::new());
}

fn check_report_window_boundary<D: DatastoreManager>(store: D) {
    let t = trigger("t1", 0);
    let mut s = source("s1");
    s.event_report_window = t.trigger_time - 1;
    let mut at_boundary = source("s2");
    at_boundary.web_destinations = vec!["https://other-advertiser.com".to_string()];
    let mut t2 = trigger("t2", 1);
    t2.attribution_destination = "https://other-advertiser.com".to_string();
    at_boundary.event_report_window = t2.trigger_time;
    seed(&store, &[s, at_boundary], &[t, t2]);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());

    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Ignored);
    assert!(event_reports(&engine, "s1").is_empty());

    // Window end is inclusive
    assert_eq!(trigger_status(&engine, "t2"), TriggerStatus::Attributed);
    let reports = event_reports(&engine, "s2");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].report_time, reports[0].trigger_time + 60 * ONE_MINUTE_MS);
}

fn check_distinct_registering_enrollments<D: DatastoreManager>(store: D, other_enrollments: usize) -> TriggerStatus {
    let others: Vec<Source> = (0..other_enrollments)
        .map(|i| {
            let mut s = source(&format!("other-{}", i));
            s.enrollment_id = format!("other-enrollment-{}", i);
            s.registration_origin = format!("https://adtech-{}.test", i);
            s
        })
        .collect();
    seed(&store, &others, &[]);
    seed(&store, &[source("s1")], &[trigger("t1", 0)]);

    let engine = engine(store, Flags::default());
    assert!(engine.perform_pending_attributions().unwrap());
    trigger_status(&engine, "t1")
}

#[test]
fn test_distinct_registering_enrollments() {
    init_logging();
    assert_eq!(check_distinct_registering_enrollments(sqlite(), 100), TriggerStatus::Ignored);
    assert_eq!(
        check_distinct_registering_enrollments(InMemoryDatastore::new(), 100),
        TriggerStatus::Ignored
    );
    // One below the limit still attributes
    assert_eq!(check_distinct_registering_enrollments(sqlite(), 99), TriggerStatus::Attributed);
    assert_eq!(
        check_distinct_registering_enrollments(InMemoryDatastore::new(), 99),
        TriggerStatus::Attributed
    );
}

/// Two aggregatable triggers with event data against one source; returns
/// (event reports, aggregate reports) stored for the source
fn check_destination_caps<D: DatastoreManager>(store: D, flags: Flags) -> (usize, usize) {
    let mut s = source("s1");
    s.aggregate_source = Some(BTreeMap::from([("campaignCounts".to_string(), 0x159u128)]));
    let triggers: Vec<Trigger> = (0..2)
        .map(|i| {
            let mut t = trigger(&format!("t{}", i), i);
            t.event_triggers = vec![event_trigger(1, 0, Some(i as u64))];
            aggregatable(&mut t, 100);
            t
        })
        .collect();
    seed(&store, &[s], &triggers);

    let engine = engine(store, flags);
    assert!(engine.perform_pending_attributions().unwrap());
    // The capped report type is dropped; the other one still attributes
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Attributed);

    let aggregate = engine
        .datastore()
        .run_in_transaction(|dao| Ok(dao.get_aggregate_reports_for_source("s1")?))
        .unwrap();
    (event_reports(&engine, "s1").len(), aggregate.len())
}

#[test]
fn test_destination_caps_are_independent() {
    init_logging();
    let aggregate_capped = Flags::default().with_max_aggregate_reports_per_destination(1);
    assert_eq!(check_destination_caps(sqlite(), aggregate_capped.clone()), (2, 1));
    assert_eq!(check_destination_caps(InMemoryDatastore::new(), aggregate_capped), (2, 1));

    let event_capped = Flags::default().with_max_event_reports_per_destination(1);
    assert_eq!(check_destination_caps(sqlite(), event_capped.clone()), (1, 2));
    assert_eq!(check_destination_caps(InMemoryDatastore::new(), event_capped), (1, 2));
}

#[test]
fn test_report_window_boundary() {
    init_logging();
    check_report_window_boundary(sqlite());
    check_report_window_boundary(InMemoryDatastore::new());
}

fn check_coarse_destinations<D: DatastoreManager>(store: D) {
    let mut s = source("s1");
    s.coarse_event_report_destinations = true;
    seed(&store, &[s], &[trigger("t1", 0)]);

    let engine = engine(store, Flags::default().with_coarse_event_report_destinations(true));
    assert!(engine.perform_pending_attributions().unwrap());

    let mut destinations = event_reports(&engine, "s1")[0].attribution_destinations.clone();
    destinations.sort();
    assert_eq!(
        destinations,
        vec![
            "android-app://com.advertiser".to_string(),
            "https://advertiser.com".to_string(),
        ]
    );
}

#[test]
fn test_coarse_destinations() {
    init_logging();
    check_coarse_destinations(sqlite());
    check_coarse_destinations(InMemoryDatastore::new());
}

fn check_cross_network_attribution<D: DatastoreManager>(store: D) {
    let mut own = source("own");
    own.priority = 10;

    let mut partner = source("partner");
    partner.enrollment_id = "network-b".to_string();
    partner.priority = 1;
    partner.aggregate_source = Some(BTreeMap::from([
        ("campaignCounts".to_string(), 0x159u128),
        ("privateKey".to_string(), 0x7u128),
    ]));
    partner.shared_aggregation_keys = Some(vec!["campaignCounts".to_string()]);

    let mut t = trigger("t1", 0);
    aggregatable(&mut t, 500);
    let mut config = AttributionConfig::new("network-b");
    config.priority = Some(1_000);
    t.attribution_config = Some(vec![config]);
    seed(&store, &[own, partner], &[t]);

    let engine = engine(store, Flags::default().with_xna(true));
    assert!(engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Attributed);

    let ledger = attributions(&engine, "t1");
    assert_eq!(ledger.len(), 1);
    let derived_id = ledger[0].source_id.clone();
    assert_ne!(derived_id, "partner");

    let (reports, ignored) = engine
        .datastore()
        .run_in_transaction(|dao| {
            Ok((
                dao.get_aggregate_reports_for_source(&derived_id)?,
                dao.is_source_ignored_for_enrollment("partner", "enrollment-a")?,
            ))
        })
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].enrollment_id, "enrollment-a");
    assert_eq!(reports[0].contributions().unwrap()[0].key, 0x559);
    assert!(ignored);

    // Derived sources never write back to their parent
    let partner = stored_source(&engine, "partner");
    assert_eq!(partner.aggregate_contributions, 0);
    assert_eq!(partner.status, SourceStatus::Active);
    // Different enrollment from the winner
    assert_eq!(stored_source(&engine, "own").status, SourceStatus::Active);
    assert!(event_reports(&engine, "own").is_empty());
}

#[test]
fn test_cross_network_attribution() {
    init_logging();
    check_cross_network_attribution(sqlite());
    check_cross_network_attribution(InMemoryDatastore::new());
}

fn check_cross_network_parent_loses_once<D: DatastoreManager>(store: D) {
    let mut own = source("own");
    own.priority = 10;

    let mut partner = source("partner");
    partner.enrollment_id = "network-b".to_string();
    partner.priority = 1;
    partner.aggregate_source = Some(BTreeMap::from([("campaignCounts".to_string(), 0x159u128)]));
    partner.shared_aggregation_keys = Some(vec!["campaignCounts".to_string()]);

    let triggers: Vec<Trigger> = (0..2)
        .map(|i| {
            let mut t = trigger(&format!("t{}", i), i);
            aggregatable(&mut t, 100);
            let mut config = AttributionConfig::new("network-b");
            config.priority = Some(1_000);
            t.attribution_config = Some(vec![config]);
            t
        })
        .collect();
    seed(&store, &[own, partner], &triggers);

    let engine = engine(store, Flags::default().with_xna(true));
    assert!(engine.perform_pending_attributions().unwrap());

    let first = attributions(&engine, "t0");
    assert_eq!(first.len(), 1);
    assert_ne!(first[0].source_id, "own");
    assert_ne!(first[0].source_id, "partner");

    // The parent already won once for enrollment-a, so the next trigger falls back
    let second = attributions(&engine, "t1");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].source_id, "own");
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Attributed);
    assert_eq!(event_reports(&engine, "own").len(), 1);

    let ignored = engine
        .datastore()
        .run_in_transaction(|dao| Ok(dao.is_source_ignored_for_enrollment("partner", "enrollment-a")?))
        .unwrap();
    assert!(ignored);
}

#[test]
fn test_cross_network_parent_loses_once() {
    init_logging();
    check_cross_network_parent_loses_once(sqlite());
    check_cross_network_parent_loses_once(InMemoryDatastore::new());
}

// ============================================================================
// FAILURE INJECTION (in-memory only)
// ============================================================================

#[test]
fn test_dedup_update_failure_rolls_back() {
    init_logging();
    let store = InMemoryDatastore::new();
    let mut t = trigger("t1", 0);
    t.event_triggers = vec![event_trigger(1, 0, Some(2))];
    seed(&store, &[source("s1")], &[t]);
    let seeded = store.counts();
    store.fail_on(DaoCall::UpdateSourceEventReportDedupKeys);

    let engine = engine(store, Flags::default());
    assert!(!engine.perform_pending_attributions().unwrap());

    let counts = engine.datastore().counts();
    assert_eq!(counts.begins - seeded.begins, 2);
    assert_eq!(counts.commits - seeded.commits, 1);
    assert_eq!(counts.rollbacks - seeded.rollbacks, 1);

    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Pending);
    assert!(event_reports(&engine, "s1").is_empty());
    assert!(stored_source(&engine, "s1").event_report_dedup_keys.is_empty());

    // Failure was one-shot: the next pass succeeds
    assert!(engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t1"), TriggerStatus::Attributed);
    assert_eq!(event_reports(&engine, "s1").len(), 1);
}

#[test]
fn test_file_backed_store_survives_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("measurement.db");

    {
        let store = SqliteDatastore::open(&path).unwrap();
        seed(&store, &[source("s1")], &[trigger("t1", 0)]);
        let engine = engine(store, Flags::default());
        assert!(engine.perform_pending_attributions().unwrap());
    }

    let store = SqliteDatastore::open(&path).unwrap();
    let status = store
        .run_in_transaction(|dao| Ok(dao.get_trigger("t1")?))
        .unwrap()
        .status;
    assert_eq!(status, TriggerStatus::Attributed);
    store.close().unwrap();
}

#[test]
fn test_flags_file_drives_engine() {
    use std::io::Write;

    init_logging();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"max_attributions_per_invocation": 1}}"#).unwrap();
    let flags = Flags::from_file(file.path()).unwrap();

    let store = InMemoryDatastore::new();
    seed(&store, &[source("s1")], &[trigger("t1", 0), trigger("t2", 1)]);
    let engine = engine(store, flags);

    assert!(!engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t2"), TriggerStatus::Pending);
    assert!(engine.perform_pending_attributions().unwrap());
    assert_eq!(trigger_status(&engine, "t2"), TriggerStatus::Attributed);
}
