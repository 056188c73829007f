// 🔀 Cross-Network Attribution - Derived sources from attribution configs
//
// A trigger may name other ad-tech networks whose sources it is willing to
// borrow. Each config picks eligible parent sources and produces a derived
// copy with the config's overrides applied. Derived sources are only ever
// candidates in memory; they are never persisted.

use crate::entities::{AttributionConfig, Source, Trigger};
use crate::filter;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const ONE_SECOND_MS: i64 = 1000;

/// Turns other networks' sources into attribution candidates for a trigger
pub trait DerivedSourceGenerator {
    fn generate_derived_sources(&self, trigger: &Trigger, parents: &[Source]) -> Vec<Source>;
}

// ============================================================================
// XNA SOURCE CREATOR
// ============================================================================

/// Applies the trigger's attribution configs in order. A parent is consumed
/// by the first config that accepts it.
#[derive(Debug, Clone, Copy, Default)]
pub struct XnaSourceCreator;

impl XnaSourceCreator {
    pub fn new() -> Self {
        XnaSourceCreator
    }

    fn is_eligible(config: &AttributionConfig, parent: &Source, trigger_time: i64) -> bool {
        if parent.enrollment_id != config.source_network {
            return false;
        }

        if let Some(range) = &config.source_priority_range {
            if !range.contains(parent.priority) {
                return false;
            }
        }

        let filter_data = parent.filter_data_with_source_type();
        if !filter::matches_both(
            &filter_data,
            config.source_filters.as_ref(),
            config.source_not_filters.as_ref(),
        ) {
            return false;
        }

        if let Some(override_seconds) = config.source_expiry_override {
            let deadline = parent
                .event_time
                .saturating_add(override_seconds.saturating_mul(ONE_SECOND_MS));
            if deadline <= trigger_time {
                return false;
            }
        }

        true
    }

    fn derive(config: &AttributionConfig, parent: &Source) -> Source {
        let mut derived = parent.clone();
        derived.id = uuid::Uuid::new_v4().to_string();
        derived.parent_id = Some(parent.id.clone());

        if let Some(priority) = config.priority {
            derived.priority = priority;
        }
        if let Some(filter_data) = &config.filter_data {
            derived.filter_data = filter_data.clone();
        }
        if let Some(window) = config.post_install_exclusivity_window {
            derived.install_cooldown_window = window;
        }
        if let Some(expiry_seconds) = config.expiry {
            let expiry = parent
                .event_time
                .saturating_add(expiry_seconds.saturating_mul(ONE_SECOND_MS));
            derived.expiry_time = parent.expiry_time.min(expiry);
        }

        derived.aggregate_source = shared_aggregate_source(parent);
        derived
    }
}

/// Only keys the parent agreed to share survive in the derived source
fn shared_aggregate_source(parent: &Source) -> Option<BTreeMap<String, u128>> {
    let pieces = parent.aggregate_source.as_ref()?;
    let shared = parent.shared_aggregation_keys.as_ref()?;
    let restricted: BTreeMap<String, u128> = pieces
        .iter()
        .filter(|(key, _)| shared.contains(key))
        .map(|(key, piece)| (key.clone(), *piece))
        .collect();
    Some(restricted)
}

impl DerivedSourceGenerator for XnaSourceCreator {
    fn generate_derived_sources(&self, trigger: &Trigger, parents: &[Source]) -> Vec<Source> {
        let Some(configs) = &trigger.attribution_config else {
            return Vec::new();
        };

        let mut consumed: HashSet<&str> = HashSet::new();
        let mut derived = Vec::new();

        for config in configs {
            for parent in parents {
                if consumed.contains(parent.id.as_str()) {
                    continue;
                }
                if !Self::is_eligible(config, parent, trigger.trigger_time) {
                    continue;
                }
                consumed.insert(parent.id.as_str());
                derived.push(Self::derive(config, parent));
            }
        }

        debug!(
            trigger_id = %trigger.id,
            parents = parents.len(),
            derived = derived.len(),
            "Derived cross-network sources"
        );
        derived
    }
}
