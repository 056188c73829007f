// 🔎 Filter Matcher - Trigger filter sets vs. source filter data
// A filter set is OR across maps; a map is AND across keys

use std::collections::{BTreeMap, HashSet};

/// Key -> allowed values
pub type FilterMap = BTreeMap<String, Vec<String>>;

/// Ordered list of filter maps, matched with OR semantics
pub type FilterSet = Vec<FilterMap>;

/// Reserved key holding the source type name
pub const SOURCE_TYPE_KEY: &str = "source_type";

/// Positive filter check. `None` means no constraint.
pub fn matches(source_filter_map: &FilterMap, filter_set: Option<&FilterSet>) -> bool {
    match filter_set {
        Some(set) => is_filter_match(source_filter_map, set, true),
        None => true,
    }
}

/// Negated filter check. `None` means no constraint.
pub fn matches_not(source_filter_map: &FilterMap, not_filter_set: Option<&FilterSet>) -> bool {
    match not_filter_set {
        Some(set) => is_filter_match(source_filter_map, set, false),
        None => true,
    }
}

/// Both a filter set and a not-filter set must pass
pub fn matches_both(
    source_filter_map: &FilterMap,
    filter_set: Option<&FilterSet>,
    not_filter_set: Option<&FilterSet>,
) -> bool {
    matches(source_filter_map, filter_set) && matches_not(source_filter_map, not_filter_set)
}

/// Core predicate.
///
/// * An empty source map or empty set always matches.
/// * Any single map matching is enough.
/// * Within a map, keys missing from the source are skipped.
pub fn is_filter_match(source_filter_map: &FilterMap, filter_set: &FilterSet, is_filter: bool) -> bool {
    if source_filter_map.is_empty() || filter_set.is_empty() {
        return true;
    }

    filter_set
        .iter()
        .any(|trigger_map| map_matches(source_filter_map, trigger_map, is_filter))
}

fn map_matches(source_filter_map: &FilterMap, trigger_map: &FilterMap, is_filter: bool) -> bool {
    trigger_map.iter().all(|(key, trigger_values)| {
        match source_filter_map.get(key) {
            Some(source_values) => match_values(source_values, trigger_values, is_filter),
            None => true,
        }
    })
}

fn match_values(source_values: &[String], trigger_values: &[String], is_filter: bool) -> bool {
    // Empty trigger list tests for presence/absence of source values
    if trigger_values.is_empty() {
        return if is_filter {
            source_values.is_empty()
        } else {
            !source_values.is_empty()
        };
    }

    let source_set: HashSet<&str> = source_values.iter().map(String::as_str).collect();
    let intersects = trigger_values.iter().any(|v| source_set.contains(v.as_str()));

    if is_filter {
        intersects
    } else {
        !intersects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &[&str])]) -> FilterMap {
        entries
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_empty_intersection_fails() {
        let source = map(&[("key_1", &["value_1_x", "value_2_x"])]);
        let trigger = vec![map(&[("key_1", &["value_1"])])];

        assert!(!matches(&source, Some(&trigger)));
    }

    #[test]
    fn test_intersection_matches() {
        let source = map(&[
            ("conversion_subdomain", &["electronics.megastore"]),
            ("product", &["1234", "234"]),
        ]);
        let trigger = vec![map(&[
            ("conversion_subdomain", &["electronics.megastore"]),
            ("product", &["1234", "2345"]),
        ])];

        assert!(matches(&source, Some(&trigger)));
        // Same map as a not-filter fails: values intersect
        assert!(!matches_not(&source, Some(&trigger)));
    }

    #[test]
    fn test_or_across_maps() {
        let source = map(&[("product", &["a"])]);
        let trigger = vec![map(&[("product", &["b"])]), map(&[("product", &["a"])])];

        assert!(matches(&source, Some(&trigger)));
    }

    #[test]
    fn test_and_within_map() {
        let source = map(&[("product", &["a"]), ("geo", &["us"])]);
        let trigger = vec![map(&[("product", &["a"]), ("geo", &["ca"])])];

        assert!(!matches(&source, Some(&trigger)));
    }

    #[test]
    fn test_missing_keys_are_skipped() {
        let source = map(&[("product", &["a"])]);
        let trigger = vec![map(&[("campaign", &["x"])])];

        assert!(matches(&source, Some(&trigger)));
        assert!(matches_not(&source, Some(&trigger)));
    }

    #[test]
    fn test_empty_inputs_always_match() {
        let empty = FilterMap::new();
        let trigger = vec![map(&[("product", &["a"])])];
        assert!(matches(&empty, Some(&trigger)));

        let source = map(&[("product", &["a"])]);
        assert!(matches(&source, Some(&Vec::new())));
        assert!(matches(&source, None));
        assert!(matches_not(&source, None));
    }

    #[test]
    fn test_empty_trigger_values() {
        let source = map(&[("product", &[]), ("geo", &["us"])]);

        // Filter with [] requires the source list to be empty
        assert!(matches(&source, Some(&vec![map(&[("product", &[])])])));
        assert!(!matches(&source, Some(&vec![map(&[("geo", &[])])])));

        // Not-filter with [] requires the source list to be non-empty
        assert!(matches_not(&source, Some(&vec![map(&[("geo", &[])])])));
        assert!(!matches_not(&source, Some(&vec![map(&[("product", &[])])])));
    }

    #[test]
    fn test_matches_both() {
        let source = map(&[("source_type", &["navigation"]), ("product", &["a"])]);
        let filters = vec![map(&[("source_type", &["navigation"])])];
        let not_filters = vec![map(&[("product", &["b"])])];

        assert!(matches_both(&source, Some(&filters), Some(&not_filters)));

        let blocking = vec![map(&[("product", &["a"])])];
        assert!(!matches_both(&source, Some(&filters), Some(&blocking)));
    }
}
