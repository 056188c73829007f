// 📒 Attribution - Rate-limit ledger row, one per successful attribution

use super::{Source, Trigger};
use crate::web;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub id: String,
    pub source_site: String,
    pub source_origin: String,
    pub destination_site: String,
    pub destination_origin: String,
    pub enrollment_id: String,
    /// Holds the source event time; windows are counted against it
    pub trigger_time: i64,
    pub registrant: String,
    pub source_id: String,
    pub trigger_id: String,
}

pub const ATTRIBUTION_COLUMNS: &str = "id, source_site, source_origin, destination_site, \
     destination_origin, enrollment_id, trigger_time, registrant, source_id, trigger_id";

impl Attribution {
    /// Ledger row for `source` winning `trigger`. `None` when either side has
    /// no resolvable site.
    pub fn from_source_and_trigger(source: &Source, trigger: &Trigger) -> Option<Attribution> {
        let source_site = web::site_for(&source.publisher, source.publisher_type)?;
        let destination_site =
            web::site_for(&trigger.attribution_destination, trigger.destination_type)?;
        let destination_origin = web::base_uri(&trigger.attribution_destination)?;

        Some(Attribution {
            id: uuid::Uuid::new_v4().to_string(),
            source_site,
            source_origin: source.publisher.clone(),
            destination_site,
            destination_origin,
            enrollment_id: trigger.enrollment_id.clone(),
            trigger_time: source.event_time,
            registrant: trigger.registrant.clone(),
            source_id: source.id.clone(),
            trigger_id: trigger.id.clone(),
        })
    }

    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Attribution> {
        Ok(Attribution {
            id: row.get("id")?,
            source_site: row.get("source_site")?,
            source_origin: row.get("source_origin")?,
            destination_site: row.get("destination_site")?,
            destination_origin: row.get("destination_origin")?,
            enrollment_id: row.get("enrollment_id")?,
            trigger_time: row.get("trigger_time")?,
            registrant: row.get("registrant")?,
            source_id: row.get("source_id")?,
            trigger_id: row.get("trigger_id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{source_fixture, trigger_fixture};

    #[test]
    fn test_ledger_row_uses_sites_and_source_time() {
        let mut source = source_fixture("s1");
        source.publisher = "https://news.publisher.com/article".to_string();
        source.event_time = 42;
        let mut trigger = trigger_fixture("t1");
        trigger.attribution_destination = "https://shop.advertiser.com/checkout".to_string();

        let attribution = Attribution::from_source_and_trigger(&source, &trigger).unwrap();
        assert_eq!(attribution.source_site, "https://publisher.com");
        assert_eq!(attribution.destination_site, "https://advertiser.com");
        assert_eq!(attribution.destination_origin, "https://shop.advertiser.com");
        assert_eq!(attribution.trigger_time, 42);
        assert_eq!(attribution.enrollment_id, trigger.enrollment_id);
    }
}
