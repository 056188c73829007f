// 🗃️ SQLite DAO - MeasurementDao over an open SqliteTransaction

use super::query::{Condition, Select, SitePattern};
use super::{expect_rows, MeasurementDao};
use crate::datastore::SqliteTransaction;
use crate::db::{
    AGGREGATE_REPORT_TABLE, ATTRIBUTION_TABLE, EVENT_REPORT_TABLE, SOURCE_DESTINATION_TABLE,
    SOURCE_TABLE, TRIGGER_TABLE, XNA_IGNORED_SOURCES_TABLE,
};
use crate::entities::attribution::ATTRIBUTION_COLUMNS;
use crate::entities::report::{AGGREGATE_REPORT_COLUMNS, EVENT_REPORT_COLUMNS};
use crate::entities::source::SOURCE_COLUMNS;
use crate::entities::trigger::TRIGGER_COLUMNS;
use crate::entities::{
    to_json_column, u64_to_sql, AggregateReport, Attribution, EventReport, EventSurfaceType,
    Source, SourceStatus, Trigger, TriggerStatus,
};
use crate::error::{DatastoreError, Result};
use crate::flags::{MAX_DELAYED_SOURCE_REGISTRATION_WINDOW, RATE_LIMIT_WINDOW_MILLISECONDS};
use crate::web;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

pub struct SqliteMeasurementDao<'a> {
    tx: &'a SqliteTransaction<'a>,
}

impl<'a> SqliteMeasurementDao<'a> {
    pub fn new(tx: &'a SqliteTransaction<'a>) -> Self {
        SqliteMeasurementDao { tx }
    }

    fn conn(&self) -> Result<&'a Connection> {
        self.tx.connection()
    }

    // ========================================================================
    // QUERY HELPERS
    // ========================================================================

    fn query_all<T>(&self, select: &Select, map: fn(&Row) -> rusqlite::Result<T>) -> Result<Vec<T>> {
        let conn = self.conn()?;
        let (sql, values) = select.build();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), map)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn query_count(&self, select: &Select) -> Result<i64> {
        let conn = self.conn()?;
        let (sql, values) = select.build();
        let count: Option<i64> =
            conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count.unwrap_or(0))
    }

    /// Sources with their destination rows attached
    fn query_sources(&self, select: &Select) -> Result<Vec<Source>> {
        let mut sources = self.query_all(select, Source::from_row)?;
        for source in &mut sources {
            let (app, web) = self.get_source_destinations(&source.id)?;
            source.app_destinations = app;
            source.web_destinations = web;
        }
        Ok(sources)
    }

    /// Sources whose destination rows contain the trigger's destination
    fn sources_by_destination(&self, trigger: &Trigger) -> Option<Select> {
        let Some(destination) = trigger.destination_value() else {
            debug!(
                destination = %trigger.attribution_destination,
                "Unable to obtain destination value"
            );
            return None;
        };

        let destination_rows = Select::from("source_id", SOURCE_DESTINATION_TABLE)
            .filter(Condition::eq("destination", destination))
            .filter(Condition::eq("destination_type", trigger.destination_type.as_i64()));

        Some(Select::from(SOURCE_COLUMNS, SOURCE_TABLE).filter(Condition::in_select("id", destination_rows)))
    }

    fn update_by_id(&self, entity: &'static str, sql: &str, values: Vec<Value>) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(sql, params_from_iter(values.iter()))?;
        expect_rows(entity, 1, updated)
    }
}

fn u64_list_json(keys: &[u64]) -> Result<String> {
    Ok(serde_json::to_string(keys)?)
}

impl MeasurementDao for SqliteMeasurementDao<'_> {
    // ========================================================================
    // TRIGGERS
    // ========================================================================

    fn insert_trigger(&mut self, trigger: &Trigger) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                TRIGGER_TABLE, TRIGGER_COLUMNS
            ),
            params![
                trigger.id,
                trigger.attribution_destination,
                trigger.destination_type.as_i64(),
                trigger.trigger_time,
                trigger.status.as_i64(),
                trigger.enrollment_id,
                trigger.registrant,
                trigger.registration_origin,
                serde_json::to_string(&trigger.event_triggers)?,
                to_json_column(&trigger.filters)?,
                to_json_column(&trigger.not_filters)?,
                serde_json::to_string(&trigger.aggregate_trigger_data)?,
                to_json_column(&trigger.aggregate_values)?,
                serde_json::to_string(&trigger.aggregate_deduplication_keys)?,
                to_json_column(&trigger.attribution_config)?,
            ],
        )?;
        Ok(())
    }

    fn get_pending_trigger_ids(&self) -> Result<Vec<String>> {
        let select = Select::from("id", TRIGGER_TABLE)
            .filter(Condition::eq("status", TriggerStatus::Pending.as_i64()))
            .order_by("trigger_time ASC");
        self.query_all(&select, |row| row.get(0))
    }

    fn get_trigger(&self, trigger_id: &str) -> Result<Trigger> {
        let select = Select::from(TRIGGER_COLUMNS, TRIGGER_TABLE)
            .filter(Condition::eq("id", trigger_id.to_string()));
        self.query_all(&select, Trigger::from_row)?
            .into_iter()
            .next()
            .ok_or_else(|| DatastoreError::NotFound(format!("trigger {}", trigger_id)))
    }

    fn update_trigger_status(&mut self, trigger_ids: &[String], status: TriggerStatus) -> Result<()> {
        if trigger_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; trigger_ids.len()].join(", ");
        let sql = format!("UPDATE {} SET status = ? WHERE id IN ({})", TRIGGER_TABLE, placeholders);

        let mut values = vec![Value::Integer(status.as_i64())];
        values.extend(trigger_ids.iter().cloned().map(Value::Text));

        let updated = conn.execute(&sql, params_from_iter(values.iter()))?;
        expect_rows("Trigger status", trigger_ids.len(), updated)
    }

    // ========================================================================
    // SOURCES
    // ========================================================================

    fn insert_source(&mut self, source: &Source) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
                 ?, ?, ?, ?, ?, ?, ?, ?)",
                SOURCE_TABLE, SOURCE_COLUMNS
            ),
            params![
                source.id,
                u64_to_sql(source.event_id),
                source.publisher,
                source.publisher_type.as_i64(),
                source.enrollment_id,
                source.registrant,
                source.event_time,
                source.expiry_time,
                source.event_report_window,
                source.aggregatable_report_window,
                source.priority,
                source.status.as_i64(),
                source.source_type.as_i64(),
                source.attribution_mode.as_i64(),
                source.install_attribution_window,
                source.install_cooldown_window,
                source.is_install_attributed,
                serde_json::to_string(&source.filter_data)?,
                source.aggregate_source_json()?,
                u64_list_json(&source.event_report_dedup_keys)?,
                u64_list_json(&source.aggregate_report_dedup_keys)?,
                source.aggregate_contributions,
                source.registration_origin,
                source.registration_id,
                to_json_column(&source.shared_aggregation_keys)?,
                source.coarse_event_report_destinations,
            ],
        )?;

        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {} (source_id, destination, destination_type) VALUES (?, ?, ?)",
            SOURCE_DESTINATION_TABLE
        ))?;
        for (surface, destinations) in [
            (EventSurfaceType::App, &source.app_destinations),
            (EventSurfaceType::Web, &source.web_destinations),
        ] {
            for destination in destinations {
                stmt.execute(params![source.id, destination, surface.as_i64()])?;
            }
        }
        Ok(())
    }

    fn get_source(&self, source_id: &str) -> Result<Source> {
        let select = Select::from(SOURCE_COLUMNS, SOURCE_TABLE)
            .filter(Condition::eq("id", source_id.to_string()));
        self.query_sources(&select)?
            .into_iter()
            .next()
            .ok_or_else(|| DatastoreError::NotFound(format!("source {}", source_id)))
    }

    fn get_source_destinations(&self, source_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let select = Select::from("destination, destination_type", SOURCE_DESTINATION_TABLE)
            .filter(Condition::eq("source_id", source_id.to_string()))
            .order_by("destination ASC");
        let rows = self.query_all(&select, |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut app = Vec::new();
        let mut web = Vec::new();
        for (destination, kind) in rows {
            match EventSurfaceType::from_i64(kind) {
                Some(EventSurfaceType::App) => app.push(destination),
                Some(EventSurfaceType::Web) => web.push(destination),
                None => {
                    return Err(DatastoreError::Serialization(format!(
                        "unknown destination type {} for source {}",
                        kind, source_id
                    )))
                }
            }
        }
        Ok((app, web))
    }

    fn get_matching_active_sources(&self, trigger: &Trigger) -> Result<Vec<Source>> {
        let Some(select) = self.sources_by_destination(trigger) else {
            return Ok(Vec::new());
        };
        let select = select
            .filter(Condition::eq("registration_origin", trigger.registration_origin.clone()))
            .filter(Condition::le("event_time", trigger.trigger_time))
            .filter(Condition::gt("expiry_time", trigger.trigger_time))
            .filter(Condition::eq("status", SourceStatus::Active.as_i64()));
        self.query_sources(&select)
    }

    fn get_nearest_delayed_matching_active_source(&self, trigger: &Trigger) -> Result<Option<Source>> {
        let Some(select) = self.sources_by_destination(trigger) else {
            return Ok(None);
        };
        let select = select
            .filter(Condition::eq("registration_origin", trigger.registration_origin.clone()))
            .filter(Condition::gt("event_time", trigger.trigger_time))
            .filter(Condition::le(
                "event_time",
                trigger.trigger_time + MAX_DELAYED_SOURCE_REGISTRATION_WINDOW,
            ))
            .filter(Condition::gt("expiry_time", trigger.trigger_time))
            .filter(Condition::eq("status", SourceStatus::Active.as_i64()))
            .order_by("event_time ASC")
            .limit(1);
        Ok(self.query_sources(&select)?.into_iter().next())
    }

    fn fetch_trigger_matching_sources_for_xna(
        &self,
        trigger: &Trigger,
        xna_enrollment_ids: &[String],
    ) -> Result<Vec<Source>> {
        let Some(select) = self.sources_by_destination(trigger) else {
            return Ok(Vec::new());
        };

        // Lose once, lose always: parents that already lost for the trigger's network
        let ignored = Select::from("source_id", XNA_IGNORED_SOURCES_TABLE)
            .filter(Condition::eq("enrollment_id", trigger.enrollment_id.clone()));
        // Registration chains that already include the trigger's own network
        let own_registrations = Select::from("registration_id", SOURCE_TABLE)
            .filter(Condition::eq("enrollment_id", trigger.enrollment_id.clone()))
            .filter(Condition::NotNull("registration_id"));

        let select = select
            .filter(Condition::gt("expiry_time", trigger.trigger_time))
            .filter(Condition::le("event_time", trigger.trigger_time))
            .filter(Condition::eq("status", SourceStatus::Active.as_i64()))
            .filter(Condition::Or(vec![
                Condition::eq("enrollment_id", trigger.enrollment_id.clone()),
                Condition::And(vec![
                    Condition::in_values("enrollment_id", xna_enrollment_ids.to_vec()),
                    Condition::not_in_select("id", ignored),
                    Condition::Or(vec![
                        Condition::IsNull("registration_id"),
                        Condition::not_in_select("registration_id", own_registrations),
                    ]),
                    Condition::NotNull("shared_aggregation_keys"),
                ]),
            ]));
        self.query_sources(&select)
    }

    fn update_source_status(&mut self, source_ids: &[String], status: SourceStatus) -> Result<()> {
        if source_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; source_ids.len()].join(", ");
        let sql = format!("UPDATE {} SET status = ? WHERE id IN ({})", SOURCE_TABLE, placeholders);

        let mut values = vec![Value::Integer(status.as_i64())];
        values.extend(source_ids.iter().cloned().map(Value::Text));

        let updated = conn.execute(&sql, params_from_iter(values.iter()))?;
        expect_rows("Source status", source_ids.len(), updated)
    }

    fn update_source_event_report_dedup_keys(&mut self, source: &Source) -> Result<()> {
        self.update_by_id(
            "Source event report dedup key",
            &format!("UPDATE {} SET event_report_dedup_keys = ? WHERE id = ?", SOURCE_TABLE),
            vec![
                Value::Text(u64_list_json(&source.event_report_dedup_keys)?),
                Value::Text(source.id.clone()),
            ],
        )
    }

    fn update_source_aggregate_report_dedup_keys(&mut self, source: &Source) -> Result<()> {
        self.update_by_id(
            "Source aggregate report dedup key",
            &format!("UPDATE {} SET aggregate_report_dedup_keys = ? WHERE id = ?", SOURCE_TABLE),
            vec![
                Value::Text(u64_list_json(&source.aggregate_report_dedup_keys)?),
                Value::Text(source.id.clone()),
            ],
        )
    }

    fn update_source_aggregate_contributions(&mut self, source: &Source) -> Result<()> {
        self.update_by_id(
            "Source aggregate contributions",
            &format!("UPDATE {} SET aggregate_contributions = ? WHERE id = ?", SOURCE_TABLE),
            vec![
                Value::Integer(source.aggregate_contributions),
                Value::Text(source.id.clone()),
            ],
        )
    }

    fn insert_ignored_source_for_enrollment(&mut self, source_id: &str, enrollment_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (source_id, enrollment_id) VALUES (?, ?)",
                XNA_IGNORED_SOURCES_TABLE
            ),
            params![source_id, enrollment_id],
        )?;
        Ok(())
    }

    fn is_source_ignored_for_enrollment(&self, source_id: &str, enrollment_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE source_id = ? AND enrollment_id = ?",
                    XNA_IGNORED_SOURCES_TABLE
                ),
                params![source_id, enrollment_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ========================================================================
    // RATE LIMITS
    // ========================================================================

    fn get_attributions_per_rate_limit_window(&self, source: &Source, trigger: &Trigger) -> Result<i64> {
        let source_site = web::site_for(&source.publisher, source.publisher_type);
        let destination_site = web::site_for(&trigger.attribution_destination, trigger.destination_type);
        let (Some(source_site), Some(destination_site)) = (source_site, destination_site) else {
            return Err(DatastoreError::Serialization(format!(
                "cannot derive sites from publisher {} and destination {}",
                source.publisher, trigger.attribution_destination
            )));
        };

        let select = Select::from("COUNT(*)", ATTRIBUTION_TABLE)
            .filter(Condition::eq("source_site", source_site))
            .filter(Condition::eq("destination_site", destination_site))
            .filter(Condition::eq("enrollment_id", trigger.enrollment_id.clone()))
            .filter(Condition::gt(
                "trigger_time",
                trigger.trigger_time - RATE_LIMIT_WINDOW_MILLISECONDS,
            ))
            .filter(Condition::le("trigger_time", trigger.trigger_time));
        self.query_count(&select)
    }

    fn count_distinct_enrollments_per_publisher_x_destination_in_attribution(
        &self,
        source_site: &str,
        destination_site: &str,
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        let select = Select::from("COUNT(DISTINCT enrollment_id)", ATTRIBUTION_TABLE)
            .filter(Condition::eq("source_site", source_site.to_string()))
            .filter(Condition::eq("destination_site", destination_site.to_string()))
            .filter(Condition::ne("enrollment_id", excluded_enrollment_id.to_string()))
            .filter(Condition::gt("trigger_time", window_start))
            .filter(Condition::le("trigger_time", window_end));
        self.query_count(&select)
    }

    fn count_distinct_enrollments_per_publisher_x_destination_in_source(
        &self,
        publisher: &str,
        publisher_type: EventSurfaceType,
        destinations: &[String],
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        let Some(publisher_pattern) = SitePattern::for_publisher(publisher, publisher_type) else {
            return Ok(0);
        };

        let mut max = 0;
        for destination in destinations {
            let destination_rows = Select::from("source_id", SOURCE_DESTINATION_TABLE)
                .filter(Condition::eq("destination", destination.clone()));
            let select = Select::from("COUNT(DISTINCT enrollment_id)", SOURCE_TABLE)
                .filter(Condition::Site("publisher", publisher_pattern.clone()))
                .filter(Condition::ne("enrollment_id", excluded_enrollment_id.to_string()))
                .filter(Condition::gt("event_time", window_start))
                .filter(Condition::le("event_time", window_end))
                .filter(Condition::gt("expiry_time", window_end))
                .filter(Condition::in_select("id", destination_rows));
            max = max.max(self.query_count(&select)?);
        }
        Ok(max)
    }

    fn get_num_event_reports_per_destination(
        &self,
        attribution_destination: &str,
        destination_type: EventSurfaceType,
    ) -> Result<i64> {
        let Some(pattern) = SitePattern::for_destination(attribution_destination, destination_type) else {
            return Ok(0);
        };
        let select = Select::from("COUNT(*)", EVENT_REPORT_TABLE)
            .filter(Condition::Site("attribution_destination", pattern));
        self.query_count(&select)
    }

    fn get_num_aggregate_reports_per_destination(
        &self,
        attribution_destination: &str,
        destination_type: EventSurfaceType,
    ) -> Result<i64> {
        let Some(pattern) = SitePattern::for_destination(attribution_destination, destination_type) else {
            return Ok(0);
        };
        let select = Select::from("COUNT(*)", AGGREGATE_REPORT_TABLE)
            .filter(Condition::Site("attribution_destination", pattern));
        self.query_count(&select)
    }

    // ========================================================================
    // REPORTS & LEDGER
    // ========================================================================

    fn get_source_event_reports(&self, source: &Source) -> Result<Vec<EventReport>> {
        let select = Select::from(EVENT_REPORT_COLUMNS, EVENT_REPORT_TABLE)
            .filter(Condition::eq("source_id", source.id.clone()))
            .order_by("report_time ASC, trigger_time ASC");
        self.query_all(&select, EventReport::from_row)
    }

    fn get_event_report(&self, report_id: &str) -> Result<EventReport> {
        let select = Select::from(EVENT_REPORT_COLUMNS, EVENT_REPORT_TABLE)
            .filter(Condition::eq("id", report_id.to_string()));
        self.query_all(&select, EventReport::from_row)?
            .into_iter()
            .next()
            .ok_or_else(|| DatastoreError::NotFound(format!("event report {}", report_id)))
    }

    fn insert_event_report(&mut self, report: &EventReport) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                EVENT_REPORT_TABLE, EVENT_REPORT_COLUMNS
            ),
            params![
                report.id,
                u64_to_sql(report.source_event_id),
                report.enrollment_id,
                report.attribution_destination,
                serde_json::to_string(&report.attribution_destinations)?,
                report.trigger_time,
                u64_to_sql(report.trigger_data),
                report.trigger_priority,
                report.trigger_dedup_key.map(u64_to_sql),
                report.report_time,
                report.status.as_i64(),
                report.debug_report_status.as_i64(),
                report.source_type.as_i64(),
                report.randomized_trigger_rate,
                report.source_id,
                report.trigger_id,
                report.registration_origin,
            ],
        )?;
        Ok(())
    }

    fn delete_event_report(&mut self, report: &EventReport) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?", EVENT_REPORT_TABLE),
            params![report.id],
        )?;
        expect_rows("Event report deletion", 1, deleted)
    }

    fn get_aggregate_report(&self, report_id: &str) -> Result<AggregateReport> {
        let select = Select::from(AGGREGATE_REPORT_COLUMNS, AGGREGATE_REPORT_TABLE)
            .filter(Condition::eq("id", report_id.to_string()));
        self.query_all(&select, AggregateReport::from_row)?
            .into_iter()
            .next()
            .ok_or_else(|| DatastoreError::NotFound(format!("aggregate report {}", report_id)))
    }

    fn get_aggregate_reports_for_source(&self, source_id: &str) -> Result<Vec<AggregateReport>> {
        let select = Select::from(AGGREGATE_REPORT_COLUMNS, AGGREGATE_REPORT_TABLE)
            .filter(Condition::eq("source_id", source_id.to_string()))
            .order_by("scheduled_report_time ASC");
        self.query_all(&select, AggregateReport::from_row)
    }

    fn insert_aggregate_report(&mut self, report: &AggregateReport) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                AGGREGATE_REPORT_TABLE, AGGREGATE_REPORT_COLUMNS
            ),
            params![
                report.id,
                report.publisher,
                report.attribution_destination,
                report.source_registration_time,
                report.scheduled_report_time,
                report.enrollment_id,
                report.debug_cleartext_payload,
                report.status.as_i64(),
                report.api_version,
                report.source_id,
                report.trigger_id,
                report.registration_origin,
                report.dedup_key.map(u64_to_sql),
            ],
        )?;
        Ok(())
    }

    fn insert_attribution(&mut self, attribution: &Attribution) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                ATTRIBUTION_TABLE, ATTRIBUTION_COLUMNS
            ),
            params![
                attribution.id,
                attribution.source_site,
                attribution.source_origin,
                attribution.destination_site,
                attribution.destination_origin,
                attribution.enrollment_id,
                attribution.trigger_time,
                attribution.registrant,
                attribution.source_id,
                attribution.trigger_id,
            ],
        )?;
        Ok(())
    }

    fn get_attributions_for_trigger(&self, trigger_id: &str) -> Result<Vec<Attribution>> {
        let select = Select::from(ATTRIBUTION_COLUMNS, ATTRIBUTION_TABLE)
            .filter(Condition::eq("trigger_id", trigger_id.to_string()));
        self.query_all(&select, Attribution::from_row)
    }
}
