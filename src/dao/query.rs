// 🧱 Query Builder - Typed WHERE clauses with bound parameters
//
// Column and table names are compile-time constants; every runtime value is
// bound as a parameter. The same SitePattern drives SQL LIKE rendering and
// the in-memory store's matching.

use crate::entities::EventSurfaceType;
use crate::web;
use rusqlite::types::Value;

// ============================================================================
// CONDITION TREE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn as_sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Condition {
    Cmp(&'static str, Op, Value),
    In(&'static str, Vec<Value>),
    InSelect {
        column: &'static str,
        negate: bool,
        select: Box<Select>,
    },
    IsNull(&'static str),
    NotNull(&'static str),
    Site(&'static str, SitePattern),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Condition::Cmp(column, Op::Eq, value.into())
    }

    pub fn ne(column: &'static str, value: impl Into<Value>) -> Self {
        Condition::Cmp(column, Op::Ne, value.into())
    }

    pub fn lt(column: &'static str, value: impl Into<Value>) -> Self {
        Condition::Cmp(column, Op::Lt, value.into())
    }

    pub fn le(column: &'static str, value: impl Into<Value>) -> Self {
        Condition::Cmp(column, Op::Le, value.into())
    }

    pub fn gt(column: &'static str, value: impl Into<Value>) -> Self {
        Condition::Cmp(column, Op::Gt, value.into())
    }

    pub fn in_select(column: &'static str, select: Select) -> Self {
        Condition::InSelect {
            column,
            negate: false,
            select: Box::new(select),
        }
    }

    pub fn not_in_select(column: &'static str, select: Select) -> Self {
        Condition::InSelect {
            column,
            negate: true,
            select: Box::new(select),
        }
    }

    pub fn in_values<V: Into<Value>>(column: &'static str, values: impl IntoIterator<Item = V>) -> Self {
        Condition::In(column, values.into_iter().map(Into::into).collect())
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Condition::Cmp(column, op, value) => {
                sql.push_str(&format!("{} {} ?", column, op.as_sql()));
                params.push(value.clone());
            }
            Condition::In(column, values) => {
                if values.is_empty() {
                    // IN () is not valid SQL; an empty set matches nothing
                    sql.push_str("0");
                    return;
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                sql.push_str(&format!("{} IN ({})", column, placeholders));
                params.extend(values.iter().cloned());
            }
            Condition::InSelect { column, negate, select } => {
                let keyword = if *negate { "NOT IN" } else { "IN" };
                sql.push_str(&format!("{} {} (", column, keyword));
                select.render(sql, params);
                sql.push(')');
            }
            Condition::IsNull(column) => sql.push_str(&format!("{} IS NULL", column)),
            Condition::NotNull(column) => sql.push_str(&format!("{} IS NOT NULL", column)),
            Condition::Site(column, pattern) => {
                let mut parts = vec![format!("{} = ?", column)];
                params.push(Value::Text(pattern.base.clone()));
                for like in pattern.like_patterns() {
                    parts.push(format!("{} LIKE ? ESCAPE '\\'", column));
                    params.push(Value::Text(like));
                }
                sql.push('(');
                sql.push_str(&parts.join(" OR "));
                sql.push(')');
            }
            Condition::And(conditions) => render_group(conditions, " AND ", "1", sql, params),
            Condition::Or(conditions) => render_group(conditions, " OR ", "0", sql, params),
        }
    }
}

fn render_group(
    conditions: &[Condition],
    joiner: &str,
    empty: &str,
    sql: &mut String,
    params: &mut Vec<Value>,
) {
    if conditions.is_empty() {
        sql.push_str(empty);
        return;
    }
    sql.push('(');
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            sql.push_str(joiner);
        }
        condition.render(sql, params);
    }
    sql.push(')');
}

// ============================================================================
// SELECT
// ============================================================================

#[derive(Debug, Clone)]
pub struct Select {
    columns: &'static str,
    table: &'static str,
    conditions: Vec<Condition>,
    order_by: Option<&'static str>,
    limit: Option<i64>,
}

impl Select {
    pub fn from(columns: &'static str, table: &'static str) -> Self {
        Select {
            columns,
            table,
            conditions: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(mut self, clause: &'static str) -> Self {
        self.order_by = Some(clause);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        sql.push_str(&format!("SELECT {} FROM {}", self.columns, self.table));
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            for (i, condition) in self.conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" AND ");
                }
                condition.render(sql, params);
            }
        }
        if let Some(order_by) = self.order_by {
            sql.push_str(&format!(" ORDER BY {}", order_by));
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(limit));
        }
    }

    /// SQL text plus parameters in placeholder order
    pub fn build(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(&mut sql, &mut params);
        (sql, params)
    }
}

// ============================================================================
// SITE PATTERN
// ============================================================================

/// Matches a uri against a site, including subdomains (web) and optionally
/// trailing paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitePattern {
    /// scheme://host of the site
    pub base: String,
    scheme: String,
    host: String,
    surface: EventSurfaceType,
    allow_paths: bool,
}

impl SitePattern {
    /// Destination columns: same site or subdomain, any path
    pub fn for_destination(uri: &str, surface: EventSurfaceType) -> Option<Self> {
        Self::build(uri, surface, true)
    }

    /// Publisher columns: exact app, or web site and subdomains without paths
    pub fn for_publisher(uri: &str, surface: EventSurfaceType) -> Option<Self> {
        Self::build(uri, surface, false)
    }

    fn build(uri: &str, surface: EventSurfaceType, allow_paths: bool) -> Option<Self> {
        let base = web::site_for(uri, surface)?;
        let (scheme, host) = base.split_once("://")?;
        Some(SitePattern {
            scheme: scheme.to_string(),
            host: host.to_string(),
            base: base.clone(),
            surface,
            allow_paths,
        })
    }

    fn like_patterns(&self) -> Vec<String> {
        let base = escape_like(&self.base);
        match (self.surface, self.allow_paths) {
            (EventSurfaceType::App, true) => vec![format!("{}/%", base)],
            (EventSurfaceType::App, false) => Vec::new(),
            (EventSurfaceType::Web, allow_paths) => {
                let subdomain = format!("{}://%.{}", escape_like(&self.scheme), escape_like(&self.host));
                let mut patterns = vec![subdomain.clone()];
                if allow_paths {
                    patterns.push(format!("{}/%", base));
                    patterns.push(format!("{}/%", subdomain));
                }
                patterns
            }
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        if candidate == self.base {
            return true;
        }
        match self.surface {
            EventSurfaceType::App => {
                self.allow_paths && candidate.starts_with(&format!("{}/", self.base))
            }
            EventSurfaceType::Web => {
                let Some(rest) = candidate.strip_prefix(&format!("{}://", self.scheme)) else {
                    return false;
                };
                let (host, has_path) = match rest.split_once('/') {
                    Some((host, _)) => (host, true),
                    None => (rest, false),
                };
                if has_path && !self.allow_paths {
                    return false;
                }
                host == self.host || host.ends_with(&format!(".{}", self.host))
            }
        }
    }
}

/// Literal text for a LIKE pattern rendered with `ESCAPE '\'`
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
