//! SQL statement building and batched execution (spec §4.2, C2).
//!
//! Mirrors the teacher's MySQL/Postgres dual-backend split
//! (`readyset-mysql`/`readyset-psql` sitting on a shared adapter trait) but
//! collapsed to what this toolkit needs: build the handful of statement
//! shapes a writeback worker ever issues, cache them per `(table, kind,
//! columns)`, and execute a batch of them inside one transaction.

use std::sync::Arc;

use citadel_entity::{ColumnValue, EntityDescriptor};
use dashmap::DashMap;
use thiserror::Error;

pub mod executor;

/// Which backend a [`StatementBuilder`] targets. The column placeholder
/// syntax and upsert clause differ; everything else about a statement's
/// shape does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    MySql,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlKind {
    Insert,
    Update,
    Delete,
    Upsert,
    Select,
}

/// Vendor-specific "batch execute completed but didn't report a row count"
/// sentinel (JDBC's `SUCCESS_NO_INFO`, -2). Treated as success per the
/// batch-result classification rule.
pub const SUCCESS_NO_INFO: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Success,
    Failed,
}

/// Classifies one batch's per-row update counts. A row is a success if its
/// count is `> 0` or equals [`SUCCESS_NO_INFO`]; anything else, including a
/// short result array (the driver stopped reporting after a failure), marks
/// the remaining rows failed.
pub fn classify_batch(expected_rows: usize, counts: &[i64]) -> Vec<RowOutcome> {
    let mut out = Vec::with_capacity(expected_rows);
    for i in 0..expected_rows {
        let outcome = match counts.get(i) {
            Some(&n) if n > 0 || n == SUCCESS_NO_INFO => RowOutcome::Success,
            _ => RowOutcome::Failed,
        };
        out.push(outcome);
    }
    out
}

#[derive(Debug, Error)]
pub enum SqlExecError {
    /// Deadlock, lock wait timeout, connection reset: worth retrying.
    #[error("transient sql error: {0}")]
    Transient(String),
    /// Constraint violation, schema mismatch, syntax error: never retried.
    #[error("permanent sql error: {0}")]
    Permanent(String),
}

impl SqlExecError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SqlExecError::Transient(_))
    }
}

/// One statement's placeholder text plus the bind-order column names it was
/// built for, so a caller can line up [`ColumnValue`]s without re-deriving
/// the order from the descriptor.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub sql: Arc<str>,
    pub bind_columns: Vec<&'static str>,
}

type CacheKey = (&'static str, SqlKind, Vec<&'static str>);

/// Memoizes built statement text per `(table, kind, columns)` so the hot
/// writeback path never re-renders SQL for a shape it's already seen, the
/// same "build once, reuse" shape as the teacher's table/statement caches.
#[derive(Default)]
pub struct StatementCache {
    cache: DashMap<CacheKey, Arc<str>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dialect: SqlDialect, descriptor: &EntityDescriptor, kind: SqlKind) -> PreparedStatement {
        self.insert_columns(dialect, descriptor, kind, descriptor.non_key_columns())
    }

    /// Builds (or returns the cached) select-by-primary-key statement: the
    /// row shape `citadel_entity::Entity::hydrate` (spec §4.1) consumes.
    pub fn select(&self, dialect: SqlDialect, descriptor: &EntityDescriptor) -> PreparedStatement {
        self.insert_columns(dialect, descriptor, SqlKind::Select, Vec::new())
    }

    /// Builds (or returns the cached) statement for a partial update over
    /// exactly `changed_columns`. Caller is responsible for passing `&[]`
    /// when nothing changed — a builder never emits a no-op `UPDATE ... SET`.
    pub fn insert_columns(
        &self,
        dialect: SqlDialect,
        descriptor: &EntityDescriptor,
        kind: SqlKind,
        changed_columns: Vec<&'static str>,
    ) -> PreparedStatement {
        let key: CacheKey = (descriptor.table, kind, changed_columns.clone());
        if let Some(sql) = self.cache.get(&key) {
            return PreparedStatement {
                sql: sql.clone(),
                bind_columns: bind_order(descriptor, kind, &changed_columns),
            };
        }
        let bind_columns = bind_order(descriptor, kind, &changed_columns);
        let sql: Arc<str> = build(dialect, descriptor, kind, &changed_columns).into();
        self.cache.insert(key, sql.clone());
        PreparedStatement { sql, bind_columns }
    }
}

/// Column order values must be bound in for a given statement kind.
fn bind_order(descriptor: &EntityDescriptor, kind: SqlKind, changed: &[&'static str]) -> Vec<&'static str> {
    match kind {
        SqlKind::Insert | SqlKind::Upsert => descriptor.column_names(),
        SqlKind::Update => changed
            .iter()
            .copied()
            .chain(descriptor.primary_keys())
            .collect(),
        SqlKind::Delete => descriptor.primary_keys(),
        SqlKind::Select => descriptor.primary_keys(),
    }
}

fn build(dialect: SqlDialect, descriptor: &EntityDescriptor, kind: SqlKind, changed: &[&'static str]) -> String {
    match kind {
        SqlKind::Insert => build_insert(dialect, descriptor),
        SqlKind::Upsert => build_upsert(dialect, descriptor),
        SqlKind::Update => build_update(dialect, descriptor, changed),
        SqlKind::Delete => build_delete(dialect, descriptor),
        SqlKind::Select => build_select(dialect, descriptor),
    }
}

fn placeholder(dialect: SqlDialect, index: usize) -> String {
    match dialect {
        SqlDialect::MySql => "?".to_string(),
        SqlDialect::Postgres => format!("${index}"),
    }
}

fn build_insert(dialect: SqlDialect, descriptor: &EntityDescriptor) -> String {
    let columns = descriptor.column_names();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| placeholder(dialect, i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        descriptor.table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Dialect-native upsert: `ON DUPLICATE KEY UPDATE` for MySQL,
/// `ON CONFLICT (...) DO UPDATE SET` for Postgres.
fn build_upsert(dialect: SqlDialect, descriptor: &EntityDescriptor) -> String {
    let insert = build_insert(dialect, descriptor);
    let non_key = descriptor.non_key_columns();
    if non_key.is_empty() {
        return match dialect {
            SqlDialect::MySql => format!("{insert} ON DUPLICATE KEY UPDATE {}={}", descriptor.primary_keys()[0], descriptor.primary_keys()[0]),
            SqlDialect::Postgres => format!(
                "{insert} ON CONFLICT ({}) DO NOTHING",
                descriptor.primary_keys().join(", ")
            ),
        };
    }
    match dialect {
        SqlDialect::MySql => {
            let assignments: Vec<String> = non_key.iter().map(|c| format!("{c}=VALUES({c})")).collect();
            format!("{insert} ON DUPLICATE KEY UPDATE {}", assignments.join(", "))
        }
        SqlDialect::Postgres => {
            let assignments: Vec<String> = non_key.iter().map(|c| format!("{c}=EXCLUDED.{c}")).collect();
            format!(
                "{insert} ON CONFLICT ({}) DO UPDATE SET {}",
                descriptor.primary_keys().join(", "),
                assignments.join(", ")
            )
        }
    }
}

/// `UPDATE ... SET <only changed fields> WHERE <primary key>`. Panics if
/// `changed` is empty — callers must not schedule a no-op update.
fn build_update(dialect: SqlDialect, descriptor: &EntityDescriptor, changed: &[&'static str]) -> String {
    assert!(!changed.is_empty(), "update statement requested with no changed columns");
    let mut idx = 0usize;
    let set_clause: Vec<String> = changed
        .iter()
        .map(|c| {
            idx += 1;
            format!("{c}={}", placeholder(dialect, idx))
        })
        .collect();
    let where_clause: Vec<String> = descriptor
        .primary_keys()
        .iter()
        .map(|c| {
            idx += 1;
            format!("{c}={}", placeholder(dialect, idx))
        })
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        descriptor.table,
        set_clause.join(", "),
        where_clause.join(" AND ")
    )
}

fn build_delete(dialect: SqlDialect, descriptor: &EntityDescriptor) -> String {
    let where_clause: Vec<String> = descriptor
        .primary_keys()
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c}={}", placeholder(dialect, i + 1)))
        .collect();
    format!("DELETE FROM {} WHERE {}", descriptor.table, where_clause.join(" AND "))
}

/// Select-by-primary-key: the one SELECT shape this toolkit ever issues
/// itself (spec §2) — the row it returns is what `Entity::hydrate` applies.
fn build_select(dialect: SqlDialect, descriptor: &EntityDescriptor) -> String {
    let where_clause: Vec<String> = descriptor
        .primary_keys()
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c}={}", placeholder(dialect, i + 1)))
        .collect();
    format!(
        "SELECT {} FROM {} WHERE {}",
        descriptor.column_names().join(", "),
        descriptor.table,
        where_clause.join(" AND ")
    )
}

/// Batch delete over many rows sharing the same primary-key shape: a single
/// `IN (...)` for a one-column key, or an `OR`-chain of per-row conjunctions
/// for a composite key (spec §4.2's batch-delete note).
pub fn build_batch_delete(dialect: SqlDialect, descriptor: &EntityDescriptor, row_count: usize) -> String {
    let pk = descriptor.primary_keys();
    assert!(row_count > 0, "batch delete requested with zero rows");
    if pk.len() == 1 {
        let placeholders: Vec<String> = (1..=row_count).map(|i| placeholder(dialect, i)).collect();
        return format!(
            "DELETE FROM {} WHERE {} IN ({})",
            descriptor.table,
            pk[0],
            placeholders.join(", ")
        );
    }
    let mut idx = 0usize;
    let disjuncts: Vec<String> = (0..row_count)
        .map(|_| {
            let conj: Vec<String> = pk
                .iter()
                .map(|c| {
                    idx += 1;
                    format!("{c}={}", placeholder(dialect, idx))
                })
                .collect();
            format!("({})", conj.join(" AND "))
        })
        .collect();
    format!("DELETE FROM {} WHERE {}", descriptor.table, disjuncts.join(" OR "))
}

/// Flattens the per-row column values a batch delete binds, in the same row
/// order `build_batch_delete` assumed.
pub fn flatten_batch_delete_binds(rows: &[Vec<ColumnValue>]) -> Vec<ColumnValue> {
    rows.iter().flat_map(|row| row.iter().cloned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor {
            table: "players",
            columns: vec![
                citadel_entity::ColumnDef { name: "id", nullable: false, autoincrement: false },
                citadel_entity::ColumnDef { name: "level", nullable: false, autoincrement: false },
                citadel_entity::ColumnDef { name: "name", nullable: false, autoincrement: false },
            ],
            primary_key: vec![0],
        }
    }

    #[test]
    fn insert_uses_dialect_placeholders() {
        let d = descriptor();
        assert_eq!(
            build_insert(SqlDialect::Postgres, &d),
            "INSERT INTO players (id, level, name) VALUES ($1, $2, $3)"
        );
        assert_eq!(
            build_insert(SqlDialect::MySql, &d),
            "INSERT INTO players (id, level, name) VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn upsert_is_dialect_native() {
        let d = descriptor();
        assert!(build_upsert(SqlDialect::MySql, &d).contains("ON DUPLICATE KEY UPDATE"));
        assert!(build_upsert(SqlDialect::Postgres, &d).contains("ON CONFLICT (id) DO UPDATE SET"));
    }

    #[test]
    fn update_only_touches_changed_columns() {
        let d = descriptor();
        let sql = build_update(SqlDialect::Postgres, &d, &["level"]);
        assert_eq!(sql, "UPDATE players SET level=$1 WHERE id=$2");
    }

    #[test]
    fn select_is_by_primary_key() {
        let d = descriptor();
        let sql = build_select(SqlDialect::Postgres, &d);
        assert_eq!(sql, "SELECT id, level, name FROM players WHERE id=$1");
    }

    #[test]
    fn statement_cache_builds_a_select() {
        let d = descriptor();
        let cache = StatementCache::new();
        let stmt = cache.select(SqlDialect::MySql, &d);
        assert_eq!(&*stmt.sql, "SELECT id, level, name FROM players WHERE id=?");
        assert_eq!(stmt.bind_columns, vec!["id"]);
    }

    #[test]
    fn batch_delete_uses_in_clause_for_single_column_pk() {
        let d = descriptor();
        let sql = build_batch_delete(SqlDialect::MySql, &d, 3);
        assert_eq!(sql, "DELETE FROM players WHERE id IN (?, ?, ?)");
    }

    #[test]
    fn statement_cache_reuses_built_sql() {
        let d = descriptor();
        let cache = StatementCache::new();
        let a = cache.insert_columns(SqlDialect::Postgres, &d, SqlKind::Update, vec!["level"]);
        let b = cache.insert_columns(SqlDialect::Postgres, &d, SqlKind::Update, vec!["level"]);
        assert!(Arc::ptr_eq(&a.sql, &b.sql));
    }

    #[test]
    fn classify_batch_treats_success_no_info_as_success() {
        let outcomes = classify_batch(3, &[1, SUCCESS_NO_INFO, 0]);
        assert_eq!(outcomes, vec![RowOutcome::Success, RowOutcome::Success, RowOutcome::Failed]);
    }

    #[test]
    fn classify_batch_marks_trailing_rows_failed_on_short_result() {
        let outcomes = classify_batch(3, &[1]);
        assert_eq!(outcomes, vec![RowOutcome::Success, RowOutcome::Failed, RowOutcome::Failed]);
    }
}
