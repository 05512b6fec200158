//! Key/value and document storage for extensions
//!
//! Every extension gets a namespaced slice of one SQLite database:
//! a flat key/value table plus one physical table per declared document
//! collection (which is what makes per-collection indexing possible).
//! Rows are scoped to the extension and, optionally, to a user. All
//! writes are single-row upserts/deletes; no multi-row transactions are
//! required by the design.

pub mod query;

use chrono::Utc;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::panic::RefUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{HostError, HostResult};
use crate::permissions::is_valid_identifier;
use crate::protocol::DocumentInput;
use query::ParsedQuery;

/// Scope marker for rows that belong to the extension itself rather than
/// to a user. A fixed sentinel keeps the primary key reliable where a
/// nullable column would not be.
pub const EXTENSION_SCOPE: &str = "__extension__";

/// A stored document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
    pub created_at: String,
    pub updated_at: String,
}

/// SQLite-backed storage engine shared by every loaded extension.
pub struct StorageEngine {
    conn: Arc<Mutex<Connection>>,
}

impl StorageEngine {
    /// Open or create the storage database.
    pub fn open(db_path: &Path) -> HostResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HostError::InvalidInput(format!("cannot create data dir: {e}")))?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory engine for tests.
    pub fn in_memory() -> HostResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> HostResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                extension_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (extension_id, user_id, key)
            )",
            [],
        )?;

        // Catalog of declared collections. Table names are derived from
        // ids, so they cannot be parsed back unambiguously; this is the
        // authoritative (extension, collection) mapping.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS doc_collections (
                extension_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                PRIMARY KEY (extension_id, collection)
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // Key/value storage
    // =========================================================================

    pub fn kv_get(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> HostResult<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT value FROM kv_entries WHERE extension_id = ?1 AND user_id = ?2 AND key = ?3",
        )?;
        let mut rows = stmt.query(params![extension_id, scope(user_id), key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub fn kv_set(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
        value: &Value,
    ) -> HostResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv_entries (extension_id, user_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (extension_id, user_id, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                extension_id,
                scope(user_id),
                key,
                serde_json::to_string(value)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row existed.
    pub fn kv_delete(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> HostResult<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM kv_entries WHERE extension_id = ?1 AND user_id = ?2 AND key = ?3",
            params![extension_id, scope(user_id), key],
        )?;
        Ok(affected > 0)
    }

    pub fn kv_keys(&self, extension_id: &str, user_id: Option<&str>) -> HostResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key FROM kv_entries WHERE extension_id = ?1 AND user_id = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![extension_id, scope(user_id)], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    // =========================================================================
    // Document collections
    // =========================================================================

    /// Create the physical table for a declared collection plus one
    /// expression index per declared field path. Idempotent; called when
    /// an extension is loaded.
    pub fn ensure_collection(
        &self,
        extension_id: &str,
        collection: &str,
        indexes: &[String],
    ) -> HostResult<()> {
        let table = table_name(extension_id, collection)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    user_id TEXT NOT NULL,
                    id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, id)
                )"
            ),
            [],
        )?;

        for field in indexes {
            crate::permissions::validate_field_path(field)
                .map_err(|e| HostError::InvalidInput(e.to_string()))?;
            let index_name = format!("idx_{table}_{}", field.replace('.', "_"));
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {index_name}
                     ON {table} (json_extract(data, '$.{field}'))"
                ),
                [],
            )?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO doc_collections (extension_id, collection) VALUES (?1, ?2)",
            params![extension_id, collection],
        )?;
        Ok(())
    }

    /// Upsert one document, preserving `created_at` across updates.
    pub fn put(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        id: &str,
        data: &Value,
    ) -> HostResult<Document> {
        let table = table_name(extension_id, collection)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {table} (user_id, id, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (user_id, id)
                 DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at"
            ),
            params![scope(user_id), id, serde_json::to_string(data)?, now],
        )?;
        drop(conn);
        self.get(extension_id, collection, user_id, id)?
            .ok_or_else(|| HostError::Storage(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        id: &str,
    ) -> HostResult<Option<Document>> {
        let table = table_name(extension_id, collection)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, data, created_at, updated_at FROM {table}
             WHERE user_id = ?1 AND id = ?2"
        ))?;
        let mut rows = stmt.query(params![scope(user_id), id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_document(row)?)),
            None => Ok(None),
        }
    }

    /// Returns whether a row existed.
    pub fn delete(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        id: &str,
    ) -> HostResult<bool> {
        let table = table_name(extension_id, collection)?;
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            &format!("DELETE FROM {table} WHERE user_id = ?1 AND id = ?2"),
            params![scope(user_id), id],
        )?;
        Ok(affected > 0)
    }

    pub fn find(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        query: &ParsedQuery,
    ) -> HostResult<Vec<Document>> {
        let table = table_name(extension_id, collection)?;
        let where_sql = scope_where(&query.where_sql);
        let sql = format!(
            "SELECT id, data, created_at, updated_at FROM {table} {} {} {}",
            where_sql, query.order_sql, query.limit_sql
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql.trim())?;
        let params = bind_values(user_id, &query.params);
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, data, created_at, updated_at) = row?;
            documents.push(Document {
                id,
                data: serde_json::from_str(&data)?,
                created_at,
                updated_at,
            });
        }
        Ok(documents)
    }

    pub fn find_one(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        query: &ParsedQuery,
    ) -> HostResult<Option<Document>> {
        let mut narrowed = query.clone();
        narrowed.limit_sql = "LIMIT 1".to_string();
        Ok(self
            .find(extension_id, collection, user_id, &narrowed)?
            .into_iter()
            .next())
    }

    /// COUNT ignores ORDER BY/LIMIT/OFFSET entirely.
    pub fn count(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        query: &ParsedQuery,
    ) -> HostResult<u64> {
        let table = table_name(extension_id, collection)?;
        let where_sql = scope_where(query.count_suffix());
        let sql = format!("SELECT COUNT(*) FROM {table} {where_sql}");

        let conn = self.conn.lock().unwrap();
        let params = bind_values(user_id, &query.params);
        let count: i64 = conn.query_row(sql.trim(), rusqlite::params_from_iter(params), |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }

    pub fn put_many(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        documents: &[DocumentInput],
    ) -> HostResult<u64> {
        for doc in documents {
            self.put(extension_id, collection, user_id, &doc.id, &doc.data)?;
        }
        Ok(documents.len() as u64)
    }

    /// Delete every document matching the query; returns the count.
    pub fn delete_many(
        &self,
        extension_id: &str,
        collection: &str,
        user_id: Option<&str>,
        query: &ParsedQuery,
    ) -> HostResult<u64> {
        let table = table_name(extension_id, collection)?;
        let where_sql = scope_where(query.count_suffix());
        let sql = format!("DELETE FROM {table} {where_sql}");

        let conn = self.conn.lock().unwrap();
        let params = bind_values(user_id, &query.params);
        let affected = conn.execute(sql.trim(), rusqlite::params_from_iter(params))?;
        Ok(affected as u64)
    }

    pub fn drop_collection(&self, extension_id: &str, collection: &str) -> HostResult<()> {
        let table = table_name(extension_id, collection)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
        conn.execute(
            "DELETE FROM doc_collections WHERE extension_id = ?1 AND collection = ?2",
            params![extension_id, collection],
        )?;
        Ok(())
    }

    /// Collections provisioned for this extension, from the catalog.
    pub fn list_collections(&self, extension_id: &str) -> HostResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT collection FROM doc_collections WHERE extension_id = ?1 ORDER BY collection",
        )?;
        let rows = stmt.query_map(params![extension_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    // =========================================================================
    // Raw database access (extension-prefixed tables only)
    // =========================================================================

    /// Execute SQL on behalf of an extension. The statement may only touch
    /// tables carrying the extension's own prefix; the check runs inside
    /// SQLite's authorizer at prepare time, so no lexical form of the SQL
    /// can smuggle a reference past it.
    pub fn execute_raw(
        &self,
        extension_id: &str,
        sql: &str,
        params: &[Value],
    ) -> HostResult<Value> {
        let prefix = extension_table_prefix(extension_id)?;
        let conn = self.conn.lock().unwrap();

        conn.authorizer(Some(namespace_authorizer(prefix.clone())));
        let result = run_statement(&conn, sql, params);
        conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);

        result.map_err(|e| match e {
            HostError::Storage(rusqlite::Error::SqliteFailure(inner, _))
                if inner.code == rusqlite::ErrorCode::AuthorizationForStatementDenied =>
            {
                HostError::PermissionDenied(format!(
                    "statement touches objects outside the extension's '{prefix}*' namespace"
                ))
            }
            other => other,
        })
    }
}

fn run_statement(conn: &Connection, sql: &str, params: &[Value]) -> HostResult<Value> {
    let trimmed = sql.trim_start();
    let is_query = trimmed
        .get(..6)
        .map(|head| head.eq_ignore_ascii_case("select"))
        .unwrap_or(false);

    if is_query {
        let mut stmt = conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let names: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(to_sql_value),
        ))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = serde_json::Map::new();
            for (idx, name) in names.iter().enumerate().take(column_count) {
                obj.insert(name.clone(), column_to_json(row, idx)?);
            }
            out.push(Value::Object(obj));
        }
        Ok(Value::Array(out))
    } else {
        let affected = conn.execute(
            sql,
            rusqlite::params_from_iter(params.iter().map(to_sql_value)),
        )?;
        Ok(serde_json::json!({ "rows_affected": affected }))
    }
}

/// Table prefix for the raw database capability.
pub fn extension_table_prefix(extension_id: &str) -> HostResult<String> {
    Ok(format!("ext_{}_", sanitize_extension_id(extension_id)?))
}

/// Authorizer confining a statement to the extension's own tables.
/// DDL on those tables surfaces as writes to the schema table, which are
/// allowed; reading the schema table is not.
fn namespace_authorizer(
    prefix: String,
) -> impl FnMut(AuthContext<'_>) -> Authorization + Send + RefUnwindSafe + 'static {
    move |ctx: AuthContext<'_>| {
        let table = match ctx.action {
            AuthAction::Insert { table_name }
            | AuthAction::Update { table_name, .. }
            | AuthAction::Delete { table_name }
                if table_name.eq_ignore_ascii_case("sqlite_master")
                    || table_name.eq_ignore_ascii_case("sqlite_temp_master") =>
            {
                return Authorization::Allow;
            }
            AuthAction::Read { table_name, .. }
            | AuthAction::Insert { table_name }
            | AuthAction::Update { table_name, .. }
            | AuthAction::Delete { table_name }
            | AuthAction::CreateTable { table_name }
            | AuthAction::DropTable { table_name }
            | AuthAction::AlterTable { table_name, .. }
            | AuthAction::Analyze { table_name }
            | AuthAction::CreateIndex { table_name, .. }
            | AuthAction::DropIndex { table_name, .. } => table_name,
            AuthAction::Select | AuthAction::Recursive | AuthAction::Function { .. } => {
                return Authorization::Allow;
            }
            _ => return Authorization::Deny,
        };
        if table.starts_with(&prefix) {
            Authorization::Allow
        } else {
            Authorization::Deny
        }
    }
}

fn scope(user_id: Option<&str>) -> &str {
    user_id.unwrap_or(EXTENSION_SCOPE)
}

/// The caller's WHERE clause plus the row-scope condition. The scope
/// parameter binds first, so it is prepended to the clause.
fn scope_where(where_sql: &str) -> String {
    if where_sql.is_empty() {
        "WHERE user_id = ?".to_string()
    } else {
        // where_sql starts with "WHERE "
        format!("WHERE user_id = ? AND {}", &where_sql[6..])
    }
}

fn bind_values(user_id: Option<&str>, params: &[Value]) -> Vec<rusqlite::types::Value> {
    let mut values = Vec::with_capacity(params.len() + 1);
    values.push(rusqlite::types::Value::Text(scope(user_id).to_string()));
    values.extend(params.iter().map(to_sql_value));
    values
}

/// Convert a JSON parameter to a SQLite binding. Compound values are
/// bound as their JSON text.
fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn column_to_json(row: &rusqlite::Row<'_>, idx: usize) -> HostResult<Value> {
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            use base64::Engine as _;
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

fn row_to_document(row: &rusqlite::Row<'_>) -> HostResult<Document> {
    let data: String = row.get(1)?;
    Ok(Document {
        id: row.get(0)?,
        data: serde_json::from_str(&data)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

/// Encode an extension id for use inside SQL identifiers. `_` doubles
/// and `-` becomes `_d`, so the encoding is injective: distinct ids can
/// never share a physical namespace.
fn sanitize_extension_id(extension_id: &str) -> HostResult<String> {
    let mut sanitized = String::with_capacity(extension_id.len());
    for c in extension_id.chars() {
        match c {
            '_' => sanitized.push_str("__"),
            '-' => sanitized.push_str("_d"),
            c => sanitized.push(c),
        }
    }
    if !is_valid_identifier(&sanitized) {
        return Err(HostError::InvalidInput(format!(
            "Invalid extension id for storage: {extension_id:?}"
        )));
    }
    Ok(sanitized)
}

/// Physical table for one (extension, collection) pair. Both parts are
/// validated before they reach the statement text.
fn table_name(extension_id: &str, collection: &str) -> HostResult<String> {
    if !is_valid_identifier(collection) {
        return Err(HostError::InvalidInput(format!(
            "Invalid collection name: {collection:?}"
        )));
    }
    Ok(format!(
        "doc_{}_{}",
        sanitize_extension_id(extension_id)?,
        collection
    ))
}
