//! Structured query translation for the document store.
//!
//! A query object becomes a parameterized WHERE clause over the JSON
//! `data` column, one condition per field. Field paths and sort
//! directions are validated before anything is interpolated into SQL;
//! values only ever travel as bound parameters.

use serde_json::{Map, Value};

use crate::error::{HostError, HostResult};
use crate::permissions::validate_field_path;

/// Reserved top-level keys in a query object. Anything else is treated
/// as a bare filter for callers that skip the envelope.
const RESERVED_KEYS: [&str; 4] = ["filter", "sort", "limit", "offset"];

/// A parsed, parameterized query ready to append to a SELECT.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// `WHERE ...` (empty when the filter is empty)
    pub where_sql: String,
    /// Bound parameters, in clause order
    pub params: Vec<Value>,
    /// `ORDER BY ...` (empty when no sort)
    pub order_sql: String,
    /// `LIMIT n OFFSET m` fragments as applicable
    pub limit_sql: String,
}

impl ParsedQuery {
    /// Suffix for row-returning queries.
    pub fn select_suffix(&self) -> String {
        [&self.where_sql, &self.order_sql, &self.limit_sql]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Suffix for COUNT queries: ORDER BY/LIMIT/OFFSET are omitted
    /// entirely.
    pub fn count_suffix(&self) -> &str {
        &self.where_sql
    }
}

/// Parse a full query object: `{filter, sort, limit, offset}`, or a bare
/// filter object when none of the reserved keys are present.
pub fn parse_query(query: &Value) -> HostResult<ParsedQuery> {
    let obj = match query {
        Value::Null => return parse_parts(&Map::new(), &[], None, None),
        Value::Object(obj) => obj,
        _ => {
            return Err(HostError::InvalidInput(
                "query must be a JSON object".into(),
            ))
        }
    };

    let is_envelope = obj.keys().all(|k| RESERVED_KEYS.contains(&k.as_str()));
    if !is_envelope {
        // Bare filter form: parse_query({age: {$gt: 18}})
        return parse_parts(obj, &[], None, None);
    }

    let empty = Map::new();
    let filter = match obj.get("filter") {
        None => &empty,
        Some(Value::Object(f)) => f,
        Some(_) => {
            return Err(HostError::InvalidInput(
                "filter must be a JSON object".into(),
            ))
        }
    };

    let sort = parse_sort_spec(obj.get("sort"))?;
    let limit = parse_bound(obj.get("limit"), "limit")?;
    let offset = parse_bound(obj.get("offset"), "offset")?;

    parse_parts(filter, &sort, limit, offset)
}

fn parse_parts(
    filter: &Map<String, Value>,
    sort: &[(String, SortDirection)],
    limit: Option<i64>,
    offset: Option<i64>,
) -> HostResult<ParsedQuery> {
    let clause = parse_filter(filter)?;

    let order_sql = if sort.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = sort
            .iter()
            .map(|(field, dir)| format!("{} {}", json_path_expr(field), dir.as_sql()))
            .collect();
        format!("ORDER BY {}", parts.join(", "))
    };

    let limit_sql = match (limit, offset) {
        (None, None) => String::new(),
        (Some(l), None) => format!("LIMIT {l}"),
        // SQLite requires LIMIT before OFFSET
        (None, Some(o)) => format!("LIMIT -1 OFFSET {o}"),
        (Some(l), Some(o)) => format!("LIMIT {l} OFFSET {o}"),
    };

    Ok(ParsedQuery {
        where_sql: clause.sql,
        params: clause.params,
        order_sql,
        limit_sql,
    })
}

/// A parameterized WHERE clause.
#[derive(Debug, Clone)]
pub struct WhereClause {
    /// `WHERE ...`, or empty when the filter has no conditions
    pub sql: String,
    pub params: Vec<Value>,
}

/// Translate a filter object into a WHERE clause. Bare values are
/// equality; operator objects support `$gt,$gte,$lt,$lte,$ne,$in,$contains`.
pub fn parse_filter(filter: &Map<String, Value>) -> HostResult<WhereClause> {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    for (field, condition) in filter {
        validate_field_path(field).map_err(|e| HostError::InvalidInput(e.to_string()))?;
        let column = json_path_expr(field);

        match condition {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                for (op, operand) in ops {
                    let (sql, mut values) = translate_operator(&column, field, op, operand)?;
                    conditions.push(sql);
                    params.append(&mut values);
                }
            }
            other => {
                conditions.push(format!("{column} = ?"));
                params.push(other.clone());
            }
        }
    }

    let sql = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    Ok(WhereClause { sql, params })
}

fn translate_operator(
    column: &str,
    field: &str,
    op: &str,
    operand: &Value,
) -> HostResult<(String, Vec<Value>)> {
    match op {
        "$gt" => Ok((format!("{column} > ?"), vec![operand.clone()])),
        "$gte" => Ok((format!("{column} >= ?"), vec![operand.clone()])),
        "$lt" => Ok((format!("{column} < ?"), vec![operand.clone()])),
        "$lte" => Ok((format!("{column} <= ?"), vec![operand.clone()])),
        "$ne" => Ok((format!("{column} != ?"), vec![operand.clone()])),
        "$in" => {
            let items = operand.as_array().ok_or_else(|| {
                HostError::InvalidInput(format!("$in on field '{field}' requires an array"))
            })?;
            if items.is_empty() {
                // Empty $in would generate invalid SQL or vacuously-false
                // semantics that differ from caller intent.
                return Err(HostError::InvalidInput(format!(
                    "$in on field '{field}' must not be empty"
                )));
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            Ok((format!("{column} IN ({placeholders})"), items.clone()))
        }
        "$contains" => {
            let needle = operand.as_str().ok_or_else(|| {
                HostError::InvalidInput(format!("$contains on field '{field}' requires a string"))
            })?;
            let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
            Ok((
                format!("LOWER(CAST({column} AS TEXT)) LIKE ? ESCAPE '\\'"),
                vec![Value::String(pattern)],
            ))
        }
        other => Err(HostError::InvalidInput(format!(
            "Unsupported query operator: {other}"
        ))),
    }
}

/// Escape literal `%`, `_` and the escape character itself so user input
/// cannot act as LIKE wildcards.
fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Expression addressing a validated field path inside the JSON column.
fn json_path_expr(field: &str) -> String {
    format!("json_extract(data, '$.{field}')")
}

/// Sort direction, normalized from a case-insensitive token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(token: &str) -> HostResult<Self> {
        match token.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(HostError::InvalidInput(format!(
                "Invalid sort direction: {other:?}"
            ))),
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

fn parse_sort_spec(sort: Option<&Value>) -> HostResult<Vec<(String, SortDirection)>> {
    let Some(sort) = sort else {
        return Ok(Vec::new());
    };
    let entries = sort
        .as_array()
        .ok_or_else(|| HostError::InvalidInput("sort must be an array".into()))?;

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
            HostError::InvalidInput("sort entries must be [field, direction] pairs".into())
        })?;
        let field = pair[0]
            .as_str()
            .ok_or_else(|| HostError::InvalidInput("sort field must be a string".into()))?;
        let direction = pair[1]
            .as_str()
            .ok_or_else(|| HostError::InvalidInput("sort direction must be a string".into()))?;

        validate_field_path(field).map_err(|e| HostError::InvalidInput(e.to_string()))?;
        parsed.push((field.to_string(), SortDirection::parse(direction)?));
    }
    Ok(parsed)
}

fn parse_bound(value: Option<&Value>, name: &str) -> HostResult<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v.as_i64().ok_or_else(|| {
                HostError::InvalidInput(format!("{name} must be a non-negative integer"))
            })?;
            if n < 0 {
                return Err(HostError::InvalidInput(format!(
                    "{name} must be a non-negative integer"
                )));
            }
            Ok(Some(n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gt_operator() {
        let parsed = parse_query(&json!({"age": {"$gt": 18}})).unwrap();
        assert_eq!(
            parsed.where_sql,
            "WHERE json_extract(data, '$.age') > ?"
        );
        assert_eq!(parsed.params, vec![json!(18)]);
    }

    #[test]
    fn test_bare_value_is_equality() {
        let parsed = parse_query(&json!({"status": "open"})).unwrap();
        assert_eq!(parsed.where_sql, "WHERE json_extract(data, '$.status') = ?");
        assert_eq!(parsed.params, vec![json!("open")]);
    }

    #[test]
    fn test_multiple_conditions_joined_with_and() {
        let parsed =
            parse_query(&json!({"age": {"$gte": 18, "$lt": 65}, "active": true})).unwrap();
        assert!(parsed.where_sql.contains(" AND "));
        assert_eq!(parsed.params.len(), 3);
    }

    #[test]
    fn test_empty_in_is_hard_error() {
        let err = parse_query(&json!({"status": {"$in": []}})).unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));
    }

    #[test]
    fn test_in_expands_placeholders() {
        let parsed = parse_query(&json!({"status": {"$in": ["a", "b", "c"]}})).unwrap();
        assert!(parsed.where_sql.contains("IN (?, ?, ?)"));
        assert_eq!(parsed.params, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_contains_escapes_like_wildcards() {
        let parsed = parse_query(&json!({"name": {"$contains": "a%b_c"}})).unwrap();
        assert!(parsed.where_sql.contains("LIKE ? ESCAPE '\\'"));
        assert_eq!(parsed.params, vec![json!("%a\\%b\\_c%")]);
    }

    #[test]
    fn test_contains_lowercases() {
        let parsed = parse_query(&json!({"name": {"$contains": "Alice"}})).unwrap();
        assert_eq!(parsed.params, vec![json!("%alice%")]);
    }

    #[test]
    fn test_injection_in_field_path_rejected() {
        let err = parse_query(&json!({"user; DROP TABLE": 1})).unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));
    }

    #[test]
    fn test_envelope_with_sort_limit_offset() {
        let parsed = parse_query(&json!({
            "filter": {"status": "open"},
            "sort": [["due.date", "DESC"], ["id", "asc"]],
            "limit": 10,
            "offset": 5
        }))
        .unwrap();
        assert_eq!(
            parsed.order_sql,
            "ORDER BY json_extract(data, '$.due.date') DESC, json_extract(data, '$.id') ASC"
        );
        assert_eq!(parsed.limit_sql, "LIMIT 10 OFFSET 5");
        assert!(parsed.select_suffix().starts_with("WHERE"));
        // COUNT form drops ordering and paging
        assert_eq!(parsed.count_suffix(), parsed.where_sql);
    }

    #[test]
    fn test_invalid_sort_direction_rejected() {
        let err = parse_query(&json!({
            "filter": {},
            "sort": [["id", "sideways; DROP TABLE x"]]
        }))
        .unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));
    }

    #[test]
    fn test_negative_limit_rejected() {
        let err = parse_query(&json!({"filter": {}, "limit": -1})).unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));
        let err = parse_query(&json!({"filter": {}, "offset": -3})).unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));
    }

    #[test]
    fn test_fractional_limit_rejected() {
        let err = parse_query(&json!({"filter": {}, "limit": 1.5})).unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));
    }

    #[test]
    fn test_empty_query_has_no_where() {
        let parsed = parse_query(&json!({})).unwrap();
        assert!(parsed.where_sql.is_empty());
        assert!(parsed.params.is_empty());
        assert!(parsed.select_suffix().is_empty());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = parse_query(&json!({"age": {"$regex": ".*"}})).unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));
    }
}
