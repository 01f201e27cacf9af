use crate::calc::CalcError;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::json;

pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn db_query(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_write(code: &'static str, table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        log::error!("write to {} failed: {}", table, e);
        HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
    }
}

/// Runs `f` against the open workspace database and wraps the outcome in the
/// response envelope.
pub fn with_conn<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// Deserializes request params into a typed request struct. A missing
/// `params` member is read as an empty object.
pub fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, HandlerErr> {
    let value = if params.is_null() {
        json!({})
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

/// Distinguishes an absent member (`None`) from an explicit `null`
/// (`Some(None)`) in update requests. Use with `#[serde(default)]`.
pub fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

pub fn required_text(raw: &str, field: &str, max_len: usize) -> Result<String, HandlerErr> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", field)));
    }
    if t.chars().count() > max_len {
        return Err(HandlerErr::bad_params(format!(
            "{} must be at most {} characters",
            field, max_len
        )));
    }
    Ok(t.to_string())
}

/// Blank optional text is stored as NULL.
pub fn optional_text(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if db::exists(conn, table, id).map_err(db_query)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what).with_details(json!({ "id": id })))
    }
}

pub fn parse_iso_date(raw: &str, field: &str) -> Result<chrono::NaiveDate, HandlerErr> {
    chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", field)))
}

/// `%term%` pattern for case-insensitive LIKE searches; `None` for blank input.
pub fn like_pattern(search: Option<&str>) -> Option<String> {
    let t = search?.trim();
    if t.is_empty() {
        return None;
    }
    let escaped = t
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    Some(format!("%{}%", escaped.to_lowercase()))
}

/// Settings are read through `anyhow`; surface failures as query errors.
pub fn settings_failed(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", format!("{e:#}"))
}

pub fn today_iso() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}
