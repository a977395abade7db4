use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

use crate::calc::MissingAveragePolicy;
use crate::gradebook;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// Trimmed, non-empty string parameter.
pub fn required_name(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let raw = required_str(req, key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(trimmed.to_string())
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_str().map(|s| Some(s.to_string())).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a string or null", key),
                None,
            )
        }),
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a number or null", key),
                None,
            )
        }),
    }
}

pub fn date_param(req: &Request, key: &str) -> Result<Option<NaiveDate>, serde_json::Value> {
    let Some(raw) = optional_str(req, key)? else {
        return Ok(None);
    };
    gradebook::parse_date(&raw).map(Some).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be a YYYY-MM-DD date", key),
            Some(json!({ key: raw })),
        )
    })
}

pub fn policy_param(req: &Request) -> Result<Option<MissingAveragePolicy>, serde_json::Value> {
    let Some(raw) = optional_str(req, "missingSubjectPolicy")? else {
        return Ok(None);
    };
    MissingAveragePolicy::parse(&raw).map(Some).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "missingSubjectPolicy must be one of: exclude, zero",
            Some(json!({ "missingSubjectPolicy": raw })),
        )
    })
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn next_sort_order(
    conn: &Connection,
    sql: &str,
    key: &str,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(sql, [key], |r| r.get::<_, Option<i64>>(0))
        .map(|v| v.map(|n| n + 1).unwrap_or(0))
}
