use crate::db;
use crate::gradebook::{self, POLICY_SETTING_KEY};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, policy_param};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match gradebook::resolve_policy(conn, None) {
        Ok(policy) => ok(
            &req.id,
            json!({ "missingSubjectPolicy": policy.as_str() }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match policy_param(req) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "bad_params", "missing missingSubjectPolicy", None),
        Err(e) => return e,
    };
    if let Err(e) = db::settings_set_json(conn, POLICY_SETTING_KEY, &json!(policy.as_str())) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(policy = policy.as_str(), "missing subject policy updated");
    ok(&req.id, json!({ "missingSubjectPolicy": policy.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.set" => Some(handle_settings_set(state, req)),
        _ => None,
    }
}
