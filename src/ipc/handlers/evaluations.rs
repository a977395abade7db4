use crate::evaluations::{self, EvaluationKind, EvaluationType};
use crate::gradebook;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{date_param, db_conn, next_sort_order, optional_str, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = match required_name(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let eval_type = match required_str(req, "type").map(|raw| (EvaluationType::parse(&raw), raw)) {
        Ok((Some(t), _)) => t,
        Ok((None, raw)) => {
            return err(
                &req.id,
                "bad_params",
                "type must be one of: homework, composition",
                Some(json!({ "type": raw })),
            )
        }
        Err(e) => return e,
    };
    let kind = match optional_str(req, "kind") {
        Ok(None) => None,
        Ok(Some(raw)) => match EvaluationKind::parse(&raw) {
            Some(k) => Some(k),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "kind must be one of: homework1, homework2, composition, unclassified",
                    Some(json!({ "kind": raw })),
                )
            }
        },
        Err(e) => return e,
    };
    let term_id = match optional_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match date_param(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let year_id = match gradebook::class_year(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let subject_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let terms = match gradebook::load_year_terms(conn, &year_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if term_id.is_none() && date.is_none() {
        return err(&req.id, "bad_params", "termId or date is required", None);
    }
    let Some(term) = evaluations::evaluation_term(&terms, term_id.as_deref(), date) else {
        return err(
            &req.id,
            "bad_params",
            "evaluation does not fall in a term of the class's academic year",
            Some(json!({ "termId": term_id, "date": date.map(|d| d.to_string()) })),
        );
    };

    let sort_order = match next_sort_order(
        conn,
        "SELECT MAX(sort_order) FROM evaluations WHERE class_id = ?",
        &class_id,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let evaluation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(id, class_id, subject_id, term_id, date, label, eval_type, kind, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &evaluation_id,
            &class_id,
            &subject_id,
            term_id.as_deref(),
            date.map(|d| d.to_string()),
            &label,
            eval_type.as_str(),
            kind.map(|k| k.as_str()),
            sort_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    ok(
        &req.id,
        json!({
            "evaluationId": evaluation_id,
            "termId": term.id,
            "term": term.ordinal.number(),
        }),
    )
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_filter = match optional_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_filter = match optional_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let year_id = match gradebook::class_year(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let terms = match gradebook::load_year_terms(conn, &year_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let all = match gradebook::load_class_evaluations(conn, &class_id, &terms) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let evaluations: Vec<_> = all
        .into_iter()
        .filter(|e| term_filter.as_deref().map(|t| e.term_id == t).unwrap_or(true))
        .filter(|e| {
            subject_filter
                .as_deref()
                .map(|s| e.subject_id == s)
                .unwrap_or(true)
        })
        .collect();
    let fallback_count = evaluations.iter().filter(|e| e.resolved.fallback).count();
    ok(
        &req.id,
        json!({
            "evaluations": evaluations,
            "fallbackCount": fallback_count,
        }),
    )
}

fn handle_evaluations_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM scores WHERE evaluation_id = ?", [&evaluation_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "scores" })),
        );
    }
    let removed = match tx.execute("DELETE FROM evaluations WHERE id = ?", [&evaluation_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "evaluations" })),
            );
        }
    };
    if removed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "evaluation not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        "evaluations.delete" => Some(handle_evaluations_delete(state, req)),
        _ => None,
    }
}
