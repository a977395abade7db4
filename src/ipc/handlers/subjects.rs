use crate::gradebook;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, next_sort_order, optional_f64, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM subjects ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Subject whose name matches `name` ignoring case, including non-ASCII
/// letters ("Français" and "FRANÇAIS" are the same subject).
fn find_subject_by_name(conn: &Connection, name: &str) -> Result<Option<String>, rusqlite::Error> {
    let wanted = name.to_lowercase();
    let mut stmt = conn.prepare("SELECT id, name FROM subjects")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .find(|(_, n)| n.trim().to_lowercase() == wanted)
        .map(|(id, _)| id))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_name(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing = match find_subject_by_name(conn, &name) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(subject_id) = existing {
        return err(
            &req.id,
            "conflict",
            "a subject with this name already exists",
            Some(json!({ "subjectId": subject_id })),
        );
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name) VALUES(?, ?)",
        (&subject_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_class_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let coefficient = match optional_f64(req, "coefficient") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(c) = coefficient {
        if !c.is_finite() || c < 0.0 {
            return err(
                &req.id,
                "bad_params",
                "coefficient must be a non-negative number",
                Some(json!({ "coefficient": c })),
            );
        }
    }

    if let Err(e) = gradebook::class_year(conn, &class_id) {
        return calc_err(&req.id, e);
    }
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

    let sort_order = match next_sort_order(
        conn,
        "SELECT MAX(sort_order) FROM class_subjects WHERE class_id = ?",
        &class_id,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = conn.execute(
        "INSERT INTO class_subjects(class_id, subject_id, coefficient, sort_order)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET coefficient = excluded.coefficient",
        (&class_id, &subject_id, coefficient, sort_order),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "class_subjects" })),
        );
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "coefficient": coefficient,
        }),
    )
}

fn handle_class_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = gradebook::class_year(conn, &class_id) {
        return calc_err(&req.id, e);
    }

    let subjects = match gradebook::load_subjects(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut stmt = match conn
        .prepare("SELECT subject_id, coefficient FROM class_subjects WHERE class_id = ?")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let configured: HashMap<String, Option<f64>> = match stmt
        .query_map([&class_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let out: Vec<serde_json::Value> = subjects
        .iter()
        .map(|s| {
            let stored = configured.get(&s.subject_id);
            json!({
                "subjectId": s.subject_id,
                "name": s.name,
                "coefficient": s.coefficient,
                "configuredCoefficient": stored.copied().flatten(),
                "taught": stored.is_some(),
            })
        })
        .collect();
    ok(&req.id, json!({ "subjects": out }))
}

fn handle_class_subjects_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match conn.execute(
        "DELETE FROM class_subjects WHERE class_id = ? AND subject_id = ?",
        (&class_id, &subject_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "subject is not taught in this class", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_subjects" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "classSubjects.set" => Some(handle_class_subjects_set(state, req)),
        "classSubjects.list" => Some(handle_class_subjects_list(state, req)),
        "classSubjects.remove" => Some(handle_class_subjects_remove(state, req)),
        _ => None,
    }
}
