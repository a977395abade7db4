use crate::calc::{self, ScoreIndex};
use crate::gradebook::{self, CalcContext};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, now_timestamp, policy_param, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 20.0;
const GRADES_BULK_UPSERT_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

struct ScoreEdit {
    evaluation_id: String,
    student_id: String,
    value: f64,
}

fn parse_score_edit(raw: &serde_json::Value) -> Result<ScoreEdit, HandlerErr> {
    let evaluation_id = raw.get("evaluationId").and_then(|v| v.as_str());
    let student_id = raw.get("studentId").and_then(|v| v.as_str());
    let (Some(evaluation_id), Some(student_id)) = (evaluation_id, student_id) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing evaluationId or studentId".to_string(),
            details: None,
        });
    };
    let Some(value) = raw.get("value").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "value must be a number".to_string(),
            details: None,
        });
    };
    if !value.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&value) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("scores must be between {} and {}", SCORE_MIN, SCORE_MAX),
            details: Some(json!({ "value": value })),
        });
    }
    Ok(ScoreEdit {
        evaluation_id: evaluation_id.to_string(),
        student_id: student_id.to_string(),
        value,
    })
}

/// The student must be enrolled in the class that owns the evaluation.
fn check_enrolled(conn: &Connection, edit: &ScoreEdit) -> Result<(), HandlerErr> {
    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM evaluations WHERE id = ?",
            [&edit.evaluation_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(class_id) = class_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "evaluation not found".to_string(),
            details: Some(json!({ "evaluationId": edit.evaluation_id })),
        });
    };
    let enrolled: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE student_id = ? AND class_id = ?",
            (&edit.student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if enrolled.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student is not enrolled in the evaluation's class".to_string(),
            details: Some(json!({ "studentId": edit.student_id })),
        });
    }
    Ok(())
}

fn upsert_score(conn: &Connection, edit: &ScoreEdit, entered_at: &str) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO scores(id, evaluation_id, student_id, value, entered_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(evaluation_id, student_id) DO UPDATE SET
           value = excluded.value,
           entered_at = excluded.entered_at",
        (
            Uuid::new_v4().to_string(),
            &edit.evaluation_id,
            &edit.student_id,
            edit.value,
            entered_at,
        ),
    )
    .map(|_| ())
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "scores" })),
    })
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let edit = match parse_score_edit(&req.params) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(reason = %e.message, "rejected score");
            return e.response(&req.id);
        }
    };
    if let Err(e) = check_enrolled(conn, &edit) {
        return e.response(&req.id);
    }
    if let Err(e) = upsert_score(conn, &edit, &now_timestamp()) {
        return e.response(&req.id);
    }
    ok(
        &req.id,
        json!({
            "evaluationId": edit.evaluation_id,
            "studentId": edit.student_id,
            "value": edit.value,
        }),
    )
}

fn handle_grades_bulk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw_edits) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits", None);
    };
    if raw_edits.len() > GRADES_BULK_UPSERT_MAX_EDITS {
        return err(
            &req.id,
            "bad_params",
            format!("too many edits (max {})", GRADES_BULK_UPSERT_MAX_EDITS),
            Some(json!({ "count": raw_edits.len() })),
        );
    }

    // Validate everything before writing anything.
    let mut edits = Vec::with_capacity(raw_edits.len());
    for (i, raw) in raw_edits.iter().enumerate() {
        let edit = match parse_score_edit(raw).and_then(|e| check_enrolled(conn, &e).map(|_| e)) {
            Ok(v) => v,
            Err(mut e) => {
                let mut details = e.details.take().unwrap_or_else(|| json!({}));
                details["index"] = json!(i);
                e.details = Some(details);
                return e.response(&req.id);
            }
        };
        edits.push(edit);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let entered_at = now_timestamp();
    for edit in &edits {
        if let Err(e) = upsert_score(&tx, edit, &entered_at) {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "updated": edits.len() }))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute(
        "DELETE FROM scores WHERE evaluation_id = ? AND student_id = ?",
        (&evaluation_id, &student_id),
    ) {
        Ok(n) => ok(&req.id, json!({ "deleted": n })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "scores" })),
        ),
    }
}

/// Grade-management table: one row per student for one subject and term.
fn handle_grades_subject_table(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        term_id: &term_id,
    };
    let input = match gradebook::load_class_term_input(&ctx, None) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let Some(subject) = input.subjects.iter().find(|s| s.subject_id == subject_id) else {
        return err(
            &req.id,
            "not_found",
            "subject is not taught in this class",
            Some(json!({ "subjectId": subject_id })),
        );
    };

    let index = ScoreIndex::build(&input.scores);
    let rows: Vec<serde_json::Value> = input
        .roster
        .iter()
        .map(|student| {
            let result = calc::subject_result(&index, &student.student_id, subject, input.term);
            json!({
                "studentId": student.student_id,
                "firstName": student.first_name,
                "lastName": student.last_name,
                "result": result,
            })
        })
        .collect();

    let averages: Vec<f64> = rows
        .iter()
        .filter_map(|r| r["result"]["average"].as_f64())
        .collect();
    let subject_class_average = if averages.is_empty() {
        None
    } else {
        Some(calc::round_2_decimals(
            averages.iter().sum::<f64>() / (averages.len() as f64),
        ))
    };

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "termId": term_id,
            "term": input.term.number(),
            "subject": subject,
            "rows": rows,
            "averagedCount": averages.len(),
            "classAverage": subject_class_average,
        }),
    )
}

/// One student's results for a term, computed with the rest of the class so
/// the rank is available.
fn handle_grades_student_view(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match policy_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let term = match gradebook::load_term(conn, &term_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let class_id = match gradebook::student_class(conn, &student_id, &term.academic_year_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        term_id: &term_id,
    };
    let input = match gradebook::load_class_term_input(&ctx, policy) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let report = calc::build_class_report(&input);
    let Some(card) = report.cards.iter().find(|c| c.student_id == student_id) else {
        return err(&req.id, "not_found", "student not found in class roster", None);
    };

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "termId": term_id,
            "term": card.term,
            "subjects": card.subjects,
            "generalAverage": card.general_average,
            "hasAverage": card.has_average,
            "rank": card.rank,
            "mention": card.mention,
            "mentionLabel": card.mention_label,
            "decision": card.decision,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.bulkUpsert" => Some(handle_grades_bulk_upsert(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        "grades.subjectTable" => Some(handle_grades_subject_table(state, req)),
        "grades.studentView" => Some(handle_grades_student_view(state, req)),
        _ => None,
    }
}
