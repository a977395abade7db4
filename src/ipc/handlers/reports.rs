use crate::calc::{self, ClassReport};
use crate::gradebook::{self, CalcContext, CalcError};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, now_timestamp, optional_f64, policy_param, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn class_report(
    conn: &Connection,
    req: &Request,
    class_id: &str,
    term_id: &str,
) -> Result<ClassReport, serde_json::Value> {
    let policy = policy_param(req)?;
    let ctx = CalcContext {
        conn,
        class_id,
        term_id,
    };
    let input = gradebook::load_class_term_input(&ctx, policy).map_err(|e| calc_err(&req.id, e))?;
    Ok(calc::build_class_report(&input))
}

/// Header block printed at the top of every bulletin.
fn bulletin_header(conn: &Connection, class_id: &str, term_id: &str) -> Result<serde_json::Value, CalcError> {
    let row: Option<(String, String, i64, String, String)> = conn
        .query_row(
            "SELECT c.name, y.label, t.ordinal, t.start_date, t.end_date
             FROM classes c
             JOIN academic_years y ON y.id = c.academic_year_id
             JOIN terms t ON t.academic_year_id = y.id
             WHERE c.id = ? AND t.id = ?",
            (class_id, term_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((class_name, year_label, ordinal, start, end)) = row else {
        return Err(CalcError::new("not_found", "class or term not found"));
    };
    Ok(json!({
        "classId": class_id,
        "className": class_name,
        "academicYear": year_label,
        "termId": term_id,
        "term": ordinal,
        "termStartDate": start,
        "termEndDate": end,
    }))
}

fn handle_reports_bulletin(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let term = match gradebook::load_term(conn, &term_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let class_id = match gradebook::student_class(conn, &student_id, &term.academic_year_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let report = match class_report(conn, req, &class_id, &term_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let header = match bulletin_header(conn, &class_id, &term_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let Some(card) = report.cards.iter().find(|c| c.student_id == student_id) else {
        return err(&req.id, "not_found", "student not found in class roster", None);
    };

    ok(
        &req.id,
        json!({
            "header": header,
            "bulletin": card,
            "classStats": report.stats,
            "missingSubjectPolicy": report.policy,
        }),
    )
}

fn handle_reports_class_bulletins(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let report = match class_report(conn, req, &class_id, &term_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let header = match bulletin_header(conn, &class_id, &term_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    ok(
        &req.id,
        json!({
            "header": header,
            "report": report,
        }),
    )
}

fn handle_reports_ranking(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let report = match class_report(conn, req, &class_id, &term_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let rows: Vec<serde_json::Value> = report
        .ranking
        .iter()
        .filter_map(|r| {
            let card = report.cards.iter().find(|c| c.student_id == r.student_id)?;
            Some(json!({
                "studentId": r.student_id,
                "firstName": card.first_name,
                "lastName": card.last_name,
                "generalAverage": r.general_average,
                "position": r.position,
                "rank": r.rank,
                "mention": card.mention,
                "mentionLabel": card.mention_label,
                "decision": card.decision,
            }))
        })
        .collect();
    let unranked: Vec<&str> = report
        .cards
        .iter()
        .filter(|c| c.rank.is_none())
        .map(|c| c.student_id.as_str())
        .collect();

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "termId": term_id,
            "ranking": rows,
            "unranked": unranked,
            "stats": report.stats,
        }),
    )
}

/// Student and term must belong to the same academic year.
fn check_student_term(conn: &Connection, student_id: &str, term_id: &str) -> Result<(), CalcError> {
    let term = gradebook::load_term(conn, term_id)?;
    gradebook::student_class(conn, student_id, &term.academic_year_id).map(|_| ())
}

fn handle_reports_comment_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let comment = match req.params.get("comment") {
        None => return err(&req.id, "bad_params", "missing comment", None),
        Some(v) if v.is_null() => String::new(),
        Some(v) => match v.as_str() {
            Some(s) => s.trim().to_string(),
            None => return err(&req.id, "bad_params", "comment must be a string or null", None),
        },
    };
    if let Err(e) = check_student_term(conn, &student_id, &term_id) {
        return calc_err(&req.id, e);
    }

    // An empty comment clears it.
    let res = if comment.is_empty() {
        conn.execute(
            "DELETE FROM bulletin_comments WHERE term_id = ? AND student_id = ?",
            (&term_id, &student_id),
        )
    } else {
        conn.execute(
            "INSERT INTO bulletin_comments(term_id, student_id, comment, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(term_id, student_id) DO UPDATE SET
               comment = excluded.comment,
               updated_at = excluded.updated_at",
            (&term_id, &student_id, &comment, now_timestamp()),
        )
    };
    if let Err(e) = res {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "bulletin_comments" })),
        );
    }
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "termId": term_id,
            "comment": if comment.is_empty() { None } else { Some(comment) },
        }),
    )
}

fn handle_absences_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let hours = match optional_f64(req, "hours") {
        Ok(Some(h)) if h.is_finite() && h >= 0.0 => h,
        Ok(Some(h)) => {
            return err(
                &req.id,
                "bad_params",
                "hours must be a non-negative number",
                Some(json!({ "hours": h })),
            )
        }
        Ok(None) => return err(&req.id, "bad_params", "missing hours", None),
        Err(e) => return e,
    };
    if let Err(e) = check_student_term(conn, &student_id, &term_id) {
        return calc_err(&req.id, e);
    }
    if let Err(e) = conn.execute(
        "INSERT INTO term_absences(term_id, student_id, hours) VALUES(?, ?, ?)
         ON CONFLICT(term_id, student_id) DO UPDATE SET hours = excluded.hours",
        (&term_id, &student_id, hours),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "term_absences" })),
        );
    }
    ok(
        &req.id,
        json!({ "studentId": student_id, "termId": term_id, "hours": hours }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.bulletin" => Some(handle_reports_bulletin(state, req)),
        "reports.classBulletins" => Some(handle_reports_class_bulletins(state, req)),
        "reports.ranking" => Some(handle_reports_ranking(state, req)),
        "reports.comment.set" => Some(handle_reports_comment_set(state, req)),
        "absences.set" => Some(handle_absences_set(state, req)),
        _ => None,
    }
}
