use crate::calc::TermOrdinal;
use crate::gradebook;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{date_param, db_conn, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct TermDraft {
    ordinal: TermOrdinal,
    start: NaiveDate,
    end: NaiveDate,
}

/// Splits the year range into three contiguous, near-equal terms; the last
/// term absorbs the remainder.
fn split_year(start: NaiveDate, end: NaiveDate) -> Option<Vec<TermDraft>> {
    let total_days = (end - start).num_days() + 1;
    if total_days < 3 {
        return None;
    }
    let chunk = total_days / 3;
    let t1_end = start + Duration::days(chunk - 1);
    let t2_start = t1_end + Duration::days(1);
    let t2_end = t2_start + Duration::days(chunk - 1);
    let t3_start = t2_end + Duration::days(1);
    Some(vec![
        TermDraft {
            ordinal: TermOrdinal::First,
            start,
            end: t1_end,
        },
        TermDraft {
            ordinal: TermOrdinal::Second,
            start: t2_start,
            end: t2_end,
        },
        TermDraft {
            ordinal: TermOrdinal::Third,
            start: t3_start,
            end,
        },
    ])
}

fn outside_year_err(req: &Request, ordinal: TermOrdinal, year_start: NaiveDate, year_end: NaiveDate) -> serde_json::Value {
    err(
        &req.id,
        "bad_params",
        "term must lie within its academic year",
        Some(json!({
            "ordinal": ordinal.number(),
            "yearStartDate": year_start.to_string(),
            "yearEndDate": year_end.to_string(),
        })),
    )
}

fn parse_term_drafts(
    req: &Request,
    raw: &serde_json::Value,
    year_start: NaiveDate,
    year_end: NaiveDate,
) -> Result<Vec<TermDraft>, serde_json::Value> {
    let Some(arr) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "terms must be an array", None));
    };
    if arr.len() != 3 {
        return Err(err(
            &req.id,
            "bad_params",
            "an academic year has exactly 3 terms",
            Some(json!({ "count": arr.len() })),
        ));
    }

    let mut drafts: Vec<TermDraft> = Vec::with_capacity(3);
    for (i, t) in arr.iter().enumerate() {
        let ordinal = t
            .get("ordinal")
            .and_then(|v| v.as_i64())
            .and_then(TermOrdinal::from_number);
        let start = t
            .get("startDate")
            .and_then(|v| v.as_str())
            .and_then(gradebook::parse_date);
        let end = t
            .get("endDate")
            .and_then(|v| v.as_str())
            .and_then(gradebook::parse_date);
        let (Some(ordinal), Some(start), Some(end)) = (ordinal, start, end) else {
            return Err(err(
                &req.id,
                "bad_params",
                "each term needs ordinal (1-3), startDate and endDate",
                Some(json!({ "index": i })),
            ));
        };
        if start > end {
            return Err(err(
                &req.id,
                "bad_params",
                "term startDate must not be after endDate",
                Some(json!({ "ordinal": ordinal.number() })),
            ));
        }
        if start < year_start || end > year_end {
            return Err(outside_year_err(req, ordinal, year_start, year_end));
        }
        if drafts.iter().any(|d| d.ordinal == ordinal) {
            return Err(err(
                &req.id,
                "bad_params",
                "duplicate term ordinal",
                Some(json!({ "ordinal": ordinal.number() })),
            ));
        }
        drafts.push(TermDraft { ordinal, start, end });
    }
    drafts.sort_by_key(|d| d.ordinal);
    for pair in drafts.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(err(
                &req.id,
                "bad_params",
                "terms must not overlap and must follow ordinal order",
                Some(json!({ "ordinal": pair[1].ordinal.number() })),
            ));
        }
    }
    Ok(drafts)
}

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = match required_name(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (start, end) = match (date_param(req, "startDate"), date_param(req, "endDate")) {
        (Ok(Some(s)), Ok(Some(e))) => (s, e),
        (Err(e), _) | (_, Err(e)) => return e,
        _ => return err(&req.id, "bad_params", "missing startDate or endDate", None),
    };
    if start > end {
        return err(
            &req.id,
            "bad_params",
            "startDate must not be after endDate",
            None,
        );
    }

    let drafts = match req.params.get("terms") {
        Some(raw) if !raw.is_null() => match parse_term_drafts(req, raw, start, end) {
            Ok(v) => v,
            Err(e) => return e,
        },
        _ => match split_year(start, end) {
            Some(v) => v,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "academic year is too short to hold 3 terms",
                    None,
                )
            }
        },
    };

    let year_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO academic_years(id, label, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&year_id, &label, start.to_string(), end.to_string()),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "academic_years" })),
        );
    }

    let mut terms_out = Vec::with_capacity(drafts.len());
    for d in &drafts {
        let term_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO terms(id, academic_year_id, ordinal, start_date, end_date)
             VALUES(?, ?, ?, ?, ?)",
            (
                &term_id,
                &year_id,
                d.ordinal.number(),
                d.start.to_string(),
                d.end.to_string(),
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "terms" })),
            );
        }
        terms_out.push(json!({
            "id": term_id,
            "ordinal": d.ordinal.number(),
            "startDate": d.start.to_string(),
            "endDate": d.end.to_string(),
        }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "academicYearId": year_id,
            "label": label,
            "terms": terms_out,
        }),
    )
}

fn year_terms_json(conn: &Connection, year_id: &str) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, ordinal, start_date, end_date
         FROM terms
         WHERE academic_year_id = ?
         ORDER BY ordinal",
    )?;
    let rows = stmt
        .query_map([year_id], |r| {
            let id: String = r.get(0)?;
            let ordinal: i64 = r.get(1)?;
            let start: String = r.get(2)?;
            let end: String = r.get(3)?;
            Ok(json!({
                "id": id,
                "ordinal": ordinal,
                "startDate": start,
                "endDate": end,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "years": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT y.id, y.label, y.start_date, y.end_date,
           (SELECT COUNT(*) FROM classes c WHERE c.academic_year_id = y.id) AS class_count
         FROM academic_years y
         ORDER BY y.start_date DESC, y.label",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut years = Vec::with_capacity(rows.len());
    for (id, label, start, end, class_count) in rows {
        let terms = match year_terms_json(conn, &id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        years.push(json!({
            "id": id,
            "label": label,
            "startDate": start,
            "endDate": end,
            "classCount": class_count,
            "terms": terms,
        }));
    }
    ok(&req.id, json!({ "years": years }))
}

fn handle_terms_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (start, end) = match (date_param(req, "startDate"), date_param(req, "endDate")) {
        (Ok(Some(s)), Ok(Some(e))) => (s, e),
        (Err(e), _) | (_, Err(e)) => return e,
        _ => return err(&req.id, "bad_params", "missing startDate or endDate", None),
    };
    if start > end {
        return err(
            &req.id,
            "bad_params",
            "startDate must not be after endDate",
            None,
        );
    }

    let year: Option<(String, i64, String, String)> = match conn
        .query_row(
            "SELECT t.academic_year_id, t.ordinal, y.start_date, y.end_date
             FROM terms t
             JOIN academic_years y ON y.id = t.academic_year_id
             WHERE t.id = ?",
            [&term_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((year_id, ordinal, year_start, year_end)) = year else {
        return err(&req.id, "not_found", "term not found", None);
    };
    let (Some(year_start), Some(year_end), Some(term_ordinal)) = (
        gradebook::parse_date(&year_start),
        gradebook::parse_date(&year_end),
        TermOrdinal::from_number(ordinal),
    ) else {
        return err(
            &req.id,
            "bad_data",
            "stored academic year or term is unreadable",
            Some(json!({ "academicYearId": year_id })),
        );
    };
    if start < year_start || end > year_end {
        return outside_year_err(req, term_ordinal, year_start, year_end);
    }

    let siblings = match gradebook::load_year_terms(conn, &year_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let overlaps = siblings
        .iter()
        .filter(|t| t.id != term_id)
        .any(|t| {
            let before = t.ordinal.number() < ordinal;
            if before {
                t.end_date >= start
            } else {
                t.start_date <= end
            }
        });
    if overlaps {
        return err(
            &req.id,
            "bad_params",
            "terms must not overlap and must follow ordinal order",
            Some(json!({ "ordinal": ordinal })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE terms SET start_date = ?, end_date = ? WHERE id = ?",
        (start.to_string(), end.to_string(), &term_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "termId": term_id,
            "ordinal": ordinal,
            "startDate": start.to_string(),
            "endDate": end.to_string(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "terms.update" => Some(handle_terms_update(state, req)),
        _ => None,
    }
}
