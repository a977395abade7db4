//! Loads one class × one term of grading input from the workspace database.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::calc::{
    AnnotatedScore, ClassTermInput, CoefficientTable, MissingAveragePolicy, RosterEntry,
    SubjectWeight, TermOrdinal,
};
use crate::db;
use crate::evaluations::{
    self, EvaluationKind, EvaluationRecord, EvaluationType, ResolvedEvaluation, TermSpan,
};

pub const POLICY_SETTING_KEY: &str = "grading.missingSubjectPolicy";

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
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
}

fn query_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub term_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct TermRow {
    pub id: String,
    pub academic_year_id: String,
    pub ordinal: TermOrdinal,
}

pub fn load_term(conn: &Connection, term_id: &str) -> Result<TermRow, CalcError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT academic_year_id, ordinal FROM terms WHERE id = ?",
            [term_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((academic_year_id, ordinal)) = row else {
        return Err(CalcError::new("not_found", "term not found"));
    };
    let ordinal = TermOrdinal::from_number(ordinal).ok_or_else(|| {
        CalcError::new("bad_data", "term ordinal out of range")
            .with_details(serde_json::json!({ "ordinal": ordinal }))
    })?;
    Ok(TermRow {
        id: term_id.to_string(),
        academic_year_id,
        ordinal,
    })
}

pub fn load_year_terms(conn: &Connection, academic_year_id: &str) -> Result<Vec<TermSpan>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, ordinal, start_date, end_date
             FROM terms
             WHERE academic_year_id = ?
             ORDER BY ordinal",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([academic_year_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut terms = Vec::with_capacity(rows.len());
    for (id, ordinal, start, end) in rows {
        let (Some(ordinal), Some(start_date), Some(end_date)) = (
            TermOrdinal::from_number(ordinal),
            parse_date(&start),
            parse_date(&end),
        ) else {
            tracing::warn!(term_id = %id, "skipping term with unreadable ordinal or dates");
            continue;
        };
        terms.push(TermSpan {
            id,
            ordinal,
            start_date,
            end_date,
        });
    }
    Ok(terms)
}

pub fn class_year(conn: &Connection, class_id: &str) -> Result<String, CalcError> {
    conn.query_row(
        "SELECT academic_year_id FROM classes WHERE id = ?",
        [class_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| CalcError::new("not_found", "class not found"))
}

/// Class the student is enrolled in for the given academic year.
pub fn student_class(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
) -> Result<String, CalcError> {
    conn.query_row(
        "SELECT class_id FROM enrollments WHERE student_id = ? AND academic_year_id = ?",
        (student_id, academic_year_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| CalcError::new("not_found", "student is not enrolled in this academic year"))
}

pub fn load_roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterEntry>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name, s.last_name
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_id = ?
             ORDER BY e.sort_order, s.last_name, s.first_name",
        )
        .map_err(query_err)?;
    stmt.query_map([class_id], |r| {
        Ok(RosterEntry {
            student_id: r.get(0)?,
            first_name: r.get(1)?,
            last_name: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

/// Subjects taught in the class with their resolved coefficients. Subjects
/// that only appear through evaluations are included with the default
/// coefficient.
pub fn load_subjects(conn: &Connection, class_id: &str) -> Result<Vec<SubjectWeight>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, cs.coefficient
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             WHERE cs.class_id = ?
             ORDER BY cs.sort_order, s.name",
        )
        .map_err(query_err)?;
    let configured: Vec<(String, String, Option<f64>)> = stmt
        .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT s.id, s.name
             FROM evaluations e
             JOIN subjects s ON s.id = e.subject_id
             WHERE e.class_id = ?
               AND s.id NOT IN (SELECT subject_id FROM class_subjects WHERE class_id = ?)
             ORDER BY s.name",
        )
        .map_err(query_err)?;
    let unconfigured: Vec<(String, String)> = stmt
        .query_map((class_id, class_id), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut table = CoefficientTable::default();
    for (subject_id, _, coefficient) in &configured {
        if let Some(c) = coefficient {
            table.insert(class_id, subject_id, *c);
        }
    }

    let subjects = configured
        .into_iter()
        .map(|(id, name, _)| (id, name))
        .chain(unconfigured)
        .map(|(subject_id, name)| SubjectWeight {
            coefficient: table.coefficient(class_id, &subject_id),
            subject_id,
            name,
        })
        .collect();
    Ok(subjects)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationView {
    pub id: String,
    pub subject_id: String,
    pub term_id: String,
    pub term: i64,
    pub date: Option<String>,
    pub label: String,
    #[serde(rename = "type")]
    pub eval_type: EvaluationType,
    pub explicit_kind: Option<EvaluationKind>,
    pub resolved: ResolvedEvaluation,
}

/// Every evaluation of the class whose term can be determined, with its
/// resolved kind, in entry order.
pub fn load_class_evaluations(
    conn: &Connection,
    class_id: &str,
    terms: &[TermSpan],
) -> Result<Vec<EvaluationView>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, subject_id, term_id, date, label, eval_type, kind
             FROM evaluations
             WHERE class_id = ?
             ORDER BY sort_order, rowid",
        )
        .map_err(query_err)?;
    let rows: Vec<(String, String, Option<String>, Option<String>, String, String, Option<String>)> =
        stmt.query_map([class_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut records: Vec<EvaluationRecord> = Vec::with_capacity(rows.len());
    let mut extras: Vec<(String, Option<String>)> = Vec::with_capacity(rows.len());
    for (id, subject_id, term_id, date, label, eval_type, kind) in rows {
        let parsed_date = date.as_deref().and_then(parse_date);
        let Some(term) = evaluations::evaluation_term(terms, term_id.as_deref(), parsed_date) else {
            tracing::warn!(evaluation_id = %id, "evaluation has no resolvable term; skipped");
            continue;
        };
        let Some(eval_type) = EvaluationType::parse(&eval_type) else {
            tracing::warn!(evaluation_id = %id, eval_type = %eval_type, "unknown evaluation type; skipped");
            continue;
        };
        extras.push((term.id.clone(), date));
        records.push(EvaluationRecord {
            id,
            subject_id,
            term: term.ordinal,
            label,
            eval_type,
            explicit_kind: kind.as_deref().and_then(EvaluationKind::parse),
        });
    }

    let resolved = evaluations::resolve_kinds(&records);
    Ok(records
        .into_iter()
        .zip(extras)
        .zip(resolved)
        .map(|((record, (term_id, date)), resolved)| EvaluationView {
            id: record.id,
            subject_id: record.subject_id,
            term_id,
            term: record.term.number(),
            date,
            label: record.label,
            eval_type: record.eval_type,
            explicit_kind: record.explicit_kind,
            resolved,
        })
        .collect())
}

/// Scores of the class's evaluations up to and including `up_to`, in entry
/// order so later entries win when the engine indexes them.
pub fn load_scores(
    conn: &Connection,
    class_id: &str,
    evaluations: &[EvaluationView],
    up_to: TermOrdinal,
) -> Result<Vec<AnnotatedScore>, CalcError> {
    let by_id: HashMap<&str, &ResolvedEvaluation> = evaluations
        .iter()
        .filter(|e| e.resolved.term <= up_to)
        .map(|e| (e.id.as_str(), &e.resolved))
        .collect();

    let mut stmt = conn
        .prepare(
            "SELECT s.evaluation_id, s.student_id, s.value
             FROM scores s
             JOIN evaluations e ON e.id = s.evaluation_id
             WHERE e.class_id = ?
             ORDER BY COALESCE(s.entered_at, ''), s.rowid",
        )
        .map_err(query_err)?;
    let rows: Vec<(String, String, f64)> = stmt
        .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    Ok(rows
        .into_iter()
        .filter_map(|(evaluation_id, student_id, value)| {
            let e = by_id.get(evaluation_id.as_str())?;
            Some(AnnotatedScore {
                student_id,
                subject_id: e.subject_id.clone(),
                term: e.term,
                kind: e.kind,
                value,
            })
        })
        .collect())
}

fn load_term_values<T: rusqlite::types::FromSql>(
    conn: &Connection,
    sql: &str,
    term_id: &str,
    students: &HashSet<&str>,
) -> Result<HashMap<String, T>, CalcError> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let rows: Vec<(String, T)> = stmt
        .query_map([term_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(rows
        .into_iter()
        .filter(|(sid, _)| students.contains(sid.as_str()))
        .collect())
}

/// Stored policy unless the request overrides it.
pub fn resolve_policy(
    conn: &Connection,
    override_policy: Option<MissingAveragePolicy>,
) -> Result<MissingAveragePolicy, CalcError> {
    if let Some(p) = override_policy {
        return Ok(p);
    }
    let stored = db::settings_get_json(conn, POLICY_SETTING_KEY)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    Ok(stored
        .as_ref()
        .and_then(|v| v.as_str())
        .and_then(MissingAveragePolicy::parse)
        .unwrap_or_default())
}

pub fn load_class_term_input(
    ctx: &CalcContext<'_>,
    override_policy: Option<MissingAveragePolicy>,
) -> Result<ClassTermInput, CalcError> {
    let conn = ctx.conn;
    let term = load_term(conn, ctx.term_id)?;
    let year = class_year(conn, ctx.class_id)?;
    if year != term.academic_year_id {
        return Err(CalcError::new(
            "bad_params",
            "term does not belong to the class's academic year",
        )
        .with_details(serde_json::json!({
            "classId": ctx.class_id,
            "termId": ctx.term_id,
        })));
    }

    let terms = load_year_terms(conn, &year)?;
    let roster = load_roster(conn, ctx.class_id)?;
    let subjects = load_subjects(conn, ctx.class_id)?;
    let evaluations = load_class_evaluations(conn, ctx.class_id, &terms)?;
    let scores = load_scores(conn, ctx.class_id, &evaluations, term.ordinal)?;

    let student_ids: HashSet<&str> = roster.iter().map(|s| s.student_id.as_str()).collect();
    let absence_hours: HashMap<String, f64> = load_term_values(
        conn,
        "SELECT student_id, hours FROM term_absences WHERE term_id = ?",
        &term.id,
        &student_ids,
    )?;
    let comments: HashMap<String, String> = load_term_values(
        conn,
        "SELECT student_id, comment FROM bulletin_comments WHERE term_id = ?",
        &term.id,
        &student_ids,
    )?;

    let policy = resolve_policy(conn, override_policy)?;
    tracing::debug!(
        class_id = ctx.class_id,
        term = term.ordinal.number(),
        students = roster.len(),
        subjects = subjects.len(),
        evaluations = evaluations.len(),
        scores = scores.len(),
        "loaded class term input"
    );

    Ok(ClassTermInput {
        class_id: ctx.class_id.to_string(),
        term: term.ordinal,
        roster,
        subjects,
        scores,
        absence_hours,
        comments,
        policy,
    })
}
