use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::calc::TermOrdinal;

/// Slot an evaluation fills in a subject's term formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationKind {
    Homework1,
    Homework2,
    Composition,
    Unclassified,
}

impl EvaluationKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "homework1" => Some(EvaluationKind::Homework1),
            "homework2" => Some(EvaluationKind::Homework2),
            "composition" => Some(EvaluationKind::Composition),
            "unclassified" => Some(EvaluationKind::Unclassified),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationKind::Homework1 => "homework1",
            EvaluationKind::Homework2 => "homework2",
            EvaluationKind::Composition => "composition",
            EvaluationKind::Unclassified => "unclassified",
        }
    }

    fn slot(self) -> Option<usize> {
        match self {
            EvaluationKind::Homework1 => Some(0),
            EvaluationKind::Homework2 => Some(1),
            EvaluationKind::Composition => Some(2),
            EvaluationKind::Unclassified => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationType {
    Homework,
    Composition,
}

impl EvaluationType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "homework" | "devoir" => Some(EvaluationType::Homework),
            "composition" => Some(EvaluationType::Composition),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationType::Homework => "homework",
            EvaluationType::Composition => "composition",
        }
    }
}

/// How an evaluation's kind was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KindSource {
    Explicit,
    Label,
    Positional,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub id: String,
    pub subject_id: String,
    pub term: TermOrdinal,
    pub label: String,
    pub eval_type: EvaluationType,
    pub explicit_kind: Option<EvaluationKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEvaluation {
    pub evaluation_id: String,
    pub subject_id: String,
    #[serde(skip)]
    pub term: TermOrdinal,
    pub kind: EvaluationKind,
    pub source: KindSource,
    pub fallback: bool,
}

/// Canonical label for a kind in a term: term n uses `Devoir (2n-1)`,
/// `Devoir (2n)` and `Composition n`.
pub fn canonical_label(term: TermOrdinal, kind: EvaluationKind) -> Option<String> {
    let n = term.number();
    match kind {
        EvaluationKind::Homework1 => Some(format!("Devoir ({})", 2 * n - 1)),
        EvaluationKind::Homework2 => Some(format!("Devoir ({})", 2 * n)),
        EvaluationKind::Composition => Some(format!("Composition {}", n)),
        EvaluationKind::Unclassified => None,
    }
}

fn normalize_label(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Kind whose canonical label matches `label` for the given term.
pub fn label_kind(term: TermOrdinal, label: &str) -> Option<EvaluationKind> {
    let wanted = normalize_label(label);
    if wanted.is_empty() {
        return None;
    }
    [
        EvaluationKind::Homework1,
        EvaluationKind::Homework2,
        EvaluationKind::Composition,
    ]
    .into_iter()
    .find(|k| {
        canonical_label(term, *k)
            .map(|c| normalize_label(&c) == wanted)
            .unwrap_or(false)
    })
}

/// Assigns a kind to every evaluation, grouped by (subject, term).
///
/// Within a group, explicit kinds claim their slot first, then canonical
/// labels, then the remaining homework-typed evaluations fill homework 1/2
/// and the first remaining composition-typed evaluation fills the
/// composition, in input order. Whatever is left is unclassified. Output is
/// in input order.
pub fn resolve_kinds(records: &[EvaluationRecord]) -> Vec<ResolvedEvaluation> {
    let mut assigned: Vec<Option<(EvaluationKind, KindSource)>> = vec![None; records.len()];

    let mut group_of: HashMap<(&str, TermOrdinal), usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, r) in records.iter().enumerate() {
        let g = *group_of
            .entry((r.subject_id.as_str(), r.term))
            .or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
        groups[g].push(i);
    }

    for members in &groups {
        let mut taken = [false; 3];

        for &i in members {
            let Some(kind) = records[i].explicit_kind else {
                continue;
            };
            match kind.slot() {
                Some(slot) if !taken[slot] => {
                    taken[slot] = true;
                    assigned[i] = Some((kind, KindSource::Explicit));
                }
                Some(_) => {
                    tracing::warn!(
                        evaluation_id = %records[i].id,
                        kind = kind.as_str(),
                        "explicit kind already taken in this subject and term"
                    );
                    assigned[i] = Some((EvaluationKind::Unclassified, KindSource::None));
                }
                None => {
                    assigned[i] = Some((EvaluationKind::Unclassified, KindSource::Explicit));
                }
            }
        }

        for &i in members {
            if assigned[i].is_some() {
                continue;
            }
            let r = &records[i];
            if let Some(kind) = label_kind(r.term, &r.label) {
                if let Some(slot) = kind.slot() {
                    if !taken[slot] {
                        taken[slot] = true;
                        assigned[i] = Some((kind, KindSource::Label));
                    }
                }
            }
        }

        for &i in members {
            if assigned[i].is_some() {
                continue;
            }
            let r = &records[i];
            let candidates: &[EvaluationKind] = match r.eval_type {
                EvaluationType::Homework => &[EvaluationKind::Homework1, EvaluationKind::Homework2],
                EvaluationType::Composition => &[EvaluationKind::Composition],
            };
            let free = candidates
                .iter()
                .copied()
                .find(|k| k.slot().map(|s| !taken[s]).unwrap_or(false));
            if let Some(kind) = free {
                if let Some(slot) = kind.slot() {
                    taken[slot] = true;
                }
                tracing::warn!(
                    evaluation_id = %r.id,
                    label = %r.label,
                    term = r.term.number(),
                    kind = kind.as_str(),
                    "evaluation label is not canonical; kind assigned by position"
                );
                assigned[i] = Some((kind, KindSource::Positional));
            }
        }
    }

    records
        .iter()
        .zip(assigned)
        .map(|(r, a)| {
            let (kind, source) = a.unwrap_or((EvaluationKind::Unclassified, KindSource::None));
            ResolvedEvaluation {
                evaluation_id: r.id.clone(),
                subject_id: r.subject_id.clone(),
                term: r.term,
                kind,
                source,
                fallback: source == KindSource::Positional,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct TermSpan {
    pub id: String,
    pub ordinal: TermOrdinal,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Term of the year whose date range (inclusive) contains `date`.
pub fn term_for_date(terms: &[TermSpan], date: NaiveDate) -> Option<&TermSpan> {
    terms
        .iter()
        .find(|t| t.start_date <= date && date <= t.end_date)
}

/// Evaluation term: explicit reference first, then date membership.
pub fn evaluation_term<'a>(
    terms: &'a [TermSpan],
    term_id: Option<&str>,
    date: Option<NaiveDate>,
) -> Option<&'a TermSpan> {
    if let Some(id) = term_id {
        return terms.iter().find(|t| t.id == id);
    }
    date.and_then(|d| term_for_date(terms, d))
}
