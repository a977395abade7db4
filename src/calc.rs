use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::evaluations::EvaluationKind;

pub const DEFAULT_COEFFICIENT: f64 = 1.0;
pub const PASS_THRESHOLD: f64 = 10.0;

/// Two-decimal rounding used for every average shown on a grade sheet or
/// bulletin: `round(100*x) / 100`.
pub fn round_2_decimals(x: f64) -> f64 {
    (100.0 * x).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TermOrdinal {
    First,
    Second,
    Third,
}

impl TermOrdinal {
    pub fn from_number(n: i64) -> Option<Self> {
        match n {
            1 => Some(TermOrdinal::First),
            2 => Some(TermOrdinal::Second),
            3 => Some(TermOrdinal::Third),
            _ => None,
        }
    }

    pub fn number(self) -> i64 {
        match self {
            TermOrdinal::First => 1,
            TermOrdinal::Second => 2,
            TermOrdinal::Third => 3,
        }
    }
}

/// What to do with a subject whose average is undefined when building the
/// general average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingAveragePolicy {
    /// Leave the subject out of both the weighted sum and the denominator.
    #[default]
    Exclude,
    /// Count the subject as 0 with its full coefficient.
    Zero,
}

impl MissingAveragePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exclude" => Some(MissingAveragePolicy::Exclude),
            "zero" => Some(MissingAveragePolicy::Zero),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MissingAveragePolicy::Exclude => "exclude",
            MissingAveragePolicy::Zero => "zero",
        }
    }
}

/// One score with its evaluation already resolved to a subject, term and kind.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedScore {
    pub student_id: String,
    pub subject_id: String,
    pub term: TermOrdinal,
    pub kind: EvaluationKind,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermScores {
    pub homework1: Option<f64>,
    pub homework2: Option<f64>,
    pub composition: Option<f64>,
}

impl TermScores {
    fn set(&mut self, kind: EvaluationKind, value: f64) {
        match kind {
            EvaluationKind::Homework1 => self.homework1 = Some(value),
            EvaluationKind::Homework2 => self.homework2 = Some(value),
            EvaluationKind::Composition => self.composition = Some(value),
            EvaluationKind::Unclassified => {}
        }
    }

    /// Full-precision mean of the two homework scores.
    pub fn homework_average(&self) -> Option<f64> {
        Some((self.homework1? + self.homework2?) / 2.0)
    }
}

/// Scores keyed by (student, subject, term). When the input holds more than
/// one score for the same slot, the one seen last wins.
#[derive(Debug, Clone, Default)]
pub struct ScoreIndex {
    by_slot: HashMap<(String, String, TermOrdinal), TermScores>,
}

impl ScoreIndex {
    pub fn build(scores: &[AnnotatedScore]) -> Self {
        let mut by_slot: HashMap<(String, String, TermOrdinal), TermScores> = HashMap::new();
        for s in scores {
            if s.kind == EvaluationKind::Unclassified {
                continue;
            }
            by_slot
                .entry((s.student_id.clone(), s.subject_id.clone(), s.term))
                .or_default()
                .set(s.kind, s.value);
        }
        Self { by_slot }
    }

    pub fn term_scores(&self, student_id: &str, subject_id: &str, term: TermOrdinal) -> TermScores {
        self.by_slot
            .get(&(student_id.to_string(), subject_id.to_string(), term))
            .copied()
            .unwrap_or_default()
    }

    fn composition(&self, student_id: &str, subject_id: &str, term: TermOrdinal) -> Option<f64> {
        self.term_scores(student_id, subject_id, term).composition
    }
}

/// Compositions of earlier terms that feed the term 2 and term 3 formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CarriedCompositions {
    pub term1: Option<f64>,
    pub term2: Option<f64>,
}

/// Subject average for one term, rounded to 2 decimals. `None` whenever a
/// score the term's formula needs is missing.
pub fn subject_average(
    term: TermOrdinal,
    current: &TermScores,
    carried: &CarriedCompositions,
) -> Option<f64> {
    let homework = current.homework_average()?;
    let composition = current.composition?;
    let raw = match term {
        TermOrdinal::First => (homework * 3.0 + composition) / 4.0,
        TermOrdinal::Second => (homework * 3.0 + composition + carried.term1?) / 5.0,
        TermOrdinal::Third => {
            (homework * 3.0 + composition + carried.term1? + carried.term2?) / 6.0
        }
    };
    Some(round_2_decimals(raw))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectWeight {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
}

/// Per-class subject coefficients.
#[derive(Debug, Clone, Default)]
pub struct CoefficientTable {
    by_pair: HashMap<(String, String), f64>,
}

impl CoefficientTable {
    pub fn insert(&mut self, class_id: &str, subject_id: &str, coefficient: f64) {
        self.by_pair
            .insert((class_id.to_string(), subject_id.to_string()), coefficient);
    }

    /// Missing or unusable entries fall back to 1.
    pub fn coefficient(&self, class_id: &str, subject_id: &str) -> f64 {
        self.by_pair
            .get(&(class_id.to_string(), subject_id.to_string()))
            .copied()
            .filter(|c| c.is_finite() && *c >= 0.0)
            .unwrap_or(DEFAULT_COEFFICIENT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mention {
    Excellent,
    VeryGood,
    Good,
    Fair,
    Encouragement,
    Warning,
}

impl Mention {
    pub fn from_average(average: f64) -> Self {
        if average >= 16.0 {
            Mention::Excellent
        } else if average >= 14.0 {
            Mention::VeryGood
        } else if average >= 12.0 {
            Mention::Good
        } else if average >= 10.0 {
            Mention::Fair
        } else if average >= 8.0 {
            Mention::Encouragement
        } else {
            Mention::Warning
        }
    }

    pub fn appreciation(self) -> &'static str {
        match self {
            Mention::Excellent => "Excellent",
            Mention::VeryGood => "Very good",
            Mention::Good => "Good",
            Mention::Fair => "Fair",
            Mention::Encouragement => "Encouragement",
            Mention::Warning => "Warning",
        }
    }

    /// Label printed in the bulletin's mention box.
    pub fn label(self) -> &'static str {
        match self {
            Mention::Excellent => "Félicitations",
            Mention::VeryGood => "Très Bien",
            Mention::Good => "Bien",
            Mention::Fair => "Assez Bien",
            Mention::Encouragement => "Encouragements",
            Mention::Warning => "Avertissement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Passed,
    Failed,
}

impl Decision {
    pub fn from_average(average: f64) -> Self {
        if average >= PASS_THRESHOLD {
            Decision::Passed
        } else {
            Decision::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_id: String,
    pub subject_name: String,
    pub coefficient: f64,
    pub homework1: Option<f64>,
    pub homework2: Option<f64>,
    pub composition: Option<f64>,
    pub homework_average: Option<f64>,
    pub average: Option<f64>,
    pub weighted_average: Option<f64>,
    pub mention: Option<Mention>,
    pub appreciation: Option<&'static str>,
}

pub fn subject_result(
    index: &ScoreIndex,
    student_id: &str,
    subject: &SubjectWeight,
    term: TermOrdinal,
) -> SubjectResult {
    let current = index.term_scores(student_id, &subject.subject_id, term);
    let carried = CarriedCompositions {
        term1: index.composition(student_id, &subject.subject_id, TermOrdinal::First),
        term2: index.composition(student_id, &subject.subject_id, TermOrdinal::Second),
    };
    let average = subject_average(term, &current, &carried);
    let mention = average.map(Mention::from_average);

    SubjectResult {
        subject_id: subject.subject_id.clone(),
        subject_name: subject.name.clone(),
        coefficient: subject.coefficient,
        homework1: current.homework1,
        homework2: current.homework2,
        composition: current.composition,
        homework_average: current.homework_average().map(round_2_decimals),
        average,
        weighted_average: average.map(|a| round_2_decimals(a * subject.coefficient)),
        mention,
        appreciation: mention.map(Mention::appreciation),
    }
}

pub fn student_subject_results(
    index: &ScoreIndex,
    student_id: &str,
    subjects: &[SubjectWeight],
    term: TermOrdinal,
) -> Vec<SubjectResult> {
    subjects
        .iter()
        .map(|s| subject_result(index, student_id, s, term))
        .collect()
}

/// Coefficient-weighted mean over `(average, coefficient)` pairs, rounded to
/// 2 decimals. `None` when nothing contributes to the denominator.
pub fn weighted_average<I>(parts: I, policy: MissingAveragePolicy) -> Option<f64>
where
    I: IntoIterator<Item = (Option<f64>, f64)>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (average, coefficient) in parts {
        let value = match (average, policy) {
            (Some(v), _) => v,
            (None, MissingAveragePolicy::Zero) => 0.0,
            (None, MissingAveragePolicy::Exclude) => continue,
        };
        sum += value * coefficient;
        denom += coefficient;
    }
    if denom > 0.0 {
        Some(round_2_decimals(sum / denom))
    } else {
        None
    }
}

/// General average of a set of subject results; 0 when no subject has an
/// average.
pub fn general_average(results: &[SubjectResult], policy: MissingAveragePolicy) -> f64 {
    weighted_average(results.iter().map(|r| (r.average, r.coefficient)), policy).unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
    pub student_id: String,
    pub general_average: f64,
    pub position: usize,
    pub rank: String,
}

/// Sorts students by general average, best first. Students without a numeric
/// average are left out; ties keep input order.
pub fn rank_students<'a, I>(averages: I) -> Vec<RankEntry>
where
    I: IntoIterator<Item = (&'a str, Option<f64>)>,
{
    let mut ranked: Vec<(&str, f64)> = averages
        .into_iter()
        .filter_map(|(id, avg)| avg.filter(|v| !v.is_nan()).map(|v| (id, v)))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let total = ranked.len();
    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (id, avg))| RankEntry {
            student_id: id.to_string(),
            general_average: avg,
            position: i + 1,
            rank: format!("{}/{}", i + 1, total),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
}

/// Everything needed to compute one class's bulletins for one term.
#[derive(Debug, Clone)]
pub struct ClassTermInput {
    pub class_id: String,
    pub term: TermOrdinal,
    pub roster: Vec<RosterEntry>,
    pub subjects: Vec<SubjectWeight>,
    pub scores: Vec<AnnotatedScore>,
    pub absence_hours: HashMap<String, f64>,
    pub comments: HashMap<String, String>,
    pub policy: MissingAveragePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub term: i64,
    pub subjects: Vec<SubjectResult>,
    pub total_coefficients: f64,
    pub general_average: f64,
    pub has_average: bool,
    pub rank: Option<String>,
    pub position: Option<usize>,
    pub mention: Mention,
    pub mention_label: &'static str,
    pub appreciation: &'static str,
    pub decision: Decision,
    pub comment: Option<String>,
    pub absence_hours: f64,
    pub class_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub class_size: usize,
    pub ranked_count: usize,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub class_average: Option<f64>,
    pub passed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub class_id: String,
    pub term: i64,
    pub policy: MissingAveragePolicy,
    pub cards: Vec<ReportCard>,
    pub ranking: Vec<RankEntry>,
    pub stats: ClassStats,
}

fn class_stats(class_size: usize, ranking: &[RankEntry]) -> ClassStats {
    let averages: Vec<f64> = ranking.iter().map(|r| r.general_average).collect();
    let class_average = if averages.is_empty() {
        None
    } else {
        Some(round_2_decimals(
            averages.iter().sum::<f64>() / (averages.len() as f64),
        ))
    };
    ClassStats {
        class_size,
        ranked_count: ranking.len(),
        highest: averages.first().copied(),
        lowest: averages.last().copied(),
        class_average,
        passed_count: averages.iter().filter(|a| **a >= PASS_THRESHOLD).count(),
    }
}

/// Computes every student's subject results, general average, rank and
/// mention for one class and term.
pub fn build_class_report(input: &ClassTermInput) -> ClassReport {
    let index = ScoreIndex::build(&input.scores);

    let per_student: Vec<(Vec<SubjectResult>, Option<f64>)> = input
        .roster
        .iter()
        .map(|student| {
            let results =
                student_subject_results(&index, &student.student_id, &input.subjects, input.term);
            let average = weighted_average(
                results.iter().map(|r| (r.average, r.coefficient)),
                input.policy,
            );
            (results, average)
        })
        .collect();

    let ranking = rank_students(
        input
            .roster
            .iter()
            .zip(per_student.iter())
            .map(|(s, (_, avg))| (s.student_id.as_str(), *avg)),
    );
    let rank_by_student: HashMap<&str, &RankEntry> = ranking
        .iter()
        .map(|r| (r.student_id.as_str(), r))
        .collect();

    let class_size = input.roster.len();
    let cards: Vec<ReportCard> = input
        .roster
        .iter()
        .zip(per_student)
        .map(|(student, (subjects, average))| {
            let general = general_average(&subjects, input.policy);
            let mention = Mention::from_average(general);
            let rank = rank_by_student.get(student.student_id.as_str());
            let total_coefficients: f64 = subjects
                .iter()
                .filter(|r| r.average.is_some() || input.policy == MissingAveragePolicy::Zero)
                .map(|r| r.coefficient)
                .sum();
            ReportCard {
                student_id: student.student_id.clone(),
                first_name: student.first_name.clone(),
                last_name: student.last_name.clone(),
                term: input.term.number(),
                subjects,
                total_coefficients,
                general_average: general,
                has_average: average.is_some(),
                rank: rank.map(|r| r.rank.clone()),
                position: rank.map(|r| r.position),
                mention,
                mention_label: mention.label(),
                appreciation: mention.appreciation(),
                decision: Decision::from_average(general),
                comment: input.comments.get(&student.student_id).cloned(),
                absence_hours: input
                    .absence_hours
                    .get(&student.student_id)
                    .copied()
                    .unwrap_or(0.0),
                class_size,
            }
        })
        .collect();

    let stats = class_stats(class_size, &ranking);
    tracing::debug!(
        class_id = %input.class_id,
        term = input.term.number(),
        students = class_size,
        ranked = stats.ranked_count,
        "computed class report"
    );

    ClassReport {
        class_id: input.class_id.clone(),
        term: input.term.number(),
        policy: input.policy,
        cards,
        ranking,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(student: &str, subject: &str, term: TermOrdinal, kind: EvaluationKind, value: f64) -> AnnotatedScore {
        AnnotatedScore {
            student_id: student.to_string(),
            subject_id: subject.to_string(),
            term,
            kind,
            value,
        }
    }

    fn full_term(student: &str, subject: &str, term: TermOrdinal, h1: f64, h2: f64, c: f64) -> Vec<AnnotatedScore> {
        vec![
            score(student, subject, term, EvaluationKind::Homework1, h1),
            score(student, subject, term, EvaluationKind::Homework2, h2),
            score(student, subject, term, EvaluationKind::Composition, c),
        ]
    }

    fn subject(id: &str, coefficient: f64) -> SubjectWeight {
        SubjectWeight {
            subject_id: id.to_string(),
            name: id.to_uppercase(),
            coefficient,
        }
    }

    fn roster(ids: &[&str]) -> Vec<RosterEntry> {
        ids.iter()
            .map(|id| RosterEntry {
                student_id: id.to_string(),
                first_name: format!("First {id}"),
                last_name: format!("Last {id}"),
            })
            .collect()
    }

    #[test]
    fn round_2_decimals_matches_display_rounding() {
        assert_eq!(round_2_decimals(13.75), 13.75);
        assert_eq!(round_2_decimals(62.0 / 6.0), 10.33);
        assert_eq!(round_2_decimals(12.345678), 12.35);
        assert_eq!(round_2_decimals(0.0), 0.0);
    }

    #[test]
    fn term_one_blends_homework_and_composition() {
        let index = ScoreIndex::build(&full_term("s1", "math", TermOrdinal::First, 12.0, 14.0, 16.0));
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::First);
        assert_eq!(r.homework_average, Some(13.0));
        assert_eq!(r.average, Some(13.75));
        assert_eq!(r.mention, Some(Mention::Good));
    }

    #[test]
    fn term_formula_uses_unrounded_homework_mean() {
        // Homework mean 6.375 shows as 6.38; (6.375*3 + 11) / 4 = 7.53125.
        let index = ScoreIndex::build(&full_term("s1", "math", TermOrdinal::First, 0.25, 12.5, 11.0));
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::First);
        assert_eq!(r.homework_average, Some(6.38));
        assert_eq!(r.average, Some(7.53));
    }

    #[test]
    fn term_two_carries_forward_first_composition() {
        let mut scores = full_term("s1", "math", TermOrdinal::Second, 16.0, 18.0, 14.0);
        scores.push(score("s1", "math", TermOrdinal::First, EvaluationKind::Composition, 10.0));
        let index = ScoreIndex::build(&scores);
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::Second);
        assert_eq!(r.homework_average, Some(17.0));
        assert_eq!(r.average, Some(15.0));
    }

    #[test]
    fn term_two_without_first_composition_is_undefined() {
        let index = ScoreIndex::build(&full_term("s1", "math", TermOrdinal::Second, 16.0, 18.0, 14.0));
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::Second);
        assert_eq!(r.average, None);
        assert_eq!(r.mention, None);
        assert_eq!(r.homework_average, Some(17.0));
    }

    #[test]
    fn term_three_needs_both_earlier_compositions() {
        let mut scores = full_term("s1", "math", TermOrdinal::Third, 10.0, 10.0, 10.0);
        scores.push(score("s1", "math", TermOrdinal::First, EvaluationKind::Composition, 10.0));
        let index = ScoreIndex::build(&scores);
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::Third);
        assert_eq!(r.average, None);

        scores.push(score("s1", "math", TermOrdinal::Second, EvaluationKind::Composition, 12.0));
        let index = ScoreIndex::build(&scores);
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::Third);
        assert_eq!(r.average, Some(10.33));
    }

    #[test]
    fn missing_homework_leaves_subject_undefined() {
        let scores = vec![
            score("s1", "math", TermOrdinal::First, EvaluationKind::Homework1, 12.0),
            score("s1", "math", TermOrdinal::First, EvaluationKind::Composition, 16.0),
        ];
        let index = ScoreIndex::build(&scores);
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::First);
        assert_eq!(r.homework_average, None);
        assert_eq!(r.average, None);
        assert_eq!(r.weighted_average, None);
    }

    #[test]
    fn general_average_weights_by_coefficient() {
        let avg = weighted_average(
            vec![(Some(10.0), 1.0), (Some(16.0), 3.0)],
            MissingAveragePolicy::Exclude,
        );
        assert_eq!(avg, Some(14.5));
    }

    #[test]
    fn undefined_subject_is_excluded_from_numerator_and_denominator() {
        let parts = vec![(Some(10.0), 1.0), (Some(16.0), 3.0), (None, 4.0)];
        assert_eq!(
            weighted_average(parts.clone(), MissingAveragePolicy::Exclude),
            Some(14.5)
        );
        // (10 + 48 + 0) / 8
        assert_eq!(
            weighted_average(parts, MissingAveragePolicy::Zero),
            Some(7.25)
        );
    }

    #[test]
    fn general_average_is_zero_without_any_subject_average() {
        let index = ScoreIndex::default();
        let results = student_subject_results(
            &index,
            "s1",
            &[subject("math", 2.0), subject("fr", 1.0)],
            TermOrdinal::First,
        );
        assert_eq!(general_average(&results, MissingAveragePolicy::Exclude), 0.0);
    }

    #[test]
    fn ranking_skips_students_without_average() {
        let ranking = rank_students(vec![
            ("s1", Some(14.5)),
            ("s2", Some(16.0)),
            ("s3", Some(9.0)),
            ("s4", None),
            ("s5", Some(f64::NAN)),
        ]);
        let by_id: HashMap<&str, &str> = ranking
            .iter()
            .map(|r| (r.student_id.as_str(), r.rank.as_str()))
            .collect();
        assert_eq!(ranking.len(), 3);
        assert_eq!(by_id["s1"], "2/3");
        assert_eq!(by_id["s2"], "1/3");
        assert_eq!(by_id["s3"], "3/3");
        assert!(!by_id.contains_key("s4"));
        assert!(!by_id.contains_key("s5"));
    }

    #[test]
    fn ranking_ties_keep_roster_order() {
        let ranking = rank_students(vec![("a", Some(12.0)), ("b", Some(15.0)), ("c", Some(12.0))]);
        let ids: Vec<&str> = ranking.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(ranking[1].rank, "2/3");
        assert_eq!(ranking[2].rank, "3/3");
    }

    #[test]
    fn mention_boundaries_are_inclusive() {
        assert_eq!(Mention::from_average(16.0), Mention::Excellent);
        assert_eq!(Mention::from_average(15.99), Mention::VeryGood);
        assert_eq!(Mention::from_average(14.0), Mention::VeryGood);
        assert_eq!(Mention::from_average(12.0), Mention::Good);
        assert_eq!(Mention::from_average(10.0), Mention::Fair);
        assert_eq!(Mention::from_average(8.0), Mention::Encouragement);
        assert_eq!(Mention::from_average(7.99), Mention::Warning);
        assert_eq!(Mention::Excellent.label(), "Félicitations");
        assert_eq!(Mention::VeryGood.appreciation(), "Very good");
    }

    #[test]
    fn decision_threshold_is_ten() {
        assert_eq!(Decision::from_average(10.0), Decision::Passed);
        assert_eq!(Decision::from_average(9.99), Decision::Failed);
    }

    #[test]
    fn missing_coefficient_defaults_to_one() {
        let mut table = CoefficientTable::default();
        table.insert("c1", "math", 4.0);
        table.insert("c1", "art", f64::NAN);
        assert_eq!(table.coefficient("c1", "math"), 4.0);
        assert_eq!(table.coefficient("c2", "math"), 1.0);
        assert_eq!(table.coefficient("c1", "history"), 1.0);
        assert_eq!(table.coefficient("c1", "art"), 1.0);
    }

    #[test]
    fn duplicate_scores_last_seen_wins() {
        let scores = vec![
            score("s1", "math", TermOrdinal::First, EvaluationKind::Homework1, 4.0),
            score("s1", "math", TermOrdinal::First, EvaluationKind::Homework2, 14.0),
            score("s1", "math", TermOrdinal::First, EvaluationKind::Composition, 16.0),
            score("s1", "math", TermOrdinal::First, EvaluationKind::Homework1, 12.0),
        ];
        let index = ScoreIndex::build(&scores);
        assert_eq!(
            index.term_scores("s1", "math", TermOrdinal::First).homework1,
            Some(12.0)
        );
    }

    #[test]
    fn unclassified_scores_are_ignored() {
        let mut scores = full_term("s1", "math", TermOrdinal::First, 12.0, 14.0, 16.0);
        scores.push(score("s1", "math", TermOrdinal::First, EvaluationKind::Unclassified, 0.0));
        let index = ScoreIndex::build(&scores);
        let r = subject_result(&index, "s1", &subject("math", 1.0), TermOrdinal::First);
        assert_eq!(r.average, Some(13.75));
    }

    fn sample_input() -> ClassTermInput {
        let mut scores = Vec::new();
        // s1: math 10, french 16
        scores.extend(full_term("s1", "math", TermOrdinal::First, 10.0, 10.0, 10.0));
        scores.extend(full_term("s1", "fr", TermOrdinal::First, 16.0, 16.0, 16.0));
        // s2: math 16 only, french missing its composition
        scores.extend(full_term("s2", "math", TermOrdinal::First, 16.0, 16.0, 16.0));
        scores.push(score("s2", "fr", TermOrdinal::First, EvaluationKind::Homework1, 20.0));
        scores.push(score("s2", "fr", TermOrdinal::First, EvaluationKind::Homework2, 20.0));
        // s3: nothing entered

        let mut absence_hours = HashMap::new();
        absence_hours.insert("s1".to_string(), 3.5);
        let mut comments = HashMap::new();
        comments.insert("s2".to_string(), "Keep going".to_string());

        ClassTermInput {
            class_id: "c1".to_string(),
            term: TermOrdinal::First,
            roster: roster(&["s1", "s2", "s3"]),
            subjects: vec![subject("math", 1.0), subject("fr", 3.0)],
            scores,
            absence_hours,
            comments,
            policy: MissingAveragePolicy::Exclude,
        }
    }

    #[test]
    fn class_report_ranks_and_fills_cards() {
        let report = build_class_report(&sample_input());
        let s1 = &report.cards[0];
        let s2 = &report.cards[1];
        let s3 = &report.cards[2];

        assert_eq!(s1.general_average, 14.5);
        assert_eq!(s1.total_coefficients, 4.0);
        assert_eq!(s1.rank.as_deref(), Some("2/2"));
        assert_eq!(s1.mention, Mention::VeryGood);
        assert_eq!(s1.absence_hours, 3.5);

        assert_eq!(s2.general_average, 16.0);
        assert_eq!(s2.total_coefficients, 1.0);
        assert_eq!(s2.rank.as_deref(), Some("1/2"));
        assert_eq!(s2.mention_label, "Félicitations");
        assert_eq!(s2.comment.as_deref(), Some("Keep going"));

        assert_eq!(s3.general_average, 0.0);
        assert!(!s3.has_average);
        assert_eq!(s3.rank, None);
        assert_eq!(s3.decision, Decision::Failed);
        assert_eq!(s3.class_size, 3);

        assert_eq!(report.stats.ranked_count, 2);
        assert_eq!(report.stats.highest, Some(16.0));
        assert_eq!(report.stats.lowest, Some(14.5));
        assert_eq!(report.stats.class_average, Some(15.25));
        assert_eq!(report.stats.passed_count, 2);
    }

    #[test]
    fn zero_policy_counts_missing_subjects() {
        let mut input = sample_input();
        input.policy = MissingAveragePolicy::Zero;
        let report = build_class_report(&input);
        // s2: (16*1 + 0*3) / 4
        assert_eq!(report.cards[1].general_average, 4.0);
        // s3 now has a numeric (zero) average and is ranked last.
        assert_eq!(report.cards[2].rank.as_deref(), Some("3/3"));
    }

    #[test]
    fn class_report_is_deterministic() {
        let input = sample_input();
        let a = build_class_report(&input);
        let b = build_class_report(&input);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).expect("serialize"),
            serde_json::to_string(&b).expect("serialize")
        );
    }
}
