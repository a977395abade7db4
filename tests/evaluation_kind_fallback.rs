mod test_support;

use serde_json::json;
use test_support::{table_row, School};

fn resolved<'a>(list: &'a serde_json::Value, evaluation_id: &str) -> &'a serde_json::Value {
    list["evaluations"]
        .as_array()
        .and_then(|evals| {
            evals
                .iter()
                .find(|e| e["id"].as_str() == Some(evaluation_id))
        })
        .map(|e| &e["resolved"])
        .unwrap_or_else(|| panic!("evaluation {} not listed", evaluation_id))
}

#[test]
fn non_canonical_labels_fall_back_to_position_and_are_flagged() {
    let mut school = School::open("bulletind-kind-fallback");
    let maths = school.subject("Mathématiques", Some(1.0));
    let student = school.student("Fatou", "Ndiaye");

    let interro = school.evaluation(&maths, 1, "Interrogation", "homework");
    let devoir2 = school.evaluation(&maths, 1, "devoir 2", "homework");
    let examen = school.evaluation(&maths, 1, "Examen", "composition");
    let extra = school.evaluation(&maths, 1, "Exposé", "homework");

    let class_id = school.class_id.clone();
    let term_id = school.term(1);
    let list = school.ok(
        "evaluations.list",
        json!({ "classId": class_id, "termId": term_id }),
    );
    assert_eq!(list["fallbackCount"].as_u64(), Some(2));

    let r = resolved(&list, &devoir2);
    assert_eq!(r["kind"].as_str(), Some("homework2"));
    assert_eq!(r["source"].as_str(), Some("label"));
    assert_eq!(r["fallback"].as_bool(), Some(false));

    let r = resolved(&list, &interro);
    assert_eq!(r["kind"].as_str(), Some("homework1"));
    assert_eq!(r["source"].as_str(), Some("positional"));
    assert_eq!(r["fallback"].as_bool(), Some(true));

    let r = resolved(&list, &examen);
    assert_eq!(r["kind"].as_str(), Some("composition"));
    assert_eq!(r["fallback"].as_bool(), Some(true));

    let r = resolved(&list, &extra);
    assert_eq!(r["kind"].as_str(), Some("unclassified"));
    assert_eq!(r["source"].as_str(), Some("none"));

    school.score(&interro, &student, 10.0);
    school.score(&devoir2, &student, 14.0);
    school.score(&examen, &student, 12.0);
    school.score(&extra, &student, 2.0);

    // Unclassified scores do not enter the formula: (12*3 + 12) / 4.
    let table = school.subject_table(&maths, 1);
    let row = &table_row(&table, &student)["result"];
    assert_eq!(row["homework1"].as_f64(), Some(10.0));
    assert_eq!(row["homework2"].as_f64(), Some(14.0));
    assert_eq!(row["composition"].as_f64(), Some(12.0));
    assert_eq!(row["average"].as_f64(), Some(12.0));
}

#[test]
fn explicit_kind_wins_over_label() {
    let mut school = School::open("bulletind-kind-explicit");
    let french = school.subject("Français", Some(2.0));
    let student = school.student("Issa", "Ouédraogo");
    let class_id = school.class_id.clone();
    let term_id = school.term(1);

    let created = school.ok(
        "evaluations.create",
        json!({
            "classId": class_id.clone(),
            "subjectId": french.clone(),
            "termId": term_id.clone(),
            "label": "Devoir (1)",
            "type": "homework",
            "kind": "homework2",
        }),
    );
    let labelled_second = created["evaluationId"].as_str().expect("id").to_string();
    let quiz = school.evaluation(&french, 1, "Quiz", "homework");
    let compo = school.evaluation(&french, 1, "Composition 1", "composition");

    let list = school.ok(
        "evaluations.list",
        json!({ "classId": class_id.clone(), "subjectId": french.clone() }),
    );
    let r = resolved(&list, &labelled_second);
    assert_eq!(r["kind"].as_str(), Some("homework2"));
    assert_eq!(r["source"].as_str(), Some("explicit"));
    let r = resolved(&list, &quiz);
    assert_eq!(r["kind"].as_str(), Some("homework1"));
    assert_eq!(r["fallback"].as_bool(), Some(true));
    let r = resolved(&list, &compo);
    assert_eq!(r["kind"].as_str(), Some("composition"));
    assert_eq!(r["source"].as_str(), Some("label"));
    assert_eq!(list["fallbackCount"].as_u64(), Some(1));

    school.score(&labelled_second, &student, 8.0);
    school.score(&quiz, &student, 18.0);
    school.score(&compo, &student, 11.0);
    let table = school.subject_table(&french, 1);
    let row = &table_row(&table, &student)["result"];
    assert_eq!(row["homework1"].as_f64(), Some(18.0));
    assert_eq!(row["homework2"].as_f64(), Some(8.0));
    // (13*3 + 11) / 4
    assert_eq!(row["average"].as_f64(), Some(12.5));

    let code = school.err_code(
        "evaluations.create",
        json!({
            "classId": class_id,
            "subjectId": french,
            "termId": term_id,
            "label": "Devoir (2)",
            "type": "homework",
            "kind": "homework3",
        }),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn term_labels_only_match_their_own_term() {
    let mut school = School::open("bulletind-kind-term-labels");
    let maths = school.subject("Mathématiques", Some(1.0));

    // "Devoir (3)" is canonical in term 2, not in term 1.
    let misplaced = school.evaluation(&maths, 1, "Devoir (3)", "homework");
    let class_id = school.class_id.clone();
    let list = school.ok("evaluations.list", json!({ "classId": class_id }));
    let r = resolved(&list, &misplaced);
    assert_eq!(r["kind"].as_str(), Some("homework1"));
    assert_eq!(r["source"].as_str(), Some("positional"));
}
