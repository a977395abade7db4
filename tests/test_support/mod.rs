#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let value = read_response(reader);
    assert_eq!(
        value.get("id").and_then(|v| v.as_str()),
        Some(id),
        "response id mismatch for {}",
        method
    );
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

/// Error code of a request that is expected to fail.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string field {} in {}", key, v))
        .to_string()
}

/// A sidecar with a workspace open, one academic year (three terms) and one
/// class in it.
pub struct School {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    pub workspace: PathBuf,
    pub year_id: String,
    pub term_ids: [String; 3],
    pub class_id: String,
    seq: u32,
}

impl School {
    pub fn open(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "setup-1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        let year = request_ok(
            &mut stdin,
            &mut reader,
            "setup-2",
            "years.create",
            json!({
                "label": "2025-2026",
                "startDate": "2025-09-01",
                "endDate": "2026-06-30",
                "terms": [
                    { "ordinal": 1, "startDate": "2025-09-01", "endDate": "2025-12-20" },
                    { "ordinal": 2, "startDate": "2026-01-05", "endDate": "2026-03-31" },
                    { "ordinal": 3, "startDate": "2026-04-01", "endDate": "2026-06-30" }
                ]
            }),
        );
        let year_id = str_field(&year, "academicYearId");
        let terms = year
            .get("terms")
            .and_then(|v| v.as_array())
            .expect("terms")
            .clone();
        assert_eq!(terms.len(), 3);
        let term_ids = [
            str_field(&terms[0], "id"),
            str_field(&terms[1], "id"),
            str_field(&terms[2], "id"),
        ];
        let class = request_ok(
            &mut stdin,
            &mut reader,
            "setup-3",
            "classes.create",
            json!({ "name": "6e A", "academicYearId": year_id.clone() }),
        );
        let class_id = str_field(&class, "classId");

        School {
            child,
            stdin,
            reader,
            workspace,
            year_id,
            term_ids,
            class_id,
            seq: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.seq += 1;
        format!("r{}", self.seq)
    }

    pub fn term(&self, ordinal: usize) -> String {
        self.term_ids[ordinal - 1].clone()
    }

    pub fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let id = self.next_id();
        let error = request_err(&mut self.stdin, &mut self.reader, &id, method, params);
        str_field(&error, "code")
    }

    /// Creates a subject and attaches it to the class.
    pub fn subject(&mut self, name: &str, coefficient: Option<f64>) -> String {
        let created = self.ok("subjects.create", json!({ "name": name }));
        let subject_id = str_field(&created, "subjectId");
        let class_id = self.class_id.clone();
        let _ = self.ok(
            "classSubjects.set",
            json!({
                "classId": class_id,
                "subjectId": subject_id.clone(),
                "coefficient": coefficient,
            }),
        );
        subject_id
    }

    pub fn student(&mut self, first: &str, last: &str) -> String {
        let class_id = self.class_id.clone();
        let created = self.ok(
            "students.create",
            json!({ "classId": class_id, "firstName": first, "lastName": last }),
        );
        str_field(&created, "studentId")
    }

    pub fn evaluation(&mut self, subject_id: &str, term: usize, label: &str, kind_type: &str) -> String {
        let class_id = self.class_id.clone();
        let term_id = self.term(term);
        let created = self.ok(
            "evaluations.create",
            json!({
                "classId": class_id,
                "subjectId": subject_id,
                "termId": term_id,
                "label": label,
                "type": kind_type,
            }),
        );
        str_field(&created, "evaluationId")
    }

    /// Canonical homework 1, homework 2 and composition for one term.
    pub fn canonical_evaluations(&mut self, subject_id: &str, term: usize) -> [String; 3] {
        let n = term;
        [
            self.evaluation(subject_id, term, &format!("Devoir ({})", 2 * n - 1), "homework"),
            self.evaluation(subject_id, term, &format!("Devoir ({})", 2 * n), "homework"),
            self.evaluation(subject_id, term, &format!("Composition {}", n), "composition"),
        ]
    }

    pub fn score(&mut self, evaluation_id: &str, student_id: &str, value: f64) {
        let _ = self.ok(
            "grades.upsert",
            json!({ "evaluationId": evaluation_id, "studentId": student_id, "value": value }),
        );
    }

    /// Scores one student on the three evaluations returned by
    /// `canonical_evaluations`.
    pub fn scores(&mut self, evals: &[String; 3], student_id: &str, values: [f64; 3]) {
        let edits: Vec<serde_json::Value> = evals
            .iter()
            .zip(values)
            .map(|(e, v)| json!({ "evaluationId": e, "studentId": student_id, "value": v }))
            .collect();
        let res = self.ok("grades.bulkUpsert", json!({ "edits": edits }));
        assert_eq!(res.get("updated").and_then(|v| v.as_u64()), Some(3));
    }

    pub fn bulletin(&mut self, student_id: &str, term: usize, policy: Option<&str>) -> serde_json::Value {
        let term_id = self.term(term);
        let mut params = json!({ "studentId": student_id, "termId": term_id });
        if let Some(p) = policy {
            params["missingSubjectPolicy"] = json!(p);
        }
        self.ok("reports.bulletin", params)
    }

    pub fn subject_table(&mut self, subject_id: &str, term: usize) -> serde_json::Value {
        let class_id = self.class_id.clone();
        let term_id = self.term(term);
        self.ok(
            "grades.subjectTable",
            json!({ "classId": class_id, "termId": term_id, "subjectId": subject_id }),
        )
    }
}

/// Row of a subject table for one student.
pub fn table_row<'a>(table: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    table
        .get("rows")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        })
        .unwrap_or_else(|| panic!("no row for {} in {}", student_id, table))
}

/// Subject entry of a bulletin.
pub fn bulletin_subject<'a>(bulletin: &'a serde_json::Value, subject_id: &str) -> &'a serde_json::Value {
    bulletin
        .get("bulletin")
        .and_then(|b| b.get("subjects"))
        .and_then(|v| v.as_array())
        .and_then(|subjects| {
            subjects
                .iter()
                .find(|s| s.get("subjectId").and_then(|v| v.as_str()) == Some(subject_id))
        })
        .unwrap_or_else(|| panic!("no subject {} in {}", subject_id, bulletin))
}
