use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_klassenbuchd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn klassenbuchd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
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

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn imported_points_grade_through_the_assigned_scale() {
    let workspace = temp_dir("klassenbuch-performance-scoring");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "10f" }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "firstName": "Jane",
            "lastName": "Doe",
            "classId": class["id"]
        }),
    );
    let student_id = student["id"].as_str().expect("student id").to_string();

    let scale = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scales.create",
        json!({
            "name": "Single band",
            "definition": "2.0;79.0;86.0"
        }),
    );
    assert_eq!(scale["bandCount"].as_i64(), Some(1));

    let perf = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "performance.create",
        json!({
            "type": "Klassenarbeit",
            "date": "2025-09-10",
            "classId": class["id"],
            "maxOpPoints": 5,
            "taskMaxPoints": [10, 10]
        }),
    );
    let perf_id = perf["id"].as_str().expect("performance id").to_string();
    let template = perf["csvTemplate"].as_str().expect("csv template");
    assert!(template.starts_with("StudentID;LastName;FirstName;Task1;Task2;OP;ZP"));

    // Without a scale the student is not scorable yet.
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "performance.open",
        json!({ "id": perf_id }),
    );
    assert!(detail["students"][0]["score"].is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "performance.assignScale",
        json!({ "id": perf_id, "scaleId": scale["id"] }),
    );

    let csv = format!(
        "StudentID;LastName;FirstName;Task1;Task2;OP;ZP\n{};Doe;Jane;8;7;2;0",
        student_id
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "performance.import",
        json!({ "id": perf_id, "csvData": csv }),
    );
    assert_eq!(imported["importedRows"].as_i64(), Some(1));

    // 17 of 20 points -> 85% -> band [79, 86) -> "2.0".
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "performance.open",
        json!({ "id": perf_id }),
    );
    let row = &detail["students"][0];
    assert_eq!(row["totalPoints"].as_f64(), Some(17.0));
    assert_eq!(row["score"]["totalPoints"].as_f64(), Some(17.0));
    assert_eq!(row["score"]["percentage"].as_f64(), Some(85.0));
    assert_eq!(row["score"]["grade"].as_str(), Some("2.0"));
    assert_eq!(detail["totalMaxPoints"].as_f64(), Some(20.0));

    // Manual edits flag the touched fields and recompute immediately.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "performance.updateStudentScores",
        json!({
            "id": perf_id,
            "studentId": student_id,
            "scores": { "opPoints": 3.0, "tasks": { "1": 7.0 } }
        }),
    );
    assert_eq!(updated["score"]["totalPoints"].as_f64(), Some(17.0));
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "performance.open",
        json!({ "id": perf_id }),
    );
    let row = &detail["students"][0];
    assert_eq!(row["opIsEdited"].as_bool(), Some(true));
    assert_eq!(row["zpIsEdited"].as_bool(), Some(false));
    assert_eq!(row["tasks"]["1"]["isEdited"].as_bool(), Some(true));
    assert_eq!(row["tasks"]["2"]["isEdited"].as_bool(), Some(false));

    // A manual override wins over the computed grade.
    let overridden = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "performance.setOverride",
        json!({
            "id": perf_id,
            "studentId": student_id,
            "override": 1.0,
            "comment": "oral exam"
        }),
    );
    assert_eq!(overridden["score"]["grade"].as_str(), Some("1.0"));

    // The audit trail recorded the mutating steps.
    let log = request_ok(&mut stdin, &mut reader, "13", "log.list", json!({}));
    let fields: Vec<&str> = log["entries"]
        .as_array()
        .expect("log entries")
        .iter()
        .filter_map(|e| e["fieldName"].as_str())
        .collect();
    assert!(fields.contains(&"grade_override"));
    assert!(fields.contains(&"op_points"));
    assert!(fields.contains(&"import"));

    let _ = child.kill();
}
