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
fn second_import_replaces_every_prior_row() {
    let workspace = temp_dir("klassenbuch-import-replace");
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
        json!({ "name": "9if" }),
    );
    let mut student_ids = Vec::new();
    for (i, (first, last)) in [("John", "Smith"), ("Jane", "Doe")].iter().enumerate() {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({
                "firstName": first,
                "lastName": last,
                "classId": class["id"]
            }),
        );
        student_ids.push(student["id"].as_str().expect("student id").to_string());
    }

    let perf = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "performance.create",
        json!({
            "type": "Test",
            "date": "2025-10-01",
            "classId": class["id"],
            "taskMaxPoints": [10, 10]
        }),
    );
    let perf_id = perf["id"].as_str().expect("performance id").to_string();

    let first_csv = format!(
        "StudentID;LastName;FirstName;Task1;Task2;OP;ZP\n{};Smith;John;5;5;1;1\n{};Doe;Jane;6;6;0;0",
        student_ids[0], student_ids[1]
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "performance.import",
        json!({ "id": perf_id, "csvData": first_csv }),
    );
    assert_eq!(imported["importedRows"].as_i64(), Some(2));

    // The second import covers only one student; the other's rows must not
    // survive the replace.
    let second_csv = format!(
        "StudentID;LastName;FirstName;Task1;Task2;OP;ZP\n{};Smith;John;9;8;2;0",
        student_ids[0]
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "performance.import",
        json!({ "id": perf_id, "csvData": second_csv }),
    );
    assert_eq!(imported["importedRows"].as_i64(), Some(1));

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "performance.open",
        json!({ "id": perf_id }),
    );
    let students = detail["students"].as_array().expect("students");
    let smith = students
        .iter()
        .find(|s| s["lastName"].as_str() == Some("Smith"))
        .expect("smith row");
    let doe = students
        .iter()
        .find(|s| s["lastName"].as_str() == Some("Doe"))
        .expect("doe row");

    assert_eq!(smith["totalPoints"].as_f64(), Some(19.0));
    assert_eq!(smith["tasks"]["1"]["points"].as_f64(), Some(9.0));
    assert_eq!(smith["opPoints"].as_f64(), Some(2.0));

    // Jane kept her roster slot but has no recorded points at all.
    assert_eq!(doe["totalPoints"].as_f64(), Some(0.0));
    assert_eq!(doe["tasks"].as_object().map(|m| m.len()), Some(0));
    assert_eq!(doe["opPoints"].as_f64(), Some(0.0));

    let _ = child.kill();
}
