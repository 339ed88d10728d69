use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Config, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

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

fn db_query_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn subject_name(conn: &Connection, subject_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT name FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query_failed)?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "subject not found".to_string(),
        details: None,
    })
}

fn roster(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(String, Vec<(String, String, String)>), HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let course_id = params.get("courseId").and_then(|v| v.as_str());

    let (group_sql, students_sql, key) = if let Some(course_id) = course_id {
        (
            "SELECT name FROM courses WHERE id = ?",
            "SELECT id, first_name, last_name FROM students
             WHERE course_id = ? ORDER BY last_name, first_name",
            course_id,
        )
    } else if let Some(class_id) = class_id {
        (
            "SELECT name FROM classes WHERE id = ?",
            "SELECT id, first_name, last_name FROM students
             WHERE class_id = ? ORDER BY last_name, first_name",
            class_id,
        )
    } else {
        return Err(bad_params("either classId or courseId is required"));
    };

    let group_name: String = conn
        .query_row(group_sql, [key], |r| r.get(0))
        .optional()
        .map_err(db_query_failed)?
        .unwrap_or_default();
    let mut stmt = conn.prepare(students_sql).map_err(db_query_failed)?;
    let students = stmt
        .query_map([key], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    Ok((group_name, students))
}

fn capture_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_str(params, "date")?;
    let period = get_required_i64(params, "period")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let subject = subject_name(conn, &subject_id)?;
    let (group_name, students) = roster(conn, params)?;

    // Late shows as its own state even though it is stored as present.
    let mut attendance: HashMap<String, serde_json::Value> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, status, absent_minutes, late_minutes
             FROM attendance_records WHERE date = ? AND period = ?",
        )
        .map_err(db_query_failed)?;
    let rows: Vec<(String, String, i64, i64)> = stmt
        .query_map((&date, period), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    for (student_id, status, absent_minutes, late_minutes) in rows {
        let display_status = if late_minutes > 0 { "late" } else { status.as_str() };
        attendance.insert(
            student_id,
            json!({
                "status": display_status,
                "absentMinutes": absent_minutes,
                "lateMinutes": late_minutes
            }),
        );
    }

    let mut grades: HashMap<String, serde_json::Value> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, grade, comment FROM grade_records
             WHERE date = ? AND period = ? AND subject = ?",
        )
        .map_err(db_query_failed)?;
    let rows: Vec<(String, Option<f64>, Option<String>)> = stmt
        .query_map((&date, period, &subject), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    for (student_id, grade, comment) in rows {
        grades.insert(student_id, json!({ "grade": grade, "comment": comment }));
    }

    let students_json: Vec<serde_json::Value> = students
        .iter()
        .map(|(id, first, last)| {
            json!({
                "id": id,
                "firstName": first,
                "lastName": last,
                "attendance": attendance.get(id),
                "gradeRecord": grades.get(id)
            })
        })
        .collect();

    Ok(json!({
        "date": date,
        "period": period,
        "subjectName": subject,
        "groupName": group_name,
        "students": students_json
    }))
}

/// Attendance cell values: "present", "absent", or "late_<minutes>".
fn parse_attendance(value: &str) -> Result<(String, i64), HandlerErr> {
    match value {
        "present" => Ok(("present".to_string(), 0)),
        "absent" => Ok(("absent".to_string(), 0)),
        v if v.starts_with("late_") => {
            let minutes = v["late_".len()..].parse::<i64>().unwrap_or(0);
            Ok(("present".to_string(), minutes))
        }
        other => Err(bad_params(format!("unknown attendance value: {}", other))),
    }
}

fn capture_save(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_str(params, "date")?;
    let period = get_required_i64(params, "period")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let subject = subject_name(conn, &subject_id)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing entries"));
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            continue;
        };

        if let Some(att) = entry.get("attendance").and_then(|v| v.as_str()) {
            let (status, late_minutes) = parse_attendance(att)?;
            let absent_minutes = if status == "absent" {
                config.lesson_minutes
            } else {
                0
            };
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM attendance_records
                     WHERE student_id = ? AND date = ? AND period = ?",
                    (student_id, &date, period),
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_query_failed)?;
            match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE attendance_records
                         SET status = ?, absent_minutes = ?, late_minutes = ? WHERE id = ?",
                        (&status, absent_minutes, late_minutes, &id),
                    )
                    .map_err(|e| HandlerErr {
                        code: "db_update_failed",
                        message: e.to_string(),
                        details: Some(json!({ "table": "attendance_records" })),
                    })?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO attendance_records(id, student_id, date, period, status, absent_minutes, late_minutes)
                         VALUES(?,?,?,?,?,?,?)",
                        (
                            Uuid::new_v4().to_string(),
                            student_id,
                            &date,
                            period,
                            &status,
                            absent_minutes,
                            late_minutes,
                        ),
                    )
                    .map_err(|e| HandlerErr {
                        code: "db_insert_failed",
                        message: e.to_string(),
                        details: Some(json!({ "table": "attendance_records" })),
                    })?;
                }
            }
        }

        let grade = entry.get("grade").and_then(|v| v.as_f64());
        let comment = entry
            .get("comment")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let existing_grade: Option<String> = tx
            .query_row(
                "SELECT id FROM grade_records
                 WHERE student_id = ? AND date = ? AND period = ? AND subject = ?",
                (student_id, &date, period, &subject),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_query_failed)?;

        if grade.is_some() || comment.is_some() {
            match existing_grade {
                Some(id) => {
                    tx.execute(
                        "UPDATE grade_records SET grade = ?, comment = ? WHERE id = ?",
                        (grade, &comment, &id),
                    )
                    .map_err(|e| HandlerErr {
                        code: "db_update_failed",
                        message: e.to_string(),
                        details: Some(json!({ "table": "grade_records" })),
                    })?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO grade_records(id, student_id, date, period, type, subject, grade, comment)
                         VALUES(?,?,?,?,'spontaneous',?,?,?)",
                        (
                            Uuid::new_v4().to_string(),
                            student_id,
                            &date,
                            period,
                            &subject,
                            grade,
                            &comment,
                        ),
                    )
                    .map_err(|e| HandlerErr {
                        code: "db_insert_failed",
                        message: e.to_string(),
                        details: Some(json!({ "table": "grade_records" })),
                    })?;
                }
            }
        } else if let Some(id) = existing_grade {
            // A cleared form row removes the stored record.
            tx.execute("DELETE FROM grade_records WHERE id = ?", [&id])
                .map_err(|e| HandlerErr {
                    code: "db_delete_failed",
                    message: e.to_string(),
                    details: None,
                })?;
        }
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(req.method.as_str(), "capture.open" | "capture.save");
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "capture.open" => capture_open(conn, &req.params),
        "capture.save" => capture_save(conn, &state.config, &req.params),
        _ => unreachable!(),
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}
