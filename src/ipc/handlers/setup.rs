use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

/// Group names uppercase their letter suffix: "10f" -> "10F", "7sw" -> "7SW".
/// Names outside the grade+suffix shape just uppercase their letters.
fn normalize_group_name(name: &str) -> String {
    let name = name.trim();
    let digits_end = name
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(name.len());
    let (grade, suffix) = name.split_at(digits_end);
    if !grade.is_empty() && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_alphabetic()) {
        return format!("{}{}", grade, suffix.to_ascii_uppercase());
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphabetic() {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

fn get_or_create_named(
    conn: &Connection,
    table: &str,
    name: &str,
) -> Result<(String, String), HandlerErr> {
    let norm = normalize_group_name(name);
    if norm.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let existing: Option<String> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE LOWER(name) = LOWER(?)", table),
            [&norm],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_failed)?;
    if let Some(id) = existing {
        return Ok((id, norm));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        &format!("INSERT INTO {}(id, name) VALUES(?, ?)", table),
        (&id, &norm),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": table })),
    })?;
    let _ = audit::record(conn, "manual", table, Some(&id), "create", "", &norm, None);
    Ok((id, norm))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let (id, norm) = get_or_create_named(conn, "classes", &name)?;
    Ok(json!({ "id": id, "name": norm }))
}

fn courses_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let (id, norm) = get_or_create_named(conn, "courses", &name)?;
    Ok(json!({ "id": id, "name": norm }))
}

fn classes_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM classes ORDER BY name ASC")
        .map_err(db_query_failed)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    Ok(json!({ "classes": rows }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE LOWER(name) = LOWER(?)",
            [&name],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_failed)?;
    if let Some(id) = existing {
        return Ok(json!({ "id": id, "name": name }));
    }

    let short = params
        .get("short")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            name.to_ascii_uppercase()
                .chars()
                .take(8)
                .collect::<String>()
        });

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, short) VALUES(?, ?, ?)",
        (&id, &name, &short),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })?;
    let _ = audit::record(conn, "manual", "subjects", Some(&id), "create", "", &name, None);
    Ok(json!({ "id": id, "name": name, "short": short }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let first = get_required_str(params, "firstName")?;
    let last = get_required_str(params, "lastName")?;
    let class_id = get_required_str(params, "classId")?;
    let course_id = params
        .get("courseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let class_exists: bool = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(db_query_failed)?
        .is_some();
    if !class_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, first_name, last_name, class_id, course_id) VALUES(?,?,?,?,?)",
        (&id, &first, &last, &class_id, &course_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;
    let _ = audit::record(
        conn,
        "manual",
        "students",
        Some(&id),
        "create",
        "",
        &format!("{} {}", first, last),
        None,
    );
    Ok(json!({ "id": id }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let course_id = params.get("courseId").and_then(|v| v.as_str());

    let (sql, key) = match (class_id, course_id) {
        (Some(class_id), _) => (
            "SELECT id, first_name, last_name, class_id, course_id FROM students
             WHERE class_id = ? ORDER BY last_name, first_name",
            Some(class_id),
        ),
        (None, Some(course_id)) => (
            "SELECT id, first_name, last_name, class_id, course_id FROM students
             WHERE course_id = ? ORDER BY last_name, first_name",
            Some(course_id),
        ),
        (None, None) => (
            "SELECT id, first_name, last_name, class_id, course_id FROM students
             ORDER BY last_name, first_name",
            None,
        ),
    };

    let mut stmt = conn.prepare(sql).map_err(db_query_failed)?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "firstName": r.get::<_, String>(1)?,
            "lastName": r.get::<_, String>(2)?,
            "classId": r.get::<_, String>(3)?,
            "courseId": r.get::<_, Option<String>>(4)?
        }))
    };
    let rows: Vec<serde_json::Value> = match key {
        Some(key) => stmt
            .query_map([key], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query_failed)?,
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query_failed)?,
    };
    Ok(json!({ "students": rows }))
}

fn with_db<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(with_db(state, req, |c, p| classes_create(c, p))),
        "classes.list" => Some(with_db(state, req, |c, _| classes_list(c))),
        "courses.create" => Some(with_db(state, req, |c, p| courses_create(c, p))),
        "subjects.create" => Some(with_db(state, req, |c, p| subjects_create(c, p))),
        "students.create" => Some(with_db(state, req, |c, p| students_create(c, p))),
        "students.list" => Some(with_db(state, req, |c, p| students_list(c, p))),
        _ => None,
    }
}
