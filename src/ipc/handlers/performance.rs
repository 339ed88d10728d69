use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scale;
use crate::scoring::{self, ScoreUpdate};
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

fn engine_err(e: scoring::ScoringError) -> HandlerErr {
    HandlerErr {
        code: match e.code.as_str() {
            "bad_params" => "bad_params",
            "db_insert_failed" => "db_insert_failed",
            "db_update_failed" => "db_update_failed",
            "db_delete_failed" => "db_delete_failed",
            _ => "db_query_failed",
        },
        message: e.message,
        details: e.details,
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "not_found",
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

fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let type_ = opt_str(params, "type").unwrap_or_else(|| "Andere".to_string());
    let date = get_required_str(params, "date")?;
    let description = opt_str(params, "description");
    let subject_id = opt_str(params, "subjectId");
    let class_id = opt_str(params, "classId");
    let course_id = opt_str(params, "courseId");
    let max_op_points = params
        .get("maxOpPoints")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let task_max_points: Vec<f64> = params
        .get("taskMaxPoints")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_f64()).collect())
        .unwrap_or_default();

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO performance_queries(id, type, description, subject_id, class_id, course_id, date, max_op_points)
         VALUES(?,?,?,?,?,?,?,?)",
        (
            &id,
            &type_,
            &description,
            &subject_id,
            &class_id,
            &course_id,
            &date,
            max_op_points,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "performance_queries" })),
    })?;
    for (i, max) in task_max_points.iter().enumerate() {
        tx.execute(
            "INSERT INTO performance_tasks(id, performance_id, number, max_points) VALUES(?,?,?,?)",
            (Uuid::new_v4().to_string(), &id, (i + 1) as i64, max),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "performance_tasks" })),
        })?;
    }
    let _ = audit::record(
        &tx,
        "manual",
        "performance_queries",
        Some(&id),
        "create",
        "",
        &format!("{} {}", type_, description.as_deref().unwrap_or("")).trim().to_string(),
        None,
    );
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let csv = scoring::build_csv_template(conn, &id).map_err(engine_err)?;
    Ok(json!({ "id": id, "csvTemplate": csv }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = opt_str(params, "classId");
    let course_id = opt_str(params, "courseId");
    let type_filter = opt_str(params, "type");

    let mut sql = String::from(
        "SELECT p.id, p.type, p.description, p.date, p.class_id, p.course_id, p.grade_scale_id,
                c.name, d.name, s.name, s.short
         FROM performance_queries p
         LEFT JOIN classes c ON p.class_id = c.id
         LEFT JOIN courses d ON p.course_id = d.id
         LEFT JOIN subjects s ON p.subject_id = s.id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(class_id) = &class_id {
        clauses.push("p.class_id = ?");
        binds.push(class_id.clone());
    }
    if let Some(course_id) = &course_id {
        clauses.push("p.course_id = ?");
        binds.push(course_id.clone());
    }
    if let Some(type_filter) = &type_filter {
        clauses.push("p.type LIKE ?");
        binds.push(type_filter.clone());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY p.date DESC, p.id DESC");

    let mut stmt = conn.prepare(&sql).map_err(db_query_failed)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "type": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "date": r.get::<_, String>(3)?,
                "classId": r.get::<_, Option<String>>(4)?,
                "courseId": r.get::<_, Option<String>>(5)?,
                "gradeScaleId": r.get::<_, Option<String>>(6)?,
                "className": r.get::<_, Option<String>>(7)?,
                "courseName": r.get::<_, Option<String>>(8)?,
                "subjectName": r.get::<_, Option<String>>(9)?,
                "subjectShort": r.get::<_, Option<String>>(10)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;

    // Average of the manually set override grades, shown on the list page.
    let mut augmented = Vec::with_capacity(rows.len());
    for mut row in rows {
        let pid = row["id"].as_str().unwrap_or_default().to_string();
        let avg: Option<f64> = conn
            .query_row(
                "SELECT AVG(grade_override) FROM performance_results
                 WHERE performance_id = ? AND grade_override IS NOT NULL",
                [&pid],
                |r| r.get(0),
            )
            .map_err(db_query_failed)?;
        row["avgOverrideGrade"] = json!(avg);
        augmented.push(row);
    }
    Ok(json!({ "rows": augmented }))
}

fn open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let pid = get_required_str(params, "id")?;

    let head: Option<(
        String,
        Option<String>,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        f64,
    )> = conn
        .query_row(
            "SELECT type, description, date, class_id, course_id, grade_scale_id, max_op_points
             FROM performance_queries WHERE id = ?",
            [&pid],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(db_query_failed)?;
    let Some((type_, description, date, class_id, course_id, scale_id, max_op_points)) = head
    else {
        return Err(not_found("performance query not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT number, max_points FROM performance_tasks
             WHERE performance_id = ? ORDER BY number",
        )
        .map_err(db_query_failed)?;
    let tasks: Vec<(i64, f64)> = stmt
        .query_map([&pid], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    let total_max: f64 = tasks.iter().map(|(_, max)| max).sum();

    let students = {
        let (sql, key) = if let Some(class_id) = &class_id {
            (
                "SELECT id, last_name, first_name FROM students
                 WHERE class_id = ? ORDER BY last_name, first_name",
                Some(class_id.clone()),
            )
        } else if let Some(course_id) = &course_id {
            (
                "SELECT id, last_name, first_name FROM students
                 WHERE course_id = ? ORDER BY last_name, first_name",
                Some(course_id.clone()),
            )
        } else {
            ("SELECT id, last_name, first_name FROM students WHERE 0", None)
        };
        let mut stmt = conn.prepare(sql).map_err(db_query_failed)?;
        let rows: Vec<(String, String, String)> = match key {
            Some(key) => stmt
                .query_map([key], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_query_failed)?,
            None => Vec::new(),
        };
        rows
    };

    #[derive(Default, Clone)]
    struct ResultRow {
        op: f64,
        zp: f64,
        override_grade: Option<f64>,
        comment: Option<String>,
        op_is_edited: bool,
        zp_is_edited: bool,
        tasks: HashMap<i64, (f64, bool)>,
    }
    let mut results: HashMap<String, ResultRow> = HashMap::new();

    let mut stmt = conn
        .prepare(
            "SELECT student_id, op_points, zp_points, grade_override, comment, op_is_edited, zp_is_edited
             FROM performance_results WHERE performance_id = ?",
        )
        .map_err(db_query_failed)?;
    let rows: Vec<(String, f64, f64, Option<f64>, Option<String>, i64, i64)> = stmt
        .query_map([&pid], |r| {
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
        .map_err(db_query_failed)?;
    for (student_id, op, zp, override_grade, comment, op_edited, zp_edited) in rows {
        results.insert(
            student_id,
            ResultRow {
                op,
                zp,
                override_grade,
                comment,
                op_is_edited: op_edited != 0,
                zp_is_edited: zp_edited != 0,
                tasks: HashMap::new(),
            },
        );
    }

    let mut stmt = conn
        .prepare(
            "SELECT student_id, task_number, points, is_edited
             FROM performance_task_results WHERE performance_id = ?",
        )
        .map_err(db_query_failed)?;
    let rows: Vec<(String, i64, f64, i64)> = stmt
        .query_map([&pid], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    for (student_id, task_number, points, edited) in rows {
        results
            .entry(student_id)
            .or_default()
            .tasks
            .insert(task_number, (points, edited != 0));
    }

    // Per-task class averages over students that have a recorded value.
    let mut task_averages: HashMap<i64, f64> = HashMap::new();
    for (number, _) in &tasks {
        let mut total = 0.0;
        let mut count = 0usize;
        for (student_id, _, _) in &students {
            if let Some((points, _)) = results.get(student_id).and_then(|r| r.tasks.get(number)) {
                total += points;
                count += 1;
            }
        }
        if count > 0 {
            task_averages.insert(*number, total / count as f64);
        }
    }

    let mut totals: Vec<f64> = Vec::new();
    let mut students_json: Vec<serde_json::Value> = Vec::new();
    for (student_id, last, first) in &students {
        let row = results.get(student_id).cloned().unwrap_or_default();
        let task_sum: f64 = row.tasks.values().map(|(points, _)| points).sum();
        let total = task_sum + row.op + row.zp;
        totals.push(total);

        let score = scoring::score_student(conn, &pid, student_id).map_err(engine_err)?;
        let tasks_json: HashMap<String, serde_json::Value> = row
            .tasks
            .iter()
            .map(|(number, (points, edited))| {
                (
                    number.to_string(),
                    json!({ "points": points, "isEdited": edited }),
                )
            })
            .collect();
        students_json.push(json!({
            "id": student_id,
            "lastName": last,
            "firstName": first,
            "opPoints": row.op,
            "zpPoints": row.zp,
            "opIsEdited": row.op_is_edited,
            "zpIsEdited": row.zp_is_edited,
            "gradeOverride": row.override_grade,
            "comment": row.comment,
            "tasks": tasks_json,
            "totalPoints": total,
            "score": score
        }));
    }

    let scale_row: Option<(String, String, String)> = match &scale_id {
        Some(scale_id) => conn
            .query_row(
                "SELECT id, name, definition FROM grade_scales WHERE id = ?",
                [scale_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(db_query_failed)?,
        None => None,
    };
    let scale_json = scale_row.map(|(id, name, definition)| {
        let bands = scale::parse_definition(&definition);
        json!({
            "id": id,
            "name": name,
            "bands": serde_json::to_value(&bands).unwrap_or(serde_json::Value::Null)
        })
    });

    let avg_points = if totals.is_empty() {
        0.0
    } else {
        totals.iter().sum::<f64>() / totals.len() as f64
    };
    let best_points = totals.iter().cloned().fold(f64::NAN, f64::max);
    let worst_points = totals.iter().cloned().fold(f64::NAN, f64::min);

    let tasks_json: Vec<serde_json::Value> = tasks
        .iter()
        .map(|(number, max)| {
            json!({
                "number": number,
                "maxPoints": max,
                "average": task_averages.get(number)
            })
        })
        .collect();

    Ok(json!({
        "id": pid,
        "type": type_,
        "description": description,
        "date": date,
        "classId": class_id,
        "courseId": course_id,
        "maxOpPoints": max_op_points,
        "scale": scale_json,
        "tasks": tasks_json,
        "totalMaxPoints": total_max,
        "students": students_json,
        "stats": {
            "avgPoints": avg_points,
            "bestPoints": if totals.is_empty() { serde_json::Value::Null } else { json!(best_points) },
            "worstPoints": if totals.is_empty() { serde_json::Value::Null } else { json!(worst_points) }
        }
    }))
}

fn export(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let pid = get_required_str(params, "id")?;
    match scoring::build_csv_template(conn, &pid).map_err(engine_err)? {
        Some(csv) => Ok(json!({ "csv": csv })),
        None => Err(not_found("performance query not found")),
    }
}

fn import(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let pid = get_required_str(params, "id")?;
    let csv_data = get_required_str(params, "csvData")?;
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM performance_queries WHERE id = ?",
            [&pid],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_query_failed)?
        .is_some();
    if !exists {
        return Err(not_found("performance query not found"));
    }
    let imported = scoring::import_results(conn, &pid, &csv_data).map_err(engine_err)?;
    Ok(json!({ "importedRows": imported }))
}

fn assign_scale(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let pid = get_required_str(params, "id")?;
    let scale_id = opt_str(params, "scaleId");

    if let Some(scale_id) = &scale_id {
        let exists: bool = conn
            .query_row("SELECT 1 FROM grade_scales WHERE id = ?", [scale_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(db_query_failed)?
            .is_some();
        if !exists {
            return Err(not_found("grade scale not found"));
        }
    }

    let old: Option<Option<String>> = conn
        .query_row(
            "SELECT grade_scale_id FROM performance_queries WHERE id = ?",
            [&pid],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_failed)?;
    let Some(old) = old else {
        return Err(not_found("performance query not found"));
    };

    conn.execute(
        "UPDATE performance_queries SET grade_scale_id = ? WHERE id = ?",
        (&scale_id, &pid),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "performance_queries" })),
    })?;
    let _ = audit::record(
        conn,
        "manual",
        "performance_queries",
        Some(&pid),
        "grade_scale_id",
        old.as_deref().unwrap_or(""),
        scale_id.as_deref().unwrap_or(""),
        None,
    );
    Ok(json!({ "ok": true }))
}

fn set_override(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let pid = get_required_str(params, "id")?;
    let student_id = get_required_str(params, "studentId")?;
    let override_val = params.get("override").and_then(|v| v.as_f64());
    let comment = opt_str(params, "comment");

    let old: Option<(Option<f64>, Option<String>)> = conn
        .query_row(
            "SELECT grade_override, comment FROM performance_results
             WHERE performance_id = ? AND student_id = ?",
            (&pid, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query_failed)?;
    let Some((old_override, old_comment)) = old else {
        return Err(not_found("performance result not found"));
    };

    conn.execute(
        "UPDATE performance_results SET grade_override = ?, comment = ?
         WHERE performance_id = ? AND student_id = ?",
        (override_val, &comment, &pid, &student_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "performance_results" })),
    })?;

    if override_val != old_override || comment != old_comment {
        let _ = audit::record(
            conn,
            "manual",
            "performance_results",
            Some(&pid),
            "grade_override",
            &old_override.map(|v| v.to_string()).unwrap_or_default(),
            &override_val.map(|v| v.to_string()).unwrap_or_default(),
            comment.as_deref(),
        );
    }

    let score = scoring::score_student(conn, &pid, &student_id).map_err(engine_err)?;
    Ok(json!({ "score": score }))
}

fn update_student_scores(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let pid = get_required_str(params, "id")?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(scores) = params.get("scores").and_then(|v| v.as_object()) else {
        return Err(bad_params("missing scores"));
    };

    let mut update = ScoreUpdate {
        op_points: scores.get("opPoints").and_then(|v| v.as_f64()),
        zp_points: scores.get("zpPoints").and_then(|v| v.as_f64()),
        tasks: Vec::new(),
    };
    if let Some(tasks) = scores.get("tasks").and_then(|v| v.as_object()) {
        for (key, value) in tasks {
            let (Ok(number), Some(points)) = (key.parse::<i64>(), value.as_f64()) else {
                continue;
            };
            update.tasks.push((number, points));
        }
    }

    let score =
        scoring::update_student_scores(conn, &pid, &student_id, &update).map_err(engine_err)?;
    Ok(json!({ "score": score }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let pid = get_required_str(params, "id")?;
    let deleted = conn
        .execute("DELETE FROM performance_queries WHERE id = ?", [&pid])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: None,
        })?;
    if deleted == 0 {
        return Err(not_found("performance query not found"));
    }
    let _ = audit::record(
        conn,
        "manual",
        "performance_queries",
        Some(&pid),
        "delete",
        "",
        "",
        None,
    );
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "performance.create"
            | "performance.list"
            | "performance.open"
            | "performance.export"
            | "performance.import"
            | "performance.assignScale"
            | "performance.setOverride"
            | "performance.updateStudentScores"
            | "performance.delete"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "performance.create" => create(conn, &req.params),
        "performance.list" => list(conn, &req.params),
        "performance.open" => open(conn, &req.params),
        "performance.export" => export(conn, &req.params),
        "performance.import" => import(conn, &req.params),
        "performance.assignScale" => assign_scale(conn, &req.params),
        "performance.setOverride" => set_override(conn, &req.params),
        "performance.updateStudentScores" => update_student_scores(conn, &req.params),
        "performance.delete" => delete(conn, &req.params),
        _ => unreachable!(),
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}
