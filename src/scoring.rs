use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::audit;
use crate::scale;

#[derive(Debug, Clone, Serialize)]
pub struct ScoringError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoringError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> ScoringError {
    move |e| ScoringError::new(code, e.to_string())
}

/// Computed score for one (assessment, student) pair. `grade` is the
/// manual override when set, else the matched band label, else None.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub total_points: f64,
    pub percentage: f64,
    pub grade: Option<String>,
}

/// Rounds to the nearest 0.5; ties go away from zero (16.25 -> 16.5).
pub fn round_to_half(x: f64) -> f64 {
    (x * 2.0).round() / 2.0
}

/// Override grades are stored numeric; scales label in half steps, so one
/// decimal renders them consistently ("1.0", not "1").
pub fn format_grade(value: f64) -> String {
    format!("{:.1}", value)
}

/// Grade computation per assessment configuration. Returns None whenever no
/// grade is computable yet: unknown assessment, no scale assigned, zero
/// total max points, or a scale without a single valid band. Missing result
/// rows contribute zero points.
pub fn score_student(
    conn: &Connection,
    performance_id: &str,
    student_id: &str,
) -> Result<Option<ScoreResult>, ScoringError> {
    let scale_id: Option<Option<String>> = conn
        .query_row(
            "SELECT grade_scale_id FROM performance_queries WHERE id = ?",
            [performance_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(Some(scale_id)) = scale_id else {
        return Ok(None);
    };

    let total_max: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(max_points), 0) FROM performance_tasks WHERE performance_id = ?",
            [performance_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    if total_max == 0.0 {
        return Ok(None);
    }

    let definition: Option<String> = conn
        .query_row(
            "SELECT definition FROM grade_scales WHERE id = ?",
            [&scale_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(definition) = definition else {
        return Ok(None);
    };
    let bands = scale::parse_definition(&definition);
    if bands.is_empty() {
        return Ok(None);
    }

    let result: Option<(f64, f64, Option<f64>)> = conn
        .query_row(
            "SELECT op_points, zp_points, grade_override
             FROM performance_results
             WHERE performance_id = ? AND student_id = ?",
            (performance_id, student_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let (op, zp, grade_override) = result.unwrap_or((0.0, 0.0, None));

    let task_sum: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(points), 0)
             FROM performance_task_results
             WHERE performance_id = ? AND student_id = ?",
            (performance_id, student_id),
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;

    let total = round_to_half(task_sum + op + zp);
    let percentage = total / total_max * 100.0;
    let computed = scale::grade_for_percent(&bands, percentage).map(|g| g.to_string());
    let grade = grade_override.map(format_grade).or(computed);

    Ok(Some(ScoreResult {
        total_points: total,
        percentage,
        grade,
    }))
}

/// Manual edits to one student's recorded points. Absent fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct ScoreUpdate {
    pub op_points: Option<f64>,
    pub zp_points: Option<f64>,
    pub tasks: Vec<(i64, f64)>,
}

/// Writes the given points and marks every touched field as hand-edited,
/// then recomputes the score. Task points are upserted (a missing task
/// result row is created); op/zp land on the existing result row only —
/// results come into being via import or roster creation. Points are not
/// clamped to the task rubric: exceeding a task's max is recorded as-is.
pub fn update_student_scores(
    conn: &Connection,
    performance_id: &str,
    student_id: &str,
    update: &ScoreUpdate,
) -> Result<Option<ScoreResult>, ScoringError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;

    if let Some(op) = update.op_points {
        tx.execute(
            "UPDATE performance_results SET op_points = ?, op_is_edited = 1
             WHERE performance_id = ? AND student_id = ?",
            (op, performance_id, student_id),
        )
        .map_err(db_err("db_update_failed"))?;
        let _ = audit::record(
            &tx,
            "manual",
            "performance_results",
            Some(performance_id),
            "op_points",
            "",
            &op.to_string(),
            Some(student_id),
        );
    }
    if let Some(zp) = update.zp_points {
        tx.execute(
            "UPDATE performance_results SET zp_points = ?, zp_is_edited = 1
             WHERE performance_id = ? AND student_id = ?",
            (zp, performance_id, student_id),
        )
        .map_err(db_err("db_update_failed"))?;
        let _ = audit::record(
            &tx,
            "manual",
            "performance_results",
            Some(performance_id),
            "zp_points",
            "",
            &zp.to_string(),
            Some(student_id),
        );
    }

    for (task_number, points) in &update.tasks {
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO performance_task_results(id, performance_id, student_id, task_number, points, is_edited)
             VALUES(?, ?, ?, ?, ?, 1)
             ON CONFLICT(performance_id, student_id, task_number) DO UPDATE SET
               points = excluded.points,
               is_edited = 1",
            (&id, performance_id, student_id, task_number, points),
        )
        .map_err(db_err("db_update_failed"))?;
        let _ = audit::record(
            &tx,
            "manual",
            "performance_task_results",
            Some(performance_id),
            &format!("task_{}", task_number),
            "",
            &points.to_string(),
            Some(student_id),
        );
    }

    let result = score_student(&tx, performance_id, student_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(result)
}

/// CSV template for an assessment: header plus one empty row per student of
/// the owning class or course. Returns None for an unknown assessment.
pub fn build_csv_template(
    conn: &Connection,
    performance_id: &str,
) -> Result<Option<String>, ScoringError> {
    let owner: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT class_id, course_id FROM performance_queries WHERE id = ?",
            [performance_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((class_id, course_id)) = owner else {
        return Ok(None);
    };

    let task_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM performance_tasks WHERE performance_id = ?",
            [performance_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;

    let students = roster(conn, class_id.as_deref(), course_id.as_deref())?;

    let mut header: Vec<String> = vec![
        "StudentID".to_string(),
        "LastName".to_string(),
        "FirstName".to_string(),
    ];
    for i in 1..=task_count {
        header.push(format!("Task{}", i));
    }
    header.push("OP".to_string());
    header.push("ZP".to_string());

    let mut lines = vec![header.join(";")];
    for (id, last, first) in students {
        let mut row = vec![id, last, first];
        row.extend(std::iter::repeat(String::new()).take(task_count as usize + 2));
        lines.push(row.join(";"));
    }
    Ok(Some(lines.join("\n")))
}

fn roster(
    conn: &Connection,
    class_id: Option<&str>,
    course_id: Option<&str>,
) -> Result<Vec<(String, String, String)>, ScoringError> {
    let (sql, key) = if let Some(class_id) = class_id {
        (
            "SELECT id, last_name, first_name FROM students
             WHERE class_id = ? ORDER BY last_name, first_name",
            class_id,
        )
    } else if let Some(course_id) = course_id {
        (
            "SELECT id, last_name, first_name FROM students
             WHERE course_id = ? ORDER BY last_name, first_name",
            course_id,
        )
    } else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(sql).map_err(db_err("db_query_failed"))?;
    stmt.query_map([key], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

/// Full-replace import of recorded points (§ CSV contract): every existing
/// result and task-result row of the assessment is deleted, then the new
/// rows are inserted, all in one transaction. Rows with fewer than three
/// fields or an unknown student id are skipped; unparseable point cells
/// read as 0. Returns the number of imported student rows.
pub fn import_results(
    conn: &Connection,
    performance_id: &str,
    csv_data: &str,
) -> Result<usize, ScoringError> {
    let lines: Vec<&str> = csv_data
        .trim()
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(ScoringError::new("bad_params", "csv data is empty"));
    }

    let header: Vec<&str> = lines[0].split(';').map(|h| h.trim()).collect();
    let task_count = header.iter().filter(|h| h.starts_with("Task")).count();

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;

    tx.execute(
        "DELETE FROM performance_task_results WHERE performance_id = ?",
        [performance_id],
    )
    .map_err(db_err("db_delete_failed"))?;
    tx.execute(
        "DELETE FROM performance_results WHERE performance_id = ?",
        [performance_id],
    )
    .map_err(db_err("db_delete_failed"))?;

    let mut imported = 0usize;
    for line in &lines[1..] {
        let parts: Vec<&str> = line.split(';').map(|p| p.trim()).collect();
        if parts.len() < 3 {
            continue;
        }
        let student_id = parts[0];
        let known: bool = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(db_err("db_query_failed"))?
            .is_some();
        if !known {
            continue;
        }

        let cell = |idx: usize| -> f64 {
            parts
                .get(idx)
                .and_then(|v| if v.is_empty() { None } else { v.parse().ok() })
                .unwrap_or(0.0)
        };
        let op = cell(3 + task_count);
        let zp = cell(3 + task_count + 1);

        tx.execute(
            "INSERT INTO performance_results(id, performance_id, student_id, op_points, zp_points)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                performance_id,
                student_id,
                op,
                zp,
            ),
        )
        .map_err(db_err("db_insert_failed"))?;

        for i in 0..task_count {
            tx.execute(
                "INSERT INTO performance_task_results(id, performance_id, student_id, task_number, points)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    performance_id,
                    student_id,
                    (i + 1) as i64,
                    cell(3 + i),
                ),
            )
            .map_err(db_err("db_insert_failed"))?;
        }
        imported += 1;
    }

    let _ = audit::record(
        &tx,
        "import",
        "performance_results",
        Some(performance_id),
        "import",
        "",
        &imported.to_string(),
        None,
    );

    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(imported)
}
