use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Config, Request};
use crate::schedule::Weekday;
use crate::timetable::{self, NewSlot, SlotRow};
use chrono::{Datelike, Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn engine_err(e: timetable::TimetableError) -> HandlerErr {
    HandlerErr {
        code: match e.code.as_str() {
            "not_found" => "not_found",
            "protected_template" => "protected_template",
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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn parse_date_param(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| bad_params(format!("{} must be YYYY-MM-DD", key)))
}

fn name_of(conn: &Connection, table: &str, id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        &format!("SELECT name FROM {} WHERE id = ?", table),
        [id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query_failed)
}

fn subject_label(conn: &Connection, id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(short, name) FROM subjects WHERE id = ?",
        [id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query_failed)
}

/// "group - subject - room", skipping missing parts, as shown in the
/// week grid.
fn slot_label(conn: &Connection, slot: &SlotRow) -> Result<String, HandlerErr> {
    let mut parts: Vec<String> = Vec::new();
    let group = match (&slot.course_id, &slot.class_id) {
        (Some(course_id), _) => name_of(conn, "courses", course_id)?,
        (None, Some(class_id)) => name_of(conn, "classes", class_id)?,
        (None, None) => None,
    };
    if let Some(g) = group {
        parts.push(g);
    }
    if let Some(subject_id) = &slot.subject_id {
        if let Some(s) = subject_label(conn, subject_id)? {
            parts.push(s);
        }
    }
    if let Some(room) = &slot.room {
        if !room.is_empty() {
            parts.push(room.clone());
        }
    }
    Ok(parts.join(" - "))
}

/// Rotating six-week index, counted from ISO week 35 of the running school
/// year (weeks before 35 belong to the year that started the previous
/// calendar year).
fn school_week(monday: NaiveDate) -> i64 {
    let iso_week = monday.iso_week().week() as i64;
    let iso_year = monday.iso_week().year();
    let start_year = if iso_week >= 35 { iso_year } else { iso_year - 1 };
    let school_start = NaiveDate::from_isoywd_opt(start_year, 35, chrono::Weekday::Mon)
        .or_else(|| NaiveDate::from_ymd_opt(start_year, 9, 1))
        .unwrap_or(monday);
    let weeks = (monday - school_start).num_days().div_euclid(7);
    weeks.rem_euclid(6) + 1
}

fn week_open(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date_param(params, "date")?;
    let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);

    let mut days = Vec::new();
    for (i, weekday) in Weekday::ALL.iter().enumerate() {
        let day_date = monday + Duration::days(i as i64);
        let resolved = timetable::resolve_day(conn, day_date, *weekday, &config.schedule)
            .map_err(engine_err)?;
        let mut entries = Vec::new();
        for (period, slot) in &resolved {
            let label = slot_label(conn, slot)?;
            entries.push(json!({
                "period": period,
                "slot": serde_json::to_value(slot).unwrap_or(serde_json::Value::Null),
                "label": label
            }));
        }
        days.push(json!({
            "weekday": weekday.as_str(),
            "date": day_date.format("%Y-%m-%d").to_string(),
            "entries": entries
        }));
    }

    Ok(json!({
        "monday": monday.format("%Y-%m-%d").to_string(),
        "calendarWeek": monday.iso_week().week(),
        "schoolWeek": school_week(monday),
        "pattern": serde_json::to_value(&config.schedule.slots).unwrap_or(serde_json::Value::Null),
        "days": days
    }))
}

fn list_slots(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut rows = timetable::list_slots(conn).map_err(engine_err)?;
    rows.sort_by_key(|r| {
        let day_idx = Weekday::ALL.iter().position(|w| *w == r.weekday).unwrap_or(5);
        (day_idx, r.period, r.date.clone())
    });

    let mut entries = Vec::new();
    for row in &rows {
        let label = slot_label(conn, row)?;
        let mut v = serde_json::to_value(row).unwrap_or(serde_json::Value::Null);
        v["label"] = json!(label);
        entries.push(v);
    }
    Ok(json!({ "entries": entries }))
}

struct SlotFields {
    weekday: Weekday,
    period: i64,
    is_double: bool,
    subject_id: String,
    class_id: Option<String>,
    course_id: Option<String>,
    room: Option<String>,
}

fn parse_slot_fields(params: &serde_json::Value) -> Result<SlotFields, HandlerErr> {
    let weekday_raw = get_required_str(params, "weekday")?;
    let weekday = Weekday::parse(&weekday_raw)
        .ok_or_else(|| bad_params(format!("unknown weekday: {}", weekday_raw)))?;
    let period = params
        .get("period")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad_params("missing period"))?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class_id = params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let course_id = params
        .get("courseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if class_id.is_none() && course_id.is_none() {
        return Err(bad_params("either classId or courseId is required"));
    }
    Ok(SlotFields {
        weekday,
        period,
        is_double: params
            .get("isDouble")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        subject_id,
        class_id,
        course_id,
        room: params
            .get("room")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

/// Double-booking check: another row already holds this weekday/period for
/// the same class or the same course.
fn has_conflict(
    conn: &Connection,
    fields: &SlotFields,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, class_id, course_id FROM timetable WHERE weekday = ? AND period = ?",
        )
        .map_err(db_query_failed)?;
    let rows: Vec<(String, Option<String>, Option<String>)> = stmt
        .query_map((fields.weekday.as_str(), fields.period), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;

    Ok(rows.iter().any(|(id, class_id, course_id)| {
        if exclude_id == Some(id.as_str()) {
            return false;
        }
        let class_clash = fields.class_id.is_some() && *class_id == fields.class_id;
        let course_clash = fields.course_id.is_some() && *course_id == fields.course_id;
        class_clash || course_clash
    }))
}

fn create_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let fields = parse_slot_fields(params)?;
    if has_conflict(conn, &fields, None)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "a lesson for this class/course already exists at this time".to_string(),
            details: None,
        });
    }
    let id = timetable::insert_slot(
        conn,
        &NewSlot {
            weekday: fields.weekday,
            period: fields.period,
            is_double: fields.is_double,
            date: None,
            subject_id: Some(fields.subject_id),
            class_id: fields.class_id,
            course_id: fields.course_id,
            room: fields.room,
            status: None,
        },
    )
    .map_err(engine_err)?;
    let _ = audit::record(conn, "manual", "timetable", Some(&id), "create", "", "", None);
    Ok(json!({ "id": id }))
}

fn update_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let fields = parse_slot_fields(params)?;
    if timetable::get_slot(conn, &id).map_err(engine_err)?.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable entry not found".to_string(),
            details: None,
        });
    }
    if has_conflict(conn, &fields, Some(&id))? {
        return Err(HandlerErr {
            code: "conflict",
            message: "a lesson for this class/course already exists at this time".to_string(),
            details: None,
        });
    }
    conn.execute(
        "UPDATE timetable
         SET weekday = ?, period = ?, subject_id = ?, class_id = ?, course_id = ?, room = ?, is_double = ?
         WHERE id = ?",
        (
            fields.weekday.as_str(),
            fields.period,
            &fields.subject_id,
            &fields.class_id,
            &fields.course_id,
            &fields.room,
            fields.is_double as i64,
            &id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "timetable" })),
    })?;
    let _ = audit::record(conn, "manual", "timetable", Some(&id), "update", "", "", None);
    Ok(json!({ "ok": true }))
}

fn delete_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let deleted = conn
        .execute("DELETE FROM timetable WHERE id = ?", [&id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: None,
        })?;
    if deleted == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable entry not found".to_string(),
            details: None,
        });
    }
    let _ = audit::record(conn, "manual", "timetable", Some(&id), "delete", "", "", None);
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "timetable.weekOpen" | "timetable.list" | "timetable.create" | "timetable.update" | "timetable.delete"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "timetable.weekOpen" => week_open(conn, &state.config, &req.params),
        "timetable.list" => list_slots(conn),
        "timetable.create" => create_slot(conn, &req.params),
        "timetable.update" => update_slot(conn, &req.params),
        "timetable.delete" => delete_slot(conn, &req.params),
        _ => unreachable!(),
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}
