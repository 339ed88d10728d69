use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audit;
use crate::schedule::{SchedulePattern, Weekday};

#[derive(Debug, Clone, Serialize)]
pub struct TimetableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TimetableError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> TimetableError {
    move |e| TimetableError::new(code, e.to_string())
}

/// One timetable row. `date == None` marks the recurring weekly template;
/// a concrete date pins the row to a single calendar day. Dates are ISO
/// `YYYY-MM-DD` text, so string order is date order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRow {
    pub id: String,
    pub weekday: Weekday,
    pub period: i64,
    pub is_double: bool,
    pub date: Option<String>,
    pub subject_id: Option<String>,
    pub class_id: Option<String>,
    pub course_id: Option<String>,
    pub room: Option<String>,
    pub status: Option<String>,
}

/// Field list matching `map_slot_row`'s column order.
const SLOT_COLUMNS: &str =
    "id, weekday, period, is_double, date, subject_id, class_id, course_id, room, status";

fn map_slot_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SlotRow> {
    let weekday_raw: String = r.get(1)?;
    let weekday = Weekday::parse(&weekday_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown weekday: {}", weekday_raw).into(),
        )
    })?;
    Ok(SlotRow {
        id: r.get(0)?,
        weekday,
        period: r.get(2)?,
        is_double: r.get::<_, i64>(3)? != 0,
        date: r.get(4)?,
        subject_id: r.get(5)?,
        class_id: r.get(6)?,
        course_id: r.get(7)?,
        room: r.get(8)?,
        status: r.get(9)?,
    })
}

pub fn list_slots(conn: &Connection) -> Result<Vec<SlotRow>, TimetableError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM timetable", SLOT_COLUMNS))
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([], map_slot_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

pub fn get_slot(conn: &Connection, id: &str) -> Result<Option<SlotRow>, TimetableError> {
    conn.query_row(
        &format!("SELECT {} FROM timetable WHERE id = ?", SLOT_COLUMNS),
        [id],
        map_slot_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

/// Row pinned to exactly this date and period. The store does not enforce
/// uniqueness here; if several rows exist the first one wins.
pub fn query_by_date_and_period(
    conn: &Connection,
    date: &str,
    period: i64,
) -> Result<Option<SlotRow>, TimetableError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM timetable WHERE date = ? AND period = ? LIMIT 1",
            SLOT_COLUMNS
        ),
        (date, period),
        map_slot_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

/// Most recent dated row strictly before `before` on the same weekday and
/// period. A past override carries forward to later dates that lack their
/// own row.
pub fn query_recent_past_override(
    conn: &Connection,
    before: &str,
    weekday: Weekday,
    period: i64,
) -> Result<Option<SlotRow>, TimetableError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM timetable
             WHERE date IS NOT NULL AND date < ? AND weekday = ? AND period = ?
             ORDER BY date DESC LIMIT 1",
            SLOT_COLUMNS
        ),
        (before, weekday.as_str(), period),
        map_slot_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

pub fn query_template(
    conn: &Connection,
    weekday: Weekday,
    period: i64,
) -> Result<Option<SlotRow>, TimetableError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM timetable
             WHERE date IS NULL AND weekday = ? AND period = ? LIMIT 1",
            SLOT_COLUMNS
        ),
        (weekday.as_str(), period),
        map_slot_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

/// Resolves every period of one school day. Precedence per period:
/// 1. row pinned to the date itself;
/// 2. most recent past override for the weekday/period;
/// 3. weekly template row;
/// 4. the previous raster period's slot, when that slot resolved to a
///    double lesson of the same weekday (one row occupies two periods).
/// "Previous" follows the raster, not arithmetic: period 8 inherits from
/// period 6 across the midday break. Periods with no match stay absent.
pub fn resolve_day(
    conn: &Connection,
    date: NaiveDate,
    weekday: Weekday,
    pattern: &SchedulePattern,
) -> Result<BTreeMap<i64, SlotRow>, TimetableError> {
    let date_str = date.format("%Y-%m-%d").to_string();
    let mut resolved: BTreeMap<i64, SlotRow> = BTreeMap::new();
    let mut prev_period: Option<i64> = None;

    for period in pattern.periods() {
        let mut row = query_by_date_and_period(conn, &date_str, period)?;
        if row.is_none() {
            row = query_recent_past_override(conn, &date_str, weekday, period)?;
        }
        if row.is_none() {
            row = query_template(conn, weekday, period)?;
        }
        if row.is_none() {
            if let Some(prev) = prev_period.and_then(|p| resolved.get(&p)) {
                if prev.is_double && prev.weekday == weekday {
                    row = Some(prev.clone());
                }
            }
        }
        if let Some(r) = row {
            resolved.insert(period, r);
        }
        prev_period = Some(period);
    }

    Ok(resolved)
}

/// Effective lesson for one slot, or None for a free period. Runs the full
/// day pass so double-period inheritance sees the preceding raster slots.
pub fn resolve(
    conn: &Connection,
    date: NaiveDate,
    weekday: Weekday,
    period: i64,
    pattern: &SchedulePattern,
) -> Result<Option<SlotRow>, TimetableError> {
    Ok(resolve_day(conn, date, weekday, pattern)?.remove(&period))
}

/// NULL-aware lesson identity used by the override lifecycle: subject,
/// class and course must all match, where two NULLs count as equal.
pub fn same_lesson_group(a: &SlotRow, b: &SlotRow) -> bool {
    a.subject_id == b.subject_id && a.class_id == b.class_id && a.course_id == b.course_id
}

pub struct NewSlot {
    pub weekday: Weekday,
    pub period: i64,
    pub is_double: bool,
    pub date: Option<String>,
    pub subject_id: Option<String>,
    pub class_id: Option<String>,
    pub course_id: Option<String>,
    pub room: Option<String>,
    pub status: Option<String>,
}

pub fn insert_slot(conn: &Connection, slot: &NewSlot) -> Result<String, TimetableError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO timetable(id, weekday, period, is_double, date, subject_id, class_id, course_id, room, status)
         VALUES(?,?,?,?,?,?,?,?,?,?)",
        (
            &id,
            slot.weekday.as_str(),
            slot.period,
            slot.is_double as i64,
            &slot.date,
            &slot.subject_id,
            &slot.class_id,
            &slot.course_id,
            &slot.room,
            &slot.status,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    Ok(id)
}

/// Sets a lesson's status for one calendar date without touching the weekly
/// template. Looks up the referenced slot, then finds a row matching the
/// NULL-aware (date, period, subject, class, course) identity: if present
/// its status is updated in place, otherwise a full copy of the referenced
/// slot is inserted with the target date and status (copy-on-write).
/// Returns the override row's id.
pub fn set_status(
    conn: &Connection,
    slot_id: &str,
    date: &str,
    status: &str,
) -> Result<String, TimetableError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;

    let template = get_slot(&tx, slot_id)?
        .ok_or_else(|| TimetableError::new("not_found", "timetable entry not found"))?;

    let mut stmt = tx
        .prepare(&format!(
            "SELECT {} FROM timetable WHERE date = ? AND period = ?",
            SLOT_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let candidates: Vec<SlotRow> = stmt
        .query_map((date, template.period), map_slot_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    drop(stmt);

    let existing = candidates
        .into_iter()
        .find(|c| same_lesson_group(&template, c));

    let (override_id, old_status) = match existing {
        Some(row) => {
            tx.execute(
                "UPDATE timetable SET status = ? WHERE id = ?",
                (status, &row.id),
            )
            .map_err(db_err("db_update_failed"))?;
            (row.id, row.status)
        }
        None => {
            let id = insert_slot(
                &tx,
                &NewSlot {
                    weekday: template.weekday,
                    period: template.period,
                    is_double: template.is_double,
                    date: Some(date.to_string()),
                    subject_id: template.subject_id.clone(),
                    class_id: template.class_id.clone(),
                    course_id: template.course_id.clone(),
                    room: template.room.clone(),
                    status: Some(status.to_string()),
                },
            )?;
            (id, None)
        }
    };

    let _ = audit::record(
        &tx,
        "manual",
        "timetable",
        Some(&override_id),
        "status",
        old_status.as_deref().unwrap_or(""),
        status,
        Some(date),
    );

    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(override_id)
}

/// Removes a date-specific override row. Template rows (date IS NULL) are
/// protected: the call is rejected, never a silent no-op, so callers can
/// tell "nothing to revert" from an attempt to corrupt the template.
pub fn clear_override(conn: &Connection, slot_id: &str) -> Result<(), TimetableError> {
    let row = get_slot(conn, slot_id)?
        .ok_or_else(|| TimetableError::new("not_found", "timetable entry not found"))?;
    if row.date.is_none() {
        return Err(TimetableError::new(
            "protected_template",
            "refusing to delete a template row; only date-specific overrides can be cleared",
        ));
    }
    conn.execute("DELETE FROM timetable WHERE id = ?", [slot_id])
        .map_err(db_err("db_delete_failed"))?;

    let _ = audit::record(
        conn,
        "manual",
        "timetable",
        Some(slot_id),
        "delete",
        row.status.as_deref().unwrap_or(""),
        "",
        row.date.as_deref(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_subject(conn: &Connection, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO subjects(id, name, short) VALUES(?,?,?)",
            (&id, name, name),
        )
        .expect("insert subject");
        id
    }

    fn seed_class(conn: &Connection, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute("INSERT INTO classes(id, name) VALUES(?,?)", (&id, name))
            .expect("insert class");
        id
    }

    fn template(subject: &str, class: &str, weekday: Weekday, period: i64) -> NewSlot {
        NewSlot {
            weekday,
            period,
            is_double: false,
            date: None,
            subject_id: Some(subject.to_string()),
            class_id: Some(class.to_string()),
            course_id: None,
            room: Some("212".to_string()),
            status: None,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("parse date")
    }

    #[test]
    fn empty_weekday_resolves_to_no_lessons() {
        let conn = test_conn();
        let pattern = SchedulePattern::default();
        let day = resolve_day(&conn, date("2025-09-01"), Weekday::Monday, &pattern)
            .expect("resolve day");
        assert!(day.is_empty());
    }

    #[test]
    fn template_row_fills_its_slot() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let class = seed_class(&conn, "7SW");
        insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();

        let pattern = SchedulePattern::default();
        let row = resolve(&conn, date("2025-09-01"), Weekday::Monday, 3, &pattern)
            .unwrap()
            .expect("slot resolves");
        assert_eq!(row.subject_id.as_deref(), Some(subject.as_str()));
        // Neighboring periods stay free.
        assert!(resolve(&conn, date("2025-09-01"), Weekday::Monday, 4, &pattern)
            .unwrap()
            .is_none());
    }

    #[test]
    fn exact_date_row_beats_template_and_past_override() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let other = seed_subject(&conn, "IF");
        let third = seed_subject(&conn, "M");
        let class = seed_class(&conn, "7SW");

        insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();
        // Past override the week before.
        let mut past = template(&other, &class, Weekday::Monday, 3);
        past.date = Some("2025-09-01".to_string());
        insert_slot(&conn, &past).unwrap();
        // Exact-date row on the queried day.
        let mut exact = template(&third, &class, Weekday::Monday, 3);
        exact.date = Some("2025-09-08".to_string());
        insert_slot(&conn, &exact).unwrap();

        let pattern = SchedulePattern::default();
        let row = resolve(&conn, date("2025-09-08"), Weekday::Monday, 3, &pattern)
            .unwrap()
            .expect("slot resolves");
        assert_eq!(row.subject_id.as_deref(), Some(third.as_str()));
    }

    #[test]
    fn past_override_carries_forward_to_later_dates() {
        // A dated row keeps winning over the template on every later date
        // that has no row of its own. Deliberate layering behavior; keep.
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let other = seed_subject(&conn, "IF");
        let class = seed_class(&conn, "7SW");

        insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();
        let mut past = template(&other, &class, Weekday::Monday, 3);
        past.date = Some("2025-09-01".to_string());
        past.status = Some("cancelled".to_string());
        insert_slot(&conn, &past).unwrap();

        let pattern = SchedulePattern::default();
        // Two weeks later, still the past override.
        let row = resolve(&conn, date("2025-09-15"), Weekday::Monday, 3, &pattern)
            .unwrap()
            .expect("slot resolves");
        assert_eq!(row.subject_id.as_deref(), Some(other.as_str()));
        assert_eq!(row.status.as_deref(), Some("cancelled"));
        // The day before the override, only the template matches.
        let row = resolve(&conn, date("2025-08-25"), Weekday::Monday, 3, &pattern)
            .unwrap()
            .expect("slot resolves");
        assert_eq!(row.subject_id.as_deref(), Some(subject.as_str()));
    }

    #[test]
    fn most_recent_past_override_wins() {
        let conn = test_conn();
        let a = seed_subject(&conn, "PH");
        let b = seed_subject(&conn, "IF");
        let class = seed_class(&conn, "7SW");

        let mut first = template(&a, &class, Weekday::Monday, 3);
        first.date = Some("2025-09-01".to_string());
        insert_slot(&conn, &first).unwrap();
        let mut second = template(&b, &class, Weekday::Monday, 3);
        second.date = Some("2025-09-08".to_string());
        insert_slot(&conn, &second).unwrap();

        let pattern = SchedulePattern::default();
        let row = resolve(&conn, date("2025-09-15"), Weekday::Monday, 3, &pattern)
            .unwrap()
            .expect("slot resolves");
        assert_eq!(row.subject_id.as_deref(), Some(b.as_str()));
    }

    #[test]
    fn double_period_occupies_the_following_slot() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "IF");
        let class = seed_class(&conn, "6B");
        let mut slot = template(&subject, &class, Weekday::Monday, 5);
        slot.is_double = true;
        let id = insert_slot(&conn, &slot).unwrap();

        let pattern = SchedulePattern::default();
        let row = resolve(&conn, date("2025-09-01"), Weekday::Monday, 6, &pattern)
            .unwrap()
            .expect("second half resolves");
        assert_eq!(row.id, id);
    }

    #[test]
    fn double_period_inherits_across_the_midday_break() {
        // Period 8 follows period 6 in the raster; a double lesson in 6
        // spills into 8, not into a nonexistent period 7.
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let class = seed_class(&conn, "7IF");
        let mut slot = template(&subject, &class, Weekday::Friday, 6);
        slot.is_double = true;
        let id = insert_slot(&conn, &slot).unwrap();

        let pattern = SchedulePattern::default();
        let row = resolve(&conn, date("2025-09-05"), Weekday::Friday, 8, &pattern)
            .unwrap()
            .expect("slot after break resolves");
        assert_eq!(row.id, id);
    }

    #[test]
    fn single_period_does_not_spill_over() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let class = seed_class(&conn, "7SW");
        insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();

        let pattern = SchedulePattern::default();
        assert!(resolve(&conn, date("2025-09-01"), Weekday::Monday, 4, &pattern)
            .unwrap()
            .is_none());
    }

    #[test]
    fn own_row_interrupts_double_inheritance() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "IF");
        let other = seed_subject(&conn, "M");
        let class = seed_class(&conn, "6B");
        let mut first = template(&subject, &class, Weekday::Monday, 5);
        first.is_double = true;
        insert_slot(&conn, &first).unwrap();
        insert_slot(&conn, &template(&other, &class, Weekday::Monday, 6)).unwrap();

        let pattern = SchedulePattern::default();
        let row = resolve(&conn, date("2025-09-01"), Weekday::Monday, 6, &pattern)
            .unwrap()
            .expect("slot resolves");
        assert_eq!(row.subject_id.as_deref(), Some(other.as_str()));
    }

    #[test]
    fn set_status_copies_template_into_dated_override() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let class = seed_class(&conn, "7SW");
        let template_id =
            insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();

        let override_id = set_status(&conn, &template_id, "2025-09-08", "cancelled").unwrap();
        assert_ne!(override_id, template_id);

        let created = get_slot(&conn, &override_id).unwrap().unwrap();
        assert_eq!(created.date.as_deref(), Some("2025-09-08"));
        assert_eq!(created.status.as_deref(), Some("cancelled"));
        assert_eq!(created.period, 3);
        assert_eq!(created.subject_id.as_deref(), Some(subject.as_str()));
        assert_eq!(created.room.as_deref(), Some("212"));

        // The template itself is untouched.
        let tpl = get_slot(&conn, &template_id).unwrap().unwrap();
        assert_eq!(tpl.date, None);
        assert_eq!(tpl.status, None);
    }

    #[test]
    fn set_status_twice_updates_the_single_override_row() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let class = seed_class(&conn, "7SW");
        let template_id =
            insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();

        let first = set_status(&conn, &template_id, "2025-09-08", "cancelled").unwrap();
        let second = set_status(&conn, &template_id, "2025-09-08", "room_change").unwrap();
        assert_eq!(first, second);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM timetable WHERE date = '2025-09-08'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        let row = get_slot(&conn, &first).unwrap().unwrap();
        assert_eq!(row.status.as_deref(), Some("room_change"));
    }

    #[test]
    fn set_status_matches_null_group_fields_null_aware() {
        // Course-only template: class_id NULL on both sides must match.
        let conn = test_conn();
        let subject = seed_subject(&conn, "M");
        let course_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO courses(id, name) VALUES(?, '10F')",
            [&course_id],
        )
        .unwrap();
        let slot = NewSlot {
            weekday: Weekday::Tuesday,
            period: 5,
            is_double: false,
            date: None,
            subject_id: Some(subject.clone()),
            class_id: None,
            course_id: Some(course_id),
            room: None,
            status: None,
        };
        let template_id = insert_slot(&conn, &slot).unwrap();

        let first = set_status(&conn, &template_id, "2025-09-09", "cancelled").unwrap();
        let second = set_status(&conn, &template_id, "2025-09-09", "cancelled").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn set_status_on_unknown_id_is_not_found() {
        let conn = test_conn();
        let err = set_status(&conn, "missing", "2025-09-08", "cancelled").unwrap_err();
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn clear_override_deletes_only_dated_rows() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let class = seed_class(&conn, "7SW");
        let template_id =
            insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();
        let override_id = set_status(&conn, &template_id, "2025-09-08", "cancelled").unwrap();

        clear_override(&conn, &override_id).expect("clear override");
        assert!(get_slot(&conn, &override_id).unwrap().is_none());

        // Template deletion through this path is rejected, not ignored.
        let err = clear_override(&conn, &template_id).unwrap_err();
        assert_eq!(err.code, "protected_template");
        assert!(get_slot(&conn, &template_id).unwrap().is_some());

        let err = clear_override(&conn, "missing").unwrap_err();
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn cancelled_override_resolves_for_its_date() {
        let conn = test_conn();
        let subject = seed_subject(&conn, "PH");
        let class = seed_class(&conn, "7SW");
        let template_id =
            insert_slot(&conn, &template(&subject, &class, Weekday::Monday, 3)).unwrap();
        set_status(&conn, &template_id, "2025-09-08", "cancelled").unwrap();

        let pattern = SchedulePattern::default();
        let row = resolve(&conn, date("2025-09-08"), Weekday::Monday, 3, &pattern)
            .unwrap()
            .expect("slot resolves");
        assert_eq!(row.status.as_deref(), Some("cancelled"));
    }
}
