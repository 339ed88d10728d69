use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::timetable;
use serde_json::json;

fn get_required_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn handle_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(timetable_id), Some(date), Some(status)) = (
        get_required_str(&req.params, "timetableId"),
        get_required_str(&req.params, "date"),
        get_required_str(&req.params, "status"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "timetableId, date and status are required",
            None,
        );
    };
    if chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_err() {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    }

    match timetable::set_status(conn, &timetable_id, &date, &status) {
        Ok(override_id) => ok(&req.id, json!({ "overrideId": override_id })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_uncancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(timetable_id) = get_required_str(&req.params, "timetableId") else {
        return err(&req.id, "bad_params", "missing timetableId", None);
    };

    match timetable::clear_override(conn, &timetable_id) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lesson.setStatus" => Some(handle_set_status(state, req)),
        "lesson.uncancel" => Some(handle_uncancel(state, req)),
        _ => None,
    }
}
