use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const LOG_LIST_LIMIT: i64 = 200;

fn log_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, String> {
    let action_filter = params
        .get("action")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let sql = match &action_filter {
        Some(_) => {
            "SELECT id, timestamp, action, table_name, record_id, field_name, old_value, new_value, comment
             FROM change_log WHERE action = ? ORDER BY id DESC LIMIT ?"
        }
        None => {
            "SELECT id, timestamp, action, table_name, record_id, field_name, old_value, new_value, comment
             FROM change_log ORDER BY id DESC LIMIT ?"
        }
    };

    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, i64>(0)?,
            "timestamp": r.get::<_, String>(1)?,
            "action": r.get::<_, Option<String>>(2)?,
            "tableName": r.get::<_, Option<String>>(3)?,
            "recordId": r.get::<_, Option<String>>(4)?,
            "fieldName": r.get::<_, Option<String>>(5)?,
            "oldValue": r.get::<_, Option<String>>(6)?,
            "newValue": r.get::<_, Option<String>>(7)?,
            "comment": r.get::<_, Option<String>>(8)?
        }))
    };
    let rows: Vec<serde_json::Value> = match &action_filter {
        Some(action) => stmt
            .query_map((action, LOG_LIST_LIMIT), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| e.to_string())?,
        None => stmt
            .query_map([LOG_LIST_LIMIT], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| e.to_string())?,
    };
    Ok(json!({ "entries": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "log.list" {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match log_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(message) => err(&req.id, "db_query_failed", message, None),
    })
}
