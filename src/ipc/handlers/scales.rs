use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scale;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn scales_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, definition FROM grade_scales ORDER BY rowid")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;

    let scales: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, name, definition)| {
            let bands = scale::parse_definition(&definition);
            json!({
                "id": id,
                "name": name,
                "definition": definition,
                "bands": serde_json::to_value(&bands).unwrap_or(serde_json::Value::Null)
            })
        })
        .collect();
    Ok(json!({ "scales": scales }))
}

fn scales_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());
    let definition = params
        .get("definition")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());
    let (Some(name), Some(definition)) = (name, definition) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name and definition are required".to_string(),
        });
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_scales(id, name, definition) VALUES(?, ?, ?)",
        (&id, name, definition),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
    })?;
    let _ = audit::record(conn, "manual", "grade_scales", Some(&id), "create", "", name, None);

    let bands = scale::parse_definition(definition);
    Ok(json!({
        "id": id,
        "bandCount": bands.len()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(req.method.as_str(), "scales.list" | "scales.create");
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "scales.list" => scales_list(conn),
        "scales.create" => scales_create(conn, &req.params),
        _ => unreachable!(),
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}
