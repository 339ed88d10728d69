use rusqlite::Connection;

/// Appends one change-log row. Callers treat this as a best-effort side
/// channel: `let _ = audit::record(...)` — a failed log write must never
/// fail the primary operation.
pub fn record(
    conn: &Connection,
    action: &str,
    table_name: &str,
    record_id: Option<&str>,
    field_name: &str,
    old_value: &str,
    new_value: &str,
    comment: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO change_log(action, table_name, record_id, field_name, old_value, new_value, comment)
         VALUES(?,?,?,?,?,?,?)",
        (
            action, table_name, record_id, field_name, old_value, new_value, comment,
        ),
    )?;
    Ok(())
}
