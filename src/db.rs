use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("klassenbuch.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema setup, shared by the workspace path and in-memory tests.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            short TEXT UNIQUE,
            name TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            teacher_id TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            class_id TEXT,
            leader_id TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(leader_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            short TEXT UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            class_id TEXT NOT NULL,
            course_id TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_course ON students(course_id)",
        [],
    )?;

    // date IS NULL marks a recurring template row; a non-null date pins the
    // row to one calendar day (override).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable(
            id TEXT PRIMARY KEY,
            weekday TEXT NOT NULL,
            period INTEGER NOT NULL,
            is_double INTEGER NOT NULL DEFAULT 0,
            date TEXT,
            subject_id TEXT,
            class_id TEXT,
            course_id TEXT,
            room TEXT,
            status TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE CASCADE,
            FOREIGN KEY(class_id) REFERENCES classes(id) ON DELETE CASCADE,
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_day_period ON timetable(weekday, period)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_date ON timetable(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            period INTEGER,
            status TEXT NOT NULL CHECK(status IN ('present','absent')),
            absent_minutes INTEGER NOT NULL DEFAULT 0,
            late_minutes INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance_records(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date_period ON attendance_records(date, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            period INTEGER,
            type TEXT NOT NULL CHECK(type IN ('performance','spontaneous')),
            subject TEXT,
            grade REAL,
            comment TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student ON grade_records(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_date_period ON grade_records(date, period)",
        [],
    )?;

    // definition holds one `label;min;max` band per line, in lookup order.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            definition TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS performance_queries(
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            description TEXT,
            subject_id TEXT,
            class_id TEXT,
            course_id TEXT,
            date TEXT NOT NULL,
            grade_scale_id TEXT,
            max_op_points REAL NOT NULL DEFAULT 0,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(grade_scale_id) REFERENCES grade_scales(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS performance_tasks(
            id TEXT PRIMARY KEY,
            performance_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            max_points REAL NOT NULL,
            FOREIGN KEY(performance_id) REFERENCES performance_queries(id) ON DELETE CASCADE,
            UNIQUE(performance_id, number)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS performance_results(
            id TEXT PRIMARY KEY,
            performance_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            op_points REAL NOT NULL DEFAULT 0,
            zp_points REAL NOT NULL DEFAULT 0,
            grade_override REAL,
            comment TEXT,
            op_is_edited INTEGER NOT NULL DEFAULT 0,
            zp_is_edited INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(performance_id) REFERENCES performance_queries(id) ON DELETE CASCADE,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            UNIQUE(performance_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_performance_results_query ON performance_results(performance_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS performance_task_results(
            id TEXT PRIMARY KEY,
            performance_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            task_number INTEGER NOT NULL,
            points REAL NOT NULL,
            is_edited INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(performance_id) REFERENCES performance_queries(id) ON DELETE CASCADE,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            UNIQUE(performance_id, student_id, task_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_performance_task_results_query
         ON performance_task_results(performance_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_log(
            id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%S','now')),
            action TEXT,
            table_name TEXT,
            record_id TEXT,
            field_name TEXT,
            old_value TEXT,
            new_value TEXT,
            comment TEXT
        )",
        [],
    )?;

    // Older workspaces predate the edit-audit flags on imported scores.
    ensure_result_edit_flags(conn)?;

    seed_default_grade_scale(conn)?;

    Ok(())
}

fn ensure_result_edit_flags(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "performance_results", "op_is_edited")? {
        conn.execute(
            "ALTER TABLE performance_results ADD COLUMN op_is_edited INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "performance_results", "zp_is_edited")? {
        conn.execute(
            "ALTER TABLE performance_results ADD COLUMN zp_is_edited INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "performance_task_results", "is_edited")? {
        conn.execute(
            "ALTER TABLE performance_task_results ADD COLUMN is_edited INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

/// 0.5-step scale from 1.0 to 6.0; right-exclusive bounds. Inserted only
/// into an empty grade_scales table so user-defined scales are never touched.
fn seed_default_grade_scale(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM grade_scales", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    let definition = [
        "1.0;93.0;100.1",
        "1.5;86.0;93.0",
        "2.0;79.0;86.0",
        "2.5;72.0;79.0",
        "3.0;65.0;72.0",
        "3.5;58.0;65.0",
        "4.0;51.0;58.0",
        "4.5;44.0;51.0",
        "5.0;31.5;44.0",
        "5.5;19.0;31.5",
        "6.0;0.0;19.0",
    ]
    .join("\n");
    conn.execute(
        "INSERT INTO grade_scales(id, name, definition) VALUES(?, ?, ?)",
        (
            uuid::Uuid::new_v4().to_string(),
            "Default (86/72/58/44/20, 0.5er)",
            definition,
        ),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
