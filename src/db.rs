use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("assess.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates or migrates the workspace schema. Separate from `open_db` so
/// tests can run it against an in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            track TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS children(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            display_code TEXT,
            birth_date TEXT,
            age_band TEXT NOT NULL DEFAULT 'mixed',
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    ensure_children_age_band(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_children_classroom ON children(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_children_classroom_sort ON children(classroom_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            owner_user_id TEXT NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            FOREIGN KEY(owner_user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_classroom ON enrollments(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instruments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            instrument_type TEXT NOT NULL,
            version INTEGER NOT NULL,
            effective_from TEXT,
            effective_to TEXT,
            schema_sha256 TEXT NOT NULL,
            schema_json TEXT NOT NULL,
            created_at TEXT,
            UNIQUE(instrument_type, version)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instruments_type ON instruments(instrument_type)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instruments_category ON instruments(category)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activities(
            ref TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            phase TEXT NOT NULL,
            instrument_id TEXT,
            title TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_instances(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            activity_ref TEXT NOT NULL,
            phase TEXT NOT NULL,
            instrument_id TEXT,
            instrument_version INTEGER,
            status TEXT NOT NULL,
            submitted_at TEXT,
            created_at TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            FOREIGN KEY(activity_ref) REFERENCES activities(ref),
            UNIQUE(enrollment_id, activity_ref)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instances_enrollment ON assessment_instances(enrollment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instances_classroom ON assessment_instances(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answer_rows(
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            child_id TEXT NOT NULL,
            answers TEXT NOT NULL,
            status TEXT NOT NULL,
            skip_reason TEXT,
            frozen_age_band TEXT,
            frozen_instrument_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(instance_id) REFERENCES assessment_instances(id),
            FOREIGN KEY(child_id) REFERENCES children(id),
            UNIQUE(instance_id, child_id)
        )",
        [],
    )?;
    ensure_answer_rows_frozen_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answer_rows_instance ON answer_rows(instance_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answer_rows_child ON answer_rows(child_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS self_responses(
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            section_key TEXT NOT NULL,
            item_key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(instance_id) REFERENCES assessment_instances(id),
            UNIQUE(instance_id, section_key, item_key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_self_responses_instance ON self_responses(instance_id)",
        [],
    )?;

    // Migrate older workspaces that wrote the pre-rename row state.
    migrate_answer_row_statuses(conn)?;

    Ok(())
}

fn ensure_children_age_band(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "children", "age_band")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE children ADD COLUMN age_band TEXT NOT NULL DEFAULT 'mixed'",
        [],
    )?;
    Ok(())
}

fn ensure_answer_rows_frozen_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "answer_rows", "frozen_age_band")? {
        conn.execute("ALTER TABLE answer_rows ADD COLUMN frozen_age_band TEXT", [])?;
    }
    if !table_has_column(conn, "answer_rows", "frozen_instrument_id")? {
        conn.execute(
            "ALTER TABLE answer_rows ADD COLUMN frozen_instrument_id TEXT",
            [],
        )?;
    }
    Ok(())
}

fn migrate_answer_row_statuses(conn: &Connection) -> anyhow::Result<()> {
    // Older DBs used status="removed" for a child who left the roster. The
    // split into not_in_classroom / stale_at_submit came later; plain
    // "removed" maps to the view-load variant.
    conn.execute(
        "UPDATE answer_rows SET status = 'not_in_classroom' WHERE status = 'removed'",
        [],
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
