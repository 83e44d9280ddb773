use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("pacetrack.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            term TEXT PRIMARY KEY,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            free_extension_days INTEGER NOT NULL DEFAULT 2,
            active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    ensure_terms_free_extension_days(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holidays(
            term TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            PRIMARY KEY(term, date),
            FOREIGN KEY(term) REFERENCES terms(term)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            course_id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            standards_based INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            sect TEXT NOT NULL,
            term TEXT NOT NULL,
            pace_order INTEGER,
            open_status TEXT,
            completed INTEGER NOT NULL DEFAULT 0,
            inc_in_progress INTEGER NOT NULL DEFAULT 0,
            inc_term TEXT,
            inc_counted INTEGER NOT NULL DEFAULT 0,
            inc_deadline TEXT,
            UNIQUE(student_id, course_id, term)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_student_term
         ON registrations(student_id, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pace_track_rules(
            id TEXT PRIMARY KEY,
            term TEXT NOT NULL,
            subterm TEXT,
            pace INTEGER NOT NULL,
            pace_track TEXT NOT NULL,
            criteria TEXT NOT NULL DEFAULT '',
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pace_track_rules_term
         ON pace_track_rules(term, pace, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS milestones(
            term TEXT NOT NULL,
            pace INTEGER NOT NULL,
            pace_track TEXT NOT NULL,
            pace_order INTEGER NOT NULL,
            unit INTEGER NOT NULL,
            ms_type TEXT NOT NULL,
            ms_date TEXT NOT NULL,
            PRIMARY KEY(term, pace, pace_track, pace_order, unit, ms_type)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_milestones_lookup
         ON milestones(term, pace, pace_track)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS milestone_overrides(
            id TEXT PRIMARY KEY,
            term TEXT NOT NULL,
            student_id TEXT NOT NULL,
            pace INTEGER NOT NULL,
            pace_track TEXT NOT NULL,
            pace_order INTEGER NOT NULL,
            unit INTEGER NOT NULL,
            ms_type TEXT NOT NULL,
            ms_date TEXT NOT NULL,
            prior_date TEXT,
            reason TEXT NOT NULL,
            attempts_allowed INTEGER,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_milestone_overrides_key
         ON milestone_overrides(term, student_id, pace, pace_track, pace_order, unit, ms_type)",
        [],
    )?;
    ensure_milestone_overrides_attempts(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS standard_milestones(
            term TEXT NOT NULL,
            pace INTEGER NOT NULL,
            pace_track TEXT NOT NULL,
            pace_order INTEGER NOT NULL,
            unit INTEGER NOT NULL,
            objective INTEGER NOT NULL,
            ms_date TEXT NOT NULL,
            PRIMARY KEY(term, pace, pace_track, pace_order, unit, objective)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS standard_milestone_overrides(
            id TEXT PRIMARY KEY,
            term TEXT NOT NULL,
            student_id TEXT NOT NULL,
            pace INTEGER NOT NULL,
            pace_track TEXT NOT NULL,
            pace_order INTEGER NOT NULL,
            unit INTEGER NOT NULL,
            objective INTEGER NOT NULL,
            ms_date TEXT NOT NULL,
            prior_date TEXT,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_standard_milestone_overrides_key
         ON standard_milestone_overrides(
             term, student_id, pace, pace_track, pace_order, unit, objective)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accommodations(
            student_id TEXT PRIMARY KEY,
            extension_days INTEGER NOT NULL,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mastery_exams(
            course_id TEXT NOT NULL,
            unit INTEGER NOT NULL,
            objective INTEGER NOT NULL,
            exam_id TEXT NOT NULL,
            PRIMARY KEY(course_id, unit, objective)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS homework_attempts(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            unit INTEGER NOT NULL,
            objective INTEGER NOT NULL,
            passed INTEGER NOT NULL,
            finished TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_homework_attempts_student
         ON homework_attempts(student_id, course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mastery_attempts(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            unit INTEGER NOT NULL,
            objective INTEGER NOT NULL,
            exam_id TEXT,
            passed INTEGER NOT NULL,
            finished TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mastery_attempts_student
         ON mastery_attempts(student_id, course_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_terms_free_extension_days(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate the per-term free pool size.
    if table_has_column(conn, "terms", "free_extension_days")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE terms ADD COLUMN free_extension_days INTEGER NOT NULL DEFAULT 2",
        [],
    )?;
    Ok(())
}

fn ensure_milestone_overrides_attempts(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "milestone_overrides", "attempts_allowed")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE milestone_overrides ADD COLUMN attempts_allowed INTEGER",
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
