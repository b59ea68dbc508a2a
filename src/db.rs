use chrono::Local;
use rusqlite::Connection;
use std::path::Path;

use crate::auth;

pub const DB_FILE: &str = "registrar.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            student_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            gender TEXT,
            birth_date TEXT,
            class_name TEXT,
            admission_date TEXT,
            contact_phone TEXT,
            email TEXT,
            address TEXT,
            status TEXT NOT NULL DEFAULT 'enrolled',
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_name ON students(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            course_id TEXT PRIMARY KEY,
            course_name TEXT NOT NULL,
            credit REAL NOT NULL,
            teacher TEXT,
            description TEXT,
            semester TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester TEXT NOT NULL,
            score REAL NOT NULL,
            grade_point REAL NOT NULL,
            exam_date TEXT,
            remarks TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(student_id),
            FOREIGN KEY(course_id) REFERENCES courses(course_id),
            UNIQUE(student_id, course_id, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_course ON grades(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_semester ON grades(semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            semester TEXT NOT NULL,
            day_of_week INTEGER NOT NULL,
            start_section INTEGER NOT NULL,
            end_section INTEGER NOT NULL,
            location TEXT NOT NULL,
            teacher TEXT,
            week_type INTEGER NOT NULL DEFAULT 0,
            start_week INTEGER NOT NULL,
            end_week INTEGER NOT NULL,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(course_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_semester_day ON schedules(semester, day_of_week)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_course ON schedules(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            username TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL,
            real_name TEXT,
            role TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            last_login TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS operation_logs(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            operation TEXT NOT NULL,
            target TEXT,
            details TEXT,
            ip_address TEXT,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operation_logs_username ON operation_logs(username)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operation_logs_timestamp ON operation_logs(timestamp)",
        [],
    )?;

    seed_default_admin(&conn)?;

    Ok(conn)
}

/// Every write requires a logged-in principal and logging in requires a
/// user row, so an empty users table gets a bootstrap admin.
fn seed_default_admin(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }

    let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    conn.execute(
        "INSERT INTO users(username, password_hash, real_name, role, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            "admin",
            auth::hash_password("admin123"),
            "System Administrator",
            "admin",
            &now,
            &now,
        ),
    )?;
    log::info!("seeded default admin account");
    Ok(())
}
