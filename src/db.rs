use crate::schema::MIGRATIONS;
use crate::RecapError;
use rusqlite::Connection;
use std::path::Path;

#[cfg(unix)]
fn ensure_secure_permissions(db_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let Some(dir) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        // Only set permissions on dirs we created
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    if db_path.exists() {
        std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_secure_permissions(db_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = db_path.parent().filter(|p| !p.as_os_str().is_empty())
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Apply standard PRAGMAs (before migrations).
pub(crate) fn apply_pragmas(conn: &Connection, readonly: bool) -> Result<(), RecapError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    if !readonly {
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
    }
    Ok(())
}

pub fn open_db_readonly(db_path: &Path) -> Result<Connection, RecapError> {
    if !db_path.exists() {
        return Err(RecapError::Config(format!(
            "database not found: {}",
            db_path.display()
        )));
    }

    let conn = Connection::open_with_flags(
        db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    apply_pragmas(&conn, true)?;
    Ok(conn)
}

/// Open (creating if needed) the ledger database and bring its schema to the latest version.
pub fn open_db(db_path: &Path) -> Result<Connection, RecapError> {
    ensure_secure_permissions(db_path)?;

    let mut conn = Connection::open(db_path)?;
    apply_pragmas(&conn, false)?;
    MIGRATIONS.to_latest(&mut conn)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(conn)
}

/// In-memory ledger database with the full schema, for tests and dry runs.
pub fn open_db_in_memory() -> Result<Connection, RecapError> {
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    MIGRATIONS.to_latest(&mut conn)?;
    Ok(conn)
}
