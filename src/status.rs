use crate::db::open_db_readonly;
use crate::RecapError;
use rusqlite::Connection;
use std::path::Path;

pub fn handle_status(db_path: &Path) -> Result<(), RecapError> {
    if !db_path.exists() {
        println!("recap: no database at {}", db_path.display());
        return Ok(());
    }

    let db_size = std::fs::metadata(db_path)?.len();
    let wal_path = db_path.with_extension("db-wal");
    let wal_size = std::fs::metadata(&wal_path).map(|m| m.len()).ok();

    let conn = open_db_readonly(db_path)?;
    let counts = table_counts(&conn)?;
    let per_conversation = conversation_breakdown(&conn)?;

    let last_summary: Option<(i64, String)> = conn
        .query_row(
            "SELECT created_at, conversation_id FROM summaries ORDER BY id DESC LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok();

    match wal_size {
        Some(ws) => println!("database: {} (+{} WAL)", fmt_size(db_size), fmt_size(ws)),
        None => println!("database: {}", fmt_size(db_size)),
    }
    println!("conversations: {}", counts.0);
    for (id, name, n) in &per_conversation {
        if name.is_empty() {
            println!("  {id}: {n} messages");
        } else {
            println!("  {id} ({name}): {n} messages");
        }
    }
    println!("messages: {}", counts.1);
    println!("skipped: {}", counts.2);
    println!("summaries: {}", counts.3);
    if let Some((ts, id)) = last_summary {
        println!("last summary: {} ({id})", format_epoch_date(ts));
    }

    Ok(())
}

fn table_counts(conn: &Connection) -> Result<(i64, i64, i64, i64), RecapError> {
    let count = |table: &str| -> Result<i64, RecapError> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
    };
    Ok((
        count("conversations")?,
        count("messages")?,
        count("skipped_messages")?,
        count("summaries")?,
    ))
}

fn conversation_breakdown(conn: &Connection) -> Result<Vec<(String, String, i64)>, RecapError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, COUNT(m.id)
         FROM conversations c LEFT JOIN messages m ON m.conversation_id = c.id
         GROUP BY c.id ORDER BY c.id",
    )?;
    let rows = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

fn format_epoch_date(epoch_secs: i64) -> String {
    let (y, m, d) = civil_from_days(epoch_secs.div_euclid(86400));
    format!("{y:04}-{m:02}-{d:02}")
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = (z - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

fn fmt_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
