use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEventRow {
    pub id: i64,
    pub run_at: i64,
    pub hook: String,
    pub args: Value,
    pub created_at: i64,
}

fn row_to_event(row: &Row) -> rusqlite::Result<ScheduledEventRow> {
    let args: String = row.get("args")?;
    Ok(ScheduledEventRow {
        id: row.get("id")?,
        run_at: row.get("run_at")?,
        hook: row.get("hook")?,
        args: serde_json::from_str(&args).unwrap_or(Value::Null),
        created_at: row.get("created_at")?,
    })
}

/// Keep one pending row per hook+args; a second request can only move it earlier.
pub fn schedule(conn: &Connection, run_at: i64, hook: &str, args: &Value) -> anyhow::Result<()> {
    let args = args.to_string();
    let updated = conn.execute(
        "UPDATE scheduled_events SET run_at = MIN(run_at, ?1) WHERE hook = ?2 AND args = ?3",
        params![run_at, hook, args],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO scheduled_events (run_at, hook, args) VALUES (?1, ?2, ?3)",
            params![run_at, hook, args],
        )?;
    }
    Ok(())
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<ScheduledEventRow>> {
    let mut stmt = conn.prepare("SELECT * FROM scheduled_events ORDER BY run_at ASC")?;
    let rows = stmt.query_map([], |row| row_to_event(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Remove and return every row due at `now`.
pub fn take_due(conn: &mut Connection, now: i64) -> anyhow::Result<Vec<ScheduledEventRow>> {
    let tx = conn.transaction()?;
    let due = {
        let mut stmt = tx.prepare("SELECT * FROM scheduled_events WHERE run_at <= ? ORDER BY run_at ASC")?;
        let rows = stmt.query_map(params![now], |row| row_to_event(row))?;
        rows.filter_map(|r| r.ok()).collect::<Vec<_>>()
    };
    tx.execute("DELETE FROM scheduled_events WHERE run_at <= ?", params![now])?;
    tx.commit()?;
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use serde_json::json;

    #[test]
    fn test_schedule_dedupes_and_take_due() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(dir.path().join("t.db").to_str().unwrap()).unwrap();
        migrate(&pool).unwrap();
        let mut conn = pool.get().unwrap();

        schedule(&conn, 500, "tick", &json!({})).unwrap();
        schedule(&conn, 200, "tick", &json!({})).unwrap();
        schedule(&conn, 900, "tick", &json!({})).unwrap();
        schedule(&conn, 100, "other", &json!({"a": 1})).unwrap();

        let all = find_all(&conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].run_at, 200);

        let due = take_due(&mut conn, 150).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].hook, "other");
        assert_eq!(due[0].args, json!({"a": 1}));
        assert_eq!(find_all(&conn).unwrap().len(), 1);
    }
}
