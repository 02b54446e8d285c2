use rusqlite::{params, Connection};
use serde_json::Value;

pub fn get(conn: &Connection, name: &str) -> anyhow::Result<Option<Value>> {
    let mut stmt = conn.prepare("SELECT value FROM options WHERE name = ?")?;
    let mut rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(raw) => Ok(Some(serde_json::from_str(&raw?)?)),
        None => Ok(None),
    }
}

pub fn set(conn: &Connection, name: &str, value: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO options (name, value, updated_at) VALUES (?1, ?2, strftime('%s','now'))
         ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![name, value.to_string()],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    let n = conn.execute("DELETE FROM options WHERE name = ?", params![name])?;
    Ok(n > 0)
}

