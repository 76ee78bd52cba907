//! SQLite PRAGMA setup for the ingest journal

use rusqlite::Connection;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How hard the journal works to keep the most recent appends
///
/// - `Full`: every append transaction is fsynced before it returns
/// - `Normal`: WAL is synced at checkpoints; a power loss can drop the latest
///   appends, a process crash cannot
/// - `Off`: no fsync at all, maximum throughput
///
/// The journal buffers ahead of a duplicate-tolerant sink and is not the
/// system of record, so relaxing this is a throughput trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    #[default]
    Full,
    Normal,
    Off,
}

impl Durability {
    fn synchronous(&self) -> &'static str {
        match self {
            Durability::Full => "FULL",
            Durability::Normal => "NORMAL",
            Durability::Off => "OFF",
        }
    }
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(Durability::Full),
            "normal" => Ok(Durability::Normal),
            "off" => Ok(Durability::Off),
            other => Err(format!(
                "unknown durability '{}' (expected full, normal or off)",
                other
            )),
        }
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.synchronous().to_lowercase())
    }
}

/// Apply journal PRAGMAs (WAL, synchronous per durability, MEMORY temp store,
/// autocheckpoint, busy timeout)
pub fn apply_journal_pragmas(conn: &Connection, durability: Durability) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("⚠️  SQLite refused WAL mode, journal running in {} mode", mode);
    }

    conn.pragma_update(None, "synchronous", durability.synchronous())?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(Duration::from_secs(5))?;

    Ok(())
}
