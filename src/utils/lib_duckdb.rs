use std::time::Duration;

use duckdb::{AccessMode, Config, Connection};
use log::warn;

/// Open a DuckDB file, backing off while another process holds the lock
/// (e.g. a dashboard reading the same file).
/// Suggested `max_attempts = 8`, `initial_wait = Duration::from_millis(25)`.
pub fn open_with_retry(
    duckdb_path: &str,
    max_attempts: u32,
    initial_wait: Duration,
    access_mode: AccessMode,
) -> Result<Connection, duckdb::Error> {
    let mut attempts = 0;
    let mut wait_duration = initial_wait;

    loop {
        let config = Config::default().access_mode(match access_mode {
            AccessMode::Automatic => AccessMode::Automatic,
            AccessMode::ReadOnly => AccessMode::ReadOnly,
            AccessMode::ReadWrite => AccessMode::ReadWrite,
        })?;
        match Connection::open_with_flags(duckdb_path, config) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(e);
                }
                warn!(
                    "Failed to open {} (attempt {}/{}): {}, retrying in {:?}",
                    duckdb_path, attempts, max_attempts, e, wait_duration
                );
                std::thread::sleep(wait_duration);
                wait_duration *= 2;
            }
        }
    }
}
