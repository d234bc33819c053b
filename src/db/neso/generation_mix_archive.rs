use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use duckdb::types::{Type, Value};
use duckdb::{params_from_iter, AccessMode, Connection};
use itertools::Itertools;
use jiff::Timestamp;
use log::info;

use crate::errors::IngestError;
use crate::utils::lib_duckdb::open_with_retry;

use super::generation_mix::{
    clean_records, columns, format_timestamp, parse_timestamp, CleanReport, Measurement,
    Observation, DATETIME,
};
use super::lib_neso::{build_sql_query, NesoConfig, RecordSource, Window};

#[derive(Debug, Clone)]
pub struct NesoGenerationMixArchive {
    pub config: NesoConfig,
    pub duckdb_path: String,
    pub table: String,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub window: Window,
    pub report: CleanReport,
    pub upserted: usize,
    pub elapsed: Duration,
}

impl NesoGenerationMixArchive {
    pub fn window(&self, now: Timestamp) -> Result<Window, IngestError> {
        Window::last(self.config.lookback, now)
    }

    pub fn sql_query(&self, window: &Window) -> String {
        build_sql_query(&self.config.resource_id, &columns(), window)
    }

    /// Open (creating if needed) the DuckDB file for writing.
    pub fn open_store(&self) -> Result<GenerationMixStore, IngestError> {
        if let Some(dir) = Path::new(&self.duckdb_path).parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let conn = open_with_retry(
            &self.duckdb_path,
            8,
            Duration::from_millis(25),
            AccessMode::ReadWrite,
        )?;
        Ok(GenerationMixStore::new(conn, &self.table))
    }

    /// Fetch the lookback window ending at `now`, clean it and upsert it.
    /// The store is only opened once the remote data is in hand.  An empty
    /// result leaves the store untouched.
    pub fn update_duckdb<S: RecordSource>(
        &self,
        source: &S,
        now: Timestamp,
    ) -> Result<RunSummary, IngestError> {
        let t0 = Instant::now();
        info!("Ingest started");
        let window = self.window(now)?;
        info!("Window {}", window);

        let records = source.fetch(&self.sql_query(&window))?;
        if records.is_empty() {
            info!("No rows returned");
            return Ok(RunSummary {
                window,
                report: CleanReport::default(),
                upserted: 0,
                elapsed: t0.elapsed(),
            });
        }

        let (observations, report) = clean_records(&records, self.config.reject_negative);

        let mut store = self.open_store()?;
        store.ensure_schema()?;
        let upserted = store.upsert(&observations)?;
        let elapsed = t0.elapsed();
        info!(
            "Upserted {} rows into {} -> table '{}' ({:.2}s)",
            upserted,
            self.duckdb_path,
            self.table,
            elapsed.as_secs_f64()
        );

        Ok(RunSummary {
            window,
            report,
            upserted,
            elapsed,
        })
    }
}

/// The local table, keyed by the canonical timestamp.
pub struct GenerationMixStore {
    conn: Connection,
    table: String,
}

impl GenerationMixStore {
    pub fn new(conn: Connection, table: &str) -> Self {
        GenerationMixStore {
            conn,
            table: table.to_string(),
        }
    }

    pub fn in_memory(table: &str) -> Result<Self, IngestError> {
        Ok(GenerationMixStore::new(Connection::open_in_memory()?, table))
    }

    /// Create the table if it doesn't exist.  Existing rows are never touched.
    pub fn ensure_schema(&self) -> Result<(), IngestError> {
        let sql = format!(
            r#"
CREATE TABLE IF NOT EXISTS "{}" (
    "{}" VARCHAR PRIMARY KEY,
    {}
);"#,
            self.table,
            DATETIME,
            Measurement::ALL
                .iter()
                .map(|m| format!("\"{}\" DOUBLE", m.column_name()))
                .join(",\n    "),
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    fn upsert_sql(&self) -> String {
        let cols = columns();
        format!(
            r#"INSERT INTO "{}" ({}) VALUES ({}) ON CONFLICT ("{}") DO UPDATE SET {}"#,
            self.table,
            cols.iter().map(|c| format!("\"{}\"", c)).join(", "),
            cols.iter().map(|_| "?").join(", "),
            DATETIME,
            Measurement::ALL
                .iter()
                .map(|m| format!("\"{0}\" = excluded.\"{0}\"", m.column_name()))
                .join(", "),
        )
    }

    /// Insert new timestamps and fully overwrite the measurements of existing
    /// ones, all in a single transaction.  On error nothing is written.
    /// Timestamps must be unique within the batch.
    pub fn upsert(&mut self, observations: &[Observation]) -> Result<usize, IngestError> {
        let sql = self.upsert_sql();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for obs in observations {
                let params = std::iter::once(Value::Text(obs.canonical_timestamp())).chain(
                    obs.values().iter().map(|v| match v {
                        Some(x) => Value::Double(*x),
                        None => Value::Null,
                    }),
                );
                stmt.execute(params_from_iter(params))?;
            }
        }
        tx.commit()?;
        Ok(observations.len())
    }

    /// Stored observations with `start <= timestamp <= end`, in time order.
    pub fn get_observations(
        &self,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<Observation>, IngestError> {
        let query = format!(
            r#"SELECT {} FROM "{}" WHERE "{2}" >= ? AND "{2}" <= ? ORDER BY "{2}";"#,
            columns().iter().map(|c| format!("\"{}\"", c)).join(", "),
            self.table,
            DATETIME,
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([format_timestamp(start), format_timestamp(end)], |row| {
            let key: String = row.get(0)?;
            let timestamp = parse_timestamp(&key).ok_or_else(|| {
                duckdb::Error::FromSqlConversionFailure(
                    0,
                    Type::Text,
                    format!("invalid timestamp {}", key).into(),
                )
            })?;
            let mut values = [None; 13];
            for (i, v) in values.iter_mut().enumerate() {
                *v = row.get::<_, Option<f64>>(i + 1)?;
            }
            Ok(Observation::new(timestamp, values))
        })?;
        let observations = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(observations)
    }

    /// Mean carbon intensity over `[start, end]`, ignoring nulls.
    pub fn average_carbon_intensity(
        &self,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Option<f64>, IngestError> {
        let query = format!(
            r#"SELECT AVG("{}") FROM "{}" WHERE "{2}" >= ? AND "{2}" <= ?;"#,
            Measurement::CarbonIntensity.column_name(),
            self.table,
            DATETIME,
        );
        let avg = self.conn.query_row(
            &query,
            [format_timestamp(start), format_timestamp(end)],
            |row| row.get::<_, Option<f64>>(0),
        )?;
        Ok(avg)
    }

    pub fn count(&self) -> Result<usize, IngestError> {
        let n: i64 = self.conn.query_row(
            &format!(r#"SELECT COUNT(*) FROM "{}";"#, self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use jiff::SignedDuration;
    use serde_json::{json, Value as Json};

    use super::*;
    use crate::db::neso::generation_mix::RawRecord;
    use crate::db::neso::lib_neso::StatusPolicy;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn obs(s: &str, gas: Option<f64>) -> Observation {
        let mut values = [Some(1.0); 13];
        values[0] = gas;
        Observation::new(ts(s), values)
    }

    fn raw(datetime: &str, gas: &str) -> RawRecord {
        let mut m = RawRecord::new();
        m.insert("DATETIME".to_string(), json!(datetime));
        for c in columns().iter().skip(1) {
            m.insert(c.to_string(), json!("10.0"));
        }
        m.insert("GAS".to_string(), Json::String(gas.to_string()));
        m
    }

    fn all(store: &GenerationMixStore) -> Vec<Observation> {
        store
            .get_observations(&ts("2000-01-01T00:00:00Z"), &ts("2100-01-01T00:00:00Z"))
            .unwrap()
    }

    struct FakeSource {
        records: Vec<RawRecord>,
        calls: Cell<usize>,
    }

    impl FakeSource {
        fn new(records: Vec<RawRecord>) -> Self {
            FakeSource {
                records,
                calls: Cell::new(0),
            }
        }
    }

    impl RecordSource for FakeSource {
        fn fetch(&self, sql: &str) -> Result<Vec<RawRecord>, IngestError> {
            assert!(sql.contains(r#"FROM "test-resource""#));
            self.calls.set(self.calls.get() + 1);
            Ok(self.records.clone())
        }
    }

    struct UnavailableSource;

    impl RecordSource for UnavailableSource {
        fn fetch(&self, _sql: &str) -> Result<Vec<RawRecord>, IngestError> {
            Err(IngestError::RemoteService {
                status: Some(503),
                message: "Service Unavailable".to_string(),
            })
        }
    }

    fn archive(dir: &Path) -> NesoGenerationMixArchive {
        NesoGenerationMixArchive {
            config: NesoConfig {
                base_url: "http://localhost:0".to_string(),
                resource_id: "test-resource".to_string(),
                lookback: SignedDuration::from_hours(3 * 24),
                timeout: Duration::from_secs(60),
                status_policy: StatusPolicy::OkOnly,
                reject_negative: false,
            },
            duckdb_path: dir.join("data/generation.duckdb").to_str().unwrap().to_string(),
            table: "mix".to_string(),
        }
    }

    #[test]
    fn ensure_schema_is_idempotent() -> Result<(), IngestError> {
        let mut store = GenerationMixStore::in_memory("mix")?;
        store.ensure_schema()?;
        store.upsert(&[obs("2025-10-20T20:30:00Z", Some(5.0))])?;
        store.ensure_schema()?;
        store.ensure_schema()?;
        assert_eq!(store.count()?, 1);
        assert_eq!(all(&store)[0].get(Measurement::Gas), Some(5.0));
        Ok(())
    }

    #[test]
    fn upsert_overwrites_whole_row() -> Result<(), IngestError> {
        let mut store = GenerationMixStore::in_memory("mix")?;
        store.ensure_schema()?;
        let n = store.upsert(&[
            obs("2025-10-20T20:30:00Z", Some(11691.0)),
            obs("2025-10-20T21:00:00Z", Some(12050.0)),
        ])?;
        assert_eq!(n, 2);

        // a null replaces the stored value, no field-by-field merge
        let mut values = [None; 13];
        values[1] = Some(4000.0);
        store.upsert(&[Observation::new(ts("2025-10-20T20:30:00Z"), values)])?;

        let rows = all(&store);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].canonical_timestamp(), "2025-10-20T20:30:00Z");
        assert_eq!(rows[0].get(Measurement::Gas), None);
        assert_eq!(rows[0].get(Measurement::Coal), Some(4000.0));
        assert_eq!(rows[0].get(Measurement::CarbonIntensity), None);
        assert_eq!(rows[1].get(Measurement::Gas), Some(12050.0));
        Ok(())
    }

    #[test]
    fn failed_batch_rolls_back() -> Result<(), IngestError> {
        let mut store = GenerationMixStore::in_memory("mix")?;
        store.conn.execute_batch(
            r#"CREATE TABLE "mix" (
    "DATETIME" VARCHAR PRIMARY KEY,
    "GAS" DOUBLE CHECK ("GAS" < 1000), "COAL" DOUBLE, "NUCLEAR" DOUBLE,
    "WIND" DOUBLE, "WIND_EMB" DOUBLE, "HYDRO" DOUBLE, "IMPORTS" DOUBLE,
    "BIOMASS" DOUBLE, "OTHER" DOUBLE, "SOLAR" DOUBLE, "STORAGE" DOUBLE,
    "GENERATION" DOUBLE, "CARBON_INTENSITY" DOUBLE
);"#,
        )?;
        store.ensure_schema()?;
        store.upsert(&[obs("2025-10-20T20:00:00Z", Some(1.0))])?;

        let res = store.upsert(&[
            obs("2025-10-20T20:00:00Z", Some(2.0)),
            obs("2025-10-20T20:30:00Z", Some(3.0)),
            obs("2025-10-20T21:00:00Z", Some(5000.0)),
        ]);
        assert!(matches!(res, Err(IngestError::Storage(_))));

        let rows = all(&store);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(Measurement::Gas), Some(1.0));
        Ok(())
    }

    #[test]
    fn read_window_is_inclusive_and_ordered() -> Result<(), IngestError> {
        let mut store = GenerationMixStore::in_memory("mix")?;
        store.ensure_schema()?;
        store.upsert(&[
            obs("2025-10-21T00:00:00Z", Some(3.0)),
            obs("2025-10-20T00:00:00Z", Some(1.0)),
            obs("2025-10-20T12:00:00Z", Some(2.0)),
        ])?;
        let rows = store.get_observations(&ts("2025-10-20T00:00:00Z"), &ts("2025-10-20T23:59:59Z"))?;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].timestamp < rows[1].timestamp);

        let rows = store.get_observations(&ts("2025-10-20T00:00:00Z"), &ts("2025-10-21T00:00:00Z"))?;
        assert_eq!(rows.len(), 3);

        let none = store.get_observations(&ts("2024-01-01T00:00:00Z"), &ts("2024-01-02T00:00:00Z"))?;
        assert!(none.is_empty());
        Ok(())
    }

    #[test]
    fn average_carbon_intensity_skips_nulls() -> Result<(), IngestError> {
        let mut store = GenerationMixStore::in_memory("mix")?;
        store.ensure_schema()?;
        let mut a = [None; 13];
        a[12] = Some(100.0);
        let mut b = [None; 13];
        b[12] = Some(200.0);
        store.upsert(&[
            Observation::new(ts("2025-10-20T00:00:00Z"), a),
            Observation::new(ts("2025-10-20T00:30:00Z"), b),
            Observation::new(ts("2025-10-20T01:00:00Z"), [None; 13]),
        ])?;
        let avg = store
            .average_carbon_intensity(&ts("2025-10-20T00:00:00Z"), &ts("2025-10-21T00:00:00Z"))?;
        assert_eq!(avg, Some(150.0));
        let empty = store
            .average_carbon_intensity(&ts("2024-10-20T00:00:00Z"), &ts("2024-10-21T00:00:00Z"))?;
        assert_eq!(empty, None);
        Ok(())
    }

    #[test]
    fn update_is_idempotent() -> Result<(), IngestError> {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(dir.path());
        let source = FakeSource::new(vec![
            raw("2025-10-20T20:30:00Z", "11691.0"),
            raw("bad", "10"),
            raw("2025-10-20T20:30:00Z", "12000.0"),
            raw("2025-10-20T21:00:00Z", "n/a"),
        ]);
        let now = ts("2025-10-21T00:00:00Z");

        let first = archive.update_duckdb(&source, now)?;
        assert_eq!(first.upserted, 2);
        assert_eq!(first.report.fetched, 4);
        assert_eq!(first.report.bad_timestamp, 1);
        assert_eq!(first.window.start_iso(), "2025-10-18T00:00:00Z");
        let before = all(&archive.open_store()?);

        let second = archive.update_duckdb(&source, now)?;
        assert_eq!(second.upserted, 2);
        let store = archive.open_store()?;
        assert_eq!(store.count()?, 2);
        let after = all(&store);
        assert_eq!(before, after);
        assert_eq!(after[0].get(Measurement::Gas), Some(12000.0));
        assert_eq!(after[1].get(Measurement::Gas), None);
        assert_eq!(source.calls.get(), 2);
        Ok(())
    }

    #[test]
    fn empty_result_leaves_store_unchanged() -> Result<(), IngestError> {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(dir.path());
        let summary = archive.update_duckdb(&FakeSource::new(vec![]), ts("2025-10-21T00:00:00Z"))?;
        assert_eq!(summary.upserted, 0);
        assert_eq!(summary.report.fetched, 0);
        assert!(!Path::new(&archive.duckdb_path).exists());
        Ok(())
    }

    #[test]
    fn remote_failure_leaves_store_unchanged() -> Result<(), IngestError> {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive(dir.path());
        let now = ts("2025-10-21T00:00:00Z");
        archive.update_duckdb(&FakeSource::new(vec![raw("2025-10-20T20:30:00Z", "1.0")]), now)?;

        let res = archive.update_duckdb(&UnavailableSource, now);
        assert!(matches!(
            res,
            Err(IngestError::RemoteService {
                status: Some(503),
                ..
            })
        ));
        let rows = all(&archive.open_store()?);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(Measurement::Gas), Some(1.0));
        Ok(())
    }
}
