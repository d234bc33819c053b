use std::{env, time::Duration};

use jiff::SignedDuration;

use crate::db::neso::{
    generation_mix_archive::NesoGenerationMixArchive,
    lib_neso::{NesoConfig, StatusPolicy},
};
use crate::errors::IngestError;

pub struct ProdDb {}

impl ProdDb {
    /// Historic GB generation mix.  Paths and the resource id can be overridden
    /// from the environment (see `.env/<env>.env`).
    pub fn neso_generation_mix() -> Result<NesoGenerationMixArchive, IngestError> {
        let lookback_days: i64 = parse_var("NESO_LOOKBACK_DAYS", "14")?;
        if lookback_days <= 0 {
            return Err(IngestError::Config(format!(
                "NESO_LOOKBACK_DAYS must be positive, got {}",
                lookback_days
            )));
        }
        let table = var_or("NESO_TABLE", "mix");
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(IngestError::Config(format!("invalid table name {:?}", table)));
        }

        Ok(NesoGenerationMixArchive {
            config: NesoConfig {
                base_url: var_or("NESO_BASE_URL", "https://api.neso.energy/api/3/action"),
                resource_id: var_or("NESO_RESOURCE_ID", "f93d1835-75bc-43e5-84ad-12472b180a98"),
                lookback: SignedDuration::from_hours(24 * lookback_days),
                timeout: Duration::from_secs(60),
                status_policy: parse_var("NESO_HTTP_STATUS_POLICY", "ok-only")?,
                reject_negative: parse_var("NESO_REJECT_NEGATIVE", "false")?,
            },
            duckdb_path: var_or("NESO_DUCKDB_PATH", "data/generation.duckdb"),
            table,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T, IngestError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = var_or(key, default);
    value
        .trim()
        .parse::<T>()
        .map_err(|e| IngestError::Config(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only touches variables no other test sets.
    #[test]
    fn parse_vars() {
        env::set_var("GRIDMIX_TEST_DAYS", " 3 ");
        assert_eq!(parse_var::<i64>("GRIDMIX_TEST_DAYS", "14").unwrap(), 3);
        assert_eq!(parse_var::<i64>("GRIDMIX_TEST_UNSET", "14").unwrap(), 14);
        env::set_var("GRIDMIX_TEST_POLICY", "sometimes");
        assert!(matches!(
            parse_var::<StatusPolicy>("GRIDMIX_TEST_POLICY", "ok-only"),
            Err(IngestError::Config(_))
        ));
        assert!(!parse_var::<bool>("GRIDMIX_TEST_UNSET", "false").unwrap());
    }

    #[test]
    fn defaults() -> Result<(), IngestError> {
        let archive = ProdDb::neso_generation_mix()?;
        assert_eq!(archive.config.timeout, Duration::from_secs(60));
        assert!(archive.config.lookback.is_positive());
        Ok(())
    }
}
