use std::{error::Error, path::Path};

use clap::Parser;
use gridmix::db::{neso::lib_neso::NesoClient, prod_db::ProdDb};
use jiff::Timestamp;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,
}

/// Pull the last few days of the GB generation mix and upsert them into DuckDB.
/// Run this job every 30 minutes.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let env_file = format!(".env/{}.env", args.env);
    if let Err(e) = dotenvy::from_path(Path::new(&env_file)) {
        info!("Not loading {}: {}, using defaults", env_file, e);
    }

    let archive = ProdDb::neso_generation_mix()?;
    let client = NesoClient::new(&archive.config)?;
    match archive.update_duckdb(&client, Timestamp::now()) {
        Ok(summary) if summary.report.fetched == 0 => {
            println!("No rows returned");
            Ok(())
        }
        Ok(summary) => {
            println!(
                "Upserted {} rows into {} -> table '{}'",
                summary.upserted, archive.duckdb_path, archive.table
            );
            Ok(())
        }
        Err(e) => {
            error!("Ingest failed: {}", e);
            Err(e.into())
        }
    }
}
