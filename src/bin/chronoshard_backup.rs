//! Backup subcommand entry point
//!
//! Validates the flag combination, prepares the output directory, and
//! reports the backup plan. The snapshot transport that streams shard data
//! from a live node plugs in behind the request this produces.

use chronoshard::backup::{
    manifest_file_name, meta_file_name, portable_file_base, BackupArgs, BackupRange,
};
use clap::Parser;
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let request = BackupArgs::parse().validate()?;
    std::fs::create_dir_all(&request.path)?;

    info!(
        host = %request.host,
        database = request.database.as_deref().unwrap_or("<all>"),
        retention_policy = request.retention_policy.as_deref().unwrap_or("<all>"),
        portable = request.portable,
        "starting backup"
    );

    match &request.range {
        BackupRange::Full { since: Some(since) } => {
            println!("Backing up data since {}", since.to_rfc3339());
        }
        BackupRange::Full { since: None } => {
            println!("Backing up all data");
        }
        BackupRange::Export { start, end } => {
            println!(
                "Exporting data with boundaries start={} end={}",
                start.map(|t| t.to_rfc3339()).unwrap_or_default(),
                end.map(|t| t.to_rfc3339()).unwrap_or_default(),
            );
        }
    }

    if request.portable {
        let base = portable_file_base(chrono::Utc::now());
        println!("  Manifest: {}", request.path.join(manifest_file_name(&base)).display());
        println!("  Metadata: {}", request.path.join(meta_file_name(&base)).display());
    }

    println!("✓ Backup plan prepared at {}", request.path.display());
    Ok(())
}
