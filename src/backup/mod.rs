//! Backup command support
//!
//! The flag model, validation, output-file naming, and portable manifest
//! for the backup subcommand. Streaming actual shard data from a live node
//! is handled by the snapshot transport, not here.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Layout of the UTC timestamp that prefixes portable backup files.
const PORTABLE_FILE_NAME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Command-line arguments for the backup subcommand.
#[derive(Debug, Parser)]
#[command(name = "chronoshard-backup", about = "Back up databases and shards")]
pub struct BackupArgs {
    /// Address of the node to back up from.
    #[arg(long, default_value = "localhost:8088")]
    pub host: String,

    /// Database to back up. Defaults to all databases.
    #[arg(long = "db", alias = "database")]
    pub database: Option<String>,

    /// Retention policy to back up; requires --db.
    #[arg(long = "rp", alias = "retention")]
    pub retention_policy: Option<String>,

    /// Single shard id to back up; requires --rp.
    #[arg(long)]
    pub shard: Option<u64>,

    /// Back up data written at or after this RFC3339 time.
    #[arg(long)]
    pub since: Option<String>,

    /// Export boundary start (RFC3339); pairs with --end.
    #[arg(long)]
    pub start: Option<String>,

    /// Export boundary end (RFC3339); pairs with --start.
    #[arg(long)]
    pub end: Option<String>,

    /// Produce the portable (manifest + tarball) layout.
    #[arg(long)]
    pub portable: bool,

    /// Continue past per-shard errors.
    #[arg(long = "skip-errors")]
    pub skip_errors: bool,

    /// Output directory.
    pub path: PathBuf,
}

/// Which span of data a backup covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupRange {
    /// A full backup, optionally limited to data newer than `since`.
    Full { since: Option<DateTime<Utc>> },
    /// An export bounded by `[start, end)`.
    Export {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
}

/// A validated backup request.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRequest {
    pub host: String,
    pub database: Option<String>,
    pub retention_policy: Option<String>,
    pub shard: Option<u64>,
    pub range: BackupRange,
    pub portable: bool,
    pub skip_errors: bool,
    pub path: PathBuf,
}

impl BackupArgs {
    /// Validates the flag combination and parses time boundaries.
    pub fn validate(self) -> Result<BackupRequest> {
        if self.retention_policy.is_some() && self.database.is_none() {
            return Err(Error::Config(
                "--rp requires --db to be specified".to_string(),
            ));
        }
        if self.shard.is_some() && self.retention_policy.is_none() {
            return Err(Error::Config(
                "--shard requires --rp to be specified".to_string(),
            ));
        }
        if self.since.is_some() && (self.start.is_some() || self.end.is_some()) {
            return Err(Error::Config(
                "backup command uses one of -since or -start/-end".to_string(),
            ));
        }

        let range = if self.start.is_some() || self.end.is_some() {
            let start = self.start.as_deref().map(parse_rfc3339).transpose()?;
            let end = self.end.as_deref().map(parse_rfc3339).transpose()?;
            if let (Some(start), Some(end)) = (start, end) {
                if start >= end {
                    return Err(Error::Config(
                        "start date must be before end date".to_string(),
                    ));
                }
            }
            BackupRange::Export { start, end }
        } else {
            BackupRange::Full {
                since: self.since.as_deref().map(parse_rfc3339).transpose()?,
            }
        };

        Ok(BackupRequest {
            host: self.host,
            database: self.database,
            retention_policy: self.retention_policy,
            shard: self.shard,
            range,
            portable: self.portable,
            skip_errors: self.skip_errors,
            path: self.path,
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("invalid RFC3339 time '{s}': {e}")))
}

/// File name for a legacy (non-portable) shard backup:
/// `<db>.<rp>.<shardID:05>.<seq:02>`.
pub fn legacy_shard_file_name(db: &str, rp: &str, shard_id: u64, seq: u32) -> String {
    format!("{db}.{rp}.{shard_id:05}.{seq:02}")
}

/// Picks the first unused sequence number for a legacy backup file in `dir`.
pub fn next_legacy_path(dir: &Path, db: &str, rp: &str, shard_id: u64) -> Result<PathBuf> {
    for seq in 0..=99u32 {
        let candidate = dir.join(legacy_shard_file_name(db, rp, shard_id, seq));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::Config(format!(
        "backup directory {} has no free sequence for shard {shard_id}",
        dir.display()
    )))
}

/// The shared timestamp prefix for one portable backup run.
pub fn portable_file_base(now: DateTime<Utc>) -> String {
    now.format(PORTABLE_FILE_NAME_FORMAT).to_string()
}

/// File name of the portable manifest.
pub fn manifest_file_name(base: &str) -> String {
    format!("{base}.manifest")
}

/// File name of a portable per-shard tarball.
pub fn shard_file_name(base: &str, shard_id: u64) -> String {
    format!("{base}.s{shard_id}.tar.gz")
}

/// File name of the portable metadata snapshot.
pub fn meta_file_name(base: &str) -> String {
    format!("{base}.meta")
}

/// One shard entry in a portable manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub database: String,
    pub policy: String,
    #[serde(rename = "shardID")]
    pub shard_id: u64,
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub size: i64,
    #[serde(rename = "lastModified")]
    pub last_modified: String,
}

impl ManifestEntry {
    pub fn new(database: &str, policy: &str, shard_id: u64, file_name: &str, size: i64) -> Self {
        Self {
            database: database.to_string(),
            policy: policy.to_string(),
            shard_id,
            file_name: file_name.to_string(),
            size,
            last_modified: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// The portable manifest: the metadata snapshot plus every shard tarball
/// written during one backup run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub meta: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Writes the manifest as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Loads a manifest previously written with [`Manifest::save`].
    pub fn load(path: &Path) -> Result<Manifest> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> BackupArgs {
        let mut argv = vec!["chronoshard-backup"];
        argv.extend_from_slice(extra);
        argv.push("/tmp/backup-out");
        BackupArgs::parse_from(argv)
    }

    #[test]
    fn since_conflicts_with_boundaries() {
        let err = args(&["--since", "2024-01-01T00:00:00Z", "--start", "2024-01-01T00:00:00Z"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("-since or -start/-end"));
    }

    #[test]
    fn start_must_precede_end() {
        let err = args(&[
            "--start",
            "2024-02-01T00:00:00Z",
            "--end",
            "2024-01-01T00:00:00Z",
        ])
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("start date must be before"));

        let ok = args(&[
            "--start",
            "2024-01-01T00:00:00Z",
            "--end",
            "2024-02-01T00:00:00Z",
        ])
        .validate()
        .unwrap();
        assert!(matches!(ok.range, BackupRange::Export { .. }));
    }

    #[test]
    fn rp_requires_db_and_shard_requires_rp() {
        assert!(args(&["--rp", "autogen"]).validate().is_err());
        assert!(args(&["--shard", "12"]).validate().is_err());
        assert!(args(&["--db", "db0", "--rp", "autogen", "--shard", "12"])
            .validate()
            .is_ok());
    }

    #[test]
    fn full_backup_is_default() {
        let req = args(&[]).validate().unwrap();
        assert_eq!(req.range, BackupRange::Full { since: None });
        assert_eq!(req.host, "localhost:8088");
    }

    #[test]
    fn file_names_follow_patterns() {
        assert_eq!(
            legacy_shard_file_name("db0", "autogen", 12, 0),
            "db0.autogen.00012.00"
        );

        let base = portable_file_base(
            DateTime::parse_from_rfc3339("2024-03-05T04:05:06Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        assert_eq!(base, "20240305T040506Z");
        assert_eq!(manifest_file_name(&base), "20240305T040506Z.manifest");
        assert_eq!(shard_file_name(&base, 7), "20240305T040506Z.s7.tar.gz");
        assert_eq!(meta_file_name(&base), "20240305T040506Z.meta");
    }

    #[test]
    fn next_legacy_path_skips_existing_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let first = next_legacy_path(dir.path(), "db0", "rp0", 3).unwrap();
        assert!(first.ends_with("db0.rp0.00003.00"));

        std::fs::write(&first, b"x").unwrap();
        let second = next_legacy_path(dir.path(), "db0", "rp0", 3).unwrap();
        assert!(second.ends_with("db0.rp0.00003.01"));
    }

    #[test]
    fn manifest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240305T040506Z.manifest");

        let manifest = Manifest {
            meta: "20240305T040506Z.meta".to_string(),
            files: vec![ManifestEntry::new(
                "db0",
                "autogen",
                7,
                "20240305T040506Z.s7.tar.gz",
                1024,
            )],
        };
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);

        // The wire field names are fixed.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"shardID\""));
        assert!(raw.contains("\"fileName\""));
        assert!(raw.contains("\"lastModified\""));
    }
}
