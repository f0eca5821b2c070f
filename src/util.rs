use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn run_id_for(started: DateTime<Utc>) -> String {
    format!("eval-{}", started.format("%Y%m%dT%H%M%SZ"))
}

/// Hex SHA-256 of a file, recorded so stored runs can be tied to the exact
/// pipeline they executed.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read file for fingerprint: {}", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let mut data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;
    data.push(b'\n');
    fs::write(path, data).with_context(|| format!("failed to write json file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn run_ids_use_compact_utc_timestamps() {
        let started = Utc.with_ymd_and_hms(2026, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(run_id_for(started), "eval-20260309T070501Z");
    }

    #[test]
    fn fingerprint_matches_known_digest() {
        let path = std::env::temp_dir().join(format!("ndcg-eval-fingerprint-{}.txt", std::process::id()));
        fs::write(&path, b"abc").unwrap();
        let digest = fingerprint_file(&path);
        fs::remove_file(&path).unwrap();
        assert_eq!(
            digest.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
