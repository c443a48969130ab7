//! Append-only per-job JSONL transcript.
//!
//! One `dispatcher-log.jsonl` per job records buyer turns, assistant turns,
//! and lifecycle events. The SHA-256 of the file bytes is the authoritative
//! transcript hash recorded in the deletion attestation. Timestamps are
//! strictly monotonic per job: ties within a millisecond are bumped
//! forward, and a fresh handle seeds its cursor from the file's last entry
//! so reopening a transcript (restart, on-demand restart) cannot repeat a
//! timestamp.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::attestation::sha256_hex;
use crate::error::DispatcherError;
use crate::types::Job;

pub const LOG_FILE: &str = "dispatcher-log.jsonl";

pub struct JobLog {
    dir: PathBuf,
    last_ts_millis: Mutex<i64>,
}

impl JobLog {
    pub fn new(jobs_path: &Path, job_id: &str) -> Self {
        let dir = jobs_path.join(job_id);
        let last = last_logged_millis(&dir.join(LOG_FILE));
        Self {
            dir,
            last_ts_millis: Mutex::new(last),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Create the job directory and its metadata files. The transcript and
    /// attestations are never overwritten here.
    pub fn ensure_job_dir(&self, job: &Job) -> Result<(), DispatcherError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join("description.txt"), &job.description)?;
        fs::write(self.dir.join("buyer.txt"), &job.buyer_verus_id)?;
        fs::write(self.dir.join("amount.txt"), job.amount.to_string())?;
        fs::write(self.dir.join("currency.txt"), &job.currency)?;
        Ok(())
    }

    /// Append one entry: `{ts, role, content, ...metadata}`.
    pub fn append(&self, role: &str, content: &str, metadata: Value) -> Result<(), DispatcherError> {
        let ts = self.next_timestamp();
        let mut entry = json!({
            "ts": ts,
            "role": role,
            "content": content,
        });
        if let (Some(target), Some(extra)) = (entry.as_object_mut(), metadata.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }

        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(self.log_path())?;
        writeln!(file, "{entry}")?;
        Ok(())
    }

    /// Append a lifecycle event (role `system`).
    pub fn lifecycle(&self, event: &str, metadata: Value) -> Result<(), DispatcherError> {
        self.append("system", event, metadata)
    }

    /// SHA-256 over the raw file bytes; a missing transcript hashes as
    /// empty.
    pub fn digest(&self) -> String {
        let bytes = fs::read(self.log_path()).unwrap_or_default();
        sha256_hex(&bytes)
    }

    pub fn exists(&self) -> bool {
        self.log_path().is_file()
    }

    fn next_timestamp(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = match self.last_ts_millis.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let millis = if now > *last { now } else { *last + 1 };
        *last = millis;
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

/// Timestamp of the last entry already in the transcript, as the seed for
/// the monotonicity cursor. A missing or unparsable file seeds 0.
fn last_logged_millis(path: &Path) -> i64 {
    let Ok(raw) = fs::read_to_string(path) else {
        return 0;
    };
    raw.lines()
        .rev()
        .find_map(|line| {
            let entry: Value = serde_json::from_str(line).ok()?;
            let ts = entry.get("ts")?.as_str()?;
            let parsed = chrono::DateTime::parse_from_rfc3339(ts).ok()?;
            Some(parsed.timestamp_millis())
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sample_job() -> Job {
        Job {
            job_id: "job-1".into(),
            job_hash: "abc".into(),
            buyer_verus_id: "buyer@".into(),
            amount: Decimal::new(25, 1),
            currency: "VRSC".into(),
            description: "translate a page".into(),
            status: Default::default(),
        }
    }

    #[test]
    fn test_job_dir_files_written() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JobLog::new(tmp.path(), "job-1");
        log.ensure_job_dir(&sample_job()).unwrap();

        assert_eq!(fs::read_to_string(log.dir().join("buyer.txt")).unwrap(), "buyer@");
        assert_eq!(fs::read_to_string(log.dir().join("amount.txt")).unwrap(), "2.5");
        assert_eq!(fs::read_to_string(log.dir().join("currency.txt")).unwrap(), "VRSC");
    }

    #[test]
    fn test_append_produces_one_json_line_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JobLog::new(tmp.path(), "job-1");
        log.append("user", "hello", json!({"sender": "buyer@", "nonce": "aa"})).unwrap();
        log.append("assistant", "hi!", json!({"nonce": "aa", "port": 8100})).unwrap();
        log.lifecycle("container ready", json!({"port": 8100})).unwrap();

        let raw = fs::read_to_string(log.log_path()).unwrap();
        let lines: Vec<Value> =
            raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["role"], "user");
        assert_eq!(lines[0]["sender"], "buyer@");
        assert_eq!(lines[1]["port"], 8100);
        assert_eq!(lines[2]["role"], "system");
    }

    #[test]
    fn test_timestamps_strictly_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JobLog::new(tmp.path(), "job-1");
        for i in 0..20 {
            log.append("user", &format!("turn {i}"), json!({})).unwrap();
        }

        let raw = fs::read_to_string(log.log_path()).unwrap();
        let stamps: Vec<String> = raw
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["ts"].as_str().unwrap().to_string())
            .collect();
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{} should precede {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_monotonic_across_reopened_handles() {
        let tmp = tempfile::tempdir().unwrap();
        // Several short-lived handles against the same transcript, as a
        // restart and an on-demand restart produce; appends land well
        // inside one wall-clock millisecond.
        for round in 0..5 {
            let log = JobLog::new(tmp.path(), "job-1");
            log.append("user", &format!("round {round}"), json!({})).unwrap();
            log.append("assistant", "ok", json!({})).unwrap();
        }

        let raw = fs::read_to_string(JobLog::new(tmp.path(), "job-1").log_path()).unwrap();
        let stamps: Vec<String> = raw
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["ts"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(stamps.len(), 10);
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{} should precede {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_digest_tracks_content() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JobLog::new(tmp.path(), "job-1");
        let empty = log.digest();
        log.append("user", "hello", json!({})).unwrap();
        let one = log.digest();
        assert_ne!(empty, one);
        // Digest is stable while the file is unchanged.
        assert_eq!(one, log.digest());
    }
}
