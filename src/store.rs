//! Last-interaction timestamps, persisted as a small JSON map.
//!
//! The store backs the re-engagement check at startup. Writes are
//! fire-and-forget: the in-memory map is updated immediately and the
//! file write runs on the blocking pool, logging on failure instead of
//! surfacing it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

pub struct InteractionStore {
    path: PathBuf,
    entries: HashMap<String, DateTime<Utc>>,
}

impl InteractionStore {
    /// Opens the store at the platform data dir
    /// (`…/voxlive/interactions.json`).
    pub fn open_default() -> Self {
        let dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open(dir.join("voxlive").join("interactions.json"))
    }

    /// Opens the store backed by `path`. A missing or unreadable file
    /// just means no prior interactions.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("ignoring malformed interaction store {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        InteractionStore { path, entries }
    }

    pub fn last_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).copied()
    }

    /// True when `key` has never been seen or its last interaction is
    /// older than `threshold`.
    pub fn needs_reengagement(&self, key: &str, threshold: Duration) -> bool {
        match self.last_timestamp(key) {
            Some(last) => Utc::now() - last > threshold,
            None => true,
        }
    }

    /// Records `time` for `key`. The disk write is fire-and-forget; a
    /// failure leaves the new value in memory only.
    pub fn set_timestamp(&mut self, key: &str, time: DateTime<Utc>) {
        self.entries.insert(key.to_string(), time);
        let path = self.path.clone();
        let snapshot = self.entries.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = write_entries(&path, &snapshot) {
                warn!("interaction store write failed: {}", e);
            }
        });
    }
}

fn write_entries(path: &Path, entries: &HashMap<String, DateTime<Utc>>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(entries)?;
    fs::write(path, raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("voxlive-store-{}-{}.json", tag, std::process::id()))
    }

    #[tokio::test]
    async fn timestamps_round_trip_through_disk() {
        let path = scratch_path("roundtrip");
        let _ = fs::remove_file(&path);
        let mut store = InteractionStore::open(&path);
        let stamp = Utc::now();
        store.set_timestamp("user", stamp);

        // The write lands on the blocking pool; poll until it does.
        let mut loaded = None;
        for _ in 0..100 {
            if let Some(ts) = InteractionStore::open(&path).last_timestamp("user") {
                loaded = Some(ts);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let loaded = loaded.expect("store write never landed");
        assert_eq!(loaded.timestamp_millis(), stamp.timestamp_millis());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn unknown_keys_need_reengagement() {
        let store = InteractionStore::open(scratch_path("never-written"));
        assert!(store.needs_reengagement("nobody", Duration::hours(1)));
    }

    #[tokio::test]
    async fn stale_interactions_trigger_reengagement() {
        let path = scratch_path("stale");
        let _ = fs::remove_file(&path);
        let mut store = InteractionStore::open(&path);
        store.set_timestamp("user", Utc::now() - Duration::days(2));
        assert!(store.needs_reengagement("user", Duration::days(1)));
        store.set_timestamp("user", Utc::now());
        assert!(!store.needs_reengagement("user", Duration::days(1)));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn malformed_files_start_empty() {
        let path = scratch_path("malformed");
        fs::write(&path, "not json").unwrap();
        let store = InteractionStore::open(&path);
        assert!(store.last_timestamp("user").is_none());
        let _ = fs::remove_file(&path);
    }
}
