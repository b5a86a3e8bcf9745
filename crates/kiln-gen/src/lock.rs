//! Selection lock file
//!
//! Approved outputs are pinned in a JSON lock file so later runs can skip
//! regeneration. A lock entry is only honored while the target's input hash
//! still matches; any change to the prompt, policy, or acceptance invalidates
//! it. Writes go through a temp file and rename so a crashed run never
//! leaves a truncated lock behind.

use kiln_core::{ContentHash, KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "kiln.lock.json";

/// One approved selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub target_id: String,
    pub approved: bool,
    /// Hex input hash the approval was made against
    pub input_hash: String,
    /// Path of the winning candidate, relative to the output root
    pub selected_output_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LockFile {
    #[serde(default)]
    targets: Vec<LockEntry>,
}

/// In-memory view of the lock file, keyed by target id
#[derive(Debug, Default)]
pub struct SelectionLocks {
    path: Option<PathBuf>,
    entries: BTreeMap<String, LockEntry>,
}

impl SelectionLocks {
    /// Load locks from `dir/kiln.lock.json`. A missing file is an empty set.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut locks = Self {
            path: Some(path.clone()),
            entries: BTreeMap::new(),
        };
        if !path.exists() {
            return Ok(locks);
        }

        let content = std::fs::read_to_string(&path)?;
        let file: LockFile = serde_json::from_str(&content)
            .map_err(|e| KilnError::Lock(format!("{}: {}", path.display(), e)))?;
        for entry in file.targets {
            if let Some(prev) = locks.entries.insert(entry.target_id.clone(), entry) {
                warn!(target_id = %prev.target_id, "duplicate lock entry, keeping last");
            }
        }
        debug!(path = %path.display(), entries = locks.entries.len(), "loaded locks");
        Ok(locks)
    }

    /// An approved, hash-matching entry for this target, if any.
    /// A stale hash means the target changed since approval; the entry is
    /// reported as absent but kept on disk until the next save.
    pub fn valid_entry(&self, target_id: &str, input_hash: &ContentHash) -> Option<&LockEntry> {
        let entry = self.entries.get(target_id)?;
        if !entry.approved {
            return None;
        }
        if entry.input_hash != input_hash.to_hex() {
            debug!(%target_id, "lock entry stale, input hash changed");
            return None;
        }
        Some(entry)
    }

    pub fn is_locked(&self, target_id: &str, input_hash: &ContentHash) -> bool {
        self.valid_entry(target_id, input_hash).is_some()
    }

    /// Record an approval, replacing any previous entry for the target.
    pub fn approve(
        &mut self,
        target_id: &str,
        input_hash: &ContentHash,
        selected_output_path: &Path,
    ) {
        info!(%target_id, path = %selected_output_path.display(), "approving selection");
        self.entries.insert(
            target_id.to_string(),
            LockEntry {
                target_id: target_id.to_string(),
                approved: true,
                input_hash: input_hash.to_hex(),
                selected_output_path: selected_output_path.to_path_buf(),
                approved_at: Some(now_rfc3339()),
            },
        );
    }

    /// Drop a target's entry. Returns whether one existed.
    pub fn release(&mut self, target_id: &str) -> bool {
        self.entries.remove(target_id).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LockEntry> {
        self.entries.values()
    }

    /// Persist atomically: write a temp file next to the lock, then rename
    /// over it.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| KilnError::Lock("lock set has no backing file".to_string()))?;

        let file = LockFile {
            targets: self.entries.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Unique temp name: concurrent runs must never interleave writes
        // into the same file before the rename.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), entries = file.targets.len(), "saved locks");
        Ok(())
    }
}

fn now_rfc3339() -> String {
    // Seconds-resolution UTC timestamp without a chrono dependency.
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = secs / 86_400;
    let (y, m, d) = civil_from_days(days as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Howard Hinnant's civil-from-days algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("kiln_lock_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn hash(s: &str) -> ContentHash {
        ContentHash::from_bytes(s.as_bytes())
    }

    #[test]
    fn test_missing_file_is_empty_set() {
        let dir = temp_dir();
        let locks = SelectionLocks::load(&dir).unwrap();
        assert!(!locks.is_locked("hero", &hash("h")));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_approve_save_reload() {
        let dir = temp_dir();
        let h = hash("inputs-v1");

        let mut locks = SelectionLocks::load(&dir).unwrap();
        locks.approve("hero", &h, Path::new("sprites/hero.png"));
        locks.save().unwrap();

        let reloaded = SelectionLocks::load(&dir).unwrap();
        let entry = reloaded.valid_entry("hero", &h).unwrap();
        assert!(entry.approved);
        assert_eq!(entry.selected_output_path, PathBuf::from("sprites/hero.png"));
        assert!(entry.approved_at.is_some());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stale_hash_invalidates_lock() {
        let dir = temp_dir();
        let mut locks = SelectionLocks::load(&dir).unwrap();
        locks.approve("hero", &hash("inputs-v1"), Path::new("sprites/hero.png"));

        assert!(locks.is_locked("hero", &hash("inputs-v1")));
        // Prompt or policy changed: same target id, different input hash.
        assert!(!locks.is_locked("hero", &hash("inputs-v2")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unapproved_entry_is_not_a_lock() {
        let dir = temp_dir();
        let h = hash("inputs-v1");
        let path = dir.join(LOCK_FILE_NAME);
        let file = LockFile {
            targets: vec![LockEntry {
                target_id: "hero".to_string(),
                approved: false,
                input_hash: h.to_hex(),
                selected_output_path: PathBuf::from("sprites/hero.png"),
                approved_at: None,
            }],
        };
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let locks = SelectionLocks::load(&dir).unwrap();
        assert!(!locks.is_locked("hero", &h));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_release_then_save_removes_entry() {
        let dir = temp_dir();
        let h = hash("inputs-v1");
        let mut locks = SelectionLocks::load(&dir).unwrap();
        locks.approve("hero", &h, Path::new("sprites/hero.png"));
        locks.approve("villain", &h, Path::new("sprites/villain.png"));
        assert!(locks.release("hero"));
        assert!(!locks.release("hero"));
        locks.save().unwrap();

        let reloaded = SelectionLocks::load(&dir).unwrap();
        assert!(!reloaded.is_locked("hero", &h));
        assert!(reloaded.is_locked("villain", &h));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_lock_file_uses_camel_case_keys() {
        let dir = temp_dir();
        let mut locks = SelectionLocks::load(&dir).unwrap();
        locks.approve("hero", &hash("inputs-v1"), Path::new("sprites/hero.png"));
        locks.save().unwrap();

        let raw = std::fs::read_to_string(dir.join(LOCK_FILE_NAME)).unwrap();
        assert!(raw.contains("\"targetId\""));
        assert!(raw.contains("\"inputHash\""));
        assert!(raw.contains("\"selectedOutputPath\""));
        assert!(!raw.contains("\"target_id\""));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_concurrent_saves_leave_a_parseable_file() {
        let dir = temp_dir();
        let h = hash("inputs-v1");

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let dir = &dir;
                let h = &h;
                scope.spawn(move || {
                    let mut locks = SelectionLocks::load(dir).unwrap();
                    let id = format!("hero-{}", worker);
                    locks.approve(&id, h, Path::new("sprites/hero.png"));
                    for _ in 0..20 {
                        locks.save().unwrap();
                    }
                });
            }
        });

        // Whichever save won, the published file is complete JSON.
        let reloaded = SelectionLocks::load(&dir).unwrap();
        assert!(reloaded.entries().count() >= 1);
        // No temp files left behind.
        let leftovers = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_lock_file_is_an_error() {
        let dir = temp_dir();
        std::fs::write(dir.join(LOCK_FILE_NAME), "{not json").unwrap();
        let err = SelectionLocks::load(&dir).unwrap_err();
        assert!(matches!(err, KilnError::Lock(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_timestamp_format() {
        let ts = now_rfc3339();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
    }
}
