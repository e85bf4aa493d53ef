//! Completion markers for verified builds.
//!
//! A stamp records that (dependency, ref, platform, resolved flags) was built
//! *and* passed artifact verification. Stamps are only written after
//! verification, through a temp file + rename, so an interrupted build never
//! leaves a success marker behind.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::workspace::sanitize_component;

/// Everything a stamp key is derived from.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StampInputs {
    pub dependency: String,
    pub git_ref: String,
    pub platform_id: String,
    /// Resolved flags in a stable order: prefix, compilers, cflags, ldflags, args.
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StampKey {
    pub dependency: String,
    pub hash: String,
}

impl StampKey {
    pub fn compute(inputs: &StampInputs) -> Result<Self> {
        let encoded = serde_json::to_vec(inputs)
            .map_err(|e| Error::msg(format!("stamp key encode failed: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(Self {
            dependency: inputs.dependency.clone(),
            hash: hex::encode(hasher.finalize()),
        })
    }

    fn file_stem(&self) -> String {
        format!("{}-{}", sanitize_component(&self.dependency), &self.hash[..16.min(self.hash.len())])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampRecord {
    pub key: String,
    pub dependency: String,
    pub git_ref: String,
    pub platform_id: String,
    pub flags: Vec<String>,
    pub stamped_at: String,
}

/// Stamp directory shared by all workers of a run.
#[derive(Clone)]
pub struct StampStore {
    dir: PathBuf,
    held: Arc<(Mutex<HashSet<String>>, Condvar)>,
}

impl StampStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            held: Arc::new((Mutex::new(HashSet::new()), Condvar::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stamp_path(&self, key: &StampKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }

    pub fn is_stamped(&self, key: &StampKey) -> bool {
        self.read(key).is_some()
    }

    pub fn read(&self, key: &StampKey) -> Option<StampRecord> {
        let raw = fs::read_to_string(self.stamp_path(key)).ok()?;
        let rec: StampRecord = serde_json::from_str(&raw).ok()?;
        (rec.key == key.hash).then_some(rec)
    }

    pub fn stamp(&self, key: &StampKey, inputs: &StampInputs) -> Result<()> {
        let rec = StampRecord {
            key: key.hash.clone(),
            dependency: inputs.dependency.clone(),
            git_ref: inputs.git_ref.clone(),
            platform_id: inputs.platform_id.clone(),
            flags: inputs.flags.clone(),
            stamped_at: chrono::Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_string_pretty(&rec)
            .map_err(|e| Error::msg(format!("failed to encode stamp: {e}")))?;
        atomic_write_text(&self.stamp_path(key), &body)
    }

    /// Drop a stamp whose artifacts no longer verify.
    pub fn invalidate(&self, key: &StampKey) -> Result<()> {
        let path = self.stamp_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!("failed to remove stamp {}: {e}", path.display()))),
        }
    }

    /// Exclusive right to build `key`, across threads and processes.
    pub fn lock(&self, key: &StampKey) -> Result<KeyLock> {
        let (set, cvar) = &*self.held;
        {
            let mut guard = set
                .lock()
                .map_err(|_| Error::msg("stamp lock table poisoned"))?;
            while guard.contains(&key.hash) {
                guard = cvar
                    .wait(guard)
                    .map_err(|_| Error::msg("stamp lock table poisoned"))?;
            }
            guard.insert(key.hash.clone());
        }

        let release_in_process = InProcessLock {
            held: self.held.clone(),
            hash: key.hash.clone(),
        };
        let path = self.dir.join(format!(".{}.lock", key.file_stem()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::msg(format!("failed to open lock {}: {e}", path.display())))?;
        lock_file(&file)
            .map_err(|e| Error::msg(format!("failed to lock {}: {e}", path.display())))?;
        Ok(KeyLock {
            _file: file,
            _in_process: release_in_process,
        })
    }
}

struct InProcessLock {
    held: Arc<(Mutex<HashSet<String>>, Condvar)>,
    hash: String,
}

impl Drop for InProcessLock {
    fn drop(&mut self) {
        let (set, cvar) = &*self.held;
        if let Ok(mut guard) = set.lock() {
            guard.remove(&self.hash);
        }
        cvar.notify_all();
    }
}

/// Held while a key is being built. The advisory lock dies with the file handle.
pub struct KeyLock {
    _file: File,
    _in_process: InProcessLock,
}

#[cfg(unix)]
fn lock_file(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_file(_file: &File) -> std::io::Result<()> {
    Ok(())
}

pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!("invalid file path for atomic write: {}", path.display()))
    })?;
    let tmp = path.with_file_name(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn inputs(flags: &[&str]) -> StampInputs {
        StampInputs {
            dependency: "x264".into(),
            git_ref: "31e19f92".into(),
            platform_id: "linux-x86_64-gnu".into(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn key_changes_with_any_input() {
        let base = StampKey::compute(&inputs(&["--enable-pic"])).expect("key");
        let same = StampKey::compute(&inputs(&["--enable-pic"])).expect("key");
        let other_flags = StampKey::compute(&inputs(&["--enable-pic", "-g"])).expect("key");
        let mut moved = inputs(&["--enable-pic"]);
        moved.git_ref = "5db6aa6c".into();
        let other_ref = StampKey::compute(&moved).expect("key");

        assert_eq!(base, same);
        assert_ne!(base, other_flags);
        assert_ne!(base, other_ref);
    }

    #[test]
    fn stamp_round_trips_and_only_matches_its_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StampStore::new(tmp.path().join("stamps")).expect("store");
        let inp = inputs(&[]);
        let key = StampKey::compute(&inp).expect("key");
        assert!(!store.is_stamped(&key));
        store.stamp(&key, &inp).expect("stamp");
        assert!(store.is_stamped(&key));
        assert_eq!(store.read(&key).expect("record").git_ref, "31e19f92");

        let other = StampKey::compute(&inputs(&["-O3"])).expect("key");
        assert!(!store.is_stamped(&other));
    }

    #[test]
    fn invalidate_removes_only_that_stamp() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StampStore::new(tmp.path()).expect("store");
        let a = StampKey::compute(&inputs(&["a"])).expect("key");
        let b = StampKey::compute(&inputs(&["b"])).expect("key");
        store.stamp(&a, &inputs(&["a"])).expect("stamp a");
        store.stamp(&b, &inputs(&["b"])).expect("stamp b");

        store.invalidate(&a).expect("invalidate");
        assert!(!store.is_stamped(&a));
        assert!(store.is_stamped(&b));
        store.invalidate(&a).expect("missing stamp is fine");
    }

    #[test]
    fn same_key_is_never_held_twice() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StampStore::new(tmp.path()).expect("store");
        let key = StampKey::compute(&inputs(&[])).expect("key");
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                let active = active.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    let _lock = store.lock(&key).expect("lock");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
