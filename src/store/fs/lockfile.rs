//! Lock files and per-item guards.
//!
//! The lock file's existence *is* the lease. It is created with
//! `create_new`, so at most one claimant can bring it into being. Its
//! content records who holds it and since when; expiry is derived from
//! `issued_at + ttl_ms`.
//!
//! The guard file is a second sibling that is never deleted. Holding an
//! exclusive advisory lock on it serializes every check-then-act sequence on
//! one item (stale check + delete, owner check + rewrite, owner check +
//! completion).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};

use crate::model::Owner;

pub(crate) const LOCK_SUFFIX: &str = ".lock";
pub(crate) const GUARD_SUFFIX: &str = ".guard";

/// Content of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    pub owner: Owner,
    pub issued_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl LockRecord {
    pub fn new(owner: Owner, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            owner,
            issued_at: now,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// A fresh record for a renewal. Never moves the expiry backwards.
    pub fn renewed(&self, ttl: Duration, now: DateTime<Utc>) -> Self {
        let next = Self::new(self.owner.clone(), ttl, now);
        let current = self.expires_at();
        if current <= next.expires_at() {
            return next;
        }
        let remaining = (current - now).num_milliseconds().max(0);
        Self {
            ttl_ms: u64::try_from(remaining).unwrap_or(0),
            ..next
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX));
        self.issued_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// What is on disk at a lock path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LockState {
    Absent,
    Held(LockRecord),
    /// Present but unparseable. Never trusted as a live lease.
    Unreadable,
}

impl LockState {
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            LockState::Absent => false,
            LockState::Held(record) => record.is_stale_at(now),
            LockState::Unreadable => true,
        }
    }

    pub fn is_held_by(&self, owner: &Owner) -> bool {
        matches!(self, LockState::Held(record) if record.owner == *owner)
    }

    /// Held by someone and not expired.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self, LockState::Held(record) if !record.is_stale_at(now))
    }
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn lock_path(item: &Path) -> PathBuf {
    sibling(item, LOCK_SUFFIX)
}

pub(crate) fn guard_path(item: &Path) -> PathBuf {
    sibling(item, GUARD_SUFFIX)
}

pub(crate) fn read(lock: &Path) -> io::Result<LockState> {
    match fs::read(lock) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)
            .map(LockState::Held)
            .unwrap_or(LockState::Unreadable)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LockState::Absent),
        Err(e) => Err(e),
    }
}

/// Exclusive-create the lock. `Ok(false)` means someone else holds it.
pub(crate) fn try_create(lock: &Path, record: &LockRecord) -> io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(lock) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };

    let written = serde_json::to_vec(record)
        .map_err(io::Error::other)
        .and_then(|bytes| file.write_all(&bytes))
        .and_then(|()| file.sync_data());

    if let Err(e) = written {
        let _ = fs::remove_file(lock);
        return Err(e);
    }
    Ok(true)
}

/// Replace the lock content in one step. Caller must hold the guard.
pub(crate) fn rewrite(lock: &Path, record: &LockRecord) -> io::Result<()> {
    let bytes = serde_json::to_vec(record).map_err(io::Error::other)?;
    super::write_atomic(lock, &bytes)
}

/// Delete the lock. `Ok(false)` if it was already gone.
pub(crate) fn remove(lock: &Path) -> io::Result<bool> {
    match fs::remove_file(lock) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Exclusive advisory lock on an item's guard file, released on drop.
pub(crate) struct Guard {
    _file: File,
}

impl Guard {
    pub fn acquire(item: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(guard_path(item))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(s: &str) -> Owner {
        Owner::new(s).unwrap()
    }

    #[test]
    fn staleness_follows_issue_time_plus_ttl() {
        let now = Utc::now();
        let record = LockRecord::new(owner("a"), Duration::from_secs(60), now);
        assert!(!record.is_stale_at(now + chrono::Duration::seconds(59)));
        assert!(record.is_stale_at(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn renewal_never_shortens_the_lease() {
        let now = Utc::now();
        let long = LockRecord::new(owner("a"), Duration::from_secs(600), now);

        let shorter = long.renewed(Duration::from_secs(10), now + chrono::Duration::seconds(5));
        assert_eq!(shorter.expires_at(), long.expires_at());

        let longer = long.renewed(Duration::from_secs(900), now);
        assert!(longer.expires_at() > long.expires_at());
    }

    #[test]
    fn create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("item.jsonl.lock");
        let now = Utc::now();

        assert!(try_create(&lock, &LockRecord::new(owner("a"), Duration::from_secs(5), now)).unwrap());
        assert!(!try_create(&lock, &LockRecord::new(owner("b"), Duration::from_secs(5), now)).unwrap());
        assert!(read(&lock).unwrap().is_held_by(&owner("a")));
    }

    #[test]
    fn unreadable_lock_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("item.jsonl.lock");
        fs::write(&lock, b"{not json").unwrap();

        let state = read(&lock).unwrap();
        assert_eq!(state, LockState::Unreadable);
        assert!(state.is_stale_at(Utc::now()));
        assert!(!state.is_live_at(Utc::now()));
    }

    #[test]
    fn missing_lock_reads_absent_and_removes_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("item.jsonl.lock");
        assert_eq!(read(&lock).unwrap(), LockState::Absent);
        assert!(!remove(&lock).unwrap());
    }

    #[test]
    fn rewrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("item.jsonl.lock");
        let first = Utc::now();
        try_create(&lock, &LockRecord::new(owner("a"), Duration::from_secs(1), first)).unwrap();

        let later = first + chrono::Duration::seconds(30);
        rewrite(&lock, &LockRecord::new(owner("a"), Duration::from_secs(60), later)).unwrap();

        match read(&lock).unwrap() {
            LockState::Held(record) => {
                assert_eq!(record.issued_at, later);
                assert_eq!(record.ttl_ms, 60_000);
            }
            other => panic!("expected Held, got {other:?}"),
        }
    }
}
