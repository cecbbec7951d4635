//! Filesystem store: one JSONL document per item, one lock file per lease.
//!
//! Layout under the items root:
//!
//! ```text
//! bank_01/questionnaire_001.jsonl         item document (payload + lifecycle meta)
//! bank_01/questionnaire_001.jsonl.lock    lease: exists iff someone holds the item
//! bank_01/questionnaire_001.jsonl.guard   advisory-lock target, never deleted
//! .ledger/submissions.jsonl               append-only submission ledger
//! ```
//!
//! Terminal state is always checked before lock state, so a lock left on a
//! completed item (crash between rename and unlock) never blocks anything.

mod document;
mod ledger;
mod lockfile;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom as _;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use self::document::ItemDocument;
use self::ledger::Ledger;
use self::lockfile::{Guard, LockRecord, LockState};
use super::{ClaimAttempt, Completion, Store};
use crate::error::{Error, Result};
use crate::model::{
    Answers, ItemId, ItemState, Lease, NewWorkItem, Owner, Submission, SubmissionFilter, WorkItem,
};

const ITEM_EXTENSION: &str = "jsonl";

/// Filesystem-backed store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    ledger: Ledger,
}

impl FsStore {
    /// Open the store at an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::NotFound(format!(
                "items directory {}",
                root.display()
            )));
        }
        let ledger = Ledger::under(&root);
        Ok(Self { root, ledger })
    }

    pub fn ledger_path(&self) -> &Path {
        self.ledger.path()
    }

    /// Location of the item document for `id`, if `id` names one under the root.
    pub fn item_path(&self, id: &ItemId) -> Option<PathBuf> {
        let rel = Path::new(id.as_str());
        let plain = rel.components().all(|c| match c {
            Component::Normal(part) => !part.to_string_lossy().starts_with('.'),
            _ => false,
        });
        if !plain || rel.extension().and_then(|e| e.to_str()) != Some(ITEM_EXTENSION) {
            return None;
        }
        Some(self.root.join(rel))
    }

    fn item_id(&self, path: &Path) -> Option<ItemId> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        ItemId::new(parts?.join("/")).ok()
    }

    fn item_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some(ITEM_EXTENSION)
            {
                paths.push(entry.into_path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn snapshot(&self, id: ItemId, path: &Path) -> Result<WorkItem> {
        let doc = ItemDocument::load(path)?;
        if doc.lifecycle.done {
            return Ok(WorkItem {
                id,
                state: ItemState::Done,
                lease: None,
                completed_by: doc.lifecycle.completed_by,
                completed_at: doc.lifecycle.completed_at,
                payload: doc.payload,
            });
        }

        let lease = match lockfile::read(&lockfile::lock_path(path))? {
            LockState::Held(record) => Some(Lease {
                item_id: id.clone(),
                owner: record.owner.clone(),
                expires_at: record.expires_at(),
            }),
            LockState::Absent | LockState::Unreadable => None,
        };
        Ok(WorkItem {
            id,
            state: if lease.is_some() {
                ItemState::Claimed
            } else {
                ItemState::Unclaimed
            },
            lease,
            completed_by: None,
            completed_at: None,
            payload: doc.payload,
        })
    }

    /// Run blocking filesystem work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(FsStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| Error::Other(format!("filesystem task failed: {e}")))?
    }

    // -----------------------------------------------------------------------
    // Synchronous operations. Each item-level check-then-act runs under the
    // item's guard.
    // -----------------------------------------------------------------------

    fn reclaim_expired_sync(&self) -> Result<u64> {
        let mut reclaimed = 0;
        for path in self.item_paths()? {
            let lock = lockfile::lock_path(&path);
            if !lock.exists() {
                continue;
            }

            let _guard = Guard::acquire(&path)?;
            if document::is_done(&path)? {
                if lockfile::remove(&lock)? {
                    warn!(item = %path.display(), "removed stray lock on completed item");
                    reclaimed += 1;
                }
                continue;
            }
            let state = lockfile::read(&lock)?;
            if state.is_stale_at(Utc::now()) && lockfile::remove(&lock)? {
                info!(item = %path.display(), lock = ?state, "reclaimed expired lease");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn try_claim_sync(
        &self,
        owner: &Owner,
        ttl: Duration,
        skip: &HashSet<ItemId>,
    ) -> Result<ClaimAttempt> {
        let mut paths = self.item_paths()?;
        paths.shuffle(&mut rand::rng());

        for path in paths {
            let Some(id) = self.item_id(&path) else {
                continue;
            };
            if skip.contains(&id) {
                continue;
            }

            let doc = match ItemDocument::load(&path) {
                Ok(doc) => doc,
                Err(e @ Error::Corrupt { .. }) => {
                    warn!(item = %id, error = %e, "skipping unreadable item");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if doc.lifecycle.done {
                continue;
            }

            let lock = lockfile::lock_path(&path);
            if lockfile::read(&lock)?.is_live_at(Utc::now()) {
                debug!(item = %id, "held by another owner");
                continue;
            }

            let _guard = Guard::acquire(&path)?;
            // Re-check under the guard: someone may have completed or claimed it.
            if document::is_done(&path)? {
                if lockfile::remove(&lock)? {
                    warn!(item = %id, "removed stray lock on completed item");
                }
                continue;
            }
            match lockfile::read(&lock)? {
                LockState::Absent => {}
                state if state.is_live_at(Utc::now()) => continue,
                state => {
                    lockfile::remove(&lock)?;
                    info!(item = %id, lock = ?state, "reclaimed expired lease during claim");
                }
            }

            let record = LockRecord::new(owner.clone(), ttl, Utc::now());
            if !lockfile::try_create(&lock, &record)? {
                debug!(item = %id, "lost exclusive create");
                continue;
            }

            return Ok(ClaimAttempt::Claimed(Box::new(WorkItem {
                lease: Some(Lease {
                    item_id: id.clone(),
                    owner: owner.clone(),
                    expires_at: record.expires_at(),
                }),
                id,
                state: ItemState::Claimed,
                completed_by: None,
                completed_at: None,
                payload: doc.payload,
            })));
        }

        Ok(ClaimAttempt::Exhausted)
    }

    fn renew_sync(&self, id: &ItemId, owner: &Owner, ttl: Duration) -> Result<bool> {
        let Some(path) = self.existing_item(id) else {
            return Ok(false);
        };
        let _guard = Guard::acquire(&path)?;
        if document::is_done(&path)? {
            return Ok(false);
        }
        let lock = lockfile::lock_path(&path);
        match lockfile::read(&lock)? {
            LockState::Held(record) if record.owner == *owner => {
                lockfile::rewrite(&lock, &record.renewed(ttl, Utc::now()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_sync(&self, id: &ItemId, owner: &Owner) -> Result<bool> {
        let Some(path) = self.existing_item(id) else {
            return Ok(false);
        };
        let _guard = Guard::acquire(&path)?;
        let lock = lockfile::lock_path(&path);
        if !lockfile::read(&lock)?.is_held_by(owner) {
            return Ok(false);
        }
        let done = document::is_done(&path)?;
        lockfile::remove(&lock)?;
        // A lock on a completed item is a leftover, not a lease.
        Ok(!done)
    }

    fn complete_sync(&self, id: &ItemId, owner: &Owner, answers: &Answers) -> Result<Completion> {
        let Some(path) = self.existing_item(id) else {
            return Ok(Completion::Rejected);
        };
        let _guard = Guard::acquire(&path)?;
        let lock = lockfile::lock_path(&path);
        let mut doc = ItemDocument::load(&path)?;

        if doc.lifecycle.done {
            if doc.lifecycle.completed_by.as_ref() != Some(owner) {
                return Ok(Completion::Rejected);
            }
            if lockfile::read(&lock)?.is_held_by(owner) {
                lockfile::remove(&lock)?;
            }
            return Ok(Completion::AlreadyDone);
        }

        if !lockfile::read(&lock)?.is_held_by(owner) {
            return Ok(Completion::Rejected);
        }

        let submission = Submission {
            item_id: id.clone(),
            owner: owner.clone(),
            answers: answers.clone(),
            submitted_at: Utc::now(),
        };
        self.ledger.append(&submission)?;

        doc.complete(owner, submission.submitted_at);
        write_atomic(&path, doc.render(Some(answers))?.as_bytes())?;
        lockfile::remove(&lock)?;

        Ok(Completion::Committed(submission))
    }

    fn get_sync(&self, id: &ItemId) -> Result<Option<WorkItem>> {
        match self.existing_item(id) {
            Some(path) => self.snapshot(id.clone(), &path).map(Some),
            None => Ok(None),
        }
    }

    fn list_sync(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for path in self.item_paths()? {
            let Some(id) = self.item_id(&path) else {
                continue;
            };
            match self.snapshot(id.clone(), &path) {
                Ok(item) => items.push(item),
                Err(e @ Error::Corrupt { .. }) => {
                    warn!(item = %id, error = %e, "skipping unreadable item");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    /// Ledger entries backed by their item documents.
    ///
    /// An entry for an item that is not done by the same owner is left over
    /// from a completion that died between the ledger append and the
    /// document rename. The document decides.
    fn submissions_sync(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>> {
        let mut completers: HashMap<ItemId, Option<Option<Owner>>> = HashMap::new();
        let mut out = Vec::new();
        for submission in self.ledger.read(filter)? {
            let completer = completers
                .entry(submission.item_id.clone())
                .or_insert_with(|| self.completer_of(&submission.item_id));
            match completer {
                Some(by) if by.as_ref() != Some(&submission.owner) => {
                    debug!(
                        item = %submission.item_id,
                        owner = %submission.owner,
                        "ignoring ledger entry without a matching completion"
                    );
                }
                _ => out.push(submission),
            }
        }
        Ok(out)
    }

    /// `Some(completed_by)` for a readable document, `None` when the
    /// document is gone or corrupt and cannot overrule the ledger.
    fn completer_of(&self, id: &ItemId) -> Option<Option<Owner>> {
        let path = self.existing_item(id)?;
        match ItemDocument::load(&path) {
            Ok(doc) if doc.lifecycle.done => Some(doc.lifecycle.completed_by),
            Ok(_) => Some(None),
            Err(e) => {
                warn!(item = %id, error = %e, "cannot check ledger entry against item");
                None
            }
        }
    }

    fn insert_items_sync(&self, items: &[NewWorkItem]) -> Result<u64> {
        let mut inserted = 0;
        for item in items {
            let path = self
                .item_path(&item.id)
                .ok_or_else(|| Error::InvalidItemId(item.id.to_string()))?;
            if path.exists() {
                continue;
            }
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let text = ItemDocument::new(item.payload.clone()).render(None)?;
            if create_exclusive(&path, text.as_bytes())? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn existing_item(&self, id: &ItemId) -> Option<PathBuf> {
        self.item_path(id).filter(|p| p.is_file())
    }
}

#[async_trait]
impl Store for FsStore {
    fn backend(&self) -> &'static str {
        "fs"
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        self.blocking(|store| store.reclaim_expired_sync()).await
    }

    async fn try_claim(
        &self,
        owner: &Owner,
        ttl: Duration,
        skip: &HashSet<ItemId>,
    ) -> Result<ClaimAttempt> {
        let owner = owner.clone();
        let skip = skip.clone();
        self.blocking(move |store| store.try_claim_sync(&owner, ttl, &skip))
            .await
    }

    async fn renew(&self, id: &ItemId, owner: &Owner, ttl: Duration) -> Result<bool> {
        let (id, owner) = (id.clone(), owner.clone());
        self.blocking(move |store| store.renew_sync(&id, &owner, ttl))
            .await
    }

    async fn release(&self, id: &ItemId, owner: &Owner) -> Result<bool> {
        let (id, owner) = (id.clone(), owner.clone());
        self.blocking(move |store| store.release_sync(&id, &owner))
            .await
    }

    async fn complete(
        &self,
        id: &ItemId,
        owner: &Owner,
        answers: &Answers,
    ) -> Result<Completion> {
        let (id, owner, answers) = (id.clone(), owner.clone(), answers.clone());
        self.blocking(move |store| store.complete_sync(&id, &owner, &answers))
            .await
    }

    async fn get(&self, id: &ItemId) -> Result<Option<WorkItem>> {
        let id = id.clone();
        self.blocking(move |store| store.get_sync(&id)).await
    }

    async fn list(&self) -> Result<Vec<WorkItem>> {
        self.blocking(|store| store.list_sync()).await
    }

    async fn submissions(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>> {
        let filter = filter.clone();
        self.blocking(move |store| store.submissions_sync(&filter))
            .await
    }

    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<u64> {
        let items = items.to_vec();
        self.blocking(move |store| store.insert_items_sync(&items))
            .await
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(|s| s.starts_with('.'))
}

fn temp_sibling(path: &Path) -> PathBuf {
    lockfile::sibling(path, &format!(".tmp-{}", uuid::Uuid::new_v4().simple()))
}

/// Write to a temp file in the same directory, then rename over `path`.
/// Readers see either the old content or the new, never a mix.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Write a complete file at `path` only if nothing is there yet.
fn create_exclusive(path: &Path, contents: &[u8]) -> io::Result<bool> {
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        match fs::hard_link(&tmp, path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    })();
    let _ = fs::remove_file(&tmp);
    result
}
