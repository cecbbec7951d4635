//! Append-only JSONL submission ledger for the filesystem backend.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use tracing::warn;

use crate::error::Result;
use crate::model::{Submission, SubmissionFilter};

pub(crate) const LEDGER_DIR: &str = ".ledger";
const LEDGER_FILE: &str = "submissions.jsonl";

#[derive(Debug, Clone)]
pub(crate) struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn under(root: &Path) -> Self {
        Self {
            path: root.join(LEDGER_DIR).join(LEDGER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk before returning.
    pub fn append(&self, submission: &Submission) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let mut line = serde_json::to_vec(submission)?;
        line.push(b'\n');
        if !ends_with_newline(&mut file)? {
            // A crash mid-append left a torn line. Start fresh after it.
            line.insert(0, b'\n');
        }
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn read(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;

        let mut out = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Submission>(line) {
                Ok(submission) if filter.matches(&submission) => out.push(submission),
                Ok(_) => {}
                Err(e) => warn!(
                    ledger = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "skipping unreadable ledger line"
                ),
            }
        }
        Ok(out)
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Answers, ItemId, Owner};
    use chrono::Utc;

    fn submission(item: &str, owner: &str) -> Submission {
        Submission {
            item_id: ItemId::new(item).unwrap(),
            owner: Owner::new(owner).unwrap(),
            answers: Answers::from([("q1".into(), "A".into())]),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn appends_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::under(dir.path());
        ledger.append(&submission("a.jsonl", "alice")).unwrap();
        ledger.append(&submission("b.jsonl", "bob")).unwrap();
        ledger.append(&submission("a.jsonl", "alice")).unwrap();

        assert_eq!(ledger.read(&SubmissionFilter::all()).unwrap().len(), 3);
        let for_a = SubmissionFilter::all().item(ItemId::new("a.jsonl").unwrap());
        assert_eq!(ledger.read(&for_a).unwrap().len(), 2);
        let for_bob = SubmissionFilter::all().owner(Owner::new("bob").unwrap());
        assert_eq!(ledger.read(&for_bob).unwrap()[0].item_id.as_str(), "b.jsonl");
    }

    #[test]
    fn torn_tail_is_skipped_and_next_append_survives() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::under(dir.path());
        ledger.append(&submission("a.jsonl", "alice")).unwrap();

        let mut file = OpenOptions::new().append(true).open(ledger.path()).unwrap();
        file.write_all(br#"{"item_id":"b.jso"#).unwrap();
        drop(file);

        ledger.append(&submission("c.jsonl", "carol")).unwrap();
        let all = ledger.read(&SubmissionFilter::all()).unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a.jsonl", "c.jsonl"]);
    }

    #[test]
    fn missing_ledger_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Ledger::under(dir.path()).read(&SubmissionFilter::all()).unwrap().is_empty());
    }
}
