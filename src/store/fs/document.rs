//! JSONL item documents.
//!
//! ```text
//! {"__meta__": {"bank": "bank_01", "status": "done", "completed_by": "...", "completed_at": "..."}}
//! {"qid": "q1", "prompt": "...", "options": [{"key": "A", "text": "..."}, ...]}
//! {"qid": "q2", ...}
//! ```
//!
//! The meta line is optional. Lifecycle keys in it are split off from the
//! generator metadata on read and written back only for completed items.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::model::{Answers, Owner, Payload, Question};

const META_KEY: &str = "__meta__";
const STATUS_KEY: &str = "status";
const COMPLETED_BY_KEY: &str = "completed_by";
const COMPLETED_AT_KEY: &str = "completed_at";
const ANSWER_KEY: &str = "answer";
const DONE: &str = "done";

/// Lifecycle fields persisted in the meta line.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Lifecycle {
    pub done: bool,
    pub completed_by: Option<Owner>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub(crate) struct ItemDocument {
    pub lifecycle: Lifecycle,
    pub payload: Payload,
}

impl ItemDocument {
    pub fn new(payload: Payload) -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            payload,
        }
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let corrupt = |reason: String| Error::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let mut lines = text.lines().enumerate().peekable();
        let mut meta = Map::new();

        if let Some(found) = lines.peek().and_then(|(_, first)| meta_of(first)) {
            meta = found;
            lines.next();
        }

        let mut questions = Vec::new();
        for (n, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut question: Question = serde_json::from_str(line)
                .map_err(|e| corrupt(format!("line {}: {e}", n + 1)))?;
            question.extra.remove(ANSWER_KEY);
            questions.push(question);
        }

        let lifecycle = Lifecycle {
            done: is_done_meta(&meta),
            completed_by: meta
                .get(COMPLETED_BY_KEY)
                .and_then(Value::as_str)
                .and_then(|s| Owner::new(s).ok()),
            completed_at: meta
                .get(COMPLETED_AT_KEY)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
        };
        for key in [STATUS_KEY, COMPLETED_BY_KEY, COMPLETED_AT_KEY] {
            meta.remove(key);
        }

        Ok(Self {
            lifecycle,
            payload: Payload { meta, questions },
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, path)
    }

    /// Mark done by `owner`. Answers are written by [`render`](Self::render).
    pub fn complete(&mut self, owner: &Owner, at: DateTime<Utc>) {
        self.lifecycle = Lifecycle {
            done: true,
            completed_by: Some(owner.clone()),
            completed_at: Some(at),
        };
    }

    /// Serialize to JSONL. `answers` are written into each question line.
    pub fn render(&self, answers: Option<&Answers>) -> Result<String> {
        let mut meta = self.payload.meta.clone();
        if self.lifecycle.done {
            meta.insert(STATUS_KEY.into(), json!(DONE));
        }
        if let Some(owner) = &self.lifecycle.completed_by {
            meta.insert(COMPLETED_BY_KEY.into(), json!(owner.as_str()));
        }
        if let Some(at) = self.lifecycle.completed_at {
            meta.insert(COMPLETED_AT_KEY.into(), json!(at.to_rfc3339()));
        }

        let mut out = serde_json::to_string(&json!({ META_KEY: meta }))?;
        out.push('\n');

        for question in &self.payload.questions {
            let mut line = serde_json::to_value(question)?;
            if let (Some(answers), Value::Object(fields)) = (answers, &mut line) {
                fields.insert(
                    ANSWER_KEY.into(),
                    json!({ "choice": answers.get(&question.qid) }),
                );
            }
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Whether the document at `path` is terminal. Reads only the meta line.
pub(crate) fn is_done(path: &Path) -> Result<bool> {
    let mut first = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first)?;
    Ok(meta_of(&first).is_some_and(|meta| is_done_meta(&meta)))
}

fn meta_of(line: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(mut obj)) if obj.contains_key(META_KEY) => match obj.remove(META_KEY) {
            Some(Value::Object(meta)) => Some(meta),
            _ => Some(Map::new()),
        },
        _ => None,
    }
}

fn is_done_meta(meta: &Map<String, Value>) -> bool {
    meta.get(STATUS_KEY)
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case(DONE))
}
