//! Append-only JSON-lines change log shared between processes on one host.
//!
//! Layout: `<dir>/changes.jsonl`, one entry per line, plus `<dir>/changes.lock`
//! which serializes appends. Tokens are the entry's sequence number.
//!
//! A writer killed mid-append leaves a line without its newline. Readers never
//! deliver such a line and the next append cuts it off.
//!
//! A feed opened with a retention limit rotates the log to
//! `changes.jsonl.1` once it holds that many entries, replacing the previous
//! rotation. Subscriptions only read the current log. Open ones notice the
//! rotation and fail, to be reopened by their owner.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Error, Result, Subscription,
    feed::{ChangeEvent, ChangeFeed, OperationKind, ResumeToken},
    filter::Filter,
    lock::FileLock,
};

const LOG_FILE: &str = "changes.jsonl";
const ROTATED_FILE: &str = "changes.jsonl.1";
const LOCK_FILE: &str = "changes.lock";

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    seq: u64,
    #[serde(rename = "operationType")]
    operation: OperationKind,
    #[serde(rename = "fullDocument")]
    document: Value,
}

impl Entry {
    fn into_event(self) -> ChangeEvent {
        ChangeEvent {
            operation: self.operation,
            token: ResumeToken::from_seq(self.seq),
            document: self.document,
        }
    }
}

#[cfg(unix)]
type FileId = (u64, u64);

#[cfg(not(unix))]
type FileId = ();

#[cfg(unix)]
fn file_id(meta: &fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &fs::Metadata) -> Option<FileId> {
    None
}

/// What is known about the complete lines of one log file.
#[derive(Debug, Clone, Copy, Default)]
struct Tail {
    id: Option<FileId>,
    /// Byte offset just past the last complete line.
    end: u64,
    first: u64,
    last: u64,
    entries: u64,
}

#[derive(Debug, Clone)]
pub struct FileFeed {
    log_path: PathBuf,
    rotated_path: PathBuf,
    lock_path: PathBuf,
    retain: Option<u64>,
    /// Shared by clones so appends only read what other writers added since.
    tail: Arc<Mutex<Tail>>,
}

impl FileFeed {
    /// Opens the change log in `dir`, creating the directory and an empty log
    /// if missing. The log is never rotated.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(dir.as_ref(), None)
    }

    /// Like [`open`](FileFeed::open), but rotates the log after `entries`
    /// appends. Resuming from a token older than the retained history fails.
    pub fn open_with_retention(dir: impl AsRef<Path>, entries: u64) -> Result<Self> {
        if entries == 0 {
            return Err(Error::Configuration(
                "change log retention must be positive".into(),
            ));
        }
        Self::open_inner(dir.as_ref(), Some(entries))
    }

    fn open_inner(dir: &Path, retain: Option<u64>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let feed = Self {
            log_path: dir.join(LOG_FILE),
            rotated_path: dir.join(ROTATED_FILE),
            lock_path: dir.join(LOCK_FILE),
            retain,
            tail: Arc::default(),
        };
        feed.open_log()?;
        Ok(feed)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    pub fn append(&self, operation: OperationKind, document: Value) -> Result<ChangeEvent> {
        let _guard = FileLock::exclusive(&self.lock_path)?;
        let mut file = self.open_log()?;
        let mut tail = self.refresh_tail(&mut file)?;
        if file.metadata()?.len() > tail.end {
            warn!(
                "discarding unterminated entry at the end of {}",
                self.log_path.display()
            );
            file.set_len(tail.end)?;
        }
        if self.retain.is_some_and(|retain| tail.entries >= retain) {
            fs::rename(&self.log_path, &self.rotated_path)?;
            file = self.open_log()?;
            tail = Tail {
                id: file_id(&file.metadata()?),
                last: tail.last,
                ..Tail::default()
            };
        }

        let entry = Entry {
            seq: tail.last + 1,
            operation,
            document,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;

        tail.end += line.len() as u64;
        tail.last = entry.seq;
        if tail.first == 0 {
            tail.first = entry.seq;
        }
        tail.entries += 1;
        *self.cached_tail() = tail;
        Ok(entry.into_event())
    }

    fn open_log(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.log_path)?)
    }

    fn cached_tail(&self) -> MutexGuard<'_, Tail> {
        self.tail.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Brings the cached tail up to date with `file`, which must be the
    /// current log.
    fn refresh_tail(&self, file: &mut File) -> Result<Tail> {
        let cached = *self.cached_tail();
        let mut tail = scan(file, cached)?;
        if tail.entries == 0 && tail.last == 0 {
            // Freshly rotated: sequence numbers continue from the old log.
            tail.last = self.rotated_last_seq()?;
        }
        *self.cached_tail() = tail;
        Ok(tail)
    }

    fn rotated_last_seq(&self) -> Result<u64> {
        match File::open(&self.rotated_path) {
            Ok(mut file) => Ok(scan(&mut file, Tail::default())?.last),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn open_at(&self, filter: &Filter, start: Start<'_>) -> Result<FileSubscription> {
        let mut file = File::open(&self.log_path)?;
        let tail = self.refresh_tail(&mut file)?;
        let (offset, after_seq) = match start {
            Start::Oldest => (0, 0),
            Start::Now => (tail.end, tail.last),
            Start::After(token) => {
                let after_seq = token.to_seq().ok_or_else(|| {
                    Error::FeedSubscription("resume token was not minted by this feed".into())
                })?;
                if after_seq > tail.last {
                    return Err(Error::FeedSubscription(format!(
                        "resume token {after_seq} is ahead of the feed (last {})",
                        tail.last
                    )));
                }
                if self.retain.is_some() && tail.first > after_seq + 1 {
                    return Err(Error::FeedSubscription(format!(
                        "resume token {after_seq} is older than the retained change log"
                    )));
                }
                (0, after_seq)
            }
        };
        Ok(FileSubscription {
            path: self.log_path.clone(),
            id: tail.id,
            file: Some(file),
            filter: filter.clone(),
            offset,
            after_seq,
        })
    }
}

enum Start<'a> {
    Oldest,
    Now,
    After(&'a ResumeToken),
}

impl ChangeFeed for FileFeed {
    type Subscription = FileSubscription;

    fn subscribe(
        &self,
        filter: &Filter,
        resume_after: Option<&ResumeToken>,
    ) -> Result<Self::Subscription> {
        let start = resume_after.map_or(Start::Oldest, Start::After);
        self.open_at(filter, start).map_err(unavailable)
    }

    fn subscribe_from_now(&self, filter: &Filter) -> Result<Self::Subscription> {
        self.open_at(filter, Start::Now).map_err(unavailable)
    }
}

/// Tails a [`FileFeed`] from a byte offset.
#[derive(Debug)]
pub struct FileSubscription {
    path: PathBuf,
    id: Option<FileId>,
    file: Option<File>,
    filter: Filter,
    offset: u64,
    /// Entries at or below this sequence number were delivered before the
    /// subscription was opened.
    after_seq: u64,
}

impl FileSubscription {
    fn read_next(&mut self) -> Result<Option<ChangeEvent>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::FeedSubscription("subscription closed".into()))?;
        if file.metadata()?.len() < self.offset {
            return Err(Error::FeedSubscription("change log truncated".into()));
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            // A line without its newline is still being written, or was torn.
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            self.offset += read as u64;
            if line.trim().is_empty() {
                continue;
            }
            let entry = decode(&line)?;
            if entry.seq <= self.after_seq {
                continue;
            }
            let event = entry.into_event();
            if self.filter.matches(&event) {
                return Ok(Some(event));
            }
        }

        if self.replaced()? {
            return Err(Error::FeedSubscription(format!(
                "{} was rotated or replaced",
                self.path.display()
            )));
        }
        Ok(None)
    }

    /// Whether the log path now names a different file than the one read.
    fn replaced(&self) -> Result<bool> {
        let Some(id) = self.id else {
            return Ok(false);
        };
        Ok(file_id(&fs::metadata(&self.path)?) != Some(id))
    }
}

impl Subscription for FileSubscription {
    fn try_next(&mut self) -> Result<Option<ChangeEvent>> {
        self.read_next().map_err(unavailable)
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// Advances `from` over the complete lines of `file`. Starts over when `file`
/// is not the file `from` describes.
fn scan(file: &mut File, from: Tail) -> Result<Tail> {
    let meta = file.metadata()?;
    let id = file_id(&meta);
    let mut tail = if id.is_some() && id == from.id && meta.len() >= from.end {
        from
    } else {
        Tail {
            id,
            ..Tail::default()
        }
    };
    file.seek(SeekFrom::Start(tail.end))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 || !line.ends_with('\n') {
            return Ok(tail);
        }
        tail.end += read as u64;
        if line.trim().is_empty() {
            continue;
        }
        tail.last = decode(&line)?.seq;
        if tail.first == 0 {
            tail.first = tail.last;
        }
        tail.entries += 1;
    }
}

fn decode(line: &str) -> Result<Entry> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Corrupt(format!("change log entry: {e}")))
}

/// A log that cannot be read right now is a broken subscription, not a fatal
/// error.
fn unavailable(err: Error) -> Error {
    match err {
        Error::Io(e) => Error::FeedSubscription(format!("change log unavailable: {e}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn drain(sub: &mut FileSubscription) -> Vec<Value> {
        let mut docs = Vec::new();
        while let Some(event) = sub.try_next().expect("poll") {
            docs.push(event.document);
        }
        docs
    }

    fn tear(feed: &FileFeed, bytes: &[u8]) {
        let mut raw = OpenOptions::new().append(true).open(feed.path()).expect("raw");
        raw.write_all(bytes).expect("torn write");
    }

    #[test]
    fn appends_get_increasing_tokens() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        let a = feed.append(OperationKind::Insert, json!({ "n": 1 })).expect("append");
        let b = feed.append(OperationKind::Update, json!({ "n": 2 })).expect("append");
        assert_eq!(a.token.to_seq(), Some(1));
        assert_eq!(b.token.to_seq(), Some(2));
    }

    #[test]
    fn resumes_after_token_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        feed.append(OperationKind::Insert, json!({ "n": 1 })).expect("append");
        let mut sub = feed.subscribe(&Filter::new(), None).expect("subscribe");
        let first = sub.try_next().expect("poll").expect("event");
        sub.close();
        feed.append(OperationKind::Insert, json!({ "n": 2 })).expect("append");
        drop(feed);

        let feed = FileFeed::open(dir.path()).expect("reopen");
        let mut sub = feed.subscribe(&Filter::new(), Some(&first.token)).expect("resume");
        assert_eq!(drain(&mut sub), vec![json!({ "n": 2 })]);
    }

    #[test]
    fn tails_new_appends_and_ignores_partial_lines() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        let mut sub = feed.subscribe_from_now(&Filter::new()).expect("subscribe");
        assert!(sub.try_next().expect("idle").is_none());

        tear(&feed, br#"{"seq":1,"operationType":"insert","#);
        assert!(sub.try_next().expect("partial").is_none());
        tear(&feed, b"\"fullDocument\":{\"n\":1}}\n");
        assert_eq!(drain(&mut sub), vec![json!({ "n": 1 })]);
    }

    #[test]
    fn append_cuts_off_a_torn_tail() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        feed.append(OperationKind::Insert, json!({ "n": 1 })).expect("append");
        let mut sub = feed.subscribe_from_now(&Filter::new()).expect("subscribe");
        // A writer died halfway through entry 2.
        tear(&feed, br#"{"seq":2,"operationType":"repl"#);

        // A fresh handle, as a restarted process would have.
        let restarted = FileFeed::open(dir.path()).expect("reopen");
        let next = restarted
            .append(OperationKind::Replace, json!({ "n": 2 }))
            .expect("append after torn tail");
        assert_eq!(next.token.to_seq(), Some(2));
        assert_eq!(drain(&mut sub), vec![json!({ "n": 2 })]);

        let mut all = restarted.subscribe(&Filter::new(), None).expect("subscribe");
        assert_eq!(drain(&mut all), vec![json!({ "n": 1 }), json!({ "n": 2 })]);
    }

    #[test]
    fn torn_tail_does_not_block_subscribers() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        let first = feed.append(OperationKind::Insert, json!({ "n": 1 })).expect("append");
        tear(&feed, br#"{"seq":2,"oper"#);

        let mut sub = feed.subscribe(&Filter::new(), Some(&first.token)).expect("resume");
        assert!(sub.try_next().expect("poll").is_none());
        let mut now = feed.subscribe_from_now(&Filter::new()).expect("from now");
        assert!(now.try_next().expect("poll").is_none());
    }

    #[test]
    fn filter_applies_to_file_entries() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        feed.append(OperationKind::Insert, json!({ "name": "other" })).expect("append");
        feed.append(OperationKind::Insert, json!({ "name": "cosmosdb" })).expect("append");
        let filter = Filter::new().field_eq("name", "cosmosdb");
        let mut sub = feed.subscribe(&filter, None).expect("subscribe");
        assert_eq!(drain(&mut sub), vec![json!({ "name": "cosmosdb" })]);
    }

    #[test]
    fn rejects_token_ahead_of_log() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        let err = feed
            .subscribe(&Filter::new(), Some(&ResumeToken::from_seq(5)))
            .unwrap_err();
        assert!(matches!(err, Error::FeedSubscription(_)));
    }

    #[cfg(unix)]
    #[test]
    fn missing_log_is_a_transient_subscription_failure() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open(dir.path()).expect("open");
        let mut sub = feed.subscribe(&Filter::new(), None).expect("subscribe");
        fs::remove_file(feed.path()).expect("remove");

        let err = sub.try_next().unwrap_err();
        assert!(err.is_transient(), "{err}");
        let err = feed.subscribe(&Filter::new(), None).unwrap_err();
        assert!(err.is_transient(), "{err}");
        let err = feed.subscribe_from_now(&Filter::new()).unwrap_err();
        assert!(err.is_transient(), "{err}");

        // The next append recreates the log.
        feed.append(OperationKind::Insert, json!({ "n": 1 })).expect("append");
        let mut sub = feed.subscribe(&Filter::new(), None).expect("subscribe");
        assert_eq!(drain(&mut sub), vec![json!({ "n": 1 })]);
    }

    #[test]
    fn retention_rotates_and_keeps_sequence() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open_with_retention(dir.path(), 3).expect("open");
        let mut sub = feed.subscribe_from_now(&Filter::new()).expect("subscribe");
        for n in 1..=3 {
            feed.append(OperationKind::Replace, json!({ "n": n })).expect("append");
        }
        assert_eq!(drain(&mut sub).len(), 3);

        let rotated = feed.append(OperationKind::Replace, json!({ "n": 4 })).expect("append");
        assert_eq!(rotated.token.to_seq(), Some(4));
        assert!(dir.path().join(ROTATED_FILE).exists());
        assert!(sub.try_next().unwrap_err().is_transient());

        let mut sub = feed.subscribe(&Filter::new(), None).expect("resubscribe");
        assert_eq!(drain(&mut sub), vec![json!({ "n": 4 })]);

        // Another handle continues the numbering from the rotated log.
        let other = FileFeed::open_with_retention(dir.path(), 3).expect("reopen");
        let next = other.append(OperationKind::Replace, json!({ "n": 5 })).expect("append");
        assert_eq!(next.token.to_seq(), Some(5));
    }

    #[test]
    fn resuming_before_retained_history_fails() {
        let dir = tempdir().expect("tempdir");
        let feed = FileFeed::open_with_retention(dir.path(), 2).expect("open");
        let first = feed.append(OperationKind::Insert, json!({ "n": 1 })).expect("append");
        for n in 2..=4 {
            feed.append(OperationKind::Insert, json!({ "n": n })).expect("append");
        }
        let err = feed.subscribe(&Filter::new(), Some(&first.token)).unwrap_err();
        assert!(matches!(err, Error::FeedSubscription(_)));
    }

    #[test]
    fn zero_retention_is_rejected() {
        let dir = tempdir().expect("tempdir");
        assert!(matches!(
            FileFeed::open_with_retention(dir.path(), 0),
            Err(Error::Configuration(_))
        ));
    }
}
