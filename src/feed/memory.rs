use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::{
    Error, Result, Subscription,
    feed::{ChangeEvent, ChangeFeed, OperationKind, ResumeToken},
    filter::Filter,
};

#[derive(Debug, Default)]
struct Log {
    events: VecDeque<ChangeEvent>,
    /// Events already dropped from the front; the sequence number of
    /// `events[i]` is `dropped + i + 1`.
    dropped: u64,
    retain: Option<usize>,
    /// Bumped by [`MemoryFeed::drop_subscriptions`]; subscriptions opened
    /// under an older generation fail on their next poll.
    generation: u64,
    failing_subscribes: usize,
}

impl Log {
    fn last_seq(&self) -> u64 {
        self.dropped + self.events.len() as u64
    }
}

/// In-memory change feed shared by every clone of the handle.
///
/// Tokens are sequence numbers starting at 1. Failure injection hooks let
/// tests exercise subscription loss.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    log: Arc<Mutex<Log>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed that keeps only the newest `events` changes. Subscriptions that
    /// fall further behind fail.
    pub fn with_retention(events: usize) -> Self {
        let feed = Self::default();
        feed.lock().retain = Some(events.max(1));
        feed
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a change and returns the event as subscribers will see it.
    pub fn append(&self, operation: OperationKind, document: Value) -> ChangeEvent {
        let mut log = self.lock();
        let event = ChangeEvent {
            operation,
            token: ResumeToken::from_seq(log.last_seq() + 1),
            document,
        };
        log.events.push_back(event.clone());
        if let Some(retain) = log.retain {
            while log.events.len() > retain {
                log.events.pop_front();
                log.dropped += 1;
            }
        }
        event
    }

    /// Number of changes currently retained.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `count` calls to `subscribe` fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().failing_subscribes = count;
    }

    /// Breaks every open subscription, as a dropped connection would.
    pub fn drop_subscriptions(&self) {
        self.lock().generation += 1;
    }

    fn open(
        &self,
        filter: &Filter,
        start: impl FnOnce(&Log) -> Result<u64>,
    ) -> Result<MemorySubscription> {
        let mut log = self.lock();
        if log.failing_subscribes > 0 {
            log.failing_subscribes -= 1;
            return Err(Error::FeedSubscription("injected subscribe failure".into()));
        }
        let after = start(&*log)?;
        Ok(MemorySubscription {
            log: Arc::clone(&self.log),
            filter: filter.clone(),
            after,
            generation: log.generation,
            closed: false,
        })
    }
}

impl ChangeFeed for MemoryFeed {
    type Subscription = MemorySubscription;

    fn subscribe(
        &self,
        filter: &Filter,
        resume_after: Option<&ResumeToken>,
    ) -> Result<Self::Subscription> {
        self.open(filter, |log| {
            let seq = match resume_after {
                None => return Ok(log.dropped),
                Some(token) => token.to_seq().ok_or_else(|| {
                    Error::FeedSubscription("resume token was not minted by this feed".into())
                })?,
            };
            if seq > log.last_seq() {
                return Err(Error::FeedSubscription(format!(
                    "resume token {seq} is ahead of the feed"
                )));
            }
            if seq < log.dropped {
                return Err(Error::FeedSubscription(format!(
                    "resume token {seq} is older than the retained history"
                )));
            }
            Ok(seq)
        })
    }

    fn subscribe_from_now(&self, filter: &Filter) -> Result<Self::Subscription> {
        self.open(filter, |log| Ok(log.last_seq()))
    }
}

/// A cursor over a [`MemoryFeed`].
#[derive(Debug)]
pub struct MemorySubscription {
    log: Arc<Mutex<Log>>,
    filter: Filter,
    /// Sequence number of the last event consumed.
    after: u64,
    generation: u64,
    closed: bool,
}

impl Subscription for MemorySubscription {
    fn try_next(&mut self) -> Result<Option<ChangeEvent>> {
        if self.closed {
            return Err(Error::FeedSubscription("subscription closed".into()));
        }
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if log.generation != self.generation {
            return Err(Error::FeedSubscription("subscription dropped".into()));
        }
        if self.after < log.dropped {
            return Err(Error::FeedSubscription(
                "subscription fell behind the retained history".into(),
            ));
        }
        while let Some(event) = log.events.get((self.after - log.dropped) as usize) {
            self.after += 1;
            if self.filter.matches(event) {
                return Ok(Some(event.clone()));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
