use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, Subscription, filter::Filter};

pub mod file;
pub mod memory;

/// An opaque position in a change feed.
///
/// Only the feed that minted a token knows how to interpret it. Everyone else
/// stores it and hands it back verbatim through [`ChangeFeed::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Token for a sequence-numbered feed. Big-endian, so byte order matches
    /// feed order.
    pub(crate) fn from_seq(seq: u64) -> Self {
        Self(seq.to_be_bytes().to_vec())
    }

    pub(crate) fn to_seq(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

/// The kind of mutation a change event describes. Deletes are not part of
/// the feed contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Replace,
    ];
}

impl std::str::FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "replace" => Ok(OperationKind::Replace),
            other => Err(crate::Error::Configuration(format!(
                "unknown operation kind '{other}'"
            ))),
        }
    }
}

/// A single mutation delivered by a change feed, carrying the full state of
/// the affected document after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "operationType")]
    pub operation: OperationKind,
    #[serde(rename = "resumeToken")]
    pub token: ResumeToken,
    #[serde(rename = "fullDocument")]
    pub document: Value,
}

/// An ordered, filterable, resumable stream of changes to one collection.
///
/// The feed is the source of truth for ordering: a [`Subscription`] yields
/// events in the order the feed produced them, and subscribing with
/// `resume_after = Some(t)` yields exactly the events strictly after `t`.
///
/// Production backends are database change streams (MongoDB, Cosmos DB).
/// [`memory::MemoryFeed`] and [`file::FileFeed`] implement the same contract
/// for tests and single-host deployments.
pub trait ChangeFeed {
    type Subscription: Subscription;

    /// Opens a subscription delivering events that satisfy `filter`.
    ///
    /// With `resume_after = None` delivery starts at the beginning of the
    /// retained feed.
    fn subscribe(
        &self,
        filter: &Filter,
        resume_after: Option<&ResumeToken>,
    ) -> Result<Self::Subscription>;

    /// Opens a subscription that only delivers events appended from now on.
    ///
    /// Used to watch for notifications without replaying history.
    fn subscribe_from_now(&self, filter: &Filter) -> Result<Self::Subscription>;
}
