//! Seams to the remote data service and its push channel.
//!
//! The crate never talks to the network itself; the application supplies
//! implementations of [`RemoteService`] and [`ChangeFeed`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::session::SyncSession;

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network or connection failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// No response within the request timeout.
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    /// Server-side failure (5xx).
    #[error("service unavailable (status {status})")]
    Unavailable {
        /// HTTP-like status code.
        status: u16,
    },
    /// Too many requests.
    #[error("rate limited")]
    RateLimited,
    /// The server refused the write, e.g. a constraint violation.
    #[error("rejected by server: {0}")]
    Rejected(String),
    /// The write conflicts with newer server state.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Unavailable { .. } | Self::RateLimited
        )
    }

    /// Classifies an HTTP-like status code returned by an adapter.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 => Self::Timeout(0),
            409 | 412 => Self::Conflict(message.into()),
            429 => Self::RateLimited,
            500..=599 => Self::Unavailable { status },
            _ => Self::Rejected(message.into()),
        }
    }
}

/// Kind of server-side change announced on a push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A record was created.
    Insert,
    /// A record changed.
    Update,
    /// A record was deleted.
    Delete,
}

/// One push notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSignal {
    /// What happened.
    pub kind: ChangeKind,
    /// Changed record; `None` means "something in the collection changed".
    #[serde(default)]
    pub target_id: Option<String>,
    /// Server commit timestamp, used for de-duplication.
    #[serde(default)]
    pub commit_ts: Option<String>,
}

impl ChangeSignal {
    /// Signal about one record.
    pub fn new(kind: ChangeKind, target_id: impl Into<String>) -> Self {
        Self {
            kind,
            target_id: Some(target_id.into()),
            commit_ts: None,
        }
    }

    /// Sets the server commit timestamp.
    pub fn at(mut self, commit_ts: impl Into<String>) -> Self {
        self.commit_ts = Some(commit_ts.into());
        self
    }
}

/// Row filter of a push subscription, in `column=eq.value` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeFilter(String);

impl ChangeFilter {
    /// Matches every row of the collection.
    pub fn all() -> Self {
        Self(String::new())
    }

    /// Rows whose `column` equals `value`.
    pub fn eq(column: &str, value: impl fmt::Display) -> Self {
        Self(format!("{column}=eq.{value}"))
    }

    /// Rows owned by the session's user.
    pub fn owner(session: &SyncSession) -> Self {
        Self::eq("user_id", &session.user_id)
    }

    /// Filter text; empty for [`ChangeFilter::all`].
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the filter matches every row.
    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluates the filter against a record.
    ///
    /// Non-string columns are compared by their JSON text, so `cage=eq.3`
    /// matches `{"cage": 3}`. Filters not of the `column=eq.value` form never
    /// match.
    pub fn matches(&self, record: &Value) -> bool {
        if self.is_all() {
            return true;
        }
        let Some((column, expected)) = self.0.split_once("=eq.") else {
            return false;
        };
        match record.get(column) {
            Some(Value::String(actual)) => actual == expected,
            None | Some(Value::Null) => false,
            Some(other) => other.to_string() == expected,
        }
    }
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("*")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Authoritative record store.
///
/// Records are JSON objects carrying an `id` field.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Inserts a record and returns it as stored, possibly with a server-assigned id.
    async fn create(&self, session: &SyncSession, collection: &str, payload: &Value) -> Result<Value, RemoteError>;

    /// Merges `payload` into the record and returns it as stored.
    async fn update(
        &self,
        session: &SyncSession,
        collection: &str,
        target_id: &str,
        payload: &Value,
    ) -> Result<Value, RemoteError>;

    /// Deletes the record; deleting a missing record succeeds.
    async fn delete(&self, session: &SyncSession, collection: &str, target_id: &str) -> Result<(), RemoteError>;

    /// Current server value of one record; `None` if it does not exist.
    async fn fetch(&self, session: &SyncSession, collection: &str, target_id: &str) -> Result<Option<Value>, RemoteError>;

    /// Every record of `collection` matching `filter`.
    async fn fetch_all(
        &self,
        session: &SyncSession,
        collection: &str,
        filter: &ChangeFilter,
    ) -> Result<Vec<Value>, RemoteError>;
}

/// Factory for push channels.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Performs the subscription handshake.
    async fn open(
        &self,
        session: &SyncSession,
        collection: &str,
        filter: &ChangeFilter,
    ) -> Result<Box<dyn ChangeStream>, RemoteError>;
}

/// An open push channel.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next signal; `None` once the server closed the channel.
    async fn next_change(&mut self) -> Option<Result<ChangeSignal, RemoteError>>;

    /// Releases the channel. Called exactly once per opened stream.
    async fn close(&mut self);
}
