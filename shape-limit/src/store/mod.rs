//! The coordination store shared by every cooperating process.
//!
//! Shapers never hold a client-side lock across a round trip. All mutual
//! exclusion between processes comes from the store executing a batch of
//! [`Command`]s, or a [`Script`], indivisibly.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
pub use memory::ScriptContext;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Failures reported by a coordination store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The store rejected a command.
    #[error("command failed: {0}")]
    Command(String),

    /// A script was evaluated that the store does not know.
    #[error("unknown script: {0}")]
    NoScript(String),

    /// The store answered with something the caller did not ask for.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// One sub-command of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Remove ordered-set members scored strictly below `below`.
    RemoveBelow { key: String, below: i64 },
    /// Read every member with its score, lowest score first.
    Range { key: String },
    /// Insert a member, replacing its score if it is already present.
    Add {
        key: String,
        member: String,
        score: i64,
    },
    /// Remove a single member.
    Remove { key: String, member: String },
    /// Refresh the expiry of a key.
    Expire { key: String, ttl: Duration },
}

/// The result of one sub-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Count(u64),
    Members(Vec<(String, i64)>),
    Done,
}

impl Reply {
    pub fn into_count(self) -> Result<u64, StoreError> {
        match self {
            Reply::Count(count) => Ok(count),
            other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub fn into_members(self) -> Result<Vec<(String, i64)>, StoreError> {
        match self {
            Reply::Members(members) => Ok(members),
            other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
        }
    }
}

/// A server-side routine evaluated in a single round trip.
///
/// Stores that can run Lua use `lua`; others resolve the script by `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    pub name: &'static str,
    pub lua: &'static str,
}

/// Messages received on a subscribed channel, in arrival order.
pub type Messages = BoxStream<'static, String>;

/// The capabilities a shaper needs from its coordination store.
#[async_trait]
pub trait CoordinationStore: Debug + Send + Sync {
    /// Execute `commands` as one indivisible batch.
    ///
    /// The outer error means the batch never ran. Otherwise there is one
    /// result per command, in order, and a failed command does not stop the
    /// ones after it.
    async fn multi(
        &self,
        commands: Vec<Command>,
    ) -> Result<Vec<Result<Reply, StoreError>>, StoreError>;

    /// Evaluate `script` atomically, returning its single integer result.
    async fn eval(&self, script: &Script, keys: &[String], args: &[String])
    -> Result<i64, StoreError>;

    /// Publish `message` on `channel`, returning how many subscribers got it.
    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Messages, StoreError>;
}
