// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// A single command inside a [`Batch`].
///
/// The coordinators only submit `Set` and `SAdd`. `Expire` and `Del` complete the command set
/// for callers composing their own batches against a store, and every store must apply them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Unconditional write, with the expiry applied atomically when present.
    Set {
        /// Fully qualified key.
        key: String,
        /// Encoded value.
        value: Vec<u8>,
        /// Expiry; `None` keeps the key forever.
        ttl: Option<Duration>,
    },
    /// Expiry update for an existing key.
    Expire {
        /// Fully qualified key.
        key: String,
        /// New expiry.
        ttl: Duration,
    },
    /// Set insertion.
    SAdd {
        /// Fully qualified set key.
        key: String,
        /// Members to add.
        members: Vec<String>,
    },
    /// Key deletion.
    Del {
        /// Fully qualified keys.
        keys: Vec<String>,
    },
}

/// An ordered list of commands submitted to the store as one pipelined request.
///
/// Batches give best-effort atomicity only: they save round trips, they are not
/// transactions.
///
/// Commands with nothing to do (a set insertion without members, a deletion without keys)
/// are dropped on insertion, so an empty batch is always safe to execute.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden_store::Batch;
///
/// let batch = Batch::new()
///     .set("app:user:1", b"{}".to_vec(), Some(Duration::from_secs(60)))
///     .sadd("app:tag:users", vec!["app:user:1".to_string()])
///     .sadd("app:tag:empty", Vec::new());
///
/// assert_eq!(batch.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an unconditional write.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        self.push(Command::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    /// Appends an expiry update. Not used by the coordinators; available to callers building
    /// their own batches.
    #[must_use]
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.push(Command::Expire { key: key.into(), ttl });
        self
    }

    /// Appends a set insertion.
    #[must_use]
    pub fn sadd(mut self, key: impl Into<String>, members: Vec<String>) -> Self {
        self.push(Command::SAdd { key: key.into(), members });
        self
    }

    /// Appends a deletion. Not used by the coordinators; available to callers building their
    /// own batches.
    #[must_use]
    pub fn del(mut self, keys: Vec<String>) -> Self {
        self.push(Command::Del { keys });
        self
    }

    /// Appends a command, dropping it when it has nothing to do.
    pub fn push(&mut self, command: Command) {
        let is_noop = match &command {
            Command::SAdd { members, .. } => members.is_empty(),
            Command::Del { keys } => keys.is_empty(),
            Command::Set { .. } | Command::Expire { .. } => false,
        };

        if !is_noop {
            self.commands.push(command);
        }
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` when no commands are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The queued commands in submission order.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

impl IntoIterator for Batch {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_submission_order() {
        let batch = Batch::new()
            .del(vec!["a".to_string()])
            .set("b", vec![1], None)
            .expire("b", Duration::from_secs(1));

        let kinds: Vec<_> = batch
            .commands()
            .iter()
            .map(|c| match c {
                Command::Set { .. } => "set",
                Command::Expire { .. } => "expire",
                Command::SAdd { .. } => "sadd",
                Command::Del { .. } => "del",
            })
            .collect();

        assert_eq!(kinds, ["del", "set", "expire"]);
    }

    #[test]
    fn drops_noop_commands() {
        let batch = Batch::new().sadd("tag", Vec::new()).del(Vec::new());

        assert!(batch.is_empty());
    }
}
