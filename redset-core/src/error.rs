use std::fmt::{Debug, Display};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetError<E: Display + Debug> {
    #[error("A set name must be a non-empty string.")]
    /// The name given to the set handle was empty.
    InvalidName,

    #[error("The connection config cannot be used: {0}")]
    InvalidConnectionConfig(String),

    #[error("The operation kept conflicting with concurrent writers after {attempts} attempts.")]
    /// Every attempt allowed by the retry policy was aborted by a concurrent
    /// modification of the set.
    RetryExhausted { attempts: u32 },

    #[error("The operation did not commit within the retry deadline. Gave up after {elapsed:?}.")]
    Timeout { elapsed: Duration },

    #[error("The operation was cancelled before it could commit.")]
    Cancelled,

    #[error("The store replied with something the operation did not expect: {0}")]
    UnexpectedReply(String),

    #[error("A failure occurred within the store: {0}")]
    Store(E),
}

impl<E: Display + Debug> SetError<E> {
    #[inline]
    /// Returns if the error was caused by the store rather than the client.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
