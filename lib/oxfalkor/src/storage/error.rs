use oxrdf::NamedNode;
use std::error::Error;
use std::io;
use thiserror::Error;

/// An error related to storage operations (reads, writes, flushes...).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The FalkorDB server cannot be reached or refused the operation.
    #[error("the FalkorDB server is unavailable: {0}")]
    Unavailable(#[source] Box<dyn Error + Send + Sync + 'static>),
    /// The server returned a reply the adapter does not understand
    /// (missing column, wrong type, malformed frame).
    #[error("unexpected reply from the FalkorDB server: {0}")]
    Protocol(String),
    /// Stored data does not follow the adapter encoding.
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
    /// A batch of a bulk commit failed after earlier batches were
    /// already applied. The graph is left in a partially written
    /// state.
    #[error("bulk commit failed at batch {batch_index} after earlier batches were applied: {source}")]
    PartialCommit {
        /// Index of the failing batch within the commit.
        batch_index: usize,
        #[source]
        source: Box<StorageError>,
    },
    /// The literal cannot be encoded as a node property: its
    /// predicate collides with the datatype metadata key space.
    #[error("the predicate {predicate} collides with the datatype metadata encoding")]
    UnsupportedDatatype {
        /// The offending predicate.
        predicate: NamedNode,
    },
}

impl StorageError {
    /// Builds an [`StorageError::Unavailable`] error. Mostly useful
    /// for [`CypherDriver`](crate::storage::driver::CypherDriver)
    /// implementations.
    #[inline]
    pub fn unavailable(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self::Unavailable(error.into())
    }

    /// Builds an [`StorageError::Protocol`] error. Mostly useful for
    /// [`CypherDriver`](crate::storage::driver::CypherDriver)
    /// implementations.
    #[inline]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<io::Error> for StorageError {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::Unavailable(Box::new(error))
    }
}

impl From<StorageError> for io::Error {
    #[inline]
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Unavailable(error) => match error.downcast() {
                Ok(error) => *error,
                Err(error) => Self::new(io::ErrorKind::ConnectionRefused, error),
            },
            StorageError::Corruption(error) => error.into(),
            error => Self::other(error),
        }
    }
}

/// An error returned if some content in the graph does not follow the adapter encoding.
#[derive(Debug, Error)]
pub enum CorruptionError {
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl CorruptionError {
    /// Builds an error from a printable error message.
    #[inline]
    pub(crate) fn new(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self::Other(error.into())
    }

    /// Builds an error from a printable error message.
    #[inline]
    pub(crate) fn msg(msg: impl Into<String>) -> Self {
        Self::Msg(msg.into())
    }
}

impl From<CorruptionError> for io::Error {
    #[inline]
    fn from(error: CorruptionError) -> Self {
        Self::new(io::ErrorKind::InvalidData, error)
    }
}
