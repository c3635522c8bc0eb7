use crate::sparql::geo::InvalidWktError;
use crate::storage::StorageError;
use spareval::QueryEvaluationError;
use spargebra::SparqlSyntaxError;
use std::convert::Infallible;
use std::error::Error;
use std::io;

/// A SPARQL evaluation error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EvaluationError {
    /// An error in SPARQL parsing.
    #[error(transparent)]
    Parsing(#[from] SparqlSyntaxError),
    /// An error from the storage.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An error raised by the fallback evaluator.
    #[error("{0}")]
    Evaluation(#[source] Box<dyn Error + Send + Sync + 'static>),
    /// A geospatial filter carried a geometry that is not valid WKT
    /// while strict geospatial evaluation was requested.
    #[error(transparent)]
    InvalidWkt(#[from] InvalidWktError),
    #[doc(hidden)]
    #[error(transparent)]
    Unexpected(Box<dyn Error + Send + Sync + 'static>),
}

impl From<Infallible> for EvaluationError {
    #[inline]
    fn from(error: Infallible) -> Self {
        match error {}
    }
}

impl From<QueryEvaluationError> for EvaluationError {
    fn from(error: QueryEvaluationError) -> Self {
        match error {
            QueryEvaluationError::Dataset(error) => match error.downcast() {
                Ok(error) => Self::Storage(*error),
                Err(error) => Self::Evaluation(error),
            },
            error => Self::Evaluation(Box::new(error)),
        }
    }
}

impl From<EvaluationError> for io::Error {
    #[inline]
    fn from(error: EvaluationError) -> Self {
        match error {
            EvaluationError::Parsing(error) => Self::new(io::ErrorKind::InvalidData, error),
            EvaluationError::InvalidWkt(error) => Self::new(io::ErrorKind::InvalidInput, error),
            EvaluationError::Storage(error) => error.into(),
            EvaluationError::Evaluation(error) | EvaluationError::Unexpected(error) => {
                match error.downcast() {
                    Ok(error) => *error,
                    Err(error) => Self::other(error),
                }
            }
        }
    }
}
