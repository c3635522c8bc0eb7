//! [SPARQL](https://www.w3.org/TR/sparql11-overview/) evaluation over the FalkorDB encoding.
//!
//! Stores execute SPARQL. See [`Store::query`](crate::store::Store::query) for an example.

pub(crate) mod analyzer;
pub(crate) mod dataset;
mod error;
pub(crate) mod escape;
pub(crate) mod eval;
pub(crate) mod expression;
pub(crate) mod geo;
mod model;
pub(crate) mod pattern;

pub use crate::sparql::error::EvaluationError;
pub use crate::sparql::geo::InvalidWktError;
pub use crate::sparql::model::{QueryResults, QuerySolution, QuerySolutionIter, QueryTripleIter};
pub use oxrdf::{Variable, VariableNameParseError};
pub use spargebra::SparqlSyntaxError;

/// Options for SPARQL query evaluation.
///
/// Usage example disabling the Cypher pushdown:
/// ```no_run
/// use oxfalkor::sparql::QueryOptions;
/// use oxfalkor::store::{Store, StoreConfig};
///
/// let store = Store::open(StoreConfig::new())?;
/// store.query_opt(
///     "SELECT * WHERE { ?s ?p ?o }",
///     QueryOptions::default().without_pushdown(),
/// )?;
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub(crate) without_pushdown: bool,
    pub(crate) strict_geospatial: bool,
}

impl QueryOptions {
    /// Evaluates the query through the host engine only, without
    /// trying to compile it into a Cypher statement. Results are
    /// identical; this mostly exists for debugging and testing.
    #[inline]
    #[must_use]
    pub fn without_pushdown(mut self) -> Self {
        self.without_pushdown = true;
        self
    }

    /// Makes unparseable WKT geometries in filters a hard error
    /// instead of a silent fallback.
    #[inline]
    #[must_use]
    pub fn with_strict_geospatial(mut self) -> Self {
        self.strict_geospatial = true;
        self
    }
}
