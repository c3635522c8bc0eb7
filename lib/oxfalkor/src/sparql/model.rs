use crate::model::{Term, Triple, Variable};
use crate::sparql::error::EvaluationError;
pub use sparesults::QuerySolution;
use std::sync::Arc;

/// Results of a [SPARQL query](https://www.w3.org/TR/sparql11-query/).
pub enum QueryResults {
    /// Results of a [SELECT](https://www.w3.org/TR/sparql11-query/#select) query.
    Solutions(QuerySolutionIter),
    /// Result of a [ASK](https://www.w3.org/TR/sparql11-query/#ask) query.
    Boolean(bool),
    /// Results of a [CONSTRUCT](https://www.w3.org/TR/sparql11-query/#construct) or [DESCRIBE](https://www.w3.org/TR/sparql11-query/#describe) query.
    Graph(QueryTripleIter),
}

impl From<QuerySolutionIter> for QueryResults {
    #[inline]
    fn from(value: QuerySolutionIter) -> Self {
        Self::Solutions(value)
    }
}

impl From<spareval::QueryResults<'_>> for QueryResults {
    fn from(results: spareval::QueryResults<'_>) -> Self {
        match results {
            spareval::QueryResults::Solutions(solutions) => Self::Solutions(solutions.into()),
            spareval::QueryResults::Boolean(value) => Self::Boolean(value),
            spareval::QueryResults::Graph(triples) => Self::Graph(triples.into()),
        }
    }
}

/// An iterator over [`QuerySolution`]s.
///
/// ```no_run
/// use oxfalkor::sparql::QueryResults;
/// use oxfalkor::store::{Store, StoreConfig};
///
/// let store = Store::open(StoreConfig::new())?;
/// if let QueryResults::Solutions(solutions) = store.query("SELECT ?s WHERE { ?s ?p ?o }")? {
///     for solution in solutions {
///         println!("{:?}", solution?.get("s"));
///     }
/// }
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
pub struct QuerySolutionIter {
    variables: Arc<[Variable]>,
    iter: Box<dyn Iterator<Item = Result<QuerySolution, EvaluationError>>>,
}

impl QuerySolutionIter {
    /// Builds an iterator of solutions from an ordered list of
    /// solution variables and an iterator of solution tuples aligned
    /// with it.
    pub(crate) fn new(
        variables: Arc<[Variable]>,
        iter: impl Iterator<Item = Result<Vec<Option<Term>>, EvaluationError>> + 'static,
    ) -> Self {
        Self {
            variables: Arc::clone(&variables),
            iter: Box::new(
                iter.map(move |t| t.map(|values| (Arc::clone(&variables), values).into())),
            ),
        }
    }

    /// The variables used in the solutions.
    #[inline]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

impl From<spareval::QuerySolutionIter<'_>> for QuerySolutionIter {
    fn from(iter: spareval::QuerySolutionIter<'_>) -> Self {
        let variables: Arc<[Variable]> = iter.variables().into();
        let rows: Vec<_> = iter.map(|s| s.map_err(EvaluationError::from)).collect();
        Self {
            variables,
            iter: Box::new(rows.into_iter()),
        }
    }
}

impl Iterator for QuerySolutionIter {
    type Item = Result<QuerySolution, EvaluationError>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// An iterator over the triples of a graph result.
pub struct QueryTripleIter {
    pub(crate) iter: Box<dyn Iterator<Item = Result<Triple, EvaluationError>>>,
}

impl From<spareval::QueryTripleIter<'_>> for QueryTripleIter {
    fn from(iter: spareval::QueryTripleIter<'_>) -> Self {
        let triples: Vec<_> = iter.map(|t| t.map_err(EvaluationError::from)).collect();
        Self {
            iter: Box::new(triples.into_iter()),
        }
    }
}

impl Iterator for QueryTripleIter {
    type Item = Result<Triple, EvaluationError>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}
