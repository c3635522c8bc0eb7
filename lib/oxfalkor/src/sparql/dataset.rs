//! Bridge between the store facade and the fallback evaluator.
//!
//! When pushdown is not applicable the query is handed to
//! [`spareval`], which pulls triples through this adapter one pattern
//! at a time; every call turns into a single Cypher statement against
//! the store. The adapter manages a single RDF graph, so named graph
//! patterns never match.

use crate::storage::{Storage, StorageError};
use oxrdf::{NamedOrBlankNode, Term, Triple};
use spareval::{InternalQuad, QueryableDataset};

pub(crate) struct StoreDataset<'a> {
    storage: &'a Storage,
}

impl<'a> StoreDataset<'a> {
    pub(crate) fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    fn pattern_triples(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
    ) -> Result<Vec<Triple>, StorageError> {
        let subject = match subject {
            Some(Term::NamedNode(n)) => Some(NamedOrBlankNode::from(n.clone())),
            Some(Term::BlankNode(b)) => Some(NamedOrBlankNode::from(b.clone())),
            Some(Term::Literal(_)) => return Ok(Vec::new()),
            None => None,
        };
        let predicate = match predicate {
            Some(Term::NamedNode(n)) => Some(n.clone()),
            Some(_) => return Ok(Vec::new()),
            None => None,
        };
        self.storage.triples_for_pattern(
            subject.as_ref().map(NamedOrBlankNode::as_ref),
            predicate.as_ref().map(|p| p.as_ref()),
            object.map(Term::as_ref),
        )
    }
}

impl<'a> QueryableDataset<'a> for StoreDataset<'a> {
    type InternalTerm = Term;
    type Error = StorageError;

    fn internal_quads_for_pattern(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        graph_name: Option<Option<&Term>>,
    ) -> impl Iterator<Item = Result<InternalQuad<Term>, StorageError>> + use<'a> {
        // Only the default graph exists.
        let results: Vec<Result<InternalQuad<Term>, StorageError>> = if graph_name
            != Some(None)
        {
            Vec::new()
        } else {
            match self.pattern_triples(subject, predicate, object) {
                Ok(triples) => triples
                    .into_iter()
                    .map(|triple| {
                        Ok(InternalQuad {
                            subject: match triple.subject {
                                NamedOrBlankNode::NamedNode(n) => Term::NamedNode(n),
                                NamedOrBlankNode::BlankNode(b) => Term::BlankNode(b),
                            },
                            predicate: Term::NamedNode(triple.predicate),
                            object: triple.object,
                            graph_name: None,
                        })
                    })
                    .collect(),
                Err(error) => vec![Err(error)],
            }
        };
        results.into_iter()
    }

    fn internalize_term(&self, term: Term) -> Result<Term, StorageError> {
        Ok(term)
    }

    fn externalize_term(&self, term: Term) -> Result<Term, StorageError> {
        Ok(term)
    }
}
