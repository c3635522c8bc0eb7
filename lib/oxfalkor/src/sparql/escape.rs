//! The raw Cypher escape hatch.
//!
//! Executes a caller-supplied Cypher fragment verbatim and projects
//! its result columns onto SPARQL variables in declaration order.

use crate::model::{BlankNode, NamedNode, Term, Variable};
use crate::sparql::error::EvaluationError;
use crate::sparql::model::QuerySolutionIter;
use crate::storage::driver::{CypherValue, Row};
use crate::storage::codec::{URI_PROPERTY, decode_literal, decode_resource_term};
use crate::storage::{CorruptionError, Storage, StorageError};
use std::sync::Arc;

pub(crate) fn evaluate_cypher(
    storage: &Storage,
    fragment: &str,
    variables: &[Variable],
) -> Result<QuerySolutionIter, EvaluationError> {
    let rows = storage.query(fragment, &[])?;
    let variables: Arc<[Variable]> = variables.into();
    let width = variables.len();
    let solutions: Vec<Result<Vec<Option<Term>>, EvaluationError>> = rows
        .iter()
        .map(|row| decode_columns(row, width).map_err(EvaluationError::from))
        .collect();
    Ok(QuerySolutionIter::new(variables, solutions.into_iter()))
}

fn decode_columns(row: &Row, width: usize) -> Result<Vec<Option<Term>>, StorageError> {
    let mut terms = Vec::with_capacity(width);
    for i in 0..width {
        terms.push(match row.values().get(i) {
            Some(value) => decode_default(value)?,
            None => None,
        });
    }
    Ok(terms)
}

/// The default decoding rule: values that look like resource
/// references (node proxies, `_:` identifiers, IRIs with a scheme)
/// become resources, everything else becomes a literal.
fn decode_default(value: &CypherValue) -> Result<Option<Term>, StorageError> {
    Ok(match value {
        CypherValue::Null => None,
        CypherValue::Node(node) => match node
            .property(URI_PROPERTY)
            .and_then(CypherValue::as_str)
        {
            Some(uri) => Some(decode_resource_term(uri)?),
            None => None,
        },
        CypherValue::String(s) => {
            if let Some(id) = s.strip_prefix("_:") {
                match BlankNode::new(id) {
                    Ok(node) => Some(node.into()),
                    Err(_) => Some(decode_literal(value, None)?.into()),
                }
            } else if looks_like_iri(s) {
                match NamedNode::new(s.as_str()) {
                    Ok(node) => Some(node.into()),
                    Err(_) => Some(decode_literal(value, None)?.into()),
                }
            } else {
                Some(decode_literal(value, None)?.into())
            }
        }
        CypherValue::Boolean(_)
        | CypherValue::Integer(_)
        | CypherValue::Double(_)
        | CypherValue::Point(_) => Some(decode_literal(value, None)?.into()),
        value => {
            return Err(CorruptionError::msg(format!(
                "column value {value:?} cannot be bound to a variable"
            ))
            .into());
        }
    })
}

/// Whether the string starts with an IRI scheme (`letter` followed by
/// letters, digits, `+`, `-` or `.`, then a colon).
fn looks_like_iri(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    for c in chars {
        match c {
            ':' => return true,
            c if c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.' => {}
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection() {
        assert!(looks_like_iri("http://example.com"));
        assert!(looks_like_iri("mailto:someone@example.com"));
        assert!(looks_like_iri("urn:isbn:0451450523"));
        assert!(!looks_like_iri("Alice"));
        assert!(!looks_like_iri("42 is not an IRI"));
        assert!(!looks_like_iri(":missing-scheme"));
    }

    #[test]
    fn default_decoding_prefers_resources() -> Result<(), StorageError> {
        assert_eq!(
            decode_default(&CypherValue::String("http://example.com/a".into()))?,
            Some(NamedNode::new_unchecked("http://example.com/a").into())
        );
        assert_eq!(
            decode_default(&CypherValue::String("_:b0".into()))?,
            Some(BlankNode::new_unchecked("b0").into())
        );
        assert_eq!(
            decode_default(&CypherValue::Integer(42))?,
            Some(oxrdf::Literal::from(42).into())
        );
        assert_eq!(
            decode_default(&CypherValue::String("plain text".into()))?,
            Some(oxrdf::Literal::new_simple_literal("plain text").into())
        );
        assert_eq!(decode_default(&CypherValue::Null)?, None);
        Ok(())
    }
}
