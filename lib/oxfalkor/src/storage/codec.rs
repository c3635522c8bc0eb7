//! Mapping between RDF triples and the property graph encoding.
//!
//! Every resource is a node labelled [`RESOURCE_LABEL`] with a `uri`
//! property. `rdf:type` statements with an IRI object become extra
//! node labels, object-position resources become edges typed with the
//! predicate IRI and literals become node properties. Literals of the
//! four primitive XSD datatypes are stored natively; every other
//! datatype keeps its best native coercion next to a sibling
//! `<predicate>__datatype` property holding the datatype IRI.

use crate::storage::driver::{CypherNode, CypherValue};
use crate::storage::error::{CorruptionError, StorageError};
use oxrdf::vocab::{geosparql, rdf, xsd};
use oxrdf::{
    BlankNode, Literal, LiteralRef, NamedNode, NamedOrBlankNode, NamedOrBlankNodeRef, Term,
    TermRef, TripleRef,
};
use oxsdatatypes::{Boolean, Double, Integer};

/// The reserved label carried by every resource node.
pub(crate) const RESOURCE_LABEL: &str = "Resource";
/// The node property holding the resource IRI.
pub(crate) const URI_PROPERTY: &str = "uri";
/// Suffix of the metadata properties holding non-native datatype IRIs.
pub(crate) const DATATYPE_SUFFIX: &str = "__datatype";
/// Prefix marking blank node identifiers in the `uri` property.
pub(crate) const BLANK_PREFIX: &str = "_:";

/// A buffered write against the graph, one of the three statement shapes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteOp {
    SetProperty {
        subject: String,
        predicate: String,
        value: CypherValue,
        datatype: Option<String>,
    },
    AddLabel {
        subject: String,
        label: String,
    },
    MergeEdge {
        subject: String,
        predicate: String,
        object: String,
    },
}

/// The removal mirror of [`WriteOp`]. Never deletes nodes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeleteOp {
    RemoveProperty {
        subject: String,
        predicate: String,
        value: CypherValue,
        datatype: Option<String>,
    },
    RemoveLabel {
        subject: String,
        label: String,
    },
    DeleteEdge {
        subject: String,
        predicate: String,
        object: String,
    },
}

/// Encodes a triple insertion into its statement shape.
pub(crate) fn encode_add(triple: TripleRef<'_>) -> Result<WriteOp, StorageError> {
    let subject = resource_uri(triple.subject);
    if triple.predicate == rdf::TYPE {
        if let TermRef::NamedNode(class) = triple.object {
            return Ok(WriteOp::AddLabel {
                subject,
                label: class.as_str().into(),
            });
        }
    }
    match triple.object {
        TermRef::NamedNode(o) => Ok(WriteOp::MergeEdge {
            subject,
            predicate: triple.predicate.as_str().into(),
            object: o.as_str().into(),
        }),
        TermRef::BlankNode(o) => Ok(WriteOp::MergeEdge {
            subject,
            predicate: triple.predicate.as_str().into(),
            object: format!("{BLANK_PREFIX}{}", o.as_str()),
        }),
        TermRef::Literal(literal) => {
            let predicate = check_property_predicate(triple.predicate.as_str())?;
            let (value, datatype) = encode_literal(literal);
            Ok(WriteOp::SetProperty {
                subject,
                predicate,
                value,
                datatype,
            })
        }
    }
}

/// Encodes a triple removal into its statement shape.
pub(crate) fn encode_delete(triple: TripleRef<'_>) -> Result<DeleteOp, StorageError> {
    Ok(match encode_add(triple)? {
        WriteOp::SetProperty {
            subject,
            predicate,
            value,
            datatype,
        } => DeleteOp::RemoveProperty {
            subject,
            predicate,
            value,
            datatype,
        },
        WriteOp::AddLabel { subject, label } => DeleteOp::RemoveLabel { subject, label },
        WriteOp::MergeEdge {
            subject,
            predicate,
            object,
        } => DeleteOp::DeleteEdge {
            subject,
            predicate,
            object,
        },
    })
}

fn check_property_predicate(predicate: &str) -> Result<String, StorageError> {
    if predicate.ends_with(DATATYPE_SUFFIX) {
        return Err(StorageError::UnsupportedDatatype {
            predicate: NamedNode::new_unchecked(predicate),
        });
    }
    Ok(predicate.into())
}

/// The `uri` property value of a resource.
pub(crate) fn resource_uri(term: NamedOrBlankNodeRef<'_>) -> String {
    match term {
        NamedOrBlankNodeRef::NamedNode(n) => n.as_str().into(),
        NamedOrBlankNodeRef::BlankNode(b) => format!("{BLANK_PREFIX}{}", b.as_str()),
    }
}

/// The `uri` property value of an object-position resource, if it is one.
pub(crate) fn object_uri(term: TermRef<'_>) -> Option<String> {
    match term {
        TermRef::NamedNode(n) => Some(n.as_str().into()),
        TermRef::BlankNode(b) => Some(format!("{BLANK_PREFIX}{}", b.as_str())),
        TermRef::Literal(_) => None,
    }
}

/// Decodes a stored `uri` property back into a resource.
pub(crate) fn decode_resource(uri: &str) -> Result<NamedOrBlankNode, StorageError> {
    if let Some(id) = uri.strip_prefix(BLANK_PREFIX) {
        Ok(BlankNode::new(id)
            .map_err(|e| CorruptionError::new(Box::new(e)))?
            .into())
    } else {
        Ok(NamedNode::new(uri)
            .map_err(|e| CorruptionError::new(Box::new(e)))?
            .into())
    }
}

pub(crate) fn decode_resource_term(uri: &str) -> Result<Term, StorageError> {
    Ok(match decode_resource(uri)? {
        NamedOrBlankNode::NamedNode(n) => n.into(),
        NamedOrBlankNode::BlankNode(b) => b.into(),
    })
}

/// Encodes a literal into its stored value and, when the datatype is
/// not one of the four native primitives, the sibling datatype IRI.
///
/// Language tags are not preserved: only the lexical form is stored.
pub(crate) fn encode_literal(literal: LiteralRef<'_>) -> (CypherValue, Option<String>) {
    if literal.language().is_some() {
        return (CypherValue::String(literal.value().into()), None);
    }
    let value = literal.value();
    let datatype = literal.datatype();
    if datatype == xsd::STRING {
        return (CypherValue::String(value.into()), None);
    }
    if datatype == xsd::INTEGER {
        if let Ok(i) = value.parse::<Integer>() {
            return (CypherValue::Integer(i.into()), None);
        }
    } else if datatype == xsd::DOUBLE {
        if let Ok(d) = value.parse::<Double>() {
            return (CypherValue::Double(d.into()), None);
        }
    } else if datatype == xsd::BOOLEAN {
        if let Ok(b) = value.parse::<Boolean>() {
            return (CypherValue::Boolean(b.into()), None);
        }
    }
    let sibling = Some(datatype.as_str().to_owned());
    if is_integer_datatype(datatype.as_str()) {
        if let Ok(i) = value.parse::<Integer>() {
            return (CypherValue::Integer(i.into()), sibling);
        }
    } else if is_decimal_datatype(datatype.as_str()) {
        if let Ok(d) = value.parse::<Double>() {
            return (CypherValue::Double(d.into()), sibling);
        }
    }
    (CypherValue::String(value.into()), sibling)
}

fn is_integer_datatype(iri: &str) -> bool {
    matches!(
        iri,
        "http://www.w3.org/2001/XMLSchema#byte"
            | "http://www.w3.org/2001/XMLSchema#short"
            | "http://www.w3.org/2001/XMLSchema#int"
            | "http://www.w3.org/2001/XMLSchema#long"
            | "http://www.w3.org/2001/XMLSchema#unsignedByte"
            | "http://www.w3.org/2001/XMLSchema#unsignedShort"
            | "http://www.w3.org/2001/XMLSchema#unsignedInt"
            | "http://www.w3.org/2001/XMLSchema#unsignedLong"
            | "http://www.w3.org/2001/XMLSchema#positiveInteger"
            | "http://www.w3.org/2001/XMLSchema#negativeInteger"
            | "http://www.w3.org/2001/XMLSchema#nonPositiveInteger"
            | "http://www.w3.org/2001/XMLSchema#nonNegativeInteger"
    )
}

fn is_decimal_datatype(iri: &str) -> bool {
    matches!(
        iri,
        "http://www.w3.org/2001/XMLSchema#decimal" | "http://www.w3.org/2001/XMLSchema#float"
    )
}

/// Reconstructs a literal from a stored value and its optional
/// sibling datatype IRI.
pub(crate) fn decode_literal(
    value: &CypherValue,
    datatype: Option<&str>,
) -> Result<Literal, StorageError> {
    if let Some(datatype) = datatype {
        let datatype =
            NamedNode::new(datatype).map_err(|e| CorruptionError::new(Box::new(e)))?;
        return Ok(Literal::new_typed_literal(lexical_form(value)?, datatype));
    }
    Ok(match value {
        CypherValue::Boolean(b) => Literal::from(*b),
        CypherValue::Integer(i) => Literal::from(*i),
        CypherValue::Double(d) => Literal::from(*d),
        CypherValue::String(s) => Literal::new_simple_literal(s.as_str()),
        CypherValue::Point(p) => Literal::new_typed_literal(
            format!("POINT({} {})", p.longitude, p.latitude),
            geosparql::WKT_LITERAL,
        ),
        value => {
            return Err(
                CorruptionError::msg(format!("unexpected stored literal value {value:?}")).into(),
            );
        }
    })
}

fn lexical_form(value: &CypherValue) -> Result<String, StorageError> {
    Ok(match value {
        CypherValue::Boolean(b) => if *b { "true" } else { "false" }.into(),
        CypherValue::Integer(i) => i.to_string(),
        CypherValue::Double(d) => Double::from(*d).to_string(),
        CypherValue::String(s) => s.clone(),
        value => {
            return Err(
                CorruptionError::msg(format!("value {value:?} has no lexical form")).into(),
            );
        }
    })
}

/// Escapes a name (predicate IRI, label...) for inlining between
/// backticks in a Cypher statement.
pub(crate) fn escape_name(name: &str) -> String {
    if name.contains('`') {
        name.replace('`', "``")
    } else {
        name.into()
    }
}

/// Whether a property key is part of the stored triple data, as
/// opposed to the `uri` key and the datatype metadata siblings.
pub(crate) fn is_data_property(key: &str) -> bool {
    key != URI_PROPERTY && !key.ends_with(DATATYPE_SUFFIX)
}

/// The per-column decoding rule of a compiled statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnType {
    /// A `uri` projection of a resource node.
    NodeUri,
    /// A raw property value, optionally followed by its datatype slot.
    LiteralValue,
    /// A `type(r)` projection of a variable predicate.
    PredicateName,
    /// A node label standing for an `rdf:type` object.
    TypeLabel,
    /// A whole-node projection from the keys-enumeration branch of a
    /// variable-predicate query; expanded by the executor.
    SubjectProperties,
}

/// Decodes one result row of a compiled statement into terms.
///
/// `slots` records, per output column, whether a datatype slot
/// follows the value slot; `kinds` is the column typing of the branch
/// the row belongs to (`None` marks a column the branch never binds);
/// `offset` skips the leading branch discriminator when present.
pub(crate) fn decode_row(
    values: &[CypherValue],
    slots: &[bool],
    kinds: &[Option<ColumnType>],
    offset: usize,
) -> Result<Vec<Option<Term>>, StorageError> {
    let mut terms = Vec::with_capacity(kinds.len());
    let mut pos = offset;
    for (i, kind) in kinds.iter().enumerate() {
        let width = 1 + usize::from(slots[i]);
        let slice = values.get(pos..pos + width).ok_or_else(|| {
            StorageError::protocol("result row is shorter than the compiled projection")
        })?;
        pos += width;
        let Some(kind) = kind else {
            terms.push(None);
            continue;
        };
        terms.push(decode_column(&slice[0], slice.get(1), *kind)?);
    }
    Ok(terms)
}

fn decode_column(
    value: &CypherValue,
    datatype: Option<&CypherValue>,
    kind: ColumnType,
) -> Result<Option<Term>, StorageError> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(match kind {
        ColumnType::NodeUri => match value {
            CypherValue::String(uri) => Some(decode_resource_term(uri)?),
            CypherValue::Node(node) => node
                .property(URI_PROPERTY)
                .and_then(CypherValue::as_str)
                .map(decode_resource_term)
                .transpose()?,
            value => {
                return Err(CorruptionError::msg(format!(
                    "expected a resource reference, got {value:?}"
                ))
                .into());
            }
        },
        ColumnType::LiteralValue => {
            let datatype = match datatype {
                Some(CypherValue::String(iri)) => Some(iri.as_str()),
                Some(CypherValue::Null) | None => None,
                Some(value) => {
                    return Err(CorruptionError::msg(format!(
                        "expected a datatype IRI, got {value:?}"
                    ))
                    .into());
                }
            };
            Some(decode_literal(value, datatype)?.into())
        }
        ColumnType::PredicateName => match value.as_str() {
            Some(name) => Some(
                NamedNode::new(name)
                    .map_err(|e| CorruptionError::new(Box::new(e)))?
                    .into(),
            ),
            None => {
                return Err(CorruptionError::msg(format!(
                    "expected a relationship type, got {value:?}"
                ))
                .into());
            }
        },
        ColumnType::TypeLabel => match value.as_str() {
            Some(RESOURCE_LABEL) => None,
            Some(label) => Some(
                NamedNode::new(label)
                    .map_err(|e| CorruptionError::new(Box::new(e)))?
                    .into(),
            ),
            None => {
                return Err(
                    CorruptionError::msg(format!("expected a label, got {value:?}")).into(),
                );
            }
        },
        ColumnType::SubjectProperties => {
            return Err(StorageError::protocol(
                "whole-node columns must be expanded by the caller",
            ));
        }
    })
}

/// The data properties of a node decoded as predicate/literal pairs,
/// with metadata siblings resolved and skipped.
pub(crate) fn node_property_pairs(
    node: &CypherNode,
) -> Result<Vec<(NamedNode, Literal)>, StorageError> {
    let mut pairs = Vec::new();
    for (key, value) in &node.properties {
        if !is_data_property(key) {
            continue;
        }
        let datatype = node
            .property(&format!("{key}{DATATYPE_SUFFIX}"))
            .and_then(CypherValue::as_str);
        let predicate =
            NamedNode::new(key.as_str()).map_err(|e| CorruptionError::new(Box::new(e)))?;
        pairs.push((predicate, decode_literal(value, datatype)?));
    }
    Ok(pairs)
}

/// The `rdf:type` objects encoded in a node's labels.
pub(crate) fn node_type_labels(node: &CypherNode) -> Result<Vec<NamedNode>, StorageError> {
    node.labels
        .iter()
        .filter(|label| label.as_str() != RESOURCE_LABEL)
        .map(|label| {
            NamedNode::new(label.as_str()).map_err(|e| CorruptionError::new(Box::new(e)).into())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxrdf::NamedNodeRef;

    #[test]
    fn add_encoding_follows_object_kind() -> Result<(), StorageError> {
        let s = NamedNodeRef::new_unchecked("http://example.com/s");
        let knows = NamedNodeRef::new_unchecked("http://example.com/knows");
        let o = NamedNodeRef::new_unchecked("http://example.com/o");

        assert_eq!(
            encode_add(TripleRef::new(s, knows, o))?,
            WriteOp::MergeEdge {
                subject: "http://example.com/s".into(),
                predicate: "http://example.com/knows".into(),
                object: "http://example.com/o".into(),
            }
        );
        assert_eq!(
            encode_add(TripleRef::new(s, rdf::TYPE, o))?,
            WriteOp::AddLabel {
                subject: "http://example.com/s".into(),
                label: "http://example.com/o".into(),
            }
        );
        assert_eq!(
            encode_add(TripleRef::new(s, knows, LiteralRef::new_simple_literal("x")))?,
            WriteOp::SetProperty {
                subject: "http://example.com/s".into(),
                predicate: "http://example.com/knows".into(),
                value: CypherValue::String("x".into()),
                datatype: None,
            }
        );
        Ok(())
    }

    #[test]
    fn blank_nodes_keep_their_identifier() -> Result<(), StorageError> {
        let s = BlankNode::new("b0").unwrap();
        let p = NamedNodeRef::new_unchecked("http://example.com/p");
        let o = NamedNodeRef::new_unchecked("http://example.com/o");
        let WriteOp::MergeEdge { subject, .. } =
            encode_add(TripleRef::new(s.as_ref(), p, o))?
        else {
            panic!("expected an edge");
        };
        assert_eq!(subject, "_:b0");
        assert_eq!(
            decode_resource("_:b0")?,
            NamedOrBlankNode::BlankNode(BlankNode::new("b0").unwrap())
        );
        Ok(())
    }

    #[test]
    fn native_literals_have_no_metadata() {
        let (value, datatype) = encode_literal(LiteralRef::new_typed_literal("42", xsd::INTEGER));
        assert_eq!(value, CypherValue::Integer(42));
        assert_eq!(datatype, None);

        let (value, datatype) = encode_literal(LiteralRef::new_typed_literal("true", xsd::BOOLEAN));
        assert_eq!(value, CypherValue::Boolean(true));
        assert_eq!(datatype, None);
    }

    #[test]
    fn other_datatypes_keep_a_sibling() -> Result<(), StorageError> {
        let wkt = LiteralRef::new_typed_literal("POINT(-0.118 51.509)", geosparql::WKT_LITERAL);
        let (value, datatype) = encode_literal(wkt);
        assert_eq!(value, CypherValue::String("POINT(-0.118 51.509)".into()));
        assert_eq!(datatype.as_deref(), Some(geosparql::WKT_LITERAL.as_str()));
        assert_eq!(decode_literal(&value, datatype.as_deref())?, wkt.into_owned());
        Ok(())
    }

    #[test]
    fn decimal_coerces_to_double_but_round_trips_its_datatype() -> Result<(), StorageError> {
        let decimal = LiteralRef::new_typed_literal("5.5", xsd::DECIMAL);
        let (value, datatype) = encode_literal(decimal);
        assert_eq!(value, CypherValue::Double(5.5));
        assert_eq!(datatype.as_deref(), Some(xsd::DECIMAL.as_str()));
        assert_eq!(decode_literal(&value, datatype.as_deref())?, decimal.into_owned());
        Ok(())
    }

    #[test]
    fn language_tags_are_dropped() {
        let tagged = Literal::new_language_tagged_literal_unchecked("chat", "fr");
        let (value, datatype) = encode_literal(tagged.as_ref());
        assert_eq!(value, CypherValue::String("chat".into()));
        assert_eq!(datatype, None);
    }

    #[test]
    fn metadata_predicates_are_rejected() {
        let s = NamedNodeRef::new_unchecked("http://example.com/s");
        let p = NamedNodeRef::new_unchecked("http://example.com/p__datatype");
        let result = encode_add(TripleRef::new(s, p, LiteralRef::new_simple_literal("x")));
        assert!(matches!(
            result,
            Err(StorageError::UnsupportedDatatype { .. })
        ));
    }

    #[test]
    fn node_expansion_skips_metadata_and_reserved_label() -> Result<(), StorageError> {
        let node = CypherNode {
            id: 0,
            labels: vec![RESOURCE_LABEL.into(), "http://example.com/Person".into()],
            properties: vec![
                (URI_PROPERTY.into(), "http://example.com/s".into()),
                ("http://example.com/age".into(), CypherValue::Integer(25)),
                (
                    "http://example.com/geom".into(),
                    "POINT(2.35 48.85)".into(),
                ),
                (
                    format!("http://example.com/geom{DATATYPE_SUFFIX}"),
                    geosparql::WKT_LITERAL.as_str().into(),
                ),
            ],
        };
        let pairs = node_property_pairs(&node)?;
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1, Literal::from(25));
        assert_eq!(pairs[1].1.datatype(), geosparql::WKT_LITERAL);
        assert_eq!(
            node_type_labels(&node)?,
            vec![NamedNode::new_unchecked("http://example.com/Person")]
        );
        Ok(())
    }
}
