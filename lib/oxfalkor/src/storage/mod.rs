//! The store facade: a narrow typed interface over the Cypher driver.
//!
//! All reads and writes of the adapter go through [`Storage`]. It
//! owns the connection pool, creates the `Resource.uri` index at
//! startup and renders the canonical statement families used by the
//! triple pattern read path.

pub(crate) mod buffer;
pub(crate) mod codec;
pub mod driver;
mod error;
pub mod falkordb;

use crate::storage::buffer::TransactionBuffer;
use crate::storage::codec::{
    DATATYPE_SUFFIX, RESOURCE_LABEL, URI_PROPERTY, decode_literal, decode_resource, encode_literal,
    escape_name, node_property_pairs, node_type_labels,
};
use crate::storage::driver::{CypherConnection, CypherDriver, CypherValue, Row};
pub use crate::storage::error::{CorruptionError, StorageError};
use oxrdf::vocab::rdf;
use oxrdf::{LiteralRef, NamedNode, NamedNodeRef, NamedOrBlankNodeRef, TermRef, Triple};
use std::sync::{Arc, Mutex, PoisonError};

/// The facade over the Cypher driver shared by one store.
pub(crate) struct Storage {
    driver: Arc<dyn CypherDriver>,
    graph_name: String,
    pool: Mutex<Vec<Box<dyn CypherConnection>>>,
}

impl Storage {
    /// Connects and makes sure the `Resource.uri` index exists.
    pub(crate) fn new(
        driver: Arc<dyn CypherDriver>,
        graph_name: String,
    ) -> Result<Self, StorageError> {
        let storage = Self {
            driver,
            graph_name,
            pool: Mutex::new(Vec::new()),
        };
        storage.ensure_index(RESOURCE_LABEL, URI_PROPERTY)?;
        Ok(storage)
    }

    pub(crate) fn graph_name(&self) -> &str {
        &self.graph_name
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn CypherConnection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let pooled = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut connection = match pooled {
            Some(connection) => connection,
            None => self.driver.connect()?,
        };
        // A connection that returned an error is dropped instead of
        // being put back into the pool.
        let result = f(&mut *connection)?;
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection);
        Ok(result)
    }

    /// Runs one parameterized statement and materializes its rows.
    pub(crate) fn query(
        &self,
        cypher: &str,
        params: &[(String, CypherValue)],
    ) -> Result<Vec<Row>, StorageError> {
        self.with_connection(|connection| connection.execute(&self.graph_name, cypher, params))
    }

    /// Runs several statements sequentially on one connection,
    /// stopping at the first failure.
    pub(crate) fn multi(
        &self,
        statements: &[(String, Vec<(String, CypherValue)>)],
    ) -> Result<(), StorageError> {
        self.with_connection(|connection| {
            for (cypher, params) in statements {
                connection.execute(&self.graph_name, cypher, params)?;
            }
            Ok(())
        })
    }

    /// Flushes a transaction buffer. A failure after the first batch
    /// leaves the graph partially written and is reported as
    /// [`StorageError::PartialCommit`].
    pub(crate) fn commit(&self, buffer: &TransactionBuffer) -> Result<usize, StorageError> {
        let statements = buffer.statements();
        self.with_connection(|connection| {
            for (batch_index, (cypher, params)) in statements.iter().enumerate() {
                if let Err(source) = connection.execute(&self.graph_name, cypher, params) {
                    return Err(if batch_index == 0 {
                        source
                    } else {
                        StorageError::PartialCommit {
                            batch_index,
                            source: Box::new(source),
                        }
                    });
                }
            }
            Ok(statements.len())
        })
    }

    /// Creates the index if it does not exist yet; "already indexed"
    /// replies are swallowed.
    pub(crate) fn ensure_index(&self, label: &str, property: &str) -> Result<(), StorageError> {
        let statement = format!(
            "CREATE INDEX FOR (n:`{}`) ON (n.`{}`)",
            escape_name(label),
            escape_name(property)
        );
        match self.query(&statement, &[]) {
            Ok(_) => Ok(()),
            Err(StorageError::Protocol(message)) if message.contains("already indexed") => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Fetches the triples matching a pattern, one statement family
    /// per pattern shape. This is the triple-at-a-time read path used
    /// by `find` and by the SPARQL fallback evaluation.
    pub(crate) fn triples_for_pattern(
        &self,
        subject: Option<NamedOrBlankNodeRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
    ) -> Result<Vec<Triple>, StorageError> {
        match predicate {
            Some(predicate) if predicate == rdf::TYPE => {
                self.type_triples(subject, object)
            }
            Some(predicate) => {
                if predicate.as_str().ends_with(DATATYPE_SUFFIX) {
                    return Ok(Vec::new());
                }
                let mut triples = Vec::new();
                match object {
                    Some(TermRef::Literal(literal)) => {
                        self.property_triples(subject, predicate, Some(literal), &mut triples)?;
                    }
                    Some(object) => {
                        self.edge_triples(subject, Some(predicate), Some(object), &mut triples)?;
                    }
                    None => {
                        self.edge_triples(subject, Some(predicate), None, &mut triples)?;
                        self.property_triples(subject, predicate, None, &mut triples)?;
                    }
                }
                Ok(triples)
            }
            None => {
                let mut triples = Vec::new();
                if !matches!(object, Some(TermRef::Literal(_))) {
                    self.edge_triples(subject, None, object, &mut triples)?;
                }
                self.node_triples(subject, object, &mut triples)?;
                Ok(triples)
            }
        }
    }

    fn type_triples(
        &self,
        subject: Option<NamedOrBlankNodeRef<'_>>,
        object: Option<TermRef<'_>>,
    ) -> Result<Vec<Triple>, StorageError> {
        let class = match object {
            Some(TermRef::NamedNode(class)) => Some(class),
            Some(_) => return Ok(Vec::new()),
            None => None,
        };
        let mut triples = Vec::new();
        match (subject, class) {
            (Some(subject), _) => {
                let uri = codec::resource_uri(subject);
                let rows = self.query(
                    &format!("MATCH (n:`{RESOURCE_LABEL}` {{uri: $s}}) RETURN labels(n)"),
                    &[("s".into(), CypherValue::String(uri))],
                )?;
                for row in rows {
                    for label in decode_label_list(value_at(&row, 0)?)? {
                        if class.is_none_or(|class| class.as_str() == label) {
                            triples.push(Triple::new(
                                subject.into_owned(),
                                rdf::TYPE.into_owned(),
                                NamedNode::new(label)
                                    .map_err(|e| CorruptionError::new(Box::new(e)))?,
                            ));
                        }
                    }
                }
            }
            (None, Some(class)) => {
                let rows = self.query(
                    &format!(
                        "MATCH (n:`{}`:`{RESOURCE_LABEL}`) RETURN n.uri",
                        escape_name(class.as_str())
                    ),
                    &[],
                )?;
                for row in rows {
                    triples.push(Triple::new(
                        decode_resource(string_at(&row, 0)?)?,
                        rdf::TYPE.into_owned(),
                        class.into_owned(),
                    ));
                }
            }
            (None, None) => {
                let rows = self.query(
                    &format!("MATCH (n:`{RESOURCE_LABEL}`) RETURN n.uri, labels(n)"),
                    &[],
                )?;
                for row in rows {
                    let node = decode_resource(string_at(&row, 0)?)?;
                    for label in decode_label_list(value_at(&row, 1)?)? {
                        triples.push(Triple::new(
                            node.clone(),
                            rdf::TYPE.into_owned(),
                            NamedNode::new(label)
                                .map_err(|e| CorruptionError::new(Box::new(e)))?,
                        ));
                    }
                }
            }
        }
        Ok(triples)
    }

    fn edge_triples(
        &self,
        subject: Option<NamedOrBlankNodeRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        triples: &mut Vec<Triple>,
    ) -> Result<(), StorageError> {
        let object_uri = match object {
            Some(object) => match codec::object_uri(object) {
                Some(uri) => Some(uri),
                None => return Ok(()),
            },
            None => None,
        };
        let mut params = Vec::new();
        let subject_part = if let Some(subject) = subject {
            params.push((
                "s".to_owned(),
                CypherValue::String(codec::resource_uri(subject)),
            ));
            format!("(s:`{RESOURCE_LABEL}` {{uri: $s}})")
        } else {
            format!("(s:`{RESOURCE_LABEL}`)")
        };
        let edge_part = match predicate {
            Some(predicate) => format!("-[r:`{}`]->", escape_name(predicate.as_str())),
            None => "-[r]->".to_owned(),
        };
        let object_part = if let Some(uri) = object_uri {
            params.push(("o".to_owned(), CypherValue::String(uri)));
            format!("(o:`{RESOURCE_LABEL}` {{uri: $o}})")
        } else {
            format!("(o:`{RESOURCE_LABEL}`)")
        };
        let rows = self.query(
            &format!("MATCH {subject_part}{edge_part}{object_part} RETURN s.uri, type(r), o.uri"),
            &params,
        )?;
        for row in rows {
            triples.push(Triple::new(
                decode_resource(string_at(&row, 0)?)?,
                NamedNode::new(string_at(&row, 1)?)
                    .map_err(|e| CorruptionError::new(Box::new(e)))?,
                codec::decode_resource_term(string_at(&row, 2)?)?,
            ));
        }
        Ok(())
    }

    fn property_triples(
        &self,
        subject: Option<NamedOrBlankNodeRef<'_>>,
        predicate: NamedNodeRef<'_>,
        object: Option<LiteralRef<'_>>,
        triples: &mut Vec<Triple>,
    ) -> Result<(), StorageError> {
        let p = escape_name(predicate.as_str());
        let expected = object.map(encode_literal);
        let rows = if let Some(subject) = subject {
            self.query(
                &format!(
                    "MATCH (n:`{RESOURCE_LABEL}` {{uri: $s}}) WHERE n.`{p}` IS NOT NULL \
                     RETURN n.uri, n.`{p}`, n.`{p}{DATATYPE_SUFFIX}`"
                ),
                &[(
                    "s".to_owned(),
                    CypherValue::String(codec::resource_uri(subject)),
                )],
            )?
        } else {
            self.query(
                &format!(
                    "MATCH (n:`{RESOURCE_LABEL}`) WHERE n.`{p}` IS NOT NULL \
                     RETURN n.uri, n.`{p}`, n.`{p}{DATATYPE_SUFFIX}`"
                ),
                &[],
            )?
        };
        for row in rows {
            let value = value_at(&row, 1)?;
            let datatype = match value_at(&row, 2)? {
                CypherValue::Null => None,
                CypherValue::String(iri) => Some(iri.as_str()),
                value => {
                    return Err(CorruptionError::msg(format!(
                        "expected a datatype IRI, got {value:?}"
                    ))
                    .into());
                }
            };
            if let Some((expected_value, expected_datatype)) = &expected {
                if expected_value != value || expected_datatype.as_deref() != datatype {
                    continue;
                }
            }
            triples.push(Triple::new(
                decode_resource(string_at(&row, 0)?)?,
                predicate.into_owned(),
                decode_literal(value, datatype)?,
            ));
        }
        Ok(())
    }

    fn node_triples(
        &self,
        subject: Option<NamedOrBlankNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        triples: &mut Vec<Triple>,
    ) -> Result<(), StorageError> {
        let rows = if let Some(subject) = subject {
            self.query(
                &format!("MATCH (n:`{RESOURCE_LABEL}` {{uri: $s}}) RETURN n"),
                &[(
                    "s".to_owned(),
                    CypherValue::String(codec::resource_uri(subject)),
                )],
            )?
        } else {
            self.query(&format!("MATCH (n:`{RESOURCE_LABEL}`) RETURN n"), &[])?
        };
        for row in rows {
            let CypherValue::Node(node) = value_at(&row, 0)? else {
                return Err(StorageError::protocol("expected a node projection"));
            };
            let Some(uri) = node
                .property(URI_PROPERTY)
                .and_then(CypherValue::as_str)
            else {
                return Err(CorruptionError::msg("resource node without uri property").into());
            };
            let node_subject = decode_resource(uri)?;
            for (predicate, literal) in node_property_pairs(node)? {
                if object.is_none_or(|object| object == TermRef::from(literal.as_ref())) {
                    triples.push(Triple::new(node_subject.clone(), predicate, literal));
                }
            }
            for class in node_type_labels(node)? {
                if object.is_none_or(|object| object == TermRef::from(class.as_ref())) {
                    triples.push(Triple::new(
                        node_subject.clone(),
                        rdf::TYPE.into_owned(),
                        class,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Number of stored triples. Metadata siblings, the `uri`
    /// property and the reserved `Resource` label are not counted.
    pub(crate) fn len(&self) -> Result<usize, StorageError> {
        let rows = self.query(
            &format!(
                "MATCH (:`{RESOURCE_LABEL}`)-[r]->(:`{RESOURCE_LABEL}`) \
                 RETURN count(r) AS relationships"
            ),
            &[],
        )?;
        let relationships = rows
            .first()
            .map_or(Ok(0), |row| integer_at(row, 0))?;
        let rows = self.query(
            &format!(
                "MATCH (n:`{RESOURCE_LABEL}`) RETURN \
                 sum(size([k IN keys(n) WHERE k <> '{URI_PROPERTY}' AND \
                 NOT (k ENDS WITH '{DATATYPE_SUFFIX}')])) AS properties, \
                 sum(size(labels(n)) - 1) AS labels"
            ),
            &[],
        )?;
        let (properties, labels) = rows
            .first()
            .map_or(Ok::<(i64, i64), StorageError>((0, 0)), |row| {
                Ok((integer_at(row, 0)?, integer_at(row, 1)?))
            })?;
        usize::try_from(relationships + properties + labels)
            .map_err(|_| StorageError::protocol("negative triple count"))
    }

    /// Removes every adapter-managed edge and node.
    pub(crate) fn clear(&self) -> Result<(), StorageError> {
        self.multi(&[
            (
                format!("MATCH (:`{RESOURCE_LABEL}`)-[r]->() DELETE r"),
                Vec::new(),
            ),
            (format!("MATCH (n:`{RESOURCE_LABEL}`) DELETE n"), Vec::new()),
        ])
    }
}

fn value_at<'a>(row: &'a Row, index: usize) -> Result<&'a CypherValue, StorageError> {
    row.values()
        .get(index)
        .ok_or_else(|| StorageError::protocol(format!("missing result column {index}")))
}

fn string_at<'a>(row: &'a Row, index: usize) -> Result<&'a str, StorageError> {
    value_at(row, index)?
        .as_str()
        .ok_or_else(|| StorageError::protocol(format!("result column {index} is not a string")))
}

fn integer_at(row: &Row, index: usize) -> Result<i64, StorageError> {
    match value_at(row, index)? {
        CypherValue::Integer(i) => Ok(*i),
        CypherValue::Null => Ok(0),
        value => Err(StorageError::protocol(format!(
            "result column {index} is not an integer: {value:?}"
        ))),
    }
}

fn decode_label_list(value: &CypherValue) -> Result<Vec<String>, StorageError> {
    let CypherValue::List(items) = value else {
        return Err(StorageError::protocol("expected a label list"));
    };
    items
        .iter()
        .filter_map(|item| match item {
            CypherValue::String(label) if label != RESOURCE_LABEL => Some(Ok(label.clone())),
            CypherValue::String(_) => None,
            value => Some(Err(StorageError::protocol(format!(
                "expected a label, got {value:?}"
            )))),
        })
        .collect()
}
