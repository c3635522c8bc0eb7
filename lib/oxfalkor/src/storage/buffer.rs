//! Write buffering for the scoped transaction surface.
//!
//! Buffered operations are grouped by statement shape (property sets,
//! label additions, edge upserts and their removal mirrors) and each
//! group is flushed as parameterized `UNWIND` statements of at most
//! [`MAX_BATCH_SIZE`] rows. Removals flush before additions so that
//! an insert of a triple deleted in the same transaction wins; within
//! the additions, properties and labels materialize the nodes before
//! any edge statement runs, so edge upserts always find their
//! endpoints.

use crate::storage::codec::{DATATYPE_SUFFIX, DeleteOp, RESOURCE_LABEL, WriteOp, escape_name};
use crate::storage::driver::CypherValue;
use rustc_hash::FxHashMap;
use std::hash::Hash;

/// Maximum number of operations sent in one `UNWIND` statement.
pub(crate) const MAX_BATCH_SIZE: usize = 1_000;

/// In-memory buffer of the writes of one transaction.
#[derive(Default)]
pub(crate) struct TransactionBuffer {
    property_sets: Grouped<PropertyKey, PropertyRow>,
    label_adds: Grouped<String, LabelRow>,
    edge_merges: Grouped<String, EdgeRow>,
    property_removes: Grouped<PropertyKey, PropertyRow>,
    label_removes: Grouped<String, LabelRow>,
    edge_deletes: Grouped<String, EdgeRow>,
    len: usize,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PropertyKey {
    predicate: String,
    with_datatype: bool,
}

struct PropertyRow {
    uri: String,
    value: CypherValue,
    datatype: Option<String>,
}

struct LabelRow {
    uri: String,
}

struct EdgeRow {
    subject: String,
    object: String,
}

impl TransactionBuffer {
    pub(crate) fn insert(&mut self, op: WriteOp) {
        self.len += 1;
        match op {
            WriteOp::SetProperty {
                subject,
                predicate,
                value,
                datatype,
            } => self.property_sets.push(
                PropertyKey {
                    predicate,
                    with_datatype: datatype.is_some(),
                },
                PropertyRow {
                    uri: subject,
                    value,
                    datatype,
                },
            ),
            WriteOp::AddLabel { subject, label } => {
                self.label_adds.push(label, LabelRow { uri: subject });
            }
            WriteOp::MergeEdge {
                subject,
                predicate,
                object,
            } => self.edge_merges.push(predicate, EdgeRow { subject, object }),
        }
    }

    pub(crate) fn remove(&mut self, op: DeleteOp) {
        self.len += 1;
        match op {
            DeleteOp::RemoveProperty {
                subject,
                predicate,
                value,
                datatype,
            } => self.property_removes.push(
                PropertyKey {
                    predicate,
                    with_datatype: datatype.is_some(),
                },
                PropertyRow {
                    uri: subject,
                    value,
                    datatype,
                },
            ),
            DeleteOp::RemoveLabel { subject, label } => {
                self.label_removes.push(label, LabelRow { uri: subject });
            }
            DeleteOp::DeleteEdge {
                subject,
                predicate,
                object,
            } => self
                .edge_deletes
                .push(predicate, EdgeRow { subject, object }),
        }
    }

    /// Number of buffered operations.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Renders the buffered operations as flush batches, in the order
    /// they must be dispatched.
    pub(crate) fn statements(&self) -> Vec<(String, Vec<(String, CypherValue)>)> {
        let mut statements = Vec::new();
        for (predicate, rows) in self.edge_deletes.iter() {
            push_batches(&mut statements, &edge_delete_statement(predicate), rows, edge_row);
        }
        for (key, rows) in self.property_removes.iter() {
            push_batches(
                &mut statements,
                &property_remove_statement(key),
                rows,
                property_row,
            );
        }
        for (label, rows) in self.label_removes.iter() {
            push_batches(&mut statements, &label_remove_statement(label), rows, label_row);
        }
        for (key, rows) in self.property_sets.iter() {
            push_batches(&mut statements, &property_set_statement(key), rows, property_row);
        }
        for (label, rows) in self.label_adds.iter() {
            push_batches(&mut statements, &label_add_statement(label), rows, label_row);
        }
        for (predicate, rows) in self.edge_merges.iter() {
            push_batches(&mut statements, &edge_merge_statement(predicate), rows, edge_row);
        }
        statements
    }
}

fn push_batches<R>(
    statements: &mut Vec<(String, Vec<(String, CypherValue)>)>,
    cypher: &str,
    rows: &[R],
    render: impl Fn(&R) -> CypherValue,
) {
    for chunk in rows.chunks(MAX_BATCH_SIZE) {
        let rows = CypherValue::List(chunk.iter().map(&render).collect());
        statements.push((cypher.to_owned(), vec![("rows".to_owned(), rows)]));
    }
}

fn property_row(row: &PropertyRow) -> CypherValue {
    let mut entries = vec![
        ("uri".to_owned(), CypherValue::String(row.uri.clone())),
        ("value".to_owned(), row.value.clone()),
    ];
    if let Some(datatype) = &row.datatype {
        entries.push(("datatype".to_owned(), CypherValue::String(datatype.clone())));
    }
    CypherValue::Map(entries)
}

fn label_row(row: &LabelRow) -> CypherValue {
    CypherValue::Map(vec![(
        "uri".to_owned(),
        CypherValue::String(row.uri.clone()),
    )])
}

fn edge_row(row: &EdgeRow) -> CypherValue {
    CypherValue::Map(vec![
        ("subject".to_owned(), CypherValue::String(row.subject.clone())),
        ("object".to_owned(), CypherValue::String(row.object.clone())),
    ])
}

fn property_set_statement(key: &PropertyKey) -> String {
    let p = escape_name(&key.predicate);
    if key.with_datatype {
        format!(
            "UNWIND $rows AS row MERGE (n:`{RESOURCE_LABEL}` {{uri: row.uri}}) \
             SET n.`{p}` = row.value, n.`{p}{DATATYPE_SUFFIX}` = row.datatype"
        )
    } else {
        format!(
            "UNWIND $rows AS row MERGE (n:`{RESOURCE_LABEL}` {{uri: row.uri}}) \
             SET n.`{p}` = row.value"
        )
    }
}

fn property_remove_statement(key: &PropertyKey) -> String {
    let p = escape_name(&key.predicate);
    if key.with_datatype {
        format!(
            "UNWIND $rows AS row MATCH (n:`{RESOURCE_LABEL}` {{uri: row.uri}}) \
             WHERE n.`{p}` = row.value AND n.`{p}{DATATYPE_SUFFIX}` = row.datatype \
             SET n.`{p}` = null, n.`{p}{DATATYPE_SUFFIX}` = null"
        )
    } else {
        format!(
            "UNWIND $rows AS row MATCH (n:`{RESOURCE_LABEL}` {{uri: row.uri}}) \
             WHERE n.`{p}` = row.value AND n.`{p}{DATATYPE_SUFFIX}` IS NULL \
             SET n.`{p}` = null"
        )
    }
}

fn label_add_statement(label: &str) -> String {
    let label = escape_name(label);
    format!(
        "UNWIND $rows AS row MERGE (n:`{RESOURCE_LABEL}` {{uri: row.uri}}) SET n:`{label}`"
    )
}

fn label_remove_statement(label: &str) -> String {
    let label = escape_name(label);
    format!(
        "UNWIND $rows AS row MATCH (n:`{label}` {{uri: row.uri}}) REMOVE n:`{label}`"
    )
}

fn edge_merge_statement(predicate: &str) -> String {
    let p = escape_name(predicate);
    format!(
        "UNWIND $rows AS row MERGE (a:`{RESOURCE_LABEL}` {{uri: row.subject}}) \
         MERGE (b:`{RESOURCE_LABEL}` {{uri: row.object}}) MERGE (a)-[:`{p}`]->(b)"
    )
}

fn edge_delete_statement(predicate: &str) -> String {
    let p = escape_name(predicate);
    format!(
        "UNWIND $rows AS row MATCH (a:`{RESOURCE_LABEL}` {{uri: row.subject}})\
         -[r:`{p}`]->(b:`{RESOURCE_LABEL}` {{uri: row.object}}) DELETE r"
    )
}

/// A map preserving first-insertion order of its keys.
struct Grouped<K, R> {
    order: Vec<K>,
    groups: FxHashMap<K, Vec<R>>,
}

impl<K: Clone + Eq + Hash, R> Grouped<K, R> {
    fn push(&mut self, key: K, row: R) {
        let rows = self.groups.entry(key.clone()).or_insert_with(|| {
            self.order.push(key);
            Vec::new()
        });
        rows.push(row);
    }

    fn iter(&self) -> impl Iterator<Item = (&K, &[R])> {
        self.order
            .iter()
            .filter_map(|key| Some((key, self.groups.get(key)?.as_slice())))
    }
}

impl<K, R> Default for Grouped<K, R> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            groups: FxHashMap::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_age(uri: &str, age: i64) -> WriteOp {
        WriteOp::SetProperty {
            subject: uri.into(),
            predicate: "http://example.com/age".into(),
            value: CypherValue::Integer(age),
            datatype: None,
        }
    }

    #[test]
    fn operations_group_by_shape_and_keep_insertion_order() {
        let mut buffer = TransactionBuffer::default();
        buffer.insert(WriteOp::MergeEdge {
            subject: "http://example.com/a".into(),
            predicate: "http://example.com/knows".into(),
            object: "http://example.com/b".into(),
        });
        buffer.insert(set_age("http://example.com/a", 1));
        buffer.insert(WriteOp::AddLabel {
            subject: "http://example.com/a".into(),
            label: "http://example.com/Person".into(),
        });
        buffer.insert(set_age("http://example.com/b", 2));
        assert_eq!(buffer.len(), 4);

        let statements = buffer.statements();
        // Properties first, then labels, then edges.
        assert_eq!(statements.len(), 3);
        assert!(statements[0].0.contains("SET n.`http://example.com/age` = row.value"));
        assert!(statements[1].0.ends_with("SET n:`http://example.com/Person`"));
        assert!(statements[2].0.contains("MERGE (a)-[:`http://example.com/knows`]->(b)"));

        let CypherValue::List(rows) = &statements[0].1[0].1 else {
            panic!("expected a row list");
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn removals_flush_before_additions() {
        let mut buffer = TransactionBuffer::default();
        buffer.insert(set_age("http://example.com/a", 1));
        buffer.remove(DeleteOp::RemoveProperty {
            subject: "http://example.com/a".into(),
            predicate: "http://example.com/age".into(),
            value: CypherValue::Integer(1),
            datatype: None,
        });
        let statements = buffer.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].0.contains("SET n.`http://example.com/age` = null"));
        assert!(statements[1].0.contains("SET n.`http://example.com/age` = row.value"));
    }

    #[test]
    fn large_groups_are_chunked() {
        let mut buffer = TransactionBuffer::default();
        for i in 0..(MAX_BATCH_SIZE + 1) {
            buffer.insert(set_age(&format!("http://example.com/{i}"), 0));
        }
        let statements = buffer.statements();
        assert_eq!(statements.len(), 2);
        let CypherValue::List(first) = &statements[0].1[0].1 else {
            panic!("expected a row list");
        };
        let CypherValue::List(second) = &statements[1].1[0].1 else {
            panic!("expected a row list");
        };
        assert_eq!(first.len(), MAX_BATCH_SIZE);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn datatype_siblings_change_the_statement_shape() {
        let mut buffer = TransactionBuffer::default();
        buffer.insert(WriteOp::SetProperty {
            subject: "http://example.com/a".into(),
            predicate: "http://example.com/geom".into(),
            value: CypherValue::String("POINT(2.35 48.85)".into()),
            datatype: Some("http://www.opengis.net/ont/geosparql#wktLiteral".into()),
        });
        buffer.insert(WriteOp::SetProperty {
            subject: "http://example.com/a".into(),
            predicate: "http://example.com/geom".into(),
            value: CypherValue::String("POINT(0 0)".into()),
            datatype: None,
        });
        let statements = buffer.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].0.contains("__datatype` = row.datatype"));
        assert!(!statements[1].0.contains("row.datatype"));
    }
}
