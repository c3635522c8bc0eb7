//! An in-memory [`CypherDriver`] double.
//!
//! The driver interprets the fixed statement families the adapter
//! generates (bulk write batches, the triple pattern read path, index
//! creation, size and clear) against a small property graph kept in
//! memory, so the integration tests can exercise the public store
//! API without a server. Arbitrary compiled pushdown statements are
//! answered from canned responses enqueued by the test.

use oxfalkor::storage::StorageError;
use oxfalkor::storage::driver::{
    CypherConnection, CypherDriver, CypherNode, CypherValue, Row,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default)]
struct GraphData {
    nodes: BTreeMap<String, NodeData>,
    edges: Vec<(String, String, String)>,
}

#[derive(Default)]
struct NodeData {
    labels: BTreeSet<String>,
    properties: BTreeMap<String, CypherValue>,
}

struct CannedResponse {
    needle: String,
    columns: Vec<String>,
    rows: Vec<Vec<CypherValue>>,
}

#[derive(Default)]
struct DriverState {
    graph: GraphData,
    canned: Vec<CannedResponse>,
    fail_on: Option<String>,
    statements: Vec<String>,
}

/// The in-memory driver shared by every connection it hands out.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<DriverState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a canned result set for a pushdown statement
    /// containing the given needle.
    pub fn respond(&self, needle: &str, columns: &[&str], rows: Vec<Vec<CypherValue>>) {
        self.lock().canned.push(CannedResponse {
            needle: needle.into(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
        });
    }

    /// Makes every statement containing the needle fail.
    pub fn fail_on(&self, needle: &str) {
        self.lock().fail_on = Some(needle.into());
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Number of nodes currently in the graph.
    pub fn node_count(&self) -> usize {
        self.lock().graph.nodes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CypherDriver for MemoryDriver {
    fn connect(&self) -> Result<Box<dyn CypherConnection>, StorageError> {
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<DriverState>>,
}

impl CypherConnection for MemoryConnection {
    fn execute(
        &mut self,
        _graph: &str,
        cypher: &str,
        params: &[(String, CypherValue)],
    ) -> Result<Vec<Row>, StorageError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.statements.push(cypher.to_owned());
        if let Some(needle) = &state.fail_on {
            if cypher.contains(needle.as_str()) {
                return Err(StorageError::protocol(format!(
                    "injected failure for {needle}"
                )));
            }
        }
        if let Some(position) = state
            .canned
            .iter()
            .position(|response| cypher.contains(response.needle.as_str()))
        {
            let response = state.canned.remove(position);
            let columns: Arc<[String]> = response.columns.into();
            return Ok(response
                .rows
                .into_iter()
                .map(|values| Row::new(Arc::clone(&columns), values))
                .collect());
        }
        dispatch(&mut state.graph, cypher, params)
    }
}

fn dispatch(
    graph: &mut GraphData,
    cypher: &str,
    params: &[(String, CypherValue)],
) -> Result<Vec<Row>, StorageError> {
    let (skeleton, names) = skeletonize(cypher);
    let skeleton = skeleton.as_str();

    if skeleton.starts_with("CREATE INDEX") {
        return Ok(Vec::new());
    }
    if skeleton.starts_with("UNWIND $rows AS row ") {
        for row in unwind_rows(params)? {
            apply_write(graph, skeleton, &names, &row)?;
        }
        return Ok(Vec::new());
    }
    match skeleton {
        "MATCH (n:`?` {uri: $s}) RETURN labels(n)" => {
            let uri = string_param(params, "s")?;
            Ok(graph
                .nodes
                .get(uri)
                .into_iter()
                .map(|node| row(&["labels(n)"], vec![labels_value(node)]))
                .collect())
        }
        "MATCH (n:`?`:`?`) RETURN n.uri" => {
            let class = &names[0];
            Ok(graph
                .nodes
                .iter()
                .filter(|(_, node)| node.labels.contains(class))
                .map(|(uri, _)| row(&["n.uri"], vec![CypherValue::String(uri.clone())]))
                .collect())
        }
        "MATCH (n:`?`) RETURN n.uri, labels(n)" => Ok(graph
            .nodes
            .iter()
            .map(|(uri, node)| {
                row(
                    &["n.uri", "labels(n)"],
                    vec![CypherValue::String(uri.clone()), labels_value(node)],
                )
            })
            .collect()),
        "MATCH (n:`?` {uri: $s}) RETURN n" => {
            let uri = string_param(params, "s")?;
            Ok(graph
                .nodes
                .get(uri)
                .into_iter()
                .map(|node| row(&["n"], vec![node_value(node)]))
                .collect())
        }
        "MATCH (n:`?`) RETURN n" => Ok(graph
            .nodes
            .iter()
            .map(|(_, node)| row(&["n"], vec![node_value(node)]))
            .collect()),
        "MATCH (:`?`)-[r]->() DELETE r" => {
            graph.edges.clear();
            Ok(Vec::new())
        }
        "MATCH (n:`?`) DELETE n" => {
            graph.nodes.clear();
            Ok(Vec::new())
        }
        "MATCH (:`?`)-[r]->(:`?`) RETURN count(r) AS relationships" => Ok(vec![row(
            &["relationships"],
            vec![CypherValue::Integer(graph.edges.len() as i64)],
        )]),
        _ => {
            if skeleton.starts_with("MATCH (n:`?`) RETURN sum(size([k IN keys(n)") {
                let mut properties = 0i64;
                let mut labels = 0i64;
                for node in graph.nodes.values() {
                    properties += node
                        .properties
                        .keys()
                        .filter(|k| k.as_str() != "uri" && !k.ends_with("__datatype"))
                        .count() as i64;
                    labels += node.labels.len() as i64 - 1;
                }
                return Ok(vec![row(
                    &["properties", "labels"],
                    vec![CypherValue::Integer(properties), CypherValue::Integer(labels)],
                )]);
            }
            if skeleton.ends_with("RETURN s.uri, type(r), o.uri") {
                return edge_scan(graph, &names, params);
            }
            if skeleton.ends_with("IS NOT NULL RETURN n.uri, n.`?`, n.`?`") {
                return property_scan(graph, &names, params);
            }
            Err(StorageError::protocol(format!(
                "the memory driver does not understand: {cypher}"
            )))
        }
    }
}

fn apply_write(
    graph: &mut GraphData,
    skeleton: &str,
    names: &[String],
    row: &[(String, CypherValue)],
) -> Result<(), StorageError> {
    match skeleton {
        "UNWIND $rows AS row MERGE (n:`?` {uri: row.uri}) SET n.`?` = row.value" => {
            let node = node_entry(graph, &field(row, "uri")?);
            node.properties
                .insert(names[1].clone(), field_value(row, "value")?);
            node.properties.remove(&format!("{}__datatype", names[1]));
        }
        "UNWIND $rows AS row MERGE (n:`?` {uri: row.uri}) SET n.`?` = row.value, n.`?` = row.datatype" => {
            let node = node_entry(graph, &field(row, "uri")?);
            node.properties
                .insert(names[1].clone(), field_value(row, "value")?);
            node.properties
                .insert(names[2].clone(), field_value(row, "datatype")?);
        }
        "UNWIND $rows AS row MERGE (n:`?` {uri: row.uri}) SET n:`?`" => {
            let node = node_entry(graph, &field(row, "uri")?);
            node.labels.insert(names[1].clone());
        }
        "UNWIND $rows AS row MERGE (a:`?` {uri: row.subject}) MERGE (b:`?` {uri: row.object}) MERGE (a)-[:`?`]->(b)" => {
            let subject = field(row, "subject")?;
            let object = field(row, "object")?;
            node_entry(graph, &subject);
            node_entry(graph, &object);
            let edge = (subject, names[2].clone(), object);
            if !graph.edges.contains(&edge) {
                graph.edges.push(edge);
            }
        }
        "UNWIND $rows AS row MATCH (a:`?` {uri: row.subject})-[r:`?`]->(b:`?` {uri: row.object}) DELETE r" => {
            let subject = field(row, "subject")?;
            let object = field(row, "object")?;
            graph
                .edges
                .retain(|(s, p, o)| !(s == &subject && p == &names[1] && o == &object));
        }
        "UNWIND $rows AS row MATCH (n:`?` {uri: row.uri}) WHERE n.`?` = row.value AND n.`?` IS NULL SET n.`?` = null" => {
            let uri = field(row, "uri")?;
            let value = field_value(row, "value")?;
            if let Some(node) = graph.nodes.get_mut(&uri) {
                let datatype_key = format!("{}__datatype", names[1]);
                if node.properties.get(&names[1]) == Some(&value)
                    && !node.properties.contains_key(&datatype_key)
                {
                    node.properties.remove(&names[1]);
                }
            }
        }
        "UNWIND $rows AS row MATCH (n:`?` {uri: row.uri}) WHERE n.`?` = row.value AND n.`?` = row.datatype SET n.`?` = null, n.`?` = null" => {
            let uri = field(row, "uri")?;
            let value = field_value(row, "value")?;
            let datatype = field_value(row, "datatype")?;
            if let Some(node) = graph.nodes.get_mut(&uri) {
                let datatype_key = format!("{}__datatype", names[1]);
                if node.properties.get(&names[1]) == Some(&value)
                    && node.properties.get(&datatype_key) == Some(&datatype)
                {
                    node.properties.remove(&names[1]);
                    node.properties.remove(&datatype_key);
                }
            }
        }
        "UNWIND $rows AS row MATCH (n:`?` {uri: row.uri}) REMOVE n:`?`" => {
            let uri = field(row, "uri")?;
            if let Some(node) = graph.nodes.get_mut(&uri) {
                node.labels.retain(|label| label != &names[1]);
            }
        }
        skeleton => {
            return Err(StorageError::protocol(format!(
                "the memory driver does not understand the write statement: {skeleton}"
            )));
        }
    }
    Ok(())
}

fn edge_scan(
    graph: &GraphData,
    names: &[String],
    params: &[(String, CypherValue)],
) -> Result<Vec<Row>, StorageError> {
    let subject = optional_string_param(params, "s");
    let object = optional_string_param(params, "o");
    let predicate = if names.len() == 3 { Some(&names[1]) } else { None };
    Ok(graph
        .edges
        .iter()
        .filter(|(s, p, o)| {
            subject.is_none_or(|filter| s.as_str() == filter)
                && predicate.is_none_or(|filter| p == filter)
                && object.is_none_or(|filter| o.as_str() == filter)
        })
        .map(|(s, p, o)| {
            row(
                &["s.uri", "type(r)", "o.uri"],
                vec![
                    CypherValue::String(s.clone()),
                    CypherValue::String(p.clone()),
                    CypherValue::String(o.clone()),
                ],
            )
        })
        .collect())
}

fn property_scan(
    graph: &GraphData,
    names: &[String],
    params: &[(String, CypherValue)],
) -> Result<Vec<Row>, StorageError> {
    let subject = optional_string_param(params, "s");
    let key = &names[1];
    let datatype_key = format!("{key}__datatype");
    Ok(graph
        .nodes
        .iter()
        .filter(|(uri, node)| {
            subject.is_none_or(|filter| uri.as_str() == filter)
                && node.properties.contains_key(key)
        })
        .map(|(uri, node)| {
            row(
                &["n.uri", "value", "datatype"],
                vec![
                    CypherValue::String(uri.clone()),
                    node.properties[key].clone(),
                    node.properties
                        .get(&datatype_key)
                        .cloned()
                        .unwrap_or(CypherValue::Null),
                ],
            )
        })
        .collect())
}

fn node_entry<'a>(graph: &'a mut GraphData, uri: &str) -> &'a mut NodeData {
    graph.nodes.entry(uri.to_owned()).or_insert_with(|| {
        let mut node = NodeData::default();
        node.labels.insert("Resource".to_owned());
        node.properties
            .insert("uri".to_owned(), CypherValue::String(uri.to_owned()));
        node
    })
}

fn labels_value(node: &NodeData) -> CypherValue {
    CypherValue::List(
        node.labels
            .iter()
            .map(|label| CypherValue::String(label.clone()))
            .collect(),
    )
}

fn node_value(node: &NodeData) -> CypherValue {
    CypherValue::Node(CypherNode {
        id: 0,
        labels: node.labels.iter().cloned().collect(),
        properties: node
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })
}

fn row(columns: &[&str], values: Vec<CypherValue>) -> Row {
    let columns: Arc<[String]> = columns
        .iter()
        .map(|c| (*c).to_owned())
        .collect::<Vec<_>>()
        .into();
    Row::new(columns, values)
}

/// Replaces every backtick-quoted name with `?` and collects the
/// names, so statements can be matched structurally.
fn skeletonize(cypher: &str) -> (String, Vec<String>) {
    let mut skeleton = String::with_capacity(cypher.len());
    let mut names = Vec::new();
    let mut rest = cypher;
    while let Some(start) = rest.find('`') {
        skeleton.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('`') else {
            skeleton.push('`');
            rest = after;
            continue;
        };
        names.push(after[..end].to_owned());
        skeleton.push_str("`?`");
        rest = &after[end + 1..];
    }
    skeleton.push_str(rest);
    (skeleton, names)
}

fn unwind_rows(
    params: &[(String, CypherValue)],
) -> Result<Vec<Vec<(String, CypherValue)>>, StorageError> {
    let Some(CypherValue::List(rows)) = lookup_param(params, "rows") else {
        return Err(StorageError::protocol("missing $rows parameter"));
    };
    rows.iter()
        .map(|row| match row {
            CypherValue::Map(entries) => Ok(entries.clone()),
            _ => Err(StorageError::protocol("malformed $rows entry")),
        })
        .collect()
}

fn lookup_param<'a>(
    params: &'a [(String, CypherValue)],
    name: &str,
) -> Option<&'a CypherValue> {
    params
        .iter()
        .find_map(|(key, value)| (key == name).then_some(value))
}

fn string_param<'a>(
    params: &'a [(String, CypherValue)],
    name: &str,
) -> Result<&'a str, StorageError> {
    optional_string_param(params, name)
        .ok_or_else(|| StorageError::protocol(format!("missing ${name} parameter")))
}

fn optional_string_param<'a>(
    params: &'a [(String, CypherValue)],
    name: &str,
) -> Option<&'a str> {
    match lookup_param(params, name) {
        Some(CypherValue::String(s)) => Some(s),
        _ => None,
    }
}

fn field(row: &[(String, CypherValue)], name: &str) -> Result<String, StorageError> {
    match field_value(row, name)? {
        CypherValue::String(s) => Ok(s),
        value => Err(StorageError::protocol(format!(
            "row field {name} is not a string: {value:?}"
        ))),
    }
}

fn field_value(row: &[(String, CypherValue)], name: &str) -> Result<CypherValue, StorageError> {
    row.iter()
        .find_map(|(key, value)| (key == name).then(|| value.clone()))
        .ok_or_else(|| StorageError::protocol(format!("missing row field {name}")))
}
