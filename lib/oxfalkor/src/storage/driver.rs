//! The interface the adapter expects from a Cypher driver.
//!
//! The [`FalkorDriver`](super::falkordb::FalkorDriver) shipped with
//! this crate speaks the plain RESP protocol over TCP. Deployments
//! with authentication, TLS or custom pooling needs can implement
//! [`CypherDriver`] themselves and inject the instance through
//! [`StoreConfig::with_driver`](crate::store::StoreConfig::with_driver).

use crate::storage::StorageError;
use std::fmt;
use std::sync::Arc;

/// A value returned by (or sent to) the Cypher endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CypherValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    /// A WGS-84 point as stored by the server.
    Point(Point),
    List(Vec<CypherValue>),
    Map(Vec<(String, CypherValue)>),
    /// A node proxy exposing labels and properties.
    Node(CypherNode),
    /// An edge proxy exposing its type and endpoint identifiers.
    Edge(CypherEdge),
}

impl CypherValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        if let Self::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }
}

impl From<&str> for CypherValue {
    #[inline]
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for CypherValue {
    #[inline]
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for CypherValue {
    #[inline]
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for CypherValue {
    #[inline]
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for CypherValue {
    #[inline]
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// A geographic point in the server's `{latitude, longitude}` representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

/// A node as materialized in a result row.
#[derive(Debug, Clone, PartialEq)]
pub struct CypherNode {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: Vec<(String, CypherValue)>,
}

impl CypherNode {
    #[inline]
    pub fn property(&self, key: &str) -> Option<&CypherValue> {
        self.properties
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }
}

/// An edge as materialized in a result row.
#[derive(Debug, Clone, PartialEq)]
pub struct CypherEdge {
    pub id: i64,
    pub edge_type: String,
    pub src: i64,
    pub dst: i64,
    pub properties: Vec<(String, CypherValue)>,
}

/// A single result row: an ordered column map.
#[derive(Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<CypherValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<CypherValue>) -> Self {
        Self { columns, values }
    }

    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[inline]
    pub fn values(&self) -> &[CypherValue] {
        &self.values
    }

    /// The value of the column with the given name, if any.
    pub fn get(&self, column: &str) -> Option<&CypherValue> {
        let i = self.columns.iter().position(|c| c == column)?;
        self.values.get(i)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.columns.iter().zip(&self.values))
            .finish()
    }
}

/// A single point-to-point connection to the Cypher endpoint.
///
/// Connections are not required to be thread-safe; the store facade
/// hands each one to a single caller at a time.
pub trait CypherConnection: Send {
    /// Executes one parameterized statement against the given graph
    /// and materializes the result rows.
    fn execute(
        &mut self,
        graph: &str,
        cypher: &str,
        params: &[(String, CypherValue)],
    ) -> Result<Vec<Row>, StorageError>;
}

/// A factory for [`CypherConnection`]s, shared by the whole store.
pub trait CypherDriver: Send + Sync {
    fn connect(&self) -> Result<Box<dyn CypherConnection>, StorageError>;
}
