//! API to access an RDF graph stored in a [FalkorDB](https://www.falkordb.com/) property graph.
//!
//! The entry point of the module is the [`Store`] struct.
//!
//! Usage example:
//! ```no_run
//! use oxfalkor::model::*;
//! use oxfalkor::sparql::QueryResults;
//! use oxfalkor::store::{Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::new())?;
//!
//! // insertion
//! let ex = NamedNodeRef::new("http://example.com")?;
//! store.insert(TripleRef::new(ex, ex, ex))?;
//!
//! // triple pattern read
//! let results = store.triples_for_pattern(Some(ex.into()), None, None)?;
//! assert_eq!(results.len(), 1);
//!
//! // SPARQL query
//! if let QueryResults::Solutions(mut solutions) = store.query("SELECT ?s WHERE { ?s ?p ?o }")? {
//!     assert_eq!(
//!         solutions.next().unwrap()?.get("s"),
//!         Some(&ex.into_owned().into())
//!     );
//! }
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

use crate::metrics::StoreMetrics;
use crate::model::{NamedNodeRef, NamedOrBlankNodeRef, TermRef, Triple, TripleRef, Variable};
use crate::sparql::{EvaluationError, QueryOptions, QueryResults, QuerySolutionIter};
use crate::sparql::{escape, eval};
use crate::storage::buffer::TransactionBuffer;
use crate::storage::codec;
use crate::storage::driver::CypherDriver;
use crate::storage::falkordb::FalkorDriver;
pub use crate::storage::{CorruptionError, StorageError};
use crate::storage::Storage;
use spargebra::SparqlParser;
use std::sync::Arc;

/// How reasoning is layered on top of the store.
///
/// Forward chaining materializes inferred triples into the graph
/// before queries run, so the adapter sees them as plain data. A
/// backward-chaining wrapper computes inferences at query time
/// outside the adapter; pushdown would miss them, so every query is
/// evaluated through the host engine instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferenceMode {
    /// No reasoner in the stack.
    #[default]
    None,
    /// Inferred triples are materialized into the graph up front.
    ForwardChained,
    /// A backward-chaining wrapper sits around the store; pushdown is
    /// disabled.
    BackwardChained,
}

/// Where and how to connect.
///
/// The default configuration targets `localhost:6379` and the graph
/// named `rdf`. An explicit driver instance bypasses host and port
/// for deployments that need authentication, TLS or custom pooling.
#[derive(Clone)]
pub struct StoreConfig {
    host: String,
    port: u16,
    graph_name: String,
    tracing: bool,
    inference: InferenceMode,
    driver: Option<Arc<dyn CypherDriver>>,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The named graph all statements are scoped to.
    #[inline]
    #[must_use]
    pub fn with_graph_name(mut self, graph_name: impl Into<String>) -> Self {
        self.graph_name = graph_name.into();
        self
    }

    /// Turns the observability layer on or off.
    #[inline]
    #[must_use]
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_inference(mut self, inference: InferenceMode) -> Self {
        self.inference = inference;
        self
    }

    /// Connects through the given driver instead of opening plain TCP
    /// connections to `host:port`.
    #[inline]
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn CypherDriver>) -> Self {
        self.driver = Some(driver);
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            graph_name: "rdf".into(),
            tracing: false,
            inference: InferenceMode::None,
            driver: None,
        }
    }
}

/// An RDF graph backed by a FalkorDB property graph.
///
/// Every resource is one node labelled `Resource`; `rdf:type`
/// statements are node labels, resource objects are edges and
/// literal objects are node properties. Supported SPARQL shapes are
/// compiled into single Cypher statements; everything else is
/// evaluated by the host engine through the same store, so results
/// never depend on which path ran.
///
/// The store is cheap to clone and safe to share across threads; all
/// clones use one connection pool.
#[derive(Clone)]
pub struct Store {
    storage: Arc<Storage>,
    metrics: Arc<StoreMetrics>,
    tracing: bool,
    inference: InferenceMode,
}

impl Store {
    /// Connects to the server and creates the `Resource.uri` index if
    /// it is missing.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let driver = config
            .driver
            .unwrap_or_else(|| Arc::new(FalkorDriver::new(config.host, config.port)));
        Ok(Self {
            storage: Arc::new(Storage::new(driver, config.graph_name)?),
            metrics: Arc::new(StoreMetrics::new()),
            tracing: config.tracing,
            inference: config.inference,
        })
    }

    /// Executes a [SPARQL 1.1 query](https://www.w3.org/TR/sparql11-query/).
    ///
    /// Usage example:
    /// ```no_run
    /// use oxfalkor::model::*;
    /// use oxfalkor::sparql::QueryResults;
    /// use oxfalkor::store::{Store, StoreConfig};
    ///
    /// let store = Store::open(StoreConfig::new())?;
    /// let ex = NamedNodeRef::new("http://example.com")?;
    /// store.insert(TripleRef::new(ex, ex, ex))?;
    ///
    /// if let QueryResults::Solutions(mut solutions) = store.query("SELECT ?s WHERE { ?s ?p ?o }")? {
    ///     assert_eq!(
    ///         solutions.next().unwrap()?.get("s"),
    ///         Some(&ex.into_owned().into())
    ///     );
    /// }
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// ```
    pub fn query(&self, query: &str) -> Result<QueryResults, EvaluationError> {
        self.query_opt(query, QueryOptions::default())
    }

    /// Executes a [SPARQL 1.1 query](https://www.w3.org/TR/sparql11-query/) with some options.
    pub fn query_opt(
        &self,
        query: &str,
        options: QueryOptions,
    ) -> Result<QueryResults, EvaluationError> {
        let query = SparqlParser::new().parse_query(query)?;
        self.query_parsed(&query, options)
    }

    /// Executes an already parsed query.
    pub fn query_parsed(
        &self,
        query: &spargebra::Query,
        options: QueryOptions,
    ) -> Result<QueryResults, EvaluationError> {
        let pushdown = !options.without_pushdown && self.inference != InferenceMode::BackwardChained;
        eval::evaluate_query(
            &self.storage,
            &self.metrics,
            query,
            &options,
            pushdown,
            self.tracing,
        )
    }

    /// Executes a raw Cypher fragment and binds its result columns to
    /// the given variables in declaration order.
    ///
    /// Columns holding node proxies, `_:` identifiers or IRIs decode
    /// as resources, everything else as literals.
    pub fn cypher_query(
        &self,
        fragment: &str,
        variables: &[Variable],
    ) -> Result<QuerySolutionIter, EvaluationError> {
        escape::evaluate_cypher(&self.storage, fragment, variables)
    }

    /// Adds a triple to the graph. Language tags are not preserved by
    /// the encoding: only the lexical form of a tagged literal is
    /// stored.
    pub fn insert(&self, triple: TripleRef<'_>) -> Result<(), StorageError> {
        self.transaction(|txn| txn.insert(triple))
    }

    /// Removes a triple from the graph. The subject node itself is
    /// kept, even when nothing references it anymore, so resource
    /// identity survives re-insertions.
    pub fn remove(&self, triple: TripleRef<'_>) -> Result<(), StorageError> {
        self.transaction(|txn| txn.remove(triple))
    }

    /// Adds a set of triples in one buffered commit.
    pub fn extend<'a>(
        &self,
        triples: impl IntoIterator<Item = TripleRef<'a>>,
    ) -> Result<(), StorageError> {
        self.transaction(move |txn| {
            for triple in triples {
                txn.insert(triple)?;
            }
            Ok(())
        })
    }

    /// Runs a write transaction: every buffered operation is flushed
    /// on success, nothing is sent on error.
    ///
    /// The buffer belongs to the calling thread. Batches of one
    /// commit are not atomic on the server side: a driver failure
    /// mid-commit surfaces as [`StorageError::PartialCommit`] and
    /// leaves the already flushed batches applied.
    ///
    /// ```no_run
    /// use oxfalkor::model::*;
    /// use oxfalkor::store::{Store, StoreConfig, StorageError};
    ///
    /// let store = Store::open(StoreConfig::new())?;
    /// let ex = NamedNodeRef::new("http://example.com")?;
    /// store.transaction(|txn| {
    ///     txn.insert(TripleRef::new(ex, ex, ex))?;
    ///     Result::<_, StorageError>::Ok(())
    /// })?;
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// ```
    pub fn transaction<T, E: From<StorageError>>(
        &self,
        f: impl FnOnce(&mut Transaction) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut transaction = Transaction {
            buffer: TransactionBuffer::default(),
            inserted: 0,
            removed: 0,
        };
        let result = f(&mut transaction)?;
        let batches = self.storage.commit(&transaction.buffer).map_err(E::from)?;
        self.metrics.record_inserts(transaction.inserted);
        self.metrics.record_deletes(transaction.removed);
        self.metrics.record_flush_batches(batches as u64);
        Ok(result)
    }

    /// Fetches the triples matching the given pattern.
    pub fn triples_for_pattern(
        &self,
        subject: Option<NamedOrBlankNodeRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
    ) -> Result<Vec<Triple>, StorageError> {
        self.storage.triples_for_pattern(subject, predicate, object)
    }

    /// Checks if the graph contains the given triple.
    pub fn contains(&self, triple: TripleRef<'_>) -> Result<bool, StorageError> {
        Ok(!self
            .storage
            .triples_for_pattern(
                Some(triple.subject),
                Some(triple.predicate),
                Some(triple.object),
            )?
            .is_empty())
    }

    /// The number of triples in the graph. Metadata properties are
    /// not counted.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.storage.len()
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Removes every adapter-managed node and edge from the graph.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.storage.clear()
    }

    /// The observability counters of this store.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// The named graph this store addresses.
    pub fn graph_name(&self) -> &str {
        self.storage.graph_name()
    }
}

/// A buffered write transaction. See [`Store::transaction`].
///
/// The buffer is confined to the thread that started the
/// transaction; using it from several threads is a caller error and
/// is prevented by the `&mut` receiver.
pub struct Transaction {
    buffer: TransactionBuffer,
    inserted: u64,
    removed: u64,
}

impl Transaction {
    /// Buffers the insertion of a triple.
    pub fn insert(&mut self, triple: TripleRef<'_>) -> Result<(), StorageError> {
        self.buffer.insert(codec::encode_add(triple)?);
        self.inserted += 1;
        Ok(())
    }

    /// Buffers the removal of a triple. Nodes are never deleted.
    pub fn remove(&mut self, triple: TripleRef<'_>) -> Result<(), StorageError> {
        self.buffer.remove(codec::encode_delete(triple)?);
        self.removed += 1;
        Ok(())
    }

    /// Number of operations buffered so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
