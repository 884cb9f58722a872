//! Batch executor: heterogeneous metadata mutations applied atomically.
//!
//! A batch accumulates operations — raw update text, parameterized
//! statements, resource records, serialized RDF payloads, descriptor
//! payloads — and executes them in submission order as one all-or-
//! nothing array update against an [`UpdateSink`]. Adding a resource
//! decomposes it immediately: one property-clear statement per
//! overwrite-flagged property (breadth-first over the resource graph),
//! then the TriG serialization as an RDF operation.
//!
//! `execute` is the blocking form of `execute_async`: it spins up a
//! private single-thread runtime and pumps the async path to
//! completion, so cancellation behaves identically in both.

use crate::error::{BatchError, StoreError};
use crate::store::{self, MetaStore, UpdateOp};
use chrono::SecondsFormat;
use fossick_core::resource::{Namespaces, Resource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Typed parameter for a prepared statement.
#[derive(Clone, Debug)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Bool(bool),
    Double(f64),
    DateTime(chrono::DateTime<chrono::FixedOffset>),
    /// A boxed type with no wire representation; skipped with a trace.
    Unsupported(&'static str),
}

impl ParamValue {
    /// Wire rendering per the coercion table; `None` drops the binding.
    fn render(&self) -> Option<String> {
        match self {
            ParamValue::String(s) => Some(s.clone()),
            ParamValue::Int(i) => Some(i.to_string()),
            ParamValue::Bool(b) => Some(b.to_string()),
            ParamValue::Double(d) => Some(d.to_string()),
            ParamValue::DateTime(dt) => {
                Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            ParamValue::Unsupported(kind) => {
                trace!(kind, "skipping parameter with unsupported type");
                None
            }
        }
    }
}

/// Serialized RDF formats the store accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RdfFormat {
    Trig,
    Turtle,
}

/// One queued operation.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Sparql(String),
    Statement { sparql: String, params: Vec<(String, ParamValue)> },
    Rdf { format: RdfFormat, default_graph: Option<String>, data: Vec<u8> },
    /// Side-channel payload handed over as a descriptor; treated as
    /// update text on execution.
    Fd(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Transport seam for batch execution: local store or a forwarding
/// connection, both sharing the batch structure.
pub trait UpdateSink: Send + Sync {
    fn perform_update(&self, ops: Vec<UpdateOp>) -> Result<(), StoreError>;
}

impl UpdateSink for MetaStore {
    fn perform_update(&self, ops: Vec<UpdateOp>) -> Result<(), StoreError> {
        MetaStore::perform_update(self, ops)
    }
}

/// Records lowered operations instead of applying them. Useful for
/// dry runs and tests.
#[derive(Default)]
pub struct CollectingSink {
    pub collected: Mutex<Vec<UpdateOp>>,
}

impl UpdateSink for CollectingSink {
    fn perform_update(&self, ops: Vec<UpdateOp>) -> Result<(), StoreError> {
        self.collected.lock().unwrap().extend(ops);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation token shared between submitter and batch.
#[derive(Clone, Default)]
pub struct Cancellable {
    cancelled: Arc<AtomicBool>,
}

impl Cancellable {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

pub struct Batch {
    sink: Arc<dyn UpdateSink>,
    namespaces: Namespaces,
    ops: Vec<BatchOp>,
    /// Fail the whole batch on malformed payloads instead of skipping.
    strict: bool,
    executed: bool,
}

impl Batch {
    pub fn new(sink: Arc<dyn UpdateSink>) -> Self {
        Self::with_namespaces(sink, Namespaces::default())
    }

    pub fn with_namespaces(sink: Arc<dyn UpdateSink>, namespaces: Namespaces) -> Self {
        Self { sink, namespaces, ops: Vec::new(), strict: false, executed: false }
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn add_sparql(&mut self, sparql: &str) {
        self.ops.push(BatchOp::Sparql(sparql.to_string()));
    }

    pub fn add_statement(&mut self, sparql: &str, params: Vec<(String, ParamValue)>) {
        self.ops.push(BatchOp::Statement { sparql: sparql.to_string(), params });
    }

    pub fn add_rdf(&mut self, format: RdfFormat, default_graph: Option<&str>, data: Vec<u8>) {
        self.ops.push(BatchOp::Rdf {
            format,
            default_graph: default_graph.map(str::to_string),
            data,
        });
    }

    pub fn add_fd(&mut self, data: Vec<u8>) {
        self.ops.push(BatchOp::Fd(data));
    }

    /// Queue a resource: property-clear preludes for every overwrite-
    /// flagged property over the reachable (possibly cyclic) graph,
    /// then the TriG rendering of the resource itself.
    pub fn add_resource(&mut self, graph: Option<&str>, resource: &Resource) {
        let graph_expanded = graph.map(|g| self.namespaces.expand(g));

        for (identifier, property) in resource.overwrite_clears(&self.namespaces) {
            let sparql = match &graph_expanded {
                Some(g) => {
                    format!("DELETE WHERE {{ GRAPH <{g}> {{ <~s> <{property}> ?o }} }}")
                }
                None => format!("DELETE WHERE {{ <~s> <{property}> ?o }}"),
            };
            self.add_statement(&sparql, vec![("s".to_string(), ParamValue::String(identifier))]);
        }

        let trig = resource.to_trig(&self.namespaces, graph);
        self.add_rdf(RdfFormat::Trig, None, trig.into_bytes());
    }

    /// Lower the queued ops to interpreter operations, applying the
    /// skip-unless-strict policy to malformed payloads.
    fn lower(&self) -> Result<Vec<UpdateOp>, BatchError> {
        let mut lowered = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let parsed = match op {
                BatchOp::Sparql(text) => store::parse_sparql_update(text),
                BatchOp::Statement { sparql, params } => {
                    store::parse_sparql_update(&substitute_params(sparql, params))
                }
                BatchOp::Rdf { data, .. } => {
                    let text = String::from_utf8_lossy(data);
                    store::parse_trig(&text).map(|quads| vec![UpdateOp::Insert(quads)])
                }
                BatchOp::Fd(data) => {
                    let text = String::from_utf8_lossy(data);
                    store::parse_sparql_update(&text)
                }
            };
            match parsed {
                Ok(mut ops) => lowered.append(&mut ops),
                Err(e) => store::handle_parse_failure(e, self.strict).map_err(BatchError::Store)?,
            }
        }
        Ok(lowered)
    }

    /// Execute asynchronously. All-or-nothing: on error the sink state
    /// is unchanged. A batch executes at most once.
    pub async fn execute_async(&mut self, cancel: &Cancellable) -> Result<(), BatchError> {
        if self.executed {
            return Err(BatchError::AlreadyExecuted);
        }
        self.executed = true;
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }

        let lowered = self.lower()?;
        let sink = Arc::clone(&self.sink);
        let cancel = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            if cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            sink.perform_update(lowered).map_err(BatchError::Store)
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(_join) => Err(BatchError::Cancelled),
        }
    }

    /// Blocking execution built on the async form.
    pub fn execute(&mut self, cancel: &Cancellable) -> Result<(), BatchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| BatchError::Store(StoreError::Io(e)))?;
        runtime.block_on(self.execute_async(cancel))
    }
}

/// Replace `~name` placeholders with rendered parameter values.
/// Parameters with no wire representation leave their placeholder
/// untouched, which surfaces as a parse error downstream.
fn substitute_params(sparql: &str, params: &[(String, ParamValue)]) -> String {
    let mut out = sparql.to_string();
    for (name, value) in params {
        if let Some(rendered) = value.render() {
            out = out.replace(&format!("~{name}"), &rendered);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fossick_core::resource::Value;
    use fossick_core::types::Ontology;
    use tempfile::TempDir;

    fn store_sink() -> (TempDir, Arc<MetaStore>) {
        let dir = TempDir::new().unwrap();
        let store =
            MetaStore::open(dir.path(), Arc::new(Ontology::build().unwrap())).unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn resource_with_overwrite_emits_prelude_before_rdf() {
        let sink = Arc::new(CollectingSink::default());
        let mut batch = Batch::new(sink);

        let mut resource = Resource::new(Some("urn:r"));
        let root = resource.root();
        resource.set_value(root, "nie:title", Value::String("name".into()));
        batch.add_resource(Some("urn:g1"), &resource);

        assert_eq!(batch.len(), 2);
        match &batch.ops()[0] {
            BatchOp::Statement { sparql, .. } => {
                assert!(sparql.starts_with("DELETE WHERE { GRAPH <urn:g1>"));
                assert!(sparql.contains("nie#title"));
            }
            other => panic!("expected prelude statement, got {other:?}"),
        }
        assert!(matches!(&batch.ops()[1], BatchOp::Rdf { format: RdfFormat::Trig, .. }));
    }

    #[test]
    fn execute_applies_clear_then_insert() {
        let (_dir, store) = store_sink();
        let sink: Arc<dyn UpdateSink> = store.clone();

        // Seed an old value
        store
            .perform_update(vec![UpdateOp::Insert(vec![store::Quad {
                graph: "urn:g1".into(),
                subject: "urn:r".into(),
                predicate: "http://www.semanticdesktop.org/ontologies/2007/01/19/nie#title".into(),
                object: "old".into(),
            }])])
            .unwrap();

        let mut resource = Resource::new(Some("urn:r"));
        let root = resource.root();
        resource.set_value(root, "nie:title", Value::String("new".into()));

        let mut batch = Batch::new(sink);
        batch.add_resource(Some("urn:g1"), &resource);
        batch.execute(&Cancellable::default()).unwrap();

        let quads = store.statements_for("urn:r").unwrap();
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].object, "new");
    }

    #[test]
    fn batch_failure_leaves_store_untouched() {
        let (_dir, store) = store_sink();
        let sink: Arc<dyn UpdateSink> = store.clone();

        let mut batch = Batch::new(sink);
        batch.set_strict(true);
        batch.add_sparql("INSERT DATA { GRAPH <urn:g> {\n<urn:a>\n  <urn:p> \"v\" .\n} }");
        batch.add_sparql("TOTALLY NOT SPARQL");

        let err = batch.execute(&Cancellable::default()).unwrap_err();
        assert!(matches!(err, BatchError::Store(StoreError::Parse(_))));
        assert!(store.statements_for("urn:a").unwrap().is_empty());
    }

    #[test]
    fn lenient_batch_skips_malformed_ops() {
        let (_dir, store) = store_sink();
        let sink: Arc<dyn UpdateSink> = store.clone();

        let mut batch = Batch::new(sink);
        batch.add_sparql("TOTALLY NOT SPARQL");
        batch.add_sparql("INSERT DATA { GRAPH <urn:g> {\n<urn:a>\n  <urn:p> \"v\" .\n} }");
        batch.execute(&Cancellable::default()).unwrap();

        assert_eq!(store.statements_for("urn:a").unwrap().len(), 1);
    }

    #[test]
    fn batch_executes_once() {
        let sink = Arc::new(CollectingSink::default());
        let mut batch = Batch::new(sink);
        batch.add_sparql("INSERT DATA { <urn:a>\n  <urn:p> \"v\" .\n }");
        batch.execute(&Cancellable::default()).unwrap();
        assert!(matches!(
            batch.execute(&Cancellable::default()),
            Err(BatchError::AlreadyExecuted)
        ));
    }

    #[test]
    fn cancellation_propagates() {
        let sink = Arc::new(CollectingSink::default());
        let mut batch = Batch::new(sink.clone());
        batch.add_sparql("INSERT DATA { <urn:a>\n  <urn:p> \"v\" .\n }");

        let cancel = Cancellable::default();
        cancel.cancel();
        assert!(matches!(batch.execute(&cancel), Err(BatchError::Cancelled)));
        assert!(sink.collected.lock().unwrap().is_empty());
    }

    #[test]
    fn statement_params_substitute_by_type() {
        let sink = Arc::new(CollectingSink::default());
        let mut batch = Batch::new(sink.clone());
        batch.add_statement(
            "DELETE WHERE { GRAPH <urn:g> { <~s> <urn:p> ?o } }",
            vec![("s".to_string(), ParamValue::String("urn:r".into()))],
        );
        batch.execute(&Cancellable::default()).unwrap();

        let collected = sink.collected.lock().unwrap();
        match &collected[0] {
            UpdateOp::ClearProperty { subject, .. } => assert_eq!(subject, "urn:r"),
            _ => panic!("expected clear"),
        }
    }

    #[test]
    fn unsupported_params_are_skipped() {
        assert!(ParamValue::Unsupported("GBytes").render().is_none());
        let substituted = substitute_params(
            "x ~a ~b",
            &[
                ("a".to_string(), ParamValue::Int(7)),
                ("b".to_string(), ParamValue::Unsupported("GBytes")),
            ],
        );
        assert_eq!(substituted, "x 7 ~b");
    }

    #[test]
    fn cyclic_resource_batch_terminates() {
        let sink = Arc::new(CollectingSink::default());
        let mut batch = Batch::new(sink);

        let mut resource = Resource::new(Some("urn:a"));
        let a = resource.root();
        let b = resource.add_node(Some("urn:b"));
        resource.set_value(a, "nie:relatedTo", Value::Node(b));
        resource.set_value(b, "nie:relatedTo", Value::Node(a));
        batch.add_resource(None, &resource);

        // Two preludes (one per node) and one rdf payload
        assert_eq!(batch.len(), 3);
    }
}
