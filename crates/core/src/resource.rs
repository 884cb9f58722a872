//! Resource records: RDF-resource-shaped values attached to a graph.
//!
//! A `Resource` owns an arena of nodes; edges between nodes are arena
//! indices, so resource graphs may legally contain cycles. Traversal
//! (serialization, overwrite preludes) carries a visited set and emits
//! each node at most once.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

/// Prefix table used to compact and expand IRIs during serialization.
#[derive(Clone, Debug)]
pub struct Namespaces {
    prefixes: Vec<(String, String)>,
}

impl Default for Namespaces {
    fn default() -> Self {
        let prefixes = [
            ("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#"),
            ("rdfs", "http://www.w3.org/2000/01/rdf-schema#"),
            ("xsd", "http://www.w3.org/2001/XMLSchema#"),
            ("nie", "http://www.semanticdesktop.org/ontologies/2007/01/19/nie#"),
            ("nfo", "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#"),
            ("nmo", "http://www.semanticdesktop.org/ontologies/2007/03/22/nmo#"),
        ]
        .into_iter()
        .map(|(p, i)| (p.to_string(), i.to_string()))
        .collect();
        Self { prefixes }
    }
}

impl Namespaces {
    pub fn add(&mut self, prefix: &str, iri: &str) {
        self.prefixes.push((prefix.to_string(), iri.to_string()));
    }

    /// Expand `prefix:local` to a full IRI; already-expanded or unknown
    /// names come back unchanged.
    pub fn expand(&self, name: &str) -> String {
        if let Some((prefix, local)) = name.split_once(':') {
            if let Some((_, iri)) = self.prefixes.iter().find(|(p, _)| p == prefix) {
                return format!("{iri}{local}");
            }
        }
        name.to_string()
    }

    pub fn prefixes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.prefixes.iter().map(|(p, i)| (p.as_str(), i.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Arena index of a node inside a [`Resource`].
pub type NodeId = usize;

/// A property value: a primitive or an edge to another node.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Boolean(bool),
    Double(f64),
    DateTime(DateTime<FixedOffset>),
    /// Reference into the owning resource's arena.
    Node(NodeId),
}

impl Value {
    /// Render as a TriG object token.
    fn to_trig(&self, resource: &Resource) -> String {
        match self {
            Value::String(s) => format!("\"{}\"", escape_literal(s)),
            Value::Integer(i) => i.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Double(d) => {
                if d.fract() == 0.0 && d.is_finite() {
                    format!("{d:.1}")
                } else {
                    d.to_string()
                }
            }
            Value::DateTime(dt) => format!(
                "\"{}\"^^xsd:dateTime",
                dt.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            Value::Node(id) => resource.identifier_token(*id),
        }
    }
}

fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Node {
    /// Full IRI, or `None` for blank nodes.
    iri: Option<String>,
    /// Generated label used when `iri` is absent.
    blank_label: String,
    /// Ordered property entries; multi-valued properties repeat the name.
    properties: Vec<(String, Value)>,
    /// Properties whose prior store values are cleared before insert.
    overwrite: HashSet<String>,
}

/// A named resource record plus every node reachable from it.
#[derive(Clone, Debug)]
pub struct Resource {
    arena: Vec<Node>,
    root: NodeId,
}

impl Resource {
    /// Create a resource with the given identifier; `None` makes the
    /// root a blank node.
    pub fn new(identifier: Option<&str>) -> Self {
        let mut resource = Self { arena: Vec::new(), root: 0 };
        resource.root = resource.add_node(identifier);
        resource
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Allocate a new node in the arena.
    pub fn add_node(&mut self, identifier: Option<&str>) -> NodeId {
        let id = self.arena.len();
        self.arena.push(Node {
            iri: identifier.map(str::to_string),
            blank_label: format!("_:b{}", Uuid::new_v4().simple()),
            properties: Vec::new(),
            overwrite: HashSet::new(),
        });
        id
    }

    pub fn is_blank(&self, node: NodeId) -> bool {
        self.arena[node].iri.is_none()
    }

    /// The node's IRI, or its blank-node label.
    pub fn identifier(&self, node: NodeId) -> &str {
        match &self.arena[node].iri {
            Some(iri) => iri,
            None => &self.arena[node].blank_label,
        }
    }

    fn identifier_token(&self, node: NodeId) -> String {
        match &self.arena[node].iri {
            Some(iri) => format!("<{iri}>"),
            None => self.arena[node].blank_label.clone(),
        }
    }

    /// Append a value, keeping any existing entries for the property.
    pub fn add_value(&mut self, node: NodeId, property: &str, value: Value) {
        self.arena[node].properties.push((property.to_string(), value));
    }

    /// Replace all entries for the property with a single value and
    /// mark it for overwrite at execution.
    pub fn set_value(&mut self, node: NodeId, property: &str, value: Value) {
        self.arena[node].properties.retain(|(p, _)| p != property);
        self.arena[node].properties.push((property.to_string(), value));
        self.arena[node].overwrite.insert(property.to_string());
    }

    pub fn set_overwrite(&mut self, node: NodeId, property: &str, overwrite: bool) {
        if overwrite {
            self.arena[node].overwrite.insert(property.to_string());
        } else {
            self.arena[node].overwrite.remove(property);
        }
    }

    pub fn property_overwrite(&self, node: NodeId, property: &str) -> bool {
        self.arena[node].overwrite.contains(property)
    }

    pub fn properties(&self, node: NodeId) -> &[(String, Value)] {
        &self.arena[node].properties
    }

    /// Breadth-first walk from the root, visiting each node once even
    /// through cycles.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([self.root]);
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            order.push(node);
            for (_, value) in &self.arena[node].properties {
                if let Value::Node(next) = value {
                    queue.push_back(*next);
                }
            }
        }
        order
    }

    /// Properties to clear before inserting: one `(identifier, property)`
    /// pair per overwrite-flagged property on each non-blank reachable
    /// node, in BFS order.
    pub fn overwrite_clears(&self, namespaces: &Namespaces) -> Vec<(String, String)> {
        let mut clears = Vec::new();
        for node in self.walk() {
            if self.is_blank(node) {
                continue;
            }
            let mut seen = HashSet::new();
            for (property, _) in &self.arena[node].properties {
                if self.arena[node].overwrite.contains(property) && seen.insert(property.clone()) {
                    clears.push((self.identifier(node).to_string(), namespaces.expand(property)));
                }
            }
        }
        clears
    }

    /// Serialize the whole reachable graph to TriG. Nested resources
    /// become separate top-level blocks in the same graph; each node is
    /// emitted at most once.
    pub fn to_trig(&self, namespaces: &Namespaces, graph: Option<&str>) -> String {
        let mut out = String::new();
        for (prefix, iri) in namespaces.prefixes() {
            out.push_str(&format!("@prefix {prefix}: <{iri}> .\n"));
        }
        out.push('\n');

        let graph_expanded = graph.map(|g| namespaces.expand(g));
        if let Some(g) = &graph_expanded {
            out.push_str(&format!("GRAPH <{g}> {{\n"));
        }

        for node in self.walk() {
            if self.arena[node].properties.is_empty() {
                continue;
            }
            out.push_str(&self.identifier_token(node));
            let entries = &self.arena[node].properties;
            for (i, (property, value)) in entries.iter().enumerate() {
                let sep = if i + 1 == entries.len() { " ." } else { " ;" };
                out.push_str(&format!("\n  {} {}{}", property, value.to_trig(self), sep));
            }
            out.push_str("\n\n");
        }

        if graph_expanded.is_some() {
            out.push_str("}\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_and_blank_labels() {
        let mut r = Resource::new(Some("urn:thing:1"));
        let blank = r.add_node(None);
        assert_eq!(r.identifier(r.root()), "urn:thing:1");
        assert!(r.is_blank(blank));
        assert!(r.identifier(blank).starts_with("_:b"));
    }

    #[test]
    fn set_value_replaces_and_flags_overwrite() {
        let mut r = Resource::new(Some("urn:thing:1"));
        let root = r.root();
        r.add_value(root, "nie:keyword", Value::String("a".into()));
        r.add_value(root, "nie:keyword", Value::String("b".into()));
        assert_eq!(r.properties(root).len(), 2);

        r.set_value(root, "nie:keyword", Value::String("c".into()));
        assert_eq!(r.properties(root).len(), 1);
        assert!(r.property_overwrite(root, "nie:keyword"));
    }

    #[test]
    fn walk_terminates_on_cycles() {
        let mut r = Resource::new(Some("urn:a"));
        let a = r.root();
        let b = r.add_node(Some("urn:b"));
        r.add_value(a, "nie:relatedTo", Value::Node(b));
        r.add_value(b, "nie:relatedTo", Value::Node(a));

        let order = r.walk();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn trig_emits_each_node_once() {
        let mut r = Resource::new(Some("urn:a"));
        let a = r.root();
        let b = r.add_node(Some("urn:b"));
        r.add_value(a, "nie:relatedTo", Value::Node(b));
        r.add_value(b, "nie:relatedTo", Value::Node(a));
        r.add_value(a, "nie:title", Value::String("loop".into()));

        let trig = r.to_trig(&Namespaces::default(), Some("urn:g"));
        assert_eq!(trig.matches("<urn:a>\n").count(), 1);
        assert_eq!(trig.matches("<urn:b>\n").count(), 1);
        assert!(trig.contains("GRAPH <urn:g>"));
        assert!(trig.contains("\"loop\""));
    }

    #[test]
    fn overwrite_clears_skip_blank_nodes() {
        let mut r = Resource::new(Some("urn:a"));
        let a = r.root();
        let blank = r.add_node(None);
        r.set_value(a, "nie:title", Value::String("t".into()));
        r.add_value(a, "nie:child", Value::Node(blank));
        r.set_value(blank, "nie:title", Value::String("u".into()));

        let clears = r.overwrite_clears(&Namespaces::default());
        assert_eq!(clears.len(), 1);
        assert_eq!(clears[0].0, "urn:a");
        assert!(clears[0].1.ends_with("nie#title"));
    }

    #[test]
    fn literal_escaping() {
        let mut r = Resource::new(Some("urn:a"));
        let root = r.root();
        r.add_value(root, "nie:title", Value::String("say \"hi\"\nback\\slash".into()));
        let trig = r.to_trig(&Namespaces::default(), None);
        assert!(trig.contains("\\\"hi\\\""));
        assert!(trig.contains("\\n"));
        assert!(trig.contains("\\\\slash"));
    }

    #[test]
    fn datetime_truncated_to_millis() {
        let dt = DateTime::parse_from_rfc3339("2008-06-15T12:30:45.123456+02:00").unwrap();
        let mut r = Resource::new(Some("urn:a"));
        let root = r.root();
        r.add_value(root, "nie:contentCreated", Value::DateTime(dt));
        let trig = r.to_trig(&Namespaces::default(), None);
        assert!(trig.contains("2008-06-15T12:30:45.123+02:00"));
    }
}
