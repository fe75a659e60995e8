//! Declarative graph of operator nodes
//!
//! A [`Graph`] is an inert description of operator wiring: named nodes, each
//! referencing its sources by name. It has no behavior beyond structural
//! queries and validation; execution state lives in
//! [`crate::executor::GraphContext`].

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// A named source reference of a node.
///
/// `name` identifies the input slot within the operator (e.g. `"input"`,
/// `"mask"`); `source` names another node in the same graph or an
/// externally registered product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSource {
    /// Input slot name
    pub name: String,
    /// Referenced node or external product name
    pub source: String,
}

impl NodeSource {
    /// Creates a new source reference.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// One operator instance plus its wiring within a graph.
///
/// Immutable once added to a [`Graph`].
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    op_type: String,
    params: serde_json::Value,
    sources: Vec<NodeSource>,
    is_output: bool,
}

impl Node {
    /// Creates a node with the given unique name and operator type.
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            params: serde_json::Value::Null,
            sources: Vec::new(),
            is_output: false,
        }
    }

    /// Sets the opaque operator configuration.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Appends a named source reference.
    pub fn with_source(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.sources.push(NodeSource::new(name, source));
        self
    }

    /// Marks this node as a graph output.
    pub fn as_output(mut self) -> Self {
        self.is_output = true;
        self
    }

    /// Node name, unique within its graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operator type identifier.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Opaque operator configuration.
    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Ordered source references.
    pub fn sources(&self) -> &[NodeSource] {
        &self.sources
    }

    /// Returns true if this node was explicitly flagged as an output.
    pub fn is_output(&self) -> bool {
        self.is_output
    }
}

/// The declarative DAG of nodes.
///
/// Node order is insertion order, not dependency order; use
/// [`init_order`](Self::init_order) for a sources-before-dependents walk.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    id: String,
    description: Option<String>,
    nodes: Vec<Node>,
}

impl Graph {
    /// Creates an empty graph with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            nodes: Vec::new(),
        }
    }

    /// Sets the header description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Graph id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Header description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Adds a node. Name uniqueness is checked by [`validate`](Self::validate).
    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Looks up a node by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes no other node consumes.
    pub fn sink_nodes(&self) -> Vec<&Node> {
        let consumed: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.sources.iter().map(|s| s.source.as_str()))
            .collect();
        self.nodes
            .iter()
            .filter(|n| !consumed.contains(n.name.as_str()))
            .collect()
    }

    /// Names of the graph's output nodes: the explicitly flagged ones, or
    /// every sink when no node is flagged.
    pub fn output_node_names(&self) -> Vec<String> {
        let flagged: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_output)
            .map(|n| n.name.clone())
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }
        self.sink_nodes().iter().map(|n| n.name.clone()).collect()
    }

    /// Validates the graph structure.
    ///
    /// Checks node name uniqueness, that every source reference resolves to
    /// a node or one of `external_products`, and that the source-reference
    /// graph is acyclic. Must pass before any execution begins.
    pub fn validate(&self, external_products: &HashSet<String>) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Graph("graph contains no nodes".to_string()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(Error::Graph(format!("duplicate node name: {}", node.name)));
            }
        }

        for node in &self.nodes {
            for source in &node.sources {
                if self.node(&source.source).is_none()
                    && !external_products.contains(&source.source)
                {
                    return Err(Error::Graph(format!(
                        "node '{}' references unknown source '{}'",
                        node.name, source.source
                    )));
                }
            }
        }

        self.init_order().map(|_| ())
    }

    /// Post-order depth-first walk over the source-reference graph: every
    /// node appears after all of its sources.
    ///
    /// Fails with a graph error when a cycle is found. External references
    /// (names that are not nodes) are skipped; their resolution is checked
    /// by [`validate`](Self::validate).
    pub fn init_order(&self) -> Result<Vec<&Node>> {
        let mut marks: HashMap<&str, VisitMark> = HashMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            self.visit(node, &mut marks, &mut order, &mut Vec::new())?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        node: &'a Node,
        marks: &mut HashMap<&'a str, VisitMark>,
        order: &mut Vec<&'a Node>,
        trail: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(node.name.as_str()) {
            Some(VisitMark::Done) => return Ok(()),
            Some(VisitMark::Visiting) => {
                trail.push(node.name.as_str());
                return Err(Error::Graph(format!(
                    "cycle detected: {}",
                    trail.join(" -> ")
                )));
            }
            None => {}
        }

        marks.insert(node.name.as_str(), VisitMark::Visiting);
        trail.push(node.name.as_str());
        for source in &node.sources {
            if let Some(source_node) = self.node(&source.source) {
                self.visit(source_node, marks, order, trail)?;
            }
        }
        trail.pop();
        marks.insert(node.name.as_str(), VisitMark::Done);
        order.push(node);
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum VisitMark {
    Visiting,
    Done,
}
