//! Graph manifest parsing and validation
//!
//! This module handles JSON/YAML manifest parsing, validation, and
//! conversion to the internal [`Graph`] representation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{Graph, Node};

/// Graph manifest structure (v1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphManifest {
    /// Schema version
    pub version: String,

    /// Graph header metadata
    #[serde(default)]
    pub header: GraphHeader,

    /// List of nodes in the graph
    pub nodes: Vec<NodeManifest>,
}

/// Graph header metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphHeader {
    /// Graph id
    #[serde(default)]
    pub id: String,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Node manifest entry
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeManifest {
    /// Unique node id within the graph
    pub id: String,

    /// Operator type (e.g. "constant", "band_maths")
    pub op: String,

    /// Operator-specific parameters
    #[serde(default)]
    pub params: serde_json::Value,

    /// Named source references, in declaration order
    #[serde(default)]
    pub sources: Vec<SourceManifest>,

    /// Whether this node's product is part of the graph's result.
    ///
    /// When no node sets this, the graph's sinks (nodes no other node
    /// consumes) become the outputs.
    #[serde(default)]
    pub is_output: bool,
}

/// Source reference entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceManifest {
    /// Input slot name within the operator
    pub name: String,

    /// Referenced node id or external product name
    pub from: String,
}

/// Parse a JSON manifest string
pub fn parse_json(json: &str) -> Result<GraphManifest> {
    serde_json::from_str(json).map_err(|e| Error::Manifest(format!("failed to parse manifest: {e}")))
}

/// Parse a YAML manifest string
pub fn parse_yaml(yaml: &str) -> Result<GraphManifest> {
    serde_yaml::from_str(yaml)
        .map_err(|e| Error::Manifest(format!("failed to parse manifest: {e}")))
}

/// Validate a manifest for correctness
pub fn validate(manifest: &GraphManifest) -> Result<()> {
    if manifest.version != "v1" {
        return Err(Error::Manifest(format!(
            "unsupported manifest version: {}",
            manifest.version
        )));
    }

    if manifest.nodes.is_empty() {
        return Err(Error::Manifest(
            "manifest must contain at least one node".to_string(),
        ));
    }

    let mut seen_ids = std::collections::HashSet::new();
    for node in &manifest.nodes {
        if !seen_ids.insert(&node.id) {
            return Err(Error::Manifest(format!("duplicate node id: {}", node.id)));
        }
    }

    Ok(())
}

impl GraphManifest {
    /// Converts a validated manifest into a [`Graph`].
    ///
    /// Source references to names outside the manifest are kept as
    /// external-product references; full resolution happens at graph
    /// validation with the set of registered external products.
    pub fn into_graph(self) -> Result<Graph> {
        validate(&self)?;

        let mut graph = Graph::new(self.header.id);
        if let Some(description) = self.header.description {
            graph = graph.with_description(description);
        }
        for entry in self.nodes {
            let mut node = Node::new(entry.id, entry.op).with_params(entry.params);
            for source in entry.sources {
                node = node.with_source(source.name, source.from);
            }
            if entry.is_output {
                node = node.as_output();
            }
            graph.add_node(node);
        }
        Ok(graph)
    }
}
