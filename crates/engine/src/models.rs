//! The definition DSL for template graphs.
//!
//! A [`DagSpec`] is what clients submit; [`crate::template::define_dag`]
//! validates it and persists it as immutable `store` rows. Identifiers in the
//! DSL are local to one nesting level and only wire edges together.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use store::models::{Expansion, JoinPolicy};

// ---------------------------------------------------------------------------
// DagSpec
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagSpec {
    pub name: String,
    /// Defaults to `name`.
    #[serde(default)]
    pub title: String,
    /// Deadline for each task instantiated from this dag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

impl DagSpec {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, components: Vec<ComponentSpec>) -> Self {
        Self { name: name.into(), title: String::new(), timeout_ms: None, components }
    }
}

// ---------------------------------------------------------------------------
// ComponentSpec
// ---------------------------------------------------------------------------

/// One entry of a dag level: a node or a nested sub-dag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ComponentSpec {
    Node(NodeSpec),
    Dag(SubDagSpec),
}

impl ComponentSpec {
    /// The level-local identifier.
    pub fn key(&self) -> &str {
        match self {
            Self::Node(n) => n.key(),
            Self::Dag(d) => d.key(),
        }
    }

    pub fn previous_nodes(&self) -> &[EdgeSpec] {
        match self {
            Self::Node(n) => &n.previous_nodes,
            Self::Dag(d) => &d.previous_nodes,
        }
    }

    pub fn previous_dags(&self) -> &[String] {
        match self {
            Self::Node(n) => &n.previous_dags,
            Self::Dag(d) => &d.previous_dags,
        }
    }
}

impl From<NodeSpec> for ComponentSpec {
    fn from(n: NodeSpec) -> Self {
        Self::Node(n)
    }
}

impl From<SubDagSpec> for ComponentSpec {
    fn from(d: SubDagSpec) -> Self {
        Self::Dag(d)
    }
}

// ---------------------------------------------------------------------------
// EdgeSpec
// ---------------------------------------------------------------------------

/// A `previous_nodes` entry: a bare identifier (barrier join) or an
/// identifier with an explicit join policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeSpec {
    Plain(String),
    Joined {
        node: String,
        #[serde(default)]
        join: JoinPolicy,
    },
}

impl EdgeSpec {
    pub fn target(&self) -> &str {
        match self {
            Self::Plain(node) | Self::Joined { node, .. } => node,
        }
    }

    pub fn join(&self) -> JoinPolicy {
        match self {
            Self::Plain(_) => JoinPolicy::Barrier,
            Self::Joined { join, .. } => *join,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Defaults to `name`.
    #[serde(default)]
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Registered action name, or the identifier of a sibling sub-dag.
    /// `None` makes a pass-through node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub previous_nodes: Vec<EdgeSpec>,
    #[serde(default)]
    pub previous_dags: Vec<String>,
    #[serde(default)]
    pub expansion: Expansion,
    #[serde(default)]
    pub input_adapter: BTreeMap<String, String>,
    #[serde(default)]
    pub output_adapter: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeSpec {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identifier: String::new(),
            name: name.into(),
            title: String::new(),
            action: None,
            previous_nodes: Vec::new(),
            previous_dags: Vec::new(),
            expansion: Expansion::Single,
            input_adapter: BTreeMap::new(),
            output_adapter: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    pub fn key(&self) -> &str {
        if self.identifier.is_empty() {
            &self.name
        } else {
            &self.identifier
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn after(mut self, nodes: &[&str]) -> Self {
        self.previous_nodes.extend(nodes.iter().map(|n| EdgeSpec::Plain(n.to_string())));
        self
    }

    pub fn zip_after(mut self, node: &str) -> Self {
        self.previous_nodes.push(EdgeSpec::Joined { node: node.into(), join: JoinPolicy::Zip });
        self
    }

    pub fn after_dags(mut self, dags: &[&str]) -> Self {
        self.previous_dags.extend(dags.iter().map(|d| d.to_string()));
        self
    }

    pub fn expansion(mut self, expansion: Expansion) -> Self {
        self.expansion = expansion;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

// ---------------------------------------------------------------------------
// SubDagSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDagSpec {
    /// Defaults to `name`.
    #[serde(default)]
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub previous_nodes: Vec<EdgeSpec>,
    #[serde(default)]
    pub previous_dags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

impl SubDagSpec {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, components: Vec<ComponentSpec>) -> Self {
        Self {
            identifier: String::new(),
            name: name.into(),
            title: String::new(),
            previous_nodes: Vec::new(),
            previous_dags: Vec::new(),
            timeout_ms: None,
            components,
        }
    }

    pub fn key(&self) -> &str {
        if self.identifier.is_empty() {
            &self.name
        } else {
            &self.identifier
        }
    }

    pub fn after(mut self, nodes: &[&str]) -> Self {
        self.previous_nodes.extend(nodes.iter().map(|n| EdgeSpec::Plain(n.to_string())));
        self
    }

    pub fn after_dags(mut self, dags: &[&str]) -> Self {
        self.previous_dags.extend(dags.iter().map(|d| d.to_string()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use store::models::Cardinality;

    #[test]
    fn parses_nested_definition() {
        let spec: DagSpec = serde_json::from_value(json!({
            "name": "release",
            "components": [
                { "kind": "Node", "identifier": "n1", "name": "build", "action": "bash_script",
                  "expansion": { "mode": "fission", "cardinality": { "items": "targets" } } },
                { "kind": "Node", "name": "publish", "action": "bash_script",
                  "previous_nodes": ["n1", { "node": "n1", "join": "zip" }] },
                { "kind": "Dag", "name": "notify", "previous_nodes": ["publish"],
                  "components": [ { "kind": "Node", "name": "mail" } ] }
            ]
        }))
        .expect("valid DSL");

        assert_eq!(spec.components.len(), 3);
        let ComponentSpec::Node(build) = &spec.components[0] else { panic!("node expected") };
        assert_eq!(build.key(), "n1");
        assert_eq!(
            build.expansion,
            Expansion::Fission { cardinality: Cardinality::Items("targets".into()) }
        );

        let ComponentSpec::Node(publish) = &spec.components[1] else { panic!("node expected") };
        assert_eq!(publish.key(), "publish");
        assert_eq!(publish.previous_nodes[0].join(), JoinPolicy::Barrier);
        assert_eq!(publish.previous_nodes[1].join(), JoinPolicy::Zip);
        assert_eq!(publish.previous_nodes[1].target(), "n1");

        let ComponentSpec::Dag(notify) = &spec.components[2] else { panic!("dag expected") };
        assert_eq!(notify.components.len(), 1);
        assert_eq!(notify.components[0].key(), "mail");
    }

    #[test]
    fn default_expansion_is_none_mode() {
        let node: NodeSpec = serde_json::from_value(json!({ "name": "solo" })).unwrap();
        assert_eq!(node.expansion, Expansion::Single);
        assert_eq!(serde_json::to_value(&node.expansion).unwrap(), json!({ "mode": "none" }));
    }
}
