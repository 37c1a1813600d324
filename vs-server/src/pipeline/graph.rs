// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Typed pipeline descriptions. Workers declare what to run as a graph of
//! named element nodes; the runtime instantiates it, and the launch-style
//! rendering is only ever used for logs.

use crate::format::Caps;

#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Caps(Caps),
}

impl PropValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_caps(&self) -> Option<&Caps> {
        match self {
            PropValue::Caps(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropValue::Int(v) => write!(f, "{}", v),
            PropValue::Bool(v) => write!(f, "{}", v),
            PropValue::Str(v) => write!(f, "{}", v),
            PropValue::Caps(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<i32> for PropValue {
    fn from(v: i32) -> Self {
        PropValue::Int(v as i64)
    }
}

impl From<u32> for PropValue {
    fn from(v: u32) -> Self {
        PropValue::Int(v as i64)
    }
}

impl From<u16> for PropValue {
    fn from(v: u16) -> Self {
        PropValue::Int(v as i64)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

impl From<Caps> for PropValue {
    fn from(v: Caps) -> Self {
        PropValue::Caps(v)
    }
}

/// An element to be instantiated: a kind, an optional name (one is
/// generated otherwise), and properties.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: String,
    pub name: Option<String>,
    pub props: Vec<(String, PropValue)>,
    pub pad_props: Vec<(String, String, PropValue)>,
}

impl Node {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            name: None,
            props: Vec::new(),
            pad_props: Vec::new(),
        }
    }

    /// Shorthand for a capsfilter node.
    pub fn caps(caps: Caps) -> Self {
        Node::new("capsfilter").prop("caps", caps)
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn prop(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.props.push((key.to_owned(), value.into()));
        self
    }

    pub fn pad_prop(mut self, pad: &str, key: &str, value: impl Into<PropValue>) -> Self {
        self.pad_props
            .push((pad.to_owned(), key.to_owned(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub from: String,
    pub from_pad: String,
    pub to: String,
    pub to_pad: String,
}

#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub nodes: Vec<Node>,
    pub links: Vec<LinkSpec>,
}

impl PipelineSpec {
    pub fn builder() -> SpecBuilder {
        SpecBuilder {
            spec: PipelineSpec {
                nodes: Vec::new(),
                links: Vec::new(),
            },
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.name.as_deref() == Some(name))
    }

    /// Renders a gst-launch-flavored description for logging.
    pub fn to_launch_string(&self) -> String {
        let mut indegree = hashbrown::HashMap::new();
        let mut outgoing: hashbrown::HashMap<&str, Vec<&LinkSpec>> = hashbrown::HashMap::new();
        for link in &self.links {
            *indegree.entry(link.to.as_str()).or_insert(0usize) += 1;
            outgoing.entry(link.from.as_str()).or_default().push(link);
        }

        let render_node = |name: &str| -> String {
            let Some(node) = self.node(name) else {
                return name.to_owned();
            };
            let mut out = node.kind.clone();
            if node.name.as_deref() != Some(node.kind.as_str()) {
                out.push_str(&format!(" name={}", name));
            }
            for (key, value) in &node.props {
                out.push_str(&format!(" {}={}", key, value));
            }
            for (pad, key, value) in &node.pad_props {
                out.push_str(&format!(" {}::{}={}", pad, key, value));
            }
            out
        };

        let mut segments = Vec::new();
        let mut chained: hashbrown::HashSet<&str> = hashbrown::HashSet::new();
        for node in &self.nodes {
            let name = node.name.as_deref().unwrap_or(&node.kind);
            if indegree.get(name).copied().unwrap_or(0) > 0 || chained.contains(name) {
                continue;
            }

            let mut parts = vec![render_node(name)];
            chained.insert(name);
            let mut cur = name;
            loop {
                let next = match outgoing.get(cur) {
                    Some(links) if links.len() == 1 => links[0].to.as_str(),
                    _ => break,
                };
                if indegree.get(next).copied().unwrap_or(0) != 1 || chained.contains(next) {
                    break;
                }

                parts.push(render_node(next));
                chained.insert(next);
                cur = next;
            }

            segments.push(parts.join(" ! "));
        }

        for link in &self.links {
            if chained.contains(link.to.as_str()) && chained.contains(link.from.as_str()) {
                // Already implied by a chain, unless it's a side branch.
                let implied = outgoing
                    .get(link.from.as_str())
                    .map(|l| l.len() == 1)
                    .unwrap_or(false)
                    && indegree.get(link.to.as_str()).copied().unwrap_or(0) == 1;
                if implied {
                    continue;
                }
            }
            segments.push(format!(
                "{}.{} ! {}.{}",
                link.from, link.from_pad, link.to, link.to_pad
            ));
        }

        segments.join("  ")
    }
}

pub struct SpecBuilder {
    spec: PipelineSpec,
}

impl SpecBuilder {
    /// Adds a node and returns its (possibly generated) name.
    pub fn add(&mut self, mut node: Node) -> String {
        if node.name.is_none() {
            node.name = Some(format!("{}{}", node.kind, self.spec.nodes.len()));
        }
        let name = node.name.clone().unwrap();
        self.spec.nodes.push(node);
        name
    }

    /// Adds the nodes and links them in sequence. Returns the name of the
    /// last node.
    pub fn chain(&mut self, nodes: Vec<Node>) -> String {
        let mut prev: Option<String> = None;
        let mut last = String::new();
        for node in nodes {
            let name = self.add(node);
            if let Some(prev) = prev {
                self.link(&prev, &name);
            }
            prev = Some(name.clone());
            last = name;
        }
        last
    }

    /// Like `chain`, but starting from an already-added node.
    pub fn chain_from(&mut self, from: &str, nodes: Vec<Node>) -> String {
        let mut prev = from.to_owned();
        for node in nodes {
            let name = self.add(node);
            self.link(&prev, &name);
            prev = name;
        }
        prev
    }

    pub fn link(&mut self, from: &str, to: &str) {
        self.link_pads(from, "src", to, "sink");
    }

    pub fn link_pads(&mut self, from: &str, from_pad: &str, to: &str, to_pad: &str) {
        self.spec.links.push(LinkSpec {
            from: from.to_owned(),
            from_pad: from_pad.to_owned(),
            to: to.to_owned(),
            to_pad: to_pad.to_owned(),
        });
    }

    pub fn build(self) -> PipelineSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builds_links() {
        let mut b = PipelineSpec::builder();
        let last = b.chain(vec![
            Node::new("streamsrc").name("source"),
            Node::new("framedepay"),
            Node::new("surfacevideosink")
                .name("sink")
                .prop("channel", "input_3"),
        ]);
        let spec = b.build();

        assert_eq!(last, "sink");
        assert_eq!(spec.nodes.len(), 3);
        assert_eq!(spec.links.len(), 2);
        assert_eq!(spec.links[0].from, "source");
        assert_eq!(spec.links[1].to, "sink");
    }

    #[test]
    fn test_generated_names_unique() {
        let mut b = PipelineSpec::builder();
        let a = b.add(Node::new("queue"));
        let c = b.add(Node::new("queue"));
        assert_ne!(a, c);
    }

    #[test]
    fn test_launch_string_render() {
        let mut b = PipelineSpec::builder();
        b.chain(vec![
            Node::new("streamsrc").name("source"),
            Node::new("framedepay"),
            Node::new("surfacevideosink")
                .name("sink")
                .prop("channel", "input_3"),
        ]);
        let rendered = b.build().to_launch_string();

        assert!(rendered.contains("streamsrc name=source"));
        assert!(rendered.contains(" ! framedepay"));
        assert!(rendered.contains("channel=input_3"));
    }
}
