use indexmap::IndexMap;

use crate::binary::attrs::AttrParser;

/// Attribute map with stable insertion order, matching the order the wire
/// encoder would emit.
pub type Attrs = IndexMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeContent {
    Bytes(Vec<u8>),
    String(String),
    Nodes(Vec<Node>),
}

/// A single element of the binary stanza tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: Option<NodeContent>,
}

impl Node {
    pub fn new(tag: &str, attrs: Attrs, content: Option<NodeContent>) -> Self {
        Self {
            tag: tag.to_string(),
            attrs,
            content,
        }
    }

    pub fn children(&self) -> Option<&[Node]> {
        match &self.content {
            Some(NodeContent::Nodes(nodes)) => Some(nodes),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Some(NodeContent::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn attrs(&self) -> AttrParser<'_> {
        AttrParser::new(self)
    }

    /// Walk a path of child tags, returning the node at the end of the path.
    pub fn get_optional_child_by_tag<'a>(&'a self, tags: &[&str]) -> Option<&'a Node> {
        let mut current = self;
        for &tag in tags {
            current = current.children()?.iter().find(|c| c.tag == tag)?;
        }
        Some(current)
    }

    pub fn get_optional_child(&self, tag: &str) -> Option<&Node> {
        self.children()
            .and_then(|nodes| nodes.iter().find(|node| node.tag == tag))
    }

    pub fn get_children_by_tag(&self, tag: &str) -> Vec<&Node> {
        self.children()
            .map(|children| children.iter().filter(|c| c.tag == tag).collect())
            .unwrap_or_default()
    }
}
