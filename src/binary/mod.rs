//! The slice of the binary-stanza layer the relay core consumes: the JID
//! model, the node tree, the node builder and the attribute reader. Encoding
//! nodes to the wire (and back) is the transport's job.

pub mod attrs;
pub mod builder;
pub mod jid;
pub mod node;

pub use builder::NodeBuilder;
pub use jid::Jid;
pub use node::{Attrs, Node, NodeContent};
