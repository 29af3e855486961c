use std::str::FromStr;

use crate::binary::jid::Jid;
use crate::binary::node::Node;

/// Accumulating attribute reader. Missing required attributes and parse
/// failures are collected instead of failing fast; callers inspect
/// [`AttrParser::finish`] once all reads are done.
pub struct AttrParser<'a> {
    node: &'a Node,
    errors: Vec<String>,
}

impl<'a> AttrParser<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self {
            node,
            errors: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(self) -> Result<(), String> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.join("; "))
        }
    }

    pub fn optional_string(&self, key: &str) -> Option<&'a str> {
        self.node.attrs.get(key).map(|s| s.as_str())
    }

    pub fn string(&mut self, key: &str) -> String {
        match self.optional_string(key) {
            Some(s) => s.to_string(),
            None => {
                self.errors.push(format!("required attribute '{key}' not found"));
                String::new()
            }
        }
    }

    pub fn optional_jid(&mut self, key: &str) -> Option<Jid> {
        let raw = self.optional_string(key)?;
        match Jid::from_str(raw) {
            Ok(jid) => Some(jid),
            Err(e) => {
                self.errors.push(format!("invalid JID in '{key}': {e}"));
                None
            }
        }
    }

    pub fn jid(&mut self, key: &str) -> Jid {
        if self.optional_string(key).is_none() {
            self.errors.push(format!("required attribute '{key}' not found"));
            return Jid::default();
        }
        self.optional_jid(key).unwrap_or_default()
    }

    pub fn optional_u64(&mut self, key: &str) -> Option<u64> {
        let raw = self.optional_string(key)?;
        match raw.parse::<u64>() {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(format!("invalid integer in '{key}': {e}"));
                None
            }
        }
    }
}
