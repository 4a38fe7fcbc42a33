//! Node filter expressions of group definitions
//!
//! Grammar: `*` (or an empty expression) matches every node; otherwise the
//! expression is a conjunction of clauses joined by `&&`, each clause being
//! `key == "value"`, `key != "value"` or a bare `key` testing presence. Keys
//! `name`, `domain` and `address` refer to the node record, any other key to
//! a node property.

use std::fmt;

use crate::error::{MembershipError, MembershipResult};
use crate::node::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Equals(String, String),
    NotEquals(String, String),
    Present(String),
}

/// Parsed node filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFilter {
    clauses: Vec<Clause>,
}

impl NodeFilter {
    /// Expression matching every node
    pub const ALL: &'static str = "*";

    /// Parse a filter expression
    pub fn parse(expression: &str) -> MembershipResult<Self> {
        let expression = expression.trim();
        if expression.is_empty() || expression == Self::ALL {
            return Ok(Self {
                clauses: Vec::new(),
            });
        }

        let clauses = expression
            .split("&&")
            .map(parse_clause)
            .collect::<MembershipResult<Vec<_>>>()?;

        Ok(Self { clauses })
    }

    /// Whether the filter matches every node
    pub fn matches_all(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether the node satisfies every clause
    pub fn matches(&self, node: &Node) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Equals(key, value) => lookup(node, key).as_deref() == Some(value.as_str()),
            Clause::NotEquals(key, value) => lookup(node, key).as_deref() != Some(value.as_str()),
            Clause::Present(key) => lookup(node, key).is_some(),
        })
    }
}

impl fmt::Display for NodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str(Self::ALL);
        }

        let rendered: Vec<String> = self
            .clauses
            .iter()
            .map(|clause| match clause {
                Clause::Equals(key, value) => format!("{key} == \"{value}\""),
                Clause::NotEquals(key, value) => format!("{key} != \"{value}\""),
                Clause::Present(key) => key.clone(),
            })
            .collect();
        f.write_str(&rendered.join(" && "))
    }
}

fn parse_clause(clause: &str) -> MembershipResult<Clause> {
    let clause = clause.trim();
    let invalid = || MembershipError::invalid_argument(format!("invalid filter clause '{clause}'"));

    let (key, value, negated) = if let Some((key, value)) = clause.split_once("!=") {
        (key, Some(value), true)
    } else if let Some((key, value)) = clause.split_once("==") {
        (key, Some(value), false)
    } else {
        (clause, None, false)
    };

    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(invalid());
    }

    let Some(value) = value else {
        return Ok(Clause::Present(key.to_string()));
    };

    let value = value.trim();
    let value = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(quoted) => quoted,
        None if !value.is_empty() && !value.contains(char::is_whitespace) => value,
        None => return Err(invalid()),
    };

    if negated {
        Ok(Clause::NotEquals(key.to_string(), value.to_string()))
    } else {
        Ok(Clause::Equals(key.to_string(), value.to_string()))
    }
}

fn lookup(node: &Node, key: &str) -> Option<String> {
    match key {
        "name" => Some(node.name().to_string()),
        "domain" => Some(node.domain().to_string()),
        "address" => Some(node.address().to_string()),
        _ => node.property(key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use serde_json::json;

    fn worker(zone: Option<&str>) -> Node {
        let node = Node::new(NodeId::random(), "w1", "w1:1", "workers");
        match zone {
            Some(zone) => node.with_property("zone", json!(zone)),
            None => node,
        }
    }

    #[test]
    fn test_match_all() {
        for expression in ["", "*", "  *  "] {
            let filter = NodeFilter::parse(expression).unwrap();
            assert!(filter.matches_all());
            assert!(filter.matches(&worker(None)));
        }
    }

    #[test]
    fn test_clauses() {
        let filter = NodeFilter::parse(r#"zone == "eu-1" && domain == workers"#).unwrap();
        assert!(filter.matches(&worker(Some("eu-1"))));
        assert!(!filter.matches(&worker(Some("us-1"))));
        assert!(!filter.matches(&worker(None)));

        let filter = NodeFilter::parse(r#"zone != "eu-1""#).unwrap();
        assert!(filter.matches(&worker(Some("us-1"))));
        assert!(filter.matches(&worker(None)));

        let filter = NodeFilter::parse("zone").unwrap();
        assert!(filter.matches(&worker(Some("us-1"))));
        assert!(!filter.matches(&worker(None)));
    }

    #[test]
    fn test_non_string_properties() {
        let node = Node::new(NodeId::random(), "w", "w:1", "workers").with_property("rack", json!(7));
        assert!(NodeFilter::parse("rack == 7").unwrap().matches(&node));
    }

    #[test]
    fn test_invalid_expressions() {
        for expression in ["zone ==", "== \"x\"", "zone == \"a\" &&", "zone == a b"] {
            assert!(NodeFilter::parse(expression).is_err(), "{expression}");
        }
    }

    #[test]
    fn test_display() {
        let filter = NodeFilter::parse(r#"zone=="eu-1"&&gpu"#).unwrap();
        assert_eq!(filter.to_string(), r#"zone == "eu-1" && gpu"#);
    }
}
