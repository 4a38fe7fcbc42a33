//! Declarative target shapes of managed worker groups

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::filter::NodeFilter;
use crate::error::{MembershipError, MembershipResult};
use crate::group::GroupOption;
use crate::node::CORE_DOMAIN;

/// Kind of a managed group
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// Plain group without state transfer
    #[default]
    Simple,
    /// State survives restarts of all members
    Durable,
    /// New members receive state through a blocking transfer
    SimpleStateTransfer,
    /// New members receive state after joining
    AsyncStateTransfer,
}

impl GroupType {
    /// Group options implied by the type
    pub fn options(self) -> BTreeSet<GroupOption> {
        match self {
            Self::Simple => BTreeSet::new(),
            Self::Durable => BTreeSet::from([GroupOption::Durable]),
            Self::SimpleStateTransfer => BTreeSet::from([GroupOption::SimpleStateTransfer]),
            Self::AsyncStateTransfer => BTreeSet::from([GroupOption::AsyncStateTransfer]),
        }
    }
}

/// Admin-authored description of a managed group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDefinition {
    /// Domain whose nodes populate the group
    pub domain: String,
    /// Group id
    pub id: Uuid,
    /// Group name
    pub name: String,
    /// Filter selecting eligible nodes
    pub node_filter_expression: String,
    /// Target number of members
    pub node_count: usize,
    /// Group kind
    #[serde(default)]
    pub group_type: GroupType,
}

impl GroupDefinition {
    /// Create a definition selecting every node of the domain
    pub fn new(domain: impl Into<String>, name: impl Into<String>, node_count: usize) -> Self {
        Self {
            domain: domain.into(),
            id: Uuid::new_v4(),
            name: name.into(),
            node_filter_expression: NodeFilter::ALL.to_string(),
            node_count,
            group_type: GroupType::Simple,
        }
    }

    /// Replace the node filter expression
    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        self.node_filter_expression = expression.into();
        self
    }

    /// Replace the group type
    pub fn with_type(mut self, group_type: GroupType) -> Self {
        self.group_type = group_type;
        self
    }

    /// Parsed node filter
    pub fn filter(&self) -> MembershipResult<NodeFilter> {
        NodeFilter::parse(&self.node_filter_expression)
    }

    /// Check the definition can be used
    pub fn validate(&self) -> MembershipResult<()> {
        if self.domain.is_empty() || self.domain == CORE_DOMAIN {
            return Err(MembershipError::invalid_argument(format!(
                "group {} must target a worker domain, got '{}'",
                self.name, self.domain
            )));
        }
        if self.node_count == 0 {
            return Err(MembershipError::invalid_argument(format!(
                "group {} must request at least one node",
                self.name
            )));
        }
        self.filter().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(GroupDefinition::new("workers", "g", 2).validate().is_ok());
        assert!(GroupDefinition::new(CORE_DOMAIN, "g", 2).validate().is_err());
        assert!(GroupDefinition::new("workers", "g", 0).validate().is_err());
        assert!(
            GroupDefinition::new("workers", "g", 1)
                .with_filter("zone == ")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_type_options() {
        assert!(GroupType::Simple.options().is_empty());
        assert!(GroupType::Durable.options().contains(&GroupOption::Durable));
    }
}
