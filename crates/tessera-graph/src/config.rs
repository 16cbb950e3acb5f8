//! Per-node configuration.

use tessera_dnn::ExecutionPolicy;

/// Settings a caller attaches to one operator node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorNodeConfig {
    name: Option<String>,
    policy: Option<ExecutionPolicy>,
}

impl OperatorNodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Workspace limit and reproducibility requirement for the node's
    /// strategy selection. Without one the graph's default policy applies.
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn policy(&self) -> Option<&ExecutionPolicy> {
        self.policy.as_ref()
    }
}
