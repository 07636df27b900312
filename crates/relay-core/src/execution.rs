//! Hierarchical execution positions.
//!
//! Every lifecycle event reports *where* in a run it originated. A position is a
//! chain of [`ExecutionInfo`] nodes: the top-level run has no parent, and each
//! subgraph, strategy, or node entry creates a child whose parent is the position
//! it was entered from. Nodes are never mutated; deeper positions are built by
//! linking a new node to the old one, so any event can reconstruct its full path
//! without a global registry.

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

use crate::types::{AgentId, RunId};

/// Separator used by [`ExecutionInfo::path`].
pub const DEFAULT_PATH_SEPARATOR: &str = "/";

/// An immutable position record: a parent link plus a local segment name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionInfo {
    parent: Option<Arc<ExecutionInfo>>,
    part_name: String,
}

impl ExecutionInfo {
    /// A top-level position with no parent.
    pub fn root(part_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            part_name: part_name.into(),
        })
    }

    /// A new position nested under `self`.
    pub fn with_child(self: &Arc<Self>, part_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            part_name: part_name.into(),
        })
    }

    pub fn parent(&self) -> Option<&Arc<ExecutionInfo>> {
        self.parent.as_ref()
    }

    pub fn part_name(&self) -> &str {
        &self.part_name
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of ancestors above this position (0 for the top level).
    pub fn depth(&self) -> usize {
        self.ancestors().count() - 1
    }

    /// Iterate from `self` up to the top-level position.
    pub fn ancestors(&self) -> impl Iterator<Item = &ExecutionInfo> {
        std::iter::successors(Some(self), |info| info.parent.as_deref())
    }

    /// Segment names from the outermost ancestor down to `self`.
    pub fn segments(&self) -> Vec<&str> {
        let mut parts: Vec<&str> = self.ancestors().map(|info| info.part_name.as_str()).collect();
        parts.reverse();
        parts
    }

    /// The `/`-joined path from the outermost ancestor to `self`.
    pub fn path(&self) -> String {
        self.path_with(DEFAULT_PATH_SEPARATOR)
    }

    /// The path joined with a caller-supplied separator.
    pub fn path_with(&self, separator: &str) -> String {
        self.segments().join(separator)
    }
}

impl fmt::Display for ExecutionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl Serialize for ExecutionInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path())
    }
}

/// Identity of one run plus the position inside it.
///
/// Passed to every pipeline firing method so event contexts can be built without
/// threading run id, agent id, and position separately.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub run_id: RunId,
    pub agent_id: AgentId,
    pub execution_info: Arc<ExecutionInfo>,
}

impl RunScope {
    pub fn new(
        run_id: impl Into<RunId>,
        agent_id: impl Into<AgentId>,
        execution_info: Arc<ExecutionInfo>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            execution_info,
        }
    }

    /// The same run, one level deeper.
    pub fn child(&self, part_name: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id.clone(),
            agent_id: self.agent_id.clone(),
            execution_info: self.execution_info.with_child(part_name),
        }
    }

    pub fn path(&self) -> String {
        self.execution_info.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_parent() {
        let root = ExecutionInfo::root("run-1");
        assert!(root.is_top_level());
        assert_eq!(root.depth(), 0);
        assert_eq!(root.path(), "run-1");
    }

    #[test]
    fn child_path_joins_outermost_first() {
        let root = ExecutionInfo::root("run-1");
        let child = root.with_child("subgraph-a");
        assert_eq!(child.path(), "run-1/subgraph-a");
        assert_eq!(child.parent().map(|p| p.part_name()), Some("run-1"));
        // The parent is untouched.
        assert_eq!(root.path(), "run-1");
    }

    #[test]
    fn custom_separator() {
        let info = ExecutionInfo::root("a").with_child("b").with_child("c");
        assert_eq!(info.path_with("."), "a.b.c");
        assert_eq!(info.depth(), 2);
    }

    #[test]
    fn serializes_as_path() {
        let info = ExecutionInfo::root("agent").with_child("node");
        assert_eq!(serde_json::to_value(&*info).unwrap(), serde_json::json!("agent/node"));
    }
}
