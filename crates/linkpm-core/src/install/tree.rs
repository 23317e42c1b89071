//! Dependency tree over resolved packages.
//!
//! Nodes live in an arena and are addressed by [`NodeIndex`]. A node id is
//! the path of package ids from the root, e.g. `:/:/a/1.0.0:/b/1.0.0:`, so
//! the same package reached along two paths yields two nodes.

use std::collections::{BTreeSet, HashMap, VecDeque};

/// Index of a node in the tree arena.
pub type NodeIndex = usize;

/// Where the tree builder reads package children and the skip set from.
pub trait ChildSource {
    /// Resolved child ids of `package_id`, in discovery order.
    fn child_ids(&self, package_id: &str) -> Vec<String>;

    /// Whether `package_id` is excluded from installation.
    fn is_skipped(&self, package_id: &str) -> bool;
}

/// One occurrence of a package in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub node_id: String,
    pub package_id: String,
    /// Root nodes are at depth 0.
    pub depth: usize,
    /// False when this node or any ancestor is skipped.
    pub installable: bool,
    /// The package already appears among this node's ancestors.
    pub is_circular: bool,
    /// Package ids from the root down to and including this node.
    pub ancestors: Vec<String>,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
}

/// Arena-backed dependency tree.
#[derive(Debug, Clone, Default)]
pub struct DependencyTree {
    nodes: Vec<TreeNode>,
    by_id: HashMap<String, NodeIndex>,
    roots: Vec<NodeIndex>,
}

/// Lazily yields the children of one node.
///
/// A cursor is created fresh for every walk. Stopping early leaves the
/// remaining children unbuilt.
#[derive(Debug)]
pub struct ChildCursor {
    parent: NodeIndex,
    child_ids: Vec<String>,
    pos: usize,
}

impl ChildCursor {
    /// Build and return the next child node, skipping edges that would
    /// repeat an edge already on the ancestor path.
    pub fn next(&mut self, tree: &mut DependencyTree, source: &impl ChildSource) -> Option<NodeIndex> {
        while self.pos < self.child_ids.len() {
            let child_id = self.child_ids[self.pos].clone();
            self.pos += 1;

            let parent = &tree.nodes[self.parent];
            if edge_on_path(&parent.ancestors, &child_id) {
                continue;
            }

            let node_id = format!("{}{child_id}:", parent.node_id);
            if let Some(&existing) = tree.by_id.get(&node_id) {
                return Some(existing);
            }

            let is_circular = parent.ancestors.contains(&child_id);
            let installable = parent.installable && !source.is_skipped(&child_id);
            let depth = parent.depth + 1;
            let mut ancestors = parent.ancestors.clone();
            ancestors.push(child_id.clone());

            let index = tree.push(TreeNode {
                node_id,
                package_id: child_id,
                depth,
                installable,
                is_circular,
                ancestors,
                parent: Some(self.parent),
                children: Vec::new(),
            });
            tree.nodes[self.parent].children.push(index);
            return Some(index);
        }
        None
    }
}

/// Whether `last(path) -> child` already occurs as a consecutive pair on `path`.
fn edge_on_path(path: &[String], child: &str) -> bool {
    let Some(parent) = path.last() else {
        return false;
    };
    path.windows(2).any(|pair| pair[0] == *parent && pair[1] == child)
}

impl DependencyTree {
    fn push(&mut self, node: TreeNode) -> NodeIndex {
        let index = self.nodes.len();
        self.by_id.insert(node.node_id.clone(), index);
        self.nodes.push(node);
        index
    }

    /// Add a root node for `package_id`.
    pub fn add_root(&mut self, package_id: &str, source: &impl ChildSource) -> NodeIndex {
        let node_id = format!(":/:{package_id}:");
        if let Some(&existing) = self.by_id.get(&node_id) {
            return existing;
        }
        let index = self.push(TreeNode {
            node_id,
            package_id: package_id.to_string(),
            depth: 0,
            installable: !source.is_skipped(package_id),
            is_circular: false,
            ancestors: vec![package_id.to_string()],
            parent: None,
            children: Vec::new(),
        });
        self.roots.push(index);
        index
    }

    /// Fresh cursor over the children of `parent`.
    #[must_use]
    pub fn children(&self, parent: NodeIndex, source: &impl ChildSource) -> ChildCursor {
        ChildCursor {
            parent,
            child_ids: source.child_ids(&self.nodes[parent].package_id),
            pos: 0,
        }
    }

    /// Build the tree below `root_ids` breadth-first.
    ///
    /// Every position is expanded; the edge guard in [`ChildCursor::next`]
    /// bounds each path.
    #[must_use]
    pub fn build(root_ids: &[String], source: &impl ChildSource) -> Self {
        let mut tree = Self::default();
        for id in root_ids {
            tree.add_root(id, source);
        }
        let mut queue: VecDeque<NodeIndex> = tree.roots.iter().copied().collect();

        while let Some(index) = queue.pop_front() {
            let mut cursor = tree.children(index, source);
            loop {
                let fresh = tree.len();
                let Some(child) = cursor.next(&mut tree, source) else {
                    break;
                };
                if child >= fresh {
                    queue.push_back(child);
                }
            }
        }
        tree
    }

    /// Node at `index`.
    #[must_use]
    pub fn node(&self, index: NodeIndex) -> &TreeNode {
        &self.nodes[index]
    }

    /// Node by node id.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&TreeNode> {
        self.by_id.get(node_id).map(|&i| &self.nodes[i])
    }

    #[must_use]
    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    #[must_use]
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Package ids with at least one installable node.
    #[must_use]
    pub fn installable_package_ids(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|n| n.installable)
            .map(|n| n.package_id.clone())
            .collect()
    }
}
