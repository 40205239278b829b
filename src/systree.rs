//! System Tree (`spec.md` §6): a hierarchical name-to-object map.
//!
//! Grounded on `original_source/kernel/system_tree/system_tree_branch.h`'s
//! `ISystemTreeBranch` (`get_child`/`add_child`/`delete_child`/
//! `create_child`, collapsed here from its branch/leaf split into one
//! object trait since this crate doesn't need the distinction). `MemTree`
//! is a minimal in-crate implementation - just enough to exercise the
//! `\proc` tree and stdio-inheritance rules (`spec.md` §6), not a full
//! mem-FS (out of scope per `spec.md` Non-goals).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KResult, KernelError};
use crate::sync::SpinLock;

/// Anything that can live in the tree: a leaf (opaque data/handle) or a
/// branch (more children). `spec.md` only requires the four operations
/// below, so both roles share one trait.
pub trait TreeObject: Send + Sync {
    fn as_leaf_bytes(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A leaf containing a fixed, readable byte string - e.g. `\proc\<addr>\id`.
pub struct StringLeaf(pub String);

impl TreeObject for StringLeaf {
    fn as_leaf_bytes(&self) -> Option<Vec<u8>> {
        Some(self.0.as_bytes().to_vec())
    }
}

fn split_path(path: &str) -> KResult<Vec<&str>> {
    if path.is_empty() || !path.starts_with('\\') {
        return Err(KernelError::InvalidName);
    }
    Ok(path.trim_start_matches('\\').split('\\').filter(|s| !s.is_empty()).collect())
}

pub trait SystemTree {
    fn get_child(&self, path: &str) -> KResult<Arc<dyn TreeObject>>;
    fn add_child(&self, path: &str, object: Arc<dyn TreeObject>) -> KResult<()>;
    fn delete_child(&self, path: &str) -> KResult<()>;
    fn create_child(&self, path: &str) -> KResult<Arc<dyn TreeObject>>;
}

struct Node {
    object: Option<Arc<dyn TreeObject>>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn empty() -> Self {
        Node { object: None, children: BTreeMap::new() }
    }
}

/// An in-memory System Tree: nested maps keyed by path segment, each node
/// optionally holding an object.
pub struct MemTree {
    root: SpinLock<Node>,
}

impl MemTree {
    pub fn new() -> Self {
        MemTree { root: SpinLock::new(Node::empty()) }
    }

    fn find<'a>(node: &'a Node, segments: &[&str]) -> Option<&'a Node> {
        match segments.split_first() {
            None => Some(node),
            Some((head, rest)) => node.children.get(*head).and_then(|child| Self::find(child, rest)),
        }
    }

    fn find_mut<'a>(node: &'a mut Node, segments: &[&str], create: bool) -> Option<&'a mut Node> {
        match segments.split_first() {
            None => Some(node),
            Some((head, rest)) => {
                if create && !node.children.contains_key(*head) {
                    node.children.insert((*head).to_string(), Node::empty());
                }
                node.children.get_mut(*head).and_then(|child| Self::find_mut(child, rest, create))
            }
        }
    }
}

impl SystemTree for MemTree {
    fn get_child(&self, path: &str) -> KResult<Arc<dyn TreeObject>> {
        let segments = split_path(path)?;
        let root = self.root.lock();
        Self::find(&root, &segments).and_then(|n| n.object.clone()).ok_or(KernelError::NotFound)
    }

    fn add_child(&self, path: &str, object: Arc<dyn TreeObject>) -> KResult<()> {
        let segments = split_path(path)?;
        let mut root = self.root.lock();
        let node = Self::find_mut(&mut root, &segments, true).ok_or(KernelError::NotFound)?;
        if node.object.is_some() {
            return Err(KernelError::AlreadyExists);
        }
        node.object = Some(object);
        Ok(())
    }

    fn delete_child(&self, path: &str) -> KResult<()> {
        let segments = split_path(path)?;
        let (last, parent_segments) = segments.split_last().ok_or(KernelError::InvalidName)?;
        let mut root = self.root.lock();
        let parent = Self::find_mut(&mut root, parent_segments, false).ok_or(KernelError::NotFound)?;
        parent.children.remove(*last).map(|_| ()).ok_or(KernelError::NotFound)
    }

    fn create_child(&self, path: &str) -> KResult<Arc<dyn TreeObject>> {
        let segments = split_path(path)?;
        let mut root = self.root.lock();
        let node = Self::find_mut(&mut root, &segments, true).ok_or(KernelError::NotFound)?;
        if node.object.is_none() {
            node.object = Some(Arc::new(StringLeaf(String::new())) as Arc<dyn TreeObject>);
        }
        node.object.clone().ok_or(KernelError::Unknown)
    }
}

/// Inserts `\proc\<proc_ptr>\id` as a decimal string leaf, and - per
/// `spec.md` §6's process-tree rule - relinks any of the parent's
/// `stdin`/`stdout`/`stderr` leaves under the new process's own subtree.
pub fn install_process_leaves(
    tree: &dyn SystemTree,
    new_proc_ptr: u64,
    parent_proc_ptr: Option<u64>,
) -> KResult<()> {
    let base = alloc::format!("\\proc\\{:x}", new_proc_ptr);
    tree.add_child(&alloc::format!("{base}\\id"), Arc::new(StringLeaf(alloc::format!("{new_proc_ptr}"))))?;

    if let Some(parent_ptr) = parent_proc_ptr {
        for name in ["stdin", "stdout", "stderr"] {
            let parent_path = alloc::format!("\\proc\\{:x}\\{}", parent_ptr, name);
            if let Ok(leaf) = tree.get_child(&parent_path) {
                let _ = tree.add_child(&alloc::format!("{base}\\{}", name), leaf);
            }
        }
    }
    Ok(())
}
