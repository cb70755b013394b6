//! Materialized document trees.
//!
//! [`DocTreeCollector`] projects a flat [`Changeset`] into an immutable
//! [`DocTree`]. Nodes are `Arc`-shared: when a node's parent, idx, props and
//! children are all unchanged since the previous collect, the previous
//! `Arc<DocNode>` is returned again, so consumers can detect change with
//! `Arc::ptr_eq` instead of comparing whole subtrees.
//!
//! ```text
//!   collect #1            collect #2 (leaf b edited)
//!   root ─┬─ a            root' ─┬─ a        (same Arc)
//!         └─ p ── b             └─ p' ── b'  (rebuilt up the spine)
//! ```
//!
//! Only nodes reachable from the root appear in a tree. Created nodes that
//! were never positioned, or that hang off a missing parent, are dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::changeset::{Changeset, ROOT};

/// One node of a materialized tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocNode {
    pub id: String,
    /// `None` only for the root.
    pub parent: Option<String>,
    /// Fractional index among siblings; empty for the root.
    pub idx: String,
    pub props: BTreeMap<String, Value>,
    /// Children sorted by `idx`.
    pub children: Vec<Arc<DocNode>>,
}

impl DocNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    fn same_shape(&self, parent: &Option<String>, idx: &str, props: &BTreeMap<String, Value>, children: &[Arc<DocNode>]) -> bool {
        self.parent == *parent
            && self.idx == idx
            && self.props == *props
            && self.children.len() == children.len()
            && self
                .children
                .iter()
                .zip(children)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

/// An immutable snapshot of the document: the root node plus an index of
/// every reachable node by id.
#[derive(Debug, Clone)]
pub struct DocTree {
    root: Arc<DocNode>,
    nodes: HashMap<String, Arc<DocNode>>,
}

impl DocTree {
    /// Tree with only an empty root.
    pub fn empty() -> Arc<DocTree> {
        DocTreeCollector::new().collect(&Changeset::empty())
    }

    pub fn root(&self) -> &Arc<DocNode> {
        &self.root
    }

    /// Look up any reachable node, including the root.
    pub fn get(&self, id: &str) -> Option<&Arc<DocNode>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of reachable nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    pub fn children(&self) -> &[Arc<DocNode>] {
        &self.root.children
    }
}

impl Serialize for DocTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.root.serialize(serializer)
    }
}

struct WorkingNode {
    parent: Option<String>,
    idx: String,
    props: BTreeMap<String, Value>,
    positioned: bool,
    /// (idx, id) of positioned children
    children: Vec<(String, String)>,
}

impl WorkingNode {
    fn new() -> Self {
        Self {
            parent: None,
            idx: String::new(),
            props: BTreeMap::new(),
            positioned: false,
            children: Vec::new(),
        }
    }
}

/// Long-lived projector that keeps the previous tree's nodes for reuse.
#[derive(Debug, Default)]
pub struct DocTreeCollector {
    cache: HashMap<String, Arc<DocNode>>,
    last: Option<Arc<DocTree>>,
}

impl DocTreeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot projection without node reuse.
    pub fn collect_once(cs: &Changeset) -> Arc<DocTree> {
        Self::new().collect(cs)
    }

    /// Project `cs`, reusing every node that is unchanged since the last call.
    pub fn collect(&mut self, cs: &Changeset) -> Arc<DocTree> {
        let mut working = prepare_working_nodes(cs);

        // Post-order over nodes reachable from the root.
        let mut built: HashMap<String, Arc<DocNode>> = HashMap::with_capacity(working.len());
        let mut stack: Vec<(String, bool)> = vec![(ROOT.to_string(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if !expanded {
                let Some(node) = working.get(&id) else {
                    continue;
                };
                let kids: Vec<String> = node.children.iter().map(|(_, child)| child.clone()).collect();
                stack.push((id, true));
                stack.extend(kids.into_iter().rev().map(|child| (child, false)));
                continue;
            }

            let Some(node) = working.remove(&id) else {
                continue;
            };
            let children: Vec<Arc<DocNode>> = node
                .children
                .iter()
                .filter_map(|(_, child)| built.get(child).cloned())
                .collect();

            let reused = self
                .cache
                .get(&id)
                .filter(|prev| prev.same_shape(&node.parent, &node.idx, &node.props, &children))
                .cloned();
            let doc_node = reused.unwrap_or_else(|| {
                Arc::new(DocNode {
                    id: id.clone(),
                    parent: node.parent,
                    idx: node.idx,
                    props: node.props,
                    children,
                })
            });
            built.insert(id, doc_node);
        }

        let root = match built.get(ROOT) {
            Some(root) => Arc::clone(root),
            None => Arc::new(DocNode {
                id: ROOT.to_string(),
                parent: None,
                idx: String::new(),
                props: BTreeMap::new(),
                children: Vec::new(),
            }),
        };

        let tree = match &self.last {
            Some(last) if Arc::ptr_eq(&last.root, &root) => Arc::clone(last),
            _ => Arc::new(DocTree {
                root,
                nodes: built.clone(),
            }),
        };

        // The cache holds exactly the nodes of the latest tree.
        self.cache = built;
        self.last = Some(Arc::clone(&tree));
        tree
    }
}

fn prepare_working_nodes(cs: &Changeset) -> HashMap<String, WorkingNode> {
    let mut working: HashMap<String, WorkingNode> = HashMap::with_capacity(cs.create.len() + 1);
    for id in &cs.create {
        working.insert(id.clone(), WorkingNode::new());
    }
    for id in &cs.delete {
        working.remove(id);
    }
    let mut root = WorkingNode::new();
    root.positioned = true;
    working.insert(ROOT.to_string(), root);

    for write in &cs.property {
        if let Some(node) = working.get_mut(write.node()) {
            node.props.insert(write.key().to_string(), write.value().clone());
        }
    }

    // Last position per child wins.
    let mut positions: HashMap<&str, (&str, &str)> = HashMap::new();
    for write in &cs.position {
        if write.child() == ROOT || !working.contains_key(write.child()) {
            continue;
        }
        positions.insert(write.child(), (write.parent(), write.idx()));
    }

    for (&child, &(parent, idx)) in &positions {
        if let Some(node) = working.get_mut(child) {
            node.parent = Some(parent.to_string());
            node.idx = idx.to_string();
            node.positioned = true;
        }
        if let Some(parent_node) = working.get_mut(parent) {
            parent_node.children.push((idx.to_string(), child.to_string()));
        }
    }

    working.retain(|_, node| node.positioned);
    for node in working.values_mut() {
        node.children.sort();
    }
    working
}
