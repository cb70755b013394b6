//! Resolving user-facing insert positions to `(parent, idx)` pairs.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::changeset::ROOT;
use crate::fracidx;
use crate::tree::{DocNode, DocTree};

/// Where a new or moved node should land, relative to the current tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InsertPosition {
    FirstChild { parent: String },
    LastChild { parent: String },
    Before { sibling: String },
    After { sibling: String },
    /// Use the given parent and idx verbatim.
    Exact { parent: String, idx: String },
}

impl InsertPosition {
    pub fn first_child(parent: impl Into<String>) -> Self {
        Self::FirstChild { parent: parent.into() }
    }

    pub fn last_child(parent: impl Into<String>) -> Self {
        Self::LastChild { parent: parent.into() }
    }

    pub fn before(sibling: impl Into<String>) -> Self {
        Self::Before { sibling: sibling.into() }
    }

    pub fn after(sibling: impl Into<String>) -> Self {
        Self::After { sibling: sibling.into() }
    }

    /// Resolve against `tree`. Positions naming nodes that are not in the
    /// tree fall back to the first child of the root.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R, tree: &DocTree) -> (String, String) {
        match self.try_resolve(rng, tree) {
            Some(resolved) => resolved,
            None => {
                log::warn!("invalid insert position {self:?}, inserting at start of root");
                let first = tree.children().first().map_or("", |n| n.idx.as_str());
                (ROOT.to_string(), fracidx::between(rng, "", first))
            }
        }
    }

    fn try_resolve<R: Rng + ?Sized>(&self, rng: &mut R, tree: &DocTree) -> Option<(String, String)> {
        match self {
            InsertPosition::FirstChild { parent } => {
                let parent = tree.get(parent)?;
                let first = parent.children.first().map_or("", |n| n.idx.as_str());
                Some((parent.id.clone(), fracidx::between(rng, "", first)))
            }
            InsertPosition::LastChild { parent } => {
                let parent = tree.get(parent)?;
                let last = parent.children.last().map_or("", |n| n.idx.as_str());
                Some((parent.id.clone(), fracidx::between(rng, last, "")))
            }
            InsertPosition::Before { sibling } => {
                let (parent, node) = sibling_and_parent(tree, sibling)?;
                let before = parent
                    .children
                    .iter()
                    .map(|n| n.idx.as_str())
                    .filter(|idx| *idx < node.idx.as_str())
                    .last()
                    .unwrap_or("");
                Some((parent.id.clone(), fracidx::between(rng, before, &node.idx)))
            }
            InsertPosition::After { sibling } => {
                let (parent, node) = sibling_and_parent(tree, sibling)?;
                let after = parent
                    .children
                    .iter()
                    .map(|n| n.idx.as_str())
                    .find(|idx| *idx > node.idx.as_str())
                    .unwrap_or("");
                Some((parent.id.clone(), fracidx::between(rng, &node.idx, after)))
            }
            InsertPosition::Exact { parent, idx } => Some((parent.clone(), idx.clone())),
        }
    }
}

fn sibling_and_parent<'a>(tree: &'a DocTree, sibling: &str) -> Option<(&'a DocNode, &'a DocNode)> {
    let node = tree.get(sibling)?;
    let parent = tree.get(node.parent.as_deref()?)?;
    Some((parent.as_ref(), node.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Changeset;
    use crate::tree::DocTreeCollector;
    use rand::rngs::mock::StepRng;
    use std::sync::Arc;

    fn zero() -> StepRng {
        StepRng::new(0, 0)
    }

    fn basic_tree() -> Arc<DocTree> {
        DocTreeCollector::collect_once(
            &Changeset::empty()
                .with_create(["parent", "childA", "childB"])
                .with_position("parent", ROOT, "A")
                .with_position("childA", "parent", "A")
                .with_position("childB", "parent", "B"),
        )
    }

    fn resolve(position: InsertPosition) -> (String, String) {
        position.resolve(&mut zero(), &basic_tree())
    }

    fn pair(parent: &str, idx: &str) -> (String, String) {
        (parent.to_string(), idx.to_string())
    }

    #[test]
    fn test_first_child_with_existing() {
        assert_eq!(resolve(InsertPosition::first_child("parent")), pair("parent", "0"));
    }

    #[test]
    fn test_first_child_of_empty() {
        assert_eq!(resolve(InsertPosition::first_child("childA")), pair("childA", "O"));
    }

    #[test]
    fn test_first_child_of_missing_falls_back_to_root() {
        assert_eq!(resolve(InsertPosition::first_child("nonexistent")), pair(ROOT, "0"));
    }

    #[test]
    fn test_last_child() {
        let (parent, idx) = resolve(InsertPosition::last_child("parent"));
        assert_eq!(parent, "parent");
        assert!(idx.as_str() > "B");
    }

    #[test]
    fn test_before_and_after_sibling() {
        let (parent, idx) = resolve(InsertPosition::before("childB"));
        assert_eq!(parent, "parent");
        assert!("A" < idx.as_str() && idx.as_str() < "B", "{idx:?}");

        let (parent, idx) = resolve(InsertPosition::after("childA"));
        assert_eq!(parent, "parent");
        assert!("A" < idx.as_str() && idx.as_str() < "B", "{idx:?}");

        let (_, idx) = resolve(InsertPosition::before("childA"));
        assert!(idx.as_str() < "A");
    }

    #[test]
    fn test_before_root_falls_back() {
        assert_eq!(resolve(InsertPosition::before(ROOT)), pair(ROOT, "0"));
    }

    #[test]
    fn test_exact_is_verbatim() {
        let position = InsertPosition::Exact {
            parent: "anywhere".into(),
            idx: "zz".into(),
        };
        assert_eq!(resolve(position), pair("anywhere", "zz"));
    }

    #[test]
    fn test_json_tag() {
        let value = serde_json::to_value(InsertPosition::first_child("p")).unwrap();
        assert_eq!(value, serde_json::json!({"type": "firstChild", "parent": "p"}));
    }
}
