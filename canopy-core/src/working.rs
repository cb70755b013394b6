//! Mutable merge engine over changesets.
//!
//! A [`WorkingChangeset`] accumulates changesets into four insertion-ordered
//! maps and can project its state back into a [`Changeset`] at any time.
//! Every entry carries the write-version (`meta`) it was written at, which
//! drives incremental export ([`WorkingChangeset::collect`] with `after`) and
//! garbage collection ([`WorkingChangeset::remove_changes_before`]).
//!
//! Two apply modes:
//!
//! ```text
//!   change()                 speculative: accept everything that names a
//!                            real child, keep idx collisions
//!   change_authoritative()   strict: reject cycles, unknown parents and
//!                            writes to unknown nodes, rewrite colliding idx
//! ```
//!
//! Apply order inside one changeset is fixed: paired creates, deletes,
//! properties, then the remaining positions. Rejected writes are dropped
//! individually and logged at debug level; they never fail the changeset.

use std::collections::{HashMap, HashSet};
use std::fmt;

use indexmap::{IndexMap, IndexSet};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::Value;

use crate::changeset::{Changeset, PositionWrite, PropertyWrite, ROOT};
use crate::fracidx;

/// Write-version attached to every entry. `0` is the base layer.
pub type Meta = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    parent: String,
    idx: String,
    meta: Meta,
}

/// Accumulated document state.
pub struct WorkingChangeset {
    create: IndexMap<String, Meta>,
    delete: IndexMap<String, Meta>,
    property: IndexMap<String, IndexMap<String, (Value, Meta)>>,
    position: IndexMap<String, Position>,
    /// parent -> children currently positioned under it
    children: HashMap<String, IndexSet<String>>,
    rng: Box<dyn RngCore + Send>,
}

impl fmt::Debug for WorkingChangeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingChangeset")
            .field("create", &self.create)
            .field("delete", &self.delete)
            .field("property", &self.property)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl Default for WorkingChangeset {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkingChangeset {
    /// Empty engine with an entropy-seeded RNG for idx conflict resolution.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Empty engine drawing idx jitter from `rng`.
    pub fn with_rng<R: RngCore + Send + 'static>(rng: R) -> Self {
        Self {
            create: IndexMap::new(),
            delete: IndexMap::new(),
            property: IndexMap::new(),
            position: IndexMap::new(),
            children: HashMap::new(),
            rng: Box::new(rng),
        }
    }

    /// Seed the engine with a persisted changeset at version 0.
    pub fn seeded(mut self, base: &Changeset) -> Self {
        self.change(base, 0);
        self
    }

    /// Apply `cs` speculatively at write-version `meta`.
    pub fn change(&mut self, cs: &Changeset, meta: Meta) {
        self.apply(cs, meta, false);
    }

    /// Apply `cs` with full validation at write-version `meta`.
    pub fn change_authoritative(&mut self, cs: &Changeset, meta: Meta) {
        self.apply(cs, meta, true);
    }

    /// Project entries written after `after` (all entries for `None`).
    pub fn collect(&self, after: Option<Meta>) -> Changeset {
        let keep = move |meta: Meta| after.map_or(true, |after| meta > after);

        let create = self
            .create
            .iter()
            .filter(|(_, meta)| keep(**meta))
            .map(|(id, _)| id.clone())
            .collect();
        let delete = self
            .delete
            .iter()
            .filter(|(_, meta)| keep(**meta))
            .map(|(id, _)| id.clone())
            .collect();
        let property = self
            .property
            .iter()
            .flat_map(|(id, props)| {
                props
                    .iter()
                    .filter(move |(_, (_, meta))| keep(*meta))
                    .map(move |(key, (value, _))| PropertyWrite(id.clone(), key.clone(), value.clone()))
            })
            .collect();
        let position = self
            .position
            .iter()
            .filter(|(_, pos)| keep(pos.meta))
            .map(|(child, pos)| PositionWrite(child.clone(), pos.parent.clone(), pos.idx.clone()))
            .collect();

        Changeset {
            create,
            delete,
            property,
            position,
            ..Changeset::default()
        }
    }

    /// Drop every entry written strictly before `meta`.
    pub fn remove_changes_before(&mut self, meta: Meta) {
        self.create.retain(|_, m| *m >= meta);
        self.delete.retain(|_, m| *m >= meta);
        self.property.retain(|_, props| {
            props.retain(|_, (_, m)| *m >= meta);
            !props.is_empty()
        });

        let stale: Vec<String> = self
            .position
            .iter()
            .filter(|(_, pos)| pos.meta < meta)
            .map(|(child, _)| child.clone())
            .collect();
        for child in stale {
            self.remove_position(&child);
        }
    }

    pub fn clear(&mut self) {
        self.create.clear();
        self.delete.clear();
        self.property.clear();
        self.position.clear();
        self.children.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.delete.is_empty()
            && self.property.is_empty()
            && self.position.is_empty()
    }

    /// Number of entries `collect(None)` would return.
    pub fn size(&self) -> usize {
        let props: usize = self.property.values().map(IndexMap::len).sum();
        self.create.len() + self.delete.len() + props + self.position.len()
    }

    fn apply(&mut self, cs: &Changeset, meta: Meta, authoritative: bool) {
        let creates: HashSet<&str> = cs.create.iter().map(String::as_str).collect();

        // Last position entry per created node pairs with its create.
        let mut create_positions: HashMap<&str, (&str, &str)> = HashMap::new();
        for write in &cs.position {
            if creates.contains(write.child()) {
                create_positions.insert(write.child(), (write.parent(), write.idx()));
            }
        }

        let paired: Vec<(&str, &str, &str)> = cs
            .create
            .iter()
            .filter_map(|obj| match create_positions.get(obj.as_str()) {
                Some(&(parent, idx)) => Some((obj.as_str(), parent, idx)),
                None => {
                    log::debug!("create {obj}: dropped, no position in changeset");
                    None
                }
            })
            .collect();
        for (obj, parent, idx) in parents_first(paired) {
            self.set_create(obj, parent, idx, meta, authoritative);
        }
        for obj in &cs.delete {
            self.set_delete(obj, meta);
        }
        for write in &cs.property {
            self.set_property(write, meta, authoritative);
        }
        for write in &cs.position {
            if creates.contains(write.child()) {
                continue;
            }
            self.set_position(write.child(), write.parent(), write.idx(), meta, authoritative);
        }
    }

    fn set_create(&mut self, obj: &str, parent: &str, idx: &str, meta: Meta, authoritative: bool) {
        if obj == ROOT {
            log::debug!("create {obj}: dropped, root is implicit");
            return;
        }
        if self.delete.contains_key(obj) {
            log::debug!("create {obj}: dropped, already deleted");
            return;
        }
        let idx = if authoritative {
            match self.validate_position(obj, parent, idx) {
                Some(idx) => idx,
                None => return,
            }
        } else {
            idx.to_string()
        };

        self.create.insert(obj.to_string(), meta);
        self.write_position(obj, parent, idx, meta);
    }

    fn set_delete(&mut self, obj: &str, meta: Meta) {
        if obj == ROOT {
            log::debug!("delete {obj}: dropped, root cannot be deleted");
            return;
        }

        // Pre-order walk; children are visited in position-map order.
        let mut stack = vec![obj.to_string()];
        while let Some(id) = stack.pop() {
            if self.delete.contains_key(&id) {
                log::debug!("delete {id}: already deleted");
                continue;
            }

            self.delete.insert(id.clone(), meta);
            self.create.shift_remove(&id);
            self.property.shift_remove(&id);
            self.remove_position(&id);

            let mut kids: Vec<String> = self
                .children
                .remove(&id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            kids.sort_by_key(|kid| self.position.get_index_of(kid));
            stack.extend(kids.into_iter().rev());
        }
    }

    fn set_property(&mut self, write: &PropertyWrite, meta: Meta, authoritative: bool) {
        let obj = write.node();
        if authoritative && obj != ROOT && !self.create.contains_key(obj) {
            log::debug!("property {obj}.{}: dropped, unknown node", write.key());
            return;
        }
        // Rewritten entries move to the end so export follows write order.
        let mut props = self.property.shift_remove(obj).unwrap_or_default();
        props.shift_remove(write.key());
        props.insert(write.key().to_string(), (write.value().clone(), meta));
        self.property.insert(obj.to_string(), props);
    }

    fn set_position(&mut self, child: &str, parent: &str, idx: &str, meta: Meta, authoritative: bool) {
        if child == ROOT {
            log::debug!("position {child}: dropped, root cannot be a child");
            return;
        }
        if self.delete.contains_key(child) {
            log::debug!("position {child}: dropped, node deleted");
            return;
        }
        let idx = if authoritative {
            if !self.create.contains_key(child) {
                log::debug!("position {child}: dropped, unknown node");
                return;
            }
            match self.validate_position(child, parent, idx) {
                Some(idx) => idx,
                None => return,
            }
        } else {
            idx.to_string()
        };

        self.write_position(child, parent, idx, meta);
    }

    /// Authoritative checks shared by creates and moves. Returns the idx to
    /// store, or `None` when the write must be dropped.
    fn validate_position(&mut self, child: &str, parent: &str, idx: &str) -> Option<String> {
        if self.would_cycle(child, parent) {
            log::debug!("position {child} -> {parent}: dropped, would create a cycle");
            return None;
        }
        if parent != ROOT && !self.position.contains_key(parent) {
            log::debug!("position {child} -> {parent}: dropped, unknown parent");
            return None;
        }
        Some(self.resolve_idx_collision(child, parent, idx))
    }

    fn would_cycle(&self, child: &str, parent: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut cursor = parent;
        loop {
            if cursor == child {
                return true;
            }
            if !seen.insert(cursor) {
                // Pre-existing loop in speculative state; refuse to extend it.
                return true;
            }
            match self.position.get(cursor) {
                Some(pos) => cursor = pos.parent.as_str(),
                None => return false,
            }
        }
    }

    fn resolve_idx_collision(&mut self, child: &str, parent: &str, idx: &str) -> String {
        let mut siblings: Vec<&str> = self
            .children
            .get(parent)
            .into_iter()
            .flatten()
            .filter(|sib| sib.as_str() != child)
            .filter_map(|sib| self.position.get(sib))
            .map(|pos| pos.idx.as_str())
            .collect();
        siblings.sort_unstable();

        if siblings.binary_search(&idx).is_err() {
            return idx.to_string();
        }
        let next = siblings.partition_point(|sib| *sib <= idx);
        let after = siblings.get(next).copied().unwrap_or("");
        let resolved = fracidx::between(&mut *self.rng, idx, after);

        log::debug!("position {child} -> {parent}: idx {idx:?} collides, using {resolved:?}");
        resolved
    }

    fn write_position(&mut self, child: &str, parent: &str, idx: String, meta: Meta) {
        // A move goes after every earlier write, as in `set_property`.
        let previous = self.position.shift_remove(child);
        self.position.insert(
            child.to_string(),
            Position {
                parent: parent.to_string(),
                idx,
                meta,
            },
        );
        if let Some(previous) = previous {
            if previous.parent != parent {
                self.unlink_child(&previous.parent, child);
            }
        }
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
    }

    fn remove_position(&mut self, child: &str) {
        if let Some(pos) = self.position.shift_remove(child) {
            self.unlink_child(&pos.parent, child);
        }
    }

    fn unlink_child(&mut self, parent: &str, child: &str) {
        if let Some(set) = self.children.get_mut(parent) {
            set.shift_remove(child);
            if set.is_empty() {
                self.children.remove(parent);
            }
        }
    }
}

/// Order paired creates so a node created under another new node comes
/// after it. Creates that only lead to each other keep their order and are
/// left to cycle validation.
fn parents_first<'a>(mut pending: Vec<(&'a str, &'a str, &'a str)>) -> Vec<(&'a str, &'a str, &'a str)> {
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let waiting: HashSet<&str> = pending.iter().map(|(obj, _, _)| *obj).collect();
        let (ready, blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|(obj, parent, _)| parent == obj || !waiting.contains(parent));
        if ready.is_empty() {
            ordered.extend(blocked);
            break;
        }
        ordered.extend(ready);
        pending = blocked;
    }
    ordered
}

/// Speculatively merge the full state of each engine, in order, into one
/// changeset. Used to overlay pending local edits on a server mirror.
pub fn collect_working_changesets<'a, I>(engines: I) -> Changeset
where
    I: IntoIterator<Item = &'a WorkingChangeset>,
{
    // Speculative apply never draws from the rng.
    let mut merged = WorkingChangeset::with_rng(StdRng::seed_from_u64(0));
    for engine in engines {
        merged.change(&engine.collect(None), 0);
    }
    merged.collect(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use serde_json::json;

    fn zero_rng() -> StepRng {
        StepRng::new(0, 0)
    }

    fn engine(base: Changeset) -> WorkingChangeset {
        WorkingChangeset::with_rng(zero_rng()).seeded(&base)
    }

    fn apply_all(base: Changeset, changes: &[Changeset], authoritative: bool) -> Changeset {
        let mut w = engine(base);
        for cs in changes {
            if authoritative {
                w.change_authoritative(cs, 0);
            } else {
                w.change(cs, 0);
            }
        }
        w.collect(None)
    }

    fn both_modes(base: Changeset, changes: &[Changeset], expected: Changeset) {
        assert_eq!(apply_all(base.clone(), changes, false), expected, "speculative");
        assert_eq!(apply_all(base, changes, true), expected, "authoritative");
    }

    fn cs() -> Changeset {
        Changeset::empty()
    }

    #[test]
    fn test_rejects_direct_cycle() {
        let base = cs()
            .with_create(["N1", "N2"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, "B");
        let changes = [
            cs().with_position("N1", "N2", "A").with_property("N1", "foo", "bar"),
            cs().with_position("N2", "N1", "A").with_property("N2", "foo", "bar"),
        ];
        let expected = cs()
            .with_create(["N1", "N2"])
            .with_property("N1", "foo", "bar")
            .with_property("N2", "foo", "bar")
            .with_position("N2", ROOT, "B")
            .with_position("N1", "N2", "A");
        assert_eq!(apply_all(base, &changes, true), expected);
    }

    #[test]
    fn test_rejects_indirect_cycle() {
        let base = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", "N1", "A")
            .with_position("N3", "N2", "A");
        let change = cs()
            .with_create(["N4"])
            .with_position("N1", "N3", "A")
            .with_position("N4", ROOT, "Z");
        let expected = cs()
            .with_create(["N1", "N2", "N3", "N4"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", "N1", "A")
            .with_position("N3", "N2", "A")
            .with_position("N4", ROOT, "Z");
        assert_eq!(apply_all(base, &[change], true), expected);
    }

    #[test]
    fn test_rejects_self_parent() {
        let base = cs().with_create(["N1"]).with_position("N1", ROOT, "A");
        let change = cs().with_position("N1", "N1", "A");
        assert_eq!(apply_all(base.clone(), &[change], true), base);
    }

    #[test]
    fn test_fixes_colliding_idx_with_no_after() {
        let base = cs()
            .with_create(["N1", "N2"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, "B");
        let change = cs().with_position("N2", ROOT, "A");
        let expected = cs()
            .with_create(["N1", "N2"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, fracidx::between(&mut zero_rng(), "A", ""));
        assert_eq!(apply_all(base, &[change], true), expected);
    }

    #[test]
    fn test_fixes_colliding_idx_with_after() {
        let base = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, "B")
            .with_position("N3", ROOT, "O");
        let change = cs().with_position("N2", ROOT, "A");
        let expected = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N1", ROOT, "A")
            .with_position("N3", ROOT, "O")
            .with_position("N2", ROOT, fracidx::between(&mut zero_rng(), "A", "O"));
        assert_eq!(apply_all(base, &[change], true), expected);
    }

    #[test]
    fn test_speculative_keeps_colliding_idx() {
        let base = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, "B")
            .with_position("N3", ROOT, "O");
        let change = cs().with_position("N2", ROOT, "A");
        let expected = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N1", ROOT, "A")
            .with_position("N3", ROOT, "O")
            .with_position("N2", ROOT, "A");
        assert_eq!(apply_all(base, &[change], false), expected);
    }

    fn ordered_base() -> Changeset {
        cs().with_create(["N1", "N2", "N3"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, "B")
            .with_position("N3", ROOT, "Q")
    }

    #[test]
    fn test_positions_applied_in_order_with_conflict() {
        let change = cs()
            .with_position("N2", ROOT, "A")
            .with_position("N1", ROOT, "B");
        let expected = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N3", ROOT, "Q")
            .with_position("N2", ROOT, "I")
            .with_position("N1", ROOT, "B");
        assert_eq!(apply_all(ordered_base(), &[change], true), expected);
    }

    #[test]
    fn test_positions_applied_in_order_without_conflict() {
        let change = cs()
            .with_position("N1", ROOT, "Z")
            .with_position("N2", ROOT, "A")
            .with_position("N1", ROOT, "B");
        let expected = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N3", ROOT, "Q")
            .with_position("N2", ROOT, "A")
            .with_position("N1", ROOT, "B");
        assert_eq!(apply_all(ordered_base(), &[change], true), expected);
    }

    #[test]
    fn test_fixes_idx_in_create_position() {
        let base = cs().with_create(["N1"]).with_position("N1", ROOT, "A");
        let change = cs().with_create(["N2"]).with_position("N2", ROOT, "A");
        let expected = cs()
            .with_create(["N1", "N2"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, fracidx::between(&mut zero_rng(), "A", ""));
        assert_eq!(apply_all(base, &[change], true), expected);
    }

    #[test]
    fn test_deletes_recursively() {
        let base = cs()
            .with_create(["N1", "N2", "N3"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", "N1", "A")
            .with_position("N3", "N2", "A");
        let change = cs().with_delete(["N1"]);
        both_modes(base, &[change], cs().with_delete(["N1", "N2", "N3"]));
    }

    #[test]
    fn test_delete_visits_siblings_in_order() {
        let base = cs()
            .with_create(["P", "A", "B", "C"])
            .with_position("P", ROOT, "A")
            .with_position("A", "P", "A")
            .with_position("B", "P", "B")
            .with_position("C", "A", "A");
        let change = cs().with_delete(["P"]);
        both_modes(base, &[change], cs().with_delete(["P", "A", "C", "B"]));
    }

    #[test]
    fn test_delete_drops_properties() {
        let base = cs()
            .with_create(["N1"])
            .with_position("N1", ROOT, "A")
            .with_property("N1", "title", "x");
        both_modes(base, &[cs().with_delete(["N1"])], cs().with_delete(["N1"]));
    }

    #[test]
    fn test_delete_root_is_ignored() {
        let base = cs().with_create(["N1"]).with_position("N1", ROOT, "A");
        both_modes(base.clone(), &[cs().with_delete([ROOT])], base);
    }

    #[test]
    fn test_rejects_authoritative_move_to_missing_parent() {
        let base = cs().with_create(["N1"]).with_position("N1", ROOT, "A");
        let change = cs().with_position("N1", "non-existent", "A");
        assert_eq!(apply_all(base.clone(), &[change], true), base);
    }

    #[test]
    fn test_speculative_move_to_missing_parent() {
        let base = cs().with_create(["N1"]).with_position("N1", ROOT, "A");
        let change = cs().with_position("N1", "non-existent", "A");
        let expected = cs().with_create(["N1"]).with_position("N1", "non-existent", "A");
        assert_eq!(apply_all(base, &[change], false), expected);
    }

    #[test]
    fn test_rejects_create_without_position() {
        both_modes(cs(), &[cs().with_create(["N1"])], cs());
    }

    #[test]
    fn test_rejects_authoritative_create_with_missing_parent() {
        let change = cs().with_create(["N1"]).with_position("N1", "non-existent", "A");
        assert_eq!(apply_all(cs(), &[change], true), cs());
    }

    #[test]
    fn test_speculative_create_with_missing_parent() {
        let change = cs().with_create(["N1"]).with_position("N1", "non-existent", "A");
        assert_eq!(apply_all(cs(), &[change.clone()], false), change);
    }

    #[test]
    fn test_authoritative_rejects_property_on_missing_node() {
        let change = cs().with_property("N1", "foo", "bar");
        assert_eq!(apply_all(cs(), &[change], true), cs());
    }

    #[test]
    fn test_speculative_accepts_property_on_missing_node() {
        let change = cs().with_property("N1", "foo", "bar");
        assert_eq!(apply_all(cs(), &[change.clone()], false), change);
    }

    #[test]
    fn test_accepts_property_on_root() {
        let change = cs().with_property(ROOT, "foo", "bar");
        both_modes(cs(), &[change.clone()], change);
    }

    #[test]
    fn test_root_cannot_be_positioned() {
        let base = cs().with_create(["N1"]).with_position("N1", ROOT, "A");
        let change = cs().with_position(ROOT, "N1", "A");
        both_modes(base.clone(), &[change], base);
    }

    #[test]
    fn test_deleted_node_cannot_be_recreated_or_moved() {
        let base = cs()
            .with_create(["N1", "N2"])
            .with_position("N1", ROOT, "A")
            .with_position("N2", ROOT, "B");
        let changes = [
            cs().with_delete(["N1"]),
            cs().with_create(["N1"]).with_position("N1", ROOT, "C"),
            cs().with_position("N1", "N2", "A"),
        ];
        let expected = cs()
            .with_create(["N2"])
            .with_delete(["N1"])
            .with_position("N2", ROOT, "B");
        both_modes(base, &changes, expected);
    }

    #[test]
    fn test_later_property_write_wins() {
        let base = cs().with_create(["N1"]).with_position("N1", ROOT, "A");
        let change = cs()
            .with_property("N1", "k", 1)
            .with_property("N1", "k", json!({"v": 2}));
        let mut w = engine(base);
        w.change_authoritative(&change, 1);
        assert_eq!(w.collect(Some(0)), cs().with_property("N1", "k", json!({"v": 2})));
    }

    #[test]
    fn test_collect_after_returns_newer_entries() {
        let mut w = engine(cs().with_create(["N1"]).with_position("N1", ROOT, "A"));
        w.change(&cs().with_property("N1", "a", 1), 1);
        w.change(&cs().with_create(["N2"]).with_position("N2", ROOT, "B"), 2);

        assert_eq!(w.collect(Some(2)), cs());
        assert_eq!(
            w.collect(Some(1)),
            cs().with_create(["N2"]).with_position("N2", ROOT, "B")
        );
        assert_eq!(w.collect(Some(0)).size(), 3);
        assert_eq!(w.collect(None).size(), 5);
    }

    #[test]
    fn test_remove_changes_before() {
        let mut w = engine(cs().with_create(["N1"]).with_position("N1", ROOT, "A"));
        w.change(&cs().with_property("N1", "a", 1), 1);
        w.change(&cs().with_property("N1", "b", 2), 2);

        w.remove_changes_before(2);
        assert_eq!(w.collect(None), cs().with_property("N1", "b", 2));
        assert_eq!(w.size(), 1);

        w.remove_changes_before(3);
        assert!(w.is_empty());
        assert_eq!(w.size(), 0);
    }

    #[test]
    fn test_remove_changes_before_keeps_children_index() {
        let mut w = engine(
            cs().with_create(["N1", "N2"])
                .with_position("N1", ROOT, "A")
                .with_position("N2", "N1", "A"),
        );
        w.change(&cs().with_position("N3", "N1", "B"), 1);
        w.remove_changes_before(1);
        // N2's position is gone, so deleting N1 only cascades to N3.
        w.change(&cs().with_delete(["N1"]), 2);
        assert_eq!(w.collect(None), cs().with_delete(["N1", "N3"]));
    }

    #[test]
    fn test_clear() {
        let mut w = engine(cs().with_create(["N1"]).with_position("N1", ROOT, "A"));
        assert!(!w.is_empty());
        w.clear();
        assert!(w.is_empty());
        assert_eq!(w.collect(None), cs());
    }

    #[test]
    fn test_collect_working_changesets_overlays_in_order() {
        let base = engine(
            cs().with_create(["N1"])
                .with_position("N1", ROOT, "A")
                .with_property("N1", "title", "old"),
        );
        let mut local = WorkingChangeset::with_rng(zero_rng());
        local.change(&cs().with_property("N1", "title", "new"), 1);
        local.change(&cs().with_create(["N2"]).with_position("N2", "N1", "A"), 2);

        let merged = collect_working_changesets([&base, &local]);
        assert_eq!(
            merged,
            cs().with_create(["N1", "N2"])
                .with_property("N1", "title", "new")
                .with_position("N1", ROOT, "A")
                .with_position("N2", "N1", "A")
        );
    }

    #[test]
    fn test_rewrites_export_in_write_order() {
        let mut w = WorkingChangeset::with_rng(zero_rng());
        w.change(&cs().with_create(["A"]).with_position("A", ROOT, "A"), 1);
        w.change(&cs().with_property("A", "k", 1).with_property("A", "j", 1), 1);
        w.change(&cs().with_create(["B"]).with_position("B", ROOT, "B"), 1);
        w.change(&cs().with_position("A", "B", "A").with_property("A", "k", 2), 1);

        let out = w.collect(Some(0));
        assert_eq!(
            out.position,
            cs().with_position("B", ROOT, "B").with_position("A", "B", "A").position
        );
        assert_eq!(
            out.property,
            cs().with_property("A", "j", 1).with_property("A", "k", 2).property
        );
    }

    #[test]
    fn test_creates_under_new_parent_in_any_order() {
        let change = cs()
            .with_create(["C", "A", "B"])
            .with_position("B", ROOT, "B")
            .with_position("A", "B", "A")
            .with_position("C", "A", "A");
        let state = apply_all(cs(), &[change], true);
        assert_eq!(state.create, ["B", "A", "C"]);
        assert_eq!(state.position.len(), 3);
    }

    #[test]
    fn test_rejects_cycle_between_new_nodes() {
        let change = cs()
            .with_create(["A", "B"])
            .with_position("A", "B", "A")
            .with_position("B", "A", "A");
        assert_eq!(apply_all(cs(), &[change], true), cs());
    }
}
