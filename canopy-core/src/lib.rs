//! Canopy core: the collaborative tree data model.
//!
//! ```text
//!   fracidx     sibling ordering keys
//!      ↑
//!   changeset   wire/storage batches of mutations
//!      ↑
//!   working     merge engine (speculative / authoritative apply)
//!      ↑
//!   tree        immutable, structurally shared projection
//!      ↑
//!   insert      user-facing positions resolved against a tree
//! ```
//!
//! Nothing here does I/O; the sync layer lives in `canopy-collab`.

pub mod changeset;
pub mod fracidx;
pub mod insert;
pub mod tree;
pub mod working;

pub use changeset::{Changeset, ChangesetError, PositionWrite, PropertyWrite, Schema, ROOT};
pub use insert::InsertPosition;
pub use tree::{DocNode, DocTree, DocTreeCollector};
pub use working::{collect_working_changesets, Meta, WorkingChangeset};
