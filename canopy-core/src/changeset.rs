//! Changesets: the unit of wire and storage exchange.
//!
//! A changeset is four ordered lists of tree mutations. Lists are applied in
//! a fixed order by [`WorkingChangeset`](crate::working::WorkingChangeset);
//! within a list, later entries for the same key win.
//!
//! JSON form (empty lists are omitted):
//! ```text
//! {
//!   "schema": 0,
//!   "create":   ["n1"],
//!   "delete":   ["n0"],
//!   "property": [["n1", "title", "Hello"]],
//!   "position": [["n1", "root", "O"]]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier of the implicit root node.
pub const ROOT: &str = "root";

/// Changeset errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangesetError {
    #[error("unsupported changeset schema {0}")]
    UnsupportedSchema(u8),
}

/// Schema tag. Only version 0 exists; anything else fails to deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Schema;

impl TryFrom<u8> for Schema {
    type Error = ChangesetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Schema),
            other => Err(ChangesetError::UnsupportedSchema(other)),
        }
    }
}

impl From<Schema> for u8 {
    fn from(_: Schema) -> u8 {
        0
    }
}

/// `(node, key, value)` property write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyWrite(pub String, pub String, pub Value);

impl PropertyWrite {
    pub fn new(node: impl Into<String>, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self(node.into(), key.into(), value.into())
    }

    pub fn node(&self) -> &str {
        &self.0
    }

    pub fn key(&self) -> &str {
        &self.1
    }

    pub fn value(&self) -> &Value {
        &self.2
    }
}

/// `(child, parent, idx)` position write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionWrite(pub String, pub String, pub String);

impl PositionWrite {
    pub fn new(child: impl Into<String>, parent: impl Into<String>, idx: impl Into<String>) -> Self {
        Self(child.into(), parent.into(), idx.into())
    }

    pub fn child(&self) -> &str {
        &self.0
    }

    pub fn parent(&self) -> &str {
        &self.1
    }

    pub fn idx(&self) -> &str {
        &self.2
    }
}

/// A batch of tree mutations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(default)]
    pub schema: Schema,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub property: Vec<PropertyWrite>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub position: Vec<PositionWrite>,
}

impl Changeset {
    /// The empty changeset.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_create<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.create.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_delete<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delete.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_property(
        mut self,
        node: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.property.push(PropertyWrite::new(node, key, value));
        self
    }

    pub fn with_position(
        mut self,
        child: impl Into<String>,
        parent: impl Into<String>,
        idx: impl Into<String>,
    ) -> Self {
        self.position.push(PositionWrite::new(child, parent, idx));
        self
    }

    /// Total number of entries across all four lists.
    pub fn size(&self) -> usize {
        self.create.len() + self.delete.len() + self.property.len() + self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Field-wise concatenation of `self` followed by `other`.
    ///
    /// Entries are not deduplicated; replaying the result applies the
    /// entries of `other` after those of `self`.
    pub fn combine(&self, other: &Changeset) -> Changeset {
        let mut out = self.clone();
        out.append(other.clone());
        out
    }

    /// Append `other` onto `self` in place.
    pub fn append(&mut self, other: Changeset) {
        self.create.extend(other.create);
        self.delete.extend(other.delete);
        self.property.extend(other.property);
        self.position.extend(other.position);
    }

    /// Concatenate a sequence of changesets in order.
    pub fn combine_all<I>(changesets: I) -> Changeset
    where
        I: IntoIterator<Item = Changeset>,
    {
        changesets.into_iter().fold(Changeset::empty(), |mut acc, cs| {
            acc.append(cs);
            acc
        })
    }
}
