// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Table and column descriptors.
//!
//! The engine is agnostic to everything above it; all it needs to know about
//! a relation is its id, its storage id and the ordered list of columns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::DataType;

pub type RelationId = u32;
pub type ColumnId = u32;
pub type StorageId = u64;

/// Descriptor of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    name: String,
    datatype: DataType,
    nullable: bool,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, datatype: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            datatype,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

/// Descriptor of one relation backed by a columnar storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCatalog {
    relation_id: RelationId,
    name: String,
    storage_id: StorageId,
    columns: Arc<[ColumnDesc]>,
    #[serde(skip)]
    column_map: HashMap<String, usize>,
}

impl TableCatalog {
    pub fn new(
        relation_id: RelationId,
        name: impl Into<String>,
        storage_id: StorageId,
        columns: Vec<ColumnDesc>,
    ) -> Self {
        let column_map = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.name().to_string(), idx))
            .collect();
        Self {
            relation_id,
            name: name.into(),
            storage_id,
            columns: columns.into(),
            column_map,
        }
    }

    /// Rebuild the derived name lookup after deserialization.
    pub(crate) fn rebuild_column_map(&mut self) {
        self.column_map = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.name().to_string(), idx))
            .collect();
    }

    pub fn relation_id(&self) -> RelationId {
        self.relation_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_id(&self) -> StorageId {
        self.storage_id
    }

    pub fn columns(&self) -> &Arc<[ColumnDesc]> {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_map.get(name).copied()
    }
}
