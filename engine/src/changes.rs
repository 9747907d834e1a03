//! Content, changes, and the per-transaction log.
//!
//! Content is the full `[tables, values]` pair. Changes are the
//! `[tablesDelta, valuesDelta, 1]` tuple, where `null` marks a deletion and
//! the trailing `1` distinguishes changes from content on the wire.

use crate::{Cell, Id, Store, Tables, Value, Values};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full store content: `[tables, values]`.
pub type Content = (Tables, Values);

/// Cell id to new cell, `None` meaning deleted.
pub type RowChanges = BTreeMap<Id, Option<Cell>>;
/// Row id to row changes, `None` meaning the row was deleted.
pub type TableChanges = BTreeMap<Id, Option<RowChanges>>;
/// Table id to table changes, `None` meaning the table was deleted.
pub type TablesChanges = BTreeMap<Id, Option<TableChanges>>;
/// Value id to new value, `None` meaning deleted.
pub type ValuesChanges = BTreeMap<Id, Option<Value>>;

/// Tag that marks a serialized tuple as changes rather than content.
pub const CHANGES_TAG: u8 = 1;

/// An incremental diff of tables and values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub tables: TablesChanges,
    pub values: ValuesChanges,
}

impl Changes {
    pub fn new(tables: TablesChanges, values: ValuesChanges) -> Self {
        Self { tables, values }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.values.is_empty()
    }
}

impl Serialize for Changes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.tables)?;
        tuple.serialize_element(&self.values)?;
        tuple.serialize_element(&CHANGES_TAG)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Changes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (tables, values, tag): (TablesChanges, ValuesChanges, u8) =
            Deserialize::deserialize(deserializer)?;
        if tag != CHANGES_TAG {
            return Err(de::Error::custom(format!(
                "changes must be tagged with {CHANGES_TAG}, got {tag}"
            )));
        }
        Ok(Self { tables, values })
    }
}

/// `+1` when an id came into existence during a transaction, `-1` when it
/// stopped existing.
pub type IdAddedOrRemoved = i8;

/// Net id changes for one container.
pub type ChangedIds = BTreeMap<Id, IdAddedOrRemoved>;

/// Old and new state of a cell or value across a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CellChange {
    pub changed: bool,
    pub old: Option<Cell>,
    pub new: Option<Cell>,
}

impl CellChange {
    fn unchanged(current: Option<Cell>) -> Self {
        Self {
            changed: false,
            old: current.clone(),
            new: current,
        }
    }
}

/// `(old, new)` for a touched cell or value.
pub type OldNew = (Option<Cell>, Option<Cell>);

/// Everything a transaction did, cleared when the next one starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLog {
    pub changed_cells: BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, OldNew>>>,
    pub invalid_cells: BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, Vec<Cell>>>>,
    pub changed_values: BTreeMap<Id, OldNew>,
    pub invalid_values: BTreeMap<Id, Vec<Value>>,
    pub changed_table_ids: ChangedIds,
    pub changed_row_ids: BTreeMap<Id, ChangedIds>,
    pub changed_cell_ids: BTreeMap<Id, BTreeMap<Id, ChangedIds>>,
    pub changed_value_ids: ChangedIds,
    #[serde(skip)]
    pub(crate) changed_table_cell_ids: BTreeMap<Id, ChangedIds>,
}

impl TransactionLog {
    /// Whether any cell or value actually differs from its start state.
    pub fn has_changes(&self) -> bool {
        self.changed_cells
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .any(|(old, new)| old != new)
            || self.changed_values.values().any(|(old, new)| old != new)
    }

    /// Number of cells written, across every table and row.
    pub fn changed_cell_count(&self) -> usize {
        self.changed_cells
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    pub(crate) fn cell_changed(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        old: Option<&Cell>,
        new: Option<&Cell>,
    ) {
        self.changed_cells
            .entry(table_id.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default()
            .entry(cell_id.to_string())
            .or_insert_with(|| (old.cloned(), None))
            .1 = new.cloned();
    }

    pub(crate) fn value_changed(&mut self, value_id: &str, old: Option<&Value>, new: Option<&Value>) {
        self.changed_values
            .entry(value_id.to_string())
            .or_insert_with(|| (old.cloned(), None))
            .1 = new.cloned();
    }

    pub(crate) fn cell_invalid(&mut self, table_id: &str, row_id: &str, cell_id: &str, cell: Cell) {
        self.invalid_cells
            .entry(table_id.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default()
            .entry(cell_id.to_string())
            .or_default()
            .push(cell);
    }

    pub(crate) fn value_invalid(&mut self, value_id: &str, value: Value) {
        self.invalid_values
            .entry(value_id.to_string())
            .or_default()
            .push(value);
    }

    /// Only cells whose final state differs from their start state.
    pub fn cell_change(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&OldNew> {
        self.changed_cells
            .get(table_id)?
            .get(row_id)?
            .get(cell_id)
            .filter(|(old, new)| old != new)
    }

    pub fn value_change(&self, value_id: &str) -> Option<&OldNew> {
        self.changed_values
            .get(value_id)
            .filter(|(old, new)| old != new)
    }

    /// The log as a changes tuple.
    pub fn to_changes(&self) -> Changes {
        let mut tables = TablesChanges::new();
        for (table_id, rows) in &self.changed_cells {
            let table_removed = self.changed_table_ids.get(table_id) == Some(&-1);
            let mut table_changes = TableChanges::new();
            for (row_id, cells) in rows {
                let row_removed = self
                    .changed_row_ids
                    .get(table_id)
                    .and_then(|ids| ids.get(row_id))
                    == Some(&-1);
                let row_changes: RowChanges = cells
                    .iter()
                    .filter(|(_, (old, new))| old != new)
                    .map(|(cell_id, (_, new))| (cell_id.clone(), new.clone()))
                    .collect();
                if row_removed {
                    table_changes.insert(row_id.clone(), None);
                } else if !row_changes.is_empty() {
                    table_changes.insert(row_id.clone(), Some(row_changes));
                }
            }
            if table_removed {
                tables.insert(table_id.clone(), None);
            } else if !table_changes.is_empty() {
                tables.insert(table_id.clone(), Some(table_changes));
            }
        }
        let values = self
            .changed_values
            .iter()
            .filter(|(_, (old, new))| old != new)
            .map(|(value_id, (_, new))| (value_id.clone(), new.clone()))
            .collect();
        Changes { tables, values }
    }
}

/// Adjust a net id change, dropping it when it returns to zero.
pub(crate) fn id_changed(ids: &mut ChangedIds, id: &str, delta: IdAddedOrRemoved) {
    let net = ids.get(id).copied().unwrap_or(0) + delta;
    if net == 0 {
        ids.remove(id);
    } else {
        ids.insert(id.to_string(), net);
    }
}

/// Accessor handed to tabular listeners to ask what happened to a cell.
pub struct GetCellChange<'a> {
    pub(crate) log: &'a TransactionLog,
    pub(crate) store: &'a Store,
}

impl GetCellChange<'_> {
    pub fn get(&self, table_id: &str, row_id: &str, cell_id: &str) -> CellChange {
        match self.log.cell_change(table_id, row_id, cell_id) {
            Some((old, new)) => CellChange {
                changed: true,
                old: old.clone(),
                new: new.clone(),
            },
            None => CellChange::unchanged(self.store.get_cell(table_id, row_id, cell_id)),
        }
    }
}

/// Accessor handed to values listeners to ask what happened to a value.
pub struct GetValueChange<'a> {
    pub(crate) log: &'a TransactionLog,
    pub(crate) store: &'a Store,
}

impl GetValueChange<'_> {
    pub fn get(&self, value_id: &str) -> CellChange {
        match self.log.value_change(value_id) {
            Some((old, new)) => CellChange {
                changed: true,
                old: old.clone(),
                new: new.clone(),
            },
            None => CellChange::unchanged(self.store.get_value(value_id)),
        }
    }
}
