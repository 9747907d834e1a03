//! Stamped content: every table, row, cell and value paired with the HLC
//! of its last write and, in content form, an order-independent hash.
//!
//! The stamp tree is the metadata a mergeable store keeps alongside its
//! data. Deleted cells and values stay in the tree as tombstones (`null`
//! things) so that deletions merge like any other write.

use crate::{
    changes::{RowChanges, TableChanges, TablesChanges, ValuesChanges},
    clock::HlcClock,
    hash::{add_or_remove_hash, get_cell_hash, get_child_in_parent_hash, get_time_hash},
    Cell, Changes, Hash, Id, Time, Value,
};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A thing with the time it was last written: `[thing, time]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamp<T> {
    pub thing: T,
    pub time: Time,
}

/// A thing with its time and hash: `[thing, time, hash]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HashStamp<T> {
    pub thing: T,
    pub time: Time,
    pub hash: Hash,
}

impl<T> Stamp<T> {
    pub fn new(thing: T, time: impl Into<Time>) -> Self {
        Self {
            thing,
            time: time.into(),
        }
    }
}

impl<T: Default> Stamp<T> {
    /// An empty container stamped with the empty time.
    pub fn empty() -> Self {
        Self::new(T::default(), Time::new())
    }
}

impl<T: Default> HashStamp<T> {
    /// An empty container stamped with the empty time.
    pub fn empty() -> Self {
        Self {
            thing: T::default(),
            time: Time::new(),
            hash: get_time_hash(""),
        }
    }
}

impl<T: Default> Default for Stamp<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Default> Default for HashStamp<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Serialize> Serialize for Stamp<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.thing, &self.time).serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Stamp<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (thing, time) = <(T, Time)>::deserialize(deserializer)?;
        Ok(Self { thing, time })
    }
}

impl<T: Serialize> Serialize for HashStamp<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.thing, &self.time, self.hash).serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for HashStamp<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (thing, time, hash) = <(T, Time, Hash)>::deserialize(deserializer)?;
        Ok(Self { thing, time, hash })
    }
}

pub type CellStamp = Stamp<Option<Cell>>;
pub type RowStamp = Stamp<BTreeMap<Id, CellStamp>>;
pub type TableStamp = Stamp<BTreeMap<Id, RowStamp>>;
pub type TablesStamp = Stamp<BTreeMap<Id, TableStamp>>;
pub type ValueStamp = Stamp<Option<Value>>;
pub type ValuesStamp = Stamp<BTreeMap<Id, ValueStamp>>;

pub type CellHashStamp = HashStamp<Option<Cell>>;
pub type RowHashStamp = HashStamp<BTreeMap<Id, CellHashStamp>>;
pub type TableHashStamp = HashStamp<BTreeMap<Id, RowHashStamp>>;
pub type TablesHashStamp = HashStamp<BTreeMap<Id, TableHashStamp>>;
pub type ValueHashStamp = HashStamp<Option<Value>>;
pub type ValuesHashStamp = HashStamp<BTreeMap<Id, ValueHashStamp>>;

/// Fully stamped, hashed content: `[tables, values]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeableContent {
    pub tables: TablesHashStamp,
    pub values: ValuesHashStamp,
}

/// Stamped changes without hashes: `[tables, values, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeableChanges {
    pub tables: TablesStamp,
    pub values: ValuesStamp,
}

impl Default for MergeableContent {
    fn default() -> Self {
        Self {
            tables: HashStamp::empty(),
            values: HashStamp::empty(),
        }
    }
}

impl Default for MergeableChanges {
    fn default() -> Self {
        Self {
            tables: Stamp::empty(),
            values: Stamp::empty(),
        }
    }
}

impl MergeableContent {
    /// The content as changes, ready to be applied elsewhere.
    pub fn to_changes(&self) -> MergeableChanges {
        MergeableChanges {
            tables: self.tables.unhashed(),
            values: self.values.unhashed(),
        }
    }
}

impl MergeableChanges {
    pub fn is_empty(&self) -> bool {
        self.tables.thing.is_empty() && self.values.thing.is_empty()
    }
}

impl Serialize for MergeableContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.tables, &self.values).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MergeableContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (tables, values) = Deserialize::deserialize(deserializer)?;
        Ok(Self { tables, values })
    }
}

impl Serialize for MergeableChanges {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.tables)?;
        tuple.serialize_element(&self.values)?;
        tuple.serialize_element(&crate::changes::CHANGES_TAG)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for MergeableChanges {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (tables, values, tag): (TablesStamp, ValuesStamp, u8) =
            Deserialize::deserialize(deserializer)?;
        if tag != crate::changes::CHANGES_TAG {
            return Err(de::Error::custom(format!(
                "mergeable changes must be tagged with {}, got {tag}",
                crate::changes::CHANGES_TAG
            )));
        }
        Ok(Self { tables, values })
    }
}

/// Top-level hashes: `[tablesHash, valuesHash]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashes(pub Hash, pub Hash);

impl ContentHashes {
    pub fn tables(&self) -> Hash {
        self.0
    }

    pub fn values(&self) -> Hash {
        self.1
    }
}

pub type TableHashes = BTreeMap<Id, Hash>;
pub type RowHashes = BTreeMap<Id, BTreeMap<Id, Hash>>;
pub type CellHashes = BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, Hash>>>;
pub type ValueHashes = BTreeMap<Id, Hash>;

/// Tables the asker lacks, plus hashes of tables that differ: `[new, differing]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDiff(pub TablesStamp, pub TableHashes);

/// Rows the asker lacks, plus hashes of rows that differ: `[new, differing]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowDiff(pub TablesStamp, pub RowHashes);

/// Strips hashes from a stamped tree.
pub trait Unhashed {
    type Output;
    fn unhashed(&self) -> Self::Output;
}

impl Unhashed for Option<Cell> {
    type Output = Option<Cell>;
    fn unhashed(&self) -> Self::Output {
        self.clone()
    }
}

impl<T: Unhashed> Unhashed for HashStamp<T> {
    type Output = Stamp<T::Output>;
    fn unhashed(&self) -> Self::Output {
        Stamp::new(self.thing.unhashed(), self.time.clone())
    }
}

impl<T: Unhashed> Unhashed for BTreeMap<Id, T> {
    type Output = BTreeMap<Id, T::Output>;
    fn unhashed(&self) -> Self::Output {
        self.iter()
            .map(|(id, child)| (id.clone(), child.unhashed()))
            .collect()
    }
}

/// Move a container's time forward, keeping its hash in step.
fn advance_time<T>(stamp: &mut HashStamp<T>, time: &str) {
    if time > stamp.time.as_str() {
        stamp.hash = add_or_remove_hash(
            stamp.hash,
            get_time_hash(&stamp.time) ^ get_time_hash(time),
        );
        stamp.time = time.to_string();
    }
}

/// Replace a child's contribution to its parent hash.
fn rehash_child(parent: &mut Hash, id: &str, old: Option<Hash>, new: Hash) {
    if let Some(old) = old {
        *parent = add_or_remove_hash(*parent, get_child_in_parent_hash(id, old));
    }
    *parent = add_or_remove_hash(*parent, get_child_in_parent_hash(id, new));
}

/// Keep `incoming` if it is newer than what is held for `id`.
fn merge_leaf(
    leaves: &mut BTreeMap<Id, HashStamp<Option<Cell>>>,
    parent_hash: &mut Hash,
    id: &str,
    incoming: &Stamp<Option<Cell>>,
) -> bool {
    let old = match leaves.get(id) {
        Some(existing) if incoming.time <= existing.time => return false,
        Some(existing) => Some(existing.hash),
        None => None,
    };
    let hash = get_cell_hash(incoming.thing.as_ref(), &incoming.time);
    rehash_child(parent_hash, id, old, hash);
    leaves.insert(
        id.to_string(),
        HashStamp {
            thing: incoming.thing.clone(),
            time: incoming.time.clone(),
            hash,
        },
    );
    true
}

/// Per-store stamp metadata and the clock that issues local times.
#[derive(Debug)]
pub(crate) struct Stamps {
    pub(crate) clock: HlcClock,
    pub(crate) content: MergeableContent,
    /// Whether raw store writes are stamped with fresh local times
    pub(crate) listening: bool,
    touched_cells: BTreeMap<Id, BTreeMap<Id, BTreeSet<Id>>>,
    touched_values: BTreeSet<Id>,
}

impl Stamps {
    pub(crate) fn new(clock: HlcClock) -> Self {
        Self {
            clock,
            content: MergeableContent::default(),
            listening: true,
            touched_cells: BTreeMap::new(),
            touched_values: BTreeSet::new(),
        }
    }

    pub(crate) fn clear_touched(&mut self) {
        self.touched_cells.clear();
        self.touched_values.clear();
    }

    pub(crate) fn reset(&mut self) {
        self.content = MergeableContent::default();
        self.clear_touched();
    }

    /// Stamp a local cell write with a fresh time.
    pub(crate) fn local_cell_changed(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        new: Option<&Cell>,
    ) {
        if !self.listening {
            return;
        }
        let time = self.clock.next_hlc();
        let row = Stamp::new(
            BTreeMap::from([(cell_id.to_string(), Stamp::new(new.cloned(), time.clone()))]),
            time.clone(),
        );
        let table = Stamp::new(BTreeMap::from([(row_id.to_string(), row)]), time.clone());
        let tables = Stamp::new(BTreeMap::from([(table_id.to_string(), table)]), time);
        self.merge_tables(&tables);
    }

    /// Stamp a local value write with a fresh time.
    pub(crate) fn local_value_changed(&mut self, value_id: &str, new: Option<&Value>) {
        if !self.listening {
            return;
        }
        let time = self.clock.next_hlc();
        let values = Stamp::new(
            BTreeMap::from([(value_id.to_string(), Stamp::new(new.cloned(), time.clone()))]),
            time,
        );
        self.merge_values(&values);
    }

    /// Merge remote stamps, returning the plain changes that were newer.
    pub(crate) fn merge(&mut self, changes: &MergeableChanges) -> Changes {
        self.see_times(changes);
        Changes::new(
            self.merge_tables(&changes.tables),
            self.merge_values(&changes.values),
        )
    }

    fn see_times(&mut self, changes: &MergeableChanges) {
        let clock = &mut self.clock;
        clock.seen_hlc(&changes.tables.time);
        for table in changes.tables.thing.values() {
            clock.seen_hlc(&table.time);
            for row in table.thing.values() {
                clock.seen_hlc(&row.time);
                for cell in row.thing.values() {
                    clock.seen_hlc(&cell.time);
                }
            }
        }
        clock.seen_hlc(&changes.values.time);
        for value in changes.values.thing.values() {
            clock.seen_hlc(&value.time);
        }
    }

    fn merge_tables(&mut self, incoming: &TablesStamp) -> TablesChanges {
        let mut accepted = TablesChanges::new();
        let tables = &mut self.content.tables;
        for (table_id, table_in) in &incoming.thing {
            let old_table = tables.thing.get(table_id).map(|table| table.hash);
            let table = tables
                .thing
                .entry(table_id.clone())
                .or_insert_with(HashStamp::empty);
            let mut table_changes = TableChanges::new();
            for (row_id, row_in) in &table_in.thing {
                let old_row = table.thing.get(row_id).map(|row| row.hash);
                let row = table
                    .thing
                    .entry(row_id.clone())
                    .or_insert_with(HashStamp::empty);
                let mut row_changes = RowChanges::new();
                for (cell_id, cell_in) in &row_in.thing {
                    if merge_leaf(&mut row.thing, &mut row.hash, cell_id, cell_in) {
                        row_changes.insert(cell_id.clone(), cell_in.thing.clone());
                    }
                }
                advance_time(row, &row_in.time);
                rehash_child(&mut table.hash, row_id, old_row, row.hash);
                if !row_changes.is_empty() {
                    table_changes.insert(row_id.clone(), Some(row_changes));
                }
            }
            advance_time(table, &table_in.time);
            rehash_child(&mut tables.hash, table_id, old_table, table.hash);
            if !table_changes.is_empty() {
                accepted.insert(table_id.clone(), Some(table_changes));
            }
        }
        advance_time(tables, &incoming.time);

        for (table_id, rows) in &accepted {
            for (row_id, cells) in rows.iter().flatten() {
                let touched = self
                    .touched_cells
                    .entry(table_id.clone())
                    .or_default()
                    .entry(row_id.clone())
                    .or_default();
                touched.extend(cells.iter().flatten().map(|(cell_id, _)| cell_id.clone()));
            }
        }
        accepted
    }

    fn merge_values(&mut self, incoming: &ValuesStamp) -> ValuesChanges {
        let mut accepted = ValuesChanges::new();
        let values = &mut self.content.values;
        for (value_id, value_in) in &incoming.thing {
            if merge_leaf(&mut values.thing, &mut values.hash, value_id, value_in) {
                accepted.insert(value_id.clone(), value_in.thing.clone());
            }
        }
        advance_time(values, &incoming.time);
        self.touched_values.extend(accepted.keys().cloned());
        accepted
    }

    pub(crate) fn content_hashes(&self) -> ContentHashes {
        ContentHashes(self.content.tables.hash, self.content.values.hash)
    }

    pub(crate) fn table_hashes(&self) -> TableHashes {
        self.content
            .tables
            .thing
            .iter()
            .map(|(table_id, table)| (table_id.clone(), table.hash))
            .collect()
    }

    pub(crate) fn table_diff(&self, other_table_hashes: &TableHashes) -> TableDiff {
        let tables = &self.content.tables;
        let mut new_tables = Stamp::new(BTreeMap::new(), tables.time.clone());
        let mut differing = TableHashes::new();
        for (table_id, table) in &tables.thing {
            match other_table_hashes.get(table_id) {
                None => {
                    new_tables.thing.insert(table_id.clone(), table.unhashed());
                }
                Some(hash) if *hash != table.hash => {
                    differing.insert(table_id.clone(), table.hash);
                }
                Some(_) => {}
            }
        }
        TableDiff(new_tables, differing)
    }

    pub(crate) fn row_hashes(&self, other_table_hashes: &TableHashes) -> RowHashes {
        let mut row_hashes = RowHashes::new();
        for (table_id, other_hash) in other_table_hashes {
            if let Some(table) = self.content.tables.thing.get(table_id) {
                if table.hash != *other_hash {
                    row_hashes.insert(
                        table_id.clone(),
                        table
                            .thing
                            .iter()
                            .map(|(row_id, row)| (row_id.clone(), row.hash))
                            .collect(),
                    );
                }
            }
        }
        row_hashes
    }

    pub(crate) fn row_diff(&self, other_row_hashes: &RowHashes) -> RowDiff {
        let tables = &self.content.tables;
        let mut new_rows = Stamp::new(BTreeMap::new(), tables.time.clone());
        let mut differing = RowHashes::new();
        for (table_id, other_rows) in other_row_hashes {
            let Some(table) = tables.thing.get(table_id) else {
                continue;
            };
            let mut new_table = Stamp::new(BTreeMap::new(), table.time.clone());
            for (row_id, row) in &table.thing {
                match other_rows.get(row_id) {
                    None => {
                        new_table.thing.insert(row_id.clone(), row.unhashed());
                    }
                    Some(hash) if *hash != row.hash => {
                        differing
                            .entry(table_id.clone())
                            .or_default()
                            .insert(row_id.clone(), row.hash);
                    }
                    Some(_) => {}
                }
            }
            if !new_table.thing.is_empty() {
                new_rows.thing.insert(table_id.clone(), new_table);
            }
        }
        RowDiff(new_rows, differing)
    }

    pub(crate) fn cell_hashes(&self, other_row_hashes: &RowHashes) -> CellHashes {
        let mut cell_hashes = CellHashes::new();
        for (table_id, other_rows) in other_row_hashes {
            let Some(table) = self.content.tables.thing.get(table_id) else {
                continue;
            };
            for (row_id, other_hash) in other_rows {
                if let Some(row) = table.thing.get(row_id) {
                    if row.hash != *other_hash {
                        cell_hashes.entry(table_id.clone()).or_default().insert(
                            row_id.clone(),
                            row.thing
                                .iter()
                                .map(|(cell_id, cell)| (cell_id.clone(), cell.hash))
                                .collect(),
                        );
                    }
                }
            }
        }
        cell_hashes
    }

    pub(crate) fn cell_diff(&self, other_cell_hashes: &CellHashes) -> TablesStamp {
        let tables = &self.content.tables;
        let mut diff = Stamp::new(BTreeMap::new(), tables.time.clone());
        for (table_id, other_rows) in other_cell_hashes {
            let Some(table) = tables.thing.get(table_id) else {
                continue;
            };
            let mut table_diff = Stamp::new(BTreeMap::new(), table.time.clone());
            for (row_id, other_cells) in other_rows {
                let Some(row) = table.thing.get(row_id) else {
                    continue;
                };
                let mut row_diff = Stamp::new(BTreeMap::new(), row.time.clone());
                for (cell_id, cell) in &row.thing {
                    if other_cells.get(cell_id) != Some(&cell.hash) {
                        row_diff.thing.insert(cell_id.clone(), cell.unhashed());
                    }
                }
                if !row_diff.thing.is_empty() {
                    table_diff.thing.insert(row_id.clone(), row_diff);
                }
            }
            if !table_diff.thing.is_empty() {
                diff.thing.insert(table_id.clone(), table_diff);
            }
        }
        diff
    }

    pub(crate) fn value_hashes(&self) -> ValueHashes {
        self.content
            .values
            .thing
            .iter()
            .map(|(value_id, value)| (value_id.clone(), value.hash))
            .collect()
    }

    pub(crate) fn value_diff(&self, other_value_hashes: &ValueHashes) -> ValuesStamp {
        let values = &self.content.values;
        let mut diff = Stamp::new(BTreeMap::new(), values.time.clone());
        for (value_id, value) in &values.thing {
            if other_value_hashes.get(value_id) != Some(&value.hash) {
                diff.thing.insert(value_id.clone(), value.unhashed());
            }
        }
        diff
    }

    /// Stamps of everything touched since the transaction started.
    pub(crate) fn touched_changes(&self) -> MergeableChanges {
        let tables = &self.content.tables;
        let mut changes = MergeableChanges {
            tables: Stamp::new(BTreeMap::new(), tables.time.clone()),
            values: Stamp::new(BTreeMap::new(), self.content.values.time.clone()),
        };
        for (table_id, rows) in &self.touched_cells {
            let Some(table) = tables.thing.get(table_id) else {
                continue;
            };
            let mut table_stamp = Stamp::new(BTreeMap::new(), table.time.clone());
            for (row_id, cell_ids) in rows {
                let Some(row) = table.thing.get(row_id) else {
                    continue;
                };
                let row_stamp = Stamp::new(
                    cell_ids
                        .iter()
                        .filter_map(|cell_id| {
                            row.thing
                                .get(cell_id)
                                .map(|cell| (cell_id.clone(), cell.unhashed()))
                        })
                        .collect(),
                    row.time.clone(),
                );
                table_stamp.thing.insert(row_id.clone(), row_stamp);
            }
            changes.tables.thing.insert(table_id.clone(), table_stamp);
        }
        for value_id in &self.touched_values {
            if let Some(value) = self.content.values.thing.get(value_id) {
                changes
                    .values
                    .thing
                    .insert(value_id.clone(), value.unhashed());
            }
        }
        changes
    }
}
