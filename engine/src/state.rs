//! Raw store state and the primitive writes every mutation funnels through.
//!
//! Nothing here calls listeners. Each primitive keeps the content, the
//! transaction log, the table cell counts and (for mergeable stores) the
//! stamp tree in step, and prunes rows and tables as they empty.

use crate::{
    changes::{id_changed, Changes, TransactionLog},
    schema::{default_row, TablesSchema, ValuesSchema},
    stamp::Stamps,
    Cell, Id, Ids, Row, Table, Tables, Value, Values,
};
use std::collections::{BTreeMap, VecDeque};

/// Most deleted row ids remembered per table for reuse.
const MAX_POOLED_ROW_IDS: usize = 1000;

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) tables: Tables,
    pub(crate) values: Values,
    pub(crate) tables_schema: Option<TablesSchema>,
    pub(crate) values_schema: Option<ValuesSchema>,
    pub(crate) log: TransactionLog,
    pub(crate) stamps: Option<Stamps>,
    pub(crate) reuse_row_ids: bool,
    table_cell_counts: BTreeMap<Id, BTreeMap<Id, usize>>,
    row_id_pools: BTreeMap<Id, VecDeque<Id>>,
    next_row_ids: BTreeMap<Id, u64>,
}

impl StoreState {
    pub(crate) fn new(reuse_row_ids: bool) -> Self {
        Self {
            reuse_row_ids,
            ..Self::default()
        }
    }

    /// Reset the log for a new outermost transaction.
    pub(crate) fn begin(&mut self) {
        self.log = TransactionLog::default();
        if let Some(stamps) = &mut self.stamps {
            stamps.clear_touched();
        }
    }

    pub(crate) fn has_row(&self, table_id: &str, row_id: &str) -> bool {
        self.tables
            .get(table_id)
            .is_some_and(|table| table.contains_key(row_id))
    }

    pub(crate) fn has_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> bool {
        self.tables
            .get(table_id)
            .and_then(|table| table.get(row_id))
            .is_some_and(|row| row.contains_key(cell_id))
    }

    pub(crate) fn table_cell_ids(&self, table_id: &str) -> Ids {
        self.table_cell_counts
            .get(table_id)
            .map(|counts| counts.keys().cloned().collect())
            .unwrap_or_default()
    }

    // Validation

    fn cell_is_valid(&self, table_id: &str, cell_id: &str, cell: &Cell) -> bool {
        cell.is_storable()
            && match &self.tables_schema {
                None => true,
                Some(schema) => schema
                    .get(table_id)
                    .and_then(|table_schema| table_schema.get(cell_id))
                    .is_some_and(|cell_schema| cell_schema.accepts(cell)),
            }
    }

    fn value_is_valid(&self, value_id: &str, value: &Value) -> bool {
        value.is_storable()
            && match &self.values_schema {
                None => true,
                Some(schema) => schema
                    .get(value_id)
                    .is_some_and(|value_schema| value_schema.accepts(value)),
            }
    }

    fn cell_default(&self, table_id: &str, cell_id: &str) -> Option<Cell> {
        self.tables_schema
            .as_ref()?
            .get(table_id)?
            .get(cell_id)?
            .default_cell()
    }

    fn value_default(&self, value_id: &str) -> Option<Value> {
        self.values_schema.as_ref()?.get(value_id)?.default_cell()
    }

    fn table_defaults(&self, table_id: &str) -> Row {
        self.tables_schema
            .as_ref()
            .and_then(|schema| schema.get(table_id))
            .map(default_row)
            .unwrap_or_default()
    }

    fn values_defaults(&self) -> Values {
        self.values_schema
            .as_ref()
            .map(default_row)
            .unwrap_or_default()
    }

    /// Drop and log invalid cells. An invalid cell the row lacks falls
    /// back to its default.
    fn validate_row(&mut self, table_id: &str, row_id: &str, row: Row) -> Row {
        let mut valid = Row::new();
        for (cell_id, cell) in row {
            if self.cell_is_valid(table_id, &cell_id, &cell) {
                valid.insert(cell_id, cell);
                continue;
            }
            tracing::debug!(table_id, row_id, cell_id = %cell_id, %cell, "invalid cell write");
            self.log.cell_invalid(table_id, row_id, &cell_id, cell);
            if !self.has_cell(table_id, row_id, &cell_id) {
                if let Some(default) = self.cell_default(table_id, &cell_id) {
                    valid.insert(cell_id, default);
                }
            }
        }
        valid
    }

    fn validate_values(&mut self, values: Values) -> Values {
        let mut valid = Values::new();
        for (value_id, value) in values {
            if self.value_is_valid(&value_id, &value) {
                valid.insert(value_id, value);
                continue;
            }
            tracing::debug!(value_id = %value_id, %value, "invalid value write");
            self.log.value_invalid(&value_id, value);
            if !self.values.contains_key(&value_id) {
                if let Some(default) = self.value_default(&value_id) {
                    valid.insert(value_id, default);
                }
            }
        }
        valid
    }

    /// A validated row with every declared default it lacks.
    fn complete_row(&self, table_id: &str, row: Row) -> Row {
        let mut complete = self.table_defaults(table_id);
        complete.extend(row);
        complete
    }

    // Tabular writes

    pub(crate) fn set_tables(&mut self, tables: Tables) {
        if tables.is_empty() {
            tracing::debug!("ignoring empty tables write");
            return;
        }
        let mut valid = Tables::new();
        for (table_id, table) in tables {
            let table = self.validate_table(&table_id, table);
            if !table.is_empty() {
                valid.insert(table_id, table);
            }
        }
        if valid.is_empty() {
            return;
        }
        let stale: Ids = self
            .tables
            .keys()
            .filter(|table_id| !valid.contains_key(*table_id))
            .cloned()
            .collect();
        for table_id in stale {
            self.del_table(&table_id);
        }
        for (table_id, table) in valid {
            self.set_valid_table(&table_id, table);
        }
    }

    pub(crate) fn set_table(&mut self, table_id: &str, table: Table) {
        if table.is_empty() {
            tracing::debug!(table_id, "ignoring empty table write");
            return;
        }
        let valid = self.validate_table(table_id, table);
        if !valid.is_empty() {
            self.set_valid_table(table_id, valid);
        }
    }

    fn validate_table(&mut self, table_id: &str, table: Table) -> Table {
        let mut valid = Table::new();
        for (row_id, row) in table {
            let row = self.validate_row(table_id, &row_id, row);
            if !row.is_empty() {
                let row = self.complete_row(table_id, row);
                valid.insert(row_id, row);
            }
        }
        valid
    }

    fn set_valid_table(&mut self, table_id: &str, table: Table) {
        let stale: Ids = self
            .tables
            .get(table_id)
            .map(|existing| {
                existing
                    .keys()
                    .filter(|row_id| !table.contains_key(*row_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for row_id in stale {
            self.del_row(table_id, &row_id);
        }
        for (row_id, row) in table {
            self.set_valid_row(table_id, &row_id, row);
        }
    }

    /// Replace a row. New cells are written before stale ones go, so the
    /// row is never pruned part way through.
    fn set_valid_row(&mut self, table_id: &str, row_id: &str, row: Row) {
        let stale: Ids = self
            .tables
            .get(table_id)
            .and_then(|table| table.get(row_id))
            .map(|existing| {
                existing
                    .keys()
                    .filter(|cell_id| !row.contains_key(*cell_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for (cell_id, cell) in row {
            self.write_cell(table_id, row_id, &cell_id, cell);
        }
        for cell_id in stale {
            self.remove_cell(table_id, row_id, &cell_id);
        }
    }

    pub(crate) fn set_row(&mut self, table_id: &str, row_id: &str, row: Row) {
        if row.is_empty() {
            tracing::debug!(table_id, row_id, "ignoring empty row write");
            return;
        }
        let valid = self.validate_row(table_id, row_id, row);
        if !valid.is_empty() {
            let row = self.complete_row(table_id, valid);
            self.set_valid_row(table_id, row_id, row);
        }
    }

    pub(crate) fn add_row(&mut self, table_id: &str, row: Row) -> Option<Id> {
        if row.is_empty() {
            tracing::debug!(table_id, "ignoring empty row add");
            return None;
        }
        let row_id = self.next_row_id(table_id);
        let valid = self.validate_row(table_id, &row_id, row);
        if valid.is_empty() {
            return None;
        }
        let row = self.complete_row(table_id, valid);
        self.set_valid_row(table_id, &row_id, row);
        Some(row_id)
    }

    pub(crate) fn set_partial_row(&mut self, table_id: &str, row_id: &str, partial: Row) {
        if partial.is_empty() {
            tracing::debug!(table_id, row_id, "ignoring empty partial row write");
            return;
        }
        let mut valid = self.validate_row(table_id, row_id, partial);
        if valid.is_empty() {
            return;
        }
        if !self.has_row(table_id, row_id) {
            valid = self.complete_row(table_id, valid);
        }
        for (cell_id, cell) in valid {
            self.write_cell(table_id, row_id, &cell_id, cell);
        }
    }

    pub(crate) fn set_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, cell: Cell) {
        let mut partial = Row::new();
        partial.insert(cell_id.to_string(), cell);
        self.set_partial_row(table_id, row_id, partial);
    }

    pub(crate) fn del_tables(&mut self) {
        let table_ids: Ids = self.tables.keys().cloned().collect();
        for table_id in table_ids {
            self.del_table(&table_id);
        }
    }

    pub(crate) fn del_table(&mut self, table_id: &str) {
        let row_ids: Ids = self
            .tables
            .get(table_id)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        for row_id in row_ids {
            self.del_row(table_id, &row_id);
        }
    }

    pub(crate) fn del_row(&mut self, table_id: &str, row_id: &str) {
        let cell_ids: Ids = self
            .tables
            .get(table_id)
            .and_then(|table| table.get(row_id))
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        for cell_id in cell_ids {
            self.remove_cell(table_id, row_id, &cell_id);
        }
    }

    /// Delete a cell. Unless forced, a cell with a declared default is
    /// reset to it instead.
    pub(crate) fn del_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, force: bool) {
        if !self.has_cell(table_id, row_id, cell_id) {
            return;
        }
        match self.cell_default(table_id, cell_id).filter(|_| !force) {
            Some(default) => self.write_cell(table_id, row_id, cell_id, default),
            None => self.remove_cell(table_id, row_id, cell_id),
        }
    }

    // Keyed value writes

    pub(crate) fn set_values(&mut self, values: Values) {
        if values.is_empty() {
            tracing::debug!("ignoring empty values write");
            return;
        }
        let valid = self.validate_values(values);
        if valid.is_empty() {
            return;
        }
        let mut complete = self.values_defaults();
        complete.extend(valid);
        let stale: Ids = self
            .values
            .keys()
            .filter(|value_id| !complete.contains_key(*value_id))
            .cloned()
            .collect();
        for (value_id, value) in complete {
            self.write_value(&value_id, value);
        }
        for value_id in stale {
            self.remove_value(&value_id);
        }
    }

    pub(crate) fn set_partial_values(&mut self, partial: Values) {
        if partial.is_empty() {
            tracing::debug!("ignoring empty partial values write");
            return;
        }
        for (value_id, value) in self.validate_values(partial) {
            self.write_value(&value_id, value);
        }
    }

    pub(crate) fn set_value(&mut self, value_id: &str, value: Value) {
        let mut partial = Values::new();
        partial.insert(value_id.to_string(), value);
        self.set_partial_values(partial);
    }

    pub(crate) fn del_values(&mut self) {
        let value_ids: Ids = self.values.keys().cloned().collect();
        for value_id in value_ids {
            self.del_value(&value_id, false);
        }
    }

    pub(crate) fn del_value(&mut self, value_id: &str, force: bool) {
        if !self.values.contains_key(value_id) {
            return;
        }
        match self.value_default(value_id).filter(|_| !force) {
            Some(default) => self.write_value(value_id, default),
            None => self.remove_value(value_id),
        }
    }

    // Bulk

    pub(crate) fn set_content(&mut self, tables: Tables, values: Values) {
        if tables.is_empty() {
            self.del_tables();
        } else {
            self.set_tables(tables);
        }
        if values.is_empty() {
            self.del_values();
        } else {
            self.set_values(values);
        }
    }

    /// Apply a changes tuple. Deletions are forced so that removals made
    /// elsewhere are not undone by local defaults.
    pub(crate) fn apply_changes(&mut self, changes: Changes) {
        for (table_id, table) in changes.tables {
            let Some(rows) = table else {
                self.del_table(&table_id);
                continue;
            };
            for (row_id, row) in rows {
                let Some(cells) = row else {
                    self.del_row(&table_id, &row_id);
                    continue;
                };
                for (cell_id, cell) in cells {
                    match cell {
                        Some(cell) => self.set_cell(&table_id, &row_id, &cell_id, cell),
                        None => self.del_cell(&table_id, &row_id, &cell_id, true),
                    }
                }
            }
        }
        for (value_id, value) in changes.values {
            match value {
                Some(value) => self.set_value(&value_id, value),
                None => self.del_value(&value_id, true),
            }
        }
    }

    /// Bring existing cells in line with a newly set tables schema.
    pub(crate) fn revalidate_tables(&mut self) {
        if self.tables_schema.is_none() {
            return;
        }
        for (table_id, table) in self.tables.clone() {
            for (row_id, row) in table {
                for (cell_id, cell) in row {
                    if !self.cell_is_valid(&table_id, &cell_id, &cell) {
                        self.log.cell_invalid(&table_id, &row_id, &cell_id, cell);
                        self.remove_cell(&table_id, &row_id, &cell_id);
                    }
                }
                if self.has_row(&table_id, &row_id) {
                    for (cell_id, default) in self.table_defaults(&table_id) {
                        if !self.has_cell(&table_id, &row_id, &cell_id) {
                            self.write_cell(&table_id, &row_id, &cell_id, default);
                        }
                    }
                }
            }
        }
    }

    /// Bring existing values in line with a newly set values schema.
    pub(crate) fn revalidate_values(&mut self) {
        if self.values_schema.is_none() {
            return;
        }
        for (value_id, value) in self.values.clone() {
            if !self.value_is_valid(&value_id, &value) {
                self.log.value_invalid(&value_id, value);
                self.remove_value(&value_id);
            }
        }
        for (value_id, default) in self.values_defaults() {
            if !self.values.contains_key(&value_id) {
                self.write_value(&value_id, default);
            }
        }
    }

    /// Restore every cell and value the log touched to its start state.
    pub(crate) fn rollback(&mut self) {
        let log = std::mem::take(&mut self.log);
        for (table_id, rows) in &log.changed_cells {
            for (row_id, cells) in rows {
                for (cell_id, (old, _)) in cells {
                    match old {
                        Some(cell) => self.write_cell(table_id, row_id, cell_id, cell.clone()),
                        None => self.remove_cell(table_id, row_id, cell_id),
                    }
                }
            }
        }
        for (value_id, (old, _)) in &log.changed_values {
            match old {
                Some(value) => self.write_value(value_id, value.clone()),
                None => self.remove_value(value_id),
            }
        }
        self.log = TransactionLog::default();
    }

    // Primitives

    pub(crate) fn write_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, cell: Cell) {
        if !self.tables.contains_key(table_id) {
            id_changed(&mut self.log.changed_table_ids, table_id, 1);
        }
        let table = self.tables.entry(table_id.to_string()).or_default();
        if !table.contains_key(row_id) {
            id_changed(
                self.log
                    .changed_row_ids
                    .entry(table_id.to_string())
                    .or_default(),
                row_id,
                1,
            );
        }
        let row = table.entry(row_id.to_string()).or_default();
        let old = row.insert(cell_id.to_string(), cell.clone());
        if old.as_ref() == Some(&cell) {
            return;
        }
        if old.is_none() {
            id_changed(
                self.log
                    .changed_cell_ids
                    .entry(table_id.to_string())
                    .or_default()
                    .entry(row_id.to_string())
                    .or_default(),
                cell_id,
                1,
            );
            self.table_cell_added(table_id, cell_id);
        }
        self.log
            .cell_changed(table_id, row_id, cell_id, old.as_ref(), Some(&cell));
        if let Some(stamps) = &mut self.stamps {
            stamps.local_cell_changed(table_id, row_id, cell_id, Some(&cell));
        }
    }

    pub(crate) fn remove_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) {
        let Some(table) = self.tables.get_mut(table_id) else {
            return;
        };
        let Some(row) = table.get_mut(row_id) else {
            return;
        };
        let Some(old) = row.remove(cell_id) else {
            return;
        };
        let row_emptied = row.is_empty();
        if row_emptied {
            table.remove(row_id);
        }
        let table_emptied = table.is_empty();
        if table_emptied {
            self.tables.remove(table_id);
        }

        id_changed(
            self.log
                .changed_cell_ids
                .entry(table_id.to_string())
                .or_default()
                .entry(row_id.to_string())
                .or_default(),
            cell_id,
            -1,
        );
        self.table_cell_removed(table_id, cell_id);
        self.log
            .cell_changed(table_id, row_id, cell_id, Some(&old), None);
        if let Some(stamps) = &mut self.stamps {
            stamps.local_cell_changed(table_id, row_id, cell_id, None);
        }

        if row_emptied {
            id_changed(
                self.log
                    .changed_row_ids
                    .entry(table_id.to_string())
                    .or_default(),
                row_id,
                -1,
            );
            self.release_row_id(table_id, row_id);
        }
        if table_emptied {
            id_changed(&mut self.log.changed_table_ids, table_id, -1);
            self.row_id_pools.remove(table_id);
            self.next_row_ids.remove(table_id);
        }
    }

    pub(crate) fn write_value(&mut self, value_id: &str, value: Value) {
        let old = self.values.insert(value_id.to_string(), value.clone());
        if old.as_ref() == Some(&value) {
            return;
        }
        if old.is_none() {
            id_changed(&mut self.log.changed_value_ids, value_id, 1);
        }
        self.log.value_changed(value_id, old.as_ref(), Some(&value));
        if let Some(stamps) = &mut self.stamps {
            stamps.local_value_changed(value_id, Some(&value));
        }
    }

    pub(crate) fn remove_value(&mut self, value_id: &str) {
        let Some(old) = self.values.remove(value_id) else {
            return;
        };
        id_changed(&mut self.log.changed_value_ids, value_id, -1);
        self.log.value_changed(value_id, Some(&old), None);
        if let Some(stamps) = &mut self.stamps {
            stamps.local_value_changed(value_id, None);
        }
    }

    fn table_cell_added(&mut self, table_id: &str, cell_id: &str) {
        let count = self
            .table_cell_counts
            .entry(table_id.to_string())
            .or_default()
            .entry(cell_id.to_string())
            .or_insert(0);
        *count += 1;
        if *count == 1 {
            id_changed(
                self.log
                    .changed_table_cell_ids
                    .entry(table_id.to_string())
                    .or_default(),
                cell_id,
                1,
            );
        }
    }

    fn table_cell_removed(&mut self, table_id: &str, cell_id: &str) {
        let Some(counts) = self.table_cell_counts.get_mut(table_id) else {
            return;
        };
        let Some(count) = counts.get_mut(cell_id) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        counts.remove(cell_id);
        if counts.is_empty() {
            self.table_cell_counts.remove(table_id);
        }
        id_changed(
            self.log
                .changed_table_cell_ids
                .entry(table_id.to_string())
                .or_default(),
            cell_id,
            -1,
        );
    }

    // Row ids

    fn next_row_id(&mut self, table_id: &str) -> Id {
        loop {
            let pooled = if self.reuse_row_ids {
                self.row_id_pools
                    .get_mut(table_id)
                    .and_then(VecDeque::pop_front)
            } else {
                None
            };
            let row_id = pooled.unwrap_or_else(|| {
                let next = self.next_row_ids.entry(table_id.to_string()).or_insert(0);
                let row_id = next.to_string();
                *next += 1;
                row_id
            });
            if !self.has_row(table_id, &row_id) {
                return row_id;
            }
        }
    }

    fn release_row_id(&mut self, table_id: &str, row_id: &str) {
        if !self.reuse_row_ids || row_id.is_empty() || !row_id.bytes().all(|b| b.is_ascii_digit()) {
            return;
        }
        let pool = self.row_id_pools.entry(table_id.to_string()).or_default();
        if pool.len() < MAX_POOLED_ROW_IDS {
            pool.push_back(row_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CellSchema, TableSchema};

    fn row(cells: &[(&str, Cell)]) -> Row {
        cells
            .iter()
            .map(|(id, cell)| (id.to_string(), cell.clone()))
            .collect()
    }

    fn pets_schema() -> TablesSchema {
        let mut pets = TableSchema::new();
        pets.insert("species".into(), CellSchema::string());
        pets.insert("sold".into(), CellSchema::boolean_with_default(false));
        TablesSchema::from([("pets".to_string(), pets)])
    }

    #[test]
    fn removing_last_cell_prunes_row_and_table() {
        let mut state = StoreState::new(true);
        state.write_cell("t1", "r1", "c1", Cell::from(1));
        state.begin();
        state.remove_cell("t1", "r1", "c1");
        assert!(state.tables.is_empty());
        assert_eq!(state.log.changed_table_ids["t1"], -1);
        assert_eq!(state.log.changed_row_ids["t1"]["r1"], -1);
        assert!(state.table_cell_ids("t1").is_empty());
    }

    #[test]
    fn identical_write_is_not_logged() {
        let mut state = StoreState::new(true);
        state.write_cell("t1", "r1", "c1", Cell::from(1));
        state.begin();
        state.write_cell("t1", "r1", "c1", Cell::from(1));
        assert!(state.log.changed_cells.is_empty());
        assert!(!state.log.has_changes());
    }

    #[test]
    fn table_cell_ids_follow_rows() {
        let mut state = StoreState::new(true);
        state.write_cell("t1", "r1", "a", Cell::from(1));
        state.write_cell("t1", "r2", "a", Cell::from(2));
        state.write_cell("t1", "r2", "b", Cell::from(3));
        assert_eq!(state.table_cell_ids("t1"), vec!["a", "b"]);
        state.del_row("t1", "r2");
        assert_eq!(state.table_cell_ids("t1"), vec!["a"]);
    }

    #[test]
    fn add_row_counts_up_and_skips_used_ids() {
        let mut state = StoreState::new(false);
        state.write_cell("t1", "1", "c", Cell::from(0));
        let cells = row(&[("c", Cell::from(1))]);
        assert_eq!(state.add_row("t1", cells.clone()).as_deref(), Some("0"));
        assert_eq!(state.add_row("t1", cells.clone()).as_deref(), Some("2"));
        assert_eq!(state.add_row("t1", Row::new()), None);
    }

    #[test]
    fn deleted_row_ids_are_reused_in_order() {
        let mut state = StoreState::new(true);
        let cells = row(&[("c", Cell::from(1))]);
        for _ in 0..3 {
            state.add_row("t1", cells.clone());
        }
        state.del_row("t1", "1");
        state.del_row("t1", "0");
        assert_eq!(state.add_row("t1", cells.clone()).as_deref(), Some("1"));
        assert_eq!(state.add_row("t1", cells.clone()).as_deref(), Some("0"));
        assert_eq!(state.add_row("t1", cells).as_deref(), Some("3"));
    }

    #[test]
    fn deleting_a_table_forgets_its_row_ids() {
        let mut state = StoreState::new(true);
        let cells = row(&[("c", Cell::from(1))]);
        state.add_row("t1", cells.clone());
        state.add_row("t1", cells.clone());
        state.del_table("t1");
        assert_eq!(state.add_row("t1", cells).as_deref(), Some("0"));
    }

    #[test]
    fn schema_rejects_and_defaults() {
        let mut state = StoreState::new(true);
        state.tables_schema = Some(pets_schema());
        state.set_cell("pets", "fido", "species", Cell::from(5));
        assert!(!state.has_row("pets", "fido"));
        assert_eq!(
            state.log.invalid_cells["pets"]["fido"]["species"],
            vec![Cell::from(5)]
        );

        state.set_cell("pets", "fido", "species", Cell::from("dog"));
        assert_eq!(
            state.tables["pets"]["fido"],
            row(&[("species", Cell::from("dog")), ("sold", Cell::from(false))])
        );
        state.set_cell("pets", "fido", "sold", Cell::from("yes"));
        assert_eq!(state.tables["pets"]["fido"]["sold"], Cell::from(false));
        state.del_cell("pets", "fido", "sold", false);
        assert_eq!(state.tables["pets"]["fido"]["sold"], Cell::from(false));
        state.del_cell("pets", "fido", "sold", true);
        assert!(!state.has_cell("pets", "fido", "sold"));

        state.set_cell("cats", "felix", "species", Cell::from("cat"));
        assert!(!state.tables.contains_key("cats"));
    }

    #[test]
    fn non_finite_numbers_are_invalid_without_schema() {
        let mut state = StoreState::new(true);
        state.set_cell("t1", "r1", "c1", Cell::Number(f64::INFINITY));
        assert!(state.tables.is_empty());
        assert_eq!(state.log.invalid_cells["t1"]["r1"]["c1"].len(), 1);
    }

    #[test]
    fn revalidation_drops_invalid_and_adds_defaults() {
        let mut state = StoreState::new(true);
        state.write_cell("pets", "fido", "species", Cell::from(1));
        state.write_cell("pets", "fido", "legs", Cell::from(4));
        state.write_cell("pets", "rex", "species", Cell::from("dog"));
        state.tables_schema = Some(pets_schema());
        state.revalidate_tables();
        assert!(!state.has_row("pets", "fido"));
        assert_eq!(
            state.tables["pets"]["rex"],
            row(&[("species", Cell::from("dog")), ("sold", Cell::from(false))])
        );
    }

    #[test]
    fn rollback_restores_start_state() {
        let mut state = StoreState::new(true);
        state.write_cell("t1", "r1", "c1", Cell::from(1));
        state.write_value("v1", Cell::from("a"));
        let before = (state.tables.clone(), state.values.clone());
        state.begin();
        state.write_cell("t1", "r1", "c1", Cell::from(2));
        state.write_cell("t2", "r1", "c1", Cell::from(3));
        state.remove_value("v1");
        state.write_value("v2", Cell::from(true));
        state.rollback();
        assert_eq!((state.tables.clone(), state.values.clone()), before);
        assert!(!state.log.has_changes());
    }

    #[test]
    fn set_values_replaces_and_keeps_defaults() {
        let mut state = StoreState::new(true);
        state.values_schema = Some(ValuesSchema::from([
            ("open".to_string(), CellSchema::boolean_with_default(true)),
            ("name".to_string(), CellSchema::string()),
        ]));
        state.set_values(Values::from([("name".to_string(), Cell::from("shop"))]));
        assert_eq!(state.values["open"], Cell::from(true));
        state.set_values(Values::from([("open".to_string(), Cell::from(false))]));
        assert!(!state.values.contains_key("name"));
        state.del_values();
        assert_eq!(state.values["open"], Cell::from(true));
    }
}
