//! Store - the reactive container of tables and values.
//!
//! A [`Store`] is a cheap handle: clones share the same content and
//! listeners. Every write runs in a transaction, and listeners are called
//! once the outermost transaction finishes.

use crate::{
    changes::{Changes, Content, GetCellChange, GetValueChange, TransactionLog},
    config::StoreConfig,
    error::Result,
    listeners::{pattern, Bucket, Callback, Kind, ListenerStats, PathPattern, Registry},
    schema::{check_tables_schema, check_values_schema, TablesSchema, ValuesSchema},
    stamp::Stamps,
    state::StoreState,
    Cell, CellWrite, ChangedIds, Id, Ids, ListenerId, Row, Table, Tables, Value, ValueWrite,
    Values,
};
use std::cell::{Cell as StdCell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

/// Where the store is in its transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Writes are applied and logged
    Transacting,
    /// Non-mutator listeners are running; writes are ignored
    Notifying,
}

pub(crate) struct StoreInner {
    pub(crate) state: RefCell<StoreState>,
    listeners: RefCell<Registry>,
    transactions: StdCell<u32>,
    phase: StdCell<Phase>,
    config: StoreConfig,
}

/// The main store holding tables, values, schemas and listeners.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Rc<StoreInner>,
}

/// A store reference that does not keep the store alive.
#[derive(Clone)]
pub(crate) struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.state.try_borrow() {
            Ok(state) => f
                .debug_struct("Store")
                .field("tables", &state.tables)
                .field("values", &state.values)
                .finish_non_exhaustive(),
            Err(_) => f.debug_struct("Store").finish_non_exhaustive(),
        }
    }
}

impl Store {
    /// Create an empty store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create an empty store.
    pub fn with_config(config: StoreConfig) -> Self {
        Self::create(config, None)
    }

    pub(crate) fn create(config: StoreConfig, stamps: Option<Stamps>) -> Self {
        let mut state = StoreState::new(config.reuse_row_ids);
        state.stamps = stamps;
        Self {
            inner: Rc::new(StoreInner {
                state: RefCell::new(state),
                listeners: RefCell::new(Registry::default()),
                transactions: StdCell::new(0),
                phase: StdCell::new(Phase::Idle),
                config,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore(Rc::downgrade(&self.inner))
    }

    /// Get the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Whether this store carries stamps for merging.
    pub fn is_mergeable(&self) -> bool {
        self.read(|state| state.stamps.is_some())
    }

    pub(crate) fn read<T>(&self, read: impl FnOnce(&StoreState) -> T) -> T {
        read(&self.inner.state.borrow())
    }

    /// Run `action` against the state inside a transaction.
    pub(crate) fn write(&self, action: impl FnOnce(&mut StoreState)) -> &Self {
        if self.is_notifying() {
            tracing::warn!("ignoring write made while listeners are being notified");
            return self;
        }
        self.start_transaction();
        action(&mut self.inner.state.borrow_mut());
        self.finish_transaction()
    }

    pub(crate) fn is_notifying(&self) -> bool {
        self.inner.phase.get() == Phase::Notifying
    }

    // Reads

    pub fn get_tables(&self) -> Tables {
        self.read(|state| state.tables.clone())
    }

    pub fn has_tables(&self) -> bool {
        self.read(|state| !state.tables.is_empty())
    }

    pub fn get_table_ids(&self) -> Ids {
        self.read(|state| state.tables.keys().cloned().collect())
    }

    pub fn has_table(&self, table_id: &str) -> bool {
        self.read(|state| state.tables.contains_key(table_id))
    }

    /// The table, or an empty one if it does not exist.
    pub fn get_table(&self, table_id: &str) -> Table {
        self.read(|state| state.tables.get(table_id).cloned().unwrap_or_default())
    }

    /// Ids of every cell used by at least one row of the table.
    pub fn get_table_cell_ids(&self, table_id: &str) -> Ids {
        self.read(|state| state.table_cell_ids(table_id))
    }

    pub fn has_table_cell(&self, table_id: &str, cell_id: &str) -> bool {
        self.get_table_cell_ids(table_id)
            .iter()
            .any(|existing| existing == cell_id)
    }

    pub fn get_row_count(&self, table_id: &str) -> usize {
        self.read(|state| state.tables.get(table_id).map_or(0, Table::len))
    }

    pub fn get_row_ids(&self, table_id: &str) -> Ids {
        self.read(|state| {
            state
                .tables
                .get(table_id)
                .map(|table| table.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Row ids sorted by a cell (or by id when `cell_id` is `None`), then
    /// paged. Rows lacking the cell sort first; ties break on row id.
    pub fn get_sorted_row_ids(
        &self,
        table_id: &str,
        cell_id: Option<&str>,
        descending: bool,
        offset: usize,
        limit: Option<usize>,
    ) -> Ids {
        self.read(|state| {
            let Some(table) = state.tables.get(table_id) else {
                return Ids::new();
            };
            let mut rows: Vec<(&Id, Option<&Cell>)> = table
                .iter()
                .map(|(row_id, row)| (row_id, cell_id.and_then(|cell_id| row.get(cell_id))))
                .collect();
            rows.sort_by(|(a_id, a), (b_id, b)| {
                let order = match (a, b) {
                    (Some(a), Some(b)) => a.sort_cmp(b),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
                .then_with(|| a_id.cmp(b_id));
                if descending {
                    order.reverse()
                } else {
                    order
                }
            });
            rows.into_iter()
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .map(|(row_id, _)| row_id.clone())
                .collect()
        })
    }

    pub fn has_row(&self, table_id: &str, row_id: &str) -> bool {
        self.read(|state| state.has_row(table_id, row_id))
    }

    /// The row, or an empty one if it does not exist.
    pub fn get_row(&self, table_id: &str, row_id: &str) -> Row {
        self.read(|state| {
            state
                .tables
                .get(table_id)
                .and_then(|table| table.get(row_id))
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn get_cell_ids(&self, table_id: &str, row_id: &str) -> Ids {
        self.read(|state| {
            state
                .tables
                .get(table_id)
                .and_then(|table| table.get(row_id))
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn has_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> bool {
        self.read(|state| state.has_cell(table_id, row_id, cell_id))
    }

    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<Cell> {
        self.read(|state| {
            state
                .tables
                .get(table_id)
                .and_then(|table| table.get(row_id))
                .and_then(|row| row.get(cell_id))
                .cloned()
        })
    }

    pub fn get_values(&self) -> Values {
        self.read(|state| state.values.clone())
    }

    pub fn has_values(&self) -> bool {
        self.read(|state| !state.values.is_empty())
    }

    pub fn get_value_ids(&self) -> Ids {
        self.read(|state| state.values.keys().cloned().collect())
    }

    pub fn has_value(&self, value_id: &str) -> bool {
        self.read(|state| state.values.contains_key(value_id))
    }

    pub fn get_value(&self, value_id: &str) -> Option<Value> {
        self.read(|state| state.values.get(value_id).cloned())
    }

    pub fn get_content(&self) -> Content {
        self.read(|state| (state.tables.clone(), state.values.clone()))
    }

    /// Content as `[tables, values]` JSON.
    pub fn get_json(&self) -> String {
        self.read(|state| {
            serde_json::to_string(&(&state.tables, &state.values)).unwrap_or_default()
        })
    }

    pub fn get_tables_json(&self) -> String {
        self.read(|state| serde_json::to_string(&state.tables).unwrap_or_default())
    }

    pub fn get_values_json(&self) -> String {
        self.read(|state| serde_json::to_string(&state.values).unwrap_or_default())
    }

    pub fn has_tables_schema(&self) -> bool {
        self.read(|state| state.tables_schema.is_some())
    }

    pub fn has_values_schema(&self) -> bool {
        self.read(|state| state.values_schema.is_some())
    }

    /// Both schemas as `[tablesSchema, valuesSchema]` JSON, `{}` when unset.
    pub fn get_schema_json(&self) -> String {
        self.read(|state| {
            serde_json::to_string(&(
                state.tables_schema.clone().unwrap_or_default(),
                state.values_schema.clone().unwrap_or_default(),
            ))
            .unwrap_or_default()
        })
    }

    pub fn get_tables_schema_json(&self) -> String {
        self.read(|state| {
            serde_json::to_string(&state.tables_schema.clone().unwrap_or_default())
                .unwrap_or_default()
        })
    }

    pub fn get_values_schema_json(&self) -> String {
        self.read(|state| {
            serde_json::to_string(&state.values_schema.clone().unwrap_or_default())
                .unwrap_or_default()
        })
    }

    // Writes

    pub fn set_tables(&self, tables: Tables) -> &Self {
        self.write(|state| state.set_tables(tables))
    }

    pub fn set_table(&self, table_id: &str, table: Table) -> &Self {
        self.write(|state| state.set_table(table_id, table))
    }

    pub fn set_row(&self, table_id: &str, row_id: &str, row: Row) -> &Self {
        self.write(|state| state.set_row(table_id, row_id, row))
    }

    /// Add a row under a new id, returning the id, or `None` if nothing
    /// valid was written.
    pub fn add_row(&self, table_id: &str, row: Row) -> Option<Id> {
        let mut row_id = None;
        self.write(|state| row_id = state.add_row(table_id, row));
        row_id
    }

    pub fn set_partial_row(&self, table_id: &str, row_id: &str, partial: Row) -> &Self {
        self.write(|state| state.set_partial_row(table_id, row_id, partial))
    }

    /// Set a cell to a literal, or to the result of a mapper applied to
    /// the current cell.
    pub fn set_cell(
        &self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        cell: impl Into<CellWrite>,
    ) -> &Self {
        let cell = cell
            .into()
            .resolve(self.get_cell(table_id, row_id, cell_id).as_ref());
        self.write(|state| state.set_cell(table_id, row_id, cell_id, cell))
    }

    pub fn set_values(&self, values: Values) -> &Self {
        self.write(|state| state.set_values(values))
    }

    pub fn set_partial_values(&self, partial: Values) -> &Self {
        self.write(|state| state.set_partial_values(partial))
    }

    pub fn set_value(&self, value_id: &str, value: impl Into<ValueWrite>) -> &Self {
        let value = value.into().resolve(self.get_value(value_id).as_ref());
        self.write(|state| state.set_value(value_id, value))
    }

    pub fn del_tables(&self) -> &Self {
        self.write(StoreState::del_tables)
    }

    pub fn del_table(&self, table_id: &str) -> &Self {
        self.write(|state| state.del_table(table_id))
    }

    pub fn del_row(&self, table_id: &str, row_id: &str) -> &Self {
        self.write(|state| state.del_row(table_id, row_id))
    }

    /// Delete a cell, or reset it if the schema declares a default.
    pub fn del_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> &Self {
        self.write(|state| state.del_cell(table_id, row_id, cell_id, false))
    }

    /// Delete a cell even if the schema declares a default.
    pub fn force_del_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> &Self {
        self.write(|state| state.del_cell(table_id, row_id, cell_id, true))
    }

    pub fn del_values(&self) -> &Self {
        self.write(StoreState::del_values)
    }

    /// Delete a value, or reset it if the schema declares a default.
    pub fn del_value(&self, value_id: &str) -> &Self {
        self.write(|state| state.del_value(value_id, false))
    }

    /// Replace all content. Empty tables or values clear that side.
    pub fn set_content(&self, content: Content) -> &Self {
        let (tables, values) = content;
        self.write(|state| state.set_content(tables, values))
    }

    pub fn apply_changes(&self, changes: Changes) -> &Self {
        self.write(|state| state.apply_changes(changes))
    }

    /// Replace all content from `[tables, values]` JSON.
    pub fn set_json(&self, json: &str) -> Result<&Self> {
        let content: Content = serde_json::from_str(json)?;
        Ok(self.set_content(content))
    }

    pub fn set_tables_json(&self, json: &str) -> Result<&Self> {
        let tables: Tables = serde_json::from_str(json)?;
        Ok(self.set_tables(tables))
    }

    pub fn set_values_json(&self, json: &str) -> Result<&Self> {
        let values: Values = serde_json::from_str(json)?;
        Ok(self.set_values(values))
    }

    // Schemas

    /// Set the tables schema and bring existing cells in line with it.
    pub fn set_tables_schema(&self, schema: TablesSchema) -> Result<&Self> {
        let schema = check_tables_schema(schema)?;
        Ok(self.write(|state| {
            state.tables_schema = Some(schema);
            state.revalidate_tables();
        }))
    }

    /// Set the values schema and bring existing values in line with it.
    pub fn set_values_schema(&self, schema: ValuesSchema) -> Result<&Self> {
        let schema = check_values_schema(schema)?;
        Ok(self.write(|state| {
            state.values_schema = Some(schema);
            state.revalidate_values();
        }))
    }

    pub fn set_schema(&self, tables: TablesSchema, values: ValuesSchema) -> Result<&Self> {
        let tables = check_tables_schema(tables)?;
        let values = check_values_schema(values)?;
        Ok(self.write(|state| {
            state.tables_schema = Some(tables);
            state.values_schema = Some(values);
            state.revalidate_tables();
            state.revalidate_values();
        }))
    }

    pub fn del_tables_schema(&self) -> &Self {
        self.write(|state| state.tables_schema = None)
    }

    pub fn del_values_schema(&self) -> &Self {
        self.write(|state| state.values_schema = None)
    }

    pub fn del_schema(&self) -> &Self {
        self.write(|state| {
            state.tables_schema = None;
            state.values_schema = None;
        })
    }

    // Transactions

    /// Run `actions` in one transaction, calling listeners once at the end.
    pub fn transaction<T>(&self, actions: impl FnOnce() -> T) -> T {
        self.transaction_with_rollback(actions, |_| false)
    }

    /// Like [`Store::transaction`], but reverts everything if `do_rollback`
    /// returns true. Listeners then see no changes.
    pub fn transaction_with_rollback<T>(
        &self,
        actions: impl FnOnce() -> T,
        do_rollback: impl FnOnce(&Store) -> bool,
    ) -> T {
        self.start_transaction();
        let result = actions();
        self.finish_transaction_with_rollback(do_rollback);
        result
    }

    pub fn start_transaction(&self) -> &Self {
        if self.is_notifying() {
            tracing::warn!("ignoring transaction started while listeners are being notified");
            return self;
        }
        let depth = self.inner.transactions.get();
        self.inner.transactions.set(depth + 1);
        if depth == 0 {
            self.inner.phase.set(Phase::Transacting);
            self.inner.state.borrow_mut().begin();
            self.call_transaction_listeners(Kind::StartTransaction);
        }
        self
    }

    pub fn finish_transaction(&self) -> &Self {
        self.finish_transaction_with_rollback(|_| false)
    }

    pub fn finish_transaction_with_rollback(
        &self,
        do_rollback: impl FnOnce(&Store) -> bool,
    ) -> &Self {
        if self.is_notifying() {
            return self;
        }
        let depth = self.inner.transactions.get();
        if depth != 1 {
            self.inner.transactions.set(depth.saturating_sub(1));
            return self;
        }

        if self.has_listeners(Bucket::Mutator) {
            let log = self.get_transaction_log();
            self.call_listeners(Bucket::Mutator, &log);
        }
        if do_rollback(self) {
            tracing::debug!("rolling back transaction");
            self.inner.state.borrow_mut().rollback();
        }
        self.call_transaction_listeners(Kind::WillFinishTransaction);

        self.inner.phase.set(Phase::Notifying);
        let log = self.get_transaction_log();
        if log.has_changes() {
            tracing::debug!(
                changed_cells = log.changed_cell_count(),
                changed_values = log.changed_values.len(),
                "transaction finished"
            );
        }
        self.call_listeners(Bucket::Internal, &log);
        self.call_listeners(Bucket::User, &log);
        self.call_transaction_listeners(Kind::DidFinishTransaction);
        self.inner.transactions.set(0);
        self.inner.phase.set(Phase::Idle);
        self
    }

    /// Net changes of the current, or last finished, transaction.
    pub fn get_transaction_changes(&self) -> Changes {
        self.read(|state| state.log.to_changes())
    }

    /// Full log of the current, or last finished, transaction.
    pub fn get_transaction_log(&self) -> TransactionLog {
        self.read(|state| state.log.clone())
    }

    // Dispatch

    fn has_listeners(&self, bucket: Bucket) -> bool {
        self.inner.listeners.borrow().has_bucket(bucket)
    }

    /// Call each matching listener, looking it up again at call time so
    /// that one removed by an earlier listener is skipped.
    fn each_listener(&self, kind: Kind, bucket: Bucket, path: &[&str], mut call: impl FnMut(Callback)) {
        let ids = self.inner.listeners.borrow().ids_for(kind, bucket, path);
        for id in ids {
            let callback = self.inner.listeners.borrow().get(kind, bucket, id);
            if let Some(callback) = callback {
                call(callback);
            }
        }
    }

    fn call_transaction_listeners(&self, kind: Kind) {
        for bucket in [Bucket::Internal, Bucket::User] {
            self.each_listener(kind, bucket, &[], |callback| match callback {
                Callback::StartTransaction(listener)
                | Callback::WillFinishTransaction(listener)
                | Callback::DidFinishTransaction(listener) => listener(self),
                _ => {}
            });
        }
    }

    fn call_listeners(&self, bucket: Bucket, log: &TransactionLog) {
        if !self.has_listeners(bucket) {
            return;
        }
        self.call_tabular_listeners(bucket, log);
        self.call_values_listeners(bucket, log);
    }

    fn call_tabular_listeners(&self, bucket: Bucket, log: &TransactionLog) {
        let get_cell_change = GetCellChange { log, store: self };

        for (table_id, rows) in &log.invalid_cells {
            for (row_id, cells) in rows {
                for (cell_id, invalid) in cells {
                    let path = [table_id.as_str(), row_id.as_str(), cell_id.as_str()];
                    self.each_listener(Kind::InvalidCell, bucket, &path, |callback| {
                        if let Callback::InvalidCell(listener) = callback {
                            listener(self, table_id, row_id, cell_id, invalid);
                        }
                    });
                }
            }
        }

        if !log.changed_table_ids.is_empty() {
            self.each_listener(Kind::TableIds, bucket, &[], |callback| {
                if let Callback::TableIds(listener) = callback {
                    listener(self, &log.changed_table_ids);
                }
            });
        }
        for (table_id, ids) in non_empty(&log.changed_table_cell_ids) {
            self.each_listener(Kind::TableCellIds, bucket, &[table_id], |callback| {
                if let Callback::TableCellIds(listener) = callback {
                    listener(self, table_id, ids);
                }
            });
        }
        for (table_id, _) in non_empty(&log.changed_row_ids) {
            self.each_listener(Kind::RowCount, bucket, &[table_id], |callback| {
                if let Callback::RowCount(listener) = callback {
                    listener(self, table_id, self.get_row_count(table_id));
                }
            });
        }
        for (table_id, ids) in non_empty(&log.changed_row_ids) {
            self.each_listener(Kind::RowIds, bucket, &[table_id], |callback| {
                if let Callback::RowIds(listener) = callback {
                    listener(self, table_id, ids);
                }
            });
        }
        for (table_id, rows) in &log.changed_cell_ids {
            for (row_id, ids) in non_empty(rows) {
                self.each_listener(Kind::CellIds, bucket, &[table_id, row_id], |callback| {
                    if let Callback::CellIds(listener) = callback {
                        listener(self, table_id, row_id, ids);
                    }
                });
            }
        }

        let mut changed_rows: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (table_id, rows) in &log.changed_cells {
            for (row_id, cells) in rows {
                for (cell_id, (old, new)) in cells {
                    if old == new {
                        continue;
                    }
                    changed_rows.entry(table_id).or_default().insert(row_id);
                    let path = [table_id.as_str(), row_id.as_str(), cell_id.as_str()];
                    self.each_listener(Kind::Cell, bucket, &path, |callback| {
                        if let Callback::Cell(listener) = callback {
                            listener(
                                self,
                                table_id,
                                row_id,
                                cell_id,
                                new.as_ref(),
                                old.as_ref(),
                                &get_cell_change,
                            );
                        }
                    });
                }
            }
        }
        for (table_id, row_ids) in &changed_rows {
            for row_id in row_ids {
                self.each_listener(Kind::Row, bucket, &[table_id, row_id], |callback| {
                    if let Callback::Row(listener) = callback {
                        listener(self, table_id, row_id, &get_cell_change);
                    }
                });
            }
        }
        for table_id in changed_rows.keys() {
            self.each_listener(Kind::Table, bucket, &[table_id], |callback| {
                if let Callback::Table(listener) = callback {
                    listener(self, table_id, &get_cell_change);
                }
            });
        }
        if !changed_rows.is_empty() {
            self.each_listener(Kind::Tables, bucket, &[], |callback| {
                if let Callback::Tables(listener) = callback {
                    listener(self, &get_cell_change);
                }
            });
        }
    }

    fn call_values_listeners(&self, bucket: Bucket, log: &TransactionLog) {
        let get_value_change = GetValueChange { log, store: self };

        for (value_id, invalid) in &log.invalid_values {
            self.each_listener(Kind::InvalidValue, bucket, &[value_id], |callback| {
                if let Callback::InvalidValue(listener) = callback {
                    listener(self, value_id, invalid);
                }
            });
        }
        if !log.changed_value_ids.is_empty() {
            self.each_listener(Kind::ValueIds, bucket, &[], |callback| {
                if let Callback::ValueIds(listener) = callback {
                    listener(self, &log.changed_value_ids);
                }
            });
        }
        let mut any_changed = false;
        for (value_id, (old, new)) in &log.changed_values {
            if old == new {
                continue;
            }
            any_changed = true;
            self.each_listener(Kind::Value, bucket, &[value_id], |callback| {
                if let Callback::Value(listener) = callback {
                    listener(self, value_id, new.as_ref(), old.as_ref(), &get_value_change);
                }
            });
        }
        if any_changed {
            self.each_listener(Kind::Values, bucket, &[], |callback| {
                if let Callback::Values(listener) = callback {
                    listener(self, &get_value_change);
                }
            });
        }
    }

    // Listeners

    pub(crate) fn add_listener(&self, path: PathPattern, callback: Callback, bucket: Bucket) -> ListenerId {
        self.inner.listeners.borrow_mut().add(path, callback, bucket)
    }

    pub fn add_tables_listener(
        &self,
        listener: impl Fn(&Store, &GetCellChange) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(vec![], Callback::Tables(Rc::new(listener)), Bucket::user(mutator))
    }

    pub fn add_table_ids_listener(
        &self,
        listener: impl Fn(&Store, &ChangedIds) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(vec![], Callback::TableIds(Rc::new(listener)), Bucket::user(mutator))
    }

    /// `None` listens to every table.
    pub fn add_table_listener(
        &self,
        table_id: Option<&str>,
        listener: impl Fn(&Store, &str, &GetCellChange) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id]),
            Callback::Table(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_table_cell_ids_listener(
        &self,
        table_id: Option<&str>,
        listener: impl Fn(&Store, &str, &ChangedIds) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id]),
            Callback::TableCellIds(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_row_count_listener(
        &self,
        table_id: Option<&str>,
        listener: impl Fn(&Store, &str, usize) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id]),
            Callback::RowCount(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_row_ids_listener(
        &self,
        table_id: Option<&str>,
        listener: impl Fn(&Store, &str, &ChangedIds) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id]),
            Callback::RowIds(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_row_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        listener: impl Fn(&Store, &str, &str, &GetCellChange) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id, row_id]),
            Callback::Row(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_cell_ids_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        listener: impl Fn(&Store, &str, &str, &ChangedIds) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id, row_id]),
            Callback::CellIds(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    /// The listener gets `(store, table, row, cell, new, old, get_cell_change)`.
    pub fn add_cell_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        listener: impl Fn(&Store, &str, &str, &str, Option<&Cell>, Option<&Cell>, &GetCellChange)
            + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id, row_id, cell_id]),
            Callback::Cell(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    /// Called with every rejected write to a matching cell.
    pub fn add_invalid_cell_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        listener: impl Fn(&Store, &str, &str, &str, &[Cell]) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[table_id, row_id, cell_id]),
            Callback::InvalidCell(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_values_listener(
        &self,
        listener: impl Fn(&Store, &GetValueChange) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(vec![], Callback::Values(Rc::new(listener)), Bucket::user(mutator))
    }

    pub fn add_value_ids_listener(
        &self,
        listener: impl Fn(&Store, &ChangedIds) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(vec![], Callback::ValueIds(Rc::new(listener)), Bucket::user(mutator))
    }

    /// The listener gets `(store, value, new, old, get_value_change)`.
    pub fn add_value_listener(
        &self,
        value_id: Option<&str>,
        listener: impl Fn(&Store, &str, Option<&Value>, Option<&Value>, &GetValueChange) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[value_id]),
            Callback::Value(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_invalid_value_listener(
        &self,
        value_id: Option<&str>,
        listener: impl Fn(&Store, &str, &[Value]) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            pattern(&[value_id]),
            Callback::InvalidValue(Rc::new(listener)),
            Bucket::user(mutator),
        )
    }

    pub fn add_start_transaction_listener(&self, listener: impl Fn(&Store) + 'static) -> ListenerId {
        self.add_listener(
            vec![],
            Callback::StartTransaction(Rc::new(listener)),
            Bucket::User,
        )
    }

    /// Called before listeners are notified; may still write.
    pub fn add_will_finish_transaction_listener(
        &self,
        listener: impl Fn(&Store) + 'static,
    ) -> ListenerId {
        self.add_listener(
            vec![],
            Callback::WillFinishTransaction(Rc::new(listener)),
            Bucket::User,
        )
    }

    /// Called after every other listener.
    pub fn add_did_finish_transaction_listener(
        &self,
        listener: impl Fn(&Store) + 'static,
    ) -> ListenerId {
        self.add_listener(
            vec![],
            Callback::DidFinishTransaction(Rc::new(listener)),
            Bucket::User,
        )
    }

    pub fn del_listener(&self, listener_id: ListenerId) -> &Self {
        self.inner.listeners.borrow_mut().remove(listener_id);
        self
    }

    pub fn get_listener_stats(&self) -> ListenerStats {
        self.inner.listeners.borrow().stats()
    }

    /// Remove every listener. The content is kept.
    pub fn destroy(&self) {
        self.inner.listeners.borrow_mut().clear();
    }
}

/// Entries whose id changes did not net out to nothing.
fn non_empty<'a, T>(
    map: &'a BTreeMap<Id, BTreeMap<Id, T>>,
) -> impl Iterator<Item = (&'a str, &'a BTreeMap<Id, T>)> {
    map.iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(id, ids)| (id.as_str(), ids))
}
