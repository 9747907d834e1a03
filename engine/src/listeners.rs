//! Listener registries.
//!
//! Listeners subscribe to a path such as `(table, row, cell)`, where any
//! segment may be `None` to match every id at that level. Paths are stored
//! in a trie so that finding the listeners for a changed path is a bounded
//! walk rather than a scan of every listener.

use crate::{
    changes::{ChangedIds, GetCellChange, GetValueChange},
    Cell, Id, ListenerId, Store, Value,
};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A path pattern; `None` matches any id at that level.
pub type PathPattern = Vec<Option<Id>>;

#[derive(Debug, Default)]
struct PathNode {
    ids: Vec<ListenerId>,
    children: BTreeMap<Option<Id>, PathNode>,
}

impl PathNode {
    fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.children.is_empty()
    }

    fn insert(&mut self, path: &[Option<Id>], id: ListenerId) {
        match path.split_first() {
            None => self.ids.push(id),
            Some((segment, rest)) => self
                .children
                .entry(segment.clone())
                .or_default()
                .insert(rest, id),
        }
    }

    /// Remove `id`, pruning nodes left empty.
    fn remove(&mut self, path: &[Option<Id>], id: ListenerId) {
        match path.split_first() {
            None => self.ids.retain(|existing| *existing != id),
            Some((segment, rest)) => {
                if let Some(child) = self.children.get_mut(segment) {
                    child.remove(rest, id);
                    if child.is_empty() {
                        self.children.remove(segment);
                    }
                }
            }
        }
    }

    /// Specific matches before wildcard ones at every level.
    fn collect(&self, path: &[&str], found: &mut Vec<ListenerId>) {
        match path.split_first() {
            None => found.extend(&self.ids),
            Some((segment, rest)) => {
                if let Some(child) = self.children.get(&Some((*segment).to_string())) {
                    child.collect(rest, found);
                }
                if let Some(child) = self.children.get(&None) {
                    child.collect(rest, found);
                }
            }
        }
    }
}

/// Listeners of one kind, indexed by path.
pub struct ListenerSet<F: ?Sized> {
    entries: BTreeMap<ListenerId, (PathPattern, Rc<F>)>,
    tree: PathNode,
}

impl<F: ?Sized> Default for ListenerSet<F> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            tree: PathNode::default(),
        }
    }
}

impl<F: ?Sized> ListenerSet<F> {
    pub fn add(&mut self, id: ListenerId, path: PathPattern, listener: Rc<F>) {
        self.tree.insert(&path, id);
        self.entries.insert(id, (path, listener));
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        match self.entries.remove(&id) {
            Some((path, _)) => {
                self.tree.remove(&path, id);
                true
            }
            None => false,
        }
    }

    /// Ids of listeners matching a concrete path, in call order.
    pub fn ids_for(&self, path: &[&str]) -> Vec<ListenerId> {
        let mut found = Vec::new();
        self.tree.collect(path, &mut found);
        found
    }

    pub fn get(&self, id: ListenerId) -> Option<Rc<F>> {
        self.entries.get(&id).map(|(_, listener)| Rc::clone(listener))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.tree = PathNode::default();
    }
}

/// The listeners matching `path`, copied out so that they may add or
/// remove listeners while being called.
pub(crate) fn matching<F: ?Sized>(set: &RefCell<ListenerSet<F>>, path: &[&str]) -> Vec<Rc<F>> {
    let set = set.borrow();
    set.ids_for(path)
        .into_iter()
        .filter_map(|id| set.get(id))
        .collect()
}

pub type TablesListener = Rc<dyn Fn(&Store, &GetCellChange)>;
pub type IdsListener = Rc<dyn Fn(&Store, &ChangedIds)>;
pub type TableListener = Rc<dyn Fn(&Store, &str, &GetCellChange)>;
pub type TableIdsListener = Rc<dyn Fn(&Store, &str, &ChangedIds)>;
pub type RowCountListener = Rc<dyn Fn(&Store, &str, usize)>;
pub type RowListener = Rc<dyn Fn(&Store, &str, &str, &GetCellChange)>;
pub type CellIdsListener = Rc<dyn Fn(&Store, &str, &str, &ChangedIds)>;
/// Called with `(store, table, row, cell, new, old, get_cell_change)`.
pub type CellListener =
    Rc<dyn Fn(&Store, &str, &str, &str, Option<&Cell>, Option<&Cell>, &GetCellChange)>;
pub type InvalidCellListener = Rc<dyn Fn(&Store, &str, &str, &str, &[Cell])>;
pub type ValuesListener = Rc<dyn Fn(&Store, &GetValueChange)>;
/// Called with `(store, value, new, old, get_value_change)`.
pub type ValueListener = Rc<dyn Fn(&Store, &str, Option<&Value>, Option<&Value>, &GetValueChange)>;
pub type InvalidValueListener = Rc<dyn Fn(&Store, &str, &[Value])>;
pub type TransactionListener = Rc<dyn Fn(&Store)>;

/// What a store listener listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Kind {
    Tables,
    TableIds,
    Table,
    TableCellIds,
    RowCount,
    RowIds,
    Row,
    CellIds,
    Cell,
    InvalidCell,
    Values,
    ValueIds,
    Value,
    InvalidValue,
    StartTransaction,
    WillFinishTransaction,
    DidFinishTransaction,
}

/// Which dispatch pass a store listener is called in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Bucket {
    /// Called inside the transaction; may write
    Mutator,
    /// Derived components, called before user listeners
    Internal,
    User,
}

impl Bucket {
    pub(crate) fn user(mutator: bool) -> Self {
        if mutator {
            Bucket::Mutator
        } else {
            Bucket::User
        }
    }
}

#[derive(Clone)]
pub(crate) enum Callback {
    Tables(TablesListener),
    TableIds(IdsListener),
    Table(TableListener),
    TableCellIds(TableIdsListener),
    RowCount(RowCountListener),
    RowIds(TableIdsListener),
    Row(RowListener),
    CellIds(CellIdsListener),
    Cell(CellListener),
    InvalidCell(InvalidCellListener),
    Values(ValuesListener),
    ValueIds(IdsListener),
    Value(ValueListener),
    InvalidValue(InvalidValueListener),
    StartTransaction(TransactionListener),
    WillFinishTransaction(TransactionListener),
    DidFinishTransaction(TransactionListener),
}

impl Callback {
    pub(crate) fn kind(&self) -> Kind {
        match self {
            Callback::Tables(_) => Kind::Tables,
            Callback::TableIds(_) => Kind::TableIds,
            Callback::Table(_) => Kind::Table,
            Callback::TableCellIds(_) => Kind::TableCellIds,
            Callback::RowCount(_) => Kind::RowCount,
            Callback::RowIds(_) => Kind::RowIds,
            Callback::Row(_) => Kind::Row,
            Callback::CellIds(_) => Kind::CellIds,
            Callback::Cell(_) => Kind::Cell,
            Callback::InvalidCell(_) => Kind::InvalidCell,
            Callback::Values(_) => Kind::Values,
            Callback::ValueIds(_) => Kind::ValueIds,
            Callback::Value(_) => Kind::Value,
            Callback::InvalidValue(_) => Kind::InvalidValue,
            Callback::StartTransaction(_) => Kind::StartTransaction,
            Callback::WillFinishTransaction(_) => Kind::WillFinishTransaction,
            Callback::DidFinishTransaction(_) => Kind::DidFinishTransaction,
        }
    }
}

/// Every listener registered on one store.
#[derive(Default)]
pub(crate) struct Registry {
    sets: BTreeMap<(Kind, Bucket), ListenerSet<Callback>>,
    owners: BTreeMap<ListenerId, (Kind, Bucket)>,
    next_id: ListenerId,
}

impl Registry {
    pub(crate) fn add(&mut self, path: PathPattern, callback: Callback, bucket: Bucket) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        let kind = callback.kind();
        self.sets
            .entry((kind, bucket))
            .or_default()
            .add(id, path, Rc::new(callback));
        self.owners.insert(id, (kind, bucket));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let Some(key) = self.owners.remove(&id) else {
            return false;
        };
        if let Some(set) = self.sets.get_mut(&key) {
            set.remove(id);
            if set.is_empty() {
                self.sets.remove(&key);
            }
        }
        true
    }

    pub(crate) fn ids_for(&self, kind: Kind, bucket: Bucket, path: &[&str]) -> Vec<ListenerId> {
        self.sets
            .get(&(kind, bucket))
            .map(|set| set.ids_for(path))
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, kind: Kind, bucket: Bucket, id: ListenerId) -> Option<Callback> {
        self.sets
            .get(&(kind, bucket))
            .and_then(|set| set.get(id))
            .map(|callback| (*callback).clone())
    }

    /// Whether any listener of `bucket` exists at all.
    pub(crate) fn has_bucket(&self, bucket: Bucket) -> bool {
        self.sets.keys().any(|(_, existing)| *existing == bucket)
    }

    pub(crate) fn clear(&mut self) {
        self.sets.clear();
        self.owners.clear();
    }

    pub(crate) fn stats(&self) -> ListenerStats {
        let count = |kinds: &[Kind]| {
            self.sets
                .iter()
                .filter(|((kind, _), _)| kinds.contains(kind))
                .map(|(_, set)| set.len())
                .sum()
        };
        ListenerStats {
            tables: count(&[Kind::Tables]),
            table_ids: count(&[Kind::TableIds]),
            table: count(&[Kind::Table]),
            table_cell_ids: count(&[Kind::TableCellIds]),
            row_count: count(&[Kind::RowCount]),
            row_ids: count(&[Kind::RowIds]),
            row: count(&[Kind::Row]),
            cell_ids: count(&[Kind::CellIds]),
            cell: count(&[Kind::Cell]),
            invalid_cell: count(&[Kind::InvalidCell]),
            values: count(&[Kind::Values]),
            value_ids: count(&[Kind::ValueIds]),
            value: count(&[Kind::Value]),
            invalid_value: count(&[Kind::InvalidValue]),
            transaction: count(&[
                Kind::StartTransaction,
                Kind::WillFinishTransaction,
                Kind::DidFinishTransaction,
            ]),
        }
    }
}

/// How many listeners of each kind a store has.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStats {
    pub tables: usize,
    pub table_ids: usize,
    pub table: usize,
    pub table_cell_ids: usize,
    pub row_count: usize,
    pub row_ids: usize,
    pub row: usize,
    pub cell_ids: usize,
    pub cell: usize,
    pub invalid_cell: usize,
    pub values: usize,
    pub value_ids: usize,
    pub value: usize,
    pub invalid_value: usize,
    pub transaction: usize,
}

/// Convert borrowed optional ids into a stored path pattern.
pub(crate) fn pattern(path: &[Option<&str>]) -> PathPattern {
    path.iter().map(|segment| segment.map(str::to_string)).collect()
}
