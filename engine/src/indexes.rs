//! Indexes - rows of a table grouped into slices and sorted within them.

use crate::{
    derived::Derived,
    listeners::{matching, pattern, ListenerSet},
    Cell, Id, Ids, ListenerId, Row, Store, Table,
};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

type SliceId = Rc<dyn Fn(&Row, &str) -> Option<Id>>;
type SortKey = Rc<dyn Fn(&Row, &str) -> Option<Cell>>;
type SliceIdSorter = Rc<dyn Fn(&str, &str) -> Ordering>;
type RowIdSorter = Rc<dyn Fn(&SortEntry, &SortEntry, &str) -> Ordering>;

/// A row's sort key and id, as handed to a row id sorter.
#[derive(Debug, Clone, PartialEq)]
pub struct SortEntry {
    pub key: Option<Cell>,
    pub row_id: Id,
}

/// How the rows of a table are sliced and sorted.
///
/// Without a slicer every row lands in the slice `""`. Without a sort key
/// rows sort by id. Slice ids sort ascending unless a sorter is given.
#[derive(Clone)]
pub struct IndexDefinition {
    table_id: Id,
    slice_id: Option<SliceId>,
    sort_key: Option<SortKey>,
    slice_id_sorter: Option<SliceIdSorter>,
    row_id_sorter: Option<RowIdSorter>,
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("table_id", &self.table_id)
            .finish_non_exhaustive()
    }
}

impl IndexDefinition {
    pub fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            slice_id: None,
            sort_key: None,
            slice_id_sorter: None,
            row_id_sorter: None,
        }
    }

    /// Slice by the text form of a cell. Rows without it are not indexed.
    pub fn slice_by_cell(mut self, cell_id: &str) -> Self {
        let cell_id = cell_id.to_string();
        self.slice_id = Some(Rc::new(move |row: &Row, _: &str| {
            row.get(&cell_id).map(Cell::to_id)
        }));
        self
    }

    /// Slice by a computed id; `None` leaves the row out.
    pub fn slice_by(mut self, slice_id: impl Fn(&Row, &str) -> Option<Id> + 'static) -> Self {
        self.slice_id = Some(Rc::new(slice_id));
        self
    }

    pub fn sort_by_cell(mut self, cell_id: &str) -> Self {
        let cell_id = cell_id.to_string();
        self.sort_key = Some(Rc::new(move |row: &Row, _: &str| row.get(&cell_id).cloned()));
        self
    }

    pub fn sort_by(mut self, sort_key: impl Fn(&Row, &str) -> Option<Cell> + 'static) -> Self {
        self.sort_key = Some(Rc::new(sort_key));
        self
    }

    pub fn slice_id_sorter(mut self, sorter: impl Fn(&str, &str) -> Ordering + 'static) -> Self {
        self.slice_id_sorter = Some(Rc::new(sorter));
        self
    }

    /// Order rows within a slice; the third argument is the slice id.
    pub fn row_id_sorter(
        mut self,
        sorter: impl Fn(&SortEntry, &SortEntry, &str) -> Ordering + 'static,
    ) -> Self {
        self.row_id_sorter = Some(Rc::new(sorter));
        self
    }

    fn evaluate(&self, table: &Table) -> Index {
        let mut slices: BTreeMap<Id, Vec<SortEntry>> = BTreeMap::new();
        for (row_id, row) in table {
            let slice_id = match &self.slice_id {
                Some(slice_id) => slice_id(row, row_id),
                None => Some(Id::new()),
            };
            let Some(slice_id) = slice_id else {
                continue;
            };
            let key = match &self.sort_key {
                Some(sort_key) => sort_key(row, row_id),
                None => Some(Cell::from(row_id.as_str())),
            };
            slices.entry(slice_id).or_default().push(SortEntry {
                key,
                row_id: row_id.clone(),
            });
        }

        let mut slice_ids: Ids = slices.keys().cloned().collect();
        if let Some(sorter) = &self.slice_id_sorter {
            slice_ids.sort_by(|a, b| sorter(a, b));
        }
        let slices = slices
            .into_iter()
            .map(|(slice_id, mut entries)| {
                match &self.row_id_sorter {
                    Some(sorter) => entries.sort_by(|a, b| sorter(a, b, &slice_id)),
                    None => entries.sort_by(default_row_order),
                }
                let row_ids = entries.into_iter().map(|entry| entry.row_id).collect();
                (slice_id, row_ids)
            })
            .collect();
        Index { slice_ids, slices }
    }
}

/// Missing keys first, then by key, then by row id.
fn default_row_order(a: &SortEntry, b: &SortEntry) -> Ordering {
    match (&a.key, &b.key) {
        (Some(a_key), Some(b_key)) => a_key.sort_cmp(b_key),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.row_id.cmp(&b.row_id))
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Index {
    slice_ids: Ids,
    slices: BTreeMap<Id, Ids>,
}

pub type SliceIdsListener = dyn Fn(&Indexes, &str);
pub type SliceRowIdsListener = dyn Fn(&Indexes, &str, &str);

struct IndexesInner {
    derived: Derived<IndexDefinition>,
    indexes: RefCell<BTreeMap<Id, Index>>,
    slice_ids_listeners: RefCell<ListenerSet<SliceIdsListener>>,
    slice_row_ids_listeners: RefCell<ListenerSet<SliceRowIdsListener>>,
}

/// Named indexes over a [`Store`].
#[derive(Clone)]
pub struct Indexes {
    inner: Rc<IndexesInner>,
}

impl fmt::Debug for Indexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indexes")
            .field("indexes", &self.inner.indexes.borrow())
            .finish_non_exhaustive()
    }
}

impl Indexes {
    pub fn new(store: &Store) -> Self {
        Self {
            inner: Rc::new(IndexesInner {
                derived: Derived::new(store),
                indexes: RefCell::new(BTreeMap::new()),
                slice_ids_listeners: RefCell::new(ListenerSet::default()),
                slice_row_ids_listeners: RefCell::new(ListenerSet::default()),
            }),
        }
    }

    pub fn get_store(&self) -> &Store {
        &self.inner.derived.store
    }

    pub fn set_index_definition(&self, index_id: &str, definition: IndexDefinition) -> &Self {
        let table_id = definition.table_id.clone();
        self.inner
            .derived
            .definitions
            .borrow_mut()
            .insert(index_id.to_string(), definition);
        let weak = Rc::downgrade(&self.inner);
        let watched_id = index_id.to_string();
        self.inner
            .derived
            .watch_tables(index_id, &[table_id], move |_| {
                if let Some(inner) = weak.upgrade() {
                    Indexes { inner }.recompute(&watched_id);
                }
            });
        self.recompute(index_id);
        self
    }

    pub fn del_index_definition(&self, index_id: &str) -> &Self {
        self.inner.derived.unwatch(index_id);
        self.inner.derived.definitions.borrow_mut().remove(index_id);
        self.set_index(index_id, Index::default());
        self.inner.indexes.borrow_mut().remove(index_id);
        self
    }

    pub fn get_index_ids(&self) -> Ids {
        self.inner.derived.definition_ids()
    }

    pub fn has_index(&self, index_id: &str) -> bool {
        self.inner.derived.has_definition(index_id)
    }

    pub fn get_table_id(&self, index_id: &str) -> Option<Id> {
        self.inner
            .derived
            .definitions
            .borrow()
            .get(index_id)
            .map(|definition| definition.table_id.clone())
    }

    pub fn get_slice_ids(&self, index_id: &str) -> Ids {
        self.inner
            .indexes
            .borrow()
            .get(index_id)
            .map(|index| index.slice_ids.clone())
            .unwrap_or_default()
    }

    pub fn has_slice(&self, index_id: &str, slice_id: &str) -> bool {
        self.inner
            .indexes
            .borrow()
            .get(index_id)
            .is_some_and(|index| index.slices.contains_key(slice_id))
    }

    pub fn get_slice_row_ids(&self, index_id: &str, slice_id: &str) -> Ids {
        self.inner
            .indexes
            .borrow()
            .get(index_id)
            .and_then(|index| index.slices.get(slice_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Called when an index's slice ids, or their order, change.
    pub fn add_slice_ids_listener(
        &self,
        index_id: Option<&str>,
        listener: impl Fn(&Indexes, &str) + 'static,
    ) -> ListenerId {
        let id = self.inner.derived.next_listener_id();
        self.inner
            .slice_ids_listeners
            .borrow_mut()
            .add(id, pattern(&[index_id]), Rc::new(listener));
        id
    }

    /// Called when a slice's row ids, or their order, change.
    pub fn add_slice_row_ids_listener(
        &self,
        index_id: Option<&str>,
        slice_id: Option<&str>,
        listener: impl Fn(&Indexes, &str, &str) + 'static,
    ) -> ListenerId {
        let id = self.inner.derived.next_listener_id();
        self.inner
            .slice_row_ids_listeners
            .borrow_mut()
            .add(id, pattern(&[index_id, slice_id]), Rc::new(listener));
        id
    }

    pub fn del_listener(&self, listener_id: ListenerId) -> &Self {
        if !self.inner.slice_ids_listeners.borrow_mut().remove(listener_id) {
            self.inner
                .slice_row_ids_listeners
                .borrow_mut()
                .remove(listener_id);
        }
        self
    }

    pub fn destroy(&self) {
        self.inner.derived.unwatch_all();
        self.inner.slice_ids_listeners.borrow_mut().clear();
        self.inner.slice_row_ids_listeners.borrow_mut().clear();
    }

    fn recompute(&self, index_id: &str) {
        let definition = self.inner.derived.definitions.borrow().get(index_id).cloned();
        let Some(definition) = definition else {
            return;
        };
        let table = self.get_store().get_table(&definition.table_id);
        self.set_index(index_id, definition.evaluate(&table));
    }

    fn set_index(&self, index_id: &str, new: Index) {
        let old = self
            .inner
            .indexes
            .borrow_mut()
            .insert(index_id.to_string(), new.clone())
            .unwrap_or_default();
        if old == new {
            return;
        }
        let mut changed_slices: Vec<&Id> = new
            .slices
            .iter()
            .filter(|(slice_id, row_ids)| old.slices.get(*slice_id) != Some(*row_ids))
            .map(|(slice_id, _)| slice_id)
            .collect();
        changed_slices.extend(
            old.slices
                .keys()
                .filter(|slice_id| !new.slices.contains_key(*slice_id)),
        );
        changed_slices.sort();

        if old.slice_ids != new.slice_ids {
            for listener in matching(&self.inner.slice_ids_listeners, &[index_id]) {
                listener(self, index_id);
            }
        }
        for slice_id in changed_slices {
            for listener in matching(&self.inner.slice_row_ids_listeners, &[index_id, slice_id]) {
                listener(self, index_id, slice_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pets() -> Store {
        let store = Store::new();
        store
            .set_row("pets", "fido", Row::from([
                ("species".to_string(), Cell::from("dog")),
                ("price".to_string(), Cell::from(5)),
            ]))
            .set_row("pets", "felix", Row::from([
                ("species".to_string(), Cell::from("cat")),
                ("price".to_string(), Cell::from(4)),
            ]))
            .set_row("pets", "cujo", Row::from([
                ("species".to_string(), Cell::from("dog")),
                ("price".to_string(), Cell::from(3)),
            ]))
            .set_cell("pets", "rex", "price", 7);
        store
    }

    #[test]
    fn slices_by_cell_and_sorts() {
        let store = pets();
        let indexes = Indexes::new(&store);
        indexes.set_index_definition(
            "bySpecies",
            IndexDefinition::new("pets")
                .slice_by_cell("species")
                .sort_by_cell("price"),
        );
        assert_eq!(indexes.get_slice_ids("bySpecies"), vec!["cat", "dog"]);
        assert_eq!(
            indexes.get_slice_row_ids("bySpecies", "dog"),
            vec!["cujo", "fido"]
        );
        assert!(!indexes.has_slice("bySpecies", "fish"));

        store.set_cell("pets", "rex", "species", "fish");
        assert_eq!(indexes.get_slice_ids("bySpecies"), vec!["cat", "dog", "fish"]);
    }

    #[test]
    fn unsliced_index_holds_every_row() {
        let store = pets();
        let indexes = Indexes::new(&store);
        indexes.set_index_definition("all", IndexDefinition::new("pets"));
        assert_eq!(indexes.get_slice_ids("all"), vec![""]);
        assert_eq!(
            indexes.get_slice_row_ids("all", ""),
            vec!["cujo", "felix", "fido", "rex"]
        );
    }

    #[test]
    fn custom_sorters() {
        let store = pets();
        let indexes = Indexes::new(&store);
        indexes.set_index_definition(
            "byPrice",
            IndexDefinition::new("pets")
                .slice_by(|row, _| {
                    let price = row.get("price")?.as_number()?;
                    Some(if price > 4.0 { "dear" } else { "cheap" }.to_string())
                })
                .sort_by_cell("price")
                .slice_id_sorter(|a, b| b.cmp(a))
                .row_id_sorter(|a, b, _| default_row_order(b, a)),
        );
        assert_eq!(indexes.get_slice_ids("byPrice"), vec!["dear", "cheap"]);
        assert_eq!(indexes.get_slice_row_ids("byPrice", "dear"), vec!["rex", "fido"]);
    }

    #[test]
    fn listeners_fire_for_changed_slices() {
        let store = pets();
        let indexes = Indexes::new(&store);
        indexes.set_index_definition("bySpecies", IndexDefinition::new("pets").slice_by_cell("species"));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        indexes.add_slice_ids_listener(Some("bySpecies"), move |_, index_id| {
            log.borrow_mut().push(format!("ids {index_id}"));
        });
        let log = Rc::clone(&seen);
        indexes.add_slice_row_ids_listener(Some("bySpecies"), None, move |_, _, slice_id| {
            log.borrow_mut().push(format!("rows {slice_id}"));
        });

        store.set_cell("pets", "felix", "species", "dog");
        assert_eq!(*seen.borrow(), vec!["ids bySpecies", "rows cat", "rows dog"]);
        seen.borrow_mut().clear();
        store.set_cell("pets", "felix", "price", 1);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn deleting_a_definition_clears_it() {
        let store = pets();
        let indexes = Indexes::new(&store);
        indexes.set_index_definition("bySpecies", IndexDefinition::new("pets").slice_by_cell("species"));
        indexes.del_index_definition("bySpecies");
        assert!(indexes.get_slice_ids("bySpecies").is_empty());
        assert!(!indexes.has_index("bySpecies"));
        assert_eq!(store.get_listener_stats().table, 0);
    }
}
