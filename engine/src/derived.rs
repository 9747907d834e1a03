//! Book-keeping shared by the components derived from a store.

use crate::{
    changes::GetCellChange,
    listeners::{pattern, Bucket, Callback},
    Id, Ids, ListenerId, Store,
};
use std::cell::{Cell as StdCell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Definitions of one component, and the internal store listeners that
/// keep their results current.
pub(crate) struct Derived<D> {
    pub(crate) store: Store,
    pub(crate) definitions: RefCell<BTreeMap<Id, D>>,
    store_listeners: RefCell<BTreeMap<Id, Vec<ListenerId>>>,
    next_listener_id: StdCell<ListenerId>,
}

impl<D> Derived<D> {
    pub(crate) fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
            definitions: RefCell::new(BTreeMap::new()),
            store_listeners: RefCell::new(BTreeMap::new()),
            next_listener_id: StdCell::new(0),
        }
    }

    pub(crate) fn definition_ids(&self) -> Ids {
        self.definitions.borrow().keys().cloned().collect()
    }

    pub(crate) fn has_definition(&self, id: &str) -> bool {
        self.definitions.borrow().contains_key(id)
    }

    pub(crate) fn next_listener_id(&self) -> ListenerId {
        let id = self.next_listener_id.get();
        self.next_listener_id.set(id + 1);
        id
    }

    /// Call `on_change` whenever a cell of any of `table_ids` changes,
    /// replacing what was watched for `definition_id` before.
    pub(crate) fn watch_tables(
        &self,
        definition_id: &str,
        table_ids: &[Id],
        on_change: impl Fn(&Store) + 'static,
    ) {
        self.unwatch(definition_id);
        let on_change = Rc::new(on_change);
        let listener_ids = table_ids
            .iter()
            .map(|table_id| {
                let on_change = Rc::clone(&on_change);
                self.store.add_listener(
                    pattern(&[Some(table_id.as_str())]),
                    Callback::Table(Rc::new(
                        move |store: &Store, _: &str, _: &GetCellChange| on_change(store),
                    )),
                    Bucket::Internal,
                )
            })
            .collect();
        self.store_listeners
            .borrow_mut()
            .insert(definition_id.to_string(), listener_ids);
    }

    pub(crate) fn unwatch(&self, definition_id: &str) {
        let listener_ids = self.store_listeners.borrow_mut().remove(definition_id);
        for listener_id in listener_ids.into_iter().flatten() {
            self.store.del_listener(listener_id);
        }
    }

    /// Stop watching the store for every definition.
    pub(crate) fn unwatch_all(&self) {
        let watched = std::mem::take(&mut *self.store_listeners.borrow_mut());
        for listener_id in watched.into_values().flatten() {
            self.store.del_listener(listener_id);
        }
    }
}
