//! Relationships - links from rows of a local table to rows of a remote one.

use crate::{
    derived::Derived,
    listeners::{matching, pattern, ListenerSet},
    Cell, Id, Ids, ListenerId, Row, Store, Table,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

type RemoteRowId = Rc<dyn Fn(&Row, &str) -> Option<Id>>;

/// A local table whose rows each name at most one remote row.
#[derive(Clone)]
pub struct RelationshipDefinition {
    local_table_id: Id,
    remote_table_id: Id,
    remote_row_id: RemoteRowId,
}

impl fmt::Debug for RelationshipDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipDefinition")
            .field("local_table_id", &self.local_table_id)
            .field("remote_table_id", &self.remote_table_id)
            .finish_non_exhaustive()
    }
}

impl RelationshipDefinition {
    /// Link each local row to the remote row named by one of its cells.
    pub fn new(local_table_id: &str, remote_table_id: &str, cell_id: &str) -> Self {
        let cell_id = cell_id.to_string();
        Self::with_getter(local_table_id, remote_table_id, move |row, _| {
            row.get(&cell_id).map(Cell::to_id)
        })
    }

    /// Link each local row to a computed remote row id.
    pub fn with_getter(
        local_table_id: &str,
        remote_table_id: &str,
        remote_row_id: impl Fn(&Row, &str) -> Option<Id> + 'static,
    ) -> Self {
        Self {
            local_table_id: local_table_id.to_string(),
            remote_table_id: remote_table_id.to_string(),
            remote_row_id: Rc::new(remote_row_id),
        }
    }

    fn evaluate(&self, table: &Table) -> Links {
        let mut links = Links::default();
        for (row_id, row) in table {
            if let Some(remote_row_id) = (self.remote_row_id)(row, row_id) {
                links
                    .local_row_ids
                    .entry(remote_row_id.clone())
                    .or_default()
                    .insert(row_id.clone());
                links.remote_row_ids.insert(row_id.clone(), remote_row_id);
            }
        }
        links
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Links {
    remote_row_ids: BTreeMap<Id, Id>,
    local_row_ids: BTreeMap<Id, BTreeSet<Id>>,
}

pub type RemoteRowIdListener = dyn Fn(&Relationships, &str, &str);
pub type LocalRowIdsListener = dyn Fn(&Relationships, &str, &str);

struct RelationshipsInner {
    derived: Derived<RelationshipDefinition>,
    links: RefCell<BTreeMap<Id, Links>>,
    remote_row_id_listeners: RefCell<ListenerSet<RemoteRowIdListener>>,
    local_row_ids_listeners: RefCell<ListenerSet<LocalRowIdsListener>>,
}

/// Named relationships over a [`Store`].
#[derive(Clone)]
pub struct Relationships {
    inner: Rc<RelationshipsInner>,
}

impl fmt::Debug for Relationships {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relationships")
            .field("links", &self.inner.links.borrow())
            .finish_non_exhaustive()
    }
}

impl Relationships {
    pub fn new(store: &Store) -> Self {
        Self {
            inner: Rc::new(RelationshipsInner {
                derived: Derived::new(store),
                links: RefCell::new(BTreeMap::new()),
                remote_row_id_listeners: RefCell::new(ListenerSet::default()),
                local_row_ids_listeners: RefCell::new(ListenerSet::default()),
            }),
        }
    }

    pub fn get_store(&self) -> &Store {
        &self.inner.derived.store
    }

    pub fn set_relationship_definition(
        &self,
        relationship_id: &str,
        definition: RelationshipDefinition,
    ) -> &Self {
        let table_id = definition.local_table_id.clone();
        self.inner
            .derived
            .definitions
            .borrow_mut()
            .insert(relationship_id.to_string(), definition);
        let weak = Rc::downgrade(&self.inner);
        let watched_id = relationship_id.to_string();
        self.inner
            .derived
            .watch_tables(relationship_id, &[table_id], move |_| {
                if let Some(inner) = weak.upgrade() {
                    Relationships { inner }.recompute(&watched_id);
                }
            });
        self.recompute(relationship_id);
        self
    }

    pub fn del_relationship_definition(&self, relationship_id: &str) -> &Self {
        self.inner.derived.unwatch(relationship_id);
        self.inner
            .derived
            .definitions
            .borrow_mut()
            .remove(relationship_id);
        self.set_links(relationship_id, Links::default());
        self.inner.links.borrow_mut().remove(relationship_id);
        self
    }

    pub fn get_relationship_ids(&self) -> Ids {
        self.inner.derived.definition_ids()
    }

    pub fn has_relationship(&self, relationship_id: &str) -> bool {
        self.inner.derived.has_definition(relationship_id)
    }

    pub fn get_local_table_id(&self, relationship_id: &str) -> Option<Id> {
        self.inner
            .derived
            .definitions
            .borrow()
            .get(relationship_id)
            .map(|definition| definition.local_table_id.clone())
    }

    pub fn get_remote_table_id(&self, relationship_id: &str) -> Option<Id> {
        self.inner
            .derived
            .definitions
            .borrow()
            .get(relationship_id)
            .map(|definition| definition.remote_table_id.clone())
    }

    pub fn get_remote_row_id(&self, relationship_id: &str, local_row_id: &str) -> Option<Id> {
        self.inner
            .links
            .borrow()
            .get(relationship_id)
            .and_then(|links| links.remote_row_ids.get(local_row_id))
            .cloned()
    }

    pub fn get_local_row_ids(&self, relationship_id: &str, remote_row_id: &str) -> Ids {
        self.inner
            .links
            .borrow()
            .get(relationship_id)
            .and_then(|links| links.local_row_ids.get(remote_row_id))
            .map(|row_ids| row_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Follow a relationship within one table from `first_row_id`, as a
    /// linked list, stopping at a missing link or a cycle.
    pub fn get_linked_row_ids(&self, relationship_id: &str, first_row_id: &str) -> Ids {
        let mut row_ids = vec![first_row_id.to_string()];
        let mut next = self.get_remote_row_id(relationship_id, first_row_id);
        while let Some(row_id) = next {
            if row_ids.contains(&row_id) {
                break;
            }
            next = self.get_remote_row_id(relationship_id, &row_id);
            row_ids.push(row_id);
        }
        row_ids
    }

    /// Called when the remote row a local row links to changes.
    pub fn add_remote_row_id_listener(
        &self,
        relationship_id: Option<&str>,
        local_row_id: Option<&str>,
        listener: impl Fn(&Relationships, &str, &str) + 'static,
    ) -> ListenerId {
        let id = self.inner.derived.next_listener_id();
        self.inner.remote_row_id_listeners.borrow_mut().add(
            id,
            pattern(&[relationship_id, local_row_id]),
            Rc::new(listener),
        );
        id
    }

    /// Called when the local rows linking to a remote row change.
    pub fn add_local_row_ids_listener(
        &self,
        relationship_id: Option<&str>,
        remote_row_id: Option<&str>,
        listener: impl Fn(&Relationships, &str, &str) + 'static,
    ) -> ListenerId {
        let id = self.inner.derived.next_listener_id();
        self.inner.local_row_ids_listeners.borrow_mut().add(
            id,
            pattern(&[relationship_id, remote_row_id]),
            Rc::new(listener),
        );
        id
    }

    pub fn del_listener(&self, listener_id: ListenerId) -> &Self {
        if !self
            .inner
            .remote_row_id_listeners
            .borrow_mut()
            .remove(listener_id)
        {
            self.inner
                .local_row_ids_listeners
                .borrow_mut()
                .remove(listener_id);
        }
        self
    }

    pub fn destroy(&self) {
        self.inner.derived.unwatch_all();
        self.inner.remote_row_id_listeners.borrow_mut().clear();
        self.inner.local_row_ids_listeners.borrow_mut().clear();
    }

    fn recompute(&self, relationship_id: &str) {
        let definition = self
            .inner
            .derived
            .definitions
            .borrow()
            .get(relationship_id)
            .cloned();
        let Some(definition) = definition else {
            return;
        };
        let table = self.get_store().get_table(&definition.local_table_id);
        self.set_links(relationship_id, definition.evaluate(&table));
    }

    fn set_links(&self, relationship_id: &str, new: Links) {
        let old = self
            .inner
            .links
            .borrow_mut()
            .insert(relationship_id.to_string(), new.clone())
            .unwrap_or_default();
        if old == new {
            return;
        }
        let changed_local: BTreeSet<&Id> = old
            .remote_row_ids
            .keys()
            .chain(new.remote_row_ids.keys())
            .filter(|row_id| old.remote_row_ids.get(*row_id) != new.remote_row_ids.get(*row_id))
            .collect();
        let changed_remote: BTreeSet<&Id> = old
            .local_row_ids
            .keys()
            .chain(new.local_row_ids.keys())
            .filter(|row_id| old.local_row_ids.get(*row_id) != new.local_row_ids.get(*row_id))
            .collect();
        for local_row_id in changed_local {
            let path = [relationship_id, local_row_id.as_str()];
            for listener in matching(&self.inner.remote_row_id_listeners, &path) {
                listener(self, relationship_id, local_row_id);
            }
        }
        for remote_row_id in changed_remote {
            let path = [relationship_id, remote_row_id.as_str()];
            for listener in matching(&self.inner.local_row_ids_listeners, &path) {
                listener(self, relationship_id, remote_row_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        let store = Store::new();
        store
            .set_cell("pets", "fido", "species", "dog")
            .set_cell("pets", "felix", "species", "cat")
            .set_cell("pets", "cujo", "species", "dog")
            .set_cell("species", "dog", "price", 5)
            .set_cell("species", "cat", "price", 4);
        store
    }

    #[test]
    fn links_both_ways() {
        let store = store();
        let relationships = Relationships::new(&store);
        relationships.set_relationship_definition(
            "petSpecies",
            RelationshipDefinition::new("pets", "species", "species"),
        );
        assert_eq!(
            relationships.get_remote_row_id("petSpecies", "fido").as_deref(),
            Some("dog")
        );
        assert_eq!(
            relationships.get_local_row_ids("petSpecies", "dog"),
            vec!["cujo", "fido"]
        );
        assert_eq!(
            relationships.get_remote_table_id("petSpecies").as_deref(),
            Some("species")
        );

        store.set_cell("pets", "cujo", "species", "cat");
        assert_eq!(
            relationships.get_local_row_ids("petSpecies", "cat"),
            vec!["cujo", "felix"]
        );
    }

    #[test]
    fn linked_rows_stop_at_cycles() {
        let store = Store::new();
        store
            .set_cell("lists", "a", "next", "b")
            .set_cell("lists", "b", "next", "c")
            .set_cell("lists", "c", "next", "a");
        let relationships = Relationships::new(&store);
        relationships.set_relationship_definition(
            "next",
            RelationshipDefinition::new("lists", "lists", "next"),
        );
        assert_eq!(relationships.get_linked_row_ids("next", "a"), vec!["a", "b", "c"]);
        store.del_cell("lists", "b", "next");
        assert_eq!(relationships.get_linked_row_ids("next", "a"), vec!["a", "b"]);
    }

    #[test]
    fn listeners_fire_for_changed_links() {
        let store = store();
        let relationships = Relationships::new(&store);
        relationships.set_relationship_definition(
            "petSpecies",
            RelationshipDefinition::with_getter("pets", "species", |row, _| {
                row.get("species").and_then(Cell::as_str).map(str::to_string)
            }),
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        relationships.add_remote_row_id_listener(None, None, move |_, _, local_row_id| {
            log.borrow_mut().push(format!("remote of {local_row_id}"));
        });
        let log = Rc::clone(&seen);
        relationships.add_local_row_ids_listener(Some("petSpecies"), None, move |_, _, remote_row_id| {
            log.borrow_mut().push(format!("locals of {remote_row_id}"));
        });

        store.set_cell("pets", "fido", "species", "cat");
        assert_eq!(
            *seen.borrow(),
            vec!["remote of fido", "locals of cat", "locals of dog"]
        );
        seen.borrow_mut().clear();
        store.set_cell("pets", "fido", "name", "Fido");
        assert!(seen.borrow().is_empty());
    }
}
