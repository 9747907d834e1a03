//! Checkpoints - a linear undo/redo history over a store.
//!
//! Each checkpoint remembers the cell and value changes that led to it from
//! the one before. Moving backward replays those changes' old sides, moving
//! forward replays their new sides. Adding a checkpoint after moving
//! backward discards the forward history.

use crate::{
    changes::{Changes, OldNew, RowChanges, TableChanges, TablesChanges, TransactionLog},
    listeners::{matching, pattern, Bucket, Callback, ListenerSet},
    Cell, Id, Ids, ListenerId, Store, Value,
};
use std::cell::{Cell as StdCell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

pub type CheckpointIdsListener = dyn Fn(&Checkpoints);
pub type CheckpointListener = dyn Fn(&Checkpoints, &str);

/// `(backward, current, forward)`; backward is oldest first, forward is
/// nearest first.
pub type CheckpointIds = (Ids, Option<Id>, Ids);

/// The net cell and value changes between two checkpoints.
#[derive(Debug, Default, Clone)]
struct Delta {
    cells: BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, OldNew>>>,
    values: BTreeMap<Id, OldNew>,
}

impl Delta {
    /// Fold a finished transaction in, keeping the earliest old side.
    /// Cells and values a replay wrote count from the replayed content, so
    /// only writes made on top of a replay are recorded. Returns whether
    /// anything was recorded.
    fn record(&mut self, log: &TransactionLog, replay: Option<&Replay>) -> bool {
        let mut recorded = false;
        for (table_id, rows) in &log.changed_cells {
            for (row_id, cells) in rows {
                for (cell_id, (old, new)) in cells {
                    let old = replay
                        .and_then(|replay| replay.cell(table_id, row_id, cell_id))
                        .unwrap_or(old);
                    if old == new {
                        continue;
                    }
                    recorded = true;
                    self.cells
                        .entry(table_id.clone())
                        .or_default()
                        .entry(row_id.clone())
                        .or_default()
                        .entry(cell_id.clone())
                        .and_modify(|(_, latest)| *latest = new.clone())
                        .or_insert_with(|| (old.clone(), new.clone()));
                }
            }
        }
        for (value_id, (old, new)) in &log.changed_values {
            let old = replay
                .and_then(|replay| replay.values.get(value_id))
                .unwrap_or(old);
            if old == new {
                continue;
            }
            recorded = true;
            self.values
                .entry(value_id.clone())
                .and_modify(|(_, latest)| *latest = new.clone())
                .or_insert_with(|| (old.clone(), new.clone()));
        }
        recorded
    }

    /// The changes that replay this delta forward, or undo it.
    fn to_changes(&self, forward: bool) -> Changes {
        let side = |(old, new): &OldNew| if forward { new.clone() } else { old.clone() };
        let tables: TablesChanges = self
            .cells
            .iter()
            .map(|(table_id, rows)| {
                let rows: TableChanges = rows
                    .iter()
                    .map(|(row_id, cells)| {
                        let cells: RowChanges = cells
                            .iter()
                            .map(|(cell_id, old_new)| (cell_id.clone(), side(old_new)))
                            .collect();
                        (row_id.clone(), Some(cells))
                    })
                    .collect();
                (table_id.clone(), Some(rows))
            })
            .collect();
        let values = self
            .values
            .iter()
            .map(|(value_id, old_new)| (value_id.clone(), side(old_new)))
            .collect();
        Changes::new(tables, values)
    }
}

/// Content written by moves through the history during one store
/// transaction, held until the store finishes it.
#[derive(Debug)]
struct Replay {
    cells: BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, Option<Cell>>>>,
    values: BTreeMap<Id, Option<Value>>,
    /// Ids before the first move, restored if the transaction rolls back
    before: CheckpointIds,
}

impl Replay {
    fn new(before: CheckpointIds) -> Self {
        Self {
            cells: BTreeMap::new(),
            values: BTreeMap::new(),
            before,
        }
    }

    /// Note one side of `delta` as written; later moves overwrite earlier.
    fn add(&mut self, delta: &Delta, forward: bool) {
        let side = |(old, new): &OldNew| if forward { new.clone() } else { old.clone() };
        for (table_id, rows) in &delta.cells {
            for (row_id, cells) in rows {
                for (cell_id, old_new) in cells {
                    self.cells
                        .entry(table_id.clone())
                        .or_default()
                        .entry(row_id.clone())
                        .or_default()
                        .insert(cell_id.clone(), side(old_new));
                }
            }
        }
        for (value_id, old_new) in &delta.values {
            self.values.insert(value_id.clone(), side(old_new));
        }
    }

    fn cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&Option<Cell>> {
        self.cells.get(table_id)?.get(row_id)?.get(cell_id)
    }

    /// Whether the store still holds everything the moves wrote.
    fn landed(&self, store: &Store) -> bool {
        self.cells.iter().all(|(table_id, rows)| {
            rows.iter().all(|(row_id, cells)| {
                cells
                    .iter()
                    .all(|(cell_id, cell)| store.get_cell(table_id, row_id, cell_id) == *cell)
            })
        }) && self
            .values
            .iter()
            .all(|(value_id, value)| store.get_value(value_id) == *value)
    }
}

#[derive(Debug)]
struct CheckpointsState {
    size: usize,
    backward: Vec<Id>,
    current: Option<Id>,
    forward: Vec<Id>,
    deltas: BTreeMap<Id, Delta>,
    labels: BTreeMap<Id, String>,
    /// Changes since the current checkpoint, while it is `None`
    pending: Delta,
    next_id: u64,
    /// Set by moves until the store transaction they joined finishes
    replay: Option<Replay>,
}

impl CheckpointsState {
    fn new(size: usize) -> Self {
        Self {
            size,
            backward: Vec::new(),
            current: Some("0".to_string()),
            forward: Vec::new(),
            deltas: BTreeMap::new(),
            labels: BTreeMap::from([("0".to_string(), String::new())]),
            pending: Delta::default(),
            next_id: 1,
            replay: None,
        }
    }

    fn ids(&self) -> CheckpointIds {
        (
            self.backward.clone(),
            self.current.clone(),
            self.forward.clone(),
        )
    }

    /// Go back to `ids`, skipping any checkpoint forgotten since.
    fn restore(&mut self, (backward, current, forward): CheckpointIds) {
        let known = |id: &Id| self.labels.contains_key(id);
        let backward = backward.into_iter().filter(known).collect();
        let forward = forward.into_iter().filter(known).collect();
        let current = current.filter(known);
        self.backward = backward;
        self.forward = forward;
        self.current = current;
    }

    fn forget(&mut self, id: &str) {
        self.deltas.remove(id);
        self.labels.remove(id);
    }

    /// Drop the oldest backward checkpoints beyond `size`.
    fn trim(&mut self) -> bool {
        let excess = self.backward.len().saturating_sub(self.size);
        let dropped: Vec<Id> = self.backward.drain(..excess).collect();
        for id in &dropped {
            self.forget(id);
        }
        excess > 0
    }

    fn clear_forward(&mut self) -> bool {
        let forward = std::mem::take(&mut self.forward);
        for id in &forward {
            self.forget(id);
        }
        !forward.is_empty()
    }
}

struct CheckpointsInner {
    store: Store,
    state: RefCell<CheckpointsState>,
    ids_listeners: RefCell<ListenerSet<CheckpointIdsListener>>,
    checkpoint_listeners: RefCell<ListenerSet<CheckpointListener>>,
    next_listener_id: StdCell<ListenerId>,
    store_listener: StdCell<Option<ListenerId>>,
}

/// Undo/redo history for a [`Store`].
#[derive(Clone)]
pub struct Checkpoints {
    inner: Rc<CheckpointsInner>,
}

impl std::fmt::Debug for Checkpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoints")
            .field("ids", &self.get_checkpoint_ids())
            .finish_non_exhaustive()
    }
}

impl Checkpoints {
    /// Start a history whose current checkpoint, `"0"`, is the store's
    /// content right now. Retains `checkpoint_size` backward checkpoints
    /// from the store's config.
    pub fn new(store: &Store) -> Self {
        let inner = Rc::new(CheckpointsInner {
            store: store.clone(),
            state: RefCell::new(CheckpointsState::new(store.config().checkpoint_size)),
            ids_listeners: RefCell::new(ListenerSet::default()),
            checkpoint_listeners: RefCell::new(ListenerSet::default()),
            next_listener_id: StdCell::new(0),
            store_listener: StdCell::new(None),
        });
        let weak: Weak<CheckpointsInner> = Rc::downgrade(&inner);
        let listener_id = store.add_listener(
            vec![],
            Callback::DidFinishTransaction(Rc::new(move |store: &Store| {
                if let Some(inner) = weak.upgrade() {
                    Checkpoints { inner }.store_changed(store);
                }
            })),
            Bucket::Internal,
        );
        inner.store_listener.set(Some(listener_id));
        Self { inner }
    }

    pub fn get_store(&self) -> &Store {
        &self.inner.store
    }

    fn store_changed(&self, store: &Store) {
        let log = store.get_transaction_log();
        let ids_changed = {
            let mut state = self.inner.state.borrow_mut();
            let replay = state.replay.take();
            if let Some(replay) = &replay {
                if !log.has_changes() && !replay.landed(store) {
                    tracing::debug!("transaction rolled back, restoring checkpoint ids");
                    state.restore(replay.before.clone());
                    drop(state);
                    self.call_ids_listeners();
                    return;
                }
            }
            if !state.pending.record(&log, replay.as_ref()) {
                return;
            }
            match state.current.take() {
                Some(current) => {
                    state.backward.push(current);
                    state.trim();
                    state.clear_forward();
                    true
                }
                None => false,
            }
        };
        if ids_changed {
            self.call_ids_listeners();
        }
    }

    /// Set how many backward checkpoints are retained.
    pub fn set_size(&self, size: usize) -> &Self {
        let trimmed = {
            let mut state = self.inner.state.borrow_mut();
            state.size = size;
            state.trim()
        };
        if trimmed {
            self.call_ids_listeners();
        }
        self
    }

    /// Record the changes since the current checkpoint as a new one and
    /// return its id. Without such changes, the current id is returned.
    pub fn add_checkpoint(&self, label: &str) -> Id {
        let (id, created) = {
            let mut state = self.inner.state.borrow_mut();
            match state.current.clone() {
                Some(id) => (id, false),
                None => {
                    let id = state.next_id.to_string();
                    state.next_id += 1;
                    let delta = std::mem::take(&mut state.pending);
                    state.deltas.insert(id.clone(), delta);
                    state.labels.insert(id.clone(), String::new());
                    state.current = Some(id.clone());
                    (id, true)
                }
            }
        };
        if created {
            tracing::debug!(checkpoint = %id, "added checkpoint");
            self.call_ids_listeners();
        }
        if !label.is_empty() {
            self.set_checkpoint(&id, label);
        }
        id
    }

    /// Relabel an existing checkpoint.
    pub fn set_checkpoint(&self, checkpoint_id: &str, label: &str) -> &Self {
        let changed = {
            let mut state = self.inner.state.borrow_mut();
            match state.labels.get_mut(checkpoint_id) {
                Some(existing) if existing != label => {
                    *existing = label.to_string();
                    true
                }
                _ => false,
            }
        };
        if changed {
            for listener in matching(&self.inner.checkpoint_listeners, &[checkpoint_id]) {
                listener(self, checkpoint_id);
            }
        }
        self
    }

    /// The label of a checkpoint, or `None` if it is not in the history.
    pub fn get_checkpoint(&self, checkpoint_id: &str) -> Option<String> {
        self.inner.state.borrow().labels.get(checkpoint_id).cloned()
    }

    pub fn has_checkpoint(&self, checkpoint_id: &str) -> bool {
        self.inner.state.borrow().labels.contains_key(checkpoint_id)
    }

    pub fn get_checkpoint_ids(&self) -> CheckpointIds {
        self.inner.state.borrow().ids()
    }

    /// Moves write to the store, which ignores writes while it notifies
    /// listeners, so the history stays put then too.
    fn can_move(&self) -> bool {
        if self.inner.store.is_notifying() {
            tracing::warn!("ignoring checkpoint move made while listeners are being notified");
            return false;
        }
        true
    }

    /// Undo to the previous checkpoint. Inside a store transaction the
    /// undo joins it, and is dropped again if the transaction rolls back.
    pub fn go_backward(&self) -> &Self {
        if self.can_move() && self.step_backward() {
            self.call_ids_listeners();
        }
        self
    }

    pub fn go_forward(&self) -> &Self {
        if self.can_move() && self.step_forward() {
            self.call_ids_listeners();
        }
        self
    }

    /// Move to any checkpoint in the history.
    pub fn go_to(&self, checkpoint_id: &str) -> &Self {
        if !self.can_move() {
            return self;
        }
        let (backward_steps, forward_steps) = {
            let state = self.inner.state.borrow();
            if let Some(position) = state.backward.iter().position(|id| id == checkpoint_id) {
                (state.backward.len() - position, 0)
            } else if let Some(position) = state.forward.iter().position(|id| id == checkpoint_id) {
                (0, position + 1)
            } else {
                (0, 0)
            }
        };
        let mut moved = false;
        for _ in 0..backward_steps {
            moved |= self.step_backward();
        }
        for _ in 0..forward_steps {
            moved |= self.step_forward();
        }
        if moved {
            self.call_ids_listeners();
        }
        self
    }

    fn step_backward(&self) -> bool {
        if self.inner.state.borrow().backward.is_empty() {
            return false;
        }
        self.add_checkpoint("");
        let changes = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let before = state.ids();
            let (Some(current), Some(previous)) = (state.current.take(), state.backward.pop())
            else {
                return false;
            };
            let changes = match state.deltas.get(&current) {
                Some(delta) => {
                    state
                        .replay
                        .get_or_insert_with(|| Replay::new(before))
                        .add(delta, false);
                    delta.to_changes(false)
                }
                None => Changes::default(),
            };
            tracing::debug!(from = %current, to = %previous, "moving backward");
            state.forward.insert(0, current);
            state.current = Some(previous);
            changes
        };
        self.replay(changes);
        true
    }

    fn step_forward(&self) -> bool {
        let changes = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            if state.forward.is_empty() {
                return false;
            }
            let before = state.ids();
            let next = state.forward.remove(0);
            if let Some(current) = state.current.take() {
                state.backward.push(current);
            }
            state.trim();
            let changes = match state.deltas.get(&next) {
                Some(delta) => {
                    state
                        .replay
                        .get_or_insert_with(|| Replay::new(before))
                        .add(delta, true);
                    delta.to_changes(true)
                }
                None => Changes::default(),
            };
            tracing::debug!(to = %next, "moving forward");
            state.current = Some(next);
            changes
        };
        self.replay(changes);
        true
    }

    /// Write a move's changes. They are told apart from other writes when
    /// the store finishes the transaction, which is straight away unless
    /// one is already open.
    fn replay(&self, changes: Changes) {
        self.inner.store.apply_changes(changes);
    }

    /// Forget the whole history. The current content becomes the only
    /// checkpoint.
    pub fn clear(&self) -> &Self {
        {
            let mut state = self.inner.state.borrow_mut();
            state.backward.clear();
            state.forward.clear();
            state.deltas.clear();
            state.pending = Delta::default();
            state.replay = None;
            let current = match state.current.clone() {
                Some(current) => current,
                None => {
                    let id = state.next_id.to_string();
                    state.next_id += 1;
                    id
                }
            };
            state.labels.retain(|id, _| *id == current);
            state.labels.entry(current.clone()).or_default();
            state.current = Some(current);
        }
        self.call_ids_listeners();
        self
    }

    /// Forget every checkpoint ahead of the current one.
    pub fn clear_forward(&self) -> &Self {
        let cleared = self.inner.state.borrow_mut().clear_forward();
        if cleared {
            self.call_ids_listeners();
        }
        self
    }

    fn next_listener_id(&self) -> ListenerId {
        let id = self.inner.next_listener_id.get();
        self.inner.next_listener_id.set(id + 1);
        id
    }

    /// Called whenever the backward, current or forward ids change.
    pub fn add_checkpoint_ids_listener(&self, listener: impl Fn(&Checkpoints) + 'static) -> ListenerId {
        let id = self.next_listener_id();
        self.inner
            .ids_listeners
            .borrow_mut()
            .add(id, vec![], Rc::new(listener));
        id
    }

    /// Called when a checkpoint's label changes; `None` for every checkpoint.
    pub fn add_checkpoint_listener(
        &self,
        checkpoint_id: Option<&str>,
        listener: impl Fn(&Checkpoints, &str) + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        self.inner
            .checkpoint_listeners
            .borrow_mut()
            .add(id, pattern(&[checkpoint_id]), Rc::new(listener));
        id
    }

    pub fn del_listener(&self, listener_id: ListenerId) -> &Self {
        if !self.inner.ids_listeners.borrow_mut().remove(listener_id) {
            self.inner
                .checkpoint_listeners
                .borrow_mut()
                .remove(listener_id);
        }
        self
    }

    fn call_ids_listeners(&self) {
        for listener in matching(&self.inner.ids_listeners, &[]) {
            listener(self);
        }
    }

    /// Stop following the store and drop every listener.
    pub fn destroy(&self) {
        if let Some(listener_id) = self.inner.store_listener.take() {
            self.inner.store.del_listener(listener_id);
        }
        self.inner.ids_listeners.borrow_mut().clear();
        self.inner.checkpoint_listeners.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cell, StoreConfig};

    fn ids(backward: &[&str], current: Option<&str>, forward: &[&str]) -> CheckpointIds {
        (
            backward.iter().map(|id| id.to_string()).collect(),
            current.map(str::to_string),
            forward.iter().map(|id| id.to_string()).collect(),
        )
    }

    #[test]
    fn starts_at_zero() {
        let checkpoints = Checkpoints::new(&Store::new());
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&[], Some("0"), &[]));
        assert_eq!(checkpoints.get_checkpoint("0"), Some(String::new()));
    }

    #[test]
    fn changes_leave_the_current_checkpoint() {
        let store = Store::new();
        let checkpoints = Checkpoints::new(&store);
        store.set_cell("pets", "fido", "sold", false);
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0"], None, &[]));
        assert_eq!(checkpoints.add_checkpoint("sale"), "1");
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0"], Some("1"), &[]));
        assert_eq!(checkpoints.get_checkpoint("1").as_deref(), Some("sale"));
        assert_eq!(checkpoints.add_checkpoint(""), "1");
    }

    #[test]
    fn undo_and_redo() {
        let store = Store::new();
        store.set_cell("pets", "fido", "price", 4);
        let checkpoints = Checkpoints::new(&store);
        store.set_cell("pets", "fido", "price", 5).set_value("open", true);
        checkpoints.add_checkpoint("");
        store.del_row("pets", "fido");
        checkpoints.add_checkpoint("");

        checkpoints.go_backward();
        assert_eq!(store.get_cell("pets", "fido", "price"), Some(Cell::from(5)));
        checkpoints.go_backward();
        assert_eq!(store.get_cell("pets", "fido", "price"), Some(Cell::from(4)));
        assert!(!store.has_value("open"));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&[], Some("0"), &["1", "2"]));

        checkpoints.go_forward();
        assert_eq!(store.get_value("open"), Some(Cell::from(true)));
        checkpoints.go_to("2");
        assert!(!store.has_tables());
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0", "1"], Some("2"), &[]));
        checkpoints.go_to("0");
        assert_eq!(store.get_cell("pets", "fido", "price"), Some(Cell::from(4)));
    }

    #[test]
    fn going_backward_commits_pending_changes() {
        let store = Store::new();
        let checkpoints = Checkpoints::new(&store);
        store.set_value("count", 1);
        checkpoints.go_backward();
        assert!(!store.has_value("count"));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&[], Some("0"), &["1"]));
        checkpoints.go_forward();
        assert_eq!(store.get_value("count"), Some(Cell::from(1)));
    }

    #[test]
    fn new_history_discards_forward() {
        let store = Store::new();
        let checkpoints = Checkpoints::new(&store);
        store.set_value("count", 1);
        checkpoints.add_checkpoint("");
        checkpoints.go_backward();
        store.set_value("count", 2);
        checkpoints.add_checkpoint("");
        let (backward, current, forward) = checkpoints.get_checkpoint_ids();
        assert_eq!(backward, vec!["0"]);
        assert_eq!(current.as_deref(), Some("2"));
        assert!(forward.is_empty());
        assert!(!checkpoints.has_checkpoint("1"));
    }

    #[test]
    fn size_limits_backward_history() {
        let store = Store::with_config(StoreConfig::default().with_checkpoint_size(2));
        let checkpoints = Checkpoints::new(&store);
        for count in 1..=4 {
            store.set_value("count", count);
            checkpoints.add_checkpoint("");
        }
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["2", "3"], Some("4"), &[]));
        checkpoints.set_size(1);
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["3"], Some("4"), &[]));
        checkpoints.go_backward().go_backward();
        assert_eq!(store.get_value("count"), Some(Cell::from(3)));
    }

    #[test]
    fn listeners() {
        let store = Store::new();
        let checkpoints = Checkpoints::new(&store);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        checkpoints.add_checkpoint_ids_listener(move |checkpoints| {
            log.borrow_mut().push(format!("{:?}", checkpoints.get_checkpoint_ids().1));
        });
        let log = Rc::clone(&seen);
        checkpoints.add_checkpoint_listener(Some("1"), move |checkpoints, id| {
            log.borrow_mut()
                .push(format!("{id}={}", checkpoints.get_checkpoint(id).unwrap_or_default()));
        });

        store.set_value("count", 1);
        checkpoints.add_checkpoint("first");
        checkpoints.set_checkpoint("0", "ignored by the listener");
        assert_eq!(*seen.borrow(), vec!["None", "Some(\"1\")", "1=first"]);
    }

    #[test]
    fn rolled_back_transactions_are_not_recorded() {
        let store = Store::new();
        let checkpoints = Checkpoints::new(&store);
        let inner = store.clone();
        store.transaction_with_rollback(|| inner.set_value("count", 1).get_value_ids(), |_| true);
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&[], Some("0"), &[]));
    }

    /// Counts 1 and 2 checkpointed as "1" and "2".
    fn counted() -> (Store, Checkpoints) {
        let store = Store::new();
        let checkpoints = Checkpoints::new(&store);
        store.set_value("count", 1);
        checkpoints.add_checkpoint("one");
        store.set_value("count", 2);
        checkpoints.add_checkpoint("two");
        (store, checkpoints)
    }

    #[test]
    fn moves_inside_a_transaction_keep_history() {
        let (store, checkpoints) = counted();
        store.transaction(|| {
            checkpoints.go_backward();
        });
        assert_eq!(store.get_value("count"), Some(Cell::from(1)));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0"], Some("1"), &["2"]));

        store.transaction(|| {
            checkpoints.go_forward();
        });
        assert_eq!(store.get_value("count"), Some(Cell::from(2)));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0", "1"], Some("2"), &[]));

        store.transaction(|| {
            checkpoints.go_to("0");
        });
        assert!(!store.has_value("count"));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&[], Some("0"), &["1", "2"]));
        assert_eq!(checkpoints.get_checkpoint("2").as_deref(), Some("two"));
    }

    #[test]
    fn undo_and_redo_in_one_transaction_cancel_out() {
        let (store, checkpoints) = counted();
        store.transaction(|| {
            checkpoints.go_backward().go_forward();
        });
        assert_eq!(store.get_value("count"), Some(Cell::from(2)));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0", "1"], Some("2"), &[]));
    }

    #[test]
    fn writes_after_an_undo_start_new_history() {
        let (store, checkpoints) = counted();
        let writer = store.clone();
        store.transaction(|| {
            checkpoints.go_backward();
            writer.set_value("count", 5);
        });
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0", "1"], None, &[]));
        assert!(!checkpoints.has_checkpoint("2"));

        checkpoints.go_backward();
        assert_eq!(store.get_value("count"), Some(Cell::from(1)));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0"], Some("1"), &["3"]));
        checkpoints.go_forward();
        assert_eq!(store.get_value("count"), Some(Cell::from(5)));
    }

    #[test]
    fn rolled_back_moves_restore_the_ids() {
        let (store, checkpoints) = counted();
        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        checkpoints.add_checkpoint_ids_listener(move |_| *counter.borrow_mut() += 1);

        store.transaction_with_rollback(
            || {
                checkpoints.go_backward();
            },
            |_| true,
        );
        assert_eq!(store.get_value("count"), Some(Cell::from(2)));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0", "1"], Some("2"), &[]));
        assert_eq!(*calls.borrow(), 2);

        checkpoints.go_backward();
        assert_eq!(store.get_value("count"), Some(Cell::from(1)));
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&["0"], Some("1"), &["2"]));
    }

    #[test]
    fn clear_and_destroy() {
        let store = Store::new();
        let checkpoints = Checkpoints::new(&store);
        store.set_value("count", 1);
        checkpoints.add_checkpoint("kept");
        checkpoints.clear();
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&[], Some("1"), &[]));
        assert_eq!(checkpoints.get_checkpoint("1").as_deref(), Some("kept"));

        checkpoints.destroy();
        store.set_value("count", 2);
        assert_eq!(checkpoints.get_checkpoint_ids(), ids(&[], Some("1"), &[]));
        assert_eq!(store.get_listener_stats().transaction, 0);
    }
}
