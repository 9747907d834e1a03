//! MergeableStore - a store whose content can be merged with replicas.
//!
//! Every local write is stamped with a fresh HLC from the store's own clock.
//! Remote stamps are accepted when strictly newer than the local ones, so
//! replicas that have exchanged the same stamps hold the same content.

use crate::{
    changes::Content,
    clock::HlcClock,
    config::StoreConfig,
    stamp::{
        CellHashes, MergeableContent, RowDiff, RowHashes, Stamp, Stamps, TableDiff, TableHashes,
        TablesStamp, ValueHashes, ValuesStamp,
    },
    store::Store,
    ContentHashes, MergeableChanges, Tables, Values,
};
use std::ops::Deref;
use uuid::Uuid;

/// A [`Store`] with per-cell and per-value stamps for merging.
///
/// Dereferences to [`Store`] for the whole read, write and listener API.
#[derive(Clone, Debug)]
pub struct MergeableStore {
    store: Store,
}

impl Default for MergeableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for MergeableStore {
    type Target = Store;

    fn deref(&self) -> &Store {
        &self.store
    }
}

impl MergeableStore {
    /// Create an empty mergeable store with a random clock id.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create an empty mergeable store. The clock id is derived from
    /// `config.unique_id`, or from a random UUID when absent.
    pub fn with_config(config: StoreConfig) -> Self {
        let unique_id = config
            .unique_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let clock = HlcClock::new(&unique_id);
        Self::with_clock(config, clock)
    }

    /// Create an empty mergeable store stamping with `clock`.
    pub fn with_clock(config: StoreConfig, clock: HlcClock) -> Self {
        Self {
            store: Store::create(config, Some(Stamps::new(clock))),
        }
    }

    /// The plain store view of this mergeable store.
    pub fn as_store(&self) -> &Store {
        &self.store
    }

    fn stamps<T: Default>(&self, read: impl FnOnce(&Stamps) -> T) -> T {
        self.store
            .read(|state| state.stamps.as_ref().map(read).unwrap_or_default())
    }

    pub fn get_mergeable_content(&self) -> MergeableContent {
        self.stamps(|stamps| stamps.content.clone())
    }

    /// Just the two top-level hashes: equal hashes mean equal content.
    pub fn get_mergeable_content_hashes(&self) -> ContentHashes {
        self.stamps(Stamps::content_hashes)
    }

    pub fn get_mergeable_table_hashes(&self) -> TableHashes {
        self.stamps(Stamps::table_hashes)
    }

    /// Tables the asker lacks, and hashes of the ones that differ.
    pub fn get_mergeable_table_diff(&self, other_table_hashes: &TableHashes) -> TableDiff {
        self.stamps(|stamps| stamps.table_diff(other_table_hashes))
    }

    pub fn get_mergeable_row_hashes(&self, other_table_hashes: &TableHashes) -> RowHashes {
        self.stamps(|stamps| stamps.row_hashes(other_table_hashes))
    }

    pub fn get_mergeable_row_diff(&self, other_row_hashes: &RowHashes) -> RowDiff {
        self.stamps(|stamps| stamps.row_diff(other_row_hashes))
    }

    pub fn get_mergeable_cell_hashes(&self, other_row_hashes: &RowHashes) -> CellHashes {
        self.stamps(|stamps| stamps.cell_hashes(other_row_hashes))
    }

    pub fn get_mergeable_cell_diff(&self, other_cell_hashes: &CellHashes) -> TablesStamp {
        self.stamps(|stamps| stamps.cell_diff(other_cell_hashes))
    }

    pub fn get_mergeable_value_hashes(&self) -> ValueHashes {
        self.stamps(Stamps::value_hashes)
    }

    pub fn get_mergeable_value_diff(&self, other_value_hashes: &ValueHashes) -> ValuesStamp {
        self.stamps(|stamps| stamps.value_diff(other_value_hashes))
    }

    /// Stamps of everything touched in the current, or last, transaction.
    pub fn get_transaction_mergeable_changes(&self) -> MergeableChanges {
        self.stamps(Stamps::touched_changes)
    }

    /// Apply remote stamps, keeping each one only if it is newer than the
    /// local stamp at the same path. Listeners see the accepted changes.
    ///
    /// Schema defaults that complete an accepted row are local content and
    /// get no stamp: they are not part of the hashes, and replicas without
    /// the schema never receive them. A replica that wants a default to
    /// travel should write it, or use [`MergeableStore::set_default_content`].
    pub fn apply_mergeable_changes(&self, changes: &MergeableChanges) -> &Self {
        self.store.write(|state| {
            let Some(stamps) = state.stamps.as_mut() else {
                return;
            };
            let accepted = stamps.merge(changes);
            if accepted.is_empty() {
                return;
            }
            tracing::debug!(
                tables = accepted.tables.len(),
                values = accepted.values.len(),
                "applying mergeable changes"
            );
            stamps.listening = false;
            state.apply_changes(accepted);
            if let Some(stamps) = state.stamps.as_mut() {
                stamps.listening = true;
            }
        });
        self
    }

    /// Exchange stamps with `other` in both directions.
    pub fn merge(&self, other: &MergeableStore) -> &Self {
        let ours = self.get_mergeable_content().to_changes();
        let theirs = other.get_mergeable_content().to_changes();
        self.apply_mergeable_changes(&theirs);
        other.apply_mergeable_changes(&ours);
        self
    }

    /// Fill in content stamped with the empty time, so that any real write,
    /// local or remote, wins over it. Existing stamps are left alone.
    pub fn set_default_content(&self, content: Content) -> &Self {
        let (tables, values) = content;
        self.apply_mergeable_changes(&default_changes(tables, values))
    }

    /// Replace the stamp tree and the content it describes. Hashes are
    /// recomputed from the stamps rather than trusted.
    pub fn set_mergeable_content(&self, content: MergeableContent) -> &Self {
        let changes = content.to_changes();
        self.store.write(|state| {
            let Some(stamps) = state.stamps.as_mut() else {
                return;
            };
            stamps.reset();
            stamps.merge(&changes);
            let (tables, values) = live_content(&stamps.content);
            stamps.listening = false;
            state.set_content(tables, values);
            if let Some(stamps) = state.stamps.as_mut() {
                stamps.listening = true;
            }
        });
        self
    }
}

fn default_changes(tables: Tables, values: Values) -> MergeableChanges {
    let tables = tables
        .into_iter()
        .map(|(table_id, table)| {
            let rows = table
                .into_iter()
                .map(|(row_id, row)| {
                    let cells = row
                        .into_iter()
                        .map(|(cell_id, cell)| (cell_id, Stamp::new(Some(cell), "")))
                        .collect();
                    (row_id, Stamp::new(cells, ""))
                })
                .collect();
            (table_id, Stamp::new(rows, ""))
        })
        .collect();
    let values = values
        .into_iter()
        .map(|(value_id, value)| (value_id, Stamp::new(Some(value), "")))
        .collect();
    MergeableChanges {
        tables: Stamp::new(tables, ""),
        values: Stamp::new(values, ""),
    }
}

/// Content of a stamp tree, skipping tombstones.
fn live_content(content: &MergeableContent) -> Content {
    let mut tables = Tables::new();
    for (table_id, table) in &content.tables.thing {
        for (row_id, row) in &table.thing {
            for (cell_id, cell) in &row.thing {
                if let Some(thing) = &cell.thing {
                    tables
                        .entry(table_id.clone())
                        .or_default()
                        .entry(row_id.clone())
                        .or_default()
                        .insert(cell_id.clone(), thing.clone());
                }
            }
        }
    }
    let values = content
        .values
        .thing
        .iter()
        .filter_map(|(value_id, value)| {
            value
                .thing
                .as_ref()
                .map(|thing| (value_id.clone(), thing.clone()))
        })
        .collect();
    (tables, values)
}
