//! Sync message protocol between mergeable stores.
//!
//! Messages are JSON-encoded as `{"type": ..., "payload": ...}` with
//! snake_case type names. Nothing here owns a transport: [`respond`]
//! answers one request from local state and [`pull`] drives a diff against
//! whatever function carries requests to the other side.

use crate::{
    error::{Error, Result},
    stamp::{CellHashes, RowDiff, RowHashes, TableDiff, TableHashes, TablesStamp, ValueHashes, ValuesStamp},
    ContentHashes, MergeableChanges, MergeableStore,
};
use serde::{Deserialize, Serialize};

/// Messages exchanged between two replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Ask for the top-level hashes.
    GetContentHashes,

    /// Announce the sender's top-level hashes, usually after it changed.
    ContentHashes(ContentHashes),

    /// Changes the receiver should merge.
    ContentDiff(MergeableChanges),

    /// Ask for tables the sender lacks, given the sender's table hashes.
    GetTableDiff(TableHashes),

    /// Ask for rows the sender lacks, given its row hashes of differing tables.
    GetRowDiff(RowHashes),

    /// Ask for differing cells, given the sender's cell hashes.
    GetCellDiff(CellHashes),

    /// Ask for differing values, given the sender's value hashes.
    GetValueDiff(ValueHashes),

    /// Answer to any of the `Get*` requests.
    Response(Response),
}

/// Payload of a [`Message::Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Response {
    ContentHashes(ContentHashes),
    TableDiff(TableDiff),
    RowDiff(RowDiff),
    CellDiff(TablesStamp),
    ValueDiff(ValuesStamp),
}

impl Message {
    /// Announce the store's current hashes.
    pub fn content_hashes(store: &MergeableStore) -> Self {
        Message::ContentHashes(store.get_mergeable_content_hashes())
    }

    /// Push everything changed by the transaction in progress.
    pub fn transaction_diff(store: &MergeableStore) -> Self {
        Message::ContentDiff(store.get_transaction_mergeable_changes())
    }

    fn name(&self) -> &'static str {
        match self {
            Message::GetContentHashes => "get_content_hashes",
            Message::ContentHashes(_) => "content_hashes",
            Message::ContentDiff(_) => "content_diff",
            Message::GetTableDiff(_) => "get_table_diff",
            Message::GetRowDiff(_) => "get_row_diff",
            Message::GetCellDiff(_) => "get_cell_diff",
            Message::GetValueDiff(_) => "get_value_diff",
            Message::Response(_) => "response",
        }
    }
}

/// Answer `message` from the state of `store`.
///
/// Requests get a [`Message::Response`]. A content diff is merged into the
/// store and an announcement is noted; neither is answered. A response
/// arriving here was never asked for and is an error.
pub fn respond(store: &MergeableStore, message: Message) -> Result<Option<Message>> {
    let response = match message {
        Message::GetContentHashes => Response::ContentHashes(store.get_mergeable_content_hashes()),
        Message::GetTableDiff(hashes) => Response::TableDiff(store.get_mergeable_table_diff(&hashes)),
        Message::GetRowDiff(hashes) => Response::RowDiff(store.get_mergeable_row_diff(&hashes)),
        Message::GetCellDiff(hashes) => Response::CellDiff(store.get_mergeable_cell_diff(&hashes)),
        Message::GetValueDiff(hashes) => Response::ValueDiff(store.get_mergeable_value_diff(&hashes)),
        Message::ContentDiff(changes) => {
            store.apply_mergeable_changes(&changes);
            return Ok(None);
        }
        Message::ContentHashes(hashes) => {
            tracing::debug!(
                in_sync = hashes == store.get_mergeable_content_hashes(),
                "peer announced content hashes"
            );
            return Ok(None);
        }
        Message::Response(_) => {
            tracing::warn!("unsolicited sync response");
            return Err(Error::UnexpectedMessage("response".to_string()));
        }
    };
    Ok(Some(Message::Response(response)))
}

/// Bring `store` up to date with a peer reached through `request`.
///
/// Walks down the hash tree, asking only for the parts whose hashes
/// differ, and merges what comes back. Returns whether anything differed.
pub fn pull(
    store: &MergeableStore,
    mut request: impl FnMut(Message) -> Result<Message>,
) -> Result<bool> {
    let Response::ContentHashes(theirs) = ask(&mut request, Message::GetContentHashes)? else {
        return Err(unexpected("content hashes"));
    };
    let ours = store.get_mergeable_content_hashes();
    if theirs == ours {
        return Ok(false);
    }

    if theirs.tables() != ours.tables() {
        pull_tables(store, &mut request)?;
    }
    if theirs.values() != ours.values() {
        let message = Message::GetValueDiff(store.get_mergeable_value_hashes());
        let Response::ValueDiff(values) = ask(&mut request, message)? else {
            return Err(unexpected("value diff"));
        };
        store.apply_mergeable_changes(&MergeableChanges {
            values,
            ..MergeableChanges::default()
        });
    }
    tracing::debug!(hashes = ?store.get_mergeable_content_hashes(), "pulled from peer");
    Ok(true)
}

fn pull_tables(
    store: &MergeableStore,
    request: &mut impl FnMut(Message) -> Result<Message>,
) -> Result<()> {
    let message = Message::GetTableDiff(store.get_mergeable_table_hashes());
    let Response::TableDiff(TableDiff(new_tables, differing_tables)) = ask(request, message)? else {
        return Err(unexpected("table diff"));
    };
    apply_tables(store, new_tables);
    if differing_tables.is_empty() {
        return Ok(());
    }

    let message = Message::GetRowDiff(store.get_mergeable_row_hashes(&differing_tables));
    let Response::RowDiff(RowDiff(new_rows, differing_rows)) = ask(request, message)? else {
        return Err(unexpected("row diff"));
    };
    apply_tables(store, new_rows);
    if differing_rows.is_empty() {
        return Ok(());
    }

    let message = Message::GetCellDiff(store.get_mergeable_cell_hashes(&differing_rows));
    let Response::CellDiff(cells) = ask(request, message)? else {
        return Err(unexpected("cell diff"));
    };
    apply_tables(store, cells);
    Ok(())
}

fn ask(request: &mut impl FnMut(Message) -> Result<Message>, message: Message) -> Result<Response> {
    let name = message.name();
    match request(message)? {
        Message::Response(response) => Ok(response),
        other => {
            tracing::warn!(request = name, reply = other.name(), "peer did not respond");
            Err(Error::UnexpectedMessage(other.name().to_string()))
        }
    }
}

fn apply_tables(store: &MergeableStore, tables: TablesStamp) {
    if tables.thing.is_empty() {
        return;
    }
    store.apply_mergeable_changes(&MergeableChanges {
        tables,
        ..MergeableChanges::default()
    });
}

fn unexpected(wanted: &str) -> Error {
    Error::UnexpectedMessage(format!("expected {wanted} response"))
}
