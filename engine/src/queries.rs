//! Queries - select, join, filter and group the rows of a table into a
//! result table, kept current as the source tables change.
//!
//! Results live in a private [`Store`], one result table per query, so
//! result listeners behave exactly like store listeners and are only
//! called when a result cell really changes.

use crate::{
    changes::GetCellChange,
    derived::Derived,
    metrics::Aggregate,
    Cell, Id, Ids, ListenerId, Row, Store, Table,
};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

type Computed = Rc<dyn Fn(&QueryRow) -> Option<Cell>>;
type Condition = Rc<dyn Fn(&QueryRow) -> bool>;
type Having = Rc<dyn Fn(&Row) -> bool>;

/// One source row with the rows joined to it, as seen by computed selects
/// and `where` conditions.
#[derive(Debug)]
pub struct QueryRow<'a> {
    row_id: &'a str,
    row: &'a Row,
    joined: BTreeMap<&'a str, &'a Row>,
}

impl<'a> QueryRow<'a> {
    pub fn row_id(&self) -> &str {
        self.row_id
    }

    /// A cell of the queried table's row.
    pub fn get_cell(&self, cell_id: &str) -> Option<&'a Cell> {
        self.row.get(cell_id)
    }

    /// A cell of the row joined under `join_id`, if there is one.
    pub fn get_joined_cell(&self, join_id: &str, cell_id: &str) -> Option<&'a Cell> {
        self.joined.get(join_id).copied().and_then(|row| row.get(cell_id))
    }
}

#[derive(Clone)]
enum SelectSource {
    Cell { join_id: Option<Id>, cell_id: Id },
    Computed(Computed),
}

#[derive(Clone)]
struct Select {
    result_cell_id: Id,
    source: SelectSource,
}

#[derive(Clone, Debug)]
struct Join {
    join_id: Id,
    table_id: Id,
    on_cell_id: Id,
}

#[derive(Clone)]
enum Where {
    Equals { cell_id: Id, cell: Cell },
    Condition(Condition),
}

/// What a query selects, and from where.
#[derive(Clone)]
pub struct QueryDefinition {
    table_id: Id,
    selects: Vec<Select>,
    joins: Vec<Join>,
    wheres: Vec<Where>,
    groups: Vec<(Id, Aggregate)>,
    havings: Vec<Having>,
}

impl fmt::Debug for QueryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDefinition")
            .field("table_id", &self.table_id)
            .field("joins", &self.joins)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl QueryDefinition {
    pub fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            selects: Vec::new(),
            joins: Vec::new(),
            wheres: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
        }
    }

    /// Select a cell of the queried table.
    pub fn select(mut self, cell_id: &str) -> Self {
        self.selects.push(Select {
            result_cell_id: cell_id.to_string(),
            source: SelectSource::Cell {
                join_id: None,
                cell_id: cell_id.to_string(),
            },
        });
        self
    }

    /// Select a cell of a joined row.
    pub fn select_from(mut self, join_id: &str, cell_id: &str) -> Self {
        self.selects.push(Select {
            result_cell_id: cell_id.to_string(),
            source: SelectSource::Cell {
                join_id: Some(join_id.to_string()),
                cell_id: cell_id.to_string(),
            },
        });
        self
    }

    /// Rename the result cell of the most recent select.
    pub fn select_as(mut self, result_cell_id: &str) -> Self {
        if let Some(select) = self.selects.last_mut() {
            select.result_cell_id = result_cell_id.to_string();
        }
        self
    }

    pub fn select_computed(
        mut self,
        result_cell_id: &str,
        computed: impl Fn(&QueryRow) -> Option<Cell> + 'static,
    ) -> Self {
        self.selects.push(Select {
            result_cell_id: result_cell_id.to_string(),
            source: SelectSource::Computed(Rc::new(computed)),
        });
        self
    }

    /// Join the row of `table_id` whose id is the value of `on_cell_id`.
    pub fn join(self, table_id: &str, on_cell_id: &str) -> Self {
        self.join_as(table_id, on_cell_id, table_id)
    }

    /// Like [`QueryDefinition::join`], naming the join `join_id` so one
    /// table can be joined more than once.
    pub fn join_as(mut self, table_id: &str, on_cell_id: &str, join_id: &str) -> Self {
        self.joins.push(Join {
            join_id: join_id.to_string(),
            table_id: table_id.to_string(),
            on_cell_id: on_cell_id.to_string(),
        });
        self
    }

    /// Keep rows whose cell equals `cell`.
    pub fn where_eq(mut self, cell_id: &str, cell: impl Into<Cell>) -> Self {
        self.wheres.push(Where::Equals {
            cell_id: cell_id.to_string(),
            cell: cell.into(),
        });
        self
    }

    pub fn where_fn(mut self, condition: impl Fn(&QueryRow) -> bool + 'static) -> Self {
        self.wheres.push(Where::Condition(Rc::new(condition)));
        self
    }

    /// Aggregate a selected numeric cell over rows that share every other
    /// selected cell.
    pub fn group(mut self, result_cell_id: &str, aggregate: Aggregate) -> Self {
        self.groups.push((result_cell_id.to_string(), aggregate));
        self
    }

    /// Keep grouped rows that satisfy `having`.
    pub fn having(mut self, having: impl Fn(&Row) -> bool + 'static) -> Self {
        self.havings.push(Rc::new(having));
        self
    }

    fn table_ids(&self) -> Ids {
        let mut table_ids = vec![self.table_id.clone()];
        for join in &self.joins {
            if !table_ids.contains(&join.table_id) {
                table_ids.push(join.table_id.clone());
            }
        }
        table_ids
    }

    fn evaluate(&self, store: &Store) -> Table {
        let table = store.get_table(&self.table_id);
        let joined_tables: BTreeMap<&str, Table> = self
            .joins
            .iter()
            .map(|join| (join.join_id.as_str(), store.get_table(&join.table_id)))
            .collect();

        let mut result = Table::new();
        for (row_id, row) in &table {
            let joined = self
                .joins
                .iter()
                .filter_map(|join| {
                    let remote_row_id = row.get(&join.on_cell_id)?.to_id();
                    let remote_row = joined_tables.get(join.join_id.as_str())?.get(&remote_row_id)?;
                    Some((join.join_id.as_str(), remote_row))
                })
                .collect();
            let query_row = QueryRow {
                row_id,
                row,
                joined,
            };
            if !self.wheres.iter().all(|condition| satisfies(condition, &query_row)) {
                continue;
            }
            let result_row: Row = self
                .selects
                .iter()
                .filter_map(|select| {
                    let cell = match &select.source {
                        SelectSource::Cell {
                            join_id: None,
                            cell_id,
                        } => query_row.get_cell(cell_id).cloned(),
                        SelectSource::Cell {
                            join_id: Some(join_id),
                            cell_id,
                        } => query_row.get_joined_cell(join_id, cell_id).cloned(),
                        SelectSource::Computed(computed) => computed(&query_row),
                    }?;
                    Some((select.result_cell_id.clone(), cell))
                })
                .collect();
            if !result_row.is_empty() {
                result.insert(row_id.clone(), result_row);
            }
        }

        if self.groups.is_empty() {
            result
        } else {
            self.grouped(result)
        }
    }

    fn grouped(&self, rows: Table) -> Table {
        let is_grouped = |cell_id: &str| self.groups.iter().any(|(grouped, _)| grouped == cell_id);
        let mut buckets: BTreeMap<String, (Row, Vec<Row>)> = BTreeMap::new();
        for row in rows.into_values() {
            let key: Row = row
                .iter()
                .filter(|(cell_id, _)| !is_grouped(cell_id))
                .map(|(cell_id, cell)| (cell_id.clone(), cell.clone()))
                .collect();
            let bucket_id = serde_json::to_string(&key).unwrap_or_default();
            buckets
                .entry(bucket_id)
                .or_insert_with(|| (key, Vec::new()))
                .1
                .push(row);
        }

        let mut result = Table::new();
        for (key, members) in buckets.into_values() {
            let mut row = key;
            for (cell_id, aggregate) in &self.groups {
                let numbers: Vec<f64> = members
                    .iter()
                    .filter_map(|member| member.get(cell_id).and_then(Cell::as_number))
                    .collect();
                if let Some(number) = aggregate.apply(&numbers) {
                    row.insert(cell_id.clone(), Cell::from(number));
                }
            }
            if !row.is_empty() && self.havings.iter().all(|having| having(&row)) {
                result.insert(result.len().to_string(), row);
            }
        }
        result
    }
}

fn satisfies(condition: &Where, query_row: &QueryRow) -> bool {
    match condition {
        Where::Equals { cell_id, cell } => query_row.get_cell(cell_id) == Some(cell),
        Where::Condition(condition) => condition(query_row),
    }
}

struct QueriesInner {
    derived: Derived<QueryDefinition>,
    results: Store,
}

/// Named queries over a [`Store`].
#[derive(Clone)]
pub struct Queries {
    inner: Rc<QueriesInner>,
}

impl fmt::Debug for Queries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queries")
            .field("results", &self.inner.results)
            .finish_non_exhaustive()
    }
}

impl Queries {
    pub fn new(store: &Store) -> Self {
        Self {
            inner: Rc::new(QueriesInner {
                derived: Derived::new(store),
                results: Store::new(),
            }),
        }
    }

    pub fn get_store(&self) -> &Store {
        &self.inner.derived.store
    }

    /// Define, or redefine, a query and compute its result straight away.
    pub fn set_query_definition(&self, query_id: &str, definition: QueryDefinition) -> &Self {
        let table_ids = definition.table_ids();
        self.inner
            .derived
            .definitions
            .borrow_mut()
            .insert(query_id.to_string(), definition);
        let weak = Rc::downgrade(&self.inner);
        let watched_id = query_id.to_string();
        self.inner
            .derived
            .watch_tables(query_id, &table_ids, move |_| {
                if let Some(inner) = weak.upgrade() {
                    Queries { inner }.recompute(&watched_id);
                }
            });
        self.recompute(query_id);
        self
    }

    pub fn del_query_definition(&self, query_id: &str) -> &Self {
        self.inner.derived.unwatch(query_id);
        self.inner.derived.definitions.borrow_mut().remove(query_id);
        self.inner.results.del_table(query_id);
        self
    }

    pub fn get_query_ids(&self) -> Ids {
        self.inner.derived.definition_ids()
    }

    pub fn has_query(&self, query_id: &str) -> bool {
        self.inner.derived.has_definition(query_id)
    }

    pub fn get_table_id(&self, query_id: &str) -> Option<Id> {
        self.inner
            .derived
            .definitions
            .borrow()
            .get(query_id)
            .map(|definition| definition.table_id.clone())
    }

    fn recompute(&self, query_id: &str) {
        let definition = self.inner.derived.definitions.borrow().get(query_id).cloned();
        let Some(definition) = definition else {
            return;
        };
        let result = definition.evaluate(self.get_store());
        if result.is_empty() {
            self.inner.results.del_table(query_id);
        } else {
            self.inner.results.set_table(query_id, result);
        }
    }

    // Results

    pub fn get_result_table(&self, query_id: &str) -> Table {
        self.inner.results.get_table(query_id)
    }

    pub fn get_result_table_cell_ids(&self, query_id: &str) -> Ids {
        self.inner.results.get_table_cell_ids(query_id)
    }

    pub fn get_result_row_count(&self, query_id: &str) -> usize {
        self.inner.results.get_row_count(query_id)
    }

    pub fn get_result_row_ids(&self, query_id: &str) -> Ids {
        self.inner.results.get_row_ids(query_id)
    }

    pub fn get_result_sorted_row_ids(
        &self,
        query_id: &str,
        cell_id: Option<&str>,
        descending: bool,
        offset: usize,
        limit: Option<usize>,
    ) -> Ids {
        self.inner
            .results
            .get_sorted_row_ids(query_id, cell_id, descending, offset, limit)
    }

    pub fn has_result_row(&self, query_id: &str, row_id: &str) -> bool {
        self.inner.results.has_row(query_id, row_id)
    }

    pub fn get_result_row(&self, query_id: &str, row_id: &str) -> Row {
        self.inner.results.get_row(query_id, row_id)
    }

    pub fn get_result_cell(&self, query_id: &str, row_id: &str, cell_id: &str) -> Option<Cell> {
        self.inner.results.get_cell(query_id, row_id, cell_id)
    }

    // Result listeners

    fn weak(&self) -> Weak<QueriesInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn add_result_table_listener(
        &self,
        query_id: Option<&str>,
        listener: impl Fn(&Queries, &str) + 'static,
    ) -> ListenerId {
        let weak = self.weak();
        self.inner.results.add_table_listener(
            query_id,
            move |_: &Store, query_id: &str, _: &GetCellChange| {
                if let Some(inner) = weak.upgrade() {
                    listener(&Queries { inner }, query_id);
                }
            },
            false,
        )
    }

    pub fn add_result_row_ids_listener(
        &self,
        query_id: Option<&str>,
        listener: impl Fn(&Queries, &str) + 'static,
    ) -> ListenerId {
        let weak = self.weak();
        self.inner.results.add_row_ids_listener(
            query_id,
            move |_: &Store, query_id: &str, _: &crate::ChangedIds| {
                if let Some(inner) = weak.upgrade() {
                    listener(&Queries { inner }, query_id);
                }
            },
            false,
        )
    }

    pub fn add_result_row_listener(
        &self,
        query_id: Option<&str>,
        row_id: Option<&str>,
        listener: impl Fn(&Queries, &str, &str) + 'static,
    ) -> ListenerId {
        let weak = self.weak();
        self.inner.results.add_row_listener(
            query_id,
            row_id,
            move |_: &Store, query_id: &str, row_id: &str, _: &GetCellChange| {
                if let Some(inner) = weak.upgrade() {
                    listener(&Queries { inner }, query_id, row_id);
                }
            },
            false,
        )
    }

    /// The listener gets `(queries, query, row, cell, new, old)`.
    pub fn add_result_cell_listener(
        &self,
        query_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        listener: impl Fn(&Queries, &str, &str, &str, Option<&Cell>, Option<&Cell>) + 'static,
    ) -> ListenerId {
        let weak = self.weak();
        self.inner.results.add_cell_listener(
            query_id,
            row_id,
            cell_id,
            move |_: &Store,
                  query_id: &str,
                  row_id: &str,
                  cell_id: &str,
                  new: Option<&Cell>,
                  old: Option<&Cell>,
                  _: &GetCellChange| {
                if let Some(inner) = weak.upgrade() {
                    listener(&Queries { inner }, query_id, row_id, cell_id, new, old);
                }
            },
            false,
        )
    }

    pub fn del_listener(&self, listener_id: ListenerId) -> &Self {
        self.inner.results.del_listener(listener_id);
        self
    }

    pub fn destroy(&self) {
        self.inner.derived.unwatch_all();
        self.inner.results.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn store() -> Store {
        let store = Store::new();
        store
            .set_json(
                r#"[{
                    "pets": {
                        "fido": {"species": "dog", "color": "brown", "owner": "alice"},
                        "felix": {"species": "cat", "color": "black", "owner": "bob"},
                        "cujo": {"species": "dog", "color": "black"},
                        "rex": {"species": "dog", "color": "brown", "owner": "alice"}
                    },
                    "species": {"dog": {"price": 5}, "cat": {"price": 4}},
                    "owners": {"alice": {"name": "Alice"}, "bob": {"name": "Bob"}}
                }, {}]"#,
            )
            .unwrap();
        store
    }

    #[test]
    fn select_and_where() {
        let store = store();
        let queries = Queries::new(&store);
        queries.set_query_definition(
            "dogColors",
            QueryDefinition::new("pets")
                .select("color")
                .where_eq("species", "dog"),
        );
        assert_eq!(
            queries.get_result_row_ids("dogColors"),
            vec!["cujo", "fido", "rex"]
        );
        assert_eq!(
            queries.get_result_cell("dogColors", "fido", "color"),
            Some(Cell::from("brown"))
        );
        assert_eq!(queries.get_result_table_cell_ids("dogColors"), vec!["color"]);

        store.set_cell("pets", "felix", "species", "dog");
        assert_eq!(queries.get_result_row_count("dogColors"), 4);
        store.del_table("pets");
        assert!(queries.get_result_table("dogColors").is_empty());
    }

    #[test]
    fn joins_and_computed_cells() {
        let store = store();
        let queries = Queries::new(&store);
        queries.set_query_definition(
            "prices",
            QueryDefinition::new("pets")
                .join("species", "species")
                .join_as("owners", "owner", "owner")
                .select_from("species", "price")
                .select_from("owner", "name")
                .select_as("ownerName")
                .select_computed("label", |row| {
                    let species = row.get_cell("species")?.as_str()?;
                    Some(Cell::from(format!("{} {species}", row.row_id())))
                })
                .where_fn(|row| row.get_joined_cell("owner", "name").is_some()),
        );
        assert_eq!(queries.get_result_row_ids("prices"), vec!["felix", "fido", "rex"]);
        assert_eq!(
            queries.get_result_row("prices", "felix"),
            Row::from([
                ("label".to_string(), Cell::from("felix cat")),
                ("ownerName".to_string(), Cell::from("Bob")),
                ("price".to_string(), Cell::from(4)),
            ])
        );

        store.set_cell("species", "cat", "price", 6);
        assert_eq!(
            queries.get_result_cell("prices", "felix", "price"),
            Some(Cell::from(6))
        );
    }

    #[test]
    fn group_and_having() {
        let store = store();
        let queries = Queries::new(&store);
        queries.set_query_definition(
            "priceBySpecies",
            QueryDefinition::new("pets")
                .join("species", "species")
                .select("species")
                .select_from("species", "price")
                .group("price", Aggregate::Sum)
                .having(|row| row.get("price").and_then(Cell::as_number) > Some(4.0)),
        );
        assert_eq!(queries.get_result_row_count("priceBySpecies"), 1);
        assert_eq!(
            queries.get_result_row("priceBySpecies", "0"),
            Row::from([
                ("price".to_string(), Cell::from(15)),
                ("species".to_string(), Cell::from("dog")),
            ])
        );
        assert_eq!(
            queries.get_result_sorted_row_ids("priceBySpecies", Some("price"), true, 0, None),
            vec!["0"]
        );
    }

    #[test]
    fn result_listeners() {
        let store = store();
        let queries = Queries::new(&store);
        queries.set_query_definition(
            "colors",
            QueryDefinition::new("pets").select("color"),
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        queries.add_result_cell_listener(Some("colors"), None, None, move |queries, _, row_id, _, new, _| {
            log.borrow_mut().push(format!(
                "{row_id} {new:?} {}",
                queries.get_result_row_count("colors")
            ));
        });
        let log = Rc::clone(&seen);
        let ids_listener = queries.add_result_row_ids_listener(None, move |_, query_id| {
            log.borrow_mut().push(format!("ids {query_id}"));
        });

        store.set_cell("pets", "fido", "color", "white");
        store.set_cell("pets", "fido", "species", "wolf");
        assert_eq!(*seen.borrow(), vec![r#"fido Some(String("white")) 4"#]);

        queries.del_listener(ids_listener);
        store.del_row("pets", "fido");
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(seen.borrow()[1], "fido None 3");
    }

    #[test]
    fn definitions_are_tracked() {
        let store = store();
        let queries = Queries::new(&store);
        queries.set_query_definition("colors", QueryDefinition::new("pets").select("color"));
        assert_eq!(queries.get_query_ids(), vec!["colors"]);
        assert_eq!(queries.get_table_id("colors").as_deref(), Some("pets"));
        queries.del_query_definition("colors");
        assert!(!queries.has_query("colors"));
        assert!(queries.get_result_table("colors").is_empty());
        assert_eq!(store.get_listener_stats().table, 0);
    }
}
