//! Metrics - numeric aggregates over the rows of a table, kept current as
//! the table changes.

use crate::{
    derived::Derived,
    listeners::{matching, pattern, ListenerSet},
    Id, Ids, ListenerId, Row, Store, Table,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// How a list of numbers is reduced to one.
#[derive(Clone)]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Custom(Rc<dyn Fn(&[f64]) -> Option<f64>>),
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Sum => f.write_str("Sum"),
            Aggregate::Avg => f.write_str("Avg"),
            Aggregate::Min => f.write_str("Min"),
            Aggregate::Max => f.write_str("Max"),
            Aggregate::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Aggregate {
    pub fn custom(aggregate: impl Fn(&[f64]) -> Option<f64> + 'static) -> Self {
        Aggregate::Custom(Rc::new(aggregate))
    }

    /// Reduce `numbers`; nothing to reduce gives `None`.
    pub fn apply(&self, numbers: &[f64]) -> Option<f64> {
        if numbers.is_empty() {
            return None;
        }
        match self {
            Aggregate::Sum => Some(numbers.iter().sum()),
            Aggregate::Avg => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
            Aggregate::Min => numbers.iter().copied().reduce(f64::min),
            Aggregate::Max => numbers.iter().copied().reduce(f64::max),
            Aggregate::Custom(aggregate) => aggregate(numbers),
        }
    }
}

type RowNumber = Rc<dyn Fn(&Row, &str) -> Option<f64>>;

/// Which table a metric covers, the number each row contributes, and how
/// those numbers are aggregated.
///
/// By default every row contributes `1` and numbers are summed, so the
/// metric is the row count.
#[derive(Clone)]
pub struct MetricDefinition {
    table_id: Id,
    aggregate: Aggregate,
    number: Option<RowNumber>,
}

impl fmt::Debug for MetricDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("table_id", &self.table_id)
            .field("aggregate", &self.aggregate)
            .finish_non_exhaustive()
    }
}

impl MetricDefinition {
    pub fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            aggregate: Aggregate::Sum,
            number: None,
        }
    }

    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Take each row's number from a cell. Rows without a numeric cell
    /// there are left out.
    pub fn number_from_cell(mut self, cell_id: &str) -> Self {
        let cell_id = cell_id.to_string();
        self.number = Some(Rc::new(move |row: &Row, _: &str| {
            row.get(&cell_id).and_then(|cell| cell.as_number())
        }));
        self
    }

    /// Compute each row's number; `None` leaves the row out.
    pub fn number_from(mut self, number: impl Fn(&Row, &str) -> Option<f64> + 'static) -> Self {
        self.number = Some(Rc::new(number));
        self
    }

    fn evaluate(&self, table: &Table) -> Option<f64> {
        let numbers: Vec<f64> = match &self.number {
            Some(number) => table
                .iter()
                .filter_map(|(row_id, row)| number(row, row_id))
                .collect(),
            None => vec![1.0; table.len()],
        };
        self.aggregate.apply(&numbers)
    }
}

pub type MetricListener = dyn Fn(&Metrics, &str, Option<f64>, Option<f64>);

struct MetricsInner {
    derived: Derived<MetricDefinition>,
    metrics: RefCell<BTreeMap<Id, f64>>,
    listeners: RefCell<ListenerSet<MetricListener>>,
}

/// Named aggregates over a [`Store`].
#[derive(Clone)]
pub struct Metrics {
    inner: Rc<MetricsInner>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("metrics", &self.inner.metrics.borrow())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new(store: &Store) -> Self {
        Self {
            inner: Rc::new(MetricsInner {
                derived: Derived::new(store),
                metrics: RefCell::new(BTreeMap::new()),
                listeners: RefCell::new(ListenerSet::default()),
            }),
        }
    }

    pub fn get_store(&self) -> &Store {
        &self.inner.derived.store
    }

    /// Define, or redefine, a metric and compute it straight away.
    pub fn set_metric_definition(&self, metric_id: &str, definition: MetricDefinition) -> &Self {
        let table_id = definition.table_id.clone();
        self.inner
            .derived
            .definitions
            .borrow_mut()
            .insert(metric_id.to_string(), definition);
        let weak = Rc::downgrade(&self.inner);
        let watched_id = metric_id.to_string();
        self.inner
            .derived
            .watch_tables(metric_id, &[table_id], move |_| {
                if let Some(inner) = weak.upgrade() {
                    Metrics { inner }.recompute(&watched_id);
                }
            });
        self.recompute(metric_id);
        self
    }

    pub fn del_metric_definition(&self, metric_id: &str) -> &Self {
        self.inner.derived.unwatch(metric_id);
        self.inner.derived.definitions.borrow_mut().remove(metric_id);
        self.set_metric(metric_id, None);
        self
    }

    pub fn get_metric_ids(&self) -> Ids {
        self.inner.derived.definition_ids()
    }

    pub fn has_metric(&self, metric_id: &str) -> bool {
        self.inner.derived.has_definition(metric_id)
    }

    pub fn get_table_id(&self, metric_id: &str) -> Option<Id> {
        self.inner
            .derived
            .definitions
            .borrow()
            .get(metric_id)
            .map(|definition| definition.table_id.clone())
    }

    /// The metric's value, or `None` when no row contributes a number.
    pub fn get_metric(&self, metric_id: &str) -> Option<f64> {
        self.inner.metrics.borrow().get(metric_id).copied()
    }

    /// The listener gets `(metrics, metric_id, new, old)`.
    pub fn add_metric_listener(
        &self,
        metric_id: Option<&str>,
        listener: impl Fn(&Metrics, &str, Option<f64>, Option<f64>) + 'static,
    ) -> ListenerId {
        let id = self.inner.derived.next_listener_id();
        self.inner
            .listeners
            .borrow_mut()
            .add(id, pattern(&[metric_id]), Rc::new(listener));
        id
    }

    pub fn del_listener(&self, listener_id: ListenerId) -> &Self {
        self.inner.listeners.borrow_mut().remove(listener_id);
        self
    }

    /// Stop following the store and drop every listener.
    pub fn destroy(&self) {
        self.inner.derived.unwatch_all();
        self.inner.listeners.borrow_mut().clear();
    }

    fn recompute(&self, metric_id: &str) {
        let definition = self.inner.derived.definitions.borrow().get(metric_id).cloned();
        let Some(definition) = definition else {
            return;
        };
        let table = self.get_store().get_table(&definition.table_id);
        self.set_metric(metric_id, definition.evaluate(&table));
    }

    fn set_metric(&self, metric_id: &str, new: Option<f64>) {
        let old = {
            let mut metrics = self.inner.metrics.borrow_mut();
            match new {
                Some(metric) => metrics.insert(metric_id.to_string(), metric),
                None => metrics.remove(metric_id),
            }
        };
        if old != new {
            for listener in matching(&self.inner.listeners, &[metric_id]) {
                listener(self, metric_id, new, old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cell;

    fn pets() -> Store {
        let store = Store::new();
        store
            .set_cell("pets", "fido", "price", 5)
            .set_cell("pets", "felix", "price", 4)
            .set_cell("pets", "cujo", "price", 3)
            .set_cell("pets", "rex", "name", "rex");
        store
    }

    #[test]
    fn default_metric_counts_rows() {
        let store = pets();
        let metrics = Metrics::new(&store);
        metrics.set_metric_definition("count", MetricDefinition::new("pets"));
        assert_eq!(metrics.get_metric("count"), Some(4.0));
        store.del_row("pets", "rex");
        assert_eq!(metrics.get_metric("count"), Some(3.0));
        store.del_table("pets");
        assert_eq!(metrics.get_metric("count"), None);
    }

    #[test]
    fn aggregates_over_a_cell() {
        let store = pets();
        let metrics = Metrics::new(&store);
        for (metric_id, aggregate) in [
            ("sum", Aggregate::Sum),
            ("avg", Aggregate::Avg),
            ("min", Aggregate::Min),
            ("max", Aggregate::Max),
            ("range", Aggregate::custom(|numbers| {
                let max = numbers.iter().copied().reduce(f64::max)?;
                let min = numbers.iter().copied().reduce(f64::min)?;
                Some(max - min)
            })),
        ] {
            metrics.set_metric_definition(
                metric_id,
                MetricDefinition::new("pets")
                    .aggregate(aggregate)
                    .number_from_cell("price"),
            );
        }
        assert_eq!(metrics.get_metric("sum"), Some(12.0));
        assert_eq!(metrics.get_metric("avg"), Some(4.0));
        assert_eq!(metrics.get_metric("min"), Some(3.0));
        assert_eq!(metrics.get_metric("max"), Some(5.0));
        assert_eq!(metrics.get_metric("range"), Some(2.0));
        assert_eq!(metrics.get_metric_ids(), vec!["avg", "max", "min", "range", "sum"]);
        assert_eq!(metrics.get_table_id("sum").as_deref(), Some("pets"));
    }

    #[test]
    fn computed_numbers() {
        let store = pets();
        let metrics = Metrics::new(&store);
        metrics.set_metric_definition(
            "named",
            MetricDefinition::new("pets").number_from(|row, _| row.contains_key("name").then_some(1.0)),
        );
        assert_eq!(metrics.get_metric("named"), Some(1.0));
    }

    #[test]
    fn listener_sees_new_and_old() {
        let store = pets();
        let metrics = Metrics::new(&store);
        metrics.set_metric_definition(
            "max",
            MetricDefinition::new("pets")
                .aggregate(Aggregate::Max)
                .number_from_cell("price"),
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        metrics.add_metric_listener(Some("max"), move |_, metric_id, new, old| {
            log.borrow_mut().push(format!("{metric_id}: {old:?} -> {new:?}"));
        });
        store.set_cell("pets", "cujo", "price", 4);
        store.set_cell("pets", "cujo", "price", 9);
        store.set_cell("pets", "cujo", "species", Cell::from("dog"));
        assert_eq!(*seen.borrow(), vec!["max: Some(5.0) -> Some(9.0)"]);

        metrics.del_metric_definition("max");
        assert_eq!(seen.borrow().len(), 2);
        assert!(!metrics.has_metric("max"));
    }

    #[test]
    fn destroy_stops_following() {
        let store = pets();
        let metrics = Metrics::new(&store);
        metrics.set_metric_definition("count", MetricDefinition::new("pets"));
        metrics.destroy();
        store.del_tables();
        assert_eq!(metrics.get_metric("count"), Some(4.0));
        assert_eq!(store.get_listener_stats().table, 0);
    }
}
