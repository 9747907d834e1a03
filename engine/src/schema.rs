//! Schema definition and validation.
//!
//! A schema is optional. When present it constrains which tables, cells and
//! values may exist, their types, and the defaults filled into new rows.
//! Schemas change validation only, never the storage representation.

use crate::{cell::CellType, error::Result, Cell, Error, Id, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type and optional default for one cell (or value) id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CellSchema {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
    },
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<bool>,
    },
}

/// Values are described the same way as cells.
pub type ValueSchema = CellSchema;
/// Cell id to cell schema, for one table.
pub type TableSchema = BTreeMap<Id, CellSchema>;
/// Table id to table schema.
pub type TablesSchema = BTreeMap<Id, TableSchema>;
/// Value id to value schema.
pub type ValuesSchema = BTreeMap<Id, ValueSchema>;

impl CellSchema {
    pub fn string() -> Self {
        CellSchema::String { default: None }
    }

    pub fn number() -> Self {
        CellSchema::Number { default: None }
    }

    pub fn boolean() -> Self {
        CellSchema::Boolean { default: None }
    }

    pub fn string_with_default(default: impl Into<String>) -> Self {
        CellSchema::String {
            default: Some(default.into()),
        }
    }

    pub fn number_with_default(default: f64) -> Self {
        CellSchema::Number {
            default: Some(default),
        }
    }

    pub fn boolean_with_default(default: bool) -> Self {
        CellSchema::Boolean {
            default: Some(default),
        }
    }

    /// The declared type.
    pub fn cell_type(&self) -> CellType {
        match self {
            CellSchema::String { .. } => CellType::String,
            CellSchema::Number { .. } => CellType::Number,
            CellSchema::Boolean { .. } => CellType::Boolean,
        }
    }

    /// The declared default, as a cell.
    pub fn default_cell(&self) -> Option<Cell> {
        match self {
            CellSchema::String { default } => default.clone().map(Cell::String),
            CellSchema::Number { default } => default.map(Cell::Number),
            CellSchema::Boolean { default } => default.map(Cell::Boolean),
        }
    }

    /// Whether `cell` satisfies this schema.
    pub fn accepts(&self, cell: &Cell) -> bool {
        match (self, cell) {
            (CellSchema::String { .. }, Cell::String(_)) => true,
            (CellSchema::Number { .. }, Cell::Number(n)) => n.is_finite(),
            (CellSchema::Boolean { .. }, Cell::Boolean(_)) => true,
            _ => false,
        }
    }

    fn check(&self, id: &str) -> Result<()> {
        match self {
            CellSchema::Number { default: Some(n) } if !n.is_finite() => Err(
                Error::InvalidSchema(format!("default for '{id}' is not a finite number")),
            ),
            _ => Ok(()),
        }
    }
}

/// Check a tables schema, dropping tables that declare no cells.
pub(crate) fn check_tables_schema(schema: TablesSchema) -> Result<TablesSchema> {
    let mut checked = TablesSchema::new();
    for (table_id, table_schema) in schema {
        for (cell_id, cell_schema) in &table_schema {
            cell_schema.check(cell_id)?;
        }
        if !table_schema.is_empty() {
            checked.insert(table_id, table_schema);
        }
    }
    Ok(checked)
}

/// Check a values schema.
pub(crate) fn check_values_schema(schema: ValuesSchema) -> Result<ValuesSchema> {
    for (value_id, value_schema) in &schema {
        value_schema.check(value_id)?;
    }
    Ok(schema)
}

/// Every declared default for a table, as a row.
pub(crate) fn default_row(table_schema: &TableSchema) -> Row {
    table_schema
        .iter()
        .filter_map(|(cell_id, cell_schema)| {
            cell_schema
                .default_cell()
                .map(|cell| (cell_id.clone(), cell))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pets_schema() -> TablesSchema {
        let mut pets = TableSchema::new();
        pets.insert("species".into(), CellSchema::string());
        pets.insert("sold".into(), CellSchema::boolean_with_default(false));
        pets.insert("price".into(), CellSchema::number_with_default(5.0));
        let mut schema = TablesSchema::new();
        schema.insert("pets".into(), pets);
        schema
    }

    #[test]
    fn accepts_matching_types_only() {
        assert!(CellSchema::string().accepts(&Cell::from("dog")));
        assert!(!CellSchema::string().accepts(&Cell::from(1)));
        assert!(CellSchema::number().accepts(&Cell::from(1)));
        assert!(!CellSchema::number().accepts(&Cell::Number(f64::NAN)));
        assert!(CellSchema::boolean().accepts(&Cell::from(true)));
        assert!(!CellSchema::boolean().accepts(&Cell::from("true")));
    }

    #[test]
    fn default_cells() {
        assert_eq!(CellSchema::string().default_cell(), None);
        assert_eq!(
            CellSchema::number_with_default(5.0).default_cell(),
            Some(Cell::from(5))
        );
        let defaults = default_row(&pets_schema()["pets"]);
        assert_eq!(defaults.len(), 2);
        assert_eq!(defaults["sold"], Cell::from(false));
    }

    #[test]
    fn schema_json_format() {
        let json = serde_json::to_string(&pets_schema()).unwrap();
        assert_eq!(
            json,
            r#"{"pets":{"price":{"type":"number","default":5.0},"sold":{"type":"boolean","default":false},"species":{"type":"string"}}}"#
        );
        let parsed: TablesSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pets_schema());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = serde_json::from_str::<TablesSchema>(r#"{"t":{"c":{"type":"date"}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn check_drops_empty_tables() {
        let mut schema = pets_schema();
        schema.insert("empty".into(), TableSchema::new());
        let checked = check_tables_schema(schema).unwrap();
        assert!(checked.contains_key("pets"));
        assert!(!checked.contains_key("empty"));
    }

    #[test]
    fn check_rejects_non_finite_default() {
        let mut values = ValuesSchema::new();
        values.insert("ratio".into(), CellSchema::number_with_default(f64::NAN));
        let result = check_values_schema(values);
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }
}
