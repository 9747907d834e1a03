//! Scalar cell and value types.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// Largest integer a JSON number can carry without losing precision.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// The scalar held in a cell or a value.
///
/// Cells never nest. Numbers must be finite to be stored; a non-finite
/// number is rejected like any other invalid write.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    String(String),
    Number(f64),
    Boolean(bool),
}

/// Values share the cell representation.
pub type Value = Cell;

/// The type tag of a [`Cell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    String,
    Number,
    Boolean,
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellType::String => write!(f, "string"),
            CellType::Number => write!(f, "number"),
            CellType::Boolean => write!(f, "boolean"),
        }
    }
}

impl Cell {
    /// The type tag of this cell.
    pub fn cell_type(&self) -> CellType {
        match self {
            Cell::String(_) => CellType::String,
            Cell::Number(_) => CellType::Number,
            Cell::Boolean(_) => CellType::Boolean,
        }
    }

    /// Whether the cell can be stored at all.
    pub fn is_storable(&self) -> bool {
        match self {
            Cell::Number(n) => n.is_finite(),
            Cell::String(_) | Cell::Boolean(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// The cell rendered as an id, as used when a cell names a row or slice.
    pub fn to_id(&self) -> String {
        match self {
            Cell::String(s) => s.clone(),
            other => other.to_json_string(),
        }
    }

    /// Total order used for sorting: booleans, then numbers, then strings.
    pub fn sort_cmp(&self, other: &Cell) -> Ordering {
        fn rank(cell: &Cell) -> u8 {
            match cell {
                Cell::Boolean(_) => 0,
                Cell::Number(_) => 1,
                Cell::String(_) => 2,
            }
        }
        match (self, other) {
            (Cell::Boolean(a), Cell::Boolean(b)) => a.cmp(b),
            (Cell::Number(a), Cell::Number(b)) => a.total_cmp(b),
            (Cell::String(a), Cell::String(b)) => a.cmp(b),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }

    /// Canonical JSON text of the cell.
    pub fn to_json_string(&self) -> String {
        serde_json::Value::from(self).to_string()
    }
}

impl From<&Cell> for serde_json::Value {
    fn from(cell: &Cell) -> Self {
        match cell {
            Cell::String(s) => serde_json::Value::String(s.clone()),
            Cell::Number(n) if is_integral(*n) => serde_json::Value::from(*n as i64),
            Cell::Number(n) => serde_json::Value::from(*n),
            Cell::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }
}

fn is_integral(n: f64) -> bool {
    n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::String(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_json_string()),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::String(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::String(s)
    }
}

impl From<&String> for Cell {
    fn from(s: &String) -> Self {
        Cell::String(s.clone())
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Cell::Number(n)
    }
}

impl From<f32> for Cell {
    fn from(n: f32) -> Self {
        Cell::Number(f64::from(n))
    }
}

impl From<i32> for Cell {
    fn from(n: i32) -> Self {
        Cell::Number(f64::from(n))
    }
}

impl From<u32> for Cell {
    fn from(n: u32) -> Self {
        Cell::Number(f64::from(n))
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Number(n as f64)
    }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Cell::Boolean(b)
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Cell::String(s) => serializer.serialize_str(s),
            Cell::Number(n) if is_integral(*n) => serializer.serialize_i64(*n as i64),
            Cell::Number(n) => serializer.serialize_f64(*n),
            Cell::Boolean(b) => serializer.serialize_bool(*b),
        }
    }
}

struct CellVisitor;

impl Visitor<'_> for CellVisitor {
    type Value = Cell;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a string, number or boolean")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Cell, E> {
        Ok(Cell::Boolean(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Cell, E> {
        Ok(Cell::Number(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Cell, E> {
        Ok(Cell::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Cell, E> {
        Ok(Cell::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Cell, E> {
        Ok(Cell::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Cell, E> {
        Ok(Cell::String(v))
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(CellVisitor)
    }
}

/// A cell write: either a literal, or a mapper from the current cell.
///
/// The mapper runs before the store takes any internal borrow, so it is free
/// to read the store.
pub enum CellWrite {
    Literal(Cell),
    Mapper(Box<dyn FnOnce(Option<&Cell>) -> Cell>),
}

/// Values are written the same way as cells.
pub type ValueWrite = CellWrite;

impl CellWrite {
    /// Write the result of `mapper` applied to the current cell.
    pub fn map(mapper: impl FnOnce(Option<&Cell>) -> Cell + 'static) -> Self {
        CellWrite::Mapper(Box::new(mapper))
    }

    pub(crate) fn resolve(self, current: Option<&Cell>) -> Cell {
        match self {
            CellWrite::Literal(cell) => cell,
            CellWrite::Mapper(mapper) => mapper(current),
        }
    }
}

impl fmt::Debug for CellWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellWrite::Literal(cell) => f.debug_tuple("Literal").field(cell).finish(),
            CellWrite::Mapper(_) => f.write_str("Mapper(..)"),
        }
    }
}

macro_rules! literal_write {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for CellWrite {
                fn from(value: $ty) -> Self {
                    CellWrite::Literal(Cell::from(value))
                }
            }
        )*
    };
}

literal_write!(&str, String, &String, f64, f32, i32, u32, i64, bool);

impl From<Cell> for CellWrite {
    fn from(cell: Cell) -> Self {
        CellWrite::Literal(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_types() {
        assert_eq!(Cell::from("a").cell_type(), CellType::String);
        assert_eq!(Cell::from(1).cell_type(), CellType::Number);
        assert_eq!(Cell::from(true).cell_type(), CellType::Boolean);
        assert_eq!(CellType::Number.to_string(), "number");
    }

    #[test]
    fn non_finite_numbers_are_not_storable() {
        assert!(Cell::from(1.5).is_storable());
        assert!(!Cell::Number(f64::NAN).is_storable());
        assert!(!Cell::Number(f64::INFINITY).is_storable());
    }

    #[test]
    fn integral_numbers_serialize_without_fraction() {
        assert_eq!(serde_json::to_string(&Cell::from(1)).unwrap(), "1");
        assert_eq!(serde_json::to_string(&Cell::from(1.5)).unwrap(), "1.5");
        assert_eq!(Cell::from(-3).to_json_string(), "-3");
        assert_eq!(Cell::from("x").to_json_string(), "\"x\"");
    }

    #[test]
    fn deserialize_scalars() {
        let cells: Vec<Cell> = serde_json::from_str(r#"["a", 2, 2.5, false]"#).unwrap();
        assert_eq!(
            cells,
            vec![
                Cell::from("a"),
                Cell::from(2),
                Cell::from(2.5),
                Cell::from(false)
            ]
        );
    }

    #[test]
    fn deserialize_rejects_nesting() {
        assert!(serde_json::from_str::<Cell>("[1]").is_err());
        assert!(serde_json::from_str::<Cell>(r#"{"a": 1}"#).is_err());
        assert!(serde_json::from_str::<Cell>("null").is_err());
    }

    #[test]
    fn sort_order() {
        let mut cells = vec![
            Cell::from("b"),
            Cell::from(2),
            Cell::from(true),
            Cell::from("a"),
            Cell::from(-1),
        ];
        cells.sort_by(Cell::sort_cmp);
        assert_eq!(
            cells,
            vec![
                Cell::from(true),
                Cell::from(-1),
                Cell::from(2),
                Cell::from("a"),
                Cell::from("b")
            ]
        );
    }

    #[test]
    fn to_id() {
        assert_eq!(Cell::from("r1").to_id(), "r1");
        assert_eq!(Cell::from(7).to_id(), "7");
        assert_eq!(Cell::from(false).to_id(), "false");
    }

    #[test]
    fn mapper_write_sees_current() {
        let write = CellWrite::map(|old| {
            Cell::from(old.and_then(Cell::as_number).unwrap_or(0.0) + 1.0)
        });
        assert_eq!(write.resolve(Some(&Cell::from(4))), Cell::from(5));
    }
}
