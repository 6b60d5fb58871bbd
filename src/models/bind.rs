//! Bind bases supplying values to SQL placeholders.
//!
//! A statement is executed against an ordered list of [`BindBase`]s. Named
//! binds (`:name`, `:{name}`) are looked up in order and the first base that
//! knows the name wins. Positional `?` placeholders consume the values of all
//! [`BindBase::Positional`] bases in order. Output binds (`INTO :name`) are
//! written to [`Holder`]s.

use crate::models::{Row, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Shared, writable value slot used for output binds.
#[derive(Debug, Clone, Default)]
pub struct Holder {
    value: Arc<Mutex<Value>>,
}

impl Holder {
    /// Create an empty holder (NULL).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a holder with an initial value.
    pub fn with_value(value: impl Into<Value>) -> Self {
        Self {
            value: Arc::new(Mutex::new(value.into())),
        }
    }

    /// Current value.
    pub fn get(&self) -> Value {
        self.value
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(Value::Null)
    }

    /// Replace the current value.
    pub fn set(&self, value: Value) {
        if let Ok(mut guard) = self.value.lock() {
            *guard = value;
        }
    }
}

/// Shared slot collecting one value per result row, for multi-row `INTO` binds.
#[derive(Debug, Clone, Default)]
pub struct ListHolder {
    values: Arc<Mutex<Vec<Value>>>,
}

impl ListHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values collected so far.
    pub fn values(&self) -> Vec<Value> {
        self.values
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut guard) = self.values.lock() {
            guard.clear();
        }
    }

    pub(crate) fn push(&self, value: Value) {
        if let Ok(mut guard) = self.values.lock() {
            guard.push(value);
        }
    }
}

/// An object supplying values to named or positional placeholders.
#[derive(Debug, Clone)]
pub enum BindBase {
    /// A single named value.
    Pair(String, Value),
    /// A map of named values. Dotted names (`a.b`) are plain keys.
    Map(BTreeMap<String, Value>),
    /// A named holder, usable as input and as `INTO` target.
    Holder(String, Holder),
    /// A named list holder, the `INTO` target for multi-row selects.
    List(String, ListHolder),
    /// Values for `?` placeholders.
    Positional(Vec<Value>),
}

impl BindBase {
    /// Convenience constructor for a named value.
    pub fn pair(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Pair(name.into(), value.into())
    }

    /// Convenience constructor for a named holder.
    pub fn holder(name: impl Into<String>, holder: &Holder) -> Self {
        Self::Holder(name.into(), holder.clone())
    }

    /// Convenience constructor for a named list holder.
    pub fn list(name: impl Into<String>, holder: &ListHolder) -> Self {
        Self::List(name.into(), holder.clone())
    }

    /// Look up an input value by name.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        match self {
            Self::Pair(n, v) if n == name => Some(v.clone()),
            Self::Map(map) => map.get(name).cloned(),
            Self::Holder(n, h) if n == name => Some(h.get()),
            _ => None,
        }
    }

    /// Look up an output target by name.
    pub fn output(&self, name: &str) -> Option<OutputTarget> {
        match self {
            Self::Holder(n, h) if n == name => Some(OutputTarget::Single(h.clone())),
            Self::List(n, h) if n == name => Some(OutputTarget::List(h.clone())),
            _ => None,
        }
    }
}

/// Resolved destination of an `INTO` bind.
#[derive(Debug, Clone)]
pub enum OutputTarget {
    Single(Holder),
    List(ListHolder),
}

impl OutputTarget {
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }
}

/// Find the first bind base that knows `name`.
pub fn lookup_input(bases: &[BindBase], name: &str) -> Option<Value> {
    bases.iter().find_map(|base| base.lookup(name))
}

/// Find the first bind base that accepts output for `name`.
pub fn lookup_output(bases: &[BindBase], name: &str) -> Option<OutputTarget> {
    bases.iter().find_map(|base| base.output(name))
}

/// All positional values, concatenated in bind-base order.
pub fn positional_values(bases: &[BindBase]) -> Vec<Value> {
    bases
        .iter()
        .filter_map(|base| match base {
            BindBase::Positional(values) => Some(values.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Write the values of `rows` into `targets`, column by column.
pub(crate) fn assign_outputs(targets: &[OutputTarget], rows: &[Row]) {
    for (col, target) in targets.iter().enumerate() {
        match target {
            OutputTarget::Single(holder) => {
                let value = rows
                    .first()
                    .and_then(|row| row.get(col).cloned())
                    .unwrap_or(Value::Null);
                holder.set(value);
            }
            OutputTarget::List(list) => {
                list.clear();
                for row in rows {
                    list.push(row.get(col).cloned().unwrap_or(Value::Null));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_base_wins() {
        let bases = vec![
            BindBase::pair("id", 1_i64),
            BindBase::Map(BTreeMap::from([("id".to_string(), Value::Int(2))])),
        ];
        assert_eq!(lookup_input(&bases, "id"), Some(Value::Int(1)));
        assert_eq!(lookup_input(&bases, "missing"), None);
    }

    #[test]
    fn test_empty_holders_start_null() {
        assert_eq!(Holder::default().get(), Value::Null);
        assert_eq!(Holder::new().get(), Value::Null);
        assert_eq!(Value::default(), Value::Null);
        assert!(ListHolder::default().values().is_empty());
    }

    #[test]
    fn test_holder_is_input_and_output() {
        let holder = Holder::with_value("x");
        let bases = vec![BindBase::holder("h", &holder)];
        assert_eq!(lookup_input(&bases, "h"), Some(Value::from("x")));
        assert!(lookup_output(&bases, "h").is_some());
        assert!(lookup_output(&bases, "other").is_none());
    }

    #[test]
    fn test_positional_values_concatenate() {
        let bases = vec![
            BindBase::Positional(vec![Value::Int(1)]),
            BindBase::pair("x", 0_i64),
            BindBase::Positional(vec![Value::Int(2), Value::Int(3)]),
        ];
        assert_eq!(
            positional_values(&bases),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn test_assign_outputs() {
        let single = Holder::new();
        let list = ListHolder::new();
        let targets = vec![
            OutputTarget::Single(single.clone()),
            OutputTarget::List(list.clone()),
        ];
        let rows = vec![
            vec![Value::Int(1), Value::from("a")],
            vec![Value::Int(2), Value::from("b")],
        ];
        assign_outputs(&targets, &rows);
        assert_eq!(single.get(), Value::Int(1));
        assert_eq!(list.values(), vec![Value::from("a"), Value::from("b")]);
    }
}
