//! A typed, read-only-during-a-run variable store exposed to tasks. Supplements the distilled
//! spec (§6.1's `add_variable`/`get_var`) from `macro_studio/core/data/variable_store.py` and
//! `type_handler.py`, whose registered value kinds this crate's [`VariableValue`] mirrors.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One of the value kinds the original's type handler registry supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    /// A floating point number.
    Number(f64),
    /// A boolean flag.
    Bool(bool),
    /// Free text.
    Text(String),
    /// A heterogeneous list.
    List(Vec<VariableValue>),
    /// A fixed-arity tuple.
    Tuple(Vec<VariableValue>),
    /// A 2-D screen point.
    Point {
        /// X coordinate.
        x: i32,
        /// Y coordinate.
        y: i32,
    },
    /// An axis-aligned rectangle.
    Rect {
        /// Left edge.
        x: i32,
        /// Top edge.
        y: i32,
        /// Width.
        w: i32,
        /// Height.
        h: i32,
    },
}

/// A registered variable: its current value and an optional UI hint string (e.g. the original's
/// `pick_hint`, shown to the user when capturing a value interactively).
#[derive(Debug, Clone)]
pub struct Variable {
    /// The variable's current value.
    pub value: VariableValue,
    /// An optional hint describing how the value was/should be captured.
    pub hint: Option<String>,
}

/// A name-keyed registry of [`Variable`]s. Mutated only by the embedder before/between runs;
/// tasks only ever see an `Arc<VariableStore>` clone and read through [`VariableStore::get`] —
/// matching spec §5's "variables exposed to tasks are read-only during a run".
#[derive(Default)]
pub struct VariableStore {
    vars: RwLock<HashMap<String, Variable>>,
}

impl VariableStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or overwrites) a variable with an optional default value and hint.
    pub fn add_variable(&self, key: impl Into<String>, default: VariableValue, hint: Option<String>) {
        self.vars.write().insert(key.into(), Variable { value: default, hint });
    }

    /// Reads a variable's current value, if registered.
    pub fn get(&self, key: &str) -> Option<VariableValue> {
        self.vars.read().get(key).map(|v| v.value.clone())
    }

    /// Overwrites a variable's current value. No-op if the key was never registered via
    /// [`VariableStore::add_variable`].
    pub fn set(&self, key: &str, value: VariableValue) -> bool {
        let mut vars = self.vars.write();
        if let Some(var) = vars.get_mut(key) {
            var.value = value;
            true
        } else {
            false
        }
    }

    /// The hint string registered for a variable, if any.
    pub fn hint(&self, key: &str) -> Option<String> {
        self.vars.read().get(key).and_then(|v| v.hint.clone())
    }

    /// All registered keys, in arbitrary order.
    pub fn keys(&self) -> Vec<String> {
        self.vars.read().keys().cloned().collect()
    }

    /// The number of registered variables.
    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    /// Whether the store has no registered variables.
    pub fn is_empty(&self) -> bool {
        self.vars.read().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_get_set() {
        let store = VariableStore::new();
        store.add_variable("speed", VariableValue::Number(1.0), Some("pixels/sec".into()));
        assert_eq!(store.get("speed"), Some(VariableValue::Number(1.0)));
        assert_eq!(store.hint("speed"), Some("pixels/sec".to_string()));
        assert!(store.set("speed", VariableValue::Number(2.5)));
        assert_eq!(store.get("speed"), Some(VariableValue::Number(2.5)));
    }

    #[test]
    fn test_set_unknown_key_is_noop() {
        let store = VariableStore::new();
        assert!(!store.set("missing", VariableValue::Bool(true)));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    #[cfg(feature = "json")]
    fn test_serde_roundtrip() {
        let point = VariableValue::Point { x: 10, y: 20 };
        let json = serde_json::to_string(&point).unwrap();
        let back: VariableValue = serde_json::from_str(&json).unwrap();
        assert_eq!(point, back);
    }
}
