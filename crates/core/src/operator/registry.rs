//! Registry for operator types

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::operator::Operator;

/// Factory for creating operator instances
pub type OperatorFactory = Box<dyn Fn() -> Box<dyn Operator> + Send + Sync>;

/// Registry mapping operator type names to factories.
///
/// Graph-context construction resolves every node's operator type through
/// a registry; unknown types fail with a graph structure error before any
/// tile computation begins.
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry pre-populated with the built-in operators
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::operator::builtin::register_builtins(&mut registry);
        registry
    }

    /// Registers an operator type
    pub fn register<F>(&mut self, op_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn Operator> + Send + Sync + 'static,
    {
        self.factories.insert(op_type.to_string(), Box::new(factory));
    }

    /// Creates an operator instance
    pub fn create(&self, op_type: &str) -> Result<Box<dyn Operator>> {
        self.factories
            .get(op_type)
            .map(|factory| factory())
            .ok_or_else(|| Error::Graph(format!("unknown operator type: {op_type}")))
    }

    /// Returns true if an operator type is registered
    pub fn contains(&self, op_type: &str) -> bool {
        self.factories.contains_key(op_type)
    }

    /// All registered operator type names
    pub fn operator_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
