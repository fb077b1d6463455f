//! The view context assembled during `build-view`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use keel_core::{KeelError, KeelResult};
use serde::Serialize;
use serde_json::{Map, Value};

/// A function views can call, taking and returning JSON values.
pub type ViewFunction = Arc<dyn Fn(&[Value]) -> KeelResult<Value> + Send + Sync>;

/// Data and functions handed to the template engine.
#[derive(Clone, Default)]
pub struct ViewContext {
    data: Map<String, Value>,
    functions: HashMap<String, ViewFunction>,
}

impl ViewContext {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a data value, replacing any previous one.
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> KeelResult<()> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| {
            KeelError::internal_with_source(format!("view value {key} is not serializable"), e)
        })?;
        self.data.insert(key, value);
        Ok(())
    }

    /// A data value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// All data values.
    #[must_use]
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Registers a function, replacing one with the same name.
    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&[Value]) -> KeelResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    /// Whether a function is registered.
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Calls a registered function.
    pub fn call_function(&self, name: &str, args: &[Value]) -> KeelResult<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| KeelError::internal(format!("no view function named {name}")))?;
        function(args)
    }

    /// Registered function names, sorted.
    #[must_use]
    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ViewContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewContext")
            .field("data", &self.data)
            .field("functions", &self.function_names())
            .finish()
    }
}
