//! Driver registry for master drivers.
//!
//! Provides a `DriverRegistry` struct for registering and retrieving driver
//! factories. The registry is built at startup and handed to `EcatMaster`
//! by value; there is no global state.

use ecat_common::driver::{DriverFactory, MasterDriver};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No driver registered under this name.
    #[error("Driver not found: {0}")]
    DriverNotFound(String),

    /// A driver with the same name is already registered.
    #[error("Driver '{0}' is already registered")]
    Duplicate(&'static str),
}

/// Registry of available master drivers.
pub struct DriverRegistry {
    factories: HashMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding every built-in driver.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        if let Err(e) = crate::drivers::register_builtin(&mut registry) {
            warn!("Built-in driver registration incomplete: {e}");
        }
        registry
    }

    /// Register a driver factory.
    ///
    /// # Errors
    /// `RegistryError::Duplicate` if the name is taken.
    pub fn register(&mut self, name: &'static str, factory: DriverFactory) -> Result<(), RegistryError> {
        if self.factories.contains_key(name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Get a driver factory by name.
    pub fn get_factory(&self, name: &str) -> Option<DriverFactory> {
        self.factories.get(name).copied()
    }

    /// Create a driver instance by name.
    ///
    /// # Errors
    /// `RegistryError::DriverNotFound` if no driver with the given name is registered.
    pub fn create_driver(&self, name: &str) -> Result<Box<dyn MasterDriver>, RegistryError> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| RegistryError::DriverNotFound(name.to_string()))?;
        Ok(factory())
    }

    /// List all registered driver names.
    pub fn list_drivers(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
