//! Master driver implementations.
//!
//! This module contains all built-in driver implementations:
//!
//! - [`simulation`] - Software simulation driver for development and testing
//!
//! # Adding New Drivers
//!
//! 1. Create a new submodule under `drivers/`
//! 2. Implement the `MasterDriver` trait from `ecat_common::driver`
//! 3. Register the driver in [`register_builtin`]

pub mod simulation;

use crate::driver_registry::{DriverRegistry, RegistryError};

/// Register all built-in drivers into `registry`.
pub fn register_builtin(registry: &mut DriverRegistry) -> Result<(), RegistryError> {
    registry.register("simulation", simulation::create_driver)?;
    Ok(())
}
