//! ECAT Common Library
//!
//! Shared types for the ecat process-data master: the device descriptor
//! schema and its flattening into runtime entries, the process-image value
//! codec, bus state types, the driver interface and configuration loading.
//!
//! # Module Structure
//!
//! - [`descriptor`] - Device descriptor schema (JSON)
//! - [`flatten`] - Descriptor → runtime entry flattening and ordering
//! - [`entry`] - Runtime entries, directions, startup parameters
//! - [`codec`] - Typed decode/encode against the domain buffer
//! - [`state`] - Master, device and domain state snapshots
//! - [`driver`] - Fieldbus master driver trait and errors
//! - [`config`] - Master configuration (TOML) and loading traits
//! - [`consts`] - Runtime defaults and limits
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use ecat_common::prelude::*;
//!
//! let devices = parse_devices_json(r#"[{"alias":0,"position":0,"vendor_id":2,"product_code":"0x044c2c52"}]"#)?;
//! let flat = flatten(&devices, false)?;
//! assert_eq!(flat.entries.len(), 1);
//! # Ok::<(), ConfigError>(())
//! ```

pub mod codec;
pub mod config;
pub mod consts;
pub mod descriptor;
pub mod driver;
pub mod entry;
pub mod flatten;
pub mod prelude;
pub mod state;
