//! Descriptor flattening.
//!
//! Turns the device → sync → pdo → entry hierarchy into one linear list of
//! [`RuntimeEntry`] rows plus the list of [`StartupParameter`]s.
//!
//! Rules:
//! - device without channels → one presence placeholder
//! - mapping without objects → one placeholder carrying the mapping index
//! - every object → one entry
//!
//! Flattening is pure: the same descriptor always yields the same rows, and
//! a failing descriptor yields nothing.

use crate::config::ConfigError;
use crate::descriptor::{DeviceDescriptor, NumericField, ParameterDescriptor, SyncDescriptor};
use crate::entry::{Direction, RuntimeEntry, StartupParameter};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Output of [`flatten`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatConfig {
    /// Runtime entries in descriptor order (or sorted, if requested).
    pub entries: Vec<RuntimeEntry>,
    /// Startup parameters in descriptor order.
    pub parameters: Vec<StartupParameter>,
}

impl FlatConfig {
    /// Distinct device positions in first-seen order.
    pub fn positions(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.position))
            .map(|e| e.position)
            .collect()
    }

    /// Number of entries selected for the cyclic domain.
    pub fn cyclic_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_cyclic()).count()
    }
}

fn required<'a>(
    field: &'a Option<NumericField>,
    context: &dyn Fn() -> String,
    name: &'static str,
) -> Result<&'a NumericField, ConfigError> {
    field.as_ref().ok_or_else(|| ConfigError::MissingField {
        context: context(),
        field: name,
    })
}

/// Device identity shared by all of its rows.
#[derive(Clone, Copy)]
struct Identity {
    alias: u16,
    position: u16,
    vendor_id: u32,
    product_code: u32,
}

impl Identity {
    fn entry(&self) -> RuntimeEntry {
        RuntimeEntry::device_placeholder(self.alias, self.position, self.vendor_id, self.product_code)
    }
}

/// Flatten a parsed descriptor.
///
/// # Errors
/// - `MissingField` when a required member is absent
/// - `InvalidNumber` when a numeric member does not fit its type
/// - `InvalidDirection` for a direction other than "input"/"output"
/// - `DuplicateObject` when two data entries share (position, index, sub-index)
pub fn flatten(devices: &[DeviceDescriptor], sort: bool) -> Result<FlatConfig, ConfigError> {
    let mut flat = FlatConfig::default();

    for (dev_idx, device) in devices.iter().enumerate() {
        let ctx = || format!("device {dev_idx}");
        let identity = Identity {
            alias: required(&device.alias, &ctx, "alias")?.narrow("alias")?,
            position: required(&device.position, &ctx, "position")?.narrow("position")?,
            vendor_id: required(&device.vendor_id, &ctx, "vendor_id")?.narrow("vendor_id")?,
            product_code: required(&device.product_code, &ctx, "product_code")?
                .narrow("product_code")?,
        };

        match device.syncs.as_deref() {
            Some(syncs) if !syncs.is_empty() => {
                for (sync_idx, sync) in syncs.iter().enumerate() {
                    flatten_sync(&identity, dev_idx, sync_idx, sync, &mut flat.entries)?;
                }
            }
            _ => flat.entries.push(identity.entry()),
        }

        if let Some(parameters) = device.parameters.as_deref() {
            for (param_idx, param) in parameters.iter().enumerate() {
                flat.parameters
                    .push(flatten_parameter(identity.position, dev_idx, param_idx, param)?);
            }
        }
    }

    check_unique_objects(&flat.entries)?;

    if sort {
        sort_entries(&mut flat.entries);
    }

    debug!(
        "Flattened {} devices into {} entries ({} cyclic), {} startup parameters",
        devices.len(),
        flat.entries.len(),
        flat.cyclic_count(),
        flat.parameters.len()
    );

    Ok(flat)
}

fn flatten_sync(
    identity: &Identity,
    dev_idx: usize,
    sync_idx: usize,
    sync: &SyncDescriptor,
    out: &mut Vec<RuntimeEntry>,
) -> Result<(), ConfigError> {
    let ctx = || format!("device {dev_idx} / sync {sync_idx}");
    let sync_index: u8 = required(&sync.index, &ctx, "index")?.narrow("sync index")?;
    let pdos = sync.pdos.as_deref().ok_or_else(|| ConfigError::MissingField {
        context: ctx(),
        field: "pdos",
    })?;

    let direction = match sync.direction.as_deref() {
        Some(text) => Direction::parse(text)?,
        None => Direction::default_for_channel(sync_index),
    };
    let watchdog_enabled = sync.watchdog_enabled.unwrap_or(false);

    for (pdo_idx, pdo) in pdos.iter().enumerate() {
        let ctx = || format!("device {dev_idx} / sync {sync_idx} / pdo {pdo_idx}");
        let pdo_index: u16 = required(&pdo.index, &ctx, "index")?.narrow("pdo index")?;

        let base = RuntimeEntry {
            sync_index,
            pdo_index,
            direction,
            ..identity.entry()
        };

        let objects = match pdo.entries.as_deref() {
            Some(objects) if !objects.is_empty() => objects,
            _ => {
                out.push(base);
                continue;
            }
        };

        for (entry_idx, object) in objects.iter().enumerate() {
            let ctx = || format!("device {dev_idx} / sync {sync_idx} / pdo {pdo_idx} / entry {entry_idx}");
            out.push(RuntimeEntry {
                index: required(&object.index, &ctx, "index")?.narrow("entry index")?,
                subindex: required(&object.subindex, &ctx, "subindex")?.narrow("entry subindex")?,
                bit_len: required(&object.size, &ctx, "size")?.narrow("entry size")?,
                add_to_domain: object.add_to_domain.unwrap_or(false),
                swap_endian: object.swap_endian.unwrap_or(false),
                signed: object.signed.unwrap_or(false),
                watchdog_enabled,
                ..base.clone()
            });
        }
    }

    Ok(())
}

fn flatten_parameter(
    position: u16,
    dev_idx: usize,
    param_idx: usize,
    param: &ParameterDescriptor,
) -> Result<StartupParameter, ConfigError> {
    let ctx = || format!("device {dev_idx} / parameter {param_idx}");
    Ok(StartupParameter {
        position,
        index: required(&param.index, &ctx, "index")?.narrow("parameter index")?,
        subindex: required(&param.subindex, &ctx, "subindex")?.narrow("parameter subindex")?,
        bit_len: required(&param.size, &ctx, "size")?.narrow("parameter size")?,
        value: required(&param.value, &ctx, "value")?.narrow("parameter value")?,
    })
}

fn check_unique_objects(entries: &[RuntimeEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries.iter().filter(|e| e.carries_data()) {
        if !seen.insert((entry.position, entry.index, entry.subindex)) {
            return Err(ConfigError::DuplicateObject {
                position: entry.position,
                index: entry.index,
                subindex: entry.subindex,
            });
        }
    }
    Ok(())
}

/// Entry ordering: position, mapping index, object index, sub-index,
/// direction. A zero object index or sub-index on either side is a wildcard
/// and skips that field.
pub fn compare_entries(a: &RuntimeEntry, b: &RuntimeEntry) -> Ordering {
    fn wildcard<T: Ord + Default + Copy>(a: T, b: T) -> Ordering {
        if a == T::default() || b == T::default() {
            Ordering::Equal
        } else {
            a.cmp(&b)
        }
    }

    a.position
        .cmp(&b.position)
        .then(a.pdo_index.cmp(&b.pdo_index))
        .then(wildcard(a.index, b.index))
        .then(wildcard(a.subindex, b.subindex))
        .then(a.direction.cmp(&b.direction))
}

/// Stable in-place sort with [`compare_entries`].
///
/// The wildcard fields make the comparator non-transitive in corner cases,
/// which `slice::sort_by` does not tolerate; a straight insertion sort only
/// ever swaps strictly-greater neighbours and stays stable.
pub fn sort_entries(entries: &mut [RuntimeEntry]) {
    for i in 1..entries.len() {
        let mut j = i;
        while j > 0 && compare_entries(&entries[j - 1], &entries[j]) == Ordering::Greater {
            entries.swap(j - 1, j);
            j -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_devices_json;

    const TWO_DEVICES: &str = r#"[
        {"alias": 0, "position": 1, "vendor_id": "0x00000002", "product_code": "0x07d83052",
         "syncs": [
            {"index": 3, "pdos": [
                {"index": "0x1a00", "entries": [
                    {"index": "0x6000", "subindex": 1, "size": 1, "add_to_domain": true},
                    {"index": "0x6010", "subindex": 1, "size": 1, "add_to_domain": true}
                ]}
            ]}
         ],
         "parameters": [{"index": "0x8000", "subindex": 6, "size": 8, "value": 1}]},
        {"alias": 0, "position": 0, "vendor_id": 2, "product_code": "0x044c2c52"}
    ]"#;

    fn flat(text: &str, sort: bool) -> Result<FlatConfig, ConfigError> {
        flatten(&parse_devices_json(text).unwrap(), sort)
    }

    #[test]
    fn device_without_syncs_yields_one_placeholder() {
        let flat = flat(TWO_DEVICES, false).unwrap();
        assert_eq!(flat.entries.len(), 3);
        let placeholder = &flat.entries[2];
        assert_eq!(placeholder.position, 0);
        assert_eq!(placeholder.product_code, 0x044c2c52);
        assert!(placeholder.is_placeholder());
        assert!(!placeholder.carries_data());
        assert_eq!(placeholder.direction, Direction::Unassigned);
    }

    #[test]
    fn objects_inherit_channel_properties() {
        let flat = flat(TWO_DEVICES, false).unwrap();
        let first = &flat.entries[0];
        assert_eq!(first.position, 1);
        assert_eq!(first.sync_index, 3);
        assert_eq!(first.pdo_index, 0x1a00);
        assert_eq!(first.index, 0x6000);
        assert_eq!(first.bit_len, 1);
        assert_eq!(first.direction, Direction::Input);
        assert!(first.add_to_domain);
        assert!(!first.swap_endian);
        assert!(!first.signed);
        assert!(!first.watchdog_enabled);
    }

    #[test]
    fn parameters_are_collected_per_device() {
        let flat = flat(TWO_DEVICES, false).unwrap();
        assert_eq!(
            flat.parameters,
            vec![StartupParameter {
                position: 1,
                index: 0x8000,
                subindex: 6,
                bit_len: 8,
                value: 1,
            }]
        );
    }

    #[test]
    fn empty_mapping_yields_mapping_placeholder() {
        let flat = flat(
            r#"[{"alias":0,"position":0,"vendor_id":1,"product_code":1,
                "syncs":[{"index":2,"pdos":[{"index":"0x1600"}]}]}]"#,
            false,
        )
        .unwrap();
        assert_eq!(flat.entries.len(), 1);
        assert_eq!(flat.entries[0].pdo_index, 0x1600);
        assert_eq!(flat.entries[0].index, 0);
        assert_eq!(flat.entries[0].direction, Direction::Output);
    }

    #[test]
    fn explicit_direction_overrides_default() {
        let flat = flat(
            r#"[{"alias":0,"position":0,"vendor_id":1,"product_code":1,
                "syncs":[{"index":2,"direction":"input","watchdog_enabled":true,
                          "pdos":[{"index":"0x1a00","entries":[{"index":"0x6000","subindex":1,"size":8}]}]}]}]"#,
            false,
        )
        .unwrap();
        assert_eq!(flat.entries[0].direction, Direction::Input);
        assert!(flat.entries[0].watchdog_enabled);
    }

    #[test]
    fn invalid_direction_aborts() {
        let result = flat(
            r#"[{"alias":0,"position":0,"vendor_id":1,"product_code":1,
                "syncs":[{"index":0,"direction":"both","pdos":[]}]}]"#,
            false,
        );
        assert_eq!(result, Err(ConfigError::InvalidDirection("both".to_string())));
    }

    #[test]
    fn missing_required_field_names_context() {
        let result = flat(r#"[{"alias":0,"vendor_id":1,"product_code":1}]"#, false);
        assert_eq!(
            result,
            Err(ConfigError::MissingField {
                context: "device 0".to_string(),
                field: "position",
            })
        );

        let result = flat(
            r#"[{"alias":0,"position":0,"vendor_id":1,"product_code":1,"syncs":[{"index":0}]}]"#,
            false,
        );
        assert!(matches!(result, Err(ConfigError::MissingField { field: "pdos", .. })));
    }

    #[test]
    fn duplicate_object_rejected() {
        let result = flat(
            r#"[{"alias":0,"position":0,"vendor_id":1,"product_code":1,
                "syncs":[{"index":2,"pdos":[
                    {"index":"0x1600","entries":[{"index":"0x7000","subindex":1,"size":8}]},
                    {"index":"0x1601","entries":[{"index":"0x7000","subindex":1,"size":8}]}]}]}]"#,
            false,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateObject { index: 0x7000, .. })));
    }

    #[test]
    fn flattening_is_idempotent() {
        let devices = parse_devices_json(TWO_DEVICES).unwrap();
        assert_eq!(flatten(&devices, false).unwrap(), flatten(&devices, false).unwrap());
    }

    #[test]
    fn sort_orders_by_position_first() {
        let flat = flat(TWO_DEVICES, true).unwrap();
        let positions: Vec<u16> = flat.entries.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 1, 1]);
        assert_eq!(flat.entries[1].index, 0x6000);
        assert_eq!(flat.entries[2].index, 0x6010);
    }

    #[test]
    fn sort_is_idempotent_and_stable() {
        let mut entries = flat(TWO_DEVICES, false).unwrap().entries;
        // Same key as entries[0] apart from an irrelevant flag.
        let mut twin = entries[0].clone();
        twin.subindex = 0;
        twin.signed = true;
        entries.push(twin);

        sort_entries(&mut entries);
        let once = entries.clone();
        sort_entries(&mut entries);
        assert_eq!(once, entries);

        // The wildcard twin compares equal to 0x6000:1 and keeps its place after it.
        let idx_first = entries.iter().position(|e| e.index == 0x6000 && !e.signed).unwrap();
        let idx_twin = entries.iter().position(|e| e.signed).unwrap();
        assert!(idx_first < idx_twin);
    }

    #[test]
    fn wildcard_index_compares_equal() {
        let a = RuntimeEntry { position: 0, pdo_index: 0x1600, index: 0, ..Default::default() };
        let b = RuntimeEntry { position: 0, pdo_index: 0x1600, index: 0x7000, ..Default::default() };
        assert_eq!(compare_entries(&a, &b), Ordering::Equal);
    }

    #[test]
    fn positions_in_first_seen_order() {
        let flat = flat(TWO_DEVICES, false).unwrap();
        assert_eq!(flat.positions(), vec![1, 0]);
        assert_eq!(flat.cyclic_count(), 2);
    }
}
