//! Process-data domain builder and cyclic entry table.
//!
//! [`register_domain`] selects the entries exchanged every cycle, registers
//! them with the driver and receives their buffer offsets. The resulting
//! [`DomainTable`] is shared between the cyclic thread and caller threads:
//!
//! - configuration and offsets are plain fields, immutable after creation
//! - last-read value and pending write are atomics
//!
//! A [`CyclicEntry`] can only be created with its offset, so no code path
//! can observe an entry whose offset has not been assigned yet.

use crate::index::{EntryIndex, EntryKey};
use crate::sequencer::{BringUpError, BringUpStep, ConfiguredDevices};
use ecat_common::codec::{self, PdoEntryOffset, ValueFormat, span_bytes};
use ecat_common::driver::{MasterDriver, PdoEntryRegistration};
use ecat_common::entry::{Direction, RuntimeEntry};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Out-of-range addressing on the cyclic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EntryError {
    /// No session with a registered domain.
    #[error("No process-data domain registered")]
    NoDomain,

    /// Slot index past the end of the table.
    #[error("Slot {slot} out of range (table has {len} entries)")]
    SlotOutOfRange { slot: usize, len: usize },

    /// No cyclic entry with this address.
    #[error("No cyclic entry {position}:0x{index:04x}:{subindex:02x}")]
    UnknownKey { position: u16, index: u16, subindex: u8 },

    /// Writes are only accepted for output entries.
    #[error("Slot {slot} is an input entry")]
    NotOutput { slot: usize },
}

/// One entry of the cyclic table.
#[derive(Debug)]
pub struct CyclicEntry {
    entry: RuntimeEntry,
    offset: PdoEntryOffset,
    format: ValueFormat,
    value: AtomicI64,
    pending: AtomicI64,
}

impl CyclicEntry {
    fn new(entry: RuntimeEntry, offset: PdoEntryOffset) -> Self {
        Self {
            format: ValueFormat::from(&entry),
            entry,
            offset,
            value: AtomicI64::new(0),
            pending: AtomicI64::new(0),
        }
    }

    pub fn entry(&self) -> &RuntimeEntry {
        &self.entry
    }

    /// Driver-assigned location in the domain buffer.
    pub fn offset(&self) -> PdoEntryOffset {
        self.offset
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.entry.position, self.entry.index, self.entry.subindex)
    }

    /// Last value decoded from the buffer.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Value encoded into the buffer on the next operational cycle.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Relaxed)
    }

    fn snapshot(&self, slot: usize) -> EntrySnapshot {
        let e = &self.entry;
        EntrySnapshot {
            slot,
            alias: e.alias,
            position: e.position,
            vendor_id: e.vendor_id,
            product_code: e.product_code,
            sync_index: e.sync_index,
            pdo_index: e.pdo_index,
            index: e.index,
            subindex: e.subindex,
            bit_len: e.bit_len,
            byte_offset: self.offset.byte,
            bit_offset: self.offset.bit,
            direction: e.direction,
            swap_endian: e.swap_endian,
            signed: e.signed,
            watchdog_enabled: e.watchdog_enabled,
            value: self.value(),
            pending: self.pending(),
        }
    }
}

/// Copy of one cyclic entry, as returned by `snapshot_domain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub slot: usize,
    pub alias: u16,
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub sync_index: u8,
    pub pdo_index: u16,
    pub index: u16,
    pub subindex: u8,
    pub bit_len: u8,
    pub byte_offset: usize,
    pub bit_offset: u8,
    pub direction: Direction,
    pub swap_endian: bool,
    pub signed: bool,
    pub watchdog_enabled: bool,
    pub value: i64,
    pub pending: i64,
}

/// `(position, index, subindex, value)` tuple, as returned by `snapshot_values`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryValue {
    pub position: u16,
    pub index: u16,
    pub subindex: u8,
    pub value: i64,
}

/// The cyclic table plus its key index.
#[derive(Debug, Default)]
pub struct DomainTable {
    entries: Vec<CyclicEntry>,
    index: EntryIndex,
}

impl DomainTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&CyclicEntry> {
        self.entries.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CyclicEntry> {
        self.entries.iter()
    }

    /// Slot of `(position, index, subindex)`.
    pub fn slot_of(&self, position: u16, index: u16, subindex: u8) -> Result<usize, EntryError> {
        self.index
            .lookup(EntryKey::new(position, index, subindex))
            .ok_or(EntryError::UnknownKey { position, index, subindex })
    }

    /// Set the pending write of an output slot.
    pub fn write_slot(&self, slot: usize, value: i64) -> Result<(), EntryError> {
        let entry = self.entries.get(slot).ok_or(EntryError::SlotOutOfRange {
            slot,
            len: self.entries.len(),
        })?;
        if !entry.entry.direction.is_output() {
            return Err(EntryError::NotOutput { slot });
        }
        entry.pending.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Set the pending write of an output entry by address.
    pub fn write_key(&self, position: u16, index: u16, subindex: u8, value: i64) -> Result<usize, EntryError> {
        let slot = self.slot_of(position, index, subindex)?;
        self.write_slot(slot, value)?;
        Ok(slot)
    }

    /// Last decoded value of an entry by address.
    pub fn read_key(&self, position: u16, index: u16, subindex: u8) -> Result<i64, EntryError> {
        let slot = self.slot_of(position, index, subindex)?;
        Ok(self.entries[slot].value())
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries
            .iter()
            .enumerate()
            .map(|(slot, e)| e.snapshot(slot))
            .collect()
    }

    pub fn values(&self) -> Vec<EntryValue> {
        self.entries
            .iter()
            .map(|e| EntryValue {
                position: e.entry.position,
                index: e.entry.index,
                subindex: e.entry.subindex,
                value: e.value(),
            })
            .collect()
    }

    /// Encode every pending output into `data`, then decode every entry
    /// back. Returns the number of entries that failed to encode or decode.
    pub fn exchange(&self, data: &mut [u8]) -> usize {
        let mut failures = 0;
        for e in &self.entries {
            if e.entry.direction.is_output()
                && codec::encode(data, e.offset, e.format, e.pending()).is_err()
            {
                failures += 1;
            }
            match codec::decode(data, e.offset, e.format) {
                Ok(v) => e.value.store(v, Ordering::Relaxed),
                Err(_) => failures += 1,
            }
        }
        failures
    }

    /// Every entry must lie within the first `domain_size` bytes.
    pub fn check_bounds(&self, domain_size: usize) -> Result<(), BringUpError> {
        for e in &self.entries {
            if e.offset.byte + span_bytes(e.offset, e.format.bit_len) > domain_size {
                return Err(BringUpError::OffsetOutOfRange {
                    position: e.entry.position,
                    index: e.entry.index,
                    subindex: e.entry.subindex,
                    offset: e.offset,
                    domain_size,
                });
            }
        }
        Ok(())
    }
}

/// Build the cyclic table: filter entries flagged for the domain (a zero
/// object index is never exchanged), create the domain and register the
/// entries, then index the result.
///
/// # Errors
/// Domain creation or registration failure, or an offset count mismatch.
pub fn register_domain(
    driver: &mut dyn MasterDriver,
    devices: &ConfiguredDevices,
    entries: &[RuntimeEntry],
) -> Result<DomainTable, BringUpError> {
    let selected: Vec<&RuntimeEntry> = entries.iter().filter(|e| e.is_cyclic()).collect();

    driver
        .create_domain()
        .map_err(BringUpError::master(BringUpStep::CreateDomain))?;

    let registrations: Vec<PdoEntryRegistration> = selected
        .iter()
        .map(|e| PdoEntryRegistration {
            slave: devices
                .get(e.position)
                .map(|r| r.identity())
                .unwrap_or_default(),
            index: e.index,
            subindex: e.subindex,
        })
        .collect();

    let offsets = driver
        .register_pdo_entries(&registrations)
        .map_err(BringUpError::master(BringUpStep::RegisterEntries))?;
    if offsets.len() != selected.len() {
        return Err(BringUpError::OffsetCount {
            expected: selected.len(),
            actual: offsets.len(),
        });
    }

    let mut table = Vec::with_capacity(selected.len());
    for (entry, offset) in selected.into_iter().zip(offsets) {
        debug!(
            "Domain slot {}: {}:0x{:04x}:{:02x} at {}.{}",
            table.len(),
            entry.position,
            entry.index,
            entry.subindex,
            offset.byte,
            offset.bit
        );
        table.push(CyclicEntry::new(entry.clone(), offset));
    }

    let index = EntryIndex::build(table.iter().enumerate().map(|(slot, e)| (e.key(), slot)));
    info!("Registered {} cyclic entries", table.len());

    Ok(DomainTable { entries: table, index })
}

#[cfg(test)]
impl DomainTable {
    /// Table with explicit offsets, for exchange tests.
    pub(crate) fn from_parts(parts: Vec<(RuntimeEntry, PdoEntryOffset)>) -> Self {
        let entries: Vec<CyclicEntry> = parts
            .into_iter()
            .map(|(e, o)| CyclicEntry::new(e, o))
            .collect();
        let index = EntryIndex::build(entries.iter().enumerate().map(|(slot, e)| (e.key(), slot)));
        Self { entries, index }
    }
}
