//! Simulated process image: domain layout and output → input loopbacks.

use super::config::{EchoLink, ObjectAddress};
use ecat_common::codec::{self, PdoEntryOffset, ValueFormat};
use tracing::{debug, warn};

/// Lay out entries of the given bit widths: sub-byte entries are packed
/// bit by bit, byte-sized and wider entries start on a byte boundary.
/// Returns the offsets and the domain size in bytes.
pub fn pack(bit_lens: &[u8]) -> (Vec<PdoEntryOffset>, usize) {
    let mut cursor = 0usize;
    let mut offsets = Vec::with_capacity(bit_lens.len());
    for &bits in bit_lens {
        if bits >= 8 {
            cursor = cursor.div_ceil(8) * 8;
        }
        offsets.push(PdoEntryOffset {
            byte: cursor / 8,
            bit: (cursor % 8) as u8,
        });
        cursor += bits as usize;
    }
    (offsets, cursor.div_ceil(8))
}

/// A resolved loopback between two registered entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Loopback {
    from: PdoEntryOffset,
    from_bits: u8,
    to: PdoEntryOffset,
    to_bits: u8,
}

/// Loopbacks resolved against the registered domain entries.
#[derive(Debug, Default)]
pub struct EchoImage {
    links: Vec<Loopback>,
}

impl EchoImage {
    /// Resolve `links` against `(address, offset, bit_len)` registrations.
    /// Links naming an unregistered object are skipped with a warning.
    pub fn resolve(links: &[EchoLink], registered: &[(ObjectAddress, PdoEntryOffset, u8)]) -> Self {
        let find = |addr: ObjectAddress| registered.iter().find(|(a, _, _)| *a == addr);
        let mut resolved = Vec::with_capacity(links.len());
        for link in links {
            match (find(link.output), find(link.input)) {
                (Some(&(_, from, from_bits)), Some(&(_, to, to_bits))) => {
                    debug!("Echo {:?} → {:?}", link.output, link.input);
                    resolved.push(Loopback { from, from_bits, to, to_bits });
                }
                _ => warn!(
                    "Echo link {:?} → {:?} names an unregistered object, ignored",
                    link.output, link.input
                ),
            }
        }
        Self { links: resolved }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Copy every output into its linked input.
    pub fn apply(&self, data: &mut [u8]) {
        for link in &self.links {
            let from = ValueFormat { bit_len: link.from_bits, ..ValueFormat::default() };
            let to = ValueFormat { bit_len: link.to_bits, ..ValueFormat::default() };
            if let Ok(value) = codec::decode(data, link.from, from) {
                let _ = codec::encode(data, link.to, to, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_bits_then_align_bytes() {
        let (offsets, size) = pack(&[1, 1, 16, 1, 8, 32]);
        assert_eq!(
            offsets,
            vec![
                PdoEntryOffset { byte: 0, bit: 0 },
                PdoEntryOffset { byte: 0, bit: 1 },
                PdoEntryOffset { byte: 1, bit: 0 },
                PdoEntryOffset { byte: 3, bit: 0 },
                PdoEntryOffset { byte: 4, bit: 0 },
                PdoEntryOffset { byte: 5, bit: 0 },
            ]
        );
        assert_eq!(size, 9);
    }

    #[test]
    fn pack_empty() {
        assert_eq!(pack(&[]), (vec![], 0));
    }

    #[test]
    fn echo_copies_low_bytes() {
        let registered = [
            ((0, 0x7000, 1), PdoEntryOffset::at_byte(0), 16),
            ((0, 0x6000, 1), PdoEntryOffset::at_byte(2), 8),
        ];
        let echo = EchoImage::resolve(
            &[
                EchoLink { output: (0, 0x7000, 1), input: (0, 0x6000, 1) },
                EchoLink { output: (0, 0x7000, 2), input: (0, 0x6000, 1) },
            ],
            &registered,
        );
        assert_eq!(echo.len(), 1);
        let mut data = [0x34, 0x12, 0x00];
        echo.apply(&mut data);
        assert_eq!(data[2], 0x34);
    }
}
