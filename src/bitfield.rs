//! Helpers around the [`crate::Bitfield`] packed bit array.
//!
//! The wire representation is most-significant-bit-first within each byte
//! (BitTorrent standard): the highest bit of the first byte is piece 0, and
//! so on. `bitvec`'s `Msb0` order already gives us this for free; what's left
//! is the handling of the padding bits at the tail of the last byte, which
//! the protocol requires receivers to ignore.

use crate::{Bitfield, PieceIndex};

/// Builds an empty (all-zero) bitfield sized to exactly `piece_count` bits.
pub fn empty(piece_count: usize) -> Bitfield {
    Bitfield::repeat(false, piece_count)
}

/// Parses a bitfield message payload into a [`Bitfield`] of exactly
/// `piece_count` bits, discarding any padding bits beyond that count.
///
/// The caller is responsible for rejecting payloads whose byte length
/// doesn't match `ceil(piece_count / 8)`; this function only trims bits.
pub fn from_wire_bytes(bytes: &[u8], piece_count: usize) -> Bitfield {
    let mut bitfield = Bitfield::from_slice(bytes);
    bitfield.resize(piece_count, false);
    bitfield
}

/// Serializes a bitfield into its packed wire representation, padding the
/// last byte with zero bits.
pub fn to_wire_bytes(bitfield: &Bitfield) -> Vec<u8> {
    bitfield.clone().into_vec()
}

/// Returns the expected byte length of a bitfield message payload for a
/// torrent with the given piece count.
pub fn wire_byte_len(piece_count: usize) -> usize {
    (piece_count + 7) / 8
}

/// Returns the indices of all clear (`false`) bits, in ascending order.
pub fn clear_positions(bitfield: &Bitfield) -> impl Iterator<Item = PieceIndex> + '_ {
    bitfield
        .iter()
        .enumerate()
        .filter(|(_, bit)| !**bit)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_pad_bits_are_ignored() {
        // piece_count=10, one byte 0b11111100: first six pieces present, last
        // two bits of that byte are padding and must not be read as pieces.
        let bitfield = from_wire_bytes(&[0b1111_1100, 0b0000_0000], 10);
        assert_eq!(bitfield.len(), 10);
        for i in 0..6 {
            assert!(bitfield[i], "piece {} should be present", i);
        }
        for i in 6..10 {
            assert!(!bitfield[i], "piece {} should be absent", i);
        }
    }

    #[test]
    fn wire_byte_len_rounds_up() {
        assert_eq!(wire_byte_len(8), 1);
        assert_eq!(wire_byte_len(9), 2);
        assert_eq!(wire_byte_len(16), 2);
    }

    #[test]
    fn clear_positions_enumerates_ascending() {
        let bitfield = from_wire_bytes(&[0b1010_0000], 4);
        let positions: Vec<_> = clear_positions(&bitfield).collect();
        assert_eq!(positions, vec![1, 3]);
    }
}
