//! Checksum algorithms for the four on-disk families.
//!
//! Every family treats its checksum field as a sentinel during computation:
//! zero for the MD families and IMSM, 0xFFFFFFFF for DDF.

use byteorder::{ByteOrder, LittleEndian};

/// v0.90: wrapping sum of host-order 32-bit words over the whole 4096-byte
/// block with `sb_csum` already zeroed by the caller.
pub fn sum_host_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks_exact(4) {
        sum = sum.wrapping_add(u32::from_ne_bytes(chunk.try_into().unwrap()));
    }
    sum
}

/// v1.x: 64-bit sum of little-endian 32-bit words (plus a trailing LE u16 if
/// the length is not a multiple of four), folded to 32 bits.
pub fn sum_le_folded(data: &[u8]) -> u32 {
    let mut sum = 0u64;
    let mut rest = data;
    while rest.len() >= 4 {
        sum += LittleEndian::read_u32(rest) as u64;
        rest = &rest[4..];
    }
    if rest.len() >= 2 {
        sum += LittleEndian::read_u16(rest) as u64;
    }
    ((sum & 0xffffffff) + (sum >> 32)) as u32
}

/// IMSM: wrapping sum of little-endian words over `mpb_size` bytes, minus
/// the stored checksum word (so the caller need not zero the field).
pub fn imsm_sum(data: &[u8], stored_csum: u32) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks_exact(4) {
        sum = sum.wrapping_add(LittleEndian::read_u32(chunk));
    }
    sum.wrapping_sub(stored_csum)
}

/// DDF: CRC32 of a section whose crc field the caller has preset to
/// 0xFFFFFFFF. Stored big-endian like every DDF integer.
pub fn ddf_crc(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Reshape backup record: `csum = (csum << 3) + byte` over the prefix that
/// ends at the checksum field.
pub fn backup_csum(data: &[u8]) -> u32 {
    let mut csum = 0u32;
    for &b in data {
        csum = (csum << 3).wrapping_add(b as u32);
    }
    csum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_word_sum_wraps() {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&u32::MAX.to_ne_bytes());
        buf[4..].copy_from_slice(&2u32.to_ne_bytes());
        assert_eq!(sum_host_words(&buf), 1);
    }

    #[test]
    fn le_folded_sum_handles_carry() {
        let mut buf = vec![0u8; 8];
        LittleEndian::write_u32(&mut buf[..4], 0xffffffff);
        LittleEndian::write_u32(&mut buf[4..], 0xffffffff);
        // sum = 0x1_fffffffe, folded = 0xfffffffe + 1
        assert_eq!(sum_le_folded(&buf), 0xffffffff);
    }

    #[test]
    fn le_folded_sum_odd_tail() {
        let mut buf = vec![0u8; 6];
        LittleEndian::write_u32(&mut buf[..4], 5);
        LittleEndian::write_u16(&mut buf[4..], 7);
        assert_eq!(sum_le_folded(&buf), 12);
    }

    #[test]
    fn imsm_sum_excludes_stored() {
        let mut buf = vec![0u8; 8];
        LittleEndian::write_u32(&mut buf[..4], 10);
        LittleEndian::write_u32(&mut buf[4..], 3); // pretend this is check_sum
        assert_eq!(imsm_sum(&buf, 3), 10);
    }

    #[test]
    fn backup_csum_is_order_sensitive() {
        assert_ne!(backup_csum(b"ab"), backup_csum(b"ba"));
        assert_eq!(backup_csum(b"a"), b'a' as u32);
        assert_eq!(backup_csum(b"ab"), ((b'a' as u32) << 3) + b'b' as u32);
    }
}
