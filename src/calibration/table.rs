//! Calibration-table codec.
//!
//! The device stores stereo coefficients as an opaque byte table: a 16-byte
//! header (version, type, size, CRC32 of the body) followed by the packed
//! parameter block, starting with the left then right 3x3 intrinsic
//! matrices as little-endian f32.

use crate::error::{CalibrationError, Result};

/// Size of the table header preceding the checksummed body.
pub const HEADER_SIZE: usize = 16;
/// Offset of the CRC32 field within the header.
const CRC_OFFSET: usize = 12;
/// Offset of the right-intrinsic x-scale pair: header + left 3x3 f32.
const RIGHT_INTRINSIC_X_OFFSET: usize = HEADER_SIZE + 9 * 4;

/// CRC32 over the table body (everything after the header).
pub fn body_crc32(table: &[u8]) -> u32 {
    crc32fast::hash(&table[HEADER_SIZE..])
}

fn read_f32(table: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        table[offset],
        table[offset + 1],
        table[offset + 2],
        table[offset + 3],
    ])
}

fn write_f32(table: &mut [u8], offset: usize, value: f32) {
    table[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Scale the right-camera intrinsic x-scale pair by `ratio` and rewrite
/// the body CRC32. The input is never mutated; output size equals input
/// size; the stored checksum is recomputed, never trusted.
pub fn patch_focal_length(table: &[u8], ratio: f32) -> Result<Vec<u8>> {
    if table.len() < RIGHT_INTRINSIC_X_OFFSET + 8 {
        return Err(CalibrationError::Device(format!(
            "calibration table too small ({} bytes)",
            table.len()
        )));
    }

    let mut patched = table.to_vec();
    let xx = read_f32(&patched, RIGHT_INTRINSIC_X_OFFSET);
    let xy = read_f32(&patched, RIGHT_INTRINSIC_X_OFFSET + 4);
    write_f32(&mut patched, RIGHT_INTRINSIC_X_OFFSET, xx * ratio);
    write_f32(&mut patched, RIGHT_INTRINSIC_X_OFFSET + 4, xy * ratio);

    let crc = body_crc32(&patched);
    patched[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Vec<u8> {
        let mut table = vec![0u8; 256];
        // Header: version 2, type 25, size, stale checksum.
        table[0] = 2;
        table[2] = 25;
        table[4..8].copy_from_slice(&(240u32).to_le_bytes());
        table[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        // Left and right intrinsics.
        for i in 0..9 {
            write_f32(&mut table, HEADER_SIZE + i * 4, 600.0 + i as f32);
            write_f32(&mut table, RIGHT_INTRINSIC_X_OFFSET + i * 4, 700.0 + i as f32);
        }
        table
    }

    #[test]
    fn identity_ratio_preserves_intrinsics_and_checksum() {
        let table = sample_table();
        let patched = patch_focal_length(&table, 1.0).unwrap();
        assert_eq!(patched.len(), table.len());
        // Body bytes unchanged.
        assert_eq!(&patched[HEADER_SIZE..], &table[HEADER_SIZE..]);
        // Checksum recomputed over the body, not carried over.
        let crc = u32::from_le_bytes(patched[CRC_OFFSET..CRC_OFFSET + 4].try_into().unwrap());
        assert_eq!(crc, body_crc32(&table));
        assert_ne!(crc, 0xDEAD_BEEF);
    }

    #[test]
    fn ratio_scales_only_the_x_pair() {
        let table = sample_table();
        let patched = patch_focal_length(&table, 1.01).unwrap();
        let xx = read_f32(&patched, RIGHT_INTRINSIC_X_OFFSET);
        let xy = read_f32(&patched, RIGHT_INTRINSIC_X_OFFSET + 4);
        assert!((xx - 700.0 * 1.01).abs() < 1e-3);
        assert!((xy - 701.0 * 1.01).abs() < 1e-3);
        // Third right-intrinsic element untouched.
        let xz = read_f32(&patched, RIGHT_INTRINSIC_X_OFFSET + 8);
        assert_eq!(xz, 702.0);
        // Left intrinsics untouched.
        assert_eq!(read_f32(&patched, HEADER_SIZE), 600.0);
    }

    #[test]
    fn patching_is_deterministic() {
        let table = sample_table();
        let a = patch_focal_length(&table, 1.005).unwrap();
        let b = patch_focal_length(&table, 1.005).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn short_table_is_rejected() {
        assert!(patch_focal_length(&[0u8; 32], 1.0).is_err());
    }
}
