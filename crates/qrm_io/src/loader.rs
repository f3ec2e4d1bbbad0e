//! Packed `.b8` measurement outcome files.
//!
//! Each record is one decoded outcome vector, one bit per interface qubit,
//! least significant bit first, padded with zeros to a whole byte. Records
//! are concatenated with no header, so a reader must know the record width.

use anyhow::{Context, Result, bail, ensure};
use bitvec::prelude::*;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Packs one outcome vector into bytes. Any nonzero outcome is a 1 bit.
pub fn pack_outcomes(record: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; record.len().div_ceil(8)];
    let bits = bytes.view_bits_mut::<Lsb0>();
    for (i, &outcome) in record.iter().enumerate() {
        bits.set(i, outcome != 0);
    }
    bytes
}

/// Writes `records` to a `.b8` file, replacing any existing file.
///
/// Every record must have the same width, since the file carries no
/// framing to tell records apart. Mixed widths are rejected before the file
/// is created.
pub fn write_b8_file<P: AsRef<Path>>(path: P, records: &[Vec<u8>]) -> Result<()> {
    let path = path.as_ref();
    if let Some(first) = records.first() {
        if let Some((index, odd)) = records
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != first.len())
        {
            bail!(
                "record {index} has {} outcomes, expected {} like record 0",
                odd.len(),
                first.len()
            );
        }
    }
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create .b8 file {}", path.display()))?;
    for record in records {
        file.write_all(&pack_outcomes(record))?;
    }
    file.flush()?;
    Ok(())
}

/// Loads a `.b8` file as a flat bit vector.
pub fn load_b8_file<P: AsRef<Path>>(path: P) -> Result<BitVec<u8, Lsb0>> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("Failed to open .b8 file {}", path.display()))?;
    let mut buffer = Vec::with_capacity(fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0));
    file.read_to_end(&mut buffer)?;
    Ok(BitVec::<u8, Lsb0>::from_vec(buffer))
}

/// Splits a loaded file back into records of `bits_per_record` outcomes.
///
/// # Arguments
///
/// * `raw_bits` - Contents of a `.b8` file
/// * `bits_per_record` - Width each record was written with
///
/// # Returns
///
/// One vector of 0/1 outcomes per record, or an error if the file length is
/// not a whole number of records.
pub fn slice_outcomes(raw_bits: &BitSlice<u8, Lsb0>, bits_per_record: usize) -> Result<Vec<Vec<u8>>> {
    ensure!(bits_per_record > 0, "record width must be positive");
    let stride_bits = bits_per_record.div_ceil(8) * 8;
    ensure!(
        raw_bits.len() % stride_bits == 0,
        "{} bits is not a whole number of {}-bit records",
        raw_bits.len(),
        stride_bits
    );

    Ok(raw_bits
        .chunks_exact(stride_bits)
        .map(|chunk| {
            chunk[..bits_per_record]
                .iter()
                .map(|bit| u8::from(*bit))
                .collect()
        })
        .collect())
}
