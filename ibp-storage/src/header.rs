//! On-device allocation header
//!
//! The first `ALLOC_HEADER` bytes of every object hold the serialized record:
//! a 4 byte magic, a little-endian u32 length, the bincode body, then zero
//! padding. Payload bytes start at `ALLOC_HEADER`.

use crate::device::ObjectDevice;
use ibp_core::{AllocationId, AllocationRecord, IbpError, Result, ALLOC_HEADER};

const MAGIC: &[u8; 4] = b"IBPA";
const PREFIX: usize = 8;

/// Serialize a record into a full header block
pub fn encode(record: &AllocationRecord) -> Result<Vec<u8>> {
    let body = bincode::serialize(record)?;
    if PREFIX + body.len() > ALLOC_HEADER as usize {
        return Err(IbpError::Serialization(format!(
            "record for {} needs {} header bytes",
            record.id,
            PREFIX + body.len()
        )));
    }

    let mut block = vec![0u8; ALLOC_HEADER as usize];
    block[..4].copy_from_slice(MAGIC);
    block[4..PREFIX].copy_from_slice(&(body.len() as u32).to_le_bytes());
    block[PREFIX..PREFIX + body.len()].copy_from_slice(&body);
    Ok(block)
}

/// Decode a header block
///
/// An empty or all-zero block means the object carries no record yet.
pub fn decode(id: AllocationId, block: &[u8]) -> Result<Option<AllocationRecord>> {
    if block.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    if block.len() < ALLOC_HEADER as usize {
        return Err(corrupt(id, format!("short header of {} bytes", block.len())));
    }
    if &block[..4] != MAGIC {
        return Err(corrupt(id, "bad header magic".to_string()));
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&block[4..PREFIX]);
    let len = u32::from_le_bytes(len) as usize;
    if PREFIX + len > block.len() {
        return Err(corrupt(id, format!("header length {} out of range", len)));
    }

    let record: AllocationRecord = bincode::deserialize(&block[PREFIX..PREFIX + len])
        .map_err(|e| corrupt(id, e.to_string()))?;
    Ok(Some(record))
}

/// Write the header of `record` to its object
pub fn write_header(dev: &dyn ObjectDevice, record: &AllocationRecord) -> Result<()> {
    dev.write(record.id, 0, &encode(record)?)
}

/// Read and decode the header of object `id`
pub fn read_header(dev: &dyn ObjectDevice, id: AllocationId) -> Result<Option<AllocationRecord>> {
    let block = dev.read(id, 0, ALLOC_HEADER)?;
    decode(id, &block)
}

fn corrupt(id: AllocationId, reason: String) -> IbpError {
    IbpError::CorruptRecord { id, reason }
}
