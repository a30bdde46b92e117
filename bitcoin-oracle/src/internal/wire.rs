use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};

use crate::error::{OracleError, Result};
use crate::transaction::{OutPoint, ScriptKind, Txid};

/// Smallest possible encoded input: outpoint (36) + empty script length (1) + sequence (4).
const MIN_INPUT_BYTES: usize = 32 + 4 + 1 + 4;

/// Smallest possible encoded output: value (8) + empty script length (1).
const MIN_OUTPUT_BYTES: usize = 8 + 1;

/// Smallest possible witness item: its length prefix.
const MIN_WITNESS_ITEM_BYTES: usize = 1;

pub(crate) struct DecodedOutput {
    pub value_sats: u64,
    pub script: ScriptKind,
}

/// Fields of a consensus-serialized transaction that the pipeline keeps.
pub(crate) struct DecodedTransaction {
    pub txid: Txid,
    pub version: i32,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<DecodedOutput>,
    pub locktime: u32,
    /// Largest per-input witness stack in bytes, for segwit transactions.
    pub witness_size: Option<usize>,
}

/// Bounds-checked cursor over a byte slice. Reads borrow from the input
/// instead of copying into buffers sized by untrusted length prefixes.
struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(OracleError::malformed(format!(
                "truncated {what}: need {len} bytes, {} remaining",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u16(&mut self, what: &str) -> Result<u16> {
        let mut bytes = self.take(2, what)?;
        bytes
            .read_u16::<LittleEndian>()
            .map_err(|e| OracleError::malformed(format!("{what}: {e}")))
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let mut bytes = self.take(4, what)?;
        bytes
            .read_u32::<LittleEndian>()
            .map_err(|e| OracleError::malformed(format!("{what}: {e}")))
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        let mut bytes = self.take(4, what)?;
        bytes
            .read_i32::<LittleEndian>()
            .map_err(|e| OracleError::malformed(format!("{what}: {e}")))
    }

    fn read_u64(&mut self, what: &str) -> Result<u64> {
        let mut bytes = self.take(8, what)?;
        bytes
            .read_u64::<LittleEndian>()
            .map_err(|e| OracleError::malformed(format!("{what}: {e}")))
    }

    /// Reads a Bitcoin CompactSize integer, rejecting non-minimal encodings.
    fn read_compact_size(&mut self, what: &str) -> Result<u64> {
        let (value, minimum) = match self.read_u8(what)? {
            0xfd => (u64::from(self.read_u16(what)?), 0xfd),
            0xfe => (u64::from(self.read_u32(what)?), 0x1_0000),
            0xff => (self.read_u64(what)?, 0x1_0000_0000),
            n => return Ok(u64::from(n)),
        };
        if value < minimum {
            return Err(OracleError::malformed(format!("non-canonical {what} length")));
        }
        Ok(value)
    }

    /// Reads an element count and checks that `count` elements of at least
    /// `min_item_bytes` each fit in the remaining buffer.
    fn read_count(&mut self, what: &str, min_item_bytes: usize) -> Result<usize> {
        let declared = self.read_compact_size(what)?;
        let capacity = (self.remaining() / min_item_bytes) as u64;
        if declared > capacity {
            return Err(OracleError::malformed(format!(
                "declared {what} count {declared} cannot fit in {} remaining bytes",
                self.remaining()
            )));
        }
        Ok(declared as usize)
    }

    /// Reads a length-prefixed byte string without copying it.
    fn read_var_bytes(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.read_compact_size(what)?;
        if len > self.remaining() as u64 {
            return Err(OracleError::malformed(format!(
                "declared {what} length {len} exceeds {} remaining bytes",
                self.remaining()
            )));
        }
        self.take(len as usize, what)
    }
}

/// Decodes a consensus-serialized transaction.
pub(crate) fn decode_transaction(bytes: &[u8]) -> Result<DecodedTransaction> {
    let mut reader = WireReader::new(bytes);

    let version = reader.read_i32("version")?;

    // Segwit marker (0x00) followed by flag (0x01)
    let segwit = reader.peek(0) == Some(0x00);
    if segwit {
        reader.take(1, "segwit marker")?;
        let flag = reader.read_u8("segwit flag")?;
        if flag != 0x01 {
            return Err(OracleError::malformed(format!("invalid segwit flag {flag:#04x}")));
        }
    }

    let body_start = reader.pos;

    let input_count = reader.read_count("input", MIN_INPUT_BYTES)?;
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        let txid_bytes: [u8; 32] = reader
            .take(32, "previous txid")?
            .try_into()
            .map_err(|_| OracleError::malformed("previous txid"))?;
        let vout = reader.read_u32("previous output index")?;
        reader.read_var_bytes("script_sig")?;
        reader.read_u32("sequence")?;
        inputs.push(OutPoint::new(Txid::from_bytes(txid_bytes), vout));
    }

    let output_count = reader.read_count("output", MIN_OUTPUT_BYTES)?;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        let value_sats = reader.read_u64("output value")?;
        let script = reader.read_var_bytes("script_pubkey")?;
        outputs.push(DecodedOutput {
            value_sats,
            script: ScriptKind::classify(script),
        });
    }

    let body_end = reader.pos;

    let witness_size = if segwit {
        let mut largest = 0usize;
        for _ in 0..input_count {
            let stack_start = reader.pos;
            let items = reader.read_count("witness item", MIN_WITNESS_ITEM_BYTES)?;
            for _ in 0..items {
                reader.read_var_bytes("witness item")?;
            }
            largest = largest.max(reader.pos - stack_start);
        }
        Some(largest)
    } else {
        None
    };

    let locktime_bytes = reader.take(4, "locktime")?;
    let locktime = u32::from_le_bytes([
        locktime_bytes[0],
        locktime_bytes[1],
        locktime_bytes[2],
        locktime_bytes[3],
    ]);

    if reader.remaining() != 0 {
        return Err(OracleError::malformed(format!(
            "{} trailing bytes after locktime",
            reader.remaining()
        )));
    }

    // The txid commits to the serialization without marker, flag and witness
    let mut hasher = Sha256::new();
    hasher.update(&bytes[..4]);
    hasher.update(&bytes[body_start..body_end]);
    hasher.update(locktime_bytes);
    let first = hasher.finalize();
    let txid: [u8; 32] = Sha256::digest(first).into();

    Ok(DecodedTransaction {
        txid: Txid::from_bytes(txid),
        version,
        inputs,
        outputs,
        locktime,
        witness_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_prefix() -> Vec<u8> {
        2i32.to_le_bytes().to_vec()
    }

    #[test]
    fn test_compact_size_canonical() {
        let mut reader = WireReader::new(&[0xfd, 0x10, 0x00]);
        assert!(reader.read_compact_size("count").is_err());

        let mut reader = WireReader::new(&[0xfd, 0xfd, 0x00]);
        assert_eq!(reader.read_compact_size("count").unwrap(), 0xfd);

        let mut reader = WireReader::new(&[0xfc]);
        assert_eq!(reader.read_compact_size("count").unwrap(), 0xfc);
    }

    #[test]
    fn test_huge_input_count_rejected_before_allocation() {
        let mut bytes = legacy_prefix();
        // 0xff prefix declaring u64::MAX inputs
        bytes.push(0xff);
        bytes.extend(u64::MAX.to_le_bytes());
        bytes.extend([0u8; 16]);

        let err = decode_transaction(&bytes).err().unwrap();
        assert!(matches!(err, OracleError::MalformedInput(_)));
        assert!(err.to_string().contains("input count"));
    }

    #[test]
    fn test_output_count_checked_against_remaining() {
        let mut bytes = legacy_prefix();
        bytes.push(1);
        bytes.extend([0x42u8; 32]);
        bytes.extend(0u32.to_le_bytes());
        bytes.push(0);
        bytes.extend(u32::MAX.to_le_bytes());
        // 0xfe prefix declaring 1,000,000 outputs with 4 bytes left
        bytes.push(0xfe);
        bytes.extend(1_000_000u32.to_le_bytes());
        bytes.extend(0u32.to_le_bytes());

        let err = decode_transaction(&bytes).err().unwrap();
        assert!(err.to_string().contains("output count"));
    }

    #[test]
    fn test_script_length_checked_against_remaining() {
        let mut bytes = legacy_prefix();
        bytes.push(1);
        bytes.extend([0x42u8; 32]);
        bytes.extend(0u32.to_le_bytes());
        // scriptSig claims 0xffff bytes
        bytes.push(0xfd);
        bytes.extend(0xffffu16.to_le_bytes());
        bytes.extend([0u8; 40]);

        let err = decode_transaction(&bytes).err().unwrap();
        assert!(err.to_string().contains("script_sig"));
    }

    #[test]
    fn test_invalid_segwit_flag() {
        let mut bytes = legacy_prefix();
        bytes.extend([0x00, 0x02]);
        bytes.extend([0u8; 60]);
        assert!(decode_transaction(&bytes).is_err());
    }

    #[test]
    fn test_truncated_and_trailing_bytes() {
        assert!(decode_transaction(&[]).is_err());
        assert!(decode_transaction(&[1, 0, 0]).is_err());

        let mut bytes = legacy_prefix();
        bytes.push(1);
        bytes.extend([0x42u8; 32]);
        bytes.extend(0u32.to_le_bytes());
        bytes.push(0);
        bytes.extend(u32::MAX.to_le_bytes());
        bytes.push(1);
        bytes.extend(5_000u64.to_le_bytes());
        bytes.push(0);
        bytes.extend(0u32.to_le_bytes());

        let decoded = decode_transaction(&bytes).unwrap();
        assert_eq!(decoded.inputs.len(), 1);
        assert_eq!(decoded.outputs[0].value_sats, 5_000);

        bytes.push(0xaa);
        let err = decode_transaction(&bytes).err().unwrap();
        assert!(err.to_string().contains("trailing"));
    }
}
