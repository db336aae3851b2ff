//! Key encoding and decoding utilities
//!
//! Ledger rows live in the `block_status` column family keyed by block
//! number. Keys are a single-byte prefix followed by the big-endian number,
//! so RocksDB iteration order equals numeric block order. The status index
//! uses the status code as prefix instead, which groups each status into one
//! contiguous, block-ordered key range.

use crate::records::BlockStatus;
use alloy_primitives::Address;
use anyhow::Result;

/// Encode a block-status key.
///
/// Format: byte 'S' (0x53) + block_number (8 bytes, big-endian)
/// Total length: 9 bytes
pub fn encode_block_status_key(block: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'S');
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Decode a block-status key back into its block number.
pub fn decode_block_status_key(key: &[u8]) -> Result<u64> {
    if key.len() != 9 || key[0] != b'S' {
        anyhow::bail!("Invalid block status key: {}", hex::encode(key));
    }
    Ok(be_u64(&key[1..9]))
}

/// Prefix byte shared by every index key of `status`.
pub fn status_prefix(status: BlockStatus) -> u8 {
    // Codes are 0..=3.
    status.code() as u8
}

/// Encode a status-index key.
///
/// Format: status code (1 byte) + block_number (8 bytes, big-endian)
pub fn encode_status_index_key(status: BlockStatus, block: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(status_prefix(status));
    key.extend_from_slice(&block.to_be_bytes());
    key
}

pub fn decode_status_index_key(key: &[u8]) -> Result<(BlockStatus, u64)> {
    if key.len() != 9 {
        anyhow::bail!("Invalid status index key: {}", hex::encode(key));
    }
    let status = BlockStatus::from_code(i32::from(key[0]))?;
    Ok((status, be_u64(&key[1..9])))
}

/// Encode a finished-player key: byte 'P' (0x50) + 20-byte address.
pub fn encode_player_key(player: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'P');
    key.extend_from_slice(player.as_slice());
    key
}

pub fn decode_player_key(key: &[u8]) -> Result<Address> {
    if key.len() != 21 || key[0] != b'P' {
        anyhow::bail!("Invalid player key: {}", hex::encode(key));
    }
    Ok(Address::from_slice(&key[1..]))
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut number = [0u8; 8];
    number.copy_from_slice(bytes);
    u64::from_be_bytes(number)
}
