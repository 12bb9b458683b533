//! The DEX container format: decoding, structural verification and a minimal writer.

#[macro_use]
pub mod error;

pub mod leb;
pub mod header;
pub mod dex_file;
pub mod class_data;
pub mod code_item;
pub mod catch_table;
pub mod debug_info;
pub mod verifier;
pub mod container;
pub mod builder;

pub use crate::dex::container::{DexContainer, LoadOptions};
pub use crate::dex::dex_file::DexFile;
pub use crate::dex::error::{DexError, DexErrorKind};

use crate::dex::leb::{decode_sleb128, decode_uleb128, decode_uleb128p1, encode_sleb128, encode_uleb128, encode_uleb128p1};

/// Sentinel for an absent 16-bit index.
pub const NO_INDEX16: u16 = 0xffff;
/// Sentinel for an absent 32-bit index.
pub const NO_INDEX: u32 = 0xffff_ffff;

// Basic type reading and writing
pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError>
{
    let Some(&result) = bytes.get(*ix) else {
        fail!(BadOffset, "Unexpected end of stream reading u1 at index {}", *ix);
    };
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError>
{
    let Some(b) = ix.checked_add(2).and_then(|end| bytes.get(*ix..end)) else {
        fail!(BadOffset, "Unexpected end of stream reading u2 at index {}", *ix);
    };
    *ix += 2;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    let Some(b) = ix.checked_add(4).and_then(|end| bytes.get(*ix..end)) else {
        fail!(BadOffset, "Unexpected end of stream reading u4 at index {}", *ix);
    };
    *ix += 4;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    let Some(rest) = bytes.get(*ix..) else {
        fail!(TruncatedLeb128, "uleb128 starts past end of data at index {}", *ix);
    };
    let (val, size) = decode_uleb128(rest)?;
    *ix += size;
    Ok(val)
}

pub(crate) fn read_sleb128(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError>
{
    let Some(rest) = bytes.get(*ix..) else {
        fail!(TruncatedLeb128, "sleb128 starts past end of data at index {}", *ix);
    };
    let (val, size) = decode_sleb128(rest)?;
    *ix += size;
    Ok(val)
}

pub(crate) fn read_uleb128p1(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError>
{
    let Some(rest) = bytes.get(*ix..) else {
        fail!(TruncatedLeb128, "uleb128p1 starts past end of data at index {}", *ix);
    };
    let (val, size) = decode_uleb128p1(rest)?;
    *ix += size;
    Ok(val)
}

/// Borrow `length` bytes starting at `*ix`.
pub(crate) fn read_x<'a>(bytes: &'a [u8], ix: &mut usize, length: usize) -> Result<&'a [u8], DexError>
{
    match ix.checked_add(length).and_then(|end| bytes.get(*ix..end)) {
        Some(s) => {
            *ix += length;
            Ok(s)
        }
        None => Err(err!(BadOffset, "buffer too short for {} byte read at index {}", length, *ix)),
    }
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize
{
    buffer.push(val);
    1
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    4
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize
{
    let encoded = encode_uleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub(crate) fn write_sleb128(buffer: &mut Vec<u8>, val: i32) -> usize
{
    let encoded = encode_sleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub(crate) fn write_uleb128p1(buffer: &mut Vec<u8>, val: i32) -> usize
{
    let encoded = encode_uleb128p1(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize
{
    buffer.extend_from_slice(val);
    val.len()
}
