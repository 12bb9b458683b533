use crate::dex::error::DexError;

/// Maximum encoded length of a 32-bit LEB128 value.
pub const MAX_LEB128_LEN: usize = 5;

pub(crate) fn encode_uleb128(value: u32) -> Vec<u8> {
    let mut result = Vec::new();
    let mut remaining = value;

    if remaining == 0 {
        result.push(0);
        return result;
    }

    while remaining != 0 {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;

        if remaining != 0 {
            byte |= 0x80;
        }

        result.push(byte);
    }

    result
}

pub(crate) fn encode_sleb128(value: i32) -> Vec<u8> {
    let mut result = Vec::new();
    let mut remaining = value;

    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;

        let is_more =
            !((remaining == 0 && (byte & 0x40) == 0) || (remaining == -1 && (byte & 0x40) != 0));
        if is_more {
            byte |= 0x80;
        }

        result.push(byte);

        if !is_more {
            break;
        }
    }

    result
}

pub(crate) fn encode_uleb128p1(value: i32) -> Vec<u8> {
    encode_uleb128(value.wrapping_add(1) as u32)
}

/// Decode an unsigned LEB128 value, failing if the input ends while a
/// continuation bit is still set.
pub fn decode_uleb128(encoded: &[u8]) -> Result<(u32, usize), DexError> {
    let mut value: u32 = 0;
    let mut shift: u32 = 0;

    for (count, &byte) in encoded.iter().enumerate() {
        let low = (byte & 0x7F) as u32;
        if shift < 32 {
            value |= low.wrapping_shl(shift);
        }

        // 32-bit values are at most five bytes; the fifth byte ends the value regardless
        if byte & 0x80 == 0 || count + 1 == MAX_LEB128_LEN {
            return Ok((value, count + 1));
        }
        shift += 7;
    }

    Err(err!(TruncatedLeb128, "uleb128 runs past end of data ({} bytes)", encoded.len()))
}

pub fn decode_sleb128(encoded: &[u8]) -> Result<(i32, usize), DexError> {
    let mut value: i32 = 0;
    let mut shift: u32 = 0;

    for (count, &byte) in encoded.iter().enumerate() {
        let low = (byte & 0x7F) as i32;
        if shift < 32 {
            value |= low.wrapping_shl(shift);
        }
        shift += 7;

        if byte & 0x80 == 0 || count + 1 == MAX_LEB128_LEN {
            // sign-extend when the value did not fill all 32 bits
            if (byte & 0x40) != 0 && shift < 32 {
                value |= (-1i32).wrapping_shl(shift);
            }
            return Ok((value, count + 1));
        }
    }

    Err(err!(TruncatedLeb128, "sleb128 runs past end of data ({} bytes)", encoded.len()))
}

/// ULEB128p1: the stored value is biased by one, so the all-zero encoding
/// represents -1 ("no index").
pub fn decode_uleb128p1(encoded: &[u8]) -> Result<(i32, usize), DexError> {
    let (v, c) = decode_uleb128(encoded)?;
    Ok(((v as i32).wrapping_sub(1), c))
}

/// As `decode_uleb128p1`, mapping the absent value to `None`.
pub fn decode_uleb128p1_opt(encoded: &[u8]) -> Result<(Option<u32>, usize), DexError> {
    let (v, c) = decode_uleb128p1(encoded)?;
    Ok((if v == -1 { None } else { Some(v as u32) }, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::DexErrorKind;

    #[test]
    fn test_encode_uleb128() {
        let cases = vec![
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16256, vec![0x80, 0x7F]),
            (624485, vec![0xE5, 0x8E, 0x26]),
        ];

        for (value, expected) in cases {
            assert_eq!(encode_uleb128(value), expected);
        }
    }

    #[test]
    fn test_decode_uleb128() {
        let cases = vec![
            (vec![0x00], 0),
            (vec![0x01], 1),
            (vec![0x7F], 127),
            (vec![0x80, 0x01], 128),
            (vec![0x80, 0x7F], 16256),
            (vec![0xE5, 0x8E, 0x26], 624485),
            (vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F], u32::MAX),
        ];

        for (encoded, expected) in cases {
            let (v, used) = decode_uleb128(&encoded).unwrap();
            assert_eq!(v, expected);
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn test_decode_sleb128() {
        let cases = vec![
            (vec![0x00], 0),
            (vec![0x01], 1),
            (vec![0x7F], -1),
            (vec![0xFF, 0x00], 127),
            (vec![0x80, 0x7F], -128),
            (vec![0xC0, 0xBB, 0x78], -123456),
        ];

        for (encoded, expected) in cases {
            let (v, _) = decode_sleb128(&encoded).unwrap();
            assert_eq!(v, expected);
        }
        assert_eq!(encode_sleb128(-123456), vec![0xC0, 0xBB, 0x78]);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let e = decode_uleb128(&[0x80, 0x80]).unwrap_err();
        assert_eq!(e.kind(), DexErrorKind::TruncatedLeb128);
        assert_eq!(decode_sleb128(&[]).unwrap_err().kind(), DexErrorKind::TruncatedLeb128);
    }

    #[test]
    fn p1_minus_one_decodes_to_none() {
        let encoded = encode_uleb128p1(-1);
        assert_eq!(encoded, vec![0x00]);
        assert_eq!(decode_uleb128p1_opt(&encoded).unwrap(), (None, 1));
        assert_eq!(decode_uleb128p1_opt(&encode_uleb128p1(41)).unwrap(), (Some(41), 1));
    }
}
