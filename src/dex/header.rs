/* Dex header, including the v41 container extension */

use nom::bytes::complete::take;
use nom::number::complete::le_u32;
use nom::IResult;

use crate::dex::error::DexError;
use crate::dex::{write_u4, write_x};

pub const DEX_MAGIC_PREFIX: [u8; 4] = [0x64, 0x65, 0x78, 0x0a];
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const REVERSE_ENDIAN_CONSTANT: u32 = 0x78563412;

pub const SUPPORTED_VERSIONS: [u32; 6] = [35, 37, 38, 39, 40, 41];
/// First version whose header carries `container_size` and `header_offset`.
pub const CONTAINER_VERSION: u32 = 41;

pub const HEADER_SIZE: u32 = 0x70;
pub const HEADER_SIZE_V41: u32 = 0x78;

/// Offset of the checksum field; the adler32 covers everything after it.
pub const CHECKSUM_OFFSET: usize = 8;
/// Offset of the signature field; the SHA-1 covers everything after it.
pub const SIGNATURE_OFFSET: usize = 12;
pub const SIGNATURE_END: usize = 32;

/// Build the 8-byte magic for a version number (`dex\n035\0`).
pub fn magic_for_version(version: u32) -> [u8; 8]
{
    let digits = format!("{:03}", version % 1000);
    let d = digits.as_bytes();
    [0x64, 0x65, 0x78, 0x0a, d[0], d[1], d[2], 0x00]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
    /// v41+: total size of every dex file sharing the container.
    pub container_size: u32,
    /// v41+: offset of this header within the container.
    pub header_offset: u32,
}

fn parse_v35_fields(input: &[u8]) -> IResult<&[u8], Header>
{
    let (i, magic) = take(8usize)(input)?;
    let (i, checksum) = le_u32(i)?;
    let (i, signature) = take(20usize)(i)?;
    let (i, file_size) = le_u32(i)?;
    let (i, header_size) = le_u32(i)?;
    let (i, endian_tag) = le_u32(i)?;
    let (i, link_size) = le_u32(i)?;
    let (i, link_off) = le_u32(i)?;
    let (i, map_off) = le_u32(i)?;
    let (i, string_ids_size) = le_u32(i)?;
    let (i, string_ids_off) = le_u32(i)?;
    let (i, type_ids_size) = le_u32(i)?;
    let (i, type_ids_off) = le_u32(i)?;
    let (i, proto_ids_size) = le_u32(i)?;
    let (i, proto_ids_off) = le_u32(i)?;
    let (i, field_ids_size) = le_u32(i)?;
    let (i, field_ids_off) = le_u32(i)?;
    let (i, method_ids_size) = le_u32(i)?;
    let (i, method_ids_off) = le_u32(i)?;
    let (i, class_defs_size) = le_u32(i)?;
    let (i, class_defs_off) = le_u32(i)?;
    let (i, data_size) = le_u32(i)?;
    let (i, data_off) = le_u32(i)?;

    let mut m = [0u8; 8];
    m.copy_from_slice(magic);
    let mut s = [0u8; 20];
    s.copy_from_slice(signature);

    Ok((i, Header {
        magic: m,
        checksum,
        signature: s,
        file_size,
        header_size,
        endian_tag,
        link_size,
        link_off,
        map_off,
        string_ids_size,
        string_ids_off,
        type_ids_size,
        type_ids_off,
        proto_ids_size,
        proto_ids_off,
        field_ids_size,
        field_ids_off,
        method_ids_size,
        method_ids_off,
        class_defs_size,
        class_defs_off,
        data_size,
        data_off,
        container_size: 0,
        header_offset: 0,
    }))
}

fn parse_v41_fields(input: &[u8]) -> IResult<&[u8], (u32, u32)>
{
    let (i, container_size) = le_u32(input)?;
    let (i, header_offset) = le_u32(i)?;
    Ok((i, (container_size, header_offset)))
}

/// Check the magic and return the version it names.
pub fn parse_magic(bytes: &[u8]) -> Result<u32, DexError>
{
    if bytes.len() < 8 {
        fail!(BadSize, "{} bytes is too small for a dex magic", bytes.len());
    }
    if bytes[0..4] != DEX_MAGIC_PREFIX || bytes[7] != 0 {
        fail!(BadMagic, "unrecognized magic {:02x?}", &bytes[0..8]);
    }
    let digits = &bytes[4..7];
    if !digits.iter().all(|d| d.is_ascii_digit()) {
        fail!(BadMagic, "non-numeric version in magic {:02x?}", &bytes[0..8]);
    }
    let version = digits.iter().fold(0u32, |acc, d| acc * 10 + (d - b'0') as u32);
    if !SUPPORTED_VERSIONS.contains(&version) {
        fail!(BadVersion, "unsupported dex version {:03}", version);
    }
    Ok(version)
}

impl Header
{
    /// Parse the header found at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Header, DexError>
    {
        if bytes.is_empty() {
            fail!(BadSize, "empty dex file");
        }
        let version = parse_magic(bytes)?;
        let (rest, mut header) = parse_v35_fields(bytes)
            .map_err(|_| err!(BadSize, "{} bytes is too small for a dex header", bytes.len()))?;

        if version >= CONTAINER_VERSION {
            let (_, (container_size, header_offset)) = parse_v41_fields(rest)
                .map_err(|_| err!(BadSize, "{} bytes is too small for a v41 dex header", bytes.len()))?;
            header.container_size = container_size;
            header.header_offset = header_offset;
        } else {
            header.container_size = header.file_size;
            header.header_offset = 0;
        }
        Ok(header)
    }

    pub fn version(&self) -> u32
    {
        self.magic[4..7].iter().fold(0u32, |acc, d| acc * 10 + d.wrapping_sub(b'0') as u32)
    }

    pub fn is_container(&self) -> bool
    {
        self.version() >= CONTAINER_VERSION
    }

    /// Header size the declared version requires.
    pub fn expected_header_size(&self) -> u32
    {
        if self.is_container() { HEADER_SIZE_V41 } else { HEADER_SIZE }
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_x(bytes, &self.magic);
        c += write_u4(bytes, self.checksum);
        c += write_x(bytes, &self.signature);
        c += write_u4(bytes, self.file_size);
        c += write_u4(bytes, self.header_size);
        c += write_u4(bytes, self.endian_tag);
        c += write_u4(bytes, self.link_size);
        c += write_u4(bytes, self.link_off);
        c += write_u4(bytes, self.map_off);
        c += write_u4(bytes, self.string_ids_size);
        c += write_u4(bytes, self.string_ids_off);
        c += write_u4(bytes, self.type_ids_size);
        c += write_u4(bytes, self.type_ids_off);
        c += write_u4(bytes, self.proto_ids_size);
        c += write_u4(bytes, self.proto_ids_off);
        c += write_u4(bytes, self.field_ids_size);
        c += write_u4(bytes, self.field_ids_off);
        c += write_u4(bytes, self.method_ids_size);
        c += write_u4(bytes, self.method_ids_off);
        c += write_u4(bytes, self.class_defs_size);
        c += write_u4(bytes, self.class_defs_off);
        c += write_u4(bytes, self.data_size);
        c += write_u4(bytes, self.data_off);
        if self.is_container() {
            c += write_u4(bytes, self.container_size);
            c += write_u4(bytes, self.header_offset);
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::DexErrorKind;

    fn blank(version: u32) -> Header
    {
        let mut bytes = vec![0u8; HEADER_SIZE_V41 as usize];
        bytes[0..8].copy_from_slice(&magic_for_version(version));
        Header::parse(&bytes).unwrap()
    }

    #[test]
    fn version_gate()
    {
        for v in [35, 37, 38, 39, 40, 41] {
            assert_eq!(blank(v).version(), v);
        }
        let mut bytes = vec![0u8; HEADER_SIZE_V41 as usize];
        bytes[0..8].copy_from_slice(&magic_for_version(42));
        assert_eq!(Header::parse(&bytes).unwrap_err().kind(), DexErrorKind::BadVersion);
        bytes[0] = b'c';
        assert_eq!(Header::parse(&bytes).unwrap_err().kind(), DexErrorKind::BadMagic);
    }

    #[test]
    fn header_roundtrip()
    {
        let mut h = blank(41);
        h.file_size = 0x1234;
        h.container_size = 0x2468;
        h.header_offset = 0x1234;
        h.endian_tag = ENDIAN_CONSTANT;
        let mut encoded = vec![];
        assert_eq!(h.write(&mut encoded), HEADER_SIZE_V41 as usize);
        assert_eq!(Header::parse(&encoded).unwrap(), h);

        let h35 = blank(35);
        let mut encoded = vec![];
        assert_eq!(h35.write(&mut encoded), HEADER_SIZE as usize);
    }

    #[test]
    fn short_and_empty_inputs()
    {
        assert_eq!(Header::parse(&[]).unwrap_err().kind(), DexErrorKind::BadSize);
        let mut bytes = vec![0u8; 0x40];
        bytes[0..8].copy_from_slice(&magic_for_version(35));
        assert_eq!(Header::parse(&bytes).unwrap_err().kind(), DexErrorKind::BadSize);
    }
}
