/* Container-level loading: v41 sibling files and zip archives */

use std::io::{Cursor, Read};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use zip::read::ZipArchive;

use crate::dex::dex_file::DexFile;
use crate::dex::error::{DexError, ResultExt};
use crate::dex::verifier;

/// Controls how strictly a container is checked at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions
{
    /// Reject on adler32 mismatch; otherwise only warn.
    pub verify_checksum: bool,
    pub verify_signature: bool,
}

impl Default for LoadOptions
{
    fn default() -> Self
    {
        LoadOptions { verify_checksum: true, verify_signature: false }
    }
}

/// Every dex file found in one byte range. Versions before 41 always hold
/// exactly one file; v41 containers hold one or more siblings laid end to end.
#[derive(Debug, Clone)]
pub struct DexContainer<'a>
{
    bytes: &'a [u8],
    files: Vec<DexFile<'a>>,
}

impl<'a> DexContainer<'a>
{
    pub fn open(bytes: &'a [u8], options: &LoadOptions) -> Result<DexContainer<'a>, DexError>
    {
        if bytes.is_empty() {
            fail!(BadSize, "empty container");
        }
        let first = DexFile::open_unverified(bytes, 0)?;
        verifier::verify(&first, options).context(|| "dex file #0".to_string())?;
        let mut files = vec![first];

        loop {
            let last = &files[files.len() - 1];
            let h = last.header();
            if !h.is_container() {
                break;
            }
            let next = last.begin_offset() + h.file_size as usize;
            if next >= files[0].header().container_size as usize {
                break;
            }
            let mut sibling = DexFile::open_unverified(bytes, next).context(|| format!("dex file #{}", files.len()))?;
            if !sibling.header().is_container() {
                fail!(BadVersion, "sibling at 0x{:x} is version {} inside a v41 container", next, sibling.version());
            }
            let first_header = files[0].header();
            if sibling.header().container_size != first_header.container_size {
                fail!(BadSize, "sibling at 0x{:x} declares container_size 0x{:x}, first file 0x{:x}",
                      next, sibling.header().container_size, first_header.container_size);
            }
            if (sibling.header().data_off, sibling.header().data_size) != (first_header.data_off, first_header.data_size) {
                warn!(
                    "sibling at 0x{:x} declares data section 0x{:x}+0x{:x}; using 0x{:x}+0x{:x} from the first file",
                    next, sibling.header().data_off, sibling.header().data_size, first_header.data_off, first_header.data_size
                );
                let (off, size) = (first_header.data_off, first_header.data_size);
                sibling.adopt_data_section(off, size);
            }
            verifier::verify(&sibling, options).context(|| format!("dex file #{}", files.len()))?;
            files.push(sibling);
        }

        debug!("opened container of 0x{:x} bytes with {} dex file(s)", bytes.len(), files.len());
        Ok(DexContainer { bytes, files })
    }

    pub fn bytes(&self) -> &'a [u8]
    {
        self.bytes
    }

    pub fn len(&self) -> usize
    {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.files.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&DexFile<'a>>
    {
        self.files.get(i)
    }

    pub fn files(&self) -> &[DexFile<'a>]
    {
        &self.files
    }

    /// The sibling view whose header sits at `header_offset`.
    pub fn sibling_at(&self, header_offset: usize) -> Option<&DexFile<'a>>
    {
        self.files.iter().find(|f| f.begin_offset() == header_offset)
    }

    pub fn into_files(self) -> Vec<DexFile<'a>>
    {
        self.files
    }
}

/// Dex entries extracted from a zip archive (`classes.dex`, `classes2.dex`, ...).
#[derive(Debug, Clone)]
pub struct DexArchive
{
    entries: Vec<(String, Vec<u8>)>,
}

fn classes_entry_name(n: usize) -> String
{
    if n == 1 { "classes.dex".to_string() } else { format!("classes{}.dex", n) }
}

impl DexArchive
{
    /// Read and verify every `classesN.dex` entry, in order, stopping at the
    /// first missing index.
    pub fn open(bytes: &[u8], options: &LoadOptions) -> Result<DexArchive, DexError>
    {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| err!(BadArchive, "unreadable archive: {}", e))?;
        let mut entries = vec![];
        for n in 1.. {
            let name = classes_entry_name(n);
            let mut file = match archive.by_name(&name) {
                Ok(f) => f,
                Err(zip::result::ZipError::FileNotFound) => break,
                Err(e) => fail!(BadArchive, "{}: {}", name, e),
            };
            if file.size() == 0 {
                fail!(BadSize, "{} is empty", name);
            }
            let mut data = Vec::with_capacity(entry_capacity(file.size(), bytes.len()));
            file.read_to_end(&mut data).map_err(|e| err!(BadArchive, "{}: {}", name, e))?;
            entries.push((name, data));
        }
        if entries.is_empty() {
            fail!(BadArchive, "archive has no classes.dex");
        }

        let out = DexArchive { entries };
        for (name, data) in &out.entries {
            DexContainer::open(data, options).context(|| name.clone())?;
        }
        Ok(out)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str>
    {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Views over every entry. Verification already ran in `open`.
    pub fn containers(&self, options: &LoadOptions) -> Result<Vec<DexContainer<'_>>, DexError>
    {
        self.entries.iter().map(|(name, data)| DexContainer::open(data, options).context(|| name.clone())).collect()
    }
}

impl<'a> DexContainer<'a>
{
    /// Shorthand for `DexArchive::open` when only the entry bytes are needed.
    pub fn open_archive(bytes: &[u8], options: &LoadOptions) -> Result<DexArchive, DexError>
    {
        DexArchive::open(bytes, options)
    }
}

/// Buffer size to reserve for an entry: its declared size, capped at the
/// archive length. Reading grows the buffer past the cap if it must.
fn entry_capacity(declared: u64, archive_len: usize) -> usize
{
    usize::try_from(declared).map_or(archive_len, |n| n.min(archive_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::builder::DexBuilder;
    use crate::dex::error::DexErrorKind;
    use std::io::Write;
    use zip::write::{FileOptions, ZipWriter};

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8>
    {
        let mut w = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            w.start_file(*name, FileOptions::default().compression_method(zip::CompressionMethod::Stored)).unwrap();
            w.write_all(data).unwrap();
        }
        w.finish().unwrap().into_inner()
    }

    #[test]
    fn empty_input_is_bad_size()
    {
        assert_eq!(DexContainer::open(&[], &LoadOptions::default()).unwrap_err().kind(), DexErrorKind::BadSize);
    }

    #[test]
    fn pre_v41_is_a_single_file()
    {
        let mut b = DexBuilder::new(38);
        b.add_class("LA;", None);
        let bytes = b.build().unwrap();
        let c = DexContainer::open(&bytes, &LoadOptions::default()).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(0).unwrap().version(), 38);
    }

    #[test]
    fn archive_entries_load_in_order()
    {
        let mut b = DexBuilder::new(35);
        b.add_class("LA;", None);
        let one = b.build().unwrap();
        let mut b = DexBuilder::new(35);
        b.add_class("LB;", None);
        let two = b.build().unwrap();
        let zip = zip_of(&[("classes2.dex", &two), ("classes.dex", &one), ("res/raw.bin", b"x")]);

        let archive = DexContainer::open_archive(&zip, &LoadOptions::default()).unwrap();
        assert_eq!(archive.entry_names().collect::<Vec<_>>(), vec!["classes.dex", "classes2.dex"]);
        let containers = archive.containers(&LoadOptions::default()).unwrap();
        assert!(containers[1].get(0).unwrap().find_class_def("LB;").is_some());
    }

    #[test]
    fn declared_entry_sizes_do_not_drive_allocation()
    {
        assert_eq!(entry_capacity(u64::MAX, 4096), 4096);
        assert_eq!(entry_capacity(1 << 40, 100), 100);
        assert_eq!(entry_capacity(70, 100), 70);
    }

    #[test]
    fn garbage_is_not_an_archive()
    {
        let e = DexArchive::open(b"definitely not a zip", &LoadOptions::default()).unwrap_err();
        assert_eq!(e.kind(), DexErrorKind::BadArchive);
    }
}
