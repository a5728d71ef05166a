//! Specialization archive delivered during first-boot provisioning.
//!
//! ```text
//! u32 total_length, u32 file_count
//! file_count x {
//!     u32 file_type (0), u32 name_size, u32 name_offset,
//!     u32 payload_size, u32 payload_offset,
//! }
//! ```
//!
//! Offsets are relative to the start of their entry header. Names are
//! UTF-16LE; both name and payload may sit anywhere after the header as long
//! as they stay inside the buffer.

use crate::buf::{checked_range, BufError, Reader, Writer};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

pub const ARCHIVE_HEADER_LEN: usize = 8;
pub const ENTRY_HEADER_LEN: usize = 20;

/// Entry name that is handed out under [`SPECIALIZE_NAME`] instead
pub const UNATTEND_NAME: &str = "unattend.xml";
pub const SPECIALIZE_NAME: &str = "specialize";

const FILE_TYPE: u32 = 0;

#[derive(Error, Debug, PartialEq)]
pub enum SpecializeError {
    #[error("specialization archive truncated: {0}")]
    Truncated(#[from] BufError),
    #[error("entry {index}: {field} out of bounds: {source}")]
    Bounds {
        index: u32,
        field: &'static str,
        source: BufError,
    },
    #[error("entry {index}: name size {size} is not a whole number of UTF-16 units")]
    OddNameSize { index: u32, size: u32 },
    #[error("entry {index}: data ends inside its own header ({extent} bytes)")]
    Overlap { index: u32, extent: usize },
    #[error("{what} of `{name}` does not fit in 32 bits")]
    TooLarge { name: String, what: &'static str },
    #[error("entry name {name:?} contains NUL")]
    NulInName { name: String },
}

pub type Result<T, E = SpecializeError> = core::result::Result<T, E>;

/// A named payload. The payload buffer is wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SpecializationFile {
    pub name: String,
    pub payload: Zeroizing<Vec<u8>>,
}

impl SpecializationFile {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: Zeroizing::new(payload.into()),
        }
    }
}

impl fmt::Debug for SpecializationFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecializationFile")
            .field("name", &self.name)
            .field("payload", &format_args!("<{} bytes>", self.payload.len()))
            .finish()
    }
}

struct EntryHeader {
    name_size: u32,
    name_offset: u32,
    payload_size: u32,
    payload_offset: u32,
}

impl EntryHeader {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let _file_type = reader.read_u32()?;
        Ok(Self {
            name_size: reader.read_u32()?,
            name_offset: reader.read_u32()?,
            payload_size: reader.read_u32()?,
            payload_offset: reader.read_u32()?,
        })
    }
}

/// Narrows UTF-16LE units to one byte each, stopping at the first NUL.
///
/// Units above 0xff lose their high byte. Names in practice are ASCII.
fn decode_name(bytes: &[u8]) -> String {
    bytes
        .chunks_exact(2)
        .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
        .take_while(|&unit| unit != 0)
        .map(|unit| char::from(unit as u8))
        .collect()
}

fn exposed_name(name: String) -> String {
    if name == UNATTEND_NAME {
        SPECIALIZE_NAME.to_owned()
    } else {
        name
    }
}

/// Parses every entry out of a decrypted specialization archive.
///
/// Either all `file_count` entries are returned or none are; payloads
/// copied before a failing entry are wiped on the way out.
pub fn extract(archive: &[u8]) -> Result<Vec<SpecializationFile>> {
    let mut reader = Reader::new(archive);
    let total_length = reader.read_u32()?;
    let file_count = reader.read_u32()?;
    if usize::try_from(total_length).map_or(true, |len| len != archive.len()) {
        log::debug!(
            "archive header declares {} bytes, buffer holds {}",
            total_length,
            archive.len()
        );
    }

    // Every entry needs at least a header, which bounds a hostile count
    let plausible = reader.remaining() / ENTRY_HEADER_LEN;
    let mut files = Vec::with_capacity(plausible.min(file_count as usize));
    for index in 0..file_count {
        let entry = reader.rest();
        let header = EntryHeader::read(&mut reader)?;

        if header.name_size % 2 != 0 {
            return Err(SpecializeError::OddNameSize {
                index,
                size: header.name_size,
            });
        }
        let name_range = checked_range(header.name_offset, header.name_size, entry.len())
            .map_err(|source| SpecializeError::Bounds {
                index,
                field: "name",
                source,
            })?;
        let payload_range =
            checked_range(header.payload_offset, header.payload_size, entry.len()).map_err(
                |source| SpecializeError::Bounds {
                    index,
                    field: "payload",
                    source,
                },
            )?;

        let extent = name_range.end.max(payload_range.end);
        if extent < ENTRY_HEADER_LEN {
            return Err(SpecializeError::Overlap { index, extent });
        }

        let name = exposed_name(decode_name(&entry[name_range]));
        log::debug!(
            "entry {}: `{}` with {} byte payload",
            index,
            name,
            header.payload_size
        );
        files.push(SpecializationFile::new(name, &entry[payload_range]));

        reader.skip(extent - ENTRY_HEADER_LEN)?;
    }
    Ok(files)
}

fn field_u32(len: usize, name: &str, what: &'static str) -> Result<u32> {
    u32::try_from(len).map_err(|_| SpecializeError::TooLarge {
        name: name.to_owned(),
        what,
    })
}

/// Lays the files out canonically: header, name, payload, per entry.
///
/// Names may not contain NUL, since extraction ends a name at the first one.
pub fn combine(files: &[SpecializationFile]) -> Result<Zeroizing<Vec<u8>>> {
    if let Some(file) = files.iter().find(|file| file.name.contains('\0')) {
        return Err(SpecializeError::NulInName {
            name: file.name.clone(),
        });
    }
    let names: Vec<Vec<u8>> = files
        .iter()
        .map(|file| {
            file.name
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect()
        })
        .collect();
    let total = files.iter().zip(&names).fold(ARCHIVE_HEADER_LEN, |acc, (file, name)| {
        acc.saturating_add(ENTRY_HEADER_LEN + name.len())
            .saturating_add(file.payload.len())
    });
    let file_count = field_u32(files.len(), "archive", "file count")?;
    let total_length = field_u32(total, "archive", "total length")?;

    let mut writer = Writer::with_capacity(total);
    writer.put_u32(total_length);
    writer.put_u32(file_count);
    for (file, name) in files.iter().zip(&names) {
        let name_size = field_u32(name.len(), &file.name, "name size")?;
        let payload_size = field_u32(file.payload.len(), &file.name, "payload size")?;
        let payload_offset = field_u32(ENTRY_HEADER_LEN + name.len(), &file.name, "payload offset")?;
        writer.put_u32(FILE_TYPE);
        writer.put_u32(name_size);
        writer.put_u32(ENTRY_HEADER_LEN as u32);
        writer.put_u32(payload_size);
        writer.put_u32(payload_offset);
        writer.put_bytes(name);
        writer.put_bytes(&file.payload);
    }
    Ok(Zeroizing::new(writer.into_vec()))
}

/// Drops an extracted list, wiping every payload.
pub fn release(files: Vec<SpecializationFile>) {
    log::debug!("releasing {} specialization files", files.len());
    drop(files);
}
