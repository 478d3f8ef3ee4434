//! BA2 container header access and integrity checks.
//!
//! Only the fixed 24-byte header and the trailing name table are understood
//! here; the file records and packed payload are opaque.
//!
//! # Header layout (little-endian)
//!
//! | Offset | Size | Field             |
//! |--------|------|-------------------|
//! | 0      | 4    | magic `BTDX`      |
//! | 4      | 4    | version (1 or 8)  |
//! | 8      | 4    | type tag          |
//! | 12     | 4    | file count        |
//! | 16     | 8    | name table offset |
//!
//! The name table holds `file_count` entries of `u16 len | bytes`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"BTDX";
/// Two known engine generations write version 1 and version 8.
pub const SUPPORTED_VERSIONS: [u32; 2] = [1, 8];
pub const HEADER_SIZE: usize = 24;
pub const CONTAINER_EXTENSION: &str = "ba2";

/// Upper bound on entries accepted from a name table.
const MAX_ENTRIES: u32 = 1 << 20;

const GNRL_RECORD_SIZE: usize = 36;
const DX10_RECORD_SIZE: usize = 24;

// ── ArchiveType ──────────────────────────────────────────────────────────────

/// Declared container type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveType {
    /// `GNRL`: meshes, scripts, sounds, strings.
    General,
    /// `DX10`: texture-optimised layout.
    Textures,
}

impl ArchiveType {
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            ArchiveType::General  => b"GNRL",
            ArchiveType::Textures => b"DX10",
        }
    }

    pub fn from_tag(tag: &[u8; 4]) -> Option<Self> {
        match tag {
            b"GNRL" => Some(ArchiveType::General),
            b"DX10" => Some(ArchiveType::Textures),
            _       => None,
        }
    }

    /// Value of the archiving tool's `-f=` switch.
    pub fn tool_format(self) -> &'static str {
        match self {
            ArchiveType::General  => "General",
            ArchiveType::Textures => "DDS",
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&tag_display(self.tag()))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Invalid magic: {0}")]
    InvalidMagic(String),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("Unknown container type: {0}")]
    UnknownType(String),
    #[error("Name table declares {0} entries")]
    TooManyEntries(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Header field named by a [`VerificationFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    /// The header could not be read at all (missing or truncated file).
    Header,
    Magic,
    Version,
    Type,
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeaderField::Header  => "header",
            HeaderField::Magic   => "magic",
            HeaderField::Version => "version",
            HeaderField::Type    => "type",
        })
    }
}

/// A produced container failed a header check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {field} mismatch (expected {expected}, found {actual})", .path.display())]
pub struct VerificationFailure {
    pub path:     PathBuf,
    pub field:    HeaderField,
    pub expected: String,
    pub actual:   String,
}

// ── ContainerHeader ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub magic:             [u8; 4],
    pub version:           u32,
    pub type_tag:          [u8; 4],
    pub file_count:        u32,
    pub name_table_offset: u64,
}

impl ContainerHeader {
    pub fn new(version: u32, kind: ArchiveType, file_count: u32, name_table_offset: u64) -> Self {
        Self {
            magic: *MAGIC,
            version,
            type_tag: *kind.tag(),
            file_count,
            name_table_offset,
        }
    }

    /// Read the raw header fields without judging them.
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        let version = reader.read_u32::<LittleEndian>()?;
        let mut type_tag = [0u8; 4];
        reader.read_exact(&mut type_tag)?;
        let file_count = reader.read_u32::<LittleEndian>()?;
        let name_table_offset = reader.read_u64::<LittleEndian>()?;
        Ok(Self { magic, version, type_tag, file_count, name_table_offset })
    }

    /// Read and validate: magic, supported version and known type.
    pub fn read_checked<R: Read>(reader: R) -> Result<Self, ContainerError> {
        let header = Self::read(reader)?;
        if &header.magic != MAGIC {
            return Err(ContainerError::InvalidMagic(tag_display(&header.magic)));
        }
        if !SUPPORTED_VERSIONS.contains(&header.version) {
            return Err(ContainerError::UnsupportedVersion(header.version));
        }
        if header.archive_type().is_none() {
            return Err(ContainerError::UnknownType(tag_display(&header.type_tag)));
        }
        Ok(header)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_all(&self.type_tag)?;
        writer.write_u32::<LittleEndian>(self.file_count)?;
        writer.write_u64::<LittleEndian>(self.name_table_offset)?;
        Ok(())
    }

    pub fn archive_type(&self) -> Option<ArchiveType> {
        ArchiveType::from_tag(&self.type_tag)
    }

    /// Compare against the values expected for a container of `expected`
    /// type, reporting the first offending field.
    pub fn check(&self, path: &Path, expected: ArchiveType) -> Result<(), VerificationFailure> {
        let fail = |field, expected: String, actual: String| VerificationFailure {
            path: path.to_owned(),
            field,
            expected,
            actual,
        };
        if &self.magic != MAGIC {
            return Err(fail(HeaderField::Magic, tag_display(MAGIC), tag_display(&self.magic)));
        }
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(fail(
                HeaderField::Version,
                format!("{{{}, {}}}", SUPPORTED_VERSIONS[0], SUPPORTED_VERSIONS[1]),
                self.version.to_string(),
            ));
        }
        if &self.type_tag != expected.tag() {
            return Err(fail(HeaderField::Type, expected.to_string(), tag_display(&self.type_tag)));
        }
        Ok(())
    }
}

// ── Inspection ───────────────────────────────────────────────────────────────

/// Open `path` and return its validated header.
pub fn read_header(path: &Path) -> Result<ContainerHeader, ContainerError> {
    let file = File::open(path)?;
    ContainerHeader::read_checked(BufReader::new(file))
}

/// Read the entry names stored in the container's name table.
pub fn read_entry_names(path: &Path) -> Result<Vec<String>, ContainerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = ContainerHeader::read_checked(&mut reader)?;
    if header.file_count > MAX_ENTRIES {
        return Err(ContainerError::TooManyEntries(header.file_count));
    }
    if header.name_table_offset == 0 {
        return Ok(Vec::new());
    }
    reader.seek(SeekFrom::Start(header.name_table_offset))?;
    let mut names = Vec::with_capacity(header.file_count as usize);
    for _ in 0..header.file_count {
        let len = reader.read_u16::<LittleEndian>()? as usize;
        let mut raw = vec![0u8; len];
        reader.read_exact(&mut raw)?;
        names.push(String::from_utf8_lossy(&raw).into_owned());
    }
    Ok(names)
}

/// Check a produced container's header against `expected`.
///
/// A missing or truncated file is reported against [`HeaderField::Header`].
pub fn verify(path: &Path, expected: ArchiveType) -> Result<(), VerificationFailure> {
    let header = File::open(path)
        .and_then(|f| ContainerHeader::read(BufReader::new(f)))
        .map_err(|e| VerificationFailure {
            path:     path.to_owned(),
            field:    HeaderField::Header,
            expected: format!("{HEADER_SIZE} readable bytes"),
            actual:   e.to_string(),
        })?;
    header.check(path, expected)
}

/// Write a structurally minimal container: header, zeroed file records and
/// a name table. Payload data is not stored.
pub fn write_container<W: Write>(
    mut writer: W,
    version: u32,
    kind: ArchiveType,
    names: &[String],
) -> io::Result<()> {
    let record_size = match kind {
        ArchiveType::General  => GNRL_RECORD_SIZE,
        ArchiveType::Textures => DX10_RECORD_SIZE,
    };
    let records_len = record_size * names.len();
    let name_table_offset = (HEADER_SIZE + records_len) as u64;
    ContainerHeader::new(version, kind, names.len() as u32, name_table_offset).write(&mut writer)?;
    writer.write_all(&vec![0u8; records_len])?;
    for name in names {
        let bytes = name.as_bytes();
        let len = u16::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("entry name too long: {name}")))?;
        writer.write_u16::<LittleEndian>(len)?;
        writer.write_all(bytes)?;
    }
    Ok(())
}

fn tag_display(tag: &[u8; 4]) -> String {
    if tag.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(tag).into_owned()
    } else {
        format!("0x{}", hex::encode(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(magic: &[u8; 4], version: u32, tag: &[u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        ContainerHeader { magic: *magic, version, type_tag: *tag, file_count: 0, name_table_offset: 0 }
            .write(&mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn accepts_both_engine_generations() {
        for version in SUPPORTED_VERSIONS {
            for kind in [ArchiveType::General, ArchiveType::Textures] {
                let header = ContainerHeader::read(Cursor::new(header_bytes(MAGIC, version, kind.tag()))).unwrap();
                assert!(header.check(Path::new("x.ba2"), kind).is_ok());
            }
        }
    }

    #[test]
    fn version_three_names_field_and_values() {
        let header = ContainerHeader::read(Cursor::new(header_bytes(MAGIC, 3, b"GNRL"))).unwrap();
        let err = header.check(Path::new("x.ba2"), ArchiveType::General).unwrap_err();
        assert_eq!(err.field, HeaderField::Version);
        assert_eq!(err.expected, "{1, 8}");
        assert_eq!(err.actual, "3");
    }

    #[test]
    fn type_mismatch_reports_tags() {
        let header = ContainerHeader::read(Cursor::new(header_bytes(MAGIC, 8, b"GNRL"))).unwrap();
        let err = header.check(Path::new("x.ba2"), ArchiveType::Textures).unwrap_err();
        assert_eq!(err.field, HeaderField::Type);
        assert_eq!(err.expected, "DX10");
        assert_eq!(err.actual, "GNRL");
    }

    #[test]
    fn bad_magic_is_hex_encoded_when_unprintable() {
        let header = ContainerHeader::read(Cursor::new(header_bytes(&[0, 1, 2, 3], 8, b"GNRL"))).unwrap();
        let err = header.check(Path::new("x.ba2"), ArchiveType::General).unwrap_err();
        assert_eq!(err.field, HeaderField::Magic);
        assert_eq!(err.expected, "BTDX");
        assert_eq!(err.actual, "0x00010203");
    }

    #[test]
    fn truncated_file_fails_on_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.ba2");
        std::fs::write(&path, b"BTDX\x08").unwrap();
        let err = verify(&path, ArchiveType::General).unwrap_err();
        assert_eq!(err.field, HeaderField::Header);
    }

    #[test]
    fn name_table_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.ba2");
        let names = vec!["sound\\fx\\a.xwm".to_string(), "strings\\cc_en.strings".to_string()];
        write_container(File::create(&path).unwrap(), 1, ArchiveType::General, &names).unwrap();
        assert_eq!(read_entry_names(&path).unwrap(), names);
        assert_eq!(read_header(&path).unwrap().archive_type(), Some(ArchiveType::General));
    }
}
