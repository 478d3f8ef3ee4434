//! Light-master descriptor plugins.
//!
//! Every merged container is registered with the engine by a plugin file
//! that carries no gameplay records. The plugin is a single `TES4` record:
//!
//! ```text
//! TES4 | data_size u32 | flags u32 | form_id u32 | vc_info u32 | form_version u16 | unknown u16
//! HEDR | 12 u16 | version f32 | record_count u32 | next_object_id u32
//! CNAM | len u16 | author\0
//! INTV | 4 u16   | tagified_string_count u32        (localizable categories only)
//! SNAM | len u16 | description\0
//! ```
//!
//! # Flag word
//! Both the master bit (`0x1`) and the light-master bit (`0x200`) must be
//! set. A plugin with only one of them either fails to load or occupies a
//! full load-order slot.
//!
//! # Subrecord order
//! `HEDR` is always first; the remaining subrecords follow in ascending tag
//! order.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RECORD_TYPE:          &[u8; 4] = b"TES4";
pub const FLAG_MASTER:          u32 = 0x0000_0001;
pub const FLAG_LIGHT_MASTER:    u32 = 0x0000_0200;
/// Required flag word of every descriptor written by this crate.
pub const LIGHT_MASTER_FLAGS:   u32 = FLAG_MASTER | FLAG_LIGHT_MASTER;
pub const RECORD_HEADER_SIZE:   usize = 24;
pub const PLUGIN_EXTENSION:     &str = "esl";
/// First form id available to a light master.
pub const FIRST_LIGHT_OBJECT_ID: u32 = 0x800;

pub const TAG_HEDR: &[u8; 4] = b"HEDR";
pub const TAG_CNAM: &[u8; 4] = b"CNAM";
pub const TAG_SNAM: &[u8; 4] = b"SNAM";
pub const TAG_INTV: &[u8; 4] = b"INTV";

const HEDR_VERSION: f32 = 1.0;

/// Largest header record body `read` accepts.
pub const MAX_RECORD_SIZE: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Not a plugin: record type {0:?}")]
    InvalidRecordType([u8; 4]),
    #[error("Subrecord {tag} is {len} bytes (limit {})", u16::MAX)]
    SubrecordTooLarge { tag: String, len: usize },
    #[error("Subrecord {0} overruns the record")]
    Truncated(String),
    #[error("Header record claims {0} bytes (limit {MAX_RECORD_SIZE})")]
    RecordTooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Subrecord ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subrecord {
    pub tag:  [u8; 4],
    pub data: Vec<u8>,
}

impl Subrecord {
    pub fn new(tag: &[u8; 4], data: Vec<u8>) -> Self {
        Self { tag: *tag, data }
    }

    /// NUL-terminated string payload.
    pub fn zstring(tag: &[u8; 4], value: &str) -> Self {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        Self::new(tag, data)
    }

    pub fn tag_str(&self) -> String {
        String::from_utf8_lossy(&self.tag).into_owned()
    }

    fn encoded_len(&self) -> usize {
        4 + 2 + self.data.len()
    }

    fn write<W: Write>(&self, mut writer: W) -> Result<(), PluginError> {
        let len = u16::try_from(self.data.len()).map_err(|_| PluginError::SubrecordTooLarge {
            tag: self.tag_str(),
            len: self.data.len(),
        })?;
        writer.write_all(&self.tag)?;
        writer.write_u16::<LittleEndian>(len)?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

// ── DescriptorOptions ────────────────────────────────────────────────────────

/// Content of a generated descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorOptions {
    pub author:       String,
    pub description:  String,
    /// Placeholder record count written into `HEDR`.
    pub record_count: u32,
    /// Emit the `INTV` localization block.
    pub localized:    bool,
}

impl Default for DescriptorOptions {
    fn default() -> Self {
        Self {
            author:       "ccpack".into(),
            description:  "Merged Creation Club content".into(),
            record_count: 0,
            localized:    false,
        }
    }
}

// ── PluginHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PluginHeader {
    pub flags:           u32,
    pub form_id:         u32,
    pub version_control: u32,
    pub form_version:    u16,
    pub unknown:         u16,
    pub subrecords:      Vec<Subrecord>,
}

impl PluginHeader {
    /// Build the minimal light-master header described by `opts`.
    pub fn light_master(opts: &DescriptorOptions) -> Self {
        let mut hedr = Vec::with_capacity(12);
        hedr.extend_from_slice(&HEDR_VERSION.to_le_bytes());
        hedr.extend_from_slice(&opts.record_count.to_le_bytes());
        hedr.extend_from_slice(&FIRST_LIGHT_OBJECT_ID.to_le_bytes());

        let mut rest = vec![
            Subrecord::zstring(TAG_CNAM, &opts.author),
            Subrecord::zstring(TAG_SNAM, &opts.description),
        ];
        if opts.localized {
            rest.push(Subrecord::new(TAG_INTV, 0u32.to_le_bytes().to_vec()));
        }
        rest.sort_by(|a, b| a.tag.cmp(&b.tag));

        let mut subrecords = Vec::with_capacity(rest.len() + 1);
        subrecords.push(Subrecord::new(TAG_HEDR, hedr));
        subrecords.extend(rest);

        Self {
            flags: LIGHT_MASTER_FLAGS,
            form_id: 0,
            version_control: 0,
            form_version: 0,
            unknown: 0,
            subrecords,
        }
    }

    pub fn data_size(&self) -> usize {
        self.subrecords.iter().map(Subrecord::encoded_len).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PluginError> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + self.data_size());
        self.write(&mut buf)?;
        Ok(buf)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), PluginError> {
        writer.write_all(RECORD_TYPE)?;
        writer.write_u32::<LittleEndian>(self.data_size() as u32)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.form_id)?;
        writer.write_u32::<LittleEndian>(self.version_control)?;
        writer.write_u16::<LittleEndian>(self.form_version)?;
        writer.write_u16::<LittleEndian>(self.unknown)?;
        for sub in &self.subrecords {
            sub.write(&mut writer)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, PluginError> {
        let mut record_type = [0u8; 4];
        reader.read_exact(&mut record_type)?;
        if &record_type != RECORD_TYPE {
            return Err(PluginError::InvalidRecordType(record_type));
        }
        let data_size       = reader.read_u32::<LittleEndian>()? as usize;
        let flags           = reader.read_u32::<LittleEndian>()?;
        let form_id         = reader.read_u32::<LittleEndian>()?;
        let version_control = reader.read_u32::<LittleEndian>()?;
        let form_version    = reader.read_u16::<LittleEndian>()?;
        let unknown         = reader.read_u16::<LittleEndian>()?;

        if data_size > MAX_RECORD_SIZE {
            return Err(PluginError::RecordTooLarge(data_size));
        }
        let mut data = vec![0u8; data_size];
        reader.read_exact(&mut data)?;

        let mut subrecords = Vec::new();
        let mut cursor = &data[..];
        while !cursor.is_empty() {
            let mut tag = [0u8; 4];
            cursor.read_exact(&mut tag)?;
            let len = cursor.read_u16::<LittleEndian>()? as usize;
            if len > cursor.len() {
                return Err(PluginError::Truncated(String::from_utf8_lossy(&tag).into_owned()));
            }
            let (payload, rest) = cursor.split_at(len);
            subrecords.push(Subrecord::new(&tag, payload.to_vec()));
            cursor = rest;
        }

        Ok(Self { flags, form_id, version_control, form_version, unknown, subrecords })
    }

    pub fn is_light_master(&self) -> bool {
        self.flags & LIGHT_MASTER_FLAGS == LIGHT_MASTER_FLAGS
    }

    pub fn subrecord(&self, tag: &[u8; 4]) -> Option<&Subrecord> {
        self.subrecords.iter().find(|s| &s.tag == tag)
    }

    pub fn record_count(&self) -> Option<u32> {
        let hedr = self.subrecord(TAG_HEDR)?;
        let bytes: [u8; 4] = hedr.data.get(4..8)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    pub fn author(&self) -> Option<String> {
        let cnam = self.subrecord(TAG_CNAM)?;
        let end = cnam.data.iter().position(|&b| b == 0).unwrap_or(cnam.data.len());
        Some(String::from_utf8_lossy(&cnam.data[..end]).into_owned())
    }

    pub fn is_localized(&self) -> bool {
        self.subrecord(TAG_INTV).is_some()
    }
}

// ── DescriptorFile ───────────────────────────────────────────────────────────

/// A descriptor written next to the container it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorFile {
    /// File name including extension, e.g. `CCMerged_Part2.esl`.
    pub name:      String,
    pub path:      PathBuf,
    /// Name of the container this descriptor registers.
    pub container: String,
    pub flags:     u32,
}

/// Write `<dir>/<stem>.esl` for `container`.
pub fn write_descriptor(
    dir: &Path,
    stem: &str,
    container: &str,
    opts: &DescriptorOptions,
) -> Result<DescriptorFile, PluginError> {
    let header = PluginHeader::light_master(opts);
    let name = format!("{stem}.{PLUGIN_EXTENSION}");
    let path = dir.join(&name);
    let bytes = header.to_bytes()?;
    let mut file = File::create(&path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(DescriptorFile {
        name,
        path,
        container: container.to_owned(),
        flags: header.flags,
    })
}

/// Read a descriptor back from disk.
pub fn read_descriptor(path: &Path) -> Result<PluginHeader, PluginError> {
    PluginHeader::read(io::BufReader::new(File::open(path)?))
}
