//! NuFX (.shk/.sdk/.bxy) archive parser and decompressor.
//!
//! This crate reads NuFX archives, the format produced by the ShrinkIt
//! family of tools on Apple II systems, including archives wrapped in a
//! Binary II transport envelope (.bxy).
//!
//! # Supported thread formats
//!
//! - **Uncompressed** - stored data, zero padded to the declared size
//! - **Dynamic LZW/1** - ShrinkIt's original block LZW with an RLE
//!   pre-stage and a stream CRC (per-block string table)
//! - **Dynamic LZW/2** - the GS/ShrinkIt variant (persistent string table,
//!   explicit clear codes, declared block lengths)
//!
//! Huffman Squeeze and the 12/16-bit Unix compress formats are recognized
//! but not supported.
//!
//! # Example
//!
//! ```no_run
//! use nufx::NufxArchive;
//!
//! let data = std::fs::read("archive.shk").unwrap();
//! let mut archive = NufxArchive::parse(&data).unwrap();
//!
//! for index in 0..archive.records().len() {
//!     let name = archive.file_name(index).unwrap();
//!     if let Some(fork) = archive.data_fork(index).unwrap() {
//!         println!("{}: {} bytes", name, fork.len());
//!     }
//! }
//! ```

use encoding_rs::MACINTOSH;
use log::{debug, warn};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use thiserror::Error;

/// Errors that can occur when reading a NuFX archive.
#[derive(Error, Debug)]
pub enum NufxError {
    /// The archive structure is malformed: bad signature, short data,
    /// impossible attribute count, or an unsupported header version.
    #[error("invalid archive data: {0}")]
    InvalidInput(String),

    /// A metadata field holds a value outside its documented range.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// A compressed thread failed to decode consistently.
    #[error("corrupted stream: {0}")]
    CorruptedStream(String),

    /// The thread uses a compression format this reader does not decode.
    #[error("unsupported compression format {0:#06x}")]
    UnsupportedFormat(u16),

    /// An I/O error occurred while reading from the byte source.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// "NuFile" in alternating low/high ASCII.
pub const MASTER_SIGNATURE: [u8; 6] = [0x4e, 0xf5, 0x46, 0xe9, 0x6c, 0xe5];
/// "NuFX" in alternating low/high ASCII.
pub const RECORD_SIGNATURE: [u8; 4] = [0x4e, 0xf5, 0x46, 0xd8];

const BINARY2_SIGNATURE: [u8; 3] = [0x0a, 0x47, 0x4c];
const BINARY2_ID: u8 = 0x02;

const RECORD_HEADER_LEN: usize = 56;

/// Thread kind for a data fork under [`ThreadClass::Data`].
pub const KIND_DATA_FORK: u16 = 0x0000;
/// Thread kind for a whole-disk image under [`ThreadClass::Data`].
pub const KIND_DISK_IMAGE: u16 = 0x0001;
/// Thread kind for a resource fork under [`ThreadClass::Data`].
pub const KIND_RESOURCE_FORK: u16 = 0x0002;
/// Thread kind for the in-archive filename under [`ThreadClass::FileName`].
pub const KIND_FILENAME: u16 = 0x0000;
/// Thread kind for a record comment under [`ThreadClass::Message`].
pub const KIND_COMMENT: u16 = 0x0001;

/// ProDOS access flag: file may be destroyed.
pub const ACCESS_DESTROY: u32 = 0x80;
/// ProDOS access flag: file may be renamed.
pub const ACCESS_RENAME: u32 = 0x40;
/// ProDOS access flag: file changed since last backup.
pub const ACCESS_BACKUP_NEEDED: u32 = 0x20;
/// ProDOS access flag: file is invisible.
pub const ACCESS_INVISIBLE: u32 = 0x04;
/// ProDOS access flag: file may be written.
pub const ACCESS_WRITE: u32 = 0x02;
/// ProDOS access flag: file may be read.
pub const ACCESS_READ: u32 = 0x01;

/// What a thread's byte stream is, per the classification word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadClass {
    Message,
    Control,
    Data,
    FileName,
    Unknown(u16),
}

impl ThreadClass {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => ThreadClass::Message,
            0x0001 => ThreadClass::Control,
            0x0002 => ThreadClass::Data,
            0x0003 => ThreadClass::FileName,
            other => ThreadClass::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            ThreadClass::Message => 0x0000,
            ThreadClass::Control => 0x0001,
            ThreadClass::Data => 0x0002,
            ThreadClass::FileName => 0x0003,
            ThreadClass::Unknown(raw) => raw,
        }
    }
}

/// How a thread's byte stream is compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFormat {
    Uncompressed,
    HuffmanSqueeze,
    DynamicLzw1,
    DynamicLzw2,
    Unix12,
    Unix16,
    Unknown(u16),
}

impl ThreadFormat {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => ThreadFormat::Uncompressed,
            0x0001 => ThreadFormat::HuffmanSqueeze,
            0x0002 => ThreadFormat::DynamicLzw1,
            0x0003 => ThreadFormat::DynamicLzw2,
            0x0004 => ThreadFormat::Unix12,
            0x0005 => ThreadFormat::Unix16,
            other => ThreadFormat::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            ThreadFormat::Uncompressed => 0x0000,
            ThreadFormat::HuffmanSqueeze => 0x0001,
            ThreadFormat::DynamicLzw1 => 0x0002,
            ThreadFormat::DynamicLzw2 => 0x0003,
            ThreadFormat::Unix12 => 0x0004,
            ThreadFormat::Unix16 => 0x0005,
            ThreadFormat::Unknown(raw) => raw,
        }
    }
}

/// The filesystem a record's file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystem {
    ProDos,
    Dos33,
    Dos32,
    Pascal,
    MacHfs,
    MacMfs,
    LisaFs,
    Cpm,
    CharFst,
    MsDos,
    HighSierra,
    Iso9660,
    AppleShare,
    Other(u16),
}

impl FileSystem {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0001 => FileSystem::ProDos,
            0x0002 => FileSystem::Dos33,
            0x0003 => FileSystem::Dos32,
            0x0004 => FileSystem::Pascal,
            0x0005 => FileSystem::MacHfs,
            0x0006 => FileSystem::MacMfs,
            0x0007 => FileSystem::LisaFs,
            0x0008 => FileSystem::Cpm,
            0x0009 => FileSystem::CharFst,
            0x000a => FileSystem::MsDos,
            0x000b => FileSystem::HighSierra,
            0x000c => FileSystem::Iso9660,
            0x000d => FileSystem::AppleShare,
            other => FileSystem::Other(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            FileSystem::ProDos => 0x0001,
            FileSystem::Dos33 => 0x0002,
            FileSystem::Dos32 => 0x0003,
            FileSystem::Pascal => 0x0004,
            FileSystem::MacHfs => 0x0005,
            FileSystem::MacMfs => 0x0006,
            FileSystem::LisaFs => 0x0007,
            FileSystem::Cpm => 0x0008,
            FileSystem::CharFst => 0x0009,
            FileSystem::MsDos => 0x000a,
            FileSystem::HighSierra => 0x000b,
            FileSystem::Iso9660 => 0x000c,
            FileSystem::AppleShare => 0x000d,
            FileSystem::Other(raw) => raw,
        }
    }
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0, MSB first, no final
/// XOR.  The accumulator threads through repeated calls, which is how the
/// LZW/1 stream CRC is built up across blocks.
pub fn crc16(mut crc: u16, data: &[u8]) -> u16 {
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

// --- Date/time decoding ---

/// Calendar date and time decoded from the 8-byte timestamp field used
/// throughout NuFX headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    /// 1-12.
    pub month: u8,
    /// 1-based; overflow from the hour cascade may pass the month's end.
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 0 = unknown, 1 = Sunday .. 7 = Saturday.
    pub weekday: u8,
}

/// Decode an 8-byte timestamp field.  Returns `None` for the all-zero
/// "unset" sentinel.
///
/// Field order on disk is second, minute, hour, year, day, month, filler,
/// weekday; day and month are stored 0-based, and the year counts from 1900
/// with values below 1940 rolled into the 2000s.  ShrinkIt wrote archives
/// with minutes and hours past their range, so those cascade upward rather
/// than being rejected.
pub fn decode_datetime(raw: &[u8; 8]) -> Result<Option<DateTime>, NufxError> {
    if raw.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    let [second, minute, hour, year, day, month, _filler, weekday] = *raw;
    if second > 59 {
        return Err(NufxError::OutOfRange(format!("second {} in timestamp", second)));
    }
    if day > 30 {
        return Err(NufxError::OutOfRange(format!("day {} in timestamp", day)));
    }
    if month > 11 {
        return Err(NufxError::OutOfRange(format!("month {} in timestamp", month)));
    }
    if weekday > 7 {
        return Err(NufxError::OutOfRange(format!("weekday {} in timestamp", weekday)));
    }

    let mut hour = hour as u16 + minute as u16 / 60;
    let minute = minute % 60;
    let day = day as u16 + 1 + hour / 24;
    hour %= 24;

    let mut year = 1900 + year as u16;
    if year < 1940 {
        year += 100;
    }

    Ok(Some(DateTime {
        year,
        month: month + 1,
        day: day as u8,
        hour: hour as u8,
        minute,
        second,
        weekday,
    }))
}

// --- Binary II envelope ---

/// ProDOS metadata carried by a Binary II transport envelope, with the
/// GS/OS high-byte extensions folded into the widened fields.
#[derive(Debug, Clone)]
pub struct Binary2Header {
    pub access: u16,
    pub file_type: u16,
    pub aux_type: u32,
    pub storage_type: u16,
    /// File size in 512-byte blocks.
    pub blocks: u32,
    /// ProDOS-packed date/time words, left undecoded.
    pub mod_date: u16,
    pub mod_time: u16,
    pub create_date: u16,
    pub create_time: u16,
    pub eof: u32,
    pub file_name: String,
    pub disk_space: u32,
    pub os_type: u8,
    pub native_file_type: u16,
    pub phantom: bool,
    pub data_flags: u8,
    pub version: u8,
    pub files_to_follow: u8,
}

impl Binary2Header {
    pub const LEN: usize = 128;

    /// Signature-driven detection: three id bytes at the start and the
    /// format id byte at offset 0x12.
    pub fn detect(block: &[u8]) -> bool {
        block.len() >= Self::LEN
            && block[0..3] == BINARY2_SIGNATURE
            && block[0x12] == BINARY2_ID
    }

    fn parse(block: &[u8; 128]) -> Self {
        // 0-2:     0A 47 4C
        // 3:       ProDOS access
        // 4:       ProDOS file type
        // 5-6:     aux type (low word)
        // 7:       storage type
        // 8-9:     size in blocks (low word)
        // 10-13:   modification date/time (ProDOS packed words)
        // 14-17:   creation date/time
        // 18:      id byte (0x02)
        // 20-22:   EOF (low 24 bits)
        // 23:      filename length
        // 24-87:   filename
        // 109-116: GS/OS high bytes (aux, access, type, storage, blocks, EOF)
        // 117-120: disk space needed
        // 121:     OS type
        // 122-123: native file type
        // 124:     phantom file flag
        // 125:     data flags
        // 126:     version
        // 127:     files to follow
        let mut name_len = block[23] as usize;
        if name_len > 64 {
            warn!("Binary II filename length {} clamped to 64", name_len);
            name_len = 64;
        }
        let file_name = String::from_utf8_lossy(&block[24..24 + name_len]).into_owned();

        Binary2Header {
            access: block[3] as u16 | (block[111] as u16) << 8,
            file_type: block[4] as u16 | (block[112] as u16) << 8,
            aux_type: u16::from_le_bytes([block[5], block[6]]) as u32
                | (u16::from_le_bytes([block[109], block[110]]) as u32) << 16,
            storage_type: block[7] as u16 | (block[113] as u16) << 8,
            blocks: u16::from_le_bytes([block[8], block[9]]) as u32
                | (u16::from_le_bytes([block[114], block[115]]) as u32) << 16,
            mod_date: u16::from_le_bytes([block[10], block[11]]),
            mod_time: u16::from_le_bytes([block[12], block[13]]),
            create_date: u16::from_le_bytes([block[14], block[15]]),
            create_time: u16::from_le_bytes([block[16], block[17]]),
            eof: u32::from_le_bytes([block[20], block[21], block[22], block[116]]),
            file_name,
            disk_space: u32::from_le_bytes([block[117], block[118], block[119], block[120]]),
            os_type: block[121],
            native_file_type: u16::from_le_bytes([block[122], block[123]]),
            phantom: block[124] != 0,
            data_flags: block[125],
            version: block[126],
            files_to_follow: block[127],
        }
    }
}

// --- Master header ---

/// The 48-byte header that opens every NuFX archive.
#[derive(Debug, Clone)]
pub struct MasterHeader {
    /// CRC-16 over the rest of the header; exposed, not validated.
    pub crc: u16,
    pub total_records: u32,
    pub create_when: [u8; 8],
    pub mod_when: [u8; 8],
    pub version: u16,
    /// Declared archive size.  Stored big-endian, unlike every other
    /// integer in the format.
    pub total_size: u32,
}

impl MasterHeader {
    pub const LEN: usize = 48;

    fn parse(block: &[u8; 48]) -> Result<Self, NufxError> {
        // 0-5:   master signature ("NuFile")
        // 6-7:   CRC-16 of bytes 8-47
        // 8-11:  total records
        // 12-19: archive creation date/time
        // 20-27: archive modification date/time
        // 28-29: master version
        // 30-37: reserved
        // 38-41: total archive size (big-endian)
        // 42-47: reserved
        if block[0..6] != MASTER_SIGNATURE {
            return Err(NufxError::InvalidInput("bad master header signature".into()));
        }
        let version = u16::from_le_bytes([block[28], block[29]]);
        if version > 2 {
            return Err(NufxError::InvalidInput(format!(
                "unsupported master version {}",
                version
            )));
        }
        let mut create_when = [0u8; 8];
        create_when.copy_from_slice(&block[12..20]);
        let mut mod_when = [0u8; 8];
        mod_when.copy_from_slice(&block[20..28]);

        Ok(MasterHeader {
            crc: u16::from_le_bytes([block[6], block[7]]),
            total_records: u32::from_le_bytes([block[8], block[9], block[10], block[11]]),
            create_when,
            mod_when,
            version,
            total_size: u32::from_be_bytes([block[38], block[39], block[40], block[41]]),
        })
    }

    /// Archive creation timestamp, decoded.
    pub fn created(&self) -> Result<Option<DateTime>, NufxError> {
        decode_datetime(&self.create_when)
    }

    /// Archive modification timestamp, decoded.
    pub fn modified(&self) -> Result<Option<DateTime>, NufxError> {
        decode_datetime(&self.mod_when)
    }
}

// --- Thread entries ---

/// One 16-byte entry from a record's thread table.
#[derive(Debug, Clone, Copy)]
pub struct ThreadEntry {
    pub class: ThreadClass,
    pub format: ThreadFormat,
    pub kind: u16,
    /// CRC-16 of the thread data; exposed, not validated.
    pub crc: u16,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
}

impl ThreadEntry {
    pub const LEN: usize = 16;

    fn parse(block: &[u8; 16]) -> Self {
        // 0-1:   classification  2-3:  format
        // 4-5:   kind            6-7:  CRC-16
        // 8-11:  uncompressed size
        // 12-15: compressed size
        ThreadEntry {
            class: ThreadClass::from_raw(u16::from_le_bytes([block[0], block[1]])),
            format: ThreadFormat::from_raw(u16::from_le_bytes([block[2], block[3]])),
            kind: u16::from_le_bytes([block[4], block[5]]),
            crc: u16::from_le_bytes([block[6], block[7]]),
            uncompressed_size: u32::from_le_bytes([block[8], block[9], block[10], block[11]]),
            compressed_size: u32::from_le_bytes([block[12], block[13], block[14], block[15]]),
        }
    }
}

// --- Records ---

/// HFS Finder info recovered from a GS/OS option list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinderInfo {
    pub file_type: [u8; 4],
    pub creator: [u8; 4],
    pub flags: u16,
}

/// One archived file or disk image: its attribute block, thread table, and
/// the location of its payload area.
#[derive(Debug, Clone)]
pub struct Record {
    /// CRC-16 of the attribute section; exposed, not validated.
    pub header_crc: u16,
    pub attrib_count: u16,
    pub version: u16,
    pub file_sys: FileSystem,
    /// Filesystem info word; the low byte is the path separator character.
    pub file_sys_info: u16,
    pub access: u32,
    pub file_type: u32,
    pub aux_type: u32,
    /// Storage type, or the block size for disk-image records.
    pub storage_type: u16,
    pub create_when: [u8; 8],
    pub mod_when: [u8; 8],
    pub archive_when: [u8; 8],
    /// Raw option list (record version >= 1 only).
    pub option_list: Vec<u8>,
    /// Attribute bytes between the known fields and the filename length word.
    pub extra_attributes: Vec<u8>,
    /// The header's filename field; empty when the name lives in a thread.
    pub raw_file_name: Vec<u8>,
    pub threads: Vec<ThreadEntry>,
    /// Absolute offset of the record's payload area.
    pub data_offset: u64,
    /// Total compressed length of all threads.
    pub data_length: u64,
}

impl Record {
    /// The filename carried in the header block, decoded per the record's
    /// filesystem.  A filename thread, when present, overrides this.
    pub fn header_file_name(&self) -> String {
        decode_file_name(&self.raw_file_name, self.file_sys)
    }

    /// The path separator character from the filesystem info word.
    pub fn separator(&self) -> char {
        (self.file_sys_info & 0xff) as u8 as char
    }

    pub fn created(&self) -> Result<Option<DateTime>, NufxError> {
        decode_datetime(&self.create_when)
    }

    pub fn modified(&self) -> Result<Option<DateTime>, NufxError> {
        decode_datetime(&self.mod_when)
    }

    pub fn archived(&self) -> Result<Option<DateTime>, NufxError> {
        decode_datetime(&self.archive_when)
    }

    /// First thread matching the classification and kind, with its index in
    /// the thread table.
    pub fn find_thread(&self, class: ThreadClass, kind: u16) -> Option<(usize, &ThreadEntry)> {
        self.threads
            .iter()
            .enumerate()
            .find(|(_, t)| t.class == class && t.kind == kind)
    }

    /// Absolute offset of a thread's payload: the record's data area plus
    /// the compressed sizes of every preceding thread.
    pub fn thread_offset(&self, index: usize) -> u64 {
        self.data_offset
            + self.threads[..index]
                .iter()
                .map(|t| t.compressed_size as u64)
                .sum::<u64>()
    }

    pub fn has_data_fork(&self) -> bool {
        self.find_thread(ThreadClass::Data, KIND_DATA_FORK).is_some()
    }

    pub fn has_resource_fork(&self) -> bool {
        self.find_thread(ThreadClass::Data, KIND_RESOURCE_FORK).is_some()
    }

    pub fn is_disk_image(&self) -> bool {
        self.find_thread(ThreadClass::Data, KIND_DISK_IMAGE).is_some()
    }

    /// HFS Finder info from the GS/OS option list, when one is present.
    ///
    /// The option list opens with a buffer-size word; the 32 bytes of
    /// Finder info sit at 0x0E..0x2E, so a buffer size below 0x2E (or past
    /// the stored bytes) is rejected.
    pub fn gsos_finder_info(&self) -> Result<Option<FinderInfo>, NufxError> {
        if self.option_list.is_empty() {
            return Ok(None);
        }
        if self.option_list.len() < 2 {
            return Err(NufxError::OutOfRange(
                "option list shorter than its buffer size word".into(),
            ));
        }
        let buffer_size = u16::from_le_bytes([self.option_list[0], self.option_list[1]]) as usize;
        if buffer_size < 0x2e || buffer_size > self.option_list.len() {
            return Err(NufxError::OutOfRange(format!(
                "option list buffer size {:#x} (have {} bytes)",
                buffer_size,
                self.option_list.len()
            )));
        }
        let mut file_type = [0u8; 4];
        file_type.copy_from_slice(&self.option_list[0x0e..0x12]);
        let mut creator = [0u8; 4];
        creator.copy_from_slice(&self.option_list[0x12..0x16]);
        // Finder info is HFS data, stored in Mac byte order
        let flags = u16::from_be_bytes([self.option_list[0x16], self.option_list[0x17]]);
        Ok(Some(FinderInfo {
            file_type,
            creator,
            flags,
        }))
    }
}

fn decode_file_name(bytes: &[u8], file_sys: FileSystem) -> String {
    match file_sys {
        FileSystem::MacHfs | FileSystem::MacMfs => MACINTOSH.decode(bytes).0.into_owned(),
        FileSystem::Dos33 | FileSystem::Dos32 => {
            // DOS 3.x names are stored in Apple II high ASCII
            bytes.iter().map(|&b| (b & 0x7f) as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

// --- Archive ---

/// A parsed NuFX archive over a seekable byte source.
///
/// Construction reads every header eagerly and builds the record index;
/// thread payloads are decoded lazily, on request.  Extraction methods take
/// `&mut self` because they seek the underlying source, so one archive
/// instance cannot run two extractions at once.
#[derive(Debug)]
pub struct NufxArchive<R> {
    source: R,
    binary2: Option<Binary2Header>,
    master: MasterHeader,
    records: Vec<Record>,
}

impl<'a> NufxArchive<Cursor<&'a [u8]>> {
    /// Parse an archive held entirely in memory.
    pub fn parse(data: &'a [u8]) -> Result<Self, NufxError> {
        Self::open(Cursor::new(data))
    }
}

impl<R: Read + Seek> NufxArchive<R> {
    /// Open an archive from a seekable source.  The source's position at
    /// the call becomes the archive's zero point.
    pub fn open(mut source: R) -> Result<Self, NufxError> {
        let start = source.stream_position()?;

        let mut probe = [0u8; Binary2Header::LEN];
        let got = read_at_most(&mut source, &mut probe)?;
        let binary2 = if got == Binary2Header::LEN && Binary2Header::detect(&probe) {
            debug!("Binary II envelope detected");
            Some(Binary2Header::parse(&probe))
        } else {
            None
        };
        let base = if binary2.is_some() {
            start + Binary2Header::LEN as u64
        } else {
            start
        };
        source.seek(SeekFrom::Start(base))?;

        let mut master_block = [0u8; MasterHeader::LEN];
        read_block(&mut source, &mut master_block, "master header")?;
        let master = MasterHeader::parse(&master_block)?;

        let mut records = Vec::with_capacity(master.total_records.min(256) as usize);
        for index in 0..master.total_records {
            let record = parse_record(&mut source).map_err(|e| {
                debug!("record {} failed to parse: {}", index, e);
                e
            })?;
            records.push(record);
        }

        Ok(NufxArchive {
            source,
            binary2,
            master,
            records,
        })
    }

    /// The Binary II envelope metadata, when the archive was wrapped.
    pub fn binary2_header(&self) -> Option<&Binary2Header> {
        self.binary2.as_ref()
    }

    pub fn master_header(&self) -> &MasterHeader {
        &self.master
    }

    /// The archive's records, in storage order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The record's filename: the filename thread when present, else the
    /// header's filename field (empty when neither exists).
    pub fn file_name(&mut self, index: usize) -> Result<String, NufxError> {
        let file_sys = self.record(index)?.file_sys;
        if let Some(bytes) = self.read_thread(index, ThreadClass::FileName, KIND_FILENAME)? {
            return Ok(decode_file_name(&bytes, file_sys));
        }
        Ok(self.records[index].header_file_name())
    }

    /// Decompressed data fork, or `None` when the record has none.
    pub fn data_fork(&mut self, index: usize) -> Result<Option<Vec<u8>>, NufxError> {
        self.read_thread(index, ThreadClass::Data, KIND_DATA_FORK)
    }

    /// Decompressed resource fork, or `None` when the record has none.
    pub fn resource_fork(&mut self, index: usize) -> Result<Option<Vec<u8>>, NufxError> {
        self.read_thread(index, ThreadClass::Data, KIND_RESOURCE_FORK)
    }

    /// Decompressed disk image, or `None` when the record has none.
    pub fn disk_image(&mut self, index: usize) -> Result<Option<Vec<u8>>, NufxError> {
        self.read_thread(index, ThreadClass::Data, KIND_DISK_IMAGE)
    }

    /// The record's comment thread, with trailing NULs trimmed.
    pub fn comment(&mut self, index: usize) -> Result<Option<String>, NufxError> {
        Ok(self
            .read_thread(index, ThreadClass::Message, KIND_COMMENT)?
            .map(|bytes| {
                let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
                String::from_utf8_lossy(&bytes[..end]).into_owned()
            }))
    }

    /// Stream the data fork into `sink`.  Returns false when the record has
    /// no data fork.
    pub fn extract_data_fork_to<W: Write>(
        &mut self,
        index: usize,
        sink: &mut W,
    ) -> Result<bool, NufxError> {
        self.extract_thread_to(index, ThreadClass::Data, KIND_DATA_FORK, sink)
    }

    /// Stream the resource fork into `sink`.
    pub fn extract_resource_fork_to<W: Write>(
        &mut self,
        index: usize,
        sink: &mut W,
    ) -> Result<bool, NufxError> {
        self.extract_thread_to(index, ThreadClass::Data, KIND_RESOURCE_FORK, sink)
    }

    /// Stream the disk image into `sink`.
    pub fn extract_disk_image_to<W: Write>(
        &mut self,
        index: usize,
        sink: &mut W,
    ) -> Result<bool, NufxError> {
        self.extract_thread_to(index, ThreadClass::Data, KIND_DISK_IMAGE, sink)
    }

    /// Decompress the first thread matching `(class, kind)` into `sink`.
    /// Returns false when the record has no such thread; writes arrive in
    /// 4 KiB steps except possibly the last.
    pub fn extract_thread_to<W: Write>(
        &mut self,
        index: usize,
        class: ThreadClass,
        kind: u16,
        sink: &mut W,
    ) -> Result<bool, NufxError> {
        let record = self.record(index)?;
        let (thread_index, thread) = match record.find_thread(class, kind) {
            Some((i, t)) => (i, *t),
            None => return Ok(false),
        };
        let offset = record.thread_offset(thread_index);
        let expected = expected_thread_size(record, &thread);

        self.source.seek(SeekFrom::Start(offset))?;
        let input = read_exact_vec(
            &mut self.source,
            thread.compressed_size as usize,
            "thread payload",
        )?;
        expand_thread(thread.format, &input, expected, sink)?;
        Ok(true)
    }

    fn record(&self, index: usize) -> Result<&Record, NufxError> {
        self.records.get(index).ok_or_else(|| {
            NufxError::InvalidInput(format!("record index {} out of range", index))
        })
    }

    fn read_thread(
        &mut self,
        index: usize,
        class: ThreadClass,
        kind: u16,
    ) -> Result<Option<Vec<u8>>, NufxError> {
        let mut buf = Vec::new();
        if self.extract_thread_to(index, class, kind, &mut buf)? {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }
}

fn parse_record<R: Read + Seek>(source: &mut R) -> Result<Record, NufxError> {
    // Header block layout (56 bytes):
    //   0-3:   record signature ("NuFX")
    //   4-5:   CRC-16 of the attribute section
    //   6-7:   attribute count, through the filename length word
    //   8-9:   record version
    //   10-13: thread count
    //   14-15: filesystem id
    //   16-17: filesystem info (separator char in the low byte)
    //   18-21: access flags
    //   22-25: file type
    //   26-29: aux type
    //   30-31: storage type, or block size for disk images
    //   32-39: creation date/time
    //   40-47: modification date/time
    //   48-55: archived date/time
    let offset = source.stream_position()?;
    let mut header = [0u8; RECORD_HEADER_LEN];
    read_block(source, &mut header, "record header")?;
    if header[0..4] != RECORD_SIGNATURE {
        debug!("bad record signature at {:#x}", offset);
        return Err(NufxError::InvalidInput(format!(
            "bad record signature at offset {:#x}",
            offset
        )));
    }
    let attrib_count = u16::from_le_bytes([header[6], header[7]]);
    if (attrib_count as usize) < RECORD_HEADER_LEN {
        return Err(NufxError::InvalidInput(format!(
            "attribute count {} below the header block size",
            attrib_count
        )));
    }
    let version = u16::from_le_bytes([header[8], header[9]]);
    if version > 3 {
        return Err(NufxError::InvalidInput(format!(
            "unsupported record version {}",
            version
        )));
    }
    let total_threads = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);

    let mut create_when = [0u8; 8];
    create_when.copy_from_slice(&header[32..40]);
    let mut mod_when = [0u8; 8];
    mod_when.copy_from_slice(&header[40..48]);
    let mut archive_when = [0u8; 8];
    archive_when.copy_from_slice(&header[48..56]);

    // Option list (version >= 1), then whatever attribute bytes remain
    // before the filename length word.
    let mut consumed = RECORD_HEADER_LEN;
    let mut option_list = Vec::new();
    if version >= 1 {
        let option_size = read_u16_le(source, "option list size")? as usize;
        consumed += 2;
        option_list = read_exact_vec(source, option_size, "option list")?;
        consumed += option_size;
    }
    let attrib_limit = attrib_count as usize - 2;
    if consumed > attrib_limit {
        return Err(NufxError::InvalidInput(format!(
            "record attributes overrun: {} bytes consumed of {}",
            consumed, attrib_limit
        )));
    }
    let extra_attributes = read_exact_vec(source, attrib_limit - consumed, "extra attributes")?;

    let name_len = read_u16_le(source, "filename length")? as usize;
    let raw_file_name = read_exact_vec(source, name_len, "filename field")?;

    let mut threads = Vec::with_capacity((total_threads as usize).min(64));
    let mut data_length = 0u64;
    for _ in 0..total_threads {
        let mut block = [0u8; ThreadEntry::LEN];
        read_block(source, &mut block, "thread entry")?;
        let thread = ThreadEntry::parse(&block);
        data_length += thread.compressed_size as u64;
        threads.push(thread);
    }

    let data_offset = source.stream_position()?;
    source.seek(SeekFrom::Start(data_offset + data_length))?;

    Ok(Record {
        header_crc: u16::from_le_bytes([header[4], header[5]]),
        attrib_count,
        version,
        file_sys: FileSystem::from_raw(u16::from_le_bytes([header[14], header[15]])),
        file_sys_info: u16::from_le_bytes([header[16], header[17]]),
        access: u32::from_le_bytes([header[18], header[19], header[20], header[21]]),
        file_type: u32::from_le_bytes([header[22], header[23], header[24], header[25]]),
        aux_type: u32::from_le_bytes([header[26], header[27], header[28], header[29]]),
        storage_type: u16::from_le_bytes([header[30], header[31]]),
        create_when,
        mod_when,
        archive_when,
        option_list,
        extra_attributes,
        raw_file_name,
        threads,
        data_offset,
        data_length,
    })
}

// --- Thread decompression ---

const LZW_BLOCK_SIZE: usize = 4096;
const LZW_CLEAR_CODE: u16 = 0x0100;
const LZW_FIRST_CODE: u16 = 0x0101;
const LZW_MAX_CODE: u16 = 0x0fff;
const LZW_TABLE_SIZE: usize = 4096 - 256;

fn expected_thread_size(record: &Record, thread: &ThreadEntry) -> usize {
    if thread.class == ThreadClass::Data
        && thread.kind == KIND_DISK_IMAGE
        && thread.uncompressed_size == 0
    {
        // ProDOS 8 ShrinkIt writes a zero EOF on disk image threads; the
        // real size is the block count times the block size.  A small value
        // in the storage type field is an ordinary storage type rather than
        // a block size.
        let block_size = if record.storage_type > 13 {
            record.storage_type as u64
        } else {
            512
        };
        (record.aux_type as u64 * block_size) as usize
    } else {
        thread.uncompressed_size as usize
    }
}

fn expand_thread<W: Write>(
    format: ThreadFormat,
    input: &[u8],
    expected_len: usize,
    sink: &mut W,
) -> Result<(), NufxError> {
    match format {
        ThreadFormat::Uncompressed => {
            // Threads stored short of their declared size are zero padded
            let n = expected_len.min(input.len());
            sink.write_all(&input[..n])?;
            let mut short = expected_len - n;
            let zeroes = [0u8; 512];
            while short > 0 {
                let chunk = short.min(zeroes.len());
                sink.write_all(&zeroes[..chunk])?;
                short -= chunk;
            }
            Ok(())
        }
        ThreadFormat::DynamicLzw1 => expand_lzw_thread(LzwVariant::Lzw1, input, expected_len, sink),
        ThreadFormat::DynamicLzw2 => expand_lzw_thread(LzwVariant::Lzw2, input, expected_len, sink),
        other => {
            warn!("unsupported thread format {:#06x}", other.raw());
            Err(NufxError::UnsupportedFormat(other.raw()))
        }
    }
}

fn expand_lzw_thread<W: Write>(
    variant: LzwVariant,
    input: &[u8],
    expected_len: usize,
    sink: &mut W,
) -> Result<(), NufxError> {
    if expected_len == 0 {
        return Ok(());
    }
    let mut pos = 0usize;

    // Thread header: LZW/1 leads with the CRC of the decompressed block
    // stream; both variants then carry the disk volume and RLE escape bytes.
    let stored_crc = if variant == LzwVariant::Lzw1 {
        Some(take_u16_le(input, &mut pos)?)
    } else {
        None
    };
    let _volume = take_u8(input, &mut pos)?;
    let escape = take_u8(input, &mut pos)?;

    let mut expander = LzwExpander::new(variant);
    let mut scratch = Vec::with_capacity(LZW_BLOCK_SIZE);
    let mut block = [0u8; LZW_BLOCK_SIZE];
    let mut crc = 0u16;
    let mut remaining = expected_len;

    while remaining > 0 {
        let write_len = remaining.min(LZW_BLOCK_SIZE);

        let (lzw_used, rle_len, lzw_len) = match variant {
            LzwVariant::Lzw1 => {
                // 2-byte RLE length, then a one-byte LZW flag
                let rle_len = take_u16_le(input, &mut pos)? as usize;
                let flag = take_u8(input, &mut pos)?;
                if flag > 1 {
                    return Err(NufxError::CorruptedStream(format!(
                        "bad LZW/1 block flag {}",
                        flag
                    )));
                }
                (flag == 1, rle_len, None)
            }
            LzwVariant::Lzw2 => {
                // One word: bit 15 is the LZW flag, the low bits the RLE
                // length; LZW blocks follow with their total length.
                let word = take_u16_le(input, &mut pos)?;
                let lzw_used = word & 0x8000 != 0;
                let rle_len = (word & 0x1fff) as usize;
                let lzw_len = if lzw_used {
                    Some(take_u16_le(input, &mut pos)? as usize)
                } else {
                    None
                };
                (lzw_used, rle_len, lzw_len)
            }
        };
        if rle_len > LZW_BLOCK_SIZE {
            return Err(NufxError::CorruptedStream(format!(
                "RLE length {} exceeds the block size",
                rle_len
            )));
        }
        let rle_used = rle_len != LZW_BLOCK_SIZE;

        if lzw_used {
            let consumed = expander.expand_block(&input[pos..], rle_len, &mut scratch)?;
            if let Some(lzw_len) = lzw_len {
                // The declared length covers the four block header bytes too
                if lzw_len < 4 || consumed != lzw_len - 4 {
                    return Err(NufxError::CorruptedStream(format!(
                        "LZW/2 block input length mismatch: consumed {}, declared {}",
                        consumed,
                        lzw_len.saturating_sub(4)
                    )));
                }
            }
            pos += consumed;
            if rle_used {
                expand_rle(&scratch, escape, &mut block)?;
            } else {
                block[..scratch.len()].copy_from_slice(&scratch);
                block[scratch.len()..].fill(0);
            }
        } else {
            if variant == LzwVariant::Lzw2 {
                expander.reset();
            }
            if rle_used {
                let raw = input
                    .get(pos..pos + rle_len)
                    .ok_or_else(thread_data_exhausted)?;
                pos += rle_len;
                expand_rle(raw, escape, &mut block)?;
            } else {
                let raw = input
                    .get(pos..pos + LZW_BLOCK_SIZE)
                    .ok_or_else(thread_data_exhausted)?;
                pos += LZW_BLOCK_SIZE;
                block.copy_from_slice(raw);
            }
        }

        if variant == LzwVariant::Lzw1 {
            // The stream CRC covers the whole padded block, not just the
            // bytes written out
            crc = crc16(crc, &block);
        }
        sink.write_all(&block[..write_len])?;
        remaining -= write_len;
    }

    if let Some(stored) = stored_crc {
        if crc != stored {
            return Err(NufxError::CorruptedStream(format!(
                "LZW/1 stream CRC mismatch: stored {:#06x}, computed {:#06x}",
                stored, crc
            )));
        }
    }
    Ok(())
}

// --- RLE expander ---

/// Expand `input` into one full 4 KiB block under the thread's escape byte.
/// Run counts are stored zero based; a run that would pass the end of the
/// block is truncated there and parsing stops.
fn expand_rle(input: &[u8], escape: u8, block: &mut [u8; LZW_BLOCK_SIZE]) -> Result<(), NufxError> {
    let mut out = 0usize;
    let mut pos = 0usize;
    while out < LZW_BLOCK_SIZE {
        let b = *input.get(pos).ok_or_else(rle_underrun)?;
        pos += 1;
        if b != escape {
            block[out] = b;
            out += 1;
            continue;
        }
        let ch = *input.get(pos).ok_or_else(rle_underrun)?;
        let count = *input.get(pos + 1).ok_or_else(rle_underrun)?;
        pos += 2;
        let run = (count as usize + 1).min(LZW_BLOCK_SIZE - out);
        block[out..out + run].fill(ch);
        out += run;
    }
    Ok(())
}

fn rle_underrun() -> NufxError {
    NufxError::CorruptedStream("RLE input exhausted before the block was full".into())
}

fn thread_data_exhausted() -> NufxError {
    NufxError::CorruptedStream("unexpected end of thread data".into())
}

// --- Bit reader ---

/// Width of the next code and the mask that trims it, indexed by
/// `(entry + 1) >> 8`.
const CODE_WIDTHS: [u32; 17] = [8, 9, 10, 10, 11, 11, 11, 11, 12, 12, 12, 12, 12, 12, 12, 12, 12];
const CODE_MASKS: [u16; 17] = [
    0x0000, 0x01ff, 0x03ff, 0x03ff, 0x07ff, 0x07ff, 0x07ff, 0x07ff, 0x0fff, 0x0fff, 0x0fff,
    0x0fff, 0x0fff, 0x0fff, 0x0fff, 0x0fff, 0x0fff,
];

/// Extracts variable-width little-endian LZW codes.  The last fetched byte
/// is carried so the next code resumes mid-byte when the previous one did
/// not end on a byte boundary.
struct CodeReader<'a> {
    input: &'a [u8],
    pos: usize,
    bit_pos: u32,
    carry: u8,
}

impl<'a> CodeReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        CodeReader {
            input,
            pos: 0,
            bit_pos: 0,
            carry: 0,
        }
    }

    /// Bytes fetched so far, counting a partially consumed trailing byte.
    fn consumed(&self) -> usize {
        self.pos
    }

    fn fetch(&mut self) -> Result<u8, NufxError> {
        let b = *self
            .input
            .get(self.pos)
            .ok_or_else(|| NufxError::CorruptedStream("LZW input exhausted".into()))?;
        self.pos += 1;
        self.carry = b;
        Ok(b)
    }

    /// The next code, at the width implied by the current table fill.
    fn get_code(&mut self, entry: u16) -> Result<u16, NufxError> {
        let index = ((entry as usize + 1) >> 8).min(CODE_WIDTHS.len() - 1);
        let width = CODE_WIDTHS[index];
        let mask = CODE_MASKS[index];

        let start = self.bit_pos;
        let mut acc = if start == 0 {
            self.fetch()? as u32
        } else {
            self.carry as u32
        };
        let mut avail = 8;
        while avail < start + width {
            acc |= (self.fetch()? as u32) << avail;
            avail += 8;
        }
        self.bit_pos = (start + width) % 8;
        Ok(((acc >> start) as u16) & mask)
    }
}

// --- Dynamic LZW engine ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LzwVariant {
    Lzw1,
    Lzw2,
}

/// The shared LZW/1 / LZW/2 string-table engine.  Strings are held as a
/// trie: `trie_ch[i]` is the terminal byte of the string with code
/// `i + 0x100`, `trie_prefix[i]` its parent code; `stack` reverses a string
/// during reconstruction.
struct LzwExpander {
    variant: LzwVariant,
    trie_ch: [u8; LZW_TABLE_SIZE],
    trie_prefix: [u16; LZW_TABLE_SIZE],
    stack: Vec<u8>,
    entry: u16,
    old_code: u16,
    final_ch: u8,
    reset_fix: bool,
}

impl LzwExpander {
    fn new(variant: LzwVariant) -> Self {
        LzwExpander {
            variant,
            trie_ch: [0; LZW_TABLE_SIZE],
            trie_prefix: [0; LZW_TABLE_SIZE],
            stack: Vec::with_capacity(LZW_BLOCK_SIZE),
            entry: LZW_FIRST_CODE,
            old_code: 0,
            final_ch: 0,
            reset_fix: false,
        }
    }

    /// Forget the string table.  Used when an LZW/2 thread stores a block
    /// without LZW.
    fn reset(&mut self) {
        self.entry = LZW_FIRST_CODE;
        self.reset_fix = false;
    }

    /// Decode one block's codes from `input`, emitting exactly `expected`
    /// bytes into `out`.  Returns the number of input bytes consumed.
    fn expand_block(
        &mut self,
        input: &[u8],
        expected: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, NufxError> {
        let mut reader = CodeReader::new(input);
        out.clear();

        if self.variant == LzwVariant::Lzw1 {
            // LZW/1 tables never outlive a block
            self.entry = LZW_FIRST_CODE;
        }

        // A fresh table means the next code must be a bare literal -- unless
        // the previous block ended right after a clear code, in which case
        // that literal was already consumed there.
        let mut at_start = self.entry == LZW_FIRST_CODE && !self.reset_fix;
        self.reset_fix = false;
        let mut cleared = false;

        while out.len() < expected {
            let code = reader.get_code(self.entry)?;

            if at_start {
                if code > 0xff {
                    return Err(NufxError::CorruptedStream(format!(
                        "invalid initial LZW symbol {:#06x}",
                        code
                    )));
                }
                out.push(code as u8);
                self.old_code = code;
                self.final_ch = code as u8;
                at_start = false;
                if cleared && out.len() == expected {
                    // The clear code was the penultimate code of this block;
                    // the next block must not reset again
                    self.reset_fix = true;
                }
                continue;
            }

            if self.variant == LzwVariant::Lzw2 && code == LZW_CLEAR_CODE {
                self.entry = LZW_FIRST_CODE;
                at_start = true;
                cleared = true;
                continue;
            }

            if code > self.entry {
                return Err(NufxError::CorruptedStream(format!(
                    "LZW code {:#06x} beyond table entry {:#06x}",
                    code, self.entry
                )));
            }
            let mut ptr = code;
            if code == self.entry {
                // KwKwK: the code names the string being defined
                self.stack.push(self.final_ch);
                ptr = self.old_code;
            }
            while ptr > 0xff {
                let i = (ptr - 0x100) as usize;
                self.stack.push(self.trie_ch[i]);
                ptr = self.trie_prefix[i];
            }
            self.final_ch = ptr as u8;

            if out.len() + 1 + self.stack.len() > expected {
                self.stack.clear();
                return Err(NufxError::CorruptedStream(
                    "LZW output overran the block".into(),
                ));
            }
            out.push(self.final_ch);
            while let Some(b) = self.stack.pop() {
                out.push(b);
            }

            if self.entry <= LZW_MAX_CODE {
                let i = (self.entry - 0x100) as usize;
                self.trie_ch[i] = self.final_ch;
                self.trie_prefix[i] = self.old_code;
                self.entry += 1;
            } else {
                debug!("LZW string table full; entry not recorded");
            }
            self.old_code = code;
        }

        Ok(reader.consumed())
    }
}

// --- Read helpers ---

fn read_block<R: Read>(source: &mut R, buf: &mut [u8], what: &str) -> Result<(), NufxError> {
    source.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NufxError::InvalidInput(format!("short read in {}", what))
        } else {
            NufxError::Io(e)
        }
    })
}

fn read_u16_le<R: Read>(source: &mut R, what: &str) -> Result<u16, NufxError> {
    let mut buf = [0u8; 2];
    read_block(source, &mut buf, what)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_exact_vec<R: Read>(source: &mut R, len: usize, what: &str) -> Result<Vec<u8>, NufxError> {
    let mut buf = vec![0u8; len];
    read_block(source, &mut buf, what)?;
    Ok(buf)
}

fn read_at_most<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, NufxError> {
    let mut got = 0;
    while got < buf.len() {
        let n = source.read(&mut buf[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

fn take_u8(input: &[u8], pos: &mut usize) -> Result<u8, NufxError> {
    let b = *input.get(*pos).ok_or_else(thread_data_exhausted)?;
    *pos += 1;
    Ok(b)
}

fn take_u16_le(input: &[u8], pos: &mut usize) -> Result<u16, NufxError> {
    let lo = take_u8(input, pos)?;
    let hi = take_u8(input, pos)?;
    Ok(u16::from_le_bytes([lo, hi]))
}
