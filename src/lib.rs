//! # `imdkit` main library
//!
//! This library manipulates ImageDisk (IMD) floppy disk images, the archival
//! format produced by Dave Dunfield's ImageDisk tools and widely used for
//! vintage diskettes.  Manipulations can be done at a level as low as a single
//! track record, or as high as sector edits that are persisted to the backing
//! file as they happen.
//!
//! ## Architecture
//!
//! The crate is organized around three layers:
//! * `file` and `track` form the container codec: they parse and emit the
//!   ASCII header line, the comment block, and the per-track records with
//!   their seven sector-data variants.
//! * `image` holds a whole image in memory and keeps the backing file in
//!   sync: every sector or track write rewrites the file and truncates it to
//!   the new logical size.
//! * `chk` is a one-pass consistency checker that scans track metadata
//!   without materializing sector data.
//!
//! The track readers return `Ok(None)` on a clean end of file at a record
//! boundary; any other short read is an error, and the stream is restored to
//! the record's starting offset so the caller can re-scan.
//!
//! ## The IMD container
//!
//! A valid file is exactly: header line, comment bytes, `0x1A`, zero or more
//! track records, immediate EOF.  Track records are self-delimiting; there
//! are no length prefixes and no footer.  Compressed sector records store a
//! single repeating byte and are only legal when the sector really is
//! byte-uniform; the `image` layer enforces this across edits.

pub mod file;
pub mod track;
pub mod image;
pub mod chk;

use std::fmt;
use num_derive::FromPrimitive;

pub fn file_extensions() -> Vec<String> {
    vec!["imd".to_string()]
}

/// Sector sizes indexed by the 3-bit size code in the track header.
pub const SECTOR_SIZES: [usize; 7] = [128, 256, 512, 1024, 2048, 4096, 8192];

/// Smallest sector size; all others are power-of-two multiples.
pub const SECTOR_SIZE_BASE: usize = 128;

/// Fill value for sectors whose data could not be read from the diskette.
pub const FILL_BYTE_DEFAULT: u8 = 0xe5;

/// Terminates the comment block; never appears inside it.
pub const COMMENT_TERMINATOR: u8 = 0x1a;

/// Upper bound on per-track maps; the sector count itself is a single byte.
pub const MAX_SECTORS_PER_TRACK: usize = 256;

/// Number of recording modes (FM/MFM at 250/300/500 kbps).
pub const NUM_MODES: usize = 6;

/// Bit 7 of the head byte: cylinder map present.
pub const CYL_MAP_FLAG: u8 = 0x80;
/// Bit 6 of the head byte: head map present.
pub const HEAD_MAP_FLAG: u8 = 0x40;
/// Low nibble of the head byte: physical head number.
pub const HEAD_MASK: u8 = 0x0f;
/// High nibble of the head byte: map-presence flags.
pub const HFLAG_MASK: u8 = 0xf0;

/// Enumerates codec-level errors.  The `Display` trait will print the
/// equivalent long message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("read failed or unexpected end of file")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("seek failed")]
    SeekFailed,
    #[error("record structure was invalid")]
    BadRecord,
    #[error("sector not found")]
    SectorNotFound,
    #[error("track not found")]
    TrackNotFound,
    #[error("sector data unavailable")]
    Unavailable,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("data size mismatch")]
    SizeMismatch,
}

/// Recording rate and density a track was read at.  The mode is recorded in
/// the container and passed through; this library never interprets it.
#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Fm500Kbps = 0,
    Fm300Kbps = 1,
    Fm250Kbps = 2,
    Mfm500Kbps = 3,
    Mfm300Kbps = 4,
    Mfm250Kbps = 5,
}

/// Allows the mode to be displayed to the console using `println!`.  This
/// also derives `to_string`, so the enum can be converted to `String`.
impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Fm500Kbps => write!(f, "500 kbps FM"),
            Mode::Fm300Kbps => write!(f, "300 kbps FM"),
            Mode::Fm250Kbps => write!(f, "250 kbps FM"),
            Mode::Mfm500Kbps => write!(f, "500 kbps MFM"),
            Mode::Mfm300Kbps => write!(f, "300 kbps MFM"),
            Mode::Mfm250Kbps => write!(f, "250 kbps MFM"),
        }
    }
}

/// Decoded form of the sector-data-record flag byte.
///
/// The wire values are `0x00` for [`SectorFlag::Unavailable`] and
/// `0x01..=0x08` for the eight [`SectorFlag::Data`] combinations; the bits of
/// `byte - 1` give compressed / deleted / error.  Any other byte is a format
/// error, so every in-memory flag is valid by construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SectorFlag {
    /// The sector could not be read; no data bytes follow the flag.
    Unavailable,
    /// The sector carries data, possibly as a single repeating byte.
    Data { compressed: bool, deleted: bool, error: bool },
}

impl SectorFlag {
    /// Plain readable data, the initial state of freshly written sectors.
    pub const NORMAL: SectorFlag = SectorFlag::Data { compressed: false, deleted: false, error: false };

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(SectorFlag::Unavailable),
            0x01..=0x08 => {
                let bits = byte - 1;
                Some(SectorFlag::Data {
                    compressed: bits & 0x01 != 0,
                    deleted: bits & 0x02 != 0,
                    error: bits & 0x04 != 0,
                })
            }
            _ => None,
        }
    }
    pub fn to_byte(self) -> u8 {
        match self {
            SectorFlag::Unavailable => 0x00,
            SectorFlag::Data { compressed, deleted, error } => {
                1 + (compressed as u8) + ((deleted as u8) << 1) + ((error as u8) << 2)
            }
        }
    }
    /// True unless the sector is unavailable.  Note a deleted sector that was
    /// read with a data error still counts as having data.
    pub fn has_data(&self) -> bool {
        !matches!(self, SectorFlag::Unavailable)
    }
    pub fn is_compressed(&self) -> bool {
        matches!(self, SectorFlag::Data { compressed: true, .. })
    }
    /// Deleted-data address mark was present.
    pub fn has_dam(&self) -> bool {
        matches!(self, SectorFlag::Data { deleted: true, .. })
    }
    /// A data error occurred while the sector was read.
    pub fn has_err(&self) -> bool {
        matches!(self, SectorFlag::Data { error: true, .. })
    }
}

/// Sector size in bytes for a 3-bit size code, or None if the code is out of
/// range.
pub fn sector_size_from_code(code: u8) -> Option<usize> {
    SECTOR_SIZES.get(code as usize).copied()
}

/// Inverse of `sector_size_from_code`.
pub fn sector_code_from_size(size: usize) -> Option<u8> {
    SECTOR_SIZES.iter().position(|s| *s == size).map(|i| i as u8)
}

pub fn is_slice_uniform(slice: &[u8]) -> bool {
    if slice.len() < 1 {
        return true;
    }
    let test = slice[0];
    for i in 1..slice.len() {
        if slice[i] != test {
            return false;
        }
    }
    true
}
