//! ## IMD container header and comment codec
//!
//! The container opens with an ASCII line of the form
//! `IMD <version>: <DD>/<MM>/<YYYY> <hh>:<mm>:<ss>` terminated by CR/LF,
//! followed by a free-form comment terminated by `0x1A`.  Everything after
//! the terminator belongs to the track stream.
//!
//! Reads are byte-wise on purpose: the comment begins immediately after the
//! line terminator, so the header reader must not consume ahead.

use std::io::{Read, Seek, SeekFrom, Write};
use chrono;
use log::{debug, trace};
use regex::Regex;
use crate::{Error, COMMENT_TERMINATOR};

/// Version written when the loaded header had none worth keeping.
pub const DEFAULT_VERSION: &str = "1.19";

/// Longest header line we will scan before giving up.
const MAX_HEADER_LINE: usize = 256;

/// Parsed form of the ASCII header line.
///
/// When the line fails strict parsing the timestamp fields are all zero, and
/// the version degrades to `"Unknown"` if even it cannot be extracted.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HeaderInfo {
    pub version: String,
    pub day: u8,
    pub month: u8,
    pub year: u16,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

fn read_byte<R: Read>(f: &mut R) -> Result<Option<u8>, Error> {
    let mut byte = [0u8; 1];
    loop {
        match f.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return Err(Error::ReadFailed),
        }
    }
}

/// Read the header line, consuming its CR/LF terminator (either order, and a
/// lone CR or LF is tolerated).  Returns the line without the terminator.
fn read_header_line<R: Read + Seek>(f: &mut R) -> Result<Vec<u8>, Error> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        match read_byte(f)? {
            None => {
                if line.is_empty() {
                    return Err(Error::ReadFailed);
                }
                return Ok(line);
            }
            Some(b) if b == b'\r' || b == b'\n' => {
                let other = if b == b'\r' { b'\n' } else { b'\r' };
                match read_byte(f)? {
                    Some(next) if next == other => {}
                    Some(_) => {
                        f.seek(SeekFrom::Current(-1)).map_err(|_| Error::SeekFailed)?;
                    }
                    None => {}
                }
                return Ok(line);
            }
            Some(b) => {
                if line.len() >= MAX_HEADER_LINE {
                    return Ok(line);
                }
                line.push(b);
            }
        }
    }
}

/// Read and parse the header line at the current position (normally offset
/// zero).  A missing `IMD ` prefix is a format error; a line that has the
/// prefix but an unparseable remainder degrades per [`HeaderInfo`].
pub fn read_header<R: Read + Seek>(f: &mut R) -> Result<HeaderInfo, Error> {
    let raw = read_header_line(f)?;
    let line = String::from_utf8_lossy(&raw);
    if !line.starts_with("IMD ") {
        debug!("header prefix 'IMD ' not found");
        return Err(Error::BadRecord);
    }
    let mut info = HeaderInfo::default();
    let full = Regex::new(r"^IMD ([^:]{1,31}): (\d{1,4})/(\d{1,4})/(\d{1,5}) (\d{1,4}):(\d{1,4}):(\d{1,4})")
        .expect("failed to parse regex");
    if let Some(caps) = full.captures(&line) {
        info.version = caps[1].to_string();
        let nums: Vec<u32> = (2..8).map(|i| caps[i].parse().unwrap_or(u32::MAX)).collect();
        let (day, month, year) = (nums[0], nums[1], nums[2]);
        let (hour, minute, second) = (nums[3], nums[4], nums[5]);
        // day check is simplistic on purpose, month lengths are not modeled
        if (1..=12).contains(&month) && (1..=31).contains(&day) && year <= u16::MAX as u32
            && hour <= 23 && minute <= 59 && second <= 59 {
            info.day = day as u8;
            info.month = month as u8;
            info.year = year as u16;
            info.hour = hour as u8;
            info.minute = minute as u8;
            info.second = second as u8;
        } else {
            debug!("header date/time out of range, zeroing fields");
        }
        return Ok(info);
    }
    // the version alone can still be salvaged from a line with no timestamp
    let version_only = Regex::new(r"^IMD ([^:]{1,31})").expect("failed to parse regex");
    info.version = match version_only.captures(&line) {
        Some(caps) => caps[1].to_string(),
        None => {
            debug!("could not extract version from header line");
            "Unknown".to_string()
        }
    };
    trace!("header parsed partially: version {}", info.version);
    Ok(info)
}

/// Read the comment block from the current position up to, but not
/// including, the `0x1A` terminator.  EOF before the terminator is fatal.
pub fn read_comment<R: Read>(f: &mut R) -> Result<Vec<u8>, Error> {
    let mut comment: Vec<u8> = Vec::new();
    loop {
        match read_byte(f)? {
            Some(COMMENT_TERMINATOR) => return Ok(comment),
            Some(b) => comment.push(b),
            None => {
                debug!("end of file before comment terminator");
                return Err(Error::ReadFailed);
            }
        }
    }
}

/// Same scan as [`read_comment`] without keeping the bytes.
pub fn skip_comment<R: Read>(f: &mut R) -> Result<(), Error> {
    loop {
        match read_byte(f)? {
            Some(COMMENT_TERMINATOR) => return Ok(()),
            Some(_) => {}
            None => {
                debug!("end of file before comment terminator");
                return Err(Error::ReadFailed);
            }
        }
    }
}

/// Write the header line stamped with the current local time.  An empty or
/// `"Unknown"` version is replaced by [`DEFAULT_VERSION`].
pub fn write_header<W: Write>(f: &mut W, version: &str) -> Result<(), Error> {
    let version = match version {
        "" | "Unknown" => DEFAULT_VERSION,
        v => v,
    };
    let now = chrono::Local::now().naive_local();
    let line = format!("IMD {}: {}\r\n", version, now.format("%d/%m/%Y %H:%M:%S"));
    f.write_all(line.as_bytes()).map_err(|_| Error::WriteFailed)
}

/// Write the comment bytes followed by the `0x1A` terminator.
pub fn write_comment<W: Write>(f: &mut W, comment: &[u8]) -> Result<(), Error> {
    f.write_all(comment).map_err(|_| Error::WriteFailed)?;
    f.write_all(&[COMMENT_TERMINATOR]).map_err(|_| Error::WriteFailed)
}
