//! ## IMD track record codec and transforms
//!
//! A track record is a 5-byte header (mode, cylinder, head byte, sector
//! count, size code), the sector numbering map, optional cylinder and head
//! maps (announced by bits 7 and 6 of the head byte), and one sector data
//! record per sector.  A sector data record is a flag byte followed by
//! nothing (unavailable), one byte (compressed), or `sector_size` bytes.
//!
//! Three readers share the header-and-maps parser and differ in how deep
//! they go into the data records.  All of them restore the stream to the
//! record's starting offset when a record turns out to be short or invalid,
//! so callers can distinguish a clean end of file (`Ok(None)`) from a
//! truncated one (`Err`) and can re-scan after either.

use std::io::{Read, Seek, SeekFrom, Write};
use num_traits::FromPrimitive;
use log::{debug, trace, warn};
use crate::file;
use crate::{Error, Mode, SectorFlag, is_slice_uniform, sector_size_from_code};
use crate::{CYL_MAP_FLAG, HEAD_MAP_FLAG, HEAD_MASK, HFLAG_MASK, NUM_MODES};

/// How the write pipeline decides between compressed and normal records.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompressionMode {
    /// Uniform sectors are written compressed.  Note this applies even when
    /// the sector was stored normal in the source: uniformity alone decides.
    AsRead,
    /// Compress every sector whose data is uniform.
    ForceCompress,
    /// Write every sector as a normal record regardless of uniformity.
    ForceDecompress,
}

/// Sector ordering applied to a track as it is written out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interleave {
    /// Keep the physical order of the in-memory track.
    AsRead,
    /// Reorder with this physical stride between logically adjacent sectors.
    Factor(u8),
    /// Estimate the stride from the sector map first, then reorder.
    BestGuess,
}

/// Processing options applied by [`Track::write_imd`] and
/// [`Track::write_bin`].
#[derive(Clone, Debug)]
pub struct WriteOpts {
    pub compression: CompressionMode,
    /// Clear the data-error bit on every sector written.
    pub force_non_bad: bool,
    /// Clear the deleted-data address mark on every sector written.
    pub force_non_deleted: bool,
    /// Mode translation table: `tmode[read_mode] = written_mode`.
    pub tmode: [u8; NUM_MODES],
    pub interleave: Interleave,
}

impl Default for WriteOpts {
    fn default() -> Self {
        Self {
            compression: CompressionMode::AsRead,
            force_non_bad: false,
            force_non_deleted: false,
            tmode: [0, 1, 2, 3, 4, 5],
            interleave: Interleave::AsRead,
        }
    }
}

/// One track of an IMD image.
///
/// `smap`, `cmap`, `hmap` and `sflag` are parallel arrays indexed by
/// physical position on the track.  When the container did not carry a
/// cylinder or head map, the in-memory map is filled with the track's own
/// cylinder or head and `hflag` records the original absence.  For a fully
/// loaded track `data` holds `num_sectors * sector_size` bytes; header-only
/// reads leave it empty and `loaded` false.
#[derive(Clone, Debug)]
pub struct Track {
    pub mode: u8,
    pub cyl: u8,
    pub head: u8,
    /// High nibble of the head byte as read (map-presence bits).
    pub hflag: u8,
    pub sector_size_code: u8,
    pub sector_size: usize,
    pub smap: Vec<u8>,
    pub cmap: Vec<u8>,
    pub hmap: Vec<u8>,
    pub sflag: Vec<SectorFlag>,
    pub data: Vec<u8>,
    pub loaded: bool,
}

/// What a reader does with the sector data records.
#[derive(Clone, Copy)]
enum ReadDepth {
    /// Skip them.
    Header,
    /// Record each flag, skip the bytes.
    Flags,
    /// Materialize the data buffer, filling unavailable sectors with the
    /// given byte.
    Full(u8),
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

fn read_exact<R: Read>(f: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    f.read_exact(buf).map_err(|_| Error::ReadFailed)
}

fn read_vec<R: Read>(f: &mut R, len: usize) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; len];
    read_exact(f, &mut buf)?;
    Ok(buf)
}

/// Consume the data bytes of one sector record.  The skip is done by
/// reading rather than seeking: seeking past the end of a truncated file
/// succeeds silently, and we need the truncation to surface as an error.
fn skip_sector_data<R: Read>(f: &mut R, flag: SectorFlag, sector_size: usize) -> Result<(), Error> {
    let to_skip: u64 = match flag {
        SectorFlag::Unavailable => 0,
        SectorFlag::Data { compressed: true, .. } => 1,
        SectorFlag::Data { .. } => sector_size as u64,
    };
    if to_skip == 0 {
        return Ok(());
    }
    let skipped = std::io::copy(&mut f.by_ref().take(to_skip), &mut std::io::sink())
        .map_err(|_| Error::ReadFailed)?;
    if skipped != to_skip {
        debug!("end of file inside a sector data record");
        return Err(Error::ReadFailed);
    }
    Ok(())
}

/// Shared reader.  Returns `Ok(None)` only when EOF falls exactly on the
/// record boundary; any later failure rewinds the stream and errors.
fn read_record<R: Read + Seek>(f: &mut R, depth: ReadDepth) -> Result<Option<Track>, Error> {
    let start = f.stream_position().map_err(|_| Error::SeekFailed)?;
    let mode = match read_byte(f)? {
        None => return Ok(None),
        Some(b) => b,
    };
    match parse_after_mode(f, mode, depth) {
        Ok(trk) => Ok(Some(trk)),
        Err(e) => {
            if f.seek(SeekFrom::Start(start)).is_err() {
                debug!("could not restore stream position after failed track read");
            }
            Err(e)
        }
    }
}

fn parse_after_mode<R: Read + Seek>(f: &mut R, mode: u8, depth: ReadDepth) -> Result<Track, Error> {
    let mut hdr = [0u8; 4];
    read_exact(f, &mut hdr)?;
    let cyl = hdr[0];
    let head_byte = hdr[1];
    let num_sectors = hdr[2] as usize;
    let head = head_byte & HEAD_MASK;
    let hflag = head_byte & HFLAG_MASK;
    let sector_size_code = hdr[3];
    if Mode::from_u8(mode).is_none() || head > 1 {
        debug!("invalid track header (mode {}, head {})", mode, head);
        return Err(Error::BadRecord);
    }
    let sector_size = match sector_size_from_code(sector_size_code) {
        Some(s) => s,
        None => {
            debug!("invalid sector size code {}", sector_size_code);
            return Err(Error::BadRecord);
        }
    };
    trace!("cylinder {}, head {}: {} sectors x {} bytes", cyl, head, num_sectors, sector_size);

    let smap = read_vec(f, num_sectors)?;
    let cmap = match hflag & CYL_MAP_FLAG {
        0 => vec![cyl; num_sectors],
        _ => read_vec(f, num_sectors)?,
    };
    let hmap = match hflag & HEAD_MAP_FLAG {
        0 => vec![head; num_sectors],
        _ => read_vec(f, num_sectors)?,
    };

    let mut sflag: Vec<SectorFlag> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    if let ReadDepth::Full(_) = depth {
        data.reserve_exact(num_sectors * sector_size);
    }
    for _isec in 0..num_sectors {
        let flag_byte = read_byte(f)?.ok_or(Error::ReadFailed)?;
        let flag = match SectorFlag::from_byte(flag_byte) {
            Some(fl) => fl,
            None => {
                debug!("unknown sector data record type 0x{:02x}", flag_byte);
                return Err(Error::BadRecord);
            }
        };
        match depth {
            ReadDepth::Header => skip_sector_data(f, flag, sector_size)?,
            ReadDepth::Flags => {
                sflag.push(flag);
                skip_sector_data(f, flag, sector_size)?;
            }
            ReadDepth::Full(fill_byte) => {
                sflag.push(flag);
                match flag {
                    SectorFlag::Unavailable => {
                        data.extend(std::iter::repeat(fill_byte).take(sector_size));
                    }
                    SectorFlag::Data { compressed: true, .. } => {
                        let value = read_byte(f)?.ok_or(Error::ReadFailed)?;
                        data.extend(std::iter::repeat(value).take(sector_size));
                    }
                    SectorFlag::Data { .. } => {
                        let offset = data.len();
                        data.resize(offset + sector_size, 0);
                        read_exact(f, &mut data[offset..])?;
                    }
                }
            }
        }
    }
    Ok(Track {
        mode,
        cyl,
        head,
        hflag,
        sector_size_code,
        sector_size,
        smap,
        cmap,
        hmap,
        sflag,
        data,
        loaded: matches!(depth, ReadDepth::Full(_)),
    })
}

/// Compute the flag a sector will be written with, from its current flag,
/// the uniformity of its current data, and the options in force.
pub fn final_flag(original: SectorFlag, uniform: bool, opts: &WriteOpts) -> SectorFlag {
    match original {
        SectorFlag::Unavailable => SectorFlag::Unavailable,
        SectorFlag::Data { deleted, error, .. } => {
            let compressed = match opts.compression {
                CompressionMode::ForceDecompress => false,
                CompressionMode::ForceCompress | CompressionMode::AsRead => uniform,
            };
            SectorFlag::Data {
                compressed,
                deleted: deleted && !opts.force_non_deleted,
                error: error && !opts.force_non_bad,
            }
        }
    }
}

impl Track {
    /// Read only the header and maps, skipping all sector data.
    pub fn read_header<R: Read + Seek>(f: &mut R) -> Result<Option<Track>, Error> {
        read_record(f, ReadDepth::Header)
    }

    /// Read the header, maps, and sector flags, skipping the data bytes.
    pub fn read_header_and_flags<R: Read + Seek>(f: &mut R) -> Result<Option<Track>, Error> {
        read_record(f, ReadDepth::Flags)
    }

    /// Read a whole track, materializing the data buffer.  Unavailable
    /// sectors are filled with `fill_byte`, compressed ones with their
    /// repeating value.
    pub fn load<R: Read + Seek>(f: &mut R, fill_byte: u8) -> Result<Option<Track>, Error> {
        read_record(f, ReadDepth::Full(fill_byte))
    }

    pub fn num_sectors(&self) -> usize {
        self.smap.len()
    }

    /// Slice of the data buffer belonging to the sector at physical
    /// position `idx`.
    pub fn sector_data(&self, idx: usize) -> &[u8] {
        &self.data[idx * self.sector_size..(idx + 1) * self.sector_size]
    }

    fn check_loaded(&self) -> Result<(), Error> {
        let n = self.num_sectors();
        if !self.loaded
            || n > u8::MAX as usize
            || self.sflag.len() != n
            || self.data.len() != n * self.sector_size
            || sector_size_from_code(self.sector_size_code) != Some(self.sector_size)
        {
            debug!("track C{} H{} is not in a writable state", self.cyl, self.head);
            return Err(Error::InvalidArg);
        }
        Ok(())
    }

    /// Estimate the interleave factor from the sector map: the most common
    /// physical forward distance between logically adjacent sector IDs.
    /// Ties go to the smallest distance; tracks with fewer than two sectors
    /// report 1.
    pub fn best_interleave(&self) -> usize {
        let n = self.num_sectors();
        if n < 2 {
            return 1;
        }
        let mut sector_pos = [usize::MAX; 256];
        for (i, id) in self.smap.iter().enumerate() {
            if sector_pos[*id as usize] != usize::MAX {
                warn!("duplicate sector id {} in map of C{} H{}", id, self.cyl, self.head);
            }
            sector_pos[*id as usize] = i;
        }
        let mut sorted = self.smap.clone();
        sorted.sort_unstable();
        let mut counts = vec![0usize; n];
        for i in 0..n {
            let here = sector_pos[sorted[i] as usize];
            let next = sector_pos[sorted[(i + 1) % n] as usize];
            let distance = match next >= here {
                true => next - here,
                false => n - (here - next),
            };
            if distance > 0 && distance < n {
                counts[distance] += 1;
            }
        }
        let mut best = 1;
        let mut max_count = 0;
        for d in 1..n {
            if counts[d] > max_count {
                max_count = counts[d];
                best = d;
            }
        }
        best
    }

    /// Reorder maps, flags, and data in place so that logically sorted
    /// sectors land at physical positions 0, k, 2k, ... modulo the sector
    /// count, stepping to the next free slot on collision.  Requires a
    /// loaded track with at least two sectors and `factor >= 1`.
    pub fn apply_interleave(&mut self, factor: usize) -> Result<(), Error> {
        let n = self.num_sectors();
        if n < 2 || factor < 1 {
            debug!("interleave {} rejected for track with {} sectors", factor, n);
            return Err(Error::InvalidArg);
        }
        self.check_loaded()?;
        let original_smap = self.smap.clone();
        let original_cmap = self.cmap.clone();
        let original_hmap = self.hmap.clone();
        let original_sflag = self.sflag.clone();
        let original_data = self.data.clone();

        let mut sorted = original_smap.clone();
        sorted.sort_unstable();
        // original physical index of each logically sorted id (first match)
        let mut logical_to_physical = vec![0usize; n];
        for i in 0..n {
            logical_to_physical[i] = original_smap
                .iter()
                .position(|id| *id == sorted[i])
                .ok_or(Error::SectorNotFound)?;
        }

        let sz = self.sector_size;
        let mut used = vec![false; n];
        let mut pos = 0usize;
        for i in 0..n {
            while used[pos] {
                pos = (pos + 1) % n;
            }
            let src = logical_to_physical[i];
            self.smap[pos] = original_smap[src];
            self.cmap[pos] = original_cmap[src];
            self.hmap[pos] = original_hmap[src];
            self.sflag[pos] = original_sflag[src];
            self.data[pos * sz..(pos + 1) * sz].copy_from_slice(&original_data[src * sz..(src + 1) * sz]);
            used[pos] = true;
            pos = (pos + factor) % n;
        }
        Ok(())
    }

    /// Resolve the interleave option against this track, reordering a clone
    /// when anything other than as-read ordering was requested.
    fn reordered_for_write(&self, interleave: Interleave) -> Result<Option<Track>, Error> {
        if self.num_sectors() < 2 {
            return Ok(None);
        }
        let factor = match interleave {
            Interleave::AsRead => return Ok(None),
            Interleave::Factor(k) => k as usize,
            Interleave::BestGuess => self.best_interleave(),
        };
        let mut copy = self.clone();
        copy.apply_interleave(factor)?;
        Ok(Some(copy))
    }

    /// Emit this track as an IMD track record.  The track itself is left
    /// untouched; interleaving happens on a copy.
    pub fn write_imd<W: Write>(&self, f: &mut W, opts: &WriteOpts) -> Result<(), Error> {
        self.check_loaded()?;
        let reordered = self.reordered_for_write(opts.interleave)?;
        let trk = reordered.as_ref().unwrap_or(self);
        let n = trk.num_sectors();

        let written_mode = match (trk.mode as usize) < NUM_MODES {
            true => opts.tmode[trk.mode as usize],
            false => {
                warn!("mode {} out of range, writing as is", trk.mode);
                trk.mode
            }
        };

        let header = [written_mode, trk.cyl, trk.head | trk.hflag, n as u8, trk.sector_size_code];
        f.write_all(&header).map_err(|_| Error::WriteFailed)?;
        if n > 0 {
            f.write_all(&trk.smap).map_err(|_| Error::WriteFailed)?;
            if trk.hflag & CYL_MAP_FLAG != 0 {
                f.write_all(&trk.cmap).map_err(|_| Error::WriteFailed)?;
            }
            if trk.hflag & HEAD_MAP_FLAG != 0 {
                f.write_all(&trk.hmap).map_err(|_| Error::WriteFailed)?;
            }
        }
        for i in 0..n {
            let sector = trk.sector_data(i);
            let flag = final_flag(trk.sflag[i], is_slice_uniform(sector), opts);
            f.write_all(&[flag.to_byte()]).map_err(|_| Error::WriteFailed)?;
            match flag {
                SectorFlag::Unavailable => {}
                SectorFlag::Data { compressed: true, .. } => {
                    trace!("compressing C{} H{} sector {}", trk.cyl, trk.head, trk.smap[i]);
                    f.write_all(&sector[..1]).map_err(|_| Error::WriteFailed)?;
                }
                SectorFlag::Data { .. } => {
                    f.write_all(sector).map_err(|_| Error::WriteFailed)?;
                }
            }
        }
        Ok(())
    }

    /// Emit only the raw sector data, optionally reordered, with no IMD
    /// framing.  Used to convert a track to a flat binary image.
    pub fn write_bin<W: Write>(&self, f: &mut W, opts: &WriteOpts) -> Result<(), Error> {
        self.check_loaded()?;
        if self.num_sectors() == 0 {
            return Ok(());
        }
        let reordered = self.reordered_for_write(opts.interleave)?;
        let trk = reordered.as_ref().unwrap_or(self);
        f.write_all(&trk.data).map_err(|_| Error::WriteFailed)
    }
}

/// Scan the whole stream for the track at (`cyl`, `head`) and report
/// whether it has at least one sector whose data was recovered.  A sector
/// counts as valid whenever its flag is not unavailable, so deleted or
/// error sectors count.  The stream position is restored on every path.
pub fn track_has_valid_sectors<R: Read + Seek>(f: &mut R, cyl: u8, head: u8) -> Result<bool, Error> {
    let original_pos = f.stream_position().map_err(|_| Error::SeekFailed)?;
    let result = scan_for_valid_sectors(f, cyl, head);
    if f.seek(SeekFrom::Start(original_pos)).is_err() {
        debug!("could not restore stream position after track scan");
    }
    result
}

fn scan_for_valid_sectors<R: Read + Seek>(f: &mut R, cyl: u8, head: u8) -> Result<bool, Error> {
    f.seek(SeekFrom::Start(0)).map_err(|_| Error::SeekFailed)?;
    file::read_header(f)?;
    file::skip_comment(f)?;
    loop {
        match Track::read_header_and_flags(f)? {
            None => return Err(Error::TrackNotFound),
            Some(trk) => {
                if trk.cyl == cyl && trk.head == head {
                    return Ok(trk.sflag.iter().any(|s| s.has_data()));
                }
            }
        }
    }
}
