//! ## In-memory IMD image with synchronous persistence
//!
//! [`ImageFile`] loads an entire IMD file into memory on open and owns the
//! backing file handle for its whole lifetime.  Every mutating operation
//! rewrites the file from the in-memory model and truncates it to the new
//! logical size before returning, so readers always observe the post-edit
//! state and a reopen parses exactly what memory predicts.
//!
//! The delicate case is editing a sector that was stored compressed: a
//! compressed record can only represent byte-uniform data, so writing
//! non-uniform bytes into such a sector forces the whole track to be
//! rewritten with normal records.  Only then do the other sectors' flags
//! stay truthful without their data changing.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use log::{debug, warn};
use crate::file::{self, HeaderInfo};
use crate::track::{self, CompressionMode, Track, WriteOpts};
use crate::{is_slice_uniform, sector_code_from_size, Mode, SectorFlag};
use crate::{CYL_MAP_FLAG, FILL_BYTE_DEFAULT, HEAD_MAP_FLAG};

/// Sentinel for a geometry limit that is not enforced.
pub const GEOMETRY_UNUSED: u8 = 0xff;

/// Enumerates image-layer errors.  Codec errors never escape this module
/// directly; they are translated to these kinds at the boundary.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("image is write protected")]
    WriteProtected,
    #[error("operation exceeds geometry limits")]
    Geometry,
    #[error("track or sector not found")]
    NotFound,
    #[error("file i/o failed")]
    Io,
    #[error("invalid argument")]
    InvalidArg,
    #[error("invalid sector size or data size mismatch")]
    SectorSize,
    #[error("buffer too small for sector")]
    BufferSize,
    #[error("sector is marked unavailable")]
    Unavailable,
    #[error("container structure was invalid")]
    BadFormat,
    #[error("internal codec state error")]
    Internal,
    #[error("cannot open image file")]
    CannotOpen,
}

/// Translate a codec error into the image-layer kind.  This is the only
/// place the low-level error vocabulary crosses into the public one.
fn map_codec_err(err: crate::Error) -> Error {
    match err {
        crate::Error::ReadFailed | crate::Error::WriteFailed | crate::Error::SeekFailed => Error::Io,
        crate::Error::BadRecord => Error::BadFormat,
        crate::Error::InvalidArg => Error::InvalidArg,
        crate::Error::BufferTooSmall => Error::BufferSize,
        crate::Error::SectorNotFound | crate::Error::TrackNotFound => Error::NotFound,
        crate::Error::Unavailable => Error::Unavailable,
        crate::Error::SizeMismatch => Error::SectorSize,
    }
}

/// An open IMD image: parsed header, comment, and every track fully loaded.
///
/// The struct exclusively owns its file handle, track buffers, and comment;
/// dropping it releases everything.  A failed [`ImageFile::open`] releases
/// whatever had been loaded up to the failure.
pub struct ImageFile {
    file: File,
    path: PathBuf,
    write_protected: bool,
    read_only: bool,
    header: HeaderInfo,
    comment: Vec<u8>,
    tracks: Vec<Track>,
    max_cyl: u8,
    max_head: u8,
    max_spt: u8,
}

impl ImageFile {
    /// Open an IMD file and load header, comment, and all tracks.  A
    /// read-only open also write-protects the image, and that protection
    /// cannot be lifted later.
    pub fn open(path: &Path, read_only: bool) -> Result<ImageFile, Error> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| {
                debug!("could not open '{}': {}", path.display(), e);
                Error::CannotOpen
            })?;
        let header = file::read_header(&mut f).map_err(map_codec_err)?;
        let comment = file::read_comment(&mut f).map_err(map_codec_err)?;
        let mut tracks: Vec<Track> = Vec::new();
        while let Some(trk) = Track::load(&mut f, FILL_BYTE_DEFAULT).map_err(map_codec_err)? {
            debug!(
                "loaded track {}: C{} H{} with {} sectors x {} bytes",
                tracks.len(), trk.cyl, trk.head, trk.num_sectors(), trk.sector_size
            );
            tracks.push(trk);
        }
        Ok(ImageFile {
            file: f,
            path: path.to_path_buf(),
            write_protected: read_only,
            read_only,
            header,
            comment,
            tracks,
            max_cyl: GEOMETRY_UNUSED,
            max_head: GEOMETRY_UNUSED,
            max_spt: GEOMETRY_UNUSED,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the geometry limits used to validate sector and track writes.
    /// [`GEOMETRY_UNUSED`] disables the corresponding check.
    pub fn set_geometry(&mut self, max_cyl: u8, max_head: u8, max_spt: u8) {
        self.max_cyl = max_cyl;
        self.max_head = max_head;
        self.max_spt = max_spt;
        debug!("geometry limits set to C{} H{} SPT{}", max_cyl, max_head, max_spt);
    }

    pub fn geometry(&self) -> (u8, u8, u8) {
        (self.max_cyl, self.max_head, self.max_spt)
    }

    /// Enable or disable write protection.  Protection cannot be cleared on
    /// an image that was opened read-only.
    pub fn set_write_protect(&mut self, protect: bool) -> Result<(), Error> {
        if !protect && self.read_only {
            return Err(Error::WriteProtected);
        }
        self.write_protected = protect;
        Ok(())
    }

    pub fn write_protect(&self) -> bool {
        self.write_protected
    }

    pub fn header_info(&self) -> &HeaderInfo {
        &self.header
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_info(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    /// Index of the track at (`cyl`, `head`), if any.
    pub fn find_track_by_ch(&self, cyl: u8, head: u8) -> Option<usize> {
        self.tracks.iter().position(|t| t.cyl == cyl && t.head == head)
    }

    fn check_ch(&self, cyl: u8, head: u8) -> Result<(), Error> {
        if (self.max_cyl != GEOMETRY_UNUSED && cyl > self.max_cyl)
            || (self.max_head != GEOMETRY_UNUSED && head > self.max_head)
        {
            debug!(
                "C{} H{} exceeds geometry limits C{} H{}",
                cyl, head, self.max_cyl, self.max_head
            );
            return Err(Error::Geometry);
        }
        Ok(())
    }

    // Asymmetric on purpose: a zero logical id always passes this check.
    fn check_spt(&self, logical_id: u8) -> Result<(), Error> {
        if self.max_spt != GEOMETRY_UNUSED && logical_id > self.max_spt && logical_id != 0 {
            debug!("logical sector {} exceeds SPT limit {}", logical_id, self.max_spt);
            return Err(Error::Geometry);
        }
        Ok(())
    }

    /// Copy one sector into `buf`, located by (`cyl`, `head`) and its
    /// logical id in the sector map.  `buf` may be larger than the sector.
    pub fn read_sector(&self, cyl: u8, head: u8, logical_id: u8, buf: &mut [u8]) -> Result<(), Error> {
        self.check_ch(cyl, head)?;
        self.check_spt(logical_id)?;
        let tidx = self.find_track_by_ch(cyl, head).ok_or(Error::NotFound)?;
        let trk = &self.tracks[tidx];
        let sidx = trk.smap.iter().position(|s| *s == logical_id).ok_or(Error::NotFound)?;
        if !trk.sflag[sidx].has_data() {
            return Err(Error::Unavailable);
        }
        if buf.len() < trk.sector_size {
            return Err(Error::BufferSize);
        }
        buf[..trk.sector_size].copy_from_slice(trk.sector_data(sidx));
        Ok(())
    }

    /// Overwrite one sector and persist the change.
    ///
    /// `buf` must be exactly the track's sector size.  If the edited slot
    /// was stored compressed and the new data is not uniform, the whole
    /// track is rewritten with normal records; otherwise the track is
    /// rewritten as read, which may also compress untouched uniform sectors
    /// that had been stored as full records.  After a successful rewrite
    /// every sector's in-memory flag is updated to what a fresh parse of
    /// the file would report.
    pub fn write_sector(&mut self, cyl: u8, head: u8, logical_id: u8, buf: &[u8]) -> Result<(), Error> {
        if self.write_protected {
            return Err(Error::WriteProtected);
        }
        self.check_ch(cyl, head)?;
        let tidx = self.find_track_by_ch(cyl, head).ok_or(Error::NotFound)?;
        let sidx = self.tracks[tidx]
            .smap
            .iter()
            .position(|s| *s == logical_id)
            .ok_or(Error::NotFound)?;
        self.check_spt(logical_id)?;
        let trk = &mut self.tracks[tidx];
        if buf.len() != trk.sector_size {
            debug!(
                "buffer of {} bytes does not match sector size {}",
                buf.len(), trk.sector_size
            );
            return Err(Error::SectorSize);
        }

        let was_compressed = trk.sflag[sidx].is_compressed();
        let sz = trk.sector_size;
        trk.data[sidx * sz..(sidx + 1) * sz].copy_from_slice(buf);

        let mut opts = WriteOpts::default();
        if was_compressed && !is_slice_uniform(buf) {
            // A compressed record cannot hold the new data, so the whole
            // track goes out as normal records.
            opts.compression = CompressionMode::ForceDecompress;
            debug!(
                "C{} H{} sector {} is no longer uniform, rewriting track uncompressed",
                cyl, head, logical_id
            );
        }

        self.rewrite_image_file(Some(tidx), &opts)?;

        // Reconcile the whole flag vector with what the rewrite emitted:
        // the representation of any uniform sector can change under these
        // options, not just the edited one's.
        let trk = &mut self.tracks[tidx];
        for i in 0..trk.num_sectors() {
            let uniform = is_slice_uniform(&trk.data[i * sz..(i + 1) * sz]);
            trk.sflag[i] = track::final_flag(trk.sflag[i], uniform, &opts);
        }
        Ok(())
    }

    /// Create or replace the track at (`cyl`, `head`) and persist it.
    ///
    /// Every sector is filled with `fill_byte`.  A missing `smap` means
    /// sequential ids 1 to `num_sectors`; `cmap`/`hmap` may only be given
    /// together with an explicit `smap`.  New tracks are inserted at the
    /// ordered (cyl, head) position.  The rewrite compresses the uniform
    /// fill, so on success every sector flag is the compressed variant.
    pub fn write_track(
        &mut self,
        cyl: u8,
        head: u8,
        num_sectors: u8,
        sector_size: usize,
        fill_byte: u8,
        smap: Option<&[u8]>,
        cmap: Option<&[u8]>,
        hmap: Option<&[u8]>,
    ) -> Result<(), Error> {
        if self.write_protected {
            return Err(Error::WriteProtected);
        }
        self.check_ch(cyl, head)?;
        let n = num_sectors as usize;
        if n > 0 && smap.is_none() && (cmap.is_some() || hmap.is_some()) {
            debug!("cylinder/head maps require an explicit sector map");
            return Err(Error::InvalidArg);
        }
        for map in [smap, cmap, hmap].into_iter().flatten() {
            if map.len() != n {
                return Err(Error::InvalidArg);
            }
        }
        let sector_size_code = sector_code_from_size(sector_size).ok_or(Error::SectorSize)?;

        let mut hflag = 0u8;
        if n > 0 {
            if cmap.is_some() {
                hflag |= CYL_MAP_FLAG;
            }
            if hmap.is_some() {
                hflag |= HEAD_MAP_FLAG;
            }
        }
        let trk = Track {
            mode: Mode::Mfm250Kbps as u8,
            cyl,
            head,
            hflag,
            sector_size_code,
            sector_size,
            smap: match smap {
                Some(m) => m.to_vec(),
                None => (1..=num_sectors).collect(),
            },
            cmap: match cmap {
                Some(m) => m.to_vec(),
                None => vec![cyl; n],
            },
            hmap: match hmap {
                Some(m) => m.to_vec(),
                None => vec![head; n],
            },
            sflag: vec![SectorFlag::NORMAL; n],
            data: vec![fill_byte; n * sector_size],
            loaded: true,
        };

        let (idx, inserted) = match self.find_track_by_ch(cyl, head) {
            Some(i) => {
                debug!("overwriting existing track at index {} (C{} H{})", i, cyl, head);
                self.tracks[i] = trk;
                (i, false)
            }
            None => {
                let i = self.tracks.partition_point(|t| (t.cyl, t.head) < (cyl, head));
                debug!("inserting new track at index {} (C{} H{})", i, cyl, head);
                self.tracks.insert(i, trk);
                (i, true)
            }
        };

        let opts = WriteOpts {
            compression: CompressionMode::ForceCompress,
            ..WriteOpts::default()
        };
        if let Err(e) = self.rewrite_image_file(Some(idx), &opts) {
            if inserted {
                self.tracks.remove(idx);
            } else {
                warn!(
                    "overwrite of track C{} H{} failed; in-memory track may be inconsistent until reopen",
                    cyl, head
                );
            }
            return Err(e);
        }

        // The track data is one uniform byte everywhere, so the rewrite
        // stored every sector compressed.
        for flag in self.tracks[idx].sflag.iter_mut() {
            *flag = SectorFlag::Data { compressed: true, deleted: false, error: false };
        }
        Ok(())
    }

    /// Rewrite the whole file from memory: header (restamped), comment,
    /// every track, then truncate to the new logical size.  The designated
    /// modified track uses `modified_opts`; all others use defaults.  A
    /// failed length query or truncate after a successful emit only logs a
    /// warning since the emitted data is already correct.
    fn rewrite_image_file(&mut self, modified: Option<usize>, modified_opts: &WriteOpts) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(0)).map_err(|_| Error::Io)?;
        let default_opts = WriteOpts::default();
        {
            let mut out = BufWriter::new(&mut self.file);
            file::write_header(&mut out, &self.header.version).map_err(map_codec_err)?;
            file::write_comment(&mut out, &self.comment).map_err(map_codec_err)?;
            for (i, trk) in self.tracks.iter().enumerate() {
                if !trk.loaded {
                    debug!("track {} (C{} H{}) is not loaded", i, trk.cyl, trk.head);
                    return Err(Error::Internal);
                }
                let opts = match modified {
                    Some(m) if m == i => modified_opts,
                    _ => &default_opts,
                };
                trk.write_imd(&mut out, opts).map_err(map_codec_err)?;
            }
            out.flush().map_err(|_| Error::Io)?;
        }
        match self.file.stream_position() {
            Ok(end) => {
                if self.file.set_len(end).is_err() {
                    warn!(
                        "could not truncate '{}'; stale data may remain past offset {}",
                        self.path.display(), end
                    );
                }
            }
            Err(_) => {
                warn!(
                    "could not query length of '{}'; stale data may remain at the end",
                    self.path.display()
                );
            }
        }
        self.file.flush().map_err(|_| Error::Io)?;
        Ok(())
    }
}
