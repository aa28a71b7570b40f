//! ffpkg compatibility trailer.
//!
//! A trailer is appended after the complete image and describes the files of
//! the metadata directory (`sce_sys/` by default) so a consumer can pull them
//! out without mounting the image. It is written in one forward pass and read
//! backwards from end of file; nothing in it records where it starts.
//!
//! # Layout
//!
//! ```text
//! [image bytes]
//! for each entry, sorted by path:
//!     data        : N bytes
//!     data_len    : u64 LE (N)
//!     path        : ASCII, '/'-separated, followed by one 0 byte
//!     path_len    : u16 LE (path bytes + 1)
//! footer:
//!     entry_count : u32 LE
//!     title_id    : 9 ASCII bytes, space padded
//!     version     : u16 LE (1)
//!     magic       : "ffpkg"
//! ```
//!
//! Reading: the last 20 bytes are the footer. Walking back from the footer,
//! each entry yields `path_len`, then the path, then `data_len`, then the data.
//! After `entry_count` entries the cursor sits on the end of the image.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{ConvertError, ConvertResult};

pub const TRAILER_MAGIC: &[u8; 5] = b"ffpkg";
pub const TRAILER_VERSION: u16 = 1;
pub const TITLE_ID_LEN: usize = 9;

/// Size of the fixed footer at end of file.
pub const FOOTER_LEN: u64 = 4 + TITLE_ID_LEN as u64 + 2 + 5;

/// One file carried in the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailerEntry {
    /// Path relative to the source root, e.g. `sce_sys/param.json`.
    pub path: String,
    pub data: Vec<u8>,
}

/// Fixed-size footer at the very end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerFooter {
    pub entry_count: u32,
    pub title_id: [u8; TITLE_ID_LEN],
    pub version: u16,
}

impl TrailerFooter {
    /// Title id with padding removed.
    pub fn title(&self) -> String {
        String::from_utf8_lossy(&self.title_id).trim_end().to_string()
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.entry_count)?;
        w.write_all(&self.title_id)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_all(TRAILER_MAGIC)
    }
}

/// A trailer parsed back from an image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub footer: TrailerFooter,
    /// Entries in written (sorted) order.
    pub entries: Vec<TrailerEntry>,
    /// Length of the image bytes preceding the trailer.
    pub image_len: u64,
}

/// What [`append_trailer`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// Fit a title id into exactly nine ASCII bytes.
///
/// Shorter ids are space padded, longer ones truncated; non-ASCII characters
/// become `_`.
pub fn normalize_title_id(title_id: &str) -> [u8; TITLE_ID_LEN] {
    let mut out = [b' '; TITLE_ID_LEN];
    if !title_id.is_ascii() {
        warn!("title id '{}' is not ASCII; replacing offending characters", title_id);
    }
    for (slot, ch) in out.iter_mut().zip(title_id.chars()) {
        *slot = if ch.is_ascii() { ch as u8 } else { b'_' };
    }
    out
}

/// A metadata file scheduled for the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    path: String,
    source: PathBuf,
}

/// List the metadata files under `source_root/metadata_dir`, sorted by path.
///
/// Returns `None` when the directory does not exist.
fn collect_entries(source_root: &Path, metadata_dir: &str) -> ConvertResult<Option<Vec<PendingEntry>>> {
    let dir = source_root.join(metadata_dir);
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(&dir).follow_links(true) {
        let entry = entry.map_err(|e| ConvertError::trailer(&dir, e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_root)
            .map_err(|e| ConvertError::trailer(entry.path(), e.to_string()))?;
        let mut parts = Vec::new();
        for component in relative.components() {
            let part = component.as_os_str().to_str().filter(|s| s.is_ascii()).ok_or_else(|| {
                ConvertError::trailer(
                    entry.path(),
                    format!("path '{}' is not ASCII", relative.display()),
                )
            })?;
            parts.push(part);
        }
        let path = parts.join("/");
        if path.len() + 1 > usize::from(u16::MAX) {
            return Err(ConvertError::trailer(
                entry.path(),
                format!("path '{}' is too long", path),
            ));
        }
        entries.push(PendingEntry {
            path,
            source: entry.path().to_path_buf(),
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(Some(entries))
}

fn write_entry<W: Write>(w: &mut W, entry: &TrailerEntry) -> io::Result<()> {
    w.write_all(&entry.data)?;
    w.write_u64::<LittleEndian>(entry.data.len() as u64)?;
    w.write_all(entry.path.as_bytes())?;
    w.write_u8(0)?;
    w.write_u16::<LittleEndian>((entry.path.len() + 1) as u16)
}

/// Append the trailer for `source_root`'s metadata directory to `output`.
///
/// Returns `Ok(None)` without touching `output` when the metadata directory
/// is missing. The output length is checkpointed first; on failure or
/// cancellation the file is truncated back so no partial trailer remains.
pub fn append_trailer(
    output: &Path,
    title_id: &str,
    source_root: &Path,
    metadata_dir: &str,
    cancel: &CancelToken,
) -> ConvertResult<Option<TrailerSummary>> {
    let Some(entries) = collect_entries(source_root, metadata_dir)? else {
        warn!(
            "metadata directory '{}' not found; skipping trailer",
            source_root.join(metadata_dir).display()
        );
        return Ok(None);
    };
    let entry_count = u32::try_from(entries.len())
        .map_err(|_| ConvertError::trailer(output, "too many metadata files"))?;

    let file = OpenOptions::new()
        .append(true)
        .open(output)
        .map_err(|e| ConvertError::trailer(output, format!("opening for append: {e}")))?;
    file.try_lock_exclusive()
        .map_err(|e| ConvertError::trailer(output, format!("locking: {e}")))?;
    let checkpoint = file.metadata()?.len();

    let footer = TrailerFooter {
        entry_count,
        title_id: normalize_title_id(title_id),
        version: TRAILER_VERSION,
    };
    let result = write_trailer(&file, &entries, &footer, cancel)
        .and_then(|()| file.sync_all().map_err(ConvertError::from));
    if let Err(e) = result {
        error!("trailer write to '{}' failed: {}", output.display(), e);
        if let Err(rollback) = file.set_len(checkpoint) {
            error!(
                "could not roll back '{}' to {} bytes: {}",
                output.display(),
                checkpoint,
                rollback
            );
        }
        let _ = file.unlock();
        return Err(match e {
            ConvertError::Cancelled => ConvertError::Cancelled,
            ConvertError::TrailerWrite { .. } => e,
            other => ConvertError::trailer(output, other.to_string()),
        });
    }

    let bytes = file.metadata()?.len() - checkpoint;
    let _ = file.unlock();
    info!(
        "appended trailer with {} entries ({} bytes) to '{}'",
        entries.len(),
        bytes,
        output.display()
    );
    Ok(Some(TrailerSummary {
        entries: entries.len(),
        bytes,
    }))
}

fn write_trailer(
    file: &File,
    entries: &[PendingEntry],
    footer: &TrailerFooter,
    cancel: &CancelToken,
) -> ConvertResult<()> {
    let mut w = BufWriter::new(file);
    for pending in entries {
        cancel.check()?;
        let data = fs::read(&pending.source).map_err(|e| {
            ConvertError::trailer(&pending.source, format!("reading metadata file: {e}"))
        })?;
        info!("  + {} ({} bytes)", pending.path, data.len());
        write_entry(
            &mut w,
            &TrailerEntry {
                path: pending.path.clone(),
                data,
            },
        )?;
    }
    footer.write_to(&mut w)?;
    w.flush()?;
    Ok(())
}

/// Parse the trailer at the end of `path`.
///
/// Returns `Ok(None)` when the file does not end with the trailer magic.
pub fn read_trailer(path: &Path) -> ConvertResult<Option<Trailer>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < FOOTER_LEN {
        return Ok(None);
    }

    let raw = read_at(&mut file, len - FOOTER_LEN, FOOTER_LEN)?;
    if &raw[raw.len() - TRAILER_MAGIC.len()..] != TRAILER_MAGIC {
        return Ok(None);
    }
    let mut footer_reader = Cursor::new(&raw);
    let entry_count = footer_reader.read_u32::<LittleEndian>()?;
    let mut title_id = [0u8; TITLE_ID_LEN];
    footer_reader.read_exact(&mut title_id)?;
    let version = footer_reader.read_u16::<LittleEndian>()?;
    let footer = TrailerFooter {
        entry_count,
        title_id,
        version,
    };
    if version != TRAILER_VERSION {
        warn!("trailer version {} in '{}' is newer than supported", version, path.display());
    }

    let mut cursor = len - FOOTER_LEN;
    let mut entries = Vec::new();
    for index in 0..entry_count {
        let take = |cursor: &mut u64, n: u64, what: &str| -> ConvertResult<u64> {
            if *cursor < n {
                return Err(ConvertError::corrupt(
                    path,
                    format!("entry {index} {what} runs past start of file"),
                ));
            }
            *cursor -= n;
            Ok(*cursor)
        };

        let at = take(&mut cursor, 2, "path length")?;
        let path_len = Cursor::new(read_at(&mut file, at, 2)?).read_u16::<LittleEndian>()?;
        if path_len == 0 {
            return Err(ConvertError::corrupt(path, format!("entry {index} has empty path")));
        }
        let at = take(&mut cursor, u64::from(path_len), "path")?;
        let mut path_bytes = read_at(&mut file, at, u64::from(path_len))?;
        if path_bytes.pop() != Some(0) || !path_bytes.is_ascii() {
            return Err(ConvertError::corrupt(
                path,
                format!("entry {index} path is not a NUL-terminated ASCII string"),
            ));
        }
        let entry_path = String::from_utf8_lossy(&path_bytes).into_owned();

        let at = take(&mut cursor, 8, "data length")?;
        let data_len = Cursor::new(read_at(&mut file, at, 8)?).read_u64::<LittleEndian>()?;
        let at = take(&mut cursor, data_len, "data")?;
        let data = read_at(&mut file, at, data_len)?;

        entries.push(TrailerEntry {
            path: entry_path,
            data,
        });
    }
    entries.reverse();

    Ok(Some(Trailer {
        footer,
        entries,
        image_len: cursor,
    }))
}

fn read_at(file: &mut File, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    Read::by_ref(file).take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
    }
    Ok(buf)
}
