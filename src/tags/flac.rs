use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use lofty::config::WriteOptions;
use lofty::file::AudioFile;
use lofty::flac::FlacFile;
use lofty::ogg::VorbisComments;
use lofty::tag::Accessor;

use super::{parse_options, TagError, TagFields, TagState, OPTIMIZED_KEY, OPTIMIZED_VALUE, VARIANT_KEY};
use crate::fetch::paths::temp_path;

const BLOCK_PADDING: u8 = 1;
const INSERTED_PADDING: usize = 1024;

pub(super) fn read_state(path: &Path) -> Result<TagState, TagError> {
    let mut file = File::open(path).map_err(TagError::io(path))?;
    let flac = FlacFile::read_from(&mut file, parse_options()).map_err(TagError::codec(path))?;
    let Some(comments) = flac.vorbis_comments() else {
        return Ok(TagState::default());
    };
    Ok(TagState {
        optimized: comments.get(OPTIMIZED_KEY) == Some(OPTIMIZED_VALUE),
        variant: comments.get(VARIANT_KEY).map(str::to_owned),
        title: comments.title().map(|v| v.into_owned()),
        artist: comments.artist().map(|v| v.into_owned()),
        album: comments.album().map(|v| v.into_owned()),
    })
}

/// Where the metadata blocks sit in a FLAC file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    /// Offset of the header of the last-flagged metadata block.
    last_header: u64,
    /// Offset of the first audio frame.
    audio_offset: u64,
    has_padding: bool,
}

fn read_layout(path: &Path) -> Result<Layout, TagError> {
    let mut file = File::open(path).map_err(TagError::io(path))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(TagError::io(path))?;

    let mut pos = 0u64;
    // Some encoders prepend an ID3v2 tag.
    if magic[..3] == *b"ID3" {
        let mut rest = [0u8; 6];
        file.read_exact(&mut rest).map_err(TagError::io(path))?;
        let size = rest[2..]
            .iter()
            .fold(0u64, |acc, b| (acc << 7) | u64::from(b & 0x7F));
        let footer = if rest[1] & 0x10 != 0 { 10 } else { 0 };
        pos = 10 + size + footer;
        file.seek(SeekFrom::Start(pos)).map_err(TagError::io(path))?;
        file.read_exact(&mut magic).map_err(TagError::io(path))?;
    }
    if magic != *b"fLaC" {
        return Err(TagError::unverified(path, "missing fLaC marker"));
    }
    pos += 4;

    let mut has_padding = false;
    loop {
        let mut header = [0u8; 4];
        file.read_exact(&mut header).map_err(TagError::io(path))?;
        let last = header[0] & 0x80 != 0;
        let kind = header[0] & 0x7F;
        let len = u64::from(u32::from_be_bytes([0, header[1], header[2], header[3]]));
        has_padding |= kind == BLOCK_PADDING;
        if last {
            return Ok(Layout {
                last_header: pos,
                audio_offset: pos + 4 + len,
                has_padding,
            });
        }
        pos += 4 + len;
        file.seek(SeekFrom::Start(pos)).map_err(TagError::io(path))?;
    }
}

/// Append an empty PADDING block after the last metadata block. lofty
/// rewrites files without one incorrectly.
fn insert_padding(path: &Path, layout: &Layout) -> Result<(), TagError> {
    let mut bytes = std::fs::read(path).map_err(TagError::io(path))?;
    let (last_header, audio_offset) = (layout.last_header as usize, layout.audio_offset as usize);
    if audio_offset > bytes.len() {
        return Err(TagError::unverified(path, "metadata runs past end of file"));
    }
    bytes[last_header] &= 0x7F;
    let len = INSERTED_PADDING as u32;
    let mut block = vec![0x80 | BLOCK_PADDING];
    block.extend_from_slice(&len.to_be_bytes()[1..]);
    block.resize(4 + INSERTED_PADDING, 0);
    bytes.splice(audio_offset..audio_offset, block);
    std::fs::write(path, bytes).map_err(TagError::io(path))
}

/// Whether the bytes from `a_offset` in `a` equal those from `b_offset` in
/// `b`.
fn same_tail(a: &Path, a_offset: u64, b: &Path, b_offset: u64) -> std::io::Result<bool> {
    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    let len_a = fa.metadata()?.len().saturating_sub(a_offset);
    let len_b = fb.metadata()?.len().saturating_sub(b_offset);
    if len_a != len_b {
        return Ok(false);
    }
    fa.seek(SeekFrom::Start(a_offset))?;
    fb.seek(SeekFrom::Start(b_offset))?;

    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    let mut left = len_a;
    while left > 0 {
        let n = left.min(buf_a.len() as u64) as usize;
        fa.read_exact(&mut buf_a[..n])?;
        fb.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
        left -= n as u64;
    }
    Ok(true)
}

/// The comment block is replaced; pictures and STREAMINFO stay as they are.
/// The rewrite happens on a staging copy that only replaces `path` once the
/// marker reads back and the audio frames are byte-identical.
pub(super) fn write(path: &Path, fields: &TagFields) -> Result<(), TagError> {
    let staged = temp_path(path);
    std::fs::copy(path, &staged).map_err(TagError::io(&staged))?;
    match write_staged(path, &staged, fields) {
        Ok(()) => std::fs::rename(&staged, path).map_err(TagError::io(path)),
        Err(e) => {
            let _ = std::fs::remove_file(&staged);
            Err(e)
        }
    }
}

fn write_staged(original: &Path, staged: &Path, fields: &TagFields) -> Result<(), TagError> {
    let before = read_layout(original)?;
    if !before.has_padding {
        tracing::debug!(path = %original.display(), "Adding padding block before rewrite");
        insert_padding(staged, &before)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(staged)
        .map_err(TagError::io(staged))?;
    let mut flac =
        FlacFile::read_from(&mut file, parse_options()).map_err(TagError::codec(original))?;

    let mut comments = VorbisComments::default();
    comments.set_title(fields.title.clone());
    comments.set_artist(fields.artist.clone());
    comments.set_album(fields.album.clone());
    comments.insert(OPTIMIZED_KEY.to_string(), OPTIMIZED_VALUE.to_string());
    comments.insert(VARIANT_KEY.to_string(), fields.variant.as_str().to_string());
    flac.set_vorbis_comments(comments);

    file.rewind().map_err(TagError::io(staged))?;
    flac.save_to(&mut file, WriteOptions::default())
        .map_err(TagError::codec(original))?;
    file.sync_all().map_err(TagError::io(staged))?;
    drop(file);

    let state = read_state(staged)?;
    if !state.optimized || state.variant.as_deref() != Some(fields.variant.as_str()) {
        return Err(TagError::unverified(original, "marker did not read back"));
    }
    let after = read_layout(staged)?;
    let intact = same_tail(original, before.audio_offset, staged, after.audio_offset)
        .map_err(TagError::io(staged))?;
    if !intact {
        return Err(TagError::unverified(original, "audio frames changed"));
    }
    Ok(())
}
