//! Embedded tag probing and rewriting.
//!
//! A normalized file carries [`OPTIMIZED_KEY`] = [`OPTIMIZED_VALUE`] and the
//! variant it was normalized for under [`VARIANT_KEY`], stored with the
//! container's own facility: ID3v2 user text frames for MPEG, Vorbis
//! comments for FLAC. Only the tag block changes; audio frames are copied
//! through untouched.

mod error;
mod flac;
mod mpeg;

use std::path::Path;

use lofty::config::ParseOptions;

pub use error::TagError;

use crate::types::Bitrate;

pub const OPTIMIZED_KEY: &str = "WG_OPT";
pub const OPTIMIZED_VALUE: &str = "true";
pub const VARIANT_KEY: &str = "WG_VARIANT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mpeg,
    Flac,
}

impl AudioFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "audio/mpeg" | "audio/mp3" => Some(AudioFormat::Mpeg),
            "audio/flac" | "audio/x-flac" => Some(AudioFormat::Flac),
            _ => None,
        }
    }
}

/// Values written by a normalization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFields {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub variant: Bitrate,
}

/// Marker and field values read from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagState {
    pub optimized: bool,
    pub variant: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

/// Blocking codec; callers run it on the blocking pool.
pub trait TagCodec: Send + Sync {
    fn read_state(&self, path: &Path, format: AudioFormat) -> Result<TagState, TagError>;

    /// Replace the file's tag with `fields` plus the optimization marker.
    fn write(&self, path: &Path, format: AudioFormat, fields: &TagFields) -> Result<(), TagError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyCodec;

impl TagCodec for LoftyCodec {
    fn read_state(&self, path: &Path, format: AudioFormat) -> Result<TagState, TagError> {
        match format {
            AudioFormat::Mpeg => mpeg::read_state(path),
            AudioFormat::Flac => flac::read_state(path),
        }
    }

    fn write(&self, path: &Path, format: AudioFormat, fields: &TagFields) -> Result<(), TagError> {
        match format {
            AudioFormat::Mpeg => mpeg::write(path, fields),
            AudioFormat::Flac => flac::write(path, fields),
        }
    }
}

fn parse_options() -> ParseOptions {
    ParseOptions::new().read_properties(false)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Smallest files the codecs accept.

    use std::path::Path;

    /// MPEG-1 Layer III, 128 kbps, 44.1 kHz: 417-byte frames.
    pub fn mpeg_frames(count: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(417 * count);
        for _ in 0..count {
            data.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x64]);
            data.extend(std::iter::repeat(0u8).take(413));
        }
        data
    }

    pub fn id3v1_block(title: &str) -> Vec<u8> {
        let mut block = b"TAG".to_vec();
        let mut field = title.as_bytes().to_vec();
        field.resize(30, 0);
        block.extend_from_slice(&field);
        block.resize(127, 0);
        block.push(255);
        block
    }

    /// STREAMINFO body: stereo, 16 bit, 44.1 kHz.
    pub fn flac_streaminfo() -> Vec<u8> {
        let mut body = vec![0x10, 0x00, 0x10, 0x00];
        body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        body.extend_from_slice(&[0x0A, 0xC4, 0x42, 0xF0, 0x00, 0x00, 0x00, 0x00]);
        body.extend_from_slice(&[0u8; 16]);
        body
    }

    /// Bytes standing in for the audio frames after the metadata blocks.
    pub fn flac_frames() -> Vec<u8> {
        let mut frames = Vec::with_capacity(2048);
        frames.extend_from_slice(&[0xFF, 0xF8, 0x69, 0x08]);
        frames.extend((0..2044u32).map(|i| (i * 31 % 251) as u8));
        frames
    }

    /// STREAMINFO, a last-flagged PADDING block, then frames.
    pub fn flac_stream() -> Vec<u8> {
        let mut data = b"fLaC".to_vec();
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x22]);
        data.extend(flac_streaminfo());
        data.extend_from_slice(&[0x81, 0x00, 0x04, 0x00]);
        data.extend_from_slice(&[0u8; 0x400]);
        data.extend(flac_frames());
        data
    }

    /// A last-flagged STREAMINFO as the only metadata block, as written by
    /// encoders told not to pad.
    pub fn flac_stream_without_padding() -> Vec<u8> {
        let mut data = b"fLaC".to_vec();
        data.extend_from_slice(&[0x80, 0x00, 0x00, 0x22]);
        data.extend(flac_streaminfo());
        data.extend(flac_frames());
        data
    }

    pub fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}
