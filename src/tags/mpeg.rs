use std::fs::{File, OpenOptions};
use std::io::Seek;
use std::path::Path;

use lofty::config::WriteOptions;
use lofty::file::AudioFile;
use lofty::id3::v2::Id3v2Tag;
use lofty::mpeg::MpegFile;
use lofty::tag::{Accessor, TagType};

use super::{parse_options, TagError, TagFields, TagState, OPTIMIZED_KEY, OPTIMIZED_VALUE, VARIANT_KEY};

pub(super) fn read_state(path: &Path) -> Result<TagState, TagError> {
    let mut file = File::open(path).map_err(TagError::io(path))?;
    let mpeg = MpegFile::read_from(&mut file, parse_options()).map_err(TagError::codec(path))?;
    let Some(tag) = mpeg.id3v2() else {
        return Ok(TagState::default());
    };
    Ok(TagState {
        optimized: tag.get_user_text(OPTIMIZED_KEY) == Some(OPTIMIZED_VALUE),
        variant: tag.get_user_text(VARIANT_KEY).map(str::to_owned),
        title: tag.title().map(|v| v.into_owned()),
        artist: tag.artist().map(|v| v.into_owned()),
        album: tag.album().map(|v| v.into_owned()),
    })
}

/// ID3v1 cannot hold the marker, so it is dropped; the ID3v2 tag is
/// replaced wholesale.
pub(super) fn write(path: &Path, fields: &TagFields) -> Result<(), TagError> {
    TagType::Id3v1
        .remove_from_path(path)
        .map_err(TagError::codec(path))?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(TagError::io(path))?;
    let mut mpeg = MpegFile::read_from(&mut file, parse_options()).map_err(TagError::codec(path))?;

    let mut tag = Id3v2Tag::default();
    tag.set_title(fields.title.clone());
    tag.set_artist(fields.artist.clone());
    tag.set_album(fields.album.clone());
    tag.insert_user_text(OPTIMIZED_KEY.to_string(), OPTIMIZED_VALUE.to_string());
    tag.insert_user_text(VARIANT_KEY.to_string(), fields.variant.as_str().to_string());
    mpeg.set_id3v2(tag);

    file.rewind().map_err(TagError::io(path))?;
    mpeg.save_to(&mut file, WriteOptions::default())
        .map_err(TagError::codec(path))?;
    Ok(())
}
