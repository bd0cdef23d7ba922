use std::path::{Path, PathBuf};

use crate::types::Bitrate;

/// Staging file next to `final_path`, unique to this process so two
/// daemons sharing a workdir never write the same temp file.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{name}.{}.tmp", std::process::id()))
}

/// Whether `name` looks like a staging file left behind by [`temp_path`].
pub fn is_temp_name(name: &str) -> bool {
    name.strip_suffix(".tmp")
        .and_then(|rest| rest.rsplit_once('.'))
        .is_some_and(|(_, pid)| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
}

/// `<mid>.<variant>.<ext>`, so each variant of a song is its own file.
pub fn audio_file_name(song_mid: &str, bitrate: Bitrate) -> String {
    format!(
        "{}.{}.{}",
        sanitize_component(song_mid),
        bitrate.as_str(),
        bitrate.extension()
    )
}

/// `<mid>.jpeg`, falling back to the numeric id for albums without a mid.
pub fn artwork_file_name(album_mid: &str, album_id: i64) -> String {
    if album_mid.is_empty() {
        format!("{album_id}.jpeg")
    } else {
        format!("{}.jpeg", sanitize_component(album_mid))
    }
}

/// Strip characters that are invalid in file names on common filesystems,
/// including the FAT volumes portable players ship with.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_is_sibling_with_pid() {
        let p = temp_path(Path::new("/w/audio/abc.320.mp3"));
        assert_eq!(p.parent(), Some(Path::new("/w/audio")));
        let name = p.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("abc.320.mp3.{}.tmp", std::process::id()));
        assert!(is_temp_name(name));
    }

    #[test]
    fn test_is_temp_name() {
        assert!(is_temp_name("x.mp3.123.tmp"));
        assert!(!is_temp_name("x.mp3"));
        assert!(!is_temp_name("notes.tmp"));
        assert!(!is_temp_name("x.abc.tmp"));
    }

    #[test]
    fn test_audio_file_name_per_variant() {
        assert_eq!(audio_file_name("002abc", Bitrate::Mp3_320), "002abc.320.mp3");
        assert_eq!(audio_file_name("002abc", Bitrate::Mp3_128), "002abc.128.mp3");
        assert_eq!(audio_file_name("002abc", Bitrate::Flac), "002abc.flac.flac");
    }

    #[test]
    fn test_artwork_file_name_falls_back_to_id() {
        assert_eq!(artwork_file_name("003alb", 9), "003alb.jpeg");
        assert_eq!(artwork_file_name("", 9), "9.jpeg");
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("AC/DC: Live?"), "ACDC Live");
        assert_eq!(sanitize_component("trailing."), "trailing");
        assert_eq!(sanitize_component("///"), "_");
        assert_eq!(sanitize_component("普通"), "普通");
    }
}
