use serde::{Deserialize, Serialize};

/// Audio variant offered by the catalog. Each variant of a song is a
/// separate local file with its own tag state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum, Serialize, Deserialize)]
pub enum Bitrate {
    #[value(name = "128")]
    Mp3_128,
    #[value(name = "320")]
    Mp3_320,
    #[value(name = "flac")]
    Flac,
}

impl Bitrate {
    /// Identifier stored in the database and in the tag marker.
    pub fn as_str(&self) -> &'static str {
        match self {
            Bitrate::Mp3_128 => "128",
            Bitrate::Mp3_320 => "320",
            Bitrate::Flac => "flac",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "128" => Some(Bitrate::Mp3_128),
            "320" => Some(Bitrate::Mp3_320),
            "flac" => Some(Bitrate::Flac),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Bitrate::Mp3_128 | Bitrate::Mp3_320 => "mp3",
            Bitrate::Flac => "flac",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Bitrate::Mp3_128 | Bitrate::Mp3_320 => "audio/mpeg",
            Bitrate::Flac => "audio/flac",
        }
    }
}

impl std::fmt::Display for Bitrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
