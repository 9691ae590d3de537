// src/metadata.rs
// Tag metadata read from downloaded episode files

use lofty::config::ParseOptions;
use lofty::error::LoftyError;
use lofty::file::TaggedFile;
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::ItemKey;
use log::debug;
use std::path::Path;

/// What the media tags say about an episode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagInfo {
    pub title: Option<String>,
    /// Artist, or the album artist when no artist is tagged
    pub host: Option<String>,
    pub year: Option<u32>,
}

impl TagInfo {
    /// Read the tags of a media file. Files that are missing, unreadable
    /// or carry no tag at all give `None`.
    pub fn from_file(path: &Path) -> Option<Self> {
        let tagged_file = match probe(path) {
            Ok(file) => file,
            Err(e) => {
                debug!("No tags read from {}: {}", path.display(), e);
                return None;
            }
        };

        let tag = tagged_file
            .primary_tag()
            .or_else(|| tagged_file.first_tag())?;

        let host = non_empty(tag.artist().as_deref())
            .or_else(|| non_empty(tag.get_string(&ItemKey::AlbumArtist)));

        Some(Self {
            title: non_empty(tag.title().as_deref()),
            host,
            year: tag.year(),
        })
    }
}

/// The file type comes from the content, not the extension
fn probe(path: &Path) -> Result<TaggedFile, LoftyError> {
    Probe::open(path)?
        .guess_file_type()?
        .options(ParseOptions::new())
        .read()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A tiny WAV file whose RIFF INFO chunk carries a title and an artist
#[cfg(test)]
pub(crate) fn tagged_wav(title: &str, artist: &str) -> Vec<u8> {
    fn chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        if body.len() % 2 == 1 {
            out.push(0);
        }
        out
    }
    fn text(value: &str) -> Vec<u8> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        bytes
    }

    let mut fmt = Vec::new();
    fmt.extend_from_slice(&1u16.to_le_bytes()); // PCM
    fmt.extend_from_slice(&1u16.to_le_bytes()); // mono
    fmt.extend_from_slice(&8000u32.to_le_bytes());
    fmt.extend_from_slice(&16000u32.to_le_bytes());
    fmt.extend_from_slice(&2u16.to_le_bytes());
    fmt.extend_from_slice(&16u16.to_le_bytes());

    let mut info = b"INFO".to_vec();
    info.extend(chunk(b"INAM", &text(title)));
    info.extend(chunk(b"IART", &text(artist)));

    let mut body = b"WAVE".to_vec();
    body.extend(chunk(b"fmt ", &fmt));
    body.extend(chunk(b"data", &[0u8; 16]));
    body.extend(chunk(b"LIST", &info));
    chunk(b"RIFF", &body)
}
