use std::path::Path;

use lofty::config::WriteOptions;
use lofty::error::LoftyError;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TagExt, TaggedFileExt};
use lofty::tag::Tag;

const MULTI_VALUE_SEP: &str = " / ";

#[derive(Debug, Default, Clone)]
pub struct TagInfo {
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub duration_ms: Option<u32>,
    pub bitrate: Option<u32>,
    pub has_embedded_cover: bool,
}

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

impl CoverArt {
    pub fn extension(&self) -> &'static str {
        match self.mime.as_deref() {
            Some("image/png") => "png",
            _ => "jpg",
        }
    }
}

/// Fields to write back; `None` leaves the existing value untouched.
#[derive(Debug, Default, Clone)]
pub struct TagWrite {
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
}

impl TagWrite {
    pub fn is_empty(&self) -> bool {
        self.artist.is_none()
            && self.album_artist.is_none()
            && self.title.is_none()
            && self.album.is_none()
    }
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    MissingTag,
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::MissingTag => write!(f, "file has no writable tag"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        let clamped = duration_ms.min(u128::from(u32::MAX)) as u32;
        info.duration_ms = Some(clamped);
    }
    info.bitrate = properties.audio_bitrate().or(properties.overall_bitrate());

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = joined_values(tag, &ItemKey::TrackTitle);
        info.album = joined_values(tag, &ItemKey::AlbumTitle);
        info.artist = joined_values(tag, &ItemKey::TrackArtist);
        info.album_artist = joined_values(tag, &ItemKey::AlbumArtist);
        info.has_embedded_cover = !tag.pictures().is_empty();
    }

    Ok(info)
}

pub fn read_cover(path: &Path) -> Result<Option<CoverArt>, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let tag = match tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        Some(tag) => tag,
        None => return Ok(None),
    };

    let picture = match pick_picture(tag.pictures()) {
        Some(picture) => picture,
        None => return Ok(None),
    };

    let data = picture.data().to_vec();
    let mime = guess_mime(&data);
    Ok(Some(CoverArt { data, mime }))
}

pub fn write_tags(path: &Path, fields: &TagWrite) -> Result<(), MetadataError> {
    if fields.is_empty() {
        return Ok(());
    }
    let mut tagged_file = lofty::read_from_path(path)?;
    if tagged_file.primary_tag().is_none() {
        let tag_type = tagged_file.primary_tag_type();
        tagged_file.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged_file
        .primary_tag_mut()
        .ok_or(MetadataError::MissingTag)?;

    if let Some(artist) = &fields.artist {
        tag.insert_text(ItemKey::TrackArtist, artist.clone());
    }
    if let Some(album_artist) = &fields.album_artist {
        tag.insert_text(ItemKey::AlbumArtist, album_artist.clone());
    }
    if let Some(title) = &fields.title {
        tag.insert_text(ItemKey::TrackTitle, title.clone());
    }
    if let Some(album) = &fields.album {
        tag.insert_text(ItemKey::AlbumTitle, album.clone());
    }

    tag.save_to_path(path, WriteOptions::default())?;
    Ok(())
}

fn joined_values(tag: &Tag, key: &ItemKey) -> Option<String> {
    let values: Vec<&str> = tag
        .get_strings(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(MULTI_VALUE_SEP))
    }
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}

fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else {
        None
    }
}
