//! Core data model for the media catalog: [`MediaType`], [`MediaFile`],
//! [`Album`], [`Filter`] and the transient [`DetectedFile`] the extractor
//! passes between its `detect` and `extract` steps.
//!
//! `MediaFile` is built through [`MediaFileBuilder`] — fields are set one
//! at a time by the extractors, then [`MediaFileBuilder::freeze`] applies
//! the read-time fallbacks (title-from-filename, album_artist-from-author)
//! and produces the immutable record the store persists.

mod uri;

pub use uri::{file_uri, filename_to_title};

use serde::{Deserialize, Serialize};

/// Coarse classification of a catalog entry.
///
/// `AllMedia` is a query-side wildcard: it is accepted by filters and the
/// volume manager's bulk scan, but an `insert` into the store with this
/// type is always a [`crate::error::Error::ConstraintError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Unknown,
    Audio,
    Video,
    Image,
    AllMedia,
}

impl MediaType {
    /// Integer representation stored in the `type` column.
    pub fn as_i64(self) -> i64 {
        match self {
            MediaType::Unknown => 0,
            MediaType::Audio => 1,
            MediaType::Video => 2,
            MediaType::Image => 3,
            MediaType::AllMedia => 4,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => MediaType::Audio,
            2 => MediaType::Video,
            3 => MediaType::Image,
            4 => MediaType::AllMedia,
            _ => MediaType::Unknown,
        }
    }

    /// True for the three types a catalog row is actually allowed to carry.
    pub fn is_storable(self) -> bool {
        matches!(self, MediaType::Audio | MediaType::Video | MediaType::Image)
    }
}

/// A fully resolved catalog record.
///
/// Always satisfies `filename.starts_with('/')` and
/// `type.is_storable()` — [`MediaFileBuilder::freeze`] is the only
/// constructor and does not enforce this itself (the store's `insert`
/// does, per §4.A), but every extractor in this crate only ever produces
/// frozen records that already satisfy it.
///
/// Derives `Serialize`/`Deserialize` because it is also the wire payload
/// of the extractor worker's stdin/stdout IPC (§4.C).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaFile {
    pub filename: String,
    pub content_type: String,
    pub etag: String,
    pub title: String,
    pub author: String,
    pub album: String,
    pub album_artist: String,
    pub date: String,
    pub genre: String,
    pub disc_number: i32,
    pub track_number: i32,
    pub duration: i32,
    pub width: i32,
    pub height: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub has_thumbnail: bool,
    pub modification_time: u64,
    pub media_type: MediaType,
}

impl MediaFile {
    /// `title`, with the read-time filename fallback applied.
    ///
    /// Stored records may have an empty `title`; this is where the
    /// fallback from §3 is actually realized, at render time.
    pub fn effective_title(&self) -> String {
        if self.title.is_empty() {
            filename_to_title(&self.filename)
        } else {
            self.title.clone()
        }
    }

    /// `album_artist`, falling back to `author` (per-track artist) when empty.
    pub fn effective_album_artist(&self) -> String {
        if self.album_artist.is_empty() {
            self.author.clone()
        } else {
            self.album_artist.clone()
        }
    }

    /// Compose this record's `art_uri`, per §3's derivation table.
    ///
    /// `folder_art` is the resolved folder-art file path for this record's
    /// containing directory, if any (see [`crate::folder_art`]).
    pub fn art_uri(&self, folder_art: Option<&str>) -> String {
        match self.media_type {
            MediaType::Audio => {
                if self.has_thumbnail {
                    uri::make_thumbnail_uri(&file_uri(&self.filename))
                } else if let Some(art) = folder_art {
                    uri::make_thumbnail_uri(&file_uri(art))
                } else {
                    uri::make_album_art_uri(&self.author, &self.album)
                }
            }
            _ => uri::make_thumbnail_uri(&file_uri(&self.filename)),
        }
    }
}

/// Explicit field-by-field config struct standing in for the source's
/// fluent builder (see SPEC_FULL.md §9, "Builder pattern").
#[derive(Debug, Clone, Default)]
pub struct MediaFileBuilder {
    file: MediaFile,
}

impl MediaFileBuilder {
    pub fn new(filename: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            file: MediaFile {
                filename: filename.into(),
                media_type,
                ..Default::default()
            },
        }
    }

    pub fn content_type(mut self, v: impl Into<String>) -> Self {
        self.file.content_type = v.into();
        self
    }
    pub fn etag(mut self, v: impl Into<String>) -> Self {
        self.file.etag = v.into();
        self
    }
    pub fn title(mut self, v: impl Into<String>) -> Self {
        self.file.title = v.into();
        self
    }
    pub fn author(mut self, v: impl Into<String>) -> Self {
        self.file.author = v.into();
        self
    }
    pub fn album(mut self, v: impl Into<String>) -> Self {
        self.file.album = v.into();
        self
    }
    pub fn album_artist(mut self, v: impl Into<String>) -> Self {
        self.file.album_artist = v.into();
        self
    }
    pub fn date(mut self, v: impl Into<String>) -> Self {
        self.file.date = v.into();
        self
    }
    pub fn genre(mut self, v: impl Into<String>) -> Self {
        self.file.genre = v.into();
        self
    }
    pub fn disc_number(mut self, v: i32) -> Self {
        self.file.disc_number = v;
        self
    }
    pub fn track_number(mut self, v: i32) -> Self {
        self.file.track_number = v;
        self
    }
    pub fn duration(mut self, v: i32) -> Self {
        self.file.duration = v;
        self
    }
    pub fn width(mut self, v: i32) -> Self {
        self.file.width = v;
        self
    }
    pub fn height(mut self, v: i32) -> Self {
        self.file.height = v;
        self
    }
    pub fn latitude(mut self, v: f64) -> Self {
        self.file.latitude = v;
        self
    }
    pub fn longitude(mut self, v: f64) -> Self {
        self.file.longitude = v;
        self
    }
    pub fn has_thumbnail(mut self, v: bool) -> Self {
        self.file.has_thumbnail = v;
        self
    }
    pub fn modification_time(mut self, v: u64) -> Self {
        self.file.modification_time = v;
        self
    }

    /// Apply read-time fallbacks and produce the immutable record.
    ///
    /// `title`/`album_artist` are deliberately left as given here (the
    /// fallbacks are derived lazily by [`MediaFile::effective_title`] /
    /// [`MediaFile::effective_album_artist`], never persisted) — `freeze`
    /// exists to mark construction complete, matching the source's
    /// builder-then-immutable-value lifecycle.
    pub fn freeze(self) -> MediaFile {
        self.file
    }
}

/// Sort order for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    Default,
    Rank,
    Title,
    Date,
    Modified,
}

/// Query parameters. All fields independent and optional, matching the
/// `Filter` interface in the original (`set`/`unset`/`has`/`get` per
/// field, here expressed as `Option<String>`).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub offset: i64,
    pub limit: i64,
    pub order: OrderBy,
    pub reverse: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self {
            limit: -1,
            ..Default::default()
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }
    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }
    pub fn with_album_artist(mut self, album_artist: impl Into<String>) -> Self {
        self.album_artist = Some(album_artist.into());
        self
    }
    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
    pub fn with_order(mut self, order: OrderBy) -> Self {
        self.order = order;
        self
    }
    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }
}

/// Derived aggregate over audio records sharing `(title, album_artist)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Album {
    pub title: String,
    pub artist: String,
    pub date: String,
    pub genre: String,
    pub art_file_path: String,
    pub has_thumbnail: bool,
}

impl Album {
    /// Same thumbnailer/folder-art/albumart composition as [`MediaFile::art_uri`],
    /// using the album's own art file and artist/title as the album-art fallback
    /// identity (see `Album::getArtUri` in the original source).
    pub fn art_uri(&self, folder_art: Option<&str>) -> String {
        if self.has_thumbnail && !self.art_file_path.is_empty() {
            uri::make_thumbnail_uri(&file_uri(&self.art_file_path))
        } else if let Some(art) = folder_art {
            uri::make_thumbnail_uri(&file_uri(art))
        } else {
            uri::make_album_art_uri(&self.artist, &self.title)
        }
    }
}

/// Transient tuple produced by [`crate::metadata::MetadataExtractor::detect`]
/// and consumed by its `extract`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFile {
    pub filename: String,
    pub etag: String,
    pub content_type: String,
    pub mtime: u64,
    pub media_type: MediaType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_title_falls_back_to_filename() {
        let f = MediaFileBuilder::new("/music/My_Song (live).ogg", MediaType::Audio).freeze();
        assert_eq!(f.effective_title(), "My Song  live ");
    }

    #[test]
    fn effective_title_prefers_stored_title() {
        let f = MediaFileBuilder::new("/music/track.ogg", MediaType::Audio)
            .title("Real Title")
            .freeze();
        assert_eq!(f.effective_title(), "Real Title");
    }

    #[test]
    fn effective_album_artist_falls_back_to_author() {
        let f = MediaFileBuilder::new("/music/track.ogg", MediaType::Audio)
            .author("The Artist")
            .freeze();
        assert_eq!(f.effective_album_artist(), "The Artist");
    }

    #[test]
    fn art_uri_audio_with_thumbnail() {
        let f = MediaFileBuilder::new("/music/track.ogg", MediaType::Audio)
            .has_thumbnail(true)
            .freeze();
        assert_eq!(f.art_uri(None), "image://thumbnailer/file:///music/track.ogg");
    }

    #[test]
    fn art_uri_audio_without_thumbnail_uses_folder_art() {
        let f = MediaFileBuilder::new("/music/track.ogg", MediaType::Audio).freeze();
        assert_eq!(
            f.art_uri(Some("/music/cover.jpg")),
            "image://thumbnailer/file:///music/cover.jpg"
        );
    }

    #[test]
    fn art_uri_audio_falls_back_to_album_art() {
        let f = MediaFileBuilder::new("/music/track.ogg", MediaType::Audio)
            .author("Artist")
            .album("Album")
            .freeze();
        assert_eq!(f.art_uri(None), "image://albumart/artist=Artist&album=Album");
    }

    #[test]
    fn art_uri_image_is_always_thumbnail() {
        let f = MediaFileBuilder::new("/photos/pic.jpg", MediaType::Image).freeze();
        assert_eq!(f.art_uri(Some("/photos/cover.jpg")), "image://thumbnailer/file:///photos/pic.jpg");
    }

    #[test]
    fn media_type_round_trips_through_i64() {
        for t in [MediaType::Unknown, MediaType::Audio, MediaType::Video, MediaType::Image, MediaType::AllMedia] {
            assert_eq!(MediaType::from_i64(t.as_i64()), t);
        }
    }

    #[test]
    fn only_audio_video_image_are_storable() {
        assert!(MediaType::Audio.is_storable());
        assert!(MediaType::Video.is_storable());
        assert!(MediaType::Image.is_storable());
        assert!(!MediaType::Unknown.is_storable());
        assert!(!MediaType::AllMedia.is_storable());
    }
}
