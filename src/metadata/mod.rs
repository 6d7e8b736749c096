//! Metadata Extractor (§4.C): classify a file (`detect`), then pull tags
//! out of it (`extract`), dispatching by type to the tag library that
//! actually understands the format. Grounded in `mediascanner`'s
//! `MediaFile.cc`/`TaglibExtractor.cc` format dispatch, reimplemented
//! against `kamadak-exif`/`imagesize` (images) and `lofty`/`symphonia`
//! (audio/video) rather than GLib/Taglib.

pub mod worker;

use std::path::Path;
use std::time::Duration;

use lofty::prelude::*;
use lofty::tag::ItemKey;

use crate::error::{Error, Result};
use crate::fsutil::compute_etag;
use crate::model::{DetectedFile, MediaFile, MediaFileBuilder, MediaType};

/// Content types `detect` refuses outright — playlist formats masquerading
/// as audio files (grounded in the original's own blacklist).
const BLACKLISTED_CONTENT_TYPES: &[&str] = &[
    "audio/x-mpegurl",
    "audio/x-ms-asx",
    "audio/x-scpls",
    "audio/x-iriver-pla",
];

fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "mp3" => Some("audio/mpeg"),
        "flac" => Some("audio/x-flac"),
        "ogg" | "oga" => Some("audio/ogg"),
        "opus" => Some("audio/opus"),
        "wav" => Some("audio/x-wav"),
        "m4a" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "mp4" | "m4v" => Some("video/mp4"),
        "mkv" => Some("video/x-matroska"),
        "avi" => Some("video/x-msvideo"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "webp" => Some("image/webp"),
        "heic" | "heif" => Some("image/heic"),
        "m3u" | "m3u8" => Some("audio/x-mpegurl"),
        "asx" => Some("audio/x-ms-asx"),
        "pls" => Some("audio/x-scpls"),
        "pla" => Some("audio/x-iriver-pla"),
        _ => None,
    }
}

fn media_type_from_content_type(content_type: &str) -> MediaType {
    if content_type.starts_with("audio/") {
        MediaType::Audio
    } else if content_type.starts_with("video/") {
        MediaType::Video
    } else if content_type.starts_with("image/") {
        MediaType::Image
    } else {
        MediaType::Unknown
    }
}

/// Classify `path`: rejects blacklisted playlist types and anything with
/// an unrecognized extension, otherwise returns a [`DetectedFile`]
/// carrying its etag and coarse type.
pub fn detect(path: &Path) -> Result<DetectedFile> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.is_file() {
        return Err(Error::UnsupportedType("not a regular file".to_string()));
    }

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let content_type = content_type_for_extension(ext)
        .ok_or_else(|| Error::UnsupportedType(format!("unrecognized extension: .{ext}")))?;

    if BLACKLISTED_CONTENT_TYPES.contains(&content_type) {
        return Err(Error::Blacklisted(content_type.to_string()));
    }

    let media_type = media_type_from_content_type(content_type);
    if media_type == MediaType::Unknown {
        return Err(Error::UnsupportedType(content_type.to_string()));
    }

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(DetectedFile {
        filename: path.to_string_lossy().into_owned(),
        etag: compute_etag(&metadata),
        content_type: content_type.to_string(),
        mtime,
        media_type,
    })
}

/// A minimally populated record carrying only `filename`/`type` (and the
/// identity fields needed to detect future changes) — used when
/// extraction fails terminally. Read-time fallbacks derive the rest.
pub fn fallback_extract(detected: &DetectedFile) -> MediaFile {
    MediaFileBuilder::new(detected.filename.clone(), detected.media_type)
        .etag(detected.etag.clone())
        .content_type(detected.content_type.clone())
        .modification_time(detected.mtime)
        .freeze()
}

/// Owns the crash-isolated worker process used for the `symphonia`
/// streaming probe (video always, audio when `lofty` can't read it).
pub struct MetadataExtractor {
    worker: worker::WorkerHandle,
}

impl MetadataExtractor {
    pub fn new(worker_idle_timeout: Duration) -> Self {
        Self {
            worker: worker::WorkerHandle::new(worker_idle_timeout),
        }
    }

    pub async fn extract(&mut self, detected: &DetectedFile) -> Result<MediaFile> {
        match detected.media_type {
            MediaType::Image => extract_image(detected),
            MediaType::Audio => self.extract_audio(detected).await,
            MediaType::Video => self.worker.extract(detected).await,
            MediaType::Unknown | MediaType::AllMedia => {
                Err(Error::UnsupportedType(detected.content_type.clone()))
            }
        }
    }

    async fn extract_audio(&mut self, detected: &DetectedFile) -> Result<MediaFile> {
        match extract_audio_tags(detected) {
            Ok(file) => Ok(file),
            Err(TagError::NotRecognized) => self.worker.extract(detected).await,
            Err(TagError::Other(e)) => Err(e),
        }
    }
}

enum TagError {
    NotRecognized,
    Other(Error),
}

fn is_unrecognized_format(err: &lofty::error::LoftyError) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("unknown format") || msg.contains("unsupported") || msg.contains("could not identify")
}

fn extract_audio_tags(detected: &DetectedFile) -> std::result::Result<MediaFile, TagError> {
    let path = Path::new(&detected.filename);
    let tagged_file = lofty::read_from_path(path).map_err(|e| {
        if is_unrecognized_format(&e) {
            TagError::NotRecognized
        } else {
            TagError::Other(Error::Tag(e))
        }
    })?;

    let duration = tagged_file.properties().duration().as_secs() as i32;
    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

    let mut builder = MediaFileBuilder::new(detected.filename.clone(), MediaType::Audio)
        .etag(detected.etag.clone())
        .content_type(detected.content_type.clone())
        .modification_time(detected.mtime)
        .duration(duration);

    if let Some(tag) = tag {
        let album_artist = tag
            .get_string(&ItemKey::AlbumArtist)
            .map(|s| s.to_string())
            .unwrap_or_default();
        builder = builder
            .title(tag.title().map(|c| c.into_owned()).unwrap_or_default())
            .author(tag.artist().map(|c| c.into_owned()).unwrap_or_default())
            .album(tag.album().map(|c| c.into_owned()).unwrap_or_default())
            .genre(tag.genre().map(|c| c.into_owned()).unwrap_or_default())
            .album_artist(album_artist)
            .track_number(tag.track().unwrap_or(0) as i32)
            .disc_number(tag.disk().unwrap_or(0) as i32)
            .date(tag.year().map(|y| normalize_date(&y.to_string())).unwrap_or_default())
            .has_thumbnail(!tag.pictures().is_empty());
    }

    Ok(builder.freeze())
}

fn extract_image(detected: &DetectedFile) -> Result<MediaFile> {
    let path = Path::new(&detected.filename);
    let (width, height, date, latitude, longitude) = match read_exif(path) {
        Some(exif) => (
            exif.width,
            exif.height,
            exif.date.unwrap_or_else(|| mtime_iso_date(detected.mtime)),
            exif.latitude,
            exif.longitude,
        ),
        None => {
            let (w, h) = imagesize::size(path)
                .map(|d| (d.width as i32, d.height as i32))
                .unwrap_or((0, 0));
            (w, h, mtime_iso_date(detected.mtime), 0.0, 0.0)
        }
    };

    Ok(MediaFileBuilder::new(detected.filename.clone(), MediaType::Image)
        .etag(detected.etag.clone())
        .content_type(detected.content_type.clone())
        .modification_time(detected.mtime)
        .width(width)
        .height(height)
        .date(date)
        .latitude(latitude)
        .longitude(longitude)
        .freeze())
}

struct ExifData {
    date: Option<String>,
    width: i32,
    height: i32,
    latitude: f64,
    longitude: f64,
}

fn read_exif(path: &Path) -> Option<ExifData> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    let orientation = exif
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1);

    let (mut width, mut height) = exif_dimensions(&exif).unwrap_or_else(|| {
        imagesize::size(path)
            .map(|d| (d.width as i32, d.height as i32))
            .unwrap_or((0, 0))
    });
    if matches!(orientation, 5 | 6 | 7 | 8) {
        std::mem::swap(&mut width, &mut height);
    }

    Some(ExifData {
        date: exif_date(&exif),
        width,
        height,
        latitude: exif_gps(&exif, exif::Tag::GPSLatitude, exif::Tag::GPSLatitudeRef, "S").unwrap_or(0.0),
        longitude: exif_gps(&exif, exif::Tag::GPSLongitude, exif::Tag::GPSLongitudeRef, "W").unwrap_or(0.0),
    })
}

fn exif_dimensions(exif: &exif::Exif) -> Option<(i32, i32)> {
    let w = exif
        .get_field(exif::Tag::PixelXDimension, exif::In::PRIMARY)?
        .value
        .get_uint(0)?;
    let h = exif
        .get_field(exif::Tag::PixelYDimension, exif::In::PRIMARY)?
        .value
        .get_uint(0)?;
    Some((w as i32, h as i32))
}

fn ascii_field(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Ascii(vecs) => {
            let bytes = vecs.first()?;
            std::str::from_utf8(bytes)
                .ok()
                .map(|s| s.trim_end_matches('\0').trim().to_string())
        }
        _ => None,
    }
}

fn exif_date(exif: &exif::Exif) -> Option<String> {
    let base = [
        exif::Tag::DateTimeOriginal,
        exif::Tag::DateTimeDigitized,
        exif::Tag::DateTime,
    ]
    .into_iter()
    .find_map(|tag| ascii_field(exif, tag).and_then(|s| parse_exif_datetime(&s)))?;

    let offset = ascii_field(exif, exif::Tag::OffsetTimeOriginal)
        .or_else(|| ascii_field(exif, exif::Tag::OffsetTime));
    match offset {
        Some(off) => Some(format!("{base}{off}")),
        None => Some(base),
    }
}

fn parse_exif_datetime(text: &str) -> Option<String> {
    let naive = chrono::NaiveDateTime::parse_from_str(text, "%Y:%m:%d %H:%M:%S").ok()?;
    let year: i32 = naive.format("%Y").to_string().parse().ok()?;
    if !(1..=9999).contains(&year) {
        return None;
    }
    Some(naive.format("%Y-%m-%dT%H:%M:%S").to_string())
}

fn exif_gps(exif: &exif::Exif, value_tag: exif::Tag, ref_tag: exif::Tag, negative_ref: &str) -> Option<f64> {
    let field = exif.get_field(value_tag, exif::In::PRIMARY)?;
    let exif::Value::Rational(rationals) = &field.value else {
        return None;
    };
    if rationals.len() < 3 {
        return None;
    }
    let decimal = rationals[0].to_f64() + rationals[1].to_f64() / 60.0 + rationals[2].to_f64() / 3600.0;
    let signed = if ascii_field(exif, ref_tag).as_deref() == Some(negative_ref) {
        -decimal
    } else {
        decimal
    };
    Some(signed)
}

fn mtime_iso_date(mtime: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(mtime as i64, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Round-trip `raw` through an ISO-8601 parse/reformat; a string that
/// doesn't parse, or whose year falls outside `1..=9999`, is dropped.
fn normalize_date(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return finalize_date(dt.date());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return finalize_date(d);
    }
    if let Ok(year) = raw.parse::<i32>() {
        if (1..=9999).contains(&year) {
            if let Some(date) = chrono::NaiveDate::from_ymd_opt(year, 1, 1) {
                return finalize_date(date);
            }
        }
        return String::new();
    }
    String::new()
}

fn finalize_date(date: chrono::NaiveDate) -> String {
    use chrono::Datelike;
    if !(1..=9999).contains(&date.year()) {
        return String::new();
    }
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detect_classifies_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("song.mp3");
        std::fs::write(&path, b"fake").unwrap();
        let detected = detect(&path).unwrap();
        assert_eq!(detected.media_type, MediaType::Audio);
        assert_eq!(detected.content_type, "audio/mpeg");
        assert!(!detected.etag.is_empty());
    }

    #[test]
    fn detect_rejects_unrecognized_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"text").unwrap();
        assert!(matches!(detect(&path), Err(Error::UnsupportedType(_))));
    }

    #[test]
    fn detect_rejects_blacklisted_playlist_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("list.m3u");
        std::fs::write(&path, b"#EXTM3U").unwrap();
        assert!(matches!(detect(&path), Err(Error::Blacklisted(_))));
    }

    #[test]
    fn detect_rejects_directories() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub.mp3");
        std::fs::create_dir(&sub).unwrap();
        assert!(matches!(detect(&sub), Err(Error::UnsupportedType(_))));
    }

    #[test]
    fn fallback_extract_sets_only_identity_fields() {
        let detected = DetectedFile {
            filename: "/music/a.ogg".to_string(),
            etag: "e1".to_string(),
            content_type: "audio/ogg".to_string(),
            mtime: 100,
            media_type: MediaType::Audio,
        };
        let file = fallback_extract(&detected);
        assert_eq!(file.filename, "/music/a.ogg");
        assert_eq!(file.etag, "e1");
        assert_eq!(file.title, "");
        assert_eq!(file.modification_time, 100);
    }

    #[test]
    fn normalize_date_round_trips_full_datetime() {
        assert_eq!(normalize_date("2020-05-17T10:00:00"), "2020-05-17");
    }

    #[test]
    fn normalize_date_accepts_year_only() {
        assert_eq!(normalize_date("1999"), "1999-01-01");
    }

    #[test]
    fn normalize_date_rejects_unparseable_input() {
        assert_eq!(normalize_date("not a date"), "");
    }

    #[test]
    fn normalize_date_rejects_out_of_range_year() {
        assert_eq!(normalize_date("0"), "");
        assert_eq!(normalize_date("20000"), "");
    }

    #[test]
    fn normalize_date_empty_input_stays_empty() {
        assert_eq!(normalize_date(""), "");
    }
}
