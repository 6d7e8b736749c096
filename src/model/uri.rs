//! URI composition and filename-to-title derivation.
//!
//! Grounded in `mediascanner/utils.cc`'s `filenameToTitle`, `getUri`,
//! `make_album_art_uri` and `make_thumbnail_uri`.

/// Derive a searchable title from the last path segment: strip the final
/// extension, then replace `. _ ( ) [ ] { } \` with spaces.
///
/// This is applied at read time only (§3); it is never stored.
pub fn filename_to_title(filename: &str) -> String {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    let stem = match base.rfind('.') {
        Some(idx) => &base[..idx],
        None => base,
    };
    stem.chars()
        .map(|c| match c {
            '.' | '_' | '(' | ')' | '[' | ']' | '{' | '}' | '\\' => ' ',
            other => other,
        })
        .collect()
}

/// Build a `file://` URI from an absolute filesystem path, percent-encoding
/// each path segment (mirrors `g_filename_to_uri`'s escaping of reserved
/// characters while leaving `/` as a separator).
pub fn file_uri(path: &str) -> String {
    let encoded = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("file://{encoded}")
}

/// `image://albumart/artist=<artist>&album=<album>`, both query-string escaped.
pub fn make_album_art_uri(artist: &str, album: &str) -> String {
    format!(
        "image://albumart/artist={}&album={}",
        urlencoding::encode(artist),
        urlencoding::encode(album)
    )
}

/// `image://thumbnailer/<uri>`.
pub fn make_thumbnail_uri(uri: &str) -> String {
    format!("image://thumbnailer/{uri}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_extension_and_replaces_punctuation() {
        assert_eq!(filename_to_title("/a/b/My_Song (Remix).mp3"), "My Song  Remix ");
    }

    #[test]
    fn no_directory_component() {
        assert_eq!(filename_to_title("track.flac"), "track");
    }

    #[test]
    fn no_extension() {
        assert_eq!(filename_to_title("/a/README"), "README");
    }

    #[test]
    fn file_uri_encodes_spaces() {
        assert_eq!(file_uri("/my music/song.ogg"), "file:///my%20music/song.ogg");
    }

    #[test]
    fn album_art_uri_escapes_ampersand() {
        assert_eq!(
            make_album_art_uri("AC&DC", "Back in Black"),
            "image://albumart/artist=AC%26DC&album=Back%20in%20Black"
        );
    }

    #[test]
    fn thumbnail_uri_wraps_inner_uri() {
        assert_eq!(
            make_thumbnail_uri("file:///a/b.jpg"),
            "image://thumbnailer/file:///a/b.jpg"
        );
    }
}
