//! Schema DDL and the compiled-in schema version.
//!
//! On an open-for-write, a stored version that doesn't match
//! [`SCHEMA_VERSION`] means every table is dropped and recreated (no
//! migration is attempted, per §4.A). An open-for-read with a mismatch
//! fails with [`crate::error::Error::SchemaMismatch`].

/// Bumped whenever the DDL below changes incompatibly. The value itself is
/// an implementation detail of this crate, not part of the wire contract
/// with the original daemon (which used `10`) — see DESIGN.md.
pub const SCHEMA_VERSION: i64 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    content_type TEXT NOT NULL DEFAULT '',
    etag TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    author TEXT NOT NULL DEFAULT '',
    album TEXT NOT NULL DEFAULT '',
    album_artist TEXT NOT NULL DEFAULT '',
    date TEXT NOT NULL DEFAULT '',
    genre TEXT NOT NULL DEFAULT '',
    disc_number INTEGER NOT NULL DEFAULT 0,
    track_number INTEGER NOT NULL DEFAULT 0,
    duration INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    latitude REAL NOT NULL DEFAULT 0.0,
    longitude REAL NOT NULL DEFAULT 0.0,
    has_thumbnail INTEGER NOT NULL DEFAULT 0,
    modification_time INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS media_attic (
    filename TEXT NOT NULL UNIQUE,
    content_type TEXT NOT NULL DEFAULT '',
    etag TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    author TEXT NOT NULL DEFAULT '',
    album TEXT NOT NULL DEFAULT '',
    album_artist TEXT NOT NULL DEFAULT '',
    date TEXT NOT NULL DEFAULT '',
    genre TEXT NOT NULL DEFAULT '',
    disc_number INTEGER NOT NULL DEFAULT 0,
    track_number INTEGER NOT NULL DEFAULT 0,
    duration INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    latitude REAL NOT NULL DEFAULT 0.0,
    longitude REAL NOT NULL DEFAULT 0.0,
    has_thumbnail INTEGER NOT NULL DEFAULT 0,
    modification_time INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS broken_files (
    filename TEXT PRIMARY KEY,
    etag TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS media_fts USING fts4(title, artist, album);

CREATE TRIGGER IF NOT EXISTS media_fts_ai AFTER INSERT ON media BEGIN
    INSERT INTO media_fts(docid, title, artist, album)
    VALUES (new.id, new.title, new.author, new.album);
END;

CREATE TRIGGER IF NOT EXISTS media_fts_au AFTER UPDATE ON media BEGIN
    UPDATE media_fts SET title = new.title, artist = new.author, album = new.album
    WHERE docid = new.id;
END;

CREATE TRIGGER IF NOT EXISTS media_fts_ad AFTER DELETE ON media BEGIN
    DELETE FROM media_fts WHERE docid = old.id;
END;
"#;

pub const DROP_TABLES: &str = r#"
DROP TRIGGER IF EXISTS media_fts_ai;
DROP TRIGGER IF EXISTS media_fts_au;
DROP TRIGGER IF EXISTS media_fts_ad;
DROP TABLE IF EXISTS media_fts;
DROP TABLE IF EXISTS media_attic;
DROP TABLE IF EXISTS media;
DROP TABLE IF EXISTS broken_files;
DROP TABLE IF EXISTS schema_meta;
"#;
