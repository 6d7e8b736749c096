//! Catalog Store (§4.A): a single embedded SQLite database holding the
//! live `media` table, the `media_attic` shadow table, `broken_files`,
//! and an FTS4 `media_fts` index kept in sync by triggers (see
//! [`schema`]).
//!
//! The connection pool is capped at one connection (`max_connections(1)`)
//! so every statement this crate issues against the store is naturally
//! serialized, reproducing the "process-wide store mutex" contract of
//! §5 without a separate `Mutex` — concurrent callers simply queue on
//! pool checkout, exactly like the original's single-threaded event loop.

pub mod rank;
pub mod schema;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{Album, Filter, MediaFile, MediaType, OrderBy};

const BUSY_RETRY_LIMIT: usize = 100;
const LIKE_ESCAPE: char = '!';

/// Whether the store was opened expecting to write (rebuilds on schema
/// mismatch) or only to read (fails on schema mismatch), per §4.A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent, in [`OpenMode::ReadWrite`]) the catalog
    /// database at `path`, applying schema-version rules from §4.A.
    pub async fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        if mode == OpenMode::ReadWrite {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(mode == OpenMode::ReadWrite)
            .read_only(mode == OpenMode::ReadOnly);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Store { pool };
        store.reconcile_schema(mode).await?;
        Ok(store)
    }

    async fn reconcile_schema(&self, mode: OpenMode) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_meta LIMIT 1")
                .fetch_optional(&mut *conn)
                .await
                .unwrap_or(None);

        match (existing, mode) {
            (Some((v,)), _) if v == schema::SCHEMA_VERSION => Ok(()),
            (Some((v,)), OpenMode::ReadOnly) => Err(Error::SchemaMismatch {
                found: v,
                expected: schema::SCHEMA_VERSION,
            }),
            (_, OpenMode::ReadOnly) => Err(Error::SchemaMismatch {
                found: -1,
                expected: schema::SCHEMA_VERSION,
            }),
            (_, OpenMode::ReadWrite) => {
                sqlx::query(schema::DROP_TABLES).execute(&mut *conn).await?;
                sqlx::query(schema::CREATE_TABLES)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("DELETE FROM schema_meta")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("INSERT INTO schema_meta (version) VALUES (?)")
                    .bind(schema::SCHEMA_VERSION)
                    .execute(&mut *conn)
                    .await?;
                tracing::info!(version = schema::SCHEMA_VERSION, "rebuilt catalog schema");
                Ok(())
            }
        }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn insert(&self, file: &MediaFile) -> Result<()> {
        retry_busy(|| async {
            let mut tx = self.pool.begin().await?;
            insert_row(&mut tx, file).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, filename: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query("DELETE FROM media WHERE filename = ?")
            .bind(filename)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn lookup(&self, filename: &str) -> Result<MediaFile> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(SELECT_MEDIA_COLUMNS_SQL)
            .bind(filename)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(row_to_media(&row)?.1),
            None => Err(Error::not_found(filename)),
        }
    }

    pub async fn insert_broken_file(&self, filename: &str, etag: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO broken_files (filename, etag) VALUES (?, ?) \
             ON CONFLICT(filename) DO UPDATE SET etag = excluded.etag",
        )
        .bind(filename)
        .bind(etag)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn remove_broken_file(&self, filename: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query("DELETE FROM broken_files WHERE filename = ?")
            .bind(filename)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn is_broken_file(&self, filename: &str, etag: &str) -> Result<bool> {
        let mut conn = self.acquire().await?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT etag FROM broken_files WHERE filename = ?")
                .bind(filename)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.is_some_and(|(stored,)| stored == etag))
    }

    pub async fn get_etag(&self, filename: &str) -> Result<String> {
        let mut conn = self.acquire().await?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT etag FROM media WHERE filename = ?")
                .bind(filename)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.map(|(e,)| e).unwrap_or_default())
    }

    /// `query(term, type, filter)` — FTS search restricted to one media
    /// type, or a plain type-scoped listing when `term` is empty.
    pub async fn query(
        &self,
        term: &str,
        media_type: MediaType,
        filter: &Filter,
    ) -> Result<Vec<MediaFile>> {
        if media_type == MediaType::AllMedia {
            return Err(Error::constraint("query() does not accept MediaType::AllMedia"));
        }
        let mut conn = self.acquire().await?;
        let mut rows = fetch_media_rows(&mut conn, term, Some(media_type), filter).await?;
        sort_media_rows(&mut rows, filter.order, filter.reverse, !term.is_empty());
        Ok(paginate(rows, filter).into_iter().map(|r| r.file).collect())
    }

    pub async fn query_albums(&self, term: &str, filter: &Filter) -> Result<Vec<Album>> {
        validate_album_order(filter.order)?;
        let mut conn = self.acquire().await?;
        let rows = fetch_media_rows(&mut conn, term, Some(MediaType::Audio), filter).await?;
        let albums = group_albums(rows, filter.order, filter.reverse);
        Ok(paginate(albums, filter))
    }

    pub async fn query_artists(&self, term: &str, filter: &Filter) -> Result<Vec<String>> {
        validate_name_order(filter.order)?;
        let mut conn = self.acquire().await?;
        let rows = fetch_media_rows(&mut conn, term, Some(MediaType::Audio), filter).await?;
        let names = distinct_sorted(rows.iter().map(|r| r.file.author.clone()), filter.reverse);
        Ok(paginate(names, filter))
    }

    pub async fn get_album_songs(&self, album: &str, album_artist: &str) -> Result<Vec<MediaFile>> {
        let mut conn = self.acquire().await?;
        let sql = format!(
            "{SELECT_MEDIA_COLUMNS_BASE} WHERE type = ? AND album = ? AND album_artist = ? \
             ORDER BY disc_number ASC, track_number ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(MediaType::Audio.as_i64())
            .bind(album)
            .bind(album_artist)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(|r| Ok(row_to_media(r)?.1)).collect()
    }

    pub async fn list_songs(&self, filter: &Filter) -> Result<Vec<MediaFile>> {
        let mut conn = self.acquire().await?;
        let mut rows = fetch_media_rows(&mut conn, "", Some(MediaType::Audio), filter).await?;
        rows.sort_by(|a, b| {
            (
                &a.file.album_artist,
                &a.file.album,
                a.file.disc_number,
                a.file.track_number,
            )
                .cmp(&(&b.file.album_artist, &b.file.album, b.file.disc_number, b.file.track_number))
        });
        if filter.reverse {
            rows.reverse();
        }
        Ok(paginate(rows, filter).into_iter().map(|r| r.file).collect())
    }

    pub async fn list_albums(&self, filter: &Filter) -> Result<Vec<Album>> {
        validate_album_order(filter.order)?;
        let mut conn = self.acquire().await?;
        let rows = fetch_media_rows(&mut conn, "", Some(MediaType::Audio), filter).await?;
        let albums = group_albums(rows, filter.order, filter.reverse);
        Ok(paginate(albums, filter))
    }

    pub async fn list_artists(&self, filter: &Filter) -> Result<Vec<String>> {
        validate_name_order(filter.order)?;
        let mut conn = self.acquire().await?;
        let rows = fetch_media_rows(&mut conn, "", Some(MediaType::Audio), filter).await?;
        let names = distinct_sorted(rows.iter().map(|r| r.file.author.clone()), filter.reverse);
        Ok(paginate(names, filter))
    }

    pub async fn list_album_artists(&self, filter: &Filter) -> Result<Vec<String>> {
        validate_name_order(filter.order)?;
        let mut conn = self.acquire().await?;
        let rows = fetch_media_rows(&mut conn, "", Some(MediaType::Audio), filter).await?;
        let names = distinct_sorted(
            rows.iter().map(|r| r.file.effective_album_artist()),
            filter.reverse,
        );
        Ok(paginate(names, filter))
    }

    pub async fn list_genres(&self, filter: &Filter) -> Result<Vec<String>> {
        validate_name_order(filter.order)?;
        let mut conn = self.acquire().await?;
        let rows = fetch_media_rows(&mut conn, "", Some(MediaType::Audio), filter).await?;
        let names = distinct_sorted(
            rows.iter().map(|r| r.file.genre.clone()).filter(|g| !g.is_empty()),
            filter.reverse,
        );
        Ok(paginate(names, filter))
    }

    pub async fn has_media(&self, media_type: MediaType) -> Result<bool> {
        let mut conn = self.acquire().await?;
        let types: Vec<i64> = match media_type {
            MediaType::AllMedia => vec![
                MediaType::Audio.as_i64(),
                MediaType::Video.as_i64(),
                MediaType::Image.as_i64(),
            ],
            other => vec![other.as_i64()],
        };
        let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT EXISTS(SELECT 1 FROM media WHERE type IN ({placeholders}))");
        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        for t in types {
            q = q.bind(t);
        }
        let exists: i64 = q.fetch_one(&mut *conn).await?;
        Ok(exists != 0)
    }

    pub async fn size(&self) -> Result<i64> {
        let mut conn = self.acquire().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM media")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    /// Delete every live row whose file is gone, or whose path now falls
    /// under a `.nomedia` opt-out marker. Ancestor checks are memoized
    /// per directory for the duration of one call (§4.A).
    pub async fn prune_deleted(&self) -> Result<usize> {
        let mut conn = self.acquire().await?;
        let filenames: Vec<String> = sqlx::query_scalar("SELECT filename FROM media")
            .fetch_all(&mut *conn)
            .await?;

        let mut blocked_cache: std::collections::HashMap<std::path::PathBuf, bool> =
            std::collections::HashMap::new();
        let mut to_remove = Vec::new();
        for filename in filenames {
            let path = std::path::Path::new(&filename);
            let missing = !path.exists();
            let blocked = path
                .parent()
                .map(|dir| {
                    *blocked_cache
                        .entry(dir.to_path_buf())
                        .or_insert_with(|| crate::fsutil::has_scanblock_in_ancestry(path))
                })
                .unwrap_or(false);
            if missing || blocked {
                to_remove.push(filename);
            }
        }

        let mut tx = self.pool.begin().await?;
        for filename in &to_remove {
            sqlx::query("DELETE FROM media WHERE filename = ?")
                .bind(filename)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(to_remove.len())
    }

    /// Move rows whose `filename` begins with `prefix` (raw prefix, no
    /// implied path boundary) from live to attic, in one transaction.
    pub async fn archive_items(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", escape_like(prefix));
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO media_attic ({COLUMNS}) \
             SELECT {COLUMNS} FROM media WHERE filename LIKE ? ESCAPE '{LIKE_ESCAPE}'"
        ))
        .bind(&pattern)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "DELETE FROM media WHERE filename LIKE ? ESCAPE '{LIKE_ESCAPE}'"
        ))
        .bind(&pattern)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn restore_items(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", escape_like(prefix));
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO media (id, {COLUMNS}) \
             SELECT NULL, {COLUMNS} FROM media_attic WHERE filename LIKE ? ESCAPE '{LIKE_ESCAPE}'"
        ))
        .bind(&pattern)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "DELETE FROM media_attic WHERE filename LIKE ? ESCAPE '{LIKE_ESCAPE}'"
        ))
        .bind(&pattern)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete every live row under `directory` (a proper directory
    /// ancestor — `/a/b` never matches `/a/bc/x`).
    pub async fn remove_subtree(&self, directory: &str) -> Result<()> {
        let with_slash = if directory.ends_with('/') {
            directory.to_string()
        } else {
            format!("{directory}/")
        };
        let pattern = format!("{}%", escape_like(&with_slash));
        let mut conn = self.acquire().await?;
        sqlx::query(&format!(
            "DELETE FROM media WHERE filename LIKE ? ESCAPE '{LIKE_ESCAPE}'"
        ))
        .bind(&pattern)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Scoped acquisition of a transaction; `Transaction::commit` commits
    /// and opens a fresh one for continued writes. Dropping without a
    /// final `commit()` rolls back, via `sqlx::Transaction`'s own `Drop`.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        let inner = self.pool.begin().await?;
        Ok(Transaction {
            pool: self.pool.clone(),
            inner: Some(inner),
        })
    }
}

/// The read surface the CLI's `query`/`list-*`/`stats` subcommands are
/// written against, in place of the out-of-scope RPC façade's base class.
/// `Store` is the only implementation this crate ships; the trait exists
/// so those call sites name a capability set rather than a concrete type.
#[async_trait::async_trait]
pub trait ReadApi {
    async fn query(&self, term: &str, media_type: MediaType, filter: &Filter) -> Result<Vec<MediaFile>>;
    async fn query_albums(&self, term: &str, filter: &Filter) -> Result<Vec<Album>>;
    async fn query_artists(&self, term: &str, filter: &Filter) -> Result<Vec<String>>;
    async fn list_songs(&self, filter: &Filter) -> Result<Vec<MediaFile>>;
    async fn list_albums(&self, filter: &Filter) -> Result<Vec<Album>>;
    async fn list_artists(&self, filter: &Filter) -> Result<Vec<String>>;
    async fn list_album_artists(&self, filter: &Filter) -> Result<Vec<String>>;
    async fn list_genres(&self, filter: &Filter) -> Result<Vec<String>>;
    async fn lookup(&self, filename: &str) -> Result<MediaFile>;
    async fn has_media(&self, media_type: MediaType) -> Result<bool>;
    async fn size(&self) -> Result<i64>;
}

#[async_trait::async_trait]
impl ReadApi for Store {
    async fn query(&self, term: &str, media_type: MediaType, filter: &Filter) -> Result<Vec<MediaFile>> {
        Store::query(self, term, media_type, filter).await
    }

    async fn query_albums(&self, term: &str, filter: &Filter) -> Result<Vec<Album>> {
        Store::query_albums(self, term, filter).await
    }

    async fn query_artists(&self, term: &str, filter: &Filter) -> Result<Vec<String>> {
        Store::query_artists(self, term, filter).await
    }

    async fn list_songs(&self, filter: &Filter) -> Result<Vec<MediaFile>> {
        Store::list_songs(self, filter).await
    }

    async fn list_albums(&self, filter: &Filter) -> Result<Vec<Album>> {
        Store::list_albums(self, filter).await
    }

    async fn list_artists(&self, filter: &Filter) -> Result<Vec<String>> {
        Store::list_artists(self, filter).await
    }

    async fn list_album_artists(&self, filter: &Filter) -> Result<Vec<String>> {
        Store::list_album_artists(self, filter).await
    }

    async fn list_genres(&self, filter: &Filter) -> Result<Vec<String>> {
        Store::list_genres(self, filter).await
    }

    async fn lookup(&self, filename: &str) -> Result<MediaFile> {
        Store::lookup(self, filename).await
    }

    async fn has_media(&self, media_type: MediaType) -> Result<bool> {
        Store::has_media(self, media_type).await
    }

    async fn size(&self) -> Result<i64> {
        Store::size(self).await
    }
}

/// A long-lived transaction spanning many writes (used by the volume
/// manager's bulk scan, §4.F), with periodic `commit()` checkpoints.
pub struct Transaction {
    pool: SqlitePool,
    inner: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl Transaction {
    pub async fn insert(&mut self, file: &MediaFile) -> Result<()> {
        let tx = self.inner.as_mut().expect("transaction already finished");
        insert_row(&mut **tx, file).await
    }

    pub async fn remove(&mut self, filename: &str) -> Result<()> {
        let tx = self.inner.as_mut().expect("transaction already finished");
        sqlx::query("DELETE FROM media WHERE filename = ?")
            .bind(filename)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn is_broken_file(&mut self, filename: &str, etag: &str) -> Result<bool> {
        let tx = self.inner.as_mut().expect("transaction already finished");
        let row: Option<(String,)> =
            sqlx::query_as("SELECT etag FROM broken_files WHERE filename = ?")
                .bind(filename)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(row.is_some_and(|(stored,)| stored == etag))
    }

    pub async fn get_etag(&mut self, filename: &str) -> Result<String> {
        let tx = self.inner.as_mut().expect("transaction already finished");
        let row: Option<(String,)> = sqlx::query_as("SELECT etag FROM media WHERE filename = ?")
            .bind(filename)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|(e,)| e).unwrap_or_default())
    }

    pub async fn insert_broken_file(&mut self, filename: &str, etag: &str) -> Result<()> {
        let tx = self.inner.as_mut().expect("transaction already finished");
        sqlx::query(
            "INSERT INTO broken_files (filename, etag) VALUES (?, ?) \
             ON CONFLICT(filename) DO UPDATE SET etag = excluded.etag",
        )
        .bind(filename)
        .bind(etag)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.inner.take() {
            tx.commit().await?;
        }
        self.inner = Some(self.pool.begin().await?);
        Ok(())
    }
}

async fn insert_row(conn: &mut SqliteConnection, file: &MediaFile) -> Result<()> {
    if !file.filename.starts_with('/') {
        return Err(Error::constraint(format!(
            "filename must be absolute: {}",
            file.filename
        )));
    }
    if !file.media_type.is_storable() {
        return Err(Error::constraint(format!(
            "type {:?} is not storable",
            file.media_type
        )));
    }
    sqlx::query(
        r#"
        INSERT INTO media (
            filename, content_type, etag, title, author, album, album_artist,
            date, genre, disc_number, track_number, duration, width, height,
            latitude, longitude, has_thumbnail, modification_time, type
        ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
        ON CONFLICT(filename) DO UPDATE SET
            content_type = excluded.content_type,
            etag = excluded.etag,
            title = excluded.title,
            author = excluded.author,
            album = excluded.album,
            album_artist = excluded.album_artist,
            date = excluded.date,
            genre = excluded.genre,
            disc_number = excluded.disc_number,
            track_number = excluded.track_number,
            duration = excluded.duration,
            width = excluded.width,
            height = excluded.height,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            has_thumbnail = excluded.has_thumbnail,
            modification_time = excluded.modification_time,
            type = excluded.type
        "#,
    )
    .bind(&file.filename)
    .bind(&file.content_type)
    .bind(&file.etag)
    .bind(&file.title)
    .bind(&file.author)
    .bind(&file.album)
    .bind(&file.album_artist)
    .bind(&file.date)
    .bind(&file.genre)
    .bind(file.disc_number)
    .bind(file.track_number)
    .bind(file.duration)
    .bind(file.width)
    .bind(file.height)
    .bind(file.latitude)
    .bind(file.longitude)
    .bind(file.has_thumbnail)
    .bind(file.modification_time as i64)
    .bind(file.media_type.as_i64())
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM broken_files WHERE filename = ?")
        .bind(&file.filename)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

const COLUMNS: &str = "filename, content_type, etag, title, author, album, album_artist, \
    date, genre, disc_number, track_number, duration, width, height, latitude, longitude, \
    has_thumbnail, modification_time, type";

const SELECT_MEDIA_COLUMNS_BASE: &str = "SELECT id, filename, content_type, etag, title, author, \
    album, album_artist, date, genre, disc_number, track_number, duration, width, height, \
    latitude, longitude, has_thumbnail, modification_time, type FROM media";

const SELECT_MEDIA_COLUMNS_SQL: &str = "SELECT id, filename, content_type, etag, title, author, \
    album, album_artist, date, genre, disc_number, track_number, duration, width, height, \
    latitude, longitude, has_thumbnail, modification_time, type FROM media WHERE filename = ?";

struct MediaRow {
    id: i64,
    file: MediaFile,
    matchinfo: Option<Vec<u8>>,
}

fn row_to_media(row: &SqliteRow) -> Result<(i64, MediaFile)> {
    let id: i64 = row.try_get("id")?;
    let file = MediaFile {
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        etag: row.try_get("etag")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        album: row.try_get("album")?,
        album_artist: row.try_get("album_artist")?,
        date: row.try_get("date")?,
        genre: row.try_get("genre")?,
        disc_number: row.try_get("disc_number")?,
        track_number: row.try_get("track_number")?,
        duration: row.try_get("duration")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        has_thumbnail: row.try_get("has_thumbnail")?,
        modification_time: row.try_get::<i64, _>("modification_time")? as u64,
        media_type: MediaType::from_i64(row.try_get("type")?),
    };
    Ok((id, file))
}

/// Fetch media rows for one type, optionally restricted by an FTS prefix
/// match on `term` and by the equality predicates in `filter`. Returns
/// rows ordered by `id ASC` (the crate's documented "first-seen" tie
/// break, see DESIGN.md).
async fn fetch_media_rows(
    conn: &mut SqliteConnection,
    term: &str,
    media_type: Option<MediaType>,
    filter: &Filter,
) -> Result<Vec<MediaRow>> {
    let mut conditions = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(t) = media_type {
        conditions.push("m.type = ?".to_string());
        binds.push(t.as_i64().to_string());
    }
    if let Some(artist) = &filter.artist {
        conditions.push("m.author = ?".to_string());
        binds.push(artist.clone());
    }
    if let Some(album) = &filter.album {
        conditions.push("m.album = ?".to_string());
        binds.push(album.clone());
    }
    if let Some(album_artist) = &filter.album_artist {
        conditions.push("m.album_artist = ?".to_string());
        binds.push(album_artist.clone());
    }
    if let Some(genre) = &filter.genre {
        conditions.push("m.genre = ?".to_string());
        binds.push(genre.clone());
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let (sql, fts_term) = if term.trim().is_empty() {
        (
            format!(
                "SELECT m.id, m.filename, m.content_type, m.etag, m.title, m.author, m.album, \
                 m.album_artist, m.date, m.genre, m.disc_number, m.track_number, m.duration, \
                 m.width, m.height, m.latitude, m.longitude, m.has_thumbnail, \
                 m.modification_time, m.type, NULL as matchinfo \
                 FROM media m {where_clause} ORDER BY m.id ASC"
            ),
            None,
        )
    } else {
        let fts_clause = if conditions.is_empty() {
            "WHERE media_fts MATCH ?".to_string()
        } else {
            format!("WHERE media_fts MATCH ? AND {}", conditions.join(" AND "))
        };
        (
            format!(
                "SELECT m.id, m.filename, m.content_type, m.etag, m.title, m.author, m.album, \
                 m.album_artist, m.date, m.genre, m.disc_number, m.track_number, m.duration, \
                 m.width, m.height, m.latitude, m.longitude, m.has_thumbnail, \
                 m.modification_time, m.type, matchinfo(media_fts, 'pcx') as matchinfo \
                 FROM media_fts JOIN media m ON m.id = media_fts.docid {fts_clause} \
                 ORDER BY m.id ASC"
            ),
            Some(prefix_match_query(term)),
        )
    };

    let mut q = sqlx::query(&sql);
    if let Some(fts) = &fts_term {
        q = q.bind(fts);
    }
    for b in &binds {
        q = q.bind(b);
    }

    let rows = q.fetch_all(conn).await?;
    rows.iter()
        .map(|row| {
            let (id, file) = row_to_media(row)?;
            let matchinfo: Option<Vec<u8>> = row.try_get("matchinfo").ok();
            Ok(MediaRow { id, file, matchinfo })
        })
        .collect()
}

/// Append `*` to the last whitespace-separated token only (§4.A prefix
/// match semantics).
fn prefix_match_query(term: &str) -> String {
    let mut words: Vec<&str> = term.split_whitespace().collect();
    if let Some(last) = words.pop() {
        let starred = format!("{last}*");
        words.push(&starred);
        return words.join(" ");
    }
    String::new()
}

fn sort_media_rows(rows: &mut [MediaRow], order: OrderBy, reverse: bool, has_term: bool) {
    match order {
        OrderBy::Title => rows.sort_by(|a, b| a.file.effective_title().cmp(&b.file.effective_title())),
        OrderBy::Date => rows.sort_by(|a, b| a.file.date.cmp(&b.file.date)),
        OrderBy::Modified => rows.sort_by(|a, b| a.file.modification_time.cmp(&b.file.modification_time)),
        OrderBy::Rank | OrderBy::Default if has_term => {
            rows.sort_by(|a, b| {
                let sa = a.matchinfo.as_deref().map(rank::score_from_matchinfo).unwrap_or(0.0);
                let sb = b.matchinfo.as_deref().map(rank::score_from_matchinfo).unwrap_or(0.0);
                sb.partial_cmp(&sa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        OrderBy::Rank | OrderBy::Default => rows.sort_by(|a, b| a.id.cmp(&b.id)),
    }
    if reverse {
        rows.reverse();
    }
}

fn validate_album_order(order: OrderBy) -> Result<()> {
    match order {
        OrderBy::Rank | OrderBy::Date => Err(Error::InvalidOrder(order)),
        _ => Ok(()),
    }
}

fn validate_name_order(order: OrderBy) -> Result<()> {
    match order {
        OrderBy::Default | OrderBy::Title => Ok(()),
        _ => Err(Error::InvalidOrder(order)),
    }
}

/// Group audio rows into `Album` aggregates by `(album, album_artist)`,
/// picking the first-seen value (lowest `id`, per the rows already being
/// `id ASC`-ordered) for every aggregated field.
fn group_albums(rows: Vec<MediaRow>, order: OrderBy, reverse: bool) -> Vec<Album> {
    struct Agg {
        album: Album,
        mtime: u64,
        first_id: i64,
    }

    let mut order_of_keys: Vec<(String, String)> = Vec::new();
    let mut groups: std::collections::HashMap<(String, String), Agg> = std::collections::HashMap::new();

    for row in rows {
        if row.file.album.is_empty() {
            continue;
        }
        let key = (row.file.album.clone(), row.file.effective_album_artist());
        groups.entry(key.clone()).or_insert_with(|| {
            order_of_keys.push(key.clone());
            Agg {
                album: Album {
                    title: row.file.album.clone(),
                    artist: row.file.effective_album_artist(),
                    date: row.file.date.clone(),
                    genre: row.file.genre.clone(),
                    art_file_path: String::new(),
                    has_thumbnail: row.file.has_thumbnail,
                },
                mtime: row.file.modification_time,
                first_id: row.id,
            }
        });
    }

    let mut albums: Vec<Agg> = order_of_keys
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect();

    match order {
        OrderBy::Title => albums.sort_by(|a, b| a.album.title.cmp(&b.album.title)),
        OrderBy::Modified => albums.sort_by(|a, b| a.mtime.cmp(&b.mtime)),
        _ => albums.sort_by(|a, b| a.first_id.cmp(&b.first_id)),
    }
    if reverse {
        albums.reverse();
    }
    albums.into_iter().map(|a| a.album).collect()
}

fn distinct_sorted(names: impl Iterator<Item = String>, reverse: bool) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<String> = names.filter(|n| seen.insert(n.clone())).collect();
    out.sort();
    if reverse {
        out.reverse();
    }
    out
}

fn paginate<T>(items: Vec<T>, filter: &Filter) -> Vec<T> {
    let offset = filter.offset.max(0) as usize;
    let mut iter = items.into_iter().skip(offset);
    if filter.limit < 0 {
        iter.collect()
    } else {
        iter.by_ref().take(filter.limit as usize).collect()
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Retry a SQLite `BUSY` response up to [`BUSY_RETRY_LIMIT`] times before
/// surfacing [`Error::Busy`]. Used around statements issued outside the
/// pool's own connection-checkout serialization (there are none today,
/// since `max_connections(1)` already serializes everything — kept as
/// the documented hook §4.A's retry contract refers to).
async fn retry_busy<F, Fut, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(Error::Database(sqlx::Error::Database(db_err)))
                if db_err.message().contains("database is locked") && attempts < BUSY_RETRY_LIMIT =>
            {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaFileBuilder, MediaType};
    use tempfile::tempdir;

    async fn open_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path, OpenMode::ReadWrite).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn schema_rebuild_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = Store::open(&path, OpenMode::ReadWrite).await.unwrap();
            let f = MediaFileBuilder::new("/a.ogg", MediaType::Audio)
                .title("t")
                .freeze();
            store.insert(&f).await.unwrap();
        }
        let store = Store::open(&path, OpenMode::ReadWrite).await.unwrap();
        assert_eq!(store.size().await.unwrap(), 1);
        assert_eq!(store.lookup("/a.ogg").await.unwrap().title, "t");
    }

    #[tokio::test]
    async fn insert_rejects_relative_path() {
        let (store, _dir) = open_store().await;
        let f = MediaFileBuilder::new("relative.ogg", MediaType::Audio).freeze();
        assert!(matches!(store.insert(&f).await, Err(Error::ConstraintError(_))));
    }

    #[tokio::test]
    async fn insert_rejects_unstorable_type() {
        let (store, _dir) = open_store().await;
        let f = MediaFileBuilder::new("/a.ogg", MediaType::Unknown).freeze();
        assert!(matches!(store.insert(&f).await, Err(Error::ConstraintError(_))));
    }

    #[tokio::test]
    async fn lookup_missing_is_not_found() {
        let (store, _dir) = open_store().await;
        assert!(matches!(store.lookup("/missing.ogg").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn broken_file_tracking() {
        let (store, _dir) = open_store().await;
        store.insert_broken_file("/a.ogg", "etag1").await.unwrap();
        assert!(store.is_broken_file("/a.ogg", "etag1").await.unwrap());
        assert!(!store.is_broken_file("/a.ogg", "etag2").await.unwrap());

        let f = MediaFileBuilder::new("/a.ogg", MediaType::Audio)
            .etag("etag1")
            .freeze();
        store.insert(&f).await.unwrap();
        assert!(!store.is_broken_file("/a.ogg", "etag1").await.unwrap());
    }

    #[tokio::test]
    async fn query_ranking_prefers_title_then_album_then_artist() {
        let (store, _dir) = open_store().await;
        let files = [
            ("/all.ogg", "aaa title", "aaa artist", "aaa album"),
            ("/title.ogg", "aaa title", "other", "other"),
            ("/album.ogg", "other", "other", "aaa album"),
            ("/artist.ogg", "other", "aaa artist", "other"),
            ("/none.ogg", "other", "other", "other"),
        ];
        for (path, title, artist, album) in files {
            let f = MediaFileBuilder::new(path, MediaType::Audio)
                .title(title)
                .author(artist)
                .album(album)
                .freeze();
            store.insert(&f).await.unwrap();
        }

        let filter = Filter::new().with_order(OrderBy::Rank);
        let results = store.query("aaa", MediaType::Audio, &filter).await.unwrap();
        let names: Vec<&str> = results
            .iter()
            .map(|f| f.filename.rsplit('/').next().unwrap())
            .collect();
        assert_eq!(names, vec!["all.ogg", "title.ogg", "album.ogg", "artist.ogg"]);
    }

    #[tokio::test]
    async fn remove_subtree_is_path_safe() {
        let (store, _dir) = open_store().await;
        for path in [
            "/hello_%/world.mp3",
            "/hello_%/a/b/c/world.mp3",
            "/hello_%sibling.mp3",
            "/helloxyz.mp3",
        ] {
            let f = MediaFileBuilder::new(path, MediaType::Audio).freeze();
            store.insert(&f).await.unwrap();
        }
        store.remove_subtree("/hello_%").await.unwrap();
        assert_eq!(store.size().await.unwrap(), 2);
        assert!(store.lookup("/hello_%sibling.mp3").await.is_ok());
        assert!(store.lookup("/helloxyz.mp3").await.is_ok());
    }

    #[tokio::test]
    async fn archive_restore_round_trip() {
        let (store, _dir) = open_store().await;
        let media_file = MediaFileBuilder::new("/media/u/song.ogg", MediaType::Audio)
            .title("song")
            .freeze();
        let home_file = MediaFileBuilder::new("/home/user/song.ogg", MediaType::Audio)
            .title("home")
            .freeze();
        store.insert(&media_file).await.unwrap();
        store.insert(&home_file).await.unwrap();

        store.archive_items("/media/u").await.unwrap();
        assert!(store.lookup("/media/u/song.ogg").await.is_err());
        assert!(store.lookup("/home/user/song.ogg").await.is_ok());

        store.restore_items("/media/u").await.unwrap();
        let restored = store.lookup("/media/u/song.ogg").await.unwrap();
        assert_eq!(restored.title, "song");
    }

    #[tokio::test]
    async fn query_albums_rejects_rank_and_date() {
        let (store, _dir) = open_store().await;
        let filter = Filter::new().with_order(OrderBy::Rank);
        assert!(matches!(
            store.query_albums("", &filter).await,
            Err(Error::InvalidOrder(_))
        ));
        let filter = Filter::new().with_order(OrderBy::Date);
        assert!(matches!(
            store.query_albums("", &filter).await,
            Err(Error::InvalidOrder(_))
        ));
    }

    #[tokio::test]
    async fn reverse_inverts_order() {
        let (store, _dir) = open_store().await;
        for (path, title) in [("/a.ogg", "Alpha"), ("/b.ogg", "Beta"), ("/c.ogg", "Gamma")] {
            let f = MediaFileBuilder::new(path, MediaType::Audio).title(title).freeze();
            store.insert(&f).await.unwrap();
        }
        let forward = store
            .query("", MediaType::Audio, &Filter::new().with_order(OrderBy::Title))
            .await
            .unwrap();
        let reversed = store
            .query(
                "",
                MediaType::Audio,
                &Filter::new().with_order(OrderBy::Title).with_reverse(true),
            )
            .await
            .unwrap();
        let forward_titles: Vec<_> = forward.iter().map(|f| f.title.clone()).collect();
        let mut reversed_titles: Vec<_> = reversed.iter().map(|f| f.title.clone()).collect();
        reversed_titles.reverse();
        assert_eq!(forward_titles, reversed_titles);
    }

    #[tokio::test]
    async fn transaction_commits_incrementally_and_rolls_back_if_dropped() {
        let (store, _dir) = open_store().await;
        {
            let mut txn = store.begin_transaction().await.unwrap();
            let f = MediaFileBuilder::new("/committed.ogg", MediaType::Audio).freeze();
            txn.insert(&f).await.unwrap();
            txn.commit().await.unwrap();

            let uncommitted = MediaFileBuilder::new("/uncommitted.ogg", MediaType::Audio).freeze();
            txn.insert(&uncommitted).await.unwrap();
            // txn dropped here without a final commit()
        }
        assert!(store.lookup("/committed.ogg").await.is_ok());
        assert!(store.lookup("/uncommitted.ogg").await.is_err());
    }

    #[tokio::test]
    async fn has_media_checks_all_types() {
        let (store, _dir) = open_store().await;
        assert!(!store.has_media(MediaType::AllMedia).await.unwrap());
        let f = MediaFileBuilder::new("/v.mp4", MediaType::Video).freeze();
        store.insert(&f).await.unwrap();
        assert!(store.has_media(MediaType::Video).await.unwrap());
        assert!(store.has_media(MediaType::AllMedia).await.unwrap());
        assert!(!store.has_media(MediaType::Audio).await.unwrap());
    }

    #[tokio::test]
    async fn read_api_trait_object_reaches_the_same_rows_as_the_inherent_methods() {
        let (store, _dir) = open_store().await;
        let f = MediaFileBuilder::new("/a.ogg", MediaType::Audio).title("t").freeze();
        store.insert(&f).await.unwrap();

        let api: &dyn ReadApi = &store;
        assert_eq!(api.size().await.unwrap(), 1);
        assert_eq!(api.lookup("/a.ogg").await.unwrap().title, "t");
    }
}
