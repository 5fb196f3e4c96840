//! Local gateway: image payloads as files on disk, records in SQLite.
//!
//! Payloads are sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`
//! and carry a `{file}.meta.json` sidecar with the owner and content type.
//! Records live in the `images` table created by `migrations/0001_init.sql`.

use super::{BlobStore, GatewayError, GatewayResult, RecordFilter, RecordTable};
use crate::models::image::{ImageRecord, RecordKey};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    ffi::OsString,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Schema applied by `--migrate` and on startup of the local backend.
pub const SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");

const MAX_OBJECT_KEY_LEN: usize = 1024;

const COLUMNS: &str = "image_id, user_id, file_name, content_type, s3_key, status, \
                       description, title, tags, size_bytes, created_at";

/// Owner and content type stored next to each payload file.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobSidecar {
    pub user_id: String,
    pub content_type: String,
}

#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    /// Base directory on disk where payloads are stored.
    base_path: PathBuf,
    bucket: String,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            bucket: bucket.into(),
        }
    }

    /// Rejects keys that could escape the bucket directory.
    fn ensure_key_safe(key: &str) -> GatewayResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if unsafe_key {
            return Err(GatewayError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// First two bytes of MD5(bucket/key) as lowercase hex (00–ff).
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/bucket/{shard}/{shard}/{key}`; parents may not exist yet.
    pub fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn sidecar_path(object_path: &Path) -> PathBuf {
        let mut name = OsString::from(object_path.as_os_str());
        name.push(".meta.json");
        PathBuf::from(name)
    }

    /// Read back the sidecar written by `put_object`.
    #[cfg(test)]
    pub async fn sidecar(&self, key: &str) -> GatewayResult<BlobSidecar> {
        Self::ensure_key_safe(key)?;
        let raw = fs::read(Self::sidecar_path(&self.object_path(key))).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Recursively remove empty directories up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Write to a temp file beside `path`, fsync, then rename into place.
async fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
    fs::create_dir_all(parent).await?;

    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => {
            debug!("removed {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("{} already missing", path.display());
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        owner_id: &str,
        content_type: &str,
    ) -> GatewayResult<()> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        write_atomically(&path, &bytes).await?;

        let sidecar = serde_json::to_vec(&BlobSidecar {
            user_id: owner_id.to_string(),
            content_type: content_type.to_string(),
        })?;
        if let Err(err) = write_atomically(&Self::sidecar_path(&path), &sidecar).await {
            let _ = fs::remove_file(&path).await;
            return Err(err.into());
        }

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        remove_if_present(&path).await?;
        remove_if_present(&Self::sidecar_path(&path)).await?;

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }
        Ok(())
    }

    /// Local files cannot expire, so `ttl` is not encoded in the URL.
    async fn access_url(&self, key: &str, ttl: Duration) -> GatewayResult<String> {
        Self::ensure_key_safe(key)?;
        let path = std::path::absolute(self.object_path(key))?;
        debug!(ttl_secs = ttl.as_secs(), "local access urls do not expire");
        Ok(format!("file://{}", path.display()))
    }

    /// Write, read back, and delete a probe file under the bucket root.
    async fn ping(&self) -> GatewayResult<()> {
        let root = self.bucket_root();
        fs::create_dir_all(&root).await?;
        let probe = root.join(format!(".readyz-{}", Uuid::new_v4()));

        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;

        if read_back? != b"readyz" {
            return Err(io::Error::other("probe file content mismatch").into());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteRecordTable {
    db: Arc<SqlitePool>,
}

#[derive(FromRow)]
struct ImageRow {
    image_id: String,
    user_id: String,
    file_name: String,
    content_type: String,
    s3_key: String,
    status: String,
    description: String,
    title: Option<String>,
    tags: String,
    size_bytes: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = GatewayError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(GatewayError::MalformedRecord)?;
        let tags = serde_json::from_str(&row.tags)?;
        Ok(ImageRecord {
            image_id: row.image_id,
            user_id: row.user_id,
            file_name: row.file_name,
            content_type: row.content_type,
            s3_key: row.s3_key,
            status,
            description: row.description,
            title: row.title,
            tags,
            size_bytes: row.size_bytes,
            created_at: row.created_at,
        })
    }
}

impl SqliteRecordTable {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply [`SCHEMA`] statement by statement. Safe to re-run.
    pub async fn migrate(&self) -> GatewayResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }
}

#[async_trait]
impl RecordTable for SqliteRecordTable {
    async fn put_record(&self, record: &ImageRecord) -> GatewayResult<()> {
        let tags = serde_json::to_string(&record.tags)?;
        sqlx::query(
            r#"
            INSERT INTO images (
                image_id, user_id, file_name, content_type, s3_key, status,
                description, title, tags, size_bytes, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(image_id, user_id) DO UPDATE SET
                file_name = excluded.file_name,
                content_type = excluded.content_type,
                s3_key = excluded.s3_key,
                status = excluded.status,
                description = excluded.description,
                title = excluded.title,
                tags = excluded.tags,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at
            "#,
        )
        .bind(&record.image_id)
        .bind(&record.user_id)
        .bind(&record.file_name)
        .bind(&record.content_type)
        .bind(&record.s3_key)
        .bind(record.status.as_str())
        .bind(&record.description)
        .bind(&record.title)
        .bind(tags)
        .bind(record.size_bytes)
        .bind(record.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn get_record(&self, key: &RecordKey) -> GatewayResult<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            "SELECT {} FROM images WHERE image_id = ? AND user_id = ?",
            COLUMNS
        ))
        .bind(&key.image_id)
        .bind(&key.user_id)
        .fetch_optional(&*self.db)
        .await?;

        row.map(ImageRecord::try_from).transpose()
    }

    async fn delete_record(&self, key: &RecordKey) -> GatewayResult<()> {
        sqlx::query("DELETE FROM images WHERE image_id = ? AND user_id = ?")
            .bind(&key.image_id)
            .bind(&key.user_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn scan_records(&self, filter: &RecordFilter) -> GatewayResult<Vec<ImageRecord>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM images WHERE user_id = ", COLUMNS));
        builder.push_bind(filter.user_id.clone());

        // instr() keeps the match case-sensitive and free of LIKE wildcards.
        if let Some(title) = &filter.title {
            builder.push(" AND instr(title, ");
            builder.push_bind(title.clone());
            builder.push(") > 0");
        }

        if let Some(tag) = &filter.tag {
            builder.push(
                " AND EXISTS (SELECT 1 FROM json_each(images.tags) WHERE instr(json_each.value, ",
            );
            builder.push_bind(tag.clone());
            builder.push(") > 0)");
        }

        let rows: Vec<ImageRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    async fn ping(&self) -> GatewayResult<()> {
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if value != 1 {
            return Err(GatewayError::MalformedRecord(format!(
                "unexpected readiness result: {}",
                value
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::test_support::record;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn table() -> SqliteRecordTable {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let table = SqliteRecordTable::new(Arc::new(pool));
        assert_eq!(table.migrate().await.unwrap(), 2);
        table
    }

    #[test]
    fn rejects_keys_that_escape_the_bucket() {
        for key in ["", "/etc/passwd", "images/../../x", "a\\b", "a\0b"] {
            assert!(
                matches!(
                    LocalBlobStore::ensure_key_safe(key),
                    Err(GatewayError::InvalidKey(_))
                ),
                "{key:?}"
            );
        }
        assert!(LocalBlobStore::ensure_key_safe("images/u1/a.png").is_ok());
    }

    #[test]
    fn object_path_is_sharded_under_bucket() {
        let store = LocalBlobStore::new("/data", "imagehost");
        let path = store.object_path("images/u1/a.png");
        let rel = path.strip_prefix("/data/imagehost").unwrap();
        let parts: Vec<_> = rel.components().collect();
        assert_eq!(parts.len(), 5);
        assert!(path.ends_with("images/u1/a.png"));
        assert_eq!(path, store.object_path("images/u1/a.png"));
    }

    #[tokio::test]
    async fn put_then_delete_object() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path(), "imagehost");
        let key = "images/u1/a.png";

        store
            .put_object(key, Bytes::from_static(b"png!"), "u1", "image/png")
            .await
            .unwrap();
        assert_eq!(fs::read(store.object_path(key)).await.unwrap(), b"png!");
        assert_eq!(
            store.sidecar(key).await.unwrap(),
            BlobSidecar {
                user_id: "u1".into(),
                content_type: "image/png".into(),
            }
        );

        store.delete_object(key).await.unwrap();
        assert!(!store.object_path(key).exists());
        // shard directories are pruned back to the bucket root
        assert!(dir.path().join("imagehost").exists());
        assert_eq!(
            std::fs::read_dir(dir.path().join("imagehost")).unwrap().count(),
            0
        );

        store.delete_object(key).await.unwrap();
    }

    #[tokio::test]
    async fn access_url_points_at_the_file() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path(), "imagehost");
        let url = store
            .access_url("images/u1/a.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("images/u1/a.png"));
    }

    #[tokio::test]
    async fn blob_ping_uses_scratch_file() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path(), "imagehost");
        store.ping().await.unwrap();
        assert_eq!(
            std::fs::read_dir(dir.path().join("imagehost")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn record_round_trip_and_overwrite() {
        let table = table().await;
        let mut r = record("a", "u1", Some("Beach"), &["sea", "sky"]);
        table.put_record(&r).await.unwrap();
        assert_eq!(table.get_record(&r.key()).await.unwrap(), Some(r.clone()));

        r.description = "updated".into();
        table.put_record(&r).await.unwrap();
        assert_eq!(
            table.get_record(&r.key()).await.unwrap().unwrap().description,
            "updated"
        );

        assert!(
            table
                .get_record(&RecordKey::new("a", "u2"))
                .await
                .unwrap()
                .is_none()
        );

        table.delete_record(&r.key()).await.unwrap();
        table.delete_record(&r.key()).await.unwrap();
        assert!(table.get_record(&r.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_pushes_filter_into_sql() {
        let table = table().await;
        for r in [
            record("a", "u1", Some("Summer Beach"), &["sunset-sky"]),
            record("b", "u1", Some("Beach"), &["forest"]),
            record("c", "u1", None, &["sunset"]),
            record("d", "u2", Some("Beach"), &["sunset"]),
        ] {
            table.put_record(&r).await.unwrap();
        }

        let ids = |records: Vec<ImageRecord>| {
            let mut ids: Vec<_> = records.into_iter().map(|r| r.image_id).collect();
            ids.sort();
            ids
        };

        let all = table.scan_records(&RecordFilter::for_user("u1")).await.unwrap();
        assert_eq!(ids(all), ["a", "b", "c"]);

        let titled = table
            .scan_records(&RecordFilter::for_user("u1").with_title(Some("Beach".into())))
            .await
            .unwrap();
        assert_eq!(ids(titled), ["a", "b"]);

        let case = table
            .scan_records(&RecordFilter::for_user("u1").with_title(Some("beach".into())))
            .await
            .unwrap();
        assert!(case.is_empty());

        let tagged = table
            .scan_records(&RecordFilter::for_user("u1").with_tag(Some("sunset".into())))
            .await
            .unwrap();
        assert_eq!(ids(tagged), ["a", "c"]);

        let both = table
            .scan_records(
                &RecordFilter::for_user("u1")
                    .with_title(Some("Beach".into()))
                    .with_tag(Some("sunset".into())),
            )
            .await
            .unwrap();
        assert_eq!(ids(both), ["a"]);
    }

    #[tokio::test]
    async fn record_ping_succeeds() {
        table().await.ping().await.unwrap();
    }
}
