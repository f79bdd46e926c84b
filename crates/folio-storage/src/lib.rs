//! Catalog persistence, screenshot artifact storage, and feed HTTP fetch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use folio_core::{EntryChanges, EntryDraft, PortfolioEntry, ScreenshotRef};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "folio-storage";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("screenshot pointer json: {0}")]
    PointerJson(#[from] serde_json::Error),
    #[error("no catalog entry with id {0}")]
    NotFound(Uuid),
}

/// Repository contract for the portfolio catalog.
#[async_trait]
pub trait CatalogRepo: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PortfolioEntry>, CatalogError>;

    async fn find_by_url(&self, url: &str) -> Result<Option<PortfolioEntry>, CatalogError>;

    /// Most recently modified inactive entry with exactly this name; ties on
    /// the modification time are broken by id, descending.
    async fn latest_inactive_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PortfolioEntry>, CatalogError>;

    async fn create(&self, draft: EntryDraft) -> Result<PortfolioEntry, CatalogError>;

    /// Apply a partial update in one statement; unset fields stay untouched
    /// and `updated_at` is always bumped.
    async fn update(&self, id: Uuid, changes: EntryChanges)
        -> Result<PortfolioEntry, CatalogError>;

    /// Replace (or clear) the screenshot pointer. The only entry field the
    /// capture side ever writes.
    async fn set_screenshot(
        &self,
        id: Uuid,
        screenshot: Option<ScreenshotRef>,
    ) -> Result<(), CatalogError>;

    /// Bulk pass: flip every *active* entry whose URL is not in `keep_urls`
    /// to inactive and clear its screenshot pointer. Entries that are already
    /// inactive are not touched, so their `updated_at` keeps ordering the
    /// name-match fallback. Returns the ids this call deactivated.
    async fn deactivate_except(
        &self,
        keep_urls: &HashSet<String>,
    ) -> Result<Vec<Uuid>, CatalogError>;

    /// Active entries ordered by name.
    async fn list_active(&self) -> Result<Vec<PortfolioEntry>, CatalogError>;

    async fn count(&self) -> Result<u64, CatalogError>;
}

/// Postgres-backed catalog. Runtime-verified `sqlx::query` is used so no
/// database is needed at compile time.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> Result<Self, CatalogError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from this crate's `migrations/` directory.
    pub async fn migrate(&self) -> Result<(), CatalogError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn entry_from_row(row: &PgRow) -> Result<PortfolioEntry, CatalogError> {
    let screenshot = row
        .try_get::<Option<serde_json::Value>, _>("screenshot")?
        .map(serde_json::from_value::<ScreenshotRef>)
        .transpose()?;

    Ok(PortfolioEntry {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        tagline: row.try_get("tagline")?,
        active: row.try_get("active")?,
        screenshot,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CatalogRepo for PgCatalog {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PortfolioEntry>, CatalogError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, url, tagline, active, screenshot, created_at, updated_at
              FROM portfolios
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<PortfolioEntry>, CatalogError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, url, tagline, active, screenshot, created_at, updated_at
              FROM portfolios
             WHERE url = $1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn latest_inactive_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PortfolioEntry>, CatalogError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, url, tagline, active, screenshot, created_at, updated_at
              FROM portfolios
             WHERE name = $1
               AND active = FALSE
             ORDER BY updated_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn create(&self, draft: EntryDraft) -> Result<PortfolioEntry, CatalogError> {
        let row = sqlx::query(
            r#"
            INSERT INTO portfolios (id, name, url, tagline, active, screenshot, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $6)
            RETURNING id, name, url, tagline, active, screenshot, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.name)
        .bind(&draft.url)
        .bind(&draft.tagline)
        .bind(draft.active)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        entry_from_row(&row)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: EntryChanges,
    ) -> Result<PortfolioEntry, CatalogError> {
        let set_tagline = changes.tagline.is_some();
        let tagline = changes.tagline.clone().flatten();

        let row = sqlx::query(
            r#"
            UPDATE portfolios
               SET name = COALESCE($2, name),
                   url = COALESCE($3, url),
                   tagline = CASE WHEN $4 THEN $5 ELSE tagline END,
                   active = COALESCE($6, active),
                   updated_at = $7
             WHERE id = $1
            RETURNING id, name, url, tagline, active, screenshot, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&changes.name)
        .bind(&changes.url)
        .bind(set_tagline)
        .bind(&tagline)
        .bind(changes.active)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => entry_from_row(&row),
            None => Err(CatalogError::NotFound(id)),
        }
    }

    async fn set_screenshot(
        &self,
        id: Uuid,
        screenshot: Option<ScreenshotRef>,
    ) -> Result<(), CatalogError> {
        let pointer = screenshot.map(serde_json::to_value).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE portfolios
               SET screenshot = $2,
                   updated_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(pointer)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(id));
        }
        Ok(())
    }

    async fn deactivate_except(
        &self,
        keep_urls: &HashSet<String>,
    ) -> Result<Vec<Uuid>, CatalogError> {
        let keep: Vec<String> = keep_urls.iter().cloned().collect();

        let rows = sqlx::query(
            r#"
            UPDATE portfolios
               SET active = FALSE,
                   screenshot = NULL,
                   updated_at = $2
             WHERE active = TRUE
               AND url <> ALL($1)
            RETURNING id
            "#,
        )
        .bind(&keep)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("id").map_err(CatalogError::from))
            .collect()
    }

    async fn list_active(&self) -> Result<Vec<PortfolioEntry>, CatalogError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, url, tagline, active, screenshot, created_at, updated_at
              FROM portfolios
             WHERE active = TRUE
             ORDER BY name ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn count(&self) -> Result<u64, CatalogError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM portfolios")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }
}

/// In-memory catalog with the same observable semantics as [`PgCatalog`].
/// Backs the test suites and any tooling that wants a database-free run.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<Vec<PortfolioEntry>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full copy of the catalog, in insertion order.
    pub async fn snapshot(&self) -> Vec<PortfolioEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl CatalogRepo for MemoryCatalog {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PortfolioEntry>, CatalogError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<PortfolioEntry>, CatalogError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().find(|e| e.url == url).cloned())
    }

    async fn latest_inactive_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PortfolioEntry>, CatalogError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| !e.active && e.name == name)
            .max_by_key(|e| (e.updated_at, e.id))
            .cloned())
    }

    async fn create(&self, draft: EntryDraft) -> Result<PortfolioEntry, CatalogError> {
        let now = Utc::now();
        let entry = PortfolioEntry {
            id: Uuid::new_v4(),
            name: draft.name,
            url: draft.url,
            tagline: draft.tagline,
            active: draft.active,
            screenshot: None,
            created_at: now,
            updated_at: now,
        };

        let mut entries = self.entries.lock().await;
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: EntryChanges,
    ) -> Result<PortfolioEntry, CatalogError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(CatalogError::NotFound(id))?;

        if let Some(name) = changes.name {
            entry.name = name;
        }
        if let Some(url) = changes.url {
            entry.url = url;
        }
        if let Some(tagline) = changes.tagline {
            entry.tagline = tagline;
        }
        if let Some(active) = changes.active {
            entry.active = active;
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn set_screenshot(
        &self,
        id: Uuid,
        screenshot: Option<ScreenshotRef>,
    ) -> Result<(), CatalogError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(CatalogError::NotFound(id))?;
        entry.screenshot = screenshot;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn deactivate_except(
        &self,
        keep_urls: &HashSet<String>,
    ) -> Result<Vec<Uuid>, CatalogError> {
        let now = Utc::now();
        let mut deactivated = Vec::new();

        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if entry.active && !keep_urls.contains(&entry.url) {
                entry.active = false;
                entry.screenshot = None;
                entry.updated_at = now;
                deactivated.push(entry.id);
            }
        }
        Ok(deactivated)
    }

    async fn list_active(&self) -> Result<Vec<PortfolioEntry>, CatalogError> {
        let entries = self.entries.lock().await;
        let mut active: Vec<PortfolioEntry> =
            entries.iter().filter(|e| e.active).cloned().collect();
        active.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn count(&self) -> Result<u64, CatalogError> {
        let entries = self.entries.lock().await;
        Ok(entries.len() as u64)
    }
}

/// Filesystem store for screenshot artifacts, addressed by entry id. Writes
/// land in a temp file and are renamed over the final path, so replacing an
/// entry's screenshot never exposes a half-written image.
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    root: PathBuf,
}

impl ScreenshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn extension_for(content_type: &str) -> &'static str {
        match content_type {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "bin",
        }
    }

    pub fn file_name(entry_id: Uuid, content_type: &str) -> String {
        format!("{entry_id}.{}", Self::extension_for(content_type))
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Store `bytes` as the entry's current screenshot, replacing any prior
    /// artifact for the same entry.
    pub async fn attach(
        &self,
        entry_id: Uuid,
        bytes: &[u8],
        content_type: &str,
    ) -> anyhow::Result<ScreenshotRef> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating screenshot directory {}", self.root.display()))?;

        let file_name = Self::file_name(entry_id, content_type);
        let final_path = self.root.join(&file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp screenshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp screenshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp screenshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp screenshot {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            });
        }

        Ok(ScreenshotRef {
            file_name,
            content_type: content_type.to_string(),
            byte_size: bytes.len() as u64,
            sha256: Self::sha256_hex(bytes),
            captured_at: Utc::now(),
        })
    }

    /// Remove the entry's stored artifact if one exists. Idempotent; returns
    /// whether anything was removed.
    pub async fn detach(&self, entry_id: Uuid) -> anyhow::Result<bool> {
        let mut removed = false;
        for ext in ["png", "jpg", "webp", "bin"] {
            let path = self.root.join(format!("{entry_id}.{ext}"));
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing screenshot {}", path.display()))
                }
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("feed payload is not a json array: {0}")]
    Parse(#[from] serde_json::Error),
}

/// HTTP client for the external portfolio feed. Transient failures (timeouts,
/// connect errors, 5xx, 429) are retried with capped exponential backoff;
/// anything else surfaces immediately.
#[derive(Debug)]
pub struct FeedClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl FeedClient {
    pub fn new(config: FeedClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("feed_fetch", %run_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::FeedItem;
    use tempfile::tempdir;

    fn draft(name: &str, url: &str) -> EntryDraft {
        EntryDraft {
            name: name.to_string(),
            url: url.to_string(),
            tagline: None,
            active: true,
        }
    }

    #[test]
    fn screenshot_hashing_is_stable() {
        let hash = ScreenshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn attach_replaces_prior_artifact_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = ScreenshotStore::new(dir.path());
        let entry_id = Uuid::new_v4();

        let first = store
            .attach(entry_id, b"first capture", "image/png")
            .await
            .expect("first attach");
        let second = store
            .attach(entry_id, b"second capture", "image/png")
            .await
            .expect("second attach");

        assert_eq!(first.file_name, second.file_name);
        assert_ne!(first.sha256, second.sha256);

        let stored = std::fs::read(store.path_for(&second.file_name)).expect("read artifact");
        assert_eq!(stored, b"second capture");

        let visible: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("dirent").file_name())
            .collect();
        assert_eq!(visible.len(), 1, "no temp files left behind: {visible:?}");
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = ScreenshotStore::new(dir.path());
        let entry_id = Uuid::new_v4();

        store
            .attach(entry_id, b"capture", "image/png")
            .await
            .expect("attach");

        assert!(store.detach(entry_id).await.expect("first detach"));
        assert!(!store.detach(entry_id).await.expect("second detach"));
        assert!(!store
            .path_for(&ScreenshotStore::file_name(entry_id, "image/png"))
            .exists());
    }

    #[tokio::test]
    async fn memory_catalog_updates_only_requested_fields() {
        let catalog = MemoryCatalog::new();
        let created = catalog
            .create(EntryDraft {
                name: "Alice".to_string(),
                url: "https://a.example".to_string(),
                tagline: Some("hi".to_string()),
                active: true,
            })
            .await
            .expect("create");

        let item = FeedItem {
            name: "Alice A.".to_string(),
            url: "https://a.example".to_string(),
            tagline: None,
        };
        let updated = catalog
            .update(created.id, EntryChanges::confirm(&item))
            .await
            .expect("update");

        assert_eq!(updated.name, "Alice A.");
        assert_eq!(updated.url, "https://a.example");
        assert_eq!(updated.tagline, None, "feed item without tagline clears it");
        assert!(updated.active);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let catalog = MemoryCatalog::new();
        let missing = Uuid::new_v4();
        let err = catalog
            .update(missing, EntryChanges::default())
            .await
            .expect_err("missing id");
        assert!(matches!(err, CatalogError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn deactivate_except_targets_active_entries_outside_the_url_set() {
        let catalog = MemoryCatalog::new();
        let keep = catalog.create(draft("Keep", "https://keep.example")).await.expect("create");
        let gone = catalog.create(draft("Gone", "https://gone.example")).await.expect("create");

        catalog
            .set_screenshot(
                gone.id,
                Some(ScreenshotRef {
                    file_name: format!("{}.png", gone.id),
                    content_type: "image/png".to_string(),
                    byte_size: 3,
                    sha256: "abc".to_string(),
                    captured_at: Utc::now(),
                }),
            )
            .await
            .expect("set screenshot");

        let keep_urls: HashSet<String> = [keep.url.clone()].into_iter().collect();
        let deactivated = catalog
            .deactivate_except(&keep_urls)
            .await
            .expect("deactivate");
        assert_eq!(deactivated, vec![gone.id]);

        // A second pass has nothing left to flip.
        let again = catalog
            .deactivate_except(&keep_urls)
            .await
            .expect("deactivate again");
        assert!(again.is_empty());

        let dropped = catalog
            .find_by_id(gone.id)
            .await
            .expect("find")
            .expect("present");
        assert!(!dropped.active);
        assert!(dropped.screenshot.is_none());

        let kept = catalog
            .find_by_id(keep.id)
            .await
            .expect("find")
            .expect("present");
        assert!(kept.active);
    }

    #[tokio::test]
    async fn empty_url_set_deactivates_everything() {
        let catalog = MemoryCatalog::new();
        catalog.create(draft("A", "https://a.example")).await.expect("create");
        catalog.create(draft("B", "https://b.example")).await.expect("create");

        let deactivated = catalog
            .deactivate_except(&HashSet::new())
            .await
            .expect("deactivate");
        assert_eq!(deactivated.len(), 2);
        assert!(catalog.list_active().await.expect("list").is_empty());
        assert_eq!(catalog.count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn latest_inactive_by_name_prefers_recent_modification() {
        let catalog = MemoryCatalog::new();
        let older = catalog.create(draft("Jane", "https://old.example")).await.expect("create");
        let newer = catalog.create(draft("Jane", "https://new.example")).await.expect("create");

        // Deactivate in two passes so the second entry carries the later
        // modification time.
        let keep: HashSet<String> = [newer.url.clone()].into_iter().collect();
        catalog.deactivate_except(&keep).await.expect("first pass");
        catalog
            .deactivate_except(&HashSet::new())
            .await
            .expect("second pass");

        let found = catalog
            .latest_inactive_by_name("Jane")
            .await
            .expect("query")
            .expect("candidate");
        assert_eq!(found.id, newer.id);
        assert_ne!(found.id, older.id);
    }

    #[tokio::test]
    async fn latest_inactive_by_name_breaks_timestamp_ties_by_id() {
        let catalog = MemoryCatalog::new();
        let a = catalog.create(draft("Jane", "https://one.example")).await.expect("create");
        let b = catalog.create(draft("Jane", "https://two.example")).await.expect("create");

        // One bulk pass stamps both with the same modification time.
        catalog
            .deactivate_except(&HashSet::new())
            .await
            .expect("deactivate");

        let found = catalog
            .latest_inactive_by_name("Jane")
            .await
            .expect("query")
            .expect("candidate");
        let expected = if a.id > b.id { a.id } else { b.id };
        assert_eq!(found.id, expected);
    }

    #[tokio::test]
    async fn list_active_orders_by_name() {
        let catalog = MemoryCatalog::new();
        catalog.create(draft("Cora", "https://c.example")).await.expect("create");
        catalog.create(draft("Abe", "https://a.example")).await.expect("create");
        catalog.create(draft("Bea", "https://b.example")).await.expect("create");

        let names: Vec<String> = catalog
            .list_active()
            .await
            .expect("list")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Abe", "Bea", "Cora"]);
    }
}
