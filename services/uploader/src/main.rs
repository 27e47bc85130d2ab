//! Uploader Service - Registers admin-supplied campaign spreadsheets
//!
//! Responsibilities:
//! - Take a spreadsheet file handed over by the admin UI for one tenant
//! - Hash the content and skip re-registration of identical files
//! - Store the raw bytes in the filesystem raw store
//! - Register upload metadata in database (pending for the normalizer)
//! - Track job runs for auditing
//!
//! Usage:
//!   cargo run --bin uploader -- --tenant houston --file ./janeiro.xlsx

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "uploader", about = "Registers campaign spreadsheets for normalization")]
struct Args {
    /// Tenant identifier (string key, e.g. "houston")
    #[arg(long)]
    tenant: String,

    /// Path to the spreadsheet file (xlsx/xls/csv)
    #[arg(long)]
    file: String,

    /// Force re-registration even if an identical file exists
    #[arg(long, default_value = "false")]
    force: bool,

    /// Dry run - don't save to database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

/// Canonical tenant ids plus the legacy alias of the first slot. Unknown ids
/// are accepted with a warning: the normalizer degrades to a default mapping.
const KNOWN_TENANTS: &[&str] = &[
    "houston",
    "trevo-barbearia",
    "trevo-tabacaria",
    "miguel",
    "fagori",
];

#[derive(Debug)]
struct UploadMeta {
    upload_id: Uuid,
    tenant_id: String,
    original_name: String,
    captured_at: DateTime<Utc>,
    content_hash: String,
    mime_type: String,
    size_bytes: i64,
    storage_kind: String,
    storage_path: String,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    raw_store: String,
    raw_fs_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            raw_store: std::env::var("RAW_STORE").unwrap_or_else(|_| "fs".to_string()),
            raw_fs_dir: PathBuf::from(
                std::env::var("RAW_FS_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
        })
    }
}

/// Guess the MIME type from the original file extension. The admin UI only
/// offers spreadsheet files; anything else lands on octet-stream.
fn guess_mime(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".xlsx") {
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
    } else if lower.ends_with(".xls") {
        "application/vnd.ms-excel"
    } else if lower.ends_with(".csv") {
        "text/csv"
    } else {
        "application/octet-stream"
    }
}

/// Check if an upload with the same content hash already exists
async fn check_existing_upload(pool: &PgPool, content_hash: &str) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT upload_id FROM uploads WHERE content_hash = $1 LIMIT 1")
            .bind(content_hash)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|r| r.0))
}

/// Create a new job run record
async fn create_job_run(pool: &PgPool, tenant_id: &str) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, tenant_id, status, detail)
        VALUES ($1, 'uploader', $2, 'running', '{}')
        "#,
    )
    .bind(job_run_id)
    .bind(tenant_id)
    .execute(pool)
    .await?;

    Ok(job_run_id)
}

/// Update job run status
async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Save upload bytes to filesystem
async fn save_to_fs(config: &Config, upload_id: Uuid, bytes: &[u8]) -> Result<String> {
    let dir = &config.raw_fs_dir;
    fs::create_dir_all(dir).await?;

    let filename = format!("{}.raw", upload_id);
    let path = dir.join(&filename);

    fs::write(&path, bytes).await?;

    Ok(path.to_string_lossy().to_string())
}

/// Insert upload record into database
async fn insert_upload(pool: &PgPool, meta: &UploadMeta) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO uploads
        (upload_id, tenant_id, original_name, captured_at, content_hash, mime_type, size_bytes, storage_kind, storage_path, parsed_status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
        "#,
    )
    .bind(meta.upload_id)
    .bind(&meta.tenant_id)
    .bind(&meta.original_name)
    .bind(meta.captured_at)
    .bind(&meta.content_hash)
    .bind(&meta.mime_type)
    .bind(meta.size_bytes)
    .bind(&meta.storage_kind)
    .bind(&meta.storage_path)
    .execute(pool)
    .await?;

    Ok(())
}

/// Register a single file and return the upload id
async fn register_file(
    pool: &PgPool,
    config: &Config,
    tenant_id: &str,
    file_path: &Path,
    force: bool,
    dry_run: bool,
) -> Result<Uuid> {
    let original_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("File path has no filename")?;

    println!("  Reading: {}", file_path.display());
    let bytes = fs::read(file_path).await.context("Failed to read file")?;
    let size_bytes = bytes.len() as i64;

    if bytes.is_empty() {
        anyhow::bail!("File is empty");
    }

    let mime = guess_mime(&original_name).to_string();

    // Calculate hash
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("sha256:{:x}", hasher.finalize());

    println!("  Size: {} bytes, mime: {}", size_bytes, mime);
    println!("  Hash: {}", content_hash);

    // Check for existing upload with same hash
    if !force {
        if let Some(existing_id) = check_existing_upload(pool, &content_hash).await? {
            println!("  Upload already exists: {}", existing_id);
            return Ok(existing_id);
        }
    }

    let upload_id = Uuid::new_v4();
    let captured_at = Utc::now();

    // Save to storage (filesystem for MVP)
    let storage_path = save_to_fs(config, upload_id, &bytes).await?;
    let storage_kind = "fs".to_string();

    println!("  Saved to: {}", storage_path);

    let meta = UploadMeta {
        upload_id,
        tenant_id: tenant_id.to_string(),
        original_name,
        captured_at,
        content_hash,
        mime_type: mime,
        size_bytes,
        storage_kind,
        storage_path,
    };

    // Insert into database
    if !dry_run {
        insert_upload(pool, &meta).await?;
        println!("  Upload registered: {}", upload_id);
    } else {
        println!("  Dry run - would register upload: {}", upload_id);
    }

    Ok(upload_id)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Franca Performance Uploader ===");
    println!("Storage: {}", config.raw_store);
    println!("Tenant: {}", args.tenant);
    println!("File: {}", args.file);

    if !KNOWN_TENANTS.contains(&args.tenant.as_str()) {
        println!(
            "⚠ Unknown tenant '{}' - the normalizer will fall back to the default mapping",
            args.tenant
        );
    }

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to database")?;

    // Create job run
    let job_run_id = if !args.dry_run {
        Some(create_job_run(&pool, &args.tenant).await?)
    } else {
        None
    };

    let result = register_file(
        &pool,
        &config,
        &args.tenant,
        Path::new(&args.file),
        args.force,
        args.dry_run,
    )
    .await;

    // Update job run status
    if let Some(job_id) = job_run_id {
        match &result {
            Ok(_) => finish_job_run(&pool, job_id, "ok", None).await?,
            Err(e) => finish_job_run(&pool, job_id, "failed", Some(&e.to_string())).await?,
        }
    }

    let upload_id = result?;
    println!("\n=== Upload Complete ===");
    println!("Upload ID: {}", upload_id);
    println!(
        "Ready for normalization: cargo run --bin normalizer -- --upload-id {}",
        upload_id
    );

    Ok(())
}
