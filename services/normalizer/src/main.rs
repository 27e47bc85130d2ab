//! Normalizer Service - Turns uploaded campaign spreadsheets into dashboard reports
//!
//! Responsibilities:
//! - Load upload metadata and the raw spreadsheet
//! - Map the export's columns and classify each row into a metric bucket
//! - Fold the row stream into per-bucket and tenant-wide totals
//! - Finalize the CompanyReport and full-replace the tenant's stored report
//! - Mark the upload as processed or failed
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same upload + same mapping rules = same report

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::DateTime;
use clap::Parser;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "normalizer", about = "Normalizes campaign spreadsheets into dashboard reports")]
struct Args {
    /// Upload id to process (UUID)
    #[arg(long)]
    upload_id: String,

    /// Dry run - parse and print, don't save
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Verify mode - re-parse and compare with the stored report
    #[arg(long, default_value = "false")]
    verify: bool,
}

/// Upload metadata from database
#[derive(Debug, sqlx::FromRow)]
struct Upload {
    upload_id: Uuid,
    tenant_id: String,
    original_name: String,
    mime_type: String,
    storage_path: String,
    parsed_status: String,
}

// =============================================================================
// TENANT REGISTRY - mapping rules are data, not branches
// =============================================================================
// Each tenant owns an ordered list of keyword rules. Adding a tenant is a new
// entry in TENANTS, nothing else. Keywords are matched by case-insensitive
// substring containment against the row's result-type label, first match wins.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Purchases,
    Leads,
    ProfileVisits,
}

/// How the followers column accumulates across rows. The ad-platform export
/// has shipped both a per-period delta column and a cumulative snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowersPolicy {
    /// Add every non-empty cell (column is a per-row delta).
    SumDeltas,
    /// Keep the last non-empty cell (column is a running snapshot).
    LastSnapshot,
}

#[derive(Debug)]
struct MappingRule {
    keywords: &'static [&'static str],
    bucket: Bucket,
}

#[derive(Debug)]
struct TenantConfig {
    id: &'static str,
    display_name: &'static str,
    rules: &'static [MappingRule],
    followers_policy: FollowersPolicy,
}

const HOUSTON_RULES: &[MappingRule] = &[
    MappingRule {
        keywords: &["compras no site", "compras"],
        bucket: Bucket::Purchases,
    },
    MappingRule {
        keywords: &["leads no site", "leads"],
        bucket: Bucket::Leads,
    },
    MappingRule {
        keywords: &["visitas ao perfil"],
        bucket: Bucket::ProfileVisits,
    },
];

// ThruPlay rows stay unmapped on purpose: reach arrives through the
// impressions column, not a bucket.
const MIGUEL_RULES: &[MappingRule] = &[MappingRule {
    keywords: &["visitas ao perfil"],
    bucket: Bucket::ProfileVisits,
}];

// "Cliques no link" counts as profile visits for this tenant.
const TREVO_BARBEARIA_RULES: &[MappingRule] = &[
    MappingRule {
        keywords: &["conversas por mensagem", "conversas"],
        bucket: Bucket::Purchases,
    },
    MappingRule {
        keywords: &["cliques no link", "clique no link"],
        bucket: Bucket::ProfileVisits,
    },
];

const TREVO_TABACARIA_RULES: &[MappingRule] = &[MappingRule {
    keywords: &["conversas por mensagem", "conversas"],
    bucket: Bucket::Purchases,
}];

const TENANTS: &[TenantConfig] = &[
    TenantConfig {
        id: "houston",
        display_name: "Houston Academy",
        rules: HOUSTON_RULES,
        followers_policy: FollowersPolicy::SumDeltas,
    },
    TenantConfig {
        id: "trevo-barbearia",
        display_name: "Trevo Barbearia",
        rules: TREVO_BARBEARIA_RULES,
        followers_policy: FollowersPolicy::SumDeltas,
    },
    TenantConfig {
        id: "trevo-tabacaria",
        display_name: "Trevo Tabacaria",
        rules: TREVO_TABACARIA_RULES,
        followers_policy: FollowersPolicy::SumDeltas,
    },
    TenantConfig {
        id: "miguel",
        display_name: "Miguel",
        rules: MIGUEL_RULES,
        followers_policy: FollowersPolicy::SumDeltas,
    },
];

/// Fallback for unrecognized tenant ids: no bucket rules, generic name.
static DEFAULT_TENANT: TenantConfig = TenantConfig {
    id: "",
    display_name: "Empresa",
    rules: &[],
    followers_policy: FollowersPolicy::SumDeltas,
};

/// Map legacy tenant ids onto the canonical registry.
fn canonical_tenant(id: &str) -> &str {
    match id {
        // Old name of the first client slot, kept as an alias.
        "fagori" => "houston",
        other => other,
    }
}

fn resolve_tenant(id: &str) -> &'static TenantConfig {
    let canonical = canonical_tenant(id);
    TENANTS
        .iter()
        .find(|t| t.id == canonical)
        .unwrap_or(&DEFAULT_TENANT)
}

// =============================================================================
// COLUMN MAPPING - recognized headers of the ad-platform export
// =============================================================================
// The export is pt-BR; some tool versions drop the accents, so the tables
// carry unaccented variants too. Unrecognized headers are ignored.

const RESULT_TYPE_COLUMNS: &[&str] = &["tipo de resultado"];
const RESULTS_COLUMNS: &[&str] = &["resultados"];
const INVESTMENT_COLUMNS: &[&str] = &["valor usado"];
const FOLLOWERS_COLUMNS: &[&str] = &["seguidores"];
const IMPRESSIONS_COLUMNS: &[&str] = &["impressões", "impressoes"];
const PERIOD_START_COLUMNS: &[&str] = &["início dos relatórios", "inicio dos relatorios"];
const PERIOD_END_COLUMNS: &[&str] = &["término dos relatórios", "termino dos relatorios"];

/// Column indexes for the recognized headers. Any of them may be absent;
/// absent columns contribute zero/empty to the report.
#[derive(Debug, Default)]
struct ColumnMap {
    result_type: Option<usize>,
    results: Option<usize>,
    investment: Option<usize>,
    followers: Option<usize>,
    impressions: Option<usize>,
    period_start: Option<usize>,
    period_end: Option<usize>,
}

/// Find column index by matching against known header names
fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    for (idx, header) in headers.iter().enumerate() {
        let normalized = header.trim().to_lowercase();
        for candidate in candidates {
            if normalized == *candidate || normalized.contains(candidate) {
                return Some(idx);
            }
        }
    }
    None
}

fn map_columns(headers: &[String]) -> ColumnMap {
    ColumnMap {
        result_type: find_column(headers, RESULT_TYPE_COLUMNS),
        results: find_column(headers, RESULTS_COLUMNS),
        investment: find_column(headers, INVESTMENT_COLUMNS),
        followers: find_column(headers, FOLLOWERS_COLUMNS),
        impressions: find_column(headers, IMPRESSIONS_COLUMNS),
        period_start: find_column(headers, PERIOD_START_COLUMNS),
        period_end: find_column(headers, PERIOD_END_COLUMNS),
    }
}

// =============================================================================
// CELLS - the untyped values the spreadsheet frontends yield
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Empty,
    Text(String),
    Number(f64),
    /// Excel date serial (native date cell).
    Serial(f64),
}

fn excel_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Cell::Empty
            } else {
                Cell::Text(trimmed.to_string())
            }
        }
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Number(if *b { 1.0 } else { 0.0 }),
        Data::DateTime(dt) => Cell::Serial(dt.as_f64()),
        Data::DateTimeIso(s) => Cell::Text(s.clone()),
        Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(_) => Cell::Empty,
    }
}

fn csv_cell(field: &str) -> Cell {
    let field = field.trim();
    if field.is_empty() {
        Cell::Empty
    } else {
        Cell::Text(field.to_string())
    }
}

/// Best-effort numeric coercion: malformed cells become 0, never an error.
fn coerce_number(cell: &Cell) -> f64 {
    match cell {
        Cell::Number(v) | Cell::Serial(v) => *v,
        Cell::Text(s) => s.trim().parse().unwrap_or(0.0),
        Cell::Empty => 0.0,
    }
}

fn cell_number(cells: &[Cell], idx: Option<usize>) -> f64 {
    match idx.and_then(|i| cells.get(i)) {
        Some(cell) => coerce_number(cell),
        None => 0.0,
    }
}

/// The cell at `idx` if the column is mapped and the cell is non-empty.
fn cell_present(cells: &[Cell], idx: Option<usize>) -> Option<&Cell> {
    match idx.and_then(|i| cells.get(i)) {
        Some(Cell::Empty) | None => None,
        Some(cell) => Some(cell),
    }
}

fn cell_text(cell: &Cell) -> String {
    match cell {
        Cell::Text(s) => s.clone(),
        Cell::Number(v) | Cell::Serial(v) => v.to_string(),
        Cell::Empty => String::new(),
    }
}

// =============================================================================
// PERIOD / DATE NORMALIZER
// =============================================================================
// The export is inconsistent about date encoding depending on export locale
// and tool version: ISO strings, already-formatted strings, native date
// cells, and raw serial numbers all occur. Everything renders as DD/MM/YYYY.

/// Excel serials count days from 1899-12-30; 25569 days to the Unix epoch.
fn serial_to_display(serial: f64) -> String {
    let secs = ((serial - 25569.0) * 86400.0).round() as i64;
    DateTime::from_timestamp(secs, 0)
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_default()
}

fn normalize_period_cell(cell: &Cell) -> String {
    match cell {
        Cell::Empty => String::new(),
        Cell::Text(s) => {
            let s = s.trim();
            if s.contains('-') {
                // Assumed YYYY-MM-DD; field reorder, no calendar validation.
                let parts: Vec<&str> = s.split('-').collect();
                if parts.len() == 3 {
                    return format!("{}/{}/{}", parts[2], parts[1], parts[0]);
                }
            }
            s.to_string()
        }
        Cell::Number(serial) | Cell::Serial(serial) => serial_to_display(*serial),
    }
}

// =============================================================================
// ROW CLASSIFIER + ACCUMULATOR
// =============================================================================

/// Route a result-type label into a metric bucket using the tenant's rules.
/// Unmatched labels classify to no bucket; the row still counts toward the
/// tenant-wide totals.
fn classify(result_type: &str, rules: &[MappingRule]) -> Option<Bucket> {
    let label = result_type.trim().to_lowercase();
    if label.is_empty() {
        return None;
    }
    for rule in rules {
        for keyword in rule.keywords {
            if label.contains(keyword) {
                return Some(rule.bucket);
            }
        }
    }
    None
}

#[derive(Debug, Default, Clone, PartialEq)]
struct BucketTotals {
    results: i64,
    total_cost: f64,
}

#[derive(Debug, Default)]
struct ReportAccumulator {
    purchases: BucketTotals,
    leads: BucketTotals,
    profile_visits: BucketTotals,
    investment: f64,
    followers: i64,
    impressions: i64,
    period_start: Option<String>,
    period_end: Option<String>,
}

impl ReportAccumulator {
    fn bucket_mut(&mut self, bucket: Bucket) -> &mut BucketTotals {
        match bucket {
            Bucket::Purchases => &mut self.purchases,
            Bucket::Leads => &mut self.leads,
            Bucket::ProfileVisits => &mut self.profile_visits,
        }
    }
}

fn fold_row(acc: &mut ReportAccumulator, cfg: &TenantConfig, map: &ColumnMap, cells: &[Cell]) {
    // Investment counts for every row, classified or not.
    let investment = cell_number(cells, map.investment);
    acc.investment += investment;

    if let Some(cell) = cell_present(cells, map.followers) {
        let value = coerce_number(cell) as i64;
        match cfg.followers_policy {
            FollowersPolicy::SumDeltas => acc.followers += value,
            FollowersPolicy::LastSnapshot => acc.followers = value,
        }
    }

    if let Some(cell) = cell_present(cells, map.impressions) {
        acc.impressions += coerce_number(cell) as i64;
    }

    // Period fields: first non-empty occurrence wins, later ones are ignored.
    if acc.period_start.is_none() {
        if let Some(cell) = cell_present(cells, map.period_start) {
            let formatted = normalize_period_cell(cell);
            if !formatted.is_empty() {
                acc.period_start = Some(formatted);
            }
        }
    }
    if acc.period_end.is_none() {
        if let Some(cell) = cell_present(cells, map.period_end) {
            let formatted = normalize_period_cell(cell);
            if !formatted.is_empty() {
                acc.period_end = Some(formatted);
            }
        }
    }

    let result_type = match cell_present(cells, map.result_type) {
        Some(cell) => cell_text(cell),
        None => String::new(),
    };

    if let Some(bucket) = classify(&result_type, cfg.rules) {
        let results = cell_number(cells, map.results) as i64;
        let totals = acc.bucket_mut(bucket);
        totals.results += results;
        totals.total_cost += investment;
    }
}

// =============================================================================
// METRIC FINALIZER - the persisted report schema
// =============================================================================
// camelCase on the wire: the dashboard frontend and the PDF exporter read
// this document as-is.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricSummary {
    results: i64,
    cost_per_result: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportMetrics {
    purchases: MetricSummary,
    leads: MetricSummary,
    profile_visits: MetricSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Period {
    start: String,
    end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompanyReport {
    name: String,
    period: Period,
    metrics: ReportMetrics,
    investment: f64,
    followers: i64,
    impressions: i64,
}

fn summarize(totals: &BucketTotals) -> MetricSummary {
    let cost_per_result = if totals.results > 0 {
        totals.total_cost / totals.results as f64
    } else {
        0.0
    };
    MetricSummary {
        results: totals.results,
        cost_per_result,
    }
}

/// Deterministic given the accumulator's final state; no I/O.
fn finalize(acc: &ReportAccumulator, cfg: &TenantConfig) -> CompanyReport {
    CompanyReport {
        name: cfg.display_name.to_string(),
        period: Period {
            start: acc.period_start.clone().unwrap_or_default(),
            end: acc.period_end.clone().unwrap_or_default(),
        },
        metrics: ReportMetrics {
            purchases: summarize(&acc.purchases),
            leads: summarize(&acc.leads),
            profile_visits: summarize(&acc.profile_visits),
        },
        investment: acc.investment,
        followers: acc.followers,
        impressions: acc.impressions,
    }
}

// =============================================================================
// SPREADSHEET FRONTENDS - Excel (calamine) and CSV
// =============================================================================

/// Single pass over the row stream: map columns, fold, finalize.
fn normalize_rows<I>(cfg: &TenantConfig, headers: &[String], rows: I) -> CompanyReport
where
    I: IntoIterator<Item = Vec<Cell>>,
{
    let map = map_columns(headers);
    let mut acc = ReportAccumulator::default();
    for cells in rows {
        fold_row(&mut acc, cfg, &map, &cells);
    }
    finalize(&acc, cfg)
}

/// Parse an Excel upload (xls/xlsx, first sheet only).
fn parse_excel_report(file_path: &Path, cfg: &TenantConfig) -> Result<CompanyReport> {
    // calamine auto-detects the container: xls, xlsx, xlsb, ods
    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(file_path).context("Failed to open spreadsheet")?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        anyhow::bail!("Spreadsheet has no sheets");
    }

    let sheet_name = &sheet_names[0];
    let range = workbook
        .worksheet_range(sheet_name)
        .context("Failed to read sheet")?;

    let (row_count, col_count) = range.get_size();
    println!(
        "Sheet '{}': {} rows x {} columns (first of {} sheets)",
        sheet_name,
        row_count,
        col_count,
        sheet_names.len()
    );

    if row_count < 2 {
        anyhow::bail!("Sheet has insufficient rows (need header + data)");
    }

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .context("No header row")?
        .iter()
        .map(|cell| match cell {
            Data::String(s) => s.trim().to_string(),
            Data::Empty => String::new(),
            other => format!("{}", other),
        })
        .collect();

    Ok(normalize_rows(
        cfg,
        &headers,
        rows.map(|row| row.iter().map(excel_cell).collect()),
    ))
}

/// Parse a CSV upload (comma delimiter, header row defines columns).
fn parse_csv_report(content: &str, cfg: &TenantConfig) -> Result<CompanyReport> {
    // Remove UTF-8 BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows: Vec<Vec<Cell>> = Vec::new();
    for (line_idx, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Warning: skipping line {} due to error: {}", line_idx + 2, e);
                continue;
            }
        };
        rows.push(record.iter().map(csv_cell).collect());
    }

    Ok(normalize_rows(cfg, &headers, rows))
}

/// Detect if the upload is XLS/XLSX based on mime type or original filename
fn is_excel_file(mime_type: &str, original_name: &str) -> bool {
    mime_type.contains("excel")
        || mime_type.contains("spreadsheet")
        || original_name.ends_with(".xls")
        || original_name.ends_with(".xlsx")
}

// =============================================================================
// PERSISTENCE - full replace of the tenant's report
// =============================================================================

/// Create job run for normalizer
async fn create_job_run(pool: &PgPool, tenant_id: &str, upload_id: Uuid) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, tenant_id, status, detail)
        VALUES ($1, 'normalizer', $2, 'running', $3)
        "#,
    )
    .bind(job_run_id)
    .bind(tenant_id)
    .bind(serde_json::json!({ "upload_id": upload_id.to_string() }))
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

/// Finish job run
async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    report_written: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(serde_json::json!({ "report_written": report_written }))
    .execute(pool)
    .await?;
    Ok(())
}

/// Update upload parsed status
async fn update_upload_status(
    pool: &PgPool,
    upload_id: Uuid,
    status: &str,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE uploads SET parsed_status = $2, parsed_error = $3 WHERE upload_id = $1")
        .bind(upload_id)
        .bind(status)
        .bind(error)
        .execute(pool)
        .await?;
    Ok(())
}

/// Upsert the tenant's report and mark the upload processed, in one
/// transaction. The advisory lock serializes normalizer runs for the same
/// tenant; last committed upload wins (full replace, no history).
async fn save_report(
    pool: &PgPool,
    tenant_id: &str,
    upload_id: Uuid,
    report: &CompanyReport,
) -> Result<()> {
    let doc = serde_json::to_value(report).context("Failed to serialize report")?;

    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO reports (tenant_id, report, upload_id, updated_at)
        VALUES ($1, $2, $3, now())
        ON CONFLICT (tenant_id) DO UPDATE
        SET report = EXCLUDED.report, upload_id = EXCLUDED.upload_id, updated_at = now()
        "#,
    )
    .bind(tenant_id)
    .bind(&doc)
    .bind(upload_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE uploads SET parsed_status = 'ok', parsed_error = NULL WHERE upload_id = $1")
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Load the stored report for a tenant, if any
async fn load_stored_report(pool: &PgPool, tenant_id: &str) -> Result<Option<CompanyReport>> {
    let row: Option<(serde_json::Value,)> =
        sqlx::query_as("SELECT report FROM reports WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(pool)
            .await?;

    match row {
        Some((doc,)) => Ok(Some(
            serde_json::from_value(doc)
                .context("Stored report does not match the expected schema")?,
        )),
        None => Ok(None),
    }
}

fn print_report_summary(report: &CompanyReport) {
    println!("\nReport for {}:", report.name);
    println!(
        "  Period:         {} - {}",
        report.period.start, report.period.end
    );
    println!(
        "  Purchases:      {} results, {:.2} per result",
        report.metrics.purchases.results, report.metrics.purchases.cost_per_result
    );
    println!(
        "  Leads:          {} results, {:.2} per result",
        report.metrics.leads.results, report.metrics.leads.cost_per_result
    );
    println!(
        "  Profile visits: {} results, {:.2} per result",
        report.metrics.profile_visits.results, report.metrics.profile_visits.cost_per_result
    );
    println!("  Investment:     {:.2}", report.investment);
    println!("  Followers:      {}", report.followers);
    println!("  Impressions:    {}", report.impressions);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    let upload_id: Uuid = args.upload_id.parse().context("Invalid upload_id UUID")?;

    println!("=== Franca Performance Normalizer ===");
    println!("Upload ID: {}", upload_id);
    let mode = if args.verify {
        "verify"
    } else if args.dry_run {
        "dry-run"
    } else {
        "live"
    };
    println!("Mode: {}", mode);

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    // Load upload metadata
    let upload: Upload = sqlx::query_as(
        "SELECT upload_id, tenant_id, original_name, mime_type, storage_path, parsed_status FROM uploads WHERE upload_id = $1",
    )
    .bind(upload_id)
    .fetch_optional(&pool)
    .await?
    .context("Upload not found")?;

    println!("Tenant: {}", upload.tenant_id);
    println!("File: {}", upload.original_name);
    println!("Status: {}", upload.parsed_status);

    if upload.parsed_status == "ok" && !args.verify {
        println!("Upload already processed. Use --verify to re-check.");
        return Ok(());
    }

    let cfg = resolve_tenant(&upload.tenant_id);
    if cfg.id.is_empty() {
        println!(
            "Warning: unknown tenant '{}' - using default mapping",
            upload.tenant_id
        );
    }
    println!(
        "Mapping: {} ({} rule(s), followers {:?})",
        cfg.display_name,
        cfg.rules.len(),
        cfg.followers_policy
    );

    let tenant_key = canonical_tenant(&upload.tenant_id).to_string();

    // Create job run
    let job_run_id = if !args.dry_run && !args.verify {
        Some(create_job_run(&pool, &tenant_key, upload_id).await?)
    } else {
        None
    };

    let result = async {
        println!("Reading raw file: {}", upload.storage_path);
        println!("MIME type: {}", upload.mime_type);

        let report = if is_excel_file(&upload.mime_type, &upload.original_name) {
            println!("Detected Excel format");
            parse_excel_report(Path::new(&upload.storage_path), cfg)?
        } else {
            let content = fs::read_to_string(&upload.storage_path)
                .await
                .context("Failed to read upload file")?;
            println!("Detected CSV format ({} bytes)", content.len());
            parse_csv_report(&content, cfg)?
        };

        print_report_summary(&report);

        if args.verify {
            match load_stored_report(&pool, &tenant_key).await? {
                Some(stored) if stored == report => {
                    println!("\nVerify: stored report matches re-parsed output");
                }
                Some(_) => println!("\nVerify: stored report DIFFERS from re-parsed output"),
                None => println!("\nVerify: no stored report for tenant '{}'", tenant_key),
            }
            return Ok(false);
        }

        if args.dry_run {
            println!("\nDry run - report not saved");
            return Ok(false);
        }

        save_report(&pool, &tenant_key, upload_id, &report).await?;
        println!("\nReport saved for tenant '{}'", tenant_key);
        Ok::<bool, anyhow::Error>(true)
    }
    .await;

    // Update job run
    if let Some(job_id) = job_run_id {
        match &result {
            Ok(written) => finish_job_run(&pool, job_id, "ok", None, *written).await?,
            Err(e) => {
                update_upload_status(&pool, upload_id, "failed", Some(&e.to_string())).await?;
                finish_job_run(&pool, job_id, "failed", Some(&e.to_string()), false).await?;
            }
        }
    }

    result?;
    println!("\n=== Normalization Complete ===");
    Ok(())
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_HEADER: &str = "Tipo de resultado,Resultados,Valor usado (BRL),Seguidores no Instagram,Impressões,Início dos relatórios,Término dos relatórios";

    fn report(tenant: &str, csv: &str) -> CompanyReport {
        parse_csv_report(csv, resolve_tenant(tenant)).unwrap()
    }

    // -------------------------------------------------------------------------
    // DETERMINISM TESTS - Same input MUST produce same output
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_csv_report_determinism() {
        let csv = format!(
            "{}\nCompras no site,3,150.50,10,5000,2025-01-01,2025-01-31\n",
            FULL_HEADER
        );

        let baseline = report("houston", &csv);
        for _ in 0..10 {
            let run = report("houston", &csv);
            assert_eq!(baseline, run);
            assert_eq!(
                serde_json::to_string(&baseline).unwrap(),
                serde_json::to_string(&run).unwrap()
            );
        }
    }

    #[test]
    fn test_finalize_idempotent() {
        let mut acc = ReportAccumulator::default();
        acc.purchases = BucketTotals {
            results: 4,
            total_cost: 100.0,
        };
        acc.investment = 250.0;

        let cfg = resolve_tenant("houston");
        assert_eq!(finalize(&acc, cfg), finalize(&acc, cfg));
    }

    // -------------------------------------------------------------------------
    // ROW CLASSIFIER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_classify_houston_buckets() {
        let rules = resolve_tenant("houston").rules;
        assert_eq!(classify("Compras no site", rules), Some(Bucket::Purchases));
        assert_eq!(classify("compras", rules), Some(Bucket::Purchases));
        assert_eq!(classify("Leads no site", rules), Some(Bucket::Leads));
        assert_eq!(
            classify("Visitas ao perfil do Instagram", rules),
            Some(Bucket::ProfileVisits)
        );
    }

    #[test]
    fn test_classify_substring_containment() {
        // The label is free text; a keyword anywhere in it routes the row.
        let rules = resolve_tenant("houston").rules;
        assert_eq!(
            classify("Campanha Verão - Compras no Site (catálogo)", rules),
            Some(Bucket::Purchases)
        );
    }

    #[test]
    fn test_classify_case_insensitive() {
        let rules = resolve_tenant("houston").rules;
        assert_eq!(classify("COMPRAS NO SITE", rules), Some(Bucket::Purchases));
        assert_eq!(classify("LeAdS", rules), Some(Bucket::Leads));
    }

    #[test]
    fn test_classify_trevo_barbearia_remap() {
        // "Cliques no link" counts as profile visits for this tenant.
        let rules = resolve_tenant("trevo-barbearia").rules;
        assert_eq!(
            classify("Conversas por mensagem iniciadas", rules),
            Some(Bucket::Purchases)
        );
        assert_eq!(
            classify("Cliques no link", rules),
            Some(Bucket::ProfileVisits)
        );
        assert_eq!(
            classify("Clique no link", rules),
            Some(Bucket::ProfileVisits)
        );
    }

    #[test]
    fn test_classify_trevo_tabacaria_only_conversas() {
        let rules = resolve_tenant("trevo-tabacaria").rules;
        assert_eq!(classify("Conversas", rules), Some(Bucket::Purchases));
        assert_eq!(classify("Cliques no link", rules), None);
        assert_eq!(classify("Visitas ao perfil", rules), None);
    }

    #[test]
    fn test_classify_miguel_thruplay_unmapped() {
        let rules = resolve_tenant("miguel").rules;
        assert_eq!(
            classify("Visitas ao perfil", rules),
            Some(Bucket::ProfileVisits)
        );
        assert_eq!(classify("ThruPlay", rules), None);
    }

    #[test]
    fn test_classify_empty_label_no_match() {
        let rules = resolve_tenant("houston").rules;
        assert_eq!(classify("", rules), None);
        assert_eq!(classify("   ", rules), None);
    }

    // -------------------------------------------------------------------------
    // TENANT REGISTRY TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_resolve_tenant_known() {
        assert_eq!(resolve_tenant("houston").display_name, "Houston Academy");
        assert_eq!(
            resolve_tenant("trevo-barbearia").display_name,
            "Trevo Barbearia"
        );
        assert_eq!(
            resolve_tenant("trevo-tabacaria").display_name,
            "Trevo Tabacaria"
        );
        assert_eq!(resolve_tenant("miguel").display_name, "Miguel");
    }

    #[test]
    fn test_resolve_tenant_legacy_alias() {
        // "fagori" is the old name of the first client slot.
        let aliased = resolve_tenant("fagori");
        assert_eq!(aliased.id, "houston");
        assert_eq!(aliased.display_name, "Houston Academy");
        assert_eq!(canonical_tenant("fagori"), "houston");
    }

    #[test]
    fn test_resolve_tenant_unknown_falls_back() {
        let cfg = resolve_tenant("nope");
        assert_eq!(cfg.display_name, "Empresa");
        assert!(cfg.rules.is_empty());
    }

    #[test]
    fn test_unknown_tenant_report_has_empty_buckets() {
        let csv = format!(
            "{}\nCompras no site,3,150.00,,,,\nLeads,2,90.00,,,,\n",
            FULL_HEADER
        );
        let r = report("nope", &csv);

        assert_eq!(r.name, "Empresa");
        assert_eq!(r.metrics.purchases.results, 0);
        assert_eq!(r.metrics.leads.results, 0);
        assert_eq!(r.metrics.profile_visits.results, 0);
        // Tenant-wide totals still accumulate.
        assert_eq!(r.investment, 240.0);
    }

    // -------------------------------------------------------------------------
    // ACCUMULATOR TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_investment_sums_across_all_rows() {
        // Unclassified rows still count toward the tenant-wide investment.
        let csv = format!(
            "{}\nCompras no site,3,100.00,,,,\nThruPlay,50,40.50,,,,\nResumo,,9.50,,,,\n",
            FULL_HEADER
        );
        let r = report("houston", &csv);

        assert_eq!(r.investment, 150.0);
        assert_eq!(r.metrics.purchases.results, 3);
        assert_eq!(r.metrics.purchases.cost_per_result, 100.0 / 3.0);
    }

    #[test]
    fn test_conversas_por_mensagem_routes_to_purchases() {
        let csv = format!("{}\nConversas por mensagem,5,100.00,,,,\n", FULL_HEADER);
        let r = report("trevo-tabacaria", &csv);

        assert_eq!(r.metrics.purchases.results, 5);
        assert_eq!(r.metrics.purchases.cost_per_result, 20.0);
        assert_eq!(r.investment, 100.0);
    }

    #[test]
    fn test_malformed_results_contribute_zero() {
        let csv = format!(
            "{}\nCompras no site,n/a,80.00,,,,\nCompras no site,,20.00,,,,\n",
            FULL_HEADER
        );
        let r = report("houston", &csv);

        // Both rows classify, neither has a usable results cell.
        assert_eq!(r.metrics.purchases.results, 0);
        assert_eq!(r.metrics.purchases.cost_per_result, 0.0);
        assert_eq!(r.investment, 100.0);
    }

    #[test]
    fn test_malformed_investment_contributes_zero() {
        let csv = format!("{}\nCompras no site,2,abc,,,,\n", FULL_HEADER);
        let r = report("houston", &csv);

        assert_eq!(r.investment, 0.0);
        assert_eq!(r.metrics.purchases.results, 2);
        assert_eq!(r.metrics.purchases.cost_per_result, 0.0);
    }

    #[test]
    fn test_cost_per_result_zero_when_no_results() {
        assert_eq!(
            summarize(&BucketTotals {
                results: 0,
                total_cost: 500.0
            })
            .cost_per_result,
            0.0
        );
        assert_eq!(
            summarize(&BucketTotals {
                results: 8,
                total_cost: 100.0
            })
            .cost_per_result,
            12.5
        );
    }

    #[test]
    fn test_followers_sum_deltas() {
        let csv = format!(
            "{}\nCompras no site,1,10.00,10,,,\nLeads,2,20.00,20,,,\nThruPlay,,5.00,,,,\n",
            FULL_HEADER
        );
        let r = report("houston", &csv);
        assert_eq!(r.followers, 30);
    }

    #[test]
    fn test_followers_last_snapshot_policy() {
        static SNAPSHOT_TENANT: TenantConfig = TenantConfig {
            id: "snapshot",
            display_name: "Snapshot",
            rules: &[],
            followers_policy: FollowersPolicy::LastSnapshot,
        };
        let csv = format!("{}\n,,0,100,,,\n,,0,150,,,\n,,0,,,,\n", FULL_HEADER);
        let r = parse_csv_report(&csv, &SNAPSHOT_TENANT).unwrap();

        // Last non-empty value wins; the trailing empty cell does not reset it.
        assert_eq!(r.followers, 150);
    }

    #[test]
    fn test_impressions_sum() {
        let csv = format!("{}\n,,0,,5000,,\n,,0,,2500,,\n", FULL_HEADER);
        let r = report("houston", &csv);
        assert_eq!(r.impressions, 7500);
    }

    #[test]
    fn test_period_first_non_empty_wins() {
        let csv = format!(
            "{}\n,,0,,,2025-01-01,2025-01-31\n,,0,,,2025-02-01,2025-02-28\n",
            FULL_HEADER
        );
        let r = report("houston", &csv);

        assert_eq!(r.period.start, "01/01/2025");
        assert_eq!(r.period.end, "31/01/2025");
    }

    #[test]
    fn test_period_skips_leading_empty_cells() {
        let csv = format!("{}\n,,0,,,,\n,,0,,,2025-03-10,2025-03-20\n", FULL_HEADER);
        let r = report("houston", &csv);

        assert_eq!(r.period.start, "10/03/2025");
        assert_eq!(r.period.end, "20/03/2025");
    }

    // -------------------------------------------------------------------------
    // PERIOD / DATE NORMALIZER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_iso_date_string() {
        assert_eq!(
            normalize_period_cell(&Cell::Text("2025-01-31".to_string())),
            "31/01/2025"
        );
    }

    #[test]
    fn test_normalize_display_date_passthrough() {
        assert_eq!(
            normalize_period_cell(&Cell::Text("31/01/2025".to_string())),
            "31/01/2025"
        );
    }

    #[test]
    fn test_normalize_empty_cell() {
        assert_eq!(normalize_period_cell(&Cell::Empty), "");
    }

    #[test]
    fn test_normalize_serial_number() {
        // 45689 days after 1899-12-30 is 2025-02-01.
        assert_eq!(normalize_period_cell(&Cell::Number(45689.0)), "01/02/2025");
        assert_eq!(normalize_period_cell(&Cell::Serial(45689.0)), "01/02/2025");
    }

    #[test]
    fn test_serial_epoch_reference() {
        // Serial 25569 is exactly the Unix epoch.
        assert_eq!(serial_to_display(25569.0), "01/01/1970");
        assert_eq!(serial_to_display(45658.0), "01/01/2025");
    }

    // -------------------------------------------------------------------------
    // COLUMN MAPPING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_map_columns_full_header() {
        let headers: Vec<String> = FULL_HEADER.split(',').map(|h| h.to_string()).collect();
        let map = map_columns(&headers);

        assert_eq!(map.result_type, Some(0));
        assert_eq!(map.results, Some(1));
        assert_eq!(map.investment, Some(2));
        assert_eq!(map.followers, Some(3));
        assert_eq!(map.impressions, Some(4));
        assert_eq!(map.period_start, Some(5));
        assert_eq!(map.period_end, Some(6));
    }

    #[test]
    fn test_map_columns_unaccented_variants() {
        let headers: Vec<String> = [
            "Tipo de resultado",
            "Resultados",
            "Valor usado (BRL)",
            "Impressoes",
            "Inicio dos relatorios",
            "Termino dos relatorios",
        ]
        .iter()
        .map(|h| h.to_string())
        .collect();
        let map = map_columns(&headers);

        assert_eq!(map.impressions, Some(3));
        assert_eq!(map.period_start, Some(4));
        assert_eq!(map.period_end, Some(5));
        assert_eq!(map.followers, None);
    }

    #[test]
    fn test_results_column_not_confused_with_result_type() {
        let headers: Vec<String> = ["Tipo de resultado", "Resultados"]
            .iter()
            .map(|h| h.to_string())
            .collect();
        assert_eq!(find_column(&headers, RESULTS_COLUMNS), Some(1));
        assert_eq!(find_column(&headers, RESULT_TYPE_COLUMNS), Some(0));
    }

    #[test]
    fn test_missing_optional_columns_default_to_zero() {
        let csv = "Tipo de resultado,Resultados,Valor usado (BRL)\nCompras no site,4,200.00\n";
        let r = report("houston", csv);

        assert_eq!(r.metrics.purchases.results, 4);
        assert_eq!(r.followers, 0);
        assert_eq!(r.impressions, 0);
        assert_eq!(r.period.start, "");
        assert_eq!(r.period.end, "");
    }

    // -------------------------------------------------------------------------
    // CELL COERCION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_coerce_number_variants() {
        assert_eq!(coerce_number(&Cell::Number(12.5)), 12.5);
        assert_eq!(coerce_number(&Cell::Text("  42 ".to_string())), 42.0);
        assert_eq!(coerce_number(&Cell::Text("n/a".to_string())), 0.0);
        assert_eq!(coerce_number(&Cell::Empty), 0.0);
    }

    #[test]
    fn test_excel_cell_mapping() {
        assert_eq!(excel_cell(&Data::Empty), Cell::Empty);
        assert_eq!(
            excel_cell(&Data::String("  x  ".to_string())),
            Cell::Text("x".to_string())
        );
        assert_eq!(excel_cell(&Data::String("   ".to_string())), Cell::Empty);
        assert_eq!(excel_cell(&Data::Float(3.5)), Cell::Number(3.5));
        assert_eq!(excel_cell(&Data::Int(7)), Cell::Number(7.0));
    }

    #[test]
    fn test_is_excel_file() {
        assert!(is_excel_file("application/vnd.ms-excel", "x.raw"));
        assert!(is_excel_file(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "x.raw"
        ));
        assert!(is_excel_file("application/octet-stream", "janeiro.xlsx"));
        assert!(!is_excel_file("text/csv", "janeiro.csv"));
    }

    // -------------------------------------------------------------------------
    // EDGE CASES
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_csv() {
        let csv = format!("{}\n", FULL_HEADER);
        let r = report("houston", &csv);

        assert_eq!(r.metrics.purchases.results, 0);
        assert_eq!(r.metrics.leads.results, 0);
        assert_eq!(r.metrics.profile_visits.results, 0);
        assert_eq!(r.investment, 0.0);
        assert_eq!(r.period.start, "");
    }

    #[test]
    fn test_csv_with_bom() {
        let plain = format!("{}\nCompras no site,2,50.00,,,,\n", FULL_HEADER);
        let with_bom = format!("\u{feff}{}", plain);

        assert_eq!(report("houston", &plain), report("houston", &with_bom));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let csv = format!("{}\nCompras no site,2,50.00,,,,\n", FULL_HEADER);
        let doc = serde_json::to_value(report("houston", &csv)).unwrap();

        assert!(doc["metrics"]["purchases"]["costPerResult"].is_number());
        assert!(doc["metrics"]["profileVisits"].is_object());
        assert_eq!(doc["period"]["start"], "");
        assert_eq!(doc["name"], "Houston Academy");
    }

    #[test]
    fn test_full_upload_end_to_end() {
        let csv = format!(
            "{}\nCompras no site,3,150.00,12,40000,2025-01-01,2025-01-31\nLeads no site,10,80.00,8,30000,2025-02-01,2025-02-28\nVisitas ao perfil,200,60.00,,25000,,\nThruPlay,500,10.00,,,,\n",
            FULL_HEADER
        );
        let r = report("houston", &csv);

        assert_eq!(r.name, "Houston Academy");
        assert_eq!(r.period.start, "01/01/2025");
        assert_eq!(r.period.end, "31/01/2025");
        assert_eq!(r.metrics.purchases.results, 3);
        assert_eq!(r.metrics.purchases.cost_per_result, 50.0);
        assert_eq!(r.metrics.leads.results, 10);
        assert_eq!(r.metrics.leads.cost_per_result, 8.0);
        assert_eq!(r.metrics.profile_visits.results, 200);
        assert_eq!(r.metrics.profile_visits.cost_per_result, 0.3);
        assert_eq!(r.investment, 300.0);
        assert_eq!(r.followers, 20);
        assert_eq!(r.impressions, 95000);
    }
}
