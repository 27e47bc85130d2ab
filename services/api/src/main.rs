//! API Service - Dashboard API for Franca Performance
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /tenants - List recognized tenants
//! - GET /dashboard - Finalized report + insights for one tenant
//! - GET /uploads - Upload history for the admin screen
//! - GET /insights - Free-text insights for one tenant
//! - PUT /insights - Update a tenant's insights

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Tenant registry surface (id + display name; mapping rules live in the
// normalizer)
// ============================================================================

const TENANTS: &[(&str, &str)] = &[
    ("houston", "Houston Academy"),
    ("trevo-barbearia", "Trevo Barbearia"),
    ("trevo-tabacaria", "Trevo Tabacaria"),
    ("miguel", "Miguel"),
];

/// Map legacy tenant ids onto the canonical registry.
fn canonical_tenant(id: &str) -> &str {
    match id {
        "fagori" => "houston",
        other => other,
    }
}

fn display_name(id: &str) -> &'static str {
    let canonical = canonical_tenant(id);
    TENANTS
        .iter()
        .find(|(tid, _)| *tid == canonical)
        .map(|(_, name)| *name)
        .unwrap_or("Empresa")
}

// ============================================================================
// Display formatting (pt-BR)
// ============================================================================

/// Group an integer with pt-BR thousands separators, e.g. 145000 -> "145.000"
fn format_grouped(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    if value < 0 {
        format!("-{}", out)
    } else {
        out
    }
}

/// Format a monetary value as Brazilian reais, e.g. 5890.0 -> "R$ 5.890,00"
fn format_brl(value: f64) -> String {
    let sign = if value < 0.0 { "-" } else { "" };
    let cents = (value.abs() * 100.0).round() as i64;
    format!("{}R$ {},{:02}", sign, format_grouped(cents / 100), cents % 100)
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct TenantResponse {
    id: &'static str,
    name: &'static str,
}

// The report document as the normalizer persists it (camelCase wire format
// shared with the dashboard frontend and the PDF exporter).
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricDto {
    results: i64,
    cost_per_result: f64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportMetricsDto {
    purchases: MetricDto,
    leads: MetricDto,
    profile_visits: MetricDto,
}

#[derive(Serialize, Deserialize)]
struct PeriodDto {
    start: String,
    end: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportDto {
    name: String,
    period: PeriodDto,
    metrics: ReportMetricsDto,
    investment: f64,
    followers: i64,
    impressions: i64,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InsightsDto {
    progress: String,
    positives: String,
    next_focus: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardResponse {
    tenant: String,
    report: ReportDto,
    investment_formatted: String,
    impressions_formatted: String,
    insights: InsightsDto,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    upload_id: Uuid,
    tenant_id: String,
    original_name: String,
    captured_at: DateTime<Utc>,
    content_hash: String,
    mime_type: String,
    size_bytes: i64,
    parsed_status: String,
    parsed_error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct DashboardQuery {
    tenant: String,
}

#[derive(Deserialize)]
struct InsightsQuery {
    tenant: String,
}

#[derive(Deserialize)]
struct UploadsQuery {
    tenant: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsightsUpdate {
    tenant: String,
    #[serde(default)]
    progress: String,
    #[serde(default)]
    positives: String,
    #[serde(default)]
    next_focus: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn tenants_handler() -> impl IntoResponse {
    let tenants: Vec<TenantResponse> = TENANTS
        .iter()
        .map(|(id, name)| TenantResponse { id, name })
        .collect();
    Json(serde_json::json!({ "tenants": tenants }))
}

async fn load_insights(pool: &PgPool, tenant: &str) -> Result<InsightsDto, sqlx::Error> {
    let row: Option<(String, String, String)> =
        sqlx::query_as("SELECT progress, positives, next_focus FROM insights WHERE tenant_id = $1")
            .bind(tenant)
            .fetch_optional(pool)
            .await?;

    Ok(match row {
        Some((progress, positives, next_focus)) => InsightsDto {
            progress,
            positives,
            next_focus,
        },
        None => InsightsDto::default(),
    })
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DashboardQuery>,
) -> impl IntoResponse {
    let tenant = canonical_tenant(&params.tenant).to_string();

    let row: Result<Option<(serde_json::Value, DateTime<Utc>)>, _> =
        sqlx::query_as("SELECT report, updated_at FROM reports WHERE tenant_id = $1")
            .bind(&tenant)
            .fetch_optional(&state.pool)
            .await;

    let (doc, updated_at) = match row {
        Ok(Some(r)) => r,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!(
                        "No report available for {} ('{}')",
                        display_name(&tenant),
                        tenant
                    ),
                }),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let report: ReportDto = match serde_json::from_value(doc) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Stored report is malformed: {}", e),
                }),
            )
                .into_response();
        }
    };

    let insights = match load_insights(&state.pool, &tenant).await {
        Ok(i) => i,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let investment_formatted = format_brl(report.investment);
    let impressions_formatted = format_grouped(report.impressions);

    Json(DashboardResponse {
        tenant,
        report,
        investment_formatted,
        impressions_formatted,
        insights,
        updated_at,
    })
    .into_response()
}

async fn uploads_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(20).min(100);

    let uploads: Result<Vec<UploadResponse>, _> = if let Some(tenant) = params.tenant {
        sqlx::query_as(
            r#"
            SELECT upload_id, tenant_id, original_name, captured_at, content_hash,
                   mime_type, size_bytes, parsed_status, parsed_error
            FROM uploads
            WHERE tenant_id = $1
            ORDER BY captured_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    } else {
        sqlx::query_as(
            r#"
            SELECT upload_id, tenant_id, original_name, captured_at, content_hash,
                   mime_type, size_bytes, parsed_status, parsed_error
            FROM uploads
            ORDER BY captured_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    };

    match uploads {
        Ok(u) => Json(serde_json::json!({ "uploads": u })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn insights_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InsightsQuery>,
) -> impl IntoResponse {
    let tenant = canonical_tenant(&params.tenant).to_string();

    match load_insights(&state.pool, &tenant).await {
        Ok(i) => Json(i).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn update_insights_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InsightsUpdate>,
) -> impl IntoResponse {
    let tenant = canonical_tenant(&body.tenant).to_string();

    let result = sqlx::query(
        r#"
        INSERT INTO insights (tenant_id, progress, positives, next_focus, updated_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (tenant_id) DO UPDATE
        SET progress = EXCLUDED.progress,
            positives = EXCLUDED.positives,
            next_focus = EXCLUDED.next_focus,
            updated_at = now()
        "#,
    )
    .bind(&tenant)
    .bind(&body.progress)
    .bind(&body.positives)
    .bind(&body.next_focus)
    .execute(&state.pool)
    .await;

    match result {
        Ok(_) => Json(InsightsDto {
            progress: body.progress,
            positives: body.positives,
            next_focus: body.next_focus,
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Franca Performance API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/tenants", get(tenants_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/uploads", get(uploads_handler))
        .route("/insights", get(insights_handler).put(update_insights_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /tenants");
    println!("  GET /dashboard?tenant=");
    println!("  GET /uploads?tenant=&limit=");
    println!("  GET /insights?tenant=");
    println!("  PUT /insights");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
