use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditHandle;
use crate::mitigation::MitigationController;
use crate::models::{GlobalStats, MitigationRule, RuleOutcome};

/// État partagé avec les handlers de l'API de contrôle
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<MitigationController>,
    pub audit: AuditHandle,
    pub stats: Arc<GlobalStats>,
    /// TTL appliqué quand la requête n'en précise pas
    pub block_ttl: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    ip: String,
    /// TTL en secondes ; absent = TTL configuré, 0 = règle permanente
    ttl_secs: Option<u64>,
    reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl ApiResponse {
    fn ok(message: String) -> Json<Self> {
        Json(Self {
            success: true,
            message,
            data: None,
        })
    }

    fn ok_with(message: String, data: serde_json::Value) -> Json<Self> {
        Json(Self {
            success: true,
            message,
            data: Some(data),
        })
    }

    fn err(message: String) -> Json<Self> {
        Json(Self {
            success: false,
            message,
            data: None,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

/// Vue sérialisable d'une règle active
#[derive(Debug, Serialize)]
struct RuleView {
    address: String,
    created_at: String,
    expiry: Option<String>,
    reason: String,
    outcome: &'static str,
}

impl From<&MitigationRule> for RuleView {
    fn from(rule: &MitigationRule) -> Self {
        Self {
            address: rule.address.to_string(),
            created_at: iso(rule.created_at),
            expiry: rule.expiry.map(iso),
            reason: rule.reason.clone(),
            outcome: rule.outcome.as_str(),
        }
    }
}

fn iso(ts: std::time::SystemTime) -> String {
    DateTime::<Utc>::from(ts).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/block", post(block_ip))
        .route("/api/v1/unblock/:ip", post(unblock_ip))
        .route("/api/v1/status/:ip", get(check_status))
        .route("/api/v1/rules", get(list_rules))
        .route("/api/v1/decisions", get(list_decisions))
        .route("/api/v1/flows", get(list_flows))
        .route("/api/v1/stats", get(show_stats))
        .with_state(state)
}

/// Démarre le serveur de l'API de contrôle en arrière-plan.
pub fn spawn_api_server(listen: String, state: ApiState) {
    tokio::spawn(async move {
        let router = create_router(state);
        match tokio::net::TcpListener::bind(&listen).await {
            Ok(listener) => {
                info!("API de contrôle à l'écoute sur {}", listen);
                if let Err(e) = axum::serve(listener, router).await {
                    error!("Erreur du serveur API: {}", e);
                }
            }
            Err(e) => {
                error!("Impossible d'écouter sur {}: {}", listen, e);
            }
        }
    });
}

async fn block_ip(
    State(state): State<ApiState>,
    Json(payload): Json<BlockRequest>,
) -> Json<ApiResponse> {
    let ttl = match payload.ttl_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => Some(state.block_ttl),
    };
    let reason = payload
        .reason
        .clone()
        .unwrap_or_else(|| "demande manuelle via l'API".to_string());

    match state.controller.block_address(&payload.ip, ttl, &reason).await {
        Ok(RuleOutcome::Applied) => {
            ApiResponse::ok(format!("IP {} bloquée avec succès", payload.ip))
        }
        Ok(RuleOutcome::AlreadyActive) => {
            ApiResponse::ok(format!("IP {} déjà bloquée", payload.ip))
        }
        Ok(RuleOutcome::Whitelisted) => ApiResponse::err(format!(
            "IP {} en liste blanche, blocage refusé",
            payload.ip
        )),
        Ok(RuleOutcome::PermissionDenied) => ApiResponse::err(format!(
            "Privilèges insuffisants, règle consignée pour {}",
            payload.ip
        )),
        Ok(RuleOutcome::BackendFailure) => ApiResponse::err(format!(
            "Aucun backend n'a pu bloquer {}",
            payload.ip
        )),
        Err(e) => ApiResponse::err(e.to_string()),
    }
}

async fn unblock_ip(State(state): State<ApiState>, Path(ip): Path<String>) -> Json<ApiResponse> {
    match state.controller.unblock_address(&ip).await {
        Ok(_) => ApiResponse::ok(format!("IP {} débloquée", ip)),
        Err(e) => ApiResponse::err(e.to_string()),
    }
}

async fn check_status(State(state): State<ApiState>, Path(ip): Path<String>) -> Json<ApiResponse> {
    match crate::mitigation::parse_address(&ip) {
        Ok(addr) => {
            let blocked = state.controller.is_blocked(addr);
            ApiResponse::ok_with(
                if blocked {
                    format!("IP {} est bloquée", ip)
                } else {
                    format!("IP {} n'est pas bloquée", ip)
                },
                serde_json::json!({ "blocked": blocked }),
            )
        }
        Err(e) => ApiResponse::err(e.to_string()),
    }
}

async fn list_rules(State(state): State<ApiState>) -> Json<ApiResponse> {
    let rules = state.controller.active_rules();
    let views: Vec<RuleView> = rules.iter().map(RuleView::from).collect();
    match serde_json::to_value(&views) {
        Ok(data) => ApiResponse::ok_with(format!("{} règle(s) active(s)", views.len()), data),
        Err(e) => ApiResponse::err(format!("Erreur de sérialisation: {}", e)),
    }
}

async fn list_decisions(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Json<ApiResponse> {
    let limit = query.limit.unwrap_or(20);
    match state.audit.recent_decisions(limit).await {
        Ok(rows) => match serde_json::to_value(&rows) {
            Ok(data) => ApiResponse::ok_with(format!("{} décision(s)", rows.len()), data),
            Err(e) => ApiResponse::err(format!("Erreur de sérialisation: {}", e)),
        },
        Err(e) => ApiResponse::err(format!("Erreur de lecture du journal d'audit: {:#}", e)),
    }
}

async fn list_flows(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Json<ApiResponse> {
    let limit = query.limit.unwrap_or(20);
    match state.audit.recent_flows(limit).await {
        Ok(rows) => match serde_json::to_value(&rows) {
            Ok(data) => ApiResponse::ok_with(format!("{} flux", rows.len()), data),
            Err(e) => ApiResponse::err(format!("Erreur de sérialisation: {}", e)),
        },
        Err(e) => ApiResponse::err(format!("Erreur de lecture du journal d'audit: {:#}", e)),
    }
}

async fn show_stats(State(state): State<ApiState>) -> Json<ApiResponse> {
    let snapshot = state.stats.snapshot();
    match serde_json::to_value(&snapshot) {
        Ok(data) => ApiResponse::ok_with("Statistiques du service".to_string(), data),
        Err(e) => ApiResponse::err(format!("Erreur de sérialisation: {}", e)),
    }
}
