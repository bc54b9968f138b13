//! HTTP API: health, battle creation and lookup, socket upgrade

use axum::{
    extract::{Extension, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::battle::field::BattleSetup;
use crate::battle::{BattleHandle, BattleSummary};
use crate::http::middleware::{require_auth, AuthenticatedUser};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    // The socket authenticates through its query string
    let open = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler));

    let battles = Router::new()
        .route("/battles", post(create_battle_handler))
        .route("/battles/:id", get(battle_info_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    open.merge(battles)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `origins` is a comma separated list; unparseable entries are skipped
fn cors_layer(origins: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_battles: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let battles = &state.battles;
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_battles: battles.active_battles(),
        active_players: battles.total_participants(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BattleInfo {
    battle_id: Uuid,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    summary: BattleSummary,
}

impl From<&BattleHandle> for BattleInfo {
    fn from(handle: &BattleHandle) -> Self {
        Self {
            battle_id: handle.id,
            created_at: handle.created_at,
            summary: handle.summary(),
        }
    }
}

async fn create_battle_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(setup): Json<BattleSetup>,
) -> Result<(StatusCode, Json<BattleInfo>), AppError> {
    if state.create_limiter.check().is_err() {
        return Err(AppError::TooManyRequests);
    }

    let handle = state
        .battles
        .spawn(setup, state.config.tuning.clone(), state.clock.clone())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    info!(
        battle_id = %handle.id,
        created_by = %auth.user_id,
        "Battle created"
    );

    Ok((StatusCode::CREATED, Json(BattleInfo::from(&handle))))
}

async fn battle_info_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BattleInfo>, AppError> {
    let handle = state
        .battles
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Battle {id}")))?;

    Ok(Json(BattleInfo::from(&handle)))
}

/// API failures, rendered as `{"error": ..., "code": ...}`
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Battle creation rate exceeded")]
    TooManyRequests,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        };
        let body = ErrorBody {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::field::GridPos;
    use crate::battle::session::BattleInput;
    use crate::battle::unit::Unit;
    use crate::config::Config;

    fn state() -> AppState {
        let config = Config::from_lookup(|key| (key == "JWT_SECRET").then(|| "secret".to_string()))
            .unwrap();
        AppState::new(config)
    }

    fn caller() -> Extension<AuthenticatedUser> {
        let user_id = Uuid::new_v4();
        Extension(AuthenticatedUser {
            user_id,
            claims: crate::http::middleware::JwtClaims {
                sub: user_id,
                exp: u64::MAX,
                iat: 0,
                role: None,
            },
        })
    }

    fn setup(width: i32) -> BattleSetup {
        BattleSetup {
            width,
            height: 5,
            units: vec![Unit::new(Uuid::new_v4(), Uuid::new_v4(), "a", GridPos::new(0, 0), 40)],
            obstacles: Vec::new(),
            seed: Some(1),
        }
    }

    #[tokio::test]
    async fn created_battle_can_be_looked_up() {
        let state = state();

        let (status, Json(created)) =
            create_battle_handler(State(state.clone()), caller(), Json(setup(5)))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.summary.units_alive, 1);

        let Json(found) = battle_info_handler(State(state.clone()), Path(created.battle_id))
            .await
            .unwrap();
        assert_eq!(found.battle_id, created.battle_id);

        let Json(health) = health_handler(State(state.clone())).await;
        assert_eq!(health.active_battles, 1);

        if let Some(handle) = state.battles.get(&created.battle_id) {
            handle.input_tx.send(BattleInput::End).await.unwrap();
        }
    }

    #[tokio::test]
    async fn invalid_setup_and_unknown_ids_map_to_client_errors() {
        let state = state();

        let err = create_battle_handler(State(state.clone()), caller(), Json(setup(0)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = battle_info_handler(State(state), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn battle_creation_is_rate_limited() {
        let state = state();
        let mut statuses = Vec::new();
        for _ in 0..8 {
            let status = match create_battle_handler(State(state.clone()), caller(), Json(setup(5))).await {
                Ok((status, _)) => status,
                Err(e) => e.into_response().status(),
            };
            statuses.push(status);
        }
        assert!(statuses.contains(&StatusCode::TOO_MANY_REQUESTS));
    }
}
