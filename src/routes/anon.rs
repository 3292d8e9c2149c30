//! Masking status for the current request.

use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::db::SessionConnection;
use crate::errors::AppResult;
use crate::masking::PgMaskedSession;
use crate::models::role::Role;

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub enabled: bool,
    #[schema(example = json!(["analysts"]))]
    pub masked_groups: Vec<String>,
    #[schema(example = "masked_reader")]
    pub default_masked_role: String,
    pub fail_closed_on_switch_error: bool,
    /// Whether this request runs under the masked role.
    pub masked: bool,
    /// Role the request's database session is using.
    pub current_user: Option<String>,
    pub roles: Vec<Role>,
}

#[utoipa::path(
    get,
    path = "/api/anon/status",
    tag = "Anonymizer",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Masking status for the calling user", body = StatusResponse),
        (status = 503, description = "Masked role unavailable and the policy fails closed")
    )
)]
pub async fn status(
    State(state): State<AppState>,
    masked: Option<Extension<PgMaskedSession>>,
) -> AppResult<Json<StatusResponse>> {
    let current_user = match &masked {
        Some(Extension(session)) => {
            let mut conn = session.connection.lock().await;
            let current_user = conn.query_one("SELECT current_user::text").await?;
            current_user
        }
        None => {
            sqlx::query_scalar::<_, String>("SELECT current_user::text")
                .fetch_optional(&state.pool)
                .await?
        }
    };

    let policy = &state.policy;
    Ok(Json(StatusResponse {
        enabled: policy.enabled,
        masked_groups: policy.masked_groups.iter().cloned().collect(),
        default_masked_role: policy.default_masked_role.clone(),
        fail_closed_on_switch_error: policy.fail_closed_on_switch_error,
        masked: masked.is_some(),
        current_user,
        roles: state.gate.registry().list(),
    }))
}
