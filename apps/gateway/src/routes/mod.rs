pub mod health;
pub mod presence;

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", presence::router())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        presence::get_presence,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            crate::gateway::presence::PresenceStatus,
            crate::gateway::presence::PresenceRecord,
            crate::models::user::UserProfile,
            health::HealthResponse,
            presence::PresenceResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Presence", description = "User presence"),
    )
)]
pub struct ApiDoc;
