use crate::error::ApiError;
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use warble::capabilities::CapabilityMetadata;

/// One enabled capability as shown in a tool picker
#[derive(Debug, Deserialize, Serialize)]
struct ToolListing {
    id: String,
    name: String,
    description: String,
    category: String,
    icon: String,
}

impl From<CapabilityMetadata> for ToolListing {
    fn from(metadata: CapabilityMetadata) -> Self {
        Self {
            id: metadata.id,
            name: metadata.display_name,
            description: metadata.description,
            category: metadata.category,
            icon: metadata.icon,
        }
    }
}

async fn list_tools(State(state): State<AppState>) -> Result<Json<Vec<ToolListing>>, ApiError> {
    let metadata = state
        .agent
        .list_tools()
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(metadata.into_iter().map(ToolListing::from).collect()))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .with_state(state)
}
