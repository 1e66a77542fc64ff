// Export route modules
pub mod conversations;
pub mod reply;
pub mod tools;

use axum::Router;
use crate::state::AppState;

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(reply::routes(state.clone()))
        .merge(conversations::routes(state.clone()))
        .merge(tools::routes(state))
}
