use crate::state::AppState;
use axum::Router;

mod dto;
pub mod extractors;
pub mod firebase;
pub mod handlers;
pub(crate) mod services;

pub use firebase::{FirebaseVerifier, TokenVerifier};

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::profile_routes())
}
