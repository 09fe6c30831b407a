pub mod hub;
pub mod session;

pub use hub::AppState;

use axum::Router;
use axum::routing::get;
use tangram_bus::Bus;
use tower_http::trace::TraceLayer;

pub fn build_router<B: Bus + Clone + Send + Sync + 'static>(state: AppState<B>) -> Router {
    Router::new()
        .route("/ws/v1/channel", get(session::channel_socket_handler::<B>))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
