//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use parley_protocol::headers::{
    PRODUCER_EPOCH, PRODUCER_EXPECTED_SEQ, PRODUCER_ID, PRODUCER_RECEIVED_SEQ, PRODUCER_SEQ,
    STREAM_CLOSED, STREAM_CURSOR, STREAM_NEXT_OFFSET, STREAM_UP_TO_DATE,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::auth_middleware;

use super::handlers;
use super::state::AppState;

/// Create the application router, mounted under `/api`.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Protected routes (require authentication)
    let protected_routes = Router::new()
        .route(
            "/sessions/{session_id}",
            get(handlers::get_session)
                .head(handlers::head_session)
                .delete(handlers::delete_session),
        )
        .route(
            "/sessions/{session_id}/stream",
            get(handlers::read_stream).post(handlers::append_stream),
        )
        .route(
            "/sessions/{session_id}/messages",
            post(handlers::post_message),
        )
        .route(
            "/sessions/{session_id}/tool-results",
            post(handlers::post_tool_result),
        )
        .route(
            "/sessions/{session_id}/approvals/{approval_id}",
            post(handlers::post_approval),
        )
        .route(
            "/sessions/{session_id}/control",
            post(handlers::post_control),
        )
        .route("/sessions/{session_id}/config", post(handlers::post_config))
        .route("/sessions/{session_id}/run", get(handlers::get_run))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    // Public routes (no authentication)
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .with_state(state.clone());

    let api = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(state.max_body_bytes));

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer from the configured origins.
///
/// In dev mode, localhost origins are always allowed.
/// Outside dev mode, an empty list denies cross-origin requests.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::DELETE,
        Method::HEAD,
        Method::OPTIONS,
    ];

    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::COOKIE,
        HeaderName::from_static(crate::auth::DEV_USER_HEADER),
        HeaderName::from_static(PRODUCER_ID),
        HeaderName::from_static(PRODUCER_EPOCH),
        HeaderName::from_static(PRODUCER_SEQ),
        HeaderName::from_static(STREAM_CLOSED),
    ];

    // Browsers only expose these to scripts when listed.
    let exposed = [
        HeaderName::from_static(STREAM_NEXT_OFFSET),
        HeaderName::from_static(STREAM_CURSOR),
        HeaderName::from_static(STREAM_UP_TO_DATE),
        HeaderName::from_static(STREAM_CLOSED),
        HeaderName::from_static(PRODUCER_EPOCH),
        HeaderName::from_static(PRODUCER_SEQ),
        HeaderName::from_static(PRODUCER_RECEIVED_SEQ),
        HeaderName::from_static(PRODUCER_EXPECTED_SEQ),
        header::ETAG,
    ];

    let mut origins: Vec<HeaderValue> = state
        .cors_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if state.auth.is_dev_mode() {
        for origin in [
            "http://localhost:3000",
            "http://localhost:5173",
            "http://127.0.0.1:3000",
            "http://127.0.0.1:5173",
        ] {
            let value = HeaderValue::from_static(origin);
            if !origins.contains(&value) {
                origins.push(value);
            }
        }
    }

    if origins.is_empty() {
        tracing::warn!("CORS: No origins configured, denying all cross-origin requests");
        return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
    }

    tracing::info!("CORS: Allowing {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(exposed)
        .allow_credentials(true)
}
