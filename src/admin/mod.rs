//! Admin API: role inspection and switching, pool status.
//!
//! Served on its own listener, bearer-key protected.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::proxy::DispatchEngine;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<DispatchEngine>,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(engine: Arc<DispatchEngine>, api_key: &str) -> Router {
    let state = AdminState {
        engine,
        api_key: Arc::from(api_key),
    };
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/roles", get(get_roles))
        .route("/admin/roles/switch", post(switch_roles))
        .route("/admin/pool", get(get_pool))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
