use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::proxy::RoleSwitch;
use crate::upstream::PoolStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
}

pub async fn get_status() -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
    })
}

pub async fn get_roles(State(state): State<AdminState>) -> Json<RoleSwitch> {
    Json(state.engine.roles().describe())
}

/// Same effect as SIGUSR1.
pub async fn switch_roles(State(state): State<AdminState>) -> Json<RoleSwitch> {
    tracing::info!("Role switch requested through admin API");
    Json(state.engine.switch_roles().describe())
}

pub async fn get_pool(State(state): State<AdminState>) -> Json<Vec<PoolStatus>> {
    Json(state.engine.pool().status())
}
