use sqlx::PgPool;

use tcap_runtime::CaptureRuntime;

/// Shared state handed to every route handler.
pub struct AppState {
    pub pool: PgPool,
    pub runtime: CaptureRuntime,
    pub config_hash: String,
}
