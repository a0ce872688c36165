use serde::Serialize;

use crate::config::PublicAppConfig;
use crate::errors::AppResult;
use crate::store::PlaceRecord;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub db_path: String,
    pub diagnostics_buffer_path: String,
    pub diagnostics_queue_depth: usize,
    pub place_count: usize,
    pub config: PublicAppConfig,
}

#[derive(Debug, Serialize)]
pub struct DeleteReport {
    pub id: i64,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct CountReport {
    pub deleted: usize,
}

pub fn status(state: &AppState) -> AppResult<StatusReport> {
    Ok(StatusReport {
        db_path: state.db_path().to_string_lossy().to_string(),
        diagnostics_buffer_path: state
            .diagnostics()
            .buffer_path()
            .to_string_lossy()
            .to_string(),
        diagnostics_queue_depth: state.diagnostics().queue_depth(),
        place_count: state.store().list_all()?.len(),
        config: state.config().public_profile(),
    })
}

pub fn list_places(state: &AppState) -> AppResult<Vec<PlaceRecord>> {
    state.store().list_all()
}

pub async fn delete_place(state: &AppState, id: i64) -> AppResult<DeleteReport> {
    let deleted = state.store().delete(id).await?;
    Ok(DeleteReport { id, deleted })
}

pub async fn clear_places(state: &AppState) -> AppResult<CountReport> {
    let deleted = state.store().clear().await?;
    Ok(CountReport { deleted })
}

pub async fn sweep_now(state: &AppState) -> AppResult<CountReport> {
    let deleted = state.sweeper().sweep_once(chrono::Utc::now()).await?;
    Ok(CountReport { deleted })
}
