//! REST access to recorded transcription sessions.

use crate::{error::AppError, state::AppState, storage::SessionId};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::info;

const DEFAULT_LIMIT: u64 = 100;
const MAX_LIMIT: u64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub skip: u64,
    pub limit: Option<u64>,
}

impl ListQuery {
    fn limit(&self) -> u64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, AppError> {
    SessionId::parse_str(raw).map_err(|_| AppError::BadRequest(format!("Invalid session id: {}", raw)))
}

/// `GET /api/v1/sessions?skip=&limit=`: newest sessions first.
pub async fn list_sessions(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let page = state.store.list_sessions(query.skip, query.limit()).await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn get_session(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let session_id = parse_session_id(&path)?;
    let details = state.store.get_session(session_id).await?;
    Ok(HttpResponse::Ok().json(details))
}

pub async fn delete_session(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let session_id = parse_session_id(&path)?;
    state.store.delete_session(session_id).await?;
    info!(%session_id, "Deleted session");
    Ok(HttpResponse::NoContent().finish())
}
