//! HTTP control API over the poll controller.

use {
    axum::{
        Json,
        body::Bytes,
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    pollcast_polls::{Error, LaunchReport, PollResult, PollView},
    serde::{Deserialize, Serialize},
    serde_json::json,
    tracing::{error, info},
};

use crate::state::AppState;

/// Poll engine errors as HTTP responses with a JSON `{ "error": … }` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::PollNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::InvalidPoll { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub actor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamerRemoved {
    pub campaign_id: String,
    pub streamer_id: String,
    /// Running polls whose channel for the streamer was torn down.
    pub poll_ids: Vec<String>,
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": state.version,
        "channels": state.broadcaster.channel_count(),
    }))
}

pub async fn get_poll_handler(
    State(state): State<AppState>,
    Path(poll_id): Path<String>,
) -> ApiResult<PollView> {
    Ok(Json(state.controller.view(&poll_id).await?))
}

pub async fn launch_poll_handler(
    State(state): State<AppState>,
    Path(poll_id): Path<String>,
) -> ApiResult<LaunchReport> {
    let report = state.controller.launch(&poll_id).await?;
    info!(
        poll_id = %poll_id,
        links = report.links.len(),
        failed = report.failed.len(),
        "poll launched via api"
    );
    Ok(Json(report))
}

/// The body is optional. When present it must be a JSON [`CancelRequest`].
pub async fn cancel_poll_handler(
    State(state): State<AppState>,
    Path(poll_id): Path<String>,
    body: Bytes,
) -> ApiResult<PollResult> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CancelRequest::default()
    } else {
        serde_json::from_slice::<CancelRequest>(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid cancel request: {e}")))?
    };
    let result = state
        .controller
        .cancel(&poll_id, request.actor.as_deref())
        .await?;
    Ok(Json(result))
}

pub async fn remove_streamer_handler(
    State(state): State<AppState>,
    Path((campaign_id, streamer_id)): Path<(String, String)>,
) -> ApiResult<StreamerRemoved> {
    let poll_ids = state
        .controller
        .remove_streamer(&campaign_id, &streamer_id)
        .await?;
    Ok(Json(StreamerRemoved {
        campaign_id,
        streamer_id,
        poll_ids,
    }))
}
