use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::adapters::http::state::HttpState;
use crate::application::dto::{ErrorResponse, ModelTestResponse, OkResponse, StartRequest};
use crate::domain::{
    action::{ActionConfig, SinkKind},
    camera::{Camera, CameraId},
    errors::DomainError,
    model::{Model, ModelId, ModelUpdate},
};

/// Maps service errors onto HTTP status codes.
pub struct ApiError(DomainError);

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DomainError::NotFound(_) => StatusCode::NOT_FOUND,
            DomainError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DomainError::OperationFailed(_) => StatusCode::CONFLICT,
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn ok() -> ApiResult<OkResponse> {
    Ok(Json(OkResponse { ok: true }))
}

pub async fn status(State(st): State<HttpState>) -> impl IntoResponse {
    Json(st.inspection.status())
}

pub async fn list_cameras(State(st): State<HttpState>) -> ApiResult<Vec<Camera>> {
    Ok(Json(st.inspection.list_cameras()?))
}

pub async fn register_camera(State(st): State<HttpState>, Json(camera): Json<Camera>) -> ApiResult<Camera> {
    Ok(Json(st.inspection.register_camera(camera)?))
}

pub async fn update_camera(
    State(st): State<HttpState>,
    Path(id): Path<String>,
    Json(camera): Json<Camera>,
) -> ApiResult<Camera> {
    Ok(Json(st.inspection.update_camera(&CameraId::new(id), camera)?))
}

pub async fn remove_camera(State(st): State<HttpState>, Path(id): Path<String>) -> ApiResult<OkResponse> {
    st.inspection.remove_camera(&CameraId::new(id))?;
    ok()
}

pub async fn start(
    State(st): State<HttpState>,
    Path(id): Path<String>,
    Json(req): Json<StartRequest>,
) -> ApiResult<OkResponse> {
    st.inspection.start(&CameraId::new(id), req.models)?;
    ok()
}

pub async fn stop(State(st): State<HttpState>, Path(id): Path<String>) -> ApiResult<OkResponse> {
    st.inspection.stop(&CameraId::new(id))?;
    ok()
}

pub async fn pause(State(st): State<HttpState>, Path(id): Path<String>) -> ApiResult<OkResponse> {
    st.inspection.pause(&CameraId::new(id))?;
    ok()
}

pub async fn resume(State(st): State<HttpState>, Path(id): Path<String>) -> ApiResult<OkResponse> {
    st.inspection.resume(&CameraId::new(id))?;
    ok()
}

pub async fn trigger(State(st): State<HttpState>, Path(id): Path<String>) -> ApiResult<OkResponse> {
    st.inspection.trigger(&CameraId::new(id))?;
    ok()
}

pub async fn list_models(State(st): State<HttpState>) -> impl IntoResponse {
    Json(st.inspection.list_models())
}

pub async fn register_model(State(st): State<HttpState>, Json(model): Json<Model>) -> Result<impl IntoResponse, ApiError> {
    let view = st.inspection.register_model(model)?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

pub async fn update_model(
    State(st): State<HttpState>,
    Path(id): Path<String>,
    Json(update): Json<ModelUpdate>,
) -> ApiResult<Model> {
    Ok(Json(st.inspection.update_model(&ModelId::new(id), update)?))
}

/// Body is the raw JPEG to run through the model.
pub async fn test_model(
    State(st): State<HttpState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<ModelTestResponse> {
    let outcome = st.inspection.test_model(&ModelId::new(id), body.to_vec()).await?;
    Ok(Json(ModelTestResponse::resolve(outcome, st.inspection.registry())))
}

pub async fn remove_model(State(st): State<HttpState>, Path(id): Path<String>) -> ApiResult<OkResponse> {
    st.inspection.remove_model(&ModelId::new(id))?;
    ok()
}

pub async fn get_actions(State(st): State<HttpState>) -> impl IntoResponse {
    Json(st.inspection.actions())
}

pub async fn apply_actions(State(st): State<HttpState>, Json(config): Json<ActionConfig>) -> ApiResult<OkResponse> {
    st.inspection.apply_actions(config)?;
    ok()
}

/// Connection test for one sink with the stored configuration.
pub async fn test_action(State(st): State<HttpState>, Path(kind): Path<SinkKind>) -> impl IntoResponse {
    match st.inspection.probe_sink(kind).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "ok": false, "error": e.to_string(), "transient": e.is_transient() })),
        )
            .into_response(),
    }
}
