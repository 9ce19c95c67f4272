//! Execution handler

use std::sync::Arc;

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::models::{ExecuteRequestBody, ExecuteResponse, ExecutionRequest};
use crate::AppState;

/// An uploaded file, already decoded
#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Execute body accepted as JSON (base64 files) or multipart form data
#[derive(Debug, Default)]
pub struct ExecutePayload {
    pub script: Option<String>,
    pub stdin: Option<String>,
    pub image: Option<String>,
    pub files: Vec<Upload>,
}

impl TryFrom<ExecuteRequestBody> for ExecutePayload {
    type Error = ApiError;

    fn try_from(body: ExecuteRequestBody) -> Result<Self, Self::Error> {
        let files = body
            .files
            .into_iter()
            .map(|file| {
                let data = base64::Engine::decode(
                    &base64::engine::general_purpose::STANDARD,
                    &file.content,
                )
                .map_err(|_| {
                    ApiError::BadRequest(format!("Invalid base64 content for {}", file.filename))
                })?;
                Ok(Upload {
                    filename: file.filename,
                    data,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;

        Ok(Self {
            script: body.script,
            stdin: body.stdin,
            image: body.image,
            files,
        })
    }
}

/// Body rejections keep the 413 of an exceeded body limit
fn rejected(status: StatusCode, message: String) -> ApiError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::BadRequest(message)
    }
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> ApiError {
    rejected(e.status(), e.body_text())
}

#[axum::async_trait]
impl<S> FromRequest<S> for ExecutePayload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !content_type.starts_with("multipart/form-data") {
            let Json(body) = Json::<ExecuteRequestBody>::from_request(req, state)
                .await
                .map_err(|e| rejected(e.status(), e.body_text()))?;
            return body.try_into();
        }

        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| rejected(e.status(), e.body_text()))?;
        let mut payload = ExecutePayload::default();

        while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "script" => payload.script = Some(field.text().await.map_err(bad_multipart)?),
                "stdin" => payload.stdin = Some(field.text().await.map_err(bad_multipart)?),
                "image" => payload.image = Some(field.text().await.map_err(bad_multipart)?),
                "files" => {
                    let filename = field.file_name().unwrap_or("").to_string();
                    let data = field.bytes().await.map_err(bad_multipart)?;
                    // Browsers send an empty part for an untouched file input
                    if filename.is_empty() {
                        continue;
                    }
                    payload.files.push(Upload {
                        filename,
                        data: data.to_vec(),
                    });
                }
                _ => {}
            }
        }

        Ok(payload)
    }
}

/// Run a script, staging any attached files first
pub async fn execute_script(
    State(state): State<Arc<AppState>>,
    payload: ExecutePayload,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let script = payload
        .script
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("No script provided".into()))?;

    let mut request = ExecutionRequest::new(script);
    if let Some(stdin) = payload.stdin.filter(|s| !s.is_empty()) {
        request = request.with_stdin(stdin);
    }
    if let Some(image) = payload.image.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        request = request.with_image(image);
    }

    if payload.files.is_empty() {
        let result = state.router.execute(request).await;
        return Ok(Json(result.into()));
    }

    let session = state.files.create_session().await?;
    let response = execute_with_files(&state, session, request, payload.files).await;
    state.files.cleanup_session(session).await;
    response.map(Json)
}

async fn execute_with_files(
    state: &AppState,
    session: Uuid,
    request: ExecutionRequest,
    files: Vec<Upload>,
) -> Result<ExecuteResponse, ApiError> {
    for file in &files {
        if let Err(e) = state.files.add_file(session, &file.filename, &file.data).await {
            warn!(session_id = %session, file = %file.filename, error = %e, "Upload rejected");
            return Err(ApiError::FileRejected {
                name: file.filename.clone(),
                reason: e.to_string(),
            });
        }
    }
    info!(session_id = %session, files = files.len(), "Staged files for execution");

    let result = state.router.execute(request.with_file_session(session)).await;

    let mut response = ExecuteResponse::from(result);
    if let Some(info) = state.files.get_session_info(session).await {
        response = response.with_session(&info);
    }
    Ok(response)
}
