use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    Json,
};
use bytes::Bytes;
use lettre::message::Mailbox;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use mailq_core::models::{MailRequest, TaskStatus};
use mailq_core::AppError;

#[derive(Debug, Serialize, ToSchema)]
pub struct SendResponse {
    pub id: i64,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFormat {
    Xml,
    Json,
}

/// Media type without parameters, e.g. `text/xml; charset=utf-8` -> `text/xml`.
fn body_format(headers: &HeaderMap) -> Result<BodyFormat, AppError> {
    let raw = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let essence = raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase();

    match essence.as_str() {
        "application/xml" | "text/xml" => Ok(BodyFormat::Xml),
        "application/json" => Ok(BodyFormat::Json),
        "" => Err(AppError::UnsupportedMediaType(
            "Missing Content-Type, expected application/xml".to_string(),
        )),
        other => Err(AppError::UnsupportedMediaType(format!(
            "Content-Type {} is not supported, expected application/xml",
            other
        ))),
    }
}

fn decode(format: BodyFormat, body: &[u8]) -> Result<MailRequest, AppError> {
    match format {
        BodyFormat::Xml => {
            let text = std::str::from_utf8(body)
                .map_err(|_| AppError::InvalidInput("Request body is not valid UTF-8".to_string()))?;
            quick_xml::de::from_str(text)
                .map_err(|e| AppError::InvalidInput(format!("Malformed XML body: {}", e)))
        }
        BodyFormat::Json => serde_json::from_slice(body)
            .map_err(|e| AppError::InvalidInput(format!("Malformed JSON body: {}", e))),
    }
}

/// Queue an email for delivery
#[utoipa::path(
    post,
    path = "/send",
    tag = "mail",
    request_body(
        content = MailRequest,
        description = "`<mail><to/><subject/><body/></mail>` as application/xml, or the same fields as JSON",
        content_type = "application/xml"
    ),
    responses(
        (status = 202, description = "Mail queued", body = SendResponse),
        (status = 400, description = "Malformed body, missing field or invalid recipient", body = ErrorResponse),
        (status = 413, description = "Body too large"),
        (status = 415, description = "Unsupported content type", body = ErrorResponse),
        (status = 500, description = "Task store failure", body = ErrorResponse),
        (status = 503, description = "Queue at capacity", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, headers, body), fields(body_bytes = body.len()))]
pub async fn send_mail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SendResponse>), HttpAppError> {
    let format = body_format(&headers)?;
    let task = decode(format, &body)?.validate()?;

    task.recipient.parse::<Mailbox>().map_err(|e| {
        AppError::InvalidInput(format!("Invalid recipient address {}: {}", task.recipient, e))
    })?;

    let id = state.queue.submit(task).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SendResponse {
            id,
            status: TaskStatus::Pending,
        }),
    ))
}
