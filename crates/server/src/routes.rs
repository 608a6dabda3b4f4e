//! HTTP ingress.
//!
//! - `POST /request`          registers a business request
//! - `POST /update_workload`  adjusts an agent's workload seconds
//! - `POST /`                 legacy single-endpoint dispatch on `action`
//! - `GET  /health`           service/database probe (see `health`)

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use caseflow_core::fsm::{PreApproval, RequestEngine, SubmitOptions};
use caseflow_core::rowstore::RowStore;
use caseflow_core::{columns, InterfaceError, RequestType, RowValues};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<RequestEngine>,
}

pub fn router(engine: Arc<RequestEngine>) -> Router {
    Router::new()
        .route("/request", post(submit_request))
        .route("/update_workload", post(update_workload))
        .route("/", post(dispatch))
        .with_state(ApiState { engine })
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub request_type: String,
    pub email_address: String,
    pub company_code: String,
    pub company_name: String,
    pub department: Option<String>,
    pub attachment_url: Option<String>,
    pub document_number: Option<String>,
    pub additional_attachment: Option<String>,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
    pub promo_type: Option<String>,
    pub total_task: Option<u32>,
    pub modify_type: Option<String>,
    pub by_phone_confirmation: Option<bool>,
    pub transaction_section: Option<String>,
    pub update_to: Option<String>,
    pub bank_type: Option<String>,
    pub total_promo: Option<u32>,
    pub is_requester: Option<bool>,
    pub is_approver: Option<bool>,
    #[serde(rename = "isApproverII")]
    pub is_approver_ii: Option<bool>,
    #[serde(rename = "isApproverIII")]
    pub is_approver_iii: Option<bool>,
    pub approver_name: Option<String>,
    #[serde(rename = "approverIIName")]
    pub approver_ii_name: Option<String>,
    #[serde(rename = "approverIIIName")]
    pub approver_iii_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub status: &'static str,
    pub data: T,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitData {
    pub message: String,
    pub request_number: String,
    pub attachment_url: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
    pub code: u16,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        code,
        Json(ErrorResponse { status: "error", message: message.into(), code: code.as_u16() }),
    )
}

fn interface_error(error: InterfaceError) -> (StatusCode, Json<ErrorResponse>) {
    let code = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(code, error.user_message())
}

pub async fn submit_request(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<SubmitData>>), (StatusCode, Json<ErrorResponse>)> {
    for (field, value) in [
        ("requestType", &payload.request_type),
        ("emailAddress", &payload.email_address),
        ("companyCode", &payload.company_code),
        ("companyName", &payload.company_name),
    ] {
        if value.trim().is_empty() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("`{field}` is required"),
            ));
        }
    }

    let Some(request_type) = RequestType::parse(&payload.request_type) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown request type `{}`", payload.request_type),
        ));
    };

    let now = Utc::now();
    let table = request_type.master_table();
    let values = row_values(&payload, request_type, now.to_rfc3339());

    let row_id = state
        .engine
        .rows
        .upsert_row(table.table_name(), &values, false)
        .await
        .map_err(|error| interface_error(error.into_interface("http-submit")))?;

    let options = submit_options(&payload);
    let outcome = state
        .engine
        .handle_on_submit(table, row_id, &options)
        .await
        .map_err(|error| interface_error(error.into_interface("http-submit")))?;

    info!(
        event_name = "http.request_submitted",
        request_number = %outcome.request_number,
        request_type = request_type.as_str(),
        "submission accepted"
    );

    Ok((
        StatusCode::OK,
        Json(SuccessResponse {
            status: "success",
            data: SubmitData {
                message: "request registered".to_string(),
                request_number: outcome.request_number.0,
                attachment_url: outcome.attachment.0,
                timestamp: now.to_rfc3339(),
            },
        }),
    ))
}

fn row_values(payload: &SubmitRequest, request_type: RequestType, timestamp: String) -> RowValues {
    let mut values = RowValues::new();
    values.insert(columns::TIMESTAMP.to_string(), timestamp);
    values.insert(columns::REQUEST_TYPE.to_string(), request_type.as_str().to_string());
    values.insert(columns::EMAIL_ADDRESS.to_string(), payload.email_address.clone());
    values.insert(columns::COMPANY_CODE.to_string(), payload.company_code.clone());
    values.insert(columns::COMPANY_NAME.to_string(), payload.company_name.clone());
    if let Some(department) = &payload.department {
        values.insert(columns::DEPARTMENT.to_string(), department.clone());
    }
    if let Some(attachment_url) = &payload.attachment_url {
        values.insert(columns::ATTACHMENT.to_string(), attachment_url.clone());
    }
    if let Some(total_task) = payload.total_task {
        values.insert(columns::TOTAL_TASK.to_string(), total_task.to_string());
    }

    // Type-specific detail columns ride along as extra cells.
    let extras: [(&str, Option<String>); 10] = [
        ("Document Number", payload.document_number.clone()),
        ("Additional Attachment", payload.additional_attachment.clone()),
        ("Valid From", payload.valid_from.clone()),
        ("Valid To", payload.valid_to.clone()),
        ("Promo Type", payload.promo_type.clone()),
        ("Modify Type", payload.modify_type.clone()),
        ("Transaction Section", payload.transaction_section.clone()),
        ("Update To", payload.update_to.clone()),
        ("Bank Type", payload.bank_type.clone()),
        ("Total Promo", payload.total_promo.map(|total| total.to_string())),
    ];
    for (column, value) in extras {
        if let Some(value) = value {
            values.insert(column.to_string(), value);
        }
    }
    if let Some(by_phone) = payload.by_phone_confirmation {
        values.insert("By Phone Confirmation".to_string(), by_phone.to_string());
    }
    values
}

/// Pre-approved levels of a cross-chained request: the named approver (or
/// the requester when the chain carries no name) is recorded as having
/// approved already.
fn submit_options(payload: &SubmitRequest) -> SubmitOptions {
    let mut preapproved = Vec::new();
    let flags = [
        (payload.is_approver, &payload.approver_name, 1usize),
        (payload.is_approver_ii, &payload.approver_ii_name, 2),
        (payload.is_approver_iii, &payload.approver_iii_name, 3),
    ];
    for (flag, name, level) in flags {
        if flag.unwrap_or(false) {
            let name =
                name.clone().filter(|name| !name.trim().is_empty()).unwrap_or_else(|| {
                    payload.email_address.clone()
                });
            preapproved.push(PreApproval { level, name });
        }
    }
    SubmitOptions { preapproved }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRequest {
    pub action: Option<String>,
    pub mdm_name: String,
    pub seconds: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadData {
    pub mdm_name: String,
    pub workload_seconds: i64,
}

pub async fn update_workload(
    State(state): State<ApiState>,
    Json(payload): Json<WorkloadRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<WorkloadData>>), (StatusCode, Json<ErrorResponse>)> {
    if payload.mdm_name.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "`mdmName` is required"));
    }

    let total = state
        .engine
        .workload
        .add(&payload.mdm_name, payload.seconds)
        .await
        .map_err(|error| interface_error(error.into_interface("http-workload")))?;

    Ok((
        StatusCode::OK,
        Json(SuccessResponse {
            status: "success",
            data: WorkloadData { mdm_name: payload.mdm_name, workload_seconds: total },
        }),
    ))
}

/// Legacy single-endpoint entry: dispatches on the `action` field, falling
/// back to a submission payload.
pub async fn dispatch(
    state: State<ApiState>,
    Json(raw): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<ErrorResponse>)> {
    let action = raw.get("action").and_then(|value| value.as_str());
    match action {
        Some("update_workload") => {
            let payload: WorkloadRequest = serde_json::from_value(raw).map_err(|error| {
                error_response(StatusCode::BAD_REQUEST, format!("invalid payload: {error}"))
            })?;
            let (code, Json(body)) = update_workload(state, Json(payload)).await?;
            Ok((code, Json(serde_json::to_value(body).unwrap_or_default())))
        }
        Some(other) => {
            warn!(event_name = "http.unknown_action", action = other, "unknown action");
            Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown action `{other}`"),
            ))
        }
        None => {
            let payload: SubmitRequest = serde_json::from_value(raw).map_err(|error| {
                error_response(StatusCode::BAD_REQUEST, format!("invalid payload: {error}"))
            })?;
            let (code, Json(body)) = submit_request(state, Json(payload)).await?;
            Ok((code, Json(serde_json::to_value(body).unwrap_or_default())))
        }
    }
}
