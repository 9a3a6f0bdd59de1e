use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::services::request_handler::{RequestHandler, ServiceMode};
use crate::services::result_encoder::ResultEncoder;
use crate::validation::RequestValidator;

const JSONP_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<RequestHandler>,
}

/// `GET /muster?database=..&select=..&from=..[&where=..][&order=..]&callback=..`
pub async fn muster(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let failure = match state.handler.handle(&params).await {
        Ok(body) => return jsonp(StatusCode::OK, body),
        Err(failure) => failure,
    };

    match state.handler.mode() {
        // Older clients only ever see an empty 200 on failure
        ServiceMode::Legacy => jsonp(StatusCode::OK, String::new()),
        ServiceMode::Hardened => {
            let callback = params
                .get("callback")
                .filter(|callback| RequestValidator::validate_callback(callback).is_ok());
            match callback {
                Some(callback) => jsonp(
                    failure.error.status_code(),
                    ResultEncoder::encode_error(callback, &failure.error.to_string()),
                ),
                None => failure.error.into_response(),
            }
        }
    }
}

fn jsonp(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, JSONP_CONTENT_TYPE)], body).into_response()
}
