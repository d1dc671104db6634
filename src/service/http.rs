use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use poem::http::StatusCode;
use poem::web::{Data, Json, Path};
use poem::{Endpoint, EndpointExt, IntoResponse, Response, Route, handler};
use tracing::warn;

use super::ca::{CaSigner, LocalCa};
use super::handler::{ClientContext, RenewalHandler};
use super::store::{InMemoryRenewalStore, RenewalStore};
use crate::protocol::{ErrorResponse, RenewalRequestBody};

/// Header carrying the verified peer certificate, base64 DER, set by the
/// TLS-terminating proxy.
pub const HEADER_CLIENT_CERTIFICATE: &str = "x-client-certificate";

pub type ServiceHandler = RenewalHandler<LocalCa, InMemoryRenewalStore>;

/// Builds the service routes around a shared handler.
pub fn routes(handler: Arc<ServiceHandler>) -> impl Endpoint {
    Route::new()
        .at(
            "/api/v1/devices/:name/certificaterenewal",
            poem::post(certificate_renewal),
        )
        .at("/healthz", poem::get(healthz))
        .data(handler)
}

#[handler]
async fn healthz() -> &'static str {
    "ok"
}

#[handler]
async fn certificate_renewal(
    req: &poem::Request,
    Path(name): Path<String>,
    body: Vec<u8>,
    Data(handler): Data<&Arc<ServiceHandler>>,
) -> Response {
    let client_certificate = req
        .headers()
        .get(HEADER_CLIENT_CERTIFICATE)
        .and_then(|value| value.to_str().ok());
    let client_ip = req
        .remote_addr()
        .as_socket_addr()
        .map(|addr| addr.ip().to_string());
    process_renewal(handler, &name, client_certificate, client_ip, &body).await
}

/// Answers one renewal call: decodes the transport inputs, runs the handler
/// and renders the JSON response.
pub async fn process_renewal<C: CaSigner, S: RenewalStore>(
    handler: &RenewalHandler<C, S>,
    device_id: &str,
    client_certificate: Option<&str>,
    client_ip: Option<String>,
    body: &[u8],
) -> Response {
    let request: RenewalRequestBody = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            warn!(device_id, "Malformed renewal request body: {err}");
            return error_response(StatusCode::BAD_REQUEST, "Invalid request format");
        }
    };
    let Some(encoded) = client_certificate else {
        return error_response(StatusCode::UNAUTHORIZED, "Client certificate required");
    };
    let presented = match STANDARD.decode(encoded.trim()) {
        Ok(der) => der,
        Err(err) => {
            warn!(device_id, "Undecodable client certificate header: {err}");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid client certificate");
        }
    };

    let client = ClientContext {
        presented_certificate: Some(&presented),
        client_ip,
    };
    match handler.handle_renewal_request(device_id, &request, client).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => {
            let body = err.to_response(Some(&request.request_id));
            (err.status(), Json(body)).into_response()
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = ErrorResponse {
        error: message.to_string(),
        details: None,
        request_id: None,
    };
    (status, Json(body)).into_response()
}
