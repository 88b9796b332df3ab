//! WebSocket upgrade in front of MQTT.
//!
//! # Responsibilities
//! - Complete the HTTP upgrade handshake with the client
//! - Only accept requests under the listener's mount point
//! - Negotiate the MQTT sub-protocol
//!
//! # Design Decisions
//! - The upgraded stream is handed over untouched; framing belongs to the codec
//! - Clients that offer sub-protocols must offer an MQTT one

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::WebSocketStream;

use crate::net::stream::ByteStream;

/// Sub-protocol names MQTT clients offer, in preference order.
pub const MQTT_SUBPROTOCOLS: &[&str] = &["mqtt", "mqttv3.1"];

/// True when `path` lies under `mount_point` (`None` accepts everything).
pub fn path_matches(mount_point: Option<&str>, path: &str) -> bool {
    match mount_point {
        None | Some("/") => true,
        Some(mount) => {
            let mount = mount.trim_end_matches('/');
            path == mount || path.strip_prefix(mount).is_some_and(|rest| rest.starts_with('/'))
        }
    }
}

/// The client offered sub-protocols, none of them MQTT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no MQTT sub-protocol offered (got {0:?})")]
pub struct NoMqttSubprotocol(pub String);

/// Pick the sub-protocol to answer with from the client's offer.
///
/// `Ok(None)` when the client offered nothing.
pub fn select_subprotocol(offered: Option<&str>) -> Result<Option<&'static str>, NoMqttSubprotocol> {
    let Some(offered) = offered else {
        return Ok(None);
    };
    let names: Vec<&str> = offered.split(',').map(str::trim).collect();
    MQTT_SUBPROTOCOLS
        .iter()
        .find(|p| names.iter().any(|o| o.eq_ignore_ascii_case(p)))
        .map(|p| Some(*p))
        .ok_or_else(|| NoMqttSubprotocol(offered.to_string()))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Run the upgrade handshake on an accepted stream.
pub async fn upgrade(
    stream: ByteStream,
    mount_point: Option<String>,
) -> Result<WebSocketStream<ByteStream>, tokio_tungstenite::tungstenite::Error> {
    let callback = move |request: &Request, mut response: Response| {
        let path = request.uri().path();
        if !path_matches(mount_point.as_deref(), path) {
            tracing::debug!(path, mount_point = ?mount_point, "WebSocket request outside mount point");
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }

        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok());
        match select_subprotocol(offered) {
            Ok(Some(protocol)) => {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
                Ok(response)
            }
            Ok(None) => Ok(response),
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket request without MQTT sub-protocol");
                Err(reject(StatusCode::BAD_REQUEST, "unsupported sub-protocol"))
            }
        }
    };

    tokio_tungstenite::accept_hdr_async(stream, callback).await
}
