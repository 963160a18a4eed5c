//! HTTP single-shot path: one `POST /` request envelope in, one JSON reply
//! body out.
//!
//! A degenerate case of the same envelope codec the WebSocket sessions use.
//! No correlator is involved since the HTTP body *is* the reply; the `reqId`
//! is echoed back purely so the body matches the wire shape (`0` stands in
//! when a malformed request's id could not be recovered).

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{Method, Request, Response, StatusCode, body::Incoming, header};
use serde_json::value::RawValue;
use tracing::warn;

use crate::{
    codec,
    config::ServerConfig,
    envelope::{Envelope, ErrorCode, ErrorInfo, ReqId},
    executor::{TaskExecutor, execute_guarded},
    metrics::{self, Direction},
};

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Internal | ErrorCode::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response parts are valid")
}

fn envelope_response(status: StatusCode, envelope: &Envelope) -> Response<Full<Bytes>> {
    match codec::encode(envelope) {
        Ok(body) => json_response(status, body),
        Err(e) => {
            warn!(error = %e, "failed to encode single-shot reply");
            metrics::inc_errors();
            plain(StatusCode::INTERNAL_SERVER_ERROR, "reply encoding failed")
        }
    }
}

fn error_response(req_id: ReqId, error: ErrorInfo) -> Response<Full<Bytes>> {
    envelope_response(status_for(error.code), &Envelope::error(req_id, error))
}

fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message.to_owned())))
        .expect("static response parts are valid")
}

/// Answer one plain HTTP request with the executor's result.
pub(super) async fn handle_single_shot(
    executor: &Arc<dyn TaskExecutor>,
    config: &ServerConfig,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "only POST is supported");
    }
    if req.uri().path() != "/" {
        return plain(StatusCode::NOT_FOUND, "not found");
    }

    let body = match Limited::new(req.into_body(), config.max_http_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read single-shot body");
            metrics::inc_errors();
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };
    metrics::inc_messages(Direction::Inbound);

    match codec::decode(&body) {
        Ok(Envelope::Request { req_id, payload }) => {
            match execute_guarded(executor, payload).await {
                Ok(result) => {
                    envelope_response(StatusCode::OK, &Envelope::response(req_id, result))
                }
                Err(error) => error_response(req_id, error),
            }
        }
        Ok(Envelope::Batch { requests }) => {
            // Elements run concurrently; the reply array keeps request order
            // so the body stays self-describing even without correlation.
            let replies = futures::future::join_all(requests.into_iter().map(|item| async move {
                match execute_guarded(executor, item.payload).await {
                    Ok(result) => Envelope::response(item.req_id, result),
                    Err(error) => Envelope::error(item.req_id, error),
                }
            }))
            .await;
            let mut encoded: Vec<Box<RawValue>> = Vec::with_capacity(replies.len());
            for reply in &replies {
                let raw = codec::encode(reply)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .and_then(|text| RawValue::from_string(text).ok());
                let Some(raw) = raw else {
                    warn!("failed to encode batch reply element");
                    metrics::inc_errors();
                    return plain(StatusCode::INTERNAL_SERVER_ERROR, "reply encoding failed");
                };
                encoded.push(raw);
            }
            match serde_json::to_vec(&encoded) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => {
                    warn!(error = %e, "failed to encode batch reply");
                    metrics::inc_errors();
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "reply encoding failed")
                }
            }
        }
        Ok(other) => {
            warn!(kind = %other.kind(), "single-shot request with non-request envelope");
            metrics::inc_errors();
            error_response(
                other.req_id().unwrap_or(0),
                ErrorInfo::bad_request("the HTTP path accepts request envelopes only"),
            )
        }
        Err(e) => {
            warn!(error = %e, "malformed single-shot request");
            metrics::inc_errors();
            let req_id = codec::peek(&body).ok().and_then(|head| head.req_id).unwrap_or(0);
            error_response(req_id, ErrorInfo::bad_request(e.to_string()))
        }
    }
}
