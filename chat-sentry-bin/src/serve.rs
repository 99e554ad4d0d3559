//! HTTP surface for the admission gate and the operator admin endpoints.
//!
//! The dashboard's request, handshake, and ingestion layers call the
//! `/check/*`, `/connections/*`, and `/observe` routes before doing their
//! work; operator tooling uses `/stats`, `/blacklist`, `/whitelist`, and
//! `/limits/clear`. Every denial carries a stable machine-readable code and,
//! where applicable, a retry hint in seconds.

use chat_sentry::{BroadcastClearance, Clearance, Denial, Sentry};
use http::{
    Method, Request, Response, StatusCode,
    header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER},
};
use http_body::Body;
use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper_util::{rt::TokioIo, server::conn::auto};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::bytes::Buf;
use tracing::{error, info, warn};

/// Start the http listening task
pub fn start_http_task(listener: TcpListener, sentry: Arc<Sentry>) -> tokio::task::JoinHandle<()> {
    // Loop waiting for http incoming connections, and serve them against the sentry
    tokio::task::spawn(async move {
        loop {
            let Ok((stream, remote_addr)) = listener
                .accept()
                .await
                .inspect_err(|err| error!("Error accepting connection: {err}"))
            else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            info!("New connection from: {}", remote_addr);

            // Spawn a new task to handle each connection
            let thread_sentry = sentry.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                // Serve the connection using auto protocol detection (HTTP/1 or HTTP/2)
                if let Err(err) = auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                    .serve_connection(
                        io,
                        service_fn(|req| handle_request(thread_sentry.clone(), req)),
                    )
                    .await
                {
                    error!("Error serving connection: {err}");
                }
            });
        }
    })
}

async fn handle_request(
    sentry: Arc<Sentry>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<String>, Infallible> {
    match handle_request_impl(sentry, req).await {
        Ok(resp) => Ok(resp),
        Err(resp) => Ok(resp),
    }
}

#[derive(Debug, Deserialize)]
struct KeyBody {
    key: String,
}

#[derive(Debug, Deserialize)]
struct BroadcastBody {
    session: String,
    recipients: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatUserBody {
    session: String,
    chat_user: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionBody {
    addr: String,
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct BlacklistBody {
    key: String,
    reason: String,
    /// Entry lifetime (e.g. "24h"); the configured default when absent.
    #[serde(default)]
    duration: Option<String>,
    /// If true, the entry never expires and `duration` is ignored.
    #[serde(default)]
    permanent: bool,
}

async fn handle_request_impl<B>(
    sentry: Arc<Sentry>,
    req: Request<B>,
) -> Result<Response<String>, Response<String>>
where
    B: Body + Send,
    B::Data: Buf + Send,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    info!("Received http request: {method} {path}");

    match (&method, path.as_str()) {
        (&Method::GET | &Method::HEAD, "/" | "/health") => Ok(ok_resp()),
        (&Method::POST, "/check/api") => {
            let body: KeyBody = read_json(req).await?;
            Ok(gate_resp(sentry.check_api(&body.key)))
        }
        (&Method::POST, "/check/auth") => {
            let body: KeyBody = read_json(req).await?;
            Ok(gate_resp(sentry.check_auth(&body.key)))
        }
        (&Method::POST, "/check/message") => {
            let body: KeyBody = read_json(req).await?;
            Ok(gate_resp(sentry.check_message(&body.key)))
        }
        (&Method::POST, "/check/broadcast") => {
            let body: BroadcastBody = read_json(req).await?;
            Ok(broadcast_resp(
                sentry.check_broadcast(&body.session, body.recipients),
            ))
        }
        (&Method::POST, "/observe") => {
            let body: ChatUserBody = read_json(req).await?;
            let verdict = sentry.observe_chat_user(&body.session, &body.chat_user);
            Ok(json_resp(StatusCode::OK, &verdict))
        }
        (&Method::POST, "/auto-reply-sent") => {
            let body: ChatUserBody = read_json(req).await?;
            sentry.mark_auto_reply_sent(&body.session, &body.chat_user);
            Ok(json_resp(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::POST, "/connections/admit") => {
            let body: ConnectionBody = read_json(req).await?;
            match sentry.admit_connection(&body.addr, &body.connection_id) {
                Ok(()) => Ok(json_resp(
                    StatusCode::OK,
                    &serde_json::json!({"admitted": true}),
                )),
                Err(denial) => Ok(denial_resp(&denial)),
            }
        }
        (&Method::POST, "/connections/release") => {
            let body: ConnectionBody = read_json(req).await?;
            sentry.release_connection(&body.addr, &body.connection_id);
            Ok(json_resp(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::GET, "/stats") => Ok(json_resp(StatusCode::OK, &sentry.stats())),
        (&Method::GET, "/blacklist") => Ok(json_resp(StatusCode::OK, &sentry.blacklist_info())),
        (&Method::POST, "/blacklist") => {
            let body: BlacklistBody = read_json(req).await?;
            let duration = if body.permanent {
                None
            } else {
                match &body.duration {
                    Some(text) => Some(humantime::parse_duration(text).map_err(|err| {
                        err_resp(
                            StatusCode::BAD_REQUEST,
                            format!("Invalid duration '{text}': {err}"),
                        )
                    })?),
                    None => Some(sentry.default_blacklist_duration()),
                }
            };
            sentry.blacklist(&body.key, &body.reason, duration);
            Ok(json_resp(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::POST, "/limits/clear") => {
            warn!("Operator requested clearing of all rate limits");
            let cleared = sentry.clear_all_limits();
            Ok(json_resp(
                StatusCode::OK,
                &serde_json::json!({"cleared": cleared}),
            ))
        }
        _ => {
            if method == Method::DELETE {
                if let Some(key) = path.strip_prefix("/blacklist/") {
                    let removed = sentry.unblacklist(key);
                    return Ok(json_resp(
                        StatusCode::OK,
                        &serde_json::json!({"removed": removed}),
                    ));
                }
                if let Some(key) = path.strip_prefix("/whitelist/") {
                    let removed = sentry.unwhitelist(key);
                    return Ok(json_resp(
                        StatusCode::OK,
                        &serde_json::json!({"removed": removed}),
                    ));
                }
            }
            if method == Method::POST {
                if let Some(key) = path.strip_prefix("/whitelist/") {
                    let added = sentry.whitelist(key);
                    return Ok(json_resp(
                        StatusCode::OK,
                        &serde_json::json!({"added": added}),
                    ));
                }
            }
            Ok(err_resp(
                StatusCode::NOT_FOUND,
                format!("Not found '{method} {path}'"),
            ))
        }
    }
}

fn ok_resp() -> Response<String> {
    Response::new("OK".into())
}

fn err_resp(code: StatusCode, text: impl Into<String>) -> Response<String> {
    let mut resp = Response::new(text.into());
    *resp.status_mut() = code;
    resp
}

fn json_resp(status: StatusCode, value: &impl Serialize) -> Response<String> {
    let mut resp = Response::new(serde_json::to_string(value).unwrap());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// 200 with quota observability headers, or the mapped denial.
fn gate_resp(result: Result<Clearance, Denial>) -> Response<String> {
    match result {
        Ok(clearance) => {
            let mut resp = json_resp(
                StatusCode::OK,
                &serde_json::json!({
                    "allowed": true,
                    "remaining": clearance.remaining,
                    "resetsAt": clearance.resets_at_ms,
                }),
            );
            let headers = resp.headers_mut();
            headers.insert("x-ratelimit-remaining", HeaderValue::from(clearance.remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(clearance.resets_at_ms));
            resp
        }
        Err(denial) => denial_resp(&denial),
    }
}

fn broadcast_resp(result: Result<BroadcastClearance, Denial>) -> Response<String> {
    match result {
        Ok(clearance) => {
            let mut resp = json_resp(
                StatusCode::OK,
                &serde_json::json!({
                    "allowed": true,
                    "remaining": clearance.remaining,
                    "resetsAt": clearance.resets_at_ms,
                    "perMessageDelayMs": clearance.per_message_delay.as_millis() as u64,
                }),
            );
            let headers = resp.headers_mut();
            headers.insert("x-ratelimit-remaining", HeaderValue::from(clearance.remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(clearance.resets_at_ms));
            resp
        }
        Err(denial) => denial_resp(&denial),
    }
}

/// Map a denial to its HTTP status, stable code, and retry hint.
fn denial_resp(denial: &Denial) -> Response<String> {
    let status = match denial {
        Denial::Blacklisted { .. } => StatusCode::FORBIDDEN,
        Denial::RateLimited { .. }
        | Denial::BroadcastLimited { .. }
        | Denial::TooManyConnections { .. } => StatusCode::TOO_MANY_REQUESTS,
        Denial::TooManyRecipients { .. } => StatusCode::BAD_REQUEST,
    };

    let mut body = serde_json::json!({
        "allowed": false,
        "code": denial.code(),
        "message": denial.to_string(),
    });
    if let Some(secs) = denial.retry_after_secs() {
        body["retryAfter"] = secs.into();
    }

    let mut resp = json_resp(status, &body);
    if let Some(secs) = denial.retry_after_secs() {
        resp.headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    resp
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, Response<String>>
where
    T: serde::de::DeserializeOwned,
    B: Body + Send,
    B::Data: Buf + Send,
    B::Error: std::fmt::Display,
{
    let body_bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|err| {
            err_resp(
                StatusCode::BAD_REQUEST,
                format!("When reading body bytes: {err}"),
            )
        })?
        .to_bytes();

    serde_json::from_slice(&body_bytes).map_err(|err| {
        warn!("Could not parse json body: {err}");
        err_resp(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {err}"))
    })
}
