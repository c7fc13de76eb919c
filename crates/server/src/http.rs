//! axum entry points: the shared GET endpoint (WebSocket handshake or
//! Ajax long-poll) and the Ajax POST endpoint, with CSRF / origin /
//! authorization preflight.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chansock_protocol::event::{ids, NIL_UID};
use chansock_protocol::packer::{pack_payload, Cb};

use crate::adapter::{AjaxServerChannel, ServerChannel, WsServerChannel};
use crate::config::{AllowedOrigins, ConnRequest, ServerConfig};
use crate::engine::{AjaxPostReply, ChskServer};
use crate::registry::{Expect, Transport};

/// Builds a router exposing the channel-socket endpoints at `path`.
pub fn router(path: &str, server: Arc<ChskServer>) -> axum::Router {
    axum::Router::new()
        .route(path, axum::routing::get(chsk_get).post(chsk_post))
        .with_state(server)
}

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

fn conn_request(params: &HashMap<String, String>, headers: &HeaderMap) -> ConnRequest {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    ConnRequest {
        params: params.clone(),
        headers,
    }
}

/// Origin / CSRF / authorization checks shared by both entry points.
/// `Err` carries the 4xx rejection; no registry state is touched.
pub(crate) fn preflight(cfg: &ServerConfig, req: &ConnRequest) -> Result<(), (StatusCode, String)> {
    if let AllowedOrigins::Only(allowed) = &cfg.allowed_origins {
        let ok = match req.header("origin") {
            Some(origin) => allowed.contains(origin),
            // No Origin header: fall back to a Referer prefix match.
            None => req.header("referer").is_some_and(|referer| {
                allowed.iter().any(|o| referer.starts_with(&format!("{o}/")))
            }),
        };
        if !ok {
            debug!(origin = ?req.header("origin"), "origin rejected");
            return Err((StatusCode::FORBIDDEN, "origin not allowed".into()));
        }
    }

    if let Some(csrf_token_fn) = &cfg.csrf_token_fn {
        let reference = csrf_token_fn(req)
            .ok_or((StatusCode::FORBIDDEN, "no csrf token for request".into()))?;
        let given = req
            .param("csrf-token")
            .or_else(|| req.header("x-csrf-token"))
            .or_else(|| req.header("x-xsrf-token"))
            .ok_or((StatusCode::FORBIDDEN, "csrf token missing".into()))?;
        if !constant_time_eq(&reference, given) {
            return Err((StatusCode::FORBIDDEN, "csrf token mismatch".into()));
        }
    }

    if let Some(authorized_fn) = &cfg.authorized_fn {
        if !authorized_fn(req) {
            let (status, body) = match &cfg.unauthorized_fn {
                Some(f) => f(req),
                None => (401, "unauthorized".to_owned()),
            };
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED);
            return Err((status, body));
        }
    }

    Ok(())
}

fn resolve_uid(cfg: &ServerConfig, req: &ConnRequest) -> String {
    cfg.user_id_fn
        .as_ref()
        .and_then(|f| f(req))
        .unwrap_or_else(|| NIL_UID.to_owned())
}

fn pack_body(server: &ChskServer, value: &Value) -> String {
    match pack_payload(server.cfg.packer.as_ref(), value, &Cb::None) {
        Ok(packed) => packed,
        Err(e) => {
            warn!(error = %e, "failed to pack response body");
            String::new()
        }
    }
}

/// `GET <path>` — WebSocket upgrade, Ajax long-poll, or Ajax handshake.
pub async fn chsk_get(
    State(server): State<Arc<ChskServer>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let req = conn_request(&params, &headers);
    if let Err(rejection) = preflight(&server.cfg, &req) {
        return rejection.into_response();
    }
    let Some(cid) = req.param("client-id").filter(|c| !c.is_empty()).map(str::to_owned)
    else {
        return (
            StatusCode::BAD_REQUEST,
            "client-id param missing (param-wrapping middleware not configured?)",
        )
            .into_response();
    };
    let uid = resolve_uid(&server.cfg, &req);

    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| handle_ws_conn(server, socket, req, uid, cid))
            .into_response(),
        None => handle_lp_get(server, req, uid, cid).await.into_response(),
    }
}

/// One WebSocket connection: attach, handshake, keep-alive, then a
/// read/write loop until either side closes.
async fn handle_ws_conn(
    server: Arc<ChskServer>,
    socket: WebSocket,
    req: ConnRequest,
    uid: String,
    cid: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let cancel = CancellationToken::new();
    let sch: Arc<dyn ServerChannel> = Arc::new(WsServerChannel::new(out_tx, cancel.clone()));

    let outcome = server
        .registry
        .attach(Transport::Ws, &uid, &cid, Expect::Any, Some(Arc::clone(&sch)));
    if outcome.uidport_open {
        server.enqueue_uidport(ids::UIDPORT_OPEN, &uid, &cid);
    }
    server.send_handshake(&sch, &uid, &req);
    server.spawn_ws_kalive(&uid, &cid, Arc::clone(&sch));
    debug!(uid, cid, "websocket connection open");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            // Engine -> socket.
            out = out_rx.recv() => {
                match out {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Socket -> engine.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        server.dispatch_ws_message(&uid, &cid, &sch, &text);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        server.registry.touch(Transport::Ws, &uid, &cid);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(uid, cid, error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                }
            }
        }
    }

    debug!(uid, cid, "websocket connection closed");
    server.schedule_grace_close(Transport::Ws, &uid, &cid, sch);
}

/// One Ajax GET: either an immediate handshake reply, or an open
/// long-poll that resolves with a batch, the timeout sentinel, or (on an
/// administrative close) an empty body.
async fn handle_lp_get(
    server: Arc<ChskServer>,
    req: ConnRequest,
    uid: String,
    cid: String,
) -> String {
    let wants_handshake = matches!(
        req.param("handshake").or_else(|| req.param("handshake?")),
        Some("true" | "1")
    );
    let prior = server.registry.snapshot(Transport::Ajax, &uid, &cid).is_some();
    if wants_handshake || !prior {
        // The client repolls immediately after processing the handshake.
        let data = server.cfg.handshake_data_fn.as_ref().and_then(|f| f(&req));
        let hs = chansock_protocol::event::handshake_event(&uid, data.as_ref());
        debug!(uid, cid, "ajax handshake");
        return pack_body(&server, &hs.to_value());
    }

    let (ajax, mut rx) = AjaxServerChannel::new();
    let sch: Arc<dyn ServerChannel> = Arc::new(ajax);
    let outcome = server.registry.attach(
        Transport::Ajax,
        &uid,
        &cid,
        Expect::Any,
        Some(Arc::clone(&sch)),
    );
    if outcome.uidport_open {
        server.enqueue_uidport(ids::UIDPORT_OPEN, &uid, &cid);
    }
    let attach_udt = outcome.udt;

    let body = tokio::select! {
        res = &mut rx => res.unwrap_or_default(),
        _ = tokio::time::sleep(server.cfg.lp_timeout) => {
            // Timed `chsk/timeout` send, but only while this poll still
            // owns its slot unchanged.
            let still_current = server
                .registry
                .snapshot(Transport::Ajax, &uid, &cid)
                .is_some_and(|snap| {
                    snap.udt == attach_udt && snap.same_channel(&Some(Arc::clone(&sch)))
                });
            if still_current {
                let _ = sch.send(&pack_body(&server, &json!(ids::TIMEOUT)));
            }
            // Either our sentinel or a raced fan-out body.
            rx.try_recv().unwrap_or_default()
        }
    };

    server.schedule_grace_close(Transport::Ajax, &uid, &cid, sch);
    body
}

/// `POST <path>` — one packed client event, with the reply (if one is
/// expected) delivered as the response body.
pub async fn chsk_post(
    State(server): State<Arc<ChskServer>>,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let req = conn_request(&params, &headers);
    if let Err(rejection) = preflight(&server.cfg, &req) {
        return rejection.into_response();
    }
    let Some(cid) = req.param("client-id").filter(|c| !c.is_empty()).map(str::to_owned)
    else {
        return (
            StatusCode::BAD_REQUEST,
            "client-id param missing (param-wrapping middleware not configured?)",
        )
            .into_response();
    };
    let uid = resolve_uid(&server.cfg, &req);
    let Some(ppstr) = req.param("ppstr") else {
        return (StatusCode::BAD_REQUEST, "ppstr param missing").into_response();
    };

    match server.dispatch_ajax_post(&uid, &cid, ppstr) {
        AjaxPostReply::NotExpected => {
            pack_body(&server, &json!(chansock_protocol::event::cb_ids::DUMMY_CB_200))
                .into_response()
        }
        AjaxPostReply::Expected(mut rx) => {
            let body = tokio::select! {
                res = &mut rx => match res {
                    Ok(value) => pack_body(&server, &value),
                    Err(_) => pack_body(&server, &json!(ids::TIMEOUT)),
                },
                _ = tokio::time::sleep(server.cfg.lp_timeout) => {
                    pack_body(&server, &json!(ids::TIMEOUT))
                }
            };
            body.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_with(
        params: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> ConnRequest {
        ConnRequest {
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secrets"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn preflight_passes_with_defaults() {
        let cfg = ServerConfig::default();
        assert!(preflight(&cfg, &req_with(&[], &[])).is_ok());
    }

    #[test]
    fn csrf_missing_token_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.csrf_token_fn = Some(Arc::new(|_req| Some("tok-1".to_owned())));

        let err = preflight(&cfg, &req_with(&[], &[])).unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn csrf_accepts_param_and_header_aliases() {
        let mut cfg = ServerConfig::default();
        cfg.csrf_token_fn = Some(Arc::new(|_req| Some("tok-1".to_owned())));

        for req in [
            req_with(&[("csrf-token", "tok-1")], &[]),
            req_with(&[], &[("x-csrf-token", "tok-1")]),
            req_with(&[], &[("x-xsrf-token", "tok-1")]),
        ] {
            assert!(preflight(&cfg, &req).is_ok());
        }

        let err = preflight(&cfg, &req_with(&[("csrf-token", "wrong")], &[])).unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn origin_allow_list_checks_origin_then_referer() {
        let mut cfg = ServerConfig::default();
        cfg.allowed_origins = AllowedOrigins::Only(
            ["https://app.example.com".to_owned()].into_iter().collect(),
        );

        assert!(preflight(&cfg, &req_with(&[], &[("origin", "https://app.example.com")])).is_ok());
        assert!(preflight(&cfg, &req_with(&[], &[("origin", "https://evil.example.com")])).is_err());

        // No Origin: a Referer under an allowed origin passes.
        assert!(preflight(
            &cfg,
            &req_with(&[], &[("referer", "https://app.example.com/page")])
        )
        .is_ok());
        // Prefix must be origin + '/': a lookalike host fails.
        assert!(preflight(
            &cfg,
            &req_with(&[], &[("referer", "https://app.example.com.evil.io/page")])
        )
        .is_err());
        assert!(preflight(&cfg, &req_with(&[], &[])).is_err());
    }

    #[test]
    fn authorization_uses_custom_rejection() {
        let mut cfg = ServerConfig::default();
        cfg.authorized_fn = Some(Arc::new(|req| req.header("authorization").is_some()));
        cfg.unauthorized_fn = Some(Arc::new(|_req| (403, "go away".to_owned())));

        assert!(preflight(&cfg, &req_with(&[], &[("authorization", "Bearer t")])).is_ok());
        let err = preflight(&cfg, &req_with(&[], &[])).unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
        assert_eq!(err.1, "go away");
    }

    #[test]
    fn resolve_uid_falls_back_to_nil_uid() {
        let cfg = ServerConfig::default();
        assert_eq!(resolve_uid(&cfg, &req_with(&[], &[])), NIL_UID);

        let mut cfg = ServerConfig::default();
        cfg.user_id_fn = Some(Arc::new(|req| req.param("user").map(str::to_owned)));
        assert_eq!(resolve_uid(&cfg, &req_with(&[("user", "u9")], &[])), "u9");
        assert_eq!(resolve_uid(&cfg, &req_with(&[], &[])), NIL_UID);
    }
}
