//! The send/buffer engine: per-user buffers with time-batched coalescing,
//! retrying fan-out over ephemeral disconnections, keep-alive pings, and
//! dispatch of incoming payloads onto the receive channel.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use chansock_protocol::constants::{jittered, FANOUT_BACKOFF_MS};
use chansock_protocol::event::{self, ids, ALL_USERS_WITHOUT_UID, NIL_UID};
use chansock_protocol::packer::{pack_payload, unpack_payload, Cb};
use chansock_protocol::Event;

use crate::adapter::ServerChannel;
use crate::config::{ConnRequest, ServerConfig};
use crate::error::ServerError;
use crate::event_msg::{ReplyFn, ServerEventMsg};
use crate::registry::{Expect, Registry, Transport};

/// How an Ajax POST completes, as decided by the envelope's cb slot.
pub(crate) enum AjaxPostReply {
    /// The client expects a reply: the handler awaits this receiver (or
    /// times out with the `chsk/timeout` sentinel).
    Expected(oneshot::Receiver<Value>),
    /// Fire-and-forget: the handler answers `chsk/dummy-cb-200` at once.
    NotExpected,
}

/// The channel-socket server: connection registry plus send engine.
///
/// Handlers in [`crate::http`] feed connections and payloads in; the
/// application consumes [`ServerEventMsg`]s from the receiver obtained
/// via [`ChskServer::take_receiver`] and pushes with [`ChskServer::send`].
pub struct ChskServer {
    pub(crate) cfg: ServerConfig,
    pub(crate) registry: Registry,
    recv_tx: mpsc::Sender<ServerEventMsg>,
    recv_rx: Mutex<Option<mpsc::Receiver<ServerEventMsg>>>,
    shutdown: CancellationToken,
}

impl ChskServer {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        let (recv_tx, recv_rx) = mpsc::channel(cfg.recv_buf);
        if cfg.csrf_token_fn.is_none() {
            warn!("no csrf-token-fn configured; CSRF checking is disabled");
        }
        Arc::new(Self {
            cfg,
            registry: Registry::new(),
            recv_tx,
            recv_rx: Mutex::new(Some(recv_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Takes the receive channel. Yields `Some` exactly once.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<ServerEventMsg>> {
        self.recv_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    /// The derived connected-uids view.
    pub fn connected_uids(&self) -> crate::registry::ConnectedUids {
        self.registry.connected_uids()
    }

    /// Stops background tasks (keep-alives, pending flushes keep running
    /// to completion but schedule nothing new).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Pushes an event to every connection of `uid`, over both
    /// transports. With `flush` the buffers drain immediately; otherwise
    /// the flush is scheduled so near-simultaneous sends coalesce into
    /// one wire payload per transport.
    pub fn send(self: &Arc<Self>, uid: &str, event: Event, flush: bool) -> Result<(), ServerError> {
        if uid.is_empty() {
            return Err(ServerError::NilUid);
        }
        let uid = if uid == ALL_USERS_WITHOUT_UID { NIL_UID } else { uid };

        // Administrative close-all, not a deliverable event.
        if event.id == ids::CLOSE {
            let server = Arc::clone(self);
            let uid = uid.to_owned();
            tokio::spawn(async move { server.close_all_conns(&uid, flush).await });
            return Ok(());
        }

        let ev_uuid = Uuid::new_v4();
        for transport in [Transport::Ws, Transport::Ajax] {
            self.registry.buffer_append(transport, uid, event.clone(), ev_uuid);
            let server = Arc::clone(self);
            let uid = uid.to_owned();
            let delay = (!flush).then(|| self.cfg.send_buf(transport));
            tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                server.flush_buffer(transport, &uid, ev_uuid).await;
            });
        }
        Ok(())
    }

    /// Closes every connection of a uid, optionally flushing buffered
    /// events first. Internal administrative operation.
    pub async fn close_all_conns(self: &Arc<Self>, uid: &str, flush_first: bool) {
        if flush_first {
            for transport in [Transport::Ws, Transport::Ajax] {
                if let Some(events) = self.registry.buffer_take_all(transport, uid) {
                    self.fanout_events(transport, uid, &events).await;
                }
            }
        }
        let schs = self.registry.all_schs_for(uid);
        debug!(uid, count = schs.len(), "closing all connections");
        for sch in schs {
            sch.close();
        }
    }

    /// Drains the uid's buffer iff this send's ev-uuid is still pending,
    /// then fans the batch out. A drained uuid means an earlier flush
    /// already carried this event: coalescing worked, nothing to do.
    async fn flush_buffer(self: &Arc<Self>, transport: Transport, uid: &str, ev_uuid: Uuid) {
        let Some(events) = self.registry.buffer_take_if(transport, uid, ev_uuid) else {
            return;
        };
        self.fanout_events(transport, uid, &events).await;
    }

    async fn fanout_events(self: &Arc<Self>, transport: Transport, uid: &str, events: &[Event]) {
        let batch = Value::Array(events.iter().map(Event::to_value).collect());
        let packed = match pack_payload(self.cfg.packer.as_ref(), &batch, &Cb::None) {
            Ok(p) => p,
            Err(e) => {
                warn!(uid, error = %e, "failed to pack batch; dropping");
                return;
            }
        };
        self.fanout(transport, uid, &packed, events.len()).await;
    }

    /// Delivers one packed batch to every `(cid, sch)` under
    /// `(transport, uid)`, retrying unsatisfied clients over the jittered
    /// backoff schedule. Clients still unreachable at the end lose the
    /// batch: buffering absorbs reconnects, it is not a durable queue.
    async fn fanout(
        self: &Arc<Self>,
        transport: Transport,
        uid: &str,
        packed: &str,
        batch_len: usize,
    ) {
        let mut satisfied: std::collections::HashSet<String> = Default::default();
        let mut backoff = FANOUT_BACKOFF_MS.iter();

        loop {
            let conns = self.registry.conns_for(transport, uid);
            if conns.is_empty() {
                return;
            }

            let mut unsatisfied = 0usize;
            for (cid, sch) in &conns {
                if satisfied.contains(cid) {
                    continue;
                }
                match sch {
                    Some(sch) => {
                        if sch.send(packed) {
                            trace!(uid, cid, transport = transport.as_str(), batch_len, "batch sent");
                            if transport == Transport::Ajax {
                                // The long-poll response is committed; a
                                // repoll will bring a fresh channel.
                                self.registry.clear_ajax_sch(uid, cid, sch);
                            }
                            satisfied.insert(cid.clone());
                        } else {
                            unsatisfied += 1;
                        }
                    }
                    // Mid-reconnect: entry exists but no channel yet.
                    None => unsatisfied += 1,
                }
            }

            if unsatisfied == 0 {
                return;
            }
            let Some(&ms) = backoff.next() else {
                warn!(
                    uid,
                    transport = transport.as_str(),
                    unsatisfied,
                    batch_len,
                    "giving up on undeliverable batch"
                );
                return;
            };
            tokio::time::sleep(jittered(std::time::Duration::from_millis(ms))).await;
        }
    }

    /// Sends the `[chsk/handshake, [uid, nil, handshake-data]]` frame on
    /// a freshly attached channel.
    pub(crate) fn send_handshake(
        &self,
        sch: &Arc<dyn ServerChannel>,
        uid: &str,
        req: &ConnRequest,
    ) -> bool {
        let data = self.cfg.handshake_data_fn.as_ref().and_then(|f| f(req));
        let ev = event::handshake_event(uid, data.as_ref());
        match pack_payload(self.cfg.packer.as_ref(), &ev.to_value(), &Cb::None) {
            Ok(packed) => sch.send(&packed),
            Err(e) => {
                warn!(uid, error = %e, "failed to pack handshake");
                false
            }
        }
    }

    /// Handles one text frame from a WebSocket connection: touch, unpack,
    /// auto-pong pings that carry a cb, and deliver everything else.
    pub(crate) fn dispatch_ws_message(
        self: &Arc<Self>,
        uid: &str,
        cid: &str,
        sch: &Arc<dyn ServerChannel>,
        text: &str,
    ) {
        self.registry.touch(Transport::Ws, uid, cid);

        let unpacked = unpack_payload(self.cfg.packer.as_ref(), text);
        let event = Event::from_value_or_bad(unpacked.value);

        if event.id == ids::WS_PING {
            if let Cb::Uuid(cb_uuid) = &unpacked.cb {
                trace!(uid, cid, "ws-ping; replying pong");
                let cb = Cb::Uuid(cb_uuid.clone());
                match pack_payload(self.cfg.packer.as_ref(), &json!("pong"), &cb) {
                    Ok(packed) => {
                        sch.send(&packed);
                    }
                    Err(e) => warn!(error = %e, "failed to pack pong"),
                }
                return;
            }
        }

        let reply = match unpacked.cb {
            Cb::Uuid(cb_uuid) => Some(ReplyFn::ws(
                Arc::clone(sch),
                cb_uuid,
                Arc::clone(&self.cfg.packer),
            )),
            Cb::Ajax => {
                warn!(uid, cid, "ajax cb sentinel on a websocket payload; dropping cb");
                None
            }
            Cb::None => None,
        };
        self.enqueue(ServerEventMsg {
            client_id: cid.to_owned(),
            uid: uid.to_owned(),
            event,
            reply,
        });
    }

    /// Handles the body of an Ajax POST: unpack the single event, deliver
    /// it, and tell the HTTP handler how its response completes.
    pub(crate) fn dispatch_ajax_post(
        self: &Arc<Self>,
        uid: &str,
        cid: &str,
        ppstr: &str,
    ) -> AjaxPostReply {
        let unpacked = unpack_payload(self.cfg.packer.as_ref(), ppstr);
        let event = Event::from_value_or_bad(unpacked.value);

        let (reply, outcome) = if unpacked.cb.is_some() {
            let (tx, rx) = oneshot::channel();
            (
                Some(ReplyFn::ajax(tx, Arc::clone(&self.cfg.packer))),
                AjaxPostReply::Expected(rx),
            )
        } else {
            (None, AjaxPostReply::NotExpected)
        };

        self.enqueue(ServerEventMsg {
            client_id: cid.to_owned(),
            uid: uid.to_owned(),
            event,
            reply,
        });
        outcome
    }

    /// Synthesizes a `chsk/uidport-*` event onto the receive channel.
    pub(crate) fn enqueue_uidport(&self, id: &'static str, uid: &str, cid: &str) {
        self.enqueue(ServerEventMsg {
            client_id: cid.to_owned(),
            uid: uid.to_owned(),
            event: Event::control(id, Some(Value::String(uid.to_owned()))),
            reply: None,
        });
    }

    pub(crate) fn enqueue(&self, msg: ServerEventMsg) {
        if let Err(e) = self.recv_tx.try_send(msg) {
            warn!(error = %e, "receive channel unavailable; dropping event");
        }
    }

    /// Marks a closed connection channel-less and arms the grace reap.
    /// If the reap fires against an unchanged snapshot and removes the
    /// uid's last entry, a `chsk/uidport-close` is synthesized.
    pub(crate) fn schedule_grace_close(
        self: &Arc<Self>,
        transport: Transport,
        uid: &str,
        cid: &str,
        sch: Arc<dyn ServerChannel>,
    ) {
        let out = self
            .registry
            .attach(transport, uid, cid, Expect::Channel(Some(sch)), None);
        let udt = if out.attached {
            out.udt
        } else {
            match self.registry.snapshot(transport, uid, cid) {
                // Already channel-less (an Ajax send cleared it); grace
                // still runs against the current udt.
                Some(snap) if snap.sch.is_none() => snap.udt,
                // A newer connection owns the slot.
                _ => return,
            }
        };

        let server = Arc::clone(self);
        let grace = self.cfg.reconnect_grace(transport);
        let uid = uid.to_owned();
        let cid = cid.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let reaped = server.registry.reap(transport, &uid, &cid, None, udt);
            if reaped.removed {
                debug!(uid, cid, transport = transport.as_str(), "connection reaped");
            }
            if reaped.uidport_close {
                server.enqueue_uidport(ids::UIDPORT_CLOSE, &uid, &cid);
            }
        });
    }

    /// Per-connection WebSocket keep-alive: after `ws_kalive` with an
    /// unchanged udt, sends `[chsk/ws-ping]`. A broken pipe surfaces via
    /// the socket's close path; the loop exits once the registry no
    /// longer holds this channel.
    pub(crate) fn spawn_ws_kalive(
        self: &Arc<Self>,
        uid: &str,
        cid: &str,
        sch: Arc<dyn ServerChannel>,
    ) {
        let server = Arc::clone(self);
        let uid = uid.to_owned();
        let cid = cid.to_owned();
        tokio::spawn(async move {
            let mut last_udt = match server.registry.snapshot(Transport::Ws, &uid, &cid) {
                Some(snap) => snap.udt,
                None => return,
            };
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(server.cfg.ws_kalive) => {}
                }
                match server.registry.snapshot(Transport::Ws, &uid, &cid) {
                    Some(snap) if snap.same_channel(&Some(Arc::clone(&sch))) => {
                        if snap.udt == last_udt {
                            trace!(uid, cid, "idle connection; sending ws-ping");
                            let ping = Event::control(ids::WS_PING, None);
                            let packed = match pack_payload(
                                server.cfg.packer.as_ref(),
                                &ping.to_value(),
                                &Cb::None,
                            ) {
                                Ok(p) => p,
                                Err(_) => return,
                            };
                            if !sch.send(&packed) {
                                return;
                            }
                        } else {
                            last_udt = snap.udt;
                        }
                    }
                    // Superseded or reaped.
                    _ => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AjaxServerChannel, WsServerChannel};
    use chansock_protocol::packer::{unpack_payload, JsonPacker, Unpacked};

    fn ws_pair() -> (Arc<dyn ServerChannel>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sch: Arc<dyn ServerChannel> =
            Arc::new(WsServerChannel::new(tx, CancellationToken::new()));
        (sch, rx)
    }

    fn attach_ws(server: &Arc<ChskServer>, uid: &str, cid: &str) -> mpsc::UnboundedReceiver<String> {
        let (sch, rx) = ws_pair();
        server
            .registry
            .attach(Transport::Ws, uid, cid, Expect::Any, Some(sch));
        rx
    }

    fn unpack_batch(packed: &str) -> Vec<Event> {
        let Unpacked { value, cb } = unpack_payload(&JsonPacker, packed);
        assert_eq!(cb, Cb::None);
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| Event::from_value(v).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn send_rejects_empty_uid() {
        let server = ChskServer::new(ServerConfig::default());
        let ev = Event::new("my/a", None).unwrap();
        assert!(matches!(server.send("", ev, true), Err(ServerError::NilUid)));
    }

    #[tokio::test]
    async fn nil_uid_alias_is_rewritten() {
        let server = ChskServer::new(ServerConfig::default());
        let mut rx = attach_ws(&server, NIL_UID, "c1");

        let ev = Event::new("my/a", None).unwrap();
        server.send(ALL_USERS_WITHOUT_UID, ev.clone(), true).unwrap();

        let packed = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unpack_batch(&packed), vec![ev]);
    }

    #[tokio::test]
    async fn near_simultaneous_sends_coalesce_into_one_batch() {
        let server = ChskServer::new(ServerConfig::default());
        let mut rx = attach_ws(&server, "u1", "c1");

        let a = Event::new("my/a", None).unwrap();
        let b = Event::new("my/b", Some(json!(2))).unwrap();
        server.send("u1", a.clone(), false).unwrap();
        server.send("u1", b.clone(), false).unwrap();

        let packed = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unpack_batch(&packed), vec![a, b], "one FIFO batch");

        // The second send's scheduled flush coalesced away.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "no second wire payload");
    }

    #[tokio::test]
    async fn fanout_retries_until_reconnect() {
        let server = ChskServer::new(ServerConfig::default());

        // Entry exists but the client is mid-reconnect: no channel.
        server
            .registry
            .attach(Transport::Ws, "u1", "c1", Expect::Any, None);

        let ev = Event::new("my/x", None).unwrap();
        server.send("u1", ev.clone(), true).unwrap();

        // Reattach while the fanout is backing off.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut rx = attach_ws(&server, "u1", "c1");

        let packed = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("fanout should retry onto the new channel")
            .unwrap();
        assert_eq!(unpack_batch(&packed), vec![ev]);
    }

    #[tokio::test]
    async fn ajax_fanout_clears_channel_after_send() {
        let server = ChskServer::new(ServerConfig::default());
        let (ajax, rx) = AjaxServerChannel::new();
        let ajax: Arc<dyn ServerChannel> = Arc::new(ajax);
        server
            .registry
            .attach(Transport::Ajax, "u1", "c1", Expect::Any, Some(Arc::clone(&ajax)));

        let ev = Event::new("my/x", None).unwrap();
        server.send("u1", ev, true).unwrap();

        let body = tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!body.is_empty());

        let snap = server.registry.snapshot(Transport::Ajax, "u1", "c1").unwrap();
        assert!(snap.sch.is_none(), "entry awaits the repoll");
    }

    #[tokio::test]
    async fn ws_ping_with_cb_gets_pong_without_app_dispatch() {
        let server = ChskServer::new(ServerConfig::default());
        let mut recv = server.take_receiver().unwrap();
        let (sch, mut rx) = ws_pair();
        server
            .registry
            .attach(Transport::Ws, "u1", "c1", Expect::Any, Some(Arc::clone(&sch)));

        let ping = pack_payload(
            &JsonPacker,
            &json!(["chsk/ws-ping"]),
            &Cb::Uuid("k1p2q3".into()),
        )
        .unwrap();
        server.dispatch_ws_message("u1", "c1", &sch, &ping);

        let packed = rx.recv().await.unwrap();
        let out = unpack_payload(&JsonPacker, &packed);
        assert_eq!(out.value, json!("pong"));
        assert_eq!(out.cb, Cb::Uuid("k1p2q3".into()));
        assert!(recv.try_recv().is_err(), "ping is transport-internal");
    }

    #[tokio::test]
    async fn bad_payload_is_delivered_as_bad_package_event() {
        let server = ChskServer::new(ServerConfig::default());
        let mut recv = server.take_receiver().unwrap();
        let (sch, _rx) = ws_pair();

        server.dispatch_ws_message("u1", "c1", &sch, "garbage {{{");
        let msg = recv.recv().await.unwrap();
        assert_eq!(msg.event.id, ids::BAD_PACKAGE);
        assert!(msg.reply.is_none());
    }

    #[tokio::test]
    async fn ws_message_with_cb_carries_single_shot_reply() {
        let server = ChskServer::new(ServerConfig::default());
        let mut recv = server.take_receiver().unwrap();
        let (sch, mut rx) = ws_pair();

        let ppstr = pack_payload(
            &JsonPacker,
            &json!(["my/echo", 42]),
            &Cb::Uuid("e1f2g3".into()),
        )
        .unwrap();
        server.dispatch_ws_message("u1", "c1", &sch, &ppstr);

        let msg = recv.recv().await.unwrap();
        assert_eq!(msg.event.id, "my/echo");
        let reply = msg.reply.unwrap();
        assert!(reply.reply(json!(42)));
        assert!(!reply.reply(json!(43)), "second reply suppressed");

        let packed = rx.recv().await.unwrap();
        let out = unpack_payload(&JsonPacker, &packed);
        assert_eq!(out.value, json!(42));
        assert_eq!(out.cb, Cb::Uuid("e1f2g3".into()));
    }

    #[tokio::test]
    async fn grace_close_reaps_and_emits_uidport_close() {
        let mut cfg = ServerConfig::default();
        cfg.reconnect_grace_ws = std::time::Duration::from_millis(20);
        let server = ChskServer::new(cfg);
        let mut recv = server.take_receiver().unwrap();

        let (sch, _rx) = ws_pair();
        server
            .registry
            .attach(Transport::Ws, "u1", "c1", Expect::Any, Some(Arc::clone(&sch)));
        server.schedule_grace_close(Transport::Ws, "u1", "c1", sch);

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), recv.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.event.id, ids::UIDPORT_CLOSE);
        assert_eq!(msg.event.data, Some(json!("u1")));
        assert!(server.connected_uids().any.is_empty());
    }

    #[tokio::test]
    async fn reconnect_within_grace_suppresses_uidport_close() {
        let mut cfg = ServerConfig::default();
        cfg.reconnect_grace_ws = std::time::Duration::from_millis(40);
        let server = ChskServer::new(cfg);
        let mut recv = server.take_receiver().unwrap();

        let (sch, _rx) = ws_pair();
        server
            .registry
            .attach(Transport::Ws, "u1", "c1", Expect::Any, Some(Arc::clone(&sch)));
        server.schedule_grace_close(Transport::Ws, "u1", "c1", sch);

        // Reconnect before the grace deadline.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let _rx2 = attach_ws(&server, "u1", "c1");

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(recv.try_recv().is_err(), "no uidport-close during grace reconnect");
        assert!(server.connected_uids().any.contains("u1"));
    }

    #[tokio::test]
    async fn close_all_conns_flushes_then_closes() {
        let server = ChskServer::new(ServerConfig::default());
        let (sch, mut rx) = ws_pair();
        server
            .registry
            .attach(Transport::Ws, "u1", "c1", Expect::Any, Some(sch));

        let ev = Event::new("my/bye", None).unwrap();
        // Buffer without flushing, then close with flush-first.
        server.registry.buffer_append(Transport::Ws, "u1", ev.clone(), Uuid::new_v4());
        server.close_all_conns("u1", true).await;

        let packed = rx.recv().await.unwrap();
        assert_eq!(unpack_batch(&packed), vec![ev]);
        // Channel is now closed.
        let snap = server.registry.snapshot(Transport::Ws, "u1", "c1").unwrap();
        assert!(!snap.sch.unwrap().send("late"));
    }
}
