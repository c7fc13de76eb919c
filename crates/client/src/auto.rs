//! The auto transport: WebSocket first, with a one-shot permanent
//! downgrade to Ajax when the socket errors before it has ever opened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use chansock_protocol::Event;

use crate::ajax::AjaxChsk;
use crate::cb::CbFn;
use crate::state::{CloseReason, Shared};
use crate::ws::WsChsk;

/// WebSocket-preferring transport with the Ajax fallback.
pub struct AutoChsk {
    shared: Arc<Shared>,
    ws: Arc<WsChsk>,
    /// Set once, on downgrade. The Ajax delegate shares `shared`, so the
    /// switch is invisible to application code.
    ajax: Mutex<Option<Arc<AjaxChsk>>>,
    downgraded: AtomicBool,
    watcher_installed: AtomicBool,
}

impl AutoChsk {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        let ws = WsChsk::new(Arc::clone(&shared));
        Arc::new(Self {
            shared,
            ws,
            ajax: Mutex::new(None),
            downgraded: AtomicBool::new(false),
            watcher_installed: AtomicBool::new(false),
        })
    }

    fn ajax_delegate(&self) -> Option<Arc<AjaxChsk>> {
        self.ajax.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn connect(self: &Arc<Self>) {
        if let Some(ajax) = self.ajax_delegate() {
            ajax.connect();
            return;
        }
        self.ws.connect();
        if !self.watcher_installed.swap(true, Ordering::SeqCst) {
            self.spawn_downgrade_watcher();
        }
    }

    pub fn disconnect(&self) {
        match self.ajax_delegate() {
            Some(ajax) => ajax.disconnect(),
            None => self.ws.disconnect(),
        }
    }

    pub fn reconnect(self: &Arc<Self>) {
        match self.ajax_delegate() {
            Some(ajax) => ajax.reconnect(),
            None => self.ws.reconnect(),
        }
    }

    pub fn break_connection(self: &Arc<Self>) {
        match self.ajax_delegate() {
            Some(ajax) => ajax.break_connection(),
            None => self.ws.break_connection(),
        }
    }

    pub fn send(&self, event: Event, timeout: Option<Duration>, cb: Option<CbFn>) -> bool {
        match self.ajax_delegate() {
            Some(ajax) => ajax.send(event, timeout, cb),
            None => self.ws.send(event, timeout, cb),
        }
    }

    /// Watches state until either the WebSocket proves itself (first
    /// open) or errors while never having opened; the latter triggers
    /// the one-time downgrade.
    fn spawn_downgrade_watcher(self: &Arc<Self>) {
        let auto = Arc::clone(self);
        tokio::spawn(async move {
            let mut state_rx = auto.shared.subscribe_state();
            loop {
                let snapshot = state_rx.borrow_and_update().clone();
                if snapshot.ever_opened {
                    return; // WebSocket works; no downgrade ever
                }
                if snapshot.last_ws_error.is_some() {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }

            if auto.downgraded.swap(true, Ordering::SeqCst) {
                return;
            }
            info!("websocket failed before first open; downgrading to ajax");
            auto.ws.disconnect_with_reason(CloseReason::DowngradingWsToAjax);

            let ajax = AjaxChsk::new(Arc::clone(&auto.shared));
            if let Ok(mut guard) = auto.ajax.lock() {
                *guard = Some(Arc::clone(&ajax));
            }
            ajax.connect();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChskKind, ClientConfig};
    use crate::state::WsErrorInfo;
    use chansock_protocol::constants::epoch_ms;

    fn auto_chsk() -> Arc<AutoChsk> {
        let (shared, _recv_rx, _state_rx) = Shared::new(ClientConfig {
            kind: ChskKind::Auto,
            ..ClientConfig::default()
        });
        AutoChsk::new(shared)
    }

    #[tokio::test]
    async fn downgrade_fires_on_never_opened_ws_error() {
        let auto = auto_chsk();
        auto.spawn_downgrade_watcher();
        assert!(auto.ajax_delegate().is_none());

        auto.shared.update_state(|s| {
            s.last_ws_error = Some(WsErrorInfo {
                udt: epoch_ms(),
                error: "connection refused".into(),
            });
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(auto.downgraded.load(Ordering::SeqCst));
        assert!(auto.ajax_delegate().is_some());
        assert_eq!(auto.shared.state().kind, ChskKind::Ajax);
    }

    #[tokio::test]
    async fn no_downgrade_once_ws_has_opened() {
        let auto = auto_chsk();
        auto.spawn_downgrade_watcher();

        // WS opens first...
        auto.shared.receive_handshake("u1".into(), None);
        // ...then errors: the watcher must already have retired.
        auto.shared.update_state(|s| {
            s.last_ws_error = Some(WsErrorInfo {
                udt: epoch_ms(),
                error: "later failure".into(),
            });
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!auto.downgraded.load(Ordering::SeqCst));
        assert!(auto.ajax_delegate().is_none());
    }

    #[tokio::test]
    async fn downgrade_is_at_most_once() {
        let auto = auto_chsk();
        auto.spawn_downgrade_watcher();
        auto.spawn_downgrade_watcher(); // a second watcher must not double-downgrade

        auto.shared.update_state(|s| {
            s.last_ws_error = Some(WsErrorInfo {
                udt: epoch_ms(),
                error: "refused".into(),
            });
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let first = auto.ajax_delegate().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = auto.ajax_delegate().unwrap();
        assert!(Arc::ptr_eq(&first, &second), "delegate replaced");
    }
}
