//! Client-side router loop over the receive channel.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::state::ClientEventMsg;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

pub type EventMsgHandler = Arc<dyn Fn(ClientEventMsg) -> HandlerFuture + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&BoxError, &ClientEventMsg) + Send + Sync>;

#[derive(Default)]
pub struct RouterOptions {
    pub error_handler: Option<ErrorHandler>,
    /// Run each handler on its own task so a blocking handler does not
    /// starve the consumer.
    pub spawn_handlers: bool,
}

/// Handle to a running router.
pub struct RouterHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl RouterHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Starts the router loop; exits on channel close or [`RouterHandle::stop`].
pub fn start_router(
    mut rx: mpsc::Receiver<ClientEventMsg>,
    handler: EventMsgHandler,
    opts: RouterOptions,
) -> RouterHandle {
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if opts.spawn_handlers {
                                let handler = Arc::clone(&handler);
                                let error_handler = opts.error_handler.clone();
                                tokio::spawn(async move {
                                    invoke(&handler, error_handler.as_ref(), msg).await;
                                });
                            } else {
                                invoke(&handler, opts.error_handler.as_ref(), msg).await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });
    RouterHandle { cancel, task }
}

async fn invoke(
    handler: &EventMsgHandler,
    error_handler: Option<&ErrorHandler>,
    msg: ClientEventMsg,
) {
    match AssertUnwindSafe(handler(msg.clone())).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => report(error_handler, &e, &msg),
        Err(_) => {
            let e: BoxError = "event-msg handler panicked".into();
            report(error_handler, &e, &msg);
        }
    }
}

fn report(error_handler: Option<&ErrorHandler>, e: &BoxError, msg: &ClientEventMsg) {
    match error_handler {
        Some(eh) => {
            if std::panic::catch_unwind(AssertUnwindSafe(|| eh(e, msg))).is_err() {
                error!(event = %msg.event.id, "error handler panicked");
            }
        }
        None => error!(event = %msg.event.id, error = %e, "event-msg handler failed"),
    }
}
