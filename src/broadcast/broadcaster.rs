//! Batches broadcast requests for a short window and hands each batch to a
//! fresh [`BroadcastHandler`].

use crate::broadcast::handler::SHUTDOWN_TIMEOUT;
use crate::broadcast::{BroadcastHandler, BroadcastListener, BroadcastRequest, BroadcastResult, MessageBroadcaster};
use crate::network::message::BroadcastMessage;
use crate::network::node::NetworkNode;
use crate::network::node_address::NodeAddress;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

pub struct Broadcaster {
    network_node: Arc<dyn NetworkNode>,
    pending: Mutex<Vec<BroadcastRequest>>,
    timer: Mutex<Option<CancellationToken>>,
    handlers: Mutex<HashMap<u64, Arc<BroadcastHandler>>>,
    next_handler_id: AtomicU64,
    shutdown_requested: AtomicBool,
    me: Weak<Broadcaster>,
}

impl Broadcaster {
    pub fn new(network_node: Arc<dyn NetworkNode>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            network_node,
            pending: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn active_handlers(&self) -> usize {
        self.handlers.lock().len()
    }

    fn arm_timer(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("⚠️ No runtime for broadcast timer; call flush() manually");
            return;
        };
        let token = CancellationToken::new();
        *timer = Some(token.clone());
        let me = self.me.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(BROADCAST_INTERVAL) => {
                    if let Some(broadcaster) = me.upgrade() {
                        broadcaster.flush();
                    }
                }
            }
        });
    }

    /// Sends whatever is queued now. Returns the handler task, if any.
    pub fn flush(&self) -> Option<JoinHandle<BroadcastResult>> {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        let requests = std::mem::take(&mut *self.pending.lock());
        if requests.is_empty() {
            return None;
        }

        let handler = Arc::new(BroadcastHandler::new(self.network_node.clone()));
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().insert(id, handler.clone());

        let shutdown_requested = self.shutdown_requested.load(Ordering::SeqCst);
        let me = self.me.clone();
        Some(tokio::spawn(async move {
            let result = handler.broadcast(requests, shutdown_requested).await;
            if let Some(broadcaster) = me.upgrade() {
                broadcaster.handlers.lock().remove(&id);
            }
            result
        }))
    }

    /// Pushes out the last batch with short delays, waits briefly for it,
    /// then cancels every handler still running.
    pub async fn shut_down(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        if let Some(last) = self.flush() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT * 2, last).await.is_err() {
                tracing::warn!("⚠️ Final broadcast did not finish in time");
            }
        }
        let handlers: Vec<Arc<BroadcastHandler>> = self.handlers.lock().drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.cancel();
        }
        tracing::info!("🛑 Broadcaster shut down");
    }
}

impl MessageBroadcaster for Broadcaster {
    fn broadcast(
        &self,
        message: BroadcastMessage,
        sender: Option<NodeAddress>,
        listener: Option<Arc<dyn BroadcastListener>>,
    ) {
        self.pending.lock().push(BroadcastRequest {
            message,
            sender,
            listener,
        });
        self.arm_timer();
    }
}
