//! Named broadcast bus that lets several session managers converge on one
//! identifier.
//!
//! Opening the same channel name twice in a process yields handles onto the
//! same underlying [`tokio::sync::broadcast`] channel. Delivery is
//! fire-and-forget: no acknowledgement, and a listener that falls too far
//! behind loses the oldest messages (it only needs the latest one).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::model::BusMessage;

/// Channel name used when none is configured.
pub const DEFAULT_CHANNEL: &str = "docchat-session";

const CHANNEL_CAPACITY: usize = 64;

static CHANNELS: LazyLock<Mutex<HashMap<String, SessionBus>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

/// A message plus the listener that sent it, so senders can skip their own
/// publications.
#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    message: BusMessage,
}

/// Handle onto a named broadcast channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionBus {
    name: Arc<str>,
    tx: broadcast::Sender<Envelope>,
}

impl SessionBus {
    /// Open (or join) the process-wide channel called `name`.
    pub fn named(name: &str) -> Self {
        let mut channels = CHANNELS.lock().unwrap_or_else(|p| p.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| Self::detached(name))
            .clone()
    }

    /// A channel not registered under its name; only clones can reach it.
    pub fn detached(name: &str) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start listening. Only messages published after this call are seen.
    pub fn subscribe(&self) -> BusListener {
        BusListener {
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
            channel: self.name.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Publish on behalf of `listener`. Returns the number of subscribed
    /// listeners, the sender's own included.
    pub fn publish(&self, listener: &BusListener, message: BusMessage) -> usize {
        let envelope = Envelope {
            origin: listener.origin,
            message,
        };
        match self.tx.send(envelope) {
            Ok(receivers) => {
                debug!(channel = %self.name, receivers, "published session update");
                receivers
            }
            Err(_) => {
                trace!(channel = %self.name, "no listeners for session update");
                0
            }
        }
    }
}

/// Receiving end owned by one session manager.
#[derive(Debug)]
pub struct BusListener {
    origin: u64,
    channel: Arc<str>,
    rx: broadcast::Receiver<Envelope>,
}

impl BusListener {
    /// Collect every message other listeners published since the last call.
    pub fn drain(&mut self) -> Vec<BusMessage> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.origin == self.origin => {}
                Ok(envelope) => out.push(envelope.message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "session bus listener lagged");
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }
        out
    }
}
