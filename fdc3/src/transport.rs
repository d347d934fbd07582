//! In-process transport: duplex message ports and the window tree the
//! connection handshake travels over.
//!
//! The browser counterparts are `MessagePort` pairs and
//! `window.postMessage`; both are modeled here as unbounded in-process
//! channels so the wire protocol stays byte-identical while the engine runs
//! as an ordinary library. Within one port, delivery order is send order.

use std::sync::{Arc, Mutex as SyncMutex};

use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    Notify,
};

use crate::{agent::DesktopAgent, connect::AgentPromise, message::Message, Error, Result};

/// One end of a duplex message channel.
///
/// Mirrors a transferred `MessagePort`: the receiving half is claimed exactly
/// once via [`MessagePort::start`], after which the claimer owns inbound
/// traffic while any number of cloned senders may feed the peer.
#[derive(Debug)]
pub struct MessagePort {
    tx: UnboundedSender<Message>,
    rx: SyncMutex<Option<UnboundedReceiver<Message>>>,
}

impl MessagePort {
    /// Creates a connected pair of ports.
    pub fn pair() -> (MessagePort, MessagePort) {
        let (a_tx, a_rx) = unbounded_channel();
        let (b_tx, b_rx) = unbounded_channel();
        (
            MessagePort {
                tx: a_tx,
                rx: SyncMutex::new(Some(b_rx)),
            },
            MessagePort {
                tx: b_tx,
                rx: SyncMutex::new(Some(a_rx)),
            },
        )
    }

    /// Sends a message to the peer end.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::Disconnected)
    }

    /// Claims the inbound half of the port. Returns `None` if the port was
    /// already started.
    pub fn start(&self) -> Option<UnboundedReceiver<Message>> {
        self.rx.lock().expect("lock poisoned").take()
    }

    pub(crate) fn sender(&self) -> UnboundedSender<Message> {
        self.tx.clone()
    }
}

/// An envelope delivered to a window's inbox: the message, an optionally
/// transferred port, and the posting window.
#[derive(Debug)]
pub struct WindowMessage {
    pub message: Message,
    pub port: Option<MessagePort>,
    pub source: Option<Window>,
}

struct WindowInner {
    url: String,
    parent: Option<Window>,
    inbox_tx: UnboundedSender<WindowMessage>,
    inbox_rx: SyncMutex<Option<UnboundedReceiver<WindowMessage>>>,
    agent: SyncMutex<Option<DesktopAgent>>,
    agent_ready: Notify,
    pub(crate) agent_promise: SyncMutex<Option<AgentPromise>>,
}

/// A handle to one simulated browser window.
///
/// Windows form a tree; each window has an inbox for posted envelopes, and
/// may publish an agent handle (the `fdc3` global) which also fires the
/// `fdc3Ready` notification.
#[derive(Clone)]
pub struct Window {
    inner: Arc<WindowInner>,
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("url", &self.inner.url)
            .field("top", &self.inner.parent.is_none())
            .finish_non_exhaustive()
    }
}

impl Window {
    fn new_inner(url: &str, parent: Option<Window>) -> Self {
        let (inbox_tx, inbox_rx) = unbounded_channel();
        Self {
            inner: Arc::new(WindowInner {
                url: url.to_string(),
                parent,
                inbox_tx,
                inbox_rx: SyncMutex::new(Some(inbox_rx)),
                agent: SyncMutex::new(None),
                agent_ready: Notify::new(),
                agent_promise: SyncMutex::new(None),
            }),
        }
    }

    /// Creates a top-level window.
    pub fn new(url: &str) -> Self {
        Self::new_inner(url, None)
    }

    /// Creates a child frame of this window.
    pub fn child(&self, url: &str) -> Self {
        Self::new_inner(url, Some(self.clone()))
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn parent(&self) -> Option<Window> {
        self.inner.parent.clone()
    }

    /// Walks the enclosing windows, nearest first.
    pub fn ancestors(&self) -> Vec<Window> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(window) = current {
            current = window.parent();
            out.push(window);
        }
        out
    }

    /// Posts an envelope to this window's inbox. Lost without error if nobody
    /// listens, matching `postMessage` fire-and-forget semantics.
    pub fn post_message(
        &self,
        message: Message,
        port: Option<MessagePort>,
        source: Option<&Window>,
    ) {
        let _ = self.inner.inbox_tx.send(WindowMessage {
            message,
            port,
            source: source.cloned(),
        });
    }

    /// Claims this window's inbox. Returns `None` if already claimed.
    pub fn take_inbox(&self) -> Option<UnboundedReceiver<WindowMessage>> {
        self.inner.inbox_rx.lock().expect("lock poisoned").take()
    }

    /// Hands a claimed inbox back, so a later discovery attempt can listen
    /// again.
    pub(crate) fn restore_inbox(&self, inbox: UnboundedReceiver<WindowMessage>) {
        *self.inner.inbox_rx.lock().expect("lock poisoned") = Some(inbox);
    }

    /// Publishes an agent handle on this window and fires `fdc3Ready`.
    pub fn publish_agent(&self, agent: DesktopAgent) {
        *self.inner.agent.lock().expect("lock poisoned") = Some(agent);
        self.inner.agent_ready.notify_waiters();
    }

    /// The published agent handle, if any.
    pub fn agent(&self) -> Option<DesktopAgent> {
        self.inner.agent.lock().expect("lock poisoned").clone()
    }

    /// Resolves once an agent handle is published on this window.
    pub async fn agent_ready(&self) -> DesktopAgent {
        loop {
            let notified = self.inner.agent_ready.notified();
            if let Some(agent) = self.agent() {
                return agent;
            }
            notified.await;
        }
    }

    /// Drops the cached discovery promise so a later `get_agent` starts a
    /// fresh attempt.
    pub fn reset_agent_promise(&self) {
        self.inner
            .agent_promise
            .lock()
            .expect("lock poisoned")
            .take();
    }

    pub(crate) fn agent_promise(&self) -> &SyncMutex<Option<AgentPromise>> {
        &self.inner.agent_promise
    }
}
