//! Shared harness for the integration tests: a hosted root, app connection
//! helpers, probe channels, collaborator fakes and a protocol-level client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use fdc3::{
    get_agent, wire, AppDirectoryEntry, AppIdentifier, Context, DesktopAgent, DirectoryLoader,
    Error, FullyQualifiedAppIdentifier, GetAgentParams, IntentAppChoice, IntentResolver, Message,
    MessagePort, ResolveForContext, ResolveForIntent, Result, RootAgent, Window, FDC3_VERSION,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub const HOST_URL: &str = "https://workspace.example.com/";

pub async fn start_root() -> RootAgent {
    let host = Window::new(HOST_URL);
    RootAgent::builder(&host).build().await.unwrap()
}

pub async fn connect(root: &RootAgent, url: &str) -> DesktopAgent {
    let frame = root.window().child(url);
    get_agent(&frame, GetAgentParams::default()).await.unwrap()
}

pub fn contact() -> Context {
    Context::new(json!({"type": "fdc3.contact", "name": "Joe"})).unwrap()
}

pub fn instrument(ticker: &str) -> Context {
    Context::new(json!({"type": "fdc3.instrument", "id": {"ticker": ticker}})).unwrap()
}

// ---- probes ----

/// A handler that forwards everything it sees into a channel the test can
/// await.
pub fn probe<T: Send + 'static>() -> (UnboundedSender<T>, UnboundedReceiver<T>) {
    unbounded_channel()
}

pub async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a probe event")
        .expect("probe channel closed")
}

/// Asserts nothing arrives on the probe within a grace period.
pub async fn assert_silent<T>(rx: &mut UnboundedReceiver<T>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "expected no probe event");
}

// ---- collaborator fakes ----

pub struct StaticLoader(pub HashMap<String, Vec<AppDirectoryEntry>>);

#[async_trait]
impl DirectoryLoader for StaticLoader {
    async fn load(&self, url: &str) -> Result<Vec<AppDirectoryEntry>> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Agent("connection refused".into()))
    }
}

/// A resolver that deterministically picks the live candidate with the
/// lexicographically greatest app id, recording how many candidates it was
/// offered.
#[derive(Default)]
pub struct PickLastResolver {
    pub intent_calls: Mutex<Vec<usize>>,
}

fn pick_greatest(apps: &[fdc3::AppMetadata]) -> Result<FullyQualifiedAppIdentifier> {
    apps.iter()
        .filter(|app| app.instance_id.is_some())
        .max_by(|a, b| a.app_id.cmp(&b.app_id))
        .and_then(|app| {
            app.instance_id
                .as_ref()
                .map(|id| FullyQualifiedAppIdentifier::new(app.app_id.clone(), id.clone()))
        })
        .ok_or(Error::NoAppsFound)
}

#[async_trait]
impl IntentResolver for PickLastResolver {
    async fn resolve_app_for_intent(
        &self,
        request: ResolveForIntent,
    ) -> Result<FullyQualifiedAppIdentifier> {
        self.intent_calls
            .lock()
            .unwrap()
            .push(request.app_intent.apps.len());
        pick_greatest(&request.app_intent.apps)
    }

    async fn resolve_app_for_context(
        &self,
        request: ResolveForContext,
    ) -> Result<IntentAppChoice> {
        let app_intent = request.app_intents.first().ok_or(Error::NoAppsFound)?;
        Ok(IntentAppChoice {
            intent: app_intent.intent.name.clone(),
            app: pick_greatest(&app_intent.apps)?,
        })
    }
}

/// Launches directory apps as child frames of the hosting window and keeps
/// their agents alive.
pub struct FrameLauncher {
    pub host: Window,
    pub opened: Mutex<Vec<DesktopAgent>>,
}

impl FrameLauncher {
    pub fn new(host: Window) -> Self {
        Self {
            host,
            opened: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl fdc3::AppLauncher for FrameLauncher {
    async fn launch(&self, entry: &AppDirectoryEntry) -> Result<FullyQualifiedAppIdentifier> {
        let url = entry
            .details
            .url
            .clone()
            .ok_or_else(|| Error::Agent("ErrorOnLaunch".into()))?;
        let frame = self.host.child(&url);
        let agent = get_agent(&frame, GetAgentParams::default()).await?;
        let identity = agent.app_identifier().clone();
        self.opened.lock().unwrap().push(agent);
        Ok(identity)
    }
}

// ---- protocol-level client ----

/// An app that speaks the wire protocol by hand: real handshake, manual
/// requests, and heartbeat acknowledgements that can be switched off.
pub struct RawApp {
    pub identity: FullyQualifiedAppIdentifier,
    port: Arc<MessagePort>,
    pub inbound: UnboundedReceiver<Message>,
    alive: Arc<AtomicBool>,
}

impl RawApp {
    pub async fn connect(host: &Window, url: &str) -> RawApp {
        let frame = host.child(url);
        let mut inbox = frame.take_inbox().expect("frame inbox");

        let attempt = uuid::Uuid::new_v4().to_string();
        let mut hello = Message::event(
            wire::kinds::WCP1_HELLO,
            wire::Wcp1Hello {
                actual_url: url.to_string(),
                fdc3_version: FDC3_VERSION.to_string(),
            },
        )
        .unwrap();
        hello.meta.event_uuid = None;
        hello.meta.connection_attempt_uuid = Some(attempt.clone());
        host.post_message(hello, None, Some(&frame));

        let accepted = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let incoming = inbox.recv().await.expect("window inbox closed");
                if incoming.message.kind == wire::kinds::WCP1_ACCEPTED
                    && incoming.message.meta.connection_attempt_uuid.as_deref()
                        == Some(attempt.as_str())
                {
                    return incoming;
                }
            }
        })
        .await
        .expect("no acceptance");

        let payload: wire::Wcp1Accepted = accepted.message.payload_as().unwrap();
        let port = Arc::new(accepted.port.expect("acceptance must transfer a port"));
        let mut rx = port.start().expect("fresh port");

        let alive = Arc::new(AtomicBool::new(true));
        let (in_tx, inbound) = unbounded_channel();
        let identity = payload.app_identifier.clone();
        {
            let port = port.clone();
            let alive = alive.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if message.kind == wire::kinds::HEARTBEAT_EVENT {
                        if alive.load(Ordering::SeqCst) {
                            let ack = Message::request(
                                wire::kinds::HEARTBEAT_ACKNOWLEDGEMENT_REQUEST,
                                Some(AppIdentifier::from(identity.clone())),
                                wire::HeartbeatAcknowledgementRequest {
                                    heartbeat_event_uuid: message.event_uuid().to_string(),
                                },
                            )
                            .unwrap();
                            let _ = port.send(ack);
                        }
                        continue;
                    }
                    if in_tx.send(message).is_err() {
                        return;
                    }
                }
            });
        }

        RawApp {
            identity: payload.app_identifier,
            port,
            inbound,
            alive,
        }
    }

    pub fn send(&self, message: Message) {
        self.port.send(message).unwrap();
    }

    /// Sends a request and waits for its correlated response, skipping
    /// unrelated traffic.
    pub async fn request(
        &mut self,
        request_kind: &str,
        response_kind: &str,
        payload: Value,
    ) -> Message {
        let message = Message::request(
            request_kind,
            Some(AppIdentifier::from(self.identity.clone())),
            payload,
        )
        .unwrap();
        let uuid = message.request_uuid().to_string();
        self.send(message);
        self.next_matching(|m| m.kind == response_kind && m.request_uuid() == uuid)
            .await
    }

    pub async fn next_matching(&mut self, mut predicate: impl FnMut(&Message) -> bool) -> Message {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let message = self.inbound.recv().await.expect("connection closed");
                if predicate(&message) {
                    return message;
                }
            }
        })
        .await
        .expect("timed out waiting for a matching message")
    }

    /// Stops answering heartbeats; the root will conclude this app is gone.
    pub fn stop_acknowledging(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
