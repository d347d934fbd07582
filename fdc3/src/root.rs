//! The root agent: the process-wide singleton owning every piece of
//! authoritative state, the connection accept loop, and the dispatcher that
//! turns inbound requests into engine calls, responses and derived events.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as SyncMutex, Weak},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    agent::DesktopAgent,
    channels::{ChannelEngine, Outbound},
    directory::{AppDirectory, ContextResolution, DirectoryLoader, TargetResolution},
    events::EventListenerRegistry,
    heartbeat::{HeartbeatConfig, LivenessTracker},
    message::Message,
    protocol::{self, kinds},
    resolver::{AppLauncher, IntentResolver, ResolveForContext, ResolveForIntent},
    transport::{MessagePort, Window, WindowMessage},
    types::{
        recommended_user_channels, AppIdentifier, AppMetadata, ChannelType, Context,
        FullyQualifiedAppIdentifier, ImplementationMetadata,
    },
    Error, Result,
};

#[derive(Debug)]
struct ConnectionRecord {
    identity: FullyQualifiedAppIdentifier,
    tx: UnboundedSender<Message>,
    liveness: LivenessTracker,
}

#[derive(Clone, Debug)]
struct IntentListenerRecord {
    listener_uuid: String,
    intent: String,
    instance_id: String,
}

#[derive(Clone, Debug)]
struct PendingRaise {
    raiser: String,
    handler: String,
    event_uuid: String,
}

#[derive(Default)]
struct IntentState {
    listeners: Vec<IntentListenerRecord>,
    /// raise request uuid -> in-flight raise awaiting its handler's result.
    pending_raises: BTreeMap<String, PendingRaise>,
}

#[derive(Default)]
struct RootState {
    connections: BTreeMap<String, ConnectionRecord>,
    channels: ChannelEngine,
    directory: AppDirectory,
    events: EventListenerRegistry,
    intents: IntentState,
    /// Contexts handed to `open`, waiting for the opened instance to add a
    /// matching context listener.
    pending_open: BTreeMap<String, Value>,
}

pub(crate) struct RootInner {
    state: SyncMutex<RootState>,
    resolver: Option<Arc<dyn IntentResolver>>,
    launcher: Option<Arc<dyn AppLauncher>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

/// Builder for a [`RootAgent`], in the spirit of a connection builder: the
/// window to host on, the collaborators, and tuning knobs.
pub struct RootAgentBuilder {
    window: Window,
    directory_urls: Vec<String>,
    loader: Option<Arc<dyn DirectoryLoader>>,
    resolver: Option<Arc<dyn IntentResolver>>,
    launcher: Option<Arc<dyn AppLauncher>>,
    heartbeat: HeartbeatConfig,
    request_timeout: Option<Duration>,
}

impl RootAgentBuilder {
    pub fn directory_url(mut self, url: impl Into<String>) -> Self {
        self.directory_urls.push(url.into());
        self
    }

    pub fn loader(mut self, loader: Arc<dyn DirectoryLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn IntentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn AppLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Timeout applied to requests made through the root's own agent handle.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Loads the directory, publishes the agent handle on the window, and
    /// starts the accept and heartbeat loops.
    pub async fn build(self) -> Result<RootAgent> {
        let directory = match &self.loader {
            Some(loader) => AppDirectory::load(&self.directory_urls, loader.as_ref()).await,
            None => {
                if !self.directory_urls.is_empty() {
                    warn!("directory urls configured without a loader, catalog stays empty");
                }
                AppDirectory::default()
            }
        };

        let inner = Arc::new(RootInner {
            state: SyncMutex::new(RootState {
                directory,
                ..RootState::default()
            }),
            resolver: self.resolver,
            launcher: self.launcher,
            tasks: SyncMutex::new(Vec::new()),
        });

        // The root's own page is an ordinary connected app, wired over an
        // internal loopback port so the facade it publishes speaks the exact
        // same protocol as any remote proxy.
        let identity = {
            let mut state = inner.state.lock().expect("lock poisoned");
            state.directory.register_new_instance(self.window.url())
        };
        let (root_half, proxy_half) = MessagePort::pair();
        attach_connection(&inner, identity.clone(), root_half);
        let agent = DesktopAgent::connect(identity, proxy_half, self.request_timeout)?;
        self.window.publish_agent(agent.clone());

        let inbox = self
            .window
            .take_inbox()
            .ok_or_else(|| Error::Protocol("root window inbox already claimed".into()))?;
        let accept = tokio::spawn(accept_loop(Arc::downgrade(&inner), inbox));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::downgrade(&inner), self.heartbeat));
        inner
            .tasks
            .lock()
            .expect("lock poisoned")
            .extend([accept, heartbeat]);

        Ok(RootAgent {
            inner,
            window: self.window,
            agent,
        })
    }
}

/// The authoritative desktop agent hosted by one page.
///
/// Dropping the handle stops the accept loop, the heartbeat and every
/// per-connection reader.
pub struct RootAgent {
    inner: Arc<RootInner>,
    window: Window,
    agent: DesktopAgent,
}

impl RootAgent {
    pub fn builder(window: &Window) -> RootAgentBuilder {
        RootAgentBuilder {
            window: window.clone(),
            directory_urls: Vec::new(),
            loader: None,
            resolver: None,
            launcher: None,
            heartbeat: HeartbeatConfig::default(),
            request_timeout: None,
        }
    }

    /// The agent handle for the root's own page, also published on the
    /// hosting window.
    pub fn agent(&self) -> DesktopAgent {
        self.agent.clone()
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl Drop for RootAgent {
    fn drop(&mut self) {
        for task in self.inner.tasks.lock().expect("lock poisoned").drain(..) {
            task.abort();
        }
    }
}

fn attach_connection(
    inner: &Arc<RootInner>,
    identity: FullyQualifiedAppIdentifier,
    port: MessagePort,
) {
    let Some(rx) = port.start() else {
        warn!("connection port already started, dropping connection");
        return;
    };
    {
        let mut state = inner.state.lock().expect("lock poisoned");
        state.connections.insert(
            identity.instance_id.clone(),
            ConnectionRecord {
                identity: identity.clone(),
                tx: port.sender(),
                liveness: LivenessTracker::default(),
            },
        );
    }
    let task = tokio::spawn(connection_loop(inner.clone(), identity, rx));
    inner.tasks.lock().expect("lock poisoned").push(task);
}

// ---- loops ----

async fn accept_loop(inner: Weak<RootInner>, mut inbox: UnboundedReceiver<WindowMessage>) {
    while let Some(incoming) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        if incoming.message.kind != kinds::WCP1_HELLO {
            debug!(kind = %incoming.message.kind, "ignoring non-hello window traffic");
            continue;
        }
        let Some(reply_to) = incoming.source else {
            warn!("hello without a source window, ignoring");
            continue;
        };
        let hello: protocol::Wcp1Hello = match incoming.message.payload_as() {
            Ok(hello) => hello,
            Err(error) => {
                warn!(%error, "malformed hello, ignoring");
                continue;
            }
        };

        let identity = {
            let mut state = inner.state.lock().expect("lock poisoned");
            state.directory.register_new_instance(&hello.actual_url)
        };
        info!(
            app_id = %identity.app_id,
            instance_id = %identity.instance_id,
            origin = %hello.actual_url,
            "accepted connection"
        );

        let (root_half, proxy_half) = MessagePort::pair();
        attach_connection(&inner, identity.clone(), root_half);

        let accepted = Message::event(
            kinds::WCP1_ACCEPTED,
            protocol::Wcp1Accepted {
                fdc3_version: protocol::FDC3_VERSION.to_string(),
                app_identifier: identity,
            },
        );
        match accepted {
            Ok(mut accepted) => {
                accepted.meta.event_uuid = None;
                accepted.meta.connection_attempt_uuid =
                    incoming.message.meta.connection_attempt_uuid.clone();
                reply_to.post_message(accepted, Some(proxy_half), None);
            }
            Err(error) => warn!(%error, "failed to build acceptance"),
        }
    }
}

async fn connection_loop(
    inner: Arc<RootInner>,
    identity: FullyQualifiedAppIdentifier,
    mut rx: UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let connected = inner
            .state
            .lock()
            .expect("lock poisoned")
            .connections
            .contains_key(&identity.instance_id);
        if !connected {
            break;
        }
        handle_message(&inner, &identity, message).await;
    }
    // The proxy dropped its end of the port; same cascade as a missed
    // heartbeat.
    cleanup_disconnected(&inner, &identity);
}

async fn heartbeat_loop(inner: Weak<RootInner>, config: HeartbeatConfig) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so freshly connected proxies
    // get a full interval before their first ping.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        let mut dead = Vec::new();
        let mut pings = Vec::new();
        {
            let mut state = inner.state.lock().expect("lock poisoned");
            for record in state.connections.values_mut() {
                if record.liveness.missed() >= config.max_missed {
                    dead.push(record.identity.clone());
                    continue;
                }
                if let Ok(ping) = Message::event(kinds::HEARTBEAT_EVENT, json!({})) {
                    record.liveness.record_ping(ping.event_uuid().to_string());
                    pings.push((record.tx.clone(), ping));
                }
            }
        }
        for (tx, ping) in pings {
            let _ = tx.send(ping);
        }
        for identity in dead {
            info!(instance_id = %identity.instance_id, "proxy missed heartbeats, disconnecting");
            cleanup_disconnected(&inner, &identity);
        }
    }
}

/// The cascade run for any vanished proxy: connection record first (so
/// nothing further reaches it), then channels, event listeners, intents and
/// the directory.
fn cleanup_disconnected(inner: &Arc<RootInner>, identity: &FullyQualifiedAppIdentifier) {
    let events = {
        let mut state = inner.state.lock().expect("lock poisoned");
        if state.connections.remove(&identity.instance_id).is_none() {
            return;
        }
        let events = state
            .channels
            .cleanup_instance(identity)
            .unwrap_or_default();
        state.events.remove_instance(&identity.instance_id);
        state
            .intents
            .listeners
            .retain(|l| l.instance_id != identity.instance_id);
        state.intents.pending_raises.retain(|_, raise| {
            raise.raiser != identity.instance_id && raise.handler != identity.instance_id
        });
        state.pending_open.remove(&identity.instance_id);
        state.directory.remove_instance(&identity.instance_id);
        events
    };
    deliver(inner, events);
    info!(instance_id = %identity.instance_id, "disconnected proxy cleaned up");
}

// ---- dispatch plumbing ----

fn send_to(inner: &RootInner, instance_id: &str, message: Message) {
    let tx = inner
        .state
        .lock()
        .expect("lock poisoned")
        .connections
        .get(instance_id)
        .map(|record| record.tx.clone());
    match tx {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => debug!(instance_id, kind = %message.kind, "dropping message to vanished instance"),
    }
}

fn deliver(inner: &RootInner, events: Vec<Outbound>) {
    for Outbound { target, message } in events {
        send_to(inner, &target, message);
    }
}

fn respond(
    inner: &RootInner,
    instance_id: &str,
    request: &Message,
    kind: &str,
    result: Result<Value>,
) {
    let message = match result {
        Ok(payload) => Message::response_to(request, kind, payload),
        Err(error) => Message::error_response_to(request, kind, &error),
    };
    match message {
        Ok(message) => send_to(inner, instance_id, message),
        Err(error) => warn!(%error, kind, "failed to build response"),
    }
}

/// Runs a synchronous engine operation under the state lock, then publishes
/// the response before any derived event.
fn sync_op<F>(
    inner: &RootInner,
    identity: &FullyQualifiedAppIdentifier,
    request: &Message,
    response_kind: &str,
    op: F,
) where
    F: FnOnce(&mut RootState, &FullyQualifiedAppIdentifier) -> Result<(Value, Vec<Outbound>)>,
{
    let outcome = {
        let mut state = inner.state.lock().expect("lock poisoned");
        op(&mut state, identity)
    };
    match outcome {
        Ok((payload, events)) => {
            respond(inner, &identity.instance_id, request, response_kind, Ok(payload));
            deliver(inner, events);
        }
        Err(error) => {
            respond(
                inner,
                &identity.instance_id,
                request,
                response_kind,
                Err(error),
            );
        }
    }
}

macro_rules! payload {
    ($inner:expr, $identity:expr, $msg:expr, $kind:expr) => {
        match $msg.payload_as() {
            Ok(payload) => payload,
            Err(error) => {
                respond($inner, &$identity.instance_id, &$msg, $kind, Err(error));
                return;
            }
        }
    };
}

async fn handle_message(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    message: Message,
) {
    if message.kind == kinds::HEARTBEAT_ACKNOWLEDGEMENT_REQUEST {
        handle_heartbeat_ack(inner, identity, &message);
        return;
    }
    if !message.is_request() || message.meta.request_uuid.is_none() {
        warn!(kind = %message.kind, "ignoring unroutable message");
        return;
    }
    dispatch_request(inner, identity, message).await;
}

fn handle_heartbeat_ack(
    inner: &RootInner,
    identity: &FullyQualifiedAppIdentifier,
    message: &Message,
) {
    let Ok(ack) = message.payload_as::<protocol::HeartbeatAcknowledgementRequest>() else {
        warn!("malformed heartbeat acknowledgement");
        return;
    };
    let mut state = inner.state.lock().expect("lock poisoned");
    if let Some(record) = state.connections.get_mut(&identity.instance_id) {
        if !record.liveness.acknowledge(&ack.heartbeat_event_uuid) {
            debug!(instance_id = %identity.instance_id, "stale heartbeat acknowledgement");
        }
    }
}

async fn dispatch_request(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    msg: Message,
) {
    match msg.kind.as_str() {
        // ---- channels ----
        kinds::GET_USER_CHANNELS_REQUEST => {
            sync_op(inner, identity, &msg, kinds::GET_USER_CHANNELS_RESPONSE, |_, _| {
                let payload = serde_json::to_value(protocol::GetUserChannelsResponse {
                    user_channels: recommended_user_channels().to_vec(),
                })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::JOIN_USER_CHANNEL_REQUEST => {
            let payload: protocol::JoinUserChannelRequest =
                payload!(inner, identity, msg, kinds::JOIN_USER_CHANNEL_RESPONSE);
            sync_op(inner, identity, &msg, kinds::JOIN_USER_CHANNEL_RESPONSE, |state, id| {
                let events =
                    state
                        .channels
                        .join_user_channel(id, &payload.channel_id, &state.events)?;
                Ok((json!({}), events))
            });
        }
        kinds::GET_CURRENT_CHANNEL_REQUEST => {
            sync_op(inner, identity, &msg, kinds::GET_CURRENT_CHANNEL_RESPONSE, |state, id| {
                let payload = serde_json::to_value(protocol::GetCurrentChannelResponse {
                    channel: state.channels.current_channel(&id.instance_id),
                })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::LEAVE_CURRENT_CHANNEL_REQUEST => {
            sync_op(inner, identity, &msg, kinds::LEAVE_CURRENT_CHANNEL_RESPONSE, |state, id| {
                let events = state.channels.leave_current_channel(id, &state.events)?;
                Ok((json!({}), events))
            });
        }
        kinds::GET_OR_CREATE_CHANNEL_REQUEST => {
            let payload: protocol::GetOrCreateChannelRequest =
                payload!(inner, identity, msg, kinds::GET_OR_CREATE_CHANNEL_RESPONSE);
            sync_op(inner, identity, &msg, kinds::GET_OR_CREATE_CHANNEL_RESPONSE, |state, _| {
                let channel = state.channels.get_or_create_channel(&payload.channel_id)?;
                let payload =
                    serde_json::to_value(protocol::GetOrCreateChannelResponse { channel })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::CREATE_PRIVATE_CHANNEL_REQUEST => {
            sync_op(inner, identity, &msg, kinds::CREATE_PRIVATE_CHANNEL_RESPONSE, |state, id| {
                let private_channel = state.channels.create_private_channel(id);
                let payload = serde_json::to_value(protocol::CreatePrivateChannelResponse {
                    private_channel,
                })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::ADD_CONTEXT_LISTENER_REQUEST => {
            let payload: protocol::AddContextListenerRequest =
                payload!(inner, identity, msg, kinds::ADD_CONTEXT_LISTENER_RESPONSE);
            sync_op(inner, identity, &msg, kinds::ADD_CONTEXT_LISTENER_RESPONSE, |state, id| {
                let (listener_uuid, mut events) = state.channels.add_context_listener(
                    id,
                    payload.channel_id.as_deref(),
                    payload.context_type.as_deref(),
                )?;
                // A context handed to `open` is delivered once the opened
                // instance registers a listener accepting it.
                if payload.channel_id.is_none() {
                    if let Some(context) = state.pending_open.get(&id.instance_id) {
                        let matches = payload
                            .context_type
                            .as_deref()
                            .map(|t| context.get("type").and_then(Value::as_str) == Some(t))
                            .unwrap_or(true);
                        if matches {
                            let context = state
                                .pending_open
                                .remove(&id.instance_id)
                                .unwrap_or_default();
                            events.push(Outbound {
                                target: id.instance_id.clone(),
                                message: Message::event(
                                    kinds::BROADCAST_EVENT,
                                    protocol::BroadcastEvent {
                                        channel_id: None,
                                        context,
                                        originating_app: None,
                                    },
                                )?,
                            });
                        }
                    }
                }
                let payload = serde_json::to_value(protocol::ListenerResponse { listener_uuid })?;
                Ok((payload, events))
            });
        }
        kinds::CONTEXT_LISTENER_UNSUBSCRIBE_REQUEST => {
            let payload: protocol::ListenerUnsubscribeRequest =
                payload!(inner, identity, msg, kinds::CONTEXT_LISTENER_UNSUBSCRIBE_RESPONSE);
            sync_op(
                inner,
                identity,
                &msg,
                kinds::CONTEXT_LISTENER_UNSUBSCRIBE_RESPONSE,
                |state, _| {
                    let events = state
                        .channels
                        .remove_context_listener(&payload.listener_uuid)?;
                    Ok((json!({}), events))
                },
            );
        }
        kinds::BROADCAST_REQUEST => {
            let payload: protocol::BroadcastRequest =
                payload!(inner, identity, msg, kinds::BROADCAST_RESPONSE);
            sync_op(inner, identity, &msg, kinds::BROADCAST_RESPONSE, |state, id| {
                let events = state.channels.broadcast(
                    id,
                    payload.channel_id.as_deref(),
                    &payload.context,
                )?;
                Ok((json!({}), events))
            });
        }
        kinds::GET_CURRENT_CONTEXT_REQUEST => {
            let payload: protocol::GetCurrentContextRequest =
                payload!(inner, identity, msg, kinds::GET_CURRENT_CONTEXT_RESPONSE);
            sync_op(inner, identity, &msg, kinds::GET_CURRENT_CONTEXT_RESPONSE, |state, id| {
                let context = state.channels.current_context(
                    id,
                    &payload.channel_id,
                    payload.context_type.as_deref(),
                )?;
                let payload =
                    serde_json::to_value(protocol::GetCurrentContextResponse { context })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::PRIVATE_CHANNEL_ADD_EVENT_LISTENER_REQUEST => {
            let payload: protocol::PrivateChannelAddEventListenerRequest = payload!(
                inner,
                identity,
                msg,
                kinds::PRIVATE_CHANNEL_ADD_EVENT_LISTENER_RESPONSE
            );
            sync_op(
                inner,
                identity,
                &msg,
                kinds::PRIVATE_CHANNEL_ADD_EVENT_LISTENER_RESPONSE,
                |state, id| {
                    let listener_type =
                        protocol::parse_private_listener_type(&payload.listener_type)?;
                    let listener_uuid = state.channels.add_private_event_listener(
                        id,
                        &payload.private_channel_id,
                        listener_type,
                    )?;
                    let payload =
                        serde_json::to_value(protocol::ListenerResponse { listener_uuid })?;
                    Ok((payload, Vec::new()))
                },
            );
        }
        kinds::PRIVATE_CHANNEL_UNSUBSCRIBE_EVENT_LISTENER_REQUEST => {
            let payload: protocol::ListenerUnsubscribeRequest = payload!(
                inner,
                identity,
                msg,
                kinds::PRIVATE_CHANNEL_UNSUBSCRIBE_EVENT_LISTENER_RESPONSE
            );
            sync_op(
                inner,
                identity,
                &msg,
                kinds::PRIVATE_CHANNEL_UNSUBSCRIBE_EVENT_LISTENER_RESPONSE,
                |state, _| {
                    state
                        .channels
                        .remove_private_event_listener(&payload.listener_uuid);
                    Ok((json!({}), Vec::new()))
                },
            );
        }
        kinds::PRIVATE_CHANNEL_DISCONNECT_REQUEST => {
            let payload: protocol::PrivateChannelDisconnectRequest =
                payload!(inner, identity, msg, kinds::PRIVATE_CHANNEL_DISCONNECT_RESPONSE);
            sync_op(
                inner,
                identity,
                &msg,
                kinds::PRIVATE_CHANNEL_DISCONNECT_RESPONSE,
                |state, id| {
                    let events = state
                        .channels
                        .private_channel_disconnect(id, &payload.channel_id)?;
                    Ok((json!({}), events))
                },
            );
        }

        // ---- desktop-agent events ----
        kinds::ADD_EVENT_LISTENER_REQUEST => {
            let payload: protocol::AddEventListenerRequest =
                payload!(inner, identity, msg, kinds::ADD_EVENT_LISTENER_RESPONSE);
            sync_op(inner, identity, &msg, kinds::ADD_EVENT_LISTENER_RESPONSE, |state, id| {
                let event_type = payload
                    .event_type
                    .as_deref()
                    .unwrap_or(protocol::ALL_EVENTS);
                let listener_uuid = state.events.add(id, event_type);
                let payload = serde_json::to_value(protocol::ListenerResponse { listener_uuid })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::EVENT_LISTENER_UNSUBSCRIBE_REQUEST => {
            let payload: protocol::ListenerUnsubscribeRequest =
                payload!(inner, identity, msg, kinds::EVENT_LISTENER_UNSUBSCRIBE_RESPONSE);
            sync_op(
                inner,
                identity,
                &msg,
                kinds::EVENT_LISTENER_UNSUBSCRIBE_RESPONSE,
                |state, _| {
                    state.events.remove(&payload.listener_uuid);
                    Ok((json!({}), Vec::new()))
                },
            );
        }

        // ---- intents ----
        kinds::ADD_INTENT_LISTENER_REQUEST => {
            let payload: protocol::AddIntentListenerRequest =
                payload!(inner, identity, msg, kinds::ADD_INTENT_LISTENER_RESPONSE);
            sync_op(inner, identity, &msg, kinds::ADD_INTENT_LISTENER_RESPONSE, |state, id| {
                let listener_uuid = crate::message::new_uuid();
                state.intents.listeners.push(IntentListenerRecord {
                    listener_uuid: listener_uuid.clone(),
                    intent: payload.intent.clone(),
                    instance_id: id.instance_id.clone(),
                });
                state
                    .directory
                    .register_intent_listener(id, &payload.intent, &payload.context_types);
                let payload = serde_json::to_value(protocol::ListenerResponse { listener_uuid })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::INTENT_LISTENER_UNSUBSCRIBE_REQUEST => {
            let payload: protocol::ListenerUnsubscribeRequest =
                payload!(inner, identity, msg, kinds::INTENT_LISTENER_UNSUBSCRIBE_RESPONSE);
            sync_op(
                inner,
                identity,
                &msg,
                kinds::INTENT_LISTENER_UNSUBSCRIBE_RESPONSE,
                |state, id| {
                    if let Some(index) = state
                        .intents
                        .listeners
                        .iter()
                        .position(|l| l.listener_uuid == payload.listener_uuid)
                    {
                        let record = state.intents.listeners.remove(index);
                        state.directory.deregister_intent_listener(id, &record.intent);
                    }
                    Ok((json!({}), Vec::new()))
                },
            );
        }
        kinds::RAISE_INTENT_REQUEST => {
            handle_raise_intent(inner, identity, msg).await;
        }
        kinds::RAISE_INTENT_FOR_CONTEXT_REQUEST => {
            handle_raise_intent_for_context(inner, identity, msg).await;
        }
        kinds::INTENT_RESULT_REQUEST => {
            handle_intent_result(inner, identity, msg);
        }
        kinds::FIND_INTENT_REQUEST => {
            let payload: protocol::FindIntentRequest =
                payload!(inner, identity, msg, kinds::FIND_INTENT_RESPONSE);
            sync_op(inner, identity, &msg, kinds::FIND_INTENT_RESPONSE, |state, _| {
                let context_type = match &payload.context {
                    Some(context) => {
                        if !Context::is_valid(context) {
                            return Err(Error::MalformedContext);
                        }
                        context.get("type").and_then(Value::as_str)
                    }
                    None => None,
                };
                let app_intent = state.directory.app_intent(
                    &payload.intent,
                    context_type,
                    payload.result_type.as_deref(),
                );
                if app_intent.apps.is_empty() {
                    return Err(Error::NoAppsFound);
                }
                let payload = serde_json::to_value(protocol::FindIntentResponse { app_intent })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::FIND_INTENTS_BY_CONTEXT_REQUEST => {
            let payload: protocol::FindIntentsByContextRequest =
                payload!(inner, identity, msg, kinds::FIND_INTENTS_BY_CONTEXT_RESPONSE);
            sync_op(
                inner,
                identity,
                &msg,
                kinds::FIND_INTENTS_BY_CONTEXT_RESPONSE,
                |state, _| {
                    if !Context::is_valid(&payload.context) {
                        return Err(Error::MalformedContext);
                    }
                    let context_type = payload
                        .context
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let app_intents = state
                        .directory
                        .app_intents_for_context(context_type, payload.result_type.as_deref());
                    if app_intents.is_empty() {
                        return Err(Error::NoAppsFound);
                    }
                    let payload =
                        serde_json::to_value(protocol::FindIntentsByContextResponse {
                            app_intents,
                        })?;
                    Ok((payload, Vec::new()))
                },
            );
        }
        kinds::FIND_INSTANCES_REQUEST => {
            let payload: protocol::FindInstancesRequest =
                payload!(inner, identity, msg, kinds::FIND_INSTANCES_RESPONSE);
            sync_op(inner, identity, &msg, kinds::FIND_INSTANCES_RESPONSE, |state, _| {
                let instances = state
                    .directory
                    .app_instances(&payload.app.app_id)
                    .ok_or(Error::TargetAppUnavailable)?;
                let payload = serde_json::to_value(protocol::FindInstancesResponse {
                    app_identifiers: instances.into_iter().map(AppIdentifier::from).collect(),
                })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::GET_APP_METADATA_REQUEST => {
            let payload: protocol::GetAppMetadataRequest =
                payload!(inner, identity, msg, kinds::GET_APP_METADATA_RESPONSE);
            sync_op(inner, identity, &msg, kinds::GET_APP_METADATA_RESPONSE, |state, _| {
                let app_metadata = state
                    .directory
                    .app_metadata(&payload.app)
                    .ok_or(Error::TargetAppUnavailable)?;
                let payload =
                    serde_json::to_value(protocol::GetAppMetadataResponse { app_metadata })?;
                Ok((payload, Vec::new()))
            });
        }
        kinds::OPEN_REQUEST => {
            handle_open(inner, identity, msg).await;
        }
        kinds::GET_INFO_REQUEST => {
            sync_op(inner, identity, &msg, kinds::GET_INFO_RESPONSE, |state, id| {
                let app_metadata = state
                    .directory
                    .app_metadata(&AppIdentifier::from(id))
                    .unwrap_or_else(|| AppMetadata {
                        app_id: id.app_id.clone(),
                        instance_id: Some(id.instance_id.clone()),
                        ..AppMetadata::default()
                    });
                let payload = serde_json::to_value(protocol::GetInfoResponse {
                    implementation_metadata: ImplementationMetadata {
                        fdc3_version: protocol::FDC3_VERSION.to_string(),
                        provider: "fdc3-rs".to_string(),
                        provider_version: env!("CARGO_PKG_VERSION").to_string(),
                        app_metadata,
                    },
                })?;
                Ok((payload, Vec::new()))
            });
        }

        other => {
            warn!(kind = other, "ignoring unknown request");
        }
    }
}

// ---- intent flows ----

async fn resolve_intent_target(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    intent: &str,
    context: Context,
    app: Option<&AppIdentifier>,
) -> Result<FullyQualifiedAppIdentifier> {
    let resolution = {
        let state = inner.state.lock().expect("lock poisoned");
        state.directory.resolve_app_instance_for_intent(
            intent,
            Some(context.context_type()),
            app,
        )?
    };
    match resolution {
        TargetResolution::Direct(target) => Ok(target),
        TargetResolution::NeedsChoice(app_intent) => {
            let resolver = inner
                .resolver
                .as_ref()
                .ok_or(Error::ResolverTimeout)?
                .clone();
            let chosen = resolver
                .resolve_app_for_intent(ResolveForIntent {
                    intent: intent.to_string(),
                    context,
                    app: app.cloned(),
                    app_intent,
                })
                .await?;
            let state = inner.state.lock().expect("lock poisoned");
            match state.directory.instance(&chosen.instance_id) {
                Some(live) if *live == chosen => Ok(chosen),
                _ => Err(Error::TargetInstanceUnavailable),
            }
        }
    }
    .map_err(|error| {
        debug!(intent, raiser = %identity.instance_id, %error, "intent resolution failed");
        error
    })
}

/// Delivers the intent event to the chosen handler and answers the raiser
/// with the resolution; the eventual result is forwarded separately.
fn start_raise(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    msg: &Message,
    response_kind: &str,
    intent: &str,
    context: &Value,
    target: FullyQualifiedAppIdentifier,
) -> Result<()> {
    let event = Message::event(
        kinds::INTENT_EVENT,
        protocol::IntentEvent {
            intent: intent.to_string(),
            context: context.clone(),
            raise_intent_request_uuid: msg.request_uuid().to_string(),
            originating_app: Some(identity.into()),
        },
    )?;
    {
        let mut state = inner.state.lock().expect("lock poisoned");
        state.intents.pending_raises.insert(
            msg.request_uuid().to_string(),
            PendingRaise {
                raiser: identity.instance_id.clone(),
                handler: target.instance_id.clone(),
                event_uuid: event.event_uuid().to_string(),
            },
        );
    }
    send_to(inner, &target.instance_id, event);
    let payload = serde_json::to_value(protocol::RaiseIntentResponse {
        intent_resolution: protocol::IntentResolutionPayload {
            source: target.into(),
            intent: intent.to_string(),
        },
    })?;
    respond(inner, &identity.instance_id, msg, response_kind, Ok(payload));
    Ok(())
}

async fn handle_raise_intent(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    msg: Message,
) {
    let payload: protocol::RaiseIntentRequest =
        payload!(inner, identity, msg, kinds::RAISE_INTENT_RESPONSE);
    let context = match Context::new(payload.context.clone()) {
        Ok(context) => context,
        Err(error) => {
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::RAISE_INTENT_RESPONSE,
                Err(error),
            );
            return;
        }
    };
    let target = match resolve_intent_target(
        inner,
        identity,
        &payload.intent,
        context,
        payload.app.as_ref(),
    )
    .await
    {
        Ok(target) => target,
        Err(error) => {
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::RAISE_INTENT_RESPONSE,
                Err(error),
            );
            return;
        }
    };
    if let Err(error) = start_raise(
        inner,
        identity,
        &msg,
        kinds::RAISE_INTENT_RESPONSE,
        &payload.intent,
        &payload.context,
        target,
    ) {
        respond(
            inner,
            &identity.instance_id,
            &msg,
            kinds::RAISE_INTENT_RESPONSE,
            Err(error),
        );
    }
}

async fn handle_raise_intent_for_context(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    msg: Message,
) {
    let payload: protocol::RaiseIntentForContextRequest =
        payload!(inner, identity, msg, kinds::RAISE_INTENT_FOR_CONTEXT_RESPONSE);
    let context = match Context::new(payload.context.clone()) {
        Ok(context) => context,
        Err(error) => {
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::RAISE_INTENT_FOR_CONTEXT_RESPONSE,
                Err(error),
            );
            return;
        }
    };
    let resolution = {
        let state = inner.state.lock().expect("lock poisoned");
        state
            .directory
            .resolve_app_instance_for_context(context.context_type(), payload.app.as_ref())
    };
    let chosen = match resolution {
        Ok(ContextResolution::Direct { intent, instance }) => Ok((intent, instance)),
        Ok(ContextResolution::NeedsChoice(app_intents)) => match inner.resolver.as_ref() {
            Some(resolver) => resolver
                .resolve_app_for_context(ResolveForContext {
                    context: context.clone(),
                    app: payload.app.clone(),
                    app_intents,
                })
                .await
                .map(|choice| (choice.intent, choice.app)),
            None => Err(Error::ResolverTimeout),
        },
        Err(error) => Err(error),
    };
    match chosen {
        Ok((intent, target)) => {
            if let Err(error) = start_raise(
                inner,
                identity,
                &msg,
                kinds::RAISE_INTENT_FOR_CONTEXT_RESPONSE,
                &intent,
                &payload.context,
                target,
            ) {
                respond(
                    inner,
                    &identity.instance_id,
                    &msg,
                    kinds::RAISE_INTENT_FOR_CONTEXT_RESPONSE,
                    Err(error),
                );
            }
        }
        Err(error) => {
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::RAISE_INTENT_FOR_CONTEXT_RESPONSE,
                Err(error),
            );
        }
    }
}

/// A handler reported its intent result: acknowledge it, then forward the
/// result to the raiser keyed on the original raise request uuid. A private
/// channel result first admits the raiser to the channel.
fn handle_intent_result(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    msg: Message,
) {
    let payload: protocol::IntentResultRequest =
        payload!(inner, identity, msg, kinds::INTENT_RESULT_RESPONSE);
    let forwarded = {
        let mut state = inner.state.lock().expect("lock poisoned");
        let raise = state
            .intents
            .pending_raises
            .get(&payload.raise_intent_request_uuid)
            .cloned();
        match raise {
            Some(raise)
                if raise.handler == identity.instance_id
                    && raise.event_uuid == payload.intent_event_uuid =>
            {
                if let Some(channel) = payload
                    .intent_result
                    .channel
                    .as_ref()
                    .filter(|c| c.channel_type == ChannelType::Private)
                {
                    let raiser = state
                        .connections
                        .get(&raise.raiser)
                        .map(|record| record.identity.clone());
                    if let Some(raiser) = raiser {
                        state.channels.add_to_allowed_list(&channel.id, &raiser);
                    }
                }
                state
                    .intents
                    .pending_raises
                    .remove(&payload.raise_intent_request_uuid);
                Some(raise.raiser)
            }
            _ => None,
        }
    };
    match forwarded {
        Some(raiser) => {
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::INTENT_RESULT_RESPONSE,
                Ok(json!({})),
            );
            let result = Message::response_keyed(
                &payload.raise_intent_request_uuid,
                kinds::RAISE_INTENT_RESULT_RESPONSE,
                protocol::RaiseIntentResultResponse {
                    intent_result: payload.intent_result,
                },
            );
            match result {
                Ok(result) => send_to(inner, &raiser, result),
                Err(error) => warn!(%error, "failed to build intent result"),
            }
        }
        None => {
            warn!(
                raise_uuid = %payload.raise_intent_request_uuid,
                "intent result for unknown or mismatched raise"
            );
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::INTENT_RESULT_RESPONSE,
                Err(Error::TargetInstanceUnavailable),
            );
        }
    }
}

// ---- open ----

async fn handle_open(
    inner: &Arc<RootInner>,
    identity: &FullyQualifiedAppIdentifier,
    msg: Message,
) {
    let payload: protocol::OpenRequest = payload!(inner, identity, msg, kinds::OPEN_RESPONSE);
    if let Some(context) = &payload.context {
        if !Context::is_valid(context) {
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::OPEN_RESPONSE,
                Err(Error::MalformedContext),
            );
            return;
        }
    }
    let entry = {
        let state = inner.state.lock().expect("lock poisoned");
        state.directory.catalog_entry(&payload.app.app_id).cloned()
    };
    let Some(entry) = entry else {
        respond(
            inner,
            &identity.instance_id,
            &msg,
            kinds::OPEN_RESPONSE,
            Err(Error::AppNotFound),
        );
        return;
    };
    let Some(launcher) = inner.launcher.clone() else {
        respond(
            inner,
            &identity.instance_id,
            &msg,
            kinds::OPEN_RESPONSE,
            Err(Error::Agent("ErrorOnLaunch".to_string())),
        );
        return;
    };
    match launcher.launch(&entry).await {
        Ok(launched) => {
            if let Some(context) = payload.context {
                let mut state = inner.state.lock().expect("lock poisoned");
                state
                    .pending_open
                    .insert(launched.instance_id.clone(), context);
            }
            let payload = serde_json::to_value(protocol::OpenResponse {
                app_identifier: launched.into(),
            })
            .map_err(Error::from);
            respond(inner, &identity.instance_id, &msg, kinds::OPEN_RESPONSE, payload);
        }
        Err(error) => {
            respond(
                inner,
                &identity.instance_id,
                &msg,
                kinds::OPEN_RESPONSE,
                Err(error),
            );
        }
    }
}
