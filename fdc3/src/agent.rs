//! The desktop-agent facade: the full FDC3 API surface, backed by a message
//! port to the root agent. Every method either sends one request and awaits
//! its correlated response, or returns a handle whose own methods do.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as SyncMutex, Weak,
    },
    time::Duration,
};

use futures_core::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, warn};

use crate::{
    correlation::Correlator,
    message::{new_uuid, Message},
    protocol::{self, kinds, PrivateChannelEventType},
    transport::MessagePort,
    types::{
        AppIdentifier, AppIntent, AppMetadata, ChannelInfo, ChannelType, Context, DisplayMetadata,
        FullyQualifiedAppIdentifier, ImplementationMetadata,
    },
    Error, Result,
};

/// A desktop-agent event delivered to an event listener.
#[derive(Clone, Debug)]
pub struct AgentEvent {
    /// The FDC3 event name, e.g. `userChannelChanged`.
    pub event_type: String,
    pub details: Value,
}

/// An event delivered to a private-channel event listener.
#[derive(Clone, Debug, PartialEq)]
pub enum PrivateChannelEvent {
    AddContextListener { context_type: Option<String> },
    Unsubscribe { context_type: Option<String> },
    Disconnect,
}

/// What an intent handler hands back to the raiser.
#[derive(Clone, Debug)]
pub enum IntentHandlerResult {
    Context(Context),
    Channel(ChannelInfo),
}

type IntentHandlerFn = Arc<
    dyn Fn(Context, Option<AppIdentifier>) -> BoxFuture<'static, Result<Option<IntentHandlerResult>>>
        + Send
        + Sync,
>;

struct IntentHandlerRecord {
    intent: String,
    handler: IntentHandlerFn,
}

pub(crate) struct AgentInner {
    identity: FullyQualifiedAppIdentifier,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    correlator: Correlator,
    timeout: Option<Duration>,
    /// The user channel this app is joined to, tracked locally so
    /// current-channel context listeners can filter broadcast events.
    current_channel: SyncMutex<Option<String>>,
    intent_handlers: SyncMutex<HashMap<String, IntentHandlerRecord>>,
}

/// A connected FDC3 desktop agent.
///
/// Obtained from [`get_agent`] in an app, or from [`RootAgent::agent`] on the
/// page hosting the root. Cloning is cheap and every clone speaks over the
/// same connection.
///
/// [`get_agent`]: crate::get_agent
/// [`RootAgent::agent`]: crate::RootAgent::agent
#[derive(Clone)]
pub struct DesktopAgent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for DesktopAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopAgent")
            .field("identity", &self.inner.identity)
            .finish_non_exhaustive()
    }
}

impl DesktopAgent {
    /// Wires a facade onto its half of a connection port and starts the read
    /// loop.
    pub(crate) fn connect(
        identity: FullyQualifiedAppIdentifier,
        port: MessagePort,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let rx = port
            .start()
            .ok_or_else(|| Error::Protocol("connection port already started".into()))?;
        let inner = Arc::new(AgentInner {
            identity,
            tx: port.sender(),
            correlator: Correlator::new(),
            timeout,
            current_channel: SyncMutex::new(None),
            intent_handlers: SyncMutex::new(HashMap::new()),
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), rx));
        Ok(Self { inner })
    }

    /// The identity the root assigned to this app at connection time.
    pub fn app_identifier(&self) -> &FullyQualifiedAppIdentifier {
        &self.inner.identity
    }

    // ---- request plumbing ----

    async fn call_value(
        &self,
        request_kind: &'static str,
        response_kind: &'static str,
        payload: impl Serialize,
    ) -> Result<Value> {
        let message = Message::request(
            request_kind,
            Some(self.inner.identity.clone().into()),
            payload,
        )?;
        let rx = self
            .inner
            .correlator
            .expect_response(message.request_uuid(), Box::new(move |k| k == response_kind));
        self.inner.tx.send(message).map_err(|_| Error::Disconnected)?;
        await_settled(rx, self.inner.timeout).await
    }

    async fn call<R: DeserializeOwned>(
        &self,
        request_kind: &'static str,
        response_kind: &'static str,
        payload: impl Serialize,
    ) -> Result<R> {
        let value = self.call_value(request_kind, response_kind, payload).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("bad {response_kind} payload: {e}")))
    }

    fn channel_handle(&self, info: ChannelInfo) -> Channel {
        Channel {
            info,
            agent: self.clone(),
        }
    }

    // ---- channels ----

    pub async fn get_user_channels(&self) -> Result<Vec<Channel>> {
        let response: protocol::GetUserChannelsResponse = self
            .call(
                kinds::GET_USER_CHANNELS_REQUEST,
                kinds::GET_USER_CHANNELS_RESPONSE,
                serde_json::json!({}),
            )
            .await?;
        Ok(response
            .user_channels
            .into_iter()
            .map(|info| self.channel_handle(info))
            .collect())
    }

    pub async fn join_user_channel(&self, channel_id: &str) -> Result<()> {
        self.call_value(
            kinds::JOIN_USER_CHANNEL_REQUEST,
            kinds::JOIN_USER_CHANNEL_RESPONSE,
            protocol::JoinUserChannelRequest {
                channel_id: channel_id.to_string(),
            },
        )
        .await?;
        *self.inner.current_channel.lock().expect("lock poisoned") =
            Some(channel_id.to_string());
        Ok(())
    }

    pub async fn get_current_channel(&self) -> Result<Option<Channel>> {
        let response: protocol::GetCurrentChannelResponse = self
            .call(
                kinds::GET_CURRENT_CHANNEL_REQUEST,
                kinds::GET_CURRENT_CHANNEL_RESPONSE,
                serde_json::json!({}),
            )
            .await?;
        Ok(response.channel.map(|info| self.channel_handle(info)))
    }

    pub async fn leave_current_channel(&self) -> Result<()> {
        self.call_value(
            kinds::LEAVE_CURRENT_CHANNEL_REQUEST,
            kinds::LEAVE_CURRENT_CHANNEL_RESPONSE,
            serde_json::json!({}),
        )
        .await?;
        self.inner
            .current_channel
            .lock()
            .expect("lock poisoned")
            .take();
        Ok(())
    }

    pub async fn get_or_create_channel(&self, channel_id: &str) -> Result<Channel> {
        let response: protocol::GetOrCreateChannelResponse = self
            .call(
                kinds::GET_OR_CREATE_CHANNEL_REQUEST,
                kinds::GET_OR_CREATE_CHANNEL_RESPONSE,
                protocol::GetOrCreateChannelRequest {
                    channel_id: channel_id.to_string(),
                },
            )
            .await?;
        Ok(self.channel_handle(response.channel))
    }

    pub async fn create_private_channel(&self) -> Result<PrivateChannel> {
        let response: protocol::CreatePrivateChannelResponse = self
            .call(
                kinds::CREATE_PRIVATE_CHANNEL_REQUEST,
                kinds::CREATE_PRIVATE_CHANNEL_RESPONSE,
                serde_json::json!({}),
            )
            .await?;
        Ok(PrivateChannel {
            channel: self.channel_handle(response.private_channel),
        })
    }

    /// Broadcasts on the user channel this app is joined to; a no-op when it
    /// has not joined one.
    pub async fn broadcast(&self, context: &Context) -> Result<()> {
        self.call_value(
            kinds::BROADCAST_REQUEST,
            kinds::BROADCAST_RESPONSE,
            protocol::BroadcastRequest {
                channel_id: None,
                context: context.as_value().clone(),
            },
        )
        .await
        .map(|_| ())
    }

    /// Listens for contexts on whichever user channel this app is joined to.
    pub async fn add_context_listener<H>(
        &self,
        context_type: Option<&str>,
        handler: H,
    ) -> Result<Listener>
    where
        H: FnMut(Context, Option<AppIdentifier>) + Send + 'static,
    {
        self.add_context_listener_inner(None, context_type, handler)
            .await
    }

    pub(crate) async fn add_context_listener_inner<H>(
        &self,
        channel_id: Option<String>,
        context_type: Option<&str>,
        mut handler: H,
    ) -> Result<Listener>
    where
        H: FnMut(Context, Option<AppIdentifier>) + Send + 'static,
    {
        // The callback goes in under a local key before the request leaves:
        // the root may emit an event for this listener the instant after its
        // response, and the read loop must already know where to put it.
        let local_key = new_uuid();
        let inner = Arc::downgrade(&self.inner);
        let wanted_type = context_type.map(str::to_string);
        let request = protocol::AddContextListenerRequest {
            channel_id: channel_id.clone(),
            context_type: wanted_type.clone(),
        };
        self.inner.correlator.add_event_callback(
            &local_key,
            Box::new(move |message| {
                if message.kind != kinds::BROADCAST_EVENT {
                    return;
                }
                let Ok(event) = message.payload_as::<protocol::BroadcastEvent>() else {
                    return;
                };
                let on_channel = match (&channel_id, &event.channel_id) {
                    (Some(mine), Some(broadcast)) => mine == broadcast,
                    (Some(_), None) => false,
                    (None, Some(broadcast)) => inner.upgrade().is_some_and(|inner| {
                        inner
                            .current_channel
                            .lock()
                            .expect("lock poisoned")
                            .as_deref()
                            == Some(broadcast.as_str())
                    }),
                    // Direct delivery, e.g. a context handed to `open`.
                    (None, None) => true,
                };
                if !on_channel {
                    return;
                }
                let Ok(context) = Context::new(event.context) else {
                    return;
                };
                if let Some(wanted) = &wanted_type {
                    if context.context_type() != wanted {
                        return;
                    }
                }
                handler(context, event.originating_app);
            }),
        );
        let response: Result<protocol::ListenerResponse> = self
            .call(
                kinds::ADD_CONTEXT_LISTENER_REQUEST,
                kinds::ADD_CONTEXT_LISTENER_RESPONSE,
                request,
            )
            .await;
        match response {
            Ok(response) => Ok(Listener::new(
                self.clone(),
                response.listener_uuid,
                local_key,
                kinds::CONTEXT_LISTENER_UNSUBSCRIBE_REQUEST,
                kinds::CONTEXT_LISTENER_UNSUBSCRIBE_RESPONSE,
            )),
            Err(error) => {
                self.inner.correlator.remove_event_callback(&local_key);
                Err(error)
            }
        }
    }

    // ---- desktop-agent events ----

    /// Subscribes to agent events; `None` subscribes to all of them.
    pub async fn add_event_listener<H>(
        &self,
        event_type: Option<&str>,
        mut handler: H,
    ) -> Result<Listener>
    where
        H: FnMut(AgentEvent) + Send + 'static,
    {
        let local_key = new_uuid();
        let wanted = event_type.map(str::to_string);
        let request = protocol::AddEventListenerRequest {
            event_type: wanted.clone(),
        };
        self.inner.correlator.add_event_callback(
            &local_key,
            Box::new(move |message| {
                let event_name = match message.kind.as_str() {
                    kinds::CHANNEL_CHANGED_EVENT => protocol::USER_CHANNEL_CHANGED,
                    _ => return,
                };
                let matches = wanted
                    .as_deref()
                    .map(|w| w == protocol::ALL_EVENTS || w == event_name)
                    .unwrap_or(true);
                if matches {
                    handler(AgentEvent {
                        event_type: event_name.to_string(),
                        details: message.payload.clone(),
                    });
                }
            }),
        );
        let response: Result<protocol::ListenerResponse> = self
            .call(
                kinds::ADD_EVENT_LISTENER_REQUEST,
                kinds::ADD_EVENT_LISTENER_RESPONSE,
                request,
            )
            .await;
        match response {
            Ok(response) => Ok(Listener::new(
                self.clone(),
                response.listener_uuid,
                local_key,
                kinds::EVENT_LISTENER_UNSUBSCRIBE_REQUEST,
                kinds::EVENT_LISTENER_UNSUBSCRIBE_RESPONSE,
            )),
            Err(error) => {
                self.inner.correlator.remove_event_callback(&local_key);
                Err(error)
            }
        }
    }

    // ---- intents ----

    /// Registers a handler for an intent. `accepted_context_types` narrows
    /// what the handler accepts; empty accepts any context.
    pub async fn add_intent_listener<H>(
        &self,
        intent: &str,
        accepted_context_types: &[&str],
        handler: H,
    ) -> Result<Listener>
    where
        H: Fn(Context, Option<AppIdentifier>) -> BoxFuture<'static, Result<Option<IntentHandlerResult>>>
            + Send
            + Sync
            + 'static,
    {
        // Registered locally before the request leaves, so an intent event
        // hot on the heels of the response always finds its handler.
        let local_key = new_uuid();
        self.inner
            .intent_handlers
            .lock()
            .expect("lock poisoned")
            .insert(
                local_key.clone(),
                IntentHandlerRecord {
                    intent: intent.to_string(),
                    handler: Arc::new(handler),
                },
            );
        let response: Result<protocol::ListenerResponse> = self
            .call(
                kinds::ADD_INTENT_LISTENER_REQUEST,
                kinds::ADD_INTENT_LISTENER_RESPONSE,
                protocol::AddIntentListenerRequest {
                    intent: intent.to_string(),
                    context_types: accepted_context_types
                        .iter()
                        .map(|t| t.to_string())
                        .collect(),
                },
            )
            .await;
        match response {
            Ok(response) => Ok(Listener::new(
                self.clone(),
                response.listener_uuid,
                local_key,
                kinds::INTENT_LISTENER_UNSUBSCRIBE_REQUEST,
                kinds::INTENT_LISTENER_UNSUBSCRIBE_RESPONSE,
            )),
            Err(error) => {
                self.inner
                    .intent_handlers
                    .lock()
                    .expect("lock poisoned")
                    .remove(&local_key);
                Err(error)
            }
        }
    }

    pub async fn raise_intent(
        &self,
        intent: &str,
        context: &Context,
        app: Option<&AppIdentifier>,
    ) -> Result<IntentResolution> {
        self.raise(
            kinds::RAISE_INTENT_REQUEST,
            kinds::RAISE_INTENT_RESPONSE,
            protocol::RaiseIntentRequest {
                intent: intent.to_string(),
                context: context.as_value().clone(),
                app: app.cloned(),
            },
        )
        .await
    }

    pub async fn raise_intent_for_context(
        &self,
        context: &Context,
        app: Option<&AppIdentifier>,
    ) -> Result<IntentResolution> {
        self.raise(
            kinds::RAISE_INTENT_FOR_CONTEXT_REQUEST,
            kinds::RAISE_INTENT_FOR_CONTEXT_RESPONSE,
            protocol::RaiseIntentForContextRequest {
                context: context.as_value().clone(),
                app: app.cloned(),
            },
        )
        .await
    }

    async fn raise(
        &self,
        request_kind: &'static str,
        response_kind: &'static str,
        payload: impl Serialize,
    ) -> Result<IntentResolution> {
        let message = Message::request(
            request_kind,
            Some(self.inner.identity.clone().into()),
            payload,
        )?;
        // Interest in the eventual result is registered before the request
        // goes out so the handler cannot win a race against us.
        let resolution_rx = self
            .inner
            .correlator
            .expect_response(message.request_uuid(), Box::new(move |k| k == response_kind));
        let result_rx = self.inner.correlator.expect_response(
            message.request_uuid(),
            Box::new(|k| k == kinds::RAISE_INTENT_RESULT_RESPONSE),
        );
        self.inner.tx.send(message).map_err(|_| Error::Disconnected)?;

        let value = await_settled(resolution_rx, self.inner.timeout).await?;
        let response: protocol::RaiseIntentResponse = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("bad {response_kind} payload: {e}")))?;
        Ok(IntentResolution {
            source: response.intent_resolution.source,
            intent: response.intent_resolution.intent,
            agent: self.clone(),
            result: SyncMutex::new(Some(result_rx)),
        })
    }

    pub async fn find_intent(
        &self,
        intent: &str,
        context: Option<&Context>,
        result_type: Option<&str>,
    ) -> Result<AppIntent> {
        let response: protocol::FindIntentResponse = self
            .call(
                kinds::FIND_INTENT_REQUEST,
                kinds::FIND_INTENT_RESPONSE,
                protocol::FindIntentRequest {
                    intent: intent.to_string(),
                    context: context.map(|c| c.as_value().clone()),
                    result_type: result_type.map(str::to_string),
                },
            )
            .await?;
        Ok(response.app_intent)
    }

    pub async fn find_intents_by_context(
        &self,
        context: &Context,
        result_type: Option<&str>,
    ) -> Result<Vec<AppIntent>> {
        let response: protocol::FindIntentsByContextResponse = self
            .call(
                kinds::FIND_INTENTS_BY_CONTEXT_REQUEST,
                kinds::FIND_INTENTS_BY_CONTEXT_RESPONSE,
                protocol::FindIntentsByContextRequest {
                    context: context.as_value().clone(),
                    result_type: result_type.map(str::to_string),
                },
            )
            .await?;
        Ok(response.app_intents)
    }

    // ---- directory ----

    pub async fn find_instances(&self, app: &AppIdentifier) -> Result<Vec<AppIdentifier>> {
        let response: protocol::FindInstancesResponse = self
            .call(
                kinds::FIND_INSTANCES_REQUEST,
                kinds::FIND_INSTANCES_RESPONSE,
                protocol::FindInstancesRequest { app: app.clone() },
            )
            .await?;
        Ok(response.app_identifiers)
    }

    pub async fn get_app_metadata(&self, app: &AppIdentifier) -> Result<AppMetadata> {
        let response: protocol::GetAppMetadataResponse = self
            .call(
                kinds::GET_APP_METADATA_REQUEST,
                kinds::GET_APP_METADATA_RESPONSE,
                protocol::GetAppMetadataRequest { app: app.clone() },
            )
            .await?;
        Ok(response.app_metadata)
    }

    pub async fn open(
        &self,
        app: &AppIdentifier,
        context: Option<&Context>,
    ) -> Result<AppIdentifier> {
        let response: protocol::OpenResponse = self
            .call(
                kinds::OPEN_REQUEST,
                kinds::OPEN_RESPONSE,
                protocol::OpenRequest {
                    app: app.clone(),
                    context: context.map(|c| c.as_value().clone()),
                },
            )
            .await?;
        Ok(response.app_identifier)
    }

    pub async fn get_info(&self) -> Result<ImplementationMetadata> {
        let response: protocol::GetInfoResponse = self
            .call(
                kinds::GET_INFO_REQUEST,
                kinds::GET_INFO_RESPONSE,
                serde_json::json!({}),
            )
            .await?;
        Ok(response.implementation_metadata)
    }
}

async fn await_settled(
    rx: oneshot::Receiver<Result<Value>>,
    timeout: Option<Duration>,
) -> Result<Value> {
    let settled = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| Error::ApiTimeout)?,
        None => rx.await,
    };
    settled.map_err(|_| Error::Disconnected)?
}

// ---- inbound traffic ----

async fn read_loop(inner: Weak<AgentInner>, mut rx: UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        match message.kind.as_str() {
            kinds::HEARTBEAT_EVENT => acknowledge_heartbeat(&inner, &message),
            kinds::INTENT_EVENT => handle_intent_event(&inner, message),
            _ => inner.correlator.deliver(&message),
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.correlator.fail_all(Error::Disconnected);
    }
}

fn acknowledge_heartbeat(inner: &Arc<AgentInner>, ping: &Message) {
    let ack = Message::request(
        kinds::HEARTBEAT_ACKNOWLEDGEMENT_REQUEST,
        Some(inner.identity.clone().into()),
        protocol::HeartbeatAcknowledgementRequest {
            heartbeat_event_uuid: ping.event_uuid().to_string(),
        },
    );
    match ack {
        Ok(ack) => {
            let _ = inner.tx.send(ack);
        }
        Err(error) => warn!(%error, "failed to build heartbeat acknowledgement"),
    }
}

/// Runs the registered handler for an inbound intent and reports its result
/// back to the root.
fn handle_intent_event(inner: &Arc<AgentInner>, message: Message) {
    let Ok(event) = message.payload_as::<protocol::IntentEvent>() else {
        warn!("malformed intent event");
        return;
    };
    let handler = inner
        .intent_handlers
        .lock()
        .expect("lock poisoned")
        .values()
        .find(|record| record.intent == event.intent)
        .map(|record| record.handler.clone());
    let Some(handler) = handler else {
        warn!(intent = %event.intent, "intent event with no registered handler");
        return;
    };
    let inner = inner.clone();
    let event_uuid = message.event_uuid().to_string();
    tokio::spawn(async move {
        let outcome = match Context::new(event.context) {
            Ok(context) => handler(context, event.originating_app).await,
            Err(error) => Err(error),
        };
        let intent_result = match outcome {
            Ok(Some(IntentHandlerResult::Context(context))) => protocol::IntentResultPayload {
                context: Some(context.into_value()),
                channel: None,
            },
            Ok(Some(IntentHandlerResult::Channel(info))) => protocol::IntentResultPayload {
                context: None,
                channel: Some(info),
            },
            Ok(None) => protocol::IntentResultPayload::default(),
            Err(error) => {
                warn!(intent = %event.intent, %error, "intent handler failed");
                protocol::IntentResultPayload::default()
            }
        };
        let request = Message::request(
            kinds::INTENT_RESULT_REQUEST,
            Some(inner.identity.clone().into()),
            protocol::IntentResultRequest {
                intent_event_uuid: event_uuid,
                raise_intent_request_uuid: event.raise_intent_request_uuid,
                intent_result,
            },
        );
        let Ok(request) = request else { return };
        let rx = inner.correlator.expect_response(
            request.request_uuid(),
            Box::new(|k| k == kinds::INTENT_RESULT_RESPONSE),
        );
        if inner.tx.send(request).is_err() {
            return;
        }
        if let Err(error) = await_settled(rx, inner.timeout).await {
            debug!(%error, "intent result not acknowledged");
        }
    });
}

// ---- handles ----

/// A handle to a registered listener. `unsubscribe` is idempotent: however
/// often it is called, at most one unsubscribe request goes out.
pub struct Listener {
    agent: DesktopAgent,
    listener_uuid: String,
    /// Key of the local callback/handler registration, distinct from the
    /// root-assigned listener uuid.
    local_key: String,
    request_kind: &'static str,
    response_kind: &'static str,
    unsubscribed: AtomicBool,
}

impl Listener {
    fn new(
        agent: DesktopAgent,
        listener_uuid: String,
        local_key: String,
        request_kind: &'static str,
        response_kind: &'static str,
    ) -> Self {
        Self {
            agent,
            listener_uuid,
            local_key,
            request_kind,
            response_kind,
            unsubscribed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.listener_uuid
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        if self.unsubscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .agent
            .call_value(
                self.request_kind,
                self.response_kind,
                protocol::ListenerUnsubscribeRequest {
                    listener_uuid: self.listener_uuid.clone(),
                },
            )
            .await;
        // Local registrations go only after the terminal response settled.
        self.agent
            .inner
            .correlator
            .remove_event_callback(&self.local_key);
        self.agent
            .inner
            .intent_handlers
            .lock()
            .expect("lock poisoned")
            .remove(&self.local_key);
        result.map(|_| ())
    }
}

/// A channel handle bound to one agent connection.
#[derive(Clone)]
pub struct Channel {
    info: ChannelInfo,
    agent: DesktopAgent,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("info", &self.info).finish()
    }
}

impl Channel {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn channel_type(&self) -> ChannelType {
        self.info.channel_type
    }

    pub fn display_metadata(&self) -> Option<&DisplayMetadata> {
        self.info.display_metadata.as_ref()
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub async fn broadcast(&self, context: &Context) -> Result<()> {
        self.agent
            .call_value(
                kinds::BROADCAST_REQUEST,
                kinds::BROADCAST_RESPONSE,
                protocol::BroadcastRequest {
                    channel_id: Some(self.info.id.clone()),
                    context: context.as_value().clone(),
                },
            )
            .await
            .map(|_| ())
    }

    pub async fn get_current_context(&self, context_type: Option<&str>) -> Result<Option<Context>> {
        let response: protocol::GetCurrentContextResponse = self
            .agent
            .call(
                kinds::GET_CURRENT_CONTEXT_REQUEST,
                kinds::GET_CURRENT_CONTEXT_RESPONSE,
                protocol::GetCurrentContextRequest {
                    channel_id: self.info.id.clone(),
                    context_type: context_type.map(str::to_string),
                },
            )
            .await?;
        response.context.map(Context::new).transpose()
    }

    pub async fn add_context_listener<H>(
        &self,
        context_type: Option<&str>,
        handler: H,
    ) -> Result<Listener>
    where
        H: FnMut(Context, Option<AppIdentifier>) + Send + 'static,
    {
        self.agent
            .add_context_listener_inner(Some(self.info.id.clone()), context_type, handler)
            .await
    }

    /// Reinterprets this handle as a private channel when its type allows.
    pub fn as_private(&self) -> Option<PrivateChannel> {
        (self.info.channel_type == ChannelType::Private).then(|| PrivateChannel {
            channel: self.clone(),
        })
    }
}

/// A private channel handle: a [`Channel`] plus the membership event surface
/// and `disconnect`.
#[derive(Clone, Debug)]
pub struct PrivateChannel {
    channel: Channel,
}

impl PrivateChannel {
    pub fn id(&self) -> &str {
        self.channel.id()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn info(&self) -> &ChannelInfo {
        self.channel.info()
    }

    pub async fn broadcast(&self, context: &Context) -> Result<()> {
        self.channel.broadcast(context).await
    }

    pub async fn get_current_context(&self, context_type: Option<&str>) -> Result<Option<Context>> {
        self.channel.get_current_context(context_type).await
    }

    pub async fn add_context_listener<H>(
        &self,
        context_type: Option<&str>,
        handler: H,
    ) -> Result<Listener>
    where
        H: FnMut(Context, Option<AppIdentifier>) + Send + 'static,
    {
        self.channel.add_context_listener(context_type, handler).await
    }

    /// Subscribes to this channel's membership events; `None` subscribes to
    /// all of them.
    pub async fn add_event_listener<H>(
        &self,
        event_type: Option<PrivateChannelEventType>,
        mut handler: H,
    ) -> Result<Listener>
    where
        H: FnMut(PrivateChannelEvent) + Send + 'static,
    {
        let agent = &self.channel.agent;
        let local_key = new_uuid();
        let channel_id = self.channel.info.id.clone();
        agent.inner.correlator.add_event_callback(
            &local_key,
            Box::new(move |message| {
                let event = match message.kind.as_str() {
                    kinds::PRIVATE_CHANNEL_ON_ADD_CONTEXT_LISTENER_EVENT => message
                        .payload_as::<protocol::PrivateChannelOnAddContextListenerEvent>()
                        .ok()
                        .filter(|e| e.private_channel_id == channel_id)
                        .map(|e| PrivateChannelEvent::AddContextListener {
                            context_type: e.context_type,
                        }),
                    kinds::PRIVATE_CHANNEL_ON_UNSUBSCRIBE_EVENT => message
                        .payload_as::<protocol::PrivateChannelOnUnsubscribeEvent>()
                        .ok()
                        .filter(|e| e.private_channel_id == channel_id)
                        .map(|e| PrivateChannelEvent::Unsubscribe {
                            context_type: e.context_type,
                        }),
                    kinds::PRIVATE_CHANNEL_ON_DISCONNECT_EVENT => message
                        .payload_as::<protocol::PrivateChannelOnDisconnectEvent>()
                        .ok()
                        .filter(|e| e.private_channel_id == channel_id)
                        .map(|_| PrivateChannelEvent::Disconnect),
                    _ => None,
                };
                let Some(event) = event else { return };
                let wanted = match event_type {
                    None => true,
                    Some(PrivateChannelEventType::AddContextListener) => {
                        matches!(event, PrivateChannelEvent::AddContextListener { .. })
                    }
                    Some(PrivateChannelEventType::Unsubscribe) => {
                        matches!(event, PrivateChannelEvent::Unsubscribe { .. })
                    }
                    Some(PrivateChannelEventType::Disconnect) => {
                        matches!(event, PrivateChannelEvent::Disconnect)
                    }
                };
                if wanted {
                    handler(event);
                }
            }),
        );
        let response: Result<protocol::ListenerResponse> = agent
            .call(
                kinds::PRIVATE_CHANNEL_ADD_EVENT_LISTENER_REQUEST,
                kinds::PRIVATE_CHANNEL_ADD_EVENT_LISTENER_RESPONSE,
                protocol::PrivateChannelAddEventListenerRequest {
                    private_channel_id: self.channel.info.id.clone(),
                    listener_type: event_type
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_else(|| protocol::ALL_EVENTS.to_string()),
                },
            )
            .await;
        match response {
            Ok(response) => Ok(Listener::new(
                agent.clone(),
                response.listener_uuid,
                local_key,
                kinds::PRIVATE_CHANNEL_UNSUBSCRIBE_EVENT_LISTENER_REQUEST,
                kinds::PRIVATE_CHANNEL_UNSUBSCRIBE_EVENT_LISTENER_RESPONSE,
            )),
            Err(error) => {
                agent.inner.correlator.remove_event_callback(&local_key);
                Err(error)
            }
        }
    }

    pub async fn on_add_context_listener<H>(&self, handler: H) -> Result<Listener>
    where
        H: FnMut(PrivateChannelEvent) + Send + 'static,
    {
        self.add_event_listener(Some(PrivateChannelEventType::AddContextListener), handler)
            .await
    }

    pub async fn on_unsubscribe<H>(&self, handler: H) -> Result<Listener>
    where
        H: FnMut(PrivateChannelEvent) + Send + 'static,
    {
        self.add_event_listener(Some(PrivateChannelEventType::Unsubscribe), handler)
            .await
    }

    pub async fn on_disconnect<H>(&self, handler: H) -> Result<Listener>
    where
        H: FnMut(PrivateChannelEvent) + Send + 'static,
    {
        self.add_event_listener(Some(PrivateChannelEventType::Disconnect), handler)
            .await
    }

    /// Withdraws this app from the channel: its context listeners are
    /// unsubscribed and the other members are told.
    pub async fn disconnect(&self) -> Result<()> {
        self.channel
            .agent
            .call_value(
                kinds::PRIVATE_CHANNEL_DISCONNECT_REQUEST,
                kinds::PRIVATE_CHANNEL_DISCONNECT_RESPONSE,
                protocol::PrivateChannelDisconnectRequest {
                    channel_id: self.channel.info.id.clone(),
                },
            )
            .await
            .map(|_| ())
    }
}

/// The raiser's view of an in-flight intent: which instance got it, and the
/// eventual result.
pub struct IntentResolution {
    source: AppIdentifier,
    intent: String,
    agent: DesktopAgent,
    result: SyncMutex<Option<oneshot::Receiver<Result<Value>>>>,
}

/// What an intent resolved to on the raiser's side.
#[derive(Clone, Debug)]
pub enum IntentResult {
    Context(Context),
    Channel(Channel),
}

impl IntentResolution {
    /// The instance the intent was delivered to.
    pub fn source(&self) -> &AppIdentifier {
        &self.source
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    /// Resolves once the handler's result arrives. Consumes the pending
    /// result; a second call reports a protocol error.
    pub async fn get_result(&self) -> Result<Option<IntentResult>> {
        let rx = self
            .result
            .lock()
            .expect("lock poisoned")
            .take()
            .ok_or_else(|| Error::Protocol("intent result already consumed".into()))?;
        let value = await_settled(rx, self.agent.inner.timeout).await?;
        let response: protocol::RaiseIntentResultResponse = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("bad intent result payload: {e}")))?;
        if let Some(info) = response.intent_result.channel {
            return Ok(Some(IntentResult::Channel(Channel {
                info,
                agent: self.agent.clone(),
            })));
        }
        match response.intent_result.context {
            Some(value) => Ok(Some(IntentResult::Context(Context::new(value)?))),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for IntentResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentResolution")
            .field("source", &self.source)
            .field("intent", &self.intent)
            .finish_non_exhaustive()
    }
}
