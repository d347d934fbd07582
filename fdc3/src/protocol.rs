//! Message kinds and typed payloads of the agent wire protocol.
//!
//! Each request kind has a matching response kind; the dispatcher on the root
//! side and the facade on the proxy side both name messages through these
//! constants so the two ends cannot drift apart.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    AppIdentifier, AppIntent, AppMetadata, ChannelInfo, FullyQualifiedAppIdentifier,
    ImplementationMetadata,
};
use crate::{Error, Result};

/// The FDC3 standard version this agent implements.
pub const FDC3_VERSION: &str = "2.1";

pub mod kinds {
    //! Wire `type` discriminators.

    pub const WCP1_HELLO: &str = "WCP1Hello";
    pub const WCP1_ACCEPTED: &str = "WCP1Accepted";

    pub const GET_USER_CHANNELS_REQUEST: &str = "getUserChannelsRequest";
    pub const GET_USER_CHANNELS_RESPONSE: &str = "getUserChannelsResponse";
    pub const JOIN_USER_CHANNEL_REQUEST: &str = "joinUserChannelRequest";
    pub const JOIN_USER_CHANNEL_RESPONSE: &str = "joinUserChannelResponse";
    pub const GET_CURRENT_CHANNEL_REQUEST: &str = "getCurrentChannelRequest";
    pub const GET_CURRENT_CHANNEL_RESPONSE: &str = "getCurrentChannelResponse";
    pub const LEAVE_CURRENT_CHANNEL_REQUEST: &str = "leaveCurrentChannelRequest";
    pub const LEAVE_CURRENT_CHANNEL_RESPONSE: &str = "leaveCurrentChannelResponse";
    pub const GET_OR_CREATE_CHANNEL_REQUEST: &str = "getOrCreateChannelRequest";
    pub const GET_OR_CREATE_CHANNEL_RESPONSE: &str = "getOrCreateChannelResponse";
    pub const CREATE_PRIVATE_CHANNEL_REQUEST: &str = "createPrivateChannelRequest";
    pub const CREATE_PRIVATE_CHANNEL_RESPONSE: &str = "createPrivateChannelResponse";

    pub const ADD_CONTEXT_LISTENER_REQUEST: &str = "addContextListenerRequest";
    pub const ADD_CONTEXT_LISTENER_RESPONSE: &str = "addContextListenerResponse";
    pub const CONTEXT_LISTENER_UNSUBSCRIBE_REQUEST: &str = "contextListenerUnsubscribeRequest";
    pub const CONTEXT_LISTENER_UNSUBSCRIBE_RESPONSE: &str = "contextListenerUnsubscribeResponse";
    pub const BROADCAST_REQUEST: &str = "broadcastRequest";
    pub const BROADCAST_RESPONSE: &str = "broadcastResponse";
    pub const GET_CURRENT_CONTEXT_REQUEST: &str = "getCurrentContextRequest";
    pub const GET_CURRENT_CONTEXT_RESPONSE: &str = "getCurrentContextResponse";

    pub const PRIVATE_CHANNEL_ADD_EVENT_LISTENER_REQUEST: &str =
        "privateChannelAddEventListenerRequest";
    pub const PRIVATE_CHANNEL_ADD_EVENT_LISTENER_RESPONSE: &str =
        "privateChannelAddEventListenerResponse";
    pub const PRIVATE_CHANNEL_UNSUBSCRIBE_EVENT_LISTENER_REQUEST: &str =
        "privateChannelUnsubscribeEventListenerRequest";
    pub const PRIVATE_CHANNEL_UNSUBSCRIBE_EVENT_LISTENER_RESPONSE: &str =
        "privateChannelUnsubscribeEventListenerResponse";
    pub const PRIVATE_CHANNEL_DISCONNECT_REQUEST: &str = "privateChannelDisconnectRequest";
    pub const PRIVATE_CHANNEL_DISCONNECT_RESPONSE: &str = "privateChannelDisconnectResponse";

    pub const ADD_INTENT_LISTENER_REQUEST: &str = "addIntentListenerRequest";
    pub const ADD_INTENT_LISTENER_RESPONSE: &str = "addIntentListenerResponse";
    pub const INTENT_LISTENER_UNSUBSCRIBE_REQUEST: &str = "intentListenerUnsubscribeRequest";
    pub const INTENT_LISTENER_UNSUBSCRIBE_RESPONSE: &str = "intentListenerUnsubscribeResponse";
    pub const RAISE_INTENT_REQUEST: &str = "raiseIntentRequest";
    pub const RAISE_INTENT_RESPONSE: &str = "raiseIntentResponse";
    pub const RAISE_INTENT_FOR_CONTEXT_REQUEST: &str = "raiseIntentForContextRequest";
    pub const RAISE_INTENT_FOR_CONTEXT_RESPONSE: &str = "raiseIntentForContextResponse";
    pub const RAISE_INTENT_RESULT_RESPONSE: &str = "raiseIntentResultResponse";
    pub const INTENT_RESULT_REQUEST: &str = "intentResultRequest";
    pub const INTENT_RESULT_RESPONSE: &str = "intentResultResponse";
    pub const FIND_INTENT_REQUEST: &str = "findIntentRequest";
    pub const FIND_INTENT_RESPONSE: &str = "findIntentResponse";
    pub const FIND_INTENTS_BY_CONTEXT_REQUEST: &str = "findIntentsByContextRequest";
    pub const FIND_INTENTS_BY_CONTEXT_RESPONSE: &str = "findIntentsByContextResponse";
    pub const FIND_INSTANCES_REQUEST: &str = "findInstancesRequest";
    pub const FIND_INSTANCES_RESPONSE: &str = "findInstancesResponse";
    pub const GET_APP_METADATA_REQUEST: &str = "getAppMetadataRequest";
    pub const GET_APP_METADATA_RESPONSE: &str = "getAppMetadataResponse";
    pub const OPEN_REQUEST: &str = "openRequest";
    pub const OPEN_RESPONSE: &str = "openResponse";
    pub const GET_INFO_REQUEST: &str = "getInfoRequest";
    pub const GET_INFO_RESPONSE: &str = "getInfoResponse";

    pub const ADD_EVENT_LISTENER_REQUEST: &str = "addEventListenerRequest";
    pub const ADD_EVENT_LISTENER_RESPONSE: &str = "addEventListenerResponse";
    pub const EVENT_LISTENER_UNSUBSCRIBE_REQUEST: &str = "eventListenerUnsubscribeRequest";
    pub const EVENT_LISTENER_UNSUBSCRIBE_RESPONSE: &str = "eventListenerUnsubscribeResponse";

    pub const HEARTBEAT_EVENT: &str = "heartbeatEvent";
    pub const HEARTBEAT_ACKNOWLEDGEMENT_REQUEST: &str = "heartbeatAcknowledgementRequest";

    pub const BROADCAST_EVENT: &str = "broadcastEvent";
    pub const CHANNEL_CHANGED_EVENT: &str = "channelChangedEvent";
    pub const INTENT_EVENT: &str = "intentEvent";
    pub const PRIVATE_CHANNEL_ON_ADD_CONTEXT_LISTENER_EVENT: &str =
        "privateChannelOnAddContextListenerEvent";
    pub const PRIVATE_CHANNEL_ON_UNSUBSCRIBE_EVENT: &str = "privateChannelOnUnsubscribeEvent";
    pub const PRIVATE_CHANNEL_ON_DISCONNECT_EVENT: &str = "privateChannelOnDisconnectEvent";
}

/// The `userChannelChanged` event name.
pub const USER_CHANNEL_CHANGED: &str = "userChannelChanged";
/// The meta event type matching every event.
pub const ALL_EVENTS: &str = "allEvents";

// ---- WCP handshake ----

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wcp1Hello {
    pub actual_url: String,
    pub fdc3_version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wcp1Accepted {
    pub fdc3_version: String,
    pub app_identifier: FullyQualifiedAppIdentifier,
}

// ---- Channel operations ----

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUserChannelsResponse {
    pub user_channels: Vec<ChannelInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinUserChannelRequest {
    pub channel_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCurrentChannelResponse {
    pub channel: Option<ChannelInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOrCreateChannelRequest {
    pub channel_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOrCreateChannelResponse {
    pub channel: ChannelInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrivateChannelResponse {
    pub private_channel: ChannelInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddContextListenerRequest {
    pub channel_id: Option<String>,
    pub context_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerResponse {
    pub listener_uuid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerUnsubscribeRequest {
    pub listener_uuid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    /// `None` broadcasts to the user channel the caller is currently joined
    /// to; a no-op when it has not joined one.
    pub channel_id: Option<String>,
    pub context: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCurrentContextRequest {
    pub channel_id: String,
    pub context_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCurrentContextResponse {
    pub context: Option<Value>,
}

/// The private-channel event classes an app can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrivateChannelEventType {
    AddContextListener,
    Unsubscribe,
    Disconnect,
}

impl PrivateChannelEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivateChannelEventType::AddContextListener => "addContextListener",
            PrivateChannelEventType::Unsubscribe => "unsubscribe",
            PrivateChannelEventType::Disconnect => "disconnect",
        }
    }
}

/// The wire `listenerType` is non-nullable; `"allEvents"` is the explicit
/// match-everything value. Engine-side the same choice is an
/// `Option<PrivateChannelEventType>` with `None` for all events, and this is
/// where the two representations meet: any other string is rejected.
pub fn parse_private_listener_type(s: &str) -> Result<Option<PrivateChannelEventType>> {
    match s {
        ALL_EVENTS => Ok(None),
        "addContextListener" => Ok(Some(PrivateChannelEventType::AddContextListener)),
        "unsubscribe" => Ok(Some(PrivateChannelEventType::Unsubscribe)),
        "disconnect" => Ok(Some(PrivateChannelEventType::Disconnect)),
        other => Err(Error::Protocol(format!(
            "unknown private channel listener type {other:?}"
        ))),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChannelAddEventListenerRequest {
    pub private_channel_id: String,
    pub listener_type: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChannelDisconnectRequest {
    pub channel_id: String,
}

// ---- Intent operations ----

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddIntentListenerRequest {
    pub intent: String,
    /// Context types the handler accepts; empty accepts any.
    #[serde(default)]
    pub context_types: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseIntentRequest {
    pub intent: String,
    pub context: Value,
    pub app: Option<AppIdentifier>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseIntentForContextRequest {
    pub context: Value,
    pub app: Option<AppIdentifier>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResolutionPayload {
    pub source: AppIdentifier,
    pub intent: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseIntentResponse {
    pub intent_resolution: IntentResolutionPayload,
}

/// A handler's result: a context, a channel, or nothing at all.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResultPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResultRequest {
    pub intent_event_uuid: String,
    pub raise_intent_request_uuid: String,
    #[serde(default)]
    pub intent_result: IntentResultPayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseIntentResultResponse {
    #[serde(default)]
    pub intent_result: IntentResultPayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindIntentRequest {
    pub intent: String,
    pub context: Option<Value>,
    pub result_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindIntentResponse {
    pub app_intent: AppIntent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindIntentsByContextRequest {
    pub context: Value,
    pub result_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindIntentsByContextResponse {
    pub app_intents: Vec<AppIntent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindInstancesRequest {
    pub app: AppIdentifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindInstancesResponse {
    pub app_identifiers: Vec<AppIdentifier>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAppMetadataRequest {
    pub app: AppIdentifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAppMetadataResponse {
    pub app_metadata: AppMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    pub app: AppIdentifier,
    pub context: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenResponse {
    pub app_identifier: AppIdentifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInfoResponse {
    pub implementation_metadata: ImplementationMetadata,
}

// ---- Desktop-agent events ----

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddEventListenerRequest {
    /// `None` subscribes to every event type.
    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelChangedEvent {
    pub new_channel_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub channel_id: Option<String>,
    pub context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub originating_app: Option<AppIdentifier>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentEvent {
    pub intent: String,
    pub context: Value,
    pub raise_intent_request_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub originating_app: Option<AppIdentifier>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChannelOnAddContextListenerEvent {
    pub private_channel_id: String,
    pub context_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChannelOnUnsubscribeEvent {
    pub private_channel_id: String,
    pub context_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChannelOnDisconnectEvent {
    pub private_channel_id: String,
}

// ---- Heartbeat ----

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAcknowledgementRequest {
    pub heartbeat_event_uuid: String,
}
