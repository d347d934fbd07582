//! An [FDC3 2.x] desktop agent: the coordination engine that lets
//! independent applications in one user session discover each other,
//! exchange typed contexts over named channels, and raise intents another
//! application resolves.
//!
//! One page hosts the authoritative [`RootAgent`]; every participating app
//! embeds a proxy that discovers the root with [`get_agent`] and then speaks
//! the JSON message protocol over a dedicated port. The two sides of the
//! contract are symmetric: the handle the root publishes for its own page
//! and the handle a remote app obtains expose the identical
//! [`DesktopAgent`] surface.
//!
//! # Example
//!
//! ```no_run
//! use fdc3::{get_agent, GetAgentParams, RootAgent, Window};
//! use serde_json::json;
//!
//! # async fn run() -> fdc3::Result<()> {
//! let host = Window::new("https://workspace.example.com/");
//! let root = RootAgent::builder(&host).build().await?;
//!
//! let frame = host.child("https://charts.example.com/");
//! let agent = get_agent(&frame, GetAgentParams::default()).await?;
//!
//! agent.join_user_channel("fdc3.channel.1").await?;
//! let context = fdc3::Context::new(json!({
//!     "type": "fdc3.instrument",
//!     "id": { "ticker": "AAPL" },
//! }))?;
//! agent.broadcast(&context).await?;
//! # drop(root);
//! # Ok(())
//! # }
//! ```
//!
//! [FDC3 2.x]: https://fdc3.finos.org/

#![warn(rust_2018_idioms)]

mod agent;
mod channels;
mod connect;
mod correlation;
mod directory;
mod error;
mod events;
mod heartbeat;
mod message;
mod protocol;
mod resolver;
mod root;
mod transport;
mod types;

pub use agent::{
    AgentEvent, Channel, DesktopAgent, IntentHandlerResult, IntentResolution, IntentResult,
    Listener, PrivateChannel, PrivateChannelEvent,
};
pub use connect::{get_agent, FailoverHandler, FailoverResult, GetAgentParams};
pub use directory::DirectoryLoader;
pub use error::{Error, Result};
pub use heartbeat::HeartbeatConfig;
pub use message::{Message, MessageMeta};
pub use protocol::{PrivateChannelEventType, ALL_EVENTS, FDC3_VERSION, USER_CHANNEL_CHANGED};
pub use resolver::{
    AppLauncher, IntentAppChoice, IntentResolver, ResolveForContext, ResolveForIntent,
};
pub use root::{RootAgent, RootAgentBuilder};
pub use transport::{MessagePort, Window, WindowMessage};
pub use types::{
    recommended_user_channels, AppDetails, AppDirectoryEntry, AppIdentifier, AppIntent,
    AppMetadata, ChannelInfo, ChannelType, Context, DisplayMetadata,
    FullyQualifiedAppIdentifier, Icon, ImplementationMetadata, IntentDeclaration, IntentMetadata,
    Interop, InteropIntents, Screenshot,
};

/// Wire message kinds and payload shapes, exposed for protocol-level
/// integrations and tests.
pub mod wire {
    pub use crate::protocol::{
        kinds, AddContextListenerRequest, AddEventListenerRequest, AddIntentListenerRequest,
        BroadcastEvent, BroadcastRequest, ChannelChangedEvent, CreatePrivateChannelResponse,
        FindInstancesRequest, FindInstancesResponse, FindIntentRequest, FindIntentResponse,
        FindIntentsByContextRequest, FindIntentsByContextResponse, GetAppMetadataRequest,
        GetAppMetadataResponse, GetCurrentChannelResponse, GetCurrentContextRequest,
        GetCurrentContextResponse, GetInfoResponse, GetOrCreateChannelRequest,
        GetOrCreateChannelResponse, GetUserChannelsResponse, HeartbeatAcknowledgementRequest,
        IntentEvent, IntentResolutionPayload, IntentResultPayload, IntentResultRequest,
        JoinUserChannelRequest, ListenerResponse, ListenerUnsubscribeRequest, OpenRequest,
        OpenResponse, PrivateChannelAddEventListenerRequest, PrivateChannelDisconnectRequest,
        PrivateChannelOnAddContextListenerEvent, PrivateChannelOnDisconnectEvent,
        PrivateChannelOnUnsubscribeEvent, RaiseIntentForContextRequest, RaiseIntentRequest,
        RaiseIntentResponse, RaiseIntentResultResponse, Wcp1Accepted, Wcp1Hello,
    };
}
