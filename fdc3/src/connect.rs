//! Proxy-side connection establishment: the discovery procedure an app runs
//! to find its desktop agent.
//!
//! The procedure tries, concurrently, the agent handle published on the
//! app's own window and a `WCP1Hello` handshake with every enclosing window;
//! whichever produces an agent first wins. When neither does within the
//! timeout, an optional failover handler gets the last word.

use std::time::Duration;

use futures_core::future::BoxFuture;
use futures_util::{future::Shared, FutureExt};
use tracing::{debug, warn};

use crate::{
    agent::DesktopAgent,
    message::{new_uuid, Message},
    protocol::{self, kinds},
    transport::{Window, WindowMessage},
    Error, Result,
};

/// What a failover handler may produce once discovery times out.
pub enum FailoverResult {
    /// A working agent, adopted as the discovery result.
    Agent(DesktopAgent),
    /// A window expected to host an agent. Not currently supported; the
    /// discovery fails with [`Error::FailoverWindowNotSupported`].
    Window(Window),
}

/// Invoked when no agent answered within the timeout.
pub type FailoverHandler =
    Box<dyn Fn() -> BoxFuture<'static, Option<FailoverResult>> + Send + Sync>;

/// Tuning for [`get_agent`].
pub struct GetAgentParams {
    /// How long to wait for an agent before giving up or failing over.
    pub timeout: Duration,
    /// Timeout applied to individual requests on the connected agent.
    pub request_timeout: Option<Duration>,
    pub failover: Option<FailoverHandler>,
}

impl Default for GetAgentParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(750),
            request_timeout: Some(Duration::from_secs(10)),
            failover: None,
        }
    }
}

impl GetAgentParams {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn failover(mut self, failover: FailoverHandler) -> Self {
        self.failover = Some(failover);
        self
    }
}

pub(crate) type AgentPromise = Shared<BoxFuture<'static, Result<DesktopAgent>>>;

/// Discovers the desktop agent for an app hosted in `window`.
///
/// The first call starts a discovery attempt and caches it on the window;
/// later calls share the same attempt (and outcome), whatever parameters
/// they bring. [`Window::reset_agent_promise`] drops the cache.
pub async fn get_agent(window: &Window, params: GetAgentParams) -> Result<DesktopAgent> {
    let attempt = {
        let mut cache = window.agent_promise().lock().expect("lock poisoned");
        match cache.as_ref() {
            Some(existing) => {
                warn!(
                    url = window.url(),
                    "agent discovery already started for this window, ignoring fresh parameters"
                );
                existing.clone()
            }
            None => {
                let attempt = discover(window.clone(), params).boxed().shared();
                *cache = Some(attempt.clone());
                attempt
            }
        }
    };
    attempt.await
}

async fn discover(window: Window, params: GetAgentParams) -> Result<DesktopAgent> {
    if let Some(agent) = window.agent() {
        return Ok(agent);
    }

    let connection_attempt_uuid = new_uuid();
    let mut inbox = window.take_inbox();

    let mut hello = Message::event(
        kinds::WCP1_HELLO,
        protocol::Wcp1Hello {
            actual_url: window.url().to_string(),
            fdc3_version: protocol::FDC3_VERSION.to_string(),
        },
    )?;
    hello.meta.event_uuid = None;
    hello.meta.connection_attempt_uuid = Some(connection_attempt_uuid.clone());
    for ancestor in window.ancestors() {
        ancestor.post_message(hello.clone(), None, Some(&window));
    }

    let request_timeout = params.request_timeout;
    let handshake = async {
        match inbox.as_mut() {
            Some(inbox) => {
                await_acceptance(inbox, &connection_attempt_uuid, request_timeout).await
            }
            None => {
                warn!(url = window.url(), "window inbox already claimed, relying on fdc3Ready");
                std::future::pending().await
            }
        }
    };

    let connected = tokio::time::timeout(params.timeout, async {
        tokio::select! {
            agent = window.agent_ready() => Ok(agent),
            result = handshake => result,
        }
    })
    .await;

    // Give the inbox back so a reset window can run discovery again.
    if let Some(inbox) = inbox.take() {
        window.restore_inbox(inbox);
    }

    match connected {
        Ok(result) => result,
        Err(_) => match &params.failover {
            Some(failover) => match failover().await {
                Some(FailoverResult::Agent(agent)) => Ok(agent),
                Some(FailoverResult::Window(_)) => Err(Error::FailoverWindowNotSupported),
                None => Err(Error::AgentNotFound),
            },
            None => Err(Error::AgentNotFound),
        },
    }
}

/// Waits for an acceptance matching this attempt carrying exactly one
/// transferred port. Anything else is ignored.
async fn await_acceptance(
    inbox: &mut tokio::sync::mpsc::UnboundedReceiver<WindowMessage>,
    connection_attempt_uuid: &str,
    request_timeout: Option<Duration>,
) -> Result<DesktopAgent> {
    loop {
        let Some(incoming) = inbox.recv().await else {
            // Nobody can answer any more; leave it to the timeout.
            std::future::pending::<()>().await;
            unreachable!()
        };
        if incoming.message.kind != kinds::WCP1_ACCEPTED {
            debug!(kind = %incoming.message.kind, "ignoring non-acceptance during discovery");
            continue;
        }
        if incoming.message.meta.connection_attempt_uuid.as_deref()
            != Some(connection_attempt_uuid)
        {
            debug!("acceptance for another connection attempt, ignoring");
            continue;
        }
        let Some(port) = incoming.port else {
            debug!("acceptance without a transferred port, ignoring");
            continue;
        };
        let accepted: protocol::Wcp1Accepted = match incoming.message.payload_as() {
            Ok(accepted) => accepted,
            Err(error) => {
                debug!(%error, "malformed acceptance, ignoring");
                continue;
            }
        };
        return DesktopAgent::connect(accepted.app_identifier, port, request_timeout);
    }
}
