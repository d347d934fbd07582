//! Request/response correlation for the proxy side of the protocol.
//!
//! Sending a request registers a pending entry keyed by its `requestUuid`;
//! an inbound message settles an entry only when the UUID matches *and* the
//! entry's type guard accepts the message kind. Everything else is ignored
//! without error, so stray or late responses cannot settle the wrong caller.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex},
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{message::Message, Error, Result};

/// Accepts or rejects a message kind for one pending request.
pub(crate) type ResponseGuard = Box<dyn Fn(&str) -> bool + Send>;

/// Receives raw event messages; each callback does its own filtering.
pub(crate) type EventCallback = Box<dyn FnMut(&Message) + Send>;

struct Pending {
    guard: ResponseGuard,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
pub(crate) struct Correlator {
    // A single request uuid may legitimately await several responses of
    // different kinds (a raised intent awaits both the resolution and the
    // eventual result), hence the Vec.
    pending: SyncMutex<HashMap<String, Vec<Pending>>>,
    callbacks: SyncMutex<HashMap<String, Arc<SyncMutex<EventCallback>>>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers interest in a response to `request_uuid` whose kind passes
    /// `guard`.
    pub(crate) fn expect_response(
        &self,
        request_uuid: &str,
        guard: ResponseGuard,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("lock poisoned")
            .entry(request_uuid.to_string())
            .or_default()
            .push(Pending { guard, tx });
        rx
    }

    /// Routes one inbound message: responses settle a matching pending
    /// entry, events fan out to every registered callback.
    pub(crate) fn deliver(&self, message: &Message) {
        if let Some(request_uuid) = message.meta.request_uuid.as_deref() {
            self.deliver_response(request_uuid, message);
        } else if message.meta.event_uuid.is_some() {
            self.deliver_event(message);
        } else {
            warn!(kind = %message.kind, "dropping message with neither requestUuid nor eventUuid");
        }
    }

    fn deliver_response(&self, request_uuid: &str, message: &Message) {
        let entry = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            match pending.get_mut(request_uuid) {
                Some(waiters) => {
                    let matched = waiters.iter().position(|p| (p.guard)(&message.kind));
                    let entry = matched.map(|i| waiters.remove(i));
                    if waiters.is_empty() {
                        pending.remove(request_uuid);
                    }
                    entry
                }
                None => None,
            }
        };
        match entry {
            Some(Pending { tx, .. }) => {
                let result = match message.error_code() {
                    Some(code) => Err(Error::from_wire_code(code)),
                    None => Ok(message.payload.clone()),
                };
                // The receiver may have been dropped by a timed-out caller.
                let _ = tx.send(result);
            }
            None => {
                debug!(kind = %message.kind, request_uuid, "ignoring unmatched response");
            }
        }
    }

    fn deliver_event(&self, message: &Message) {
        let callbacks: Vec<_> = self
            .callbacks
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            (callback.lock().expect("lock poisoned"))(message);
        }
    }

    /// Registers an event callback under a listener uuid.
    pub(crate) fn add_event_callback(&self, listener_uuid: &str, callback: EventCallback) {
        self.callbacks
            .lock()
            .expect("lock poisoned")
            .insert(listener_uuid.to_string(), Arc::new(SyncMutex::new(callback)));
    }

    pub(crate) fn remove_event_callback(&self, listener_uuid: &str) {
        self.callbacks
            .lock()
            .expect("lock poisoned")
            .remove(listener_uuid);
    }

    /// Rejects every pending request, used when the transport goes away.
    pub(crate) fn fail_all(&self, error: Error) {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .expect("lock poisoned")
            .drain()
            .flat_map(|(_, waiters)| waiters)
            .collect();
        for Pending { tx, .. } in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::new_uuid;
    use serde_json::json;

    fn response(request_uuid: &str, kind: &str, payload: Value) -> Message {
        let request = Message::request("probeRequest", None, json!({})).unwrap();
        let mut response = Message::response_to(&request, kind, payload).unwrap();
        response.meta.request_uuid = Some(request_uuid.to_string());
        response
    }

    #[tokio::test]
    async fn matching_response_resolves_exactly_once() {
        let correlator = Correlator::new();
        let uuid = new_uuid();
        let rx = correlator.expect_response(&uuid, Box::new(|k| k == "broadcastResponse"));

        correlator.deliver(&response(&uuid, "broadcastResponse", json!({"ok": true})));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));

        // A duplicate arriving later has nobody left to settle; silently dropped.
        correlator.deliver(&response(&uuid, "broadcastResponse", json!({})));
    }

    #[tokio::test]
    async fn stray_uuid_neither_resolves_nor_rejects() {
        let correlator = Correlator::new();
        let uuid = new_uuid();
        let mut rx = correlator.expect_response(&uuid, Box::new(|k| k == "broadcastResponse"));

        correlator.deliver(&response(&new_uuid(), "broadcastResponse", json!({})));
        assert!(rx.try_recv().is_err());

        // The real response still lands afterwards.
        correlator.deliver(&response(&uuid, "broadcastResponse", json!({"n": 1})));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn guard_rejection_leaves_the_entry_pending() {
        let correlator = Correlator::new();
        let uuid = new_uuid();
        let mut rx =
            correlator.expect_response(&uuid, Box::new(|k| k == "raiseIntentResultResponse"));

        correlator.deliver(&response(&uuid, "raiseIntentResponse", json!({})));
        assert!(rx.try_recv().is_err());

        correlator.deliver(&response(&uuid, "raiseIntentResultResponse", json!({})));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn two_waiters_on_one_uuid_settle_independently() {
        let correlator = Correlator::new();
        let uuid = new_uuid();
        let first = correlator.expect_response(&uuid, Box::new(|k| k == "raiseIntentResponse"));
        let second =
            correlator.expect_response(&uuid, Box::new(|k| k == "raiseIntentResultResponse"));

        correlator.deliver(&response(&uuid, "raiseIntentResponse", json!({"a": 1})));
        correlator.deliver(&response(&uuid, "raiseIntentResultResponse", json!({"b": 2})));

        assert_eq!(first.await.unwrap().unwrap(), json!({"a": 1}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"b": 2}));
    }

    #[tokio::test]
    async fn error_payload_rejects_with_the_wire_code() {
        let correlator = Correlator::new();
        let uuid = new_uuid();
        let rx = correlator.expect_response(&uuid, Box::new(|k| k == "broadcastResponse"));

        correlator.deliver(&response(
            &uuid,
            "broadcastResponse",
            json!({"error": "AccessDenied"}),
        ));
        assert_eq!(rx.await.unwrap(), Err(Error::AccessDenied));
    }

    #[tokio::test]
    async fn events_reach_every_callback() {
        let correlator = Correlator::new();
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        for name in ["a", "b"] {
            let seen = seen.clone();
            let name = name.to_string();
            correlator.add_event_callback(
                &new_uuid(),
                Box::new(move |msg| {
                    seen.lock().unwrap().push((name.clone(), msg.kind.clone()));
                }),
            );
        }
        correlator.deliver(&Message::event("channelChangedEvent", json!({})).unwrap());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fail_all_rejects_pending_requests() {
        let correlator = Correlator::new();
        let rx = correlator.expect_response(&new_uuid(), Box::new(|_| true));
        correlator.fail_all(Error::Disconnected);
        assert_eq!(rx.await.unwrap(), Err(Error::Disconnected));
    }
}
