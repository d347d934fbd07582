//! Registry of desktop-agent event listeners, maintained root-side across
//! all proxies. The channel engine consults it before publishing
//! `channelChangedEvent`.

use crate::{message::new_uuid, protocol::ALL_EVENTS, types::FullyQualifiedAppIdentifier};

#[derive(Clone, Debug)]
struct EventListenerRecord {
    source: FullyQualifiedAppIdentifier,
    listener_uuid: String,
    /// An FDC3 event name, or [`ALL_EVENTS`].
    event_type: String,
}

#[derive(Default)]
pub(crate) struct EventListenerRegistry {
    entries: Vec<EventListenerRecord>,
}

impl EventListenerRegistry {
    pub(crate) fn add(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
        event_type: &str,
    ) -> String {
        let listener_uuid = new_uuid();
        self.entries.push(EventListenerRecord {
            source: source.clone(),
            listener_uuid: listener_uuid.clone(),
            event_type: event_type.to_string(),
        });
        listener_uuid
    }

    pub(crate) fn remove(&mut self, listener_uuid: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.listener_uuid != listener_uuid);
        self.entries.len() != before
    }

    /// Whether `instance_id` holds a listener matching `event_type`.
    pub(crate) fn wants(&self, instance_id: &str, event_type: &str) -> bool {
        self.entries.iter().any(|e| {
            e.source.instance_id == instance_id
                && (e.event_type == ALL_EVENTS || e.event_type == event_type)
        })
    }

    pub(crate) fn remove_instance(&mut self, instance_id: &str) {
        self.entries.retain(|e| e.source.instance_id != instance_id);
    }
}
