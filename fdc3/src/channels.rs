//! The channel state machine: user, app and private channel rosters, context
//! history, context-listener fan-out and private-channel access control.
//!
//! Every mutation happens root-side under the root's state lock; operations
//! return the derived events as [`Outbound`] values so the dispatcher can
//! publish the operation's response before any of them.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    events::EventListenerRegistry,
    message::{new_uuid, Message},
    protocol::{
        kinds, BroadcastEvent, ChannelChangedEvent, PrivateChannelEventType,
        PrivateChannelOnAddContextListenerEvent, PrivateChannelOnDisconnectEvent,
        PrivateChannelOnUnsubscribeEvent, USER_CHANNEL_CHANGED,
    },
    types::{recommended_user_channels, ChannelInfo, Context, FullyQualifiedAppIdentifier},
    Error, Result,
};

/// Sentinel key for listeners that follow whichever user channel their owner
/// is joined to.
const CURRENT_CHANNEL_KEY: &str = "currentChannel";

/// An event to be sent to one connected instance once the triggering
/// operation's response is on the wire.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub target: String,
    pub message: Message,
}

#[derive(Clone, Debug)]
struct ContextListenerRecord {
    listener_uuid: String,
    context_type: Option<String>,
    source: FullyQualifiedAppIdentifier,
}

#[derive(Clone, Debug)]
struct PrivateEventListenerRecord {
    listener_uuid: String,
    channel_id: String,
    /// `None` matches every private-channel event.
    event_type: Option<PrivateChannelEventType>,
    source: FullyQualifiedAppIdentifier,
}

#[derive(Clone, Debug)]
struct PrivateChannelRecord {
    info: ChannelInfo,
    allowed: Vec<FullyQualifiedAppIdentifier>,
}

#[derive(Clone, Debug)]
struct HistoryEntry {
    context: Value,
    author: FullyQualifiedAppIdentifier,
    seq: u64,
}

/// Per-channel context history: the latest context per type, plus enough
/// ordering to recompute the most recent entry after a scrub.
#[derive(Clone, Debug, Default)]
struct ContextHistory {
    by_type: BTreeMap<String, HistoryEntry>,
}

impl ContextHistory {
    fn record(&mut self, context_type: &str, entry: HistoryEntry) {
        self.by_type.insert(context_type.to_string(), entry);
    }

    fn most_recent(&self) -> Option<&Value> {
        self.by_type
            .values()
            .max_by_key(|e| e.seq)
            .map(|e| &e.context)
    }

    fn of_type(&self, context_type: &str) -> Option<&Value> {
        self.by_type.get(context_type).map(|e| &e.context)
    }

    /// Drops entries authored by `instance_id`; the most recent context is
    /// whatever remaining entry was recorded last.
    fn scrub(&mut self, instance_id: &str) {
        self.by_type
            .retain(|_, e| e.author.instance_id != instance_id);
    }
}

#[derive(Default)]
pub(crate) struct ChannelEngine {
    app_channels: BTreeMap<String, ChannelInfo>,
    private_channels: BTreeMap<String, PrivateChannelRecord>,
    /// instance id -> user channel id; at most one per instance.
    current_user_channel: BTreeMap<String, String>,
    /// channel id (or the current-channel sentinel) -> listeners in
    /// registration order.
    context_listeners: BTreeMap<String, Vec<ContextListenerRecord>>,
    private_event_listeners: Vec<PrivateEventListenerRecord>,
    histories: BTreeMap<String, ContextHistory>,
    seq: u64,
}

impl ChannelEngine {
    pub(crate) fn user_channel(&self, id: &str) -> Option<&'static ChannelInfo> {
        recommended_user_channels().iter().find(|c| c.id == id)
    }

    fn is_private(&self, id: &str) -> bool {
        self.private_channels.contains_key(id)
    }

    fn is_allowed(&self, id: &str, source: &FullyQualifiedAppIdentifier) -> bool {
        match self.private_channels.get(id) {
            Some(record) => record.allowed.iter().any(|a| a == source),
            None => true,
        }
    }

    // ---- user channels ----

    pub(crate) fn current_channel(&self, instance_id: &str) -> Option<ChannelInfo> {
        self.current_user_channel
            .get(instance_id)
            .and_then(|id| self.user_channel(id))
            .cloned()
    }

    pub(crate) fn join_user_channel(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
        channel_id: &str,
        events: &EventListenerRegistry,
    ) -> Result<Vec<Outbound>> {
        if self.user_channel(channel_id).is_none() {
            return Err(Error::NoChannelFound);
        }
        self.current_user_channel
            .insert(source.instance_id.clone(), channel_id.to_string());
        self.channel_changed_event(source, Some(channel_id), events)
    }

    pub(crate) fn leave_current_channel(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
        events: &EventListenerRegistry,
    ) -> Result<Vec<Outbound>> {
        self.current_user_channel.remove(&source.instance_id);
        self.channel_changed_event(source, None, events)
    }

    fn channel_changed_event(
        &self,
        source: &FullyQualifiedAppIdentifier,
        new_channel_id: Option<&str>,
        events: &EventListenerRegistry,
    ) -> Result<Vec<Outbound>> {
        if !events.wants(&source.instance_id, USER_CHANNEL_CHANGED) {
            return Ok(Vec::new());
        }
        Ok(vec![Outbound {
            target: source.instance_id.clone(),
            message: Message::event(
                kinds::CHANNEL_CHANGED_EVENT,
                ChannelChangedEvent {
                    new_channel_id: new_channel_id.map(str::to_string),
                },
            )?,
        }])
    }

    // ---- app and private channels ----

    pub(crate) fn get_or_create_channel(&mut self, id: &str) -> Result<ChannelInfo> {
        if self.is_private(id) {
            return Err(Error::AccessDenied);
        }
        Ok(self
            .app_channels
            .entry(id.to_string())
            .or_insert_with(|| ChannelInfo::app(id))
            .clone())
    }

    pub(crate) fn create_private_channel(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
    ) -> ChannelInfo {
        let info = ChannelInfo::private(new_uuid());
        self.private_channels.insert(
            info.id.clone(),
            PrivateChannelRecord {
                info: info.clone(),
                allowed: vec![source.clone()],
            },
        );
        info
    }

    /// Grants `app` access to a private channel, used when an intent result
    /// hands the channel to the raiser.
    pub(crate) fn add_to_allowed_list(
        &mut self,
        channel_id: &str,
        app: &FullyQualifiedAppIdentifier,
    ) {
        if let Some(record) = self.private_channels.get_mut(channel_id) {
            if !record.allowed.iter().any(|a| a == app) {
                record.allowed.push(app.clone());
            }
        }
    }

    // ---- context listeners ----

    pub(crate) fn add_context_listener(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
        channel_id: Option<&str>,
        context_type: Option<&str>,
    ) -> Result<(String, Vec<Outbound>)> {
        if let Some(id) = channel_id {
            if self.is_private(id) && !self.is_allowed(id, source) {
                return Err(Error::AccessDenied);
            }
        }
        let listener_uuid = new_uuid();
        let key = channel_id.unwrap_or(CURRENT_CHANNEL_KEY).to_string();
        self.context_listeners
            .entry(key)
            .or_default()
            .push(ContextListenerRecord {
                listener_uuid: listener_uuid.clone(),
                context_type: context_type.map(str::to_string),
                source: source.clone(),
            });

        let mut outbound = Vec::new();
        if let Some(id) = channel_id.filter(|id| self.is_private(id)) {
            outbound = self.private_channel_events(
                id,
                PrivateChannelEventType::AddContextListener,
                None,
                Message::event(
                    kinds::PRIVATE_CHANNEL_ON_ADD_CONTEXT_LISTENER_EVENT,
                    PrivateChannelOnAddContextListenerEvent {
                        private_channel_id: id.to_string(),
                        context_type: context_type.map(str::to_string),
                    },
                )?,
            );
        }
        Ok((listener_uuid, outbound))
    }

    /// Removes a context listener by uuid, firing the private-channel
    /// unsubscribe event when it lived on a private channel. Unknown uuids
    /// are a no-op (unsubscribe must stay idempotent).
    pub(crate) fn remove_context_listener(
        &mut self,
        listener_uuid: &str,
    ) -> Result<Vec<Outbound>> {
        let mut removed: Option<(String, ContextListenerRecord)> = None;
        for (key, listeners) in self.context_listeners.iter_mut() {
            if let Some(index) = listeners
                .iter()
                .position(|l| l.listener_uuid == listener_uuid)
            {
                removed = Some((key.clone(), listeners.remove(index)));
                break;
            }
        }
        let Some((key, record)) = removed else {
            return Ok(Vec::new());
        };
        if !self.is_private(&key) {
            return Ok(Vec::new());
        }
        Ok(self.private_channel_events(
            &key,
            PrivateChannelEventType::Unsubscribe,
            None,
            Message::event(
                kinds::PRIVATE_CHANNEL_ON_UNSUBSCRIBE_EVENT,
                PrivateChannelOnUnsubscribeEvent {
                    private_channel_id: key.clone(),
                    context_type: record.context_type.clone(),
                },
            )?,
        ))
    }

    // ---- broadcast and history ----

    /// Fans a context out to every matching listener except the origin, then
    /// appends it to the channel's history.
    ///
    /// `channel_id` of `None` targets the user channel the source is
    /// currently joined to, and quietly does nothing when it has not joined
    /// one.
    pub(crate) fn broadcast(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
        channel_id: Option<&str>,
        context: &Value,
    ) -> Result<Vec<Outbound>> {
        if !Context::is_valid(context) {
            return Err(Error::MalformedContext);
        }
        let channel_id = match channel_id {
            Some(id) => id.to_string(),
            None => match self.current_user_channel.get(&source.instance_id) {
                Some(id) => id.clone(),
                None => return Ok(Vec::new()),
            },
        };
        if self.is_private(&channel_id) && !self.is_allowed(&channel_id, source) {
            return Err(Error::AccessDenied);
        }

        let context_type = context
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let direct = self
            .context_listeners
            .get(&channel_id)
            .into_iter()
            .flatten();
        let following = self
            .context_listeners
            .get(CURRENT_CHANNEL_KEY)
            .into_iter()
            .flatten()
            .filter(|l| {
                self.current_user_channel.get(&l.source.instance_id) == Some(&channel_id)
            });
        let mut targets: Vec<String> = Vec::new();
        for listener in direct.chain(following) {
            let type_matches = listener
                .context_type
                .as_deref()
                .map(|t| t == context_type)
                .unwrap_or(true);
            if !type_matches || listener.source.instance_id == source.instance_id {
                continue;
            }
            if !targets.contains(&listener.source.instance_id) {
                targets.push(listener.source.instance_id.clone());
            }
        }

        let mut outbound = Vec::with_capacity(targets.len());
        for target in targets {
            outbound.push(Outbound {
                target,
                message: Message::event(
                    kinds::BROADCAST_EVENT,
                    BroadcastEvent {
                        channel_id: Some(channel_id.clone()),
                        context: context.clone(),
                        originating_app: Some(source.into()),
                    },
                )?,
            });
        }

        self.seq += 1;
        let entry = HistoryEntry {
            context: context.clone(),
            author: source.clone(),
            seq: self.seq,
        };
        self.histories
            .entry(channel_id)
            .or_default()
            .record(&context_type, entry);
        Ok(outbound)
    }

    pub(crate) fn current_context(
        &self,
        source: &FullyQualifiedAppIdentifier,
        channel_id: &str,
        context_type: Option<&str>,
    ) -> Result<Option<Value>> {
        if self.is_private(channel_id) && !self.is_allowed(channel_id, source) {
            return Err(Error::AccessDenied);
        }
        let Some(history) = self.histories.get(channel_id) else {
            return Ok(None);
        };
        Ok(match context_type {
            Some(t) => history.of_type(t).cloned(),
            None => history.most_recent().cloned(),
        })
    }

    // ---- private channel events ----

    pub(crate) fn add_private_event_listener(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
        channel_id: &str,
        event_type: Option<PrivateChannelEventType>,
    ) -> Result<String> {
        if !self.is_private(channel_id) {
            return Err(Error::NoChannelFound);
        }
        if !self.is_allowed(channel_id, source) {
            return Err(Error::AccessDenied);
        }
        let listener_uuid = new_uuid();
        self.private_event_listeners.push(PrivateEventListenerRecord {
            listener_uuid: listener_uuid.clone(),
            channel_id: channel_id.to_string(),
            event_type,
            source: source.clone(),
        });
        Ok(listener_uuid)
    }

    pub(crate) fn remove_private_event_listener(&mut self, listener_uuid: &str) -> bool {
        let before = self.private_event_listeners.len();
        self.private_event_listeners
            .retain(|l| l.listener_uuid != listener_uuid);
        self.private_event_listeners.len() != before
    }

    /// Instances holding a matching private-channel event listener, in
    /// registration order, each at most once.
    fn private_event_targets(
        &self,
        channel_id: &str,
        event: PrivateChannelEventType,
        exclude_instance: Option<&str>,
    ) -> Vec<String> {
        let mut targets = Vec::new();
        for listener in &self.private_event_listeners {
            if listener.channel_id != channel_id {
                continue;
            }
            if listener.event_type.map(|t| t != event).unwrap_or(false) {
                continue;
            }
            if Some(listener.source.instance_id.as_str()) == exclude_instance {
                continue;
            }
            if !targets.contains(&listener.source.instance_id) {
                targets.push(listener.source.instance_id.clone());
            }
        }
        targets
    }

    fn private_channel_events(
        &self,
        channel_id: &str,
        event: PrivateChannelEventType,
        exclude_instance: Option<&str>,
        message: Message,
    ) -> Vec<Outbound> {
        self.private_event_targets(channel_id, event, exclude_instance)
            .into_iter()
            .map(|target| Outbound {
                target,
                message: message.clone(),
            })
            .collect()
    }

    /// Disconnects `source` from a private channel: its context listeners
    /// are unsubscribed through the regular path (so unsubscribe events
    /// fire), then every other member with a matching listener learns of the
    /// disconnect.
    pub(crate) fn private_channel_disconnect(
        &mut self,
        source: &FullyQualifiedAppIdentifier,
        channel_id: &str,
    ) -> Result<Vec<Outbound>> {
        if !self.is_private(channel_id) {
            return Err(Error::NoChannelFound);
        }
        if !self.is_allowed(channel_id, source) {
            return Err(Error::AccessDenied);
        }
        let own_listeners: Vec<String> = self
            .context_listeners
            .get(channel_id)
            .into_iter()
            .flatten()
            .filter(|l| l.source.instance_id == source.instance_id)
            .map(|l| l.listener_uuid.clone())
            .collect();
        let mut outbound = Vec::new();
        for listener_uuid in own_listeners {
            outbound.extend(self.remove_context_listener(&listener_uuid)?);
        }
        outbound.extend(self.private_channel_events(
            channel_id,
            PrivateChannelEventType::Disconnect,
            Some(&source.instance_id),
            Message::event(
                kinds::PRIVATE_CHANNEL_ON_DISCONNECT_EVENT,
                PrivateChannelOnDisconnectEvent {
                    private_channel_id: channel_id.to_string(),
                },
            )?,
        ));
        Ok(outbound)
    }

    // ---- disconnection cleanup ----

    /// Tears down everything a vanished instance owned, in dependency order:
    /// channel membership, context listeners (through the unsubscribe path),
    /// private event listeners, then allowed lists and histories.
    pub(crate) fn cleanup_instance(
        &mut self,
        instance: &FullyQualifiedAppIdentifier,
    ) -> Result<Vec<Outbound>> {
        self.current_user_channel.remove(&instance.instance_id);

        let owned: Vec<String> = self
            .context_listeners
            .values()
            .flatten()
            .filter(|l| l.source.instance_id == instance.instance_id)
            .map(|l| l.listener_uuid.clone())
            .collect();
        let mut outbound = Vec::new();
        for listener_uuid in owned {
            outbound.extend(self.remove_context_listener(&listener_uuid)?);
        }

        self.private_event_listeners
            .retain(|l| l.source.instance_id != instance.instance_id);

        // The instance never said goodbye; the remaining members of its
        // private channels get the disconnect they would have gotten.
        let member_channels: Vec<String> = self
            .private_channels
            .iter()
            .filter(|(_, record)| {
                record
                    .allowed
                    .iter()
                    .any(|a| a.instance_id == instance.instance_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for channel_id in &member_channels {
            outbound.extend(self.private_channel_events(
                channel_id,
                PrivateChannelEventType::Disconnect,
                Some(&instance.instance_id),
                Message::event(
                    kinds::PRIVATE_CHANNEL_ON_DISCONNECT_EVENT,
                    PrivateChannelOnDisconnectEvent {
                        private_channel_id: channel_id.clone(),
                    },
                )?,
            ));
        }

        for record in self.private_channels.values_mut() {
            record
                .allowed
                .retain(|a| a.instance_id != instance.instance_id);
        }
        let private_ids: Vec<String> = self.private_channels.keys().cloned().collect();
        for id in private_ids {
            if let Some(history) = self.histories.get_mut(&id) {
                history.scrub(&instance.instance_id);
            }
        }
        for channel in recommended_user_channels() {
            if let Some(history) = self.histories.get_mut(&channel.id) {
                history.scrub(&instance.instance_id);
            }
        }
        Ok(outbound)
    }

    /// Members of a private channel, for assertions in tests.
    #[cfg(test)]
    pub(crate) fn allowed_list(&self, channel_id: &str) -> Option<&[FullyQualifiedAppIdentifier]> {
        self.private_channels
            .get(channel_id)
            .map(|r| r.allowed.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelType;
    use serde_json::json;

    fn app(n: u32) -> FullyQualifiedAppIdentifier {
        FullyQualifiedAppIdentifier::new(format!("app-{n}"), format!("instance-{n}"))
    }

    fn contact() -> Value {
        json!({"type": "fdc3.contact", "name": "Joe"})
    }

    #[test]
    fn join_requires_a_recommended_channel() {
        let mut engine = ChannelEngine::default();
        let registry = EventListenerRegistry::default();
        assert_eq!(
            engine
                .join_user_channel(&app(1), "fdc3.channel.99", &registry)
                .unwrap_err(),
            Error::NoChannelFound
        );
        engine
            .join_user_channel(&app(1), "fdc3.channel.1", &registry)
            .unwrap();
        assert_eq!(
            engine.current_channel("instance-1").unwrap().id,
            "fdc3.channel.1"
        );
    }

    #[test]
    fn channel_changed_event_is_gated_on_the_registry() {
        let mut engine = ChannelEngine::default();
        let mut registry = EventListenerRegistry::default();

        let silent = engine
            .join_user_channel(&app(1), "fdc3.channel.1", &registry)
            .unwrap();
        assert!(silent.is_empty());

        registry.add(&app(1), USER_CHANNEL_CHANGED);
        let heard = engine
            .join_user_channel(&app(1), "fdc3.channel.2", &registry)
            .unwrap();
        assert_eq!(heard.len(), 1);
        assert_eq!(heard[0].target, "instance-1");
        assert_eq!(heard[0].message.kind, kinds::CHANNEL_CHANGED_EVENT);
        assert_eq!(heard[0].message.payload["newChannelId"], "fdc3.channel.2");

        let left = engine.leave_current_channel(&app(1), &registry).unwrap();
        assert_eq!(left[0].message.payload["newChannelId"], Value::Null);
        assert!(engine.current_channel("instance-1").is_none());
    }

    #[test]
    fn broadcast_excludes_origin_and_respects_type_filters() {
        let mut engine = ChannelEngine::default();
        let registry = EventListenerRegistry::default();
        for n in 1..=3 {
            engine
                .join_user_channel(&app(n), "fdc3.channel.1", &registry)
                .unwrap();
        }
        // Origin's own listener, a typed match, a typed mismatch and an
        // untyped current-channel follower.
        engine
            .add_context_listener(&app(1), None, Some("fdc3.contact"))
            .unwrap();
        engine
            .add_context_listener(&app(2), Some("fdc3.channel.1"), Some("fdc3.contact"))
            .unwrap();
        engine
            .add_context_listener(&app(2), Some("fdc3.channel.1"), Some("fdc3.instrument"))
            .unwrap();
        engine.add_context_listener(&app(3), None, None).unwrap();

        let outbound = engine
            .broadcast(&app(1), Some("fdc3.channel.1"), &contact())
            .unwrap();
        let targets: Vec<_> = outbound.iter().map(|o| o.target.as_str()).collect();
        assert_eq!(targets, ["instance-2", "instance-3"]);
        assert!(outbound
            .iter()
            .all(|o| o.message.kind == kinds::BROADCAST_EVENT));
        assert_eq!(
            outbound[0].message.payload["originatingApp"]["appId"],
            "app-1"
        );
    }

    #[test]
    fn broadcast_to_unjoined_current_channel_is_a_noop() {
        let mut engine = ChannelEngine::default();
        let outbound = engine.broadcast(&app(1), None, &contact()).unwrap();
        assert!(outbound.is_empty());
        assert!(engine
            .current_context(&app(1), "fdc3.channel.1", None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_context_is_rejected() {
        let mut engine = ChannelEngine::default();
        assert_eq!(
            engine
                .broadcast(&app(1), Some("fdc3.channel.1"), &json!({"name": "x"}))
                .unwrap_err(),
            Error::MalformedContext
        );
    }

    #[test]
    fn history_tracks_most_recent_and_by_type() {
        let mut engine = ChannelEngine::default();
        engine
            .broadcast(&app(1), Some("fdc3.channel.1"), &contact())
            .unwrap();
        engine
            .broadcast(
                &app(1),
                Some("fdc3.channel.1"),
                &json!({"type": "fdc3.instrument", "id": {"ticker": "AAPL"}}),
            )
            .unwrap();

        let latest = engine
            .current_context(&app(2), "fdc3.channel.1", None)
            .unwrap()
            .unwrap();
        assert_eq!(latest["type"], "fdc3.instrument");
        let by_type = engine
            .current_context(&app(2), "fdc3.channel.1", Some("fdc3.contact"))
            .unwrap()
            .unwrap();
        assert_eq!(by_type["name"], "Joe");
        assert!(engine
            .current_context(&app(2), "fdc3.channel.1", Some("fdc3.nothing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn private_channels_enforce_the_allowed_list() {
        let mut engine = ChannelEngine::default();
        let creator = app(1);
        let outsider = app(2);
        let channel = engine.create_private_channel(&creator);

        assert_eq!(
            engine
                .add_context_listener(&outsider, Some(&channel.id), None)
                .unwrap_err(),
            Error::AccessDenied
        );
        assert_eq!(
            engine
                .broadcast(&outsider, Some(&channel.id), &contact())
                .unwrap_err(),
            Error::AccessDenied
        );
        assert_eq!(
            engine
                .current_context(&outsider, &channel.id, None)
                .unwrap_err(),
            Error::AccessDenied
        );

        engine.add_to_allowed_list(&channel.id, &outsider);
        assert!(engine
            .add_context_listener(&outsider, Some(&channel.id), None)
            .is_ok());
        engine.broadcast(&creator, Some(&channel.id), &contact()).unwrap();
        assert!(engine
            .current_context(&outsider, &channel.id, None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn get_or_create_rejects_private_ids() {
        let mut engine = ChannelEngine::default();
        let channel = engine.create_private_channel(&app(1));
        assert_eq!(
            engine.get_or_create_channel(&channel.id).unwrap_err(),
            Error::AccessDenied
        );
        let orders = engine.get_or_create_channel("orders").unwrap();
        assert_eq!(orders.channel_type, ChannelType::App);
        // Idempotent.
        assert_eq!(engine.get_or_create_channel("orders").unwrap(), orders);
    }

    #[test]
    fn private_listener_lifecycle_fires_member_events() {
        let mut engine = ChannelEngine::default();
        let creator = app(1);
        let peer = app(2);
        let channel = engine.create_private_channel(&creator);
        engine.add_to_allowed_list(&channel.id, &peer);

        engine
            .add_private_event_listener(
                &creator,
                &channel.id,
                Some(PrivateChannelEventType::AddContextListener),
            )
            .unwrap();
        engine
            .add_private_event_listener(&creator, &channel.id, None)
            .unwrap();

        let (listener_uuid, add_events) = engine
            .add_context_listener(&peer, Some(&channel.id), Some("x"))
            .unwrap();
        // Both of the creator's listeners match, but the app hears it once.
        assert_eq!(add_events.len(), 1);
        assert_eq!(add_events[0].target, "instance-1");
        assert_eq!(
            add_events[0].message.kind,
            kinds::PRIVATE_CHANNEL_ON_ADD_CONTEXT_LISTENER_EVENT
        );
        assert_eq!(add_events[0].message.payload["contextType"], "x");

        let unsubscribe_events = engine.remove_context_listener(&listener_uuid).unwrap();
        assert_eq!(unsubscribe_events.len(), 1);
        assert_eq!(
            unsubscribe_events[0].message.kind,
            kinds::PRIVATE_CHANNEL_ON_UNSUBSCRIBE_EVENT
        );

        // Unknown uuid: idempotent, no events.
        assert!(engine.remove_context_listener(&listener_uuid).unwrap().is_empty());
    }

    #[test]
    fn disconnect_unsubscribes_then_notifies_other_members() {
        let mut engine = ChannelEngine::default();
        let creator = app(1);
        let peer = app(2);
        let channel = engine.create_private_channel(&creator);
        engine.add_to_allowed_list(&channel.id, &peer);

        engine
            .add_private_event_listener(
                &creator,
                &channel.id,
                Some(PrivateChannelEventType::Unsubscribe),
            )
            .unwrap();
        engine
            .add_private_event_listener(
                &creator,
                &channel.id,
                Some(PrivateChannelEventType::Disconnect),
            )
            .unwrap();
        engine
            .add_context_listener(&peer, Some(&channel.id), None)
            .unwrap();

        let outbound = engine.private_channel_disconnect(&peer, &channel.id).unwrap();
        let kinds_seen: Vec<_> = outbound.iter().map(|o| o.message.kind.as_str()).collect();
        assert_eq!(
            kinds_seen,
            [
                kinds::PRIVATE_CHANNEL_ON_UNSUBSCRIBE_EVENT,
                kinds::PRIVATE_CHANNEL_ON_DISCONNECT_EVENT
            ]
        );
        assert!(outbound.iter().all(|o| o.target == "instance-1"));
    }

    #[test]
    fn cleanup_scrubs_membership_listeners_and_history() {
        let mut engine = ChannelEngine::default();
        let registry = EventListenerRegistry::default();
        let survivor = app(1);
        let vanished = app(2);

        engine
            .join_user_channel(&vanished, "fdc3.channel.1", &registry)
            .unwrap();
        let channel = engine.create_private_channel(&survivor);
        engine.add_to_allowed_list(&channel.id, &vanished);
        engine
            .add_private_event_listener(
                &survivor,
                &channel.id,
                Some(PrivateChannelEventType::Unsubscribe),
            )
            .unwrap();
        engine
            .add_private_event_listener(
                &survivor,
                &channel.id,
                Some(PrivateChannelEventType::Disconnect),
            )
            .unwrap();
        engine
            .add_context_listener(&vanished, Some(&channel.id), None)
            .unwrap();

        engine
            .broadcast(&survivor, Some(&channel.id), &contact())
            .unwrap();
        engine
            .broadcast(
                &vanished,
                Some(&channel.id),
                &json!({"type": "fdc3.instrument"}),
            )
            .unwrap();
        engine
            .broadcast(&vanished, Some("fdc3.channel.1"), &json!({"type": "fdc3.email"}))
            .unwrap();

        let outbound = engine.cleanup_instance(&vanished).unwrap();
        // One unsubscribe event for the one listener the instance held,
        // followed by the disconnect for the channel it was a member of.
        let kinds_seen: Vec<_> = outbound.iter().map(|o| o.message.kind.as_str()).collect();
        assert_eq!(
            kinds_seen,
            [
                kinds::PRIVATE_CHANNEL_ON_UNSUBSCRIBE_EVENT,
                kinds::PRIVATE_CHANNEL_ON_DISCONNECT_EVENT
            ]
        );

        assert!(engine.current_channel("instance-2").is_none());
        assert!(engine
            .allowed_list(&channel.id)
            .unwrap()
            .iter()
            .all(|a| a.instance_id != "instance-2"));
        // The vanished instance's contexts are gone; the survivor's remains
        // as most recent.
        let remaining = engine
            .current_context(&survivor, &channel.id, None)
            .unwrap()
            .unwrap();
        assert_eq!(remaining["type"], "fdc3.contact");
        assert!(engine
            .current_context(&survivor, "fdc3.channel.1", None)
            .unwrap()
            .is_none());
    }
}
