//! The app directory: a static catalog of app records merged with the
//! dynamic roster of live instances, and the intent/context matching queries
//! the rest of the engine is built on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    message::new_uuid,
    types::{
        AppDirectoryEntry, AppIdentifier, AppIntent, AppMetadata, FullyQualifiedAppIdentifier,
        IntentMetadata,
    },
    Error, Result,
};

/// Source of one app-directory document: the JSON array behind a configured
/// URL. Loading is consumed as a contract so the HTTP plumbing stays outside
/// the engine.
#[async_trait]
pub trait DirectoryLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<Vec<AppDirectoryEntry>>;
}

/// One live, connected instance.
#[derive(Clone, Debug)]
pub(crate) struct InstanceRecord {
    pub identity: FullyQualifiedAppIdentifier,
    pub entry: Option<AppDirectoryEntry>,
    /// Intents this instance has registered handlers for, with the context
    /// types each accepts (empty accepts any).
    pub registered_intents: BTreeMap<String, Vec<String>>,
}

impl InstanceRecord {
    fn metadata(&self) -> AppMetadata {
        match &self.entry {
            Some(entry) => AppMetadata::from_entry(entry, Some(self.identity.instance_id.clone())),
            None => AppMetadata {
                app_id: self.identity.app_id.clone(),
                instance_id: Some(self.identity.instance_id.clone()),
                ..AppMetadata::default()
            },
        }
    }
}

/// How a raise-intent target was narrowed.
#[derive(Clone, Debug)]
pub(crate) enum TargetResolution {
    /// Exactly one instance qualifies; no user mediation needed.
    Direct(FullyQualifiedAppIdentifier),
    /// Several instances qualify; the resolver UI must choose.
    NeedsChoice(AppIntent),
}

/// Like [`TargetResolution`], for a context raise where the intent itself is
/// still open.
#[derive(Clone, Debug)]
pub(crate) enum ContextResolution {
    Direct {
        intent: String,
        instance: FullyQualifiedAppIdentifier,
    },
    NeedsChoice(Vec<AppIntent>),
}

#[derive(Default)]
pub(crate) struct AppDirectory {
    /// Catalog records, keyed `appId@sourceHost` to disambiguate across
    /// directories. Within one URL the last declaration of an appId wins.
    catalog: BTreeMap<String, AppDirectoryEntry>,
    instances: BTreeMap<String, InstanceRecord>,
}

fn source_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

impl AppDirectory {
    /// Populates the static catalog from the configured URLs. A URL that
    /// fails to load is logged and skipped; the others still populate.
    pub(crate) async fn load(urls: &[String], loader: &dyn DirectoryLoader) -> Self {
        let mut directory = Self::default();
        for url in urls {
            match loader.load(url).await {
                Ok(entries) => {
                    let host = source_host(url);
                    debug!(url, count = entries.len(), "loaded app directory");
                    for mut entry in entries {
                        entry.app_id = format!("{}@{}", entry.app_id, host);
                        directory.catalog.insert(entry.app_id.clone(), entry);
                    }
                }
                Err(error) => {
                    warn!(url, %error, "failed to load app directory, skipping");
                }
            }
        }
        directory
    }

    // ---- dynamic roster ----

    /// Allocates an instance id for a newly connected app, matching its
    /// launch URL against the catalog. Apps with no catalog record are still
    /// admitted, keyed by their URL.
    pub(crate) fn register_new_instance(&mut self, launch_url: &str) -> FullyQualifiedAppIdentifier {
        let entry = self
            .catalog
            .values()
            .find(|e| e.details.url.as_deref() == Some(launch_url))
            .cloned();
        let app_id = entry
            .as_ref()
            .map(|e| e.app_id.clone())
            .unwrap_or_else(|| launch_url.to_string());
        let identity = FullyQualifiedAppIdentifier::new(app_id, new_uuid());
        self.instances.insert(
            identity.instance_id.clone(),
            InstanceRecord {
                identity: identity.clone(),
                entry,
                registered_intents: BTreeMap::new(),
            },
        );
        identity
    }

    pub(crate) fn register_intent_listener(
        &mut self,
        identity: &FullyQualifiedAppIdentifier,
        intent: &str,
        context_types: &[String],
    ) {
        if let Some(record) = self.instances.get_mut(&identity.instance_id) {
            let accepted = record
                .registered_intents
                .entry(intent.to_string())
                .or_default();
            for context_type in context_types {
                if !accepted.contains(context_type) {
                    accepted.push(context_type.clone());
                }
            }
        }
    }

    pub(crate) fn deregister_intent_listener(
        &mut self,
        identity: &FullyQualifiedAppIdentifier,
        intent: &str,
    ) {
        if let Some(record) = self.instances.get_mut(&identity.instance_id) {
            record.registered_intents.remove(intent);
        }
    }

    pub(crate) fn remove_instance(&mut self, instance_id: &str) {
        self.instances.remove(instance_id);
    }

    pub(crate) fn instance(&self, instance_id: &str) -> Option<&FullyQualifiedAppIdentifier> {
        self.instances.get(instance_id).map(|r| &r.identity)
    }

    fn known_app(&self, app_id: &str) -> bool {
        self.catalog.contains_key(app_id)
            || self.instances.values().any(|r| r.identity.app_id == app_id)
    }

    // ---- queries ----

    /// Live instances of an app: `Some(vec![])` when the app is known but
    /// idle, `None` when the directory has never heard of it.
    pub(crate) fn app_instances(&self, app_id: &str) -> Option<Vec<FullyQualifiedAppIdentifier>> {
        if !self.known_app(app_id) {
            return None;
        }
        Some(
            self.instances
                .values()
                .filter(|r| r.identity.app_id == app_id)
                .map(|r| r.identity.clone())
                .collect(),
        )
    }

    pub(crate) fn app_metadata(&self, app: &AppIdentifier) -> Option<AppMetadata> {
        match &app.instance_id {
            Some(instance_id) => {
                let record = self.instances.get(instance_id)?;
                if record.identity.app_id != app.app_id {
                    return None;
                }
                Some(record.metadata())
            }
            None => self
                .catalog
                .get(&app.app_id)
                .map(|entry| AppMetadata::from_entry(entry, None)),
        }
    }

    pub(crate) fn catalog_entry(&self, app_id: &str) -> Option<&AppDirectoryEntry> {
        self.catalog.get(app_id)
    }

    fn entry_declares(
        entry: &AppDirectoryEntry,
        intent: &str,
        context_type: Option<&str>,
        result_type: Option<&str>,
    ) -> bool {
        let Some(declaration) = entry
            .interop
            .as_ref()
            .and_then(|i| i.intents.listens_for.get(intent))
        else {
            return false;
        };
        let context_ok = match context_type {
            Some(t) => declaration.contexts.is_empty() || declaration.contexts.iter().any(|c| c == t),
            None => true,
        };
        let result_ok = match result_type {
            Some(t) => declaration.result_type.as_deref() == Some(t),
            None => true,
        };
        context_ok && result_ok
    }

    fn instance_registers(
        &self,
        record: &InstanceRecord,
        intent: &str,
        context_type: Option<&str>,
        result_type: Option<&str>,
    ) -> bool {
        let Some(accepted) = record.registered_intents.get(intent) else {
            return false;
        };
        let context_ok = match context_type {
            Some(t) => accepted.is_empty() || accepted.iter().any(|c| c == t),
            None => true,
        };
        // Dynamic registrations carry no result type; fall back to the
        // instance's catalog declaration when the query narrows by one.
        let result_ok = match result_type {
            Some(_) => record
                .entry
                .as_ref()
                .map(|e| Self::entry_declares(e, intent, context_type, result_type))
                .unwrap_or(false),
            None => true,
        };
        context_ok && result_ok
    }

    /// Candidate live instances for an intent, in registration-table order.
    fn live_candidates(
        &self,
        intent: &str,
        context_type: Option<&str>,
        result_type: Option<&str>,
    ) -> Vec<&InstanceRecord> {
        self.instances
            .values()
            .filter(|r| self.instance_registers(r, intent, context_type, result_type))
            .collect()
    }

    /// The union of catalog-declared apps and dynamically-registered
    /// instances for one intent.
    pub(crate) fn app_intent(
        &self,
        intent: &str,
        context_type: Option<&str>,
        result_type: Option<&str>,
    ) -> AppIntent {
        let mut apps: Vec<AppMetadata> = self
            .catalog
            .values()
            .filter(|e| Self::entry_declares(e, intent, context_type, result_type))
            .map(|e| AppMetadata::from_entry(e, None))
            .collect();
        apps.extend(
            self.live_candidates(intent, context_type, result_type)
                .into_iter()
                .map(|r| r.metadata()),
        );
        AppIntent {
            intent: IntentMetadata {
                name: intent.to_string(),
                display_name: None,
            },
            apps,
        }
    }

    /// One [`AppIntent`] per intent for which at least one app matches the
    /// context.
    pub(crate) fn app_intents_for_context(
        &self,
        context_type: &str,
        result_type: Option<&str>,
    ) -> Vec<AppIntent> {
        let mut intents: Vec<String> = Vec::new();
        for entry in self.catalog.values() {
            if let Some(interop) = &entry.interop {
                for intent in interop.intents.listens_for.keys() {
                    if !intents.contains(intent) {
                        intents.push(intent.clone());
                    }
                }
            }
        }
        for record in self.instances.values() {
            for intent in record.registered_intents.keys() {
                if !intents.contains(intent) {
                    intents.push(intent.clone());
                }
            }
        }
        intents.sort();
        intents
            .into_iter()
            .map(|intent| self.app_intent(&intent, Some(context_type), result_type))
            .filter(|app_intent| !app_intent.apps.is_empty())
            .collect()
    }

    /// Narrows a raise-intent target to one live instance, or to the
    /// candidate list a resolver must choose from.
    pub(crate) fn resolve_app_instance_for_intent(
        &self,
        intent: &str,
        context_type: Option<&str>,
        app: Option<&AppIdentifier>,
    ) -> Result<TargetResolution> {
        if let Some(app) = app {
            if let Some(instance_id) = &app.instance_id {
                return match self.instances.get(instance_id) {
                    Some(record) if record.identity.app_id == app.app_id => {
                        Ok(TargetResolution::Direct(record.identity.clone()))
                    }
                    _ if !self.known_app(&app.app_id) => Err(Error::TargetAppUnavailable),
                    _ => Err(Error::TargetInstanceUnavailable),
                };
            }
            if !self.known_app(&app.app_id) {
                return Err(Error::TargetAppUnavailable);
            }
            let candidates: Vec<_> = self
                .live_candidates(intent, context_type, None)
                .into_iter()
                .filter(|r| r.identity.app_id == app.app_id)
                .collect();
            return match candidates.len() {
                0 => Err(Error::TargetAppUnavailable),
                1 => Ok(TargetResolution::Direct(candidates[0].identity.clone())),
                _ => Ok(TargetResolution::NeedsChoice(AppIntent {
                    intent: IntentMetadata {
                        name: intent.to_string(),
                        display_name: None,
                    },
                    apps: candidates.iter().map(|r| r.metadata()).collect(),
                })),
            };
        }

        let candidates = self.live_candidates(intent, context_type, None);
        match candidates.len() {
            0 => Err(Error::NoAppsFound),
            1 => Ok(TargetResolution::Direct(candidates[0].identity.clone())),
            _ => Ok(TargetResolution::NeedsChoice(AppIntent {
                intent: IntentMetadata {
                    name: intent.to_string(),
                    display_name: None,
                },
                apps: candidates.iter().map(|r| r.metadata()).collect(),
            })),
        }
    }

    /// The context flavor: one `AppIntent` per matching intent, deferring
    /// the (intent, app) choice to the resolver unless exactly one pair
    /// exists.
    pub(crate) fn resolve_app_instance_for_context(
        &self,
        context_type: &str,
        app: Option<&AppIdentifier>,
    ) -> Result<ContextResolution> {
        if let Some(app) = app {
            if let Some(instance_id) = &app.instance_id {
                if !self.instances.contains_key(instance_id) {
                    return if self.known_app(&app.app_id) {
                        Err(Error::TargetInstanceUnavailable)
                    } else {
                        Err(Error::TargetAppUnavailable)
                    };
                }
            } else if !self.known_app(&app.app_id) {
                return Err(Error::TargetAppUnavailable);
            }
        }

        let mut app_intents = Vec::new();
        let mut pairs: Vec<(String, FullyQualifiedAppIdentifier)> = Vec::new();
        let mut intents: Vec<String> = Vec::new();
        for record in self.instances.values() {
            for intent in record.registered_intents.keys() {
                if !intents.contains(intent) {
                    intents.push(intent.clone());
                }
            }
        }
        intents.sort();
        for intent in intents {
            let candidates: Vec<_> = self
                .live_candidates(&intent, Some(context_type), None)
                .into_iter()
                .filter(|r| match app {
                    Some(app) => {
                        r.identity.app_id == app.app_id
                            && app
                                .instance_id
                                .as_ref()
                                .map(|id| *id == r.identity.instance_id)
                                .unwrap_or(true)
                    }
                    None => true,
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }
            pairs.extend(
                candidates
                    .iter()
                    .map(|r| (intent.clone(), r.identity.clone())),
            );
            app_intents.push(AppIntent {
                intent: IntentMetadata {
                    name: intent,
                    display_name: None,
                },
                apps: candidates.iter().map(|r| r.metadata()).collect(),
            });
        }

        match pairs.len() {
            0 => Err(Error::NoAppsFound),
            1 => {
                let (intent, instance) = pairs.remove(0);
                Ok(ContextResolution::Direct { intent, instance })
            }
            _ => Ok(ContextResolution::NeedsChoice(app_intents)),
        }
    }
}
