//! Core FDC3 data model: app identities, channels, contexts and directory
//! metadata, as they appear both in the public API and on the wire.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::{Error, Result};

/// Reference to an application, optionally narrowed to one live instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentifier {
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl AppIdentifier {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            instance_id: None,
        }
    }

    /// Narrows to a [`FullyQualifiedAppIdentifier`] when an instance id is
    /// present.
    pub fn fully_qualified(&self) -> Option<FullyQualifiedAppIdentifier> {
        self.instance_id
            .as_ref()
            .map(|instance_id| FullyQualifiedAppIdentifier {
                app_id: self.app_id.clone(),
                instance_id: instance_id.clone(),
            })
    }
}

/// Reference to one live application instance. The instance id is assigned by
/// the root agent at connection time and stays unique for the root's
/// lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullyQualifiedAppIdentifier {
    pub app_id: String,
    pub instance_id: String,
}

impl FullyQualifiedAppIdentifier {
    pub fn new(app_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl From<FullyQualifiedAppIdentifier> for AppIdentifier {
    fn from(id: FullyQualifiedAppIdentifier) -> Self {
        AppIdentifier {
            app_id: id.app_id,
            instance_id: Some(id.instance_id),
        }
    }
}

impl From<&FullyQualifiedAppIdentifier> for AppIdentifier {
    fn from(id: &FullyQualifiedAppIdentifier) -> Self {
        id.clone().into()
    }
}

/// A typed context payload.
///
/// FDC3 contexts are open maps; the only structural requirement is an object
/// shape with a string `type`. Anything deeper is left to consumers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Context(Value);

impl Context {
    /// Validates and wraps a JSON value.
    pub fn new(value: Value) -> Result<Self> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(Error::MalformedContext)
        }
    }

    /// A context is valid iff it is an object with a string `type`.
    pub fn is_valid(value: &Value) -> bool {
        value
            .as_object()
            .and_then(|o| o.get("type"))
            .map(Value::is_string)
            .unwrap_or(false)
    }

    pub fn context_type(&self) -> &str {
        self.0
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl TryFrom<Value> for Context {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::new(value)
    }
}

/// The three channel flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    User,
    App,
    Private,
}

/// Presentation hints for a channel, used by channel-selector UIs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glyph: Option<String>,
}

/// A channel as it appears on the wire and in directory state. Identity is
/// the `id`; the type never changes after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_metadata: Option<DisplayMetadata>,
}

impl ChannelInfo {
    pub fn app(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel_type: ChannelType::App,
            display_metadata: None,
        }
    }

    pub fn private(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel_type: ChannelType::Private,
            display_metadata: None,
        }
    }
}

fn user_channel(n: u32, color: &str) -> ChannelInfo {
    ChannelInfo {
        id: format!("fdc3.channel.{n}"),
        channel_type: ChannelType::User,
        display_metadata: Some(DisplayMetadata {
            name: Some(format!("Channel {n}")),
            color: Some(color.to_string()),
            glyph: Some(n.to_string()),
        }),
    }
}

static RECOMMENDED_USER_CHANNELS: Lazy<Vec<ChannelInfo>> = Lazy::new(|| {
    [
        "red", "orange", "yellow", "green", "cyan", "blue", "magenta", "purple",
    ]
    .iter()
    .enumerate()
    .map(|(i, color)| user_channel(i as u32 + 1, color))
    .collect()
});

/// The fixed, ordered set of recommended user channels.
pub fn recommended_user_channels() -> &'static [ChannelInfo] {
    &RECOMMENDED_USER_CHANNELS
}

/// Static intent declaration from a directory record:
/// `interop.intents.listensFor[intent]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentDeclaration {
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteropIntents {
    #[serde(default)]
    pub listens_for: HashMap<String, IntentDeclaration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interop {
    #[serde(default)]
    pub intents: InteropIntents,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Icon {
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub icon_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One record of an app-directory JSON document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDirectoryEntry {
    pub app_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<Icon>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<Screenshot>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub details: AppDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interop: Option<Interop>,
}

/// App metadata as returned from directory queries. A directory entry merged
/// with, for live instances, the instance id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<Icon>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<Screenshot>,
}

impl AppMetadata {
    pub fn from_entry(entry: &AppDirectoryEntry, instance_id: Option<String>) -> Self {
        Self {
            app_id: entry.app_id.clone(),
            instance_id,
            title: Some(entry.title.clone()),
            version: entry.version.clone(),
            description: entry.description.clone(),
            icons: entry.icons.clone(),
            tooltip: entry.tooltip.clone(),
            screenshots: entry.screenshots.clone(),
        }
    }

    pub fn identifier(&self) -> AppIdentifier {
        AppIdentifier {
            app_id: self.app_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One intent together with every app that can handle it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIntent {
    pub intent: IntentMetadata,
    pub apps: Vec<AppMetadata>,
}

/// Metadata describing this agent implementation, returned by `getInfo`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationMetadata {
    pub fdc3_version: String,
    pub provider: String,
    pub provider_version: String,
    pub app_metadata: AppMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_requires_object_with_string_type() {
        assert!(Context::new(json!({"type": "fdc3.contact", "name": "Joe"})).is_ok());
        assert_eq!(
            Context::new(json!({"name": "Joe"})),
            Err(Error::MalformedContext)
        );
        assert_eq!(Context::new(json!({"type": 7})), Err(Error::MalformedContext));
        assert_eq!(Context::new(json!("fdc3.contact")), Err(Error::MalformedContext));
    }

    #[test]
    fn recommended_channels_are_eight_ordered_user_channels() {
        let channels = recommended_user_channels();
        assert_eq!(channels.len(), 8);
        assert_eq!(channels[0].id, "fdc3.channel.1");
        assert_eq!(channels[7].id, "fdc3.channel.8");
        assert!(channels
            .iter()
            .all(|c| c.channel_type == ChannelType::User));
        let meta = channels[2].display_metadata.as_ref().unwrap();
        assert_eq!(meta.color.as_deref(), Some("yellow"));
        assert_eq!(meta.glyph.as_deref(), Some("3"));
    }

    #[test]
    fn channel_serializes_with_wire_field_names() {
        let channel = ChannelInfo::app("orders");
        let value = serde_json::to_value(&channel).unwrap();
        assert_eq!(value, json!({"id": "orders", "type": "app"}));
    }

    #[test]
    fn directory_entry_parses_interop_declarations() {
        let entry: AppDirectoryEntry = serde_json::from_value(json!({
            "appId": "chat",
            "title": "Chat",
            "type": "web",
            "details": {"url": "https://chat.example.com/"},
            "interop": {"intents": {"listensFor": {
                "StartChat": {"contexts": ["fdc3.contact"], "resultType": "fdc3.chat.room"}
            }}}
        }))
        .unwrap();
        let declared = &entry.interop.unwrap().intents.listens_for["StartChat"];
        assert_eq!(declared.contexts, ["fdc3.contact"]);
        assert_eq!(declared.result_type.as_deref(), Some("fdc3.chat.room"));
    }
}
