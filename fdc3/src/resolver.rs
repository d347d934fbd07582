//! Contracts for the user-facing collaborators the root agent consults but
//! does not implement: the resolver UI that picks among candidate handler
//! apps, and the launcher that `open` delegates to.

use async_trait::async_trait;

use crate::{
    types::{
        AppDirectoryEntry, AppIdentifier, AppIntent, Context, FullyQualifiedAppIdentifier,
    },
    Result,
};

/// What the resolver is asked when an intent has more than one candidate.
#[derive(Clone, Debug)]
pub struct ResolveForIntent {
    pub intent: String,
    pub context: Context,
    /// The (unqualified) target the raiser named, if any.
    pub app: Option<AppIdentifier>,
    /// The candidates, narrowed to live instances.
    pub app_intent: AppIntent,
}

/// What the resolver is asked when a context could be handled through
/// several intents.
#[derive(Clone, Debug)]
pub struct ResolveForContext {
    pub context: Context,
    pub app: Option<AppIdentifier>,
    pub app_intents: Vec<AppIntent>,
}

/// The resolver's answer for a context resolution: one intent and one app.
#[derive(Clone, Debug)]
pub struct IntentAppChoice {
    pub intent: String,
    pub app: FullyQualifiedAppIdentifier,
}

/// The user-mediated app picker.
///
/// Either operation may reject with [`Error::UserCancelled`] when the user
/// dismisses the picker.
///
/// [`Error::UserCancelled`]: crate::Error::UserCancelled
#[async_trait]
pub trait IntentResolver: Send + Sync {
    async fn resolve_app_for_intent(
        &self,
        request: ResolveForIntent,
    ) -> Result<FullyQualifiedAppIdentifier>;

    async fn resolve_app_for_context(&self, request: ResolveForContext)
        -> Result<IntentAppChoice>;
}

/// Launches a directory app and reports the identity it connected under.
///
/// The launcher owns the mechanics of bringing the app up (a window, a tab, a
/// test harness); by the time it returns, the launched instance must have
/// completed its connection handshake with the root.
#[async_trait]
pub trait AppLauncher: Send + Sync {
    async fn launch(&self, entry: &AppDirectoryEntry) -> Result<FullyQualifiedAppIdentifier>;
}
