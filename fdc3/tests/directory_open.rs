//! The app directory seen end to end: catalog loading, metadata queries,
//! and `open` with context delivery to the launched instance.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use fdc3::{
    AppDetails, AppDirectoryEntry, AppIdentifier, Error, IntentDeclaration, Interop,
    InteropIntents, RootAgent, Window, FDC3_VERSION,
};
use serde_json::json;

const DIRECTORY_URL: &str = "https://apps.example.com/v2/apps";

fn catalog() -> Vec<AppDirectoryEntry> {
    let mut listens_for = HashMap::new();
    listens_for.insert(
        "StartChat".to_string(),
        IntentDeclaration {
            contexts: vec!["fdc3.contact".to_string()],
            result_type: Some("fdc3.chat.room".to_string()),
        },
    );
    vec![
        AppDirectoryEntry {
            app_id: "chat".to_string(),
            title: "Chat".to_string(),
            description: Some("Team chat".to_string()),
            kind: "web".to_string(),
            details: AppDetails {
                url: Some("https://chat.example.com/".to_string()),
            },
            interop: Some(Interop {
                intents: InteropIntents { listens_for },
            }),
            ..AppDirectoryEntry::default()
        },
        AppDirectoryEntry {
            app_id: "notes".to_string(),
            title: "Notes".to_string(),
            kind: "web".to_string(),
            details: AppDetails {
                url: Some("https://notes.example.com/".to_string()),
            },
            ..AppDirectoryEntry::default()
        },
    ]
}

async fn directory_root() -> (RootAgent, Arc<FrameLauncher>) {
    let host = Window::new(HOST_URL);
    let launcher = Arc::new(FrameLauncher::new(host.clone()));
    let loader = StaticLoader(
        [(DIRECTORY_URL.to_string(), catalog())]
            .into_iter()
            .collect(),
    );
    let root = RootAgent::builder(&host)
        .directory_url(DIRECTORY_URL)
        .directory_url("https://unreachable.example.com/apps")
        .loader(Arc::new(loader))
        .launcher(launcher.clone())
        .build()
        .await
        .unwrap();
    (root, launcher)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn catalog_metadata_is_served_under_qualified_app_ids() {
    let (root, _launcher) = directory_root().await;
    let a = connect(&root, "https://a.example.com/").await;

    let metadata = a
        .get_app_metadata(&AppIdentifier::new("chat@apps.example.com"))
        .await
        .unwrap();
    assert_eq!(metadata.title.as_deref(), Some("Chat"));
    assert_eq!(metadata.description.as_deref(), Some("Team chat"));
    assert!(metadata.instance_id.is_none());

    assert_eq!(
        a.get_app_metadata(&AppIdentifier::new("chat")).await.unwrap_err(),
        Error::TargetAppUnavailable
    );

    // Known but idle: an empty instance list, not an error.
    assert_eq!(
        a.find_instances(&AppIdentifier::new("notes@apps.example.com"))
            .await
            .unwrap(),
        vec![]
    );

    // The catalog-declared intent is discoverable with no live instance.
    let app_intent = a.find_intent("StartChat", None, None).await.unwrap();
    assert_eq!(app_intent.apps.len(), 1);
    assert_eq!(app_intent.apps[0].app_id, "chat@apps.example.com");
    assert!(app_intent.apps[0].instance_id.is_none());

    // Result-type filtering applies to catalog declarations.
    assert!(a
        .find_intent("StartChat", None, Some("fdc3.chat.room"))
        .await
        .is_ok());
    assert_eq!(
        a.find_intent("StartChat", None, Some("fdc3.nothing"))
            .await
            .unwrap_err(),
        Error::NoAppsFound
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn connecting_from_a_catalog_url_adopts_the_catalog_identity() {
    let (root, _launcher) = directory_root().await;
    let chat = connect(&root, "https://chat.example.com/").await;
    assert_eq!(chat.app_identifier().app_id, "chat@apps.example.com");

    let a = connect(&root, "https://a.example.com/").await;
    let instances = a
        .find_instances(&AppIdentifier::new("chat@apps.example.com"))
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn open_launches_and_delivers_the_context_to_the_new_instance() {
    let (root, launcher) = directory_root().await;
    let a = connect(&root, "https://a.example.com/").await;

    let opened = a
        .open(&AppIdentifier::new("chat@apps.example.com"), Some(&contact()))
        .await
        .unwrap();
    assert_eq!(opened.app_id, "chat@apps.example.com");
    assert!(opened.instance_id.is_some());

    // The launched app receives the open context once it listens.
    let chat = launcher.opened.lock().unwrap().last().unwrap().clone();
    assert_eq!(chat.app_identifier().instance_id.as_str(), opened.instance_id.as_deref().unwrap());
    let (tx, mut rx) = probe();
    chat.add_context_listener(Some("fdc3.contact"), move |ctx, _| {
        let _ = tx.send(ctx);
    })
    .await
    .unwrap();
    assert_eq!(recv(&mut rx).await, contact());

    // Delivered once only.
    assert_silent(&mut rx).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn open_of_an_unknown_app_fails_with_app_not_found() {
    let (root, _launcher) = directory_root().await;
    let a = connect(&root, "https://a.example.com/").await;
    assert_eq!(
        a.open(&AppIdentifier::new("missing@apps.example.com"), None)
            .await
            .unwrap_err(),
        Error::AppNotFound
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn get_info_reports_the_implementation_and_the_caller() {
    let (root, _launcher) = directory_root().await;
    let chat = connect(&root, "https://chat.example.com/").await;

    let info = chat.get_info().await.unwrap();
    assert_eq!(info.fdc3_version, FDC3_VERSION);
    assert_eq!(info.provider, "fdc3-rs");
    assert_eq!(info.app_metadata.app_id, "chat@apps.example.com");
    assert_eq!(
        info.app_metadata.instance_id.as_deref(),
        Some(chat.app_identifier().instance_id.as_str())
    );
}
