//! Session-level integration: bootstrap fallbacks, stored-notebook
//! promotion, and the misrouted-kernel diagnostic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use praxis_collab::blobstore::LocalBackup;
use praxis_collab::coordinator::Registry;
use praxis_collab::document::DEFAULT_TITLE;
use praxis_collab::gateway::{self, GatewayConfig};
use praxis_collab::kernel::KernelStatus;
use praxis_collab::session::{CollabStatus, NotebookSession};
use praxis_collab::storage::{SnapshotStore, StoreConfig};
use praxis_collab::SessionConfig;

async fn start_gateway() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let store = Arc::new(SnapshotStore::open(StoreConfig::in_memory()).unwrap());
    let registry = Arc::new(Registry::new(store));
    let config = GatewayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        auth_token: None,
    };
    gateway::serve(config, registry).await.unwrap()
}

fn backup_with_real_notebook(dir: &std::path::Path, notebook_id: &str) {
    let backup = LocalBackup::new(dir);
    backup
        .save(
            notebook_id,
            &serde_json::from_value(serde_json::json!({
                "title": "Existing Work",
                "cells": [
                    {"id": "m1", "type": "markdown", "content": "# My analysis"},
                    {"id": "c1", "type": "code", "content": "total = 40 + 2"},
                    {"id": "c2", "type": "code", "content": "print(total)"},
                ]
            }))
            .unwrap(),
        )
        .unwrap();
}

#[tokio::test]
async fn test_bootstrap_falls_back_without_gateway() {
    // Nothing listens on this port; the snapshot fetch fails fast.
    let mut config = SessionConfig::collaborative("ws://127.0.0.1:9");
    config.collab_connect_timeout_ms = 300;

    let session = NotebookSession::bootstrap(config, "nb-offline").await.unwrap();
    assert_eq!(session.collab_status(), CollabStatus::Fallback);
    // Still a working notebook, seeded from the default template.
    assert_eq!(session.title(), DEFAULT_TITLE);
    assert_eq!(session.views().len(), 2);
    assert_eq!(session.peer_count(), 1);
}

#[tokio::test]
async fn test_solo_notebook_promoted_to_collaborative() {
    // The coordinator only has the seeded default; the user's real notebook
    // lives in local storage from their solo days.
    let (addr, _server) = start_gateway().await;
    let dir = tempfile::tempdir().unwrap();
    backup_with_real_notebook(dir.path(), "nb-promote");

    let mut config = SessionConfig::collaborative(format!("ws://{addr}"));
    config.backup_dir = Some(dir.path().to_path_buf());

    let session = NotebookSession::bootstrap(config, "nb-promote").await.unwrap();

    assert_eq!(session.title(), "Existing Work");
    let views = session.views();
    assert_eq!(views.len(), 3);
    assert_eq!(views[1].content, "total = 40 + 2");
}

#[tokio::test]
async fn test_remote_state_wins_over_backup() {
    // When the coordinator already has real (non-default) content, the
    // local backup must NOT clobber it.
    let (addr, _server) = start_gateway().await;
    let dir = tempfile::tempdir().unwrap();
    backup_with_real_notebook(dir.path(), "nb-remote-wins");

    // First client establishes real remote state.
    let a = NotebookSession::bootstrap(
        SessionConfig::collaborative(format!("ws://{addr}")),
        "nb-remote-wins",
    )
    .await
    .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.collab_status() != CollabStatus::Connected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    a.update_title("Live Document");
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Second client carries a stale backup; the remote snapshot is not the
    // default template anymore, so no promotion happens.
    let mut config = SessionConfig::collaborative(format!("ws://{addr}"));
    config.backup_dir = Some(dir.path().to_path_buf());
    let b = NotebookSession::bootstrap(config, "nb-remote-wins").await.unwrap();

    assert_eq!(b.title(), "Live Document");
}

#[tokio::test]
async fn test_misrouted_kernel_url_is_diagnosed() {
    // The kernel URL points at the collab gateway by mistake.
    let (addr, _server) = start_gateway().await;

    let mut config = SessionConfig::local_only();
    config.backend_kernel_url = Some(format!("http://{addr}"));

    let session = NotebookSession::bootstrap(config, "nb-misroute").await.unwrap();
    session.connect_kernel().await;

    assert_eq!(session.kernel_status(), KernelStatus::Disconnected);
    let message = session.kernel_message().expect("diagnostic expected");
    assert!(message.contains("collaboration Worker"), "got: {message}");
    assert!(message.contains("Python kernel server"), "got: {message}");

    // The notebook itself still renders.
    assert_eq!(session.views().len(), 2);
}

#[tokio::test]
async fn test_run_cell_against_misrouted_kernel_stays_contained() {
    let (addr, _server) = start_gateway().await;

    let mut config = SessionConfig::local_only();
    config.backend_kernel_url = Some(format!("http://{addr}"));
    let session = NotebookSession::bootstrap(config, "nb-contained").await.unwrap();

    let code_cell = session.views()[1].id.clone();
    // Execution fails (the gateway is not a kernel) but the failure lands
    // in the cell's output, not as a crash.
    session.run_cell(&code_cell, false).await.unwrap();

    let views = session.views();
    let cell = views.iter().find(|v| v.id == code_cell).unwrap();
    assert!(cell.runtime.output.is_some());
    assert_eq!(session.views().len(), 2);
}
