#![cfg(unix)]

use std::{
    io::{Cursor, Write},
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{Router, response::Html, routing::get};
use warden_agent::{AgentSettings, CreateServer, Error, Manager, PipelineState, TaskStatus};
use zip::{ZipWriter, write::SimpleFileOptions};

const PAGE: &str = r#"<html><body>
<a href="/bin-win/bedrock-server-1.2.3.4.zip">Windows</a>
<a href="/bin-linux/bedrock-server-1.2.3.4.zip">Ubuntu</a>
<a href="/bin-linux/bedrock-server-1.1.0.9.zip">Previous</a>
</body></html>"#;

const PROPERTIES: &str = "server-name=Dedicated Server\n# Used as the server name\ngamemode=survival\nlevel-name=Bedrock level\n";

fn distribution_zip() -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(
        "bedrock_server",
        SimpleFileOptions::default().unix_permissions(0o755),
    )
    .unwrap();
    zip.write_all(b"#!/bin/sh\nwhile read line; do echo \"got $line\"; done\n")
        .unwrap();
    zip.start_file("server.properties", SimpleFileOptions::default())
        .unwrap();
    zip.write_all(PROPERTIES.as_bytes()).unwrap();
    zip.finish().unwrap().into_inner()
}

/// Serves the version page and the distribution archive, counting archive downloads.
async fn spawn_site() -> (SocketAddr, Arc<AtomicUsize>) {
    spawn_slow_site(Duration::ZERO).await
}

/// Like `spawn_site`, but each archive response is held back for `delay`.
async fn spawn_slow_site(delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
    let downloads = Arc::new(AtomicUsize::new(0));
    let archive = Arc::new(distribution_zip());
    let counter = downloads.clone();

    let app = Router::new()
        .route("/download/server/bedrock", get(|| async { Html(PAGE) }))
        .fallback(move || {
            let archive = archive.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                archive.as_ref().clone()
            }
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, downloads)
}

fn settings(root: &Path, site: Option<SocketAddr>) -> AgentSettings {
    let base = site
        .map(|a| format!("http://{a}"))
        .unwrap_or_else(|| "http://127.0.0.1:9".to_string());
    AgentSettings {
        data_root: root.to_path_buf(),
        cache_ttl_secs: 0,
        version_page_url: format!("{base}/download/server/bedrock"),
        download_url_template: format!(
            "{base}/bin-{{platform}}/bedrock-server-{{version}}.zip"
        ),
        ..AgentSettings::default()
    }
}

async fn finish(manager: &Manager, id: &str) -> TaskStatus {
    let pipeline = manager
        .create_pipeline(id)
        .expect("provisioning pipeline registered");
    tokio::time::timeout(Duration::from_secs(30), pipeline.join())
        .await
        .expect("provisioning finished in time")
}

#[tokio::test]
async fn create_without_id_or_version_runs_four_steps() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, downloads) = spawn_site().await;
    let manager = Manager::new(settings(dir.path(), Some(addr))).await.unwrap();

    let server = manager
        .start_create_server(CreateServer {
            name: "Integration".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = server.id().to_string();
    assert!(id.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(server.version(), "1.2.3.4");
    assert!(manager.get_server(&id).await.is_ok());

    let status = finish(&manager, &id).await;
    assert_eq!(status.total_tasks, 4);
    assert_eq!(status.completed_tasks, 4);
    assert_eq!(status.percentage, 100.0);
    assert!(!status.is_running);
    assert!(status.err.is_none());
    assert_eq!(status.state, PipelineState::Completed);
    assert_eq!(status.current_task, "configure server");
    assert_eq!(manager.get_server_create_status(&id).unwrap(), status);

    let root = dir.path().join("servers").join(&id);
    assert!(root.join(warden_process::EXEC_NAME).is_file());
    assert!(
        dir.path()
            .join("versions")
            .join("bedrock-server-1.2.3.4.zip")
            .is_file()
    );
    let props = std::fs::read_to_string(root.join("server.properties")).unwrap();
    assert_eq!(
        props,
        PROPERTIES.replace("server-name=Dedicated Server", "server-name=Integration")
    );
    let meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join("server.json")).unwrap()).unwrap();
    assert_eq!(meta["version"], "1.2.3.4");
    assert_eq!(meta["name"], "Integration");
    assert_eq!(downloads.load(Ordering::SeqCst), 1);

    let info = manager.server_info(&id).await.unwrap();
    assert!(info.exist);
    assert!(!info.active);
    assert_eq!(info.world_name, "Bedrock level");

    manager.shutdown().await;
}

#[tokio::test]
async fn shared_version_is_downloaded_once() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, downloads) = spawn_site().await;
    let manager = Manager::new(settings(dir.path(), Some(addr))).await.unwrap();

    let mut ids = Vec::new();
    for id in ["one", "two", "three"] {
        let server = manager
            .start_create_server(CreateServer {
                id: Some(id.to_string()),
                version: Some("1.1.0.9".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        ids.push(server.id().to_string());
    }
    for id in &ids {
        let status = finish(&manager, id).await;
        assert_eq!(status.state, PipelineState::Completed, "{id}: {status:?}");
    }
    assert_eq!(downloads.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_servers().await.unwrap().len(), 3);

    let dup = manager
        .start_create_server(CreateServer {
            id: Some("two".to_string()),
            version: Some("1.1.0.9".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(dup, Error::AlreadyExists { .. }));
}

#[tokio::test]
async fn failed_unpack_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let versions = dir.path().join("versions");
    std::fs::create_dir_all(&versions).unwrap();
    std::fs::write(versions.join("bedrock-server-6.6.6.6.zip"), b"not a zip").unwrap();

    let manager = Manager::new(settings(dir.path(), None)).await.unwrap();
    manager
        .start_create_server(CreateServer {
            id: Some("broken".to_string()),
            version: Some("6.6.6.6".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let root = dir.path().join("servers").join("broken");
    let mut rolled_back = false;
    for _ in 0..100 {
        if manager.get_server_create_status("broken").is_err() && !root.exists() {
            rolled_back = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(rolled_back);
    assert!(matches!(
        manager.get_server("broken").await.unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[tokio::test]
async fn unreachable_version_page_fails_creation() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(settings(dir.path(), None)).await.unwrap();
    let err = manager
        .start_create_server(CreateServer::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), warden_agent::ErrorKind::IoFailure);
    assert!(manager.get_servers().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_during_download_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, downloads) = spawn_slow_site(Duration::from_millis(1500)).await;
    let manager = Manager::new(settings(dir.path(), Some(addr))).await.unwrap();

    manager
        .start_create_server(CreateServer {
            id: Some("doomed".to_string()),
            version: Some("1.2.3.4".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let pipeline = manager.create_pipeline("doomed").unwrap();
    let mut downloading = false;
    for _ in 0..100 {
        if downloads.load(Ordering::SeqCst) > 0 {
            downloading = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(downloading);

    manager.delete_server("doomed").await.unwrap();
    let status = pipeline.status();
    assert!(!status.is_running);
    assert_ne!(status.state, PipelineState::Running);

    let root = dir.path().join("servers").join("doomed");
    assert!(!root.exists());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!root.exists());
    assert!(matches!(
        manager.get_server("doomed").await.unwrap_err(),
        Error::NotFound { .. }
    ));
}
