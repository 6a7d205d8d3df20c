use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures_util::StreamExt;
use regex::Regex;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const ATTEMPTS: u32 = 3;

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"bedrock-server-(\d+\.\d+\.\d+\.\d+)\.zip").expect("version regex is valid")
    })
}

fn download_locks() -> &'static std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
}

fn lock_for(key: &str) -> Arc<Mutex<()>> {
    let mut map = download_locks().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("warden-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .expect("failed to build reqwest client")
    })
}

/// Numeric ordering key for dotted versions; unparsable parts sort as zero.
pub(crate) fn version_key(v: &str) -> Vec<u64> {
    v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
}

/// Highest `bedrock-server-<a.b.c.d>.zip` version mentioned in `page`.
pub fn parse_latest_version(page: &str) -> Option<String> {
    version_re()
        .captures_iter(page)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .max_by_key(|v| version_key(v))
}

pub fn archive_file_name(version: &str) -> String {
    format!("bedrock-server-{version}.zip")
}

/// Fetches the download page and extracts the newest version, retrying the whole sequence.
pub async fn latest_version(page_url: &str) -> Result<String> {
    let mut last_err: Option<Error> = None;
    for attempt in 1..=ATTEMPTS {
        let res: Result<String> = async {
            let body = http_client()
                .get(page_url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::http(format!("fetch version page {page_url}"), e))?
                .text()
                .await
                .map_err(|e| Error::http("read version page body", e))?;
            parse_latest_version(&body).ok_or_else(|| {
                Error::Internal(anyhow::anyhow!(
                    "no server version found on the download page"
                ))
            })
        }
        .await;

        match res {
            Ok(v) => {
                info!(version = %v, "resolved latest server version");
                return Ok(v);
            }
            Err(e) => {
                warn!(attempt, error = %e, "version discovery failed");
                last_err = Some(e);
                if attempt < ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                }
            }
        }
    }

    Err(exhausted(last_err, "resolve latest version"))
}

/// Final error of a retried operation; transport and file failures keep their variant.
fn exhausted(last: Option<Error>, what: &str) -> Error {
    let note = format!("{what} after {ATTEMPTS} attempts");
    match last {
        Some(Error::Http { context, source }) => Error::http(format!("{context} ({note})"), source),
        Some(Error::Io { context, source }) => Error::io(format!("{context} ({note})"), source),
        Some(other) => Error::Internal(anyhow::Error::new(other).context(note)),
        None => Error::Internal(anyhow::anyhow!("{note}")),
    }
}

async fn fetch_to(url: &str, dest: &Path) -> Result<u64> {
    let resp = http_client()
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::http(format!("download {url}"), e))?;

    let mut f = tokio::fs::File::create(dest)
        .await
        .map_err(|e| Error::io_at("create", dest, e))?;
    let mut stream = resp.bytes_stream();
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::http(format!("read body of {url}"), e))?;
        f.write_all(&chunk)
            .await
            .map_err(|e| Error::io_at("write", dest, e))?;
        total += chunk.len() as u64;
    }
    f.sync_all().await.ok();
    Ok(total)
}

/// Makes sure the distribution archive for `version` is cached under `versions_dir`.
///
/// The archive is shared by every server on that version and is never downloaded again once
/// present. Concurrent callers for one version serialize on a per-version lock and a partial
/// download is never visible under the final name.
pub async fn ensure_distribution(versions_dir: &Path, url: &str, version: &str) -> Result<PathBuf> {
    let path = versions_dir.join(archive_file_name(version));
    if path.is_file() {
        return Ok(path);
    }

    let lock = lock_for(&path.to_string_lossy());
    let _guard = lock.lock().await;
    if path.is_file() {
        return Ok(path);
    }

    tokio::fs::create_dir_all(versions_dir)
        .await
        .map_err(|e| Error::io_at("create", versions_dir, e))?;
    let tmp = path.with_extension("zip.part");

    let mut last_err: Option<Error> = None;
    for attempt in 1..=ATTEMPTS {
        match fetch_to(url, &tmp).await {
            Ok(bytes) => {
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| Error::io_at("rename", &path, e))?;
                info!(version, bytes, path = %path.display(), "distribution downloaded");
                return Ok(path);
            }
            Err(e) => {
                warn!(version, attempt, error = %e, "distribution download failed");
                last_err = Some(e);
                let _ = tokio::fs::remove_file(&tmp).await;
                if attempt < ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(
                        200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                    ))
                    .await;
                }
            }
        }
    }

    debug!(version, url, "giving up on distribution download");
    Err(exhausted(last_err, "download distribution"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_version_on_page() {
        let page = r#"
<a href="https://www.minecraft.net/bedrockdedicatedserver/bin-win/bedrock-server-1.20.81.01.zip">
<a href="https://www.minecraft.net/bedrockdedicatedserver/bin-linux/bedrock-server-1.21.2.02.zip">
<a href="https://www.minecraft.net/bedrockdedicatedserver/bin-linux/bedrock-server-1.21.10.1.zip">
"#;
        assert_eq!(parse_latest_version(page).as_deref(), Some("1.21.10.1"));
        assert_eq!(parse_latest_version("<html></html>"), None);
    }

    #[tokio::test]
    async fn unreachable_page_reports_transport_error() {
        let err = latest_version("http://127.0.0.1:9/download/server/bedrock")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }), "{err:?}");
        assert!(err.to_string().contains("after 3 attempts"));
        let payload = err.payload();
        assert_eq!(payload.code, "io_failure");
        assert!(payload.hint.is_some());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_partial_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_distribution(dir.path(), "http://127.0.0.1:9/none.zip", "1.0.0.2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }), "{err:?}");
        assert!(!dir.path().join(archive_file_name("1.0.0.2")).exists());
        assert!(!dir.path().join("bedrock-server-1.0.0.2.zip.part").exists());
    }

    #[tokio::test]
    async fn cached_archive_is_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join(archive_file_name("1.0.0.1"));
        std::fs::write(&cached, b"cached").unwrap();

        // The URL is unroutable, so any network access would fail the call.
        let path = ensure_distribution(dir.path(), "http://127.0.0.1:9/none.zip", "1.0.0.1")
            .await
            .unwrap();
        assert_eq!(path, cached);
        assert_eq!(std::fs::read(&path).unwrap(), b"cached");
    }
}
