use std::{
    path::{Path, PathBuf},
    sync::{OnceLock, Weak},
    time::Duration,
};

use chrono::NaiveDateTime;
use regex::Regex;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    archive,
    error::{Error, Result},
    server::Server,
};

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const MIN_PERIOD: Duration = Duration::from_secs(1);

fn stamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-(\d{8}-\d{6})\.zip$").expect("timestamp regex is valid"))
}

#[derive(Debug, Clone, Copy)]
pub struct BackupPolicy {
    pub interval: Duration,
    pub retention_interval: Duration,
    /// Delay before the first retention pass.
    pub retention_offset: Duration,
    pub keep: usize,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention_interval: Duration::from_secs(86_400),
            retention_offset: Duration::from_secs(3600),
            keep: 24,
        }
    }
}

/// The two background loops of an armed server. Dropping the scheduler cancels them.
#[derive(Debug)]
pub struct BackupScheduler {
    snapshots: JoinHandle<()>,
    retention: JoinHandle<()>,
}

impl BackupScheduler {
    pub fn arm(server: Weak<Server>, policy: BackupPolicy) -> Self {
        // A zero period would panic inside the spawned loop.
        Self {
            snapshots: tokio::spawn(snapshot_loop(
                server.clone(),
                policy.interval.max(MIN_PERIOD),
            )),
            retention: tokio::spawn(retention_loop(
                server,
                policy.retention_offset,
                policy.retention_interval.max(MIN_PERIOD),
                policy.keep,
            )),
        }
    }

    pub fn disarm(self) {
        drop(self);
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.snapshots.abort();
        self.retention.abort();
    }
}

async fn snapshot_loop(server: Weak<Server>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(server) = server.upgrade() else {
            return;
        };
        if !server.active().await {
            debug!(server_id = %server.id(), "server inactive; skipping backup");
            continue;
        }
        match server.backup_now().await {
            Ok(path) => info!(server_id = %server.id(), path = %path.display(), "backup written"),
            Err(e) => warn!(server_id = %server.id(), error = %e, "backup failed"),
        }
    }
}

async fn retention_loop(server: Weak<Server>, offset: Duration, every: Duration, keep: usize) {
    let mut ticker = tokio::time::interval_at(Instant::now() + offset, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(server) = server.upgrade() else {
            return;
        };
        match rotate_backups(server.backup_dir(), keep).await {
            Ok(removed) if !removed.is_empty() => {
                info!(server_id = %server.id(), removed = removed.len(), "old backups pruned");
            }
            Ok(_) => {}
            Err(e) => warn!(server_id = %server.id(), error = %e, "backup rotation failed"),
        }
    }
}

fn sanitize_name(name: &str) -> String {
    let out: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "server".to_string() } else { out }
}

pub fn backup_file_name(name: &str, at: NaiveDateTime) -> String {
    format!("{}-{}.zip", sanitize_name(name), at.format(TIMESTAMP_FORMAT))
}

/// Timestamp embedded at the end of a backup file name.
pub fn parse_backup_time(file_name: &str) -> Option<NaiveDateTime> {
    let caps = stamp_re().captures(file_name)?;
    NaiveDateTime::parse_from_str(caps.get(1)?.as_str(), TIMESTAMP_FORMAT).ok()
}

/// Archives `world_dir` into `backup_dir/<name>-<timestamp>.zip`.
pub async fn snapshot(world_dir: &Path, backup_dir: &Path, name: &str) -> Result<PathBuf> {
    let dest = backup_dir.join(backup_file_name(name, chrono::Local::now().naive_local()));
    let src = world_dir.to_path_buf();
    let out = dest.clone();
    tokio::task::spawn_blocking(move || archive::zip_dir(&src, &out))
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("backup task: {e}")))??;
    Ok(dest)
}

/// Keeps the `keep` newest backups by embedded timestamp and deletes the rest by full path.
///
/// Files without a timestamped name are left alone.
pub async fn rotate_backups(backup_dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut rd = match tokio::fs::read_dir(backup_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at("list", backup_dir, e)),
    };

    let mut stamped = Vec::new();
    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|e| Error::io_at("list", backup_dir, e))?
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(at) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_backup_time)
        else {
            continue;
        };
        stamped.push((at, path));
    }

    // Newest first.
    stamped.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut removed = Vec::new();
    for (_, path) in stamped.into_iter().skip(keep) {
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Error::io_at("remove", &path, e))?;
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, NaiveDate};

    use super::*;

    fn base_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn file_name_round_trips_timestamp() {
        let at = base_time() + ChronoDuration::seconds(3723);
        let name = backup_file_name("My World/1", at);
        assert_eq!(name, "My_World_1-20240501-010203.zip");
        assert_eq!(parse_backup_time(&name), Some(at));
        assert_eq!(parse_backup_time("notes.txt"), None);
    }

    #[tokio::test]
    async fn rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        // Written in shuffled order so directory order says nothing about age.
        let mut hours: Vec<i64> = (0..30).collect();
        hours.reverse();
        hours.swap(3, 17);
        for h in &hours {
            let at = base_time() + ChronoDuration::hours(*h);
            std::fs::write(dir.path().join(backup_file_name("srv", at)), b"zip").unwrap();
        }
        std::fs::write(dir.path().join("README"), b"keep me").unwrap();

        let removed = rotate_backups(dir.path(), 24).await.unwrap();
        assert_eq!(removed.len(), 6);

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".zip"))
            .collect();
        left.sort();
        assert_eq!(left.len(), 24);
        let oldest_kept = base_time() + ChronoDuration::hours(6);
        assert_eq!(left[0], backup_file_name("srv", oldest_kept));
        assert!(dir.path().join("README").exists());
    }

    #[tokio::test]
    async fn zero_periods_do_not_kill_the_loops() {
        let policy = BackupPolicy {
            interval: Duration::ZERO,
            retention_interval: Duration::ZERO,
            retention_offset: Duration::from_secs(3600),
            keep: 24,
        };
        let scheduler = BackupScheduler::arm(Weak::new(), policy);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!scheduler.snapshots.is_finished());
        assert!(!scheduler.retention.is_finished());
        scheduler.disarm();
    }

    #[tokio::test]
    async fn rotation_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let removed = rotate_backups(&dir.path().join("nope"), 24).await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn snapshot_archives_world() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("worlds").join("Bedrock level");
        std::fs::create_dir_all(&world).unwrap();
        std::fs::write(world.join("level.dat"), b"data").unwrap();

        let backups = dir.path().join("backups");
        let path = snapshot(&world, &backups, "Bedrock level").await.unwrap();
        assert!(path.is_file());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("Bedrock_level-"));
        assert!(parse_backup_time(name).is_some());
    }
}
