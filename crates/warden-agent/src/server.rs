use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OnceCell};
use tracing::{info, warn};
use warden_process::{DriverConfig, ProcessDriver, ProcessStatus, platform_driver};

use crate::{
    archive,
    backup::{self, BackupPolicy, BackupScheduler},
    error::{Error, Result},
    properties::{self, ServerProperties},
};

pub const DEFAULT_SERVER_NAME: &str = "Dedicated Server";
pub const DEFAULT_WORLD_NAME: &str = "Bedrock level";

const META_FILE: &str = "server.json";
const LEGACY_VERSION_FILE: &str = "version.txt";
const ALLOW_LIST_FILE: &str = "allowlist.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerMeta {
    pub name: String,
    pub description: String,
    pub world_name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListEntry {
    #[serde(default)]
    pub xuid: String,
    pub name: String,
    #[serde(rename = "ignoresPlayerLimit", default)]
    pub ignores_player_limit: bool,
}

#[derive(Debug, Clone)]
pub struct ServerPaths {
    pub root: PathBuf,
    pub logs_dir: PathBuf,
    pub log_file: PathBuf,
    pub worlds_dir: PathBuf,
    pub allow_list: PathBuf,
    pub properties: PathBuf,
    pub meta: PathBuf,
    pub backups: PathBuf,
}

impl ServerPaths {
    pub fn new(root: PathBuf, backups: PathBuf) -> Self {
        let logs_dir = root.join("logs");
        Self {
            log_file: logs_dir.join("console.log"),
            logs_dir,
            worlds_dir: root.join("worlds"),
            allow_list: root.join(ALLOW_LIST_FILE),
            properties: root.join(properties::FILE_NAME),
            meta: root.join(META_FILE),
            backups,
            root,
        }
    }
}

/// Per-server knobs handed down from the agent settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub stop_timeout: Duration,
    pub backup: BackupPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            stop_timeout: warden_process::DEFAULT_STOP_TIMEOUT,
            backup: BackupPolicy::default(),
        }
    }
}

/// One provisioned server: its process, its config store, its allow list and its backups.
pub struct Server {
    id: String,
    paths: ServerPaths,
    meta: RwLock<ServerMeta>,
    driver: AsyncMutex<Box<dyn ProcessDriver>>,
    properties: OnceCell<AsyncMutex<ServerProperties>>,
    backups: Mutex<Option<BackupScheduler>>,
    options: ServerOptions,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("root", &self.paths.root)
            .field("meta", &self.meta())
            .finish()
    }
}

fn read_meta(paths: &ServerPaths, id: &str) -> ServerMeta {
    let mut meta = match std::fs::read(&paths.meta) {
        Ok(raw) => match serde_json::from_slice::<ServerMeta>(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(server_id = %id, error = %e, "unreadable server.json; using defaults");
                ServerMeta::default()
            }
        },
        Err(_) => ServerMeta::default(),
    };
    if meta.version.is_empty()
        && let Ok(v) = std::fs::read_to_string(paths.root.join(LEGACY_VERSION_FILE))
    {
        meta.version = v.trim().to_string();
    }
    if meta.name.is_empty() {
        meta.name = id.to_string();
    }
    meta
}

impl Server {
    /// Loads a server from its directory, adopting its process if one is already running.
    pub fn open(id: &str, root: PathBuf, backups: PathBuf, options: ServerOptions) -> Arc<Self> {
        let paths = ServerPaths::new(root, backups);
        let meta = read_meta(&paths, id);
        Self::build(id, paths, meta, options)
    }

    /// A server whose directory is about to be provisioned.
    pub fn placeholder(
        id: &str,
        root: PathBuf,
        backups: PathBuf,
        meta: ServerMeta,
        options: ServerOptions,
    ) -> Arc<Self> {
        Self::build(id, ServerPaths::new(root, backups), meta, options)
    }

    fn build(id: &str, paths: ServerPaths, meta: ServerMeta, options: ServerOptions) -> Arc<Self> {
        let cfg = DriverConfig::new(id, &paths.root, &paths.log_file)
            .with_stop_timeout(options.stop_timeout);
        Arc::new(Self {
            id: id.to_string(),
            driver: AsyncMutex::new(platform_driver(cfg)),
            meta: RwLock::new(meta),
            properties: OnceCell::new(),
            backups: Mutex::new(None),
            paths,
            options,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn paths(&self) -> &ServerPaths {
        &self.paths
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.paths.backups
    }

    pub fn meta(&self) -> ServerMeta {
        self.meta.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn name(&self) -> String {
        self.meta().name
    }

    pub fn version(&self) -> String {
        self.meta().version
    }

    /// Applies `edit` to the metadata and persists `server.json` atomically.
    pub async fn update_meta(&self, edit: impl FnOnce(&mut ServerMeta)) -> Result<ServerMeta> {
        let updated = {
            let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
            edit(&mut meta);
            meta.clone()
        };
        self.save_meta(&updated).await?;
        Ok(updated)
    }

    async fn save_meta(&self, meta: &ServerMeta) -> Result<()> {
        let raw = serde_json::to_vec_pretty(meta)
            .map_err(|e| Error::Internal(anyhow::anyhow!("encode server.json: {e}")))?;
        let tmp = self.paths.meta.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| Error::io_at("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.paths.meta)
            .await
            .map_err(|e| Error::io_at("replace", &self.paths.meta, e))?;
        Ok(())
    }

    /// Whether the server distribution is installed.
    pub async fn exist(&self) -> bool {
        self.driver.lock().await.exists()
    }

    pub async fn active(&self) -> bool {
        self.driver.lock().await.active().await
    }

    pub async fn process_status(&self) -> ProcessStatus {
        self.driver.lock().await.status().await
    }

    pub async fn start(self: &Arc<Self>) -> Result<u32> {
        let pid = self.driver.lock().await.start().await?;
        self.arm_backups();
        info!(server_id = %self.id, pid, "server started");
        Ok(pid)
    }

    pub async fn stop(&self) -> Result<()> {
        self.driver.lock().await.stop().await?;
        self.disarm_backups();
        info!(server_id = %self.id, "server stopped");
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>) -> Result<u32> {
        let pid = self.driver.lock().await.restart().await?;
        self.arm_backups();
        info!(server_id = %self.id, pid, "server restarted");
        Ok(pid)
    }

    fn arm_backups(self: &Arc<Self>) {
        let scheduler = BackupScheduler::arm(Arc::downgrade(self), self.options.backup);
        // Replacing an armed scheduler drops and cancels the old one.
        *self.backups.lock().unwrap_or_else(|e| e.into_inner()) = Some(scheduler);
    }

    pub(crate) fn disarm_backups(&self) {
        if let Some(scheduler) = self.backups.lock().unwrap_or_else(|e| e.into_inner()).take() {
            scheduler.disarm();
        }
    }

    pub fn backups_armed(&self) -> bool {
        self.backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The config store, parsed on first use and shared for the server's lifetime.
    pub async fn properties(&self) -> Result<MutexGuard<'_, ServerProperties>> {
        let cell = self
            .properties
            .get_or_try_init(|| async {
                ServerProperties::open(&self.paths.properties)
                    .await
                    .map(AsyncMutex::new)
            })
            .await?;
        Ok(cell.lock().await)
    }

    pub async fn world_name(&self) -> String {
        if let Ok(props) = self.properties().await
            && let Some(level) = props.level_name().filter(|v| !v.is_empty())
        {
            return level.to_string();
        }
        let meta = self.meta();
        if meta.world_name.is_empty() {
            DEFAULT_WORLD_NAME.to_string()
        } else {
            meta.world_name
        }
    }

    pub async fn world_dir(&self) -> PathBuf {
        self.paths.worlds_dir.join(self.world_name().await)
    }

    /// Sends one console command to the running server.
    pub async fn exec(&self, args: &[&str]) -> Result<()> {
        self.driver.lock().await.exec_cmd(args).await?;
        Ok(())
    }

    async fn require_active(&self, op: &str) -> Result<()> {
        if !self.active().await {
            return Err(Error::InvalidState(format!(
                "server {} must be running to {op}",
                self.id
            )));
        }
        Ok(())
    }

    pub async fn allow_list_add(&self, user: &str) -> Result<()> {
        let user = validate_user(user)?;
        self.require_active("edit the allow list").await?;
        self.exec(&["allowlist", "add", user]).await
    }

    pub async fn allow_list_remove(&self, user: &str) -> Result<()> {
        let user = validate_user(user)?;
        self.require_active("edit the allow list").await?;
        self.exec(&["allowlist", "remove", user]).await
    }

    pub async fn allow_list_on(&self) -> Result<()> {
        self.require_active("enable the allow list").await?;
        self.exec(&["allowlist", "on"]).await
    }

    pub async fn allow_list_off(&self) -> Result<()> {
        self.require_active("disable the allow list").await?;
        self.exec(&["allowlist", "off"]).await
    }

    /// Entries of `allowlist.json` as last written by the server process.
    pub async fn allow_list(&self) -> Result<Vec<AllowListEntry>> {
        let raw = match tokio::fs::read(&self.paths.allow_list).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_at("read", &self.paths.allow_list, e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|e| {
            Error::Validation(format!("parse {}: {e}", self.paths.allow_list.display()))
        })
    }

    pub async fn scan_log(&self, lines: usize) -> Result<String> {
        Ok(warden_process::scan_log(&self.paths.log_file, lines).await?)
    }

    /// Replaces the world data directory with the contents of a save archive.
    pub async fn apply_save(&self, save: &Path) -> Result<()> {
        if !self.exist().await {
            return Err(Error::InvalidState(format!(
                "server {} is not installed",
                self.id
            )));
        }
        if !save.is_file() {
            return Err(Error::not_found("save", save.display().to_string()));
        }

        let world_dir = self.world_dir().await;
        if world_dir.exists() {
            tokio::fs::remove_dir_all(&world_dir)
                .await
                .map_err(|e| Error::io_at("remove", &world_dir, e))?;
        }
        tokio::fs::create_dir_all(&world_dir)
            .await
            .map_err(|e| Error::io_at("create", &world_dir, e))?;

        let src = save.to_path_buf();
        let out = world_dir.clone();
        let files = tokio::task::spawn_blocking(move || archive::extract_zip_safely(&src, &out))
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("extract task: {e}")))??;
        info!(server_id = %self.id, save = %save.display(), files, "save applied");
        Ok(())
    }

    /// Takes a backup of the world directory immediately.
    pub async fn backup_now(&self) -> Result<PathBuf> {
        let world_dir = self.world_dir().await;
        backup::snapshot(&world_dir, &self.paths.backups, &self.name()).await
    }

    /// Stops the server if it is running and removes its directory.
    pub async fn delete(&self) -> Result<()> {
        if self.active().await {
            self.stop().await?;
        }
        self.disarm_backups();
        if self.paths.root.exists() {
            tokio::fs::remove_dir_all(&self.paths.root)
                .await
                .map_err(|e| Error::io_at("remove", &self.paths.root, e))?;
        }
        info!(server_id = %self.id, "server deleted");
        Ok(())
    }
}

fn validate_user(user: &str) -> Result<&str> {
    let user = user.trim();
    if user.is_empty() || user.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(format!("invalid user name {user:?}")));
    }
    Ok(user)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FAKE_SERVER: &str =
        "#!/bin/sh\necho started\nwhile read line; do\n  echo \"got $line\"\ndone\n";

    pub(crate) const PROPERTIES: &str = "server-name=Dedicated Server\ngamemode=survival\nlevel-name=Bedrock level\n";

    /// Lays out a minimal installed server under `root`.
    pub(crate) fn install(root: &Path) {
        std::fs::create_dir_all(root).unwrap();
        std::fs::write(root.join(properties::FILE_NAME), PROPERTIES).unwrap();
        let exec = root.join(warden_process::EXEC_NAME);
        std::fs::write(&exec, FAKE_SERVER).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exec, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn options() -> ServerOptions {
        ServerOptions {
            stop_timeout: Duration::from_secs(3),
            backup: BackupPolicy::default(),
        }
    }

    async fn wait_for_log(server: &Server, needle: &str) -> bool {
        for _ in 0..50 {
            if let Ok(text) = server.scan_log(50).await
                && text.contains(needle)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn meta_falls_back_to_legacy_version_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("7");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(LEGACY_VERSION_FILE), "1.20.1.02\n").unwrap();

        let server = Server::open("7", root.clone(), dir.path().join("b"), options());
        assert_eq!(server.version(), "1.20.1.02");
        assert_eq!(server.name(), "7");

        server
            .update_meta(|m| m.description = "survival world".to_string())
            .await
            .unwrap();
        let reopened = Server::open("7", root, dir.path().join("b"), options());
        assert_eq!(reopened.meta().description, "survival world");
        assert_eq!(reopened.version(), "1.20.1.02");
    }

    #[tokio::test]
    async fn allow_list_reads_process_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("1");
        install(&root);
        let server = Server::open("1", root.clone(), dir.path().join("b"), options());
        assert!(server.allow_list().await.unwrap().is_empty());

        std::fs::write(
            root.join(ALLOW_LIST_FILE),
            r#"[{"ignoresPlayerLimit":false,"name":"Steve","xuid":"2535"}]"#,
        )
        .unwrap();
        let list = server.allow_list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "Steve");
        assert_eq!(list[0].xuid, "2535");
        assert!(!list[0].ignores_player_limit);
    }

    #[tokio::test]
    async fn allow_list_edits_require_running_server() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("2");
        install(&root);
        let server = Server::open("2", root, dir.path().join("b"), options());
        let err = server.allow_list_add("Steve").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = server.allow_list_add("  ").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn properties_are_parsed_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("3");
        install(&root);
        let server = Server::open("3", root.clone(), dir.path().join("b"), options());
        server
            .properties()
            .await
            .unwrap()
            .set("gamemode", "creative", true)
            .await
            .unwrap();
        assert_eq!(
            server.properties().await.unwrap().get("gamemode"),
            Some("creative")
        );
        assert_eq!(server.world_dir().await, root.join("worlds").join("Bedrock level"));
    }

    #[tokio::test]
    async fn apply_save_replaces_world() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("4");
        install(&root);
        let server = Server::open("4", root.clone(), dir.path().join("b"), options());

        let world = server.world_dir().await;
        std::fs::create_dir_all(&world).unwrap();
        std::fs::write(world.join("stale.dat"), b"old").unwrap();

        let staged = dir.path().join("staged");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("level.dat"), b"new").unwrap();
        let save = dir.path().join("save.zip");
        archive::zip_dir(&staged, &save).unwrap();

        server.apply_save(&save).await.unwrap();
        assert!(!world.join("stale.dat").exists());
        assert_eq!(std::fs::read(world.join("level.dat")).unwrap(), b"new");

        let missing = server.apply_save(&dir.path().join("nope.zip")).await;
        assert!(matches!(missing, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn apply_save_requires_installation() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::open("5", dir.path().join("5"), dir.path().join("b"), options());
        let err = server.apply_save(&dir.path().join("x.zip")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lifecycle_arms_backups_and_sends_commands() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("6");
        install(&root);
        let server = Server::open("6", root.clone(), dir.path().join("b"), options());
        assert!(server.exist().await);
        assert!(!server.backups_armed());

        server.start().await.unwrap();
        assert!(server.active().await);
        assert!(server.backups_armed());
        assert!(matches!(
            server.start().await.unwrap_err(),
            Error::InvalidState(_)
        ));

        server.allow_list_add("Steve").await.unwrap();
        assert!(wait_for_log(&server, "got allowlist add Steve").await);

        std::fs::create_dir_all(server.world_dir().await).unwrap();
        let backup = server.backup_now().await.unwrap();
        assert!(backup.starts_with(dir.path().join("b")));

        server.stop().await.unwrap();
        assert!(!server.active().await);
        assert!(!server.backups_armed());
        assert!(matches!(server.stop().await.unwrap_err(), Error::InvalidState(_)));

        server.delete().await.unwrap();
        assert!(!root.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_replaces_process_and_keeps_backups_armed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("8");
        install(&root);
        let server = Server::open("8", root, dir.path().join("b"), options());

        assert!(matches!(
            server.restart().await.unwrap_err(),
            Error::InvalidState(_)
        ));
        assert!(!server.backups_armed());

        let first = server.start().await.unwrap();
        let second = server.restart().await.unwrap();
        assert_ne!(first, second);
        assert!(server.active().await);
        assert!(server.backups_armed());

        server.exec(&["say", "hello"]).await.unwrap();
        assert!(wait_for_log(&server, "got say hello").await);

        server.stop().await.unwrap();
        assert!(!server.active().await);
        assert!(!server.backups_armed());
    }
}
