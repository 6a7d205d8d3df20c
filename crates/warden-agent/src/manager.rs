//! Directory-backed registry of servers and save archives.
//!
//! Both indices are immutable snapshots behind a lock that is held only long enough to clone or
//! replace the `Arc`, so readers always see one complete scan. Rescans are skipped while the
//! snapshot is younger than the cache TTL and are forced periodically by a background ticker.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Arc, Mutex, RwLock, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncRead,
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    archive,
    backup::BackupPolicy,
    download,
    error::{Error, Result},
    listing::{Page, PageQuery, SortOrder, paginate},
    pipeline::{PipelineState, Task, TaskPipeline, TaskStatus},
    saves::{self, SaveInfo},
    server::{AllowListEntry, DEFAULT_SERVER_NAME, DEFAULT_WORLD_NAME, Server, ServerMeta, ServerOptions},
    settings::AgentSettings,
};

const ID_ATTEMPTS: usize = 1000;

type ServerIndex = HashMap<String, Arc<Server>>;
type SaveIndex = HashMap<String, SaveInfo>;

/// Parameters of a new server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateServer {
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub world_name: Option<String>,
    pub version: Option<String>,
}

/// Editable server metadata. World name and version are fixed after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub world_name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub world_name: String,
    pub version: String,
    pub exist: bool,
    pub active: bool,
    pub pid: Option<u32>,
    pub create_status: Option<TaskStatus>,
    pub properties: BTreeMap<String, String>,
    pub allow_list: Vec<AllowListEntry>,
}

struct Inner {
    settings: AgentSettings,
    options: ServerOptions,
    servers: RwLock<Arc<ServerIndex>>,
    saves: RwLock<Arc<SaveIndex>>,
    pipelines: Mutex<HashMap<String, Arc<TaskPipeline>>>,
    last_scan: Mutex<Option<Instant>>,
    last_save_scan: Mutex<Option<Instant>>,
    scan_lock: AsyncMutex<()>,
    save_scan_lock: AsyncMutex<()>,
}

pub struct Manager {
    inner: Arc<Inner>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("data_root", &self.inner.settings.data_root)
            .field("servers", &self.inner.server_snapshot().len())
            .finish()
    }
}

fn is_stale(last: &Mutex<Option<Instant>>, ttl: Duration) -> bool {
    last.lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_none_or(|t| t.elapsed() >= ttl)
}

fn mark_scanned(last: &Mutex<Option<Instant>>) {
    *last.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.len() > 64
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!("invalid server id {id:?}")));
    }
    Ok(())
}

impl Inner {
    fn server_snapshot(&self) -> Arc<ServerIndex> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn install_servers(&self, next: ServerIndex) {
        *self.servers.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }

    fn save_snapshot(&self) -> Arc<SaveIndex> {
        self.saves.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pipeline(&self, id: &str) -> Option<Arc<TaskPipeline>> {
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn server_root(&self, id: &str) -> PathBuf {
        self.settings.servers_dir().join(id)
    }

    fn backup_root(&self, id: &str) -> PathBuf {
        self.settings.backups_dir().join(id)
    }

    fn open_server(&self, id: &str) -> Arc<Server> {
        Server::open(id, self.server_root(id), self.backup_root(id), self.options)
    }

    async fn scan(&self, force: bool) -> Result<()> {
        let _guard = self.scan_lock.lock().await;
        if !force && !is_stale(&self.last_scan, self.settings.cache_ttl()) {
            return Ok(());
        }

        let dir = self.settings.servers_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io_at("create", &dir, e))?;

        let mut ids = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::io_at("list", &dir, e))?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| Error::io_at("list", &dir, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Some(id)) = (is_dir, entry.file_name().to_str()) {
                ids.push(id.to_string());
            }
        }

        let current = self.server_snapshot();
        let mut next = ServerIndex::with_capacity(ids.len());
        for id in ids {
            let server = match current.get(&id) {
                Some(existing) => existing.clone(),
                None => {
                    debug!(server_id = %id, "discovered server");
                    self.open_server(&id)
                }
            };
            next.insert(id, server);
        }

        // A provisioning server may not have its directory yet.
        let in_flight: Vec<String> = self
            .pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, p)| matches!(p.status().state, PipelineState::Idle | PipelineState::Running))
            .map(|(id, _)| id.clone())
            .collect();
        for id in in_flight {
            if let Some(server) = current.get(&id) {
                next.entry(id).or_insert_with(|| server.clone());
            }
        }

        let count = next.len();
        self.install_servers(next);
        mark_scanned(&self.last_scan);
        debug!(servers = count, "server index rebuilt");
        Ok(())
    }

    async fn scan_saves(&self, force: bool) -> Result<()> {
        let _guard = self.save_scan_lock.lock().await;
        if !force && !is_stale(&self.last_save_scan, self.settings.cache_ttl()) {
            return Ok(());
        }
        let dir = self.settings.saves_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io_at("create", &dir, e))?;
        let next = saves::scan_dir(&dir).await?;
        let count = next.len();
        *self.saves.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        mark_scanned(&self.last_save_scan);
        debug!(saves = count, "save index rebuilt");
        Ok(())
    }

    /// Removes `id` from both indices under the scan lock.
    async fn evict(&self, id: &str) {
        let _guard = self.scan_lock.lock().await;
        let current = self.server_snapshot();
        if current.contains_key(id) {
            let mut next = (*current).clone();
            next.remove(id);
            self.install_servers(next);
        }
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

impl Manager {
    /// Builds the registry, runs the initial scans and starts the rescan ticker.
    pub async fn new(settings: AgentSettings) -> Result<Self> {
        let settings = settings.clamped();
        for dir in [
            settings.servers_dir(),
            settings.versions_dir(),
            settings.saves_dir(),
            settings.backups_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io_at("create", &dir, e))?;
        }

        let options = ServerOptions {
            stop_timeout: settings.stop_timeout(),
            backup: BackupPolicy {
                interval: settings.backup_interval(),
                retention_interval: settings.retention_interval(),
                retention_offset: settings.backup_interval(),
                keep: settings.retention_keep,
            },
        };
        let inner = Arc::new(Inner {
            settings,
            options,
            servers: RwLock::new(Arc::new(ServerIndex::new())),
            saves: RwLock::new(Arc::new(SaveIndex::new())),
            pipelines: Mutex::new(HashMap::new()),
            last_scan: Mutex::new(None),
            last_save_scan: Mutex::new(None),
            scan_lock: AsyncMutex::new(()),
            save_scan_lock: AsyncMutex::new(()),
        });
        inner.scan(true).await?;
        inner.scan_saves(true).await?;

        let ticker = tokio::spawn(rescan_loop(
            Arc::downgrade(&inner),
            inner.settings.load_interval(),
        ));
        info!(
            data_root = %inner.settings.data_root.display(),
            servers = inner.server_snapshot().len(),
            saves = inner.save_snapshot().len(),
            "manager ready"
        );
        Ok(Self {
            inner,
            tickers: Mutex::new(vec![ticker]),
        })
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.inner.settings
    }

    /// Rescans the servers directory unless the index is fresh (or `force` is set).
    pub async fn scan(&self, force: bool) -> Result<()> {
        self.inner.scan(force).await
    }

    pub async fn get_server(&self, id: &str) -> Result<Arc<Server>> {
        self.inner.scan(false).await?;
        self.inner
            .server_snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("server", id))
    }

    pub async fn get_servers(&self) -> Result<Arc<HashMap<String, Arc<Server>>>> {
        self.inner.scan(false).await?;
        Ok(self.inner.server_snapshot())
    }

    async fn generate_id(&self) -> Result<String> {
        let index = self.inner.server_snapshot();
        for _ in 0..ID_ATTEMPTS {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let id = nanos.to_string();
            if !index.contains_key(&id)
                && self.inner.pipeline(&id).is_none()
                && !self.inner.server_root(&id).exists()
            {
                return Ok(id);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Err(Error::Internal(anyhow::anyhow!(
            "no unique server id after {ID_ATTEMPTS} attempts"
        )))
    }

    /// Registers a placeholder server and provisions it in the background.
    ///
    /// Progress is available from [`Manager::get_server_create_status`]. If any step fails the
    /// server directory is removed and the id disappears from the registry.
    pub async fn start_create_server(&self, req: CreateServer) -> Result<Arc<Server>> {
        let version = match req.version.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => v.to_string(),
            None => download::latest_version(&self.inner.settings.version_page_url).await?,
        };
        let name = match req.name.trim() {
            "" => DEFAULT_SERVER_NAME.to_string(),
            n => n.to_string(),
        };
        let world_name = req
            .world_name
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .unwrap_or(DEFAULT_WORLD_NAME)
            .to_string();
        let meta = ServerMeta {
            name,
            description: req.description.clone(),
            world_name,
            version,
        };

        let (server, pipeline) = {
            let _guard = self.inner.scan_lock.lock().await;
            let id = match req.id.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                Some(id) => {
                    validate_id(id)?;
                    if self.inner.server_snapshot().contains_key(id)
                        || self.inner.pipeline(id).is_some()
                        || self.inner.server_root(id).exists()
                    {
                        return Err(Error::already_exists("server", id));
                    }
                    id.to_string()
                }
                None => self.generate_id().await?,
            };

            let server = Server::placeholder(
                &id,
                self.inner.server_root(&id),
                self.inner.backup_root(&id),
                meta.clone(),
                self.inner.options,
            );
            let pipeline = Arc::new(self.provisioning_pipeline(&server, meta)?);

            let mut next = (*self.inner.server_snapshot()).clone();
            next.insert(id.clone(), server.clone());
            self.inner.install_servers(next);
            self.inner
                .pipelines
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, pipeline.clone());
            (server, pipeline)
        };

        pipeline.start().await?;
        info!(server_id = %server.id(), version = %server.version(), "provisioning started");
        Ok(server)
    }

    fn provisioning_pipeline(&self, server: &Arc<Server>, meta: ServerMeta) -> Result<TaskPipeline> {
        let id = server.id().to_string();
        let root = server.root().to_path_buf();
        let versions_dir = self.inner.settings.versions_dir();
        let url = self.inner.settings.download_url(&meta.version);
        let version = meta.version.clone();
        let pipeline = TaskPipeline::new(format!("create:{id}"));

        let dir = root.clone();
        pipeline.add_task(Task::new("create directory", move || async move {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io_at("create", &dir, e))?;
            Ok(())
        }))?;

        let cached = versions_dir.join(download::archive_file_name(&version));
        let dl_version = version.clone();
        pipeline.add_task(Task::new("download distribution", move || async move {
            download::ensure_distribution(&versions_dir, &url, &dl_version).await?;
            Ok(())
        }))?;

        let out = root.clone();
        pipeline.add_task(Task::new("unpack distribution", move || async move {
            let files =
                tokio::task::spawn_blocking(move || archive::extract_zip_safely(&cached, &out))
                    .await??;
            debug!(files, "distribution unpacked");
            Ok(())
        }))?;

        let target = server.clone();
        pipeline.add_task(Task::new("configure server", move || async move {
            configure(&target, meta).await?;
            Ok(())
        }))?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        pipeline.on_error(move |task, err| async move {
            error!(server_id = %id, task = %task, error = %format!("{err:#}"), "provisioning failed; rolling back");
            if root.exists()
                && let Err(e) = tokio::fs::remove_dir_all(&root).await
            {
                warn!(server_id = %id, error = %e, path = %root.display(), "rollback could not remove directory");
            }
            if let Some(inner) = weak.upgrade() {
                inner.evict(&id).await;
            }
        });

        Ok(pipeline)
    }

    pub fn get_server_create_status(&self, id: &str) -> Result<TaskStatus> {
        self.inner
            .pipeline(id)
            .map(|p| p.status())
            .ok_or_else(|| Error::not_found("provisioning", id))
    }

    /// The provisioning pipeline of `id`, while it is registered.
    pub fn create_pipeline(&self, id: &str) -> Option<Arc<TaskPipeline>> {
        self.inner.pipeline(id)
    }

    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let server = self.get_server(id).await?;
        if let Some(p) = self.inner.pipeline(id) {
            // The running step finishes before the stop is seen; wait for it so nothing is
            // written into the directory after it is removed.
            p.stop();
            let status = p.join().await;
            debug!(server_id = %id, state = ?status.state, "provisioning halted for delete");
        }
        server.delete().await?;
        self.inner.evict(id).await;
        self.inner.scan(true).await?;
        info!(server_id = %id, "server removed from registry");
        Ok(())
    }

    pub async fn update_server(&self, id: &str, update: ServerUpdate) -> Result<ServerMeta> {
        let server = self.get_server(id).await?;
        let meta = server.meta();
        if let Some(w) = update.world_name.as_deref()
            && w != meta.world_name
        {
            return Err(Error::Validation(
                "world name cannot be changed after creation".to_string(),
            ));
        }
        if let Some(v) = update.version.as_deref()
            && v != meta.version
        {
            return Err(Error::Validation(
                "version cannot be changed after creation".to_string(),
            ));
        }
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::Validation("server name cannot be empty".to_string()));
        }

        server
            .update_meta(|m| {
                if let Some(name) = update.name {
                    m.name = name.trim().to_string();
                }
                if let Some(desc) = update.description {
                    m.description = desc;
                }
            })
            .await
    }

    pub async fn server_info(&self, id: &str) -> Result<ServerInfo> {
        let server = self.get_server(id).await?;
        Ok(self.describe(&server).await)
    }

    async fn describe(&self, server: &Arc<Server>) -> ServerInfo {
        let meta = server.meta();
        let status = server.process_status().await;
        let properties = match server.properties().await {
            Ok(props) => props.all().clone(),
            Err(_) => BTreeMap::new(),
        };
        let allow_list = server.allow_list().await.unwrap_or_else(|e| {
            warn!(server_id = %server.id(), error = %e, "unreadable allow list");
            Vec::new()
        });
        ServerInfo {
            id: server.id().to_string(),
            name: meta.name,
            description: meta.description,
            world_name: meta.world_name,
            version: meta.version,
            exist: server.exist().await,
            active: status.active,
            pid: status.pid,
            create_status: self.inner.pipeline(server.id()).map(|p| p.status()),
            properties,
            allow_list,
        }
    }

    pub async fn list_server_infos(&self, query: &PageQuery) -> Result<Page<ServerInfo>> {
        let index = self.get_servers().await?;
        let mut servers: Vec<(ServerMeta, Arc<Server>)> =
            index.values().map(|s| (s.meta(), s.clone())).collect();

        let field = query.sort.as_deref().unwrap_or("id");
        let cmp: fn(&(ServerMeta, Arc<Server>), &(ServerMeta, Arc<Server>)) -> Ordering = match field
        {
            "id" => |a, b| a.1.id().cmp(b.1.id()),
            "name" => |a, b| a.0.name.cmp(&b.0.name).then_with(|| a.1.id().cmp(b.1.id())),
            "version" => |a, b| {
                download::version_key(&a.0.version)
                    .cmp(&download::version_key(&b.0.version))
                    .then_with(|| a.1.id().cmp(b.1.id()))
            },
            other => {
                return Err(Error::Validation(format!("cannot sort servers by {other:?}")));
            }
        };
        servers.sort_by(cmp);
        if query.order == SortOrder::Desc {
            servers.reverse();
        }

        let page = paginate(servers, query);
        let mut items = Vec::with_capacity(page.items.len());
        for (_, server) in &page.items {
            items.push(self.describe(server).await);
        }
        Ok(Page {
            items,
            total: page.total,
        })
    }

    pub async fn scan_saves(&self, force: bool) -> Result<()> {
        self.inner.scan_saves(force).await
    }

    pub async fn get_save(&self, name: &str) -> Result<SaveInfo> {
        self.inner.scan_saves(false).await?;
        self.inner
            .save_snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("save", name))
    }

    pub async fn list_saves(&self, query: &PageQuery) -> Result<Page<SaveInfo>> {
        self.inner.scan_saves(false).await?;
        let mut items: Vec<SaveInfo> = self.inner.save_snapshot().values().cloned().collect();
        match query.sort.as_deref().unwrap_or("name") {
            "name" => items.sort_by(|a, b| a.name.cmp(&b.name)),
            "size" => items.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.name.cmp(&b.name))),
            "last_modified" => items.sort_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.name.cmp(&b.name))
            }),
            other => {
                return Err(Error::Validation(format!("cannot sort saves by {other:?}")));
            }
        }
        if query.order == SortOrder::Desc {
            items.reverse();
        }
        Ok(paginate(items, query))
    }

    /// Stores an uploaded save archive under its normalized name.
    pub async fn add_save<R>(&self, file_name: &str, mut body: R) -> Result<SaveInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        let name = saves::normalize_save_name(file_name)?;
        self.inner.scan_saves(true).await?;
        let dest = self.inner.settings.saves_dir().join(&name);
        if self.inner.save_snapshot().contains_key(&name) || dest.exists() {
            return Err(Error::already_exists("save", name));
        }

        let tmp = dest.with_extension("zip.part");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::io_at("create", &tmp, e))?;
        let copied = tokio::io::copy(&mut body, &mut f).await;
        drop(f);
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::io_at("write", &tmp, e));
        }
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| Error::io_at("rename", &dest, e))?;
        info!(save = %name, "save uploaded");

        self.inner.scan_saves(true).await?;
        self.inner
            .save_snapshot()
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found("save", name))
    }

    pub async fn delete_save(&self, name: &str) -> Result<()> {
        let save = self.get_save(name).await?;
        tokio::fs::remove_file(&save.path)
            .await
            .map_err(|e| Error::io_at("remove", &save.path, e))?;
        info!(save = %name, "save deleted");
        self.inner.scan_saves(true).await
    }

    /// Destructively replaces the world of `server_id` with the save archive.
    pub async fn apply_save(&self, save_name: &str, server_id: &str) -> Result<()> {
        let save = self.get_save(save_name).await?;
        let server = self.get_server(server_id).await?;
        server.apply_save(&save.path).await
    }

    /// Stops the rescan ticker and every server's backup loops. Server processes keep running.
    pub async fn shutdown(&self) {
        for ticker in self
            .tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            ticker.abort();
        }
        for server in self.inner.server_snapshot().values() {
            server.disarm_backups();
        }
        info!("manager shut down");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        for ticker in self
            .tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            ticker.abort();
        }
    }
}

async fn configure(server: &Arc<Server>, meta: ServerMeta) -> Result<()> {
    let custom_name = meta.name != DEFAULT_SERVER_NAME;
    let custom_world = meta.world_name != DEFAULT_WORLD_NAME;
    if custom_name || custom_world {
        let mut props = server.properties().await?;
        let mut pairs = Vec::new();
        if custom_name {
            pairs.push(("server-name", meta.name.clone()));
        }
        if custom_world {
            pairs.push(("level-name", meta.world_name.clone()));
        }
        props.set_all(pairs, true).await?;
    }
    server.update_meta(|m| *m = meta).await?;
    Ok(())
}

async fn rescan_loop(inner: Weak<Inner>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(e) = inner.scan(true).await {
            warn!(error = %e, "periodic server rescan failed");
        }
        if let Err(e) = inner.scan_saves(true).await {
            warn!(error = %e, "periodic save rescan failed");
        }
    }
}
