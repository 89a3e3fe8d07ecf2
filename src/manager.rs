//! Lifecycle of ephemeral preview servers.
//!
//! Each preview gets its own port, its own directory under
//! [`ManagerConfig::previews_dir`] and its own axum listener. The manager keeps
//! at most [`ManagerConfig::max_servers`] of them alive, evicting the oldest
//! (by creation order, never refreshed) to make room for a new one.

use crate::config::ManagerConfig;
use crate::error::{PreviewError, Result};
use crate::ports::PortAllocator;
use crate::site::{self, ServerHandle, SiteState};
use crate::state::{ActivePreview, CreatedPreview, PreviewDetails, PreviewInstance, Registry};
use crate::workspace::{self, FileMap, ResolvedFile};
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

/// Owns every running preview and the ports they hold.
#[derive(Debug)]
pub struct PreviewManager {
    config: ManagerConfig,
    ports: PortAllocator,
    registry: RwLock<Registry>,
    /// Signalled whenever an in-flight create gives its slot back
    slot_freed: Notify,
    /// Set once shutdown starts; later creates are refused
    closed: AtomicBool,
}

impl PreviewManager {
    pub fn new(config: ManagerConfig) -> Self {
        let ports = PortAllocator::new(
            config.base_port,
            config.max_port_attempts,
            config.bind_host,
        );
        Self {
            config,
            ports,
            registry: RwLock::new(Registry::default()),
            slot_freed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Materialize `files` and serve them on a fresh port.
    ///
    /// When the manager is full the oldest preview is torn down first, and the
    /// call waits for that teardown to finish.
    pub async fn create_preview_server(
        &self,
        project_id: &str,
        files: &FileMap,
    ) -> Result<CreatedPreview> {
        if self.is_closed() {
            return Err(PreviewError::ShuttingDown);
        }
        let files = workspace::resolve_files(files)?;
        let id = self.reserve_slot(project_id).await;

        let launched = self.launch(&id, files).await;
        self.register(launched).await
    }

    /// Give back the in-flight slot and, if launching worked, publish the instance.
    async fn register(&self, launched: Result<PreviewInstance>) -> Result<CreatedPreview> {
        let mut registry = self.registry.write().await;
        registry.finish_create();
        self.slot_freed.notify_waiters();
        let instance = launched?;
        // Shutdown may have drained the registry while this create was running.
        if self.is_closed() {
            drop(registry);
            info!(id = %instance.id, "Discarding preview created during shutdown");
            self.teardown(instance).await;
            return Err(PreviewError::ShuttingDown);
        }
        let created = CreatedPreview {
            port: instance.port,
            url: instance.url.clone(),
            server_id: instance.id.clone(),
        };
        registry.insert(instance);
        info!(
            id = %created.server_id,
            port = created.port,
            active = registry.len(),
            "Created preview server"
        );
        Ok(created)
    }

    /// Tear down one preview. Unknown ids are ignored.
    pub async fn stop_preview_server(&self, id: &str) {
        let instance = self.registry.write().await.remove(id);
        if let Some(instance) = instance {
            self.teardown(instance).await;
            info!(id, "Stopped preview server");
        }
    }

    /// Refuse further creates, then tear down every preview.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_all_servers().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear down every preview concurrently.
    pub async fn stop_all_servers(&self) {
        let instances = self.registry.write().await.drain();
        if instances.is_empty() {
            return;
        }
        let count = instances.len();
        join_all(instances.into_iter().map(|instance| self.teardown(instance))).await;
        info!(count, "Stopped all preview servers");
    }

    /// Snapshot of running previews, oldest first.
    pub async fn active_servers(&self) -> Vec<ActivePreview> {
        self.registry
            .read()
            .await
            .iter()
            .map(PreviewInstance::summary)
            .collect()
    }

    pub async fn get_server(&self, id: &str) -> Option<PreviewDetails> {
        let (summary, created_at, files) = {
            let registry = self.registry.read().await;
            let instance = registry.get(id)?;
            (
                instance.summary(),
                instance.created_at,
                instance.files.clone(),
            )
        };
        let files = files.read().await.iter().cloned().collect();
        Some(PreviewDetails {
            id: summary.id,
            port: summary.port,
            url: summary.url,
            age_secs: created_at.elapsed().as_secs(),
            files,
        })
    }

    /// Write `files` into a running preview, keeping everything already there.
    pub async fn update_preview_files(&self, id: &str, files: &FileMap) -> Result<()> {
        let (root, written) = {
            let registry = self.registry.read().await;
            let instance = registry.get(id).ok_or_else(|| PreviewError::NotFound {
                id: id.to_string(),
            })?;
            (instance.root_directory.clone(), instance.files.clone())
        };
        let files = workspace::resolve_files(files)?;
        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();

        // Teardown takes this lock before deleting the root, so once we hold
        // it the directory is either still there or already gone for good.
        let mut written = written.write().await;
        if !root.exists() {
            return Err(PreviewError::NotFound { id: id.to_string() });
        }
        tokio::task::spawn_blocking(move || workspace::write_files(&root, &files)).await??;
        written.extend(paths);

        info!(id, files = written.len(), "Updated preview files");
        Ok(())
    }

    /// Claim a capacity slot, evicting the oldest previews if needed, and pick an id.
    async fn reserve_slot(&self, project_id: &str) -> String {
        let prefix = workspace::sanitize_project_id(project_id);
        let capacity = self.config.max_servers.max(1);
        loop {
            let mut evicted = Vec::new();
            let (reserved, waiter) = {
                let mut registry = self.registry.write().await;
                while registry.occupied() >= capacity {
                    match registry.pop_oldest() {
                        Some(oldest) => evicted.push(oldest),
                        None => break,
                    }
                }

                if registry.occupied() < capacity {
                    registry.begin_create();
                    let id = loop {
                        let id = generate_id(&prefix);
                        if !registry.contains(&id) {
                            break id;
                        }
                    };
                    (Some(id), None)
                } else {
                    // Every slot belongs to a create still in flight.
                    (None, Some(self.slot_freed.notified()))
                }
            };

            for instance in evicted {
                info!(id = %instance.id, port = instance.port, "Evicting oldest preview server");
                self.teardown(instance).await;
            }

            match (reserved, waiter) {
                (Some(id), _) => return id,
                (None, Some(waiter)) => waiter.await,
                (None, None) => {}
            }
        }
    }

    async fn launch(&self, id: &str, files: Vec<ResolvedFile>) -> Result<PreviewInstance> {
        let (port, listener) = self.ports.acquire().await?;

        let previews_dir = self.config.previews_dir.clone();
        let instance_id = id.to_string();
        let materialized =
            tokio::task::spawn_blocking(move || -> Result<(PathBuf, BTreeSet<String>)> {
                let root = workspace::create_instance_root(&previews_dir, &instance_id)?;
                if let Err(e) = workspace::write_files(&root, &files) {
                    let _ = workspace::destroy_instance_root(&root);
                    return Err(e);
                }
                let paths = files.into_iter().map(|f| f.path).collect();
                Ok((root, paths))
            })
            .await;

        let (root, paths) = match materialized {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                drop(listener);
                self.ports.release(port);
                return Err(e);
            }
            Err(e) => {
                drop(listener);
                self.ports.release(port);
                let root = self.config.previews_dir.join(id);
                let _ = tokio::task::spawn_blocking(move || workspace::destroy_instance_root(&root))
                    .await;
                return Err(e.into());
            }
        };

        let site_state = SiteState {
            root: root.clone(),
            files: Arc::new(RwLock::new(paths)),
        };
        let handle = ServerHandle::spawn(listener, site::build_router(site_state.clone()));

        Ok(PreviewInstance {
            id: id.to_string(),
            port,
            url: format!("http://{}:{}", self.config.public_host, port),
            root_directory: root,
            files: site_state.files,
            created_at: Instant::now(),
            handle,
        })
    }

    /// Close the listener, release the port and delete the files.
    ///
    /// Never fails: problems are logged so the capacity bookkeeping stays exact.
    async fn teardown(&self, instance: PreviewInstance) {
        let PreviewInstance {
            id,
            port,
            root_directory,
            files,
            handle,
            ..
        } = instance;

        handle.close(self.config.shutdown_grace).await;
        self.ports.release(port);

        let _guard = files.write().await;
        let root = root_directory.clone();
        match tokio::task::spawn_blocking(move || workspace::destroy_instance_root(&root)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                %id,
                path = %root_directory.display(),
                error = %e,
                "Failed to remove preview directory"
            ),
            Err(e) => warn!(%id, error = %e, "Preview directory cleanup task failed"),
        }
    }
}

fn generate_id(prefix: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("preview_{}_{}", prefix, &random[..12])
}
