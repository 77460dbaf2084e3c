//! Service orchestration.
//!
//! [`McpAgent`] owns the configured service set: it builds one adapter per
//! config entry, drives start/stop/restart, applies configuration reloads by
//! diffing on service id, and hands the aggregator and state manager to the
//! external façade. One service's failure never disturbs another.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::aggregator::Aggregator;
use crate::config::{diff_configs, ServiceConfig, TransportKind};
use crate::errors::GatewayError;
use crate::protocol::types::{ServerCapabilities, ServerInfo, Tool};
use crate::state::{ServiceState, StateManager};
use crate::transport::{build_adapter, EmbeddedService, ServiceAdapter};

// ─── Service table ──────────────────────────────────────────────────────────

/// One configured service: its adapter plus last-known session facts.
pub(crate) struct ServiceEntry {
    pub config: ServiceConfig,
    pub adapter: Arc<dyn ServiceAdapter>,
    pub server_info: Option<ServerInfo>,
    pub capabilities: Option<ServerCapabilities>,
    /// Catalog cached from the last successful discovery; routing reads it.
    pub tools: Vec<Tool>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ServiceEntry {
    fn new(config: ServiceConfig, adapter: Arc<dyn ServiceAdapter>) -> Self {
        Self {
            config,
            adapter,
            server_info: None,
            capabilities: None,
            tools: Vec::new(),
            last_error: None,
            started_at: None,
            last_error_at: None,
        }
    }

    pub(crate) fn note_error(&mut self, error: &GatewayError) {
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
    }
}

/// Registration-ordered service entries, shared with the aggregator.
pub(crate) type ServiceTable = RwLock<Vec<ServiceEntry>>;

// ─── Metadata snapshot ──────────────────────────────────────────────────────

/// Read-only projection of one service for display purposes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServiceMetadata {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub transport: TransportKind,
    pub status: ServiceState,
    pub server_info: Option<ServerInfo>,
    pub capabilities: Option<ServerCapabilities>,
    pub last_error: Option<String>,
    pub tool_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

// ─── McpAgent ───────────────────────────────────────────────────────────────

/// The orchestrator owning adapters, configuration, and lifecycle control.
pub struct McpAgent {
    services: Arc<ServiceTable>,
    states: Arc<StateManager>,
    embedded: HashMap<String, Arc<dyn EmbeddedService>>,
}

impl std::fmt::Debug for McpAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpAgent")
            .field("embedded_ids", &self.embedded.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl McpAgent {
    /// Construct one adapter per config entry, each registered `STOPPED`.
    ///
    /// `embedded` maps service ids to the in-process objects that back
    /// entries with the embedded transport kind. Nothing is started here.
    pub fn new(
        configs: Vec<ServiceConfig>,
        embedded: HashMap<String, Arc<dyn EmbeddedService>>,
    ) -> Result<Self, GatewayError> {
        let states = Arc::new(StateManager::new());
        let mut entries = Vec::with_capacity(configs.len());
        let mut seen = std::collections::HashSet::new();

        for config in configs {
            if !seen.insert(config.id.clone()) {
                return Err(GatewayError::Config {
                    reason: format!("duplicate service id: '{}'", config.id),
                });
            }
            let adapter = build_adapter(
                &config,
                Arc::clone(&states),
                embedded.get(&config.id).cloned(),
            )?;
            states.register(&config.id);
            entries.push(ServiceEntry::new(config, adapter));
        }

        Ok(Self {
            services: Arc::new(RwLock::new(entries)),
            states,
            embedded,
        })
    }

    // ─── Façade accessors ────────────────────────────────────────────────

    /// The merged discovery/invocation surface over this agent's services.
    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(Arc::clone(&self.services), Arc::clone(&self.states))
    }

    /// The canonical state store, for reads and subscriptions.
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.states)
    }

    /// Display snapshot of every configured service, registration order.
    pub async fn metadata(&self) -> Vec<McpServiceMetadata> {
        let table = self.services.read().await;
        table
            .iter()
            .map(|entry| McpServiceMetadata {
                id: entry.config.id.clone(),
                name: entry.config.name.clone(),
                description: entry.config.description.clone(),
                transport: entry.config.transport.kind(),
                status: self.states.get(&entry.config.id),
                server_info: entry.server_info.clone(),
                capabilities: entry.capabilities,
                last_error: entry.last_error.clone(),
                tool_count: entry.tools.len(),
                started_at: entry.started_at,
                last_error_at: entry.last_error_at,
            })
            .collect()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Bring one service up. A no-op when it is already `RUNNING` or
    /// `STARTING`.
    pub async fn start(&self, id: &str) -> Result<(), GatewayError> {
        match self.states.get(id) {
            ServiceState::Running | ServiceState::Starting => {
                tracing::debug!(service = %id, "start requested but already up");
                return Ok(());
            }
            ServiceState::Stopped | ServiceState::Error => {}
        }

        let adapter = self.adapter_for(id).await?;

        match adapter.initialize().await {
            Ok(init) => {
                // Discovery right after the handshake fills the routing
                // cache; a failure here degrades to an empty catalog.
                let tools = match adapter.list_tools().await {
                    Ok(tools) => tools,
                    Err(e) => {
                        tracing::warn!(
                            service = %id,
                            error = %e,
                            "initial tool discovery failed"
                        );
                        Vec::new()
                    }
                };

                let mut table = self.services.write().await;
                if let Some(entry) = table.iter_mut().find(|e| e.config.id == id) {
                    entry.server_info = Some(init.server_info);
                    entry.capabilities = Some(init.capabilities);
                    entry.tools = tools;
                    entry.started_at = Some(Utc::now());
                    entry.last_error = None;
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(service = %id, error = %e, "service failed to start");
                let mut table = self.services.write().await;
                if let Some(entry) = table.iter_mut().find(|e| e.config.id == id) {
                    entry.note_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Take one service down: close the adapter, then force `STOPPED`
    /// regardless of prior state.
    pub async fn stop(&self, id: &str) -> Result<(), GatewayError> {
        let adapter = self.adapter_for(id).await?;
        adapter.close().await;

        if self.states.get(id) != ServiceState::Stopped {
            // Any non-stopped state may move to STOPPED; a lost race with a
            // concurrent transition is not worth surfacing.
            let _ = self.states.set(id, ServiceState::Stopped);
        }
        Ok(())
    }

    /// `stop` followed by `start`.
    pub async fn restart(&self, id: &str) -> Result<(), GatewayError> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Start every service whose config asks for it. A single service's
    /// failure is collected, not propagated — the rest continue.
    pub async fn start_all(&self) -> Vec<(String, GatewayError)> {
        let ids: Vec<String> = {
            let table = self.services.read().await;
            table
                .iter()
                .filter(|entry| entry.config.auto_start)
                .map(|entry| entry.config.id.clone())
                .collect()
        };

        let starts = ids.iter().map(|id| self.start(id));
        let outcomes = futures::future::join_all(starts).await;

        ids.into_iter()
            .zip(outcomes)
            .filter_map(|(id, outcome)| outcome.err().map(|e| (id, e)))
            .collect()
    }

    /// Stop every configured service.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let table = self.services.read().await;
            table.iter().map(|entry| entry.config.id.clone()).collect()
        };
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(service = %id, error = %e, "stop failed");
            }
        }
    }

    // ─── Configuration reload ────────────────────────────────────────────

    /// Apply a reloaded service list, diffing by id.
    ///
    /// Added services are constructed and started per their `auto_start`
    /// preference; removed ones are stopped and discarded; changed ones are
    /// torn down, rebuilt from the new config, and restarted. Work on one
    /// service never disturbs another; per-service failures are returned,
    /// not raised.
    pub async fn apply_config(
        &self,
        new: Vec<ServiceConfig>,
    ) -> Result<Vec<(String, GatewayError)>, GatewayError> {
        let mut seen = std::collections::HashSet::new();
        for config in &new {
            if !seen.insert(config.id.as_str()) {
                return Err(GatewayError::Config {
                    reason: format!("duplicate service id: '{}'", config.id),
                });
            }
        }

        let old: Vec<ServiceConfig> = {
            let table = self.services.read().await;
            table.iter().map(|entry| entry.config.clone()).collect()
        };
        let diff = diff_configs(&old, &new);
        let mut errors = Vec::new();

        for id in &diff.removed {
            tracing::info!(service = %id, "removing service");
            if let Err(e) = self.stop(id).await {
                tracing::warn!(service = %id, error = %e, "stop during removal failed");
            }
            self.services.write().await.retain(|e| &e.config.id != id);
            self.states.remove(id);
        }

        for config in diff.changed {
            let id = config.id.clone();
            tracing::info!(service = %id, "recreating changed service");
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(service = %id, error = %e, "stop during recreate failed");
            }

            let adapter = match build_adapter(
                &config,
                Arc::clone(&self.states),
                self.embedded.get(&id).cloned(),
            ) {
                Ok(adapter) => adapter,
                Err(e) => {
                    errors.push((id, e));
                    continue;
                }
            };

            {
                let mut table = self.services.write().await;
                if let Some(entry) = table.iter_mut().find(|e| e.config.id == id) {
                    *entry = ServiceEntry::new(config, adapter);
                }
            }

            if let Err(e) = self.start(&id).await {
                errors.push((id, e));
            }
        }

        for config in diff.added {
            let id = config.id.clone();
            let auto_start = config.auto_start;
            tracing::info!(service = %id, "adding service");

            let adapter = match build_adapter(
                &config,
                Arc::clone(&self.states),
                self.embedded.get(&id).cloned(),
            ) {
                Ok(adapter) => adapter,
                Err(e) => {
                    errors.push((id, e));
                    continue;
                }
            };

            self.states.register(&id);
            self.services
                .write()
                .await
                .push(ServiceEntry::new(config, adapter));

            if auto_start {
                if let Err(e) = self.start(&id).await {
                    errors.push((id, e));
                }
            }
        }

        Ok(errors)
    }

    async fn adapter_for(&self, id: &str) -> Result<Arc<dyn ServiceAdapter>, GatewayError> {
        let table = self.services.read().await;
        table
            .iter()
            .find(|entry| entry.config.id == id)
            .map(|entry| Arc::clone(&entry.adapter))
            .ok_or_else(|| GatewayError::Config {
                reason: format!("unknown service id: '{id}'"),
            })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
