//! Provider registry: configured providers and the tool route table.
//!
//! Both tables live in memory behind short `RwLock` sections and are mirrored
//! to disk through a [`JsonStore`] each. Every mutation saves immediately; a
//! failed save is logged and the in-memory change stands.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use super::store::JsonStore;
use super::types::{ProviderConfig, ToolDescriptor};

/// File holding provider id → config.
pub const CONFIG_FILE: &str = "clients.json";

/// File holding tool name → provider id.
pub const ROUTES_FILE: &str = "tool_mappings.json";

type ConfigTable = BTreeMap<String, ProviderConfig>;
type RouteTable = BTreeMap<String, String>;

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<ImportFailure>,
}

/// An import entry that was rejected.
#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub id: String,
    pub reason: String,
}

// ─── ProviderRegistry ────────────────────────────────────────────────────────

pub struct ProviderRegistry {
    configs: RwLock<ConfigTable>,
    routes: RwLock<RouteTable>,
    config_store: JsonStore<ConfigTable>,
    route_store: JsonStore<RouteTable>,
    /// Set when the last route save failed, so an unchanged `set_route` still writes.
    routes_dirty: AtomicBool,
}

impl ProviderRegistry {
    /// Load both tables from `config_dir`, creating missing files.
    ///
    /// Routes naming a provider that is not configured are dropped.
    pub fn open(config_dir: &Path) -> Self {
        if let Err(e) = std::fs::create_dir_all(config_dir) {
            tracing::error!(
                error = %e,
                dir = %config_dir.display(),
                "failed to create config directory"
            );
        }

        let config_store: JsonStore<ConfigTable> =
            JsonStore::new(config_dir.join(CONFIG_FILE), "provider configs");
        let route_store: JsonStore<RouteTable> =
            JsonStore::new(config_dir.join(ROUTES_FILE), "tool routes");

        let mut configs = config_store.load();
        for (id, config) in configs.iter_mut() {
            config.id = id.clone();
        }

        let mut routes = route_store.load();
        let before = routes.len();
        routes.retain(|_, provider| configs.contains_key(provider));
        let dropped = before - routes.len();

        tracing::info!(
            providers = configs.len(),
            routes = routes.len(),
            dir = %config_dir.display(),
            "loaded provider registry"
        );

        let registry = Self {
            configs: RwLock::new(configs),
            routes: RwLock::new(routes),
            config_store,
            route_store,
            routes_dirty: AtomicBool::new(false),
        };

        if dropped > 0 {
            tracing::warn!(dropped, "dropped routes naming unknown providers");
            let routes = registry.read_routes();
            registry.persist_routes(&routes);
            drop(routes);
        }

        registry
    }

    // ─── Configs ─────────────────────────────────────────────────────────────

    /// All configured providers, sorted by id.
    pub fn list(&self) -> Vec<ProviderConfig> {
        self.read_configs().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<ProviderConfig> {
        self.read_configs().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read_configs().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read_configs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_configs().is_empty()
    }

    /// Insert or replace a provider config, stamping `last_updated`.
    pub fn upsert(&self, mut config: ProviderConfig) -> ProviderConfig {
        config.last_updated = Some(chrono::Utc::now());

        let mut configs = self.write_configs();
        let replaced = configs.insert(config.id.clone(), config.clone()).is_some();
        self.persist_configs(&configs);

        tracing::info!(provider = %config.id, replaced, "saved provider config");
        config
    }

    /// Remove a provider config and any routes still naming it.
    pub fn delete(&self, id: &str) -> Option<ProviderConfig> {
        let removed = {
            let mut configs = self.write_configs();
            let removed = configs.remove(id);
            if removed.is_some() {
                self.persist_configs(&configs);
            }
            removed
        };

        if removed.is_some() {
            self.remove_routes_for(id);
            tracing::info!(provider = %id, "deleted provider config");
        }
        removed
    }

    /// Providers launched with the same command and args as `id`, including `id`.
    pub fn related(&self, id: &str) -> Option<Vec<ProviderConfig>> {
        let configs = self.read_configs();
        let target = configs.get(id)?;
        Some(
            configs
                .values()
                .filter(|c| c.command == target.command && c.args == target.args)
                .cloned()
                .collect(),
        )
    }

    /// Snapshot of the whole config table, keyed by id.
    pub fn export(&self) -> BTreeMap<String, ProviderConfig> {
        self.read_configs().clone()
    }

    /// Bulk-insert configs. Existing ids are skipped unless `overwrite`.
    ///
    /// Callers are responsible for disconnecting providers that get replaced.
    pub fn import(
        &self,
        entries: BTreeMap<String, ProviderConfig>,
        overwrite: bool,
    ) -> ImportReport {
        let mut report = ImportReport::default();
        let now = chrono::Utc::now();

        let mut configs = self.write_configs();
        for (id, mut config) in entries {
            config.id = id.clone();

            if id.trim().is_empty() {
                report.failed.push(ImportFailure {
                    id,
                    reason: "provider id is empty".into(),
                });
                continue;
            }
            if let Err(e) = config.validate() {
                tracing::warn!(provider = %id, "skipping import entry without command or url");
                report.failed.push(ImportFailure {
                    id,
                    reason: e.to_string(),
                });
                continue;
            }
            if configs.contains_key(&id) && !overwrite {
                report.skipped.push(id);
                continue;
            }

            config.last_updated = Some(now);
            configs.insert(id.clone(), config);
            report.imported.push(id);
        }

        if !report.imported.is_empty() {
            self.persist_configs(&configs);
        }

        tracing::info!(
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            overwrite,
            "imported provider configs"
        );
        report
    }

    // ─── Routes ──────────────────────────────────────────────────────────────

    /// Provider id currently serving `tool`.
    pub fn route(&self, tool: &str) -> Option<String> {
        self.read_routes().get(tool).cloned()
    }

    /// The full route table, sorted by tool name.
    pub fn routes(&self) -> Vec<(String, String)> {
        self.read_routes()
            .iter()
            .map(|(tool, id)| (tool.clone(), id.clone()))
            .collect()
    }

    pub fn route_count(&self) -> usize {
        self.read_routes().len()
    }

    /// Replace every route owned by `id` with one per discovered tool.
    ///
    /// Tools already routed to another provider are taken over (last writer wins).
    /// Does nothing when `id` is no longer configured.
    pub fn publish_routes(&self, id: &str, tools: &[ToolDescriptor]) {
        // Held across the insert so a concurrent delete cannot slip in between.
        let configs = self.read_configs();
        if !configs.contains_key(id) {
            tracing::debug!(provider = %id, "provider removed, not publishing routes");
            return;
        }
        let mut routes = self.write_routes();
        routes.retain(|_, owner| owner != id);

        for tool in tools {
            if let Some(previous) = routes.insert(tool.name.clone(), id.to_string()) {
                tracing::info!(
                    tool = %tool.name,
                    from = %previous,
                    to = %id,
                    "tool route reassigned"
                );
            }
        }
        self.persist_routes(&routes);

        tracing::debug!(provider = %id, tools = tools.len(), "published tool routes");
    }

    /// Point `tool` at `id` and persist. Returns `false` without touching the
    /// table when `id` is not configured.
    pub fn set_route(&self, tool: &str, id: &str) -> bool {
        let configs = self.read_configs();
        if !configs.contains_key(id) {
            tracing::debug!(tool, provider = %id, "provider removed, not recording route");
            return false;
        }
        let mut routes = self.write_routes();
        let changed = routes.get(tool).map(String::as_str) != Some(id);
        if changed {
            routes.insert(tool.to_string(), id.to_string());
        }
        if changed || self.routes_dirty.load(Ordering::Relaxed) {
            self.persist_routes(&routes);
        }
        true
    }

    /// Drop every route naming `id`. Returns how many were removed.
    pub fn remove_routes_for(&self, id: &str) -> usize {
        let mut routes = self.write_routes();
        let before = routes.len();
        routes.retain(|_, owner| owner != id);
        let removed = before - routes.len();
        if removed > 0 {
            self.persist_routes(&routes);
            tracing::debug!(provider = %id, removed, "removed tool routes");
        }
        removed
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    fn persist_configs(&self, configs: &ConfigTable) {
        if let Err(e) = self.config_store.save(configs) {
            tracing::error!(error = %e, "failed to save provider configs");
        }
    }

    fn persist_routes(&self, routes: &RouteTable) {
        match self.route_store.save(routes) {
            Ok(()) => self.routes_dirty.store(false, Ordering::Relaxed),
            Err(e) => {
                self.routes_dirty.store(true, Ordering::Relaxed);
                tracing::error!(error = %e, "failed to save tool routes");
            }
        }
    }

    fn read_configs(&self) -> RwLockReadGuard<'_, ConfigTable> {
        self.configs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_configs(&self) -> RwLockWriteGuard<'_, ConfigTable> {
        self.configs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_routes(&self) -> RwLockReadGuard<'_, RouteTable> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_routes(&self) -> RwLockWriteGuard<'_, RouteTable> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
