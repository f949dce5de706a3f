//! Plugin discovery, routing and lifecycle.
//!
//! The routing tables live in a [`Registry`] value. Readers clone the current
//! `Arc<Registry>` and work from that snapshot; writers clone the registry, edit the
//! copy and swap it in under the mutex, so no lock is held while a plugin call runs.

use crate::manifest::{discover_plugins, validate_plugin_name, FunctionDefinition, Manifest, ManifestError};
use crate::plugin::{
    lock, Arguments, CallOptions, FailureKind, NoopObserver, Plugin, PluginObserver, PluginOptions,
    PluginResponse, PluginState,
};
use crate::protocol::EXECUTE_TIMEOUT;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("plugins directory does not exist: {}", .0.display())]
    DirectoryNotFound(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub plugin: PluginOptions,
    /// Time MCP-enabled plugins get after initialize to publish their functions.
    pub mcp_grace: Duration,
    pub call_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            plugin: PluginOptions::default(),
            mcp_grace: Duration::from_secs(5),
            call_timeout: EXECUTE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub description: String,
    pub state: PluginState,
    pub persistent: bool,
    pub passthrough: bool,
    pub function_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPlugin {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub loaded: usize,
    pub failed: usize,
    pub functions: usize,
}

#[derive(Clone, Default)]
struct Registry {
    plugins: BTreeMap<String, Arc<Plugin>>,
    /// function name -> owning plugin
    functions: BTreeMap<String, String>,
    /// lowercased tag -> (function, declaring plugin)
    tags: BTreeMap<String, BTreeSet<(String, String)>>,
    failed: Vec<FailedPlugin>,
}

impl Registry {
    fn add_routes(&mut self, plugin: &Plugin) {
        let manifest = plugin.manifest();
        for function in &manifest.functions {
            if let Some(previous) = self
                .functions
                .insert(function.name.clone(), manifest.name.clone())
                .filter(|previous| *previous != manifest.name)
            {
                warn!(
                    function = %function.name,
                    previous = %previous,
                    plugin = %manifest.name,
                    "function name collision, last registration wins"
                );
            }
            for tag in function.tags.iter().chain(&manifest.tags) {
                self.tags
                    .entry(tag.to_lowercase())
                    .or_default()
                    .insert((function.name.clone(), manifest.name.clone()));
            }
        }
    }

    /// Drop the routes and tags `plugin_name` declared. A function it had taken over
    /// in a name collision falls back to another plugin that declares it.
    fn remove_routes(&mut self, plugin_name: &str) {
        let owned: Vec<String> = self
            .functions
            .iter()
            .filter(|(_, owner)| owner.as_str() == plugin_name)
            .map(|(function, _)| function.clone())
            .collect();
        for function in owned {
            self.functions.remove(&function);
            let fallback = self
                .plugins
                .iter()
                .filter(|(name, _)| name.as_str() != plugin_name)
                .find(|(_, plugin)| plugin.function(&function).is_some())
                .map(|(name, _)| name.clone());
            if let Some(fallback) = fallback {
                debug!(%function, plugin = %fallback, "function route restored");
                self.functions.insert(function, fallback);
            }
        }
        for entries in self.tags.values_mut() {
            entries.retain(|(_, declared_by)| declared_by != plugin_name);
        }
        self.tags.retain(|_, entries| !entries.is_empty());
    }

    fn tagged(&self, tag: &str) -> BTreeSet<String> {
        self.tags
            .get(&tag.to_lowercase())
            .map(|entries| entries.iter().map(|(function, _)| function.clone()).collect())
            .unwrap_or_default()
    }

    fn owner(&self, function: &str) -> Option<&Arc<Plugin>> {
        self.functions
            .get(function)
            .and_then(|plugin| self.plugins.get(plugin))
    }
}

/// Owns every loaded plugin and routes calls to them by function name.
pub struct PluginManager {
    plugins_dir: PathBuf,
    options: ManagerOptions,
    observer: Arc<dyn PluginObserver>,
    registry: Mutex<Arc<Registry>>,
}

impl PluginManager {
    pub fn new(plugins_dir: impl Into<PathBuf>, options: ManagerOptions) -> Self {
        Self::with_observer(plugins_dir, options, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        plugins_dir: impl Into<PathBuf>,
        options: ManagerOptions,
        observer: Arc<dyn PluginObserver>,
    ) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            options,
            observer,
            registry: Mutex::new(Arc::new(Registry::default())),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    fn snapshot(&self) -> Arc<Registry> {
        lock(&self.registry).clone()
    }

    /// Scan the plugins directory, register every valid plugin and start the
    /// persistent ones. A bad manifest is recorded as failed and skipped.
    pub fn load(&self) -> Result<LoadSummary, ManagerError> {
        if !self.plugins_dir.is_dir() {
            return Err(ManagerError::DirectoryNotFound(self.plugins_dir.clone()));
        }

        let names = discover_plugins(&self.plugins_dir);
        info!(dir = %self.plugins_dir.display(), count = names.len(), "discovered plugins");

        let mut registry = Registry::default();
        for name in names {
            match self.load_plugin(&name) {
                Ok(plugin) => {
                    info!(
                        plugin = %name,
                        functions = plugin.manifest().functions.len(),
                        "loaded plugin"
                    );
                    registry.add_routes(&plugin);
                    registry.plugins.insert(name, plugin);
                }
                Err(err) => {
                    warn!(plugin = %name, error = %err, "failed to load plugin");
                    registry.failed.push(FailedPlugin {
                        name,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let summary = LoadSummary {
            loaded: registry.plugins.len(),
            failed: registry.failed.len(),
            functions: registry.functions.len(),
        };
        *lock(&self.registry) = Arc::new(registry);

        self.start_persistent_plugins();
        info!(
            loaded = summary.loaded,
            failed = summary.failed,
            functions = summary.functions,
            "plugin manager ready"
        );
        Ok(summary)
    }

    /// Shut everything down and scan again.
    pub fn reload(&self) -> Result<LoadSummary, ManagerError> {
        info!("reloading plugins");
        self.shutdown();
        self.load()
    }

    fn load_plugin(&self, name: &str) -> Result<Arc<Plugin>, ManifestError> {
        if !validate_plugin_name(name) {
            return Err(ManifestError::InvalidPluginName(name.to_string()));
        }
        let manifest = Manifest::load(&self.plugins_dir.join(name))?;
        Ok(Arc::new(Plugin::new(
            manifest,
            self.options.plugin.clone(),
            Arc::clone(&self.observer),
        )))
    }

    fn start_persistent_plugins(&self) {
        let registry = self.snapshot();
        let mut mcp = Vec::new();
        for (name, plugin) in registry.plugins.iter().filter(|(_, p)| p.manifest().persistent) {
            info!(plugin = %name, "starting persistent plugin");
            let response = plugin.initialize();
            if !response.success {
                warn!(plugin = %name, reason = %response.message, "persistent plugin failed to start");
                continue;
            }
            if plugin.manifest().mcp.enabled {
                mcp.push(name.clone());
            }
        }

        if mcp.is_empty() {
            return;
        }
        info!(plugins = ?mcp, grace_ms = self.options.mcp_grace.as_millis() as u64, "waiting for MCP function discovery");
        thread::sleep(self.options.mcp_grace);
        for name in &mcp {
            if let Err(err) = self.refresh_mcp_manifest(name) {
                warn!(plugin = %name, error = %err, "could not refresh MCP manifest");
            }
        }
    }

    /// Re-read one plugin's manifest from disk. When its function definitions differ
    /// from the registered ones, that plugin's routes and tags are replaced in a single
    /// swap. Returns whether anything changed.
    pub fn refresh_mcp_manifest(&self, plugin_name: &str) -> Result<bool, ManifestError> {
        let Some(plugin) = self.plugin(plugin_name) else {
            return Ok(false);
        };
        let current = plugin.manifest();
        let fresh = Manifest::load(&current.directory)?;
        if fresh.functions == current.functions {
            debug!(plugin = %plugin_name, functions = fresh.functions.len(), "MCP manifest unchanged");
            return Ok(false);
        }

        let (before, after) = (current.functions.len(), fresh.functions.len());
        let mut guard = lock(&self.registry);
        let mut next = Registry::clone(&guard);
        next.remove_routes(plugin_name);
        plugin.replace_manifest(fresh);
        next.add_routes(&plugin);
        *guard = Arc::new(next);
        drop(guard);

        info!(plugin = %plugin_name, before, after, "MCP plugin functions refreshed");
        Ok(true)
    }

    /// Refresh every MCP-enabled plugin; returns each one's function count afterwards.
    pub fn refresh_mcp_plugins(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for name in self.mcp_plugins() {
            if let Err(err) = self.refresh_mcp_manifest(&name) {
                warn!(plugin = %name, error = %err, "could not refresh MCP manifest");
            }
            if let Some(plugin) = self.plugin(&name) {
                counts.insert(name, plugin.manifest().functions.len());
            }
        }
        counts
    }

    pub fn mcp_plugins(&self) -> Vec<String> {
        self.snapshot()
            .plugins
            .iter()
            .filter(|(_, plugin)| plugin.manifest().mcp.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.snapshot().plugins.get(name).cloned()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.snapshot().plugins.keys().cloned().collect()
    }

    pub fn plugin_summaries(&self) -> Vec<PluginSummary> {
        self.snapshot()
            .plugins
            .values()
            .map(|plugin| {
                let manifest = plugin.manifest();
                PluginSummary {
                    name: manifest.name.clone(),
                    description: manifest.description.clone(),
                    state: plugin.state(),
                    persistent: manifest.persistent,
                    passthrough: manifest.passthrough,
                    function_count: manifest.functions.len(),
                }
            })
            .collect()
    }

    pub fn failed_plugins(&self) -> Vec<FailedPlugin> {
        self.snapshot().failed.clone()
    }

    pub fn plugin_exists(&self, name: &str) -> bool {
        self.snapshot().plugins.contains_key(name)
    }

    pub fn function_exists(&self, function: &str) -> bool {
        self.snapshot().functions.contains_key(function)
    }

    pub fn plugin_for_function(&self, function: &str) -> Option<String> {
        self.snapshot().functions.get(function).cloned()
    }

    pub fn is_passthrough(&self, plugin_name: &str) -> bool {
        self.plugin(plugin_name)
            .is_some_and(|plugin| plugin.manifest().passthrough)
    }

    /// Tool schemas for one plugin, or for every plugin when `plugin_name` is `None`.
    pub fn function_definitions(&self, plugin_name: Option<&str>) -> Vec<Value> {
        self.snapshot()
            .plugins
            .iter()
            .filter(|(name, _)| plugin_name.map_or(true, |wanted| wanted == name.as_str()))
            .flat_map(|(_, plugin)| plugin.manifest().tool_schemas())
            .collect()
    }

    pub fn function_definition(&self, function: &str) -> Option<FunctionDefinition> {
        self.snapshot()
            .owner(function)
            .and_then(|plugin| plugin.function(function))
    }

    pub fn all_functions(&self) -> Vec<String> {
        self.snapshot().functions.keys().cloned().collect()
    }

    pub fn functions_by_tag(&self, tag: &str) -> Vec<String> {
        self.snapshot().tagged(tag).into_iter().collect()
    }

    /// Functions carrying every one of `tags`, compared case-insensitively.
    pub fn functions_by_tags(&self, tags: &[&str]) -> Vec<String> {
        let Some((first, rest)) = tags.split_first() else {
            return self.all_functions();
        };
        let registry = self.snapshot();
        rest.iter()
            .fold(registry.tagged(first), |acc, tag| {
                acc.intersection(&registry.tagged(tag)).cloned().collect()
            })
            .into_iter()
            .collect()
    }

    /// Every function as an OpenAI-style tool entry, labelled with its plugin.
    pub fn tool_catalog(&self) -> Vec<Value> {
        let registry = self.snapshot();
        let mut tools = Vec::new();
        for (name, plugin) in &registry.plugins {
            for function in &plugin.manifest().functions {
                let schema = function.to_schema();
                tools.push(json!({
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "description": format!("[Plugin: {name}] {}", function.description),
                        "parameters": schema["parameters"],
                    }
                }));
            }
        }
        tools
    }

    /// Route a call by function name. Unknown functions and missing required
    /// parameters fail here without touching any process.
    pub fn execute(&self, function: &str, arguments: Arguments, options: &CallOptions) -> PluginResponse {
        let Some(plugin) = self.snapshot().owner(function).cloned() else {
            return PluginResponse::failure(
                FailureKind::UnknownFunction,
                format!("Unknown function: {function}"),
            );
        };

        if let Some(missing) = plugin.function(function).and_then(|definition| {
            definition
                .required_parameters()
                .find(|param| !arguments.contains_key(&param.name))
                .map(|param| param.name.clone())
        }) {
            return PluginResponse::failure(
                FailureKind::MissingParameter,
                format!("Missing required parameter: {missing}"),
            );
        }

        info!(plugin = %plugin.name(), function, "executing function");
        plugin.execute(function, arguments, options)
    }

    /// Call a function on a named plugin without routing or argument checks.
    pub fn execute_direct(
        &self,
        plugin_name: &str,
        function: &str,
        arguments: Arguments,
        options: &CallOptions,
    ) -> PluginResponse {
        let Some(plugin) = self.plugin(plugin_name) else {
            return plugin_not_found(plugin_name);
        };
        info!(plugin = %plugin_name, function, "executing function directly");
        plugin.execute(function, arguments, options)
    }

    pub fn start_plugin(&self, plugin_name: &str) -> bool {
        match self.plugin(plugin_name) {
            Some(plugin) => plugin.initialize().success,
            None => {
                warn!(plugin = %plugin_name, "cannot start unknown plugin");
                false
            }
        }
    }

    pub fn stop_plugin(&self, plugin_name: &str) -> bool {
        match self.plugin(plugin_name) {
            Some(plugin) => plugin.shutdown().response.success,
            None => {
                warn!(plugin = %plugin_name, "cannot stop unknown plugin");
                false
            }
        }
    }

    pub fn awaiting_input_plugin(&self) -> Option<Arc<Plugin>> {
        self.snapshot()
            .plugins
            .values()
            .find(|plugin| plugin.is_awaiting_input())
            .cloned()
    }

    pub fn send_input(&self, plugin_name: &str, content: &str) -> PluginResponse {
        match self.plugin(plugin_name) {
            Some(plugin) => plugin.send_input(content, self.options.call_timeout),
            None => plugin_not_found(plugin_name),
        }
    }

    /// Shut down every running plugin and clear the registry.
    pub fn shutdown(&self) {
        let registry = std::mem::take(&mut *lock(&self.registry));
        for (name, plugin) in &registry.plugins {
            if plugin.is_running() {
                info!(plugin = %name, "stopping plugin");
                let outcome = plugin.shutdown();
                if outcome.forced_kill {
                    warn!(plugin = %name, "plugin had to be killed");
                }
            }
        }
    }
}

fn plugin_not_found(name: &str) -> PluginResponse {
    PluginResponse::failure(FailureKind::UnknownPlugin, format!("Plugin not found: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_plugin(root: &Path, name: &str, manifest: Value) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();
    }

    fn manifest(functions: Value) -> Value {
        json!({
            "manifestVersion": 1,
            "protocol_version": "2.0",
            "executable": "missing-binary",
            "persistent": false,
            "functions": functions,
        })
    }

    fn function(name: &str, tags: &[&str]) -> Value {
        json!({
            "name": name,
            "description": format!("{name} function"),
            "tags": tags,
            "parameters": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        })
    }

    fn loaded(root: &TempDir) -> PluginManager {
        let manager = PluginManager::new(root.path(), ManagerOptions::default());
        manager.load().expect("plugins dir exists");
        manager
    }

    #[test]
    fn missing_directory_is_an_error() {
        let manager = PluginManager::new("/nonexistent/plugins", ManagerOptions::default());
        assert!(matches!(manager.load(), Err(ManagerError::DirectoryNotFound(_))));
    }

    #[test]
    fn bad_manifest_does_not_block_the_scan() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "good", manifest(json!([function("hello", &[])])));
        let mut broken = manifest(json!([function("oops", &[])]));
        broken["protocol_version"] = json!("1.0");
        write_plugin(root.path(), "broken", broken);

        let manager = loaded(&root);
        assert_eq!(manager.plugin_names(), vec!["good".to_string()]);
        let failed = manager.failed_plugins();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "broken");
        assert!(failed[0].reason.contains("protocol_version"));
        assert!(!manager.function_exists("oops"));
    }

    #[test]
    fn last_registration_wins_on_collision() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "alpha", manifest(json!([function("shared", &[])])));
        write_plugin(root.path(), "beta", manifest(json!([function("shared", &[])])));

        let manager = loaded(&root);
        assert_eq!(manager.plugin_for_function("shared").as_deref(), Some("beta"));
    }

    #[test]
    fn tags_merge_function_and_manifest_levels() {
        let root = TempDir::new().unwrap();
        let mut raw = manifest(json!([function("play", &["Music"]), function("stop", &[])]));
        raw["tags"] = json!(["media"]);
        write_plugin(root.path(), "player", raw);

        let manager = loaded(&root);
        assert_eq!(manager.functions_by_tag("MEDIA"), vec!["play", "stop"]);
        assert_eq!(manager.functions_by_tags(&["music", "Media"]), vec!["play"]);
        assert!(manager.functions_by_tags(&["music", "unknown"]).is_empty());
        assert_eq!(manager.functions_by_tags(&[]).len(), 2);
    }

    #[test]
    fn unknown_function_fails_without_starting_anything() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "alpha", manifest(json!([function("hello", &[])])));
        let manager = loaded(&root);

        let response = manager.execute("nope", Arguments::new(), &CallOptions::default());
        assert!(!response.success);
        assert_eq!(response.failure, Some(FailureKind::UnknownFunction));
        assert_eq!(response.message, "Unknown function: nope");
        assert_eq!(manager.plugin("alpha").unwrap().state(), PluginState::Stopped);
    }

    #[test]
    fn missing_required_parameter_is_rejected_before_spawn() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "alpha", manifest(json!([function("hello", &[])])));
        let manager = loaded(&root);

        let response = manager.execute("hello", Arguments::new(), &CallOptions::default());
        assert_eq!(response.failure, Some(FailureKind::MissingParameter));
        assert!(response.message.contains("text"));
        assert_eq!(manager.plugin("alpha").unwrap().state(), PluginState::Stopped);

        let direct = manager.execute_direct("ghost", "hello", Arguments::new(), &CallOptions::default());
        assert_eq!(direct.failure, Some(FailureKind::UnknownPlugin));
    }

    #[test]
    fn tool_catalog_labels_plugin() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "alpha", manifest(json!([function("hello", &[])])));
        let manager = loaded(&root);

        let catalog = manager.tool_catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0]["type"], "function");
        assert_eq!(catalog[0]["function"]["name"], "hello");
        assert_eq!(catalog[0]["function"]["description"], "[Plugin: alpha] hello function");
        assert_eq!(catalog[0]["function"]["parameters"]["required"], json!(["text"]));

        let summaries = manager.plugin_summaries();
        assert_eq!(summaries[0].function_count, 1);
        assert_eq!(summaries[0].state, PluginState::Stopped);
    }

    #[test]
    fn mcp_refresh_swaps_only_that_plugins_routes() {
        let root = TempDir::new().unwrap();
        let mut raw = manifest(json!([function("mcp_old", &["remote"])]));
        raw["mcp"] = json!({"enabled": true});
        write_plugin(root.path(), "bridge", raw.clone());
        write_plugin(root.path(), "local", manifest(json!([function("hello", &["remote"])])));
        let manager = loaded(&root);
        assert_eq!(manager.mcp_plugins(), vec!["bridge".to_string()]);

        assert!(!manager.refresh_mcp_manifest("bridge").unwrap());

        // Same function count, different definition.
        raw["functions"] = json!([function("mcp_new", &["remote"])]);
        write_plugin(root.path(), "bridge", raw);
        let counts = manager.refresh_mcp_plugins();
        assert_eq!(counts.get("bridge"), Some(&1));

        assert!(!manager.function_exists("mcp_old"));
        assert_eq!(manager.plugin_for_function("mcp_new").as_deref(), Some("bridge"));
        assert_eq!(manager.plugin_for_function("hello").as_deref(), Some("local"));
        assert_eq!(manager.functions_by_tag("remote"), vec!["hello", "mcp_new"]);
        assert!(manager.plugin("bridge").unwrap().function("mcp_new").is_some());
    }

    #[test]
    fn mcp_refresh_keeps_tags_of_same_named_functions_elsewhere() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "alpha", manifest(json!([function("status", &["core"])])));
        let mut raw = manifest(json!([function("status", &["remote"])]));
        raw["mcp"] = json!({"enabled": true});
        write_plugin(root.path(), "bridge", raw.clone());
        let manager = loaded(&root);
        assert_eq!(manager.plugin_for_function("status").as_deref(), Some("bridge"));

        raw["functions"] = json!([function("sync", &["remote"])]);
        write_plugin(root.path(), "bridge", raw);
        assert!(manager.refresh_mcp_manifest("bridge").unwrap());

        assert_eq!(manager.functions_by_tag("core"), vec!["status"]);
        assert_eq!(manager.functions_by_tag("remote"), vec!["sync"]);
        assert_eq!(manager.plugin_for_function("status").as_deref(), Some("alpha"));
        assert_eq!(manager.functions_by_tags(&["core", "remote"]), Vec::<String>::new());
    }

    #[test]
    fn shutdown_clears_registry() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "alpha", manifest(json!([function("hello", &[])])));
        let manager = loaded(&root);
        manager.shutdown();
        assert!(manager.plugin_names().is_empty());
        assert!(!manager.function_exists("hello"));
    }
}
