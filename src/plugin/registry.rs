//! Plugin discovery, selection and loading.

use super::{Plugin, PluginCategory, PluginDescriptor, Stage};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Factory producing a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// A cached plugin instance, shared behind a lock.
pub type SharedPlugin = Arc<Mutex<Box<dyn Plugin>>>;

/// Resolves a descriptor to a loadable plugin.
///
/// The core never introspects host-language modules; a loader owns that
/// concern. The built-in loader resolves factories registered by the
/// embedding binary; alternative loaders may spawn sidecar programs or
/// open shared libraries.
pub trait PluginLoader: Send + Sync {
    /// Instantiate the plugin described by `descriptor`.
    fn load(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>>;
}

/// Loader backed by factories registered under a module key.
///
/// The module key is the file stem of the descriptor's `Module` path.
/// When the descriptor names a `Class`, the factory registered under
/// that class name is used; otherwise the module must expose exactly
/// one factory (autodiscovery), and zero or several candidates are
/// configuration errors.
#[derive(Default)]
pub struct BuiltinLoader {
    factories: Mutex<HashMap<String, Vec<(String, PluginFactory)>>>,
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `(module, class)`.
    pub fn register(
        &self,
        module: impl Into<String>,
        class: impl Into<String>,
        factory: PluginFactory,
    ) {
        let mut factories = self.factories.lock().unwrap_or_else(|e| e.into_inner());
        factories
            .entry(module.into())
            .or_default()
            .push((class.into(), factory));
    }
}

impl PluginLoader for BuiltinLoader {
    fn load(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>> {
        let module_key = descriptor
            .module
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::config(format!("{}: empty module path", descriptor.name))
            })?;

        let factories = self.factories.lock().unwrap_or_else(|e| e.into_inner());
        let candidates = factories.get(&module_key).ok_or_else(|| {
            Error::config(format!(
                "plugin module not found: {} (plugin {})",
                module_key, descriptor.name
            ))
        })?;

        match &descriptor.class_name {
            Some(class) => candidates
                .iter()
                .find(|(name, _)| name == class)
                .map(|(_, factory)| factory())
                .ok_or_else(|| {
                    Error::config(format!(
                        "plugin class {} not found in module {}",
                        class, module_key
                    ))
                }),
            None => match candidates.len() {
                0 => Err(Error::config(format!(
                    "plugin class not found in module {}",
                    module_key
                ))),
                1 => Ok(candidates[0].1()),
                _ => Err(Error::config(format!(
                    "cannot decide which plugin class to load from {}: {}",
                    module_key,
                    candidates
                        .iter()
                        .map(|(name, _)| name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))),
            },
        }
    }
}

/// Index of known plugins with selection and loading state.
pub struct PluginRegistry {
    plugins: BTreeMap<String, PluginDescriptor>,
    enabled: BTreeSet<String>,
    loader: Arc<dyn PluginLoader>,
    instances: Mutex<HashMap<String, SharedPlugin>>,
}

impl PluginRegistry {
    /// Create an empty registry with the given loader.
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            plugins: BTreeMap::new(),
            enabled: BTreeSet::new(),
            loader,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Walk a plugins folder for `.golismero` descriptors.
    ///
    /// Returns the names of plugins loaded and the paths that failed to
    /// parse. Finding no descriptor at all is a configuration error;
    /// individual parse failures are collected and logged.
    pub fn find_plugins(&mut self, plugins_folder: &Path) -> Result<(Vec<String>, Vec<String>)> {
        if !plugins_folder.is_dir() {
            return Err(Error::config(format!(
                "invalid plugins folder: {}",
                plugins_folder.display()
            )));
        }

        let pattern = plugins_folder.join("**").join("*.golismero");
        let pattern = pattern.to_string_lossy().into_owned();
        let mut success = Vec::new();
        let mut failure = Vec::new();

        let entries = glob::glob(&pattern)
            .map_err(|e| Error::config(format!("bad plugins folder pattern: {e}")))?;
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(%err, "unreadable plugins folder entry");
                    continue;
                }
            };
            match PluginDescriptor::parse(&path, plugins_folder) {
                Ok(descriptor) => {
                    if self.plugins.contains_key(&descriptor.name) {
                        warn!(plugin = descriptor.name, "duplicate plugin name, skipping");
                        failure.push(path.display().to_string());
                        continue;
                    }
                    debug!(plugin = descriptor.name, "found plugin");
                    success.push(descriptor.name.clone());
                    self.enabled.insert(descriptor.name.clone());
                    self.plugins.insert(descriptor.name.clone(), descriptor);
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to parse plugin descriptor");
                    failure.push(path.display().to_string());
                }
            }
        }

        if success.is_empty() && self.plugins.is_empty() {
            return Err(Error::config(format!(
                "no plugins found under {}",
                plugins_folder.display()
            )));
        }
        Ok((success, failure))
    }

    /// Register a descriptor directly. Used by embedding hosts and
    /// tests that do not read descriptors from disk.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<()> {
        if self.plugins.contains_key(&descriptor.name) {
            return Err(Error::config(format!(
                "duplicate plugin name: {}",
                descriptor.name
            )));
        }
        self.enabled.insert(descriptor.name.clone());
        self.plugins.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Compute the plugin set selected by enable and disable lists,
    /// without changing the registry. The special name `"all"` toggles
    /// every plugin; other names must exist.
    pub fn selection(&self, enabled: &[String], disabled: &[String]) -> Result<BTreeSet<String>> {
        for name in enabled.iter().chain(disabled) {
            if name != "all" && !self.plugins.contains_key(name) {
                return Err(Error::config(format!("unknown plugin name: {name}")));
            }
        }

        let mut selection: BTreeSet<String> = if enabled.iter().any(|n| n == "all") {
            self.plugins.keys().cloned().collect()
        } else {
            enabled.iter().cloned().collect()
        };
        if disabled.iter().any(|n| n == "all") {
            selection.clear();
        } else {
            for name in disabled {
                selection.remove(name);
            }
        }
        Ok(selection)
    }

    /// Apply enable and disable lists to the registry's own enabled
    /// set.
    pub fn apply_enable_lists(&mut self, enabled: &[String], disabled: &[String]) -> Result<()> {
        self.enabled = self.selection(enabled, disabled)?;
        Ok(())
    }

    /// Whether a plugin is currently enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }

    /// Number of known plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are known.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Enabled plugins of a category, in name order.
    pub fn plugins(&self, category: PluginCategory) -> Vec<&PluginDescriptor> {
        self.enabled
            .iter()
            .filter_map(|name| self.plugins.get(name))
            .filter(|d| d.category == category)
            .collect()
    }

    /// Look up a plugin by its exact name.
    pub fn get_plugin_by_name(&self, name: &str) -> Result<&PluginDescriptor> {
        self.plugins
            .get(name)
            .ok_or_else(|| Error::config(format!("plugin not found: {name}")))
    }

    /// Plugins whose name starts with or contains the given pattern.
    pub fn search_plugins_by_name(&self, pattern: &str) -> Vec<&PluginDescriptor> {
        let mut matches: Vec<&PluginDescriptor> = self
            .plugins
            .values()
            .filter(|d| d.name.starts_with(pattern))
            .collect();
        if matches.is_empty() {
            matches = self
                .plugins
                .values()
                .filter(|d| d.name.contains(pattern))
                .collect();
        }
        matches
    }

    /// Earliest stage among enabled testing plugins.
    pub fn min_stage(&self) -> Stage {
        self.plugins(PluginCategory::Testing)
            .iter()
            .map(|d| d.stage)
            .min()
            .unwrap_or_else(Stage::first)
    }

    /// Latest stage among enabled testing plugins.
    pub fn max_stage(&self) -> Stage {
        self.plugins(PluginCategory::Testing)
            .iter()
            .map(|d| d.stage)
            .max()
            .unwrap_or_else(Stage::last)
    }

    /// Validate dependencies of the enabled testing plugins and return
    /// them in execution order (stage, then declared dependencies).
    ///
    /// Unknown dependencies, dependencies on later stages, and cycles
    /// are configuration errors.
    pub fn calculate_dependencies(&self) -> Result<Vec<String>> {
        let enabled = self.enabled.clone();
        self.calculate_dependencies_among(&enabled)
    }

    /// Like [`calculate_dependencies`](Self::calculate_dependencies),
    /// restricted to the given plugin set. Used by audits, which each
    /// carry their own selection.
    pub fn calculate_dependencies_among(&self, names: &BTreeSet<String>) -> Result<Vec<String>> {
        let testing: BTreeMap<&str, &PluginDescriptor> = names
            .iter()
            .filter_map(|name| self.plugins.get(name))
            .filter(|d| d.category == PluginCategory::Testing)
            .map(|d| (d.name.as_str(), d))
            .collect();

        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        for (&name, descriptor) in &testing {
            indegree.entry(name).or_insert(0);
            for dep in &descriptor.dependencies {
                let dep_descriptor = testing.get(dep.as_str()).ok_or_else(|| {
                    Error::config(format!(
                        "plugin {} depends on unknown or disabled plugin {}",
                        name, dep
                    ))
                })?;
                if dep_descriptor.stage > descriptor.stage {
                    return Err(Error::config(format!(
                        "plugin {} (stage {}) depends on {} at a later stage ({})",
                        name, descriptor.stage, dep, dep_descriptor.stage
                    )));
                }
                dependents.entry(dep.as_str()).or_default().push(name);
                *indegree.entry(name).or_insert(0) += 1;
            }
        }

        // Kahn's algorithm; ready plugins ordered by (stage, name).
        let mut ready: VecDeque<&str> = {
            let mut ready: Vec<&str> = indegree
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(&name, _)| name)
                .collect();
            ready.sort_by_key(|name| (testing[name].stage, *name));
            ready.into()
        };

        let mut order = Vec::with_capacity(testing.len());
        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
                let degree = indegree.get_mut(dependent).ok_or_else(|| {
                    Error::Internal(format!("dependency graph missing node {dependent}"))
                })?;
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if order.len() != testing.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(&n, _)| n)
                .collect();
            return Err(Error::config(format!(
                "cyclic plugin dependencies involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Load a plugin instance, caching it per process.
    pub fn load(&self, name: &str) -> Result<SharedPlugin> {
        {
            let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(instance) = instances.get(name) {
                return Ok(Arc::clone(instance));
            }
        }
        let descriptor = self.get_plugin_by_name(name)?;
        let instance: SharedPlugin = Arc::new(Mutex::new(self.loader.load(descriptor)?));
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(
            instances.entry(name.to_string()).or_insert(instance),
        ))
    }

    /// Drop all cached instances.
    pub fn clear_instances(&self) {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{descriptor, StubPlugin};
    use super::*;
    use pretty_assertions::assert_eq;

    fn loader_with(modules: &[(&str, &str)]) -> Arc<BuiltinLoader> {
        let loader = Arc::new(BuiltinLoader::new());
        for (module, class) in modules {
            loader.register(
                *module,
                *class,
                Arc::new(|| {
                    Box::new(StubPlugin {
                        accepted: None,
                        produce: Box::new(|_| Ok(Vec::new())),
                    }) as Box<dyn Plugin>
                }),
            );
        }
        loader
    }

    fn registry_with(names: &[(&str, Stage)]) -> PluginRegistry {
        let loader = loader_with(
            &names
                .iter()
                .map(|(name, _)| (name.rsplit('/').next().unwrap(), "Stub"))
                .collect::<Vec<_>>(),
        );
        let mut registry = PluginRegistry::new(loader);
        for (name, stage) in names {
            registry.register(descriptor(name, *stage)).unwrap();
        }
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry_with(&[("testing/recon/spider", Stage::Recon)]);
        let descriptor = registry.get_plugin_by_name("testing/recon/spider").unwrap();
        assert_eq!(descriptor.stage, Stage::Recon);
        assert!(registry.get_plugin_by_name("testing/recon/ghost").is_err());
    }

    #[test]
    fn test_enable_lists_with_all_wildcard() {
        let mut registry = registry_with(&[
            ("testing/recon/spider", Stage::Recon),
            ("testing/scan/probe", Stage::Scan),
        ]);

        registry
            .apply_enable_lists(
                &["all".to_string()],
                &["testing/scan/probe".to_string()],
            )
            .unwrap();
        assert!(registry.is_enabled("testing/recon/spider"));
        assert!(!registry.is_enabled("testing/scan/probe"));

        registry
            .apply_enable_lists(&["all".to_string()], &["all".to_string()])
            .unwrap();
        assert!(registry.plugins(PluginCategory::Testing).is_empty());
    }

    #[test]
    fn test_unknown_plugin_in_lists_is_error() {
        let mut registry = registry_with(&[("testing/recon/spider", Stage::Recon)]);
        let err = registry
            .apply_enable_lists(&["testing/recon/nope".to_string()], &[])
            .unwrap_err();
        assert!(err.to_string().contains("unknown plugin name"));
    }

    #[test]
    fn test_search_by_prefix_then_substring() {
        let registry = registry_with(&[
            ("testing/recon/spider", Stage::Recon),
            ("testing/recon/dns", Stage::Recon),
            ("report/spider_report", Stage::Recon),
        ]);

        let by_prefix = registry.search_plugins_by_name("testing/recon");
        assert_eq!(by_prefix.len(), 2);

        let by_substring = registry.search_plugins_by_name("spider");
        assert_eq!(by_substring.len(), 2);
    }

    #[test]
    fn test_stage_bounds() {
        let registry = registry_with(&[
            ("testing/recon/spider", Stage::Recon),
            ("testing/attack/inject", Stage::Attack),
        ]);
        assert_eq!(registry.min_stage(), Stage::Recon);
        assert_eq!(registry.max_stage(), Stage::Attack);
    }

    #[test]
    fn test_dependency_order() {
        let mut registry = registry_with(&[
            ("testing/recon/spider", Stage::Recon),
            ("testing/recon/dns", Stage::Recon),
        ]);
        let mut probe = descriptor("testing/scan/probe", Stage::Scan);
        probe.dependencies = vec!["testing/recon/spider".to_string()];
        registry.register(probe).unwrap();

        let order = registry.calculate_dependencies().unwrap();
        let spider = order.iter().position(|n| n == "testing/recon/spider").unwrap();
        let probe = order.iter().position(|n| n == "testing/scan/probe").unwrap();
        assert!(spider < probe);
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_dependency_cycle_is_error() {
        let mut registry = PluginRegistry::new(loader_with(&[("a", "A"), ("b", "B")]));
        let mut a = descriptor("testing/recon/a", Stage::Recon);
        a.dependencies = vec!["testing/recon/b".to_string()];
        let mut b = descriptor("testing/recon/b", Stage::Recon);
        b.dependencies = vec!["testing/recon/a".to_string()];
        registry.register(a).unwrap();
        registry.register(b).unwrap();

        let err = registry.calculate_dependencies().unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_dependency_on_later_stage_is_error() {
        let mut registry = registry_with(&[("testing/attack/inject", Stage::Attack)]);
        let mut early = descriptor("testing/recon/early", Stage::Recon);
        early.dependencies = vec!["testing/attack/inject".to_string()];
        registry.register(early).unwrap();

        let err = registry.calculate_dependencies().unwrap_err();
        assert!(err.to_string().contains("later stage"));
    }

    #[test]
    fn test_instance_cache_returns_same_instance() {
        let registry = registry_with(&[("testing/recon/spider", Stage::Recon)]);
        let first = registry.load("testing/recon/spider").unwrap();
        let second = registry.load("testing/recon/spider").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.clear_instances();
        let third = registry.load("testing/recon/spider").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_builtin_loader_autodiscovery_ambiguity() {
        let loader = BuiltinLoader::new();
        let factory: PluginFactory = Arc::new(|| {
            Box::new(StubPlugin {
                accepted: None,
                produce: Box::new(|_| Ok(Vec::new())),
            }) as Box<dyn Plugin>
        });
        loader.register("spider", "SpiderA", Arc::clone(&factory));
        loader.register("spider", "SpiderB", factory);

        let descriptor = descriptor("testing/recon/spider", Stage::Recon);
        let err = match loader.load(&descriptor) {
            Err(e) => e,
            Ok(_) => panic!("expected load to fail"),
        };
        assert!(err.to_string().contains("cannot decide"));
    }

    #[test]
    fn test_find_plugins_walks_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("testing/recon/spider.golismero");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "[Core]\nName = Spider\nModule = spider\n").unwrap();
        let bad = dir.path().join("testing/recon/broken.golismero");
        std::fs::write(&bad, "Name = no section\n").unwrap();

        let mut registry = PluginRegistry::new(loader_with(&[("spider", "Spider")]));
        let (success, failure) = registry.find_plugins(dir.path()).unwrap();
        assert_eq!(success, vec!["testing/recon/spider".to_string()]);
        assert_eq!(failure.len(), 1);
    }
}
