//! Per-audit lifecycle coordination.
//!
//! An [`Audit`] owns one run: it computes the scope, opens the store,
//! selects and indexes plugins, seeds the targets, then advances
//! through the stage pipeline with barrier semantics: every dispatched
//! plugin call must be acknowledged before the stage can move on. The
//! [`AuditManager`] keeps the running audits by name.

use crate::config::{expand_path, AuditConfig};
use crate::data::{Data, Identity, Subtype};
use crate::database::AuditStore;
use crate::error::{Error, Result};
use crate::messaging::{AuditNotifier, Message, Payload, Priority, WarningRecord};
use crate::orchestrator::CoreHandles;
use crate::plugin::{PluginCategory, PluginDescriptor, Stage};
use crate::scope::{AuditScope, DnsResolver};
use crate::worker::{PluginCall, PluginContext};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One running audit.
pub struct Audit {
    name: String,
    config: AuditConfig,
    scope: AuditScope,
    store: Arc<AuditStore>,
    notifier: AuditNotifier,
    report_plugins: Vec<String>,
    handles: CoreHandles,
    current_stage: Stage,
    expecting_ack: u64,
    followed_links: u64,
    warned_max_links: bool,
    is_report_started: bool,
}

impl Audit {
    /// Generate a default name for a new audit.
    pub fn generate_audit_name() -> String {
        format!(
            "argus-{}",
            chrono::Local::now().format("%Y-%m-%d-%H_%M_%S")
        )
    }

    /// Bootstrap an audit: scope (may resolve DNS), store, plugin
    /// selection and dependency validation, notifier registration and
    /// target seeding. The audit is not scheduled until
    /// [`start`](Self::start).
    pub(crate) fn new(
        mut config: AuditConfig,
        handles: CoreHandles,
        resolver: &dyn DnsResolver,
    ) -> Result<Self> {
        let name = match config.audit_name.take() {
            Some(name) if !name.is_empty() => name,
            _ => Self::generate_audit_name(),
        };
        config.audit_name = Some(name.clone());

        let scope = AuditScope::new(&config, resolver)?;
        debug!(audit = name, "scope computed");

        let selection = handles
            .registry
            .selection(&config.enabled_plugins, &config.disabled_plugins)?;
        let order = handles.registry.calculate_dependencies_among(&selection)?;
        debug!(audit = name, plugins = order.len(), "testing plugins selected");

        let store = Arc::new(match &config.audit_db {
            Some(path) => AuditStore::open(expand_path(path))?,
            None => AuditStore::in_memory()?,
        });

        // Index the testing plugins by the tags their instances accept.
        let mut notifier = AuditNotifier::new();
        for plugin_name in &order {
            let descriptor = handles.registry.get_plugin_by_name(plugin_name)?.clone();
            let instance = handles.registry.load(plugin_name)?;
            let accepted = instance
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .accepted_info();
            notifier.add_plugin(descriptor, accepted);
        }

        let report_plugins: Vec<String> = selection
            .iter()
            .filter(|name| {
                handles
                    .registry
                    .get_plugin_by_name(name)
                    .map(|d| d.category == PluginCategory::Report)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let current_stage = order
            .iter()
            .filter_map(|name| notifier.plugin(name))
            .map(|d| d.stage)
            .min()
            .unwrap_or_else(Stage::first);

        let audit = Self {
            name,
            config,
            scope,
            store,
            notifier,
            report_plugins,
            handles,
            current_stage,
            expecting_ack: 0,
            followed_links: 0,
            warned_max_links: false,
            is_report_started: false,
        };

        // Seed the targets; re-seeding a resumed audit merges.
        for target in audit.scope.targets() {
            audit.store.add(&target)?;
        }
        Ok(audit)
    }

    /// Name of the audit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The audit configuration. Immutable after construction.
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// The audit scope.
    pub fn scope(&self) -> &AuditScope {
        &self.scope
    }

    /// Number of plugin calls whose acknowledgement is outstanding.
    pub fn expecting_ack(&self) -> u64 {
        self.expecting_ack
    }

    /// The stage the audit is currently processing.
    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    /// Whether report generation has begun.
    pub fn is_report_started(&self) -> bool {
        self.is_report_started
    }

    pub(crate) fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }

    /// Schedule the first batch. The seeded targets flow through the
    /// regular stage scheduler.
    pub(crate) fn start(&mut self) -> Result<()> {
        self.update_stage()
    }

    /// Process an ACK for one dispatched plugin call. When the last
    /// outstanding ACK drains, the stage advances.
    pub(crate) fn acknowledge(&mut self, _message: &Message) -> Result<()> {
        if self.expecting_ack == 0 {
            warn!(audit = self.name, "unexpected ACK");
            return Ok(());
        }
        self.expecting_ack -= 1;
        if self.expecting_ack == 0 {
            self.update_stage()?;
        }
        Ok(())
    }

    /// Route incoming data: intern new items, enforce the link budget,
    /// recurse through discovery trees, and notify the current stage's
    /// plugins. Returns whether anything was dispatched.
    pub(crate) fn dispatch_data(&mut self, message: &Message) -> Result<bool> {
        let Payload::Data { items } = message.payload() else {
            warn!(
                audit = self.name,
                code = ?message.code(),
                "expected a data payload, dropping message"
            );
            return Ok(false);
        };

        let producer: Option<PluginDescriptor> = message
            .plugin_name()
            .and_then(|name| self.handles.registry.get_plugin_by_name(name).ok())
            .cloned();

        let mut for_plugins: Vec<Data> = Vec::new();
        for item in items {
            let is_new = !self.store.has(item.identity())?;

            // New URL resources consume the link budget, in or out of
            // scope alike.
            if is_new && item.subtype() == Subtype::Url {
                self.followed_links += 1;
                if self.config.max_links > 0 && self.followed_links > self.config.max_links {
                    self.warn_max_links()?;
                    continue;
                }
            }

            self.store.add(item)?;

            // A non-recursive plugin never observes its own products.
            if let Some(producer) = &producer {
                if !producer.recursive {
                    self.store
                        .mark_plugin_finished(item.identity(), &producer.name)?;
                }
            }

            if item.is_in_scope(&self.scope) {
                for_plugins.push(item.clone());
            } else {
                self.store
                    .mark_stage_finished(item.identity(), Stage::last())?;
            }
        }

        // Intern the discovery trees breadth-first. Items already in
        // the store are not expanded again.
        let mut visited: BTreeSet<Identity> =
            for_plugins.iter().map(|d| d.identity().clone()).collect();
        let mut queue: VecDeque<Data> = for_plugins
            .iter()
            .flat_map(|d| d.discovered().iter().cloned())
            .collect();
        while let Some(item) = queue.pop_front() {
            if visited.contains(item.identity()) || self.store.has(item.identity())? {
                continue;
            }
            self.store.add(&item)?;
            visited.insert(item.identity().clone());
            queue.extend(item.discovered().iter().cloned());
            if item.is_in_scope(&self.scope) {
                for_plugins.push(item);
            } else {
                self.store
                    .mark_stage_finished(item.identity(), Stage::last())?;
            }
        }

        if for_plugins.is_empty() {
            return Ok(false);
        }
        let dispatched = self.notify_batch(&for_plugins, self.current_stage)?;
        self.expecting_ack += dispatched;
        Ok(dispatched > 0)
    }

    /// Advance to the earliest stage with pending, runnable data; when
    /// every stage is exhausted, run the reports once, and after those
    /// drain, signal the audit's end.
    fn update_stage(&mut self) -> Result<()> {
        if self.is_report_started {
            self.handles
                .bus
                .send(Message::stop_audit(self.name.as_str(), true))?;
            return Ok(());
        }

        let mut stage = self.current_stage;
        loop {
            let pending = self.store.get_pending(stage)?;
            if !pending.is_empty() {
                let mut items = Vec::with_capacity(pending.len());
                for identity in &pending {
                    if let Some(item) = self.store.get(identity)? {
                        items.push(item);
                    }
                }

                if self.notifier.is_runnable_stage(&items, stage) {
                    self.set_stage(stage)?;
                    let dispatched = self.notify_batch(&items, stage)?;
                    if dispatched > 0 {
                        self.expecting_ack += dispatched;
                        return Ok(());
                    }
                    // Every eligible plugin had already processed these
                    // items; the batch is stage-marked, keep scanning.
                } else {
                    for identity in &pending {
                        self.store.mark_stage_finished(identity, stage)?;
                    }
                }
            }
            match stage.next() {
                Some(next) => stage = next,
                None => break,
            }
        }

        self.generate_reports()
    }

    /// Offer a batch to every matching plugin at `stage`, marking each
    /// `(item, plugin)` pair processed on dispatch and each item
    /// finished at the stage. Returns the number of dispatched calls.
    fn notify_batch(&self, items: &[Data], stage: Stage) -> Result<u64> {
        let mut dispatched = 0u64;
        for item in items {
            let mut eligible = Vec::new();
            for descriptor in self.notifier.plugins_for(item, stage) {
                if !self
                    .store
                    .has_plugin_finished(item.identity(), &descriptor.name)?
                {
                    eligible.push(descriptor.clone());
                }
            }
            for descriptor in eligible {
                self.store
                    .mark_plugin_finished(item.identity(), &descriptor.name)?;
                let context = self.plugin_context(&descriptor);
                self.handles
                    .pool
                    .run_plugin(context, PluginCall::RecvInfo { item: item.clone() })?;
                dispatched += 1;
            }
            self.store.mark_stage_finished(item.identity(), stage)?;
        }
        Ok(dispatched)
    }

    /// Kick off report generation exactly once. The self-ACK guard
    /// keeps the drain alive even when a report plugin fails to start.
    fn generate_reports(&mut self) -> Result<()> {
        if self.is_report_started {
            return Ok(());
        }
        self.is_report_started = true;
        self.expecting_ack += 1;
        info!(audit = self.name, "starting report stage");
        self.send_stage_label(Stage::REPORT_LABEL)?;

        let kicked_off = self.kickoff_reports();
        let ack = self.handles.bus.send(Message::ack(self.name.as_str(), None));
        kicked_off.and(ack)
    }

    fn kickoff_reports(&mut self) -> Result<()> {
        let report_plugins = self.report_plugins.clone();
        for plugin_name in &report_plugins {
            let descriptor = self
                .handles
                .registry
                .get_plugin_by_name(plugin_name)?
                .clone();
            for path in &self.config.reports {
                let context = self.plugin_context(&descriptor);
                self.handles.pool.run_plugin(
                    context,
                    PluginCall::GenerateReport { path: path.clone() },
                )?;
                self.expecting_ack += 1;
            }
        }
        Ok(())
    }

    fn plugin_context(&self, descriptor: &PluginDescriptor) -> PluginContext {
        PluginContext::for_audit(self.name.clone(), self.config.clone(), self.scope.clone())
            .for_plugin(descriptor.clone())
    }

    fn set_stage(&mut self, stage: Stage) -> Result<()> {
        if stage != self.current_stage {
            self.current_stage = stage;
            self.send_stage_label(stage.label())?;
        }
        Ok(())
    }

    fn send_stage_label(&self, label: &str) -> Result<()> {
        self.handles.bus.send(
            Message::new(Payload::StageUpdate {
                stage: label.to_string(),
            })
            .for_audit(self.name.as_str()),
        )
    }

    fn warn_max_links(&mut self) -> Result<()> {
        if self.warned_max_links {
            return Ok(());
        }
        self.warned_max_links = true;
        let text = format!(
            "maximum number of links ({}) reached! Audit: {}",
            self.config.max_links, self.name
        );
        warn!(audit = self.name, "{text}");
        self.handles.bus.send(
            Message::new(Payload::Warning {
                warnings: vec![WarningRecord::new(text, "runtime")],
            })
            .for_audit(self.name.as_str())
            .with_priority(Priority::High),
        )
    }

    /// Release the audit's resources: compact, then close the store.
    /// Both are attempted; the first error wins.
    pub(crate) fn close(&mut self) -> Result<()> {
        debug!(audit = self.name, "closing audit");
        let compacted = self.store.compact();
        let closed = self.store.close();
        compacted.and(closed)
    }
}

/// The running audits, by name.
#[derive(Default)]
pub(crate) struct AuditManager {
    audits: HashMap<String, Audit>,
}

impl AuditManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, bootstrap and start a new audit; returns its name.
    pub fn new_audit(
        &mut self,
        config: AuditConfig,
        handles: CoreHandles,
        resolver: &dyn DnsResolver,
    ) -> Result<String> {
        if let Some(name) = &config.audit_name {
            if self.audits.contains_key(name) {
                return Err(Error::config(format!("duplicate audit name: {name}")));
            }
        }

        let mut audit = Audit::new(config, handles.clone(), resolver)?;
        let name = audit.name().to_string();
        if self.audits.contains_key(&name) {
            let _ = audit.close();
            return Err(Error::config(format!("duplicate audit name: {name}")));
        }

        // The RPC surface sees the store only once the name is final.
        handles.rpc.register_store(&name, Arc::clone(audit.store()));
        if let Err(err) = audit.start() {
            handles.rpc.unregister_store(&name);
            let _ = audit.close();
            return Err(err);
        }
        self.audits.insert(name.clone(), audit);
        Ok(name)
    }

    pub fn has_audits(&self) -> bool {
        !self.audits.is_empty()
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Audit> {
        self.audits.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.audits.keys().cloned().collect()
    }

    pub fn remove(&mut self, name: &str) -> Option<Audit> {
        self.audits.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsResolution;
    use crate::messaging::{MessageBus, MessageCode};
    use crate::net::{NetworkCache, SlotManager};
    use crate::orchestrator::RpcExecutor;
    use crate::plugin::testutil::{descriptor, factory, StubPlugin};
    use crate::plugin::{BuiltinLoader, Plugin, PluginFactory, PluginLoader, PluginRegistry};
    use crate::scope::testutil::FixedResolver;
    use crate::worker::{WorkerPool, WorkerPoolConfig};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct Harness {
        bus: MessageBus,
        handles: CoreHandles,
    }

    fn harness(plugins: Vec<(PluginDescriptor, PluginFactory)>) -> Harness {
        let loader = Arc::new(BuiltinLoader::new());
        let mut registry = PluginRegistry::new(Arc::clone(&loader) as Arc<dyn PluginLoader>);
        for (descriptor, factory) in plugins {
            let module = descriptor
                .module
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .into_owned();
            loader.register(module, "Plugin", factory);
            registry.register(descriptor).unwrap();
        }
        let registry = Arc::new(registry);

        let bus = MessageBus::new();
        let cache = Arc::new(NetworkCache::new());
        let slots = Arc::new(SlotManager::new(4));
        let rpc = Arc::new(RpcExecutor::new(
            Arc::clone(&cache),
            Arc::clone(&slots),
            bus.handle(),
        ));
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                max_process: 0,
                ..Default::default()
            },
            Arc::clone(&registry),
            bus.handle(),
            Arc::clone(&rpc),
        ));

        let handles = CoreHandles {
            registry,
            pool,
            bus: bus.handle(),
            rpc,
            cache,
        };
        Harness { bus, handles }
    }

    fn audit_config(targets: &[&str]) -> AuditConfig {
        let mut config = AuditConfig::new(targets.iter().copied()).with_max_process(0);
        config.dns_resolution = DnsResolution::Off;
        config
    }

    /// Drive the audit the way the orchestrator's consumer loop would,
    /// until it signals its stop message or the bus idles out.
    fn pump(harness: &Harness, audit: &mut Audit) -> Vec<Message> {
        let mut observed = Vec::new();
        for _ in 0..10_000 {
            let Some(message) = harness.bus.try_recv() else {
                break;
            };
            match message.code() {
                MessageCode::Data => {
                    audit.dispatch_data(&message).unwrap();
                }
                MessageCode::Ack => {
                    audit.acknowledge(&message).unwrap();
                }
                MessageCode::StopAudit => {
                    observed.push(message);
                    break;
                }
                _ => observed.push(message),
            }
        }
        observed
    }

    #[test]
    fn test_bootstrap_seeds_targets() {
        let h = harness(vec![(
            descriptor("testing/recon/null", Stage::Recon),
            factory(|| {
                Box::new(StubPlugin {
                    accepted: None,
                    produce: Box::new(|_| Ok(Vec::new())),
                }) as Box<dyn Plugin>
            }),
        )]);

        let audit = Audit::new(
            audit_config(&["example.com"]),
            h.handles.clone(),
            &FixedResolver::empty(),
        )
        .unwrap();

        let store = audit.store();
        assert!(store.has(Data::domain("example.com").identity()).unwrap());
        assert!(store
            .has(Data::url("http://example.com/").unwrap().identity())
            .unwrap());
        assert!(audit.name().starts_with("argus-"));
        assert_eq!(audit.expecting_ack(), 0);
    }

    #[test]
    fn test_full_run_reaches_report_and_stops() {
        let h = harness(vec![(
            descriptor("testing/recon/null", Stage::Recon),
            factory(|| {
                Box::new(StubPlugin {
                    accepted: None,
                    produce: Box::new(|_| Ok(Vec::new())),
                }) as Box<dyn Plugin>
            }),
        )]);

        let mut audit = Audit::new(
            audit_config(&["example.com"]),
            h.handles.clone(),
            &FixedResolver::empty(),
        )
        .unwrap();
        audit.start().unwrap();
        assert!(audit.expecting_ack() > 0);

        let observed = pump(&h, &mut audit);
        assert_eq!(audit.expecting_ack(), 0);
        assert!(audit.is_report_started());
        let stop = observed
            .iter()
            .find(|m| m.code() == MessageCode::StopAudit)
            .expect("expected the audit stop message");
        assert!(matches!(
            stop.payload(),
            Payload::StopAudit { finished: true }
        ));
        // The report stage label was announced.
        assert!(observed.iter().any(|m| matches!(
            m.payload(),
            Payload::StageUpdate { stage } if stage == Stage::REPORT_LABEL
        )));
    }

    #[test]
    fn test_out_of_scope_result_admitted_but_never_notified() {
        // The spider returns an out-of-scope URL; it must be stored
        // for linkage but finished at every stage and never dispatched.
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_f = Arc::clone(&seen);
        let h = harness(vec![(
            descriptor("testing/recon/spider", Stage::Recon),
            factory(move || {
                let seen = Arc::clone(&seen_f);
                Box::new(StubPlugin {
                    accepted: Some(vec![Subtype::Url.tag()]),
                    produce: Box::new(move |info| {
                        seen.lock()
                            .unwrap()
                            .push(info.identity_field("url").unwrap_or("").to_string());
                        Ok(vec![Data::url("http://evil.test/").unwrap()])
                    }),
                }) as Box<dyn Plugin>
            }),
        )]);

        let mut audit = Audit::new(
            audit_config(&["example.com"]),
            h.handles.clone(),
            &FixedResolver::empty(),
        )
        .unwrap();
        audit.start().unwrap();
        pump(&h, &mut audit);

        let evil = Data::url("http://evil.test/").unwrap();
        let store = audit.store();
        assert!(store.has(evil.identity()).unwrap());
        for stage in Stage::ALL {
            assert!(store.has_stage_finished(evil.identity(), stage).unwrap());
        }
        // The spider saw the seeded URL only.
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &["http://example.com/".to_string()]
        );
    }

    #[test]
    fn test_discovery_tree_interned_breadth_first() {
        let h = harness(vec![(
            descriptor("testing/recon/discoverer", Stage::Recon),
            factory(|| {
                Box::new(StubPlugin {
                    accepted: Some(vec![Subtype::Domain.tag()]),
                    produce: Box::new(|_| {
                        let mut child = Data::url("http://example.com/a").unwrap();
                        child.add_discovery(Data::url("http://example.com/a/b").unwrap());
                        child.add_discovery(Data::url("http://evil.test/c").unwrap());
                        let mut primary = Data::url("http://example.com/").unwrap();
                        primary.add_discovery(child);
                        Ok(vec![primary])
                    }),
                }) as Box<dyn Plugin>
            }),
        )]);

        let mut audit = Audit::new(
            audit_config(&["example.com"]),
            h.handles.clone(),
            &FixedResolver::empty(),
        )
        .unwrap();
        audit.start().unwrap();
        pump(&h, &mut audit);

        let store = audit.store();
        for url in [
            "http://example.com/a",
            "http://example.com/a/b",
            "http://evil.test/c",
        ] {
            let item = Data::url(url).unwrap();
            assert!(store.has(item.identity()).unwrap(), "missing {url}");
        }
        // The out-of-scope discovery finished every stage immediately.
        let evil = Data::url("http://evil.test/c").unwrap();
        assert!(store
            .has_stage_finished(evil.identity(), Stage::last())
            .unwrap());
        let ok = Data::url("http://example.com/a/b").unwrap();
        assert!(store
            .has_stage_finished(ok.identity(), Stage::Recon)
            .unwrap());
    }

    #[test]
    fn test_non_recursive_plugin_never_sees_own_products() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_f = Arc::clone(&seen);
        let h = harness(vec![(
            descriptor("testing/recon/spider", Stage::Recon),
            factory(move || {
                let seen = Arc::clone(&seen_f);
                Box::new(StubPlugin {
                    accepted: Some(vec![Subtype::Url.tag()]),
                    produce: Box::new(move |info| {
                        let url = info.identity_field("url").unwrap_or("").to_string();
                        seen.lock().unwrap().push(url.clone());
                        Ok(vec![Data::url(&format!("{url}next")).unwrap()])
                    }),
                }) as Box<dyn Plugin>
            }),
        )]);

        let mut audit = Audit::new(
            audit_config(&["example.com"]),
            h.handles.clone(),
            &FixedResolver::empty(),
        )
        .unwrap();
        audit.start().unwrap();
        pump(&h, &mut audit);

        // Only the seeded URL: the product was marked processed for its
        // producer before it could be offered again.
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &["http://example.com/".to_string()]
        );
    }

    #[test]
    fn test_recursive_plugin_observes_own_products() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_f = Arc::clone(&seen);
        let mut recursive = descriptor("testing/recon/crawler", Stage::Recon);
        recursive.recursive = true;
        let h = harness(vec![(
            recursive,
            factory(move || {
                let seen = Arc::clone(&seen_f);
                Box::new(StubPlugin {
                    accepted: Some(vec![Subtype::Url.tag()]),
                    produce: Box::new(move |info| {
                        let url = info.identity_field("url").unwrap_or("").to_string();
                        seen.lock().unwrap().push(url.clone());
                        if url.matches("deeper").count() < 2 {
                            Ok(vec![Data::url(&format!("{url}deeper/")).unwrap()])
                        } else {
                            Ok(Vec::new())
                        }
                    }),
                }) as Box<dyn Plugin>
            }),
        )]);

        let mut audit = Audit::new(
            audit_config(&["example.com"]),
            h.handles.clone(),
            &FixedResolver::empty(),
        )
        .unwrap();
        audit.start().unwrap();
        pump(&h, &mut audit);

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[
                "http://example.com/".to_string(),
                "http://example.com/deeper/".to_string(),
                "http://example.com/deeper/deeper/".to_string(),
            ]
        );
    }

    #[test]
    fn test_report_plugins_run_per_output_path() {
        let reports = Arc::new(Mutex::new(Vec::<std::path::PathBuf>::new()));
        let reports_f = Arc::clone(&reports);

        struct Reporter(Arc<Mutex<Vec<std::path::PathBuf>>>);
        impl Plugin for Reporter {
            fn generate_report(&mut self, path: &std::path::Path) -> Result<()> {
                self.0.lock().unwrap().push(path.to_path_buf());
                Ok(())
            }
        }

        let h = harness(vec![
            (
                descriptor("testing/recon/null", Stage::Recon),
                factory(|| {
                    Box::new(StubPlugin {
                        accepted: None,
                        produce: Box::new(|_| Ok(Vec::new())),
                    }) as Box<dyn Plugin>
                }),
            ),
            (
                descriptor("report/text", Stage::Recon),
                factory(move || Box::new(Reporter(Arc::clone(&reports_f))) as Box<dyn Plugin>),
            ),
        ]);

        let mut config = audit_config(&["example.com"]);
        config.reports = vec!["out/a.txt".into(), "out/b.txt".into()];
        let mut audit = Audit::new(config, h.handles.clone(), &FixedResolver::empty()).unwrap();
        audit.start().unwrap();
        let observed = pump(&h, &mut audit);

        let written = reports.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert!(observed
            .iter()
            .any(|m| m.code() == MessageCode::StopAudit));
        assert_eq!(audit.expecting_ack(), 0);
    }

    #[test]
    fn test_audit_name_generation_format() {
        let name = Audit::generate_audit_name();
        assert!(name.starts_with("argus-"));
        // argus-YYYY-MM-DD-HH_MM_SS
        let stamp = name.strip_prefix("argus-").unwrap();
        assert_eq!(stamp.len(), "2013-09-01-12_00_00".len());
    }

    #[test]
    fn test_manager_routes_and_removes() {
        let h = harness(vec![(
            descriptor("testing/recon/null", Stage::Recon),
            factory(|| {
                Box::new(StubPlugin {
                    accepted: None,
                    produce: Box::new(|_| Ok(Vec::new())),
                }) as Box<dyn Plugin>
            }),
        )]);

        let mut manager = AuditManager::new();
        let name = manager
            .new_audit(
                audit_config(&["example.com"]).with_name("first"),
                h.handles.clone(),
                &FixedResolver::empty(),
            )
            .unwrap();
        assert_eq!(name, "first");
        assert!(manager.has_audits());
        assert!(manager.get_mut("first").is_some());

        let err = manager
            .new_audit(
                audit_config(&["example.com"]).with_name("first"),
                h.handles.clone(),
                &FixedResolver::empty(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("duplicate audit name"));

        let mut removed = manager.remove("first").unwrap();
        removed.close().unwrap();
        assert!(!manager.has_audits());
    }
}
