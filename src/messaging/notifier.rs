//! Fanout of data and control messages to plugins.
//!
//! The [`AuditNotifier`] indexes an audit's testing plugins by the
//! `(kind, subtype)` tags they accept and answers the coordinator's
//! scheduling questions: who should see this item at this stage, and is
//! a stage runnable at all. The [`UiNotifier`] forwards control and
//! status traffic to UI plugins in-process.

use super::Message;
use crate::data::{Data, TypeTag};
use crate::plugin::{PluginDescriptor, SharedPlugin, Stage};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Index of testing plugins by accepted tag and stage.
#[derive(Default)]
pub struct AuditNotifier {
    plugins: BTreeMap<String, PluginDescriptor>,
    /// Plugins accepting every tag.
    accept_all: BTreeSet<String>,
    /// Plugins accepting specific tags.
    accept_tag: BTreeMap<TypeTag, BTreeSet<String>>,
}

impl AuditNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a testing plugin with the accepted-tag set its instance
    /// reported. `None` means every tag.
    pub fn add_plugin(&mut self, descriptor: PluginDescriptor, accepted: Option<Vec<TypeTag>>) {
        let name = descriptor.name.clone();
        match accepted {
            None => {
                self.accept_all.insert(name.clone());
            }
            Some(tags) => {
                for tag in tags {
                    self.accept_tag.entry(tag).or_default().insert(name.clone());
                }
            }
        }
        self.plugins.insert(name, descriptor);
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Descriptor of a registered plugin.
    pub fn plugin(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(name)
    }

    /// Registered plugins at the given stage whose accepted set matches
    /// the item, in name order.
    pub fn plugins_for(&self, item: &Data, stage: Stage) -> Vec<&PluginDescriptor> {
        let mut names: BTreeSet<&String> = self.accept_all.iter().collect();
        if let Some(tagged) = self.accept_tag.get(&item.tag()) {
            names.extend(tagged.iter());
        }
        names
            .into_iter()
            .filter_map(|name| self.plugins.get(name))
            .filter(|descriptor| descriptor.stage == stage)
            .collect()
    }

    /// Whether any registered plugin at `stage` would accept any of the
    /// given items.
    pub fn is_runnable_stage(&self, items: &[Data], stage: Stage) -> bool {
        items
            .iter()
            .any(|item| !self.plugins_for(item, stage).is_empty())
    }
}

/// In-process fanout of control and status messages to UI plugins.
#[derive(Default)]
pub struct UiNotifier {
    plugins: Vec<(PluginDescriptor, SharedPlugin)>,
}

impl UiNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a UI plugin instance.
    pub fn add_plugin(&mut self, descriptor: PluginDescriptor, instance: SharedPlugin) {
        self.plugins.push((descriptor, instance));
    }

    /// Number of registered UI plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no UI plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Forward a message to every UI plugin. Failures are logged and do
    /// not interrupt delivery to the remaining plugins.
    pub fn notify(&self, message: &Message) {
        for (descriptor, instance) in &self.plugins {
            let mut plugin = match instance.lock() {
                Ok(plugin) => plugin,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(err) = plugin.recv_msg(message) {
                warn!(plugin = descriptor.name, %err, "UI plugin failed on message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Subtype;
    use crate::plugin::testutil::descriptor;
    use pretty_assertions::assert_eq;

    fn notifier_with(entries: &[(&str, Stage, Option<Vec<TypeTag>>)]) -> AuditNotifier {
        let mut notifier = AuditNotifier::new();
        for (name, stage, accepted) in entries {
            notifier.add_plugin(descriptor(name, *stage), accepted.clone());
        }
        notifier
    }

    #[test]
    fn test_accept_all_matches_everything() {
        let notifier = notifier_with(&[("testing/recon/spider", Stage::Recon, None)]);
        let url = Data::url("http://example.com/").unwrap();
        let domain = Data::domain("example.com");

        assert_eq!(notifier.plugins_for(&url, Stage::Recon).len(), 1);
        assert_eq!(notifier.plugins_for(&domain, Stage::Recon).len(), 1);
        assert!(notifier.plugins_for(&url, Stage::Scan).is_empty());
    }

    #[test]
    fn test_tagged_acceptance() {
        let notifier = notifier_with(&[
            (
                "testing/recon/url_only",
                Stage::Recon,
                Some(vec![Subtype::Url.tag()]),
            ),
            ("testing/recon/everything", Stage::Recon, None),
        ]);

        let url = Data::url("http://example.com/").unwrap();
        let domain = Data::domain("example.com");
        assert_eq!(notifier.plugins_for(&url, Stage::Recon).len(), 2);
        let for_domain = notifier.plugins_for(&domain, Stage::Recon);
        assert_eq!(for_domain.len(), 1);
        assert_eq!(for_domain[0].name, "testing/recon/everything");
    }

    #[test]
    fn test_is_runnable_stage() {
        let notifier = notifier_with(&[(
            "testing/scan/probe",
            Stage::Scan,
            Some(vec![Subtype::Url.tag()]),
        )]);

        let url = Data::url("http://example.com/").unwrap();
        let domain = Data::domain("example.com");
        assert!(notifier.is_runnable_stage(std::slice::from_ref(&url), Stage::Scan));
        assert!(!notifier.is_runnable_stage(std::slice::from_ref(&domain), Stage::Scan));
        assert!(!notifier.is_runnable_stage(&[url], Stage::Recon));
    }

    #[test]
    fn test_ui_notifier_keeps_going_after_failure() {
        use crate::plugin::Plugin;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Failing;
        impl Plugin for Failing {
            fn recv_msg(&mut self, _: &Message) -> crate::error::Result<()> {
                Err(crate::error::Error::plugin("ui/failing", "boom"))
            }
        }

        struct Counting(Arc<AtomicUsize>);
        impl Plugin for Counting {
            fn recv_msg(&mut self, _: &Message) -> crate::error::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let mut notifier = UiNotifier::new();
        notifier.add_plugin(
            descriptor("ui/failing", Stage::Recon),
            Arc::new(std::sync::Mutex::new(Box::new(Failing) as Box<dyn Plugin>)),
        );
        notifier.add_plugin(
            descriptor("ui/counting", Stage::Recon),
            Arc::new(std::sync::Mutex::new(
                Box::new(Counting(Arc::clone(&seen))) as Box<dyn Plugin>
            )),
        );

        notifier.notify(&Message::stop(true));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
