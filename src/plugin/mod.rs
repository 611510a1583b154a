//! Plugin model: callback surface, categories and pipeline stages.
//!
//! A plugin implements a subset of the [`Plugin`] callbacks. Testing
//! plugins are partitioned into [`Stage`]s and receive data items;
//! UI plugins observe control and status traffic in-process; report
//! plugins render results when the pipeline drains.

mod descriptor;
mod registry;

pub use descriptor::PluginDescriptor;
pub use registry::{BuiltinLoader, PluginFactory, PluginLoader, PluginRegistry, SharedPlugin};

#[cfg(test)]
pub(crate) use registry::testutil;

use crate::data::{Data, TypeTag};
use crate::error::Result;
use crate::messaging::Message;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Plugin category, derived from the first component of the plugin name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    Testing,
    Ui,
    Report,
}

impl PluginCategory {
    /// Canonical lowercase label, as used in plugin names.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Testing => "testing",
            Self::Ui => "ui",
            Self::Report => "report",
        }
    }

    /// Parse a category folder name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "testing" => Some(Self::Testing),
            "ui" => Some(Self::Ui),
            "report" => Some(Self::Report),
            _ => None,
        }
    }
}

/// Pipeline stage of a testing plugin. Stages are totally ordered and
/// the audit advances through them with barrier semantics; the report
/// phase runs after the last stage drains.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recon,
    Scan,
    Attack,
    Intrude,
    Cleanup,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Recon,
        Stage::Scan,
        Stage::Attack,
        Stage::Intrude,
        Stage::Cleanup,
    ];

    /// Label of the sentinel report phase, used in stage updates.
    pub const REPORT_LABEL: &'static str = "report";

    /// Zero-based position in the pipeline.
    pub fn index(&self) -> i64 {
        *self as i64
    }

    /// Stage at the given position.
    pub fn from_index(index: i64) -> Option<Stage> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    /// First stage of the pipeline.
    pub fn first() -> Stage {
        Stage::Recon
    }

    /// Last stage of the pipeline.
    pub fn last() -> Stage {
        Stage::Cleanup
    }

    /// The next stage, if any.
    pub fn next(&self) -> Option<Stage> {
        Self::from_index(self.index() + 1)
    }

    /// Canonical lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::Scan => "scan",
            Self::Attack => "attack",
            Self::Intrude => "intrude",
            Self::Cleanup => "cleanup",
        }
    }

    /// Parse a stage label.
    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "recon" => Some(Self::Recon),
            "scan" => Some(Self::Scan),
            "attack" => Some(Self::Attack),
            "intrude" => Some(Self::Intrude),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Callback surface implemented by plugins.
///
/// Every method has a default so a plugin implements only the subset it
/// needs. Callbacks run one at a time per plugin call, in a worker
/// process or inline depending on the pool mode.
pub trait Plugin: Send {
    /// The `(kind, subtype)` tags this plugin accepts. `None` means
    /// every tag.
    fn accepted_info(&self) -> Option<Vec<TypeTag>> {
        None
    }

    /// Process one data item; return newly produced items.
    fn recv_info(&mut self, _info: &Data) -> Result<Vec<Data>> {
        Ok(Vec::new())
    }

    /// Observe a control or status message.
    fn recv_msg(&mut self, _message: &Message) -> Result<()> {
        Ok(())
    }

    /// Render a report to the given path.
    fn generate_report(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// Human-readable help text.
    fn display_help(&self) -> String {
        String::new()
    }
}
