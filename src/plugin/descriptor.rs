//! Plugin descriptor files.
//!
//! A plugin is described by a case-sensitive INI-like file with the
//! `.golismero` extension, living under a category folder of the
//! plugins directory:
//!
//! ```ini
//! [Core]
//! Name = OS fingerprinter
//! Module = fingerprinter
//! Class = OsFingerprinter
//! Stage = recon
//! Dependencies = testing/recon/spider
//! Recursive = false
//!
//! [Documentation]
//! Description = Fingerprints the remote operating system.
//! Version = 1.0
//! Author = Example Author
//! Website = https://example.test
//!
//! [Configuration]
//! timeout = 10
//! ```
//!
//! The plugin name is the descriptor's path relative to the plugins
//! folder, without extension and with `/` separators on every platform,
//! e.g. `testing/recon/fingerprinter`.

use super::{PluginCategory, Stage};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Parsed plugin descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin name, `<category>/<relative path>`.
    pub name: String,
    /// Category folder the descriptor was found under.
    pub category: PluginCategory,
    /// Display name shown to the user.
    pub display_name: String,
    /// Loadable module path, resolved inside the plugin's own folder.
    pub module: PathBuf,
    /// Class name inside the module; autodiscovered when absent.
    pub class_name: Option<String>,
    /// Pipeline stage (testing plugins only; defaults to recon).
    pub stage: Stage,
    /// Names of plugins that must run before this one.
    pub dependencies: Vec<String>,
    /// Whether the plugin may be re-invoked on items it produced.
    pub recursive: bool,
    /// Free-form plugin configuration, opaque to the core.
    pub configuration: BTreeMap<String, String>,
    /// Documentation fields.
    pub description: String,
    pub version: String,
    pub author: String,
    pub website: String,
    /// Descriptor file this was parsed from.
    pub descriptor_file: PathBuf,
}

impl PluginDescriptor {
    /// Parse a descriptor file found under `plugins_folder`.
    pub fn parse(descriptor_file: &Path, plugins_folder: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(descriptor_file)?;
        let sections = parse_sections(&text, descriptor_file)?;

        let core = sections.get("Core").ok_or_else(|| {
            Error::config(format!("{}: missing [Core] section", descriptor_file.display()))
        })?;

        let display_name = core
            .get("Name")
            .cloned()
            .ok_or_else(|| {
                Error::config(format!("{}: missing Core.Name", descriptor_file.display()))
            })?;
        let module_value = core.get("Module").cloned().ok_or_else(|| {
            Error::config(format!("{}: missing Core.Module", descriptor_file.display()))
        })?;

        let name = plugin_name(descriptor_file, plugins_folder)?;
        let category = name
            .split('/')
            .next()
            .and_then(PluginCategory::parse)
            .ok_or_else(|| {
                Error::config(format!(
                    "{}: descriptor is not under a category folder (testing, ui, report)",
                    descriptor_file.display()
                ))
            })?;

        let stage = match core.get("Stage") {
            Some(label) => Stage::parse(label).ok_or_else(|| {
                Error::config(format!(
                    "{}: unknown stage {:?}",
                    descriptor_file.display(),
                    label
                ))
            })?,
            None => Stage::Recon,
        };

        let dependencies = core
            .get("Dependencies")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let recursive = match core.get("Recursive").map(String::as_str) {
            None => false,
            Some("true") | Some("yes") | Some("1") => true,
            Some("false") | Some("no") | Some("0") => false,
            Some(other) => {
                return Err(Error::config(format!(
                    "{}: invalid Core.Recursive value {:?}",
                    descriptor_file.display(),
                    other
                )))
            }
        };

        let module = resolve_module(&module_value, descriptor_file)?;
        let class_name = core.get("Class").map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let docs = sections.get("Documentation");
        let doc = |key: &str, default: &str| -> String {
            docs.and_then(|d| d.get(key))
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let configuration = sections.get("Configuration").cloned().unwrap_or_default();

        Ok(Self {
            name,
            category,
            description: doc("Description", &display_name),
            version: doc("Version", "?.?"),
            author: doc("Author", "Anonymous"),
            website: doc("Website", ""),
            display_name,
            module,
            class_name,
            stage,
            dependencies,
            recursive,
            configuration,
            descriptor_file: descriptor_file.to_path_buf(),
        })
    }
}

/// Derive the plugin name from the descriptor location.
fn plugin_name(descriptor_file: &Path, plugins_folder: &Path) -> Result<String> {
    let relative = descriptor_file
        .with_extension("")
        .strip_prefix(plugins_folder)
        .map_err(|_| {
            Error::config(format!(
                "{}: descriptor is outside the plugins folder {}",
                descriptor_file.display(),
                plugins_folder.display()
            ))
        })?
        .to_path_buf();

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

/// Resolve the module path against the descriptor's folder, rejecting
/// absolute paths and paths escaping the folder.
fn resolve_module(module: &str, descriptor_file: &Path) -> Result<PathBuf> {
    let module_path = Path::new(module);
    if module_path.is_absolute() {
        return Err(Error::config(format!(
            "{}: plugin module path is absolute",
            descriptor_file.display()
        )));
    }
    if module_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "{}: plugin module is located outside its plugin folder",
            descriptor_file.display()
        )));
    }
    let folder = descriptor_file.parent().unwrap_or_else(|| Path::new(""));
    Ok(folder.join(module_path))
}

/// Parse the INI-like descriptor text into sections. Keys are
/// case-sensitive; `#` and `;` start comments; duplicate keys within a
/// section are an error.
fn parse_sections(
    text: &str,
    file: &Path,
) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            sections.entry(name.trim().to_string()).or_default();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::config(format!(
                "{}:{}: expected 'key = value', got {:?}",
                file.display(),
                lineno + 1,
                raw
            )));
        };
        let Some(section) = current.as_ref() else {
            return Err(Error::config(format!(
                "{}:{}: key outside of any section",
                file.display(),
                lineno + 1
            )));
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        let entries = sections.entry(section.clone()).or_default();
        if entries.insert(key.clone(), value).is_some() {
            return Err(Error::config(format!(
                "{}:{}: duplicate key {:?} in [{}]",
                file.display(),
                lineno + 1,
                key,
                section
            )));
        }
    }

    Ok(sections)
}
