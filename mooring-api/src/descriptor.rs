//! Plugin and service descriptors
//!
//! A [`PluginDescriptor`] is what discovery hands us: a plugin's base path,
//! name and an arbitrary property bag. A [`ServiceDescriptor`] narrows that
//! down to everything an executor needs to construct one service instance.
//! It is immutable after construction and owned by exactly one executor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::{Payload, PayloadError};

/// Property key naming the plugin's code module file, relative to the
/// plugin directory
pub const MODULE_FILE_PROPERTY: &str = "module_file";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("plugin `{plugin}` is missing the `{property}` property")]
    MissingProperty {
        plugin: String,
        property: &'static str,
    },

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// What plugin discovery supplies: base path, name, property bag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub base_path: PathBuf,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            properties: HashMap::new(),
        }
    }

    /// Set a string property, builder style
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Look up a property expected to be a string
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

/// Immutable description of how to build one service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    service_type: String,
    plugin_dir: PathBuf,
    module_file: String,
    ctor_args: Payload,
}

impl ServiceDescriptor {
    pub fn new(
        service_type: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
        module_file: impl Into<String>,
        ctor_args: Payload,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            plugin_dir: plugin_dir.into(),
            module_file: module_file.into(),
            ctor_args,
        }
    }

    /// Build a descriptor from a discovered plugin. The plugin's property
    /// bag must name its module file.
    pub fn from_plugin<T: Serialize>(
        service_type: impl Into<String>,
        plugin: &PluginDescriptor,
        ctor_args: &T,
    ) -> Result<Self, DescriptorError> {
        let module_file = plugin
            .property_str(MODULE_FILE_PROPERTY)
            .ok_or_else(|| DescriptorError::MissingProperty {
                plugin: plugin.name.clone(),
                property: MODULE_FILE_PROPERTY,
            })?
            .to_string();

        Ok(Self {
            service_type: service_type.into(),
            plugin_dir: plugin.base_path.clone(),
            module_file,
            ctor_args: Payload::encode(ctor_args)?,
        })
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn module_file(&self) -> &str {
        &self.module_file
    }

    /// Full path to the plugin's module file
    pub fn module_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.module_file)
    }

    pub fn ctor_args(&self) -> &Payload {
        &self.ctor_args
    }

    /// The same descriptor pointing at a different plugin directory. Used by
    /// the remote server after it has materialized the transferred plugin
    /// tree on its own filesystem.
    pub fn rebased(&self, plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            service_type: self.service_type.clone(),
            plugin_dir: plugin_dir.into(),
            module_file: self.module_file.clone(),
            ctor_args: self.ctor_args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_plugin_reads_module_file_property() {
        let plugin =
            PluginDescriptor::new("greeter", "/plugins/greeter").property(MODULE_FILE_PROPERTY, "greeter.bin");

        let descriptor = ServiceDescriptor::from_plugin("greeter", &plugin, &()).unwrap();
        assert_eq!(descriptor.module_file(), "greeter.bin");
        assert_eq!(
            descriptor.module_path(),
            PathBuf::from("/plugins/greeter/greeter.bin")
        );
    }

    #[test]
    fn from_plugin_without_module_file_fails() {
        let plugin = PluginDescriptor::new("greeter", "/plugins/greeter");
        let result = ServiceDescriptor::from_plugin("greeter", &plugin, &());
        assert!(matches!(
            result,
            Err(DescriptorError::MissingProperty { .. })
        ));
    }

    #[test]
    fn rebased_keeps_everything_but_the_directory() {
        let descriptor = ServiceDescriptor::new("svc", "/local/plugin", "mod.bin", Payload::unit());
        let rebased = descriptor.rebased("/srv/session-1/plugin");
        assert_eq!(rebased.service_type(), "svc");
        assert_eq!(rebased.module_path(), PathBuf::from("/srv/session-1/plugin/mod.bin"));
    }
}
