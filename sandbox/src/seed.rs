use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::{Result, SandboxError};

/// Fixture files to bootstrap, keyed by name relative to the base directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SeedManifest {
    entries: BTreeMap<String, String>,
}

impl SeedManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock fixtures shipped with a fresh sandbox.
    pub fn samples() -> Self {
        Self::new()
            .with_entry("hello.txt", "Hello from safe file!\n")
            .with_entry("notes/readme.md", "# Readme\nSample readme file")
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| SandboxError::InvalidConfig(format!("invalid seed manifest: {err}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_entry(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.entries.insert(name.into(), content.into());
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_str()))
    }
}
