//! Model profiles: named, pre-configured sets of serving parameters.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::{ControlError, Result};

/// One serving configuration. Numeric parameters stay as text so that an
/// unset field is simply empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub speed: String,
    /// Model file, relative to the model directory unless absolute.
    pub model: String,
    #[serde(deserialize_with = "text")]
    pub ctx_size: String,
    #[serde(deserialize_with = "text")]
    pub gpu_layers: String,
    pub fit: String,
    #[serde(deserialize_with = "text")]
    pub fit_target: String,
    pub extra_args: String,
    pub benchmark: bool,
}

impl ModelProfile {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    pub fn artifact_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(&self.model)
    }
}

/// Accepts `ctx_size: 4096` as readily as `ctx_size: "4096"`.
fn text<'de, D: Deserializer<'de>>(de: D) -> core::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        Str(String),
        Int(i64),
        Float(f64),
    }
    Ok(match Text::deserialize(de)? {
        Text::Str(s) => s,
        Text::Int(i) => i.to_string(),
        Text::Float(f) => f.to_string(),
    })
}

#[derive(Deserialize)]
struct ProfileFile {
    profiles: Vec<ModelProfile>,
}

/// The immutable, non-empty set of profiles loaded at startup.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    profiles: Vec<ModelProfile>,
    production: Vec<usize>,
    benchmark: Vec<usize>,
}

impl ProfileSet {
    pub fn new(profiles: Vec<ModelProfile>) -> Result<Self> {
        if profiles.is_empty() {
            return Err(ControlError::Config("no model profiles defined".into()));
        }
        let mut seen = HashSet::new();
        for p in &profiles {
            if p.id.is_empty() {
                return Err(ControlError::Config("profile with empty id".into()));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(ControlError::Config(format!("duplicate profile id: {}", p.id)));
            }
        }
        let (benchmark, production): (Vec<usize>, Vec<usize>) =
            (0..profiles.len()).partition(|&i| profiles[i].benchmark);
        Ok(Self { profiles, production, benchmark })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: ProfileFile = serde_yaml::from_str(text)?;
        Self::new(file.profiles)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ControlError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn get(&self, id: &str) -> Option<&ModelProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn all(&self) -> &[ModelProfile] { &self.profiles }

    pub fn production(&self) -> impl Iterator<Item = &ModelProfile> {
        self.production.iter().map(|&i| &self.profiles[i])
    }

    pub fn benchmark(&self) -> impl Iterator<Item = &ModelProfile> {
        self.benchmark.iter().map(|&i| &self.profiles[i])
    }

    pub fn len(&self) -> usize { self.profiles.len() }
    pub fn is_empty(&self) -> bool { self.profiles.is_empty() }
}
