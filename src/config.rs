// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the adsynth project (automatic differentiation by source transformation).

//! Engine options, optionally read from an `adsynth.toml`:
//!
//! ```toml
//! [engine]
//! numerical-fallback = true
//! print-numerical-errors = false
//! max-derivation-depth = 64
//! machine-epsilon = 2.220446049250313e-16
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "adsynth.toml";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineOptions {
    /// Approximate calls the engine cannot differentiate with a five-point
    /// stencil. When off such calls abort synthesis.
    pub numerical_fallback: bool,
    /// Log truncation and rounding estimates of every stencil evaluation.
    pub print_numerical_errors: bool,
    /// Longest chain of nested callee derivations.
    pub max_derivation_depth: usize,
    /// Unit roundoff used by error estimation.
    pub machine_epsilon: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            numerical_fallback: true,
            print_numerical_errors: false,
            max_derivation_depth: 64,
            machine_epsilon: f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub engine: EngineOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("machine-epsilon must be positive and finite, got {0}")]
    Epsilon(f64),
}

impl EngineOptions {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(text)?;
        Ok(file.engine)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options = Self::from_toml_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        log::debug!("loaded engine options from {}: {options:?}", path.display());
        Ok(options)
    }

    /// Loads `adsynth.toml` from `dir` when present, else the defaults.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(DEFAULT_CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.machine_epsilon.is_finite() && self.machine_epsilon > 0.0) {
            return Err(ConfigError::Epsilon(self.machine_epsilon));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&ConfigFile { engine: *self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_keep_defaults() {
        let options = EngineOptions::from_toml_str("[engine]\nnumerical-fallback = false\n")
            .expect("parse");
        assert!(!options.numerical_fallback);
        assert_eq!(options.max_derivation_depth, 64);
        assert_eq!(options.machine_epsilon, f64::EPSILON);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(EngineOptions::from_toml_str("[engine]\nfallback = true\n").is_err());
    }

    #[test]
    fn serialized_options_load_back() {
        let options = EngineOptions {
            print_numerical_errors: true,
            max_derivation_depth: 8,
            ..EngineOptions::default()
        };
        let text = options.to_toml().expect("serialize");
        assert_eq!(EngineOptions::from_toml_str(&text).expect("parse"), options);
    }
}
