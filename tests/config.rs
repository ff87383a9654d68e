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

use std::fs;

use adsynth::config::{ConfigError, EngineOptions, DEFAULT_CONFIG_FILE};

#[test]
fn discovery_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = EngineOptions::discover(dir.path()).expect("discover");
    assert_eq!(options, EngineOptions::default());
}

#[test]
fn discovered_file_overrides_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join(DEFAULT_CONFIG_FILE),
        "[engine]\nprint-numerical-errors = true\nmax-derivation-depth = 12\n",
    )
    .expect("write");
    let options = EngineOptions::discover(dir.path()).expect("discover");
    assert!(options.print_numerical_errors);
    assert!(options.numerical_fallback);
    assert_eq!(options.max_derivation_depth, 12);
}

#[test]
fn malformed_files_name_the_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[engine]\nmax-derivation-depth = \"deep\"\n").expect("write");
    let err = EngineOptions::load(&path).expect_err("bad value");
    assert!(matches!(err, ConfigError::Toml { .. }));
    assert!(err.to_string().contains("bad.toml"), "{err}");
}

#[test]
fn epsilon_must_be_positive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("eps.toml");
    fs::write(&path, "[engine]\nmachine-epsilon = -1.0\n").expect("write");
    assert!(matches!(EngineOptions::load(&path), Err(ConfigError::Epsilon(e)) if e == -1.0));
}

#[test]
fn missing_files_are_io_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = EngineOptions::load(&dir.path().join("absent.toml")).expect_err("missing");
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn written_options_load_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = EngineOptions {
        numerical_fallback: false,
        machine_epsilon: 1e-7,
        ..EngineOptions::default()
    };
    let path = dir.path().join(DEFAULT_CONFIG_FILE);
    fs::write(&path, options.to_toml().expect("serialize")).expect("write");
    assert_eq!(EngineOptions::load(&path).expect("load"), options);
}
