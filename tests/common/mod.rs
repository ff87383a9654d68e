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

#![allow(dead_code)]

use adsynth::ast::Program;
use adsynth::eval::Callable;
use adsynth::pipeline::{differentiate_in, load_program, CompileOptions};
use adsynth::{AutodiffError, CustomDerivativeRegistry, DerivedFunction, EngineOptions, Mode};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn load(src: &str) -> Program {
    init_logging();
    load_program(src).expect("program loads")
}

pub fn try_derive_with(
    program: &Program,
    func: &str,
    mode: Mode,
    wrt: Option<&str>,
    order: u32,
    engine: EngineOptions,
) -> Result<DerivedFunction, AutodiffError> {
    let registry = CustomDerivativeRegistry::from_host(program).expect("registry");
    let opts = CompileOptions {
        func: Some(func.to_string()),
        mode,
        wrt: wrt.map(ToOwned::to_owned),
        order,
        engine,
    };
    differentiate_in(program, &registry, func, &opts)
}

pub fn try_derive(program: &Program, func: &str, mode: Mode, wrt: Option<&str>) -> Result<DerivedFunction, AutodiffError> {
    try_derive_with(program, func, mode, wrt, 1, EngineOptions::default())
}

pub fn derive(program: &Program, func: &str, mode: Mode, wrt: Option<&str>) -> Callable {
    let derived = try_derive(program, func, mode, wrt).expect("derivation succeeds");
    Callable::new(program, &derived)
}

pub fn derive_order(program: &Program, func: &str, wrt: &str, order: u32) -> Callable {
    let derived = try_derive_with(program, func, Mode::Forward, Some(wrt), order, EngineOptions::default())
        .expect("derivation succeeds");
    Callable::new(program, &derived)
}

/// Evenly spaced sample points in `[lo, hi]`.
pub fn grid(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64).collect()
}
