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

//! High-level pipeline: parse, type-check, build the custom derivative
//! registry and synthesize the requested derivative.
//!
//! Every program is preceded by the math prelude, so user code can call the
//! natives and their derivatives are always registered.

use crate::ast::{FnDecl, Program};
use crate::autodiff::{self, AutodiffError, DerivedFunction};
use crate::config::EngineOptions;
use crate::diagnostics::Diagnostic;
use crate::parser;
use crate::registry::{CustomDerivativeRegistry, RegistryError, PRELUDE};
use crate::request::{DifferentiationRequest, Mode};
use crate::type_checker;

/// Options controlling the pipeline.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Function to differentiate; without one the source is only checked.
    pub func: Option<String>,
    pub mode: Mode,
    /// Independent variable list such as `"x, arr[0:2]"`; `None` selects
    /// every differentiable parameter.
    pub wrt: Option<String>,
    pub order: u32,
    pub engine: EngineOptions,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            func: None,
            mode: Mode::Reverse,
            wrt: None,
            order: 1,
            engine: EngineOptions::default(),
        }
    }
}

/// Artifacts produced by [`compile_source`].
#[derive(Debug, Clone)]
pub struct CompileProducts {
    /// Prelude plus the user functions, type-checked.
    pub program: Program,
    /// The derivative when a function was selected.
    pub derived: Option<DerivedFunction>,
}

/// Errors surfaced by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("parse error")]
    ParseError(Vec<Diagnostic>),
    #[error("type error")]
    TypeError(Vec<Diagnostic>),
    #[error("invalid custom derivative: {0}")]
    Registry(#[from] RegistryError),
    #[error("differentiation failed: {0}")]
    Autodiff(#[from] AutodiffError),
}

impl CompileError {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileError::ParseError(diags) | CompileError::TypeError(diags) => diags,
            _ => &[],
        }
    }
}

/// Parses `source` after the prelude and type-checks the result.
pub fn load_program(source: &str) -> Result<Program, CompileError> {
    let prelude = parser::parse(PRELUDE).map_err(|errs| {
        CompileError::ParseError(
            errs.into_iter()
                .map(|e| Diagnostic::from_chumsky(PRELUDE, e))
                .collect(),
        )
    })?;
    let user = parser::parse_with_diagnostics(source).map_err(CompileError::ParseError)?;
    let program = prelude.merged(user);

    let errors = type_checker::check_program(&program);
    if !errors.is_empty() {
        let diags = errors
            .iter()
            .map(|e| e.to_diagnostic(source, &program))
            .collect();
        return Err(CompileError::TypeError(diags));
    }
    Ok(program)
}

/// Finds the function called `name` that has a body.
pub fn find_function<'p>(program: &'p Program, name: &str) -> Result<&'p FnDecl, AutodiffError> {
    program
        .functions
        .iter()
        .find(|f| f.name == name && f.body.is_some())
        .or_else(|| program.functions.iter().find(|f| f.name == name))
        .ok_or_else(|| AutodiffError::FunctionNotFound(name.to_string()))
}

/// Differentiates `func` in an already loaded program.
pub fn differentiate_in(
    program: &Program,
    registry: &CustomDerivativeRegistry,
    func: &str,
    opts: &CompileOptions,
) -> Result<DerivedFunction, AutodiffError> {
    let target = find_function(program, func)?;
    let request = DifferentiationRequest::new(program, target, opts.mode, opts.wrt.as_deref(), opts.order)?;
    let derived = autodiff::differentiate(program, registry, &opts.engine, &request)?;
    for warning in &derived.warnings {
        log::info!("{}: {warning}", derived.name());
    }
    Ok(derived)
}

/// Pipeline entry point.
pub fn compile_source(source: &str, opts: &CompileOptions) -> Result<CompileProducts, CompileError> {
    let program = load_program(source)?;
    let registry = CustomDerivativeRegistry::from_host(&program)?;
    log::debug!(
        "loaded {} functions, {} custom derivative entries",
        program.functions.len(),
        registry.len()
    );

    let derived = match &opts.func {
        Some(func) => Some(differentiate_in(&program, &registry, func, opts)?),
        None => None,
    };
    Ok(CompileProducts { program, derived })
}
