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

//! Derivative synthesis by source transformation.
//!
//! [`differentiate`] takes a validated [`DifferentiationRequest`] and emits a
//! new function declaration in the host language that computes the requested
//! derivative: a forward-mode directional derivative, a reverse-mode gradient
//! with an explicit tape, a Hessian, a Jacobian or a gradient with a
//! floating-point error estimate. Callees are differentiated on demand and
//! returned as support functions next to the entry declaration.
//!
//! The engine keeps no state between requests. Every tape, slot and
//! accumulator lives as a local of the derived function.

mod engine;
mod error_est;
mod forward;
mod hessian;
mod jacobian;
mod reverse;
mod rules;

use std::fmt;

use crate::ast::{FnDecl, Program};
use crate::config::EngineOptions;
use crate::host::Host;
use crate::print::format_program;
use crate::registry::CustomDerivativeRegistry;
use crate::request::{DifferentiationRequest, Mode, RequestError};

pub use engine::{CallPlan, Engine};

/// A synthesized derivative: the entry function plus every function it needs
/// that is not part of the host program.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFunction {
    pub mode: Mode,
    pub decl: FnDecl,
    /// Derived callees in creation order.
    pub support: Vec<FnDecl>,
    pub warnings: Vec<Warning>,
}

impl DerivedFunction {
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// Source text of the support functions followed by the entry function.
    /// The text parses back into the same declarations.
    pub fn dump(&self) -> String {
        let mut functions = self.support.clone();
        functions.push(self.decl.clone());
        format_program(&Program::new(functions))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Warning {
    /// A call was differentiated with finite differences because no other
    /// derivative was available.
    NumericalFallback { function: String, callee: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::NumericalFallback { function, callee } => write!(
                f,
                "`{function}` calls `{callee}`, which has no derivative; using a numerical estimate"
            ),
        }
    }
}

/// Errors returned by the autodiff engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AutodiffError {
    #[error(transparent)]
    Request(#[from] RequestError),
    /// The function contains something no rule covers. Nothing is emitted.
    #[error("cannot differentiate `{function}`: {message}")]
    UnsupportedConstruct { function: String, message: String },
    /// Differentiating `callee` re-enters a cycle that has no base case.
    #[error("unbounded recursion while differentiating `{callee}` (via {})", chain.join(" -> "))]
    UnboundedRecursion { callee: String, chain: Vec<String> },
    /// Nested derivations went deeper than `max-derivation-depth`.
    #[error("derivation depth limit {limit} exceeded (via {})", chain.join(" -> "))]
    DepthLimit { limit: usize, chain: Vec<String> },
    #[error("function `{0}` not found")]
    FunctionNotFound(String),
}

pub(crate) fn unsupported(function: &str, message: impl Into<String>) -> AutodiffError {
    AutodiffError::UnsupportedConstruct {
        function: function.to_string(),
        message: message.into(),
    }
}

/// Synthesizes the derivative described by `request`.
pub fn differentiate(
    host: &dyn Host,
    registry: &CustomDerivativeRegistry,
    options: &EngineOptions,
    request: &DifferentiationRequest<'_>,
) -> Result<DerivedFunction, AutodiffError> {
    let mut engine = Engine::new(host, registry, *options);
    let decl = match request.mode {
        Mode::Forward => forward::directional(&mut engine, request)?,
        Mode::Reverse => reverse::gradient(&mut engine, request)?,
        Mode::ErrorEstimate => error_est::gradient_with_error(&mut engine, request)?,
        Mode::Hessian => hessian::hessian(&mut engine, request)?,
        Mode::Jacobian => jacobian::jacobian(&mut engine, request)?,
    };
    log::debug!(
        "derived {} ({} mode, {} support functions)",
        decl.name,
        request.mode,
        engine.support().len()
    );
    Ok(engine.finish(request.mode, decl))
}
