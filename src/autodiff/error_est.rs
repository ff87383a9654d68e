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

//! Floating-point error estimation.
//!
//! The gradient is synthesized as usual with one extra `&f64` accumulator.
//! Every value the function assigns contributes `|adjoint * value * eps|`,
//! the first-order effect of one rounding on the result, and so does every
//! scalar independent variable on entry. Derived pullbacks take the same
//! accumulator as a trailing `&f64`, so a callee's assignments count exactly
//! as they would if its body were inlined.

use super::engine::Engine;
use super::reverse::build_gradient;
use super::AutodiffError;
use crate::ast::build::mul;
use crate::ast::{AssignOp, Expr, FnDecl, Place, Stmt};
use crate::request::DifferentiationRequest;

/// Target of the error terms emitted while building a gradient.
pub(super) struct ErrorSink {
    acc: String,
    epsilon: f64,
    returns: bool,
}

impl ErrorSink {
    pub fn new(acc: impl Into<String>, epsilon: f64) -> Self {
        Self {
            acc: acc.into(),
            epsilon,
            returns: true,
        }
    }

    /// Sink of a pullback. The returned value is counted by the caller.
    pub fn for_callee(acc: impl Into<String>, epsilon: f64) -> Self {
        Self {
            returns: false,
            ..Self::new(acc, epsilon)
        }
    }

    pub fn counts_returns(&self) -> bool {
        self.returns
    }

    /// The accumulator, passed on to derived pullbacks.
    pub fn accumulator(&self) -> Expr {
        Expr::var(&self.acc)
    }

    /// `acc += abs(adjoint * value * eps);`
    pub fn term(&self, adjoint: Expr, value: Expr) -> Stmt {
        let magnitude = mul(mul(adjoint, value), Expr::Float(self.epsilon));
        Stmt::assign(
            Place::Var(self.acc.clone()),
            AssignOp::Add,
            Expr::call("abs", vec![magnitude]),
        )
    }
}

/// `<f>_grad_err`: the gradient parameters plus `_final_error`.
pub(super) fn gradient_with_error(
    engine: &mut Engine<'_>,
    request: &DifferentiationRequest<'_>,
) -> Result<FnDecl, AutodiffError> {
    let epsilon = engine.options().machine_epsilon;
    engine.track_errors(epsilon);
    build_gradient(engine, request, Some(epsilon))
}

#[cfg(test)]
mod tests {
    use crate::ast::Program;
    use crate::autodiff::differentiate;
    use crate::config::EngineOptions;
    use crate::eval::{Arg, Callable};
    use crate::parser;
    use crate::registry::{CustomDerivativeRegistry, PRELUDE};
    use crate::request::{DifferentiationRequest, Mode};
    use approx::assert_relative_eq;

    fn program(src: &str) -> Program {
        parser::parse(PRELUDE).expect("prelude").merged(parser::parse(src).expect("parse"))
    }

    fn error_of(p: &Program, name: &str, x: f64) -> f64 {
        let registry = CustomDerivativeRegistry::from_host(p).expect("registry");
        let target = p.functions.iter().find(|f| f.name == name).expect("target");
        let request = DifferentiationRequest::new(p, target, Mode::ErrorEstimate, None, 1).expect("request");
        let derived = differentiate(p, &registry, &EngineOptions::default(), &request).expect("derive");
        let mut args = [Arg::Scalar(x), Arg::Ref(0.0), Arg::Ref(0.0)];
        Callable::new(p, &derived).execute(&mut args).expect("run");
        args[2].as_ref_value().expect("error")
    }

    #[test]
    fn callees_count_like_inlined_code() {
        let p = program(
            "fn cube(v: f64) -> f64 { let w: f64 = v * v; w = w * v; return w; }\n\
             fn called(x: f64) -> f64 { return cube(x); }\n\
             fn inlined(x: f64) -> f64 { let w: f64 = x * x; w = w * x; return w; }",
        );
        let x = 1.3_f64;
        let via_call = error_of(&p, "called", x);
        let in_place = error_of(&p, "inlined", x);
        assert_relative_eq!(via_call, in_place, max_relative = 1e-12);
        // Return, both assignments of w, and x weighted by its gradient.
        assert_relative_eq!(via_call, 6.0 * x.powi(3) * f64::EPSILON, max_relative = 1e-12);
    }

    #[test]
    fn accumulates_rounding_bounds() {
        let p = program(
            "fn f(x: f64, y: f64) -> f64 {\n\
                 let z: f64 = x * y;\n\
                 z = z + x;\n\
                 return z;\n\
             }",
        );
        let registry = CustomDerivativeRegistry::from_host(&p).expect("registry");
        let target = p.functions.iter().find(|f| f.name == "f").expect("target");
        let request = DifferentiationRequest::new(&p, target, Mode::ErrorEstimate, None, 1).expect("request");
        let options = EngineOptions::default();
        let derived = differentiate(&p, &registry, &options, &request).expect("derive");
        assert_eq!(derived.name(), "f_grad_err");
        let last = derived.decl.params.last().expect("param");
        assert_eq!(last.name, "_final_error");

        let (x, y) = (2.0_f64, 3.0_f64);
        let mut args = [Arg::Scalar(x), Arg::Scalar(y), Arg::Ref(0.0), Arg::Ref(0.0), Arg::Ref(0.0)];
        Callable::new(&p, &derived).execute(&mut args).expect("run");
        assert_eq!(args[2], Arg::Ref(y + 1.0));
        assert_eq!(args[3], Arg::Ref(x));

        // Result 8, both assignments of z (6 then 8) with adjoint 1, inputs
        // weighted by their gradients.
        let eps = options.machine_epsilon;
        let expected = (8.0 + 8.0 + 6.0 + (y + 1.0) * x + x * y) * eps;
        assert_relative_eq!(args[4].as_ref_value().expect("ref"), expected, max_relative = 1e-12);
    }
}
