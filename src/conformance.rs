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

//! End-to-end scenarios: fixture source in, derived function executed,
//! results compared.

use crate::eval::{Arg, Callable};
use crate::pipeline::{compile_source, CompileOptions};
use crate::request::Mode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConformanceProfile {
    /// The four reference scenarios.
    Scenarios,
    /// Scenarios plus recursion, loop and error-path cases.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConformanceOptions {
    pub profile: ConformanceProfile,
}

#[derive(Debug, thiserror::Error)]
#[error("conformance failures: {0:?}")]
pub struct ConformanceFailure(pub Vec<String>);

#[derive(Debug, Clone)]
struct ConformanceCase {
    name: &'static str,
    source: &'static str,
    func: &'static str,
    mode: Mode,
    wrt: Option<&'static str>,
    args: Vec<Arg>,
    expected: Expected,
}

#[derive(Debug, Clone, PartialEq)]
enum Expected {
    /// Return value of the derived function.
    Value(f64),
    /// Argument positions and their contents after the call.
    Outputs(Vec<(usize, Arg)>),
    /// Synthesis fails with a message containing the text.
    Error(&'static str),
}

const TOLERANCE: f64 = 1e-9;

pub fn run_conformance(opts: ConformanceOptions) -> Result<(), ConformanceFailure> {
    let mut failures = Vec::new();

    let mut cases = scenario_cases();
    if opts.profile == ConformanceProfile::Full {
        cases.extend(extended_cases());
    }
    for case in cases {
        let name = case.name;
        match run_case(case) {
            Ok(()) => log::debug!("conformance {name} ok"),
            Err(msg) => failures.push(format!("{name} => {msg}")),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ConformanceFailure(failures))
    }
}

fn run_case(mut case: ConformanceCase) -> Result<(), String> {
    let opts = CompileOptions {
        func: Some(case.func.to_string()),
        mode: case.mode,
        wrt: case.wrt.map(ToOwned::to_owned),
        ..CompileOptions::default()
    };

    let products = match compile_source(case.source, &opts) {
        Ok(products) => products,
        Err(err) => {
            return match case.expected {
                Expected::Error(expected) => {
                    let msg = err.to_string().to_lowercase();
                    if msg.contains(&expected.to_lowercase()) {
                        Ok(())
                    } else {
                        Err(format!("expected error containing '{expected}', got {msg}"))
                    }
                }
                _ => Err(format!("unexpected compile error: {err}")),
            };
        }
    };
    if let Expected::Error(expected) = case.expected {
        return Err(format!("expected failure containing '{expected}' but synthesis succeeded"));
    }

    let derived = products
        .derived
        .as_ref()
        .ok_or_else(|| "derived function missing".to_string())?;
    let callable = Callable::new(&products.program, derived);
    let result = callable
        .execute(&mut case.args)
        .map_err(|err| format!("execution failed: {err}\n{}", derived.dump()))?;

    match &case.expected {
        Expected::Value(expected) => match result {
            Some(got) if close(got, *expected) => Ok(()),
            got => Err(format!("expected {expected}, got {got:?}")),
        },
        Expected::Outputs(outputs) => {
            for (pos, expected) in outputs {
                let got = case
                    .args
                    .get(*pos)
                    .ok_or_else(|| format!("no argument at position {pos}"))?;
                if !args_close(got, expected) {
                    return Err(format!("argument {pos}: expected {expected}, got {got}"));
                }
            }
            Ok(())
        }
        Expected::Error(_) => Ok(()),
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= TOLERANCE * b.abs().max(1.0)
}

fn args_close(got: &Arg, expected: &Arg) -> bool {
    match (got, expected) {
        (Arg::Ref(a), Arg::Ref(b)) | (Arg::Scalar(a), Arg::Scalar(b)) => close(*a, *b),
        (Arg::Array(a), Arg::Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| close(*x, *y)),
        _ => got == expected,
    }
}

fn scenario_cases() -> Vec<ConformanceCase> {
    vec![
        ConformanceCase {
            name: "scenario_a_forward",
            source: include_str!("../tests/conformance/scenario_a.ad"),
            func: "f",
            mode: Mode::Forward,
            wrt: Some("x"),
            args: vec![Arg::Scalar(5.0), Arg::Scalar(3.0)],
            expected: Expected::Value(30.0),
        },
        ConformanceCase {
            name: "scenario_b_gradient",
            source: include_str!("../tests/conformance/scenario_b.ad"),
            func: "f",
            mode: Mode::Reverse,
            wrt: Some("x, y"),
            args: vec![Arg::Scalar(3.0), Arg::Scalar(4.0), Arg::Ref(0.0), Arg::Ref(0.0)],
            expected: Expected::Outputs(vec![(2, Arg::Ref(6.0)), (3, Arg::Ref(8.0))]),
        },
        ConformanceCase {
            name: "scenario_c_hessian",
            source: include_str!("../tests/conformance/scenario_c.ad"),
            func: "kinetic_energy",
            mode: Mode::Hessian,
            wrt: Some("mass, velocity"),
            args: vec![Arg::Scalar(10.0), Arg::Scalar(2.0), Arg::zeros(4)],
            expected: Expected::Outputs(vec![(2, Arg::Array(vec![0.0, 2.0, 2.0, 10.0]))]),
        },
        ConformanceCase {
            name: "scenario_d_jacobian",
            source: include_str!("../tests/conformance/scenario_d.ad"),
            func: "fn_jacobian",
            mode: Mode::Jacobian,
            wrt: None,
            args: vec![Arg::Scalar(3.0), Arg::Scalar(5.0), Arg::zeros(3), Arg::zeros(6)],
            expected: Expected::Outputs(vec![(3, Arg::Array(vec![6.0, 0.0, 0.0, 10.0, 5.0, 3.0]))]),
        },
    ]
}

fn extended_cases() -> Vec<ConformanceCase> {
    // Reference derivative of the fixture loop, by forward accumulation.
    let (x, n) = (0.8_f64, 3);
    let (mut acc, mut d_acc) = (x, 1.0);
    for _ in 0..n {
        d_acc = acc.cos() * d_acc * x + acc.sin();
        acc = acc.sin() * x;
    }

    vec![
        ConformanceCase {
            name: "recursion_with_base_case",
            source: include_str!("../tests/conformance/recursion_base_case.ad"),
            func: "power",
            mode: Mode::Reverse,
            wrt: Some("x"),
            args: vec![Arg::Scalar(1.5), Arg::Int(4), Arg::Ref(0.0)],
            expected: Expected::Outputs(vec![(2, Arg::Ref(4.0 * 1.5_f64.powi(3)))]),
        },
        ConformanceCase {
            name: "loop_overwrite_gradient",
            source: include_str!("../tests/conformance/loop_overwrite.ad"),
            func: "f",
            mode: Mode::Reverse,
            wrt: Some("x"),
            args: vec![Arg::Scalar(x), Arg::Int(n), Arg::Ref(0.0)],
            expected: Expected::Outputs(vec![(2, Arg::Ref(d_acc))]),
        },
        ConformanceCase {
            name: "loop_overwrite_forward",
            source: include_str!("../tests/conformance/loop_overwrite.ad"),
            func: "f",
            mode: Mode::Forward,
            wrt: Some("x"),
            args: vec![Arg::Scalar(x), Arg::Int(n)],
            expected: Expected::Value(d_acc),
        },
        ConformanceCase {
            name: "unbounded_recursion",
            source: include_str!("../tests/conformance/unbounded_recursion.ad"),
            func: "f",
            mode: Mode::Reverse,
            wrt: None,
            args: Vec::new(),
            expected: Expected::Error("unbounded recursion"),
        },
        ConformanceCase {
            name: "unknown_independent",
            source: include_str!("../tests/conformance/scenario_b.ad"),
            func: "f",
            mode: Mode::Reverse,
            wrt: Some("z"),
            args: Vec::new(),
            expected: Expected::Error("`z`"),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_scenarios_pass() {
        let result = run_conformance(ConformanceOptions {
            profile: ConformanceProfile::Scenarios,
        });
        assert!(result.is_ok(), "{result:?}");
    }
}
