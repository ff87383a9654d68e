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

mod common;

use adsynth::request::{output_arrays, DifferentiationRequest, Mode, RequestError};
use adsynth::{AutodiffError, EngineOptions};
use common::{load, try_derive, try_derive_with};

const SRC: &str = "fn f(x: f64, n: i64, a: [f64; 4], out: [f64; 2]) -> f64 {\n\
                       out[0] = x * a[0];\n\
                       out[1] = x + a[1];\n\
                       return x * a[n];\n\
                   }";

fn request_error(mode: Mode, wrt: Option<&str>) -> RequestError {
    let p = load(SRC);
    match try_derive(&p, "f", mode, wrt) {
        Err(AutodiffError::Request(err)) => err,
        other => panic!("expected a request error, got {other:?}"),
    }
}

#[test]
fn unknown_parameter_is_named() {
    let err = request_error(Mode::Reverse, Some("x, z"));
    assert_eq!(
        err,
        RequestError::UnknownParameter {
            function: "f".into(),
            name: "z".into()
        }
    );
    assert_eq!(err.to_string(), "`f` has no parameter named `z`");
}

#[test]
fn positions_are_bounds_checked() {
    assert!(matches!(
        request_error(Mode::Reverse, Some("7")),
        RequestError::ParameterOutOfRange { index: 7, count: 4, .. }
    ));
}

#[test]
fn element_ranges_are_validated() {
    assert!(matches!(
        request_error(Mode::Reverse, Some("a[4]")),
        RequestError::ElementOutOfRange { index: 4, len: 4, .. }
    ));
    assert!(matches!(
        request_error(Mode::Reverse, Some("a[3:1]")),
        RequestError::InvalidRange { lo: 3, hi: 1, .. }
    ));
    assert!(matches!(
        request_error(Mode::Reverse, Some("x[0]")),
        RequestError::IndexOnScalar { .. }
    ));
}

#[test]
fn integer_parameters_are_not_differentiable() {
    let err = request_error(Mode::Reverse, Some("n"));
    assert!(matches!(err, RequestError::NotDifferentiable { ref param, .. } if param == "n"));
}

#[test]
fn overlapping_entries_are_rejected() {
    assert!(matches!(
        request_error(Mode::Reverse, Some("a[0:1], a[2]")),
        RequestError::Overlapping { .. }
    ));
    assert!(matches!(
        request_error(Mode::Jacobian, Some("x, out[0:1]")),
        RequestError::Overlapping { ref param } if param == "out"
    ));
}

#[test]
fn forward_mode_takes_one_scalar() {
    assert!(matches!(
        request_error(Mode::Forward, Some("x, a[0]")),
        RequestError::ForwardMultiple { count: 2 }
    ));
    assert!(matches!(
        request_error(Mode::Forward, Some("a[0:2]")),
        RequestError::ForwardMultiple { count: 3 }
    ));
    assert!(matches!(
        request_error(Mode::Forward, Some("a")),
        RequestError::MissingRange { mode: Mode::Forward, .. }
    ));
}

#[test]
fn orders_above_one_are_forward_only() {
    let p = load(SRC);
    let err = try_derive_with(&p, "f", Mode::Reverse, Some("x"), 2, EngineOptions::default())
        .expect_err("order 2 reverse");
    assert_eq!(
        err,
        AutodiffError::Request(RequestError::InvalidOrder {
            order: 2,
            mode: Mode::Reverse
        })
    );
    let err = try_derive_with(&p, "f", Mode::Forward, Some("x"), 0, EngineOptions::default())
        .expect_err("order 0");
    assert!(matches!(err, AutodiffError::Request(RequestError::InvalidOrder { order: 0, .. })));
}

#[test]
fn malformed_lists_are_reported() {
    assert!(matches!(
        request_error(Mode::Reverse, Some("x,,a")),
        RequestError::InvalidSpec { .. }
    ));
    assert!(matches!(
        request_error(Mode::Reverse, Some("a[1")),
        RequestError::InvalidSpec { .. }
    ));
}

#[test]
fn defaults_cover_every_differentiable_parameter() {
    let p = load(SRC);
    let target = p.functions.iter().find(|f| f.name == "f").expect("f");

    let reverse = DifferentiationRequest::new(&p, target, Mode::Reverse, None, 1).expect("reverse");
    let names: Vec<&str> = reverse.independents.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["x", "a", "out"]);
    assert!(reverse.independents.iter().all(|v| v.range.is_none()));

    let jacobian = DifferentiationRequest::new(&p, target, Mode::Jacobian, None, 1).expect("jacobian");
    let names: Vec<&str> = jacobian.independents.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["x", "a"]);
    assert_eq!(jacobian.independents[1].range, Some((0, 3)));
    assert_eq!(jacobian.scalar_count(), Some(5));
}

#[test]
fn functions_without_outputs_have_no_jacobian() {
    let p = load("fn g(x: f64) -> f64 { return x; }");
    let err = try_derive(&p, "g", Mode::Jacobian, None).expect_err("no outputs");
    assert!(matches!(err, AutodiffError::Request(RequestError::NoOutputs { .. })));
}

#[test]
fn outputs_filled_by_callees_are_found() {
    let p = load(
        "fn put(a: [f64], i: i64, v: f64) { a[i] = v; }\n\
         fn g(x: f64, w: [f64; 2], res: [f64; 2]) { put(res, 0, x * w[0]); put(res, 1, x); }",
    );
    let target = p.functions.iter().find(|f| f.name == "g").expect("g");
    assert_eq!(output_arrays(&p, target), [2]);
    let request = DifferentiationRequest::new(&p, target, Mode::Jacobian, None, 1).expect("jacobian");
    let names: Vec<&str> = request.independents.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["x", "w"]);

    let err = DifferentiationRequest::new(&p, target, Mode::Jacobian, Some("x, res[0]"), 1).expect_err("output");
    assert_eq!(err, RequestError::Overlapping { param: "res".to_string() });
}

#[test]
fn missing_functions_are_reported() {
    let p = load(SRC);
    let err = try_derive(&p, "nope", Mode::Reverse, None).expect_err("missing");
    assert_eq!(err, AutodiffError::FunctionNotFound("nope".into()));
}

#[test]
fn modes_parse_from_their_names() {
    for (text, mode) in [
        ("forward", Mode::Forward),
        ("reverse", Mode::Reverse),
        ("hessian", Mode::Hessian),
        ("jacobian", Mode::Jacobian),
        ("error", Mode::ErrorEstimate),
    ] {
        assert_eq!(text.parse::<Mode>(), Ok(mode));
        assert_eq!(mode.to_string(), text);
    }
    assert!("sideways".parse::<Mode>().is_err());
}
