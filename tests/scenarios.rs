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

use adsynth::conformance::{run_conformance, ConformanceOptions, ConformanceProfile};
use adsynth::eval::{Arg, Callable};
use adsynth::{compile_source, CompileOptions, CompileProducts, Mode};

fn compile(source: &str, func: &str, mode: Mode, wrt: Option<&str>) -> CompileProducts {
    let opts = CompileOptions {
        func: Some(func.to_string()),
        mode,
        wrt: wrt.map(ToOwned::to_owned),
        ..CompileOptions::default()
    };
    compile_source(source, &opts).expect("compile")
}

fn run(products: &CompileProducts, args: &mut [Arg]) -> Option<f64> {
    let derived = products.derived.as_ref().expect("derived");
    Callable::new(&products.program, derived)
        .execute(args)
        .expect("execute")
}

#[test]
fn directional_derivative_of_a_polynomial() {
    let products = compile(
        include_str!("conformance/scenario_a.ad"),
        "f",
        Mode::Forward,
        Some("x"),
    );
    assert_eq!(products.derived.as_ref().map(|d| d.name()), Some("f_darg0"));
    assert_eq!(run(&products, &mut [Arg::Scalar(5.0), Arg::Scalar(3.0)]), Some(30.0));
}

#[test]
fn gradient_of_a_sum_of_squares() {
    let products = compile(include_str!("conformance/scenario_b.ad"), "f", Mode::Reverse, Some("x, y"));
    let derived = products.derived.as_ref().expect("derived");
    assert_eq!(derived.name(), "f_grad");
    let params: Vec<&str> = derived.decl.params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(params, ["x", "y", "_d_x", "_d_y"]);

    let mut args = [Arg::Scalar(3.0), Arg::Scalar(4.0), Arg::Ref(0.0), Arg::Ref(0.0)];
    run(&products, &mut args);
    assert_eq!(args[2], Arg::Ref(6.0));
    assert_eq!(args[3], Arg::Ref(8.0));
}

#[test]
fn hessian_of_kinetic_energy() {
    let products = compile(
        include_str!("conformance/scenario_c.ad"),
        "kinetic_energy",
        Mode::Hessian,
        Some("mass, velocity"),
    );
    let mut args = [Arg::Scalar(10.0), Arg::Scalar(2.0), Arg::zeros(4)];
    run(&products, &mut args);
    assert_eq!(args[2], Arg::Array(vec![0.0, 2.0, 2.0, 10.0]));
}

#[test]
fn jacobian_of_a_vector_function() {
    let products = compile(include_str!("conformance/scenario_d.ad"), "fn_jacobian", Mode::Jacobian, None);
    let mut args = [Arg::Scalar(3.0), Arg::Scalar(5.0), Arg::zeros(3), Arg::zeros(6)];
    run(&products, &mut args);
    assert_eq!(args[3], Arg::Array(vec![6.0, 0.0, 0.0, 10.0, 5.0, 3.0]));
}

#[test]
fn error_estimate_of_a_sum_of_squares() {
    let products = compile(include_str!("conformance/scenario_b.ad"), "f", Mode::ErrorEstimate, None);
    let derived = products.derived.as_ref().expect("derived");
    assert_eq!(derived.name(), "f_grad_err");
    let mut args = [
        Arg::Scalar(3.0),
        Arg::Scalar(4.0),
        Arg::Ref(0.0),
        Arg::Ref(0.0),
        Arg::Ref(0.0),
    ];
    run(&products, &mut args);
    assert_eq!(args[2], Arg::Ref(6.0));
    assert_eq!(args[3], Arg::Ref(8.0));
    let error = args[4].as_ref_value().expect("error");
    assert!(error > 0.0 && error < 1e-12, "{error}");
}

#[test]
fn full_conformance_profile() {
    let result = run_conformance(ConformanceOptions {
        profile: ConformanceProfile::Full,
    });
    assert!(result.is_ok(), "{result:?}");
}
