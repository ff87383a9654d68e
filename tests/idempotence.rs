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

use adsynth::eval::{Arg, Callable};
use adsynth::parser;
use adsynth::pipeline::load_program;
use adsynth::Mode;
use common::{load, try_derive};

const SRC: &str = r#"
fn sq(v: f64) -> f64 { return v * v; }

fn f(x: f64, a: [f64], n: i64) -> f64 {
    let s: f64 = 0.0;
    for (let i: i64 = 0; i < n; i += 1) {
        s += sq(a[i] - x);
        if (s > 4.0) {
            s = sqrt(s);
        }
    }
    return s * x;
}
"#;

const MODES: [(Mode, Option<&str>); 4] = [
    (Mode::Forward, Some("x")),
    (Mode::Reverse, None),
    (Mode::ErrorEstimate, None),
    (Mode::Hessian, Some("x, a[0:1]")),
];

#[test]
fn repeated_requests_produce_identical_output() {
    let p = load(SRC);
    for (mode, wrt) in MODES {
        let first = try_derive(&p, "f", mode, wrt).expect("first");
        let second = try_derive(&p, "f", mode, wrt).expect("second");
        assert_eq!(first, second, "{mode}");
        assert_eq!(first.dump(), second.dump());
    }
}

#[test]
fn earlier_requests_leave_no_trace() {
    let p = load(SRC);
    let fresh = try_derive(&p, "f", Mode::Reverse, None).expect("fresh");
    for (mode, wrt) in MODES {
        try_derive(&p, "f", mode, wrt).expect("other request");
    }
    try_derive(&p, "sq", Mode::Reverse, None).expect("callee request");
    let again = try_derive(&p, "f", Mode::Reverse, None).expect("again");
    assert_eq!(fresh, again);
}

#[test]
fn dumps_parse_back_to_the_same_functions() {
    let p = load(SRC);
    for (mode, wrt) in MODES {
        let derived = try_derive(&p, "f", mode, wrt).expect("derive");
        let text = derived.dump();
        let reparsed = parser::parse(&text).unwrap_or_else(|errs| panic!("{mode}: {errs:?}\n{text}"));
        let mut expected = derived.support.clone();
        expected.push(derived.decl.clone());
        assert_eq!(reparsed.functions.len(), expected.len());
        for (got, want) in reparsed.functions.iter().zip(&expected) {
            assert_eq!(got.signature(), want.signature());
            assert_eq!(got.body, want.body, "{mode}: {}", want.name);
        }
    }
}

#[test]
fn emitted_source_compiles_and_runs_standalone() {
    let p = load(SRC);
    let derived = try_derive(&p, "f", Mode::Reverse, None).expect("derive");
    let standalone = format!("{SRC}\n{}", derived.dump());
    let program = load_program(&standalone).expect("emitted source type-checks");

    let run = |callable: &Callable| {
        let mut args = [
            Arg::Scalar(0.5),
            Arg::Array(vec![1.0, 3.0, -2.0]),
            Arg::Int(3),
            Arg::Ref(0.0),
            Arg::zeros(3),
        ];
        callable.execute(&mut args).expect("run");
        args
    };
    let via_engine = run(&Callable::new(&p, &derived));
    let via_source = run(&Callable::for_function(&program, "f_grad").expect("f_grad"));
    assert_eq!(via_engine, via_source);
}

#[test]
fn synthesis_leaves_the_program_untouched() {
    let p = load(SRC);
    let before = p.clone();
    for (mode, wrt) in MODES {
        try_derive(&p, "f", mode, wrt).expect("derive");
    }
    assert_eq!(p, before);
}
