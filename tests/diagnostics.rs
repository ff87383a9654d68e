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

use adsynth::diagnostics::{render, Severity};
use adsynth::{compile_source, CompileError, CompileOptions};

fn errors(source: &str) -> CompileError {
    compile_source(source, &CompileOptions::default()).expect_err("source is invalid")
}

#[test]
fn parse_errors_point_at_the_source() {
    let source = "fn f(x: f64) -> f64 {\n    return x * ;\n}\n";
    let err = errors(source);
    assert!(matches!(err, CompileError::ParseError(_)));
    let diag = &err.diagnostics()[0];
    assert_eq!(diag.phase, "parse");
    assert_eq!(diag.code, "E1001");
    assert_eq!(diag.severity, Severity::Error);
    assert_eq!(diag.start.line, 2);

    let rendered = render(source, diag);
    assert!(rendered.starts_with("error[E1001]"), "{rendered}");
    assert!(rendered.contains("--> line 2"), "{rendered}");
    assert!(rendered.contains("return x * ;"), "{rendered}");
    assert!(rendered.lines().last().is_some_and(|l| l.trim_start().starts_with('^')));
}

#[test]
fn type_errors_name_the_function() {
    let source = "fn ok(x: f64) -> f64 { return x; }\n\nfn bad(x: f64) -> f64 {\n    return y;\n}\n";
    let err = errors(source);
    let CompileError::TypeError(diags) = &err else {
        panic!("expected a type error, got {err:?}");
    };
    assert_eq!(diags.len(), 1);
    let diag = &diags[0];
    assert_eq!(diag.code, "E2001");
    assert!(diag.message.contains("`bad`"), "{}", diag.message);
    assert!(diag.message.contains("`y`"), "{}", diag.message);
    assert_eq!(diag.start.line, 3);
}

#[test]
fn every_type_error_is_reported() {
    let source = "fn a(x: f64) -> f64 { return u; }\n\
                  fn b(x: f64) -> f64 { return nope(x); }\n\
                  fn c(x: f64) -> f64 { return x; }\n\
                  fn c(y: f64) -> f64 { return y; }\n";
    let err = errors(source);
    assert_eq!(err.diagnostics().len(), 3, "{:?}", err.diagnostics());
}

#[test]
fn reserved_words_are_not_identifiers() {
    let err = errors("fn f(tape: f64) -> f64 { return tape; }");
    assert!(matches!(err, CompileError::ParseError(_)));
}

#[test]
fn synthesis_errors_carry_no_diagnostics() {
    let opts = CompileOptions {
        func: Some("missing".into()),
        ..CompileOptions::default()
    };
    let err = compile_source("fn f(x: f64) -> f64 { return x; }", &opts).expect_err("missing");
    assert!(err.diagnostics().is_empty());
    assert_eq!(err.to_string(), "differentiation failed: function `missing` not found");
}
