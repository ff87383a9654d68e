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
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn adsynthc(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_adsynthc"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run adsynthc")
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/conformance").join(name)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn gradient_runs_on_given_arguments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = fixture("scenario_b.ad");
    let output = adsynthc(
        dir.path(),
        &[input.to_str().expect("utf8"), "--func", "f", "--wrt", "x, y", "--args", "3, 4"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("_d_x = 6"), "{text}");
    assert!(text.contains("_d_y = 8"), "{text}");
}

#[test]
fn forward_mode_prints_the_result() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = fixture("scenario_a.ad");
    let output = adsynthc(
        dir.path(),
        &[input.to_str().expect("utf8"), "--func", "f", "--mode", "forward", "--wrt", "x", "--args", "5, 3"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("result = 30"), "{}", stdout(&output));
}

#[test]
fn jacobian_buffers_are_allocated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = fixture("scenario_d.ad");
    let output = adsynthc(
        dir.path(),
        &[
            input.to_str().expect("utf8"),
            "--func",
            "fn_jacobian",
            "--mode",
            "jacobian",
            "--args",
            "3, 5, [0, 0, 0]",
        ],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("res_jac = [6, 0, 0, 10, 5, 3]"), "{}", stdout(&output));
}

#[test]
fn derived_source_is_printed_without_arguments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = fixture("scenario_c.ad");
    let output = adsynthc(
        dir.path(),
        &[input.to_str().expect("utf8"), "--func", "kinetic_energy", "--mode", "hessian"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("fn kinetic_energy_grad("), "{text}");
    assert!(text.contains("fn kinetic_energy_hessian("), "{text}");
}

#[test]
fn check_only_without_a_function() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = fixture("scenario_b.ad");
    let output = adsynthc(dir.path(), &[input.to_str().expect("utf8")]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains(": ok ("), "{}", stdout(&output));
}

#[test]
fn parse_errors_are_rendered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("broken.ad");
    fs::write(&input, "fn f(x: f64) -> f64 {\n    return x +;\n}\n").expect("write");
    let output = adsynthc(dir.path(), &["broken.ad"]);
    assert!(!output.status.success());
    let text = stderr(&output);
    assert!(text.contains("error[E1001]"), "{text}");
    assert!(text.contains("broken.ad failed with"), "{text}");
}

#[test]
fn request_errors_fail_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = fixture("scenario_b.ad");
    let output = adsynthc(dir.path(), &[input.to_str().expect("utf8"), "--func", "f", "--wrt", "z"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("`f` has no parameter named `z`"), "{}", stderr(&output));

    let output = adsynthc(dir.path(), &[input.to_str().expect("utf8"), "--func", "f", "--mode", "sideways"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown mode `sideways`"), "{}", stderr(&output));
}

#[test]
fn config_file_in_the_working_directory_is_used() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("prog.ad"),
        "extern fn erf(x: f64) -> f64;\nfn f(x: f64) -> f64 { return erf(x) * x; }\n",
    )
    .expect("write source");

    let output = adsynthc(dir.path(), &["prog.ad", "--func", "f"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stderr(&output).contains("numerical estimate"), "{}", stderr(&output));

    fs::write(dir.path().join("adsynth.toml"), "[engine]\nnumerical-fallback = false\n").expect("write config");
    let output = adsynthc(dir.path(), &["prog.ad", "--func", "f"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("numerical fallback is disabled"), "{}", stderr(&output));
}

#[test]
fn conformance_subcommand_passes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = adsynthc(dir.path(), &["conformance", "--profile", "full"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("conformance passed"), "{}", stdout(&output));
}
