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

//! adsynth command-line driver: differentiate a function of a source file,
//! print the derived source and optionally run it.

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use adsynth::ast::Type;
use adsynth::config::EngineOptions;
use adsynth::conformance::{run_conformance, ConformanceOptions, ConformanceProfile};
use adsynth::diagnostics::render;
use adsynth::eval::{Arg, Callable};
use adsynth::host::Host;
use adsynth::lexer::{parse_arg_list, ArgLiteral};
use adsynth::pipeline::{compile_source, find_function, CompileError, CompileOptions};
use adsynth::request::{output_arrays, DifferentiationRequest, Mode};

#[derive(Parser, Debug)]
#[command(author, version, about = None, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    compile: CompileArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the end-to-end conformance scenarios.
    Conformance {
        /// Which profile to execute (scenarios|full).
        #[arg(long, default_value = "full")]
        profile: String,
    },
}

#[derive(Parser, Debug, Default)]
struct CompileArgs {
    /// Input source file.
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,
    /// Function to differentiate.
    #[arg(long, value_name = "NAME")]
    func: Option<String>,
    /// forward|reverse|hessian|jacobian|error
    #[arg(long, default_value = "reverse")]
    mode: String,
    /// Independent variables, e.g. `x, arr[0:2]`.
    #[arg(long, value_name = "SPEC")]
    wrt: Option<String>,
    /// Derivative order (forward mode only).
    #[arg(long, default_value_t = 1)]
    order: u32,
    /// Print the derived functions.
    #[arg(long, action = ArgAction::SetTrue)]
    emit_derived: bool,
    /// Run the derived function on these arguments; output buffers are
    /// allocated automatically.
    #[arg(long, value_name = "LIST", allow_hyphen_values = true)]
    args: Option<String>,
    /// Engine configuration file (defaults to ./adsynth.toml when present).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Fail instead of approximating calls without a derivative.
    #[arg(long, action = ArgAction::SetTrue)]
    no_numerical_fallback: bool,
    /// Log error estimates of every numerical derivative.
    #[arg(long, action = ArgAction::SetTrue)]
    print_num_diff_errors: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Some(Command::Conformance { profile }) = &cli.command {
        conformance(profile);
        return;
    }

    if let Err(err) = run(&cli.compile) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn conformance(profile: &str) {
    let profile = match profile.to_ascii_lowercase().as_str() {
        "scenarios" => ConformanceProfile::Scenarios,
        "full" => ConformanceProfile::Full,
        other => {
            eprintln!("error[conformance]: unknown profile '{other}' (expected scenarios|full)");
            process::exit(1);
        }
    };

    match run_conformance(ConformanceOptions { profile }) {
        Ok(()) => println!("conformance passed for profile: {profile:?}"),
        Err(err) => {
            eprintln!("conformance failures detected:");
            for failure in &err.0 {
                eprintln!("- {failure}");
            }
            process::exit(1);
        }
    }
}

fn engine_options(args: &CompileArgs) -> Result<EngineOptions> {
    let mut options = match &args.config {
        Some(path) => EngineOptions::load(path)?,
        None => EngineOptions::discover(&std::env::current_dir()?)?,
    };
    if args.no_numerical_fallback {
        options.numerical_fallback = false;
    }
    if args.print_num_diff_errors {
        options.print_numerical_errors = true;
    }
    Ok(options)
}

fn run(args: &CompileArgs) -> Result<()> {
    let input = args
        .input
        .as_ref()
        .ok_or_else(|| anyhow!("expected an input file or subcommand"))?;
    let source = fs::read_to_string(input).with_context(|| format!("failed to read {}", input.display()))?;
    let mode: Mode = args.mode.parse().map_err(|msg: String| anyhow!(msg))?;
    let opts = CompileOptions {
        func: args.func.clone(),
        mode,
        wrt: args.wrt.clone(),
        order: args.order,
        engine: engine_options(args)?,
    };

    let products = match compile_source(&source, &opts) {
        Ok(products) => products,
        Err(err @ (CompileError::ParseError(_) | CompileError::TypeError(_))) => {
            for diag in err.diagnostics() {
                eprintln!("{}", render(&source, diag));
            }
            bail!("{} failed with {} diagnostic(s)", input.display(), err.diagnostics().len());
        }
        Err(err) => return Err(err.into()),
    };

    let Some(derived) = &products.derived else {
        println!("{}: ok ({} functions)", input.display(), products.program.functions.len());
        return Ok(());
    };
    for warning in &derived.warnings {
        eprintln!("warning: {warning}");
    }
    if args.emit_derived || args.args.is_none() {
        print!("{}", derived.dump());
    }

    let Some(list) = &args.args else {
        return Ok(());
    };
    let literals = parse_arg_list(list).map_err(|msg| anyhow!("invalid --args: {msg}"))?;
    let func = opts.func.as_deref().unwrap_or_default();
    let target = find_function(&products.program, func)?;
    let request = DifferentiationRequest::new(&products.program, target, mode, opts.wrt.as_deref(), opts.order)?;
    let mut call_args = bind_args(&products.program, &request, &literals)?;

    let callable = Callable::new(&products.program, derived);
    let result = callable.execute(&mut call_args)?;
    if let Some(value) = result {
        println!("result = {value}");
    }
    for (param, arg) in derived.decl.params.iter().zip(&call_args) {
        if matches!(param.ty, Type::Ref(_) | Type::Array { .. }) {
            println!("{} = {arg}", param.name);
        }
    }
    Ok(())
}

/// Converts the literals to arguments of the original parameters and
/// appends zeroed output buffers sized for the mode.
fn bind_args(host: &dyn Host, request: &DifferentiationRequest<'_>, literals: &[ArgLiteral]) -> Result<Vec<Arg>> {
    let target = request.target;
    if literals.len() != target.params.len() {
        bail!(
            "`{}` takes {} arguments, got {}",
            target.name,
            target.params.len(),
            literals.len()
        );
    }
    let mut args = Vec::with_capacity(target.params.len() * 2);
    for (param, literal) in target.params.iter().zip(literals) {
        let arg = match (&param.ty, literal) {
            (Type::I64, ArgLiteral::Int(v)) => Arg::Int(*v),
            (Type::Bool, ArgLiteral::Bool(v)) => Arg::Bool(*v),
            (Type::F64, lit) => Arg::Scalar(scalar(&param.name, lit)?),
            (Type::Ref(_), lit) => Arg::Ref(scalar(&param.name, lit)?),
            (Type::Array { .. }, ArgLiteral::Array(v)) => Arg::Array(v.clone()),
            (ty, lit) => bail!("argument `{}` of type {ty} cannot take {lit:?}", param.name),
        };
        args.push(arg);
    }

    let len_of = |i: usize| args[i].as_array().map(<[f64]>::len).unwrap_or(0);
    let mut outputs = Vec::new();
    match request.mode {
        Mode::Forward => {}
        Mode::Reverse | Mode::ErrorEstimate => {
            for var in &request.independents {
                outputs.push(match (&target.params[var.param].ty, var.scalar_count()) {
                    (Type::Array { .. }, Some(count)) => Arg::zeros(count),
                    (Type::Array { .. }, None) => Arg::zeros(len_of(var.param)),
                    _ => Arg::Ref(0.0),
                });
            }
            if request.mode == Mode::ErrorEstimate {
                outputs.push(Arg::Ref(0.0));
            }
        }
        Mode::Hessian => {
            let n = request.scalar_count().unwrap_or(0);
            outputs.push(Arg::zeros(n * n));
        }
        Mode::Jacobian => {
            let m = request.scalar_count().unwrap_or(0);
            for o in output_arrays(host, target) {
                if request.independents.iter().all(|v| v.param != o) {
                    outputs.push(Arg::zeros(len_of(o) * m));
                }
            }
        }
    }
    args.extend(outputs);
    Ok(args)
}

fn scalar(name: &str, literal: &ArgLiteral) -> Result<f64> {
    literal
        .as_f64()
        .ok_or_else(|| anyhow!("argument `{name}` expects a number, got {literal:?}"))
}
