use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use adsynth::eval::{Arg, Callable};
use adsynth::pipeline::{differentiate_in, load_program, CompileOptions};
use adsynth::{CustomDerivativeRegistry, Mode};

/// Straight-line polynomial
const POLYNOMIAL: &str = r#"
fn poly(x: f64, y: f64, z: f64) -> f64 {
    return x * x * y + y * y * z + z * z * x + x * y * z;
}
"#;

/// Loop that overwrites its accumulator every iteration
const LOOP: &str = r#"
fn iterate(x: f64, n: i64) -> f64 {
    let acc: f64 = x;
    for (let i: i64 = 0; i < n; i += 1) {
        acc = sin(acc) * x + 0.5 * acc;
    }
    return acc;
}
"#;

/// Nested callees with branches
const CALLEES: &str = r#"
fn soft(v: f64) -> f64 {
    if (v > 0.0) {
        return v + log(1.0 + exp(-v));
    }
    return log(1.0 + exp(v));
}

fn layer(a: [f64], w: f64) -> f64 {
    let s: f64 = 0.0;
    for (let i: i64 = 0; i < len(a); i += 1) {
        s += soft(a[i] * w);
    }
    return s;
}

fn net(a: [f64; 8], w: f64, b: f64) -> f64 {
    return tanh(layer(a, w) + b) * layer(a, b);
}
"#;

fn options(func: &str, mode: Mode, wrt: Option<&str>) -> CompileOptions {
    CompileOptions {
        func: Some(func.to_string()),
        mode,
        wrt: wrt.map(ToOwned::to_owned),
        ..CompileOptions::default()
    }
}

fn bench_synthesis(c: &mut Criterion) {
    let mut group = c.benchmark_group("synthesis");

    let cases = [
        ("poly_forward", POLYNOMIAL, "poly", Mode::Forward, Some("x")),
        ("poly_gradient", POLYNOMIAL, "poly", Mode::Reverse, None),
        ("poly_hessian", POLYNOMIAL, "poly", Mode::Hessian, None),
        ("loop_gradient", LOOP, "iterate", Mode::Reverse, None),
        ("net_gradient", CALLEES, "net", Mode::Reverse, None),
        ("net_error", CALLEES, "net", Mode::ErrorEstimate, None),
        ("net_hessian", CALLEES, "net", Mode::Hessian, Some("w, b")),
    ];
    for (name, source, func, mode, wrt) in cases {
        let program = load_program(source).expect("program loads");
        let registry = CustomDerivativeRegistry::from_host(&program).expect("registry");
        let opts = options(func, mode, wrt);
        group.bench_with_input(BenchmarkId::new("derive", name), &program, |b, program| {
            b.iter(|| differentiate_in(black_box(program), &registry, func, &opts).expect("derive"));
        });
    }

    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution");

    let program = load_program(LOOP).expect("program loads");
    let registry = CustomDerivativeRegistry::from_host(&program).expect("registry");
    let primal = Callable::for_function(&program, "iterate").expect("primal");
    let derived = differentiate_in(&program, &registry, "iterate", &options("iterate", Mode::Reverse, None))
        .expect("derive");
    let gradient = Callable::new(&program, &derived);

    for n in [10_i64, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("primal", n), &n, |b, &n| {
            b.iter(|| primal.execute(&mut [Arg::Scalar(0.7), Arg::Int(black_box(n))]).expect("run"));
        });
        group.bench_with_input(BenchmarkId::new("gradient", n), &n, |b, &n| {
            b.iter(|| {
                let mut args = [Arg::Scalar(0.7), Arg::Int(black_box(n)), Arg::Ref(0.0)];
                gradient.execute(&mut args).expect("run");
                args
            });
        });
    }

    let program = load_program(CALLEES).expect("program loads");
    let registry = CustomDerivativeRegistry::from_host(&program).expect("registry");
    let derived = differentiate_in(&program, &registry, "net", &options("net", Mode::Hessian, Some("w, b")))
        .expect("derive");
    let hessian = Callable::new(&program, &derived);
    let inputs: Vec<f64> = (0..8).map(|i| f64::from(i) * 0.25 - 1.0).collect();
    group.bench_function("net_hessian", |b| {
        b.iter(|| {
            let mut args = [
                Arg::Array(inputs.clone()),
                Arg::Scalar(0.3),
                Arg::Scalar(-0.2),
                Arg::zeros(4),
            ];
            hessian.execute(black_box(&mut args)).expect("run");
            args
        });
    });

    group.finish();
}

criterion_group!(benches, bench_synthesis, bench_execution);
criterion_main!(benches);
