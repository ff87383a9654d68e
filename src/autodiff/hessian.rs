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

//! Hessians, forward over reverse.
//!
//! The gradient restricted to the independent variables is pushed forward
//! once per independent scalar; column `c` of the `N x N` row-major matrix
//! is the tangent of the gradient outputs with scalar `c` seeded.

use super::engine::Engine;
use super::reverse::{gradient, len_of};
use super::{unsupported, AutodiffError};
use crate::ast::build::{one, zero};
use crate::ast::{AssignOp, Expr, FnDecl, Param, Place, Stmt, Type};
use crate::opt::NameGen;
use crate::registry::{tangent_type, DerivativeKind};
use crate::request::DifferentiationRequest;

/// One independent scalar: a parameter and, for arrays, the element.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scalar {
    param: usize,
    element: Option<usize>,
}

fn scalars(request: &DifferentiationRequest<'_>) -> Vec<Scalar> {
    let mut out = Vec::new();
    for var in &request.independents {
        match var.range {
            Some((lo, hi)) => out.extend((lo..=hi).map(|e| Scalar {
                param: var.param,
                element: Some(e),
            })),
            None => out.push(Scalar {
                param: var.param,
                element: None,
            }),
        }
    }
    out
}

/// `<f>_hessian(params..., hessian: [f64])`.
pub(super) fn hessian(engine: &mut Engine<'_>, request: &DifferentiationRequest<'_>) -> Result<FnDecl, AutodiffError> {
    let target = request.target;
    let n = request
        .scalar_count()
        .ok_or_else(|| unsupported(&target.name, "every array independent needs an element range"))?;
    let grad_decl = gradient(engine, request)?;
    engine.add_support(grad_decl.clone());
    let pushforward = engine.derive(DerivativeKind::Pushforward, &grad_decl)?;
    let written = engine.written_params(target);

    let mut names = NameGen::for_function(target);
    let matrix = names.fresh("hessian");
    let columns = scalars(request);

    // Gradient output shapes in request order: `None` for scalars, the
    // element count for array ranges.
    let shapes: Vec<Option<usize>> = request.independents.iter().map(|v| v.scalar_count()).collect();

    // Scratch names, declared again in every column block.
    let copies: Vec<String> = target.params.iter().map(|p| names.fresh(&format!("_h_{}", p.name))).collect();
    let seeds: Vec<String> = target.params.iter().map(|p| names.fresh(&format!("_h_t_{}", p.name))).collect();
    let gradients: Vec<(String, String)> = (0..shapes.len())
        .map(|j| (names.fresh(&format!("_h_d{j}")), names.fresh(&format!("_h_dd{j}"))))
        .collect();
    let counter = names.fresh("_h_i");

    let mut body = Vec::with_capacity(columns.len());
    for (c, seeded) in columns.iter().enumerate() {
        let mut block = Vec::new();
        let mut primals = Vec::with_capacity(target.params.len());
        let mut tangents = Vec::new();
        for (i, p) in target.params.iter().enumerate() {
            // Each column reruns the function, so everything it writes is
            // copied first.
            let primal = match &p.ty {
                Type::Ref(inner) => {
                    let copy = &copies[i];
                    block.push(Stmt::let_(copy, (**inner).clone(), Some(Expr::var(&p.name))));
                    Expr::var(copy)
                }
                Type::Array { elem, .. } if written.contains(&i) => {
                    let copy = &copies[i];
                    block.push(Stmt::ArrayDecl {
                        name: copy.clone(),
                        elem: (**elem).clone(),
                        len: len_of(&p.name),
                    });
                    block.push(copy_loop(copy, &p.name, &counter));
                    Expr::var(copy)
                }
                _ => Expr::var(&p.name),
            };
            primals.push(primal);

            if tangent_type(&p.ty).is_none() {
                continue;
            }
            let here = seeded.param == i;
            match &p.ty {
                Type::F64 => tangents.push(if here { one() } else { zero() }),
                Type::Ref(_) => {
                    let t = &seeds[i];
                    block.push(Stmt::let_(t, Type::F64, Some(if here { one() } else { zero() })));
                    tangents.push(Expr::var(t));
                }
                _ => {
                    let t = seeds[i].clone();
                    block.push(Stmt::ArrayDecl {
                        name: t.clone(),
                        elem: Type::F64,
                        len: len_of(&p.name),
                    });
                    if let (true, Some(e)) = (here, seeded.element) {
                        block.push(Stmt::assign(
                            Place::Index(t.clone(), Box::new(Expr::Int(e as i64))),
                            AssignOp::Set,
                            one(),
                        ));
                    }
                    tangents.push(Expr::var(t));
                }
            }
        }

        let mut outputs = Vec::with_capacity(shapes.len());
        let mut output_tangents = Vec::with_capacity(shapes.len());
        for ((d, dd), shape) in gradients.iter().zip(&shapes) {
            for name in [d, dd] {
                block.push(match shape {
                    None => Stmt::let_(name.as_str(), Type::F64, Some(zero())),
                    Some(count) => Stmt::ArrayDecl {
                        name: name.clone(),
                        elem: Type::F64,
                        len: Expr::Int(*count as i64),
                    },
                });
            }
            outputs.push(Expr::var(d));
            output_tangents.push((dd.clone(), *shape));
        }

        let mut args = primals;
        args.extend(outputs);
        args.extend(tangents);
        args.extend(output_tangents.iter().map(|(dd, _)| Expr::var(dd)));
        block.push(Stmt::Expr(Expr::call(&pushforward, args)));

        let mut row = 0;
        for (dd, shape) in &output_tangents {
            let entries: Vec<Expr> = match shape {
                None => vec![Expr::var(dd)],
                Some(count) => (0..*count).map(|k| Expr::index(dd, Expr::Int(k as i64))).collect(),
            };
            for value in entries {
                block.push(Stmt::assign(
                    Place::Index(matrix.clone(), Box::new(Expr::Int((row * n + c) as i64))),
                    AssignOp::Set,
                    value,
                ));
                row += 1;
            }
        }
        body.push(Stmt::Block(block));
    }

    let mut params = target.params.clone();
    params.push(Param::new(&matrix, Type::array(Type::F64)));
    Ok(FnDecl {
        name: engine.function_name(&format!("{}_hessian", target.name)),
        params,
        ret: Type::Void,
        body: Some(body),
        span: target.span,
    })
}

fn copy_loop(dst: &str, src: &str, counter: &str) -> Stmt {
    let body = vec![Stmt::assign(
        Place::Index(dst.to_string(), Box::new(Expr::var(counter))),
        AssignOp::Set,
        Expr::index(src, Expr::var(counter)),
    )];
    super::reverse::counted_loop(counter, len_of(src), body)
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

    fn hessian(p: &Program, name: &str, wrt: Option<&str>) -> Callable {
        let registry = CustomDerivativeRegistry::from_host(p).expect("registry");
        let target = p.functions.iter().find(|f| f.name == name).expect("target");
        let request = DifferentiationRequest::new(p, target, Mode::Hessian, wrt, 1).expect("request");
        let derived = differentiate(p, &registry, &EngineOptions::default(), &request).expect("derive");
        Callable::new(p, &derived)
    }

    #[test]
    fn mixed_partials_of_a_polynomial() {
        let p = program("fn f(x: f64, y: f64) -> f64 { return x * x * y + y * y * y; }");
        let h = hessian(&p, "f", None);
        assert_eq!(h.decl().name, "f_hessian");
        let (x, y) = (2.0, 3.0);
        let mut args = [Arg::Scalar(x), Arg::Scalar(y), Arg::zeros(4)];
        h.execute(&mut args).expect("run");
        let m = args[2].as_array().expect("matrix");
        assert_relative_eq!(m[0], 2.0 * y);
        assert_relative_eq!(m[1], 2.0 * x);
        assert_relative_eq!(m[2], 2.0 * x);
        assert_relative_eq!(m[3], 6.0 * y);
    }

    #[test]
    fn scratch_names_avoid_parameters() {
        let p = program(
            "fn f(x: f64, _h_d0: f64, _h_i: [f64], _h_t_r: f64, r: &f64) -> f64 {\n\
                 r += x * _h_t_r;\n\
                 return x * x * _h_d0 + r * _h_i[0];\n\
             }",
        );
        let h = hessian(&p, "f", Some("x"));
        let mut args = [
            Arg::Scalar(1.5),
            Arg::Scalar(3.0),
            Arg::Array(vec![2.0]),
            Arg::Scalar(4.0),
            Arg::Ref(0.5),
            Arg::zeros(1),
        ];
        h.execute(&mut args).expect("run");
        assert_relative_eq!(args[5].as_array().expect("matrix")[0], 6.0);
        assert_eq!(args[4], Arg::Ref(0.5));
    }

    #[test]
    fn array_ranges_through_callees() {
        let p = program(
            "fn sq(v: f64) -> f64 { return v * v; }\n\
             fn g(a: [f64], s: f64) -> f64 { return sin(a[0]) * s + sq(a[1]) * a[0]; }",
        );
        let h = hessian(&p, "g", Some("a[0:1], s"));
        let (a0, a1, s) = (0.4_f64, 1.5_f64, 2.0_f64);
        let mut args = [Arg::Array(vec![a0, a1]), Arg::Scalar(s), Arg::zeros(9)];
        h.execute(&mut args).expect("run");
        let m = args[2].as_array().expect("matrix");
        let expected = [
            -a0.sin() * s, 2.0 * a1, a0.cos(),
            2.0 * a1, 2.0 * a0, 0.0,
            a0.cos(), 0.0, 0.0,
        ];
        for (got, want) in m.iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
    }
}
