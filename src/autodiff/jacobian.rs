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

//! Jacobians of functions that write their results into array parameters.
//!
//! One reverse sweep computes every row at once: each adjoint carries one
//! lane per output element, lane `k` seeded with the unit vector of output
//! scalar `k`. Afterwards lane `k` of the adjoint of an independent scalar is
//! the entry in row `k` of its column.

use super::engine::Engine;
use super::reverse::{counted_loop, len_of, prepare, Adjoints, Lanes};
use super::{unsupported, AutodiffError};
use crate::ast::build::{iadd, imul, one};
use crate::ast::{AssignOp, Expr, FnDecl, Param, Place, Stmt, Type};
use crate::request::{output_arrays, DifferentiationRequest};

/// `<f>_jac(params..., <out>_jac: [f64]...)`: one row-major
/// `len(out) x M` matrix per output array, `M` the number of independent
/// scalars.
pub(super) fn jacobian(engine: &mut Engine<'_>, request: &DifferentiationRequest<'_>) -> Result<FnDecl, AutodiffError> {
    let target = request.target;
    let width = request
        .scalar_count()
        .ok_or_else(|| unsupported(&target.name, "every array independent needs an element range"))?;
    let outputs: Vec<usize> = output_arrays(&*engine, target)
        .into_iter()
        .filter(|o| request.independents.iter().all(|v| v.param != *o))
        .collect();
    if outputs.is_empty() {
        return Err(unsupported(&target.name, "no array parameter is written"));
    }
    if target.body.is_none() {
        return Err(unsupported(&target.name, "function has no body"));
    }
    let source = prepare(target)?;
    let name = engine.function_name(&format!("{}_jac", target.name));

    let mut synth = Adjoints::new(engine, &source);
    synth.seed = None;
    let lanes = synth.names.fresh("_lanes");
    let lane = synth.names.fresh("_k");
    synth.lanes = Some(Lanes {
        count: lanes.clone(),
        index: lane,
    });

    let output_names: Vec<&str> = outputs.iter().map(|&o| target.params[o].name.as_str()).collect();
    let total = output_names
        .iter()
        .map(|o| len_of(o))
        .reduce(iadd)
        .unwrap_or(Expr::Int(0));
    let mut body = vec![Stmt::let_(&lanes, Type::I64, Some(total))];

    for p in &target.params {
        if !p.ty.is_differentiable() {
            continue;
        }
        let d = synth.names.fresh(&format!("_d_{}", p.name));
        let len = p.ty.is_array().then(|| len_of(&p.name));
        body.push(synth.adjoint_decl(&d, len));
        synth.bind(&p.name, &d);
    }

    let mut params = target.params.clone();
    let mut matrices = Vec::with_capacity(outputs.len());
    for o in &output_names {
        let m = synth.names.fresh(&format!("{o}_jac"));
        params.push(Param::new(&m, Type::array(Type::F64)));
        matrices.push(m);
    }

    let src = source.body.as_deref().unwrap_or_default();
    let (primal, reverse) = synth.run(src)?;

    let lanes_expr = || Expr::var(&lanes);
    let mut seeds = Vec::new();
    let mut writes = Vec::new();
    let mut offset = Expr::Int(0);
    for (o, matrix) in output_names.iter().zip(&matrices) {
        let d_out = synth.adjoints.get(*o).cloned().ok_or_else(|| {
            unsupported(&target.name, format!("output `{o}` is not differentiable"))
        })?;

        // _d_o[i * lanes + offset + i] = 1.0
        let i = synth.names.numbered("_i");
        let lane = iadd(offset.clone(), Expr::var(&i));
        let slot = iadd(imul(Expr::var(&i), lanes_expr()), lane);
        seeds.push(counted_loop(
            &i,
            len_of(o),
            vec![Stmt::assign(Place::Index(d_out, Box::new(slot)), AssignOp::Set, one())],
        ));

        // matrix[r * width + c] = adjoint of scalar c in lane offset + r
        let r = synth.names.numbered("_r");
        let lane = iadd(offset.clone(), Expr::var(&r));
        let mut row = Vec::with_capacity(width);
        let mut column = 0;
        for var in &request.independents {
            let p = &target.params[var.param];
            let d = synth
                .adjoints
                .get(&p.name)
                .cloned()
                .ok_or_else(|| unsupported(&target.name, format!("`{}` has no adjoint", p.name)))?;
            let elements: Vec<Option<usize>> = match var.range {
                Some((lo, hi)) => (lo..=hi).map(Some).collect(),
                None => vec![None],
            };
            for element in elements {
                let at = match element {
                    None => lane.clone(),
                    Some(e) => iadd(imul(Expr::Int(e as i64), lanes_expr()), lane.clone()),
                };
                let entry = iadd(imul(Expr::var(&r), Expr::Int(width as i64)), Expr::Int(column as i64));
                row.push(Stmt::assign(
                    Place::Index(matrix.clone(), Box::new(entry)),
                    AssignOp::Set,
                    Expr::index(&d, at),
                ));
                column += 1;
            }
        }
        writes.push(counted_loop(&r, len_of(o), row));
        offset = iadd(offset, len_of(o));
    }

    body.append(&mut synth.hoisted);
    body.extend(primal);
    body.extend(seeds);
    body.extend(reverse);
    body.extend(writes);

    Ok(FnDecl {
        name,
        params,
        ret: Type::Void,
        body: Some(body),
        span: target.span,
    })
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

    fn jacobian(p: &Program, name: &str, wrt: Option<&str>) -> Callable {
        let registry = CustomDerivativeRegistry::from_host(p).expect("registry");
        let target = p.functions.iter().find(|f| f.name == name).expect("target");
        let request = DifferentiationRequest::new(p, target, Mode::Jacobian, wrt, 1).expect("request");
        let derived = differentiate(p, &registry, &EngineOptions::default(), &request).expect("derive");
        Callable::new(p, &derived)
    }

    #[test]
    fn rows_per_output_element() {
        let p = program(
            "fn f(i: f64, j: f64, res: [f64; 3]) {\n\
                 res[0] = i * i;\n\
                 res[1] = j * j;\n\
                 res[2] = i * j;\n\
             }",
        );
        let jac = jacobian(&p, "f", None);
        assert_eq!(jac.decl().name, "f_jac");
        let mut args = [Arg::Scalar(3.0), Arg::Scalar(5.0), Arg::zeros(3), Arg::zeros(6)];
        jac.execute(&mut args).expect("run");
        assert_eq!(args[3], Arg::Array(vec![6.0, 0.0, 0.0, 10.0, 5.0, 3.0]));
    }

    #[test]
    fn loops_calls_and_array_inputs() {
        let p = program(
            "fn f(x: [f64], s: f64, out: [f64]) {\n\
                 for (let k: i64 = 0; k < len(out); k += 1) {\n\
                     out[k] = sin(x[k]) * s;\n\
                     s = s * 2.0;\n\
                 }\n\
             }",
        );
        let jac = jacobian(&p, "f", Some("x[0:1], s"));
        let (x0, x1, s) = (0.2_f64, 0.7_f64, 1.5_f64);
        let mut args = [
            Arg::Array(vec![x0, x1]),
            Arg::Scalar(s),
            Arg::zeros(2),
            Arg::zeros(6),
        ];
        jac.execute(&mut args).expect("run");
        let m = args[3].as_array().expect("matrix");
        let expected = [x0.cos() * s, 0.0, x0.sin(), 0.0, x1.cos() * 2.0 * s, 2.0 * x1.sin()];
        for (got, want) in m.iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
    }
}
