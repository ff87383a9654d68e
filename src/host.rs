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

//! Read-only view of the program being differentiated.
//!
//! The engine never owns the host program. It asks the host for
//! declarations, overload resolution and type questions through this trait,
//! so any front end that can produce [`FnDecl`] values can drive it.

use std::collections::HashSet;

use crate::ast::{Expr, FnDecl, Program, Signature, Type};
use crate::opt::analysis;
use crate::types::{accept_cost, arg_type, collect_env, Intrinsic};

pub trait Host {
    /// Every declaration, in source order.
    fn functions(&self) -> &[FnDecl];

    fn overloads<'a>(&'a self, name: &str) -> Vec<&'a FnDecl> {
        self.functions().iter().filter(|f| f.name == name).collect()
    }

    /// Cheapest overload of `name` accepting `args`; ties go to the first
    /// declaration.
    fn resolve(&self, name: &str, args: &[Type]) -> Option<&FnDecl> {
        let mut best: Option<(u32, &FnDecl)> = None;
        for decl in self.overloads(name) {
            if decl.params.len() != args.len() {
                continue;
            }
            let cost = decl
                .params
                .iter()
                .zip(args)
                .map(|(p, a)| accept_cost(&p.ty, a))
                .sum::<Option<u32>>();
            if let Some(cost) = cost {
                if best.map_or(true, |(c, _)| cost < c) {
                    best = Some((cost, decl));
                }
            }
        }
        best.map(|(_, decl)| decl)
    }

    fn is_differentiable(&self, ty: &Type) -> bool {
        ty.is_differentiable()
    }

    /// Positions of reference and array parameters `decl` may write, directly
    /// or through its own calls. Functions without a body are assumed to
    /// write their references only.
    fn written_params(&self, decl: &FnDecl) -> HashSet<usize> {
        written_params_in(self, decl, &mut HashSet::new())
    }
}

fn written_params_in<H: Host + ?Sized>(host: &H, decl: &FnDecl, visiting: &mut HashSet<Signature>) -> HashSet<usize> {
    let by_ref = |ty: &Type| matches!(ty, Type::Ref(_) | Type::Array { .. });
    let Some(body) = &decl.body else {
        return decl
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p.ty, Type::Ref(_)))
            .map(|(i, _)| i)
            .collect();
    };
    if !visiting.insert(decl.signature()) {
        return HashSet::new();
    }

    let direct = analysis::params_written(decl);
    let mut out: HashSet<usize> = decl
        .params
        .iter()
        .enumerate()
        .filter(|(_, p)| by_ref(&p.ty) && direct.contains(&p.name))
        .map(|(i, _)| i)
        .collect();

    let env = collect_env(decl);
    let return_type = |n: &str, a: &[Type]| host.resolve(n, a).map(|d| d.ret.clone());
    let mut calls = Vec::new();
    for stmt in body {
        stmt.walk_exprs(&mut |e| {
            if let Expr::Call(name, args) = e {
                if Intrinsic::from_name(name).is_none() {
                    calls.push((name, args));
                }
            }
        });
    }
    for (name, args) in calls {
        let Some(types) = args
            .iter()
            .map(|a| arg_type(a, &env, &return_type))
            .collect::<Option<Vec<_>>>()
        else {
            continue;
        };
        let Some(callee) = host.resolve(name, &types) else {
            continue;
        };
        for i in written_params_in(host, callee, visiting) {
            let passed = match args.get(i) {
                Some(Expr::Var(v)) | Some(Expr::Index(v, _)) => v,
                _ => continue,
            };
            if let Some((pi, p)) = decl.param(passed) {
                if by_ref(&p.ty) {
                    out.insert(pi);
                }
            }
        }
    }
    out
}

impl Host for Program {
    fn functions(&self) -> &[FnDecl] {
        &self.functions
    }
}

impl Host for [FnDecl] {
    fn functions(&self) -> &[FnDecl] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    #[test]
    fn resolves_cheapest_overload() {
        let program = parser::parse(
            "extern fn h(x: f64) -> f64;\nextern fn h(x: i64) -> f64;\nextern fn h(x: f64, y: f64) -> f64;",
        )
        .expect("parse");
        let by_int = program.resolve("h", &[Type::I64]).expect("int overload");
        assert_eq!(by_int.params[0].ty, Type::I64);
        let by_float = program.resolve("h", &[Type::F64]).expect("float overload");
        assert_eq!(by_float.params[0].ty, Type::F64);
        assert_eq!(
            program.resolve("h", &[Type::F64, Type::I64]).map(|d| d.params.len()),
            Some(2)
        );
        assert!(program.resolve("h", &[Type::Bool]).is_none());
    }

    #[test]
    fn writes_are_followed_through_helpers() {
        let program = parser::parse(
            "fn put(a: [f64], i: i64, v: f64) { a[i] = v; }\n\
             fn fill(out: [f64], x: f64, seen: [f64]) { put(out, 0, x); let s: f64 = seen[0]; }\n\
             fn twice(r: &f64, out: [f64]) { fill(out, r, out); }",
        )
        .expect("parse");
        assert_eq!(program.written_params(&program.functions[1]), HashSet::from([0]));
        assert_eq!(program.written_params(&program.functions[2]), HashSet::from([1]));
    }
}
