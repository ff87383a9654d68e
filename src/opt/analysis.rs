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

use std::collections::HashSet;

use crate::ast::{AssignOp, Expr, FnDecl, Place, Stmt};

/// Parameters assigned directly in the body.
pub fn params_written(decl: &FnDecl) -> HashSet<String> {
    let params: HashSet<&str> = decl.params.iter().map(|p| p.name.as_str()).collect();
    let mut written = HashSet::new();
    for stmt in decl.body.iter().flatten() {
        stmt.walk(&mut |s| {
            if let Stmt::Assign { place, .. } = s {
                if params.contains(place.name()) {
                    written.insert(place.name().to_string());
                }
            }
        });
    }
    written
}

/// Every variable whose value is read somewhere in `body`. The target of a
/// plain `=` is not a read; compound assignments read their target.
pub fn reads(body: &[Stmt]) -> HashSet<String> {
    let mut out = HashSet::new();
    for stmt in body {
        stmt.walk(&mut |s| {
            if let Stmt::Assign {
                place,
                op: AssignOp::Add | AssignOp::Sub | AssignOp::Mul | AssignOp::Div,
                ..
            } = s
            {
                out.insert(place.name().to_string());
            }
        });
        stmt.walk_exprs(&mut |e| match e {
            Expr::Var(name) | Expr::Index(name, _) => {
                out.insert(name.clone());
            }
            _ => {}
        });
    }
    out
}

pub fn contains_return(body: &[Stmt]) -> bool {
    let mut found = false;
    for stmt in body {
        stmt.walk(&mut |s| found |= matches!(s, Stmt::Return(_)));
    }
    found
}

pub fn expr_calls(expr: &Expr, pred: &dyn Fn(&str) -> bool) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Call(name, _) | Expr::FnRef(name) = e {
            found |= pred(name);
        }
    });
    found
}

fn stmt_calls(stmt: &Stmt, pred: &dyn Fn(&str) -> bool) -> bool {
    let mut found = false;
    stmt.walk_exprs(&mut |e| {
        if let Expr::Call(name, _) | Expr::FnRef(name) = e {
            found |= pred(name);
        }
    });
    found
}

/// Names of all functions called from `body`.
pub fn callees(body: &[Stmt]) -> HashSet<String> {
    let mut out = HashSet::new();
    for stmt in body {
        stmt.walk_exprs(&mut |e| {
            if let Expr::Call(name, _) = e {
                out.insert(name.clone());
            }
        });
    }
    out
}

/// True when some path through `body` reaches the function exit without
/// calling a function for which `recursive` holds. A recursive call graph
/// whose re-entered function has such a path has a base case.
pub fn exits_cleanly(body: &[Stmt], recursive: &dyn Fn(&str) -> bool) -> bool {
    let Some((first, rest)) = body.split_first() else {
        return true;
    };
    match first {
        Stmt::Return(value) => !value.as_ref().is_some_and(|e| expr_calls(e, recursive)),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            if expr_calls(cond, recursive) {
                return false;
            }
            let then_path: Vec<Stmt> = then_branch.iter().chain(rest).cloned().collect();
            let else_path: Vec<Stmt> = else_branch.iter().chain(rest).cloned().collect();
            exits_cleanly(&then_path, recursive) || exits_cleanly(&else_path, recursive)
        }
        Stmt::For { init, cond, .. } => {
            let header_calls = init.as_deref().is_some_and(|s| stmt_calls(s, recursive))
                || cond.as_ref().is_some_and(|c| expr_calls(c, recursive));
            // Zero iterations is a valid path.
            !header_calls && exits_cleanly(rest, recursive)
        }
        Stmt::While { cond, .. } => !expr_calls(cond, recursive) && exits_cleanly(rest, recursive),
        Stmt::Block(inner) => {
            let path: Vec<Stmt> = inner.iter().chain(rest).cloned().collect();
            exits_cleanly(&path, recursive)
        }
        other => !stmt_calls(other, recursive) && exits_cleanly(rest, recursive),
    }
}

/// Places an argument list passes to reference parameters.
pub fn place_args(args: &[Expr], is_ref: impl Fn(usize) -> bool) -> Vec<(usize, Place)> {
    args.iter()
        .enumerate()
        .filter(|(i, _)| is_ref(*i))
        .filter_map(|(i, a)| a.as_place().map(|p| (i, p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn decl(src: &str) -> FnDecl {
        parser::parse(src).expect("parse").functions.remove(0)
    }

    #[test]
    fn reads_exclude_plain_targets() {
        let f = decl("fn f(x: f64, a: [f64]) { let y: f64 = 0; y = x; a[1] += y; }");
        let r = reads(f.body.as_ref().expect("body"));
        assert!(r.contains("x") && r.contains("y") && r.contains("a"));
        let g = decl("fn g(x: f64, a: [f64]) { a[0] = x; }");
        assert!(!reads(g.body.as_ref().expect("body")).contains("a"));
        assert_eq!(params_written(&g), HashSet::from(["a".to_string()]));
    }

    #[test]
    fn base_case_detection() {
        let with_base = decl(
            "fn p(x: f64, n: i64) -> f64 { if (n <= 0) { return 1.0; } return x * p(x, n - 1); }",
        );
        let is_p = |name: &str| name == "p";
        assert!(exits_cleanly(with_base.body.as_ref().expect("body"), &is_p));

        let without = decl("fn p(x: f64) -> f64 { let y: f64 = p(x); return y; }");
        assert!(!exits_cleanly(without.body.as_ref().expect("body"), &is_p));
    }
}
