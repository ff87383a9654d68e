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

//! Gives every local of a function a name unique within that function, so
//! later passes can treat the body as one flat scope.

use std::collections::{HashMap, HashSet};

use crate::ast::{Expr, FnDecl, Place, Stmt};

/// Hands out names that do not clash with anything already in use.
#[derive(Debug, Clone, Default)]
pub struct NameGen {
    used: HashSet<String>,
}

impl NameGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the generator with every name `decl` already uses.
    pub fn for_function(decl: &FnDecl) -> Self {
        let mut gen = Self::new();
        for p in &decl.params {
            gen.reserve(&p.name);
        }
        for stmt in decl.body.iter().flatten() {
            stmt.walk(&mut |s| match s {
                Stmt::Let { name, .. } | Stmt::ArrayDecl { name, .. } => gen.reserve(name),
                _ => {}
            });
        }
        gen
    }

    pub fn reserve(&mut self, name: &str) {
        self.used.insert(name.to_string());
    }

    pub fn is_used(&self, name: &str) -> bool {
        self.used.contains(name)
    }

    /// `base` if free, else `base_1`, `base_2`, ...
    pub fn fresh(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 1;
        while self.used.contains(&candidate) {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }

    /// First free name of the form `{prefix}0`, `{prefix}1`, ...
    pub fn numbered(&mut self, prefix: &str) -> String {
        let mut n = 0usize;
        loop {
            let candidate = format!("{prefix}{n}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

pub fn unique_locals(decl: &FnDecl) -> FnDecl {
    let mut renamer = Renamer {
        gen: NameGen::new(),
        scopes: vec![HashMap::new()],
    };
    for p in &decl.params {
        renamer.gen.reserve(&p.name);
    }
    let body = decl.body.as_ref().map(|b| renamer.block(b));
    FnDecl {
        body,
        ..decl.clone()
    }
}

/// Splices nested blocks into their parent. Only valid once names are unique.
pub fn flatten_blocks(body: Vec<Stmt>) -> Vec<Stmt> {
    let mut out = Vec::with_capacity(body.len());
    for stmt in body {
        match stmt {
            Stmt::Block(inner) => out.extend(flatten_blocks(inner)),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => out.push(Stmt::If {
                cond,
                then_branch: flatten_blocks(then_branch),
                else_branch: flatten_blocks(else_branch),
            }),
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => out.push(Stmt::For {
                init,
                cond,
                step,
                body: flatten_blocks(body),
            }),
            Stmt::While { cond, body } => out.push(Stmt::While {
                cond,
                body: flatten_blocks(body),
            }),
            other => out.push(other),
        }
    }
    out
}

struct Renamer {
    gen: NameGen,
    scopes: Vec<HashMap<String, String>>,
}

impl Renamer {
    fn lookup(&self, name: &str) -> String {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name).cloned())
            .unwrap_or_else(|| name.to_string())
    }

    fn bind(&mut self, name: &str) -> String {
        let fresh = self.gen.fresh(name);
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), fresh.clone());
        }
        fresh
    }

    fn block(&mut self, body: &[Stmt]) -> Vec<Stmt> {
        self.scopes.push(HashMap::new());
        let out = body.iter().map(|s| self.stmt(s)).collect();
        self.scopes.pop();
        out
    }

    fn stmt(&mut self, stmt: &Stmt) -> Stmt {
        match stmt {
            Stmt::Let { name, ty, init } => {
                let init = init.as_ref().map(|e| self.expr(e));
                Stmt::Let {
                    name: self.bind(name),
                    ty: ty.clone(),
                    init,
                }
            }
            Stmt::ArrayDecl { name, elem, len } => {
                let len = self.expr(len);
                Stmt::ArrayDecl {
                    name: self.bind(name),
                    elem: elem.clone(),
                    len,
                }
            }
            Stmt::Assign { place, op, value } => Stmt::Assign {
                place: self.place(place),
                op: *op,
                value: self.expr(value),
            },
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => Stmt::If {
                cond: self.expr(cond),
                then_branch: self.block(then_branch),
                else_branch: self.block(else_branch),
            },
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.scopes.push(HashMap::new());
                let out = Stmt::For {
                    init: init.as_ref().map(|s| Box::new(self.stmt(s))),
                    cond: cond.as_ref().map(|c| self.expr(c)),
                    step: step.as_ref().map(|s| Box::new(self.stmt(s))),
                    body: self.block(body),
                };
                self.scopes.pop();
                out
            }
            Stmt::While { cond, body } => Stmt::While {
                cond: self.expr(cond),
                body: self.block(body),
            },
            Stmt::Return(value) => Stmt::Return(value.as_ref().map(|e| self.expr(e))),
            Stmt::Expr(e) => Stmt::Expr(self.expr(e)),
            Stmt::Block(body) => Stmt::Block(self.block(body)),
        }
    }

    fn place(&self, place: &Place) -> Place {
        match place {
            Place::Var(name) => Place::Var(self.lookup(name)),
            Place::Index(name, idx) => Place::Index(self.lookup(name), Box::new(self.expr(idx))),
        }
    }

    fn expr(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::Var(name) => Expr::Var(self.lookup(name)),
            Expr::Index(name, idx) => Expr::Index(self.lookup(name), Box::new(self.expr(idx))),
            Expr::Unary(op, inner) => Expr::Unary(*op, Box::new(self.expr(inner))),
            Expr::Binary(op, lhs, rhs) => {
                Expr::Binary(*op, Box::new(self.expr(lhs)), Box::new(self.expr(rhs)))
            }
            Expr::Call(name, args) => {
                Expr::Call(name.clone(), args.iter().map(|a| self.expr(a)).collect())
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::print::format_fn;

    #[test]
    fn shadowed_locals_get_fresh_names() {
        let program = parser::parse(
            "fn f(x: f64) -> f64 {\n\
                 let y: f64 = x;\n\
                 if (x > 0.0) { let y: f64 = y * 2.0; x = y; }\n\
                 for (let i: i64 = 0; i < 2; i += 1) { let y: f64 = 1.0; x += y; }\n\
                 return y;\n\
             }",
        )
        .expect("parse");
        let renamed = unique_locals(&program.functions[0]);
        let text = format_fn(&renamed);
        assert!(text.contains("let y_1: f64 = y * 2.0;"), "{text}");
        assert!(text.contains("x = y_1;"), "{text}");
        assert!(text.contains("let y_2: f64 = 1.0;"), "{text}");
        assert!(text.contains("return y;"), "{text}");
    }
}
