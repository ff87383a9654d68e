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

use std::collections::{HashMap, HashSet};

use crate::ast::{AssignOp, Expr, FnDecl, Place, Program, Stmt, Type};
use crate::diagnostics::Diagnostic;
use crate::host::Host;
use crate::types::{accept_cost, arg_type, type_of, Intrinsic, TypeEnv};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TypeError {
    #[error("in `{function}`: unknown identifier `{name}`")]
    UnknownIdent { function: String, name: String },
    #[error("in `{function}`: no overload of `{callee}` accepts ({args})")]
    NoMatchingCall {
        function: String,
        callee: String,
        args: String,
    },
    #[error("in `{function}`: {message}")]
    Mismatch { function: String, message: String },
    #[error("`{0}` is defined twice with the same parameter types")]
    Duplicate(String),
}

impl TypeError {
    fn function(&self) -> &str {
        match self {
            TypeError::UnknownIdent { function, .. }
            | TypeError::NoMatchingCall { function, .. }
            | TypeError::Mismatch { function, .. } => function,
            TypeError::Duplicate(name) => name,
        }
    }

    /// Diagnostic pointing at the offending function's declaration.
    pub fn to_diagnostic(&self, src: &str, program: &Program) -> Diagnostic {
        let span = program
            .functions
            .iter()
            .find(|f| f.name == self.function())
            .map(|f| f.span.start()..f.span.end())
            .unwrap_or(0..0);
        Diagnostic::error(src, "type", "E2001", span, self.to_string())
    }
}

/// Checks every function in `program`; returns all errors found.
pub fn check_program(program: &Program) -> Vec<TypeError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for decl in &program.functions {
        if !seen.insert(decl.signature()) {
            errors.push(TypeError::Duplicate(decl.name.clone()));
        }
        if let Err(err) = check_function(program, decl) {
            errors.push(err);
        }
    }
    errors
}

pub fn check_function(host: &dyn Host, decl: &FnDecl) -> Result<(), TypeError> {
    let mut checker = Checker {
        host,
        decl,
        scopes: vec![HashMap::new()],
    };
    for param in &decl.params {
        if matches!(param.ty, Type::Void | Type::Tape(_)) {
            return Err(checker.mismatch(format!(
                "parameter `{}` cannot have type {}",
                param.name, param.ty
            )));
        }
        checker.declare(&param.name, param.ty.clone());
    }
    match &decl.body {
        Some(body) => checker.block(body),
        None => Ok(()),
    }
}

struct Checker<'a> {
    host: &'a dyn Host,
    decl: &'a FnDecl,
    scopes: Vec<TypeEnv>,
}

impl Checker<'_> {
    fn mismatch(&self, message: impl Into<String>) -> TypeError {
        TypeError::Mismatch {
            function: self.decl.name.clone(),
            message: message.into(),
        }
    }

    fn declare(&mut self, name: &str, ty: Type) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    fn lookup(&self, name: &str) -> Result<Type, TypeError> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name).cloned())
            .ok_or_else(|| TypeError::UnknownIdent {
                function: self.decl.name.clone(),
                name: name.to_string(),
            })
    }

    fn flat_env(&self) -> TypeEnv {
        let mut env = TypeEnv::new();
        for scope in &self.scopes {
            env.extend(scope.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }

    fn block(&mut self, body: &[Stmt]) -> Result<(), TypeError> {
        self.scopes.push(HashMap::new());
        let result = body.iter().try_for_each(|s| self.stmt(s));
        self.scopes.pop();
        result
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), TypeError> {
        match stmt {
            Stmt::Let { name, ty, init } => {
                match ty {
                    Type::F64 | Type::I64 | Type::Bool => {}
                    Type::Tape(elem) if elem.is_scalar() => {
                        if init.is_some() {
                            return Err(self.mismatch(format!("tape `{name}` cannot be initialized")));
                        }
                    }
                    other => {
                        return Err(self.mismatch(format!("local `{name}` cannot have type {other}")))
                    }
                }
                if let Some(init) = init {
                    let found = self.expr(init)?;
                    self.expect_accepts(ty, &found, name)?;
                }
                self.declare(name, ty.clone());
                Ok(())
            }
            Stmt::ArrayDecl { name, elem, len } => {
                if !elem.is_scalar() {
                    return Err(self.mismatch(format!("array `{name}` must hold scalars")));
                }
                let len_ty = self.expr(len)?;
                if len_ty != Type::I64 {
                    return Err(self.mismatch(format!("length of `{name}` must be i64, found {len_ty}")));
                }
                self.declare(name, Type::array(elem.clone()));
                Ok(())
            }
            Stmt::Assign { place, op, value } => {
                let target = self.place(place)?;
                let found = self.expr(value)?;
                if *op != AssignOp::Set && !matches!(target, Type::F64 | Type::I64) {
                    return Err(self.mismatch(format!(
                        "`{}` on non-numeric `{}`",
                        op.symbol(),
                        place.name()
                    )));
                }
                self.expect_accepts(&target, &found, place.name())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.condition(cond)?;
                self.block(then_branch)?;
                self.block(else_branch)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.scopes.push(HashMap::new());
                let result = (|| {
                    if let Some(init) = init {
                        self.stmt(init)?;
                    }
                    if let Some(cond) = cond {
                        self.condition(cond)?;
                    }
                    if let Some(step) = step {
                        self.stmt(step)?;
                    }
                    self.block(body)
                })();
                self.scopes.pop();
                result
            }
            Stmt::While { cond, body } => {
                self.condition(cond)?;
                self.block(body)
            }
            Stmt::Return(value) => {
                let found = match value {
                    Some(e) => self.expr(e)?,
                    None => Type::Void,
                };
                let ret = self.decl.ret.clone();
                if ret == Type::Void && found != Type::Void {
                    return Err(self.mismatch("void function returns a value"));
                }
                self.expect_accepts(&ret, &found, "return value")
            }
            Stmt::Expr(e) => self.expr(e).map(|_| ()),
            Stmt::Block(body) => self.block(body),
        }
    }

    fn condition(&mut self, cond: &Expr) -> Result<(), TypeError> {
        match self.expr(cond)? {
            Type::Bool => Ok(()),
            other => Err(self.mismatch(format!("condition must be bool, found {other}"))),
        }
    }

    fn expect_accepts(&self, target: &Type, found: &Type, what: &str) -> Result<(), TypeError> {
        if target == found || accept_cost(target, found).is_some() {
            Ok(())
        } else {
            Err(self.mismatch(format!("`{what}` expects {target}, found {found}")))
        }
    }

    fn place(&mut self, place: &Place) -> Result<Type, TypeError> {
        let ty = self.lookup(place.name())?;
        match place {
            Place::Var(name) => match ty {
                Type::F64 | Type::I64 | Type::Bool => Ok(ty),
                Type::Ref(inner) => Ok(*inner),
                other => Err(self.mismatch(format!("cannot assign to `{name}` of type {other}"))),
            },
            Place::Index(name, idx) => {
                self.index(idx)?;
                match ty {
                    Type::Array { elem, .. } => Ok(*elem),
                    other => Err(self.mismatch(format!("cannot index `{name}` of type {other}"))),
                }
            }
        }
    }

    fn index(&mut self, idx: &Expr) -> Result<(), TypeError> {
        match self.expr(idx)? {
            Type::I64 => Ok(()),
            other => Err(self.mismatch(format!("index must be i64, found {other}"))),
        }
    }

    fn expr(&mut self, expr: &Expr) -> Result<Type, TypeError> {
        match expr {
            Expr::Var(name) => Ok(self.lookup(name)?.value_type().clone()),
            Expr::Index(name, idx) => {
                self.index(idx)?;
                match self.lookup(name)? {
                    Type::Array { elem, .. } => Ok(*elem),
                    other => Err(self.mismatch(format!("cannot index `{name}` of type {other}"))),
                }
            }
            Expr::Unary(_, inner) => {
                self.expr(inner)?;
                self.infer(expr)
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.expr(lhs)?;
                let r = self.expr(rhs)?;
                crate::types::binary_result(*op, &l, &r).ok_or_else(|| {
                    self.mismatch(format!("operator `{}` does not apply to {l} and {r}", op.symbol()))
                })
            }
            Expr::Call(name, args) => self.call(name, args),
            Expr::FnRef(name) => Err(self.mismatch(format!(
                "`&{name}` is only valid as the first argument of numerical differentiation"
            ))),
            _ => self.infer(expr),
        }
    }

    fn infer(&self, expr: &Expr) -> Result<Type, TypeError> {
        let env = self.flat_env();
        let host = self.host;
        type_of(expr, &env, &|name: &str, args: &[Type]| {
            host.resolve(name, args).map(|d| d.ret.clone())
        })
            .ok_or_else(|| self.mismatch("ill-typed expression"))
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Type, TypeError> {
        match Intrinsic::from_name(name) {
            Some(Intrinsic::Len) => {
                match args {
                    [Expr::Var(a)] if self.lookup(a)?.is_array() => Ok(Type::I64),
                    _ => Err(self.mismatch("`len` takes one array")),
                }
            }
            Some(Intrinsic::Push) => match args {
                [Expr::Var(t), value] => {
                    let elem = match self.lookup(t)? {
                        Type::Tape(elem) => *elem,
                        other => return Err(self.mismatch(format!("`push` needs a tape, found {other}"))),
                    };
                    let found = self.expr(value)?;
                    self.expect_accepts(&elem, &found, t)?;
                    Ok(found)
                }
                _ => Err(self.mismatch("`push` takes a tape and a value")),
            },
            Some(Intrinsic::Pop) => match args {
                [Expr::Var(t)] => match self.lookup(t)? {
                    Type::Tape(elem) => Ok(*elem),
                    other => Err(self.mismatch(format!("`pop` needs a tape, found {other}"))),
                },
                _ => Err(self.mismatch("`pop` takes one tape")),
            },
            Some(Intrinsic::CentralDifference) => match args {
                [Expr::FnRef(target), k, print, rest @ ..] => {
                    if self.expr(k)? != Type::I64 || self.expr(print)? != Type::Bool {
                        return Err(self.mismatch(
                            "numerical differentiation takes (&fn, i64 index, bool print, args...)",
                        ));
                    }
                    let mut arg_types = Vec::new();
                    for arg in rest {
                        arg_types.push(self.expr(arg)?);
                    }
                    match self.host.resolve(target, &arg_types) {
                        Some(decl) if decl.ret == Type::F64 => Ok(Type::F64),
                        _ => Err(TypeError::NoMatchingCall {
                            function: self.decl.name.clone(),
                            callee: target.clone(),
                            args: describe(&arg_types),
                        }),
                    }
                }
                _ => Err(self.mismatch("malformed numerical differentiation call")),
            },
            None => {
                let env = self.flat_env();
                let host = self.host;
                let resolve_ret = |n: &str, a: &[Type]| host.resolve(n, a).map(|d| d.ret.clone());
                let mut arg_types = Vec::with_capacity(args.len());
                for arg in args {
                    self.expr(arg)?;
                    let ty = arg_type(arg, &env, &resolve_ret)
                        .ok_or_else(|| self.mismatch("ill-typed argument"))?;
                    arg_types.push(ty);
                }
                let decl = self.host.resolve(name, &arg_types).ok_or_else(|| {
                    TypeError::NoMatchingCall {
                        function: self.decl.name.clone(),
                        callee: name.to_string(),
                        args: describe(&arg_types),
                    }
                })?;
                for (param, arg) in decl.params.iter().zip(args) {
                    match &param.ty {
                        Type::Ref(_) if arg.as_place().is_none() => {
                            return Err(self.mismatch(format!(
                                "argument for `&` parameter `{}` of `{name}` must be a variable or element",
                                param.name
                            )))
                        }
                        Type::Array { .. } if !matches!(arg, Expr::Var(_)) => {
                            return Err(self.mismatch(format!(
                                "argument for array parameter `{}` of `{name}` must be an array variable",
                                param.name
                            )))
                        }
                        _ => {}
                    }
                }
                Ok(decl.ret.clone())
            }
        }
    }
}

fn describe(types: &[Type]) -> String {
    types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
