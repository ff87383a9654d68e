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

//! Forward mode: every `f64` variable, array and tape gets a tangent that is
//! updated right before the primal statement it shadows.

use std::collections::HashMap;

use super::engine::{CallPlan, Engine};
use super::{rules, unsupported, AutodiffError};
use crate::ast::build::{add, mul, neg, one, zero};
use crate::ast::{AssignOp, BinOp, Expr, FnDecl, Param, Place, Stmt, Type, UnOp};
use crate::opt::rename::unique_locals;
use crate::opt::NameGen;
use crate::registry::{tangent_type, DerivativeKind};
use crate::request::DifferentiationRequest;
use crate::types::{collect_env, Intrinsic, TypeEnv, CENTRAL_DIFFERENCE};

/// Directional derivative of the request target along its single
/// independent scalar, applied `order` times.
pub(super) fn directional(
    engine: &mut Engine<'_>,
    request: &DifferentiationRequest<'_>,
) -> Result<FnDecl, AutodiffError> {
    let target = request.target;
    if target.ret != Type::F64 {
        return Err(unsupported(
            &target.name,
            format!("forward mode needs an f64 result, found {}", target.ret),
        ));
    }
    let var = request
        .independents
        .first()
        .ok_or_else(|| unsupported(&target.name, "no independent variable"))?;
    let element = var.range.map(|(lo, _)| lo);
    let suffix = match element {
        Some(idx) => format!("arg{}_{idx}", var.param),
        None => format!("arg{}", var.param),
    };

    let mut current = target.clone();
    for k in 1..=request.order {
        let name = if k == 1 {
            engine.function_name(&format!("{}_d{suffix}", target.name))
        } else {
            engine.function_name(&format!("{}_d{k}{suffix}", target.name))
        };
        current = seeded(engine, &current, var.param, element, name)?;
    }
    Ok(current)
}

/// Derivative of `decl` with the tangent of parameter `param` (or of its
/// element `element`) seeded to one and every other tangent to zero.
fn seeded(
    engine: &mut Engine<'_>,
    decl: &FnDecl,
    param: usize,
    element: Option<usize>,
    name: String,
) -> Result<FnDecl, AutodiffError> {
    let custom = engine.registry().pushforward_for(&decl.signature());
    let decl = unique_locals(decl);
    let mut synth = Tangents::new(engine, &decl, true);

    let mut body = Vec::new();
    let mut tangent_args = Vec::new();
    for (i, p) in decl.params.iter().enumerate() {
        let Some(ty) = tangent_type(&p.ty) else {
            continue;
        };
        let d = synth.declare(&p.name);
        if ty.is_array() {
            body.push(Stmt::ArrayDecl {
                name: d.clone(),
                elem: Type::F64,
                len: Expr::call("len", vec![Expr::var(&p.name)]),
            });
            if let (true, Some(idx)) = (i == param, element) {
                body.push(Stmt::assign(
                    Place::Index(d.clone(), Box::new(Expr::Int(idx as i64))),
                    AssignOp::Set,
                    one(),
                ));
            }
        } else {
            let seed = if i == param && element.is_none() { one() } else { zero() };
            body.push(Stmt::let_(d.clone(), Type::F64, Some(seed)));
        }
        tangent_args.push(Expr::var(d));
    }

    match (custom, &decl.body) {
        (Some(custom), _) => {
            let mut args: Vec<Expr> = decl.params.iter().map(|p| Expr::var(&p.name)).collect();
            args.extend(tangent_args);
            body.push(Stmt::Return(Some(Expr::call(custom.name, args))));
        }
        (None, Some(src)) => body.extend(synth.block(src)?),
        (None, None) => {
            return Err(unsupported(&decl.name, "function has no body and no custom pushforward"))
        }
    }

    Ok(FnDecl {
        name,
        params: decl.params.clone(),
        ret: Type::F64,
        body: Some(body),
        span: decl.span,
    })
}

/// `<callee>_pushforward`: the original parameters followed by one tangent
/// per differentiable parameter. Returns the tangent of the result, or
/// nothing when the callee does not return `f64`.
pub(super) fn pushforward(engine: &mut Engine<'_>, callee: &FnDecl, name: &str) -> Result<FnDecl, AutodiffError> {
    let decl = unique_locals(callee);
    let Some(src) = &decl.body else {
        return Err(unsupported(&decl.name, "function has no body"));
    };
    let returns_tangent = decl.ret == Type::F64;
    let mut synth = Tangents::new(engine, &decl, returns_tangent);

    let mut params = decl.params.clone();
    for p in &decl.params {
        if let Some(ty) = tangent_type(&p.ty) {
            let d = synth.declare(&p.name);
            params.push(Param::new(d, ty));
        }
    }
    let body = synth.block(src)?;

    Ok(FnDecl {
        name: name.to_string(),
        params,
        ret: if returns_tangent { Type::F64 } else { Type::Void },
        body: Some(body),
        span: decl.span,
    })
}

struct Tangents<'s, 'a> {
    engine: &'s mut Engine<'a>,
    function: String,
    env: TypeEnv,
    names: NameGen,
    tangents: HashMap<String, String>,
    returns_tangent: bool,
}

impl<'s, 'a> Tangents<'s, 'a> {
    fn new(engine: &'s mut Engine<'a>, decl: &FnDecl, returns_tangent: bool) -> Self {
        Self {
            engine,
            function: decl.name.clone(),
            env: collect_env(decl),
            names: NameGen::for_function(decl),
            tangents: HashMap::new(),
            returns_tangent,
        }
    }

    fn declare(&mut self, var: &str) -> String {
        let name = self.names.fresh(&format!("_d_{var}"));
        self.tangents.insert(var.to_string(), name.clone());
        name
    }

    fn fail(&self, message: impl Into<String>) -> AutodiffError {
        unsupported(&self.function, message)
    }

    fn callee(&self, name: &str, args: &[Expr]) -> Result<FnDecl, AutodiffError> {
        self.engine
            .resolve_call(&self.env, name, args)
            .ok_or_else(|| self.fail(format!("no overload of `{name}` accepts these arguments")))
    }

    /// A primal sub-expression about to be copied into a tangent. It must
    /// evaluate to the same value twice, so tape operations and calls that
    /// write their arguments are refused.
    fn primal(&self, expr: &Expr) -> Result<Expr, AutodiffError> {
        let mut problem = None;
        expr.walk(&mut |e| {
            if problem.is_some() {
                return;
            }
            if let Expr::Call(name, args) = e {
                match Intrinsic::from_name(name) {
                    Some(Intrinsic::Push | Intrinsic::Pop) => {
                        problem = Some(format!("`{name}` cannot appear inside a differentiated expression"));
                    }
                    Some(_) => {}
                    None => {
                        if let Some(callee) = self.engine.resolve_call(&self.env, name, args) {
                            if self.engine.has_effects(&callee) {
                                problem = Some(effect_message(name));
                            }
                        }
                    }
                }
            }
        });
        match problem {
            Some(message) => Err(self.fail(message)),
            None => Ok(expr.clone()),
        }
    }

    fn block(&mut self, body: &[Stmt]) -> Result<Vec<Stmt>, AutodiffError> {
        let mut out = Vec::with_capacity(body.len() * 2);
        for stmt in body {
            self.stmt(stmt, &mut out)?;
        }
        Ok(out)
    }

    fn stmt(&mut self, stmt: &Stmt, out: &mut Vec<Stmt>) -> Result<(), AutodiffError> {
        match stmt {
            Stmt::Let { name, ty, init } => {
                match ty {
                    Type::F64 => {
                        let d_init = match init {
                            Some(e) => self.tangent(e)?,
                            None => zero(),
                        };
                        let d = self.declare(name);
                        out.push(Stmt::let_(d, Type::F64, Some(d_init)));
                    }
                    Type::Tape(elem) if **elem == Type::F64 => {
                        let d = self.declare(name);
                        out.push(Stmt::let_(d, ty.clone(), None));
                    }
                    Type::Array { .. } if ty.is_differentiable() => {
                        let alias = match init {
                            Some(Expr::Var(src)) => self.tangents.get(src).cloned(),
                            _ => None,
                        };
                        let Some(alias) = alias else {
                            return Err(self.fail(format!("array alias `{name}` of an untracked array")));
                        };
                        let d = self.declare(name);
                        out.push(Stmt::let_(d, Type::array(Type::F64), Some(Expr::var(alias))));
                    }
                    _ => {}
                }
                out.push(stmt.clone());
            }
            Stmt::ArrayDecl { name, elem, len } => {
                if *elem == Type::F64 {
                    let d = self.declare(name);
                    out.push(Stmt::ArrayDecl {
                        name: d,
                        elem: Type::F64,
                        len: len.clone(),
                    });
                }
                out.push(stmt.clone());
            }
            Stmt::Assign { place, op, value } => {
                if let Some(d) = self.tangents.get(place.name()).cloned() {
                    let d_place = place.renamed(&d);
                    let d_value = self.tangent(value)?;
                    match op {
                        AssignOp::Set => out.push(Stmt::assign(d_place, AssignOp::Set, d_value)),
                        AssignOp::Add | AssignOp::Sub => {
                            if !d_value.is_zero() {
                                out.push(Stmt::assign(d_place, *op, d_value));
                            }
                        }
                        AssignOp::Mul | AssignOp::Div => {
                            let value = self.primal(value)?;
                            let op = op.binop().unwrap_or(BinOp::Mul);
                            let updated = rules::tangent_binary(
                                op,
                                &place.to_expr(),
                                d_place.to_expr(),
                                &value,
                                d_value,
                            )
                            .unwrap_or_else(zero);
                            out.push(Stmt::assign(d_place, AssignOp::Set, updated));
                        }
                    }
                }
                out.push(stmt.clone());
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => out.push(Stmt::If {
                cond: cond.clone(),
                then_branch: self.block(then_branch)?,
                else_branch: self.block(else_branch)?,
            }),
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                let init = match init {
                    Some(s) => self.block(std::slice::from_ref(s.as_ref()))?,
                    None => Vec::new(),
                };
                let step = match step {
                    Some(s) => self.block(std::slice::from_ref(s.as_ref()))?,
                    None => Vec::new(),
                };
                let mut body = self.block(body)?;
                if init.len() <= 1 && step.len() <= 1 {
                    out.push(Stmt::For {
                        init: init.into_iter().next().map(Box::new),
                        cond: cond.clone(),
                        step: step.into_iter().next().map(Box::new),
                        body,
                    });
                } else {
                    // The header holds one statement each, so a shadowed init
                    // moves in front of the loop and the step to the body's end.
                    body.extend(step);
                    let mut scope = init;
                    scope.push(Stmt::For {
                        init: None,
                        cond: cond.clone(),
                        step: None,
                        body,
                    });
                    out.push(Stmt::Block(scope));
                }
            }
            Stmt::While { cond, body } => out.push(Stmt::While {
                cond: cond.clone(),
                body: self.block(body)?,
            }),
            Stmt::Return(value) => {
                let result = match (self.returns_tangent, value) {
                    (true, Some(e)) => Some(self.tangent(e)?),
                    (true, None) => Some(zero()),
                    (false, _) => None,
                };
                out.push(Stmt::Return(result));
            }
            Stmt::Expr(Expr::Call(name, args)) => self.call_stmt(stmt, name, args, out)?,
            Stmt::Expr(_) => out.push(stmt.clone()),
            Stmt::Block(inner) => out.push(Stmt::Block(self.block(inner)?)),
        }
        Ok(())
    }

    /// A call whose value is discarded. Calls that write through their
    /// arguments are replaced by their pushforward, which performs the
    /// primal effects too.
    fn call_stmt(&mut self, stmt: &Stmt, name: &str, args: &[Expr], out: &mut Vec<Stmt>) -> Result<(), AutodiffError> {
        match Intrinsic::from_name(name) {
            Some(Intrinsic::Push | Intrinsic::Pop) => {
                let d = self.call_tangent(name, args)?;
                if !d.is_zero() {
                    out.push(Stmt::Expr(d));
                }
                out.push(stmt.clone());
            }
            Some(_) => out.push(stmt.clone()),
            None => {
                let callee = self.callee(name, args)?;
                if !self.engine.has_effects(&callee) {
                    out.push(stmt.clone());
                    return Ok(());
                }
                match self.engine.plan(DerivativeKind::Pushforward, &callee, &self.function)? {
                    CallPlan::Custom(derivative) | CallPlan::Derived(derivative) => {
                        let mut all = Vec::with_capacity(args.len() * 2);
                        for arg in args {
                            all.push(self.primal(arg)?);
                        }
                        all.extend(self.derivative_args(&callee, args)?);
                        out.push(Stmt::Expr(Expr::call(derivative, all)));
                    }
                    CallPlan::Inactive | CallPlan::Numerical => out.push(stmt.clone()),
                }
            }
        }
        Ok(())
    }

    fn tangent(&mut self, expr: &Expr) -> Result<Expr, AutodiffError> {
        Ok(match expr {
            Expr::Float(_) | Expr::Int(_) | Expr::Bool(_) | Expr::FnRef(_) => zero(),
            Expr::Var(name) => self.tangents.get(name).map(Expr::var).unwrap_or_else(zero),
            Expr::Index(name, idx) => match self.tangents.get(name) {
                Some(d) => Expr::Index(d.clone(), idx.clone()),
                None => zero(),
            },
            Expr::Unary(UnOp::Neg, inner) => neg(self.tangent(inner)?),
            Expr::Unary(UnOp::Not, _) => zero(),
            Expr::Binary(op, lhs, rhs) => {
                let d_lhs = self.tangent(lhs)?;
                let d_rhs = self.tangent(rhs)?;
                if d_lhs.is_zero() && d_rhs.is_zero() {
                    return Ok(zero());
                }
                let (lhs, rhs) = match op {
                    BinOp::Mul | BinOp::Div => (self.primal(lhs)?, self.primal(rhs)?),
                    _ => ((**lhs).clone(), (**rhs).clone()),
                };
                rules::tangent_binary(*op, &lhs, d_lhs, &rhs, d_rhs).unwrap_or_else(zero)
            }
            Expr::Call(name, args) => self.call_tangent(name, args)?,
        })
    }

    fn call_tangent(&mut self, name: &str, args: &[Expr]) -> Result<Expr, AutodiffError> {
        let tape_tangent = |tangents: &HashMap<String, String>| match args.first() {
            Some(Expr::Var(tape)) => tangents.get(tape).cloned(),
            _ => None,
        };
        match Intrinsic::from_name(name) {
            Some(Intrinsic::Len) => Ok(zero()),
            Some(Intrinsic::Push) => match (tape_tangent(&self.tangents), args.get(1)) {
                (Some(d), Some(value)) => {
                    let d_value = self.tangent(value)?;
                    Ok(Expr::call("push", vec![Expr::var(d), d_value]))
                }
                _ => Ok(zero()),
            },
            Some(Intrinsic::Pop) => Ok(match tape_tangent(&self.tangents) {
                Some(d) => Expr::call("pop", vec![Expr::var(d)]),
                None => zero(),
            }),
            Some(Intrinsic::CentralDifference) => {
                Err(self.fail("a numerical derivative estimate cannot be differentiated again"))
            }
            None => {
                let callee = self.callee(name, args)?;
                if self.engine.has_effects(&callee) {
                    return Err(self.fail(effect_message(name)));
                }
                match self.engine.plan(DerivativeKind::Pushforward, &callee, &self.function)? {
                    CallPlan::Inactive => Ok(zero()),
                    CallPlan::Custom(derivative) | CallPlan::Derived(derivative) => {
                        let mut all = Vec::with_capacity(args.len() * 2);
                        for arg in args {
                            all.push(self.primal(arg)?);
                        }
                        all.extend(self.derivative_args(&callee, args)?);
                        Ok(Expr::call(derivative, all))
                    }
                    CallPlan::Numerical => {
                        let print = self.engine.options().print_numerical_errors;
                        let mut sum = zero();
                        for (k, (param, arg)) in callee.params.iter().zip(args).enumerate() {
                            if param.ty != Type::F64 {
                                continue;
                            }
                            let d_arg = self.tangent(arg)?;
                            if d_arg.is_zero() {
                                continue;
                            }
                            let partial = central_difference(&callee.name, k, print, args, |a| self.primal(a))?;
                            sum = add(sum, mul(partial, d_arg));
                        }
                        Ok(sum)
                    }
                }
            }
        }
    }

    /// Tangent arguments for a pushforward call, in parameter order.
    fn derivative_args(&mut self, callee: &FnDecl, args: &[Expr]) -> Result<Vec<Expr>, AutodiffError> {
        let mut out = Vec::new();
        for (param, arg) in callee.params.iter().zip(args) {
            match tangent_type(&param.ty) {
                None => {}
                Some(Type::F64) => out.push(self.tangent(arg)?),
                Some(_) => {
                    let place = arg
                        .as_place()
                        .ok_or_else(|| self.fail(format!("argument for `{}` must be a variable", param.name)))?;
                    let d = self.tangents.get(place.name()).cloned().ok_or_else(|| {
                        self.fail(format!("`{}` has no tangent to pass by reference", place.name()))
                    })?;
                    out.push(place.renamed(&d).to_expr());
                }
            }
        }
        Ok(out)
    }
}

fn effect_message(callee: &str) -> String {
    format!("`{callee}` writes through its reference or array parameters and may only be called as a statement")
}

/// `numdiff::central_difference(&callee, k, print, args...)`.
pub(super) fn central_difference(
    callee: &str,
    k: usize,
    print: bool,
    args: &[Expr],
    mut copy: impl FnMut(&Expr) -> Result<Expr, AutodiffError>,
) -> Result<Expr, AutodiffError> {
    let mut all = vec![
        Expr::FnRef(callee.to_string()),
        Expr::Int(k as i64),
        Expr::Bool(print),
    ];
    for arg in args {
        all.push(copy(arg)?);
    }
    Ok(Expr::call(CENTRAL_DIFFERENCE, all))
}

#[cfg(test)]
mod tests {
    use crate::autodiff::differentiate;
    use crate::ast::Program;
    use crate::config::EngineOptions;
    use crate::eval::{Arg, Callable};
    use crate::parser;
    use crate::registry::{CustomDerivativeRegistry, PRELUDE};
    use crate::request::{DifferentiationRequest, Mode};
    use approx::assert_relative_eq;

    fn program(src: &str) -> Program {
        parser::parse(PRELUDE).expect("prelude").merged(parser::parse(src).expect("parse"))
    }

    fn forward(p: &Program, name: &str, wrt: &str, order: u32) -> Callable {
        let registry = CustomDerivativeRegistry::from_host(p).expect("registry");
        let target = p.functions.iter().find(|f| f.name == name).expect("target");
        let request = DifferentiationRequest::new(p, target, Mode::Forward, Some(wrt), order).expect("request");
        let derived = differentiate(p, &registry, &EngineOptions::default(), &request).expect("derive");
        Callable::new(p, &derived)
    }

    #[test]
    fn compound_assignments_and_loops() {
        let p = program(
            "fn f(x: f64, n: i64) -> f64 {\n\
                 let acc: f64 = 1.0;\n\
                 for (let i: i64 = 0; i < n; i += 1) { acc *= x; }\n\
                 acc /= 2.0;\n\
                 return acc;\n\
             }",
        );
        let df = forward(&p, "f", "x", 1);
        assert_eq!(df.decl().name, "f_darg0");
        let v = df.execute(&mut [Arg::Scalar(3.0), Arg::Int(4)]).expect("run").expect("value");
        assert_relative_eq!(v, 2.0 * 27.0, epsilon = 1e-12);
    }

    #[test]
    fn second_order_applies_the_transform_twice() {
        let p = program("fn f(x: f64) -> f64 { return sin(x) * x; }");
        let d2 = forward(&p, "f", "x", 2);
        assert_eq!(d2.decl().name, "f_d2arg0");
        let x = 0.7_f64;
        let v = d2.execute(&mut [Arg::Scalar(x)]).expect("run").expect("value");
        assert_relative_eq!(v, 2.0 * x.cos() - x * x.sin(), epsilon = 1e-12);
    }

    #[test]
    fn array_element_seed() {
        let p = program(
            "fn dot(a: [f64], b: [f64]) -> f64 {\n\
                 let s: f64 = 0.0;\n\
                 for (let i: i64 = 0; i < len(a); i += 1) { s += a[i] * b[i]; }\n\
                 return s;\n\
             }",
        );
        let df = forward(&p, "dot", "a[1]", 1);
        assert_eq!(df.decl().name, "dot_darg0_1");
        let mut args = [Arg::Array(vec![1.0, 2.0, 3.0]), Arg::Array(vec![4.0, 5.0, 6.0])];
        assert_eq!(df.execute(&mut args).expect("run"), Some(5.0));
    }

    #[test]
    fn reference_writing_callee_in_statement_position() {
        let p = program(
            "fn bump(v: &f64, k: f64) { v *= k; }\n\
             fn f(x: f64) -> f64 { let y: f64 = x; bump(y, x); return y; }",
        );
        let df = forward(&p, "f", "x", 1);
        let v = df.execute(&mut [Arg::Scalar(3.0)]).expect("run").expect("value");
        assert_relative_eq!(v, 6.0, epsilon = 1e-12);
    }
}
