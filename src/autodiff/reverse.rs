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

//! Reverse mode.
//!
//! The derived body is the primal sweep followed by the adjoint sweep. The
//! primal sweep is the original code with every overwritten value that is
//! read somewhere saved first; the adjoint sweep walks the statements
//! backwards, restores each saved value and distributes the adjoint of the
//! assigned variable over the operands of the assigned expression. Saved
//! values outside loops live in local slots (`_t0`), inside loops in local
//! tapes, as do branch decisions and loop trip counts.

use std::collections::{HashMap, HashSet};

use super::engine::{CallPlan, Engine};
use super::error_est::ErrorSink;
use super::forward::central_difference;
use super::{rules, unsupported, AutodiffError};
use crate::ast::build::{binary, gt, iadd, imul, lt, mul, neg, one, zero};
use crate::ast::{AssignOp, Expr, FnDecl, Param, Place, Stmt, Type, UnOp};
use crate::opt::{analysis, canonicalize, NameGen};
use crate::registry::{adjoint_type, DerivativeKind};
use crate::request::DifferentiationRequest;
use crate::types::{collect_env, type_of, Intrinsic, TypeEnv};

pub(super) fn gradient(
    engine: &mut Engine<'_>,
    request: &DifferentiationRequest<'_>,
) -> Result<FnDecl, AutodiffError> {
    build_gradient(engine, request, None)
}

/// `<f>_grad`: the original parameters followed by one adjoint output per
/// independent variable; with `epsilon` also a trailing `_final_error`
/// accumulator.
pub(super) fn build_gradient(
    engine: &mut Engine<'_>,
    request: &DifferentiationRequest<'_>,
    epsilon: Option<f64>,
) -> Result<FnDecl, AutodiffError> {
    let target = request.target;
    let name = engine.function_name(&gradient_name(request, epsilon.is_some()));
    let custom = engine.registry().pullback_for(&target.signature());
    let source = match (&custom, &target.body) {
        (Some(_), _) => target.clone(),
        (None, Some(_)) => prepare(target)?,
        (None, None) => {
            return Err(unsupported(&target.name, "function has no body and no custom pullback"));
        }
    };
    let modified = engine.modified_params(target);

    let mut synth = Adjoints::new(engine, &source);
    if epsilon.is_some() {
        synth.always_save = modified.clone();
    }

    let mut params = target.params.clone();
    let mut prologue = Vec::new();
    let mut epilogue = Vec::new();
    let mut scalars = Vec::new();
    for var in &request.independents {
        let p = &target.params[var.param];
        let out = synth.names.fresh(&format!("_d_{}", p.name));
        if p.ty.is_array() {
            params.push(Param::new(&out, Type::array(Type::F64)));
            if var.range.is_none() && !modified.contains(&p.name) {
                synth.bind(&p.name, &out);
                continue;
            }
            let local = synth.names.fresh(&format!("_d_{}_local", p.name));
            prologue.push(Stmt::ArrayDecl {
                name: local.clone(),
                elem: Type::F64,
                len: len_of(&p.name),
            });
            let (lo, count) = match var.range {
                Some((lo, hi)) => (lo as i64, Expr::Int((hi - lo + 1) as i64)),
                None => (0, len_of(&p.name)),
            };
            let i = synth.names.numbered("_i");
            let flush = Stmt::assign(
                Place::Index(out.clone(), Box::new(Expr::var(&i))),
                AssignOp::Add,
                Expr::index(&local, iadd(Expr::var(&i), Expr::Int(lo))),
            );
            epilogue.push(counted_loop(&i, count, vec![flush]));
            synth.bind(&p.name, &local);
        } else {
            params.push(Param::new(&out, Type::reference(Type::F64)));
            let adjoint = if modified.contains(&p.name) {
                let local = synth.names.fresh(&format!("_d_{}_local", p.name));
                prologue.push(Stmt::let_(&local, Type::F64, Some(zero())));
                epilogue.push(Stmt::assign(Place::Var(out.clone()), AssignOp::Add, Expr::var(&local)));
                local
            } else {
                out.clone()
            };
            synth.bind(&p.name, &adjoint);
            scalars.push((p.name.clone(), adjoint));
        }
    }
    for p in &target.params {
        if p.ty.is_differentiable() && !synth.adjoints.contains_key(&p.name) {
            let d = synth.names.fresh(&format!("_d_{}", p.name));
            let len = p.ty.is_array().then(|| len_of(&p.name));
            prologue.push(synth.adjoint_decl(&d, len));
            synth.bind(&p.name, &d);
        }
    }
    if let Some(epsilon) = epsilon {
        let acc = synth.names.fresh("_final_error");
        params.push(Param::new(&acc, Type::reference(Type::F64)));
        synth.error = Some(ErrorSink::new(acc, epsilon));
    }

    let sweeps = match custom {
        Some(custom) => {
            let mut args: Vec<Expr> = target.params.iter().map(|p| Expr::var(&p.name)).collect();
            if target.ret == Type::F64 {
                args.push(one());
            }
            for p in &target.params {
                if let Some(d) = synth.adjoints.get(&p.name) {
                    args.push(Expr::var(d));
                }
            }
            vec![Stmt::Expr(Expr::call(custom.name, args))]
        }
        None => {
            let body = source.body.as_deref().unwrap_or_default();
            let (mut primal, reverse) = synth.run(body)?;
            primal.extend(reverse);
            primal
        }
    };

    let mut body = prologue;
    body.append(&mut synth.hoisted);
    body.extend(sweeps);
    body.extend(epilogue);
    if let Some(sink) = &synth.error {
        for (param, adjoint) in &scalars {
            body.push(sink.term(Expr::var(adjoint), Expr::var(param)));
        }
    }

    Ok(FnDecl {
        name,
        params,
        ret: Type::Void,
        body: Some(body),
        span: target.span,
    })
}

fn gradient_name(request: &DifferentiationRequest<'_>, with_error: bool) -> String {
    let target = request.target;
    if with_error {
        return format!("{}_grad_err", target.name);
    }
    let differentiable = target.params.iter().filter(|p| p.ty.is_differentiable()).count();
    let full = request.independents.len() == differentiable
        && request.independents.iter().all(|v| v.range.is_none());
    if full {
        format!("{}_grad", target.name)
    } else {
        let names: Vec<&str> = request.independents.iter().map(|v| v.name.as_str()).collect();
        format!("{}_grad_{}", target.name, names.join("_"))
    }
}

/// `<callee>_pullback`: the original parameters, the result adjoint when the
/// callee returns `f64`, then one adjoint per differentiable parameter. It
/// re-runs the callee and leaves every parameter as it found it.
pub(super) fn pullback(engine: &mut Engine<'_>, callee: &FnDecl, name: &str) -> Result<FnDecl, AutodiffError> {
    let source = prepare(callee)?;
    let modified = engine.modified_params(callee);
    let mut synth = Adjoints::new(engine, &source);
    synth.always_save = callee.params.iter().map(|p| p.name.clone()).collect();

    let mut params = callee.params.clone();
    if callee.ret == Type::F64 {
        let d_y = synth.names.fresh("_d_y");
        params.push(Param::new(&d_y, Type::F64));
        synth.seed = Some(Expr::var(d_y));
    } else {
        synth.seed = None;
    }

    let mut prologue = Vec::new();
    let mut epilogue = Vec::new();
    for p in &callee.params {
        let Some(ty) = adjoint_type(&p.ty) else {
            continue;
        };
        let d = synth.names.fresh(&format!("_d_{}", p.name));
        params.push(Param::new(&d, ty));
        if p.ty == Type::F64 && modified.contains(&p.name) {
            // Writes to a by-value parameter reset its adjoint, which must
            // not clear what the caller already accumulated.
            let local = synth.names.fresh(&format!("_d_{}_local", p.name));
            prologue.push(Stmt::let_(&local, Type::F64, Some(zero())));
            epilogue.push(Stmt::assign(Place::Var(d), AssignOp::Add, Expr::var(&local)));
            synth.bind(&p.name, &local);
        } else {
            synth.bind(&p.name, &d);
        }
    }

    if let Some(epsilon) = synth.engine.error_epsilon() {
        let acc = synth.names.fresh("_final_error");
        params.push(Param::new(&acc, Type::reference(Type::F64)));
        synth.error = Some(ErrorSink::for_callee(acc, epsilon));
    }

    let body = source.body.as_deref().unwrap_or_default();
    let (primal, reverse) = synth.run(body)?;
    let mut out = prologue;
    out.append(&mut synth.hoisted);
    out.extend(primal);
    out.extend(reverse);
    out.extend(epilogue);

    Ok(FnDecl {
        name: name.to_string(),
        params,
        ret: Type::Void,
        body: Some(out),
        span: callee.span,
    })
}

/// Unique locals, returns in tail position, flat blocks.
pub(super) fn prepare(decl: &FnDecl) -> Result<FnDecl, AutodiffError> {
    canonicalize(decl).map_err(|_| {
        unsupported(
            &decl.name,
            "`return` inside a loop cannot be reversed",
        )
    })
}

pub(super) fn len_of(array: &str) -> Expr {
    Expr::call("len", vec![Expr::var(array)])
}

/// `for (let i: i64 = 0; i < count; i += 1) { body }`
pub(super) fn counted_loop(i: &str, count: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::For {
        init: Some(Box::new(Stmt::let_(i, Type::I64, Some(Expr::Int(0))))),
        cond: Some(lt(Expr::var(i), count)),
        step: Some(Box::new(Stmt::assign(Place::Var(i.to_string()), AssignOp::Add, Expr::Int(1)))),
        body,
    }
}

/// Jacobian lanes: every adjoint holds `count` values, one per output
/// element, and adjoint updates run once per lane with `index` bound.
pub(super) struct Lanes {
    pub count: String,
    pub index: String,
}

/// Adjoint sweep builder for one function body.
pub(super) struct Adjoints<'s, 'a> {
    pub engine: &'s mut Engine<'a>,
    pub function: String,
    pub env: TypeEnv,
    pub names: NameGen,
    pub adjoints: HashMap<String, String>,
    pub hoisted: Vec<Stmt>,
    /// Variables saved before every overwrite, read or not.
    pub always_save: HashSet<String>,
    /// Adjoint of the returned value; `None` ignores returns.
    pub seed: Option<Expr>,
    pub lanes: Option<Lanes>,
    pub error: Option<ErrorSink>,
    reads: HashSet<String>,
    loop_depth: usize,
    control_depth: usize,
}

type Sweeps = (Vec<Stmt>, Vec<Stmt>);

impl<'s, 'a> Adjoints<'s, 'a> {
    pub fn new(engine: &'s mut Engine<'a>, decl: &FnDecl) -> Self {
        Self {
            engine,
            function: decl.name.clone(),
            env: collect_env(decl),
            names: NameGen::for_function(decl),
            adjoints: HashMap::new(),
            hoisted: Vec::new(),
            always_save: HashSet::new(),
            seed: Some(one()),
            lanes: None,
            error: None,
            reads: decl.body.as_deref().map(analysis::reads).unwrap_or_default(),
            loop_depth: 0,
            control_depth: 0,
        }
    }

    pub fn bind(&mut self, var: &str, adjoint: &str) {
        self.adjoints.insert(var.to_string(), adjoint.to_string());
    }

    /// Zero-initialized adjoint storage: a scalar, or an array of `len`.
    pub fn adjoint_decl(&self, name: &str, len: Option<Expr>) -> Stmt {
        let lanes = self.lanes.as_ref().map(|l| Expr::var(&l.count));
        match (len, lanes) {
            (None, None) => Stmt::let_(name, Type::F64, Some(zero())),
            (None, Some(lanes)) => Stmt::ArrayDecl {
                name: name.to_string(),
                elem: Type::F64,
                len: lanes,
            },
            (Some(len), None) => Stmt::ArrayDecl {
                name: name.to_string(),
                elem: Type::F64,
                len,
            },
            (Some(len), Some(lanes)) => Stmt::ArrayDecl {
                name: name.to_string(),
                elem: Type::F64,
                len: imul(len, lanes),
            },
        }
    }

    fn fail(&self, message: impl Into<String>) -> AutodiffError {
        unsupported(&self.function, message)
    }

    fn hoist(&mut self, prefix: &str, ty: Type) -> String {
        let name = self.names.numbered(prefix);
        self.hoisted.push(Stmt::let_(&name, ty, None));
        name
    }

    fn callee(&self, name: &str, args: &[Expr]) -> Result<FnDecl, AutodiffError> {
        self.engine
            .resolve_call(&self.env, name, args)
            .ok_or_else(|| self.fail(format!("no overload of `{name}` accepts these arguments")))
    }

    fn expr_type(&self, expr: &Expr) -> Option<Type> {
        type_of(expr, &self.env, &|n, a| self.engine.return_type(n, a))
    }

    fn place_type(&self, place: &Place) -> Option<Type> {
        let ty = self.env.get(place.name())?;
        match place {
            Place::Var(_) => Some(ty.value_type().clone()),
            Place::Index(..) => ty.element().cloned(),
        }
    }

    /// Adjoint storage of `place`, lane-indexed in jacobian mode.
    pub fn adj_place(&self, place: &Place) -> Option<Place> {
        let d = self.adjoints.get(place.name())?;
        Some(match (&self.lanes, place) {
            (None, p) => p.renamed(d),
            (Some(l), Place::Var(_)) => Place::Index(d.clone(), Box::new(Expr::var(&l.index))),
            (Some(l), Place::Index(_, idx)) => Place::Index(
                d.clone(),
                Box::new(iadd(imul((**idx).clone(), Expr::var(&l.count)), Expr::var(&l.index))),
            ),
        })
    }

    /// Expressions evaluated during the adjoint sweep must not change state.
    fn check_pure(&self, expr: &Expr) -> Result<(), AutodiffError> {
        let mut problem = None;
        expr.walk(&mut |e| {
            if problem.is_some() {
                return;
            }
            if let Expr::Call(name, args) = e {
                match Intrinsic::from_name(name) {
                    Some(Intrinsic::Push | Intrinsic::Pop) => {
                        problem = Some(format!("`{name}` is not supported in reverse mode"));
                    }
                    Some(_) => {}
                    None => {
                        if let Some(callee) = self.engine.resolve_call(&self.env, name, args) {
                            if self.engine.has_effects(&callee) {
                                problem = Some(format!(
                                    "`{name}` writes through its reference or array parameters and may only be called as a statement"
                                ));
                            }
                        }
                    }
                }
            }
        });
        match problem {
            Some(message) => Err(self.fail(message)),
            None => Ok(()),
        }
    }

    /// Primal and adjoint sweeps of `body`.
    pub fn run(&mut self, body: &[Stmt]) -> Result<Sweeps, AutodiffError> {
        let mut primal = Vec::with_capacity(body.len());
        let mut reversed = Vec::with_capacity(body.len());
        for stmt in body {
            let (p, r) = self.stmt(stmt)?;
            primal.extend(p);
            reversed.push(r);
        }
        Ok((primal, reversed.into_iter().rev().flatten().collect()))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Sweeps, AutodiffError> {
        match stmt {
            Stmt::Let { name, ty, init } => {
                if !ty.is_scalar() {
                    return Err(self.fail(format!("local `{name}` of type {ty} cannot be reversed")));
                }
                self.hoisted.push(Stmt::let_(name, ty.clone(), None));
                if *ty == Type::F64 {
                    let d = self.names.fresh(&format!("_d_{name}"));
                    let decl = self.adjoint_decl(&d, None);
                    self.hoisted.push(decl);
                    self.bind(name, &d);
                }
                let value = init.clone().unwrap_or_else(|| zero_of(ty));
                // Straight-line code declares a local once and nothing
                // earlier can observe it.
                let first = self.loop_depth == 0;
                self.assignment(&Place::Var(name.clone()), AssignOp::Set, &value, first)
            }
            Stmt::ArrayDecl { name, elem, len } => {
                if self.control_depth > 0 {
                    return Err(self.fail(format!("array `{name}` is declared inside a branch or loop")));
                }
                let mut primal = vec![stmt.clone()];
                if *elem == Type::F64 {
                    let d = self.names.fresh(&format!("_d_{name}"));
                    primal.push(self.adjoint_decl(&d, Some(len.clone())));
                    self.bind(name, &d);
                }
                Ok((primal, Vec::new()))
            }
            Stmt::Assign { place, op, value } => self.assignment(place, *op, value, false),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.branch(cond, then_branch, else_branch),
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => self.repeat(init.as_deref(), cond.as_ref(), step.as_deref(), body),
            Stmt::While { cond, body } => self.repeat(None, Some(cond), None, body),
            Stmt::Return(value) => self.ret(value.as_ref()),
            Stmt::Expr(Expr::Call(name, args)) => self.call_stmt(stmt, name, args),
            Stmt::Expr(e) => {
                self.check_pure(e)?;
                Ok((vec![stmt.clone()], Vec::new()))
            }
            Stmt::Block(inner) => self.run(inner),
        }
    }

    fn assignment(&mut self, place: &Place, op: AssignOp, value: &Expr, first: bool) -> Result<Sweeps, AutodiffError> {
        self.check_pure(value)?;
        let ty = self
            .place_type(place)
            .ok_or_else(|| self.fail(format!("unknown variable `{}`", place.name())))?;
        let original = Stmt::assign(place.clone(), op, value.clone());

        if ty == Type::I64 && matches!(value, Expr::Int(_)) && matches!(op, AssignOp::Add | AssignOp::Sub) {
            let inverse = if op == AssignOp::Add { AssignOp::Sub } else { AssignOp::Add };
            return Ok((vec![original], vec![Stmt::assign(place.clone(), inverse, value.clone())]));
        }

        let mut primal = Vec::new();
        let name = place.name();
        let restore = if !first && (self.reads.contains(name) || self.always_save.contains(name)) {
            let (save, restore) = self.save(place, &ty);
            primal.push(save);
            Some(restore)
        } else {
            None
        };
        primal.push(original);

        let mut reverse = Vec::new();
        let adj = if ty == Type::F64 { self.adj_place(place) } else { None };
        if let (Some(adj), Some(sink)) = (&adj, &self.error) {
            reverse.push(sink.term(adj.to_expr(), place.to_expr()));
        }
        reverse.extend(restore);
        if let Some(adj) = adj {
            let group = self.adjoint_group(place, &adj, op, value)?;
            reverse.extend(self.per_lane(group));
        }
        Ok((primal, reverse))
    }

    /// Moves the adjoint of `place` onto the operands of `value`.
    fn adjoint_group(&mut self, place: &Place, adj: &Place, op: AssignOp, value: &Expr) -> Result<Vec<Stmt>, AutodiffError> {
        let r = self.names.numbered("_r_d");
        let seed = Expr::var(&r);
        let (resets, accumulated) = match op {
            AssignOp::Set => (true, self.accumulate(value, &seed)?),
            AssignOp::Add => (false, self.accumulate(value, &seed)?),
            AssignOp::Sub => (false, self.accumulate(value, &neg(seed.clone()))?),
            AssignOp::Mul | AssignOp::Div => {
                let Some(binop) = op.binop() else {
                    return Ok(Vec::new());
                };
                let full = binary(binop, place.to_expr(), value.clone());
                (true, self.accumulate(&full, &seed)?)
            }
        };
        let reset = Stmt::assign(adj.clone(), AssignOp::Set, zero());
        if accumulated.is_empty() {
            return Ok(if resets { vec![reset] } else { Vec::new() });
        }
        self.hoisted.push(Stmt::let_(&r, Type::F64, None));
        let mut group = vec![Stmt::set(&r, adj.to_expr())];
        if resets {
            group.push(reset);
        }
        group.extend(accumulated);
        Ok(group)
    }

    fn per_lane(&self, group: Vec<Stmt>) -> Vec<Stmt> {
        match &self.lanes {
            Some(lanes) if !group.is_empty() => {
                vec![counted_loop(&lanes.index, Expr::var(&lanes.count), group)]
            }
            _ => group,
        }
    }

    /// Slot or tape entry holding the old value of `place`.
    fn save(&mut self, place: &Place, ty: &Type) -> (Stmt, Stmt) {
        if self.loop_depth == 0 {
            let slot = self.hoist("_t", ty.clone());
            (
                Stmt::set(&slot, place.to_expr()),
                Stmt::assign(place.clone(), AssignOp::Set, Expr::var(slot)),
            )
        } else {
            let tape = self.hoist("_t", Type::tape(ty.clone()));
            (
                Stmt::Expr(Expr::call("push", vec![Expr::var(&tape), place.to_expr()])),
                Stmt::assign(place.clone(), AssignOp::Set, Expr::call("pop", vec![Expr::var(tape)])),
            )
        }
    }

    /// Statements adding `seed * d expr / d v` to the adjoint of every `v`.
    pub fn accumulate(&mut self, expr: &Expr, seed: &Expr) -> Result<Vec<Stmt>, AutodiffError> {
        if seed.is_zero() {
            return Ok(Vec::new());
        }
        Ok(match expr {
            Expr::Float(_) | Expr::Int(_) | Expr::Bool(_) | Expr::FnRef(_) => Vec::new(),
            Expr::Var(_) | Expr::Index(..) => expr
                .as_place()
                .and_then(|p| self.adj_place(&p))
                .map(|adj| vec![Stmt::assign(adj, AssignOp::Add, seed.clone())])
                .unwrap_or_default(),
            Expr::Unary(UnOp::Neg, inner) => self.accumulate(inner, &neg(seed.clone()))?,
            Expr::Unary(UnOp::Not, _) => Vec::new(),
            Expr::Binary(op, lhs, rhs) => match rules::partial_seeds(*op, lhs, rhs, seed) {
                Some((to_lhs, to_rhs)) => {
                    let mut out = self.accumulate(lhs, &to_lhs)?;
                    out.extend(self.accumulate(rhs, &to_rhs)?);
                    out
                }
                None => Vec::new(),
            },
            Expr::Call(name, args) => self.call_adjoint(name, args, seed)?,
        })
    }

    fn call_adjoint(&mut self, name: &str, args: &[Expr], seed: &Expr) -> Result<Vec<Stmt>, AutodiffError> {
        match Intrinsic::from_name(name) {
            Some(Intrinsic::Len) => return Ok(Vec::new()),
            Some(_) => return Err(self.fail(format!("`{name}` cannot be differentiated in reverse mode"))),
            None => {}
        }
        let callee = self.callee(name, args)?;
        match self.engine.plan(DerivativeKind::Pullback, &callee, &self.function)? {
            CallPlan::Inactive => Ok(Vec::new()),
            CallPlan::Custom(derivative) => self.pullback_call(&callee, &derivative, args, seed.clone(), false),
            CallPlan::Derived(derivative) => self.pullback_call(&callee, &derivative, args, seed.clone(), true),
            CallPlan::Numerical => {
                let print = self.engine.options().print_numerical_errors;
                let mut out = Vec::new();
                for (k, (param, arg)) in callee.params.iter().zip(args).enumerate() {
                    if param.ty != Type::F64 {
                        continue;
                    }
                    let partial = central_difference(&callee.name, k, print, args, |a| Ok(a.clone()))?;
                    out.extend(self.accumulate(arg, &mul(seed.clone(), partial))?);
                }
                Ok(out)
            }
        }
    }

    /// Call of a pullback with `seed` as the result adjoint. Arguments that
    /// are not plain variables collect their adjoint in a temporary first.
    /// Derived pullbacks also receive the error accumulator, if any.
    fn pullback_call(
        &mut self,
        callee: &FnDecl,
        derivative: &str,
        args: &[Expr],
        seed: Expr,
        derived: bool,
    ) -> Result<Vec<Stmt>, AutodiffError> {
        let mut call_args = args.to_vec();
        if callee.ret == Type::F64 {
            call_args.push(seed);
        }
        let mut out = Vec::new();
        let mut after = Vec::new();
        for (param, arg) in callee.params.iter().zip(args) {
            if adjoint_type(&param.ty).is_none() {
                continue;
            }
            match &param.ty {
                Type::Array { .. } => {
                    let Some((array, d)) = (match arg {
                        Expr::Var(a) => self.adjoints.get(a).map(|d| (a.clone(), d.clone())),
                        _ => None,
                    }) else {
                        return Err(self.fail(format!("array argument to `{}` has no adjoint", callee.name)));
                    };
                    match self.lanes.as_ref().map(|l| (l.count.clone(), l.index.clone())) {
                        None => call_args.push(Expr::var(d)),
                        Some((count, lane)) => {
                            // The pullback sees one lane as a plain adjoint array.
                            let scratch = self.names.numbered("_r");
                            let i = self.names.numbered("_i");
                            let slot = || {
                                Box::new(iadd(imul(Expr::var(&i), Expr::var(&count)), Expr::var(&lane)))
                            };
                            out.push(Stmt::ArrayDecl {
                                name: scratch.clone(),
                                elem: Type::F64,
                                len: len_of(&array),
                            });
                            out.push(counted_loop(
                                &i,
                                len_of(&array),
                                vec![Stmt::assign(
                                    Place::Index(scratch.clone(), Box::new(Expr::var(&i))),
                                    AssignOp::Set,
                                    Expr::Index(d.clone(), slot()),
                                )],
                            ));
                            after.push(counted_loop(
                                &i,
                                len_of(&array),
                                vec![Stmt::assign(
                                    Place::Index(d.clone(), slot()),
                                    AssignOp::Set,
                                    Expr::index(&scratch, Expr::var(&i)),
                                )],
                            ));
                            call_args.push(Expr::var(scratch));
                        }
                    }
                }
                Type::Ref(_) => {
                    let adj = arg
                        .as_place()
                        .and_then(|p| self.adj_place(&p))
                        .ok_or_else(|| self.fail(format!("reference argument to `{}` has no adjoint", callee.name)))?;
                    call_args.push(adj.to_expr());
                }
                _ => match arg.as_place().and_then(|p| self.adj_place(&p)) {
                    Some(adj) => call_args.push(adj.to_expr()),
                    None => {
                        let temp = self.hoist("_r", Type::F64);
                        out.push(Stmt::set(&temp, zero()));
                        call_args.push(Expr::var(&temp));
                        after.extend(self.accumulate(arg, &Expr::var(&temp))?);
                    }
                },
            }
        }
        if let (true, Some(sink)) = (derived, &self.error) {
            call_args.push(sink.accumulator());
        }
        out.push(Stmt::Expr(Expr::call(derivative, call_args)));
        out.extend(after);
        Ok(out)
    }

    /// A call whose value is discarded. Whatever it writes is saved in the
    /// primal sweep and restored before its pullback runs.
    fn call_stmt(&mut self, stmt: &Stmt, name: &str, args: &[Expr]) -> Result<Sweeps, AutodiffError> {
        match Intrinsic::from_name(name) {
            Some(Intrinsic::Push | Intrinsic::Pop) => {
                return Err(self.fail(format!("`{name}` is not supported in reverse mode")));
            }
            Some(_) => return Ok((vec![stmt.clone()], Vec::new())),
            None => {}
        }
        let callee = self.callee(name, args)?;
        let written = self.engine.written_params(&callee);

        let mut primal = Vec::new();
        let mut reverse = Vec::new();
        for (i, (param, arg)) in callee.params.iter().zip(args).enumerate() {
            if !written.contains(&i) {
                continue;
            }
            match &param.ty {
                Type::Ref(_) => {
                    let place = arg
                        .as_place()
                        .ok_or_else(|| self.fail(format!("reference argument to `{name}` must be a variable")))?;
                    let ty = self
                        .place_type(&place)
                        .ok_or_else(|| self.fail(format!("unknown variable `{}`", place.name())))?;
                    let (save, restore) = self.save(&place, &ty);
                    primal.push(save);
                    reverse.push(restore);
                }
                Type::Array { .. } => {
                    if self.control_depth > 0 {
                        return Err(self.fail(format!(
                            "`{name}` writes an array argument inside a branch or loop"
                        )));
                    }
                    let Expr::Var(array) = arg else {
                        return Err(self.fail(format!("array argument to `{name}` must be a variable")));
                    };
                    let elem = self
                        .env
                        .get(array)
                        .and_then(|t| t.element().cloned())
                        .unwrap_or(Type::F64);
                    let copy = self.names.numbered("_t");
                    primal.push(Stmt::ArrayDecl {
                        name: copy.clone(),
                        elem,
                        len: len_of(array),
                    });
                    let save = self.copy_loop(&copy, array);
                    primal.push(save);
                    let restore = self.copy_loop(array, &copy);
                    reverse.push(restore);
                }
                _ => {}
            }
        }
        primal.push(stmt.clone());

        if self.engine.has_effects(&callee) {
            let (derivative, derived) = match self.engine.plan(DerivativeKind::Pullback, &callee, &self.function)? {
                CallPlan::Custom(derivative) => (Some(derivative), false),
                CallPlan::Derived(derivative) => (Some(derivative), true),
                CallPlan::Inactive | CallPlan::Numerical => (None, false),
            };
            if let Some(derivative) = derivative {
                let group = self.pullback_call(&callee, &derivative, args, zero(), derived)?;
                reverse.extend(self.per_lane(group));
            }
        }
        Ok((primal, reverse))
    }

    fn copy_loop(&mut self, dst: &str, src: &str) -> Stmt {
        let i = self.names.numbered("_i");
        let idx = || Box::new(Expr::var(&i));
        let body = vec![Stmt::assign(
            Place::Index(dst.to_string(), idx()),
            AssignOp::Set,
            Expr::Index(src.to_string(), idx()),
        )];
        counted_loop(&i, len_of(src), body)
    }

    fn branch(&mut self, cond: &Expr, then_branch: &[Stmt], else_branch: &[Stmt]) -> Result<Sweeps, AutodiffError> {
        self.check_pure(cond)?;
        self.control_depth += 1;
        let (then_primal, then_reverse) = self.run(then_branch)?;
        let (else_primal, else_reverse) = self.run(else_branch)?;
        self.control_depth -= 1;

        if then_reverse.is_empty() && else_reverse.is_empty() {
            let primal = Stmt::If {
                cond: cond.clone(),
                then_branch: then_primal,
                else_branch: else_primal,
            };
            return Ok((vec![primal], Vec::new()));
        }

        let mut primal = Vec::new();
        let (taken, replayed) = if self.loop_depth == 0 {
            let slot = self.hoist("_cond", Type::Bool);
            primal.push(Stmt::set(&slot, cond.clone()));
            (Expr::var(&slot), Expr::var(&slot))
        } else {
            let tape = self.hoist("_cond", Type::tape(Type::Bool));
            (
                Expr::call("push", vec![Expr::var(&tape), cond.clone()]),
                Expr::call("pop", vec![Expr::var(&tape)]),
            )
        };
        primal.push(Stmt::If {
            cond: taken,
            then_branch: then_primal,
            else_branch: else_primal,
        });
        let reverse = vec![Stmt::If {
            cond: replayed,
            then_branch: then_reverse,
            else_branch: else_reverse,
        }];
        Ok((primal, reverse))
    }

    /// Loops run as `while` with a trip counter; the adjoint sweep replays
    /// the reversed step and body that many times.
    fn repeat(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &[Stmt],
    ) -> Result<Sweeps, AutodiffError> {
        if let Some(cond) = cond {
            self.check_pure(cond)?;
        }
        self.control_depth += 1;
        let (mut primal, init_reverse) = match init {
            Some(s) => self.stmt(s)?,
            None => (Vec::new(), Vec::new()),
        };
        self.loop_depth += 1;
        let (step_primal, step_reverse) = match step {
            Some(s) => self.stmt(s)?,
            None => (Vec::new(), Vec::new()),
        };
        let (body_primal, body_reverse) = self.run(body)?;
        self.loop_depth -= 1;
        self.control_depth -= 1;

        let cond = cond.cloned().unwrap_or(Expr::Bool(true));
        if step_reverse.is_empty() && body_reverse.is_empty() {
            let mut looped = body_primal;
            looped.extend(step_primal);
            primal.push(Stmt::While { cond, body: looped });
            return Ok((primal, init_reverse));
        }

        let counter = self.hoist("_loop", Type::I64);
        let mut looped = vec![Stmt::assign(Place::Var(counter.clone()), AssignOp::Add, Expr::Int(1))];
        looped.extend(body_primal);
        looped.extend(step_primal);
        primal.push(Stmt::set(&counter, Expr::Int(0)));
        primal.push(Stmt::While { cond, body: looped });

        let mut replay_body = step_reverse;
        replay_body.extend(body_reverse);
        let replay = Stmt::For {
            init: None,
            cond: Some(gt(Expr::var(&counter), Expr::Int(0))),
            step: Some(Box::new(Stmt::assign(
                Place::Var(counter.clone()),
                AssignOp::Sub,
                Expr::Int(1),
            ))),
            body: replay_body,
        };

        let mut reverse = Vec::new();
        if self.loop_depth > 0 {
            // Inner trip counts differ per outer iteration.
            let trips = self.hoist("_trips", Type::tape(Type::I64));
            primal.push(Stmt::Expr(Expr::call("push", vec![Expr::var(&trips), Expr::var(&counter)])));
            reverse.push(Stmt::set(&counter, Expr::call("pop", vec![Expr::var(&trips)])));
        }
        reverse.push(replay);
        reverse.extend(init_reverse);
        Ok((primal, reverse))
    }

    fn ret(&mut self, value: Option<&Expr>) -> Result<Sweeps, AutodiffError> {
        let (Some(value), Some(seed)) = (value, self.seed.clone()) else {
            return Ok((Vec::new(), Vec::new()));
        };
        self.check_pure(value)?;
        if self.expr_type(value) != Some(Type::F64) {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut reverse = Vec::new();
        if let Some(sink) = self.error.as_ref().filter(|s| s.counts_returns()) {
            reverse.push(sink.term(seed.clone(), value.clone()));
        }
        reverse.extend(self.accumulate(value, &seed)?);
        Ok((Vec::new(), reverse))
    }
}

fn zero_of(ty: &Type) -> Expr {
    match ty {
        Type::I64 => Expr::Int(0),
        Type::Bool => Expr::Bool(false),
        _ => zero(),
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::Program;
    use crate::autodiff::{differentiate, AutodiffError};
    use crate::config::EngineOptions;
    use crate::eval::{Arg, Callable};
    use crate::parser;
    use crate::registry::{CustomDerivativeRegistry, PRELUDE};
    use crate::request::{DifferentiationRequest, Mode};
    use approx::assert_relative_eq;

    fn program(src: &str) -> Program {
        parser::parse(PRELUDE).expect("prelude").merged(parser::parse(src).expect("parse"))
    }

    fn grad(p: &Program, name: &str, wrt: Option<&str>) -> Result<Callable, AutodiffError> {
        let registry = CustomDerivativeRegistry::from_host(p).expect("registry");
        let target = p.functions.iter().find(|f| f.name == name).expect("target");
        let request = DifferentiationRequest::new(p, target, Mode::Reverse, wrt, 1)?;
        let derived = differentiate(p, &registry, &EngineOptions::default(), &request)?;
        Ok(Callable::new(p, &derived))
    }

    #[test]
    fn overwritten_values_are_restored() {
        let p = program(
            "fn f(x: f64, y: f64) -> f64 {\n\
                 let t: f64 = x * y;\n\
                 t = t * t;\n\
                 t = sin(t) + x;\n\
                 return t;\n\
             }",
        );
        let g = grad(&p, "f", None).expect("grad");
        assert_eq!(g.decl().name, "f_grad");
        let (x, y) = (0.3_f64, 1.7_f64);
        let mut args = [Arg::Scalar(x), Arg::Scalar(y), Arg::Ref(0.0), Arg::Ref(0.0)];
        g.execute(&mut args).expect("run");
        let u = x * y;
        let c = (u * u).cos() * 2.0 * u;
        assert_relative_eq!(args[2].as_ref_value().expect("ref"), c * y + 1.0, epsilon = 1e-12);
        assert_relative_eq!(args[3].as_ref_value().expect("ref"), c * x, epsilon = 1e-12);
    }

    #[test]
    fn loops_and_branches_replay_in_reverse() {
        let p = program(
            "fn f(x: f64, n: i64) -> f64 {\n\
                 let acc: f64 = 1.0;\n\
                 for (let i: i64 = 0; i < n; i += 1) {\n\
                     if (i % 2 == 0) { acc *= x; } else { acc += x * x; }\n\
                 }\n\
                 return acc;\n\
             }",
        );
        let g = grad(&p, "f", Some("x")).expect("grad");
        assert_eq!(g.decl().name, "f_grad");
        // acc: 1 -> x -> x + x^2 -> x^2 + x^3
        let x = 1.5_f64;
        let mut args = [Arg::Scalar(x), Arg::Int(3), Arg::Ref(0.0)];
        g.execute(&mut args).expect("run");
        assert_relative_eq!(args[2].as_ref_value().expect("ref"), 2.0 * x + 3.0 * x * x, epsilon = 1e-12);
    }

    #[test]
    fn adjoint_outputs_accumulate() {
        let p = program("fn f(x: f64) -> f64 { x = x * 3.0; return x; }");
        let g = grad(&p, "f", None).expect("grad");
        let mut args = [Arg::Scalar(2.0), Arg::Ref(10.0)];
        g.execute(&mut args).expect("run");
        assert_eq!(args[1], Arg::Ref(13.0));
    }

    #[test]
    fn array_ranges_and_callees() {
        let p = program(
            "fn sq(v: f64) -> f64 { return v * v; }\n\
             fn total(a: [f64]) -> f64 {\n\
                 let s: f64 = 0.0;\n\
                 for (let i: i64 = 0; i < len(a); i += 1) { s += sq(a[i]); }\n\
                 return s;\n\
             }",
        );
        let g = grad(&p, "total", Some("a[1:2]")).expect("grad");
        let mut args = [Arg::Array(vec![1.0, 2.0, 3.0]), Arg::zeros(2)];
        g.execute(&mut args).expect("run");
        assert_eq!(args[1], Arg::Array(vec![4.0, 6.0]));
        assert_eq!(args[0], Arg::Array(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn return_inside_loop_is_rejected() {
        let p = program(
            "fn f(x: f64) -> f64 {\n\
                 for (let i: i64 = 0; i < 3; i += 1) { if (x > 1.0) { return x; } x *= 2.0; }\n\
                 return x;\n\
             }",
        );
        let err = grad(&p, "f", None).expect_err("rejected");
        assert!(matches!(err, AutodiffError::UnsupportedConstruct { .. }), "{err}");
    }
}
