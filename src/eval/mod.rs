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

//! Reference executor for source programs and derived functions.
//!
//! Every [`Callable::execute`] builds a fresh [`Interpreter`]; storage,
//! tapes included, lives only as long as that call. Scalars live in cells,
//! arrays in buffers; `&f64` parameters bind to a caller's cell or array
//! element, array parameters bind to the caller's buffer.

pub mod natives;
pub mod value;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ast::{BinOp, Expr, FnDecl, Place, Program, Stmt, Type, UnOp};
use crate::autodiff::DerivedFunction;
use crate::host::Host;
use crate::numdiff;
use crate::types::Intrinsic;

pub use natives::{NativeFn, Natives};
pub use value::{Arg, Value};

const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("no overload of `{name}` accepts ({args})")]
    NoOverload { name: String, args: String },
    #[error("no native implementation registered for `{0}`")]
    MissingNative(String),
    #[error("`{function}` expects {expected} arguments, got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("argument `{param}` of `{function}` must be {expected}")]
    ArgumentKind {
        function: String,
        param: String,
        expected: &'static str,
    },
    #[error("unbound variable `{0}`")]
    Unbound(String),
    #[error("index {index} out of bounds for `{name}` of length {len}")]
    IndexOutOfBounds { name: String, index: i64, len: usize },
    #[error("pop from empty tape `{0}`")]
    EmptyTape(String),
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("type error: {0}")]
    Type(String),
    #[error("`{0}` finished without returning a value")]
    MissingReturn(String),
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Cell(usize),
    Element(usize, usize),
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Scalar(Slot),
    Array(usize),
    Tape(usize),
}

/// What a call argument evaluated to, before it meets a parameter.
#[derive(Debug, Clone, Copy)]
enum Operand {
    Value(Value),
    Place(Slot, Value),
    Array(usize),
    Tape(usize),
}

/// A parameter's binding for one activation.
#[derive(Debug, Clone, Copy)]
enum Bound {
    Value(Value),
    Slot(Slot),
    Array(usize),
    Tape(usize),
}

#[derive(Debug)]
struct Buffer {
    elem: Type,
    data: Vec<Value>,
}

enum Flow {
    Normal,
    Return(Option<Value>),
}

#[derive(Clone, Copy)]
struct Marks {
    cells: usize,
    arrays: usize,
    tapes: usize,
}

pub struct Interpreter<'p> {
    functions: &'p [FnDecl],
    natives: Natives,
    cells: Vec<Value>,
    arrays: Vec<Buffer>,
    tapes: Vec<Buffer>,
    frames: Vec<Vec<HashMap<String, Binding>>>,
}

impl<'p> Interpreter<'p> {
    pub fn new(functions: &'p [FnDecl]) -> Self {
        Self::with_natives(functions, natives::standard())
    }

    pub fn with_natives(functions: &'p [FnDecl], natives: Natives) -> Self {
        Self {
            functions,
            natives,
            cells: Vec::new(),
            arrays: Vec::new(),
            tapes: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub fn register_native(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
    ) {
        self.natives.insert(name.into(), Arc::new(f));
    }

    /// Runs `decl` on `args`, writing `Ref` and `Array` arguments back.
    pub fn run(&mut self, decl: &'p FnDecl, args: &mut [Arg]) -> Result<Option<f64>, RuntimeError> {
        if decl.params.len() != args.len() {
            return Err(RuntimeError::Arity {
                function: decl.name.clone(),
                expected: decl.params.len(),
                found: args.len(),
            });
        }
        let mut bound = Vec::with_capacity(args.len());
        for (param, arg) in decl.params.iter().zip(args.iter()) {
            let kind_error = |expected| RuntimeError::ArgumentKind {
                function: decl.name.clone(),
                param: param.name.clone(),
                expected,
            };
            let b = match (&param.ty, arg) {
                (Type::Ref(_), Arg::Ref(v)) => {
                    self.cells.push(Value::Float(*v));
                    Bound::Slot(Slot::Cell(self.cells.len() - 1))
                }
                (Type::Ref(_), _) => return Err(kind_error("an `Arg::Ref`")),
                (Type::Array { elem, .. }, Arg::Array(values)) => {
                    self.arrays.push(Buffer {
                        elem: (**elem).clone(),
                        data: values.iter().map(|v| Value::Float(*v).coerce_to(elem)).collect(),
                    });
                    Bound::Array(self.arrays.len() - 1)
                }
                (Type::Array { .. }, _) => return Err(kind_error("an `Arg::Array`")),
                (Type::F64, Arg::Scalar(v)) => Bound::Value(Value::Float(*v)),
                (Type::F64, Arg::Int(v)) => Bound::Value(Value::Float(*v as f64)),
                (Type::I64, Arg::Int(v)) => Bound::Value(Value::Int(*v)),
                (Type::I64, Arg::Scalar(v)) if v.fract() == 0.0 => Bound::Value(Value::Int(*v as i64)),
                (Type::Bool, Arg::Bool(v)) => Bound::Value(Value::Bool(*v)),
                _ => return Err(kind_error("a value of the declared type")),
            };
            bound.push(b);
        }

        let result = self.call_decl(decl, bound.clone())?;

        for (b, arg) in bound.into_iter().zip(args.iter_mut()) {
            match (b, arg) {
                (Bound::Slot(slot), Arg::Ref(v)) => {
                    *v = self.read(slot).as_f64().unwrap_or(f64::NAN);
                }
                (Bound::Array(id), Arg::Array(values)) => {
                    for (dst, src) in values.iter_mut().zip(&self.arrays[id].data) {
                        *dst = src.as_f64().unwrap_or(f64::NAN);
                    }
                }
                _ => {}
            }
        }
        Ok(result.and_then(|v| v.as_f64()))
    }

    fn call_decl(&mut self, decl: &'p FnDecl, bound: Vec<Bound>) -> Result<Option<Value>, RuntimeError> {
        let Some(body) = &decl.body else {
            return self.call_native(decl, &bound).map(Some);
        };
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(RuntimeError::StackOverflow(MAX_CALL_DEPTH));
        }
        let marks = self.marks();
        let mut scope = HashMap::new();
        for (param, b) in decl.params.iter().zip(bound) {
            let binding = match b {
                Bound::Value(v) => {
                    self.cells.push(v.coerce_to(&param.ty));
                    Binding::Scalar(Slot::Cell(self.cells.len() - 1))
                }
                Bound::Slot(slot) => Binding::Scalar(slot),
                Bound::Array(id) => Binding::Array(id),
                Bound::Tape(id) => Binding::Tape(id),
            };
            scope.insert(param.name.clone(), binding);
        }
        self.frames.push(vec![scope]);
        let flow = self.exec_block(body);
        self.frames.pop();
        self.truncate(marks);

        match flow? {
            Flow::Return(Some(v)) => Ok(Some(v.coerce_to(&decl.ret))),
            Flow::Return(None) | Flow::Normal if decl.ret == Type::Void => Ok(None),
            _ => Err(RuntimeError::MissingReturn(decl.name.clone())),
        }
    }

    fn call_native(&self, decl: &FnDecl, bound: &[Bound]) -> Result<Value, RuntimeError> {
        let native = self
            .natives
            .get(&decl.name)
            .or_else(|| self.natives.get(decl.base_name()))
            .ok_or_else(|| RuntimeError::MissingNative(decl.name.clone()))?;
        let mut args = Vec::with_capacity(bound.len());
        for b in bound {
            let v = match b {
                Bound::Value(v) => v.as_f64(),
                Bound::Slot(slot) => self.read(*slot).as_f64(),
                _ => None,
            };
            args.push(v.ok_or_else(|| {
                RuntimeError::Type(format!("native `{}` takes numeric arguments", decl.name))
            })?);
        }
        Ok(Value::Float(native(&args)))
    }

    fn marks(&self) -> Marks {
        Marks {
            cells: self.cells.len(),
            arrays: self.arrays.len(),
            tapes: self.tapes.len(),
        }
    }

    fn truncate(&mut self, marks: Marks) {
        self.cells.truncate(marks.cells);
        self.arrays.truncate(marks.arrays);
        self.tapes.truncate(marks.tapes);
    }

    fn scopes(&mut self) -> &mut Vec<HashMap<String, Binding>> {
        if self.frames.is_empty() {
            self.frames.push(vec![HashMap::new()]);
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn bind(&mut self, name: &str, binding: Binding) {
        let scopes = self.scopes();
        if scopes.is_empty() {
            scopes.push(HashMap::new());
        }
        if let Some(scope) = scopes.last_mut() {
            scope.insert(name.to_string(), binding);
        }
    }

    fn lookup(&self, name: &str) -> Result<Binding, RuntimeError> {
        self.frames
            .last()
            .and_then(|scopes| scopes.iter().rev().find_map(|s| s.get(name).copied()))
            .ok_or_else(|| RuntimeError::Unbound(name.to_string()))
    }

    fn read(&self, slot: Slot) -> Value {
        match slot {
            Slot::Cell(i) => self.cells[i],
            Slot::Element(a, i) => self.arrays[a].data[i],
        }
    }

    fn store(&mut self, slot: Slot, value: Value) {
        let target = match slot {
            Slot::Cell(i) => &mut self.cells[i],
            Slot::Element(a, i) => &mut self.arrays[a].data[i],
        };
        *target = value.coerce_to(&target.ty());
    }

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, RuntimeError> {
        self.scopes().push(HashMap::new());
        let marks = self.marks();
        let mut flow = Ok(Flow::Normal);
        for stmt in body {
            match self.exec(stmt) {
                Ok(Flow::Normal) => {}
                other => {
                    flow = other;
                    break;
                }
            }
        }
        self.scopes().pop();
        self.truncate(marks);
        flow
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, RuntimeError> {
        match stmt {
            Stmt::Let { name, ty, init } => {
                match ty {
                    Type::Tape(elem) => {
                        self.tapes.push(Buffer {
                            elem: (**elem).clone(),
                            data: Vec::new(),
                        });
                        let id = self.tapes.len() - 1;
                        self.bind(name, Binding::Tape(id));
                    }
                    Type::Array { .. } => match init {
                        Some(Expr::Var(source)) => match self.lookup(source)? {
                            Binding::Array(id) => self.bind(name, Binding::Array(id)),
                            _ => return Err(RuntimeError::Type(format!("`{source}` is not an array"))),
                        },
                        _ => {
                            return Err(RuntimeError::Type(format!(
                                "array local `{name}` needs a length"
                            )))
                        }
                    },
                    _ => {
                        let value = match init {
                            Some(e) => self.eval(e)?.coerce_to(ty),
                            None => Value::zero_of(ty).ok_or_else(|| {
                                RuntimeError::Type(format!("cannot declare `{name}` of type {ty}"))
                            })?,
                        };
                        self.cells.push(value);
                        let slot = Slot::Cell(self.cells.len() - 1);
                        self.bind(name, Binding::Scalar(slot));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ArrayDecl { name, elem, len } => {
                let n = self.eval_int(len)?;
                let zero = Value::zero_of(elem)
                    .ok_or_else(|| RuntimeError::Type(format!("arrays of {elem} are not supported")))?;
                if n < 0 {
                    return Err(RuntimeError::IndexOutOfBounds {
                        name: name.clone(),
                        index: n,
                        len: 0,
                    });
                }
                self.arrays.push(Buffer {
                    elem: elem.clone(),
                    data: vec![zero; n as usize],
                });
                let id = self.arrays.len() - 1;
                self.bind(name, Binding::Array(id));
                Ok(Flow::Normal)
            }
            Stmt::Assign { place, op, value } => {
                let slot = self.slot_of(place)?;
                let rhs = self.eval(value)?;
                let new = match op.binop() {
                    None => rhs,
                    Some(bin) => binary(bin, self.read(slot), rhs)?,
                };
                self.store(slot, new);
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.eval_bool(cond)? {
                    self.exec_block(then_branch)
                } else {
                    self.exec_block(else_branch)
                }
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.scopes().push(HashMap::new());
                let marks = self.marks();
                let flow = self.run_loop(init.as_deref(), cond.as_ref(), step.as_deref(), body);
                self.scopes().pop();
                self.truncate(marks);
                flow
            }
            Stmt::While { cond, body } => self.run_loop(None, Some(cond), None, body),
            Stmt::Return(value) => {
                let value = match value {
                    Some(e) => self.eval_opt(e)?,
                    None => None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Expr(e) => {
                self.eval_opt(e)?;
                Ok(Flow::Normal)
            }
            Stmt::Block(body) => self.exec_block(body),
        }
    }

    fn run_loop(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &[Stmt],
    ) -> Result<Flow, RuntimeError> {
        if let Some(init) = init {
            self.exec(init)?;
        }
        loop {
            if let Some(cond) = cond {
                if !self.eval_bool(cond)? {
                    return Ok(Flow::Normal);
                }
            }
            if let Flow::Return(v) = self.exec_block(body)? {
                return Ok(Flow::Return(v));
            }
            if let Some(step) = step {
                self.exec(step)?;
            }
        }
    }

    fn slot_of(&mut self, place: &Place) -> Result<Slot, RuntimeError> {
        match place {
            Place::Var(name) => match self.lookup(name)? {
                Binding::Scalar(slot) => Ok(slot),
                _ => Err(RuntimeError::Type(format!("`{name}` is not a scalar"))),
            },
            Place::Index(name, idx) => {
                let Binding::Array(id) = self.lookup(name)? else {
                    return Err(RuntimeError::Type(format!("`{name}` is not an array")));
                };
                let index = self.eval_int(idx)?;
                let len = self.arrays[id].data.len();
                if index < 0 || index as usize >= len {
                    return Err(RuntimeError::IndexOutOfBounds {
                        name: name.clone(),
                        index,
                        len,
                    });
                }
                Ok(Slot::Element(id, index as usize))
            }
        }
    }

    fn eval_int(&mut self, expr: &Expr) -> Result<i64, RuntimeError> {
        self.eval(expr)?
            .as_int()
            .ok_or_else(|| RuntimeError::Type("expected an integer".to_string()))
    }

    fn eval_bool(&mut self, expr: &Expr) -> Result<bool, RuntimeError> {
        self.eval(expr)?
            .as_bool()
            .ok_or_else(|| RuntimeError::Type("expected a boolean condition".to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        self.eval_opt(expr)?
            .ok_or_else(|| RuntimeError::Type("a void call has no value".to_string()))
    }

    fn eval_opt(&mut self, expr: &Expr) -> Result<Option<Value>, RuntimeError> {
        let value = match expr {
            Expr::Float(v) => Value::Float(*v),
            Expr::Int(v) => Value::Int(*v),
            Expr::Bool(v) => Value::Bool(*v),
            Expr::Var(_) | Expr::Index(..) => {
                let place = expr
                    .as_place()
                    .ok_or_else(|| RuntimeError::Type("not a place".to_string()))?;
                let slot = self.slot_of(&place)?;
                self.read(slot)
            }
            Expr::Unary(UnOp::Neg, inner) => match self.eval(inner)? {
                Value::Float(v) => Value::Float(-v),
                Value::Int(v) => Value::Int(v.wrapping_neg()),
                Value::Bool(_) => return Err(RuntimeError::Type("cannot negate a boolean".to_string())),
            },
            Expr::Unary(UnOp::Not, inner) => Value::Bool(!self.eval_bool(inner)?),
            Expr::Binary(BinOp::And, lhs, rhs) => Value::Bool(self.eval_bool(lhs)? && self.eval_bool(rhs)?),
            Expr::Binary(BinOp::Or, lhs, rhs) => Value::Bool(self.eval_bool(lhs)? || self.eval_bool(rhs)?),
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                binary(*op, l, r)?
            }
            Expr::Call(name, args) => return self.eval_call(name, args),
            Expr::FnRef(name) => {
                return Err(RuntimeError::Type(format!(
                    "`&{name}` is only valid as a numerical differentiation target"
                )))
            }
        };
        Ok(Some(value))
    }

    fn operand(&mut self, expr: &Expr) -> Result<Operand, RuntimeError> {
        match expr {
            Expr::Var(name) => Ok(match self.lookup(name)? {
                Binding::Scalar(slot) => Operand::Place(slot, self.read(slot)),
                Binding::Array(id) => Operand::Array(id),
                Binding::Tape(id) => Operand::Tape(id),
            }),
            Expr::Index(..) => {
                let place = expr
                    .as_place()
                    .ok_or_else(|| RuntimeError::Type("not a place".to_string()))?;
                let slot = self.slot_of(&place)?;
                Ok(Operand::Place(slot, self.read(slot)))
            }
            other => Ok(Operand::Value(self.eval(other)?)),
        }
    }

    fn operand_type(&self, op: &Operand) -> Type {
        match op {
            Operand::Value(v) | Operand::Place(_, v) => v.ty(),
            Operand::Array(id) => Type::array(self.arrays[*id].elem.clone()),
            Operand::Tape(id) => Type::tape(self.tapes[*id].elem.clone()),
        }
    }

    fn tape_of(&self, expr: Option<&Expr>) -> Result<usize, RuntimeError> {
        match expr {
            Some(Expr::Var(name)) => match self.lookup(name)? {
                Binding::Tape(id) => Ok(id),
                _ => Err(RuntimeError::Type(format!("`{name}` is not a tape"))),
            },
            _ => Err(RuntimeError::Type("expected a tape variable".to_string())),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<Option<Value>, RuntimeError> {
        match Intrinsic::from_name(name) {
            Some(Intrinsic::Len) => {
                let len = match args.first().map(|a| self.operand(a)).transpose()? {
                    Some(Operand::Array(id)) => self.arrays[id].data.len(),
                    Some(Operand::Tape(id)) => self.tapes[id].data.len(),
                    _ => return Err(RuntimeError::Type("len expects an array".to_string())),
                };
                return Ok(Some(Value::Int(len as i64)));
            }
            Some(Intrinsic::Push) => {
                let id = self.tape_of(args.first())?;
                let value_expr = args
                    .get(1)
                    .ok_or_else(|| RuntimeError::Type("push expects a value".to_string()))?;
                let value = self.eval(value_expr)?;
                let tape = &mut self.tapes[id];
                tape.data.push(value.coerce_to(&tape.elem));
                return Ok(Some(value));
            }
            Some(Intrinsic::Pop) => {
                let id = self.tape_of(args.first())?;
                return self.tapes[id].data.pop().map(Some).ok_or_else(|| {
                    let name = match args.first() {
                        Some(Expr::Var(n)) => n.clone(),
                        _ => String::new(),
                    };
                    RuntimeError::EmptyTape(name)
                });
            }
            Some(Intrinsic::CentralDifference) => return self.central_difference(args).map(Some),
            None => {}
        }

        let mut operands = Vec::with_capacity(args.len());
        for arg in args {
            operands.push(self.operand(arg)?);
        }
        let types: Vec<Type> = operands.iter().map(|o| self.operand_type(o)).collect();
        let functions: &'p [FnDecl] = self.functions;
        let decl = functions.resolve(name, &types).ok_or_else(|| {
            if functions.overloads(name).is_empty() {
                RuntimeError::UnknownFunction(name.to_string())
            } else {
                RuntimeError::NoOverload {
                    name: name.to_string(),
                    args: types.iter().map(Type::to_string).collect::<Vec<_>>().join(", "),
                }
            }
        })?;

        let mut bound = Vec::with_capacity(operands.len());
        for (param, op) in decl.params.iter().zip(operands) {
            let kind_error = |expected| RuntimeError::ArgumentKind {
                function: decl.name.clone(),
                param: param.name.clone(),
                expected,
            };
            bound.push(match (&param.ty, op) {
                (Type::Ref(_), Operand::Place(slot, _)) => Bound::Slot(slot),
                (Type::Ref(_), _) => return Err(kind_error("a variable or array element")),
                (Type::Array { .. }, Operand::Array(id)) => Bound::Array(id),
                (Type::Array { .. }, _) => return Err(kind_error("an array variable")),
                (Type::Tape(_), Operand::Tape(id)) => Bound::Tape(id),
                (ty, Operand::Value(v) | Operand::Place(_, v)) => Bound::Value(v.coerce_to(ty)),
                _ => return Err(kind_error("a scalar")),
            });
        }
        self.call_decl(decl, bound)
    }

    /// `numdiff::central_difference(&g, k, print, args...)`
    fn central_difference(&mut self, args: &[Expr]) -> Result<Value, RuntimeError> {
        let [Expr::FnRef(target), k, print, rest @ ..] = args else {
            return Err(RuntimeError::Type(
                "central_difference expects (&function, index, print, args...)".to_string(),
            ));
        };
        let k = self.eval_int(k)?;
        let print = self.eval_bool(print)?;
        let mut values = Vec::with_capacity(rest.len());
        for arg in rest {
            let value = self.eval(arg)?;
            if value.as_f64().is_none() {
                return Err(RuntimeError::Type("numerical arguments must be numbers".to_string()));
            }
            values.push(value);
        }
        if k < 0 || k as usize >= values.len() {
            return Err(RuntimeError::IndexOutOfBounds {
                name: target.clone(),
                index: k,
                len: values.len(),
            });
        }
        let k = k as usize;
        let types: Vec<Type> = values.iter().map(Value::ty).collect();
        let functions: &'p [FnDecl] = self.functions;
        let decl = functions
            .resolve(target, &types)
            .ok_or_else(|| RuntimeError::UnknownFunction(target.clone()))?;

        // Only argument `k` moves; integer arguments keep their values.
        let x = values[k].as_f64().unwrap_or_default();
        let estimate = numdiff::five_point(
            |xk| {
                let bound = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Bound::Value(if i == k { Value::Float(xk) } else { *v }))
                    .collect();
                self.call_decl(decl, bound)?
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| RuntimeError::MissingReturn(decl.name.clone()))
            },
            x,
        )?;
        if print {
            log::info!(
                "numerical derivative of {target} w.r.t. argument {k}: {} (step {:e}, truncation error {:e}, rounding error {:e})",
                estimate.derivative,
                estimate.step,
                estimate.truncation,
                estimate.rounding
            );
        }
        Ok(Value::Float(estimate.derivative))
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, RuntimeError> {
    use Value::{Bool, Float, Int};
    let mismatch = || RuntimeError::Type(format!("operator `{}` on {} and {}", op.symbol(), l.ty(), r.ty()));
    Ok(match (op, l, r) {
        (BinOp::And, Bool(a), Bool(b)) => Bool(a && b),
        (BinOp::Or, Bool(a), Bool(b)) => Bool(a || b),
        (BinOp::Eq, Bool(a), Bool(b)) => Bool(a == b),
        (BinOp::Ne, Bool(a), Bool(b)) => Bool(a != b),
        (_, Bool(_), _) | (_, _, Bool(_)) => return Err(mismatch()),
        (BinOp::Rem, Int(_), Int(0)) | (BinOp::Div, Int(_), Int(0)) => {
            return Err(RuntimeError::DivisionByZero)
        }
        (BinOp::Rem, Int(a), Int(b)) => Int(a.wrapping_rem(b)),
        (BinOp::Rem, ..) => return Err(mismatch()),
        (op, Int(a), Int(b)) => match op {
            BinOp::Add => Int(a.wrapping_add(b)),
            BinOp::Sub => Int(a.wrapping_sub(b)),
            BinOp::Mul => Int(a.wrapping_mul(b)),
            BinOp::Div => Int(a.wrapping_div(b)),
            BinOp::Lt => Bool(a < b),
            BinOp::Le => Bool(a <= b),
            BinOp::Gt => Bool(a > b),
            BinOp::Ge => Bool(a >= b),
            BinOp::Eq => Bool(a == b),
            BinOp::Ne => Bool(a != b),
            _ => return Err(mismatch()),
        },
        (op, l, r) => {
            let (a, b) = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(mismatch()),
            };
            match op {
                BinOp::Add => Float(a + b),
                BinOp::Sub => Float(a - b),
                BinOp::Mul => Float(a * b),
                BinOp::Div => Float(a / b),
                BinOp::Lt => Bool(a < b),
                BinOp::Le => Bool(a <= b),
                BinOp::Gt => Bool(a > b),
                BinOp::Ge => Bool(a >= b),
                BinOp::Eq => Bool(a == b),
                BinOp::Ne => Bool(a != b),
                _ => return Err(mismatch()),
            }
        }
    })
}

/// A function bound to the program it runs in, invoked once per
/// [`execute`](Callable::execute) with fresh storage.
#[derive(Clone)]
pub struct Callable {
    functions: Vec<FnDecl>,
    entry: usize,
    natives: Natives,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("entry", &self.decl().name)
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl Callable {
    /// Binds a derived function together with its support functions.
    pub fn new(program: &Program, derived: &DerivedFunction) -> Self {
        let mut functions = program.functions.clone();
        functions.extend(derived.support.iter().cloned());
        functions.push(derived.decl.clone());
        Self {
            entry: functions.len() - 1,
            functions,
            natives: natives::standard(),
        }
    }

    /// Binds the first definition named `name` in `program`.
    pub fn for_function(program: &Program, name: &str) -> Result<Self, RuntimeError> {
        let entry = program
            .functions
            .iter()
            .position(|f| f.name == name && !f.is_extern())
            .ok_or_else(|| RuntimeError::UnknownFunction(name.to_string()))?;
        Ok(Self {
            functions: program.functions.clone(),
            entry,
            natives: natives::standard(),
        })
    }

    pub fn decl(&self) -> &FnDecl {
        &self.functions[self.entry]
    }

    pub fn register_native(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
    ) {
        self.natives.insert(name.into(), Arc::new(f));
    }

    /// Runs the function. Arguments follow the parameter list; `Ref` and
    /// `Array` arguments are read before and written back after the call.
    pub fn execute(&self, args: &mut [Arg]) -> Result<Option<f64>, RuntimeError> {
        let mut interp = Interpreter::with_natives(&self.functions, self.natives.clone());
        interp.run(&self.functions[self.entry], args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::registry::PRELUDE;

    fn program(src: &str) -> Program {
        parser::parse(PRELUDE).expect("prelude").merged(parser::parse(src).expect("parse"))
    }

    #[test]
    fn loops_refs_and_arrays() {
        let p = program(
            "fn scale(a: [f64], k: f64, total: &f64) {\n\
                 for (let i: i64 = 0; i < len(a); i += 1) { a[i] *= k; total += a[i]; }\n\
             }",
        );
        let f = Callable::for_function(&p, "scale").expect("found");
        let mut args = [Arg::Array(vec![1.0, 2.0, 3.0]), Arg::Scalar(2.0), Arg::Ref(1.0)];
        assert_eq!(f.execute(&mut args).expect("run"), None);
        assert_eq!(args[0], Arg::Array(vec![2.0, 4.0, 6.0]));
        assert_eq!(args[2], Arg::Ref(13.0));
    }

    #[test]
    fn tapes_are_lifo_and_local() {
        let p = program(
            "fn f(x: f64) -> f64 {\n\
                 let t: tape<f64>;\n\
                 push(t, x); push(t, 2.0 * x);\n\
                 let a: f64 = pop(t);\n\
                 return a - pop(t);\n\
             }",
        );
        let f = Callable::for_function(&p, "f").expect("found");
        assert_eq!(f.execute(&mut [Arg::Scalar(3.0)]).expect("run"), Some(3.0));
        assert_eq!(f.execute(&mut [Arg::Scalar(3.0)]).expect("run"), Some(3.0));
    }

    #[test]
    fn empty_tape_and_bad_index_are_errors() {
        let p = program(
            "fn pop_empty() -> f64 { let t: tape<f64>; return pop(t); }\n\
             fn oob(a: [f64]) -> f64 { return a[3]; }",
        );
        let pop_empty = Callable::for_function(&p, "pop_empty").expect("found");
        assert!(matches!(pop_empty.execute(&mut []), Err(RuntimeError::EmptyTape(_))));
        let oob = Callable::for_function(&p, "oob").expect("found");
        assert!(matches!(
            oob.execute(&mut [Arg::zeros(2)]),
            Err(RuntimeError::IndexOutOfBounds { index: 3, len: 2, .. })
        ));
    }

    #[test]
    fn central_difference_intrinsic() {
        let p = program(
            "fn g(x: f64, y: f64) -> f64 { return x * x * y; }\n\
             fn f(x: f64, y: f64) -> f64 { return numdiff::central_difference(&g, 0, false, x, y); }",
        );
        let f = Callable::for_function(&p, "f").expect("found");
        let d = f.execute(&mut [Arg::Scalar(3.0), Arg::Scalar(2.0)]).expect("run");
        approx::assert_abs_diff_eq!(d.expect("value"), 12.0, epsilon = 1e-7);
    }

    #[test]
    fn custom_natives() {
        let p = program("extern fn twice(x: f64) -> f64;\nfn f(x: f64) -> f64 { return twice(x) + sin(0.0); }");
        let mut f = Callable::for_function(&p, "f").expect("found");
        f.register_native("twice", |a: &[f64]| 2.0 * a[0]);
        assert_eq!(f.execute(&mut [Arg::Scalar(4.0)]).expect("run"), Some(8.0));
    }
}
