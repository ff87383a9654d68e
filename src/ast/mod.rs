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

//! Syntax tree shared by the front end, the differentiation engine and the
//! reference executor.
//!
//! Derived functions are ordinary [`FnDecl`] values built from the same
//! nodes, so everything the engine emits can be printed, re-parsed and run.

pub mod build;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    start: usize,
    end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    F64,
    I64,
    Bool,
    Void,
    /// In/out scalar parameter.
    Ref(Box<Type>),
    /// Array parameter or local buffer; the length is only known statically
    /// when a parameter is declared as `[f64; N]`.
    Array { elem: Box<Type>, len: Option<usize> },
    /// LIFO stack local. Only generated code declares tapes.
    Tape(Box<Type>),
}

impl Type {
    pub fn array(elem: Type) -> Self {
        Type::Array {
            elem: Box::new(elem),
            len: None,
        }
    }

    pub fn reference(inner: Type) -> Self {
        Type::Ref(Box::new(inner))
    }

    pub fn tape(elem: Type) -> Self {
        Type::Tape(Box::new(elem))
    }

    /// Values of this type carry a derivative.
    pub fn is_differentiable(&self) -> bool {
        match self {
            Type::F64 => true,
            Type::Ref(inner) | Type::Tape(inner) => inner.is_differentiable(),
            Type::Array { elem, .. } => elem.is_differentiable(),
            _ => false,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::F64 | Type::I64 | Type::Bool)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    /// Strips one level of reference.
    pub fn value_type(&self) -> &Type {
        match self {
            Type::Ref(inner) => inner,
            other => other,
        }
    }

    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array { elem, .. } | Type::Tape(elem) => Some(elem),
            _ => None,
        }
    }

    /// The type with static array lengths forgotten, used as a matching key.
    pub fn erased(&self) -> Type {
        match self {
            Type::Array { elem, .. } => Type::Array {
                elem: Box::new(elem.erased()),
                len: None,
            },
            Type::Ref(inner) => Type::Ref(Box::new(inner.erased())),
            Type::Tape(inner) => Type::Tape(Box::new(inner.erased())),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::F64 => write!(f, "f64"),
            Type::I64 => write!(f, "i64"),
            Type::Bool => write!(f, "bool"),
            Type::Void => write!(f, "void"),
            Type::Ref(inner) => write!(f, "&{inner}"),
            Type::Array {
                elem,
                len: Some(len),
            } => write!(f, "[{elem}; {len}]"),
            Type::Array { elem, len: None } => write!(f, "[{elem}]"),
            Type::Tape(elem) => write!(f, "tape<{elem}>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    /// Binding strength; larger binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne => 3,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::Rem => 6,
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Float(f64),
    Int(i64),
    Bool(bool),
    Var(String),
    Index(String, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    /// `&name`: a function used as a value (numerical differentiation).
    FnRef(String),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn index(array: impl Into<String>, index: Expr) -> Self {
        Expr::Index(array.into(), Box::new(index))
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(callee.into(), args)
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Expr::Float(v) => *v == 0.0,
            Expr::Int(v) => *v == 0,
            _ => false,
        }
    }

    pub fn is_one(&self) -> bool {
        match self {
            Expr::Float(v) => *v == 1.0,
            Expr::Int(v) => *v == 1,
            _ => false,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Float(_) | Expr::Int(_) | Expr::Bool(_))
    }

    /// The storage location named by this expression, if it is one.
    pub fn as_place(&self) -> Option<Place> {
        match self {
            Expr::Var(name) => Some(Place::Var(name.clone())),
            Expr::Index(name, idx) => Some(Place::Index(name.clone(), idx.clone())),
            _ => None,
        }
    }

    /// Calls `visit` on this expression and every sub-expression.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Index(_, idx) => idx.walk(visit),
            Expr::Unary(_, inner) => inner.walk(visit),
            Expr::Binary(_, lhs, rhs) => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    Var(String),
    Index(String, Box<Expr>),
}

impl Place {
    pub fn name(&self) -> &str {
        match self {
            Place::Var(name) | Place::Index(name, _) => name,
        }
    }

    pub fn to_expr(&self) -> Expr {
        match self {
            Place::Var(name) => Expr::Var(name.clone()),
            Place::Index(name, idx) => Expr::Index(name.clone(), idx.clone()),
        }
    }

    /// Same index, different storage.
    pub fn renamed(&self, name: &str) -> Place {
        match self {
            Place::Var(_) => Place::Var(name.to_string()),
            Place::Index(_, idx) => Place::Index(name.to_string(), idx.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }

    pub fn binop(self) -> Option<BinOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinOp::Add),
            AssignOp::Sub => Some(BinOp::Sub),
            AssignOp::Mul => Some(BinOp::Mul),
            AssignOp::Div => Some(BinOp::Div),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        ty: Type,
        init: Option<Expr>,
    },
    /// `let a: [f64; n];`, zero filled.
    ArrayDecl {
        name: String,
        elem: Type,
        len: Expr,
    },
    Assign {
        place: Place,
        op: AssignOp,
        value: Expr,
    },
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Expr(Expr),
    Block(Vec<Stmt>),
}

impl Stmt {
    pub fn assign(place: Place, op: AssignOp, value: Expr) -> Self {
        Stmt::Assign { place, op, value }
    }

    pub fn set(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            place: Place::Var(name.into()),
            op: AssignOp::Set,
            value,
        }
    }

    pub fn let_(name: impl Into<String>, ty: Type, init: Option<Expr>) -> Self {
        Stmt::Let {
            name: name.into(),
            ty,
            init,
        }
    }

    /// Calls `visit` on every expression reachable from this statement.
    pub fn walk_exprs<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        match self {
            Stmt::Let { init, .. } => {
                if let Some(init) = init {
                    init.walk(visit);
                }
            }
            Stmt::ArrayDecl { len, .. } => len.walk(visit),
            Stmt::Assign { place, value, .. } => {
                if let Place::Index(_, idx) = place {
                    idx.walk(visit);
                }
                value.walk(visit);
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.walk(visit);
                for s in then_branch.iter().chain(else_branch) {
                    s.walk_exprs(visit);
                }
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    init.walk_exprs(visit);
                }
                if let Some(cond) = cond {
                    cond.walk(visit);
                }
                if let Some(step) = step {
                    step.walk_exprs(visit);
                }
                for s in body {
                    s.walk_exprs(visit);
                }
            }
            Stmt::While { cond, body } => {
                cond.walk(visit);
                for s in body {
                    s.walk_exprs(visit);
                }
            }
            Stmt::Return(Some(e)) | Stmt::Expr(e) => e.walk(visit),
            Stmt::Return(None) => {}
            Stmt::Block(body) => {
                for s in body {
                    s.walk_exprs(visit);
                }
            }
        }
    }

    /// Calls `visit` on this statement and every nested statement.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Stmt)) {
        visit(self);
        match self {
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                for s in then_branch.iter().chain(else_branch) {
                    s.walk(visit);
                }
            }
            Stmt::For {
                init, step, body, ..
            } => {
                if let Some(init) = init {
                    init.walk(visit);
                }
                if let Some(step) = step {
                    step.walk(visit);
                }
                for s in body {
                    s.walk(visit);
                }
            }
            Stmt::While { body, .. } | Stmt::Block(body) => {
                for s in body {
                    s.walk(visit);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    /// Fully qualified, e.g. `custom_derivatives::sin_pullback`.
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    /// `None` for `extern` declarations backed by a native implementation.
    pub body: Option<Vec<Stmt>>,
    pub span: Span,
}

impl FnDecl {
    pub fn signature(&self) -> Signature {
        Signature {
            name: self.name.clone(),
            params: self.params.iter().map(|p| p.ty.erased()).collect(),
            ret: self.ret.erased(),
        }
    }

    pub fn param(&self, name: &str) -> Option<(usize, &Param)> {
        self.params.iter().enumerate().find(|(_, p)| p.name == name)
    }

    pub fn is_extern(&self) -> bool {
        self.body.is_none()
    }

    /// Name without its namespace path.
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

pub fn base_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

/// Parameter types plus return type; the key for memoization and custom
/// derivative matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ty}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub functions: Vec<FnDecl>,
}

impl Program {
    pub fn new(functions: Vec<FnDecl>) -> Self {
        Self { functions }
    }

    /// Appends `other`'s functions after this program's.
    pub fn merged(mut self, other: Program) -> Self {
        self.functions.extend(other.functions);
        self
    }
}
