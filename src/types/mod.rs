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

use std::collections::HashMap;

use crate::ast::{BinOp, Expr, FnDecl, Stmt, Type, UnOp};

/// Variable name to declared type. Derived functions use unique local names,
/// so a flat map covers a whole body.
pub type TypeEnv = HashMap<String, Type>;

/// Calls the language treats specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Len,
    Push,
    Pop,
    CentralDifference,
}

pub const CENTRAL_DIFFERENCE: &str = "numdiff::central_difference";

impl Intrinsic {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Intrinsic::Len),
            "push" => Some(Intrinsic::Push),
            "pop" => Some(Intrinsic::Pop),
            CENTRAL_DIFFERENCE => Some(Intrinsic::CentralDifference),
            _ => None,
        }
    }
}

/// Conversion cost of passing `arg` to a parameter of type `param`, or
/// `None` when the argument is not accepted. Used to rank overloads.
pub fn accept_cost(param: &Type, arg: &Type) -> Option<u32> {
    match (param, arg) {
        (Type::Ref(inner), Type::Ref(arg_inner)) => accept_exact(inner, arg_inner),
        (Type::Ref(inner), arg) => accept_exact(inner, arg),
        (Type::F64, Type::I64) => Some(1),
        (param, Type::Ref(arg_inner)) => accept_cost(param, arg_inner),
        (param, arg) => accept_exact(param, arg),
    }
}

fn accept_exact(param: &Type, arg: &Type) -> Option<u32> {
    match (param, arg) {
        (Type::Array { elem: pe, len: pl }, Type::Array { elem: ae, len: al }) => {
            if pe != ae {
                return None;
            }
            match (pl, al) {
                (Some(p), Some(a)) if p != a => None,
                _ => Some(0),
            }
        }
        (p, a) if p == a => Some(0),
        _ => None,
    }
}

/// Result type of a binary operator, `None` when the operands do not fit.
pub fn binary_result(op: BinOp, lhs: &Type, rhs: &Type) -> Option<Type> {
    let lhs = lhs.value_type();
    let rhs = rhs.value_type();
    match op {
        BinOp::And | BinOp::Or => {
            (lhs == &Type::Bool && rhs == &Type::Bool).then_some(Type::Bool)
        }
        BinOp::Rem => (lhs == &Type::I64 && rhs == &Type::I64).then_some(Type::I64),
        BinOp::Eq | BinOp::Ne if lhs == &Type::Bool && rhs == &Type::Bool => Some(Type::Bool),
        _ => {
            let numeric = |t: &Type| matches!(t, Type::F64 | Type::I64);
            if !numeric(lhs) || !numeric(rhs) {
                return None;
            }
            if op.is_comparison() {
                Some(Type::Bool)
            } else if lhs == &Type::F64 || rhs == &Type::F64 {
                Some(Type::F64)
            } else {
                Some(Type::I64)
            }
        }
    }
}

/// Static type of `expr`. `callee` resolves a call's return type from its
/// name and argument types.
pub fn type_of(
    expr: &Expr,
    env: &TypeEnv,
    callee: &dyn Fn(&str, &[Type]) -> Option<Type>,
) -> Option<Type> {
    match expr {
        Expr::Float(_) => Some(Type::F64),
        Expr::Int(_) => Some(Type::I64),
        Expr::Bool(_) => Some(Type::Bool),
        Expr::Var(name) => env.get(name).map(|t| t.value_type().clone()),
        Expr::Index(name, _) => env.get(name)?.element().cloned(),
        Expr::Unary(UnOp::Neg, inner) => {
            let ty = type_of(inner, env, callee)?;
            matches!(ty, Type::F64 | Type::I64).then_some(ty)
        }
        Expr::Unary(UnOp::Not, inner) => {
            (type_of(inner, env, callee)? == Type::Bool).then_some(Type::Bool)
        }
        Expr::Binary(op, lhs, rhs) => binary_result(
            *op,
            &type_of(lhs, env, callee)?,
            &type_of(rhs, env, callee)?,
        ),
        Expr::Call(name, args) => match Intrinsic::from_name(name) {
            Some(Intrinsic::Len) => Some(Type::I64),
            Some(Intrinsic::Push) => type_of(args.get(1)?, env, callee),
            Some(Intrinsic::Pop) => match args.first()? {
                Expr::Var(tape) => env.get(tape)?.element().cloned(),
                _ => None,
            },
            Some(Intrinsic::CentralDifference) => Some(Type::F64),
            None => {
                let mut arg_types = Vec::with_capacity(args.len());
                for arg in args {
                    arg_types.push(arg_type(arg, env, callee)?);
                }
                callee(name, &arg_types)
            }
        },
        Expr::FnRef(_) => None,
    }
}

/// Like [`type_of`] but keeps array types for whole-array arguments, which is
/// what overload resolution needs.
pub fn arg_type(
    expr: &Expr,
    env: &TypeEnv,
    callee: &dyn Fn(&str, &[Type]) -> Option<Type>,
) -> Option<Type> {
    if let Expr::Var(name) = expr {
        if let Some(ty) = env.get(name) {
            return Some(ty.value_type().clone());
        }
    }
    type_of(expr, env, callee)
}

pub fn is_float(ty: &Type) -> bool {
    ty.value_type() == &Type::F64
}

/// Parameters plus every local declared anywhere in `decl`'s body.
pub fn collect_env(decl: &FnDecl) -> TypeEnv {
    let mut env: TypeEnv = decl
        .params
        .iter()
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect();
    if let Some(body) = &decl.body {
        for stmt in body {
            stmt.walk(&mut |s| declare(&mut env, s));
        }
    }
    env
}

fn declare(env: &mut TypeEnv, stmt: &Stmt) {
    match stmt {
        Stmt::Let { name, ty, .. } => {
            env.insert(name.clone(), ty.clone());
        }
        Stmt::ArrayDecl { name, elem, .. } => {
            env.insert(name.clone(), Type::array(elem.clone()));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_accept_their_value_type() {
        assert_eq!(accept_cost(&Type::reference(Type::F64), &Type::F64), Some(0));
        assert_eq!(accept_cost(&Type::reference(Type::F64), &Type::I64), None);
        assert_eq!(accept_cost(&Type::F64, &Type::I64), Some(1));
        assert_eq!(accept_cost(&Type::I64, &Type::F64), None);
    }

    #[test]
    fn static_array_lengths_must_agree() {
        let three = Type::Array {
            elem: Box::new(Type::F64),
            len: Some(3),
        };
        let four = Type::Array {
            elem: Box::new(Type::F64),
            len: Some(4),
        };
        assert_eq!(accept_cost(&three, &Type::array(Type::F64)), Some(0));
        assert_eq!(accept_cost(&three, &four), None);
    }

    #[test]
    fn mixed_arithmetic_promotes() {
        assert_eq!(
            binary_result(BinOp::Mul, &Type::I64, &Type::F64),
            Some(Type::F64)
        );
        assert_eq!(binary_result(BinOp::Lt, &Type::F64, &Type::I64), Some(Type::Bool));
        assert_eq!(binary_result(BinOp::Rem, &Type::F64, &Type::I64), None);
    }
}
