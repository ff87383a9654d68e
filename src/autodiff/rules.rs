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

//! Local derivative rules of the operators, shared by both modes.

use crate::ast::build::{add, div, mul, neg, sub};
use crate::ast::{BinOp, Expr};

/// Tangent of `lhs op rhs` from the operands and their tangents, or `None`
/// for operators with no derivative (comparisons, logic, remainder).
pub(super) fn tangent_binary(op: BinOp, lhs: &Expr, d_lhs: Expr, rhs: &Expr, d_rhs: Expr) -> Option<Expr> {
    Some(match op {
        BinOp::Add => add(d_lhs, d_rhs),
        BinOp::Sub => sub(d_lhs, d_rhs),
        // (uv)' = u'v + uv'
        BinOp::Mul => add(mul(d_lhs, rhs.clone()), mul(lhs.clone(), d_rhs)),
        // (u/v)' = (u'v - uv') / v^2
        BinOp::Div => {
            let numerator = sub(mul(d_lhs, rhs.clone()), mul(lhs.clone(), d_rhs));
            div(numerator, mul(rhs.clone(), rhs.clone()))
        }
        _ => return None,
    })
}

/// Seeds `(for lhs, for rhs)` that `lhs op rhs` passes back to its operands
/// when its own adjoint is `seed`.
pub(super) fn partial_seeds(op: BinOp, lhs: &Expr, rhs: &Expr, seed: &Expr) -> Option<(Expr, Expr)> {
    Some(match op {
        BinOp::Add => (seed.clone(), seed.clone()),
        BinOp::Sub => (seed.clone(), neg(seed.clone())),
        BinOp::Mul => (mul(seed.clone(), rhs.clone()), mul(lhs.clone(), seed.clone())),
        BinOp::Div => (
            div(seed.clone(), rhs.clone()),
            neg(div(mul(seed.clone(), lhs.clone()), mul(rhs.clone(), rhs.clone()))),
        ),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::{one, zero};
    use crate::print::format_expr;

    #[test]
    fn product_and_quotient_rules() {
        let u = Expr::var("u");
        let v = Expr::var("v");
        let t = tangent_binary(BinOp::Mul, &u, one(), &v, zero()).expect("mul");
        assert_eq!(format_expr(&t), "v");
        let t = tangent_binary(BinOp::Div, &u, Expr::var("du"), &v, Expr::var("dv")).expect("div");
        assert_eq!(format_expr(&t), "(du * v - u * dv) / (v * v)");
        assert!(tangent_binary(BinOp::Lt, &u, one(), &v, one()).is_none());
    }

    #[test]
    fn division_seeds() {
        let (l, r) = partial_seeds(BinOp::Div, &Expr::var("u"), &Expr::var("v"), &Expr::var("s"))
            .expect("div");
        assert_eq!(format_expr(&l), "s / v");
        assert_eq!(format_expr(&r), "-(s * u / (v * v))");
    }
}
