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

//! Expression constructors used by the synthesizers.
//!
//! Only literal zeros and ones are folded. Anything else is emitted as
//! written so the derived code mirrors the derivative rules one to one.

use super::{BinOp, Expr, UnOp};

pub fn zero() -> Expr {
    Expr::Float(0.0)
}

pub fn one() -> Expr {
    Expr::Float(1.0)
}

pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
}

pub fn add(lhs: Expr, rhs: Expr) -> Expr {
    if lhs.is_zero() {
        return rhs;
    }
    if rhs.is_zero() {
        return lhs;
    }
    binary(BinOp::Add, lhs, rhs)
}

pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
    if rhs.is_zero() {
        return lhs;
    }
    if lhs.is_zero() {
        return neg(rhs);
    }
    binary(BinOp::Sub, lhs, rhs)
}

pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
    if lhs.is_zero() || rhs.is_zero() {
        return zero();
    }
    if lhs.is_one() {
        return rhs;
    }
    if rhs.is_one() {
        return lhs;
    }
    binary(BinOp::Mul, lhs, rhs)
}

pub fn div(lhs: Expr, rhs: Expr) -> Expr {
    if lhs.is_zero() {
        return zero();
    }
    if rhs.is_one() {
        return lhs;
    }
    binary(BinOp::Div, lhs, rhs)
}

pub fn neg(inner: Expr) -> Expr {
    match inner {
        Expr::Float(v) if v == 0.0 => zero(),
        Expr::Int(0) => zero(),
        Expr::Unary(UnOp::Neg, inner) => *inner,
        other => Expr::Unary(UnOp::Neg, Box::new(other)),
    }
}

pub fn lt(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinOp::Lt, lhs, rhs)
}

pub fn gt(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinOp::Gt, lhs, rhs)
}

/// Integer arithmetic without folding, for index expressions.
pub fn iadd(lhs: Expr, rhs: Expr) -> Expr {
    match (&lhs, &rhs) {
        (_, Expr::Int(0)) => lhs,
        (Expr::Int(0), _) => rhs,
        (Expr::Int(a), Expr::Int(b)) => Expr::Int(a + b),
        _ => binary(BinOp::Add, lhs, rhs),
    }
}

pub fn imul(lhs: Expr, rhs: Expr) -> Expr {
    match (&lhs, &rhs) {
        (Expr::Int(0), _) | (_, Expr::Int(0)) => Expr::Int(0),
        (Expr::Int(1), _) => rhs,
        (_, Expr::Int(1)) => lhs,
        (Expr::Int(a), Expr::Int(b)) => Expr::Int(a * b),
        _ => binary(BinOp::Mul, lhs, rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_only_trivial_literals() {
        let x = Expr::var("x");
        assert_eq!(mul(zero(), x.clone()), zero());
        assert_eq!(mul(one(), x.clone()), x);
        assert_eq!(add(x.clone(), zero()), x);
        assert_eq!(sub(zero(), x.clone()), Expr::Unary(UnOp::Neg, Box::new(x.clone())));
        assert_eq!(neg(neg(x.clone())), x);
        assert_eq!(
            mul(Expr::Float(2.0), Expr::Float(3.0)),
            binary(BinOp::Mul, Expr::Float(2.0), Expr::Float(3.0))
        );
    }
}
