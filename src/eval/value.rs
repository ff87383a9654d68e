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

use std::fmt;

use crate::ast::Type;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl Value {
    pub fn zero_of(ty: &Type) -> Option<Self> {
        match ty.value_type() {
            Type::F64 => Some(Value::Float(0.0)),
            Type::I64 => Some(Value::Int(0)),
            Type::Bool => Some(Value::Bool(false)),
            _ => None,
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Value::Float(_) => Type::F64,
            Value::Int(_) => Type::I64,
            Value::Bool(_) => Type::Bool,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    /// Converts to storage of type `ty`; integers widen to floats.
    pub fn coerce_to(self, ty: &Type) -> Self {
        match (ty.value_type(), self) {
            (Type::F64, Value::Int(v)) => Value::Float(v as f64),
            _ => self,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", trim_float(*v)),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// One argument of [`Callable::execute`](super::Callable::execute).
/// `Ref` and `Array` are in/out: their contents are written back.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Scalar(f64),
    Int(i64),
    Bool(bool),
    Ref(f64),
    Array(Vec<f64>),
}

impl Arg {
    pub fn zeros(len: usize) -> Self {
        Arg::Array(vec![0.0; len])
    }

    pub fn as_ref_value(&self) -> Option<f64> {
        if let Arg::Ref(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    pub fn as_array(&self) -> Option<&[f64]> {
        if let Arg::Array(v) = self {
            Some(v)
        } else {
            None
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Scalar(v) | Arg::Ref(v) => write!(f, "{}", trim_float(*v)),
            Arg::Int(v) => write!(f, "{v}"),
            Arg::Bool(v) => write!(f, "{v}"),
            Arg::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", trim_float(*v))?;
                }
                write!(f, "]")
            }
        }
    }
}

fn trim_float(x: f64) -> String {
    if x.is_finite() && x == x.trunc() && x.abs() < 1e15 {
        return format!("{x:.0}");
    }
    let s = format!("{x:.12}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_trims_floats() {
        assert_eq!(Arg::Array(vec![6.0, 0.5, 1.0 / 3.0]).to_string(), "[6, 0.5, 0.333333333333]");
        assert_eq!(Value::Float(-2.0).to_string(), "-2");
    }

    #[test]
    fn ints_widen_into_float_storage() {
        assert_eq!(Value::Int(3).coerce_to(&Type::F64), Value::Float(3.0));
        assert_eq!(Value::Int(3).coerce_to(&Type::I64), Value::Int(3));
    }
}
