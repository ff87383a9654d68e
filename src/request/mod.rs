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

//! Differentiation requests and the independent-variable list syntax.
//!
//! A list is a comma separated sequence of entries: a parameter name
//! (`x`), a parameter position (`0`), one array element (`arr[1]`) or an
//! inclusive element range (`arr[0:2]`). Validation happens here, before
//! the engine sees the request.

use std::fmt;
use std::str::FromStr;

use crate::ast::{FnDecl, Type};
use crate::host::Host;
use crate::lexer::{self, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Forward,
    Reverse,
    Hessian,
    Jacobian,
    ErrorEstimate,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Forward => "forward",
            Mode::Reverse => "reverse",
            Mode::Hessian => "hessian",
            Mode::Jacobian => "jacobian",
            Mode::ErrorEstimate => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Ok(Mode::Forward),
            "reverse" | "grad" | "gradient" => Ok(Mode::Reverse),
            "hessian" => Ok(Mode::Hessian),
            "jacobian" => Ok(Mode::Jacobian),
            "error" | "error-estimate" => Ok(Mode::ErrorEstimate),
            other => Err(format!(
                "unknown mode `{other}` (expected forward, reverse, hessian, jacobian or error)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("no independent variables requested for `{function}`")]
    Empty { function: String },
    #[error("`{function}` has no parameter named `{name}`")]
    UnknownParameter { function: String, name: String },
    #[error("parameter index {index} is out of range: `{function}` has {count} parameters")]
    ParameterOutOfRange {
        function: String,
        index: usize,
        count: usize,
    },
    #[error("index {index} is out of range for `{param}` of length {len}")]
    ElementOutOfRange {
        param: String,
        index: usize,
        len: usize,
    },
    #[error("invalid range [{lo}:{hi}] for `{param}`")]
    InvalidRange { param: String, lo: usize, hi: usize },
    #[error("`{param}` is requested more than once (overlapping independent variables)")]
    Overlapping { param: String },
    #[error("`{param}` is a scalar and cannot be indexed")]
    IndexOnScalar { param: String },
    #[error("`{param}` of type {ty} is not differentiable")]
    NotDifferentiable { param: String, ty: Type },
    #[error("forward mode differentiates w.r.t. exactly one scalar, got {count}")]
    ForwardMultiple { count: usize },
    #[error("{mode} mode needs an explicit element range for array `{param}`")]
    MissingRange { param: String, mode: Mode },
    #[error("invalid derivative order {order} for {mode} mode")]
    InvalidOrder { order: u32, mode: Mode },
    #[error("`{function}` writes no array parameter, so it has no jacobian outputs")]
    NoOutputs { function: String },
    #[error("malformed independent variable list `{spec}`: {message}")]
    InvalidSpec { spec: String, message: String },
}

/// One parsed entry of an independent-variable list, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndependentSpec {
    pub param: ParamRef,
    /// Inclusive element range; `arr[1]` is `(1, 1)`.
    pub range: Option<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    Name(String),
    Position(usize),
}

/// A validated independent variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndependentVar {
    pub param: usize,
    pub name: String,
    pub range: Option<(usize, usize)>,
}

impl IndependentVar {
    /// Number of scalars this entry contributes, when statically known.
    pub fn scalar_count(&self) -> Option<usize> {
        self.range.map(|(lo, hi)| hi - lo + 1)
    }
}

#[derive(Debug, Clone)]
pub struct DifferentiationRequest<'a> {
    pub target: &'a FnDecl,
    pub independents: Vec<IndependentVar>,
    pub mode: Mode,
    pub order: u32,
}

impl<'a> DifferentiationRequest<'a> {
    /// Parses `wrt` (or picks the default set when it is `None`) and
    /// validates the result against `target`. `host` resolves the calls
    /// through which `target` may write its output arrays.
    pub fn new(
        host: &dyn Host,
        target: &'a FnDecl,
        mode: Mode,
        wrt: Option<&str>,
        order: u32,
    ) -> Result<Self, RequestError> {
        let specs = match wrt {
            Some(text) => parse_independents(text)?,
            None => default_independents(host, target, mode),
        };
        Self::from_specs(host, target, mode, specs, order)
    }

    pub fn from_specs(
        host: &dyn Host,
        target: &'a FnDecl,
        mode: Mode,
        specs: Vec<IndependentSpec>,
        order: u32,
    ) -> Result<Self, RequestError> {
        if order == 0 || (order > 1 && mode != Mode::Forward) {
            return Err(RequestError::InvalidOrder { order, mode });
        }
        if specs.is_empty() {
            return Err(RequestError::Empty {
                function: target.name.clone(),
            });
        }

        let mut independents: Vec<IndependentVar> = Vec::with_capacity(specs.len());
        for spec in specs {
            let var = validate(target, spec)?;
            // Entries of one parameter are never merged, even when disjoint.
            if independents.iter().any(|o| o.param == var.param) {
                return Err(RequestError::Overlapping { param: var.name });
            }
            independents.push(var);
        }

        match mode {
            Mode::Forward => {
                let count: usize = independents
                    .iter()
                    .map(|v| v.scalar_count().unwrap_or(1))
                    .sum();
                if let [var] = independents.as_slice() {
                    if target.params[var.param].ty.is_array() && var.range.is_none() {
                        return Err(RequestError::MissingRange {
                            param: var.name.clone(),
                            mode,
                        });
                    }
                }
                if count != 1 {
                    return Err(RequestError::ForwardMultiple { count });
                }
            }
            Mode::Hessian | Mode::Jacobian => {
                if let Some(var) = independents
                    .iter()
                    .find(|v| v.range.is_none() && target.params[v.param].ty.is_array())
                {
                    return Err(RequestError::MissingRange {
                        param: var.name.clone(),
                        mode,
                    });
                }
                if mode == Mode::Jacobian {
                    let outputs = output_arrays(host, target);
                    if outputs.is_empty() {
                        return Err(RequestError::NoOutputs {
                            function: target.name.clone(),
                        });
                    }
                    if let Some(var) = independents.iter().find(|v| outputs.contains(&v.param)) {
                        return Err(RequestError::Overlapping {
                            param: var.name.clone(),
                        });
                    }
                }
            }
            Mode::Reverse | Mode::ErrorEstimate => {}
        }

        Ok(Self {
            target,
            independents,
            mode,
            order,
        })
    }

    /// Total independent scalars, when every array entry has a range.
    pub fn scalar_count(&self) -> Option<usize> {
        self.independents
            .iter()
            .map(|v| {
                if self.target.params[v.param].ty.is_array() {
                    v.scalar_count()
                } else {
                    Some(1)
                }
            })
            .sum()
    }
}

fn validate(target: &FnDecl, spec: IndependentSpec) -> Result<IndependentVar, RequestError> {
    let index = match &spec.param {
        ParamRef::Name(name) => target
            .param(name)
            .map(|(i, _)| i)
            .ok_or_else(|| RequestError::UnknownParameter {
                function: target.name.clone(),
                name: name.clone(),
            })?,
        ParamRef::Position(i) => {
            if *i >= target.params.len() {
                return Err(RequestError::ParameterOutOfRange {
                    function: target.name.clone(),
                    index: *i,
                    count: target.params.len(),
                });
            }
            *i
        }
    };
    let param = &target.params[index];
    if !param.ty.is_differentiable() {
        return Err(RequestError::NotDifferentiable {
            param: param.name.clone(),
            ty: param.ty.clone(),
        });
    }
    if let Some((lo, hi)) = spec.range {
        let Type::Array { len, .. } = &param.ty else {
            return Err(RequestError::IndexOnScalar {
                param: param.name.clone(),
            });
        };
        if lo > hi {
            return Err(RequestError::InvalidRange {
                param: param.name.clone(),
                lo,
                hi,
            });
        }
        if let Some(len) = len {
            if hi >= *len {
                return Err(RequestError::ElementOutOfRange {
                    param: param.name.clone(),
                    index: hi,
                    len: *len,
                });
            }
        }
    }
    Ok(IndependentVar {
        param: index,
        name: param.name.clone(),
        range: spec.range,
    })
}

/// Array parameters the function writes, itself or through its callees,
/// and that are therefore results.
pub fn output_arrays(host: &dyn Host, target: &FnDecl) -> Vec<usize> {
    let written = host.written_params(target);
    let mut outputs: Vec<usize> = written
        .into_iter()
        .filter(|&i| target.params[i].ty.is_array() && target.params[i].ty.is_differentiable())
        .collect();
    outputs.sort_unstable();
    outputs
}

/// Every differentiable parameter; jacobian requests leave out the outputs.
/// Arrays with a static length get their full range.
fn default_independents(host: &dyn Host, target: &FnDecl, mode: Mode) -> Vec<IndependentSpec> {
    let outputs = if mode == Mode::Jacobian {
        output_arrays(host, target)
    } else {
        Vec::new()
    };
    target
        .params
        .iter()
        .enumerate()
        .filter(|(i, p)| p.ty.is_differentiable() && !outputs.contains(i))
        .map(|(_, p)| IndependentSpec {
            param: ParamRef::Name(p.name.clone()),
            range: match (&p.ty, mode) {
                (Type::Array { len: Some(n), .. }, Mode::Hessian | Mode::Jacobian) if *n > 0 => {
                    Some((0, n - 1))
                }
                _ => None,
            },
        })
        .collect()
}

/// Parses `"x, 1, arr[2], arr[0:3]"`.
pub fn parse_independents(spec: &str) -> Result<Vec<IndependentSpec>, RequestError> {
    let invalid = |message: String| RequestError::InvalidSpec {
        spec: spec.to_string(),
        message,
    };
    let tokens = lexer::lex(spec)
        .map_err(|span| invalid(format!("unexpected character at offset {}", span.start)))?;
    let mut tokens = tokens.into_iter().map(|(t, _)| t).peekable();
    let mut out = Vec::new();

    let index = |tok: Option<Token>| -> Result<usize, RequestError> {
        match tok {
            Some(Token::Int(v)) if v >= 0 => Ok(v as usize),
            other => Err(invalid(format!("expected a non-negative index, found {other:?}"))),
        }
    };

    while let Some(tok) = tokens.next() {
        let param = match tok {
            Token::Ident(name) => ParamRef::Name(name),
            Token::Int(i) if i >= 0 => ParamRef::Position(i as usize),
            other => return Err(invalid(format!("unexpected {other:?}"))),
        };
        let mut range = None;
        if tokens.peek() == Some(&Token::LBracket) {
            tokens.next();
            let lo = index(tokens.next())?;
            let hi = if tokens.peek() == Some(&Token::Colon) {
                tokens.next();
                index(tokens.next())?
            } else {
                lo
            };
            if tokens.next() != Some(Token::RBracket) {
                return Err(invalid("expected `]`".to_string()));
            }
            range = Some((lo, hi));
        }
        out.push(IndependentSpec { param, range });
        match tokens.next() {
            None => break,
            Some(Token::Comma) => {}
            Some(other) => return Err(invalid(format!("expected `,`, found {other:?}"))),
        }
    }
    Ok(out)
}
