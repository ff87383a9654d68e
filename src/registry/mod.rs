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

//! User supplied derivatives.
//!
//! A function `custom_derivatives::<f>_pushforward` or
//! `custom_derivatives::<f>_pullback` overrides automatic differentiation of
//! every overload of `<f>` whose derivative parameter list it matches. The
//! match is structural: names of the derivative's parameters are free, only
//! their types count.
//!
//! The table sits behind an [`RwLock`] so one registry can serve engines on
//! several threads while new definitions are appended.

pub mod builtins;

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::ast::{FnDecl, Signature, Type};
use crate::host::Host;

pub use builtins::PRELUDE;

/// Namespace reserved for custom derivative definitions.
pub const NAMESPACE: &str = "custom_derivatives";

const PUSHFORWARD_SUFFIX: &str = "_pushforward";
const PULLBACK_SUFFIX: &str = "_pullback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivativeKind {
    Pushforward,
    Pullback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomDerivativeEntry {
    pub original: Signature,
    pub pushforward: Option<FnDecl>,
    pub pullback: Option<FnDecl>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("`{0}` is not named `{NAMESPACE}::<function>_pushforward` or `_pullback`")]
    BadName(String),
    #[error("`{derivative}` matches no overload of `{original}`")]
    NoMatchingOverload { derivative: String, original: String },
    #[error("`{derivative}` redefines the {kind:?} of {original}")]
    Duplicate {
        derivative: String,
        original: Signature,
        kind: DerivativeKind,
    },
}

#[derive(Debug, Default)]
pub struct CustomDerivativeRegistry {
    entries: RwLock<BTreeMap<String, Vec<CustomDerivativeEntry>>>,
}

impl CustomDerivativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every definition in the reserved namespace of `host`.
    pub fn from_host(host: &dyn Host) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for decl in host.functions() {
            if decl.name.starts_with(&format!("{NAMESPACE}::")) && split_name(&decl.name).is_some() {
                registry.register(host, decl.clone())?;
            }
        }
        Ok(registry)
    }

    /// Matches `derivative` against the overloads of its original function
    /// in `host` and records it for each overload it fits.
    pub fn register(&self, host: &dyn Host, derivative: FnDecl) -> Result<(), RegistryError> {
        let (original, kind) =
            split_name(&derivative.name).ok_or_else(|| RegistryError::BadName(derivative.name.clone()))?;
        let params: Vec<Type> = derivative.params.iter().map(|p| p.ty.erased()).collect();

        let matching: Vec<Signature> = host
            .overloads(original)
            .into_iter()
            .map(FnDecl::signature)
            .filter(|sig| {
                let expected = match kind {
                    DerivativeKind::Pushforward => pushforward_params(sig),
                    DerivativeKind::Pullback => pullback_params(sig),
                };
                expected == params
            })
            .collect();
        if matching.is_empty() {
            return Err(RegistryError::NoMatchingOverload {
                derivative: derivative.name.clone(),
                original: original.to_string(),
            });
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let slot = entries.entry(original.to_string()).or_default();
        for sig in matching {
            let index = match slot.iter().position(|e| e.original == sig) {
                Some(i) => i,
                None => {
                    slot.push(CustomDerivativeEntry {
                        original: sig.clone(),
                        pushforward: None,
                        pullback: None,
                    });
                    slot.len() - 1
                }
            };
            let target = match kind {
                DerivativeKind::Pushforward => &mut slot[index].pushforward,
                DerivativeKind::Pullback => &mut slot[index].pullback,
            };
            if target.is_some() {
                return Err(RegistryError::Duplicate {
                    derivative: derivative.name.clone(),
                    original: sig,
                    kind,
                });
            }
            log::debug!("registered {} for {sig}", derivative.name);
            *target = Some(derivative.clone());
        }
        Ok(())
    }

    pub fn entry(&self, original: &Signature) -> Option<CustomDerivativeEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&original.name)?
            .iter()
            .find(|e| &e.original == original)
            .cloned()
    }

    pub fn pushforward_for(&self, original: &Signature) -> Option<FnDecl> {
        self.entry(original)?.pushforward
    }

    pub fn pullback_for(&self, original: &Signature) -> Option<FnDecl> {
        self.entry(original)?.pullback
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn split_name(name: &str) -> Option<(&str, DerivativeKind)> {
    let local = name.strip_prefix(NAMESPACE)?.strip_prefix("::")?;
    if let Some(original) = local.strip_suffix(PUSHFORWARD_SUFFIX) {
        return Some((original, DerivativeKind::Pushforward));
    }
    local
        .strip_suffix(PULLBACK_SUFFIX)
        .map(|original| (original, DerivativeKind::Pullback))
}

/// Tangent type carried alongside a parameter, if it has one.
pub fn tangent_type(ty: &Type) -> Option<Type> {
    if !ty.is_differentiable() {
        return None;
    }
    match ty {
        Type::F64 => Some(Type::F64),
        Type::Ref(_) => Some(Type::reference(Type::F64)),
        Type::Array { .. } => Some(Type::array(Type::F64)),
        _ => None,
    }
}

/// Adjoint output paired with a parameter in a pullback.
pub fn adjoint_type(ty: &Type) -> Option<Type> {
    if !ty.is_differentiable() {
        return None;
    }
    match ty {
        Type::F64 | Type::Ref(_) => Some(Type::reference(Type::F64)),
        Type::Array { .. } => Some(Type::array(Type::F64)),
        _ => None,
    }
}

/// Parameter types of a pushforward for `sig`: the originals, then one
/// tangent per differentiable parameter.
pub fn pushforward_params(sig: &Signature) -> Vec<Type> {
    let mut out = sig.params.clone();
    out.extend(sig.params.iter().filter_map(tangent_type));
    out
}

/// Parameter types of a pullback for `sig`: the originals, the result
/// adjoint when the function returns `f64`, then one adjoint per
/// differentiable parameter.
pub fn pullback_params(sig: &Signature) -> Vec<Type> {
    let mut out = sig.params.clone();
    if sig.ret == Type::F64 {
        out.push(Type::F64);
    }
    out.extend(sig.params.iter().filter_map(adjoint_type));
    out
}
