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

use std::collections::{HashMap, HashSet};

use super::{forward, reverse, AutodiffError, DerivedFunction, Warning};
use crate::ast::{Expr, FnDecl, Signature, Type};
use crate::config::EngineOptions;
use crate::host::Host;
use crate::opt::analysis::{self, exits_cleanly};
use crate::opt::NameGen;
use crate::registry::{CustomDerivativeRegistry, DerivativeKind};
use crate::request::Mode;
use crate::types::{arg_type, TypeEnv};

/// How a call site is differentiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPlan {
    /// No differentiable parameter: the derivative is zero.
    Inactive,
    /// A user supplied derivative function.
    Custom(String),
    /// A derivative the engine synthesized from the callee's body.
    Derived(String),
    /// Finite differences through `numdiff::central_difference`.
    Numerical,
}

type Key = (DerivativeKind, Signature);

/// State of one differentiation request.
///
/// Owns the derived support functions, the memo of finished derivations and
/// the chain of derivations in progress, which is how recursion is detected.
pub struct Engine<'a> {
    host: &'a dyn Host,
    registry: &'a CustomDerivativeRegistry,
    options: EngineOptions,
    support: Vec<FnDecl>,
    memo: HashMap<Key, String>,
    in_progress: Vec<(Key, String)>,
    plans: HashMap<Key, CallPlan>,
    warnings: Vec<Warning>,
    function_names: NameGen,
    /// Machine epsilon when derived pullbacks feed an error accumulator.
    error_epsilon: Option<f64>,
}

impl<'a> Engine<'a> {
    pub fn new(host: &'a dyn Host, registry: &'a CustomDerivativeRegistry, options: EngineOptions) -> Self {
        let mut function_names = NameGen::new();
        for decl in host.functions() {
            function_names.reserve(&decl.name);
        }
        Self {
            host,
            registry,
            options,
            support: Vec::new(),
            memo: HashMap::new(),
            in_progress: Vec::new(),
            plans: HashMap::new(),
            warnings: Vec::new(),
            function_names,
            error_epsilon: None,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn support(&self) -> &[FnDecl] {
        &self.support
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn registry(&self) -> &CustomDerivativeRegistry {
        self.registry
    }

    /// Makes every pullback derived from now on take a trailing error
    /// accumulator. Called before anything is derived.
    pub(crate) fn track_errors(&mut self, epsilon: f64) {
        debug_assert!(self.memo.is_empty());
        self.error_epsilon = Some(epsilon);
    }

    pub(crate) fn error_epsilon(&self) -> Option<f64> {
        self.error_epsilon
    }

    pub fn finish(self, mode: Mode, decl: FnDecl) -> DerivedFunction {
        DerivedFunction {
            mode,
            decl,
            support: self.support,
            warnings: self.warnings,
        }
    }

    /// Host-language identifier for a new function, unique in the program.
    pub(crate) fn function_name(&mut self, base: &str) -> String {
        self.function_names.fresh(&base.replace("::", "_"))
    }

    pub(crate) fn add_support(&mut self, decl: FnDecl) {
        self.function_names.reserve(&decl.name);
        self.support.push(decl);
    }

    /// Overload of `name` accepting `args`, derived functions first.
    pub(crate) fn resolve(&self, name: &str, args: &[Type]) -> Option<FnDecl> {
        Host::resolve(self, name, args).cloned()
    }

    pub(crate) fn return_type(&self, name: &str, args: &[Type]) -> Option<Type> {
        self.resolve(name, args).map(|d| d.ret)
    }

    /// Resolves a call appearing in a body whose variables are typed by `env`.
    pub(crate) fn resolve_call(&self, env: &TypeEnv, name: &str, args: &[Expr]) -> Option<FnDecl> {
        let callee = |n: &str, a: &[Type]| self.return_type(n, a);
        let types = args
            .iter()
            .map(|a| arg_type(a, env, &callee))
            .collect::<Option<Vec<_>>>()?;
        self.resolve(name, &types)
    }

    /// Positions of reference and array parameters `decl` may write,
    /// following calls into derived functions as well as the host program.
    pub(crate) fn written_params(&self, decl: &FnDecl) -> HashSet<usize> {
        Host::written_params(self, decl)
    }

    /// Parameter names `decl` assigns, including through calls.
    pub(crate) fn modified_params(&self, decl: &FnDecl) -> HashSet<String> {
        let mut out = analysis::params_written(decl);
        out.extend(self.written_params(decl).into_iter().map(|i| decl.params[i].name.clone()));
        out
    }

    /// True when a call to `decl` can change its caller's differentiable state.
    pub(crate) fn has_effects(&self, decl: &FnDecl) -> bool {
        self.written_params(decl)
            .into_iter()
            .any(|i| decl.params[i].ty.is_differentiable())
    }

    /// Picks the derivative used for calls to `callee` from `caller`. Plans
    /// are cached for the rest of the request.
    pub(crate) fn plan(
        &mut self,
        kind: DerivativeKind,
        callee: &FnDecl,
        caller: &str,
    ) -> Result<CallPlan, AutodiffError> {
        let key = (kind, callee.signature());
        let plan = match self.plans.get(&key) {
            Some(plan) => plan.clone(),
            None => {
                let plan = self.choose(kind, callee, caller)?;
                self.plans.insert(key, plan.clone());
                plan
            }
        };
        if plan == CallPlan::Numerical {
            self.warn_numerical(caller, &callee.name);
        }
        Ok(plan)
    }

    fn choose(
        &mut self,
        kind: DerivativeKind,
        callee: &FnDecl,
        caller: &str,
    ) -> Result<CallPlan, AutodiffError> {
        if !callee.params.iter().any(|p| p.ty.is_differentiable()) {
            return Ok(CallPlan::Inactive);
        }
        let sig = callee.signature();
        let custom = match kind {
            DerivativeKind::Pushforward => self.registry.pushforward_for(&sig),
            DerivativeKind::Pullback => self.registry.pullback_for(&sig),
        };
        if let Some(custom) = custom {
            return Ok(CallPlan::Custom(custom.name));
        }
        let eligible = callee.ret == Type::F64
            && callee.params.iter().all(|p| matches!(p.ty, Type::F64 | Type::I64));
        if callee.body.is_some() {
            return match self.derive(kind, callee) {
                Ok(name) => Ok(CallPlan::Derived(name)),
                Err(AutodiffError::UnsupportedConstruct { function, message })
                    if eligible && self.options.numerical_fallback =>
                {
                    log::debug!("falling back to numerics for `{sig}`: cannot differentiate `{function}`: {message}");
                    Ok(CallPlan::Numerical)
                }
                Err(err) => Err(err),
            };
        }
        if !eligible {
            return Err(super::unsupported(
                caller,
                format!("`{sig}` has no body, no custom derivative and does not qualify for numerical differentiation"),
            ));
        }
        if !self.options.numerical_fallback {
            return Err(super::unsupported(
                caller,
                format!("`{sig}` has no derivative and numerical fallback is disabled"),
            ));
        }
        Ok(CallPlan::Numerical)
    }

    fn warn_numerical(&mut self, function: &str, callee: &str) {
        let warning = Warning::NumericalFallback {
            function: function.to_string(),
            callee: callee.to_string(),
        };
        if !self.warnings.contains(&warning) {
            log::warn!("{warning}");
            self.warnings.push(warning);
        }
    }

    /// Name of the pushforward or pullback of `callee`, synthesizing it if
    /// this request has not done so yet.
    pub(crate) fn derive(&mut self, kind: DerivativeKind, callee: &FnDecl) -> Result<String, AutodiffError> {
        let key = (kind, callee.signature());
        if let Some(name) = self.memo.get(&key) {
            return Ok(name.clone());
        }
        if let Some(pos) = self.in_progress.iter().position(|(k, _)| *k == key) {
            return self.close_cycle(pos, callee);
        }
        if self.in_progress.len() >= self.options.max_derivation_depth {
            let mut chain = self.chain_from(0);
            chain.push(callee.name.clone());
            return Err(AutodiffError::DepthLimit {
                limit: self.options.max_derivation_depth,
                chain,
            });
        }

        let suffix = match kind {
            DerivativeKind::Pushforward => "pushforward",
            DerivativeKind::Pullback => "pullback",
        };
        let name = self.function_name(&format!("{}_{suffix}", callee.name));
        log::debug!("deriving {name} from {}", callee.signature());
        let mark = (self.support.len(), self.warnings.len());
        self.in_progress.push((key.clone(), name.clone()));
        let result = match kind {
            DerivativeKind::Pushforward => forward::pushforward(self, callee, &name),
            DerivativeKind::Pullback => reverse::pullback(self, callee, &name),
        };
        self.in_progress.pop();
        let decl = match result {
            Ok(decl) => decl,
            Err(err) => {
                self.discard_since(mark);
                return Err(err);
            }
        };
        self.memo.insert(key, name.clone());
        self.add_support(decl);
        Ok(name)
    }

    /// Drops what a failed derivation left behind. Support functions
    /// derived meanwhile may call the one that failed.
    fn discard_since(&mut self, (support, warnings): (usize, usize)) {
        let dropped: HashSet<String> = self.support.drain(support..).map(|d| d.name).collect();
        self.warnings.truncate(warnings);
        self.memo.retain(|_, name| !dropped.contains(name));
        self.plans
            .retain(|_, plan| !matches!(plan, CallPlan::Derived(name) if dropped.contains(name)));
    }

    /// `callee` is already being derived at position `pos` of the chain. The
    /// recursion is accepted if `callee` can return without re-entering any
    /// function of the cycle.
    fn close_cycle(&self, pos: usize, callee: &FnDecl) -> Result<String, AutodiffError> {
        let cycle: HashSet<&str> = self.in_progress[pos..]
            .iter()
            .map(|((_, sig), _)| sig.name.as_str())
            .collect();
        let terminates = callee
            .body
            .as_deref()
            .is_some_and(|body| exits_cleanly(body, &|name| cycle.contains(name)));
        if terminates {
            return Ok(self.in_progress[pos].1.clone());
        }
        let mut chain = self.chain_from(pos);
        chain.push(callee.name.clone());
        Err(AutodiffError::UnboundedRecursion {
            callee: callee.name.clone(),
            chain,
        })
    }

    fn chain_from(&self, pos: usize) -> Vec<String> {
        self.in_progress[pos..]
            .iter()
            .map(|((_, sig), _)| sig.name.clone())
            .collect()
    }
}

impl Host for Engine<'_> {
    fn functions(&self) -> &[FnDecl] {
        self.host.functions()
    }

    fn resolve(&self, name: &str, args: &[Type]) -> Option<&FnDecl> {
        self.support
            .as_slice()
            .resolve(name, args)
            .or_else(|| self.host.resolve(name, args))
    }
}
