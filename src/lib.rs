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

//! adsynth: automatic differentiation by source transformation.
pub mod ast;
pub mod autodiff;
pub mod config;
pub mod conformance;
pub mod diagnostics;
pub mod eval;
pub mod host;
pub mod lexer;
pub mod numdiff;
pub mod opt;
pub mod parser;
pub mod pipeline;
pub mod print;
pub mod registry;
pub mod request;
pub mod type_checker;
pub mod types;

pub use autodiff::{differentiate, AutodiffError, DerivedFunction, Warning};
pub use config::EngineOptions;
pub use pipeline::{compile_source, CompileError, CompileOptions, CompileProducts};
pub use registry::CustomDerivativeRegistry;
pub use request::{DifferentiationRequest, Mode, RequestError};
