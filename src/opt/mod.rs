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

//! Source-level passes run before synthesis.

pub mod analysis;
pub mod rename;
pub mod returns;

use crate::ast::FnDecl;

pub use rename::NameGen;
pub use returns::ReturnInLoop;

/// Unique local names, flat blocks and returns in tail position: the shape
/// reverse-mode synthesis works on.
pub fn canonicalize(decl: &FnDecl) -> Result<FnDecl, ReturnInLoop> {
    let mut decl = rename::unique_locals(decl);
    if let Some(body) = decl.body.take() {
        let body = returns::lift_returns(body)?;
        decl.body = Some(rename::flatten_blocks(body));
    }
    Ok(decl)
}
