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

use crate::ast::Stmt;
use crate::opt::analysis::contains_return;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`return` inside a loop cannot be moved to the end of the function")]
pub struct ReturnInLoop;

/// Moves every `return` to tail position. Statements following an `if`
/// that returns on some path are copied into both branches, and anything
/// after an unconditional `return` is dropped as unreachable. Expects
/// unique local names (blocks are spliced).
pub fn lift_returns(body: Vec<Stmt>) -> Result<Vec<Stmt>, ReturnInLoop> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.into_iter();
    while let Some(stmt) = iter.next() {
        match stmt {
            Stmt::Return(_) => {
                out.push(stmt);
                return Ok(out);
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } if contains_return(&then_branch) || contains_return(&else_branch) => {
                let rest: Vec<Stmt> = iter.collect();
                let then_branch = lift_returns(then_branch.into_iter().chain(rest.clone()).collect())?;
                let else_branch = lift_returns(else_branch.into_iter().chain(rest).collect())?;
                out.push(Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                });
                return Ok(out);
            }
            Stmt::Block(inner) if contains_return(&inner) => {
                let rest: Vec<Stmt> = inner.into_iter().chain(iter).collect();
                out.extend(lift_returns(rest)?);
                return Ok(out);
            }
            Stmt::For { ref body, .. } | Stmt::While { ref body, .. } if contains_return(body) => {
                return Err(ReturnInLoop);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::print::format_fn;

    #[test]
    fn early_return_absorbs_the_rest() {
        let mut program = parser::parse(
            "fn f(x: f64) -> f64 {\n\
                 if (x < 0.0) { return -x; }\n\
                 x *= 2.0;\n\
                 return x;\n\
                 x = 0.0;\n\
             }",
        )
        .expect("parse");
        let mut decl = program.functions.remove(0);
        decl.body = Some(lift_returns(decl.body.take().expect("body")).expect("lift"));
        let text = format_fn(&decl);
        assert_eq!(
            text,
            "fn f(x: f64) -> f64 {\n    if (x < 0.0) {\n        return -x;\n    } else {\n        x *= 2.0;\n        return x;\n    }\n}\n"
        );
    }

    #[test]
    fn loops_with_returns_are_rejected() {
        let program =
            parser::parse("fn f(x: f64) -> f64 { while (x > 1.0) { return x; } return 0.0; }")
                .expect("parse");
        let body = program.functions[0].body.clone().expect("body");
        assert_eq!(lift_returns(body), Err(ReturnInLoop));
    }
}
