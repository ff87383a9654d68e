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

use std::fmt::Write;

use crate::ast::{Expr, FnDecl, Place, Program, Stmt, Type, UnOp};

const UNARY_PRECEDENCE: u8 = 7;

/// Format a [`Program`] into stable source text that the parser accepts.
/// Namespaced functions are printed with their qualified name.
pub fn format_program(program: &Program) -> String {
    let mut out = String::new();
    for (i, decl) in program.functions.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        format_fn_into(decl, &mut out);
    }
    out
}

pub fn format_fn(decl: &FnDecl) -> String {
    let mut out = String::new();
    format_fn_into(decl, &mut out);
    out
}

fn format_fn_into(decl: &FnDecl, out: &mut String) {
    let (namespace, name) = match decl.name.rsplit_once("::") {
        Some((ns, name)) => (Some(ns), name),
        None => (None, decl.name.as_str()),
    };
    let mut indent = 0;
    if let Some(ns) = namespace {
        for part in ns.split("::") {
            writeln!(out, "{}namespace {part} {{", pad(indent)).expect("write to string cannot fail");
            indent += 1;
        }
    }

    let params: Vec<String> = decl
        .params
        .iter()
        .map(|p| format!("{}: {}", p.name, p.ty))
        .collect();
    let head = format!("{}fn {name}({})", pad(indent), params.join(", "));
    let ret = if decl.ret == Type::Void {
        String::new()
    } else {
        format!(" -> {}", decl.ret)
    };
    match &decl.body {
        None => {
            writeln!(out, "{}extern {}{ret};", pad(indent), head.trim_start())
                .expect("write to string cannot fail");
        }
        Some(body) => {
            writeln!(out, "{head}{ret} {{").expect("write to string cannot fail");
            for stmt in body {
                format_stmt(stmt, indent + 1, out);
            }
            writeln!(out, "{}}}", pad(indent)).expect("write to string cannot fail");
        }
    }

    while indent > 0 {
        indent -= 1;
        writeln!(out, "{}}}", pad(indent)).expect("write to string cannot fail");
    }
}

fn pad(indent: usize) -> String {
    "    ".repeat(indent)
}

fn format_block(body: &[Stmt], indent: usize, out: &mut String) {
    out.push_str("{\n");
    for stmt in body {
        format_stmt(stmt, indent + 1, out);
    }
    out.push_str(&pad(indent));
    out.push('}');
}

fn format_stmt(stmt: &Stmt, indent: usize, out: &mut String) {
    out.push_str(&pad(indent));
    match stmt {
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            format_if(cond, then_branch, else_branch, indent, out);
            out.push('\n');
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => {
            out.push_str("for (");
            if let Some(init) = init {
                out.push_str(&format_simple(init));
            }
            out.push_str("; ");
            if let Some(cond) = cond {
                out.push_str(&format_expr(cond));
            }
            out.push_str("; ");
            if let Some(step) = step {
                out.push_str(&format_simple(step));
            }
            out.push_str(") ");
            format_block(body, indent, out);
            out.push('\n');
        }
        Stmt::While { cond, body } => {
            write!(out, "while ({}) ", format_expr(cond)).expect("write to string cannot fail");
            format_block(body, indent, out);
            out.push('\n');
        }
        Stmt::Block(body) => {
            format_block(body, indent, out);
            out.push('\n');
        }
        other => {
            writeln!(out, "{};", format_simple(other)).expect("write to string cannot fail");
        }
    }
}

fn format_if(cond: &Expr, then_branch: &[Stmt], else_branch: &[Stmt], indent: usize, out: &mut String) {
    write!(out, "if ({}) ", format_expr(cond)).expect("write to string cannot fail");
    format_block(then_branch, indent, out);
    match else_branch {
        [] => {}
        [Stmt::If {
            cond,
            then_branch,
            else_branch,
        }] => {
            out.push_str(" else ");
            format_if(cond, then_branch, else_branch, indent, out);
        }
        _ => {
            out.push_str(" else ");
            format_block(else_branch, indent, out);
        }
    }
}

/// Statements that fit on one line, without the trailing `;`.
fn format_simple(stmt: &Stmt) -> String {
    match stmt {
        Stmt::Let { name, ty, init } => match init {
            Some(init) => format!("let {name}: {ty} = {}", format_expr(init)),
            None => format!("let {name}: {ty}"),
        },
        Stmt::ArrayDecl { name, elem, len } => {
            format!("let {name}: [{elem}; {}]", format_expr(len))
        }
        Stmt::Assign { place, op, value } => {
            format!("{} {} {}", format_place(place), op.symbol(), format_expr(value))
        }
        Stmt::Return(Some(e)) => format!("return {}", format_expr(e)),
        Stmt::Return(None) => "return".to_string(),
        Stmt::Expr(e) => format_expr(e),
        compound => {
            let mut out = String::new();
            format_stmt(compound, 0, &mut out);
            out.trim_end().to_string()
        }
    }
}

fn format_place(place: &Place) -> String {
    match place {
        Place::Var(name) => name.clone(),
        Place::Index(name, idx) => format!("{name}[{}]", format_expr(idx)),
    }
}

pub fn format_expr(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(expr, 0, &mut out);
    out
}

fn write_expr(expr: &Expr, min_prec: u8, out: &mut String) {
    match expr {
        Expr::Float(v) => {
            if v.is_sign_negative() && *v != 0.0 {
                write!(out, "({v:?})").expect("write to string cannot fail");
            } else {
                write!(out, "{v:?}").expect("write to string cannot fail");
            }
        }
        Expr::Int(v) if *v < 0 => write!(out, "({v})").expect("write to string cannot fail"),
        Expr::Int(v) => write!(out, "{v}").expect("write to string cannot fail"),
        Expr::Bool(v) => write!(out, "{v}").expect("write to string cannot fail"),
        Expr::Var(name) => out.push_str(name),
        Expr::FnRef(name) => write!(out, "&{name}").expect("write to string cannot fail"),
        Expr::Index(name, idx) => {
            write!(out, "{name}[").expect("write to string cannot fail");
            write_expr(idx, 0, out);
            out.push(']');
        }
        Expr::Call(name, args) => {
            write!(out, "{name}(").expect("write to string cannot fail");
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(arg, 0, out);
            }
            out.push(')');
        }
        Expr::Unary(op, inner) => {
            let paren = min_prec > UNARY_PRECEDENCE;
            if paren {
                out.push('(');
            }
            out.push(match op {
                UnOp::Neg => '-',
                UnOp::Not => '!',
            });
            write_expr(inner, UNARY_PRECEDENCE, out);
            if paren {
                out.push(')');
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let prec = op.precedence();
            let paren = prec < min_prec;
            if paren {
                out.push('(');
            }
            write_expr(lhs, prec, out);
            write!(out, " {} ", op.symbol()).expect("write to string cannot fail");
            // Left associative: an equal-precedence right operand needs parens.
            write_expr(rhs, prec + 1, out);
            if paren {
                out.push(')');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;
    use crate::parser;

    #[test]
    fn parenthesizes_by_precedence() {
        let a = Expr::var("a");
        let b = Expr::var("b");
        let c = Expr::var("c");
        let e = build::mul(build::add(a.clone(), b.clone()), c.clone());
        assert_eq!(format_expr(&e), "(a + b) * c");
        let e = build::sub(a.clone(), build::sub(b.clone(), c.clone()));
        assert_eq!(format_expr(&e), "a - (b - c)");
        let e = build::neg(build::mul(a, b));
        assert_eq!(format_expr(&e), "-(a * b)");
    }

    #[test]
    fn dump_reparses_to_same_tree() {
        let src = r#"
namespace custom_derivatives {
    fn g_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += 2.0 * x * _d_y;
    }
}
fn f(x: f64, arr: [f64], n: i64) -> f64 {
    let t: tape<f64>;
    let acc: f64 = 0.0;
    for (let i: i64 = 0; i < n; i += 1) {
        push(t, acc);
        acc += arr[i] * x;
    }
    if (acc > 1.0e-3 && !(n == 0)) {
        acc = -acc;
    } else if (n % 2 == 1) {
        acc /= 2;
    }
    return acc;
}
"#;
        let program = parser::parse(src).expect("parse");
        let printed = format_program(&program);
        let reparsed = parser::parse(&printed).expect("reparse");
        let strip = |p: &Program| {
            p.functions
                .iter()
                .map(|f| (f.name.clone(), f.params.clone(), f.body.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&program), strip(&reparsed), "{printed}");
    }
}
