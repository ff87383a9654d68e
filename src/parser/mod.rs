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

//! # Example
//! ```
//! use adsynth::parser;
//! let program = parser::parse("fn sq(x: f64) -> f64 { return x * x; }").unwrap();
//! assert_eq!(program.functions[0].name, "sq");
//! ```

use chumsky::prelude::*;

use crate::ast::{AssignOp, BinOp, Expr, FnDecl, Param, Place, Program, Span, Stmt, Type, UnOp};
use crate::diagnostics::Diagnostic;

const KEYWORDS: &[&str] = &[
    "fn",
    "extern",
    "namespace",
    "let",
    "if",
    "else",
    "for",
    "while",
    "return",
    "true",
    "false",
    "tape",
    "f64",
    "i64",
    "bool",
    "void",
];

fn kw(s: &'static str) -> impl Parser<char, &'static str, Error = Simple<char>> + Clone {
    text::keyword(s).padded().to(s)
}

fn sym(c: char) -> impl Parser<char, char, Error = Simple<char>> + Clone {
    just(c).padded()
}

fn ident() -> impl Parser<char, String, Error = Simple<char>> + Clone {
    text::ident()
        .try_map(|name: String, span| {
            if KEYWORDS.contains(&name.as_str()) {
                Err(Simple::custom(span, format!("`{name}` is a reserved word")))
            } else {
                Ok(name)
            }
        })
        .padded()
}

/// `a::b::c`
fn path() -> impl Parser<char, String, Error = Simple<char>> + Clone {
    ident()
        .then(just("::").ignore_then(ident()).repeated())
        .map(|(first, rest)| {
            let mut name = first;
            for part in rest {
                name.push_str("::");
                name.push_str(&part);
            }
            name
        })
}

fn ty() -> impl Parser<char, Type, Error = Simple<char>> + Clone {
    recursive(|ty| {
        let scalar = choice((
            kw("f64").to(Type::F64),
            kw("i64").to(Type::I64),
            kw("bool").to(Type::Bool),
            kw("void").to(Type::Void),
        ));
        let reference = sym('&').ignore_then(ty.clone()).map(Type::reference);
        let array = ty
            .clone()
            .then(sym(';').ignore_then(text::int(10).padded()).or_not())
            .delimited_by(sym('['), sym(']'))
            .try_map(|(elem, len): (Type, Option<String>), span| {
                let len = match len {
                    Some(digits) => Some(
                        digits
                            .parse::<usize>()
                            .map_err(|_| Simple::custom(span, "array length too large"))?,
                    ),
                    None => None,
                };
                Ok(Type::Array {
                    elem: Box::new(elem),
                    len,
                })
            });
        let tape = kw("tape")
            .ignore_then(ty.delimited_by(sym('<'), sym('>')))
            .map(Type::tape);
        choice((scalar, reference, array, tape))
    })
}

fn number() -> impl Parser<char, Expr, Error = Simple<char>> + Clone {
    let exponent = one_of("eE")
        .ignore_then(one_of("+-").or_not())
        .then(text::digits(10));
    text::int(10)
        .then(just('.').ignore_then(text::digits(10).or_not()).or_not())
        .then(exponent.or_not())
        .try_map(|((int, frac), exp), span: std::ops::Range<usize>| {
            if frac.is_none() && exp.is_none() {
                return int
                    .parse::<i64>()
                    .map(Expr::Int)
                    .map_err(|_| Simple::custom(span, "integer literal out of range"));
            }
            let mut text = int;
            if let Some(frac) = frac {
                text.push('.');
                text.push_str(&frac.unwrap_or_default());
            }
            if let Some((sign, digits)) = exp {
                text.push('e');
                if let Some(sign) = sign {
                    text.push(sign);
                }
                text.push_str(&digits);
            }
            text.parse::<f64>()
                .map(Expr::Float)
                .map_err(|_| Simple::custom(span, "malformed float literal"))
        })
        .padded()
}

fn binary_level(
    operand: impl Parser<char, Expr, Error = Simple<char>> + Clone + 'static,
    ops: impl Parser<char, BinOp, Error = Simple<char>> + Clone + 'static,
) -> BoxedParser<'static, char, Expr, Simple<char>> {
    operand
        .clone()
        .then(ops.padded().then(operand).repeated())
        .foldl(|lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
        .boxed()
}

fn expr() -> impl Parser<char, Expr, Error = Simple<char>> + Clone {
    recursive(|expr| {
        let args = expr
            .clone()
            .separated_by(sym(','))
            .allow_trailing()
            .delimited_by(sym('('), sym(')'));
        let call = path()
            .then(args)
            .map(|(name, args)| Expr::Call(name, args));
        let index = ident()
            .then(expr.clone().delimited_by(sym('['), sym(']')))
            .map(|(name, idx)| Expr::Index(name, Box::new(idx)));
        let fn_ref = sym('&').ignore_then(path()).map(Expr::FnRef);

        let atom = choice((
            number(),
            kw("true").to(Expr::Bool(true)),
            kw("false").to(Expr::Bool(false)),
            call,
            index,
            fn_ref,
            ident().map(Expr::Var),
            expr.clone().delimited_by(sym('('), sym(')')),
        ))
        .boxed();

        let unary = choice((
            just('-').to(UnOp::Neg),
            just('!').then_ignore(just('=').not().rewind()).to(UnOp::Not),
        ))
        .padded()
        .repeated()
        .then(atom)
        .foldr(|op, operand| Expr::Unary(op, Box::new(operand)))
        .boxed();

        let product = binary_level(
            unary,
            choice((
                just('*').to(BinOp::Mul),
                just('/').to(BinOp::Div),
                just('%').to(BinOp::Rem),
            ))
            .then_ignore(just('=').not().rewind()),
        );
        let sum = binary_level(
            product,
            choice((just('+').to(BinOp::Add), just('-').to(BinOp::Sub)))
                .then_ignore(just('=').not().rewind()),
        );
        let relational = binary_level(
            sum,
            choice((
                just("<=").to(BinOp::Le),
                just(">=").to(BinOp::Ge),
                just('<').to(BinOp::Lt),
                just('>').to(BinOp::Gt),
            )),
        );
        let equality = binary_level(
            relational,
            choice((just("==").to(BinOp::Eq), just("!=").to(BinOp::Ne))),
        );
        let and = binary_level(equality, just("&&").to(BinOp::And));
        binary_level(and, just("||").to(BinOp::Or))
    })
}

fn stmt() -> impl Parser<char, Stmt, Error = Simple<char>> + Clone {
    recursive(|stmt| {
        let block = stmt
            .repeated()
            .delimited_by(sym('{'), sym('}'))
            .boxed();

        let place = ident()
            .then(expr().delimited_by(sym('['), sym(']')).or_not())
            .map(|(name, idx)| match idx {
                Some(idx) => Place::Index(name, Box::new(idx)),
                None => Place::Var(name),
            });
        let assign_op = choice((
            just("+=").to(AssignOp::Add),
            just("-=").to(AssignOp::Sub),
            just("*=").to(AssignOp::Mul),
            just("/=").to(AssignOp::Div),
            just('=').then_ignore(just('=').not().rewind()).to(AssignOp::Set),
        ))
        .padded();
        let simple = place
            .then(assign_op)
            .then(expr())
            .map(|((place, op), value)| Stmt::Assign { place, op, value })
            .boxed();

        let let_decl = kw("let")
            .ignore_then(ident())
            .then_ignore(sym(':'))
            .then(ty())
            .then(sym('=').ignore_then(expr()).or_not())
            .map(|((name, ty), init)| Stmt::Let { name, ty, init })
            .boxed();
        let array_decl = kw("let")
            .ignore_then(ident())
            .then_ignore(sym(':'))
            .then(
                ty().then_ignore(sym(';'))
                    .then(expr())
                    .delimited_by(sym('['), sym(']')),
            )
            .map(|(name, (elem, len))| Stmt::ArrayDecl { name, elem, len })
            .boxed();

        let if_stmt = recursive(|if_stmt| {
            kw("if")
                .ignore_then(expr().delimited_by(sym('('), sym(')')))
                .then(block.clone())
                .then(
                    kw("else")
                        .ignore_then(choice((
                            block.clone(),
                            if_stmt.map(|nested: Stmt| vec![nested]),
                        )))
                        .or_not(),
                )
                .map(|((cond, then_branch), else_branch)| Stmt::If {
                    cond,
                    then_branch,
                    else_branch: else_branch.unwrap_or_default(),
                })
        });

        let for_header = choice((let_decl.clone(), simple.clone()))
            .or_not()
            .then_ignore(sym(';'))
            .then(expr().or_not())
            .then_ignore(sym(';'))
            .then(simple.clone().or_not())
            .delimited_by(sym('('), sym(')'));
        let for_stmt = kw("for")
            .ignore_then(for_header)
            .then(block.clone())
            .map(|(((init, cond), step), body)| Stmt::For {
                init: init.map(Box::new),
                cond,
                step: step.map(Box::new),
                body,
            });

        let while_stmt = kw("while")
            .ignore_then(expr().delimited_by(sym('('), sym(')')))
            .then(block.clone())
            .map(|(cond, body)| Stmt::While { cond, body });

        let return_stmt = kw("return")
            .ignore_then(expr().or_not())
            .then_ignore(sym(';'))
            .map(Stmt::Return);

        choice((
            array_decl.then_ignore(sym(';')),
            let_decl.then_ignore(sym(';')),
            if_stmt,
            for_stmt,
            while_stmt,
            return_stmt,
            block.map(Stmt::Block),
            simple.then_ignore(sym(';')),
            expr().then_ignore(sym(';')).map(Stmt::Expr),
        ))
    })
}

pub fn parser() -> impl Parser<char, Program, Error = Simple<char>> {
    let param = ident()
        .then_ignore(sym(':'))
        .then(ty())
        .map(|(name, ty)| Param::new(name, ty));
    let params = param
        .separated_by(sym(','))
        .allow_trailing()
        .delimited_by(sym('('), sym(')'));
    let ret = just("->")
        .padded()
        .ignore_then(ty())
        .or_not()
        .map(|ret| ret.unwrap_or(Type::Void));
    let signature = ident().then(params).then(ret);

    let body = stmt().repeated().delimited_by(sym('{'), sym('}'));
    let function = kw("fn")
        .ignore_then(signature.clone())
        .then(body)
        .map_with_span(
            |(((name, params), ret), body), span: std::ops::Range<usize>| FnDecl {
                name,
                params,
                ret,
                body: Some(body),
                span: Span::new(span.start, span.end),
            },
        );
    let extern_fn = kw("extern")
        .ignore_then(kw("fn"))
        .ignore_then(signature)
        .then_ignore(sym(';'))
        .map_with_span(|((name, params), ret), span: std::ops::Range<usize>| FnDecl {
            name,
            params,
            ret,
            body: None,
            span: Span::new(span.start, span.end),
        });

    let item = recursive(|item| {
        let namespace = kw("namespace")
            .ignore_then(ident())
            .then(item.repeated().delimited_by(sym('{'), sym('}')))
            .map(|(ns, items): (String, Vec<Vec<FnDecl>>)| {
                items
                    .into_iter()
                    .flatten()
                    .map(|mut decl| {
                        decl.name = format!("{ns}::{}", decl.name);
                        decl
                    })
                    .collect::<Vec<_>>()
            });
        choice((
            function.map(|decl| vec![decl]),
            extern_fn.map(|decl| vec![decl]),
            namespace,
        ))
    });

    item.repeated()
        .padded()
        .then_ignore(end())
        .map(|items| Program::new(items.into_iter().flatten().collect()))
}

/// Blanks out `//` comments without moving any byte offsets.
fn blank_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for line in input.split_inclusive('\n') {
        match line.find("//") {
            Some(idx) => {
                out.push_str(&line[..idx]);
                for ch in line[idx..].chars() {
                    if ch == '\n' {
                        out.push('\n');
                    } else {
                        out.extend(std::iter::repeat(' ').take(ch.len_utf8()));
                    }
                }
            }
            None => out.push_str(line),
        }
    }
    out
}

pub fn parse(input: &str) -> Result<Program, Vec<Simple<char>>> {
    let blanked = blank_comments(input);
    parser().parse(blanked.as_str())
}

/// Parse with pretty diagnostics instead of raw chumsky errors.
pub fn parse_with_diagnostics(input: &str) -> Result<Program, Vec<Diagnostic>> {
    parse(input).map_err(|errs| {
        errs.into_iter()
            .map(|e| Diagnostic::from_chumsky(input, e))
            .collect()
    })
}

/// Parses a single expression; used by tests and the request layer.
pub fn parse_expr(input: &str) -> Result<Expr, Vec<Simple<char>>> {
    expr().padded().then_ignore(end()).parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_unary() {
        let e = parse_expr("-a * b + c / 2.5e1").expect("parse");
        let expected = Expr::Binary(
            BinOp::Add,
            Box::new(Expr::Binary(
                BinOp::Mul,
                Box::new(Expr::Unary(UnOp::Neg, Box::new(Expr::var("a")))),
                Box::new(Expr::var("b")),
            )),
            Box::new(Expr::Binary(
                BinOp::Div,
                Box::new(Expr::var("c")),
                Box::new(Expr::Float(25.0)),
            )),
        );
        assert_eq!(e, expected);
    }

    #[test]
    fn every_binary_level_binds_tighter_than_the_next() {
        let e = parse_expr("a || b && c == d < e + f * g").expect("parse");
        let bin = |op, l: Expr, r: Expr| Expr::Binary(op, Box::new(l), Box::new(r));
        let expected = bin(
            BinOp::Or,
            Expr::var("a"),
            bin(
                BinOp::And,
                Expr::var("b"),
                bin(
                    BinOp::Eq,
                    Expr::var("c"),
                    bin(
                        BinOp::Lt,
                        Expr::var("d"),
                        bin(BinOp::Add, Expr::var("e"), bin(BinOp::Mul, Expr::var("f"), Expr::var("g"))),
                    ),
                ),
            ),
        );
        assert_eq!(e, expected);
    }

    #[test]
    fn comments_keep_offsets() {
        let src = "// header\nfn f() {}";
        assert_eq!(blank_comments(src).len(), src.len());
        let program = parse(src).expect("parse");
        assert_eq!(program.functions[0].span.start(), 10);
    }

    #[test]
    fn namespaces_qualify_names() {
        let program = parse(
            "namespace custom_derivatives { fn f_pullback(x: f64, _d_y: f64, _d_x: &f64) { _d_x += _d_y; } }",
        )
        .expect("parse");
        assert_eq!(program.functions[0].name, "custom_derivatives::f_pullback");
        assert_eq!(
            program.functions[0].params[2].ty,
            Type::reference(Type::F64)
        );
    }

    #[test]
    fn compound_assignment_is_not_an_operator() {
        let program = parse("fn f(x: f64) { x -= 1.0; x = -x; }").expect("parse");
        let body = program.functions[0].body.as_ref().expect("body");
        assert!(matches!(
            body[0],
            Stmt::Assign {
                op: AssignOp::Sub,
                ..
            }
        ));
        assert!(matches!(
            body[1],
            Stmt::Assign {
                op: AssignOp::Set,
                ..
            }
        ));
    }
}
