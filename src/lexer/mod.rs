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

//! Token stream for the short textual lists that sit outside the language
//! grammar: independent-variable specifications (`"x, arr[0:2]"`) and
//! argument lists given on the command line (`"3, 5, [0, 0, 0]"`).

use std::ops::Range;

use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r"-?[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"-?[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
}

/// Lexes `input`, returning the byte range of the first unrecognised
/// character on failure.
pub fn lex(input: &str) -> Result<Vec<(Token, Range<usize>)>, Range<usize>> {
    let mut lexer = Token::lexer(input);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next() {
        match token {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => return Err(lexer.span()),
        }
    }
    Ok(tokens)
}

/// One entry of a command-line argument list.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgLiteral {
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<f64>),
}

impl ArgLiteral {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgLiteral::Int(v) => Some(*v as f64),
            ArgLiteral::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Parses `"3, 5.5, true, [0, 1.5]"`.
pub fn parse_arg_list(input: &str) -> Result<Vec<ArgLiteral>, String> {
    let tokens = lex(input).map_err(|span| format!("unexpected character at {}", span.start))?;
    let mut out = Vec::new();
    let mut iter = tokens.into_iter().peekable();
    while let Some((token, span)) = iter.next() {
        let literal = match token {
            Token::Int(v) => ArgLiteral::Int(v),
            Token::Float(v) => ArgLiteral::Float(v),
            Token::Ident(word) if word == "true" => ArgLiteral::Bool(true),
            Token::Ident(word) if word == "false" => ArgLiteral::Bool(false),
            Token::LBracket => {
                let mut items = Vec::new();
                loop {
                    match iter.next() {
                        Some((Token::RBracket, _)) => break,
                        Some((Token::Int(v), _)) => items.push(v as f64),
                        Some((Token::Float(v), _)) => items.push(v),
                        Some((Token::Comma, _)) => {}
                        Some((other, span)) => {
                            return Err(format!("unexpected {other:?} at {}", span.start))
                        }
                        None => return Err("unterminated array literal".to_string()),
                    }
                }
                ArgLiteral::Array(items)
            }
            other => return Err(format!("unexpected {other:?} at {}", span.start)),
        };
        out.push(literal);
        match iter.next() {
            None => break,
            Some((Token::Comma, _)) => {}
            Some((other, span)) => {
                return Err(format!("expected ',' but found {other:?} at {}", span.start))
            }
        }
    }
    Ok(out)
}
