//! Lexical analysis for CML source.
//!
//! Tokenization of the fixed command surface using logos.
//!
//! # Design
//!
//! - Comments and whitespace are stripped during lexing (not tokens).
//! - Name positions are dynamic: what follows `$` and `&` depends on the
//!   registered accessors, commands and labels, so those names are not
//!   tokens. The parser matches them against the lexer's
//!   [`remainder`](logos::Lexer::remainder) and advances with
//!   [`bump`](logos::Lexer::bump).
//! - Assignment statements (`$3+=` etc.) lex as one token; their shape is
//!   fixed so no dynamic matching is needed. The assignment pattern also
//!   greedily claims the prefix of a comparison (`$3==4` lexes as `$3=`
//!   then `=`); the parser's token stream undoes that split.

use logos::Logos;

fn parse_hex(slice: &str) -> Option<f64> {
    u64::from_str_radix(&slice[2..], 16).ok().map(|v| v as f64)
}

/// CML token.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*[^/])*\*/")]
pub enum Token {
    /// Decimal or hex numeric literal.
    #[regex(r"[0-9]+\.?[0-9]*", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"0x[0-9a-fA-F]+", |lex| parse_hex(lex.slice()))]
    Number(f64),

    /// `'...'` string payload.
    #[regex(r"'[^']*'", |lex| { let s = lex.slice(); s[1..s.len() - 1].to_string() })]
    Text(String),

    /// `#name` label definition (the block open follows separately).
    #[regex(r"#[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    Label(String),

    /// `$3=`, `$r+=` and friends, kept as the raw slice.
    #[regex(r"\$[1-9r][+\-*/]?=", |lex| lex.slice().to_string(), priority = 10)]
    Assign(String),

    /// `$`; the accessor name is matched from the remainder.
    #[token("$")]
    Dollar,

    /// `&`; the call name is matched from the remainder.
    #[token("&")]
    Ampersand,

    // Commands
    #[token("w")]
    Wait,
    #[token("~")]
    LongWait,
    #[token("i")]
    Interval,
    #[token("p")]
    Pos,
    #[token("v")]
    Vel,
    #[token("vd")]
    VelDir,
    #[token("r")]
    Rot,
    #[token("ht")]
    HeadAim,
    #[token("ha")]
    HeadAbs,
    #[token("ho")]
    HeadRel,
    #[token("hp")]
    HeadPar,
    #[token("hv")]
    HeadVel,
    #[token("hs")]
    HeadSeq,
    #[token("m")]
    Invert,
    #[token("f")]
    Fire,
    #[token("n")]
    New,
    #[token("@ko")]
    ForkDest,
    #[token("@o")]
    ForkPlain,
    #[token("@")]
    Fork,
    #[token("kf")]
    KillFiber,
    #[token("ko")]
    KillObject,

    // Structure
    #[token("[")]
    LoopStart,
    #[token("]")]
    LoopEnd,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token("{")]
    BlockOpen,
    #[token("}")]
    BlockClose,

    // Formula
    #[token("(")]
    ParenOpen,
    #[token(")")]
    ParenClose,
    #[token(",")]
    Comma,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token(">=")]
    GreaterEq,
    #[token("<=")]
    LessEq,
    #[token(">")]
    Greater,
    #[token("<")]
    Less,
}
