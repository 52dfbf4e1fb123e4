//! Instruction-graph compiler
//!
//! Drives the lexer token by token and lowers the statement stream into
//! runtime [`Sequence`]s. Structure is tracked with two stacks, one for
//! open loops (per sequence) and one for open `{}` blocks; loop and branch
//! markers are cross-linked with explicit jump targets as they close.
//!
//! # Design
//!
//! - Labels are prescanned so a reference may appear before its
//!   definition; such references are patched once every sequence is built.
//! - A `&name` or `{}` reference directly after a firing/forking command
//!   binds to it; anywhere else an inline call is inserted in front.
//! - Call sites are checked against the callee's argument requirement at
//!   the end of the compile; nothing about arity is deferred to run time.

use std::sync::Arc;

use cml_runtime::GlobalContext;
use cml_runtime::accessor::{Accessor, Subject};
use cml_runtime::ir::{
    Arg, AssignOp, AssignTarget, BinOp, Instruction, Op, Program, SeqId, SeqRef, Sequence,
};
use cml_runtime::types::HeadMode;
use indexmap::IndexMap;
use logos::Logos;
use tracing::{debug, trace};

use crate::context::{CompilerContext, RegisteredName};
use crate::error::{CompileError, Result};
use crate::expr::ExprBuilder;
use crate::lexer::Token;

/// Built-in accessor names, longest first so a greedy prefix scan finds the
/// longest match. The empty name (bare `$`) always matches.
const BUILTIN_ACCESSORS: &[&str] = &[
    "p.sx", "p.sy", "p.td", "p.vx", "p.vy", "p.ho", "t.sx", "t.sy", "t.td", "t.vx", "t.vy",
    "t.ho", "p.x", "p.y", "p.v", "t.x", "t.y", "t.v", "??", "sx", "sy", "vx", "vy", "ho", "td",
    "?", "i", "r", "l", "x", "y", "v", "",
];

fn builtin_accessor(name: &str, digit: Option<u8>) -> Option<Accessor> {
    let (subject, base) = if let Some(b) = name.strip_prefix("p.") {
        (Subject::Parent, b)
    } else if let Some(b) = name.strip_prefix("t.") {
        (Subject::Target, b)
    } else {
        (Subject::This, name)
    };
    let acc = match base {
        "" => Accessor::Var(digit.unwrap_or(0).saturating_sub(1)),
        "?" => Accessor::Rand,
        "??" => Accessor::RandSigned,
        "i" => Accessor::Interval,
        "r" => match digit {
            Some(d) if d > 0 => Accessor::GlobalRank(d),
            _ => Accessor::EntityRank,
        },
        "l" => Accessor::LoopCount(digit.unwrap_or(0)),
        "x" => Accessor::PosX(subject),
        "y" => Accessor::PosY(subject),
        "sx" => Accessor::SignX(subject),
        "sy" => Accessor::SignY(subject),
        "v" => Accessor::Speed(subject),
        "vx" => Accessor::VelX(subject),
        "vy" => Accessor::VelY(subject),
        "ho" => Accessor::Heading(subject),
        "td" => Accessor::TargetDistance(subject),
        _ => return None,
    };
    Some(acc)
}

/// Peekable token source over the logos lexer, with the `$3==` vs `$3=`
/// normalization and the remainder hooks for dynamic name matching.
struct TokenStream<'a> {
    lexer: logos::Lexer<'a, Token>,
    peeked: Option<Token>,
    pending: Option<Token>,
    /// Accessor slot recovered from an over-greedy assignment lex; consumed
    /// by the accessor resolver in place of remainder matching.
    forced_accessor: Option<char>,
}

impl<'a> TokenStream<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lexer: Token::lexer(source),
            peeked: None,
            pending: None,
            forced_accessor: None,
        }
    }

    fn pull(&mut self) -> Result<Option<Token>> {
        if let Some(t) = self.pending.take() {
            return Ok(Some(t));
        }
        match self.lexer.next() {
            None => Ok(None),
            Some(Err(())) => Err(CompileError::UnknownToken { near: self.near() }),
            Some(Ok(Token::Assign(s))) => {
                // "$3=" directly followed by "=" is really "$3 ==".
                if s.len() == 3 && self.lexer.remainder().starts_with('=') {
                    self.lexer.bump(1);
                    self.forced_accessor = Some(s.as_bytes()[1] as char);
                    self.pending = Some(Token::EqEq);
                    Ok(Some(Token::Dollar))
                } else {
                    Ok(Some(Token::Assign(s)))
                }
            }
            Some(Ok(t)) => Ok(Some(t)),
        }
    }

    fn take_forced_accessor(&mut self) -> Option<char> {
        self.forced_accessor.take()
    }

    fn next(&mut self) -> Result<Option<Token>> {
        if let Some(t) = self.peeked.take() {
            return Ok(Some(t));
        }
        self.pull()
    }

    fn peek(&mut self) -> Result<Option<&Token>> {
        if self.peeked.is_none() {
            self.peeked = self.pull()?;
        }
        Ok(self.peeked.as_ref())
    }

    /// Unlexed input right after the last returned token. Only meaningful
    /// when nothing has been peeked past that token.
    fn remainder(&self) -> &'a str {
        self.lexer.remainder()
    }

    fn bump(&mut self, len: usize) {
        self.lexer.bump(len);
    }

    /// Short snippet at the current position, for error messages.
    fn near(&self) -> String {
        let src = self.lexer.source();
        let start = self.lexer.span().start.min(src.len());
        src[start..].chars().take(12).collect::<String>().trim().to_string()
    }
}

/// One sequence under construction.
struct SeqBuilder {
    id: SeqId,
    label: Option<String>,
    instrs: Vec<Instruction>,
    require_argc: usize,
    loops: Vec<LoopFrame>,
}

impl SeqBuilder {
    fn new(id: SeqId, label: Option<String>) -> Self {
        Self {
            id,
            label,
            instrs: Vec::new(),
            require_argc: 0,
            loops: Vec::new(),
        }
    }
}

/// An open loop: where it started and its `?`/`:` markers, in order.
struct LoopFrame {
    start: usize,
    markers: Vec<usize>,
}

/// What a call site resolved to.
enum SiteTarget {
    /// Label of the current source, patched after all sequences exist.
    Label(String),
    /// Anonymous block of the current source.
    Seq(SeqId),
    /// Label from an earlier compile.
    Extern(Arc<Program>, SeqId),
}

struct CallSite {
    seq: SeqId,
    instr: usize,
    name: String,
    supplied: usize,
    target: SiteTarget,
}

enum CallTarget {
    LocalLabel(String),
    Extern(Arc<Program>, SeqId),
    Command(usize),
}

/// Single-use compiler for one source string.
pub(crate) struct Compiler<'a> {
    ctx: &'a CompilerContext,
    stream: TokenStream<'a>,
    /// Label names found by the prescan, longest first.
    local_labels: Vec<String>,
    label_ids: IndexMap<String, SeqId>,
    seqs: Vec<Sequence>,
    builders: Vec<SeqBuilder>,
    call_sites: Vec<CallSite>,
}

impl<'a> Compiler<'a> {
    pub(crate) fn new(ctx: &'a CompilerContext, source: &'a str) -> Self {
        Self {
            ctx,
            stream: TokenStream::new(source),
            local_labels: prescan_labels(source),
            label_ids: IndexMap::new(),
            seqs: Vec::new(),
            builders: Vec::new(),
            call_sites: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) -> Result<Arc<Program>> {
        let root = self.reserve_seq();
        self.builders.push(SeqBuilder::new(root, None));

        while let Some(tok) = self.stream.next()? {
            self.statement(tok)?;
        }

        if self.builders.len() != 1 {
            return Err(CompileError::UnclosedBlock);
        }
        if let Some(b) = self.builders.pop() {
            if !b.loops.is_empty() {
                return Err(CompileError::UnclosedLoop);
            }
            self.finalize(b);
        }

        self.link_call_sites()?;

        debug!(seqs = self.seqs.len(), "compiled program");
        Ok(Arc::new(Program { seqs: self.seqs }))
    }

    // -- statements --------------------------------------------------------

    fn statement(&mut self, tok: Token) -> Result<()> {
        match tok {
            Token::Wait => self.simple(Op::Wait),
            Token::LongWait => self.simple(Op::LongWait),
            Token::Interval => self.simple(Op::Interval),
            Token::Pos => self.simple(Op::SetPos),
            Token::Vel => self.simple(Op::SetVel),
            Token::VelDir => self.simple(Op::SetVelDir),
            Token::Rot => self.simple(Op::Rotate),
            Token::HeadAim => self.simple(Op::Head(HeadMode::Aim)),
            Token::HeadAbs => self.simple(Op::Head(HeadMode::Abs)),
            Token::HeadRel => self.simple(Op::Head(HeadMode::Rel)),
            Token::HeadPar => self.simple(Op::Head(HeadMode::Par)),
            Token::HeadVel => self.simple(Op::Head(HeadMode::Vel)),
            Token::HeadSeq => self.simple(Op::Head(HeadMode::Seq)),
            Token::Invert => self.simple(Op::Invert),
            Token::Fire => self.simple(Op::Fire),
            Token::New => self.simple(Op::New),
            Token::Fork => self.simple(Op::Fork),
            Token::ForkPlain => self.simple(Op::ForkPlain),
            Token::ForkDest => self.simple(Op::ForkDest),
            Token::KillFiber => self.simple(Op::KillFiber),
            Token::KillObject => self.simple(Op::KillObject),
            Token::Assign(s) => self.assign(&s),
            Token::Ampersand => self.call(),
            Token::Text(s) => {
                self.push_instr(Op::Text(Arc::from(s.as_str())));
                Ok(())
            }
            Token::Label(name) => self.label_define(name),
            Token::BlockOpen => {
                let id = self.reserve_seq();
                self.builders.push(SeqBuilder::new(id, None));
                Ok(())
            }
            Token::BlockClose => self.block_close(),
            Token::LoopStart => self.loop_start(),
            Token::Question => self.condition(),
            Token::Colon => self.alternative(),
            Token::LoopEnd => self.loop_end(),
            // Formula tokens with nothing to attach to.
            Token::Number(_)
            | Token::Dollar
            | Token::Plus
            | Token::Minus
            | Token::Star
            | Token::Slash
            | Token::Percent
            | Token::EqEq
            | Token::NotEq
            | Token::GreaterEq
            | Token::LessEq
            | Token::Greater
            | Token::Less
            | Token::ParenOpen
            | Token::ParenClose
            | Token::Comma => Err(CompileError::DanglingFormula),
        }
    }

    fn simple(&mut self, op: Op) -> Result<()> {
        let idx = self.push_instr(op);
        self.parse_args(idx)?;
        Ok(())
    }

    fn assign(&mut self, raw: &str) -> Result<()> {
        let bytes = raw.as_bytes();
        let op = match bytes[2] as char {
            '+' => AssignOp::Add,
            '-' => AssignOp::Sub,
            '*' => AssignOp::Mul,
            '/' => AssignOp::Div,
            _ => AssignOp::Set,
        };
        let target = match bytes[1] as char {
            'r' => AssignTarget::Rank,
            c => {
                let n = c as u8 - b'0';
                let b = self.cur();
                b.require_argc = b.require_argc.max(n as usize);
                AssignTarget::Var(n - 1)
            }
        };
        self.simple(Op::Assign(target, op))
    }

    fn call(&mut self) -> Result<()> {
        match self.resolve_call()? {
            CallTarget::Command(idx) => self.simple(Op::UserCommand(idx)),
            CallTarget::LocalLabel(name) => self.emit_ref(
                Op::Ref(SeqRef::Local(SeqId(usize::MAX))),
                SiteTarget::Label(name.clone()),
                name,
            ),
            CallTarget::Extern(program, id) => {
                let target = SiteTarget::Extern(Arc::clone(&program), id);
                let name = program
                    .seq(id)
                    .label
                    .clone()
                    .unwrap_or_else(|| "{}".to_string());
                self.emit_ref(Op::Ref(SeqRef::Extern(program, id)), target, name)
            }
        }
    }

    fn label_define(&mut self, name: String) -> Result<()> {
        match self.stream.next()? {
            Some(Token::BlockOpen) => {}
            _ => return Err(CompileError::LabelWithoutBlock(name)),
        }
        if self.label_ids.contains_key(&name) {
            return Err(CompileError::DuplicateLabel(name));
        }
        trace!(label = %name, "labeled sequence");
        let id = self.reserve_seq();
        self.label_ids.insert(name.clone(), id);
        self.builders.push(SeqBuilder::new(id, Some(name)));
        Ok(())
    }

    fn block_close(&mut self) -> Result<()> {
        if self.builders.len() <= 1 {
            return Err(CompileError::UnexpectedBlockEnd);
        }
        let Some(child) = self.builders.pop() else {
            return Err(CompileError::UnexpectedBlockEnd);
        };
        if !child.loops.is_empty() {
            return Err(CompileError::UnclosedLoop);
        }
        let id = child.id;
        let labeled = child.label.is_some();
        self.finalize(child);
        if !labeled {
            // An anonymous block is a reference at the point it closes.
            self.emit_ref(
                Op::Ref(SeqRef::Local(id)),
                SiteTarget::Seq(id),
                "{}".to_string(),
            )?;
        }
        Ok(())
    }

    fn loop_start(&mut self) -> Result<()> {
        let b = self.cur();
        let start = b.instrs.len();
        b.instrs.push(Instruction::new(Op::BlockStart));
        b.loops.push(LoopFrame {
            start,
            markers: Vec::new(),
        });
        self.parse_args(start)?;
        Ok(())
    }

    fn condition(&mut self) -> Result<()> {
        let b = self.cur();
        let prev = match b.loops.last() {
            Some(frame) => frame.markers.last().copied().unwrap_or(frame.start),
            None => return Err(CompileError::MisplacedCondition),
        };
        let adjacent = b.instrs.len() == prev + 1
            && matches!(b.instrs[prev].op, Op::BlockStart | Op::Else);
        if !adjacent {
            return Err(CompileError::MisplacedCondition);
        }
        // The condition was parsed as the preceding marker's arguments.
        let cond = std::mem::take(&mut b.instrs[prev].args);
        let idx = b.instrs.len();
        let mut instr = Instruction::new(Op::If);
        instr.args = cond;
        b.instrs.push(instr);
        if let Some(frame) = b.loops.last_mut() {
            frame.markers.push(idx);
        }
        Ok(())
    }

    fn alternative(&mut self) -> Result<()> {
        let b = self.cur();
        let after_if = b
            .loops
            .last()
            .and_then(|f| f.markers.last())
            .is_some_and(|m| matches!(b.instrs[*m].op, Op::If));
        if !after_if {
            return Err(CompileError::MisplacedElse);
        }
        let idx = b.instrs.len();
        b.instrs.push(Instruction::new(Op::Else));
        if let Some(frame) = b.loops.last_mut() {
            frame.markers.push(idx);
        }
        // A condition for a following `?` accumulates here.
        self.parse_args(idx)?;
        Ok(())
    }

    fn loop_end(&mut self) -> Result<()> {
        let Some(frame) = self.cur().loops.pop() else {
            return Err(CompileError::UnexpectedLoopEnd);
        };
        let b = self.cur();
        let end_idx = b.instrs.len();
        let mut instr = Instruction::new(Op::BlockEnd);
        instr.jump = Some(frame.start + 1);
        b.instrs.push(instr);
        for (i, m) in frame.markers.iter().enumerate() {
            let target = match b.instrs[*m].op {
                // A false condition skips to the next branch, or to the
                // loop end (which still counts the iteration).
                Op::If => frame.markers.get(i + 1).map(|n| n + 1).unwrap_or(end_idx),
                _ => end_idx,
            };
            b.instrs[*m].jump = Some(target);
        }
        // Repeat count follows the bracket.
        self.parse_args(end_idx)?;
        Ok(())
    }

    /// Emit a sequence reference, fronted by an inline call unless the
    /// previous instruction consumes references itself.
    fn emit_ref(&mut self, op: Op, target: SiteTarget, name: String) -> Result<()> {
        let needs_call = !matches!(
            self.cur().instrs.last().map(|i| &i.op),
            Some(Op::Fire | Op::New | Op::Fork | Op::ForkPlain | Op::ForkDest)
        );
        if needs_call {
            self.push_instr(Op::Call);
        }
        let idx = self.push_instr(op);
        let supplied = self.parse_args(idx)?;
        let seq = self.cur().id;
        self.call_sites.push(CallSite {
            seq,
            instr: idx,
            name,
            supplied,
            target,
        });
        Ok(())
    }

    // -- name resolution ---------------------------------------------------

    fn resolve_call(&mut self) -> Result<CallTarget> {
        let rem = self.stream.remainder();
        let mut best: Option<(usize, CallTarget)> = None;
        for name in &self.local_labels {
            if rem.starts_with(name.as_str())
                && best.as_ref().is_none_or(|(len, _)| name.len() > *len)
            {
                best = Some((name.len(), CallTarget::LocalLabel(name.clone())));
            }
        }
        for (name, reg) in self.ctx.registered_names() {
            if rem.starts_with(name.as_str())
                && best.as_ref().is_none_or(|(len, _)| name.len() > *len)
            {
                let target = match reg {
                    RegisteredName::Label(p, id) => CallTarget::Extern(Arc::clone(p), *id),
                    RegisteredName::Command(idx) => CallTarget::Command(*idx),
                };
                best = Some((name.len(), target));
            }
        }
        match best {
            Some((len, target)) => {
                self.stream.bump(len);
                Ok(target)
            }
            None => Err(CompileError::UndefinedReference(leading_word(rem))),
        }
    }

    fn resolve_accessor(&mut self) -> Result<Accessor> {
        if let Some(c) = self.stream.take_forced_accessor() {
            return Ok(match c {
                'r' => Accessor::EntityRank,
                d => Accessor::Var((d as u8 - b'0').saturating_sub(1)),
            });
        }
        let rem = self.stream.remainder();
        let builtin = BUILTIN_ACCESSORS
            .iter()
            .find(|n| rem.starts_with(**n))
            .copied()
            .unwrap_or("");
        let user = self
            .ctx
            .user_accessors()
            .iter()
            .find(|(n, _)| !n.is_empty() && rem.starts_with(n.as_str()));

        let (len, user_idx) = match user {
            // Built-ins win ties.
            Some((n, idx)) if n.len() > builtin.len() => (n.len(), Some(*idx)),
            _ => (builtin.len(), None),
        };
        if len == 0 && starts_ident(rem) {
            return Err(CompileError::UnknownAccessor(leading_word(rem)));
        }
        self.stream.bump(len);

        // Only `$N`, `$rN` and `$lN` take a trailing digit.
        let digit = if user_idx.is_none() && matches!(builtin, "" | "r" | "l") {
            let d = self
                .stream
                .remainder()
                .as_bytes()
                .first()
                .filter(|b| b.is_ascii_digit())
                .map(|b| b - b'0');
            if d.is_some() {
                self.stream.bump(1);
            }
            d
        } else {
            None
        };

        match user_idx {
            Some(idx) => Ok(Accessor::User(idx)),
            None => builtin_accessor(builtin, digit)
                .ok_or_else(|| CompileError::UnknownAccessor(builtin.to_string())),
        }
    }

    // -- formulas ----------------------------------------------------------

    /// Parse the comma-separated argument list following a statement and
    /// attach it to the instruction at `idx`. Returns the argument count.
    fn parse_args(&mut self, idx: usize) -> Result<usize> {
        let mut args: Vec<Arg> = Vec::new();
        let mut after_comma = false;
        loop {
            match self.parse_expr()? {
                Some((arg, max_ref)) => {
                    let b = self.cur();
                    b.require_argc = b.require_argc.max(max_ref);
                    args.push(arg);
                }
                None => {
                    let comma_next = matches!(self.stream.peek()?, Some(Token::Comma));
                    if after_comma || comma_next {
                        args.push(Arg::Missing);
                    }
                    if !comma_next {
                        break;
                    }
                }
            }
            if matches!(self.stream.peek()?, Some(Token::Comma)) {
                self.stream.next()?;
                after_comma = true;
            } else {
                break;
            }
        }
        let count = args.len();
        self.cur().instrs[idx].args = args;
        Ok(count)
    }

    /// Parse one formula, or nothing if the next token cannot start one.
    fn parse_expr(&mut self) -> Result<Option<(Arg, usize)>> {
        let starts = matches!(
            self.stream.peek()?,
            Some(Token::Number(_) | Token::Dollar | Token::Minus | Token::ParenOpen)
        );
        if !starts {
            return Ok(None);
        }

        let mut b = ExprBuilder::new();
        loop {
            if b.expects_operand() {
                match self.stream.peek()? {
                    Some(Token::Number(_)) => {
                        if let Some(Token::Number(v)) = self.stream.next()? {
                            b.push_number(v);
                        }
                    }
                    Some(Token::Dollar) => {
                        self.stream.next()?;
                        let acc = self.resolve_accessor()?;
                        b.push_accessor(acc);
                    }
                    Some(Token::Minus) => {
                        self.stream.next()?;
                        b.push_neg();
                    }
                    Some(Token::ParenOpen) => {
                        self.stream.next()?;
                        b.open_paren();
                    }
                    _ => {
                        return Err(CompileError::MalformedFormula {
                            near: self.stream.near(),
                        });
                    }
                }
            } else {
                let op = match self.stream.peek()? {
                    Some(Token::Plus) => Some(BinOp::Add),
                    Some(Token::Minus) => Some(BinOp::Sub),
                    Some(Token::Star) => Some(BinOp::Mul),
                    Some(Token::Slash) => Some(BinOp::Div),
                    Some(Token::Percent) => Some(BinOp::Mod),
                    Some(Token::EqEq) => Some(BinOp::Eq),
                    Some(Token::NotEq) => Some(BinOp::Ne),
                    Some(Token::GreaterEq) => Some(BinOp::Ge),
                    Some(Token::LessEq) => Some(BinOp::Le),
                    Some(Token::Greater) => Some(BinOp::Gt),
                    Some(Token::Less) => Some(BinOp::Lt),
                    Some(Token::ParenClose) if b.depth() > 0 => {
                        self.stream.next()?;
                        b.close_paren(&self.stream.near())?;
                        continue;
                    }
                    _ => None,
                };
                match op {
                    Some(op) => {
                        self.stream.next()?;
                        b.push_operator(op);
                    }
                    None => break,
                }
            }
        }
        let max_ref = b.max_reference();
        let arg = b.finish(&self.stream.near())?;
        Ok(Some((arg, max_ref)))
    }

    // -- plumbing ----------------------------------------------------------

    fn cur(&mut self) -> &mut SeqBuilder {
        let i = self.builders.len() - 1;
        &mut self.builders[i]
    }

    fn push_instr(&mut self, op: Op) -> usize {
        let b = self.cur();
        let idx = b.instrs.len();
        b.instrs.push(Instruction::new(op));
        idx
    }

    fn reserve_seq(&mut self) -> SeqId {
        self.seqs.push(Sequence {
            label: None,
            instrs: Vec::new(),
            require_argc: 0,
        });
        SeqId(self.seqs.len() - 1)
    }

    fn finalize(&mut self, mut b: SeqBuilder) {
        b.instrs.push(Instruction::new(Op::End));
        self.seqs[b.id.0] = Sequence {
            label: b.label,
            instrs: b.instrs,
            require_argc: b.require_argc,
        };
    }

    /// Patch label references and check every call site's argument count.
    fn link_call_sites(&mut self) -> Result<()> {
        let sites = std::mem::take(&mut self.call_sites);
        for site in sites {
            let required = match &site.target {
                SiteTarget::Label(name) => {
                    let Some(id) = self.label_ids.get(name).copied() else {
                        return Err(CompileError::UndefinedReference(name.clone()));
                    };
                    self.seqs[site.seq.0].instrs[site.instr].op = Op::Ref(SeqRef::Local(id));
                    self.seqs[id.0].require_argc
                }
                SiteTarget::Seq(id) => self.seqs[id.0].require_argc,
                SiteTarget::Extern(program, id) => program.seq(*id).require_argc,
            };
            if site.supplied < required {
                return Err(CompileError::TooFewArguments {
                    label: site.name,
                    required,
                    supplied: site.supplied,
                });
            }
        }
        Ok(())
    }
}

/// Collect `#name` occurrences, longest first, for the call-name matcher.
/// A prescanned name only errors if something actually references it and
/// no definition follows.
fn prescan_labels(source: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find('#') {
        rest = &rest[pos + 1..];
        let word = leading_word(rest);
        if !word.is_empty() && !names.contains(&word) {
            names.push(word);
        }
    }
    names.sort_by(|a, b| b.len().cmp(&a.len()));
    names
}

fn starts_ident(s: &str) -> bool {
    s.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
}

fn leading_word(s: &str) -> String {
    s.chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Arc<Program> {
        let mut ctx = CompilerContext::new();
        let globals = GlobalContext::new();
        ctx.compile(src, &globals).unwrap()
    }

    fn compile_err(src: &str) -> CompileError {
        let mut ctx = CompilerContext::new();
        let globals = GlobalContext::new();
        ctx.compile(src, &globals).unwrap_err()
    }

    fn root_ops(p: &Program) -> Vec<&Op> {
        p.root().instrs.iter().map(|i| &i.op).collect()
    }

    fn const_arg(instr: &Instruction, n: usize) -> f64 {
        match &instr.args[n] {
            Arg::Const(v) => *v,
            other => panic!("expected a constant argument, got {other:?}"),
        }
    }

    #[test]
    fn waits_carry_their_argument() {
        let p = compile("w10");
        let root = p.root();
        assert!(matches!(root.instrs[0].op, Op::Wait));
        assert_eq!(const_arg(&root.instrs[0], 0), 10.0);
        assert!(matches!(root.instrs[1].op, Op::End));
    }

    #[test]
    fn loops_link_their_endpoints() {
        let p = compile("[w1]3");
        let root = p.root();
        assert!(matches!(root.instrs[0].op, Op::BlockStart));
        assert!(matches!(root.instrs[2].op, Op::BlockEnd));
        assert_eq!(root.instrs[2].jump, Some(1));
        assert_eq!(const_arg(&root.instrs[2], 0), 3.0);
    }

    #[test]
    fn branches_jump_past_their_alternatives() {
        // 0 BlockStart, 1 If, 2 Wait, 3 Else, 4 Wait, 5 BlockEnd, 6 End
        let p = compile("[$1==1? w1 : w2]1");
        let root = p.root();
        assert!(matches!(root.instrs[1].op, Op::If));
        assert_eq!(root.instrs[1].jump, Some(4));
        assert!(matches!(root.instrs[3].op, Op::Else));
        assert_eq!(root.instrs[3].jump, Some(5));
        assert!(root.instrs[0].args.is_empty(), "condition moved off the [");
        assert_eq!(root.instrs[1].args.len(), 1);
    }

    #[test]
    fn select_chains_cascade_to_the_next_condition() {
        // 0 [, 1 If, 2 w1, 3 Else, 4 If, 5 w2, 6 Else, 7 w3, 8 ], 9 End
        let p = compile("[$1==1? w1 : $1==2? w2 : w3]1");
        let root = p.root();
        assert_eq!(root.instrs[1].jump, Some(4), "first miss lands on the second test");
        assert_eq!(root.instrs[4].jump, Some(7));
        assert_eq!(root.instrs[3].jump, Some(8));
        assert_eq!(root.instrs[6].jump, Some(8));
    }

    #[test]
    fn anonymous_blocks_become_inline_calls() {
        let p = compile("{w1}");
        let ops = root_ops(&p);
        assert!(matches!(ops[0], Op::Call));
        assert!(matches!(ops[1], Op::Ref(SeqRef::Local(SeqId(1)))));
        assert!(matches!(p.seq(SeqId(1)).instrs[0].op, Op::Wait));
    }

    #[test]
    fn references_after_fire_bind_without_a_call() {
        let p = compile("f3{w1}");
        let ops = root_ops(&p);
        assert!(matches!(ops[0], Op::Fire));
        assert!(matches!(ops[1], Op::Ref(_)));
        assert!(matches!(ops[2], Op::End));
    }

    #[test]
    fn labels_define_without_executing_in_place() {
        let p = compile("#sub{w5} &sub");
        let ops = root_ops(&p);
        assert!(matches!(ops[0], Op::Call));
        assert!(matches!(ops[1], Op::Ref(SeqRef::Local(SeqId(1)))));
        assert_eq!(p.seq(SeqId(1)).label.as_deref(), Some("sub"));
    }

    #[test]
    fn forward_references_are_patched() {
        let p = compile("&sub #sub{w5}");
        assert!(matches!(
            p.root().instrs[1].op,
            Op::Ref(SeqRef::Local(SeqId(1)))
        ));
    }

    #[test]
    fn argument_requirements_are_enforced_per_sequence() {
        assert!(matches!(
            compile_err("#s{w$3} &s1"),
            CompileError::TooFewArguments {
                required: 3,
                supplied: 1,
                ..
            }
        ));
        compile("#s{w$3} &s1,2,3");
        // A nested block's requirement stays its own; its arguments are
        // supplied where the block closes.
        compile("#s{w1 {w$3}1,2,3} &s");
    }

    #[test]
    fn assignments_raise_the_requirement() {
        assert!(matches!(
            compile_err("#s{$2+=1} &s"),
            CompileError::TooFewArguments { required: 2, .. }
        ));
    }

    #[test]
    fn assignment_prefix_backs_off_to_a_comparison() {
        let p = compile("[$3==4? w1]1");
        assert!(matches!(p.root().instrs[1].op, Op::If));
        assert_eq!(p.root().require_argc, 3);
    }

    #[test]
    fn user_commands_resolve_by_registry_index() {
        let mut ctx = CompilerContext::new();
        let mut globals = GlobalContext::new();
        globals.register_command("burst", |_| {});
        globals.register_command("mark", |_| {});
        let p = ctx.compile("&mark3 &burst", &globals).unwrap();
        let ops = root_ops(&p);
        assert!(matches!(ops[0], Op::UserCommand(1)));
        assert!(matches!(ops[1], Op::UserCommand(0)));
    }

    #[test]
    fn user_accessors_resolve_after_registration() {
        let mut ctx = CompilerContext::new();
        let mut globals = GlobalContext::new();
        assert!(matches!(
            ctx.compile("w$difficulty", &globals),
            Err(CompileError::UnknownAccessor(_))
        ));
        globals.register_accessor("difficulty", |_| 1.0);
        ctx.compile("w$difficulty", &globals).unwrap();
    }

    #[test]
    fn labels_from_an_earlier_compile_are_callable() {
        let mut ctx = CompilerContext::new();
        let globals = GlobalContext::new();
        ctx.compile("#lib{w1}", &globals).unwrap();
        let p = ctx.compile("&lib", &globals).unwrap();
        assert!(matches!(p.root().instrs[1].op, Op::Ref(SeqRef::Extern(..))));
    }

    #[test]
    fn failed_compiles_register_nothing() {
        let mut ctx = CompilerContext::new();
        let globals = GlobalContext::new();
        assert!(ctx.compile("#lib{w1} [", &globals).is_err());
        assert!(matches!(
            ctx.compile("&lib", &globals),
            Err(CompileError::UndefinedReference(_))
        ));
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(compile_err("]"), CompileError::UnexpectedLoopEnd));
        assert!(matches!(compile_err("[w1"), CompileError::UnclosedLoop));
        assert!(matches!(compile_err("{w1"), CompileError::UnclosedBlock));
        assert!(matches!(compile_err("}"), CompileError::UnexpectedBlockEnd));
        assert!(matches!(compile_err("w1? w2"), CompileError::MisplacedCondition));
        assert!(matches!(compile_err("[w1 : w2]"), CompileError::MisplacedElse));
        assert!(matches!(compile_err("#a w"), CompileError::LabelWithoutBlock(_)));
        assert!(matches!(
            compile_err("#a{} #a{}"),
            CompileError::DuplicateLabel(_)
        ));
        assert!(matches!(compile_err("5"), CompileError::DanglingFormula));
        assert!(matches!(
            compile_err("w1+"),
            CompileError::MalformedFormula { .. }
        ));
    }

    #[test]
    fn comma_gaps_become_missing_arguments() {
        let p = compile("p,5");
        let instr = &p.root().instrs[0];
        assert!(matches!(instr.args[0], Arg::Missing));
        assert_eq!(const_arg(instr, 1), 5.0);
    }

    #[test]
    fn trailing_commas_leave_a_gap() {
        let p = compile("v3,");
        let instr = &p.root().instrs[0];
        assert_eq!(instr.args.len(), 2);
        assert!(matches!(instr.args[1], Arg::Missing));
    }

    #[test]
    fn formulas_fold_when_static() {
        let p = compile("w(2+3)*4");
        assert_eq!(const_arg(&p.root().instrs[0], 0), 20.0);
    }

    #[test]
    fn accessor_names_prefer_the_longest_builtin() {
        // $p.x is the parent's position, not $p followed by garbage.
        let p = compile("p$p.x,$p.y");
        let instr = &p.root().instrs[0];
        assert!(matches!(instr.args[0], Arg::Expr(_)));
        assert!(matches!(instr.args[1], Arg::Expr(_)));
    }

    #[test]
    fn rank_reads_and_writes() {
        let p = compile("$r=$r+1 w$r2");
        assert!(matches!(
            p.root().instrs[0].op,
            Op::Assign(AssignTarget::Rank, AssignOp::Set)
        ));
    }

    #[test]
    fn text_attaches_as_an_instruction() {
        let mut ctx = CompilerContext::new();
        let mut globals = GlobalContext::new();
        globals.register_command("say", |_| {});
        let p = ctx.compile("&say'hello'", &globals).unwrap();
        let ops = root_ops(&p);
        assert!(matches!(ops[0], Op::UserCommand(0)));
        assert!(matches!(ops[1], Op::Text(_)));
    }

    #[test]
    fn empty_source_compiles_to_an_empty_program() {
        let p = compile("  // nothing\n");
        assert!(p.is_empty());
    }
}
