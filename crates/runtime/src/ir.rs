//! Compiled instruction graph
//!
//! The compiler lowers source text into this representation; the engine
//! interprets it. A [`Program`] holds every sequence produced by one
//! compilation under stable [`SeqId`]s, so sequences within a program may
//! reference each other freely (including mutual recursion). References to
//! sequences from earlier compilations carry their own `Arc<Program>`, which
//! is acyclic by construction.
//!
//! # Design
//!
//! - Instructions are addressed by index within their sequence; "next" is
//!   implicit (`pc + 1`) and loop/branch cross-links are explicit indices in
//!   [`Instruction::jump`], so the engine never re-scans the chain.
//! - Expressions are flat postfix term lists evaluated against an
//!   [`EvalContext`](crate::accessor::EvalContext); all name resolution
//!   happened at compile time.

use std::sync::Arc;

use crate::accessor::{Accessor, EvalContext};
use crate::types::HeadMode;

/// Index of a sequence within its [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqId(pub usize);

/// A compiled program: every sequence from one compilation. The entry
/// sequence is always [`Program::ROOT`].
#[derive(Debug)]
pub struct Program {
    pub seqs: Vec<Sequence>,
}

impl Program {
    pub const ROOT: SeqId = SeqId(0);

    pub fn root(&self) -> &Sequence {
        &self.seqs[0]
    }

    pub fn seq(&self, id: SeqId) -> &Sequence {
        &self.seqs[id.0]
    }

    /// A program whose entry sequence holds nothing but the end marker.
    pub fn is_empty(&self) -> bool {
        self.root().is_empty()
    }
}

/// One callable unit: a top-level script or a nested block. Immutable and
/// shareable once compiled; many fibers may interpret it concurrently.
#[derive(Debug)]
pub struct Sequence {
    pub label: Option<String>,
    pub instrs: Vec<Instruction>,
    /// Highest positional-argument index referenced directly by this
    /// sequence's own instructions (nested blocks not included). Call sites
    /// must supply at least this many arguments.
    pub require_argc: usize,
}

impl Sequence {
    /// True when the sequence holds only its end marker.
    pub fn is_empty(&self) -> bool {
        self.instrs.len() <= 1
    }
}

/// Reference to a sequence, either within the same program or in a
/// previously compiled one.
#[derive(Debug, Clone)]
pub enum SeqRef {
    Local(SeqId),
    Extern(Arc<Program>, SeqId),
}

impl SeqRef {
    /// Resolve against the program currently being interpreted.
    pub fn resolve(&self, current: &Arc<Program>) -> (Arc<Program>, SeqId) {
        match self {
            SeqRef::Local(id) => (Arc::clone(current), *id),
            SeqRef::Extern(program, id) => (Arc::clone(program), *id),
        }
    }
}

/// One compiled operation node.
#[derive(Debug)]
pub struct Instruction {
    pub op: Op,
    pub args: Vec<Arg>,
    /// Loop/branch cross-link: `[` ↔ `]` and the `?`/`:` chain between them.
    pub jump: Option<usize>,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            args: Vec::new(),
            jump: None,
        }
    }
}

/// Operation tags, resolved once at compile time. The engine dispatches on
/// this enum directly; no string lookup happens per tick.
#[derive(Debug)]
pub enum Op {
    /// `w` — set wait time (if given) and suspend for it.
    Wait,
    /// `~` — secondary wait timer.
    LongWait,
    /// `i` — set the fiber interval.
    Interval,
    /// `p x,y` — set entity position.
    SetPos,
    /// `v x,y` — set entity velocity.
    SetVel,
    /// `vd s` — velocity of speed `s` along the heading.
    SetVelDir,
    /// `r a` — set entity angle to heading + offset.
    Rotate,
    /// `ht`/`ha`/`ho`/`hp`/`hv`/`hs` — select heading mode and offset.
    Head(HeadMode),
    /// `m` — set the invert flag bitmask.
    Invert,
    /// `f s` — fire a projectile entity along the heading.
    Fire,
    /// `n` — spawn a child entity in place.
    New,
    /// `@` — parameter-inheriting child fiber on the same entity.
    Fork,
    /// `@o` — child fiber with fresh parameters.
    ForkPlain,
    /// `@ko` — destruction handler in the reserved slot.
    ForkDest,
    /// `kf` — terminate this fiber.
    KillFiber,
    /// `ko` — mark this fiber's entity destroyed.
    KillObject,
    /// `$n=` / `$r=` family.
    Assign(AssignTarget, AssignOp),
    /// `&` — inline call of the following reference.
    Call,
    /// Call target; a no-op when stepped over. Its arguments are evaluated
    /// by the consuming `Call`/fork/fire instruction.
    Ref(SeqRef),
    /// `'...'` — string payload for user commands; a no-op when stepped.
    Text(Arc<str>),
    /// `&name` resolved to a registered user command.
    UserCommand(usize),
    /// `[`
    BlockStart,
    /// `?`
    If,
    /// `:`
    Else,
    /// `]` — repeat count in `args[0]`, absent means forever.
    BlockEnd,
    /// Suspends until the bound entity reports a destruction status, then
    /// enters the fiber's registered follow-up sequence.
    WaitDestruction,
    /// Sequence terminator; returns from an inline call or finishes the
    /// fiber.
    End,
}

/// Assignment destination.
#[derive(Debug, Clone, Copy)]
pub enum AssignTarget {
    /// Fiber variable slot (0-based).
    Var(u8),
    /// The entity's rank scalar.
    Rank,
}

/// Assignment operator.
#[derive(Debug, Clone, Copy)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            AssignOp::Set => rhs,
            AssignOp::Add => lhs + rhs,
            AssignOp::Sub => lhs - rhs,
            AssignOp::Mul => lhs * rhs,
            AssignOp::Div => lhs / rhs,
        }
    }
}

/// One positional argument of an instruction.
#[derive(Debug)]
pub enum Arg {
    /// Statically known value, folded at compile time.
    Const(f64),
    /// Depends on the live execution context.
    Expr(Expr),
    /// Positional gap (`,` with nothing before it); evaluates to NaN so the
    /// consuming operation can fall back to its default.
    Missing,
}

impl Arg {
    pub fn eval(&self, cx: &EvalContext<'_>) -> f64 {
        match self {
            Arg::Const(v) => *v,
            Arg::Expr(e) => e.eval(cx),
            Arg::Missing => f64::NAN,
        }
    }
}

/// A compiled arithmetic expression in postfix order.
#[derive(Debug)]
pub struct Expr {
    pub terms: Vec<Term>,
}

impl Expr {
    pub fn eval(&self, cx: &EvalContext<'_>) -> f64 {
        let mut stack: Vec<f64> = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            match term {
                Term::Num(v) => stack.push(*v),
                Term::Get(acc) => stack.push(acc.eval(cx)),
                Term::Neg => {
                    let v = stack.pop().unwrap_or(0.0);
                    stack.push(-v);
                }
                Term::Bin(op) => {
                    let rhs = stack.pop().unwrap_or(0.0);
                    let lhs = stack.pop().unwrap_or(0.0);
                    stack.push(op.apply(lhs, rhs));
                }
            }
        }
        stack.pop().unwrap_or(0.0)
    }
}

/// One postfix term.
#[derive(Debug)]
pub enum Term {
    Num(f64),
    Get(Accessor),
    Neg,
    Bin(BinOp),
}

/// Binary operators with conventional precedence (resolved at compile
/// time). Comparisons evaluate to 1.0 or 0.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl BinOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinOp::Add => lhs + rhs,
            BinOp::Sub => lhs - rhs,
            BinOp::Mul => lhs * rhs,
            BinOp::Div => lhs / rhs,
            BinOp::Mod => lhs % rhs,
            BinOp::Eq => (lhs == rhs) as u8 as f64,
            BinOp::Ne => (lhs != rhs) as u8 as f64,
            BinOp::Ge => (lhs >= rhs) as u8 as f64,
            BinOp::Le => (lhs <= rhs) as u8 as f64,
            BinOp::Gt => (lhs > rhs) as u8 as f64,
            BinOp::Lt => (lhs < rhs) as u8 as f64,
        }
    }

    /// Binding strength for the expression builder.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Mul | BinOp::Div | BinOp::Mod => 3,
            BinOp::Add | BinOp::Sub => 2,
            _ => 1,
        }
    }
}
