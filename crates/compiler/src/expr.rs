//! Formula compiler
//!
//! Builds the runtime's postfix term lists from infix formula tokens via a
//! shunting-yard pass. Formulas made only of literals are folded to plain
//! constants so the engine never evaluates them.

use cml_runtime::accessor::Accessor;
use cml_runtime::ir::{Arg, BinOp, Expr, Term};

use crate::error::{CompileError, Result};

enum StackOp {
    Bin(BinOp),
    Neg,
    Paren,
}

/// Precedence of unary minus; binds tighter than any binary operator.
const NEG_PRECEDENCE: u8 = 4;

/// Incremental builder for one formula.
pub struct ExprBuilder {
    output: Vec<Term>,
    stack: Vec<StackOp>,
    expect_operand: bool,
    depth: usize,
    max_reference: usize,
    dynamic: bool,
}

impl ExprBuilder {
    pub fn new() -> Self {
        Self {
            output: Vec::new(),
            stack: Vec::new(),
            expect_operand: true,
            depth: 0,
            max_reference: 0,
            dynamic: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.stack.is_empty()
    }

    /// True while the next token must be an operand (or a prefix).
    pub fn expects_operand(&self) -> bool {
        self.expect_operand
    }

    /// Open parenthesis depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Highest positional-argument index referenced, plus one.
    pub fn max_reference(&self) -> usize {
        self.max_reference
    }

    pub fn push_number(&mut self, v: f64) {
        self.output.push(Term::Num(v));
        self.expect_operand = false;
    }

    pub fn push_accessor(&mut self, acc: Accessor) {
        if let Accessor::Var(slot) = acc {
            self.max_reference = self.max_reference.max(slot as usize + 1);
        }
        self.dynamic = true;
        self.output.push(Term::Get(acc));
        self.expect_operand = false;
    }

    pub fn push_neg(&mut self) {
        self.stack.push(StackOp::Neg);
    }

    pub fn push_operator(&mut self, op: BinOp) {
        while let Some(top) = self.stack.last() {
            let pops = match top {
                StackOp::Neg => NEG_PRECEDENCE >= op.precedence(),
                StackOp::Bin(t) => t.precedence() >= op.precedence(),
                StackOp::Paren => false,
            };
            if !pops {
                break;
            }
            self.pop_to_output();
        }
        self.stack.push(StackOp::Bin(op));
        self.expect_operand = true;
    }

    pub fn open_paren(&mut self) {
        self.stack.push(StackOp::Paren);
        self.depth += 1;
    }

    pub fn close_paren(&mut self, near: &str) -> Result<()> {
        loop {
            match self.stack.last() {
                Some(StackOp::Paren) => {
                    self.stack.pop();
                    self.depth -= 1;
                    self.expect_operand = false;
                    return Ok(());
                }
                Some(_) => self.pop_to_output(),
                None => {
                    return Err(CompileError::MalformedFormula {
                        near: near.to_string(),
                    });
                }
            }
        }
    }

    pub fn finish(mut self, near: &str) -> Result<Arg> {
        let malformed = || CompileError::MalformedFormula {
            near: near.to_string(),
        };
        if self.expect_operand || self.depth > 0 {
            return Err(malformed());
        }
        while let Some(top) = self.stack.last() {
            if matches!(top, StackOp::Paren) {
                return Err(malformed());
            }
            self.pop_to_output();
        }
        if !self.dynamic {
            return fold(&self.output).map(Arg::Const).ok_or_else(malformed);
        }
        Ok(Arg::Expr(Expr { terms: self.output }))
    }

    fn pop_to_output(&mut self) {
        match self.stack.pop() {
            Some(StackOp::Bin(op)) => self.output.push(Term::Bin(op)),
            Some(StackOp::Neg) => self.output.push(Term::Neg),
            _ => {}
        }
    }
}

impl Default for ExprBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a term list with no accessor references.
fn fold(terms: &[Term]) -> Option<f64> {
    let mut stack: Vec<f64> = Vec::new();
    for term in terms {
        match term {
            Term::Num(v) => stack.push(*v),
            Term::Neg => {
                let v = stack.pop()?;
                stack.push(-v);
            }
            Term::Bin(op) => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(op.apply(lhs, rhs));
            }
            Term::Get(_) => return None,
        }
    }
    (stack.len() == 1).then(|| stack[0])
}
