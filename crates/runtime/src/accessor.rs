//! Value accessors
//!
//! Every `$...` reference in a formula resolves at compile time to one of
//! these tags; at run time the tag is evaluated against the live fiber, the
//! entity arena and the global context. Accessors on a subject whose entity
//! is gone evaluate to 0.0 rather than failing, so a formula can never kill
//! a fiber on its own.

use crate::context::GlobalContext;
use crate::entity::{EntityArena, EntityState};
use crate::fiber::Fiber;

/// Which entity an entity-bound accessor reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// The entity controlled by the evaluating fiber.
    This,
    /// That entity's parent.
    Parent,
    /// The fiber's target.
    Target,
}

/// A compiled `$...` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    /// `$`, `$1`..`$9` (0-based slot).
    Var(u8),
    /// `$?` in [0, 1).
    Rand,
    /// `$??` in [-1, 1).
    RandSigned,
    /// `$i` — the fiber's interval.
    Interval,
    /// `$r` — the controlled entity's rank.
    EntityRank,
    /// `$r1`..`$r9` — global rank slots.
    GlobalRank(u8),
    /// `$l`, `$l0`..`$l9` — loop counter, 0 = innermost.
    LoopCount(u8),
    PosX(Subject),
    PosY(Subject),
    /// Sign of the x position, -1 or 1.
    SignX(Subject),
    SignY(Subject),
    /// Velocity magnitude.
    Speed(Subject),
    VelX(Subject),
    VelY(Subject),
    /// Angle on screen.
    Heading(Subject),
    /// Distance from the subject to the fiber's target. `$t.td` is a fixed
    /// 0 by definition.
    TargetDistance(Subject),
    /// Registered user accessor by registry index.
    User(usize),
}

/// Everything an accessor may read during evaluation.
pub struct EvalContext<'a> {
    pub fiber: &'a Fiber,
    pub world: &'a EntityArena,
    pub globals: &'a GlobalContext,
}

impl<'a> EvalContext<'a> {
    fn subject(&self, subject: Subject) -> Option<&EntityState> {
        match subject {
            Subject::This => self.world.get(self.fiber.object),
            Subject::Parent => {
                let this = self.world.get(self.fiber.object)?;
                self.world.get(this.parent)
            }
            Subject::Target => self.world.get(self.fiber.target),
        }
    }

    /// Read an entity property, 0.0 when the subject is gone.
    fn read(&self, subject: Subject, f: impl Fn(&EntityState) -> f64) -> f64 {
        self.subject(subject).map(f).unwrap_or(0.0)
    }

    fn target_distance(&self, subject: Subject) -> f64 {
        let Some(from) = self.subject(subject) else {
            return 0.0;
        };
        let Some(to) = self.subject(Subject::Target) else {
            return 0.0;
        };
        let dx = to.pos_x - from.pos_x;
        let dy = to.pos_y - from.pos_y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl Accessor {
    pub fn eval(self, cx: &EvalContext<'_>) -> f64 {
        match self {
            Accessor::Var(slot) => cx.fiber.var(slot as usize),
            Accessor::Rand => cx.globals.rand(),
            Accessor::RandSigned => cx.globals.rand() * 2.0 - 1.0,
            Accessor::Interval => cx.fiber.interval,
            Accessor::EntityRank => cx.read(Subject::This, |e| e.rank),
            Accessor::GlobalRank(slot) => cx.globals.rank(slot as usize),
            Accessor::LoopCount(nest) => cx.fiber.loop_counter(nest as usize),
            Accessor::PosX(s) => cx.read(s, |e| e.pos_x),
            Accessor::PosY(s) => cx.read(s, |e| e.pos_y),
            Accessor::SignX(s) => cx.read(s, |e| if e.pos_x < 0.0 { -1.0 } else { 1.0 }),
            Accessor::SignY(s) => cx.read(s, |e| if e.pos_y < 0.0 { -1.0 } else { 1.0 }),
            Accessor::Speed(s) => cx.read(s, |e| (e.vel_x * e.vel_x + e.vel_y * e.vel_y).sqrt()),
            Accessor::VelX(s) => cx.read(s, |e| e.vel_x),
            Accessor::VelY(s) => cx.read(s, |e| e.vel_y),
            Accessor::Heading(s) => cx.read(s, |e| e.angle),
            Accessor::TargetDistance(Subject::Target) => 0.0,
            Accessor::TargetDistance(s) => cx.target_distance(s),
            Accessor::User(idx) => cx.globals.eval_user_accessor(idx, cx),
        }
    }
}
