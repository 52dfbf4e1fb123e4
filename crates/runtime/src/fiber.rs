//! Fiber pool
//!
//! Cooperative execution contexts, pooled in a slot arena with a free list.
//! Slot 0 is the root fiber: it never executes instructions and only anchors
//! the tree of top-level fibers so tick order (parent before children,
//! siblings in creation order) falls out of a plain tree walk.
//!
//! Releasing a slot bumps its generation, so a [`FiberHandle`] held across a
//! release resolves to `None` instead of the slot's next occupant.

use std::sync::Arc;

use crate::ir::{Program, SeqId};
use crate::types::{ARG_WIDTH, EntityHandle, FiberHandle, HeadMode};

/// Position of a fiber within a program: the sequence being interpreted and
/// the index of the next instruction.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub program: Arc<Program>,
    pub seq: SeqId,
    pub pc: usize,
}

/// A sequence entry point with the arguments it was registered with, held
/// for deferred runs (the fire sequence, destruction follow-ups).
#[derive(Clone)]
pub struct SeqEntry {
    pub program: Arc<Program>,
    pub seq: SeqId,
    pub args: Vec<f64>,
}

/// One cooperative execution context.
pub struct Fiber {
    /// Entity this fiber controls. The fiber self-terminates when the
    /// handle goes stale.
    pub object: EntityHandle,
    pub target: EntityHandle,
    /// Access id given at fork time; for destruction handlers this is the
    /// status filter (0 matches any).
    pub access_id: i32,
    /// Spawn-nesting depth, checked against the configured limit.
    pub gene: usize,
    pub parent: FiberHandle,
    pub children: Vec<FiberHandle>,
    /// None once the fiber ran off its program; it is released when its
    /// children are gone too.
    pub cursor: Option<Cursor>,
    /// Return cursors of inline calls.
    pub callstack: Vec<Cursor>,
    /// Variable frames; the last one is current. One frame per inline call.
    pub vars: Vec<[f64; ARG_WIDTH]>,
    /// Loop counters; the last one is the innermost loop.
    pub lcnt: Vec<f64>,
    /// Invert flags saved across inline calls.
    pub istc: Vec<u8>,
    pub invert: u8,
    /// Remaining wait, in ticks.
    pub wcnt: u32,
    /// Waiting time for `w`.
    pub wtm1: f64,
    /// Waiting time for `~`.
    pub wtm2: f64,
    /// Interval value (`i` command, read back by `$i`).
    pub interval: f64,
    pub head_mode: HeadMode,
    /// Heading offset, radians.
    pub head_angle: f64,
    /// Angle of the last `f`, base for sequence-mode headings.
    pub fired_angle: f64,
    /// Sequence attached to the last `f`, reused by a bare `f`.
    pub seq_fired: Option<SeqEntry>,
    /// Follow-up for a destruction handler.
    pub dest_ref: Option<SeqEntry>,
    /// True for `@ko` handler fibers.
    pub is_dest: bool,
    /// Last tick this fiber was stepped; prevents double-stepping fibers
    /// spawned mid-tick.
    pub stepped_tick: u64,
}

impl Fiber {
    pub fn new(object: EntityHandle, target: EntityHandle) -> Self {
        Self {
            object,
            target,
            access_id: 0,
            gene: 0,
            parent: FiberHandle {
                index: 0,
                generation: 0,
            },
            children: Vec::new(),
            cursor: None,
            callstack: Vec::new(),
            vars: vec![[0.0; ARG_WIDTH]],
            lcnt: Vec::new(),
            istc: Vec::new(),
            invert: 0,
            wcnt: 0,
            wtm1: 1.0,
            wtm2: 1.0,
            interval: 0.0,
            head_mode: HeadMode::Aim,
            head_angle: 0.0,
            fired_angle: 0.0,
            seq_fired: None,
            dest_ref: None,
            is_dest: false,
            stepped_tick: 0,
        }
    }

    /// Copy the parameters a `@` fork inherits from its parent.
    pub fn inherit_params(&mut self, src: &Fiber) {
        self.target = src.target;
        self.interval = src.interval;
        self.head_mode = src.head_mode;
        self.head_angle = src.head_angle;
        self.fired_angle = src.fired_angle;
        self.wtm1 = src.wtm1;
        self.wtm2 = src.wtm2;
        self.seq_fired = src.seq_fired.clone();
    }

    /// Current value of variable slot `idx` (0-based).
    pub fn var(&self, idx: usize) -> f64 {
        match self.vars.last() {
            Some(frame) => frame.get(idx).copied().unwrap_or(0.0),
            None => 0.0,
        }
    }

    pub fn set_var(&mut self, idx: usize, value: f64) {
        if let Some(frame) = self.vars.last_mut()
            && let Some(slot) = frame.get_mut(idx)
        {
            *slot = value;
        }
    }

    /// Loop counter at nesting depth `nest`, 0 = innermost.
    pub fn loop_counter(&self, nest: usize) -> f64 {
        if nest < self.lcnt.len() {
            self.lcnt[self.lcnt.len() - 1 - nest]
        } else {
            0.0
        }
    }

    /// Push a zero-padded argument frame for an inline call.
    pub fn push_frame(&mut self, args: &[f64]) {
        let mut frame = [0.0; ARG_WIDTH];
        for (slot, v) in frame.iter_mut().zip(args) {
            *slot = *v;
        }
        self.vars.push(frame);
        self.istc.push(self.invert);
    }

    pub fn pop_frame(&mut self) {
        self.vars.pop();
        if let Some(flag) = self.istc.pop() {
            self.invert = flag;
        }
    }
}

struct Slot {
    fiber: Fiber,
    generation: u32,
    occupied: bool,
}

/// Pool of fiber slots. Allocation reuses released slots before growing.
pub struct FiberArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl FiberArena {
    pub const ROOT: FiberHandle = FiberHandle {
        index: 0,
        generation: 0,
    };

    /// A fresh arena with the root fiber installed at slot 0.
    pub fn new() -> Self {
        let mut root = Fiber::new(EntityHandle::NULL, EntityHandle::NULL);
        root.stepped_tick = u64::MAX;
        Self {
            slots: vec![Slot {
                fiber: root,
                generation: 0,
                occupied: true,
            }],
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, fiber: Fiber) -> FiberHandle {
        match self.free.pop() {
            Some(i) => {
                let slot = &mut self.slots[i];
                slot.fiber = fiber;
                slot.occupied = true;
                FiberHandle {
                    index: i,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    fiber,
                    generation: 0,
                    occupied: true,
                });
                FiberHandle {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, h: FiberHandle) -> Option<&Fiber> {
        let slot = self.slots.get(h.index)?;
        (slot.occupied && slot.generation == h.generation).then_some(&slot.fiber)
    }

    pub fn get_mut(&mut self, h: FiberHandle) -> Option<&mut Fiber> {
        let slot = self.slots.get_mut(h.index)?;
        (slot.occupied && slot.generation == h.generation).then_some(&mut slot.fiber)
    }

    pub fn is_live(&self, h: FiberHandle) -> bool {
        self.get(h).is_some()
    }

    /// Release a slot back to the pool. The root slot is never released.
    pub fn release(&mut self, h: FiberHandle) {
        if h.index == 0 {
            return;
        }
        let Some(slot) = self.slots.get_mut(h.index) else {
            return;
        };
        if !slot.occupied || slot.generation != h.generation {
            return;
        }
        slot.occupied = false;
        slot.generation += 1;
        slot.fiber.children.clear();
        slot.fiber.cursor = None;
        slot.fiber.seq_fired = None;
        slot.fiber.dest_ref = None;
        self.free.push(h.index);
    }

    /// Handles of live fibers running on `object`, root excluded.
    pub fn on_object(&self, object: EntityHandle) -> Vec<FiberHandle> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, s)| s.occupied && s.fiber.object == object)
            .map(|(i, s)| FiberHandle {
                index: i,
                generation: s.generation,
            })
            .collect()
    }

    /// Live fibers excluding the root.
    pub fn active_count(&self) -> usize {
        self.slots.iter().skip(1).filter(|s| s.occupied).count()
    }
}

impl Default for FiberArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused_with_a_new_generation() {
        let mut pool = FiberArena::new();
        let a = pool.alloc(Fiber::new(EntityHandle::NULL, EntityHandle::NULL));
        pool.release(a);
        let b = pool.alloc(Fiber::new(EntityHandle::NULL, EntityHandle::NULL));
        assert_eq!(a.index, b.index);
        assert!(!pool.is_live(a));
        assert!(pool.is_live(b));
    }

    #[test]
    fn the_root_slot_cannot_be_released() {
        let mut pool = FiberArena::new();
        pool.release(FiberArena::ROOT);
        assert!(pool.is_live(FiberArena::ROOT));
    }

    #[test]
    fn fibers_resolve_by_their_entity() {
        let mut pool = FiberArena::new();
        let e = EntityHandle {
            index: 7,
            generation: 0,
        };
        let a = pool.alloc(Fiber::new(e, EntityHandle::NULL));
        let _other = pool.alloc(Fiber::new(EntityHandle::NULL, EntityHandle::NULL));
        assert_eq!(pool.on_object(e), vec![a]);
        pool.release(a);
        assert!(pool.on_object(e).is_empty());
    }

    #[test]
    fn frames_restore_the_invert_flag() {
        let mut fiber = Fiber::new(EntityHandle::NULL, EntityHandle::NULL);
        fiber.invert = 3;
        fiber.push_frame(&[1.0, 2.0]);
        fiber.invert = 0;
        assert_eq!(fiber.var(0), 1.0);
        assert_eq!(fiber.var(1), 2.0);
        assert_eq!(fiber.var(8), 0.0);
        fiber.pop_frame();
        assert_eq!(fiber.invert, 3);
    }

    #[test]
    fn loop_counters_index_from_the_innermost() {
        let mut fiber = Fiber::new(EntityHandle::NULL, EntityHandle::NULL);
        fiber.lcnt = vec![5.0, 2.0];
        assert_eq!(fiber.loop_counter(0), 2.0);
        assert_eq!(fiber.loop_counter(1), 5.0);
        assert_eq!(fiber.loop_counter(2), 0.0);
    }
}
