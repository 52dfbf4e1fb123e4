//! Execution engine
//!
//! Interprets compiled programs over a pool of cooperative fibers. One call
//! to [`Engine::advance`] is one tick: every fiber tree is stepped once,
//! parent before children and siblings in creation order, then the entity
//! arena closes the tick (motion, update callbacks, bounds cull, destruction
//! sweep).
//!
//! # Design
//!
//! - A newly spawned fiber runs its first instruction slice inside the
//!   spawning call, and its tick stamp keeps the tree walk from stepping it
//!   again in the same tick. `w10` therefore ends on exactly the tenth
//!   `advance` after `execute`.
//! - A fiber suspends only at a wait; everything between two waits runs in
//!   one slice, bounded by [`EngineConfig::max_steps_per_tick`].
//! - Limit violations destroy the offending fiber tree and surface as
//!   [`Error`] values; stale entity or target handles are structural
//!   (self-termination, default-target fallback), never errors.

use std::f64::consts::PI;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::accessor::EvalContext;
use crate::context::{CommandCall, GlobalContext};
use crate::entity::{EntityArena, EntityState};
use crate::error::{Error, Result};
use crate::fiber::{Cursor, Fiber, FiberArena, SeqEntry};
use crate::ir::{Arg, AssignTarget, Instruction, Op, Program, SeqId, Sequence};
use crate::types::{EngineConfig, EntityHandle, FiberHandle, HeadMode};

/// Outcome of executing one instruction.
enum Flow {
    /// Keep running this slice.
    Continue,
    /// Wait reached; resume on a later tick.
    Suspend,
    /// Ran off the program; the fiber lingers only for its children.
    Finish,
    /// The fiber destroyed itself; its slot is already released.
    Killed,
}

/// The fiber scheduler.
pub struct Engine {
    fibers: FiberArena,
    config: EngineConfig,
    tick: u64,
    default_target: EntityHandle,
    /// Body of destruction-handler fibers: wait for the status, then enter
    /// the registered follow-up.
    wait_dest: Arc<Program>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let wait_dest = Arc::new(Program {
            seqs: vec![Sequence {
                label: None,
                instrs: vec![
                    Instruction::new(Op::WaitDestruction),
                    Instruction::new(Op::End),
                ],
                require_argc: 0,
            }],
        });
        Self {
            fibers: FiberArena::new(),
            config,
            tick: 0,
            default_target: EntityHandle::NULL,
            wait_dest,
        }
    }

    /// Target used by fibers whose own target went stale, and by fresh
    /// spawns.
    pub fn set_default_target(&mut self, target: EntityHandle) {
        self.default_target = target;
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn is_alive(&self, h: FiberHandle) -> bool {
        self.fibers.is_live(h)
    }

    /// Live fibers, the root excluded.
    pub fn active_count(&self) -> usize {
        self.fibers.active_count()
    }

    /// Start a top-level fiber running `program` on `object`. The fiber's
    /// first slice runs before this returns. An empty program spawns
    /// nothing.
    pub fn execute(
        &mut self,
        program: &Arc<Program>,
        object: EntityHandle,
        args: &[f64],
        world: &mut EntityArena,
        globals: &GlobalContext,
    ) -> Result<Option<FiberHandle>> {
        self.execute_inverted(program, object, args, 0, world, globals)
    }

    /// [`execute`](Self::execute) with the spawned fiber's invert flag
    /// preset, for hosts that mirror whole patterns.
    pub fn execute_inverted(
        &mut self,
        program: &Arc<Program>,
        object: EntityHandle,
        args: &[f64],
        invert: u8,
        world: &mut EntityArena,
        globals: &GlobalContext,
    ) -> Result<Option<FiberHandle>> {
        if program.is_empty() {
            return Ok(None);
        }
        debug!(tick = self.tick, "starting top-level fiber");
        let entry = SeqEntry {
            program: Arc::clone(program),
            seq: Program::ROOT,
            args: args.to_vec(),
        };
        let h = self.alloc_checked(FiberArena::ROOT, FiberArena::ROOT, object, &entry, 1)?;
        if invert != 0
            && let Some(f) = self.fibers.get_mut(h)
        {
            f.invert = invert;
        }
        self.ignite(h, world, globals)?;
        Ok(Some(h))
    }

    /// Run one tick over every fiber tree, then close the entity tick.
    pub fn advance(&mut self, world: &mut EntityArena, globals: &GlobalContext) -> Result<()> {
        self.tick += 1;
        self.step_tree(FiberArena::ROOT, world, globals)?;
        world.end_tick(globals);
        Ok(())
    }

    /// Terminate a fiber and every descendant.
    pub fn destroy(&mut self, h: FiberHandle) {
        self.destroy_subtree(h);
    }

    /// Terminate every fiber running on `object`.
    pub fn destroy_all_on(&mut self, object: EntityHandle) {
        debug!("destroying fibers on one entity");
        for h in self.fibers.on_object(object) {
            if self.fibers.is_live(h) {
                self.destroy_subtree(h);
            }
        }
    }

    /// Terminate every fiber except the root.
    pub fn destroy_all(&mut self) {
        debug!("destroying all fibers");
        let children = match self.fibers.get(FiberArena::ROOT) {
            Some(root) => root.children.clone(),
            None => return,
        };
        for c in children {
            self.destroy_subtree(c);
        }
        if let Some(root) = self.fibers.get_mut(FiberArena::ROOT) {
            root.children.clear();
        }
    }

    // -- tree walk ---------------------------------------------------------

    fn step_tree(
        &mut self,
        h: FiberHandle,
        world: &mut EntityArena,
        globals: &GlobalContext,
    ) -> Result<()> {
        let is_root = h == FiberArena::ROOT;
        if !is_root {
            let Some(fiber) = self.fibers.get_mut(h) else {
                return Ok(());
            };
            if !world.is_live(fiber.object) {
                self.destroy_subtree(h);
                return Ok(());
            }
            if !world.is_live(fiber.target) {
                fiber.target = self.default_target;
            }
            if fiber.stepped_tick < self.tick {
                fiber.stepped_tick = self.tick;
                if fiber.wcnt > 0 {
                    fiber.wcnt -= 1;
                }
                if fiber.wcnt == 0 && fiber.cursor.is_some() {
                    self.run_slice(h, world, globals)?;
                }
            }
        }

        let children = match self.fibers.get(h) {
            Some(fiber) => fiber.children.clone(),
            None => return Ok(()),
        };
        for c in &children {
            self.step_tree(*c, world, globals)?;
        }

        // Reap: drop stale child handles, release when fully finished. The
        // list is re-read because a child's slice may have spawned fresh
        // fibers onto this node mid-walk.
        let mut current = match self.fibers.get_mut(h) {
            Some(fiber) => std::mem::take(&mut fiber.children),
            None => return Ok(()),
        };
        current.retain(|c| self.fibers.is_live(*c));
        let mut finished = false;
        if let Some(fiber) = self.fibers.get_mut(h) {
            fiber.children = current;
            finished = !is_root && fiber.cursor.is_none() && fiber.children.is_empty();
        }
        if finished {
            self.fibers.release(h);
        }
        Ok(())
    }

    fn run_slice(
        &mut self,
        h: FiberHandle,
        world: &mut EntityArena,
        globals: &GlobalContext,
    ) -> Result<()> {
        let mut steps = 0usize;
        loop {
            steps += 1;
            if steps > self.config.max_steps_per_tick {
                self.destroy_subtree(h);
                return Err(Error::MissingWait {
                    limit: self.config.max_steps_per_tick,
                });
            }
            match self.exec(h, world, globals)? {
                Flow::Continue => {}
                Flow::Suspend => return Ok(()),
                Flow::Finish => {
                    if let Some(fiber) = self.fibers.get_mut(h) {
                        fiber.cursor = None;
                    }
                    return Ok(());
                }
                Flow::Killed => return Ok(()),
            }
        }
    }

    // -- instruction dispatch ----------------------------------------------

    fn exec(
        &mut self,
        h: FiberHandle,
        world: &mut EntityArena,
        globals: &GlobalContext,
    ) -> Result<Flow> {
        let Some(fiber) = self.fibers.get(h) else {
            return Ok(Flow::Killed);
        };
        let Some(cursor) = fiber.cursor.clone() else {
            return Ok(Flow::Finish);
        };
        let program = cursor.program;
        let seq = program
            .seqs
            .get(cursor.seq.0)
            .ok_or(Error::CorruptProgram("sequence index out of range"))?;
        let Some(instr) = seq.instrs.get(cursor.pc) else {
            return Err(Error::CorruptProgram("cursor ran past the end marker"));
        };

        let vals = self.eval_args(h, world, globals, &instr.args);
        let mut next_pc = cursor.pc + 1;

        match &instr.op {
            Op::Wait => {
                let fiber = self.must(h)?;
                if let Some(v) = given(&vals, 0) {
                    fiber.wtm1 = v;
                }
                let ticks = fiber.wtm1.max(0.0) as u32;
                if ticks > 0 {
                    fiber.wcnt = ticks;
                    self.set_pc(h, &program, cursor.seq, next_pc)?;
                    return Ok(Flow::Suspend);
                }
            }
            Op::LongWait => {
                let fiber = self.must(h)?;
                if let Some(v) = given(&vals, 0) {
                    fiber.wtm2 = v;
                }
                let ticks = fiber.wtm2.max(0.0) as u32;
                if ticks > 0 {
                    fiber.wcnt = ticks;
                    self.set_pc(h, &program, cursor.seq, next_pc)?;
                    return Ok(Flow::Suspend);
                }
            }
            Op::Interval => {
                self.must(h)?.interval = def(&vals, 0, 0.0);
            }
            Op::SetPos => {
                let (x, y) = self.invert_xy(h, def(&vals, 0, 0.0), def(&vals, 1, 0.0))?;
                if let Some(e) = world.get_mut(self.must(h)?.object) {
                    e.pos_x = x;
                    e.pos_y = y;
                }
            }
            Op::SetVel => {
                let (x, y) = self.invert_xy(h, def(&vals, 0, 0.0), def(&vals, 1, 0.0))?;
                if let Some(e) = world.get_mut(self.must(h)?.object) {
                    e.vel_x = x;
                    e.vel_y = y;
                }
            }
            Op::SetVelDir => {
                let speed = def(&vals, 0, 1.0);
                let angle = self.aim_angle(h, world, globals)?;
                if let Some(e) = world.get_mut(self.must(h)?.object) {
                    e.vel_x = angle.cos() * speed;
                    e.vel_y = angle.sin() * speed;
                }
            }
            Op::Rotate => {
                let offset = def(&vals, 0, 0.0).to_radians();
                let angle = self.aim_angle(h, world, globals)? + offset;
                if let Some(e) = world.get_mut(self.must(h)?.object) {
                    e.angle = angle;
                }
            }
            Op::Head(mode) => {
                let fiber = self.must(h)?;
                fiber.head_mode = *mode;
                fiber.head_angle = def(&vals, 0, 0.0).to_radians();
            }
            Op::Invert => {
                self.must(h)?.invert = def(&vals, 0, 0.0) as u8;
            }
            Op::Fire => {
                let speed = def(&vals, 0, 1.0);
                let entry = self.take_ref(h, &program, seq, cursor.pc, world, globals);
                if entry.is_some() {
                    next_pc += 1;
                }
                let angle = self.aim_angle(h, world, globals)?;
                let fiber = self.must(h)?;
                fiber.fired_angle = angle;
                if let Some(e) = entry {
                    fiber.seq_fired = Some(e);
                }
                let entry = fiber.seq_fired.clone();
                let gene = fiber.gene + 1;
                let parent_obj = fiber.object;
                if let Some(src) = world.get(parent_obj).cloned() {
                    let spawned = world.spawn(EntityState {
                        pos_x: src.pos_x,
                        pos_y: src.pos_y,
                        vel_x: angle.cos() * speed,
                        vel_y: angle.sin() * speed,
                        angle,
                        rank: src.rank,
                        parent: parent_obj,
                    });
                    trace!(tick = self.tick, "fired projectile");
                    if let Some(entry) = entry {
                        self.spawn_checked(h, FiberArena::ROOT, spawned, &entry, gene, world, globals)?;
                    }
                }
            }
            Op::New => {
                let entry = self.take_ref(h, &program, seq, cursor.pc, world, globals);
                if entry.is_some() {
                    next_pc += 1;
                }
                let fiber = self.must(h)?;
                let gene = fiber.gene + 1;
                let parent_obj = fiber.object;
                if let Some(src) = world.get(parent_obj).cloned() {
                    let spawned = world.spawn(EntityState {
                        pos_x: src.pos_x,
                        pos_y: src.pos_y,
                        angle: src.angle,
                        rank: src.rank,
                        parent: parent_obj,
                        ..EntityState::default()
                    });
                    trace!(tick = self.tick, "spawned child entity");
                    if let Some(entry) = entry {
                        self.spawn_checked(h, FiberArena::ROOT, spawned, &entry, gene, world, globals)?;
                    }
                }
            }
            Op::Fork | Op::ForkPlain => {
                let inherit = matches!(instr.op, Op::Fork);
                let access_id = def(&vals, 0, 0.0) as i32;
                let Some(entry) = self.take_ref(h, &program, seq, cursor.pc, world, globals) else {
                    return Err(Error::CorruptProgram("fork without a sequence reference"));
                };
                next_pc += 1;
                // An identified fork replaces the previous child with the
                // same id.
                if access_id != 0 {
                    let stale: Vec<FiberHandle> = match self.fibers.get(h) {
                        Some(f) => f
                            .children
                            .iter()
                            .filter(|c| {
                                self.fibers
                                    .get(**c)
                                    .is_some_and(|f| !f.is_dest && f.access_id == access_id)
                            })
                            .copied()
                            .collect(),
                        None => Vec::new(),
                    };
                    for s in stale {
                        self.destroy_subtree(s);
                    }
                }
                let fiber = self.must(h)?;
                let gene = fiber.gene + 1;
                let object = fiber.object;
                let (params, invert) = if inherit {
                    let mut snap = Fiber::new(EntityHandle::NULL, EntityHandle::NULL);
                    snap.inherit_params(fiber);
                    let invert = fiber.invert;
                    (Some(snap), invert)
                } else {
                    (None, 0)
                };
                let child = self.alloc_checked(h, h, object, &entry, gene)?;
                if let Some(f) = self.fibers.get_mut(child) {
                    f.access_id = access_id;
                    f.invert = invert;
                    if let Some(params) = &params {
                        f.inherit_params(params);
                    }
                }
                self.ignite(child, world, globals)?;
            }
            Op::ForkDest => {
                let access_id = def(&vals, 0, 0.0) as i32;
                let Some(entry) = self.take_ref(h, &program, seq, cursor.pc, world, globals) else {
                    return Err(Error::CorruptProgram("fork without a sequence reference"));
                };
                next_pc += 1;
                // A new handler replaces the old one with the same id.
                let stale: Vec<FiberHandle> = match self.fibers.get(h) {
                    Some(f) => f
                        .children
                        .iter()
                        .filter(|c| {
                            self.fibers
                                .get(**c)
                                .is_some_and(|f| f.is_dest && f.access_id == access_id)
                        })
                        .copied()
                        .collect(),
                    None => Vec::new(),
                };
                for s in stale {
                    self.destroy_subtree(s);
                }
                let fiber = self.must(h)?;
                let gene = fiber.gene + 1;
                let object = fiber.object;
                let handler = SeqEntry {
                    program: Arc::clone(&self.wait_dest),
                    seq: Program::ROOT,
                    args: Vec::new(),
                };
                let child = self.alloc_checked(h, h, object, &handler, gene)?;
                if let Some(f) = self.fibers.get_mut(child) {
                    f.is_dest = true;
                    f.access_id = access_id;
                    f.dest_ref = Some(entry);
                }
                self.ignite(child, world, globals)?;
            }
            Op::KillFiber => {
                self.destroy_subtree(h);
                return Ok(Flow::Killed);
            }
            Op::KillObject => {
                let status = def(&vals, 0, 0.0) as i32;
                let object = self.must(h)?.object;
                world.destroy(object, status);
            }
            Op::Assign(target, op) => {
                let rhs = def(&vals, 0, 0.0);
                match target {
                    AssignTarget::Var(slot) => {
                        let fiber = self.must(h)?;
                        let old = fiber.var(*slot as usize);
                        fiber.set_var(*slot as usize, op.apply(old, rhs));
                    }
                    AssignTarget::Rank => {
                        let object = self.must(h)?.object;
                        if let Some(e) = world.get_mut(object) {
                            e.rank = op.apply(e.rank, rhs);
                        }
                    }
                }
            }
            Op::Call => {
                let Some(entry) = self.take_ref(h, &program, seq, cursor.pc, world, globals) else {
                    return Err(Error::CorruptProgram("call without a sequence reference"));
                };
                let limit = self.config.max_nesting;
                let fiber = self.must(h)?;
                if fiber.callstack.len() >= limit {
                    self.destroy_subtree(h);
                    return Err(Error::NestingTooDeep { limit });
                }
                fiber.callstack.push(Cursor {
                    program: Arc::clone(&program),
                    seq: cursor.seq,
                    pc: cursor.pc + 2,
                });
                fiber.push_frame(&entry.args);
                fiber.cursor = Some(Cursor {
                    program: entry.program,
                    seq: entry.seq,
                    pc: 0,
                });
                return Ok(Flow::Continue);
            }
            Op::Ref(_) | Op::Text(_) => {}
            Op::UserCommand(idx) => {
                let text = match seq.instrs.get(cursor.pc + 1) {
                    Some(Instruction {
                        op: Op::Text(t), ..
                    }) => Some(Arc::clone(t)),
                    _ => None,
                };
                let entity = self.must(h)?.object;
                globals.run_user_command(
                    *idx,
                    &CommandCall {
                        args: &vals,
                        text: text.as_deref(),
                        entity,
                    },
                );
            }
            Op::BlockStart => {
                self.must(h)?.lcnt.push(0.0);
            }
            Op::If => {
                if def(&vals, 0, 0.0) == 0.0 {
                    next_pc = instr
                        .jump
                        .ok_or(Error::CorruptProgram("condition without a jump target"))?;
                }
            }
            Op::Else => {
                next_pc = instr
                    .jump
                    .ok_or(Error::CorruptProgram("else without a jump target"))?;
            }
            Op::BlockEnd => {
                let count = val(&vals, 0);
                let start = instr
                    .jump
                    .ok_or(Error::CorruptProgram("loop end without a jump target"))?;
                let fiber = self.must(h)?;
                match fiber.lcnt.last_mut() {
                    Some(counter) => {
                        *counter += 1.0;
                        // NaN count means loop forever.
                        if count.is_nan() || *counter < count {
                            next_pc = start;
                        } else {
                            fiber.lcnt.pop();
                        }
                    }
                    None => return Err(Error::CorruptProgram("loop end without a counter")),
                }
            }
            Op::WaitDestruction => {
                let fiber = self.must(h)?;
                let wanted = fiber.access_id;
                let status = world.destruction_status(fiber.object);
                match status {
                    Some(s) if wanted == 0 || s == wanted => {
                        let Some(entry) = fiber.dest_ref.take() else {
                            return Ok(Flow::Finish);
                        };
                        trace!(status = s, "destruction handler triggered");
                        if let Some(frame) = fiber.vars.last_mut() {
                            frame.fill(0.0);
                            for (slot, v) in frame.iter_mut().zip(&entry.args) {
                                *slot = *v;
                            }
                        }
                        fiber.cursor = Some(Cursor {
                            program: entry.program,
                            seq: entry.seq,
                            pc: 0,
                        });
                        return Ok(Flow::Continue);
                    }
                    _ => return Ok(Flow::Suspend),
                }
            }
            Op::End => {
                let fiber = self.must(h)?;
                match fiber.callstack.pop() {
                    Some(ret) => {
                        fiber.pop_frame();
                        fiber.cursor = Some(ret);
                        return Ok(Flow::Continue);
                    }
                    None => return Ok(Flow::Finish),
                }
            }
        }

        self.set_pc(h, &program, cursor.seq, next_pc)?;
        Ok(Flow::Continue)
    }

    // -- helpers -----------------------------------------------------------

    fn must(&mut self, h: FiberHandle) -> Result<&mut Fiber> {
        self.fibers
            .get_mut(h)
            .ok_or(Error::CorruptProgram("fiber vanished mid-instruction"))
    }

    fn set_pc(
        &mut self,
        h: FiberHandle,
        program: &Arc<Program>,
        seq: SeqId,
        pc: usize,
    ) -> Result<()> {
        self.must(h)?.cursor = Some(Cursor {
            program: Arc::clone(program),
            seq,
            pc,
        });
        Ok(())
    }

    fn eval_args(
        &self,
        h: FiberHandle,
        world: &EntityArena,
        globals: &GlobalContext,
        args: &[Arg],
    ) -> Vec<f64> {
        let Some(fiber) = self.fibers.get(h) else {
            return vec![f64::NAN; args.len()];
        };
        let cx = EvalContext {
            fiber,
            world,
            globals,
        };
        args.iter().map(|a| a.eval(&cx)).collect()
    }

    /// Evaluate and consume the `Ref` following the instruction at `pc`,
    /// if there is one.
    fn take_ref(
        &self,
        h: FiberHandle,
        program: &Arc<Program>,
        seq: &Sequence,
        pc: usize,
        world: &EntityArena,
        globals: &GlobalContext,
    ) -> Option<SeqEntry> {
        let instr = seq.instrs.get(pc + 1)?;
        let Op::Ref(r) = &instr.op else {
            return None;
        };
        let (target_program, target_seq) = r.resolve(program);
        let args = self.eval_args(h, world, globals, &instr.args);
        Some(SeqEntry {
            program: target_program,
            seq: target_seq,
            args,
        })
    }

    /// The fiber's effective heading with the invert flag applied.
    fn aim_angle(
        &mut self,
        h: FiberHandle,
        world: &EntityArena,
        globals: &GlobalContext,
    ) -> Result<f64> {
        let fiber = self.must(h)?;
        let this = world.get(fiber.object);
        let target = world.get(fiber.target);
        let base = match fiber.head_mode {
            HeadMode::Aim => match (this, target) {
                (Some(e), Some(t)) => (t.pos_y - e.pos_y).atan2(t.pos_x - e.pos_x),
                _ => globals.scroll_angle,
            },
            HeadMode::Abs => globals.scroll_angle,
            HeadMode::Rel => this.map(|e| e.angle).unwrap_or(0.0),
            HeadMode::Par => {
                let parent = this.and_then(|e| world.get(e.parent));
                parent.map(|e| e.angle).unwrap_or(0.0)
            }
            HeadMode::Vel => this.map(|e| e.vel_y.atan2(e.vel_x)).unwrap_or(0.0),
            HeadMode::Seq => fiber.fired_angle,
        };
        Ok(invert_angle(fiber.invert, base + fiber.head_angle))
    }

    /// Apply the invert flag to an (x, y) pair.
    fn invert_xy(&mut self, h: FiberHandle, x: f64, y: f64) -> Result<(f64, f64)> {
        let flag = self.must(h)?.invert;
        let x = if flag & 2 != 0 { -x } else { x };
        let y = if flag & 1 != 0 { -y } else { y };
        Ok((x, y))
    }

    /// Allocate, configure and run a fresh fiber in one go.
    fn spawn_checked(
        &mut self,
        spawner: FiberHandle,
        parent: FiberHandle,
        object: EntityHandle,
        entry: &SeqEntry,
        gene: usize,
        world: &mut EntityArena,
        globals: &GlobalContext,
    ) -> Result<FiberHandle> {
        let h = self.alloc_checked(spawner, parent, object, entry, gene)?;
        self.ignite(h, world, globals)?;
        Ok(h)
    }

    /// Allocate a fiber, destroying the spawning tree when the nesting
    /// limit trips.
    fn alloc_checked(
        &mut self,
        spawner: FiberHandle,
        parent: FiberHandle,
        object: EntityHandle,
        entry: &SeqEntry,
        gene: usize,
    ) -> Result<FiberHandle> {
        if gene >= self.config.max_nesting {
            self.destroy_subtree(spawner);
            return Err(Error::NestingTooDeep {
                limit: self.config.max_nesting,
            });
        }
        let mut fiber = Fiber::new(object, self.default_target);
        fiber.parent = parent;
        fiber.gene = gene;
        fiber.stepped_tick = self.tick;
        fiber.cursor = Some(Cursor {
            program: Arc::clone(&entry.program),
            seq: entry.seq,
            pc: 0,
        });
        if let Some(frame) = fiber.vars.last_mut() {
            for (slot, v) in frame.iter_mut().zip(&entry.args) {
                *slot = *v;
            }
        }
        let h = self.fibers.alloc(fiber);
        if let Some(p) = self.fibers.get_mut(parent) {
            p.children.push(h);
        }
        trace!(index = h.index, gene, "fiber spawned");
        Ok(h)
    }

    /// Run a new fiber's first instruction slice, then reap it if it ran
    /// straight to its end without forking anything.
    fn ignite(
        &mut self,
        h: FiberHandle,
        world: &mut EntityArena,
        globals: &GlobalContext,
    ) -> Result<()> {
        self.run_slice(h, world, globals)?;
        let mut finished = false;
        if let Some(f) = self.fibers.get(h) {
            finished = f.cursor.is_none() && f.children.is_empty();
        }
        if finished {
            self.fibers.release(h);
        }
        Ok(())
    }

    fn destroy_subtree(&mut self, h: FiberHandle) {
        let children = match self.fibers.get(h) {
            Some(fiber) => fiber.children.clone(),
            None => return,
        };
        for c in children {
            self.destroy_subtree(c);
        }
        self.fibers.release(h);
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Invert an angle per the invert flag: bit 0 mirrors it, bit 1 flips it
/// across the vertical axis.
fn invert_angle(flag: u8, a: f64) -> f64 {
    let a = if flag & 1 != 0 { -a } else { a };
    if flag & 2 != 0 { PI - a } else { a }
}

/// Argument `i`, NaN when absent.
fn val(vals: &[f64], i: usize) -> f64 {
    vals.get(i).copied().unwrap_or(f64::NAN)
}

/// Argument `i` when present, `fallback` otherwise.
fn def(vals: &[f64], i: usize, fallback: f64) -> f64 {
    let v = val(vals, i);
    if v.is_nan() { fallback } else { v }
}

/// Argument `i` only when explicitly given.
fn given(vals: &[f64], i: usize) -> Option<f64> {
    let v = val(vals, i);
    (!v.is_nan()).then_some(v)
}
