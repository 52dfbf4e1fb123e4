//! Integration test harness for CML.
//!
//! Bundles the pieces an end-to-end test needs: a compiler context, the
//! global context, an entity arena and an engine, with panicking wrappers
//! so tests read as straight-line scripts.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use cml_compiler::{CompileError, CompilerContext};
use cml_runtime::ir::Program;
use cml_runtime::types::{EntityHandle, FiberHandle};
use cml_runtime::{Engine, EntityArena, EntityState, GlobalContext};

/// Values recorded by a test command, shared with the harness.
pub type Recorder = Rc<RefCell<Vec<f64>>>;

pub struct TestHarness {
    pub globals: GlobalContext,
    pub compiler: CompilerContext,
    pub engine: Engine,
    pub world: EntityArena,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            globals: GlobalContext::new(),
            compiler: CompilerContext::new(),
            engine: Engine::new(),
            world: EntityArena::new(),
        }
    }

    /// Compile a source, panicking on failure.
    pub fn compile(&mut self, source: &str) -> Arc<Program> {
        match self.compiler.compile(source, &self.globals) {
            Ok(p) => p,
            Err(e) => panic!("compile failed: {e}"),
        }
    }

    pub fn try_compile(&mut self, source: &str) -> Result<Arc<Program>, CompileError> {
        self.compiler.compile(source, &self.globals)
    }

    /// Register a command that appends its first argument (1 when absent)
    /// to the returned recorder.
    pub fn recorder(&mut self, name: &str) -> Recorder {
        let log: Recorder = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        self.globals.register_command(name, move |call| {
            sink.borrow_mut().push(call.args.first().copied().unwrap_or(1.0));
        });
        log
    }

    pub fn spawn_at(&mut self, x: f64, y: f64) -> EntityHandle {
        self.world.spawn(EntityState::at(x, y))
    }

    /// Compile and start a source on a fresh entity at the origin.
    pub fn start(&mut self, source: &str) -> (EntityHandle, Option<FiberHandle>) {
        let program = self.compile(source);
        let e = self.spawn_at(0.0, 0.0);
        let h = self.run_on(&program, e, &[]);
        (e, h)
    }

    /// Start a program on an entity, panicking on engine errors.
    pub fn run_on(
        &mut self,
        program: &Arc<Program>,
        object: EntityHandle,
        args: &[f64],
    ) -> Option<FiberHandle> {
        match self
            .engine
            .execute(program, object, args, &mut self.world, &self.globals)
        {
            Ok(h) => h,
            Err(e) => panic!("execute failed: {e}"),
        }
    }

    pub fn try_run_on(
        &mut self,
        program: &Arc<Program>,
        object: EntityHandle,
    ) -> cml_runtime::Result<Option<FiberHandle>> {
        self.engine
            .execute(program, object, &[], &mut self.world, &self.globals)
    }

    /// One engine tick, panicking on engine errors.
    pub fn tick(&mut self) {
        if let Err(e) = self.engine.advance(&mut self.world, &self.globals) {
            panic!("tick failed: {e}");
        }
    }

    pub fn try_tick(&mut self) -> cml_runtime::Result<()> {
        self.engine.advance(&mut self.world, &self.globals)
    }

    pub fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Entity state, panicking when the handle is stale.
    pub fn entity(&self, h: EntityHandle) -> &EntityState {
        match self.world.get(h) {
            Some(e) => e,
            None => panic!("entity handle is stale"),
        }
    }

    pub fn fiber_alive(&self, h: Option<FiberHandle>) -> bool {
        h.is_some_and(|h| self.engine.is_alive(h))
    }
}
