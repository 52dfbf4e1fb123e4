//! Global execution context
//!
//! Shared state that outlives any single program run: global rank slots,
//! the random source, screen geometry and the user extension registries.
//! The compiler reads the registries to resolve `$name` / `&name` tokens;
//! [`version`](GlobalContext::version) changes whenever a registration
//! would invalidate a cached name matcher.
//!
//! # Design
//!
//! Evaluation only ever holds `&GlobalContext`, so the mutable pieces used
//! during evaluation (the RNG, command closures) live behind `RefCell`.
//! Registration requires `&mut self` and is expected between runs, not
//! inside one.

use std::cell::RefCell;

use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::accessor::EvalContext;
use crate::types::{EntityHandle, RANK_SLOTS};

/// Arguments handed to a user command when its instruction executes.
pub struct CommandCall<'a> {
    /// Evaluated positional arguments.
    pub args: &'a [f64],
    /// Payload of a `'...'` string immediately following the command.
    pub text: Option<&'a str>,
    /// Entity controlled by the executing fiber.
    pub entity: EntityHandle,
}

type AccessorFn = Box<dyn Fn(&EvalContext<'_>) -> f64>;
type CommandFn = Box<dyn FnMut(&CommandCall<'_>)>;

pub struct GlobalContext {
    ranks: [f64; RANK_SLOTS],
    rng: RefCell<SmallRng>,
    /// Half extents of the playfield; entities beyond them are reported as
    /// escaped. Infinite by default, which disables the check.
    pub half_width: f64,
    pub half_height: f64,
    /// Added to absolute headings so "up" can be reoriented.
    pub scroll_angle: f64,
    accessors: IndexMap<String, AccessorFn>,
    commands: IndexMap<String, RefCell<CommandFn>>,
    version: u64,
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalContext {
    pub fn new() -> Self {
        Self {
            ranks: [0.0; RANK_SLOTS],
            rng: RefCell::new(SmallRng::seed_from_u64(0)),
            half_width: f64::INFINITY,
            half_height: f64::INFINITY,
            scroll_angle: 0.0,
            accessors: IndexMap::new(),
            commands: IndexMap::new(),
            version: 0,
        }
    }

    /// Reseed the random source. Runs are deterministic for a fixed seed.
    pub fn seed_random(&mut self, seed: u64) {
        self.rng = RefCell::new(SmallRng::seed_from_u64(seed));
    }

    /// Uniform sample in [0, 1).
    pub fn rand(&self) -> f64 {
        self.rng.borrow_mut().random::<f64>()
    }

    pub fn rank(&self, slot: usize) -> f64 {
        self.ranks.get(slot).copied().unwrap_or(0.0)
    }

    pub fn set_rank(&mut self, slot: usize, value: f64) {
        if let Some(r) = self.ranks.get_mut(slot) {
            *r = value;
        }
    }

    /// Set the playfield extents used for escape detection.
    pub fn set_screen_size(&mut self, width: f64, height: f64) {
        self.half_width = width * 0.5;
        self.half_height = height * 0.5;
    }

    /// Bumped on every registration; compilers key cached name matchers on
    /// this.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Register (or replace) a `$name` accessor.
    pub fn register_accessor(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&EvalContext<'_>) -> f64 + 'static,
    ) {
        let name = name.into();
        debug!(name, "registering user accessor");
        self.accessors.insert(name, Box::new(f));
        self.version += 1;
    }

    /// Register (or replace) an `&name` command.
    pub fn register_command(
        &mut self,
        name: impl Into<String>,
        f: impl FnMut(&CommandCall<'_>) + 'static,
    ) {
        let name = name.into();
        debug!(name, "registering user command");
        self.commands.insert(name, RefCell::new(Box::new(f)));
        self.version += 1;
    }

    /// Registry index of an accessor name, if registered.
    pub fn accessor_index(&self, name: &str) -> Option<usize> {
        self.accessors.get_index_of(name)
    }

    /// Registry index of a command name, if registered.
    pub fn command_index(&self, name: &str) -> Option<usize> {
        self.commands.get_index_of(name)
    }

    pub fn accessor_names(&self) -> impl Iterator<Item = &str> {
        self.accessors.keys().map(String::as_str)
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub(crate) fn eval_user_accessor(&self, idx: usize, cx: &EvalContext<'_>) -> f64 {
        match self.accessors.get_index(idx) {
            Some((_, f)) => f(cx),
            None => 0.0,
        }
    }

    pub(crate) fn run_user_command(&self, idx: usize, call: &CommandCall<'_>) {
        if let Some((_, f)) = self.commands.get_index(idx) {
            f.borrow_mut()(call);
        }
    }
}
