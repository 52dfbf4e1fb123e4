//! Core runtime types
//!
//! Handles, limits and the heading model shared by the engine, the entity
//! arena and the compiler.

/// Width of a fiber's positional-argument frame. Call sites may pass fewer
/// arguments; the frame is zero-padded to this width.
pub const ARG_WIDTH: usize = 9;

/// Number of global rank slots (`$r1`..`$r9`, slot 0 unused).
pub const RANK_SLOTS: usize = 10;

/// Destruction status reported when an entity leaves the configured screen
/// bounds.
pub const ESCAPE_STATUS: i32 = 999_999;

/// Stable reference to an entity slot. The generation detects reuse: a
/// handle whose generation no longer matches its slot is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    pub index: u32,
    pub generation: u32,
}

impl EntityHandle {
    /// A handle that never resolves. Lookups against it yield `None`.
    pub const NULL: EntityHandle = EntityHandle {
        index: u32::MAX,
        generation: 0,
    };
}

/// Stable reference to a fiber slot, same generation scheme as
/// [`EntityHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberHandle {
    pub index: usize,
    pub generation: u32,
}

/// How a fiber's effective heading is derived before the offset and the
/// invert flag are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeadMode {
    /// Aim at the current target entity.
    #[default]
    Aim,
    /// Absolute angle in screen space (scroll offset applied).
    Abs,
    /// Relative to the controlled entity's own angle.
    Rel,
    /// Relative to the parent entity's angle.
    Par,
    /// Relative to the entity's velocity direction.
    Vel,
    /// Relative to the last fired angle.
    Seq,
}

/// Engine limits. Both are hard failures when exceeded, not silent
/// truncation.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Maximum instructions one fiber may execute in a single tick. Trips
    /// when a script loops without a wait.
    pub max_steps_per_tick: usize,
    /// Maximum call/fork nesting depth. Trips on runaway recursion.
    pub max_nesting: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_tick: 1024,
            max_nesting: 64,
        }
    }
}
