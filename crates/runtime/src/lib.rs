//! CML Runtime
//!
//! Executes compiled motion/firing programs over a pool of cooperative
//! fibers, one tick per [`Engine::advance`] call.

pub mod accessor;
pub mod context;
pub mod entity;
pub mod error;
pub mod executor;
pub mod fiber;
pub mod ir;
pub mod types;

pub use context::{CommandCall, GlobalContext};
pub use entity::{EntityArena, EntityState};
pub use error::{Error, Result};
pub use executor::Engine;
pub use types::*;
