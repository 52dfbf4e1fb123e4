//! Controlled-entity arena
//!
//! Generational slot arena for the objects that fibers drive. Handles are
//! (index, generation) pairs; a freed slot bumps its generation so stale
//! handles resolve to `None` instead of aliasing the slot's next occupant.
//!
//! Destruction is two-staged. `destroy` only marks the entity with a status
//! value; the slot stays resolvable for one full tick so destruction
//! handlers can observe the status, then the sweep in [`EntityArena::end_tick`]
//! frees it. `free` removes a slot immediately and is meant for external
//! owners that already tore the object down on their side.

use tracing::trace;

use crate::context::GlobalContext;
use crate::types::{ESCAPE_STATUS, EntityHandle};

/// State of one controlled entity. Angles are radians in screen space.
#[derive(Debug, Clone)]
pub struct EntityState {
    pub pos_x: f64,
    pub pos_y: f64,
    pub vel_x: f64,
    pub vel_y: f64,
    pub angle: f64,
    pub rank: f64,
    pub parent: EntityHandle,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            pos_x: 0.0,
            pos_y: 0.0,
            vel_x: 0.0,
            vel_y: 0.0,
            angle: 0.0,
            rank: 0.0,
            parent: EntityHandle::NULL,
        }
    }
}

impl EntityState {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            pos_x: x,
            pos_y: y,
            ..Self::default()
        }
    }
}

struct Slot {
    state: EntityState,
    generation: u32,
    occupied: bool,
    /// Destruction status once marked; observable until the sweep frees the
    /// slot.
    status: Option<i32>,
    /// Set by the sweep one tick after marking; the next sweep frees.
    doomed: bool,
}

type LifecycleFn = Box<dyn FnMut(EntityHandle, &EntityState)>;
type DestroyFn = Box<dyn FnMut(EntityHandle, &EntityState, i32)>;

/// The arena itself. Slots are reused through a free list.
#[derive(Default)]
pub struct EntityArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    on_create: Option<LifecycleFn>,
    on_update: Option<LifecycleFn>,
    on_destroy: Option<DestroyFn>,
}

impl EntityArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per spawned entity, before any fiber runs on it.
    pub fn on_create(&mut self, f: impl FnMut(EntityHandle, &EntityState) + 'static) {
        self.on_create = Some(Box::new(f));
    }

    /// Called for every live entity at each tick boundary, after motion
    /// integration.
    pub fn on_update(&mut self, f: impl FnMut(EntityHandle, &EntityState) + 'static) {
        self.on_update = Some(Box::new(f));
    }

    /// Called once when an entity is marked destroyed, with its status.
    pub fn on_destroy(&mut self, f: impl FnMut(EntityHandle, &EntityState, i32) + 'static) {
        self.on_destroy = Some(Box::new(f));
    }

    pub fn spawn(&mut self, state: EntityState) -> EntityHandle {
        let index = match self.free.pop() {
            Some(i) => {
                let slot = &mut self.slots[i];
                slot.state = state;
                slot.occupied = true;
                slot.status = None;
                slot.doomed = false;
                i
            }
            None => {
                self.slots.push(Slot {
                    state,
                    generation: 0,
                    occupied: true,
                    status: None,
                    doomed: false,
                });
                self.slots.len() - 1
            }
        };
        let handle = EntityHandle {
            index: index as u32,
            generation: self.slots[index].generation,
        };
        trace!(index, "entity spawned");
        if let Some(f) = &mut self.on_create {
            f(handle, &self.slots[index].state);
        }
        handle
    }

    fn slot(&self, h: EntityHandle) -> Option<&Slot> {
        let slot = self.slots.get(h.index as usize)?;
        (slot.occupied && slot.generation == h.generation).then_some(slot)
    }

    pub fn get(&self, h: EntityHandle) -> Option<&EntityState> {
        self.slot(h).map(|s| &s.state)
    }

    pub fn get_mut(&mut self, h: EntityHandle) -> Option<&mut EntityState> {
        let slot = self.slots.get_mut(h.index as usize)?;
        (slot.occupied && slot.generation == h.generation).then_some(&mut slot.state)
    }

    /// True while the handle resolves. An entity in its marked-destroyed
    /// window still counts as live; fibers bound to it keep running until
    /// the slot is actually freed.
    pub fn is_live(&self, h: EntityHandle) -> bool {
        self.slot(h).is_some()
    }

    /// The status set by [`destroy`](Self::destroy), while observable.
    pub fn destruction_status(&self, h: EntityHandle) -> Option<i32> {
        self.slot(h)?.status
    }

    /// Mark the entity destroyed. Idempotent; the first status wins.
    pub fn destroy(&mut self, h: EntityHandle, status: i32) {
        let Some(slot) = self.slots.get_mut(h.index as usize) else {
            return;
        };
        if !slot.occupied || slot.generation != h.generation || slot.status.is_some() {
            return;
        }
        slot.status = Some(status);
        trace!(index = h.index, status, "entity marked destroyed");
        if let Some(f) = &mut self.on_destroy {
            f(h, &slot.state, status);
        }
    }

    /// Remove the entity immediately, without the observable window.
    pub fn free(&mut self, h: EntityHandle) {
        let Some(slot) = self.slots.get_mut(h.index as usize) else {
            return;
        };
        if !slot.occupied || slot.generation != h.generation {
            return;
        }
        slot.occupied = false;
        slot.generation += 1;
        self.free.push(h.index as usize);
        trace!(index = h.index, "entity freed");
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityHandle, &EntityState)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.occupied.then(|| {
                (
                    EntityHandle {
                        index: i as u32,
                        generation: s.generation,
                    },
                    &s.state,
                )
            })
        })
    }

    /// Tick boundary: integrate motion, run update callbacks, cull entities
    /// beyond the playfield, then sweep the marked-destroyed slots.
    pub fn end_tick(&mut self, globals: &GlobalContext) {
        for i in 0..self.slots.len() {
            let slot = &mut self.slots[i];
            if !slot.occupied {
                continue;
            }
            if slot.status.is_none() {
                slot.state.pos_x += slot.state.vel_x;
                slot.state.pos_y += slot.state.vel_y;
                let escaped = slot.state.pos_x.abs() > globals.half_width
                    || slot.state.pos_y.abs() > globals.half_height;
                let handle = EntityHandle {
                    index: i as u32,
                    generation: slot.generation,
                };
                if let Some(f) = &mut self.on_update {
                    f(handle, &self.slots[i].state);
                }
                if escaped {
                    self.destroy(handle, ESCAPE_STATUS);
                }
                continue;
            }
            // Marked slots: free one tick after marking.
            if slot.doomed {
                slot.occupied = false;
                slot.generation += 1;
                self.free.push(i);
            } else {
                slot.doomed = true;
            }
        }
    }
}
