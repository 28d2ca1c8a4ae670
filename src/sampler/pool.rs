// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
// Fixed-capacity sampler freelist. No allocation happens on the render path:
// all slots are created up front, voices are handed out and returned through
// an index stack. Returning a slot bumps its generation so stale handles held
// by the organ model can be detected.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Sampler, SamplerHandle};

/// One pool slot. The scheduled-event fields are atomics because the organ
/// model arms them concurrently with the render thread; everything else lives
/// behind the body mutex, which only the owning task locks.
pub struct SamplerSlot {
    /// Bumped every time the slot is returned to the pool.
    pub generation: AtomicU64,
    /// Global sample index of a deferred stop; 0 = none.
    pub stop: AtomicU64,
    /// Global sample index of a deferred attack switch; 0 = none.
    pub new_attack: AtomicU64,
    /// Polyphony eviction counter, set by an external manager pass.
    pub drop_count: AtomicU32,
    /// Thin-pointer identity of the provider this slot plays, so handle
    /// mutators can reject stale handles without taking the body lock.
    pub provider_tag: AtomicUsize,
    /// Start delay in samples, mirrored out of the body for lock-free access
    /// by the deferred-event mutators.
    pub delay: AtomicU64,
    pub body: Mutex<Sampler>,
}

impl SamplerSlot {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            stop: AtomicU64::new(0),
            new_attack: AtomicU64::new(0),
            drop_count: AtomicU32::new(0),
            provider_tag: AtomicUsize::new(0),
            delay: AtomicU64::new(0),
            body: Mutex::new(Sampler::new_idle()),
        }
    }

    fn clear_events(&self) {
        self.stop.store(0, Ordering::Release);
        self.new_attack.store(0, Ordering::Release);
        self.drop_count.store(0, Ordering::Release);
        self.provider_tag.store(0, Ordering::Release);
        self.delay.store(0, Ordering::Release);
    }
}

pub struct SamplerPool {
    slots: Vec<SamplerSlot>,
    free: Mutex<Vec<usize>>,
    used: AtomicUsize,
}

impl SamplerPool {
    /// Creates a pool with `limit` slots (the hard polyphony).
    pub fn new(limit: usize) -> Self {
        let mut slots = Vec::with_capacity(limit);
        for _ in 0..limit {
            slots.push(SamplerSlot::new());
        }
        // Hand out low indices first.
        let free = (0..limit).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            used: AtomicUsize::new(0),
        }
    }

    pub fn usage_limit(&self) -> usize {
        self.slots.len()
    }

    pub fn used_count(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn slot(&self, index: usize) -> &SamplerSlot {
        &self.slots[index]
    }

    /// Takes a slot from the freelist. Returns `None` when the pool is
    /// exhausted; callers treat that as "note lost".
    pub fn get_sampler(&self) -> Option<SamplerHandle> {
        let index = self.free.lock().expect("Error getting lock").pop()?;
        self.used.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[index];
        slot.clear_events();
        Some(SamplerHandle {
            index,
            generation: slot.generation.load(Ordering::Acquire),
        })
    }

    /// Returns a slot to the pool, clearing its provider link and bumping the
    /// generation so outstanding handles go stale.
    pub fn return_sampler(&self, index: usize) {
        let slot = &self.slots[index];
        {
            let mut body = slot.body.lock().expect("Error getting lock");
            body.provider = None;
        }
        slot.clear_events();
        slot.generation.fetch_add(1, Ordering::AcqRel);
        self.free.lock().expect("Error getting lock").push(index);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns every slot to the pool. Only valid while no task owns any
    /// sampler (engine start/reset).
    pub fn return_all(&self) {
        let mut free = self.free.lock().expect("Error getting lock");
        free.clear();
        for (index, slot) in self.slots.iter().enumerate().rev() {
            {
                let mut body = slot.body.lock().expect("Error getting lock");
                body.provider = None;
            }
            slot.clear_events();
            slot.generation.fetch_add(1, Ordering::AcqRel);
            free.push(index);
        }
        self.used.store(0, Ordering::Relaxed);
    }

    /// True if `handle` still refers to the voice it was created for.
    pub fn is_live(&self, handle: SamplerHandle) -> bool {
        handle.index < self.slots.len()
            && self.slots[handle.index].generation.load(Ordering::Acquire) == handle.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_returns_none() {
        let pool = SamplerPool::new(2);
        let a = pool.get_sampler().unwrap();
        let b = pool.get_sampler().unwrap();
        assert_ne!(a.index, b.index);
        assert!(pool.get_sampler().is_none());
        assert_eq!(pool.used_count(), 2);
    }

    #[test]
    fn return_recycles_and_bumps_generation() {
        let pool = SamplerPool::new(1);
        let first = pool.get_sampler().unwrap();
        assert!(pool.is_live(first));
        pool.return_sampler(first.index);
        assert!(!pool.is_live(first));
        assert_eq!(pool.used_count(), 0);

        let second = pool.get_sampler().unwrap();
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
    }

    #[test]
    fn return_all_resets_used_count() {
        let pool = SamplerPool::new(4);
        for _ in 0..3 {
            pool.get_sampler().unwrap();
        }
        pool.return_all();
        assert_eq!(pool.used_count(), 0);
        let mut handed = 0;
        while pool.get_sampler().is_some() {
            handed += 1;
        }
        assert_eq!(handed, 4);
    }

    #[test]
    fn returned_slot_has_no_provider() {
        let pool = SamplerPool::new(1);
        let h = pool.get_sampler().unwrap();
        pool.return_sampler(h.index);
        let slot = pool.slot(h.index);
        assert!(slot.body.lock().unwrap().provider.is_none());
        assert_eq!(slot.stop.load(Ordering::Acquire), 0);
    }
}
