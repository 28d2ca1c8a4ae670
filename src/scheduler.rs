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
// Hands per-period tasks to whoever asks for work: worker threads and the
// audio callback threads are peers here. Tasks are sorted by priority band
// (expensive first within a band) and claimed through an atomic cursor; a
// claimed task that is already running elsewhere is skipped by its own
// try-lock. Once the cursor runs past the end, the period's list is drained
// and workers block until the next period wakes them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

use crate::engine::OrganEngine;
use crate::tasks::{TaskId, TaskSet};

pub mod thread;

use self::thread::WorkerSignal;

struct GiveWork {
    paused: bool,
    /// Bumped on every wakeup so sleeping workers can tell a new period from
    /// a spurious wake.
    epoch: u64,
}

pub struct Scheduler {
    entries: RwLock<Vec<TaskId>>,
    cursor: AtomicUsize,
    state: Mutex<GiveWork>,
    work_available: Condvar,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            state: Mutex::new(GiveWork {
                paused: true,
                epoch: 0,
            }),
            work_available: Condvar::new(),
        }
    }

    /// Installs the task list for a built engine. Only valid while no thread
    /// is pulling work.
    pub fn set_tasks(&self, mut ids: Vec<TaskId>) {
        ids.sort_by(|a, b| a.group().cmp(&b.group()).then(b.cost().cmp(&a.cost())));
        *self.entries.write().expect("Error getting lock") = ids;
        self.cursor.store(0, Ordering::Release);
    }

    pub fn clear(&self) {
        self.entries.write().expect("Error getting lock").clear();
        self.cursor.store(0, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().expect("Error getting lock").paused
    }

    /// Claims and runs the next unclaimed task. Returns false when the
    /// period's list is drained.
    pub fn try_exec_one(
        &self,
        engine: &OrganEngine,
        tasks: &TaskSet,
        worker: Option<&WorkerSignal>,
    ) -> bool {
        let entries = self.entries.read().expect("Error getting lock");
        let i = self.cursor.fetch_add(1, Ordering::AcqRel);
        if i >= entries.len() {
            // Drained; the per-period reset rewinds the cursor, so writing it
            // back here would race with a period change.
            return false;
        }
        let id = entries[i];
        drop(entries);
        tasks.exec(id, engine, worker);
        true
    }

    /// Runs every remaining task of the period on the calling thread. Used by
    /// the period closer before advancing time.
    pub fn exec_remaining(&self, engine: &OrganEngine, tasks: &TaskSet) {
        while self.try_exec_one(engine, tasks, None) {}
    }

    /// Re-arms all tasks and rewinds the cursor for the next period.
    pub fn reset(&self, tasks: &TaskSet) {
        tasks.reset();
        self.cursor.store(0, Ordering::Release);
    }

    /// Blocks workers; they finish their current task and go idle.
    pub fn pause_giving_work(&self) {
        self.state.lock().expect("Error getting lock").paused = true;
    }

    pub fn resume_giving_work(&self) {
        let mut state = self.state.lock().expect("Error getting lock");
        state.paused = false;
        state.epoch += 1;
        self.work_available.notify_all();
    }

    /// Wakes all sleeping workers for a new period.
    pub fn wakeup(&self) {
        let mut state = self.state.lock().expect("Error getting lock");
        state.epoch += 1;
        self.work_available.notify_all();
    }

    /// Parks the calling worker until a new period starts (epoch changes) or
    /// the worker is told to stop. Returns the epoch observed on wake.
    pub fn wait_for_work(&self, worker: &WorkerSignal, last_epoch: u64) -> u64 {
        let mut state = self.state.lock().expect("Error getting lock");
        loop {
            if worker.should_stop() {
                return state.epoch;
            }
            if state.epoch != last_epoch && !state.paused {
                return state.epoch;
            }
            state = self
                .work_available
                .wait(state)
                .expect("Error getting lock");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskGroup;

    #[test]
    fn tasks_sorted_by_group_then_cost() {
        let scheduler = Scheduler::new();
        scheduler.set_tasks(vec![
            TaskId::Touch,
            TaskId::Output(0),
            TaskId::Group(0),
            TaskId::Release,
            TaskId::Tremulant(0),
            TaskId::Windchest(0),
            TaskId::Recorder,
        ]);
        let entries = scheduler.entries.read().unwrap();
        let groups: Vec<TaskGroup> = entries.iter().map(|id| id.group()).collect();
        let mut sorted = groups.clone();
        sorted.sort();
        assert_eq!(groups, sorted);
        assert_eq!(entries[0], TaskId::Tremulant(0));
        assert_eq!(*entries.last().unwrap(), TaskId::Touch);
    }

    #[test]
    fn pause_resume_toggles() {
        let scheduler = Scheduler::new();
        assert!(scheduler.is_paused());
        scheduler.resume_giving_work();
        assert!(!scheduler.is_paused());
        scheduler.pause_giving_work();
        assert!(scheduler.is_paused());
    }
}
