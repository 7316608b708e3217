//! Resource ledger: per-engine capacity and the reservations held against it.
//!
//! Capacity is local truth. Nothing here is persisted; the store only sees
//! the claims that the ledger allowed.
//!
//! # 不変条件
//! - 予約の合計は全ての次元で capacity を超えない
//! - GPU は整数単位、CPU と RAM は加算
//! - 予約は `Reservation` の drop でちょうど一度だけ解放される

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::task::TaskType;
use super::task_type::TaskTypeDetails;

/// Slack for fractional CPU sums (0.1 + 0.2 style rounding).
const CPU_EPSILON: f64 = 1e-9;

/// A resource cost vector, or a capacity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Cores, fractional allowed.
    pub cpu: f64,
    /// Whole devices.
    pub gpu: u32,
    /// Bytes.
    pub ram: u64,
}

impl Resources {
    pub const fn new(cpu: f64, gpu: u32, ram: u64) -> Self {
        Self { cpu, gpu, ram }
    }

    /// Would `self` still fit on top of `used` within `capacity`?
    pub fn fits(&self, used: &Resources, capacity: &Resources) -> bool {
        used.cpu + self.cpu <= capacity.cpu + CPU_EPSILON
            && used.gpu.saturating_add(self.gpu) <= capacity.gpu
            && used.ram.saturating_add(self.ram) <= capacity.ram
    }

    /// How many copies of `self` fit on top of `used`. `usize::MAX` for a zero cost.
    pub fn copies_within(&self, used: &Resources, capacity: &Resources) -> usize {
        let mut copies = usize::MAX;
        if self.cpu > 0.0 {
            let free = (capacity.cpu - used.cpu + CPU_EPSILON).max(0.0);
            copies = copies.min((free / self.cpu).floor() as usize);
        }
        if self.gpu > 0 {
            let free = capacity.gpu.saturating_sub(used.gpu);
            copies = copies.min((free / self.gpu) as usize);
        }
        if self.ram > 0 {
            let free = capacity.ram.saturating_sub(used.ram);
            copies = copies.min(usize::try_from(free / self.ram).unwrap_or(usize::MAX));
        }
        copies
    }

    fn add(&mut self, other: &Resources) {
        self.cpu += other.cpu;
        self.gpu = self.gpu.saturating_add(other.gpu);
        self.ram = self.ram.saturating_add(other.ram);
    }

    fn sub(&mut self, other: &Resources) {
        self.cpu = (self.cpu - other.cpu).max(0.0);
        self.gpu = self.gpu.saturating_sub(other.gpu);
        self.ram = self.ram.saturating_sub(other.ram);
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    reserved: Resources,
    running: HashMap<TaskType, usize>,
}

/// Point-in-time copy of the ledger, handed to admission filters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub capacity: Resources,
    pub reserved: Resources,
    pub running: HashMap<TaskType, usize>,
}

impl LedgerSnapshot {
    pub fn running_of(&self, task_type: &TaskType) -> usize {
        self.running.get(task_type).copied().unwrap_or(0)
    }
}

/// Capacity plus the reservations currently held against it.
///
/// The lock is never held across an `.await`.
#[derive(Debug)]
pub struct ResourceLedger {
    capacity: Resources,
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn capacity(&self) -> Resources {
        self.capacity
    }

    /// How many more tasks of this type could start right now.
    ///
    /// Takes both the concurrency cap and every resource dimension into account.
    pub fn headroom(&self, details: &TaskTypeDetails) -> usize {
        let state = self.lock();
        let by_count = match details.max_concurrent {
            0 => usize::MAX,
            max => max.saturating_sub(state.running.get(&details.name).copied().unwrap_or(0)),
        };
        by_count.min(details.cost.copies_within(&state.reserved, &self.capacity))
    }

    /// Reserve one instance of `details`, or `None` if it no longer fits.
    pub fn try_reserve(self: &Arc<Self>, details: &TaskTypeDetails) -> Option<Reservation> {
        let mut state = self.lock();
        let running = state.running.get(&details.name).copied().unwrap_or(0);
        if details.max_concurrent > 0 && running >= details.max_concurrent {
            return None;
        }
        if !details.cost.fits(&state.reserved, &self.capacity) {
            return None;
        }
        state.reserved.add(&details.cost);
        *state.running.entry(details.name.clone()).or_insert(0) += 1;
        Some(Reservation {
            ledger: Arc::clone(self),
            task_type: details.name.clone(),
            cost: details.cost,
        })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.lock();
        LedgerSnapshot {
            capacity: self.capacity,
            reserved: state.reserved,
            running: state.running.clone(),
        }
    }

    fn release(&self, task_type: &TaskType, cost: &Resources) {
        let mut state = self.lock();
        state.reserved.sub(cost);
        if let Some(count) = state.running.get_mut(task_type) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.running.remove(task_type);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // Updates are plain arithmetic, a poisoned guard still holds consistent numbers.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One running task's share of the ledger. Released on drop.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<ResourceLedger>,
    task_type: TaskType,
    cost: Resources,
}

impl Reservation {
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn cost(&self) -> Resources {
        self.cost
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.release(&self.task_type, &self.cost);
    }
}
