//! Admission control for read and write throughput.
//!
//! Budgets are replenished only by an explicit tick; there is no wall-clock
//! coupling, which keeps the scheduler deterministic and testable. Each
//! direction has an independent budget and a strictly FIFO queue.

use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Throughput allowance for one direction. A rate of 0 means unlimited.
#[derive(Debug)]
pub struct RateBudget {
    rate: u64,
    allowance: u64,
}

impl RateBudget {
    pub fn new(rate: u64) -> Self {
        Self { rate, allowance: 0 }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    pub fn set_rate(&mut self, rate: u64) {
        self.rate = rate;
        if rate == 0 {
            self.allowance = 0;
        }
    }

    /// Debits `size` if the allowance suffices (or the budget is unlimited).
    pub fn try_debit(&mut self, size: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        if self.allowance >= size {
            self.allowance -= size;
            true
        } else {
            false
        }
    }

    /// Adds `rate * elapsed` to the allowance. Saturating, never negative.
    ///
    /// The allowance is deliberately uncapped: a queued operation larger than
    /// one tick's worth of budget must still be admitted after finitely many
    /// ticks.
    pub fn replenish(&mut self, elapsed: Duration) {
        if self.is_unlimited() {
            return;
        }
        let earned = (self.rate as u128 * elapsed.as_millis()) / 1000;
        let earned = u64::try_from(earned).unwrap_or(u64::MAX);
        self.allowance = self.allowance.saturating_add(earned);
    }

    #[cfg(test)]
    fn allowance(&self) -> u64 {
        self.allowance
    }
}

struct Lane<T> {
    budget: RateBudget,
    queue: VecDeque<(u64, T)>,
    pending_bytes: u64,
}

impl<T> Lane<T> {
    fn new(rate: u64) -> Self {
        Self {
            budget: RateBudget::new(rate),
            queue: VecDeque::new(),
            pending_bytes: 0,
        }
    }

    fn admit(&mut self, size: u64, job: T) -> Option<T> {
        // FIFO fairness: a newcomer never overtakes queued jobs.
        if self.queue.is_empty() && self.budget.try_debit(size) {
            return Some(job);
        }
        self.pending_bytes += size;
        self.queue.push_back((size, job));
        None
    }

    fn drain(&mut self, released: &mut Vec<T>) {
        while let Some((size, _)) = self.queue.front() {
            if !self.budget.try_debit(*size) {
                break;
            }
            let (size, job) = self.queue.pop_front().unwrap();
            self.pending_bytes -= size;
            released.push(job);
        }
    }
}

/// Per-direction rate limiter with FIFO queues of suspended jobs.
///
/// `T` is whatever the caller needs to resume an admitted operation.
pub struct RateLimiter<T> {
    read: Lane<T>,
    write: Lane<T>,
}

impl<T> RateLimiter<T> {
    pub fn new(read_rate: u64, write_rate: u64) -> Self {
        Self {
            read: Lane::new(read_rate),
            write: Lane::new(write_rate),
        }
    }

    fn lane_mut(&mut self, dir: Direction) -> &mut Lane<T> {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn lane(&self, dir: Direction) -> &Lane<T> {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Admits a job immediately (returning it) or queues it.
    pub fn admit(&mut self, dir: Direction, size: u64, job: T) -> Option<T> {
        self.lane_mut(dir).admit(size, job)
    }

    /// Replenishes both directions and releases queued jobs in arrival
    /// order while the allowance suffices, partially draining if not all fit.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<T> {
        let mut released = Vec::new();
        self.read.budget.replenish(elapsed);
        self.read.drain(&mut released);
        self.write.budget.replenish(elapsed);
        self.write.drain(&mut released);
        released
    }

    /// Live rate change. Switching a direction to unlimited releases its
    /// whole queue.
    pub fn set_rate(&mut self, dir: Direction, rate: u64) -> Vec<T> {
        let lane = self.lane_mut(dir);
        lane.budget.set_rate(rate);
        let mut released = Vec::new();
        if lane.budget.is_unlimited() {
            while let Some((size, job)) = lane.queue.pop_front() {
                lane.pending_bytes -= size;
                released.push(job);
            }
        }
        released
    }

    /// Sum of sizes of queued, not-yet-serviced jobs.
    pub fn pending_bytes(&self, dir: Direction) -> u64 {
        self.lane(dir).pending_bytes
    }

    pub fn queue_len(&self, dir: Direction) -> usize {
        self.lane(dir).queue.len()
    }

    /// Removes queued jobs matching the predicate, returning them so the
    /// caller can fail their completions. Used for transfer teardown.
    pub fn remove_jobs<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        for lane in [&mut self.read, &mut self.write] {
            let mut kept = VecDeque::with_capacity(lane.queue.len());
            while let Some((size, job)) = lane.queue.pop_front() {
                if pred(&job) {
                    lane.pending_bytes -= size;
                    removed.push(job);
                } else {
                    kept.push_back((size, job));
                }
            }
            lane.queue = kept;
        }
        removed
    }
}
