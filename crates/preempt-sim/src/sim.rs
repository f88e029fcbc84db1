//! Discrete-event substrate.
//!
//! [`EventQueue`] keeps a virtual clock and a min-heap of pending events.
//! Events pop in non-decreasing time order; events scheduled for the same
//! instant pop in the order they were scheduled. [`Simulation`] drives a
//! [`Datacenter`] from the queue until it drains or is halted.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::{debug, info};

use crate::datacenter::{Datacenter, DatacenterEvent};
use crate::error::Result;
use crate::types::{SimTime, VmSpec};

/// An event with its delivery time and scheduling sequence.
#[derive(Debug, Clone)]
struct Scheduled<E> {
    time: SimTime,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; earliest (time, seq) must come out first
        other
            .time
            .cmp(&self.time)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Virtual clock plus pending events.
#[derive(Debug, Clone)]
pub struct EventQueue<E> {
    now: SimTime,
    seq: u64,
    heap: BinaryHeap<Scheduled<E>>,
    halted: bool,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

impl<E> EventQueue<E> {
    /// Creates an empty queue with the clock at 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty queue with the clock at `now`.
    #[must_use]
    pub fn starting_at(now: SimTime) -> Self {
        Self {
            now,
            seq: 0,
            heap: BinaryHeap::new(),
            halted: false,
        }
    }

    /// Current simulated time.
    #[must_use]
    pub const fn now(&self) -> SimTime {
        self.now
    }

    /// Schedules `event` after `delay`. Negative delays clamp to zero.
    pub fn schedule(&mut self, delay: i64, event: E) {
        let delay = SimTime::try_from(delay).unwrap_or(0);
        self.schedule_at(self.now.saturating_add(delay), event);
    }

    /// Schedules `event` at absolute `time`. Past times clamp to now.
    pub fn schedule_at(&mut self, time: SimTime, event: E) {
        let time = time.max(self.now);
        self.heap.push(Scheduled {
            time,
            seq: self.seq,
            event,
        });
        self.seq += 1;
    }

    /// Removes the next event and advances the clock to its time.
    ///
    /// Returns `None` once the queue is empty or halted.
    pub fn pop(&mut self) -> Option<E> {
        if self.halted {
            return None;
        }
        let next = self.heap.pop()?;
        self.now = next.time;
        Some(next.event)
    }

    /// Time of the next pending event.
    #[must_use]
    pub fn peek_time(&self) -> Option<SimTime> {
        if self.halted {
            return None;
        }
        self.heap.peek().map(|s| s.time)
    }

    /// Stops delivery and drops all pending events.
    pub fn halt(&mut self) {
        self.halted = true;
        self.heap.clear();
    }

    /// Returns true once [`halt`](Self::halt) was called.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Drives a [`Datacenter`] from an [`EventQueue`].
#[derive(Debug)]
pub struct Simulation {
    queue: EventQueue<DatacenterEvent>,
    datacenter: Datacenter,
    processed: u64,
}

impl Simulation {
    /// Wraps `datacenter`, starting the clock at its start time and
    /// scheduling its recurring activities and pending departures.
    #[must_use]
    pub fn new(mut datacenter: Datacenter) -> Self {
        let mut queue = EventQueue::starting_at(datacenter.start_time());
        datacenter.start(&mut queue);
        Self {
            queue,
            datacenter,
            processed: 0,
        }
    }

    /// Submits a VM request; it arrives at its submit time.
    pub fn submit(&mut self, spec: VmSpec) {
        self.datacenter.submit(&mut self.queue, spec);
    }

    /// Submits every request in `specs`.
    pub fn submit_all(&mut self, specs: impl IntoIterator<Item = VmSpec>) {
        for spec in specs {
            self.submit(spec);
        }
    }

    /// Current simulated time.
    #[must_use]
    pub const fn now(&self) -> SimTime {
        self.queue.now()
    }

    /// Number of events handled so far.
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.processed
    }

    /// Handles the next event. Returns false once nothing is left to handle.
    ///
    /// # Errors
    ///
    /// Returns error if the datacenter reaches an inconsistent state.
    pub fn step(&mut self) -> Result<bool> {
        let Some(event) = self.queue.pop() else {
            return Ok(false);
        };
        self.datacenter.handle(&mut self.queue, event)?;
        self.processed += 1;
        Ok(true)
    }

    /// Handles every event scheduled at or before `time`.
    ///
    /// # Errors
    ///
    /// Returns error if the datacenter reaches an inconsistent state.
    pub fn run_until(&mut self, time: SimTime) -> Result<()> {
        while self.queue.peek_time().is_some_and(|t| t <= time) {
            self.step()?;
        }
        Ok(())
    }

    /// Runs until the queue drains or end-of-simulation halts it, then
    /// finishes the datacenter if no end-of-simulation event did.
    ///
    /// # Errors
    ///
    /// Returns error if the datacenter reaches an inconsistent state.
    pub fn run(&mut self) -> Result<()> {
        info!(start = self.queue.now(), pending = self.queue.len(), "simulation started");
        while self.step()? {}
        if !self.datacenter.is_finished() {
            debug!(now = self.queue.now(), "event queue drained");
            self.datacenter.finish(&mut self.queue);
        }
        info!(
            now = self.queue.now(),
            events = self.processed,
            "simulation finished"
        );
        Ok(())
    }

    /// Returns the datacenter.
    #[must_use]
    pub const fn datacenter(&self) -> &Datacenter {
        &self.datacenter
    }

    /// Returns the datacenter mutably.
    pub fn datacenter_mut(&mut self) -> &mut Datacenter {
        &mut self.datacenter
    }

    /// Consumes the simulation, returning the datacenter.
    #[must_use]
    pub fn into_datacenter(self) -> Datacenter {
        self.datacenter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod queue_tests {
        use super::*;

        #[test]
        fn events_pop_in_time_order() {
            let mut queue = EventQueue::new();
            queue.schedule(30, "c");
            queue.schedule(10, "a");
            queue.schedule(20, "b");

            assert_eq!(queue.pop(), Some("a"));
            assert_eq!(queue.now(), 10);
            assert_eq!(queue.pop(), Some("b"));
            assert_eq!(queue.pop(), Some("c"));
            assert_eq!(queue.now(), 30);
            assert_eq!(queue.pop(), None);
        }

        #[test]
        fn same_instant_events_keep_submission_order() {
            let mut queue = EventQueue::new();
            for i in 0..20 {
                queue.schedule(5, i);
            }
            let order: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
            assert_eq!(order, (0..20).collect::<Vec<_>>());
        }

        #[test]
        fn negative_delay_clamps_to_now() {
            let mut queue = EventQueue::starting_at(100);
            queue.schedule(-50, "late");
            assert_eq!(queue.peek_time(), Some(100));
            queue.schedule_at(10, "past");
            assert_eq!(queue.pop(), Some("late"));
            assert_eq!(queue.pop(), Some("past"));
            assert_eq!(queue.now(), 100);
        }

        #[test]
        fn halt_drops_pending_events() {
            let mut queue = EventQueue::new();
            queue.schedule(1, ());
            queue.schedule(2, ());
            queue.halt();
            assert!(queue.is_halted());
            assert!(queue.is_empty());
            queue.schedule(3, ());
            assert_eq!(queue.pop(), None);
        }

        #[test]
        fn clock_never_moves_backwards() {
            let mut queue = EventQueue::new();
            queue.schedule(50, 1);
            assert_eq!(queue.pop(), Some(1));
            queue.schedule_at(20, 2);
            assert_eq!(queue.pop(), Some(2));
            assert_eq!(queue.now(), 50);
        }
    }
}
