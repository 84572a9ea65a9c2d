/*++

Licensed under the Apache-2.0 license.

File Name:

    clock.rs

Abstract:

    File contains the simulation clock and the Timer type peripherals use
    to schedule deferred work.

--*/
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use crate::Bus;

/// Half of the u64 tick space. Times are compared with wrapping
/// arithmetic, so anything within this window of `now` counts as the
/// past and everything else as the future.
const HORIZON: u64 = u64::MAX >> 1;

/// Actions a timer can deliver when its deadline passes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TimerAction {
    Poll,
    WarmReset,
    UpdateReset,
    Halt,
}

/// A scheduled action. Returned by the `Timer::schedule_*` methods and
/// consumed by [`Timer::fired`] or [`Timer::cancel`].
pub struct ActionHandle {
    /// Absolute tick at which the action fires.
    deadline: u64,

    /// Position in the scheduler queue, unique per scheduler.
    seq: u64,

    /// Identifies the scheduler that issued this handle; used only to
    /// reject handles passed to the wrong timer.
    owner: *const Scheduler,
}

/// Handle peripherals hold to schedule future [`Bus::poll`] callbacks.
/// Cloning is cheap; all clones share the underlying clock.
///
/// # Example
///
/// ```
/// use ot_emu_bus::{Bus, BusError, Timer, ActionHandle};
/// use ot_emu_types::{RvAddr, RvData, RvSize};
/// struct MyPeriph {
///     timer: Timer,
///     pending: Option<ActionHandle>,
/// }
/// impl Bus for MyPeriph {
///     fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
///         Ok(0)
///     }
///     fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
///         if let Some(pending) = self.pending.take() {
///             self.timer.cancel(pending);
///         }
///         self.pending = Some(self.timer.schedule_poll_in(1000));
///         Ok(())
///     }
///     fn poll(&mut self) {
///         if self.timer.fired(&mut self.pending) {
///             // 1000 ticks after the last write
///         }
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Timer {
    scheduler: Rc<Scheduler>,
}

impl Timer {
    pub fn new(clock: &Clock) -> Self {
        Self {
            scheduler: Rc::clone(&clock.scheduler),
        }
    }

    /// Ticks elapsed since simulation start.
    #[inline]
    pub fn now(&self) -> u64 {
        self.scheduler.now.get()
    }

    /// Consumes `handle` and returns true if its deadline has passed.
    /// Returns false (leaving the handle in place) otherwise, or if
    /// `handle` is `None`.
    pub fn fired(&self, handle: &mut Option<ActionHandle>) -> bool {
        match handle {
            Some(h) => {
                assert_eq!(
                    h.owner,
                    Rc::as_ptr(&self.scheduler),
                    "action handle belongs to a different clock"
                );
                if self.scheduler.elapsed(h.deadline) {
                    *handle = None;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Schedules a [`Bus::poll`] callback at absolute tick `time`.
    pub fn schedule_poll_at(&self, time: u64) -> ActionHandle {
        self.scheduler.schedule(time, TimerAction::Poll)
    }

    /// Schedules a [`Bus::poll`] callback `ticks_from_now` ticks ahead.
    pub fn schedule_poll_in(&self, ticks_from_now: u64) -> ActionHandle {
        self.schedule_poll_at(self.now().wrapping_add(ticks_from_now))
    }

    /// Schedules an arbitrary action `ticks_from_now` ticks ahead.
    pub fn schedule_action_in(&self, ticks_from_now: u64, action: TimerAction) -> ActionHandle {
        self.scheduler
            .schedule(self.now().wrapping_add(ticks_from_now), action)
    }

    /// Cancels a scheduled action.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was issued by a different clock.
    pub fn cancel(&self, handle: ActionHandle) {
        assert_eq!(
            handle.owner,
            Rc::as_ptr(&self.scheduler),
            "action handle belongs to a different clock"
        );
        self.scheduler
            .queue
            .borrow_mut()
            .remove(&(handle.deadline, handle.seq));
    }
}

/// The simulation tick counter and action queue shared by all timers.
pub struct Clock {
    scheduler: Rc<Scheduler>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Clock {
        Self {
            scheduler: Rc::new(Scheduler {
                now: Cell::new(0),
                next_seq: Cell::new(0),
                queue: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    pub fn timer(&self) -> Timer {
        Timer {
            scheduler: Rc::clone(&self.scheduler),
        }
    }

    /// Ticks elapsed since simulation start.
    #[inline]
    pub fn now(&self) -> u64 {
        self.scheduler.now.get()
    }

    /// Advances the clock by `delta` ticks and collects the actions whose
    /// deadlines passed.
    #[inline]
    pub fn increment(&self, delta: u64) -> HashSet<TimerAction> {
        self.scheduler.advance(delta)
    }

    /// Advances the clock by `delta` ticks and drives the fired actions
    /// into `bus`.
    pub fn increment_and_process_timer_actions(
        &self,
        delta: u64,
        bus: &mut impl Bus,
    ) -> HashSet<TimerAction> {
        let fired = self.increment(delta);
        for action in fired.iter() {
            match action {
                TimerAction::Poll => bus.poll(),
                TimerAction::WarmReset => {
                    bus.warm_reset();
                    break;
                }
                TimerAction::UpdateReset => {
                    bus.update_reset();
                    break;
                }
                TimerAction::Halt => {}
            }
        }
        fired
    }

    #[cfg(test)]
    fn set_now(&self, now: u64) {
        self.scheduler.now.set(now);
    }
}

struct Scheduler {
    now: Cell<u64>,
    next_seq: Cell<u64>,
    /// Pending actions keyed by (deadline, sequence number). Deadlines
    /// wrap, so lookups always search from the oldest representable past
    /// tick rather than from key zero.
    queue: RefCell<BTreeMap<(u64, u64), TimerAction>>,
}

impl Scheduler {
    /// True if `deadline` is in the past half of the tick space.
    #[inline]
    fn elapsed(&self, deadline: u64) -> bool {
        self.now.get().wrapping_sub(deadline) < HORIZON
    }

    fn schedule(self: &Rc<Self>, deadline: u64, action: TimerAction) -> ActionHandle {
        assert!(
            deadline.wrapping_sub(self.now.get()) < HORIZON,
            "cannot schedule an action more than {HORIZON} ticks ahead"
        );
        let seq = self.next_seq.get();
        self.next_seq.set(seq.wrapping_add(1));
        self.queue.borrow_mut().insert((deadline, seq), action);
        ActionHandle {
            deadline,
            seq,
            owner: Rc::as_ptr(self),
        }
    }

    fn advance(&self, delta: u64) -> HashSet<TimerAction> {
        assert!(
            delta < HORIZON,
            "cannot advance the clock by more than {HORIZON} ticks"
        );
        self.now.set(self.now.get().wrapping_add(delta));
        let mut fired = HashSet::new();
        let mut queue = self.queue.borrow_mut();
        if queue.is_empty() {
            return fired;
        }
        // Two range scans cover the wrapped tick space: first from the
        // oldest past tick upward, then from zero for deadlines that
        // wrapped around.
        let oldest_past = self.now.get().wrapping_sub(HORIZON - 1);
        let mut due: Vec<(u64, u64)> = Vec::new();
        for (&key, _) in queue.range((oldest_past, 0)..) {
            if !self.elapsed(key.0) {
                break;
            }
            due.push(key);
        }
        for (&key, _) in queue.range(..(oldest_past, 0)) {
            if !self.elapsed(key.0) {
                break;
            }
            due.push(key);
        }
        for key in due {
            if let Some(action) = queue.remove(&key) {
                fired.insert(action);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBus;

    #[test]
    fn test_clock_advances() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);
        assert!(clock.increment(25).is_empty());
        assert_eq!(clock.now(), 25);
        assert!(clock.increment(100).is_empty());
        assert_eq!(clock.now(), 125);
    }

    fn exercise_timer(clock: Clock) {
        let t0 = clock.now();
        let timer = clock.timer();
        let mut at25 = Some(timer.schedule_poll_in(25));
        let cancelled = timer.schedule_poll_in(40);
        let mut at100a = Some(timer.schedule_poll_in(100));
        let mut at100b = Some(timer.schedule_poll_in(100));
        let mut at102 = Some(timer.schedule_poll_in(102));
        let mut never = Option::<ActionHandle>::None;

        assert!(clock.increment(24).is_empty());
        assert_eq!(clock.now().wrapping_sub(t0), 24);
        assert!(!timer.fired(&mut at25) && at25.is_some());
        assert!(!timer.fired(&mut at100a) && at100a.is_some());
        assert!(!timer.fired(&mut never) && never.is_none());

        assert!(!clock.increment(1).is_empty());
        assert!(timer.fired(&mut at25) && at25.is_none());
        // A consumed handle stays consumed.
        assert!(!timer.fired(&mut at25));
        assert!(!timer.fired(&mut at100a) && at100a.is_some());

        // A handle scheduled mid-flight fires on its own deadline.
        let mut at27 = Some(timer.schedule_poll_in(2));
        assert!(clock.increment(1).is_empty());
        assert!(!timer.fired(&mut at27) && at27.is_some());
        assert!(!clock.increment(1).is_empty());
        assert!(timer.fired(&mut at27) && at27.is_none());

        // Cancelled actions never fire.
        timer.cancel(cancelled);
        assert!(clock.increment(24).is_empty());
        assert_eq!(clock.now().wrapping_sub(t0), 51);

        // Two actions sharing a deadline both fire on the same advance.
        assert!(!clock.increment(50).is_empty());
        assert_eq!(clock.now().wrapping_sub(t0), 101);
        assert!(timer.fired(&mut at100a) && at100a.is_none());
        assert!(timer.fired(&mut at100b) && at100b.is_none());
        assert!(!timer.fired(&mut at102) && at102.is_some());

        // A huge advance collects the stragglers.
        assert!(!clock.increment(1_000_000_000_000_000_000).is_empty());
        assert!(timer.fired(&mut at102) && at102.is_none());
        assert!(clock.increment(1_000_000_000_000_000_000).is_empty());
    }

    #[test]
    fn test_timer_from_zero() {
        exercise_timer(Clock::new());
    }

    #[test]
    fn test_timer_from_large_offset() {
        let clock = Clock::new();
        assert!(clock.increment(234_293_489_238).is_empty());
        exercise_timer(clock);
    }

    #[test]
    fn test_timer_across_tick_wraparound() {
        for start in (u64::MAX - 120)..=u64::MAX {
            let clock = Clock::new();
            clock.set_now(start);
            exercise_timer(clock);
        }
    }

    #[test]
    fn test_timer_across_horizon_wraparound() {
        for start in (HORIZON - 130)..=(HORIZON + 130) {
            let clock = Clock::new();
            clock.set_now(start);
            exercise_timer(clock);
        }
    }

    #[test]
    fn test_increment_polls_bus() {
        let clock = Clock::new();
        let timer = clock.timer();
        let mut bus = FakeBus::new();

        let mut pending = Some(timer.schedule_poll_in(25));
        clock.increment_and_process_timer_actions(20, &mut bus);
        assert_eq!(bus.log.take(), "");

        clock.increment_and_process_timer_actions(20, &mut bus);
        assert_eq!(bus.log.take(), "poll()\n");

        assert!(timer.fired(&mut pending));
    }

    #[test]
    #[should_panic(expected = "cannot schedule an action more than")]
    fn test_schedule_beyond_horizon() {
        let clock = Clock::new();
        clock.increment(123_729);
        clock.timer().schedule_poll_in(HORIZON);
    }

    #[test]
    #[should_panic(expected = "cannot advance the clock by more than")]
    fn test_advance_beyond_horizon() {
        let clock = Clock::new();
        clock.increment(HORIZON);
    }

    #[test]
    #[should_panic(expected = "action handle belongs to a different clock")]
    fn test_handle_from_other_clock_rejected() {
        let clock0 = Clock::new();
        let handle = clock0.timer().schedule_poll_at(50);

        let clock1 = Clock::new();
        let _ = clock1.timer().schedule_poll_at(50);
        clock1.timer().cancel(handle);
    }
}
