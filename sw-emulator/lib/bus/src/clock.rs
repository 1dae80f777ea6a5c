/*++

Licensed under the Apache-2.0 license.

File Name:

    clock.rs

Abstract:

    File contains Clock and Timer types, used by peripherals to schedule
    deferred work (timer expiry, serial frame completion, DMA progress).

--*/
use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    ptr,
    rc::Rc,
};

use crate::Bus;

/// Largest distance, in cycles, between "now" and a scheduled deadline.
const HORIZON: u64 = u64::MAX >> 1;

/// A peripheral's handle onto the shared [`Clock`]. Peripherals keep a Timer
/// and an `Option<ActionHandle>` per pending deadline, and check the handle in
/// [`Bus::poll`].
///
/// # Example
///
/// ```
/// use vr0_emu_bus::{ActionHandle, Bus, BusError, Clock, Timer};
/// use vr0_emu_types::{BusAddr, BusData, BusSize};
///
/// struct OneShot {
///     timer: Timer,
///     expiry: Option<ActionHandle>,
///     expired: bool,
/// }
/// impl Bus for OneShot {
///     fn read(&mut self, _size: BusSize, _addr: BusAddr) -> Result<BusData, BusError> {
///         Ok(self.expired as BusData)
///     }
///     fn write(&mut self, _size: BusSize, _addr: BusAddr, val: BusData) -> Result<(), BusError> {
///         // Re-arming drops the previous deadline so it can never fire.
///         if let Some(expiry) = self.expiry.take() {
///             self.timer.cancel(expiry);
///         }
///         self.expiry = Some(self.timer.schedule_poll_in(u64::from(val)));
///         Ok(())
///     }
///     fn poll(&mut self) {
///         if self.timer.fired(&mut self.expiry) {
///             self.expired = true;
///         }
///     }
/// }
///
/// let clock = Clock::new();
/// let mut dev = OneShot { timer: clock.timer(), expiry: None, expired: false };
/// dev.write(BusSize::Word, 0, 100).unwrap();
/// clock.increment_and_process_timer_actions(99, &mut dev);
/// assert_eq!(dev.read(BusSize::Word, 0), Ok(0));
/// clock.increment_and_process_timer_actions(1, &mut dev);
/// assert_eq!(dev.read(BusSize::Word, 0), Ok(1));
/// ```
#[derive(Clone)]
pub struct Timer {
    clock: Rc<ClockImpl>,
}
impl Timer {
    /// Constructs a new timer bound to the specified clock.
    pub fn new(clock: &Clock) -> Self {
        Self {
            clock: Rc::clone(&clock.clock),
        }
    }

    /// Number of clock cycles elapsed since the clock was created.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Returns true, and sets `action` to None, once the deadline behind
    /// `action` has passed. Returns false for a pending deadline or for None.
    pub fn fired(&self, action: &mut Option<ActionHandle>) -> bool {
        let has_fired = match action {
            Some(handle) => {
                debug_assert_eq!(
                    handle.0.id.clock_ptr,
                    Rc::as_ptr(&self.clock),
                    "Supplied action was not created by this timer."
                );
                self.clock.has_fired(handle.0.time)
            }
            None => false,
        };
        if has_fired {
            *action = None;
        }
        has_fired
    }

    /// Cycles left until `action` fires; 0 once it has fired.
    pub fn remaining(&self, action: &ActionHandle) -> u64 {
        if self.clock.has_fired(action.0.time) {
            0
        } else {
            action.0.time.wrapping_sub(self.now())
        }
    }

    /// Schedules a [`Bus::poll()`] at absolute time `time`.
    pub fn schedule_poll_at(&self, time: u64) -> ActionHandle {
        self.clock.schedule_at(time)
    }

    /// Schedules a [`Bus::poll()`] `ticks_from_now` cycles from now.
    pub fn schedule_poll_in(&self, ticks_from_now: u64) -> ActionHandle {
        self.schedule_poll_at(self.now().wrapping_add(ticks_from_now))
    }

    /// Cancels a scheduled poll. A cancelled deadline never fires.
    ///
    /// # Panics
    ///
    /// Panics if the supplied `ActionHandle` was not created by this Timer's
    /// clock.
    pub fn cancel(&self, handle: ActionHandle) {
        self.clock.cancel(handle)
    }
}

/// The emulated machine's time base. The host owns one Clock and advances it
/// as its CPU core consumes cycles.
pub struct Clock {
    clock: Rc<ClockImpl>,
}
impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock {
    /// Constructs a new Clock with the cycle counter set to 0.
    pub fn new() -> Clock {
        Self {
            clock: ClockImpl::new(),
        }
    }

    /// Constructs a `Timer` associated with this clock.
    pub fn timer(&self) -> Timer {
        Timer::new(self)
    }

    /// Number of clock cycles elapsed since the clock was created.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Advances the clock by `delta` cycles. Returns true if any scheduled
    /// deadline was reached.
    #[inline]
    pub fn increment(&self, delta: u64) -> bool {
        self.clock.increment(delta)
    }

    /// Advances the clock by `delta` cycles and polls `bus` once if any
    /// scheduled deadline was reached. Returns whether the bus was polled.
    #[inline]
    pub fn increment_and_process_timer_actions(&self, delta: u64, bus: &mut impl Bus) -> bool {
        let fired = self.increment(delta);
        if fired {
            bus.poll();
        }
        fired
    }

    /// Time of the earliest scheduled deadline, if any. Lets a host skip idle
    /// stretches in one increment.
    pub fn next_deadline(&self) -> Option<u64> {
        self.clock.next_action_time.get()
    }
}

/// A scheduled poll, returned by [`Timer::schedule_poll_at`] and consumed by
/// [`Timer::fired()`] or [`Timer::cancel`].
pub struct ActionHandle(ActionHandleImpl);

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
struct ActionHandleImpl {
    /// The time the action is supposed to fire.
    time: u64,

    id: ActionId,
}

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
struct ActionId {
    /// Identifies the clock the action was scheduled on, so handles from
    /// different clocks are never confused. Never dereferenced.
    clock_ptr: *const ClockImpl,

    /// Sequence number assigned by the clock.
    seq: u64,
}
impl Default for ActionId {
    fn default() -> Self {
        Self {
            clock_ptr: ptr::null(),
            seq: 0,
        }
    }
}

struct ClockImpl {
    now: Cell<u64>,
    next_action_time: Cell<Option<u64>>,
    next_seq: Cell<u64>,
    pending: RefCell<BTreeSet<ActionHandleImpl>>,
}
impl ClockImpl {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            now: Cell::new(0),
            next_action_time: Cell::new(None),
            next_seq: Cell::new(0),
            pending: RefCell::new(BTreeSet::new()),
        })
    }

    #[inline]
    fn now(&self) -> u64 {
        self.now.get()
    }

    #[inline]
    fn increment(&self, delta: u64) -> bool {
        assert!(
            delta < HORIZON,
            "Cannot increment the current time by more than {} clock cycles.",
            HORIZON
        );
        self.now.set(self.now.get().wrapping_add(delta));
        match self.next_action_time.get() {
            Some(time) if self.has_fired(time) => {
                self.remove_fired();
                true
            }
            _ => false,
        }
    }

    fn schedule_at(self: &Rc<Self>, time: u64) -> ActionHandle {
        assert!(
            time.wrapping_sub(self.now()) < HORIZON,
            "Cannot schedule a timer action more than {} clock cycles from now.",
            HORIZON
        );
        let action = ActionHandleImpl {
            time,
            id: self.next_id(),
        };
        let mut pending = self.pending.borrow_mut();
        pending.insert(action);
        self.recompute_next_action_time(&pending);
        ActionHandle(action)
    }

    fn cancel(self: &Rc<Self>, handle: ActionHandle) {
        let action = handle.0;
        assert_eq!(
            Rc::as_ptr(self),
            action.id.clock_ptr,
            "Supplied action was not created by this timer."
        );
        let mut pending = self.pending.borrow_mut();
        pending.remove(&action);
        self.recompute_next_action_time(&pending)
    }

    fn next_id(self: &Rc<Self>) -> ActionId {
        let id = ActionId {
            clock_ptr: Rc::as_ptr(self),
            seq: self.next_seq.get(),
        };
        self.next_seq.set(self.next_seq.get().wrapping_add(1));
        id
    }

    fn has_fired(&self, action_time: u64) -> bool {
        self.now().wrapping_sub(action_time) < HORIZON
    }

    fn recompute_next_action_time(&self, pending: &BTreeSet<ActionHandleImpl>) {
        self.next_action_time
            .set(self.earliest(pending).map(|a| a.time));
    }

    /// The earliest deadline, accounting for wraparound: deadlines are
    /// searched starting half a horizon behind "now".
    fn earliest<'a>(&self, pending: &'a BTreeSet<ActionHandleImpl>) -> Option<&'a ActionHandleImpl> {
        let search_from = ActionHandleImpl {
            time: self.now().wrapping_sub(HORIZON),
            id: ActionId::default(),
        };
        pending
            .range(&search_from..)
            .next()
            .or_else(|| pending.iter().next())
    }

    /// Drops every fired deadline. Handles still held by peripherals keep
    /// reporting `fired()` because that check only compares times.
    #[cold]
    fn remove_fired(&self) {
        let mut pending = self.pending.borrow_mut();
        while let Some(action) = self.earliest(&pending).copied() {
            if !self.has_fired(action.time) {
                break;
            }
            pending.remove(&action);
        }
        self.recompute_next_action_time(&pending);
    }
}
