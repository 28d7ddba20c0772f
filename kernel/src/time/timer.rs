//! Per-CPU alarm lists.
//!
//! Each CPU keeps its events sorted by remaining ticks; deadlines live in a
//! 2^50 modulus so the comparison survives counter wrap. The interrupt walks
//! the head while events are due, completes each at most once per period
//! (`sent_to_task` guards slow periodic consumers), and re-inserts periodic
//! events one period ahead. Acceptance re-arms a periodic event's request;
//! one-shot events die with their acceptance.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::io::{self, IoHandle, IoObject, IoRequest, IO_REQUEST_FAILURE, MAX_IO_RETURNS};
use crate::per_cpu;
use crate::spinlock::SpinLock;

use super::TIMER_FREQUENCY;

/// Deadlines count in this modulus.
pub const COUNTDOWN_TICK_MODULO: u64 = 1 << 50;

pub struct TimerEvent {
    request: IoRequest,
    /// Absolute due tick, modulo [`COUNTDOWN_TICK_MODULO`]; guarded by the
    /// list lock.
    deadline: Cell<u64>,
    /// Zero for one-shot alarms.
    period: u64,
    /// Set when completed, cleared when the owner accepts; a due periodic
    /// event that is still set gets skipped instead of completed twice.
    sent_to_task: Cell<bool>,
    list: &'static TimerList,
}

// SAFETY: the cells are guarded by the owning list's lock.
unsafe impl Send for TimerEvent {}
unsafe impl Sync for TimerEvent {}

struct TimerInner {
    current_tick: u64,
    /// Sorted by remaining ticks, soonest first.
    events: Vec<Arc<TimerEvent>>,
}

pub struct TimerList {
    inner: SpinLock<TimerInner>,
}

fn remaining(deadline: u64, now: u64) -> u64 {
    (deadline + COUNTDOWN_TICK_MODULO - now) % COUNTDOWN_TICK_MODULO
}

impl TimerList {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(TimerInner {
                current_tick: 0,
                events: Vec::new(),
            }),
        }
    }

    fn insert_locked(inner: &mut TimerInner, event: Arc<TimerEvent>, wait_ticks: u64) {
        let now = inner.current_tick;
        event
            .deadline
            .set((now + wait_ticks) % COUNTDOWN_TICK_MODULO);
        event.sent_to_task.set(false);
        let position = inner
            .events
            .iter()
            .position(|existing| wait_ticks <= remaining(existing.deadline.get(), now))
            .unwrap_or(inner.events.len());
        inner.events.insert(position, event);
    }

    fn insert(&self, event: Arc<TimerEvent>, wait_ticks: u64) {
        let mut inner = self.inner.lock_irq();
        Self::insert_locked(&mut inner, event, wait_ticks);
    }

    fn remove(&self, event: &TimerEvent) {
        let mut inner = self.inner.lock_irq();
        inner
            .events
            .retain(|existing| !core::ptr::eq(existing.as_ref(), event));
    }

    /// One timer tick: complete everything due, reschedule periodic events,
    /// advance the clock.
    pub fn handle_tick(&self) {
        let fired = {
            let mut inner = self.inner.lock_irq();
            let now = inner.current_tick;
            let mut fired = Vec::new();
            while let Some(event) = inner.events.first().cloned() {
                if event.deadline.get() != now {
                    break;
                }
                inner.events.remove(0);
                if event.sent_to_task.get() {
                    // the previous period's completion has not been
                    // accepted yet
                    debug_assert!(event.period > 0);
                    log::warn!("skipping a periodic timer event");
                } else {
                    event.sent_to_task.set(true);
                    fired.push(event.clone());
                }
                if event.period > 0 {
                    let period = event.period;
                    Self::insert_locked(&mut inner, event, period);
                }
            }
            inner.current_tick = (now + 1) % COUNTDOWN_TICK_MODULO;
            fired
        };
        for event in fired {
            let object: Arc<dyn IoObject> = event;
            io::complete(&object);
        }
    }

    #[cfg(test)]
    fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            self.handle_tick();
        }
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

impl IoObject for TimerEvent {
    fn request(&self) -> &IoRequest {
        &self.request
    }

    fn cancel(self: Arc<Self>) {
        self.list.remove(&self);
    }

    fn accept(self: Arc<Self>, _returns: &mut [usize; MAX_IO_RETURNS]) -> usize {
        if self.period > 0 {
            // the interrupt already rescheduled the event; re-arm its
            // request for the next firing
            let object: Arc<dyn IoObject> = self.clone();
            io::pend(object.clone());
            io::set_cancellable(&object, true);
            let _inner = self.list.inner.lock_irq();
            self.sent_to_task.set(false);
        }
        0
    }
}

/// This CPU's event list, created on first use.
pub fn current_timer_list() -> &'static TimerList {
    let cpu = per_cpu::current();
    match cpu.timer_list() {
        Some(list) => list,
        None => {
            let list = Box::leak(Box::new(TimerList::new()));
            cpu.set_timer_list(list);
            list
        }
    }
}

/// Arm an alarm `milliseconds` out, one-shot or periodic, on this CPU's
/// list. Overflow of the millisecond-to-tick conversion is not checked at
/// this layer; zero rounds up to one tick.
pub fn set_alarm(milliseconds: u64, periodic: bool) -> IoHandle {
    let mut ticks = milliseconds * TIMER_FREQUENCY / 1000;
    if ticks >= COUNTDOWN_TICK_MODULO {
        return IO_REQUEST_FAILURE;
    }
    if ticks == 0 {
        ticks = 1;
    }
    let list = current_timer_list();
    let event = Arc::new(TimerEvent {
        request: IoRequest::new(),
        deadline: Cell::new(0),
        period: if periodic { ticks } else { 0 },
        sent_to_task: Cell::new(false),
        list,
    });
    let object: Arc<dyn IoObject> = event.clone();
    let handle = io::pend(object);
    list.insert(event, ticks);
    handle
}

/// Block the calling task for at least `milliseconds`.
pub fn sleep(milliseconds: u64) -> bool {
    let handle = set_alarm(milliseconds, false);
    if handle == IO_REQUEST_FAILURE {
        return false;
    }
    io::wait_io(handle).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler;

    #[test]
    fn one_shot_alarm_completes_once_when_due() {
        scheduler::ensure_bootstrap_task();
        let list = current_timer_list();
        // 100 ms => 10 ticks
        let handle = set_alarm(100, false);
        assert_ne!(handle, IO_REQUEST_FAILURE);
        let task = scheduler::current_task();

        list.advance(10);
        assert_eq!(task.io.lock().completed_count(), 0);
        list.advance(1);
        assert_eq!(task.io.lock().completed_count(), 1);

        assert!(io::wait_io(handle).is_some());
        assert_eq!(task.io.lock().completed_count(), 0);
        // a dead handle cannot be waited on again
        assert!(io::wait_io(handle).is_none());
    }

    #[test]
    fn cancel_before_expiry_wins_the_race() {
        scheduler::ensure_bootstrap_task();
        let list = current_timer_list();
        let handle = set_alarm(100, false);
        assert_ne!(handle, IO_REQUEST_FAILURE);
        list.advance(5);
        assert!(io::cancel_io(handle));
        // the deadline passing must not touch the cancelled event
        list.advance(10);
        assert!(io::wait_io(handle).is_none());
        let task = scheduler::current_task();
        assert_eq!(task.io.lock().completed_count(), 0);
    }

    #[test]
    fn alarms_fire_in_deadline_order() {
        scheduler::ensure_bootstrap_task();
        let list = current_timer_list();
        let late = set_alarm(300, false);
        let early = set_alarm(100, false);
        list.advance(11);
        let task = scheduler::current_task();
        assert_eq!(task.io.lock().completed_count(), 1);
        let first = io::wait(&task, None);
        assert_eq!(io::handle_of(&first), early);
        let mut returns = [0; MAX_IO_RETURNS];
        first.accept(&mut returns);
        list.advance(20);
        assert!(io::wait_io(late).is_some());
    }

    #[test]
    fn periodic_alarm_rearms_through_acceptance() {
        scheduler::ensure_bootstrap_task();
        let list = current_timer_list();
        let handle = set_alarm(50, true); // 5 ticks
        let task = scheduler::current_task();

        list.advance(6);
        assert_eq!(task.io.lock().completed_count(), 1);
        // a slow consumer: the next period fires but is skipped, not
        // completed twice
        list.advance(5);
        assert_eq!(task.io.lock().completed_count(), 1);

        // accepting re-arms the event for the following period
        assert!(io::wait_io(handle).is_some());
        list.advance(5);
        assert_eq!(task.io.lock().completed_count(), 1);
        assert!(io::cancel_io(handle));
    }
}
