//! Internal callback polls: repeating timers and the async wake-up handle.
//!
//! mio has no timer primitive, so timers are deadline entries; the
//! poll-wait timeout is the nearest armed deadline and expirations dispatch
//! through the same callback arm as waker events. The loop's sweep timer is
//! one of these entries, dynamically enabled by the armed-timeout count.

use crate::event_loop::EventLoop;
use crate::types::TimerId;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub(crate) enum CallbackKind {
    Timer {
        deadline: Option<Instant>,
        period: Option<Duration>,
    },
    /// The cross-thread wake-up handle; readiness arrives through the
    /// poller, not a deadline.
    Async,
}

pub(crate) enum TimerAction {
    /// Run the timeout sweep across all contexts.
    Sweep,
    /// Invoke the user wakeup hook.
    Wakeup,
    User(Rc<dyn Fn(&mut EventLoop)>),
}

pub(crate) struct CallbackPoll {
    pub generation: u32,
    pub kind: CallbackKind,
    pub action: TimerAction,
    /// Internal polls (sweep timer, wake-up async) never keep the loop
    /// alive on their own.
    pub internal: bool,
}

impl EventLoop {
    /// Create a disarmed timer that invokes `cb` on expiry.
    /// An armed user timer keeps the loop alive.
    pub fn create_timer(&mut self, cb: Rc<dyn Fn(&mut EventLoop)>) -> TimerId {
        let generation = self.next_generation();
        let entry = self.timers.vacant_entry();
        let id = TimerId::new(entry.key(), generation);
        entry.insert(CallbackPoll {
            generation,
            kind: CallbackKind::Timer {
                deadline: None,
                period: None,
            },
            action: TimerAction::User(cb),
            internal: false,
        });
        id
    }

    /// Arm a timer to fire after `delay`, then every `period` if given.
    pub fn timer_set(&mut self, t: TimerId, delay: Duration, period: Option<Duration>) {
        let now = Instant::now();
        let mut newly_armed = false;
        if let Some(entry) = self.timer_entry_mut(t) {
            let internal = entry.internal;
            if let CallbackKind::Timer {
                deadline,
                period: p,
            } = &mut entry.kind
            {
                newly_armed = deadline.is_none() && !internal;
                *deadline = Some(now + delay);
                *p = period;
            }
        }
        if newly_armed {
            self.keep_handle();
        }
    }

    /// Disarm a timer without destroying it.
    pub fn timer_stop(&mut self, t: TimerId) {
        let mut disarmed = false;
        if let Some(entry) = self.timer_entry_mut(t) {
            let internal = entry.internal;
            if let CallbackKind::Timer { deadline, period } = &mut entry.kind {
                disarmed = deadline.is_some() && !internal;
                *deadline = None;
                *period = None;
            }
        }
        if disarmed {
            self.release_handle();
        }
    }

    /// Disarm and destroy a timer.
    pub fn timer_close(&mut self, t: TimerId) {
        self.timer_stop(t);
        if self
            .timers
            .get(t.index as usize)
            .map(|e| e.generation == t.generation)
            .unwrap_or(false)
        {
            self.timers.remove(t.index as usize);
        }
    }

    pub(crate) fn timer_entry_mut(&mut self, t: TimerId) -> Option<&mut CallbackPoll> {
        self.timers
            .get_mut(t.index as usize)
            .filter(|e| e.generation == t.generation)
    }

    /// Start the sweep timer; called when the first timeout slot is armed.
    pub(crate) fn enable_sweep_timer(&mut self) {
        let granularity = self.cfg.sweep_granularity;
        self.timer_set(self.sweep_timer, granularity, Some(granularity));
    }

    /// Stop the sweep timer; called when the last timeout slot disarms, so
    /// idle loops do not wake every tick.
    pub(crate) fn disable_sweep_timer(&mut self) {
        self.timer_stop(self.sweep_timer);
    }

    /// Poll-wait bound: time until the nearest armed deadline.
    pub(crate) fn next_timer_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .filter_map(|(_, entry)| match entry.kind {
                CallbackKind::Timer {
                    deadline: Some(deadline),
                    ..
                } => Some(deadline.saturating_duration_since(now)),
                _ => None,
            })
            .min()
    }

    /// Fire every timer whose deadline has passed, re-arming periodic ones.
    pub(crate) fn fire_expired_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<TimerId> = self
            .timers
            .iter()
            .filter_map(|(key, entry)| match entry.kind {
                CallbackKind::Timer {
                    deadline: Some(deadline),
                    ..
                } if deadline <= now => Some(TimerId::new(key, entry.generation)),
                _ => None,
            })
            .collect();

        for t in due {
            // A prior callback may have stopped or closed this timer.
            let mut fire = false;
            let mut expired_one_shot = false;
            if let Some(entry) = self.timer_entry_mut(t) {
                let internal = entry.internal;
                if let CallbackKind::Timer { deadline, period } = &mut entry.kind {
                    match (deadline.is_some(), *period) {
                        (true, Some(p)) => {
                            *deadline = Some(now + p);
                            fire = true;
                        }
                        (true, None) => {
                            *deadline = None;
                            expired_one_shot = !internal;
                            fire = true;
                        }
                        (false, _) => {}
                    }
                }
            }
            if expired_one_shot {
                self.release_handle();
            }
            if fire {
                self.invoke_callback_poll(t);
            }
        }
    }

    /// Run a callback poll's action; shared by timer expiry and the
    /// poller-delivered async wake-up.
    pub(crate) fn invoke_callback_poll(&mut self, t: TimerId) {
        let action = match self.timers.get(t.index as usize) {
            Some(entry) if entry.generation == t.generation => match &entry.action {
                TimerAction::Sweep => TimerAction::Sweep,
                TimerAction::Wakeup => TimerAction::Wakeup,
                TimerAction::User(cb) => TimerAction::User(cb.clone()),
            },
            _ => return,
        };
        match action {
            TimerAction::Sweep => crate::sweep::timer_sweep(self),
            TimerAction::Wakeup => {
                if let Some(cb) = self.hooks.on_wakeup.clone() {
                    cb(self);
                }
            }
            TimerAction::User(cb) => cb(self),
        }
    }
}
