//! Timer awaiter backed by a process-wide timer thread.
//!
//! An [`Alarm`] owns a deadline and, while awaited, one armed timer entry.
//! Awaiting `alarm.start()` posts a tag that fires with ok=true at the
//! deadline, or ok=false if [`Alarm::cancel`] runs first. Cancellation posts
//! the false completion directly and cheaply; the timer thread's own firing
//! of an already-cancelled entry is a stale post the queue ignores.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::cq::{CqHandle, Tag};
use crate::runtime::awaiter::cq_operation;

/// A timer awaiter. Move-only; the deadline may be re-set between uses.
pub struct Alarm {
    deadline: Mutex<Instant>,
    armed: Mutex<Option<(CqHandle, Tag)>>,
}

impl Alarm {
    #[must_use]
    pub fn new(deadline: Instant) -> Self {
        Alarm {
            deadline: Mutex::new(deadline),
            armed: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn after(delay: Duration) -> Self {
        Alarm::new(Instant::now() + delay)
    }

    pub fn set_deadline(&self, deadline: Instant) {
        *self.lock_deadline() = deadline;
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        *self.lock_deadline()
    }

    /// Arm the alarm against the current executor's queue and suspend until
    /// it fires (ok=true) or is cancelled (ok=false). A deadline already in
    /// the past fires promptly.
    pub fn start(&self) -> impl Future<Output = bool> + '_ {
        async move {
            let deadline = self.deadline();
            let ok = cq_operation(|queue, tag| {
                let mut armed = self.lock_armed();
                debug_assert!(armed.is_none(), "alarm started while already armed");
                *armed = Some((queue.clone(), tag));
                timer().arm(deadline, queue.clone(), tag);
            })
            .await;
            self.lock_armed().take();
            ok
        }
    }

    /// Cancel an armed alarm: its awaiter resumes with ok=false. Cheap,
    /// non-blocking, and idempotent; a no-op if the alarm is not armed.
    pub fn cancel(&self) {
        if let Some((queue, tag)) = self.lock_armed().take() {
            queue.post(tag, false);
        }
    }

    fn lock_deadline(&self) -> MutexGuard<'_, Instant> {
        self.deadline.lock().expect("alarm deadline mutex poisoned")
    }

    fn lock_armed(&self) -> MutexGuard<'_, Option<(CqHandle, Tag)>> {
        self.armed.lock().expect("alarm state mutex poisoned")
    }
}

struct TimerThread {
    commands: Sender<ArmedEntry>,
}

impl TimerThread {
    fn arm(&self, deadline: Instant, queue: CqHandle, tag: Tag) {
        let _ = self.commands.send(ArmedEntry {
            deadline,
            queue,
            tag,
        });
    }
}

struct ArmedEntry {
    deadline: Instant,
    queue: CqHandle,
    tag: Tag,
}

impl PartialEq for ArmedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for ArmedEntry {}

impl PartialOrd for ArmedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArmedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the nearest deadline
        // on top.
        other.deadline.cmp(&self.deadline)
    }
}

fn timer() -> &'static TimerThread {
    static TIMER: OnceLock<TimerThread> = OnceLock::new();
    TIMER.get_or_init(|| {
        let (sender, receiver) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("cq-timer".to_string())
            .spawn(move || run_timer(&receiver))
            .expect("failed to spawn timer thread");
        TimerThread { commands: sender }
    })
}

fn run_timer(commands: &Receiver<ArmedEntry>) {
    let mut schedule: BinaryHeap<ArmedEntry> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while schedule.peek().is_some_and(|entry| entry.deadline <= now) {
            let entry = schedule.pop().expect("peeked entry vanished");
            entry.queue.post(entry.tag, true);
        }

        let received = match schedule.peek() {
            Some(entry) => {
                let wait = entry.deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(wait) {
                    Ok(entry) => Some(entry),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match commands.recv() {
                Ok(entry) => Some(entry),
                Err(_) => return,
            },
        };
        if let Some(entry) = received {
            schedule.push(entry);
        }
    }
}
