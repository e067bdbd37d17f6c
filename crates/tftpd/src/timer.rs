//! Restartable retransmission timer with exponential backoff
//!
//! A [`BackoffTimer`] is a handle onto a single background task that owns one
//! `Sleep`. The handle only ever sends commands into that task; all timer
//! state lives on the task itself.
//!
//! States:
//! - idle: spawned, no countdown yet
//! - running: counting down `base * multiplier`
//! - destroyed: task gone, no further events
//!
//! After each elapse the timer reports the wait it just finished, doubles
//! its multiplier and re-arms itself. `restart` puts the multiplier back to 1.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::trace;

/// Backoff stops doubling here (base 1s gives a wait of about 18 hours)
const MAX_BACKOFF_MULTIPLIER: u32 = 1 << 16;

/// Stand-in deadline when `now + wait` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// One expired countdown
///
/// Tagged with the restart generation that armed it so that a consumer can
/// tell an elapse queued before a restart from one armed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    generation: u64,
    waited: Duration,
}

impl Elapsed {
    pub fn new(generation: u64, waited: Duration) -> Self {
        Self { generation, waited }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Length of the countdown that just expired
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Control surface of a retransmission timer
///
/// Elapse events are not returned from here; they arrive on whatever channel
/// the timer was built with.
pub trait Timer: Send + 'static {
    /// Start a fresh countdown at the base duration
    fn restart(&mut self);

    /// Stop the timer for good. Calling it again does nothing.
    fn destroy(&mut self);

    /// Whether `elapsed` was armed by the most recent `restart`
    fn is_current(&self, elapsed: &Elapsed) -> bool;
}

#[derive(Debug)]
enum Command {
    Restart { generation: u64 },
    Destroy,
}

/// Production [`Timer`] backed by a tokio task
#[derive(Debug)]
pub struct BackoffTimer {
    commands: mpsc::UnboundedSender<Command>,
    generation: u64,
    destroyed: bool,
}

impl BackoffTimer {
    /// Spawn the timer task in the idle state
    ///
    /// Every elapse is delivered on `events` converted into the consumer's
    /// own event type. The task exits when the handle is dropped, when it is
    /// destroyed, or when `events` is closed.
    pub fn spawn<E>(base: Duration, events: mpsc::UnboundedSender<E>) -> Self
    where
        E: From<Elapsed> + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_timer(base, rx, events));

        Self {
            commands,
            generation: 0,
            destroyed: false,
        }
    }
}

impl Timer for BackoffTimer {
    fn restart(&mut self) {
        if self.destroyed {
            return;
        }
        self.generation += 1;
        // A closed command channel means the consumer is gone; nothing to arm
        let _ = self.commands.send(Command::Restart {
            generation: self.generation,
        });
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let _ = self.commands.send(Command::Destroy);
    }

    fn is_current(&self, elapsed: &Elapsed) -> bool {
        !self.destroyed && elapsed.generation == self.generation
    }
}

fn backoff_wait(base: Duration, multiplier: u32) -> Duration {
    base.saturating_mul(multiplier)
}

fn deadline(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

async fn run_timer<E>(
    base: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<Elapsed> + Send + 'static,
{
    let sleep = time::sleep_until(deadline(base));
    tokio::pin!(sleep);

    let mut armed = false;
    let mut generation = 0;
    let mut multiplier: u32 = 1;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Restart { generation: next }) => {
                    // Drops any pending countdown; the old deadline never fires
                    generation = next;
                    multiplier = 1;
                    sleep.as_mut().reset(deadline(base));
                    armed = true;
                }
                Some(Command::Destroy) | None => break,
            },
            () = &mut sleep, if armed => {
                let waited = backoff_wait(base, multiplier);
                trace!("Timer generation {} elapsed after {:?}", generation, waited);
                if events.send(E::from(Elapsed::new(generation, waited))).is_err() {
                    break;
                }

                multiplier = multiplier.saturating_mul(2).min(MAX_BACKOFF_MULTIPLIER);
                sleep.as_mut().reset(deadline(backoff_wait(base, multiplier)));
            }
        }
    }
}
