use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Number of seconds it takes for the decaying part of the score to halve.
pub const HALFLIFE: i64 = 60;

/// Number of seconds after which the decaying part is considered zero.
pub const LIFETIME: i64 = 1800;

const LAMBDA: f64 = std::f64::consts::LN_2 / HALFLIFE as f64;

fn decay_factor(seconds: i64) -> f64 {
    (-(seconds as f64) * LAMBDA).exp()
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ScoreState {
    last_unix: i64,
    transient: f64,
    persistent: u32,
}

impl ScoreState {
    fn int(&self, now: i64) -> u32 {
        let dt = now - self.last_unix;
        if self.transient < 1.0 || dt < 0 || LIFETIME < dt {
            return self.persistent;
        }
        self.persistent
            .saturating_add((self.transient * decay_factor(dt)) as u32)
    }

    fn increase(&mut self, persistent: u32, transient: u32, now: i64) -> u32 {
        self.persistent = self.persistent.saturating_add(persistent);
        let dt = now - self.last_unix;
        if transient > 0 {
            if LIFETIME < dt {
                self.transient = 0.0;
            } else if self.transient > 1.0 && dt > 0 {
                self.transient *= decay_factor(dt);
            }
            self.transient += f64::from(transient);
            self.last_unix = now;
        }
        self.int(now)
    }
}

/// A ban score made of a persistent part and a part that decays
/// exponentially with a half-life of [`HALFLIFE`] seconds.
///
/// Safe for concurrent use; each peer owns one.
#[derive(Debug, Default)]
pub struct DynamicBanScore {
    state: Mutex<ScoreState>,
}

impl DynamicBanScore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score.
    pub fn int(&self) -> u32 {
        self.int_at(SystemTime::now())
    }

    pub fn int_at(&self, now: SystemTime) -> u32 {
        self.lock().int(unix_seconds(now))
    }

    /// Add to both parts of the score and return the result.
    ///
    /// The decaying part is decayed to `now` before the increase is applied.
    /// With both deltas zero this is the current score.
    pub fn increase(&self, persistent: u32, transient: u32) -> u32 {
        self.increase_at(persistent, transient, SystemTime::now())
    }

    pub fn increase_at(&self, persistent: u32, transient: u32, now: SystemTime) -> u32 {
        self.lock()
            .increase(persistent, transient, unix_seconds(now))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for DynamicBanScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.lock();
        write!(
            f,
            "persistent {} + transient {} at {} = {} as of now",
            state.persistent,
            state.transient,
            state.last_unix,
            self.int()
        )
    }
}
