use std::{
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use gonc_types::NcError;

type Result<T> = gonc_types::NcResult<T>;

/// Circuit breaker operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Normal operation, requests pass through.
    Closed,
    /// The service is failing, requests are rejected.
    Open,
    /// A limited number of probes test recovery.
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

type StateChangeHook = Box<dyn Fn(State, State) + Send + Sync>;

/// Configuration for [`CircuitBreaker`].
#[derive(Default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit (default 5).
    pub max_failures: u32,
    /// How long the circuit stays open before moving to half-open
    /// (default 30s).
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close (default 2).
    pub half_open_max: u32,
    /// Called on every transition, under the lock, so keep it fast.
    pub on_state_change: Option<StateChangeHook>,
}

struct Counters {
    state: State,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Prevents repeated calls to a failing service by tracking consecutive
/// failures and short-circuiting once a threshold is crossed.
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    half_open_max: u32,
    on_state_change: Option<StateChangeHook>,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            max_failures: if config.max_failures == 0 { 5 } else { config.max_failures },
            reset_timeout: if config.reset_timeout.is_zero() {
                Duration::from_secs(30)
            } else {
                config.reset_timeout
            },
            half_open_max: if config.half_open_max == 0 { 2 } else { config.half_open_max },
            on_state_change: config.on_state_change,
            counters: Mutex::new(Counters {
                state: State::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `operation` through the breaker. When the circuit is open the
    /// operation is not invoked and [`NcError::CircuitOpen`] is returned.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_request()?;
        let result = operation().await;
        self.after_request(result.is_ok());
        result
    }

    pub fn current_state(&self) -> State {
        self.counters.lock().expect("breaker lock poisoned").state
    }

    pub fn failures(&self) -> u32 {
        self.counters.lock().expect("breaker lock poisoned").failures
    }

    /// Force the breaker back to closed and zero the counters.
    pub fn reset(&self) {
        let mut c = self.counters.lock().expect("breaker lock poisoned");
        c.failures = 0;
        c.successes = 0;
        self.transition(&mut c, State::Closed);
    }

    fn before_request(&self) -> Result<()> {
        let mut c = self.counters.lock().expect("breaker lock poisoned");
        match c.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => {
                let since = c.last_failure.map(|t| t.elapsed()).unwrap_or(self.reset_timeout);
                if since > self.reset_timeout {
                    self.transition(&mut c, State::HalfOpen);
                    return Ok(());
                }
                Err(NcError::CircuitOpen {
                    failures: c.failures,
                    retry_in: self.reset_timeout - since,
                })
            }
        }
    }

    fn after_request(&self, success: bool) {
        let mut c = self.counters.lock().expect("breaker lock poisoned");
        if !success {
            c.failures += 1;
            c.successes = 0;
            c.last_failure = Some(Instant::now());
            if c.state == State::HalfOpen || c.failures >= self.max_failures {
                self.transition(&mut c, State::Open);
            }
            return;
        }

        c.successes += 1;
        match c.state {
            State::HalfOpen => {
                if c.successes >= self.half_open_max {
                    c.failures = 0;
                    self.transition(&mut c, State::Closed);
                }
            }
            State::Closed => c.failures = 0,
            State::Open => {}
        }
    }

    fn transition(&self, c: &mut Counters, to: State) {
        let from = c.state;
        if from == to {
            return;
        }
        c.state = to;
        if let Some(hook) = &self.on_state_change {
            hook(from, to);
        }
    }
}
