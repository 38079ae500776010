//! Count-window circuit breaker guarding the database write path.
//!
//! Closed → Open when the failure share of the last `window_size` calls
//! reaches `failure_rate_threshold` (evaluated once `minimum_calls` outcomes
//! exist). Open → HalfOpen after `open_duration_ms`; HalfOpen admits
//! `half_open_calls` trial calls and closes only if every one succeeds.
//!
//! The point is to convert a stream of slow failures into a fast refusal the
//! ingest path can turn into backpressure.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tcap_config::CircuitSettings;

#[derive(Debug)]
enum State {
    Closed { outcomes: VecDeque<bool> }, // true = failure
    Open { until: Instant },
    HalfOpen { admitted: u32, succeeded: u32 },
}

pub struct CircuitBreaker {
    settings: CircuitSettings,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitSettings) -> Self {
        CircuitBreaker {
            settings,
            state: Mutex::new(State::Closed {
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// May a call proceed right now? Half-open admission is counted here, so
    /// callers must report an outcome for every admitted call.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if Instant::now() < *until {
                    false
                } else {
                    *state = State::HalfOpen {
                        admitted: 1,
                        succeeded: 0,
                    };
                    true
                }
            }
            State::HalfOpen { admitted, .. } => {
                if *admitted < self.settings.half_open_calls {
                    *admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed { outcomes } => {
                push_outcome(outcomes, false, self.settings.window_size);
            }
            State::HalfOpen { succeeded, .. } => {
                *succeeded += 1;
                if *succeeded >= self.settings.half_open_calls {
                    *state = State::Closed {
                        outcomes: VecDeque::new(),
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed { outcomes } => {
                push_outcome(outcomes, true, self.settings.window_size);
                if outcomes.len() as u32 >= self.settings.minimum_calls {
                    let failures = outcomes.iter().filter(|f| **f).count() as f64;
                    if failures / outcomes.len() as f64 >= self.settings.failure_rate_threshold {
                        *state = self.open_state();
                    }
                }
            }
            // One failed trial re-opens immediately.
            State::HalfOpen { .. } => *state = self.open_state(),
            State::Open { .. } => {}
        }
    }

    fn open_state(&self) -> State {
        State::Open {
            until: Instant::now() + Duration::from_millis(self.settings.open_duration_ms),
        }
    }
}

fn push_outcome(outcomes: &mut VecDeque<bool>, failure: bool, window: u32) {
    outcomes.push_back(failure);
    while outcomes.len() as u32 > window {
        outcomes.pop_front();
    }
}
