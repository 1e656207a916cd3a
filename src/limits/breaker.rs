use crate::error::PipelineError;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Externally visible breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitState {
    phase: CircuitPhase,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    /// At most one caller may hold the half-open probe at a time.
    probe_in_flight: bool,
}

/// Evidence that `check` admitted this call. Report the outcome through
/// `record_success` or `record_failure`; a probe permit dropped without a
/// report (the caller was cancelled mid-call) counts as a failed probe, so
/// the half-open slot is always released.
#[must_use = "report the call outcome back to the breaker"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl CallPermit<'_> {
    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.settle_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.reported = true;
        self.breaker.settle_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.probe {
            self.breaker.settle_failure(true);
        }
    }
}

/// Circuit breaker guarding the AI backend.
///
/// Closed → Open after `failure_threshold` consecutive failures; Open →
/// HalfOpen once the cooldown elapses; a successful probe closes the
/// circuit and resets everything, a failed probe re-opens it with the
/// cooldown doubled up to `cooldown_cap`. Every transition happens under
/// one lock, which is never held across an await point.
pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    failure_threshold: u32,
    base_cooldown: Duration,
    cooldown_cap: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, base_cooldown: Duration, cooldown_cap: Duration) -> Self {
        Self {
            state: Mutex::new(CircuitState {
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown: base_cooldown,
                probe_in_flight: false,
            }),
            failure_threshold,
            base_cooldown,
            cooldown_cap,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        // Transitions never panic while holding the lock, so poisoning is
        // unreachable; recover rather than propagate if it ever happens.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask permission to make a call. Fails fast with `CircuitOpen` while
    /// the cooldown is running or another probe is in flight.
    pub fn check(&self) -> Result<CallPermit<'_>, PipelineError> {
        let mut state = self.lock();
        let permit = |probe| CallPermit {
            breaker: self,
            probe,
            reported: false,
        };
        match state.phase {
            CircuitPhase::Closed => Ok(permit(false)),
            CircuitPhase::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= state.cooldown {
                    state.phase = CircuitPhase::HalfOpen;
                    state.probe_in_flight = true;
                    tracing::info!("circuit half-open, admitting one probe");
                    Ok(permit(true))
                } else {
                    Err(PipelineError::CircuitOpen {
                        retry_after: state.cooldown - elapsed,
                    })
                }
            }
            CircuitPhase::HalfOpen => {
                if state.probe_in_flight {
                    Err(PipelineError::CircuitOpen {
                        retry_after: state.cooldown,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(permit(true))
                }
            }
        }
    }

    fn settle_success(&self, probe: bool) {
        let mut state = self.lock();
        if probe {
            tracing::info!("circuit probe succeeded, closing");
            state.phase = CircuitPhase::Closed;
            state.probe_in_flight = false;
            state.opened_at = None;
            state.cooldown = self.base_cooldown;
        }
        state.consecutive_failures = 0;
    }

    fn settle_failure(&self, probe: bool) {
        let mut state = self.lock();
        if probe {
            // Failed probe: back to open with a longer cooldown.
            state.probe_in_flight = false;
            state.phase = CircuitPhase::Open;
            state.opened_at = Some(Instant::now());
            state.cooldown = (state.cooldown * 2).min(self.cooldown_cap);
            tracing::warn!(cooldown_secs = state.cooldown.as_secs(), "circuit probe failed, re-opening");
            return;
        }
        state.consecutive_failures += 1;
        if state.phase == CircuitPhase::Closed
            && state.consecutive_failures >= self.failure_threshold
        {
            state.phase = CircuitPhase::Open;
            state.opened_at = Some(Instant::now());
            state.cooldown = self.base_cooldown;
            tracing::warn!(
                failures = state.consecutive_failures,
                "circuit opened after consecutive failures"
            );
        }
    }

    pub fn phase(&self) -> CircuitPhase {
        self.lock().phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(30), Duration::from_secs(240))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.check().unwrap().record_failure();
        }
        assert_eq!(breaker.phase(), CircuitPhase::Closed);

        breaker.check().unwrap().record_failure();
        assert_eq!(breaker.phase(), CircuitPhase::Open);

        assert!(matches!(
            breaker.check(),
            Err(PipelineError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_counter() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.check().unwrap().record_failure();
        }
        breaker.check().unwrap().record_success();

        // Two more failures should not trip a threshold of three.
        for _ in 0..2 {
            breaker.check().unwrap().record_failure();
        }
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_probe() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.check().unwrap().record_failure();
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        let probe = breaker.check().expect("cooldown elapsed, probe admitted");
        assert_eq!(breaker.phase(), CircuitPhase::HalfOpen);
        // A second caller while the probe is out gets fast-failed.
        assert!(matches!(
            breaker.check(),
            Err(PipelineError::CircuitOpen { .. })
        ));

        probe.record_success();
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
        breaker.check().expect("closed again");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_doubles_the_cooldown() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.check().unwrap().record_failure();
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = breaker.check().unwrap();
        probe.record_failure();
        assert_eq!(breaker.phase(), CircuitPhase::Open);

        // The original 30s cooldown is no longer enough.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            breaker.check(),
            Err(PipelineError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = breaker.check().expect("doubled cooldown elapsed");
        probe.record_success();
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_permit_releases_the_half_open_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.check().unwrap().record_failure();
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = breaker.check().expect("cooldown elapsed, probe admitted");
        // Caller cancelled before reporting back.
        drop(probe);

        // The unreported probe re-opens the circuit with a doubled cooldown
        // instead of occupying the half-open slot forever.
        assert_eq!(breaker.phase(), CircuitPhase::Open);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            breaker.check(),
            Err(PipelineError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = breaker.check().expect("next probe still admitted");
        probe.record_success();
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.check().unwrap().record_failure();
        }
        let started = std::time::Instant::now();
        for _ in 0..100 {
            let _ = breaker.check();
        }
        // No I/O, no sleeping: rejection is effectively instantaneous.
        assert!(started.elapsed() < Duration::from_millis(10));
    }
}
