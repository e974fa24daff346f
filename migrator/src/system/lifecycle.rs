// Service lifecycle controller
//
// stop/start block the caller (async sleep between polls) until the service reaches the target
// state or the poll budget runs out. Poll budget = timeout / interval; poll k is taken after k
// intervals, so a service that settles after N intervals succeeds iff N < budget. At half the
// budget the request is escalated once (force stop, or a repeated start request).

use log::{debug, info, warn};
use std::time::Instant;
use tokio::time::Duration;

use super::service::{ServiceControl, ServiceHandle, ServiceState};
use crate::error::MigrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Stop,
    Start,
}

impl Direction {
    fn target(self) -> ServiceState {
        match self {
            Direction::Stop => ServiceState::Stopped,
            Direction::Start => ServiceState::Running,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Direction::Stop => "stop",
            Direction::Start => "start",
        }
    }
}

pub struct ServiceLifecycleController<'a> {
    control: &'a dyn ServiceControl,
    poll_interval: Duration,
}

impl<'a> ServiceLifecycleController<'a> {
    pub fn new(control: &'a dyn ServiceControl, poll_interval: Duration) -> Self {
        Self {
            control,
            poll_interval,
        }
    }

    /// Number of polls that fit in `timeout`; never zero.
    pub fn poll_budget(&self, timeout: Duration) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let budget = timeout.as_millis() / interval;
        u32::try_from(budget).unwrap_or(u32::MAX).max(1)
    }

    pub async fn stop(&self, service: &str, timeout: Duration) -> Result<ServiceHandle, MigrationError> {
        self.drive(service, timeout, Direction::Stop).await
    }

    pub async fn start(&self, service: &str, timeout: Duration) -> Result<ServiceHandle, MigrationError> {
        self.drive(service, timeout, Direction::Start).await
    }

    async fn request(&self, service: &str, direction: Direction) {
        let result = match direction {
            Direction::Stop => self.control.request_stop(service).await,
            Direction::Start => self.control.request_start(service).await,
        };
        if let Err(e) = result {
            // The request may fail because the service is already there; polling decides.
            warn!(
                "[PHASE: service] [STEP: {}] request failed (service={}): {}",
                direction.label(),
                service,
                e
            );
        }
    }

    async fn escalate(&self, service: &str, direction: Direction) {
        info!(
            "[PHASE: service] [STEP: {}] escalating (service={})",
            direction.label(),
            service
        );
        match direction {
            Direction::Stop => {
                if let Err(e) = self.control.force_stop(service).await {
                    warn!(
                        "[PHASE: service] [STEP: stop] force stop failed (service={}): {}",
                        service, e
                    );
                }
            }
            Direction::Start => self.request(service, Direction::Start).await,
        }
    }

    async fn drive(
        &self,
        service: &str,
        timeout: Duration,
        direction: Direction,
    ) -> Result<ServiceHandle, MigrationError> {
        let started = Instant::now();
        let target = direction.target();
        let budget = self.poll_budget(timeout);
        let escalation_at = budget / 2;
        debug!(
            "[PHASE: service] [STEP: {}] entered (service={}, timeout_ms={}, interval_ms={}, budget={})",
            direction.label(),
            service,
            timeout.as_millis(),
            self.poll_interval.as_millis(),
            budget
        );

        self.request(service, direction).await;

        let mut handle = ServiceHandle::new(service);
        for poll in 0..budget {
            handle.state = match self.control.query_state(service).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "[PHASE: service] [STEP: {}] state query failed (service={}): {}",
                        direction.label(),
                        service,
                        e
                    );
                    ServiceState::Unknown
                }
            };

            if handle.state == target {
                info!(
                    "[PHASE: service] [STEP: {}] exit (service={}, state={:?}, polls={}, duration_ms={})",
                    direction.label(),
                    service,
                    handle.state,
                    poll + 1,
                    started.elapsed().as_millis()
                );
                return Ok(handle);
            }

            if poll == escalation_at && escalation_at > 0 {
                self.escalate(service, direction).await;
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        warn!(
            "[PHASE: service] [STEP: {}] timed out (service={}, last_state={:?}, duration_ms={})",
            direction.label(),
            service,
            handle.state,
            started.elapsed().as_millis()
        );
        Err(MigrationError::ServiceTimeout {
            service: service.to_string(),
            target,
            last_state: handle.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubServiceControl;

    const INTERVAL: Duration = Duration::from_millis(5);
    const TIMEOUT: Duration = Duration::from_millis(50);

    #[test]
    fn budget_is_timeout_over_interval() {
        let stub = StubServiceControl::running(0);
        let controller = ServiceLifecycleController::new(&stub, INTERVAL);
        assert_eq!(controller.poll_budget(TIMEOUT), 10);
        assert_eq!(controller.poll_budget(Duration::from_millis(1)), 1);
    }

    #[tokio::test]
    async fn stop_then_start_succeeds_below_budget() {
        for n in [0, 1, 9] {
            let stub = StubServiceControl::running(n);
            let controller = ServiceLifecycleController::new(&stub, INTERVAL);

            let stopped = controller.stop("MSSQL$COMPAC", TIMEOUT).await.expect("stop");
            assert_eq!(stopped.state, ServiceState::Stopped);
            let started = controller.start("MSSQL$COMPAC", TIMEOUT).await.expect("start");
            assert_eq!(started.state, ServiceState::Running);
        }
    }

    #[tokio::test]
    async fn stop_times_out_at_budget() {
        for n in [10, 11, 50] {
            let stub = StubServiceControl::running(n);
            let controller = ServiceLifecycleController::new(&stub, INTERVAL);
            let err = controller
                .stop("MSSQL$COMPAC", TIMEOUT)
                .await
                .expect_err("should time out");
            match err {
                MigrationError::ServiceTimeout {
                    target, last_state, ..
                } => {
                    assert_eq!(target, ServiceState::Stopped);
                    assert_eq!(last_state, ServiceState::Transitioning);
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn start_times_out_at_budget() {
        let stub = StubServiceControl::stopped(10);
        let controller = ServiceLifecycleController::new(&stub, INTERVAL);
        let err = controller.start("MSSQLSERVER", TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::ServiceTimeout {
                target: ServiceState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stuck_stop_escalates_to_force_once() {
        let stub = StubServiceControl::running(u32::MAX).with_effective_force_stop();
        let controller = ServiceLifecycleController::new(&stub, INTERVAL);
        controller.stop("MSSQL$COMPAC", TIMEOUT).await.expect("force stop should land");

        let requests = stub.requests();
        assert_eq!(requests.iter().filter(|r| *r == "force_stop").count(), 1);
        assert_eq!(requests[0], "stop");
    }

    #[tokio::test]
    async fn prompt_stop_never_escalates() {
        let stub = StubServiceControl::running(1);
        let controller = ServiceLifecycleController::new(&stub, INTERVAL);
        controller.stop("MSSQL$COMPAC", TIMEOUT).await.unwrap();
        assert_eq!(stub.requests(), vec!["stop".to_string()]);
    }
}
