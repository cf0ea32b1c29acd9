use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::frame::Direction;
use crate::registry::CommandPort;
use crate::tick::Tick;

/// State of one requester session. Progress only ever happens in `poll`, driven
///  by the external fixed-rate tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    /// Nothing in flight; the owner is asked every poll whether to start.
    Idle,
    /// The link rejected the send; retried every retry timeout.
    Request,
    /// The request is on its way; resent every request timeout until the
    ///  response arrives.
    ResponseWait,
    /// The response arrived; the owner is notified exactly once on the next poll.
    ResponsePending,
}

/// The application side of a requester session. `work(true)` fires every poll
///  while idle and returns whether a new request should go out (with the
///  request buffer already filled in); `work(false)` fires exactly once per
///  arrived response.
#[cfg_attr(test, automock)]
pub trait RequesterOwner {
    fn work(&mut self, idle: bool) -> bool;
}

/// Timeout/retry wrapper for the initiating side of one command exchange: sends
///  the request, waits for the response, and resends the byte-identical request
///  if the response stays out. One instance per command that needs retry.
pub struct Requester {
    config: Arc<SessionConfig>,
    opcode: u8,
    state: RequesterState,
    last_tx: Tick,
}

impl Requester {
    pub fn new(config: Arc<SessionConfig>, opcode: u8) -> Requester {
        Requester {
            config,
            opcode,
            state: RequesterState::Idle,
            last_tx: Tick::ZERO,
        }
    }

    pub fn state(&self) -> RequesterState {
        self.state
    }

    /// Drive the session by one tick.
    pub fn poll(&mut self, now: Tick, owner: &mut impl RequesterOwner, port: &mut impl CommandPort) {
        match self.state {
            RequesterState::Idle => {
                if owner.work(true) {
                    self.try_send(now, port);
                }
            }
            RequesterState::Request => {
                if now.since(self.last_tx) >= self.config.retry_timeout {
                    self.try_send(now, port);
                }
            }
            RequesterState::ResponseWait => {
                if now.since(self.last_tx) >= self.config.request_timeout {
                    debug!("request for opcode {} unanswered for {} ticks, resending", self.opcode, now.since(self.last_tx));
                    self.try_send(now, port);
                }
            }
            RequesterState::ResponsePending => {
                owner.work(false);
                self.state = RequesterState::Idle;
            }
        }
    }

    /// The response for this session's opcode completed reassembly.
    pub fn on_response(&mut self) {
        if self.state == RequesterState::ResponseWait {
            self.state = RequesterState::ResponsePending;
        }
        else {
            warn!("response for opcode {} arrived in state {:?}, ignoring", self.opcode, self.state);
        }
    }

    fn try_send(&mut self, now: Tick, port: &mut impl CommandPort) {
        self.last_tx = now;
        self.state = if port.try_send(self.opcode, Direction::Request) {
            RequesterState::ResponseWait
        }
        else {
            RequesterState::Request
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MockCommandPort;
    use mockall::predicate::eq;

    fn requester() -> Requester {
        let config = Arc::new(SessionConfig {
            retry_timeout: 3,
            request_timeout: 5,
        });
        Requester::new(config, 10)
    }

    #[test]
    fn test_idle_asks_the_owner_every_poll() {
        let mut requester = requester();
        let mut owner = MockRequesterOwner::new();
        owner.expect_work().with(eq(true)).times(2).return_const(false);
        let mut port = MockCommandPort::new();

        requester.poll(Tick::from_raw(0), &mut owner, &mut port);
        requester.poll(Tick::from_raw(1), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::Idle);
    }

    #[test]
    fn test_accepted_send_moves_to_response_wait() {
        let mut requester = requester();
        let mut owner = MockRequesterOwner::new();
        owner.expect_work().with(eq(true)).times(1).return_const(true);
        let mut port = MockCommandPort::new();
        port.expect_try_send().with(eq(10), eq(Direction::Request)).times(1).return_const(true);

        requester.poll(Tick::from_raw(0), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::ResponseWait);
    }

    #[test]
    fn test_rejected_send_retries_after_retry_timeout() {
        let mut requester = requester();
        let mut owner = MockRequesterOwner::new();
        owner.expect_work().with(eq(true)).times(1).return_const(true);
        let mut port = MockCommandPort::new();
        port.expect_try_send().with(eq(10), eq(Direction::Request)).times(1).return_const(false);

        requester.poll(Tick::from_raw(0), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::Request);

        // below the retry timeout nothing happens
        requester.poll(Tick::from_raw(2), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::Request);

        port.checkpoint();
        port.expect_try_send().with(eq(10), eq(Direction::Request)).times(1).return_const(true);
        requester.poll(Tick::from_raw(3), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::ResponseWait);
    }

    #[test]
    fn test_unanswered_request_is_resent_exactly_once_per_timeout() {
        let mut requester = requester();
        let mut owner = MockRequesterOwner::new();
        owner.expect_work().with(eq(true)).times(1).return_const(true);
        let mut port = MockCommandPort::new();
        port.expect_try_send().with(eq(10), eq(Direction::Request)).times(1).return_const(true);

        requester.poll(Tick::from_raw(0), &mut owner, &mut port);

        // quiet until the request timeout elapses
        for now in 1..5 {
            requester.poll(Tick::from_raw(now), &mut owner, &mut port);
        }
        assert_eq!(requester.state(), RequesterState::ResponseWait);

        port.checkpoint();
        port.expect_try_send().with(eq(10), eq(Direction::Request)).times(1).return_const(true);
        requester.poll(Tick::from_raw(5), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::ResponseWait);
    }

    #[test]
    fn test_rejected_resend_falls_back_to_request_state() {
        let mut requester = requester();
        let mut owner = MockRequesterOwner::new();
        owner.expect_work().with(eq(true)).times(1).return_const(true);
        let mut port = MockCommandPort::new();
        port.expect_try_send().times(1).return_const(true);

        requester.poll(Tick::from_raw(0), &mut owner, &mut port);

        port.checkpoint();
        port.expect_try_send().times(1).return_const(false);
        requester.poll(Tick::from_raw(5), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::Request);
    }

    #[test]
    fn test_response_fires_work_exactly_once() {
        let mut requester = requester();
        let mut owner = MockRequesterOwner::new();
        owner.expect_work().with(eq(true)).times(1).return_const(true);
        let mut port = MockCommandPort::new();
        port.expect_try_send().times(1).return_const(true);

        requester.poll(Tick::from_raw(0), &mut owner, &mut port);
        requester.on_response();
        assert_eq!(requester.state(), RequesterState::ResponsePending);

        owner.checkpoint();
        owner.expect_work().with(eq(false)).times(1).return_const(false);
        requester.poll(Tick::from_raw(1), &mut owner, &mut port);
        assert_eq!(requester.state(), RequesterState::Idle);

        // the next poll is a regular idle poll again
        owner.checkpoint();
        owner.expect_work().with(eq(true)).times(1).return_const(false);
        requester.poll(Tick::from_raw(2), &mut owner, &mut port);
    }

    #[test]
    fn test_unexpected_response_is_ignored() {
        let mut requester = requester();
        requester.on_response();
        assert_eq!(requester.state(), RequesterState::Idle);
    }
}
