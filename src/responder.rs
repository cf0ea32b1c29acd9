use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::config::SessionConfig;
use crate::frame::Direction;
use crate::registry::CommandPort;
use crate::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    /// A request arrived; the owner builds the response exactly once on the
    ///  next poll.
    RequestPending,
    /// The response is built but the link has not accepted it yet; retried
    ///  every retry timeout.
    Response,
}

/// The application side of a responder session. `work(false)` fires exactly
///  once per arrived request and must leave the response buffer filled in;
///  `work(true)` is the idle hook and its return value is ignored.
#[cfg_attr(test, automock)]
pub trait ResponderOwner {
    fn work(&mut self, idle: bool) -> bool;
}

/// The answering side of one command exchange: waits for a request, has the
///  owner build the response, and retries the send until the link takes it.
pub struct Responder {
    config: Arc<SessionConfig>,
    opcode: u8,
    state: ResponderState,
    last_tx: Tick,
}

impl Responder {
    pub fn new(config: Arc<SessionConfig>, opcode: u8) -> Responder {
        Responder {
            config,
            opcode,
            state: ResponderState::Idle,
            last_tx: Tick::ZERO,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn poll(&mut self, now: Tick, owner: &mut impl ResponderOwner, port: &mut impl CommandPort) {
        match self.state {
            ResponderState::Idle => {
                let _ = owner.work(true);
            }
            ResponderState::RequestPending => {
                owner.work(false);
                self.try_send(now, port);
            }
            ResponderState::Response => {
                if now.since(self.last_tx) >= self.config.retry_timeout {
                    self.try_send(now, port);
                }
            }
        }
    }

    /// The request for this session's opcode completed reassembly. A request
    ///  arriving while the previous response is still going out is the
    ///  requester's timeout firing early; the pending response answers it.
    pub fn on_request(&mut self) {
        if self.state == ResponderState::Idle {
            self.state = ResponderState::RequestPending;
        }
        else {
            debug!("request for opcode {} arrived in state {:?}, already answering", self.opcode, self.state);
        }
    }

    fn try_send(&mut self, now: Tick, port: &mut impl CommandPort) {
        self.last_tx = now;
        self.state = if port.try_send(self.opcode, Direction::Response) {
            ResponderState::Idle
        }
        else {
            ResponderState::Response
        };
    }
}
