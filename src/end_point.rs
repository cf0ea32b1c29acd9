use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::LinkConfig;
use crate::frame::{Direction, Frame, FRAME_LEN};
use crate::fragment::Reassembler;
use crate::link::{Link, LinkRole, ReceiveOutcome};
use crate::registry::{CommandListener, CommandPort, CommandRegistry, CommandSpec};
use crate::requester::{Requester, RequesterOwner};
use crate::responder::{Responder, ResponderOwner};
use crate::tick::Tick;

/// The physical driver seam: exchange exactly one frame in each direction per
///  tick. The link is synchronous full duplex, so sending and receiving are one
///  operation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    async fn exchange(&self, outgoing: &[u8; FRAME_LEN]) -> anyhow::Result<[u8; FRAME_LEN]>;
}

/// Fired when the peer is presumed dead after a run of consecutive corruption
///  events. The application decides what to do; the link itself just starts
///  over.
#[cfg_attr(test, automock)]
pub trait ResetHandler: Send + Sync + 'static {
    fn on_peer_presumed_dead(&self);
}

/// The protocol state an endpoint guards with one lock: the periodic tick and
///  application enqueues both mutate the link's transmit pool, so every access
///  goes through here.
struct EndPointInner {
    link: Link,
    registry: CommandRegistry,
    reassembler: Reassembler,
}

impl EndPointInner {
    fn encode_and_enqueue(&mut self, opcode: u8, dir: Direction) -> anyhow::Result<()> {
        let size = self.registry.encode(opcode, dir)?;
        let payload = self.registry.buffer(opcode, dir)?[..size].to_vec();
        self.link.enqueue(opcode, dir, &payload)
    }
}

impl CommandPort for EndPointInner {
    fn try_send(&mut self, opcode: u8, dir: Direction) -> bool {
        match self.encode_and_enqueue(opcode, dir) {
            Ok(()) => true,
            Err(e) => {
                debug!("send for opcode {} not accepted: {}", opcode, e);
                false
            }
        }
    }
}

struct EndPointShared {
    inner: RwLock<EndPointInner>,
    transport: Arc<dyn FrameTransport>,
    listener: Arc<dyn CommandListener>,
    reset_handler: Arc<dyn ResetHandler>,
}

impl EndPointShared {
    /// One full exchange tick: pick the outgoing frame, swap it against the
    ///  peer's, run the received frame through the link, and dispatch whatever
    ///  completed reassembly.
    async fn run_tick(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;

        let outgoing = inner.link.next_frame();
        let incoming = Frame::from_wire(self.transport.exchange(outgoing.as_bytes()).await?);

        match inner.link.receive(&incoming) {
            ReceiveOutcome::PeerPresumedDead => {
                error!("peer presumed dead after repeated corruption");
                inner.reassembler.reset();
                self.reset_handler.on_peer_presumed_dead();
            }
            ReceiveOutcome::Reset(reason) => {
                debug!("link reset ({:?}), dropping reassembly state", reason);
                inner.reassembler.reset();
            }
            _ => {}
        }

        let EndPointInner { link, registry, reassembler } = &mut *inner;
        while let Some(frame) = link.pop_received() {
            match reassembler.reassemble(&frame, registry) {
                Ok(None) => {}
                Ok(Some((opcode, dir))) => self.listener.on_command(opcode, dir),
                Err(e) => {
                    warn!("bad content on the link: {}", e);
                    link.reset_bad_content();
                    reassembler.reset();
                    break;
                }
            }
        }
        Ok(())
    }
}

/// One end of the link, wired to its driver: owns the link state machine, the
///  command registry and the reassembler, and drives them from a periodic tick.
pub struct EndPoint {
    shared: Arc<EndPointShared>,
    tick_loop: Option<JoinHandle<()>>,
}

impl EndPoint {
    pub fn new(
        config: Arc<LinkConfig>,
        role: LinkRole,
        transport: Arc<dyn FrameTransport>,
        listener: Arc<dyn CommandListener>,
        reset_handler: Arc<dyn ResetHandler>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        Ok(EndPoint {
            shared: Arc::new(EndPointShared {
                inner: RwLock::new(EndPointInner {
                    link: Link::new(config, role),
                    registry: CommandRegistry::new(),
                    reassembler: Reassembler::new(),
                }),
                transport,
                listener,
                reset_handler,
            }),
            tick_loop: None,
        })
    }

    pub async fn register(&self, command: Box<dyn CommandSpec>) -> anyhow::Result<()> {
        self.shared.inner.write().await.registry.register(command)
    }

    /// Queue the registered command's content for transmission: whole message or
    ///  nothing, never blocking on the link.
    pub async fn send(&self, opcode: u8, dir: Direction) -> anyhow::Result<()> {
        self.shared.inner.write().await.encode_and_enqueue(opcode, dir)
    }

    /// Access a registered command's buffer, e.g. to fill in a request before
    ///  sending or to read a completed response.
    pub async fn with_command_buffer<R>(&self, opcode: u8, dir: Direction, f: impl FnOnce(&mut [u8]) -> R) -> anyhow::Result<R> {
        let mut inner = self.shared.inner.write().await;
        Ok(f(inner.registry.buffer_mut(opcode, dir)?))
    }

    /// Drive a requester session by one tick, with this endpoint's link as its
    ///  send port.
    pub async fn poll_requester(&self, now: Tick, requester: &mut Requester, owner: &mut impl RequesterOwner) {
        let mut inner = self.shared.inner.write().await;
        requester.poll(now, owner, &mut *inner);
    }

    pub async fn poll_responder(&self, now: Tick, responder: &mut Responder, owner: &mut impl ResponderOwner) {
        let mut inner = self.shared.inner.write().await;
        responder.poll(now, owner, &mut *inner);
    }

    pub async fn run_tick(&self) -> anyhow::Result<()> {
        self.shared.run_tick().await
    }

    /// Spawn the periodic exchange loop. A failed exchange is the driver's
    ///  problem to report; the loop logs it and keeps ticking.
    pub fn spawn_tick_loop(&mut self, period: Duration) {
        let shared = Arc::clone(&self.shared);
        self.tick_loop = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = shared.run_tick().await {
                    error!("frame exchange failed: {}", e);
                }
            }
        }));
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        if let Some(handle) = &self.tick_loop {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::{flow_control_frame, FlowControlReason};
    use crate::config::SessionConfig;
    use crate::registry::{ByteCommand, MockCommandListener};
    use crate::requester::MockRequesterOwner;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn nop_bytes(phase: bool) -> [u8; FRAME_LEN] {
        let mut frame = flow_control_frame(FlowControlReason::Nop);
        frame.set_phase(phase);
        *frame.as_bytes()
    }

    fn data_bytes(opcode: u8, dir: Direction, payload: &[u8], phase: bool) -> [u8; FRAME_LEN] {
        let mut frame = Frame::new(opcode, dir, payload).unwrap();
        frame.set_phase(phase);
        *frame.as_bytes()
    }

    fn end_point(transport: MockFrameTransport, listener: MockCommandListener) -> EndPoint {
        EndPoint::new(
            Arc::new(LinkConfig::default()),
            LinkRole::Initiator,
            Arc::new(transport),
            Arc::new(listener),
            Arc::new(MockResetHandler::new()),
        ).unwrap()
    }

    #[tokio::test]
    async fn test_send_puts_the_command_on_the_wire() {
        let mut transport = MockFrameTransport::new();
        transport.expect_exchange()
            .withf(|outgoing| {
                let frame = Frame::from_wire(*outgoing);
                frame.opcode() == 10 && frame.payload() == [7, 8] && frame.dir() == Direction::Request
            })
            .times(1)
            .returning(|_| Ok(nop_bytes(false)));

        let end_point = end_point(transport, MockCommandListener::new());
        end_point.register(Box::new(ByteCommand::new(10, 2, 1))).await.unwrap();
        end_point.with_command_buffer(10, Direction::Request, |buffer| buffer.copy_from_slice(&[7, 8])).await.unwrap();

        end_point.send(10, Direction::Request).await.unwrap();
        end_point.run_tick().await.unwrap();
    }

    #[tokio::test]
    async fn test_received_command_is_dispatched_once() {
        let mut transport = MockFrameTransport::new();
        transport.expect_exchange()
            .times(1)
            .returning(|_| Ok(data_bytes(10, Direction::Request, &[1, 2, 3], false)));

        let mut listener = MockCommandListener::new();
        listener.expect_on_command().with(eq(10), eq(Direction::Request)).times(1).return_const(());

        let end_point = end_point(transport, listener);
        end_point.register(Box::new(ByteCommand::new(10, 3, 1))).await.unwrap();

        end_point.run_tick().await.unwrap();
        let received = end_point.with_command_buffer(10, Direction::Request, |buffer| buffer.to_vec()).await.unwrap();
        assert_eq!(received, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fragmented_command_is_dispatched_after_the_last_fragment() {
        let payload = (0..60).collect::<Vec<u8>>();

        let mut transport = MockFrameTransport::new();
        let mut seq = Sequence::new();
        for (i, chunk) in [&payload[..28], &payload[28..56], &payload[56..]].into_iter().enumerate() {
            let mut bytes = data_bytes(20, Direction::Request, chunk, i % 2 == 1);
            if i < 2 {
                let mut frame = Frame::from_wire(bytes);
                frame.set_more(true);
                bytes = *frame.as_bytes();
            }
            transport.expect_exchange()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(bytes));
        }

        let mut listener = MockCommandListener::new();
        listener.expect_on_command().with(eq(20), eq(Direction::Request)).times(1).return_const(());

        let end_point = end_point(transport, listener);
        end_point.register(Box::new(ByteCommand::new(20, 60, 1))).await.unwrap();

        for _ in 0..3 {
            end_point.run_tick().await.unwrap();
        }
        let received = end_point.with_command_buffer(20, Direction::Request, |buffer| buffer.to_vec()).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_bad_content_resets_and_announces() {
        let mut transport = MockFrameTransport::new();
        let mut seq = Sequence::new();
        transport.expect_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(data_bytes(99, Direction::Request, &[1], false)));
        transport.expect_exchange()
            .withf(|outgoing| {
                let frame = Frame::from_wire(*outgoing);
                frame.opcode() == 0 && frame.payload() == [FlowControlReason::BadContent as u8]
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(nop_bytes(false)));

        // nothing registered under opcode 99, so dispatch must fail and announce
        let end_point = end_point(transport, MockCommandListener::new());
        end_point.run_tick().await.unwrap();
        end_point.run_tick().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_frame_never_reaches_the_listener() {
        let mut transport = MockFrameTransport::new();
        transport.expect_exchange()
            .times(1)
            .returning(|_| {
                let mut bytes = data_bytes(10, Direction::Request, &[1, 2, 3], false);
                bytes[5] ^= 0x10;
                Ok(bytes)
            });

        let end_point = end_point(transport, MockCommandListener::new());
        end_point.register(Box::new(ByteCommand::new(10, 3, 1))).await.unwrap();
        end_point.run_tick().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_corruption_fires_the_reset_handler() {
        let mut transport = MockFrameTransport::new();
        transport.expect_exchange()
            .returning(|_| {
                let mut frame = flow_control_frame(FlowControlReason::Corruption);
                frame.set_phase(false);
                Ok(*frame.as_bytes())
            });

        let mut reset_handler = MockResetHandler::new();
        reset_handler.expect_on_peer_presumed_dead().times(1).return_const(());

        let end_point = EndPoint::new(
            Arc::new(LinkConfig { slot_count: 10, corruption_reset_threshold: 1 }),
            LinkRole::Initiator,
            Arc::new(transport),
            Arc::new(MockCommandListener::new()),
            Arc::new(reset_handler),
        ).unwrap();

        end_point.run_tick().await.unwrap();
        end_point.run_tick().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_requester_sends_through_the_registry() {
        let mut transport = MockFrameTransport::new();
        transport.expect_exchange()
            .withf(|outgoing| {
                let frame = Frame::from_wire(*outgoing);
                frame.opcode() == 10 && frame.payload() == [7, 8]
            })
            .times(1)
            .returning(|_| Ok(nop_bytes(false)));

        let end_point = end_point(transport, MockCommandListener::new());
        end_point.register(Box::new(ByteCommand::new(10, 2, 1))).await.unwrap();
        end_point.with_command_buffer(10, Direction::Request, |buffer| buffer.copy_from_slice(&[7, 8])).await.unwrap();

        let mut requester = Requester::new(Arc::new(SessionConfig { retry_timeout: 3, request_timeout: 5 }), 10);
        let mut owner = MockRequesterOwner::new();
        owner.expect_work().with(eq(true)).times(1).return_const(true);

        end_point.poll_requester(Tick::ZERO, &mut requester, &mut owner).await;
        assert_eq!(requester.state(), crate::requester::RequesterState::ResponseWait);

        end_point.run_tick().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_loop_keeps_exchanging() {
        let mut transport = MockFrameTransport::new();
        transport.expect_exchange()
            .times(3..)
            .returning(|_| Ok(nop_bytes(false)));

        let mut end_point = end_point(transport, MockCommandListener::new());
        end_point.spawn_tick_loop(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(35)).await;
    }
}
