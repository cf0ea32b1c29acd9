//! An IPC transport-and-command protocol for two processors coupled by a raw,
//!  full-duplex, fixed-rate frame link - no native framing, reliability or
//!  addressing below this layer. One 32-byte frame travels in each direction per
//!  exchange tick, always: the protocol detects a dead line by the keepalives
//!  stopping, not by a timeout on silence.
//!
//! ## Design goals
//!
//! * The two ends are asymmetric: an *initiator* that drives recovery (caching
//!   and retransmitting recent frames, escalating to a "peer presumed dead" hook)
//!   and a *responder* that only reacts
//! * The abstraction is request/response *commands*: an 8-bit opcode mapped to a
//!   registered descriptor with fixed-size request and response buffers, like the
//!   C structs on the far side of the link
//! * Messages larger than one frame payload are fragmented and reassembled; at
//!   most one fragmented message is in flight per link and direction
//! * All buffering is bounded and allocated at start-up: two fixed slot pools per
//!   link (transmit and receive); a message that does not fit the free transmit
//!   slots is rejected up front, whole-message-or-nothing, never half-committed
//! * The link drops whole frames but never reorders them, so loss detection needs
//!   only a single alternating *phase bit* per direction: a repeated phase means
//!   a retransmitted duplicate, to be suppressed; frames carry no sequence
//!   numbers
//! * Corruption is always fatal to the frame and resets the link; a completed
//!   command notification only ever fires with validated, complete data
//!
//! ## Frame layout
//!
//! All frames are 32 bytes, fixed byte order, no padding:
//!
//! ```ascii
//! 0:     magic    (1 byte, 0x7E)
//! 1:     checksum (1 byte, covers bytes 2..32)
//! 2:     opcode   (1 byte; 0 reserved for flow control)
//! 3:     bits     (more: bit 7, phase: bit 6, dir: bit 5, length: bits 0-4)
//! 4..31: payload  (28 bytes, meaningful only in [0, length))
//! ```
//!
//! The checksum treats the 30 covered bytes as 15 little-endian 16-bit words -
//!  explicitly little-endian because the two processors are different
//!  architectures and must not inherit native layout. Phase is stamped and the
//!  checksum recomputed as the very last step before a frame goes on the wire.
//!
//! ## Flow control and reset
//!
//! A link with nothing to send still emits one flow-control frame (opcode 0) per
//!  tick, carrying a 1-byte reason:
//!
//! ```ascii
//! 0: NOP          keepalive
//! 1: OVERFLOW     the receive pool ran out of slots
//! 2: CORRUPTION   a frame failed validation
//! 3: BAD_CONTENT  a reassembled message was rejected above the link
//! ```
//!
//! A non-NOP reason announces a locally detected problem; the peer resets in
//!  response without re-announcing. A self-initiated reset opens a one-frame
//!  window in which the single stale in-flight frame is dropped. The initiator
//!  keeps its last two transmitted data frames and resends them after a peer
//!  CORRUPTION announcement; once consecutive corruption events exceed a
//!  threshold it presumes the peer dead or rebooted and performs a total reset
//!  instead of retrying forever.
//!
//! ## Sessions
//!
//! On top of command dispatch sit two small retry state machines, one per role of
//!  an exchange: a [requester::Requester] sends a request and resends the
//!  byte-identical bytes if the response stays out, a [responder::Responder]
//!  builds the response once per arrived request and retries the send until the
//!  link accepts it. Both are driven by an external fixed-rate poll and never
//!  block.

pub mod config;
pub mod end_point;
pub mod flow_control;
pub mod fragment;
pub mod frame;
pub mod link;
pub mod registry;
pub mod requester;
pub mod responder;
pub mod slot_pool;
pub mod tick;
