use anyhow::bail;
use tracing::{debug, trace};

use crate::frame::{Direction, Frame, MAX_PAYLOAD_LEN};
use crate::registry::CommandRegistry;

/// Split a message into frames of at most [MAX_PAYLOAD_LEN] payload bytes each,
///  handing every frame to `on_frame` in order. All frames except the last carry
///  the 'more' flag. An empty message still produces one (empty) frame.
///
/// The first `on_frame` error aborts the split; the caller is responsible for
///  not committing a partially split message.
pub fn split(opcode: u8, dir: Direction, payload: &[u8], mut on_frame: impl FnMut(Frame) -> anyhow::Result<()>) -> anyhow::Result<()> {
    let mut rest = payload;
    loop {
        let chunk_len = rest.len().min(MAX_PAYLOAD_LEN);
        let (chunk, tail) = rest.split_at(chunk_len);
        rest = tail;

        let mut frame = Frame::new(opcode, dir, chunk)?;
        frame.set_more(!rest.is_empty());
        on_frame(frame)?;

        if rest.is_empty() {
            return Ok(());
        }
    }
}

/// Reassembly state for the one message currently in flight. The link delivers
///  frames strictly in order, so a single cursor is all that is needed.
struct Context {
    opcode: u8,
    dir: Direction,
    cursor: usize,
    declared_size: usize,
}

/// Receive-side counterpart of [split]: collects consecutive fragments into the
///  registered command's buffer and runs the command's own `decode` validation
///  once the final fragment has arrived.
///
/// At most one message is in flight per link, so the reassembler holds at most
///  one context. Anything that does not fit the current context is bad content
///  and must reset the link.
pub struct Reassembler {
    context: Option<Context>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler { context: None }
    }

    pub fn is_idle(&self) -> bool {
        self.context.is_none()
    }

    /// Drop any partial message. Called on every link reset so that stale
    ///  fragments can never be combined with post-reset ones.
    pub fn reset(&mut self) {
        if let Some(context) = self.context.take() {
            debug!("discarding partial message for opcode {} at {} of {} bytes", context.opcode, context.cursor, context.declared_size);
        }
    }

    /// Feed one accepted frame. Returns the completed `(opcode, dir)` once the
    ///  final fragment of a message has been decoded, `None` while a message is
    ///  still incomplete. Any error drops the partial message; the caller treats
    ///  it as bad content and resets the link.
    pub fn reassemble(&mut self, frame: &Frame, registry: &mut CommandRegistry) -> anyhow::Result<Option<(u8, Direction)>> {
        let result = self.do_reassemble(frame, registry);
        if result.is_err() {
            self.context = None;
        }
        result
    }

    fn do_reassemble(&mut self, frame: &Frame, registry: &mut CommandRegistry) -> anyhow::Result<Option<(u8, Direction)>> {
        let opcode = frame.opcode();
        let dir = frame.dir();

        match &self.context {
            None => {
                if !registry.contains(opcode) {
                    bail!("frame for unregistered opcode {}", opcode);
                }
                let declared_size = registry.capacity(opcode, dir)?;
                trace!("starting reassembly for opcode {} ({}), {} bytes", opcode, dir as u8, declared_size);
                self.context = Some(Context {
                    opcode,
                    dir,
                    cursor: 0,
                    declared_size,
                });
            }
            Some(context) => {
                if context.opcode != opcode || context.dir != dir {
                    bail!("fragment for opcode {} interleaved into message for opcode {}", opcode, context.opcode);
                }
            }
        }
        let context = self.context.as_mut()
            .expect("context was just set or checked");

        if context.cursor + frame.length() > context.declared_size {
            bail!("fragment overruns the declared size: {} + {} > {}", context.cursor, frame.length(), context.declared_size);
        }
        registry.buffer_mut(opcode, dir)?[context.cursor..context.cursor + frame.length()]
            .copy_from_slice(frame.payload());
        context.cursor += frame.length();

        if frame.more() {
            return Ok(None);
        }

        let cursor = context.cursor;
        let declared_size = context.declared_size;
        self.context = None;
        if cursor != declared_size {
            bail!("message for opcode {} ended at {} of {} declared bytes", opcode, cursor, declared_size);
        }
        registry.decode(opcode, dir, cursor)?;
        Ok(Some((opcode, dir)))
    }
}
