use anyhow::bail;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::frame::{Direction, FLOW_CONTROL_OPCODE};

/// One registered command: an opcode plus fixed-size request and response storage
///  and the validation logic for both directions. Commands have a fixed transfer
///  size per direction, like the C structs they mirror on the embedded side -
///  `encode` validates the outgoing content and returns that size, `decode`
///  validates the incoming content against the exact declared size.
pub trait CommandSpec: Send + Sync + 'static {
    fn opcode(&self) -> u8;

    /// Transfer size of this command in the given direction. This is both the
    ///  buffer capacity and the exact number of bytes on the wire.
    fn capacity(&self, dir: Direction) -> usize;

    fn buffer(&self, dir: Direction) -> &[u8];

    fn buffer_mut(&mut self, dir: Direction) -> &mut [u8];

    /// Validate the outgoing content for `dir` and return the byte length to send.
    fn encode(&mut self, dir: Direction) -> anyhow::Result<usize>;

    /// Validate incoming content of `size` bytes for `dir`.
    fn decode(&mut self, dir: Direction, size: usize) -> anyhow::Result<()>;
}

/// Completion notification seam: fires once per fully reassembled, validated
///  command, never for partial or corrupt data.
#[cfg_attr(test, automock)]
pub trait CommandListener: Send + Sync + 'static {
    fn on_command(&self, opcode: u8, dir: Direction);
}

/// Send seam used by the requester/responder state machines: attempt to enqueue
///  the registered command's content for `dir`, returning whether the link
///  accepted it now. Never blocks.
#[cfg_attr(test, automock)]
pub trait CommandPort {
    fn try_send(&mut self, opcode: u8, dir: Direction) -> bool;
}

/// The set of registered commands, keyed by opcode. Built once at start-up;
///  registering two commands under the same opcode is a programming error and
///  fails loudly.
pub struct CommandRegistry {
    commands: FxHashMap<u8, Box<dyn CommandSpec>>,
}

impl CommandRegistry {
    pub fn new() -> CommandRegistry {
        CommandRegistry {
            commands: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, command: Box<dyn CommandSpec>) -> anyhow::Result<()> {
        let opcode = command.opcode();
        if opcode == FLOW_CONTROL_OPCODE {
            bail!("opcode {} is reserved for flow control", FLOW_CONTROL_OPCODE);
        }
        if self.commands.contains_key(&opcode) {
            bail!("duplicate registration for opcode {}", opcode);
        }
        debug!("registering command for opcode {}", opcode);
        self.commands.insert(opcode, command);
        Ok(())
    }

    pub fn contains(&self, opcode: u8) -> bool {
        self.commands.contains_key(&opcode)
    }

    fn get(&self, opcode: u8) -> anyhow::Result<&dyn CommandSpec> {
        match self.commands.get(&opcode) {
            Some(command) => Ok(command.as_ref()),
            None => bail!("no command registered for opcode {}", opcode),
        }
    }

    fn get_mut(&mut self, opcode: u8) -> anyhow::Result<&mut Box<dyn CommandSpec>> {
        match self.commands.get_mut(&opcode) {
            Some(command) => Ok(command),
            None => bail!("no command registered for opcode {}", opcode),
        }
    }

    pub fn capacity(&self, opcode: u8, dir: Direction) -> anyhow::Result<usize> {
        Ok(self.get(opcode)?.capacity(dir))
    }

    pub fn buffer(&self, opcode: u8, dir: Direction) -> anyhow::Result<&[u8]> {
        Ok(self.get(opcode)?.buffer(dir))
    }

    pub fn buffer_mut(&mut self, opcode: u8, dir: Direction) -> anyhow::Result<&mut [u8]> {
        Ok(self.get_mut(opcode)?.buffer_mut(dir))
    }

    pub fn encode(&mut self, opcode: u8, dir: Direction) -> anyhow::Result<usize> {
        self.get_mut(opcode)?.encode(dir)
    }

    pub fn decode(&mut self, opcode: u8, dir: Direction, size: usize) -> anyhow::Result<()> {
        self.get_mut(opcode)?.decode(dir, size)
    }
}

/// Generic fixed-size byte envelope: a command whose request and response are
///  opaque byte blocks of a fixed size each. Application commands with real
///  payload semantics implement `CommandSpec` themselves.
pub struct ByteCommand {
    opcode: u8,
    request: Vec<u8>,
    response: Vec<u8>,
}

impl ByteCommand {
    pub fn new(opcode: u8, request_size: usize, response_size: usize) -> ByteCommand {
        ByteCommand {
            opcode,
            request: vec![0; request_size],
            response: vec![0; response_size],
        }
    }
}

impl CommandSpec for ByteCommand {
    fn opcode(&self) -> u8 {
        self.opcode
    }

    fn capacity(&self, dir: Direction) -> usize {
        match dir {
            Direction::Request => self.request.len(),
            Direction::Response => self.response.len(),
        }
    }

    fn buffer(&self, dir: Direction) -> &[u8] {
        match dir {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }

    fn buffer_mut(&mut self, dir: Direction) -> &mut [u8] {
        match dir {
            Direction::Request => &mut self.request,
            Direction::Response => &mut self.response,
        }
    }

    fn encode(&mut self, dir: Direction) -> anyhow::Result<usize> {
        Ok(self.capacity(dir))
    }

    fn decode(&mut self, dir: Direction, size: usize) -> anyhow::Result<()> {
        if size != self.capacity(dir) {
            bail!("opcode {}: decoded {} bytes, expected exactly {}", self.opcode, size, self.capacity(dir));
        }
        Ok(())
    }
}
