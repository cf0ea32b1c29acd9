use anyhow::bail;

/// Static configuration for one link. Created once at start-up; nothing in here
///  changes at run time.
pub struct LinkConfig {
    /// Number of frame slots in each of the two pools (transmit and receive).
    ///  This bounds both the transmit backlog and the receive window; a
    ///  multi-fragment message longer than `slot_count` frames can never be
    ///  enqueued.
    pub slot_count: usize,

    /// Number of *consecutive* corruption events after which the peer is presumed
    ///  dead or rebooted and the total-reset hook fires instead of another retry.
    pub corruption_reset_threshold: u32,
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.slot_count < 2 {
            bail!("slot count {} is too small for a fragmented message", self.slot_count);
        }
        if self.corruption_reset_threshold == 0 {
            bail!("corruption reset threshold must be at least 1");
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            slot_count: 10,
            corruption_reset_threshold: 8,
        }
    }
}

/// Timeouts for one requester or responder session, in ticks of the driving poll.
pub struct SessionConfig {
    /// Retry interval while the link keeps rejecting the send (transmit pool
    ///  exhausted).
    pub retry_timeout: u64,

    /// Caller-supplied interval after which an unanswered request is sent again.
    ///  Only the requester uses this.
    pub request_timeout: u64,
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_timeout == 0 || self.request_timeout == 0 {
            bail!("session timeouts must be at least one tick");
        }
        Ok(())
    }
}
