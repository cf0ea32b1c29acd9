use std::fmt::{Display, Formatter};
use std::ops::Add;

/// Monotonic tick counter used for all protocol timeouts. The driver provides the
///  actual tick source; the protocol only ever compares and subtracts ticks.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Tick(u64);

impl Display for Tick {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Tick {
    pub const ZERO: Tick = Tick(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// Ticks elapsed since `earlier`, saturating at 0 if the caller hands in a
    ///  later tick.
    pub fn since(&self, earlier: Tick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<u64> for Tick {
    type Output = Tick;

    fn add(self, rhs: u64) -> Tick {
        Tick(self.0 + rhs)
    }
}
