use std::fmt;

use crate::Result;

/// Identifies a registration with the [super::Dispatcher]. A transport registers once when it is
/// opened and uses the same token for every native operation it submits afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(pub(crate) usize);

/// Identifies one native submission. The upper half carries the [IoToken], the lower half a
/// sequence number unique to the submission, so a cancellation aimed at one submission can never
/// hit a later one issued under the same token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoId(pub(crate) u64);

impl IoId {
    pub(crate) fn new(token: IoToken, seq: u32) -> IoId {
        IoId(((token.0 as u64) << 32) | seq as u64)
    }

    /// The registration this submission belongs to.
    pub fn token(&self) -> IoToken {
        IoToken((self.0 >> 32) as usize)
    }

    pub(crate) fn user_data(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for IoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoId({}:{})", self.0 >> 32, self.0 as u32)
    }
}

/// Implemented by anything that registers with the [super::Dispatcher] to be told when its
/// native submissions finish. `complete` is invoked on the dispatcher thread, with the native
/// result already translated into a byte count or a portable [crate::Error].
pub trait Completion: Send + Sync {
    fn complete(&self, id: IoId, result: Result<usize>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_packing() {
        let id = IoId::new(IoToken(7), 42);
        assert_eq!(id.token(), IoToken(7));
        assert_eq!(id.user_data() as u32, 42);
        assert_ne!(id, IoId::new(IoToken(7), 43));
        assert_ne!(id, IoId::new(IoToken(8), 42));
    }
}
