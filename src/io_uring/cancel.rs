use io_uring::{opcode, squeue};

use super::IoId;

/// User data reserved for cancellation requests, their completions carry nothing a transport
/// needs since the canceled submission reports its own completion.
pub(super) const CANCEL_USER_DATA: u64 = u64::MAX - 1;

/// A request to cancel exactly one outstanding submission.
pub(super) struct Cancel {
    target: IoId,
}

impl Cancel {
    pub(super) fn new(target: IoId) -> Cancel {
        Cancel { target }
    }

    pub(super) fn as_entry(&self) -> squeue::Entry {
        opcode::AsyncCancel::new(self.target.user_data())
            .build()
            .user_data(CANCEL_USER_DATA)
    }
}
