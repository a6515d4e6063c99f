/// The [SendConst] construct is used to tell the compiler that we can indeed send a pointer across
/// threads. Clearly this is not normally something that you want to do, however completion
/// callbacks are dispatched onto the callback pool while the issuer keeps ownership of the
/// operation, and [crate::Aio::wait] holds the owner back until the callback has returned. Under
/// that contract the pointee outlives every pointer handed to a worker.
#[repr(transparent)]
pub(crate) struct SendConst<T>(*const T);

impl<T> SendConst<T> {
    /// Create a new [SendConst] structure around a `*const T` of some kind.
    ///
    /// # Safety
    ///
    /// The pointee must remain valid, and must not move, for as long as this structure or any
    /// pointer taken out of it is alive. It is on the caller to ensure this.
    pub(crate) unsafe fn new(val: *const T) -> SendConst<T> {
        SendConst(val)
    }

    /// Return the inner pointer for use.
    pub(crate) fn to_ptr(&self) -> *const T {
        self.0
    }
}

// SAFETY: Only pointers to pinned, shareable values are ever wrapped, see SendConst::new.
unsafe impl<T: Sync> Send for SendConst<T> {}
