//! Communication abstraction for the process groups pario runs on.
//!
//! Everything above this module speaks to an object-safe [`Comm`] trait:
//! tagged point-to-point messages, receive-from-any (for the async
//! dispatch loop), subgroup creation, and a barrier. Three backends:
//!
//! - [`NoComm`]: single rank, for serial use and unit tests.
//! - [`local::LocalWorld`] / [`local::LocalComm`]: in-process mailboxes;
//!   N ranks map to N threads. Integration tests run on this.
//! - `MpiComm`: real MPI via the `mpi` crate (`mpi-support` feature).
//!
//! Wire conventions: payloads are opaque byte vectors; all higher-level
//! framing lives in [`crate::wire`]. Within one `(sender, receiver, tag)`
//! triple message order is preserved; posting two receives for the same
//! triple concurrently is not supported.

pub mod collective;
pub mod local;
#[cfg(feature = "mpi-support")]
pub mod mpi;

use std::sync::Arc;

use crate::error::{PioError, Result};

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    /// Create a new tag from a raw `u16`.
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    /// Return the underlying `u16` value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Safely offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Tags reserved by the library itself.
pub mod tags {
    use super::CommTag;

    /// Async control channel (function-code messages).
    pub const MSG: CommTag = CommTag::new(0x0100);
    /// Async argument broadcast from the compute master.
    pub const ARGS: CommTag = CommTag::new(0x0110);
    /// Rearranger plan construction.
    pub const PLAN: CommTag = CommTag::new(0x0200);
    /// Data exchange (compute -> IO); handshake on `.offset(1)`.
    pub const DATA_C2I: CommTag = CommTag::new(0x0300);
    /// Data exchange (IO -> compute); handshake on `.offset(1)`.
    pub const DATA_I2C: CommTag = CommTag::new(0x0310);
    /// Serial-backend write/read funnel.
    pub const FUNNEL: CommTag = CommTag::new(0x0400);
    /// Generic collectives (bcast/reduce/gather helpers).
    pub const COLL: CommTag = CommTag::new(0x0500);
    /// Subgroup-creation context agreement.
    pub const SPLIT: CommTag = CommTag::new(0x0600);
    /// Dissemination barrier rounds start here.
    pub const BARRIER: CommTag = CommTag::new(0xFF00);
}

/// An in-flight send or receive.
///
/// Backends implement this; callers go through [`Request`].
pub trait Pending: Send {
    /// Non-blocking completion test.
    fn test(&mut self) -> bool;
    /// Block until complete.
    fn wait(&mut self) -> Result<()>;
    /// Take the received payload (receives only; `None` for sends).
    fn take_payload(&mut self) -> Option<Vec<u8>>;
    /// Sender rank, known once a receive has completed.
    fn source(&self) -> Option<usize>;
}

/// Handle to an in-flight operation.
pub struct Request(Box<dyn Pending>);

impl Request {
    pub fn new(p: Box<dyn Pending>) -> Self {
        Self(p)
    }

    /// Non-blocking completion test.
    pub fn test(&mut self) -> bool {
        self.0.test()
    }

    /// Block until complete; returns the payload for receives.
    pub fn wait(mut self) -> Result<Option<Vec<u8>>> {
        self.0.wait()?;
        Ok(self.0.take_payload())
    }

    /// Block until complete; returns `(source, payload)`. Only meaningful
    /// for receives posted with [`Comm::irecv_any`].
    pub fn wait_with_source(mut self) -> Result<(usize, Vec<u8>)> {
        self.0.wait()?;
        let src = self
            .0
            .source()
            .ok_or_else(|| PioError::Comm("completed receive has no source".into()))?;
        let payload = self.0.take_payload().unwrap_or_default();
        Ok((src, payload))
    }

    /// Take the payload after [`test`](Self::test) returned true.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        debug_assert!(self.0.test(), "finish() on an incomplete request");
        self.0.take_payload()
    }
}

/// Object-safe communicator over an ordered set of ranks.
///
/// All ranks of a communicator must call its collective operations
/// ([`split`](Comm::split), [`dup`](Comm::dup), [`barrier`](Comm::barrier),
/// and everything in [`collective`]) in the same order.
pub trait Comm: Send + Sync {
    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Start a tagged send of `buf` to `peer`.
    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Result<Request>;

    /// Start a tagged receive from `peer`.
    fn irecv(&self, peer: usize, tag: CommTag) -> Result<Request>;

    /// Start a tagged receive matching any sender.
    fn irecv_any(&self, tag: CommTag) -> Result<Request>;

    /// Collectively create sub-communicators. Every rank of `self` must
    /// call. Members of a group pass the same `color` and the group's
    /// member ranks in new-rank order; non-members pass `None` (their
    /// `ranks` is ignored). Groups with distinct colors must be disjoint.
    /// Members get `Some`, non-members `None`.
    fn split(&self, color: Option<usize>, ranks: &[usize]) -> Result<Option<Arc<dyn Comm>>>;

    /// Collectively duplicate this communicator so the copy's traffic
    /// cannot match messages of the original.
    fn dup(&self) -> Result<Arc<dyn Comm>>;

    /// Blocking send.
    fn send(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Result<()> {
        self.isend(peer, tag, buf)?.wait().map(|_| ())
    }

    /// Blocking receive.
    fn recv(&self, peer: usize, tag: CommTag) -> Result<Vec<u8>> {
        Ok(self.irecv(peer, tag)?.wait()?.unwrap_or_default())
    }

    /// Blocking receive from any sender; returns `(source, payload)`.
    fn recv_any(&self, tag: CommTag) -> Result<(usize, Vec<u8>)> {
        self.irecv_any(tag)?.wait_with_source()
    }

    /// Dissemination barrier built from point-to-point messages; backends
    /// with a native barrier override this.
    fn barrier(&self) -> Result<()> {
        let n = self.size();
        let r = self.rank();
        let mut k = 0u16;
        let mut step = 1usize;
        while step < n {
            let to = (r + step) % n;
            let from = (r + n - step) % n;
            let tag = tags::BARRIER.offset(k);
            let rx = self.irecv(from, tag)?;
            self.send(to, tag, &[])?;
            rx.wait()?;
            step <<= 1;
            k += 1;
        }
        Ok(())
    }
}

/// Single-rank no-op communicator for serial runs and unit tests.
///
/// Self-sends are buffered, and receives match lazily, so the usual
/// post-receives-then-send patterns work loopback.
#[derive(Default)]
pub struct NoComm {
    queue: Arc<std::sync::Mutex<std::collections::VecDeque<(u16, Vec<u8>)>>>,
}

impl NoComm {
    pub fn new() -> Arc<dyn Comm> {
        Arc::new(NoComm::default())
    }
}

struct Ready(Option<Vec<u8>>, Option<usize>);

impl Pending for Ready {
    fn test(&mut self) -> bool {
        true
    }
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
    fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.0.take()
    }
    fn source(&self) -> Option<usize> {
        self.1
    }
}

struct LoopbackRecv {
    queue: Arc<std::sync::Mutex<std::collections::VecDeque<(u16, Vec<u8>)>>>,
    tag: u16,
    got: Option<Vec<u8>>,
}

impl LoopbackRecv {
    fn try_match(&mut self) -> bool {
        if self.got.is_some() {
            return true;
        }
        let mut q = self.queue.lock().expect("NoComm queue poisoned");
        if let Some(i) = q.iter().position(|(t, _)| *t == self.tag) {
            self.got = q.remove(i).map(|(_, p)| p);
            true
        } else {
            false
        }
    }
}

impl Pending for LoopbackRecv {
    fn test(&mut self) -> bool {
        self.try_match()
    }

    fn wait(&mut self) -> Result<()> {
        // Single rank: the matching send must already be buffered, or it
        // never will be.
        if self.try_match() {
            Ok(())
        } else {
            Err(PioError::Comm("NoComm receive with no matching buffered send".into()))
        }
    }

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.got.take()
    }

    fn source(&self) -> Option<usize> {
        self.got.as_ref().map(|_| 0)
    }
}

impl Comm for NoComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Result<Request> {
        if peer != 0 {
            return Err(PioError::Comm(format!("NoComm has no rank {peer}")));
        }
        self.queue.lock().unwrap().push_back((tag.as_u16(), buf.to_vec()));
        Ok(Request::new(Box::new(Ready(None, None))))
    }

    fn irecv(&self, peer: usize, tag: CommTag) -> Result<Request> {
        if peer != 0 {
            return Err(PioError::Comm(format!("NoComm has no rank {peer}")));
        }
        self.irecv_any(tag)
    }

    fn irecv_any(&self, tag: CommTag) -> Result<Request> {
        Ok(Request::new(Box::new(LoopbackRecv {
            queue: self.queue.clone(),
            tag: tag.as_u16(),
            got: None,
        })))
    }

    fn split(&self, color: Option<usize>, ranks: &[usize]) -> Result<Option<Arc<dyn Comm>>> {
        if color.is_some() && ranks == [0] {
            Ok(Some(NoComm::new()))
        } else {
            Ok(None)
        }
    }

    fn dup(&self) -> Result<Arc<dyn Comm>> {
        Ok(NoComm::new())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commtag_offset_wraps() {
        let t = CommTag::new(u16::MAX);
        assert_eq!(t.offset(1).as_u16(), 0);
    }

    #[test]
    fn nocomm_loopback() {
        let c = NoComm::new();
        c.send(0, CommTag::new(7), &[1, 2, 3]).unwrap();
        assert_eq!(c.recv(0, CommTag::new(7)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn nocomm_recv_without_send_fails() {
        let c = NoComm::new();
        assert!(c.recv(0, CommTag::new(9)).is_err());
    }
}
