//! Real MPI backend for [`Comm`], enabled by the `mpi-support` feature.
//!
//! Sends keep ownership of a leaked boxed buffer until completion so the
//! request can outlive the caller's borrow; receives use matched probes so
//! the payload size never has to be agreed on out of band.

use core::ptr::NonNull;
use std::sync::Arc;

use mpi::environment::Universe;
use mpi::point_to_point::{Destination, Message, Source};
use mpi::topology::{Color, Communicator as _, SimpleCommunicator};
use mpi::traits::Equivalence;

use crate::comm::{Comm, CommTag, Pending, Request};
use crate::error::{PioError, Result};

/// MPI-backed communicator.
pub struct MpiComm {
    _universe: Option<Arc<Universe>>,
    comm: Arc<SimpleCommunicator>,
    rank: usize,
    size: usize,
}

unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl MpiComm {
    /// Initialize MPI and wrap `MPI_COMM_WORLD`.
    pub fn world() -> Result<Arc<dyn Comm>> {
        let universe = mpi::initialize()
            .ok_or_else(|| PioError::Comm("MPI initialization failed".into()))?;
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        Ok(Arc::new(MpiComm {
            _universe: Some(Arc::new(universe)),
            comm: Arc::new(world),
            rank,
            size,
        }))
    }

    fn wrap(&self, comm: SimpleCommunicator) -> Arc<dyn Comm> {
        let rank = comm.rank() as usize;
        let size = comm.size() as usize;
        Arc::new(MpiComm {
            _universe: self._universe.clone(),
            comm: Arc::new(comm),
            rank,
            size,
        })
    }
}

struct MpiSend {
    req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
    buf: Option<NonNull<[u8]>>,
}

unsafe impl Send for MpiSend {}

impl MpiSend {
    fn release(&mut self) {
        if let Some(ptr) = self.buf.take() {
            unsafe {
                drop(Box::from_raw(ptr.as_ptr()));
            }
        }
    }
}

impl Pending for MpiSend {
    fn test(&mut self) -> bool {
        match self.req.take() {
            None => true,
            Some(r) => match r.test() {
                Ok(_) => {
                    self.release();
                    true
                }
                Err(r) => {
                    self.req = Some(r);
                    false
                }
            },
        }
    }

    fn wait(&mut self) -> Result<()> {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
            self.release();
        }
        Ok(())
    }

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn source(&self) -> Option<usize> {
        None
    }
}

impl Drop for MpiSend {
    fn drop(&mut self) {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        self.release();
    }
}

/// Lazy receive: the message is pulled in with a matched probe so the
/// size is discovered at match time.
struct MpiRecv {
    comm: Arc<SimpleCommunicator>,
    peer: Option<usize>,
    tag: i32,
    got: Option<(usize, Vec<u8>)>,
}

unsafe impl Send for MpiRecv {}

impl MpiRecv {
    fn absorb(&mut self, msg: Message, status: mpi::point_to_point::Status) {
        let count = status.count(u8::equivalence()) as usize;
        let mut buf = vec![0u8; count];
        let _ = msg.matched_receive_into(&mut buf[..]);
        self.got = Some((status.source_rank() as usize, buf));
    }
}

impl Pending for MpiRecv {
    fn test(&mut self) -> bool {
        if self.got.is_some() {
            return true;
        }
        let probed = match self.peer {
            Some(p) => self
                .comm
                .process_at_rank(p as i32)
                .immediate_matched_probe_with_tag(self.tag),
            None => self.comm.any_process().immediate_matched_probe_with_tag(self.tag),
        };
        if let Some((msg, status)) = probed {
            self.absorb(msg, status);
            true
        } else {
            false
        }
    }

    fn wait(&mut self) -> Result<()> {
        if self.got.is_some() {
            return Ok(());
        }
        let (msg, status) = match self.peer {
            Some(p) => self
                .comm
                .process_at_rank(p as i32)
                .matched_probe_with_tag(self.tag),
            None => self.comm.any_process().matched_probe_with_tag(self.tag),
        };
        self.absorb(msg, status);
        Ok(())
    }

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.got.take().map(|(_, p)| p)
    }

    fn source(&self) -> Option<usize> {
        self.got.as_ref().map(|(s, _)| *s)
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Result<Request> {
        use mpi::request::StaticScope;
        let boxed = buf.to_vec().into_boxed_slice();
        let raw: *mut [u8] = Box::into_raw(boxed);
        let slice: &[u8] = unsafe { &*raw };
        let req = self
            .comm
            .process_at_rank(peer as i32)
            .immediate_send_with_tag(StaticScope, slice, tag.as_u16() as i32);
        Ok(Request::new(Box::new(MpiSend {
            req: Some(req),
            buf: Some(unsafe { NonNull::new_unchecked(raw) }),
        })))
    }

    fn irecv(&self, peer: usize, tag: CommTag) -> Result<Request> {
        Ok(Request::new(Box::new(MpiRecv {
            comm: self.comm.clone(),
            peer: Some(peer),
            tag: tag.as_u16() as i32,
            got: None,
        })))
    }

    fn irecv_any(&self, tag: CommTag) -> Result<Request> {
        Ok(Request::new(Box::new(MpiRecv {
            comm: self.comm.clone(),
            peer: None,
            tag: tag.as_u16() as i32,
            got: None,
        })))
    }

    fn split(&self, color: Option<usize>, ranks: &[usize]) -> Result<Option<Arc<dyn Comm>>> {
        let my_key = ranks.iter().position(|&r| r == self.rank);
        let mpi_color = match color {
            Some(c) => Color::with_value(c as i32),
            None => Color::undefined(),
        };
        let sub = self
            .comm
            .split_by_color_with_key(mpi_color, my_key.unwrap_or(0) as i32);
        Ok(sub.map(|c| self.wrap(c)))
    }

    fn dup(&self) -> Result<Arc<dyn Comm>> {
        Ok(self.wrap(self.comm.duplicate()))
    }

    fn barrier(&self) -> Result<()> {
        use mpi::collective::CommunicatorCollectives;
        self.comm.barrier();
        Ok(())
    }
}
