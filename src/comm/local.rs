//! In-process mailbox communicator.
//!
//! A [`LocalWorld`] owns one mailbox per rank; each rank is driven by its
//! own thread. Sub-communicators share the mailboxes but carry a distinct
//! context id, so their traffic can never match messages of the parent.
//! This backend exists so the whole library, rearrangers and async
//! dispatch loop included, can be exercised deterministically in
//! ordinary `cargo test` runs without an MPI launcher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::comm::{tags, Comm, CommTag, Pending, Request};
use crate::error::{PioError, Result};

struct Envelope {
    ctx: u64,
    src: usize,
    tag: u16,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    q: Mutex<VecDeque<Envelope>>,
    cv: Condvar,
}

struct WorldInner {
    boxes: Vec<Mailbox>,
    next_ctx: AtomicU64,
    /// Receives posted but not yet matched, plus the high-water mark.
    /// Used by tests to check the flow-control budget.
    open_recvs: AtomicUsize,
    recv_watermark: AtomicUsize,
}

impl WorldInner {
    fn note_recv_posted(&self) {
        let n = self.open_recvs.fetch_add(1, Ordering::SeqCst) + 1;
        self.recv_watermark.fetch_max(n, Ordering::SeqCst);
    }

    fn note_recv_matched(&self) {
        self.open_recvs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared state for a set of in-process ranks.
pub struct LocalWorld {
    inner: Arc<WorldInner>,
    size: usize,
}

impl LocalWorld {
    /// Create a world of `size` ranks.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "world must have at least one rank");
        let boxes = (0..size).map(|_| Mailbox::default()).collect();
        Self {
            inner: Arc::new(WorldInner {
                boxes,
                next_ctx: AtomicU64::new(1),
                open_recvs: AtomicUsize::new(0),
                recv_watermark: AtomicUsize::new(0),
            }),
            size,
        }
    }

    /// The world communicator as seen from `rank`. Hand one to each
    /// rank's thread.
    pub fn comm(&self, rank: usize) -> Arc<dyn Comm> {
        assert!(rank < self.size);
        Arc::new(LocalComm {
            world: self.inner.clone(),
            ctx: 0,
            members: Arc::new((0..self.size).collect()),
            rank,
        })
    }

    /// High-water mark of simultaneously open receives across the world.
    pub fn recv_watermark(&self) -> usize {
        self.inner.recv_watermark.load(Ordering::SeqCst)
    }

    /// Reset the high-water mark (between test phases).
    pub fn reset_recv_watermark(&self) {
        self.inner.recv_watermark.store(0, Ordering::SeqCst);
    }
}

/// One rank's view of a (sub-)communicator in a [`LocalWorld`].
pub struct LocalComm {
    world: Arc<WorldInner>,
    ctx: u64,
    /// World ranks of the members, in communicator rank order.
    members: Arc<Vec<usize>>,
    /// This process's rank within `members`.
    rank: usize,
}

struct LocalSend;

impl Pending for LocalSend {
    fn test(&mut self) -> bool {
        true
    }
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
    fn take_payload(&mut self) -> Option<Vec<u8>> {
        None
    }
    fn source(&self) -> Option<usize> {
        None
    }
}

struct LocalRecv {
    world: Arc<WorldInner>,
    mailbox: usize,
    ctx: u64,
    tag: u16,
    /// Communicator rank to match, or `None` for any source.
    src: Option<usize>,
    got: Option<Envelope>,
}

impl LocalRecv {
    fn try_match(&mut self) -> bool {
        if self.got.is_some() {
            return true;
        }
        let mut q = self.world.boxes[self.mailbox].q.lock().expect("mailbox poisoned");
        let idx = q
            .iter()
            .position(|e| e.ctx == self.ctx && e.tag == self.tag && self.src.map_or(true, |s| e.src == s));
        if let Some(i) = idx {
            self.got = q.remove(i);
            self.world.note_recv_matched();
            true
        } else {
            false
        }
    }
}

impl Pending for LocalRecv {
    fn test(&mut self) -> bool {
        self.try_match()
    }

    fn wait(&mut self) -> Result<()> {
        if self.got.is_some() {
            return Ok(());
        }
        let mb = &self.world.boxes[self.mailbox];
        let mut q = mb.q.lock().expect("mailbox poisoned");
        loop {
            let idx = q.iter().position(|e| {
                e.ctx == self.ctx && e.tag == self.tag && self.src.map_or(true, |s| e.src == s)
            });
            if let Some(i) = idx {
                self.got = q.remove(i);
                self.world.note_recv_matched();
                return Ok(());
            }
            q = mb.cv.wait(q).expect("mailbox poisoned");
        }
    }

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.got.take().map(|e| e.payload)
    }

    fn source(&self) -> Option<usize> {
        self.got.as_ref().map(|e| e.src)
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Result<Request> {
        let target = *self
            .members
            .get(peer)
            .ok_or_else(|| PioError::Comm(format!("no rank {peer} in communicator")))?;
        let mb = &self.world.boxes[target];
        {
            let mut q = mb.q.lock().expect("mailbox poisoned");
            q.push_back(Envelope {
                ctx: self.ctx,
                src: self.rank,
                tag: tag.as_u16(),
                payload: buf.to_vec(),
            });
        }
        mb.cv.notify_all();
        Ok(Request::new(Box::new(LocalSend)))
    }

    fn irecv(&self, peer: usize, tag: CommTag) -> Result<Request> {
        if peer >= self.members.len() {
            return Err(PioError::Comm(format!("no rank {peer} in communicator")));
        }
        self.world.note_recv_posted();
        Ok(Request::new(Box::new(LocalRecv {
            world: self.world.clone(),
            mailbox: self.members[self.rank],
            ctx: self.ctx,
            tag: tag.as_u16(),
            src: Some(peer),
            got: None,
        })))
    }

    fn irecv_any(&self, tag: CommTag) -> Result<Request> {
        self.world.note_recv_posted();
        Ok(Request::new(Box::new(LocalRecv {
            world: self.world.clone(),
            mailbox: self.members[self.rank],
            ctx: self.ctx,
            tag: tag.as_u16(),
            src: None,
            got: None,
        })))
    }

    fn split(&self, color: Option<usize>, ranks: &[usize]) -> Result<Option<Arc<dyn Comm>>> {
        // Rank 0 assigns a context base for this split call and tells
        // everyone; each color offsets into its own context, so disjoint
        // groups created by one call can never match each other's traffic.
        let base = if self.rank == 0 {
            let base = self.world.next_ctx.fetch_add(1, Ordering::SeqCst);
            for peer in 1..self.size() {
                self.send(peer, tags::SPLIT, &base.to_le_bytes())?;
            }
            base
        } else {
            let raw = self.recv(0, tags::SPLIT)?;
            u64::from_le_bytes(
                raw.try_into()
                    .map_err(|_| PioError::Comm("short split context message".into()))?,
            )
        };

        let Some(color) = color else {
            return Ok(None);
        };
        let my_new_rank = ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or(PioError::Comm(format!(
                "rank {} passed color {color} but is not in its rank list",
                self.rank
            )))?;
        let members: Vec<usize> = ranks.iter().map(|&r| self.members[r]).collect();
        Ok(Some(Arc::new(LocalComm {
            world: self.world.clone(),
            ctx: (base << 20) | color as u64,
            members: Arc::new(members),
            rank: my_new_rank,
        })))
    }

    fn dup(&self) -> Result<Arc<dyn Comm>> {
        let all: Vec<usize> = (0..self.size()).collect();
        self.split(Some(0), &all)?
            .ok_or_else(|| PioError::Comm("dup lost its own rank".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_ranks<F, T>(n: usize, f: F) -> Vec<T>
    where
        F: Fn(Arc<dyn Comm>) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let world = LocalWorld::new(n);
        let f = Arc::new(f);
        let handles: Vec<_> = (0..n)
            .map(|r| {
                let comm = world.comm(r);
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn ring_pass() {
        let got = spawn_ranks(4, |comm| {
            let r = comm.rank();
            let n = comm.size();
            comm.send((r + 1) % n, CommTag::new(1), &[r as u8]).unwrap();
            comm.recv((r + n - 1) % n, CommTag::new(1)).unwrap()[0]
        });
        assert_eq!(got, vec![3, 0, 1, 2]);
    }

    #[test]
    fn pair_order_preserved() {
        let got = spawn_ranks(2, |comm| {
            if comm.rank() == 0 {
                for i in 0u8..5 {
                    comm.send(1, CommTag::new(2), &[i]).unwrap();
                }
                vec![]
            } else {
                (0..5)
                    .map(|_| comm.recv(0, CommTag::new(2)).unwrap()[0])
                    .collect()
            }
        });
        assert_eq!(got[1], vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn split_isolates_traffic() {
        let got = spawn_ranks(4, |comm| {
            let evens: Vec<usize> = vec![0, 2];
            let color = if comm.rank() % 2 == 0 { Some(0) } else { None };
            let sub = comm.split(color, &evens).unwrap();
            match sub {
                Some(sub) => {
                    // Exchange inside the sub-communicator.
                    let peer = 1 - sub.rank();
                    sub.send(peer, CommTag::new(3), &[sub.rank() as u8]).unwrap();
                    sub.recv(peer, CommTag::new(3)).unwrap()[0] as i32
                }
                None => -1,
            }
        });
        assert_eq!(got, vec![1, -1, 0, -1]);
    }

    #[test]
    fn recv_any_reports_source() {
        let got = spawn_ranks(3, |comm| {
            if comm.rank() == 0 {
                let mut seen = vec![];
                for _ in 0..2 {
                    let (src, payload) = comm.recv_any(CommTag::new(4)).unwrap();
                    seen.push((src, payload[0]));
                }
                seen.sort_unstable();
                seen
            } else {
                comm.send(0, CommTag::new(4), &[comm.rank() as u8 * 10]).unwrap();
                vec![]
            }
        });
        assert_eq!(got[0], vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn barrier_completes() {
        spawn_ranks(5, |comm| comm.barrier().unwrap());
    }
}
