//! Flow-controlled sparse all-to-all used by the rearrangers.
//!
//! [`swapm`] moves one optional byte buffer per peer in each direction of
//! a communicator, honoring the flow-control options of the owning IO
//! system: an optional zero-byte handshake before each data message (the
//! receiver signals it has posted its receive, which keeps eager sends
//! from overwhelming unexpected-message buffers), blocking versus
//! non-blocking sends, and a cap on in-flight requests per direction.
//!
//! Ordering within a sender-receiver pair is preserved; global ordering
//! across pairs is not.

use std::collections::VecDeque;

use crate::comm::{Comm, CommTag, Request};
use crate::error::{PioError, Result};

/// Sentinel for "no cap on in-flight requests".
pub const UNLIMITED_PEND_REQ: i32 = -1;

/// How the rearranger moves data: flow-controlled point-to-point, or
/// everything posted at once (the collective-style schedule).
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CommType {
    /// Point-to-point with the flow-control loop.
    P2p,
    /// Post all receives and sends at once.
    Coll,
}

/// Which directions flow control applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FcDirection {
    /// Both compute-to-IO and IO-to-compute.
    Both,
    /// Compute-to-IO only.
    Comp2Io,
    /// IO-to-compute only.
    Io2Comp,
    /// Flow control disabled.
    Disabled,
}

/// Per-direction flow-control options.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FcOptions {
    /// Receiver posts a zero-byte ready message before the sender ships
    /// data.
    pub handshake: bool,
    /// Non-blocking sends; when false each data send completes before the
    /// next is started.
    pub isend: bool,
    /// Cap on outstanding requests per direction;
    /// [`UNLIMITED_PEND_REQ`] lifts the cap.
    pub max_pending: i32,
}

impl Default for FcOptions {
    fn default() -> Self {
        Self { handshake: false, isend: false, max_pending: UNLIMITED_PEND_REQ }
    }
}

/// Rearranger communication options for one IO system.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RearrOpts {
    pub comm_type: CommType,
    pub fc_dir: FcDirection,
    pub comp2io: FcOptions,
    pub io2comp: FcOptions,
}

impl Default for RearrOpts {
    fn default() -> Self {
        Self {
            comm_type: CommType::Coll,
            fc_dir: FcDirection::Disabled,
            comp2io: FcOptions::default(),
            io2comp: FcOptions::default(),
        }
    }
}

/// Direction of one rearranger exchange, from the mover's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Comp2Io,
    Io2Comp,
}

impl RearrOpts {
    /// The options actually applied to an exchange in `dir`: when flow
    /// control is disabled for that direction (or the collective schedule
    /// is selected) everything is posted at once.
    pub(crate) fn effective(&self, dir: Direction) -> FcOptions {
        let enabled = match (self.fc_dir, dir) {
            (FcDirection::Both, _) => true,
            (FcDirection::Comp2Io, Direction::Comp2Io) => true,
            (FcDirection::Io2Comp, Direction::Io2Comp) => true,
            _ => false,
        };
        if self.comm_type == CommType::Coll || !enabled {
            FcOptions { handshake: false, isend: true, max_pending: UNLIMITED_PEND_REQ }
        } else {
            match dir {
                Direction::Comp2Io => self.comp2io,
                Direction::Io2Comp => self.io2comp,
            }
        }
    }

    /// Reject out-of-range option values.
    pub(crate) fn validate(&self) -> Result<()> {
        for fc in [self.comp2io, self.io2comp] {
            if fc.max_pending < UNLIMITED_PEND_REQ || fc.max_pending == 0 {
                return Err(PioError::InvalidArg(
                    "max_pending must be positive or UNLIMITED_PEND_REQ",
                ));
            }
        }
        Ok(())
    }
}

enum SendState {
    /// Waiting for the receiver's ready message (handshake mode).
    AwaitReady { peer: usize, req: Request },
    /// Data message in flight.
    Data { req: Request },
}

/// Exchange `sends[p]` with every peer `p`, expecting `recv_sizes[p]`
/// bytes back from peers where that entry is `Some`. Self-transfers are
/// local moves. The handshake companion tag is `tag.offset(1)`.
pub(crate) fn swapm(
    comm: &dyn Comm,
    mut sends: Vec<Option<Vec<u8>>>,
    recv_sizes: &[Option<usize>],
    tag: CommTag,
    opts: FcOptions,
) -> Result<Vec<Option<Vec<u8>>>> {
    let n = comm.size();
    let me = comm.rank();
    debug_assert_eq!(sends.len(), n);
    debug_assert_eq!(recv_sizes.len(), n);

    let hs_tag = tag.offset(1);
    let cap = if opts.max_pending == UNLIMITED_PEND_REQ {
        usize::MAX
    } else {
        opts.max_pending.max(1) as usize
    };

    let mut results: Vec<Option<Vec<u8>>> = (0..n).map(|_| None).collect();

    // Self-transfer never touches the wire.
    if let Some(buf) = sends[me].take() {
        if let Some(want) = recv_sizes[me] {
            if buf.len() != want {
                return Err(PioError::Comm(format!(
                    "self-exchange size mismatch: expected {want}, have {}",
                    buf.len()
                )));
            }
            results[me] = Some(buf);
        } else {
            return Err(PioError::Comm("self-send with no matching receive".into()));
        }
    }

    // Staggered schedule: at step d every rank sends toward rank+d and
    // receives from rank-d, so the posted receive (and its handshake
    // ready) always faces the sender working the same step. Breaking
    // this pairing can cycle-deadlock under a tight in-flight cap.
    let mut recv_q: VecDeque<usize> = (1..n)
        .map(|d| (me + n - d) % n)
        .filter(|&p| recv_sizes[p].is_some())
        .collect();
    let mut send_q: VecDeque<usize> = (1..n)
        .map(|d| (me + d) % n)
        .filter(|&p| sends[p].is_some())
        .collect();

    let mut open_recvs: Vec<(usize, Request)> = Vec::new();
    let mut open_sends: Vec<SendState> = Vec::new();
    // Fire-and-forget ready notifications; waited on at the end.
    let mut ready_sends: Vec<Request> = Vec::new();

    while !recv_q.is_empty() || !send_q.is_empty() || !open_recvs.is_empty() || !open_sends.is_empty()
    {
        while open_recvs.len() < cap {
            let Some(peer) = recv_q.pop_front() else { break };
            open_recvs.push((peer, comm.irecv(peer, tag)?));
            if opts.handshake {
                ready_sends.push(comm.isend(peer, hs_tag, &[])?);
            }
        }

        while open_sends.len() < cap {
            let Some(peer) = send_q.pop_front() else { break };
            let payload = sends[peer].take().expect("queued send has a payload");
            if opts.handshake {
                open_sends.push(SendState::AwaitReady { peer, req: comm.irecv(peer, hs_tag)? });
                sends[peer] = Some(payload);
            } else if opts.isend {
                open_sends.push(SendState::Data { req: comm.isend(peer, tag, &payload)? });
            } else {
                comm.send(peer, tag, &payload)?;
            }
        }

        let mut progressed = false;

        let mut i = 0;
        while i < open_recvs.len() {
            if open_recvs[i].1.test() {
                let (peer, req) = open_recvs.swap_remove(i);
                let payload = req.finish().unwrap_or_default();
                let want = recv_sizes[peer].unwrap_or(0);
                if payload.len() != want {
                    return Err(PioError::Comm(format!(
                        "exchange with rank {peer}: expected {want} bytes, got {}",
                        payload.len()
                    )));
                }
                results[peer] = Some(payload);
                progressed = true;
            } else {
                i += 1;
            }
        }

        enum Step {
            Pending,
            ReadyFor(usize),
            Done,
        }
        let mut i = 0;
        while i < open_sends.len() {
            let step = match &mut open_sends[i] {
                SendState::AwaitReady { peer, req } => {
                    if req.test() {
                        Step::ReadyFor(*peer)
                    } else {
                        Step::Pending
                    }
                }
                SendState::Data { req } => {
                    if req.test() {
                        Step::Done
                    } else {
                        Step::Pending
                    }
                }
            };
            match step {
                Step::Pending => i += 1,
                Step::ReadyFor(peer) => {
                    let payload = sends[peer].take().expect("payload parked for handshake");
                    if opts.isend {
                        open_sends[i] = SendState::Data { req: comm.isend(peer, tag, &payload)? };
                    } else {
                        comm.send(peer, tag, &payload)?;
                        open_sends.swap_remove(i);
                    }
                    progressed = true;
                }
                Step::Done => {
                    open_sends.swap_remove(i);
                    progressed = true;
                }
            }
        }

        if !progressed && (!open_recvs.is_empty() || !open_sends.is_empty()) {
            std::thread::yield_now();
        }
    }

    for r in ready_sends {
        r.wait()?;
    }

    Ok(results)
}
