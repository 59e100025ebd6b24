//! Collective operations built once over the [`Comm`] trait.
//!
//! These are simple linear algorithms (root fan-out / fan-in): the rank
//! counts pario coordinates with are the IO-task and component counts of a
//! job, not its full width, so tree schedules would buy little here.
//! Backends with native collectives are free to bypass this module.
//!
//! As with MPI, all ranks of the communicator must call the same
//! collective in the same order.

use crate::comm::{tags, Comm};
use crate::error::{PioError, Result};

/// Broadcast `data` from `root` to every rank; all ranks return the bytes.
/// `data` is ignored on non-root ranks.
pub fn bcast(comm: &dyn Comm, root: usize, data: Option<&[u8]>) -> Result<Vec<u8>> {
    if comm.rank() == root {
        let data = data.ok_or(PioError::InvalidArg("bcast root must supply data"))?;
        let mut pending = Vec::with_capacity(comm.size().saturating_sub(1));
        for peer in 0..comm.size() {
            if peer != root {
                pending.push(comm.isend(peer, tags::COLL, data)?);
            }
        }
        for p in pending {
            p.wait()?;
        }
        Ok(data.to_vec())
    } else {
        comm.recv(root, tags::COLL)
    }
}

/// Gather one byte buffer per rank at `root` (in rank order); non-roots
/// get `None`.
pub fn gather(comm: &dyn Comm, root: usize, contribution: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
    if comm.rank() == root {
        let mut out = Vec::with_capacity(comm.size());
        for peer in 0..comm.size() {
            if peer == root {
                out.push(contribution.to_vec());
            } else {
                out.push(comm.recv(peer, tags::COLL)?);
            }
        }
        Ok(Some(out))
    } else {
        comm.send(root, tags::COLL, contribution)?;
        Ok(None)
    }
}

/// Gather at every rank: each rank ends with all contributions in rank
/// order.
pub fn allgather(comm: &dyn Comm, contribution: &[u8]) -> Result<Vec<Vec<u8>>> {
    use crate::wire::{MsgReader, MsgWriter};
    let gathered = gather(comm, 0, contribution)?;
    let packed = match gathered {
        Some(parts) => {
            let mut w = MsgWriter::new();
            w.put_u32(parts.len() as u32);
            for p in &parts {
                w.put_bytes(p);
            }
            Some(w.finish())
        }
        None => None,
    };
    let bytes = bcast(comm, 0, packed.as_deref())?;
    let mut r = MsgReader::new(&bytes);
    let n = r.u32()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(r.bytes()?.to_vec());
    }
    Ok(out)
}

/// Reduce byte buffers with `combine` at rank 0 and broadcast the result.
/// All contributions must have the same length.
pub fn allreduce_with(
    comm: &dyn Comm,
    contribution: &[u8],
    combine: impl Fn(&mut [u8], &[u8]),
) -> Result<Vec<u8>> {
    let gathered = gather(comm, 0, contribution)?;
    let reduced = gathered.map(|parts| {
        let mut acc = parts[0].clone();
        for p in &parts[1..] {
            combine(&mut acc, p);
        }
        acc
    });
    bcast(comm, 0, reduced.as_deref())
}

/// Element-wise max over `u64` vectors.
pub fn allreduce_max_u64(comm: &dyn Comm, values: &[u64]) -> Result<Vec<u64>> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let out = allreduce_with(comm, &bytes, |acc, other| {
        for (a, o) in acc.chunks_exact_mut(8).zip(other.chunks_exact(8)) {
            let av = u64::from_le_bytes(a.try_into().unwrap());
            let ov = u64::from_le_bytes(o.try_into().unwrap());
            a.copy_from_slice(&av.max(ov).to_le_bytes());
        }
    })?;
    Ok(out
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Sum over a single `u64` per rank.
pub fn allreduce_sum_u64(comm: &dyn Comm, value: u64) -> Result<u64> {
    let out = allreduce_with(comm, &value.to_le_bytes(), |acc, other| {
        let av = u64::from_le_bytes(acc[..8].try_into().unwrap());
        let ov = u64::from_le_bytes(other[..8].try_into().unwrap());
        acc[..8].copy_from_slice(&av.wrapping_add(ov).to_le_bytes());
    })?;
    Ok(u64::from_le_bytes(out[..8].try_into().unwrap()))
}

/// Bit-wise OR over equally sized byte buffers (coverage bitmaps).
pub fn allreduce_or_bytes(comm: &dyn Comm, bits: &[u8]) -> Result<Vec<u8>> {
    allreduce_with(comm, bits, |acc, other| {
        for (a, o) in acc.iter_mut().zip(other) {
            *a |= o;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalWorld;
    use std::sync::Arc;
    use std::thread;

    fn on_ranks<T: Send + 'static>(
        n: usize,
        f: impl Fn(Arc<dyn Comm>) -> T + Send + Sync + 'static,
    ) -> Vec<T> {
        let world = LocalWorld::new(n);
        let f = Arc::new(f);
        (0..n)
            .map(|r| {
                let comm = world.comm(r);
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    }

    #[test]
    fn bcast_from_nonzero_root() {
        let got = on_ranks(3, |comm| {
            let data = if comm.rank() == 2 { Some(&b"xyz"[..]) } else { None };
            bcast(comm.as_ref(), 2, data).unwrap()
        });
        assert!(got.iter().all(|v| v == b"xyz"));
    }

    #[test]
    fn allgather_orders_by_rank() {
        let got = on_ranks(4, |comm| {
            let mine = [comm.rank() as u8; 2];
            allgather(comm.as_ref(), &mine).unwrap()
        });
        for v in got {
            assert_eq!(v, vec![vec![0, 0], vec![1, 1], vec![2, 2], vec![3, 3]]);
        }
    }

    #[test]
    fn reductions() {
        let got = on_ranks(4, |comm| {
            let r = comm.rank() as u64;
            let sum = allreduce_sum_u64(comm.as_ref(), r + 1).unwrap();
            let max = allreduce_max_u64(comm.as_ref(), &[r, 10 - r]).unwrap();
            (sum, max)
        });
        for (sum, max) in got {
            assert_eq!(sum, 10);
            assert_eq!(max, vec![3, 10]);
        }
    }

    #[test]
    fn or_bitmap() {
        let got = on_ranks(3, |comm| {
            let mut bits = vec![0u8; 2];
            bits[comm.rank() / 8] |= 1 << (comm.rank() % 8);
            allreduce_or_bytes(comm.as_ref(), &bits).unwrap()
        });
        for v in got {
            assert_eq!(v, vec![0b0000_0111, 0]);
        }
    }
}
