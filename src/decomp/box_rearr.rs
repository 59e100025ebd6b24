//! Box rearranger: one contiguous rectangular region per IO task.
//!
//! The split is computed along the outermost dimension, targeting the
//! context's block size; when the array is small, fewer IO tasks than
//! configured receive data (`num_aiotasks`). The communication plan is
//! built once at decomposition init: every compute task resolves, per map
//! element, the owning IO task and the element's offset inside that
//! task's box, then ships the offset lists so each IO task knows where to
//! place incoming data.

use crate::comm::{collective, tags};
use crate::context::PioContext;
use crate::decomp::region::{flatten, unflatten, Region};
use crate::decomp::{Decomp, RecvGroup, SendGroup};
use crate::error::{PioError, Result};
use crate::iosystem::IoSystem;
use crate::wire::{MsgReader, MsgWriter};

/// Compute this IO task's start/count for a block split of the global
/// array along the outermost dimension. Returns the number of IO tasks
/// that receive non-empty blocks; tasks at or past that index get zero
/// counts.
pub(crate) fn calc_start_count(
    gdims: &[usize],
    num_iotasks: usize,
    io_rank: usize,
    blocksize: usize,
) -> (Vec<usize>, Vec<usize>, usize) {
    let ndims = gdims.len();
    let total: u64 = gdims.iter().map(|&g| g as u64).product();
    let by_block = total.div_ceil(blocksize as u64).max(1) as usize;
    let num_aiotasks = num_iotasks.min(by_block).min(gdims[0]).max(1);

    if io_rank >= num_aiotasks {
        return (vec![0; ndims], vec![0; ndims], num_aiotasks);
    }

    let rows = gdims[0];
    let base = rows / num_aiotasks;
    let rem = rows % num_aiotasks;
    let nrows = base + usize::from(io_rank < rem);
    let row0 = io_rank * base + io_rank.min(rem);

    let mut start = vec![0usize; ndims];
    let mut count = gdims.to_vec();
    start[0] = row0;
    count[0] = nrows;
    (start, count, num_aiotasks)
}

struct IoBox {
    union_rank: usize,
    start: Vec<usize>,
    count: Vec<usize>,
}

impl IoBox {
    fn contains(&self, coords: &[usize]) -> bool {
        coords
            .iter()
            .zip(&self.start)
            .zip(&self.count)
            .all(|((&c, &s), &n)| c >= s && c < s + n)
    }
}

/// Build the box plan into `decomp`. Collective over the union comm.
pub(crate) fn create(
    ctx: &PioContext,
    ios: &IoSystem,
    decomp: &mut Decomp,
    iostart: Option<&[usize]>,
    iocount: Option<&[usize]>,
) -> Result<()> {
    let gdims = decomp.gdimlen.clone();
    let ndims = gdims.len();
    let union = ios.union_comm.as_ref();

    // This IO task's region: user-pinned, or the block split.
    let (my_start, my_count, my_naio) = if ios.ioproc {
        match (iostart, iocount) {
            (Some(s), Some(c)) => {
                if s.len() != ndims || c.len() != ndims {
                    return Err(PioError::InvalidArg("iostart/iocount rank mismatch"));
                }
                // User-supplied regions use every configured IO task.
                (s.to_vec(), c.to_vec(), ios.num_iotasks)
            }
            _ => calc_start_count(
                &gdims,
                ios.num_iotasks,
                ios.io_rank.expect("IO task has an IO rank"),
                ctx.blocksize(),
            ),
        }
    } else {
        (vec![0; ndims], vec![0; ndims], 0)
    };

    // The actual number of participating IO tasks comes from the IO root.
    let my_naio_bytes = (my_naio as u64).to_le_bytes();
    let naio_raw = collective::bcast(
        union,
        ios.ioroot,
        if ios.union_rank == ios.ioroot {
            Some(&my_naio_bytes[..])
        } else {
            None
        },
    )?;
    let num_aiotasks = u64::from_le_bytes(
        naio_raw
            .as_slice()
            .try_into()
            .map_err(|_| PioError::Protocol("short num_aiotasks broadcast".into()))?,
    ) as usize;
    decomp.num_aiotasks = num_aiotasks;

    // Publish every IO task's box to the whole union.
    let mut w = MsgWriter::new();
    w.put_bool(ios.ioproc);
    if ios.ioproc {
        w.put_u32(ios.io_rank.expect("IO task has an IO rank") as u32);
        w.put_usizes(&my_start);
        w.put_usizes(&my_count);
    }
    let published = collective::allgather(union, &w.finish())?;
    let mut boxes: Vec<Option<IoBox>> = (0..ios.num_iotasks).map(|_| None).collect();
    for (union_rank, blob) in published.iter().enumerate() {
        let mut r = MsgReader::new(blob);
        if r.bool()? {
            let io_rank = r.u32()? as usize;
            let start = r.usizes()?;
            let count = r.usizes()?;
            boxes[io_rank] = Some(IoBox { union_rank, start, count });
        }
    }

    // Resolve the owner and in-box offset of every local map element.
    let mut elems: Vec<Vec<usize>> = vec![Vec::new(); ios.num_iotasks];
    let mut dests: Vec<Vec<u64>> = vec![Vec::new(); ios.num_iotasks];
    for (i, &v) in decomp.map.iter().enumerate() {
        if v == 0 {
            continue;
        }
        let coords = unflatten(v - 1, &gdims);
        // Boundary elements go to the lowest-index IO task that covers
        // them (blocks are disjoint by construction, so first hit wins).
        let owner = boxes
            .iter()
            .enumerate()
            .find_map(|(idx, b)| match b {
                Some(b) if !b.count.contains(&0) && b.contains(&coords) => Some((idx, b)),
                _ => None,
            });
        let Some((io_index, owner_box)) = owner else {
            return Err(PioError::InvalidArg("map element outside every IO region"));
        };
        let local: Vec<usize> = coords
            .iter()
            .zip(&owner_box.start)
            .map(|(&c, &s)| c - s)
            .collect();
        elems[io_index].push(i);
        dests[io_index].push(flatten(&local, &owner_box.count));
    }

    // Share the count matrix so IO tasks know who will send to them.
    let counts: Vec<usize> = elems.iter().map(|e| e.len()).collect();
    let mut cw = MsgWriter::new();
    cw.put_usizes(&counts);
    let all_counts = collective::allgather(union, &cw.finish())?;
    let count_matrix: Vec<Vec<usize>> = all_counts
        .iter()
        .map(|b| MsgReader::new(b).usizes())
        .collect::<Result<_>>()?;

    // Ship the in-box offset lists: receives first, then sends.
    let my_io_index = ios.io_rank.filter(|_| ios.ioproc);
    let mut pending_recvs = Vec::new();
    if let Some(io_index) = my_io_index {
        for src in 0..union.size() {
            if count_matrix[src][io_index] > 0 {
                pending_recvs.push((src, union.irecv(src, tags::PLAN)?));
            }
        }
    }
    let mut pending_sends = Vec::new();
    for (io_index, d) in dests.iter().enumerate() {
        if !d.is_empty() {
            let target = boxes[io_index].as_ref().expect("counted box exists").union_rank;
            pending_sends.push(union.isend(target, tags::PLAN, bytemuck::cast_slice(d))?);
        }
    }

    decomp.llen = if my_io_index.is_some() && !my_count.contains(&0) {
        my_count.iter().product()
    } else {
        0
    };

    for (src, req) in pending_recvs {
        let raw = req.wait()?.unwrap_or_default();
        let pos: Vec<usize> = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()) as usize)
            .collect();
        decomp.recv_plan.push(RecvGroup { src, pos });
    }
    for s in pending_sends {
        s.wait()?;
    }

    decomp.send_plan = elems
        .into_iter()
        .enumerate()
        .filter(|(_, e)| !e.is_empty())
        .map(|(io_index, elems)| SendGroup {
            dest: boxes[io_index].as_ref().expect("counted box exists").union_rank,
            elems,
        })
        .collect();

    // Agree on buffer and region bounds.
    let maxes = collective::allreduce_max_u64(
        union,
        &[decomp.llen as u64, u64::from(decomp.llen > 0)],
    )?;
    decomp.maxiobuflen = maxes[0] as usize;
    decomp.maxregions = maxes[1] as usize;

    if decomp.llen > 0 {
        decomp.regions = vec![Region { start: my_start, count: my_count, loffset: 0 }];
    }
    Ok(())
}
