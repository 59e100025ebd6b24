//! Subset rearranger: each IO task serves a fixed group of compute tasks.
//!
//! Compute tasks are partitioned deterministically over the IO tasks;
//! each group shares a subset communicator with its IO task at rank 0.
//! The IO task gathers the group's maps, sorts them, and coalesces the
//! resulting offsets into hyperslab regions, so it writes exactly what
//! its group holds, generally non-rectangular. Holes in the global
//! array are covered by per-IO-task fill regions over an even split of
//! the cell space.

use crate::comm::collective;
use crate::decomp::region::coalesce;
use crate::decomp::{Decomp, RecvGroup, SendGroup};
use crate::error::{PioError, Result};
use crate::iosystem::IoSystem;

/// The subset group this union rank belongs to. IO tasks anchor their own
/// group; other compute tasks are dealt round-robin over the IO tasks.
pub(crate) fn group_of(ios: &IoSystem, union_rank: usize) -> usize {
    if let Some(i) = ios.ioranks.iter().position(|&r| r == union_rank) {
        return i;
    }
    let c = ios
        .compranks
        .iter()
        .position(|&r| r == union_rank)
        .expect("union rank is IO or compute");
    c % ios.num_iotasks
}

/// Union ranks of one group, IO task first (it becomes subset rank 0).
fn group_members(ios: &IoSystem, group: usize) -> Vec<usize> {
    let mut members = vec![ios.ioranks[group]];
    for (c, &u) in ios.compranks.iter().enumerate() {
        if ios.ioranks.contains(&u) {
            continue;
        }
        if c % ios.num_iotasks == group {
            members.push(u);
        }
    }
    members
}

/// Build the subset plan into `decomp`. Collective over the union comm.
pub(crate) fn create(ios: &IoSystem, decomp: &mut Decomp) -> Result<()> {
    let total = decomp.total_elements();
    let my_group = group_of(ios, ios.union_rank);
    let members = group_members(ios, my_group);

    let subset_comm = ios
        .union_comm
        .split(Some(my_group), &members)?
        .ok_or_else(|| PioError::Comm("subset split dropped a member".into()))?;

    decomp.num_aiotasks = ios.num_iotasks;

    // Every member hands its full map (holes included) to the IO task.
    let map_bytes: &[u8] = bytemuck::cast_slice(&decomp.map);
    let gathered = collective::gather(subset_comm.as_ref(), 0, map_bytes)?;

    if let Some(parts) = gathered {
        // (offset, member, running index among the member's non-holes)
        let mut entries: Vec<(u64, usize, usize)> = Vec::new();
        let mut nonzero_counts = vec![0usize; parts.len()];
        for (m, blob) in parts.iter().enumerate() {
            for chunk in blob.chunks_exact(8) {
                let v = u64::from_le_bytes(chunk.try_into().unwrap());
                if v == 0 {
                    continue;
                }
                entries.push((v, m, nonzero_counts[m]));
                nonzero_counts[m] += 1;
            }
        }
        entries.sort_by_key(|&(v, _, _)| v);

        // Distinct offsets define the IO buffer; duplicates (read-only
        // maps) share a slot.
        let mut distinct: Vec<u64> = Vec::new();
        let mut pos_of_entry: Vec<usize> = Vec::with_capacity(entries.len());
        for &(v, _, _) in &entries {
            if distinct.last() != Some(&v) {
                distinct.push(v);
            }
            pos_of_entry.push(distinct.len() - 1);
        }
        decomp.llen = distinct.len();

        let mut rindex: Vec<Vec<usize>> = nonzero_counts.iter().map(|&n| vec![0; n]).collect();
        for (e, &(_, m, k)) in entries.iter().enumerate() {
            rindex[m][k] = pos_of_entry[e];
        }
        decomp.recv_plan = rindex
            .into_iter()
            .enumerate()
            .filter(|(_, pos)| !pos.is_empty())
            .map(|(src, pos)| RecvGroup { src, pos })
            .collect();

        let zero_based: Vec<u64> = distinct.iter().map(|&v| v - 1).collect();
        decomp.regions = coalesce(&zero_based, &decomp.gdimlen);
    }

    // Every member (the IO task's own compute data included) sends to
    // subset rank 0.
    let elems: Vec<usize> = decomp
        .map
        .iter()
        .enumerate()
        .filter(|(_, &v)| v != 0)
        .map(|(i, _)| i)
        .collect();
    if !elems.is_empty() {
        decomp.send_plan = vec![SendGroup { dest: 0, elems }];
    }

    let maxes = collective::allreduce_max_u64(
        ios.union_comm.as_ref(),
        &[decomp.llen as u64, decomp.regions.len() as u64],
    )?;
    decomp.maxiobuflen = maxes[0] as usize;
    decomp.maxregions = maxes[1] as usize;

    if decomp.needs_fill {
        build_fill_regions(ios, decomp, total)?;
    }

    decomp.subset_comm = Some(subset_comm);
    Ok(())
}

/// Mark every cell covered anywhere, then give each IO task the holes in
/// its even share of the cell space.
fn build_fill_regions(ios: &IoSystem, decomp: &mut Decomp, total: u64) -> Result<()> {
    let nbytes = (total as usize + 7) / 8;
    let mut bits = vec![0u8; nbytes];
    for &v in &decomp.map {
        if v != 0 {
            let g = (v - 1) as usize;
            bits[g / 8] |= 1 << (g % 8);
        }
    }
    let covered = collective::allreduce_or_bytes(ios.union_comm.as_ref(), &bits)?;

    if let Some(io_rank) = ios.io_rank {
        let n = ios.num_iotasks as u64;
        let base = total / n;
        let rem = total % n;
        let r = io_rank as u64;
        let begin = r * base + r.min(rem);
        let end = begin + base + u64::from(r < rem);
        let holes: Vec<u64> = (begin..end)
            .filter(|&g| covered[(g / 8) as usize] & (1 << (g % 8)) == 0)
            .collect();
        decomp.holegridsize = holes.len();
        decomp.fill_regions = coalesce(&holes, &decomp.gdimlen);
        log::debug!(
            "subset fill: {} hole cells in {} regions on IO rank {io_rank}",
            decomp.holegridsize,
            decomp.fill_regions.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalWorld;
    use crate::context::PioContext;
    use crate::decomp::Rearranger;
    use crate::types::PioType;
    use std::thread;

    /// Two compute tasks, one doubling as the IO task: the subset plan
    /// gathers both maps and coalesces to one region.
    #[test]
    fn plan_covers_group_data() {
        let world = LocalWorld::new(2);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                let comm = world.comm(r);
                thread::spawn(move || {
                    let ctx = PioContext::new();
                    let iosysid = ctx
                        .init_intracomm(comm, 1, 1, 0, Rearranger::Subset)
                        .unwrap();
                    let map: Vec<u64> = if r == 0 { vec![1, 2, 3, 4] } else { vec![5, 6, 7, 8] };
                    let ioid = ctx
                        .init_decomp(iosysid, PioType::Int, &[8], &map, None, None, None)
                        .unwrap();
                    let d = ctx.decomp(ioid).unwrap();
                    let (llen, nregions, maxreg) = (d.llen, d.regions.len(), d.maxregions);
                    drop(d);
                    ctx.free_decomp(iosysid, ioid).unwrap();
                    ctx.free_iosystem(iosysid).unwrap();
                    (r, llen, nregions, maxreg)
                })
            })
            .collect();
        for h in handles {
            let (r, llen, nregions, maxreg) = h.join().unwrap();
            if r == 0 {
                // Rank 0 is the IO task and holds the whole array.
                assert_eq!(llen, 8);
                assert_eq!(nregions, 1);
            } else {
                assert_eq!(llen, 0);
                assert_eq!(nregions, 0);
            }
            assert_eq!(maxreg, 1);
        }
    }

    #[test]
    fn group_assignment_is_round_robin() {
        let world = LocalWorld::new(4);
        let handles: Vec<_> = (0..4)
            .map(|r| {
                let comm = world.comm(r);
                thread::spawn(move || {
                    let ctx = PioContext::new();
                    let iosysid = ctx
                        .init_intracomm(comm, 2, 2, 0, Rearranger::Subset)
                        .unwrap();
                    let ios = ctx.iosystem(iosysid).unwrap();
                    let groups: Vec<usize> = (0..4).map(|u| group_of(&ios, u)).collect();
                    drop(ios);
                    ctx.free_iosystem(iosysid).unwrap();
                    groups
                })
            })
            .collect();
        for h in handles {
            // IO tasks 0 and 2 anchor groups 0 and 1; compute ranks 1 and
            // 3 are dealt round-robin.
            assert_eq!(h.join().unwrap(), vec![0, 1, 1, 1]);
        }
    }

}
