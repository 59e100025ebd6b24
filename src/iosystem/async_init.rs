//! Async-mode IO system construction.
//!
//! One pool of dedicated IO processes serves K compute components. Each
//! component gets its own IO system: a private compute intracomm, a dup
//! of the shared IO intracomm, and a union communicator ordered IO tasks
//! first (so the IO leader sits at union rank 0 and the compute leader at
//! union rank `num_io_procs`). IO processes enter the dispatch loop
//! before returning and serve every component until each has sent `Exit`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::comm::{collective, Comm};
use crate::context::{IosysId, PioContext};
use crate::decomp::swap::RearrOpts;
use crate::decomp::Rearranger;
use crate::error::{PioError, Result};
use crate::iosystem::IoSystem;

impl PioContext {
    /// Initialize IO systems for async operation with explicit process
    /// lists (world ranks). Collective over `world`; IO processes do not
    /// return until every component has exited.
    ///
    /// Returns one id per component on every process; ids for components
    /// a process does not belong to are placeholders that fail lookups.
    pub fn init_async(
        &self,
        world: Arc<dyn Comm>,
        io_ranks: &[usize],
        comp_rank_lists: &[Vec<usize>],
        default_rearranger: Rearranger,
    ) -> Result<Vec<IosysId>> {
        let wsize = world.size();
        let wrank = world.rank();
        if io_ranks.is_empty() || comp_rank_lists.is_empty() {
            return Err(PioError::InvalidArg("need at least one IO and one compute process"));
        }
        for &r in io_ranks.iter().chain(comp_rank_lists.iter().flatten()) {
            if r >= wsize {
                return Err(PioError::InvalidArg("process list rank outside world"));
            }
        }
        for list in comp_rank_lists {
            if list.is_empty() {
                return Err(PioError::InvalidArg("empty compute component"));
            }
            if list.iter().any(|r| io_ranks.contains(r)) {
                return Err(PioError::InvalidArg(
                    "compute and IO process lists must be disjoint",
                ));
            }
        }

        let in_io = io_ranks.contains(&wrank);
        let shared_io_comm = world.split(if in_io { Some(0) } else { None }, io_ranks)?;
        let io_rank = shared_io_comm.as_ref().map(|c| c.rank());

        let num_io = io_ranks.len();
        let mut ids = Vec::with_capacity(comp_rank_lists.len());
        let mut served = Vec::new();

        for (cmp, comp_list) in comp_rank_lists.iter().enumerate() {
            let in_cmp = comp_list.contains(&wrank);
            let comp_comm =
                world.split(if in_cmp { Some(0) } else { None }, comp_list)?;

            let mut union_list = io_ranks.to_vec();
            union_list.extend_from_slice(comp_list);
            let in_union = in_io || in_cmp;
            let union_comm =
                world.split(if in_union { Some(0) } else { None }, &union_list)?;

            // Ids advance on every process so all tables stay aligned.
            let id = self.alloc_iosysid();
            ids.push(id);

            let Some(union_comm) = union_comm else {
                continue;
            };

            let io_comm = match &shared_io_comm {
                Some(c) => Some(c.dup()?),
                None => None,
            };

            let num_comp = comp_list.len();
            let ios = IoSystem {
                id,
                union_comm,
                comp_comm: comp_comm.clone(),
                io_comm,
                num_iotasks: num_io,
                num_comptasks: num_comp,
                union_rank: union_list
                    .iter()
                    .position(|&r| r == wrank)
                    .expect("member is in the union list"),
                comp_rank: comp_comm.as_ref().map(|c| c.rank()),
                io_rank,
                ioranks: (0..num_io).collect(),
                compranks: (num_io..num_io + num_comp).collect(),
                ioroot: 0,
                comproot: num_io,
                ioproc: in_io,
                compproc: in_cmp,
                iomaster: in_io && io_rank == Some(0),
                compmaster: in_cmp && comp_comm.as_ref().map(|c| c.rank()) == Some(0),
                async_mode: true,
                comp_idx: cmp,
                default_rearranger,
                error_policy: Mutex::new(self.default_error_policy()),
                rearr_opts: Mutex::new(RearrOpts::default()),
            };
            log::debug!(
                "init_async: component {} iosysid={} in_io={in_io} in_cmp={in_cmp} comp_rank={:?}",
                ios.comp_idx,
                id.raw(),
                ios.comp_rank,
            );
            self.register_iosystem(Arc::new(ios));
            served.push(id);
        }

        // IO processes serve all components until each sends Exit.
        if in_io {
            let handled = self.run_dispatch_loop(&served)?;
            self.append_dispatch_log(&handled);
        }

        Ok(ids)
    }

    /// Async init from already-existing communicators. The process lists
    /// are derived by a zero-initialized Allreduce(MAX) exchange of
    /// `world_rank + 1` markers, then construction proceeds as in
    /// [`Self::init_async`].
    pub fn init_async_from_comms(
        &self,
        world: Arc<dyn Comm>,
        comp_comms: &[Option<Arc<dyn Comm>>],
        io_comm: Option<Arc<dyn Comm>>,
        default_rearranger: Rearranger,
    ) -> Result<Vec<IosysId>> {
        let io_ranks = member_ranks(world.as_ref(), io_comm.is_some())?;
        let mut comp_rank_lists = Vec::with_capacity(comp_comms.len());
        for c in comp_comms {
            comp_rank_lists.push(member_ranks(world.as_ref(), c.is_some())?);
        }
        self.init_async(world, &io_ranks, &comp_rank_lists, default_rearranger)
    }
}

/// World ranks of the processes where `member` is true, in rank order.
fn member_ranks(world: &dyn Comm, member: bool) -> Result<Vec<usize>> {
    let mut marks = vec![0u64; world.size()];
    if member {
        marks[world.rank()] = world.rank() as u64 + 1;
    }
    let merged = collective::allreduce_max_u64(world, &marks)?;
    Ok(merged
        .into_iter()
        .filter(|&v| v > 0)
        .map(|v| (v - 1) as usize)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalWorld;
    use std::thread;

    #[test]
    fn member_ranks_via_allreduce_max() {
        let world = LocalWorld::new(4);
        let handles: Vec<_> = (0..4)
            .map(|r| {
                let comm = world.comm(r);
                thread::spawn(move || member_ranks(comm.as_ref(), r == 1 || r == 3).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![1, 3]);
        }
    }

    #[test]
    fn async_roles_and_union_layout() {
        let world = LocalWorld::new(3);
        let handles: Vec<_> = (0..3)
            .map(|r| {
                let comm = world.comm(r);
                thread::spawn(move || {
                    let ctx = PioContext::new();
                    let ids = ctx
                        .init_async(comm, &[0], &[vec![1, 2]], Rearranger::Box)
                        .unwrap();
                    assert_eq!(ids.len(), 1);
                    if r == 0 {
                        // IO process: returns only after Exit; log shows it.
                        assert_eq!(ctx.dispatch_log(), vec![crate::dispatch::MsgCode::Exit]);
                        (r, None)
                    } else {
                        let ios = ctx.iosystem(ids[0]).unwrap();
                        assert!(ios.async_mode && ios.compproc && !ios.ioproc);
                        assert_eq!(ios.ioroot, 0);
                        assert_eq!(ios.comproot, 1);
                        assert_eq!(ios.union_rank, r); // io first, then comp
                        let master = ios.compmaster;
                        drop(ios);
                        ctx.free_iosystem(ids[0]).unwrap();
                        (r, Some(master))
                    }
                })
            })
            .collect();
        let mut got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        got.sort_by_key(|&(r, _)| r);
        assert_eq!(got[1].1, Some(true));
        assert_eq!(got[2].1, Some(false));
    }
}
