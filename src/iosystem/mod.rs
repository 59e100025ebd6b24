//! The IO system descriptor: compute/IO/union process groups.
//!
//! An `IoSystem` owns the communicator triple the rest of the library
//! runs on. In intracomm mode the IO tasks are a strided subset of the
//! compute tasks and the union equals the compute group; in async mode
//! (see [`async_init`](crate::iosystem::async_init)) the IO tasks are
//! disjoint from every compute component and run a message-dispatch loop
//! driven remotely.

pub mod async_init;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::comm::{collective, Comm};
use crate::context::{IosysId, Ncid, PioContext};
use crate::decomp::swap::{CommType, FcDirection, FcOptions, RearrOpts};
use crate::decomp::Rearranger;
use crate::dispatch::MsgCode;
use crate::error::{ErrorPolicy, PioError, Result};
use crate::wire::{MsgReader, MsgWriter};

/// Scope of an error-handling policy change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorScope {
    /// Process-wide default for IO systems created afterwards.
    Default,
    /// One IO system.
    Iosystem(IosysId),
    /// One open file (overrides its IO system).
    File(Ncid),
}

impl std::fmt::Debug for IoSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSystem").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Process-group triple plus bookkeeping for one IO system.
pub struct IoSystem {
    pub(crate) id: IosysId,
    /// All tasks: compute ∪ IO.
    pub(crate) union_comm: Arc<dyn Comm>,
    /// Compute tasks; `None` on async IO processes.
    pub(crate) comp_comm: Option<Arc<dyn Comm>>,
    /// IO tasks; `None` on processes that do no IO.
    pub(crate) io_comm: Option<Arc<dyn Comm>>,
    pub(crate) num_iotasks: usize,
    pub(crate) num_comptasks: usize,
    pub(crate) union_rank: usize,
    pub(crate) comp_rank: Option<usize>,
    pub(crate) io_rank: Option<usize>,
    /// Union-coordinate ranks of the IO tasks, IO-rank order.
    pub(crate) ioranks: Vec<usize>,
    /// Union-coordinate ranks of the compute tasks, compute-rank order.
    pub(crate) compranks: Vec<usize>,
    /// Union rank of IO rank 0.
    pub(crate) ioroot: usize,
    /// Union rank of compute rank 0.
    pub(crate) comproot: usize,
    pub(crate) ioproc: bool,
    pub(crate) compproc: bool,
    /// True on IO rank 0.
    pub(crate) iomaster: bool,
    /// True on compute rank 0.
    pub(crate) compmaster: bool,
    pub(crate) async_mode: bool,
    /// Position of this component among the components of an async init.
    pub(crate) comp_idx: usize,
    pub(crate) default_rearranger: Rearranger,
    pub(crate) error_policy: Mutex<ErrorPolicy>,
    pub(crate) rearr_opts: Mutex<RearrOpts>,
}

impl IoSystem {
    /// Effective policy for an operation on this system, honoring a
    /// per-file override.
    pub(crate) fn policy(&self, file_override: Option<ErrorPolicy>) -> ErrorPolicy {
        file_override.unwrap_or(*self.error_policy.lock())
    }

    /// Apply the error policy at the end of a collective operation. The
    /// IO root's verdict is authoritative under `Broadcast`.
    pub(crate) fn conclude(&self, policy: ErrorPolicy, local: Result<()>) -> Result<()> {
        match policy {
            ErrorPolicy::Return => local,
            ErrorPolicy::InternalAbort => {
                if let Err(e) = &local {
                    log::error!("fatal ({}:{}): {e}", file!(), line!());
                    std::process::abort();
                }
                local
            }
            ErrorPolicy::Broadcast => {
                let payload = if self.union_rank == self.ioroot {
                    let mut w = MsgWriter::new();
                    match &local {
                        Ok(()) => {
                            w.put_i32(0);
                            w.put_str("");
                        }
                        Err(e) => {
                            w.put_i32(e.code());
                            w.put_str(&e.to_string());
                        }
                    }
                    Some(w.finish())
                } else {
                    None
                };
                let raw = collective::bcast(
                    self.union_comm.as_ref(),
                    self.ioroot,
                    payload.as_deref(),
                )?;
                let mut r = MsgReader::new(&raw);
                let code = r.i32()?;
                let msg = r.str()?;
                if code != 0 {
                    Err(PioError::Backend { code, msg })
                } else {
                    local
                }
            }
        }
    }
}

impl PioContext {
    /// Initialize an IO system whose IO tasks are a strided subset of the
    /// compute tasks: compute ranks `(base + i*stride) % P` for
    /// `i in 0..num_iotasks`. Collective over `comp_comm`.
    ///
    /// # Errors
    /// `InvalidArg` when `num_iotasks < 1`, `stride < 1`, or the strided
    /// selection does not fit in the communicator.
    pub fn init_intracomm(
        &self,
        comp_comm: Arc<dyn Comm>,
        num_iotasks: usize,
        stride: usize,
        base: usize,
        default_rearranger: Rearranger,
    ) -> Result<IosysId> {
        let num_comptasks = comp_comm.size();
        if num_iotasks < 1 || stride < 1 || num_iotasks * stride > num_comptasks {
            return Err(PioError::InvalidArg(
                "num_iotasks and stride must select distinct compute ranks",
            ));
        }

        let union_comm = comp_comm.dup()?;
        let comp_dup = comp_comm.dup()?;
        let comp_rank = comp_comm.rank();

        let ioranks: Vec<usize> = (0..num_iotasks)
            .map(|i| (base + i * stride) % num_comptasks)
            .collect();
        let ioproc = ioranks.contains(&comp_rank);
        let io_rank = ioranks.iter().position(|&r| r == comp_rank);

        let io_comm = comp_dup.split(if ioproc { Some(0) } else { None }, &ioranks)?;

        let ios = IoSystem {
            id: self.alloc_iosysid(),
            union_comm,
            comp_comm: Some(comp_dup),
            io_comm,
            num_iotasks,
            num_comptasks,
            union_rank: comp_rank,
            comp_rank: Some(comp_rank),
            io_rank,
            ioroot: ioranks[0],
            comproot: 0,
            ioranks,
            compranks: (0..num_comptasks).collect(),
            ioproc,
            compproc: true,
            iomaster: io_rank == Some(0),
            compmaster: comp_rank == 0,
            async_mode: false,
            comp_idx: 0,
            default_rearranger,
            error_policy: Mutex::new(self.default_error_policy()),
            rearr_opts: Mutex::new(RearrOpts::default()),
        };
        let id = ios.id;
        log::debug!(
            "init_intracomm: iosysid={} rank {}/{} num_iotasks={num_iotasks} stride={stride} base={base}",
            id.raw(),
            ios.comp_rank.unwrap_or(0),
            ios.num_comptasks,
        );
        self.register_iosystem(Arc::new(ios));
        Ok(id)
    }

    /// Shut down an IO system and release its resources. On the compute
    /// master of an async system this first tells the IO side to exit its
    /// dispatch loop for this component.
    ///
    /// # Errors
    /// `InvalidArg` when files opened through this system are still open.
    pub fn free_iosystem(&self, iosysid: IosysId) -> Result<()> {
        let ios = self.iosystem(iosysid)?;
        {
            let reg = self.reg.lock();
            if reg.files.values().any(|f| f.lock().iosysid == iosysid) {
                return Err(PioError::InvalidArg("IO system still has open files"));
            }
        }
        if ios.async_mode && ios.compproc && ios.compmaster {
            let code = (MsgCode::Exit as i32).to_le_bytes();
            ios.union_comm.send(ios.ioroot, crate::comm::tags::MSG, &code)?;
        }
        self.remove_iosystem(iosysid)?;
        log::debug!("free_iosystem: iosysid={}", iosysid.raw());
        Ok(())
    }

    /// Is this process one of the IO tasks of the system?
    pub fn iam_iotask(&self, iosysid: IosysId) -> Result<bool> {
        Ok(self.iosystem(iosysid)?.ioproc)
    }

    /// This process's rank in the IO communicator, or `None` if it does
    /// no IO.
    pub fn iotask_rank(&self, iosysid: IosysId) -> Result<Option<usize>> {
        Ok(self.iosystem(iosysid)?.io_rank)
    }

    /// Number of IO tasks in the system.
    pub fn get_numiotasks(&self, iosysid: IosysId) -> Result<usize> {
        Ok(self.iosystem(iosysid)?.num_iotasks)
    }

    /// Change the error-handling policy for a scope; returns the previous
    /// policy of that scope.
    pub fn set_error_handling(
        &self,
        scope: ErrorScope,
        policy: ErrorPolicy,
    ) -> Result<ErrorPolicy> {
        match scope {
            ErrorScope::Default => Ok(self.set_default_error_policy(policy)),
            ErrorScope::Iosystem(id) => {
                let ios = self.iosystem(id)?;
                if ios.async_mode && !ios.ioproc {
                    let mut w = MsgWriter::new();
                    w.put_i32(id.raw());
                    w.put_u8(policy_tag(policy));
                    self.forward_async(&ios, MsgCode::SetErrorHandling, &w.finish())?;
                }
                let mut slot = ios.error_policy.lock();
                Ok(std::mem::replace(&mut *slot, policy))
            }
            ErrorScope::File(ncid) => {
                let file = self.file(ncid)?;
                let mut f = file.lock();
                let old = f
                    .error_policy
                    .replace(policy)
                    .unwrap_or_else(|| self.default_error_policy());
                Ok(old)
            }
        }
    }

    /// Set the rearranger communication options for an IO system.
    pub fn set_rearr_opts(
        &self,
        iosysid: IosysId,
        comm_type: CommType,
        fc_dir: FcDirection,
        comp2io: FcOptions,
        io2comp: FcOptions,
    ) -> Result<()> {
        let opts = RearrOpts { comm_type, fc_dir, comp2io, io2comp };
        opts.validate()?;
        let ios = self.iosystem(iosysid)?;
        *ios.rearr_opts.lock() = opts;
        Ok(())
    }

    pub(crate) fn handle_set_error_handling_msg(
        &self,
        _ios: &Arc<IoSystem>,
        args: &[u8],
    ) -> Result<()> {
        let mut r = MsgReader::new(args);
        let id = IosysId(r.i32()?);
        let policy = policy_from_tag(r.u8()?)?;
        let ios = self.iosystem(id)?;
        *ios.error_policy.lock() = policy;
        Ok(())
    }
}

pub(crate) fn policy_tag(p: ErrorPolicy) -> u8 {
    match p {
        ErrorPolicy::InternalAbort => 1,
        ErrorPolicy::Broadcast => 2,
        ErrorPolicy::Return => 3,
    }
}

pub(crate) fn policy_from_tag(t: u8) -> Result<ErrorPolicy> {
    Ok(match t {
        1 => ErrorPolicy::InternalAbort,
        2 => ErrorPolicy::Broadcast,
        3 => ErrorPolicy::Return,
        _ => return Err(PioError::Protocol("unknown error policy tag".into())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalWorld;
    use crate::comm::NoComm;
    use std::thread;

    #[test]
    fn intracomm_strided_io_tasks() {
        let world = LocalWorld::new(4);
        let handles: Vec<_> = (0..4)
            .map(|r| {
                let comm = world.comm(r);
                thread::spawn(move || {
                    let ctx = PioContext::new();
                    let id = ctx.init_intracomm(comm, 2, 2, 1, Rearranger::Box).unwrap();
                    let ios = ctx.iosystem(id).unwrap();
                    assert_eq!(ios.ioranks, vec![1, 3]);
                    assert_eq!(ios.ioroot, 1);
                    assert_eq!(ios.compranks, vec![0, 1, 2, 3]);
                    assert!(!ios.async_mode);
                    let out = (
                        ctx.iam_iotask(id).unwrap(),
                        ctx.iotask_rank(id).unwrap(),
                        ios.compmaster,
                        ios.iomaster,
                    );
                    drop(ios);
                    ctx.free_iosystem(id).unwrap();
                    out
                })
            })
            .collect();
        let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got[0], (false, None, true, false));
        assert_eq!(got[1], (true, Some(0), false, true));
        assert_eq!(got[2], (false, None, false, false));
        assert_eq!(got[3], (true, Some(1), false, false));
    }

    #[test]
    fn intracomm_rejects_oversubscription() {
        let ctx = PioContext::new();
        let err = ctx
            .init_intracomm(NoComm::new(), 2, 1, 0, Rearranger::Box)
            .unwrap_err();
        assert!(matches!(err, PioError::InvalidArg(_)));
    }

    #[test]
    fn serial_system_on_nocomm() {
        let ctx = PioContext::new();
        let id = ctx.init_intracomm(NoComm::new(), 1, 1, 0, Rearranger::Box).unwrap();
        assert!(ctx.iam_iotask(id).unwrap());
        assert_eq!(ctx.get_numiotasks(id).unwrap(), 1);
        assert!(ctx.iosystem_is_active(id));
        ctx.free_iosystem(id).unwrap();
        assert!(!ctx.iosystem_is_active(id));
    }

    #[test]
    fn error_scope_default_round_trip() {
        let ctx = PioContext::new();
        let old = ctx
            .set_error_handling(ErrorScope::Default, ErrorPolicy::Return)
            .unwrap();
        assert_eq!(old, ErrorPolicy::InternalAbort);
        let id = ctx.init_intracomm(NoComm::new(), 1, 1, 0, Rearranger::Box).unwrap();
        // New systems inherit the default in force at creation.
        let ios = ctx.iosystem(id).unwrap();
        assert_eq!(*ios.error_policy.lock(), ErrorPolicy::Return);
    }
}
