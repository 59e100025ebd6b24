//! Async message dispatch.
//!
//! In async mode every public operation that causes IO-side work follows
//! the same shape on compute tasks: the compute master sends a single
//! function code to the IO root on the union communicator, then the
//! compute root ships the marshalled arguments (canonical order, see
//! [`crate::wire`]) to every IO task. On IO tasks a long-running loop
//! receives codes, unpacks arguments, and invokes the matching local
//! primitive; results travel back as broadcasts from the IO root.
//!
//! Loop states: `AWAIT_MSG -> DISPATCH -> EXECUTE -> AWAIT_MSG`, with the
//! terminal `EXITED` reached by one `Exit` code per served component.

use std::sync::Arc;

use crate::comm::{tags, Request};
use crate::context::{IosysId, PioContext};
use crate::error::{PioError, Result};
use crate::iosystem::IoSystem;

/// Function codes carried on the async control channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgCode {
    Exit = 0,
    CreateFile = 1,
    OpenFile = 2,
    CloseFile = 3,
    DeleteFile = 4,
    Sync = 5,
    Redef = 6,
    Enddef = 7,
    DefDim = 8,
    DefVar = 9,
    PutAtt = 10,
    GetAtt = 11,
    SetFill = 12,
    InitDecomp = 13,
    FreeDecomp = 14,
    WriteDarrayMulti = 15,
    ReadDarray = 16,
    SetErrorHandling = 17,
}

impl MsgCode {
    pub(crate) fn from_i32(v: i32) -> Option<Self> {
        use MsgCode::*;
        Some(match v {
            0 => Exit,
            1 => CreateFile,
            2 => OpenFile,
            3 => CloseFile,
            4 => DeleteFile,
            5 => Sync,
            6 => Redef,
            7 => Enddef,
            8 => DefDim,
            9 => DefVar,
            10 => PutAtt,
            11 => GetAtt,
            12 => SetFill,
            13 => InitDecomp,
            14 => FreeDecomp,
            15 => WriteDarrayMulti,
            16 => ReadDarray,
            17 => SetErrorHandling,
            _ => return None,
        })
    }
}

impl PioContext {
    /// Compute-side forwarding: the compute master notifies the IO root,
    /// then the compute root ships the arguments to every IO task. The
    /// caller continues into the shared local path afterwards.
    pub(crate) fn forward_async(&self, ios: &IoSystem, code: MsgCode, args: &[u8]) -> Result<()> {
        debug_assert!(ios.async_mode && !ios.ioproc);
        if ios.compmaster {
            log::trace!("forward_async: code={code:?} ({} bytes of args)", args.len());
            ios.union_comm
                .send(ios.ioroot, tags::MSG, &(code as i32).to_le_bytes())?;
            let mut pending = Vec::with_capacity(ios.ioranks.len());
            for &io in &ios.ioranks {
                pending.push(ios.union_comm.isend(io, tags::ARGS, args)?);
            }
            for p in pending {
                p.wait()?;
            }
        }
        Ok(())
    }

    /// IO-side dispatch loop serving one or more components (async init
    /// creates one IO system per compute component, all sharing this
    /// process). Runs until every component has sent `Exit`; returns the
    /// ordered list of handled codes.
    pub(crate) fn run_dispatch_loop(&self, iosysids: &[IosysId]) -> Result<Vec<MsgCode>> {
        let mut systems: Vec<Arc<IoSystem>> = Vec::with_capacity(iosysids.len());
        for &id in iosysids {
            systems.push(self.iosystem(id)?);
        }
        let mut open: Vec<bool> = vec![true; systems.len()];
        let mut posted: Vec<Option<Request>> = (0..systems.len()).map(|_| None).collect();
        let mut handled = Vec::new();

        while open.iter().any(|&o| o) {
            let mut progressed = false;
            for k in 0..systems.len() {
                if !open[k] {
                    continue;
                }
                let ios = &systems[k];
                if posted[k].is_none() {
                    posted[k] = Some(ios.union_comm.irecv_any(tags::MSG)?);
                }
                let req = posted[k].as_mut().expect("receive just posted");
                if !req.test() {
                    continue;
                }
                progressed = true;
                let raw = posted[k].take().expect("tested request").finish().unwrap_or_default();
                let code = i32::from_le_bytes(
                    raw.as_slice()
                        .try_into()
                        .map_err(|_| PioError::Protocol("short message code".into()))?,
                );
                let code = MsgCode::from_i32(code).ok_or_else(|| {
                    PioError::Protocol(format!("unknown message code {code}"))
                })?;
                log::trace!("dispatch: component {k} code {code:?}");
                handled.push(code);

                if code == MsgCode::Exit {
                    open[k] = false;
                    continue;
                }

                let args = ios.union_comm.recv(ios.comproot, tags::ARGS)?;
                match self.handle_msg(ios, code, &args) {
                    Ok(()) => {}
                    Err(PioError::Protocol(p)) => return Err(PioError::Protocol(p)),
                    Err(e) => {
                        // The error already reached the compute side via
                        // the operation's own policy handling; the loop
                        // stays up for the next message.
                        log::debug!("dispatch: {code:?} failed: {e}");
                    }
                }
            }
            if !progressed {
                std::thread::yield_now();
            }
        }
        Ok(handled)
    }

    fn handle_msg(&self, ios: &Arc<IoSystem>, code: MsgCode, args: &[u8]) -> Result<()> {
        use MsgCode::*;
        match code {
            Exit => Ok(()),
            CreateFile => self.handle_create_file_msg(ios, args),
            OpenFile => self.handle_open_file_msg(ios, args),
            CloseFile => self.handle_close_file_msg(ios, args),
            DeleteFile => self.handle_delete_file_msg(ios, args),
            Sync => self.handle_sync_msg(ios, args),
            Redef => self.handle_redef_msg(ios, args),
            Enddef => self.handle_enddef_msg(ios, args),
            DefDim => self.handle_def_dim_msg(ios, args),
            DefVar => self.handle_def_var_msg(ios, args),
            PutAtt => self.handle_put_att_msg(ios, args),
            GetAtt => self.handle_get_att_msg(ios, args),
            SetFill => self.handle_set_fill_msg(ios, args),
            InitDecomp => self.handle_init_decomp_msg(ios, args),
            FreeDecomp => self.handle_free_decomp_msg(ios, args),
            WriteDarrayMulti => self.handle_write_darray_multi_msg(ios, args),
            ReadDarray => self.handle_read_darray_msg(ios, args),
            SetErrorHandling => self.handle_set_error_handling_msg(ios, args),
        }
    }

    /// The codes handled so far by this process's dispatch loops, in
    /// arrival order. Diagnostic; cleared by [`Self::clear_dispatch_log`].
    pub fn dispatch_log(&self) -> Vec<MsgCode> {
        self.reg.lock().dispatch_log.clone()
    }

    pub fn clear_dispatch_log(&self) {
        self.reg.lock().dispatch_log.clear();
    }

    pub(crate) fn append_dispatch_log(&self, codes: &[MsgCode]) {
        self.reg.lock().dispatch_log.extend_from_slice(codes);
    }
}
