//! Files: lifecycle, metadata surface, and the IO-task funnels.
//!
//! Every task of an IO system holds a `FileDesc` mirror (dims, vars,
//! record cursors); only tasks that do IO hold a backend. For parallel
//! backend kinds every IO task touches the file; for serial kinds IO
//! rank 0 alone does, and the other IO tasks funnel their region
//! put/get requests to it.

pub mod backend;
pub mod classic;

use std::collections::HashMap;
use std::sync::Arc;

use crate::comm::{collective, tags};
use crate::context::{DimId, IosysId, Ncid, PioContext, VarId};
use crate::darray::MultiBuf;
use crate::dispatch::MsgCode;
use crate::error::{ErrorPolicy, PioError, Result};
use crate::iosystem::IoSystem;
use crate::types::{Element, PioType};
use crate::wire::{MsgReader, MsgWriter};
use backend::{AttValue, BackendRole, DimLen, IoBackend, IoType};

/// Mode for [`PioContext::create_file`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// Replace an existing file.
    Clobber,
    /// Fail if the file exists.
    NoClobber,
}

/// Mode for [`PioContext::open_file`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Write,
}

#[derive(Clone, Debug)]
pub(crate) struct DimInfo {
    pub name: String,
    pub len: usize,
    pub unlimited: bool,
}

/// Per-variable state mirrored on every task.
pub(crate) struct VarDesc {
    pub name: String,
    pub ty: PioType,
    pub dimids: Vec<DimId>,
    pub rec_var: bool,
    /// Record written by the next `write_darray` on this var.
    pub record: usize,
    pub fill: Option<Vec<u8>>,
    pub use_fill: bool,
    /// Outstanding non-blocking backend requests.
    pub pending: Vec<u64>,
}

impl std::fmt::Debug for FileDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDesc").field("ncid", &self.ncid).finish_non_exhaustive()
    }
}

pub(crate) struct FileDesc {
    pub ncid: Ncid,
    pub iosysid: IosysId,
    pub path: String,
    pub iotype: IoType,
    pub writable: bool,
    pub define_mode: bool,
    /// This task issues backend calls for this file.
    pub do_io: bool,
    pub backend: Option<Box<dyn IoBackend>>,
    pub dims: Vec<DimInfo>,
    pub vars: Vec<VarDesc>,
    pub multibufs: HashMap<(i32, bool), MultiBuf>,
    pub error_policy: Option<ErrorPolicy>,
    /// Rearrangements executed for this file (perf instrumentation).
    pub rearranges: u64,
    /// Records this task knows were written (mirror of the backend's
    /// record count for tasks that hold no backend).
    pub numrecs: usize,
}

impl FileDesc {
    pub(crate) fn var(&self, id: VarId) -> Result<&VarDesc> {
        self.vars.get(id.0 as usize).ok_or(PioError::BadVarId(id.0))
    }

    pub(crate) fn var_mut(&mut self, id: VarId) -> Result<&mut VarDesc> {
        self.vars.get_mut(id.0 as usize).ok_or(PioError::BadVarId(id.0))
    }

    /// The variable's shape without the record dimension.
    pub(crate) fn var_inner_shape(&self, v: &VarDesc) -> Vec<usize> {
        let skip = usize::from(v.rec_var);
        v.dimids[skip..].iter().map(|&d| self.dims[d.0 as usize].len).collect()
    }
}

/// One region write bound for the backend.
pub(crate) struct RegionPut {
    pub varid: usize,
    pub start: Vec<usize>,
    pub count: Vec<usize>,
    pub data: Vec<u8>,
}

/// One region read request (serial funnel).
pub(crate) struct RegionGet {
    pub varid: usize,
    pub start: Vec<usize>,
    pub count: Vec<usize>,
}

impl PioContext {
    /// True when the backend kind can be used in this build.
    pub fn iotype_available(&self, iotype: IoType) -> bool {
        iotype.available()
    }

    /// Create a file for writing. Collective over the IO system.
    pub fn create_file(
        &self,
        iosysid: IosysId,
        path: &str,
        mode: CreateMode,
        iotype: IoType,
    ) -> Result<Ncid> {
        let ios = self.iosystem(iosysid)?;
        if !iotype.available() {
            return Err(PioError::BadIoType(iotype.name()));
        }
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(iosysid.raw());
            w.put_str(path);
            w.put_bool(mode == CreateMode::Clobber);
            w.put_u8(iotype.tag());
            self.forward_async(&ios, MsgCode::CreateFile, &w.finish())?;
        }
        self.create_file_impl(&ios, path, mode, iotype)
    }

    fn create_file_impl(
        &self,
        ios: &Arc<IoSystem>,
        path: &str,
        mode: CreateMode,
        iotype: IoType,
    ) -> Result<Ncid> {
        let policy = ios.policy(None);
        let do_io = ios.ioproc && (iotype.parallel() || ios.iomaster);
        let clobber = mode == CreateMode::Clobber;

        let mut backend_res: Result<Option<Box<dyn IoBackend>>> = Ok(None);
        if ios.ioproc && iotype.parallel() {
            if ios.iomaster {
                backend_res =
                    backend::create_backend(iotype, path, clobber, BackendRole::Root).map(Some);
            }
            // Peers attach only once the root has created the file.
            ios.io_comm.as_ref().expect("IO task has an IO comm").barrier()?;
            if !ios.iomaster {
                backend_res =
                    backend::create_backend(iotype, path, false, BackendRole::Peer).map(Some);
            }
        } else if do_io {
            backend_res = backend::create_backend(iotype, path, clobber, BackendRole::Root).map(Some);
        }

        let status = backend_res.as_ref().map(|_| ()).map_err(|e| e.clone());
        ios.conclude(policy, status)?;
        let backend = backend_res?;

        let ncid = self.agree_ncid(ios)?;
        log::debug!("create_file: {path} ncid={} iotype={:?}", ncid.raw(), iotype);
        self.register_file(FileDesc {
            ncid,
            iosysid: ios.id,
            path: path.to_string(),
            iotype,
            writable: true,
            define_mode: true,
            do_io,
            backend,
            dims: Vec::new(),
            vars: Vec::new(),
            multibufs: HashMap::new(),
            error_policy: None,
            rearranges: 0,
            numrecs: 0,
        });
        Ok(ncid)
    }

    /// Open an existing file. Collective over the IO system.
    pub fn open_file(
        &self,
        iosysid: IosysId,
        path: &str,
        mode: OpenMode,
        iotype: IoType,
    ) -> Result<Ncid> {
        let ios = self.iosystem(iosysid)?;
        if !iotype.available() {
            return Err(PioError::BadIoType(iotype.name()));
        }
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(iosysid.raw());
            w.put_str(path);
            w.put_bool(mode == OpenMode::Write);
            w.put_u8(iotype.tag());
            self.forward_async(&ios, MsgCode::OpenFile, &w.finish())?;
        }
        self.open_file_impl(&ios, path, mode, iotype)
    }

    fn open_file_impl(
        &self,
        ios: &Arc<IoSystem>,
        path: &str,
        mode: OpenMode,
        iotype: IoType,
    ) -> Result<Ncid> {
        let policy = ios.policy(None);
        let writable = mode == OpenMode::Write;
        let do_io = ios.ioproc && (iotype.parallel() || ios.iomaster);

        let mut backend_res: Result<Option<Box<dyn IoBackend>>> = Ok(None);
        if do_io {
            let role = if ios.iomaster { BackendRole::Root } else { BackendRole::Peer };
            backend_res = backend::open_backend(iotype, path, writable, role).map(Some);
        }
        let status = backend_res.as_ref().map(|_| ()).map_err(|e| e.clone());
        ios.conclude(policy, status)?;
        let backend = backend_res?;

        // The IO root publishes the header so every task can mirror it.
        let summary = if ios.union_rank == ios.ioroot {
            let b = backend.as_ref().expect("IO root opened the backend");
            let mut w = MsgWriter::new();
            w.put_u32(b.num_dims() as u32);
            for d in 0..b.num_dims() {
                let (name, len, unlimited) = b.dim_info(d)?;
                w.put_str(&name);
                w.put_bool(unlimited);
                w.put_u64(len as u64);
            }
            w.put_u32(b.num_vars() as u32);
            for v in 0..b.num_vars() {
                let (name, ty, dimids) = b.var_info(v)?;
                w.put_str(&name);
                w.put_u8(ty.tag());
                w.put_usizes(&dimids);
            }
            Some(w.finish())
        } else {
            None
        };
        let summary = collective::bcast(ios.union_comm.as_ref(), ios.ioroot, summary.as_deref())?;
        let mut r = MsgReader::new(&summary);
        let ndims = r.u32()? as usize;
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            let name = r.str()?;
            let unlimited = r.bool()?;
            let len = r.u64()? as usize;
            dims.push(DimInfo { name, len, unlimited });
        }
        let nvars = r.u32()? as usize;
        let mut vars = Vec::with_capacity(nvars);
        for _ in 0..nvars {
            let name = r.str()?;
            let ty = PioType::from_tag(r.u8()?)
                .ok_or_else(|| PioError::Protocol("unknown type tag in summary".into()))?;
            let dimids: Vec<DimId> = r.usizes()?.into_iter().map(|d| DimId(d as i32)).collect();
            let rec_var = dimids.first().map(|&d| dims[d.0 as usize].unlimited).unwrap_or(false);
            vars.push(VarDesc {
                name,
                ty,
                dimids,
                rec_var,
                record: 0,
                fill: None,
                use_fill: false,
                pending: Vec::new(),
            });
        }

        let ncid = self.agree_ncid(ios)?;
        log::debug!("open_file: {path} ncid={} nvars={nvars}", ncid.raw());
        self.register_file(FileDesc {
            ncid,
            iosysid: ios.id,
            path: path.to_string(),
            iotype,
            writable,
            define_mode: false,
            do_io,
            backend,
            dims,
            vars,
            multibufs: HashMap::new(),
            error_policy: None,
            rearranges: 0,
            numrecs: 0,
        });
        Ok(ncid)
    }

    /// In async mode the IO master assigns the file id and everyone
    /// adopts it; otherwise the aligned local counters agree already.
    fn agree_ncid(&self, ios: &IoSystem) -> Result<Ncid> {
        if ios.async_mode {
            let proposal = if ios.ioproc && ios.iomaster {
                Some(self.alloc_ncid().raw().to_le_bytes())
            } else {
                None
            };
            let raw = collective::bcast(
                ios.union_comm.as_ref(),
                ios.ioroot,
                proposal.as_ref().map(|b| &b[..]),
            )?;
            let raw = i32::from_le_bytes(
                raw.as_slice()
                    .try_into()
                    .map_err(|_| PioError::Protocol("short ncid broadcast".into()))?,
            );
            Ok(self.adopt_ncid(raw))
        } else {
            Ok(self.alloc_ncid())
        }
    }

    /// Flush pending writes and push everything to the backend.
    /// Collective over the IO system.
    pub fn sync(&self, ncid: Ncid) -> Result<()> {
        let file = self.file(ncid)?;
        let iosysid = file.lock().iosysid;
        let ios = self.iosystem(iosysid)?;
        self.flush_file_bufs(ncid, true)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            self.forward_async(&ios, MsgCode::Sync, &w.finish())?;
        }
        self.sync_impl(&ios, ncid)
    }

    fn sync_impl(&self, ios: &Arc<IoSystem>, ncid: Ncid) -> Result<()> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        let local = self.sync_backend(ios, &mut f);
        ios.conclude(policy, local)
    }

    /// Complete pending requests, agree on the record count across
    /// parallel writers, and sync the backend.
    fn sync_backend(&self, ios: &IoSystem, f: &mut FileDesc) -> Result<()> {
        let all_pending: Vec<u64> = f.vars.iter().flat_map(|v| v.pending.iter().copied()).collect();
        if f.do_io {
            if let Some(b) = f.backend.as_mut() {
                b.wait_all(&all_pending)?;
            }
        }
        for v in &mut f.vars {
            v.pending.clear();
        }
        if f.iotype.parallel() && ios.ioproc {
            let io = ios.io_comm.as_ref().expect("IO task has an IO comm");
            let n = f.backend.as_ref().map(|b| b.numrecs()).unwrap_or(0);
            let agreed = collective::allreduce_max_u64(io.as_ref(), &[n as u64])?[0] as usize;
            if let Some(b) = f.backend.as_mut() {
                b.set_numrecs(agreed)?;
            }
        }
        if !f.define_mode {
            if let Some(b) = f.backend.as_mut() {
                b.sync()?;
            }
        }
        Ok(())
    }

    /// Close the file, flushing any pending multi-buffer first.
    /// Collective over the IO system.
    pub fn close_file(&self, ncid: Ncid) -> Result<()> {
        let file = self.file(ncid)?;
        let iosysid = file.lock().iosysid;
        let ios = self.iosystem(iosysid)?;
        self.flush_file_bufs(ncid, true)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            self.forward_async(&ios, MsgCode::CloseFile, &w.finish())?;
        }
        self.close_file_impl(&ios, ncid)
    }

    fn close_file_impl(&self, ios: &Arc<IoSystem>, ncid: Ncid) -> Result<()> {
        let file = self.remove_file(ncid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        let local = (|| {
            self.sync_backend(ios, &mut f)?;
            if let Some(b) = f.backend.as_mut() {
                b.close()?;
            }
            Ok(())
        })();
        log::debug!("close_file: ncid={} path={}", ncid.raw(), f.path);
        ios.conclude(policy, local)
    }

    /// Delete a file by path. Collective; the IO root unlinks.
    pub fn delete_file(&self, iosysid: IosysId, path: &str) -> Result<()> {
        let ios = self.iosystem(iosysid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(iosysid.raw());
            w.put_str(path);
            self.forward_async(&ios, MsgCode::DeleteFile, &w.finish())?;
        }
        self.delete_file_impl(&ios, path)
    }

    fn delete_file_impl(&self, ios: &Arc<IoSystem>, path: &str) -> Result<()> {
        let policy = ios.policy(None);
        let local = if ios.union_rank == ios.ioroot {
            std::fs::remove_file(path).map_err(PioError::from_io)
        } else {
            Ok(())
        };
        ios.conclude(policy, local)
    }

    /// Define a dimension. Collective; must be in define mode.
    pub fn def_dim(&self, ncid: Ncid, name: &str, len: DimLen) -> Result<DimId> {
        let (ios, _) = self.file_system(ncid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            w.put_str(name);
            match len {
                DimLen::Unlimited => w.put_bool(true),
                DimLen::Fixed(n) => {
                    w.put_bool(false);
                    w.put_u64(n as u64);
                }
            }
            self.forward_async(&ios, MsgCode::DefDim, &w.finish())?;
        }
        self.def_dim_impl(&ios, ncid, name, len)
    }

    fn def_dim_impl(&self, ios: &Arc<IoSystem>, ncid: Ncid, name: &str, len: DimLen) -> Result<DimId> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        if !f.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        if f.dims.iter().any(|d| d.name == name) {
            return Err(PioError::InvalidArg("dimension name already in use"));
        }
        if matches!(len, DimLen::Unlimited) && f.dims.iter().any(|d| d.unlimited) {
            return Err(PioError::InvalidArg("only one unlimited dimension allowed"));
        }
        let local = match f.backend.as_mut() {
            Some(b) => b.def_dim(name, len).map(|_| ()),
            None => Ok(()),
        };
        ios.conclude(policy, local)?;
        let (dlen, unlimited) = match len {
            DimLen::Fixed(n) => (n, false),
            DimLen::Unlimited => (0, true),
        };
        f.dims.push(DimInfo { name: name.to_string(), len: dlen, unlimited });
        Ok(DimId(f.dims.len() as i32 - 1))
    }

    /// Define a variable. Collective; must be in define mode.
    pub fn def_var(&self, ncid: Ncid, name: &str, ty: PioType, dimids: &[DimId]) -> Result<VarId> {
        let (ios, _) = self.file_system(ncid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            w.put_str(name);
            w.put_u8(ty.tag());
            w.put_usizes(&dimids.iter().map(|d| d.0 as usize).collect::<Vec<_>>());
            self.forward_async(&ios, MsgCode::DefVar, &w.finish())?;
        }
        self.def_var_impl(&ios, ncid, name, ty, dimids)
    }

    fn def_var_impl(
        &self,
        ios: &Arc<IoSystem>,
        ncid: Ncid,
        name: &str,
        ty: PioType,
        dimids: &[DimId],
    ) -> Result<VarId> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        if !f.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        if f.vars.iter().any(|v| v.name == name) {
            return Err(PioError::InvalidArg("variable name already in use"));
        }
        for (i, d) in dimids.iter().enumerate() {
            let dim = f
                .dims
                .get(d.0 as usize)
                .ok_or(PioError::BadDimId(d.0))?;
            if dim.unlimited && i != 0 {
                return Err(PioError::InvalidArg("the unlimited dimension must come first"));
            }
        }
        let raw_dims: Vec<usize> = dimids.iter().map(|d| d.0 as usize).collect();
        let local = match f.backend.as_mut() {
            Some(b) => b.def_var(name, ty, &raw_dims).map(|_| ()),
            None => Ok(()),
        };
        ios.conclude(policy, local)?;
        let rec_var = dimids
            .first()
            .map(|&d| f.dims[d.0 as usize].unlimited)
            .unwrap_or(false);
        f.vars.push(VarDesc {
            name: name.to_string(),
            ty,
            dimids: dimids.to_vec(),
            rec_var,
            record: 0,
            fill: None,
            use_fill: false,
            pending: Vec::new(),
        });
        Ok(VarId(f.vars.len() as i32 - 1))
    }

    /// Leave define mode; the header hits the file here. Collective.
    pub fn enddef(&self, ncid: Ncid) -> Result<()> {
        let (ios, _) = self.file_system(ncid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            self.forward_async(&ios, MsgCode::Enddef, &w.finish())?;
        }
        self.enddef_impl(&ios, ncid)
    }

    fn enddef_impl(&self, ios: &Arc<IoSystem>, ncid: Ncid) -> Result<()> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        if !f.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        let local = match f.backend.as_mut() {
            Some(b) => b.enddef(),
            None => Ok(()),
        };
        ios.conclude(policy, local)?;
        f.define_mode = false;
        Ok(())
    }

    /// Re-enter define mode. Collective.
    pub fn redef(&self, ncid: Ncid) -> Result<()> {
        let (ios, _) = self.file_system(ncid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            self.forward_async(&ios, MsgCode::Redef, &w.finish())?;
        }
        self.redef_impl(&ios, ncid)
    }

    fn redef_impl(&self, ios: &Arc<IoSystem>, ncid: Ncid) -> Result<()> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        if f.define_mode {
            return Err(PioError::InDefineMode);
        }
        let local = match f.backend.as_mut() {
            Some(b) => b.redef(),
            None => Ok(()),
        };
        ios.conclude(policy, local)?;
        f.define_mode = true;
        Ok(())
    }

    /// Write a text attribute (global when `varid` is `None`).
    pub fn put_att_text(
        &self,
        ncid: Ncid,
        varid: Option<VarId>,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.put_att(ncid, varid, name, &AttValue::Text(value.to_string()))
    }

    /// Write an integer-vector attribute.
    pub fn put_att_ints(
        &self,
        ncid: Ncid,
        varid: Option<VarId>,
        name: &str,
        value: &[i64],
    ) -> Result<()> {
        self.put_att(ncid, varid, name, &AttValue::Ints(value.to_vec()))
    }

    fn put_att(&self, ncid: Ncid, varid: Option<VarId>, name: &str, value: &AttValue) -> Result<()> {
        let (ios, _) = self.file_system(ncid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            w.put_i32(varid.map(|v| v.0).unwrap_or(-1));
            w.put_str(name);
            encode_att(&mut w, value);
            self.forward_async(&ios, MsgCode::PutAtt, &w.finish())?;
        }
        self.put_att_impl(&ios, ncid, varid, name, value)
    }

    fn put_att_impl(
        &self,
        ios: &Arc<IoSystem>,
        ncid: Ncid,
        varid: Option<VarId>,
        name: &str,
        value: &AttValue,
    ) -> Result<()> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        if !f.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        if let Some(v) = varid {
            f.var(v)?;
        }
        let local = match f.backend.as_mut() {
            Some(b) => b.put_att(varid.map(|v| v.0 as usize), name, value),
            None => Ok(()),
        };
        ios.conclude(policy, local)
    }

    /// Read a text attribute; every task receives the value.
    pub fn get_att_text(&self, ncid: Ncid, varid: Option<VarId>, name: &str) -> Result<String> {
        match self.get_att(ncid, varid, name)? {
            AttValue::Text(t) => Ok(t),
            AttValue::Ints(_) => Err(PioError::TypeMismatch {
                var: PioType::Char,
                data: PioType::Int64,
            }),
        }
    }

    /// Read an integer-vector attribute; every task receives the value.
    pub fn get_att_ints(&self, ncid: Ncid, varid: Option<VarId>, name: &str) -> Result<Vec<i64>> {
        match self.get_att(ncid, varid, name)? {
            AttValue::Ints(v) => Ok(v),
            AttValue::Text(_) => Err(PioError::TypeMismatch {
                var: PioType::Int64,
                data: PioType::Char,
            }),
        }
    }

    fn get_att(&self, ncid: Ncid, varid: Option<VarId>, name: &str) -> Result<AttValue> {
        let (ios, _) = self.file_system(ncid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            w.put_i32(varid.map(|v| v.0).unwrap_or(-1));
            w.put_str(name);
            self.forward_async(&ios, MsgCode::GetAtt, &w.finish())?;
        }
        self.get_att_impl(&ios, ncid, varid, name)
    }

    fn get_att_impl(
        &self,
        ios: &Arc<IoSystem>,
        ncid: Ncid,
        varid: Option<VarId>,
        name: &str,
    ) -> Result<AttValue> {
        let file = self.file(ncid)?;
        // The IO root answers; everyone else decodes the broadcast.
        let answer = if ios.union_rank == ios.ioroot {
            let f = file.lock();
            let res = match f.backend.as_ref() {
                Some(b) => b.get_att(varid.map(|v| v.0 as usize), name),
                None => Err(PioError::Comm("IO root holds no backend".into())),
            };
            let mut w = MsgWriter::new();
            match res {
                Ok(v) => {
                    w.put_i32(0);
                    encode_att(&mut w, &v);
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
        let raw = collective::bcast(ios.union_comm.as_ref(), ios.ioroot, answer.as_deref())?;
        let mut r = MsgReader::new(&raw);
        let code = r.i32()?;
        if code != 0 {
            let msg = r.str()?;
            return Err(PioError::Backend { code, msg });
        }
        decode_att(&mut r)
    }

    /// Set (or clear) the fill value used for holes when writing through
    /// a decomposition that does not cover the variable.
    pub fn def_var_fill<T: Element>(&self, ncid: Ncid, varid: VarId, fill: Option<T>) -> Result<()> {
        let (ios, _) = self.file_system(ncid)?;
        let bytes = fill.map(|f| bytemuck::bytes_of(&f).to_vec());
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            w.put_i32(varid.0);
            w.put_opt_bytes(bytes.as_deref());
            self.forward_async(&ios, MsgCode::SetFill, &w.finish())?;
        }
        self.set_fill_impl(ncid, varid, bytes)
    }

    fn set_fill_impl(&self, ncid: Ncid, varid: VarId, bytes: Option<Vec<u8>>) -> Result<()> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        if !f.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        let var = f.var_mut(varid)?;
        var.use_fill = bytes.is_some();
        var.fill = bytes;
        Ok(())
    }

    /// Set the record to be written by the next `write_darray` on a
    /// record variable. Local.
    pub fn setframe(&self, ncid: Ncid, varid: VarId, record: usize) -> Result<()> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let var = f.var_mut(varid)?;
        if !var.rec_var {
            return Err(PioError::InvalidArg("setframe on a non-record variable"));
        }
        var.record = record;
        Ok(())
    }

    /// Increment the record of a record variable. Local.
    pub fn advanceframe(&self, ncid: Ncid, varid: VarId) -> Result<()> {
        let file = self.file(ncid)?;
        let mut f = file.lock();
        let var = f.var_mut(varid)?;
        if !var.rec_var {
            return Err(PioError::InvalidArg("advanceframe on a non-record variable"));
        }
        var.record += 1;
        Ok(())
    }

    /// Counts of dims and vars plus the unlimited dim, from the mirror.
    pub fn inq(&self, ncid: Ncid) -> Result<(usize, usize, Option<DimId>)> {
        let file = self.file(ncid)?;
        let f = file.lock();
        let unlim = f
            .dims
            .iter()
            .position(|d| d.unlimited)
            .map(|i| DimId(i as i32));
        Ok((f.dims.len(), f.vars.len(), unlim))
    }

    /// Dimension id by name.
    pub fn inq_dimid(&self, ncid: Ncid, name: &str) -> Result<DimId> {
        let file = self.file(ncid)?;
        let f = file.lock();
        f.dims
            .iter()
            .position(|d| d.name == name)
            .map(|i| DimId(i as i32))
            .ok_or(PioError::BadDimId(-1))
    }

    /// Dimension length (current record count for the unlimited dim).
    pub fn inq_dimlen(&self, ncid: Ncid, dimid: DimId) -> Result<usize> {
        let file = self.file(ncid)?;
        let f = file.lock();
        let d = f
            .dims
            .get(dimid.0 as usize)
            .ok_or(PioError::BadDimId(dimid.0))?;
        if d.unlimited {
            let backend_recs = f.backend.as_ref().map(|b| b.numrecs()).unwrap_or(0);
            Ok(backend_recs.max(f.numrecs))
        } else {
            Ok(d.len)
        }
    }

    /// Variable id by name.
    pub fn inq_varid(&self, ncid: Ncid, name: &str) -> Result<VarId> {
        let file = self.file(ncid)?;
        let f = file.lock();
        f.vars
            .iter()
            .position(|v| v.name == name)
            .map(|i| VarId(i as i32))
            .ok_or(PioError::BadVarId(-1))
    }

    /// Variable name, type and dims.
    pub fn inq_var(&self, ncid: Ncid, varid: VarId) -> Result<(String, PioType, Vec<DimId>)> {
        let file = self.file(ncid)?;
        let f = file.lock();
        let v = f.var(varid)?;
        Ok((v.name.clone(), v.ty, v.dimids.clone()))
    }

    /// Rearrangements executed for this file so far.
    pub fn file_rearranges(&self, ncid: Ncid) -> Result<u64> {
        Ok(self.file(ncid)?.lock().rearranges)
    }

    pub(crate) fn file_system(&self, ncid: Ncid) -> Result<(Arc<IoSystem>, Arc<parking_lot::Mutex<FileDesc>>)> {
        let file = self.file(ncid)?;
        let iosysid = file.lock().iosysid;
        Ok((self.iosystem(iosysid)?, file))
    }

    // ---- async handlers (IO side) -----------------------------------

    pub(crate) fn handle_create_file_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let _iosysid = r.i32()?;
        let path = r.str()?;
        let clobber = r.bool()?;
        let iotype = IoType::from_tag(r.u8()?)
            .ok_or_else(|| PioError::Protocol("unknown iotype tag".into()))?;
        let mode = if clobber { CreateMode::Clobber } else { CreateMode::NoClobber };
        self.create_file_impl(ios, &path, mode, iotype).map(|_| ())
    }

    pub(crate) fn handle_open_file_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let _iosysid = r.i32()?;
        let path = r.str()?;
        let write = r.bool()?;
        let iotype = IoType::from_tag(r.u8()?)
            .ok_or_else(|| PioError::Protocol("unknown iotype tag".into()))?;
        let mode = if write { OpenMode::Write } else { OpenMode::ReadOnly };
        self.open_file_impl(ios, &path, mode, iotype).map(|_| ())
    }

    pub(crate) fn handle_close_file_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        self.close_file_impl(ios, ncid)
    }

    pub(crate) fn handle_delete_file_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let _iosysid = r.i32()?;
        let path = r.str()?;
        self.delete_file_impl(ios, &path)
    }

    pub(crate) fn handle_sync_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        self.sync_impl(ios, ncid)
    }

    pub(crate) fn handle_redef_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        self.redef_impl(ios, ncid)
    }

    pub(crate) fn handle_enddef_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        self.enddef_impl(ios, ncid)
    }

    pub(crate) fn handle_def_dim_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        let name = r.str()?;
        let len = if r.bool()? {
            DimLen::Unlimited
        } else {
            DimLen::Fixed(r.u64()? as usize)
        };
        self.def_dim_impl(ios, ncid, &name, len).map(|_| ())
    }

    pub(crate) fn handle_def_var_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        let name = r.str()?;
        let ty = PioType::from_tag(r.u8()?)
            .ok_or_else(|| PioError::Protocol("unknown type tag".into()))?;
        let dimids: Vec<DimId> = r.usizes()?.into_iter().map(|d| DimId(d as i32)).collect();
        self.def_var_impl(ios, ncid, &name, ty, &dimids).map(|_| ())
    }

    pub(crate) fn handle_put_att_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        let varid = match r.i32()? {
            -1 => None,
            v => Some(VarId(v)),
        };
        let name = r.str()?;
        let value = decode_att(&mut r)?;
        self.put_att_impl(ios, ncid, varid, &name, &value)
    }

    pub(crate) fn handle_get_att_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        let varid = match r.i32()? {
            -1 => None,
            v => Some(VarId(v)),
        };
        let name = r.str()?;
        self.get_att_impl(ios, ncid, varid, &name).map(|_| ())
    }

    pub(crate) fn handle_set_fill_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        let varid = VarId(r.i32()?);
        let bytes = r.opt_bytes()?.map(|b| b.to_vec());
        let _ = ios;
        self.set_fill_impl(ncid, varid, bytes)
    }

    // ---- serial-backend funnels -------------------------------------

    /// Apply region writes: direct (parallel kinds, or the IO root) or
    /// shipped to the IO root (serial kinds). Collective over the IO
    /// communicator. Returns on non-IO tasks immediately.
    pub(crate) fn submit_region_puts(
        &self,
        ios: &IoSystem,
        f: &mut FileDesc,
        puts: Vec<RegionPut>,
    ) -> Result<()> {
        if !ios.ioproc {
            debug_assert!(puts.is_empty());
            return Ok(());
        }
        if f.iotype.parallel() {
            for p in puts {
                let req = f
                    .backend
                    .as_mut()
                    .expect("parallel IO task has a backend")
                    .iput_vara(p.varid, p.start, p.count, p.data)?;
                f.vars[p.varid].pending.push(req);
            }
            return Ok(());
        }

        let io = ios.io_comm.as_ref().expect("IO task has an IO comm").clone();
        if ios.iomaster {
            let b = f.backend.as_mut().expect("serial IO root has a backend");
            let mut reqs = Vec::new();
            for p in puts {
                reqs.push((p.varid, b.iput_vara(p.varid, p.start, p.count, p.data)?));
            }
            for peer in 1..io.size() {
                let raw = io.recv(peer, tags::FUNNEL)?;
                let mut r = MsgReader::new(&raw);
                let n = r.u32()? as usize;
                for _ in 0..n {
                    let varid = r.u32()? as usize;
                    let start = r.usizes()?;
                    let count = r.usizes()?;
                    let data = r.bytes()?.to_vec();
                    reqs.push((varid, b.iput_vara(varid, start, count, data)?));
                }
            }
            for (varid, req) in reqs {
                f.vars[varid].pending.push(req);
            }
        } else {
            let mut w = MsgWriter::new();
            w.put_u32(puts.len() as u32);
            for p in &puts {
                w.put_u32(p.varid as u32);
                w.put_usizes(&p.start);
                w.put_usizes(&p.count);
                w.put_bytes(&p.data);
            }
            io.send(0, tags::FUNNEL, &w.finish())?;
        }
        Ok(())
    }

    /// Serve region reads: direct, or requested from the IO root for
    /// serial kinds. Returns one byte buffer per request, in order.
    pub(crate) fn submit_region_gets(
        &self,
        ios: &IoSystem,
        f: &mut FileDesc,
        gets: Vec<RegionGet>,
    ) -> Result<Vec<Vec<u8>>> {
        if !ios.ioproc {
            debug_assert!(gets.is_empty());
            return Ok(Vec::new());
        }
        if f.iotype.parallel() {
            let b = f.backend.as_mut().expect("parallel IO task has a backend");
            let mut out = Vec::with_capacity(gets.len());
            for g in gets {
                let (_, ty, _) = b.var_info(g.varid)?;
                let nbytes: usize = g.count.iter().product::<usize>() * ty.size();
                let mut buf = vec![0u8; nbytes];
                b.get_vara(g.varid, &g.start, &g.count, &mut buf)?;
                out.push(buf);
            }
            return Ok(out);
        }

        let io = ios.io_comm.as_ref().expect("IO task has an IO comm").clone();
        if ios.iomaster {
            let b = f.backend.as_mut().expect("serial IO root has a backend");
            let mut out = Vec::with_capacity(gets.len());
            for g in &gets {
                let (_, ty, _) = b.var_info(g.varid)?;
                let nbytes: usize = g.count.iter().product::<usize>() * ty.size();
                let mut buf = vec![0u8; nbytes];
                b.get_vara(g.varid, &g.start, &g.count, &mut buf)?;
                out.push(buf);
            }
            for peer in 1..io.size() {
                let raw = io.recv(peer, tags::FUNNEL)?;
                let mut r = MsgReader::new(&raw);
                let n = r.u32()? as usize;
                let mut reply = MsgWriter::new();
                reply.put_u32(n as u32);
                for _ in 0..n {
                    let varid = r.u32()? as usize;
                    let start = r.usizes()?;
                    let count = r.usizes()?;
                    let (_, ty, _) = b.var_info(varid)?;
                    let nbytes: usize = count.iter().product::<usize>() * ty.size();
                    let mut buf = vec![0u8; nbytes];
                    b.get_vara(varid, &start, &count, &mut buf)?;
                    reply.put_bytes(&buf);
                }
                io.send(peer, tags::FUNNEL.offset(1), &reply.finish())?;
            }
            Ok(out)
        } else {
            let mut w = MsgWriter::new();
            w.put_u32(gets.len() as u32);
            for g in &gets {
                w.put_u32(g.varid as u32);
                w.put_usizes(&g.start);
                w.put_usizes(&g.count);
            }
            io.send(0, tags::FUNNEL, &w.finish())?;
            let raw = io.recv(0, tags::FUNNEL.offset(1))?;
            let mut r = MsgReader::new(&raw);
            let n = r.u32()? as usize;
            debug_assert_eq!(n, gets.len());
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                out.push(r.bytes()?.to_vec());
            }
            Ok(out)
        }
    }
}

fn encode_att(w: &mut MsgWriter, value: &AttValue) {
    match value {
        AttValue::Text(t) => {
            w.put_u8(0);
            w.put_str(t);
        }
        AttValue::Ints(ints) => {
            w.put_u8(1);
            w.put_u32(ints.len() as u32);
            for &i in ints {
                w.put_u64(i as u64);
            }
        }
    }
}

fn decode_att(r: &mut MsgReader<'_>) -> Result<AttValue> {
    match r.u8()? {
        0 => Ok(AttValue::Text(r.str()?)),
        1 => {
            let n = r.u32()? as usize;
            let mut ints = Vec::with_capacity(n);
            for _ in 0..n {
                ints.push(r.u64()? as i64);
            }
            Ok(AttValue::Ints(ints))
        }
        _ => Err(PioError::Protocol("unknown attribute payload".into())),
    }
}
