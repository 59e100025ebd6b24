//! The classic backend: a self-describing little-endian array file.
//!
//! Layout: a fixed 40-byte preamble (magic, version, record count, data
//! offset, section sizes), a header body describing dims, vars and
//! attributes, then the data section. Fixed-size variables are stored
//! back to back; record variables are interleaved per record after the
//! fixed section, so record `r` of variable `v` lives at
//! `data_start + fixed_len + r*rec_block + offset(v)`.
//!
//! Only the `Root` role writes header bytes; `Peer` writers share the
//! same layout computation and touch data regions only, which is what
//! lets every IO task write its own hyperslabs of one shared file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{PioError, Result};
use crate::file::backend::{AttValue, BackendRole, DimLen, IoBackend};
use crate::types::PioType;
use crate::wire::{MsgReader, MsgWriter};

const MAGIC: &[u8; 4] = b"PAR1";
const VERSION: u32 = 1;
const PREAMBLE_LEN: u64 = 40;
const NUMRECS_OFFSET: u64 = 8;

struct Dim {
    name: String,
    len: usize,
    unlimited: bool,
}

struct Var {
    name: String,
    ty: PioType,
    dimids: Vec<usize>,
    rec_var: bool,
    /// Offset of this var's data: absolute within the fixed section, or
    /// within one record block for record vars.
    rel_offset: u64,
}

struct Att {
    owner: Option<usize>,
    name: String,
    value: AttValue,
}

struct PendingPut {
    req: u64,
    varid: usize,
    start: Vec<usize>,
    count: Vec<usize>,
    data: Vec<u8>,
}

pub(crate) struct ClassicBackend {
    file: File,
    role: BackendRole,
    writable: bool,
    define_mode: bool,
    dims: Vec<Dim>,
    vars: Vec<Var>,
    atts: Vec<Att>,
    numrecs: usize,
    data_start: u64,
    fixed_len: u64,
    rec_block: u64,
    data_written: bool,
    pending: Vec<PendingPut>,
    next_req: u64,
}

impl ClassicBackend {
    /// Create a new file (Root) or attach to one just created by the
    /// root writer (Peer; the caller synchronizes the two).
    pub(crate) fn create(path: &str, clobber: bool, role: BackendRole) -> Result<Self> {
        let file = match role {
            BackendRole::Root => {
                let mut opts = OpenOptions::new();
                opts.read(true).write(true);
                if clobber {
                    opts.create(true).truncate(true);
                } else {
                    opts.create_new(true);
                }
                opts.open(path).map_err(PioError::from_io)?
            }
            BackendRole::Peer => OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(PioError::from_io)?,
        };
        Ok(Self {
            file,
            role,
            writable: true,
            define_mode: true,
            dims: Vec::new(),
            vars: Vec::new(),
            atts: Vec::new(),
            numrecs: 0,
            data_start: 0,
            fixed_len: 0,
            rec_block: 0,
            data_written: false,
            pending: Vec::new(),
            next_req: 1,
        })
    }

    /// Open an existing file and parse its header.
    pub(crate) fn open(path: &str, writable: bool, role: BackendRole) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(PioError::from_io)?;
        let mut preamble = [0u8; PREAMBLE_LEN as usize];
        file.read_exact(&mut preamble).map_err(PioError::from_io)?;
        if &preamble[0..4] != MAGIC {
            return Err(PioError::Backend { code: -51, msg: "not a classic array file".into() });
        }
        let version = u32::from_le_bytes(preamble[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(PioError::Backend {
                code: -51,
                msg: format!("unsupported format version {version}"),
            });
        }
        let numrecs = u64::from_le_bytes(preamble[8..16].try_into().unwrap()) as usize;
        let data_start = u64::from_le_bytes(preamble[16..24].try_into().unwrap());
        let fixed_len = u64::from_le_bytes(preamble[24..32].try_into().unwrap());
        let rec_block = u64::from_le_bytes(preamble[32..40].try_into().unwrap());

        let mut body = vec![0u8; (data_start - PREAMBLE_LEN) as usize];
        file.read_exact(&mut body).map_err(PioError::from_io)?;
        let (dims, vars, atts) = decode_body(&body)?;

        Ok(Self {
            file,
            role,
            writable,
            define_mode: false,
            dims,
            vars,
            atts,
            numrecs,
            data_start,
            fixed_len,
            rec_block,
            data_written: true,
            pending: Vec::new(),
            next_req: 1,
        })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut w = MsgWriter::new();
        w.put_u32(self.dims.len() as u32);
        for d in &self.dims {
            w.put_str(&d.name);
            w.put_bool(d.unlimited);
            w.put_u64(d.len as u64);
        }
        w.put_u32(self.vars.len() as u32);
        for v in &self.vars {
            w.put_str(&v.name);
            w.put_u8(v.ty.tag());
            w.put_usizes(&v.dimids);
            w.put_bool(v.rec_var);
            w.put_u64(v.rel_offset);
        }
        w.put_u32(self.atts.len() as u32);
        for a in &self.atts {
            match a.owner {
                Some(v) => {
                    w.put_bool(true);
                    w.put_u32(v as u32);
                }
                None => w.put_bool(false),
            }
            w.put_str(&a.name);
            match &a.value {
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
        w.finish()
    }

    /// Shape of one "record" of the var: full dims for fixed vars, the
    /// inner dims for record vars.
    fn inner_shape(&self, v: &Var) -> Vec<usize> {
        let skip = usize::from(v.rec_var);
        v.dimids[skip..].iter().map(|&d| self.dims[d].len).collect()
    }

    fn var_checked(&self, varid: usize) -> Result<&Var> {
        self.vars
            .get(varid)
            .ok_or(PioError::BadVarId(varid as i32))
    }

    /// Validate a vara request and split it into the record range and the
    /// inner start/count.
    fn split_request<'a>(
        &self,
        v: &Var,
        start: &'a [usize],
        count: &'a [usize],
        reading: bool,
    ) -> Result<(std::ops::Range<usize>, &'a [usize], &'a [usize])> {
        if start.len() != v.dimids.len() || count.len() != v.dimids.len() {
            return Err(PioError::VarDimMismatch { expected: v.dimids.len(), got: start.len() });
        }
        let skip = usize::from(v.rec_var);
        for d in skip..v.dimids.len() {
            if start[d] + count[d] > self.dims[v.dimids[d]].len {
                return Err(PioError::Edge);
            }
        }
        let recs = if v.rec_var {
            if reading && start[0] + count[0] > self.numrecs {
                return Err(PioError::Edge);
            }
            start[0]..start[0] + count[0]
        } else {
            0..1
        };
        Ok((recs, &start[skip..], &count[skip..]))
    }

    fn base_offset(&self, v: &Var, record: usize) -> u64 {
        if v.rec_var {
            self.data_start + self.fixed_len + record as u64 * self.rec_block + v.rel_offset
        } else {
            self.data_start + v.rel_offset
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map_err(PioError::from_io)?;
        self.file.write_all(data).map_err(PioError::from_io)
    }

    /// Read exactly `out.len()` bytes at `offset`, zero-filling anything
    /// past end-of-file (sparse regions never written).
    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map_err(PioError::from_io)?;
        let mut filled = 0;
        while filled < out.len() {
            match self.file.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PioError::from_io(e)),
            }
        }
        out[filled..].fill(0);
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for p in pending {
            self.put_vara(p.varid, &p.start, &p.count, &p.data)?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let body = self.encode_body();
        let mut pre = Vec::with_capacity(PREAMBLE_LEN as usize);
        pre.extend_from_slice(MAGIC);
        pre.extend_from_slice(&VERSION.to_le_bytes());
        pre.extend_from_slice(&(self.numrecs as u64).to_le_bytes());
        pre.extend_from_slice(&self.data_start.to_le_bytes());
        pre.extend_from_slice(&self.fixed_len.to_le_bytes());
        pre.extend_from_slice(&self.rec_block.to_le_bytes());
        self.write_at(0, &pre)?;
        self.write_at(PREAMBLE_LEN, &body)
    }
}

/// Visit each contiguous run of a row-major hyperslab as
/// `(flat element offset, elements in the run)`.
fn for_each_run(
    shape: &[usize],
    start: &[usize],
    count: &[usize],
    mut visit: impl FnMut(usize, usize) -> Result<()>,
) -> Result<()> {
    if count.contains(&0) {
        return Ok(());
    }
    let n = shape.len();
    if n == 0 {
        return visit(0, 1);
    }
    let mut strides = vec![1usize; n];
    for d in (0..n - 1).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    let row = count[n - 1];
    let mut idx = vec![0usize; n.saturating_sub(1)];
    loop {
        let mut flat = start[n - 1];
        for d in 0..n - 1 {
            flat += (start[d] + idx[d]) * strides[d];
        }
        visit(flat, row)?;
        // Odometer over the outer dimensions.
        let mut d = n.wrapping_sub(2);
        loop {
            if d == usize::MAX {
                return Ok(());
            }
            idx[d] += 1;
            if idx[d] < count[d] {
                break;
            }
            idx[d] = 0;
            d = d.wrapping_sub(1);
        }
    }
}

fn decode_body(body: &[u8]) -> Result<(Vec<Dim>, Vec<Var>, Vec<Att>)> {
    let mut r = MsgReader::new(body);
    let ndims = r.u32()? as usize;
    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        let name = r.str()?;
        let unlimited = r.bool()?;
        let len = r.u64()? as usize;
        dims.push(Dim { name, len, unlimited });
    }
    let nvars = r.u32()? as usize;
    let mut vars = Vec::with_capacity(nvars);
    for _ in 0..nvars {
        let name = r.str()?;
        let ty = PioType::from_tag(r.u8()?)
            .ok_or_else(|| PioError::Protocol("unknown type tag in header".into()))?;
        let dimids = r.usizes()?;
        let rec_var = r.bool()?;
        let rel_offset = r.u64()?;
        vars.push(Var { name, ty, dimids, rec_var, rel_offset });
    }
    let natts = r.u32()? as usize;
    let mut atts = Vec::with_capacity(natts);
    for _ in 0..natts {
        let owner = if r.bool()? { Some(r.u32()? as usize) } else { None };
        let name = r.str()?;
        let value = match r.u8()? {
            0 => AttValue::Text(r.str()?),
            1 => {
                let n = r.u32()? as usize;
                let mut ints = Vec::with_capacity(n);
                for _ in 0..n {
                    ints.push(r.u64()? as i64);
                }
                AttValue::Ints(ints)
            }
            _ => return Err(PioError::Protocol("unknown attribute kind".into())),
        };
        atts.push(Att { owner, name, value });
    }
    Ok((dims, vars, atts))
}

impl IoBackend for ClassicBackend {
    fn def_dim(&mut self, name: &str, len: DimLen) -> Result<usize> {
        if !self.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        if self.dims.iter().any(|d| d.name == name) {
            return Err(PioError::InvalidArg("dimension name already in use"));
        }
        let (len, unlimited) = match len {
            DimLen::Fixed(n) => (n, false),
            DimLen::Unlimited => {
                if self.dims.iter().any(|d| d.unlimited) {
                    return Err(PioError::InvalidArg("only one unlimited dimension allowed"));
                }
                (0, true)
            }
        };
        self.dims.push(Dim { name: name.to_string(), len, unlimited });
        Ok(self.dims.len() - 1)
    }

    fn def_var(&mut self, name: &str, ty: PioType, dimids: &[usize]) -> Result<usize> {
        if !self.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        if self.vars.iter().any(|v| v.name == name) {
            return Err(PioError::InvalidArg("variable name already in use"));
        }
        for (i, &d) in dimids.iter().enumerate() {
            let dim = self.dims.get(d).ok_or(PioError::BadDimId(d as i32))?;
            if dim.unlimited && i != 0 {
                return Err(PioError::InvalidArg(
                    "the unlimited dimension must come first",
                ));
            }
        }
        let rec_var = dimids.first().map(|&d| self.dims[d].unlimited).unwrap_or(false);
        self.vars.push(Var {
            name: name.to_string(),
            ty,
            dimids: dimids.to_vec(),
            rec_var,
            rel_offset: 0,
        });
        Ok(self.vars.len() - 1)
    }

    fn put_att(&mut self, owner: Option<usize>, name: &str, value: &AttValue) -> Result<()> {
        if !self.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        if let Some(v) = owner {
            self.var_checked(v)?;
        }
        if let Some(a) = self.atts.iter_mut().find(|a| a.owner == owner && a.name == name) {
            a.value = value.clone();
        } else {
            self.atts.push(Att { owner, name: name.to_string(), value: value.clone() });
        }
        Ok(())
    }

    fn get_att(&self, owner: Option<usize>, name: &str) -> Result<AttValue> {
        self.atts
            .iter()
            .find(|a| a.owner == owner && a.name == name)
            .map(|a| a.value.clone())
            .ok_or(PioError::Backend { code: -43, msg: format!("attribute {name} not found") })
    }

    fn enddef(&mut self) -> Result<()> {
        if !self.define_mode {
            return Err(PioError::NotInDefineMode);
        }
        let mut fixed_cursor = 0u64;
        let mut rec_cursor = 0u64;
        for i in 0..self.vars.len() {
            let shape = self.inner_shape(&self.vars[i]);
            let bytes = shape.iter().product::<usize>() as u64 * self.vars[i].ty.size() as u64;
            if self.vars[i].rec_var {
                self.vars[i].rel_offset = rec_cursor;
                rec_cursor += bytes;
            } else {
                self.vars[i].rel_offset = fixed_cursor;
                fixed_cursor += bytes;
            }
        }
        self.fixed_len = fixed_cursor;
        self.rec_block = rec_cursor;
        self.data_start = PREAMBLE_LEN + self.encode_body().len() as u64;
        if self.role == BackendRole::Root && self.writable {
            self.write_header()?;
        }
        self.define_mode = false;
        Ok(())
    }

    fn redef(&mut self) -> Result<()> {
        if self.define_mode {
            return Err(PioError::InDefineMode);
        }
        if self.data_written {
            return Err(PioError::InvalidArg(
                "cannot re-enter define mode after data has been written",
            ));
        }
        self.define_mode = true;
        Ok(())
    }

    fn num_dims(&self) -> usize {
        self.dims.len()
    }

    fn num_vars(&self) -> usize {
        self.vars.len()
    }

    fn dim_info(&self, dimid: usize) -> Result<(String, usize, bool)> {
        let d = self.dims.get(dimid).ok_or(PioError::BadDimId(dimid as i32))?;
        let len = if d.unlimited { self.numrecs } else { d.len };
        Ok((d.name.clone(), len, d.unlimited))
    }

    fn var_info(&self, varid: usize) -> Result<(String, PioType, Vec<usize>)> {
        let v = self.var_checked(varid)?;
        Ok((v.name.clone(), v.ty, v.dimids.clone()))
    }

    fn put_vara(&mut self, varid: usize, start: &[usize], count: &[usize], data: &[u8]) -> Result<()> {
        if self.define_mode {
            return Err(PioError::InDefineMode);
        }
        if !self.writable {
            return Err(PioError::ReadOnlyFile);
        }
        let v = self.var_checked(varid)?;
        let es = v.ty.size();
        let (recs, istart, icount) = self.split_request(v, start, count, false)?;
        let per_record: usize = icount.iter().product::<usize>() * es;
        if data.len() != per_record * recs.len() {
            return Err(PioError::InvalidArg("data length does not match count"));
        }
        let shape = self.inner_shape(v);
        let rec_var = v.rec_var;
        let bases: Vec<u64> = recs.clone().map(|r| self.base_offset(v, r)).collect();

        let mut cursor = 0usize;
        for base in bases {
            let mut writes: Vec<(u64, std::ops::Range<usize>)> = Vec::new();
            for_each_run(&shape, istart, icount, |flat, run| {
                let nbytes = run * es;
                writes.push((base + (flat * es) as u64, cursor..cursor + nbytes));
                cursor += nbytes;
                Ok(())
            })?;
            for (off, span) in writes {
                self.write_at(off, &data[span])?;
            }
        }
        if rec_var {
            self.numrecs = self.numrecs.max(recs.end);
        }
        self.data_written = true;
        Ok(())
    }

    fn get_vara(
        &mut self,
        varid: usize,
        start: &[usize],
        count: &[usize],
        out: &mut [u8],
    ) -> Result<()> {
        if self.define_mode {
            return Err(PioError::InDefineMode);
        }
        let v = self.var_checked(varid)?;
        let es = v.ty.size();
        let (recs, istart, icount) = self.split_request(v, start, count, true)?;
        let per_record: usize = icount.iter().product::<usize>() * es;
        if out.len() != per_record * recs.len() {
            return Err(PioError::InvalidArg("output length does not match count"));
        }
        let shape = self.inner_shape(v);
        let bases: Vec<u64> = recs.map(|r| self.base_offset(v, r)).collect();

        let mut cursor = 0usize;
        for base in bases {
            let mut reads: Vec<(u64, std::ops::Range<usize>)> = Vec::new();
            for_each_run(&shape, istart, icount, |flat, run| {
                let nbytes = run * es;
                reads.push((base + (flat * es) as u64, cursor..cursor + nbytes));
                cursor += nbytes;
                Ok(())
            })?;
            for (off, span) in reads {
                let mut chunk = vec![0u8; span.len()];
                self.read_at(off, &mut chunk)?;
                out[span].copy_from_slice(&chunk);
            }
        }
        Ok(())
    }

    fn iput_vara(
        &mut self,
        varid: usize,
        start: Vec<usize>,
        count: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<u64> {
        if self.define_mode {
            return Err(PioError::InDefineMode);
        }
        if !self.writable {
            return Err(PioError::ReadOnlyFile);
        }
        self.var_checked(varid)?;
        let req = self.next_req;
        self.next_req += 1;
        self.pending.push(PendingPut { req, varid, start, count, data });
        Ok(req)
    }

    fn wait_all(&mut self, reqs: &[u64]) -> Result<()> {
        let (ready, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|p| reqs.contains(&p.req));
        self.pending = rest;
        for p in ready {
            self.put_vara(p.varid, &p.start, &p.count, &p.data)?;
        }
        Ok(())
    }

    fn numrecs(&self) -> usize {
        self.numrecs
    }

    fn set_numrecs(&mut self, n: usize) -> Result<()> {
        self.numrecs = self.numrecs.max(n);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush_pending()?;
        if self.role == BackendRole::Root && self.writable && !self.define_mode {
            let numrecs = (self.numrecs as u64).to_le_bytes();
            self.write_at(NUMRECS_OFFSET, &numrecs)?;
        }
        self.file.sync_all().map_err(PioError::from_io)
    }

    fn close(&mut self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.par").to_string_lossy().into_owned();
        (dir, path)
    }

    #[test]
    fn fixed_var_roundtrip_through_reopen() {
        let (_d, path) = tmp();
        let mut b = ClassicBackend::create(&path, true, BackendRole::Root).unwrap();
        let x = b.def_dim("x", DimLen::Fixed(6)).unwrap();
        let v = b.def_var("data", PioType::Int, &[x]).unwrap();
        b.put_att(None, "title", &AttValue::Text("t".into())).unwrap();
        b.enddef().unwrap();
        let vals: Vec<i32> = (0..6).collect();
        b.put_vara(v, &[0], &[6], bytemuck::cast_slice(&vals)).unwrap();
        b.sync().unwrap();
        b.close().unwrap();

        let mut b = ClassicBackend::open(&path, false, BackendRole::Root).unwrap();
        assert_eq!(b.num_dims(), 1);
        assert_eq!(b.num_vars(), 1);
        assert_eq!(b.get_att(None, "title").unwrap(), AttValue::Text("t".into()));
        let mut out = vec![0i32; 6];
        b.get_vara(v, &[0], &[6], bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, vals);
    }

    #[test]
    fn hyperslab_in_2d_var() {
        let (_d, path) = tmp();
        let mut b = ClassicBackend::create(&path, true, BackendRole::Root).unwrap();
        let r = b.def_dim("r", DimLen::Fixed(4)).unwrap();
        let c = b.def_dim("c", DimLen::Fixed(4)).unwrap();
        let v = b.def_var("m", PioType::Int, &[r, c]).unwrap();
        b.enddef().unwrap();

        // Write the 2x2 lower-right corner.
        let patch: Vec<i32> = vec![1, 2, 3, 4];
        b.put_vara(v, &[2, 2], &[2, 2], bytemuck::cast_slice(&patch)).unwrap();

        let mut all = vec![0i32; 16];
        b.get_vara(v, &[0, 0], &[4, 4], bytemuck::cast_slice_mut(&mut all)).unwrap();
        assert_eq!(all[10], 1);
        assert_eq!(all[11], 2);
        assert_eq!(all[14], 3);
        assert_eq!(all[15], 4);
        assert_eq!(all[0], 0);
    }

    #[test]
    fn record_vars_interleave_and_grow() {
        let (_d, path) = tmp();
        let mut b = ClassicBackend::create(&path, true, BackendRole::Root).unwrap();
        let t = b.def_dim("time", DimLen::Unlimited).unwrap();
        let x = b.def_dim("x", DimLen::Fixed(3)).unwrap();
        let a = b.def_var("a", PioType::Double, &[t, x]).unwrap();
        let bvar = b.def_var("b", PioType::Double, &[t, x]).unwrap();
        b.enddef().unwrap();

        for rec in 0..2 {
            let av: Vec<f64> = (0..3).map(|i| (rec * 10 + i) as f64).collect();
            let bv: Vec<f64> = (0..3).map(|i| (rec * 10 + i) as f64 + 0.5).collect();
            b.put_vara(a, &[rec, 0], &[1, 3], bytemuck::cast_slice(&av)).unwrap();
            b.put_vara(bvar, &[rec, 0], &[1, 3], bytemuck::cast_slice(&bv)).unwrap();
        }
        assert_eq!(b.numrecs(), 2);
        b.sync().unwrap();

        let mut out = vec![0f64; 3];
        b.get_vara(bvar, &[1, 0], &[1, 3], bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, vec![10.5, 11.5, 12.5]);
    }

    #[test]
    fn iput_defers_until_wait() {
        let (_d, path) = tmp();
        let mut b = ClassicBackend::create(&path, true, BackendRole::Root).unwrap();
        let x = b.def_dim("x", DimLen::Fixed(2)).unwrap();
        let v = b.def_var("v", PioType::Short, &[x]).unwrap();
        b.enddef().unwrap();

        let req = b
            .iput_vara(v, vec![0], vec![2], bytemuck::cast_slice::<i16, u8>(&[7, 8]).to_vec())
            .unwrap();
        let mut out = vec![0i16; 2];
        b.get_vara(v, &[0], &[2], bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, vec![0; 2]);

        b.wait_all(&[req]).unwrap();
        b.get_vara(v, &[0], &[2], bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, vec![7i16, 8]);
    }

    #[test]
    fn bounds_and_mode_errors() {
        let (_d, path) = tmp();
        let mut b = ClassicBackend::create(&path, true, BackendRole::Root).unwrap();
        let x = b.def_dim("x", DimLen::Fixed(4)).unwrap();
        let v = b.def_var("v", PioType::Int, &[x]).unwrap();
        assert_eq!(
            b.put_vara(v, &[0], &[1], &[0; 4]).unwrap_err(),
            PioError::InDefineMode
        );
        b.enddef().unwrap();
        assert_eq!(b.put_vara(v, &[2], &[3], &[0; 12]).unwrap_err(), PioError::Edge);
        assert_eq!(b.def_dim("y", DimLen::Fixed(1)).unwrap_err(), PioError::NotInDefineMode);
    }
}
