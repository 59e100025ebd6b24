//! Distributed-array reads and writes.
//!
//! A `write_darray` does not touch the file: the array lands in the
//! file's multi-buffer, keyed by decomposition and record-ness, so
//! successive writes of variables sharing one decomposition cost a
//! single rearrangement and one backend call per region per variable.
//! The buffer drains when another decomposition is targeted, when the
//! queued bytes exceed the context's budget, on explicit flush, and on
//! sync/close.
//!
//! The rearrangement itself packs per-destination byte buffers from the
//! caller's arrays (through the decomposition's sort permutation), moves
//! them with the flow-controlled exchange, and scatters into the IO
//! buffer through the receive plan; reads run the same plan backwards.

use std::sync::Arc;

use crate::context::{IoId, Ncid, PioContext, VarId};
use crate::decomp::swap::{swapm, Direction};
use crate::decomp::Decomp;
use crate::decomp::Rearranger;
use crate::dispatch::MsgCode;
use crate::error::{PioError, Result};
use crate::file::{FileDesc, RegionGet, RegionPut};
use crate::iosystem::IoSystem;
use crate::types::Element;
use crate::wire::{MsgReader, MsgWriter};

/// Pending writes sharing one decomposition (and record-ness).
pub(crate) struct MultiBuf {
    pub ioid: i32,
    pub rec_var: bool,
    pub arraylen: usize,
    pub vids: Vec<VarId>,
    pub frames: Vec<usize>,
    pub fills: Vec<Option<Vec<u8>>>,
    /// Concatenated array bytes, one block per queued variable.
    pub data: Vec<u8>,
}

impl MultiBuf {
    fn num_arrays(&self) -> usize {
        self.vids.len()
    }
}

impl PioContext {
    /// Queue one distributed array for writing. The data is aggregated
    /// with other writes sharing `ioid` and flushed later (see module
    /// docs). Collective over the IO system.
    ///
    /// # Errors
    /// `ReadOnlyDecomp` when the map contains duplicates;
    /// `ArrayLenMismatch` unless `array.len()` equals the map length;
    /// `TypeMismatch` unless `T` matches both variable and decomposition.
    pub fn write_darray<T: Element>(
        &self,
        ncid: Ncid,
        varid: VarId,
        ioid: IoId,
        array: &[T],
        fill: Option<T>,
    ) -> Result<()> {
        let (ios, file) = self.file_system(ncid)?;
        let d = self.decomp(ioid)?;
        if T::PIO_TYPE != d.element_type() {
            return Err(PioError::TypeMismatch { var: d.element_type(), data: T::PIO_TYPE });
        }
        let mut f = file.lock();
        validate_darray_args(&f, &d, varid, true)?;
        if ios.compproc && array.len() != d.maplen() {
            return Err(PioError::ArrayLenMismatch { expected: d.maplen(), got: array.len() });
        }

        // Targeting a different decomposition drains what is queued.
        let stale: Vec<(i32, bool)> = f
            .multibufs
            .keys()
            .filter(|k| k.0 != ioid.raw())
            .copied()
            .collect();
        for key in stale {
            self.flush_multibuf(&ios, &mut f, key, false)?;
        }

        let rec_var = f.var(varid)?.rec_var;
        let frame = f.var(varid)?.record;
        let var_fill = {
            let var = f.var(varid)?;
            if var.use_fill { var.fill.clone() } else { None }
        };
        let fill_bytes = fill
            .map(|v| bytemuck::bytes_of(&v).to_vec())
            .or(var_fill);

        let key = (ioid.raw(), rec_var);
        let buf = f.multibufs.entry(key).or_insert_with(|| MultiBuf {
            ioid: ioid.raw(),
            rec_var,
            arraylen: array.len(),
            vids: Vec::new(),
            frames: Vec::new(),
            fills: Vec::new(),
            data: Vec::new(),
        });
        if buf.arraylen != array.len() {
            return Err(PioError::ArrayLenMismatch { expected: buf.arraylen, got: array.len() });
        }
        buf.vids.push(varid);
        buf.frames.push(frame);
        buf.fills.push(fill_bytes);
        buf.data.extend_from_slice(bytemuck::cast_slice(array));
        let queued = buf.num_arrays();

        // The flush decision must match on every task, so it is based on
        // the agreed IO-side buffer bound, not the local array length.
        let projected = queued * d.maxiobuflen * d.ty.size();
        if projected >= self.buffer_limit() {
            self.flush_multibuf(&ios, &mut f, key, false)?;
        }
        Ok(())
    }

    /// Write several variables sharing a decomposition in one shot,
    /// bypassing aggregation. Collective over the IO system.
    pub fn write_darray_multi<T: Element>(
        &self,
        ncid: Ncid,
        varids: &[VarId],
        ioid: IoId,
        arrays: &[&[T]],
        frames: &[usize],
        fills: &[Option<T>],
        flush_to_disk: bool,
    ) -> Result<()> {
        if varids.len() != arrays.len()
            || varids.len() != frames.len()
            || varids.len() != fills.len()
        {
            return Err(PioError::InvalidArg("per-variable argument lengths differ"));
        }
        let (ios, file) = self.file_system(ncid)?;
        let d = self.decomp(ioid)?;
        if T::PIO_TYPE != d.element_type() {
            return Err(PioError::TypeMismatch { var: d.element_type(), data: T::PIO_TYPE });
        }
        let mut f = file.lock();
        for (v, a) in varids.iter().zip(arrays) {
            validate_darray_args(&f, &d, *v, true)?;
            if ios.compproc && a.len() != d.maplen() {
                return Err(PioError::ArrayLenMismatch { expected: d.maplen(), got: a.len() });
            }
        }
        let mut data = Vec::with_capacity(arrays.iter().map(|a| a.len()).sum::<usize>() * d.ty.size());
        for a in arrays {
            data.extend_from_slice(bytemuck::cast_slice(a));
        }
        let fills: Vec<Option<Vec<u8>>> = fills
            .iter()
            .map(|o| o.map(|v| bytemuck::bytes_of(&v).to_vec()))
            .collect();
        self.write_collective(&ios, &mut f, &d, varids, frames, &fills, &data, flush_to_disk)
    }

    /// Drain every multi-buffer of the file. Collective.
    pub(crate) fn flush_file_bufs(&self, ncid: Ncid, flush_to_disk: bool) -> Result<()> {
        let (ios, file) = self.file_system(ncid)?;
        let mut f = file.lock();
        let keys: Vec<(i32, bool)> = f.multibufs.keys().copied().collect();
        for key in keys {
            self.flush_multibuf(&ios, &mut f, key, flush_to_disk)?;
        }
        Ok(())
    }

    fn flush_multibuf(
        &self,
        ios: &Arc<IoSystem>,
        f: &mut FileDesc,
        key: (i32, bool),
        flush_to_disk: bool,
    ) -> Result<()> {
        let Some(buf) = f.multibufs.remove(&key) else {
            return Ok(());
        };
        if buf.num_arrays() == 0 {
            return Ok(());
        }
        let d = self.decomp(IoId(buf.ioid))?;
        log::debug!(
            "flush_multibuf: ncid={} ioid={} nvars={} rec_var={}",
            f.ncid.raw(),
            buf.ioid,
            buf.num_arrays(),
            buf.rec_var
        );
        self.write_collective(ios, f, &d, &buf.vids, &buf.frames, &buf.fills, &buf.data, flush_to_disk)
    }

    /// The shared write path: forward to the IO side when async, then
    /// rearrange once and emit one backend put per region per variable.
    #[allow(clippy::too_many_arguments)]
    fn write_collective(
        &self,
        ios: &Arc<IoSystem>,
        f: &mut FileDesc,
        d: &Decomp,
        vids: &[VarId],
        frames: &[usize],
        fills: &[Option<Vec<u8>>],
        data: &[u8],
        flush_to_disk: bool,
    ) -> Result<()> {
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(f.ncid.raw());
            w.put_i32(d.id().raw());
            w.put_u32(vids.len() as u32);
            for v in vids {
                w.put_i32(v.0);
            }
            w.put_usizes(frames);
            for fill in fills {
                w.put_opt_bytes(fill.as_deref());
            }
            w.put_bool(flush_to_disk);
            self.forward_async(ios, MsgCode::WriteDarrayMulti, &w.finish())?;
        }
        let policy = ios.policy(f.error_policy);
        let local = self.write_collective_local(ios, f, d, vids, frames, fills, data, flush_to_disk);
        ios.conclude(policy, local)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_collective_local(
        &self,
        ios: &Arc<IoSystem>,
        f: &mut FileDesc,
        d: &Decomp,
        vids: &[VarId],
        frames: &[usize],
        fills: &[Option<Vec<u8>>],
        data: &[u8],
        flush_to_disk: bool,
    ) -> Result<()> {
        if f.define_mode {
            return Err(PioError::InDefineMode);
        }
        let es = d.ty.size();
        let nvars = vids.len();
        let arraylen = d.maplen();
        let llen = d.llen();

        // One rearrangement for the whole multi-buffer.
        f.rearranges += 1;
        let comm = d.exchange_comm(ios);
        let mut sends: Vec<Option<Vec<u8>>> = (0..comm.size()).map(|_| None).collect();
        for g in d.send_plan() {
            let mut out = Vec::with_capacity(g.elems.len() * nvars * es);
            for v in 0..nvars {
                let block = &data[v * arraylen * es..(v + 1) * arraylen * es];
                for &i in &g.elems {
                    let u = d.user_index(i);
                    out.extend_from_slice(&block[u * es..(u + 1) * es]);
                }
            }
            sends[g.dest] = Some(out);
        }
        let mut recv_sizes: Vec<Option<usize>> = (0..comm.size()).map(|_| None).collect();
        for g in d.recv_plan() {
            recv_sizes[g.src] = Some(g.pos.len() * nvars * es);
        }
        let opts = d.rearr_opts().effective(Direction::Comp2Io);
        let received = swapm(
            comm.as_ref(),
            sends,
            &recv_sizes,
            crate::comm::tags::DATA_C2I,
            opts,
        )?;

        // Scatter into the IO buffer, fill first for the box rearranger.
        let mut puts: Vec<RegionPut> = Vec::new();
        if ios.ioproc {
            let mut iobuf = vec![0u8; llen * nvars * es];
            if d.needs_fill() && d.rearranger() == Rearranger::Box {
                for v in 0..nvars {
                    let fill = fill_of(fills, v, d);
                    for e in 0..llen {
                        iobuf[(v * llen + e) * es..(v * llen + e + 1) * es]
                            .copy_from_slice(&fill);
                    }
                }
            }
            for g in d.recv_plan() {
                let chunk = received[g.src]
                    .as_ref()
                    .ok_or_else(|| PioError::Comm(format!("no data from rank {}", g.src)))?;
                for v in 0..nvars {
                    for (k, &p) in g.pos.iter().enumerate() {
                        let src = (v * g.pos.len() + k) * es;
                        let dst = (v * llen + p) * es;
                        iobuf[dst..dst + es].copy_from_slice(&chunk[src..src + es]);
                    }
                }
            }

            for (v, &vid) in vids.iter().enumerate() {
                let var = f.var(vid)?;
                let rec = var.rec_var;
                for region in d.regions() {
                    let (mut start, mut count) = (region.start.clone(), region.count.clone());
                    if rec {
                        start.insert(0, frames[v]);
                        count.insert(0, 1);
                    }
                    let lo = (v * llen + region.loffset) * es;
                    puts.push(RegionPut {
                        varid: vid.0 as usize,
                        start,
                        count,
                        data: iobuf[lo..lo + region.len() * es].to_vec(),
                    });
                }
                if d.needs_fill() && d.rearranger() == Rearranger::Subset {
                    let fill = fill_of(fills, v, d);
                    for region in d.fill_regions() {
                        let (mut start, mut count) = (region.start.clone(), region.count.clone());
                        if rec {
                            start.insert(0, frames[v]);
                            count.insert(0, 1);
                        }
                        puts.push(RegionPut {
                            varid: vid.0 as usize,
                            start,
                            count,
                            data: fill.repeat(region.len()),
                        });
                    }
                }
            }
        }
        self.submit_region_puts(ios, f, puts)?;

        for (v, &vid) in vids.iter().enumerate() {
            if f.var(vid)?.rec_var {
                f.numrecs = f.numrecs.max(frames[v] + 1);
            }
        }

        if flush_to_disk {
            if let Some(b) = f.backend.as_mut() {
                let pending: Vec<u64> =
                    f.vars.iter().flat_map(|v| v.pending.iter().copied()).collect();
                b.wait_all(&pending)?;
            }
            for v in &mut f.vars {
                v.pending.clear();
            }
        }
        Ok(())
    }

    /// Read a distributed array: IO tasks read their regions and the
    /// rearranger runs backwards. Hole positions of the map are left
    /// untouched in `out`. Collective over the IO system.
    pub fn read_darray<T: Element>(
        &self,
        ncid: Ncid,
        varid: VarId,
        ioid: IoId,
        out: &mut [T],
    ) -> Result<()> {
        // Writes queued on this file must land first so the read sees
        // this program's own data.
        self.flush_file_bufs(ncid, false)?;

        let (ios, file) = self.file_system(ncid)?;
        let d = self.decomp(ioid)?;
        if T::PIO_TYPE != d.element_type() {
            return Err(PioError::TypeMismatch { var: d.element_type(), data: T::PIO_TYPE });
        }
        let mut f = file.lock();
        validate_darray_args(&f, &d, varid, false)?;
        if ios.compproc && out.len() != d.maplen() {
            return Err(PioError::ArrayLenMismatch { expected: d.maplen(), got: out.len() });
        }

        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(ncid.raw());
            w.put_i32(varid.0);
            w.put_i32(ioid.raw());
            self.forward_async(&ios, MsgCode::ReadDarray, &w.finish())?;
        }
        let policy = ios.policy(f.error_policy);
        let local = self.read_collective_local(&ios, &mut f, &d, varid, bytemuck::cast_slice_mut(out));
        ios.conclude(policy, local)
    }

    fn read_collective_local(
        &self,
        ios: &Arc<IoSystem>,
        f: &mut FileDesc,
        d: &Decomp,
        varid: VarId,
        out: &mut [u8],
    ) -> Result<()> {
        if f.define_mode {
            return Err(PioError::InDefineMode);
        }
        let es = d.ty.size();
        let llen = d.llen();
        let (rec, frame) = {
            let var = f.var(varid)?;
            (var.rec_var, var.record)
        };

        // IO side pulls its regions into the IO buffer.
        let mut iobuf = vec![0u8; llen * es];
        if ios.ioproc {
            let mut gets = Vec::new();
            for region in d.regions() {
                let (mut start, mut count) = (region.start.clone(), region.count.clone());
                if rec {
                    start.insert(0, frame);
                    count.insert(0, 1);
                }
                gets.push(RegionGet { varid: varid.0 as usize, start, count });
            }
            let chunks = self.submit_region_gets(ios, f, gets)?;
            for (region, chunk) in d.regions().iter().zip(chunks) {
                let lo = region.loffset * es;
                iobuf[lo..lo + chunk.len()].copy_from_slice(&chunk);
            }
        }

        // Run the plan backwards: IO tasks send, compute tasks receive.
        let comm = d.exchange_comm(ios);
        let mut sends: Vec<Option<Vec<u8>>> = (0..comm.size()).map(|_| None).collect();
        for g in d.recv_plan() {
            let mut out_buf = Vec::with_capacity(g.pos.len() * es);
            for &p in &g.pos {
                out_buf.extend_from_slice(&iobuf[p * es..(p + 1) * es]);
            }
            sends[g.src] = Some(out_buf);
        }
        let mut recv_sizes: Vec<Option<usize>> = (0..comm.size()).map(|_| None).collect();
        for g in d.send_plan() {
            recv_sizes[g.dest] = Some(g.elems.len() * es);
        }
        let opts = d.rearr_opts().effective(Direction::Io2Comp);
        let received = swapm(
            comm.as_ref(),
            sends,
            &recv_sizes,
            crate::comm::tags::DATA_I2C,
            opts,
        )?;

        for g in d.send_plan() {
            let chunk = received[g.dest]
                .as_ref()
                .ok_or_else(|| PioError::Comm(format!("no data from rank {}", g.dest)))?;
            for (k, &i) in g.elems.iter().enumerate() {
                let u = d.user_index(i);
                out[u * es..(u + 1) * es].copy_from_slice(&chunk[k * es..(k + 1) * es]);
            }
        }
        Ok(())
    }

    // ---- async handlers (IO side) -----------------------------------

    pub(crate) fn handle_write_darray_multi_msg(
        &self,
        ios: &Arc<IoSystem>,
        args: &[u8],
    ) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        let ioid = IoId(r.i32()?);
        let nvars = r.u32()? as usize;
        let mut vids = Vec::with_capacity(nvars);
        for _ in 0..nvars {
            vids.push(VarId(r.i32()?));
        }
        let frames = r.usizes()?;
        let mut fills = Vec::with_capacity(nvars);
        for _ in 0..nvars {
            fills.push(r.opt_bytes()?.map(|b| b.to_vec()));
        }
        let flush_to_disk = r.bool()?;

        let file = self.file(ncid)?;
        let d = self.decomp(ioid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        let local = self.write_collective_local(
            ios,
            &mut f,
            &d,
            &vids,
            &frames,
            &fills,
            &[],
            flush_to_disk,
        );
        ios.conclude(policy, local)
    }

    pub(crate) fn handle_read_darray_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let ncid = Ncid(r.i32()?);
        let varid = VarId(r.i32()?);
        let ioid = IoId(r.i32()?);
        let file = self.file(ncid)?;
        let d = self.decomp(ioid)?;
        let mut f = file.lock();
        let policy = ios.policy(f.error_policy);
        let local = self.read_collective_local(ios, &mut f, &d, varid, &mut []);
        ios.conclude(policy, local)
    }
}

/// Argument checks shared by the write and read entry points.
fn validate_darray_args(f: &FileDesc, d: &Decomp, varid: VarId, writing: bool) -> Result<()> {
    if writing && !f.writable {
        return Err(PioError::ReadOnlyFile);
    }
    if writing && d.read_only() {
        return Err(PioError::ReadOnlyDecomp);
    }
    let var = f.var(varid)?;
    if var.ty != d.element_type() {
        return Err(PioError::TypeMismatch { var: var.ty, data: d.element_type() });
    }
    let ndims = var.dimids.len() - usize::from(var.rec_var);
    if ndims != d.gdimlen().len() {
        return Err(PioError::VarDimMismatch { expected: d.gdimlen().len(), got: ndims });
    }
    let shape = f.var_inner_shape(var);
    if shape != d.gdimlen() {
        return Err(PioError::InvalidArg("variable shape does not match the decomposition"));
    }
    Ok(())
}

fn fill_of(fills: &[Option<Vec<u8>>], v: usize, d: &Decomp) -> Vec<u8> {
    fills
        .get(v)
        .and_then(|o| o.clone())
        .unwrap_or_else(|| d.element_type().default_fill())
}
