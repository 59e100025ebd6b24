//! Decomposition persistence.
//!
//! A decomposition is saved to a small self-describing file: global
//! sizes, one map row per participating task (right-padded with zeros),
//! and provenance attributes. Maps are gathered to the compute root,
//! which writes the file directly through the classic backend; reading
//! is the mirror image, ending in a normal [`PioContext::init_decomp`]
//! so the rearranger plan is rebuilt rather than deserialized.

use crate::comm::collective;
use crate::context::{IoId, IosysId, PioContext};
use crate::decomp::Rearranger;
use crate::error::{PioError, Result};
use crate::file::backend::{AttValue, BackendRole, DimLen, IoBackend};
use crate::file::classic::ClassicBackend;
use crate::types::PioType;
use crate::wire::{MsgReader, MsgWriter};

const ATT_VERSION: &str = "version";
const ATT_MAX_MAPLEN: &str = "max_maplen";
const ATT_TITLE: &str = "title";
const ATT_HISTORY: &str = "history";
const ATT_SOURCE: &str = "source";
const ATT_BACKTRACE: &str = "backtrace";
const ATT_ORDER: &str = "array_order";
const ATT_REARRANGER: &str = "rearranger";
const DIM_DIMS: &str = "dims";
const DIM_TASK: &str = "task";
const DIM_MAPELEM: &str = "map_element";
const VAR_GLOBAL_SIZE: &str = "global_size";
const VAR_MAPLEN: &str = "maplen";
const VAR_MAP: &str = "map";

impl PioContext {
    /// Persist a decomposition. Collective over the compute tasks; the
    /// compute root writes the file.
    pub fn write_nc_decomp(
        &self,
        iosysid: IosysId,
        path: &str,
        ioid: IoId,
        title: Option<&str>,
        history: Option<&str>,
        fortran_order: bool,
    ) -> Result<()> {
        let ios = self.iosystem(iosysid)?;
        let d = self.decomp(ioid)?;
        let comp = ios
            .comp_comm
            .as_ref()
            .ok_or(PioError::InvalidArg("write_nc_decomp is a compute-side call"))?;

        let mut contribution = MsgWriter::new();
        contribution.put_u64s(d.map());
        let gathered = collective::gather(comp.as_ref(), 0, &contribution.finish())?;

        let status = if let Some(parts) = gathered {
            write_decomp_file(path, &d, &parts, title, history, fortran_order)
        } else {
            Ok(())
        };
        // The root's verdict reaches everyone.
        let status_byte = [status.is_err() as u8];
        let verdict = collective::bcast(
            comp.as_ref(),
            0,
            if comp.rank() == 0 {
                Some(&status_byte[..])
            } else {
                None
            },
        )?;
        status?;
        if verdict[0] != 0 {
            return Err(PioError::FileIo("decomposition write failed on the root".into()));
        }
        Ok(())
    }

    /// Load a decomposition file and initialize an equivalent
    /// decomposition. Collective over the compute tasks.
    pub fn read_nc_decomp(&self, iosysid: IosysId, path: &str, ty: PioType) -> Result<IoId> {
        let ios = self.iosystem(iosysid)?;
        let comp = ios
            .comp_comm
            .as_ref()
            .ok_or(PioError::InvalidArg("read_nc_decomp is a compute-side call"))?
            .clone();

        let summary = if comp.rank() == 0 {
            Some(read_decomp_file(path)?)
        } else {
            None
        };
        let raw = collective::bcast(comp.as_ref(), 0, summary.as_deref())?;
        let mut r = MsgReader::new(&raw);
        let gdims = r.usizes()?;
        let ntasks = r.u32()? as usize;
        let rearranger = Rearranger::from_tag(r.u8()?)
            .ok_or_else(|| PioError::Protocol("unknown rearranger in decomposition file".into()))?;
        if ntasks != comp.size() {
            return Err(PioError::InvalidArg(
                "decomposition file was written by a different task count",
            ));
        }
        let mut my_map = Vec::new();
        for t in 0..ntasks {
            let maplen = r.u32()? as usize;
            let row = r.u64s()?;
            if t == comp.rank() {
                my_map = row[..maplen].to_vec();
            }
        }

        self.init_decomp(iosysid, ty, &gdims, &my_map, Some(rearranger), None, None)
    }
}

fn write_decomp_file(
    path: &str,
    d: &crate::decomp::Decomp,
    parts: &[Vec<u8>],
    title: Option<&str>,
    history: Option<&str>,
    fortran_order: bool,
) -> Result<()> {
    let mut maps = Vec::with_capacity(parts.len());
    for p in parts {
        maps.push(MsgReader::new(p).u64s()?);
    }
    let max_maplen = maps.iter().map(|m| m.len()).max().unwrap_or(0);

    let mut b = ClassicBackend::create(path, true, BackendRole::Root)?;
    let dim_dims = b.def_dim(DIM_DIMS, DimLen::Fixed(d.gdimlen().len()))?;
    let dim_task = b.def_dim(DIM_TASK, DimLen::Fixed(maps.len()))?;
    let dim_elem = b.def_dim(DIM_MAPELEM, DimLen::Fixed(max_maplen.max(1)))?;
    let v_gsize = b.def_var(VAR_GLOBAL_SIZE, PioType::Int64, &[dim_dims])?;
    let v_maplen = b.def_var(VAR_MAPLEN, PioType::Int64, &[dim_task])?;
    let v_map = b.def_var(VAR_MAP, PioType::Int64, &[dim_task, dim_elem])?;

    b.put_att(None, ATT_VERSION, &AttValue::Text(env!("CARGO_PKG_VERSION").to_string()))?;
    b.put_att(None, ATT_MAX_MAPLEN, &AttValue::Ints(vec![max_maplen as i64]))?;
    b.put_att(None, ATT_TITLE, &AttValue::Text(title.unwrap_or("").to_string()))?;
    b.put_att(None, ATT_HISTORY, &AttValue::Text(history.unwrap_or("").to_string()))?;
    b.put_att(None, ATT_SOURCE, &AttValue::Text("Decomposition written by pario.".to_string()))?;
    b.put_att(None, ATT_BACKTRACE, &AttValue::Text("".to_string()))?;
    b.put_att(
        None,
        ATT_ORDER,
        &AttValue::Text(if fortran_order { "Fortran" } else { "C" }.to_string()),
    )?;
    b.put_att(
        None,
        ATT_REARRANGER,
        &AttValue::Text(
            match d.rearranger() {
                Rearranger::Box => "box",
                Rearranger::Subset => "subset",
            }
            .to_string(),
        ),
    )?;
    b.enddef()?;

    let gsize: Vec<i64> = d.gdimlen().iter().map(|&g| g as i64).collect();
    b.put_vara(v_gsize, &[0], &[gsize.len()], bytemuck::cast_slice(&gsize))?;
    let maplens: Vec<i64> = maps.iter().map(|m| m.len() as i64).collect();
    b.put_vara(v_maplen, &[0], &[maplens.len()], bytemuck::cast_slice(&maplens))?;
    for (t, m) in maps.iter().enumerate() {
        let mut row: Vec<i64> = m.iter().map(|&v| v as i64).collect();
        row.resize(max_maplen.max(1), 0);
        b.put_vara(v_map, &[t, 0], &[1, row.len()], bytemuck::cast_slice(&row))?;
    }
    b.close()
}

fn read_decomp_file(path: &str) -> Result<Vec<u8>> {
    let mut b = ClassicBackend::open(path, false, BackendRole::Root)?;
    let order = match b.get_att(None, ATT_ORDER) {
        Ok(AttValue::Text(t)) => t,
        _ => "C".to_string(),
    };
    if order != "C" && order != "Fortran" {
        return Err(PioError::Protocol(format!("unknown array order {order:?}")));
    }
    let rearranger = match b.get_att(None, ATT_REARRANGER) {
        Ok(AttValue::Text(t)) if t == "subset" => Rearranger::Subset,
        _ => Rearranger::Box,
    };

    let mut dims_by_name = std::collections::HashMap::new();
    for i in 0..b.num_dims() {
        let (name, len, _) = b.dim_info(i)?;
        dims_by_name.insert(name, len);
    }
    let ndims = *dims_by_name
        .get(DIM_DIMS)
        .ok_or_else(|| PioError::Protocol("missing dims dimension".into()))?;
    let ntasks = *dims_by_name
        .get(DIM_TASK)
        .ok_or_else(|| PioError::Protocol("missing task dimension".into()))?;
    let max_maplen = *dims_by_name
        .get(DIM_MAPELEM)
        .ok_or_else(|| PioError::Protocol("missing map_element dimension".into()))?;

    let var_by_name = |b: &ClassicBackend, name: &str| -> Result<usize> {
        for v in 0..b.num_vars() {
            if b.var_info(v)?.0 == name {
                return Ok(v);
            }
        }
        Err(PioError::Protocol(format!("missing variable {name}")))
    };
    let v_gsize = var_by_name(&b, VAR_GLOBAL_SIZE)?;
    let v_maplen = var_by_name(&b, VAR_MAPLEN)?;
    let v_map = var_by_name(&b, VAR_MAP)?;

    let mut gsize = vec![0u8; ndims * 8];
    b.get_vara(v_gsize, &[0], &[ndims], &mut gsize)?;
    let gdims: Vec<usize> = gsize
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()) as usize)
        .collect();

    let mut maplens = vec![0u8; ntasks * 8];
    b.get_vara(v_maplen, &[0], &[ntasks], &mut maplens)?;
    let maplens: Vec<usize> = maplens
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()) as usize)
        .collect();

    let mut w = MsgWriter::new();
    w.put_usizes(&gdims);
    w.put_u32(ntasks as u32);
    w.put_u8(rearranger.tag());
    for (t, &maplen) in maplens.iter().enumerate() {
        let mut row = vec![0u8; max_maplen * 8];
        b.get_vara(v_map, &[t, 0], &[1, max_maplen], &mut row)?;
        let row: Vec<u64> = row
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()) as u64)
            .collect();
        w.put_u32(maplen as u32);
        w.put_u64s(&row);
    }
    Ok(w.finish())
}
