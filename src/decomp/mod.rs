//! Decompositions: how a logical global N-D array is split over tasks.
//!
//! A decomposition captures one task's one-based offsets into the global
//! array (`map`, 0 marking a hole), plus everything derived from it: the
//! sort permutation, the read-only and fill flags, the chosen rearranger,
//! the per-IO-task hyperslab regions, and the communication plan the
//! rearrangers execute at read/write time.

pub mod box_rearr;
pub mod region;
pub mod subset_rearr;
pub mod swap;

use std::sync::Arc;

use crate::comm::{collective, Comm};
use crate::context::{IoId, IosysId, PioContext};
use crate::dispatch::MsgCode;
use crate::error::{PioError, Result};
use crate::iosystem::IoSystem;
use crate::types::PioType;
use crate::wire::{MsgReader, MsgWriter};
use region::Region;
use swap::RearrOpts;

/// Which rearranger plans the compute/IO data shuffle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Rearranger {
    /// Each IO task owns one contiguous rectangular region.
    Box,
    /// Each IO task serves a fixed subset of compute tasks and owns
    /// whatever they hold, coalesced into regions.
    Subset,
}

impl Rearranger {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Rearranger::Box => 1,
            Rearranger::Subset => 2,
        }
    }

    pub(crate) fn from_tag(t: u8) -> Option<Self> {
        match t {
            1 => Some(Rearranger::Box),
            2 => Some(Rearranger::Subset),
            _ => None,
        }
    }
}

/// Elements this task sends to one destination during a write: positions
/// into the (sorted) map, grouped in transfer order.
#[derive(Clone, Debug)]
pub(crate) struct SendGroup {
    /// Destination rank in the exchange communicator.
    pub dest: usize,
    /// Sorted-map positions of the elements, in wire order.
    pub elems: Vec<usize>,
}

/// Elements this IO task receives from one source during a write: the
/// IO-buffer position of each incoming element, in wire order.
#[derive(Clone, Debug)]
pub(crate) struct RecvGroup {
    /// Source rank in the exchange communicator.
    pub src: usize,
    /// IO-buffer element positions; duplicates appear for read-only maps.
    pub pos: Vec<usize>,
}

impl std::fmt::Debug for Decomp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decomp").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A decomposition descriptor (one per task of the IO system).
pub struct Decomp {
    pub(crate) id: IoId,
    pub(crate) iosysid: IosysId,
    pub(crate) ty: PioType,
    pub(crate) gdimlen: Vec<usize>,
    /// Local map, one-based, 0 = hole; sorted when `needs_sort`.
    pub(crate) map: Vec<u64>,
    /// Original index of each sorted map entry.
    pub(crate) remap: Option<Vec<usize>>,
    pub(crate) needs_sort: bool,
    pub(crate) read_only: bool,
    pub(crate) needs_fill: bool,
    pub(crate) rearranger: Rearranger,
    /// IO tasks that actually received non-empty regions.
    pub(crate) num_aiotasks: usize,
    pub(crate) send_plan: Vec<SendGroup>,
    pub(crate) recv_plan: Vec<RecvGroup>,
    /// IO-buffer length in elements on this task.
    pub(crate) llen: usize,
    /// Max `llen` over the IO tasks.
    pub(crate) maxiobuflen: usize,
    pub(crate) regions: Vec<Region>,
    /// Upper bound on region count, agreed across IO tasks.
    pub(crate) maxregions: usize,
    /// Hole regions this IO task fills with the fill value (subset only).
    pub(crate) fill_regions: Vec<Region>,
    pub(crate) holegridsize: usize,
    /// Groups this IO task with its compute tasks (subset only).
    pub(crate) subset_comm: Option<Arc<dyn Comm>>,
    pub(crate) rearr_opts: RearrOpts,
}

impl Decomp {
    /// Number of local map entries (the expected local array length).
    pub fn maplen(&self) -> usize {
        self.map.len()
    }

    /// Global dimension sizes.
    pub fn gdimlen(&self) -> &[usize] {
        &self.gdimlen
    }

    /// Element type of arrays using this decomposition.
    pub fn element_type(&self) -> PioType {
        self.ty
    }

    /// The rearranger in use.
    pub fn rearranger(&self) -> Rearranger {
        self.rearranger
    }

    /// True when the map has duplicate offsets (writes are rejected).
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// True when the caller's map was not monotonically increasing and a
    /// sorted view plus permutation is in use.
    pub fn needs_sort(&self) -> bool {
        self.needs_sort
    }

    /// Cells this IO task fills with the fill value because no compute
    /// task maps them (subset rearranger).
    pub fn holegridsize(&self) -> usize {
        self.holegridsize
    }

    /// IO tasks that received non-empty regions. When the caller pinned
    /// the regions with `iostart`/`iocount` this equals the configured
    /// IO task count unconditionally.
    pub fn num_aiotasks(&self) -> usize {
        self.num_aiotasks
    }

    /// Handle of this decomposition.
    pub fn id(&self) -> IoId {
        self.id
    }

    pub(crate) fn total_elements(&self) -> u64 {
        self.gdimlen.iter().map(|&g| g as u64).product()
    }

    pub(crate) fn llen(&self) -> usize {
        self.llen
    }

    /// The stored map (sorted view when a sort was needed), one-based
    /// with 0 marking holes.
    pub fn map(&self) -> &[u64] {
        &self.map
    }

    pub(crate) fn needs_fill(&self) -> bool {
        self.needs_fill
    }

    pub(crate) fn send_plan(&self) -> &[SendGroup] {
        &self.send_plan
    }

    pub(crate) fn recv_plan(&self) -> &[RecvGroup] {
        &self.recv_plan
    }

    pub(crate) fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub(crate) fn fill_regions(&self) -> &[Region] {
        &self.fill_regions
    }

    pub(crate) fn rearr_opts(&self) -> &RearrOpts {
        &self.rearr_opts
    }

    /// The communicator the data exchange runs on.
    pub(crate) fn exchange_comm<'a>(&'a self, ios: &'a IoSystem) -> &'a Arc<dyn Comm> {
        self.subset_comm.as_ref().unwrap_or(&ios.union_comm)
    }

    /// Map a sorted-map position to the user's buffer index.
    #[inline]
    pub(crate) fn user_index(&self, sorted_pos: usize) -> usize {
        match &self.remap {
            Some(r) => r[sorted_pos],
            None => sorted_pos,
        }
    }

    #[cfg(any(debug_assertions, feature = "check-invariants"))]
    pub(crate) fn debug_assert_invariants(&self) {
        for g in &self.recv_plan {
            for &p in &g.pos {
                debug_assert!(p < self.llen, "recv position {p} outside IO buffer {}", self.llen);
            }
        }
        let region_total: usize = self.regions.iter().map(|r| r.len()).sum();
        debug_assert_eq!(region_total, self.llen, "regions must cover the IO buffer exactly");
        if let Some(r) = &self.remap {
            debug_assert_eq!(r.len(), self.map.len());
        }
    }
}

/// Detect non-monotonicity and produce the sorted view plus permutation.
///
/// Mirrors the reference scan: an entry only triggers sorting when it is
/// positive and smaller than its predecessor, so holes (zeros) break the
/// comparison chain.
pub(crate) fn normalize_map(compmap: &[u64]) -> (Vec<u64>, Option<Vec<usize>>, bool) {
    let needs_sort = compmap.windows(2).any(|w| w[1] > 0 && w[1] < w[0]);
    if !needs_sort {
        return (compmap.to_vec(), None, false);
    }
    let mut order: Vec<usize> = (0..compmap.len()).collect();
    order.sort_by_key(|&i| compmap[i]);
    let sorted: Vec<u64> = order.iter().map(|&i| compmap[i]).collect();
    (sorted, Some(order), true)
}

/// Cross-task duplicate and coverage check on the compute communicator.
///
/// Gathers the non-zero offsets at compute rank 0, flags `read_only` on
/// any repeated value and `needs_fill` when the distinct offsets do not
/// cover the whole array, then shares both flags with every compute task.
pub(crate) fn global_map_checks(
    comp: &dyn Comm,
    map: &[u64],
    total: u64,
) -> Result<(bool, bool)> {
    let nonzero: Vec<u64> = map.iter().copied().filter(|&v| v != 0).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&nonzero);
    let gathered = collective::gather(comp, 0, bytes)?;
    let flags = gathered.map(|parts| {
        let mut all: Vec<u64> = Vec::new();
        for p in &parts {
            all.extend(p.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())));
        }
        all.sort_unstable();
        let mut read_only = false;
        let mut distinct = 0u64;
        let mut prev = 0u64;
        for &v in &all {
            if v == prev {
                read_only = true;
            } else {
                distinct += 1;
                prev = v;
            }
        }
        vec![read_only as u8, (distinct < total) as u8]
    });
    let out = collective::bcast(comp, 0, flags.as_deref())?;
    Ok((out[0] != 0, out[1] != 0))
}

impl PioContext {
    /// Initialize a decomposition for distributed arrays.
    ///
    /// `compmap` holds, per local element, its one-based offset into the
    /// row-major global array; 0 marks an element that is never
    /// transferred. `iostart`/`iocount` optionally pin each IO task's
    /// rectangular region for the box rearranger.
    ///
    /// Collective over the IO system.
    ///
    /// # Errors
    /// `InvalidArg` on empty or non-positive global dimensions or map
    /// offsets outside the array; `BadRearranger` when an async IO system
    /// is asked for a rearranger other than its default.
    pub fn init_decomp(
        &self,
        iosysid: IosysId,
        ty: PioType,
        gdimlen: &[usize],
        compmap: &[u64],
        rearranger: Option<Rearranger>,
        iostart: Option<&[usize]>,
        iocount: Option<&[usize]>,
    ) -> Result<IoId> {
        let ios = self.iosystem(iosysid)?;
        if gdimlen.is_empty() || gdimlen.iter().any(|&g| g == 0) {
            return Err(PioError::InvalidArg("global dimensions must be positive"));
        }
        let total: u64 = gdimlen.iter().map(|&g| g as u64).product();
        if compmap.iter().any(|&v| v > total) {
            return Err(PioError::InvalidArg("map offset outside the global array"));
        }

        if ios.async_mode {
            if let Some(r) = rearranger {
                if r != ios.default_rearranger {
                    return Err(PioError::BadRearranger);
                }
            }
            if !ios.ioproc {
                let mut w = MsgWriter::new();
                w.put_i32(iosysid.raw());
                w.put_u8(ty.tag());
                w.put_usizes(gdimlen);
                match rearranger {
                    Some(r) => {
                        w.put_bool(true);
                        w.put_u8(r.tag());
                    }
                    None => w.put_bool(false),
                }
                w.put_opt_usizes(iostart);
                w.put_opt_usizes(iocount);
                self.forward_async(&ios, MsgCode::InitDecomp, &w.finish())?;
            }
        }

        self.init_decomp_impl(&ios, ty, gdimlen, compmap, rearranger, iostart, iocount)
    }

    /// Simplified decomposition init for data whose memory order is a
    /// block described by start+count on the file; the map is computed.
    pub fn init_decomp_block(
        &self,
        iosysid: IosysId,
        ty: PioType,
        gdimlen: &[usize],
        start: &[usize],
        count: &[usize],
    ) -> Result<IoId> {
        let ndims = gdimlen.len();
        if start.len() != ndims || count.len() != ndims {
            return Err(PioError::InvalidArg("start/count rank mismatch"));
        }
        for d in 0..ndims {
            if gdimlen[d] == 0 || start[d] + count[d] > gdimlen[d] {
                return Err(PioError::InvalidArg("start+count outside the global array"));
            }
        }
        let maplen: usize = count.iter().product();
        let mut compmap = Vec::with_capacity(maplen);
        let mut loc = vec![0usize; ndims];
        for _ in 0..maplen {
            let coords: Vec<usize> = (0..ndims).map(|d| start[d] + loc[d]).collect();
            compmap.push(region::flatten(&coords, gdimlen) + 1);
            // Row-major odometer increment.
            for d in (0..ndims).rev() {
                loc[d] += 1;
                if loc[d] < count[d] {
                    break;
                }
                loc[d] = 0;
            }
        }
        self.init_decomp(iosysid, ty, gdimlen, &compmap, Some(Rearranger::Subset), None, None)
    }

    pub(crate) fn init_decomp_impl(
        &self,
        ios: &IoSystem,
        ty: PioType,
        gdimlen: &[usize],
        compmap: &[u64],
        rearranger: Option<Rearranger>,
        iostart: Option<&[usize]>,
        iocount: Option<&[usize]>,
    ) -> Result<IoId> {
        let total: u64 = gdimlen.iter().map(|&g| g as u64).product();
        let (map, remap, needs_sort) = normalize_map(compmap);
        log::debug!(
            "init_decomp: ndims={} maplen={} needs_sort={}",
            gdimlen.len(),
            map.len(),
            needs_sort
        );

        // Duplicate and coverage flags are a compute-side question; the
        // compute root shares the verdict with the whole union.
        let mut flags = [0u8; 2];
        if ios.compproc {
            let comp = ios.comp_comm.as_ref().expect("compute task has a comp comm");
            let (ro, fill) = global_map_checks(comp.as_ref(), &map, total)?;
            flags = [ro as u8, fill as u8];
        }
        let flags = collective::bcast(
            ios.union_comm.as_ref(),
            ios.comproot,
            if ios.union_rank == ios.comproot { Some(&flags[..]) } else { None },
        )?;
        let (read_only, needs_fill) = (flags[0] != 0, flags[1] != 0);

        let rearranger = rearranger.unwrap_or(ios.default_rearranger);
        let rearr_opts = *ios.rearr_opts.lock();

        let mut decomp = Decomp {
            id: IoId(0),
            iosysid: ios.id,
            ty,
            gdimlen: gdimlen.to_vec(),
            map,
            remap,
            needs_sort,
            read_only,
            needs_fill,
            rearranger,
            num_aiotasks: 0,
            send_plan: Vec::new(),
            recv_plan: Vec::new(),
            llen: 0,
            maxiobuflen: 0,
            regions: Vec::new(),
            maxregions: 0,
            fill_regions: Vec::new(),
            holegridsize: 0,
            subset_comm: None,
            rearr_opts,
        };

        match rearranger {
            Rearranger::Box => box_rearr::create(self, ios, &mut decomp, iostart, iocount)?,
            Rearranger::Subset => subset_rearr::create(ios, &mut decomp)?,
        }

        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        decomp.debug_assert_invariants();

        // Assign the id. In async mode all components share the IO-side
        // counter, so the IO root decides and everyone adopts.
        let id = if ios.async_mode {
            let proposal = if ios.ioproc && ios.iomaster {
                Some(self.alloc_ioid().raw().to_le_bytes())
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
                    .map_err(|_| PioError::Protocol("short ioid broadcast".into()))?,
            );
            self.adopt_ioid(raw)
        } else {
            self.alloc_ioid()
        };

        decomp.id = id;
        log::debug!(
            "init_decomp: ioid={} rearranger={:?} llen={} maxregions={} read_only={} needs_fill={}",
            id.raw(),
            rearranger,
            decomp.llen,
            decomp.maxregions,
            read_only,
            needs_fill
        );
        self.register_decomp(Arc::new(decomp));
        Ok(id)
    }

    /// Release a decomposition and its resources.
    pub fn free_decomp(&self, iosysid: IosysId, ioid: IoId) -> Result<()> {
        let ios = self.iosystem(iosysid)?;
        if ios.async_mode && !ios.ioproc {
            let mut w = MsgWriter::new();
            w.put_i32(iosysid.raw());
            w.put_i32(ioid.raw());
            self.forward_async(&ios, MsgCode::FreeDecomp, &w.finish())?;
        }
        let d = self.remove_decomp(ioid)?;
        if d.iosysid != iosysid {
            // Put it back; the caller mixed up systems.
            self.register_decomp(d);
            return Err(PioError::InvalidArg("decomposition belongs to another IO system"));
        }
        Ok(())
    }

    /// Local array length expected by this decomposition.
    pub fn get_local_array_size(&self, ioid: IoId) -> Result<usize> {
        Ok(self.decomp(ioid)?.maplen())
    }

    pub(crate) fn handle_init_decomp_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let _iosysid = r.i32()?;
        let ty = PioType::from_tag(r.u8()?)
            .ok_or_else(|| PioError::Protocol("unknown element type tag".into()))?;
        let gdimlen = r.usizes()?;
        let rearranger = if r.bool()? {
            Some(
                Rearranger::from_tag(r.u8()?)
                    .ok_or_else(|| PioError::Protocol("unknown rearranger tag".into()))?,
            )
        } else {
            None
        };
        let iostart = r.opt_usizes()?;
        let iocount = r.opt_usizes()?;
        // IO tasks hold no compute data: empty map.
        self.init_decomp_impl(
            ios,
            ty,
            &gdimlen,
            &[],
            rearranger,
            iostart.as_deref(),
            iocount.as_deref(),
        )?;
        Ok(())
    }

    pub(crate) fn handle_free_decomp_msg(&self, ios: &Arc<IoSystem>, args: &[u8]) -> Result<()> {
        let mut r = MsgReader::new(args);
        let iosysid = IosysId(r.i32()?);
        let ioid = IoId(r.i32()?);
        let _ = ios;
        let d = self.remove_decomp(ioid)?;
        debug_assert_eq!(d.iosysid, iosysid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_map_is_untouched() {
        let (map, remap, needs_sort) = normalize_map(&[1, 3, 5, 0, 7]);
        assert!(!needs_sort);
        assert!(remap.is_none());
        assert_eq!(map, vec![1, 3, 5, 0, 7]);
    }

    #[test]
    fn descending_map_is_sorted_with_permutation() {
        let (map, remap, needs_sort) = normalize_map(&[5, 3, 9, 1]);
        assert!(needs_sort);
        assert_eq!(map, vec![1, 3, 5, 9]);
        let remap = remap.unwrap();
        assert_eq!(remap, vec![3, 1, 0, 2]);
        // remap points back into the caller's buffer.
        let user = [5u64, 3, 9, 1];
        let resorted: Vec<u64> = remap.iter().map(|&i| user[i]).collect();
        assert_eq!(resorted, map);
    }

    #[test]
    fn holes_break_the_comparison_chain() {
        // 3 follows a hole, not the 5, so the scan does not flag it.
        let (_, _, needs_sort) = normalize_map(&[5, 0, 3]);
        assert!(!needs_sort);
    }

    #[test]
    fn zeros_sort_first_when_sorting() {
        let (map, _, needs_sort) = normalize_map(&[5, 4, 0, 2]);
        assert!(needs_sort);
        assert_eq!(map, vec![0, 2, 4, 5]);
    }
}
