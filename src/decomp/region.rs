//! Hyperslab regions and the offset coalescer.
//!
//! An IO task's share of a variable is described by a list of
//! `{start, count}` hyperslabs; [`coalesce`] turns an ordered list of flat
//! global offsets into the minimum number of such regions by extending
//! along the fastest-varying dimension and then fusing stacks of full
//! rows.

/// One contiguous hyperslab of the global array, plus its element offset
/// into the owning task's IO buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// Per-dimension start indices (0-based).
    pub start: Vec<usize>,
    /// Per-dimension element counts.
    pub count: Vec<usize>,
    /// Element offset of this region's data in the IO buffer.
    pub loffset: usize,
}

impl Region {
    /// Number of elements covered.
    pub fn len(&self) -> usize {
        self.count.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.count.iter().any(|&c| c == 0)
    }
}

/// Convert a flat row-major offset to per-dimension coordinates.
pub(crate) fn unflatten(mut offset: u64, gdims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0usize; gdims.len()];
    for d in (0..gdims.len()).rev() {
        coords[d] = (offset % gdims[d] as u64) as usize;
        offset /= gdims[d] as u64;
    }
    coords
}

/// Convert per-dimension coordinates to a flat row-major offset.
pub(crate) fn flatten(coords: &[usize], gdims: &[usize]) -> u64 {
    let mut off = 0u64;
    for (c, g) in coords.iter().zip(gdims) {
        off = off * (*g as u64) + *c as u64;
    }
    off
}

/// Coalesce an ordered list of distinct 0-based flat offsets into
/// hyperslab regions.
///
/// A region grows along the last dimension while consecutive offsets
/// differ by one and stay inside the same row; afterwards, runs of full
/// rows with identical inner extents are fused along the next-slower
/// dimension. For a fully contiguous 1-D run this yields exactly one
/// region.
pub(crate) fn coalesce(offsets: &[u64], gdims: &[usize]) -> Vec<Region> {
    let ndims = gdims.len();
    let mut regions: Vec<Region> = Vec::new();
    if ndims == 0 {
        return regions;
    }

    let mut loffset = 0usize;
    let mut i = 0usize;
    while i < offsets.len() {
        let start = unflatten(offsets[i], gdims);
        let row_remaining = gdims[ndims - 1] - start[ndims - 1];
        // Extend along the fastest-varying dimension.
        let mut run = 1usize;
        while run < row_remaining
            && i + run < offsets.len()
            && offsets[i + run] == offsets[i] + run as u64
        {
            run += 1;
        }
        let mut count = vec![1usize; ndims];
        count[ndims - 1] = run;
        regions.push(Region { start, count, loffset });
        loffset += run;
        i += run;
    }

    // Fuse vertically: consecutive regions that are full rows of the same
    // inner extent stack along the next-slower dimension.
    if ndims >= 2 {
        let mut fused: Vec<Region> = Vec::new();
        for r in regions {
            if let Some(prev) = fused.last_mut() {
                let stackable = prev.start[ndims - 1] == r.start[ndims - 1]
                    && prev.count[ndims - 1] == r.count[ndims - 1]
                    && prev.count[ndims - 1] == gdims[ndims - 1]
                    && prev.start[..ndims.saturating_sub(2)] == r.start[..ndims.saturating_sub(2)]
                    && prev.count[..ndims.saturating_sub(2)].iter().all(|&c| c == 1)
                    && r.start[ndims - 2] == prev.start[ndims - 2] + prev.count[ndims - 2];
                if stackable {
                    prev.count[ndims - 2] += 1;
                    continue;
                }
            }
            fused.push(r);
        }
        return fused;
    }

    regions
}
