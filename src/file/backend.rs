//! The file-backend seam.
//!
//! Everything the darray machinery needs from an on-disk format is
//! behind [`IoBackend`]: define dims/vars/attributes, end define mode,
//! contiguous `put_vara`/`get_vara` on byte slices, a non-blocking put
//! variant with `wait_all`, and sync/close. The classic backend
//! implements it; the HDF5-family tags are recognized but report
//! unavailable in this build, as the reference library does when built
//! without those layers.

use crate::error::{PioError, Result};
use crate::types::PioType;

/// Supported file backend kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IoType {
    /// Classic format, all writes funneled through IO rank 0.
    Classic,
    /// Classic format, every IO task writes its own regions.
    ClassicParallel,
    /// HDF5 serial (not available in this build).
    Hdf5,
    /// HDF5 parallel (not available in this build).
    Hdf5Parallel,
}

impl IoType {
    /// Is this kind usable in this build?
    pub fn available(self) -> bool {
        matches!(self, IoType::Classic | IoType::ClassicParallel)
    }

    /// Do all IO tasks touch the file, or only IO rank 0?
    pub fn parallel(self) -> bool {
        matches!(self, IoType::ClassicParallel | IoType::Hdf5Parallel)
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            IoType::Classic => 1,
            IoType::ClassicParallel => 2,
            IoType::Hdf5 => 3,
            IoType::Hdf5Parallel => 4,
        }
    }

    pub(crate) fn from_tag(t: u8) -> Option<Self> {
        Some(match t {
            1 => IoType::Classic,
            2 => IoType::ClassicParallel,
            3 => IoType::Hdf5,
            4 => IoType::Hdf5Parallel,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            IoType::Classic => "classic",
            IoType::ClassicParallel => "classic-parallel",
            IoType::Hdf5 => "hdf5",
            IoType::Hdf5Parallel => "hdf5-parallel",
        }
    }
}

/// Dimension length at definition time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DimLen {
    Fixed(usize),
    /// The record dimension; at most one per file, and it must be the
    /// first dimension of any variable using it.
    Unlimited,
}

/// Attribute payloads the decomposition-file format and callers need.
#[derive(Clone, Debug, PartialEq)]
pub enum AttValue {
    Text(String),
    Ints(Vec<i64>),
}

/// Role of this process relative to the file's metadata.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendRole {
    /// Writes the header (IO rank 0).
    Root,
    /// Reads/writes data regions only.
    Peer,
}

/// Object-safe interface to one open file.
pub trait IoBackend: Send {
    fn def_dim(&mut self, name: &str, len: DimLen) -> Result<usize>;
    fn def_var(&mut self, name: &str, ty: PioType, dimids: &[usize]) -> Result<usize>;
    /// `owner` is `None` for a global attribute, else the variable id.
    fn put_att(&mut self, owner: Option<usize>, name: &str, value: &AttValue) -> Result<()>;
    fn get_att(&self, owner: Option<usize>, name: &str) -> Result<AttValue>;
    fn enddef(&mut self) -> Result<()>;
    fn redef(&mut self) -> Result<()>;

    fn num_dims(&self) -> usize;
    fn num_vars(&self) -> usize;
    /// `(name, current length, is_unlimited)`.
    fn dim_info(&self, dimid: usize) -> Result<(String, usize, bool)>;
    /// `(name, element type, dim ids)`.
    fn var_info(&self, varid: usize) -> Result<(String, PioType, Vec<usize>)>;

    fn put_vara(&mut self, varid: usize, start: &[usize], count: &[usize], data: &[u8])
        -> Result<()>;
    fn get_vara(
        &mut self,
        varid: usize,
        start: &[usize],
        count: &[usize],
        out: &mut [u8],
    ) -> Result<()>;
    /// Queue a put; the returned request id completes in [`wait_all`],
    /// [`sync`](IoBackend::sync), or [`close`](IoBackend::close).
    fn iput_vara(
        &mut self,
        varid: usize,
        start: Vec<usize>,
        count: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<u64>;
    fn wait_all(&mut self, reqs: &[u64]) -> Result<()>;

    /// Records written so far (record vars share one record dimension).
    fn numrecs(&self) -> usize;
    /// Raise the record count (used to agree across parallel writers).
    fn set_numrecs(&mut self, n: usize) -> Result<()>;

    fn sync(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Open a backend of the requested kind.
pub(crate) fn create_backend(
    iotype: IoType,
    path: &str,
    clobber: bool,
    role: BackendRole,
) -> Result<Box<dyn IoBackend>> {
    match iotype {
        IoType::Classic | IoType::ClassicParallel => Ok(Box::new(
            super::classic::ClassicBackend::create(path, clobber, role)?,
        )),
        other => Err(PioError::BadIoType(other.name())),
    }
}

pub(crate) fn open_backend(
    iotype: IoType,
    path: &str,
    writable: bool,
    role: BackendRole,
) -> Result<Box<dyn IoBackend>> {
    match iotype {
        IoType::Classic | IoType::ClassicParallel => Ok(Box::new(
            super::classic::ClassicBackend::open(path, writable, role)?,
        )),
        other => Err(PioError::BadIoType(other.name())),
    }
}
