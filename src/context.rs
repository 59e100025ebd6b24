//! Process-local handle registry and library context.
//!
//! Every public handle (`IosysId`, `IoId`, `Ncid`) indexes one of three
//! tables owned by a [`PioContext`]. Each table issues ids from a
//! monotonically increasing counter in a disjoint range, so a handle of
//! one kind can never be mistaken for another. The context also carries
//! the process-wide defaults: error policy, the box-splitter blocksize,
//! and the multi-buffer byte budget.
//!
//! Handles agree across the tasks of a process group because every task
//! performs the same sequence of collective creations; in async mode the
//! IO root additionally broadcasts each freshly assigned id so compute
//! components sharing one IO pool stay aligned.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::decomp::Decomp;
use crate::error::{ErrorPolicy, PioError, Result};
use crate::file::FileDesc;
use crate::iosystem::IoSystem;

/// Handle to an IO system descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct IosysId(pub(crate) i32);

/// Handle to a decomposition descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct IoId(pub(crate) i32);

/// Handle to an open file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Ncid(pub(crate) i32);

/// Dimension id within a file (dense, assigned in definition order).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DimId(pub(crate) i32);

/// Variable id within a file (dense, assigned in definition order).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct VarId(pub(crate) i32);

macro_rules! raw_accessor {
    ($($t:ty),*) => {$(
        impl $t {
            /// The raw integer value of this handle.
            pub fn raw(self) -> i32 {
                self.0
            }

            /// Rebuild a handle from its raw value (e.g. one carried
            /// through a foreign interface). Unknown values simply fail
            /// lookups.
            pub fn from_raw(raw: i32) -> Self {
                Self(raw)
            }
        }
    )*};
}
raw_accessor!(IosysId, IoId, Ncid, DimId, VarId);

/// First id of each table's range.
const FIRST_IOSYSID: i32 = 16;
const FIRST_IOID: i32 = 512;
const FIRST_NCID: i32 = 2048;

/// Default target block size (elements) for the box splitter.
pub(crate) const DEFAULT_BLOCKSIZE: usize = 1024;

/// Default multi-buffer budget in bytes before a forced flush.
pub(crate) const DEFAULT_BUFFER_LIMIT: usize = 10 * 1024 * 1024;

pub(crate) struct Registry {
    pub iosystems: HashMap<i32, Arc<IoSystem>>,
    pub decomps: HashMap<i32, Arc<Decomp>>,
    pub files: HashMap<i32, Arc<Mutex<FileDesc>>>,
    pub next_iosysid: i32,
    pub next_ioid: i32,
    pub next_ncid: i32,
    pub default_error_policy: ErrorPolicy,
    pub blocksize: usize,
    pub buffer_limit: usize,
    pub dispatch_log: Vec<crate::dispatch::MsgCode>,
}

impl Registry {
    fn new() -> Self {
        Self {
            iosystems: HashMap::new(),
            decomps: HashMap::new(),
            files: HashMap::new(),
            next_iosysid: FIRST_IOSYSID,
            next_ioid: FIRST_IOID,
            next_ncid: FIRST_NCID,
            default_error_policy: ErrorPolicy::InternalAbort,
            blocksize: DEFAULT_BLOCKSIZE,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            dispatch_log: Vec::new(),
        }
    }
}

/// The library context: handle registry plus process-wide defaults.
///
/// Construct one per participating process (or per simulated rank when
/// running on [`crate::comm::local::LocalComm`] threads). All public
/// operations are methods on this type; they are cheap lookups followed
/// by work on the referenced descriptors, so the internal lock is never
/// held across communication.
pub struct PioContext {
    pub(crate) reg: Mutex<Registry>,
}

impl Default for PioContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PioContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self { reg: Mutex::new(Registry::new()) }
    }

    // ---- lookups -----------------------------------------------------

    pub(crate) fn iosystem(&self, id: IosysId) -> Result<Arc<IoSystem>> {
        self.reg
            .lock()
            .iosystems
            .get(&id.0)
            .cloned()
            .ok_or(PioError::BadIosysId(id.0))
    }

    /// Look up a decomposition descriptor.
    pub fn decomp(&self, id: IoId) -> Result<Arc<Decomp>> {
        self.reg
            .lock()
            .decomps
            .get(&id.0)
            .cloned()
            .ok_or(PioError::BadIoId(id.0))
    }

    pub(crate) fn file(&self, id: Ncid) -> Result<Arc<Mutex<FileDesc>>> {
        self.reg
            .lock()
            .files
            .get(&id.0)
            .cloned()
            .ok_or(PioError::BadNcid(id.0))
    }

    // ---- id allocation ----------------------------------------------

    pub(crate) fn alloc_iosysid(&self) -> IosysId {
        let mut reg = self.reg.lock();
        let id = reg.next_iosysid;
        reg.next_iosysid += 1;
        IosysId(id)
    }

    pub(crate) fn alloc_ioid(&self) -> IoId {
        let mut reg = self.reg.lock();
        let id = reg.next_ioid;
        reg.next_ioid += 1;
        IoId(id)
    }

    pub(crate) fn alloc_ncid(&self) -> Ncid {
        let mut reg = self.reg.lock();
        let id = reg.next_ncid;
        reg.next_ncid += 1;
        Ncid(id)
    }

    /// Adopt an id assigned remotely (async mode: the IO root allocates
    /// and broadcasts). Keeps the local counter ahead of adopted ids.
    pub(crate) fn adopt_ioid(&self, id: i32) -> IoId {
        let mut reg = self.reg.lock();
        reg.next_ioid = reg.next_ioid.max(id + 1);
        IoId(id)
    }

    pub(crate) fn adopt_ncid(&self, id: i32) -> Ncid {
        let mut reg = self.reg.lock();
        reg.next_ncid = reg.next_ncid.max(id + 1);
        Ncid(id)
    }

    // ---- registration / removal -------------------------------------

    pub(crate) fn register_iosystem(&self, ios: Arc<IoSystem>) {
        self.reg.lock().iosystems.insert(ios.id.0, ios);
    }

    pub(crate) fn remove_iosystem(&self, id: IosysId) -> Result<Arc<IoSystem>> {
        self.reg
            .lock()
            .iosystems
            .remove(&id.0)
            .ok_or(PioError::BadIosysId(id.0))
    }

    pub(crate) fn register_decomp(&self, d: Arc<Decomp>) {
        self.reg.lock().decomps.insert(d.id.0, d);
    }

    pub(crate) fn remove_decomp(&self, id: IoId) -> Result<Arc<Decomp>> {
        self.reg
            .lock()
            .decomps
            .remove(&id.0)
            .ok_or(PioError::BadIoId(id.0))
    }

    pub(crate) fn register_file(&self, f: FileDesc) {
        let id = f.ncid.0;
        self.reg.lock().files.insert(id, Arc::new(Mutex::new(f)));
    }

    pub(crate) fn remove_file(&self, id: Ncid) -> Result<Arc<Mutex<FileDesc>>> {
        self.reg
            .lock()
            .files
            .remove(&id.0)
            .ok_or(PioError::BadNcid(id.0))
    }

    // ---- process-wide defaults --------------------------------------

    /// Set the target block size (in elements) used when the box
    /// rearranger computes its per-IO-task split.
    pub fn set_blocksize(&self, blocksize: usize) -> Result<()> {
        if blocksize == 0 {
            return Err(PioError::InvalidArg("blocksize must be positive"));
        }
        self.reg.lock().blocksize = blocksize;
        Ok(())
    }

    pub(crate) fn blocksize(&self) -> usize {
        self.reg.lock().blocksize
    }

    /// Set the multi-buffer budget in bytes; returns the previous value.
    pub fn set_buffer_size_limit(&self, limit: usize) -> usize {
        let mut reg = self.reg.lock();
        std::mem::replace(&mut reg.buffer_limit, limit)
    }

    pub(crate) fn buffer_limit(&self) -> usize {
        self.reg.lock().buffer_limit
    }

    pub(crate) fn default_error_policy(&self) -> ErrorPolicy {
        self.reg.lock().default_error_policy
    }

    pub(crate) fn set_default_error_policy(&self, p: ErrorPolicy) -> ErrorPolicy {
        let mut reg = self.reg.lock();
        std::mem::replace(&mut reg.default_error_policy, p)
    }

    /// True if the id refers to a registered, active IO system.
    pub fn iosystem_is_active(&self, id: IosysId) -> bool {
        self.reg.lock().iosystems.contains_key(&id.0)
    }
}
