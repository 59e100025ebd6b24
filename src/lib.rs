//! # pario
//!
//! pario is a parallel I/O library for distributed multi-dimensional
//! arrays, designed for scientific applications where many processes
//! hold disjoint pieces of one logically global array and cooperatively
//! read or write it to a single shared file. A configurable subset of
//! the processes act as IO tasks and serialize the file operations; the
//! rest are compute tasks that own the data. The heart of the library is
//! the *rearranger*: the plan and communication pattern that moves
//! elements between the compute decomposition and the IO decomposition.
//!
//! ## Features
//! - Box and subset rearrangers with flow-controlled sparse all-to-all
//!   exchange (handshake, blocking/non-blocking sends, in-flight caps)
//! - Multi-variable write aggregation: one rearrangement per batch of
//!   writes sharing a decomposition
//! - Synchronous operation (IO tasks are a strided subset of compute
//!   tasks) and asynchronous operation (dedicated IO processes driven by
//!   a message-dispatch loop)
//! - Pluggable communicators: in-process mailboxes for deterministic
//!   tests, real MPI behind the `mpi-support` feature
//! - A self-describing classic array file backend, plus persistence for
//!   decompositions themselves
//!
//! ## Usage
//! ```no_run
//! use pario::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> pario::Result<()> {
//! let ctx = PioContext::new();
//! let comm: Arc<dyn Comm> = NoComm::new();
//! let iosysid = ctx.init_intracomm(comm, 1, 1, 0, Rearranger::Box)?;
//!
//! // Four elements of a 1-D global array of length 4, owned locally.
//! let ioid = ctx.init_decomp(iosysid, PioType::Int, &[4], &[1, 2, 3, 4], None, None, None)?;
//!
//! let ncid = ctx.create_file(iosysid, "out.par", CreateMode::Clobber, IoType::ClassicParallel)?;
//! let x = ctx.def_dim(ncid, "x", DimLen::Fixed(4))?;
//! let v = ctx.def_var(ncid, "data", PioType::Int, &[x])?;
//! ctx.enddef(ncid)?;
//! ctx.write_darray(ncid, v, ioid, &[10i32, 20, 30, 40], None)?;
//! ctx.close_file(ncid)?;
//! ctx.free_decomp(iosysid, ioid)?;
//! ctx.free_iosystem(iosysid)?;
//! # Ok(())
//! # }
//! ```

pub mod comm;
pub mod context;
mod darray;
pub mod decomp;
mod decompfile;
pub mod dispatch;
pub mod error;
pub mod file;
pub mod iosystem;
pub mod types;
pub(crate) mod wire;

pub use context::{DimId, IoId, IosysId, Ncid, PioContext, VarId};
pub use decomp::swap::{CommType, FcDirection, FcOptions, RearrOpts, UNLIMITED_PEND_REQ};
pub use decomp::{Decomp, Rearranger};
pub use dispatch::MsgCode;
pub use error::{ErrorPolicy, PioError, Result};
pub use file::backend::{AttValue, DimLen, IoType};
pub use file::{CreateMode, OpenMode};
pub use iosystem::ErrorScope;
pub use types::{Element, PioType};

/// A convenient prelude to import the most-used types:
pub mod prelude {
    pub use crate::comm::{local::LocalWorld, Comm, NoComm};
    pub use crate::context::{DimId, IoId, IosysId, Ncid, PioContext, VarId};
    pub use crate::decomp::swap::{CommType, FcDirection, FcOptions, RearrOpts};
    pub use crate::decomp::Rearranger;
    pub use crate::error::{ErrorPolicy, PioError};
    pub use crate::file::backend::{AttValue, DimLen, IoType};
    pub use crate::file::{CreateMode, OpenMode};
    pub use crate::iosystem::ErrorScope;
    pub use crate::types::{Element, PioType};
}
