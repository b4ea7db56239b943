//! A partitioned global address space runtime.
//!
//! A program runs as a set of *units*. Each unit owns local memory, part of which is
//! exposed to every other unit through global pointers. On top of this the runtime
//! offers:
//!
//! - teams and groups of units, with collectives scoped to a team,
//! - global memory: symmetric per-team allocations, non-collective allocations, one-sided
//!   put/get with completion handles, atomics, and a team-wide MCS lock,
//! - patterns and views: the mapping of `N`-dimensional index spaces onto a team,
//! - data-flow tasking: tasks ordered by the global memory they read and write, across
//!   units, with phases bounding how far dependencies may be matched.
//!
//! Units are created by a [DartBuilder]; the default backend runs every unit as a
//! thread of the current process.
//!
//! EXAMPLES
//! --------
//!
//! # Broadcast and reduce
//! ```no_run
//! use dart::{DartBuilder, DartOp, DART_TEAM_ALL};
//!
//! let sums = DartBuilder::new()
//!     .launch(4, |dart| {
//!         let mut value = [0i32];
//!         if dart.my_unit() == 0 {
//!             value[0] = 42;
//!         }
//!         dart.bcast(DART_TEAM_ALL, 0, &mut value).unwrap();
//!         value[0] += dart.my_unit() as i32;
//!         let mut sum = [0i32];
//!         dart.allreduce(DART_TEAM_ALL, &value, &mut sum, DartOp::Sum).unwrap();
//!         sum[0]
//!     })
//!     .unwrap();
//! assert_eq!(sums, vec![174; 4]);
//! ```
//!
//! # A distributed array
//! ```no_run
//! use dart::{DartBuilder, Distribution, MemoryOrder, DART_TEAM_ALL};
//!
//! DartBuilder::new()
//!     .launch(4, |dart| {
//!         let pattern = dart
//!             .pattern(DART_TEAM_ALL, [20], [Distribution::Blocked], MemoryOrder::RowMajor)
//!             .unwrap();
//!         let size = pattern.local_capacity() * std::mem::size_of::<i32>();
//!         let array = dart.team_memalloc_aligned(DART_TEAM_ALL, size).unwrap();
//!         let (unit, offset) = pattern.local_at(&[7]).unwrap();
//!         let elem = array.with_unit(unit).unwrap().offset_by(4 * offset as i64).unwrap();
//!         if dart.my_unit() == 1 {
//!             dart.put_value(elem, 99i32).unwrap();
//!         }
//!         dart.barrier(DART_TEAM_ALL).unwrap();
//!         assert_eq!(dart.get_value::<i32>(elem).unwrap(), 99);
//!         dart.barrier(DART_TEAM_ALL).unwrap();
//!         dart.team_memfree(array).unwrap();
//!     })
//!     .unwrap();
//! ```

#[macro_use]
extern crate lazy_static;

#[doc(hidden)]
pub extern crate tracing;

mod alloc;
mod collective;
mod dart_world;
mod datatype;
mod env_var;
mod error;
mod fatal;
mod globmem;
mod gptr;
mod group;
mod locality;
mod lock;
pub mod pattern;
mod segment;
pub mod tasking;
mod team;
mod trace;
mod transport;
pub mod view;
mod warnings;

pub use crate::alloc::{BTreeAlloc, WindowAlloc};
pub use crate::collective::USER_AM_BASE;
pub use crate::dart_world::{release_init_breakpoint, Dart, DartBuilder};
pub use crate::datatype::{DartDatatype, DartOp, DartType, ValueLoc};
pub use crate::env_var::{config, Config};
pub use crate::error::{DartError, DartResult, DartRet};
pub use crate::globmem::DartHandle;
pub use crate::gptr::GlobalPtr;
pub use crate::group::Group;
pub use crate::locality::{HostLocality, Locality};
pub use crate::lock::TeamLock;
pub use crate::pattern::{
    Block, CartesianIndexSpace, Distribution, MemoryOrder, Pattern, TeamSpec,
};
pub use crate::segment::LOCAL_SEGMENT;
pub use crate::tasking::{CopyinBuffer, DepKind, TaskDep, TaskHandle, TaskRef, TaskState};
pub use crate::team::{TeamId, DART_TEAM_ALL};
pub use crate::transport::Backend;
pub use crate::view::{Transfer, View, ViewBlock};

use bincode::Options;

lazy_static! {
    pub(crate) static ref BINCODE: bincode::config::WithOtherTrailing<bincode::DefaultOptions, bincode::config::AllowTrailing> =
        bincode::DefaultOptions::new().allow_trailing_bytes();
}

/// Encode a runtime message
pub(crate) fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(BINCODE.serialize(obj)?)
}

/// Decode a runtime message, ignoring trailing bytes
pub(crate) fn deserialize<T>(bytes: &[u8]) -> Result<T, anyhow::Error>
where
    T: serde::de::DeserializeOwned,
{
    Ok(BINCODE.deserialize(bytes)?)
}
