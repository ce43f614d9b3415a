//! Transactional persistent object store over a byte arena.
//!
//! Two tightly coupled cores:
//!
//! * [`BitmapAllocator`] - a free-space manager over a fixed-capacity
//!   arena. A two-level bitmap (per-unit bits, 2-bit slotset
//!   summaries, plus a 1-bit top-level guard) drives best-fit and
//!   first-fit searches in sub-linear time.
//! * [`TransactionRoot`] - atomic multi-object mutation on top of the
//!   arena. Writes duplicate object payloads on first touch, an
//!   allocation log records every allocator mutation and an object
//!   log records every duplicated header, so commit is a pair of
//!   cursor bumps, rollback is an exact inverse replay, and a restart
//!   reconstructs the whole allocator from a snapshot plus the log.
//!
//! The arena is a raw byte range; whether it is plain memory, a file
//! mapping or persistent memory is up to the embedder. Durability
//! fences for real crash-safety are deliberately out of scope.
//!
//! ```
//! use agate::{Config, TransactionRoot};
//!
//! let root = TransactionRoot::create(64 * 1024 * 1024);
//! root.prepare(Config::default()).unwrap();
//!
//! let tx = root.start_transaction();
//! let obj = tx.alloc_object(42_u64).unwrap();
//! tx.commit().unwrap();
//!
//! let read = root.start_read_access();
//! assert_eq!(*obj.inspect(&read), 42);
//! ```

mod alloc_log;
mod allocator;
mod arena;
mod bits;
mod cell;
mod collections;
mod config;
mod error;
mod l0;
mod l1;
mod l2;
mod obj_log;
mod root;
mod slot;
mod vcell;

pub use allocator::{BitmapAllocator, Interval};
pub use arena::Arena;
pub use cell::{PRef, Persist};
pub use collections::{ListIter, MapIter, PList, PMap, PVec};
pub use config::Config;
pub use error::{Error, Result};
pub use root::{ReadAccess, ReleaseCtx, RetireFn, Scope, TransactionRoot, Tx};
pub use slot::PSlot;
pub use vcell::Volatile;
