//! Shared, persistent, bounded product queue.
//!
//! One file holds a control block, a data segment of variable-size
//! products and an index segment (region allocator, insertion-time skip
//! list, signature hash). Any number of processes map the file; advisory
//! record locks on the control block and on each product region keep them
//! consistent. When space runs out the oldest unlocked products are
//! evicted.

pub(crate) mod access;
pub mod checkpoint;
pub mod class;
pub mod config;
pub(crate) mod control;
pub mod error;
pub(crate) mod index;
pub mod layout;
pub(crate) mod lock;
pub mod product;
pub mod queue;
pub(crate) mod slab;
pub mod timestamp;
pub mod wait;

pub use access::Strategy;
pub use class::{feedtype, ProductClass, ProductSpec};
pub use config::{CreateOptions, QueueConfig};
pub use control::Residence;
pub use error::{Error, Result};
pub use layout::Geometry;
pub use product::{Product, ProductInfo, Signature};
pub use queue::{Cursor, ProductQueue, ProductRef, QueueStats, Reservation, SeqDelete, Step};
pub use timestamp::{Clock, Direction, QuantaClock, SystemClock, Timestamp};
pub use wait::{suspend, suspend_and_unblock, SuspendGuard, Wakeup};
