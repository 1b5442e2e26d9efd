//! Slab-allocated objects with checked references
//!
//! Memory comes from size-classed slab pools ([raw_pool], [size_class]).
//! On top of that the [factory] constructs objects and defers their
//! destruction to the end of a frame, and [refs] provides handles that can
//! tell when the object behind them is gone:
//!
//! - [WeakRef] checks a per-object generation and a per-block freed flag
//! - [TempRef] is only valid within the frame it was made in
//! - [SharedRef] keeps the object alive
//! - [MonitorPtr] keeps the object alive until explicitly destroyed *and* unreferenced
//!
//! Lifetime mistakes are reported through a [BugReporter] rather than
//! turning into memory corruption. Everything is single-threaded.

pub mod cell;
pub mod config;
pub mod factory;
pub mod manager;
pub mod raw_pool;
pub mod refs;
pub mod report;
pub mod size_class;
pub mod util;

pub use config::{ConfigError, FactoryConfig, SizeClassConfig};
pub use factory::{ObjPtr, ObjectFactory};
pub use manager::{ObjectManager, ObjectSet};
pub use raw_pool::{FreeError, RawPool};
pub use refs::{MonitorPtr, MonitorState, RawMonitor, SharedRef, TempRef, WeakRef};
pub use report::{BugReporter, BugTag, RecordingReporter, TracingReporter};
pub use size_class::{HeapInfo, Realloc, SlabHeap, TypeInfo};
