//! Checked handles to factory objects
//!
//! | handle        | owns | checked by                         | lifetime             |
//! |---------------|------|------------------------------------|----------------------|
//! | [WeakRef]     | no   | generation id + block freed flag   | any                  |
//! | [TempRef]     | no   | destroyed-this-frame set           | until frame end      |
//! | [SharedRef]   | yes  | intrusive count, never stale       | until last drop      |
//! | [MonitorPtr]  | yes  | two-phase destroy state            | destroy + last drop  |
//!
//! All of them are minted by the [ObjectFactory](crate::factory::ObjectFactory).

mod monitor;
mod shared;
mod temp;
mod weak;

pub use monitor::{MonitorInfo, MonitorPtr, MonitorState, RawMonitor};
pub use shared::SharedRef;
pub use temp::TempRef;
pub use weak::WeakRef;

#[cfg(test)]
mod tests;
