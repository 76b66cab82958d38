//! The host side of the bridge: reflection metadata, object storage, raw
//! memory, and the function dispatch table.

pub mod dispatch;
pub mod memory;
pub mod object;
pub mod reflection;
