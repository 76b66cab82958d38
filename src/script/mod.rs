//! The script side of the bridge: values, the interpreter stack, the pin
//! registry with protected calls, and coroutine bookkeeping.

pub mod coroutine;
pub mod runtime;
pub mod stack;
pub mod value;
