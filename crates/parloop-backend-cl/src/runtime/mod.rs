//! Launch-time machinery shared by the native and simulator drivers:
//! work-group geometry, device residency, and the staged executor.

pub mod broker;
pub mod exec;
pub mod geometry;
