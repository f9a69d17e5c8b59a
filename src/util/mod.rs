//! Small helpers shared by the allocators.

pub(crate) mod layout;
pub mod size;
