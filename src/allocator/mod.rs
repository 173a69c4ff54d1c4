//! Allocation engines: size classes, slab and buddy regions, the
//! per-class recycle bins, and the occupancy accelerators they share.

pub mod accel;
pub mod bin;
pub mod buddy;
pub mod sizeclass;
pub mod slab;
