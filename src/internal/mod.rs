//! Internal subsystems: the object model, the content-addressed store,
//! pack storage and verification, reference databases, and the Ketch
//! replication layer.

pub mod ketch;
pub mod object;
pub mod odb;
pub mod pack;
pub mod refs;
pub mod zlib;
