//! This module contains utilities that are useful for testing code based on the connectivity
//!  core: an in-memory network with NAT behaviour, and a mesh of a server and clients wired
//!  together through it. They are used for testing the core itself, but they are also exported
//!  for application testing, which is why they are part of the crate's regular
//!  (non-#[cfg(test)]) code.

pub mod mesh;
