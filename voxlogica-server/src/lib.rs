//! Thin HTTP adapter over `voxlogica-core`. Route semantics map directly
//! onto the resolver, job manager, and store inspection APIs.

pub mod http;
