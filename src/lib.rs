//! Core library for `us-blkback`: the per-frontend I/O engine that services
//! a paravirtualized block frontend's requests against a file-backed disk
//! image. See each module for its piece of the design.

pub mod cli;
pub mod engine;
pub mod evtchn;
pub mod frontend;
pub mod gnttab;
pub mod grant_cache;
pub mod image;
pub mod ring;
pub mod supervisor;
pub mod validator;
pub mod wire;
pub mod xenstore;
