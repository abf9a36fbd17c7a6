//! Integration tests for the RKE machine operator
//!
//! - `apply_engine`: stories about generated objects being created and
//!   pruned through server-side apply against a real API server
//!
//! - `bootstrap_status`: stories about the RKEBootstrap CRD and the guarded
//!   status write that points CAPI at the bootstrap secret

mod apply_engine;
mod bootstrap_status;
mod helpers;
