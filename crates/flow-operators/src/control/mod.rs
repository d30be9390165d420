//! Loop machinery operators
//!
//! These kinds delimit a ForLoop span; the engine's loop runner primes
//! their caches per iteration. Their transforms only cover direct pulls
//! outside a frame (element 0 semantics for the begin node).

pub mod loop_begin;
pub mod loop_end;
pub mod loop_meta;
