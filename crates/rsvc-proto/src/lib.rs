//! Wire format for remote service authorization.
//!
//! Messages are prost-derived so they can travel over any transport that moves
//! opaque bytes. The `v1` module holds the message types, fault codes, and
//! method names; `validation` holds structural checks applied on receipt.

#![forbid(unsafe_code)]

pub mod v1;
pub mod validation;
