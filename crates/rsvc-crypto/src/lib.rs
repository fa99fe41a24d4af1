#![forbid(unsafe_code)]

pub mod hash;
pub mod identity;

#[cfg(test)]
mod proptests;
