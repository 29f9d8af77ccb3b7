//! Core types shared by both roles

mod address;
pub mod pipe;

pub use address::Address;
