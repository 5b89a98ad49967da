//! Shared leaf utilities for the Ovum virtual machine.
//!
//! This crate has no dependencies on the VM core. It provides the pieces
//! that everything else builds on:
//!
//! - [`unicode`]: UTF-16 surrogate-pair arithmetic
//! - [`utf8`]: conversion between UTF-16 code units and UTF-8 bytes
//! - [`ops`]: overflow-checked integer arithmetic

pub mod ops;
pub mod unicode;
pub mod utf8;

pub use ops::{ArithmeticError, ArithmeticResult};
