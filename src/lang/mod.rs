//! # Kiln language values
//!
//! Literal constants that can be embedded in a code object. Runtime-only
//! values (functions, iterators, exceptions) live in `crate::runtime::value`.

pub mod value;
