//! # Code
//!
//! Machine code snippets written by hooks

pub mod x64;
