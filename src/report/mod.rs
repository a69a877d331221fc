//! Rendering of resolve results.

pub mod generator;

pub use generator::*;
