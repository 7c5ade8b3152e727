//! Defines Rustmata helper utilities.

pub mod helpers;

pub use helpers::*;
