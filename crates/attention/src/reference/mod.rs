//! Portable, exact implementations of scaled dot-product attention.

pub mod exact;

pub use exact::ExactAttention;
