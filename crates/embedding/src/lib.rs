//! Embedding crate
//!
//! `positional` holds fixed sin-cos tables (1D and 2D patch grids) and
//! `timestep` the learned per-timestep table added to every modality token.

pub mod positional;
pub mod timestep;

pub use positional::sincos::{sincos_1d, sincos_2d};
pub use timestep::TimestepEmbedding;
