//! Fixed (non-learned) positional tables.

pub mod sincos;
