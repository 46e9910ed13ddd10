//! Sinusoidal position tables.
//!
//! The 2D table follows the MAE layout: for a `grid × grid` patch grid
//! flattened row-major, the first half of each row encodes the column index
//! and the second half the row index. Each half is itself `[sin | cos]` over
//! frequencies `1 / 10000^(i / (dim/2))`.

use candle_core::{bail, Device, Result, Tensor};

fn sincos_row(embed_dim: usize, position: f64, out: &mut Vec<f32>) {
    let half = embed_dim / 2;
    let freqs = (0..half).map(|i| 1.0 / 10_000f64.powf(i as f64 / half as f64));
    let angles: Vec<f64> = freqs.map(|omega| position * omega).collect();
    out.extend(angles.iter().map(|a| a.sin() as f32));
    out.extend(angles.iter().map(|a| a.cos() as f32));
}

/// Table shaped `(positions.len(), embed_dim)`. `embed_dim` must be even.
pub fn sincos_1d(embed_dim: usize, positions: &[f64], device: &Device) -> Result<Tensor> {
    if embed_dim == 0 || embed_dim % 2 != 0 {
        bail!("sin-cos embedding dim must be a positive even number, got {embed_dim}");
    }
    let mut data = Vec::with_capacity(positions.len() * embed_dim);
    for &position in positions {
        sincos_row(embed_dim, position, &mut data);
    }
    Tensor::from_vec(data, (positions.len(), embed_dim), device)
}

/// Table shaped `(grid_size * grid_size, embed_dim)`. `embed_dim` must be a
/// multiple of four.
pub fn sincos_2d(embed_dim: usize, grid_size: usize, device: &Device) -> Result<Tensor> {
    if embed_dim == 0 || embed_dim % 4 != 0 {
        bail!("2d sin-cos embedding dim must be a positive multiple of 4, got {embed_dim}");
    }
    if grid_size == 0 {
        bail!("2d sin-cos embedding requires grid_size > 0");
    }
    let half = embed_dim / 2;
    let positions: Vec<f64> = (0..grid_size).map(|i| i as f64).collect();
    let axis = sincos_1d(half, &positions, device)?;
    let shape = (grid_size, grid_size, half);
    // Entry (row, col) is [axis[col] | axis[row]].
    let cols = axis.unsqueeze(0)?.broadcast_as(shape)?;
    let rows = axis.unsqueeze(1)?.broadcast_as(shape)?;
    log::debug!("built 2d sin-cos table grid={grid_size} dim={embed_dim}");
    Tensor::cat(&[&cols, &rows], 2)?.reshape((grid_size * grid_size, embed_dim))
}
