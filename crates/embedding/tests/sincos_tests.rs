use candle_core::{Device, Result};
use embedding::{sincos_1d, sincos_2d};

#[test]
fn sincos_1d_origin_row_is_zero_sine_unit_cosine() -> Result<()> {
    let table = sincos_1d(8, &[0.0, 1.0], &Device::Cpu)?;
    assert_eq!(table.dims(), &[2, 8]);
    let rows = table.to_vec2::<f32>()?;
    assert_eq!(&rows[0][..4], &[0.0, 0.0, 0.0, 0.0]);
    assert_eq!(&rows[0][4..], &[1.0, 1.0, 1.0, 1.0]);
    // Lowest frequency is 1, so position 1 gives sin(1) in the first slot.
    assert!((rows[1][0] - 1f32.sin()).abs() < 1e-6);
    assert!((rows[1][4] - 1f32.cos()).abs() < 1e-6);
    Ok(())
}

#[test]
fn sincos_2d_has_one_row_per_patch() -> Result<()> {
    let table = sincos_2d(16, 14, &Device::Cpu)?;
    assert_eq!(table.dims(), &[196, 16]);
    Ok(())
}

#[test]
fn sincos_2d_first_half_tracks_column_second_half_tracks_row() -> Result<()> {
    let grid = 3;
    let dim = 8;
    let device = Device::Cpu;
    let table = sincos_2d(dim, grid, &device)?.to_vec2::<f32>()?;
    let per_axis = sincos_1d(dim / 2, &[0.0, 1.0, 2.0], &device)?.to_vec2::<f32>()?;

    // Patch at row 1, column 2 sits at flat index 1 * grid + 2.
    let patch = &table[grid + 2];
    assert_eq!(&patch[..dim / 2], per_axis[2].as_slice());
    assert_eq!(&patch[dim / 2..], per_axis[1].as_slice());
    Ok(())
}

#[test]
fn invalid_dimensions_are_rejected() {
    assert!(sincos_1d(7, &[0.0], &Device::Cpu).is_err());
    assert!(sincos_2d(6, 2, &Device::Cpu).is_err());
    assert!(sincos_2d(8, 0, &Device::Cpu).is_err());
}
