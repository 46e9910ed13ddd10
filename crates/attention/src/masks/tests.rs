use super::*;
use candle_core::{DType, Device, Result, Tensor};

fn idx(
    b: usize,
    h: usize,
    q: usize,
    k: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> usize {
    ((((b * num_heads) + h) * q_len) + q) * k_len + k
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let (batch, num_heads, q_len, k_len) = (1, 2, 3, 5);

    let mask = build_causal_mask(&device, batch, num_heads, q_len, k_len)?;
    assert_eq!(mask.dims(), &[batch, num_heads, q_len, k_len]);
    assert_eq!(mask.dtype(), MASK_DTYPE);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    // Earliest query sees the prefix of length k_len - q_len + 1.
    assert_eq!(values[idx(0, 0, 0, 2, num_heads, q_len, k_len)], 0.0);
    assert_eq!(
        values[idx(0, 0, 0, 3, num_heads, q_len, k_len)],
        f32::NEG_INFINITY
    );
    assert_eq!(values[idx(0, 1, 2, 4, num_heads, q_len, k_len)], 0.0);
    Ok(())
}

#[test]
fn square_causal_mask_is_lower_triangular() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 1, 1, 4, 4)?;
    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    for q in 0..4 {
        for k in 0..4 {
            let value = values[idx(0, 0, q, k, 1, 4, 4)];
            if k <= q {
                assert_eq!(value, 0.0, "q={q} k={k}");
            } else {
                assert_eq!(value, f32::NEG_INFINITY, "q={q} k={k}");
            }
        }
    }
    Ok(())
}

#[test]
fn key_padding_mask_marks_zero_flags() -> Result<()> {
    let device = Device::Cpu;
    let flags = Tensor::new(&[[1u32, 1, 0, 0], [1, 0, 1, 0]], &device)?;
    let mask = key_padding_mask_from_flags(&flags)?;
    assert_eq!(mask.dims(), &[2, 1, 1, 4]);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(
        values,
        vec![
            0.0,
            0.0,
            PADDING_FILL,
            PADDING_FILL,
            0.0,
            PADDING_FILL,
            0.0,
            PADDING_FILL
        ]
    );
    Ok(())
}

#[test]
fn key_padding_mask_accepts_float_flags() -> Result<()> {
    let device = Device::Cpu;
    let flags = Tensor::new(&[[0f32, 1.0, 1.0]], &device)?;
    let mask = key_padding_mask_from_flags(&flags)?;
    assert_eq!(mask.dtype(), DType::F32);
    assert_eq!(
        mask.flatten_all()?.to_vec1::<f32>()?,
        vec![PADDING_FILL, 0.0, 0.0]
    );
    Ok(())
}
