//! Reference attention kernel.
//!
//! Scores are computed in `f32` regardless of input dtype and the result is
//! cast back to the dtype of `q`.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config};

#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

fn dims4(tensor: &Tensor, name: &str) -> Result<(usize, usize, usize, usize), AttentionError> {
    tensor.dims4().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "{name} must have shape [batch, heads, seq_len, head_dim], got {:?}",
            tensor.dims()
        ),
    })
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = dims4(q, "q")?;
        let (kb, kh, k_len, kd) = dims4(k, "k")?;
        let (vb, vh, vk, vd) = dims4(v, "v")?;
        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            });
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
                ),
            });
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init heads={} head_dim={} dropout={:?} masked={}",
                heads,
                head_dim,
                config.dropout_p,
                mask.is_some()
            );
        }

        let q = q.to_dtype(DType::F32)?.contiguous()?;
        let k = k.to_dtype(DType::F32)?.contiguous()?;
        let v = v.to_dtype(DType::F32)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;

        if let Some(mask) = mask {
            let (mb, mh, mq, mk) = dims4(mask, "mask")?;
            let batch_ok = mb == 1 || mb == batch;
            let heads_ok = mh == 1 || mh == heads;
            if !batch_ok || !heads_ok || mq != q_len || mk != k_len {
                return Err(AttentionError::InvalidShape {
                    context: format!(
                        "mask shape mismatch: expected [1|{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                    ),
                });
            }
            scores = scores.broadcast_add(&mask.to_dtype(DType::F32)?)?;
        }

        let mut probs = softmax_last_dim(&scores)?;
        if let Some(p) = config.dropout_p.filter(|p| *p > 0.0) {
            if p >= 1.0 {
                return Err(AttentionError::InvalidConfig {
                    message: format!("dropout probability must be in [0, 1), got {p}"),
                });
            }
            probs = dropout(&probs, p)?;
        }

        Ok(probs.matmul(&v)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{build_causal_mask, key_padding_mask_from_flags};
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.iter().map(|x| 0.5 - x).collect(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> CandleResult<Vec<f32>> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let k_len = k.dims()[2];
        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(
                m.broadcast_as((batch, heads, q_len, k_len))?
                    .contiguous()?
                    .flatten_all()?
                    .to_vec1::<f32>()?,
            ),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        for bh in 0..batch * heads {
            for qi in 0..q_len {
                let mut row: Vec<f32> = (0..k_len)
                    .map(|ki| {
                        let dot: f32 = (0..head_dim)
                            .map(|d| {
                                q_vec[(bh * q_len + qi) * head_dim + d]
                                    * k_vec[(bh * k_len + ki) * head_dim + d]
                            })
                            .sum();
                        let bias = mask_vec
                            .as_ref()
                            .map(|m| m[(bh * q_len + qi) * k_len + ki])
                            .unwrap_or(0.0);
                        dot * scale + bias
                    })
                    .collect();
                let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let mut denom = 0f32;
                for value in row.iter_mut() {
                    *value = (*value - max).exp();
                    denom += *value;
                }
                for d in 0..head_dim {
                    output[(bh * q_len + qi) * head_dim + d] = (0..k_len)
                        .map(|ki| row[ki] / denom * v_vec[(bh * k_len + ki) * head_dim + d])
                        .sum();
                }
            }
        }
        Ok(output)
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn exact_attention_matches_naive_with_causal_mask() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 1, 1, 4, 4)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        let actual = output.flatten_all()?.to_vec1::<f32>()?;
        assert!(max_abs_diff(&actual, &expected) < 1e-4);
        Ok(())
    }

    #[test]
    fn padded_keys_do_not_produce_nan() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let causal = build_causal_mask(&device, 1, 1, 4, 4)?;
        let flags = Tensor::new(&[[0u32, 0, 1, 1]], &device)?;
        let mask = causal.broadcast_add(&key_padding_mask_from_flags(&flags)?)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();
        let values = output.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_head_axis_is_validated() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &q, &q, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn reduced_precision_tracks_f32() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        for dtype in [DType::BF16, DType::F16] {
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    None,
                    &Config::default(),
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let values = out.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            assert!(max_abs_diff(&values, &reference) < 5e-2, "{dtype:?}");
        }
        Ok(())
    }
}
