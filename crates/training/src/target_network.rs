//! Keeps a slowly moving copy of the online parameters for bootstrapping.

use candle_nn::VarMap;

use crate::{loss::to_runtime_error, TrainingError};

/// Sets every variable of `dst` to the value of the same-named variable in
/// `src`.
pub fn copy_parameters(src: &VarMap, dst: &VarMap) -> Result<(), TrainingError> {
    blend(src, dst, 1.0)
}

/// Polyak update `dst = (1 - tau) · dst + tau · src`.
pub fn soft_update(src: &VarMap, dst: &VarMap, tau: f64) -> Result<(), TrainingError> {
    if !(0.0..=1.0).contains(&tau) {
        return Err(TrainingError::runtime(format!(
            "target update factor must be in [0, 1], got {tau}"
        )));
    }
    blend(src, dst, tau)
}

fn blend(src: &VarMap, dst: &VarMap, tau: f64) -> Result<(), TrainingError> {
    let src_data = src
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("online parameter map lock poisoned"))?;
    let dst_data = dst
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("target parameter map lock poisoned"))?;
    if src_data.len() != dst_data.len() {
        return Err(TrainingError::runtime(format!(
            "online and target networks differ: {} vs {} parameters",
            src_data.len(),
            dst_data.len()
        )));
    }

    for (name, dst_var) in dst_data.iter() {
        let src_var = src_data.get(name).ok_or_else(|| {
            TrainingError::runtime(format!("target parameter {name} has no online counterpart"))
        })?;
        let src_tensor = src_var.as_tensor().detach();
        let updated = if tau >= 1.0 {
            src_tensor
        } else {
            let kept = dst_var
                .as_tensor()
                .affine(1.0 - tau, 0.0)
                .map_err(to_runtime_error)?;
            src_tensor
                .affine(tau, 0.0)
                .and_then(|moved| moved + kept)
                .map_err(to_runtime_error)?
        };
        dst_var.set(&updated).map_err(to_runtime_error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn varmap(names: &[&str], value: f64) -> candle_core::Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for name in names {
            vb.get_with_hints(3, name, Init::Const(value))?;
        }
        Ok(varmap)
    }

    fn values(varmap: &VarMap, name: &str) -> Vec<f32> {
        let data = varmap.data().lock().expect("lock");
        data[name].as_tensor().to_vec1::<f32>().expect("values")
    }

    #[test]
    fn copy_makes_target_equal() -> anyhow::Result<()> {
        let online = varmap(&["a", "b"], 3.0)?;
        let target = varmap(&["a", "b"], 0.0)?;
        copy_parameters(&online, &target)?;
        assert_eq!(values(&target, "b"), vec![3.0; 3]);
        Ok(())
    }

    #[test]
    fn soft_update_moves_a_fraction() -> anyhow::Result<()> {
        let online = varmap(&["w"], 1.0)?;
        let target = varmap(&["w"], 0.0)?;
        soft_update(&online, &target, 0.25)?;
        assert_eq!(values(&target, "w"), vec![0.25; 3]);
        soft_update(&online, &target, 0.5)?;
        assert_eq!(values(&target, "w"), vec![0.625; 3]);
        assert_eq!(values(&online, "w"), vec![1.0; 3]);
        Ok(())
    }

    #[test]
    fn mismatched_networks_are_rejected() -> anyhow::Result<()> {
        let online = varmap(&["w"], 1.0)?;
        let target = varmap(&["v"], 0.0)?;
        assert!(soft_update(&online, &target, 0.1).is_err());
        assert!(soft_update(&online, &online, 1.5).is_err());
        Ok(())
    }
}
