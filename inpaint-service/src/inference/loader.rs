//! Builds the generator from trained weights, once per process.

use super::generator::{Generator, GeneratorConfig};
use crate::config::{DevicePreference, ModelConfig};
use crate::services::metrics::MODEL_LOAD_DURATION;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

static GENERATOR: OnceCell<Arc<Generator>> = OnceCell::new();

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("generator weights not found at {0}")]
    WeightsNotFound(PathBuf),

    #[error("unsupported weights format for {0} (expected .safetensors, .pth or .pt)")]
    UnsupportedFormat(PathBuf),

    #[error("failed to load generator weights from {path}: {source}")]
    Weights {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error("failed to initialize compute device: {0}")]
    Device(#[source] candle_core::Error),
}

pub fn select_device(preference: DevicePreference) -> Result<Device, ModelLoadError> {
    match preference {
        DevicePreference::Auto => Device::cuda_if_available(0).map_err(ModelLoadError::Device),
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0).map_err(ModelLoadError::Device),
    }
}

fn var_builder(path: &Path, device: &Device) -> Result<VarBuilder<'static>, ModelLoadError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let loaded = match extension.as_deref() {
        // SAFETY: the weights file is treated as read-only for the life of the process.
        Some("safetensors") => unsafe {
            VarBuilder::from_mmaped_safetensors(std::slice::from_ref(&path), DType::F32, device)
        },
        Some("pth") | Some("pt") => VarBuilder::from_pth(path, DType::F32, device),
        _ => return Err(ModelLoadError::UnsupportedFormat(path.to_path_buf())),
    };

    loaded.map_err(|source| ModelLoadError::Weights {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads a fresh generator in inference mode. Fails when the file is missing
/// or any parameter is absent or has the wrong shape.
pub fn load_generator(config: &ModelConfig) -> Result<Generator, ModelLoadError> {
    let start = Instant::now();
    let path = config.weights_path.as_path();

    if !path.is_file() {
        tracing::error!(path = %path.display(), "Generator weights file is missing");
        return Err(ModelLoadError::WeightsNotFound(path.to_path_buf()));
    }

    let device = select_device(config.device)?;
    let vb = var_builder(path, &device)?;

    let generator_config = GeneratorConfig {
        base_channels: config.base_channels,
        ..Default::default()
    };
    let generator =
        Generator::new(generator_config, vb).map_err(|source| ModelLoadError::Weights {
            path: path.to_path_buf(),
            source,
        })?;

    let elapsed = start.elapsed();
    metrics::histogram!(MODEL_LOAD_DURATION).record(elapsed.as_secs_f64());
    tracing::info!(
        path = %path.display(),
        device = ?device,
        base_channels = config.base_channels,
        elapsed_ms = elapsed.as_millis() as u64,
        "Generator loaded"
    );

    Ok(generator)
}

/// Process-wide generator. Concurrent first callers block until a single
/// load finishes; a failed load is not cached. Later calls return the cached
/// instance whatever `config` they pass.
pub fn shared_generator(config: &ModelConfig) -> Result<Arc<Generator>, ModelLoadError> {
    GENERATOR
        .get_or_try_init(|| load_generator(config).map(Arc::new))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use candle_nn::VarMap;
    use tempfile::TempDir;

    fn model_config(weights_path: PathBuf, base_channels: usize) -> ModelConfig {
        ModelConfig {
            weights_path,
            device: DevicePreference::Cpu,
            base_channels,
        }
    }

    /// Writes freshly initialized tiny weights and returns their path.
    fn write_weights(dir: &TempDir, base_channels: usize) -> PathBuf {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Generator::new(
            GeneratorConfig {
                base_channels,
                ..Default::default()
            },
            vb,
        )
        .unwrap();

        let path = dir.path().join("generator.safetensors");
        varmap.save(&path).unwrap();
        path
    }

    #[test]
    fn missing_weights_file_is_reported() {
        let config = model_config(PathBuf::from("/definitely/not/here.pth"), 64);

        let err = load_generator(&config).unwrap_err();

        assert!(matches!(err, ModelLoadError::WeightsNotFound(_)));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generator.bin");
        std::fs::write(&path, b"weights").unwrap();

        let err = load_generator(&model_config(path, 2)).unwrap_err();

        assert!(matches!(err, ModelLoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn saved_weights_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = write_weights(&dir, 2);

        let generator = load_generator(&model_config(path, 2)).unwrap();

        let input = Tensor::zeros((1, 4, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let output = generator.forward(&input).unwrap();
        assert_eq!(output.dims(), &[1, 3, 32, 32]);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = write_weights(&dir, 2);

        let err = load_generator(&model_config(path, 4)).unwrap_err();

        assert!(matches!(err, ModelLoadError::Weights { .. }));
    }

    #[test]
    fn corrupt_safetensors_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generator.safetensors");
        std::fs::write(&path, b"definitely not safetensors").unwrap();

        let err = load_generator(&model_config(path, 2)).unwrap_err();

        assert!(matches!(err, ModelLoadError::Weights { .. }));
    }

    #[test]
    fn shared_generator_loads_once_across_threads() {
        let dir = TempDir::new().unwrap();
        let config = model_config(write_weights(&dir, 2), 2);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let config = config.clone();
                std::thread::spawn(move || shared_generator(&config).unwrap())
            })
            .collect();
        let loaded: Vec<Arc<Generator>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for generator in &loaded[1..] {
            assert!(Arc::ptr_eq(&loaded[0], generator));
        }
        assert_eq!(loaded[0].config().base_channels, 2);
    }
}
