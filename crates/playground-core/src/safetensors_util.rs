use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tch::{nn, Device, Kind, Tensor};

use crate::error::{ModelError, Result};

/// How tensors in a file are matched against model variables.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// File keys are `prefix + variable name`. Keys without the prefix are ignored.
    pub prefix: Option<String>,
    /// Fail when a model variable has no tensor in the file.
    pub strict: bool,
    /// File keys starting with any of these are skipped silently.
    pub ignore_prefixes: Vec<String>,
}

impl LoadOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Default::default()
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn ignoring(mut self, prefix: impl Into<String>) -> Self {
        self.ignore_prefixes.push(prefix.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model variables with no tensor in the file.
    pub missing: Vec<String>,
    /// Tensors in the file (under the prefix) with no matching variable.
    pub unexpected: Vec<String>,
}

pub fn save_safetensors<P: AsRef<Path>>(
    vs: &nn::VarStore,
    path: P,
    metadata: &HashMap<String, String>,
) -> Result<()> {
    save_tensors(&vs.variables(), path, metadata)
}

/// Writes every tensor as F32.
pub fn save_tensors<P: AsRef<Path>>(
    tensors: &HashMap<String, Tensor>,
    path: P,
    metadata: &HashMap<String, String>,
) -> Result<()> {
    let mut buffers = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let tensor = tensor
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous();
        let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
        let values = Vec::<f32>::try_from(&tensor.flatten(0, -1))?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffers.push((name.clone(), shape, bytes));
    }

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| Ok((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize_to_file(
        views.iter().map(|(name, view)| (name.as_str(), view)),
        &Some(metadata.clone()),
        path.as_ref(),
    )?;
    Ok(())
}

pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    let mut variables = vs.variables();
    load_into(&mut variables, path, &LoadOptions::default())
}

/// Copies matching tensors from the file into `variables` in place.
pub fn load_into<P: AsRef<Path>>(
    variables: &mut HashMap<String, Tensor>,
    path: P,
    options: &LoadOptions,
) -> Result<LoadReport> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;
    let prefix = options.prefix.as_deref().unwrap_or("");

    let mut report = LoadReport::default();

    for (key, view) in tensors.tensors() {
        if options.ignore_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            continue;
        }
        let Some(name) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some(var) = variables.get_mut(name) else {
            log::warn!("Tensor {} found in safetensors but not in model", key);
            report.unexpected.push(key.clone());
            continue;
        };

        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            return Err(ModelError::ShapeMismatch {
                name: name.to_string(),
                expected: var.size(),
                found: shape,
            });
        }

        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            other => return Err(ModelError::UnsupportedDtype(format!("{:?}", other))),
        };

        let tensor = Tensor::from_data_size(view.data(), &shape, kind)
            .to_kind(var.kind())
            .to_device(var.device());
        tch::no_grad(|| {
            var.copy_(&tensor);
        });
        log::debug!("Loaded tensor: {}", name);
        report.loaded.push(name.to_string());
    }

    let mut missing: Vec<String> = variables
        .keys()
        .filter(|name| !report.loaded.contains(name))
        .cloned()
        .collect();
    missing.sort();
    report.missing = missing;

    if options.strict {
        if let Some(first) = report.missing.first() {
            return Err(ModelError::MissingTensor(first.clone()));
        }
    }

    Ok(report)
}

pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _ = nn::linear(&root / "fc", 3, 2, Default::default());
        let _ = root.zeros_no_train("running", &[4]);
        vs
    }

    #[test]
    fn saved_weights_load_into_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let source = store();
        let metadata = HashMap::from([("epoch".to_string(), "3".to_string())]);
        save_safetensors(&source, &path, &metadata).unwrap();

        let mut target = store();
        let report = load_safetensors(&mut target, &path).unwrap();
        assert_eq!(report.loaded.len(), 3);
        assert!(report.missing.is_empty());
        assert!(report.unexpected.is_empty());

        let (src, dst) = (source.variables(), target.variables());
        for (name, tensor) in &src {
            assert!(tensor.equal(&dst[name]), "{} differs", name);
        }
        assert_eq!(read_metadata(&path).unwrap()["epoch"], "3");
    }

    #[test]
    fn prefix_selects_a_sub_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapped.safetensors");

        let wrapped = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(wrapped.root() / "student" / "fc", 3, 2, Default::default());
        let _ = nn::linear(wrapped.root() / "other", 3, 3, Default::default());
        save_safetensors(&wrapped, &path, &HashMap::new()).unwrap();

        let target = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(target.root() / "fc", 3, 2, Default::default());
        let _ = nn::linear(target.root() / "head", 2, 2, Default::default());

        let mut variables = target.variables();
        let report = load_into(&mut variables, &path, &LoadOptions::with_prefix("student.")).unwrap();
        assert_eq!(report.loaded.len(), 2);
        assert_eq!(report.missing, vec!["head.bias".to_string(), "head.weight".to_string()]);
        assert!(report.unexpected.is_empty());
        assert!(target.variables()["fc.weight"].equal(&wrapped.variables()["student.fc.weight"]));

        let mut variables = target.variables();
        let strict = LoadOptions {
            prefix: Some("student.".to_string()),
            strict: true,
            ..Default::default()
        };
        assert!(matches!(
            load_into(&mut variables, &path, &strict),
            Err(ModelError::MissingTensor(_))
        ));
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        save_safetensors(&store(), &path, &HashMap::new()).unwrap();

        let mut other = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(other.root() / "fc", 3, 5, Default::default());
        assert!(matches!(
            load_safetensors(&mut other, &path),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn ignored_prefixes_are_neither_loaded_nor_unexpected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let source = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(source.root() / "fc", 3, 2, Default::default());
        let _ = nn::linear(source.root() / "teacher" / "fc", 3, 2, Default::default());
        save_safetensors(&source, &path, &HashMap::new()).unwrap();

        let target = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(target.root() / "fc", 3, 2, Default::default());
        let mut variables = target.variables();
        let report = load_into(&mut variables, &path, &LoadOptions::strict().ignoring("teacher.")).unwrap();
        assert_eq!(report.loaded.len(), 2);
        assert!(report.unexpected.is_empty());
    }
}
