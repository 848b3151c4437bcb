use anyhow::{bail, ensure, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tch::data::Iter2;
use tch::vision::{cifar, image, mnist};
use tch::{Device, Kind, Tensor};

use crate::config::{DataConfig, DataSource};

const CIFAR10_CLASSES: [&str; 10] = [
    "airplane", "automobile", "bird", "cat", "deer", "dog", "frog", "horse", "ship", "truck",
];
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];
const RESIZE_CHUNK: i64 = 1024;

/// Float images in `[0, 1]` laid out `[N, C, H, W]` with `Int64` labels.
/// Tensors stay on the CPU; iterators move batches to the target device.
#[derive(Debug)]
pub struct ImageDataset {
    pub train_images: Tensor,
    pub train_labels: Tensor,
    pub val_images: Tensor,
    pub val_labels: Tensor,
    pub num_classes: i64,
    pub class_names: Vec<String>,
}

impl ImageDataset {
    pub fn load(config: &DataConfig, seed: u64) -> Result<Self> {
        let dataset = match &config.source {
            DataSource::Cifar10 { path } => {
                let data = cifar::load_dir(path)
                    .with_context(|| format!("Failed to load CIFAR-10 from {:?}", path))?;
                Self {
                    train_images: data.train_images,
                    train_labels: data.train_labels,
                    val_images: data.test_images,
                    val_labels: data.test_labels,
                    num_classes: 10,
                    class_names: CIFAR10_CLASSES.iter().map(|c| c.to_string()).collect(),
                }
            }
            DataSource::Mnist { path } => {
                let data = mnist::load_dir(path)
                    .with_context(|| format!("Failed to load MNIST from {:?}", path))?;
                Self {
                    train_images: data.train_images.view([-1, 1, 28, 28]),
                    train_labels: data.train_labels,
                    val_images: data.test_images.view([-1, 1, 28, 28]),
                    val_labels: data.test_labels,
                    num_classes: 10,
                    class_names: (0..10).map(|d| d.to_string()).collect(),
                }
            }
            DataSource::ImageFolder { path } => load_image_folder(Path::new(path), config, seed)?,
            DataSource::Synthetic {
                num_classes,
                train_size,
                val_size,
                channels,
            } => {
                let mut rng = StdRng::seed_from_u64(seed);
                let shape = SyntheticShape {
                    num_classes: *num_classes,
                    channels: *channels,
                    size: config.image_size,
                };
                let (train_images, train_labels) = synthetic(&shape, *train_size, &mut rng);
                let (val_images, val_labels) = synthetic(&shape, *val_size, &mut rng);
                Self {
                    train_images,
                    train_labels,
                    val_images,
                    val_labels,
                    num_classes: *num_classes,
                    class_names: (0..*num_classes).map(|c| format!("class_{}", c)).collect(),
                }
            }
        };

        let dataset = Self {
            train_images: resize(&dataset.train_images, config.image_size),
            val_images: resize(&dataset.val_images, config.image_size),
            ..dataset
        };
        log::info!(
            "Loaded {} training and {} validation images ({} classes, {:?})",
            dataset.train_len(),
            dataset.val_len(),
            dataset.num_classes,
            dataset.train_images.size()
        );
        Ok(dataset)
    }

    pub fn train_len(&self) -> i64 {
        self.train_images.size()[0]
    }

    pub fn val_len(&self) -> i64 {
        self.val_images.size()[0]
    }

    pub fn channels(&self) -> i64 {
        self.train_images.size()[1]
    }

    /// Side length of the (square) images.
    pub fn image_size(&self) -> i64 {
        self.train_images.size()[3]
    }

    /// Keeps the smaller last batch so every image is seen once per epoch.
    pub fn train_iter(&self, batch_size: i64, shuffle: bool, device: Device) -> Iter2 {
        let mut iter = Iter2::new(&self.train_images, &self.train_labels, batch_size);
        iter.to_device(device).return_smaller_last_batch();
        if shuffle {
            iter.shuffle();
        }
        iter
    }

    pub fn val_iter(&self, batch_size: i64, device: Device) -> Iter2 {
        let mut iter = Iter2::new(&self.val_images, &self.val_labels, batch_size);
        iter.to_device(device).return_smaller_last_batch();
        iter
    }
}

/// Bilinear resize to `size x size`, in chunks to bound peak memory.
fn resize(images: &Tensor, size: i64) -> Tensor {
    let dims = images.size();
    if images.numel() == 0 || (dims[2] == size && dims[3] == size) {
        return images.shallow_clone();
    }
    let chunks: Vec<Tensor> = images
        .split(RESIZE_CHUNK, 0)
        .iter()
        .map(|chunk| {
            chunk
                .upsample_bilinear2d([size, size], false, None, None)
                .clamp(0.0, 1.0)
        })
        .collect();
    Tensor::cat(&chunks, 0)
}

struct SyntheticShape {
    num_classes: i64,
    channels: i64,
    size: i64,
}

/// Class `c` is a sinusoidal stripe pattern whose frequency and
/// orientation depend on `c`, with uniform noise on top.
fn synthetic(shape: &SyntheticShape, n: i64, rng: &mut StdRng) -> (Tensor, Tensor) {
    let size = shape.size as usize;
    let mut pixels = Vec::with_capacity(n as usize * shape.channels as usize * size * size);
    let mut labels = Vec::with_capacity(n as usize);

    for _ in 0..n {
        let label = rng.gen_range(0..shape.num_classes);
        labels.push(label);
        let frequency = (1 + label / 2) as f32;
        let vertical = label % 2 == 1;
        for channel in 0..shape.channels {
            let phase = channel as f32 * 0.5;
            for y in 0..size {
                for x in 0..size {
                    let coord = if vertical { y } else { x };
                    let t = coord as f32 / size as f32;
                    let value = 0.5 + 0.4 * (std::f32::consts::TAU * frequency * t + phase).sin();
                    let noise: f32 = rng.gen_range(-0.1..0.1);
                    pixels.push((value + noise).clamp(0.0, 1.0));
                }
            }
        }
    }

    let images = Tensor::from_slice(&pixels).view([n, shape.channels, shape.size, shape.size]);
    (images, Tensor::from_slice(&labels))
}

fn class_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut classes = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("Failed to read {:?}", root))? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                classes.push((name.to_string(), path));
            }
        }
    }
    classes.sort();
    Ok(classes)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Reads `root/<class>/*` with the class order given by `class_names`.
fn read_split(root: &Path, class_names: &[String], size: i64) -> Result<(Tensor, Tensor)> {
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for (name, dir) in class_dirs(root)? {
        let Some(label) = class_names.iter().position(|c| *c == name) else {
            bail!("Class {:?} in {:?} is not a training class", name, root);
        };
        for file in image_files(&dir)? {
            let image = image::load_and_resize(&file, size, size)
                .with_context(|| format!("Failed to read image {:?}", file))?;
            images.push(image.to_kind(Kind::Float) / 255.0);
            labels.push(label as i64);
        }
    }
    ensure!(!images.is_empty(), "No images found under {:?}", root);
    Ok((Tensor::stack(&images, 0), Tensor::from_slice(&labels)))
}

fn load_image_folder(path: &Path, config: &DataConfig, seed: u64) -> Result<ImageDataset> {
    let train_root = path.join("train");
    let train_root = if train_root.is_dir() { train_root } else { path.to_path_buf() };
    let class_names: Vec<String> = class_dirs(&train_root)?.into_iter().map(|(name, _)| name).collect();
    ensure!(!class_names.is_empty(), "No class directories found under {:?}", train_root);

    let (images, labels) = read_split(&train_root, &class_names, config.image_size)?;
    let val_root = path.join("val");
    let (train_images, train_labels, val_images, val_labels) = if val_root.is_dir() {
        let (val_images, val_labels) = read_split(&val_root, &class_names, config.image_size)?;
        (images, labels, val_images, val_labels)
    } else {
        log::info!("No val/ split in {:?}, holding out {:.0}%", path, config.val_fraction * 100.0);
        hold_out(&images, &labels, config.val_fraction, seed)
    };

    Ok(ImageDataset {
        train_images,
        train_labels,
        val_images,
        val_labels,
        num_classes: class_names.len() as i64,
        class_names,
    })
}

/// Seeded shuffle, then the first `fraction` of samples become validation.
fn hold_out(images: &Tensor, labels: &Tensor, fraction: f64, seed: u64) -> (Tensor, Tensor, Tensor, Tensor) {
    let n = images.size()[0];
    let mut order: Vec<i64> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut n_val = (n as f64 * fraction).round() as i64;
    if fraction > 0.0 && n > 1 {
        n_val = n_val.clamp(1, n - 1);
    }
    let order = Tensor::from_slice(&order);
    let (val_idx, train_idx) = (order.narrow(0, 0, n_val), order.narrow(0, n_val, n - n_val));
    (
        images.index_select(0, &train_idx),
        labels.index_select(0, &train_idx),
        images.index_select(0, &val_idx),
        labels.index_select(0, &val_idx),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_config(image_size: i64) -> DataConfig {
        DataConfig {
            source: DataSource::Synthetic {
                num_classes: 4,
                train_size: 10,
                val_size: 3,
                channels: 3,
            },
            image_size,
            ..Default::default()
        }
    }

    #[test]
    fn synthetic_data_is_seeded_and_in_range() {
        let a = ImageDataset::load(&synthetic_config(8), 7).unwrap();
        let b = ImageDataset::load(&synthetic_config(8), 7).unwrap();
        assert_eq!(a.train_images.size(), vec![10, 3, 8, 8]);
        assert_eq!(a.val_len(), 3);
        assert!(a.train_images.equal(&b.train_images));
        assert!(a.train_labels.equal(&b.train_labels));
        assert!(a.train_images.min().double_value(&[]) >= 0.0);
        assert!(a.train_images.max().double_value(&[]) <= 1.0);
        assert!(a.train_labels.max().int64_value(&[]) < 4);

        let c = ImageDataset::load(&synthetic_config(8), 8).unwrap();
        assert!(!a.train_images.equal(&c.train_images));
    }

    #[test]
    fn iterators_cover_every_sample() {
        let data = ImageDataset::load(&synthetic_config(8), 0).unwrap();
        let sizes: Vec<i64> = data
            .train_iter(4, true, Device::Cpu)
            .map(|(xs, ys)| {
                assert_eq!(xs.size()[0], ys.size()[0]);
                xs.size()[0]
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(data.val_iter(4, Device::Cpu).count(), 1);
    }

    #[test]
    fn hold_out_keeps_both_splits_non_empty() {
        let images = Tensor::rand([5, 1, 2, 2], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0i64, 1, 2, 3, 4]);
        let (train, train_labels, val, val_labels) = hold_out(&images, &labels, 0.01, 3);
        assert_eq!(train.size()[0], 4);
        assert_eq!(val.size()[0], 1);
        let mut all: Vec<i64> = Vec::<i64>::try_from(&Tensor::cat(&[train_labels, val_labels], 0)).unwrap();
        all.sort();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn resize_changes_only_spatial_dims() {
        let images = Tensor::rand([3, 1, 28, 28], (Kind::Float, Device::Cpu));
        assert_eq!(resize(&images, 16).size(), vec![3, 1, 16, 16]);
        assert!(resize(&images, 28).equal(&images));
    }

    #[test]
    fn image_folder_requires_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("train/cat")).unwrap();
        let config = DataConfig {
            source: DataSource::ImageFolder {
                path: dir.path().to_string_lossy().into_owned(),
            },
            image_size: 8,
            ..Default::default()
        };
        assert!(ImageDataset::load(&config, 0).is_err());
    }

    #[test]
    fn image_folder_reads_classes_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        for (class, shade) in [("zebra", 200.0), ("ant", 10.0)] {
            let class_dir = dir.path().join("train").join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..2 {
                let pixels = Tensor::full([3, 6, 6], shade, (Kind::Uint8, Device::Cpu));
                image::save(&pixels, class_dir.join(format!("{}.png", i))).unwrap();
            }
        }
        let config = DataConfig {
            source: DataSource::ImageFolder {
                path: dir.path().to_string_lossy().into_owned(),
            },
            image_size: 4,
            val_fraction: 0.25,
            ..Default::default()
        };
        let data = ImageDataset::load(&config, 1).unwrap();
        assert_eq!(data.class_names, vec!["ant".to_string(), "zebra".to_string()]);
        assert_eq!(data.train_len() + data.val_len(), 4);
        assert_eq!(data.val_len(), 1);
        assert_eq!(data.train_images.size()[1..], [3, 4, 4]);
    }
}
