//! Dataset providers.
//!
//! The trainer only sees the [`DataProvider`] / [`DataSplit`] traits. Two
//! concrete sources back them, both loaded fully into memory:
//!
//! - [`synthetic`]: class prototypes plus noise, fully determined by a seed.
//! - [`load_cifar`]: the CIFAR-10 / CIFAR-100 binary distributions. A `+`
//!   suffix on the dataset name (`C10+`, `C100+`) turns on augmentation.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use ndarray::{s, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GrowError, GrowResult};
use crate::layers::Shape;
use crate::tensor::{Labels, Tensor};

/// One split of a dataset, consumed batch by batch.
pub trait DataSplit {
    fn num_examples(&self) -> usize;

    /// Next `batch_size` images and one-hot labels. Starts a new pass over
    /// the split (reshuffling if enabled) when the current one runs out.
    fn next_batch(&mut self, batch_size: usize) -> GrowResult<(Tensor, Labels)>;
}

pub trait DataProvider {
    fn train(&mut self) -> &mut dyn DataSplit;
    fn validation(&mut self) -> Option<&mut dyn DataSplit>;
    fn test(&mut self) -> &mut dyn DataSplit;
    fn data_shape(&self) -> Shape;
    fn n_classes(&self) -> usize;
    fn name(&self) -> &str;
}

// =============================================================================
// In-memory split
// =============================================================================

/// Pad-and-crop margin used by augmentation.
const CROP_PADDING: usize = 4;

pub struct InMemorySplit {
    images: Tensor,
    labels: Labels,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    augment: bool,
    rng: StdRng,
}

impl InMemorySplit {
    pub fn new(images: Tensor, labels: Labels, shuffle: bool, augment: bool, seed: u64) -> GrowResult<Self> {
        let n = images.dim().0;
        if labels.nrows() != n {
            return Err(GrowError::DimensionMismatch { expected: n, actual: labels.nrows() });
        }
        let mut split = Self {
            images,
            labels,
            order: (0..n).collect(),
            cursor: 0,
            shuffle,
            augment,
            rng: StdRng::seed_from_u64(seed),
        };
        split.start_new_pass();
        Ok(split)
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    fn start_new_pass(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Random horizontal flip, then a random crop of the zero-padded image.
    fn augment_image(&mut self, image: &mut Array3<f32>) {
        let (c, h, w) = image.dim();
        if self.rng.gen_bool(0.5) {
            image.invert_axis(Axis(2));
        }
        let mut padded = Array3::<f32>::zeros((c, h + 2 * CROP_PADDING, w + 2 * CROP_PADDING));
        padded
            .slice_mut(s![.., CROP_PADDING..CROP_PADDING + h, CROP_PADDING..CROP_PADDING + w])
            .assign(image);
        let dy = self.rng.gen_range(0..=2 * CROP_PADDING);
        let dx = self.rng.gen_range(0..=2 * CROP_PADDING);
        image.assign(&padded.slice(s![.., dy..dy + h, dx..dx + w]));
    }
}

impl DataSplit for InMemorySplit {
    fn num_examples(&self) -> usize {
        self.order.len()
    }

    fn next_batch(&mut self, batch_size: usize) -> GrowResult<(Tensor, Labels)> {
        let n = self.order.len();
        if n == 0 || batch_size == 0 {
            return Err(GrowError::EmptyBatch);
        }
        let size = batch_size.min(n);
        if self.cursor + size > n {
            self.start_new_pass();
        }
        let (_, c, h, w) = self.images.dim();
        let mut images = Tensor::zeros((size, c, h, w));
        let mut labels = Labels::zeros((size, self.labels.ncols()));
        for i in 0..size {
            let src = self.order[self.cursor + i];
            let mut image = self.images.index_axis(Axis(0), src).to_owned();
            if self.augment {
                self.augment_image(&mut image);
            }
            images.index_axis_mut(Axis(0), i).assign(&image);
            labels.row_mut(i).assign(&self.labels.row(src));
        }
        self.cursor += size;
        Ok((images, labels))
    }
}

// =============================================================================
// In-memory provider
// =============================================================================

pub struct InMemoryProvider {
    name: String,
    data_shape: Shape,
    n_classes: usize,
    train: InMemorySplit,
    validation: Option<InMemorySplit>,
    test: InMemorySplit,
}

impl InMemoryProvider {
    pub fn new(
        name: impl Into<String>,
        n_classes: usize,
        train: InMemorySplit,
        validation: Option<InMemorySplit>,
        test: InMemorySplit,
    ) -> Self {
        let (_, c, h, w) = train.images.dim();
        Self { name: name.into(), data_shape: Shape::d3(c, h, w), n_classes, train, validation, test }
    }
}

impl DataProvider for InMemoryProvider {
    fn train(&mut self) -> &mut dyn DataSplit {
        &mut self.train
    }

    fn validation(&mut self) -> Option<&mut dyn DataSplit> {
        self.validation.as_mut().map(|v| v as &mut dyn DataSplit)
    }

    fn test(&mut self) -> &mut dyn DataSplit {
        &mut self.test
    }

    fn data_shape(&self) -> Shape {
        self.data_shape
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn one_hot(labels: &[usize], n_classes: usize) -> GrowResult<Labels> {
    let mut out = Labels::zeros((labels.len(), n_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= n_classes {
            return Err(GrowError::Data(format!("label {label} out of range for {n_classes} classes")));
        }
        out[[i, label]] = 1.0;
    }
    Ok(out)
}

// =============================================================================
// Normalisation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalisation {
    None,
    #[serde(rename = "divide_255")]
    Divide255,
    #[default]
    #[serde(rename = "divide_256")]
    Divide256,
    /// Per-channel standardisation with the training split's statistics.
    ByChannels,
}

/// Per-channel mean and standard deviation over `[N, C, H, W]`.
pub fn channel_stats(images: &Tensor) -> Vec<(f32, f32)> {
    (0..images.dim().1)
        .map(|c| {
            let channel = images.index_axis(Axis(1), c);
            let mean = channel.mean().unwrap_or(0.0);
            let std = channel.std(0.0);
            (mean, std)
        })
        .collect()
}

/// Normalise raw 0–255 pixels in place. `stats` are required for
/// [`Normalisation::ByChannels`].
pub fn normalise(images: &mut Tensor, mode: Normalisation, stats: &[(f32, f32)]) {
    match mode {
        Normalisation::None => {}
        Normalisation::Divide255 => images.mapv_inplace(|v| v / 255.0),
        Normalisation::Divide256 => images.mapv_inplace(|v| v / 256.0),
        Normalisation::ByChannels => {
            for (c, &(mean, std)) in stats.iter().enumerate() {
                let std = if std > 0.0 { std } else { 1.0 };
                images.index_axis_mut(Axis(1), c).mapv_inplace(|v| (v - mean) / std);
            }
        }
    }
}

// =============================================================================
// Synthetic
// =============================================================================

/// Size and geometry of a synthetic dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSpec {
    pub channels: usize,
    pub image_size: usize,
    pub n_classes: usize,
    pub train_size: usize,
    pub validation_size: usize,
    pub test_size: usize,
    /// Standard deviation of the per-pixel noise around each prototype.
    pub noise: f32,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self { channels: 3, image_size: 8, n_classes: 4, train_size: 256, validation_size: 64, test_size: 64, noise: 0.3 }
    }
}

fn synthetic_split(
    prototypes: &Array4<f32>,
    count: usize,
    noise: f32,
    rng: &mut StdRng,
) -> GrowResult<(Tensor, Labels)> {
    let (n_classes, c, h, w) = prototypes.dim();
    let normal = Normal::new(0.0f32, noise.max(0.0))
        .map_err(|e| GrowError::Data(format!("invalid synthetic noise {noise}: {e}")))?;
    let mut images = Tensor::zeros((count, c, h, w));
    let mut classes = Vec::with_capacity(count);
    for i in 0..count {
        let class = i % n_classes;
        let mut image = images.index_axis_mut(Axis(0), i);
        image.assign(&prototypes.index_axis(Axis(0), class));
        image.mapv_inplace(|v| v + normal.sample(rng));
        classes.push(class);
    }
    Ok((images, one_hot(&classes, n_classes)?))
}

/// Deterministic dataset of noisy class prototypes.
pub fn synthetic(spec: &SyntheticSpec, seed: u64) -> GrowResult<InMemoryProvider> {
    if spec.n_classes == 0 || spec.channels == 0 || spec.image_size == 0 {
        return Err(GrowError::Data("synthetic dataset needs classes, channels and a non-zero size".into()));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let (c, s) = (spec.channels, spec.image_size);
    let prototypes = Array4::from_shape_fn((spec.n_classes, c, s, s), |_| rng.gen_range(-1.0f32..1.0));

    let (images, labels) = synthetic_split(&prototypes, spec.train_size, spec.noise, &mut rng)?;
    let train = InMemorySplit::new(images, labels, true, false, seed.wrapping_add(1))?;
    let validation = if spec.validation_size > 0 {
        let (images, labels) = synthetic_split(&prototypes, spec.validation_size, spec.noise, &mut rng)?;
        Some(InMemorySplit::new(images, labels, false, false, seed.wrapping_add(2))?)
    } else {
        None
    };
    let (images, labels) = synthetic_split(&prototypes, spec.test_size, spec.noise, &mut rng)?;
    let test = InMemorySplit::new(images, labels, false, false, seed.wrapping_add(3))?;
    Ok(InMemoryProvider::new("synthetic", spec.n_classes, train, validation, test))
}

// =============================================================================
// CIFAR
// =============================================================================

const CIFAR_SIDE: usize = 32;
const CIFAR_PIXELS: usize = 3 * CIFAR_SIDE * CIFAR_SIDE;

/// CIFAR variants, `+` meaning augmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CifarName {
    pub classes: usize,
    pub augment: bool,
}

impl FromStr for CifarName {
    type Err = GrowError;

    fn from_str(s: &str) -> GrowResult<Self> {
        let (base, augment) = match s.strip_suffix('+') {
            Some(base) => (base, true),
            None => (s, false),
        };
        let classes = match base {
            "C10" => 10,
            "C100" => 100,
            other => return Err(GrowError::Data(format!("unknown dataset '{other}'"))),
        };
        Ok(Self { classes, augment })
    }
}

impl fmt::Display for CifarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}{}", self.classes, if self.augment { "+" } else { "" })
    }
}

impl CifarName {
    /// Label bytes preceding each image; CIFAR-100 stores coarse then fine.
    fn label_bytes(self) -> usize {
        if self.classes == 100 {
            2
        } else {
            1
        }
    }

    fn train_files(self) -> Vec<String> {
        if self.classes == 100 {
            vec!["train.bin".into()]
        } else {
            (1..=5).map(|i| format!("data_batch_{i}.bin")).collect()
        }
    }

    fn test_file(self) -> &'static str {
        if self.classes == 100 {
            "test.bin"
        } else {
            "test_batch.bin"
        }
    }
}

#[derive(Debug, Clone)]
pub struct CifarOptions {
    pub normalisation: Normalisation,
    /// Fraction of the training records held out as validation.
    pub validation_fraction: f32,
    pub shuffle: bool,
    pub seed: u64,
}

/// Parse one binary CIFAR file into raw 0–255 images and class indices.
pub fn read_cifar_records(bytes: &[u8], name: CifarName) -> GrowResult<(Tensor, Vec<usize>)> {
    let record = name.label_bytes() + CIFAR_PIXELS;
    if bytes.len() % record != 0 {
        return Err(GrowError::Data(format!(
            "file length {} is not a multiple of the {}-byte record",
            bytes.len(),
            record
        )));
    }
    let n = bytes.len() / record;
    let mut images = Tensor::zeros((n, 3, CIFAR_SIDE, CIFAR_SIDE));
    let mut classes = Vec::with_capacity(n);
    for (i, chunk) in bytes.chunks_exact(record).enumerate() {
        classes.push(chunk[name.label_bytes() - 1] as usize);
        let pixels = &chunk[name.label_bytes()..];
        let image = Array3::from_shape_fn((3, CIFAR_SIDE, CIFAR_SIDE), |(c, y, x)| {
            pixels[(c * CIFAR_SIDE + y) * CIFAR_SIDE + x] as f32
        });
        images.index_axis_mut(Axis(0), i).assign(&image);
    }
    Ok((images, classes))
}

fn read_cifar_files(dir: &Path, files: &[String], name: CifarName) -> GrowResult<(Tensor, Vec<usize>)> {
    let mut parts = Vec::with_capacity(files.len());
    let mut classes = Vec::new();
    for file in files {
        let path = dir.join(file);
        let bytes = fs::read(&path).map_err(|e| GrowError::Data(format!("{}: {e}", path.display())))?;
        let (images, labels) = read_cifar_records(&bytes, name)?;
        parts.push(images);
        classes.extend(labels);
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok((ndarray::concatenate(Axis(0), &views)?, classes))
}

/// Load CIFAR-10 or CIFAR-100 from the binary distribution in `dir`.
pub fn load_cifar(dir: &Path, dataset: &str, options: &CifarOptions) -> GrowResult<InMemoryProvider> {
    let name: CifarName = dataset.parse()?;
    let (mut train_images, train_classes) = read_cifar_files(dir, &name.train_files(), name)?;
    let (mut test_images, test_classes) = read_cifar_files(dir, &[name.test_file().to_string()], name)?;

    let stats = channel_stats(&train_images);
    normalise(&mut train_images, options.normalisation, &stats);
    normalise(&mut test_images, options.normalisation, &stats);

    let train_labels = one_hot(&train_classes, name.classes)?;
    let n = train_images.dim().0;
    let held_out = ((n as f32) * options.validation_fraction.clamp(0.0, 1.0)) as usize;
    let keep = n - held_out;

    let validation = if held_out > 0 {
        Some(InMemorySplit::new(
            train_images.slice(s![keep.., .., .., ..]).to_owned(),
            train_labels.slice(s![keep.., ..]).to_owned(),
            false,
            false,
            options.seed.wrapping_add(2),
        )?)
    } else {
        None
    };
    let train = InMemorySplit::new(
        train_images.slice(s![..keep, .., .., ..]).to_owned(),
        train_labels.slice(s![..keep, ..]).to_owned(),
        options.shuffle,
        name.augment,
        options.seed.wrapping_add(1),
    )?;
    let test = InMemorySplit::new(
        test_images,
        one_hot(&test_classes, name.classes)?,
        false,
        false,
        options.seed.wrapping_add(3),
    )?;
    info!(
        "Loaded {}: {} train, {} validation, {} test examples",
        name,
        keep,
        held_out,
        test.num_examples()
    );
    Ok(InMemoryProvider::new(name.to_string(), name.classes, train, validation, test))
}

