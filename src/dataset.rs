use crate::augment::{AffineTransform, AugmentationConfig};
use crate::CHANNELS;

use burn::config::Config;
use burn::data::dataset::transform::{Mapper, MapperDataset};
use burn::data::dataset::Dataset;
use globwalk::{DirEntry, GlobWalkerBuilder};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SUPPORTED_FILES: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Subdirectory holding the training split.
pub const TRAINING_SPLIT: &str = "training_set";
/// Subdirectory holding the validation split.
pub const TEST_SPLIT: &str = "test_set";

/// Batching and augmentation of the image folders.
///
/// The image size and class count come from the model configuration.
#[derive(Config, Debug)]
pub struct DatasetConfig {
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,
}

/// Error type for [ImageFolder](ImageFolder).
#[derive(Error, Debug)]
pub enum DatasetError {
    /// The split directory does not exist.
    #[error("dataset directory `{0}` does not exist")]
    MissingDirectory(PathBuf),

    /// I/O operation error.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The number of class folders differs from the configured class count.
    #[error("expected {expected} class folders in `{root}`, found {}: {classes:?}", .classes.len())]
    ClassCountMismatch {
        root: PathBuf,
        expected: usize,
        classes: Vec<String>,
    },

    /// A split does not have the same classes as the training split.
    #[error("classes {found:?} in `{root}` do not match the training classes {expected:?}")]
    ClassMismatch {
        root: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// A loaded split does not have the layout the model expects.
    #[error(
        "`{root}` holds {found_classes} classes of {found:?} images, \
         the model expects {expected_classes} classes of {expected:?} images"
    )]
    LayoutMismatch {
        root: PathBuf,
        expected_classes: usize,
        expected: [usize; 3],
        found_classes: usize,
        found: [usize; 3],
    },

    /// A class folder holds no supported image.
    #[error("class folder `{0}` contains no images")]
    EmptyClass(PathBuf),

    /// An image could not be decoded.
    #[error("failed to decode image `{path}`: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Directory traversal could not be set up.
    #[error("could not walk `{path}`: {message}")]
    Walk { path: PathBuf, message: String },
}

/// A labelled image, HWC, rescaled to `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageItem {
    pub pixels: Vec<f32>,
    pub label: usize,
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
struct StoredImage {
    pixels: Vec<u8>,
    label: usize,
    path: PathBuf,
}

/// Every image of one split, decoded and resized up front.
///
/// The label of an image is the position of its parent class folder among
/// the sorted class folder names.
#[derive(Debug)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    images: Vec<StoredImage>,
    height: usize,
    width: usize,
}

impl ImageFolder {
    /// Loads a split, requiring exactly `num_classes` class folders. Images
    /// are resized to `size` (`[height, width]`).
    pub fn load<P: AsRef<Path>>(
        root: P,
        num_classes: usize,
        size: [usize; 2],
    ) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        let classes = list_classes(root)?;

        if classes.len() != num_classes {
            return Err(DatasetError::ClassCountMismatch {
                root: root.to_path_buf(),
                expected: num_classes,
                classes,
            });
        }

        Self::load_classes(root, classes, size)
    }

    /// Loads a split whose class folders must match `classes` exactly.
    pub fn load_matching<P: AsRef<Path>>(
        root: P,
        classes: &[String],
        size: [usize; 2],
    ) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        let found = list_classes(root)?;

        if found != classes {
            return Err(DatasetError::ClassMismatch {
                root: root.to_path_buf(),
                expected: classes.to_vec(),
                found,
            });
        }

        Self::load_classes(root, found, size)
    }

    fn load_classes(
        root: &Path,
        classes: Vec<String>,
        size: [usize; 2],
    ) -> Result<Self, DatasetError> {
        let [height, width] = size;
        let mut images = Vec::new();

        for (label, class) in classes.iter().enumerate() {
            let class_dir = root.join(class);
            let paths = list_images(&class_dir)?;

            if paths.is_empty() {
                return Err(DatasetError::EmptyClass(class_dir));
            }

            for path in paths {
                let pixels = decode(&path, width, height)?;
                images.push(StoredImage {
                    pixels,
                    label,
                    path,
                });
            }
        }

        log::info!(
            "Found {} images belonging to {} classes in {}",
            images.len(),
            classes.len(),
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            classes,
            images,
            height,
            width,
        })
    }

    /// Class names, in label order.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of images per label.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for image in self.images.iter() {
            counts[image.label] += 1;
        }
        counts
    }

    /// `[height, width, channels]` of every item.
    pub fn image_dims(&self) -> [usize; 3] {
        [self.height, self.width, CHANNELS]
    }

    /// Checks the class count and image shape against what a model expects.
    pub fn check_layout(
        &self,
        num_classes: usize,
        input_shape: [usize; 3],
    ) -> Result<(), DatasetError> {
        if self.classes.len() == num_classes && self.image_dims() == input_shape {
            return Ok(());
        }

        Err(DatasetError::LayoutMismatch {
            root: self.root.clone(),
            expected_classes: num_classes,
            expected: input_shape,
            found_classes: self.classes.len(),
            found: self.image_dims(),
        })
    }
}

impl Dataset<ImageItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let image = self.images.get(index)?;

        Some(ImageItem {
            pixels: image.pixels.iter().map(|&p| p as f32 / 255.0).collect(),
            label: image.label,
            path: image.path.clone(),
        })
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// Random shear and zoom, drawn again for every access.
#[derive(Clone, Debug)]
pub struct Augmentation {
    config: AugmentationConfig,
    height: usize,
    width: usize,
}

impl Augmentation {
    /// Augments `[height, width]` images.
    pub fn new(config: &AugmentationConfig, size: [usize; 2]) -> Self {
        let [height, width] = size;
        Self {
            config: config.clone(),
            height,
            width,
        }
    }
}

impl Mapper<ImageItem, ImageItem> for Augmentation {
    fn map(&self, item: &ImageItem) -> ImageItem {
        let transform = AffineTransform::sample(&self.config, &mut rand::rng());

        ImageItem {
            pixels: transform.apply(&item.pixels, self.height, self.width, CHANNELS),
            label: item.label,
            path: item.path.clone(),
        }
    }
}

/// Training split with on-the-fly augmentation.
pub type AugmentedDataset<D> = MapperDataset<D, Augmentation, ImageItem>;

/// Wraps a split so that every access returns a freshly augmented image.
pub fn augmented<D: Dataset<ImageItem>>(
    dataset: D,
    config: &AugmentationConfig,
    size: [usize; 2],
) -> AugmentedDataset<D> {
    MapperDataset::new(dataset, Augmentation::new(config, size))
}

fn list_classes(root: &Path) -> Result<Vec<String>, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::MissingDirectory(root.to_path_buf()));
    }

    let io_err = |source| DatasetError::Io {
        path: root.to_path_buf(),
        source,
    };

    let mut classes = Vec::new();
    for entry in std::fs::read_dir(root).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.path().is_dir() {
            classes.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    classes.sort();

    Ok(classes)
}

fn list_images(class_dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    // "*.{ext1,ext2,ext3}"
    let pattern = format!("*.{{{}}}", SUPPORTED_FILES.join(","));

    let walker = GlobWalkerBuilder::from_patterns(class_dir, &[pattern])
        .follow_links(true)
        .case_insensitive(true)
        .sort_by(|p1: &DirEntry, p2: &DirEntry| p1.path().cmp(p2.path()))
        .build()
        .map_err(|err| DatasetError::Walk {
            path: class_dir.to_path_buf(),
            message: err.to_string(),
        })?;

    Ok(walker
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .collect())
}

fn decode(path: &Path, width: usize, height: usize) -> Result<Vec<u8>, DatasetError> {
    let image = image::open(path).map_err(|source| DatasetError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(image
        .resize_exact(width as u32, height as u32, FilterType::Nearest)
        .into_rgb8()
        .into_raw())
}
