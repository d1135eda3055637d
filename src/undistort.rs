//! Lens undistortion and the shared, replaceable camera model.
//!
//! The model is the usual pinhole camera with Brown-Conrady distortion
//! (radial `k1`, `k2`, `k3`, tangential `p1`, `p2`). Undistortion builds an
//! OpenCV rectification map for the image size in use and remaps each frame
//! through it bilinearly.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use opencv::calib3d;
use opencv::core::{self, Mat, Scalar, Size, BORDER_CONSTANT, CV_32FC1};
use opencv::imgproc::{self, INTER_LINEAR};
use opencv::prelude::*;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::CameraModelSource;
use crate::frame::Image;
use crate::traits::{GrabberError, Origin, Result};

/// Row-major 3x3 matrix.
pub type Matrix3 = [[f64; 3]; 3];

/// Intrinsic and distortion parameters of a camera.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraModel {
    /// Width of the calibration images (0 if unknown).
    #[serde(default)]
    pub width: u32,
    /// Height of the calibration images (0 if unknown).
    #[serde(default)]
    pub height: u32,
    /// Focal length along x, in pixels.
    pub fx: f64,
    /// Focal length along y, in pixels.
    pub fy: f64,
    /// Principal point x.
    pub cx: f64,
    /// Principal point y.
    pub cy: f64,
    /// Axis skew.
    #[serde(default)]
    pub skew: f64,
    /// First radial coefficient.
    #[serde(default)]
    pub k1: f64,
    /// Second radial coefficient.
    #[serde(default)]
    pub k2: f64,
    /// Third radial coefficient.
    #[serde(default)]
    pub k3: f64,
    /// First tangential coefficient.
    #[serde(default)]
    pub p1: f64,
    /// Second tangential coefficient.
    #[serde(default)]
    pub p2: f64,
}

#[derive(Debug, Deserialize)]
struct IntrinsicsFile {
    matrix: Matrix3,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

/// Coefficients in the order k1, k2, p1, p2 and optionally k3.
#[derive(Debug, Deserialize)]
struct DistortionFile {
    coefficients: Vec<f64>,
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let source = std::fs::read_to_string(path).map_err(|err| GrabberError::CameraModel {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    toml::from_str(&source).map_err(|err| GrabberError::CameraModel {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

impl CameraModel {
    /// Distortion-free pinhole model for a `width` x `height` image.
    #[must_use]
    pub fn identity(width: u32, height: u32) -> Self {
        let focal = f64::from(width.max(height).max(1));
        Self {
            width,
            height,
            fx: focal,
            fy: focal,
            cx: f64::from(width) / 2.0,
            cy: f64::from(height) / 2.0,
            skew: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }

    /// Load a single-file camera model.
    pub fn from_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    /// Combine an intrinsic matrix file and a distortion coefficient file.
    pub fn from_separate_files(intrinsics: &Path, distortion: &Path) -> Result<Self> {
        let matrix: IntrinsicsFile = read_toml(intrinsics)?;
        let coefficients: DistortionFile = read_toml(distortion)?;

        let [[fx, skew, cx], [_, fy, cy], _] = matrix.matrix;
        let mut model = Self {
            width: matrix.width,
            height: matrix.height,
            fx,
            fy,
            cx,
            cy,
            skew,
            ..Self::identity(matrix.width, matrix.height)
        };

        match coefficients.coefficients.as_slice() {
            [k1, k2, p1, p2] => {
                (model.k1, model.k2, model.p1, model.p2) = (*k1, *k2, *p1, *p2);
            }
            [k1, k2, p1, p2, k3] => {
                (model.k1, model.k2, model.p1, model.p2, model.k3) = (*k1, *k2, *p1, *p2, *k3);
            }
            other => {
                return Err(GrabberError::CameraModel {
                    path: distortion.to_path_buf(),
                    reason: format!("expected 4 or 5 coefficients, found {}", other.len()),
                });
            }
        }

        Ok(model)
    }

    /// Resolve a configured model source. `width` and `height` size the
    /// identity model.
    pub fn load(source: &CameraModelSource, width: u32, height: u32) -> Result<Self> {
        let model = match source {
            CameraModelSource::Identity => Self::identity(width, height),
            CameraModelSource::ModelFile(path) => Self::from_file(path)?,
            CameraModelSource::Separate {
                intrinsics,
                distortion,
            } => Self::from_separate_files(intrinsics, distortion)?,
        };
        info!(
            fx = model.fx,
            fy = model.fy,
            cx = model.cx,
            cy = model.cy,
            distorted = model.has_distortion(),
            "camera model loaded"
        );
        Ok(model)
    }

    /// The 3x3 intrinsic matrix.
    #[must_use]
    pub const fn intrinsic_matrix(&self) -> Matrix3 {
        [
            [self.fx, self.skew, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    /// Whether any distortion coefficient is non-zero.
    #[must_use]
    pub fn has_distortion(&self) -> bool {
        [self.k1, self.k2, self.k3, self.p1, self.p2]
            .iter()
            .any(|coefficient| *coefficient != 0.0)
    }

    /// The model adjusted to images of `width` x `height`. Models without a
    /// known calibration size are returned unchanged.
    #[must_use]
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        if self.width == 0 || self.height == 0 || (self.width, self.height) == (width, height) {
            return self.clone();
        }
        let sx = f64::from(width) / f64::from(self.width);
        let sy = f64::from(height) / f64::from(self.height);
        Self {
            width,
            height,
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            skew: self.skew * sx,
            ..self.clone()
        }
    }

    /// Distortion coefficients in OpenCV order: k1, k2, p1, p2, k3.
    #[must_use]
    pub const fn distortion_coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }
}

fn to_size(width: u32, height: u32) -> Result<Size> {
    match (i32::try_from(width), i32::try_from(height)) {
        (Ok(width), Ok(height)) => Ok(Size::new(width, height)),
        _ => Err(GrabberError::FrameValidation(format!(
            "{width}x{height} exceeds the matrix size limit"
        ))),
    }
}

/// Rectification maps for one image size.
struct RemapTable {
    width: u32,
    height: u32,
    map_x: Mat,
    map_y: Mat,
}

impl RemapTable {
    fn build(model: &CameraModel, width: u32, height: u32) -> Result<Self> {
        let model = model.scaled_to(width, height);
        let matrix = model.intrinsic_matrix();
        let camera = Mat::from_slice_2d::<f64>(matrix.as_slice())?;
        let distortion = model.distortion_coefficients();
        let coefficients = Mat::from_slice(distortion.as_slice())?.try_clone()?;

        let mut map_x = Mat::default();
        let mut map_y = Mat::default();
        calib3d::init_undistort_rectify_map(
            &camera,
            &coefficients,
            &Mat::default(),
            &camera,
            to_size(width, height)?,
            CV_32FC1,
            &mut map_x,
            &mut map_y,
        )?;
        debug!(width, height, "built undistortion maps");

        Ok(Self {
            width,
            height,
            map_x,
            map_y,
        })
    }

    const fn fits(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Maps are top-down; bottom-up images are flipped around the remap.
    fn apply(&self, image: &Image) -> Result<Image> {
        let bottom_up = image.origin() == Origin::BottomLeft;
        let mut source = image.to_mat()?;
        if bottom_up {
            let mut flipped = Mat::default();
            core::flip(&source, &mut flipped, 0)?;
            source = flipped;
        }

        let mut corrected = Mat::default();
        imgproc::remap(
            &source,
            &mut corrected,
            &self.map_x,
            &self.map_y,
            INTER_LINEAR,
            BORDER_CONSTANT,
            Scalar::default(),
        )?;

        if bottom_up {
            let mut flipped = Mat::default();
            core::flip(&corrected, &mut flipped, 0)?;
            corrected = flipped;
        }
        image.with_mat(&corrected)
    }
}

/// Removes lens distortion with one fixed camera model.
pub struct Undistorter {
    model: CameraModel,
    table: Mutex<Option<RemapTable>>,
}

impl std::fmt::Debug for Undistorter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Undistorter")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl Undistorter {
    /// Create an undistorter for `model`.
    #[must_use]
    pub const fn new(model: CameraModel) -> Self {
        Self {
            model,
            table: Mutex::new(None),
        }
    }

    /// The camera model in use.
    pub const fn model(&self) -> &CameraModel {
        &self.model
    }

    /// Remove lens distortion from `image`.
    ///
    /// Images already flagged as undistorted are returned untouched, so no
    /// image is ever corrected twice.
    pub fn undistort(&self, image: Image) -> Result<Image> {
        if image.is_undistorted() {
            debug!("image already undistorted, skipping");
            return Ok(image);
        }
        if !self.model.has_distortion() || image.width() == 0 || image.height() == 0 {
            return Ok(image.mark_undistorted());
        }

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let remap = match table.take() {
            Some(existing) if existing.fits(image.width(), image.height()) => existing,
            _ => RemapTable::build(&self.model, image.width(), image.height())?,
        };
        let corrected = remap.apply(&image);
        *table = Some(remap);

        Ok(corrected?.mark_undistorted())
    }
}

/// The current camera model, replaceable at runtime.
///
/// Readers take a snapshot with [`SharedIntrinsics::current`]; a replacement
/// only affects snapshots taken afterwards.
#[derive(Debug)]
pub struct SharedIntrinsics {
    current: RwLock<Arc<Undistorter>>,
}

impl SharedIntrinsics {
    /// Start with `model`.
    #[must_use]
    pub fn new(model: CameraModel) -> Self {
        Self {
            current: RwLock::new(Arc::new(Undistorter::new(model))),
        }
    }

    /// Snapshot of the current undistorter.
    pub fn current(&self) -> Arc<Undistorter> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the camera model wholesale.
    pub fn replace(&self, model: CameraModel) {
        let next = Arc::new(Undistorter::new(model));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        info!("camera model replaced");
    }

    /// Intrinsic matrix of the current model.
    pub fn intrinsic_matrix(&self) -> Matrix3 {
        self.current().model().intrinsic_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChannelSeq;

    fn flat(width: u32, height: u32, value: u8) -> Image {
        Image::new(
            width,
            height,
            ChannelSeq::Gray,
            vec![value; (width * height) as usize],
        )
        .expect("valid image")
    }

    fn barrel() -> CameraModel {
        CameraModel {
            k1: 0.5,
            ..CameraModel {
                fx: 4.0,
                fy: 4.0,
                cx: 4.0,
                cy: 4.0,
                ..CameraModel::identity(9, 9)
            }
        }
    }

    #[test]
    fn test_identity_marks_without_changing() {
        let undistorter = Undistorter::new(CameraModel::identity(8, 8));
        let image = flat(8, 8, 77);
        let out = undistorter.undistort(image.clone()).expect("undistort failed");
        assert!(out.is_undistorted());
        assert_eq!(out.data(), image.data());
    }

    #[test]
    fn test_distortion_moves_pixels() {
        let undistorter = Undistorter::new(barrel());
        let out = undistorter.undistort(flat(9, 9, 200)).expect("undistort failed");

        assert!(out.is_undistorted());
        assert_eq!(out.pixel(4, 4), Some(&[200][..]));
        // The corner maps far outside the source image.
        assert_eq!(out.pixel(0, 0), Some(&[0][..]));
    }

    #[test]
    fn test_never_undistorts_twice() {
        let undistorter = Undistorter::new(barrel());
        let once = undistorter.undistort(flat(9, 9, 200)).expect("undistort failed");
        let twice = undistorter.undistort(once.clone()).expect("undistort failed");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_bottom_left_origin_is_mirrored() {
        let undistorter = Undistorter::new(barrel());
        let top_down = undistorter.undistort(flat(9, 9, 200)).expect("undistort failed");
        let bottom_up = undistorter
            .undistort(flat(9, 9, 200).with_origin(Origin::BottomLeft))
            .expect("undistort failed");
        // A vertically symmetric input produces the same output either way.
        assert_eq!(top_down.data(), bottom_up.data());
    }

    #[test]
    fn test_scaled_to() {
        let model = CameraModel {
            fx: 500.0,
            fy: 510.0,
            cx: 320.0,
            cy: 240.0,
            ..CameraModel::identity(640, 480)
        };
        let half = model.scaled_to(320, 240);
        assert!((half.fx - 250.0).abs() < 1e-9);
        assert!((half.fy - 255.0).abs() < 1e-9);
        assert!((half.cx - 160.0).abs() < 1e-9);
        assert!((half.cy - 120.0).abs() < 1e-9);

        let unknown = CameraModel::identity(0, 0);
        assert_eq!(unknown.scaled_to(320, 240), unknown);
    }

    #[test]
    fn test_intrinsic_matrix() {
        let model = CameraModel::identity(640, 480);
        assert_eq!(
            model.intrinsic_matrix(),
            [[640.0, 0.0, 320.0], [0.0, 640.0, 240.0], [0.0, 0.0, 1.0]]
        );
    }

    #[test]
    fn test_load_single_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("camera.toml");
        std::fs::write(
            &path,
            "width = 640\nheight = 480\nfx = 600.0\nfy = 600.0\ncx = 320.0\ncy = 240.0\nk1 = -0.2\n",
        )
        .expect("write model");

        let model = CameraModel::load(&CameraModelSource::ModelFile(path), 320, 240)
            .expect("load failed");
        assert_eq!(model.width, 640);
        assert!((model.k1 + 0.2).abs() < 1e-12);
        assert!(model.has_distortion());
    }

    #[test]
    fn test_load_separate_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let intrinsics = dir.path().join("K.toml");
        let distortion = dir.path().join("D.toml");
        std::fs::write(
            &intrinsics,
            "matrix = [[600.0, 0.0, 320.0], [0.0, 610.0, 240.0], [0.0, 0.0, 1.0]]\n",
        )
        .expect("write intrinsics");
        std::fs::write(&distortion, "coefficients = [0.1, 0.01, 0.001, 0.002, 0.05]\n")
            .expect("write distortion");

        let model = CameraModel::load(
            &CameraModelSource::Separate {
                intrinsics,
                distortion,
            },
            320,
            240,
        )
        .expect("load failed");

        assert!((model.fy - 610.0).abs() < 1e-12);
        assert!((model.p2 - 0.002).abs() < 1e-12);
        assert!((model.k3 - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_load_rejects_bad_coefficients() {
        let dir = tempfile::tempdir().expect("tempdir");
        let intrinsics = dir.path().join("K.toml");
        let distortion = dir.path().join("D.toml");
        std::fs::write(
            &intrinsics,
            "matrix = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]\n",
        )
        .expect("write intrinsics");
        std::fs::write(&distortion, "coefficients = [0.1]\n").expect("write distortion");

        let result = CameraModel::from_separate_files(&intrinsics, &distortion);
        assert!(matches!(result, Err(GrabberError::CameraModel { .. })));
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = CameraModel::from_file(Path::new("/nonexistent/camera.toml"));
        assert!(matches!(result, Err(GrabberError::CameraModel { .. })));
    }

    #[test]
    fn test_replace_affects_new_snapshots_only() {
        let shared = SharedIntrinsics::new(CameraModel::identity(8, 8));
        let before = shared.current();
        shared.replace(barrel());
        let after = shared.current();

        assert!(!before.model().has_distortion());
        assert!(after.model().has_distortion());
        let [[fx, ..], ..] = shared.intrinsic_matrix();
        assert!((fx - 4.0).abs() < 1e-12);
    }
}
