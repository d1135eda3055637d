//! Component configuration.
//!
//! The host hands every component a flat set of string attributes. They are
//! parsed once into a [`GrabberConfig`] when the grabber is constructed and
//! never change afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::negotiation::FormatPreference;
use crate::traits::{CameraControl, ControlSetting, GrabberError, Result};

/// Raw key-value attributes as supplied by the host graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    /// Create an empty attribute set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute, builder style.
    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    /// Add or replace an attribute.
    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_owned(), value.to_owned());
    }

    /// Raw attribute value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Non-empty string attribute.
    pub fn string(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    }

    /// Integer attribute. Absent means `None`.
    pub fn int(&self, key: &str) -> Result<Option<i32>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|err| GrabberError::InvalidAttribute {
                key: key.to_owned(),
                value: raw.to_owned(),
                reason: err.to_string(),
            })
    }

    /// Boolean attribute: set only by the literal string `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| value.trim() == "true")
    }

    /// Whether `key` is present at all.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Parse attributes from a TOML document of top-level scalar keys.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let table: toml::Table =
            toml::from_str(source).map_err(|err| GrabberError::InvalidAttribute {
                key: "<document>".to_owned(),
                value: String::new(),
                reason: err.to_string(),
            })?;

        let mut attributes = Self::new();
        for (key, value) in table {
            let text = match value {
                toml::Value::String(text) => text,
                toml::Value::Integer(number) => number.to_string(),
                toml::Value::Float(number) => number.to_string(),
                toml::Value::Boolean(flag) => flag.to_string(),
                other => {
                    return Err(GrabberError::InvalidAttribute {
                        key,
                        value: other.to_string(),
                        reason: "expected a string, number or boolean".to_owned(),
                    });
                }
            };
            attributes.insert(&key, &text);
        }
        Ok(attributes)
    }

    /// Load attributes from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Where the camera intrinsics and distortion come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CameraModelSource {
    /// Ideal pinhole without distortion.
    #[default]
    Identity,
    /// A single file holding intrinsics and distortion.
    ModelFile(PathBuf),
    /// Separate intrinsic matrix and distortion coefficient files.
    Separate {
        /// Intrinsic matrix file.
        intrinsics: PathBuf,
        /// Distortion coefficient file.
        distortion: PathBuf,
    },
}

/// Parsed, immutable configuration of one frame grabber.
#[derive(Debug, Clone, PartialEq)]
pub struct GrabberConfig {
    /// Fixed shift applied to every output timestamp (milliseconds).
    pub time_offset_ms: i64,
    /// Only every Nth captured frame is forwarded.
    pub divisor: u32,
    /// Desired output width; non-positive means "don't care".
    pub desired_width: i32,
    /// Desired output height; non-positive means "don't care".
    pub desired_height: i32,
    /// Substring of the friendly name of the device to use.
    pub device_name: Option<String>,
    /// Substring of the path of the device to use.
    pub device_path: Option<String>,
    /// Camera controls to apply, in application order.
    pub controls: Vec<(CameraControl, ControlSetting)>,
    /// Camera model to undistort with.
    pub camera_model: CameraModelSource,
    /// Defer running the graph until GPU upload is ready.
    pub upload_image_on_gpu: bool,
    /// Tie-break between equally sized capture formats.
    pub format_preference: FormatPreference,
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            time_offset_ms: 0,
            divisor: 1,
            desired_width: 320,
            desired_height: 240,
            device_name: None,
            device_path: None,
            controls: Vec::new(),
            camera_model: CameraModelSource::Identity,
            upload_image_on_gpu: false,
            format_preference: FormatPreference::default(),
        }
    }
}

/// Integer controls that are always manual.
const MANUAL_CONTROLS: [(&str, CameraControl); 6] = [
    ("cameraGain", CameraControl::Gain),
    ("cameraBrightness", CameraControl::Brightness),
    ("cameraContrast", CameraControl::Contrast),
    ("cameraSaturation", CameraControl::Saturation),
    ("cameraSharpness", CameraControl::Sharpness),
    ("cameraGamma", CameraControl::Gamma),
];

/// Integer controls with a companion `...Auto` flag.
const AUTO_CAPABLE_CONTROLS: [(&str, &str, CameraControl); 2] = [
    ("cameraExposure", "cameraExposureAuto", CameraControl::Exposure),
    (
        "cameraWhitebalance",
        "cameraWhitebalanceAuto",
        CameraControl::WhiteBalance,
    ),
];

impl GrabberConfig {
    /// Parse the configuration from host attributes. Absent attributes keep
    /// their defaults.
    pub fn from_attributes(attributes: &Attributes) -> Result<Self> {
        let mut config = Self::default();

        if let Some(offset) = attributes.int("timeOffset")? {
            config.time_offset_ms = i64::from(offset);
        }

        if let Some(divisor) = attributes.int("divisor")? {
            config.divisor = u32::try_from(divisor)
                .ok()
                .filter(|divisor| *divisor > 0)
                .ok_or_else(|| GrabberError::InvalidAttribute {
                    key: "divisor".to_owned(),
                    value: divisor.to_string(),
                    reason: "must be at least 1".to_owned(),
                })?;
        }

        if let Some(width) = attributes.int("imageWidth")? {
            config.desired_width = width;
        }
        if let Some(height) = attributes.int("imageHeight")? {
            config.desired_height = height;
        }

        config.device_name = attributes.string("cameraName");
        config.device_path = attributes.string("devicePath");
        config.controls = parse_controls(attributes)?;
        config.camera_model = parse_camera_model(attributes)?;
        config.upload_image_on_gpu = attributes.flag("uploadImageOnGPU");

        if let Some(raw) = attributes.string("formatPreference") {
            config.format_preference =
                raw.parse()
                    .map_err(|reason| GrabberError::InvalidAttribute {
                        key: "formatPreference".to_owned(),
                        value: raw.clone(),
                        reason,
                    })?;
        }

        Ok(config)
    }
}

fn parse_controls(attributes: &Attributes) -> Result<Vec<(CameraControl, ControlSetting)>> {
    let mut controls = Vec::new();

    for (value_key, auto_key, control) in AUTO_CAPABLE_CONTROLS {
        let value = attributes.int(value_key)?;
        if attributes.flag(auto_key) {
            controls.push((control, ControlSetting::auto(value.unwrap_or(0))));
        } else if let Some(value) = value {
            controls.push((control, ControlSetting::manual(value)));
        }
    }

    for (key, control) in MANUAL_CONTROLS {
        if let Some(value) = attributes.int(key)? {
            controls.push((control, ControlSetting::manual(value)));
        }
    }

    if attributes.contains("cameraBacklightComp") {
        let enabled = attributes.flag("cameraBacklightComp");
        controls.push((
            CameraControl::BacklightCompensation,
            ControlSetting::manual(i32::from(enabled)),
        ));
    }

    Ok(controls)
}

fn parse_camera_model(attributes: &Attributes) -> Result<CameraModelSource> {
    if let Some(path) = attributes.string("cameraModelFile") {
        return Ok(CameraModelSource::ModelFile(PathBuf::from(path)));
    }

    match (
        attributes.string("intrinsicMatrixFile"),
        attributes.string("distortionFile"),
    ) {
        (Some(intrinsics), Some(distortion)) => Ok(CameraModelSource::Separate {
            intrinsics: PathBuf::from(intrinsics),
            distortion: PathBuf::from(distortion),
        }),
        (None, None) => Ok(CameraModelSource::Identity),
        (Some(_), None) => Err(GrabberError::InvalidAttribute {
            key: "distortionFile".to_owned(),
            value: String::new(),
            reason: "required together with intrinsicMatrixFile".to_owned(),
        }),
        (None, Some(_)) => Err(GrabberError::InvalidAttribute {
            key: "intrinsicMatrixFile".to_owned(),
            value: String::new(),
            reason: "required together with distortionFile".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ControlMode;

    #[test]
    fn test_defaults_when_empty() {
        let config = GrabberConfig::from_attributes(&Attributes::new()).expect("parse failed");
        assert_eq!(config, GrabberConfig::default());
        assert_eq!(config.desired_width, 320);
        assert_eq!(config.desired_height, 240);
        assert_eq!(config.divisor, 1);
        assert!(config.controls.is_empty());
    }

    #[test]
    fn test_parses_core_attributes() {
        let attributes = Attributes::new()
            .with("timeOffset", "-15")
            .with("divisor", "3")
            .with("imageWidth", "640")
            .with("imageHeight", "480")
            .with("cameraName", "Logitech")
            .with("devicePath", "usb-0000")
            .with("uploadImageOnGPU", "true");

        let config = GrabberConfig::from_attributes(&attributes).expect("parse failed");
        assert_eq!(config.time_offset_ms, -15);
        assert_eq!(config.divisor, 3);
        assert_eq!(config.desired_width, 640);
        assert_eq!(config.desired_height, 480);
        assert_eq!(config.device_name.as_deref(), Some("Logitech"));
        assert_eq!(config.device_path.as_deref(), Some("usb-0000"));
        assert!(config.upload_image_on_gpu);
    }

    #[test]
    fn test_flag_requires_literal_true() {
        let attributes = Attributes::new().with("uploadImageOnGPU", "yes");
        let config = GrabberConfig::from_attributes(&attributes).expect("parse failed");
        assert!(!config.upload_image_on_gpu);
    }

    #[test]
    fn test_rejects_zero_divisor() {
        let attributes = Attributes::new().with("divisor", "0");
        let result = GrabberConfig::from_attributes(&attributes);
        assert!(matches!(
            result,
            Err(GrabberError::InvalidAttribute { ref key, .. }) if key == "divisor"
        ));
    }

    #[test]
    fn test_rejects_non_numeric() {
        let attributes = Attributes::new().with("imageWidth", "wide");
        assert!(GrabberConfig::from_attributes(&attributes).is_err());
    }

    #[test]
    fn test_parses_controls() {
        let attributes = Attributes::new()
            .with("cameraExposure", "-6")
            .with("cameraWhitebalance", "4500")
            .with("cameraWhitebalanceAuto", "true")
            .with("cameraGain", "12")
            .with("cameraBacklightComp", "false");

        let config = GrabberConfig::from_attributes(&attributes).expect("parse failed");
        assert_eq!(
            config.controls,
            vec![
                (CameraControl::Exposure, ControlSetting::manual(-6)),
                (CameraControl::WhiteBalance, ControlSetting::auto(4500)),
                (CameraControl::Gain, ControlSetting::manual(12)),
                (
                    CameraControl::BacklightCompensation,
                    ControlSetting::manual(0)
                ),
            ]
        );
    }

    #[test]
    fn test_auto_without_value() {
        let attributes = Attributes::new().with("cameraExposureAuto", "true");
        let config = GrabberConfig::from_attributes(&attributes).expect("parse failed");
        let (control, setting) = config.controls.first().copied().expect("one control");
        assert_eq!(control, CameraControl::Exposure);
        assert_eq!(setting.mode, ControlMode::Auto);
    }

    #[test]
    fn test_camera_model_sources() {
        let single = Attributes::new().with("cameraModelFile", "cam.toml");
        assert_eq!(
            GrabberConfig::from_attributes(&single)
                .expect("parse failed")
                .camera_model,
            CameraModelSource::ModelFile(PathBuf::from("cam.toml"))
        );

        let separate = Attributes::new()
            .with("intrinsicMatrixFile", "k.toml")
            .with("distortionFile", "d.toml");
        assert_eq!(
            GrabberConfig::from_attributes(&separate)
                .expect("parse failed")
                .camera_model,
            CameraModelSource::Separate {
                intrinsics: PathBuf::from("k.toml"),
                distortion: PathBuf::from("d.toml"),
            }
        );

        let half = Attributes::new().with("intrinsicMatrixFile", "k.toml");
        assert!(GrabberConfig::from_attributes(&half).is_err());
    }

    #[test]
    fn test_format_preference_attribute() {
        let attributes = Attributes::new().with("formatPreference", "frameRateThenLayout");
        let config = GrabberConfig::from_attributes(&attributes).expect("parse failed");
        assert_eq!(
            config.format_preference,
            FormatPreference::FrameRateThenLayout
        );
    }

    #[test]
    fn test_attributes_from_toml() {
        let attributes = Attributes::from_toml_str(
            r#"
            cameraName = "Cam"
            imageWidth = 640
            uploadImageOnGPU = true
            "#,
        )
        .expect("toml should parse");

        assert_eq!(attributes.get("cameraName"), Some("Cam"));
        assert_eq!(attributes.int("imageWidth").expect("int"), Some(640));
        assert!(attributes.flag("uploadImageOnGPU"));
    }

    #[test]
    fn test_attributes_from_toml_rejects_tables() {
        let result = Attributes::from_toml_str("[camera]\nname = \"x\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_attributes_load_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grabber.toml");
        std::fs::write(&path, "divisor = 2\n").expect("write config");

        let attributes = Attributes::load(&path).expect("load failed");
        let config = GrabberConfig::from_attributes(&attributes).expect("parse failed");
        assert_eq!(config.divisor, 2);
    }
}
