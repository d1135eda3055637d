//! Owned image buffers and the color operations the processor needs.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Rgb};
use opencv::core::Mat;
use opencv::imgproc::{self, COLOR_BGR2GRAY, COLOR_RGB2GRAY};
use opencv::prelude::*;

use crate::traits::{FrameSample, GrabberError, Origin, PixelFormat, Result};

/// Channel sequence of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSeq {
    /// Blue, green, red.
    Bgr,
    /// Red, green, blue.
    Rgb,
    /// Single luminance channel.
    Gray,
}

impl ChannelSeq {
    /// Number of interleaved channels.
    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::Bgr | Self::Rgb => 3,
            Self::Gray => 1,
        }
    }

    const fn from_pixel_format(format: PixelFormat) -> Option<Self> {
        match format {
            PixelFormat::Bgr24 => Some(Self::Bgr),
            PixelFormat::Rgb24 => Some(Self::Rgb),
            PixelFormat::Gray8 => Some(Self::Gray),
            _ => None,
        }
    }
}

/// A tightly packed 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    channels: ChannelSeq,
    origin: Origin,
    undistorted: bool,
    data: Vec<u8>,
}

impl Image {
    /// Wrap `data`, which must hold exactly `width * height * channels` bytes.
    pub fn new(width: u32, height: u32, channels: ChannelSeq, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * channels.channels();
        if data.len() != expected {
            return Err(GrabberError::FrameValidation(format!(
                "image buffer holds {} bytes, {width}x{height} {channels:?} needs {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            origin: Origin::TopLeft,
            undistorted: false,
            data,
        })
    }

    /// Copy a borrowed frame sample into an owned, tightly packed image.
    pub fn from_sample(sample: &FrameSample<'_>) -> Result<Self> {
        let format = sample.format;
        let channels = ChannelSeq::from_pixel_format(format.pixel_format).ok_or_else(|| {
            GrabberError::UnsupportedFormat(format!(
                "cannot build an image from {}",
                format.pixel_format
            ))
        })?;

        let row_len = format.width as usize * channels.channels();
        let stride = (format.stride as usize).max(row_len);
        let mut data = Vec::with_capacity(row_len * format.height as usize);

        for row in 0..format.height as usize {
            let start = row * stride;
            let line = sample.data.get(start..start + row_len).ok_or_else(|| {
                GrabberError::FrameValidation(format!(
                    "sample of {} bytes ends before row {row}",
                    sample.data.len()
                ))
            })?;
            data.extend_from_slice(line);
        }

        Ok(Self::new(format.width, format.height, channels, data)?.with_origin(format.origin))
    }

    /// Set the row order.
    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Re-tag the channel sequence without touching the data.
    ///
    /// Fails if the channel count differs.
    pub fn with_channel_seq(mut self, channels: ChannelSeq) -> Result<Self> {
        if channels.channels() != self.channels.channels() {
            return Err(GrabberError::FrameValidation(format!(
                "cannot re-tag {:?} image as {channels:?}",
                self.channels
            )));
        }
        self.channels = channels;
        Ok(self)
    }

    /// Width in pixels.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Channel sequence.
    pub const fn channel_seq(&self) -> ChannelSeq {
        self.channels
    }

    /// Row order.
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Whether lens distortion has already been removed from this image.
    pub const fn is_undistorted(&self) -> bool {
        self.undistorted
    }

    pub(crate) fn mark_undistorted(mut self) -> Self {
        self.undistorted = true;
        self
    }

    /// Same dimensions and tags, new pixels. `data` must have the same length.
    pub(crate) fn with_pixels(&self, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), self.data.len());
        Self {
            width: self.width,
            height: self.height,
            channels: self.channels,
            origin: self.origin,
            undistorted: self.undistorted,
            data,
        }
    }

    /// Pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of the pixel at (`x`, `y`) in memory order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let channels = self.channels.channels();
        let offset = (y as usize * self.width as usize + x as usize) * channels;
        self.data.get(offset..offset + channels)
    }

    /// Bilinear resize to `width` x `height`.
    pub fn resize(&self, width: u32, height: u32) -> Result<Self> {
        let data = match self.channels {
            ChannelSeq::Bgr | ChannelSeq::Rgb => {
                resize_buffer::<Rgb<u8>>(&self.data, self.width, self.height, width, height)
            }
            ChannelSeq::Gray => {
                resize_buffer::<Luma<u8>>(&self.data, self.width, self.height, width, height)
            }
        }
        .ok_or_else(|| {
            GrabberError::FrameValidation(format!(
                "buffer does not hold a {}x{} image",
                self.width, self.height
            ))
        })?;

        Ok(Self {
            width,
            height,
            channels: self.channels,
            origin: self.origin,
            undistorted: self.undistorted,
            data,
        })
    }

    /// Convert to single-channel luminance.
    pub fn to_luma(&self) -> Result<Self> {
        let code = match self.channels {
            ChannelSeq::Gray => return Ok(self.clone()),
            ChannelSeq::Bgr => COLOR_BGR2GRAY,
            ChannelSeq::Rgb => COLOR_RGB2GRAY,
        };

        let mut gray = Mat::default();
        imgproc::cvt_color_def(&self.to_mat()?, &mut gray, code)?;

        Ok(Self {
            width: self.width,
            height: self.height,
            channels: ChannelSeq::Gray,
            origin: self.origin,
            undistorted: self.undistorted,
            data: gray.data_bytes()?.to_vec(),
        })
    }

    /// Copy into an OpenCV matrix of `height` rows and one 8-bit element per
    /// channel.
    pub(crate) fn to_mat(&self) -> Result<Mat> {
        let rows = i32::try_from(self.height).map_err(|_| {
            GrabberError::FrameValidation(format!("height {} out of range", self.height))
        })?;
        let channels = match self.channels {
            ChannelSeq::Bgr | ChannelSeq::Rgb => 3,
            ChannelSeq::Gray => 1,
        };
        let flat = Mat::from_slice(&self.data)?;
        Ok(flat.reshape(channels, rows)?.try_clone()?)
    }

    /// Same dimensions and tags, pixels taken from `mat`.
    pub(crate) fn with_mat(&self, mat: &Mat) -> Result<Self> {
        let data = mat.data_bytes()?;
        if data.len() != self.data.len() {
            return Err(GrabberError::FrameValidation(format!(
                "matrix holds {} bytes, expected {}",
                data.len(),
                self.data.len()
            )));
        }
        Ok(self.with_pixels(data.to_vec()))
    }
}

fn resize_buffer<P>(
    data: &[u8],
    width: u32,
    height: u32,
    new_width: u32,
    new_height: u32,
) -> Option<Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let source: ImageBuffer<P, &[u8]> = ImageBuffer::from_raw(width, height, data)?;
    Some(imageops::resize(&source, new_width, new_height, FilterType::Triangle).into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Format;

    fn bgr(width: u32, height: u32, value: [u8; 3]) -> Image {
        let data = value
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Image::new(width, height, ChannelSeq::Bgr, data).expect("valid image")
    }

    #[test]
    fn test_new_checks_length() {
        assert!(Image::new(2, 2, ChannelSeq::Gray, vec![0; 3]).is_err());
        assert!(Image::new(2, 2, ChannelSeq::Gray, vec![0; 4]).is_ok());
    }

    #[test]
    fn test_from_sample_honors_stride() {
        // 2x2 BGR with 2 bytes of row padding.
        let data = [1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0];
        let mut format = Format::new(2, 2, PixelFormat::Bgr24);
        format.stride = 8;
        let sample = FrameSample {
            data: &data,
            native_time: 0.0,
            format,
        };

        let image = Image::from_sample(&sample).expect("conversion failed");
        assert_eq!(image.data(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(image.pixel(1, 1), Some(&[10, 11, 12][..]));
    }

    #[test]
    fn test_from_sample_rejects_short_buffer() {
        let data = [0u8; 10];
        let sample = FrameSample {
            data: &data,
            native_time: 0.0,
            format: Format::new(2, 2, PixelFormat::Bgr24),
        };
        assert!(Image::from_sample(&sample).is_err());
    }

    #[test]
    fn test_from_sample_rejects_compressed() {
        let data = [0u8; 64];
        let sample = FrameSample {
            data: &data,
            native_time: 0.0,
            format: Format::new(4, 4, PixelFormat::Mjpeg),
        };
        assert!(matches!(
            Image::from_sample(&sample),
            Err(GrabberError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_from_sample_keeps_origin() {
        let data = [0u8; 12];
        let sample = FrameSample {
            data: &data,
            native_time: 0.0,
            format: Format::new(2, 2, PixelFormat::Bgr24).with_origin(Origin::BottomLeft),
        };
        let image = Image::from_sample(&sample).expect("conversion failed");
        assert_eq!(image.origin(), Origin::BottomLeft);
    }

    #[test]
    fn test_resize_dimensions() {
        let image = bgr(640, 480, [10, 20, 30]);
        let small = image.resize(320, 240).expect("resize failed");
        assert_eq!((small.width(), small.height()), (320, 240));
        assert_eq!(small.pixel(100, 100), Some(&[10, 20, 30][..]));
    }

    #[test]
    fn test_luma_weights() {
        // Pure red, green and blue in BGR order.
        let data = vec![0, 0, 255, 0, 255, 0, 255, 0, 0];
        let image = Image::new(3, 1, ChannelSeq::Bgr, data).expect("valid image");
        let gray = image.to_luma().expect("luma failed");
        assert_eq!(gray.channel_seq(), ChannelSeq::Gray);
        assert_eq!(gray.data(), &[76, 150, 29]);
    }

    #[test]
    fn test_luma_of_white_is_white() {
        let gray = bgr(4, 4, [255, 255, 255]).to_luma().expect("luma failed");
        assert!(gray.data().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_luma_keeps_tags() {
        let image = bgr(2, 2, [0, 0, 255])
            .with_origin(Origin::BottomLeft)
            .mark_undistorted();
        let gray = image.to_luma().expect("luma failed");
        assert_eq!(gray.origin(), Origin::BottomLeft);
        assert!(gray.is_undistorted());
        assert_eq!((gray.width(), gray.height()), (2, 2));
    }

    #[test]
    fn test_mat_round_trip_layout() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let image = Image::new(2, 2, ChannelSeq::Bgr, data).expect("valid image");
        let mat = image.to_mat().expect("to_mat failed");
        assert_eq!((mat.rows(), mat.cols(), mat.channels()), (2, 2, 3));
        assert_eq!(image.with_mat(&mat).expect("with_mat failed"), image);
    }

    #[test]
    fn test_retag_channels() {
        let image = bgr(1, 1, [1, 2, 3]);
        let image = image.with_channel_seq(ChannelSeq::Rgb).expect("retag");
        assert_eq!(image.channel_seq(), ChannelSeq::Rgb);
        assert!(image.with_channel_seq(ChannelSeq::Gray).is_err());
    }
}
