use anyhow::{bail, Context, Result};
use image::{ImageBuffer, Rgb};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

/// V4L2 capture device producing RGB frames.
pub struct Camera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    fourcc: FourCC,
}

impl Camera {
    pub fn open(device: &str) -> Result<Self> {
        let dev = Device::with_path(device).context("open camera")?;
        let fmt = negotiate_format(&dev).context("negotiate pixel format")?;
        let stream =
            Stream::with_buffers(&dev, Type::VideoCapture, 4).context("start capture stream")?;
        Ok(Self {
            stream,
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame(&mut self) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>> {
        let (data, meta) = self.stream.next().context("capture frame")?;
        log::debug!(
            "frame seq={} fourcc={:?} len={}",
            meta.sequence,
            self.fourcc,
            data.len()
        );

        let buf = match self.fourcc {
            f if f == FourCC::new(b"RGB3") => data.to_vec(),
            f if f == FourCC::new(b"YUYV") => yuyv_to_rgb(self.width, self.height, data)?,
            f if f == FourCC::new(b"GREY") => grey_to_rgb(self.width, self.height, data)?,
            other => {
                log::warn!("unexpected pixel format {:?}, passing through raw", other);
                data.to_vec()
            }
        };

        let expected = (self.width * self.height * 3) as usize;
        if buf.len() < expected {
            bail!(
                "frame buffer too small: got {}, expected {} ({:?})",
                buf.len(),
                expected,
                self.fourcc
            );
        }

        ImageBuffer::from_raw(self.width, self.height, buf)
            .ok_or_else(|| anyhow::anyhow!("failed to build frame image buffer"))
    }
}

/// Prefer RGB3, fall back to YUYV, otherwise accept whatever the driver has.
fn negotiate_format(dev: &Device) -> Result<Format> {
    let mut fmt = dev.format().context("query format")?;
    let rgb = Format::new(fmt.width, fmt.height, FourCC::new(b"RGB3"));
    fmt = dev.set_format(&rgb).unwrap_or(fmt);
    if fmt.fourcc != FourCC::new(b"RGB3") {
        let yuyv = Format::new(fmt.width, fmt.height, FourCC::new(b"YUYV"));
        fmt = dev.set_format(&yuyv).unwrap_or(fmt);
    }
    Ok(fmt)
}

fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected {
        bail!("short YUYV buffer: {} < {}", data.len(), expected);
    }
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;
        for &y in &[y0, y1] {
            out.push(clamp_u8(y + 1.402 * v));
            out.push(clamp_u8(y - 0.344136 * u - 0.714136 * v));
            out.push(clamp_u8(y + 1.772 * u));
        }
    }
    Ok(out)
}

fn grey_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let expected = (width * height) as usize;
    if data.len() < expected {
        bail!("short GREY buffer: {} < {}", data.len(), expected);
    }
    let mut out = Vec::with_capacity(expected * 3);
    for &y in &data[..expected] {
        out.extend_from_slice(&[y, y, y]);
    }
    Ok(out)
}

fn clamp_u8(v: f32) -> u8 {
    v.max(0.0).min(255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grey_expands_to_three_channels() {
        let rgb = grey_to_rgb(2, 1, &[0, 255]).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn yuyv_neutral_chroma_is_greyscale() {
        // Y=128, U=V=128 decodes to mid grey on both pixels.
        let rgb = yuyv_to_rgb(2, 1, &[128, 128, 128, 128]).unwrap();
        assert_eq!(rgb.len(), 6);
        for &c in &rgb {
            assert!((c as i32 - 128).abs() <= 1);
        }
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(yuyv_to_rgb(4, 4, &[0u8; 3]).is_err());
        assert!(grey_to_rgb(4, 4, &[0u8; 3]).is_err());
    }
}
