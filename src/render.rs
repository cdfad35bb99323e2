//! Software compositing into an XRGB8888 staging buffer.
//!
//! All in-tree backends render through this path; the hardware backends
//! upload the staging buffer at swap time.

use crate::types::{BlendRequest, BufferFormat, Color, Rect, VideoBuffer};
use crate::{Error, Result};

pub(crate) const BYTES_PER_PIXEL: u32 = 4;

fn pack(color: Color) -> u32 {
    0xff00_0000 | (color.r as u32) << 16 | (color.g as u32) << 8 | color.b as u32
}

fn mix(bg: u8, fg: u8, coverage: u8) -> u8 {
    let a = coverage as u32;
    ((bg as u32 * (255 - a) + fg as u32 * a + 127) / 255) as u8
}

/// Rejects buffers whose `data` slice is shorter than the dimensions
/// they claim, before any row is indexed.
fn check_extent(buf: &VideoBuffer<'_>, bytes_per_pixel: u32) -> Result<()> {
    if buf.width == 0 || buf.height == 0 {
        return Ok(());
    }
    let needed = (buf.height as usize - 1) * buf.stride as usize
        + buf.width as usize * bytes_per_pixel as usize;
    if buf.data.len() < needed {
        return Err(Error::InvalidState("buffer data shorter than its dimensions"));
    }
    Ok(())
}

/// An owned XRGB8888 pixel buffer.
#[derive(Debug, Clone)]
pub(crate) struct Framebuffer {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![pack(Color::BLACK); (width * height) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Clips a `w`x`h` region placed at (`x`, `y`) against the buffer
    /// bounds. Returns the number of columns and rows that remain.
    fn clip(&self, x: u32, y: u32, w: u32, h: u32) -> Option<(u32, u32)> {
        let cols = w.min(self.width.saturating_sub(x));
        let rows = h.min(self.height.saturating_sub(y));
        (cols > 0 && rows > 0).then_some((cols, rows))
    }

    pub fn fill(&mut self, color: Color, rect: Rect) {
        let px = pack(color);
        let Some((cols, rows)) = self.clip(rect.x, rect.y, rect.width, rect.height) else {
            return;
        };
        for row in 0..rows {
            let start = ((rect.y + row) * self.width + rect.x) as usize;
            self.pixels[start..start + cols as usize].fill(px);
        }
    }

    pub fn blit(&mut self, buf: &VideoBuffer<'_>, x: u32, y: u32) -> Result<()> {
        if buf.format != BufferFormat::Xrgb8888 {
            return Err(Error::NotSupported("blit source format"));
        }
        check_extent(buf, BYTES_PER_PIXEL)?;
        let Some((cols, rows)) = self.clip(x, y, buf.width, buf.height) else {
            return Ok(());
        };
        for row in 0..rows {
            let src = &buf.data[(row * buf.stride) as usize..];
            let dst = ((y + row) * self.width + x) as usize;
            for col in 0..cols {
                let o = (col * BYTES_PER_PIXEL) as usize;
                self.pixels[dst + col as usize] =
                    u32::from_le_bytes([src[o], src[o + 1], src[o + 2], src[o + 3]]);
            }
        }
        Ok(())
    }

    pub fn blend(&mut self, req: &BlendRequest<'_>) -> Result<()> {
        let cov = &req.coverage;
        if cov.format != BufferFormat::Grey8 {
            return Err(Error::NotSupported("blend coverage format"));
        }
        check_extent(cov, 1)?;
        let Some((cols, rows)) = self.clip(req.x, req.y, cov.width, cov.height) else {
            return Ok(());
        };
        for row in 0..rows {
            let src = &cov.data[(row * cov.stride) as usize..];
            let dst = ((req.y + row) * self.width + req.x) as usize;
            for col in 0..cols {
                let a = src[col as usize];
                let px = pack(Color::new(
                    mix(req.bg.r, req.fg.r, a),
                    mix(req.bg.g, req.fg.g, a),
                    mix(req.bg.b, req.fg.b, a),
                ));
                self.pixels[dst + col as usize] = px;
            }
        }
        Ok(())
    }

    /// Copies the buffer into `dst` with the given row pitch in bytes,
    /// little-endian pixels.
    pub fn copy_rows(&self, dst: &mut [u8], pitch: usize) {
        for (row, chunk) in dst.chunks_mut(pitch).take(self.height as usize).enumerate() {
            let start = row * self.width as usize;
            for (col, px) in self.pixels[start..start + self.width as usize]
                .iter()
                .enumerate()
            {
                let o = col * BYTES_PER_PIXEL as usize;
                chunk[o..o + 4].copy_from_slice(&px.to_le_bytes());
            }
        }
    }

    /// The buffer as pitch-padded little-endian bytes.
    pub fn to_bytes(&self, pitch: usize) -> Vec<u8> {
        let mut out = vec![0u8; pitch * self.height as usize];
        self.copy_rows(&mut out, pitch);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::BufferFormat;

    #[test]
    fn fill_is_clipped_to_bounds() {
        let mut fb = Framebuffer::new(4, 4);
        fb.fill(Color::WHITE, Rect::new(2, 2, 10, 10));
        let white = pack(Color::WHITE);
        let black = pack(Color::BLACK);
        assert_eq!(fb.pixels()[0], black);
        assert_eq!(fb.pixels()[2 * 4 + 2], white);
        assert_eq!(fb.pixels()[3 * 4 + 3], white);
        // out-of-bounds fill is a no-op
        fb.fill(Color::WHITE, Rect::new(10, 10, 1, 1));
    }

    #[test]
    fn blit_respects_stride_and_format() {
        let mut fb = Framebuffer::new(2, 2);
        // one row of two pixels plus two bytes of row padding
        let data: Vec<u8> = vec![
            0x11, 0x22, 0x33, 0xff, 0x44, 0x55, 0x66, 0xff, 0xaa, 0xbb, //
            0x77, 0x88, 0x99, 0xff, 0x00, 0x00, 0x00, 0xff, 0xaa, 0xbb,
        ];
        let buf = VideoBuffer {
            format: BufferFormat::Xrgb8888,
            width: 2,
            height: 2,
            stride: 10,
            data: &data,
        };
        fb.blit(&buf, 0, 0).unwrap();
        assert_eq!(fb.pixels()[0], 0xff33_2211);
        assert_eq!(fb.pixels()[2], 0xff99_8877);

        let grey = VideoBuffer {
            format: BufferFormat::Grey8,
            width: 1,
            height: 1,
            stride: 1,
            data: &[0u8],
        };
        assert!(matches!(
            fb.blit(&grey, 0, 0),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn blend_interpolates_coverage() {
        let mut fb = Framebuffer::new(3, 1);
        let cov = [0u8, 128, 255];
        let buf = VideoBuffer {
            format: BufferFormat::Grey8,
            width: 3,
            height: 1,
            stride: 3,
            data: &cov,
        };
        let req = BlendRequest {
            coverage: buf,
            x: 0,
            y: 0,
            fg: Color::WHITE,
            bg: Color::BLACK,
        };
        fb.blend(&req).unwrap();
        assert_eq!(fb.pixels()[0], pack(Color::BLACK));
        assert_eq!(fb.pixels()[1], pack(Color::new(128, 128, 128)));
        assert_eq!(fb.pixels()[2], pack(Color::WHITE));
    }

    #[test]
    fn undersized_buffers_are_rejected_not_indexed() {
        let mut fb = Framebuffer::new(8, 8);

        // claims 4x2 pixels but carries one row
        let short = VideoBuffer {
            format: BufferFormat::Xrgb8888,
            width: 4,
            height: 2,
            stride: 16,
            data: &[0u8; 16],
        };
        assert!(matches!(
            fb.blit(&short, 0, 0),
            Err(Error::InvalidState(_))
        ));

        let short_cov = VideoBuffer {
            format: BufferFormat::Grey8,
            width: 4,
            height: 4,
            stride: 4,
            data: &[0u8; 7],
        };
        let req = BlendRequest {
            coverage: short_cov,
            x: 0,
            y: 0,
            fg: Color::WHITE,
            bg: Color::BLACK,
        };
        assert!(matches!(fb.blend(&req), Err(Error::InvalidState(_))));

        // zero-sized buffers are fine regardless of their data
        let empty = VideoBuffer {
            format: BufferFormat::Xrgb8888,
            width: 0,
            height: 0,
            stride: 0,
            data: &[],
        };
        fb.blit(&empty, 0, 0).unwrap();
    }

    #[test]
    fn copy_rows_pads_to_pitch() {
        let mut fb = Framebuffer::new(2, 2);
        fb.fill(Color::new(1, 2, 3), Rect::new(0, 0, 2, 2));
        let bytes = fb.to_bytes(12);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], &[3, 2, 1, 0xff]);
        assert_eq!(&bytes[12..16], &[3, 2, 1, 0xff]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
    }
}
