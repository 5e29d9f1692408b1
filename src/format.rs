//! Pixel formats understood by the surface manager.
//!
//! Only the properties placement and transfer need are modelled here: bits per
//! pixel of the first plane, how many extra plane rows a planar format carries,
//! and where the chroma planes live relative to the luma plane.
//!
//! Geometry helpers return `None` when the result does not fit in `usize`.

/// Surface pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bit alpha only.
    A8,
    /// 8 bit palette index.
    Lut8,
    /// 8 bit RGB (3-3-2).
    Rgb332,
    /// 16 bit ARGB (1-5-5-5).
    Argb1555,
    /// 16 bit RGB (5-6-5).
    Rgb16,
    /// 24 bit packed RGB.
    Rgb24,
    /// 32 bit RGB with unused top byte.
    Rgb32,
    /// 32 bit ARGB.
    Argb,
    /// 32 bit packed YUV 4:2:2 (Y0 Cb Y1 Cr).
    Yuy2,
    /// 32 bit packed YUV 4:2:2 (Cb Y0 Cr Y1).
    Uyvy,
    /// Planar YUV 4:2:0, Y then Cb then Cr.
    I420,
    /// Planar YUV 4:2:0, Y then Cr then Cb.
    Yv12,
    /// Y plane followed by interleaved CbCr at half height.
    Nv12,
    /// Y plane followed by interleaved CrCb at half height.
    Nv21,
    /// Y plane followed by interleaved CbCr at full height.
    Nv16,
}

/// Content of one plane span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// The first plane: all pixels of packed formats, luma of planar ones.
    Primary,
    Cb,
    Cr,
    /// Interleaved Cb/Cr samples.
    CbCr,
    /// Interleaved Cr/Cb samples.
    CrCb,
}

/// How the chroma data of a format is laid out after the first plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChromaLayout {
    None,
    /// Two half-resolution planes at half pitch, stored in this order.
    Separate([Plane; 2]),
    /// One interleaved plane at full pitch.
    Interleaved { plane: Plane, full_height: bool },
}

/// One rectangular run of rows inside a surface buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneSpan {
    pub plane: Plane,
    /// Byte offset of the first row.
    pub offset: usize,
    /// Distance between two rows.
    pub pitch: usize,
    /// Number of rows.
    pub rows: usize,
    /// Bytes that carry data in each row.
    pub row_bytes: usize,
}

impl PixelFormat {
    /// Bits per pixel of the first (or only) plane.
    #[must_use]
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            Self::A8 | Self::Lut8 | Self::Rgb332 => 8,
            Self::I420 | Self::Yv12 | Self::Nv12 | Self::Nv21 | Self::Nv16 => 8,
            Self::Argb1555 | Self::Rgb16 | Self::Yuy2 | Self::Uyvy => 16,
            Self::Rgb24 => 24,
            Self::Rgb32 | Self::Argb => 32,
        }
    }

    #[must_use]
    pub const fn bytes_per_line(self, width: usize) -> Option<usize> {
        match self.bits_per_pixel().checked_mul(width) {
            Some(bits) => Some(bits.div_ceil(8)),
            None => None,
        }
    }

    /// Plane height multiplier in quarters: 4 for packed, 6 for 4:2:0, 8 for 4:2:2 semi-planar.
    const fn plane_quarters(self) -> usize {
        match self {
            Self::I420 | Self::Yv12 | Self::Nv12 | Self::Nv21 => 6,
            Self::Nv16 => 8,
            _ => 4,
        }
    }

    /// Number of pitch-sized rows needed to store `height` lines, chroma planes included.
    #[must_use]
    pub const fn plane_multiply(self, height: usize) -> Option<usize> {
        match self.plane_quarters().checked_mul(height) {
            Some(quarters) => Some(quarters >> 2),
            None => None,
        }
    }

    const fn chroma_layout(self) -> ChromaLayout {
        match self {
            Self::I420 => ChromaLayout::Separate([Plane::Cb, Plane::Cr]),
            Self::Yv12 => ChromaLayout::Separate([Plane::Cr, Plane::Cb]),
            Self::Nv12 => ChromaLayout::Interleaved {
                plane: Plane::CbCr,
                full_height: false,
            },
            Self::Nv21 => ChromaLayout::Interleaved {
                plane: Plane::CrCb,
                full_height: false,
            },
            Self::Nv16 => ChromaLayout::Interleaved {
                plane: Plane::CbCr,
                full_height: true,
            },
            _ => ChromaLayout::None,
        }
    }

    /// Row spans making up a `width` x `height` image stored at `pitch`.
    ///
    /// The first span is always the [`Plane::Primary`] plane; chroma spans follow
    /// in storage order.
    #[must_use]
    pub fn planes(self, width: usize, height: usize, pitch: usize) -> Option<Vec<PlaneSpan>> {
        let row_bytes = self.bytes_per_line(width)?;
        let mut spans = vec![PlaneSpan {
            plane: Plane::Primary,
            offset: 0,
            pitch,
            rows: height,
            row_bytes,
        }];

        let chroma_base = height.checked_mul(pitch)?;
        match self.chroma_layout() {
            ChromaLayout::None => {}
            ChromaLayout::Separate(order) => {
                let half_pitch = pitch / 2;
                let half_rows = height / 2;
                let mut offset = chroma_base;
                for plane in order {
                    spans.push(PlaneSpan {
                        plane,
                        offset,
                        pitch: half_pitch,
                        rows: half_rows,
                        row_bytes: row_bytes / 2,
                    });
                    offset = offset.checked_add(half_rows.checked_mul(half_pitch)?)?;
                }
            }
            ChromaLayout::Interleaved { plane, full_height } => {
                spans.push(PlaneSpan {
                    plane,
                    offset: chroma_base,
                    pitch,
                    rows: if full_height { height } else { height / 2 },
                    row_bytes,
                });
            }
        }

        Some(spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_line_by_depth() {
        assert_eq!(PixelFormat::A8.bytes_per_line(10), Some(10));
        assert_eq!(PixelFormat::Rgb16.bytes_per_line(10), Some(20));
        assert_eq!(PixelFormat::Rgb24.bytes_per_line(10), Some(30));
        assert_eq!(PixelFormat::Argb.bytes_per_line(10), Some(40));
        assert_eq!(PixelFormat::Yv12.bytes_per_line(10), Some(10));
    }

    #[test]
    fn planar_multipliers() {
        assert_eq!(PixelFormat::Argb.plane_multiply(100), Some(100));
        assert_eq!(PixelFormat::I420.plane_multiply(100), Some(150));
        assert_eq!(PixelFormat::Nv12.plane_multiply(100), Some(150));
        assert_eq!(PixelFormat::Nv16.plane_multiply(100), Some(200));
    }

    #[test]
    fn oversized_geometry_does_not_overflow() {
        assert_eq!(PixelFormat::Argb.bytes_per_line(usize::MAX / 16), None);
        assert_eq!(PixelFormat::Nv16.plane_multiply(usize::MAX / 4), None);
        assert!(PixelFormat::Argb.planes(4, usize::MAX / 2, 16).is_none());
    }

    #[test]
    fn yv12_and_i420_swap_chroma_order() {
        let i420 = PixelFormat::I420.planes(16, 8, 16).unwrap();
        let yv12 = PixelFormat::Yv12.planes(16, 8, 16).unwrap();
        assert_eq!(
            i420.iter().map(|s| s.plane).collect::<Vec<_>>(),
            [Plane::Primary, Plane::Cb, Plane::Cr]
        );
        assert_eq!(
            yv12.iter().map(|s| s.plane).collect::<Vec<_>>(),
            [Plane::Primary, Plane::Cr, Plane::Cb]
        );
        assert_eq!((i420[1].offset, i420[2].offset), (128, 128 + 4 * 8));
        assert_eq!((yv12[1].offset, yv12[2].offset), (128, 128 + 4 * 8));
    }

    #[test]
    fn plane_spans_fit_in_plane_multiply_rows() {
        for format in [
            PixelFormat::Argb,
            PixelFormat::I420,
            PixelFormat::Yv12,
            PixelFormat::Nv12,
            PixelFormat::Nv21,
            PixelFormat::Nv16,
        ] {
            let (width, height, pitch) = (7, 5, 32);
            let total = format.plane_multiply(height).unwrap() * pitch;
            for span in format.planes(width, height, pitch).unwrap() {
                if span.rows == 0 {
                    continue;
                }
                let end = span.offset + (span.rows - 1) * span.pitch + span.row_bytes;
                assert!(end <= total, "{format:?} span {span:?} exceeds {total}");
            }
        }
    }

    #[test]
    fn interleaved_chroma_height_and_order() {
        let spans = PixelFormat::Nv16.planes(4, 6, 8).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[1].plane, spans[1].rows, spans[1].offset), (Plane::CbCr, 6, 48));

        let spans = PixelFormat::Nv12.planes(4, 6, 8).unwrap();
        assert_eq!((spans[1].plane, spans[1].rows), (Plane::CbCr, 3));

        let spans = PixelFormat::Nv21.planes(4, 6, 8).unwrap();
        assert_eq!(spans[1].plane, Plane::CrCb);
    }

    #[test]
    fn packed_formats_have_one_plane() {
        let spans = PixelFormat::Yuy2.planes(3, 2, 8).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].plane, spans[0].row_bytes), (Plane::Primary, 6));
    }
}
