//! Subresource Geometry Module
//!
//! Placement of subresources inside a linear surface allocation. Array slices
//! (and cube faces) are laid out one after another, each holding its full mip
//! chain.

use crate::format::SurfaceFormat;
use crate::protocol::SvgaBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Size of mip level `mip` of a surface with this base size.
    pub fn mip(self, mip: u32) -> Self {
        let shrink = |v: u32| v.checked_shr(mip).unwrap_or(0).max(1);
        Self {
            width: shrink(self.width),
            height: shrink(self.height),
            depth: shrink(self.depth),
        }
    }
}

/// How a box maps onto the bytes of one subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxLayout {
    /// Offset of the box origin from the start of the subresource.
    pub offset: u32,
    pub row_bytes: u32,
    pub rows: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub format: SurfaceFormat,
    pub base: Extent,
    pub mip_levels: u32,
    pub array_size: u32,
}

impl SurfaceLayout {
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_size
    }

    /// (array slice, mip level) of a subresource index.
    pub fn split(&self, subresource: u32) -> (u32, u32) {
        (subresource / self.mip_levels, subresource % self.mip_levels)
    }

    fn blocks(&self, extent: Extent) -> Extent {
        let block = self.format.block();
        Extent {
            width: extent.width.div_ceil(block.width),
            height: extent.height.div_ceil(block.height),
            depth: extent.depth,
        }
    }

    fn image_size(&self, extent: Extent) -> u64 {
        let blocks = self.blocks(extent);
        blocks.width as u64
            * self.format.block().bytes as u64
            * blocks.height as u64
            * blocks.depth as u64
    }

    fn mip_chain_size(&self) -> u64 {
        (0..self.mip_levels)
            .map(|mip| self.image_size(self.base.mip(mip)))
            .sum()
    }

    /// Total bytes of the linear allocation.
    pub fn serialized_size(&self) -> u64 {
        self.mip_chain_size() * self.array_size as u64
    }

    pub fn subresource_offset(&self, subresource: u32) -> u64 {
        let (slice, mip) = self.split(subresource);
        let below: u64 = (0..mip)
            .map(|level| self.image_size(self.base.mip(level)))
            .sum();
        slice as u64 * self.mip_chain_size() + below
    }

    pub fn subresource_size(&self, subresource: u32) -> u64 {
        let (_, mip) = self.split(subresource);
        self.image_size(self.base.mip(mip))
    }

    /// (row pitch, depth pitch) of a subresource.
    pub fn subresource_pitch(&self, subresource: u32) -> (u32, u32) {
        if self.format == SurfaceFormat::Buffer {
            return (self.base.width, self.base.width);
        }
        let (_, mip) = self.split(subresource);
        let blocks = self.blocks(self.base.mip(mip));
        let row_pitch = blocks.width * self.format.block().bytes;
        (row_pitch, blocks.height * row_pitch)
    }

    /// The whole of a subresource as a box.
    pub fn subresource_box(&self, subresource: u32) -> SvgaBox {
        let (_, mip) = self.split(subresource);
        let extent = self.base.mip(mip);
        SvgaBox {
            x: 0,
            y: 0,
            z: 0,
            w: extent.width,
            h: extent.height,
            d: extent.depth,
        }
    }

    /// Whether `b` lies within the subresource.
    pub fn contains_box(&self, subresource: u32, b: &SvgaBox) -> bool {
        let full = self.subresource_box(subresource);
        let within = |origin: u32, len: u32, limit: u32| {
            origin.checked_add(len).is_some_and(|end| end <= limit)
        };
        within(b.x, b.w, full.w) && within(b.y, b.h, full.h) && within(b.z, b.d, full.d)
    }

    pub fn box_layout(&self, subresource: u32, b: &SvgaBox) -> BoxLayout {
        if self.format == SurfaceFormat::Buffer {
            return BoxLayout {
                offset: b.x,
                row_bytes: b.w,
                rows: 1,
                depth: 1,
            };
        }

        let block = self.format.block();
        let (_, mip) = self.split(subresource);
        let mip_blocks = self.blocks(self.base.mip(mip));
        let box_blocks = self.blocks(Extent::new(b.w, b.h, b.d));

        let row_pitch = mip_blocks.width * block.bytes;
        let offset = b.z * mip_blocks.height * row_pitch
            + (b.y / block.height) * row_pitch
            + (b.x / block.width) * block.bytes;
        BoxLayout {
            offset,
            row_bytes: box_blocks.width * block.bytes,
            rows: box_blocks.height,
            depth: b.d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(format: SurfaceFormat, w: u32, h: u32, mips: u32, array: u32) -> SurfaceLayout {
        SurfaceLayout {
            format,
            base: Extent::new(w, h, 1),
            mip_levels: mips,
            array_size: array,
        }
    }

    #[test]
    fn test_mip_extent_clamps_to_one() {
        let base = Extent::new(64, 8, 1);
        assert_eq!(base.mip(2), Extent::new(16, 2, 1));
        assert_eq!(base.mip(5), Extent::new(2, 1, 1));
        assert_eq!(base.mip(40), Extent::new(1, 1, 1));
    }

    #[test]
    fn test_buffer_math_is_one_dimensional() {
        let layout = texture(SurfaceFormat::Buffer, 1000, 1, 1, 1);
        assert_eq!(layout.serialized_size(), 1000);
        assert_eq!(layout.subresource_pitch(0), (1000, 1000));
        let b = SvgaBox { x: 10, y: 0, z: 0, w: 20, h: 1, d: 1 };
        assert_eq!(
            layout.box_layout(0, &b),
            BoxLayout { offset: 10, row_bytes: 20, rows: 1, depth: 1 }
        );
    }

    #[test]
    fn test_array_major_then_mip_offsets() {
        // 8x8 RGBA8: mip sizes 256, 64, 16, 4 -> chain 340 bytes.
        let layout = texture(SurfaceFormat::R8G8B8A8Unorm, 8, 8, 4, 2);
        assert_eq!(layout.serialized_size(), 680);
        assert_eq!(layout.subresource_offset(0), 0);
        assert_eq!(layout.subresource_offset(1), 256);
        assert_eq!(layout.subresource_offset(3), 336);
        assert_eq!(layout.subresource_offset(4), 340);
        assert_eq!(layout.subresource_offset(6), 340 + 320);
        assert_eq!(layout.subresource_size(5), 64);
        assert_eq!(layout.subresource_pitch(1), (16, 64));
    }

    #[test]
    fn test_block_compressed_sizes() {
        // 10x10 BC1: 3x3 blocks of 8 bytes.
        let layout = texture(SurfaceFormat::Bc1Unorm, 10, 10, 2, 1);
        assert_eq!(layout.subresource_size(0), 72);
        assert_eq!(layout.subresource_pitch(0), (24, 72));
        // Mip 1 is 5x5 -> 2x2 blocks.
        assert_eq!(layout.subresource_size(1), 32);

        let b = SvgaBox { x: 4, y: 4, z: 0, w: 6, h: 6, d: 1 };
        assert_eq!(
            layout.box_layout(0, &b),
            BoxLayout { offset: 24 + 8, row_bytes: 16, rows: 2, depth: 1 }
        );
    }

    #[test]
    fn test_volume_box_layout() {
        let layout = SurfaceLayout {
            format: SurfaceFormat::R32Float,
            base: Extent::new(4, 4, 4),
            mip_levels: 1,
            array_size: 1,
        };
        let b = SvgaBox { x: 1, y: 2, z: 3, w: 2, h: 1, d: 1 };
        let box_layout = layout.box_layout(0, &b);
        assert_eq!(box_layout.offset, 3 * 64 + 2 * 16 + 4);
        assert_eq!(box_layout.row_bytes, 8);
        assert_eq!(layout.subresource_pitch(0), (16, 64));
    }

    #[test]
    fn test_every_subresource_fits_in_allocation() {
        let formats = [
            SurfaceFormat::R8Unorm,
            SurfaceFormat::R32G32B32Float,
            SurfaceFormat::Bc3Unorm,
            SurfaceFormat::R16G16B16A16Float,
        ];
        for format in formats {
            for (w, h, mips, array) in [(1, 1, 1, 1), (17, 9, 5, 3), (256, 4, 9, 6), (3, 300, 9, 1)] {
                let layout = texture(format, w, h, mips, array);
                let total = layout.serialized_size();
                for sub in 0..layout.subresource_count() {
                    let end = layout.subresource_offset(sub) + layout.subresource_size(sub);
                    assert!(end <= total, "{format:?} {w}x{h} sub {sub}: {end} > {total}");
                }
            }
        }
    }

    #[test]
    fn test_contains_box() {
        let layout = texture(SurfaceFormat::R8G8B8A8Unorm, 16, 16, 2, 1);
        assert!(layout.contains_box(0, &SvgaBox { x: 8, y: 8, z: 0, w: 8, h: 8, d: 1 }));
        assert!(!layout.contains_box(1, &SvgaBox { x: 8, y: 8, z: 0, w: 8, h: 8, d: 1 }));
        assert!(!layout.contains_box(0, &SvgaBox { x: u32::MAX, y: 0, z: 0, w: 2, h: 1, d: 1 }));
    }
}
