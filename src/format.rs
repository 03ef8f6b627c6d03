//! Surface Format Module
//!
//! SVGA3D surface formats understood by the geometry math, with their block
//! dimensions and bytes per block.

use serde::{Deserialize, Serialize};

/// SVGA3dSurfaceFormat (subset).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceFormat {
    Buffer = 24,
    R32G32B32A32Typeless = 42,
    R32G32B32A32Uint = 43,
    R32G32B32Float = 46,
    R16G16B16A16Uint = 50,
    R32G32Uint = 54,
    D32FloatS8X24Uint = 57,
    R10G10B10A2Uint = 61,
    R8G8B8A8Typeless = 63,
    R8G8B8A8Unorm = 64,
    R8G8B8A8UnormSrgb = 65,
    R8G8B8A8Uint = 66,
    R16G16Uint = 69,
    R32Typeless = 71,
    D32Float = 72,
    R32Uint = 73,
    R24G8Typeless = 75,
    D24UnormS8Uint = 76,
    R8G8Unorm = 80,
    R16Uint = 85,
    R8Unorm = 89,
    R8Uint = 90,
    Bc1Typeless = 97,
    Bc2Typeless = 99,
    Bc3Typeless = 101,
    Bc4Typeless = 103,
    Bc5Typeless = 106,
    B8G8R8A8Typeless = 110,
    R32G32B32A32Float = 118,
    R16G16B16A16Float = 119,
    R16G16B16A16Unorm = 120,
    R32G32Float = 121,
    R10G10B10A2Unorm = 122,
    R16G16Float = 124,
    R32Float = 127,
    R16Float = 129,
    D16Unorm = 130,
    A8Unorm = 131,
    Bc1Unorm = 132,
    Bc2Unorm = 133,
    Bc3Unorm = 134,
    B5G6R5Unorm = 135,
    B8G8R8A8Unorm = 137,
    B8G8R8X8Unorm = 138,
    Bc4Unorm = 139,
    Bc5Unorm = 140,
}

/// Size of one addressable block of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatBlock {
    pub width: u32,
    pub height: u32,
    pub bytes: u32,
}

impl FormatBlock {
    const fn texel(bytes: u32) -> Self {
        Self {
            width: 1,
            height: 1,
            bytes,
        }
    }

    const fn compressed(bytes: u32) -> Self {
        Self {
            width: 4,
            height: 4,
            bytes,
        }
    }
}

impl SurfaceFormat {
    pub fn block(self) -> FormatBlock {
        use SurfaceFormat::*;
        match self {
            Buffer | R8Unorm | R8Uint | A8Unorm => FormatBlock::texel(1),
            R8G8Unorm | R16Uint | R16Float | D16Unorm | B5G6R5Unorm => FormatBlock::texel(2),
            R10G10B10A2Uint | R8G8B8A8Typeless | R8G8B8A8Unorm | R8G8B8A8UnormSrgb
            | R8G8B8A8Uint | R16G16Uint | R32Typeless | D32Float | R32Uint | R24G8Typeless
            | D24UnormS8Uint | B8G8R8A8Typeless | R10G10B10A2Unorm | R16G16Float | R32Float
            | B8G8R8A8Unorm | B8G8R8X8Unorm => FormatBlock::texel(4),
            R16G16B16A16Uint | R32G32Uint | D32FloatS8X24Uint | R16G16B16A16Float
            | R16G16B16A16Unorm | R32G32Float => FormatBlock::texel(8),
            R32G32B32Float => FormatBlock::texel(12),
            R32G32B32A32Typeless | R32G32B32A32Uint | R32G32B32A32Float => FormatBlock::texel(16),
            Bc1Typeless | Bc1Unorm | Bc4Typeless | Bc4Unorm => FormatBlock::compressed(8),
            Bc2Typeless | Bc2Unorm | Bc3Typeless | Bc3Unorm | Bc5Typeless | Bc5Unorm => {
                FormatBlock::compressed(16)
            }
        }
    }

    pub fn is_compressed(self) -> bool {
        self.block().width > 1
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        use SurfaceFormat::*;
        const ALL: [SurfaceFormat; 46] = [
            Buffer,
            R32G32B32A32Typeless,
            R32G32B32A32Uint,
            R32G32B32Float,
            R16G16B16A16Uint,
            R32G32Uint,
            D32FloatS8X24Uint,
            R10G10B10A2Uint,
            R8G8B8A8Typeless,
            R8G8B8A8Unorm,
            R8G8B8A8UnormSrgb,
            R8G8B8A8Uint,
            R16G16Uint,
            R32Typeless,
            D32Float,
            R32Uint,
            R24G8Typeless,
            D24UnormS8Uint,
            R8G8Unorm,
            R16Uint,
            R8Unorm,
            R8Uint,
            Bc1Typeless,
            Bc2Typeless,
            Bc3Typeless,
            Bc4Typeless,
            Bc5Typeless,
            B8G8R8A8Typeless,
            R32G32B32A32Float,
            R16G16B16A16Float,
            R16G16B16A16Unorm,
            R32G32Float,
            R10G10B10A2Unorm,
            R16G16Float,
            R32Float,
            R16Float,
            D16Unorm,
            A8Unorm,
            Bc1Unorm,
            Bc2Unorm,
            Bc3Unorm,
            B5G6R5Unorm,
            B8G8R8A8Unorm,
            B8G8R8X8Unorm,
            Bc4Unorm,
            Bc5Unorm,
        ];
        ALL.into_iter().find(|format| *format as u32 == raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sizes() {
        assert_eq!(SurfaceFormat::Buffer.block(), FormatBlock::texel(1));
        assert_eq!(SurfaceFormat::R8G8B8A8Unorm.block().bytes, 4);
        assert_eq!(SurfaceFormat::R32G32B32Float.block().bytes, 12);
        assert_eq!(
            SurfaceFormat::Bc1Unorm.block(),
            FormatBlock {
                width: 4,
                height: 4,
                bytes: 8
            }
        );
        assert!(SurfaceFormat::Bc3Unorm.is_compressed());
        assert!(!SurfaceFormat::D24UnormS8Uint.is_compressed());
    }

    #[test]
    fn test_from_raw_round_trips_wire_values() {
        assert_eq!(SurfaceFormat::from_raw(24), Some(SurfaceFormat::Buffer));
        assert_eq!(SurfaceFormat::from_raw(64), Some(SurfaceFormat::R8G8B8A8Unorm));
        assert_eq!(SurfaceFormat::from_raw(140), Some(SurfaceFormat::Bc5Unorm));
        assert_eq!(SurfaceFormat::from_raw(0), None);
    }
}
