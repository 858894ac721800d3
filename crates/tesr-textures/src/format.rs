//! `D3DFORMAT` to bridge format conversion.

use tesr_bridge::{BridgeFormat, UsageFlags};

use crate::d3d9::D3dFormat;

pub fn bridge_format(format: D3dFormat) -> BridgeFormat {
    match format {
        D3dFormat::A8R8G8B8 => BridgeFormat::R8G8B8A8Unorm,
        D3dFormat::A16B16G16R16F => BridgeFormat::R16G16B16A16Float,
        D3dFormat::G32R32F => BridgeFormat::R32G32Sfloat,
        D3dFormat::R32F => BridgeFormat::R32Sfloat,
        D3dFormat::A32B32G32R32F => BridgeFormat::R32G32B32A32Float,
        D3dFormat::D24S8 | D3dFormat::INTZ => BridgeFormat::D24UnormS8Uint,
        _ => BridgeFormat::Undefined,
    }
}

/// Format to publish for a target. Depth targets never publish `Undefined`:
/// unmapped depth formats fall back to D24S8.
pub fn descriptor_format(format: D3dFormat, usage: UsageFlags) -> BridgeFormat {
    match bridge_format(format) {
        BridgeFormat::Undefined if usage.contains(UsageFlags::DEPTH) => BridgeFormat::D24UnormS8Uint,
        mapped => mapped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_formats_map_directly() {
        assert_eq!(bridge_format(D3dFormat::A8R8G8B8), BridgeFormat::R8G8B8A8Unorm);
        assert_eq!(bridge_format(D3dFormat::A16B16G16R16F), BridgeFormat::R16G16B16A16Float);
        assert_eq!(bridge_format(D3dFormat::G32R32F), BridgeFormat::R32G32Sfloat);
        assert_eq!(bridge_format(D3dFormat::INTZ), BridgeFormat::D24UnormS8Uint);
    }

    #[test]
    fn unmapped_depth_falls_back_to_d24s8() {
        let usage = UsageFlags::DEPTH | UsageFlags::SAMPLED;
        assert_eq!(descriptor_format(D3dFormat::D16, usage), BridgeFormat::D24UnormS8Uint);
    }

    #[test]
    fn unmapped_color_stays_undefined() {
        let usage = UsageFlags::COLOR | UsageFlags::SAMPLED;
        assert_eq!(descriptor_format(D3dFormat::D16, usage), BridgeFormat::Undefined);
    }

    #[test]
    fn intz_fourcc_value() {
        assert_eq!(D3dFormat::INTZ.0, 0x5A54_4E49);
    }
}
