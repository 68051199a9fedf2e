//! Size, alignment and scale-ratio restrictions of processing units
//!
//! Every table exists twice, once per [`RestrictionClass`], because the
//! hardware applies different constraints to RGB and YUV images.

use super::PhysicalType;
use crate::image::RestrictionClass;
use serde::Serialize;

/// Size and alignment limits of one side (source or destination)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeRestriction {
    pub max_full_width: u32,
    pub max_full_height: u32,
    pub min_full_width: u32,
    pub min_full_height: u32,
    pub full_width_align: u32,
    pub full_height_align: u32,
    pub max_crop_width: u32,
    pub max_crop_height: u32,
    pub min_crop_width: u32,
    pub min_crop_height: u32,
    pub crop_x_align: u32,
    pub crop_y_align: u32,
    pub crop_width_align: u32,
    pub crop_height_align: u32,
}

impl SizeRestriction {
    const fn uniform(
        max: u32,
        min: u32,
        full_align: u32,
        crop_min: u32,
        offset_align: u32,
        size_align: u32,
    ) -> Self {
        Self {
            max_full_width: max,
            max_full_height: max,
            min_full_width: min,
            min_full_height: min,
            full_width_align: full_align,
            full_height_align: full_align,
            max_crop_width: max,
            max_crop_height: max,
            min_crop_width: crop_min,
            min_crop_height: crop_min,
            crop_x_align: offset_align,
            crop_y_align: offset_align,
            crop_width_align: size_align,
            crop_height_align: size_align,
        }
    }
}

/// Complete restriction set of one physical unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestrictionTable {
    pub src: [SizeRestriction; RestrictionClass::COUNT],
    pub dst: [SizeRestriction; RestrictionClass::COUNT],
    /// Maximum source/destination ratio, per class
    pub max_downscale: [u32; RestrictionClass::COUNT],
    /// Maximum destination/source ratio, per class
    pub max_upscale: [u32; RestrictionClass::COUNT],
}

impl RestrictionTable {
    pub fn src(&self, class: RestrictionClass) -> &SizeRestriction {
        &self.src[class.index()]
    }

    pub fn dst(&self, class: RestrictionClass) -> &SizeRestriction {
        &self.dst[class.index()]
    }

    pub fn max_downscale(&self, class: RestrictionClass) -> u32 {
        self.max_downscale[class.index()]
    }

    pub fn max_upscale(&self, class: RestrictionClass) -> u32 {
        self.max_upscale[class.index()]
    }

    /// Restrictions of a physical unit type on the 9810 generation
    pub fn for_physical(physical: PhysicalType) -> Self {
        match physical {
            PhysicalType::DppG | PhysicalType::DppGf => Self::DPP_NO_SCALE,
            PhysicalType::DppVg | PhysicalType::DppVgf | PhysicalType::DppVgrfs => {
                Self::DPP_SCALE
            }
            PhysicalType::Msc => Self::MSC,
            PhysicalType::G2d => Self::G2D,
        }
    }

    const DPP_SRC_RGB: SizeRestriction = SizeRestriction::uniform(65535, 16, 1, 16, 1, 1);
    const DPP_SRC_YUV: SizeRestriction = SizeRestriction::uniform(65535, 32, 2, 32, 2, 2);
    const DPP_DST_RGB: SizeRestriction = SizeRestriction {
        max_full_width: 8192,
        max_full_height: 8192,
        max_crop_width: 4096,
        max_crop_height: 4096,
        ..SizeRestriction::uniform(8192, 16, 1, 16, 1, 1)
    };
    const DPP_DST_YUV: SizeRestriction = SizeRestriction {
        max_full_width: 8192,
        max_full_height: 8192,
        max_crop_width: 4096,
        max_crop_height: 4096,
        ..SizeRestriction::uniform(8192, 16, 1, 16, 1, 1)
    };

    const DPP_NO_SCALE: RestrictionTable = RestrictionTable {
        src: [Self::DPP_SRC_RGB, Self::DPP_SRC_YUV],
        dst: [Self::DPP_DST_RGB, Self::DPP_DST_YUV],
        max_downscale: [1, 1],
        max_upscale: [1, 1],
    };

    const DPP_SCALE: RestrictionTable = RestrictionTable {
        src: [Self::DPP_SRC_RGB, Self::DPP_SRC_YUV],
        dst: [Self::DPP_DST_RGB, Self::DPP_DST_YUV],
        max_downscale: [2, 2],
        max_upscale: [8, 8],
    };

    const MSC: RestrictionTable = RestrictionTable {
        src: [
            SizeRestriction::uniform(8192, 16, 1, 16, 1, 1),
            SizeRestriction::uniform(8192, 16, 2, 16, 2, 2),
        ],
        dst: [
            SizeRestriction::uniform(8192, 16, 1, 16, 1, 1),
            SizeRestriction::uniform(8192, 16, 2, 16, 2, 2),
        ],
        max_downscale: [16, 16],
        max_upscale: [8, 8],
    };

    const G2D: RestrictionTable = RestrictionTable {
        src: [
            SizeRestriction::uniform(8192, 1, 1, 1, 1, 1),
            SizeRestriction::uniform(8192, 2, 2, 2, 2, 2),
        ],
        dst: [
            SizeRestriction::uniform(8192, 1, 1, 1, 1, 1),
            SizeRestriction::uniform(8192, 2, 2, 2, 2, 2),
        ],
        max_downscale: [16, 16],
        max_upscale: [8, 8],
    };
}
