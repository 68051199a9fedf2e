//! Processing-unit inventory per SoC
//!
//! The set of units is fixed by the silicon. Table order matters: the
//! resource search walks units in this order, so cheaper and less capable
//! channels come first and keep the scaling channel free for layers that
//! need it.

use crate::display::backend::ControllerGeneration;
use crate::mpp::{LogicalType, MppAttr, MppSpec, PhysicalType};

/// Sources the blitter blends in one combo job
pub const G2D_COMBO_MAX_SOURCES: usize = 16;

fn otf(physical: PhysicalType, logical: LogicalType, index: u32) -> MppSpec {
    MppSpec {
        physical,
        logical,
        physical_index: index,
        logical_index: 0,
        extra_attr: MppAttr::empty(),
        max_sources: 1,
        reserved_for_primary: false,
        resolution_pinned: false,
    }
}

fn m2m(physical: PhysicalType, logical: LogicalType, logical_index: u32) -> MppSpec {
    MppSpec {
        physical,
        logical,
        physical_index: 0,
        logical_index,
        extra_attr: MppAttr::empty(),
        max_sources: 1,
        reserved_for_primary: false,
        resolution_pinned: false,
    }
}

/// Secure DMA channel: an RGB overlay channel that may read protected
/// memory, scanned out on the primary display's topmost window
fn secure_dma() -> MppSpec {
    MppSpec {
        extra_attr: MppAttr::SECURE_DMA | MppAttr::DRM,
        reserved_for_primary: true,
        ..otf(PhysicalType::DppG, LogicalType::DppG, 1)
    }
}

fn g2d_combo() -> MppSpec {
    MppSpec {
        max_sources: G2D_COMBO_MAX_SOURCES,
        resolution_pinned: true,
        ..m2m(PhysicalType::G2d, LogicalType::G2dCombo, 0)
    }
}

/// Units of the SoC paired with `generation`
pub fn inventory(generation: ControllerGeneration) -> Vec<MppSpec> {
    match generation {
        ControllerGeneration::Decon8895 => vec![
            otf(PhysicalType::DppG, LogicalType::DppG, 0),
            otf(PhysicalType::DppG, LogicalType::DppG, 1),
            otf(PhysicalType::DppVg, LogicalType::DppVg, 0),
            otf(PhysicalType::DppVg, LogicalType::DppVg, 1),
            otf(PhysicalType::DppVgrfs, LogicalType::DppVgrfs, 0),
            m2m(PhysicalType::Msc, LogicalType::Msc, 0),
            m2m(PhysicalType::G2d, LogicalType::G2dYuv, 0),
            m2m(PhysicalType::G2d, LogicalType::G2dRgb, 0),
            g2d_combo(),
        ],
        ControllerGeneration::Decon9810 => vec![
            otf(PhysicalType::DppG, LogicalType::DppG, 0),
            otf(PhysicalType::DppGf, LogicalType::DppGf, 0),
            otf(PhysicalType::DppVg, LogicalType::DppVg, 0),
            otf(PhysicalType::DppVgf, LogicalType::DppVgf, 0),
            otf(PhysicalType::DppVgrfs, LogicalType::DppVgrfs, 0),
            secure_dma(),
            m2m(PhysicalType::Msc, LogicalType::Msc, 0),
            m2m(PhysicalType::G2d, LogicalType::G2dYuv, 0),
            m2m(PhysicalType::G2d, LogicalType::G2dYuv, 1),
            m2m(PhysicalType::G2d, LogicalType::G2dRgb, 0),
            m2m(PhysicalType::G2d, LogicalType::G2dRgb, 1),
            g2d_combo(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpp::MppKind;
    use std::collections::HashSet;

    #[test]
    fn test_inventory_names_are_unique() {
        for generation in [ControllerGeneration::Decon8895, ControllerGeneration::Decon9810] {
            let specs = inventory(generation);
            let keys: HashSet<_> = specs
                .iter()
                .map(|s| (s.physical, s.physical_index, s.logical, s.logical_index))
                .collect();
            assert_eq!(keys.len(), specs.len(), "{:?}", generation);
        }
    }

    #[test]
    fn test_on_the_fly_units_come_first() {
        let specs = inventory(ControllerGeneration::Decon9810);
        let first_m2m = specs
            .iter()
            .position(|s| s.physical.kind() == MppKind::M2m)
            .unwrap();
        assert!(specs[first_m2m..]
            .iter()
            .all(|s| s.physical.kind() == MppKind::M2m));
        assert_eq!(
            specs.iter().filter(|s| s.reserved_for_primary).count(),
            1
        );
    }
}
