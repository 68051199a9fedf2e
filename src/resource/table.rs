//! Assignment registry
//!
//! The relation between sources (layers and composition targets) and the
//! processing units serving them lives here, in one place. A source holds
//! at most one on-the-fly unit and one memory-to-memory unit. The resource
//! manager updates this table and the unit's own source list together, so
//! neither side can be cleared without the other.

use crate::display::DisplayId;
use crate::layer::LayerId;
use crate::mpp::MppId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Anything that can be bound to a processing unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SourceId {
    Layer(DisplayId, LayerId),
    /// Buffer rendered by the GPU for client-composited layers
    ClientTarget(DisplayId),
    /// Buffer rendered by the blitter for blit-composited layers
    ExynosTarget(DisplayId),
}

impl SourceId {
    pub fn display(&self) -> DisplayId {
        match *self {
            SourceId::Layer(display, _)
            | SourceId::ClientTarget(display)
            | SourceId::ExynosTarget(display) => display,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Layer(display, layer) => write!(f, "{}/{}", display, layer),
            SourceId::ClientTarget(display) => write!(f, "{}/client-target", display),
            SourceId::ExynosTarget(display) => write!(f, "{}/exynos-target", display),
        }
    }
}

/// Units bound to one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub otf: Option<MppId>,
    pub m2m: Option<MppId>,
}

impl Binding {
    pub fn is_empty(&self) -> bool {
        self.otf.is_none() && self.m2m.is_none()
    }

    pub fn units(&self) -> impl Iterator<Item = MppId> {
        self.otf.into_iter().chain(self.m2m)
    }
}

/// Which slot of a [`Binding`] a unit fills
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Otf,
    M2m,
}

#[derive(Debug, Default)]
pub struct AssignmentTable {
    bindings: BTreeMap<SourceId, Binding>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `mpp` in `slot` of `source`. Returns the unit previously
    /// held in that slot.
    pub(crate) fn bind(&mut self, source: SourceId, slot: Slot, mpp: MppId) -> Option<MppId> {
        let binding = self.bindings.entry(source).or_default();
        match slot {
            Slot::Otf => binding.otf.replace(mpp),
            Slot::M2m => binding.m2m.replace(mpp),
        }
    }

    /// Clears one slot of `source`
    pub(crate) fn unbind(&mut self, source: &SourceId, slot: Slot) -> Option<MppId> {
        let binding = self.bindings.get_mut(source)?;
        let previous = match slot {
            Slot::Otf => binding.otf.take(),
            Slot::M2m => binding.m2m.take(),
        };
        if binding.is_empty() {
            self.bindings.remove(source);
        }
        previous
    }

    /// Forgets `source` entirely, returning what it was bound to
    pub(crate) fn remove(&mut self, source: &SourceId) -> Binding {
        self.bindings.remove(source).unwrap_or_default()
    }

    pub fn binding(&self, source: &SourceId) -> Binding {
        self.bindings.get(source).copied().unwrap_or_default()
    }

    pub fn otf(&self, source: &SourceId) -> Option<MppId> {
        self.binding(source).otf
    }

    pub fn m2m(&self, source: &SourceId) -> Option<MppId> {
        self.binding(source).m2m
    }

    /// Sources bound to `mpp`, in key order
    pub fn sources_of(&self, mpp: MppId) -> Vec<SourceId> {
        self.bindings
            .iter()
            .filter(|(_, b)| b.otf == Some(mpp) || b.m2m == Some(mpp))
            .map(|(s, _)| *s)
            .collect()
    }

    /// Sources of `display` that hold any unit
    pub fn display_sources(&self, display: DisplayId) -> Vec<SourceId> {
        self.bindings
            .keys()
            .filter(|s| s.display() == display)
            .copied()
            .collect()
    }

    /// Units used by `display`, deduplicated and sorted
    pub fn display_units(&self, display: DisplayId) -> Vec<MppId> {
        let mut units: Vec<MppId> = self
            .bindings
            .iter()
            .filter(|(s, _)| s.display() == display)
            .flat_map(|(_, b)| b.units())
            .collect();
        units.sort();
        units.dedup();
        units
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourceId, &Binding)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(display: u32, layer: u32) -> SourceId {
        SourceId::Layer(DisplayId(display), LayerId(layer))
    }

    #[test]
    fn test_bind_and_unbind() {
        let mut table = AssignmentTable::new();
        assert_eq!(table.bind(layer(0, 1), Slot::Otf, MppId(3)), None);
        assert_eq!(table.bind(layer(0, 1), Slot::M2m, MppId(7)), None);
        assert_eq!(
            table.binding(&layer(0, 1)),
            Binding {
                otf: Some(MppId(3)),
                m2m: Some(MppId(7))
            }
        );

        assert_eq!(table.unbind(&layer(0, 1), Slot::Otf), Some(MppId(3)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.unbind(&layer(0, 1), Slot::M2m), Some(MppId(7)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_queries_by_unit_and_display() {
        let mut table = AssignmentTable::new();
        table.bind(layer(0, 1), Slot::M2m, MppId(7));
        table.bind(layer(0, 2), Slot::M2m, MppId(7));
        table.bind(SourceId::ExynosTarget(DisplayId(0)), Slot::Otf, MppId(1));
        table.bind(layer(1, 1), Slot::Otf, MppId(2));

        assert_eq!(table.sources_of(MppId(7)), vec![layer(0, 1), layer(0, 2)]);
        assert_eq!(table.display_units(DisplayId(0)), vec![MppId(1), MppId(7)]);
        assert_eq!(table.display_sources(DisplayId(1)), vec![layer(1, 1)]);

        let removed = table.remove(&layer(0, 1));
        assert_eq!(removed.m2m, Some(MppId(7)));
        assert_eq!(table.sources_of(MppId(7)), vec![layer(0, 2)]);
    }

    #[test]
    fn test_source_display() {
        assert_eq!(SourceId::ClientTarget(DisplayId(2)).display(), DisplayId(2));
        assert_eq!(layer(1, 9).display(), DisplayId(1));
    }
}
