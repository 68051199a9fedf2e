//! Resource manager
//!
//! The [`ResourceManager`] owns the device-wide inventory of processing
//! units and the [`AssignmentTable`] that records which source is bound to
//! which unit. Every bind and unbind goes through [`ResourceManager::attach`]
//! and [`ResourceManager::detach`], which update the unit's source list and
//! the table together.
//!
//! The per-frame assignment algorithm lives in [`assign`].

pub mod assign;
pub mod realloc;
pub mod table;
pub mod topology;

use crate::buffer::{BufferDescriptor, BufferUsage};
use crate::config::{CapacityConfig, ControlConfig, HwcControl, ResourceConfig};
use crate::display::{DisplayId, DisplayInfo};
use crate::error::AssignError;
use crate::fence::FenceTracker;
use crate::image::{ExynosImage, PixelFormat};
use crate::mpp::{
    CapacityPool, ExynosMpp, HwState, LogicalType, MppContext, MppId, MppInfo, MppKind,
    MppSource, MppSpec, PhysicalType, Rejection,
};
use log::{debug, info, warn};
use realloc::ReallocWorker;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use table::{AssignmentTable, Slot, SourceId};

pub use assign::{AssignReport, AssignRequest};

/// Units a hot-plugged external or virtual display keeps for itself
pub const DEFAULT_RESERVATION: usize = 2;

/// Owner of every processing unit of the device
#[derive(Debug)]
pub struct ResourceManager {
    mpps: Vec<ExynosMpp>,
    table: AssignmentTable,
    control: HwcControl,
    config: ResourceConfig,
    capacity: CapacityConfig,
    tracker: Arc<FenceTracker>,
    realloc: ReallocWorker,
    primary: Option<DisplayId>,
}

impl ResourceManager {
    /// Builds the inventory from `specs`, in table order. Units flagged for
    /// the primary display are reserved to `primary` right away.
    pub fn new(
        ctx: &MppContext,
        control: HwcControl,
        specs: &[MppSpec],
        primary: Option<DisplayId>,
    ) -> Self {
        let mut mpps: Vec<ExynosMpp> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| ExynosMpp::new(MppId(index), spec, ctx))
            .collect();

        for mpp in mpps.iter_mut().filter(|m| m.reserved_for_primary()) {
            match primary {
                Some(display) => mpp.reserve(display),
                // Without a primary panel the secure channel has no window
                None => mpp.set_enabled(false),
            }
        }

        info!(
            "resource manager: {} processing units ({} on-the-fly)",
            mpps.len(),
            mpps.iter().filter(|m| m.is_otf()).count()
        );

        let mut manager = Self {
            mpps,
            table: AssignmentTable::new(),
            control,
            config: ctx.resource.clone(),
            capacity: ctx.capacity.clone(),
            tracker: Arc::clone(&ctx.tracker),
            realloc: ReallocWorker::spawn(),
            primary,
        };
        let snapshot = manager.control.snapshot();
        manager.apply_disabled(&snapshot);
        manager
    }

    pub fn mpps(&self) -> &[ExynosMpp] {
        &self.mpps
    }

    pub fn mpp(&self, id: MppId) -> Option<&ExynosMpp> {
        self.mpps.get(id.0)
    }

    pub fn mpp_mut(&mut self, id: MppId) -> Option<&mut ExynosMpp> {
        self.mpps.get_mut(id.0)
    }

    /// Looks a unit up by its name
    pub fn find(&self, name: &str) -> Option<&ExynosMpp> {
        self.mpps.iter().find(|m| m.name() == name)
    }

    pub fn table(&self) -> &AssignmentTable {
        &self.table
    }

    pub fn control(&self) -> &HwcControl {
        &self.control
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<FenceTracker> {
        &self.tracker
    }

    pub fn primary(&self) -> Option<DisplayId> {
        self.primary
    }

    pub fn infos(&self) -> Vec<MppInfo> {
        self.mpps.iter().map(ExynosMpp::info).collect()
    }

    /// Units in table order matching `filter`
    fn ids_where(&self, filter: impl Fn(&ExynosMpp) -> bool) -> Vec<MppId> {
        self.mpps
            .iter()
            .filter(|m| filter(m))
            .map(ExynosMpp::id)
            .collect()
    }

    /// Regular on-the-fly channels, in search order
    pub(crate) fn otf_ids(&self) -> Vec<MppId> {
        self.ids_where(|m| m.is_otf() && !m.is_secure_dma())
    }

    pub(crate) fn secure_dma_ids(&self) -> Vec<MppId> {
        self.ids_where(ExynosMpp::is_secure_dma)
    }

    /// Single-source memory-to-memory units
    pub(crate) fn m2m_ids(&self) -> Vec<MppId> {
        self.ids_where(|m| m.is_m2m() && m.logical_type() != LogicalType::G2dCombo)
    }

    pub(crate) fn combo_ids(&self) -> Vec<MppId> {
        self.ids_where(|m| m.logical_type() == LogicalType::G2dCombo)
    }

    /// Syncs the administrative enable flags of every unit
    pub fn apply_disabled(&mut self, control: &ControlConfig) {
        let primary = self.primary;
        for mpp in &mut self.mpps {
            let disabled = control.disabled_mpps.iter().any(|n| n == mpp.name());
            let orphaned = mpp.reserved_for_primary() && primary.is_none();
            mpp.set_enabled(!disabled && !orphaned);
        }
    }

    /// Capacity used on the physical unit behind `id`, summed over all of
    /// its logical partitions, against the budget of `display`'s frame
    pub fn capacity_pool(&self, id: MppId, display: &DisplayInfo) -> CapacityPool {
        let Some(mpp) = self.mpp(id) else {
            return CapacityPool::unlimited();
        };
        if mpp.capacity_model().is_none() {
            return CapacityPool::unlimited();
        }
        let physical = mpp.physical_name();
        let used_us = self
            .mpps
            .iter()
            .filter(|m| m.physical_name() == physical)
            .map(ExynosMpp::used_capacity_us)
            .sum();
        CapacityPool {
            used_us,
            budget_us: display.frame_interval_us * self.capacity.budget_ratio,
        }
    }

    /// Binds `source` to `id` in `slot`
    pub(crate) fn attach(
        &mut self,
        display: DisplayId,
        source: SourceId,
        slot: Slot,
        id: MppId,
        src: ExynosImage,
        dst: ExynosImage,
    ) -> Result<(), AssignError> {
        let mpp = self
            .mpps
            .get_mut(id.0)
            .ok_or_else(|| AssignError::Invariant(format!("no processing unit {:?}", id)))?;
        mpp.assign(
            display,
            MppSource {
                id: source,
                src,
                dst,
            },
        )?;
        if let Some(previous) = self.table.bind(source, slot, id) {
            // Keep both sides in agreement before reporting
            if let Some(old) = self.mpps.get_mut(previous.0) {
                old.reset_assigned_state(Some(&source));
            }
            return Err(AssignError::Invariant(format!(
                "{} was still bound to unit {} in slot {:?}",
                source, previous.0, slot
            )));
        }
        debug!("{}: {} -> {}", display, source, self.mpps[id.0].name());
        Ok(())
    }

    /// Unbinds `source` from every unit it holds
    pub fn detach(&mut self, source: &SourceId) {
        let binding = self.table.remove(source);
        for id in binding.units() {
            if let Some(mpp) = self.mpps.get_mut(id.0) {
                mpp.reset_assigned_state(Some(source));
            }
        }
    }

    /// Unbinds every source of `display`
    pub fn reset_display(&mut self, display: DisplayId) {
        for source in self.table.display_sources(display) {
            self.detach(&source);
        }
    }

    /// Releases every unit `display` used: bindings go away and units with
    /// no hardware work left are asked to idle
    pub fn release_display(&mut self, display: DisplayId, units: &[MppId]) {
        self.reset_display(display);
        for id in units {
            if let Some(mpp) = self.mpps.get_mut(id.0) {
                if mpp.assigned_display().is_none() {
                    mpp.request_idle();
                }
            }
        }
    }

    /// Reserves up to `count` free on-the-fly channels for `display`, taken
    /// from the end of the table so the primary keeps the cheap ones
    pub fn reserve_for_display(&mut self, display: DisplayId, count: usize) -> Vec<MppId> {
        let mut reserved = Vec::new();
        for mpp in self.mpps.iter_mut().rev() {
            if reserved.len() == count {
                break;
            }
            if mpp.kind() != MppKind::Otf
                || mpp.is_secure_dma()
                || mpp.reserved_display().is_some()
                || mpp.assigned_display().is_some()
            {
                continue;
            }
            mpp.reserve(display);
            reserved.push(mpp.id());
        }
        if reserved.len() < count {
            warn!(
                "{}: only {} of {} channels could be reserved",
                display,
                reserved.len(),
                count
            );
        }
        info!("{}: reserved {:?}", display, reserved);
        reserved
    }

    /// Drops every reservation held by `display`
    pub fn release_reservations(&mut self, display: DisplayId) {
        for mpp in &mut self.mpps {
            if mpp.reserved_display() == Some(display) && !mpp.reserved_for_primary() {
                mpp.cancel_reservation();
            }
        }
    }

    /// Smallest output the scaling overlay accepts, used to grow protected
    /// and wide-gamut frames at pre-processing
    pub fn min_scaler_output(&self) -> (u32, u32) {
        self.mpps
            .iter()
            .filter(|m| m.physical_type() == PhysicalType::DppVgrfs)
            .map(|m| {
                let dst = m.restrictions().dst(crate::image::RestrictionClass::Rgb);
                (dst.min_crop_width, dst.min_crop_height)
            })
            .next()
            .unwrap_or((16, 16))
    }

    /// Largest upscale any on-the-fly channel offers
    pub(crate) fn max_otf_upscale(&self) -> u32 {
        self.mpps
            .iter()
            .filter(|m| m.is_otf())
            .map(|m| {
                m.restrictions()
                    .max_upscale(crate::image::RestrictionClass::Rgb)
            })
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Reallocates the destination buffers of resolution-pinned units for
    /// a panel now running at `display`'s size
    pub fn request_dst_realloc(&self, display: &DisplayInfo) {
        let rings: Vec<_> = self
            .mpps
            .iter()
            .filter(|m| m.resolution_pinned())
            .map(ExynosMpp::dst_ring)
            .collect();
        self.realloc.request(
            rings,
            BufferDescriptor {
                width: display.width,
                height: display.height,
                format: PixelFormat::Rgba8888,
                usage: BufferUsage::HW_PROCESSING,
            },
        );
    }

    pub fn is_realloc_in_progress(&self) -> bool {
        self.realloc.is_in_progress()
    }

    pub fn wait_realloc(&self, timeout: Duration) -> bool {
        self.realloc.wait_done(timeout)
    }

    /// Why `id` cannot take work this frame regardless of the image
    pub(crate) fn blocked(&self, id: MppId) -> Option<Rejection> {
        let mpp = self.mpp(id)?;
        if mpp.resolution_pinned() && self.realloc.is_in_progress() {
            return Some(Rejection::BUSY);
        }
        None
    }

    /// Cross-checks the units and the table: every bound source appears on
    /// exactly the units the table names, no unit serves two displays and
    /// no unit exceeds its source limit
    pub fn check_invariants(&self) -> Result<(), AssignError> {
        let mut per_unit: BTreeMap<MppId, Vec<SourceId>> = BTreeMap::new();
        for (source, binding) in self.table.iter() {
            for id in binding.units() {
                per_unit.entry(id).or_default().push(*source);
            }
        }

        for mpp in &self.mpps {
            let sources = mpp.sources();
            if sources.len() > mpp.max_sources() {
                return Err(AssignError::Invariant(format!(
                    "{} holds {} sources, limit {}",
                    mpp.name(),
                    sources.len(),
                    mpp.max_sources()
                )));
            }
            if let Some(display) = mpp.assigned_display() {
                if let Some(other) = sources.iter().find(|s| s.id.display() != display) {
                    return Err(AssignError::Invariant(format!(
                        "{} assigned to {} carries {}",
                        mpp.name(),
                        display,
                        other.id
                    )));
                }
            } else if !sources.is_empty() {
                return Err(AssignError::Invariant(format!(
                    "{} has sources but no display",
                    mpp.name()
                )));
            }

            let mut listed: Vec<SourceId> = sources.iter().map(|s| s.id).collect();
            let mut expected = per_unit.remove(&mpp.id()).unwrap_or_default();
            listed.sort();
            expected.sort();
            if listed != expected {
                return Err(AssignError::Invariant(format!(
                    "{} sources {:?} disagree with the table {:?}",
                    mpp.name(),
                    listed,
                    expected
                )));
            }
        }

        if let Some((id, sources)) = per_unit.into_iter().next() {
            return Err(AssignError::Invariant(format!(
                "table binds {:?} to unknown unit {}",
                sources, id.0
            )));
        }
        Ok(())
    }

    /// Number of units currently running
    pub fn running_count(&self) -> usize {
        self.mpps
            .iter()
            .filter(|m| m.hw_state() == HwState::Running)
            .count()
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "resource manager: {} bindings, realloc {:?}",
            self.table.len(),
            self.realloc.state()
        );
        for mpp in &self.mpps {
            mpp.dump(out);
        }
    }
}
