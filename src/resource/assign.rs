//! Fixed-point resource assignment
//!
//! [`ResourceManager::assign_resources`] maps every layer of one display,
//! plus its client and blit composition targets, onto processing units and
//! hardware windows. Each pass starts from a clean slate and walks the
//! ordered steps:
//!
//! 1. unbind everything the display held
//! 2. normalize the composition ranges (overlap, sandwiched layers)
//! 3. place the client composition target
//! 4. place protected layers
//! 5. place the blit composition target and its members
//! 6. place wide-gamut layers, then the rest
//!
//! A pass that has to move a layer between compositions reports a change
//! and the next pass starts over with the new decision. Demotions persist
//! across passes, so the set of client layers only grows and the blit set
//! is bounded by the blitter's source limit. Once a pass converges, windows
//! are numbered, the blitter may pull in neighbours and busy
//! memory-to-memory engines demote their sources for the frame. The
//! iteration ceiling turns a non-converging search into
//! [`AssignError::NotConverged`] with every layer sent to the client.

use super::table::{Slot, SourceId};
use super::ResourceManager;
use crate::buffer::BufferUsage;
use crate::config::{ControlConfig, OverlapTieBreak};
use crate::display::composition::CompositionInfo;
use crate::display::DisplayInfo;
use crate::error::AssignError;
use crate::image::{BlendMode, Dataspace, ExynosImage, PixelFormat};
use crate::layer::{ClientReason, ExynosLayer, OverlayPriority, ValidateType};
use crate::mpp::engine::PriorityStatus;
use crate::mpp::{LogicalType, MppId, Rejection};
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeSet;

/// One display's share of an assignment run
#[derive(Debug)]
pub struct AssignRequest<'a> {
    pub info: &'a DisplayInfo,
    /// Layers sorted by z-order, bottom first
    pub layers: &'a mut [ExynosLayer],
    pub client: &'a mut CompositionInfo,
    pub exynos: &'a mut CompositionInfo,
}

/// Summary of a converged assignment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignReport {
    pub iterations: u32,
    pub windows_used: usize,
    pub device_layers: usize,
    pub client_layers: usize,
    pub blit_layers: usize,
    pub secure_dma_used: bool,
}

/// Decisions that outlive a single pass
#[derive(Debug, Default)]
struct SearchState {
    /// Layer indices composed by the blitter
    blit: BTreeSet<usize>,
    /// Engines that declined to start this frame
    busy: BTreeSet<MppId>,
    maximized: bool,
}

enum Pass {
    Converged,
    Changed,
}

enum Placement {
    Placed,
    JoinBlit,
    Failed(ClientReason),
}

/// Window budget of one pass. The composition targets' windows are set
/// aside before layers are placed.
struct Windows {
    free: usize,
    held_for_blit: bool,
}

impl Windows {
    fn available(&self, may_use_held: bool) -> bool {
        self.free > 0 || (may_use_held && self.held_for_blit)
    }

    fn take(&mut self, may_use_held: bool) -> bool {
        if self.free > 0 {
            self.free -= 1;
            true
        } else if may_use_held && self.held_for_blit {
            self.held_for_blit = false;
            true
        } else {
            false
        }
    }

    fn take_held(&mut self) -> bool {
        std::mem::replace(&mut self.held_for_blit, false)
    }
}

type Rejections = Vec<(LogicalType, Rejection)>;

fn span(indices: impl Iterator<Item = usize>) -> Option<(usize, usize)> {
    indices.fold(None, |acc, i| match acc {
        None => Some((i, i)),
        Some((lo, hi)) => Some((lo.min(i), hi.max(i))),
    })
}

fn client_span(layers: &[ExynosLayer]) -> Option<(usize, usize)> {
    span(
        layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.validate_type() == ValidateType::Client)
            .map(|(i, _)| i),
    )
}

fn record(layer: &mut ExynosLayer, rejections: Rejections) {
    for (logical, reason) in rejections {
        layer.add_rejection(logical, reason);
    }
}

/// A client layer may still move into the blit composition
fn movable_to_blit(layer: &ExynosLayer) -> bool {
    matches!(
        layer.client_reason(),
        Some(ClientReason::NoResource | ClientReason::NoWindow | ClientReason::Sandwiched)
    )
}

fn demote_blit(req: &mut AssignRequest<'_>, state: &mut SearchState, reason: ClientReason) {
    for &i in &state.blit {
        req.layers[i].demote(reason);
    }
    state.blit.clear();
}

/// Full-screen image the GPU renders the client composition into
pub fn client_target_image(info: &DisplayInfo, dataspace: Dataspace) -> ExynosImage {
    ExynosImage {
        blending: BlendMode::Premultiplied,
        dataspace,
        usage: BufferUsage::COMPOSER_OVERLAY | BufferUsage::GPU_RENDER_TARGET,
        ..ExynosImage::full_surface(info.width, info.height, PixelFormat::Rgba8888)
    }
}

/// Full-screen image the blitter composes its members into
pub fn exynos_target_image(info: &DisplayInfo, hdr: bool, z_order: u32) -> ExynosImage {
    let (format, dataspace) = if hdr {
        (PixelFormat::Rgba1010102, Dataspace::BT2020_PQ)
    } else {
        (PixelFormat::Rgba8888, Dataspace::SRGB)
    };
    ExynosImage {
        blending: BlendMode::Premultiplied,
        dataspace,
        usage: BufferUsage::HW_PROCESSING,
        z_order,
        ..ExynosImage::full_surface(info.width, info.height, format)
    }
}

impl ResourceManager {
    /// Runs the assignment for one display.
    ///
    /// On failure every layer has been moved to client composition and the
    /// client target sits on the first free channel when one exists, so the
    /// display can still present.
    pub fn assign_resources(
        &mut self,
        req: &mut AssignRequest<'_>,
    ) -> Result<AssignReport, AssignError> {
        let control = self.control.snapshot();
        self.apply_disabled(&control);

        for layer in req.layers.iter_mut() {
            layer.reset_validate_info();
            if control.force_gpu {
                layer.demote(ClientReason::Requested);
            }
        }

        let ceiling = self.config.max_assign_iterations.max(1);
        let mut state = SearchState::default();
        let result = self.iterate(req, &control, &mut state, ceiling);
        if let Err(err) = &result {
            warn!("{}: {}, falling back to client composition", req.info.id, err);
            self.fall_back_to_client(req, &control);
        }
        result
    }

    fn iterate(
        &mut self,
        req: &mut AssignRequest<'_>,
        control: &ControlConfig,
        state: &mut SearchState,
        ceiling: u32,
    ) -> Result<AssignReport, AssignError> {
        for iteration in 1..=ceiling {
            if let Pass::Changed = self.run_pass(req, control, state)? {
                continue;
            }
            if self.maximize_blit(req, control, state) {
                debug!("{}: blitter pulled in neighbours", req.info.id);
                continue;
            }
            if self.settle_priorities(req, state) {
                continue;
            }
            return self.finish(req, iteration);
        }
        Err(AssignError::NotConverged {
            iterations: ceiling,
        })
    }

    fn run_pass(
        &mut self,
        req: &mut AssignRequest<'_>,
        control: &ControlConfig,
        state: &mut SearchState,
    ) -> Result<Pass, AssignError> {
        let display = req.info.id;
        let n = req.layers.len();

        self.reset_display(display);
        for layer in req.layers.iter_mut() {
            layer.reset_validate_data();
        }
        req.client.reset_pass();
        req.exynos.reset_pass();
        state
            .blit
            .retain(|&i| i < n && req.layers[i].client_reason().is_none());

        if self.normalize_ranges(req, control, state) {
            return Ok(Pass::Changed);
        }

        let client = client_span(req.layers);
        let blit = span(state.blit.iter().copied());
        req.client.set_range(client);
        req.exynos.set_range(blit);
        for &i in &state.blit {
            req.layers[i].set_validate_type(ValidateType::Exynos);
        }

        let max_windows = req.info.max_windows;
        if max_windows == 0 {
            return Err(AssignError::Invariant(format!("{} has no windows", display)));
        }
        let reserved = usize::from(client.is_some()) + usize::from(blit.is_some());
        if reserved > max_windows {
            demote_blit(req, state, ClientReason::NoWindow);
            return Ok(Pass::Changed);
        }
        let mut windows = Windows {
            free: max_windows - reserved,
            held_for_blit: blit.is_some(),
        };

        if let Some((first, _)) = client {
            let image = client_target_image(req.info, req.client.dataspace());
            // Max-priority layers kept inside the range scan out above the target
            let topmost = req.layers[first..]
                .iter()
                .all(|l| l.validate_type() == ValidateType::Client);
            let allow_secure = control.secure_dma_for_client && topmost;
            let mut ignored = Vec::new();
            let id = self
                .find_otf(req.info, &image, &image, allow_secure, state, &mut ignored)
                .ok_or(AssignError::ClientTargetUnassignable)?;
            self.attach(
                display,
                req.client.source_id(),
                Slot::Otf,
                id,
                image.clone(),
                image.clone(),
            )?;
            req.client.set_image(image);
        }

        if let Some(pass) = self.place_priority(req, control, state, &mut windows, OverlayPriority::Max)? {
            return Ok(pass);
        }

        if blit.is_some() {
            if let Placement::Failed(reason) = self.place_exynos_target(req, state, &mut windows)? {
                debug!("{}: blit target failed ({:?})", display, reason);
                demote_blit(req, state, reason);
                return Ok(Pass::Changed);
            }
        }

        for priority in [OverlayPriority::High, OverlayPriority::Low] {
            if let Some(pass) = self.place_priority(req, control, state, &mut windows, priority)? {
                return Ok(pass);
            }
        }
        Ok(Pass::Converged)
    }

    /// Places every still undecided layer of `priority`. Returns the pass
    /// result as soon as one layer changes composition.
    fn place_priority(
        &mut self,
        req: &mut AssignRequest<'_>,
        control: &ControlConfig,
        state: &mut SearchState,
        windows: &mut Windows,
        priority: OverlayPriority,
    ) -> Result<Option<Pass>, AssignError> {
        for i in 0..req.layers.len() {
            let layer = &req.layers[i];
            if layer.priority() != priority || layer.validate_type() != ValidateType::Device {
                continue;
            }
            match self.place_layer(req, i, control, state, windows)? {
                Placement::Placed => {}
                Placement::JoinBlit => {
                    debug!("{}: {} joins the blit composition", req.info.id, req.layers[i].id());
                    state.blit.insert(i);
                    return Ok(Some(Pass::Changed));
                }
                Placement::Failed(reason) => {
                    debug!("{}: {} demoted ({:?})", req.info.id, req.layers[i].id(), reason);
                    req.layers[i].demote(reason);
                    return Ok(Some(Pass::Changed));
                }
            }
        }
        Ok(None)
    }

    /// Every per-unit check that does not depend on other sources
    fn check_unit(
        &self,
        id: MppId,
        info: &DisplayInfo,
        src: &ExynosImage,
        dst: &ExynosImage,
        state: &SearchState,
    ) -> Result<(), Rejection> {
        if state.busy.contains(&id) {
            return Err(Rejection::BUSY);
        }
        if let Some(reason) = self.blocked(id) {
            return Err(reason);
        }
        let mpp = &self.mpps[id.0];
        mpp.is_supported(info, src, dst)?;
        mpp.is_assignable(info, src, dst, &self.capacity_pool(id, info))
    }

    /// First on-the-fly channel taking `src` to `dst`. The secure DMA
    /// channel is tried first when allowed.
    fn find_otf(
        &self,
        info: &DisplayInfo,
        src: &ExynosImage,
        dst: &ExynosImage,
        allow_secure: bool,
        state: &SearchState,
        rejections: &mut Rejections,
    ) -> Option<MppId> {
        let mut candidates = if allow_secure {
            self.secure_dma_ids()
        } else {
            Vec::new()
        };
        candidates.extend(self.otf_ids());
        candidates
            .into_iter()
            .find(|&id| match self.check_unit(id, info, src, dst, state) {
                Ok(()) => true,
                Err(reason) => {
                    rejections.push((self.mpps[id.0].logical_type(), reason));
                    false
                }
            })
    }

    /// Output images a memory-to-memory unit could produce for `src`
    /// scanned out at `dst`, most preferred first. An upscale is split so
    /// the overlay does the final step within its own ratio.
    pub(crate) fn candidate_out_images(
        &self,
        src: &ExynosImage,
        dst: &ExynosImage,
    ) -> Vec<ExynosImage> {
        let hdr = src.dataspace.is_hdr();
        let mut usage = BufferUsage::HW_PROCESSING;
        usage |= src.usage & (BufferUsage::PROTECTED | BufferUsage::SECURE);
        let template = ExynosImage {
            format: if hdr {
                PixelFormat::Rgba1010102
            } else {
                PixelFormat::Rgba8888
            },
            usage,
            dataspace: if hdr { src.dataspace } else { Dataspace::SRGB },
            blending: src.blending,
            plane_alpha: src.plane_alpha,
            z_order: src.z_order,
            ..ExynosImage::default()
        };
        let sized = |w: u32, h: u32| ExynosImage {
            full_width: w,
            full_height: h,
            w,
            h,
            ..template.clone()
        };

        let mut images = Vec::with_capacity(2);
        let (rot_w, rot_h) = src.rotated_size();
        if dst.w > rot_w || dst.h > rot_h {
            let up = self.max_otf_upscale();
            let w = rot_w.max((dst.w + up - 1) / up).min(dst.w);
            let h = rot_h.max((dst.h + up - 1) / up).min(dst.h);
            if (w, h) != (dst.w, dst.h) {
                images.push(sized(w, h));
            }
        }
        images.push(sized(dst.w, dst.h));
        images
    }

    /// Memory-to-memory unit, intermediate image and downstream overlay
    /// for a layer no overlay can take directly
    fn find_m2m_path(
        &self,
        info: &DisplayInfo,
        src: &ExynosImage,
        dst: &ExynosImage,
        state: &SearchState,
        rejections: &mut Rejections,
    ) -> Option<(MppId, MppId, ExynosImage)> {
        let candidates = self.candidate_out_images(src, dst);
        for id in self.m2m_ids() {
            let logical = self.mpps[id.0].logical_type();
            for mid in &candidates {
                if let Err(reason) = self.check_unit(id, info, src, mid, state) {
                    rejections.push((logical, reason));
                    continue;
                }
                let mut downstream = Vec::new();
                if let Some(otf) = self.find_otf(info, mid, dst, false, state, &mut downstream) {
                    return Some((id, otf, mid.clone()));
                }
            }
        }
        None
    }

    /// Sources the blit composition can hold
    fn blit_room(&self) -> usize {
        self.combo_ids()
            .first()
            .map_or(0, |id| self.mpps[id.0].max_sources())
    }

    /// Whether a layer could be blended by the blitter
    fn blit_accepts(
        &self,
        info: &DisplayInfo,
        layer: &ExynosLayer,
        control: &ControlConfig,
        state: &SearchState,
    ) -> bool {
        if !control.use_blit_composition || layer.is_protected() || layer.is_color() {
            return false;
        }
        self.combo_ids().into_iter().any(|id| {
            !state.busy.contains(&id)
                && self.blocked(id).is_none()
                && self.mpps[id.0]
                    .is_supported(info, layer.src_image(), layer.dst_image())
                    .is_ok()
        })
    }

    fn blit_or(
        &self,
        req: &AssignRequest<'_>,
        index: usize,
        control: &ControlConfig,
        state: &SearchState,
        reason: ClientReason,
    ) -> Placement {
        if state.blit.len() < self.blit_room()
            && self.blit_accepts(req.info, &req.layers[index], control, state)
        {
            Placement::JoinBlit
        } else {
            Placement::Failed(reason)
        }
    }

    /// Resource search of one layer: overlay, then memory-to-memory unit
    /// feeding an overlay, then the blit composition
    fn place_layer(
        &mut self,
        req: &mut AssignRequest<'_>,
        index: usize,
        control: &ControlConfig,
        state: &mut SearchState,
        windows: &mut Windows,
    ) -> Result<Placement, AssignError> {
        let display = req.info.id;
        let n = req.layers.len();
        let layer = &req.layers[index];
        let max_priority = layer.priority() == OverlayPriority::Max;
        let source = SourceId::Layer(display, layer.id());

        if layer.is_color() {
            return Ok(if windows.take(max_priority) {
                Placement::Placed
            } else {
                Placement::Failed(ClientReason::NoWindow)
            });
        }
        if !windows.available(max_priority) {
            return Ok(self.blit_or(req, index, control, state, ClientReason::NoWindow));
        }

        let src = layer.src_image().clone();
        let dst = layer.dst_image().clone();
        let mut rejections = Vec::new();
        let allow_secure = max_priority && control.secure_dma_for_client && index + 1 == n;

        if let Some(id) = self.find_otf(req.info, &src, &dst, allow_secure, state, &mut rejections) {
            self.attach(display, source, Slot::Otf, id, src, dst)?;
            windows.take(max_priority);
            record(&mut req.layers[index], rejections);
            return Ok(Placement::Placed);
        }

        if let Some((m2m, otf, mid)) = self.find_m2m_path(req.info, &src, &dst, state, &mut rejections) {
            self.attach(display, source, Slot::M2m, m2m, src, mid.clone())?;
            self.attach(display, source, Slot::Otf, otf, mid.clone(), dst)?;
            windows.take(max_priority);
            let layer = &mut req.layers[index];
            layer.set_m2m_out_image(Some(mid));
            record(layer, rejections);
            return Ok(Placement::Placed);
        }

        record(&mut req.layers[index], rejections);
        Ok(self.blit_or(req, index, control, state, ClientReason::NoResource))
    }

    /// Binds every blit member to the blitter and the composed target to
    /// an overlay
    fn place_exynos_target(
        &mut self,
        req: &mut AssignRequest<'_>,
        state: &SearchState,
        windows: &mut Windows,
    ) -> Result<Placement, AssignError> {
        let display = req.info.id;
        let members: Vec<usize> = state.blit.iter().copied().collect();
        let Some(&first) = members.first() else {
            return Ok(Placement::Placed);
        };

        let combo = self.combo_ids().into_iter().find(|&id| {
            !state.busy.contains(&id)
                && self.blocked(id).is_none()
                && self.mpps[id.0].is_assignable_state(display)
        });
        let Some(combo) = combo else {
            return Ok(Placement::Failed(ClientReason::BlitTargetFailed));
        };

        let hdr = members
            .iter()
            .any(|&i| req.layers[i].src_image().dataspace.is_hdr());
        let target = exynos_target_image(req.info, hdr, req.layers[first].z_order());

        for &i in &members {
            let layer = &req.layers[i];
            let source = SourceId::Layer(display, layer.id());
            let src = layer.src_image().clone();
            let dst = ExynosImage {
                format: target.format,
                dataspace: target.dataspace,
                ..layer.dst_image().clone()
            };
            let mpp = &self.mpps[combo.0];
            let logical = mpp.logical_type();
            let checked = mpp.is_supported(req.info, &src, &dst).and_then(|()| {
                mpp.is_assignable(req.info, &src, &dst, &self.capacity_pool(combo, req.info))
            });
            if let Err(reason) = checked {
                req.layers[i].add_rejection(logical, reason);
                return Ok(Placement::Failed(ClientReason::BlitTargetFailed));
            }
            self.attach(display, source, Slot::M2m, combo, src, dst)?;
        }

        if !windows.take_held() {
            return Ok(Placement::Failed(ClientReason::NoWindow));
        }
        let mut ignored = Vec::new();
        match self.find_otf(req.info, &target, &target, false, state, &mut ignored) {
            Some(id) => {
                self.attach(
                    display,
                    req.exynos.source_id(),
                    Slot::Otf,
                    id,
                    target.clone(),
                    target.clone(),
                )?;
                req.exynos.set_image(target);
                Ok(Placement::Placed)
            }
            None => Ok(Placement::Failed(ClientReason::BlitTargetFailed)),
        }
    }

    /// Keeps the composition ranges contiguous and disjoint. Returns true
    /// when a layer changed composition.
    fn normalize_ranges(
        &self,
        req: &mut AssignRequest<'_>,
        control: &ControlConfig,
        state: &mut SearchState,
    ) -> bool {
        let Some(client) = client_span(req.layers) else {
            return self.fill_blit_gaps(req, control, state);
        };
        if let Some(blit) = span(state.blit.iter().copied()) {
            if client.0 <= blit.1 && blit.0 <= client.1 {
                self.resolve_overlap(req, control, state, client, blit);
                return true;
            }
        }

        let mut changed = false;
        for layer in &mut req.layers[client.0..=client.1] {
            if layer.validate_type() != ValidateType::Client
                && layer.priority() != OverlayPriority::Max
            {
                layer.demote(ClientReason::Sandwiched);
                changed = true;
            }
        }
        if changed {
            return true;
        }
        self.fill_blit_gaps(req, control, state)
    }

    /// Shrinks whichever of two overlapping ranges moves fewer layers
    fn resolve_overlap(
        &self,
        req: &mut AssignRequest<'_>,
        control: &ControlConfig,
        state: &mut SearchState,
        client: (usize, usize),
        blit: (usize, usize),
    ) {
        let (c0, c1) = client;
        let (b0, b1) = blit;

        // Blit members that leave for the client
        let straddles = state.blit.iter().any(|&i| i < c0) && state.blit.iter().any(|&i| i > c1);
        let to_client: Vec<usize> = state
            .blit
            .iter()
            .copied()
            .filter(|&i| straddles || (c0 <= i && i <= c1))
            .collect();

        // Client layers that leave for the blitter
        let is_client = |i: usize| req.layers[i].validate_type() == ValidateType::Client;
        let encloses = (c0..b0).any(is_client) && (b1 + 1..=c1).any(is_client);
        let to_blit: Vec<usize> = (b0..=b1).filter(|&i| is_client(i)).collect();
        let blit_cost = (!encloses
            && state.blit.len() + to_blit.len() <= self.blit_room()
            && to_blit.iter().all(|&i| {
                movable_to_blit(&req.layers[i])
                    && self.blit_accepts(req.info, &req.layers[i], control, state)
            }))
        .then(|| to_blit.len());

        let shrink_blit = match blit_cost {
            None => true,
            Some(cost) if to_client.len() == cost => {
                control.overlap_tie_break == OverlapTieBreak::PreferClient
            }
            Some(cost) => to_client.len() < cost,
        };

        if shrink_blit {
            debug!(
                "{}: overlap, {} blit layers move to the client",
                req.info.id,
                to_client.len()
            );
            for i in to_client {
                state.blit.remove(&i);
                req.layers[i].demote(ClientReason::Overlap);
            }
        } else {
            debug!(
                "{}: overlap, {} client layers move to the blitter",
                req.info.id,
                to_blit.len()
            );
            for i in to_blit {
                req.layers[i].clear_demotion();
                state.blit.insert(i);
            }
        }
    }

    /// Layers strictly inside the blit range join it or break it up
    fn fill_blit_gaps(
        &self,
        req: &mut AssignRequest<'_>,
        control: &ControlConfig,
        state: &mut SearchState,
    ) -> bool {
        let Some((b0, b1)) = span(state.blit.iter().copied()) else {
            return false;
        };
        let gaps: Vec<usize> = (b0..=b1).filter(|i| !state.blit.contains(i)).collect();
        if gaps.is_empty() {
            return false;
        }
        let fits = state.blit.len() + gaps.len() <= self.blit_room()
            && gaps
                .iter()
                .all(|&i| self.blit_accepts(req.info, &req.layers[i], control, state));
        if fits {
            state.blit.extend(gaps);
        } else {
            demote_blit(req, state, ClientReason::BlitTargetFailed);
        }
        true
    }

    /// Greedily extends the blit range over adjacent overlay layers, once
    /// per assignment
    fn maximize_blit(
        &self,
        req: &mut AssignRequest<'_>,
        control: &ControlConfig,
        state: &mut SearchState,
    ) -> bool {
        if !control.maximize_blitter || !control.use_blit_composition || state.maximized {
            return false;
        }
        state.maximized = true;
        let Some((b0, b1)) = span(state.blit.iter().copied()) else {
            return false;
        };
        let room = self.blit_room();
        let display = req.info.id;
        let layers = &*req.layers;
        let pullable = |layer: &ExynosLayer| {
            layer.validate_type() == ValidateType::Device
                && matches!(layer.priority(), OverlayPriority::Low | OverlayPriority::High)
                && self.table.m2m(&SourceId::Layer(display, layer.id())).is_none()
                && self.blit_accepts(req.info, layer, control, state)
        };

        let mut pulled = Vec::new();
        let mut lo = b0;
        while lo > 0 && state.blit.len() + pulled.len() < room && pullable(&layers[lo - 1]) {
            lo -= 1;
            pulled.push(lo);
        }
        let mut hi = b1;
        while hi + 1 < layers.len()
            && state.blit.len() + pulled.len() < room
            && pullable(&layers[hi + 1])
        {
            hi += 1;
            pulled.push(hi);
        }
        let changed = !pulled.is_empty();
        state.blit.extend(pulled);
        changed
    }

    /// Asks every memory-to-memory engine the display uses whether it can
    /// start this frame. Sources of a busy engine go to the client for the
    /// frame and the engine is left out of the next passes.
    fn settle_priorities(&mut self, req: &mut AssignRequest<'_>, state: &mut SearchState) -> bool {
        let display = req.info.id;
        let units: Vec<MppId> = self
            .table
            .display_units(display)
            .into_iter()
            .filter(|id| self.mpps[id.0].is_m2m())
            .collect();

        let mut changed = false;
        for id in units {
            let sources = self.table.sources_of(id);
            let priority = sources
                .iter()
                .map(|source| self.source_priority(req, state, source))
                .max()
                .unwrap_or(OverlayPriority::Low);
            if self.mpps[id.0].request_priority(display, priority as u32) == PriorityStatus::Ready {
                continue;
            }
            warn!(
                "{}: {} is busy, {} sources go to the client this frame",
                display,
                self.mpps[id.0].name(),
                sources.len()
            );
            state.busy.insert(id);
            for source in &sources {
                match source {
                    SourceId::Layer(_, layer_id) => {
                        if let Some(i) = req.layers.iter().position(|l| l.id() == *layer_id) {
                            state.blit.remove(&i);
                            req.layers[i].demote(ClientReason::Busy);
                        }
                    }
                    SourceId::ExynosTarget(_) => demote_blit(req, state, ClientReason::Busy),
                    SourceId::ClientTarget(_) => {}
                }
            }
            changed = true;
        }
        changed
    }

    fn source_priority(
        &self,
        req: &AssignRequest<'_>,
        state: &SearchState,
        source: &SourceId,
    ) -> OverlayPriority {
        match source {
            SourceId::Layer(_, id) => req
                .layers
                .iter()
                .find(|l| l.id() == *id)
                .map_or(OverlayPriority::Low, ExynosLayer::priority),
            SourceId::ExynosTarget(_) => state
                .blit
                .iter()
                .map(|&i| req.layers[i].priority())
                .max()
                .unwrap_or(OverlayPriority::Low),
            SourceId::ClientTarget(_) => OverlayPriority::Low,
        }
    }

    fn finish(
        &mut self,
        req: &mut AssignRequest<'_>,
        iteration: u32,
    ) -> Result<AssignReport, AssignError> {
        let (windows_used, secure_dma_used) = self.assign_windows(req)?;
        self.check_invariants()?;

        let count = |ty: ValidateType| req.layers.iter().filter(|l| l.validate_type() == ty).count();
        let report = AssignReport {
            iterations: iteration,
            windows_used,
            device_layers: count(ValidateType::Device),
            client_layers: count(ValidateType::Client),
            blit_layers: count(ValidateType::Exynos),
            secure_dma_used,
        };
        debug!(
            "{}: converged after {} passes: {} device, {} client, {} blit, {} windows",
            req.info.id,
            report.iterations,
            report.device_layers,
            report.client_layers,
            report.blit_layers,
            report.windows_used
        );
        Ok(report)
    }

    /// Numbers the windows bottom-up. The secure DMA channel always scans
    /// out on the last window, so its source must be the topmost one.
    fn assign_windows(&self, req: &mut AssignRequest<'_>) -> Result<(usize, bool), AssignError> {
        #[derive(Clone, Copy)]
        enum Item {
            Client,
            Exynos,
            Layer(usize),
        }

        let display = req.info.id;
        let n = req.layers.len();
        req.client.check_range(n)?;
        req.exynos.check_range(n)?;
        if req.client.overlaps(req.exynos) {
            return Err(AssignError::Invariant(format!(
                "{}: client range {:?} overlaps blit range {:?}",
                display,
                req.client.range(),
                req.exynos.range()
            )));
        }

        let mut items = Vec::new();
        for i in 0..n {
            if req.client.first_index() == Some(i) {
                items.push(Item::Client);
            }
            if req.exynos.first_index() == Some(i) {
                items.push(Item::Exynos);
            }
            let layer = &req.layers[i];
            let misplaced = match layer.validate_type() {
                ValidateType::Device => {
                    items.push(Item::Layer(i));
                    req.exynos.contains(i)
                }
                ValidateType::Client => !req.client.contains(i),
                ValidateType::Exynos => !req.exynos.contains(i),
            };
            if misplaced {
                return Err(AssignError::Invariant(format!(
                    "{}: {} ({:?}) disagrees with ranges {:?}/{:?}",
                    display,
                    layer.id(),
                    layer.validate_type(),
                    req.client.range(),
                    req.exynos.range()
                )));
            }
        }

        let secure = self.secure_dma_ids();
        let source_of = |item: Item, layers: &[ExynosLayer]| match item {
            Item::Client => SourceId::ClientTarget(display),
            Item::Exynos => SourceId::ExynosTarget(display),
            Item::Layer(i) => SourceId::Layer(display, layers[i].id()),
        };

        let max_windows = req.info.max_windows;
        let mut next = 0;
        let mut secure_used = false;
        for (position, &item) in items.iter().enumerate() {
            let source = source_of(item, req.layers);
            let on_secure = self
                .table
                .otf(&source)
                .map_or(false, |id| secure.contains(&id));
            let window = if on_secure {
                if position + 1 != items.len() {
                    return Err(AssignError::Invariant(format!(
                        "{}: {} on the secure channel is not topmost",
                        display, source
                    )));
                }
                secure_used = true;
                max_windows - 1
            } else {
                next += 1;
                next - 1
            };
            match item {
                Item::Client => req.client.set_window_index(Some(window)),
                Item::Exynos => req.exynos.set_window_index(Some(window)),
                Item::Layer(i) => req.layers[i].set_window_index(Some(window)),
            }
        }

        let limit = max_windows - usize::from(secure_used);
        if next > limit {
            return Err(AssignError::Invariant(format!(
                "{}: {} windows assigned, {} available",
                display, next, limit
            )));
        }
        Ok((items.len(), secure_used))
    }

    /// Sends every layer to the client and puts the client target on the
    /// first channel that takes it. It is the only window, so it is also
    /// the topmost one.
    fn fall_back_to_client(&mut self, req: &mut AssignRequest<'_>, control: &ControlConfig) {
        let display = req.info.id;
        self.reset_display(display);
        req.client.reset_pass();
        req.exynos.reset_pass();
        for layer in req.layers.iter_mut() {
            layer.reset_validate_data();
            layer.demote(ClientReason::NoResource);
        }
        let n = req.layers.len();
        if n == 0 {
            return;
        }
        req.client.set_range(Some((0, n - 1)));

        let image = client_target_image(req.info, req.client.dataspace());
        let state = SearchState::default();
        let mut ignored = Vec::new();
        let placed = self
            .find_otf(
                req.info,
                &image,
                &image,
                control.secure_dma_for_client,
                &state,
                &mut ignored,
            )
            .map(|id| {
                self.attach(
                    display,
                    req.client.source_id(),
                    Slot::Otf,
                    id,
                    image.clone(),
                    image.clone(),
                )
            });
        match placed {
            Some(Ok(())) => {
                req.client.set_image(image);
                if let Err(err) = self.assign_windows(req) {
                    warn!("{}: client target fallback has no window: {}", display, err);
                }
            }
            Some(Err(err)) => warn!("{}: client target fallback failed: {}", display, err),
            None => warn!("{}: no channel left for the client target", display),
        }
    }
}

#[cfg(test)]
mod tests;
