//! Per-layer working sets for one slice view
//!
//! Every input change bumps the view generation. `update` recomputes the
//! working set of each layer and returns only the layers whose set actually
//! changed, so repeating it with unchanged inputs issues nothing.

use std::collections::BTreeMap;

use chunkstream_cache::{ChunkKey, ChunkPriority, LayerId, SourceId};

use crate::error::VisibilityError;
use crate::intersect::visible_chunks;
use crate::layout::RenderLayer;
use crate::scale::select_scale_level;
use crate::transform::{DisplayDimensions, LayerTransform};
use crate::view::SliceViewport;
use crate::working_set::{diff, WorkingSet, WorkingSetDelta};

/// Outcome of the last visibility pass for one layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerVisibility {
    pub scale_index: usize,
    pub source: SourceId,
    pub display_dimensions: DisplayDimensions,
    pub visible: usize,
    pub prefetch: usize,
}

/// Working-set change of one layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerUpdate {
    pub layer: LayerId,
    pub delta: WorkingSetDelta,
}

#[derive(Debug)]
struct LayerEntry {
    layer: RenderLayer,
    working_set: WorkingSet,
    visibility: Option<LayerVisibility>,
    error: Option<VisibilityError>,
}

#[derive(Debug, Default)]
pub struct SliceView {
    viewport: Option<SliceViewport>,
    layers: BTreeMap<LayerId, LayerEntry>,
    generation: u64,
    computed_generation: u64,
}

impl SliceView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if inputs changed since the last `update`
    pub fn is_dirty(&self) -> bool {
        self.generation != self.computed_generation
    }

    pub fn viewport(&self) -> Option<&SliceViewport> {
        self.viewport.as_ref()
    }

    pub fn set_viewport(&mut self, viewport: SliceViewport) -> Result<(), VisibilityError> {
        viewport.validate()?;
        if self.viewport.as_ref() != Some(&viewport) {
            self.viewport = Some(viewport);
            self.generation += 1;
        }
        Ok(())
    }

    /// Add a layer, or replace one with the same id
    ///
    /// A replaced layer keeps its working set so the next update diffs
    /// against what it had requested.
    pub fn add_layer(&mut self, layer: RenderLayer) -> Result<(), VisibilityError> {
        if layer.scales().is_empty() {
            return Err(VisibilityError::NoScaleLevels { layer: layer.id });
        }
        let id = layer.id;
        match self.layers.get_mut(&id) {
            Some(entry) => entry.layer = layer,
            None => {
                self.layers.insert(
                    id,
                    LayerEntry {
                        layer,
                        working_set: WorkingSet::new(),
                        visibility: None,
                        error: None,
                    },
                );
            }
        }
        self.generation += 1;
        Ok(())
    }

    /// Remove a layer; the returned delta withdraws everything it requested
    pub fn remove_layer(&mut self, id: LayerId) -> Option<WorkingSetDelta> {
        let entry = self.layers.remove(&id)?;
        self.generation += 1;
        Some(WorkingSetDelta::removing_all(&entry.working_set))
    }

    pub fn set_layer_transform(&mut self, id: LayerId, transform: LayerTransform) -> Result<(), VisibilityError> {
        let entry = self
            .layers
            .get_mut(&id)
            .ok_or(VisibilityError::UnknownLayer(id))?;
        if entry.layer.transform != transform {
            entry.layer.transform = transform;
            self.generation += 1;
        }
        Ok(())
    }

    pub fn layer(&self, id: LayerId) -> Option<&RenderLayer> {
        self.layers.get(&id).map(|entry| &entry.layer)
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.layers.keys().copied()
    }

    pub fn working_set(&self, id: LayerId) -> Option<&WorkingSet> {
        self.layers.get(&id).map(|entry| &entry.working_set)
    }

    pub fn visibility(&self, id: LayerId) -> Option<&LayerVisibility> {
        self.layers.get(&id).and_then(|entry| entry.visibility.as_ref())
    }

    pub fn layer_error(&self, id: LayerId) -> Option<&VisibilityError> {
        self.layers.get(&id).and_then(|entry| entry.error.as_ref())
    }

    pub fn errors(&self) -> Vec<(LayerId, VisibilityError)> {
        self.layers
            .iter()
            .filter_map(|(id, entry)| entry.error.clone().map(|error| (*id, error)))
            .collect()
    }

    /// Recompute every layer's working set and return the changed ones
    ///
    /// A layer that cannot be mapped into display space records its error
    /// and drops its working set; other layers are unaffected.
    pub fn update(&mut self) -> Vec<LayerUpdate> {
        let Some(viewport) = self.viewport else {
            return Vec::new();
        };
        let mut updates = Vec::new();

        for (id, entry) in self.layers.iter_mut() {
            let (next, visibility, error) = match compute_working_set(&entry.layer, &viewport) {
                Ok((set, visibility)) => (set, Some(visibility), None),
                Err(error) => {
                    if entry.error.as_ref() != Some(&error) {
                        log::warn!("{}", error);
                    }
                    (WorkingSet::new(), None, Some(error))
                }
            };

            let delta = diff(&entry.working_set, &next);
            entry.working_set = next;
            entry.visibility = visibility;
            entry.error = error;
            if !delta.is_empty() {
                updates.push(LayerUpdate { layer: *id, delta });
            }
        }

        self.computed_generation = self.generation;
        updates
    }
}

fn compute_working_set(
    layer: &RenderLayer,
    viewport: &SliceViewport,
) -> Result<(WorkingSet, LayerVisibility), VisibilityError> {
    let inverse = layer
        .transform
        .inverse()
        .map_err(|reason| VisibilityError::InvalidTransform {
            layer: layer.id,
            reason,
        })?;
    let scale_index = select_scale_level(
        layer.scales(),
        &layer.transform,
        viewport.pixel_size,
        viewport.render_scale_target,
    )
    .ok_or(VisibilityError::NoScaleLevels { layer: layer.id })?;
    let scale = &layer.scales()[scale_index];

    let core = viewport.view_volume(0);
    let outer = viewport.view_volume(viewport.prefetch_margin_px);
    let has_margin = viewport.prefetch_margin_px > 0;

    let mut set = WorkingSet::new();
    let mut visible = 0;
    let mut prefetch = 0;
    for chunk in visible_chunks(&scale.layout, &layer.transform, &inverse, &outer) {
        let rank = (chunk.distance / viewport.pixel_size) as f32;
        let in_view = !has_margin || core.intersects_chunk(&scale.layout, &layer.transform, &chunk.position);
        let priority = if in_view {
            visible += 1;
            ChunkPriority::visible(rank)
        } else {
            prefetch += 1;
            ChunkPriority::prefetch(rank)
        };
        set.insert(ChunkKey::new(scale.source, chunk.position), priority);
    }

    let visibility = LayerVisibility {
        scale_index,
        source: scale.source,
        display_dimensions: DisplayDimensions::spanned_by(&layer.transform, scale.layout.volume_size),
        visible,
        prefetch,
    };
    Ok((set, visibility))
}
