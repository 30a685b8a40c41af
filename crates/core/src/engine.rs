//! Streaming engine: slice view plus chunk manager
//!
//! Camera and layer changes only mark the view dirty. `tick` recomputes the
//! working sets at most once per quantum and turns each layer's delta into
//! chunk interest, then applies whatever the workers sent back.

use std::time::{Duration, Instant};

use chunkstream_cache::{AggregatedStatistics, CapacityConfig, ChunkKey, ChunkState, LayerId, ResidencyEvent};
use chunkstream_scheduler::{UpdateThrottle, WorkerPoolConfig, DEFAULT_QUANTUM};
use crossbeam_channel::Receiver;
use viewer_core::{
    LayerTransform, LayerVisibility, RenderLayer, ScaleLevel, SliceView, SliceViewport, VisibilityError,
};

use crate::chunk_manager::ChunkManager;
use crate::error::{EngineError, EngineResult};
use crate::source::SourceSpec;

/// Tuning of the streaming engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub capacity: CapacityConfig,
    pub workers: usize,
    pub poll_interval: Duration,
    /// Minimum time between two working-set recomputations
    pub recompute_quantum: Duration,
    pub render_scale_target: f64,
    pub prefetch_margin_px: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        Self {
            capacity: CapacityConfig::default(),
            workers: pool.num_workers,
            poll_interval: pool.poll_interval,
            recompute_quantum: DEFAULT_QUANTUM,
            render_scale_target: 1.0,
            prefetch_margin_px: 0,
        }
    }
}

impl EngineConfig {
    pub fn new(capacity: CapacityConfig) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_recompute_quantum(mut self, quantum: Duration) -> Self {
        self.recompute_quantum = quantum;
        self
    }

    pub fn with_render_scale_target(mut self, target: f64) -> Self {
        self.render_scale_target = target;
        self
    }

    pub fn with_prefetch_margin(mut self, margin_px: u32) -> Self {
        self.prefetch_margin_px = margin_px;
        self
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers).with_poll_interval(self.poll_interval)
    }

    /// Viewport carrying this configuration's render-scale target and margin
    pub fn viewport(&self, viewport: SliceViewport) -> SliceViewport {
        viewport
            .with_render_scale_target(self.render_scale_target)
            .with_prefetch_margin(self.prefetch_margin_px)
    }
}

/// What one `tick` did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recomputed: bool,
    pub layers_changed: usize,
    pub requested: usize,
    pub withdrawn: usize,
    pub reprioritized: usize,
    pub messages: usize,
}

pub struct StreamingEngine {
    manager: ChunkManager,
    view: SliceView,
    throttle: UpdateThrottle,
    config: EngineConfig,
}

impl StreamingEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.capacity.validate()?;
        let manager = ChunkManager::new(&config.capacity, config.pool_config())?;
        Ok(Self::with_manager(manager, config))
    }

    /// Engine driving an existing manager
    pub fn with_manager(manager: ChunkManager, config: EngineConfig) -> Self {
        Self {
            manager,
            view: SliceView::new(),
            throttle: UpdateThrottle::new(config.recompute_quantum),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    pub fn view(&self) -> &SliceView {
        &self.view
    }

    /// Add a layer with its scale levels, or replace the layer with this id
    pub fn add_layer(&mut self, layer: LayerId, transform: LayerTransform, scales: Vec<SourceSpec>) -> EngineResult<()> {
        if scales.is_empty() {
            return Err(VisibilityError::NoScaleLevels { layer }.into());
        }
        let handles = scales
            .into_iter()
            .map(|spec| self.manager.get_chunk_source(spec))
            .collect::<Result<Vec<_>, _>>()?;
        let levels = handles
            .iter()
            .map(|handle| ScaleLevel::new(handle.id(), *handle.layout()))
            .collect();

        self.view.add_layer(RenderLayer::new(layer, transform, levels))?;
        self.manager.add_visible_layer(layer, &handles, &transform)?;
        self.throttle.mark_dirty();
        log::debug!("added {} with {} scale levels", layer, handles.len());
        Ok(())
    }

    /// Remove a layer, withdrawing its interest in every chunk
    pub fn remove_layer(&mut self, layer: LayerId) -> EngineResult<()> {
        let delta = self.view.remove_layer(layer).ok_or(EngineError::UnknownLayer(layer))?;
        self.manager.apply_delta(layer, &delta);
        self.manager.remove_visible_layer(layer)?;
        self.throttle.mark_dirty();
        Ok(())
    }

    pub fn set_layer_transform(&mut self, layer: LayerId, transform: LayerTransform) -> EngineResult<()> {
        self.view.set_layer_transform(layer, transform)?;
        self.mark_if_dirty();
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: SliceViewport) -> EngineResult<()> {
        self.view.set_viewport(viewport)?;
        self.mark_if_dirty();
        Ok(())
    }

    fn mark_if_dirty(&mut self) {
        if self.view.is_dirty() {
            self.throttle.mark_dirty();
        }
    }

    /// Run one scheduler tick at time `now`
    pub fn tick(&mut self, now: Instant) -> EngineResult<TickReport> {
        let mut report = TickReport {
            messages: self.process()?,
            ..TickReport::default()
        };

        if self.throttle.poll(now) {
            report.recomputed = true;
            for update in self.view.update() {
                report.layers_changed += 1;
                report.requested += update.delta.added.len();
                report.withdrawn += update.delta.removed.len();
                report.reprioritized += update.delta.reprioritized.len();
                self.manager.apply_delta(update.layer, &update.delta);
            }
            log::trace!(
                "working-set pass {} changed {} layers",
                self.throttle.runs(),
                report.layers_changed
            );
            report.messages += self.process()?;
        }
        Ok(report)
    }

    fn process(&self) -> EngineResult<usize> {
        self.manager.process().map_err(|_| EngineError::Disconnected)
    }

    /// Time until the next recomputation may run, if one is pending
    pub fn next_recompute(&self, now: Instant) -> Option<Duration> {
        self.throttle
            .is_dirty()
            .then(|| self.throttle.time_until_ready(now))
    }

    /// True once no recomputation is pending and every working-set chunk
    /// is resident or has failed
    pub fn is_settled(&self) -> bool {
        if self.throttle.is_dirty() || self.view.is_dirty() {
            return false;
        }
        self.working_set_keys().into_iter().all(|key| {
            matches!(
                self.manager.chunk_state(key),
                Some(ChunkState::SystemMemory | ChunkState::GpuMemory | ChunkState::Failed)
            )
        })
    }

    /// Tick until settled or until `timeout` passes; returns whether it settled
    pub fn run_until_settled(&mut self, timeout: Duration) -> EngineResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.tick(now)?;
            if self.is_settled() {
                return Ok(true);
            }
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn working_set_keys(&self) -> Vec<ChunkKey> {
        self.view
            .layer_ids()
            .filter_map(|id| self.view.working_set(id))
            .flat_map(|set| set.keys().copied())
            .collect()
    }

    pub fn layer_visibility(&self, layer: LayerId) -> Option<&LayerVisibility> {
        self.view.visibility(layer)
    }

    /// Layers whose transform could not be used, with the reason
    pub fn layer_errors(&self) -> Vec<(LayerId, VisibilityError)> {
        self.view.errors()
    }

    pub fn chunk_state(&self, key: ChunkKey) -> Option<ChunkState> {
        self.manager.chunk_state(key)
    }

    pub fn statistics(&self) -> AggregatedStatistics {
        self.manager.statistics()
    }

    pub fn subscribe(&self) -> Receiver<ResidencyEvent> {
        self.manager.subscribe()
    }
}
