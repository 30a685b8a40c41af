//! Visibility and working-set engine
//!
//! Maps render layers into display space, picks a resolution level per
//! layer, finds the chunks the slice view touches and diffs the result
//! against the previous pass.

pub mod error;
pub mod intersect;
pub mod layout;
pub mod scale;
pub mod slice_view;
pub mod transform;
pub mod view;
pub mod working_set;

pub use error::VisibilityError;
pub use intersect::{visible_chunks, ViewVolume, VisibleChunk, MAX_VISIBLE_CHUNKS};
pub use layout::{ChunkLayout, RenderLayer, ScaleLevel};
pub use scale::select_scale_level;
pub use slice_view::{LayerUpdate, LayerVisibility, SliceView};
pub use transform::{DisplayDimensions, LayerTransform};
pub use view::SliceViewport;
pub use working_set::{diff, WorkingSet, WorkingSetDelta};
