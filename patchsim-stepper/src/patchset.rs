//! Grid construction: lays out one `EntityInstance` per cell over a
//! rectangular extent, in row-major order, with deterministic ids.

use std::sync::Arc;

use fxhash::FxHashMap;
use patchsim_core::entity::{EntityAllocator, EntityId, EntityInstance, EntityType};
use patchsim_core::geometry::Geometry;

/// The rectangular region a `PatchSet` tiles.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Extent {
    pub low: (f64, f64),
    pub high: (f64, f64),
}

/// A row/column coordinate in the patch grid.
pub type PatchCoord = (i64, i64);

/// The fixed grid of patch entities a `Stepper` fans its per-substep work
/// out over. Built once before a run starts; patches themselves are spawned
/// and freed like any other entity, but the grid's shape never re-tiles
/// mid-run.
pub struct PatchSet {
    pub extent: Extent,
    pub cell_size: f64,
    pub width: usize,
    pub height: usize,
    patches: Vec<Arc<EntityInstance>>,
    coord_of: FxHashMap<EntityId, PatchCoord>,
}

impl PatchSet {
    /// Lays out `patch_type` over `extent` at `cell_size` resolution,
    /// row-major, assigning each patch a `Cell` geometry and a deterministic
    /// id `row * width + col`.
    pub fn build(
        extent: Extent,
        cell_size: f64,
        patch_type: Arc<EntityType>,
        allocator: &EntityAllocator,
    ) -> PatchSet {
        let width = (((extent.high.0 - extent.low.0) / cell_size).ceil().max(0.0)) as usize;
        let height = (((extent.high.1 - extent.low.1) / cell_size).ceil().max(0.0)) as usize;

        let mut local = allocator.local();
        let mut patches = Vec::with_capacity(width * height);
        let mut coord_of = FxHashMap::default();

        for row in 0..height {
            for col in 0..width {
                let low = (extent.low.0 + col as f64 * cell_size, extent.low.1 + row as f64 * cell_size);
                let high = (low.0 + cell_size, low.1 + cell_size);
                let id = local.create();
                let instance = EntityInstance::new(id, patch_type.clone(), None, None, Some(Geometry::Cell { low, high }));
                coord_of.insert(id, (row as i64, col as i64));
                patches.push(instance);
            }
        }

        PatchSet { extent, cell_size, width, height, patches, coord_of }
    }

    pub fn patches(&self) -> &[Arc<EntityInstance>] {
        &self.patches
    }

    pub fn coord_of(&self, id: EntityId) -> Option<PatchCoord> {
        self.coord_of.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Sequential iteration, always available regardless of the `par-iter`
    /// feature; `par_iter` below is the fan-out path the stepper actually
    /// drives a run with.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityInstance>> {
        self.patches.iter()
    }

    #[cfg(feature = "par-iter")]
    pub fn par_iter(&self) -> impl rayon::prelude::ParallelIterator<Item = &Arc<EntityInstance>> {
        use rayon::prelude::*;
        self.patches.par_iter()
    }
}
