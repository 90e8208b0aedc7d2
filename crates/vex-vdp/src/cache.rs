//! Lazy get-or-create caches for backend pipelines and samplers.
//!
//! Keys are structural-equality value types; cached objects are never evicted
//! during a session and are dropped only when the whole core is torn down.
//! Long sessions that cycle through many distinct states therefore grow the
//! maps without bound; the stats snapshot exposes the sizes so a host can
//! watch for that.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

use crate::error::GpuError;
use crate::hal::{
    BlendDesc, RenderPipelineDesc, TextureFormat, VertexAttributeDesc,
};
use crate::state::{PipelineKey, PixelFormat};

/// Map from a hashable descriptor key to a created backend object, with
/// hit/miss counters.
#[derive(Debug, Default)]
pub struct Cache<K, V> {
    map: HashMap<K, V>,
    hits: u64,
    misses: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Empties the cache, yielding the cached objects so the caller can
    /// dispose them through the backend.
    pub fn drain(&mut self) -> Vec<V> {
        self.map.drain().map(|(_, v)| v).collect()
    }

    /// Returns the cached object for `key`, creating it on a miss.
    ///
    /// Creation failure propagates: it indicates a host/backend defect, not
    /// guest misbehavior, and must not be swallowed.
    pub fn get_or_try_create<F>(&mut self, key: K, create: F) -> Result<&V, GpuError>
    where
        F: FnOnce() -> Result<V, GpuError>,
    {
        match self.map.entry(key) {
            Entry::Occupied(entry) => {
                self.hits += 1;
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                self.misses += 1;
                Ok(entry.insert(create()?))
            }
        }
    }
}

/// Backend texture format for a guest pixel format. `Nv12` has no backend
/// representation; allocation rejects it before this is ever consulted.
pub fn backend_format(format: PixelFormat) -> TextureFormat {
    match format {
        PixelFormat::Rgb565 => TextureFormat::Rgb565,
        PixelFormat::Rgba5551 => TextureFormat::Rgba5551,
        PixelFormat::Rgba8888 | PixelFormat::Nv12 => TextureFormat::Rgba8888,
        PixelFormat::Bc1 => TextureFormat::Bc1,
        PixelFormat::Bc3 => TextureFormat::Bc3,
    }
}

/// Synthesizes the full pipeline description for a cache key: target formats,
/// the vertex attribute layout from the 8 VU slots, and blend/depth/raster
/// state mapped field by field.
pub fn pipeline_desc(key: &PipelineKey) -> RenderPipelineDesc {
    let attributes: Vec<VertexAttributeDesc> = key
        .layout
        .enabled()
        .map(|(location, offset, format)| VertexAttributeDesc {
            location,
            offset,
            format,
        })
        .collect();

    RenderPipelineDesc {
        label: "vex.vdp.pipeline",
        color_format: backend_format(key.color_format),
        depth_format: TextureFormat::Depth32,
        topology: key.topology,
        depth_write: key.depth_write,
        depth_compare: key.depth_func,
        blend: BlendDesc {
            equation: key.blend_equation,
            src: key.blend_src,
            dst: key.blend_dst,
        },
        winding: key.winding,
        culling: key.culling,
        vertex_stride: key.stride,
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RenderState;
    use crate::vu::{VuElementFormat, VuLayoutSlot};

    #[test]
    fn cache_counts_hits_and_misses() {
        let mut cache: Cache<u32, u32> = Cache::new();
        let v = cache.get_or_try_create(7, || Ok(70)).unwrap();
        assert_eq!(*v, 70);
        let v = cache
            .get_or_try_create(7, || panic!("must be cached"))
            .unwrap();
        assert_eq!(*v, 70);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn creation_failure_propagates_and_caches_nothing() {
        let mut cache: Cache<u32, u32> = Cache::new();
        let err = cache
            .get_or_try_create(1, || Err(GpuError::CreationFailed("boom".into())))
            .unwrap_err();
        assert!(matches!(err, GpuError::CreationFailed(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn pipeline_desc_reflects_layout_slots() {
        let mut state = RenderState::default();
        state.layout.slots[3] = VuLayoutSlot {
            offset: 16,
            format: VuElementFormat::UByte4Norm,
        };
        state.stride = 20;
        let key = PipelineKey::from_state(&state, PixelFormat::Rgba8888);
        let desc = pipeline_desc(&key);

        assert_eq!(desc.vertex_stride, 20);
        assert_eq!(desc.attributes.len(), 2);
        assert_eq!(desc.attributes[1].location, 3);
        assert_eq!(desc.attributes[1].offset, 16);
        assert_eq!(desc.color_format, TextureFormat::Rgba8888);
        assert_eq!(desc.depth_format, TextureFormat::Depth32);
    }
}
