//! Texture slot table and memory-budget accounting.
//!
//! Handles are indices into a sparse slot table; holes left by released
//! textures are reused before the table grows. The table owns the accounted
//! byte sizes; the backend objects themselves are owned by the façade, which
//! disposes them when a slot is released.

use crate::error::VdpError;
use crate::hal::TextureId;
use crate::state::PixelFormat;

/// Texture memory budget, emulating the console's fixed 8 MiB of VRAM.
pub const TEXTURE_MEMORY_BUDGET: u64 = 8 * 1024 * 1024;

/// Guest-visible texture handle. `-1` is the invalid sentinel returned by
/// failed allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub i32);

impl TextureHandle {
    pub const INVALID: Self = Self(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// One allocated texture or render texture.
#[derive(Clone, Copy, Debug)]
pub struct TextureSlot {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    /// Bytes charged against the budget (color + depth for render textures).
    pub size_bytes: u64,
    pub texture: TextureId,
    /// Paired depth buffer; present only for render textures.
    pub depth: Option<TextureId>,
}

impl TextureSlot {
    pub fn is_render_target(&self) -> bool {
        self.depth.is_some()
    }
}

/// Mip level count for a full chain down to 1x1, or 1 when not mipmapped.
pub fn mip_level_count(mipmap: bool, width: u32, height: u32) -> u32 {
    if !mipmap {
        return 1;
    }
    32 - width.max(height).max(1).leading_zeros()
}

/// Dimension of `base` at `level`, clamped to 1 at the tail.
pub fn mip_dim(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

/// Total byte size of a texture with the given mip chain.
pub fn texture_size_bytes(format: PixelFormat, width: u32, height: u32, mip_levels: u32) -> u64 {
    (0..mip_levels)
        .map(|level| format.level_size_bytes(mip_dim(width, level), mip_dim(height, level)))
        .sum()
}

/// Sparse slot table plus budget accounting.
#[derive(Debug)]
pub struct TextureTable {
    slots: Vec<Option<TextureSlot>>,
    used_bytes: u64,
    budget: u64,
}

impl TextureTable {
    pub fn new(budget: u64) -> Self {
        Self {
            slots: Vec::new(),
            used_bytes: 0,
            budget,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Validates an allocation request and returns `(mip_levels, size_bytes)`
    /// without mutating any state.
    pub fn validate_alloc(
        &self,
        mipmap: bool,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<(u32, u64), VdpError> {
        if width == 0 || height == 0 || !width.is_power_of_two() || !height.is_power_of_two() {
            return Err(VdpError::Unsupported(
                "texture dimensions must be powers of two",
            ));
        }
        if format == PixelFormat::Nv12 {
            return Err(VdpError::Unsupported("planar texture allocation"));
        }
        let mip_levels = mip_level_count(mipmap, width, height);
        let size = texture_size_bytes(format, width, height, mip_levels);
        self.check_budget(size)?;
        Ok((mip_levels, size))
    }

    pub fn check_budget(&self, size: u64) -> Result<(), VdpError> {
        if self.used_bytes + size > self.budget {
            return Err(VdpError::OutOfResource {
                requested: size,
                used: self.used_bytes,
                budget: self.budget,
            });
        }
        Ok(())
    }

    /// Stores a slot, charging its size. Holes are reused first.
    pub fn insert(&mut self, slot: TextureSlot) -> TextureHandle {
        self.used_bytes += slot.size_bytes;
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            self.slots[index] = Some(slot);
            return TextureHandle(index as i32);
        }
        self.slots.push(Some(slot));
        TextureHandle(self.slots.len() as i32 - 1)
    }

    pub fn get(&self, handle: TextureHandle) -> Option<&TextureSlot> {
        if !handle.is_valid() {
            return None;
        }
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    /// Empties a slot and refunds its size. Returns the removed slot so the
    /// caller can dispose the backend objects.
    pub fn take(&mut self, handle: TextureHandle) -> Option<TextureSlot> {
        if !handle.is_valid() {
            return None;
        }
        let slot = self.slots.get_mut(handle.0 as usize)?.take()?;
        self.used_bytes -= slot.size_bytes;
        Some(slot)
    }

    /// Drains every live slot (core teardown / guest VM reset).
    pub fn drain(&mut self) -> Vec<TextureSlot> {
        self.used_bytes = 0;
        self.slots.drain(..).flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(size: u64) -> TextureSlot {
        TextureSlot {
            format: PixelFormat::Rgba8888,
            width: 8,
            height: 8,
            mip_levels: 1,
            size_bytes: size,
            texture: TextureId(0),
            depth: None,
        }
    }

    #[test]
    fn mip_chain_counts() {
        assert_eq!(mip_level_count(false, 256, 256), 1);
        assert_eq!(mip_level_count(true, 256, 256), 9);
        assert_eq!(mip_level_count(true, 256, 64), 9);
        assert_eq!(mip_level_count(true, 1, 1), 1);
    }

    #[test]
    fn size_math_matches_closed_forms() {
        // 64x64 RGBA, no mips: 64*64*4.
        assert_eq!(
            texture_size_bytes(PixelFormat::Rgba8888, 64, 64, 1),
            16384
        );

        // 256x256 BC1 with a full 9-level chain: closed-form sum over the
        // halving dimensions, block footprint clamped at 1 block.
        let expected: u64 = (0..9)
            .map(|l| {
                let d = (256u64 >> l).max(1);
                d.div_ceil(4) * d.div_ceil(4) * 8
            })
            .sum();
        assert_eq!(
            texture_size_bytes(PixelFormat::Bc1, 256, 256, 9),
            expected
        );
    }

    #[test]
    fn holes_are_reused_before_append() {
        let mut table = TextureTable::new(TEXTURE_MEMORY_BUDGET);
        let a = table.insert(slot(16));
        let b = table.insert(slot(16));
        assert_eq!((a.0, b.0), (0, 1));

        table.take(a).unwrap();
        assert_eq!(table.used_bytes(), 16);

        let c = table.insert(slot(32));
        assert_eq!(c.0, 0);
        assert_eq!(table.used_bytes(), 48);

        let d = table.insert(slot(8));
        assert_eq!(d.0, 2);
    }

    #[test]
    fn budget_is_enforced_without_side_effects() {
        let table = TextureTable::new(1024);
        let err = table
            .validate_alloc(false, PixelFormat::Rgba8888, 32, 32)
            .unwrap_err();
        assert!(matches!(err, VdpError::OutOfResource { requested: 4096, .. }));

        let err = table
            .validate_alloc(false, PixelFormat::Rgba8888, 48, 32)
            .unwrap_err();
        assert!(matches!(err, VdpError::Unsupported(_)));

        let err = table
            .validate_alloc(false, PixelFormat::Nv12, 32, 32)
            .unwrap_err();
        assert!(matches!(err, VdpError::Unsupported(_)));
        assert_eq!(table.used_bytes(), 0);
    }

    #[test]
    fn invalid_handles_resolve_to_nothing() {
        let mut table = TextureTable::new(TEXTURE_MEMORY_BUDGET);
        assert!(table.get(TextureHandle::INVALID).is_none());
        assert!(table.get(TextureHandle(5)).is_none());
        assert!(table.take(TextureHandle(5)).is_none());
    }
}
