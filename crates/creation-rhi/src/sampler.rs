//! Shared, reference-counted samplers.
//!
//! Samplers are deduplicated by description and handed out as
//! generation-checked handles. Each acquire bumps the reference count; the
//! Vulkan sampler is destroyed when the last user releases it.

use crate::error::{Result, RhiError};
use ash::vk;
use std::collections::HashMap;

/// Index into a [`HandleArena`], valid for one generation of its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

struct Entry<T> {
    value: Option<T>,
    generation: u32,
    refcount: u32,
}

/// Slot arena whose handles carry a generation and whose entries carry a refcount.
pub struct HandleArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` with a reference count of one.
    pub fn insert(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            entry.refcount = 1;
            return Handle {
                index,
                generation: entry.generation,
            };
        }

        let index = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.entries.push(Entry {
            value: Some(value),
            generation: 0,
            refcount: 1,
        });
        Handle {
            index,
            generation: 0,
        }
    }

    fn entry(&self, handle: Handle) -> Option<&Entry<T>> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation && e.value.is_some())
    }

    /// The value behind a live handle.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.entry(handle).and_then(|e| e.value.as_ref())
    }

    /// Current reference count; zero for dead handles.
    pub fn refcount(&self, handle: Handle) -> u32 {
        self.entry(handle).map_or(0, |e| e.refcount)
    }

    /// Add a user to a live handle.
    pub fn retain(&mut self, handle: Handle) -> bool {
        if self.entry(handle).is_none() {
            return false;
        }
        self.entries[handle.index as usize].refcount += 1;
        true
    }

    /// Drop a user. Returns the value once the last user is gone.
    ///
    /// The slot's generation is bumped so stale handles stop resolving.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        self.entry(handle)?;
        let entry = &mut self.entries[handle.index as usize];
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return None;
        }

        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        entry.value.take()
    }

    /// Remove every value regardless of reference counts.
    ///
    /// Slots are kept and their generations bumped, so handles issued before
    /// the drain never resolve to later inserts.
    pub fn drain(&mut self) -> Vec<T> {
        self.free.clear();
        let mut values = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(value) = entry.value.take() {
                entry.generation = entry.generation.wrapping_add(1);
                values.push(value);
            }
            entry.refcount = 0;
            self.free.push(u32::try_from(index).unwrap_or(u32::MAX));
        }
        values
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hashable sampler description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Anisotropy as `f32` bits; zero disables it.
    pub max_anisotropy_bits: u32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self::linear()
    }
}

impl SamplerDesc {
    /// Linear filtering, repeat addressing.
    pub const fn linear() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy_bits: 0,
        }
    }

    /// Nearest filtering, clamped addressing.
    pub const fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy_bits: 0,
        }
    }

    #[must_use]
    pub fn with_anisotropy(mut self, max_anisotropy: f32) -> Self {
        self.max_anisotropy_bits = max_anisotropy.max(0.0).to_bits();
        self
    }

    pub fn max_anisotropy(&self) -> f32 {
        f32::from_bits(self.max_anisotropy_bits)
    }

    fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        let anisotropy = self.max_anisotropy();
        vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(anisotropy > 1.0)
            .max_anisotropy(anisotropy.max(1.0))
            .max_lod(vk::LOD_CLAMP_NONE)
    }
}

/// Handle to a cached sampler.
pub type SamplerHandle = Handle;

/// Samplers shared by description.
///
/// Passed explicitly to whoever needs samplers; there is no global cache.
#[derive(Default)]
pub struct SamplerCache {
    arena: HandleArena<(SamplerDesc, vk::Sampler)>,
    by_desc: HashMap<SamplerDesc, SamplerHandle>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a sampler matching `desc`, creating it on first use.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn acquire(&mut self, device: &ash::Device, desc: SamplerDesc) -> Result<SamplerHandle> {
        if let Some(&handle) = self.by_desc.get(&desc) {
            if self.arena.retain(handle) {
                return Ok(handle);
            }
        }

        let sampler = unsafe { device.create_sampler(&desc.create_info(), None)? };
        let handle = self.arena.insert((desc, sampler));
        self.by_desc.insert(desc, handle);
        tracing::debug!("Created sampler {:?} for {:?}", handle, desc);
        Ok(handle)
    }

    /// Resolve a handle to its Vulkan sampler.
    pub fn get(&self, handle: SamplerHandle) -> Result<vk::Sampler> {
        self.arena
            .get(handle)
            .map(|&(_, sampler)| sampler)
            .ok_or_else(|| RhiError::InvalidState(format!("Stale sampler handle {handle:?}")))
    }

    /// Number of users of a sampler.
    pub fn users(&self, handle: SamplerHandle) -> u32 {
        self.arena.refcount(handle)
    }

    /// Drop one user; destroys the sampler when it was the last.
    ///
    /// # Safety
    /// The device must be valid and, if this is the last user, no GPU work may
    /// still use the sampler.
    pub unsafe fn release(&mut self, device: &ash::Device, handle: SamplerHandle) {
        if let Some((desc, sampler)) = self.arena.release(handle) {
            self.by_desc.remove(&desc);
            unsafe { device.destroy_sampler(sampler, None) };
        }
    }

    /// Destroy every sampler.
    ///
    /// # Safety
    /// The device must be valid and no GPU work may use any cached sampler.
    pub unsafe fn destroy_all(&mut self, device: &ash::Device) {
        for (_, sampler) in self.arena.drain() {
            unsafe { device.destroy_sampler(sampler, None) };
        }
        self.by_desc.clear();
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_tracks_users() {
        let mut arena = HandleArena::new();
        let handle = arena.insert("sampler");
        assert!(arena.retain(handle));
        assert_eq!(arena.refcount(handle), 2);

        assert_eq!(arena.release(handle), None);
        assert_eq!(arena.release(handle), Some("sampler"));
        assert_eq!(arena.refcount(handle), 0);
        assert!(arena.is_empty());
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut arena = HandleArena::new();
        let first = arena.insert(1);
        arena.release(first);

        let second = arena.insert(2);
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&2));
        assert!(!arena.retain(first));
        assert_eq!(arena.release(first), None);
    }

    #[test]
    fn drain_empties_arena() {
        let mut arena = HandleArena::new();
        arena.insert(1);
        let h = arena.insert(2);
        arena.retain(h);

        let mut drained = arena.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(arena.is_empty());
    }

    #[test]
    fn handles_from_before_a_drain_stay_dead() {
        let mut arena = HandleArena::new();
        let old = arena.insert("nearest");
        arena.drain();

        let new = arena.insert("linear");
        assert_eq!(new.index, old.index);
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.refcount(old), 0);
        assert_eq!(arena.release(old), None);
        assert_eq!(arena.get(new), Some(&"linear"));
    }

    #[test]
    fn descriptions_hash_by_anisotropy() {
        let plain = SamplerDesc::linear();
        let aniso = SamplerDesc::linear().with_anisotropy(16.0);
        assert_ne!(plain, aniso);
        assert!((aniso.max_anisotropy() - 16.0).abs() < f32::EPSILON);
        assert_eq!(SamplerDesc::default(), plain);
    }
}
