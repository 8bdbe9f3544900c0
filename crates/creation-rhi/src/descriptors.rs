//! Descriptor set management.
//!
//! Sets are allocated once per (frame slot, binding group) from a pool sized
//! at startup. The pool never grows and sets are never freed individually.
//! Rewriting a slot's set is only allowed once the slot's fence has signaled.

use crate::error::{Result, RhiError};
use crate::sync::SlotLedger;
use ash::vk;
use std::collections::BTreeMap;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    /// Create a new builder.
    pub const fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Build the layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<BindingGroupLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };

        Ok(BindingGroupLayout {
            layout,
            bindings: self
                .bindings
                .iter()
                .map(|b| (b.binding, b.descriptor_type, b.descriptor_count))
                .collect(),
        })
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// A descriptor set layout and the bindings it was built from.
#[derive(Debug, Clone)]
pub struct BindingGroupLayout {
    pub layout: vk::DescriptorSetLayout,
    /// `(binding, type, count)` per binding.
    pub bindings: Vec<(u32, vk::DescriptorType, u32)>,
}

impl BindingGroupLayout {
    /// Destroy the layout.
    ///
    /// # Safety
    /// No pipeline layout or pool allocation may still use it.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_set_layout(self.layout, None) };
    }
}

/// Pool sizes for `max_frames` copies of every layout.
pub fn pool_sizes(layouts: &[BindingGroupLayout], max_frames: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut totals: BTreeMap<i32, u32> = BTreeMap::new();
    for layout in layouts {
        for &(_, ty, count) in &layout.bindings {
            *totals.entry(ty.as_raw()).or_default() += count * max_frames;
        }
    }

    totals
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

/// Fixed set budget of a descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBudget {
    capacity: u32,
    allocated: u32,
}

impl PoolBudget {
    /// Budget for `max_frames * group_count` sets.
    pub fn new(max_frames: u32, group_count: u32) -> Self {
        Self {
            capacity: max_frames.saturating_mul(group_count),
            allocated: 0,
        }
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub const fn available(&self) -> u32 {
        self.capacity - self.allocated
    }

    /// Reserve `count` sets, failing once the pool would overflow.
    pub fn reserve(&mut self, count: u32) -> Result<()> {
        if count > self.available() {
            return Err(RhiError::PoolExhausted {
                capacity: self.capacity,
                available: self.available(),
                requested: count,
            });
        }
        self.allocated += count;
        Ok(())
    }

    /// Return every set to the budget.
    pub fn reset(&mut self) {
        self.allocated = 0;
    }
}

/// A resource bound at one binding of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRef {
    pub binding: u32,
    pub kind: ResourceKind,
}

/// The resource behind a [`ResourceRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    UniformBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    SampledImage {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
}

impl ResourceKind {
    pub const fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            Self::SampledImage { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// Fail if a slot-owned set cannot be rewritten yet.
///
/// A debug build panics, since writing an in-flight set is a defect.
pub fn check_slot_reusable(ledger: &SlotLedger, slot: usize) -> Result<()> {
    let reusable = ledger.is_reusable(slot);
    debug_assert!(
        reusable,
        "descriptor set of slot {slot} written while the slot is in flight"
    );
    if reusable {
        Ok(())
    } else {
        Err(RhiError::SlotInUse(slot))
    }
}

/// Fail unless `resources` fills every binding of `bindings` exactly once.
///
/// Several refs to the same binding fill consecutive array elements, so a
/// binding of count N takes N refs. Writes never leave a binding from an
/// earlier frame behind.
pub fn check_full_overwrite(
    bindings: &[(u32, vk::DescriptorType, u32)],
    resources: &[ResourceRef],
) -> Result<()> {
    let mut filled: BTreeMap<u32, u32> = BTreeMap::new();

    for r in resources {
        let Some(&(_, ty, _)) = bindings.iter().find(|(b, _, _)| *b == r.binding) else {
            return Err(RhiError::InvalidState(format!(
                "Binding {} is not part of the layout",
                r.binding
            )));
        };
        if ty != r.kind.descriptor_type() {
            return Err(RhiError::InvalidState(format!(
                "Binding {} expects {:?}, got {:?}",
                r.binding,
                ty,
                r.kind.descriptor_type()
            )));
        }
        *filled.entry(r.binding).or_default() += 1;
    }

    for &(binding, _, count) in bindings {
        let got = filled.get(&binding).copied().unwrap_or(0);
        if got != count {
            return Err(RhiError::InvalidState(format!(
                "Binding {binding} needs {count} resource(s), got {got}"
            )));
        }
    }
    Ok(())
}

/// Per (frame slot, binding group) descriptor sets from one fixed pool.
pub struct BindingPool {
    pool: vk::DescriptorPool,
    budget: PoolBudget,
    layouts: Vec<vk::DescriptorSetLayout>,
    group_bindings: Vec<Vec<(u32, vk::DescriptorType, u32)>>,
    sets: Vec<vk::DescriptorSet>,
    max_frames: usize,
}

impl BindingPool {
    /// Size the pool for `max_frames` copies of every layout and allocate all sets.
    ///
    /// # Safety
    /// The device and layouts must be valid.
    pub unsafe fn allocate_pool(
        device: &ash::Device,
        max_frames: usize,
        layouts: &[BindingGroupLayout],
    ) -> Result<Self> {
        let frames = u32::try_from(max_frames)
            .map_err(|_| RhiError::InvalidState("Too many frames in flight".to_string()))?;
        let groups = u32::try_from(layouts.len())
            .map_err(|_| RhiError::InvalidState("Too many binding groups".to_string()))?;

        let budget = PoolBudget::new(frames, groups);
        let sizes = pool_sizes(layouts, frames);

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(budget.capacity().max(1))
            .pool_sizes(&sizes);
        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };

        let mut binding_pool = Self {
            pool,
            budget,
            layouts: layouts.iter().map(|l| l.layout).collect(),
            group_bindings: layouts.iter().map(|l| l.bindings.clone()).collect(),
            sets: Vec::new(),
            max_frames,
        };

        if let Err(e) = unsafe { binding_pool.allocate_all(device) } {
            unsafe { binding_pool.destroy(device) };
            return Err(e);
        }

        tracing::debug!(
            "Binding pool: {} slots x {} groups = {} sets",
            max_frames,
            layouts.len(),
            binding_pool.sets.len()
        );
        Ok(binding_pool)
    }

    unsafe fn allocate_all(&mut self, device: &ash::Device) -> Result<()> {
        let per_slot = u32::try_from(self.layouts.len())
            .map_err(|_| RhiError::InvalidState("Too many binding groups".to_string()))?;
        let mut sets = Vec::with_capacity(self.max_frames * self.layouts.len());

        for _ in 0..self.max_frames {
            self.budget.reserve(per_slot)?;
            if self.layouts.is_empty() {
                continue;
            }
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.pool)
                .set_layouts(&self.layouts);
            let allocated = unsafe { device.allocate_descriptor_sets(&alloc_info) }.map_err(
                |e| match e {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                        RhiError::PoolExhausted {
                            capacity: self.budget.capacity(),
                            available: self.budget.available(),
                            requested: per_slot,
                        }
                    }
                    other => RhiError::Vulkan(other),
                },
            )?;
            sets.extend(allocated);
        }

        self.sets = sets;
        Ok(())
    }

    pub fn frames(&self) -> usize {
        self.max_frames
    }

    pub fn group_count(&self) -> usize {
        self.layouts.len()
    }

    pub const fn budget(&self) -> &PoolBudget {
        &self.budget
    }

    /// The set of `group` owned by `slot`.
    pub fn set(&self, slot: usize, group: usize) -> vk::DescriptorSet {
        self.sets[slot * self.layouts.len() + group]
    }

    /// Overwrite every binding of the (`slot`, `group`) set.
    ///
    /// `resources` must cover the group's layout exactly, see
    /// [`check_full_overwrite`].
    ///
    /// # Safety
    /// The device and every referenced resource must be valid.
    pub unsafe fn write_bindings(
        &self,
        device: &ash::Device,
        ledger: &SlotLedger,
        slot: usize,
        group: usize,
        resources: &[ResourceRef],
    ) -> Result<()> {
        check_slot_reusable(ledger, slot)?;
        let bindings = self.group_bindings.get(group).ok_or_else(|| {
            RhiError::InvalidState(format!("Binding group {group} does not exist"))
        })?;
        check_full_overwrite(bindings, resources)?;
        let dst_set = self.set(slot, group);

        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = resources
            .iter()
            .map(|r| match r.kind {
                ResourceKind::UniformBuffer {
                    buffer,
                    offset,
                    range,
                }
                | ResourceKind::StorageBuffer {
                    buffer,
                    offset,
                    range,
                } => [vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range)],
                _ => [vk::DescriptorBufferInfo::default()],
            })
            .collect();
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = resources
            .iter()
            .map(|r| match r.kind {
                ResourceKind::SampledImage {
                    view,
                    sampler,
                    layout,
                } => [vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .sampler(sampler)
                    .image_layout(layout)],
                ResourceKind::StorageImage { view, layout } => {
                    [vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(layout)]
                }
                _ => [vk::DescriptorImageInfo::default()],
            })
            .collect();

        let mut next_element: BTreeMap<u32, u32> = BTreeMap::new();
        let writes: Vec<vk::WriteDescriptorSet> = resources
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let element = next_element.entry(r.binding).or_default();
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(dst_set)
                    .dst_binding(r.binding)
                    .dst_array_element(*element)
                    .descriptor_type(r.kind.descriptor_type());
                *element += 1;
                match r.kind {
                    ResourceKind::UniformBuffer { .. } | ResourceKind::StorageBuffer { .. } => {
                        write.buffer_info(&buffer_infos[i])
                    }
                    ResourceKind::SampledImage { .. } | ResourceKind::StorageImage { .. } => {
                        write.image_info(&image_infos[i])
                    }
                }
            })
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    /// Free every set and allocate them again from the same pool.
    ///
    /// Used when the resources the sets reference were rebuilt.
    ///
    /// # Safety
    /// No set may be in use by the GPU.
    pub unsafe fn rebuild(&mut self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        self.sets.clear();
        self.budget.reset();
        unsafe { self.allocate_all(device) }
    }

    /// Destroy the pool and with it every set.
    ///
    /// # Safety
    /// No set may be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
        self.sets.clear();
    }
}

/// One copy of a resource per frame slot.
#[derive(Debug, Clone)]
pub struct PerSlot<T> {
    items: Vec<T>,
}

impl<T> PerSlot<T> {
    /// Build `frames` copies with `make(slot)`.
    pub fn try_new<F>(frames: usize, make: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<T>,
    {
        Ok(Self {
            items: (0..frames).map(make).collect::<Result<_>>()?,
        })
    }

    pub fn get(&self, slot: usize) -> &T {
        &self.items[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut T {
        &mut self.items[slot]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Take every copy out, e.g. for teardown.
    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(bindings: Vec<(u32, vk::DescriptorType, u32)>) -> BindingGroupLayout {
        BindingGroupLayout {
            layout: vk::DescriptorSetLayout::null(),
            bindings,
        }
    }

    #[test]
    fn pool_is_sized_by_frames_and_groups() {
        let layouts = [
            layout(vec![
                (0, vk::DescriptorType::UNIFORM_BUFFER, 1),
                (1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
            ]),
            layout(vec![(0, vk::DescriptorType::UNIFORM_BUFFER, 1)]),
        ];

        let sizes = pool_sizes(&layouts, 3);
        let count = |ty| {
            sizes
                .iter()
                .find(|s| s.ty == ty)
                .map(|s| s.descriptor_count)
        };
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), Some(6));
        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), Some(6));
        assert_eq!(sizes.len(), 2);
        assert_eq!(PoolBudget::new(3, 2).capacity(), 6);
    }

    #[test]
    fn budget_refuses_to_grow() {
        let mut budget = PoolBudget::new(2, 2);
        budget.reserve(2).unwrap();
        budget.reserve(2).unwrap();

        match budget.reserve(1) {
            Err(RhiError::PoolExhausted {
                capacity,
                available,
                requested,
            }) => {
                assert_eq!((capacity, available, requested), (4, 0, 1));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }

        budget.reset();
        assert_eq!(budget.available(), 4);
    }

    #[test]
    fn waited_slot_is_writable() {
        let mut ledger = SlotLedger::new(2);
        assert!(check_slot_reusable(&ledger, 0).is_ok());

        ledger.waited(1);
        assert!(check_slot_reusable(&ledger, 1).is_ok());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "written while the slot is in flight"))]
    fn writing_in_flight_slot_is_flagged() {
        let mut ledger = SlotLedger::new(2);
        ledger.waited(0);
        ledger.armed(0);
        ledger.submitted(0);

        assert!(matches!(
            check_slot_reusable(&ledger, 0),
            Err(RhiError::SlotInUse(0))
        ));
    }

    fn uniform(binding: u32) -> ResourceRef {
        ResourceRef {
            binding,
            kind: ResourceKind::UniformBuffer {
                buffer: vk::Buffer::null(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        }
    }

    fn sampled(binding: u32) -> ResourceRef {
        ResourceRef {
            binding,
            kind: ResourceKind::SampledImage {
                view: vk::ImageView::null(),
                sampler: vk::Sampler::null(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        }
    }

    fn viewer_bindings() -> Vec<(u32, vk::DescriptorType, u32)> {
        vec![
            (0, vk::DescriptorType::UNIFORM_BUFFER, 1),
            (1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
        ]
    }

    #[test]
    fn complete_write_is_accepted() {
        let resources = [uniform(0), sampled(1), sampled(1)];
        assert!(check_full_overwrite(&viewer_bindings(), &resources).is_ok());
    }

    #[test]
    fn partial_write_is_rejected() {
        let missing_binding = [uniform(0)];
        assert!(matches!(
            check_full_overwrite(&viewer_bindings(), &missing_binding),
            Err(RhiError::InvalidState(_))
        ));

        let missing_element = [uniform(0), sampled(1)];
        assert!(check_full_overwrite(&viewer_bindings(), &missing_element).is_err());
    }

    #[test]
    fn duplicate_or_foreign_bindings_are_rejected() {
        let duplicate = [uniform(0), uniform(0), sampled(1), sampled(1)];
        assert!(check_full_overwrite(&viewer_bindings(), &duplicate).is_err());

        let foreign = [uniform(0), sampled(1), sampled(1), uniform(7)];
        assert!(check_full_overwrite(&viewer_bindings(), &foreign).is_err());
    }

    #[test]
    fn wrong_descriptor_type_is_rejected() {
        let resources = [sampled(0), sampled(1), sampled(1)];
        assert!(matches!(
            check_full_overwrite(&viewer_bindings(), &resources),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn resource_kinds_map_to_descriptor_types() {
        let sampled = ResourceKind::SampledImage {
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        assert_eq!(
            sampled.descriptor_type(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        let storage = ResourceKind::StorageBuffer {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        assert_eq!(storage.descriptor_type(), vk::DescriptorType::STORAGE_BUFFER);
    }

    #[test]
    fn per_slot_builds_one_copy_per_frame() {
        let copies = PerSlot::try_new(3, |slot| Ok(slot * 10)).unwrap();
        assert_eq!(copies.len(), 3);
        assert_eq!(*copies.get(2), 20);

        let failed = PerSlot::<u32>::try_new(3, |_| Err(RhiError::InvalidState("x".into())));
        assert!(failed.is_err());
    }
}
