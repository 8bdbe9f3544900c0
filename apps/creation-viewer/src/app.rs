//! Viewer application.

use bytemuck::{Pod, Zeroable};
use creation_app::{App, AppContext, FrameContext, WindowEvent};
use creation_rhi::command::execute_single_time_commands;
use creation_rhi::vk;
use creation_rhi::{
    BindingGroupLayout, BindingPool, CommandPool, DescriptorSetLayoutBuilder, GpuBuffer,
    GpuImage, ImageTransition, MemoryLocation, PerSlot, ResourceKind, ResourceRef, SamplerCache,
    SamplerDesc, SamplerHandle,
};
use glam::{Vec2, Vec4};
use tracing::info;
use winit::event::ElementState;
use winit::keyboard::{Key, NamedKey};

/// Colors the clear color cycles through.
const PALETTE: [Vec4; 4] = [
    Vec4::new(0.05, 0.10, 0.25, 1.0),
    Vec4::new(0.30, 0.05, 0.30, 1.0),
    Vec4::new(0.35, 0.20, 0.05, 1.0),
    Vec4::new(0.05, 0.25, 0.15, 1.0),
];

/// Seconds spent blending from one palette entry to the next.
const SECONDS_PER_COLOR: f32 = 2.0;

/// Per-frame values written into the slot's uniform buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    tint: Vec4,
    resolution: Vec2,
    time: f32,
    frame: u32,
}

/// Palette color at `time`, blended linearly between neighbours.
fn palette_color(time: f32) -> Vec4 {
    let position = (time / SECONDS_PER_COLOR).rem_euclid(PALETTE.len() as f32);
    let index = position.floor() as usize % PALETTE.len();
    let next = (index + 1) % PALETTE.len();
    PALETTE[index].lerp(PALETTE[next], position.fract())
}

/// Viewer state.
pub struct Viewer {
    time: f32,
    paused: bool,
    upload_pool: CommandPool,
    layout: BindingGroupLayout,
    bindings: BindingPool,
    uniforms: PerSlot<GpuBuffer>,
    palette: GpuBuffer,
    white: GpuImage,
    white_view: vk::ImageView,
    samplers: SamplerCache,
    sampler: SamplerHandle,
}

impl Viewer {
    /// Create a 1x1 white texture in `SHADER_READ_ONLY_OPTIMAL`.
    fn create_white_texture(
        ctx: &AppContext,
        pool: &CommandPool,
    ) -> anyhow::Result<(GpuImage, vk::ImageView)> {
        let device = ctx.gpu.device();
        let format = vk::Format::R8G8B8A8_UNORM;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let white = ctx
            .gpu
            .allocator()
            .lock()
            .create_image(&image_info, MemoryLocation::GpuOnly, "white texture")?;

        let to_transfer = ImageTransition {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::CLEAR,
            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
        };
        let to_sampled = ImageTransition {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::CLEAR,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
        };
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);

        unsafe {
            execute_single_time_commands(device, pool, ctx.gpu.graphics_queue(), |device, cmd| {
                to_transfer.record(device, cmd, white.image);
                device.cmd_clear_color_image(
                    cmd,
                    white.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearColorValue {
                        float32: [1.0, 1.0, 1.0, 1.0],
                    },
                    &[range],
                );
                to_sampled.record(device, cmd, white.image);
            })?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(white.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(range);
        let view = unsafe { device.create_image_view(&view_info, None)? };

        Ok((white, view))
    }
}

impl App for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let device = ctx.gpu.device();
        let frames = ctx.frames_in_flight();

        let upload_pool = unsafe {
            CommandPool::new(
                device,
                ctx.gpu.queue_roles().graphics,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?
        };

        let layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
                .storage_buffer(1, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(2, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?
        };
        let bindings =
            unsafe { BindingPool::allocate_pool(device, frames, std::slice::from_ref(&layout))? };

        let uniforms = PerSlot::try_new(frames, |slot| {
            ctx.gpu.allocator().lock().create_buffer(
                std::mem::size_of::<FrameUniforms>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("frame uniforms {slot}"),
            )
        })?;

        let palette = ctx.gpu.allocator().lock().upload_buffer(
            &upload_pool,
            ctx.gpu.graphics_queue(),
            &PALETTE,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "palette",
        )?;

        let (white, white_view) = Self::create_white_texture(ctx, &upload_pool)?;

        let mut samplers = SamplerCache::new();
        let desc = SamplerDesc::linear().with_anisotropy(ctx.gpu.max_sampler_anisotropy());
        let sampler = unsafe { samplers.acquire(device, desc)? };

        info!(
            "Viewer initialized: {} frame slots, {}x{}",
            frames,
            ctx.extent().width,
            ctx.extent().height
        );

        Ok(Self {
            time: 0.0,
            paused: false,
            upload_pool,
            layout,
            bindings,
            uniforms,
            palette,
            white,
            white_view,
            samplers,
            sampler,
        })
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) {
        if !self.paused {
            self.time += dt;
        }
        ctx.set_clear_color(palette_color(self.time).to_array());
    }

    fn render(&mut self, frame: &FrameContext<'_>) -> anyhow::Result<()> {
        let slot = frame.slot();
        let extent = frame.extent();

        let uniforms = FrameUniforms {
            tint: palette_color(self.time),
            resolution: Vec2::new(extent.width as f32, extent.height as f32),
            time: self.time,
            frame: frame.frame_number as u32,
        };
        let buffer = self.uniforms.get(slot);
        buffer.write(&[uniforms])?;

        let resources = [
            ResourceRef {
                binding: 0,
                kind: ResourceKind::UniformBuffer {
                    buffer: buffer.buffer,
                    offset: 0,
                    range: buffer.size,
                },
            },
            ResourceRef {
                binding: 1,
                kind: ResourceKind::StorageBuffer {
                    buffer: self.palette.buffer,
                    offset: 0,
                    range: self.palette.size,
                },
            },
            ResourceRef {
                binding: 2,
                kind: ResourceKind::SampledImage {
                    view: self.white_view,
                    sampler: self.samplers.get(self.sampler)?,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            },
        ];
        unsafe {
            self.bindings
                .write_bindings(frame.device(), frame.ledger, slot, 0, &resources)?;
        }

        frame.scope.set_full_viewport();
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        // The device is idle after a rebuild, so every set can be reallocated.
        unsafe { self.bindings.rebuild(ctx.gpu.device())? };
        info!("Viewer resized to {}x{}", width, height);
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state == ElementState::Pressed
                && !event.repeat
                && event.logical_key == Key::Named(NamedKey::Space)
            {
                self.paused = !self.paused;
                info!("Animation {}", if self.paused { "paused" } else { "resumed" });
                return true;
            }
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let device = ctx.gpu.device();
        let mut allocator = ctx.gpu.allocator().lock();

        for buffer in self.uniforms.iter_mut() {
            if let Err(e) = allocator.free_buffer(buffer) {
                tracing::error!("Failed to free uniform buffer: {e}");
            }
        }
        if let Err(e) = allocator.free_buffer(&mut self.palette) {
            tracing::error!("Failed to free palette buffer: {e}");
        }

        unsafe {
            device.destroy_image_view(self.white_view, None);
        }
        if let Err(e) = allocator.free_image(&mut self.white) {
            tracing::error!("Failed to free white texture: {e}");
        }

        unsafe {
            self.samplers.release(device, self.sampler);
            self.samplers.destroy_all(device);
            self.bindings.destroy(device);
            self.layout.destroy(device);
            self.upload_pool.destroy(device);
        }

        info!("Viewer cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_starts_on_first_color() {
        assert_eq!(palette_color(0.0), PALETTE[0]);
    }

    #[test]
    fn palette_blends_halfway() {
        let mid = palette_color(SECONDS_PER_COLOR * 0.5);
        let expected = PALETTE[0].lerp(PALETTE[1], 0.5);
        assert!(mid.abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn palette_wraps_around() {
        let cycle = SECONDS_PER_COLOR * PALETTE.len() as f32;
        assert!(palette_color(cycle).abs_diff_eq(PALETTE[0], 1e-5));
        assert!(palette_color(-0.25).abs_diff_eq(palette_color(cycle - 0.25), 1e-4));
    }

    #[test]
    fn uniforms_have_no_padding() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 32);
    }
}
