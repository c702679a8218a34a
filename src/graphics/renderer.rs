//! Window presentation on top of Vulkan
//!
//! [`SwapchainRenderer`] is the Vulkan [`PresentationSurface`]: it owns the
//! swapchain resource set, the particle pipeline and one command buffer per
//! frame slot, and translates the swapchain's staleness codes into
//! [`Acquire`]/[`PresentStatus`] values.

use crate::{
    config::AppConfig,
    error::CrateResult,
    gpu::{Acquire, DrawSubmission, Extent, PresentStatus, PresentationSurface},
    graphics::{
        device::VulkanContext,
        error::VkResultExt,
        pipeline::{load_spirv, ParticlePipeline},
        swapchain::SwapchainResources,
    },
    runners::ash::AshDevice,
};
use ash::vk;
use shared::{ViewportPush, CLEAR_COLOR, CLEAR_DEPTH};
use std::sync::Arc;
use tracing::{debug, info};
use winit::window::Window;

pub struct SwapchainRenderer {
    device: AshDevice,
    window: Arc<Window>,
    command_buffers: Vec<vk::CommandBuffer>,
    // Declared before the pipeline: framebuffers reference its render pass.
    swapchain: SwapchainResources,
    pipeline: ParticlePipeline,
    vertex_spirv: Vec<u32>,
    fragment_spirv: Vec<u32>,
}

impl SwapchainRenderer {
    pub fn new(device: &AshDevice, window: Arc<Window>, config: &AppConfig) -> CrateResult<Self> {
        let ctx = device.context();
        let vertex_spirv = load_spirv(&config.vertex_shader)?;
        let fragment_spirv = load_spirv(&config.fragment_shader)?;

        let mut swapchain =
            SwapchainResources::new(ctx, window_extent(&window), vk::SwapchainKHR::null())?;
        let pipeline = ParticlePipeline::new(
            ctx,
            swapchain.format(),
            swapchain.depth_format(),
            &vertex_spirv,
            &fragment_spirv,
        )?;
        swapchain.create_framebuffers(pipeline.render_pass())?;

        let command_buffers = unsafe {
            ctx.device().allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(ctx.command_pool())
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(config.frames_in_flight as u32),
            )
        }
        .context("vkAllocateCommandBuffers")?;

        Ok(Self {
            device: device.clone(),
            window,
            command_buffers,
            swapchain,
            pipeline,
            vertex_spirv,
            fragment_spirv,
        })
    }

    fn ctx(&self) -> &Arc<VulkanContext> {
        self.device.context()
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    fn record(&self, command_buffer: vk::CommandBuffer, submission: &DrawSubmission<AshDevice>) -> CrateResult<()> {
        let device = self.ctx().device();
        let extent = self.swapchain.extent();
        let framebuffer = self
            .swapchain
            .framebuffer(submission.image_index)
            .ok_or_else(|| {
                crate::error::ParticlesError::Other(format!(
                    "no framebuffer for swapchain image {}",
                    submission.image_index
                ))
            })?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: CLEAR_DEPTH,
                    stencil: 0,
                },
            },
        ];
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        let push = ViewportPush {
            size: [extent.width as f32, extent.height as f32],
        };

        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .context("vkResetCommandBuffer")?;
            device
                .begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default())
                .context("vkBeginCommandBuffer")?;

            device.cmd_begin_render_pass(
                command_buffer,
                &vk::RenderPassBeginInfo::default()
                    .render_pass(self.pipeline.render_pass())
                    .framebuffer(framebuffer)
                    .render_area(scissor)
                    .clear_values(&clear_values),
                vk::SubpassContents::INLINE,
            );
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline(),
            );
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[scissor]);
            device.cmd_push_constants(
                command_buffer,
                self.pipeline.layout(),
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&push),
            );
            if let Some(buffer) = submission.vertex_buffer {
                if submission.vertex_count > 0 {
                    device.cmd_bind_vertex_buffers(command_buffer, 0, &[buffer.buffer], &[0]);
                    device.cmd_draw(command_buffer, submission.vertex_count, 1, 0, 0);
                }
            }
            device.cmd_end_render_pass(command_buffer);

            device
                .end_command_buffer(command_buffer)
                .context("vkEndCommandBuffer")?;
        }
        Ok(())
    }
}

fn window_extent(window: &Window) -> Extent {
    let size = window.inner_size();
    Extent::new(size.width, size.height)
}

impl PresentationSurface for SwapchainRenderer {
    type Device = AshDevice;

    fn framebuffer_extent(&self) -> Extent {
        window_extent(&self.window)
    }

    fn acquire_next_image(&mut self, image_acquired: vk::Semaphore) -> CrateResult<Acquire> {
        let result = unsafe {
            self.ctx().swapchain_loader().acquire_next_image(
                self.swapchain.handle(),
                u64::MAX,
                image_acquired,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(Acquire::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(err) => Err(err).context("vkAcquireNextImageKHR"),
        }
    }

    fn record_and_submit(&mut self, submission: DrawSubmission<AshDevice>) -> CrateResult<()> {
        let command_buffer = *self.command_buffers.get(submission.slot).ok_or(
            crate::error::ParticlesError::SlotOutOfRange {
                slot: submission.slot,
                count: self.command_buffers.len(),
            },
        )?;
        self.record(command_buffer, &submission)?;

        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [submission.signal_semaphore];
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.ctx()
                .device()
                .queue_submit(self.ctx().graphics_queue(), &[submit], submission.fence)
        }
        .context("vkQueueSubmit")
    }

    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> CrateResult<PresentStatus> {
        let wait_semaphores = [render_finished];
        let swapchains = [self.swapchain.handle()];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let result = unsafe {
            self.ctx()
                .swapchain_loader()
                .queue_present(self.ctx().present_queue(), &info)
        };
        match result {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(err) => Err(err).context("vkQueuePresentKHR"),
        }
    }

    fn rebuild(&mut self) -> CrateResult<()> {
        let ctx = self.ctx().clone();
        let mut swapchain =
            SwapchainResources::new(&ctx, window_extent(&self.window), self.swapchain.handle())?;

        if swapchain.format() != self.pipeline.color_format() {
            info!(
                old = ?self.pipeline.color_format(),
                new = ?swapchain.format(),
                "surface format changed, recreating pipeline"
            );
            self.pipeline = ParticlePipeline::new(
                &ctx,
                swapchain.format(),
                swapchain.depth_format(),
                &self.vertex_spirv,
                &self.fragment_spirv,
            )?;
        }
        swapchain.create_framebuffers(self.pipeline.render_pass())?;

        // The retired swapchain and its dependents go away here.
        self.swapchain = swapchain;
        debug!(images = self.swapchain.image_count(), "swapchain resources rebuilt");
        Ok(())
    }
}

impl Drop for SwapchainRenderer {
    fn drop(&mut self) {
        let ctx = self.device.context();
        unsafe {
            if let Err(err) = ctx.device().device_wait_idle() {
                tracing::warn!("vkDeviceWaitIdle failed during teardown: {err:?}");
            }
            ctx.device()
                .free_command_buffers(ctx.command_pool(), &self.command_buffers);
        }
    }
}
