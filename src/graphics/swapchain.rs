//! Swapchain and everything sized to it
//!
//! [`SwapchainResources`] bundles the swapchain, its image views, the depth
//! buffer and the framebuffers. The set is only ever replaced as a whole.

use crate::{
    error::CrateResult,
    gpu::Extent,
    graphics::{device::VulkanContext, error::{GraphicsError, VkResultExt}},
    runners::ash::find_memory_type,
};
use ash::vk;
use std::sync::Arc;
use tracing::info;

const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// B8G8R8A8_SRGB / SRGB_NONLINEAR when offered, otherwise the first format
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> CrateResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| GraphicsError::NoSurfaceFormat.into())
}

/// MAILBOX when offered; FIFO is always available
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's fixed extent, or the window's clamped to the surface limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: Extent) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped at the maximum (0 means unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// First depth format the device can use as an optimal-tiling attachment
pub fn choose_depth_format(
    supports_depth_attachment: impl Fn(vk::Format) -> bool,
) -> CrateResult<vk::Format> {
    DEPTH_CANDIDATES
        .into_iter()
        .find(|format| supports_depth_attachment(*format))
        .ok_or_else(|| GraphicsError::NoDepthFormat.into())
}

pub fn find_depth_format(ctx: &VulkanContext) -> CrateResult<vk::Format> {
    choose_depth_format(|format| {
        let props = unsafe {
            ctx.instance()
                .get_physical_device_format_properties(ctx.physical_device(), format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

/// Depth image, its memory and view. Null handles are skipped by Vulkan's
/// destroy calls, so a partially built buffer can be dropped safely.
struct DepthBuffer {
    ctx: Arc<VulkanContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

impl DepthBuffer {
    fn new(ctx: &Arc<VulkanContext>, format: vk::Format, extent: vk::Extent2D) -> CrateResult<Self> {
        let device = ctx.device();
        let mut depth = Self {
            ctx: ctx.clone(),
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
        };
        unsafe {
            depth.image = device
                .create_image(
                    &vk::ImageCreateInfo::default()
                        .image_type(vk::ImageType::TYPE_2D)
                        .format(format)
                        .extent(vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        })
                        .mip_levels(1)
                        .array_layers(1)
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .tiling(vk::ImageTiling::OPTIMAL)
                        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE)
                        .initial_layout(vk::ImageLayout::UNDEFINED),
                    None,
                )
                .context("vkCreateImage")?;

            let requirements = device.get_image_memory_requirements(depth.image);
            let memory_type = find_memory_type(
                ctx.memory_properties(),
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            depth.memory = device
                .allocate_memory(
                    &vk::MemoryAllocateInfo::default()
                        .allocation_size(requirements.size)
                        .memory_type_index(memory_type),
                    None,
                )
                .context("vkAllocateMemory")?;
            device
                .bind_image_memory(depth.image, depth.memory, 0)
                .context("vkBindImageMemory")?;

            depth.view = create_view(device, depth.image, format, vk::ImageAspectFlags::DEPTH)?;
        }
        Ok(depth)
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> CrateResult<vk::ImageView> {
    unsafe {
        device.create_image_view(
            &vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(aspect)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                ),
            None,
        )
    }
    .context("vkCreateImageView")
}

pub struct SwapchainResources {
    ctx: Arc<VulkanContext>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    depth: Option<DepthBuffer>,
    depth_format: vk::Format,
    framebuffers: Vec<vk::Framebuffer>,
}

impl SwapchainResources {
    /// Create a swapchain, its views and a depth buffer for `window`.
    /// Framebuffers are added by [`create_framebuffers`](Self::create_framebuffers)
    /// once the render pass for the chosen format exists.
    ///
    /// `old_swapchain` is retired by the new one but not destroyed.
    pub fn new(
        ctx: &Arc<VulkanContext>,
        window: Extent,
        old_swapchain: vk::SwapchainKHR,
    ) -> CrateResult<Self> {
        let physical_device = ctx.physical_device();
        let caps = ctx.surface().capabilities(physical_device)?;
        let format = choose_surface_format(&ctx.surface().formats(physical_device)?)?;
        let present_mode = choose_present_mode(&ctx.surface().present_modes(physical_device)?);
        let extent = choose_extent(&caps, window);
        let image_count = choose_image_count(&caps);
        let depth_format = find_depth_format(ctx)?;

        let families = ctx.families();
        let family_indices = [families.graphics, families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface().handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);
        create_info = if families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let loader = ctx.swapchain_loader();
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("vkCreateSwapchainKHR")?;

        let mut resources = Self {
            ctx: ctx.clone(),
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format,
            extent,
            depth: None,
            depth_format,
            framebuffers: Vec::new(),
        };
        resources.images =
            unsafe { loader.get_swapchain_images(swapchain) }.context("vkGetSwapchainImagesKHR")?;
        for &image in &resources.images {
            let view = create_view(ctx.device(), image, format.format, vk::ImageAspectFlags::COLOR)?;
            resources.image_views.push(view);
        }
        resources.depth = Some(DepthBuffer::new(ctx, depth_format, extent)?);

        info!(
            width = extent.width,
            height = extent.height,
            images = resources.images.len(),
            format = ?format.format,
            ?present_mode,
            "created swapchain"
        );
        Ok(resources)
    }

    /// One framebuffer per swapchain image, sharing the depth buffer
    pub fn create_framebuffers(&mut self, render_pass: vk::RenderPass) -> CrateResult<()> {
        let device = self.ctx.device();
        let depth_view = self.depth.as_ref().map(|d| d.view).unwrap_or_default();
        for &view in &self.image_views {
            let attachments = [view, depth_view];
            let framebuffer = unsafe {
                device.create_framebuffer(
                    &vk::FramebufferCreateInfo::default()
                        .render_pass(render_pass)
                        .attachments(&attachments)
                        .width(self.extent.width)
                        .height(self.extent.height)
                        .layers(1),
                    None,
                )
            }
            .context("vkCreateFramebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }
}

impl Drop for SwapchainResources {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            self.depth = None;
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.ctx
                .swapchain_loader()
                .destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(current: u32, min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current,
                height: current,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let nonlinear = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, nonlinear),
            format(vk::Format::B8G8R8A8_SRGB, nonlinear),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn mailbox_else_fifo() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_surface_size_or_clamped_window() {
        assert_eq!(
            choose_extent(&caps(800, 2, 3), Extent::new(1, 1)),
            vk::Extent2D {
                width: 800,
                height: 800
            }
        );
        assert_eq!(
            choose_extent(&caps(u32::MAX, 2, 3), Extent::new(8000, 8)),
            vk::Extent2D {
                width: 4096,
                height: 16
            }
        );
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        assert_eq!(choose_image_count(&caps(1, 2, 0)), 3);
        assert_eq!(choose_image_count(&caps(1, 2, 8)), 3);
        assert_eq!(choose_image_count(&caps(1, 3, 3)), 3);
    }

    #[test]
    fn depth_format_in_preference_order() {
        assert_eq!(
            choose_depth_format(|_| true).unwrap(),
            vk::Format::D32_SFLOAT
        );
        assert_eq!(
            choose_depth_format(|f| f == vk::Format::D24_UNORM_S8_UINT).unwrap(),
            vk::Format::D24_UNORM_S8_UINT
        );
        assert!(choose_depth_format(|_| false).is_err());
    }
}
