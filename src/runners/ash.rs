//! ash device implementation - direct Vulkan API via ash

use crate::{
    error::{CrateResult, ParticlesError},
    gpu::{BufferRole, GpuDevice, Timeout},
    graphics::{device::VulkanContext, error::VkResultExt},
};
use ash::vk;
use std::sync::Arc;

/// A buffer with its dedicated memory allocation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AshBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
}

/// [`GpuDevice`] on a real Vulkan device. Clones share the context.
#[derive(Clone)]
pub struct AshDevice {
    ctx: Arc<VulkanContext>,
}

impl AshDevice {
    pub fn new(ctx: Arc<VulkanContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.ctx
    }
}

/// Index of the first memory type allowed by `type_filter` that has all of
/// `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> CrateResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(ParticlesError::NoSuitableMemoryType)
}

fn usage_and_memory(role: BufferRole) -> (vk::BufferUsageFlags, vk::MemoryPropertyFlags) {
    match role {
        BufferRole::Staging => (
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ),
        BufferRole::Vertex => (
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
    }
}

impl GpuDevice for AshDevice {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type Buffer = AshBuffer;

    fn create_fence(&self, signaled: bool) -> CrateResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.ctx
                .device()
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .context("vkCreateFence")
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Timeout) -> CrateResult<bool> {
        match unsafe {
            self.ctx
                .device()
                .wait_for_fences(&[fence], true, timeout.as_nanos())
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err).context("vkWaitForFences"),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> CrateResult<()> {
        unsafe { self.ctx.device().reset_fences(&[fence]) }.context("vkResetFences")
    }

    fn fence_signaled(&self, fence: vk::Fence) -> CrateResult<bool> {
        unsafe { self.ctx.device().get_fence_status(fence) }.context("vkGetFenceStatus")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.ctx.device().destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> CrateResult<vk::Semaphore> {
        unsafe {
            self.ctx
                .device()
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .context("vkCreateSemaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.ctx.device().destroy_semaphore(semaphore, None) };
    }

    fn create_buffer(&self, size: u64, role: BufferRole) -> CrateResult<AshBuffer> {
        let device = self.ctx.device();
        let (usage, properties) = usage_and_memory(role);
        unsafe {
            let buffer = device
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(size)
                        .usage(usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    None,
                )
                .context("vkCreateBuffer")?;

            let requirements = device.get_buffer_memory_requirements(buffer);
            let memory = find_memory_type(
                self.ctx.memory_properties(),
                requirements.memory_type_bits,
                properties,
            )
            .and_then(|memory_type_index| {
                device
                    .allocate_memory(
                        &vk::MemoryAllocateInfo::default()
                            .allocation_size(requirements.size)
                            .memory_type_index(memory_type_index),
                        None,
                    )
                    .context("vkAllocateMemory")
            });
            let memory = match memory {
                Ok(memory) => memory,
                Err(err) => {
                    device.destroy_buffer(buffer, None);
                    return Err(err);
                }
            };

            if let Err(err) = device
                .bind_buffer_memory(buffer, memory, 0)
                .context("vkBindBufferMemory")
            {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
                return Err(err);
            }

            Ok(AshBuffer { buffer, memory })
        }
    }

    fn write_buffer(&self, buffer: AshBuffer, bytes: &[u8]) -> CrateResult<()> {
        let device = self.ctx.device();
        unsafe {
            let ptr = device
                .map_memory(
                    buffer.memory,
                    0,
                    bytes.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .context("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            device.unmap_memory(buffer.memory);
        }
        Ok(())
    }

    fn copy_buffer(&self, src: AshBuffer, dst: AshBuffer, size: u64) -> CrateResult<()> {
        self.ctx.one_shot(|device, command_buffer| unsafe {
            device.cmd_copy_buffer(
                command_buffer,
                src.buffer,
                dst.buffer,
                &[vk::BufferCopy::default().size(size)],
            );
        })
    }

    fn destroy_buffer(&self, buffer: AshBuffer) {
        unsafe {
            self.ctx.device().destroy_buffer(buffer.buffer, None);
            self.ctx.device().free_memory(buffer.memory, None);
        }
    }

    fn wait_idle(&self) -> CrateResult<()> {
        unsafe { self.ctx.device().device_wait_idle() }.context("vkDeviceWaitIdle")
    }

    fn device_name(&self) -> String {
        self.ctx.device_name().to_string()
    }
}
