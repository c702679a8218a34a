//! Instance, surface and device setup
//!
//! [`VulkanContext`] owns everything that lives as long as the window: the
//! instance (with its optional debug messenger), the surface, the logical
//! device with its queues, and the command pool. Each of these is wrapped in
//! a guard that destroys it on drop, so a failure half way through
//! [`VulkanContext::new`] releases exactly what was created.

use crate::{
    error::{CrateResult, ParticlesError},
    graphics::{
        debug::{DebugMessenger, VALIDATION_LAYER},
        error::{GraphicsError, VkResultExt},
    },
};
use ash::{
    khr::{surface, swapchain},
    vk, Device, Entry, Instance,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::c_char;
use tracing::{debug, info, warn};

/// Graphics and present queue family indices of a physical device
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Choose families from `(flags, can_present)` per family. A single
    /// family doing both is preferred over a split pair.
    pub fn pick(families: &[(vk::QueueFlags, bool)]) -> Option<Self> {
        let has_graphics = |flags: &vk::QueueFlags| flags.contains(vk::QueueFlags::GRAPHICS);
        if let Some(both) = families
            .iter()
            .position(|(flags, present)| has_graphics(flags) && *present)
        {
            return Some(Self {
                graphics: both as u32,
                present: both as u32,
            });
        }
        let graphics = families.iter().position(|(flags, _)| has_graphics(flags))?;
        let present = families.iter().position(|(_, present)| *present)?;
        Some(Self {
            graphics: graphics as u32,
            present: present as u32,
        })
    }

    /// Query `physical_device` for queue families able to render to and
    /// present on `surface`.
    ///
    /// This is the only place queue families are looked up; device
    /// selection, device creation and swapchain sharing all use its result.
    pub fn find(
        instance: &Instance,
        surface: &SurfaceHandle,
        physical_device: vk::PhysicalDevice,
    ) -> CrateResult<Option<Self>> {
        let properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let families = properties
            .iter()
            .enumerate()
            .map(|(index, family)| {
                let present = surface.supports_present(physical_device, index as u32)?;
                Ok((family.queue_flags, present))
            })
            .collect::<CrateResult<Vec<_>>>()?;
        Ok(Self::pick(&families))
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Lower is better: discrete, integrated, virtual, then CPU
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        _ => 4,
    }
}

struct InstanceGuard {
    entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // The messenger must go before the instance it was created from.
        self.debug = None;
        unsafe { self.instance.destroy_instance(None) };
    }
}

/// A window surface together with its extension loader
pub struct SurfaceHandle {
    loader: surface::Instance,
    surface: vk::SurfaceKHR,
}

impl SurfaceHandle {
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> CrateResult<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.surface)
        }
        .context("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    pub fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> CrateResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }
        .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> CrateResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }
        .context("vkGetPhysicalDeviceSurfaceFormatsKHR")
    }

    pub fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> CrateResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }
        .context("vkGetPhysicalDeviceSurfacePresentModesKHR")
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

struct DeviceGuard(Device);

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        unsafe { self.0.destroy_device(None) };
    }
}

/// Everything Vulkan that outlives the swapchain
pub struct VulkanContext {
    command_pool: vk::CommandPool,
    swapchain_loader: swapchain::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    families: QueueFamilies,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_name: String,
    // Drop order matters: device, then surface, then instance.
    device: DeviceGuard,
    surface: SurfaceHandle,
    instance: InstanceGuard,
}

impl VulkanContext {
    pub fn new<W>(window: &W, app_name: &str, enable_validation: bool) -> CrateResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display_handle = window
            .display_handle()
            .map_err(GraphicsError::from)?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(GraphicsError::from)?
            .as_raw();

        let instance = create_instance(display_handle, app_name, enable_validation)?;

        let surface = SurfaceHandle {
            loader: surface::Instance::new(&instance.entry, &instance.instance),
            surface: unsafe {
                ash_window::create_surface(
                    &instance.entry,
                    &instance.instance,
                    display_handle,
                    window_handle,
                    None,
                )
            }
            .context("vkCreateSurfaceKHR")?,
        };

        let (physical_device, families) = select_physical_device(&instance.instance, &surface)?;
        let properties =
            unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "Unknown GPU".to_string());
        info!(
            "Selected device: {device_name} (type: {:?})",
            properties.device_type
        );
        debug!(?families, "queue families");

        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        let device = DeviceGuard(create_logical_device(
            &instance.instance,
            physical_device,
            families,
        )?);
        let graphics_queue = unsafe { device.0.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.0.get_device_queue(families.present, 0) };
        let swapchain_loader = swapchain::Device::new(&instance.instance, &device.0);

        let command_pool = unsafe {
            device.0.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(families.graphics),
                None,
            )
        }
        .context("vkCreateCommandPool")?;

        Ok(Self {
            command_pool,
            swapchain_loader,
            graphics_queue,
            present_queue,
            families,
            physical_device,
            memory_properties,
            device_name,
            device,
            surface,
            instance,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device.0
    }

    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    pub fn surface(&self) -> &SurfaceHandle {
        &self.surface
    }

    pub fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Record a command buffer with `record`, submit it to the graphics
    /// queue and wait for the queue to go idle.
    pub fn one_shot(&self, record: impl FnOnce(&Device, vk::CommandBuffer)) -> CrateResult<()> {
        let device = self.device();
        let command_buffer = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }
        .context("vkAllocateCommandBuffers")?[0];

        let result = unsafe {
            device
                .begin_command_buffer(
                    command_buffer,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .context("vkBeginCommandBuffer")
                .and_then(|()| {
                    record(device, command_buffer);
                    device
                        .end_command_buffer(command_buffer)
                        .context("vkEndCommandBuffer")
                })
                .and_then(|()| {
                    device
                        .queue_submit(
                            self.graphics_queue,
                            &[vk::SubmitInfo::default().command_buffers(&[command_buffer])],
                            vk::Fence::null(),
                        )
                        .context("vkQueueSubmit")
                })
                .and_then(|()| {
                    device
                        .queue_wait_idle(self.graphics_queue)
                        .context("vkQueueWaitIdle")
                })
        };

        unsafe { device.free_command_buffers(self.command_pool, &[command_buffer]) };
        result
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.0.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed during teardown: {err:?}");
            }
            self.device.0.destroy_command_pool(self.command_pool, None);
        }
    }
}

fn create_instance(
    display_handle: raw_window_handle::RawDisplayHandle,
    app_name: &str,
    enable_validation: bool,
) -> CrateResult<InstanceGuard> {
    let entry = unsafe { Entry::load() }.map_err(GraphicsError::from)?;

    let validation = enable_validation && {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }
            .context("vkEnumerateInstanceLayerProperties")?;
        let found = layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        if !found {
            warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
        }
        found
    };

    let mut extension_names: Vec<*const c_char> =
        ash_window::enumerate_required_extensions(display_handle)
            .context("vkEnumerateInstanceExtensionProperties")?
            .to_vec();
    if validation {
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layer_names: Vec<*const c_char> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    #[allow(unused_mut)] // Only modified on macOS
    let mut create_flags = vk::InstanceCreateFlags::empty();
    #[cfg(target_os = "macos")]
    {
        extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let app_name = std::ffi::CString::new(app_name)
        .map_err(|e| ParticlesError::Other(e.to_string()))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"bouncing-particles")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_2);

    let instance = unsafe {
        entry.create_instance(
            &vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extension_names)
                .enabled_layer_names(&layer_names)
                .flags(create_flags),
            None,
        )
    }
    .context("vkCreateInstance")?;

    let mut guard = InstanceGuard {
        entry,
        instance,
        debug: None,
    };
    if validation {
        guard.debug = Some(DebugMessenger::new(&guard.entry, &guard.instance)?);
        info!("Vulkan validation enabled");
    }
    Ok(guard)
}

fn supports_swapchain(instance: &Instance, physical_device: vk::PhysicalDevice) -> CrateResult<bool> {
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .context("vkEnumerateDeviceExtensionProperties")?;
    Ok(extensions
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(swapchain::NAME)))
}

/// Pick the best device that can render to and present on `surface`
fn select_physical_device(
    instance: &Instance,
    surface: &SurfaceHandle,
) -> CrateResult<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .context("vkEnumeratePhysicalDevices")?;
    if devices.is_empty() {
        return Err(ParticlesError::NoVulkanDevice(0));
    }

    let mut candidates = Vec::new();
    for physical_device in devices {
        if !supports_swapchain(instance, physical_device)? {
            continue;
        }
        let Some(families) = QueueFamilies::find(instance, surface, physical_device)? else {
            continue;
        };
        if surface.formats(physical_device)?.is_empty()
            || surface.present_modes(physical_device)?.is_empty()
        {
            continue;
        }
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        candidates.push((device_type_rank(properties.device_type), physical_device, families));
    }

    candidates
        .into_iter()
        .min_by_key(|(rank, ..)| *rank)
        .map(|(_, physical_device, families)| (physical_device, families))
        .ok_or_else(|| GraphicsError::NoSuitableDevice.into())
}

fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
) -> CrateResult<Device> {
    let queue_priorities = [1.0];
    let queue_infos: Vec<_> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    #[allow(unused_mut)] // Only modified on macOS
    let mut extension_names = vec![swapchain::NAME.as_ptr()];
    #[cfg(target_os = "macos")]
    extension_names.push(ash::khr::portability_subset::NAME.as_ptr());

    let features = vk::PhysicalDeviceFeatures::default();
    unsafe {
        instance.create_device(
            physical_device,
            &vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&extension_names)
                .enabled_features(&features),
            None,
        )
    }
    .context("vkCreateDevice")
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPHICS: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const COMPUTE: vk::QueueFlags = vk::QueueFlags::COMPUTE;

    #[test]
    fn prefers_one_family_for_both() {
        let families = [(GRAPHICS, false), (COMPUTE, true), (GRAPHICS | COMPUTE, true)];
        assert_eq!(
            QueueFamilies::pick(&families),
            Some(QueueFamilies {
                graphics: 2,
                present: 2
            })
        );
    }

    #[test]
    fn falls_back_to_split_families() {
        let families = [(GRAPHICS, false), (COMPUTE, true)];
        let picked = QueueFamilies::pick(&families).unwrap();
        assert_eq!((picked.graphics, picked.present), (0, 1));
        assert!(!picked.is_shared());
        assert_eq!(picked.unique(), vec![0, 1]);
    }

    #[test]
    fn no_graphics_or_no_present_means_unusable() {
        assert_eq!(QueueFamilies::pick(&[(COMPUTE, true)]), None);
        assert_eq!(QueueFamilies::pick(&[(GRAPHICS, false)]), None);
        assert_eq!(QueueFamilies::pick(&[]), None);
    }

    #[test]
    fn discrete_gpus_rank_first() {
        let mut types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
        ];
        types.sort_by_key(|t| device_type_rank(*t));
        assert_eq!(types[0], vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(types[3], vk::PhysicalDeviceType::CPU);
    }
}
