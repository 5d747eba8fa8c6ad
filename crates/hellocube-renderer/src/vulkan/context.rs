//! Vulkan context: instance, surface, physical device, logical device and queues.

use ash::khr::{surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use log::{debug, error, info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use super::{device_error, APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::adapter::{self, AdapterInfo, AdapterKind, AdapterRequest};
use crate::error::{RenderError, Result};

/// Queue family indices of the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
    /// Transfer-only family, when the device exposes one.
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Family the copy queue runs on.
    pub fn copy(&self) -> u32 {
        self.transfer.unwrap_or(self.graphics)
    }

    /// Distinct families that touch shared buffers and swapchain images.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.present, self.copy()] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Physical device plus everything the probe learned about it.
struct Candidate {
    physical_device: vk::PhysicalDevice,
    info: AdapterInfo,
    families: Option<QueueFamilyIndices>,
    supported: bool,
}

/// Main Vulkan context holding all core Vulkan objects.
///
/// Shared through `Arc` by every object that owns device handles, so the
/// device outlives all of them.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub adapter: AdapterInfo,
    pub queue_families: QueueFamilyIndices,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub transfer_queue: Option<vk::Queue>,

    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,
    /// Presentation surface of the window the context was created for.
    pub surface: vk::SurfaceKHR,

    pub device_properties: vk::PhysicalDeviceProperties,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanContext {
    /// Create instance, surface and device for a window.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the context.
    pub unsafe fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        request: AdapterRequest,
        enable_validation: bool,
    ) -> Result<Self> {
        let entry = Entry::linked();

        let api_version = entry
            .try_enumerate_instance_version()
            .map_err(|e| device_error("Failed to enumerate instance version", e))?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(RenderError::DeviceCreation(format!(
                "Vulkan 1.3 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug) => Some(debug),
                Err(e) => {
                    warn!("Validation messages unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match ash_window::create_surface(&entry, &instance, display_handle, window_handle, None) {
            Ok(surface) => surface,
            Err(e) => {
                Self::destroy_instance(&instance, debug_utils.as_ref());
                return Err(device_error("Failed to create Vulkan surface", e));
            }
        };

        let selected = Self::pick_physical_device(&instance, &surface_loader, surface, request)
            .and_then(|(physical_device, info, families)| {
                let (device, graphics_queue, present_queue, transfer_queue) =
                    Self::create_logical_device(&instance, physical_device, &families)?;
                Ok((physical_device, info, families, device, graphics_queue, present_queue, transfer_queue))
            });
        let (physical_device, adapter, queue_families, device, graphics_queue, present_queue, transfer_queue) =
            match selected {
                Ok(selected) => selected,
                Err(e) => {
                    surface_loader.destroy_surface(surface, None);
                    Self::destroy_instance(&instance, debug_utils.as_ref());
                    return Err(e);
                }
            };

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let device_properties = instance.get_physical_device_properties(physical_device);

        info!(
            "Vulkan device ready: {} (graphics family {}, present family {}, copy family {})",
            adapter.name,
            queue_families.graphics,
            queue_families.present,
            queue_families.copy()
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            adapter,
            queue_families,
            graphics_queue,
            present_queue,
            transfer_queue,
            surface_loader,
            swapchain_loader,
            surface,
            device_properties,
            debug_utils,
        })
    }

    /// Create Vulkan instance with required extensions.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| device_error("Failed to get required extensions", e))?
            .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| device_error("Failed to create Vulkan instance", e))
    }

    /// Route validation messages to the log.
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| device_error("Failed to create debug messenger", e))?;

        Ok((debug_utils, messenger))
    }

    /// Enumerate adapters and hand them to the selection policy.
    unsafe fn pick_physical_device(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
        request: AdapterRequest,
    ) -> Result<(vk::PhysicalDevice, AdapterInfo, QueueFamilyIndices)> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|e| device_error("Failed to enumerate physical devices", e))?;

        if devices.is_empty() {
            return Err(RenderError::AdapterNotFound("No Vulkan-capable GPU found".into()));
        }

        let candidates: Vec<Candidate> = devices
            .iter()
            .enumerate()
            .map(|(index, &device)| Self::probe_device(instance, surface_loader, surface, index, device))
            .collect();
        for candidate in &candidates {
            debug!(
                "Adapter {}: {} ({:?}, {} MB){}",
                candidate.info.index,
                candidate.info.name,
                candidate.info.kind,
                candidate.info.dedicated_memory / (1024 * 1024),
                if candidate.supported { "" } else { " unsupported" }
            );
        }

        let infos: Vec<AdapterInfo> = candidates.iter().map(|c| c.info.clone()).collect();
        let chosen = adapter::select_adapter(&infos, request, |info| {
            candidates.get(info.index).is_some_and(|c| c.supported)
        })?;

        let candidate = &candidates[chosen.index];
        let families = candidate.families.ok_or_else(|| {
            RenderError::AdapterNotFound(format!("{} cannot present to this window", chosen.name))
        })?;
        Ok((candidate.physical_device, chosen, families))
    }

    /// Describe a physical device and check it can run the renderer:
    /// Vulkan 1.3, swapchain support, a family that can present, and the
    /// dynamic rendering, synchronization2 and timeline semaphore features.
    unsafe fn probe_device(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
        index: usize,
        device: vk::PhysicalDevice,
    ) -> Candidate {
        let props = instance.get_physical_device_properties(device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy().into_owned();

        let kind = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
            vk::PhysicalDeviceType::CPU => AdapterKind::Software,
            _ => AdapterKind::Other,
        };

        let memory_props = instance.get_physical_device_memory_properties(device);
        let dedicated_memory = memory_props.memory_heaps[..memory_props.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        let families = Self::find_queue_families(instance, device, surface_loader, surface);

        let has_swapchain = instance
            .enumerate_device_extension_properties(device)
            .map(|exts| {
                exts.iter()
                    .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME)
            })
            .unwrap_or(false);

        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features13)
            .push_next(&mut features12);
        instance.get_physical_device_features2(device, &mut features2);

        let supported = props.api_version >= REQUIRED_VK_VERSION
            && has_swapchain
            && families.is_some()
            && features13.dynamic_rendering == vk::TRUE
            && features13.synchronization2 == vk::TRUE
            && features12.timeline_semaphore == vk::TRUE;

        Candidate {
            physical_device: device,
            info: AdapterInfo { index, name, kind, dedicated_memory },
            families,
            supported,
        }
    }

    /// Graphics family, a family that can present (the graphics one when it
    /// can), and a transfer-only family if there is one.
    unsafe fn find_queue_families(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<QueueFamilyIndices> {
        let queue_families = instance.get_physical_device_queue_family_properties(device);

        let mut graphics = None;
        let mut present = None;
        let mut transfer = None;

        for (i, family) in queue_families.iter().enumerate() {
            let i = i as u32;
            let is_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let can_present = surface_loader
                .get_physical_device_surface_support(device, i, surface)
                .unwrap_or(false);

            if is_graphics && can_present && (graphics.is_none() || present != graphics) {
                graphics = Some(i);
                present = Some(i);
            } else {
                if is_graphics && graphics.is_none() {
                    graphics = Some(i);
                }
                if can_present && present.is_none() {
                    present = Some(i);
                }
            }

            if family.queue_flags.contains(vk::QueueFlags::TRANSFER) && !is_graphics && transfer.is_none() {
                transfer = Some(i);
            }
        }

        Some(QueueFamilyIndices {
            graphics: graphics?,
            present: present?,
            transfer,
        })
    }

    /// Create logical device with required features and extensions.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
    ) -> Result<(Device, vk::Queue, vk::Queue, Option<vk::Queue>)> {
        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<*const c_char> = vec![swapchain::NAME.as_ptr()];

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_13_features)
            .push_next(&mut vulkan_12_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| device_error("Failed to create logical device", e))?;

        let graphics_queue = device.get_device_queue(families.graphics, 0);
        let present_queue = device.get_device_queue(families.present, 0);
        let transfer_queue = families.transfer.map(|f| device.get_device_queue(f, 0));

        Ok((device, graphics_queue, present_queue, transfer_queue))
    }

    unsafe fn destroy_instance(
        instance: &Instance,
        debug_utils: Option<&(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    ) {
        if let Some((loader, messenger)) = debug_utils {
            loader.destroy_debug_utils_messenger(*messenger, None);
        }
        instance.destroy_instance(None);
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            Self::destroy_instance(&self.instance, self.debug_utils.as_ref());
        }
    }
}

/// Forwards validation messages to the log. Never affects control flow.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[VK] {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[VK] {}", message);
    } else {
        debug!("[VK] {}", message);
    }

    vk::FALSE
}
