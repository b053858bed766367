// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical-device choice and logical device.
//!
//! STRICT ORDER:
//! 1) Create VkInstance (platform WSI extensions, debug utils in debug builds)
//! 2) Create VkSurfaceKHR from this instance
//! 3) Query physical devices and queue families against this surface
//! 4) Create VkDevice with one queue per distinct family
//!
//! Teardown is the exact reverse and happens in `Drop`; every object created
//! from the device (swapchain, registry contents) must be gone by then.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use cadence_render::QueueKind;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, info, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[cfg(debug_assertions)]
type DebugState = Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>;
#[cfg(not(debug_assertions))]
type DebugState = ();

/// Queue family indices, resolved once at device creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn get(&self, queue: QueueKind) -> u32 {
        match queue {
            QueueKind::Graphics => self.graphics,
            QueueKind::Present => self.present,
            QueueKind::Transfer => self.transfer,
        }
    }

    /// Distinct families, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut out = vec![self.graphics];
        for f in [self.present, self.transfer] {
            if !out.contains(&f) {
                out.push(f);
            }
        }
        out
    }
}

/// Picks queue families from the family list and per-family present support.
///
/// Graphics and present share a family when one can do both. Transfer prefers
/// a dedicated family without graphics and falls back to graphics.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> Option<QueueFamilies> {
    let supports = |i: usize, flag: vk::QueueFlags| {
        families[i].queue_count > 0 && families[i].queue_flags.contains(flag)
    };
    let presents = |i: usize| present_support.get(i).copied().unwrap_or(false);

    let (graphics, present) = match (0..families.len())
        .find(|&i| supports(i, vk::QueueFlags::GRAPHICS) && presents(i))
    {
        Some(i) => (i, i),
        None => (
            (0..families.len()).find(|&i| supports(i, vk::QueueFlags::GRAPHICS))?,
            (0..families.len()).find(|&i| presents(i))?,
        ),
    };
    let transfer = (0..families.len())
        .find(|&i| {
            supports(i, vk::QueueFlags::TRANSFER) && !supports(i, vk::QueueFlags::GRAPHICS)
        })
        .unwrap_or(graphics);

    Some(QueueFamilies {
        graphics: graphics as u32,
        present: present as u32,
        transfer: transfer as u32,
    })
}

/// Owns the Vulkan instance, surface and logical device.
///
/// Created first and dropped last: the application holds it exclusively and
/// every other GPU object borrows it.
pub struct DeviceContext {
    _entry: Entry,
    pub(crate) instance: Instance,
    debug: DebugState,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,

    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) memory: vk::PhysicalDeviceMemoryProperties,
    device_name: String,
    pub(crate) families: QueueFamilies,

    pub(crate) device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,
    pub(crate) swapchain_loader: swapchain::Device,
    /// Requested sizes of live host-visible buffer allocations.
    pub(crate) host_sizes: Mutex<HashMap<vk::DeviceMemory, u64>>,
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;

    // SAFETY: the loader passes a valid callback struct for the duration of the call.
    let msg = unsafe {
        match data.as_ref() {
            Some(d) if !d.p_message.is_null() => CStr::from_ptr(d.p_message).to_string_lossy(),
            _ => return vk::FALSE,
        }
    };
    if severity.contains(Sev::ERROR) {
        tracing::error!(?types, "[vulkan] {msg}");
    } else if severity.contains(Sev::WARNING) {
        warn!(?types, "[vulkan] {msg}");
    } else if severity.contains(Sev::INFO) {
        debug!(?types, "[vulkan] {msg}");
    } else {
        tracing::trace!(?types, "[vulkan] {msg}");
    }
    vk::FALSE
}

/// Whether `name` appears in an extension list returned by the loader.
fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available.iter().any(|e| {
        // SAFETY: extension_name is a NUL-terminated fixed array.
        (unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }) == name
    })
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
    enabled: bool,
) -> Result<DebugState> {
    if !enabled {
        return Ok(None);
    }
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }
        .context("create_debug_utils_messenger")?;
    Ok(Some((loader, messenger)))
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(
    _entry: &Entry,
    _instance: &Instance,
    _enabled: bool,
) -> Result<DebugState> {
    Ok(())
}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(dbg: &DebugState) {
    if let Some((loader, messenger)) = dbg {
        unsafe { loader.destroy_debug_utils_messenger(*messenger, None) };
    }
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_dbg: &DebugState) {}

unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    app_name: &str,
) -> Result<(Instance, bool)> {
    let app = CString::new(app_name).context("application name contains NUL")?;
    let engine = c"cadence";

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: engine.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let required = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?;
    #[allow(unused_mut)]
    let mut extensions = required.to_vec();

    // Validation and its messenger are debug-build conveniences; anything
    // missing only warns.
    #[cfg(debug_assertions)]
    let debug_utils = {
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }
            .context("enumerate_instance_extension_properties")?;
        let found = has_extension(&available, ext_debug::NAME);
        if found {
            extensions.push(ext_debug::NAME.as_ptr());
        } else {
            warn!("VK_EXT_debug_utils not available; validation output will not be logged");
        }
        found
    };
    #[cfg(not(debug_assertions))]
    let debug_utils = false;

    let mut layers: Vec<*const std::os::raw::c_char> = Vec::new();
    if cfg!(debug_assertions) {
        let available = unsafe { entry.enumerate_instance_layer_properties() }
            .context("enumerate_instance_layer_properties")?;
        let found = available.iter().any(|l| {
            // SAFETY: layer_name is a NUL-terminated fixed array.
            (unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }) == VALIDATION_LAYER
        });
        if found {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            warn!("validation layer not installed; continuing without it");
        }
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    let instance = unsafe { entry.create_instance(&create_info, None) }?;
    Ok((instance, debug_utils))
}

struct DeviceChoice {
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
    device_type: vk::PhysicalDeviceType,
    name: String,
}

unsafe fn has_swapchain_extension(instance: &Instance, phys: vk::PhysicalDevice) -> bool {
    let Ok(exts) = (unsafe { instance.enumerate_device_extension_properties(phys) }) else {
        return false;
    };
    has_extension(&exts, swapchain::NAME)
}

/// First device with graphics, present and swapchain support; discrete GPUs win.
unsafe fn pick_physical_device(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<DeviceChoice> {
    let mut best: Option<DeviceChoice> = None;
    for phys in unsafe { instance.enumerate_physical_devices() }
        .context("enumerate_physical_devices")?
    {
        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let present: Vec<bool> = (0..qprops.len() as u32)
            .map(|i| {
                unsafe { surf_i.get_physical_device_surface_support(phys, i, surface) }
                    .unwrap_or(false)
            })
            .collect();
        let Some(families) = select_queue_families(&qprops, &present) else {
            continue;
        };
        if !unsafe { has_swapchain_extension(instance, phys) } {
            continue;
        }
        let props = unsafe { instance.get_physical_device_properties(phys) };
        // SAFETY: device_name is a NUL-terminated fixed array.
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        debug!(device = %name, kind = ?props.device_type, "candidate device");
        let discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
        let replace = match &best {
            None => true,
            Some(b) => discrete && b.device_type != vk::PhysicalDeviceType::DISCRETE_GPU,
        };
        if replace {
            best = Some(DeviceChoice {
                phys,
                families,
                device_type: props.device_type,
                name,
            });
        }
    }
    best.ok_or_else(|| anyhow!("no physical device with graphics, present and swapchain support"))
}

unsafe fn create_logical_device(
    instance: &Instance,
    choice: &DeviceChoice,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = choice
        .families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let device_exts = [swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };
    Ok(unsafe { instance.create_device(choice.phys, &dinfo, None) }.context("create_device")?)
}

impl DeviceContext {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        app_name: &str,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::linked();
        // SAFETY: every handle below is created from the one before it and
        // destroyed in reverse on the error paths or in Drop.
        unsafe {
            let (instance, debug_utils) = create_instance(&entry, dh, app_name)
                .context("create_instance (WSI + debug extensions)")?;
            let debug = match create_debug_messenger(&entry, &instance, debug_utils) {
                Ok(d) => d,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };
            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
                Ok(s) => s,
                Err(e) => {
                    destroy_debug_messenger(&debug);
                    instance.destroy_instance(None);
                    bail!("ash_window::create_surface: {e}");
                }
            };

            let device = pick_physical_device(&instance, &surface_loader, surface).and_then(
                |choice| create_logical_device(&instance, &choice).map(|d| (choice, d)),
            );
            let (choice, device) = match device {
                Ok(v) => v,
                Err(e) => {
                    surface_loader.destroy_surface(surface, None);
                    destroy_debug_messenger(&debug);
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };

            let families = choice.families;
            let graphics_queue = device.get_device_queue(families.graphics, 0);
            let present_queue = device.get_device_queue(families.present, 0);
            let transfer_queue = device.get_device_queue(families.transfer, 0);
            let memory = instance.get_physical_device_memory_properties(choice.phys);
            let swapchain_loader = swapchain::Device::new(&instance, &device);
            let device_name = choice.name;

            info!(
                device = %device_name,
                graphics = families.graphics,
                present = families.present,
                transfer = families.transfer,
                "Vulkan device ready"
            );

            Ok(Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys: choice.phys,
                memory,
                device_name,
                families,
                device,
                graphics_queue,
                present_queue,
                transfer_queue,
                swapchain_loader,
                host_sizes: Mutex::new(HashMap::new()),
            })
        }
    }

    /// Raw device for command recording.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub(crate) fn queue(&self, queue: QueueKind) -> vk::Queue {
        match queue {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Present => self.present_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }
}

// STRICT TEARDOWN ORDER:
// - Frame slots drained and device idle (caller)
// - Swapchain targets, swapchain and registry flushed (caller)
// - Destroy device
// - Destroy surface AFTER device; messenger, then instance last.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        // SAFETY: the caller has destroyed every child object; see above.
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&self.debug);
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan device destroyed");
    }
}
