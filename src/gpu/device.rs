// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters and select the best non-software one.
//   - Expose a `DeviceProfile` for simulating the limits of a smaller GPU
//     on a development machine.
//   - Report whether the adapter can linearly filter 32-bit float textures.
//     The kernel lookup relies on that; without it the shaders fall back to
//     `textureLoad` plus the same 8-bit-weight interpolation done in ALU.
//   - Provide `WorkgroupSize`, validated against the active profile, and the
//     sector dispatch geometry.
//
// ADAPTER SELECTION:
// `request_adapter` may pick llvmpipe when a real GPU is present. We
// enumerate explicitly and take, in order: discrete/integrated, then
// virtual/other, then whatever is left. The adapter name is logged so it is
// obvious which one ran.
//
// DEVICE LIMITS:
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every texture and dispatch against the requested
// limits, so a kernel table that would not fit on the smaller target is
// rejected on the development machine.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on`: runs an async fn to completion on the current
//   thread. wgpu's adapter/device API is async because on WebGPU it maps to
//   JS Promises; natively we just block.
// - `#[from]` on a foreign error type: `thiserror` generates both the
//   `From` impl used by `?` and `source()`.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Hardware profile controlling requested device limits and the default
/// workgroup size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// The adapter's default limits.
    Native,
    /// `wgpu::Limits::downlevel_defaults()`: 2048² surfaces, 256³ volumes,
    /// 256 invocations per workgroup. Catches oversized kernel tables early.
    Downlevel,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Downlevel => write!(f, "Downlevel (simulated limits)"),
        }
    }
}

/// 1D workgroup size for the convolution passes.
///
/// One workgroup handles one sector; its invocations stride over the
/// sector's samples. Must be a power of two within the profile's
/// invocation limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub invocations: u32,
}

impl WorkgroupSize {
    /// - `Native`: 128, i.e. four 32-wide warps or two 64-wide wavefronts.
    /// - `Downlevel`: 64, a single wavefront on every current vendor.
    fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { invocations: 128 },
            DeviceProfile::Downlevel => WorkgroupSize { invocations: 64 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invocations", self.invocations)
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The core GPU context: device, queue, capabilities and active profile.
///
/// Expensive to create. Operators share one through an `Arc`.
///
/// # Field drop order
/// Fields drop top to bottom. `_instance` is declared last so the
/// `wgpu::Instance` outlives `device` and `queue`; some Vulkan layers crash
/// when the instance goes first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// `FLOAT32_FILTERABLE` was granted: R32Float textures can be sampled
    /// with a linear sampler.
    pub hardware_filtering: bool,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// First suitable adapter with `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let all_adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        for a in &all_adapters {
            let info = a.get_info();
            debug!(name = %info.name, backend = ?info.backend, kind = ?info.device_type, "adapter found");
        }

        // Tier 1: real hardware. Tier 2: virtual / other. Tier 3: anything.
        let rank = |t: wgpu::DeviceType| match t {
            wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu => 0,
            wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => 1,
            wgpu::DeviceType::Cpu => 2,
        };
        let adapter = all_adapters
            .into_iter()
            .min_by_key(|a| rank(a.get_info().device_type))
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        if raw_info.device_type == wgpu::DeviceType::Cpu {
            warn!(name = %raw_info.name, "only a software adapter is available");
        }
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let hardware_filtering = adapter.features().contains(wgpu::Features::FLOAT32_FILTERABLE);
        let required_features = if hardware_filtering {
            wgpu::Features::FLOAT32_FILTERABLE
        } else {
            wgpu::Features::empty()
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tex-nufft"),
                    required_features,
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        info!(
            adapter = %adapter_info,
            %profile,
            hardware_filtering,
            workgroup = workgroup_size.invocations,
            "gpu device ready"
        );

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            hardware_filtering,
            _instance: instance,
        })
    }

    /// Override the default workgroup size.
    pub fn set_workgroup_size(&mut self, invocations: u32) -> Result<(), GpuError> {
        self.workgroup_size = validate_workgroup_size(self.profile, invocations)?;
        Ok(())
    }

    /// Largest 2D texture edge the device accepts.
    pub fn max_texture_2d(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    /// Largest 3D texture edge the device accepts.
    pub fn max_texture_3d(&self) -> u32 {
        self.device.limits().max_texture_dimension_3d
    }

    pub fn max_storage_binding(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }

    /// Workgroup grid `(x, y)` covering `n_sectors`, one workgroup each.
    pub fn dispatch_sectors(&self, n_sectors: u32) -> (u32, u32) {
        dispatch_sectors(n_sectors, self.device.limits().max_compute_workgroups_per_dimension)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {}, filtering: {} }}",
            self.adapter_info,
            self.profile,
            self.workgroup_size,
            if self.hardware_filtering { "hardware" } else { "software" }
        )
    }
}

// ============================================================
// Limits helpers
// ============================================================

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::Downlevel => wgpu::Limits::downlevel_defaults(),
    }
}

fn validate_workgroup_size(profile: DeviceProfile, invocations: u32) -> Result<WorkgroupSize, GpuError> {
    if invocations == 0 || !invocations.is_power_of_two() {
        return Err(GpuError::WorkgroupNotPowerOfTwo(invocations));
    }
    let limits = limits_for_profile(profile);
    let max = limits
        .max_compute_invocations_per_workgroup
        .min(limits.max_compute_workgroup_size_x);
    if invocations > max {
        return Err(GpuError::WorkgroupTooLarge { total: invocations, max });
    }
    Ok(WorkgroupSize { invocations })
}

/// Split `n` workgroups over x and y so neither exceeds `max_per_dim`.
/// The shader recovers the sector as `y * x_count + x` and skips the tail.
fn dispatch_sectors(n: u32, max_per_dim: u32) -> (u32, u32) {
    if n == 0 {
        return (0, 0);
    }
    let x = n.min(max_per_dim);
    (x, n.div_ceil(x))
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialisation and configuration.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found")]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    #[error("workgroup size must be a non-zero power of two (got {0})")]
    WorkgroupNotPowerOfTwo(u32),
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_workgroup_size_for_profiles() {
        assert_eq!(WorkgroupSize::for_profile(DeviceProfile::Native).invocations, 128);
        let low = WorkgroupSize::for_profile(DeviceProfile::Downlevel);
        assert!(low.invocations <= limits_for_profile(DeviceProfile::Downlevel).max_compute_invocations_per_workgroup);
    }

    #[test]
    fn test_validate_workgroup_size() {
        assert_eq!(
            validate_workgroup_size(DeviceProfile::Downlevel, 256).unwrap(),
            WorkgroupSize { invocations: 256 }
        );
        assert!(matches!(
            validate_workgroup_size(DeviceProfile::Downlevel, 512),
            Err(GpuError::WorkgroupTooLarge { total: 512, max: 256 })
        ));
        assert!(matches!(
            validate_workgroup_size(DeviceProfile::Native, 96),
            Err(GpuError::WorkgroupNotPowerOfTwo(96))
        ));
        assert!(validate_workgroup_size(DeviceProfile::Native, 0).is_err());
    }

    #[test]
    fn test_dispatch_sectors_split() {
        assert_eq!(dispatch_sectors(0, 65535), (0, 0));
        assert_eq!(dispatch_sectors(100, 65535), (100, 1));
        assert_eq!(dispatch_sectors(65535, 65535), (65535, 1));
        assert_eq!(dispatch_sectors(70000, 65535), (65535, 2));
        let (x, y) = dispatch_sectors(1_000_000, 65535);
        assert!(x * y >= 1_000_000 && x * (y - 1) < 1_000_000);
    }

    #[test]
    fn test_downlevel_limits_cap_textures() {
        let limits = limits_for_profile(DeviceProfile::Downlevel);
        assert_eq!(limits.max_texture_dimension_2d, 2048);
        assert_eq!(limits.max_texture_dimension_3d, 256);
        assert_eq!(limits_for_profile(DeviceProfile::Native), wgpu::Limits::default());
    }

    // ---- GPU integration tests (subprocess isolation) -------------------------
    //
    // Some Vulkan layers crash during process exit once a device has been
    // created. Each GPU test therefore runs in a child `cargo test` process:
    // the child prints "GPU_TEST_OK" after its assertions pass and the parent
    // checks for that token instead of the exit code.

    /// Run one `#[ignore]`d inner test in a fresh process and return its
    /// combined output.
    pub(crate) fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_device_init_native() {
        let gpu = GpuDevice::new().expect("should initialise a GPU device");
        println!("{gpu}");
        assert!(gpu.max_texture_2d() >= 2048);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_device_init_downlevel() {
        let mut gpu = GpuDevice::new_with_profile(DeviceProfile::Downlevel)
            .expect("downlevel profile should work on any adapter");
        assert_eq!(gpu.workgroup_size, WorkgroupSize { invocations: 64 });
        assert_eq!(gpu.max_texture_3d(), 256);
        gpu.set_workgroup_size(256).unwrap();
        assert!(gpu.set_workgroup_size(512).is_err());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_device_init_native() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_gpu_device_init_native");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_device_init_downlevel() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_gpu_device_init_downlevel");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
