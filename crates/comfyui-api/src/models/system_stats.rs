use serde::{Deserialize, Serialize};

/// Struct representing the response of the ComfyUI API `system_stats` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SystemStats {
    /// Information about the host and server process.
    #[serde(default)]
    pub system: System,
    /// Compute devices available to the server.
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl SystemStats {
    /// The first reported device, usually the GPU doing the work.
    pub fn primary_device(&self) -> Option<&Device> {
        self.devices.first()
    }
}

/// Host information reported by the server.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct System {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub python_version: String,
    #[serde(default)]
    pub comfyui_version: Option<String>,
    #[serde(default)]
    pub ram_total: u64,
    #[serde(default)]
    pub ram_free: u64,
}

/// A compute device reported by the server.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Device {
    /// Device name, e.g. `cuda:0 NVIDIA GeForce RTX 4090 : cudaMallocAsync`.
    pub name: String,
    /// Device type, e.g. `cuda` or `cpu`.
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub index: Option<u32>,
    /// Total VRAM in bytes.
    #[serde(default)]
    pub vram_total: u64,
    /// Free VRAM in bytes.
    #[serde(default)]
    pub vram_free: u64,
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

impl Device {
    /// Total VRAM in GiB.
    pub fn vram_total_gib(&self) -> f64 {
        self.vram_total as f64 / GIB
    }

    /// Free VRAM in GiB.
    pub fn vram_free_gib(&self) -> f64 {
        self.vram_free as f64 / GIB
    }
}
