use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    None,
    FactoryReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetKind {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProvisioningMode {
    Sta,
    Ap,
}

impl ProvisioningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sta => "STA",
            Self::Ap => "AP",
        }
    }
}

/// Durable hard-reboot accounting. `hard_count` only matters while `stable`
/// is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootState {
    pub hard_count: u8,
    pub stable: bool,
}

impl Default for BootState {
    fn default() -> Self {
        Self {
            hard_count: 0,
            stable: true,
        }
    }
}

/// Layout of the retained region. Zeroed (or garbage) after power loss.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetainedBootMemory {
    pub magic: u32,
    pub soft_boot_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TemperatureReport {
    pub hostname: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_f: Option<f32>,
}

impl TemperatureReport {
    pub fn new(hostname: &str, ip: String, temp_c: Option<f32>) -> Self {
        Self {
            hostname: hostname.to_string(),
            ip,
            ok: temp_c.is_some(),
            temp_c: temp_c.map(round_hundredths),
            temp_f: temp_c.map(|c| round_hundredths(celsius_to_fahrenheit(c))),
        }
    }
}

pub fn celsius_to_fahrenheit(temp_c: f32) -> f32 {
    temp_c * 9.0 / 5.0 + 32.0
}

fn round_hundredths(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}
