use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Sentinel written to retained memory on every hard boot. Its presence on a
/// later startup proves the region survived, i.e. the reset was warm.
pub const RETAINED_MAGIC: u32 = 0xB007_B007;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    pub stable_after_ms: u64,
    pub hard_boots_to_force_factory_reset: u8,
    pub namespace: String,
    pub key_hard_count: String,
    pub key_stable: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            stable_after_ms: 10_000,
            hard_boots_to_force_factory_reset: 3,
            namespace: "boot".to_string(),
            key_hard_count: "hc".to_string(),
            key_stable: "stable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub hostname: String,
    pub ap_ssid: String,
    pub ap_password: String,
    pub ap_ip: Ipv4Addr,
    pub ap_gateway: Ipv4Addr,
    pub ap_netmask: Ipv4Addr,
    pub sta_connect_timeout_ms: u64,
    pub join_poll_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub dns_port: u16,
    pub namespace: String,
    pub key_ssid: String,
    pub key_pass: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            hostname: "esp32-solar".to_string(),
            ap_ssid: "ESP32-SOLAR-SETUP".to_string(),
            ap_password: "configureme".to_string(),
            ap_ip: Ipv4Addr::new(172, 16, 0, 1),
            ap_gateway: Ipv4Addr::new(172, 16, 0, 1),
            ap_netmask: Ipv4Addr::new(255, 255, 255, 0),
            sta_connect_timeout_ms: 15_000,
            join_poll_interval_ms: 250,
            restart_delay_ms: 600,
            dns_port: 53,
            namespace: "wifi".to_string(),
            key_ssid: "ssid".to_string(),
            key_pass: "pass".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub max_valid_c: f32,
    pub disconnected_c: f32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_valid_c: 84.9,
            disconnected_c: -127.0,
        }
    }
}

impl ProbeConfig {
    /// Drops readings a DS18B20 reports when the bus is disconnected or the
    /// conversion was garbage.
    pub fn sanitize(&self, temp_c: Option<f32>) -> Option<f32> {
        let temp_c = temp_c?;
        if temp_c.is_nan()
            || (temp_c - self.disconnected_c).abs() < f32::EPSILON
            || temp_c > self.max_valid_c
        {
            return None;
        }
        Some(temp_c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_sanitize_rejects_sentinels() {
        let probe = ProbeConfig::default();

        assert_eq!(probe.sanitize(Some(21.5)), Some(21.5));
        assert_eq!(probe.sanitize(Some(-127.0)), None);
        assert_eq!(probe.sanitize(Some(85.0)), None);
        assert_eq!(probe.sanitize(Some(f32::NAN)), None);
        assert_eq!(probe.sanitize(None), None);
    }
}
