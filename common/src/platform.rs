use std::net::Ipv4Addr;

use crate::{error::NetError, types::NetworkCredentials};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub password: String,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

pub trait WifiRadio {
    /// Switches to station mode, applies the hostname, enables reconnect where
    /// the platform supports it and starts joining. Must not block until the
    /// link is up; progress is observed through [`WifiRadio::is_connected`].
    fn begin_station(
        &mut self,
        hostname: &str,
        credentials: &NetworkCredentials,
    ) -> Result<(), NetError>;

    fn is_connected(&mut self) -> bool;

    fn station_ip(&self) -> Option<Ipv4Addr>;

    /// Starts a local access point and returns the address it serves on.
    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<Ipv4Addr, NetError>;

    fn access_point_ip(&self) -> Option<Ipv4Addr>;
}

/// DNS responder that resolves every name to one address.
pub trait CaptiveDns {
    fn start(&mut self, port: u16, answer: Ipv4Addr) -> Result<(), NetError>;

    /// Answers at most one pending query. Returns whether one was handled.
    fn process_next_request(&mut self) -> Result<bool, NetError>;
}

pub trait System {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
    /// Software (warm) restart. Real implementations do not return.
    fn restart(&self);
}
