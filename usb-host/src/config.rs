use core::time::Duration;

use usbh_if::descriptor::ParseLimits;

/// Capacities and timeouts of a [`Host`](crate::Host).
///
/// Every table in the core is sized from this once, at [`Host::new`](crate::Host::new).
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub max_host_controllers: usize,
    /// Addresses `1..=max_devices` are handed out, root hubs included.
    pub max_devices: usize,
    pub max_configurations: usize,
    pub max_interfaces: usize,
    pub max_endpoints: usize,
    /// Largest `wTotalLength` accepted for a configuration block.
    pub max_config_data_len: usize,
    /// Descriptors available to asynchronous transfers when the endpoint's
    /// own descriptor is busy.
    pub extra_urbs: usize,
    pub isoc_descriptors: usize,
    pub completion_queue_depth: usize,
    pub std_req_timeout: Duration,
    pub max_string_len: usize,
    pub max_class_drivers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_host_controllers: 2,
            max_devices: 32,
            max_configurations: 2,
            max_interfaces: 8,
            max_endpoints: 8,
            max_config_data_len: 256,
            extra_urbs: 16,
            isoc_descriptors: 4,
            completion_queue_depth: 64,
            std_req_timeout: Duration::from_millis(5000),
            max_string_len: 64,
            max_class_drivers: 8,
        }
    }
}

impl HostConfig {
    pub(crate) fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_interfaces: self.max_interfaces,
        }
    }
}
