//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use transport::{DeviceDescriptor, EndpointDescriptor, EndpointTransfer, TransportSettings};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Transport tuning, passed through unchanged
    #[serde(default)]
    pub usb: TransportSettings,
    /// Devices to open at startup
    #[serde(default)]
    pub devices: Vec<DeviceProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub service_mode: bool,
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            service_mode: false,
            log_level: "info".to_string(),
        }
    }
}

/// How to bring up one kind of braille display
///
/// # Example Configuration
/// ```toml
/// [[devices]]
/// filter = "0x1c71:0xc005"
/// description = "Brailliant BI 40"
/// interface = 0
/// disable_autosuspend = true
///
/// [devices.input_endpoint]
/// number = 1
/// transfer = "interrupt"
/// max_packet_size = 8
/// interval = 4
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// VID:PID pattern, e.g. "0x1c71:0xc005" or "0x0403:*"
    pub filter: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "DeviceProfile::default_configuration")]
    pub configuration: u8,
    #[serde(default)]
    pub interface: u8,
    /// Alternative setting to select after the claim
    #[serde(default)]
    pub alternative: Option<u8>,
    #[serde(default)]
    pub disable_autosuspend: bool,
    #[serde(default)]
    pub input_endpoint: Option<EndpointProfile>,
    #[serde(default)]
    pub output_endpoint: Option<EndpointProfile>,
}

impl DeviceProfile {
    fn default_configuration() -> u8 {
        1
    }

    /// Human readable name for logs
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointProfile {
    pub number: u8,
    pub transfer: EndpointKind,
    #[serde(default = "EndpointProfile::default_max_packet_size")]
    pub max_packet_size: u16,
    /// bInterval in milliseconds
    #[serde(default)]
    pub interval: u8,
}

impl EndpointProfile {
    fn default_max_packet_size() -> u16 {
        64
    }

    fn transfer(&self) -> EndpointTransfer {
        match self.transfer {
            EndpointKind::Bulk => EndpointTransfer::Bulk,
            EndpointKind::Interrupt => EndpointTransfer::Interrupt,
        }
    }

    pub fn input_descriptor(&self) -> EndpointDescriptor {
        EndpointDescriptor::input(self.number, self.transfer(), self.max_packet_size, self.interval)
    }

    pub fn output_descriptor(&self) -> EndpointDescriptor {
        EndpointDescriptor::output(self.number, self.transfer(), self.max_packet_size, self.interval)
    }
}

/// Endpoint types a profile may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Bulk,
    Interrupt,
}

/// Parsed VID:PID pattern; `None` matches anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn parse(filter: &str) -> Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1c71:0xc005' or '0x1c71:*')",
                filter
            ));
        }

        Ok(Self {
            vendor_id: Self::parse_id(parts[0], "VID")?,
            product_id: Self::parse_id(parts[1], "PID")?,
        })
    }

    fn parse_id(id: &str, name: &str) -> Result<Option<u16>> {
        if id == "*" {
            return Ok(None);
        }
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1c71')",
                name,
                id
            ));
        };
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.vendor_id.is_none_or(|vendor| vendor == descriptor.vendor_id)
            && self.product_id.is_none_or(|product| product == descriptor.product_id)
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            Self::search_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to load config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("brlusb").join("daemon.toml")
        } else {
            PathBuf::from(".config/brlusb/daemon.toml")
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        vec![Self::default_path(), PathBuf::from("/etc/brlusb/daemon.toml")]
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.resubmit_delay_ms > self.usb.max_backoff_ms {
            return Err(anyhow!(
                "resubmit_delay_ms ({}) exceeds max_backoff_ms ({})",
                self.usb.resubmit_delay_ms,
                self.usb.max_backoff_ms
            ));
        }

        for profile in &self.devices {
            DeviceFilter::parse(&profile.filter)?;
            for endpoint in [&profile.input_endpoint, &profile.output_endpoint]
                .into_iter()
                .flatten()
            {
                if endpoint.number == 0 || endpoint.number > 15 {
                    return Err(anyhow!(
                        "Invalid endpoint number {} for '{}', must be 1-15",
                        endpoint.number,
                        profile.label()
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
        let raw = [
            0x12,
            0x01,
            0x00,
            0x02,
            0x00,
            0x00,
            0x00,
            0x40,
            vendor_id as u8,
            (vendor_id >> 8) as u8,
            product_id as u8,
            (product_id >> 8) as u8,
            0x00,
            0x01,
            0x01,
            0x02,
            0x03,
            0x01,
        ];
        DeviceDescriptor::parse(&raw, transport::descriptor::DescriptorOrder::LittleEndian).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.log_level, "info");
        assert!(!config.daemon.service_mode);
        assert!(config.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(
            DeviceFilter::parse("0x1c71:0xC005").unwrap(),
            DeviceFilter {
                vendor_id: Some(0x1c71),
                product_id: Some(0xc005)
            }
        );
        assert_eq!(
            DeviceFilter::parse("*:*").unwrap(),
            DeviceFilter {
                vendor_id: None,
                product_id: None
            }
        );
        assert!(DeviceFilter::parse("1c71:c005").is_err());
        assert!(DeviceFilter::parse("0x1c71").is_err());
        assert!(DeviceFilter::parse("0x12345:*").is_err());
        assert!(DeviceFilter::parse("0xGHIJ:*").is_err());
    }

    #[test]
    fn test_filter_matches() {
        let filter = DeviceFilter::parse("0x1c71:*").unwrap();
        assert!(filter.matches(&descriptor(0x1c71, 0xc005)));
        assert!(filter.matches(&descriptor(0x1c71, 0x0001)));
        assert!(!filter.matches(&descriptor(0x0403, 0xc005)));
    }

    #[test]
    fn test_profile_defaults() {
        let config = DaemonConfig::parse(
            r#"
[daemon]
service_mode = true
log_level = "debug"

[[devices]]
filter = "0x1c71:0xc005"

[devices.input_endpoint]
number = 1
transfer = "interrupt"
"#,
        )
        .unwrap();

        let profile = &config.devices[0];
        assert_eq!(profile.configuration, 1);
        assert_eq!(profile.interface, 0);
        assert_eq!(profile.alternative, None);
        assert_eq!(profile.label(), "0x1c71:0xc005");

        let input = profile.input_endpoint.unwrap();
        let descriptor = input.input_descriptor();
        assert_eq!(descriptor.address, 0x81);
        assert_eq!(descriptor.transfer(), EndpointTransfer::Interrupt);
        assert_eq!(descriptor.max_packet_size, 64);
        assert_eq!(config.usb, TransportSettings::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DaemonConfig::default();
        config.daemon.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.usb.resubmit_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.devices.push(DeviceProfile {
            filter: "0x1c71:0xc005".to_string(),
            description: None,
            configuration: 1,
            interface: 0,
            alternative: None,
            input_endpoint: Some(EndpointProfile {
                number: 16,
                transfer: EndpointKind::Bulk,
                max_packet_size: 64,
                interval: 0,
            }),
            output_endpoint: None,
            disable_autosuspend: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/daemon.toml");

        let mut config = DaemonConfig::default();
        config.usb.max_backoff_ms = 80;
        config.devices.push(DeviceProfile {
            filter: "0x0403:0x6001".to_string(),
            description: Some("FTDI serial adapter".to_string()),
            configuration: 1,
            interface: 0,
            alternative: Some(1),
            input_endpoint: None,
            output_endpoint: Some(EndpointProfile {
                number: 2,
                transfer: EndpointKind::Bulk,
                max_packet_size: 64,
                interval: 0,
            }),
            disable_autosuspend: true,
        });
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.usb.max_backoff_ms, 80);
        assert_eq!(loaded.devices, config.devices);
    }
}
