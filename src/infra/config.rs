//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/parking.toml
//!
//! After the file is read, a few environment variables override it:
//! PARKING_MODE, CENTRAL_HOST, CENTRAL_PORT, SERIAL_PORT, SERIAL_BAUD,
//! PRICE_PER_MINUTE, MINIMUM_FEE, TOTAL_SPACES.

use crate::domain::session::Tariff;
use crate::domain::types::{FloorId, LaneRole};
use crate::io::modbus::{COIL_ENTRY_BARRIER, COIL_EXIT_BARRIER};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "config/parking.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Simulation,
    Hardware,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Simulation => "simulation",
            OperatingMode::Hardware => "hardware",
        }
    }
}

impl FromStr for OperatingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulation" | "sim" => Ok(OperatingMode::Simulation),
            "hardware" | "hw" => Ok(OperatingMode::Hardware),
            other => anyhow::bail!("unknown operating mode '{}'", other),
        }
    }
}

/// What the coordinator does with an EXIT that matches no open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownExitPolicy {
    /// Open the barrier and log the anomaly
    Grant,
    /// Keep the barrier closed
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "parking".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeConfig {
    #[serde(default = "default_operating_mode")]
    pub operating: OperatingMode,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self { operating: default_operating_mode() }
    }
}

fn default_operating_mode() -> OperatingMode {
    OperatingMode::Simulation
}

#[derive(Debug, Clone, Deserialize)]
pub struct CentralConfig {
    #[serde(default = "default_central_host")]
    pub host: String,
    #[serde(default = "default_central_port")]
    pub port: u16,
    /// Address the coordinator listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            host: default_central_host(),
            port: default_central_port(),
            bind_address: default_bind_address(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_central_host() -> String {
    "127.0.0.1".to_string()
}

fn default_central_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_serial_device")]
    pub device: String,
    #[serde(default = "default_serial_baud")]
    pub baud: u32,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "default_serial_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            baud: default_serial_baud(),
            slave_id: default_slave_id(),
            timeout_ms: default_serial_timeout_ms(),
        }
    }
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_serial_baud() -> u32 {
    9600
}

fn default_slave_id() -> u8 {
    1
}

fn default_serial_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_price_per_minute")]
    pub price_per_minute: f64,
    #[serde(default = "default_minimum_fee")]
    pub minimum_fee: f64,
    #[serde(default = "default_unknown_exit_policy")]
    pub unknown_exit_policy: UnknownExitPolicy,
    /// Window for revenue and traffic counters in statistics
    #[serde(default = "default_revenue_window_secs")]
    pub revenue_window_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            price_per_minute: default_price_per_minute(),
            minimum_fee: default_minimum_fee(),
            unknown_exit_policy: default_unknown_exit_policy(),
            revenue_window_secs: default_revenue_window_secs(),
        }
    }
}

fn default_price_per_minute() -> f64 {
    0.15
}

fn default_minimum_fee() -> f64 {
    2.00
}

fn default_unknown_exit_policy() -> UnknownExitPolicy {
    UnknownExitPolicy::Grant
}

fn default_revenue_window_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacilityConfig {
    #[serde(default = "default_total_spaces")]
    pub total_spaces: u32,
    /// Floor this controller process drives
    #[serde(default = "default_floor_id")]
    pub floor_id: String,
}

impl Default for FacilityConfig {
    fn default() -> Self {
        Self { total_spaces: default_total_spaces(), floor_id: default_floor_id() }
    }
}

fn default_total_spaces() -> u32 {
    8
}

fn default_floor_id() -> String {
    "ground".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LprConfig {
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_deny_low_confidence_entry")]
    pub deny_low_confidence_entry: bool,
}

impl Default for LprConfig {
    fn default() -> Self {
        Self {
            capture_timeout_ms: default_capture_timeout_ms(),
            min_confidence: default_min_confidence(),
            deny_low_confidence_entry: default_deny_low_confidence_entry(),
        }
    }
}

fn default_capture_timeout_ms() -> u64 {
    5000
}

fn default_min_confidence() -> f64 {
    0.8
}

fn default_deny_low_confidence_entry() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FloorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_passage_timeout_ms")]
    pub passage_timeout_ms: u64,
    #[serde(default = "default_display_interval_ms")]
    pub display_interval_ms: u64,
    /// Let lane workers issue the reset themselves after a backoff delay
    #[serde(default)]
    pub auto_reset: bool,
    #[serde(default = "default_reset_backoff_initial_ms")]
    pub reset_backoff_initial_ms: u64,
    #[serde(default = "default_reset_backoff_max_ms")]
    pub reset_backoff_max_ms: u64,
}

impl Default for FloorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            passage_timeout_ms: default_passage_timeout_ms(),
            display_interval_ms: default_display_interval_ms(),
            auto_reset: false,
            reset_backoff_initial_ms: default_reset_backoff_initial_ms(),
            reset_backoff_max_ms: default_reset_backoff_max_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_passage_timeout_ms() -> u64 {
    30_000
}

fn default_display_interval_ms() -> u64 {
    5000
}

fn default_reset_backoff_initial_ms() -> u64 {
    1000
}

fn default_reset_backoff_max_ms() -> u64 {
    60_000
}

/// One physical lane: its barrier coil and presence sensor register
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LaneConfig {
    pub id: String,
    pub role: LaneRole,
    #[serde(default)]
    pub coil: Option<u16>,
    #[serde(default)]
    pub presence_register: Option<u16>,
}

impl LaneConfig {
    /// Barrier coil, defaulting to the facility address map
    pub fn coil(&self) -> u16 {
        self.coil.unwrap_or(match self.role {
            LaneRole::Entry => COIL_ENTRY_BARRIER,
            LaneRole::Exit => COIL_EXIT_BARRIER,
        })
    }

    /// Presence sensor register, defaulting to the first register after the space sensors
    pub fn presence_register(&self) -> u16 {
        self.presence_register.unwrap_or(match self.role {
            LaneRole::Entry => 0x08,
            LaneRole::Exit => 0x09,
        })
    }
}

fn default_lanes() -> Vec<LaneConfig> {
    vec![
        LaneConfig { id: "entry-1".to_string(), role: LaneRole::Entry, coil: None, presence_register: None },
        LaneConfig { id: "exit-1".to_string(), role: LaneRole::Exit, coil: None, presence_register: None },
    ]
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    /// JSONL journal; in-memory only when absent
    #[serde(default)]
    pub journal_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub central: CentralConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub facility: FacilityConfig,
    #[serde(default)]
    pub lpr: LprConfig,
    #[serde(default)]
    pub floor: FloorConfig,
    #[serde(default = "default_lanes")]
    pub lanes: Vec<LaneConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    operating_mode: OperatingMode,
    central_host: String,
    central_port: u16,
    central_bind_address: String,
    central_request_timeout_ms: u64,
    central_connect_timeout_ms: u64,
    central_reconnect_delay_ms: u64,
    serial_device: String,
    serial_baud: u32,
    serial_slave_id: u8,
    serial_timeout_ms: u64,
    price_per_minute: f64,
    minimum_fee: f64,
    unknown_exit_policy: UnknownExitPolicy,
    revenue_window_secs: u64,
    total_spaces: u32,
    floor_id: FloorId,
    capture_timeout_ms: u64,
    min_confidence: f64,
    deny_low_confidence_entry: bool,
    poll_interval_ms: u64,
    passage_timeout_ms: u64,
    display_interval_ms: u64,
    auto_reset: bool,
    reset_backoff_initial_ms: u64,
    reset_backoff_max_ms: u64,
    lanes: Vec<LaneConfig>,
    journal_file: Option<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self::from_toml(TomlConfig::default());
        config.lanes = default_lanes();
        config.config_file = "default".to_string();
        config
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig) -> Self {
        Self {
            site_id: toml_config.site.id,
            operating_mode: toml_config.mode.operating,
            central_host: toml_config.central.host,
            central_port: toml_config.central.port,
            central_bind_address: toml_config.central.bind_address,
            central_request_timeout_ms: toml_config.central.request_timeout_ms,
            central_connect_timeout_ms: toml_config.central.connect_timeout_ms,
            central_reconnect_delay_ms: toml_config.central.reconnect_delay_ms,
            serial_device: toml_config.serial.device,
            serial_baud: toml_config.serial.baud,
            serial_slave_id: toml_config.serial.slave_id,
            serial_timeout_ms: toml_config.serial.timeout_ms,
            price_per_minute: toml_config.billing.price_per_minute,
            minimum_fee: toml_config.billing.minimum_fee,
            unknown_exit_policy: toml_config.billing.unknown_exit_policy,
            revenue_window_secs: toml_config.billing.revenue_window_secs,
            total_spaces: toml_config.facility.total_spaces,
            floor_id: FloorId::new(toml_config.facility.floor_id),
            capture_timeout_ms: toml_config.lpr.capture_timeout_ms,
            min_confidence: toml_config.lpr.min_confidence,
            deny_low_confidence_entry: toml_config.lpr.deny_low_confidence_entry,
            poll_interval_ms: toml_config.floor.poll_interval_ms,
            passage_timeout_ms: toml_config.floor.passage_timeout_ms,
            display_interval_ms: toml_config.floor.display_interval_ms,
            auto_reset: toml_config.floor.auto_reset,
            reset_backoff_initial_ms: toml_config.floor.reset_backoff_initial_ms,
            reset_backoff_max_ms: toml_config.floor.reset_backoff_max_ms,
            lanes: toml_config.lanes,
            journal_file: toml_config.store.journal_file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: String::new(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load configuration from a TOML file (no environment overrides)
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut config = Self::from_toml(toml_config);
        config.config_file = path.display().to_string();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.total_spaces == 0 {
            anyhow::bail!("facility.total_spaces must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("lpr.min_confidence must be within [0, 1]");
        }
        if !is_billing_amount(self.price_per_minute) || !is_billing_amount(self.minimum_fee) {
            anyhow::bail!("billing amounts must be finite and not negative");
        }
        let mut ids: Vec<&str> = self.lanes.iter().map(|l| l.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            anyhow::bail!("lane ids must be unique");
        }
        Ok(())
    }

    /// Load from `path`, falling back to defaults when the file is missing or
    /// invalid, then apply environment overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let mut config = match Self::from_file(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        };
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Load configuration - resolves the path from args/env, then `load_from_path`
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(Self::resolve_config_path(args))
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let raw = value?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    eprintln!("Warning: ignoring {}={:?} (unparseable)", key, raw);
                    None
                }
            }
        }

        if let Some(mode) = parsed::<OperatingMode>("PARKING_MODE", lookup("PARKING_MODE")) {
            self.operating_mode = mode;
        }
        if let Some(host) = lookup("CENTRAL_HOST") {
            self.central_host = host;
        }
        if let Some(port) = parsed("CENTRAL_PORT", lookup("CENTRAL_PORT")) {
            self.central_port = port;
        }
        if let Some(device) = lookup("SERIAL_PORT") {
            self.serial_device = device;
        }
        if let Some(baud) = parsed("SERIAL_BAUD", lookup("SERIAL_BAUD")) {
            self.serial_baud = baud;
        }
        for (key, field) in [("PRICE_PER_MINUTE", &mut self.price_per_minute), ("MINIMUM_FEE", &mut self.minimum_fee)] {
            match parsed::<f64>(key, lookup(key)) {
                Some(amount) if is_billing_amount(amount) => *field = amount,
                Some(amount) => eprintln!("Warning: ignoring {}={} (must be finite and not negative)", key, amount),
                None => {}
            }
        }
        if let Some(total) = parsed::<u32>("TOTAL_SPACES", lookup("TOTAL_SPACES")) {
            if total > 0 {
                self.total_spaces = total;
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn operating_mode(&self) -> OperatingMode {
        self.operating_mode
    }

    pub fn central_host(&self) -> &str {
        &self.central_host
    }

    pub fn central_port(&self) -> u16 {
        self.central_port
    }

    /// host:port the floor controllers dial
    pub fn central_addr(&self) -> String {
        format!("{}:{}", self.central_host, self.central_port)
    }

    pub fn central_bind_address(&self) -> &str {
        &self.central_bind_address
    }

    pub fn central_request_timeout_ms(&self) -> u64 {
        self.central_request_timeout_ms
    }

    pub fn central_connect_timeout_ms(&self) -> u64 {
        self.central_connect_timeout_ms
    }

    pub fn central_reconnect_delay_ms(&self) -> u64 {
        self.central_reconnect_delay_ms
    }

    pub fn serial_device(&self) -> &str {
        &self.serial_device
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn serial_slave_id(&self) -> u8 {
        self.serial_slave_id
    }

    pub fn serial_timeout_ms(&self) -> u64 {
        self.serial_timeout_ms
    }

    pub fn price_per_minute(&self) -> f64 {
        self.price_per_minute
    }

    pub fn minimum_fee(&self) -> f64 {
        self.minimum_fee
    }

    pub fn tariff(&self) -> Tariff {
        Tariff::new(self.price_per_minute, self.minimum_fee)
    }

    pub fn unknown_exit_policy(&self) -> UnknownExitPolicy {
        self.unknown_exit_policy
    }

    pub fn revenue_window_secs(&self) -> u64 {
        self.revenue_window_secs
    }

    pub fn total_spaces(&self) -> u32 {
        self.total_spaces
    }

    pub fn floor_id(&self) -> &FloorId {
        &self.floor_id
    }

    pub fn capture_timeout_ms(&self) -> u64 {
        self.capture_timeout_ms
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn deny_low_confidence_entry(&self) -> bool {
        self.deny_low_confidence_entry
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn passage_timeout_ms(&self) -> u64 {
        self.passage_timeout_ms
    }

    pub fn display_interval_ms(&self) -> u64 {
        self.display_interval_ms
    }

    pub fn auto_reset(&self) -> bool {
        self.auto_reset
    }

    pub fn reset_backoff_initial_ms(&self) -> u64 {
        self.reset_backoff_initial_ms
    }

    pub fn reset_backoff_max_ms(&self) -> u64 {
        self.reset_backoff_max_ms
    }

    pub fn lanes(&self) -> &[LaneConfig] {
        &self.lanes
    }

    pub fn journal_file(&self) -> Option<&str> {
        self.journal_file.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set total_spaces
    pub fn with_total_spaces(mut self, total: u32) -> Self {
        self.total_spaces = total;
        self
    }

    /// Builder method for tests to set the unknown exit policy
    pub fn with_unknown_exit_policy(mut self, policy: UnknownExitPolicy) -> Self {
        self.unknown_exit_policy = policy;
        self
    }

    /// Builder method for tests to point at a coordinator
    pub fn with_central(mut self, host: &str, port: u16) -> Self {
        self.central_host = host.to_string();
        self.central_port = port;
        self
    }

    /// Builder method for tests to shorten floor timings
    pub fn with_floor_timings(mut self, poll_interval_ms: u64, passage_timeout_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self.passage_timeout_ms = passage_timeout_ms;
        self
    }

    /// Builder method for tests to set the coordinator request timeout
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.central_request_timeout_ms = ms;
        self
    }
}

fn is_billing_amount(amount: f64) -> bool {
    amount.is_finite() && amount >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.operating_mode(), OperatingMode::Simulation);
        assert_eq!(config.central_port(), 8080);
        assert_eq!(config.serial_baud(), 9600);
        assert_eq!(config.serial_slave_id(), 1);
        assert_eq!(config.serial_timeout_ms(), 3000);
        assert_eq!(config.tariff(), Tariff::new(0.15, 2.00));
        assert_eq!(config.total_spaces(), 8);
        assert_eq!(config.capture_timeout_ms(), 5000);
        assert_eq!(config.min_confidence(), 0.8);
        assert_eq!(config.unknown_exit_policy(), UnknownExitPolicy::Grant);
        assert!(!config.auto_reset());
        assert_eq!(config.lanes().len(), 2);
        assert!(config.journal_file().is_none());
    }

    #[test]
    fn test_lane_address_defaults() {
        let config = Config::default();
        let entry = &config.lanes()[0];
        let exit = &config.lanes()[1];
        assert_eq!((entry.coil(), entry.presence_register()), (COIL_ENTRY_BARRIER, 0x08));
        assert_eq!((exit.coil(), exit.presence_register()), (COIL_EXIT_BARRIER, 0x09));
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["parking-floor".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), DEFAULT_CONFIG_PATH);
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "parking-floor".to_string(),
            "--config".to_string(),
            "config/level1.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/level1.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["parking-floor".to_string(), "--config=config/level2.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/level2.toml");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PARKING_MODE", "hardware"),
            ("CENTRAL_HOST", "10.0.0.5"),
            ("CENTRAL_PORT", "9000"),
            ("SERIAL_PORT", "/dev/ttyS1"),
            ("SERIAL_BAUD", "19200"),
            ("PRICE_PER_MINUTE", "0.25"),
            ("MINIMUM_FEE", "5"),
            ("TOTAL_SPACES", "40"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.operating_mode(), OperatingMode::Hardware);
        assert_eq!(config.central_addr(), "10.0.0.5:9000");
        assert_eq!(config.serial_device(), "/dev/ttyS1");
        assert_eq!(config.serial_baud(), 19200);
        assert_eq!(config.tariff(), Tariff::new(0.25, 5.0));
        assert_eq!(config.total_spaces(), 40);
    }

    #[test]
    fn test_bad_env_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "CENTRAL_PORT" => Some("eighty".to_string()),
            "TOTAL_SPACES" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.central_port(), 8080);
        assert_eq!(config.total_spaces(), 8);
    }

    #[test]
    fn test_invalid_billing_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "PRICE_PER_MINUTE" => Some("-0.5".to_string()),
            "MINIMUM_FEE" => Some("NaN".to_string()),
            _ => None,
        });
        assert_eq!(config.price_per_minute(), 0.15);
        assert_eq!(config.minimum_fee(), 2.00);
        assert!(config.validate().is_ok());

        config.apply_overrides(|key| (key == "MINIMUM_FEE").then(|| "3.5".to_string()));
        assert_eq!(config.minimum_fee(), 3.5);
    }

    #[test]
    fn test_operating_mode_parse() {
        assert_eq!("Simulation".parse::<OperatingMode>().unwrap(), OperatingMode::Simulation);
        assert_eq!("hardware".parse::<OperatingMode>().unwrap(), OperatingMode::Hardware);
        assert!("bogus".parse::<OperatingMode>().is_err());
    }
}
