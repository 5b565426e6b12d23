//! System Inventory (C8). Runs a battery of `show` commands once the router
//! has rebooted into IOS, parses each into a small structured summary, and
//! exports the aggregate as JSON, YAML, or a plain-text report.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::executor::CommandExecutor;

const ROUTING_PROTOCOLS: [&str; 5] = ["ospf", "eigrp", "bgp", "rip", "isis"];

static ACTIVE_LICENSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Status:\s*ACTIVE").unwrap());
static INACTIVE_LICENSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Status:\s*INACTIVE").unwrap());
static EVAL_LICENSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Status:\s*EVALUATION").unwrap());
static PID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)PID:\s*([A-Za-z0-9-]+)").unwrap());
static SN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)SN:\s*([A-Za-z0-9]+)").unwrap());
static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)NAME:\s*"([^"]+)""#).unwrap());
static DESCR_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)DESCR:\s*"([^"]+)""#).unwrap());
static UPTIME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)uptime is\s+(.+)").unwrap());
static MEMORY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+[KMGT]?) bytes of (?:.*?memory|RAM)").unwrap());
static PROCESSOR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)processor.*?(\d+)\s*MHz").unwrap());
static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Version\s+([0-9.()A-Za-z]+)").unwrap());
static IMAGE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)System image file is\s+"([^"]+)""#).unwrap());
static HOSTNAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)hostname\s+(\S+)").unwrap());

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Udi {
    pub pid: Option<String>,
    pub sn: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LicenseSummary {
    pub license_summary: Option<String>,
    pub license_features: Option<String>,
    pub license_udi: Option<String>,
    pub active_licenses: Vec<String>,
    pub inactive_licenses: Vec<String>,
    pub evaluation_licenses: Vec<String>,
    pub udi: Udi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    pub description: Option<String>,
    pub pid: Option<String>,
    pub sn: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hardware {
    pub inventory: Option<String>,
    pub version: Option<String>,
    pub chassis: Option<InventoryItem>,
    pub modules: Vec<InventoryItem>,
    pub uptime: Option<String>,
    pub memory_total: Option<String>,
    pub cpu_speed: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Software {
    pub version: Option<String>,
    pub software_packages: Option<String>,
    pub ios_version: Option<String>,
    pub image_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features {
    pub feature_list: Option<String>,
    pub security_features: Vec<String>,
    pub routing_protocols: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceSummary {
    pub name: String,
    pub ip_address: Option<String>,
    pub status: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interfaces {
    pub physical: Vec<InterfaceSummary>,
    pub logical: Vec<InterfaceSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub clock: Option<String>,
    pub users: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResults {
    pub timestamp: String,
    pub licenses: LicenseSummary,
    pub hardware: Hardware,
    pub software: Software,
    pub features: Features,
    pub interfaces: Interfaces,
    pub configuration: Configuration,
    pub system_info: SystemInfo,
}

pub struct SystemDetector<'a> {
    executor: &'a CommandExecutor,
    results: Option<DetectionResults>,
}

impl<'a> SystemDetector<'a> {
    pub fn new(executor: &'a CommandExecutor) -> Self {
        SystemDetector { executor, results: None }
    }

    fn run(&self, command: &str, timeout: Duration) -> Option<String> {
        let (success, output) = self.executor.execute(command, None, timeout, true, true);
        if success {
            Some(output)
        } else {
            tracing::debug!(command, "detection command failed or degraded");
            None
        }
    }

    pub fn detect_all(&mut self) -> &DetectionResults {
        tracing::info!("starting comprehensive system detection");
        let results = DetectionResults {
            timestamp: Local::now().to_rfc3339(),
            licenses: self.detect_licenses(),
            hardware: self.detect_hardware(),
            software: self.detect_software(),
            features: self.detect_features(),
            interfaces: self.detect_interfaces(),
            configuration: self.detect_configuration(),
            system_info: self.detect_system_info(),
        };
        tracing::info!("system detection complete");
        self.results = Some(results);
        self.results.as_ref().unwrap()
    }

    pub fn detect_licenses(&self) -> LicenseSummary {
        tracing::info!("detecting licenses");
        let mut out = LicenseSummary::default();

        if let Some(output) = self.run("show license summary", Duration::from_secs(10)) {
            for line in output.lines() {
                if ACTIVE_LICENSE.is_match(line) {
                    out.active_licenses.push(line.trim().to_string());
                } else if INACTIVE_LICENSE.is_match(line) {
                    out.inactive_licenses.push(line.trim().to_string());
                } else if EVAL_LICENSE.is_match(line) {
                    out.evaluation_licenses.push(line.trim().to_string());
                }
            }
            out.license_summary = Some(output);
        }

        if let Some(output) = self.run("show license feature", Duration::from_secs(10)) {
            out.license_features = Some(output);
        }

        if let Some(output) = self.run("show license udi", Duration::from_secs(10)) {
            if let Some(c) = PID_PATTERN.captures(&output) {
                out.udi.pid = Some(c[1].to_string());
            }
            if let Some(c) = SN_PATTERN.captures(&output) {
                out.udi.sn = Some(c[1].to_string());
            }
            out.license_udi = Some(output);
        }

        out
    }

    pub fn detect_hardware(&self) -> Hardware {
        tracing::info!("detecting hardware inventory");
        let mut out = Hardware::default();

        if let Some(output) = self.run("show inventory", Duration::from_secs(15)) {
            self.parse_inventory(&output, &mut out);
            out.inventory = Some(output);
        }

        if let Some(output) = self.run("show version", Duration::from_secs(10)) {
            if let Some(c) = UPTIME_PATTERN.captures(&output) {
                out.uptime = Some(c[1].trim().to_string());
            }
            if let Some(c) = MEMORY_PATTERN.captures(&output) {
                out.memory_total = Some(c[1].to_string());
            }
            if let Some(c) = PROCESSOR_PATTERN.captures(&output) {
                out.cpu_speed = Some(c[1].to_string());
            }
            out.version = Some(output);
        }

        out
    }

    /// Walks NAME:/DESCR:/PID:/SN: lines, grouping into an item per NAME:
    /// boundary; a name containing "Chassis" becomes the chassis entry,
    /// everything else is a module.
    fn parse_inventory(&self, output: &str, out: &mut Hardware) {
        let mut current: Option<InventoryItem> = None;

        let flush = |current: Option<InventoryItem>, out: &mut Hardware| {
            if let Some(item) = current {
                if item.name.contains("Chassis") {
                    out.chassis = Some(item);
                } else {
                    out.modules.push(item);
                }
            }
        };

        for line in output.lines() {
            if let Some(c) = NAME_PATTERN.captures(line) {
                flush(current.take(), out);
                current = Some(InventoryItem { name: c[1].to_string(), ..Default::default() });
            }

            if let Some(item) = current.as_mut() {
                if let Some(c) = DESCR_PATTERN.captures(line) {
                    item.description = Some(c[1].to_string());
                }
                if let Some(c) = PID_PATTERN.captures(line) {
                    item.pid = Some(c[1].to_string());
                }
                if let Some(c) = SN_PATTERN.captures(line) {
                    item.sn = Some(c[1].to_string());
                }
            }
        }

        flush(current, out);
    }

    pub fn detect_software(&self) -> Software {
        tracing::info!("detecting software version");
        let mut out = Software::default();

        if let Some(output) = self.run("show version", Duration::from_secs(10)) {
            if let Some(c) = VERSION_PATTERN.captures(&output) {
                out.ios_version = Some(c[1].to_string());
            }
            if let Some(c) = IMAGE_PATTERN.captures(&output) {
                out.image_file = Some(c[1].to_string());
            }
            out.version = Some(output);
        }

        // `show software` only exists on IOS XE; a failure here is expected
        // and non-fatal on classic IOS, per the decision that this topic
        // degrades rather than aborting detection.
        if let Some(output) = self.run("show software", Duration::from_secs(15)) {
            out.software_packages = Some(output);
        }

        out
    }

    pub fn detect_features(&self) -> Features {
        tracing::info!("detecting features");
        let mut out = Features::default();

        // `show feature` is IOS XE-only; absence is non-fatal (Open
        // Question decision: degrade to an empty parsed list).
        if let Some(output) = self.run("show feature", Duration::from_secs(10)) {
            out.feature_list = Some(output);
        }

        if let Some(output) = self.run("show running-config", Duration::from_secs(30)) {
            for protocol in ROUTING_PROTOCOLS {
                let pattern = Regex::new(&format!(r"(?i)\b{}\b", protocol)).unwrap();
                if pattern.is_match(&output) {
                    out.routing_protocols.push(protocol.to_uppercase());
                }
            }
            if Regex::new(r"(?i)\bipsec\b").unwrap().is_match(&output) {
                out.security_features.push("IPSEC".to_string());
            }
            if Regex::new(r"(?i)\bssl\b").unwrap().is_match(&output) {
                out.security_features.push("SSL".to_string());
            }
        }

        out
    }

    pub fn detect_interfaces(&self) -> Interfaces {
        tracing::info!("detecting interfaces");
        let mut out = Interfaces::default();

        if let Some(output) = self.run("show ip interface brief", Duration::from_secs(15)) {
            for line in output.lines() {
                if line.contains("Interface") && line.contains("IP-Address") {
                    continue;
                }
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() < 4 {
                    continue;
                }
                let iface = InterfaceSummary {
                    name: parts[0].to_string(),
                    ip_address: if parts[1] == "unassigned" { None } else { Some(parts[1].to_string()) },
                    status: Some(parts[2].to_string()),
                    protocol: Some(parts[3].to_string()),
                };
                if iface.name.starts_with("GigabitEthernet")
                    || iface.name.starts_with("FastEthernet")
                    || iface.name.starts_with("Serial")
                    || iface.name.starts_with("Ethernet")
                {
                    out.physical.push(iface);
                } else {
                    out.logical.push(iface);
                }
            }
        }

        out
    }

    pub fn detect_configuration(&self) -> Configuration {
        tracing::info!("detecting configuration summary");
        let mut out = Configuration::default();

        if let Some(output) = self.run("show running-config | include hostname", Duration::from_secs(10)) {
            if let Some(c) = HOSTNAME_PATTERN.captures(&output) {
                out.hostname = Some(c[1].to_string());
            }
        }

        out
    }

    pub fn detect_system_info(&self) -> SystemInfo {
        tracing::info!("detecting system information");
        let mut out = SystemInfo::default();

        if let Some(output) = self.run("show clock", Duration::from_secs(5)) {
            out.clock = Some(output.trim().to_string());
        }
        if let Some(output) = self.run("show users", Duration::from_secs(5)) {
            out.users = Some(output);
        }

        out
    }

    pub fn results(&self) -> Option<&DetectionResults> {
        self.results.as_ref()
    }

    /// Exports the last `detect_all()` results to `dir` as `json`, `yaml`,
    /// or `txt`; returns the written path.
    pub fn export_results(&self, dir: &Path, format: &str) -> anyhow::Result<PathBuf> {
        let results = self
            .results
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no detection results to export; call detect_all() first"))?;

        std::fs::create_dir_all(dir)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let filename = format!("detection_{}.{}", timestamp, format);
        let path = dir.join(filename);

        match format {
            "json" => {
                let contents = serde_json::to_string_pretty(results)?;
                std::fs::write(&path, contents)?;
            }
            "yaml" => {
                let contents = serde_yaml::to_string(results)?;
                std::fs::write(&path, contents)?;
            }
            "txt" => {
                std::fs::write(&path, format_text_report(results))?;
            }
            other => {
                anyhow::bail!("unsupported export format: {}", other);
            }
        }

        tracing::info!(path = %path.display(), "detection results exported");
        Ok(path)
    }
}

fn format_text_report(results: &DetectionResults) -> String {
    let mut report: Vec<String> = Vec::new();
    let rule = "=".repeat(80);
    let dash = "-".repeat(80);

    report.push(rule.clone());
    report.push("Cisco Router System Detection Report".to_string());
    report.push(rule.clone());
    report.push(format!("Timestamp: {}", results.timestamp));
    report.push(String::new());

    report.push("LICENSES".to_string());
    report.push(dash.clone());
    if results.licenses.udi.pid.is_some() || results.licenses.udi.sn.is_some() {
        report.push(format!(
            "UDI: PID={}, SN={}",
            results.licenses.udi.pid.as_deref().unwrap_or("N/A"),
            results.licenses.udi.sn.as_deref().unwrap_or("N/A"),
        ));
    }
    report.push(String::new());

    report.push("HARDWARE".to_string());
    report.push(dash.clone());
    if let Some(chassis) = &results.hardware.chassis {
        report.push(format!("Chassis: {}", chassis.name));
        report.push(format!("  Description: {}", chassis.description.as_deref().unwrap_or("N/A")));
        report.push(format!("  PID: {}", chassis.pid.as_deref().unwrap_or("N/A")));
        report.push(format!("  SN: {}", chassis.sn.as_deref().unwrap_or("N/A")));
    }
    report.push(String::new());

    report.push("SOFTWARE".to_string());
    report.push(dash.clone());
    if let Some(v) = &results.software.ios_version {
        report.push(format!("IOS Version: {}", v));
    }
    if let Some(f) = &results.software.image_file {
        report.push(format!("Image File: {}", f));
    }
    report.push(String::new());

    report.push("INTERFACES".to_string());
    report.push(dash.clone());
    report.push(format!("Physical Interfaces: {}", results.interfaces.physical.len()));
    report.push(format!("Logical Interfaces: {}", results.interfaces.logical.len()));
    report.push(String::new());

    report.push(rule);
    report.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::sync::{Arc, Mutex};

    fn detector_harness() -> CommandExecutor {
        let metrics: Arc<dyn crate::metrics::MetricsSink> = Arc::new(NoopMetrics);
        let transport = Arc::new(Mutex::new(crate::transport::SerialTransport::new(metrics.clone())));
        CommandExecutor::new(transport, metrics)
    }

    #[test]
    fn parse_inventory_groups_chassis_and_modules() {
        let executor = detector_harness();
        let detector = SystemDetector::new(&executor);
        let mut hardware = Hardware::default();
        let output = "NAME: \"Chassis\", DESCR: \"Cisco 4321\"\nPID: ISR4321/K9, VID: V01, SN: ABC123\nNAME: \"module 0\", DESCR: \"Fixed Module\"\nPID: NIM-1, VID: V01, SN: XYZ987\n";
        detector.parse_inventory(output, &mut hardware);
        assert_eq!(hardware.chassis.as_ref().unwrap().pid.as_deref(), Some("ISR4321/K9"));
        assert_eq!(hardware.modules.len(), 1);
        assert_eq!(hardware.modules[0].sn.as_deref(), Some("XYZ987"));
    }

    #[test]
    fn export_without_detection_fails() {
        let executor = detector_harness();
        let detector = SystemDetector::new(&executor);
        let dir = tempfile::tempdir().unwrap();
        assert!(detector.export_results(dir.path(), "json").is_err());
    }

    #[test]
    fn export_json_after_manual_results_assignment_round_trips() {
        let executor = detector_harness();
        let mut detector = SystemDetector::new(&executor);
        detector.results = Some(DetectionResults {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            licenses: LicenseSummary::default(),
            hardware: Hardware::default(),
            software: Software::default(),
            features: Features::default(),
            interfaces: Interfaces::default(),
            configuration: Configuration::default(),
            system_info: SystemInfo::default(),
        });
        let dir = tempfile::tempdir().unwrap();
        let path = detector.export_results(dir.path(), "json").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn json_export_reimport_reexport_is_byte_equal_modulo_key_order() {
        let results = DetectionResults {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            licenses: LicenseSummary {
                active_licenses: vec!["ipbasek9 ACTIVE".to_string()],
                udi: Udi { pid: Some("ISR4321/K9".to_string()), sn: Some("ABC123".to_string()) },
                ..Default::default()
            },
            hardware: Hardware {
                chassis: Some(InventoryItem {
                    name: "Chassis".to_string(),
                    pid: Some("ISR4321/K9".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            software: Software { ios_version: Some("16.9.4".to_string()), ..Default::default() },
            features: Features::default(),
            interfaces: Interfaces::default(),
            configuration: Configuration { hostname: Some("Router".to_string()) },
            system_info: SystemInfo::default(),
        };

        let first = serde_json::to_string_pretty(&results).unwrap();
        let reimported: DetectionResults = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&reimported).unwrap();

        // Field order in the struct (hence the serializer's key order) is
        // stable across a parse/reserialize cycle, so this is a plain
        // byte-equality check rather than a key-order-insensitive compare.
        assert_eq!(first, second);
        assert_eq!(reimported.licenses.udi.sn.as_deref(), Some("ABC123"));
    }
}
