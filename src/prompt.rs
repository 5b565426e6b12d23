//! Prompt Detector (C2). Classifies a tail of console output into a router
//! mode. Never fails: absence of a match is simply `None`.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterMode {
    Unknown,
    Booting,
    RomMonitor,
    UserMode { host: String },
    PrivilegedMode { host: String },
    ConfigMode { host: String, submode: Option<String> },
    PasswordPrompt,
    Error { kind: String },
}

impl RouterMode {
    /// Coarse family comparison, ignoring hostname/submode payload - used by
    /// callers that only care "did we land on ConfigMode" etc.
    pub fn same_family(&self, other: &RouterMode) -> bool {
        use RouterMode::*;
        matches!(
            (self, other),
            (Unknown, Unknown)
                | (Booting, Booting)
                | (RomMonitor, RomMonitor)
                | (UserMode { .. }, UserMode { .. })
                | (PrivilegedMode { .. }, PrivilegedMode { .. })
                | (ConfigMode { .. }, ConfigMode { .. })
                | (PasswordPrompt, PasswordPrompt)
                | (Error { .. }, Error { .. })
        )
    }
}

#[derive(Debug, Clone)]
pub struct MatchInfo {
    pub matched_text: String,
}

static ROM_MONITOR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)rommon\s*\d+\s*>\s*").unwrap(),
        Regex::new(r"(?i)rommon>\s*").unwrap(),
        Regex::new(r"(?i)\(rommon\)>\s*").unwrap(),
    ]
});

static PASSWORD_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?im)^.*[Pp]assword:\s*$").unwrap(),
        Regex::new(r"(?im)^.*[Ee]nter\s+[Pp]assword:\s*$").unwrap(),
        Regex::new(r"(?im)^.*[Pp]assword\s+for\s+[^:]+:\s*$").unwrap(),
    ]
});

static CONFIG_SUBMODE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![Regex::new(r"(?m)^([A-Za-z0-9_-]+)\s*\(config-[^)]+\)#\s*$").unwrap()]
});

static CONFIG_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![Regex::new(r"(?m)^([A-Za-z0-9_-]+)\s*\(config\)#\s*$").unwrap()]
});

static PRIVILEGED_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| vec![Regex::new(r"(?m)^([A-Za-z0-9_-]+)\s*#\s*$").unwrap()]);

static USER_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| vec![Regex::new(r"(?m)^([A-Za-z0-9_-]+)\s*>\s*$").unwrap()]);

static BOOT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)System Bootstrap").unwrap(),
        Regex::new(r"(?i)Initializing").unwrap(),
        Regex::new(r"(?i)Loading").unwrap(),
        Regex::new(r"(?i)Starting").unwrap(),
        Regex::new(r"(?i)Cisco IOS XE").unwrap(),
        Regex::new(r"(?i)Cisco IOS").unwrap(),
    ]
});

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)% Invalid input").unwrap(),
        Regex::new(r"(?i)% Invalid command").unwrap(),
        Regex::new(r"(?i)% Incomplete command").unwrap(),
        Regex::new(r"(?i)% Ambiguous command").unwrap(),
        Regex::new(r"(?i)% Unknown command").unwrap(),
        Regex::new(r"(?i)% Error").unwrap(),
    ]
});

/// Remembers the last successful classification; stateless across calls
/// otherwise. `detect` is a pure function of its input buffer.
#[derive(Default)]
pub struct PromptDetector {
    last_mode: Option<RouterMode>,
}

impl PromptDetector {
    pub fn new() -> Self {
        PromptDetector { last_mode: None }
    }

    /// Classifies `output`, trying families in priority order: ROM-monitor
    /// -> password -> config submode -> config -> privileged -> user ->
    /// boot -> error.
    pub fn detect(&mut self, output: &str) -> Option<(RouterMode, MatchInfo)> {
        for p in ROM_MONITOR_PATTERNS.iter() {
            if let Some(m) = p.find(output) {
                let mode = RouterMode::RomMonitor;
                self.last_mode = Some(mode.clone());
                return Some((mode, MatchInfo { matched_text: m.as_str().to_string() }));
            }
        }

        for p in PASSWORD_PATTERNS.iter() {
            if let Some(m) = p.find(output) {
                let mode = RouterMode::PasswordPrompt;
                self.last_mode = Some(mode.clone());
                return Some((mode, MatchInfo { matched_text: m.as_str().to_string() }));
            }
        }

        for p in CONFIG_SUBMODE_PATTERNS.iter() {
            if let Some(c) = p.captures(output) {
                let host = c[1].to_string();
                let mode = RouterMode::ConfigMode { host, submode: Some("sub".to_string()) };
                self.last_mode = Some(mode.clone());
                return Some((mode, MatchInfo { matched_text: c[0].to_string() }));
            }
        }

        for p in CONFIG_PATTERNS.iter() {
            if let Some(c) = p.captures(output) {
                let host = c[1].to_string();
                let mode = RouterMode::ConfigMode { host, submode: None };
                self.last_mode = Some(mode.clone());
                return Some((mode, MatchInfo { matched_text: c[0].to_string() }));
            }
        }

        for p in PRIVILEGED_PATTERNS.iter() {
            if let Some(c) = p.captures(output) {
                let host = c[1].to_string();
                let mode = RouterMode::PrivilegedMode { host };
                self.last_mode = Some(mode.clone());
                return Some((mode, MatchInfo { matched_text: c[0].to_string() }));
            }
        }

        for p in USER_PATTERNS.iter() {
            if let Some(c) = p.captures(output) {
                let host = c[1].to_string();
                let mode = RouterMode::UserMode { host };
                self.last_mode = Some(mode.clone());
                return Some((mode, MatchInfo { matched_text: c[0].to_string() }));
            }
        }

        for p in BOOT_PATTERNS.iter() {
            if p.is_match(output) {
                let mode = RouterMode::Booting;
                self.last_mode = Some(mode.clone());
                return Some((mode, MatchInfo { matched_text: String::new() }));
            }
        }

        for p in ERROR_PATTERNS.iter() {
            if let Some(m) = p.find(output) {
                // Error is deliberately not remembered as `last_mode`: it's
                // a transient classification of the tail, not a stable mode.
                return Some((
                    RouterMode::Error { kind: m.as_str().to_string() },
                    MatchInfo { matched_text: m.as_str().to_string() },
                ));
            }
        }

        None
    }

    /// Polls `output_buffer` (supplied fresh by the caller on each poll)
    /// until it matches `target` (or any mode, if `target` is absent) or
    /// `timeout` elapses.
    pub fn wait_for_prompt<F>(
        &mut self,
        mut fetch: F,
        target: Option<&RouterMode>,
        timeout: Duration,
    ) -> Option<(RouterMode, MatchInfo)>
    where
        F: FnMut() -> String,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let buf = fetch();
            if let Some((mode, info)) = self.detect(&buf) {
                if target.map_or(true, |t| mode.same_family(t)) {
                    return Some((mode, info));
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        None
    }

    pub fn current_mode(&self) -> RouterMode {
        self.last_mode.clone().unwrap_or(RouterMode::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_a_pure_function() {
        let mut d = PromptDetector::new();
        let buf = "Router#";
        let a = d.detect(buf);
        let b = d.detect(buf);
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn rommon_wins_priority_over_privileged_when_both_present() {
        let mut d = PromptDetector::new();
        let buf = "Router#\nrommon 1 > ";
        let (mode, _) = d.detect(buf).unwrap();
        assert_eq!(mode, RouterMode::RomMonitor);
    }

    #[test]
    fn privileged_mode_extracts_hostname() {
        let mut d = PromptDetector::new();
        let (mode, _) = d.detect("Router#").unwrap();
        match mode {
            RouterMode::PrivilegedMode { host } => assert_eq!(host, "Router"),
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn config_submode_detected_distinctly_from_config_mode() {
        let mut d = PromptDetector::new();
        let (mode, _) = d.detect("Router(config-if)#").unwrap();
        match mode {
            RouterMode::ConfigMode { submode: Some(_), .. } => {}
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn boot_banner_recognized() {
        let mut d = PromptDetector::new();
        let (mode, _) = d.detect("System Bootstrap, Version 15.1\n").unwrap();
        assert_eq!(mode, RouterMode::Booting);
    }

    #[test]
    fn ios_error_recognized() {
        let mut d = PromptDetector::new();
        let (mode, _) = d.detect("% Invalid input detected\n").unwrap();
        assert!(matches!(mode, RouterMode::Error { .. }));
    }

    #[test]
    fn no_match_returns_none_not_error() {
        let mut d = PromptDetector::new();
        assert!(d.detect("garbage noise with no prompt").is_none());
    }
}
