//! Machine fingerprinting for credential binding.
//!
//! Generates a stable fingerprint that identifies this machine, plus the
//! descriptive fields the authority records next to each binding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;

/// A stable fingerprint ("machine code") that identifies a machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineFingerprint(String);

impl MachineFingerprint {
    /// Generates the fingerprint of the current machine.
    ///
    /// Combines several hardware identifiers so the id survives reboots but
    /// changes if the hardware changes significantly.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_facts(&HostFacts::probe())
    }

    /// Fingerprint of a host described by `facts`.
    #[must_use]
    pub fn from_facts(facts: &HostFacts) -> Self {
        let combined = facts.identifiers().join("|");

        let mut hasher = Sha256::new();
        hasher.update(combined.as_bytes());
        let hash = hasher.finalize();

        Self(BASE64.encode(&hash[..16])) // first 16 bytes
    }

    /// Wraps a fingerprint reported by the authority or supplied by a caller.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this fingerprint belongs to the current machine.
    #[must_use]
    pub fn matches_current(&self) -> bool {
        *self == Self::generate()
    }
}

impl fmt::Display for MachineFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the authority learns about the machine a session runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub fingerprint: MachineFingerprint,
    pub computer_name: String,
    pub os_version: String,
}

impl MachineInfo {
    /// Collects information about the current machine.
    #[must_use]
    pub fn collect() -> Self {
        Self::from_facts(&HostFacts::probe())
    }

    /// Machine info for a host described by `facts`.
    #[must_use]
    pub fn from_facts(facts: &HostFacts) -> Self {
        Self {
            fingerprint: MachineFingerprint::from_facts(facts),
            computer_name: facts.hostname.clone(),
            os_version: format!("{} {}", facts.os, facts.os_version),
        }
    }
}

/// Raw facts about a host, read once per probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub os_version: String,
    /// Platform machine id; the strongest identifier when present.
    pub machine_id: Option<String>,
    pub user: Option<String>,
}

impl HostFacts {
    /// Reads the facts of the current host.
    #[must_use]
    pub fn probe() -> Self {
        Self {
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            os_version: probe_os_version().unwrap_or_else(|| UNKNOWN.to_string()),
            machine_id: probe_machine_id(),
            user: env::var("USER").or_else(|_| env::var("USERNAME")).ok(),
        }
    }

    /// Identifiers that feed the fingerprint, most stable first.
    ///
    /// The OS version is left out so an upgrade keeps the binding.
    fn identifiers(&self) -> Vec<&str> {
        let mut ids = vec![self.os.as_str(), self.arch.as_str(), self.hostname.as_str()];
        ids.extend(self.machine_id.as_deref());
        ids.extend(self.user.as_deref());
        ids
    }

    /// Version from an `os-release` file: `VERSION_ID`, else `VERSION`.
    #[must_use]
    pub fn parse_os_release(content: &str) -> Option<String> {
        let field = |key: &str| {
            content.lines().find_map(|line| {
                let value = line.strip_prefix(key)?.strip_prefix('=')?;
                let value = value.trim().trim_matches('"');
                (!value.is_empty()).then(|| value.to_string())
            })
        };
        field("VERSION_ID").or_else(|| field("VERSION"))
    }
}

const UNKNOWN: &str = "unknown";

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

fn probe_os_version() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        command_stdout("sw_vers", &["-productVersion"]).map(|s| s.trim().to_string())
    }

    #[cfg(target_os = "windows")]
    {
        // "Microsoft Windows [Version 10.0.22631.3007]"
        command_stdout("cmd", &["/C", "ver"]).and_then(|s| {
            let (_, rest) = s.split_once("Version ")?;
            Some(rest.trim().trim_end_matches(']').to_string())
        })
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release")
            .or_else(|_| std::fs::read_to_string("/usr/lib/os-release"))
            .ok()
            .and_then(|content| HostFacts::parse_os_release(&content))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}

fn probe_machine_id() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        command_stdout("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"]).and_then(|output| {
            output
                .lines()
                .find(|l| l.contains("IOPlatformUUID"))
                .and_then(|l| l.split('"').nth(3))
                .map(String::from)
        })
    }

    #[cfg(target_os = "windows")]
    {
        command_stdout(
            "reg",
            &["query", r"HKLM\SOFTWARE\Microsoft\Cryptography", "/v", "MachineGuid"],
        )
        .and_then(|output| {
            output
                .lines()
                .find(|l| l.contains("MachineGuid"))
                .and_then(|l| l.split_whitespace().last())
                .map(String::from)
        })
    }

    #[cfg(target_os = "linux")]
    {
        // systemd first, then the older dbus location
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}
