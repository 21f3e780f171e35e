//! Course and submission configuration.
//!
//! Both `course-config` and `submission-config` are INI files. They are parsed
//! once into an [`IniDocument`] and then projected into immutable views:
//! [`TesterSpec`] (control plane), [`AssignmentSpec`], [`MachineSpec`] and
//! [`SubmissionConfig`]. Section names and keys are case-insensitive.

use crate::error::ConfigError;
use crate::guest::GuestDir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

type ConfigResult<T> = std::result::Result<T, ConfigError>;

const DEFAULT_TOOLS_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POWER_ON_GRACE_SECS: u64 = 5;
const DEFAULT_SHELL: &str = "/bin/bash";

// ---------------------------------------------------------------------------
// Raw INI access
// ---------------------------------------------------------------------------

/// One INI section with lower-cased keys.
#[derive(Debug, Clone, Default)]
pub struct ConfigSection {
    name: String,
    entries: BTreeMap<String, String>,
}

impl ConfigSection {
    /// Section name as written in the file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trimmed value for `key`; empty values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> ConfigResult<&str> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey {
            section: self.name.clone(),
            key: key.to_string(),
        })
    }

    pub fn get_bool(&self, key: &str, default: bool) -> ConfigResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "yes" | "true" | "on" => Ok(true),
                "0" | "no" | "false" | "off" => Ok(false),
                _ => Err(self.invalid(key, v)),
            },
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> ConfigResult<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| self.invalid(key, v)),
        }
    }

    /// A whole number of seconds.
    pub fn get_secs(&self, key: &str, default: u64) -> ConfigResult<Duration> {
        self.get_u64(key, default).map(Duration::from_secs)
    }

    fn invalid(&self, key: &str, value: &str) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.name.clone(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// A parsed INI file, sections indexed case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    sections: BTreeMap<String, ConfigSection>,
}

impl IniDocument {
    /// Load and parse an INI file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let ini = ini::Ini::load_from_file_opt(path, parse_options()).map_err(|e| {
            ConfigError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::from_ini(&ini))
    }

    /// Parse INI text; `origin` is only used for error messages.
    pub fn parse(text: &str, origin: &Path) -> ConfigResult<Self> {
        let ini = ini::Ini::load_from_str_opt(text, parse_options()).map_err(|e| {
            ConfigError::Unreadable {
                path: origin.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::from_ini(&ini))
    }

    fn from_ini(ini: &ini::Ini) -> Self {
        let mut sections = BTreeMap::new();
        for (name, props) in ini.iter() {
            let Some(name) = name else { continue };
            let section = sections
                .entry(section_key(name))
                .or_insert_with(|| ConfigSection {
                    name: name.trim().to_string(),
                    entries: BTreeMap::new(),
                });
            for (key, value) in props.iter() {
                section
                    .entries
                    .insert(key.trim().to_ascii_lowercase(), value.to_string());
            }
        }
        Self { sections }
    }

    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.get(&section_key(name))
    }

    pub fn require_section(&self, name: &str) -> ConfigResult<&ConfigSection> {
        self.section(name)
            .ok_or_else(|| ConfigError::MissingSection(name.to_string()))
    }
}

/// Guest paths are full of backslashes; keep values verbatim.
fn parse_options() -> ini::ParseOption {
    ini::ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..Default::default()
    }
}

fn section_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// Submission config
// ---------------------------------------------------------------------------

/// The `[Assignment]` section of a bundle's `submission-config`. Other keys
/// are ignored; the archive is always staged as `archive.zip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionConfig {
    pub assignment: String,
    pub user: String,
}

impl SubmissionConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        Self::from_document(&IniDocument::load(path)?)
    }

    pub fn from_document(doc: &IniDocument) -> ConfigResult<Self> {
        let section = doc.require_section("Assignment")?;
        Ok(Self {
            assignment: section.require("Assignment")?.to_string(),
            user: section.require("User")?.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tester (control plane) config
// ---------------------------------------------------------------------------

/// Remote virtualization host endpoint and credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub hostname: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the executor reaches the virtualization control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TesterSpec {
    /// Value passed to `vmrun -T` (`ws`, `server`, `esx`, ...).
    pub vmware_type: String,
    /// `None` means the host-local control plane.
    pub remote: Option<RemoteHost>,
    /// Register the descriptor on connect and unregister at teardown.
    pub register_vm: bool,
    pub vmrun_path: PathBuf,
    pub power_on_grace: Duration,
    /// Host command that answers a pending guest dialog during power-on.
    pub power_on_responder: Option<String>,
}

impl Default for TesterSpec {
    fn default() -> Self {
        Self {
            vmware_type: "ws".to_string(),
            remote: None,
            register_vm: false,
            vmrun_path: PathBuf::from("vmrun"),
            power_on_grace: Duration::from_secs(DEFAULT_POWER_ON_GRACE_SECS),
            power_on_responder: None,
        }
    }
}

impl TesterSpec {
    pub fn from_section(section: &ConfigSection) -> ConfigResult<Self> {
        let remote = match section.get("VMwareHostname") {
            None => None,
            Some(hostname) => {
                let port = match section.get("VMwarePort") {
                    None => None,
                    Some(p) => Some(
                        p.parse::<u16>()
                            .map_err(|_| section.invalid("VMwarePort", p))?,
                    ),
                };
                Some(RemoteHost {
                    hostname: hostname.to_string(),
                    port,
                    username: section.get("VMwareUsername").unwrap_or_default().to_string(),
                    password: section.get("VMwarePassword").unwrap_or_default().to_string(),
                })
            }
        };

        Ok(Self {
            vmware_type: section.get("VMwareType").unwrap_or("ws").to_string(),
            remote,
            register_vm: section.get_bool("VMwareRegisterVM", false)?,
            vmrun_path: PathBuf::from(section.get("VmrunPath").unwrap_or("vmrun")),
            power_on_grace: section.get_secs("PowerOnGraceSeconds", DEFAULT_POWER_ON_GRACE_SECS)?,
            power_on_responder: section.get("PowerOnResponder").map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// Assignment config
// ---------------------------------------------------------------------------

/// Submission intake shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// The controller copies `archive.zip` into the guest itself.
    Normal,
    /// The archive was pre-staged by an external retrieval step.
    Large,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Normal => "normal",
            StorageMode::Large => "large",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(StorageMode::Normal),
            "large" => Ok(StorageMode::Large),
            other => Err(format!("unknown storage type {other:?}")),
        }
    }
}

/// Where the external retrieval step fetches a large submission from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStorage {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub base_path: String,
    pub unpack: bool,
}

/// Immutable per-assignment settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentSpec {
    pub id: String,
    pub machine: String,
    /// Bound for every script of every phase.
    pub timeout: Duration,
    pub revert_snapshot: bool,
    /// Bound for the guest tools readiness wait.
    pub tools_timeout: Duration,
    /// Pause between login and the first file transfer.
    pub settle_delay: Duration,
    pub storage: StorageMode,
    pub remote: Option<RemoteStorage>,
    /// Host auxiliary command; resolved from the assignment, then the machine.
    pub host_command: Option<String>,
}

impl AssignmentSpec {
    /// Build from an `[assignment <id>]` section. `machine_host_command` is the
    /// fallback auxiliary command declared by the target machine.
    pub fn from_section(
        id: &str,
        section: &ConfigSection,
        machine_host_command: Option<&str>,
    ) -> ConfigResult<Self> {
        let storage = match section.get("StorageType") {
            None => StorageMode::Normal,
            Some(v) => v
                .parse::<StorageMode>()
                .map_err(|_| section.invalid("StorageType", v))?,
        };

        let remote = if storage == StorageMode::Large {
            match section.get("StorageHost") {
                None => None,
                Some(host) => {
                    let port = section.get_u64("StoragePort", 22)?;
                    let port = u16::try_from(port)
                        .map_err(|_| section.invalid("StoragePort", &port.to_string()))?;
                    Some(RemoteStorage {
                        host: host.to_string(),
                        port,
                        username: section.get("StorageUsername").unwrap_or_default().to_string(),
                        base_path: section.get("StorageBasepath").unwrap_or_default().to_string(),
                        unpack: section.get_bool("Unpack", false)?,
                    })
                }
            }
        } else {
            None
        };

        let timeout_secs = section.require("Timeout")?;
        let timeout = timeout_secs
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| section.invalid("Timeout", timeout_secs))?;

        Ok(Self {
            id: id.to_string(),
            machine: section.require("Machine")?.to_string(),
            timeout,
            revert_snapshot: section.get_bool("RevertToSnapshot", true)?,
            tools_timeout: section.get_secs("ToolsTimeout", DEFAULT_TOOLS_TIMEOUT_SECS)?,
            settle_delay: section.get_secs("SettleDelay", 0)?,
            storage,
            remote,
            host_command: section
                .get("HostCommand")
                .or(machine_host_command)
                .map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// Machine config
// ---------------------------------------------------------------------------

/// Where the guest descriptor comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorSource {
    /// Pinned in the machine configuration.
    Pinned(PathBuf),
    /// Travels with the bundle (large submissions); searched at run time.
    FromBundle,
}

/// Guest account used for login and every in-guest operation.
#[derive(Clone, PartialEq, Eq)]
pub struct GuestCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identifies one guest image and how to work inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub id: String,
    pub descriptor: DescriptorSource,
    pub credentials: GuestCredentials,
    pub shell_path: String,
    /// Guest staging directory as seen by the file copy primitives.
    pub base_dir: GuestDir,
    /// The same directory as seen from inside `shell_path`.
    pub home_in_shell: String,
    pub host_command: Option<String>,
}

impl MachineSpec {
    pub fn from_section(id: &str, section: &ConfigSection) -> ConfigResult<Self> {
        let descriptor = match section.get("VMPath") {
            Some(path) => DescriptorSource::Pinned(PathBuf::from(path)),
            None => DescriptorSource::FromBundle,
        };

        let base = section.require("GuestBasePath")?;
        let base_dir = GuestDir::new(base).map_err(|_| section.invalid("GuestBasePath", base))?;

        let home_in_shell = match section.get("GuestHomeInShell") {
            Some(home) => home.to_string(),
            None => base.trim_end_matches(['/', '\\']).to_string(),
        };

        Ok(Self {
            id: id.to_string(),
            descriptor,
            credentials: GuestCredentials {
                user: section.require("GuestUser")?.to_string(),
                password: section.require("GuestPassword")?.to_string(),
            },
            shell_path: section.get("GuestShellPath").unwrap_or(DEFAULT_SHELL).to_string(),
            base_dir,
            home_in_shell,
            host_command: section.get("HostCommand").map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// Course config
// ---------------------------------------------------------------------------

/// Read-only view over a course's `course-config`.
#[derive(Debug, Clone)]
pub struct CourseConfig {
    doc: IniDocument,
}

impl CourseConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        Ok(Self {
            doc: IniDocument::load(path)?,
        })
    }

    pub fn from_document(doc: IniDocument) -> Self {
        Self { doc }
    }

    /// The `[Tester]` section; a missing section means host-local defaults.
    pub fn tester(&self) -> ConfigResult<TesterSpec> {
        match self.doc.section("Tester") {
            Some(section) => TesterSpec::from_section(section),
            None => Ok(TesterSpec::default()),
        }
    }

    pub fn machine(&self, id: &str) -> ConfigResult<MachineSpec> {
        let section = self.doc.require_section(&format!("machine {id}"))?;
        MachineSpec::from_section(id, section)
    }

    /// Resolve an assignment together with its target machine.
    pub fn assignment(&self, id: &str) -> ConfigResult<(AssignmentSpec, MachineSpec)> {
        let section = self.doc.require_section(&format!("assignment {id}"))?;
        let machine_id = section.require("Machine")?;
        let machine = self.machine(machine_id)?;
        let assignment =
            AssignmentSpec::from_section(id, section, machine.host_command.as_deref())?;
        Ok((assignment, machine))
    }
}
