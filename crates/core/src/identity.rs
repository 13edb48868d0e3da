//! Stable per-machine identity used to name the machine branch.
//!
//! Resolution order: explicit override, cached identity file, platform
//! hostname. The hostname result is normalized and written to the cache so the
//! identity survives later hostname changes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::IdentityError;

/// Normalized, branch-name-safe machine identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineId(String);

impl MachineId {
    /// Normalize arbitrary text. Returns `None` if nothing usable remains.
    pub fn normalize(raw: &str) -> Option<Self> {
        let mut id = String::with_capacity(raw.len());
        for c in raw.trim().chars().flat_map(char::to_lowercase) {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                id.push(c);
            } else if !id.is_empty() && !id.ends_with('-') {
                id.push('-');
            }
        }
        while id.ends_with('-') {
            id.pop();
        }
        if id.is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<prefix>/<id>`, e.g. `auto-sync/work-laptop`.
    pub fn branch_name(&self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self.0)
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves the [`MachineId`] for this machine.
#[derive(Debug, Clone)]
pub struct MachineIdentity {
    override_id: Option<String>,
    cache_path: PathBuf,
}

impl MachineIdentity {
    pub fn new(override_id: Option<String>, cache_path: impl AsRef<Path>) -> Self {
        Self {
            override_id,
            cache_path: cache_path.as_ref().to_path_buf(),
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Resolve using the platform hostname as the last resort.
    pub fn resolve(&self) -> Result<MachineId, IdentityError> {
        self.resolve_with(platform_hostname)
    }

    /// Resolve with an injected hostname lookup.
    pub fn resolve_with<F>(&self, hostname: F) -> Result<MachineId, IdentityError>
    where
        F: FnOnce() -> Option<String>,
    {
        if let Some(id) = self.override_id.as_deref().and_then(MachineId::normalize) {
            debug!(machine_id = %id, "using configured machine id");
            return Ok(id);
        }

        if let Some(id) = self.read_cache()? {
            debug!(machine_id = %id, "using cached machine id");
            return Ok(id);
        }

        let id = hostname()
            .as_deref()
            .and_then(MachineId::normalize)
            .ok_or(IdentityError::HostnameUnavailable)?;
        self.write_cache(&id)?;
        info!(machine_id = %id, cache = %self.cache_path.display(), "derived machine id from hostname");
        Ok(id)
    }

    fn read_cache(&self) -> Result<Option<MachineId>, IdentityError> {
        match fs::read_to_string(&self.cache_path) {
            Ok(contents) => {
                let id = MachineId::normalize(&contents);
                if id.is_none() {
                    warn!(cache = %self.cache_path.display(), "ignoring empty machine id cache");
                }
                Ok(id)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.cache_err(e)),
        }
    }

    fn write_cache(&self, id: &MachineId) -> Result<(), IdentityError> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.cache_err(e))?;
        }
        fs::write(&self.cache_path, format!("{id}\n")).map_err(|e| self.cache_err(e))
    }

    fn cache_err(&self, source: std::io::Error) -> IdentityError {
        IdentityError::CacheIo {
            path: self.cache_path.display().to_string(),
            source,
        }
    }
}

/// Platform-native stable hostname.
pub fn platform_hostname() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        // LocalHostName is stable across network changes, unlike gethostname.
        if let Ok(output) = std::process::Command::new("scutil")
            .args(["--get", "LocalHostName"])
            .output()
        {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if output.status.success() && !name.is_empty() {
                return Some(name);
            }
        }
    }

    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..len]).into_owned();
            if !name.is_empty() {
                return Some(name);
            }
        }
        None
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").ok().filter(|n| !n.is_empty())
    }
}
