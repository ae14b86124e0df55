//! OS system-proxy integration
//!
//! A capability interface plus a best-effort, command-driven
//! implementation per OS family. `enable` snapshots the current settings
//! first; `disable` restores what the snapshot captured. Every operation
//! is fallible and none of them may block shutdown: callers log failures
//! and move on. A crashed predecessor may have left stale proxy settings
//! behind; `enable`/`disable` overwrite state rather than assuming it.

use std::collections::HashMap;
use std::io;
use std::process::Command;

/// System proxy capability
pub trait SystemProxy: Send {
    /// Capture the current OS proxy settings.
    fn snapshot(&mut self) -> io::Result<()>;
    /// Point the OS at the given proxy addresses, snapshotting first if
    /// not already held.
    fn enable(&mut self, http_addr: &str, socks_addr: Option<&str>) -> io::Result<()>;
    /// Restore the snapshot (or turn the proxy off when none is held).
    fn disable(&mut self) -> io::Result<()>;
}

/// A no-op integrator, used when `--sys-proxy=false`.
#[derive(Default)]
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn snapshot(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn enable(&mut self, _: &str, _: Option<&str>) -> io::Result<()> {
        Ok(())
    }
    fn disable(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Command-driven implementation for the current OS family.
#[derive(Default)]
pub struct OsSystemProxy {
    enabled: bool,
    snapshot_held: bool,
    saved: HashMap<String, String>,
}

impl OsSystemProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemProxy for OsSystemProxy {
    fn snapshot(&mut self) -> io::Result<()> {
        self.saved = platform::snapshot();
        self.snapshot_held = true;
        Ok(())
    }

    fn enable(&mut self, http_addr: &str, socks_addr: Option<&str>) -> io::Result<()> {
        if self.enabled {
            return Ok(());
        }
        if !self.snapshot_held {
            self.snapshot()?;
        }

        platform::enable(http_addr, socks_addr)?;
        self.enabled = true;
        log::info!("system proxy set to {}", http_addr);
        Ok(())
    }

    fn disable(&mut self) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        platform::disable(&self.saved)?;
        self.enabled = false;
        log::info!("system proxy restored");
        Ok(())
    }
}

/// Run a command, returning its stdout; failures bubble as io errors.
fn run(cmd: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(cmd).args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "{} {:?} failed: {}",
                cmd,
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command, ignoring failures (best-effort settings writes).
fn run_quiet(cmd: &str, args: &[&str]) {
    if let Err(e) = run(cmd, args) {
        log::debug!("system proxy command: {}", e);
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;

    const SCHEMA: &str = "org.gnome.system.proxy";

    pub fn snapshot() -> HashMap<String, String> {
        let mut saved = HashMap::new();
        for (key, schema, name) in [
            ("mode", SCHEMA, "mode"),
            ("http_host", "org.gnome.system.proxy.http", "host"),
            ("http_port", "org.gnome.system.proxy.http", "port"),
            ("https_host", "org.gnome.system.proxy.https", "host"),
            ("https_port", "org.gnome.system.proxy.https", "port"),
            ("socks_host", "org.gnome.system.proxy.socks", "host"),
            ("socks_port", "org.gnome.system.proxy.socks", "port"),
        ] {
            if let Ok(out) = run("gsettings", &["get", schema, name]) {
                saved.insert(key.to_string(), out.trim().to_string());
            }
        }
        saved
    }

    pub fn enable(http_addr: &str, socks_addr: Option<&str>) -> io::Result<()> {
        let (host, port) = split(http_addr)?;
        for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
            run_quiet("gsettings", &["set", schema, "host", &host]);
            run_quiet("gsettings", &["set", schema, "port", &port]);
        }
        if let Some(socks) = socks_addr {
            if let Ok((host, port)) = split(socks) {
                run_quiet("gsettings", &["set", "org.gnome.system.proxy.socks", "host", &host]);
                run_quiet("gsettings", &["set", "org.gnome.system.proxy.socks", "port", &port]);
            }
        }
        run_quiet("gsettings", &["set", SCHEMA, "ignore-hosts", "[]"]);
        run("gsettings", &["set", SCHEMA, "mode", "manual"]).map(|_| ())
    }

    pub fn disable(saved: &HashMap<String, String>) -> io::Result<()> {
        let mode = saved.get("mode").map(String::as_str).unwrap_or("'none'");
        run("gsettings", &["set", SCHEMA, "mode", mode]).map(|_| ())
    }

    fn split(addr: &str) -> io::Result<(String, String)> {
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                let host = if host.is_empty() || host == "0.0.0.0" {
                    "127.0.0.1"
                } else {
                    host
                };
                Ok((host.to_string(), port.to_string()))
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "bad proxy address")),
        }
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::*;

    pub fn snapshot() -> HashMap<String, String> {
        let mut saved = HashMap::new();
        for service in services() {
            if let Ok(out) = run("networksetup", &["-getwebproxy", &service]) {
                saved.insert(format!("http_{}", service), out);
            }
            if let Ok(out) = run("networksetup", &["-getsecurewebproxy", &service]) {
                saved.insert(format!("https_{}", service), out);
            }
        }
        saved
    }

    pub fn enable(http_addr: &str, socks_addr: Option<&str>) -> io::Result<()> {
        let (host, port) = match http_addr.rsplit_once(':') {
            Some((h, p)) => {
                let h = if h.is_empty() || h == "0.0.0.0" { "127.0.0.1" } else { h };
                (h.to_string(), p.to_string())
            }
            None => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad proxy address"))
            }
        };

        for service in services() {
            run_quiet("networksetup", &["-setproxybypassdomains", &service, "Empty"]);
            run_quiet("networksetup", &["-setwebproxy", &service, &host, &port]);
            run_quiet("networksetup", &["-setsecurewebproxy", &service, &host, &port]);
            if let Some(socks) = socks_addr {
                if let Some((sh, sp)) = socks.rsplit_once(':') {
                    let sh = if sh.is_empty() || sh == "0.0.0.0" { "127.0.0.1" } else { sh };
                    run_quiet("networksetup", &["-setsocksfirewallproxy", &service, sh, sp]);
                }
            }
            run_quiet("networksetup", &["-setwebproxystate", &service, "on"]);
            run_quiet("networksetup", &["-setsecurewebproxystate", &service, "on"]);
        }
        Ok(())
    }

    pub fn disable(_saved: &HashMap<String, String>) -> io::Result<()> {
        for service in services() {
            run_quiet("networksetup", &["-setwebproxystate", &service, "off"]);
            run_quiet("networksetup", &["-setsecurewebproxystate", &service, "off"]);
            run_quiet("networksetup", &["-setsocksfirewallproxystate", &service, "off"]);
        }
        Ok(())
    }

    fn services() -> Vec<String> {
        match run("networksetup", &["-listallnetworkservices"]) {
            Ok(out) => out
                .lines()
                .skip(1) // first line is a banner
                .filter(|l| !l.is_empty() && !l.starts_with('*'))
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use super::*;

    const REG_KEY: &str =
        r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    pub fn snapshot() -> HashMap<String, String> {
        let mut saved = HashMap::new();
        for (key, value) in [("enable", "ProxyEnable"), ("server", "ProxyServer")] {
            if let Ok(out) = run("reg", &["query", REG_KEY, "/v", value]) {
                saved.insert(key.to_string(), out);
            }
        }
        saved
    }

    pub fn enable(http_addr: &str, _socks_addr: Option<&str>) -> io::Result<()> {
        run(
            "reg",
            &["add", REG_KEY, "/v", "ProxyServer", "/t", "REG_SZ", "/d", http_addr, "/f"],
        )?;
        run(
            "reg",
            &["add", REG_KEY, "/v", "ProxyEnable", "/t", "REG_DWORD", "/d", "1", "/f"],
        )
        .map(|_| ())
    }

    pub fn disable(_saved: &HashMap<String, String>) -> io::Result<()> {
        run(
            "reg",
            &["add", REG_KEY, "/v", "ProxyEnable", "/t", "REG_DWORD", "/d", "0", "/f"],
        )
        .map(|_| ())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod platform {
    use super::*;

    pub fn snapshot() -> HashMap<String, String> {
        HashMap::new()
    }

    pub fn enable(_: &str, _: Option<&str>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "system proxy integration is not supported on this OS",
        ))
    }

    pub fn disable(_: &HashMap<String, String>) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_is_always_ok() {
        let mut p = NoopSystemProxy;
        assert!(p.snapshot().is_ok());
        assert!(p.enable("127.0.0.1:8080", None).is_ok());
        assert!(p.disable().is_ok());
    }

    #[test]
    fn disable_without_enable_is_a_no_op() {
        let mut p = OsSystemProxy::new();
        assert!(p.disable().is_ok());
    }
}
