// Elevation check. The CLI refuses to run unelevated.

use log::debug;

#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    debug!("[PHASE: preflight] [STEP: privilege] euid={}", euid);
    euid == 0
}

/// `net session` only succeeds from an elevated token.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    let status = std::process::Command::new("net")
        .arg("session")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    let elevated = matches!(status, Ok(s) if s.success());
    debug!(
        "[PHASE: preflight] [STEP: privilege] net session elevated={}",
        elevated
    );
    elevated
}

#[cfg(not(any(unix, windows)))]
pub fn is_elevated() -> bool {
    false
}
