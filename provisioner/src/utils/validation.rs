// Input validation utilities

use anyhow::Result;
use regex::Regex;

/// Validate a service name (used as an OS identifier and in file names).
pub fn validate_service_name(name: &str) -> Result<()> {
    let s = name.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Service name cannot be empty"));
    }
    if s.len() > 80 {
        return Err(anyhow::anyhow!("Service name cannot exceed 80 characters"));
    }

    let re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$")
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile service name regex: {}", e))?;
    if !re.is_match(s) {
        return Err(anyhow::anyhow!(
            "Service name '{}' may only contain letters, digits, '.', '_' and '-'",
            s
        ));
    }
    Ok(())
}

/// A release version must be usable as a URL path segment and a file name.
pub fn is_valid_release_version(version: &str) -> bool {
    match Regex::new(r"^[0-9A-Za-z][0-9A-Za-z.+-]*$") {
        Ok(re) => re.is_match(version),
        Err(_) => false,
    }
}

/// Validate a listening port pair.
pub fn validate_ports(primary: u16, secondary: u16) -> Result<()> {
    if primary == 0 || secondary == 0 {
        return Err(anyhow::anyhow!("Ports must be between 1 and 65535"));
    }
    if primary == secondary {
        return Err(anyhow::anyhow!(
            "Primary and secondary ports must differ (both {})",
            primary
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names() {
        assert!(validate_service_name("sentinel-agent").is_ok());
        assert!(validate_service_name("Sentinel.Agent_2").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("bad name").is_err());
        assert!(validate_service_name("-leading").is_err());
        assert!(validate_service_name("a/b").is_err());
    }

    #[test]
    fn release_versions() {
        assert!(is_valid_release_version("1.2.3"));
        assert!(is_valid_release_version("1.2.3-rc.1+build.5"));
        assert!(!is_valid_release_version(""));
        assert!(!is_valid_release_version("1.2.3/../../etc"));
        assert!(!is_valid_release_version("1.2 3"));
    }

    #[test]
    fn ports() {
        assert!(validate_ports(3000, 3001).is_ok());
        assert!(validate_ports(3000, 3000).is_err());
        assert!(validate_ports(0, 3001).is_err());
    }
}
