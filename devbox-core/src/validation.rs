//! Validation and derivation of names that end up in OS commands or proxy rules.
//!
//! Everything here runs before a name reaches `useradd`, a unit file or the route
//! artifact, so the checks are strict allow-lists rather than escape routines.

use crate::error::{ProvisionError, Result};

/// Maximum length of a Linux account name.
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum length of one DNS label.
pub const MAX_LABEL_LEN: usize = 63;

/// Validate an OS account name (`[a-z_][a-z0-9_-]*`, at most 32 characters).
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(ProvisionError::InvalidInput(format!(
            "Username must be between 1 and {} characters",
            MAX_USERNAME_LEN
        )));
    }

    let mut chars = username.chars();
    let first = chars.next().unwrap_or('-');
    if !(first.is_ascii_lowercase() || first == '_') {
        return Err(ProvisionError::InvalidInput(format!(
            "Username '{}' must start with a lowercase letter or underscore",
            username
        )));
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err(ProvisionError::InvalidInput(format!(
            "Username '{}' contains invalid characters",
            username
        )));
    }

    Ok(())
}

/// Validate a hostname according to RFC 1123 rules
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(ProvisionError::InvalidInput(
            "Hostname must be between 1 and 253 characters".to_string(),
        ));
    }

    if hostname.starts_with('.') || hostname.ends_with('.') {
        return Err(ProvisionError::InvalidInput(
            "Hostname cannot start or end with a dot".to_string(),
        ));
    }

    for label in hostname.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(ProvisionError::InvalidInput(format!(
                "Hostname labels must be between 1 and {} characters",
                MAX_LABEL_LEN
            )));
        }

        if label.starts_with('-') || label.ends_with('-') {
            return Err(ProvisionError::InvalidInput(
                "Hostname labels cannot start or end with a hyphen".to_string(),
            ));
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ProvisionError::InvalidInput(format!(
                "Hostname label '{}' contains invalid characters (only alphanumeric and '-' allowed)",
                label
            )));
        }
    }

    Ok(())
}

/// Validate a package, extension or similar identifier passed as a single argv entry.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | ':' | '@' | '=');
    if value.is_empty() || value.starts_with('-') || !value.chars().all(allowed) {
        return Err(ProvisionError::InvalidInput(format!(
            "Invalid {} name: '{}'",
            kind, value
        )));
    }
    Ok(())
}

/// Lowercase `raw`, map anything outside `[a-z0-9]` to `sep` and collapse runs.
fn slugify(raw: &str, sep: char) -> String {
    let mut slug = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(|c| c.to_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
        } else if !slug.ends_with(sep) && !slug.is_empty() {
            slug.push(sep);
        }
    }
    slug.trim_end_matches(sep).to_string()
}

/// Derive the OS account name for a tenant's workspace, e.g. `acme` + `dev1` -> `acme_dev1`.
pub fn derive_username(tenant: &str, workspace_name: &str) -> Result<String> {
    let tenant = slugify(tenant, '_');
    let name = slugify(workspace_name, '_');
    if name.is_empty() {
        return Err(ProvisionError::InvalidInput(format!(
            "Workspace name '{}' has no usable characters",
            workspace_name
        )));
    }

    let mut username = if tenant.is_empty() {
        name
    } else {
        format!("{}_{}", tenant, name)
    };
    if username.starts_with(|c: char| c.is_ascii_digit()) {
        username.insert(0, 'u');
    }
    username.truncate(MAX_USERNAME_LEN);
    let username = username.trim_end_matches('_').to_string();

    validate_username(&username)?;
    Ok(username)
}

/// Derive the public hostname, e.g. `dev1`, `acme`, `ws.example.com` -> `dev1-acme.ws.example.com`.
pub fn derive_hostname(tenant: &str, workspace_name: &str, base_domain: &str) -> Result<String> {
    let mut label = slugify(&format!("{} {}", workspace_name, tenant), '-');
    label.truncate(MAX_LABEL_LEN);
    let label = label.trim_end_matches('-');
    let hostname = format!("{}.{}", label, base_domain.trim_matches('.'));
    validate_hostname(&hostname)?;
    Ok(hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_username() {
        assert!(validate_username("acme_dev1").is_ok());
        assert!(validate_username("_svc").is_ok());
        assert!(validate_username("a-b").is_ok());

        assert!(validate_username("").is_err());
        assert!(validate_username("1abc").is_err());
        assert!(validate_username("Acme").is_err());
        assert!(validate_username("acme dev").is_err());
        assert!(validate_username("root;rm").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("dev1-acme.ws.example.com").is_ok());
        assert!(validate_hostname("localhost").is_ok());

        assert!(validate_hostname("-example.com").is_err());
        assert!(validate_hostname("example-.com").is_err());
        assert!(validate_hostname("exam ple.com").is_err());
        assert!(validate_hostname(".example.com").is_err());
        assert!(validate_hostname("a..b").is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("package", "build-essential").is_ok());
        assert!(validate_identifier("extension", "ms-python.python").is_ok());
        assert!(validate_identifier("package", "libssl3=3.0.2").is_ok());

        assert!(validate_identifier("package", "").is_err());
        assert!(validate_identifier("package", "--allow-unauthenticated").is_err());
        assert!(validate_identifier("package", "git; curl evil").is_err());
    }

    #[test]
    fn test_derive_username() {
        assert_eq!(derive_username("acme", "dev1").unwrap(), "acme_dev1");
        assert_eq!(derive_username("Acme Corp", "My Box!").unwrap(), "acme_corp_my_box");
        assert_eq!(derive_username("", "7days").unwrap(), "u7days");
        assert!(derive_username("acme", "!!!").is_err());

        let long = derive_username(&"t".repeat(40), "dev").unwrap();
        assert!(long.len() <= MAX_USERNAME_LEN);
        assert!(validate_username(&long).is_ok());
    }

    #[test]
    fn test_derive_hostname() {
        assert_eq!(
            derive_hostname("acme", "dev1", "ws.example.com").unwrap(),
            "dev1-acme.ws.example.com"
        );
        assert_eq!(
            derive_hostname("Acme Corp", "Data_Lab", ".ws.example.com.").unwrap(),
            "data-lab-acme-corp.ws.example.com"
        );
    }
}
