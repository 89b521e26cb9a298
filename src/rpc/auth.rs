use anyhow::Result;
use std::path::Path;
use uuid::Uuid;

/// Return the auth token for this daemon instance.
///
/// On first call, generates a random 32-character hex token and writes it to
/// `{data_dir}/auth_token` with user-only read/write permissions (mode 0600
/// on Unix). On subsequent calls, reads and returns the existing token.
///
/// The token file must be kept secret — it is the only credential protecting
/// the RPC port from unauthorized access by other processes on the same
/// machine.
pub fn get_or_create_token(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("auth_token");

    if path.exists() {
        let token = std::fs::read_to_string(&path)?.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    // Generate a new token (UUID v4, hex without dashes = 32 chars)
    let token = Uuid::new_v4().to_string().replace('-', "");

    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &token)?;

    // Restrict to owner read/write only on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(token)
}

/// Validate a `Bearer <token>` authorization string against the expected token.
/// Returns `true` if the header value is exactly `"Bearer {expected_token}"`.
pub fn validate_bearer(header_value: &str, expected_token: &str) -> bool {
    header_value
        .strip_prefix("Bearer ")
        .map(|t| t == expected_token)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_then_reuses_token() {
        let dir = TempDir::new().unwrap();
        let first = get_or_create_token(dir.path()).unwrap();
        assert_eq!(first.len(), 32);
        let second = get_or_create_token(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        get_or_create_token(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join("auth_token"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn validate_bearer_requires_exact_match() {
        assert!(validate_bearer("Bearer abc123", "abc123"));
        assert!(!validate_bearer("Bearer abc124", "abc123"));
        assert!(!validate_bearer("bearer abc123", "abc123"));
        assert!(!validate_bearer("abc123", "abc123"));
        assert!(!validate_bearer("", "abc123"));
    }
}
