//! `mcp-servers.json`: loading, validation, and saving.
//!
//! The file lives at `<data_dir>/toolbridge/mcp-servers.json` unless a path
//! is given explicitly. A missing file is an empty configuration. An invalid
//! one is logged and treated as empty by [`load_config`], so a bad edit never
//! stops the host from starting; [`read_config`] is the strict variant.

use std::path::{Path, PathBuf};

use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};

/// File name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "mcp-servers.json";

/// `<data_dir>/toolbridge/mcp-servers.json`.
pub fn default_config_path() -> PathBuf {
    crate::data_dir().join(CONFIG_FILE_NAME)
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Outcome of [`validate_config`]. Errors make a configuration unusable;
/// warnings are logged and otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Structural checks on a configuration.
pub fn validate_config(config: &McpServersConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.servers.is_empty() {
        report.warnings.push("no MCP servers configured".to_string());
    }

    for (name, server) in &config.servers {
        validate_server(name, server, &mut report);
    }

    report
}

fn validate_server(name: &str, server: &ServerConfig, report: &mut ValidationReport) {
    if name.trim().is_empty() {
        report.errors.push("server name must not be empty".to_string());
    }

    let command = server.command.trim();
    if command.is_empty() {
        report
            .errors
            .push(format!("server '{name}': command is required"));
        return;
    }

    if !is_command_accessible(command) {
        report.warnings.push(format!(
            "server '{name}': command '{command}' may not be accessible"
        ));
    }

    if server.args.iter().any(|arg| arg.is_empty()) {
        report
            .errors
            .push(format!("server '{name}': args must not contain empty values"));
    }

    if server.env.keys().any(|key| key.trim().is_empty()) {
        report.errors.push(format!(
            "server '{name}': environment variable names must not be empty"
        ));
    }
}

/// Only absolute paths are checked; bare names are resolved through `PATH`
/// at spawn time.
fn is_command_accessible(command: &str) -> bool {
    let path = Path::new(command);
    if !path.is_absolute() {
        return true;
    }
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && is_executable(&meta),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

// ─── Load / Save ────────────────────────────────────────────────────────────

/// Read and parse the configuration file.
///
/// A missing file yields an empty configuration; unreadable or unparsable
/// content is an error. No validation is applied.
pub fn read_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "MCP configuration not found, using empty configuration");
            return Ok(McpServersConfig::default());
        }
        Err(e) => {
            return Err(McpError::ConfigError {
                reason: format!("failed to read {}: {e}", path.display()),
            })
        }
    };

    serde_json::from_str(&content).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse {}: {e}", path.display()),
    })
}

/// Load, validate, and return the configuration, degrading to empty.
pub fn load_config(path: &Path) -> McpServersConfig {
    let config = match read_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load MCP configuration, using empty configuration");
            return McpServersConfig::default();
        }
    };

    let report = validate_config(&config);
    if !report.is_valid() {
        tracing::error!(
            path = %path.display(),
            errors = ?report.errors,
            "MCP configuration is invalid, using empty configuration"
        );
        return McpServersConfig::default();
    }
    if report.has_warnings() {
        tracing::warn!(warnings = ?report.warnings, "MCP configuration warnings");
    }

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        "MCP configuration loaded"
    );
    config
}

/// Validate and write the configuration as pretty-printed JSON, creating
/// parent directories as needed. Invalid configurations are refused.
pub fn save_config(path: &Path, config: &McpServersConfig) -> Result<ValidationReport, McpError> {
    let report = validate_config(config);
    if !report.is_valid() {
        return Err(McpError::ConfigError {
            reason: format!(
                "refusing to save invalid configuration: {}",
                report.errors.join("; ")
            ),
        });
    }
    if report.has_warnings() {
        tracing::warn!(warnings = ?report.warnings, "MCP configuration warnings");
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| McpError::ConfigError {
            reason: format!("failed to create {}: {e}", parent.display()),
        })?;
    }

    let json = serde_json::to_string_pretty(config).map_err(|e| McpError::ConfigError {
        reason: format!("failed to serialize configuration: {e}"),
    })?;
    std::fs::write(path, json).map_err(|e| McpError::ConfigError {
        reason: format!("failed to write {}: {e}", path.display()),
    })?;

    tracing::info!(path = %path.display(), servers = config.servers.len(), "MCP configuration saved");
    Ok(report)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server(command: &str) -> ServerConfig {
        ServerConfig {
            command: command.to_string(),
            ..Default::default()
        }
    }

    fn config_with(name: &str, server: ServerConfig) -> McpServersConfig {
        let mut config = McpServersConfig::default();
        config.servers.insert(name.to_string(), server);
        config
    }

    #[test]
    fn test_default_path_file_name() {
        let path = default_config_path();
        assert!(path.ends_with(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_empty_config_warns() {
        let report = validate_config(&McpServersConfig::default());
        assert!(report.is_valid());
        assert_eq!(report.warnings, vec!["no MCP servers configured"]);
    }

    #[test]
    fn test_empty_command_is_error() {
        let report = validate_config(&config_with("time", server("   ")));
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("command is required"));
    }

    #[test]
    fn test_empty_arg_and_env_key_are_errors() {
        let mut s = server("node");
        s.args = vec!["server.js".into(), String::new()];
        s.env.insert(" ".into(), "x".into());
        let report = validate_config(&config_with("time", s));
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_missing_absolute_command_warns() {
        let report = validate_config(&config_with("ghost", server("/nonexistent/bin/ghost")));
        assert!(report.is_valid());
        assert!(report.warnings[0].contains("may not be accessible"));
    }

    #[test]
    fn test_relative_command_not_checked() {
        let report = validate_config(&config_with("time", server("node")));
        assert!(report.is_valid());
        assert!(!report.has_warnings());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_absolute_command_warns() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("server.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        let report = validate_config(&config_with("sh", server(script.to_str().unwrap())));
        assert!(report.has_warnings());

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let report = validate_config(&config_with("sh", server(script.to_str().unwrap())));
        assert!(!report.has_warnings());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        assert!(read_config(&path).unwrap().servers.is_empty());
        assert!(load_config(&path).servers.is_empty());
    }

    #[test]
    fn test_malformed_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(read_config(&path), Err(McpError::ConfigError { .. })));
        assert!(load_config(&path).servers.is_empty());
    }

    #[test]
    fn test_invalid_config_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"mcpServers": {"bad": {"command": ""}}}"#).unwrap();

        assert_eq!(read_config(&path).unwrap().servers.len(), 1);
        assert!(load_config(&path).servers.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join(CONFIG_FILE_NAME);

        let mut s = server("node");
        s.args = vec!["test-mcp-server.js".into()];
        s.env.insert("NODE_ENV".into(), "production".into());
        let config = config_with("time", s);

        save_config(&path, &config).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"mcpServers\""));
        assert!(written.contains('\n'));

        assert_eq!(load_config(&path), config);
    }

    #[test]
    fn test_save_refuses_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);

        let err = save_config(&path, &config_with("bad", server(""))).unwrap_err();
        assert!(err.to_string().contains("command is required"));
        assert!(!path.exists());
    }
}
