//! Local npm-package fallback installation when a Smithery-hosted server is
//! unreachable or gated behind OAuth — spec §3, §4.5.
//!
//! Grounded on `local_installer.py::LocalMCPInstaller` for the exact
//! validation regex, subprocess probes, camelCase→kebab-case flag
//! conversion, and env-var enrichment order; prompting is restated with
//! `dialoguer::Input`, mirrored on `chat-cli`'s interactive-prompt call
//! sites in its agent-configuration flows.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::InstallError;
use crate::server_spec::SubprocessSpec;

const NPM_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(5);
const PACKAGE_EXISTS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct ConfigField {
    pub description: Option<String>,
    pub env_var: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigRequirements {
    pub required: Vec<String>,
    pub properties: HashMap<String, ConfigField>,
}

fn npm_package_name_regex() -> Regex {
    Regex::new(r"(?i)^(@[a-z0-9\-_.]+/)?[a-z0-9\-_.]+$").expect("static regex is valid")
}

pub struct LocalInstaller {
    interactive: bool,
}

impl Default for LocalInstaller {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LocalInstaller {
    pub fn new(interactive: bool) -> Self {
        Self { interactive }
    }

    /// A qualified name doubles as its own npm package name; only its shape
    /// needs checking, not a lookup.
    pub fn is_npm_installable(&self, qualified_name: &str) -> bool {
        npm_package_name_regex().is_match(qualified_name)
    }

    pub fn extract_config_requirements(&self, server_metadata: &Value) -> ConfigRequirements {
        let Some(connection) = server_metadata.get("connections").and_then(|c| c.as_array()).and_then(|a| a.first())
        else {
            return ConfigRequirements::default();
        };
        let Some(schema) = connection.get("configSchema") else {
            return ConfigRequirements::default();
        };

        let required = schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let properties = schema
            .get("properties")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .map(|(field, props)| {
                        let field_props = ConfigField {
                            description: props.get("description").and_then(|v| v.as_str()).map(str::to_string),
                            env_var: props.get("envVar").and_then(|v| v.as_str()).map(str::to_string),
                        };
                        (field.clone(), field_props)
                    })
                    .collect()
            })
            .unwrap_or_default();

        ConfigRequirements { required, properties }
    }

    /// `fieldName` → `--field-name`. Matches the original's
    /// `re.sub(r"([A-Z])", r"-\1", field).lower()`.
    fn camel_to_kebab_flag(field: &str) -> String {
        let mut kebab = String::new();
        for c in field.chars() {
            if c.is_ascii_uppercase() {
                kebab.push('-');
                kebab.push(c.to_ascii_lowercase());
            } else {
                kebab.push(c);
            }
        }
        format!("--{kebab}")
    }

    pub fn build_npx_command(
        &self,
        package_name: &str,
        requirements: &ConfigRequirements,
        user_config: &HashMap<String, String>,
    ) -> Result<Vec<String>, InstallError> {
        for field in &requirements.required {
            if user_config.contains_key(field) {
                continue;
            }
            let satisfied_by_env = requirements
                .properties
                .get(field)
                .and_then(|p| p.env_var.as_ref())
                .is_some_and(|env_var| std::env::var(env_var).is_ok());
            if satisfied_by_env {
                continue;
            }
            return Err(InstallError::MissingConfig(field.clone()));
        }

        let mut cmd = vec!["npx".to_string(), "-y".to_string(), package_name.to_string()];
        for (field, value) in user_config {
            if requirements.properties.contains_key(field) {
                cmd.push(Self::camel_to_kebab_flag(field));
                cmd.push(value.clone());
            }
        }
        Ok(cmd)
    }

    pub fn create_stdio_server_spec(
        &self,
        package_name: &str,
        requirements: &ConfigRequirements,
        user_config: &HashMap<String, String>,
    ) -> Result<SubprocessSpec, InstallError> {
        let cmd = self.build_npx_command(package_name, requirements, user_config)?;

        let mut env = HashMap::new();
        for (field, value) in user_config {
            if let Some(env_var) = requirements.properties.get(field).and_then(|p| p.env_var.as_ref()) {
                env.insert(env_var.clone(), value.clone());
            }
        }

        Ok(SubprocessSpec {
            command: cmd[0].clone(),
            args: cmd[1..].to_vec(),
            env,
            cwd: None,
            keep_alive: true,
        })
    }

    pub async fn is_npm_available(&self) -> bool {
        run_with_timeout("npx", &["--version"], NPM_AVAILABLE_TIMEOUT).await
    }

    pub async fn verify_package_exists(&self, package_name: &str) -> bool {
        run_with_timeout("npm", &["view", package_name, "name"], PACKAGE_EXISTS_TIMEOUT).await
    }

    /// The full fallback sequence: shape check, npm availability, package
    /// existence, env-var enrichment, then (if interactive) prompting for
    /// whatever required fields remain unset. Returns `Ok(None)` for any
    /// non-fatal reason local installation isn't viable, `Err` only for
    /// explicit user cancellation.
    pub async fn attempt_local_installation(
        &self,
        qualified_name: &str,
        server_metadata: &Value,
        user_config: HashMap<String, String>,
    ) -> Result<Option<SubprocessSpec>, InstallError> {
        if !self.is_npm_installable(qualified_name) {
            debug!("'{qualified_name}' is not a valid npm package name, skipping local install");
            return Ok(None);
        }

        if !self.is_npm_available().await {
            debug!("npx is not available on this system, skipping local install");
            return Ok(None);
        }

        if !self.verify_package_exists(qualified_name).await {
            debug!("npm package '{qualified_name}' does not exist, skipping local install");
            return Ok(None);
        }

        let requirements = self.extract_config_requirements(server_metadata);
        let mut enriched = user_config;

        for (field, field_props) in &requirements.properties {
            if enriched.contains_key(field) {
                continue;
            }
            if let Some(env_var) = &field_props.env_var {
                if let Ok(value) = std::env::var(env_var) {
                    enriched.insert(field.clone(), value);
                }
            }
        }

        if self.interactive {
            for field in &requirements.required {
                if enriched.contains_key(field) {
                    continue;
                }
                match self.prompt_for_field(qualified_name, field, &requirements) {
                    Some(value) if !value.trim().is_empty() => {
                        enriched.insert(field.clone(), value);
                    },
                    Some(_) => {},
                    None => return Err(InstallError::Cancelled),
                }
            }
        }

        match self.create_stdio_server_spec(qualified_name, &requirements, &enriched) {
            Ok(spec) => Ok(Some(spec)),
            Err(InstallError::MissingConfig(field)) => {
                warn!("cannot install '{qualified_name}': missing required configuration '{field}'");
                Ok(None)
            },
            Err(other) => Err(other),
        }
    }

    /// Returns `None` on EOF/interrupt (treated as cancellation), `Some("")`
    /// if the user submits an empty value.
    fn prompt_for_field(&self, package_name: &str, field: &str, requirements: &ConfigRequirements) -> Option<String> {
        let field_props = requirements.properties.get(field);
        let description = field_props.and_then(|p| p.description.clone()).unwrap_or_else(|| field.to_string());

        println!("\nConfiguration required for {package_name}");
        println!("   Field: {field}");
        println!("   Description: {description}");
        if let Some(env_var) = field_props.and_then(|p| p.env_var.as_ref()) {
            println!("   Environment variable: {env_var}");
            println!("   (You can set {env_var} to avoid this prompt)");
        }

        dialoguer::Input::<String>::new()
            .with_prompt(format!("Enter value for {field}"))
            .allow_empty(true)
            .interact_text()
            .ok()
    }
}

async fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> bool {
    let mut command = tokio::process::Command::new(program);
    command.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

    match tokio::time::timeout(timeout, command.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(_)) => false,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_scoped_and_unscoped_npm_names() {
        let installer = LocalInstaller::new(false);
        assert!(installer.is_npm_installable("@upstash/context7-mcp"));
        assert!(installer.is_npm_installable("weather-mcp"));
        assert!(!installer.is_npm_installable("not a package name"));
        assert!(!installer.is_npm_installable("has/two/slashes/@wrong"));
    }

    #[test]
    fn camel_case_fields_become_kebab_case_flags() {
        assert_eq!(LocalInstaller::camel_to_kebab_flag("apiKey"), "--api-key");
        assert_eq!(LocalInstaller::camel_to_kebab_flag("token"), "--token");
    }

    #[test]
    fn missing_required_field_without_env_fallback_is_an_error() {
        let installer = LocalInstaller::new(false);
        let mut properties = HashMap::new();
        properties.insert("apiKey".to_string(), ConfigField { description: None, env_var: None });
        let requirements = ConfigRequirements { required: vec!["apiKey".to_string()], properties };

        let err = installer.build_npx_command("@foo/bar", &requirements, &HashMap::new()).unwrap_err();
        assert!(matches!(err, InstallError::MissingConfig(f) if f == "apiKey"));
    }

    #[test]
    fn required_field_satisfied_by_env_var_skips_cli_flag() {
        std::env::set_var("TEST_INSTALLER_API_KEY", "secret");
        let installer = LocalInstaller::new(false);
        let mut properties = HashMap::new();
        properties.insert(
            "apiKey".to_string(),
            ConfigField { description: None, env_var: Some("TEST_INSTALLER_API_KEY".to_string()) },
        );
        let requirements = ConfigRequirements { required: vec!["apiKey".to_string()], properties };

        let cmd = installer.build_npx_command("@foo/bar", &requirements, &HashMap::new()).unwrap();
        assert_eq!(cmd, vec!["npx", "-y", "@foo/bar"]);
        std::env::remove_var("TEST_INSTALLER_API_KEY");
    }

    #[test]
    fn extract_config_requirements_reads_first_connection_schema() {
        let installer = LocalInstaller::new(false);
        let metadata = serde_json::json!({
            "connections": [{
                "configSchema": {
                    "required": ["apiKey"],
                    "properties": {"apiKey": {"description": "API key", "envVar": "FOO_KEY"}}
                }
            }]
        });

        let requirements = installer.extract_config_requirements(&metadata);
        assert_eq!(requirements.required, vec!["apiKey".to_string()]);
        assert_eq!(requirements.properties["apiKey"].env_var.as_deref(), Some("FOO_KEY"));
    }

    #[test]
    fn create_stdio_server_spec_routes_config_to_env() {
        let installer = LocalInstaller::new(false);
        let mut properties = HashMap::new();
        properties.insert(
            "apiKey".to_string(),
            ConfigField { description: None, env_var: Some("FOO_KEY".to_string()) },
        );
        let requirements = ConfigRequirements { required: vec![], properties };
        let mut user_config = HashMap::new();
        user_config.insert("apiKey".to_string(), "secret".to_string());

        let spec = installer.create_stdio_server_spec("@foo/bar", &requirements, &user_config).unwrap();
        assert_eq!(spec.command, "npx");
        assert_eq!(spec.env.get("FOO_KEY"), Some(&"secret".to_string()));
    }
}
