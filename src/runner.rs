//! External process providers
//!
//! Each operation spawns `command args... <operation>`, writes a JSON request
//! to stdin and reads a JSON response from stdout:
//!
//! ```text
//! -> {"type": "...", "name": "...", "inputs": {...}, "prior": {...}}
//! <- {"attributes": {...}}
//! <- {"error": "...", "retryable": true}
//! ```

use resgraph::{Attributes, Provider, ProviderError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

#[derive(Debug, Serialize)]
struct Request<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    name: &'a str,
    inputs: &'a Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior: Option<&'a Attributes>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Response {
    Failure {
        error: String,
        #[serde(default)]
        retryable: bool,
    },
    Success {
        #[serde(default)]
        attributes: Attributes,
    },
}

/// Provider backed by an executable
#[derive(Debug, Clone)]
pub struct ProcessProvider {
    command: String,
    args: Vec<String>,
}

impl ProcessProvider {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn call(&self, operation: &str, request: &Request<'_>) -> Result<Attributes, ProviderError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ProviderError::permanent(format!("Could not encode request: {e}")))?;

        log::debug!(
            "Running {} {} {} for {}",
            self.command,
            self.args.join(" "),
            operation,
            request.name
        );

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ProviderError::permanent(format!("Failed to execute {}: {e}", self.command))
            })?;

        // The request is fed while stdout drains so neither pipe can fill up
        let stdin = child.stdin.take();
        let output = thread::scope(|scope| {
            if let Some(mut stdin) = stdin {
                scope.spawn(move || {
                    // A provider that exits without reading stdin still gets judged by its output
                    if let Err(e) = stdin.write_all(&payload) {
                        log::debug!("{} did not read its request: {e}", self.command);
                    }
                });
            }
            child.wait_with_output()
        })
        .map_err(|e| {
            ProviderError::permanent(format!("Failed to wait for {}: {e}", self.command))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match serde_json::from_str::<Response>(stdout.trim()) {
            Ok(Response::Failure { error, retryable }) => Err(ProviderError {
                message: error,
                retryable,
            }),
            Ok(Response::Success { attributes }) if output.status.success() => Ok(attributes),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr.trim().to_string()
                };
                Err(ProviderError::permanent(format!(
                    "{} {operation} failed ({}): {detail}",
                    self.command, output.status
                )))
            }
        }
    }
}

impl Provider for ProcessProvider {
    fn create(
        &self,
        resource_type: &str,
        name: &str,
        inputs: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        self.call(
            "create",
            &Request {
                resource_type,
                name,
                inputs,
                prior: None,
            },
        )
    }

    fn update(
        &self,
        resource_type: &str,
        name: &str,
        inputs: &Attributes,
        prior: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        self.call(
            "update",
            &Request {
                resource_type,
                name,
                inputs,
                prior: Some(prior),
            },
        )
    }

    fn delete(
        &self,
        resource_type: &str,
        name: &str,
        prior: &Attributes,
    ) -> Result<(), ProviderError> {
        let empty = Attributes::new();
        self.call(
            "delete",
            &Request {
                resource_type,
                name,
                inputs: &empty,
                prior: Some(prior),
            },
        )
        .map(|_| ())
    }
}
