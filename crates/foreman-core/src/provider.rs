//! Provider adapter interface for the external LLM command.
//!
//! The orchestrator talks to the model through an object-safe [`Provider`]
//! trait so cycles can run against the real command-line provider, or a
//! scripted stand-in under test. Providers are looked up by name in a
//! [`ProviderRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::runner::{ProcessRequest, ProcessRunner, RunnerError};

/// A request to the LLM provider. The prompt is fed on stdin.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    /// Working directory for the invocation (the task's worktree).
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

/// Raw response from one provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ProviderResponse {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Adapter interface for invoking an LLM as an external command.
///
/// Object-safe so implementations can be stored as `Box<dyn Provider>` in
/// the registry.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable name for this provider (e.g. "claude-cli").
    fn name(&self) -> &str;

    /// Run one invocation to completion.
    ///
    /// A timeout or missing executable surfaces as [`RunnerError`] through
    /// the error chain; a provider-reported failure (non-zero exit,
    /// `Error:` prefix) is a successful invocation with failure content.
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};

/// The default provider: spawns a configured command, feeds the prompt on
/// stdin, and collects stdout/stderr.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    command: String,
    args: Vec<String>,
    runner: ProcessRunner,
}

impl CommandProvider {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        runner: ProcessRunner,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            runner,
        }
    }

    /// Build the provider described by the configuration, sharing the
    /// given runner (and therefore its pid registry).
    pub fn from_config(config: &ProviderConfig, runner: ProcessRunner) -> Self {
        Self::new(
            "command",
            config.command.clone(),
            config.args.clone(),
            runner,
        )
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let process_request = ProcessRequest {
            command: self.command.clone(),
            args: self.args.clone(),
            stdin: Some(request.prompt.clone()),
            cwd: request.cwd.clone(),
            timeout: request.timeout,
        };

        let output = self.runner.run(&process_request).await?;

        Ok(ProviderResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration_ms: output.duration.as_millis() as u64,
        })
    }
}

/// Whether a provider invocation error is retryable (timeout, spawn
/// failure) rather than fatal to the cycle.
pub fn is_retryable_invoke_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RunnerError>()
        .is_some_and(RunnerError::is_retryable)
}

/// A collection of registered [`Provider`] implementations, keyed by name.
///
/// Stored as `Arc` so the orchestrator can hold the resolved provider
/// while the registry stays available for lookup.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under the name returned by [`Provider::name`].
    /// An existing provider with the same name is replaced and returned.
    pub fn register(&mut self, provider: impl Provider + 'static) -> Option<Arc<dyn Provider>> {
        let name = provider.name().to_string();
        self.providers.insert(name, Arc::new(provider))
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(Arc::clone)
    }

    /// Names of all registered providers (unordered).
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
