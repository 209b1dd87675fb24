//! Per-run credentials.
//!
//! Secrets are resolved once per run from a [`SecretSource`] and carried in a
//! [`Secrets`] value. Nothing here writes them anywhere, and their `Debug`
//! output is redacted.

use std::collections::HashMap;
use std::fmt;

use crate::config::SecretsConfig;
use crate::{clog_debug, Error, Result};

/// Where secret values come from.
pub trait SecretSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl SecretSource for EnvSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed in-memory secrets.
#[derive(Debug, Default, Clone)]
pub struct MapSource(HashMap<String, String>);

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }
}

impl SecretSource for MapSource {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// A secret value that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Secrets {
    bot_token: Option<Secret>,
    recipient: Option<Secret>,
    push_token: Option<Secret>,
    bot_token_var: String,
    recipient_var: String,
    push_token_var: String,
    require_task_secrets: bool,
}

impl Secrets {
    /// Resolve the configured variables from `source`.
    pub fn load(config: &SecretsConfig, source: &dyn SecretSource) -> Self {
        let secrets = Self {
            bot_token: source.get(&config.bot_token_var).map(Secret::new),
            recipient: source.get(&config.recipient_var).map(Secret::new),
            push_token: source.get(&config.push_token_var).map(Secret::new),
            bot_token_var: config.bot_token_var.clone(),
            recipient_var: config.recipient_var.clone(),
            push_token_var: config.push_token_var.clone(),
            require_task_secrets: config.require_task_secrets,
        };
        clog_debug!(
            "Secrets::load bot_token={} recipient={} push_token={}",
            secrets.bot_token.is_some(),
            secrets.recipient.is_some(),
            secrets.push_token.is_some()
        );
        secrets
    }

    /// Check the secrets the task needs are present, when required.
    pub fn ensure_task_secrets(&self) -> Result<()> {
        if !self.require_task_secrets {
            return Ok(());
        }
        if self.bot_token.is_none() {
            return Err(Error::MissingSecret(self.bot_token_var.clone()));
        }
        if self.recipient.is_none() {
            return Err(Error::MissingSecret(self.recipient_var.clone()));
        }
        Ok(())
    }

    /// Environment entries handed to the task. The push token is excluded.
    pub fn task_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(token) = &self.bot_token {
            env.push((self.bot_token_var.clone(), token.expose().to_string()));
        }
        if let Some(recipient) = &self.recipient {
            env.push((self.recipient_var.clone(), recipient.expose().to_string()));
        }
        env
    }

    /// Variable the push token is read from; scrubbed from the task's environment.
    pub fn push_token_var(&self) -> &str {
        &self.push_token_var
    }

    pub fn push_token(&self) -> Option<&str> {
        self.push_token.as_ref().map(Secret::expose)
    }
}
