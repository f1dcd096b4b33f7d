//! Rate limit policies and the named policy registry.
//!
//! A policy caps how many requests an identifier may make for one operation
//! inside a fixed window, and optionally escalates an overflow into a
//! temporary block. Policies are looked up by exact operation name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{BulwarkError, Result};

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Limits applied to a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Number of requests allowed inside one window
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// If set, exceeding the ceiling blocks the identifier for this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_duration_ms: Option<u64>,
}

impl Policy {
    /// A policy that denies for the rest of the window once exceeded.
    pub fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            block_duration_ms: None,
        }
    }

    /// Escalate an overflow into a block of `block_duration_ms`.
    pub fn with_block(mut self, block_duration_ms: u64) -> Self {
        self.block_duration_ms = Some(block_duration_ms);
        self
    }

    /// Reject policies that could never admit a request.
    pub fn validate(&self, operation: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(BulwarkError::invalid_policy(
                operation,
                "max_requests must be greater than zero",
            ));
        }
        if self.window_ms == 0 {
            return Err(BulwarkError::invalid_policy(
                operation,
                "window_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// The named operations and their policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRegistry {
    #[serde(default)]
    policies: HashMap<String, Policy>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock table: login attempts, message sends and room creation.
    pub fn defaults() -> Self {
        let mut registry = Self::new();
        registry.policies.insert(
            "LOGIN".to_string(),
            Policy::new(5, 15 * MINUTE_MS).with_block(30 * MINUTE_MS),
        );
        registry
            .policies
            .insert("SEND_MESSAGE".to_string(), Policy::new(100, MINUTE_MS));
        registry
            .policies
            .insert("CREATE_ROOM".to_string(), Policy::new(5, HOUR_MS));
        registry
    }

    /// Register (or replace) a policy after validating it.
    pub fn register(&mut self, operation: impl Into<String>, policy: Policy) -> Result<()> {
        let operation = operation.into();
        policy.validate(&operation)?;
        self.policies.insert(operation, policy);
        Ok(())
    }

    /// Load a registry from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a registry from a YAML string.
    ///
    /// Every entry is validated; one bad entry rejects the whole table.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let registry: PolicyRegistry = serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(format!("Failed to parse policies: {}", e)))?;

        for (operation, policy) in &registry.policies {
            policy.validate(operation)?;
        }
        Ok(registry)
    }

    /// Look up the policy for an operation.
    pub fn get_policy(&self, operation: &str) -> Result<Policy> {
        self.policies
            .get(operation)
            .copied()
            .ok_or_else(|| BulwarkError::UnknownOperation(operation.to_string()))
    }

    /// Like [`get_policy`](Self::get_policy) but without the error.
    pub fn get(&self, operation: &str) -> Option<Policy> {
        self.policies.get(operation).copied()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
