//! Sandbox configuration with builder pattern.

use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::sandbox::cache::CacheConfig;
use crate::sandbox::convert::DEFAULT_MAX_DEPTH;
use crate::sandbox::io::DEFAULT_OUTPUT_LIMIT;
use crate::sandbox::pipeline::PipelineConfig;
use crate::sandbox::pool::PoolConfig;
use crate::sandbox::security::{SecurityConfig, SecurityLevel};

/// Configuration for the Lua sandbox engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Capability restriction and resource limits.
    pub security: SecurityConfig,
    /// Instance pool sizing.
    pub pool: PoolConfig,
    /// Bytecode cache sizing.
    pub cache: CacheConfig,
    /// Maximum time per call, lease wait included.
    pub timeout: Duration,
    /// Script run in every fresh instance after sandboxing.
    pub init_script: Option<String>,
    /// Nesting limit for parameters and results.
    pub max_conversion_depth: usize,
    /// Maximum captured `print` output per call, in bytes.
    pub output_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            security: SecurityConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            timeout: PipelineConfig::DEFAULT_CALL_TIMEOUT,
            init_script: None,
            max_conversion_depth: DEFAULT_MAX_DEPTH,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// The pipeline settings derived from this configuration.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            call_timeout: self.timeout,
        }
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.security.validate()?;
        self.pool.normalized().validate()?;
        self.cache.normalized().validate()?;
        self.pipeline().validate()?;
        if self.max_conversion_depth == 0 {
            return Err(SandboxError::Config(
                "max_conversion_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    security: Option<SecurityConfig>,
    security_level: Option<SecurityLevel>,
    pool: Option<PoolConfig>,
    min_size: Option<usize>,
    max_size: Option<usize>,
    cache: Option<CacheConfig>,
    timeout: Option<Duration>,
    max_memory: Option<usize>,
    max_instructions: Option<u64>,
    init_script: Option<String>,
    max_conversion_depth: Option<usize>,
    output_limit: Option<usize>,
}

impl SandboxConfigBuilder {
    /// Use a complete security configuration.
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = Some(security);
        self
    }

    /// Use the preset for `level`. Ignored when [`Self::security`] is set.
    pub fn security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    /// Use a complete pool configuration.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the pool floor.
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.min_size = Some(min_size);
        self
    }

    /// Set the pool ceiling.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Use a complete cache configuration.
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the maximum time per call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the interpreter heap limit in bytes.
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the per-call instruction limit.
    pub fn max_instructions(mut self, instructions: u64) -> Self {
        self.max_instructions = Some(instructions);
        self
    }

    /// Run `script` in every fresh instance.
    pub fn init_script(mut self, script: impl Into<String>) -> Self {
        self.init_script = Some(script.into());
        self
    }

    /// Set the nesting limit for converted values.
    pub fn max_conversion_depth(mut self, depth: usize) -> Self {
        self.max_conversion_depth = Some(depth);
        self
    }

    /// Bound captured output per call.
    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = Some(bytes);
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();

        let mut security = self.security.unwrap_or_else(|| {
            SecurityConfig::new(self.security_level.unwrap_or(default.security.level))
        });
        if let Some(bytes) = self.max_memory {
            security.limits.max_memory = bytes;
        }
        if let Some(instructions) = self.max_instructions {
            security.limits.max_instructions = instructions;
        }

        let mut pool = self.pool.unwrap_or(default.pool);
        if let Some(min_size) = self.min_size {
            pool.min_size = min_size;
        }
        if let Some(max_size) = self.max_size {
            pool.max_size = max_size;
        }

        SandboxConfig {
            security,
            pool,
            cache: self.cache.unwrap_or(default.cache),
            timeout: self.timeout.unwrap_or(default.timeout),
            init_script: self.init_script.or(default.init_script),
            max_conversion_depth: self
                .max_conversion_depth
                .unwrap_or(default.max_conversion_depth),
            output_limit: self.output_limit.unwrap_or(default.output_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::limits::ResourceLimits;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.security.level, SecurityLevel::Standard);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.cache.max_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SandboxConfig::builder()
            .security_level(SecurityLevel::Strict)
            .timeout(Duration::from_secs(5))
            .max_memory(32 * 1024 * 1024)
            .min_size(2)
            .max_size(4)
            .init_script("x = 1")
            .build();

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.security.level, SecurityLevel::Strict);
        assert_eq!(config.security.limits.max_memory, 32 * 1024 * 1024);
        assert_eq!(
            config.security.limits.max_instructions,
            ResourceLimits::strict().max_instructions
        );
        assert_eq!((config.pool.min_size, config.pool.max_size), (2, 4));
        assert_eq!(config.init_script.as_deref(), Some("x = 1"));
    }

    #[test]
    fn test_validate_reports_bad_sections() {
        let config = SandboxConfig::builder().min_size(8).max_size(2).build();
        assert!(matches!(config.validate(), Err(SandboxError::Config(_))));

        let config = SandboxConfig::builder()
            .security_level(SecurityLevel::Custom)
            .build();
        assert!(config.validate().is_err());

        let config = SandboxConfig::builder().timeout(Duration::ZERO).build();
        assert!(config.validate().is_err());
    }
}
