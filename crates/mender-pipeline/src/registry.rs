//! Ordered registry of check descriptors, built once at startup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mender_types::{MenderError, Phase, Result};

use crate::gate::{Fixer, Gate};

/// Phase 1 checks, in execution order.
pub const PHASE1_CHECKS: [&str; 4] = ["code-review", "testing", "security-audit", "integration"];

/// Phase 2 checks, in execution order.
pub const PHASE2_CHECKS: [&str; 5] = ["compilation", "tests", "formatting", "linting", "docs"];

/// Default local retry budget per check invocation.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Default per-invocation gate timeout, further bounded by the run deadline.
pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(900);

pub struct CheckDescriptor {
    pub name: String,
    pub phase: Phase,
    pub gate: Arc<dyn Gate>,
    pub fixer: Arc<dyn Fixer>,
    pub local_retry_budget: u32,
    pub gate_timeout: Duration,
}

impl CheckDescriptor {
    pub fn new(
        name: impl Into<String>,
        phase: Phase,
        gate: Arc<dyn Gate>,
        fixer: Arc<dyn Fixer>,
    ) -> Self {
        Self {
            name: name.into(),
            phase,
            gate,
            fixer,
            local_retry_budget: DEFAULT_RETRY_BUDGET,
            gate_timeout: DEFAULT_GATE_TIMEOUT,
        }
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.local_retry_budget = budget;
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for CheckDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckDescriptor")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("local_retry_budget", &self.local_retry_budget)
            .field("gate_timeout", &self.gate_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct CheckRegistry {
    checks: Vec<CheckDescriptor>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CheckDescriptor) -> &mut Self {
        self.checks.push(descriptor);
        self
    }

    /// Checks of one phase in registration order.
    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &CheckDescriptor> {
        self.checks.iter().filter(move |c| c.phase == phase)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CheckDescriptor> {
        self.checks.iter()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&CheckDescriptor> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Reject registries the controller cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.checks.is_empty() {
            return Err(MenderError::ConfigError("no checks registered".into()));
        }
        let mut seen = HashSet::new();
        for check in &self.checks {
            if check.name.trim().is_empty() {
                return Err(MenderError::ConfigError("check with empty name".into()));
            }
            if !seen.insert(check.name.as_str()) {
                return Err(MenderError::ConfigError(format!(
                    "duplicate check '{}'",
                    check.name
                )));
            }
            if check.gate_timeout.is_zero() {
                return Err(MenderError::ConfigError(format!(
                    "check '{}' has a zero gate timeout",
                    check.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixer::NoOpFixer;
    use async_trait::async_trait;
    use mender_types::CheckResult;

    struct AlwaysPass;

    #[async_trait]
    impl Gate for AlwaysPass {
        async fn invoke(&self, check: &str, _timeout: Duration) -> Result<CheckResult> {
            Ok(CheckResult::passed(check, Duration::ZERO))
        }
    }

    fn descriptor(name: &str, phase: Phase) -> CheckDescriptor {
        CheckDescriptor::new(name, phase, Arc::new(AlwaysPass), Arc::new(NoOpFixer))
    }

    #[test]
    fn phase_iteration_keeps_registration_order() {
        let mut registry = CheckRegistry::new();
        registry
            .register(descriptor("compilation", Phase::Phase2))
            .register(descriptor("code-review", Phase::Phase1))
            .register(descriptor("tests", Phase::Phase2))
            .register(descriptor("testing", Phase::Phase1));

        let p1: Vec<_> = registry.phase(Phase::Phase1).map(|c| c.name.as_str()).collect();
        let p2: Vec<_> = registry.phase(Phase::Phase2).map(|c| c.name.as_str()).collect();
        assert_eq!(p1, vec!["code-review", "testing"]);
        assert_eq!(p2, vec!["compilation", "tests"]);
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = CheckRegistry::new();
        registry
            .register(descriptor("docs", Phase::Phase2))
            .register(descriptor("docs", Phase::Phase1));
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate check 'docs'"));
    }

    #[test]
    fn empty_registry_is_rejected() {
        assert!(matches!(
            CheckRegistry::new().validate(),
            Err(MenderError::ConfigError(_))
        ));
    }

    #[test]
    fn descriptor_defaults() {
        let d = descriptor("linting", Phase::Phase2).with_retry_budget(5);
        assert_eq!(d.local_retry_budget, 5);
        assert_eq!(d.gate_timeout, DEFAULT_GATE_TIMEOUT);
    }
}
