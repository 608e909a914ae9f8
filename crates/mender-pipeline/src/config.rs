//! `mender.toml` loading and construction of the standard check registry.
//!
//! The file is optional. Without it the nine standard checks run with cargo
//! commands; entries under `[[checks]]` override a standard check by name or
//! append a new one to the given phase. With the agent enabled, the Phase 1
//! checks are agent reviews and their commands only run when it is off.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mender_tools::ExecutionEnvironment;
use mender_types::{duration_serde, MenderError, Phase, Result};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentCli, AGENT_BASE_TIMEOUT, AGENT_MAX_TIMEOUT};
use crate::analysis::{AgentAnalyzer, RunAnalyzer};
use crate::backoff::BackoffPolicy;
use crate::controller::ControllerConfig;
use crate::fixer::{AgentFixer, CommandFixer, CompositeFixer, NoOpFixer};
use crate::gate::{CommandGate, Fixer, Gate};
use crate::review::ReviewGate;
use crate::registry::{
    CheckDescriptor, CheckRegistry, DEFAULT_GATE_TIMEOUT, DEFAULT_RETRY_BUDGET, PHASE1_CHECKS,
    PHASE2_CHECKS,
};

pub const CONFIG_FILE_NAME: &str = "mender.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MenderConfig {
    pub controller: ControllerSettings,
    pub agent: AgentSettings,
    pub checks: Vec<CheckOverride>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSettings {
    pub max_iterations: Option<u32>,
    #[serde(with = "duration_serde::option", skip_serializing_if = "Option::is_none")]
    pub backoff_base: Option<Duration>,
    #[serde(with = "duration_serde::option", skip_serializing_if = "Option::is_none")]
    pub backoff_max: Option<Duration>,
    #[serde(with = "duration_serde::option", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,
    pub bottleneck_threshold: Option<f64>,
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
    /// Budget for an agent call in the first iteration.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Ceiling for the per-iteration budget.
    #[serde(with = "duration_serde")]
    pub max_timeout: Duration,
    /// Run the analysis agent once the run has finished.
    pub analysis: bool,
    /// Directory holding `<check>.md` fixer templates, `review/<check>.md`
    /// review templates and `analysis/<outcome>.md`, relative to the repo.
    pub prompts_dir: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "claude".into(),
            args: vec!["--dangerously-skip-permissions".into()],
            timeout: AGENT_BASE_TIMEOUT,
            max_timeout: AGENT_MAX_TIMEOUT,
            analysis: true,
            prompts_dir: PathBuf::from(".mender/agents"),
        }
    }
}

/// One `[[checks]]` entry. Unset fields keep the standard value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckOverride {
    pub name: String,
    pub phase: Option<Phase>,
    pub command: Option<String>,
    pub auto_fix: Option<String>,
    pub agent: Option<bool>,
    pub review: Option<bool>,
    pub retry_budget: Option<u32>,
    #[serde(with = "duration_serde::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub prompt: Option<PathBuf>,
    pub enabled: Option<bool>,
}

/// A fully resolved check definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSpec {
    pub name: String,
    pub phase: Phase,
    pub command: String,
    pub auto_fix: Option<String>,
    pub agent: bool,
    /// Gate with an agent review; `command` is the fallback without an agent.
    pub review: bool,
    pub retry_budget: u32,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub prompt: Option<PathBuf>,
}

impl CheckSpec {
    fn standard(name: &str, phase: Phase, command: &str, auto_fix: Option<&str>) -> Self {
        Self {
            name: name.into(),
            phase,
            command: command.into(),
            auto_fix: auto_fix.map(String::from),
            agent: true,
            review: false,
            retry_budget: DEFAULT_RETRY_BUDGET,
            timeout: DEFAULT_GATE_TIMEOUT,
            prompt: None,
        }
    }
}

/// The nine standard checks with cargo commands, in execution order.
pub fn standard_checks() -> Vec<CheckSpec> {
    let p1 = |name, cmd| CheckSpec {
        review: true,
        ..CheckSpec::standard(name, Phase::Phase1, cmd, None)
    };
    let p2 = |name, cmd, fix| CheckSpec::standard(name, Phase::Phase2, cmd, fix);
    let [code_review, testing, security_audit, integration] = PHASE1_CHECKS;
    let [compilation, tests, formatting, linting, docs] = PHASE2_CHECKS;
    vec![
        p1(
            code_review,
            "cargo clippy --workspace --all-targets -- -D clippy::correctness -D clippy::suspicious",
        ),
        p1(testing, "cargo test --workspace --no-fail-fast"),
        p1(
            security_audit,
            "if command -v cargo-audit >/dev/null 2>&1; then cargo audit; \
             else echo 'cargo-audit not installed, skipping'; fi",
        ),
        p1(integration, "cargo test --workspace --tests --no-fail-fast"),
        p2(compilation, "cargo build --workspace --all-targets", None),
        p2(tests, "cargo test --workspace --all-targets", None),
        p2(formatting, "cargo fmt --all -- --check", Some("cargo fmt --all")),
        p2(
            linting,
            "cargo clippy --workspace --all-targets -- -D warnings",
            Some("cargo clippy --workspace --all-targets --fix --allow-dirty --allow-staged"),
        ),
        p2(docs, "RUSTDOCFLAGS='-D warnings' cargo doc --workspace --no-deps", None),
    ]
}

impl MenderConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MenderError::ConfigError(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// `<repo>/mender.toml` if present, otherwise defaults.
    pub fn discover(repo: &Path) -> Result<Self> {
        let path = repo.join(CONFIG_FILE_NAME);
        if path.exists() {
            tracing::debug!(path = %path.display(), "Loading configuration");
            return Self::load(&path);
        }
        Ok(Self::default())
    }

    /// Controller settings applied over the defaults.
    pub fn controller_config(&self) -> Result<ControllerConfig> {
        let mut config = ControllerConfig::default();
        let settings = &self.controller;
        if let Some(max) = settings.max_iterations {
            if max == 0 {
                return Err(MenderError::ConfigError("max_iterations must be at least 1".into()));
            }
            config.max_pipeline_iterations = max;
        }
        if settings.backoff_base.is_some() || settings.backoff_max.is_some() {
            let (default_base, default_max) = match BackoffPolicy::default() {
                BackoffPolicy::Exponential { base, max } => (base, max),
                BackoffPolicy::None => (Duration::ZERO, Duration::ZERO),
            };
            config.backoff = BackoffPolicy::Exponential {
                base: settings.backoff_base.unwrap_or(default_base),
                max: settings.backoff_max.unwrap_or(default_max),
            };
        }
        if let Some(deadline) = settings.deadline {
            config.run_deadline = Some(deadline);
        }
        if let Some(threshold) = settings.bottleneck_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(MenderError::ConfigError(format!(
                    "bottleneck_threshold must be within 0..=1, got {threshold}"
                )));
            }
            config.bottleneck_threshold = threshold;
        }
        if let Some(dir) = &settings.lock_dir {
            config.lock_dir = dir.clone();
        }
        Ok(config)
    }

    /// Standard checks with `[[checks]]` entries applied, in execution order.
    pub fn resolve_checks(&self) -> Result<Vec<CheckSpec>> {
        let mut checks = standard_checks();
        for entry in &self.checks {
            if entry.name.trim().is_empty() {
                return Err(MenderError::ConfigError("[[checks]] entry without a name".into()));
            }
            if entry.enabled == Some(false) {
                checks.retain(|c| c.name != entry.name);
                continue;
            }
            match checks.iter_mut().find(|c| c.name == entry.name) {
                Some(existing) => apply_override(existing, entry),
                None => {
                    let (Some(phase), Some(command)) = (entry.phase, entry.command.as_ref()) else {
                        return Err(MenderError::ConfigError(format!(
                            "custom check '{}' needs both phase and command",
                            entry.name
                        )));
                    };
                    let mut spec = CheckSpec::standard(&entry.name, phase, command, None);
                    apply_override(&mut spec, entry);
                    checks.push(spec);
                }
            }
        }
        // Stable: keeps phases contiguous so listing order matches execution order.
        checks.sort_by_key(|c| c.phase);
        Ok(checks)
    }

    /// Whether `spec` is gated by an agent review rather than its command.
    pub fn reviews(&self, spec: &CheckSpec, use_agent: bool) -> bool {
        spec.review && use_agent && self.agent.enabled
    }

    fn agent_cli(&self, env: Arc<dyn ExecutionEnvironment>) -> AgentCli {
        AgentCli::new(env, self.agent.program.clone()).with_args(self.agent.args.clone())
    }

    /// Build the registry: review or command gates plus auto-fix and agent fixers.
    pub fn build_registry(
        &self,
        env: Arc<dyn ExecutionEnvironment>,
        use_agent: bool,
    ) -> Result<CheckRegistry> {
        let mut registry = CheckRegistry::new();
        for spec in self.resolve_checks()? {
            let fixer = self.fixer_for(&spec, env.clone(), use_agent && self.agent.enabled);
            let gate: Arc<dyn Gate> = if self.reviews(&spec, use_agent) {
                let mut review = ReviewGate::new(self.agent_cli(env.clone()));
                let path = self.agent.prompts_dir.join("review").join(format!("{}.md", spec.name));
                if let Ok(template) = std::fs::read_to_string(env.working_directory().join(path)) {
                    review = review.with_template(template);
                }
                Arc::new(review)
            } else {
                Arc::new(CommandGate::new(env.clone(), spec.command.clone()))
            };
            registry.register(
                CheckDescriptor::new(spec.name.clone(), spec.phase, gate, fixer)
                    .with_retry_budget(spec.retry_budget)
                    .with_gate_timeout(spec.timeout),
            );
        }
        registry.validate()?;
        Ok(registry)
    }

    /// The post-run analyzer, unless the agent or analysis is switched off.
    pub fn build_analyzer(
        &self,
        env: Arc<dyn ExecutionEnvironment>,
        use_agent: bool,
    ) -> Option<Arc<dyn RunAnalyzer>> {
        if !(use_agent && self.agent.enabled && self.agent.analysis) {
            return None;
        }
        let templates = env.working_directory().join(&self.agent.prompts_dir).join("analysis");
        let analyzer = AgentAnalyzer::new(self.agent_cli(env))
            .with_templates(templates)
            .with_timeouts(self.agent.timeout, self.agent.max_timeout);
        Some(Arc::new(analyzer))
    }

    fn fixer_for(
        &self,
        spec: &CheckSpec,
        env: Arc<dyn ExecutionEnvironment>,
        use_agent: bool,
    ) -> Arc<dyn Fixer> {
        let auto_fix: Option<Arc<dyn Fixer>> = spec.auto_fix.as_ref().map(|cmd| {
            Arc::new(CommandFixer::new(env.clone(), cmd.clone())) as Arc<dyn Fixer>
        });
        let agent: Option<Arc<dyn Fixer>> = (use_agent && spec.agent).then(|| {
            let mut fixer = AgentFixer::new(env.clone(), self.agent.program.clone())
                .with_args(self.agent.args.clone())
                .with_timeout(self.agent.timeout)
                .with_max_timeout(self.agent.max_timeout);
            if let Some(template) = self.prompt_template(spec, env.working_directory()) {
                fixer = fixer.with_template(template);
            }
            Arc::new(fixer) as Arc<dyn Fixer>
        });

        match (auto_fix, agent) {
            (None, None) => Arc::new(NoOpFixer),
            (Some(auto_fix), None) => auto_fix,
            (None, Some(agent)) => agent,
            (auto_fix, agent) => Arc::new(CompositeFixer::new(auto_fix, agent)),
        }
    }

    fn prompt_template(&self, spec: &CheckSpec, repo: &Path) -> Option<String> {
        let path = spec
            .prompt
            .clone()
            .unwrap_or_else(|| self.agent.prompts_dir.join(format!("{}.md", spec.name)));
        let path = if path.is_absolute() { path } else { repo.join(path) };
        match std::fs::read_to_string(&path) {
            Ok(template) => Some(template),
            Err(e) => {
                if spec.prompt.is_some() {
                    tracing::warn!(check = %spec.name, path = %path.display(), error = %e, "Prompt template unreadable, using built-in instructions");
                }
                None
            }
        }
    }
}

fn apply_override(spec: &mut CheckSpec, entry: &CheckOverride) {
    if let Some(phase) = entry.phase {
        spec.phase = phase;
    }
    if let Some(command) = &entry.command {
        spec.command = command.clone();
    }
    if let Some(auto_fix) = &entry.auto_fix {
        spec.auto_fix = (!auto_fix.trim().is_empty()).then(|| auto_fix.clone());
    }
    if let Some(agent) = entry.agent {
        spec.agent = agent;
    }
    if let Some(review) = entry.review {
        spec.review = review;
    }
    if let Some(budget) = entry.retry_budget {
        spec.retry_budget = budget;
    }
    if let Some(timeout) = entry.timeout {
        spec.timeout = timeout;
    }
    if let Some(prompt) = &entry.prompt {
        spec.prompt = Some(prompt.clone());
    }
}
