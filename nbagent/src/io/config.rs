//! Agent configuration stored in `nbagent.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::render::MAX_CELL_OUTPUT_CHARS;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "nbagent.toml";

/// Agent configuration (TOML).
///
/// Missing fields default to the values below, so an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: LoopConfig,
    pub llm: LlmConfig,
    pub kernel: KernelConfig,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Inner (execute/prompt/mutate) iterations per goal.
    pub max_iterations: u32,
    /// Outer critique/refine iterations.
    pub max_goal_iterations: u32,
    /// End a goal attempt after this many consecutive identical states.
    /// 0 disables the check; otherwise at least 2.
    pub max_repeated_states: u32,
    /// Character budget for the rendered text outputs of one cell.
    pub max_cell_output_chars: usize,
    /// Root directory for persisted sessions (`<artifact_dir>/<task_id>/`).
    pub artifact_dir: PathBuf,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_goal_iterations: 3,
            max_repeated_states: 3,
            max_cell_output_chars: MAX_CELL_OUTPUT_CHARS,
            artifact_dir: PathBuf::from("artifacts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    /// Base URL of an OpenAI-compatible API (`{base_url}/chat/completions`).
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Reuse replies for byte-identical requests.
    pub cache: bool,
    pub cache_dir: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            cache: true,
            cache_dir: PathBuf::from("artifacts/.llm_cache"),
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Python interpreter used for the kernel process.
    pub python: String,
    /// Wall-clock budget for one full-document execution.
    pub execution_timeout_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            execution_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// API guide appended to the system prompt.
    pub guide_path: Option<PathBuf>,
    /// Code run once when a session is created, then frozen (e.g. API login).
    pub setup_code: Option<String>,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(anyhow!("agent.max_iterations must be > 0"));
        }
        if self.agent.max_goal_iterations == 0 {
            return Err(anyhow!("agent.max_goal_iterations must be > 0"));
        }
        if self.agent.max_repeated_states == 1 {
            return Err(anyhow!("agent.max_repeated_states must be 0 (disabled) or >= 2"));
        }
        if self.agent.max_cell_output_chars == 0 {
            return Err(anyhow!("agent.max_cell_output_chars must be > 0"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm.model must be non-empty"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow!("llm.temperature must be within 0.0..=2.0"));
        }
        if self.llm.max_tokens == 0 {
            return Err(anyhow!("llm.max_tokens must be > 0"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(anyhow!("llm.request_timeout_secs must be > 0"));
        }
        if self.kernel.python.trim().is_empty() {
            return Err(anyhow!("kernel.python must be non-empty"));
        }
        if self.kernel.execution_timeout_secs == 0 {
            return Err(anyhow!("kernel.execution_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nbagent.toml");
        let mut cfg = AgentConfig::default();
        cfg.prompt.setup_code = Some("import os".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nbagent.toml");
        fs::write(&path, "[agent]\nmax_iterations = 4\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.agent.max_iterations, 4);
        assert_eq!(cfg.agent.max_goal_iterations, 3);
        assert_eq!(cfg.kernel, KernelConfig::default());
    }

    #[test]
    fn repeated_state_limit_of_one_is_rejected() {
        let mut cfg = AgentConfig::default();
        cfg.agent.max_repeated_states = 1;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("max_repeated_states"));

        cfg.agent.max_repeated_states = 0;
        cfg.validate().expect("disabled");
        cfg.agent.max_repeated_states = 2;
        cfg.validate().expect("smallest limit");
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nbagent.toml");
        fs::write(&path, "[agent]\nmax_iterations = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(err.to_string().contains("max_iterations"));
    }
}
