use std::{
    path::PathBuf,
    process::{Command, Stdio},
};

use anyhow::{Context, Result, bail};

#[derive(Clone, Debug)]
pub enum EnvValue {
    Plain(String),
    Secret(String),
}

/// A single external command. Rendered for logs with secrets redacted.
#[derive(Clone, Debug)]
pub struct CmdSpec {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, EnvValue)>,
    cwd: Option<PathBuf>,
}

impl CmdSpec {
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, k: impl Into<String>, v: EnvValue) -> Self {
        self.envs.push((k.into(), v));
        self
    }

    #[must_use]
    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, EnvValue)>,
    {
        self.envs.extend(vars);
        self
    }

    #[must_use]
    pub fn cwd<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn render(&self) -> String {
        let prog = sh_quote(&self.program);
        let args: Vec<String> = self.args.iter().map(|a| sh_quote(a)).collect();
        let mut env_prefix = String::new();
        for (k, v) in &self.envs {
            match v {
                EnvValue::Plain(val) => env_prefix.push_str(&format!("{k}={} ", sh_quote(val))),
                EnvValue::Secret(_) => env_prefix.push_str(&format!("{k}=<redacted> ")),
            }
        }
        if args.is_empty() {
            format!("{env_prefix}{prog}")
        } else {
            format!("{}{} {}", env_prefix, prog, args.join(" "))
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            match v {
                EnvValue::Plain(val) => cmd.env(k, val),
                EnvValue::Secret(val) => cmd.env(k, val),
            };
        }
        if let Some(ref d) = self.cwd {
            cmd.current_dir(d);
        }
        cmd
    }
}

/// Seam for every subprocess the daemon spawns. Tooling ports talk to this
/// trait so tests can substitute a scripted runner.
pub trait Runner: Send + Sync {
    /// Run to completion, failing on any non-zero exit. The error message
    /// carries captured stderr so callers can classify tool output.
    fn run(&self, spec: &CmdSpec) -> Result<()>;

    /// Like `run`, but return captured stdout on success.
    fn run_capture(&self, spec: &CmdSpec) -> Result<String>;

    /// Run and hand back the raw exit code. Spawn failures still error;
    /// non-zero exits do not. For probes like `mountpoint -q` and tools
    /// with benign non-zero codes.
    fn run_status(&self, spec: &CmdSpec) -> Result<i32>;
}

#[derive(Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn output(&self, spec: &CmdSpec) -> Result<std::process::Output> {
        tracing::debug!("exec: {}", spec.render());
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.output()
            .with_context(|| format!("spawn {}", spec.render()))
    }
}

impl Runner for ProcessRunner {
    fn run(&self, spec: &CmdSpec) -> Result<()> {
        let out = self.output(spec)?;
        if out.status.success() {
            Ok(())
        } else {
            bail!(
                "command failed: {} ({}): {}",
                spec.render(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
    }

    fn run_capture(&self, spec: &CmdSpec) -> Result<String> {
        let out = self.output(spec)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            bail!(
                "command failed: {} ({}): {}",
                spec.render(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
    }

    fn run_status(&self, spec: &CmdSpec) -> Result<i32> {
        let out = self.output(spec)?;
        // -1 stands in for termination by signal
        Ok(out.status.code().unwrap_or(-1))
    }
}

fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}
