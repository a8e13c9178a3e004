use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dialoguer::console::style;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const SECURITY_DIRECTIVE_KEY: &str = "cap_drop";
const FIRST_RUN_ANNOTATION: &str = "# Temporarily commented out for first run";

#[derive(Parser, Debug)]
#[command(name = "localai", version, about = "Local AI stack orchestrator")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct StackArgs {
    /// cpu, gpu-nvidia, gpu-amd or none
    #[arg(long)]
    profile: Option<String>,
    /// private, public, or none for no overlay
    #[arg(long)]
    environment: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate, bootstrap, tear down and bring up the whole stack.
    Start {
        #[command(flatten)]
        stack: StackArgs,
        #[arg(long)]
        pull_all: bool,
        #[arg(long)]
        update_running: bool,
    },
    /// Validate the merged compose configuration.
    Verify {
        #[command(flatten)]
        stack: StackArgs,
    },
    Down {
        #[command(flatten)]
        stack: StackArgs,
    },
    /// Report the first-run state of the bootstrap service.
    Probe,
    /// Probe the bootstrap service and patch the compose file accordingly.
    Bootstrap,
    /// Seed the search settings file and replace its secret placeholder.
    Secrets,
    /// Print the docker invocation for an action without running it.
    Plan {
        /// up, down, validate, pull, recreate or ps
        action: String,
        services: Vec<String>,
        #[command(flatten)]
        stack: StackArgs,
    },
    Doctor,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Error)]
enum StackError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compose configuration is invalid: {message}")]
    ComposeInvalid {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("patch error: {0}")]
    Patch(String),
    #[error("image pull failed after {attempts} attempt(s); not pulled: {services}")]
    PullExhausted {
        attempts: u32,
        services: String,
        details: ProcessErrorDetails,
    },
    #[error("secret error: {0}")]
    Secret(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    stack: StackConfig,
    compose: ComposeConfig,
    first_run: FirstRunConfig,
    pull: PullConfig,
    secrets: SecretsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct StackConfig {
    project_name: String,
    profile: String,
    environment: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct ComposeConfig {
    base_file: String,
    private_overlay: String,
    public_overlay: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct FirstRunConfig {
    service: String,
    container_filter: String,
    marker_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct PullConfig {
    attempts: u32,
    delay_sec: u64,
    always_services: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct SecretsConfig {
    settings_file: String,
    template_file: String,
    placeholder: String,
    bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            stack: StackConfig::default(),
            compose: ComposeConfig::default(),
            first_run: FirstRunConfig::default(),
            pull: PullConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            project_name: "localai".to_string(),
            profile: "cpu".to_string(),
            environment: "private".to_string(),
        }
    }
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            base_file: "docker-compose.yml".to_string(),
            private_overlay: "docker-compose.override.private.yml".to_string(),
            public_overlay: "docker-compose.override.public.yml".to_string(),
        }
    }
}

impl Default for FirstRunConfig {
    fn default() -> Self {
        Self {
            service: "searxng".to_string(),
            container_filter: "searxng".to_string(),
            marker_path: "/etc/searxng/uwsgi.ini".to_string(),
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_sec: 3,
            always_services: vec!["open-webui".to_string()],
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            settings_file: "searxng/settings.yml".to_string(),
            template_file: "searxng/settings-base.yml".to_string(),
            placeholder: "ultrasecretkey".to_string(),
            bytes: 32,
        }
    }
}

impl ComposeConfig {
    fn overlay_for(&self, environment: Environment) -> &str {
        match environment {
            Environment::Private => &self.private_overlay,
            Environment::Public => &self.public_overlay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum Profile {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "gpu-nvidia")]
    GpuNvidia,
    #[serde(rename = "gpu-amd")]
    GpuAmd,
    #[serde(rename = "none")]
    NoBackend,
}

impl Profile {
    fn as_str(self) -> &'static str {
        match self {
            Profile::Cpu => "cpu",
            Profile::GpuNvidia => "gpu-nvidia",
            Profile::GpuAmd => "gpu-amd",
            Profile::NoBackend => "none",
        }
    }

    /// Value for `--profile`; `none` drops the selector entirely.
    fn selector(self) -> Option<&'static str> {
        match self {
            Profile::NoBackend => None,
            other => Some(other.as_str()),
        }
    }

    fn backend_service(self) -> Option<&'static str> {
        match self {
            Profile::Cpu => Some("ollama-cpu"),
            Profile::GpuNvidia => Some("ollama-gpu"),
            Profile::GpuAmd => Some("ollama-gpu-amd"),
            Profile::NoBackend => None,
        }
    }
}

impl FromStr for Profile {
    type Err = StackError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "cpu" => Ok(Profile::Cpu),
            "gpu-nvidia" => Ok(Profile::GpuNvidia),
            "gpu-amd" => Ok(Profile::GpuAmd),
            "none" => Ok(Profile::NoBackend),
            other => Err(StackError::Config(format!(
                "unknown profile '{other}'; expected one of cpu, gpu-nvidia, gpu-amd, none"
            ))),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Environment {
    Private,
    Public,
}

fn parse_environment(raw: &str) -> Result<Option<Environment>, StackError> {
    match raw.trim() {
        "private" => Ok(Some(Environment::Private)),
        "public" => Ok(Some(Environment::Public)),
        "none" | "" => Ok(None),
        other => Err(StackError::Config(format!(
            "unknown environment '{other}'; expected one of private, public, none"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct StackSelection {
    profile: Profile,
    environment: Option<Environment>,
}

fn resolve_selection(cfg: &Config, args: &StackArgs) -> Result<StackSelection, StackError> {
    let profile = args
        .profile
        .as_deref()
        .unwrap_or(&cfg.stack.profile)
        .parse::<Profile>()?;
    let environment =
        parse_environment(args.environment.as_deref().unwrap_or(&cfg.stack.environment))?;
    Ok(StackSelection {
        profile,
        environment,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ComposeAction {
    Up,
    Down,
    Validate,
    Pull(Vec<String>),
    Recreate(Vec<String>),
    RunningServices,
}

impl ComposeAction {
    fn parse(raw: &str, services: Vec<String>) -> Result<Self, StackError> {
        let takes_services = matches!(raw, "pull" | "recreate");
        if !takes_services && !services.is_empty() {
            return Err(StackError::Usage(format!(
                "action '{raw}' does not take service names"
            )));
        }
        match raw {
            "up" => Ok(ComposeAction::Up),
            "down" => Ok(ComposeAction::Down),
            "validate" => Ok(ComposeAction::Validate),
            "pull" => Ok(ComposeAction::Pull(services)),
            "recreate" => Ok(ComposeAction::Recreate(services)),
            "ps" => Ok(ComposeAction::RunningServices),
            other => Err(StackError::Usage(format!(
                "unknown action '{other}'; expected one of up, down, validate, pull, recreate, ps"
            ))),
        }
    }

    fn verb_tokens(&self) -> Vec<&'static str> {
        match self {
            ComposeAction::Up | ComposeAction::Recreate(_) => vec!["up", "-d"],
            ComposeAction::Down => vec!["down"],
            ComposeAction::Validate => vec!["config", "--quiet"],
            ComposeAction::Pull(_) => vec!["pull"],
            ComposeAction::RunningServices => vec!["ps", "--status", "running", "--services"],
        }
    }

    fn services(&self) -> &[String] {
        match self {
            ComposeAction::Pull(services) | ComposeAction::Recreate(services) => services,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct InvocationPlan {
    args: Vec<String>,
}

impl InvocationPlan {
    fn args(&self) -> &[String] {
        &self.args
    }

    fn files(&self) -> Vec<&str> {
        self.args
            .windows(2)
            .filter(|pair| pair[0] == "-f")
            .map(|pair| pair[1].as_str())
            .collect()
    }

    fn render(&self) -> String {
        render_docker_command(&self.args)
    }
}

/// Builds the `docker compose` argument list for one action. The base file is
/// always first so the environment overlay can override its keys.
fn build_invocation(
    cfg: &Config,
    selection: &StackSelection,
    action: &ComposeAction,
    extra_args: &[String],
) -> InvocationPlan {
    let mut args = vec!["compose".to_string()];
    if !cfg.stack.project_name.trim().is_empty() {
        args.push("-p".to_string());
        args.push(cfg.stack.project_name.trim().to_string());
    }
    if let Some(selector) = selection.profile.selector() {
        args.push("--profile".to_string());
        args.push(selector.to_string());
    }
    args.push("-f".to_string());
    args.push(cfg.compose.base_file.clone());
    if let Some(environment) = selection.environment {
        args.push("-f".to_string());
        args.push(cfg.compose.overlay_for(environment).to_string());
    }
    args.extend(action.verb_tokens().into_iter().map(ToString::to_string));
    args.extend(extra_args.iter().cloned());
    args.extend(action.services().iter().cloned());
    InvocationPlan { args }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
struct ServiceSet(Vec<String>);

impl ServiceSet {
    fn for_profile(profile: Profile, always: &[String]) -> Self {
        let mut set = ServiceSet::default();
        for service in always {
            set.insert(service);
        }
        if let Some(backend) = profile.backend_service() {
            set.insert(backend);
        }
        set
    }

    fn insert(&mut self, service: &str) {
        let service = service.trim();
        if !service.is_empty() && !self.0.iter().any(|existing| existing == service) {
            self.0.push(service.to_string());
        }
    }

    fn names(&self) -> &[String] {
        &self.0
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn retain_running(&self, running: &[String]) -> ServiceSet {
        ServiceSet(
            self.0
                .iter()
                .filter(|service| running.iter().any(|r| r == *service))
                .cloned()
                .collect(),
        )
    }

    fn describe(&self) -> String {
        self.0.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PullScope {
    Everything,
    Services(ServiceSet),
}

impl PullScope {
    fn describe(&self) -> String {
        match self {
            PullScope::Everything => "all services".to_string(),
            PullScope::Services(set) => set.describe(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    fn from_config(pull: &PullConfig) -> Self {
        Self {
            attempts: pull.attempts.max(1),
            delay: Duration::from_secs(pull.delay_sec),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
struct ProcessErrorDetails {
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_stderr: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    config_explicit: bool,
    project_dir: PathBuf,
    json: bool,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait DockerRunner {
    fn run(&self, args: &[String], cwd: &Path, capture_output: bool)
        -> Result<CommandOutput, io::Error>;
}

struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new("docker");
        cmd.args(args).current_dir(cwd);
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

trait SecretGenerator {
    /// Returns `bytes` random bytes as lowercase hex.
    fn random_hex(&self, bytes: usize) -> Result<String, StackError>;
    fn required_tool(&self) -> &'static str;
}

struct LinuxRandom;
struct MacosRandom;
struct WindowsRandom;

impl SecretGenerator for LinuxRandom {
    fn random_hex(&self, bytes: usize) -> Result<String, StackError> {
        let mut cmd = Command::new("openssl");
        cmd.arg("rand").arg("-hex").arg(bytes.to_string());
        run_secret_command(cmd, "openssl rand", bytes)
    }

    fn required_tool(&self) -> &'static str {
        "openssl"
    }
}

impl SecretGenerator for MacosRandom {
    fn random_hex(&self, bytes: usize) -> Result<String, StackError> {
        // The system LibreSSL build is always present, unlike a Homebrew openssl on PATH.
        let program = if Path::new("/usr/bin/openssl").exists() {
            "/usr/bin/openssl"
        } else {
            "openssl"
        };
        let mut cmd = Command::new(program);
        cmd.arg("rand").arg("-hex").arg(bytes.to_string());
        run_secret_command(cmd, "openssl rand", bytes)
    }

    fn required_tool(&self) -> &'static str {
        "openssl"
    }
}

impl SecretGenerator for WindowsRandom {
    fn random_hex(&self, bytes: usize) -> Result<String, StackError> {
        let script = format!(
            "$bytes = New-Object byte[] {bytes}; \
[System.Security.Cryptography.RandomNumberGenerator]::Create().GetBytes($bytes); \
-join ($bytes | ForEach-Object {{ '{{0:x2}}' -f $_ }})"
        );
        let mut cmd = Command::new("powershell");
        cmd.arg("-NoProfile").arg("-Command").arg(script);
        run_secret_command(cmd, "powershell RandomNumberGenerator", bytes)
    }

    fn required_tool(&self) -> &'static str {
        "powershell"
    }
}

fn platform_secret_generator() -> Box<dyn SecretGenerator> {
    if cfg!(target_os = "windows") {
        Box::new(WindowsRandom)
    } else if cfg!(target_os = "macos") {
        Box::new(MacosRandom)
    } else {
        Box::new(LinuxRandom)
    }
}

fn run_secret_command(mut cmd: Command, label: &str, bytes: usize) -> Result<String, StackError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|err| StackError::Secret(format!("failed to run {label}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(StackError::Secret(format!(
            "{label} exited with status {}: {stderr}",
            output.status
        )));
    }
    let hex = String::from_utf8_lossy(&output.stdout)
        .trim()
        .to_ascii_lowercase();
    validate_hex_secret(&hex, bytes)?;
    Ok(hex)
}

fn validate_hex_secret(hex: &str, bytes: usize) -> Result<(), StackError> {
    if hex.len() != bytes * 2 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StackError::Secret(format!(
            "random generator returned {} characters, expected {} hex digits",
            hex.len(),
            bytes * 2
        )));
    }
    Ok(())
}

fn main() -> Result<(), StackError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli)?;
    let runner = RealDockerRunner;
    let generator = platform_secret_generator();

    let result = match cli.command {
        Commands::Start {
            stack,
            pull_all,
            update_running,
        } => handle_start(
            &ctx,
            &runner,
            generator.as_ref(),
            &StartOptions {
                stack,
                pull_all,
                update_running,
            },
        ),
        Commands::Verify { stack } => handle_verify(&ctx, &runner, &stack),
        Commands::Down { stack } => handle_down(&ctx, &runner, &stack),
        Commands::Probe => handle_probe(&ctx, &runner),
        Commands::Bootstrap => handle_bootstrap(&ctx, &runner),
        Commands::Secrets => handle_secrets(&ctx, generator.as_ref()),
        Commands::Plan {
            action,
            services,
            stack,
        } => handle_plan(&ctx, &action, services, &stack),
        Commands::Doctor => handle_doctor(&ctx, generator.as_ref()),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: extract_process_error_details(&err),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Result<Context, StackError> {
    let (config_path, config_explicit) = resolve_config_path(cli.config.as_ref());
    let project_dir = resolve_project_dir(cli.project_dir.as_ref())?;
    Ok(Context {
        config_path,
        config_explicit,
        project_dir,
        json: cli.json,
    })
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = override_path {
        return (path.clone(), true);
    }
    if let Ok(path) = env::var("LOCALAI_CONFIG") {
        return (PathBuf::from(path), true);
    }
    (default_config_dir().join("config.yaml"), false)
}

fn resolve_project_dir(override_path: Option<&PathBuf>) -> Result<PathBuf, StackError> {
    if let Some(path) = override_path {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var("LOCALAI_PROJECT_DIR") {
        return Ok(PathBuf::from(path));
    }
    Ok(env::current_dir()?)
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("LOCALAI_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("localai");
    base
}

fn ensure_parent(path: &Path) -> Result<(), StackError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_config_from_str(content: &str) -> Result<Config, StackError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(StackError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<Config, StackError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Explicit config paths must exist; the default location falls back to
/// built-in defaults when nothing has been written there yet.
fn load_config(ctx: &Context) -> Result<Config, StackError> {
    if ctx.config_path.exists() {
        return read_config(&ctx.config_path);
    }
    if ctx.config_explicit {
        return Err(StackError::Config(format!(
            "config file not found: {}",
            ctx.config_path.display()
        )));
    }
    Ok(Config::default())
}

fn validate_config(cfg: &Config) -> Result<(), StackError> {
    if cfg.stack.project_name.trim().is_empty() {
        return Err(StackError::Config(
            "stack.project_name must be non-empty".to_string(),
        ));
    }
    cfg.stack.profile.parse::<Profile>()?;
    parse_environment(&cfg.stack.environment)?;
    for (field, value) in [
        ("compose.base_file", &cfg.compose.base_file),
        ("compose.private_overlay", &cfg.compose.private_overlay),
        ("compose.public_overlay", &cfg.compose.public_overlay),
        ("first_run.service", &cfg.first_run.service),
        ("first_run.container_filter", &cfg.first_run.container_filter),
        ("secrets.settings_file", &cfg.secrets.settings_file),
        ("secrets.template_file", &cfg.secrets.template_file),
        ("secrets.placeholder", &cfg.secrets.placeholder),
    ] {
        if value.trim().is_empty() {
            return Err(StackError::Config(format!("{field} must be non-empty")));
        }
    }
    if !cfg.first_run.marker_path.starts_with('/') {
        return Err(StackError::Config(format!(
            "first_run.marker_path must be an absolute path inside the container (got '{}')",
            cfg.first_run.marker_path
        )));
    }
    if cfg.pull.attempts == 0 {
        return Err(StackError::Config(
            "pull.attempts must be at least 1".to_string(),
        ));
    }
    if cfg
        .pull
        .always_services
        .iter()
        .any(|service| service.trim().is_empty())
    {
        return Err(StackError::Config(
            "pull.always_services must not contain empty names".to_string(),
        ));
    }
    if cfg.secrets.bytes == 0 || cfg.secrets.bytes > 1024 {
        return Err(StackError::Config(
            "secrets.bytes must be between 1 and 1024".to_string(),
        ));
    }
    Ok(())
}

fn compose_document_path(ctx: &Context, cfg: &Config) -> PathBuf {
    ctx.project_dir.join(&cfg.compose.base_file)
}

fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<(), StackError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "localai".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn write_atomic_text_file_preserving_mode(
    path: &Path,
    content: &str,
    default_mode: u32,
) -> Result<(), StackError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(default_mode);
        return write_atomic_text_file(path, content, Some(mode));
    }
    #[cfg(not(unix))]
    {
        let _ = default_mode;
        write_atomic_text_file(path, content, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum LineEnding {
    Lf,
    Crlf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum DirectiveState {
    Active,
    Suspended,
    Absent,
}

/// Full text of a compose file. Patching works on this value; callers own the
/// file I/O around it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigDocument {
    text: String,
}

impl ConfigDocument {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    fn as_str(&self) -> &str {
        &self.text
    }

    fn line_ending(&self) -> LineEnding {
        if self.text.contains("\r\n") {
            LineEnding::Crlf
        } else {
            LineEnding::Lf
        }
    }

    fn directive_state(&self, service: &str) -> Result<DirectiveState, StackError> {
        let (lines, _) = split_lines(&self.text);
        Ok(locate_directive(&lines, service)?
            .map(|span| span.state)
            .unwrap_or(DirectiveState::Absent))
    }
}

#[derive(Debug, Clone, Copy)]
struct ServiceBlock {
    body_start: usize,
    body_end: usize,
    child_indent: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirectiveSpan {
    state: DirectiveState,
    start: usize,
    end: usize,
    indent: usize,
}

/// Splits into line bodies and their terminators so untouched lines are
/// re-emitted byte for byte, whatever mix of LF and CRLF they use.
fn split_lines(text: &str) -> (Vec<String>, Vec<&'static str>) {
    let mut lines = Vec::new();
    let mut endings = Vec::new();
    for raw in text.split_inclusive('\n') {
        let (body, ending) = if let Some(body) = raw.strip_suffix("\r\n") {
            (body, "\r\n")
        } else if let Some(body) = raw.strip_suffix('\n') {
            (body, "\n")
        } else {
            (raw, "")
        };
        lines.push(body.to_string());
        endings.push(ending);
    }
    (lines, endings)
}

fn join_lines(lines: &[String], endings: &[&str]) -> String {
    let mut out = String::new();
    for (line, ending) in lines.iter().zip(endings) {
        out.push_str(line);
        out.push_str(ending);
    }
    out
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn leading_space_count(line: &str) -> Result<usize, StackError> {
    let mut count = 0usize;
    for ch in line.chars() {
        match ch {
            ' ' => count += 1,
            '\t' => {
                return Err(StackError::Patch(
                    "tabs are not supported in compose file indentation".to_string(),
                ))
            }
            _ => break,
        }
    }
    Ok(count)
}

fn match_block_key_line(line: &str, key: &str) -> Result<Option<usize>, StackError> {
    if is_blank_or_comment(line) {
        return Ok(None);
    }
    let indent = leading_space_count(line)?;
    let rest = &line[indent..];
    if !rest.starts_with(key) {
        return Ok(None);
    }
    let mut idx = key.len();
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= rest.len() || rest.as_bytes()[idx] != b':' {
        return Ok(None);
    }
    idx += 1;
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= rest.len() || rest.as_bytes()[idx] == b'#' {
        return Ok(Some(indent));
    }
    Ok(None)
}

fn match_scalar_key_line(line: &str, key: &str) -> Result<Option<usize>, StackError> {
    if is_blank_or_comment(line) {
        return Ok(None);
    }
    let indent = leading_space_count(line)?;
    let rest = &line[indent..];
    if !rest.starts_with(key) {
        return Ok(None);
    }
    let mut idx = key.len();
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= rest.len() || rest.as_bytes()[idx] != b':' {
        return Ok(None);
    }
    Ok(Some(indent))
}

/// Finds `key:` at `expected_indent` within `start..end` and returns the key
/// line plus the body range, which stops at the next non-comment line at the
/// same or lower indentation.
fn find_block_range(
    lines: &[String],
    start: usize,
    end: usize,
    key: &str,
    expected_indent: usize,
) -> Result<Option<(usize, usize, usize)>, StackError> {
    for idx in start..end {
        let Some(indent) = match_block_key_line(&lines[idx], key)? else {
            continue;
        };
        if indent != expected_indent {
            continue;
        }
        let body_start = idx + 1;
        let mut body_end = end;
        for (j, candidate) in lines.iter().enumerate().take(end).skip(body_start) {
            if is_blank_or_comment(candidate) {
                continue;
            }
            if leading_space_count(candidate)? <= indent {
                body_end = j;
                break;
            }
        }
        return Ok(Some((idx, body_start, body_end)));
    }
    Ok(None)
}

fn first_child_indent(lines: &[String], start: usize, end: usize) -> Result<Option<usize>, StackError> {
    let mut comment_indent = None;
    for line in &lines[start..end] {
        if line.trim().is_empty() {
            continue;
        }
        let indent = leading_space_count(line)?;
        if !is_blank_or_comment(line) {
            return Ok(Some(indent));
        }
        if comment_indent.is_none() {
            comment_indent = Some(indent);
        }
    }
    Ok(comment_indent)
}

fn locate_service_block(lines: &[String], service: &str) -> Result<Option<ServiceBlock>, StackError> {
    let (_, services_start, services_end) = find_block_range(lines, 0, lines.len(), "services", 0)?
        .ok_or_else(|| {
            StackError::Patch("compose file has no top-level 'services:' block".to_string())
        })?;
    let Some(service_indent) = first_child_indent(lines, services_start, services_end)? else {
        return Ok(None);
    };
    let Some((_, body_start, body_end)) =
        find_block_range(lines, services_start, services_end, service, service_indent)?
    else {
        return Ok(None);
    };
    Ok(Some(ServiceBlock {
        body_start,
        body_end,
        child_indent: first_child_indent(lines, body_start, body_end)?,
    }))
}

fn comment_line(line: &str, indent: usize) -> String {
    format!("{}# {}", &line[..indent], &line[indent..])
}

fn uncomment_line(line: &str, indent: usize) -> Option<String> {
    let pad = line.get(..indent)?;
    if !pad.bytes().all(|b| b == b' ') {
        return None;
    }
    let rest = line[indent..].strip_prefix("# ")?;
    Some(format!("{pad}{rest}"))
}

fn find_active_directive(
    lines: &[String],
    block: &ServiceBlock,
    indent: usize,
) -> Result<Option<DirectiveSpan>, StackError> {
    for idx in block.body_start..block.body_end {
        if match_scalar_key_line(&lines[idx], SECURITY_DIRECTIVE_KEY)? != Some(indent) {
            continue;
        }
        let mut end = idx + 1;
        while end < block.body_end {
            let line = &lines[end];
            if line.trim().is_empty() {
                break;
            }
            let line_indent = leading_space_count(line)?;
            let continues =
                line_indent > indent || (line_indent == indent && line[indent..].starts_with('-'));
            if !continues {
                break;
            }
            end += 1;
        }
        return Ok(Some(DirectiveSpan {
            state: DirectiveState::Active,
            start: idx,
            end,
            indent,
        }));
    }
    Ok(None)
}

/// Anchors on the annotated last line and walks back over the commented
/// continuation lines to the nearest commented `cap_drop:` header, so only
/// lines produced by `comment_line` are claimed.
fn find_suspended_directive(
    lines: &[String],
    block: &ServiceBlock,
    indent: usize,
) -> Result<Option<DirectiveSpan>, StackError> {
    let annotation = format!("  {FIRST_RUN_ANNOTATION}");
    for annotated in block.body_start..block.body_end {
        let Some(stripped) = lines[annotated].strip_suffix(annotation.as_str()) else {
            continue;
        };
        let mut start = annotated;
        loop {
            let line = if start == annotated {
                stripped
            } else {
                lines[start].as_str()
            };
            let Some(restored) = uncomment_line(line, indent) else {
                break;
            };
            if match_scalar_key_line(&restored, SECURITY_DIRECTIVE_KEY)? == Some(indent) {
                return Ok(Some(DirectiveSpan {
                    state: DirectiveState::Suspended,
                    start,
                    end: annotated + 1,
                    indent,
                }));
            }
            let restored_indent = leading_space_count(&restored)?;
            let continues = restored_indent > indent
                || (restored_indent == indent && restored[indent..].starts_with('-'));
            if !continues || start == block.body_start {
                break;
            }
            start -= 1;
        }
    }
    Ok(None)
}

fn locate_directive(lines: &[String], service: &str) -> Result<Option<DirectiveSpan>, StackError> {
    let Some(block) = locate_service_block(lines, service)? else {
        return Ok(None);
    };
    let Some(indent) = block.child_indent else {
        return Ok(None);
    };
    let active = find_active_directive(lines, &block, indent)?;
    let suspended = find_suspended_directive(lines, &block, indent)?;
    match (active, suspended) {
        (Some(_), Some(_)) => Err(StackError::Patch(format!(
            "service '{service}' has both an active and a suspended '{SECURITY_DIRECTIVE_KEY}' block"
        ))),
        (Some(span), None) | (None, Some(span)) => Ok(Some(span)),
        (None, None) => Ok(None),
    }
}

/// Comments out (`disable = true`) or restores the `cap_drop` block of one
/// service. Returns the new document and whether anything changed; other
/// services are never touched.
fn toggle_directive(
    document: &ConfigDocument,
    service: &str,
    disable: bool,
) -> Result<(ConfigDocument, bool), StackError> {
    let (mut lines, endings) = split_lines(document.as_str());
    let Some(span) = locate_directive(&lines, service)? else {
        return Ok((document.clone(), false));
    };
    match (span.state, disable) {
        (DirectiveState::Active, true) => {
            let last = span.end - 1;
            for idx in span.start..span.end {
                let mut commented = comment_line(&lines[idx], span.indent);
                if idx == last {
                    commented.push_str("  ");
                    commented.push_str(FIRST_RUN_ANNOTATION);
                }
                lines[idx] = commented;
            }
        }
        (DirectiveState::Suspended, false) => {
            let annotation = format!("  {FIRST_RUN_ANNOTATION}");
            let last = span.end - 1;
            for idx in span.start..span.end {
                let line = if idx == last {
                    lines[idx].strip_suffix(&annotation).unwrap_or(&lines[idx])
                } else {
                    lines[idx].as_str()
                };
                let restored = uncomment_line(line, span.indent).ok_or_else(|| {
                    StackError::Patch(format!(
                        "suspended '{SECURITY_DIRECTIVE_KEY}' line {} of service '{service}' is malformed",
                        idx + 1
                    ))
                })?;
                lines[idx] = restored;
            }
        }
        _ => return Ok((document.clone(), false)),
    }
    Ok((ConfigDocument::new(join_lines(&lines, &endings)), true))
}

#[derive(Debug, Clone, Serialize)]
struct PatchReport {
    path: PathBuf,
    service: String,
    disable: bool,
    changed: bool,
    line_ending: LineEnding,
}

fn apply_first_run_patch(
    ctx: &Context,
    cfg: &Config,
    state: FirstRunState,
) -> Result<PatchReport, StackError> {
    let path = compose_document_path(ctx, cfg);
    if !path.exists() {
        return Err(StackError::Patch(format!(
            "compose file not found: {}",
            path.display()
        )));
    }
    let document = ConfigDocument::new(fs::read_to_string(&path)?);
    let disable = state.needs_bootstrap();
    let (updated, changed) = toggle_directive(&document, &cfg.first_run.service, disable)?;
    if changed {
        write_atomic_text_file_preserving_mode(&path, updated.as_str(), 0o644)?;
    }
    Ok(PatchReport {
        path,
        service: cfg.first_run.service.clone(),
        disable,
        changed,
        line_ending: document.line_ending(),
    })
}

fn describe_patch(report: &PatchReport) -> String {
    match (report.disable, report.changed) {
        (true, true) => format!(
            "First run detected for {}: temporarily commented out '{SECURITY_DIRECTIVE_KEY}'. It is restored automatically once the service has initialized.",
            report.service
        ),
        (false, true) => format!(
            "{} has been initialized: re-enabled '{SECURITY_DIRECTIVE_KEY}'.",
            report.service
        ),
        _ => format!(
            "No '{SECURITY_DIRECTIVE_KEY}' change needed for {}.",
            report.service
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum FirstRunState {
    FirstRun,
    Initialized,
    Unknown,
}

impl FirstRunState {
    /// Unknown counts as a first run so the accommodation is never skipped on doubt.
    fn needs_bootstrap(self) -> bool {
        self != FirstRunState::Initialized
    }
}

#[derive(Debug, Clone, Serialize)]
struct ProbeReport {
    service: String,
    state: FirstRunState,
    container: Option<String>,
    reason: String,
}

fn first_container_name(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}

fn probe_first_run<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    first_run: &FirstRunConfig,
) -> ProbeReport {
    let report = |state, container: Option<String>, reason: String| ProbeReport {
        service: first_run.service.clone(),
        state,
        container,
        reason,
    };

    let list_args = vec![
        "ps".to_string(),
        "--filter".to_string(),
        format!("name={}", first_run.container_filter),
        "--format".to_string(),
        "{{.Names}}".to_string(),
    ];
    let listed = match runner.run(&list_args, &ctx.project_dir, true) {
        Ok(output) if output.success() => output,
        Ok(output) => {
            return report(
                FirstRunState::Unknown,
                None,
                format!(
                    "listing containers exited with status {}",
                    output.status_code
                ),
            )
        }
        Err(err) => {
            return report(
                FirstRunState::Unknown,
                None,
                format!("failed to list containers: {err}"),
            )
        }
    };
    let Some(container) = first_container_name(&String::from_utf8_lossy(&listed.stdout)) else {
        return report(
            FirstRunState::Unknown,
            None,
            format!(
                "no running container matches name={}",
                first_run.container_filter
            ),
        );
    };

    let script = format!(
        "[ -f {} ] && echo found || echo not_found",
        shell_single_quote(&first_run.marker_path)
    );
    let exec_args = vec![
        "exec".to_string(),
        container.clone(),
        "sh".to_string(),
        "-c".to_string(),
        script,
    ];
    match runner.run(&exec_args, &ctx.project_dir, true) {
        Ok(output) if output.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            match stdout.trim() {
                "found" => report(
                    FirstRunState::Initialized,
                    Some(container),
                    format!("{} exists in the container", first_run.marker_path),
                ),
                "not_found" => report(
                    FirstRunState::FirstRun,
                    Some(container),
                    format!("{} is missing in the container", first_run.marker_path),
                ),
                other => report(
                    FirstRunState::Unknown,
                    Some(container),
                    format!("unexpected marker check output '{other}'"),
                ),
            }
        }
        Ok(output) => report(
            FirstRunState::Unknown,
            Some(container),
            format!("marker check exited with status {}", output.status_code),
        ),
        Err(err) => report(
            FirstRunState::Unknown,
            Some(container),
            format!("failed to run marker check: {err}"),
        ),
    }
}

#[derive(Debug, Clone, Serialize)]
struct SecretReport {
    settings_file: PathBuf,
    seeded_from_template: bool,
    key_generated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<String>,
}

fn ensure_bootstrap_secret(
    ctx: &Context,
    cfg: &Config,
    generator: &dyn SecretGenerator,
) -> Result<SecretReport, StackError> {
    let settings_path = ctx.project_dir.join(&cfg.secrets.settings_file);
    let template_path = ctx.project_dir.join(&cfg.secrets.template_file);
    let mut report = SecretReport {
        settings_file: settings_path.clone(),
        seeded_from_template: false,
        key_generated: false,
        skipped: None,
    };

    if !settings_path.exists() {
        if !template_path.exists() {
            report.skipped = Some(format!(
                "neither {} nor its template {} exists",
                settings_path.display(),
                template_path.display()
            ));
            return Ok(report);
        }
        ensure_parent(&settings_path)?;
        fs::copy(&template_path, &settings_path)?;
        report.seeded_from_template = true;
    }

    let content = fs::read_to_string(&settings_path)?;
    if !content.contains(&cfg.secrets.placeholder) {
        return Ok(report);
    }
    let key = generator.random_hex(cfg.secrets.bytes)?;
    let updated = content.replace(&cfg.secrets.placeholder, &key);
    write_atomic_text_file_preserving_mode(&settings_path, &updated, 0o644)?;
    report.key_generated = true;
    Ok(report)
}

fn render_docker_command(args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push("docker".to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn docker_spawn_error_details(err: &io::Error, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("unknown command: docker compose")
        || lower.contains("is not a docker command")
        || lower.contains("unknown shorthand flag: 'f' in -f")
    {
        return (
            "docker_compose_unavailable".to_string(),
            Some("Docker Compose v2 is unavailable. Install the compose plugin and retry.".to_string()),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some("A required host port is already in use. Stop the conflicting process or change the overlay port mapping.".to_string()),
        );
    }

    if lower.contains("no such file or directory") && lower.contains(".yml") {
        return (
            "docker_compose_file_missing".to_string(),
            Some("A compose file is missing. Run from the project directory or pass --project-dir.".to_string()),
        );
    }

    if lower.contains("tls handshake timeout")
        || lower.contains("i/o timeout")
        || lower.contains("connection reset by peer")
        || lower.contains("temporary failure in name resolution")
    {
        return (
            "docker_network_transient".to_string(),
            Some("The registry could not be reached reliably. Check network connectivity and retry.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") || lower.contains("authentication")
    {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login` for the registry hosting the image.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

fn execute_docker<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    args: &[String],
    capture_output: bool,
    passthrough_stdout: bool,
) -> Result<CommandOutput, StackError> {
    let command = render_docker_command(args);
    if !ctx.json {
        println!("Running: {command}");
    }
    let cmd_output = runner
        .run(args, &ctx.project_dir, capture_output)
        .map_err(|err| {
            let details = docker_spawn_error_details(&err, &command);
            StackError::ProcessDetailed {
                message: format!("failed to run command `{command}`: {err}"),
                details,
            }
        })?;
    if !cmd_output.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr)
            .trim()
            .to_string();
        let (error_code, hint) = classify_docker_command_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(StackError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
            },
        });
    }
    if capture_output && passthrough_stdout && !cmd_output.stdout.is_empty() && !ctx.json {
        let stdout = String::from_utf8_lossy(&cmd_output.stdout);
        print!("{stdout}");
    }
    if capture_output && passthrough_stdout && !cmd_output.stderr.is_empty() && !ctx.json {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr);
        eprint!("{stderr}");
    }
    Ok(cmd_output)
}

fn run_plan<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    plan: &InvocationPlan,
) -> Result<CommandOutput, StackError> {
    // Stream output to the terminal unless stdout is reserved for JSON.
    execute_docker(ctx, runner, plan.args(), ctx.json, true)
}

/// Pulls always capture so a failed attempt keeps its stderr for
/// classification; output is echoed afterwards in text mode.
fn run_pull_plan<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    plan: &InvocationPlan,
) -> Result<CommandOutput, StackError> {
    execute_docker(ctx, runner, plan.args(), true, true)
}

fn validate_compose<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    cfg: &Config,
    selection: &StackSelection,
) -> Result<InvocationPlan, StackError> {
    let plan = build_invocation(cfg, selection, &ComposeAction::Validate, &[]);
    match execute_docker(ctx, runner, plan.args(), true, false) {
        Ok(_) => Ok(plan),
        Err(StackError::ProcessDetailed { message, details })
            if details.error_code != "docker_not_found" =>
        {
            Err(StackError::ComposeInvalid { message, details })
        }
        Err(err) => Err(err),
    }
}

fn running_services<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    cfg: &Config,
    selection: &StackSelection,
) -> Result<Vec<String>, StackError> {
    let plan = build_invocation(cfg, selection, &ComposeAction::RunningServices, &[]);
    let output = execute_docker(ctx, runner, plan.args(), true, false)?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

/// Pulls images for `scope`, retrying failed pulls after a fixed delay.
/// Returns the number of attempts used; an empty service set issues none.
fn pull_with_retry<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    cfg: &Config,
    selection: &StackSelection,
    scope: &PullScope,
    policy: RetryPolicy,
) -> Result<u32, StackError> {
    let action = match scope {
        PullScope::Services(set) if set.is_empty() => return Ok(0),
        PullScope::Services(set) => ComposeAction::Pull(set.names().to_vec()),
        PullScope::Everything => ComposeAction::Pull(Vec::new()),
    };
    let plan = build_invocation(cfg, selection, &action, &[]);
    let mut last_details = ProcessErrorDetails::default();
    for attempt in 1..=policy.attempts {
        match run_pull_plan(ctx, runner, &plan) {
            Ok(_) => return Ok(attempt),
            Err(err) => {
                warn(format!(
                    "pull attempt {attempt}/{} failed: {err}",
                    policy.attempts
                ));
                if let Some(details) = extract_process_error_details(&err) {
                    last_details = details;
                }
                if attempt < policy.attempts {
                    thread::sleep(policy.delay);
                }
            }
        }
    }
    Err(StackError::PullExhausted {
        attempts: policy.attempts,
        services: scope.describe(),
        details: ProcessErrorDetails {
            error_code: "docker_pull_retry_exhausted".to_string(),
            hint: last_details.hint.or_else(|| {
                Some("Check network connectivity and registry access, then rerun.".to_string())
            }),
            command: Some(plan.render()),
            raw_stderr: last_details.raw_stderr,
        },
    })
}

#[derive(Debug, Clone, Default)]
struct StartOptions {
    stack: StackArgs,
    pull_all: bool,
    update_running: bool,
}

fn step(ctx: &Context, title: &str) {
    if !ctx.json {
        println!("{} {}", style("==>").bold().cyan(), style(title).bold());
    }
}

fn warn(message: impl AsRef<str>) {
    eprintln!("warning: {}", message.as_ref());
}

fn handle_start<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    generator: &dyn SecretGenerator,
    options: &StartOptions,
) -> Result<(), StackError> {
    if options.pull_all && options.update_running {
        return Err(StackError::Usage(
            "--pull-all conflicts with --update-running".to_string(),
        ));
    }
    let cfg = load_config(ctx)?;
    let selection = resolve_selection(&cfg, &options.stack)?;
    let policy = RetryPolicy::from_config(&cfg.pull);
    let started_at = Utc::now().to_rfc3339();

    step(ctx, "Validating compose configuration");
    validate_compose(ctx, runner, &cfg, &selection)?;

    if options.update_running {
        let summary = update_running_services(ctx, runner, &cfg, &selection, policy)?;
        return output(
            ctx,
            json!({
                "action": "update_running",
                "profile": selection.profile,
                "environment": selection.environment,
                "started_at": started_at,
                "finished_at": Utc::now().to_rfc3339(),
                "update": summary,
            }),
        );
    }

    step(ctx, "Checking search settings secret");
    let secret = match ensure_bootstrap_secret(ctx, &cfg, generator) {
        Ok(report) => {
            if let Some(reason) = &report.skipped {
                warn(format!("secret bootstrap skipped: {reason}"));
            }
            json!(report)
        }
        Err(err) => {
            warn(format!(
                "{err}; replace '{}' in {} manually",
                cfg.secrets.placeholder, cfg.secrets.settings_file
            ));
            json!({"error": err.to_string()})
        }
    };

    step(ctx, &format!("Checking first-run state of {}", cfg.first_run.service));
    let probe = probe_first_run(ctx, runner, &cfg.first_run);
    if probe.state == FirstRunState::Unknown {
        warn(format!("{}; assuming first run", probe.reason));
    }
    let patch = match apply_first_run_patch(ctx, &cfg, probe.state) {
        Ok(report) => {
            if !ctx.json {
                println!("{}", describe_patch(&report));
            }
            json!(report)
        }
        Err(err) => {
            warn(format!("{err}; continuing without the first-run patch"));
            json!({"error": err.to_string()})
        }
    };

    let mut pull_attempts = None;
    if options.pull_all {
        step(ctx, "Pulling latest images");
        pull_attempts = Some(pull_with_retry(
            ctx,
            runner,
            &cfg,
            &selection,
            &PullScope::Everything,
            policy,
        )?);
    }

    step(ctx, "Stopping existing containers");
    run_plan(
        ctx,
        runner,
        &build_invocation(&cfg, &selection, &ComposeAction::Down, &[]),
    )?;

    step(ctx, "Starting services");
    run_plan(
        ctx,
        runner,
        &build_invocation(&cfg, &selection, &ComposeAction::Up, &[]),
    )?;

    output(
        ctx,
        json!({
            "action": "start",
            "project": cfg.stack.project_name,
            "profile": selection.profile,
            "environment": selection.environment,
            "started_at": started_at,
            "finished_at": Utc::now().to_rfc3339(),
            "secret": secret,
            "first_run": probe,
            "patch": patch,
            "pull_attempts": pull_attempts,
        }),
    )
}

fn update_running_services<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    cfg: &Config,
    selection: &StackSelection,
    policy: RetryPolicy,
) -> Result<serde_json::Value, StackError> {
    let targeted = ServiceSet::for_profile(selection.profile, &cfg.pull.always_services);
    let running = running_services(ctx, runner, cfg, selection)?;
    let refresh = targeted.retain_running(&running);
    if refresh.is_empty() {
        step(ctx, "No targeted services are running; nothing to update");
        return Ok(json!({
            "targeted": targeted,
            "refreshed": refresh,
            "pull_attempts": 0,
        }));
    }

    step(ctx, &format!("Pulling images for {}", refresh.describe()));
    let attempts = pull_with_retry(
        ctx,
        runner,
        cfg,
        selection,
        &PullScope::Services(refresh.clone()),
        policy,
    )?;

    step(ctx, &format!("Recreating {}", refresh.describe()));
    run_plan(
        ctx,
        runner,
        &build_invocation(
            cfg,
            selection,
            &ComposeAction::Recreate(refresh.names().to_vec()),
            &[],
        ),
    )?;
    Ok(json!({
        "targeted": targeted,
        "refreshed": refresh,
        "pull_attempts": attempts,
    }))
}

fn handle_verify<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    stack: &StackArgs,
) -> Result<(), StackError> {
    let cfg = load_config(ctx)?;
    let selection = resolve_selection(&cfg, stack)?;
    let plan = validate_compose(ctx, runner, &cfg, &selection)?;
    output(
        ctx,
        json!({
            "valid": true,
            "profile": selection.profile,
            "environment": selection.environment,
            "files": plan.files(),
        }),
    )
}

fn handle_down<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    stack: &StackArgs,
) -> Result<(), StackError> {
    let cfg = load_config(ctx)?;
    let selection = resolve_selection(&cfg, stack)?;
    step(ctx, "Stopping existing containers");
    run_plan(
        ctx,
        runner,
        &build_invocation(&cfg, &selection, &ComposeAction::Down, &[]),
    )?;
    output(
        ctx,
        json!({"action": "down", "project": cfg.stack.project_name}),
    )
}

fn handle_probe<R: DockerRunner>(ctx: &Context, runner: &R) -> Result<(), StackError> {
    let cfg = load_config(ctx)?;
    let probe = probe_first_run(ctx, runner, &cfg.first_run);
    let directive = match fs::read_to_string(compose_document_path(ctx, &cfg)) {
        Ok(text) => match ConfigDocument::new(text).directive_state(&cfg.first_run.service) {
            Ok(state) => json!(state),
            Err(err) => json!({"error": err.to_string()}),
        },
        Err(err) => json!({"error": err.to_string()}),
    };
    output(ctx, json!({"probe": probe, "directive": directive}))
}

fn handle_bootstrap<R: DockerRunner>(ctx: &Context, runner: &R) -> Result<(), StackError> {
    let cfg = load_config(ctx)?;
    let probe = probe_first_run(ctx, runner, &cfg.first_run);
    if probe.state == FirstRunState::Unknown {
        warn(format!("{}; assuming first run", probe.reason));
    }
    let patch = apply_first_run_patch(ctx, &cfg, probe.state)?;
    if !ctx.json {
        println!("{}", describe_patch(&patch));
    }
    output(ctx, json!({"first_run": probe, "patch": patch}))
}

fn handle_secrets(ctx: &Context, generator: &dyn SecretGenerator) -> Result<(), StackError> {
    let cfg = load_config(ctx)?;
    let report = ensure_bootstrap_secret(ctx, &cfg, generator)?;
    if let Some(reason) = &report.skipped {
        warn(format!("secret bootstrap skipped: {reason}"));
    }
    output(ctx, json!(report))
}

fn handle_plan(
    ctx: &Context,
    action: &str,
    services: Vec<String>,
    stack: &StackArgs,
) -> Result<(), StackError> {
    let cfg = load_config(ctx)?;
    let selection = resolve_selection(&cfg, stack)?;
    let action = ComposeAction::parse(action, services)?;
    let plan = build_invocation(&cfg, &selection, &action, &[]);
    if !ctx.json {
        println!("{}", plan.render());
        return Ok(());
    }
    output(
        ctx,
        json!({
            "args": plan.args(),
            "files": plan.files(),
            "command": plan.render(),
            "service_set": ServiceSet::for_profile(selection.profile, &cfg.pull.always_services),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    message: String,
    remediation: String,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    message: impl Into<String>,
    remediation: impl Into<String>,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        message: message.into(),
        remediation: remediation.into(),
    }
}

fn docker_probe_succeeds(args: &[&str]) -> bool {
    Command::new("docker")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn collect_doctor_checks(
    ctx: &Context,
    cfg: &Config,
    generator: &dyn SecretGenerator,
) -> Result<Vec<DoctorCheck>, StackError> {
    let mut checks = Vec::new();

    let docker_installed = which::which("docker").is_ok();
    let docker_ok = docker_installed && docker_probe_succeeds(&["info"]);
    checks.push(doctor_check(
        "docker_runtime",
        docker_ok,
        "error",
        if docker_ok {
            "docker daemon reachable"
        } else if docker_installed {
            "docker is installed but the daemon is unreachable"
        } else {
            "docker is not installed or not in PATH"
        },
        "Install/start Docker Desktop (or dockerd) and rerun `localai doctor`.",
    ));

    let compose_ok = docker_installed && docker_probe_succeeds(&["compose", "version"]);
    checks.push(doctor_check(
        "docker_compose",
        compose_ok,
        "error",
        if compose_ok {
            "docker compose is available"
        } else {
            "docker compose is not available"
        },
        "Install the Docker Compose v2 plugin and rerun `localai doctor`.",
    ));

    let tool = generator.required_tool();
    let tool_ok = which::which(tool).is_ok();
    checks.push(doctor_check(
        "secret_generator",
        tool_ok,
        "warning",
        if tool_ok {
            format!("{tool} is available for secret generation")
        } else {
            format!("{tool} is not in PATH; the search secret cannot be generated")
        },
        format!("Install {tool} or replace '{}' in {} manually.", cfg.secrets.placeholder, cfg.secrets.settings_file),
    ));

    let selection = resolve_selection(cfg, &StackArgs::default())?;
    let plan = build_invocation(cfg, &selection, &ComposeAction::Validate, &[]);
    let missing: Vec<String> = plan
        .files()
        .into_iter()
        .filter(|file| !ctx.project_dir.join(file).exists())
        .map(ToString::to_string)
        .collect();
    checks.push(doctor_check(
        "compose_files",
        missing.is_empty(),
        "error",
        if missing.is_empty() {
            "compose files present".to_string()
        } else {
            format!("missing compose files: {}", missing.join(", "))
        },
        "Run from the project checkout or pass --project-dir.",
    ));

    let settings_ok = ctx.project_dir.join(&cfg.secrets.settings_file).exists()
        || ctx.project_dir.join(&cfg.secrets.template_file).exists();
    checks.push(doctor_check(
        "search_settings",
        settings_ok,
        "warning",
        if settings_ok {
            "search settings (or its template) present"
        } else {
            "neither search settings nor its template exists"
        },
        format!("Restore {} from the project checkout.", cfg.secrets.template_file),
    ));

    Ok(checks)
}

fn handle_doctor(ctx: &Context, generator: &dyn SecretGenerator) -> Result<(), StackError> {
    let cfg = load_config(ctx)?;
    let checks = collect_doctor_checks(ctx, &cfg, generator)?;
    let ok = !checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");
    let primary_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .map(|check| check.message.clone());

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: primary_error,
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!(
            "[{}] {} ({}) - {}",
            state, check.id, check.severity, check.message
        );
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    match primary_error {
        Some(message) => Err(StackError::Config(message)),
        None => Ok(()),
    }
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), StackError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            if !ctx.config_path.exists() {
                return Err(StackError::Config(format!(
                    "config file not found: {}; run `localai config init` first",
                    ctx.config_path.display()
                )));
            }
            read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(ctx)?;
            output(
                ctx,
                json!({
                    "path": ctx.config_path,
                    "exists": ctx.config_path.exists(),
                    "project_dir": ctx.project_dir,
                    "config": cfg,
                }),
            )
        }
    }
}

fn extract_process_error_details(err: &StackError) -> Option<ProcessErrorDetails> {
    match err {
        StackError::ProcessDetailed { details, .. }
        | StackError::ComposeInvalid { details, .. }
        | StackError::PullExhausted { details, .. } => Some(details.clone()),
        _ => None,
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), StackError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), StackError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
