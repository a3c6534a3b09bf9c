use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use taskgate::orchestration::{
    ChannelSink, ExecutionClient, Notification, Script, ScriptResponses, ScriptedClient,
    TaskOrchestrator, TaskRequest,
};
use taskgate::{classify, tglog, Config, PermissionMode, PlanResponse, Result, UserId};

/// taskgate - per-user agent task orchestration with human-in-the-loop gates
#[derive(Parser, Debug)]
#[command(name = "taskgate")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TASKGATE_DEBUG=1     Enable debug logging (alternative to --debug)\n    TASKGATE_LOG=<level> Set the log level explicitly")]
pub struct Cli {
    /// Resolve permission and question gates without asking (plans still wait)
    #[arg(short = 't', long, global = true)]
    pub trust: bool,

    /// Enable debug logging (writes to ~/.taskgate/taskgate.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a scripted task through the orchestrator and print its notifications
    Run {
        /// JSON script describing the backend's events
        #[arg(long)]
        script: PathBuf,

        /// Prompt passed to the backend
        #[arg(long, default_value = "scripted run")]
        prompt: String,

        /// User to run the task for
        #[arg(long, default_value_t = 1)]
        user: i64,

        /// Working directory (defaults to the configured working root)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Session id to resume
        #[arg(long)]
        resume: Option<String>,

        /// Answer gates from the script's `responses` lists
        #[arg(long)]
        auto_respond: bool,
    },

    /// Print how a tool call would be classified
    Classify {
        /// Tool name, e.g. Bash or Write
        tool: String,

        /// Tool input as JSON
        input: String,

        /// Working directory for path isolation (defaults to the current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    taskgate::log::init_with_debug(cli.debug);

    match cli.command.clone() {
        Command::Run {
            script,
            prompt,
            user,
            cwd,
            resume,
            auto_respond,
        } => run_script(&cli, script, prompt, UserId(user), cwd, resume, auto_respond),
        Command::Classify { tool, input, cwd } => run_classify(&cli, &tool, &input, cwd),
        Command::Config => show_config(&cli),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load()?;
    if cli.trust {
        config.permission_mode = PermissionMode::TrustAll;
    }
    Ok(config)
}

fn show_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn run_classify(cli: &Cli, tool: &str, input: &str, cwd: Option<PathBuf>) -> Result<()> {
    let config = load_config(cli)?;
    let input: serde_json::Value = serde_json::from_str(input)?;
    let working_dir = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let classification = classify(tool, &input, &working_dir, config.permission_mode);
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

/// Answers gates from a script's canned responses.
struct AutoResponder {
    enabled: bool,
    permission: VecDeque<bool>,
    question: VecDeque<String>,
    plan: VecDeque<String>,
}

impl AutoResponder {
    fn new(responses: ScriptResponses, enabled: bool) -> Self {
        Self {
            enabled,
            permission: responses.permission.into(),
            question: responses.question.into(),
            plan: responses.plan.into(),
        }
    }

    fn react(&mut self, orchestrator: &TaskOrchestrator, user: UserId, notification: &Notification) {
        if !self.enabled {
            return;
        }
        match notification {
            Notification::PermissionRequested { .. } => {
                let approved = self.permission.pop_front().unwrap_or(true);
                let delivered = orchestrator.respond_to_permission(user, approved, None);
                eprintln!("auto-respond permission={} delivered={}", approved, delivered);
            }
            Notification::QuestionAsked(question) => {
                let answer = self
                    .question
                    .pop_front()
                    .or_else(|| question.options.first().cloned())
                    .unwrap_or_default();
                let delivered = orchestrator.respond_to_question(user, answer.clone());
                eprintln!("auto-respond answer={:?} delivered={}", answer, delivered);
            }
            Notification::PlanRequested(_) => {
                let response = match self.plan.pop_front() {
                    Some(text) => text.parse().unwrap_or_else(|e| {
                        eprintln!("{}; approving instead", e);
                        PlanResponse::Approve
                    }),
                    None => PlanResponse::Approve,
                };
                let delivered = orchestrator.respond_to_plan(user, response.clone());
                eprintln!("auto-respond plan={} delivered={}", response, delivered);
            }
            _ => {}
        }
    }
}

fn run_script(
    cli: &Cli,
    script_path: PathBuf,
    prompt: String,
    user: UserId,
    cwd: Option<PathBuf>,
    resume: Option<String>,
    auto_respond: bool,
) -> Result<()> {
    let config = load_config(cli)?;
    let script = Script::load(&script_path)?;
    tglog!(
        "Run command: script={}, user={}, trust={}, auto_respond={}",
        script_path.display(),
        user,
        cli.trust,
        auto_respond
    );

    let responses = script.responses.clone();
    let factory = Arc::new(move |_user: UserId| -> Arc<dyn ExecutionClient> {
        Arc::new(ScriptedClient::new(script.clone()))
    });
    let orchestrator = Arc::new(TaskOrchestrator::new(config, factory));

    let mut request = TaskRequest::new(prompt);
    request.working_dir = cwd;
    request.resume_session_id = resume;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let (sink, mut rx) = ChannelSink::new();
        let printer = {
            let orchestrator = orchestrator.clone();
            let mut responder = AutoResponder::new(responses, auto_respond);
            tokio::spawn(async move {
                while let Some((user, notification)) = rx.recv().await {
                    if let Ok(line) = serde_json::to_string(&notification) {
                        println!("{}", line);
                    }
                    if let Notification::GateTimedOut(gate) = &notification {
                        eprintln!("{}", Notification::timed_out_message(*gate));
                    }
                    responder.react(&orchestrator, user, &notification);
                    if matches!(notification, Notification::TaskFinished(_)) {
                        break;
                    }
                }
            })
        };

        let result = orchestrator.start(user, request, Arc::new(sink)).await;
        let _ = printer.await;
        orchestrator.shutdown().await;
        result
    });

    eprintln!(
        "task {} {} after {} attempt(s)",
        result.task_id.short(),
        result.status,
        result.attempts
    );
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
