use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use outfit_scan::{
    app_state::AppState,
    config::ClientConfig,
    models::{
        analysis::AnalysisResult,
        job::{JobId, JobSnapshot, JobStatus},
        user::{LoginRequest, RegisterRequest},
    },
    services::{
        api::{ApiError, ImageUpload},
        jobs::{JobEvent, JobOutcome, PollHandle, SubmitFailure},
        notify::{ConsoleNotifier, Notifier, TracingNotifier},
    },
};

const EXIT_FAILURE: u8 = 1;
const EXIT_AUTH_REQUIRED: u8 = 2;
const EXIT_UPGRADE_REQUIRED: u8 = 3;

#[derive(Parser)]
#[command(name = "outfit-scan")]
#[command(about = "Analyze outfit photos and browse similar items")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false, env = "LOG_JSON")]
    json_logs: bool,

    /// Override API_BASE_URL
    #[arg(long, global = true)]
    api_base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "OUTFIT_SCAN_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and store the session token
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "OUTFIT_SCAN_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        username: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the logged-in account
    Whoami,
    /// Upload a photo and wait for the analysis
    Analyze {
        file: PathBuf,
        /// The photo shows you
        #[arg(long, default_value_t = false)]
        owner: bool,
    },
    /// List recent analysis jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Print one job's current status
    Status { job_id: String },
    /// Poll an existing job until it finishes
    Watch { job_id: String },
    /// Remove a job from history
    Delete { job_id: String },
    /// Queue a completed job's result for the results view
    Open { job_id: String },
    /// Print and clear the queued result
    TakeResult,
    /// Show the weekly upload allowance
    Quota,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    describe_metrics();

    let mut config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: failed to load configuration: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    if let Some(base) = cli.api_base_url {
        config.api_base_url = base;
    }

    // JSON mode is for log collectors, so notifications go to the log too.
    let notifier: Arc<dyn Notifier> = if cli.json_logs {
        Arc::new(TracingNotifier)
    } else {
        Arc::new(ConsoleNotifier)
    };
    let state = match AppState::from_config(&config, notifier) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    tracing::debug!(api = %config.api_root(), "Client initialized");

    run(cli.command, &state).await
}

async fn run(command: Command, state: &AppState) -> ExitCode {
    match command {
        Command::Login { email, password } => {
            let request = LoginRequest { email, password };
            match state.api.login(&request).await {
                Ok(_) => {
                    println!("Logged in as {}", request.email);
                    ExitCode::SUCCESS
                }
                Err(e) => api_failure(&e),
            }
        }
        Command::Register {
            email,
            password,
            username,
        } => {
            let request = RegisterRequest {
                email,
                password,
                username,
            };
            match state.api.register(&request).await {
                Ok(token) => {
                    println!("Registered {}", request.username);
                    if token.needs_quiz {
                        println!("Finish the style quiz in the web app for better recommendations.");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => api_failure(&e),
            }
        }
        Command::Logout => match state.api.logout() {
            Ok(()) => {
                println!("Logged out");
                ExitCode::SUCCESS
            }
            Err(e) => api_failure(&e),
        },
        Command::Whoami => match state.api.me().await {
            Ok(user) => {
                println!("{} <{}>", user.username, user.email);
                println!("plan: {}", user.tier());
                if !user.is_premium() {
                    let limit = match state.quota.refresh().await {
                        Ok(quota) => quota.uploads_limit,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to fetch upload limit");
                            None
                        }
                    };
                    match limit {
                        Some(limit) => {
                            println!("uploads this week: {}/{limit}", user.weekly_uploads_used)
                        }
                        None => println!("uploads this week: {}", user.weekly_uploads_used),
                    }
                }
                ExitCode::SUCCESS
            }
            Err(e) => api_failure(&e),
        },
        Command::Analyze { file, owner } => {
            let upload = match ImageUpload::from_path(&file) {
                Ok(upload) => upload.with_owner(owner),
                Err(e) => {
                    eprintln!("error: cannot read {}: {e}", file.display());
                    return ExitCode::from(EXIT_FAILURE);
                }
            };
            match state.analysis.start(&upload).await {
                Ok(handle) => {
                    println!("Submitted job {}", handle.job_id());
                    follow(handle, state).await
                }
                Err(failure) => submit_failure(&failure),
            }
        }
        Command::Jobs { limit } => match state.analysis.history(limit).await {
            Ok(jobs) if jobs.is_empty() => {
                println!("No analysis jobs yet.");
                ExitCode::SUCCESS
            }
            Ok(jobs) => {
                for job in &jobs {
                    print_job_line(job);
                }
                ExitCode::SUCCESS
            }
            Err(e) => exit_code_for(&e),
        },
        Command::Status { job_id } => match state.api.job_status(&JobId::new(job_id)).await {
            Ok(snapshot) => match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(EXIT_FAILURE)
                }
            },
            Err(e) => api_failure(&e),
        },
        Command::Watch { job_id } => {
            let handle = state.analysis.watch(JobId::new(job_id));
            follow(handle, state).await
        }
        Command::Delete { job_id } => match state.analysis.remove(&JobId::new(job_id)).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => exit_code_for(&e),
        },
        Command::Open { job_id } => match state.api.job_status(&JobId::new(job_id)).await {
            Ok(snapshot) => match state.analysis.open_result(&snapshot) {
                Some(_) => {
                    println!("Result queued. Run `outfit-scan take-result` to view it.");
                    ExitCode::SUCCESS
                }
                None => ExitCode::from(EXIT_FAILURE),
            },
            Err(e) => api_failure(&e),
        },
        Command::TakeResult => match state.analysis.take_result() {
            Some(result) => {
                print_result(&result);
                ExitCode::SUCCESS
            }
            None => {
                println!("No pending analysis result.");
                ExitCode::SUCCESS
            }
        },
        Command::Quota => match state.quota.refresh().await {
            Ok(limit) => {
                println!("can upload: {}", if limit.can_upload { "yes" } else { "no" });
                println!("reason: {}", limit.reason);
                match limit.remaining() {
                    Some(left) => println!("remaining this week: {left}"),
                    None => println!("remaining this week: unlimited"),
                }
                ExitCode::SUCCESS
            }
            Err(e) => api_failure(&e),
        },
    }
}

/// Print progress until the job finishes. Ctrl-C cancels polling.
async fn follow(mut handle: PollHandle, state: &AppState) -> ExitCode {
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(JobEvent::Progress(phase)) => eprintln!("… {phase}"),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping. The job keeps running on the server; check `outfit-scan jobs` later.");
                handle.cancel();
            }
        }
    }

    match handle.wait().await {
        JobOutcome::Completed(result) => {
            // This process is the results view: consume the hand-off slot.
            let result = state.analysis.take_result().unwrap_or(result);
            print_result(&result);
            ExitCode::SUCCESS
        }
        JobOutcome::AuthRequired => ExitCode::from(EXIT_AUTH_REQUIRED),
        JobOutcome::Failed(_) | JobOutcome::TimedOut { .. } | JobOutcome::Cancelled => {
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn print_result(result: &AnalysisResult) {
    if result.components.is_empty() {
        println!("No clothing detected.");
        return;
    }
    for component in &result.components {
        println!("{} ({})", component.name, component.dominant_color);
        for item in &component.clothing_items {
            println!("  - {} {} {}", item.title, item.price, item.link);
        }
        if !component.similar_queries.is_empty() {
            println!("  try: {}", component.similar_queries.join(", "));
        }
    }
}

fn print_job_line(job: &JobSnapshot) {
    let id = job.job_id.as_ref().map(JobId::as_str).unwrap_or("-");
    let created = job
        .created_at
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let mut line = format!("{id}  {:<10}  {created}", status_label(job.status));
    match job.status {
        JobStatus::Completed => {
            let found = job.result.as_ref().map_or(0, AnalysisResult::item_count);
            line.push_str(&format!("  ({found} items found)"));
        }
        JobStatus::Failed => {
            if let Some(error) = &job.error {
                line.push_str(&format!("  error: {error}"));
            }
        }
        JobStatus::Pending | JobStatus::Processing => {}
    }
    println!("{line}");
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "Queued",
        JobStatus::Processing => "Processing",
        JobStatus::Completed => "Completed",
        JobStatus::Failed => "Failed",
    }
}

fn submit_failure(failure: &SubmitFailure) -> ExitCode {
    match failure {
        SubmitFailure::AuthRequired => ExitCode::from(EXIT_AUTH_REQUIRED),
        SubmitFailure::UpgradeRequired { .. } => ExitCode::from(EXIT_UPGRADE_REQUIRED),
        SubmitFailure::Failed { message } => {
            eprintln!("error: {message}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Report an error that was not already surfaced as a notification.
fn api_failure(error: &ApiError) -> ExitCode {
    eprintln!("error: {}", error.user_message());
    if error.requires_login() {
        eprintln!("  → Run `outfit-scan login` to sign in");
    }
    exit_code_for(error)
}

fn exit_code_for(error: &ApiError) -> ExitCode {
    match error {
        e if e.requires_login() => ExitCode::from(EXIT_AUTH_REQUIRED),
        ApiError::QuotaExceeded { .. } => ExitCode::from(EXIT_UPGRADE_REQUIRED),
        _ => ExitCode::from(EXIT_FAILURE),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn describe_metrics() {
    metrics::describe_counter!("api_requests_total", "Backend requests by operation");
    metrics::describe_histogram!("api_request_seconds", "Backend request latency");
    metrics::describe_counter!("auth_refresh_total", "Token refreshes attempted after a 401");
    metrics::describe_counter!("auth_refresh_failed_total", "Token refreshes that failed");
    metrics::describe_counter!("analysis_jobs_submitted_total", "Images accepted for analysis");
    metrics::describe_counter!("analysis_jobs_completed_total", "Jobs observed completing");
    metrics::describe_counter!("analysis_jobs_failed_total", "Jobs observed failing");
    metrics::describe_counter!("analysis_polls_total", "Job status polls issued");
    metrics::describe_histogram!(
        "analysis_job_seconds",
        "Time from the start of polling to a terminal status"
    );
}
