//! gpuq CLI
//!
//! Entry point for the `gpuq` command-line tool.

use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use gpuq::config::Config;
use gpuq::job::{Job, JobFilter, NewJob, Parameters};
use gpuq::scheduler::{Scheduler, SchedulerError};
use gpuq::signal::{exit_code, send_terminate, ChildRelay, ControlState, PidFile, SignalHandler};
use gpuq::{logging, submit, HolderInfo, HolderKind, JobStatus, JobStore, ResourceLock};
use serde_json::json;

/// Exit code: scheduler stopped because storage kept failing
const EXIT_STORAGE_FAILURE: i32 = 2;

#[derive(Parser)]
#[command(name = "gpuq")]
#[command(about = "Serial job queue for one exclusive resource", version)]
struct Cli {
    /// Config file (default: $GPUQ_CONFIG, then ~/.config/gpuq/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a script
    Submit {
        /// Script to run
        program: PathBuf,

        /// Interpreter used to run the script
        #[arg(long, default_value = "python3")]
        interpreter: String,

        /// Named environment to activate first
        #[arg(long)]
        env: Option<String>,

        /// Parameter as key=value (value parsed as JSON when possible)
        #[arg(long = "param", short = 'p', value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// All parameters as one JSON object (applied before --param)
        #[arg(long, value_name = "JSON")]
        params_json: Option<String>,

        /// Recorded owner (default: current user)
        #[arg(long)]
        owner: Option<String>,

        /// Where notifications for this job go
        #[arg(long)]
        notify: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List jobs, newest first
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,

        /// Only jobs created in the last N days (0 = all)
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete every job from the queue
    Clear {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Run the scheduler in the foreground
    Run,

    /// Toggle pause; a running job is never interrupted
    Pause,

    /// Ask the scheduler to stop after the current job
    Shutdown {
        /// Send SIGTERM to the scheduler process as well
        #[arg(long)]
        signal: bool,
    },

    /// Queue, scheduler and lock overview
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Resource lock commands
    Lock {
        #[command(subcommand)]
        action: LockCommands,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Show the current holder
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove the lock record
    Release {
        /// Remove even if the holder process is still alive
        #[arg(long)]
        force: bool,
    },

    /// Hold the lock while running a command
    Run {
        /// Wait for the lock instead of failing when it is busy
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// The command to run (after --)
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Run) {
        logging::init_stderr("warn");
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok((config, _)) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Submit {
            program,
            interpreter,
            env,
            params,
            params_json,
            owner,
            notify,
            json,
        } => run_submit(&config, program, interpreter, env, &params, params_json, owner, notify, json),
        Commands::List { status, days, json } => run_list(&config, status, days, json),
        Commands::Clear { yes } => run_clear(&config, yes),
        Commands::Run => run_scheduler(&config),
        Commands::Pause => run_pause(&config),
        Commands::Shutdown { signal } => run_shutdown(&config, signal),
        Commands::Status { json } => run_status(&config, json),
        Commands::Lock { action } => match action {
            LockCommands::Status { json } => run_lock_status(&config, json),
            LockCommands::Release { force } => run_lock_release(&config, force),
            LockCommands::Run { wait, timeout, cmd } => run_lock_run(&config, wait, timeout, &cmd),
        },
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{}", message);
    process::exit(1);
}

fn open_store(config: &Config) -> JobStore {
    let path = config.paths.db_path();
    JobStore::open(&path).unwrap_or_else(|e| fail(format!("Error opening job database {}: {}", path.display(), e)))
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => fail(format!("Error serializing output: {}", e)),
    }
}

fn local_time(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn describe_holder(holder: &HolderInfo) -> String {
    let mut text = format!(
        "held by {} ({}, pid {}) running {}",
        holder.holder_user, holder.ctype, holder.pid, holder.command
    );
    if let Some(job_id) = holder.job_id {
        text.push_str(&format!(" [job {}]", job_id));
    }
    if let Some(since) = holder.acquired_at() {
        text.push_str(&format!(" since {}", local_time(&since)));
    }
    if gpuq_lock::holder_alive(holder) == Some(false) {
        text.push_str(" (process no longer running)");
    }
    text
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[allow(clippy::too_many_arguments)]
fn run_submit(
    config: &Config,
    program: PathBuf,
    interpreter: String,
    env: Option<String>,
    params: &[String],
    params_json: Option<String>,
    owner: Option<String>,
    notify: Option<String>,
    json: bool,
) {
    let mut parameters = match params_json {
        Some(raw) => Parameters::from_json_str(&raw).unwrap_or_else(|e| fail(e)),
        None => Parameters::new(),
    };
    for assignment in params {
        let (key, value) = Parameters::parse_assignment(assignment).unwrap_or_else(|e| fail(e));
        parameters.insert(key, value).unwrap_or_else(|e| fail(e));
    }

    let mut job = NewJob::new(absolute(&program).to_string_lossy(), interpreter)
        .with_parameters(parameters)
        .with_owner(owner.unwrap_or_else(whoami::username));
    if let Some(env) = env {
        job = job.with_environment(env);
    }
    if let Some(address) = notify {
        job = job.with_notify_address(address);
    }

    let mut store = open_store(config);
    let sink = config.build_sink();
    let queued = submit(&mut store, &job, &sink).unwrap_or_else(|e| fail(format!("Error: {}", e)));

    if json {
        print_json(&queued);
    } else {
        let pending = store.count_by_status().map(|c| c.pending).unwrap_or(0);
        println!("Queued job {} ({}); {} job(s) pending", queued.id, queued.program_name(), pending);
    }
}

fn run_list(config: &Config, status: Option<JobStatus>, days: u32, json: bool) {
    let mut filter = JobFilter::all();
    if let Some(status) = status {
        filter = filter.with_status(status);
    }
    if days > 0 {
        filter = filter.created_within(chrono::Duration::days(i64::from(days)));
    }

    let store = open_store(config);
    let jobs = store
        .list_all(&filter)
        .unwrap_or_else(|e| fail(format!("Error listing jobs: {}", e)));

    if json {
        print_json(&jobs);
        return;
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    print_job_table(&jobs);
}

fn print_job_table(jobs: &[Job]) {
    println!(
        "{:>6}  {:<9}  {:<28}  {:<10}  {:<19}  {:>9}",
        "ID", "STATUS", "PROGRAM", "OWNER", "CREATED", "DURATION"
    );
    for job in jobs {
        let duration = job
            .duration()
            .map(|d| format_duration(d.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>6}  {:<9}  {:<28}  {:<10}  {:<19}  {:>9}",
            job.id,
            job.status,
            truncate(job.program_name(), 28),
            truncate(job.owner_user.as_deref().unwrap_or("-"), 10),
            local_time(&job.created_at),
            duration
        );
        if let Some(error) = &job.error_message {
            println!("        {}", error);
        }
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let head: String = s.chars().take(width.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn run_clear(config: &Config, yes: bool) {
    let mut store = open_store(config);
    if !yes {
        let total = store.count_by_status().map(|c| c.total()).unwrap_or(0);
        eprint!("Delete all {} job(s) from {}? [y/N] ", total, config.paths.db_path().display());
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() || !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return;
        }
    }
    let removed = store.clear().unwrap_or_else(|e| fail(format!("Error clearing queue: {}", e)));
    println!("Removed {} job(s).", removed);
}

fn run_scheduler(config: &Config) {
    let runner_logs = config.paths.runner_log_dir();
    if let Err(e) = logging::init_daemon(&runner_logs) {
        eprintln!("Error opening log directory {}: {}", runner_logs.display(), e);
        process::exit(1);
    }

    let channel = config.paths.control_channel();
    match channel.take_shutdown_request() {
        Ok(true) => tracing::info!("discarded shutdown request left from a previous run"),
        Ok(false) => {}
        Err(e) => tracing::warn!(error = %e, "could not clear old shutdown request"),
    }
    let control = Arc::new(ControlState::with_channel(channel));
    if control.is_paused() {
        tracing::info!("starting paused; run `gpuq pause` to resume");
    }
    if let Err(e) = SignalHandler::new(Arc::clone(&control)).install() {
        tracing::error!(error = %e, "failed to install signal handler");
        process::exit(1);
    }

    let store = match JobStore::open(config.paths.db_path()) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open job database");
            process::exit(1);
        }
    };
    let pid_file = match PidFile::create(&config.paths.pid_path()) {
        Ok(pid) => pid,
        Err(e) => {
            tracing::error!(error = %e, "failed to write pid file");
            process::exit(1);
        }
    };

    let mut scheduler = Scheduler::new(
        store,
        ResourceLock::new(config.paths.lock_path.clone()),
        config.build_backend(),
        config.build_sink(),
        control,
    )
    .with_settings(config.scheduler_settings())
    .with_template(config.command.clone());

    let code = match scheduler.run() {
        Ok(()) => 0,
        Err(e @ SchedulerError::StorageExhausted { .. }) => {
            tracing::error!(error = %e, "scheduler stopped");
            EXIT_STORAGE_FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "scheduler failed");
            1
        }
    };
    drop(pid_file);
    if code != 0 {
        process::exit(code);
    }
}

fn run_pause(config: &Config) {
    let channel = config.paths.control_channel();
    match channel.toggle_pause() {
        Ok(true) => println!("Scheduler paused. The current job (if any) keeps running."),
        Ok(false) => println!("Scheduler resumed."),
        Err(e) => fail(format!("Error updating {}: {}", channel.dir().display(), e)),
    }
}

fn run_shutdown(config: &Config, signal: bool) {
    let channel = config.paths.control_channel();
    if let Err(e) = channel.request_shutdown() {
        fail(format!("Error writing shutdown request: {}", e));
    }
    println!("Shutdown requested; the scheduler stops after the current job.");

    if signal {
        let pid_path = config.paths.pid_path();
        match PidFile::read(&pid_path) {
            Ok(Some(pid)) => match send_terminate(pid) {
                Ok(()) => println!("Sent SIGTERM to scheduler (pid {}).", pid),
                Err(e) => fail(format!("Error signalling pid {}: {}", pid, e)),
            },
            Ok(None) => fail(format!("No scheduler pid recorded at {}", pid_path.display())),
            Err(e) => fail(format!("Error reading {}: {}", pid_path.display(), e)),
        }
    }
}

fn run_status(config: &Config, json: bool) {
    let store = open_store(config);
    let counts = store
        .count_by_status()
        .unwrap_or_else(|e| fail(format!("Error reading queue: {}", e)));
    let running = store.running().unwrap_or_default();
    let next = store.next_pending().ok().flatten();

    let channel = config.paths.control_channel();
    let pid = PidFile::read(&config.paths.pid_path()).ok().flatten();
    let lock = ResourceLock::new(config.paths.lock_path.clone());
    let holder = lock.current_holder().ok().flatten();

    if json {
        print_json(&json!({
            "counts": counts,
            "paused": channel.is_paused(),
            "shutdown_requested": channel.shutdown_requested(),
            "scheduler_pid": pid,
            "running": running,
            "next_pending": next,
            "lock": holder,
        }));
        return;
    }

    println!(
        "Queue: {} pending, {} running, {} completed, {} failed",
        counts.pending, counts.running, counts.completed, counts.failed
    );
    println!(
        "Scheduler: {}{}{}",
        pid.map(|p| format!("pid {}", p)).unwrap_or_else(|| "not running".to_string()),
        if channel.is_paused() { ", paused" } else { "" },
        if channel.shutdown_requested() { ", shutdown requested" } else { "" }
    );
    for job in &running {
        let since = job.started_at.as_ref().map(local_time).unwrap_or_default();
        println!("Running: job {} {} (since {})", job.id, job.program_name(), since);
    }
    if let Some(job) = next {
        println!("Next: job {} {}", job.id, job.program_name());
    }
    match holder {
        Some(holder) => println!("Lock: {}", describe_holder(&holder)),
        None => println!("Lock: free"),
    }
}

fn run_lock_status(config: &Config, json: bool) {
    let lock = ResourceLock::new(config.paths.lock_path.clone());
    let holder = lock
        .current_holder()
        .unwrap_or_else(|e| fail(format!("Error reading lock: {}", e)));

    if json {
        print_json(&json!({
            "path": lock.path(),
            "held": holder.is_some(),
            "holder": holder,
            "holder_alive": holder.as_ref().and_then(gpuq_lock::holder_alive),
        }));
        return;
    }
    match holder {
        Some(holder) => println!("{}", describe_holder(&holder)),
        None => println!("Resource is free ({})", lock.path().display()),
    }
}

fn run_lock_release(config: &Config, force: bool) {
    let lock = ResourceLock::new(config.paths.lock_path.clone());
    let holder = lock
        .current_holder()
        .unwrap_or_else(|e| fail(format!("Error reading lock: {}", e)));

    let Some(holder) = holder else {
        if !force {
            println!("Resource is not locked.");
            return;
        }
        // --force also removes an unreadable record.
        match lock.release() {
            Ok(true) => println!("Lock record removed."),
            Ok(false) => println!("Resource is not locked."),
            Err(e) => fail(format!("Error removing lock: {}", e)),
        }
        return;
    };

    if !force && gpuq_lock::holder_alive(&holder) != Some(false) {
        fail(format!(
            "Lock is held by a live process: {}\nUse --force to remove it anyway.",
            describe_holder(&holder)
        ));
    }
    match lock.release() {
        Ok(_) => println!("Released lock held by {}.", holder.holder_user),
        Err(e) => fail(format!("Error removing lock: {}", e)),
    }
}

fn run_lock_run(config: &Config, wait: bool, timeout: Option<u64>, cmd: &[String]) {
    // Installed before the lock is taken so a signal can never skip the release.
    let relay = ChildRelay::install().unwrap_or_else(|e| fail(format!("Error installing signal handler: {}", e)));

    let lock = ResourceLock::new(config.paths.lock_path.clone());
    let holder = HolderInfo::new(
        whoami::username(),
        cmd.join(" "),
        process::id(),
        HolderKind::Interactive,
        None,
    );

    let mut guard = lock
        .try_guard(holder.clone())
        .unwrap_or_else(|e| fail(format!("Error taking lock: {}", e)));
    if guard.is_none() && wait {
        let poll = Duration::from_secs(config.scheduler.lock_poll_seconds);
        lock.await_free(poll, timeout.map(Duration::from_secs), &|| relay.interrupted());
        if relay.interrupted() {
            fail("Interrupted while waiting for the resource");
        }
        guard = lock
            .try_guard(holder)
            .unwrap_or_else(|e| fail(format!("Error taking lock: {}", e)));
    }
    let Some(guard) = guard else {
        let who = lock
            .current_holder()
            .ok()
            .flatten()
            .map(|h| describe_holder(&h))
            .unwrap_or_else(|| "another process".to_string());
        fail(format!("Resource is busy: {}", who));
    };
    if relay.interrupted() {
        drop(guard);
        fail("Interrupted before the command started");
    }

    let status = Command::new(&cmd[0]).args(&cmd[1..]).spawn().and_then(|mut child| {
        relay.set_child(child.id());
        let status = child.wait();
        relay.clear_child();
        status
    });
    drop(guard);
    match status {
        Ok(status) => process::exit(exit_code(&status)),
        Err(e) => fail(format!("Failed to run {}: {}", cmd[0], e)),
    }
}
