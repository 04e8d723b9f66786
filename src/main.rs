use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use saga_lite::config::{SagaConfig, SagaLogConfig};
use saga_lite::error::{fatal_err, SagaError};
use saga_lite::log::{FileSagaLog, SagaLog};
use saga_lite::saga::{recover_state, RecoveryType, Saga, SagaCoordinator, SagaState};

#[derive(Parser, Debug)]
#[command(name = "saga-lite")]
#[command(version)]
#[command(about = "Durable saga log and transaction engine for job execution")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List sagas that have not recorded EndSaga
    Active {
        #[command(flatten)]
        log: LogArgs,
    },

    /// Show the recovered state and logged history of one saga
    Show {
        /// The saga ID
        saga_id: String,

        #[command(flatten)]
        log: LogArgs,
    },

    /// Run a batch of demo jobs against a file log, then recover them
    Demo(DemoArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct LogArgs {
    /// Directory holding the saga log files
    #[arg(long, short = 'd', default_value = "./saga-log")]
    dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Demo Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DemoArgs {
    #[command(flatten)]
    log: LogArgs,

    /// Number of jobs (one saga each)
    #[arg(long, default_value = "4")]
    jobs: usize,

    /// Number of tasks per job
    #[arg(long, default_value = "3")]
    tasks: usize,

    /// Abort and compensate every Nth job (0 disables)
    #[arg(long, default_value = "3")]
    abort_every: usize,

    /// Stop every Nth job before it ends, leaving it for the recovery sweep (0 disables)
    #[arg(long, default_value = "2")]
    interrupt_every: usize,

    /// Pending updates each saga accepts before callers wait
    #[arg(long, default_value = "100")]
    queue_depth: usize,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ActiveSagaOutput {
    saga_id: String,
    messages: usize,
    phase: String,
}

#[derive(Serialize)]
struct SagaShowOutput {
    saga_id: String,
    phase: String,
    job: Option<String>,
    tasks: Vec<TaskOutput>,
    records: Vec<RecordOutput>,
}

#[derive(Serialize)]
struct TaskOutput {
    task_id: String,
    status: String,
    data: Option<String>,
}

#[derive(Serialize)]
struct RecordOutput {
    seq: u64,
    logged_at: String,
    msg_type: String,
    task_id: Option<String>,
    data: Option<String>,
}

#[derive(Serialize, Default)]
struct DemoOutput {
    jobs: usize,
    completed: usize,
    rolled_back: usize,
    interrupted: usize,
    recovered_forward: usize,
    recovered_rollback: usize,
    corrupted: usize,
    still_active: usize,
}

fn phase_of(state: &SagaState) -> &'static str {
    match (state.is_saga_completed(), state.is_saga_aborted()) {
        (true, true) => "rolled back",
        (true, false) => "completed",
        (false, true) => "aborted",
        (false, false) => "running",
    }
}

fn lossy(data: Option<&[u8]>) -> Option<String> {
    data.map(|d| String::from_utf8_lossy(d).into_owned())
}

// =============================================================================
// Inspection Commands
// =============================================================================

async fn handle_active(args: LogArgs) -> Result<(), Box<dyn std::error::Error>> {
    let log = FileSagaLog::open(&args.dir).await?;
    let mut sagas = Vec::new();

    for saga_id in log.get_active_sagas().await? {
        let replayed = match log.get_messages(&saga_id).await {
            Ok(messages) => recover_state(&saga_id, &messages).map(|s| (s, messages.len())),
            Err(e @ SagaError::CorruptedSagaLog(_)) => Err(e),
            Err(e) => return Err(e.into()),
        };
        let (phase, messages) = match replayed {
            Ok((state, len)) => (phase_of(&state).to_string(), len),
            Err(e) => {
                tracing::warn!(saga_id = %saga_id, error = %e, "Saga history does not replay");
                ("corrupted".to_string(), 0)
            }
        };
        sagas.push(ActiveSagaOutput {
            saga_id,
            messages,
            phase,
        });
    }

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&sagas)?);
        }
        OutputFormat::Table => {
            if sagas.is_empty() {
                println!("No active sagas.");
            } else {
                println!("{:<44} {:<10} PHASE", "SAGA ID", "MESSAGES");
                println!("{}", "-".repeat(66));
                for saga in &sagas {
                    println!("{:<44} {:<10} {}", saga.saga_id, saga.messages, saga.phase);
                }
            }
        }
    }
    Ok(())
}

async fn handle_show(saga_id: String, args: LogArgs) -> Result<(), Box<dyn std::error::Error>> {
    let log = FileSagaLog::open(&args.dir).await?;
    let records = log.records(&saga_id).await?;
    let messages: Vec<_> = records.iter().map(|r| r.message.clone()).collect();
    let state = recover_state(&saga_id, &messages)?;

    let output = SagaShowOutput {
        saga_id: saga_id.clone(),
        phase: phase_of(&state).to_string(),
        job: lossy(state.job()),
        tasks: state
            .task_ids()
            .into_iter()
            .map(|task_id| TaskOutput {
                task_id: task_id.to_string(),
                status: state.task_status(task_id).to_string(),
                data: lossy(state.task_data(task_id)),
            })
            .collect(),
        records: records
            .iter()
            .map(|r| RecordOutput {
                seq: r.seq,
                logged_at: r.logged_at.to_rfc3339(),
                msg_type: r.message.msg_type.to_string(),
                task_id: r.message.task_id.clone(),
                data: lossy(r.message.data.as_deref()),
            })
            .collect(),
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Saga ID: {}", output.saga_id);
            println!("Phase:   {}", output.phase);
            if let Some(job) = &output.job {
                println!("Job:     {}", job);
            }
            println!();
            println!("{:<20} {:<14} DATA", "TASK", "STATUS");
            println!("{}", "-".repeat(50));
            for task in &output.tasks {
                println!(
                    "{:<20} {:<14} {}",
                    task.task_id,
                    task.status,
                    task.data.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("{:<6} {:<34} {:<14} TASK", "SEQ", "LOGGED AT", "TYPE");
            println!("{}", "-".repeat(70));
            for record in &output.records {
                println!(
                    "{:<6} {:<34} {:<14} {}",
                    record.seq,
                    record.logged_at,
                    record.msg_type,
                    record.task_id.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Demo
// =============================================================================

const MAX_RETRIES: u32 = 3;

/// Retries an update while the log reports a transient failure.
async fn with_retry<F, Fut>(mut op: F) -> Result<(), SagaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), SagaError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if !fatal_err(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "Transient saga log failure, retrying");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
            result => return result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    RolledBack,
    Interrupted,
}

async fn run_job(
    coordinator: SagaCoordinator,
    index: usize,
    tasks: usize,
    abort: bool,
    interrupt: bool,
) -> Result<JobOutcome, SagaError> {
    let saga_id = format!("job-{}", Uuid::new_v4());
    let job = format!("demo job {}", index).into_bytes();
    let saga = coordinator.make_saga(&saga_id, Some(job)).await?;

    // one caller per task, all feeding the same saga
    let mut handles = Vec::with_capacity(tasks);
    for t in 0..tasks {
        let saga = saga.clone();
        handles.push(tokio::spawn(async move {
            let task_id = format!("task-{}", t);
            let argv = format!("echo {}", t).into_bytes();
            with_retry(|| saga.start_task(&task_id, Some(argv.clone()))).await?;
            if !abort && !interrupt {
                let output = format!("{}\n", t).into_bytes();
                with_retry(|| saga.end_task(&task_id, Some(output.clone()))).await?;
            }
            Ok::<_, SagaError>(())
        }));
    }
    join_all(handles).await?;

    if abort {
        with_retry(|| saga.abort_saga()).await?;
        if interrupt {
            tracing::info!(saga_id = %saga_id, "Leaving aborted saga uncompensated");
            return Ok(JobOutcome::Interrupted);
        }
        compensate(&saga).await?;
        with_retry(|| saga.end_saga()).await?;
        return Ok(JobOutcome::RolledBack);
    }

    if interrupt {
        tracing::info!(saga_id = %saga_id, "Leaving saga unfinished");
        return Ok(JobOutcome::Interrupted);
    }

    with_retry(|| saga.end_saga()).await?;
    Ok(JobOutcome::Completed)
}

async fn join_all(
    handles: Vec<tokio::task::JoinHandle<Result<(), SagaError>>>,
) -> Result<(), SagaError> {
    for handle in handles {
        handle
            .await
            .map_err(|e| SagaError::InternalLog(format!("task caller panicked: {}", e)))??;
    }
    Ok(())
}

/// Runs compensation for every started task that is not compensated yet.
async fn compensate(saga: &Saga) -> Result<(), SagaError> {
    let state = saga.state().await;
    let mut handles = Vec::new();
    for task_id in state.uncompensated_tasks() {
        let saga = saga.clone();
        let task_id = task_id.to_string();
        handles.push(tokio::spawn(async move {
            with_retry(|| saga.start_compensating_task(&task_id, None)).await?;
            with_retry(|| saga.end_compensating_task(&task_id, Some(b"undone".to_vec()))).await
        }));
    }
    join_all(handles).await
}

/// Finishes every saga a previous run left behind.
async fn recovery_sweep(
    coordinator: &SagaCoordinator,
    summary: &mut DemoOutput,
) -> Result<(), SagaError> {
    for saga_id in coordinator.startup().await? {
        let replayed = coordinator
            .log()
            .get_messages(&saga_id)
            .await
            .and_then(|messages| recover_state(&saga_id, &messages));
        let aborted = match replayed {
            Ok(state) => state.is_saga_aborted(),
            Err(e @ SagaError::CorruptedSagaLog(_)) => {
                tracing::warn!(saga_id = %saga_id, error = %e, "Skipping corrupted saga");
                summary.corrupted += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        if aborted {
            let saga = coordinator
                .recover_saga_state(&saga_id, RecoveryType::RollbackRecovery)
                .await?;
            compensate(&saga).await?;
            with_retry(|| saga.end_saga()).await?;
            summary.recovered_rollback += 1;
        } else {
            let saga = coordinator
                .recover_saga_state(&saga_id, RecoveryType::ForwardRecovery)
                .await?;
            let state = saga.state().await;
            for task_id in state.incomplete_tasks() {
                with_retry(|| saga.end_task(task_id, Some(b"recovered".to_vec()))).await?;
            }
            with_retry(|| saga.end_saga()).await?;
            summary.recovered_forward += 1;
        }
    }
    Ok(())
}

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let log: Arc<dyn SagaLog> = SagaLogConfig::file(&args.log.dir).create().await?;
    let config = SagaConfig::default().with_update_queue_capacity(args.queue_depth);
    let coordinator = SagaCoordinator::with_config(log, config);

    tracing::info!(
        dir = %args.log.dir.display(),
        jobs = args.jobs,
        tasks = args.tasks,
        "Starting saga demo"
    );

    let every = |n: usize, i: usize| n != 0 && (i + 1) % n == 0;
    let mut handles = Vec::with_capacity(args.jobs);
    for i in 0..args.jobs {
        handles.push(tokio::spawn(run_job(
            coordinator.clone(),
            i,
            args.tasks,
            every(args.abort_every, i),
            every(args.interrupt_every, i),
        )));
    }

    let mut summary = DemoOutput {
        jobs: args.jobs,
        ..DemoOutput::default()
    };
    for handle in handles {
        match handle.await?? {
            JobOutcome::Completed => summary.completed += 1,
            JobOutcome::RolledBack => summary.rolled_back += 1,
            JobOutcome::Interrupted => summary.interrupted += 1,
        }
    }

    // a fresh coordinator over the same directory, as after a restart
    let log: Arc<dyn SagaLog> = SagaLogConfig::file(&args.log.dir).create().await?;
    let coordinator = SagaCoordinator::with_config(log, coordinator.config().clone());
    recovery_sweep(&coordinator, &mut summary).await?;
    summary.still_active = coordinator.startup().await?.len();

    match args.log.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Table => {
            println!("Saga Demo");
            println!("{}", "=".repeat(40));
            println!("Jobs:               {}", summary.jobs);
            println!("Completed:          {}", summary.completed);
            println!("Rolled back:        {}", summary.rolled_back);
            println!("Interrupted:        {}", summary.interrupted);
            println!("Recovered forward:  {}", summary.recovered_forward);
            println!("Recovered rollback: {}", summary.recovered_rollback);
            println!("Corrupted:          {}", summary.corrupted);
            println!("Still active:       {}", summary.still_active);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Active { log } => handle_active(log).await?,
        Commands::Show { saga_id, log } => handle_show(saga_id, log).await?,
        Commands::Demo(demo_args) => run_demo(demo_args).await?,
    }

    Ok(())
}
