/// Job executor for asynchronous continuations
///
/// Acquisition runs as a repeated tokio-cron-scheduler job. Each cycle locks
/// up to `max_jobs_per_acquisition` due jobs with an optimistic revision check
/// and executes every acquired job on its own tokio task. A failing job loses
/// one retry; at zero retries an incident is raised.

use crate::config::JobExecutorSettings;
use crate::engine::command::{Command, CommandContext, CommandExecutor};
use crate::engine::schema::Tables;
use crate::error::{PlatformError, Result};
use crate::runtime::clock::{from_millis, to_millis};
use crate::runtime::entity::{IncidentEntity, JobEntity};
use crate::runtime::service::RuntimeService;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

fn job_from_row(row: &SqliteRow) -> JobEntity {
    let due_date: Option<i64> = row.get("due_date");
    let lock_expiration_time: Option<i64> = row.get("lock_expiration_time");
    JobEntity {
        id: row.get("id"),
        revision: row.get("revision"),
        job_type: row.get("job_type"),
        handler_configuration: row.get("handler_configuration"),
        due_date: due_date.and_then(from_millis),
        retries: row.get("retries"),
        priority: row.get("priority"),
        lock_owner: row.get("lock_owner"),
        lock_expiration_time: lock_expiration_time.and_then(from_millis),
        exception_message: row.get("exception_message"),
        activity_id: row.get("activity_id"),
        execution_id: row.get("execution_id"),
        process_instance_id: row.get("process_instance_id"),
        process_definition_id: row.get("process_definition_id"),
        process_definition_key: row.get("process_definition_key"),
        deployment_id: row.get("deployment_id"),
        sequence_counter: row.get("sequence_counter"),
    }
}

pub(crate) async fn insert_job(conn: &mut SqliteConnection, tables: &Tables, job: &JobEntity) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {} (id, revision, job_type, handler_configuration, due_date, retries, priority,
            lock_owner, lock_expiration_time, exception_message, activity_id, execution_id,
            process_instance_id, process_definition_id, process_definition_key, deployment_id, sequence_counter)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        tables.job()
    ))
    .bind(&job.id)
    .bind(job.revision)
    .bind(&job.job_type)
    .bind(&job.handler_configuration)
    .bind(job.due_date.map(to_millis))
    .bind(job.retries)
    .bind(job.priority)
    .bind(&job.lock_owner)
    .bind(job.lock_expiration_time.map(to_millis))
    .bind(&job.exception_message)
    .bind(&job.activity_id)
    .bind(&job.execution_id)
    .bind(&job.process_instance_id)
    .bind(&job.process_definition_id)
    .bind(&job.process_definition_key)
    .bind(&job.deployment_id)
    .bind(job.sequence_counter)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

struct AcquireJobs {
    lock_owner: String,
    settings: JobExecutorSettings,
}

#[async_trait]
impl Command for AcquireJobs {
    type Output = Vec<JobEntity>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<JobEntity>> {
        let table = ctx.tables().job();
        let now = ctx.clock().now();
        let lock_expiration = i64::try_from(self.settings.lock_time_ms)
            .ok()
            .and_then(ChronoDuration::try_milliseconds)
            .and_then(|lock_time| now.checked_add_signed(lock_time))
            .ok_or_else(|| {
                PlatformError::Validation(format!(
                    "Job lock time of {}ms overflows the lock expiration",
                    self.settings.lock_time_ms
                ))
            })?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE retries > 0
               AND (due_date IS NULL OR due_date <= ?)
               AND (lock_owner IS NULL OR lock_expiration_time < ?)
             ORDER BY priority DESC, due_date ASC
             LIMIT ?",
            table
        ))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(self.settings.max_jobs_per_acquisition as i64)
        .fetch_all(ctx.connection())
        .await?;
        let candidates: Vec<JobEntity> = rows.iter().map(job_from_row).collect();

        let mut acquired = Vec::new();
        for mut job in candidates {
            let result = sqlx::query(&format!(
                "UPDATE {} SET lock_owner = ?, lock_expiration_time = ?, revision = revision + 1
                 WHERE id = ? AND revision = ?",
                table
            ))
            .bind(&self.lock_owner)
            .bind(to_millis(lock_expiration))
            .bind(&job.id)
            .bind(job.revision)
            .execute(ctx.connection())
            .await?;

            if result.rows_affected() == 1 {
                job.revision += 1;
                job.lock_owner = Some(self.lock_owner.clone());
                job.lock_expiration_time = Some(lock_expiration);
                acquired.push(job);
            } else {
                tracing::debug!("🔒 Job {} was acquired by another executor", job.id);
            }
        }
        Ok(acquired)
    }
}

struct ExecuteJob<'a> {
    runtime: &'a RuntimeService,
    job: &'a JobEntity,
}

#[async_trait]
impl<'a> Command for ExecuteJob<'a> {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        self.runtime.execute_job(ctx, self.job).await?;

        let statement = format!("DELETE FROM {} WHERE id = ? AND revision = ?", ctx.tables().job());
        let result = sqlx::query(&statement)
            .bind(&self.job.id)
            .bind(self.job.revision)
            .execute(ctx.connection())
            .await?;
        if result.rows_affected() != 1 {
            return Err(PlatformError::Conflict(format!(
                "Job {} was updated by another transaction",
                self.job.id
            )));
        }

        let job = self.job.clone();
        ctx.produce(|producer, _| producer.job_log_successful(&job));
        Ok(())
    }
}

struct FailJob<'a> {
    job: &'a JobEntity,
    message: String,
}

#[async_trait]
impl<'a> Command for FailJob<'a> {
    type Output = i32;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let mut job = self.job.clone();
        job.retries = (job.retries - 1).max(0);
        job.exception_message = Some(self.message.clone());
        job.lock_owner = None;
        job.lock_expiration_time = None;

        let statement = format!(
            "UPDATE {} SET retries = ?, exception_message = ?, lock_owner = NULL,
                lock_expiration_time = NULL, revision = revision + 1
             WHERE id = ?",
            ctx.tables().job()
        );
        sqlx::query(&statement)
            .bind(job.retries)
            .bind(&job.exception_message)
            .bind(&job.id)
            .execute(ctx.connection())
            .await?;

        let message = self.message.clone();
        ctx.produce(|producer, _| producer.job_log_failed(&job, &message));

        if job.retries == 0 {
            let incident_id = Uuid::new_v4().to_string();
            let incident = IncidentEntity {
                id: incident_id.clone(),
                incident_type: IncidentEntity::FAILED_JOB.to_string(),
                incident_message: Some(self.message.clone()),
                incident_timestamp: ctx.clock().now(),
                activity_id: job.activity_id.clone(),
                failed_activity_id: job.activity_id.clone(),
                execution_id: job.execution_id.clone(),
                process_instance_id: job.process_instance_id.clone(),
                process_definition_id: job.process_definition_id.clone(),
                process_definition_key: job.process_definition_key.clone(),
                cause_incident_id: Some(incident_id.clone()),
                root_cause_incident_id: Some(incident_id),
                configuration: Some(job.id.clone()),
            };
            ctx.produce(|producer, _| producer.incident_create(&incident));
            tracing::warn!("🚨 Job {} has no retries left, incident {} created", job.id, incident.id);
        }
        Ok(job.retries)
    }
}

struct ListJobs;

#[async_trait]
impl Command for ListJobs {
    type Output = Vec<JobEntity>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<JobEntity>> {
        let statement = format!("SELECT * FROM {} ORDER BY rowid", ctx.tables().job());
        let rows = sqlx::query(&statement).fetch_all(ctx.connection()).await?;
        Ok(rows.iter().map(job_from_row).collect())
    }
}

struct SetJobRetries<'a> {
    job_id: &'a str,
    retries: i32,
}

#[async_trait]
impl<'a> Command for SetJobRetries<'a> {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let statement = format!(
            "UPDATE {} SET retries = ?, revision = revision + 1 WHERE id = ?",
            ctx.tables().job()
        );
        let result = sqlx::query(&statement)
            .bind(self.retries)
            .bind(self.job_id)
            .execute(ctx.connection())
            .await?;
        if result.rows_affected() == 0 {
            return Err(PlatformError::NotFound(format!("No job with id '{}'", self.job_id)));
        }
        Ok(())
    }
}

/// State shared between the executor handle and the scheduled acquisition job
#[derive(Debug)]
struct JobRunner {
    executor: Arc<CommandExecutor>,
    runtime: RuntimeService,
    lock_owner: String,
    settings: RwLock<JobExecutorSettings>,
}

impl JobRunner {
    async fn acquire(&self) -> Result<Vec<JobEntity>> {
        let settings = *self.settings.read();
        self.executor
            .execute(&AcquireJobs {
                lock_owner: self.lock_owner.clone(),
                settings,
            })
            .await
    }

    async fn execute(&self, job: JobEntity) {
        tracing::debug!("⚙️ Executing job {} ({})", job.id, job.job_type);
        let outcome = self
            .executor
            .execute(&ExecuteJob {
                runtime: &self.runtime,
                job: &job,
            })
            .await;

        match outcome {
            Ok(()) => tracing::debug!("✅ Job {} completed", job.id),
            Err(e) => {
                let message = e.message_chain();
                tracing::warn!("⚠️ Job {} failed: {}", job.id, message);
                match self.executor.execute(&FailJob { job: &job, message }).await {
                    Ok(retries) => tracing::debug!("🔁 Job {} has {} retries left", job.id, retries),
                    Err(e) => tracing::error!("❌ Could not record failure of job {}: {}", job.id, e),
                }
            }
        }
    }
}

/// Handle to the engine's job executor
pub struct JobExecutor {
    runner: Arc<JobRunner>,
    scheduler: Mutex<Option<(JobScheduler, Uuid)>>,
    active: AtomicBool,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("lock_owner", &self.runner.lock_owner)
            .field("settings", &self.settings())
            .field("active", &self.is_active())
            .finish()
    }
}

impl JobExecutor {
    /// Executor acquiring jobs for `runtime`
    pub fn new(executor: Arc<CommandExecutor>, runtime: RuntimeService, settings: JobExecutorSettings) -> Self {
        Self {
            runner: Arc::new(JobRunner {
                executor,
                runtime,
                lock_owner: Uuid::new_v4().to_string(),
                settings: RwLock::new(settings),
            }),
            scheduler: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Owner id written into acquired job locks
    pub fn lock_owner(&self) -> &str {
        &self.runner.lock_owner
    }

    /// Current acquisition settings
    pub fn settings(&self) -> JobExecutorSettings {
        *self.runner.settings.read()
    }

    /// Whether the acquisition schedule is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Cap jobs locked per cycle, at least one
    pub fn set_max_jobs_per_acquisition(&self, max_jobs: u32) {
        self.runner.settings.write().max_jobs_per_acquisition = max_jobs.max(1);
    }

    /// New lock time, rejected above `MAX_LOCK_TIME_MS`
    pub fn set_lock_time(&self, lock_time_ms: u64) -> Result<()> {
        JobExecutorSettings::check_lock_time(lock_time_ms)?;
        self.runner.settings.write().lock_time_ms = lock_time_ms;
        Ok(())
    }

    /// New poll interval; a running acquisition job is rescheduled
    pub async fn set_wait_time(&self, wait_time_ms: u64) -> Result<()> {
        self.runner.settings.write().wait_time_ms = wait_time_ms;

        let mut guard = self.scheduler.lock().await;
        if let Some((scheduler, job_id)) = guard.as_mut() {
            scheduler
                .remove(job_id)
                .await
                .map_err(|e| PlatformError::lifecycle(format!("Could not reschedule job acquisition: {}", e)))?;
            *job_id = Self::schedule_acquisition(scheduler, &self.runner).await?;
        }
        Ok(())
    }

    async fn schedule_acquisition(scheduler: &JobScheduler, runner: &Arc<JobRunner>) -> Result<Uuid> {
        let interval = Duration::from_millis(runner.settings.read().wait_time_ms.max(1));
        let runner = Arc::clone(runner);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                if let Err(e) = Self::cycle(&runner, true).await {
                    tracing::error!("❌ Job acquisition failed: {}", e);
                }
            })
        })
        .map_err(|e| PlatformError::lifecycle(format!("Could not create acquisition job: {}", e)))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| PlatformError::lifecycle(format!("Could not schedule acquisition job: {}", e)))
    }

    async fn cycle(runner: &Arc<JobRunner>, spawn: bool) -> Result<usize> {
        let jobs = runner.acquire().await?;
        let count = jobs.len();
        if count > 0 {
            tracing::debug!("📥 Acquired {} jobs", count);
        }
        for job in jobs {
            if spawn {
                let runner = Arc::clone(runner);
                tokio::spawn(async move { runner.execute(job).await });
            } else {
                runner.execute(job).await;
            }
        }
        Ok(count)
    }

    /// Run one acquisition cycle inline and wait for every acquired job
    pub async fn execute_due_jobs(&self) -> Result<usize> {
        Self::cycle(&self.runner, false).await
    }

    /// Start the scheduled acquisition loop
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.scheduler.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| PlatformError::lifecycle(format!("Could not create job scheduler: {}", e)))?;
        let job_id = Self::schedule_acquisition(&scheduler, &self.runner).await?;
        scheduler
            .start()
            .await
            .map_err(|e| PlatformError::lifecycle(format!("Could not start job scheduler: {}", e)))?;

        *guard = Some((scheduler, job_id));
        self.active.store(true, Ordering::SeqCst);
        tracing::info!("⏰ Job executor started (lock owner {})", self.runner.lock_owner);
        Ok(())
    }

    /// Stop the acquisition loop
    pub async fn shutdown(&self) -> Result<()> {
        let mut guard = self.scheduler.lock().await;
        if let Some((mut scheduler, _)) = guard.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| PlatformError::lifecycle(format!("Could not stop job scheduler: {}", e)))?;
            tracing::info!("⏹️ Job executor stopped");
        }
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// All stored jobs
    pub async fn jobs(&self) -> Result<Vec<JobEntity>> {
        self.runner.executor.execute(&ListJobs).await
    }

    /// Reset retries of a job and resolve its failed-job incident
    pub async fn set_job_retries(&self, job_id: &str, retries: i32) -> Result<()> {
        self.runner.executor.execute(&SetJobRetries { job_id, retries }).await
    }
}
