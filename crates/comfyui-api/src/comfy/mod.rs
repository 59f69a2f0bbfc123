use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use futures_util::{stream, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{api::*, models::*};

pub mod patch;
pub mod visitor;
pub use patch::*;
pub use visitor::Visitor;

/// Errors returned by the job orchestration layer.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ComfyError {
    /// The server could not be reached on any submission attempt.
    #[error("Failed to submit prompt after {attempts} attempts")]
    SubmitFailed {
        attempts: u32,
        #[source]
        source: ApiError,
    },
    /// The server rejected the graph; the job was never queued.
    #[error("Prompt failed validation: {}", .0.message())]
    ValidationFailed(ValidationFailure),
    /// The prompt id is unknown to the server.
    #[error("Prompt {0} not found in history")]
    NotFound(Uuid),
    /// A request to the server failed.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// Writing a downloaded file failed.
    #[error("Failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ComfyError>;

/// Timing and retry policy for submitting and polling jobs.
#[derive(Clone, Debug, PartialEq)]
pub struct PollSettings {
    /// Sleep between two history polls.
    pub interval: Duration,
    /// Wall-clock deadline for a job, measured from the first poll.
    pub timeout: Duration,
    /// Total submission attempts when the server is unreachable.
    pub submit_attempts: u32,
    /// Sleep between two submission attempts.
    pub retry_delay: Duration,
    /// Maximum number of jobs polled at the same time.
    pub concurrency: usize,
}

impl PollSettings {
    /// Upper bound on concurrently polled jobs.
    pub const MAX_CONCURRENCY: usize = 3;

    /// The configured concurrency clamped to `1..=MAX_CONCURRENCY`.
    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(1, Self::MAX_CONCURRENCY)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
            submit_attempts: 3,
            retry_delay: Duration::from_secs(2),
            concurrency: 3,
        }
    }
}

/// The end state of a polled job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The job finished, possibly entirely from cache.
    Completed { task: Task, elapsed: Duration },
    /// The server reported an execution error or interruption.
    Failed { task: Task, elapsed: Duration },
    /// The deadline passed before the job finished. The job may still be
    /// running on the server.
    TimedOut { elapsed: Duration },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            JobOutcome::Completed { elapsed, .. }
            | JobOutcome::Failed { elapsed, .. }
            | JobOutcome::TimedOut { elapsed } => *elapsed,
        }
    }

    /// The finished task, unless the job timed out.
    pub fn task(&self) -> Option<&Task> {
        match self {
            JobOutcome::Completed { task, .. } | JobOutcome::Failed { task, .. } => Some(task),
            JobOutcome::TimedOut { .. } => None,
        }
    }

    /// Short status word for reports.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed { .. } => "completed",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::TimedOut { .. } => "timed out",
        }
    }

    /// Description of the execution error of a failed job.
    pub fn error_message(&self) -> Option<String> {
        match self {
            JobOutcome::Failed { task, .. } => Some(
                task.status
                    .as_ref()
                    .and_then(TaskStatus::error_message)
                    .unwrap_or_else(|| "execution failed".to_string()),
            ),
            _ => None,
        }
    }
}

/// Result of a submit and wait pipeline.
#[derive(Debug)]
pub struct JobReport {
    /// The id assigned by the server, if submission succeeded.
    pub prompt_id: Option<Uuid>,
    /// The poll outcome, or the reason the job never got queued.
    pub result: Result<JobOutcome>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.result.as_ref().is_ok_and(JobOutcome::is_success)
    }
}

/// Files written by a download pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DownloadSummary {
    /// Newly written files.
    pub downloaded: Vec<PathBuf>,
    /// Targets that already existed and were left alone.
    pub skipped: Vec<PathBuf>,
    /// Number of images that could not be fetched or written.
    pub failed: usize,
}

impl DownloadSummary {
    fn merge(&mut self, other: DownloadSummary) {
        self.downloaded.extend(other.downloaded);
        self.skipped.extend(other.skipped);
        self.failed += other.failed;
    }
}

/// Higher-level API for interacting with the ComfyUI API.
#[derive(Clone, Debug)]
pub struct Comfy {
    prompt: PromptApi,
    view: ViewApi,
    history: HistoryApi,
    system_stats: SystemStatsApi,
    settings: PollSettings,
}

impl Comfy {
    fn from_api(api: Api) -> Result<Self> {
        Ok(Self {
            prompt: api.prompt()?,
            view: api.view()?,
            history: api.history()?,
            system_stats: api.system_stats()?,
            settings: PollSettings::default(),
        })
    }

    /// Returns a new `Comfy` instance with default settings.
    pub fn new() -> Result<Self> {
        Self::from_api(Api::default())
    }

    /// Returns a new `Comfy` instance with the given URL as a string value.
    ///
    /// # Arguments
    ///
    /// * `url` - A string that specifies the ComfyUI API URL endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn new_with_url<S>(url: S) -> Result<Self>
    where
        S: AsRef<str>,
    {
        Self::from_api(Api::new_with_url(url.as_ref())?)
    }

    /// Returns a new `Comfy` instance with the given `reqwest::Client` and URL as a string value.
    ///
    /// # Arguments
    ///
    /// * `client` - An instance of `reqwest::Client`.
    /// * `url` - A string that specifies the ComfyUI API URL endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn new_with_client_and_url<S>(client: reqwest::Client, url: S) -> Result<Self>
    where
        S: AsRef<str>,
    {
        Self::from_api(Api::new_with_client_and_url(client, url.as_ref())?)
    }

    /// Replaces the polling and retry policy.
    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Fetches the server's system information.
    pub async fn system_stats(&self) -> Result<SystemStats> {
        Ok(self.system_stats.get().await?)
    }

    /// Whether the server answers on its `system_stats` endpoint.
    pub async fn is_alive(&self) -> bool {
        match self.system_stats.get().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "liveness probe failed");
                false
            }
        }
    }

    /// Submits a prompt, retrying while the server is unreachable.
    ///
    /// # Arguments
    ///
    /// * `prompt` - A `Prompt` to send to the ComfyUI API.
    ///
    /// # Returns
    ///
    /// The prompt id assigned by the server.
    ///
    /// # Errors
    ///
    /// * `ComfyError::ValidationFailed` immediately if the server rejects the graph.
    /// * `ComfyError::SubmitFailed` once every attempt failed to connect.
    pub async fn submit(&self, prompt: &Prompt) -> Result<Uuid> {
        let attempts = self.settings.submit_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.prompt.send(prompt).await {
                Ok(response) => {
                    info!(prompt_id = %response.prompt_id, number = response.number, "prompt queued");
                    return Ok(response.prompt_id);
                }
                Err(ApiError::ValidationFailed(failure)) => {
                    error!(error = %failure.message(), "prompt failed validation");
                    return Err(ComfyError::ValidationFailed(failure));
                }
                Err(e) if e.is_connect() && attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "failed to reach server, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_connect() => {
                    return Err(ComfyError::SubmitFailed {
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Polls the history of a prompt until it finishes or the deadline passes.
    ///
    /// Failed poll requests are logged and polling continues. Giving up does
    /// not cancel the job on the server.
    pub async fn wait(&self, prompt_id: &Uuid) -> JobOutcome {
        let start = Instant::now();
        loop {
            match self.history.get_prompt(prompt_id).await {
                Ok(Some(task)) => match task.state() {
                    ExecutionState::Succeeded => {
                        let elapsed = start.elapsed();
                        info!(%prompt_id, ?elapsed, "prompt completed");
                        return JobOutcome::Completed { task, elapsed };
                    }
                    ExecutionState::Failed => {
                        let elapsed = start.elapsed();
                        error!(%prompt_id, ?elapsed, "prompt failed");
                        return JobOutcome::Failed { task, elapsed };
                    }
                    ExecutionState::Running => debug!(%prompt_id, "prompt running"),
                },
                Ok(None) => debug!(%prompt_id, "prompt not in history yet"),
                Err(e) => warn!(%prompt_id, error = %e, "failed to poll history"),
            }
            let elapsed = start.elapsed();
            if elapsed >= self.settings.timeout {
                warn!(%prompt_id, ?elapsed, "gave up waiting for prompt");
                return JobOutcome::TimedOut { elapsed };
            }
            tokio::time::sleep(self.settings.interval.min(self.settings.timeout - elapsed)).await;
        }
    }

    /// Submits a prompt and waits for it to finish.
    pub async fn execute(&self, prompt: &Prompt) -> JobReport {
        match self.submit(prompt).await {
            Ok(prompt_id) => JobReport {
                prompt_id: Some(prompt_id),
                result: Ok(self.wait(&prompt_id).await),
            },
            Err(e) => JobReport {
                prompt_id: None,
                result: Err(e),
            },
        }
    }

    /// Runs independent submit and wait pipelines with at most
    /// `PollSettings::concurrency()` in flight.
    ///
    /// # Returns
    ///
    /// One report per prompt, in input order.
    pub async fn execute_all<I>(&self, prompts: I) -> Vec<JobReport>
    where
        I: IntoIterator<Item = Prompt>,
    {
        let mut reports: Vec<(usize, JobReport)> = stream::iter(prompts.into_iter().enumerate())
            .map(|(index, prompt)| async move { (index, self.execute(&prompt).await) })
            .buffer_unordered(self.settings.concurrency())
            .collect()
            .await;
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Downloads every image of a finished task into `dir`.
    ///
    /// Existing files are never overwritten. A failed image is logged and
    /// counted and the remaining images are still fetched.
    ///
    /// # Errors
    ///
    /// Fails only if `dir` cannot be created.
    pub async fn download_task<P: AsRef<Path>>(&self, task: &Task, dir: P) -> Result<DownloadSummary> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ComfyError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        let mut summary = DownloadSummary::default();
        for (node, image) in task.images() {
            let Some(filename) = Path::new(&image.filename).file_name() else {
                warn!(node, filename = %image.filename, "skipping image with invalid filename");
                summary.failed += 1;
                continue;
            };
            let target = dir.join(filename);
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                info!(path = %target.display(), "already downloaded, skipping");
                summary.skipped.push(target);
                continue;
            }
            let bytes = match self.view.get(image).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(node, filename = %image.filename, error = %e, "failed to download image");
                    summary.failed += 1;
                    continue;
                }
            };
            match write_file(&target, &bytes).await {
                Ok(()) => {
                    info!(path = %target.display(), bytes = bytes.len(), "downloaded image");
                    summary.downloaded.push(target);
                }
                Err(e) => {
                    error!(path = %target.display(), error = %e, "failed to write image");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Downloads the outputs of a finished prompt into `dir`.
    ///
    /// # Errors
    ///
    /// * `ComfyError::NotFound` if the prompt is not in the server's history.
    /// * Any error reaching the server or creating `dir`.
    pub async fn download_outputs<P: AsRef<Path>>(
        &self,
        prompt_id: &Uuid,
        dir: P,
    ) -> Result<DownloadSummary> {
        let task = self
            .history
            .get_prompt(prompt_id)
            .await?
            .ok_or(ComfyError::NotFound(*prompt_id))?;
        self.download_task(&task, dir).await
    }

    /// Downloads the outputs of several prompts into `dir`, continuing past
    /// prompts that are missing from history.
    pub async fn download_all<'a, I, P>(&self, prompt_ids: I, dir: P) -> Result<DownloadSummary>
    where
        I: IntoIterator<Item = &'a Uuid>,
        P: AsRef<Path>,
    {
        let mut summary = DownloadSummary::default();
        for prompt_id in prompt_ids {
            match self.download_outputs(prompt_id, dir.as_ref()).await {
                Ok(s) => summary.merge(s),
                Err(ComfyError::NotFound(id)) => {
                    warn!(prompt_id = %id, "prompt not found in history");
                    summary.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }
}

/// Writes `bytes` to `<path>.part`, then renames it to `path`.
async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    let result = match tokio::fs::write(&part, bytes).await {
        Ok(()) => tokio::fs::rename(&part, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Err(remove) = tokio::fs::remove_file(&part).await {
            debug!(path = %part.display(), error = %remove, "failed to remove partial image");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT_ID: &str = "ce911389-74e0-4b08-bb3d-2e73e875af1c";

    fn fast_settings() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
            submit_attempts: 3,
            retry_delay: Duration::from_millis(10),
            concurrency: 3,
        }
    }

    fn prompt() -> Prompt {
        let mut prompt = Prompt::default();
        prompt
            .workflow
            .insert("1".to_string(), Node::new("SaveImage").with_value("filename_prefix", "t"));
        prompt
    }

    fn history_body(messages: serde_json::Value) -> String {
        serde_json::json!({
            PROMPT_ID: {
                "outputs": {
                    "9": { "images": [
                        { "filename": "out_00001_.png", "subfolder": "", "type": "output" },
                        { "filename": "out_00002_.png", "subfolder": "", "type": "output" }
                    ] }
                },
                "status": { "status_str": "success", "completed": true, "messages": messages }
            }
        })
        .to_string()
    }

    #[test]
    fn test_concurrency_is_clamped() {
        let mut settings = PollSettings::default();
        settings.concurrency = 10;
        assert_eq!(settings.concurrency(), 3);
        settings.concurrency = 0;
        assert_eq!(settings.concurrency(), 1);
    }

    #[tokio::test]
    async fn test_submit_retries_only_connect_failures() {
        let comfy = Comfy::new_with_url("http://127.0.0.1:1")
            .unwrap()
            .with_settings(fast_settings());
        match comfy.submit(&prompt()).await {
            Err(ComfyError::SubmitFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/prompt")
            .with_status(400)
            .with_body(r#"{"error": "invalid prompt", "node_errors": {}}"#)
            .expect(1)
            .create_async()
            .await;
        let comfy = Comfy::new_with_url(server.url())
            .unwrap()
            .with_settings(fast_settings());
        assert!(matches!(
            comfy.submit(&prompt()).await,
            Err(ComfyError::ValidationFailed(_))
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_wait_completed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body(history_body(serde_json::json!([
                ["execution_start", {}],
                ["execution_cached", { "nodes": ["1"] }]
            ])))
            .create_async()
            .await;

        let comfy = Comfy::new_with_url(server.url())
            .unwrap()
            .with_settings(fast_settings());
        let outcome = comfy.wait(&PROMPT_ID.parse().unwrap()).await;
        assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
        assert_eq!(outcome.task().unwrap().images().count(), 2);
    }

    #[tokio::test]
    async fn test_wait_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body(history_body(serde_json::json!([
                ["execution_error", { "node_type": "KSampler", "exception_message": "CUDA out of memory" }]
            ])))
            .create_async()
            .await;

        let comfy = Comfy::new_with_url(server.url())
            .unwrap()
            .with_settings(fast_settings());
        let outcome = comfy.wait(&PROMPT_ID.parse().unwrap()).await;
        assert_eq!(outcome.label(), "failed");
        assert_eq!(
            outcome.error_message().as_deref(),
            Some("KSampler: CUDA out of memory")
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_through_poll_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(500)
            .expect_at_least(2)
            .create_async()
            .await;

        let comfy = Comfy::new_with_url(server.url())
            .unwrap()
            .with_settings(fast_settings());
        let outcome = comfy.wait(&PROMPT_ID.parse().unwrap()).await;
        assert!(matches!(outcome, JobOutcome::TimedOut { .. }));
        assert!(outcome.elapsed() >= Duration::from_millis(200));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_all_keeps_input_order() {
        let mut server = mockito::Server::new_async().await;
        let ids: Vec<Uuid> = (1..=4).map(Uuid::from_u128).collect();
        for (i, id) in ids.iter().enumerate() {
            server
                .mock("POST", "/prompt")
                .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                    "prompt": {"1": {"inputs": {"filename_prefix": format!("job{i}")}}}
                })))
                .with_status(200)
                .with_body(
                    serde_json::json!({"prompt_id": id, "number": i, "node_errors": {}}).to_string(),
                )
                .create_async()
                .await;
            // The first job never shows up in history, so it finishes last.
            let key = id.to_string();
            let history = if i == 0 {
                "{}".to_string()
            } else {
                serde_json::json!({
                    key: {
                        "outputs": {},
                        "status": {
                            "status_str": "success",
                            "completed": true,
                            "messages": [["execution_success", {}]]
                        }
                    }
                })
                .to_string()
            };
            server
                .mock("GET", format!("/history/{id}").as_str())
                .with_status(200)
                .with_body(history)
                .create_async()
                .await;
        }

        let comfy = Comfy::new_with_url(server.url())
            .unwrap()
            .with_settings(fast_settings());
        let prompts = (0..4).map(|i| {
            let mut prompt = Prompt::default();
            prompt.workflow.insert(
                "1".to_string(),
                Node::new("SaveImage").with_value("filename_prefix", format!("job{i}")),
            );
            prompt
        });
        let reports = comfy.execute_all(prompts).await;

        let reported: Vec<Option<Uuid>> = reports.iter().map(|report| report.prompt_id).collect();
        assert_eq!(reported, ids.into_iter().map(Some).collect::<Vec<_>>());
        assert!(matches!(reports[0].result, Ok(JobOutcome::TimedOut { .. })));
        assert!(reports[1..].iter().all(JobReport::is_success));
    }

    #[tokio::test]
    async fn test_execute_all_bounds_jobs_in_flight() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prompt")
            .with_status(200)
            .with_body(format!(r#"{{"prompt_id": "{PROMPT_ID}", "number": 1, "node_errors": {{}}}}"#))
            .create_async()
            .await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let settings = PollSettings {
            concurrency: 10,
            ..fast_settings()
        };
        let timeout = settings.timeout;
        let comfy = Comfy::new_with_url(server.url())
            .unwrap()
            .with_settings(settings);

        // Every job runs until its deadline. Four jobs with at most three in
        // flight take two full rounds.
        let start = Instant::now();
        let reports = comfy.execute_all(vec![prompt(), prompt(), prompt(), prompt()]).await;
        let elapsed = start.elapsed();

        assert_eq!(reports.len(), 4);
        assert!(reports
            .iter()
            .all(|report| matches!(report.result, Ok(JobOutcome::TimedOut { .. }))));
        assert!(elapsed >= timeout * 2, "finished in {elapsed:?}");
    }

    #[tokio::test]
    async fn test_execute_all_serial_with_concurrency_one() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prompt")
            .with_status(200)
            .with_body(format!(r#"{{"prompt_id": "{PROMPT_ID}", "number": 1, "node_errors": {{}}}}"#))
            .create_async()
            .await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let settings = PollSettings {
            timeout: Duration::from_millis(100),
            concurrency: 1,
            ..fast_settings()
        };
        let comfy = Comfy::new_with_url(server.url())
            .unwrap()
            .with_settings(settings);

        let start = Instant::now();
        comfy.execute_all(vec![prompt(), prompt(), prompt()]).await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_download_skips_existing_and_counts_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body(history_body(serde_json::json!([["execution_success", {}]])))
            .create_async()
            .await;
        let view = server
            .mock("GET", "/view")
            .match_query(mockito::Matcher::UrlEncoded(
                "filename".into(),
                "out_00002_.png".into(),
            ))
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out_00001_.png"), b"old").unwrap();

        let comfy = Comfy::new_with_url(server.url()).unwrap();
        let summary = comfy
            .download_outputs(&PROMPT_ID.parse().unwrap(), dir.path())
            .await
            .unwrap();
        assert_eq!(summary.skipped, vec![dir.path().join("out_00001_.png")]);
        assert!(summary.downloaded.is_empty());
        assert_eq!(summary.failed, 1);
        assert_eq!(std::fs::read(dir.path().join("out_00001_.png")).unwrap(), b"old");
        view.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_writes_new_files() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body(history_body(serde_json::json!([["execution_success", {}]])))
            .create_async()
            .await;
        server
            .mock("GET", "/view")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("png")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let comfy = Comfy::new_with_url(server.url()).unwrap();
        let summary = comfy
            .download_all([&PROMPT_ID.parse().unwrap()], &target)
            .await
            .unwrap();
        assert_eq!(summary.downloaded.len(), 2);
        assert_eq!(std::fs::read(target.join("out_00002_.png")).unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_download_leaves_no_partial_files() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body(history_body(serde_json::json!([["execution_success", {}]])))
            .create_async()
            .await;
        server
            .mock("GET", "/view")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("png")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        // A stale partial file is replaced, a directory in the way fails the write.
        std::fs::write(dir.path().join("out_00001_.png.part"), b"trunc").unwrap();
        std::fs::create_dir(dir.path().join("out_00002_.png.part")).unwrap();

        let comfy = Comfy::new_with_url(server.url()).unwrap();
        let summary = comfy
            .download_outputs(&PROMPT_ID.parse().unwrap(), dir.path())
            .await
            .unwrap();

        assert_eq!(summary.downloaded, vec![dir.path().join("out_00001_.png")]);
        assert_eq!(summary.failed, 1);
        assert_eq!(std::fs::read(dir.path().join("out_00001_.png")).unwrap(), b"png");
        assert!(!dir.path().join("out_00001_.png.part").exists());
        assert!(!dir.path().join("out_00002_.png").exists());
    }

    #[tokio::test]
    async fn test_download_unknown_prompt() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/history/{PROMPT_ID}").as_str())
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let comfy = Comfy::new_with_url(server.url()).unwrap();
        assert!(matches!(
            comfy
                .download_outputs(&PROMPT_ID.parse().unwrap(), dir.path())
                .await,
            Err(ComfyError::NotFound(_))
        ));
    }
}
