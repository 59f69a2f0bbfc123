use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::{Credentials, Endpoints, FetchError, ModelSource, ModelSpec};

/// Timeout for establishing a connection to a model host.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened to a model.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    /// The file was downloaded from `source`.
    Downloaded {
        path: PathBuf,
        bytes: u64,
        source: ModelSource,
    },
    /// The file already existed.
    Skipped { path: PathBuf },
}

impl FetchOutcome {
    pub fn path(&self) -> &Path {
        match self {
            FetchOutcome::Downloaded { path, .. } | FetchOutcome::Skipped { path } => path,
        }
    }
}

/// Downloads model files into a models directory.
#[derive(Clone, Debug)]
pub struct Downloader {
    client: reqwest::Client,
    models_dir: PathBuf,
    credentials: Credentials,
    endpoints: Endpoints,
    show_progress: bool,
}

impl Downloader {
    /// Creates a downloader writing below `models_dir`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new<P: Into<PathBuf>>(models_dir: P) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            models_dir: models_dir.into(),
            credentials: Credentials::default(),
            endpoints: Endpoints::default(),
            show_progress: true,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Enables or disables the progress bar on stderr.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// The path a model is saved to.
    pub fn target_path(&self, spec: &ModelSpec) -> PathBuf {
        self.models_dir.join(&spec.target_dir).join(&spec.filename)
    }

    /// Downloads a model unless its target already exists, trying each
    /// source in order.
    ///
    /// # Errors
    ///
    /// * `FetchError::NoSources` if the model lists no sources.
    /// * `FetchError::AllSourcesFailed` with each source's error once every
    ///   source failed.
    pub async fn fetch(&self, spec: &ModelSpec) -> Result<FetchOutcome, FetchError> {
        let path = self.target_path(spec);
        if path.exists() {
            info!(name = %spec.name, path = %path.display(), "already exists, skipping");
            return Ok(FetchOutcome::Skipped { path });
        }
        if spec.sources.is_empty() {
            return Err(FetchError::NoSources(spec.name.clone()));
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| FetchError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let mut errors = vec![];
        for source in &spec.sources {
            info!(name = %spec.name, %source, "downloading");
            match self.fetch_from(source, &path).await {
                Ok(bytes) => {
                    info!(name = %spec.name, path = %path.display(), bytes, "downloaded");
                    return Ok(FetchOutcome::Downloaded {
                        path,
                        bytes,
                        source: source.clone(),
                    });
                }
                Err(e) => {
                    warn!(name = %spec.name, %source, error = %e, "source failed, trying next");
                    errors.push((source.clone(), e));
                }
            }
        }
        error!(name = %spec.name, "all sources failed");
        Err(FetchError::AllSourcesFailed {
            name: spec.name.clone(),
            errors,
        })
    }

    /// Downloads models one after another.
    ///
    /// # Returns
    ///
    /// The outcome of every model, in input order.
    pub async fn fetch_all<'a, I>(&self, specs: I) -> Vec<(String, Result<FetchOutcome, FetchError>)>
    where
        I: IntoIterator<Item = &'a ModelSpec>,
    {
        let mut results = vec![];
        for spec in specs {
            results.push((spec.name.clone(), self.fetch(spec).await));
        }
        results
    }

    async fn fetch_from(&self, source: &ModelSource, path: &Path) -> Result<u64, FetchError> {
        let url = source.url(&self.endpoints)?;
        let mut request = self.client.get(url.clone());
        if let Some(token) = source.token(&self.credentials) {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|source| FetchError::RequestFailed {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }

        let mut part = path.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);
        let result = self.stream_to(response, &part).await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part, path)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Ok(bytes)
            }
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(&part).await {
                    warn!(path = %part.display(), error = %remove, "failed to remove partial download");
                }
                Err(e)
            }
        }
    }

    fn progress_bar(&self, len: Option<u64>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = match len {
            Some(len) => {
                let bar = ProgressBar::new(len);
                if let Ok(style) = ProgressStyle::with_template(
                    "{bar:40} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                ) {
                    bar.set_style(style);
                }
                bar
            }
            None => ProgressBar::new_spinner(),
        };
        bar.set_draw_target(ProgressDrawTarget::stderr());
        bar
    }

    async fn stream_to(&self, mut response: reqwest::Response, part: &Path) -> Result<u64, FetchError> {
        let io_error = |source: std::io::Error| FetchError::Io {
            path: part.to_path_buf(),
            source,
        };
        let url = response.url().to_string();
        let mut file = tokio::fs::File::create(part).await.map_err(io_error)?;
        let bar = self.progress_bar(response.content_length());
        let mut written = 0u64;
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|source| FetchError::RequestFailed {
                    url: url.clone(),
                    source,
                })?;
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len() as u64;
            bar.set_position(written);
        }
        file.flush().await.map_err(io_error)?;
        bar.finish_and_clear();
        Ok(written)
    }
}
