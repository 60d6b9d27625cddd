use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::service::TranslationService;
use super::sidecar::{Extraction, Sidecar, SlideTranslations, TextPair, TranslationDoc};
use crate::config::SidecarConfig;
use crate::progress::{ProgressEvent, ProgressHub};
use crate::resilience::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::resilience::pool::{ConnectionPool, PoolError};

pub const SIDECAR_RESOURCE: &str = "sidecar";

// Zip local file header; every .pptx starts with it
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const TRANSLATE_CHUNK: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("file is empty")]
    Empty,
    #[error("file exceeds {0} bytes")]
    TooLarge(usize),
    #[error("file is not a PowerPoint document")]
    NotPptx,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub file_id: String,
    #[serde(skip)]
    pub owner: String,
    pub file_name: String,
    pub size: usize,
    #[serde(skip)]
    pub path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip)]
    stored: Instant,
}

/// Uploaded documents, each readable only by the user who sent it.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: usize,
    files: Arc<RwLock<HashMap<String, UploadedFile>>>,
}

impl UploadStore {
    pub fn new(config: &SidecarConfig) -> Self {
        Self {
            dir: Path::new(&config.work_dir).join("uploads"),
            max_bytes: config.max_upload_bytes,
            files: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn validate(&self, bytes: &[u8]) -> Result<(), UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(UploadError::TooLarge(self.max_bytes));
        }
        if !bytes.starts_with(ZIP_MAGIC) {
            return Err(UploadError::NotPptx);
        }
        Ok(())
    }

    /// Stores an already validated document.
    pub async fn save(&self, owner: &str, file_name: &str, bytes: &[u8]) -> Result<UploadedFile> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let file_id = Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{file_id}.pptx"));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        let file = UploadedFile {
            file_id: file_id.clone(),
            owner: owner.to_string(),
            file_name: sanitize_file_name(file_name),
            size: bytes.len(),
            path,
            uploaded_at: Utc::now(),
            stored: Instant::now(),
        };
        self.files.write().await.insert(file_id, file.clone());
        info!(file_id = %file.file_id, size = file.size, "upload stored");
        Ok(file)
    }

    pub async fn get(&self, file_id: &str, owner: &str) -> Option<UploadedFile> {
        self.files
            .read()
            .await
            .get(file_id)
            .filter(|f| f.owner == owner)
            .cloned()
    }

    /// Deletes uploads stored longer than `retention` ago.
    pub async fn purge_older_than(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<UploadedFile> = {
            let mut files = self.files.write().await;
            let ids: Vec<String> = files
                .values()
                .filter(|f| now.duration_since(f.stored) >= retention)
                .map(|f| f.file_id.clone())
                .collect();
            ids.iter().filter_map(|id| files.remove(id)).collect()
        };
        for file in &expired {
            remove_file(&file.path).await;
        }
        expired.len()
    }
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .collect();
    if cleaned.trim().is_empty() {
        "presentation.pptx".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    #[serde(skip)]
    pub owner: String,
    pub status: JobStatus,
    pub target_language: String,
    pub file_name: String,
    #[serde(skip)]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    finished: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Extract,
    Translate,
    Apply,
}

impl Stage {
    // Client-facing text; the error chain only goes to the log.
    fn failure_message(self) -> &'static str {
        match self {
            Stage::Extract => "could not read the presentation",
            Stage::Translate => "translation failed",
            Stage::Apply => "could not write the translated presentation",
        }
    }
}

/// Runs document translation jobs in the background and reports progress.
#[derive(Debug, Clone)]
pub struct JobRunner {
    sidecar: Sidecar,
    service: Arc<TranslationService>,
    hub: ProgressHub,
    pool: ConnectionPool,
    breaker: CircuitBreaker,
    output_dir: PathBuf,
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl JobRunner {
    pub fn new(
        config: &SidecarConfig,
        service: Arc<TranslationService>,
        hub: ProgressHub,
        pool: ConnectionPool,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            sidecar: Sidecar::new(config),
            service,
            hub,
            pool,
            breaker,
            output_dir: Path::new(&config.work_dir).join("output"),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn download_url(job_id: &str) -> String {
        format!("/api/jobs/{job_id}/download")
    }

    /// Registers the job and spawns it; progress goes to the hub.
    pub async fn start(&self, upload: UploadedFile, target_language: &str) -> JobRecord {
        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord {
            job_id: job_id.clone(),
            owner: upload.owner.clone(),
            status: JobStatus::Running,
            target_language: target_language.to_string(),
            file_name: upload.file_name.clone(),
            output: None,
            error: None,
            created_at: Utc::now(),
            finished: None,
        };
        self.hub.create(&job_id);
        self.jobs.write().await.insert(job_id.clone(), record.clone());

        let runner = self.clone();
        let lang = target_language.to_string();
        tokio::spawn(async move {
            runner.run(&job_id, &upload, &lang).await;
        });
        record
    }

    pub async fn get(&self, job_id: &str, owner: &str) -> Option<JobRecord> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .filter(|j| j.owner == owner)
            .cloned()
    }

    /// Drops jobs finished more than `retention` ago, with their progress
    /// channel and output file. Running jobs are kept.
    pub async fn purge_finished(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<JobRecord> = {
            let mut jobs = self.jobs.write().await;
            let ids: Vec<String> = jobs
                .values()
                .filter(|j| j.finished.is_some_and(|t| now.duration_since(t) >= retention))
                .map(|j| j.job_id.clone())
                .collect();
            ids.iter().filter_map(|id| jobs.remove(id)).collect()
        };
        for job in &expired {
            self.hub.forget(&job.job_id);
            if let Some(output) = &job.output {
                remove_file(output).await;
            }
        }
        expired.len()
    }

    async fn run(&self, job_id: &str, upload: &UploadedFile, lang: &str) {
        self.hub.publish(job_id, ProgressEvent::Started { job_id: job_id.to_string() });
        let mut stage = Stage::Extract;
        let result = self.process(job_id, upload, lang, &mut stage).await;
        let event = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(job_id);
            match result {
                Ok(output) => {
                    info!(job_id, "translation job completed");
                    if let Some(job) = job {
                        job.status = JobStatus::Completed;
                        job.output = Some(output);
                        job.finished = Some(Instant::now());
                    }
                    ProgressEvent::Completed { output: Self::download_url(job_id) }
                }
                Err(e) => {
                    error!(job_id, stage = ?stage, error = %format!("{e:#}"), "translation job failed");
                    let msg = stage.failure_message().to_string();
                    if let Some(job) = job {
                        job.status = JobStatus::Failed;
                        job.error = Some(msg.clone());
                        job.finished = Some(Instant::now());
                    }
                    ProgressEvent::Failed { error: msg }
                }
            }
        };
        self.hub.publish(job_id, event);
    }

    async fn process(
        &self,
        job_id: &str,
        upload: &UploadedFile,
        lang: &str,
        stage: &mut Stage,
    ) -> Result<PathBuf> {
        self.hub.publish(job_id, ProgressEvent::progress("extract", 10, None));
        let extraction = self
            .pool
            .run(SIDECAR_RESOURCE, self.breaker.execute(|| self.sidecar.extract(&upload.path)))
            .await;
        let extraction = guarded(extraction)?;

        *stage = Stage::Translate;
        let originals = unique_strings(&extraction);
        self.hub.publish(
            job_id,
            ProgressEvent::progress(
                "translate",
                30,
                Some(format!("{} texts on {} slides", originals.len(), extraction.total_slides)),
            ),
        );

        let mut translated: HashMap<&str, String> = HashMap::with_capacity(originals.len());
        let mut done = 0;
        for chunk in originals.chunks(TRANSLATE_CHUNK) {
            let out = self.service.translate_all(chunk, lang).await?;
            for (orig, t) in chunk.iter().zip(out) {
                translated.insert(orig.as_str(), t);
            }
            done += chunk.len();
            let percent = 30 + (done * 50 / originals.len().max(1)) as u8;
            self.hub.publish(job_id, ProgressEvent::progress("translate", percent, None));
        }

        let doc = build_doc(&extraction, &translated);
        *stage = Stage::Apply;
        self.hub.publish(job_id, ProgressEvent::progress("apply", 85, None));
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        let output = self.output_dir.join(format!("{job_id}.pptx"));
        let outcome = self
            .pool
            .run(SIDECAR_RESOURCE, self.breaker.execute(|| self.sidecar.apply(&upload.path, &output, &doc)))
            .await;
        let outcome = guarded(outcome)?;
        info!(job_id, applied = outcome.applied_count, "translations applied");

        let written = outcome.output_path.map(PathBuf::from).unwrap_or(output);
        if !written.is_file() {
            return Err(anyhow!("translated document missing at {}", written.display()));
        }
        Ok(written)
    }
}

fn guarded<T>(res: Result<Result<T, BreakerError<anyhow::Error>>, PoolError>) -> Result<T> {
    match res {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(BreakerError::Inner(e))) => Err(e),
        Ok(Err(e)) => Err(anyhow!("document processor unavailable: {e}")),
        Err(e) => Err(anyhow!("document processor unavailable: {e}")),
    }
}

fn unique_strings(extraction: &Extraction) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for slide in &extraction.slides {
        for item in &slide.texts {
            for s in item.strings() {
                if seen.insert(s) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

fn build_doc(extraction: &Extraction, translated: &HashMap<&str, String>) -> TranslationDoc {
    let slides = extraction
        .slides
        .iter()
        .map(|slide| SlideTranslations {
            slide_number: slide.slide_number,
            translations: slide
                .texts
                .iter()
                .flat_map(|item| item.strings())
                .filter_map(|s| {
                    translated.get(s).map(|t| TextPair {
                        original: s.to_string(),
                        translated: t.clone(),
                    })
                })
                .collect(),
        })
        .filter(|s| !s.translations.is_empty())
        .collect();
    TranslationDoc { slides }
}
