use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use common::{CandidateGroup, ConfirmedDuplicate, FileRecord};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_REASON: &str = "Marked as duplicate without explanation";

#[derive(Debug)]
pub enum VerifyError {
    MissingApiKey,
    Http(reqwest::Error),
    Json(serde_json::Error),
    Api(String),
    EmptyResponse,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::MissingApiKey => write!(f, "api key not configured"),
            VerifyError::Http(err) => write!(f, "http error: {}", err),
            VerifyError::Json(err) => write!(f, "json error: {}", err),
            VerifyError::Api(message) => write!(f, "service error: {}", message),
            VerifyError::EmptyResponse => write!(f, "service returned no content"),
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<reqwest::Error> for VerifyError {
    fn from(err: reqwest::Error) -> Self {
        VerifyError::Http(err)
    }
}

impl From<serde_json::Error> for VerifyError {
    fn from(err: serde_json::Error) -> Self {
        VerifyError::Json(err)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassificationRequest {
    pub groups: Vec<RequestGroup>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestGroup {
    pub group_id: usize,
    pub files: Vec<RequestFile>,
}

/// What the service sees of a file. Paths stay local.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestFile {
    pub id: usize,
    pub artist: String,
    pub title: String,
    pub filename: String,
    pub size: f64,
    pub duration: u32,
}

impl RequestFile {
    fn from_record(id: usize, record: &FileRecord) -> Self {
        Self {
            id,
            artist: record.artist.clone(),
            title: record.title.clone(),
            filename: record.filename.clone(),
            size: record.size_mb,
            duration: record.duration,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ClassificationResponse {
    #[serde(default)]
    pub results: Vec<GroupVerdict>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct GroupVerdict {
    pub group_id: i64,
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(default)]
    pub best_file_id: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub duplicate_ids: Vec<i64>,
}

/// Remote judge for candidate groups.
pub trait Classifier {
    fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> impl Future<Output = Result<ClassificationResponse, VerifyError>> + Send;
}

#[derive(Clone, Copy, Debug)]
pub struct VerifyOptions {
    pub batch_size: usize,
    pub max_group_members: usize,
    pub max_batch_members: usize,
    pub delay: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_group_members: 20,
            max_batch_members: 60,
            delay: Duration::from_secs(1),
        }
    }
}

/// The groups a request was built from; responses are resolved against it only.
pub struct BatchTicket {
    groups: Vec<CandidateGroup>,
}

impl BatchTicket {
    pub fn new(groups: Vec<CandidateGroup>) -> (Self, ClassificationRequest) {
        let request = ClassificationRequest {
            groups: groups
                .iter()
                .enumerate()
                .map(|(group_id, group)| RequestGroup {
                    group_id,
                    files: group
                        .files
                        .iter()
                        .enumerate()
                        .map(|(id, record)| RequestFile::from_record(id, record))
                        .collect(),
                })
                .collect(),
        };
        (Self { groups }, request)
    }

    pub fn reconcile(&self, response: ClassificationResponse) -> Vec<ConfirmedDuplicate> {
        let mut confirmed = Vec::new();
        let mut resolved = HashSet::new();
        for verdict in response.results {
            let Some((idx, group)) = index_in(verdict.group_id, self.groups.len())
                .and_then(|idx| self.groups.get(idx).map(|group| (idx, group)))
            else {
                warn!("Ignoring verdict for unknown group {}", verdict.group_id);
                continue;
            };
            if !resolved.insert(idx) {
                warn!("Ignoring repeated verdict for group {}", verdict.group_id);
                continue;
            }
            if !verdict.is_duplicate {
                continue;
            }

            let size = group.len();
            let best_id = verdict.best_file_id.and_then(|id| index_in(id, size));
            let mut duplicate_ids: Vec<usize> = verdict
                .duplicate_ids
                .iter()
                .filter_map(|id| index_in(*id, size))
                .filter(|id| Some(*id) != best_id)
                .collect();
            duplicate_ids.sort_unstable();
            duplicate_ids.dedup();
            if duplicate_ids.is_empty() {
                if let Some(best) = best_id {
                    duplicate_ids = (0..size).filter(|id| *id != best).collect();
                }
            }

            let reason = verdict
                .reason
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_REASON.to_string());

            confirmed.push(ConfirmedDuplicate {
                files: group.files.clone(),
                reason,
                best_id,
                duplicate_ids,
            });
        }
        confirmed
    }
}

fn index_in(id: i64, len: usize) -> Option<usize> {
    usize::try_from(id).ok().filter(|idx| *idx < len)
}

pub struct AiVerifier<C> {
    classifier: C,
    options: VerifyOptions,
}

impl<C: Classifier> AiVerifier<C> {
    pub fn new(classifier: C, options: VerifyOptions) -> Self {
        Self {
            classifier,
            options,
        }
    }

    /// Sends groups batch by batch. `on_progress` receives `(batches done, batches total)`.
    pub async fn verify<F>(
        &self,
        groups: Vec<CandidateGroup>,
        mut on_progress: F,
    ) -> Vec<ConfirmedDuplicate>
    where
        F: FnMut(usize, usize),
    {
        let hardened = split_oversized(groups, self.options.max_group_members);
        let batches = plan_batches(
            hardened,
            self.options.batch_size,
            self.options.max_batch_members,
        );
        let total = batches.len();
        let mut confirmed = Vec::new();

        for (idx, batch) in batches.into_iter().enumerate() {
            if idx > 0 && !self.options.delay.is_zero() {
                tokio::time::sleep(self.options.delay).await;
            }
            let (ticket, request) = BatchTicket::new(batch);
            match self.classifier.classify(&request).await {
                Ok(response) => {
                    let found = ticket.reconcile(response);
                    info!(
                        "Batch {}/{}: {} confirmed duplicate groups",
                        idx + 1,
                        total,
                        found.len()
                    );
                    confirmed.extend(found);
                }
                Err(err) => warn!("Batch {}/{} failed: {}", idx + 1, total, err),
            }
            on_progress(idx + 1, total);
        }
        confirmed
    }
}

/// Splits groups above `max_members`; a lone trailing member joins the previous chunk.
pub fn split_oversized(groups: Vec<CandidateGroup>, max_members: usize) -> Vec<CandidateGroup> {
    let max_members = max_members.max(2);
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        if group.len() <= max_members {
            out.push(group);
            continue;
        }
        let mut chunks: Vec<Vec<FileRecord>> = group
            .files
            .chunks(max_members)
            .map(|chunk| chunk.to_vec())
            .collect();
        if chunks.len() > 1 && chunks.last().map(Vec::len) == Some(1) {
            if let Some(last) = chunks.pop() {
                if let Some(prev) = chunks.last_mut() {
                    prev.extend(last);
                }
            }
        }
        out.extend(chunks.into_iter().map(CandidateGroup::new));
    }
    out
}

/// Packs groups into batches capped by group count and total members.
pub fn plan_batches(
    groups: Vec<CandidateGroup>,
    batch_size: usize,
    max_members: usize,
) -> Vec<Vec<CandidateGroup>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<CandidateGroup> = Vec::new();
    let mut members = 0usize;
    for group in groups {
        if !current.is_empty() && members + group.len() > max_members {
            batches.push(std::mem::take(&mut current));
            members = 0;
        }
        members += group.len();
        current.push(group);
        if current.len() >= batch_size {
            batches.push(std::mem::take(&mut current));
            members = 0;
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
