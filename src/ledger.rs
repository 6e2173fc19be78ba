use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Result, WorkflowError};
use crate::json_fs::{
    create_json_new, is_safe_id, list_json_files, read_json, write_json_atomic,
};
use crate::locks::KeyedLocks;
use crate::model::{Decision, ReviewPayload, ReviewRequest, ReviewStatus, VersionId};

/// Human review requests. Resolved requests are kept for audit and never
/// change again.
#[async_trait]
pub trait ReviewLedger: Send + Sync {
    /// Fails with `DuplicateOpenRequest` if `version_id` already has a
    /// pending request.
    async fn open_request(&self, version_id: &VersionId) -> Result<ReviewRequest>;

    async fn resolve(
        &self,
        request_id: &str,
        decision: Decision,
        payload: ReviewPayload,
    ) -> Result<ReviewRequest>;

    async fn get(&self, request_id: &str) -> Result<ReviewRequest>;

    async fn find_open(&self, version_id: &VersionId) -> Result<Option<ReviewRequest>>;

    /// Pending requests ordered by open time, then id.
    async fn list_pending(&self) -> Result<Vec<ReviewRequest>>;

    /// Every request ever opened for the chapter, oldest first.
    async fn list_for_chapter(&self, chapter_id: &str) -> Result<Vec<ReviewRequest>>;

    /// Every request, oldest first.
    async fn list_all(&self) -> Result<Vec<ReviewRequest>>;
}

/// Review activity: outcome counts and how long resolved requests waited.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewStatistics {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_turnaround_secs: Option<f64>,
}

impl ReviewStatistics {
    pub fn from_requests(requests: &[ReviewRequest]) -> Self {
        let mut stats = Self::default();
        let mut waited_ms = 0i64;
        let mut resolved = 0i64;
        for request in requests {
            match request.status {
                ReviewStatus::Pending => stats.pending += 1,
                ReviewStatus::Approved => stats.approved += 1,
                ReviewStatus::Rejected => stats.rejected += 1,
            }
            if let Some(resolved_at) = request.resolved_at {
                waited_ms += (resolved_at - request.opened_at).num_milliseconds().max(0);
                resolved += 1;
            }
        }
        if resolved > 0 {
            stats.average_turnaround_secs = Some(waited_ms as f64 / resolved as f64 / 1000.0);
        }
        stats
    }
}

#[derive(Debug)]
pub struct LocalFsReviewLedger {
    base_dir: PathBuf,
    locks: KeyedLocks,
}

impl LocalFsReviewLedger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    fn reviews_dir(&self) -> PathBuf {
        self.base_dir.join("reviews")
    }

    fn request_path(&self, request_id: &str) -> PathBuf {
        self.reviews_dir().join(format!("{request_id}.json"))
    }

    async fn load_all(&self) -> Result<Vec<ReviewRequest>> {
        let mut requests = Vec::new();
        for path in list_json_files(&self.reviews_dir()).await? {
            let request: Option<ReviewRequest> = read_json(&path).await?;
            requests.extend(request);
        }
        requests.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }
}

#[async_trait]
impl ReviewLedger for LocalFsReviewLedger {
    async fn open_request(&self, version_id: &VersionId) -> Result<ReviewRequest> {
        let _guard = self.locks.lock(&version_id.to_string()).await;

        if let Some(existing) = self.find_open(version_id).await? {
            return Err(WorkflowError::DuplicateOpenRequest {
                version_id: version_id.clone(),
                request_id: existing.id,
            });
        }

        let request = ReviewRequest {
            id: uuid::Uuid::new_v4().to_string(),
            chapter_id: version_id.chapter_id.clone(),
            version_id: version_id.clone(),
            status: ReviewStatus::Pending,
            opened_at: chrono::Utc::now(),
            resolved_at: None,
            decision: None,
            payload: ReviewPayload::default(),
        };
        if !create_json_new(&self.request_path(&request.id), &request).await? {
            return Err(anyhow::anyhow!("review request id collision: {}", request.id).into());
        }

        tracing::info!(
            request_id = %request.id,
            version_id = %version_id,
            "opened review request"
        );
        Ok(request)
    }

    async fn resolve(
        &self,
        request_id: &str,
        decision: Decision,
        payload: ReviewPayload,
    ) -> Result<ReviewRequest> {
        if !is_safe_id(request_id) {
            return Err(WorkflowError::not_found("review request", request_id));
        }
        let _guard = self.locks.lock(request_id).await;

        let mut request = self.get(request_id).await?;
        if !request.is_open() {
            return Err(WorkflowError::AlreadyResolved {
                request_id: request_id.to_owned(),
            });
        }
        if let Decision::Reject {
            reenter_at: Some(phase),
        } = decision
            && !phase.is_reentry_target()
        {
            return Err(WorkflowError::invalid_state(
                &request.chapter_id,
                "reject",
                format!("cannot re-enter at {phase}; choose DRAFTED or SPUN"),
            ));
        }

        request.status = decision.status();
        request.decision = Some(decision);
        request.payload = payload;
        request.resolved_at = Some(chrono::Utc::now());
        write_json_atomic(&self.request_path(request_id), &request).await?;

        tracing::info!(
            request_id,
            version_id = %request.version_id,
            status = ?request.status,
            "resolved review request"
        );
        Ok(request)
    }

    async fn get(&self, request_id: &str) -> Result<ReviewRequest> {
        if !is_safe_id(request_id) {
            return Err(WorkflowError::not_found("review request", request_id));
        }
        read_json(&self.request_path(request_id))
            .await?
            .ok_or_else(|| WorkflowError::not_found("review request", request_id))
    }

    async fn find_open(&self, version_id: &VersionId) -> Result<Option<ReviewRequest>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|r| r.is_open() && &r.version_id == version_id))
    }

    async fn list_pending(&self) -> Result<Vec<ReviewRequest>> {
        let mut pending = self.load_all().await?;
        pending.retain(ReviewRequest::is_open);
        Ok(pending)
    }

    async fn list_for_chapter(&self, chapter_id: &str) -> Result<Vec<ReviewRequest>> {
        let mut requests = self.load_all().await?;
        requests.retain(|r| r.chapter_id == chapter_id);
        Ok(requests)
    }

    async fn list_all(&self) -> Result<Vec<ReviewRequest>> {
        self.load_all().await
    }
}
