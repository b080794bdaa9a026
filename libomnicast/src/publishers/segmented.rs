//! Segmented transfer: init, transfer, finalize
//!
//! The media is split into fixed-size segments read from the source by byte
//! range. When a segment transfer fails with a transient error, the
//! destination is asked how many bytes it has acknowledged and the transfer
//! continues from there instead of starting over. The open session is stored
//! on the task so that a later attempt resumes it too.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::api::{
    file_name_from_url, mime_from_url, MediaSource, Segment, SegmentAck, SegmentedUploadApi, UploadInit,
    UploadSession,
};
use crate::db::Database;
use crate::error::{OmnicastError, Result};
use crate::types::PublishTask;

/// Resumes allowed within one attempt before the failure is returned
const MAX_RESUMES: u32 = 3;

/// How the destination identifies a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Fixed numbered parts; a partially received part is sent again whole
    PartNumber,
    /// Arbitrary byte offsets; the transfer continues at the exact byte
    ByteOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    total: u64,
    chunk_size: u64,
}

impl SegmentPlan {
    /// Split `total` bytes into `chunk_size` segments, the last one partial
    pub fn new(total: u64, chunk_size: u64) -> Result<Self> {
        if total == 0 {
            return Err(OmnicastError::InvalidInput("media is empty".to_string()));
        }
        if chunk_size == 0 {
            return Err(OmnicastError::InvalidInput("chunk size must be positive".to_string()));
        }
        Ok(Self {
            total,
            chunk_size: chunk_size.min(total),
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn segment_count(&self) -> u32 {
        self.total.div_ceil(self.chunk_size) as u32
    }

    pub fn segment(&self, index: u32) -> Segment {
        let start = index as u64 * self.chunk_size;
        Segment {
            index,
            start,
            end: (start + self.chunk_size - 1).min(self.total - 1),
            total: self.total,
        }
    }

    pub fn segments(&self) -> Vec<Segment> {
        (0..self.segment_count()).map(|i| self.segment(i)).collect()
    }

    /// Segments still to send when the destination holds `offset` bytes
    pub fn remaining_from(&self, offset: u64, addressing: Addressing) -> Vec<Segment> {
        self.segments()
            .into_iter()
            .filter(|segment| segment.end >= offset)
            .map(|mut segment| {
                if addressing == Addressing::ByteOffset && segment.start < offset {
                    segment.start = offset;
                }
                segment
            })
            .collect()
    }
}

/// What one transfer run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub segments_sent: u32,
    pub resumes: u32,
    /// Content id carried by the destination's final acknowledgment
    pub content_id: Option<String>,
}

/// Upload session persisted on the task between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUpload {
    pub session: UploadSession,
    pub total_size: u64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub session: UploadSession,
    pub total_size: u64,
    pub report: TransferReport,
}

pub struct SegmentedUpload<'a, A: ?Sized, S: ?Sized> {
    api: &'a A,
    source: &'a S,
    db: &'a Database,
    addressing: Addressing,
    chunk_size: u64,
}

impl<'a, A, S> SegmentedUpload<'a, A, S>
where
    A: SegmentedUploadApi + ?Sized,
    S: MediaSource + ?Sized,
{
    pub fn new(api: &'a A, source: &'a S, db: &'a Database, addressing: Addressing, chunk_size: u64) -> Self {
        Self {
            api,
            source,
            db,
            addressing,
            chunk_size,
        }
    }

    /// Open (or resume) a session for `media_url` and send every segment
    ///
    /// `metadata` is passed to the destination when a new session is opened.
    /// Finalizing is left to the caller.
    pub async fn upload(
        &self,
        token: &SecretString,
        task: &PublishTask,
        media_url: &str,
        metadata: serde_json::Value,
    ) -> Result<CompletedUpload> {
        let total = self.source.content_length(media_url).await?;
        let plan = SegmentPlan::new(total, self.chunk_size)?;

        let (session, offset) = match self.resume(token, task, &plan).await? {
            Some(resumed) => resumed,
            None => (self.open(token, task, media_url, &plan, metadata).await?, 0),
        };

        let report = self.transfer(token, &session, media_url, &plan, offset).await?;
        info!(
            task_id = %task.id,
            session_id = %session.session_id,
            segments = report.segments_sent,
            resumes = report.resumes,
            "Segmented transfer complete"
        );

        Ok(CompletedUpload {
            session,
            total_size: total,
            report,
        })
    }

    async fn open(
        &self,
        token: &SecretString,
        task: &PublishTask,
        media_url: &str,
        plan: &SegmentPlan,
        metadata: serde_json::Value,
    ) -> Result<UploadSession> {
        let init = UploadInit {
            file_name: file_name_from_url(media_url),
            mime_type: mime_from_url(media_url).to_string(),
            total_size: plan.total(),
            chunk_size: plan.chunk_size(),
            total_chunks: plan.segment_count(),
            metadata,
        };
        let session = self.api.init_upload(token, &init).await?;

        let stored = StoredUpload {
            session: session.clone(),
            total_size: plan.total(),
            chunk_size: plan.chunk_size(),
        };
        let json = serde_json::to_string(&stored)
            .map_err(|e| OmnicastError::InvalidInput(format!("upload session: {}", e)))?;
        self.db.save_upload_session(&task.id, Some(&json)).await?;

        debug!(task_id = %task.id, session_id = %session.session_id, segments = plan.segment_count(), "Upload session opened");
        Ok(session)
    }

    /// The stored session and its acknowledged offset, if it can be resumed
    async fn resume(
        &self,
        token: &SecretString,
        task: &PublishTask,
        plan: &SegmentPlan,
    ) -> Result<Option<(UploadSession, u64)>> {
        let Some(raw) = task.upload_session.as_deref() else {
            return Ok(None);
        };
        let stored: StoredUpload = match serde_json::from_str(raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Ignoring unreadable upload session");
                return Ok(None);
            }
        };
        if stored.total_size != plan.total() || stored.chunk_size != plan.chunk_size() {
            info!(task_id = %task.id, "Source media changed, opening a new upload session");
            return Ok(None);
        }

        match self.api.acknowledged_offset(token, &stored.session).await {
            Ok(offset) => {
                info!(task_id = %task.id, session_id = %stored.session.session_id, offset, "Resuming upload session");
                Ok(Some((stored.session, offset)))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Stored upload session is gone, opening a new one");
                Ok(None)
            }
        }
    }

    /// Send every segment from `offset` on
    pub async fn transfer(
        &self,
        token: &SecretString,
        session: &UploadSession,
        media_url: &str,
        plan: &SegmentPlan,
        offset: u64,
    ) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        let mut pending: VecDeque<Segment> = plan.remaining_from(offset, self.addressing).into();

        while let Some(segment) = pending.pop_front() {
            let data = self.source.fetch_range(media_url, segment.start, segment.end).await?;

            match self.api.transfer_segment(token, session, &segment, data).await {
                Ok(SegmentAck::Complete { content_id }) => {
                    report.segments_sent += 1;
                    report.content_id = content_id;
                    break;
                }
                Ok(SegmentAck::Continue { next_offset }) => {
                    report.segments_sent += 1;
                    if next_offset != segment.end + 1 {
                        debug!(
                            session_id = %session.session_id,
                            expected = segment.end + 1,
                            next_offset,
                            "Destination asked for a different offset"
                        );
                        pending = plan.remaining_from(next_offset, self.addressing).into();
                    }
                }
                Err(e) if e.is_transient() && report.resumes < MAX_RESUMES => {
                    report.resumes += 1;
                    warn!(
                        session_id = %session.session_id,
                        segment = segment.index,
                        resume = report.resumes,
                        error = %e,
                        "Segment transfer interrupted, querying acknowledged offset"
                    );
                    let acknowledged = self.api.acknowledged_offset(token, session).await?;
                    pending = plan.remaining_from(acknowledged, self.addressing).into();
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }
}
