use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Failure, JobStatus, PageStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum JobEvent {
    Submitted {
        job_id: Uuid,
        title: String,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        job_id: Uuid,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Failure>,
        timestamp: DateTime<Utc>,
    },
    PageChanged {
        job_id: Uuid,
        index: usize,
        status: PageStatus,
        timestamp: DateTime<Utc>,
    },
    Progress {
        job_id: Uuid,
        pages_done: usize,
        pages_failed: usize,
        page_count: usize,
        timestamp: DateTime<Utc>,
    },
    Deleted {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::StatusChanged { job_id, .. }
            | JobEvent::PageChanged { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Deleted { job_id, .. } => *job_id,
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Submitted { .. } => "submitted",
            JobEvent::StatusChanged { .. } => "status",
            JobEvent::PageChanged { .. } => "page",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Deleted { .. } => "deleted",
        }
    }

    pub fn status_changed(job_id: Uuid, status: JobStatus, error: Option<Failure>) -> Self {
        JobEvent::StatusChanged {
            job_id,
            status,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn page_changed(job_id: Uuid, index: usize, status: PageStatus) -> Self {
        JobEvent::PageChanged {
            job_id,
            index,
            status,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;
    use tokio::sync::broadcast;

    #[test]
    fn test_status_changed_serializes() {
        let event = JobEvent::status_changed(
            Uuid::nil(),
            JobStatus::Failed,
            Some(Failure::cancelled("cancelled by user")),
        );
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"StatusChanged\""));
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("\"kind\":\"Cancelled\""));
        assert_eq!(ErrorKind::Cancelled.as_str(), "Cancelled");
    }

    #[test]
    fn test_page_changed_omits_nothing() {
        let event = JobEvent::page_changed(Uuid::nil(), 3, PageStatus::Translating);
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"index\":3"));
        assert!(json.contains("\"status\":\"translating\""));
        assert_eq!(event.name(), "page");
    }

    #[test]
    fn test_job_id_accessor() {
        let id = Uuid::now_v7();
        let event = JobEvent::Deleted {
            job_id: id,
            timestamp: Utc::now(),
        };
        assert_eq!(event.job_id(), id);
        assert_eq!(event.name(), "deleted");
    }

    #[tokio::test]
    async fn test_broadcast_multiple_subscribers() {
        let (tx, _) = broadcast::channel::<JobEvent>(16);
        let mut rx1 = tx.subscribe();
        let mut rx2 = tx.subscribe();

        let id = Uuid::now_v7();
        tx.send(JobEvent::Progress {
            job_id: id,
            pages_done: 1,
            pages_failed: 0,
            page_count: 4,
            timestamp: Utc::now(),
        })
        .unwrap();

        assert_eq!(rx1.recv().await.unwrap().job_id(), id);
        assert_eq!(rx2.recv().await.unwrap().job_id(), id);
    }

    #[tokio::test]
    async fn test_broadcast_lagged_receiver() {
        let (tx, mut rx) = broadcast::channel::<JobEvent>(2);
        for i in 0..5 {
            tx.send(JobEvent::page_changed(Uuid::nil(), i, PageStatus::Done))
                .unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
