//! Job repository.
//!
//! Every mutation runs inside a [`WriteTransaction`](crate::database::WriteTransaction),
//! so status changes are serialized process-wide. Status changes are
//! compare-and-set updates (`WHERE status = <expected>`): a transition whose
//! precondition no longer holds affects zero rows instead of clobbering a
//! concurrent one.

use async_trait::async_trait;
use tracing::error;

use crate::database::Store;
use crate::database::models::{
    JobCounts, JobDbModel, JobStatus, NewJobDbModel, TransitionDetail,
};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: i64) -> Result<JobDbModel>;
    /// Newest first. `limit <= 0` means no limit.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<JobDbModel>>;
    async fn count_jobs_by_status(&self) -> Result<JobCounts>;
    /// Insert a job in `waiting` and return the stored row.
    async fn create_job(&self, job: &NewJobDbModel) -> Result<JobDbModel>;
    /// Atomically move the oldest `waiting` job to `running` and return it.
    async fn claim_next_waiting_job(&self) -> Result<Option<JobDbModel>>;
    /// Move job `id` from `from` to `to`.
    ///
    /// Returns `Ok(false)` when the row is not (or no longer) in `from`.
    /// Illegal transitions are rejected before touching the database.
    async fn transition(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        detail: TransitionDetail,
    ) -> Result<bool>;
    /// Force every `waiting`/`running` job to `error`. Returns the number of rows swept.
    async fn fail_in_flight_jobs(&self, reason: &str) -> Result<u64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    store: Store,
}

impl SqlxJobRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

/// Reject a transition the state machine does not allow.
///
/// Reaching this with an illegal pair is a scheduler bug: it panics in debug
/// builds and is logged and returned as an error in release builds.
fn check_transition(id: i64, from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    debug_assert!(false, "illegal job transition {from} -> {to} for job {id}");
    error!(job_id = id, %from, %to, "Rejected illegal job state transition");
    Err(Error::invalid_transition(from, to))
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: i64) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM task WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.reader())
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<JobDbModel>> {
        let limit = if limit <= 0 { -1 } else { limit };
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM task WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(self.store.reader())
                .await?
            }
            None => {
                sqlx::query_as::<_, JobDbModel>("SELECT * FROM task ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.store.reader())
                    .await?
            }
        };
        Ok(jobs)
    }

    async fn count_jobs_by_status(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM task GROUP BY status")
                .fetch_all(self.store.reader())
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let status = JobStatus::parse(&status)
                .ok_or_else(|| Error::Database(format!("unknown job status '{}'", status)))?;
            counts.add(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn create_job(&self, job: &NewJobDbModel) -> Result<JobDbModel> {
        let now = now_ms();
        let mut tx = self.store.begin_write().await?;
        let created = sqlx::query_as::<_, JobDbModel>(
            r#"
            INSERT INTO task (bvid, cid, format, title, owner, cover, status, folder, duration, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&job.bvid)
        .bind(job.cid)
        .bind(job.format)
        .bind(&job.title)
        .bind(&job.owner)
        .bind(&job.cover)
        .bind(JobStatus::Waiting.as_str())
        .bind(&job.folder)
        .bind(job.duration)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn claim_next_waiting_job(&self) -> Result<Option<JobDbModel>> {
        let now = now_ms();
        let mut tx = self.store.begin_write().await?;
        let claimed = sqlx::query_as::<_, JobDbModel>(
            r#"
            UPDATE task SET status = 'running', updated_at = ?
            WHERE id = (SELECT id FROM task WHERE status = 'waiting' ORDER BY id LIMIT 1)
              AND status = 'waiting'
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        detail: TransitionDetail,
    ) -> Result<bool> {
        check_transition(id, from, to)?;

        let now = now_ms();
        let mut tx = self.store.begin_write().await?;
        let result = sqlx::query(
            r#"
            UPDATE task SET
                status = ?,
                updated_at = ?,
                output_path = COALESCE(?, output_path),
                error = COALESCE(?, error)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(detail.output_path.as_deref())
        .bind(detail.error.as_deref())
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_in_flight_jobs(&self, reason: &str) -> Result<u64> {
        let now = now_ms();
        let mut tx = self.store.begin_write().await?;
        let result = sqlx::query(
            r#"
            UPDATE task SET status = 'error', updated_at = ?, error = COALESCE(error, ?)
            WHERE status IN ('waiting', 'running')
            "#,
        )
        .bind(now)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_store;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    fn new_job(bvid: &str) -> NewJobDbModel {
        NewJobDbModel {
            bvid: bvid.to_string(),
            cid: 42,
            format: 80,
            title: format!("title of {bvid}"),
            owner: "owner".to_string(),
            cover: "https://i0.hdslb.com/cover.jpg".to_string(),
            folder: "/downloads".to_string(),
            duration: 120,
        }
    }

    #[tokio::test]
    async fn test_create_job_starts_waiting() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxJobRepository::new(store);

        let first = repo.create_job(&new_job("BV1a")).await.unwrap();
        let second = repo.create_job(&new_job("BV1b")).await.unwrap();

        assert_eq!(first.status().unwrap(), JobStatus::Waiting);
        assert!(second.id > first.id);
        assert_eq!(first.created_at, first.updated_at);

        let fetched = repo.get_job(first.id).await.unwrap();
        assert_eq!(fetched.bvid, "BV1a");
        assert_eq!(fetched.folder, "/downloads");
    }

    #[tokio::test]
    async fn test_get_missing_job_is_not_found() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxJobRepository::new(store);
        assert!(matches!(
            repo.get_job(999).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxJobRepository::new(store);

        let a = repo.create_job(&new_job("BV1a")).await.unwrap();
        let b = repo.create_job(&new_job("BV1b")).await.unwrap();

        let first = repo.claim_next_waiting_job().await.unwrap().unwrap();
        let second = repo.claim_next_waiting_job().await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert_eq!(first.status().unwrap(), JobStatus::Running);
        assert!(repo.claim_next_waiting_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxJobRepository::new(store);
        let job = repo.create_job(&new_job("BV1a")).await.unwrap();

        // Not running yet: running -> done must not apply.
        let applied = repo
            .transition(job.id, JobStatus::Running, JobStatus::Done, TransitionDetail::none())
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            repo.get_job(job.id).await.unwrap().status().unwrap(),
            JobStatus::Waiting
        );

        repo.claim_next_waiting_job().await.unwrap().unwrap();
        let applied = repo
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::Done,
                TransitionDetail::output("/downloads/a.mp4"),
            )
            .await
            .unwrap();
        assert!(applied);

        let done = repo.get_job(job.id).await.unwrap();
        assert_eq!(done.status().unwrap(), JobStatus::Done);
        assert_eq!(done.output_path.as_deref(), Some("/downloads/a.mp4"));
        assert!(done.error.is_none());
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "illegal job transition")]
    async fn test_illegal_transition_panics_in_debug() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxJobRepository::new(store);
        let job = repo.create_job(&new_job("BV1a")).await.unwrap();
        let _ = repo
            .transition(job.id, JobStatus::Done, JobStatus::Waiting, TransitionDetail::none())
            .await;
    }

    #[tokio::test]
    async fn test_fail_in_flight_sweeps_only_in_flight_rows() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxJobRepository::new(store);

        let done = repo.create_job(&new_job("BV1done")).await.unwrap();
        repo.claim_next_waiting_job().await.unwrap();
        repo.transition(done.id, JobStatus::Running, JobStatus::Done, TransitionDetail::none())
            .await
            .unwrap();

        let running = repo.create_job(&new_job("BV1run")).await.unwrap();
        repo.claim_next_waiting_job().await.unwrap();
        let waiting = repo.create_job(&new_job("BV1wait")).await.unwrap();

        let swept = repo.fail_in_flight_jobs("interrupted").await.unwrap();
        assert_eq!(swept, 2);

        for id in [running.id, waiting.id] {
            let job = repo.get_job(id).await.unwrap();
            assert_eq!(job.status().unwrap(), JobStatus::Error);
            assert_eq!(job.error.as_deref(), Some("interrupted"));
        }
        assert_eq!(
            repo.get_job(done.id).await.unwrap().status().unwrap(),
            JobStatus::Done
        );

        // Idempotent.
        assert_eq!(repo.fail_in_flight_jobs("interrupted").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxJobRepository::new(store);
        for i in 0..3 {
            repo.create_job(&new_job(&format!("BV{i}"))).await.unwrap();
        }
        repo.claim_next_waiting_job().await.unwrap();

        let waiting = repo.list_jobs(Some(JobStatus::Waiting), 0).await.unwrap();
        assert_eq!(waiting.len(), 2);
        assert!(waiting[0].id > waiting[1].id, "newest first");

        let limited = repo.list_jobs(None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let counts = repo.count_jobs_by_status().await.unwrap();
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_double_claim() {
        const JOBS: usize = 40;
        const WORKERS: usize = 8;

        let (store, _dir) = temp_store().await;
        let repo = Arc::new(SqlxJobRepository::new(store));
        for i in 0..JOBS {
            repo.create_job(&new_job(&format!("BV{i}"))).await.unwrap();
        }

        let claimed = Arc::new(dashmap::DashSet::<i64>::new());
        let mut workers = JoinSet::new();
        for _ in 0..WORKERS {
            let repo = repo.clone();
            let claimed = claimed.clone();
            workers.spawn(async move {
                while let Some(job) = repo.claim_next_waiting_job().await.unwrap() {
                    assert!(claimed.insert(job.id), "double-claimed job {}", job.id);
                    let applied = repo
                        .transition(job.id, JobStatus::Running, JobStatus::Done, TransitionDetail::none())
                        .await
                        .unwrap();
                    assert!(applied, "completion of job {} was lost", job.id);
                }
            });
        }
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }

        assert_eq!(claimed.len(), JOBS);
        let counts = repo.count_jobs_by_status().await.unwrap();
        assert_eq!(counts.done, JOBS as u64);
        assert_eq!(counts.waiting + counts.running, 0);
    }
}
