//! MongoDB-backed ledger implementation.
//!
//! Every coordination primitive maps to a single server-side atomic
//! operation:
//!
//! - Acquisition is `findOneAndUpdate` with a `createdAt` sort and the
//!   post-image returned, so two concurrent claimers see at most one success
//! - Version-guarded updates filter on `(taskId, version)` and `$inc` the
//!   version in the same write
//! - Requeue is a filtered update that clears all four ownership fields
//!
//! Driver errors are translated to
//! [`Error::DatabaseOperation`](crate::error::Error::DatabaseOperation);
//! callers never see driver types.

use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, instrument};

use super::Ledger;
use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::schema::fields;
use crate::task::{Task, TaskStatus};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// MongoDB-backed ledger.
///
/// Construct with [`MongoLedger::connect`], then call
/// [`initialize`](Ledger::initialize) once before use.
#[derive(Debug, Clone)]
pub struct MongoLedger {
    database: Database,
    collection: Collection<Task>,
    stale_task_timeout: Duration,
}

impl MongoLedger {
    /// Parses the connection string and binds to the configured collection.
    ///
    /// The client connects lazily; [`initialize`](Ledger::initialize)
    /// performs the first round-trip.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Initialization`] when the connection string does not
    /// parse.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.connection_string)
            .await
            .map_err(|err| {
                Error::initialization_with_source("invalid connection string", err)
            })?;
        options.connect_timeout = Some(config.connect_timeout);
        options.server_selection_timeout = Some(config.connect_timeout);

        let client = Client::with_options(options)
            .map_err(|err| Error::initialization_with_source("client construction failed", err))?;
        let database = client.database(&config.database_name);
        let collection = database.collection::<Task>(&config.collection_name);

        Ok(Self {
            database,
            collection,
            stale_task_timeout: config.stale_task_timeout,
        })
    }

    fn status_update(new_status: TaskStatus, error_message: Option<&str>) -> Document {
        let now = bson::DateTime::now();
        let mut set = doc! {
            fields::STATUS: new_status.name(),
            fields::UPDATED_AT: now,
        };
        if let Some(witness) = new_status.witness() {
            set.insert(witness.field(), now);
        }
        if let Some(message) = error_message {
            set.insert(fields::ERROR_MESSAGE, message);
        }
        doc! {
            "$set": set,
            "$inc": { fields::VERSION: 1_i64 },
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        &*err.kind,
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE
    )
}

fn map_db_err(operation: &'static str) -> impl FnOnce(mongodb::error::Error) -> Error {
    move |err| Error::database_with_source(format!("{operation} failed"), err)
}

fn cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|threshold| now.checked_sub_signed(threshold))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl Ledger for MongoLedger {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { fields::TASK_ID: 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();

        self.collection
            .create_index(index)
            .await
            .map_err(|err| {
                Error::initialization_with_source("unique taskId index creation failed", err)
            })?;

        debug!(collection = %self.collection.name(), "ledger initialized");
        Ok(())
    }

    async fn upsert_task(&self, task: &Task) -> Result<Task> {
        let mut task = task.clone();
        let now = Utc::now();
        if task.id.is_empty() {
            task.id = Task::generate_id();
            task.created_at = now;
        }
        task.updated_at = now;

        let result = self
            .collection
            .replace_one(doc! { fields::TASK_ID: &task.task_id }, &task)
            .upsert(true)
            .await;

        match result {
            Ok(_) => Ok(task),
            Err(err) if is_duplicate_key(&err) => Err(Error::DuplicateKey {
                task_id: task.task_id,
            }),
            Err(err) => Err(map_db_err("upsert")(err)),
        }
    }

    async fn get_by_task_id(&self, task_id: &str) -> Result<Option<Task>> {
        self.collection
            .find_one(doc! { fields::TASK_ID: task_id })
            .await
            .map_err(map_db_err("lookup"))
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn try_acquire_task(
        &self,
        from: TaskStatus,
        to: TaskStatus,
        worker_id: &str,
        heartbeat_now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let now = Utc::now();
        let stale_cutoff = cutoff(now, self.stale_task_timeout);

        let filter = doc! {
            fields::STATUS: from.name(),
            "$or": [
                { fields::WORKER_POD_ID: Bson::Null },
                { fields::LAST_HEARTBEAT: { "$lt": bson::DateTime::from_chrono(stale_cutoff) } },
            ],
        };
        let update = doc! {
            "$set": {
                fields::STATUS: to.name(),
                fields::WORKER_POD_ID: worker_id,
                fields::LAST_HEARTBEAT: bson::DateTime::from_chrono(heartbeat_now),
                fields::LOCKED_AT: bson::DateTime::from_chrono(now),
                fields::UPDATED_AT: bson::DateTime::from_chrono(now),
            },
            "$inc": { fields::VERSION: 1_i64 },
        };

        self.collection
            .find_one_and_update(filter, update)
            .sort(doc! { fields::CREATED_AT: 1 })
            .return_document(ReturnDocument::After)
            .await
            .map_err(map_db_err("acquire"))
    }

    async fn update_status_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
    ) -> Result<bool> {
        let filter = doc! {
            fields::TASK_ID: task_id,
            fields::VERSION: expected_version,
        };
        let update = Self::status_update(new_status, None);

        let result = self
            .collection
            .update_one(filter, update)
            .await
            .map_err(map_db_err("status update"))?;
        Ok(result.modified_count == 1)
    }

    async fn update_status_and_error_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let filter = doc! {
            fields::TASK_ID: task_id,
            fields::VERSION: expected_version,
        };
        let update = Self::status_update(new_status, error_message);

        let result = self
            .collection
            .update_one(filter, update)
            .await
            .map_err(map_db_err("status update"))?;
        Ok(result.modified_count == 1)
    }

    async fn update_heartbeat_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        worker_id: &str,
        heartbeat: DateTime<Utc>,
    ) -> Result<bool> {
        let filter = doc! {
            fields::TASK_ID: task_id,
            fields::VERSION: expected_version,
            fields::WORKER_POD_ID: worker_id,
        };
        let update = doc! {
            "$set": {
                fields::LAST_HEARTBEAT: bson::DateTime::from_chrono(heartbeat),
                fields::UPDATED_AT: bson::DateTime::now(),
            },
            "$inc": { fields::VERSION: 1_i64 },
        };

        let result = self
            .collection
            .update_one(filter, update)
            .await
            .map_err(map_db_err("heartbeat update"))?;
        Ok(result.modified_count == 1)
    }

    async fn record_retry_if_version_matches(
        &self,
        task_id: &str,
        expected_version: i64,
        new_status: TaskStatus,
        reason: &str,
    ) -> Result<bool> {
        let now = bson::DateTime::now();
        let filter = doc! {
            fields::TASK_ID: task_id,
            fields::VERSION: expected_version,
        };
        let mut set = doc! {
            fields::STATUS: new_status.name(),
            fields::ERROR_MESSAGE: reason,
            fields::UPDATED_AT: now,
        };
        if let Some(witness) = new_status.witness() {
            set.insert(witness.field(), now);
        }
        let update = doc! {
            "$set": set,
            "$inc": { fields::VERSION: 1_i64, fields::RETRY_COUNT: 1_i32 },
        };

        let result = self
            .collection
            .update_one(filter, update)
            .await
            .map_err(map_db_err("retry update"))?;
        Ok(result.modified_count == 1)
    }

    async fn get_stalled_tasks(
        &self,
        threshold: Duration,
        self_worker_id: &str,
    ) -> Result<Vec<Task>> {
        let now = Utc::now();
        let self_cutoff = bson::DateTime::from_chrono(cutoff(now, threshold));
        let foreign_cutoff = bson::DateTime::from_chrono(cutoff(now, threshold.saturating_mul(2)));

        let filter = doc! {
            fields::STATUS: TaskStatus::Running.name(),
            "$or": [
                {
                    fields::WORKER_POD_ID: self_worker_id,
                    fields::LAST_HEARTBEAT: { "$lt": self_cutoff },
                },
                {
                    fields::WORKER_POD_ID: { "$ne": self_worker_id },
                    fields::LAST_HEARTBEAT: { "$lt": foreign_cutoff },
                },
            ],
        };

        let cursor = self
            .collection
            .find(filter)
            .sort(doc! { fields::LAST_HEARTBEAT: 1 })
            .await
            .map_err(map_db_err("stalled-task query"))?;

        cursor
            .try_collect()
            .await
            .map_err(map_db_err("stalled-task cursor"))
    }

    #[instrument(skip(self))]
    async fn requeue_task(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        reason: &str,
    ) -> Result<bool> {
        let filter = doc! {
            fields::TASK_ID: task_id,
            fields::STATUS: TaskStatus::Running.name(),
        };
        let update = doc! {
            "$set": {
                fields::STATUS: new_status.name(),
                fields::ERROR_MESSAGE: reason,
                fields::WORKER_POD_ID: Bson::Null,
                fields::WORKER_NODE_ID: Bson::Null,
                fields::LAST_HEARTBEAT: Bson::Null,
                fields::LOCKED_AT: Bson::Null,
                fields::UPDATED_AT: bson::DateTime::now(),
            },
            "$inc": { fields::VERSION: 1_i64 },
        };

        let result = self
            .collection
            .update_one(filter, update)
            .await
            .map_err(map_db_err("requeue"))?;
        Ok(result.modified_count == 1)
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|err| Error::DatabaseUnavailable {
                message: "ping failed".to_string(),
                source: Some(Box::new(err)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_update_stamps_witness_field() {
        let update = MongoLedger::status_update(TaskStatus::Succeeded, None);
        let set = update.get_document("$set").expect("$set");
        assert!(set.contains_key(fields::COMPLETED_AT));
        assert_eq!(set.get_str(fields::STATUS).expect("status"), "Succeeded");
        assert_eq!(
            update.get_document("$inc").expect("$inc").get_i64(fields::VERSION),
            Ok(1)
        );
    }

    #[test]
    fn status_update_without_witness_leaves_timestamps_alone() {
        let update = MongoLedger::status_update(TaskStatus::Queued, Some("Retry attempt 1/3"));
        let set = update.get_document("$set").expect("$set");
        assert!(!set.contains_key(fields::COMPLETED_AT));
        assert!(!set.contains_key(fields::FAILED_AT));
        assert_eq!(
            set.get_str(fields::ERROR_MESSAGE).expect("error"),
            "Retry attempt 1/3"
        );
    }
}
