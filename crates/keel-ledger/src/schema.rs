//! Persisted schema for the `tasks` collection.
//!
//! The field names below are the on-wire names; every query builder in the
//! repository goes through these constants so the document layout is defined
//! in exactly one place. Timestamps are stored as BSON datetimes so range
//! filters (`$lt` on heartbeats) compare correctly server-side.

/// On-wire field names for task documents.
pub mod fields {
    /// Storage primary key (24-hex object id).
    pub const ID: &str = "_id";
    /// Business key; carries the unique index.
    pub const TASK_ID: &str = "taskId";
    /// Opaque payload.
    pub const BODY: &str = "body";
    /// Status name (PascalCase).
    pub const STATUS: &str = "status";
    /// Optimistic-concurrency token.
    pub const VERSION: &str = "version";
    /// Attempts consumed.
    pub const RETRY_COUNT: &str = "retryCount";
    /// Identity of the worker holding the task.
    pub const WORKER_POD_ID: &str = "workerPodId";
    /// Node hosting that worker.
    pub const WORKER_NODE_ID: &str = "workerNodeId";
    /// Liveness beacon.
    pub const LAST_HEARTBEAT: &str = "lastHeartbeat";
    /// When the current holder acquired the task.
    pub const LOCKED_AT: &str = "lockedAt";
    /// Insertion time.
    pub const CREATED_AT: &str = "createdAt";
    /// Last write time.
    pub const UPDATED_AT: &str = "updatedAt";
    /// Witness for entering Processing.
    pub const PROCESSED_AT: &str = "processedAt";
    /// Witness for entering Completed/Succeeded.
    pub const COMPLETED_AT: &str = "completedAt";
    /// Witness for entering Failed/Error.
    pub const FAILED_AT: &str = "failedAt";
    /// Last failure reason.
    pub const ERROR_MESSAGE: &str = "errorMessage";
    /// Free-form annotations.
    pub const METADATA: &str = "metadata";
}

/// Serde adapter storing `DateTime<Utc>` as a BSON datetime.
pub mod bson_datetime {
    use bson::DateTime as BsonDateTime;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serializes a chrono datetime as a BSON datetime.
    ///
    /// # Errors
    ///
    /// Returns any error produced by the underlying serializer.
    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BsonDateTime::from_chrono(*value).serialize(serializer)
    }

    /// Deserializes a BSON datetime into a chrono datetime.
    ///
    /// # Errors
    ///
    /// Returns any error produced by the underlying deserializer.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(BsonDateTime::deserialize(deserializer)?.to_chrono())
    }
}

/// Serde adapter storing `Option<DateTime<Utc>>` as a nullable BSON datetime.
///
/// `None` is stored as an explicit null so ownership-clearing writes leave
/// the field present and filterable.
pub mod optional_bson_datetime {
    use bson::DateTime as BsonDateTime;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serializes an optional chrono datetime as a nullable BSON datetime.
    ///
    /// # Errors
    ///
    /// Returns any error produced by the underlying serializer.
    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value
            .map(BsonDateTime::from_chrono)
            .serialize(serializer)
    }

    /// Deserializes a nullable BSON datetime into an optional chrono datetime.
    ///
    /// # Errors
    ///
    /// Returns any error produced by the underlying deserializer.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<BsonDateTime>::deserialize(deserializer)?.map(BsonDateTime::to_chrono))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "bson_datetime")]
        at: chrono::DateTime<Utc>,
        #[serde(with = "optional_bson_datetime")]
        maybe: Option<chrono::DateTime<Utc>>,
    }

    #[test]
    fn datetimes_round_trip_through_bson() {
        let probe = Probe {
            at: Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap(),
            maybe: Some(Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap()),
        };

        let doc = bson::to_document(&probe).expect("to_document");
        assert!(matches!(doc.get("at"), Some(bson::Bson::DateTime(_))));

        let parsed: Probe = bson::from_document(doc).expect("from_document");
        assert_eq!(parsed, probe);
    }

    #[test]
    fn none_is_stored_as_null() {
        let probe = Probe {
            at: Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap(),
            maybe: None,
        };

        let doc = bson::to_document(&probe).expect("to_document");
        assert_eq!(doc.get("maybe"), Some(&bson::Bson::Null));

        let parsed: Probe = bson::from_document(doc).expect("from_document");
        assert_eq!(parsed.maybe, None);
    }
}
