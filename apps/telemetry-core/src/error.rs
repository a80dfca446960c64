use thiserror::Error;

/// Reason tags attached to decode failures. The consumer uses them to pick
/// a disposition: empty payloads are acknowledged and counted at intake,
/// the rest are dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeReason {
    UnknownToken,
    ShapeMismatch,
    EmptyPayload,
    MissingIdentity,
    BadTimestamp,
}

impl DecodeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeReason::UnknownToken => "unknown_token",
            DecodeReason::ShapeMismatch => "shape_mismatch",
            DecodeReason::EmptyPayload => "empty_payload",
            DecodeReason::MissingIdentity => "missing_identity",
            DecodeReason::BadTimestamp => "bad_timestamp",
        }
    }
}

#[derive(Debug, Error)]
#[error("decode failed ({}): {detail}", reason.as_str())]
pub struct DecodeError {
    pub reason: DecodeReason,
    pub detail: String,
}

impl DecodeError {
    pub fn new(reason: DecodeReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Errors on the ingest path, carried as values so callers can distinguish
/// ack-and-drop from nack-and-redeliver from dead-letter.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// `(sensor_id, time)` collision. Recovered locally and counted.
    #[error("duplicate reading for {sensor_id} at {time}")]
    Duplicate { sensor_id: String, time: String },
    /// Bus/store connectivity or deadline; the message must be redelivered.
    #[error("transient i/o: {0}")]
    TransientIo(String),
    /// Schema drift or unrecoverable configuration; fail fast.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// What the consumer should do with the message that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete from the bus; the work is done or will never succeed cheaply.
    Ack,
    /// Leave on the bus; the visibility timeout will redeliver.
    Nack,
    /// Move to the dead-letter stream with the given reason tag.
    DeadLetter(DecodeReason),
}

impl IngestError {
    pub fn disposition(&self) -> Disposition {
        match self {
            IngestError::Decode(err) => match err.reason {
                DecodeReason::EmptyPayload => Disposition::Ack,
                reason => Disposition::DeadLetter(reason),
            },
            IngestError::Duplicate { .. } => Disposition::Ack,
            IngestError::TransientIo(_) => Disposition::Nack,
            // A fatal error aborts the worker; the message stays visible.
            IngestError::Fatal(_) => Disposition::Nack,
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => IngestError::TransientIo(err.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                IngestError::Duplicate {
                    sensor_id: String::new(),
                    time: String::new(),
                }
            }
            _ => IngestError::TransientIo(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_acked_not_dead_lettered() {
        let err = IngestError::Decode(DecodeError::new(DecodeReason::EmptyPayload, "no body"));
        assert_eq!(err.disposition(), Disposition::Ack);
    }

    #[test]
    fn shape_mismatch_goes_to_the_dead_letter_stream() {
        let err = IngestError::Decode(DecodeError::new(DecodeReason::ShapeMismatch, "bad json"));
        assert_eq!(
            err.disposition(),
            Disposition::DeadLetter(DecodeReason::ShapeMismatch)
        );
    }

    #[test]
    fn duplicates_are_recovered_locally() {
        let err = IngestError::Duplicate {
            sensor_id: "WL-1A2B3C4D5E6F".to_string(),
            time: "2025-06-02T07:55:46.551Z".to_string(),
        };
        assert_eq!(err.disposition(), Disposition::Ack);
    }

    #[test]
    fn transient_io_is_nacked_for_redelivery() {
        let err = IngestError::TransientIo("connection reset".to_string());
        assert_eq!(err.disposition(), Disposition::Nack);
    }
}
