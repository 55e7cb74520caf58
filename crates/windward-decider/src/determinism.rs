//! Deterministic random sources.
//!
//! Both are pure functions of the run id and a replayed counter, so the
//! n-th observation is identical on every replay of the same history.

use uuid::Uuid;

/// `UUIDv5(ns, "<run_id>:<counter>")`.
pub fn deterministic_uuid(run_id: &str, counter: u32) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{run_id}:{counter}").as_bytes(),
    )
}

/// Low 64 bits of a UUID, used to seed workflow-visible PRNGs.
pub fn uuid_seed(uuid: &Uuid) -> u64 {
    (uuid.as_u128() & u64::MAX as u128) as u64
}
