pub mod archival_tier;
pub mod bulk_processor;
pub mod cache_version;
pub mod engine;
pub mod file_access;
pub mod file_registry;
pub mod kv_store;
pub mod lifecycle_jobs;
pub mod local_object_storage;
pub mod object_keys;
pub mod object_storage;
pub mod quota_gate;
pub mod retry;
pub mod storage_tracking;
pub mod sweeper;
pub mod upload_orchestrator;
