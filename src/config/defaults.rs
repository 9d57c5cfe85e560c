use std::path::PathBuf;

pub(super) const MIN_SCAN_INTERVAL_SECS: u64 = 1;

pub(super) fn clamp_scan_interval(value: u64) -> u64 {
    value.max(MIN_SCAN_INTERVAL_SECS)
}

pub(super) fn default_base_dir() -> PathBuf {
    PathBuf::from("/lagopus")
}

pub(super) fn default_jobs_dir() -> PathBuf {
    PathBuf::from("/lagopus/jobs")
}

pub(super) fn default_store_path() -> PathBuf {
    PathBuf::from("/lagopus/lagopus.db")
}

pub(super) fn default_api_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

pub(super) fn default_namespace() -> String {
    "default".to_string()
}

pub(super) fn default_token_path() -> Option<PathBuf> {
    Some(PathBuf::from(
        "/var/run/secrets/kubernetes.io/serviceaccount/token",
    ))
}

pub(super) fn default_image() -> String {
    "lagopus-fuzzer:latest".to_string()
}

pub(super) fn default_jobs_claim() -> String {
    "lagopus-jobs".to_string()
}

pub(super) fn default_request_attempts() -> usize {
    3
}

pub(super) fn default_cpus() -> u32 {
    2
}

pub(super) fn default_memory_mib() -> u32 {
    200
}

pub(super) fn default_deadline_secs() -> u64 {
    240
}

pub(super) fn default_scan_interval_secs() -> u64 {
    15
}

pub(super) fn default_connect_retry_secs() -> u64 {
    5
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}
