//! Host-rewriting shims for the local-development deployment topology.
//!
//! The backend hands out webhook URLs addressed to its internal hostnames;
//! these must be rewritten before a client outside the compose network can
//! reach them. Both rewrites are idempotent.

/// Rewrite the internal function-host placeholder to the local endpoint.
pub(crate) fn rewrite_functions_host(url: &str) -> String {
    match url.strip_prefix("http://functions/") {
        Some(rest) => format!("http://localhost:81/{}", rest),
        None => url.to_string(),
    }
}

/// Rewrite a local storage-emulator URL to the configured base URL, which
/// proxies blob downloads.
pub(crate) fn rewrite_storage_host(url: &str, base_url: &str) -> String {
    for prefix in ["http://localhost:10000", "https://localhost:10000"] {
        if let Some(rest) = url.strip_prefix(prefix) {
            return format!("{}{}", base_url.trim_end_matches('/'), rest);
        }
    }
    url.to_string()
}
