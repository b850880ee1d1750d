//! Prometheus metrics exposition
//!
//! The refresh loop records through the `metrics` facade (see
//! `token_refresher::observer`); this module installs the Prometheus recorder
//! that backs `/metrics` and attaches descriptions:
//!
//! - `token_refresh_total` (counter): label `is_success`
//! - `token_expiry_timestamp_seconds` (gauge)

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use token_refresher::observer::{TOKEN_EXPIRY_TIMESTAMP, TOKEN_REFRESH_TOTAL};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    describe();
    Ok(handle)
}

/// Register help text for the refresh metrics on the current recorder.
pub fn describe() {
    metrics::describe_counter!(
        TOKEN_REFRESH_TOTAL,
        "Token refresh attempts, labelled by outcome"
    );
    metrics::describe_gauge!(
        TOKEN_EXPIRY_TIMESTAMP,
        metrics::Unit::Seconds,
        "Unix time at which the held token expires"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use token_refresher::observer::record_refresh;

    #[test]
    fn describe_does_not_panic_without_recorder() {
        describe();
    }

    #[test]
    fn rendered_output_carries_help_text() {
        // build_recorder() avoids the global singleton: only one global
        // recorder can exist per process.
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        describe();
        record_refresh(true);

        let output = handle.render();
        assert!(
            output.contains("# HELP token_refresh_total Token refresh attempts"),
            "got:\n{output}"
        );
        assert!(output.contains("is_success=\"true\""), "got:\n{output}");
    }
}
