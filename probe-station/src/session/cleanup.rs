//! Forced teardown of a probe's session processes.

use crate::{
    config::Mode,
    environment::ExecutionEnvironment,
    tracing::prelude::*,
};

use super::ProcessSignature;

/// Kill everything belonging to sessions of `modes` in one environment.
///
/// Best effort and idempotent: a pattern that matches nothing is fine, and a
/// failing kill is logged and skipped so the remaining patterns still run.
/// Returns the number of kill calls that failed.
pub async fn force_cleanup(
    env: &dyn ExecutionEnvironment,
    environment: &str,
    signature: &ProcessSignature,
    modes: &[Mode],
) -> usize {
    let mut failures = 0;
    for pattern in signature.cleanup_patterns(modes) {
        match env.kill_matching(environment, &pattern).await {
            Ok(()) => trace!(environment, pattern = %pattern, "Killed matching processes"),
            Err(e) => {
                failures += 1;
                warn!(environment, pattern = %pattern, error = %e, "Cleanup kill failed");
            }
        }
    }
    failures
}
