//! Restart classification of observed exit codes

use crate::types::DesiredState;

/// Exit codes that always mean the job failed
pub const BAD_EXIT_CODES: [i64; 2] = [1, 255];

/// Exit codes that mean the job is fine (137 is a live container)
pub const OK_EXIT_CODES: [i64; 2] = [0, 137];

/// Exit code recorded when the job's container does not exist
pub const NOT_FOUND_EXIT_CODE: i64 = 1;

/// A job that should be running needs a restart unless its exit code is known-good
pub fn needs_restart(expected: DesiredState, actual: i64) -> bool {
    expected == DesiredState::Running
        && (BAD_EXIT_CODES.contains(&actual) || !OK_EXIT_CODES.contains(&actual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use DesiredState::{Running, Stoppable};

    #[test]
    fn test_truth_table() {
        assert!(needs_restart(Running, 1));
        assert!(needs_restart(Running, 255));
        assert!(!needs_restart(Running, 137));
        assert!(!needs_restart(Running, 0));
        assert!(!needs_restart(Stoppable, 1));
        assert!(needs_restart(Running, 42));
    }

    #[test]
    fn test_stoppable_never_restarts() {
        for code in [-1, 0, 1, 2, 137, 139, 255] {
            assert!(!needs_restart(Stoppable, code));
        }
    }

    #[test]
    fn test_not_found_code_is_bad() {
        assert!(needs_restart(Running, NOT_FOUND_EXIT_CODE));
    }
}
