use blockwright_protocol::Vec3;

/// How the dispatch layer may react to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The step's fallback (if any) can stand in for it.
    Recoverable,
    /// Aborts the run.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a build is already running")]
    ConcurrencyConflict,

    #[error("bulk `{command}` failed: {reason}")]
    BulkCommand { command: String, reason: String },

    #[error("actor did not move toward {target} before the bulk command")]
    MoveConvergence { target: Vec3 },

    #[error("build needs {total} blocks, limit is {limit}")]
    ResourceLimit { total: u64, limit: u64 },

    #[error("nothing to undo")]
    NoUndoAvailable,

    #[error("actor disconnected")]
    ActorDisconnected,

    #[error("step `{op}`: {reason}")]
    Generator { op: String, reason: String },

    #[error("no checkpoint for run {0}")]
    UnknownRun(String),

    #[error("run {0} is not resumable")]
    NotResumable(String),

    #[error("world adapter: {0:#}")]
    World(#[source] anyhow::Error),

    #[error("checkpoint store: {0:#}")]
    Checkpoint(#[source] anyhow::Error),
}

impl BuildError {
    pub fn severity(&self) -> Severity {
        match self {
            BuildError::BulkCommand { .. } | BuildError::MoveConvergence { .. } => {
                Severity::Recoverable
            }
            _ => Severity::Fatal,
        }
    }

    /// Short machine-readable tag, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::ConcurrencyConflict => "concurrency_conflict",
            BuildError::BulkCommand { .. } => "bulk_command_failure",
            BuildError::MoveConvergence { .. } => "move_convergence_failure",
            BuildError::ResourceLimit { .. } => "resource_limit_exceeded",
            BuildError::NoUndoAvailable => "no_undo_available",
            BuildError::ActorDisconnected => "actor_disconnected",
            BuildError::Generator { .. } => "generator",
            BuildError::UnknownRun(_) => "unknown_run",
            BuildError::NotResumable(_) => "not_resumable",
            BuildError::World(_) => "world",
            BuildError::Checkpoint(_) => "checkpoint",
        }
    }

    pub(crate) fn bulk(command: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BuildError::BulkCommand {
            command: command.into(),
            reason: err.to_string(),
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_bulk_and_move_failures_are_recoverable() {
        assert_eq!(BuildError::bulk("fill", "denied").severity(), Severity::Recoverable);
        assert_eq!(
            BuildError::MoveConvergence { target: Vec3::ZERO }.severity(),
            Severity::Recoverable
        );
        assert_eq!(BuildError::ConcurrencyConflict.severity(), Severity::Fatal);
        assert_eq!(
            BuildError::ResourceLimit { total: 2, limit: 1 }.severity(),
            Severity::Fatal
        );
        assert_eq!(
            BuildError::World(anyhow::anyhow!("closed")).severity(),
            Severity::Fatal
        );
    }
}
