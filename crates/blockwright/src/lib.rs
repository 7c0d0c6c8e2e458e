//! Blockwright: blueprint execution against a remote block world.
//!
//! Re-exports the engine and protocol crates under one name, plus the types
//! most callers need to start a build.

pub use blockwright_engine as engine;
pub use blockwright_protocol as protocol;

pub use blockwright_engine::{
    BuildConfig, BuildError, Builder, CheckpointStore, SandboxWorld, WorldAdapter,
};
pub use blockwright_protocol::{Blueprint, BuildReport, Step, StepOp, Vec3};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blueprint_parses_through_the_umbrella() {
        let bp: Blueprint = serde_json::from_str(
            r#"{"size": {"width": 1, "height": 1, "depth": 1},
                "steps": [{"op": "set", "pos": {"x": 0, "y": 0, "z": 0}, "block": "stone"}]}"#,
        )
        .unwrap();
        assert_eq!(bp.steps.len(), 1);
        assert!(matches!(bp.steps[0].op, StepOp::Set { .. }));
    }
}
