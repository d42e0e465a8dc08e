//! Encoder invocation: command construction, progress parsing and process
//! supervision for a single acceleration tier.

pub mod command;
pub mod progress;
pub mod supervisor;

pub use command::{
    build_command, command_line, hardware_encoder, parse_bitrate, parse_scale, software_encoder,
    validate_preset, BuildError, EncodeSettings, Resolution, Tier,
};
pub use progress::{parse_duration_banner, parse_progress_line, parse_timestamp, ProgressField};
pub use supervisor::{
    hw_error_signature, AttemptExit, AttemptResult, ProcessSupervisor, SupervisionState,
    SupervisorError, SupervisorSettings, HW_ERROR_SIGNATURES,
};
