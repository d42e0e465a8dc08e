//! Startup checks
//!
//! Preflight checks run before the engine starts serving:
//! - the encoder runs and reports a version
//! - the media prober runs

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Prober not available: {0}")]
    ProberUnavailable(String),
}

/// Parse a `-version` banner and extract the major version number
///
/// Handles the usual release formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-3-gabcdef ..."
///
/// Git snapshot builds ("N-112233-g...") carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_part = version_output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| w.eq_ignore_ascii_case("version"))?;
        words.next()
    })?;

    let version_str = version_part.strip_prefix('n').unwrap_or(version_part);

    // Major version ends at the first '.' or '-'
    version_str.split(['.', '-']).next()?.parse().ok()
}

/// Runs `<tool> -version`, returning its stdout on success.
fn run_version(tool: &Path) -> Result<String, String> {
    let output = Command::new(tool)
        .arg("-version")
        .output()
        .map_err(|e| format!("{} -version failed: {}", tool.display(), e))?;

    if !output.status.success() {
        return Err(format!(
            "{} -version exited with {}",
            tool.display(),
            output.status
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that the encoder runs, returning its major version when reported.
pub fn check_encoder_available(encoder_path: &Path) -> Result<Option<u32>, StartupError> {
    let output = run_version(encoder_path).map_err(StartupError::EncoderUnavailable)?;
    let major = parse_ffmpeg_version(&output);
    match major {
        Some(major) => log::info!("Encoder {}: version {}", encoder_path.display(), major),
        None => log::warn!(
            "Encoder {}: could not parse version from '{}'",
            encoder_path.display(),
            output.lines().next().unwrap_or("(empty)")
        ),
    }
    Ok(major)
}

/// Check that the media prober runs.
pub fn check_prober_available(prober_path: &Path) -> Result<(), StartupError> {
    run_version(prober_path).map_err(StartupError::ProberUnavailable)?;
    Ok(())
}

/// Run all startup checks in order: encoder, then prober
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_encoder_available(&cfg.engine.encoder_path)?;
    check_prober_available(&cfg.engine.prober_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_parse_version_n_prefixed() {
        let output = "ffmpeg version n6.1-3-gabcdef Copyright (c) 2000-2023";
        assert_eq!(parse_ffmpeg_version(output), Some(6));
    }

    #[test]
    fn test_parse_version_multiline() {
        let output = r#"ffmpeg version 7.0.2-static https://johnvansickle.com/ffmpeg/
built with gcc 8 (Debian 8.3.0-6)
configuration: --enable-gpl"#;
        assert_eq!(parse_ffmpeg_version(output), Some(7));
    }

    #[test]
    fn test_parse_version_snapshot_and_invalid() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version N-112233-g0123456 Copyright"),
            None
        );
        assert_eq!(parse_ffmpeg_version("not an encoder"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_missing_tools_are_reported() {
        let missing = Path::new("/nonexistent/encoder");
        let err = check_encoder_available(missing).unwrap_err();
        assert!(matches!(err, StartupError::EncoderUnavailable(_)));
        assert!(err.to_string().contains("/nonexistent/encoder"));

        let err = check_prober_available(Path::new("/nonexistent/prober")).unwrap_err();
        assert!(matches!(err, StartupError::ProberUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_is_unavailable() {
        let err = check_prober_available(Path::new("/bin/false")).unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_startup_checks_with_fake_tools() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let encoder = dir.path().join("encoder");
        fs::write(
            &encoder,
            "#!/bin/sh\necho 'ffmpeg version n6.1-3-gabcdef Copyright (c) 2000-2023'\n",
        )
        .unwrap();
        fs::set_permissions(&encoder, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(check_encoder_available(&encoder).unwrap(), Some(6));

        let mut cfg = Config::default();
        cfg.engine.encoder_path = encoder.clone();
        cfg.engine.prober_path = encoder;
        assert!(run_startup_checks(&cfg).is_ok());

        cfg.engine.prober_path = "/bin/false".into();
        assert!(matches!(
            run_startup_checks(&cfg),
            Err(StartupError::ProberUnavailable(_))
        ));
    }
}
