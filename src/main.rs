// =============================================================================
// BLIT-PROTECTED - copy an image through protected GPU memory and back
// =============================================================================
//
// Exercises one driver capability: moving pixel data into and out of
// protected (DRM-isolated) device memory with Vulkan.
//
// FLOW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  input file -> RGBA8 pixels                                     │
// │    └── upload buffer (host-visible)                             │
// │          └── protected image (device-local, PROTECTED)          │
// │                └── readback buffer (host-visible)               │
// │                      └── output file                            │
// └─────────────────────────────────────────────────────────────────┘
//
// One command buffer, one protected submit, one fence wait.
//
// =============================================================================

mod backend;
mod blit;
mod cli;
mod config;
mod pixels;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::{Config, LoggingConfig};
use std::fs::File;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration; an explicitly named file must parse
    let (config_path, explicit) = cli.config_path();
    let (mut config, fallback) = if explicit {
        (Config::load_from_path(&config_path)?, None)
    } else {
        Config::load_or_default(&config_path)
    };
    config.apply_overrides(&cli);

    // The logger depends on the config, so anything that went wrong while
    // loading it is only logged once the logger exists
    init_logging(&config.logging, fallback.into_iter().collect());
    log::info!("Starting protected blit");
    log::info!(
        "{} -> {} (device {}, {})",
        cli.input.display(),
        cli.output.display(),
        config.device.index,
        if config.blit.protected { "protected" } else { "unprotected" }
    );

    let report = blit::run(&config, &cli.input, &cli.output)
        .with_context(|| format!("Blit of {} failed", cli.input.display()))?;

    log::info!(
        "Blitted {}x{} ({} bytes) through {} memory",
        report.width,
        report.height,
        report.bytes,
        if report.protected { "protected" } else { "unprotected" }
    );
    if let Some(diff) = report.diff {
        log::info!(
            "Verification: {} of {} pixels differ",
            diff.mismatched_pixels,
            diff.total_pixels
        );
    }

    Ok(())
}

/// Initialize logging, optionally redirected to a file, then emit the
/// warnings collected before the logger was available
fn init_logging(logging: &LoggingConfig, mut warnings: Vec<String>) {
    let mut builder = build_logger(logging, &mut warnings);
    builder.init();

    for warning in warnings {
        log::warn!("{}", warning);
    }
}

/// Configure the logger without installing it. Problems with the logging
/// config itself are pushed onto `warnings`.
fn build_logger(logging: &LoggingConfig, warnings: &mut Vec<String>) -> env_logger::Builder {
    use env_logger::{Builder, Target};

    let mut builder = Builder::from_default_env();
    let level = logging.level_filter().unwrap_or_else(|e| {
        warnings.push(e.to_string());
        log::LevelFilter::Info
    });
    builder.filter_level(level);

    if logging.log_to_file {
        match File::create(&logging.log_file) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                warnings.push(format!(
                    "Could not create log file {}: {}. Logging to stderr.",
                    logging.log_file, e
                ));
            }
        }
    }

    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_logging_config_has_nothing_to_report() {
        let mut warnings = Vec::new();
        build_logger(&LoggingConfig::default(), &mut warnings);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_level_is_reported_not_dropped() {
        let logging = LoggingConfig {
            level: "chatty".to_string(),
            ..LoggingConfig::default()
        };

        let mut warnings = vec!["Failed to load blit-protected.toml".to_string()];
        build_logger(&logging, &mut warnings);

        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("Failed to load"));
        assert!(warnings[1].contains("Unknown log level 'chatty'"));
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let logging = LoggingConfig {
            log_to_file: true,
            // A directory cannot be opened as a log file
            log_file: dir.path().to_string_lossy().into_owned(),
            ..LoggingConfig::default()
        };

        let mut warnings = Vec::new();
        build_logger(&logging, &mut warnings);

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Could not create log file"));
    }

    #[test]
    fn log_file_target_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let logging = LoggingConfig {
            log_to_file: true,
            log_file: path.to_string_lossy().into_owned(),
            ..LoggingConfig::default()
        };

        let mut warnings = Vec::new();
        build_logger(&logging, &mut warnings);

        assert!(warnings.is_empty());
        assert!(path.exists());
    }
}
