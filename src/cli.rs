// Command-line arguments

use clap::Parser;
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Debug, Parser)]
#[command(
    name = "blit-protected",
    about = "Copy an image through protected GPU memory and back out to a file"
)]
pub struct Cli {
    /// Image to upload (PNG or PNM).
    pub input: PathBuf,

    /// Where to write the read-back image. Format follows the extension.
    pub output: PathBuf,

    /// TOML config file.
    ///
    /// A missing file means defaults. When given explicitly, a malformed file is an error.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Physical device index (overrides `device.index`).
    #[arg(long)]
    pub device: Option<usize>,

    /// Enable the Khronos validation layer.
    #[arg(long)]
    pub validation: bool,

    /// Blit through an ordinary device-local image instead of protected memory.
    #[arg(long)]
    pub unprotected: bool,

    /// Skip comparing the read-back pixels against the input.
    #[arg(long)]
    pub no_verify: bool,
}

impl Cli {
    /// Config path to load, and whether the user asked for it explicitly
    pub fn config_path(&self) -> (PathBuf, bool) {
        match &self.config {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_input_and_output() {
        assert!(Cli::try_parse_from(["blit-protected"]).is_err());
        assert!(Cli::try_parse_from(["blit-protected", "in.png"]).is_err());

        let cli = Cli::try_parse_from(["blit-protected", "in.png", "out.png"]).unwrap();
        assert_eq!(cli.input, PathBuf::from("in.png"));
        assert_eq!(cli.output, PathBuf::from("out.png"));
        assert!(!cli.unprotected);
    }

    #[test]
    fn config_path_defaults_to_working_directory() {
        let cli = Cli::parse_from(["blit-protected", "a.png", "b.png"]);
        assert_eq!(cli.config_path(), (PathBuf::from(DEFAULT_CONFIG_PATH), false));

        let cli = Cli::parse_from(["blit-protected", "-c", "x.toml", "a.png", "b.png"]);
        assert_eq!(cli.config_path(), (PathBuf::from("x.toml"), true));
    }
}
