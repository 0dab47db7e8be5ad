use clap::{ArgGroup, Parser};
use std::path::PathBuf;

/// TVHeadend post-processor: `pvr-transfer -f %f -e %e`
#[derive(Parser, Debug)]
#[command(name = "pvr-transfer", version, about = "Move finished TVHeadend recordings to a network share")]
#[command(group(ArgGroup::new("mode").args(["file", "process", "test", "check"])))]
pub struct Cli {
    /// Finished recording to transfer
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// TVHeadend status for the recording ("OK" or an error message)
    #[arg(short = 'e', long = "event", requires = "file")]
    pub event: Option<String>,

    /// Subfolder of the share to place recordings in
    #[arg(short = 'd', long = "subfolder", conflicts_with_all = ["test", "check"])]
    pub subfolder: Option<String>,

    /// Transfer any finished recordings still on local storage
    #[arg(short = 'p', long = "process")]
    pub process: bool,

    /// Run every check, a dry-run transfer and send a test email
    #[arg(short = 't', long = "test")]
    pub test: bool,

    /// Check free space and the TVHeadend service; email only on failure
    #[arg(short = 'c', long = "check")]
    pub check: bool,

    /// Configuration file (default: ~/.config/pvr-transfer/config.json)
    #[arg(long, env = "PVR_TRANSFER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Append log output to this file as well as stderr
    #[arg(long, env = "PVR_TRANSFER_LOG")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Transfer {
        file: PathBuf,
        event: Option<String>,
        subfolder: Option<String>,
    },
    Process {
        subfolder: Option<String>,
    },
    Test,
    Check,
}

impl Cli {
    /// Without any mode flag the backlog is processed, as a cron job would want
    pub fn mode(&self) -> Mode {
        if let Some(file) = &self.file {
            Mode::Transfer {
                file: file.clone(),
                event: self.event.clone(),
                subfolder: self.subfolder.clone(),
            }
        } else if self.test {
            Mode::Test
        } else if self.check {
            Mode::Check
        } else {
            Mode::Process {
                subfolder: self.subfolder.clone(),
            }
        }
    }
}
