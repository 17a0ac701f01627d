use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "slipcheck")]
#[command(about = "Verify payment slips against expected transaction ids and amounts")]
pub struct Cli {
    /// Config file; falls back to the platform config dir.
    #[arg(long, global = true, env = "SLIPCHECK_CONFIG")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Verify one or more slips and print their rows.
    Verify(VerifyArgs),
    /// Verify every slip dropped into a folder until interrupted.
    Watch { dir: PathBuf },
    /// Print the stored row for a job.
    Status { id: String },
}

/// Expectations pair with files by position. Give none, or exactly one per
/// file; `-` leaves that file without an expectation.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    #[arg(long = "expect-id", value_name = "ID")]
    pub expect_ids: Vec<String>,
    #[arg(long = "expect-amount", value_name = "AMOUNT")]
    pub expect_amounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlipArg {
    pub path: PathBuf,
    pub expect_id: Option<String>,
    pub expect_amount: Option<String>,
}

impl SlipArg {
    pub fn bare(path: PathBuf) -> Self {
        Self { path, expect_id: None, expect_amount: None }
    }
}

impl VerifyArgs {
    pub fn slips(&self) -> Result<Vec<SlipArg>> {
        let ids = paired("--expect-id", &self.expect_ids, self.files.len())?;
        let amounts = paired("--expect-amount", &self.expect_amounts, self.files.len())?;
        Ok(self
            .files
            .iter()
            .zip(ids)
            .zip(amounts)
            .map(|((path, expect_id), expect_amount)| SlipArg {
                path: path.clone(),
                expect_id,
                expect_amount,
            })
            .collect())
    }
}

fn paired(flag: &str, values: &[String], files: usize) -> Result<Vec<Option<String>>> {
    if values.is_empty() {
        return Ok(vec![None; files]);
    }
    if values.len() != files {
        bail!("{flag} given {} times for {files} files; pass it once per file or not at all", values.len());
    }
    Ok(values
        .iter()
        .map(|v| (v != "-").then(|| v.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("slipcheck").chain(args.iter().copied()))
    }

    fn verify_args(args: &[&str]) -> VerifyArgs {
        match parse(args).unwrap().command {
            Command::Verify(v) => v,
            other => panic!("expected verify, got {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn expectations_pair_with_files_by_position() {
        let v = verify_args(&[
            "verify", "a.jpg", "b.pdf",
            "--expect-id", "TXN1", "--expect-id", "-",
            "--expect-amount", "-", "--expect-amount", "10.00",
        ]);
        let slips = v.slips().unwrap();
        assert_eq!(slips.len(), 2);
        assert_eq!(slips[0].expect_id.as_deref(), Some("TXN1"));
        assert_eq!(slips[0].expect_amount, None);
        assert_eq!(slips[1].path, PathBuf::from("b.pdf"));
        assert_eq!(slips[1].expect_id, None);
        assert_eq!(slips[1].expect_amount.as_deref(), Some("10.00"));
    }

    #[test]
    fn files_without_expectations() {
        let slips = verify_args(&["verify", "a.jpg", "b.png"]).slips().unwrap();
        assert_eq!(slips, vec![SlipArg::bare("a.jpg".into()), SlipArg::bare("b.png".into())]);
    }

    #[test]
    fn mismatched_expectation_count_is_rejected() {
        let v = verify_args(&["verify", "a.jpg", "b.png", "--expect-id", "TXN1"]);
        let err = v.slips().unwrap_err().to_string();
        assert!(err.contains("--expect-id"), "{err}");
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = parse(&["watch", "/srv/inbox", "--config", "/etc/slipcheck.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/slipcheck.toml")));
        assert!(matches!(cli.command, Command::Watch { dir } if dir == PathBuf::from("/srv/inbox")));
    }

    #[test]
    fn status_takes_an_id() {
        let cli = parse(&["status", "abc"]).unwrap();
        assert!(matches!(cli.command, Command::Status { id } if id == "abc"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["verify"]).is_err());
        assert!(parse(&["verify", "a.jpg", "--expect-id"]).is_err());
        assert!(parse(&["verify", "a.jpg", "--bogus"]).is_err());
        assert!(parse(&["status"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }
}
