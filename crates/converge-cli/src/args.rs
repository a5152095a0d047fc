//! Command line arguments

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use converge_kernel::StageId;
use std::path::PathBuf;

/// Parsed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CliArgs {
    pub(crate) config: PathBuf,
    pub(crate) dry_run: bool,
    pub(crate) validate_only: bool,
    pub(crate) verbose: bool,
    pub(crate) resume_from: Option<StageId>,
    pub(crate) force_continue: bool,
    pub(crate) wait_ready: bool,
    pub(crate) report: Option<PathBuf>,
}

fn parse_stage(text: &str) -> Result<StageId, String> {
    text.parse::<StageId>().map_err(|e| e.to_string())
}

pub(crate) fn command() -> Command {
    Command::new("converge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bring a local development environment to its desired state; safe to re-run")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .default_value("converge.yaml")
                .value_parser(value_parser!(PathBuf))
                .help("Settings file"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .conflicts_with("validate-only")
                .help("Evaluate every stage and print what would change without changing it"),
        )
        .arg(
            Arg::new("validate-only")
                .long("validate-only")
                .action(ArgAction::SetTrue)
                .help("Only check prerequisites and workspace structure"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Debug logging"),
        )
        .arg(
            Arg::new("resume-from")
                .long("resume-from")
                .value_name("STAGE")
                .value_parser(parse_stage)
                .help("Start at this stage, e.g. converge-database"),
        )
        .arg(
            Arg::new("force-continue")
                .long("force-continue")
                .action(ArgAction::SetTrue)
                .help("Keep going after a failed stage"),
        )
        .arg(
            Arg::new("wait-ready")
                .long("wait-ready")
                .action(ArgAction::SetTrue)
                .help("After a successful run, wait for the application to report ready"),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Write a JSON run report"),
        )
}

impl CliArgs {
    pub(crate) fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("converge.yaml")),
            dry_run: matches.get_flag("dry-run"),
            validate_only: matches.get_flag("validate-only"),
            verbose: matches.get_flag("verbose"),
            resume_from: matches.get_one::<StageId>("resume-from").copied(),
            force_continue: matches.get_flag("force-continue"),
            wait_ready: matches.get_flag("wait-ready"),
            report: matches.get_one::<PathBuf>("report").cloned(),
        }
    }

    /// Parse the process arguments, exiting with usage on error
    pub(crate) fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<CliArgs, clap::Error> {
        let argv = std::iter::once("converge").chain(args.iter().copied());
        command().try_get_matches_from(argv).map(|m| CliArgs::from_matches(&m))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(
            args,
            CliArgs {
                config: PathBuf::from("converge.yaml"),
                dry_run: false,
                validate_only: false,
                verbose: false,
                resume_from: None,
                force_continue: false,
                wait_ready: false,
                report: None,
            }
        );
    }

    #[test]
    fn resume_accepts_any_spelling() {
        let args = parse(&["--resume-from", "CONVERGE_DATABASE", "--force-continue"]).unwrap();
        assert_eq!(args.resume_from, Some(StageId::ConvergeDatabase));
        assert!(args.force_continue);
    }

    #[test]
    fn unknown_stage_lists_the_valid_ones() {
        let err = parse(&["--resume-from", "deploy"]).unwrap_err();
        assert!(err.to_string().contains("start-services"));
    }

    #[test]
    fn dry_run_and_validate_only_conflict() {
        assert!(parse(&["--dry-run", "--validate-only"]).is_err());
        let args = parse(&["--dry-run", "-c", "env/local.yaml", "--report", "out/run.json"]).unwrap();
        assert!(args.dry_run);
        assert_eq!(args.config, PathBuf::from("env/local.yaml"));
        assert_eq!(args.report, Some(PathBuf::from("out/run.json")));
    }
}
