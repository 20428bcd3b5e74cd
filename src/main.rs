mod env;
mod filter;
mod framework;
mod host;
mod interpolate;
mod loader;
mod matrix;
mod model;
mod parser;
mod process;
mod report;
mod resolve;
mod runnable;
mod runner;
mod schema;
mod tags;
mod yaml;

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::filter::TestFilter;
use crate::framework::TestFramework;
use crate::host::ConsoleHost;
use crate::loader::FoundConfig;
use crate::model::TestCase;
use crate::parser::TestCaseParser;
use crate::resolve::ExecutableResolver;
use crate::runner::{RunnerOptions, TestCaseRunner};

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Progress and a summary on the console
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "yamltest")]
#[command(about = "Runs YAML-described test cases against command line tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run test cases
    Run {
        /// Test file or directory (defaults to the configured test directory)
        path: Option<PathBuf>,
        /// Filter criteria: `text` must match, `+text` any of, `-text` must not match
        #[arg(short, long, allow_hyphen_values = true)]
        filter: Vec<String>,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Where to write the JUnit XML results file
        #[arg(long)]
        results_file: Option<PathBuf>,
        /// Maximum number of step chains run at once
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Write a debug log to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Log debug output to stderr
        #[arg(short, long)]
        verbose: bool,
    },
    /// List the test cases that would run
    List {
        /// Test file or directory (defaults to the configured test directory)
        path: Option<PathBuf>,
        /// Filter criteria, as for `run`
        #[arg(short, long, allow_hyphen_values = true)]
        filter: Vec<String>,
    },
    /// Parse test files and report errors without running anything
    Validate {
        /// Test file or directory (defaults to the configured test directory)
        path: Option<PathBuf>,
    },
    /// Output the JSON schema of test files
    Schema {
        /// Output the schema of `.yamltest/config` instead
        #[arg(long)]
        config: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            filter,
            output,
            results_file,
            max_parallel,
            log_file,
            verbose,
        } => {
            if let Err(e) = setup_logging(verbose, log_file.as_deref()) {
                eprintln!("Error opening log file: {e}");
                std::process::exit(1);
            }

            let found = load_config();
            let config = found.as_ref().map(|f| f.config.clone()).unwrap_or_default();
            let path = test_path(path, found.as_ref());
            let tests = load_tests(&path, &filter);
            if tests.is_empty() {
                eprintln!("No test cases found at: {}", path.display());
                std::process::exit(1);
            }

            let mut options = RunnerOptions::default();
            if !config.known_clis.is_empty() {
                options.known_clis = config.known_clis.clone();
            }
            if let Some(oracle) = &config.oracle_cli {
                options.oracle_cli = oracle.clone();
            }
            let runner = TestCaseRunner::new(ExecutableResolver::new(), options);

            let max_parallel = max_parallel
                .or(config.max_parallel)
                .unwrap_or_else(framework::default_max_parallel)
                .max(1);
            let results_file = results_file
                .or(config.results_file)
                .unwrap_or_else(|| PathBuf::from(report::DEFAULT_RESULTS_FILE));

            let host = ConsoleHost::new(matches!(output, OutputFormat::Human));
            TestFramework::new(&runner, &host, max_parallel).run_tests(tests);
            let run = host.finish();

            let written = match report::write_junit_file(&run, &results_file) {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("Error writing {}: {e}", results_file.display());
                    false
                }
            };

            match output {
                OutputFormat::Human => {
                    print!(
                        "{}",
                        host::format_summary(&run, written.then_some(results_file.as_path()))
                    );
                }
                OutputFormat::Json => match report::format_json(&run) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Error serializing results: {e}");
                        std::process::exit(1);
                    }
                },
                OutputFormat::Junit => print!("{}", report::format_junit_xml(&run)),
            }

            if run.summary().is_failed() {
                std::process::exit(1);
            }
        }
        Command::List { path, filter } => {
            setup_quiet_logging();
            let found = load_config();
            let path = test_path(path, found.as_ref());
            for test in load_tests(&path, &filter) {
                println!("{}", test.fully_qualified_name);
            }
        }
        Command::Validate { path } => {
            setup_quiet_logging();
            let found = load_config();
            let path = test_path(path, found.as_ref());

            let output = match TestCaseParser::new().parse_directory(&path) {
                Ok(output) => output,
                Err(e) => {
                    eprintln!("Error finding test files: {e}");
                    std::process::exit(1);
                }
            };

            let mut errors = output.errors.len();
            for e in &output.errors {
                eprintln!("✗ {e}");
            }
            for test in output.tests.iter().filter(|t| t.parse_error.is_some()) {
                eprintln!(
                    "✗ {}: {}",
                    test.location(),
                    test.parse_error.as_deref().unwrap_or_default()
                );
                errors += 1;
            }

            if errors > 0 {
                eprintln!("\n{errors} error(s) found");
                std::process::exit(1);
            }
            println!("✓ {} test case(s) valid", output.tests.len());
        }
        Command::Schema { config } => {
            let schema = if config {
                schema::generate_config_schema()
            } else {
                schema::generate_schema()
            };
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing schema: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Warnings to stderr by default, debug with `-v`, and a full debug log
/// when `log_file` is given. `RUST_LOG` overrides the level.
fn setup_logging(verbose: bool, log_file: Option<&Path>) -> std::io::Result<()> {
    let level = if verbose || log_file.is_some() {
        "debug"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            subscriber
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => subscriber.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn setup_quiet_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config() -> Option<FoundConfig> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match loader::find_test_config(&cwd) {
        Ok(found) => found,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            std::process::exit(1);
        }
    }
}

fn test_path(path: Option<PathBuf>, found: Option<&FoundConfig>) -> PathBuf {
    path.unwrap_or_else(|| {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        loader::default_test_directory(&cwd, found)
    })
}

/// Parse and filter the tests under `path`. Files that fail to load are
/// reported and skipped.
fn load_tests(path: &Path, filter: &[String]) -> Vec<TestCase> {
    let output = match TestCaseParser::new().parse_directory(path) {
        Ok(output) => output,
        Err(e) => {
            eprintln!("Error finding test files: {e}");
            std::process::exit(1);
        }
    };
    for e in &output.errors {
        eprintln!("✗ Failed to load: {e}");
    }
    TestFilter::new(filter).apply(output.tests)
}
