use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use stagec::callgraph::extract_call_graph;
use stagec::config::Options;
use stagec::diag::Diagnostic;
use stagec::pass::{self, PassId};
use stagec::scenarios::{self, Built, Check, Scenario, ScenarioError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Emit {
    /// Extracted call graph, one caller per line
    CallGraph,
    /// Extracted call graph as JSON
    CallGraphJson,
    /// Lowered statement tree
    Ir,
    /// Call graph as Graphviz DOT
    Dot,
    /// Verify call graphs and realized values
    Check,
}

impl Emit {
    fn terminal(self) -> PassId {
        match self {
            Emit::Ir => PassId::Lower,
            Emit::CallGraph | Emit::CallGraphJson | Emit::Dot => PassId::ExtractCalls,
            Emit::Check => PassId::Realize,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "stagec",
    version,
    about = "Stage compiler — runs the bundled wrap pipelines and prints their artifacts"
)]
struct Cli {
    /// List the bundled scenarios and exit
    #[arg(long)]
    list: bool,

    /// Scenario to run (all of them when omitted)
    #[arg(long)]
    scenario: Option<String>,

    /// Artifact to print
    #[arg(long, value_enum, default_value_t = Emit::Check)]
    emit: Emit,

    /// JSON options file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Realize over this extent in every dimension instead of the scenario's own
    #[arg(long)]
    extent: Option<i32>,

    /// Log pass progress (RUST_LOG overrides)
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "stagec=debug" } else { "stagec=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if cli.list {
        for s in scenarios::all() {
            println!("{:<32} {}", s.name, s.summary);
        }
        return ExitCode::SUCCESS;
    }

    // ── Options ──
    let options = match &cli.config {
        Some(path) => match Options::load(path) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("stagec: error: {}", e);
                return ExitCode::from(2);
            }
        },
        None => Options::default(),
    };

    let selected: Vec<&Scenario> = match &cli.scenario {
        Some(name) => match scenarios::find(name) {
            Ok(s) => vec![s],
            Err(e) => {
                eprintln!("stagec: error: {}", e);
                return ExitCode::from(2);
            }
        },
        None => scenarios::all().iter().collect(),
    };

    let passes = pass::required_passes(cli.emit.terminal());
    if cli.verbose {
        let names: Vec<&str> = passes.iter().map(|p| pass::descriptor(*p).name).collect();
        eprintln!("stagec: passes = {}", names.join(", "));
    }

    let mut failed = false;
    for scenario in selected {
        if let Err(e) = run_scenario(&cli, scenario, &options, &passes) {
            report(scenario.name, &e);
            failed = true;
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn report(scenario: &str, error: &ScenarioError) {
    let diagnostic = match error {
        ScenarioError::Pipeline(e) => e.to_diagnostic(),
        ScenarioError::CallGraph { source, .. } => source.to_diagnostic(),
        ScenarioError::Extraction { diagnostics, .. } => {
            for d in diagnostics {
                eprintln!("stagec: {}: {}", scenario, d);
            }
            return;
        }
        other => Diagnostic::new(stagec::diag::DiagLevel::Error, other.to_string()),
    };
    eprintln!("stagec: {}: {}", scenario, diagnostic);
}

fn run_scenario(cli: &Cli, scenario: &Scenario, options: &Options, passes: &[PassId]) -> Result<(), ScenarioError> {
    let built = scenario.build(options)?;
    let extents = match cli.extent {
        Some(n) => [n, n],
        None => scenario.extents,
    };

    if cli.emit == Emit::Check {
        for check in &built.checks {
            let outcome = built.run_check(check, &extents)?;
            for d in &outcome.diagnostics {
                eprintln!("stagec: {}: {}", scenario.name, d);
            }
        }
        println!("ok   {} ({} checks)", scenario.name, built.checks.len());
        return Ok(());
    }

    for check in &built.checks {
        emit_check(cli.emit, scenario, &built, check, passes)?;
    }
    Ok(())
}

fn emit_check(emit: Emit, scenario: &Scenario, built: &Built, check: &Check, passes: &[PassId]) -> Result<(), ScenarioError> {
    let module = built.pipeline.compile(&check.output)?;
    println!("// {} / {}", scenario.name, check.output.name());
    if !passes.contains(&PassId::ExtractCalls) {
        print!("{}", module.body);
        return Ok(());
    }

    let result = extract_call_graph(&module.body, &built.pipeline.stage_meta());
    for d in &result.diagnostics {
        eprintln!("stagec: {}: {}", scenario.name, d);
    }
    match emit {
        Emit::CallGraphJson => match result.graph.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("stagec: error: {}", e),
        },
        Emit::Dot => {
            let wrappers: BTreeSet<String> = built
                .pipeline
                .registry()
                .entries()
                .into_iter()
                .map(|(_, _, wrapper)| wrapper.to_string())
                .collect();
            print!("{}", stagec::dot::emit_dot(&result.graph, &wrappers));
        }
        _ => print!("{}", result.graph),
    }
    Ok(())
}
