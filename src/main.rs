//! fleet - run deployment plans against fleets of nodes
//!
//! `fleet deploy plan.toml --node web01 --node 10.0.0.7` connects to every
//! node, then runs the plan on all of them at once. `fleet run plan.toml`
//! runs it against this machine.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetsync::cli::{Command, DeployCli, ExitCode};
use fleetsync::config::DeployConfig;
use fleetsync::discovery::ChainResolver;
use fleetsync::log::OperationJournal;
use fleetsync::logger::open_logger;
use fleetsync::node::Node;
use fleetsync::orchestrator::Orchestrator;
use fleetsync::plan::{parse_args, run_plan, NodeRun, Plan, PlanError};
use fleetsync::tracker::{AggregatingTracker, ConsoleTracker, JournalingTracker, Tracker};

fn main() {
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    }) {
        eprintln!("warning: cannot install Ctrl-C handler: {e}");
    }

    let cli = match DeployCli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::BadArguments
            } else {
                ExitCode::Success
            };
            let _ = e.print();
            std::process::exit(code.code());
        }
    };

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::Unhandled
        }
    };
    std::process::exit(code.code());
}

fn load_config(cli: &DeployCli) -> Result<DeployConfig> {
    let mut cfg = DeployConfig::load(cli.config.as_deref())?;
    if cli.identity.is_some() {
        cfg.identity = cli.identity.clone();
    }
    if cli.tls {
        cfg.tls = true;
    }
    if cli.journal.is_some() {
        cfg.journal = cli.journal.clone();
    }
    if cli.log_file.is_some() {
        cfg.log_file = cli.log_file.clone();
    }
    Ok(cfg)
}

fn load_plan(path: &Path, args: &[String]) -> Result<Plan, ExitCode> {
    let args = parse_args(args).map_err(|e| {
        eprintln!("error: {e:#}");
        ExitCode::BadArguments
    })?;
    Plan::load(path, &args).map_err(|e| {
        eprintln!("error: {e:#}");
        match e.downcast_ref::<PlanError>() {
            Some(PlanError::Access { .. }) => ExitCode::ScriptAccess,
            _ => ExitCode::ScriptCompile,
        }
    })
}

fn run(cli: DeployCli) -> Result<ExitCode> {
    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e:#}");
            return Ok(ExitCode::BadArguments);
        }
    };

    let (plan_path, plan_args, timeout) = match &cli.command {
        Command::Deploy {
            plan,
            args,
            timeout,
            ..
        }
        | Command::Run {
            plan,
            args,
            timeout,
        } => (plan, args, timeout.map(Duration::from_secs)),
    };
    let plan = match load_plan(plan_path, plan_args) {
        Ok(plan) => plan,
        Err(code) => return Ok(code),
    };

    let logger = open_logger(cfg.log_file.as_deref())?;
    let aggregate = Arc::new(AggregatingTracker::new());
    let mut tracker: Arc<dyn Tracker> = if cli.headless {
        aggregate.clone()
    } else {
        Arc::new(ConsoleTracker::stdout(cli.verbose))
    };
    if let Some(path) = &cfg.journal {
        let journal = OperationJournal::new(path);
        if cli.verbose {
            println!("Journal run id: {}", journal.run_id());
        }
        tracker = Arc::new(JournalingTracker::new(tracker, journal));
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let resolver = Arc::new(ChainResolver::from_config(&cfg));
    let orchestrator = Orchestrator::new(cfg, tracker, resolver, logger)?;
    let start = Instant::now();

    let (runs, unreachable) = rt.block_on(async {
        match &cli.command {
            Command::Deploy { nodes, .. } => {
                let attempts =
                    futures::future::join_all(nodes.iter().map(|n| orchestrator.connect_target(n)))
                        .await;
                let mut connected: Vec<Arc<dyn Node>> = Vec::new();
                let mut unreachable = Vec::new();
                for (target, attempt) in nodes.iter().zip(attempts) {
                    match attempt {
                        Ok(node) => connected.push(node),
                        Err(e) => unreachable.push((target.clone(), e)),
                    }
                }
                (run_plan(&plan, connected, timeout).await, unreachable)
            }
            Command::Run { .. } => {
                let local: Arc<dyn Node> = Arc::new(orchestrator.local());
                (run_plan(&plan, vec![local], timeout).await, Vec::new())
            }
        }
    });
    orchestrator.dispose();

    Ok(report(&cli, &aggregate, &runs, &unreachable, start.elapsed()))
}

fn report(
    cli: &DeployCli,
    aggregate: &AggregatingTracker,
    runs: &[NodeRun],
    unreachable: &[(String, anyhow::Error)],
    elapsed: Duration,
) -> ExitCode {
    let failed: Vec<&NodeRun> = runs.iter().filter(|r| r.result.is_err()).collect();

    if cli.headless {
        if let Err(e) = aggregate.throw_on_any_failure() {
            eprintln!("{e}");
        }
    }
    for (target, e) in unreachable {
        if cli.verbose {
            eprintln!("{target}: unreachable: {e:#}");
        } else {
            eprintln!("{target}: unreachable: {e}");
        }
    }
    for run in &failed {
        if let Err(e) = &run.result {
            if cli.verbose {
                eprintln!("{}: {e:#}", run.node);
            } else {
                eprintln!("{}: {e}", run.node);
            }
        }
    }

    let total = runs.len() + unreachable.len();
    println!(
        "{} of {} node(s) succeeded in {:.2?}",
        runs.len() - failed.len(),
        total,
        elapsed
    );

    if !failed.is_empty() {
        ExitCode::ScriptRuntime
    } else if !unreachable.is_empty() {
        ExitCode::Connection
    } else {
        ExitCode::Success
    }
}
