pub mod backup;
pub mod deploy;
pub mod order;
pub mod show;
pub mod undeploy;

use crate::config::CliConfig;
use crate::prompt::TerminalPrompter;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use stackhub_core::{
    mask, CancellationToken, CoreError, Engine, NoPrompt, RunOptions, RunReport, Selection,
};
use stackhub_runtime::select_delegate;
use stackhub_schema::parse_manifest_file;
use stackhub_state::{StackStatus, Verb};
use std::io::{stdin, IsTerminal};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STATE_ERROR: u8 = 3;
pub const EXIT_INCOMPLETE: u8 = 4;

/// Arguments shared by every lifecycle verb.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to the stack manifest.
    #[arg(default_value = "stack.toml")]
    pub manifest: PathBuf,
    /// First component to run (inclusive).
    #[arg(long)]
    pub offset: Option<String>,
    /// Last component to run (inclusive).
    #[arg(long)]
    pub limit: Option<String>,
    /// Run only these components, in lifecycle order.
    #[arg(short, long, value_delimiter = ',')]
    pub components: Vec<String>,
    /// Continue past failures of mandatory components.
    #[arg(long, default_value_t = false)]
    pub force: bool,
    /// Go through the motions without invoking delegates or saving state.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Tune a requirement to optional: `capability` or `component:capability`.
    #[arg(long = "optional-requires")]
    pub optional_requires: Vec<String>,
    /// Fail instead of prompting for missing user parameters.
    #[arg(long, default_value_t = false)]
    pub no_prompt: bool,
    /// Delegate that runs the component implementations.
    #[arg(long)]
    pub delegate: Option<String>,
}

/// Settings resolved once in `main` and handed to each command.
pub struct Context {
    pub state_dir: PathBuf,
    pub json: bool,
    pub config: CliConfig,
    pub token: CancellationToken,
}

impl Context {
    pub fn run_options(&self, verb: Verb, args: &RunArgs) -> RunOptions {
        let mut options = RunOptions::new(verb);
        options.selection = Selection {
            offset: args.offset.clone(),
            limit: args.limit.clone(),
            components: args.components.clone(),
        };
        options.force = args.force;
        options.dry_run = args.dry_run;
        if let Some(secs) = self.config.ready_interval_secs {
            options.ready_interval = Duration::from_secs(secs);
        }
        options.default_ready_wait = self.config.ready_wait_secs.map(Duration::from_secs);
        options.optional_requires = self
            .config
            .optional_requires
            .iter()
            .chain(&args.optional_requires)
            .cloned()
            .collect();
        options
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "deployed" | "success" => Style::new().green().apply_to(status).to_string(),
        "deploying" | "undeploying" | "backuping" | "in-progress" => {
            Style::new().cyan().bold().apply_to(status).to_string()
        }
        "incomplete" | "skipped" => Style::new().yellow().apply_to(status).to_string(),
        "error" | "cancelled" => Style::new().red().apply_to(status).to_string(),
        "undeployed" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Render an engine error so that `main` can map it to an exit code.
pub fn describe(err: &CoreError) -> String {
    let msg = err.to_string();
    if err.is_manifest_error() && !msg.starts_with("manifest error:") {
        format!("manifest error: {msg}")
    } else if err.is_state_error() && !msg.starts_with("state error:") {
        format!("state error: {msg}")
    } else {
        msg
    }
}

/// Parse the manifest, build an engine for it and run one lifecycle verb.
pub fn run_lifecycle(
    ctx: &Context,
    args: &RunArgs,
    options: &RunOptions,
) -> Result<RunReport, String> {
    let manifest =
        parse_manifest_file(&args.manifest).map_err(|e| describe(&CoreError::from(e)))?;
    let manifest_dir = args
        .manifest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let delegate_name = args
        .delegate
        .as_deref()
        .or(ctx.config.delegate.as_deref())
        .unwrap_or(&manifest.lifecycle.delegate)
        .to_owned();
    let delegate = select_delegate(&delegate_name).map_err(|e| e.to_string())?;
    debug!("using delegate {delegate_name}");

    let verb = options.verb;
    let pb = (!ctx.json).then(|| spinner(&format!("{verb} {}...", manifest.stack_name())));
    let interactive = !args.no_prompt && !ctx.json && stdin().is_terminal();

    let mut engine = Engine::new(&ctx.state_dir, delegate).with_cancellation(ctx.token.clone());
    if interactive {
        engine = engine.with_prompter(Box::new(TerminalPrompter::new(pb.clone())));
    } else {
        engine = engine.with_prompter(Box::new(NoPrompt));
    }

    match engine.run(manifest, &manifest_dir, options) {
        Ok(report) => {
            if let Some(pb) = &pb {
                let summary = format!("{verb} finished: stack is {}", report.stack_status);
                if report.failed.is_empty() {
                    spin_ok(pb, &summary);
                } else {
                    spin_fail(pb, &summary);
                }
            }
            Ok(report)
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("{verb} failed"));
            }
            Err(describe(&e))
        }
    }
}

/// Print a run report and pick the exit code for it.
pub fn print_report(report: &RunReport, json: bool) -> Result<u8, String> {
    if json {
        println!("{}", json_pretty(report)?);
    } else {
        println!("operation:  {}", report.operation_id);
        println!(
            "status:     {}",
            colorize_status(&report.stack_status.to_string())
        );
        if let Some(message) = &report.message {
            println!("message:    {message}");
        }
        print_list("completed", &report.completed);
        print_list("skipped", &report.skipped);
        print_list("failed", &report.failed);
        if let Some(bundle) = &report.bundle {
            println!("bundle:     {bundle}");
        }
        if !report.outputs.is_empty() {
            println!("outputs:");
            for output in &report.outputs {
                println!("  {} = {}", output.key(), mask(&output.name, &output.value));
            }
        }
    }

    let incomplete = match report.verb {
        Verb::Backup => !report.failed.is_empty(),
        Verb::Deploy | Verb::Undeploy => report.stack_status == StackStatus::Incomplete,
    };
    Ok(if incomplete {
        EXIT_INCOMPLETE
    } else {
        EXIT_SUCCESS
    })
}

fn print_list(label: &str, names: &[String]) {
    if !names.is_empty() {
        println!("{:<11} {}", format!("{label}:"), names.join(", "));
    }
}
