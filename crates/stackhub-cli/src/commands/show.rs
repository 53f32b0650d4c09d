use super::{colorize_status, describe, json_pretty, Context, EXIT_SUCCESS};
use stackhub_core::{mask, CoreError};
use stackhub_state::{StateLayout, StateStore};

/// Operations listed in text mode.
const RECENT_OPERATIONS: usize = 5;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let layout = StateLayout::new(&ctx.state_dir);
    let store = StateStore::new(Box::new(layout.storage()), layout.state_key());
    let state = store.load().map_err(|e| describe(&CoreError::from(e)))?;

    let Some(state) = state else {
        if ctx.json {
            println!("null");
        } else {
            println!("no deployment recorded in {}", ctx.state_dir.display());
        }
        return Ok(EXIT_SUCCESS);
    };

    if ctx.json {
        println!("{}", json_pretty(&state)?);
        return Ok(EXIT_SUCCESS);
    }

    let status = state
        .meta
        .status
        .map_or_else(|| "unknown".to_owned(), |s| s.to_string());
    println!("stack:       {}", state.meta.stack_name);
    println!("deployment:  {}", state.meta.deployment_id);
    println!("status:      {}", colorize_status(&status));
    if let Some(message) = &state.meta.message {
        println!("message:     {message}");
    }
    println!("updated:     {}", state.meta.updated_at);

    if !state.lifecycle_order.is_empty() {
        println!();
        println!("{:<24} {:<12} UPDATED", "COMPONENT", "STATUS");
        for name in &state.lifecycle_order {
            match state.step(name) {
                Some(step) => println!(
                    "{name:<24} {:<12} {}",
                    colorize_status(&step.status.to_string()),
                    step.updated_at
                ),
                None => println!("{name:<24} {:<12} -", "pending"),
            }
        }
    }

    if !state.stack_outputs.is_empty() {
        println!();
        println!("outputs:");
        for output in &state.stack_outputs {
            println!("  {} = {}", output.name, mask(&output.name, &output.value));
        }
    }

    let skip = state.operations.len().saturating_sub(RECENT_OPERATIONS);
    if skip < state.operations.len() {
        println!();
        println!("recent operations:");
        for op in &state.operations[skip..] {
            println!(
                "  {} {:<9} {:<12} {}",
                op.timestamp,
                op.verb.to_string(),
                colorize_status(&op.status.to_string()),
                op.id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
