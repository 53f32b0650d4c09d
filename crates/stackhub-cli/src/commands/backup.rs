use super::{print_report, run_lifecycle, Context, RunArgs};
use stackhub_state::{StateLayout, Verb};

/// Back up every deployed component into one bundle. `bundle` names the
/// bundle file under the state directory's `backups/`.
pub fn run(ctx: &Context, args: &RunArgs, bundle: Option<&str>) -> Result<u8, String> {
    let mut options = ctx.run_options(Verb::Backup, args);
    if let Some(name) = bundle {
        let name = name.strip_suffix(".json").unwrap_or(name);
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(format!("invalid bundle name '{name}'"));
        }
        options.bundle_key = Some(StateLayout::new(&ctx.state_dir).bundle_key(name));
    }
    let report = run_lifecycle(ctx, args, &options)?;
    print_report(&report, ctx.json)
}
