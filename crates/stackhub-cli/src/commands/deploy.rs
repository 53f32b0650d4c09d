use super::{print_report, run_lifecycle, Context, RunArgs};
use stackhub_state::Verb;

pub fn run(ctx: &Context, args: &RunArgs) -> Result<u8, String> {
    let options = ctx.run_options(Verb::Deploy, args);
    let report = run_lifecycle(ctx, args, &options)?;
    print_report(&report, ctx.json)
}
