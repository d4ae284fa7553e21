use clap::Parser;
use training::util::run_eval;
use training::EvalArgs;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = EvalArgs::parse();
    let written = run_eval(args)?;
    log::info!("eval complete: {written} predictions dumped");
    Ok(())
}
