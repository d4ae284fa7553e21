use clap::Parser;
use training::util::run_train;
use training::TrainArgs;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = TrainArgs::parse();
    run_train(args)
}
