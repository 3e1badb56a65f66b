use upload_relay::{Config, Error, Strategy, serve};

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    serve(config, Strategy::Disk).await
}
