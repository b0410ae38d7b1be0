#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = reloader::config::ReloaderConfig::new(reloader::config::CONFIG_PATHS)?;
    reloader::init_log(config.log_level())?;

    reloader::run(config).await
}
