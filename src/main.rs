mod app;

use color_eyre::Result;
use hri::renderer::config::RenderConfig;
use app::App;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let config = RenderConfig::from_env()?;
    let mut app = App::new(config)?;
    app.run()?;

    Ok(())
}
