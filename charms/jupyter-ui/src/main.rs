use charm_ops::{init_tracing, runtime};
use jupyter_ui::JupyterUi;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");
    runtime::install_crypto_provider();
    runtime::dispatch(JupyterUi).await
}
