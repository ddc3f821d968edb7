use std::path::PathBuf;
use std::sync::Arc;

use charm_k8s::KubeCluster;
use charm_pebble::PebbleClient;
use envconfig::Envconfig;
use kube::Client;
use tracing::{debug, info};

use crate::backend::HookTools;
use crate::config::DispatchEnv;
use crate::event::HookEvent;
use crate::reconcile::{Reconciler, Workload};

/// Make rustls use the aws-lc-rs provider. Safe to call more than once.
pub fn install_crypto_provider() {
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        debug!(?e, "CryptoProvider already installed or incompatible; proceeding");
    }
}

/// Handle the hook Juju dispatched to this process.
pub async fn dispatch<W: Workload>(workload: W) -> anyhow::Result<()> {
    let env = DispatchEnv::init_from_env()?;
    dispatch_env(workload, env).await
}

/// [`dispatch`] with an already loaded environment. Hooks the charm does not
/// react to return before any client is built.
pub async fn dispatch_env<W: Workload>(workload: W, env: DispatchEnv) -> anyhow::Result<()> {
    let event = env.event()?;
    if let HookEvent::Other(hook) = &event {
        debug!(%hook, unit = %env.unit_name, "hook not handled; ignoring");
        return Ok(());
    }
    info!(%event, unit = %env.unit_name, model = %env.model_name, "dispatching hook");

    let client = Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client, env.model_name.clone()));
    let backend = Arc::new(HookTools::new(env.hook_tools_dir.as_ref().map(PathBuf::from)));
    let container = env
        .workload_name
        .clone()
        .unwrap_or_else(|| workload.container().to_string());
    let pebble = Arc::new(PebbleClient::for_container(&env.pebble_socket_dir, &container));

    let reconciler = Reconciler::new(
        workload,
        env.app_name(),
        env.model_name.as_str(),
        env.model_uuid.as_str(),
        backend,
        pebble,
        cluster,
    );
    match reconciler.handle(&event).await? {
        Some(state) => info!(?state, "hook complete"),
        None => info!("hook ignored"),
    }
    Ok(())
}
