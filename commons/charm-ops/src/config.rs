use envconfig::Envconfig;

use crate::event::{EventError, HookEvent};

/// Process environment Juju sets up for a dispatched hook.
#[derive(Envconfig, Clone, Debug)]
pub struct DispatchEnv {
    #[envconfig(from = "JUJU_DISPATCH_PATH")]
    pub dispatch_path: String,

    /// `<app>/<unit-number>`
    #[envconfig(from = "JUJU_UNIT_NAME")]
    pub unit_name: String,

    #[envconfig(from = "JUJU_MODEL_NAME")]
    pub model_name: String,

    #[envconfig(from = "JUJU_MODEL_UUID")]
    pub model_uuid: String,

    #[envconfig(from = "JUJU_RELATION_ID")]
    pub relation_id: Option<String>,

    #[envconfig(from = "JUJU_WORKLOAD_NAME")]
    pub workload_name: Option<String>,

    /// Directory holding one `<container>/pebble.socket` per workload.
    #[envconfig(from = "CHARM_PEBBLE_SOCKET_DIR", default = "/charm/containers")]
    pub pebble_socket_dir: String,

    /// Where the hook tools live; resolved through `PATH` when unset.
    #[envconfig(from = "CHARM_HOOK_TOOLS_DIR")]
    pub hook_tools_dir: Option<String>,
}

impl DispatchEnv {
    pub fn app_name(&self) -> &str {
        self.unit_name
            .split_once('/')
            .map(|(app, _)| app)
            .unwrap_or(&self.unit_name)
    }

    pub fn event(&self) -> Result<HookEvent, EventError> {
        HookEvent::from_dispatch_path(
            &self.dispatch_path,
            self.relation_id.as_deref(),
        )
    }
}
