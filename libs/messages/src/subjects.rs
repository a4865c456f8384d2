//! Bus subject names.

// Consumed
pub const DEA_STATUS: &str = "dea.status";
pub const DEA_DISCOVER: &str = "dea.discover";
pub const DEA_FIND_DROPLET: &str = "dea.find.droplet";
pub const DEA_UPDATE: &str = "dea.update";
pub const DEA_STOP: &str = "dea.stop";
pub const DROPLET_STATUS: &str = "droplet.status";
pub const ROUTER_START: &str = "router.start";
pub const HEALTHMANAGER_START: &str = "healthmanager.start";

// Published
pub const DEA_START: &str = "dea.start";
pub const DEA_HEARTBEAT: &str = "dea.heartbeat";
pub const ROUTER_REGISTER: &str = "router.register";
pub const ROUTER_UNREGISTER: &str = "router.unregister";
pub const DROPLET_EXITED: &str = "droplet.exited";

// Component registration
pub const COMPONENT_DISCOVER: &str = "vcap.component.discover";
pub const COMPONENT_ANNOUNCE: &str = "vcap.component.announce";

/// Subject on which a specific agent receives start requests.
pub fn dea_instance_start(uuid: &str) -> String {
    format!("dea.{uuid}.start")
}
