pub const TOPIC_CONTROLLER_STATE: &str = "aeroponic/controller/state";
pub const TOPIC_CONTROLLER_AVAILABILITY: &str = "aeroponic/controller/availability";

pub const TOPIC_CMD_LIGHT_THRESHOLD: &str = "aeroponic/cmnd/light_threshold";
pub const TOPIC_CMD_PH_TARGET: &str = "aeroponic/cmnd/ph_target";

/// Setpoint key carried by a command topic, as named in `/control` bodies.
pub fn command_key(topic: &str) -> Option<&'static str> {
    match topic {
        TOPIC_CMD_LIGHT_THRESHOLD => Some("lightThreshold"),
        TOPIC_CMD_PH_TARGET => Some("pHTarget"),
        _ => None,
    }
}
