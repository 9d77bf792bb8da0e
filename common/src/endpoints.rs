pub const PATH_TELEMETRY: &str = "/api/data";
pub const PATH_RELAY_STATE: &str = "/api/relay/state";

pub const CONTENT_TYPE_JSON: &str = "application/json";
