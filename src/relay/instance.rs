// Instance identity: which running process owns a connection.
//
// Presence entries and inbox routing keys are keyed by this value, so it
// must be stable for the life of the process. Resolution order: explicit
// override, system hostname, random UUID.

use uuid::Uuid;

pub fn resolve_instance_id(override_id: Option<&str>) -> String {
    if let Some(id) = override_id {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
