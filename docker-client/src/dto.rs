//! Wire types of the Docker Engine API subset the sensor consumes.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DockerInfo {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "ServerVersion", default)]
    pub server_version: String,
    #[serde(rename = "OperatingSystem", default)]
    pub operating_system: String,
    #[serde(rename = "Containers", default)]
    pub containers: u64,
}

/// Response of `GET /containers/<id>/json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Image content hash, e.g. `sha256:...`.
    #[serde(rename = "Image", default)]
    pub image_id: String,
    #[serde(rename = "State")]
    pub state: ContainerState,
    #[serde(rename = "Config")]
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Pid", default)]
    pub pid: i32,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Status", default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    /// Image name as given at `docker run`.
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

/// One entry of the `GET /events` ndjson stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    #[serde(rename = "time", default)]
    pub time: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inspect_response() {
        let json = r#"{
            "Id": "e871ee9a818bab3222c94efe196e8555cb372676e96fea847a609c2d39e187a4",
            "Name": "/eloquent_moser",
            "Image": "sha256:2b8fd9751c4c0f5dd266fcae00707e67a2545ef34f9a29354585f93dac906749",
            "State": {"Pid": 7516, "Running": true, "Status": "running"},
            "Config": {
                "Image": "alpine:3.6",
                "Hostname": "e871ee9a818b",
                "Labels": {"com.example.team": "sensors"}
            }
        }"#;
        let info: ContainerInfo = serde_json::from_str(json).unwrap();
        assert!(info.id.starts_with("e871ee9a"));
        assert_eq!(info.state.pid, 7516);
        assert!(info.state.running);
        assert_eq!(info.config.image, "alpine:3.6");
        assert_eq!(info.config.labels["com.example.team"], "sensors");
    }

    #[test]
    fn parses_event_line() {
        let json = r#"{
            "Type": "container",
            "Action": "start",
            "Actor": {
                "ID": "47490dda5cd7e409e7bf04a8b291f87f15031090a955dac9ceed6a2160474d81",
                "Attributes": {"image": "alpine:3.6", "name": "eloquent_moser"}
            },
            "time": 1512345678,
            "timeNano": 1512345678000000000
        }"#;
        let event: ContainerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "container");
        assert_eq!(event.action, "start");
        assert!(event.actor.id.starts_with("47490dda"));
        assert_eq!(event.actor.attributes["name"], "eloquent_moser");
    }

    #[test]
    fn missing_optional_fields_default() {
        let event: ContainerEvent = serde_json::from_str(r#"{"Type":"network"}"#).unwrap();
        assert_eq!(event.kind, "network");
        assert!(event.actor.id.is_empty());
        assert_eq!(event.time, 0);
    }
}
