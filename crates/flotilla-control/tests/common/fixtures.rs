//! Blueprint documents for integration tests.

use serde_json::{json, Value};

/// A server hosting a web application, with an `install` workflow and an
/// endpoint output read from the server's runtime properties.
pub fn web_app() -> Value {
    json!({
        "inputs": {
            "port": {"description": "Port the application listens on"},
            "image": {"default": "ubuntu-22.04"}
        },
        "nodes": [
            {
                "id": "server",
                "type": "flotilla.nodes.Compute",
                "type_hierarchy": ["flotilla.nodes.Root", "flotilla.nodes.Compute"],
                "properties": {"image": {"get_input": "image"}}
            },
            {
                "id": "app",
                "type": "flotilla.nodes.WebServer",
                "host_id": "server",
                "properties": {"port": {"get_input": "port"}},
                "relationships": [
                    {"target_id": "server", "type": "flotilla.relationships.contained_in"}
                ]
            }
        ],
        "workflows": {
            "install": {
                "operation": "flotilla.workflows.install",
                "parameters": {
                    "retries": {"default": 3},
                    "node_ids": {"default": []}
                }
            },
            "scale": {
                "operation": "flotilla.workflows.scale",
                "parameters": {
                    "node_id": {},
                    "delta": {"default": 1}
                }
            }
        },
        "outputs": {
            "endpoint": {
                "description": "Public address of the application",
                "value": {
                    "ip": {"get_attribute": ["server", "ip"]},
                    "port": {"get_input": "port"}
                }
            }
        },
        "groups": {
            "web": {"members": ["server", "app"]}
        },
        "deployment_plugins_to_install": [
            {"name": "flotilla-compute", "version": "1.2"}
        ]
    })
}
