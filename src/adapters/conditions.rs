//! Status extraction from untyped sink objects

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use crate::crd::Condition;
use crate::Result;

/// What a custom object reports about itself
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DynamicStatus {
    pub conditions: Vec<Condition>,
    pub url: Option<Value>,
}

/// Read `status.conditions` and `status.url` from an untyped object.
///
/// A missing or malformed `status` or `status.conditions` yields an empty
/// result. Conditions that are present but cannot be decoded are an error.
pub fn extract_status(obj: &DynamicObject) -> Result<DynamicStatus> {
    let Some(status) = obj.data.get("status").and_then(Value::as_object) else {
        debug!(name = %obj.name_any(), "custom object has no status yet");
        return Ok(DynamicStatus::default());
    };

    let url = status.get("url").cloned();

    let Some(conditions) = status.get("conditions").filter(|c| c.is_array()) else {
        debug!(name = %obj.name_any(), "custom object status has no conditions");
        return Ok(DynamicStatus {
            conditions: Vec::new(),
            url,
        });
    };

    let conditions: Vec<Condition> = serde_json::from_value(conditions.clone())?;
    Ok(DynamicStatus { conditions, url })
}

/// Hostname part of a status URL: everything after the first `//`, or the
/// whole string when there is no scheme separator
pub fn hostname_from_url(url: &str) -> &str {
    url.split_once("//").map_or(url, |(_, host)| host)
}
