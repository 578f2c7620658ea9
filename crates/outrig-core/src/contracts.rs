//! Shared request/response shapes for the `dataProcessor` and `transformer`
//! capabilities.

use std::{collections::BTreeMap, sync::Arc};

use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::base64_bytes,
    error::WireError,
    registry::ExternalPlugin,
    wire::CallOptions,
};

pub const DATA_PROCESSOR: &str = "dataProcessor";
pub const PROCESS_ENDPOINT: &str = "/process";
pub const FORMATS_ENDPOINT: &str = "/formats";

pub const TRANSFORMER: &str = "transformer";
pub const TRANSFORM_ENDPOINT: &str = "/transform";
pub const TRANSFORMATIONS_ENDPOINT: &str = "/transformations";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProcessorRequest {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub format: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProcessorResponse {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub format: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormatsResponse {
    pub formats: Vec<String>,
}

/// Typed calls against an external plugin that provides `dataProcessor`.
#[derive(Debug, Clone)]
pub struct DataProcessorClient {
    plugin: Arc<ExternalPlugin>,
}

impl DataProcessorClient {
    pub fn new(plugin: Arc<ExternalPlugin>) -> Self {
        Self { plugin }
    }

    pub fn plugin(&self) -> &Arc<ExternalPlugin> {
        &self.plugin
    }

    pub async fn process_data(&self, input: &[u8], format: &str) -> Result<DataProcessorResponse, WireError> {
        let request = DataProcessorRequest {
            data: input.to_vec(),
            format: format.to_string(),
            config: BTreeMap::new(),
        };
        self.plugin
            .call_json(
                PROCESS_ENDPOINT,
                Method::POST,
                CallOptions::new().with_payload(&request)?,
            )
            .await
    }

    pub async fn supported_formats(&self) -> Result<Vec<String>, WireError> {
        let response: FormatsResponse = self
            .plugin
            .call_json(FORMATS_ENDPOINT, Method::GET, CallOptions::new())
            .await?;
        Ok(response.formats)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub transformation: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformResponse {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// One transformation a `transformer` plugin offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformationsResponse {
    pub transformations: Vec<TransformationInfo>,
}

/// Typed calls against an external plugin that provides `transformer`.
#[derive(Debug, Clone)]
pub struct TransformerClient {
    plugin: Arc<ExternalPlugin>,
}

impl TransformerClient {
    pub fn new(plugin: Arc<ExternalPlugin>) -> Self {
        Self { plugin }
    }

    pub fn plugin(&self) -> &Arc<ExternalPlugin> {
        &self.plugin
    }

    pub async fn transform(&self, request: &TransformRequest) -> Result<TransformResponse, WireError> {
        self.plugin
            .call_json(
                TRANSFORM_ENDPOINT,
                Method::POST,
                CallOptions::new().with_payload(request)?,
            )
            .await
    }

    pub async fn transformations(&self) -> Result<Vec<TransformationInfo>, WireError> {
        let response: TransformationsResponse = self
            .plugin
            .call_json(TRANSFORMATIONS_ENDPOINT, Method::GET, CallOptions::new())
            .await?;
        Ok(response.transformations)
    }
}
